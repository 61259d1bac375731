//! Enroll / verify / identify over a reference store.
//!
//! Synchronous and transport-agnostic. The daemon runs one instance on its
//! engine thread; the CLI calls it directly.

use crate::codec;
use crate::config::Config;
use crate::error::FaceError;
use crate::extractor::{build_extractor, FeatureExtractor};
use crate::matcher::{Matcher, RankedCandidate};
use crate::store::{self, ReferenceStore, StagedReference};
use crate::types::{Embedding, GalleryEntry, MatchDecision};
use std::path::PathBuf;

/// A committed enrollment.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub key: String,
    pub stored_path: PathBuf,
}

/// Enrollment and matching workflow bound to one store and one extractor.
pub struct FaceService {
    store: ReferenceStore,
    extractor: Box<dyn FeatureExtractor>,
    matcher: Matcher,
}

impl FaceService {
    pub fn new(store: ReferenceStore, extractor: Box<dyn FeatureExtractor>, matcher: Matcher) -> Self {
        Self { store, extractor, matcher }
    }

    /// Build the store, extractor and matcher described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, FaceError> {
        let extractor = build_extractor(config)?;
        tracing::info!(
            store = %config.store_dir.display(),
            metric = %config.metric,
            policy = %config.policy,
            threshold = config.threshold,
            min_confidence = config.min_confidence,
            "face service configured"
        );
        Ok(Self::new(ReferenceStore::new(&config.store_dir), extractor, config.matcher()))
    }

    pub fn store(&self) -> &ReferenceStore {
        &self.store
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn descriptor(&self) -> &str {
        self.extractor.descriptor()
    }

    /// Store `encoded_image` as the reference for `key`.
    ///
    /// The face check runs on the JPEG exactly as it will be stored. If it
    /// fails, nothing becomes visible and any earlier reference for `key`
    /// is left in place.
    pub fn enroll(&mut self, key: &str, encoded_image: &str) -> Result<Enrollment, FaceError> {
        let staged = self.stage_enrollment(key, encoded_image)?;
        self.commit_enrollment(staged)
    }

    /// First half of [`enroll`](Self::enroll): a face-checked reference that
    /// is not yet visible. Dropping it discards the enrollment.
    pub fn stage_enrollment(&mut self, key: &str, encoded_image: &str) -> Result<StagedReference, FaceError> {
        store::validate_key(key)?;
        let image = codec::decode(encoded_image)?;

        let staged = self.store.stage(key, &image)?;
        let stored = staged.load()?;
        if let Err(e) = self.extractor.extract(&stored) {
            tracing::info!(key, error = %e, "enrollment rejected");
            return Err(e);
        }
        Ok(staged)
    }

    /// Make a staged enrollment visible, replacing any previous reference.
    pub fn commit_enrollment(&self, staged: StagedReference) -> Result<Enrollment, FaceError> {
        let key = staged.key().to_string();
        let stored_path = staged.commit()?;
        tracing::info!(key = %key, path = %stored_path.display(), "resident enrolled");
        Ok(Enrollment { key, stored_path })
    }

    /// Compare `encoded_image` against the single reference enrolled as `key`.
    ///
    /// An unknown `key` is [`FaceError::IdentityNotFound`], never a rejected decision.
    pub fn verify(&mut self, key: &str, encoded_image: &str) -> Result<MatchDecision, FaceError> {
        store::validate_key(key)?;
        let image = codec::decode(encoded_image)?;
        let reference = self
            .store
            .get(key)?
            .ok_or_else(|| FaceError::IdentityNotFound(key.to_string()))?;

        let probe = self.extractor.extract(&image)?;
        let enrolled = self.extract_reference(key, &reference)?;
        let decision = self.matcher.verify(&probe, &enrolled, key)?;

        tracing::info!(
            key,
            accepted = decision.accepted,
            distance = ?decision.distance,
            confidence = decision.confidence,
            "verify"
        );
        Ok(decision)
    }

    /// Best match for `encoded_image` across every enrolled resident.
    ///
    /// An empty store is a plain "not found", not an error.
    pub fn identify(&mut self, encoded_image: &str) -> Result<MatchDecision, FaceError> {
        let image = codec::decode(encoded_image)?;
        if self.store.is_empty()? {
            tracing::info!("identify: no residents enrolled");
            return Ok(MatchDecision::no_candidates());
        }

        let probe = self.extractor.extract(&image)?;
        let gallery = self.gallery()?;
        let decision = self.matcher.compare(&probe, &gallery);

        tracing::info!(
            candidates = gallery.len(),
            accepted = decision.accepted,
            resident = ?decision.candidate,
            distance = ?decision.distance,
            confidence = decision.confidence,
            "identify"
        );
        Ok(decision)
    }

    /// Every enrolled resident ranked by distance to `encoded_image`, nearest first.
    pub fn search(&mut self, encoded_image: &str) -> Result<Vec<RankedCandidate>, FaceError> {
        let image = codec::decode(encoded_image)?;
        if self.store.is_empty()? {
            return Ok(Vec::new());
        }
        let probe = self.extractor.extract(&image)?;
        let gallery = self.gallery()?;
        Ok(self.matcher.rank(&probe, &gallery))
    }

    /// Delete the reference for `key`. Returns whether one existed.
    pub fn remove(&mut self, key: &str) -> Result<bool, FaceError> {
        let removed = self.store.remove(key)?;
        tracing::info!(key, removed, "remove");
        Ok(removed)
    }

    /// Enrolled resident ids, sorted.
    pub fn residents(&self) -> Result<Vec<String>, FaceError> {
        Ok(self.store.list()?.into_iter().map(|(key, _)| key).collect())
    }

    /// Embeddings for every stored reference. References that cannot be read
    /// or embedded are skipped so one bad file cannot block identification.
    fn gallery(&mut self) -> Result<Vec<GalleryEntry>, FaceError> {
        let mut gallery = Vec::new();
        for (key, path) in self.store.list()? {
            let image = match store::read_reference(&path) {
                Ok(Some(image)) => image,
                // Removed since listing.
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable reference");
                    continue;
                }
            };
            match self.extractor.extract(&image) {
                Ok(embedding) => gallery.push(GalleryEntry { key, embedding }),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping reference without usable face"),
            }
        }
        Ok(gallery)
    }

    fn extract_reference(&mut self, key: &str, image: &image::DynamicImage) -> Result<Embedding, FaceError> {
        self.extractor.extract(image).map_err(|e| match e {
            FaceError::NoFaceDetected => FaceError::ExtractionBackend(format!(
                "stored reference for {key} has no detectable face"
            )),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{SimulatedExtractor, StubExtractor};
    use crate::matcher::{ConfidenceThreshold, DistanceThreshold};
    use crate::types::DistanceMetric;
    use image::{DynamicImage, Rgb, RgbImage};
    use tempfile::{tempdir, TempDir};

    fn encode(img: &DynamicImage) -> String {
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png).unwrap();
        codec::to_data_uri(png.get_ref(), "image/png")
    }

    /// "Face" A: left-to-right gradient.
    fn face_a() -> String {
        encode(&DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, _| {
            let v = (x * 4) as u8;
            Rgb([v, v, v])
        })))
    }

    /// "Face" B: top-to-bottom gradient.
    fn face_b() -> String {
        encode(&DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |_, y| {
            let v = (y * 4) as u8;
            Rgb([v, v, v])
        })))
    }

    /// A flat image: decodes fine, but the stub finds no face in it.
    fn blank() -> String {
        encode(&DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([90, 90, 90]))))
    }

    fn service(dir: &TempDir) -> FaceService {
        FaceService::new(
            ReferenceStore::new(dir.path().join("faces")),
            Box::new(StubExtractor),
            Matcher::new(DistanceMetric::Euclidean, Box::new(DistanceThreshold { threshold: 0.8 })),
        )
    }

    fn stored_files(svc: &FaceService) -> Vec<String> {
        match std::fs::read_dir(svc.store().root()) {
            Ok(entries) => {
                let mut v: Vec<String> = entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect();
                v.sort();
                v
            }
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn test_enroll_then_identify_scenario() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);

        let enrolled = svc.enroll("r1", &face_a()).unwrap();
        assert!(enrolled.stored_path.ends_with("r1.jpg"));
        assert_eq!(svc.residents().unwrap(), ["r1"]);

        let found = svc.identify(&face_a()).unwrap();
        assert!(found.accepted);
        assert_eq!(found.candidate.as_deref(), Some("r1"));
        assert!(found.distance.unwrap() < 0.05);
        assert!(found.confidence > 0.9);

        let other = svc.identify(&face_b()).unwrap();
        assert!(!other.accepted);
        assert_eq!(other.candidate, None);
    }

    #[test]
    fn test_self_match_verifies() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();

        let d = svc.verify("r1", &face_a()).unwrap();
        assert!(d.accepted);
        assert!(d.distance.unwrap() <= 0.8);
        assert_eq!(d.candidate.as_deref(), Some("r1"));
    }

    #[test]
    fn test_verify_wrong_face_rejected() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();

        let d = svc.verify("r1", &face_b()).unwrap();
        assert!(!d.accepted);
        assert!(d.distance.unwrap() > 0.8);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_verify_unknown_identity_is_distinct() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();

        let err = svc.verify("r2", &face_a()).unwrap_err();
        assert!(matches!(err, FaceError::IdentityNotFound(ref k) if k == "r2"));
    }

    #[test]
    fn test_identify_empty_store_is_not_found() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        for input in [face_a(), face_b(), blank()] {
            let d = svc.identify(&input).unwrap();
            assert_eq!(d, MatchDecision::no_candidates());
        }
    }

    #[test]
    fn test_reenroll_keeps_single_reference() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();
        svc.enroll("r1", &face_b()).unwrap();

        assert_eq!(stored_files(&svc), ["r1.jpg"]);
        assert_eq!(svc.residents().unwrap(), ["r1"]);
        // Last write wins.
        assert!(svc.verify("r1", &face_b()).unwrap().accepted);
        assert!(!svc.verify("r1", &face_a()).unwrap().accepted);
    }

    #[test]
    fn test_dropped_staged_enrollment_is_discarded() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();

        let staged = svc.stage_enrollment("r1", &face_b()).unwrap();
        drop(staged);
        assert_eq!(stored_files(&svc), ["r1.jpg"]);
        assert!(svc.verify("r1", &face_a()).unwrap().accepted);

        let staged = svc.stage_enrollment("r2", &face_b()).unwrap();
        let enrolled = svc.commit_enrollment(staged).unwrap();
        assert_eq!(enrolled.key, "r2");
        assert_eq!(svc.residents().unwrap(), ["r1", "r2"]);
    }

    #[test]
    fn test_enroll_without_face_rolls_back() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);

        let err = svc.enroll("r1", &blank()).unwrap_err();
        assert!(matches!(err, FaceError::NoFaceDetected));
        assert!(stored_files(&svc).is_empty());
    }

    #[test]
    fn test_failed_reenroll_keeps_previous_reference() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();

        assert!(svc.enroll("r1", &blank()).is_err());
        assert_eq!(stored_files(&svc), ["r1.jpg"]);
        assert!(svc.verify("r1", &face_a()).unwrap().accepted);
    }

    #[test]
    fn test_malformed_input_leaves_store_unchanged() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();
        let before = stored_files(&svc);

        let bad = "data:image/jpeg;base64,%%%";
        assert!(matches!(svc.enroll("r2", bad), Err(FaceError::InvalidImage(_))));
        assert!(matches!(svc.verify("r1", bad), Err(FaceError::InvalidImage(_))));
        assert!(matches!(svc.identify(bad), Err(FaceError::InvalidImage(_))));
        assert_eq!(stored_files(&svc), before);
    }

    #[test]
    fn test_invalid_key_rejected() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        assert!(matches!(svc.enroll("../r1", &face_a()), Err(FaceError::InvalidIdentity(_))));
        assert!(matches!(svc.verify("", &face_a()), Err(FaceError::InvalidIdentity(_))));
    }

    #[test]
    fn test_identify_picks_nearest_and_ranks() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("a", &face_a()).unwrap();
        svc.enroll("b", &face_b()).unwrap();

        let d = svc.identify(&face_b()).unwrap();
        assert_eq!(d.candidate.as_deref(), Some("b"));

        let ranked = svc.search(&face_a()).unwrap();
        let keys: Vec<&str> = ranked.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn test_identify_skips_corrupt_reference() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();
        std::fs::write(svc.store().root().join("broken.jpg"), b"garbage").unwrap();

        let d = svc.identify(&face_a()).unwrap();
        assert_eq!(d.candidate.as_deref(), Some("r1"));
    }

    #[test]
    fn test_identify_probe_without_face() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();
        assert!(matches!(svc.identify(&blank()), Err(FaceError::NoFaceDetected)));
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let mut svc = service(&dir);
        svc.enroll("r1", &face_a()).unwrap();
        assert!(svc.remove("r1").unwrap());
        assert!(!svc.remove("r1").unwrap());
        assert!(matches!(svc.verify("r1", &face_a()), Err(FaceError::IdentityNotFound(_))));
    }

    #[test]
    fn test_confidence_policy_with_cosine() {
        let dir = tempdir().unwrap();
        let mut svc = FaceService::new(
            ReferenceStore::new(dir.path()),
            Box::new(StubExtractor),
            Matcher::new(DistanceMetric::Cosine, Box::new(ConfidenceThreshold { min_confidence: 0.6 })),
        );
        svc.enroll("r1", &face_a()).unwrap();

        let same = svc.identify(&face_a()).unwrap();
        assert!(same.accepted);
        assert!(same.confidence > 0.95);

        let other = svc.identify(&face_b()).unwrap();
        assert!(!other.accepted);
        assert!(other.confidence < 0.6);
    }

    #[test]
    fn test_simulated_extractor_is_not_a_recognizer() {
        let dir = tempdir().unwrap();
        let mut svc = FaceService::new(
            ReferenceStore::new(dir.path()),
            Box::new(SimulatedExtractor::with_seed(1)),
            Matcher::new(DistanceMetric::Euclidean, Box::new(DistanceThreshold { threshold: 0.01 })),
        );
        svc.enroll("r1", &face_a()).unwrap();
        assert!(!svc.verify("r1", &face_a()).unwrap().accepted);
    }

    #[test]
    fn test_from_config_with_stub() {
        let dir = tempdir().unwrap();
        let config = Config {
            model: crate::config::ModelKind::Stub,
            store_dir: dir.path().join("faces"),
            ..Config::default()
        };
        let mut svc = FaceService::from_config(&config).unwrap();
        assert_eq!(svc.descriptor(), "stub");
        svc.enroll("r1", &face_a()).unwrap();
        assert!(svc.verify("r1", &face_a()).unwrap().accepted);
    }
}
