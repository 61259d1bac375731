//! Distance → confidence → accept/reject.
//!
//! Two decision conventions exist for face distances and they are not
//! interchangeable: a distance threshold that also scales confidence
//! (`1 - d/threshold`), and a fixed confidence cut over `1 - d` that only
//! makes sense for metrics bounded near [0, 1] such as cosine. Exactly one
//! is active per [`Matcher`].

use crate::error::FaceError;
use crate::types::{DistanceMetric, Embedding, GalleryEntry, MatchDecision};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Strategy turning a distance into a bounded confidence and a verdict.
pub trait DecisionPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Confidence in [0, 1], non-increasing in `distance`.
    fn confidence(&self, distance: f32) -> f32;
    fn accepts(&self, distance: f32) -> bool;
    /// The configured cut-off, reported alongside verification results.
    fn threshold(&self) -> f32;
}

/// Accept iff `distance <= threshold`; confidence = `1 - distance / threshold`.
#[derive(Debug, Clone, Copy)]
pub struct DistanceThreshold {
    pub threshold: f32,
}

impl DecisionPolicy for DistanceThreshold {
    fn name(&self) -> &'static str {
        "distance"
    }

    fn confidence(&self, distance: f32) -> f32 {
        clamp_unit(1.0 - distance / self.threshold)
    }

    fn accepts(&self, distance: f32) -> bool {
        distance <= self.threshold
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }
}

/// Accept iff `1 - distance >= min_confidence`.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceThreshold {
    pub min_confidence: f32,
}

impl DecisionPolicy for ConfidenceThreshold {
    fn name(&self) -> &'static str {
        "confidence"
    }

    fn confidence(&self, distance: f32) -> f32 {
        clamp_unit(1.0 - distance)
    }

    fn accepts(&self, distance: f32) -> bool {
        !distance.is_nan() && self.confidence(distance) >= self.min_confidence
    }

    fn threshold(&self) -> f32 {
        self.min_confidence
    }
}

/// NaN maps to 0 so a broken distance never reads as a confident match.
fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Configuration-facing selector for the active [`DecisionPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Distance,
    Confidence,
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "distance" => Ok(PolicyKind::Distance),
            "confidence" => Ok(PolicyKind::Confidence),
            other => Err(format!(
                "unknown decision policy {other:?} (expected distance or confidence)"
            )),
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PolicyKind::Distance => "distance",
            PolicyKind::Confidence => "confidence",
        })
    }
}

/// A gallery entry's distance to the probe.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub key: String,
    pub distance: f32,
}

/// Compares probe embeddings against references under one metric and one policy.
pub struct Matcher {
    metric: DistanceMetric,
    policy: Box<dyn DecisionPolicy>,
}

impl Matcher {
    pub fn new(metric: DistanceMetric, policy: Box<dyn DecisionPolicy>) -> Self {
        Self { metric, policy }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn policy(&self) -> &dyn DecisionPolicy {
        self.policy.as_ref()
    }

    /// Turn a distance to `key` into a decision.
    pub fn decide(&self, key: &str, distance: f32) -> MatchDecision {
        let accepted = self.policy.accepts(distance);
        MatchDecision {
            candidate: accepted.then(|| key.to_string()),
            distance: Some(distance),
            confidence: self.policy.confidence(distance),
            accepted,
        }
    }

    /// Single-pair verification of `probe` against the reference enrolled as `key`.
    pub fn verify(
        &self,
        probe: &Embedding,
        reference: &Embedding,
        key: &str,
    ) -> Result<MatchDecision, FaceError> {
        if !probe.is_comparable(reference) {
            return Err(FaceError::ExtractionBackend(format!(
                "embedding for {key} was produced by a different extractor configuration"
            )));
        }
        Ok(self.decide(key, probe.distance(reference, self.metric)))
    }

    /// Distance to every comparable gallery entry, nearest first.
    ///
    /// The sort is stable, so equal distances keep gallery order.
    pub fn rank(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> Vec<RankedCandidate> {
        let mut ranked: Vec<RankedCandidate> = gallery
            .iter()
            .filter(|entry| {
                let ok = probe.is_comparable(&entry.embedding);
                if !ok {
                    tracing::warn!(key = %entry.key, "skipping reference with incompatible embedding");
                }
                ok
            })
            .map(|entry| RankedCandidate {
                key: entry.key.clone(),
                distance: probe.distance(&entry.embedding, self.metric),
            })
            .collect();
        ranked.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        ranked
    }

    /// Best match across the whole gallery.
    ///
    /// Visits every entry (no early exit); the first-seen entry wins ties.
    pub fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchDecision {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            if !probe.is_comparable(&entry.embedding) {
                tracing::warn!(key = %entry.key, "skipping reference with incompatible embedding");
                continue;
            }
            let d = probe.distance(&entry.embedding, self.metric);
            let is_better = match best {
                None => !d.is_nan(),
                Some((_, best_d)) => d < best_d,
            };
            if is_better {
                best = Some((i, d));
            }
        }

        match best {
            Some((idx, d)) => self.decide(&gallery[idx].key, d),
            None => MatchDecision::no_candidates(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, values: &[f32]) -> GalleryEntry {
        GalleryEntry {
            key: key.into(),
            embedding: Embedding { values: values.to_vec(), model_version: None },
        }
    }

    fn probe(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    fn euclidean(threshold: f32) -> Matcher {
        Matcher::new(DistanceMetric::Euclidean, Box::new(DistanceThreshold { threshold }))
    }

    fn cosine(min_confidence: f32) -> Matcher {
        Matcher::new(DistanceMetric::Cosine, Box::new(ConfidenceThreshold { min_confidence }))
    }

    #[test]
    fn test_distance_policy_confidence_monotonic_and_clamped() {
        let p = DistanceThreshold { threshold: 0.8 };
        let mut prev = f32::INFINITY;
        for i in 0..=400 {
            let d = i as f32 * 0.01 - 1.0;
            let c = p.confidence(d);
            assert!((0.0..=1.0).contains(&c), "d={d} c={c}");
            assert!(c <= prev, "confidence increased at d={d}");
            prev = c;
        }
        assert_eq!(p.confidence(0.0), 1.0);
        assert_eq!(p.confidence(0.8), 0.0);
        assert_eq!(p.confidence(5.0), 0.0);
    }

    #[test]
    fn test_confidence_policy_monotonic_and_clamped() {
        let p = ConfidenceThreshold { min_confidence: 0.6 };
        let mut prev = f32::INFINITY;
        for i in 0..=300 {
            let d = i as f32 * 0.01 - 0.5;
            let c = p.confidence(d);
            assert!((0.0..=1.0).contains(&c), "d={d} c={c}");
            assert!(c <= prev);
            prev = c;
        }
        assert_eq!(p.confidence(2.0), 0.0);
    }

    #[test]
    fn test_nan_distance_is_rejected() {
        assert_eq!(DistanceThreshold { threshold: 0.8 }.confidence(f32::NAN), 0.0);
        assert!(!DistanceThreshold { threshold: 0.8 }.accepts(f32::NAN));
        assert!(!ConfidenceThreshold { min_confidence: 0.0 }.accepts(f32::NAN));
    }

    #[test]
    fn test_distance_policy_accepts_at_threshold() {
        let p = DistanceThreshold { threshold: 0.8 };
        assert!(p.accepts(0.8));
        assert!(!p.accepts(0.8001));
    }

    #[test]
    fn test_confidence_policy_accepts_at_cut() {
        let p = ConfidenceThreshold { min_confidence: 0.6 };
        assert!(p.accepts(0.4));
        assert!(!p.accepts(0.41));
    }

    #[test]
    fn test_verify_match_and_reject() {
        let m = euclidean(0.8);
        let d = m.verify(&probe(&[0.0, 0.0]), &probe(&[0.3, 0.4]), "r1").unwrap();
        assert!(d.accepted);
        assert_eq!(d.candidate.as_deref(), Some("r1"));
        assert!((d.distance.unwrap() - 0.5).abs() < 1e-6);
        assert!((d.confidence - 0.375).abs() < 1e-5);

        let d = m.verify(&probe(&[0.0, 0.0]), &probe(&[3.0, 4.0]), "r1").unwrap();
        assert!(!d.accepted);
        assert_eq!(d.candidate, None);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_verify_rejects_incompatible_embeddings() {
        let a = Embedding { values: vec![1.0, 0.0], model_version: Some("a".into()) };
        let b = Embedding { values: vec![1.0, 0.0], model_version: Some("b".into()) };
        assert!(matches!(
            euclidean(0.8).verify(&a, &b, "r1"),
            Err(FaceError::ExtractionBackend(_))
        ));
    }

    #[test]
    fn test_compare_visits_all_entries() {
        // Best match is the last entry.
        let gallery = vec![
            entry("decoy1", &[0.0, 1.0, 0.0]),
            entry("decoy2", &[0.0, 0.0, 1.0]),
            entry("match", &[1.0, 0.0, 0.0]),
        ];
        let d = cosine(0.6).compare(&probe(&[1.0, 0.0, 0.0]), &gallery);
        assert!(d.accepted);
        assert_eq!(d.candidate.as_deref(), Some("match"));
        assert!(d.distance.unwrap().abs() < 1e-6);
        assert!((d.confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_compare_tie_first_seen_wins() {
        let gallery = vec![entry("first", &[1.0, 0.0]), entry("second", &[1.0, 0.0])];
        let d = euclidean(0.8).compare(&probe(&[1.0, 0.0]), &gallery);
        assert_eq!(d.candidate.as_deref(), Some("first"));
    }

    #[test]
    fn test_compare_no_match_reports_best_distance() {
        let gallery = vec![entry("other", &[0.0, 1.0, 0.0])];
        let d = cosine(0.6).compare(&probe(&[1.0, 0.0, 0.0]), &gallery);
        assert!(!d.accepted);
        assert_eq!(d.candidate, None);
        assert!((d.distance.unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_compare_empty_gallery() {
        let d = cosine(0.6).compare(&probe(&[1.0, 0.0]), &[]);
        assert_eq!(d, MatchDecision::no_candidates());
    }

    #[test]
    fn test_rank_orders_nearest_first() {
        let gallery = vec![
            entry("far", &[3.0, 4.0]),
            entry("near", &[0.1, 0.0]),
            entry("mid", &[1.0, 0.0]),
        ];
        let ranked = euclidean(0.8).rank(&probe(&[0.0, 0.0]), &gallery);
        let keys: Vec<&str> = ranked.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["near", "mid", "far"]);
    }

    #[test]
    fn test_policy_kind_parse() {
        assert_eq!("Distance".parse::<PolicyKind>().unwrap(), PolicyKind::Distance);
        assert_eq!("confidence".parse::<PolicyKind>().unwrap(), PolicyKind::Confidence);
        assert!("margin".parse::<PolicyKind>().is_err());
    }
}
