use crate::error::FaceError;
use crate::matcher::{ConfidenceThreshold, DecisionPolicy, DistanceThreshold, Matcher, PolicyKind};
use crate::types::DistanceMetric;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Embedding model. `Stub` and `Simulated` need no model files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// ArcFace ResNet-50 trained on WebFace600K (`w600k_r50.onnx`).
    ArcfaceR50,
    /// ArcFace MobileFaceNet (`w600k_mbf.onnx`).
    ArcfaceMbf,
    /// Deterministic luma-grid embedding, for tests.
    Stub,
    /// Random vectors. Does not recognize anyone.
    Simulated,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::ArcfaceR50 => "arcface_r50",
            ModelKind::ArcfaceMbf => "arcface_mbf",
            ModelKind::Stub => "stub",
            ModelKind::Simulated => "simulated",
        }
    }

    /// ONNX file name for the ArcFace variants.
    pub fn model_file(&self) -> Option<&'static str> {
        match self {
            ModelKind::ArcfaceR50 => Some("w600k_r50.onnx"),
            ModelKind::ArcfaceMbf => Some("w600k_mbf.onnx"),
            ModelKind::Stub | ModelKind::Simulated => None,
        }
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arcface_r50" | "arcface" => Ok(ModelKind::ArcfaceR50),
            "arcface_mbf" => Ok(ModelKind::ArcfaceMbf),
            "stub" => Ok(ModelKind::Stub),
            "simulated" => Ok(ModelKind::Simulated),
            other => Err(format!(
                "unknown model {other:?} (expected arcface_r50, arcface_mbf, stub or simulated)"
            )),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Face detector backend for the ONNX pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// SCRFD 10G with keypoints (`det_10g.onnx`).
    #[serde(rename = "scrfd_10g")]
    Scrfd10g,
    /// SCRFD 500M with keypoints (`det_500m.onnx`).
    #[serde(rename = "scrfd_500m")]
    Scrfd500m,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Scrfd10g => "scrfd_10g",
            DetectorKind::Scrfd500m => "scrfd_500m",
        }
    }

    pub fn model_file(&self) -> &'static str {
        match self {
            DetectorKind::Scrfd10g => "det_10g.onnx",
            DetectorKind::Scrfd500m => "det_500m.onnx",
        }
    }
}

impl FromStr for DetectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scrfd_10g" | "scrfd" => Ok(DetectorKind::Scrfd10g),
            "scrfd_500m" => Ok(DetectorKind::Scrfd500m),
            other => Err(format!(
                "unknown detector {other:?} (expected scrfd_10g or scrfd_500m)"
            )),
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognition configuration, fixed for the lifetime of the process.
///
/// References enrolled under one model/detector/metric combination are only
/// meaningful when matched under the same combination.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub model: ModelKind,
    pub detector: DetectorKind,
    pub metric: DistanceMetric,
    pub policy: PolicyKind,
    /// Maximum accepted distance (`distance` policy).
    pub threshold: f32,
    /// Minimum accepted `1 - distance` (`confidence` policy).
    pub min_confidence: f32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Reference store root: one `<resident_id>.jpg` per enrolled resident.
    pub store_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelKind::ArcfaceR50,
            detector: DetectorKind::Scrfd10g,
            metric: DistanceMetric::Cosine,
            policy: PolicyKind::Distance,
            threshold: 0.60,
            min_confidence: 0.60,
            model_dir: default_model_dir(),
            store_dir: PathBuf::from("face_database"),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file named by `FACEGATE_CONFIG` (if set),
    /// then `FACEGATE_*` environment overrides.
    pub fn load() -> Result<Self, FaceError> {
        let base = match std::env::var("FACEGATE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        let config = base.with_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, FaceError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FaceError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, FaceError> {
        toml::from_str(text).map_err(|e| FaceError::Config(e.to_string()))
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, FaceError> {
        if let Some(v) = lookup("FACEGATE_MODEL") {
            self.model = v.parse().map_err(FaceError::Config)?;
        }
        if let Some(v) = lookup("FACEGATE_DETECTOR") {
            self.detector = v.parse().map_err(FaceError::Config)?;
        }
        if let Some(v) = lookup("FACEGATE_METRIC") {
            self.metric = v.parse().map_err(FaceError::Config)?;
        }
        if let Some(v) = lookup("FACEGATE_POLICY") {
            self.policy = v.parse().map_err(FaceError::Config)?;
        }
        if let Some(v) = lookup("FACEGATE_THRESHOLD") {
            self.threshold = parse_f32("FACEGATE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("FACEGATE_MIN_CONFIDENCE") {
            self.min_confidence = parse_f32("FACEGATE_MIN_CONFIDENCE", &v)?;
        }
        if let Some(v) = lookup("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_STORE_DIR") {
            self.store_dir = PathBuf::from(v);
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), FaceError> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(FaceError::Config(format!(
                "threshold must be a positive number, got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(FaceError::Config(format!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            )));
        }
        if self.policy == PolicyKind::Confidence && self.metric == DistanceMetric::Euclidean {
            tracing::warn!(
                "confidence policy assumes a distance bounded near [0, 1]; raw euclidean distances are not"
            );
        }
        Ok(())
    }

    /// Identifies the extractor configuration embeddings are tied to.
    pub fn descriptor(&self) -> String {
        match self.model {
            ModelKind::ArcfaceR50 | ModelKind::ArcfaceMbf => {
                format!("{}+{}", self.model, self.detector)
            }
            ModelKind::Stub | ModelKind::Simulated => self.model.to_string(),
        }
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(self.detector.model_file())
    }

    pub fn recognizer_model_path(&self) -> Option<PathBuf> {
        self.model.model_file().map(|f| self.model_dir.join(f))
    }

    pub fn decision_policy(&self) -> Box<dyn DecisionPolicy> {
        match self.policy {
            PolicyKind::Distance => Box::new(DistanceThreshold {
                threshold: self.threshold,
            }),
            PolicyKind::Confidence => Box::new(ConfidenceThreshold {
                min_confidence: self.min_confidence,
            }),
        }
    }

    pub fn matcher(&self) -> Matcher {
        Matcher::new(self.metric, self.decision_policy())
    }
}

/// `$XDG_DATA_HOME/facegate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate/models")
}

fn parse_f32(key: &str, value: &str) -> Result<f32, FaceError> {
    value
        .trim()
        .parse()
        .map_err(|_| FaceError::Config(format!("{key}: expected a number, got {value:?}")))
}
