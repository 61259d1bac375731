use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Extractor configuration that produced this embedding (e.g., "arcface_r50+scrfd_10g").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors yield 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Copy of this embedding scaled to unit length. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Distance under `metric`. Lower = more similar.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => 1.0 - self.similarity(other),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::EuclideanL2 => self
                .l2_normalized()
                .euclidean_distance(&other.l2_normalized()),
        }
    }

    /// Whether two embeddings came from the same extractor configuration.
    ///
    /// Dimension must agree; `model_version` must agree when both sides carry one.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Distance metric used to compare embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in [0, 2].
    Cosine,
    Euclidean,
    /// Euclidean distance between L2-normalized embeddings, in [0, 2].
    EuclideanL2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!(
                "unknown distance metric {other:?} (expected cosine, euclidean or euclidean_l2)"
            )),
        }
    }
}

/// An enrolled identity's embedding, recomputed from its stored reference image.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub key: String,
    pub embedding: Embedding,
}

/// Outcome of comparing a probe against one or more references.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchDecision {
    /// Identity of the best candidate, set only when accepted.
    pub candidate: Option<String>,
    /// Distance to the best candidate; `None` when nothing was compared.
    pub distance: Option<f32>,
    /// Confidence in [0, 1] derived from `distance` by the active policy.
    pub confidence: f32,
    pub accepted: bool,
}

impl MatchDecision {
    /// Decision for a search that had nothing to compare against.
    pub fn no_candidates() -> Self {
        Self {
            candidate: None,
            distance: None,
            confidence: 0.0,
            accepted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_opposite() {
        let d = emb(&[1.0, 0.0]).distance(&emb(&[-1.0, 0.0]), DistanceMetric::Cosine);
        assert!((d - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_zero_vector() {
        let d = emb(&[0.0, 0.0]).distance(&emb(&[1.0, 0.0]), DistanceMetric::Cosine);
        assert_eq!(d, 1.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let d = emb(&[0.0, 0.0]).distance(&emb(&[3.0, 4.0]), DistanceMetric::Euclidean);
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_l2_ignores_scale() {
        let d = emb(&[1.0, 1.0]).distance(&emb(&[10.0, 10.0]), DistanceMetric::EuclideanL2);
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn test_comparable_requires_same_version() {
        let mut a = emb(&[1.0, 0.0]);
        let mut b = emb(&[0.0, 1.0]);
        assert!(a.is_comparable(&b));
        a.model_version = Some("arcface_r50+scrfd_10g".into());
        b.model_version = Some("arcface_mbf+scrfd_500m".into());
        assert!(!a.is_comparable(&b));
        assert!(!emb(&[1.0]).is_comparable(&emb(&[1.0, 2.0])));
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!(
            "euclidean_l2".parse::<DistanceMetric>().unwrap(),
            DistanceMetric::EuclideanL2
        );
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}
