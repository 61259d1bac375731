//! facegate-core: face reference store, feature extraction and matching.
//!
//! Detection uses SCRFD and recognition uses ArcFace, both on ONNX Runtime
//! for CPU inference. A deterministic stub extractor stands in when no
//! models are installed.

pub mod alignment;
pub mod codec;
pub mod config;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod matcher;
pub mod recognizer;
pub mod service;
pub mod store;
pub mod types;

pub use config::{Config, DetectorKind, ModelKind};
pub use error::FaceError;
pub use extractor::{build_extractor, FeatureExtractor, OnnxExtractor, SimulatedExtractor, StubExtractor};
pub use matcher::{DecisionPolicy, Matcher, PolicyKind, RankedCandidate};
pub use service::{Enrollment, FaceService};
pub use store::{ReferenceStore, StagedReference};
pub use types::{BoundingBox, DistanceMetric, Embedding, GalleryEntry, MatchDecision};
