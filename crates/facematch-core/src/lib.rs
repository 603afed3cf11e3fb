//! facematch-core — face embeddings, identity gallery and matching.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both
//! running via ONNX Runtime, behind the [`EmbeddingProvider`] trait.

pub mod alignment;
pub mod detector;
pub mod gallery;
pub mod images;
pub mod provider;
pub mod recognizer;
pub mod types;

pub use gallery::{build_gallery, build_gallery_until, GalleryError};
pub use provider::{
    load_provider, Backend, EmbeddingProvider, InsightFaceModels, InsightFaceProvider,
    represent_guarded, ProviderError, ProviderOptions, SidecarProvider,
};
pub use types::{
    BoundingBox, CosineMatcher, Embedding, FaceEmbedding, Gallery, Identity, MatchOutcome,
    Matcher, DEFAULT_DISTANCE_THRESHOLD, MAX_DISTANCE, UNKNOWN_LABEL,
};
