//! Embedding providers: image path in, zero or more face embeddings out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceEmbedding;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_DETECTOR_MODEL: &str = "det_10g.onnx";
pub const DEFAULT_RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid sidecar embeddings in {path}: {source}")]
    InvalidSidecar {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("provider panicked: {0}")]
    Panicked(String),
}

/// Knobs shared by every provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderOptions {
    /// When set, an image with no face is an error instead of an empty result.
    pub enforce_detection: bool,
}

impl ProviderOptions {
    fn check_detected(&self, faces: Vec<FaceEmbedding>) -> Result<Vec<FaceEmbedding>, ProviderError> {
        if faces.is_empty() && self.enforce_detection {
            Err(ProviderError::NoFaceDetected)
        } else {
            Ok(faces)
        }
    }
}

/// Source of face embeddings for an image on disk.
///
/// Returns one entry per detected face, best detection first. An image
/// without faces yields an empty list unless detection is enforced.
pub trait EmbeddingProvider: Send {
    /// Short backend name, for logs.
    fn name(&self) -> &str;

    fn represent(&mut self, image: &Path) -> Result<Vec<FaceEmbedding>, ProviderError>;
}

/// Call [`EmbeddingProvider::represent`], turning a panic into
/// [`ProviderError::Panicked`] so one bad image cannot take down the caller.
pub fn represent_guarded<P>(provider: &mut P, image: &Path) -> Result<Vec<FaceEmbedding>, ProviderError>
where
    P: EmbeddingProvider + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| provider.represent(image))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(path = %image.display(), panic = %message, "embedding provider panicked");
            Err(ProviderError::Panicked(message))
        }
    }
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn represent(&mut self, image: &Path) -> Result<Vec<FaceEmbedding>, ProviderError> {
        (**self).represent(image)
    }
}

/// Selectable embedding backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// SCRFD detection + ArcFace recognition on ONNX Runtime.
    #[default]
    InsightFace,
    /// Precomputed embeddings stored next to each image.
    Sidecar,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::InsightFace => "insightface",
            Backend::Sidecar => "sidecar",
        })
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insightface" => Ok(Backend::InsightFace),
            "sidecar" => Ok(Backend::Sidecar),
            other => Err(format!("unknown embedding backend '{other}' (expected insightface or sidecar)")),
        }
    }
}

/// Detector/recognizer model files for [`InsightFaceProvider`].
#[derive(Debug, Clone)]
pub struct InsightFaceModels {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

impl InsightFaceModels {
    /// Default file names inside `model_dir`.
    pub fn in_dir(model_dir: &Path) -> Self {
        Self {
            detector: model_dir.join(DEFAULT_DETECTOR_MODEL),
            recognizer: model_dir.join(DEFAULT_RECOGNIZER_MODEL),
        }
    }
}

/// SCRFD + ArcFace provider. Every detected face with landmarks is embedded.
pub struct InsightFaceProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    options: ProviderOptions,
}

impl InsightFaceProvider {
    pub fn load(models: &InsightFaceModels, options: ProviderOptions) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(&models.detector)?;
        let recognizer = FaceRecognizer::load(&models.recognizer)?;
        Ok(Self {
            detector,
            recognizer,
            options,
        })
    }
}

impl EmbeddingProvider for InsightFaceProvider {
    fn name(&self) -> &str {
        "insightface"
    }

    fn represent(&mut self, path: &Path) -> Result<Vec<FaceEmbedding>, ProviderError> {
        let rgb = image::open(path)?.to_rgb8();
        let faces = self.detector.detect(&rgb)?;
        tracing::debug!(path = %path.display(), faces = faces.len(), "faces detected");

        let mut out = Vec::with_capacity(faces.len());
        for face in faces {
            if face.landmarks.is_none() {
                continue;
            }
            let embedding = self.recognizer.extract(&rgb, &face)?;
            out.push(FaceEmbedding {
                embedding,
                region: Some(face),
            });
        }
        self.options.check_detected(out)
    }
}

/// Reads embeddings computed by an external tool from `<image>.json`.
///
/// The file holds a JSON array of `{"embedding": {"values": [...]}, "region": ...}`
/// objects. A missing sidecar means no face was found in the image.
#[derive(Debug, Default)]
pub struct SidecarProvider {
    options: ProviderOptions,
}

impl SidecarProvider {
    pub fn new(options: ProviderOptions) -> Self {
        Self { options }
    }

    pub fn sidecar_path(image: &Path) -> PathBuf {
        let mut name = image.as_os_str().to_owned();
        name.push(".json");
        PathBuf::from(name)
    }
}

impl EmbeddingProvider for SidecarProvider {
    fn name(&self) -> &str {
        "sidecar"
    }

    fn represent(&mut self, image: &Path) -> Result<Vec<FaceEmbedding>, ProviderError> {
        if !image.is_file() {
            return Err(ProviderError::Io {
                path: image.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "image not found"),
            });
        }

        let path = Self::sidecar_path(image);
        let faces = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<Vec<FaceEmbedding>>(&bytes)
                .map_err(|source| ProviderError::InvalidSidecar { path, source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(ProviderError::Io { path, source }),
        };
        self.options.check_detected(faces)
    }
}

/// Construct the provider for `backend`. Fails fast when model files are missing.
pub fn load_provider(
    backend: Backend,
    models: &InsightFaceModels,
    options: ProviderOptions,
) -> Result<Box<dyn EmbeddingProvider>, ProviderError> {
    Ok(match backend {
        Backend::InsightFace => Box::new(InsightFaceProvider::load(models, options)?),
        Backend::Sidecar => Box::new(SidecarProvider::new(options)),
    })
}
