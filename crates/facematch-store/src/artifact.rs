//! QR-code side artifacts for matched probe images.
//!
//! The QR code encodes which identities were found in an image. It is
//! rendered to a local PNG, uploaded to the object store and shared through a
//! presigned URL.

use crate::object::{ObjectStore, ObjectStoreError};
use crate::record::ProbeResult;
use image::Luma;
use qrcode::types::QrError;
use qrcode::QrCode;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const QR_MIN_SIZE: u32 = 256;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("QR encoding failed: {0}")]
    Encode(#[from] QrError),
    #[error("failed to write QR image: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to create artifact directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("artifact upload failed: {0}")]
    Store(#[from] ObjectStoreError),
}

/// Renders payload strings as QR-code PNGs in a scratch directory.
#[derive(Debug, Clone)]
pub struct QrGenerator {
    out_dir: PathBuf,
}

impl QrGenerator {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    /// Render `payload` and return the local PNG path.
    ///
    /// Files are named after a hash of the payload, so the same payload
    /// always lands on the same path.
    pub fn generate(&self, payload: &str) -> Result<PathBuf, ArtifactError> {
        std::fs::create_dir_all(&self.out_dir).map_err(|source| ArtifactError::Io {
            path: self.out_dir.clone(),
            source,
        })?;

        let digest = hex::encode(Sha256::digest(payload.as_bytes()));
        let path = self.out_dir.join(format!("qr-{}.png", &digest[..16]));

        let code = QrCode::new(payload.as_bytes())?;
        code.render::<Luma<u8>>()
            .min_dimensions(QR_MIN_SIZE, QR_MIN_SIZE)
            .build()
            .save(&path)?;
        Ok(path)
    }
}

/// Payload encoded for a matched image: `{"image": .., "matches": [..]}`.
pub fn match_payload(image_id: &str, identities: &[String]) -> String {
    serde_json::json!({
        "image": image_id,
        "matches": identities,
    })
    .to_string()
}

/// Produces a retrievable reference for a matched probe image.
///
/// Called before `record` is inserted. `record.matched` is sorted and
/// non-empty.
pub trait SideArtifact: Send + Sync {
    fn publish(&self, record: &ProbeResult) -> Result<String, ArtifactError>;
}

/// QR code → object store upload → presigned URL.
pub struct QrPublisher {
    generator: QrGenerator,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key_prefix: String,
    expiry: Duration,
}

impl QrPublisher {
    pub fn new(
        generator: QrGenerator,
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key_prefix: impl Into<String>,
        expiry: Duration,
    ) -> Self {
        Self {
            generator,
            store,
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
            expiry,
        }
    }

    /// One object per record. A run that loses the insert race uploads
    /// under its own id and never replaces the winner's QR code.
    fn object_key(&self, record: &ProbeResult) -> String {
        format!("{}{}.png", self.key_prefix, record.id)
    }
}

impl SideArtifact for QrPublisher {
    fn publish(&self, record: &ProbeResult) -> Result<String, ArtifactError> {
        let local = self.generator.generate(&match_payload(&record.image_id, &record.matched))?;
        let key = self.object_key(record);
        self.store.upload_file(&local, &self.bucket, &key)?;
        let url = self.store.presigned_url(&self.bucket, &key, self.expiry)?;
        tracing::info!(image = %record.image_id, key = %key, "published QR artifact");
        Ok(url)
    }
}
