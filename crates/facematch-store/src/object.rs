//! Object storage: buckets of `/`-separated keys, plus signed download URLs.
//!
//! [`LocalObjectStore`] keeps each bucket as a directory under a root and
//! hands out time-limited URLs signed with HMAC-SHA256 over a shared secret,
//! in the spirit of S3 presigned URLs. Transfers are blocking.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("invalid bucket name '{0}'")]
    InvalidBucket(String),
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("object store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("listing {bucket} failed: {source}")]
    List {
        bucket: String,
        source: walkdir::Error,
    },
    #[error("no signing key configured; cannot presign URLs")]
    NoSigningKey,
    #[error("signing key rejected")]
    InvalidSigningKey,
}

type HmacSha256 = Hmac<Sha256>;

/// Blocking object-store client.
pub trait ObjectStore: Send + Sync {
    /// Keys in `bucket` starting with `prefix`, sorted.
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;

    fn download_file(&self, bucket: &str, key: &str, local: &Path) -> Result<(), ObjectStoreError>;

    fn upload_file(&self, local: &Path, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;

    /// A URL granting read access to `bucket/key` for `expiry`.
    fn presigned_url(&self, bucket: &str, key: &str, expiry: Duration) -> Result<String, ObjectStoreError>;
}

/// Filesystem-backed object store rooted at a directory.
pub struct LocalObjectStore {
    root: PathBuf,
    base_url: String,
    signing_key: Option<String>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_key: None,
        }
    }

    pub fn with_signing_key(mut self, key: impl Into<String>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, ObjectStoreError> {
        let valid = !bucket.is_empty()
            && bucket != "."
            && bucket != ".."
            && !bucket.contains(|c: char| c == '/' || c == '\\');
        if !valid {
            return Err(ObjectStoreError::InvalidBucket(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && !key.ends_with('/')
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.bucket_dir(bucket)?.join(rel))
    }

    /// Check a URL produced by [`presigned_url`](ObjectStore::presigned_url).
    ///
    /// Returns the decoded `(bucket, key)` it grants access to if the
    /// signature is valid and not expired at `now`.
    pub fn verify_presigned(&self, url: &str, now: SystemTime) -> Option<(String, String)> {
        let secret = self.signing_key.as_deref()?;
        let rest = url.strip_prefix(&self.base_url)?.strip_prefix('/')?;
        let (path, query) = rest.split_once('?')?;
        let (bucket, object) = path.split_once('/')?;
        let bucket = urlencoding::decode(bucket).ok()?.into_owned();
        let object = urlencoding::decode(object).ok()?.into_owned();

        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = v.parse::<u64>().ok(),
                Some(("signature", v)) => signature = Some(v),
                _ => {}
            }
        }
        let (expires, signature) = (expires?, signature?);

        let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs();
        if now > expires {
            return None;
        }
        let signature = hex::decode(signature).ok()?;
        mac(secret, &bucket, &object, expires).ok()?.verify_slice(&signature).ok()?;
        Some((bucket, object))
    }
}

/// HMAC-SHA256 over `bucket \n key \n expires`, keyed by `secret`.
fn mac(secret: &str, bucket: &str, key: &str, expires: u64) -> Result<HmacSha256, ObjectStoreError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ObjectStoreError::InvalidSigningKey)?;
    mac.update(bucket.as_bytes());
    mac.update(b"\n");
    mac.update(key.as_bytes());
    mac.update(b"\n");
    mac.update(expires.to_string().as_bytes());
    Ok(mac)
}

/// Percent-encode each `/`-separated segment, keeping the separators.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ObjectStoreError + '_ {
    move |source| ObjectStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ObjectStore for LocalObjectStore {
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1) {
            let entry = entry.map_err(|source| ObjectStoreError::List {
                bucket: bucket.to_string(),
                source,
            })?;
            let Ok(rel) = entry.path().strip_prefix(&dir) else { continue };
            let mut key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            // Directories surface as "folder" keys, like S3 console placeholders.
            if entry.file_type().is_dir() {
                key.push('/');
            }
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn download_file(&self, bucket: &str, key: &str, local: &Path) -> Result<(), ObjectStoreError> {
        let src = self.object_path(bucket, key)?;
        if !src.is_file() {
            return Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::copy(&src, local).map_err(io_err(local))?;
        tracing::debug!(bucket, key, local = %local.display(), "downloaded object");
        Ok(())
    }

    fn upload_file(&self, local: &Path, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        let dst = self.object_path(bucket, key)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::copy(local, &dst).map_err(io_err(local))?;
        tracing::info!(local = %local.display(), bucket, key, "uploaded object");
        Ok(())
    }

    fn presigned_url(&self, bucket: &str, key: &str, expiry: Duration) -> Result<String, ObjectStoreError> {
        let secret = self.signing_key.as_deref().ok_or(ObjectStoreError::NoSigningKey)?;
        self.object_path(bucket, key)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let expires = now.saturating_add(expiry.as_secs());
        let signature = hex::encode(mac(secret, bucket, key, expires)?.finalize().into_bytes());
        Ok(format!(
            "{}/{}/{}?expires={expires}&signature={signature}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_path(key),
        ))
    }
}
