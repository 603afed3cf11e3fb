use crate::pipeline::DEFAULT_EMBED_TIMEOUT;
use facematch_core::{Backend, InsightFaceModels, DEFAULT_DISTANCE_THRESHOLD};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("distance_threshold must be in (0, 2], got {0}")]
    Threshold(f32),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("no bucket configured (set FACEMATCH_BUCKET or `bucket` in the config file)")]
    MissingBucket,
}

/// Run configuration.
///
/// Resolved from built-in defaults, then an optional TOML file, then
/// `FACEMATCH_*` environment variables.
#[derive(Clone)]
pub struct Config {
    /// Normalized gallery images, one folder per identity.
    pub gallery_dir: PathBuf,
    /// Gallery images as downloaded, before normalization.
    pub raw_gallery_dir: PathBuf,
    /// Probe images to ingest.
    pub probe_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite record database.
    pub db_path: PathBuf,
    pub engine: Backend,
    /// Cosine distance below which a face matches an identity.
    pub distance_threshold: f32,
    /// Upper bound on a single embedding request.
    pub embed_timeout_secs: u64,
    /// Scratch directory for generated QR images.
    pub artifact_dir: PathBuf,
    /// Root directory of the local object store.
    pub object_store_root: PathBuf,
    /// Base URL that presigned links are issued under.
    pub object_store_url: String,
    pub bucket: Option<String>,
    pub gallery_prefix: String,
    pub probe_prefix: String,
    pub artifact_prefix: String,
    pub presign_expiry_secs: u64,
    pub signing_key: Option<String>,
}

/// On-disk form: every key optional, unknown keys rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    gallery_dir: Option<PathBuf>,
    raw_gallery_dir: Option<PathBuf>,
    probe_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    engine: Option<Backend>,
    distance_threshold: Option<f32>,
    embed_timeout_secs: Option<u64>,
    artifact_dir: Option<PathBuf>,
    object_store_root: Option<PathBuf>,
    object_store_url: Option<String>,
    bucket: Option<String>,
    gallery_prefix: Option<String>,
    probe_prefix: Option<String>,
    artifact_prefix: Option<String>,
    presign_expiry_secs: Option<u64>,
    signing_key: Option<String>,
}

impl Config {
    /// Load from `file` (if any) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`] with an explicit environment lookup.
    pub fn resolve<E>(file: Option<&Path>, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut config = Self::defaults(&env);
        if let Some(path) = file {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let parsed: ConfigFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            config.apply_file(parsed);
        }
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    fn defaults<E: Fn(&str) -> Option<String>>(env: &E) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facematch");

        Self {
            gallery_dir: PathBuf::from("purified_images"),
            raw_gallery_dir: PathBuf::from("downloaded_images"),
            probe_dir: PathBuf::from("test_images"),
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("records.db"),
            engine: Backend::default(),
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            embed_timeout_secs: DEFAULT_EMBED_TIMEOUT.as_secs(),
            artifact_dir: data_dir.join("artifacts"),
            object_store_root: data_dir.join("objects"),
            object_store_url: "http://localhost:9000".to_string(),
            bucket: None,
            gallery_prefix: "known/".to_string(),
            probe_prefix: "uploads/".to_string(),
            artifact_prefix: "qr/".to_string(),
            presign_expiry_secs: 3600,
            signing_key: None,
        }
    }

    fn apply_file(&mut self, file: ConfigFile) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *slot = v;
            }
        }

        set(&mut self.gallery_dir, file.gallery_dir);
        set(&mut self.raw_gallery_dir, file.raw_gallery_dir);
        set(&mut self.probe_dir, file.probe_dir);
        set(&mut self.model_dir, file.model_dir);
        set(&mut self.db_path, file.db_path);
        set(&mut self.engine, file.engine);
        set(&mut self.distance_threshold, file.distance_threshold);
        set(&mut self.embed_timeout_secs, file.embed_timeout_secs);
        set(&mut self.artifact_dir, file.artifact_dir);
        set(&mut self.object_store_root, file.object_store_root);
        set(&mut self.object_store_url, file.object_store_url);
        set(&mut self.gallery_prefix, file.gallery_prefix);
        set(&mut self.probe_prefix, file.probe_prefix);
        set(&mut self.artifact_prefix, file.artifact_prefix);
        set(&mut self.presign_expiry_secs, file.presign_expiry_secs);
        if file.bucket.is_some() {
            self.bucket = file.bucket;
        }
        if file.signing_key.is_some() {
            self.signing_key = file.signing_key;
        }
    }

    fn apply_env<E: Fn(&str) -> Option<String>>(&mut self, env: &E) -> Result<(), ConfigError> {
        let path = |key: &str| env(key).map(PathBuf::from);

        if let Some(v) = path("FACEMATCH_GALLERY_DIR") {
            self.gallery_dir = v;
        }
        if let Some(v) = path("FACEMATCH_RAW_GALLERY_DIR") {
            self.raw_gallery_dir = v;
        }
        if let Some(v) = path("FACEMATCH_PROBE_DIR") {
            self.probe_dir = v;
        }
        if let Some(v) = path("FACEMATCH_MODEL_DIR") {
            self.model_dir = v;
        }
        if let Some(v) = path("FACEMATCH_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = path("FACEMATCH_ARTIFACT_DIR") {
            self.artifact_dir = v;
        }
        if let Some(v) = path("FACEMATCH_OBJECT_STORE_ROOT") {
            self.object_store_root = v;
        }
        if let Some(v) = env_parse(env, "FACEMATCH_ENGINE")? {
            self.engine = v;
        }
        if let Some(v) = env_parse(env, "FACEMATCH_DISTANCE_THRESHOLD")? {
            self.distance_threshold = v;
        }
        if let Some(v) = env_parse(env, "FACEMATCH_EMBED_TIMEOUT_SECS")? {
            self.embed_timeout_secs = v;
        }
        if let Some(v) = env_parse(env, "FACEMATCH_PRESIGN_EXPIRY_SECS")? {
            self.presign_expiry_secs = v;
        }
        if let Some(v) = env("FACEMATCH_OBJECT_STORE_URL") {
            self.object_store_url = v;
        }
        if let Some(v) = env("FACEMATCH_GALLERY_PREFIX") {
            self.gallery_prefix = v;
        }
        if let Some(v) = env("FACEMATCH_PROBE_PREFIX") {
            self.probe_prefix = v;
        }
        if let Some(v) = env("FACEMATCH_ARTIFACT_PREFIX") {
            self.artifact_prefix = v;
        }
        if let Some(v) = env("FACEMATCH_BUCKET") {
            self.bucket = Some(v);
        }
        if let Some(v) = env("FACEMATCH_SIGNING_KEY") {
            self.signing_key = Some(v);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let t = self.distance_threshold;
        if !(t > 0.0 && t <= 2.0) {
            return Err(ConfigError::Threshold(t));
        }
        if self.embed_timeout_secs == 0 {
            return Err(ConfigError::Zero("embed_timeout_secs"));
        }
        if self.presign_expiry_secs == 0 {
            return Err(ConfigError::Zero("presign_expiry_secs"));
        }
        Ok(())
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign_expiry_secs)
    }

    /// SCRFD and ArcFace model paths under `model_dir`.
    pub fn models(&self) -> InsightFaceModels {
        InsightFaceModels::in_dir(&self.model_dir)
    }

    pub fn require_bucket(&self) -> Result<&str, ConfigError> {
        self.bucket.as_deref().ok_or(ConfigError::MissingBucket)
    }
}

// Hand-written so the signing key never reaches logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("gallery_dir", &self.gallery_dir)
            .field("raw_gallery_dir", &self.raw_gallery_dir)
            .field("probe_dir", &self.probe_dir)
            .field("model_dir", &self.model_dir)
            .field("db_path", &self.db_path)
            .field("engine", &self.engine)
            .field("distance_threshold", &self.distance_threshold)
            .field("embed_timeout_secs", &self.embed_timeout_secs)
            .field("artifact_dir", &self.artifact_dir)
            .field("object_store_root", &self.object_store_root)
            .field("object_store_url", &self.object_store_url)
            .field("bucket", &self.bucket)
            .field("gallery_prefix", &self.gallery_prefix)
            .field("probe_prefix", &self.probe_prefix)
            .field("artifact_prefix", &self.artifact_prefix)
            .field("presign_expiry_secs", &self.presign_expiry_secs)
            .field("signing_key", &self.signing_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn env_parse<T, E>(env: &E, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    E: Fn(&str) -> Option<String>,
{
    match env(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
    }
}
