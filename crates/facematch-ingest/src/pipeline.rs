//! Probe ingestion: match every unseen probe image against the gallery and
//! record the outcome exactly once.

use crate::engine::{EngineError, EngineHandle};
use facematch_core::images::list_images;
use facematch_core::{CosineMatcher, FaceEmbedding, Gallery, Identity, Matcher, UNKNOWN_LABEL};
use facematch_store::{ProbeResult, RecordStore, SideArtifact, StoreError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to read probe directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("record store failure: {0}")]
    Store(#[from] StoreError),
    #[error("embedding engine failure: {0}")]
    Engine(#[from] EngineError),
}

/// Per-run counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Recorded with at least one identity.
    pub matched: usize,
    /// Recorded as `["unknown"]`.
    pub unknown: usize,
    /// Already recorded, by an earlier run or a concurrent one.
    pub skipped: usize,
    /// Embedding failed or timed out; no record written.
    pub failed: usize,
    /// The run stopped early on cancellation.
    pub cancelled: bool,
}

pub struct Pipeline {
    engine: EngineHandle,
    records: Arc<dyn RecordStore>,
    artifacts: Option<Arc<dyn SideArtifact>>,
    threshold: f32,
    embed_timeout: Duration,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(engine: EngineHandle, records: Arc<dyn RecordStore>, threshold: f32) -> Self {
        Self {
            engine,
            records,
            artifacts: None,
            threshold,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Publish a side artifact for every matched image.
    pub fn with_artifacts(mut self, artifacts: Arc<dyn SideArtifact>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    /// Stop between images once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Process every image in `probe_dir` that has no record yet.
    ///
    /// Per-image embedding failures leave the image unrecorded so the next
    /// run retries it. Record store failures and a dead engine abort the run.
    pub async fn process_new_probes(&self, probe_dir: &Path, gallery: &Gallery) -> Result<IngestReport, PipelineError> {
        let images = list_images(probe_dir).map_err(|source| PipelineError::ReadDir {
            path: probe_dir.to_path_buf(),
            source,
        })?;
        if gallery.is_empty() {
            tracing::warn!("gallery is empty; every probe will be recorded as unknown");
        }

        let mut report = IngestReport::default();
        for path in images {
            if self.cancel.is_cancelled() {
                tracing::warn!("ingest cancelled");
                report.cancelled = true;
                break;
            }

            let image_id = image_id(&path);
            if self.records.find_by_image_id(&image_id).await?.is_some() {
                tracing::debug!(image = %image_id, "already recorded, skipping");
                report.skipped += 1;
                continue;
            }

            let faces = match self.engine.represent(&path, self.embed_timeout).await {
                Ok(faces) => faces,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(image = %image_id, error = %e, "failed to embed probe");
                    report.failed += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let matched = self.match_faces(&image_id, &faces, gallery);
            let is_unknown = matched.is_empty();
            let labels = if is_unknown {
                vec![UNKNOWN_LABEL.to_string()]
            } else {
                matched.into_iter().collect()
            };

            let mut record = ProbeResult::new(image_id.clone(), labels, None);
            if !is_unknown {
                record.artifact_url = self.publish(&record).await;
            }
            if !self.records.insert(&record).await? {
                tracing::info!(image = %image_id, "recorded concurrently by another run");
                report.skipped += 1;
                continue;
            }

            tracing::info!(
                image = %image_id,
                faces = faces.len(),
                matched = ?record.matched,
                artifact = record.artifact_url.as_deref().unwrap_or("-"),
                "recorded probe"
            );
            if is_unknown {
                report.unknown += 1;
            } else {
                report.matched += 1;
            }
        }

        tracing::info!(
            matched = report.matched,
            unknown = report.unknown,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "ingest finished"
        );
        Ok(report)
    }

    /// Distinct identities matched by any face, sorted.
    fn match_faces(&self, image_id: &str, faces: &[FaceEmbedding], gallery: &Gallery) -> BTreeSet<String> {
        let matcher = CosineMatcher;
        let mut matched = BTreeSet::new();
        for face in faces {
            let outcome = matcher.compare(&face.embedding, gallery, self.threshold);
            tracing::debug!(image = %image_id, identity = %outcome.identity, distance = outcome.distance, "face compared");
            if let Identity::Known(label) = outcome.identity {
                matched.insert(label);
            }
        }
        matched
    }

    /// Publish the side artifact off the async threads; failures become `None`.
    async fn publish(&self, record: &ProbeResult) -> Option<String> {
        let artifacts = self.artifacts.clone()?;
        let pending = record.clone();

        match tokio::task::spawn_blocking(move || artifacts.publish(&pending)).await {
            Ok(Ok(url)) => Some(url),
            Ok(Err(e)) => {
                tracing::warn!(image = %record.image_id, error = %e, "artifact publication failed");
                None
            }
            Err(e) => {
                tracing::warn!(image = %record.image_id, error = %e, "artifact task aborted");
                None
            }
        }
    }
}

/// Records are keyed by file name.
fn image_id(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use async_trait::async_trait;
    use facematch_core::{Embedding, EmbeddingProvider, ProviderError};
    use facematch_store::{ArtifactError, ObjectStoreError, SqliteRecordStore};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Faces keyed by file name; unknown names fail like a corrupt image.
    struct ScriptedProvider {
        faces: HashMap<String, Vec<Vec<f32>>>,
        calls: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl EmbeddingProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn represent(&mut self, path: &Path) -> Result<Vec<FaceEmbedding>, ProviderError> {
            let name = image_id(path);
            self.calls.lock().unwrap().push(name.clone());
            std::thread::sleep(self.delay);
            if name == "crash.jpg" {
                panic!("provider crashed");
            }
            let faces = self.faces.get(&name).ok_or_else(|| ProviderError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::other("corrupt"),
            })?;
            Ok(faces
                .iter()
                .map(|v| FaceEmbedding { embedding: Embedding::new(v.clone()), region: None })
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingArtifact {
        published: Mutex<Vec<(String, Vec<String>)>>,
        fail: bool,
    }

    impl SideArtifact for RecordingArtifact {
        fn publish(&self, record: &ProbeResult) -> Result<String, ArtifactError> {
            self.published
                .lock()
                .unwrap()
                .push((record.image_id.clone(), record.matched.clone()));
            if self.fail {
                return Err(ArtifactError::Store(ObjectStoreError::NoSigningKey));
            }
            Ok(format!("https://files.test/qr/{}.png", record.id))
        }
    }

    /// Reports every lookup as a miss and inserts into `inner`, like a
    /// concurrent run that checked before the other one wrote.
    struct RacingStore {
        inner: Arc<SqliteRecordStore>,
    }

    #[async_trait]
    impl RecordStore for RacingStore {
        async fn find_by_image_id(&self, _: &str) -> Result<Option<ProbeResult>, StoreError> {
            Ok(None)
        }

        async fn insert(&self, record: &ProbeResult) -> Result<bool, StoreError> {
            self.inner.insert(record).await
        }

        async fn list(&self) -> Result<Vec<ProbeResult>, StoreError> {
            self.inner.list().await
        }
    }

    struct DownStore;

    #[async_trait]
    impl RecordStore for DownStore {
        async fn find_by_image_id(&self, _: &str) -> Result<Option<ProbeResult>, StoreError> {
            Err(StoreError::Io {
                path: PathBuf::from("records.db"),
                source: std::io::Error::other("unreachable"),
            })
        }

        async fn insert(&self, _: &ProbeResult) -> Result<bool, StoreError> {
            unreachable!("lookup fails first")
        }

        async fn list(&self) -> Result<Vec<ProbeResult>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn gallery() -> Gallery {
        let mut g = Gallery::new();
        g.insert("alice", vec![Embedding::new(vec![1.0, 0.0, 0.0])]);
        g.insert("bob", vec![Embedding::new(vec![0.0, 1.0, 0.0])]);
        g
    }

    struct Fixture {
        probes: tempfile::TempDir,
        calls: Arc<Mutex<Vec<String>>>,
        engine: EngineHandle,
    }

    fn fixture(entries: &[(&str, Vec<Vec<f32>>)], files: &[&str], delay: Duration) -> Fixture {
        let probes = tempfile::tempdir().unwrap();
        for name in files {
            std::fs::write(probes.path().join(name), b"img").unwrap();
        }
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = spawn_engine(ScriptedProvider {
            faces: entries.iter().map(|(n, f)| (n.to_string(), f.clone())).collect(),
            calls: calls.clone(),
            delay,
        })
        .unwrap();
        Fixture { probes, calls, engine }
    }

    async fn memory_store() -> Arc<SqliteRecordStore> {
        Arc::new(SqliteRecordStore::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let fx = fixture(
            &[("p1.jpg", vec![vec![0.99, 0.1, 0.0]]), ("p2.jpg", vec![])],
            &["p1.jpg", "p2.jpg"],
            Duration::ZERO,
        );
        let store = memory_store().await;
        let pipeline = Pipeline::new(fx.engine.clone(), store.clone(), 0.35);

        let first = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert_eq!(first, IngestReport { matched: 1, unknown: 1, ..Default::default() });
        assert_eq!(fx.calls.lock().unwrap().len(), 2);

        let second = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert_eq!(second, IngestReport { skipped: 2, ..Default::default() });
        assert_eq!(fx.calls.lock().unwrap().len(), 2);
        assert_eq!(store.list().await.unwrap().len(), 2);

        let p2 = store.find_by_image_id("p2.jpg").await.unwrap().unwrap();
        assert_eq!(p2.matched, vec!["unknown"]);
        assert!(p2.artifact_url.is_none());
    }

    #[tokio::test]
    async fn test_matched_identities_are_deduplicated() {
        let fx = fixture(
            &[(
                "group.jpg",
                vec![vec![0.99, 0.1, 0.0], vec![1.0, 0.05, 0.0], vec![0.05, 1.0, 0.0]],
            )],
            &["group.jpg"],
            Duration::ZERO,
        );
        let store = memory_store().await;
        let artifacts = Arc::new(RecordingArtifact::default());
        let pipeline = Pipeline::new(fx.engine.clone(), store.clone(), 0.35).with_artifacts(artifacts.clone());

        pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();

        let record = store.find_by_image_id("group.jpg").await.unwrap().unwrap();
        assert_eq!(record.matched, vec!["alice", "bob"]);
        let expected = format!("https://files.test/qr/{}.png", record.id);
        assert_eq!(record.artifact_url.as_deref(), Some(expected.as_str()));
        assert_eq!(
            *artifacts.published.lock().unwrap(),
            vec![("group.jpg".to_string(), vec!["alice".to_string(), "bob".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_distance_above_threshold_is_unknown_without_artifact() {
        // cos = 0.6 against alice, distance 0.40.
        let fx = fixture(&[("far.jpg", vec![vec![0.6, 0.0, 0.8]])], &["far.jpg"], Duration::ZERO);
        let store = memory_store().await;
        let artifacts = Arc::new(RecordingArtifact::default());
        let pipeline = Pipeline::new(fx.engine.clone(), store.clone(), 0.35).with_artifacts(artifacts.clone());

        let report = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert_eq!(report.unknown, 1);

        let record = store.find_by_image_id("far.jpg").await.unwrap().unwrap();
        assert_eq!(record.matched, vec!["unknown"]);
        assert!(record.artifact_url.is_none());
        assert!(artifacts.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_image_retryable() {
        let fx = fixture(&[("ok.jpg", vec![vec![1.0, 0.0, 0.0]])], &["corrupt.jpg", "ok.jpg"], Duration::ZERO);
        let store = memory_store().await;
        let pipeline = Pipeline::new(fx.engine.clone(), store.clone(), 0.35);

        let report = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert_eq!(report, IngestReport { matched: 1, failed: 1, ..Default::default() });
        assert!(store.find_by_image_id("corrupt.jpg").await.unwrap().is_none());

        // Retried, not skipped.
        let again = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert_eq!(again, IngestReport { skipped: 1, failed: 1, ..Default::default() });
        assert_eq!(
            fx.calls.lock().unwrap().iter().filter(|n| n.as_str() == "corrupt.jpg").count(),
            2
        );
    }

    #[tokio::test]
    async fn test_artifact_failure_records_null_reference() {
        let fx = fixture(&[("p.jpg", vec![vec![1.0, 0.0, 0.0]])], &["p.jpg"], Duration::ZERO);
        let store = memory_store().await;
        let artifacts = Arc::new(RecordingArtifact { fail: true, ..Default::default() });
        let pipeline = Pipeline::new(fx.engine.clone(), store.clone(), 0.35).with_artifacts(artifacts);

        let report = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert_eq!(report.matched, 1);

        let record = store.find_by_image_id("p.jpg").await.unwrap().unwrap();
        assert_eq!(record.matched, vec!["alice"]);
        assert!(record.artifact_url.is_none());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed() {
        let fx = fixture(&[("slow.jpg", vec![vec![1.0, 0.0, 0.0]])], &["slow.jpg"], Duration::from_millis(200));
        let store = memory_store().await;
        let pipeline = Pipeline::new(fx.engine.clone(), store.clone(), 0.35)
            .with_embed_timeout(Duration::from_millis(20));

        let report = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fx = fixture(&[("p.jpg", vec![vec![1.0, 0.0, 0.0]])], &["p.jpg"], Duration::ZERO);
        let store = memory_store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = Pipeline::new(fx.engine.clone(), store.clone(), 0.35).with_cancellation(cancel);

        let report = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert!(report.cancelled);
        assert!(fx.calls.lock().unwrap().is_empty());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_fatal() {
        let fx = fixture(&[("p.jpg", vec![vec![1.0, 0.0, 0.0]])], &["p.jpg"], Duration::ZERO);
        let pipeline = Pipeline::new(fx.engine.clone(), Arc::new(DownStore), 0.35);

        let err = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
        assert!(fx.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_panic_counts_as_failed() {
        let fx = fixture(
            &[("later.jpg", vec![vec![1.0, 0.0, 0.0]])],
            &["crash.jpg", "later.jpg"],
            Duration::ZERO,
        );
        let store = memory_store().await;
        let pipeline = Pipeline::new(fx.engine.clone(), store.clone(), 0.35);

        let report = pipeline.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert_eq!(report, IngestReport { matched: 1, failed: 1, ..Default::default() });
        assert!(store.find_by_image_id("crash.jpg").await.unwrap().is_none());
        let later = store.find_by_image_id("later.jpg").await.unwrap().unwrap();
        assert_eq!(later.matched, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_losing_run_keeps_winner_artifact() {
        let fx = fixture(&[("p1.jpg", vec![vec![1.0, 0.0, 0.0]])], &["p1.jpg"], Duration::ZERO);
        let store = memory_store().await;
        let artifacts = Arc::new(RecordingArtifact::default());
        let winner = Pipeline::new(fx.engine.clone(), store.clone(), 0.35).with_artifacts(artifacts.clone());
        let loser = Pipeline::new(fx.engine.clone(), Arc::new(RacingStore { inner: store.clone() }), 0.35)
            .with_artifacts(artifacts.clone());

        winner.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        let recorded = store.find_by_image_id("p1.jpg").await.unwrap().unwrap();

        let report = loser.process_new_probes(fx.probes.path(), &gallery()).await.unwrap();
        assert_eq!(report, IngestReport { skipped: 1, ..Default::default() });
        assert_eq!(artifacts.published.lock().unwrap().len(), 2);

        let after = store.find_by_image_id("p1.jpg").await.unwrap().unwrap();
        assert_eq!(after.id, recorded.id);
        assert_eq!(after.artifact_url, recorded.artifact_url);
        let winner_url = format!("https://files.test/qr/{}.png", recorded.id);
        assert_eq!(after.artifact_url.as_deref(), Some(winner_url.as_str()));
    }

    #[tokio::test]
    async fn test_missing_probe_dir() {
        let fx = fixture(&[], &[], Duration::ZERO);
        let pipeline = Pipeline::new(fx.engine.clone(), memory_store().await, 0.35);
        let err = pipeline
            .process_new_probes(Path::new("/nonexistent/probes"), &gallery())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ReadDir { .. }));
    }
}
