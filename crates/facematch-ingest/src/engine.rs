use facematch_core::{
    build_gallery_until, represent_guarded, EmbeddingProvider, FaceEmbedding, Gallery, GalleryError,
    ProviderError,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedding provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("failed to read gallery: {0}")]
    Gallery(GalleryError),
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

impl EngineError {
    /// Whether the failure is confined to one image, which stays eligible for
    /// the next run. A provider panic counts as one. Everything else means
    /// the engine is unusable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Provider(_) | EngineError::Timeout(_))
    }
}

impl From<GalleryError> for EngineError {
    fn from(e: GalleryError) -> Self {
        match e {
            GalleryError::Cancelled => EngineError::Cancelled,
            other => EngineError::Gallery(other),
        }
    }
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Represent {
        path: PathBuf,
        reply: oneshot::Sender<Result<Vec<FaceEmbedding>, ProviderError>>,
    },
    BuildGallery {
        root: PathBuf,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<Gallery, GalleryError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    provider: String,
}

impl EngineHandle {
    /// Name of the provider the engine runs.
    pub fn provider_name(&self) -> &str {
        &self.provider
    }

    /// Embed every face in the image at `path`.
    ///
    /// `timeout` covers queueing and extraction. A request that times out
    /// still runs to completion on the engine thread; its result is dropped.
    pub async fn represent(&self, path: &Path, timeout: Duration) -> Result<Vec<FaceEmbedding>, EngineError> {
        let request = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(EngineRequest::Represent {
                    path: path.to_path_buf(),
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let faces = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
            Ok::<_, EngineError>(faces)
        };
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }

    /// Build the gallery under `root`, stopping between images once `cancel` fires.
    pub async fn build_gallery(&self, root: &Path, cancel: CancellationToken) -> Result<Gallery, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::BuildGallery {
                root: root.to_path_buf(),
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        let gallery = reply_rx.await.map_err(|_| EngineError::ChannelClosed)??;
        Ok(gallery)
    }
}

/// Spawn the engine on a dedicated OS thread that owns `provider`.
///
/// Inference is blocking and the provider holds `&mut` ONNX sessions, so
/// every request is served in order from one thread. Provider panics are
/// caught per image and reported as [`ProviderError::Panicked`].
pub fn spawn_engine<P>(mut provider: P) -> Result<EngineHandle, EngineError>
where
    P: EmbeddingProvider + 'static,
{
    let name = provider.name().to_string();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facematch-engine".into())
        .spawn(move || {
            tracing::info!(provider = provider.name(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Represent { path, reply } => {
                        let result = represent_guarded(&mut provider, &path);
                        if reply.send(result).is_err() {
                            tracing::debug!(path = %path.display(), "caller gone; result dropped");
                        }
                    }
                    EngineRequest::BuildGallery { root, cancel, reply } => {
                        let result = build_gallery_until(&root, &mut provider, || cancel.is_cancelled());
                        if reply.send(result).is_err() {
                            tracing::debug!(root = %root.display(), "caller gone; gallery dropped");
                        }
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, provider: name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facematch_core::Embedding;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Returns one face per call after an optional delay; panics on "boom.jpg".
    struct StubProvider {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl EmbeddingProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn represent(&mut self, path: &Path) -> Result<Vec<FaceEmbedding>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if path.ends_with("boom.jpg") {
                panic!("provider crashed");
            }
            if path.ends_with("missing.jpg") {
                return Err(ProviderError::NoFaceDetected);
            }
            Ok(vec![FaceEmbedding {
                embedding: Embedding::new(vec![1.0, 0.0]),
                region: None,
            }])
        }
    }

    fn stub(delay_ms: u64) -> (EngineHandle, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = spawn_engine(StubProvider {
            delay: Duration::from_millis(delay_ms),
            calls: calls.clone(),
        })
        .unwrap();
        (engine, calls)
    }

    #[tokio::test]
    async fn test_represent_roundtrip() {
        let (engine, calls) = stub(0);
        assert_eq!(engine.provider_name(), "stub");

        let faces = engine.represent(Path::new("a.jpg"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_provider_error_is_retryable() {
        let (engine, _) = stub(0);
        let err = engine
            .represent(Path::new("missing.jpg"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider(ProviderError::NoFaceDetected)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_then_engine_recovers() {
        let (engine, _) = stub(200);
        let err = engine
            .represent(Path::new("slow.jpg"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
        assert!(err.is_retryable());

        // Queued behind the timed-out request, but still served.
        let faces = engine.represent(Path::new("next.jpg"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(faces.len(), 1);
    }

    #[tokio::test]
    async fn test_provider_panic_keeps_engine_alive() {
        let (engine, calls) = stub(0);
        let err = engine
            .represent(Path::new("boom.jpg"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider(ProviderError::Panicked(_))));
        assert!(err.is_retryable());

        let faces = engine.represent(Path::new("a.jpg"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gallery_build_survives_provider_panic() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("alice")).unwrap();
        std::fs::create_dir_all(root.path().join("bob")).unwrap();
        std::fs::write(root.path().join("alice/boom.jpg"), b"img").unwrap();
        std::fs::write(root.path().join("bob/1.jpg"), b"img").unwrap();

        let (engine, _) = stub(0);
        let gallery = engine.build_gallery(root.path(), CancellationToken::new()).await.unwrap();
        assert_eq!(gallery.labels().collect::<Vec<_>>(), vec!["bob"]);

        let faces = engine.represent(Path::new("a.jpg"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(faces.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_gallery_build_keeps_engine_alive() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("alice")).unwrap();
        std::fs::write(root.path().join("alice/1.jpg"), b"img").unwrap();

        let (engine, calls) = stub(200);
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            engine.build_gallery(root.path(), CancellationToken::new()),
        )
        .await;
        assert!(abandoned.is_err());

        // Served once the abandoned build finishes and its reply is dropped.
        let faces = engine.represent(Path::new("a.jpg"), Duration::from_secs(5)).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_engine_is_fatal() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let engine = EngineHandle { tx, provider: "gone".into() };

        let err = engine.represent(Path::new("a.jpg"), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, EngineError::ChannelClosed));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_build_gallery_on_engine() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("alice")).unwrap();
        std::fs::write(root.path().join("alice/1.jpg"), b"img").unwrap();

        let (engine, calls) = stub(0);
        let gallery = engine.build_gallery(root.path(), CancellationToken::new()).await.unwrap();
        assert_eq!(gallery.labels().collect::<Vec<_>>(), vec!["alice"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_build_gallery_cancelled() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("alice")).unwrap();
        std::fs::write(root.path().join("alice/1.jpg"), b"img").unwrap();

        let (engine, calls) = stub(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine.build_gallery(root.path(), cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
