use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facematch_core::images::normalize_tree;
use facematch_core::{load_provider, Backend, Gallery, ProviderOptions};
use facematch_ingest::{spawn_engine, Config, EngineError, EngineHandle, Pipeline};
use facematch_store::{
    stage_prefix, Layout, LocalObjectStore, QrGenerator, QrPublisher, RecordStore, SqliteRecordStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facematch", version, about = "Match faces in photos against a gallery of known people")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed the gallery and write label -> embeddings as JSON
    Embed {
        /// Embedding backend: insightface or sidecar
        #[arg(long)]
        engine: Option<Backend>,
        /// Gallery directory, one folder per identity
        #[arg(long)]
        images: Option<PathBuf>,
        #[arg(long, default_value = "embeddings.json")]
        output: PathBuf,
    },
    /// Re-encode gallery images as 8-bit RGB
    Normalize {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Download gallery images from the object store
    StageGallery,
    /// Download probe images from the object store
    StageProbes,
    /// Match new probe images against the gallery and record the results
    Ingest {
        /// Embedding backend: insightface or sidecar
        #[arg(long)]
        engine: Option<Backend>,
        /// Use a gallery written by `embed` instead of rebuilding it
        #[arg(long)]
        gallery_file: Option<PathBuf>,
    },
    /// Print stored probe results as JSON lines
    Records,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("invalid configuration")?;
    tracing::debug!(?config, "configuration resolved");

    match cli.command {
        Commands::Embed { engine, images, output } => {
            let images = images.unwrap_or_else(|| config.gallery_dir.clone());
            embed(&config, engine.unwrap_or(config.engine), &images, &output).await
        }
        Commands::Normalize { input, output } => {
            let input = input.unwrap_or_else(|| config.raw_gallery_dir.clone());
            let output = output.unwrap_or_else(|| config.gallery_dir.clone());
            let report = tokio::task::spawn_blocking(move || normalize_tree(&input, &output)).await??;
            println!("Converted {} images ({} failed)", report.converted, report.failed);
            Ok(())
        }
        Commands::StageGallery => {
            let prefix = config.gallery_prefix.clone();
            stage(&config, prefix, config.raw_gallery_dir.clone(), Layout::Preserve).await
        }
        Commands::StageProbes => {
            let prefix = config.probe_prefix.clone();
            stage(&config, prefix, config.probe_dir.clone(), Layout::Flatten).await
        }
        Commands::Ingest { engine, gallery_file } => {
            ingest(&config, engine.unwrap_or(config.engine), gallery_file.as_deref()).await
        }
        Commands::Records => {
            let store = SqliteRecordStore::open(&config.db_path)
                .await
                .context("record store unavailable")?;
            for record in store.list().await? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
    }
}

/// Cancel the returned token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; stopping after the current image");
            token.cancel();
        }
    });
    cancel
}

fn start_engine(config: &Config, backend: Backend) -> Result<EngineHandle> {
    let provider = load_provider(backend, &config.models(), ProviderOptions::default())
        .with_context(|| format!("failed to load {backend} backend from {}", config.model_dir.display()))?;
    tracing::info!(backend = %backend, "embedding backend loaded");
    Ok(spawn_engine(provider)?)
}

fn object_store(config: &Config) -> LocalObjectStore {
    let store = LocalObjectStore::new(&config.object_store_root, &config.object_store_url);
    match &config.signing_key {
        Some(key) => store.with_signing_key(key.clone()),
        None => store,
    }
}

async fn embed(config: &Config, backend: Backend, images: &Path, output: &Path) -> Result<()> {
    let engine = start_engine(config, backend)?;
    let gallery = match engine.build_gallery(images, cancel_on_interrupt()).await {
        Ok(gallery) => gallery,
        Err(EngineError::Cancelled) => {
            println!("Cancelled; nothing written");
            return Ok(());
        }
        Err(e) => return Err(e).context("failed to build gallery"),
    };

    gallery
        .save_json(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Saved {} embeddings for {} identities to {}",
        gallery.embedding_count(),
        gallery.len(),
        output.display()
    );
    Ok(())
}

async fn stage(config: &Config, prefix: String, local_dir: PathBuf, layout: Layout) -> Result<()> {
    let bucket = config.require_bucket()?.to_string();
    let store = object_store(config);
    let report = tokio::task::spawn_blocking(move || stage_prefix(&store, &bucket, &prefix, &local_dir, layout))
        .await?
        .context("object store unavailable")?;
    println!("Downloaded {} objects ({} failed)", report.downloaded, report.failed);
    Ok(())
}

async fn ingest(config: &Config, backend: Backend, gallery_file: Option<&Path>) -> Result<()> {
    let cancel = cancel_on_interrupt();
    let engine = start_engine(config, backend)?;

    let gallery = match gallery_file {
        Some(path) => Gallery::load_json(path)
            .with_context(|| format!("failed to read gallery file {}", path.display()))?,
        None => match engine.build_gallery(&config.gallery_dir, cancel.clone()).await {
            Ok(gallery) => gallery,
            Err(EngineError::Cancelled) => {
                println!("Cancelled before ingest");
                return Ok(());
            }
            Err(e) => return Err(e).context("failed to build gallery"),
        },
    };
    tracing::info!(identities = gallery.len(), embeddings = gallery.embedding_count(), "gallery loaded");

    let records = SqliteRecordStore::open(&config.db_path)
        .await
        .context("record store unavailable")?;

    let mut pipeline = Pipeline::new(engine, Arc::new(records), config.distance_threshold)
        .with_embed_timeout(config.embed_timeout())
        .with_cancellation(cancel);

    match (&config.bucket, &config.signing_key) {
        (Some(bucket), Some(_)) => {
            let publisher = QrPublisher::new(
                QrGenerator::new(&config.artifact_dir),
                Arc::new(object_store(config)),
                bucket.clone(),
                config.artifact_prefix.clone(),
                config.presign_expiry(),
            );
            pipeline = pipeline.with_artifacts(Arc::new(publisher));
        }
        _ => tracing::warn!("bucket or signing key not configured; QR artifacts disabled"),
    }

    let report = pipeline.process_new_probes(&config.probe_dir, &gallery).await?;
    println!(
        "Matched {}, unknown {}, skipped {}, failed {}{}",
        report.matched,
        report.unknown,
        report.skipped,
        report.failed,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}
