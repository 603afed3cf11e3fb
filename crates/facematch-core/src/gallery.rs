//! Gallery construction from a directory of identity folders.
//!
//! `root/<label>/<image>`: each immediate subdirectory is one identity and
//! each image in it is assumed to show that person alone.

use crate::images::{list_identity_dirs, list_images};
use crate::provider::{represent_guarded, EmbeddingProvider};
use crate::types::Gallery;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("gallery build cancelled")]
    Cancelled,
}

/// Build a gallery by embedding every image under `root`.
pub fn build_gallery<P>(root: &Path, provider: &mut P) -> Result<Gallery, GalleryError>
where
    P: EmbeddingProvider + ?Sized,
{
    build_gallery_until(root, provider, || false)
}

/// Like [`build_gallery`], checking `cancelled` before every image.
///
/// Per-image provider failures are logged and skipped. Only the first face
/// returned for an image is kept. Identities that end up with no embedding
/// are left out of the gallery.
pub fn build_gallery_until<P, F>(
    root: &Path,
    provider: &mut P,
    cancelled: F,
) -> Result<Gallery, GalleryError>
where
    P: EmbeddingProvider + ?Sized,
    F: Fn() -> bool,
{
    let identities = list_identity_dirs(root).map_err(|source| GalleryError::ReadDir {
        path: root.to_path_buf(),
        source,
    })?;

    let mut gallery = Gallery::new();
    for (label, dir) in identities {
        let images = match list_images(&dir) {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!(identity = %label, path = %dir.display(), error = %e, "failed to list identity folder");
                continue;
            }
        };

        let mut embeddings = Vec::with_capacity(images.len());
        for image in images {
            if cancelled() {
                return Err(GalleryError::Cancelled);
            }
            match represent_guarded(provider, &image) {
                Ok(faces) => match faces.into_iter().next() {
                    Some(face) => {
                        tracing::info!(identity = %label, path = %image.display(), "embedded image");
                        embeddings.push(face.embedding);
                    }
                    None => {
                        tracing::info!(identity = %label, path = %image.display(), "no face found");
                    }
                },
                Err(e) => {
                    tracing::warn!(identity = %label, path = %image.display(), error = %e, "failed to embed image");
                }
            }
        }

        if embeddings.is_empty() {
            tracing::warn!(identity = %label, "no usable images, identity omitted");
        } else {
            gallery.insert(label, embeddings);
        }
    }

    tracing::info!(
        provider = provider.name(),
        identities = gallery.len(),
        embeddings = gallery.embedding_count(),
        "gallery ready"
    );
    Ok(gallery)
}
