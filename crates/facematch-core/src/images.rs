//! Image discovery and format normalization for identity folders.

use image::ImageFormat;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("failed to read directory {path}: {source}")]
    ReadDir { path: PathBuf, source: io::Error },
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
}

/// True for regular, non-hidden files whose extension names an image format.
pub fn is_image_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |n| n.starts_with('.'));
    !hidden && path.is_file() && ImageFormat::from_path(path).is_ok()
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Immediate subdirectories of `root` as `(label, path)`, sorted by label.
///
/// Hidden directories and names that are not valid UTF-8 are skipped.
pub fn list_identity_dirs(root: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(label) if !label.starts_with('.') => dirs.push((label, path)),
            Ok(_) => {}
            Err(name) => tracing::warn!(name = ?name, "skipping identity folder with non-UTF-8 name"),
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Counts from a [`normalize_tree`] run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NormalizeReport {
    pub converted: usize,
    pub failed: usize,
}

/// Re-encode every identity image under `input` as 8-bit RGB into `output`.
///
/// `input/<label>/<file>` is written to `output/<label>/<file>`, keeping the
/// file name and therefore the format. Undecodable images are logged and
/// counted; they never stop the run.
pub fn normalize_tree(input: &Path, output: &Path) -> Result<NormalizeReport, NormalizeError> {
    let identities = list_identity_dirs(input).map_err(|source| NormalizeError::ReadDir {
        path: input.to_path_buf(),
        source,
    })?;

    let mut report = NormalizeReport::default();
    for (label, dir) in identities {
        let out_dir = output.join(&label);
        fs::create_dir_all(&out_dir).map_err(|source| NormalizeError::CreateDir {
            path: out_dir.clone(),
            source,
        })?;

        let images = list_images(&dir).map_err(|source| NormalizeError::ReadDir {
            path: dir.clone(),
            source,
        })?;

        for src in images {
            let Some(name) = src.file_name() else { continue };
            let dst = out_dir.join(name);
            match image::open(&src).and_then(|img| img.to_rgb8().save(&dst)) {
                Ok(()) => {
                    tracing::info!(path = %dst.display(), "converted image");
                    report.converted += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %src.display(), error = %e, "failed to convert image");
                    report.failed += 1;
                }
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, LumaA};

    #[test]
    fn test_is_image_file() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.jpg", "b.PNG", "c.txt", ".hidden.jpg", "d.jpg.json"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.jpg")).unwrap();

        let names: Vec<String> = list_images(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG"]);
    }

    #[test]
    fn test_list_identity_dirs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zoe", "adam", ".cache"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("readme.md"), b"x").unwrap();

        let labels: Vec<String> = list_identity_dirs(dir.path())
            .unwrap()
            .into_iter()
            .map(|(l, _)| l)
            .collect();
        assert_eq!(labels, vec!["adam", "zoe"]);
    }

    #[test]
    fn test_normalize_tree_converts_to_rgb() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let person = input.path().join("alice");
        fs::create_dir(&person).unwrap();

        GrayAlphaImage::from_pixel(8, 8, LumaA([200, 128]))
            .save(person.join("one.png"))
            .unwrap();
        fs::write(person.join("broken.jpg"), b"not a jpeg").unwrap();

        let report = normalize_tree(input.path(), output.path()).unwrap();
        assert_eq!(report, NormalizeReport { converted: 1, failed: 1 });

        let converted = image::open(output.path().join("alice/one.png")).unwrap();
        assert_eq!(converted.color(), image::ColorType::Rgb8);
        assert!(!output.path().join("alice/broken.jpg").exists());
    }

    #[test]
    fn test_normalize_tree_missing_input() {
        let output = tempfile::tempdir().unwrap();
        let err = normalize_tree(Path::new("/nonexistent/input"), output.path()).unwrap_err();
        assert!(matches!(err, NormalizeError::ReadDir { .. }));
    }
}
