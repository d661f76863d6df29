//! Staging of message files on the local filesystem

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use super::FileStager;

/// Recursive copy into the staging area.
///
/// Existing files at the destination are overwritten. A failed copy leaves
/// whatever was already written in place.
#[derive(Debug, Clone, Default)]
pub struct LocalFileStager {
    source_root: Option<PathBuf>,
}

impl LocalFileStager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative message paths against `root`
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    fn resolve(&self, source: &Path) -> PathBuf {
        match &self.source_root {
            Some(root) if source.is_relative() => root.join(source),
            _ => source.to_path_buf(),
        }
    }
}

#[async_trait]
impl FileStager for LocalFileStager {
    async fn stage(&self, source: &Path, target_dir: &Path) -> Result<PathBuf> {
        let source = self.resolve(source);
        let target_dir = target_dir.to_path_buf();

        tokio::task::spawn_blocking(move || copy_into(&source, &target_dir))
            .await
            .context("Copy task panicked")?
    }

    async fn stage_entry(&self, source: &Path, target_dir: &Path) -> Result<PathBuf> {
        let source = self.resolve(source);
        let target_dir = target_dir.to_path_buf();

        tokio::task::spawn_blocking(move || {
            if source.is_dir() {
                let name = source
                    .file_name()
                    .with_context(|| format!("Source {} has no file name", source.display()))?;
                copy_into(&source, &target_dir.join(name))
            } else {
                copy_into(&source, &target_dir)
            }
        })
        .await
        .context("Copy task panicked")?
    }
}

fn copy_into(source: &Path, target_dir: &Path) -> Result<PathBuf> {
    let meta = std::fs::metadata(source)
        .with_context(|| format!("Source {} is not accessible", source.display()))?;

    std::fs::create_dir_all(target_dir)
        .with_context(|| format!("Failed to create {}", target_dir.display()))?;

    if meta.is_file() {
        let name = source
            .file_name()
            .with_context(|| format!("Source {} has no file name", source.display()))?;
        let dest = target_dir.join(name);
        std::fs::copy(source, &dest).with_context(|| {
            format!("Failed to copy {} to {}", source.display(), dest.display())
        })?;
        debug!(from = %source.display(), to = %dest.display(), "Staged file");
        return Ok(dest);
    }

    let mut copied = 0usize;
    for entry in WalkDir::new(source).min_depth(1).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let relative = entry.path().strip_prefix(source)?;
        let dest = target_dir.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), dest.display())
            })?;
            copied += 1;
        }
    }

    debug!(from = %source.display(), to = %target_dir.display(), files = copied, "Staged directory");
    Ok(target_dir.to_path_buf())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_single_file() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let file = src.path().join("elevation.tif");
        std::fs::write(&file, b"raster").unwrap();

        let target = dst.path().join("r2");
        let staged = LocalFileStager::new().stage(&file, &target).await.unwrap();

        assert_eq!(staged, target.join("elevation.tif"));
        assert_eq!(std::fs::read(&staged).unwrap(), b"raster");
    }

    #[tokio::test]
    async fn test_stage_directory_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("shapes/rivers")).unwrap();
        std::fs::write(src.path().join("readme.txt"), "hello").unwrap();
        std::fs::write(src.path().join("shapes/rivers/rivers.shp"), "shp").unwrap();

        let target = dst.path().join("r3");
        let staged = LocalFileStager::new().stage(src.path(), &target).await.unwrap();

        assert_eq!(staged, target);
        assert!(target.join("readme.txt").is_file());
        assert_eq!(
            std::fs::read_to_string(target.join("shapes/rivers/rivers.shp")).unwrap(),
            "shp"
        );
    }

    #[tokio::test]
    async fn test_stage_entry_keeps_directory_subtree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("tiles")).unwrap();
        std::fs::write(src.path().join("tiles/a.tif"), "a").unwrap();
        std::fs::write(src.path().join("notes.txt"), "n").unwrap();

        let stager = LocalFileStager::new();
        let target = dst.path().join("rl");
        let tiles = stager.stage_entry(&src.path().join("tiles"), &target).await.unwrap();
        let notes = stager.stage_entry(&src.path().join("notes.txt"), &target).await.unwrap();

        assert_eq!(tiles, target.join("tiles"));
        assert!(target.join("tiles/a.tif").is_file());
        assert!(!target.join("a.tif").exists());
        assert_eq!(notes, target.join("notes.txt"));
    }

    #[tokio::test]
    async fn test_relative_source_uses_root() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.csv"), "x,y").unwrap();

        let stager = LocalFileStager::new().with_source_root(src.path());
        let staged = stager.stage(Path::new("a.csv"), dst.path()).await.unwrap();
        assert_eq!(staged, dst.path().join("a.csv"));
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let dst = tempfile::tempdir().unwrap();
        let err = LocalFileStager::new()
            .stage(Path::new("/no/such/source.tif"), dst.path())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("/no/such/source.tif"));
    }
}
