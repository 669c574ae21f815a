use std::path::PathBuf;
use tracing::debug;
use walkdir::WalkDir;

use super::{MediaItem, MediaSource};
use crate::config::MediaConfig;
use crate::error::{GraphError, Result};

/// Media universe built by walking directories for known extensions.
#[derive(Debug, Clone)]
pub struct DirectoryMediaSource {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
}

impl DirectoryMediaSource {
    pub fn new(roots: Vec<PathBuf>, extensions: &[String]) -> Self {
        Self {
            roots,
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(config.roots.clone(), &config.image_extensions)
    }

    fn matches(&self, path: &std::path::Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }
}

impl MediaSource for DirectoryMediaSource {
    fn media(&self) -> Result<Vec<MediaItem>> {
        let mut paths = Vec::new();

        for root in &self.roots {
            if !root.is_dir() {
                return Err(GraphError::Media(format!(
                    "media root {} is not a directory",
                    root.display()
                )));
            }
            for entry in WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if path.is_file() && self.matches(path) {
                    paths.push(path.to_string_lossy().to_string());
                }
            }
        }

        // Sort by path for consistent ordering and stable ids
        paths.sort();
        paths.dedup();
        debug!(count = paths.len(), "Discovered media");

        Ok(paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| MediaItem::new(path, i as i64 + 1))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    #[test]
    fn test_discover_media() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();

        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();

        let extensions = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];
        let source = DirectoryMediaSource::new(vec![dir.path().to_path_buf()], &extensions);
        let media = source.media().unwrap();

        assert_eq!(media.len(), 3);
        assert_eq!(media[0].id, 1);
        assert!(media.iter().all(|m| !m.path.ends_with(".txt")));
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = tempdir().unwrap();
        let source = DirectoryMediaSource::new(vec![dir.path().join("gone")], &["jpg".to_string()]);
        assert!(matches!(source.media(), Err(GraphError::Media(_))));
    }
}
