//! Study thumbnails: rendered by the archive on demand, kept on local disk,
//! and memoized in an in-process cache. A missing or failed thumbnail
//! degrades the hit, never the search.

use std::path::PathBuf;
use std::sync::Arc;

use moka::future::Cache;
use tracing::{debug, warn};

use crate::archive::ArchiveClient;

const CACHE_CAPACITY: u64 = 10_000;

/// Resolves a study UID to a thumbnail path, rendering through the archive
/// on a cache miss. Cache entries are validated against the filesystem so
/// an externally deleted file triggers a re-render instead of a dead link.
#[derive(Clone)]
pub struct ThumbnailResolver {
    archive: Arc<dyn ArchiveClient>,
    cache: Cache<String, PathBuf>,
    dir: PathBuf,
}

impl ThumbnailResolver {
    pub fn new(archive: Arc<dyn ArchiveClient>, dir: PathBuf) -> Self {
        Self {
            archive,
            cache: Cache::new(CACHE_CAPACITY),
            dir,
        }
    }

    pub async fn resolve(&self, study_uid: &str) -> Option<String> {
        if let Some(path) = self.cache.get(study_uid).await {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path.to_string_lossy().into_owned());
            }
            debug!(%study_uid, "cached thumbnail vanished from disk, re-rendering");
            self.cache.invalidate(study_uid).await;
        }

        if let Err(err) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(%study_uid, error = %err, "cannot create thumbnail directory");
            return None;
        }
        match self.archive.render_thumbnail(study_uid, &self.dir).await {
            Ok(path) => {
                self.cache
                    .insert(study_uid.to_string(), path.clone())
                    .await;
                Some(path.to_string_lossy().into_owned())
            }
            Err(err) => {
                warn!(%study_uid, error = %err, "thumbnail render failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockArchive;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn renders_once_then_serves_from_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 1)]));
        let resolver = ThumbnailResolver::new(Arc::clone(&archive) as _, dir.path().to_path_buf());

        let first = resolver.resolve("S1").await.expect("rendered");
        assert!(first.ends_with("S1.jpg"));
        let second = resolver.resolve("S1").await.expect("cached");
        assert_eq!(first, second);
        assert_eq!(archive.render_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_deleted_file_invalidates_the_cache_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 1)]));
        let resolver = ThumbnailResolver::new(Arc::clone(&archive) as _, dir.path().to_path_buf());

        let path = resolver.resolve("S1").await.expect("rendered");
        tokio::fs::remove_file(&path).await.expect("delete");

        resolver.resolve("S1").await.expect("re-rendered");
        assert_eq!(archive.render_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn render_failures_degrade_to_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let archive = Arc::new(MockArchive::with_study("S1", &[("SE1", 1)]));
        archive.fail_render();
        let resolver = ThumbnailResolver::new(Arc::clone(&archive) as _, dir.path().to_path_buf());

        assert!(resolver.resolve("S1").await.is_none());
    }
}
