//! Snapshot persistence for the event store.

use crate::{DomainEvent, EventStore, OutboxError, OutboxResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Durable file holding a full snapshot of the event store.
///
/// The file is rewritten wholesale on every save. Reads and writes through
/// one `SnapshotFile` never overlap.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl SnapshotFile {
    /// Create an adapter for the snapshot at `path`. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }

    /// Get the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot.
    ///
    /// A missing or blank file is an empty snapshot. A file that is present
    /// but not a valid snapshot is a [`OutboxError::Decode`].
    pub async fn load(&self) -> OutboxResult<Vec<DomainEvent>> {
        let _guard = self.io_lock.lock().await;

        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let events: Vec<DomainEvent> = serde_json::from_slice(&bytes)?;
        Ok(events)
    }

    /// Read the snapshot, treating an undecodable file as an empty one.
    ///
    /// Any other failure is returned: the file may still hold a valid
    /// snapshot that a later checkpoint must not overwrite.
    pub async fn load_or_empty(&self) -> OutboxResult<Vec<DomainEvent>> {
        match self.load().await {
            Err(OutboxError::Decode(e)) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Discarding unreadable event cache"
                );
                Ok(Vec::new())
            }
            result => result,
        }
    }

    /// Replace the snapshot with `events`.
    pub async fn save(&self, events: &[DomainEvent]) -> OutboxResult<()> {
        let _guard = self.io_lock.lock().await;
        self.write(events).await
    }

    /// Merge the on-disk snapshot into `store`.
    ///
    /// Fails only if the file could not be read; an undecodable file restores
    /// nothing.
    pub async fn restore_into(&self, store: &EventStore) -> OutboxResult<usize> {
        let loaded = self.load_or_empty().await?;
        if loaded.is_empty() {
            return Ok(0);
        }

        let count = loaded.len();
        let inserted = store.restore(loaded).await;
        info!(loaded = count, inserted, "Restored cached events");
        Ok(inserted)
    }

    /// Save the current contents of `store`.
    ///
    /// The snapshot is taken under the file lock, so the last checkpoint to
    /// finish always holds the newest store contents.
    pub async fn checkpoint(&self, store: &EventStore) -> OutboxResult<usize> {
        let _guard = self.io_lock.lock().await;
        let snapshot = store.snapshot().await;
        self.write(&snapshot).await?;
        Ok(snapshot.len())
    }

    /// Caller holds `io_lock`.
    async fn write(&self, events: &[DomainEvent]) -> OutboxResult<()> {
        let payload =
            serde_json::to_vec(events).map_err(|e| OutboxError::Encode(e.to_string()))?;
        write_atomic(&self.path, &payload).await?;

        debug!(path = %self.path.display(), count = events.len(), "Saved event cache");
        Ok(())
    }
}

/// Write `contents` to a sibling temp file, sync it, and rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> OutboxResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            OutboxError::Filesystem(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("not a file path: {}", path.display()),
            ))
        })?;

    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir).await?;
    }

    let tmp_path = dir.join(format!(".{}.tmp.{}", file_name, Uuid::new_v4()));

    let write_result = async {
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, path).await?;

        // Best effort: persists the rename itself.
        let _ = sync_dir(dir).await;

        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }

    Ok(())
}

async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn sample_events() -> Vec<DomainEvent> {
        let mut purchase = DomainEvent::named("purchase");
        purchase
            .properties
            .insert("sku".to_string(), json!("A-100"));
        purchase
            .properties
            .insert("tags".to_string(), json!(["new", "promo"]));
        vec![DomainEvent::named("app_opened"), purchase]
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("appfit/cache.af"));

        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_creates_directory_and_roundtrips() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("appfit/cache.af"));
        let events = sample_events();

        file.save(&events).await.unwrap();
        assert!(file.path().exists());

        let loaded = file.load().await.unwrap();
        assert_eq!(loaded, events);
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_snapshot() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("cache.af"));

        file.save(&sample_events()).await.unwrap();
        file.save(&[]).await.unwrap();

        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("cache.af"));

        file.save(&sample_events()).await.unwrap();
        file.save(&sample_events()).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["cache.af".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_decode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.af");
        std::fs::write(&path, b"[{\"id\": \"truncated").unwrap();
        let file = SnapshotFile::new(path);

        assert!(matches!(file.load().await, Err(OutboxError::Decode(_))));
        assert!(file.load_or_empty().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.af");
        std::fs::write(&path, b"\n").unwrap();
        let file = SnapshotFile::new(path);

        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_format_uses_millisecond_utc() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("cache.af"));
        file.save(&sample_events()).await.unwrap();

        let raw = std::fs::read_to_string(file.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let date = value[0]["date"].as_str().unwrap();

        assert_eq!(date.len(), "2024-03-09T14:05:07.042Z".len());
        assert!(date.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("cache.af"));

        let source = EventStore::new();
        for event in sample_events() {
            source.add(event).await;
        }
        assert_eq!(file.checkpoint(&source).await.unwrap(), 2);

        let target = EventStore::new();
        assert_eq!(file.restore_into(&target).await.unwrap(), 2);
        assert_eq!(target.snapshot().await, source.snapshot().await);
    }

    #[tokio::test]
    async fn test_save_into_file_path_that_is_a_directory_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.af");
        std::fs::create_dir_all(&path).unwrap();
        let file = SnapshotFile::new(path);

        assert!(matches!(
            file.save(&sample_events()).await,
            Err(OutboxError::Filesystem(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_file_is_not_treated_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.af");
        std::fs::create_dir_all(&path).unwrap();
        let file = SnapshotFile::new(path);
        let store = EventStore::new();

        assert!(matches!(
            file.load_or_empty().await,
            Err(OutboxError::Filesystem(_))
        ));
        assert!(matches!(
            file.restore_into(&store).await,
            Err(OutboxError::Filesystem(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_checkpoint_snapshots_after_waiting_for_the_file() {
        let dir = tempdir().unwrap();
        let file = Arc::new(SnapshotFile::new(dir.path().join("cache.af")));
        let store = Arc::new(EventStore::new());
        store.add(DomainEvent::named("first")).await;

        let guard = file.io_lock.lock().await;
        let pending = {
            let file = file.clone();
            let store = store.clone();
            tokio::spawn(async move { file.checkpoint(&store).await })
        };
        tokio::task::yield_now().await;

        // Added while the checkpoint is queued behind another writer.
        let late = DomainEvent::named("late");
        store.add(late.clone()).await;
        drop(guard);

        assert_eq!(pending.await.unwrap().unwrap(), 2);
        let saved = file.load().await.unwrap();
        assert!(saved.iter().any(|event| event.id == late.id));
    }

    #[tokio::test]
    async fn test_sync_dir() {
        let dir = tempdir().unwrap();

        sync_dir(dir.path()).await.unwrap();
        assert!(sync_dir(&dir.path().join("missing")).await.is_err());
    }
}
