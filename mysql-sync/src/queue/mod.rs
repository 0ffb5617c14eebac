//! A file-backed ordered sequence of JSON-serializable records. The
//! entire file is rewritten on every mutation, via write-to-temp-then-
//! rename so a crash mid-write never leaves a truncated or partially
//! written queue file behind.

pub mod error;

use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex as SyncMutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;

pub use error::Error;

/// One logical queue, persisted as a single JSON file.
///
/// Mutations are serialized per queue via an internal async mutex so a
/// concurrent `push` and `poll` on the same instance (e.g. shared via
/// `Arc`) cannot interleave and lose items.
pub struct FileQueue<T> {
    path: PathBuf,
    items: SyncMutex<Vec<T>>,
    write_lock: AsyncMutex<()>,
}

impl<T> fmt::Debug for FileQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileQueue").field("path", &self.path).finish()
    }
}

impl<T> FileQueue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (or create) the queue backed by `path`, loading any
    /// previously persisted contents.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        let items = match fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                serde_json::from_slice(&bytes).map_err(|e| Error::Serde(path.clone(), e))?
            }
            Ok(_) => Vec::new(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(Error::Io(path, err)),
        };

        Ok(Self {
            path,
            items: SyncMutex::new(items),
            write_lock: AsyncMutex::new(()),
        })
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> Result<R, Error> {
        let _guard = self.write_lock.lock().await;

        let result = {
            let mut items = self.items.lock();
            f(&mut items)
        };

        self.persist().await?;
        Ok(result)
    }

    async fn persist(&self) -> Result<(), Error> {
        let snapshot = self.items.lock().clone();
        let encoded = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| Error::Serde(self.path.clone(), e))?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &encoded)
            .await
            .map_err(|e| Error::Io(tmp_path.clone(), e))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| Error::Io(self.path.clone(), e))?;

        Ok(())
    }

    /// Append `item`; resolves once the queue file reflects the write.
    pub async fn push(&self, item: T) -> Result<(), Error> {
        self.mutate(|items| items.push(item)).await
    }

    /// Remove and return the head of the queue, or `None` if empty.
    pub async fn poll(&self) -> Result<Option<T>, Error> {
        self.mutate(|items| {
            if items.is_empty() {
                None
            } else {
                Some(items.remove(0))
            }
        })
        .await
    }

    /// Remove every item matching `predicate`, returning the removed
    /// items in their original order.
    pub async fn delete(&self, mut predicate: impl FnMut(&T) -> bool) -> Result<Vec<T>, Error> {
        self.mutate(|items| {
            let mut removed = Vec::new();
            let mut kept = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                if predicate(&item) {
                    removed.push(item);
                } else {
                    kept.push(item);
                }
            }
            *items = kept;
            removed
        })
        .await
    }

    /// Return every item matching `predicate` without removing it.
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        self.items
            .lock()
            .iter()
            .filter(|item| predicate(item))
            .cloned()
            .collect()
    }

    /// Current contents, without blocking on the write lock.
    pub fn snapshot_sync(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    #[tokio::test]
    async fn push_then_poll_is_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let queue: FileQueue<Item> = FileQueue::open(dir.path().join("q.json")).await.unwrap();

        queue.push(Item { id: 1 }).await.unwrap();
        queue.push(Item { id: 2 }).await.unwrap();

        assert_eq!(queue.poll().await.unwrap(), Some(Item { id: 1 }));
        assert_eq!(queue.poll().await.unwrap(), Some(Item { id: 2 }));
        assert_eq!(queue.poll().await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_removes_matching_and_returns_them() {
        let dir = tempfile::tempdir().unwrap();
        let queue: FileQueue<Item> = FileQueue::open(dir.path().join("q.json")).await.unwrap();

        for id in 0..5 {
            queue.push(Item { id }).await.unwrap();
        }

        let removed = queue.delete(|item| item.id % 2 == 0).await.unwrap();
        assert_eq!(removed, vec![Item { id: 0 }, Item { id: 2 }, Item { id: 4 }]);
        assert_eq!(queue.find(|_| true).len(), 2);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");

        {
            let queue: FileQueue<Item> = FileQueue::open(&path).await.unwrap();
            queue.push(Item { id: 42 }).await.unwrap();
        }

        let reopened: FileQueue<Item> = FileQueue::open(&path).await.unwrap();
        assert_eq!(reopened.snapshot_sync(), vec![Item { id: 42 }]);
    }

    #[tokio::test]
    async fn concurrent_push_and_poll_does_not_lose_items() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(
            FileQueue::<Item>::open(dir.path().join("q.json"))
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for id in 0..50 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.push(Item { id }).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(queue.find(|_| true).len(), 50);
    }
}
