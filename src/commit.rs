// Commit coordinator: serializes commit metadata writes, advances the
// committed watermarks, and broadcasts completion to waiters.
//
// Grounded on `transaction::wal_manager::WALManager`'s group-commit buffer
// (a `Vec<oneshot::Sender<...>>` woken together on flush) for the
// "producers subscribe, a commit wakes them all" shape, but built on
// `tokio::sync::watch` instead of per-waiter `oneshot` channels: a `watch`
// receiver cloned before the race and then `.changed().await`'d after is
// exactly the "load the future before the action you'll await on"
// subscribe-before-check rule, for an unbounded number of concurrent
// subscribers, which single-consumer `oneshot` channels can't express
// without a `Vec` of senders to manage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::info;

use crate::error::{LogError, Result};

/// `{BeginAddress, FlushedUntilAddress}` as persisted on each commit.
/// The commit manager is responsible for the bytes on disk; this is the
/// logical content those bytes encode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitMetadata {
    pub begin_address: i64,
    pub flushed_until_address: i64,
}

/// Durable storage for the commit metadata blob.
pub trait CommitManager: Send + Sync {
    fn commit(&self, begin_address: i64, flushed_until_address: i64, metadata: &[u8]) -> Result<()>;
    fn get_commit_metadata(&self) -> Result<Option<Vec<u8>>>;
}

/// Single-file commit manager. The blob is `bincode(CommitMetadata) ||
/// crc32(bincode bytes)`, written via a temp-file-then-rename so a crash
/// mid-write leaves the previous commit intact rather than a torn file.
pub struct FileCommitManager {
    path: std::path::PathBuf,
}

impl FileCommitManager {
    pub fn new(path: std::path::PathBuf) -> Self {
        Self { path }
    }
}

impl CommitManager for FileCommitManager {
    fn commit(&self, _begin_address: i64, _flushed_until_address: i64, metadata: &[u8]) -> Result<()> {
        let checksum = crc32fast::hash(metadata);
        let mut blob = Vec::with_capacity(metadata.len() + 4);
        blob.extend_from_slice(metadata);
        blob.extend_from_slice(&checksum.to_le_bytes());

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &blob)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn get_commit_metadata(&self) -> Result<Option<Vec<u8>>> {
        let blob = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if blob.len() < 4 {
            return Ok(None);
        }
        let (metadata, checksum_bytes) = blob.split_at(blob.len() - 4);
        let expected = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
        if crc32fast::hash(metadata) != expected {
            // A torn or corrupt write is treated as "no metadata": the log
            // begins fresh rather than trusting a blob that failed its
            // checksum.
            return Ok(None);
        }
        Ok(Some(metadata.to_vec()))
    }
}

pub struct CommitCoordinator {
    committed_begin: AtomicU64,
    committed_until: AtomicU64,
    disposed: AtomicBool,
    write_lock: AsyncMutex<()>,
    tx: watch::Sender<u64>,
    manager: Arc<dyn CommitManager>,
}

impl CommitCoordinator {
    pub fn new(manager: Arc<dyn CommitManager>, committed_until: u64, committed_begin: u64) -> Arc<Self> {
        let (tx, _rx) = watch::channel(committed_until);
        Arc::new(Self {
            committed_begin: AtomicU64::new(committed_begin),
            committed_until: AtomicU64::new(committed_until),
            disposed: AtomicBool::new(false),
            write_lock: AsyncMutex::new(()),
            tx,
            manager,
        })
    }

    pub fn committed_begin(&self) -> u64 {
        self.committed_begin.load(Ordering::Acquire)
    }

    pub fn committed_until(&self) -> u64 {
        self.committed_until.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Subscribe to commit notifications. Callers must subscribe *before*
    /// performing the action whose failure they will wait on (the
    /// "subscribe-before-check" rule) — a receiver cloned here observes every
    /// `send` issued after this call, including one racing the caller's next
    /// step.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    /// The commit callback: invoked by the allocator on each flush
    /// completion, and directly by `Log::commit` to force a metadata write
    /// when only `BeginAddress` advanced.
    pub async fn on_flush(&self, begin_address: u64, flush_address: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let cur_begin = self.committed_begin.load(Ordering::Acquire);
        let cur_until = self.committed_until.load(Ordering::Acquire);
        if begin_address <= cur_begin && flush_address <= cur_until {
            return Ok(()); // idempotent no-op: nothing advanced
        }

        let new_until = flush_address.max(cur_until);
        // Clamp so an out-of-range `TruncateUntil(x)` (x > CommittedUntilAddress)
        // can never publish CommittedBeginAddress > CommittedUntilAddress.
        let new_begin = begin_address.max(cur_begin).min(new_until);
        let info = CommitMetadata {
            begin_address: new_begin as i64,
            flushed_until_address: new_until as i64,
        };
        let bytes = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| LogError::CorruptMetadata { reason: e.to_string() })?;

        let manager = self.manager.clone();
        let begin_i64 = info.begin_address;
        let until_i64 = info.flushed_until_address;
        tokio::task::spawn_blocking(move || manager.commit(begin_i64, until_i64, &bytes))
            .await
            .map_err(|e| LogError::DeviceFailure(e.to_string()))??;

        self.committed_begin.store(new_begin, Ordering::Release);
        self.committed_until.store(new_until, Ordering::Release);
        drop(_guard);

        info!(begin = new_begin, until = new_until, "commit: watermarks advanced");
        let _ = self.tx.send(new_until);
        Ok(())
    }

    /// Complete all outstanding waiters with a terminal error and refuse
    /// future commits. Waiters check `is_disposed()` after waking (the
    /// `watch` channel itself carries no error variant).
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        let until = self.committed_until.load(Ordering::Acquire);
        let _ = self.tx.send(until);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct InMemoryCommitManager {
        blob: parking_lot::Mutex<Option<Vec<u8>>>,
    }

    impl InMemoryCommitManager {
        fn new() -> Self {
            Self {
                blob: parking_lot::Mutex::new(None),
            }
        }
    }

    impl CommitManager for InMemoryCommitManager {
        fn commit(&self, _b: i64, _f: i64, metadata: &[u8]) -> Result<()> {
            *self.blob.lock() = Some(metadata.to_vec());
            Ok(())
        }

        fn get_commit_metadata(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.blob.lock().clone())
        }
    }

    #[tokio::test]
    async fn on_flush_advances_watermarks_and_wakes_subscriber() {
        let manager = Arc::new(InMemoryCommitManager::new());
        let coordinator = CommitCoordinator::new(manager, 0, 0);
        let mut rx = coordinator.subscribe();

        coordinator.on_flush(0, 128).await.unwrap();
        assert_eq!(coordinator.committed_until(), 128);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 128);
    }

    #[tokio::test]
    async fn stale_flush_does_not_regress_watermark() {
        let manager = Arc::new(InMemoryCommitManager::new());
        let coordinator = CommitCoordinator::new(manager, 0, 0);
        coordinator.on_flush(0, 200).await.unwrap();
        coordinator.on_flush(0, 50).await.unwrap(); // stale/out-of-order
        assert_eq!(coordinator.committed_until(), 200);
    }

    #[tokio::test]
    async fn truncate_beyond_committed_until_does_not_cross_it() {
        let manager = Arc::new(InMemoryCommitManager::new());
        let coordinator = CommitCoordinator::new(manager, 100, 0);
        // A begin_address past the currently committed until (e.g. a racing
        // TruncateUntil that outran the last flush) must clamp, never
        // publish CommittedBeginAddress > CommittedUntilAddress.
        coordinator.on_flush(500, 100).await.unwrap();
        assert!(coordinator.committed_begin() <= coordinator.committed_until());
        assert_eq!(coordinator.committed_begin(), 100);
        assert_eq!(coordinator.committed_until(), 100);
    }

    #[tokio::test]
    async fn dispose_wakes_subscribers_with_terminal_state() {
        let manager = Arc::new(InMemoryCommitManager::new());
        let coordinator = CommitCoordinator::new(manager, 0, 0);
        let mut rx = coordinator.subscribe();
        coordinator.dispose();
        rx.changed().await.unwrap();
        assert!(coordinator.is_disposed());
    }

    #[test]
    fn file_commit_manager_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileCommitManager::new(dir.path().join("commit"));
        assert!(manager.get_commit_metadata().unwrap().is_none());

        let info = CommitMetadata {
            begin_address: 10,
            flushed_until_address: 200,
        };
        let bytes = bincode::serde::encode_to_vec(info, bincode::config::standard()).unwrap();
        manager.commit(10, 200, &bytes).unwrap();

        let read_back = manager.get_commit_metadata().unwrap().unwrap();
        let (decoded, _): (CommitMetadata, usize) =
            bincode::serde::decode_from_slice(&read_back, bincode::config::standard()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn corrupt_commit_blob_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commit");
        std::fs::write(&path, b"not a valid commit blob!!").unwrap();
        let manager = FileCommitManager::new(path);
        assert!(manager.get_commit_metadata().unwrap().is_none());
    }
}
