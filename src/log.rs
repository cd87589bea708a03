// Log core: wires the epoch manager, paged allocator, and commit
// coordinator into the public append/commit/read surface.
//
// Grounded on `transaction::wal_manager::WALManager::append`/`flush`, which
// drives the same "bump a tail, spill to a background flush task, let
// callers await a commit" shape this generalizes from a single append
// method into `TryAppend`/`TryAppendBatch`/`Commit`/`ReadAsync`.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::allocator::{PagedAllocator, ALLOCATION_FAILED, FIRST_VALID_ADDRESS};
use crate::commit::{CommitCoordinator, CommitManager, CommitMetadata, FileCommitManager};
use crate::config::LogConfig;
use crate::device::{FileDevice, LogDevice};
use crate::epoch::EpochManager;
use crate::error::{LogError, Result};
use crate::record::{self, DecodeError};

/// A durable, append-only log: lock-free concurrent appends, background
/// flush to disk, and an explicit commit protocol that persists watermarks
/// and wakes waiters once the corresponding bytes are durable.
pub struct Log {
    epoch: Arc<EpochManager>,
    allocator: Arc<PagedAllocator>,
    commit: Arc<CommitCoordinator>,
    device: Arc<dyn LogDevice>,
}

impl Log {
    /// Open (or create) a log at `config.directory`, restoring watermarks
    /// from the commit metadata blob if one is present.
    pub async fn open(config: LogConfig) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.directory)?;

        let commit_manager: Arc<dyn CommitManager> =
            Arc::new(FileCommitManager::new(config.commit_path()));
        let restored = commit_manager.get_commit_metadata()?;
        let (begin, flushed) = match restored {
            Some(bytes) => {
                let (meta, _): (CommitMetadata, usize) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| LogError::CorruptMetadata { reason: e.to_string() })?;
                (meta.begin_address as u64, meta.flushed_until_address as u64)
            }
            // A fresh log (no persisted metadata yet) starts every watermark
            // at the first valid address rather than 0, which is reserved as
            // the allocator's failure sentinel.
            None => (FIRST_VALID_ADDRESS, FIRST_VALID_ADDRESS),
        };

        let device: Arc<dyn LogDevice> = Arc::new(FileDevice::open(&config.segment_path())?);
        let epoch = EpochManager::new();
        let allocator = PagedAllocator::new(
            epoch.clone(),
            device.clone(),
            config.page_size_bits,
            config.pages_in_memory,
        );
        allocator.restore(flushed, begin);

        let commit = CommitCoordinator::new(commit_manager, flushed, begin);

        let coordinator = commit.clone();
        let allocator_weak = Arc::downgrade(&allocator);
        allocator.set_flush_callback(Arc::new(move |flushed_until: u64| {
            let coordinator = coordinator.clone();
            let begin = allocator_weak
                .upgrade()
                .map(|a| a.begin_address())
                .unwrap_or(0);
            tokio::spawn(async move {
                if let Err(e) = coordinator.on_flush(begin, flushed_until).await {
                    tracing::warn!(error = %e, "log: commit persist after flush failed");
                }
            });
        }));

        info!(begin, flushed, directory = %config.directory.display(), "log: opened");

        Ok(Arc::new(Self {
            epoch,
            allocator,
            commit,
            device,
        }))
    }

    /// Open at a directory path directly, using all other defaults.
    pub async fn open_at(directory: impl AsRef<Path>) -> Result<Arc<Self>> {
        Self::open(LogConfig {
            directory: directory.as_ref().to_path_buf(),
            ..LogConfig::default()
        })
        .await
    }

    pub fn tail_address(&self) -> u64 {
        self.allocator.tail_address()
    }

    pub fn begin_address(&self) -> u64 {
        self.allocator.begin_address()
    }

    pub fn committed_until_address(&self) -> u64 {
        self.commit.committed_until()
    }

    pub fn flushed_until_address(&self) -> u64 {
        self.allocator.flushed_until_address()
    }

    /// Attempt to append a single entry. Returns `None` if the current page
    /// is full (straddle or back-pressure); callers retry.
    pub fn try_append(&self, payload: &[u8]) -> Option<u64> {
        let _guard = self.epoch.resume();
        let framed = record::framed_len(payload.len() as u32);
        let addr = self.allocator.try_allocate(framed);
        if addr == ALLOCATION_FAILED {
            return None;
        }
        self.write_at(addr, payload);
        Some(addr)
    }

    /// Attempt to append a batch of entries as one contiguous, all-or-nothing
    /// run of records. Returns `None` if the batch can't fit in the current
    /// page; callers retry (after a `commit`/page rotation if needed).
    pub fn try_append_batch(&self, payloads: &[&[u8]]) -> Option<u64> {
        let _guard = self.epoch.resume();
        let lens: Vec<u32> = payloads.iter().map(|p| p.len() as u32).collect();
        let total = record::batch_framed_len(&lens);
        let addr = self.allocator.try_allocate(total);
        if addr == ALLOCATION_FAILED {
            return None;
        }
        let mut offset = addr;
        for payload in payloads {
            self.write_at(offset, payload);
            offset += record::framed_len(payload.len() as u32) as u64;
        }
        Some(addr)
    }

    fn write_at(&self, addr: u64, payload: &[u8]) {
        // Safety: `addr` was just handed out by `try_allocate` under the
        // epoch guard this call holds, so the backing page is resident and
        // cannot be retired until this guard drops.
        let ptr = unsafe { self.allocator.physical_address(addr) }
            .expect("try_allocate returned an address with no backing page");
        let framed = record::framed_len(payload.len() as u32) as usize;
        let dst = unsafe { std::slice::from_raw_parts_mut(ptr, framed) };
        record::encode(dst, payload);
    }

    /// Spin-retry `try_append` until it succeeds, rotating pages via
    /// `shift_read_only_to_tail` when the current page is full.
    pub fn enqueue(&self, payload: &[u8]) -> u64 {
        loop {
            if let Some(addr) = self.try_append(payload) {
                return addr;
            }
            self.allocator.shift_read_only_to_tail();
            std::thread::yield_now();
        }
    }

    /// Async variant of `enqueue`: waits on commit-channel wakeups instead of
    /// spinning when the page is full and the ring is under back-pressure.
    pub async fn enqueue_async(&self, payload: &[u8]) -> Result<u64> {
        loop {
            let mut rx = self.commit.subscribe();
            if self.commit.is_disposed() {
                return Err(LogError::Disposed);
            }
            if let Some(addr) = self.try_append(payload) {
                return Ok(addr);
            }
            self.allocator.shift_read_only_to_tail();
            // A full ring (every page un-retired) only drains once a reader's
            // truncate or a commit's retirement pass frees a slot; re-check
            // after each wakeup rather than busy-spinning.
            let _ = tokio::time::timeout(std::time::Duration::from_millis(5), rx.changed()).await;
            if self.commit.is_disposed() {
                return Err(LogError::Disposed);
            }
        }
    }

    /// Force the current read-only suffix to flush and, if nothing needed
    /// flushing (only `BeginAddress` moved, say), persist watermarks anyway.
    pub async fn commit(&self) -> Result<()> {
        let (shifted, _tail) = self.allocator.shift_read_only_to_tail();
        if !shifted {
            let begin = self.allocator.begin_address();
            let until = self.commit.committed_until();
            self.commit.on_flush(begin, until).await?;
        }
        Ok(())
    }

    /// Wait until `until` (default: the tail at call time) is committed.
    pub async fn wait_for_commit(&self, until: u64) -> Result<()> {
        let target = if until == 0 {
            self.allocator.tail_address()
        } else {
            until
        };
        loop {
            let mut rx = self.commit.subscribe();
            if self.commit.committed_until() >= target {
                return Ok(());
            }
            if self.commit.is_disposed() {
                return Err(LogError::Disposed);
            }
            rx.changed().await.map_err(|_| LogError::Disposed)?;
        }
    }

    /// Append then wait for that entry's address to be committed.
    pub async fn enqueue_and_wait_for_commit(&self, payload: &[u8]) -> Result<u64> {
        let addr = self.enqueue_async(payload).await?;
        self.commit().await?;
        self.wait_for_commit(addr + record::framed_len(payload.len() as u32) as u64)
            .await?;
        Ok(addr)
    }

    /// Read the record at `address`. Returns `Ok(None)` if `address` is
    /// outside `[BeginAddress, CommittedUntilAddress)`.
    pub async fn read_async(&self, address: u64) -> Result<Option<Vec<u8>>> {
        let begin = self.allocator.begin_address();
        let committed_until = self.commit.committed_until();
        if address < begin || address >= committed_until {
            return Ok(None);
        }

        let page_size = self.allocator.page_size();
        let mut estimate = 256usize.min(page_size as usize);
        loop {
            let mut buf = vec![0u8; estimate];
            let n = self.device.read_at(address, &mut buf)?;
            buf.truncate(n);

            let max_len = page_size as u32;
            match record::read_length_prefix(&buf, max_len) {
                Ok(len) => match record::decode_payload(&buf, len) {
                    Ok(payload) => return Ok(Some(payload.to_vec())),
                    Err(DecodeError::Underrun) => {
                        estimate = record::framed_len(len) as usize;
                        continue;
                    }
                    Err(DecodeError::CorruptLength(raw)) => {
                        return Err(LogError::CorruptRecord { address, length: raw });
                    }
                },
                Err(DecodeError::Underrun) => {
                    estimate *= 2;
                    continue;
                }
                Err(DecodeError::CorruptLength(raw)) => {
                    return Err(LogError::CorruptRecord { address, length: raw });
                }
            }
        }
    }

    /// Raise `BeginAddress`, permanently discarding read access below it.
    /// Persists the new watermark immediately rather than waiting for the
    /// next flush.
    pub async fn truncate_until(&self, address: u64) -> Result<()> {
        self.allocator.shift_begin_address(address);
        let until = self.commit.committed_until();
        self.commit.on_flush(address, until).await
    }

    /// Stop accepting new work and wake every pending waiter with a
    /// terminal error.
    pub fn dispose(&self) {
        self.commit.dispose();
    }

    /// Scan committed records from `begin` up to `end` (or, if `None`, up to
    /// `CommittedUntilAddress` as observed on each step). `begin` is clamped
    /// up to the log's current `BeginAddress` — scanning "from the start"
    /// means from the oldest address actually readable, not from 0.
    pub fn scan(self: &Arc<Self>, begin: u64, end: Option<u64>) -> crate::scan::LogScanIterator {
        let begin = begin.max(self.allocator.begin_address());
        crate::scan::LogScanIterator::new(self.clone(), begin, end)
    }
}
