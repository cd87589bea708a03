// Paged allocator: a ring of fixed-size, lazily-allocated pages mapped onto
// the logical address space, with a bump-pointer tail, background flush to a
// `LogDevice`, and epoch-deferred page retirement.
//
// Grounded on the bump-pointer chunk allocation in
// `memory::allocator::arena_allocator::ArenaChunk` (offset bump, boundary
// check, lazy chunk creation) combined with the `Arc<Mutex<...>>`-guarded
// file handle and threshold-triggered flush in
// `transaction::wal_manager::WALManager`. The allocator owns the page
// lifecycle and the background flush; the log core only sees the logical
// address space this produces.

use std::collections::BTreeMap;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::LogDevice;
use crate::epoch::EpochManager;
use crate::error::Result;

/// The lowest address a record can ever occupy. Address 0 is reserved for
/// the `ALLOCATION_FAILED` sentinel, so every watermark (`tail`, `read_only`,
/// `flushed_until`, `begin`) starts here instead of at 0 — mirroring
/// FASTER's `kFirstValidAddress`.
pub const FIRST_VALID_ADDRESS: u64 = 8;

/// Sentinel returned by `try_allocate` on failure. Never a valid address:
/// every watermark starts at `FIRST_VALID_ADDRESS`, so a handed-out address
/// can never equal 0.
pub const ALLOCATION_FAILED: u64 = 0;

/// Callback invoked with the new `FlushedUntilAddress` each time a
/// contiguous run of pages finishes flushing to the device.
pub type FlushCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PageState {
    Empty = 0,
    Open = 1,
    Closed = 2,
    Flushing = 3,
    Flushed = 4,
}

impl PageState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PageState::Empty,
            1 => PageState::Open,
            2 => PageState::Closed,
            3 => PageState::Flushing,
            _ => PageState::Flushed,
        }
    }
}

struct PageSlot {
    /// Logical page index currently occupying this ring slot, or `u64::MAX`
    /// while empty.
    page_index: AtomicU64,
    state: AtomicU8,
    buf: AtomicPtr<u8>,
}

impl PageSlot {
    fn new() -> Self {
        Self {
            page_index: AtomicU64::new(u64::MAX),
            state: AtomicU8::new(PageState::Empty as u8),
            buf: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Tracks out-of-order page flush completions so `FlushedUntilAddress` only
/// advances over a contiguous prefix, even when pages finish flushing out of
/// the order they were closed in.
struct FlushTracker {
    next_start: u64,
    completed: BTreeMap<u64, u64>,
}

pub struct PagedAllocator {
    epoch: Arc<EpochManager>,
    device: Arc<dyn LogDevice>,
    page_size: u64,
    page_bits: u8,
    num_pages: usize,
    pages: Vec<PageSlot>,
    tail: AtomicU64,
    begin: AtomicU64,
    read_only: AtomicU64,
    flushed_until: AtomicU64,
    /// How far flushed page memory has been reclaimed back into the ring.
    /// Distinct from `begin`: `begin` gates logical read *visibility*
    /// (`TruncateUntil`) while `head` gates in-memory page *residency*.
    /// A page is eligible for reuse as soon as it's flushed, regardless of
    /// whether `begin` has advanced past it, since reads are always served
    /// from the device, never from a resident page.
    head: AtomicU64,
    flush_tracker: Mutex<FlushTracker>,
    flush_callback: Mutex<Option<FlushCallback>>,
    runtime: tokio::runtime::Handle,
}

impl PagedAllocator {
    pub fn new(
        epoch: Arc<EpochManager>,
        device: Arc<dyn LogDevice>,
        page_bits: u8,
        num_pages: usize,
    ) -> Arc<Self> {
        let page_size = 1u64 << page_bits;
        Arc::new(Self {
            epoch,
            device,
            page_size,
            page_bits,
            num_pages,
            pages: (0..num_pages).map(|_| PageSlot::new()).collect(),
            tail: AtomicU64::new(FIRST_VALID_ADDRESS),
            begin: AtomicU64::new(FIRST_VALID_ADDRESS),
            read_only: AtomicU64::new(FIRST_VALID_ADDRESS),
            flushed_until: AtomicU64::new(FIRST_VALID_ADDRESS),
            head: AtomicU64::new(FIRST_VALID_ADDRESS),
            flush_tracker: Mutex::new(FlushTracker {
                next_start: FIRST_VALID_ADDRESS,
                completed: BTreeMap::new(),
            }),
            flush_callback: Mutex::new(None),
            runtime: tokio::runtime::Handle::current(),
        })
    }

    pub fn set_flush_callback(&self, cb: FlushCallback) {
        *self.flush_callback.lock() = Some(cb);
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn tail_address(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    pub fn begin_address(&self) -> u64 {
        self.begin.load(Ordering::Acquire)
    }

    pub fn flushed_until_address(&self) -> u64 {
        self.flushed_until.load(Ordering::Acquire)
    }

    #[inline]
    fn page_of(&self, addr: u64) -> u64 {
        addr >> self.page_bits
    }

    #[inline]
    fn page_start(&self, page_index: u64) -> u64 {
        page_index << self.page_bits
    }

    #[inline]
    fn slot_index(&self, page_index: u64) -> usize {
        (page_index as usize) % self.num_pages
    }

    /// Bump the tail by `n` aligned bytes. Returns `ALLOCATION_FAILED` if the
    /// request would straddle a page, the target page isn't available yet,
    /// or the ring is full of un-retired pages (back-pressure).
    pub fn try_allocate(self: &Arc<Self>, n: u32) -> u64 {
        loop {
            let old_tail = self.tail.load(Ordering::Acquire);
            let new_tail = old_tail + n as u64;
            let start_page = self.page_of(old_tail);
            let end_page = self.page_of(new_tail.saturating_sub(1));

            if start_page != end_page {
                // Straddles a page boundary: waste the remainder of the
                // current page and force it closed so the flusher drains it,
                // then let the caller retry from the next page-aligned
                // address.
                let boundary = self.page_start(start_page + 1);
                if self
                    .tail
                    .compare_exchange(old_tail, boundary, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.close_page(start_page);
                }
                return ALLOCATION_FAILED;
            }

            let slot_idx = self.slot_index(start_page);
            let slot = &self.pages[slot_idx];
            let existing = slot.page_index.load(Ordering::Acquire);

            if existing != start_page {
                if existing != u64::MAX {
                    // Ring slot still occupied by an older, un-retired page.
                    return ALLOCATION_FAILED;
                }
                // Lazily materialize this page. Race losers just retry.
                let layout_len = self.page_size as usize;
                let buf = vec![0u8; layout_len].into_boxed_slice();
                let raw = Box::into_raw(buf) as *mut u8;
                match slot.page_index.compare_exchange(
                    u64::MAX,
                    start_page,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        slot.buf.store(raw, Ordering::Release);
                        slot.state.store(PageState::Open as u8, Ordering::Release);
                        debug!(page = start_page, "allocator: opened new page");
                    }
                    Err(_) => {
                        // Someone else opened it first; drop our spare buffer.
                        unsafe {
                            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                                raw, layout_len,
                            )));
                        }
                        continue;
                    }
                }
            } else if slot.state() != PageState::Open {
                // Same page index but already closed/flushing/flushed — the
                // tail hasn't moved on yet even though the page stopped
                // accepting writes; back off.
                return ALLOCATION_FAILED;
            }

            if self
                .tail
                .compare_exchange(old_tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return old_tail;
            }
            // Lost the race for the tail; retry from scratch.
        }
    }

    /// Pointer to the byte at `addr` inside its backing page. Only valid
    /// while the caller is resumed in the epoch manager, and only meaningful
    /// for addresses in a page this allocator itself just handed out (the
    /// write path uses it immediately after a successful `try_allocate`).
    ///
    /// # Safety
    /// The caller must hold an active epoch guard and must not retain the
    /// pointer past it.
    pub unsafe fn physical_address(&self, addr: u64) -> Option<*mut u8> {
        let page_index = self.page_of(addr);
        let slot = &self.pages[self.slot_index(page_index)];
        if slot.page_index.load(Ordering::Acquire) != page_index {
            return None;
        }
        let base = slot.buf.load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        let offset = addr - self.page_start(page_index);
        Some(base.add(offset as usize))
    }

    /// Close the currently open suffix so the flusher drains it. Returns
    /// whether anything was shifted and the tail at the moment of the shift.
    pub fn shift_read_only_to_tail(self: &Arc<Self>) -> (bool, u64) {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let cur_ro = self.read_only.load(Ordering::Acquire);
            if tail <= cur_ro {
                return (false, tail);
            }
            if self
                .read_only
                .compare_exchange(cur_ro, tail, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let start_page = self.page_of(cur_ro);
                let end_page = self.page_of(tail.saturating_sub(1));
                for p in start_page..=end_page {
                    self.close_page(p);
                }
                return (true, tail);
            }
        }
    }

    /// Raise the logical begin address: addresses below it stop being
    /// readable (`TruncateUntil`). Memory reclamation is independent of this
    /// — see `head` — since a page's bytes are durable and device-readable
    /// the moment it flushes, whether or not the log's visible begin has
    /// caught up to it.
    pub fn shift_begin_address(self: &Arc<Self>, addr: u64) {
        let mut cur = self.begin.load(Ordering::Acquire);
        while addr > cur {
            match self.begin.compare_exchange(
                cur,
                addr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Reconstitute allocator state on open: future allocations continue
    /// from `flushed`, with `begin` as the logical begin. The first resident
    /// in-memory page is implicit here since pages are materialized lazily
    /// on first touch.
    pub fn restore(&self, flushed: u64, begin: u64) {
        self.tail.store(flushed, Ordering::Release);
        self.read_only.store(flushed, Ordering::Release);
        self.flushed_until.store(flushed, Ordering::Release);
        self.head.store(flushed, Ordering::Release);
        self.begin.store(begin, Ordering::Release);
        self.flush_tracker.lock().next_start = flushed;
    }

    fn close_page(self: &Arc<Self>, page_index: u64) {
        let slot_idx = self.slot_index(page_index);
        let slot = &self.pages[slot_idx];
        if slot.page_index.load(Ordering::Acquire) != page_index {
            return;
        }
        if slot
            .state
            .compare_exchange(
                PageState::Open as u8,
                PageState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return; // already closed/flushing by a racing caller
        }
        self.spawn_flush(page_index);
    }

    fn spawn_flush(self: &std::sync::Arc<Self>, page_index: u64) {
        let this = self.clone();
        self.runtime.spawn(async move {
            this.flush_page(page_index).await;
        });
    }

    async fn flush_page(self: Arc<Self>, page_index: u64) {
        let slot_idx = self.slot_index(page_index);
        let page_start = self.page_start(page_index);
        let tail_snapshot = self.tail.load(Ordering::Acquire);
        let page_end = (page_start + self.page_size).min(tail_snapshot.max(page_start));
        let write_len = (page_end - page_start) as usize;

        self.pages[slot_idx]
            .state
            .store(PageState::Flushing as u8, Ordering::Release);

        let device = self.device.clone();
        let buf_ptr = self.pages[slot_idx].buf.load(Ordering::Acquire);
        if buf_ptr.is_null() || write_len == 0 {
            self.pages[slot_idx]
                .state
                .store(PageState::Flushed as u8, Ordering::Release);
            self.on_flush_complete(page_start, page_end);
            return;
        }
        // Safety: the page is Closed/Flushing, meaning no writer is still
        // bumping the tail into it, and readers never touch this pointer
        // directly (reads are served from the device). Copying the bytes
        // out before handing them to spawn_blocking avoids holding the raw
        // pointer across an await point.
        let bytes = unsafe { std::slice::from_raw_parts(buf_ptr, write_len).to_vec() };

        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            device.write_at(page_start, &bytes)?;
            device.sync()
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!(page = page_index, bytes = write_len, "allocator: flushed page");
                self.pages[slot_idx]
                    .state
                    .store(PageState::Flushed as u8, Ordering::Release);
                self.on_flush_complete(page_start, page_end);
            }
            Ok(Err(e)) => {
                warn!(page = page_index, error = %e, "allocator: flush failed");
                // Leave the page Closed so a future explicit commit can
                // retry; FlushedUntilAddress intentionally does not advance.
                self.pages[slot_idx]
                    .state
                    .store(PageState::Closed as u8, Ordering::Release);
            }
            Err(join_err) => {
                warn!(page = page_index, error = %join_err, "allocator: flush task panicked");
                self.pages[slot_idx]
                    .state
                    .store(PageState::Closed as u8, Ordering::Release);
            }
        }
    }

    fn on_flush_complete(self: &Arc<Self>, page_start: u64, page_end: u64) {
        let new_flushed_until = {
            let mut tracker = self.flush_tracker.lock();
            if page_start == tracker.next_start {
                tracker.next_start = page_end;
                loop {
                    let key = tracker.next_start;
                    match tracker.completed.remove(&key) {
                        Some(end) => tracker.next_start = end,
                        None => break,
                    }
                }
                Some(tracker.next_start)
            } else {
                tracker.completed.insert(page_start, page_end);
                None
            }
        };

        if let Some(new_flushed_until) = new_flushed_until {
            self.flushed_until.store(new_flushed_until, Ordering::Release);
            self.head.store(new_flushed_until, Ordering::Release);
            self.retire_eligible_pages();
            if let Some(cb) = self.flush_callback.lock().as_ref() {
                cb(new_flushed_until);
            }
        }
    }

    /// Free the backing buffer of any page that is flushed and fully below
    /// `head`, deferred through the epoch manager so a concurrent reader
    /// resumed in an older epoch can't be left with a dangling pointer. Runs
    /// on every flush completion so ring slots free up as soon as their
    /// bytes are durable, independent of `BeginAddress`/`TruncateUntil` —
    /// otherwise a full ring of flushed-but-untruncated pages would wedge
    /// `try_allocate` forever.
    fn retire_eligible_pages(self: &Arc<Self>) {
        let head = self.head.load(Ordering::Acquire);
        for (idx, slot) in self.pages.iter().enumerate() {
            let page_index = slot.page_index.load(Ordering::Acquire);
            if page_index == u64::MAX {
                continue;
            }
            let page_end = self.page_start(page_index) + self.page_size;
            if slot.state() != PageState::Flushed || page_end > head {
                continue;
            }
            if slot
                .state
                .compare_exchange(
                    PageState::Flushed as u8,
                    PageState::Empty as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue; // raced with another retirement pass
            }
            let buf = slot.buf.swap(ptr::null_mut(), Ordering::AcqRel);
            let page_size = self.page_size as usize;
            slot.page_index.store(u64::MAX, Ordering::Release);
            if !buf.is_null() {
                let buf_addr = buf as usize;
                self.epoch.bump_epoch(move || unsafe {
                    drop(Box::from_raw(std::slice::from_raw_parts_mut(
                        buf_addr as *mut u8,
                        page_size,
                    )));
                });
            }
            debug!(page = page_index, slot = idx, "allocator: retired page");
        }
    }
}

impl Drop for PagedAllocator {
    fn drop(&mut self) {
        for slot in &self.pages {
            let buf = slot.buf.swap(ptr::null_mut(), Ordering::AcqRel);
            if !buf.is_null() {
                unsafe {
                    drop(Box::from_raw(std::slice::from_raw_parts_mut(
                        buf,
                        self.page_size as usize,
                    )));
                }
            }
        }
    }
}
