// Epoch-based reclamation for the paged allocator.
//
// Adapted from the generic `Atomic<T>`/garbage-pointer GC in
// `concurrent::epoch` (teacher) into the narrower `Resume/Suspend/
// ProtectAndDrain/BumpEpoch` surface: the only resource
// this manager ever reclaims is allocator pages, retired through one shared
// deferred-action queue instead of per-type garbage bags.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

/// A thread's slot in the participant table.
///
/// `local_epoch == 0` means the thread is not currently resumed. Any other
/// value is the global epoch observed on the outermost `resume()` call.
struct Participant {
    local_epoch: AtomicU64,
    nest_count: AtomicI64,
}

impl Participant {
    fn new() -> Self {
        Self {
            local_epoch: AtomicU64::new(0),
            nest_count: AtomicI64::new(0),
        }
    }
}

type Action = Box<dyn FnOnce() + Send>;

/// Lightweight epoch-based reclamation: threads `resume()` before touching
/// epoch-protected memory and `suspend()` when done; `bump_epoch` defers a
/// closure until every thread currently resumed has moved on.
pub struct EpochManager {
    global_epoch: AtomicU64,
    participants: Mutex<Vec<Arc<CachePadded<Participant>>>>,
    // Actions deferred at a given epoch, run once every participant has
    // drained past it.
    pending: Mutex<BTreeMap<u64, Vec<Action>>>,
}

thread_local! {
    static SLOT: std::cell::RefCell<Option<Arc<CachePadded<Participant>>>> =
        const { std::cell::RefCell::new(None) };
}

impl EpochManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            global_epoch: AtomicU64::new(1),
            participants: Mutex::new(Vec::new()),
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    fn slot(self: &Arc<Self>) -> Arc<CachePadded<Participant>> {
        SLOT.with(|cell| {
            let mut cell = cell.borrow_mut();
            if let Some(p) = cell.as_ref() {
                return p.clone();
            }
            let p = Arc::new(CachePadded::new(Participant::new()));
            self.participants.lock().push(p.clone());
            *cell = Some(p.clone());
            p
        })
    }

    /// Mark the calling thread present in the current epoch. Nests as a
    /// counter; only the outermost call publishes the local epoch.
    pub fn resume(self: &Arc<Self>) -> EpochGuard {
        let p = self.slot();
        let prev = p.nest_count.fetch_add(1, Ordering::Relaxed);
        if prev == 0 {
            let g = self.global_epoch.load(Ordering::Acquire);
            p.local_epoch.store(g, Ordering::Release);
        }
        EpochGuard {
            manager: self.clone(),
            participant: p,
        }
    }

    /// Mark the calling thread absent. Pages retired in epochs the thread
    /// participated in may now be reclaimed once peers also drain.
    fn suspend(&self, p: &Arc<CachePadded<Participant>>) {
        let prev = p.nest_count.fetch_sub(1, Ordering::Relaxed);
        if prev == 1 {
            p.local_epoch.store(0, Ordering::Release);
        }
    }

    /// Run pending deferred work reachable now that epochs may have drained.
    /// Safe to call while resumed; does not itself resume/suspend.
    pub fn protect_and_drain(&self) {
        self.try_advance();
        self.drain_ready();
    }

    /// Defer `action` until every thread currently resumed has left the
    /// current epoch, then bump the global epoch so future resumes observe
    /// the new value.
    pub fn bump_epoch(&self, action: impl FnOnce() + Send + 'static) {
        let epoch = self.global_epoch.load(Ordering::Acquire);
        self.pending
            .lock()
            .entry(epoch)
            .or_default()
            .push(Box::new(action));
        self.global_epoch.fetch_add(1, Ordering::AcqRel);
        self.drain_ready();
    }

    fn min_active_epoch(&self) -> Option<u64> {
        self.participants
            .lock()
            .iter()
            .filter_map(|p| {
                let e = p.local_epoch.load(Ordering::Acquire);
                if e == 0 {
                    None
                } else {
                    Some(e)
                }
            })
            .min()
    }

    fn try_advance(&self) {
        // No-op placeholder hook: the global epoch is bumped eagerly in
        // `bump_epoch`, so there is nothing additional to advance here. Kept
        // as a separate step because `protect_and_drain` is the single place
        // callers poll from.
    }

    fn drain_ready(&self) {
        let min_active = self.min_active_epoch();
        let mut pending = self.pending.lock();
        let ready_keys: Vec<u64> = pending
            .keys()
            .copied()
            .filter(|&epoch| match min_active {
                // Every participant that could have observed `epoch` has
                // since left it.
                Some(min) => min > epoch,
                None => true,
            })
            .collect();
        let mut actions = Vec::new();
        for key in ready_keys {
            if let Some(batch) = pending.remove(&key) {
                actions.extend(batch);
            }
        }
        drop(pending);
        for action in actions {
            action();
        }
    }
}

/// RAII guard for a resumed epoch. Suspends on drop, including on panic
/// unwind, so every exit path releases the epoch.
pub struct EpochGuard {
    manager: Arc<EpochManager>,
    participant: Arc<CachePadded<Participant>>,
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.manager.suspend(&self.participant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn resume_suspend_nests() {
        let mgr = EpochManager::new();
        let g1 = mgr.resume();
        let g2 = mgr.resume();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn bump_epoch_runs_once_drained() {
        let mgr = EpochManager::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let guard = mgr.resume();
        {
            let ran = ran.clone();
            mgr.bump_epoch(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Still resumed in the epoch the action was deferred at: not run yet.
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        drop(guard);
        mgr.protect_and_drain();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_resume_suspend_is_safe() {
        let mgr = EpochManager::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let g = mgr.resume();
                    mgr.protect_and_drain();
                    drop(g);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
