//! Timeline Fences
//!
//! A [`Fence`] is a monotonically increasing 64-bit timeline value per
//! command queue. A [`SyncPoint`] pairs a fence with a value and is the only
//! way to observe GPU progress from the CPU. [`FencedPool`] recycles objects
//! once the sync point recorded at their release has completed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use super::resources::Ref;

/// Monotonic GPU timeline fence.
///
/// `current_value` is the value the *next* signal will publish;
/// `last_signaled` and `last_completed` trail it. The software backend
/// completes values at submission time, so `last_completed` tracks
/// `last_signaled`; the wait path is kept honest with a condvar so the
/// blocking semantics survive a real backend.
#[derive(Debug)]
pub struct Fence {
    name: String,
    current_value: AtomicU64,
    last_signaled: AtomicU64,
    last_completed: AtomicU64,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl Fence {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            current_value: AtomicU64::new(1),
            last_signaled: AtomicU64::new(0),
            last_completed: AtomicU64::new(0),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value that will be signaled next.
    #[must_use]
    pub fn current_value(&self) -> u64 {
        self.current_value.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_completed(&self) -> u64 {
        self.last_completed.load(Ordering::Acquire)
    }

    /// Signals the next timeline value and returns it.
    pub fn signal_next(&self) -> u64 {
        let value = self.current_value.fetch_add(1, Ordering::AcqRel);
        self.signal_value(value);
        value
    }

    /// Signals an explicit timeline value.
    pub fn signal_value(&self, value: u64) {
        self.last_signaled.fetch_max(value, Ordering::AcqRel);
        self.last_completed.fetch_max(value, Ordering::AcqRel);
        let _guard = self.wait_lock.lock();
        self.wait_cv.notify_all();
    }

    /// Blocks the CPU until `value` has completed.
    pub fn cpu_wait(&self, value: u64) {
        if self.is_complete(value) {
            return;
        }
        let mut guard = self.wait_lock.lock();
        while self.last_completed.load(Ordering::Acquire) < value {
            self.wait_cv.wait(&mut guard);
        }
    }

    /// Whether the fence has reached `value`.
    #[must_use]
    pub fn is_complete(&self, value: u64) -> bool {
        self.last_completed.load(Ordering::Acquire) >= value
    }
}

/// A `(fence, value)` pair identifying one GPU completion event.
#[derive(Clone, Debug, Default)]
pub struct SyncPoint {
    fence: Option<Ref<Fence>>,
    value: u64,
}

impl SyncPoint {
    #[must_use]
    pub fn new(fence: Ref<Fence>, value: u64) -> Self {
        Self {
            fence: Some(fence),
            value,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.fence.is_some()
    }

    #[must_use]
    pub fn fence_value(&self) -> u64 {
        self.value
    }

    /// True once the fence has reached this value. An invalid sync point has
    /// nothing outstanding and reports complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.fence.as_ref().is_none_or(|f| f.is_complete(self.value))
    }

    /// Blocks until complete. No-op for an invalid sync point.
    pub fn wait(&self) {
        if let Some(fence) = &self.fence {
            fence.cpu_wait(self.value);
        }
    }
}

/// Pool of objects reclaimed by fence value.
///
/// `allocate` reuses the oldest pooled object once its release sync point
/// has completed; otherwise a fresh object is created. Used for command
/// allocators and scratch pages.
#[derive(Debug)]
pub struct FencedPool<T> {
    pool: Mutex<VecDeque<(T, SyncPoint)>>,
}

impl<T> Default for FencedPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FencedPool<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(VecDeque::new()),
        }
    }

    pub fn allocate(&self, create: impl FnOnce() -> T) -> T {
        let mut pool = self.pool.lock();
        let reusable = pool.front().is_some_and(|(_, sync)| sync.is_complete());
        if reusable {
            pool.pop_front().map(|(object, _)| object).unwrap()
        } else {
            create()
        }
    }

    pub fn free(&self, object: T, sync_point: SyncPoint) {
        self.pool.lock().push_back((object, sync_point));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pool.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_signal_and_wait() {
        let fence = Fence::new("Test");
        assert_eq!(fence.current_value(), 1);
        let v = fence.signal_next();
        assert_eq!(v, 1);
        assert!(fence.is_complete(1));
        assert!(!fence.is_complete(2));
        fence.cpu_wait(1); // must not block
    }

    #[test]
    fn sync_point_default_is_complete() {
        let sp = SyncPoint::default();
        assert!(!sp.is_valid());
        assert!(sp.is_complete());
    }

    #[test]
    fn fenced_pool_reuses_after_completion() {
        let fence = Ref::new(Fence::new("Pool"));
        let pool: FencedPool<u32> = FencedPool::new();

        // Freed with a pending sync point: not reusable yet.
        let pending = SyncPoint::new(fence.clone(), fence.current_value());
        pool.free(7, pending);
        assert_eq!(pool.allocate(|| 42), 42);

        // After the signal the pooled object comes back.
        fence.signal_next();
        assert_eq!(pool.allocate(|| 42), 7);
    }
}
