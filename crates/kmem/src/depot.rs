//! The depot: shared magazine pool behind all per-CPU slots of one cache.
//!
//! Two singly-linked stacks (not-empty and empty magazines) plus the
//! magazine-capacity target and its contention-driven feedback loop. The
//! target only ever grows; per-CPU slots pick the new value up on their
//! next depot visit.

use core::ptr::NonNull;

use kmem_utils::{Mutex, MutexGuard};

use crate::clock;
use crate::magazine::Magazine;
use crate::params::{MAG_INIT_TARGET, MAG_MAX_CAPACITY, RESIZE_THRESHOLD, RESIZE_WINDOW_NS};

/// Singly-linked stack of magazines, threaded through `Magazine::next`.
pub(crate) struct MagStack {
    head: Option<NonNull<Magazine>>,
    len: usize,
}

impl MagStack {
    const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    fn push(&mut self, mut mag: NonNull<Magazine>) {
        // SAFETY: the depot lock is held; the magazine was just handed to
        // the depot and has no other holder.
        unsafe { mag.as_mut().next = self.head };
        self.head = Some(mag);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<NonNull<Magazine>> {
        let mut head = self.head?;
        // SAFETY: depot lock held; `head` is owned by this stack.
        unsafe {
            self.head = head.as_ref().next;
            head.as_mut().next = None;
        }
        self.len -= 1;
        Some(head)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Detach the whole chain for lock-free draining.
    fn take_all(&mut self) -> Option<NonNull<Magazine>> {
        self.len = 0;
        self.head.take()
    }
}

pub(crate) struct DepotInner {
    pub(crate) notempty: MagStack,
    pub(crate) empty: MagStack,
    target: usize,
    window_ns: u64,
    threshold: u64,
    busy_start: u64,
    busy_count: u64,
    contended: u64,
}

pub(crate) struct Depot {
    inner: Mutex<DepotInner>,
}

impl Depot {
    pub(crate) const fn new() -> Self {
        Self {
            inner: Mutex::new(DepotInner {
                notempty: MagStack::new(),
                empty: MagStack::new(),
                target: MAG_INIT_TARGET,
                window_ns: RESIZE_WINDOW_NS,
                threshold: RESIZE_THRESHOLD,
                busy_start: 0,
                busy_count: 0,
                contended: 0,
            }),
        }
    }

    /// Plain acquisition for maintenance paths (drain, stats, stamping a
    /// new magazine). Does not feed contention accounting.
    pub(crate) fn lock(&self) -> MutexGuard<'_, DepotInner> {
        self.inner.lock()
    }

    /// Fast-path acquisition. A failed try-lock samples the clock *before*
    /// blocking, so a long wait cannot eat the accounting window, then
    /// records the contention after the lock is won.
    pub(crate) fn lock_tracked(&self) -> MutexGuard<'_, DepotInner> {
        if let Some(guard) = self.inner.try_lock() {
            return guard;
        }
        let stamp = clock::now_ns();
        let mut guard = self.inner.lock();
        guard.note_contention(stamp);
        guard
    }
}

impl DepotInner {
    /// Record one contended acquisition observed at `stamp`, and grow the
    /// target if the window overflowed.
    ///
    /// Contention while the not-empty stack is dry means objects are
    /// scarce, not that magazines are too small; those acquisitions are
    /// not counted.
    pub(crate) fn note_contention(&mut self, stamp: u64) {
        self.contended += 1;
        if self.notempty.len == 0 {
            return;
        }
        if stamp > self.busy_start.saturating_add(self.window_ns) {
            self.busy_count = 0;
            self.busy_start = stamp;
        }
        self.busy_count += 1;
        if self.busy_count > self.threshold {
            self.busy_count = 0;
            if self.target < MAG_MAX_CAPACITY {
                self.target += 1;
                log::debug!("kmem: magazine target raised to {}", self.target);
            }
        }
    }

    /// Current capacity target for newly stamped magazines.
    pub(crate) fn target(&self) -> usize {
        self.target
    }

    pub(crate) fn set_tunables(&mut self, window_ns: u64, threshold: u64) {
        self.window_ns = window_ns;
        self.threshold = threshold;
    }

    pub(crate) fn contended(&self) -> u64 {
        self.contended
    }

    pub(crate) fn take_notempty(&mut self) -> Option<NonNull<Magazine>> {
        self.notempty.pop()
    }

    pub(crate) fn take_empty(&mut self) -> Option<NonNull<Magazine>> {
        self.empty.pop()
    }

    /// File `mag` under the list matching its fill state.
    pub(crate) fn put(&mut self, mag: NonNull<Magazine>) {
        // SAFETY: the caller transferred ownership of `mag` to the depot
        // and holds the depot lock.
        let is_empty = unsafe { mag.as_ref().is_empty() };
        if is_empty {
            self.empty.push(mag);
        } else {
            self.notempty.push(mag);
        }
    }

    /// Detach both stacks for draining outside the lock. Returned chains
    /// are owned by the caller.
    pub(crate) fn take_all(&mut self) -> (Option<NonNull<Magazine>>, Option<NonNull<Magazine>>) {
        (self.notempty.take_all(), self.empty.take_all())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    fn leaked_magazine(capacity: usize) -> NonNull<Magazine> {
        let mag = Box::leak(Box::new(MaybeUninit::<Magazine>::uninit()));
        let ptr = NonNull::new(mag.as_mut_ptr()).expect("box allocation");
        Magazine::construct(ptr);
        // SAFETY: just constructed, exclusively owned.
        unsafe { (*ptr.as_ptr()).set_capacity(capacity) };
        ptr
    }

    fn obj(addr: usize) -> NonNull<u8> {
        NonNull::new(addr as *mut u8).expect("non-null test address")
    }

    #[test]
    fn put_files_by_fill_state() {
        let depot = Depot::new();
        let empty = leaked_magazine(2);
        let full = leaked_magazine(2);
        // SAFETY: exclusively owned until handed to the depot.
        unsafe { assert!((*full.as_ptr()).try_push(obj(0x40))) };

        let mut inner = depot.lock();
        inner.put(empty);
        inner.put(full);
        assert_eq!(inner.empty.len(), 1);
        assert_eq!(inner.notempty.len(), 1);

        assert_eq!(inner.take_notempty(), Some(full));
        assert_eq!(inner.take_empty(), Some(empty));
        assert!(inner.take_notempty().is_none());
        assert!(inner.take_empty().is_none());
    }

    #[test]
    fn stacks_are_lifo() {
        let depot = Depot::new();
        let a = leaked_magazine(1);
        let b = leaked_magazine(1);
        let mut inner = depot.lock();
        inner.put(a);
        inner.put(b);
        assert_eq!(inner.take_empty(), Some(b));
        assert_eq!(inner.take_empty(), Some(a));
    }

    #[test]
    fn contention_inside_window_grows_target() {
        let depot = Depot::new();
        let mut inner = depot.lock();
        inner.set_tunables(1_000, 1);
        // Accounting needs cached objects on hand.
        let full = leaked_magazine(1);
        unsafe { assert!((*full.as_ptr()).try_push(obj(0x80))) };
        inner.put(full);

        assert_eq!(inner.target(), MAG_INIT_TARGET);
        inner.note_contention(100);
        assert_eq!(inner.target(), MAG_INIT_TARGET);
        inner.note_contention(200);
        assert_eq!(inner.target(), MAG_INIT_TARGET + 1);
    }

    #[test]
    fn window_expiry_resets_the_count() {
        let depot = Depot::new();
        let mut inner = depot.lock();
        inner.set_tunables(1_000, 1);
        let full = leaked_magazine(1);
        unsafe { assert!((*full.as_ptr()).try_push(obj(0x80))) };
        inner.put(full);

        inner.note_contention(100);
        // Far past the window: the count restarts instead of tripping.
        inner.note_contention(10_000);
        assert_eq!(inner.target(), MAG_INIT_TARGET);
        inner.note_contention(10_100);
        assert_eq!(inner.target(), MAG_INIT_TARGET + 1);
    }

    #[test]
    fn starvation_contention_is_not_counted() {
        let depot = Depot::new();
        let mut inner = depot.lock();
        inner.set_tunables(1_000, 1);
        // No not-empty magazines: shortage, not undersizing.
        for stamp in [10, 20, 30, 40] {
            inner.note_contention(stamp);
        }
        assert_eq!(inner.target(), MAG_INIT_TARGET);
        assert_eq!(inner.contended(), 4);
    }

    #[test]
    fn target_caps_at_max() {
        let depot = Depot::new();
        let mut inner = depot.lock();
        inner.set_tunables(u64::MAX, 0);
        let full = leaked_magazine(1);
        unsafe { assert!((*full.as_ptr()).try_push(obj(0x80))) };
        inner.put(full);

        for _ in 0..(MAG_MAX_CAPACITY * 2) {
            inner.note_contention(50);
        }
        assert_eq!(inner.target(), MAG_MAX_CAPACITY);
    }
}
