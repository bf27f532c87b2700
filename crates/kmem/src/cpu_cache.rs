//! Per-CPU front doors: a loaded/previous magazine pair per CPU slot.
//!
//! The pair lets the fast path absorb alternating alloc/free bursts without
//! touching the depot: when `loaded` runs dry (or full), it is swapped with
//! `previous` before any shared state is taken. Both slots reference valid
//! magazines at all times; only cache teardown breaks that.
//!
//! The array is metadata: it comes from the base allocator, never from an
//! object cache, and is freed wholesale when the cache is destroyed. The
//! initial pair of magazines per slot is drawn straight from the magazine
//! cache's slab layer, which is what lets the magazine cache build its own
//! front doors while coming up.

use core::alloc::Layout;
use core::ptr::NonNull;

use kmem_utils::{Mutex, MutexGuard};

use crate::base;
use crate::bootstrap;
use crate::cache::AllocFlags;
use crate::cpu;
use crate::magazine::Magazine;

/// Mutable per-slot state, guarded by the slot lock.
pub(crate) struct PcpuShell {
    loaded: NonNull<Magazine>,
    previous: NonNull<Magazine>,
    /// Cached copy of the depot's capacity target; refreshed on free-path
    /// depot visits, monotonically non-decreasing.
    magsize: usize,
    allocs: u64,
}

impl PcpuShell {
    pub(crate) fn loaded(&mut self) -> &mut Magazine {
        // SAFETY: the slot lock is held and the slot owns this magazine.
        unsafe { self.loaded.as_mut() }
    }

    pub(crate) fn previous(&mut self) -> &mut Magazine {
        // SAFETY: as for `loaded`.
        unsafe { self.previous.as_mut() }
    }

    /// Swap the pair; the cheap second chance before going to the depot.
    pub(crate) fn swap_pair(&mut self) {
        core::mem::swap(&mut self.loaded, &mut self.previous);
    }

    /// Install `incoming` as loaded, demote loaded to previous, and yield
    /// the old previous for return to the depot.
    pub(crate) fn rotate(&mut self, incoming: NonNull<Magazine>) -> NonNull<Magazine> {
        let outgoing = self.previous;
        self.previous = self.loaded;
        self.loaded = incoming;
        outgoing
    }

    pub(crate) fn magsize(&self) -> usize {
        self.magsize
    }

    /// Adopt a grown depot target. The target never shrinks, so neither
    /// does this.
    pub(crate) fn refresh_magsize(&mut self, target: usize) {
        debug_assert!(target >= self.magsize);
        self.magsize = target;
    }

    pub(crate) fn note_alloc(&mut self) {
        self.allocs += 1;
    }

    pub(crate) fn allocs(&self) -> u64 {
        self.allocs
    }

    /// Rip both magazines out for cache teardown. The shell is invalid
    /// afterwards; the array is freed without another look.
    pub(crate) fn take_for_teardown(&mut self) -> (NonNull<Magazine>, NonNull<Magazine>) {
        let pair = (self.loaded, self.previous);
        self.loaded = NonNull::dangling();
        self.previous = NonNull::dangling();
        pair
    }
}

/// One cache-line-sized slot per CPU.
#[repr(align(64))]
pub(crate) struct PcpuSlot {
    inner: Mutex<PcpuShell>,
}

impl PcpuSlot {
    pub(crate) fn lock(&self) -> MutexGuard<'_, PcpuShell> {
        self.inner.lock()
    }
}

/// The per-cache array of slots, base-allocated at cache creation.
pub(crate) struct PcpuArray {
    slots: NonNull<PcpuSlot>,
    len: usize,
}

impl PcpuArray {
    /// Build the array and give every slot two empty magazines of
    /// `capacity` rounds, drawn from the magazine cache's slab layer.
    ///
    /// Returns `None` when the base allocator or the magazine cache's
    /// arena is exhausted; everything allocated so far is given back.
    pub(crate) fn new(capacity: usize) -> Option<PcpuArray> {
        let len = cpu::slot_count();
        let layout = Layout::array::<PcpuSlot>(len).ok()?;
        let slots = base::alloc(layout)?.cast::<PcpuSlot>();

        for i in 0..len {
            let pair = Self::magazine_pair(capacity);
            let Some((loaded, previous)) = pair else {
                // Unwind the slots built so far.
                for j in 0..i {
                    // SAFETY: slot j was fully written below.
                    let shell = unsafe { &mut *(slots.as_ptr().add(j)) }.inner.get_mut();
                    let (loaded, previous) = shell.take_for_teardown();
                    // SAFETY: both magazines are empty and exclusively ours.
                    unsafe {
                        bootstrap::free_magazine(loaded);
                        bootstrap::free_magazine(previous);
                    }
                }
                // SAFETY: allocated above with this layout.
                unsafe { base::free(slots.cast(), layout) };
                return None;
            };
            // SAFETY: index i is in bounds of the fresh allocation.
            unsafe {
                slots.as_ptr().add(i).write(PcpuSlot {
                    inner: Mutex::new(PcpuShell {
                        loaded,
                        previous,
                        magsize: capacity,
                        allocs: 0,
                    }),
                });
            }
        }
        Some(PcpuArray { slots, len })
    }

    fn magazine_pair(capacity: usize) -> Option<(NonNull<Magazine>, NonNull<Magazine>)> {
        let first = bootstrap::allocate_magazine(capacity, AllocFlags::MAY_FAIL)?;
        let Some(second) = bootstrap::allocate_magazine(capacity, AllocFlags::MAY_FAIL) else {
            // SAFETY: `first` is empty and exclusively ours.
            unsafe { bootstrap::free_magazine(first) };
            return None;
        };
        Some((first, second))
    }

    /// Slot of the executing CPU.
    pub(crate) fn slot(&self) -> &PcpuSlot {
        let idx = cpu::current_slot() % self.len;
        // SAFETY: idx < len and the array lives as long as self.
        unsafe { &*self.slots.as_ptr().add(idx) }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PcpuSlot> {
        // SAFETY: the array holds `len` initialized slots.
        (0..self.len).map(move |i| unsafe { &*self.slots.as_ptr().add(i) })
    }

    /// Free the array memory. Magazines must have been taken out first.
    ///
    /// # Safety
    /// No slot may be used again; callers run this once, during destroy.
    pub(crate) unsafe fn release(&self) {
        let layout = Layout::array::<PcpuSlot>(self.len).expect("layout was valid at creation");
        // SAFETY: allocated in `new` with this layout.
        unsafe { base::free(self.slots.cast(), layout) };
    }
}
