//! Magazines: bounded LIFO stacks of cached object pointers.
//!
//! A magazine's storage is sized for [`MAG_MAX_CAPACITY`] rounds, but its
//! *logical* capacity is stamped when the magazine is handed out, from the
//! depot's target at that moment. Growing the target therefore never
//! rewrites existing magazines; an older, smaller one stays valid until it
//! drains.
//!
//! Ownership: a magazine belongs to exactly one holder at a time: a
//! per-CPU slot, a depot list, or the operation moving it between the two.
//! The holder's lock covers every access, so the struct itself is plain
//! data.

use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::params::MAG_MAX_CAPACITY;

#[repr(C)]
pub(crate) struct Magazine {
    /// Depot list linkage; `None` while held by a per-CPU slot.
    pub(crate) next: Option<NonNull<Magazine>>,
    capacity: usize,
    rounds: usize,
    slots: [MaybeUninit<NonNull<u8>>; MAG_MAX_CAPACITY],
}

impl Magazine {
    /// Reset a freshly allocated magazine. The object constructor of the
    /// magazine cache; runs on every slab-layer allocation of a magazine.
    pub(crate) fn construct(mag: NonNull<Magazine>) {
        let p = mag.as_ptr();
        // SAFETY: the slab layer hands us an exclusive, properly aligned
        // slot; writing the header fields through the raw place leaves the
        // round storage uninitialized, as MaybeUninit permits.
        unsafe {
            (*p).next = None;
            (*p).capacity = 0;
            (*p).rounds = 0;
        }
    }

    /// Stamp the logical capacity. Done once by whoever allocates the
    /// magazine, before it becomes visible to any other holder.
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        debug_assert!(capacity >= 1 && capacity <= MAG_MAX_CAPACITY);
        debug_assert_eq!(self.rounds, 0);
        self.capacity = capacity;
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn rounds(&self) -> usize {
        self.rounds
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rounds == 0
    }

    /// Room for another round? Checks the magazine's own capacity, not the
    /// cache-wide target, so undersized magazines from before a resize
    /// behave.
    pub(crate) fn has_room(&self) -> bool {
        self.rounds < self.capacity
    }

    /// Push a round; fails when full.
    pub(crate) fn try_push(&mut self, obj: NonNull<u8>) -> bool {
        if !self.has_room() {
            return false;
        }
        self.slots[self.rounds].write(obj);
        self.rounds += 1;
        true
    }

    /// Pop the most recently pushed round.
    pub(crate) fn try_pop(&mut self) -> Option<NonNull<u8>> {
        if self.rounds == 0 {
            return None;
        }
        self.rounds -= 1;
        // SAFETY: slots below `rounds` were written by try_push.
        Some(unsafe { self.slots[self.rounds].assume_init() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(capacity: usize) -> Magazine {
        let mut mag = Magazine {
            next: None,
            capacity: 0,
            rounds: 0,
            slots: [MaybeUninit::uninit(); MAG_MAX_CAPACITY],
        };
        mag.set_capacity(capacity);
        mag
    }

    fn obj(addr: usize) -> NonNull<u8> {
        NonNull::new(addr as *mut u8).expect("test address is non-null")
    }

    #[test]
    fn pop_on_empty_fails() {
        let mut mag = fresh(4);
        assert!(mag.is_empty());
        assert!(mag.try_pop().is_none());
    }

    #[test]
    fn push_respects_own_capacity() {
        let mut mag = fresh(2);
        assert!(mag.try_push(obj(0x1000)));
        assert!(mag.try_push(obj(0x2000)));
        assert!(!mag.has_room());
        assert!(!mag.try_push(obj(0x3000)));
        assert_eq!(mag.rounds(), 2);
    }

    #[test]
    fn rounds_come_back_lifo() {
        let mut mag = fresh(3);
        assert!(mag.try_push(obj(0x10)));
        assert!(mag.try_push(obj(0x20)));
        assert!(mag.try_push(obj(0x30)));
        assert_eq!(mag.try_pop(), Some(obj(0x30)));
        assert_eq!(mag.try_pop(), Some(obj(0x20)));
        assert_eq!(mag.try_pop(), Some(obj(0x10)));
        assert!(mag.try_pop().is_none());
    }

    #[test]
    fn capacity_one_cycles() {
        let mut mag = fresh(1);
        for pass in 0..3 {
            let addr = 0x100 * (pass + 1);
            assert!(mag.try_push(obj(addr)));
            assert!(!mag.try_push(obj(0xdead0)));
            assert_eq!(mag.try_pop(), Some(obj(addr)));
        }
    }
}
