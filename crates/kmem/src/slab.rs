//! Slab records: one imported region carved into equal-sized slots.
//!
//! Two layouts exist, chosen per cache at creation:
//!
//! - **Embedded**: the region is exactly one page; the record lives at the
//!   page's tail and free slots thread their freelist through their own
//!   first word. The owning slab of any object is found by masking the
//!   address down to the page.
//! - **External**: the record is allocated from the slab-record cache, the
//!   region from the source arena at the cache's import size, and every
//!   slot is described by a [`BufCtl`]. Free slots chain their bufctls on
//!   the slab; allocated slots park them in the cache's hash index.
//!
//! All slab state is guarded by the owning cache's lock; the record itself
//! is plain data.

use core::ptr::NonNull;

use kmem_utils::align_down;

use crate::bufctl::BufCtl;
use crate::list::{Link, Linked};
use crate::params::PAGE_SIZE;

/// One free slot, in the representation of its cache's layout.
pub(crate) enum Slot {
    Inline(NonNull<u8>),
    Ctl(NonNull<BufCtl>),
}

impl Slot {
    /// Object address this slot stands for.
    pub(crate) fn addr(&self) -> NonNull<u8> {
        match self {
            Slot::Inline(obj) => *obj,
            // SAFETY: a chained bufctl is a live record owned by the slab
            // layer.
            Slot::Ctl(ctl) => unsafe { ctl.as_ref().addr },
        }
    }
}

enum FreeList {
    /// Head of the in-object freelist; each free slot's first word holds
    /// the address of the next (0 terminates).
    Inline(Option<NonNull<u8>>),
    /// Head of the bufctl chain.
    Ctl(Option<NonNull<BufCtl>>),
}

/// Membership state, which also names the cache list the slab belongs on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SlabState {
    Empty,
    Partial,
    Full,
}

pub(crate) struct Slab {
    link: Link<Slab>,
    region: NonNull<u8>,
    region_size: usize,
    total: usize,
    busy: usize,
    free: FreeList,
}

impl Linked for Slab {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link<Self> {
        &mut self.link
    }
}

impl Slab {
    /// Byte offset of the record within an embedded page.
    pub(crate) fn embedded_record_offset() -> usize {
        align_down(
            PAGE_SIZE - core::mem::size_of::<Slab>(),
            core::mem::align_of::<Slab>(),
        )
    }

    /// Slots a single embedded page yields for `obj_size`-byte objects.
    pub(crate) fn embedded_capacity(obj_size: usize) -> usize {
        Self::embedded_record_offset() / obj_size
    }

    /// Owning slab of an embedded-layout object.
    ///
    /// # Safety
    /// `obj` must have been handed out by an embedded-layout slab of this
    /// allocator; anything else dereferences garbage.
    pub(crate) unsafe fn from_embedded_obj(obj: NonNull<u8>) -> NonNull<Slab> {
        let page = align_down(obj.as_ptr() as usize, PAGE_SIZE);
        let record = page + Self::embedded_record_offset();
        // SAFETY: every embedded page carries its record at this offset.
        unsafe { NonNull::new_unchecked(record as *mut Slab) }
    }

    /// Carve `region` (one page, page-aligned) into an embedded slab:
    /// threads the freelist through the slots and writes the record at the
    /// page tail.
    ///
    /// # Safety
    /// `region` must be an exclusively owned, page-aligned region of
    /// exactly [`PAGE_SIZE`] bytes.
    pub(crate) unsafe fn init_embedded(region: NonNull<u8>, obj_size: usize) -> NonNull<Slab> {
        let base = region.as_ptr() as usize;
        debug_assert_eq!(base % PAGE_SIZE, 0);
        debug_assert!(obj_size >= core::mem::size_of::<usize>());
        debug_assert_eq!(obj_size % core::mem::size_of::<usize>(), 0);

        let total = Self::embedded_capacity(obj_size);
        let mut head: usize = 0;
        // Thread back to front so the lowest slot pops first.
        for i in (0..total).rev() {
            let slot = base + i * obj_size;
            // SAFETY: slot is within the region and below the record.
            unsafe { (slot as *mut usize).write(head) };
            head = slot;
        }

        let record = (base + Self::embedded_record_offset()) as *mut Slab;
        // SAFETY: the record slot is inside the region, past every object
        // slot, and properly aligned by embedded_record_offset.
        unsafe {
            record.write(Slab {
                link: Link::new(),
                region,
                region_size: PAGE_SIZE,
                total,
                busy: 0,
                free: FreeList::Inline(NonNull::new(head as *mut u8)),
            });
            NonNull::new_unchecked(record)
        }
    }

    /// Fresh external-layout record for `region`. The freelist starts
    /// empty; the caller seeds one bufctl per slot with [`Slab::seed_ctl`].
    pub(crate) fn new_external(region: NonNull<u8>, region_size: usize, total: usize) -> Slab {
        Slab {
            link: Link::new(),
            region,
            region_size,
            total,
            busy: 0,
            free: FreeList::Ctl(None),
        }
    }

    /// Chain a bufctl during slab construction, without touching the busy
    /// count.
    pub(crate) fn seed_ctl(&mut self, mut ctl: NonNull<BufCtl>) {
        let FreeList::Ctl(head) = &mut self.free else {
            unreachable!("seeding a bufctl into an embedded slab");
        };
        // SAFETY: the ctl was just allocated for this slab and has no
        // other holder.
        unsafe { ctl.as_mut().next = *head };
        *head = Some(ctl);
    }

    /// Take one free slot. Returns `None` only when the slab is full.
    pub(crate) fn pop_slot(&mut self) -> Option<Slot> {
        let slot = match &mut self.free {
            FreeList::Inline(head) => {
                let obj = (*head)?;
                // SAFETY: a free inline slot's first word is the next-free
                // link written by init or push_slot.
                let next = unsafe { (obj.as_ptr() as *const usize).read() };
                *head = NonNull::new(next as *mut u8);
                Slot::Inline(obj)
            }
            FreeList::Ctl(head) => {
                let mut ctl = (*head)?;
                // SAFETY: chained bufctls are owned by this slab.
                unsafe {
                    *head = ctl.as_ref().next;
                    ctl.as_mut().next = None;
                }
                Slot::Ctl(ctl)
            }
        };
        self.busy += 1;
        debug_assert!(self.busy <= self.total);
        Some(slot)
    }

    /// Return a slot to the freelist.
    pub(crate) fn push_slot(&mut self, slot: Slot) {
        debug_assert!(self.busy > 0);
        match (&mut self.free, slot) {
            (FreeList::Inline(head), Slot::Inline(obj)) => {
                let next = head.map_or(0, |p| p.as_ptr() as usize);
                // SAFETY: the object is back under allocator ownership; its
                // first word becomes the freelist link.
                unsafe { (obj.as_ptr() as *mut usize).write(next) };
                *head = Some(obj);
            }
            (FreeList::Ctl(head), Slot::Ctl(mut ctl)) => {
                // SAFETY: the ctl was unlinked from the hash by the caller.
                unsafe { ctl.as_mut().next = *head };
                *head = Some(ctl);
            }
            _ => unreachable!("slot representation does not match slab layout"),
        }
        self.busy -= 1;
    }

    /// Drain the bufctl freelist for teardown. Yields `None` when empty.
    pub(crate) fn drain_ctl(&mut self) -> Option<NonNull<BufCtl>> {
        let FreeList::Ctl(head) = &mut self.free else {
            return None;
        };
        let mut ctl = (*head)?;
        // SAFETY: chained bufctls are owned by this slab.
        unsafe {
            *head = ctl.as_ref().next;
            ctl.as_mut().next = None;
        }
        Some(ctl)
    }

    pub(crate) fn state(&self) -> SlabState {
        if self.busy == 0 {
            SlabState::Empty
        } else if self.busy == self.total {
            SlabState::Full
        } else {
            SlabState::Partial
        }
    }

    pub(crate) fn region(&self) -> NonNull<u8> {
        self.region
    }

    pub(crate) fn region_size(&self) -> usize {
        self.region_size
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn busy(&self) -> usize {
        self.busy
    }
}
