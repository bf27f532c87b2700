//! Source-arena contract.
//!
//! A cache never talks to raw page frames; it imports regions from an
//! [`Arena`] and returns them there. Two well-known arenas exist: the
//! *base* arena, usable before the allocator itself is up (the four
//! reserved caches draw from it), and the *pages* arena, the default source
//! for every cache created without an explicit one.
//!
//! Kernel builds register both with [`set_base_arena`]/[`set_page_arena`]
//! before `kmem::init`; hosted builds default both to [`HostArena`].

use core::ptr::NonNull;

use kmem_utils::Once;

use crate::cache::{AllocFlags, KmemCache};

/// Address-space provider a cache imports slab regions from.
///
/// Regions whose size is a multiple of [`crate::params::PAGE_SIZE`] are
/// page-aligned; the embedded slab layout depends on that.
pub trait Arena: Send + Sync {
    /// Obtain a region of exactly `size` bytes. `flags` carries the
    /// non-blocking bit; a blocking call may sleep inside the arena.
    fn alloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Return a region previously obtained from [`Arena::alloc`].
    ///
    /// # Safety
    /// `region` must come from a prior `alloc(size, ..)` on this arena with
    /// the same `size`, with no outstanding references into it.
    unsafe fn free(&self, region: NonNull<u8>, size: usize);

    /// Largest allocation the arena serves from its quantum caches, or 0 if
    /// it has none. Governs the import size of quantum caches.
    fn quantum_max(&self) -> usize {
        0
    }

    /// Note `cache` as an importer, so memory pressure can find and reap
    /// it. The default keeps no record.
    fn add_importer(&self, _cache: &KmemCache) {}

    /// Forget an importer registered with [`Arena::add_importer`].
    fn del_importer(&self, _cache: &KmemCache) {}
}

static BASE_ARENA: Once<&'static dyn Arena> = Once::new();
static PAGE_ARENA: Once<&'static dyn Arena> = Once::new();

/// Register the bootstrap-safe arena the reserved caches import from.
/// First call wins.
pub fn set_base_arena(arena: &'static dyn Arena) {
    BASE_ARENA.call_once(|| arena);
}

/// Register the default source for caches created without one. First call
/// wins.
pub fn set_page_arena(arena: &'static dyn Arena) {
    PAGE_ARENA.call_once(|| arena);
}

pub(crate) fn base_arena() -> &'static dyn Arena {
    #[cfg(feature = "std")]
    {
        *BASE_ARENA.call_once(|| &HOST_ARENA)
    }
    #[cfg(not(feature = "std"))]
    {
        *BASE_ARENA
            .get()
            .expect("kmem: no base arena registered before init")
    }
}

pub(crate) fn page_arena() -> &'static dyn Arena {
    #[cfg(feature = "std")]
    {
        *PAGE_ARENA.call_once(|| &HOST_ARENA)
    }
    #[cfg(not(feature = "std"))]
    {
        *PAGE_ARENA
            .get()
            .expect("kmem: no page arena registered before init")
    }
}

#[cfg(feature = "std")]
static HOST_ARENA: HostArena = HostArena;

/// Page-granular arena over the process allocator. Serves as both the base
/// and the pages arena on hosted builds; tests wrap it to count or fail
/// imports.
#[cfg(feature = "std")]
pub struct HostArena;

#[cfg(feature = "std")]
impl Arena for HostArena {
    fn alloc(&self, size: usize, _flags: AllocFlags) -> Option<NonNull<u8>> {
        let layout = region_layout(size)?;
        // SAFETY: region_layout rejects zero sizes.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn free(&self, region: NonNull<u8>, size: usize) {
        let layout = region_layout(size).expect("freed region had a valid layout at alloc time");
        // SAFETY: caller contract matches std::alloc::dealloc's.
        unsafe { std::alloc::dealloc(region.as_ptr(), layout) };
    }
}

#[cfg(feature = "std")]
fn region_layout(size: usize) -> Option<core::alloc::Layout> {
    if size == 0 {
        return None;
    }
    core::alloc::Layout::from_size_align(size, crate::params::PAGE_SIZE).ok()
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::params::PAGE_SIZE;

    #[test]
    fn host_regions_are_page_aligned() {
        let region = HostArena
            .alloc(PAGE_SIZE, AllocFlags::empty())
            .expect("host arena serves a page");
        assert_eq!(region.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe { HostArena.free(region, PAGE_SIZE) };

        let big = HostArena
            .alloc(3 * PAGE_SIZE, AllocFlags::empty())
            .expect("host arena serves a multi-page region");
        assert_eq!(big.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe { HostArena.free(big, 3 * PAGE_SIZE) };
    }
}
