#![cfg_attr(not(feature = "std"), no_std)]

//! Type-specific object allocator with per-CPU magazine caching.
//!
//! Each [`KmemCache`] hands out fixed-size, fixed-alignment objects in
//! three tiers:
//!
//! * a per-CPU **magazine pair**: a lock-free front door (interrupts
//!   masked, no cross-CPU locks) absorbing the common case;
//! * a shared **depot** of magazines, whose capacity target grows when the
//!   depot lock is observed contended;
//! * a **slab back-end** carving imported arena regions into slots, with
//!   either in-object freelists (small objects) or external bufctl
//!   bookkeeping and an address-keyed hash (large or no-touch objects).
//!
//! External collaborators are pluggable: the source [`Arena`] supplying
//! regions, the [`base`] allocator supplying metadata, the tick source and
//! the CPU-slot mapping. Hosted builds (`std` feature, default) wire all
//! of these to process-level defaults so the crate is usable and testable
//! on an ordinary toolchain; kernel builds register their own providers
//! before first use.
//!
//! ```
//! use kmem::{AllocFlags, CacheFlags, KmemCache, ObjectHooks};
//!
//! let cache = KmemCache::create(
//!     "example",
//!     64,
//!     64,
//!     CacheFlags::empty(),
//!     None,
//!     ObjectHooks::NONE,
//! )
//! .expect("cache creation");
//! let obj = cache.alloc(AllocFlags::empty()).expect("first allocation");
//! unsafe { cache.free(obj) };
//! ```

mod arena;
mod base;
mod bootstrap;
mod bufctl;
mod cache;
mod clock;
mod cpu;
mod cpu_cache;
mod depot;
mod irq;
mod list;
mod magazine;
mod params;
mod registry;
mod slab;

pub use arena::{Arena, set_base_arena, set_page_arena};
#[cfg(feature = "std")]
pub use arena::HostArena;
pub use base::{BaseBacking, set_backing};
pub use cache::{
    AllocFlags, CacheFlags, CacheStats, Ctor, CtorError, Dtor, KmemCache, KmemError, ObjectHooks,
    SlabLayout,
};
pub use clock::set_time_source;
pub use cpu::configure as configure_cpus;
pub use params::{PAGE_SIZE, SMALL_OBJECT_CUTOFF};

/// Bring the allocator up explicitly. Optional (the first
/// [`KmemCache::create`] does this on demand), but kernels call it at a
/// known point in their boot order, after registering arenas, base
/// backing, clock, and CPU plan.
pub fn init() {
    bootstrap::init();
}

/// Reap every registered cache: purge magazine-held objects back to their
/// slabs and release all empty slabs to their source arenas. The
/// memory-pressure entry point.
pub fn reap_all() {
    init();
    let mut visited = 0;
    registry::for_each(|cache| {
        cache.reap();
        visited += 1;
    });
    log::debug!("kmem: reaped {visited} cache(s)");
}

/// Log one line of statistics per registered cache.
pub fn dump_caches() {
    registry::for_each(|cache| {
        let stats = cache.stats();
        log::debug!(
            "kmem: {:<20} obj={:<6} live={:<8} slabs={}/{}/{} target={} contended={}",
            stats.name,
            stats.obj_size,
            stats.live,
            stats.empty_slabs,
            stats.partial_slabs,
            stats.full_slabs,
            stats.depot_target,
            stats.depot_contended,
        );
    });
}

/// Number of registered caches, the four reserved ones included.
pub fn cache_count() -> usize {
    registry::count()
}
