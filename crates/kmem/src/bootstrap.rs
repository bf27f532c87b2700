//! The four reserved caches and their ordered bring-up.
//!
//! Everything the allocator needs to describe itself is allocated from
//! caches, so the caches that make that possible live in BSS and come up
//! in a fixed order:
//!
//! 1. the magazine cache: every later cache's per-CPU pair is drawn from
//!    its slab layer;
//! 2. the cache-of-caches: dynamic [`KmemCache`] containers;
//! 3. the slab-record cache: external-layout slab records;
//! 4. the bufctl cache: external-layout slot records.
//!
//! All four import from the base arena, which is usable before anything
//! else. The three record caches are small enough to stay embedded-layout,
//! so none of them needs records from a cache later in the order; the
//! cache-of-caches may land in either layout, and it does not grow until
//! the first dynamic create, by which point the whole order is up.

use core::ptr::NonNull;

use kmem_utils::Once;

use crate::cache::{AllocFlags, CacheFlags, CtorError, KmemCache, ObjectHooks};
use crate::cpu;
use crate::magazine::Magazine;

static MAGAZINE_CACHE: KmemCache = KmemCache::reserved();
static CACHE_CACHE: KmemCache = KmemCache::reserved();
static SLAB_CACHE: KmemCache = KmemCache::reserved();
static BUFCTL_CACHE: KmemCache = KmemCache::reserved();

static INIT: Once<()> = Once::new();

/// Bring the allocator up. Idempotent; called implicitly by
/// [`KmemCache::create`].
pub(crate) fn init() {
    INIT.call_once(|| {
        let base = crate::arena::base_arena();
        let boot = |cache: &'static KmemCache, name, size, align, hooks| {
            cache
                .init_common(name, size, align, CacheFlags::empty(), base, hooks, false)
                .expect("kmem: bootstrap cache creation cannot fail");
        };

        boot(
            &MAGAZINE_CACHE,
            "kmem_magazine",
            core::mem::size_of::<Magazine>(),
            core::mem::align_of::<Magazine>(),
            ObjectHooks {
                ctor: Some(magazine_ctor),
                dtor: None,
                cookie: core::ptr::null_mut(),
            },
        );
        boot(
            &CACHE_CACHE,
            "kmem_cache",
            core::mem::size_of::<KmemCache>(),
            core::mem::align_of::<KmemCache>(),
            ObjectHooks::NONE,
        );
        boot(
            &SLAB_CACHE,
            "kmem_slab",
            core::mem::size_of::<crate::slab::Slab>(),
            core::mem::align_of::<crate::slab::Slab>(),
            ObjectHooks::NONE,
        );
        boot(
            &BUFCTL_CACHE,
            "kmem_bufctl",
            core::mem::size_of::<crate::bufctl::BufCtl>(),
            core::mem::align_of::<crate::bufctl::BufCtl>(),
            ObjectHooks::NONE,
        );
        log::debug!("kmem: bootstrap complete ({} cpu slots)", cpu::slot_count());
    });
}

fn magazine_ctor(obj: NonNull<u8>, _cookie: *mut (), _flags: AllocFlags) -> Result<(), CtorError> {
    Magazine::construct(obj.cast());
    Ok(())
}

pub(crate) fn magazine_cache() -> &'static KmemCache {
    &MAGAZINE_CACHE
}

pub(crate) fn cache_cache() -> &'static KmemCache {
    &CACHE_CACHE
}

pub(crate) fn slab_cache() -> &'static KmemCache {
    &SLAB_CACHE
}

pub(crate) fn bufctl_cache() -> &'static KmemCache {
    &BUFCTL_CACHE
}

/// A magazine of `capacity` rounds, straight from the magazine cache's
/// slab layer.
///
/// Magazines never ride magazines: their frees bypass the magazine
/// subsystem (see [`free_magazine`]), so the magazine cache's own
/// magazines are permanently empty and the slab layer is the only tier
/// that ever holds one. Going to it directly also works before the
/// per-CPU pairs exist, which is what breaks the bootstrap cycle.
pub(crate) fn allocate_magazine(capacity: usize, flags: AllocFlags) -> Option<NonNull<Magazine>> {
    let obj = MAGAZINE_CACHE.slab_alloc(flags).ok()?;
    let mut mag = obj.cast::<Magazine>();
    // SAFETY: freshly constructed magazine, exclusively ours.
    unsafe { mag.as_mut().set_capacity(capacity) };
    Some(mag)
}

/// Return a drained magazine to the magazine cache.
///
/// Magazines never travel the magazine-layer free path; that path may
/// allocate a magazine, and the cycle has to stop somewhere.
///
/// # Safety
/// `mag` must be empty, come from this allocator's magazine cache, and
/// have no remaining holder.
pub(crate) unsafe fn free_magazine(mag: NonNull<Magazine>) {
    // SAFETY: caller contract.
    debug_assert!(unsafe { mag.as_ref().is_empty() });
    MAGAZINE_CACHE.slab_free(mag.cast());
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn reserved_caches_come_up_once() {
        init();
        init();
        assert_eq!(magazine_cache().name(), "kmem_magazine");
        assert_eq!(cache_cache().name(), "kmem_cache");
        assert_eq!(slab_cache().name(), "kmem_slab");
        assert_eq!(bufctl_cache().name(), "kmem_bufctl");
        // All four reserved caches keep in-object freelists; anything else
        // would need records from a cache later in the bring-up order.
        assert_eq!(
            magazine_cache().layout(),
            crate::cache::SlabLayout::Embedded
        );
        assert_eq!(slab_cache().layout(), crate::cache::SlabLayout::Embedded);
        assert_eq!(bufctl_cache().layout(), crate::cache::SlabLayout::Embedded);
    }

    #[test]
    fn slab_fed_magazines_round_trip() {
        init();
        let mag = allocate_magazine(2, AllocFlags::MAY_FAIL).expect("magazine cache serves");
        // SAFETY: exclusively ours.
        unsafe {
            assert_eq!(mag.as_ref().capacity(), 2);
            assert!(mag.as_ref().is_empty());
            free_magazine(mag);
        }
    }
}
