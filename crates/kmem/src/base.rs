//! Base allocator for allocator metadata.
//!
//! Hash tables and per-CPU arrays are carved from here, never from the
//! object caches themselves, so metadata allocation works during bootstrap
//! and never recurses into the slab layer.
//!
//! Kernel builds register a backend with [`set_backing`] before
//! `kmem::init`; hosted builds fall back to the process allocator.

use core::alloc::Layout;
use core::ptr::NonNull;

use kmem_utils::Once;

/// Raw memory provider behind [`alloc`]/[`free`].
pub trait BaseBacking: Send + Sync {
    /// Allocate `layout.size()` bytes at `layout.align()`. Returns `None`
    /// when exhausted.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return memory obtained from [`BaseBacking::alloc`].
    ///
    /// # Safety
    /// `ptr` must come from a prior `alloc(layout)` on this backing with
    /// the same layout, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

static BACKING: Once<&'static dyn BaseBacking> = Once::new();

/// Register the metadata backend. First call wins.
pub fn set_backing(backing: &'static dyn BaseBacking) {
    BACKING.call_once(|| backing);
}

fn backing() -> &'static dyn BaseBacking {
    #[cfg(feature = "std")]
    {
        *BACKING.call_once(|| &HOST_BACKING)
    }
    #[cfg(not(feature = "std"))]
    {
        // A kernel build must have registered a backend before the first
        // cache exists; there is nothing sensible to fall back to.
        *BACKING
            .get()
            .expect("kmem: no base backing registered before first use")
    }
}

pub(crate) fn alloc(layout: Layout) -> Option<NonNull<u8>> {
    backing().alloc(layout)
}

/// Zeroed variant of [`alloc`].
pub(crate) fn zalloc(layout: Layout) -> Option<NonNull<u8>> {
    let ptr = backing().alloc(layout)?;
    // SAFETY: the backing just handed us `layout.size()` writable bytes.
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, layout.size()) };
    Some(ptr)
}

/// # Safety
/// `ptr` must come from [`alloc`]/[`zalloc`] with the same `layout` and must
/// not be used afterwards.
pub(crate) unsafe fn free(ptr: NonNull<u8>, layout: Layout) {
    // SAFETY: forwarded caller contract.
    unsafe { backing().free(ptr, layout) };
}

#[cfg(feature = "std")]
static HOST_BACKING: HostBacking = HostBacking;

/// Process-allocator backend used on hosted builds.
#[cfg(feature = "std")]
struct HostBacking;

#[cfg(feature = "std")]
impl BaseBacking for HostBacking {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: non-zero size checked above.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller contract matches std::alloc::dealloc's.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
