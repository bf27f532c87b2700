//! Process-wide list of live caches.
//!
//! Singly linked through a node embedded in each cache, so registration
//! never allocates and a cache can register during bootstrap. The list lock
//! is taken at create/destroy and by the whole-system sweeps
//! ([`crate::reap_all`], [`crate::dump_caches`]); never on allocation
//! paths. Create and destroy touch the registry only while holding no
//! per-cache locks, so sweeping the list while briefly taking each cache's
//! locks cannot deadlock.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use kmem_utils::Mutex;

use crate::cache::KmemCache;

/// Embedded linkage; the registry lock guards the pointer.
pub(crate) struct Node {
    next: UnsafeCell<Option<NonNull<KmemCache>>>,
}

impl Node {
    pub(crate) const fn new() -> Self {
        Self {
            next: UnsafeCell::new(None),
        }
    }
}

struct Caches {
    head: Option<NonNull<KmemCache>>,
    count: usize,
}

// SAFETY: the embedded nodes are only dereferenced under LIST's lock.
unsafe impl Send for Caches {}

static LIST: Mutex<Caches> = Mutex::new(Caches {
    head: None,
    count: 0,
});

pub(crate) fn insert(cache: &'static KmemCache) {
    let mut list = LIST.lock();
    // SAFETY: the node belongs to `cache`, which is not yet listed, and
    // the list lock is held.
    unsafe { *cache.registry.next.get() = list.head };
    list.head = Some(NonNull::from(cache));
    list.count += 1;
}

pub(crate) fn remove(cache: &KmemCache) {
    let mut list = LIST.lock();
    let target = NonNull::from(cache);
    let mut cursor = list.head;
    let mut prev: Option<NonNull<KmemCache>> = None;
    while let Some(node) = cursor {
        // SAFETY: listed caches are live; the list lock is held.
        let next = unsafe { *node.as_ref().registry.next.get() };
        if node == target {
            match prev {
                Some(p) => unsafe { *p.as_ref().registry.next.get() = next },
                None => list.head = next,
            }
            unsafe { *node.as_ref().registry.next.get() = None };
            list.count -= 1;
            return;
        }
        prev = Some(node);
        cursor = next;
    }
    panic!("kmem: cache '{}' not in the registry", cache.name());
}

/// Visit every registered cache. `f` may take per-cache locks but must not
/// create or destroy caches.
pub(crate) fn for_each(mut f: impl FnMut(&KmemCache)) {
    let list = LIST.lock();
    let mut cursor = list.head;
    while let Some(node) = cursor {
        // SAFETY: a cache stays live while it is on the list; destroy
        // unlinks first.
        let cache = unsafe { node.as_ref() };
        f(cache);
        cursor = unsafe { *cache.registry.next.get() };
    }
}

pub(crate) fn count() -> usize {
    LIST.lock().count
}
