//! The object cache: a named pool of fixed-size, fixed-alignment objects.
//!
//! Allocation walks three tiers: the per-CPU magazine pair, the shared
//! magazine depot, and finally the slab back-end, which imports regions
//! from the cache's source arena. Frees walk the same tiers in reverse; an
//! object only re-enters the slab layer when the magazine subsystem cannot
//! hold it, and the destructor (if any) runs exactly at that boundary.
//!
//! Lock order: per-CPU slot, then depot. The cache lock guarding slab
//! lists and the bufctl index is independent and is never held while
//! touching this cache's own magazine layer.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use kmem_error::define_error;
use kmem_utils::{Mutex, Once, align_up, round_up};

use crate::arena::{self, Arena};
use crate::bootstrap;
use crate::bufctl::{BufCtl, BufHash};
use crate::cpu_cache::PcpuArray;
use crate::depot::Depot;
use crate::irq::IrqGuard;
use crate::list::List;
use crate::magazine::Magazine;
use crate::params::{BUFCTL_SLOTS_PER_SLAB, PAGE_SIZE, QUANTUM_IMPORT_FACTOR, SMALL_OBJECT_CUTOFF};
use crate::registry;
use crate::slab::{Slab, SlabState, Slot};

bitflags! {
    /// Per-allocation behavior bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Never block; the source arena must satisfy the import
        /// immediately or the allocation fails.
        const ATOMIC = 1 << 0;
        /// Report exhaustion as `None` instead of panicking.
        const MAY_FAIL = 1 << 1;
    }
}

bitflags! {
    /// Per-cache behavior bits, fixed at creation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// The cache fronts one of the source arena's quantum sizes;
        /// derive the import size from the arena's quantum maximum.
        const QUANTUM_CACHE = 1 << 0;
        /// The allocator must not write into free objects; forces
        /// external (bufctl) bookkeeping.
        const NO_TOUCH = 1 << 1;
    }
}

define_error! {
    /// Failures surfaced by cache creation and allocation.
    pub enum KmemError("kmem") {
        OutOfMemory = 1 => "source arena exhausted",
        CtorFailed = 2 => "object constructor failed",
        BadAlign = 3 => "alignment must be a power of two no larger than a page",
        BadSize = 4 => "unsupported object size",
    }
}

/// Constructor hook failure marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CtorError;

/// Object constructor: runs when a slot leaves the slab layer, not on
/// magazine hits. Must not allocate.
pub type Ctor = fn(obj: NonNull<u8>, cookie: *mut (), flags: AllocFlags) -> Result<(), CtorError>;

/// Object destructor: runs when an object re-enters the slab layer. Must
/// not allocate.
pub type Dtor = fn(obj: NonNull<u8>, cookie: *mut ());

/// Constructor/destructor pair with an opaque cookie passed to both.
#[derive(Clone, Copy)]
pub struct ObjectHooks {
    pub ctor: Option<Ctor>,
    pub dtor: Option<Dtor>,
    pub cookie: *mut (),
}

impl ObjectHooks {
    pub const NONE: ObjectHooks = ObjectHooks {
        ctor: None,
        dtor: None,
        cookie: core::ptr::null_mut(),
    };
}

/// How a cache tracks free slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabLayout {
    /// Freelist links live inside free objects; one page per slab with the
    /// record at its tail.
    Embedded,
    /// Bufctl records track every slot; the slab record and region are
    /// allocated separately.
    External,
}

pub(crate) struct CacheCfg {
    name: &'static str,
    obj_size: usize,
    align: usize,
    flags: CacheFlags,
    layout: SlabLayout,
    import_size: usize,
    source: &'static dyn Arena,
    hooks: ObjectHooks,
    dynamic: bool,
}

/// Slab lists, bufctl index, and slab-layer counters; all under the cache
/// lock.
struct CacheState {
    empty: List<Slab>,
    partial: List<Slab>,
    full: List<Slab>,
    hash: BufHash,
    slab_allocs: u64,
    slab_frees: u64,
    imported: usize,
}

impl CacheState {
    const fn new() -> Self {
        Self {
            empty: List::new(),
            partial: List::new(),
            full: List::new(),
            hash: BufHash::new(),
            slab_allocs: 0,
            slab_frees: 0,
            imported: 0,
        }
    }

    fn list_mut(&mut self, state: SlabState) -> &mut List<Slab> {
        match state {
            SlabState::Empty => &mut self.empty,
            SlabState::Partial => &mut self.partial,
            SlabState::Full => &mut self.full,
        }
    }

    /// Move `slab` between lists when its busy count crossed a boundary.
    fn relink(&mut self, slab: NonNull<Slab>, from: SlabState, to: SlabState) {
        if from == to {
            return;
        }
        // SAFETY: `slab` is on the `from` list under the cache lock.
        unsafe {
            self.list_mut(from).remove(slab);
            self.list_mut(to).push_front(slab);
        }
    }
}

/// Point-in-time counters for one cache.
#[derive(Clone, Debug)]
pub struct CacheStats {
    pub name: &'static str,
    pub obj_size: usize,
    pub layout: SlabLayout,
    /// Objects currently held by callers.
    pub live: usize,
    pub empty_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub slab_allocs: u64,
    pub slab_frees: u64,
    pub imported_bytes: usize,
    pub hash_items: usize,
    pub hash_buckets: usize,
    pub fastpath_allocs: u64,
    pub depot_notempty: usize,
    pub depot_empty: usize,
    pub depot_target: usize,
    pub depot_contended: u64,
}

/// A named, typed object pool. See the module docs for the tier design.
pub struct KmemCache {
    cfg: Once<CacheCfg>,
    state: Mutex<CacheState>,
    depot: Depot,
    pcpu: Once<PcpuArray>,
    live: AtomicUsize,
    pub(crate) registry: registry::Node,
}

// SAFETY: every mutable field sits behind a spin lock, a Once, or an
// atomic; the raw pointers inside reference memory owned by this cache and
// are only touched under the owning lock. Hook cookies are shared across
// CPUs by contract.
unsafe impl Send for KmemCache {}
unsafe impl Sync for KmemCache {}

impl KmemCache {
    /// A cache shell with no configuration. Usable as a static
    /// initializer; `init_common` brings it to life.
    pub(crate) const fn reserved() -> Self {
        Self {
            cfg: Once::new(),
            state: Mutex::new(CacheState::new()),
            depot: Depot::new(),
            pcpu: Once::new(),
            live: AtomicUsize::new(0),
            registry: registry::Node::new(),
        }
    }

    /// Create a cache of `size`-byte objects aligned to `align`.
    ///
    /// `source` defaults to the pages arena. The returned cache is fully
    /// operational; it is registered globally and with its source arena.
    /// The allocator is brought up on first use.
    ///
    /// Hook cookies are shared across CPUs; the hooks themselves must be
    /// safe to call concurrently and must not allocate.
    pub fn create(
        name: &'static str,
        size: usize,
        align: usize,
        flags: CacheFlags,
        source: Option<&'static dyn Arena>,
        hooks: ObjectHooks,
    ) -> Result<&'static KmemCache, KmemError> {
        bootstrap::init();

        let source = source.unwrap_or_else(arena::page_arena);
        let mem = bootstrap::cache_cache()
            .alloc(AllocFlags::MAY_FAIL)
            .ok_or(KmemError::OutOfMemory)?;
        let ptr = mem.cast::<KmemCache>();
        // SAFETY: the cache-of-caches hands out exclusive
        // KmemCache-sized, KmemCache-aligned slots.
        unsafe { ptr.as_ptr().write(KmemCache::reserved()) };
        // SAFETY: the object lives until destroy(), which consumes the
        // reference; treating it as 'static mirrors that.
        let cache = unsafe { &*ptr.as_ptr() };

        if let Err(err) = cache.init_common(name, size, align, flags, source, hooks, true) {
            // SAFETY: the shell never became operational; only its slot is
            // returned.
            unsafe { bootstrap::cache_cache().free(mem) };
            return Err(err);
        }
        Ok(cache)
    }

    /// Shared bring-up for reserved and dynamic caches.
    pub(crate) fn init_common(
        &'static self,
        name: &'static str,
        size: usize,
        align: usize,
        flags: CacheFlags,
        source: &'static dyn Arena,
        hooks: ObjectHooks,
        dynamic: bool,
    ) -> Result<(), KmemError> {
        if align == 0 || !align.is_power_of_two() || align > PAGE_SIZE {
            return Err(KmemError::BadAlign);
        }
        if size == 0 {
            return Err(KmemError::BadSize);
        }
        // Free objects carry a one-word freelist link, so a slot is never
        // smaller than a word.
        let word = core::mem::size_of::<usize>();
        let mut obj_size = align_up(size.max(word), align);
        if obj_size < size {
            return Err(KmemError::BadSize);
        }

        let layout = if obj_size > SMALL_OBJECT_CUTOFF || flags.contains(CacheFlags::NO_TOUCH) {
            SlabLayout::External
        } else {
            // The link is read and written as a whole word; keep every
            // slot word-aligned. Cannot push past the cutoff: the cutoff
            // is itself word-aligned.
            obj_size = align_up(obj_size, word);
            SlabLayout::Embedded
        };
        let import_size = match layout {
            SlabLayout::Embedded => PAGE_SIZE,
            SlabLayout::External => {
                let qmax = source.quantum_max();
                if flags.contains(CacheFlags::QUANTUM_CACHE) && qmax > 0 {
                    qmax.checked_mul(QUANTUM_IMPORT_FACTOR)
                        .and_then(usize::checked_next_power_of_two)
                        .ok_or(KmemError::BadSize)?
                } else {
                    let bytes = obj_size
                        .checked_mul(BUFCTL_SLOTS_PER_SLAB)
                        .ok_or(KmemError::BadSize)?;
                    round_up(bytes, PAGE_SIZE)
                }
            }
        };

        let mut fresh = false;
        self.cfg.call_once(|| {
            fresh = true;
            CacheCfg {
                name,
                obj_size,
                align,
                flags,
                layout,
                import_size,
                source,
                hooks,
                dynamic,
            }
        });
        assert!(fresh, "kmem: cache '{name}' initialized twice");

        let target = self.depot.lock().target();
        let pcpu = PcpuArray::new(target).ok_or(KmemError::OutOfMemory)?;
        self.pcpu.call_once(|| pcpu);

        registry::insert(self);
        source.add_importer(self);
        log::debug!(
            "kmem: created cache '{}' (obj_size={}, align={}, {:?}, import={})",
            name,
            obj_size,
            align,
            layout,
            import_size
        );
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        self.cfg().name
    }

    /// Effective (rounded) object size.
    pub fn object_size(&self) -> usize {
        self.cfg().obj_size
    }

    pub fn layout(&self) -> SlabLayout {
        self.cfg().layout
    }

    pub fn alignment(&self) -> usize {
        self.cfg().align
    }

    pub fn flags(&self) -> CacheFlags {
        self.cfg().flags
    }

    fn cfg(&self) -> &CacheCfg {
        // A cache handle only escapes after init_common; a missing config
        // is allocator corruption.
        self.cfg.get().expect("kmem: cache used before init")
    }

    fn is_magazine_cache(&self) -> bool {
        core::ptr::eq(self, bootstrap::magazine_cache())
    }

    /// Allocate one object.
    ///
    /// Without [`AllocFlags::ATOMIC`] or [`AllocFlags::MAY_FAIL`], arena
    /// exhaustion panics; with either, it returns `None`. A constructor
    /// failure always returns `None`.
    pub fn alloc(&self, flags: AllocFlags) -> Option<NonNull<u8>> {
        let obj = match self.magazine_alloc() {
            Some(obj) => Some(obj),
            None => match self.slab_alloc(flags) {
                Ok(obj) => Some(obj),
                Err(KmemError::CtorFailed) => None,
                Err(err) => {
                    if flags.intersects(AllocFlags::ATOMIC | AllocFlags::MAY_FAIL) {
                        None
                    } else {
                        panic!("kmem: cache '{}': {}", self.name(), err);
                    }
                }
            },
        };
        if obj.is_some() {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        obj
    }

    /// Return one object.
    ///
    /// # Safety
    /// `obj` must have been returned by [`KmemCache::alloc`] on this cache
    /// and not freed since.
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        if self.magazine_free(obj) {
            return;
        }
        // The magazine subsystem could not take it: this is the object's
        // exit from the cache layer, so the destructor runs here.
        self.run_dtor(obj);
        self.slab_free(obj);
    }

    /// Fast path: loaded magazine, previous magazine, then a depot
    /// exchange. Falls through with `None` when the depot has no rounds.
    fn magazine_alloc(&self) -> Option<NonNull<u8>> {
        let pcpu = self.pcpu.get()?;
        let _irq = IrqGuard::new();
        let mut shell = pcpu.slot().lock();
        loop {
            if let Some(obj) = shell.loaded().try_pop() {
                shell.note_alloc();
                return Some(obj);
            }
            if !shell.previous().is_empty() {
                shell.swap_pair();
                continue;
            }
            let mut depot = self.depot.lock_tracked();
            let Some(full) = depot.take_notempty() else {
                return None;
            };
            let outgoing = shell.rotate(full);
            depot.put(outgoing);
        }
    }

    /// Fast path for frees. `false` means the object must take the slab
    /// route (with its destructor).
    fn magazine_free(&self, obj: NonNull<u8>) -> bool {
        let Some(pcpu) = self.pcpu.get() else {
            return false;
        };
        loop {
            let stamp;
            {
                let _irq = IrqGuard::new();
                let mut shell = pcpu.slot().lock();
                loop {
                    if shell.loaded().try_push(obj) {
                        return true;
                    }
                    if shell.previous().has_room() {
                        shell.swap_pair();
                        continue;
                    }
                    let mut depot = self.depot.lock_tracked();
                    shell.refresh_magsize(depot.target());
                    match depot.take_empty() {
                        Some(empty) => {
                            let outgoing = shell.rotate(empty);
                            depot.put(outgoing);
                        }
                        None => break,
                    }
                }
                stamp = shell.magsize();
            }
            // Both magazines and the depot are full up. Feed the depot a
            // fresh empty magazine and retry; the magazine cache itself
            // must not re-enter this path.
            if self.is_magazine_cache() {
                return false;
            }
            let Some(mag) = bootstrap::allocate_magazine(stamp, AllocFlags::ATOMIC) else {
                return false;
            };
            self.depot.lock().put(mag);
        }
    }

    /// Slab-layer allocation: pick a partial (or empty) slab, take a slot,
    /// grow if none exists. Runs the constructor after dropping the cache
    /// lock.
    pub(crate) fn slab_alloc(&self, flags: AllocFlags) -> Result<NonNull<u8>, KmemError> {
        let cfg = self.cfg();
        let obj = {
            let mut st = self.state.lock();
            let slab_ptr = match st.partial.head().or_else(|| st.empty.head()) {
                Some(slab) => slab,
                None => self.grow_locked(&mut st, flags)?,
            };
            // SAFETY: slab records on our lists are live and guarded by
            // the cache lock.
            let slab = unsafe { &mut *slab_ptr.as_ptr() };
            let before = slab.state();
            let slot = slab
                .pop_slot()
                .expect("a slab on the empty or partial list has a free slot");
            let obj = slot.addr();
            if let Slot::Ctl(ctl) = slot {
                st.hash.insert(ctl);
            }
            st.relink(slab_ptr, before, slab.state());
            st.slab_allocs += 1;
            obj
        };

        if let Some(ctor) = cfg.hooks.ctor {
            if ctor(obj, cfg.hooks.cookie, flags).is_err() {
                self.slab_free(obj);
                return Err(KmemError::CtorFailed);
            }
        }
        Ok(obj)
    }

    /// Slab-layer free: locate the owning slab, give the slot back, relink.
    /// Destructors do not run here; the caller handles them at the
    /// magazine boundary.
    pub(crate) fn slab_free(&self, obj: NonNull<u8>) {
        let cfg = self.cfg();
        let mut st = self.state.lock();
        let (slab_ptr, slot) = match cfg.layout {
            // SAFETY: per the free() contract, `obj` came from this cache,
            // so its page tail holds the slab record.
            SlabLayout::Embedded => (unsafe { Slab::from_embedded_obj(obj) }, Slot::Inline(obj)),
            SlabLayout::External => {
                let Some(ctl) = st.hash.remove(obj) else {
                    panic!(
                        "kmem: cache '{}': free of unknown address {:p}",
                        cfg.name,
                        obj.as_ptr()
                    );
                };
                // SAFETY: the bufctl's slab back-reference is maintained by
                // the slab layer.
                let slab = unsafe { ctl.as_ref().slab };
                (slab, Slot::Ctl(ctl))
            }
        };
        // SAFETY: the owning slab record is live while any of its objects
        // are outstanding.
        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        let before = slab.state();
        slab.push_slot(slot);
        st.relink(slab_ptr, before, slab.state());
        st.slab_frees += 1;
    }

    /// Import one region and install it as an empty slab. Called with the
    /// cache lock held.
    fn grow_locked(
        &self,
        st: &mut CacheState,
        flags: AllocFlags,
    ) -> Result<NonNull<Slab>, KmemError> {
        let cfg = self.cfg();
        let region = cfg
            .source
            .alloc(cfg.import_size, flags)
            .ok_or(KmemError::OutOfMemory)?;

        let slab_ptr = match cfg.layout {
            // SAFETY: the arena contract gives us an exclusive,
            // page-aligned page.
            SlabLayout::Embedded => unsafe { Slab::init_embedded(region, cfg.obj_size) },
            SlabLayout::External => {
                match self.build_external_slab(region, flags) {
                    Some(slab) => slab,
                    None => {
                        // SAFETY: the region was imported above and no slot
                        // of it escaped.
                        unsafe { cfg.source.free(region, cfg.import_size) };
                        return Err(KmemError::OutOfMemory);
                    }
                }
            }
        };

        // SAFETY: freshly built slab record, not on any list yet.
        unsafe { st.empty.push_front(slab_ptr) };
        st.imported += cfg.import_size;
        log::trace!(
            "kmem: cache '{}' grew by {} bytes ({} slots)",
            cfg.name,
            cfg.import_size,
            // SAFETY: just initialized.
            unsafe { slab_ptr.as_ref().total() }
        );
        Ok(slab_ptr)
    }

    /// Allocate and seed an external slab record plus one bufctl per slot.
    /// On any failure everything built so far is released and `None` comes
    /// back.
    fn build_external_slab(&self, region: NonNull<u8>, flags: AllocFlags) -> Option<NonNull<Slab>> {
        let cfg = self.cfg();
        let total = cfg.import_size / cfg.obj_size;
        debug_assert!(total > 0);

        let record = bootstrap::slab_cache().alloc(flags)?.cast::<Slab>();
        // SAFETY: exclusive slab-record slot of the right size/alignment.
        unsafe {
            record
                .as_ptr()
                .write(Slab::new_external(region, cfg.import_size, total));
        }
        let slab = unsafe { &mut *record.as_ptr() };

        for i in 0..total {
            let Some(ctl_mem) = bootstrap::bufctl_cache().alloc(flags) else {
                self.unwind_external_slab(record);
                return None;
            };
            let ctl = ctl_mem.cast::<BufCtl>();
            let addr = region.as_ptr() as usize + i * cfg.obj_size;
            // SAFETY: exclusive bufctl slot; addr lies within the region.
            unsafe {
                ctl.as_ptr().write(BufCtl {
                    next: None,
                    addr: NonNull::new_unchecked(addr as *mut u8),
                    slab: record,
                });
            }
            slab.seed_ctl(ctl);
        }
        Some(record)
    }

    fn unwind_external_slab(&self, record: NonNull<Slab>) {
        // SAFETY: the record is ours alone; it never reached a list.
        let slab = unsafe { &mut *record.as_ptr() };
        while let Some(ctl) = slab.drain_ctl() {
            // SAFETY: the bufctl came from the bufctl cache moments ago.
            unsafe { bootstrap::bufctl_cache().free(ctl.cast()) };
        }
        // SAFETY: ditto for the record itself.
        unsafe { bootstrap::slab_cache().free(record.cast()) };
    }

    fn run_dtor(&self, obj: NonNull<u8>) {
        let cfg = self.cfg();
        if let Some(dtor) = cfg.hooks.dtor {
            dtor(obj, cfg.hooks.cookie);
        }
    }

    /// Release every empty slab's region back to the source arena.
    ///
    /// Magazine-held objects are pushed back into the slab layer first
    /// (running destructors), so a quiescent cache reaps down to nothing.
    pub fn reap(&self) {
        self.purge_magazines();
        let cfg = self.cfg();
        let mut st = self.state.lock();
        let mut released = 0usize;
        while let Some(slab) = st.empty.pop_front() {
            let size = destroy_slab(cfg, slab);
            st.imported -= size;
            released += size;
        }
        if released > 0 {
            log::debug!("kmem: cache '{}' reaped {} bytes", cfg.name, released);
        }
    }

    /// Empty the per-CPU magazines in place and drain the depot entirely.
    /// Every displaced object goes through its destructor and back to its
    /// slab.
    fn purge_magazines(&self) {
        let Some(pcpu) = self.pcpu.get() else {
            return;
        };
        for slot in pcpu.iter() {
            let _irq = IrqGuard::new();
            let mut shell = slot.lock();
            while let Some(obj) = shell.loaded().try_pop() {
                self.run_dtor(obj);
                self.slab_free(obj);
            }
            while let Some(obj) = shell.previous().try_pop() {
                self.run_dtor(obj);
                self.slab_free(obj);
            }
        }
        let (notempty, empty) = self.depot.lock().take_all();
        self.drain_magazine_chain(notempty);
        self.drain_magazine_chain(empty);
    }

    /// Walk a detached depot chain: destruct and return every round, then
    /// hand each magazine back to the magazine cache's slab layer.
    fn drain_magazine_chain(&self, mut head: Option<NonNull<Magazine>>) {
        while let Some(mut mag_ptr) = head {
            // SAFETY: the chain was detached under the depot lock; we are
            // its only holder.
            let mag = unsafe { mag_ptr.as_mut() };
            head = mag.next.take();
            while let Some(obj) = mag.try_pop() {
                self.run_dtor(obj);
                self.slab_free(obj);
            }
            // SAFETY: drained above.
            unsafe { bootstrap::free_magazine(mag_ptr) };
        }
    }

    /// Tear the cache down and release all of its memory.
    ///
    /// Panics if callers still hold objects. Reserved (bootstrap) caches
    /// refuse.
    ///
    /// # Safety
    /// No other reference to this cache may be used afterwards, and no
    /// operation may be in flight on it.
    pub unsafe fn destroy(&'static self) {
        let cfg = self.cfg();
        assert!(cfg.dynamic, "kmem: reserved caches cannot be destroyed");

        registry::remove(self);
        cfg.source.del_importer(self);

        // Pull the magazines out of every slot; the shells are dead after
        // this.
        if let Some(pcpu) = self.pcpu.get() {
            for slot in pcpu.iter() {
                let (loaded, previous) = {
                    let _irq = IrqGuard::new();
                    slot.lock().take_for_teardown()
                };
                for mut mag_ptr in [loaded, previous] {
                    // SAFETY: taken out of the slot above; we own it.
                    let mag = unsafe { mag_ptr.as_mut() };
                    while let Some(obj) = mag.try_pop() {
                        self.run_dtor(obj);
                        self.slab_free(obj);
                    }
                    // SAFETY: drained above.
                    unsafe { bootstrap::free_magazine(mag_ptr) };
                }
            }
        }
        let (notempty, empty) = self.depot.lock().take_all();
        self.drain_magazine_chain(notempty);
        self.drain_magazine_chain(empty);

        {
            let mut st = self.state.lock();
            assert!(
                st.partial.is_empty() && st.full.is_empty(),
                "kmem: destroying cache '{}' with {} live object(s)",
                cfg.name,
                self.live.load(Ordering::Relaxed)
            );
            while let Some(slab) = st.empty.pop_front() {
                let size = destroy_slab(cfg, slab);
                st.imported -= size;
            }
            debug_assert_eq!(st.imported, 0);
            st.hash.release();
        }

        if let Some(pcpu) = self.pcpu.get() {
            // SAFETY: all magazines were taken; nothing touches the slots
            // again.
            unsafe { pcpu.release() };
        }
        log::debug!("kmem: destroyed cache '{}'", cfg.name);

        // Give the container slot itself back, last.
        let ptr = NonNull::from(self).cast::<u8>();
        // SAFETY: `self` came from the cache-of-caches in create(); the
        // caller promises no further use.
        unsafe { bootstrap::cache_cache().free(ptr) };
    }

    /// Snapshot the cache's counters. Takes each lock briefly.
    pub fn stats(&self) -> CacheStats {
        let cfg = self.cfg();
        let fastpath_allocs = self
            .pcpu
            .get()
            .map(|pcpu| pcpu.iter().map(|slot| slot.lock().allocs()).sum::<u64>())
            .unwrap_or(0);
        let st = self.state.lock();
        let depot = self.depot.lock();
        CacheStats {
            name: cfg.name,
            obj_size: cfg.obj_size,
            layout: cfg.layout,
            live: self.live.load(Ordering::Relaxed),
            empty_slabs: st.empty.len(),
            partial_slabs: st.partial.len(),
            full_slabs: st.full.len(),
            slab_allocs: st.slab_allocs,
            slab_frees: st.slab_frees,
            imported_bytes: st.imported,
            hash_items: st.hash.len(),
            hash_buckets: st.hash.bucket_count(),
            fastpath_allocs,
            depot_notempty: depot.notempty.len(),
            depot_empty: depot.empty.len(),
            depot_target: depot.target(),
            depot_contended: depot.contended(),
        }
    }

    /// Current magazine-capacity target of the depot.
    pub fn magazine_target(&self) -> usize {
        self.depot.lock().target()
    }

    /// Adjust the depot's contention window and threshold.
    pub fn set_resize_tunables(&self, window_ns: u64, threshold: u64) {
        self.depot.lock().set_tunables(window_ns, threshold);
    }

    #[cfg(test)]
    pub(crate) fn depot_for_tests(&self) -> &Depot {
        &self.depot
    }

    #[cfg(test)]
    pub(crate) fn pcpu_for_tests(&self) -> &PcpuArray {
        self.pcpu.get().expect("cache initialized")
    }
}

/// Release one empty slab: bufctls and record back to their caches
/// (external layout), the region back to the source arena.
fn destroy_slab(cfg: &CacheCfg, slab_ptr: NonNull<Slab>) -> usize {
    // SAFETY: the slab was unlinked from the empty list by the caller,
    // which holds the cache lock.
    let slab = unsafe { &mut *slab_ptr.as_ptr() };
    debug_assert_eq!(slab.busy(), 0);
    let region = slab.region();
    let size = slab.region_size();

    if cfg.layout == SlabLayout::External {
        while let Some(ctl) = slab.drain_ctl() {
            // SAFETY: a free slot's bufctl belongs to the slab; each is
            // returned exactly once.
            unsafe { bootstrap::bufctl_cache().free(ctl.cast()) };
        }
        // SAFETY: external records come from the slab-record cache.
        unsafe { bootstrap::slab_cache().free(slab_ptr.cast()) };
    }
    // SAFETY: the region was imported from this source with this size and
    // no object in it is outstanding.
    unsafe { cfg.source.free(region, size) };
    size
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    fn plain_cache(name: &'static str, size: usize, align: usize) -> &'static KmemCache {
        KmemCache::create(name, size, align, CacheFlags::empty(), None, ObjectHooks::NONE)
            .expect("cache creation on host")
    }

    fn counter_cookie() -> (*mut (), &'static AtomicUsize) {
        let counter: &'static AtomicUsize = Box::leak(Box::new(AtomicUsize::new(0)));
        (core::ptr::from_ref(counter).cast_mut().cast(), counter)
    }

    #[test]
    fn cold_alloc_imports_one_page_and_recycles() {
        let cache = plain_cache("t_cold64", 64, 64);
        assert_eq!(cache.object_size(), 64);
        assert_eq!(cache.layout(), SlabLayout::Embedded);

        let before = cache.stats();
        assert_eq!(before.imported_bytes, 0);
        assert_eq!(before.slab_allocs, 0);

        let obj = cache.alloc(AllocFlags::empty()).expect("first allocation");
        assert_eq!(obj.as_ptr() as usize % 64, 0);
        let after = cache.stats();
        assert_eq!(after.imported_bytes, PAGE_SIZE);
        assert_eq!(after.slab_allocs, 1);
        assert_eq!(after.live, 1);
        assert_eq!(after.partial_slabs, 1);

        // A freed object comes straight back off the loaded magazine.
        unsafe { cache.free(obj) };
        assert_eq!(cache.stats().live, 0);
        let again = cache.alloc(AllocFlags::empty()).expect("recycled allocation");
        assert_eq!(again, obj);
        assert_eq!(cache.stats().slab_allocs, 1, "second alloc was a magazine hit");

        unsafe {
            cache.free(again);
            cache.destroy();
        }
    }

    #[test]
    fn create_validates_geometry() {
        assert_eq!(
            KmemCache::create("t_align3", 64, 3, CacheFlags::empty(), None, ObjectHooks::NONE)
                .err(),
            Some(KmemError::BadAlign)
        );
        assert_eq!(
            KmemCache::create(
                "t_align8k",
                64,
                2 * PAGE_SIZE,
                CacheFlags::empty(),
                None,
                ObjectHooks::NONE
            )
            .err(),
            Some(KmemError::BadAlign)
        );
        assert_eq!(
            KmemCache::create("t_zero", 0, 8, CacheFlags::empty(), None, ObjectHooks::NONE).err(),
            Some(KmemError::BadSize)
        );
    }

    #[test]
    fn layout_follows_size_and_flags() {
        let small = plain_cache("t_small", SMALL_OBJECT_CUTOFF, 8);
        assert_eq!(small.layout(), SlabLayout::Embedded);

        let large = plain_cache("t_large", SMALL_OBJECT_CUTOFF + 1, 8);
        assert_eq!(large.layout(), SlabLayout::External);

        let untouchable = KmemCache::create(
            "t_notouch",
            32,
            8,
            CacheFlags::NO_TOUCH,
            None,
            ObjectHooks::NONE,
        )
        .expect("cache creation");
        assert_eq!(untouchable.layout(), SlabLayout::External);

        unsafe {
            small.destroy();
            large.destroy();
            untouchable.destroy();
        }
    }

    #[test]
    fn ctor_failure_returns_the_slot() {
        fn every_third_fails(
            _obj: NonNull<u8>,
            cookie: *mut (),
            _flags: AllocFlags,
        ) -> Result<(), CtorError> {
            let counter = unsafe { &*cookie.cast::<AtomicUsize>() };
            let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
            if n % 3 == 0 { Err(CtorError) } else { Ok(()) }
        }

        let (cookie, calls) = counter_cookie();
        let cache = KmemCache::create(
            "t_ctorfail",
            64,
            8,
            CacheFlags::empty(),
            None,
            ObjectHooks {
                ctor: Some(every_third_fails),
                dtor: None,
                cookie,
            },
        )
        .expect("cache creation");

        let mut held = Vec::new();
        for attempt in 1..=6 {
            let got = cache.alloc(AllocFlags::MAY_FAIL);
            if attempt % 3 == 0 {
                assert!(got.is_none(), "attempt {attempt} should fail in the ctor");
            } else {
                held.push(got.expect("constructor passes"));
            }
        }
        assert_eq!(calls.load(Ordering::Relaxed), 6);

        let stats = cache.stats();
        assert_eq!(stats.live, 4);
        assert_eq!(stats.slab_allocs - stats.slab_frees, 4);

        for obj in held {
            unsafe { cache.free(obj) };
        }
        assert_eq!(cache.stats().live, 0);
        unsafe { cache.destroy() };
    }

    #[test]
    fn dtor_runs_when_objects_leave_the_magazine_layer() {
        fn count_dtor(_obj: NonNull<u8>, cookie: *mut ()) {
            let counter = unsafe { &*cookie.cast::<AtomicUsize>() };
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let (cookie, dtors) = counter_cookie();
        let cache = KmemCache::create(
            "t_dtor",
            64,
            8,
            CacheFlags::empty(),
            None,
            ObjectHooks {
                ctor: None,
                dtor: Some(count_dtor),
                cookie,
            },
        )
        .expect("cache creation");

        let obj = cache.alloc(AllocFlags::empty()).expect("allocation");
        unsafe { cache.free(obj) };
        // Cached in a magazine: still constructed, destructor pending.
        assert_eq!(dtors.load(Ordering::Relaxed), 0);

        cache.reap();
        assert_eq!(dtors.load(Ordering::Relaxed), 1);
        let stats = cache.stats();
        assert_eq!(stats.imported_bytes, 0);
        assert_eq!(stats.empty_slabs + stats.partial_slabs + stats.full_slabs, 0);

        unsafe { cache.destroy() };
    }

    #[test]
    fn grown_magsize_reaches_the_cpu_slot() {
        let cache = plain_cache("t_magsize", 64, 8);
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(cache.alloc(AllocFlags::empty()).expect("allocation"));
        }

        // Three frees push a full magazine through to the depot.
        for obj in held.drain(..3) {
            unsafe { cache.free(obj) };
        }
        assert!(cache.stats().depot_notempty >= 1);

        {
            let mut depot = cache.depot_for_tests().lock();
            depot.set_tunables(u64::MAX, 0);
            depot.note_contention(1);
            assert_eq!(depot.target(), 2);
        }

        // The next depot round-trip on the free path adopts the target.
        for obj in held.drain(..) {
            unsafe { cache.free(obj) };
        }
        assert_eq!(cache.pcpu_for_tests().slot().lock().magsize(), 2);
        assert_eq!(cache.magazine_target(), 2);

        cache.reap();
        unsafe { cache.destroy() };
    }

    #[test]
    #[should_panic(expected = "live object")]
    fn destroy_with_live_objects_panics() {
        let cache = plain_cache("t_leak", 64, 8);
        let _held = cache.alloc(AllocFlags::empty()).expect("allocation");
        unsafe { cache.destroy() };
    }

    #[test]
    #[should_panic(expected = "unknown address")]
    fn freeing_a_foreign_address_is_fatal() {
        let cache = plain_cache("t_foreign", SMALL_OBJECT_CUTOFF + 1, 8);
        let _held = cache.alloc(AllocFlags::empty()).expect("allocation");
        let mut not_ours = 0u64;
        // The magazine layer caches the pointer blindly; the purge pushes
        // it down to the slab layer, where the index lookup catches it.
        unsafe { cache.free(NonNull::from(&mut not_ours).cast()) };
        cache.reap();
    }
}
