//! Compile-time defaults for the allocator.
//!
//! Per-cache knobs (magazine resize window and threshold) can be changed at
//! runtime through [`crate::cache::KmemCache::set_resize_tunables`]; the rest
//! are fixed at build time.

/// Backing page granularity. Source arenas hand out regions in multiples of
/// this, aligned to it.
pub const PAGE_SIZE: usize = 4096;

/// Objects at or below this size keep their freelist link inside the object
/// itself and share a single page with the slab record. Larger objects (and
/// no-touch caches) switch to external bufctl bookkeeping.
pub const SMALL_OBJECT_CUTOFF: usize = PAGE_SIZE / 8;

/// Hard upper bound on magazine capacity; magazine storage is sized for
/// this many rounds. Chosen so the magazine record itself stays below
/// `SMALL_OBJECT_CUTOFF`.
pub const MAG_MAX_CAPACITY: usize = 48;

/// Capacity target a fresh depot starts from. Grows under contention,
/// never shrinks.
pub const MAG_INIT_TARGET: usize = 1;

/// Slots carved per slab in bufctl mode (import size is this many objects,
/// rounded up to whole pages).
pub const BUFCTL_SLOTS_PER_SLAB: usize = 8;

/// Quantum caches import at least this multiple of the arena's quantum
/// maximum, rounded up to a power of two.
pub const QUANTUM_IMPORT_FACTOR: usize = 3;

/// Default depot contention-accounting window.
pub const RESIZE_WINDOW_NS: u64 = 1_000_000_000;

/// Contended depot acquisitions tolerated per window before the magazine
/// target is bumped.
pub const RESIZE_THRESHOLD: u64 = 1;

/// Buckets in the embedded bufctl hash table every cache starts with.
pub const HASH_INLINE_BUCKETS: usize = 16;

/// The hash index doubles once it holds more than this many entries per
/// bucket on average.
pub const HASH_MAX_LOAD: usize = 4;

/// Upper bound on per-CPU cache slots.
pub const MAX_CPU_SLOTS: usize = 64;
