//! Monotonic time for depot contention accounting.
//!
//! The depot only compares timestamps against a window; it never needs wall
//! time. Hosted builds read a process-relative `Instant`. Kernel builds
//! register their tick source with [`set_time_source`] before `kmem::init`;
//! if none is registered every read returns 0, which freezes the accounting
//! window but leaves the threshold logic working.

use kmem_utils::Once;

static TIME_SOURCE: Once<fn() -> u64> = Once::new();

/// Register the nanosecond tick source. First call wins; later calls are
/// ignored.
pub fn set_time_source(source: fn() -> u64) {
    TIME_SOURCE.call_once(|| source);
}

/// Current monotonic time in nanoseconds.
pub(crate) fn now_ns() -> u64 {
    match TIME_SOURCE.get() {
        Some(source) => source(),
        None => fallback_now(),
    }
}

#[cfg(feature = "std")]
fn fallback_now() -> u64 {
    use kmem_utils::Lazy;
    use std::time::Instant;

    static ORIGIN: Lazy<Instant> = Lazy::new(|| Instant::now());
    let nanos = ORIGIN.elapsed().as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

#[cfg(not(feature = "std"))]
fn fallback_now() -> u64 {
    0
}
