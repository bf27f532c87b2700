//! CPU-slot identity for the per-CPU cache layer.
//!
//! Every cache owns one front-door slot per CPU. The slot count is fixed
//! when the allocator comes up; the current slot id is read on every fast
//! path entry.
//!
//! Hosted builds size the array from the scheduler's parallelism and hand
//! each thread a slot round-robin, which keeps the single-thread LIFO
//! behavior observable in tests. Kernel builds call [`configure`] with the
//! real CPU count and a `current_cpu()` reader before `kmem::init`.

use kmem_utils::Once;

use crate::params::MAX_CPU_SLOTS;

struct CpuPlan {
    count: usize,
    current: fn() -> usize,
}

static PLAN: Once<CpuPlan> = Once::new();

/// Fix the slot count and the current-cpu reader. First call wins; must
/// happen before the first cache is created.
pub fn configure(count: usize, current: fn() -> usize) {
    PLAN.call_once(|| CpuPlan {
        count: count.clamp(1, MAX_CPU_SLOTS),
        current,
    });
}

fn plan() -> &'static CpuPlan {
    PLAN.call_once(default_plan)
}

/// Number of per-CPU slots every cache allocates.
pub(crate) fn slot_count() -> usize {
    plan().count
}

/// Slot id of the executing CPU, always `< slot_count()`.
pub(crate) fn current_slot() -> usize {
    let plan = plan();
    (plan.current)() % plan.count
}

#[cfg(feature = "std")]
fn default_plan() -> CpuPlan {
    let count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_CPU_SLOTS);
    CpuPlan {
        count,
        current: host_thread_slot,
    }
}

#[cfg(feature = "std")]
fn host_thread_slot() -> usize {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::thread_local! {
        static SLOT: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    SLOT.with(|slot| *slot)
}

#[cfg(not(feature = "std"))]
fn default_plan() -> CpuPlan {
    CpuPlan {
        count: 1,
        current: || 0,
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn slot_is_stable_within_a_thread() {
        assert_eq!(current_slot(), current_slot());
        assert!(current_slot() < slot_count());
    }

    #[test]
    fn spawned_threads_get_valid_slots() {
        let there = std::thread::spawn(|| current_slot())
            .join()
            .expect("spawned thread panicked");
        assert!(there < slot_count());
    }
}
