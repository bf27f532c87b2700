//! Interrupt-masked critical sections.
//!
//! The per-CPU fast path must not be re-entered by an interrupt handler on
//! the same CPU, so it runs with local interrupts masked. [`IrqGuard`]
//! captures the previous state on entry and restores it on drop, so nested
//! sections behave.
//!
//! Hosted builds (the `std` feature) have no interrupt plane; the guard is a
//! no-op there and the per-CPU spin lock alone provides the critical
//! section.

/// RAII scope with local interrupts masked.
///
/// Construction disables interrupts on the current CPU and records whether
/// they were enabled; drop restores the recorded state.
#[must_use]
pub(crate) struct IrqGuard {
    state: usize,
}

impl IrqGuard {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            state: arch::disable(),
        }
    }
}

impl Drop for IrqGuard {
    #[inline(always)]
    fn drop(&mut self) {
        arch::restore(self.state);
    }
}

#[cfg(all(target_arch = "aarch64", not(feature = "std")))]
mod arch {
    use aarch64_cpu::registers::{DAIF, Readable, Writeable};

    #[inline(always)]
    pub(super) fn disable() -> usize {
        let state = DAIF.get() as usize;
        // SAFETY: daifset is an immediate-only instruction with no
        // register-level wrapper; masking IRQs has no memory effects.
        unsafe { core::arch::asm!("msr daifset, #2", options(nomem, nostack)) };
        state
    }

    #[inline(always)]
    pub(super) fn restore(state: usize) {
        DAIF.set(state as u64);
    }
}

#[cfg(all(target_arch = "x86_64", not(feature = "std")))]
mod arch {
    use x86_64::instructions::interrupts;

    #[inline(always)]
    pub(super) fn disable() -> usize {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled as usize
    }

    #[inline(always)]
    pub(super) fn restore(state: usize) {
        if state != 0 {
            interrupts::enable();
        }
    }
}

#[cfg(any(
    feature = "std",
    not(any(target_arch = "aarch64", target_arch = "x86_64"))
))]
mod arch {
    #[inline(always)]
    pub(super) fn disable() -> usize {
        0
    }

    #[inline(always)]
    pub(super) fn restore(_state: usize) {}
}
