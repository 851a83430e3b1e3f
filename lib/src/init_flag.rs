//! One-shot and re-entrant init guards.
//!
//! `InitFlag` fires exactly once for the lifetime of the kernel (module
//! bring-up). `StateFlag` is re-enterable: it marks a region active, refuses
//! a second concurrent `enter()`, and can be cleared with `leave()` so the
//! same flag can be used again later (shutdown sequencing, IRQ-path guards).

use core::sync::atomic::{AtomicBool, Ordering};

pub struct InitFlag {
    done: AtomicBool,
}

impl InitFlag {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Returns `true` the first time it's called, `false` on every call
    /// after that.
    pub fn init_once(&self) -> bool {
        self.done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_set(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

pub struct StateFlag {
    active: AtomicBool,
}

impl StateFlag {
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Transitions inactive -> active, returning `true` on success. Returns
    /// `false` if the flag was already active.
    pub fn enter(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn leave(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn set_active(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn set_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Reads and clears the flag in one step, returning what it held.
    pub fn take(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}
