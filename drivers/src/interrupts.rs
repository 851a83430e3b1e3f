//! Per-vector interrupt occurrence counters, independent of the IRQ routing
//! table in [`crate::irq`]. Exposed for diagnostics (`/proc/interrupts`-style
//! reporting) without touching the hot IRQ dispatch path.

use slopos_lib::kernel_services::driver_runtime::DRIVER_IRQ_LINES;
use slopos_lib::spinlock::IrqMutex;

static COUNTS: IrqMutex<[u64; DRIVER_IRQ_LINES]> = IrqMutex::new([0; DRIVER_IRQ_LINES]);

/// Records one occurrence of `irq_line`. Out-of-range lines are ignored.
pub fn record(irq_line: u8) {
    let idx = irq_line as usize;
    if idx >= DRIVER_IRQ_LINES {
        return;
    }
    let mut counts = COUNTS.lock();
    counts[idx] = counts[idx].saturating_add(1);
}

/// Returns the occurrence count for `irq_line`, or 0 if out of range.
pub fn count(irq_line: u8) -> u64 {
    let idx = irq_line as usize;
    if idx >= DRIVER_IRQ_LINES {
        return 0;
    }
    COUNTS.lock()[idx]
}

/// Returns a snapshot of all per-line counters.
pub fn snapshot() -> [u64; DRIVER_IRQ_LINES] {
    *COUNTS.lock()
}
