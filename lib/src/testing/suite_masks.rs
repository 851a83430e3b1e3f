// Bitmask values selecting which test suites `itests.suite_mask=` runs.

/// Scheduler, memory, filesystem and driver suites all run under this bit today;
/// categories split out as dedicated suite groups get added.
pub const SUITE_SCHEDULER: u32 = 1 << 0;

/// Every suite bit set; the default when no mask is given on the command line.
pub const SUITE_ALL: u32 = u32::MAX;
