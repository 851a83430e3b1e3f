//! Aggregates platform device bring-up that does not belong to a single PCI
//! or ACPI discovery step: the PS/2 controller and its keyboard/mouse ports.

use crate::ps2;
use slopos_lib::klog_debug;

/// Probes and initializes onboard platform devices. Called once from early
/// boot, after the IDT/GDT are live but before the boot init step table runs.
pub fn init_platform_services() {
    ps2::init_controller();
    ps2::keyboard::init();
    ps2::mouse::init();
    klog_debug!("PLATFORM: PS/2 controller and ports initialized");
}
