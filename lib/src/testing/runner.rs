//! Single-test execution with panic containment.
//!
//! Each test closure runs inside `catch_panic!` so one bad test doesn't take
//! the rest of the suite down with it.

use super::TestResult;

pub fn run_single_test<F: FnOnce() -> TestResult>(name: &str, test_fn: F) -> TestResult {
    let mut outcome = TestResult::Pass;
    let rc = crate::catch_panic!({
        outcome = test_fn();
        if outcome.is_failure() { -1 } else { 0 }
    });

    if rc != 0 && outcome.is_pass() {
        crate::klog_info!("TEST PANIC: {}", name);
        return TestResult::Panic;
    }

    outcome
}
