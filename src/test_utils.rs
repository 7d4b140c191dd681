//! Test support: logging initialization and assertion macros.
//!
//! Tests opt into verbose progress output by setting the `TEST_LOG`
//! environment variable (any value but `0`). With it unset, the macros
//! below stay silent on success and only speak on failure, so `cargo
//! test` output stays readable while a failing run can be replayed with
//! full phase markers:
//!
//! ```text
//! TEST_LOG=1 cargo test -- --nocapture
//! ```

use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

static INIT: Once = Once::new();
static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Initializes test logging once per process.
///
/// Reads `TEST_LOG` from the environment; call it at the top of every
/// test (idempotent, cheap).
pub fn init_test_logging() {
    INIT.call_once(|| {
        let verbose = std::env::var("TEST_LOG").is_ok_and(|v| v != "0");
        VERBOSE.store(verbose, Ordering::Relaxed);
    });
}

/// Returns true if verbose test logging is enabled.
#[must_use]
pub fn log_enabled() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Marks the start of a test phase in the verbose log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        if $crate::test_utils::log_enabled() {
            eprintln!("[PHASE] {}", $name);
        }
    };
}

/// Marks a test as complete in the verbose log.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        if $crate::test_utils::log_enabled() {
            eprintln!("[DONE ] {}", $name);
        }
    };
}

/// Asserts a condition, logging the labelled expected/actual pair on
/// failure (and on success when verbose logging is enabled).
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $label:expr, $expected:expr, $actual:expr) => {
        if $cond {
            if $crate::test_utils::log_enabled() {
                eprintln!("[OK   ] {}", $label);
            }
        } else {
            eprintln!(
                "[FAIL ] {}: expected {:?}, got {:?}",
                $label, $expected, $actual
            );
            panic!("assertion failed: {}", $label);
        }
    };
}
