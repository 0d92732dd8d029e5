//! Test harnesses and fixtures shared by the relay-health crates.
// Standard lints
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use std::{collections::HashSet, sync::Once};

pub mod prelude;
pub mod relays;

static INIT: Once = Once::new();

/// Backtrace frames from the test runner and the tokio test runtime.
const HIDDEN_FRAMES: &[&str] = &[
    "tokio::",
    "std::panic",
    "<std::panic::AssertUnwindSafe",
    "std::thread::local",
    "test::run_test_in_process",
    "test::assert_test_result",
    "core::ops::function::FnOnce::call_once",
    "<core::future::",
    "<alloc::boxed::Box",
    "core::result::Result",
];

/// Initialize globals for tests such as the tracing subscriber and panic / error
/// reporting hooks.
///
/// Safe to call from every test: only the first call has any effect.
pub fn init() {
    INIT.call_once(|| {
        let fmt_layer = fmt::layer().with_target(false).with_test_writer();
        // Use the RUST_LOG env var, or by default:
        //  - warn for most tests, and
        //  - hide the expected quota and malformed-cache warnings
        let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new("warn")
                .unwrap()
                .add_directive("relay_health=error".parse().unwrap())
        });

        // Another harness in the same process may already own the global subscriber.
        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(ErrorLayer::default())
            .try_init();

        // A panic hook can only be installed once per process, and the
        // test runner only needs the first one.
        let _ = color_eyre::config::HookBuilder::default()
            .add_frame_filter(Box::new(|frames| {
                let mut displayed = HashSet::new();

                frames.retain(|frame| {
                    // Repeated frames are noise in async backtraces
                    if !displayed.insert((frame.lineno, frame.filename.clone())) {
                        return false;
                    }

                    let Some(name) = frame.name.as_deref() else {
                        return true;
                    };

                    !HIDDEN_FRAMES.iter().any(|hidden| name.starts_with(hidden))
                });
            }))
            .install();
    })
}
