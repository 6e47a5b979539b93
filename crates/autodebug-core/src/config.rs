//! Options shared by the library and the command line front end.

use crate::OutputMask;

/// Default time to wait for the engine to finish loading a dump, in milliseconds.
pub const DEFAULT_ATTACH_TIMEOUT_MS: u32 = 10_000;

/// How a debugger session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Passed to `WaitForEvent` after the dump is opened.
    pub attach_timeout_ms: u32,
    /// Engine output kinds captured by `execute`.
    pub output_mask: OutputMask,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            attach_timeout_ms: DEFAULT_ATTACH_TIMEOUT_MS,
            output_mask: OutputMask::default(),
        }
    }
}

/// Which report sections to print.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportOptions {
    /// Print only the per-type statistics, not every object.
    pub stats_only: bool,
    pub skip_heap: bool,
    pub skip_modules: bool,
}
