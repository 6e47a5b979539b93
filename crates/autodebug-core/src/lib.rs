//! Debugger-engine session and managed heap inspection for Windows memory dumps.
//!
//! # Architecture
//!
//! - [`DebugSession`] - DbgEng client attached to a dump; runs debugger
//!   commands and captures their output
//! - [`DacRuntime`] - a managed runtime in the dump, read through its DAC via an
//!   `ICLRDataTarget` that is backed by the same session
//! - [`report`] - SOS-style text output for runtime info, heap and modules
//!
//! Everything except the engine and DAC glue is portable so that statistics
//! and formatting can be tested on any host.

#[cfg(windows)]
pub mod clr;
#[cfg(windows)]
pub mod dac;
pub mod config;
pub mod domain;
pub mod error;
pub mod heap;
pub mod output;
pub mod report;
pub mod runtime;
pub mod script;
#[cfg(windows)]
pub mod session;
#[cfg(windows)]
pub mod target;
pub mod walk;

#[cfg(windows)]
pub use clr::{DacRuntime, discover_runtimes};
pub use config::{DEFAULT_ATTACH_TIMEOUT_MS, ReportOptions, SessionOptions};
pub use domain::{AppDomainInfo, DYNAMIC_MODULE_NAME, ModuleInfo};
pub use error::{Error, Result};
pub use heap::{HeapObject, HeapStatistics, TypeStatistics};
pub use output::{OutputCapture, OutputMask};
pub use runtime::{
    Architecture, ClrFlavor, ClrInfo, DacInfo, DacModuleIndex, DataTargetInfo, ManagedRuntime,
    ModuleVersion, image_directory, module_file_name,
};
pub use script::{CommandScript, DEFAULT_COMMAND_FILE};
pub use walk::{HeapReader, HeapSegment, HeapWalker, MethodTableInfo};
#[cfg(windows)]
pub use session::{DebugSession, DumpModule};
