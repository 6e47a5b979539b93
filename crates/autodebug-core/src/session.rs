//! Debugger engine session over a memory dump.
//!
//! Wraps the DbgEng client interfaces: opens the dump, waits for the engine to
//! attach, runs commands with their text output captured through an
//! `IDebugOutputCallbacks` implementation and ends the session on drop.

#![allow(non_snake_case)]

use std::ffi::{CString, c_void};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use windows::Win32::Storage::FileSystem::VS_FIXEDFILEINFO;
use windows::Win32::System::Diagnostics::Debug::Extensions::{
    DEBUG_ANY_ID, DEBUG_END_ACTIVE_DETACH, DEBUG_EXECUTE_DEFAULT, DEBUG_MODNAME_IMAGE,
    DEBUG_MODULE_PARAMETERS, DEBUG_OUTCTL_THIS_CLIENT, DEBUG_WAIT_DEFAULT, DebugCreate,
    IDebugAdvanced, IDebugClient, IDebugControl, IDebugDataSpaces, IDebugOutputCallbacks,
    IDebugOutputCallbacks_Impl, IDebugSymbols3, IDebugSystemObjects,
};
use windows::core::{Interface, PCSTR, implement, s};

use crate::{
    Architecture, DataTargetInfo, Error, ModuleVersion, OutputCapture, OutputMask, Result,
    SessionOptions,
};

/// Commands are executed one at a time across the whole process.
static EXECUTE_LOCK: Mutex<()> = Mutex::new(());

// =============================================================================
// Output callbacks
// =============================================================================

#[implement(IDebugOutputCallbacks)]
struct CaptureCallbacks {
    capture: Arc<OutputCapture>,
}

impl IDebugOutputCallbacks_Impl for CaptureCallbacks_Impl {
    fn Output(&self, mask: u32, text: &PCSTR) -> windows::core::Result<()> {
        if text.is_null() {
            return Ok(());
        }
        let bytes = unsafe { text.as_bytes() };
        self.capture
            .accept(OutputMask::from_bits(mask), &String::from_utf8_lossy(bytes));
        Ok(())
    }
}

// =============================================================================
// Modules
// =============================================================================

/// A module recorded in the dump.
#[derive(Debug, Clone)]
pub struct DumpModule {
    pub base: u64,
    pub size: u32,
    pub timestamp: u32,
    /// Full image path as recorded by the engine.
    pub image_path: PathBuf,
}

impl DumpModule {
    /// Lowercase file name of the image.
    pub fn file_name(&self) -> String {
        crate::module_file_name(&self.image_path.to_string_lossy()).to_lowercase()
    }
}

/// Enumerate the loaded modules known to the engine.
pub(crate) fn loaded_modules(symbols: &IDebugSymbols3) -> Result<Vec<DumpModule>> {
    let mut loaded = 0u32;
    let mut unloaded = 0u32;
    unsafe { symbols.GetNumberModules(&mut loaded, &mut unloaded) }
        .map_err(|e| Error::Session(format!("GetNumberModules failed: {}", e)))?;

    let mut modules = Vec::with_capacity(loaded as usize);
    for index in 0..loaded {
        let base = match unsafe { symbols.GetModuleByIndex(index) } {
            Ok(base) => base,
            Err(e) => {
                tracing::debug!(index, error = %e, "skipping module");
                continue;
            }
        };

        let mut params = DEBUG_MODULE_PARAMETERS::default();
        if let Err(e) =
            unsafe { symbols.GetModuleParameters(1, Some(&base as *const u64), 0, &mut params) }
        {
            tracing::debug!(base = format_args!("{:#x}", base), error = %e, "no module parameters");
            continue;
        }

        let mut name_buf = [0u8; 1024];
        let mut name_len = 0u32;
        let image_path = match unsafe {
            symbols.GetModuleNameString(
                DEBUG_MODNAME_IMAGE,
                DEBUG_ANY_ID,
                base,
                Some(&mut name_buf[..]),
                Some(&mut name_len as *mut u32),
            )
        } {
            Ok(()) => {
                let len = (name_len as usize).saturating_sub(1).min(name_buf.len());
                PathBuf::from(String::from_utf8_lossy(&name_buf[..len]).into_owned())
            }
            Err(_) => PathBuf::new(),
        };

        modules.push(DumpModule {
            base,
            size: params.Size,
            timestamp: params.TimeDateStamp,
            image_path,
        });
    }

    Ok(modules)
}

/// Read the fixed file version of a module from its version resource.
pub(crate) fn module_version(symbols: &IDebugSymbols3, base: u64) -> Option<ModuleVersion> {
    let mut info = VS_FIXEDFILEINFO::default();
    let result = unsafe {
        symbols.GetModuleVersionInformation(
            DEBUG_ANY_ID,
            base,
            s!("\\"),
            Some(&mut info as *mut VS_FIXEDFILEINFO as *mut c_void),
            std::mem::size_of::<VS_FIXEDFILEINFO>() as u32,
            None,
        )
    };

    match result {
        Ok(()) => Some(ModuleVersion::from_file_version(
            info.dwFileVersionMS,
            info.dwFileVersionLS,
        )),
        Err(e) => {
            tracing::debug!(base = format_args!("{:#x}", base), error = %e, "no version resource");
            None
        }
    }
}

// =============================================================================
// DebugSession
// =============================================================================

/// An open DbgEng session on a memory dump.
pub struct DebugSession {
    dump_path: PathBuf,
    client: IDebugClient,
    control: IDebugControl,
    data_spaces: IDebugDataSpaces,
    symbols: IDebugSymbols3,
    system_objects: IDebugSystemObjects,
    advanced: IDebugAdvanced,
    capture: Arc<OutputCapture>,
    callbacks: IDebugOutputCallbacks,
    ended: bool,
}

impl DebugSession {
    /// Create a debug client, open `dump_path` and wait for the engine to
    /// finish loading it.
    pub fn open(dump_path: &Path, options: SessionOptions) -> Result<Self> {
        let client: IDebugClient = unsafe { DebugCreate() }
            .map_err(|e| Error::Session(format!("Failed to create DebugClient, hr={:x}.", e.code().0)))?;
        let control: IDebugControl = client.cast()?;
        let data_spaces: IDebugDataSpaces = client.cast()?;
        let symbols: IDebugSymbols3 = client.cast()?;
        let system_objects: IDebugSystemObjects = client.cast()?;
        let advanced: IDebugAdvanced = client.cast()?;

        let path = CString::new(dump_path.to_string_lossy().into_owned())
            .map_err(|_| Error::Other(format!("Invalid dump path: {}", dump_path.display())))?;

        tracing::debug!(path = %dump_path.display(), "opening dump");
        unsafe { client.OpenDumpFile(PCSTR(path.as_ptr() as *const u8)) }
            .map_err(|e| Error::Session(format!("Failed to OpenDumpFile, hr={:x}.", e.code().0)))?;

        unsafe { control.WaitForEvent(DEBUG_WAIT_DEFAULT, options.attach_timeout_ms) }.map_err(|e| {
            Error::Session(format!("Failed to attach to dump file, hr={:x}.", e.code().0))
        })?;
        tracing::info!(path = %dump_path.display(), "attached to dump");

        let capture = Arc::new(OutputCapture::new(options.output_mask));
        let callbacks: IDebugOutputCallbacks = CaptureCallbacks {
            capture: Arc::clone(&capture),
        }
        .into();

        Ok(Self {
            dump_path: dump_path.to_path_buf(),
            client,
            control,
            data_spaces,
            symbols,
            system_objects,
            advanced,
            capture,
            callbacks,
            ended: false,
        })
    }

    pub fn dump_path(&self) -> &Path {
        &self.dump_path
    }

    /// Execute a debugger command and return its captured output.
    ///
    /// The client's previous output callbacks are restored afterwards. An
    /// engine failure is reported inside the returned text, not as an error.
    pub fn execute(&self, command: &str) -> Result<String> {
        let _guard = EXECUTE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        let command = CString::new(command)
            .map_err(|_| Error::Other(format!("Command contains a NUL byte: {:?}", command)))?;

        let previous = unsafe { self.client.GetOutputCallbacks() }.ok();
        let result = self.execute_captured(&command);

        let restored = match &previous {
            Some(callbacks) => unsafe { self.client.SetOutputCallbacks(callbacks) },
            None => unsafe { self.client.SetOutputCallbacks(None::<&IDebugOutputCallbacks>) },
        };
        if let Err(e) = restored {
            tracing::warn!(error = %e, "failed to restore output callbacks");
        }

        let output = self.capture.take();
        result.map(|()| output)
    }

    fn execute_captured(&self, command: &CString) -> Result<()> {
        unsafe { self.client.SetOutputCallbacks(&self.callbacks) }?;

        tracing::debug!(command = %command.to_string_lossy(), "executing");
        let result = unsafe {
            self.control.Execute(
                DEBUG_OUTCTL_THIS_CLIENT,
                PCSTR(command.as_ptr() as *const u8),
                DEBUG_EXECUTE_DEFAULT,
            )
        };

        if let Err(e) = result {
            self.capture.push_str(&format!(
                "Command encountered an error. HRESULT={:x}.",
                e.code().0
            ));
        }
        Ok(())
    }

    /// Architecture, pointer size and display name of the dump target.
    pub fn data_target_info(&self) -> Result<DataTargetInfo> {
        let architecture = self.architecture()?;
        Ok(DataTargetInfo {
            architecture,
            pointer_size: architecture.pointer_size(),
            display_name: format!("DbgEng, IDebugClient = {:x}", self.client.as_raw() as usize),
        })
    }

    pub fn architecture(&self) -> Result<Architecture> {
        let machine = unsafe { self.control.GetActualProcessorType() }?;
        Ok(Architecture::from_machine_type(machine))
    }

    /// Modules recorded in the dump.
    pub fn modules(&self) -> Result<Vec<DumpModule>> {
        loaded_modules(&self.symbols)
    }

    pub(crate) fn data_spaces(&self) -> &IDebugDataSpaces {
        &self.data_spaces
    }

    pub(crate) fn symbols(&self) -> &IDebugSymbols3 {
        &self.symbols
    }

    pub(crate) fn system_objects(&self) -> &IDebugSystemObjects {
        &self.system_objects
    }

    pub(crate) fn advanced(&self) -> &IDebugAdvanced {
        &self.advanced
    }

    /// End the engine session. Called automatically on drop.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if let Err(e) = unsafe { self.client.EndSession(DEBUG_END_ACTIVE_DETACH) } {
            tracing::warn!(error = %e, "EndSession failed");
        }
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.end();
    }
}

impl std::fmt::Display for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dump filename : {}", self.dump_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_respect_mask() {
        let capture = Arc::new(OutputCapture::new(OutputMask::NORMAL));
        let callbacks: IDebugOutputCallbacks = CaptureCallbacks {
            capture: Arc::clone(&capture),
        }
        .into();

        unsafe {
            callbacks.Output(OutputMask::NORMAL.bits(), s!("lm\n")).unwrap();
            callbacks.Output(OutputMask::VERBOSE.bits(), s!("noise\n")).unwrap();
        }
        assert_eq!(capture.take(), "lm\n");
    }

    #[test]
    fn open_missing_dump_fails() {
        let path = std::env::temp_dir().join("autodebug-missing.dmp");
        match DebugSession::open(&path, SessionOptions::default()) {
            Ok(_) => panic!("opening a missing dump should fail"),
            Err(e) => println!("Expected error for missing dump: {}", e),
        }
    }
}
