//! Managed runtime description and the runtime abstraction used by reports.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{AppDomainInfo, HeapObject, Result};

// =============================================================================
// Architecture
// =============================================================================

pub const IMAGE_FILE_MACHINE_I386: u32 = 0x014c;
pub const IMAGE_FILE_MACHINE_ARMNT: u32 = 0x01c4;
pub const IMAGE_FILE_MACHINE_AMD64: u32 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u32 = 0xAA64;

/// Processor architecture of the dump target or of this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86,
    Amd64,
    Arm,
    Arm64,
    Unknown,
}

impl Architecture {
    pub fn from_machine_type(machine: u32) -> Self {
        match machine {
            IMAGE_FILE_MACHINE_I386 => Architecture::X86,
            IMAGE_FILE_MACHINE_AMD64 => Architecture::Amd64,
            IMAGE_FILE_MACHINE_ARMNT => Architecture::Arm,
            IMAGE_FILE_MACHINE_ARM64 => Architecture::Arm64,
            _ => Architecture::Unknown,
        }
    }

    pub fn machine_type(&self) -> u32 {
        match self {
            Architecture::X86 => IMAGE_FILE_MACHINE_I386,
            Architecture::Amd64 => IMAGE_FILE_MACHINE_AMD64,
            Architecture::Arm => IMAGE_FILE_MACHINE_ARMNT,
            Architecture::Arm64 => IMAGE_FILE_MACHINE_ARM64,
            Architecture::Unknown => 0,
        }
    }

    pub fn pointer_size(&self) -> u32 {
        match self {
            Architecture::X86 | Architecture::Arm => 4,
            Architecture::Amd64 | Architecture::Arm64 | Architecture::Unknown => 8,
        }
    }

    /// Architecture this binary was compiled for.
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Architecture::Amd64
        } else if cfg!(target_arch = "x86") {
            Architecture::X86
        } else if cfg!(target_arch = "aarch64") {
            Architecture::Arm64
        } else if cfg!(target_arch = "arm") {
            Architecture::Arm
        } else {
            Architecture::Unknown
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Architecture::X86 => "X86",
            Architecture::Amd64 => "Amd64",
            Architecture::Arm => "Arm",
            Architecture::Arm64 => "Arm64",
            Architecture::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// What the debugger knows about the dump as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTargetInfo {
    pub architecture: Architecture,
    pub pointer_size: u32,
    pub display_name: String,
}

// =============================================================================
// Runtime Types
// =============================================================================

/// Flavor of the managed runtime loaded in the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClrFlavor {
    /// .NET Core / .NET 5+ (coreclr.dll, mscordaccore.dll)
    Core,
    /// .NET Framework (clr.dll or mscorwks.dll, mscordacwks.dll)
    Desktop,
}

impl ClrFlavor {
    /// Recognize a runtime module by its file name.
    pub fn from_module_name(name: &str) -> Option<Self> {
        let file_name = module_file_name(name);
        if file_name.eq_ignore_ascii_case("coreclr.dll") {
            Some(ClrFlavor::Core)
        } else if file_name.eq_ignore_ascii_case("clr.dll")
            || file_name.eq_ignore_ascii_case("mscorwks.dll")
        {
            Some(ClrFlavor::Desktop)
        } else {
            None
        }
    }

    /// DAC file name without extension.
    pub fn dac_base_name(&self) -> &'static str {
        match self {
            ClrFlavor::Core => "mscordaccore",
            ClrFlavor::Desktop => "mscordacwks",
        }
    }

    pub fn dac_dll_name(&self) -> String {
        format!("{}.dll", self.dac_base_name())
    }
}

impl fmt::Display for ClrFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClrFlavor::Core => f.write_str("Core"),
            ClrFlavor::Desktop => f.write_str("Desktop"),
        }
    }
}

/// File version of a runtime module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl ModuleVersion {
    /// Build from the two halves of a `VS_FIXEDFILEINFO` file version.
    pub fn from_file_version(ms: u32, ls: u32) -> Self {
        Self {
            major: (ms >> 16) as u16,
            minor: (ms & 0xFFFF) as u16,
            build: (ls >> 16) as u16,
            revision: (ls & 0xFFFF) as u16,
        }
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

// =============================================================================
// DAC Info
// =============================================================================

/// DAC module index information for symbol server lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacModuleIndex {
    pub timestamp: u32,
    pub size_of_image: u32,
}

impl DacModuleIndex {
    /// Generate the symbol server key for this DAC
    pub fn symbol_server_key(&self) -> String {
        format!("{:08X}{:x}", self.timestamp, self.size_of_image)
    }

    /// Generate the full symbol server URL for the given DAC file
    pub fn symbol_server_url(&self, dac_file_name: &str) -> String {
        format!(
            "https://msdl.microsoft.com/download/symbols/{name}/{key}/{name}",
            name = dac_file_name,
            key = self.symbol_server_key()
        )
    }
}

/// Everything needed to locate the DAC matching a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DacInfo {
    pub index: DacModuleIndex,
    /// DAC name qualified with host/target architecture and runtime version,
    /// e.g. `mscordaccore_Amd64_Amd64_4.700.20.20201.dll`.
    pub platform_specific_file_name: String,
    /// DAC already present on this machine, if any.
    pub local_dac_path: Option<PathBuf>,
}

impl DacInfo {
    pub fn new(
        flavor: ClrFlavor,
        version: ModuleVersion,
        index: DacModuleIndex,
        target: Architecture,
        runtime_directory: Option<&Path>,
    ) -> Self {
        // The symbol server keys DACs with a two-digit minimum revision.
        let platform_specific_file_name = format!(
            "{}_{}_{}_{}.{}.{}.{:02}.dll",
            flavor.dac_base_name(),
            Architecture::host(),
            target,
            version.major,
            version.minor,
            version.build,
            version.revision
        );

        let local_dac_path = runtime_directory
            .map(|dir| dir.join(flavor.dac_dll_name()))
            .filter(|path| path.exists());

        Self {
            index,
            platform_specific_file_name,
            local_dac_path,
        }
    }

    pub fn index_file_size(&self) -> u32 {
        self.index.size_of_image
    }

    pub fn index_timestamp(&self) -> u32 {
        self.index.timestamp
    }
}

/// A managed runtime found in the dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClrInfo {
    pub flavor: ClrFlavor,
    pub version: ModuleVersion,
    /// Base address of the runtime module in the target.
    pub module_base: u64,
    /// Image path of the runtime module as recorded in the dump.
    pub module_path: PathBuf,
    pub dac: DacInfo,
}

impl ClrInfo {
    /// Directory the runtime was loaded from on the machine that produced
    /// the dump.
    pub fn runtime_directory(&self) -> Option<&Path> {
        image_directory(&self.module_path)
    }

    pub fn dac_symbol_server_url(&self) -> String {
        self.dac
            .index
            .symbol_server_url(&self.flavor.dac_dll_name())
    }
}

/// Trait for inspecting a managed runtime captured in a dump.
pub trait ManagedRuntime {
    /// Description of the runtime.
    fn info(&self) -> &ClrInfo;

    /// Visit every object on the managed heap in address order per segment.
    fn walk_heap(&self, visit: &mut dyn FnMut(&HeapObject)) -> Result<()>;

    /// Enumerate the AppDomains and the modules loaded in each.
    fn app_domains(&self) -> Result<Vec<AppDomainInfo>>;
}

/// File name component of a module path. Handles `\` separators even when
/// running on a host whose native separator is `/`.
pub fn module_file_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

/// Directory part of a module path, accepting `\` separators on any host.
pub fn image_directory(path: &Path) -> Option<&Path> {
    let text = path.to_str()?;
    let idx = text.rfind(['\\', '/'])?;
    Some(Path::new(&text[..idx]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_runtime_modules() {
        assert_eq!(
            ClrFlavor::from_module_name(r"C:\Program Files\dotnet\shared\Microsoft.NETCore.App\3.1.4\coreclr.dll"),
            Some(ClrFlavor::Core)
        );
        assert_eq!(ClrFlavor::from_module_name("CLR.DLL"), Some(ClrFlavor::Desktop));
        assert_eq!(ClrFlavor::from_module_name("mscorwks.dll"), Some(ClrFlavor::Desktop));
        assert_eq!(ClrFlavor::from_module_name("ntdll.dll"), None);
        assert_eq!(ClrFlavor::from_module_name("notcoreclr.dll"), None);
    }

    #[test]
    fn version_from_file_version() {
        let version = ModuleVersion::from_file_version(0x0004_02BC, 0x4E34_4EE9);
        assert_eq!(version.to_string(), "4.700.20020.20201");
    }

    #[test]
    fn architecture_from_machine_type() {
        assert_eq!(Architecture::from_machine_type(0x8664), Architecture::Amd64);
        assert_eq!(Architecture::from_machine_type(0x014c), Architecture::X86);
        assert_eq!(Architecture::Amd64.pointer_size(), 8);
        assert_eq!(Architecture::X86.pointer_size(), 4);
        assert_eq!(Architecture::Arm64.to_string(), "Arm64");
        assert_eq!(Architecture::from_machine_type(0x1234), Architecture::Unknown);
    }

    #[test]
    fn symbol_server_key_and_url() {
        let index = DacModuleIndex {
            timestamp: 0x5E86_7108,
            size_of_image: 0x56C000,
        };
        assert_eq!(index.symbol_server_key(), "5E86710856c000");
        assert_eq!(
            index.symbol_server_url("mscordaccore.dll"),
            "https://msdl.microsoft.com/download/symbols/mscordaccore.dll/5E86710856c000/mscordaccore.dll"
        );
    }

    #[test]
    fn platform_specific_dac_name() {
        let version = ModuleVersion {
            major: 4,
            minor: 700,
            build: 20,
            revision: 20201,
        };
        let index = DacModuleIndex {
            timestamp: 1,
            size_of_image: 2,
        };
        let dac = DacInfo::new(ClrFlavor::Core, version, index, Architecture::Amd64, None);
        let expected = format!("mscordaccore_{}_Amd64_4.700.20.20201.dll", Architecture::host());
        assert_eq!(dac.platform_specific_file_name, expected);
        assert_eq!(dac.local_dac_path, None);
        assert_eq!(dac.index_file_size(), 2);
        assert_eq!(dac.index_timestamp(), 1);
    }

    #[test]
    fn dac_name_pads_revision() {
        let version = ModuleVersion {
            major: 4,
            minor: 8,
            build: 4470,
            revision: 0,
        };
        let index = DacModuleIndex {
            timestamp: 1,
            size_of_image: 2,
        };
        let dac = DacInfo::new(ClrFlavor::Desktop, version, index, Architecture::Amd64, None);
        let expected = format!("mscordacwks_{}_Amd64_4.8.4470.00.dll", Architecture::host());
        assert_eq!(dac.platform_specific_file_name, expected);
        // The displayed version is unpadded
        assert_eq!(version.to_string(), "4.8.4470.0");
    }

    #[test]
    fn local_dac_requires_existing_file() {
        let dir = std::env::temp_dir().join(format!("autodebug-dac-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("mscordacwks.dll"), b"MZ").unwrap();

        let index = DacModuleIndex {
            timestamp: 0,
            size_of_image: 0,
        };
        let found = DacInfo::new(
            ClrFlavor::Desktop,
            ModuleVersion::default(),
            index,
            Architecture::X86,
            Some(&dir),
        );
        let missing = DacInfo::new(
            ClrFlavor::Core,
            ModuleVersion::default(),
            index,
            Architecture::X86,
            Some(&dir),
        );
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(found.local_dac_path, Some(dir.join("mscordacwks.dll")));
        assert_eq!(missing.local_dac_path, None);
    }

    #[test]
    fn runtime_directory_uses_backslashes() {
        let info = ClrInfo {
            flavor: ClrFlavor::Core,
            version: ModuleVersion::default(),
            module_base: 0x7ffb_0000_0000,
            module_path: PathBuf::from(r"C:\dotnet\shared\3.1.4\coreclr.dll"),
            dac: DacInfo {
                index: DacModuleIndex {
                    timestamp: 0,
                    size_of_image: 0,
                },
                platform_specific_file_name: String::new(),
                local_dac_path: None,
            },
        };
        assert_eq!(
            info.runtime_directory(),
            Some(Path::new(r"C:\dotnet\shared\3.1.4"))
        );
        assert_eq!(module_file_name(r"C:\dotnet\shared\3.1.4\coreclr.dll"), "coreclr.dll");
    }
}
