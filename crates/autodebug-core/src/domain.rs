//! AppDomain and module information.

/// Name shown for modules that have no backing file.
pub const DYNAMIC_MODULE_NAME: &str = "[Dynamic Module]";

/// A module loaded into an AppDomain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Address of the owning assembly.
    pub assembly_address: u64,
    /// Address of the module itself.
    pub address: u64,
    /// File the module was loaded from. Empty for dynamic modules.
    pub name: String,
}

impl ModuleInfo {
    pub fn new(assembly_address: u64, address: u64, name: impl Into<String>) -> Self {
        Self {
            assembly_address,
            address,
            name: name.into(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.name.is_empty()
    }

    pub fn display_name(&self) -> &str {
        if self.is_dynamic() {
            DYNAMIC_MODULE_NAME
        } else {
            &self.name
        }
    }
}

/// An AppDomain and the modules loaded into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDomainInfo {
    pub id: u32,
    pub name: String,
    pub address: u64,
    pub modules: Vec<ModuleInfo>,
}
