//! DAC-backed managed runtime.
//!
//! Runtimes are discovered from the dump's module list. For each one the DAC
//! is loaded, handed a [`DbgEngDataTarget`] and queried through
//! `ISOSDacInterface` for the GC heap layout, method tables and AppDomains.
//! When the DAC also implements `ISOSDacInterface8` its full generation table
//! is used so the pinned object heap is walked too.

#![allow(unused_unsafe)]

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::path::{Path, PathBuf};

use windows::Win32::System::Diagnostics::Debug::Extensions::IDebugDataSpaces;
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use windows::core::{Interface, PCWSTR};

use crate::dac::{
    CLRDataCreateInstanceFn, ClrDataAddress, DacpAppDomainData, DacpAppDomainStoreData,
    DacpAssemblyData, DacpGcHeapData, DacpGcHeapDetails, DacpGenerationData, DacpHeapSegmentData,
    DacpMethodTableData, DacpModuleData, DacpThreadData, DacpThreadStoreData, ISOSDacInterface,
    ISOSDacInterface8, IXCLRDataProcess, read_dac_string,
};
use crate::session::{DebugSession, module_version};
use crate::target::DbgEngDataTarget;
use crate::walk::{
    HeapReader, HeapSegment, HeapWalker, MethodTableInfo, order_segments, segment_end,
};
use crate::{
    AppDomainInfo, ClrFlavor, ClrInfo, DacInfo, DacModuleIndex, Error, HeapObject,
    ManagedRuntime, ModuleInfo, Result, image_directory,
};

/// Upper bound on threads followed in the thread list.
const MAX_THREADS: usize = 100_000;

/// Upper bound on generations accepted from `GetNumberGenerations`.
const MAX_GENERATIONS: u32 = 16;

// =============================================================================
// Runtime discovery
// =============================================================================

/// Find every managed runtime loaded in the dump.
pub fn discover_runtimes(session: &DebugSession) -> Result<Vec<ClrInfo>> {
    let architecture = session.architecture()?;
    let mut runtimes = Vec::new();

    for module in session.modules()? {
        let path = module.image_path.to_string_lossy().into_owned();
        let Some(flavor) = ClrFlavor::from_module_name(&path) else {
            continue;
        };

        let version = module_version(session.symbols(), module.base).unwrap_or_default();
        let index = DacModuleIndex {
            timestamp: module.timestamp,
            size_of_image: module.size,
        };
        let dac = DacInfo::new(
            flavor,
            version,
            index,
            architecture,
            image_directory(&module.image_path),
        );

        tracing::info!(
            flavor = %flavor,
            version = %version,
            base = format_args!("{:#x}", module.base),
            "found managed runtime"
        );
        runtimes.push(ClrInfo {
            flavor,
            version,
            module_base: module.base,
            module_path: module.image_path.clone(),
            dac,
        });
    }

    Ok(runtimes)
}

// =============================================================================
// DacRuntime
// =============================================================================

/// A runtime inspected through its DAC.
pub struct DacRuntime {
    info: ClrInfo,
    sos: ISOSDacInterface,
    sos8: Option<ISOSDacInterface8>,
    _process: IXCLRDataProcess,
    data_spaces: IDebugDataSpaces,
    pointer_size: u32,
}

impl DacRuntime {
    /// Load the DAC for `info` and connect it to the session.
    ///
    /// `dac_override` takes precedence over the DAC found next to the runtime.
    pub fn load(session: &DebugSession, info: ClrInfo, dac_override: Option<&Path>) -> Result<Self> {
        let dac_path = resolve_dac_path(&info, dac_override)?;
        tracing::info!(dac = %dac_path.display(), "loading DAC");

        let dac_path_wide: Vec<u16> = dac_path
            .to_string_lossy()
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();

        let dac_module = unsafe { LoadLibraryW(PCWSTR::from_raw(dac_path_wide.as_ptr())) }
            .map_err(|e| Error::DacLoad(format!("{}: {}", dac_path.display(), e)))?;

        let create_instance: CLRDataCreateInstanceFn = unsafe {
            let proc = GetProcAddress(dac_module, windows::core::s!("CLRDataCreateInstance"));
            match proc {
                Some(p) => std::mem::transmute(p),
                None => return Err(Error::DacLoad("CLRDataCreateInstance not found".into())),
            }
        };

        let data_target = DbgEngDataTarget::create(session)?;

        let mut xclr_process: *mut c_void = std::ptr::null_mut();
        let hr = unsafe {
            create_instance(
                &IXCLRDataProcess::IID,
                data_target as *mut c_void,
                &mut xclr_process,
            )
        };
        // The DAC holds its own reference now.
        unsafe { DbgEngDataTarget::release(data_target) };

        if hr.is_err() || xclr_process.is_null() {
            return Err(Error::DacLoad(format!(
                "CLRDataCreateInstance failed: 0x{:08X}",
                hr.0
            )));
        }

        // SAFETY: CLRDataCreateInstance returned a valid, owned COM pointer
        let process: IXCLRDataProcess = unsafe { Interface::from_raw(xclr_process) };
        let sos: ISOSDacInterface = process.cast().map_err(|e| {
            Error::DacLoad(format!("QueryInterface for ISOSDacInterface failed: {}", e))
        })?;

        let sos8 = sos.cast::<ISOSDacInterface8>().ok();
        if sos8.is_none() {
            tracing::debug!("ISOSDacInterface8 not available; pinned object heap is not walked");
        }

        let pointer_size = session.architecture()?.pointer_size();

        Ok(Self {
            info,
            sos,
            sos8,
            _process: process,
            data_spaces: session.data_spaces().clone(),
            pointer_size,
        })
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> bool {
        let mut read = 0u32;
        let result = unsafe {
            self.data_spaces.ReadVirtual(
                address,
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len() as u32,
                Some(&mut read as *mut u32),
            )
        };
        result.is_ok() && read as usize == buffer.len()
    }

    /// GC heap details for every heap (one in workstation mode), and whether
    /// the runtime uses server GC.
    fn heap_details(&self) -> Result<(Vec<DacpGcHeapDetails>, bool)> {
        let mut heap_data = DacpGcHeapData::default();
        let hr = unsafe { self.sos.GetGCHeapData(&mut heap_data) };
        if hr.is_err() {
            return Err(Error::DacQuery(format!("GetGCHeapData failed: 0x{:08X}", hr.0)));
        }
        if heap_data.bGcStructuresValid == 0 {
            tracing::warn!("GC structures are not valid; the dump was taken during a GC");
        }

        if heap_data.bServerMode == 0 {
            let mut details = DacpGcHeapDetails::default();
            let hr = unsafe { self.sos.GetGCHeapStaticData(&mut details) };
            if hr.is_err() {
                return Err(Error::DacQuery(format!(
                    "GetGCHeapStaticData failed: 0x{:08X}",
                    hr.0
                )));
            }
            return Ok((vec![details], false));
        }

        let mut heaps: Vec<ClrDataAddress> = vec![0; heap_data.HeapCount as usize];
        let mut needed = 0u32;
        let hr = unsafe {
            self.sos
                .GetGCHeapList(heap_data.HeapCount, heaps.as_mut_ptr(), &mut needed)
        };
        if hr.is_err() {
            return Err(Error::DacQuery(format!("GetGCHeapList failed: 0x{:08X}", hr.0)));
        }
        heaps.truncate(needed as usize);

        let mut all = Vec::with_capacity(heaps.len());
        for heap in heaps {
            let mut details = DacpGcHeapDetails::default();
            let hr = unsafe { self.sos.GetGCHeapDetails(heap, &mut details) };
            if hr.is_err() {
                tracing::warn!(heap = format_args!("{:#x}", heap), "GetGCHeapDetails failed");
                continue;
            }
            all.push(details);
        }
        Ok((all, true))
    }

    /// Every generation of one heap, pinned object heap included when the
    /// DAC can report it.
    fn generation_table(&self, heap: &DacpGcHeapDetails, server: bool) -> Vec<DacpGenerationData> {
        let Some(sos8) = &self.sos8 else {
            return heap.generation_table.to_vec();
        };

        let mut count = 0u32;
        let hr = unsafe { sos8.GetNumberGenerations(&mut count) };
        if hr.is_err() || count == 0 || count > MAX_GENERATIONS {
            return heap.generation_table.to_vec();
        }

        let mut table = vec![DacpGenerationData::default(); count as usize];
        let mut needed = 0u32;
        let hr = unsafe {
            if server {
                sos8.GetGenerationTableSvr(heap.heapAddr, count, table.as_mut_ptr(), &mut needed)
            } else {
                sos8.GetGenerationTable(count, table.as_mut_ptr(), &mut needed)
            }
        };
        if hr.is_err() || needed == 0 {
            tracing::debug!(hr = format_args!("{:#x}", hr.0), "GetGenerationTable failed; using static table");
            return heap.generation_table.to_vec();
        }
        table.truncate((needed as usize).min(table.len()));
        table
    }

    /// Segments of all heaps and generations in address order.
    fn segments(&self, heaps: &[DacpGcHeapDetails], server: bool) -> Vec<HeapSegment> {
        let mut segments = Vec::new();
        let mut visited = HashSet::new();

        for heap in heaps {
            for (generation, gen_data) in self.generation_table(heap, server).iter().enumerate() {
                let mut segment = gen_data.start_segment;
                while segment != 0 && visited.insert(segment) {
                    let mut data = DacpHeapSegmentData::default();
                    let hr = unsafe { self.sos.GetHeapSegmentData(segment, &mut data) };
                    if hr.is_err() {
                        tracing::warn!(segment = format_args!("{:#x}", segment), "GetHeapSegmentData failed");
                        break;
                    }

                    segments.push(HeapSegment {
                        address: segment,
                        start: data.mem,
                        end: segment_end(
                            segment,
                            data.allocated,
                            heap.ephemeral_heap_segment,
                            heap.alloc_allocated,
                        ),
                        generation,
                    });
                    segment = data.next;
                }
            }
        }

        order_segments(segments)
    }

    /// Allocation contexts (start -> limit) that hold no objects yet.
    fn allocation_contexts(&self, heaps: &[DacpGcHeapDetails]) -> HashMap<u64, u64> {
        let mut contexts = HashMap::new();

        for heap in heaps {
            let gen0 = &heap.generation_table[0];
            if gen0.allocContextPtr != 0 {
                contexts.insert(gen0.allocContextPtr, gen0.allocContextLimit);
            }
        }

        let mut store = DacpThreadStoreData::default();
        if unsafe { self.sos.GetThreadStoreData(&mut store) }.is_err() {
            tracing::warn!("GetThreadStoreData failed; allocation contexts may be misread");
            return contexts;
        }

        let mut thread = store.firstThread;
        let mut seen = 0usize;
        while thread != 0 && seen < MAX_THREADS {
            let mut data = DacpThreadData::default();
            if unsafe { self.sos.GetThreadData(thread, &mut data) }.is_err() {
                break;
            }
            if data.allocContextPtr != 0 {
                contexts.insert(data.allocContextPtr, data.allocContextLimit);
            }
            thread = data.nextThread;
            seen += 1;
        }

        contexts
    }

    fn method_table_name(&self, mt: u64) -> Option<String> {
        read_dac_string(|count, buf, needed| unsafe {
            self.sos.GetMethodTableName(mt, count, buf, needed)
        })
    }

    fn app_domain(&self, address: ClrDataAddress) -> Option<AppDomainInfo> {
        let mut data = DacpAppDomainData::default();
        let hr = unsafe { self.sos.GetAppDomainData(address, &mut data) };
        if hr.is_err() {
            tracing::warn!(domain = format_args!("{:#x}", address), "GetAppDomainData failed");
            return None;
        }

        let name = read_dac_string(|count, buf, needed| unsafe {
            self.sos.GetAppDomainName(address, count, buf, needed)
        })
        .unwrap_or_default();

        let mut modules = Vec::new();
        let assembly_count = data.AssemblyCount;
        // Sanity check
        if assembly_count > 0 && assembly_count <= 10000 {
            let mut assemblies: Vec<ClrDataAddress> = vec![0; assembly_count as usize];
            let mut needed = 0i32;
            let hr = unsafe {
                self.sos.GetAssemblyList(
                    address,
                    assembly_count,
                    assemblies.as_mut_ptr(),
                    &mut needed,
                )
            };
            if hr.is_ok() {
                let count = (needed.max(0) as usize).min(assemblies.len());
                for &assembly in &assemblies[..count] {
                    if assembly != 0 {
                        self.assembly_modules(address, assembly, &mut modules);
                    }
                }
            }
        }

        Some(AppDomainInfo {
            id: data.dwId,
            name,
            address,
            modules,
        })
    }

    fn assembly_modules(
        &self,
        domain: ClrDataAddress,
        assembly: ClrDataAddress,
        modules: &mut Vec<ModuleInfo>,
    ) {
        let mut data = DacpAssemblyData::default();
        if unsafe { self.sos.GetAssemblyData(domain, assembly, &mut data) }.is_err() {
            return;
        }

        let module_count = data.ModuleCount;
        if module_count == 0 || module_count >= 1000 {
            return;
        }

        let mut module_addrs: Vec<ClrDataAddress> = vec![0; module_count as usize];
        let mut needed = 0u32;
        let hr = unsafe {
            self.sos.GetAssemblyModuleList(
                assembly,
                module_count,
                module_addrs.as_mut_ptr(),
                &mut needed,
            )
        };
        if hr.is_err() {
            return;
        }

        let count = (needed as usize).min(module_addrs.len());
        for &module in &module_addrs[..count] {
            let mut module_data = DacpModuleData::default();
            if unsafe { self.sos.GetModuleData(module, &mut module_data) }.is_err() {
                continue;
            }

            let name = if module_data.bIsReflection != 0 {
                String::new()
            } else {
                read_dac_string(|count, buf, needed| unsafe {
                    self.sos.GetPEFileName(module_data.PEAssembly, count, buf, needed)
                })
                .or_else(|| {
                    read_dac_string(|count, buf, needed| unsafe {
                        self.sos.GetAssemblyName(assembly, count, buf, needed)
                    })
                })
                .unwrap_or_default()
            };

            modules.push(ModuleInfo::new(assembly, module, name));
        }
    }
}

impl ManagedRuntime for DacRuntime {
    fn info(&self) -> &ClrInfo {
        &self.info
    }

    fn walk_heap(&self, visit: &mut dyn FnMut(&HeapObject)) -> Result<()> {
        let (heaps, server) = self.heap_details()?;
        let contexts = self.allocation_contexts(&heaps);
        let segments = self.segments(&heaps, server);
        tracing::debug!(heaps = heaps.len(), segments = segments.len(), server, "walking GC heap");

        HeapWalker::new(self, contexts).walk(&segments, visit);
        Ok(())
    }

    fn app_domains(&self) -> Result<Vec<AppDomainInfo>> {
        let mut store = DacpAppDomainStoreData::default();
        let hr = unsafe { self.sos.GetAppDomainStoreData(&mut store) };
        if hr.is_err() {
            return Err(Error::DacQuery(format!(
                "GetAppDomainStoreData failed: 0x{:08X}",
                hr.0
            )));
        }

        let domain_count = store.DomainCount;

        // Sanity check
        if !(0..=1000).contains(&domain_count) {
            return Err(Error::DacQuery(format!(
                "Suspicious domain count: {} - likely data corruption",
                domain_count
            )));
        }
        if domain_count == 0 {
            return Ok(Vec::new());
        }

        let mut addresses: Vec<ClrDataAddress> = vec![0; domain_count as usize];
        let mut needed = 0u32;
        let hr = unsafe {
            self.sos
                .GetAppDomainList(domain_count as u32, addresses.as_mut_ptr(), &mut needed)
        };
        if hr.is_err() {
            return Err(Error::DacQuery(format!("GetAppDomainList failed: 0x{:08X}", hr.0)));
        }
        addresses.truncate(needed as usize);

        Ok(addresses
            .into_iter()
            .filter(|&addr| addr != 0)
            .filter_map(|addr| self.app_domain(addr))
            .collect())
    }
}

impl HeapReader for DacRuntime {
    fn pointer_size(&self) -> u32 {
        self.pointer_size
    }

    fn read_pointer(&self, address: u64) -> Option<u64> {
        if self.pointer_size == 4 {
            self.read_u32(address).map(u64::from)
        } else {
            let mut buf = [0u8; 8];
            self.read_bytes(address, &mut buf).then(|| u64::from_le_bytes(buf))
        }
    }

    fn read_u32(&self, address: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(address, &mut buf).then(|| u32::from_le_bytes(buf))
    }

    fn method_table(&self, mt: u64) -> Option<MethodTableInfo> {
        let mut data = DacpMethodTableData::default();
        let hr = unsafe { self.sos.GetMethodTableData(mt, &mut data) };
        if hr.is_err() {
            return None;
        }
        Some(MethodTableInfo::resolve(
            mt,
            data.BaseSize,
            data.ComponentSize,
            data.bIsFree != 0,
            || self.method_table_name(mt),
        ))
    }
}

fn resolve_dac_path(info: &ClrInfo, dac_override: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = dac_override {
        return Ok(path.to_path_buf());
    }
    info.dac.local_dac_path.clone().ok_or_else(|| {
        Error::DacLoad(format!(
            "{} is not available locally; download it from {}",
            info.dac.platform_specific_file_name,
            info.dac_symbol_server_url()
        ))
    })
}
