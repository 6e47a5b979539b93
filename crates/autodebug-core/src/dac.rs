//! DAC (Data Access Component) interface definitions.
//!
//! The runtime's DAC exposes `IXCLRDataProcess`, `ISOSDacInterface` and, from
//! .NET 5 on, `ISOSDacInterface8`. They are declared here with the windows
//! crate's `#[interface]` macro so calls go through real COM vtables. Only the
//! `ISOSDacInterface` slots up to `GetHeapSegmentData` are declared; later
//! slots are never called.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]

use std::ffi::c_void;

use windows::core::{GUID, HRESULT, IUnknown, IUnknown_Vtbl, interface};

pub type CLRDATA_ADDRESS = u64;

/// Type alias for readability in the heap walk
pub type ClrDataAddress = CLRDATA_ADDRESS;

/// Number of generation entries in `DacpGcHeapDetails` (gen0, gen1, gen2, LOH).
pub const DAC_NUMBERGENERATIONS: usize = 4;

// GUIDs for DAC interfaces
pub const IID_ICLR_DATA_TARGET: GUID = GUID::from_u128(0x3E11CCEE_D08B_43e5_AF01_32717A64DA03);

/// CLRDataCreateInstance function type (exported by mscordaccore.dll / mscordacwks.dll)
pub type CLRDataCreateInstanceFn = unsafe extern "system" fn(
    riid: *const GUID,
    data_target: *mut c_void, // ICLRDataTarget*
    ppv_object: *mut *mut c_void,
) -> HRESULT;

// =============================================================================
// Data structures (layouts match dacprivate.h)
// =============================================================================

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpThreadStoreData {
    pub threadCount: i32,
    pub unstartedThreadCount: i32,
    pub backgroundThreadCount: i32,
    pub pendingThreadCount: i32,
    pub deadThreadCount: i32,
    pub firstThread: CLRDATA_ADDRESS,
    pub finalizerThread: CLRDATA_ADDRESS,
    pub gcThread: CLRDATA_ADDRESS,
    pub fHostConfig: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpThreadData {
    pub corThreadId: u32,
    pub osThreadId: u32,
    pub state: i32,
    pub preemptiveGCDisabled: u32,
    pub allocContextPtr: CLRDATA_ADDRESS,
    pub allocContextLimit: CLRDATA_ADDRESS,
    pub context: CLRDATA_ADDRESS,
    pub domain: CLRDATA_ADDRESS,
    pub pFrame: CLRDATA_ADDRESS,
    pub lockCount: u32,
    pub firstNestedException: CLRDATA_ADDRESS,
    pub teb: CLRDATA_ADDRESS,
    pub fiberData: CLRDATA_ADDRESS,
    pub lastThrownObjectHandle: CLRDATA_ADDRESS,
    pub nextThread: CLRDATA_ADDRESS,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpAppDomainStoreData {
    pub sharedDomain: CLRDATA_ADDRESS,
    pub systemDomain: CLRDATA_ADDRESS,
    pub DomainCount: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpAppDomainData {
    pub AppDomainPtr: CLRDATA_ADDRESS,
    pub AppSecDesc: CLRDATA_ADDRESS,
    pub pLowFrequencyHeap: CLRDATA_ADDRESS,
    pub pHighFrequencyHeap: CLRDATA_ADDRESS,
    pub pStubHeap: CLRDATA_ADDRESS,
    pub DomainLocalBlock: CLRDATA_ADDRESS,
    pub pDomainLocalModules: CLRDATA_ADDRESS,
    pub dwId: u32,
    pub AssemblyCount: i32,
    pub FailedAssemblyCount: i32,
    pub appDomainStage: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpAssemblyData {
    pub AssemblyPtr: CLRDATA_ADDRESS,
    pub ClassLoader: CLRDATA_ADDRESS,
    pub ParentDomain: CLRDATA_ADDRESS,
    pub BaseDomainPtr: CLRDATA_ADDRESS,
    pub AssemblySecDesc: CLRDATA_ADDRESS,
    pub isDynamic: i32,
    pub ModuleCount: u32,
    pub LoadContext: u32,
    pub isDomainNeutral: i32,
    pub dwLocationFlags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpModuleData {
    pub Address: CLRDATA_ADDRESS,
    pub PEAssembly: CLRDATA_ADDRESS,
    pub ilBase: CLRDATA_ADDRESS,
    pub metadataStart: CLRDATA_ADDRESS,
    pub metadataSize: u64,
    pub Assembly: CLRDATA_ADDRESS,
    pub bIsReflection: i32,
    pub bIsPEFile: i32,
    pub dwBaseClassIndex: u64,
    pub dwModuleID: u64,
    pub dwTransientFlags: u32,
    pub TypeDefToMethodTableMap: CLRDATA_ADDRESS,
    pub TypeRefToMethodTableMap: CLRDATA_ADDRESS,
    pub MethodDefToDescMap: CLRDATA_ADDRESS,
    pub FieldDefToDescMap: CLRDATA_ADDRESS,
    pub MemberRefToDescMap: CLRDATA_ADDRESS,
    pub FileReferencesMap: CLRDATA_ADDRESS,
    pub ManifestModuleReferencesMap: CLRDATA_ADDRESS,
    pub LoaderAllocator: CLRDATA_ADDRESS,
    pub ThunkHeap: CLRDATA_ADDRESS,
    pub dwModuleIndex: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpMethodTableData {
    pub bIsFree: i32,
    pub Module: CLRDATA_ADDRESS,
    pub Class: CLRDATA_ADDRESS,
    pub ParentMethodTable: CLRDATA_ADDRESS,
    pub wNumInterfaces: u16,
    pub wNumMethods: u16,
    pub wNumVtableSlots: u16,
    pub wNumVirtuals: u16,
    pub BaseSize: u32,
    pub ComponentSize: u32,
    pub cl: u32,
    pub dwAttrClass: u32,
    pub bIsShared: i32,
    pub bIsDynamic: i32,
    pub bContainsPointers: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpGcHeapData {
    pub bServerMode: i32,
    pub bGcStructuresValid: i32,
    pub HeapCount: u32,
    pub g_max_generation: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpGenerationData {
    pub start_segment: CLRDATA_ADDRESS,
    pub allocation_start: CLRDATA_ADDRESS,
    pub allocContextPtr: CLRDATA_ADDRESS,
    pub allocContextLimit: CLRDATA_ADDRESS,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpGcHeapDetails {
    pub heapAddr: CLRDATA_ADDRESS,
    pub alloc_allocated: CLRDATA_ADDRESS,
    pub mark_array: CLRDATA_ADDRESS,
    pub current_c_gc_state: CLRDATA_ADDRESS,
    pub next_sweep_obj: CLRDATA_ADDRESS,
    pub saved_sweep_ephemeral_seg: CLRDATA_ADDRESS,
    pub saved_sweep_ephemeral_start: CLRDATA_ADDRESS,
    pub background_saved_lowest_address: CLRDATA_ADDRESS,
    pub background_saved_highest_address: CLRDATA_ADDRESS,
    pub generation_table: [DacpGenerationData; DAC_NUMBERGENERATIONS],
    pub ephemeral_heap_segment: CLRDATA_ADDRESS,
    pub finalization_fill_pointers: [CLRDATA_ADDRESS; DAC_NUMBERGENERATIONS + 3],
    pub lowest_address: CLRDATA_ADDRESS,
    pub highest_address: CLRDATA_ADDRESS,
    pub card_table: CLRDATA_ADDRESS,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DacpHeapSegmentData {
    pub segmentAddr: CLRDATA_ADDRESS,
    pub allocated: CLRDATA_ADDRESS,
    pub committed: CLRDATA_ADDRESS,
    pub reserved: CLRDATA_ADDRESS,
    pub used: CLRDATA_ADDRESS,
    pub mem: CLRDATA_ADDRESS,
    pub next: CLRDATA_ADDRESS,
    pub gc_heap: CLRDATA_ADDRESS,
    pub highAllocMark: CLRDATA_ADDRESS,
    pub flags: u64,
    pub background_allocated: CLRDATA_ADDRESS,
}

// =============================================================================
// Interfaces
// =============================================================================

#[interface("5c552ab6-fc09-4cb3-8e36-22fa03c798b7")]
pub unsafe trait IXCLRDataProcess: IUnknown {}

#[interface("436f00f2-b42a-4b9f-870c-e73db66ae930")]
pub unsafe trait ISOSDacInterface: IUnknown {
    // Threads
    unsafe fn GetThreadStoreData(&self, data: *mut DacpThreadStoreData) -> HRESULT;

    // AppDomains
    unsafe fn GetAppDomainStoreData(&self, data: *mut DacpAppDomainStoreData) -> HRESULT;
    unsafe fn GetAppDomainList(
        &self,
        count: u32,
        values: *mut CLRDATA_ADDRESS,
        needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetAppDomainData(
        &self,
        addr: CLRDATA_ADDRESS,
        data: *mut DacpAppDomainData,
    ) -> HRESULT;
    unsafe fn GetAppDomainName(
        &self,
        addr: CLRDATA_ADDRESS,
        count: u32,
        name: *mut u16,
        needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetDomainFromContext(
        &self,
        context: CLRDATA_ADDRESS,
        domain: *mut CLRDATA_ADDRESS,
    ) -> HRESULT;

    // Assemblies
    unsafe fn GetAssemblyList(
        &self,
        app_domain: CLRDATA_ADDRESS,
        count: i32,
        values: *mut CLRDATA_ADDRESS,
        needed: *mut i32,
    ) -> HRESULT;
    unsafe fn GetAssemblyData(
        &self,
        base_domain: CLRDATA_ADDRESS,
        assembly: CLRDATA_ADDRESS,
        data: *mut DacpAssemblyData,
    ) -> HRESULT;
    unsafe fn GetAssemblyName(
        &self,
        assembly: CLRDATA_ADDRESS,
        count: u32,
        name: *mut u16,
        needed: *mut u32,
    ) -> HRESULT;

    // Modules
    unsafe fn GetModule(&self, addr: CLRDATA_ADDRESS, module: *mut *mut c_void) -> HRESULT;
    unsafe fn GetModuleData(&self, module: CLRDATA_ADDRESS, data: *mut DacpModuleData) -> HRESULT;
    unsafe fn TraverseModuleMap(
        &self,
        map_type: i32,
        module: CLRDATA_ADDRESS,
        callback: *mut c_void,
        token: *mut c_void,
    ) -> HRESULT;
    unsafe fn GetAssemblyModuleList(
        &self,
        assembly: CLRDATA_ADDRESS,
        count: u32,
        modules: *mut CLRDATA_ADDRESS,
        needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetILForModule(
        &self,
        module: CLRDATA_ADDRESS,
        rva: u32,
        il: *mut CLRDATA_ADDRESS,
    ) -> HRESULT;

    // Threads
    unsafe fn GetThreadData(&self, thread: CLRDATA_ADDRESS, data: *mut DacpThreadData) -> HRESULT;
    unsafe fn GetThreadFromThinlockID(&self, thin_lock_id: u32, thread: *mut CLRDATA_ADDRESS) -> HRESULT;
    unsafe fn GetStackLimits(
        &self,
        thread: CLRDATA_ADDRESS,
        lower: *mut CLRDATA_ADDRESS,
        upper: *mut CLRDATA_ADDRESS,
        fp: *mut CLRDATA_ADDRESS,
    ) -> HRESULT;

    // MethodDescs
    unsafe fn GetMethodDescData(
        &self,
        method_desc: CLRDATA_ADDRESS,
        ip: CLRDATA_ADDRESS,
        data: *mut c_void,
        reverted_count: u32,
        reverted_data: *mut c_void,
        reverted_needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetMethodDescPtrFromIP(&self, ip: CLRDATA_ADDRESS, method_desc: *mut CLRDATA_ADDRESS) -> HRESULT;
    unsafe fn GetMethodDescName(
        &self,
        method_desc: CLRDATA_ADDRESS,
        count: u32,
        name: *mut u16,
        needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetMethodDescPtrFromFrame(&self, frame: CLRDATA_ADDRESS, method_desc: *mut CLRDATA_ADDRESS) -> HRESULT;
    unsafe fn GetMethodDescFromToken(
        &self,
        module: CLRDATA_ADDRESS,
        token: u32,
        method_desc: *mut CLRDATA_ADDRESS,
    ) -> HRESULT;
    unsafe fn GetMethodDescTransparencyData(&self, method_desc: CLRDATA_ADDRESS, data: *mut c_void) -> HRESULT;

    // JIT data
    unsafe fn GetCodeHeaderData(&self, ip: CLRDATA_ADDRESS, data: *mut c_void) -> HRESULT;
    unsafe fn GetJitManagerList(&self, count: u32, managers: *mut c_void, needed: *mut u32) -> HRESULT;
    unsafe fn GetJitHelperFunctionName(
        &self,
        ip: CLRDATA_ADDRESS,
        count: u32,
        name: *mut u8,
        needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetJumpThunkTarget(
        &self,
        context: *mut c_void,
        target_ip: *mut CLRDATA_ADDRESS,
        target_method_desc: *mut CLRDATA_ADDRESS,
    ) -> HRESULT;

    // Thread pool
    unsafe fn GetThreadpoolData(&self, data: *mut c_void) -> HRESULT;
    unsafe fn GetWorkRequestData(&self, work_request: CLRDATA_ADDRESS, data: *mut c_void) -> HRESULT;
    unsafe fn GetHillClimbingLogEntry(&self, addr: CLRDATA_ADDRESS, data: *mut c_void) -> HRESULT;

    // Objects
    unsafe fn GetObjectData(&self, object: CLRDATA_ADDRESS, data: *mut c_void) -> HRESULT;
    unsafe fn GetObjectStringData(
        &self,
        object: CLRDATA_ADDRESS,
        count: u32,
        string_data: *mut u16,
        needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetObjectClassName(
        &self,
        object: CLRDATA_ADDRESS,
        count: u32,
        class_name: *mut u16,
        needed: *mut u32,
    ) -> HRESULT;

    // MethodTables
    unsafe fn GetMethodTableName(
        &self,
        mt: CLRDATA_ADDRESS,
        count: u32,
        name: *mut u16,
        needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetMethodTableData(&self, mt: CLRDATA_ADDRESS, data: *mut DacpMethodTableData) -> HRESULT;
    unsafe fn GetMethodTableSlot(&self, mt: CLRDATA_ADDRESS, slot: u32, value: *mut CLRDATA_ADDRESS) -> HRESULT;
    unsafe fn GetMethodTableFieldData(&self, mt: CLRDATA_ADDRESS, data: *mut c_void) -> HRESULT;
    unsafe fn GetMethodTableTransparencyData(&self, mt: CLRDATA_ADDRESS, data: *mut c_void) -> HRESULT;

    // EEClass
    unsafe fn GetMethodTableForEEClass(&self, ee_class: CLRDATA_ADDRESS, value: *mut CLRDATA_ADDRESS) -> HRESULT;

    // FieldDesc
    unsafe fn GetFieldDescData(&self, field_desc: CLRDATA_ADDRESS, data: *mut c_void) -> HRESULT;

    // Frames
    unsafe fn GetFrameName(
        &self,
        vtable: CLRDATA_ADDRESS,
        count: u32,
        frame_name: *mut u16,
        needed: *mut u32,
    ) -> HRESULT;

    // PEFiles
    unsafe fn GetPEFileBase(&self, addr: CLRDATA_ADDRESS, base: *mut CLRDATA_ADDRESS) -> HRESULT;
    unsafe fn GetPEFileName(
        &self,
        addr: CLRDATA_ADDRESS,
        count: u32,
        file_name: *mut u16,
        needed: *mut u32,
    ) -> HRESULT;

    // GC
    unsafe fn GetGCHeapData(&self, data: *mut DacpGcHeapData) -> HRESULT;
    unsafe fn GetGCHeapList(&self, count: u32, heaps: *mut CLRDATA_ADDRESS, needed: *mut u32) -> HRESULT;
    unsafe fn GetGCHeapDetails(&self, heap: CLRDATA_ADDRESS, details: *mut DacpGcHeapDetails) -> HRESULT;
    unsafe fn GetGCHeapStaticData(&self, data: *mut DacpGcHeapDetails) -> HRESULT;
    unsafe fn GetHeapSegmentData(&self, segment: CLRDATA_ADDRESS, data: *mut DacpHeapSegmentData) -> HRESULT;
}

/// Generation table of any length, including the pinned object heap.
#[interface("c12f35a9-e55c-4520-a894-b3dc5165dfce")]
pub unsafe trait ISOSDacInterface8: IUnknown {
    unsafe fn GetNumberGenerations(&self, generations: *mut u32) -> HRESULT;
    unsafe fn GetGenerationTable(
        &self,
        count: u32,
        data: *mut DacpGenerationData,
        needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetFinalizationFillPointers(
        &self,
        count: u32,
        fill_pointers: *mut CLRDATA_ADDRESS,
        needed: *mut u32,
    ) -> HRESULT;
    unsafe fn GetGenerationTableSvr(
        &self,
        heap: CLRDATA_ADDRESS,
        count: u32,
        data: *mut DacpGenerationData,
        needed: *mut u32,
    ) -> HRESULT;
}

// =============================================================================
// ICLRDataTargetVtbl - manual vtable for implementing ICLRDataTarget
// We need this because we implement ICLRDataTarget ourselves (not just call it)
// =============================================================================

#[repr(C)]
pub struct ICLRDataTargetVtbl {
    // IUnknown
    pub query_interface:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, *const GUID, *mut *mut c_void) -> HRESULT,
    pub add_ref: unsafe extern "system" fn(*mut ICLRDataTargetImpl) -> u32,
    pub release: unsafe extern "system" fn(*mut ICLRDataTargetImpl) -> u32,
    // ICLRDataTarget
    pub get_machine_type: unsafe extern "system" fn(*mut ICLRDataTargetImpl, *mut u32) -> HRESULT,
    pub get_pointer_size: unsafe extern "system" fn(*mut ICLRDataTargetImpl, *mut u32) -> HRESULT,
    pub get_image_base:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, *const u16, *mut ClrDataAddress) -> HRESULT,
    pub read_virtual: unsafe extern "system" fn(
        *mut ICLRDataTargetImpl,
        ClrDataAddress,
        *mut u8,
        u32,
        *mut u32,
    ) -> HRESULT,
    pub write_virtual: unsafe extern "system" fn(
        *mut ICLRDataTargetImpl,
        ClrDataAddress,
        *mut u8,
        u32,
        *mut u32,
    ) -> HRESULT,
    pub get_tls_value:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, u32, u32, *mut ClrDataAddress) -> HRESULT,
    pub set_tls_value:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, u32, u32, ClrDataAddress) -> HRESULT,
    pub get_current_thread_id: unsafe extern "system" fn(*mut ICLRDataTargetImpl, *mut u32) -> HRESULT,
    pub get_thread_context:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, u32, u32, u32, *mut u8) -> HRESULT,
    pub set_thread_context:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, u32, u32, *mut u8) -> HRESULT,
    pub request:
        unsafe extern "system" fn(*mut ICLRDataTargetImpl, u32, u32, *mut u8, u32, *mut u8) -> HRESULT,
}

/// Our implementation struct for ICLRDataTarget (used by DbgEngDataTarget in target)
#[repr(C)]
pub struct ICLRDataTargetImpl {
    pub vtbl: *const ICLRDataTargetVtbl,
}

/// Read a UTF-16 string through the DAC's two-call convention: the first call
/// reports the required length, the second fills the buffer.
pub(crate) fn read_dac_string<F>(mut call: F) -> Option<String>
where
    F: FnMut(u32, *mut u16, *mut u32) -> HRESULT,
{
    let mut needed = 0u32;
    let hr = call(0, std::ptr::null_mut(), &mut needed);
    if hr.is_err() || needed == 0 {
        return None;
    }

    let mut buffer = vec![0u16; needed as usize];
    let hr = call(needed, buffer.as_mut_ptr(), &mut needed);
    if hr.is_err() {
        return None;
    }

    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    Some(String::from_utf16_lossy(&buffer[..len]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::Foundation::{E_FAIL, S_OK};

    #[test]
    fn structure_layouts() {
        assert_eq!(std::mem::size_of::<DacpGcHeapData>(), 16);
        assert_eq!(std::mem::size_of::<DacpGenerationData>(), 32);
        assert_eq!(std::mem::size_of::<DacpHeapSegmentData>(), 88);
        assert_eq!(std::mem::size_of::<DacpGcHeapDetails>(), 9 * 8 + 4 * 32 + 8 + 7 * 8 + 3 * 8);
    }

    #[test]
    fn dac_string_two_call_convention() {
        let source: Vec<u16> = "System.String\0".encode_utf16().collect();
        let text = read_dac_string(|count, buf, needed| {
            unsafe { *needed = source.len() as u32 };
            if !buf.is_null() {
                assert_eq!(count as usize, source.len());
                unsafe { std::ptr::copy_nonoverlapping(source.as_ptr(), buf, source.len()) };
            }
            S_OK
        });
        assert_eq!(text.as_deref(), Some("System.String"));

        let failed = read_dac_string(|_, _, _| E_FAIL);
        assert_eq!(failed, None);
    }
}
