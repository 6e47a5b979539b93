//! ICLRDataTarget implementation backed by the debugger engine.
//!
//! The DAC reads everything it needs through this interface. Memory, modules
//! and thread contexts all come from the dump via the DbgEng session.

#![allow(unused_unsafe)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

use windows::Win32::Foundation::{E_FAIL, E_NOINTERFACE, E_NOTIMPL, S_OK};
use windows::Win32::System::Diagnostics::Debug::Extensions::{
    IDebugAdvanced, IDebugDataSpaces, IDebugSystemObjects,
};
use windows::core::{GUID, HRESULT, IUnknown, Interface};

use crate::dac::{ClrDataAddress, ICLRDataTargetImpl, ICLRDataTargetVtbl, IID_ICLR_DATA_TARGET};
use crate::session::{DebugSession, loaded_modules};
use crate::{Architecture, Result};

/// ICLRDataTarget implementation reading from a DbgEng session.
#[repr(C)]
pub struct DbgEngDataTarget {
    vtbl: *const ICLRDataTargetVtbl,
    ref_count: AtomicU32,
    data_spaces: IDebugDataSpaces,
    system_objects: IDebugSystemObjects,
    advanced: IDebugAdvanced,
    architecture: Architecture,
    /// Map of module file name (lowercase) -> base address
    module_bases: HashMap<String, u64>,
}

static DBGENG_DATA_TARGET_VTBL: ICLRDataTargetVtbl = ICLRDataTargetVtbl {
    query_interface: target_query_interface,
    add_ref: target_add_ref,
    release: target_release,
    get_machine_type: target_get_machine_type,
    get_pointer_size: target_get_pointer_size,
    get_image_base: target_get_image_base,
    read_virtual: target_read_virtual,
    write_virtual: target_write_virtual,
    get_tls_value: target_get_tls_value,
    set_tls_value: target_set_tls_value,
    get_current_thread_id: target_get_current_thread_id,
    get_thread_context: target_get_thread_context,
    set_thread_context: target_set_thread_context,
    request: target_request,
};

impl DbgEngDataTarget {
    /// Create a data target for the session's dump.
    /// Returns a raw pointer holding one reference; hand it to
    /// `CLRDataCreateInstance` and release it afterwards.
    pub fn create(session: &DebugSession) -> Result<*mut ICLRDataTargetImpl> {
        let architecture = session.architecture()?;
        let module_bases = loaded_modules(session.symbols())?
            .into_iter()
            .map(|m| (m.file_name(), m.base))
            .collect();

        let target = Box::new(DbgEngDataTarget {
            vtbl: &DBGENG_DATA_TARGET_VTBL,
            ref_count: AtomicU32::new(1),
            data_spaces: session.data_spaces().clone(),
            system_objects: session.system_objects().clone(),
            advanced: session.advanced().clone(),
            architecture,
            module_bases,
        });

        Ok(Box::into_raw(target) as *mut ICLRDataTargetImpl)
    }

    /// Drop one reference taken by [`DbgEngDataTarget::create`].
    ///
    /// # Safety
    /// `this` must come from `create` and not have been fully released yet.
    pub unsafe fn release(this: *mut ICLRDataTargetImpl) -> u32 {
        unsafe { target_release(this) }
    }
}

/// Interfaces the data target answers `QueryInterface` for.
fn is_supported_iid(riid: &GUID) -> bool {
    *riid == IUnknown::IID || *riid == IID_ICLR_DATA_TARGET
}

// IUnknown implementation
unsafe extern "system" fn target_query_interface(
    this: *mut ICLRDataTargetImpl,
    riid: *const GUID,
    ppv_object: *mut *mut c_void,
) -> HRESULT {
    if ppv_object.is_null() || riid.is_null() {
        return E_FAIL;
    }

    let riid = unsafe { &*riid };
    if is_supported_iid(riid) {
        unsafe {
            *ppv_object = this as *mut c_void;
            target_add_ref(this);
        }
        return S_OK;
    }

    unsafe { *ppv_object = std::ptr::null_mut() };
    E_NOINTERFACE
}

unsafe extern "system" fn target_add_ref(this: *mut ICLRDataTargetImpl) -> u32 {
    let target = unsafe { &*(this as *const DbgEngDataTarget) };
    target.ref_count.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "system" fn target_release(this: *mut ICLRDataTargetImpl) -> u32 {
    let target = unsafe { &*(this as *const DbgEngDataTarget) };
    let count = target.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
    if count == 0 {
        drop(unsafe { Box::from_raw(this as *mut DbgEngDataTarget) });
    }
    count
}

unsafe extern "system" fn target_get_machine_type(
    this: *mut ICLRDataTargetImpl,
    machine_type: *mut u32,
) -> HRESULT {
    if machine_type.is_null() {
        return E_FAIL;
    }

    let target = unsafe { &*(this as *const DbgEngDataTarget) };
    unsafe { *machine_type = target.architecture.machine_type() };
    S_OK
}

unsafe extern "system" fn target_get_pointer_size(
    this: *mut ICLRDataTargetImpl,
    pointer_size: *mut u32,
) -> HRESULT {
    if pointer_size.is_null() {
        return E_FAIL;
    }

    let target = unsafe { &*(this as *const DbgEngDataTarget) };
    unsafe { *pointer_size = target.architecture.pointer_size() };
    S_OK
}

unsafe extern "system" fn target_get_image_base(
    this: *mut ICLRDataTargetImpl,
    image_path: *const u16,
    base_address: *mut ClrDataAddress,
) -> HRESULT {
    if image_path.is_null() || base_address.is_null() {
        return E_FAIL;
    }

    let target = unsafe { &*(this as *const DbgEngDataTarget) };

    let path_len = unsafe {
        let mut len = 0;
        while *image_path.add(len) != 0 {
            len += 1;
        }
        len
    };
    let path_slice = unsafe { std::slice::from_raw_parts(image_path, path_len) };
    let path_str = String::from_utf16_lossy(path_slice);
    let filename = crate::module_file_name(&path_str).to_lowercase();

    match target.module_bases.get(&filename) {
        Some(&base) => {
            unsafe { *base_address = base };
            S_OK
        }
        None => {
            tracing::trace!(module = %filename, "image base not found");
            E_FAIL
        }
    }
}

unsafe extern "system" fn target_read_virtual(
    this: *mut ICLRDataTargetImpl,
    address: ClrDataAddress,
    buffer: *mut u8,
    bytes_requested: u32,
    bytes_read: *mut u32,
) -> HRESULT {
    if buffer.is_null() {
        return E_FAIL;
    }

    let target = unsafe { &*(this as *const DbgEngDataTarget) };
    let mut actual_read = 0u32;

    let result = unsafe {
        target.data_spaces.ReadVirtual(
            address,
            buffer as *mut c_void,
            bytes_requested,
            Some(&mut actual_read as *mut u32),
        )
    };

    match result {
        Ok(()) if actual_read > 0 => {
            if !bytes_read.is_null() {
                unsafe { *bytes_read = actual_read };
            }
            S_OK
        }
        _ => E_FAIL,
    }
}

unsafe extern "system" fn target_get_current_thread_id(
    this: *mut ICLRDataTargetImpl,
    thread_id: *mut u32,
) -> HRESULT {
    if thread_id.is_null() {
        return E_FAIL;
    }

    let target = unsafe { &*(this as *const DbgEngDataTarget) };
    match unsafe { target.system_objects.GetCurrentThreadSystemId() } {
        Ok(id) => {
            unsafe { *thread_id = id };
            S_OK
        }
        Err(e) => e.code(),
    }
}

unsafe extern "system" fn target_get_thread_context(
    this: *mut ICLRDataTargetImpl,
    thread_id: u32,
    _context_flags: u32,
    context_size: u32,
    context: *mut u8,
) -> HRESULT {
    if context.is_null() {
        return E_FAIL;
    }

    let target = unsafe { &*(this as *const DbgEngDataTarget) };
    let objects = &target.system_objects;

    let engine_id = match unsafe { objects.GetThreadIdBySystemId(thread_id) } {
        Ok(id) => id,
        Err(e) => return e.code(),
    };
    let previous = unsafe { objects.GetCurrentThreadId() }.ok();

    if let Err(e) = unsafe { objects.SetCurrentThreadId(engine_id) } {
        return e.code();
    }
    let result = unsafe {
        target
            .advanced
            .GetThreadContext(context as *mut c_void, context_size)
    };
    if let Some(previous) = previous {
        unsafe { objects.SetCurrentThreadId(previous).ok() };
    }

    match result {
        Ok(()) => S_OK,
        Err(e) => e.code(),
    }
}

// Not implemented methods
unsafe extern "system" fn target_write_virtual(
    _this: *mut ICLRDataTargetImpl,
    _address: ClrDataAddress,
    _buffer: *mut u8,
    _bytes_requested: u32,
    _bytes_written: *mut u32,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn target_get_tls_value(
    _this: *mut ICLRDataTargetImpl,
    _thread_id: u32,
    _index: u32,
    _value: *mut ClrDataAddress,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn target_set_tls_value(
    _this: *mut ICLRDataTargetImpl,
    _thread_id: u32,
    _index: u32,
    _value: ClrDataAddress,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn target_set_thread_context(
    _this: *mut ICLRDataTargetImpl,
    _thread_id: u32,
    _context_size: u32,
    _context: *mut u8,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn target_request(
    _this: *mut ICLRDataTargetImpl,
    _req_code: u32,
    _in_buffer_size: u32,
    _in_buffer: *mut u8,
    _out_buffer_size: u32,
    _out_buffer: *mut u8,
) -> HRESULT {
    E_NOTIMPL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vtable_matches_interface_order() {
        // IUnknown (3) + ICLRDataTarget (11) slots
        assert_eq!(
            std::mem::size_of::<ICLRDataTargetVtbl>(),
            14 * std::mem::size_of::<usize>()
        );
    }

    #[test]
    fn answers_for_iunknown_and_data_target_only() {
        assert!(is_supported_iid(&GUID::from_u128(0x00000000_0000_0000_C000_000000000046)));
        assert!(is_supported_iid(&IID_ICLR_DATA_TARGET));
        assert!(!is_supported_iid(&GUID::zeroed()));
        assert!(!is_supported_iid(&GUID::from_u128(0x436f00f2_b42a_4b9f_870c_e73db66ae930)));
    }
}
