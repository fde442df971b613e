//! Module resolution and the self-pinning reference used by the lifecycle
//! control surface.

use std::time::Duration;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::Diagnostics::Debug::OutputDebugStringW;
use windows::Win32::System::LibraryLoader::{
    FreeLibrary, GetModuleFileNameW, GetModuleHandleExW, GetModuleHandleW, GetProcAddress,
    LoadLibraryW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
};

use crate::error::{HookError, HookResult};

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Looks up a currently-loaded module by name, without loading it.
pub fn module_handle(name: &str) -> Option<HMODULE> {
    let wide_name = wide(name);
    unsafe { GetModuleHandleW(PCWSTR(wide_name.as_ptr())).ok() }
}

/// Resolves an exported symbol's address within an already-loaded module.
pub fn proc_address(module: HMODULE, symbol: &str) -> Option<usize> {
    let c_symbol = std::ffi::CString::new(symbol).ok()?;
    unsafe {
        GetProcAddress(module, windows::core::PCSTR(c_symbol.as_ptr() as *const u8))
            .map(|f| f as usize)
    }
}

/// Blocks, polling at `poll` intervals, until `name` is loaded into this
/// process, then returns its handle.
pub fn wait_for_module(name: &str, poll: Duration) -> HMODULE {
    loop {
        if let Some(handle) = module_handle(name) {
            return handle;
        }
        log::debug!("waiting for {name} to load");
        std::thread::sleep(poll);
    }
}

/// Loads a fresh reference to the module containing `marker`, used to pin
/// this crate's own DLL in memory so the injecting process can release its
/// reference without unloading us out from under live hooks.
pub fn pin_self(marker: usize) -> HookResult<HMODULE> {
    unsafe {
        let mut self_handle = HMODULE::default();
        GetModuleHandleExW(
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
            PCWSTR(marker as *const u16),
            &mut self_handle,
        )
        .map_err(HookError::from)?;

        let mut path_buf = vec![0u16; 260];
        let len = GetModuleFileNameW(Some(self_handle), &mut path_buf);
        if len == 0 {
            return Err(HookError::from(windows_result::Error::from_win32()));
        }
        path_buf.truncate(len as usize);
        path_buf.push(0);

        LoadLibraryW(PCWSTR(path_buf.as_ptr())).map_err(HookError::from)
    }
}

/// Releases one reference to a handle acquired from [`pin_self`].
pub fn unpin(handle: HMODULE) {
    unsafe {
        let _ = FreeLibrary(handle);
    }
}

/// Writes a short diagnostic message into a caller-supplied wide-character
/// buffer, truncating to fit and always leaving the buffer null-terminated
/// when `out_len > 0`.
///
/// # Safety
/// `out_buf` must be valid for `out_len` `u16` writes when `out_len > 0`.
pub unsafe fn write_diagnostic(out_buf: PWSTR, out_len: u32, message: &str) {
    if out_len == 0 || out_buf.is_null() {
        return;
    }
    let mut encoded = wide(message);
    let capacity = out_len as usize;
    if encoded.len() > capacity {
        encoded.truncate(capacity - 1);
        encoded.push(0);
    }
    std::ptr::copy_nonoverlapping(encoded.as_ptr(), out_buf.as_ptr(), encoded.len());
}

/// Emits `message` via `OutputDebugStringW`, visible to an attached debugger
/// regardless of whether the host process has any `log` sink configured.
/// Used only from the panic boundaries at the `extern "system"` surface,
/// where a caught panic means the normal `log` facade can no longer be
/// trusted to have run to completion.
pub fn debug_output(message: &str) {
    let wide_message = wide(message);
    unsafe { OutputDebugStringW(PCWSTR(wide_message.as_ptr())) };
}
