//! `wsveil`: an in-process interception layer for outbound networking calls
//! a host process makes through `ws2_32.dll`.
//!
//! This crate is injected into a running process as a DLL. Once [`Install`]
//! is called it hot-patches six `ws2_32.dll` entry points (`connect`,
//! `gethostbyname`, `recv`, `recvfrom`, `WSARecv`, `WSAGetOverlappedResult`)
//! so that every call through them first consults a small rules language
//! before falling through to the original implementation.

pub mod asm;
pub mod bandwidth;
pub mod detours;
pub mod error;
pub mod hook;
mod lifecycle;
pub mod memprotect;
pub mod rules;
pub mod winmod;

pub use error::{HookError, HookResult};

use std::ffi::c_void;
use std::panic::catch_unwind;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{BOOL, HINSTANCE, HMODULE};
use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

fn wide_to_string(ptr: PCWSTR) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { ptr.to_string().unwrap_or_default() }
}

/// DLL entry point. `DLL_PROCESS_ATTACH` does nothing but disable
/// per-thread attach/detach notifications this crate never uses;
/// `DLL_PROCESS_DETACH` unhooks every armed hook under a panic boundary,
/// since by the time this runs `ws2_32.dll` may already be gone.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn DllMain(
    module: HINSTANCE,
    reason: u32,
    _reserved: *mut c_void,
) -> BOOL {
    if reason == DLL_PROCESS_ATTACH.0 as u32 {
        let _ = windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls(HMODULE(
            module.0,
        ));
    } else if reason == DLL_PROCESS_DETACH.0 as u32 {
        if catch_unwind(lifecycle::on_process_detach).is_err() {
            winmod::debug_output("wsveil: panic during process-detach unhook");
        }
    }
    BOOL(1)
}

/// Installs (or re-binds) the rule set parsed from `address`, arming the six
/// hooks on first call. `out_message`/`out_message_len` are an optional
/// caller-owned wide-character buffer that receives a short diagnostic on
/// failure; pass a null pointer and zero length to skip it.
///
/// Returns 1 on success or re-bind, 0 if `address` failed to parse, or
/// `u32::MAX` if a hook could not be installed.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn Install(
    address: PCWSTR,
    out_message: PWSTR,
    out_message_len: u32,
) -> u32 {
    let outcome = catch_unwind(|| {
        let rule_string = wide_to_string(address);
        lifecycle::install(&rule_string)
    });

    match outcome {
        Ok(code) => {
            match code {
                lifecycle::INSTALL_PARSE_FAILED => {
                    winmod::write_diagnostic(out_message, out_message_len, "rule string parse error");
                }
                lifecycle::INSTALL_HOOK_FAILED => {
                    winmod::write_diagnostic(out_message, out_message_len, "hook installation failed");
                }
                _ => {}
            }
            code
        }
        Err(_) => {
            winmod::debug_output("wsveil: panic during install");
            winmod::write_diagnostic(out_message, out_message_len, "panic during install");
            lifecycle::INSTALL_HOOK_FAILED
        }
    }
}

/// Drops this module's self-pin and unhooks everything armed by [`Install`].
/// Returns 1 if a pin existed, 0 if `Install` never succeeded.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn Unload() -> u32 {
    catch_unwind(lifecycle::unload).unwrap_or_else(|_| {
        winmod::debug_output("wsveil: panic during unload");
        0
    })
}
