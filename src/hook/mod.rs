//! A single hot-patched entry point: its saved bytes, its trampoline (if
//! one was needed), and the attach/detach state machine.

mod registry;

pub use registry::HookRegistry;

use std::ffi::c_void;

use parking_lot::Mutex;
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
};

use crate::asm::{build_long_jmp, build_short_jmp, classify_prologue, Prologue, LONG_JMP_LEN, SHORT_JMP_LEN};
use crate::error::{HookError, HookResult};
use crate::memprotect::{read_bytes, try_write_bytes, write_bytes_guarded};
use crate::winmod::{module_handle, proc_address};

/// Width of the saved-bytes window: the five padding bytes immediately
/// before a target, plus the first two bytes of the target itself.
const SAVED_LEN: usize = LONG_JMP_LEN + SHORT_JMP_LEN;

/// A page-sized chunk of executable memory holding a relocated prologue and
/// a jump back into the original code stream, for targets whose prologue
/// could not be overwritten with a two-byte short jump alone.
struct Trampoline {
    addr: *mut u8,
}

// VirtualAlloc/VirtualFree-backed pages outlive the thread that created them.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    const SIZE: usize = 0x1000;

    fn alloc() -> HookResult<Self> {
        let addr = unsafe {
            VirtualAlloc(
                None,
                Self::SIZE,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if addr.is_null() {
            return Err(HookError::from(windows_result::Error::from_win32()));
        }
        Ok(Trampoline { addr: addr as *mut u8 })
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        unsafe {
            let _ = VirtualFree(self.addr as *mut c_void, 0, MEM_RELEASE);
        }
    }
}

/// Runtime state of a hook once it has been attached.
struct Armed {
    target: usize,
    resume: usize,
    saved: [u8; SAVED_LEN],
    // Kept alive only so its backing page is freed when the hook is
    // unhooked; never read again after attach builds it.
    _trampoline: Option<Trampoline>,
}

/// One of the six intercepted entry points, identified by the module and
/// symbol name it is resolved from.
pub struct HookRecord {
    name: &'static str,
    module: &'static str,
    symbol: &'static str,
    state: Mutex<Option<Armed>>,
}

impl HookRecord {
    pub const fn new(name: &'static str, module: &'static str, symbol: &'static str) -> Self {
        HookRecord {
            name,
            module,
            symbol,
            state: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The address a detour must jump to in order to run the original
    /// function's behavior, skipping the overwritten prologue.
    pub fn resume_addr(&self) -> Option<usize> {
        self.state.lock().as_ref().map(|armed| armed.resume)
    }

    /// Reinterprets the resume address as a callable function pointer of a
    /// caller-chosen type.
    ///
    /// # Safety
    /// `F` must match the original function's actual calling convention and
    /// signature; this crate only ever instantiates it with the six
    /// `extern "system"` types declared in `detours.rs`.
    pub unsafe fn resume_as<F: Copy>(&self) -> Option<F> {
        let addr = self.resume_addr()?;
        Some(std::mem::transmute_copy::<usize, F>(&addr))
    }

    /// Resolves this hook's symbol in its module and attaches.
    pub fn attach_by_name(&self, detour: usize) -> HookResult<()> {
        let module = module_handle(self.module).ok_or_else(|| {
            HookError::SymbolNotFound(format!("{}!{}", self.module, self.symbol))
        })?;
        let target = proc_address(module, self.symbol).ok_or_else(|| {
            HookError::SymbolNotFound(format!("{}!{}", self.module, self.symbol))
        })?;
        self.attach(target, detour)
    }

    /// Arms this hook against an already-resolved target address.
    pub fn attach(&self, target: usize, detour: usize) -> HookResult<()> {
        if target == 0 {
            return Err(HookError::SymbolNotFound(format!(
                "{}!{} resolved to a null address",
                self.module, self.symbol
            )));
        }

        let mut guard = self.state.lock();
        // Re-arming an already-armed hook disarms it first; this keeps
        // `attach` idempotent from the registry's point of view.
        if let Some(armed) = guard.take() {
            self.restore(&armed);
        }

        let window_addr = (target - LONG_JMP_LEN) as *mut u8;
        let saved = unsafe { read_bytes(window_addr, SAVED_LEN) };
        let prologue_bytes = &saved[LONG_JMP_LEN..];
        let prologue = classify_prologue(prologue_bytes)
            .ok_or(HookError::UnrecognizedPrologue(target))?;

        let prologue_len = prologue.len();
        let (resume, trampoline) = match prologue {
            Prologue::HotPatch => (target + prologue_len, None),
            Prologue::PushImm8 => {
                let tramp = Trampoline::alloc()?;
                let mut stub = Vec::with_capacity(prologue_len + LONG_JMP_LEN);
                stub.extend_from_slice(&prologue_bytes[..prologue_len]);
                let jmp_back =
                    build_long_jmp(tramp.addr as usize + prologue_len, target + prologue_len)?;
                stub.extend_from_slice(&jmp_back);
                unsafe { write_bytes_guarded(tramp.addr, &stub)? };
                (tramp.addr as usize, Some(tramp))
            }
        };

        let long_jmp = build_long_jmp(target - LONG_JMP_LEN, detour)?;
        let short_jmp = build_short_jmp(target, target - LONG_JMP_LEN)?;

        // The long jump must land before the short jump becomes visible: an
        // in-flight caller reading the prologue mid-write must never see a
        // short jump pointing at a long jump that isn't armed yet.
        unsafe {
            write_bytes_guarded(window_addr, &long_jmp)?;
            write_bytes_guarded(target as *mut u8, &short_jmp)?;
        }

        let mut saved_window = [0u8; SAVED_LEN];
        saved_window.copy_from_slice(&saved);

        *guard = Some(Armed {
            target,
            resume,
            saved: saved_window,
            _trampoline: trampoline,
        });
        log::debug!("{} armed at {target:#x}, resume {resume:#x}", self.name);
        Ok(())
    }

    /// Restores the original bytes and disarms. A no-op if already disarmed.
    /// Never fails: if the target library has already been unloaded the
    /// restore write is simply skipped.
    pub fn unhook(&self) {
        let mut guard = self.state.lock();
        if let Some(armed) = guard.take() {
            self.restore(&armed);
        }
    }

    /// Undoes `attach`'s two writes in reverse order: the short jump at
    /// `target` is reverted first, then the long-jump area at
    /// `target - LONG_JMP_LEN`. Install writes long-jump-then-short-jump so
    /// that an in-flight caller never reads a short jump pointing at a
    /// long jump that isn't armed yet; uninstall must undo in the opposite
    /// order for the same reason — a thread still parked on the short jump
    /// must never see the long-jump area reverted out from under it first.
    fn restore(&self, armed: &Armed) {
        let short_addr = armed.target as *mut u8;
        let window_addr = (armed.target - LONG_JMP_LEN) as *mut u8;
        let short_restored = unsafe { try_write_bytes(short_addr, &armed.saved[LONG_JMP_LEN..]) };
        let long_restored = unsafe { try_write_bytes(window_addr, &armed.saved[..LONG_JMP_LEN]) };
        if short_restored && long_restored {
            log::debug!("{} restored at {:#x}", self.name, armed.target);
        } else {
            log::warn!(
                "{} could not be fully restored at {:#x}; target library likely unloaded",
                self.name,
                armed.target
            );
        }
    }
}

impl Drop for HookRecord {
    fn drop(&mut self) {
        self.unhook();
    }
}
