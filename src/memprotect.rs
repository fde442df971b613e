//! In-process code-page protection and byte patching.
//!
//! The teacher crate did all of this against a remote process via the `*Ex`
//! family of APIs and a long-lived `HANDLE`. This module patches the calling
//! process's own address space, so the non-`Ex` forms apply directly against
//! raw pointers.

use std::ffi::c_void;

use windows::Win32::System::Memory::{
    VirtualProtect, VirtualQuery, MEM_COMMIT, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE,
    PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
    PAGE_WRITECOPY,
};

use crate::error::{HookError, HookResult};

/// Changes protection on `len` bytes starting at `addr`, returning the
/// previous protection so callers can restore it afterward.
///
/// # Safety
/// `addr` must be a valid, mapped address for at least `len` bytes.
pub unsafe fn change_protection(
    addr: *mut c_void,
    len: usize,
    new_prot: PAGE_PROTECTION_FLAGS,
) -> HookResult<PAGE_PROTECTION_FLAGS> {
    let mut old_prot = PAGE_PROTECTION_FLAGS(0);
    VirtualProtect(addr, len, new_prot, &mut old_prot)
        .map_err(|e| HookError::ProtectionChange((e, None)))?;
    Ok(old_prot)
}

/// Queries the memory region containing `addr`.
///
/// # Safety
/// `addr` need not be mapped; an unmapped query simply reports `MEM_FREE`.
pub unsafe fn query_region(addr: *const c_void) -> MEMORY_BASIC_INFORMATION {
    let mut mbi = MEMORY_BASIC_INFORMATION::default();
    let written = VirtualQuery(Some(addr), &mut mbi, size_of::<MEMORY_BASIC_INFORMATION>());
    if written == 0 {
        return MEMORY_BASIC_INFORMATION::default();
    }
    mbi
}

/// Copies `bytes.len()` bytes out of `addr` without altering protection.
///
/// # Safety
/// `addr` must be readable for `len` bytes.
pub unsafe fn read_bytes(addr: *const u8, len: usize) -> Vec<u8> {
    std::slice::from_raw_parts(addr, len).to_vec()
}

/// Writes `bytes` at `addr` after flipping the region to
/// `PAGE_EXECUTE_READWRITE`, then restores the region's previous protection.
///
/// # Safety
/// `addr` must be a valid, mapped, currently-executable address for
/// `bytes.len()` bytes.
pub unsafe fn write_bytes_guarded(addr: *mut u8, bytes: &[u8]) -> HookResult<()> {
    let old = change_protection(addr as *mut c_void, bytes.len(), PAGE_EXECUTE_READWRITE)?;
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len());
    let _ = change_protection(addr as *mut c_void, bytes.len(), old);
    Ok(())
}

/// Reports whether `mbi` describes a currently committed, writable mapping
/// — the precondition [`try_write_bytes`] checks before ever touching the
/// region, mirroring the teacher's `mbi_safety_check` gate ahead of a
/// remote-memory write.
fn region_is_writable(mbi: &MEMORY_BASIC_INFORMATION) -> bool {
    if mbi.State != MEM_COMMIT {
        return false;
    }
    if mbi.Protect.0 & PAGE_GUARD.0 != 0 || mbi.Protect == PAGE_NOACCESS {
        return false;
    }
    const WRITABLE: u32 =
        PAGE_READWRITE.0 | PAGE_WRITECOPY.0 | PAGE_EXECUTE_READWRITE.0 | PAGE_EXECUTE_WRITECOPY.0;
    mbi.Protect.0 & WRITABLE != 0
}

/// Best-effort variant of [`write_bytes_guarded`] used by `unhook`: the
/// target library may already have been unloaded, in which case the region
/// is no longer committed. This is checked with [`query_region`] before the
/// write is ever attempted, and a failed [`change_protection`] afterward
/// (the region having been unmapped between the query and the write) is
/// treated the same way — as the expected "nothing to restore" outcome
/// rather than an error, so a process-detach teardown can never be the
/// reason the host process crashes.
///
/// # Safety
/// Same caveats as [`write_bytes_guarded`], except that an unmapped `addr`
/// is tolerated and simply reported as `false`.
pub unsafe fn try_write_bytes(addr: *mut u8, bytes: &[u8]) -> bool {
    let mbi = query_region(addr as *const c_void);
    if !region_is_writable(&mbi) {
        return false;
    }
    match change_protection(addr as *mut c_void, bytes.len(), PAGE_EXECUTE_READWRITE) {
        Ok(old) => {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len());
            let _ = change_protection(addr as *mut c_void, bytes.len(), old);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_readwrite_region_is_writable() {
        let mbi = MEMORY_BASIC_INFORMATION {
            State: MEM_COMMIT,
            Protect: PAGE_READWRITE,
            ..Default::default()
        };
        assert!(region_is_writable(&mbi));
    }

    #[test]
    fn free_region_is_not_writable() {
        let mbi = MEMORY_BASIC_INFORMATION {
            Protect: PAGE_READWRITE,
            ..Default::default()
        };
        assert!(!region_is_writable(&mbi));
    }

    #[test]
    fn guarded_or_noaccess_region_is_not_writable() {
        let guarded = MEMORY_BASIC_INFORMATION {
            State: MEM_COMMIT,
            Protect: PAGE_PROTECTION_FLAGS(PAGE_READWRITE.0 | PAGE_GUARD.0),
            ..Default::default()
        };
        assert!(!region_is_writable(&guarded));

        let noaccess = MEMORY_BASIC_INFORMATION {
            State: MEM_COMMIT,
            Protect: PAGE_NOACCESS,
            ..Default::default()
        };
        assert!(!region_is_writable(&noaccess));
    }

    #[test]
    fn readonly_region_is_not_writable() {
        let mbi = MEMORY_BASIC_INFORMATION {
            State: MEM_COMMIT,
            Protect: windows::Win32::System::Memory::PAGE_READONLY,
            ..Default::default()
        };
        assert!(!region_is_writable(&mbi));
    }
}
