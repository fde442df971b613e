//! The fixed set of six hooks this crate installs, with all-or-nothing
//! install/uninstall.

use super::HookRecord;
use crate::detours;
use crate::error::HookResult;

const WS2_32: &str = "ws2_32.dll";

/// Named hooks for the six `ws2_32.dll` entry points this crate intercepts.
pub struct HookRegistry {
    pub connect: HookRecord,
    pub gethostbyname: HookRecord,
    pub recv: HookRecord,
    pub recvfrom: HookRecord,
    pub wsa_recv: HookRecord,
    pub wsa_get_overlapped_result: HookRecord,
}

impl HookRegistry {
    pub const fn new() -> Self {
        HookRegistry {
            connect: HookRecord::new("connect", WS2_32, "connect"),
            gethostbyname: HookRecord::new("gethostbyname", WS2_32, "gethostbyname"),
            recv: HookRecord::new("recv", WS2_32, "recv"),
            recvfrom: HookRecord::new("recvfrom", WS2_32, "recvfrom"),
            wsa_recv: HookRecord::new("WSARecv", WS2_32, "WSARecv"),
            wsa_get_overlapped_result: HookRecord::new(
                "WSAGetOverlappedResult",
                WS2_32,
                "WSAGetOverlappedResult",
            ),
        }
    }

    fn all(&self) -> [&HookRecord; 6] {
        [
            &self.connect,
            &self.gethostbyname,
            &self.recv,
            &self.recvfrom,
            &self.wsa_recv,
            &self.wsa_get_overlapped_result,
        ]
    }

    /// Attaches every hook. On any failure, every hook armed so far in this
    /// call is unhooked before the error is returned, so the registry is
    /// never left half-installed.
    pub fn install_all(&self) -> HookResult<()> {
        let plan: [(&HookRecord, usize); 6] = [
            (&self.connect, detours::connect_detour as usize),
            (&self.gethostbyname, detours::gethostbyname_detour as usize),
            (&self.recv, detours::recv_detour as usize),
            (&self.recvfrom, detours::recvfrom_detour as usize),
            (&self.wsa_recv, detours::wsa_recv_detour as usize),
            (
                &self.wsa_get_overlapped_result,
                detours::wsa_get_overlapped_result_detour as usize,
            ),
        ];

        let mut armed: Vec<&HookRecord> = Vec::with_capacity(plan.len());
        for (hook, detour) in plan {
            match hook.attach_by_name(detour) {
                Ok(()) => armed.push(hook),
                Err(e) => {
                    log::warn!("install of {} failed: {e}; rolling back", hook.name());
                    for armed_hook in armed {
                        armed_hook.unhook();
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Unhooks every hook, armed or not.
    pub fn uninstall_all(&self) {
        for hook in self.all() {
            hook.unhook();
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
