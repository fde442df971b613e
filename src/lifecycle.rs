//! The two externally callable operations — `install` and `unload` — plus
//! process-detach cleanup. Everything here is serialized by the caller (the
//! bootstrap injector never calls `install`/`unload` concurrently with
//! itself), so the only synchronization this module needs is the pinning
//! mutex that also doubles as the "are we already armed" flag.

use std::sync::LazyLock;
use std::time::Duration;

use parking_lot::Mutex;
use windows::Win32::Foundation::HMODULE;

use crate::bandwidth::BandwidthCounter;
use crate::hook::HookRegistry;
use crate::rules::RuleStore;
use crate::winmod;

const WS2_32: &str = "ws2_32.dll";
const MODULE_LOAD_POLL: Duration = Duration::from_secs(1);

/// All process-wide state this crate owns, initialized once and never torn
/// down: the hook registry, the hot-swappable rule set, the bandwidth
/// counter, and the self-pin handle acquired on a successful install.
pub struct State {
    pub registry: HookRegistry,
    pub rules: RuleStore,
    pub bandwidth: BandwidthCounter,
    pinned: Mutex<Option<HMODULE>>,
}

impl State {
    fn new() -> Self {
        State {
            registry: HookRegistry::new(),
            rules: RuleStore::new(),
            bandwidth: BandwidthCounter::new(),
            pinned: Mutex::new(None),
        }
    }
}

static STATE: LazyLock<State> = LazyLock::new(State::new);

/// The process-wide state every detour consults.
pub fn state() -> &'static State {
    &STATE
}

/// Outcome codes matching the external `install` entry point (§6).
pub const INSTALL_OK: u32 = 1;
pub const INSTALL_PARSE_FAILED: u32 = 0;
pub const INSTALL_HOOK_FAILED: u32 = u32::MAX;

/// Installs (or re-binds) the rule set and, on first call, the six
/// `ws2_32.dll` hooks.
///
/// Idempotent re-bind: if a previous call already armed the hooks, this
/// call only replaces the rule set. Otherwise it blocks until `ws2_32.dll`
/// is loaded into the process, installs the rules, then attaches all six
/// hooks atomically; on any hook failure the partially-armed set is rolled
/// back (by [`HookRegistry::install_all`]) and no rules or hooks are left
/// installed.
pub fn install(rule_string: &str) -> u32 {
    let mut pinned = state().pinned.lock();

    if pinned.is_some() {
        return match state().rules.install(rule_string) {
            Ok(()) => INSTALL_OK,
            Err(e) => {
                log::warn!("rule re-parse failed, keeping prior rules: {e}");
                INSTALL_PARSE_FAILED
            }
        };
    }

    winmod::wait_for_module(WS2_32, MODULE_LOAD_POLL);

    if let Err(e) = state().rules.install(rule_string) {
        log::warn!("rule parse failed: {e}");
        return INSTALL_PARSE_FAILED;
    }

    if let Err(e) = state().registry.install_all() {
        log::warn!("hook install failed: {e}");
        return INSTALL_HOOK_FAILED;
    }

    match winmod::pin_self(install as usize) {
        Ok(handle) => {
            *pinned = Some(handle);
            log::debug!("all hooks armed, self pinned");
            INSTALL_OK
        }
        Err(e) => {
            log::warn!("self-pin failed, rolling back hooks: {e}");
            state().registry.uninstall_all();
            INSTALL_HOOK_FAILED
        }
    }
}

/// Drops this module's self-pin and unhooks everything. Returns 1 if a pin
/// existed, 0 if `install` never succeeded (a no-op).
pub fn unload() -> u32 {
    let mut pinned = state().pinned.lock();
    match pinned.take() {
        Some(handle) => {
            state().registry.uninstall_all();
            winmod::unpin(handle);
            1
        }
        None => 0,
    }
}

/// Process-detach notification: unhooks everything under the caller's panic
/// boundary, tolerating a target library that has already been unloaded.
pub fn on_process_detach() {
    state().registry.uninstall_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unload_without_prior_install_is_a_noop() {
        // `state()` is process-global, so this only checks the no-pin path
        // is reachable without panicking; a full install/unload round trip
        // needs a live `ws2_32.dll` and is exercised by integration tests.
        let _ = unload();
    }
}
