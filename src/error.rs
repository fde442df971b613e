use std::fmt;

/// Errors that can occur while installing, arming, or tearing down a hook.
#[derive(Debug)]
pub enum HookError {
    /// The requested symbol is not exported by the target library.
    SymbolNotFound(String),
    /// The function's prologue did not match a shape we know how to patch.
    UnrecognizedPrologue(usize),
    /// A `VirtualProtect`/`VirtualQuery` call failed.
    ProtectionChange((windows_result::Error, Option<anyhow::Error>)),
    /// The user-supplied rule string could not be parsed.
    RuleParse(String),
    /// Generic error that wraps an `anyhow::Error`.
    Other(anyhow::Error),
}

impl HookError {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        HookError::Other(anyhow::Error::new(error))
    }

    pub fn root_cause_string(&self) -> String {
        match self {
            HookError::SymbolNotFound(name) => format!("symbol \"{name}\" not found"),
            HookError::UnrecognizedPrologue(addr) => {
                format!("unrecognized function prologue at {addr:#x}")
            }
            HookError::ProtectionChange((api_err, ctx)) => match ctx {
                Some(e) => format!("protection change in context \"{e}\" failed: {api_err}"),
                None => format!("protection change failed: {api_err}"),
            },
            HookError::RuleParse(msg) => format!("rule parse error: {msg}"),
            HookError::Other(err) => format!("{err:#}"),
        }
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HookError: \"{}\"", self.root_cause_string())
    }
}

impl std::error::Error for HookError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HookError::Other(err) => err.source(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for HookError {
    fn from(err: anyhow::Error) -> Self {
        HookError::Other(err)
    }
}

impl From<windows_result::Error> for HookError {
    fn from(err: windows_result::Error) -> Self {
        HookError::ProtectionChange((err, None))
    }
}

pub type HookResult<T> = Result<T, HookError>;
