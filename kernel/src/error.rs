//! Kernel error types and result definitions

use core::fmt;

/// Kernel operation result type
pub type Result<T> = core::result::Result<T, KernelError>;

/// Error kinds surfaced across the system-call boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Environment does not exist or the caller may not act on it
    BadEnv,
    /// Invalid argument: range, alignment, or permission bits
    Inval,
    /// Out of physical frames or page-table memory
    NoMem,
    /// Environment table is full
    NoFreeEnv,
    /// Non-blocking receive found no queued sender
    IpcNotSend,
    /// Swap space has no free slot
    SwapFull,
    /// The swap server has not registered yet
    Paging,
}

impl KernelError {
    /// Get a static string description of the error
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadEnv => "bad environment",
            Self::Inval => "invalid parameter",
            Self::NoMem => "out of memory",
            Self::NoFreeEnv => "out of environments",
            Self::IpcNotSend => "no sender queued",
            Self::SwapFull => "swap space full",
            Self::Paging => "paging server unavailable",
        }
    }

    /// Convert to the negative code returned by system calls
    pub fn to_errno(self) -> i32 {
        match self {
            Self::BadEnv => -1,
            Self::Inval => -2,
            Self::NoMem => -3,
            Self::NoFreeEnv => -4,
            Self::IpcNotSend => -5,
            Self::SwapFull => -6,
            Self::Paging => -7,
        }
    }

    /// Inverse of [`to_errno`](Self::to_errno)
    pub fn from_errno(errno: i32) -> Option<Self> {
        match errno {
            -1 => Some(Self::BadEnv),
            -2 => Some(Self::Inval),
            -3 => Some(Self::NoMem),
            -4 => Some(Self::NoFreeEnv),
            -5 => Some(Self::IpcNotSend),
            -6 => Some(Self::SwapFull),
            -7 => Some(Self::Paging),
            _ => None,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
