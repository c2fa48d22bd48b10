//! Outcome taxonomy shared by the registry, sessions and the control surface.

use thiserror::Error;

use crate::device::DeviceClass;
use crate::hardware::DeviceHandle;

/// Raw outcome codes reported by the DirectOutput SDK.
pub mod codes {
    pub const E_PAGENOTACTIVE: u32 = 0xFF04_0001;
    pub const E_INVALIDARG: u32 = 0x8007_0057;
    pub const E_OUTOFMEMORY: u32 = 0x8007_000E;
    pub const E_HANDLE: u32 = 0x8007_0006;
    pub const E_NOTIMPL: u32 = 0x8000_4001;
}

/// A non-success outcome reported by the hardware adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("Page not active")]
    PageNotActive,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Invalid handle")]
    InvalidHandle,
    /// The SDK library could not be loaded (usually missing from the registry).
    #[error("Not implemented (DirectOutput library failed to load)")]
    NotImplemented,
    #[error("Unrecognized outcome {0:#x}")]
    Unrecognized(u32),
}

impl HardwareError {
    /// Resolve an SDK outcome code. Success codes (high bit clear) resolve to `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        if code & 0x8000_0000 == 0 {
            return None;
        }
        Some(match code {
            codes::E_PAGENOTACTIVE => Self::PageNotActive,
            codes::E_INVALIDARG => Self::InvalidArgument,
            codes::E_OUTOFMEMORY => Self::OutOfMemory,
            codes::E_HANDLE => Self::InvalidHandle,
            codes::E_NOTIMPL => Self::NotImplemented,
            other => Self::Unrecognized(other),
        })
    }

    /// The SDK outcome code this error stands for.
    pub fn code(&self) -> u32 {
        match self {
            Self::PageNotActive => codes::E_PAGENOTACTIVE,
            Self::InvalidArgument => codes::E_INVALIDARG,
            Self::OutOfMemory => codes::E_OUTOFMEMORY,
            Self::InvalidHandle => codes::E_HANDLE,
            Self::NotImplemented => codes::E_NOTIMPL,
            Self::Unrecognized(code) => *code,
        }
    }
}

/// Errors produced by device sessions and the device registry.
#[derive(Debug, Error)]
pub enum Error {
    #[error("page {0} not found")]
    PageNotFound(u32),

    #[error("no {0} device connected")]
    DeviceNotFound(DeviceClass),

    #[error("page {0} already exists")]
    AlreadyExists(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("line {0} out of range (expected 0, 1 or 2)")]
    LineOutOfRange(i64),

    #[error("{operation} failed: {source}")]
    Hardware {
        operation: &'static str,
        #[source]
        source: HardwareError,
    },

    #[error("device {0} is already registered")]
    DuplicateDevice(DeviceHandle),
}

impl Error {
    pub fn hardware(operation: &'static str, source: HardwareError) -> Self {
        Self::Hardware { operation, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
