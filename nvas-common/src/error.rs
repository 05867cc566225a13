// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

/// Result code reported back to the guest by nvdrv devices.
///
/// The discriminants match the values the guest driver ABI expects, so the
/// enum can be written to the IPC response as-is via [`NvResult::raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum NvResult {
    #[error("success")]
    Success = 0x0,
    #[error("not implemented")]
    NotImplemented = 0x1,
    #[error("not supported")]
    NotSupported = 0x2,
    #[error("not initialized")]
    NotInitialized = 0x3,
    #[error("bad parameter")]
    BadParameter = 0x4,
    #[error("timeout")]
    Timeout = 0x5,
    #[error("insufficient memory")]
    InsufficientMemory = 0x6,
    #[error("read-only attribute")]
    ReadOnlyAttribute = 0x7,
    #[error("invalid state")]
    InvalidState = 0x8,
    #[error("invalid address")]
    InvalidAddress = 0x9,
    #[error("invalid size")]
    InvalidSize = 0xA,
    #[error("bad value")]
    BadValue = 0xB,
    #[error("already allocated")]
    AlreadyAllocated = 0xD,
    #[error("busy")]
    Busy = 0xE,
    #[error("resource error")]
    ResourceError = 0xF,
    #[error("count mismatch")]
    CountMismatch = 0x10,
    #[error("overflow")]
    Overflow = 0x11,
    #[error("access denied")]
    AccessDenied = 0x30003,
}

impl NvResult {
    /// Raw u32 value written to the guest.
    #[inline]
    pub const fn raw(self) -> u32 {
        self as u32
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<Result<(), NvResult>> for NvResult {
    fn from(result: Result<(), NvResult>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(err) => err,
        }
    }
}
