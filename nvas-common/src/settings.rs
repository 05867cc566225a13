// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Tunables for the GPU address-space emulation, populated from config INI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Abort on host-side invariant violations instead of logging them.
    pub fatal_invariant_violations: bool,

    // Default VA layout, used when the guest leaves the fields zeroed
    pub default_big_page_size: u32,
    pub default_va_split: u64,
    pub default_va_end: u64,

    // Debug
    pub log_ioctls: bool,
}

/// Big page sizes the guest may request (64 KiB and 128 KiB), as a mask.
pub const SUPPORTED_BIG_PAGE_SIZES: u32 = 0x30000;

pub const DEFAULT_BIG_PAGE_SIZE: u32 = 0x20000;
pub const DEFAULT_VA_SPLIT: u64 = 1 << 34;
pub const DEFAULT_VA_END: u64 = 1 << 37;

impl Settings {
    /// Whether `size` is a single power of two contained in
    /// [`SUPPORTED_BIG_PAGE_SIZES`].
    pub fn is_supported_big_page_size(size: u32) -> bool {
        size.is_power_of_two() && size & SUPPORTED_BIG_PAGE_SIZES != 0
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fatal_invariant_violations: cfg!(debug_assertions),
            default_big_page_size: DEFAULT_BIG_PAGE_SIZE,
            default_va_split: DEFAULT_VA_SPLIT,
            default_va_end: DEFAULT_VA_END,
            log_ioctls: false,
        }
    }
}
