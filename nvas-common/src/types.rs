// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Virtual address inside a GPU address space.
pub type GPUVAddr = u64;

/// Device (SMMU) address returned when a memory handle is pinned.
pub type DAddr = u64;

/// Guest CPU virtual address.
pub type VAddr = u64;

/// Small GPU page size (4 KiB).
pub const SMALL_PAGE_SIZE: u32 = 0x1000;

/// log2 of [`SMALL_PAGE_SIZE`].
pub const SMALL_PAGE_BITS: u32 = SMALL_PAGE_SIZE.trailing_zeros();

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Like [`align_up`], returning `None` if the result does not fit in a `u64`.
#[inline]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    let mask = alignment - 1;
    match value.checked_add(mask) {
        Some(sum) => Some(sum & !mask),
        None => None,
    }
}

/// Check whether `value` is a multiple of the power-of-two `alignment`.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Smallest `n` such that `1 << n >= value`.
#[inline]
pub const fn log2_ceil(value: u64) -> u32 {
    if value <= 1 {
        0
    } else {
        u64::BITS - (value - 1).leading_zeros()
    }
}
