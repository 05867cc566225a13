// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Flat, sorted interval map from virtual ranges to physical values.
//!
//! The map is a vector of [`Block`]s sorted by their virtual start. Each block
//! covers the range up to the next block's start (the last one extends to the
//! VA limit). A block whose physical value is [`BlockValue::UNMAPPED`] marks a
//! gap. The list always begins with a block at address zero and ends with an
//! unmapped block, and no two neighbouring blocks are both unmapped.

use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors returned by [`AddressSpaceMap`] and the allocator built on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressSpaceError {
    #[error("size must be non-zero")]
    ZeroSize,

    #[error("range [0x{start:X}..0x{end:X}) exceeds the VA limit 0x{limit:X}")]
    OutOfRange { start: u64, end: u64, limit: u64 },

    #[error("range at 0x{start:X} starts below the VA start 0x{va_start:X}")]
    BelowStart { start: u64, va_start: u64 },

    #[error("range at 0x{start:X} with size 0x{size:X} overflows the address width")]
    Overflow { start: u64, size: u64 },
}

/// Result alias for interval map operations.
pub type AddressSpaceResult<T> = Result<T, AddressSpaceError>;

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// Physical payload stored in a [`Block`].
pub trait BlockValue: Copy + PartialEq + fmt::Debug {
    /// Sentinel meaning "not mapped". Distinct from any real value, so a
    /// physical address of zero stays representable.
    const UNMAPPED: Self;

    /// The value `delta` units past the start of a block holding `self`.
    /// Used when a block is split and its tail keeps the original mapping.
    fn advance(self, delta: u64) -> Self;
}

impl BlockValue for u64 {
    const UNMAPPED: Self = u64::MAX;

    fn advance(self, delta: u64) -> Self {
        if self == Self::UNMAPPED {
            self
        } else {
            self + delta
        }
    }
}

/// Used/free state, as tracked by the allocator.
impl BlockValue for bool {
    const UNMAPPED: Self = false;

    fn advance(self, _delta: u64) -> Self {
        self
    }
}

/// Start of a run of address space sharing one mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<P, E = ()> {
    pub virt: u64,
    pub phys: P,
    pub extra: E,
}

impl<P: BlockValue, E: Default> Block<P, E> {
    fn unmapped(virt: u64) -> Self {
        Self {
            virt,
            phys: P::UNMAPPED,
            extra: E::default(),
        }
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.phys != P::UNMAPPED
    }
}

/// Invoked with `(virt, size)` after every successful map or unmap.
pub type ChangeCallback = Box<dyn FnMut(u64, u64) + Send>;

// ---------------------------------------------------------------------------
// Unlocked block list
// ---------------------------------------------------------------------------

/// The block vector itself. Callers hold the owning lock.
pub(crate) struct BlockList<P, E> {
    blocks: Vec<Block<P, E>>,
    va_limit: u64,
    callback: Option<ChangeCallback>,
}

impl<P, E> BlockList<P, E>
where
    P: BlockValue,
    E: Copy + Default,
{
    pub(crate) fn new(va_limit: u64, callback: Option<ChangeCallback>) -> Self {
        Self {
            blocks: vec![Block::unmapped(0)],
            va_limit,
            callback,
        }
    }

    pub(crate) fn va_limit(&self) -> u64 {
        self.va_limit
    }

    pub(crate) fn blocks(&self) -> &[Block<P, E>] {
        &self.blocks
    }

    pub(crate) fn map(&mut self, virt: u64, phys: P, size: u64, extra: E) -> AddressSpaceResult<()> {
        let end = self.check_range(virt, size)?;
        self.write_range(virt, end, phys, extra);
        self.notify(virt, size);
        Ok(())
    }

    pub(crate) fn unmap(&mut self, virt: u64, size: u64) -> AddressSpaceResult<()> {
        let end = self.check_range(virt, size)?;
        self.write_range(virt, end, P::UNMAPPED, E::default());
        self.notify(virt, size);
        Ok(())
    }

    /// Physical value at `virt`, offset into its block.
    pub(crate) fn lookup(&self, virt: u64) -> Option<P> {
        if virt >= self.va_limit {
            return None;
        }
        let block = &self.blocks[self.index_of(virt)];
        block
            .is_mapped()
            .then(|| block.phys.advance(virt - block.virt))
    }

    /// Lowest address `>= from` where `size` unmapped units fit below the
    /// VA limit. First fit, in address order.
    pub(crate) fn find_free(&self, from: u64, size: u64) -> Option<u64> {
        let first = self.index_of(from.min(self.va_limit));
        for (i, block) in self.blocks.iter().enumerate().skip(first) {
            if block.virt >= self.va_limit {
                break;
            }
            if block.is_mapped() {
                continue;
            }
            let gap_start = block.virt.max(from);
            let gap_end = self
                .blocks
                .get(i + 1)
                .map_or(self.va_limit, |next| next.virt.min(self.va_limit));
            if gap_end > gap_start && gap_end - gap_start >= size {
                return Some(gap_start);
            }
        }
        None
    }

    /// Start of the unmapped run covering `virt`, if `virt` is unmapped.
    pub(crate) fn unmapped_run_start(&self, virt: u64) -> Option<u64> {
        let block = &self.blocks[self.index_of(virt)];
        (!block.is_mapped()).then_some(block.virt)
    }

    /// Whether no part of `[virt, virt + size)` is mapped.
    pub(crate) fn is_range_free(&self, virt: u64, size: u64) -> bool {
        let end = virt.saturating_add(size);
        let first = self.index_of(virt);
        self.blocks[first..]
            .iter()
            .take_while(|block| block.virt < end)
            .all(|block| !block.is_mapped())
    }

    /// Index of the block covering `virt`. The list always starts at zero,
    /// so such a block exists.
    fn index_of(&self, virt: u64) -> usize {
        self.blocks
            .partition_point(|block| block.virt <= virt)
            .saturating_sub(1)
    }

    fn check_range(&self, virt: u64, size: u64) -> AddressSpaceResult<u64> {
        if size == 0 {
            return Err(AddressSpaceError::ZeroSize);
        }
        let end = virt
            .checked_add(size)
            .ok_or(AddressSpaceError::Overflow { start: virt, size })?;
        if end > self.va_limit {
            return Err(AddressSpaceError::OutOfRange {
                start: virt,
                end,
                limit: self.va_limit,
            });
        }
        Ok(end)
    }

    /// Replace `[virt, end)` with a single block, keeping whatever was
    /// mapped at `end` as a tail block.
    fn write_range(&mut self, virt: u64, end: u64, phys: P, extra: E) {
        let first = self.blocks.partition_point(|block| block.virt < virt);
        let last = self.blocks.partition_point(|block| block.virt < end);

        let tail = match self.blocks.get(last) {
            Some(next) if next.virt == end => None,
            _ => {
                let pred = self.blocks[last - 1];
                Some(Block {
                    virt: end,
                    phys: pred.phys.advance(end - pred.virt),
                    extra: pred.extra,
                })
            }
        };

        let head = Block { virt, phys, extra };
        self.blocks
            .splice(first..last, std::iter::once(head).chain(tail));
        self.coalesce(first);
    }

    /// Merge unmapped neighbours around the block written at `at`.
    fn coalesce(&mut self, at: usize) {
        let mut i = at.max(1);
        while i < self.blocks.len() && i <= at + 1 {
            if self.blocks[i - 1].is_mapped() || self.blocks[i].is_mapped() {
                i += 1;
            } else {
                self.blocks.remove(i);
            }
        }
    }

    fn notify(&mut self, virt: u64, size: u64) {
        if let Some(callback) = self.callback.as_mut() {
            callback(virt, size);
        }
    }
}

// ---------------------------------------------------------------------------
// Locked map
// ---------------------------------------------------------------------------

/// Thread-safe interval map. Every operation holds the internal lock for its
/// whole duration, including the change callback, so the callback must not
/// call back into the same map.
pub struct AddressSpaceMap<P, E = ()> {
    inner: Mutex<BlockList<P, E>>,
}

impl<P, E> AddressSpaceMap<P, E>
where
    P: BlockValue,
    E: Copy + Default,
{
    /// Create an empty (fully unmapped) map covering `[0, va_limit)`.
    pub fn new(va_limit: u64) -> Self {
        Self {
            inner: Mutex::new(BlockList::new(va_limit, None)),
        }
    }

    /// Like [`Self::new`], registering a callback for every changed range.
    pub fn with_callback(va_limit: u64, callback: impl FnMut(u64, u64) + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(BlockList::new(va_limit, Some(Box::new(callback)))),
        }
    }

    /// Map `[virt, virt + size)` to `phys`, splitting any blocks it overlaps.
    pub fn map(&self, virt: u64, phys: P, size: u64, extra: E) -> AddressSpaceResult<()> {
        self.inner.lock().map(virt, phys, size, extra)
    }

    /// Unmap `[virt, virt + size)`, merging with adjacent unmapped runs.
    pub fn unmap(&self, virt: u64, size: u64) -> AddressSpaceResult<()> {
        self.inner.lock().unmap(virt, size)
    }

    /// Translate a virtual address. Returns `None` if it is not mapped.
    pub fn translate(&self, virt: u64) -> Option<P> {
        self.inner.lock().lookup(virt)
    }

    /// Snapshot of the current block list.
    pub fn blocks(&self) -> Vec<Block<P, E>> {
        self.inner.lock().blocks().to_vec()
    }

    pub fn va_limit(&self) -> u64 {
        self.inner.lock().va_limit()
    }
}
