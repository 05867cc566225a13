// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Two-phase virtual range allocator.
//!
//! Allocations are bump-allocated from a linear frontier until a request no
//! longer fits above it. From then on the allocator permanently falls back to
//! a first-fit scan over the holes in its block list. Units are whatever the
//! caller uses (the address-space device uses page indices).

use parking_lot::Mutex;

use crate::address_space::{AddressSpaceError, AddressSpaceResult, Block, BlockList};

struct AllocatorState {
    blocks: BlockList<bool, ()>,
    linear_frontier: u64,
    linear_exhausted: bool,
}

/// Used/free tracker over `[va_start, va_limit)`.
pub struct Allocator {
    state: Mutex<AllocatorState>,
    va_start: u64,
}

impl Allocator {
    pub fn new(va_start: u64, va_limit: u64) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                blocks: BlockList::new(va_limit, None),
                linear_frontier: va_start,
                linear_exhausted: va_start >= va_limit,
            }),
            va_start,
        }
    }

    /// Allocate `size` units, returning the start of the range or `None` if
    /// no hole is large enough.
    pub fn allocate(&self, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }

        let mut state = self.state.lock();

        let linear = if state.linear_exhausted {
            None
        } else {
            let found = state.blocks.find_free(state.linear_frontier, size);
            if found.is_none() {
                log::debug!(
                    "allocator: linear region exhausted at 0x{:X}, falling back to scanning",
                    state.linear_frontier
                );
                state.linear_exhausted = true;
            }
            found
        };

        let start = match linear {
            Some(start) => {
                state.linear_frontier = start + size;
                start
            }
            None => state.blocks.find_free(self.va_start, size)?,
        };

        // `find_free` only returns holes below the VA limit.
        state.blocks.map(start, true, size, ()).ok()?;
        Some(start)
    }

    /// Mark `[virt, virt + size)` as used, wherever the caller wants it.
    pub fn allocate_fixed(&self, virt: u64, size: u64) -> AddressSpaceResult<()> {
        if virt < self.va_start {
            return Err(AddressSpaceError::BelowStart {
                start: virt,
                va_start: self.va_start,
            });
        }
        self.state.lock().blocks.map(virt, true, size, ())
    }

    /// Return `[virt, virt + size)` to the free pool.
    pub fn free(&self, virt: u64, size: u64) -> AddressSpaceResult<()> {
        let mut state = self.state.lock();
        state.blocks.unmap(virt, size)?;

        // Pull the frontier back over any free run directly below it so the
        // most recently released space is handed out again first.
        if !state.linear_exhausted && state.linear_frontier > self.va_start {
            if let Some(run_start) = state.blocks.unmapped_run_start(state.linear_frontier - 1) {
                state.linear_frontier = run_start.max(self.va_start);
            }
        }
        Ok(())
    }

    /// Whether `[virt, virt + size)` is entirely free.
    pub fn is_free(&self, virt: u64, size: u64) -> bool {
        self.state.lock().blocks.is_range_free(virt, size)
    }

    pub fn va_start(&self) -> u64 {
        self.va_start
    }

    pub fn va_limit(&self) -> u64 {
        self.state.lock().blocks.va_limit()
    }

    /// Next address the linear phase would try.
    pub fn linear_frontier(&self) -> u64 {
        self.state.lock().linear_frontier
    }

    /// Whether the allocator has switched to scanning for holes.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().linear_exhausted
    }

    /// Snapshot of the used/free block list.
    pub fn blocks(&self) -> Vec<Block<bool>> {
        self.state.lock().blocks.blocks().to_vec()
    }
}
