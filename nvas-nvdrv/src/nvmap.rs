// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Physical memory handles.
//!
//! The address-space device only needs to look handles up and pin/unpin
//! them, so it talks to a [`HandleProvider`]. [`NvMap`] is the in-memory
//! handle container backing `/dev/nvmap`.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use nvas_common::{checked_align_up, DAddr, NvResult, VAddr, SMALL_PAGE_SIZE};

pub type HandleId = u32;

/// Snapshot of a handle's properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub id: HandleId,
    /// Size aligned up to the small page size.
    pub size: u64,
    /// Size aligned up to `align` once allocated.
    pub aligned_size: u64,
    /// Size the handle was created with.
    pub orig_size: u64,
    pub align: u64,
    pub kind: u8,
    /// Backing address, valid once allocated.
    pub address: VAddr,
    pub allocated: bool,
}

/// Physical-handle provider consumed by the address-space device.
pub trait HandleProvider: Send + Sync {
    fn get_handle(&self, id: HandleId) -> Option<HandleInfo>;

    /// Pin the handle's memory and return its device address.
    /// Returns `None` if the handle does not exist or is not allocated.
    fn pin_handle(&self, id: HandleId) -> Option<DAddr>;

    fn unpin_handle(&self, id: HandleId);
}

struct NvMapHandle {
    info: HandleInfo,
    pins: u32,
}

/// In-memory handle container.
pub struct NvMap {
    handles: RwLock<HashMap<HandleId, NvMapHandle>>,
    next_id: Mutex<HandleId>,
}

impl NvMap {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Create an unallocated handle of `size` bytes.
    pub fn create_handle(&self, size: u64) -> Result<HandleId, NvResult> {
        if size == 0 {
            log::error!("nvmap: create of zero-sized handle");
            return Err(NvResult::BadValue);
        }

        let aligned = checked_align_up(size, SMALL_PAGE_SIZE as u64).ok_or_else(|| {
            log::error!("nvmap: create of oversized handle 0x{:X}", size);
            NvResult::BadValue
        })?;

        let id = {
            let mut next_id = self.next_id.lock();
            let id = *next_id;
            *next_id += 1;
            id
        };
        self.handles.write().insert(
            id,
            NvMapHandle {
                info: HandleInfo {
                    id,
                    size: aligned,
                    aligned_size: aligned,
                    orig_size: size,
                    align: SMALL_PAGE_SIZE as u64,
                    kind: 0,
                    address: 0,
                    allocated: false,
                },
                pins: 0,
            },
        );
        log::debug!("nvmap: create size=0x{:X} -> handle={}", size, id);
        Ok(id)
    }

    /// Back a handle with memory at `address`.
    pub fn alloc_handle(&self, id: HandleId, align: u64, kind: u8, address: VAddr) -> Result<(), NvResult> {
        let align = align.max(SMALL_PAGE_SIZE as u64);
        if !align.is_power_of_two() {
            log::error!("nvmap: alloc handle={} with bad alignment 0x{:X}", id, align);
            return Err(NvResult::BadValue);
        }

        let mut handles = self.handles.write();
        let handle = handles.get_mut(&id).ok_or(NvResult::BadValue)?;
        if handle.info.allocated {
            log::warn!("nvmap: handle={} is already allocated", id);
            return Err(NvResult::AlreadyAllocated);
        }

        let aligned_size = checked_align_up(handle.info.size, align).ok_or_else(|| {
            log::error!("nvmap: alloc handle={} with oversized alignment 0x{:X}", id, align);
            NvResult::BadValue
        })?;

        handle.info.align = align;
        handle.info.aligned_size = aligned_size;
        handle.info.kind = kind;
        handle.info.address = address;
        handle.info.allocated = true;
        log::debug!(
            "nvmap: alloc handle={}, align=0x{:X}, kind={}, addr=0x{:X}",
            id,
            align,
            kind,
            address
        );
        Ok(())
    }

    /// Remove a handle, returning its final state.
    pub fn free_handle(&self, id: HandleId) -> Result<HandleInfo, NvResult> {
        let handle = self.handles.write().remove(&id).ok_or(NvResult::BadValue)?;
        if handle.pins > 0 {
            log::warn!("nvmap: freeing handle={} with {} pins outstanding", id, handle.pins);
        }
        log::debug!("nvmap: free handle={}", id);
        Ok(handle.info)
    }

    pub fn pin_count(&self, id: HandleId) -> Option<u32> {
        self.handles.read().get(&id).map(|handle| handle.pins)
    }
}

impl Default for NvMap {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleProvider for NvMap {
    fn get_handle(&self, id: HandleId) -> Option<HandleInfo> {
        self.handles.read().get(&id).map(|handle| handle.info)
    }

    fn pin_handle(&self, id: HandleId) -> Option<DAddr> {
        let mut handles = self.handles.write();
        let handle = handles.get_mut(&id)?;
        if !handle.info.allocated {
            log::warn!("nvmap: pin of unallocated handle={}", id);
            return None;
        }
        handle.pins += 1;
        Some(handle.info.address)
    }

    fn unpin_handle(&self, id: HandleId) {
        let mut handles = self.handles.write();
        match handles.get_mut(&id) {
            Some(handle) if handle.pins > 0 => handle.pins -= 1,
            Some(_) => log::warn!("nvmap: unpin imbalance on handle={}", id),
            None => log::warn!("nvmap: unpin of unknown handle={}", id),
        }
    }
}
