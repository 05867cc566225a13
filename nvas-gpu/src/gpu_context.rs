// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Central GPU context.
//!
//! Owns every GMMU address space created by nvdrv and the per-channel state
//! that records which address space a channel executes in.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::memory_manager::{AddressSpaceLayout, GpuMemoryManager, GpuPageTable};

/// The GPU side of the address-space device: page table construction and
/// channel binding.
pub trait GpuHost: Send + Sync {
    /// Create the page table for a freshly initialised address space and
    /// register it with the GPU.
    fn create_address_space(&self, layout: AddressSpaceLayout) -> Arc<dyn GpuPageTable>;

    /// Make the channel opened as `channel_fd` execute in `page_table`.
    /// Returns `false` if no such channel exists.
    fn bind_channel(&self, channel_fd: i32, page_table: Arc<dyn GpuPageTable>) -> bool;
}

/// Per-channel GPU state.
#[derive(Default)]
pub struct ChannelState {
    pub memory_manager: Option<Arc<dyn GpuPageTable>>,
}

/// Central GPU state shared between nvdrv devices.
#[derive(Default)]
pub struct GpuContext {
    address_spaces: Mutex<Vec<Arc<GpuMemoryManager>>>,
    channels: RwLock<HashMap<i32, ChannelState>>,
}

impl GpuContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a GPU channel under its nvdrv file descriptor.
    pub fn open_channel(&self, fd: i32) {
        log::debug!("GpuContext: open channel fd={}", fd);
        self.channels.write().insert(fd, ChannelState::default());
    }

    pub fn close_channel(&self, fd: i32) {
        log::debug!("GpuContext: close channel fd={}", fd);
        self.channels.write().remove(&fd);
    }

    /// Page table the channel is currently bound to.
    pub fn channel_memory_manager(&self, fd: i32) -> Option<Arc<dyn GpuPageTable>> {
        self.channels
            .read()
            .get(&fd)
            .and_then(|channel| channel.memory_manager.clone())
    }

    /// Address space registered at `index`, in creation order.
    pub fn address_space(&self, index: usize) -> Option<Arc<GpuMemoryManager>> {
        self.address_spaces.lock().get(index).cloned()
    }

    pub fn address_space_count(&self) -> usize {
        self.address_spaces.lock().len()
    }
}

impl GpuHost for GpuContext {
    fn create_address_space(&self, layout: AddressSpaceLayout) -> Arc<dyn GpuPageTable> {
        log::debug!(
            "GpuContext: init address space bits={}, split=0x{:X}, big_page_bits={}",
            layout.address_space_bits,
            layout.split_address,
            layout.big_page_bits
        );
        let memory_manager = Arc::new(GpuMemoryManager::new(layout));
        self.address_spaces.lock().push(Arc::clone(&memory_manager));
        memory_manager
    }

    fn bind_channel(&self, channel_fd: i32, page_table: Arc<dyn GpuPageTable>) -> bool {
        match self.channels.write().get_mut(&channel_fd) {
            Some(channel) => {
                channel.memory_manager = Some(page_table);
                true
            }
            None => {
                log::warn!("GpuContext: bind to unknown channel fd={}", channel_fd);
                false
            }
        }
    }
}
