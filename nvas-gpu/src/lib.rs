// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU-side collaborators of the nvdrv address-space device: the GMMU page
//! table and the GPU context that owns address spaces and channels.

pub mod gpu_context;
pub mod memory_manager;

pub use gpu_context::{ChannelState, GpuContext, GpuHost};
pub use memory_manager::{AddressSpaceLayout, GpuMemoryManager, GpuPageTable, PageState, PteKind};
