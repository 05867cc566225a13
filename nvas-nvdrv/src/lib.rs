// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Emulated NVIDIA driver address-space device (`/dev/nvhost-as-gpu`).

pub mod config;
pub mod devices;
pub mod ioctl;
pub mod nvmap;

pub use devices::{create_device, DeviceContext, DeviceFd, DeviceKind, NvDevice, NvHostAsGpu};
pub use ioctl::{Ioctl, MappingFlags};
pub use nvmap::{HandleId, HandleInfo, HandleProvider, NvMap};
