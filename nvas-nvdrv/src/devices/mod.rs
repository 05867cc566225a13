// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! NVIDIA driver device nodes.

pub mod nvhost_as_gpu;

use std::sync::Arc;

use nvas_common::{NvResult, Settings};
use nvas_gpu::GpuHost;

use crate::ioctl::Ioctl;
use crate::nvmap::HandleProvider;

pub use nvhost_as_gpu::NvHostAsGpu;

/// nvdrv file descriptor.
pub type DeviceFd = i32;

/// A device node that services ioctls.
///
/// Fixed requests carry one input and one output buffer. Variable requests
/// add an inline input buffer, inline requests an inline output buffer.
pub trait NvDevice: Send + Sync {
    fn name(&self) -> &str;

    fn handle_fixed_request(&self, command: Ioctl, input: &[u8], output: &mut [u8]) -> NvResult;

    fn handle_variable_request(
        &self,
        command: Ioctl,
        input: &[u8],
        inline_input: &[u8],
        output: &mut [u8],
    ) -> NvResult;

    fn handle_inline_request(
        &self,
        command: Ioctl,
        input: &[u8],
        output: &mut [u8],
        inline_output: &mut [u8],
    ) -> NvResult;

    fn on_open(&self, fd: DeviceFd);

    fn on_close(&self, fd: DeviceFd);

    /// Kernel event handle for `event_id`, if the device exposes one.
    fn query_event(&self, event_id: u32) -> Option<u32>;
}

/// Device kinds this driver can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    AddressSpace,
}

impl DeviceKind {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/dev/nvhost-as-gpu" => Some(Self::AddressSpace),
            _ => None,
        }
    }

    pub const fn path(self) -> &'static str {
        match self {
            Self::AddressSpace => "/dev/nvhost-as-gpu",
        }
    }
}

/// Collaborators shared by every device instance.
#[derive(Clone)]
pub struct DeviceContext {
    pub gpu: Arc<dyn GpuHost>,
    pub nvmap: Arc<dyn HandleProvider>,
    pub settings: Settings,
}

/// Create an NvDevice from a device path name.
pub fn create_device(path: &str, ctx: &DeviceContext) -> Option<Box<dyn NvDevice>> {
    match DeviceKind::from_path(path) {
        Some(DeviceKind::AddressSpace) => Some(Box::new(NvHostAsGpu::new(
            Arc::clone(&ctx.gpu),
            Arc::clone(&ctx.nvmap),
            ctx.settings.clone(),
        ))),
        None => {
            log::warn!("nvdrv: unknown device path \"{}\"", path);
            None
        }
    }
}
