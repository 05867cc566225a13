// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod address_space;
pub mod allocator;
pub mod error;
pub mod settings;
pub mod types;

pub use address_space::{AddressSpaceError, AddressSpaceMap, AddressSpaceResult, Block, BlockValue};
pub use allocator::Allocator;
pub use error::NvResult;
pub use settings::Settings;
pub use types::*;
