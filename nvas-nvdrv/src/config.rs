// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;
use std::str::FromStr;

use ini::{Ini, Properties};
use log::{debug, info, warn};
use nvas_common::Settings;

const SECTION: &str = "GpuAddressSpace";

/// Load settings from the `[GpuAddressSpace]` section of an INI file.
///
/// Missing files, parse failures and malformed values fall back to the
/// defaults.
pub fn load_settings(path: &Path) -> Settings {
    let mut settings = Settings::default();

    if !path.exists() {
        warn!("Config file not found: {}", path.display());
        return settings;
    }

    info!("Loading config from: {}", path.display());

    let conf = match Ini::load_from_file(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            return settings;
        }
    };

    let Some(section) = conf.section(Some(SECTION)) else {
        debug!("No [{}] section, using defaults", SECTION);
        return settings;
    };

    if let Some(value) = read_bool(section, "fatal_invariant_violations") {
        settings.fatal_invariant_violations = value;
    }
    if let Some(value) = read_bool(section, "log_ioctls") {
        settings.log_ioctls = value;
    }

    if let Some(size) = read_number::<u32>(section, "big_page_size") {
        if Settings::is_supported_big_page_size(size) {
            settings.default_big_page_size = size;
        } else {
            warn!("Unsupported big_page_size 0x{:X}, keeping 0x{:X}", size, settings.default_big_page_size);
        }
    }

    let split = read_number::<u64>(section, "va_range_split").unwrap_or(settings.default_va_split);
    let end = read_number::<u64>(section, "va_range_end").unwrap_or(settings.default_va_end);
    if split < end {
        settings.default_va_split = split;
        settings.default_va_end = end;
    } else {
        warn!("va_range_split 0x{:X} is not below va_range_end 0x{:X}, using defaults", split, end);
    }

    debug!("GPU address space settings: {:?}", settings);
    settings
}

fn read_bool(section: &Properties, key: &str) -> Option<bool> {
    let value = section.get(key)?.trim();
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => {
            warn!("Ignoring malformed {}={}", key, value);
            None
        }
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn read_number<T>(section: &Properties, key: &str) -> Option<T>
where
    T: FromStr + TryFrom<u64>,
{
    let value = section.get(key)?.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok().and_then(|v| T::try_from(v).ok()),
        None => value.parse::<T>().ok(),
    };
    if parsed.is_none() {
        warn!("Ignoring malformed {}={}", key, value);
    }
    parsed
}
