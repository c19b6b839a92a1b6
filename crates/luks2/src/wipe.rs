// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Destroying a volume: either just its headers (cheap, recoverable only
//! by an attacker who already extracted a header backup) or a full
//! overwrite of every byte this format reserves for itself.

use std::path::Path;

use log::{info, warn};
use snafu::{ResultExt, Snafu};

use crate::device::{Device, DeviceError};
use crate::header::{backup_header_offset, HEADER_SIZE};
use crate::primitives::fill_random;

const WIPE_CHUNK_SIZE: usize = 1024 * 1024;

/// How thoroughly [`wipe`] destroys a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeMode {
    /// Overwrite only the primary and backup header copies (and their
    /// JSON areas). Fast; sufficient to make the volume unreadable by
    /// this engine, but any keyslot area bytes an attacker already copied
    /// remain exploitable to brute-force forever.
    HeadersOnly,
    /// Overwrite the header copies, JSON areas, and the full keyslots
    /// area — everything this format reserves ahead of the data segment.
    /// Does not touch the data segment itself.
    Full,
}

/// Pattern used to overwrite wiped bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipePattern {
    Zero,
    Random,
}

#[derive(Debug, Clone, Copy)]
pub struct WipeOptions {
    pub mode: WipeMode,
    pub pattern: WipePattern,
}

impl Default for WipeOptions {
    fn default() -> Self {
        Self {
            mode: WipeMode::Full,
            pattern: WipePattern::Random,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum WipeError {
    #[snafu(display("device I/O failed while wiping"))]
    Device { source: DeviceError },
}

fn overwrite_range(device: &mut Device, mut offset: u64, mut len: u64, pattern: WipePattern) -> Result<(), WipeError> {
    let mut chunk = vec![0u8; WIPE_CHUNK_SIZE.min(len as usize).max(1)];
    while len > 0 {
        let n = (chunk.len() as u64).min(len) as usize;
        match pattern {
            WipePattern::Zero => chunk[..n].fill(0),
            WipePattern::Random => fill_random(&mut chunk[..n]),
        }
        device.write_at(offset, &chunk[..n]).context(DeviceSnafu)?;
        offset += n as u64;
        len -= n as u64;
    }
    Ok(())
}

/// Destroy a volume per `options`. The engine reading this device
/// afterwards will see `BothHeadersInvalid`; there is no undo.
///
/// For [`WipeMode::Full`], the volume's `json_size`/`keyslots_size` are
/// read from its current metadata first so the keyslots area can be
/// wiped precisely; if neither header copy is valid any more, this falls
/// back to a headers-only wipe (there's nothing left to discover the
/// keyslots area's extent from).
pub fn wipe(path: impl AsRef<Path>, options: &WipeOptions) -> Result<(), WipeError> {
    if options.mode == WipeMode::Full {
        if let Ok(engine) = crate::engine::HeaderEngine::read(path.as_ref()) {
            let json_size = engine.json_size();
            let keyslots_size = engine.metadata.config.keyslots_size;
            drop(engine);
            return wipe_known_layout(path, json_size, keyslots_size, options);
        }
        warn!("could not read volume layout for a full wipe, falling back to headers-only");
    }

    let mut device = Device::open(path).context(DeviceSnafu)?;
    overwrite_range(&mut device, 0, HEADER_SIZE as u64, options.pattern).context(DeviceSnafu)?;
    // Without a readable primary header we don't know which json_size was
    // in play, so the backup copy's offset is unknown too; destroy it at
    // every offset format() could have placed it at.
    for &json_size in &crate::metadata::ALLOWED_JSON_SIZES {
        overwrite_range(&mut device, backup_header_offset(json_size), HEADER_SIZE as u64, options.pattern).context(DeviceSnafu)?;
    }
    device.sync().context(DeviceSnafu)?;

    info!("wiped headers (pattern={:?})", options.pattern);
    Ok(())
}

/// Destroy a volume whose `keyslots_size` is already known (e.g. from a
/// prior successful [`crate::engine::HeaderEngine::read`]), wiping exactly
/// the header copies, JSON areas, and keyslots area this format reserved.
pub fn wipe_known_layout(path: impl AsRef<Path>, json_size: u64, keyslots_size: u64, options: &WipeOptions) -> Result<(), WipeError> {
    let mut device = Device::open(path).context(DeviceSnafu)?;
    let backup_offset = backup_header_offset(json_size);

    overwrite_range(&mut device, 0, HEADER_SIZE as u64 + json_size, options.pattern).context(DeviceSnafu)?;
    overwrite_range(&mut device, backup_offset, HEADER_SIZE as u64 + json_size, options.pattern).context(DeviceSnafu)?;

    if options.mode == WipeMode::Full {
        let keyslots_offset = backup_offset + HEADER_SIZE as u64 + json_size;
        overwrite_range(&mut device, keyslots_offset, keyslots_size, options.pattern).context(DeviceSnafu)?;
    }

    device.sync().context(DeviceSnafu)?;
    info!(
        "wiped device with known layout (mode={:?}, pattern={:?}, keyslots_size={keyslots_size})",
        options.mode, options.pattern
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::engine::{EngineError, FormatOptions, HeaderEngine};

    fn make_device(size: u64) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; size as usize]).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test_log::test]
    fn headers_only_wipe_makes_volume_unreadable() {
        let tmp = make_device(32 * 1024 * 1024);
        let engine = HeaderEngine::format(tmp.path(), &FormatOptions::default()).unwrap();
        drop(engine);

        wipe(
            tmp.path(),
            &WipeOptions {
                mode: WipeMode::HeadersOnly,
                pattern: WipePattern::Zero,
            },
        )
        .unwrap();

        assert!(matches!(HeaderEngine::read(tmp.path()), Err(EngineError::BothHeadersInvalid)));
    }

    #[test_log::test]
    fn known_layout_wipe_clears_keyslots_area() {
        let tmp = make_device(32 * 1024 * 1024);
        let options = FormatOptions {
            keyslots_size: 1024 * 1024,
            ..Default::default()
        };
        let engine = HeaderEngine::format(tmp.path(), &options).unwrap();
        let json_size = engine.json_size();
        let keyslots_offset = engine.keyslots_area_offset();
        drop(engine);

        {
            let mut device = Device::open(tmp.path()).unwrap();
            device.write_at(keyslots_offset, &[0xAB; 4096]).unwrap();
            device.sync().unwrap();
        }

        wipe_known_layout(
            tmp.path(),
            json_size,
            1024 * 1024,
            &WipeOptions {
                mode: WipeMode::Full,
                pattern: WipePattern::Zero,
            },
        )
        .unwrap();

        let mut device = Device::open(tmp.path()).unwrap();
        let mut buf = [0u8; 4096];
        device.read_at(keyslots_offset, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4096]);
    }
}
