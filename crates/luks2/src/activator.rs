// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The boundary to kernel device-mapper activation.
//!
//! Everything up to this point — unlocking a keyslot, recovering the
//! master key, picking the data segment — stays in this crate. Actually
//! mapping a `dm-crypt` target is out of scope: callers that want an
//! activated `/dev/mapper/...` node implement [`Activator`] themselves
//! (typically by shelling out to `cryptsetup` or talking to
//! `libdevmapper` directly) and receive exactly the parameters dm-crypt
//! needs, never anything more.

use std::path::PathBuf;

use zeroize::Zeroizing;

use crate::engine::HeaderEngine;
use crate::metadata::SegmentSize;

/// Errors resolving a volume's active data segment into activation
/// parameters.
#[derive(Debug, snafu::Snafu)]
pub enum ActivationError {
    #[snafu(display("segment {id} not found"))]
    SegmentNotFound { id: String },

    #[snafu(display("segment {id} size is dynamic but the device size ({device_size}) is smaller than its offset ({offset})"))]
    DynamicSizeUnderflow { id: String, device_size: u64, offset: u64 },
}

/// Everything a `dm-crypt`-style activator needs to map the plaintext
/// device, and nothing else. No key, passphrase, or metadata is
/// persisted beyond what the caller does with this value itself.
#[derive(Debug)]
pub struct ActivationParams {
    /// Raw master key bytes for this segment's cipher. Zeroized on drop;
    /// the caller is responsible for not copying it out insecurely (e.g.
    /// to a dm-crypt keyfile, which is the typical handoff to the
    /// kernel).
    pub master_key: Zeroizing<Vec<u8>>,
    /// dm-crypt cipher string, e.g. `"aes-xts-plain64"`.
    pub cipher_string: String,
    /// Offset of the segment's ciphertext, in `sector_size` units.
    pub segment_offset_sectors: u64,
    /// Sector size for this segment.
    pub sector_size: u32,
    /// Size of the plaintext data area, in `sector_size` units.
    pub data_size_sectors: u64,
    /// Path to the backing device or file.
    pub device_path: PathBuf,
}

/// Resolve `segment_id`'s on-disk parameters (and the master key recovered
/// via [`crate::crypto::unlock`]) into the fixed parameter set a
/// device-mapper activator needs. Performs no kernel interaction itself.
pub fn activation_params(
    engine: &HeaderEngine,
    device_path: PathBuf,
    device_size: u64,
    master_key: Zeroizing<Vec<u8>>,
    segment_id: &str,
) -> Result<ActivationParams, ActivationError> {
    let segment = engine
        .metadata
        .segments
        .get(segment_id)
        .ok_or_else(|| ActivationError::SegmentNotFound { id: segment_id.to_string() })?;

    let data_size_bytes = match segment.size {
        SegmentSize::Bytes(n) => n,
        SegmentSize::Dynamic => device_size.checked_sub(segment.offset).ok_or(ActivationError::DynamicSizeUnderflow {
            id: segment_id.to_string(),
            device_size,
            offset: segment.offset,
        })?,
    };

    Ok(ActivationParams {
        master_key,
        cipher_string: segment.encryption.clone(),
        segment_offset_sectors: segment.offset / segment.sector_size as u64,
        sector_size: segment.sector_size,
        data_size_sectors: data_size_bytes / segment.sector_size as u64,
        device_path,
    })
}

/// A caller-provided device-mapper activator. This crate never implements
/// it: actually creating a `dm-crypt` mapping requires root and a live
/// kernel, neither of which belong in a header-engine library or its test
/// suite.
pub trait Activator {
    type Error;

    /// Map `params` as an active, decrypted block device and return the
    /// path of the resulting node (e.g. `/dev/mapper/<name>`).
    fn activate(&self, name: &str, params: &ActivationParams) -> Result<PathBuf, Self::Error>;

    /// Tear down a previously activated mapping.
    fn deactivate(&self, name: &str) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::metadata::{Config, Metadata, Segment};

    fn engine_with_segment(size: SegmentSize) -> HeaderEngine {
        // HeaderEngine::format requires a real backing file; activation
        // param resolution only needs the metadata, so build a minimal
        // in-memory stand-in via a tempfile-backed format instead.
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0u8; 32 * 1024 * 1024]).unwrap();
        let mut engine = HeaderEngine::format(
            tmp.path(),
            &crate::engine::FormatOptions {
                keyslots_size: 4 * 1024 * 1024,
                ..Default::default()
            },
        )
        .unwrap();

        let mut segments = BTreeMap::new();
        segments.insert(
            "0".to_string(),
            Segment {
                type_: "crypt".to_string(),
                offset: 8 * 1024 * 1024,
                size,
                iv_tweak: 0,
                encryption: "aes-xts-plain64".to_string(),
                sector_size: 512,
                extra: Default::default(),
            },
        );
        engine.metadata = Metadata {
            keyslots: Default::default(),
            segments,
            digests: Default::default(),
            config: Config {
                json_size: engine.json_size(),
                keyslots_size: 4 * 1024 * 1024,
                flags: None,
                requirements: None,
                extra: Default::default(),
            },
            tokens: None,
            extra: Default::default(),
        };
        engine
    }

    #[test_log::test]
    fn resolves_fixed_size_segment() {
        let engine = engine_with_segment(SegmentSize::Bytes(16 * 1024 * 1024));
        let params = activation_params(
            &engine,
            PathBuf::from("/dev/null"),
            32 * 1024 * 1024,
            Zeroizing::new(vec![0u8; 64]),
            "0",
        )
        .unwrap();
        assert_eq!(params.segment_offset_sectors, 16384);
        assert_eq!(params.data_size_sectors, 32768);
        assert_eq!(params.cipher_string, "aes-xts-plain64");
    }

    #[test_log::test]
    fn resolves_dynamic_size_segment_from_device_size() {
        let engine = engine_with_segment(SegmentSize::Dynamic);
        let params = activation_params(
            &engine,
            PathBuf::from("/dev/null"),
            32 * 1024 * 1024,
            Zeroizing::new(vec![0u8; 64]),
            "0",
        )
        .unwrap();
        // (32MiB - 8MiB) / 512
        assert_eq!(params.data_size_sectors, (32 * 1024 * 1024 - 8 * 1024 * 1024) / 512);
    }

    #[test_log::test]
    fn missing_segment_is_reported() {
        let engine = engine_with_segment(SegmentSize::Dynamic);
        let result = activation_params(&engine, PathBuf::from("/dev/null"), 1, Zeroizing::new(vec![]), "nonexistent");
        assert!(matches!(result, Err(ActivationError::SegmentNotFound { .. })));
    }
}
