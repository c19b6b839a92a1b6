// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The header engine: reads a volume's primary/backup headers and JSON
//! metadata, and commits changes back with a write protocol that keeps at
//! least one copy valid across a crash.
//!
//! On read, both copies are checksummed independently and the
//! higher-`sequence_id` valid copy wins, so a torn write to one copy never
//! takes down the volume as long as the other completed. On commit, the
//! primary copy is written and fsynced first, then the backup (spec.md
//! §4.3 step order), so a crash mid-commit always leaves the primary
//! holding the new, higher sequence_id — the backup either catches up on
//! the next successful commit or still holds the previous consistent
//! state.

use std::path::Path;

use log::{debug, info, warn};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

use crate::device::{Device, DeviceError};
use crate::hash::HashAlgorithm;
use crate::header::{backup_header_offset, Header, HeaderError, HEADER_SIZE};
use crate::metadata::{Config, Metadata, MetadataError, DEFAULT_JSON_SIZE};
use crate::primitives::{fill_random, is_power_of_two};

/// Options controlling a fresh `format`.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub label: String,
    pub subsystem_label: String,
    pub uuid: Option<Uuid>,
    pub json_size: u64,
    pub keyslots_size: u64,
    pub checksum_algorithm: HashAlgorithm,
    pub sector_size: u32,
    pub encryption: String,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            label: String::new(),
            subsystem_label: String::new(),
            uuid: None,
            json_size: DEFAULT_JSON_SIZE,
            // spec.md §6: "default ~16 MiB - 32 KiB".
            keyslots_size: 16 * 1024 * 1024 - 32 * 1024,
            checksum_algorithm: HashAlgorithm::Sha256,
            sector_size: 512,
            encryption: "aes-xts-plain64".to_string(),
        }
    }
}

/// Errors reading, formatting, or committing a volume's headers.
#[derive(Debug, Snafu)]
pub enum EngineError {
    #[snafu(display("device I/O failed"))]
    Device { source: DeviceError },

    #[snafu(display("neither header copy is valid"))]
    BothHeadersInvalid,

    #[snafu(display("header decode failed"))]
    Header { source: HeaderError },

    #[snafu(display("metadata decode failed"))]
    Metadata { source: MetadataError },

    #[snafu(display("json_size {json_size} is not one of the sizes format() accepts: {allowed:?}"))]
    UnsupportedJsonSize { json_size: u64, allowed: &'static [u64] },

    #[snafu(display("sector_size {sector_size} must be a power of two"))]
    InvalidSectorSize { sector_size: u32 },

    #[snafu(display("device ({device_size} bytes) is too small for the requested layout ({required} bytes)"))]
    DeviceTooSmall { device_size: u64, required: u64 },

    #[snafu(display("keyslots_size {keyslots_size} must be a multiple of 4096"))]
    UnalignedKeyslotsArea { keyslots_size: u64 },
}

/// A decoded, in-memory view of a volume's superblock, ready for reads or
/// (after mutation by [`crate::crypto`]) a [`HeaderEngine::commit`].
pub struct HeaderEngine {
    pub(crate) device: Device,
    header_size: u64,
    sequence_id: u64,
    label: String,
    checksum_algorithm: HashAlgorithm,
    salt: [u8; 64],
    uuid: Uuid,
    subsystem_label: String,
    pub metadata: Metadata,
}

/// A read-only summary of an opened volume, for display or logging.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub uuid: Uuid,
    pub label: String,
    pub sequence_id: u64,
    pub json_size: u64,
    pub keyslots_size: u64,
    pub keyslot_count: usize,
    pub segment_count: usize,
    pub digest_count: usize,
}

impl std::fmt::Display for VolumeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LUKS2 volume {} (label={:?}, sequence={}, json={}, keyslots_area={}, {} keyslot(s), {} segment(s), {} digest(s))",
            self.uuid,
            self.label,
            self.sequence_id,
            disks::format_size(self.json_size),
            disks::format_size(self.keyslots_size),
            self.keyslot_count,
            self.segment_count,
            self.digest_count,
        )
    }
}

fn json_offset(header_offset: u64) -> u64 {
    header_offset + HEADER_SIZE as u64
}

/// Try to read and validate the header + JSON metadata copy anchored at
/// `header_offset`. Returns `None` rather than failing outright: an
/// invalid copy is expected to happen (a torn write, a stale backup) and
/// is only fatal if *both* copies are invalid.
fn try_read_copy(device: &mut Device, header_offset: u64) -> Option<(Header, Vec<u8>)> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    device.read_at(header_offset, &mut header_bytes).ok()?;
    let header = Header::decode(&header_bytes).ok()?;

    let json_size = header.json_size();
    let mut json_area = vec![0u8; json_size as usize];
    device.read_at(json_offset(header_offset), &mut json_area).ok()?;

    if !header.verify_checksum(&json_area) {
        return None;
    }

    Some((header, json_area))
}

impl HeaderEngine {
    /// Open an existing volume read-only, preferring whichever of the
    /// primary/backup copies is valid and has the higher `sequence_id`.
    /// Takes no device lock (spec.md §5): tolerates a commit racing this
    /// read by falling through to whichever copy checksums clean. Use this
    /// for `read`/`info`/`unlock`; mutating callers need
    /// [`HeaderEngine::open_for_mutation`] instead.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let device = Device::open_read_only(path).context(DeviceSnafu)?;
        Self::open_with(device)
    }

    /// Open an existing volume for a mutating operation (`add_keyslot`,
    /// `wipe_keyslot`, or any other caller that will end by calling
    /// [`HeaderEngine::commit`]): takes the exclusive device lock first, so
    /// the read of the current header/metadata and the eventual commit
    /// happen under the same lock hold.
    pub fn open_for_mutation(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let device = Device::open(path).context(DeviceSnafu)?;
        Self::open_with(device)
    }

    fn open_with(mut device: Device) -> Result<Self, EngineError> {
        let primary = try_read_copy(&mut device, 0);

        // The backup copy's offset depends on json_size, which a healthy
        // primary already tells us. Only a corrupt primary forces a scan
        // over every json_size format() accepts.
        let backup = match &primary {
            Some((header, _)) => try_read_copy(&mut device, backup_header_offset(header.json_size())),
            None => crate::metadata::ALLOWED_JSON_SIZES
                .iter()
                .find_map(|&json_size| try_read_copy(&mut device, backup_header_offset(json_size))),
        };

        let (header, json_area) = match (primary, backup) {
            (Some(p), Some(b)) => {
                if b.0.sequence_id > p.0.sequence_id {
                    warn!("primary header is stale (sequence {} < backup {}), using backup", p.0.sequence_id, b.0.sequence_id);
                    b
                } else {
                    p
                }
            }
            (Some(p), None) => {
                warn!("backup header copy is invalid, continuing with primary only");
                p
            }
            (None, Some(b)) => {
                warn!("primary header copy is invalid, recovered from backup");
                b
            }
            (None, None) => return BothHeadersInvalidSnafu.fail(),
        };

        let metadata = crate::metadata::decode(&json_area, header.json_size()).context(MetadataSnafu)?;

        debug!("opened volume {} at sequence {}", header.uuid, header.sequence_id);

        Ok(Self {
            device,
            header_size: header.header_size,
            sequence_id: header.sequence_id,
            label: header.label,
            checksum_algorithm: header.checksum_algorithm,
            salt: header.salt,
            uuid: header.uuid,
            subsystem_label: header.subsystem_label,
            metadata,
        })
    }

    /// Lay out a brand-new volume: zeroed keyslots area, one data segment,
    /// no keyslots or digests yet (those are added with
    /// [`crate::crypto::add_keyslot`]).
    pub fn format(path: impl AsRef<Path>, options: &FormatOptions) -> Result<Self, EngineError> {
        if !crate::metadata::ALLOWED_JSON_SIZES.contains(&options.json_size) {
            return UnsupportedJsonSizeSnafu {
                json_size: options.json_size,
                allowed: &crate::metadata::ALLOWED_JSON_SIZES[..],
            }
            .fail();
        }
        if !is_power_of_two(options.sector_size as u64) {
            return InvalidSectorSizeSnafu {
                sector_size: options.sector_size,
            }
            .fail();
        }
        if !crate::primitives::is_aligned(options.keyslots_size, HEADER_SIZE as u64) {
            return UnalignedKeyslotsAreaSnafu {
                keyslots_size: options.keyslots_size,
            }
            .fail();
        }

        let keyslots_offset = backup_header_offset(options.json_size) + HEADER_SIZE as u64 + options.json_size;
        let data_offset = crate::primitives::align_up(keyslots_offset + options.keyslots_size, options.sector_size as u64);

        let mut device = Device::open(&path).context(DeviceSnafu)?;
        let required = data_offset + options.sector_size as u64;
        if device.size() < required {
            return DeviceTooSmallSnafu {
                device_size: device.size(),
                required,
            }
            .fail();
        }

        let mut segments = std::collections::BTreeMap::new();
        segments.insert(
            "0".to_string(),
            crate::metadata::Segment {
                type_: "crypt".to_string(),
                offset: data_offset,
                size: crate::metadata::SegmentSize::Dynamic,
                iv_tweak: 0,
                encryption: options.encryption.clone(),
                sector_size: options.sector_size,
                extra: Default::default(),
            },
        );

        let metadata = Metadata {
            keyslots: Default::default(),
            segments,
            digests: Default::default(),
            config: Config {
                json_size: options.json_size,
                keyslots_size: options.keyslots_size,
                flags: None,
                requirements: None,
                extra: Default::default(),
            },
            tokens: None,
            extra: Default::default(),
        };

        let mut salt = [0u8; 64];
        fill_random(&mut salt);

        let mut engine = Self {
            device,
            header_size: HEADER_SIZE as u64 + options.json_size,
            sequence_id: 0,
            label: options.label.clone(),
            checksum_algorithm: options.checksum_algorithm,
            salt,
            uuid: options.uuid.unwrap_or_else(Uuid::new_v4),
            subsystem_label: options.subsystem_label.clone(),
            metadata,
        };

        info!("formatting new volume {} (json_size={}, keyslots_size={})", engine.uuid, options.json_size, options.keyslots_size);
        engine.commit()?;
        Ok(engine)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn json_size(&self) -> u64 {
        self.header_size - HEADER_SIZE as u64
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    /// Start of the area available to keyslot material (after both header
    /// copies and their JSON areas).
    pub fn keyslots_area_offset(&self) -> u64 {
        backup_header_offset(self.json_size()) + HEADER_SIZE as u64 + self.json_size()
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            uuid: self.uuid,
            label: self.label.clone(),
            sequence_id: self.sequence_id,
            json_size: self.json_size(),
            keyslots_size: self.metadata.config.keyslots_size,
            keyslot_count: self.metadata.keyslots.len(),
            segment_count: self.metadata.segments.len(),
            digest_count: self.metadata.digests.len(),
        }
    }

    fn header(&self, is_primary: bool) -> Header {
        Header {
            is_primary,
            header_size: self.header_size,
            sequence_id: self.sequence_id,
            label: self.label.clone(),
            checksum_algorithm: self.checksum_algorithm,
            salt: self.salt,
            uuid: self.uuid,
            subsystem_label: self.subsystem_label.clone(),
            checksum: [0u8; 64],
        }
    }

    /// Persist the in-memory [`Metadata`] to both header copies, always
    /// incrementing `sequence_id`. The primary copy is written and synced
    /// first, then the backup, so a crash mid-commit always leaves the
    /// primary holding the committed update (spec.md §4.3).
    pub fn commit(&mut self) -> Result<(), EngineError> {
        self.sequence_id += 1;

        let json_size = self.json_size();
        let json_area = crate::metadata::encode(&self.metadata, json_size).context(MetadataSnafu)?;

        for (offset, is_primary) in [(0u64, true), (backup_header_offset(json_size), false)] {
            let mut header = self.header(is_primary);
            header.update_checksum(&json_area).context(HeaderSnafu)?;
            let header_bytes = header.encode().context(HeaderSnafu)?;

            self.device.write_at(offset, &header_bytes).context(DeviceSnafu)?;
            self.device.write_at(json_offset(offset), &json_area).context(DeviceSnafu)?;
            self.device.sync().context(DeviceSnafu)?;
        }

        debug!("committed volume {} at sequence {}", self.uuid, self.sequence_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn make_device(size: u64) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; size as usize]).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test_log::test]
    fn format_then_read_round_trips() {
        let tmp = make_device(32 * 1024 * 1024);
        let options = FormatOptions {
            label: "vault".to_string(),
            keyslots_size: 4 * 1024 * 1024,
            ..Default::default()
        };
        let engine = HeaderEngine::format(tmp.path(), &options).unwrap();
        let uuid = engine.uuid();
        drop(engine);

        let reopened = HeaderEngine::read(tmp.path()).unwrap();
        assert_eq!(reopened.uuid(), uuid);
        assert_eq!(reopened.sequence_id(), 1);
        assert_eq!(reopened.info().label, "vault");
    }

    #[test_log::test]
    fn commit_increments_sequence_id_each_time() {
        let tmp = make_device(32 * 1024 * 1024);
        let mut engine = HeaderEngine::format(tmp.path(), &FormatOptions::default()).unwrap();
        assert_eq!(engine.sequence_id(), 1);
        engine.commit().unwrap();
        assert_eq!(engine.sequence_id(), 2);
    }

    #[test_log::test]
    fn recovers_from_corrupted_primary_header() {
        let tmp = make_device(32 * 1024 * 1024);
        let engine = HeaderEngine::format(tmp.path(), &FormatOptions::default()).unwrap();
        let uuid = engine.uuid();
        drop(engine);

        {
            let mut device = Device::open(tmp.path()).unwrap();
            device.write_at(0, &[0xFFu8; HEADER_SIZE]).unwrap();
            device.sync().unwrap();
        }

        let recovered = HeaderEngine::read(tmp.path()).unwrap();
        assert_eq!(recovered.uuid(), uuid);
    }

    #[test_log::test]
    fn read_does_not_contend_with_a_concurrently_held_mutation_lock() {
        let tmp = make_device(32 * 1024 * 1024);
        let engine = HeaderEngine::format(tmp.path(), &FormatOptions::default()).unwrap();

        // `engine` still holds the exclusive lock `open_for_mutation`/
        // `format` take; a concurrent read-only open must still succeed.
        let reopened = HeaderEngine::read(tmp.path());
        assert!(reopened.is_ok());
        drop(engine);
    }

    #[test_log::test]
    fn open_for_mutation_contends_with_another_mutation_handle() {
        let tmp = make_device(32 * 1024 * 1024);
        let engine = HeaderEngine::format(tmp.path(), &FormatOptions::default()).unwrap();

        let second = HeaderEngine::open_for_mutation(tmp.path());
        assert!(matches!(second, Err(EngineError::Device { source: DeviceError::Busy { .. } })));
        drop(engine);
    }

    #[test_log::test]
    fn rejects_unsupported_json_size() {
        let tmp = make_device(32 * 1024 * 1024);
        let options = FormatOptions {
            json_size: 99999,
            ..Default::default()
        };
        assert!(matches!(
            HeaderEngine::format(tmp.path(), &options),
            Err(EngineError::UnsupportedJsonSize { .. })
        ));
    }

    #[test_log::test]
    fn rejects_device_too_small_for_requested_keyslots_area() {
        let tmp = make_device(1024 * 1024);
        let options = FormatOptions {
            keyslots_size: 16 * 1024 * 1024,
            ..Default::default()
        };
        assert!(matches!(
            HeaderEngine::format(tmp.path(), &options),
            Err(EngineError::DeviceTooSmall { .. })
        ));
    }
}
