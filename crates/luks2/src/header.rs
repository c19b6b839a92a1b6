// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The fixed 4096-byte LUKS2 binary header: layout, encode/decode, and the
//! header checksum that guards it together with its JSON metadata area.
//!
//! Per spec, the two on-disk copies (primary at offset 0, backup at
//! [`backup_header_offset`] bytes in, `0x4000` for the common 12288-byte
//! JSON area) share this exact layout and differ only in `magic` and
//! `header_offset`.

use snafu::{ResultExt, Snafu};
use uuid::Uuid;
use zerocopy::byteorder::{LittleEndian, U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::hash::{HashAlgorithm, UnsupportedHash};
use crate::primitives::constant_time_eq;

/// Total size in bytes of one header copy, not counting its JSON area.
pub const HEADER_SIZE: usize = 4096;

const MAGIC_LEN: usize = 6;
const LABEL_LEN: usize = 48;
const CHECKSUM_ALG_LEN: usize = 32;
const SALT_LEN: usize = 64;
const UUID_LEN: usize = 40;
const CHECKSUM_LEN: usize = 64;
const FIXED_FIELDS_LEN: usize =
    MAGIC_LEN + 2 + 8 + 8 + LABEL_LEN + CHECKSUM_ALG_LEN + SALT_LEN + UUID_LEN + LABEL_LEN + 8 + CHECKSUM_LEN;
const PADDING_LEN: usize = HEADER_SIZE - FIXED_FIELDS_LEN;

/// Magic bytes at the start of the primary header copy.
pub const MAGIC_PRIMARY: [u8; MAGIC_LEN] = [b'L', b'U', b'K', b'S', 0xba, 0xbe];
/// Magic bytes at the start of the backup header copy.
pub const MAGIC_BACKUP: [u8; MAGIC_LEN] = [b'S', b'K', b'U', b'L', 0xba, 0xbe];

const LUKS2_VERSION: u16 = 2;

/// Byte offset of the backup header copy for a volume whose JSON area is
/// `json_size` bytes: immediately after the primary header's own
/// `HEADER_SIZE + json_size` bytes. For the default `json_size` of
/// 12288 this is `0x4000`, matching the layout diagram in spec.md §3;
/// larger `json_size` values (spec.md's enumerated 16384/32768/65536/
/// 262144/4177920) push the backup copy out accordingly, since both
/// header copies are the same total size.
pub fn backup_header_offset(json_size: u64) -> u64 {
    HEADER_SIZE as u64 + json_size
}

#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy)]
struct RawHeader {
    magic: [u8; MAGIC_LEN],
    version: U16<LittleEndian>,
    header_size: U64<LittleEndian>,
    sequence_id: U64<LittleEndian>,
    label: [u8; LABEL_LEN],
    checksum_algorithm: [u8; CHECKSUM_ALG_LEN],
    salt: [u8; SALT_LEN],
    uuid: [u8; UUID_LEN],
    subsystem_label: [u8; LABEL_LEN],
    header_offset: U64<LittleEndian>,
    padding: [u8; PADDING_LEN],
    checksum: [u8; CHECKSUM_LEN],
}

const _: () = assert!(std::mem::size_of::<RawHeader>() == HEADER_SIZE);

/// A decoded LUKS2 binary header copy, in idiomatic Rust types.
#[derive(Debug, Clone)]
pub struct Header {
    pub is_primary: bool,
    pub header_size: u64,
    pub sequence_id: u64,
    pub label: String,
    pub checksum_algorithm: HashAlgorithm,
    pub salt: [u8; SALT_LEN],
    pub uuid: Uuid,
    pub subsystem_label: String,
    pub checksum: [u8; CHECKSUM_LEN],
}

/// Errors decoding or validating a binary header.
#[derive(Debug, Snafu)]
pub enum HeaderError {
    #[snafu(display("header magic does not match either primary or backup constant"))]
    BadMagic,

    #[snafu(display("unsupported header version {version}, expected {LUKS2_VERSION}"))]
    BadVersion { version: u16 },

    #[snafu(display("header_size {header_size} is smaller than the fixed header ({HEADER_SIZE})"))]
    HeaderSizeTooSmall { header_size: u64 },

    #[snafu(display("header_offset {found} does not match the expected {expected} for this copy"))]
    BadHeaderOffset { found: u64, expected: u64 },

    #[snafu(display("header checksum algorithm is not supported: {source}"))]
    BadChecksumAlgorithm { source: UnsupportedHash },

    #[snafu(display("header uuid field is not valid UTF-8/ASCII"))]
    BadUuidEncoding,

    #[snafu(display("header uuid {uuid:?} does not parse as a UUID: {source}"))]
    BadUuid { uuid: String, source: uuid::Error },

    #[snafu(display("header uuid {uuid} is not a v4 (random) UUID"))]
    UuidNotV4 { uuid: Uuid },

    #[snafu(display("header field {field} value is longer than {max} bytes"))]
    FieldTooLong { field: &'static str, max: usize },

    #[snafu(display("label/subsystem/uuid field contains invalid UTF-8"))]
    BadStringEncoding { source: std::str::Utf8Error },
}

fn decode_fixed_str(buf: &[u8]) -> Result<String, HeaderError> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end])
        .map(str::to_owned)
        .context(BadStringEncodingSnafu)
}

fn encode_fixed_str(field: &'static str, s: &str, len: usize) -> Result<Vec<u8>, HeaderError> {
    let bytes = s.as_bytes();
    if bytes.len() >= len {
        return FieldTooLongSnafu { field, max: len - 1 }.fail();
    }
    let mut out = vec![0u8; len];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

impl Header {
    /// Encode this header into its fixed 4096-byte on-disk representation.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], HeaderError> {
        let magic = if self.is_primary { MAGIC_PRIMARY } else { MAGIC_BACKUP };
        let header_offset = if self.is_primary { 0 } else { backup_header_offset(self.json_size()) };

        let mut label = [0u8; LABEL_LEN];
        label.copy_from_slice(&encode_fixed_str("label", &self.label, LABEL_LEN)?);

        let mut subsystem_label = [0u8; LABEL_LEN];
        subsystem_label.copy_from_slice(&encode_fixed_str("subsystem_label", &self.subsystem_label, LABEL_LEN)?);

        let mut checksum_algorithm = [0u8; CHECKSUM_ALG_LEN];
        checksum_algorithm
            .copy_from_slice(&encode_fixed_str("checksum_algorithm", self.checksum_algorithm.name(), CHECKSUM_ALG_LEN)?);

        let mut uuid_field = [0u8; UUID_LEN];
        let uuid_string = self.uuid.hyphenated().to_string();
        uuid_field.copy_from_slice(&encode_fixed_str("uuid", &uuid_string, UUID_LEN)?);

        let raw = RawHeader {
            magic,
            version: U16::new(LUKS2_VERSION),
            header_size: U64::new(self.header_size),
            sequence_id: U64::new(self.sequence_id),
            label,
            checksum_algorithm,
            salt: self.salt,
            uuid: uuid_field,
            subsystem_label,
            header_offset: U64::new(header_offset),
            padding: [0u8; PADDING_LEN],
            checksum: self.checksum,
        };

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(raw.as_bytes());
        Ok(out)
    }

    /// Decode and validate a 4096-byte on-disk header copy.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, HeaderError> {
        let raw = RawHeader::read_from_bytes(bytes).expect("fixed-size buffer always parses");

        let is_primary = if raw.magic == MAGIC_PRIMARY {
            true
        } else if raw.magic == MAGIC_BACKUP {
            false
        } else {
            return BadMagicSnafu.fail();
        };

        let version = raw.version.get();
        if version != LUKS2_VERSION {
            return BadVersionSnafu { version }.fail();
        }

        let header_size = raw.header_size.get();
        if header_size < HEADER_SIZE as u64 {
            return HeaderSizeTooSmallSnafu { header_size }.fail();
        }

        let json_size = header_size - HEADER_SIZE as u64;
        let expected_offset = if is_primary { 0 } else { backup_header_offset(json_size) };
        let found_offset = raw.header_offset.get();
        if found_offset != expected_offset {
            return BadHeaderOffsetSnafu {
                found: found_offset,
                expected: expected_offset,
            }
            .fail();
        }

        let checksum_algorithm =
            HashAlgorithm::parse(&decode_fixed_str(&raw.checksum_algorithm)?).context(BadChecksumAlgorithmSnafu)?;

        let uuid_string = decode_fixed_str(&raw.uuid)?;
        let uuid = Uuid::parse_str(&uuid_string).context(BadUuidSnafu { uuid: uuid_string })?;
        if uuid.get_version() != Some(uuid::Version::Random) {
            return UuidNotV4Snafu { uuid }.fail();
        }

        Ok(Self {
            is_primary,
            header_size,
            sequence_id: raw.sequence_id.get(),
            label: decode_fixed_str(&raw.label)?,
            checksum_algorithm,
            salt: raw.salt,
            uuid,
            subsystem_label: decode_fixed_str(&raw.subsystem_label)?,
            checksum: raw.checksum,
        })
    }

    /// Number of JSON-area bytes this header's `header_size` implies.
    pub fn json_size(&self) -> u64 {
        self.header_size - HEADER_SIZE as u64
    }

    /// Compute the header checksum over this header (with its checksum
    /// field treated as zero) concatenated with exactly `json_size` bytes
    /// of `json_area`.
    pub fn compute_checksum(&self, json_area: &[u8]) -> Result<Vec<u8>, HeaderError> {
        let mut zeroed = self.clone();
        zeroed.checksum = [0u8; CHECKSUM_LEN];
        let mut encoded = zeroed.encode()?;
        let checksum_offset = HEADER_SIZE - CHECKSUM_LEN;
        encoded[checksum_offset..].fill(0);

        Ok(self.checksum_algorithm.digest_concat(&[&encoded, json_area]))
    }

    /// Recompute and store this header's checksum field over `json_area`.
    pub fn update_checksum(&mut self, json_area: &[u8]) -> Result<(), HeaderError> {
        let digest = self.compute_checksum(json_area)?;
        let mut field = [0u8; CHECKSUM_LEN];
        field[..digest.len()].copy_from_slice(&digest);
        self.checksum = field;
        Ok(())
    }

    /// Verify this header's stored checksum against `json_area`. Any bit
    /// flipped in the header (outside the checksum field) or in
    /// `json_area` invalidates this.
    pub fn verify_checksum(&self, json_area: &[u8]) -> bool {
        let expected = match self.compute_checksum(json_area) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let (stored, rest) = self.checksum.split_at(expected.len());
        rest.iter().all(|&b| b == 0) && constant_time_eq(stored, &expected)
    }
}
