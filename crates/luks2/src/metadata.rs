// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The embedded JSON metadata object: keyslots, segments, digests, and
//! config. Numeric byte sizes are carried on disk as decimal strings (a
//! format-mandated quirk, not a typo) and unknown fields round-trip
//! untouched for forward compatibility.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use snafu::{ResultExt, Snafu};

/// A keyslot area's `size` field, or the segment `size` sentinel
/// `"dynamic"` meaning "rest of device".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentSize {
    Dynamic,
    Bytes(u64),
}

impl Serialize for SegmentSize {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Dynamic => serializer.serialize_str("dynamic"),
            Self::Bytes(n) => serializer.serialize_str(&n.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for SegmentSize {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "dynamic" {
            Ok(Self::Dynamic)
        } else {
            raw.parse::<u64>().map(Self::Bytes).map_err(serde::de::Error::custom)
        }
    }
}

mod base64_field {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::primitives::{base64_decode, base64_encode};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        base64_decode(&raw).map_err(serde::de::Error::custom)
    }
}

/// A keyslot's key-derivation-function parameters, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum KdfField {
    #[serde(rename = "argon2id")]
    Argon2id {
        #[serde(with = "base64_field")]
        salt: Vec<u8>,
        time: u32,
        memory: u32,
        cpus: u32,
    },
    #[serde(rename = "argon2i")]
    Argon2i {
        #[serde(with = "base64_field")]
        salt: Vec<u8>,
        time: u32,
        memory: u32,
        cpus: u32,
    },
    #[serde(rename = "pbkdf2")]
    Pbkdf2 {
        #[serde(with = "base64_field")]
        salt: Vec<u8>,
        hash: String,
        iterations: u32,
    },
}

impl KdfField {
    pub fn salt(&self) -> &[u8] {
        match self {
            Self::Argon2id { salt, .. } | Self::Argon2i { salt, .. } | Self::Pbkdf2 { salt, .. } => salt,
        }
    }

    /// Convert to the crypto pipeline's [`crate::kdf::KdfParams`].
    pub fn to_params(&self) -> Result<crate::kdf::KdfParams, crate::hash::UnsupportedHash> {
        use crate::kdf::{Argon2Variant, KdfParams};

        Ok(match self {
            Self::Argon2id { time, memory, cpus, .. } => KdfParams::Argon2 {
                variant: Argon2Variant::Id,
                time: *time,
                memory_kib: *memory,
                parallelism: *cpus,
            },
            Self::Argon2i { time, memory, cpus, .. } => KdfParams::Argon2 {
                variant: Argon2Variant::I,
                time: *time,
                memory_kib: *memory,
                parallelism: *cpus,
            },
            Self::Pbkdf2 { hash, iterations, .. } => KdfParams::Pbkdf2 {
                hash: crate::hash::HashAlgorithm::parse(hash)?,
                iterations: *iterations,
            },
        })
    }

    /// Build a [`KdfField`] from resolved params and a salt, for writing a
    /// freshly formatted/added keyslot.
    pub fn from_params(params: &crate::kdf::KdfParams, salt: Vec<u8>) -> Self {
        use crate::kdf::{Argon2Variant, KdfParams};

        match *params {
            KdfParams::Argon2 {
                variant: Argon2Variant::Id,
                time,
                memory_kib,
                parallelism,
            } => Self::Argon2id {
                salt,
                time,
                memory: memory_kib,
                cpus: parallelism,
            },
            KdfParams::Argon2 {
                variant: Argon2Variant::I,
                time,
                memory_kib,
                parallelism,
            } => Self::Argon2i {
                salt,
                time,
                memory: memory_kib,
                cpus: parallelism,
            },
            KdfParams::Pbkdf2 { hash, iterations } => Self::Pbkdf2 {
                salt,
                hash: hash.name().to_string(),
                iterations,
            },
        }
    }
}

/// The raw-area layout backing a keyslot (spec only supports `"raw"`).
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyslotArea {
    #[serde(rename = "type")]
    pub type_: String,
    pub encryption: String,
    pub key_size: u32,
    #[serde_as(as = "DisplayFromStr")]
    pub offset: u64,
    #[serde_as(as = "DisplayFromStr")]
    pub size: u64,
}

/// Anti-forensic splitter parameters for a keyslot. Only `af.type ==
/// "luks1"` is supported; anything else is rejected at decode time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AfField {
    #[serde(rename = "type")]
    pub type_: String,
    pub stripes: u32,
    pub hash: String,
}

/// A single keyslot: a wrapped copy of the master key protected by one
/// passphrase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Keyslot {
    #[serde(rename = "type")]
    pub type_: String,
    pub key_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    pub area: KeyslotArea,
    pub kdf: KdfField,
    pub af: AfField,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A data segment: where the ciphertext payload lives and how it's keyed.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde_as(as = "DisplayFromStr")]
    pub offset: u64,
    pub size: SegmentSize,
    #[serde_as(as = "DisplayFromStr")]
    pub iv_tweak: u64,
    pub encryption: String,
    pub sector_size: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A master-key digest: lets the engine verify a candidate key recovered
/// from a keyslot without ever storing the key itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Digest {
    #[serde(rename = "type")]
    pub type_: String,
    pub keyslots: Vec<String>,
    pub segments: Vec<String>,
    pub hash: String,
    pub iterations: u32,
    #[serde(with = "base64_field")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_field")]
    pub digest: Vec<u8>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Volume-wide configuration: physical JSON area size and keyslot-area
/// budget.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde_as(as = "DisplayFromStr")]
    pub json_size: u64,
    #[serde_as(as = "DisplayFromStr")]
    pub keyslots_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The full embedded JSON metadata document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub keyslots: BTreeMap<String, Keyslot>,
    pub segments: BTreeMap<String, Segment>,
    pub digests: BTreeMap<String, Digest>,
    pub config: Config,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// JSON area sizes `format` and `read` will accept, per spec.md §3/§9.
/// The backup header copy's offset ([`crate::header::backup_header_offset`])
/// is derived from whichever of these is in play, so none of them is
/// structurally special; they're simply the sizes the reference format
/// enumerates.
pub const ALLOWED_JSON_SIZES: [u64; 6] = [12288, 16384, 32768, 65536, 262144, 4177920];

/// Default JSON area size used by `format` when the caller doesn't request
/// a specific one. spec.md §9 flags 12288 vs. 16384 as an open question
/// and resolves it toward 16384 for broader compatibility with the
/// reference LUKS2 format (see DESIGN.md).
pub const DEFAULT_JSON_SIZE: u64 = 16384;

/// Errors decoding, validating, or re-encoding the metadata document.
#[derive(Debug, Snafu)]
pub enum MetadataError {
    #[snafu(display("metadata JSON area is not valid UTF-8"))]
    Utf8 { source: std::str::Utf8Error },

    #[snafu(display("metadata failed to parse as JSON: {source}"))]
    MalformedJson { source: serde_json::Error },

    #[snafu(display("config.json_size ({declared}) does not match the physical JSON area ({physical})"))]
    JsonSizeMismatch { declared: u64, physical: u64 },

    #[snafu(display("keyslot {id} has unsupported af.type {af_type:?}, only \"luks1\" is supported"))]
    UnsupportedAfType { id: String, af_type: String },

    #[snafu(display("keyslot {id} af geometry (key_size * stripes) overflows or exceeds its area size"))]
    AfGeometryOverflow { id: String },

    #[snafu(display("digest {digest_id} references nonexistent keyslot {keyslot_id}"))]
    DanglingKeyslotReference { digest_id: String, keyslot_id: String },

    #[snafu(display("digest {digest_id} references nonexistent segment {segment_id}"))]
    DanglingSegmentReference { digest_id: String, segment_id: String },

    #[snafu(display("serialized metadata ({actual} bytes) exceeds the json area ({json_size} bytes)"))]
    MetadataTooLarge { actual: usize, json_size: u64 },
}

impl Metadata {
    /// Validate referential integrity and format-level invariants that
    /// `serde` alone cannot express.
    pub fn validate(&self, physical_json_size: u64) -> Result<(), MetadataError> {
        if self.config.json_size != physical_json_size {
            return JsonSizeMismatchSnafu {
                declared: self.config.json_size,
                physical: physical_json_size,
            }
            .fail();
        }

        for (id, keyslot) in &self.keyslots {
            if keyslot.af.type_ != "luks1" {
                return UnsupportedAfTypeSnafu {
                    id: id.clone(),
                    af_type: keyslot.af.type_.clone(),
                }
                .fail();
            }

            // The AF blob this keyslot claims to hold (key_size * stripes
            // bytes) must actually fit the area backing it; both numbers
            // come straight from JSON an attacker could have crafted.
            let fits = (keyslot.key_size as u64)
                .checked_mul(keyslot.af.stripes as u64)
                .is_some_and(|n| n <= keyslot.area.size);
            if !fits {
                return AfGeometryOverflowSnafu { id: id.clone() }.fail();
            }
        }

        for (digest_id, digest) in &self.digests {
            for keyslot_id in &digest.keyslots {
                if !self.keyslots.contains_key(keyslot_id) {
                    return DanglingKeyslotReferenceSnafu {
                        digest_id: digest_id.clone(),
                        keyslot_id: keyslot_id.clone(),
                    }
                    .fail();
                }
            }
            for segment_id in &digest.segments {
                if !self.segments.contains_key(segment_id) {
                    return DanglingSegmentReferenceSnafu {
                        digest_id: digest_id.clone(),
                        segment_id: segment_id.clone(),
                    }
                    .fail();
                }
            }
        }

        Ok(())
    }
}

/// Decode the metadata document from exactly `json_size` bytes of JSON
/// area (trailing NUL padding is consumed and discarded).
pub fn decode(json_area: &[u8], json_size: u64) -> Result<Metadata, MetadataError> {
    let end = json_area.iter().position(|&b| b == 0).unwrap_or(json_area.len());
    let text = std::str::from_utf8(&json_area[..end]).context(Utf8Snafu)?;
    let metadata: Metadata = serde_json::from_str(text).context(MalformedJsonSnafu)?;
    metadata.validate(json_size)?;
    Ok(metadata)
}

/// Serialize `metadata` into exactly `json_size` bytes (JSON followed by
/// NUL padding). Fails with [`MetadataError::MetadataTooLarge`] if the
/// JSON encoding does not fit.
pub fn encode(metadata: &Metadata, json_size: u64) -> Result<Vec<u8>, MetadataError> {
    let json = serde_json::to_vec(metadata).context(MalformedJsonSnafu)?;
    if json.len() as u64 > json_size {
        return MetadataTooLargeSnafu {
            actual: json.len(),
            json_size,
        }
        .fail();
    }
    let mut out = vec![0u8; json_size as usize];
    out[..json.len()].copy_from_slice(&json);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata(json_size: u64) -> Metadata {
        let mut keyslots = BTreeMap::new();
        keyslots.insert(
            "0".to_string(),
            Keyslot {
                type_: "luks2".to_string(),
                key_size: 64,
                priority: None,
                area: KeyslotArea {
                    type_: "raw".to_string(),
                    encryption: "aes-xts-plain64".to_string(),
                    key_size: 64,
                    offset: 0x8000,
                    size: 258048,
                },
                kdf: KdfField::Argon2id {
                    salt: vec![1, 2, 3, 4],
                    time: 4,
                    memory: 1024,
                    cpus: 4,
                },
                af: AfField {
                    type_: "luks1".to_string(),
                    stripes: 4000,
                    hash: "sha256".to_string(),
                },
                extra: Default::default(),
            },
        );

        let mut segments = BTreeMap::new();
        segments.insert(
            "0".to_string(),
            Segment {
                type_: "crypt".to_string(),
                offset: 0x1000000,
                size: SegmentSize::Dynamic,
                iv_tweak: 0,
                encryption: "aes-xts-plain64".to_string(),
                sector_size: 512,
                extra: Default::default(),
            },
        );

        let mut digests = BTreeMap::new();
        digests.insert(
            "0".to_string(),
            Digest {
                type_: "pbkdf2".to_string(),
                keyslots: vec!["0".to_string()],
                segments: vec!["0".to_string()],
                hash: "sha256".to_string(),
                iterations: 100_000,
                salt: vec![5, 6, 7, 8],
                digest: vec![9, 10, 11, 12],
                extra: Default::default(),
            },
        );

        Metadata {
            keyslots,
            segments,
            digests,
            config: Config {
                json_size,
                keyslots_size: 16 * 1024 * 1024 - 0x8000,
                flags: None,
                requirements: None,
                extra: Default::default(),
            },
            tokens: None,
            extra: Default::default(),
        }
    }

    #[test_log::test]
    fn decode_encode_round_trips_with_decimal_strings() {
        let metadata = sample_metadata(12288);
        let encoded = encode(&metadata, 12288).unwrap();
        let decoded = decode(&encoded, 12288).unwrap();
        assert_eq!(decoded, metadata);

        let raw = std::str::from_utf8(&encoded[..encoded.iter().position(|&b| b == 0).unwrap()]).unwrap();
        assert!(raw.contains("\"offset\":\"33554432\"") || raw.contains("\"offset\": \"33554432\""));
    }

    #[test_log::test]
    fn json_size_mismatch_is_rejected() {
        let metadata = sample_metadata(12288);
        let encoded = encode(&metadata, 16384).unwrap();
        assert!(matches!(decode(&encoded, 16384), Err(MetadataError::JsonSizeMismatch { .. })));
    }

    #[test_log::test]
    fn non_luks1_af_type_is_rejected() {
        let mut metadata = sample_metadata(12288);
        metadata.keyslots.get_mut("0").unwrap().af.type_ = "luks2".to_string();
        assert!(matches!(metadata.validate(12288), Err(MetadataError::UnsupportedAfType { .. })));
    }

    #[test_log::test]
    fn af_geometry_overflow_is_rejected() {
        let mut metadata = sample_metadata(12288);
        metadata.keyslots.get_mut("0").unwrap().af.stripes = u32::MAX;
        assert!(matches!(metadata.validate(12288), Err(MetadataError::AfGeometryOverflow { .. })));
    }

    #[test_log::test]
    fn af_geometry_exceeding_area_size_is_rejected() {
        let mut metadata = sample_metadata(12288);
        metadata.keyslots.get_mut("0").unwrap().af.stripes = 5000;
        assert!(matches!(metadata.validate(12288), Err(MetadataError::AfGeometryOverflow { .. })));
    }

    #[test_log::test]
    fn dangling_digest_reference_is_rejected() {
        let mut metadata = sample_metadata(12288);
        metadata.digests.get_mut("0").unwrap().keyslots.push("9".to_string());
        assert!(matches!(metadata.validate(12288), Err(MetadataError::DanglingKeyslotReference { .. })));
    }

    #[test_log::test]
    fn oversized_metadata_is_rejected() {
        let metadata = sample_metadata(1);
        assert!(matches!(encode(&metadata, 1), Err(MetadataError::MetadataTooLarge { .. })));
    }

    #[test_log::test]
    fn unknown_fields_round_trip() {
        let mut metadata = sample_metadata(12288);
        metadata
            .extra
            .insert("future_field".to_string(), serde_json::json!("kept"));
        let encoded = encode(&metadata, 12288).unwrap();
        let decoded = decode(&encoded, 12288).unwrap();
        assert_eq!(decoded.extra.get("future_field").unwrap(), "kept");
    }
}
