// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Named hash registry. Keyslot KDFs, the AF splitter, and digests all
//! refer to a hash algorithm by its JSON-facing name ("sha256", "sha512");
//! this module is the one place that name gets turned into an actual
//! digest implementation.

use sha2::{Digest as _, Sha256, Sha512};
use snafu::Snafu;

/// A hash algorithm usable for header checksums, AF diffusion, and KDFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

/// The checksum/KDF/AF hash name did not match a supported algorithm.
#[derive(Debug, Snafu)]
#[snafu(display("unsupported hash algorithm: {name}"))]
pub struct UnsupportedHash {
    pub name: String,
}

impl HashAlgorithm {
    /// Parse a JSON/header hash name ("sha256", "sha512").
    pub fn parse(name: &str) -> Result<Self, UnsupportedHash> {
        match name {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => UnsupportedHashSnafu { name: other.to_string() }.fail(),
        }
    }

    /// The JSON/header name for this algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Output length of this digest in bytes.
    pub fn digest_size(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Hash `data` in one shot.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Hash the concatenation of several byte slices in one shot, without an
    /// intermediate allocation for the joined buffer.
    pub fn digest_concat(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
            Self::Sha512 => {
                let mut hasher = Sha512::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_vec()
            }
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn parses_supported_names() {
        assert_eq!(HashAlgorithm::parse("sha256").unwrap(), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::parse("sha512").unwrap(), HashAlgorithm::Sha512);
    }

    #[test_log::test]
    fn rejects_unknown_name() {
        assert!(HashAlgorithm::parse("md5").is_err());
    }

    #[test_log::test]
    fn digest_sizes_match_algorithm() {
        assert_eq!(HashAlgorithm::Sha256.digest(b"x").len(), 32);
        assert_eq!(HashAlgorithm::Sha512.digest(b"x").len(), 64);
    }

    #[test_log::test]
    fn digest_concat_matches_digest_of_joined_buffer() {
        let mut joined = Vec::new();
        joined.extend_from_slice(b"hello ");
        joined.extend_from_slice(b"world");
        assert_eq!(
            HashAlgorithm::Sha256.digest_concat(&[b"hello ", b"world"]),
            HashAlgorithm::Sha256.digest(&joined)
        );
    }
}
