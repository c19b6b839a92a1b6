// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Key-derivation-function registry. Every keyslot names its KDF and
//! parameters in its JSON metadata; this module is the uniform
//! `derive(passphrase, salt, params) -> key` contract spec.md §2 asks for,
//! backing both Argon2id/Argon2i and PBKDF2.

use argon2::{Algorithm, Argon2, Params};
use pbkdf2::pbkdf2_hmac;
use sha2::{Sha256, Sha512};
use snafu::Snafu;
use zeroize::Zeroizing;

use crate::hash::HashAlgorithm;

/// Minimum Argon2 memory cost, in KiB, the validator will accept.
pub const MIN_ARGON2_MEMORY_KIB: u32 = 64;

/// Which Argon2 variant a keyslot uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Variant {
    Id,
    I,
}

/// KDF algorithm and parameters for a single keyslot, as recorded in its
/// `kdf` JSON object.
#[derive(Debug, Clone, PartialEq)]
pub enum KdfParams {
    Argon2 {
        variant: Argon2Variant,
        time: u32,
        memory_kib: u32,
        parallelism: u32,
    },
    Pbkdf2 {
        hash: HashAlgorithm,
        iterations: u32,
    },
}

impl Default for KdfParams {
    /// argon2id, time=4, memory=1 MiB, parallelism=4 — spec.md §6 defaults.
    fn default() -> Self {
        Self::Argon2 {
            variant: Argon2Variant::Id,
            time: 4,
            memory_kib: 1024,
            parallelism: 4,
        }
    }
}

/// A KDF's parameters failed validation.
#[derive(Debug, Snafu)]
pub enum InvalidKdfParams {
    #[snafu(display("argon2 memory cost {memory_kib} KiB is below the minimum of {MIN_ARGON2_MEMORY_KIB} KiB"))]
    ArgonMemoryTooLow { memory_kib: u32 },

    #[snafu(display("argon2 time cost must be at least 1, got {time}"))]
    ArgonTimeTooLow { time: u32 },

    #[snafu(display("argon2 parallelism must be at least 1, got {parallelism}"))]
    ArgonParallelismTooLow { parallelism: u32 },

    #[snafu(display("pbkdf2 iteration count must be at least 1, got {iterations}"))]
    Pbkdf2IterationsTooLow { iterations: u32 },
}

/// The JSON `kdf.type` field did not name a supported algorithm.
#[derive(Debug, Snafu)]
#[snafu(display("unsupported kdf type: {name}"))]
pub struct UnsupportedKdf {
    pub name: String,
}

impl KdfParams {
    /// JSON `kdf.type` name for this algorithm.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Argon2 { variant: Argon2Variant::Id, .. } => "argon2id",
            Self::Argon2 { variant: Argon2Variant::I, .. } => "argon2i",
            Self::Pbkdf2 { .. } => "pbkdf2",
        }
    }

    /// Reject parameters outside the bounds spec.md §5 requires before any
    /// derivation is attempted (Argon2 memory < 64 KiB or time < 1; PBKDF2
    /// iterations < 1).
    pub fn validate(&self) -> Result<(), InvalidKdfParams> {
        match *self {
            Self::Argon2 {
                time,
                memory_kib,
                parallelism,
                ..
            } => {
                if memory_kib < MIN_ARGON2_MEMORY_KIB {
                    return ArgonMemoryTooLowSnafu { memory_kib }.fail();
                }
                if time < 1 {
                    return ArgonTimeTooLowSnafu { time }.fail();
                }
                if parallelism < 1 {
                    return ArgonParallelismTooLowSnafu { parallelism }.fail();
                }
                Ok(())
            }
            Self::Pbkdf2 { iterations, .. } => {
                if iterations < 1 {
                    return Pbkdf2IterationsTooLowSnafu { iterations }.fail();
                }
                Ok(())
            }
        }
    }

    /// Derive `out_len` bytes of key material from `passphrase` and `salt`.
    ///
    /// Callers must have validated `self` with [`KdfParams::validate`]
    /// first; this never silently clamps parameters.
    pub fn derive(&self, passphrase: &[u8], salt: &[u8], out_len: usize) -> Zeroizing<Vec<u8>> {
        match *self {
            Self::Argon2 {
                variant,
                time,
                memory_kib,
                parallelism,
            } => {
                let algorithm = match variant {
                    Argon2Variant::Id => Algorithm::Argon2id,
                    Argon2Variant::I => Algorithm::Argon2i,
                };
                let params = Params::new(memory_kib, time, parallelism, Some(out_len))
                    .expect("validated kdf params are accepted by argon2::Params");
                let argon2 = Argon2::new(algorithm, argon2::Version::V0x13, params);
                let mut out = Zeroizing::new(vec![0u8; out_len]);
                argon2
                    .hash_password_into(passphrase, salt, &mut out)
                    .expect("validated kdf params succeed");
                out
            }
            Self::Pbkdf2 { hash, iterations } => pbkdf2_derive(hash, passphrase, salt, iterations, out_len),
        }
    }
}

/// Raw PBKDF2-HMAC-`hash` derivation, shared by [`KdfParams::Pbkdf2`] and
/// master-key digest verification (spec.md §4.4 step 7), which is always
/// PBKDF2 regardless of which KDF protects the keyslot.
pub fn pbkdf2_derive(hash: HashAlgorithm, input: &[u8], salt: &[u8], iterations: u32, out_len: usize) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; out_len]);
    match hash {
        HashAlgorithm::Sha256 => pbkdf2_hmac::<Sha256>(input, salt, iterations, &mut out),
        HashAlgorithm::Sha512 => pbkdf2_hmac::<Sha512>(input, salt, iterations, &mut out),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn argon2id_default_is_deterministic_for_same_salt() {
        let params = KdfParams::default();
        params.validate().unwrap();
        let a = params.derive(b"correct horse battery staple", b"0123456789abcdef", 64);
        let b = params.derive(b"correct horse battery staple", b"0123456789abcdef", 64);
        assert_eq!(&a[..], &b[..]);
    }

    #[test_log::test]
    fn different_passphrase_yields_different_key() {
        let params = KdfParams::default();
        let a = params.derive(b"correct horse battery staple", b"0123456789abcdef", 32);
        let b = params.derive(b"wrong", b"0123456789abcdef", 32);
        assert_ne!(&a[..], &b[..]);
    }

    #[test_log::test]
    fn rejects_low_argon2_memory() {
        let params = KdfParams::Argon2 {
            variant: Argon2Variant::Id,
            time: 4,
            memory_kib: 8,
            parallelism: 4,
        };
        assert!(params.validate().is_err());
    }

    #[test_log::test]
    fn rejects_zero_pbkdf2_iterations() {
        let params = KdfParams::Pbkdf2 {
            hash: HashAlgorithm::Sha256,
            iterations: 0,
        };
        assert!(params.validate().is_err());
    }

    #[test_log::test]
    fn pbkdf2_derive_is_deterministic() {
        let a = pbkdf2_derive(HashAlgorithm::Sha256, b"mk-bytes", b"salt-bytes", 1000, 32);
        let b = pbkdf2_derive(HashAlgorithm::Sha256, b"mk-bytes", b"salt-bytes", 1000, 32);
        assert_eq!(&a[..], &b[..]);
    }
}
