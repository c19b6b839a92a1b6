// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! A user-space implementation of the LUKS2 on-disk encryption header
//! engine: parsing, formatting, and mutating the two-copy binary+JSON
//! header that guards a LUKS2 volume, and deriving/verifying the master
//! key through a keyslot's KDF, anti-forensic splitter, and AES-XTS
//! wrapping.
//!
//! This crate owns the header engine and the crypto pipeline; it does not
//! map a `dm-crypt` device (see [`activator`]), create filesystems, or
//! parse CLI arguments — those are a caller's job.
//!
//! The six operations below are the facade most callers want; the
//! submodules are public for callers that need finer control (e.g. a
//! provisioning tool that wants to add a keyslot without re-deriving the
//! existing one's KDF).

pub mod activator;
pub mod af;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod hash;
pub mod header;
pub mod kdf;
pub mod metadata;
pub mod primitives;
pub mod wipe;

use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use zeroize::Zeroizing;

pub use engine::{FormatOptions, VolumeInfo};
pub use hash::HashAlgorithm;
pub use kdf::KdfParams;
pub use metadata::{Config, Digest, Keyslot, Metadata, Segment};
pub use wipe::{WipeMode, WipeOptions, WipePattern};

/// Default master-key length, in bytes, for the default cipher
/// (`aes-xts-plain64` with a 256-bit block key needs a 512-bit key).
pub const DEFAULT_MASTER_KEY_LEN: usize = 64;

/// Unified error taxonomy for every operation this crate exposes (spec.md
/// §7). Leaf modules keep their own narrower error enums for internal use;
/// this type wraps them with the device path and operation name that a
/// caller needs to act on a failure.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{operation} failed on {path:?}: invalid kdf parameters"))]
    InvalidKdf {
        operation: &'static str,
        path: PathBuf,
        source: kdf::InvalidKdfParams,
    },

    #[snafu(display("{operation} failed on {path:?}"))]
    Engine {
        operation: &'static str,
        path: PathBuf,
        source: engine::EngineError,
    },

    #[snafu(display("{operation} failed on {path:?}"))]
    Crypto {
        operation: &'static str,
        path: PathBuf,
        source: crypto::CryptoError,
    },

    #[snafu(display("{operation} failed on {path:?}"))]
    Wipe {
        operation: &'static str,
        path: PathBuf,
        source: wipe::WipeError,
    },

    #[snafu(display("{operation} failed on {path:?}"))]
    Activation {
        operation: &'static str,
        path: PathBuf,
        source: activator::ActivationError,
    },
}

impl Error {
    /// The device path the failing operation was acting on.
    pub fn path(&self) -> &Path {
        match self {
            Error::InvalidKdf { path, .. }
            | Error::Engine { path, .. }
            | Error::Crypto { path, .. }
            | Error::Wipe { path, .. }
            | Error::Activation { path, .. } => path,
        }
    }

    /// `true` if this failure means "the passphrase did not unlock any
    /// keyslot" — spec.md §7 requires this be reported uniformly, without
    /// hinting which keyslot was tried first.
    pub fn is_invalid_passphrase(&self) -> bool {
        matches!(
            self,
            Error::Crypto {
                source: crypto::CryptoError::InvalidPassphrase,
                ..
            }
        )
    }
}

/// `Format(opts)` (spec.md §6): lay out a brand-new volume, then protect a
/// freshly generated master key with one keyslot derived from
/// `passphrase` and record its digest. Returns a summary of the volume
/// just created.
pub fn format(path: impl AsRef<Path>, options: &FormatOptions, passphrase: &[u8], kdf: &KdfParams) -> Result<VolumeInfo, Error> {
    let path = path.as_ref().to_path_buf();
    kdf.validate().context(InvalidKdfSnafu {
        operation: "format",
        path: path.clone(),
    })?;

    let mut engine = engine::HeaderEngine::format(&path, options).context(EngineSnafu {
        operation: "format",
        path: path.clone(),
    })?;

    let master_key = primitives::random_bytes(DEFAULT_MASTER_KEY_LEN);
    let digest_hash = HashAlgorithm::Sha256;

    let keyslot_id = crypto::add_keyslot(&mut engine, passphrase, &master_key, kdf, digest_hash, None).context(CryptoSnafu {
        operation: "format",
        path: path.clone(),
    })?;

    let segment_ids: Vec<String> = engine.metadata.segments.keys().cloned().collect();
    let digest = crypto::new_digest(&master_key, digest_hash, vec![keyslot_id], segment_ids);
    engine.metadata.digests.insert("0".to_string(), digest);

    engine.commit().context(EngineSnafu {
        operation: "format",
        path: path.clone(),
    })?;

    Ok(engine.info())
}

/// `Read(device) → VolumeInfo` (spec.md §6): open an existing volume and
/// summarize its metadata without touching any keyslot or passphrase.
pub fn read(path: impl AsRef<Path>) -> Result<VolumeInfo, Error> {
    let path = path.as_ref().to_path_buf();
    let engine = engine::HeaderEngine::read(&path).context(EngineSnafu {
        operation: "read",
        path: path.clone(),
    })?;
    Ok(engine.info())
}

/// `Unlock(device, passphrase) → MasterKey` (spec.md §6): recover the
/// master key by trying `passphrase` against every keyslot. The returned
/// buffer is zeroized on drop; the caller must not let it outlive the
/// handoff to an [`activator::Activator`].
pub fn unlock(path: impl AsRef<Path>, passphrase: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    let path = path.as_ref().to_path_buf();
    let mut engine = engine::HeaderEngine::read(&path).context(EngineSnafu {
        operation: "unlock",
        path: path.clone(),
    })?;
    let (master_key, _keyslot_id, _digest_id) = crypto::unlock(&mut engine, passphrase).context(CryptoSnafu {
        operation: "unlock",
        path: path.clone(),
    })?;
    Ok(master_key)
}

/// `AddKeyslot(device, existing_passphrase, new_passphrase, kdf_opts)`
/// (spec.md §6): unlock with `existing_passphrase`, then wrap the same
/// master key under `new_passphrase` in a fresh keyslot bound into the
/// same digest. Returns the new keyslot's id.
pub fn add_keyslot(path: impl AsRef<Path>, existing_passphrase: &[u8], new_passphrase: &[u8], kdf: &KdfParams) -> Result<String, Error> {
    let path = path.as_ref().to_path_buf();
    kdf.validate().context(InvalidKdfSnafu {
        operation: "add_keyslot",
        path: path.clone(),
    })?;

    let mut engine = engine::HeaderEngine::open_for_mutation(&path).context(EngineSnafu {
        operation: "add_keyslot",
        path: path.clone(),
    })?;

    let (master_key, _unlocked_id, digest_id) = crypto::unlock(&mut engine, existing_passphrase).context(CryptoSnafu {
        operation: "add_keyslot",
        path: path.clone(),
    })?;

    let new_id = crypto::add_keyslot(&mut engine, new_passphrase, &master_key, kdf, HashAlgorithm::Sha256, None).context(CryptoSnafu {
        operation: "add_keyslot",
        path: path.clone(),
    })?;

    if let Some(digest) = engine.metadata.digests.get_mut(&digest_id) {
        digest.keyslots.push(new_id.clone());
    }

    engine.commit().context(EngineSnafu {
        operation: "add_keyslot",
        path: path.clone(),
    })?;

    Ok(new_id)
}

/// `WipeKeyslot(device, id)` (spec.md §6): remove one keyslot. Fails with
/// [`crypto::CryptoError::NoKeyslots`] rather than leave a digest with no
/// way to recover its master key.
pub fn wipe_keyslot(path: impl AsRef<Path>, id: &str) -> Result<(), Error> {
    let path = path.as_ref().to_path_buf();
    let mut engine = engine::HeaderEngine::open_for_mutation(&path).context(EngineSnafu {
        operation: "wipe_keyslot",
        path: path.clone(),
    })?;

    crypto::wipe_keyslot(&mut engine, id).context(CryptoSnafu {
        operation: "wipe_keyslot",
        path: path.clone(),
    })?;

    engine.commit().context(EngineSnafu {
        operation: "wipe_keyslot",
        path: path.clone(),
    })?;

    Ok(())
}

/// `Wipe(opts)` (spec.md §6): destroy a volume's headers, and optionally
/// its full keyslots area, with zeros or CSPRNG bytes. Irreversible.
pub fn wipe(path: impl AsRef<Path>, options: &WipeOptions) -> Result<(), Error> {
    let path = path.as_ref().to_path_buf();
    wipe::wipe(&path, options).context(WipeSnafu {
        operation: "wipe",
        path: path.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::kdf::Argon2Variant;

    fn make_device(size: u64) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; size as usize]).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    fn fast_kdf() -> KdfParams {
        KdfParams::Argon2 {
            variant: Argon2Variant::Id,
            time: 1,
            memory_kib: 64,
            parallelism: 1,
        }
    }

    fn format_opts() -> FormatOptions {
        FormatOptions {
            label: "vault1".to_string(),
            keyslots_size: 4 * 1024 * 1024,
            ..Default::default()
        }
    }

    #[test_log::test]
    fn format_then_unlock_round_trips_the_master_key() {
        let tmp = make_device(32 * 1024 * 1024);
        let info = format(tmp.path(), &format_opts(), b"correct horse battery staple", &fast_kdf()).unwrap();
        assert_eq!(info.label, "vault1");
        assert_eq!(info.sequence_id, 1);
        assert_eq!(info.keyslot_count, 1);
        assert_eq!(info.digest_count, 1);

        let master_key = unlock(tmp.path(), b"correct horse battery staple").unwrap();
        assert_eq!(master_key.len(), DEFAULT_MASTER_KEY_LEN);
    }

    #[test_log::test]
    fn wrong_passphrase_reports_invalid_passphrase_uniformly() {
        let tmp = make_device(32 * 1024 * 1024);
        format(tmp.path(), &format_opts(), b"correct horse battery staple", &fast_kdf()).unwrap();

        let err = unlock(tmp.path(), b"wrong").unwrap_err();
        assert!(err.is_invalid_passphrase());
    }

    #[test_log::test]
    fn add_keyslot_then_both_passphrases_unlock_the_same_key() {
        let tmp = make_device(32 * 1024 * 1024);
        format(tmp.path(), &format_opts(), b"correct horse battery staple", &fast_kdf()).unwrap();

        let new_id = add_keyslot(tmp.path(), b"correct horse battery staple", b"backup-phrase", &fast_kdf()).unwrap();
        assert_eq!(new_id, "1");

        let info = read(tmp.path()).unwrap();
        assert_eq!(info.sequence_id, 2);
        assert_eq!(info.keyslot_count, 2);

        let a = unlock(tmp.path(), b"correct horse battery staple").unwrap();
        let b = unlock(tmp.path(), b"backup-phrase").unwrap();
        assert_eq!(&a[..], &b[..]);
    }

    #[test_log::test]
    fn wipe_keyslot_removes_one_but_refuses_to_empty_a_digest() {
        let tmp = make_device(32 * 1024 * 1024);
        format(tmp.path(), &format_opts(), b"correct horse battery staple", &fast_kdf()).unwrap();
        add_keyslot(tmp.path(), b"correct horse battery staple", b"backup-phrase", &fast_kdf()).unwrap();

        wipe_keyslot(tmp.path(), "0").unwrap();
        let info = read(tmp.path()).unwrap();
        assert_eq!(info.keyslot_count, 1);

        let err = wipe_keyslot(tmp.path(), "1").unwrap_err();
        assert!(matches!(
            err,
            Error::Crypto {
                source: crypto::CryptoError::NoKeyslots { .. },
                ..
            }
        ));
    }

    #[test_log::test]
    fn corrupted_primary_header_recovers_via_backup() {
        let tmp = make_device(32 * 1024 * 1024);
        format(tmp.path(), &format_opts(), b"correct horse battery staple", &fast_kdf()).unwrap();

        {
            let mut device = device::Device::open(tmp.path()).unwrap();
            device.write_at(0, &[0xFFu8; header::HEADER_SIZE]).unwrap();
            device.sync().unwrap();
        }

        let info = read(tmp.path()).unwrap();
        assert_eq!(info.label, "vault1");

        // A subsequent commit (via add_keyslot) rewrites both copies.
        add_keyslot(tmp.path(), b"correct horse battery staple", b"backup-phrase", &fast_kdf()).unwrap();
        let info = read(tmp.path()).unwrap();
        assert_eq!(info.keyslot_count, 2);
    }

    #[test_log::test]
    fn full_wipe_makes_the_volume_unreadable() {
        let tmp = make_device(32 * 1024 * 1024);
        format(tmp.path(), &format_opts(), b"correct horse battery staple", &fast_kdf()).unwrap();

        wipe(
            tmp.path(),
            &WipeOptions {
                mode: WipeMode::Full,
                pattern: WipePattern::Zero,
            },
        )
        .unwrap();

        let err = read(tmp.path()).unwrap_err();
        assert!(matches!(
            err,
            Error::Engine {
                source: engine::EngineError::BothHeadersInvalid,
                ..
            }
        ));
    }
}
