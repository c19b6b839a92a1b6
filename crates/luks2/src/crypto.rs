// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The passphrase <-> master-key pipeline: deriving a key-encryption key
//! from a passphrase, AES-XTS wrapping/unwrapping the anti-forensic blob
//! that protects the master key in a keyslot area, and verifying a
//! recovered master key against its digest without ever persisting it.

use aes::{Aes128, Aes256};
use log::{debug, info, warn};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use xts_mode::{get_tweak_default, Xts128};
use zeroize::Zeroizing;

use crate::af::{af_merge, af_split};
use crate::device::DeviceError;
use crate::engine::HeaderEngine;
use crate::hash::{HashAlgorithm, UnsupportedHash};
use crate::kdf::{pbkdf2_derive, InvalidKdfParams, KdfParams};
use crate::metadata::{AfField, KdfField, Keyslot, KeyslotArea};
use crate::primitives::{constant_time_eq, fill_random, random_bytes};

const KDF_SALT_LEN: usize = 32;
const DIGEST_SALT_LEN: usize = 32;
const KEYSLOT_AREA_SECTOR_SIZE: u64 = 512;
const DEFAULT_AF_STRIPES: u32 = 4000;

/// Shortest passphrase this crate will wrap in a new keyslot (spec.md §8).
pub const MIN_PASSPHRASE_LEN: usize = 8;
/// Longest passphrase this crate will wrap in a new keyslot, matching the
/// reference implementation's own ceiling on passphrase material.
pub const MAX_PASSPHRASE_LEN: usize = 512;

fn validate_passphrase_len(passphrase: &[u8]) -> Result<(), CryptoError> {
    ensure!(
        passphrase.len() >= MIN_PASSPHRASE_LEN && passphrase.len() <= MAX_PASSPHRASE_LEN,
        InvalidPassphraseLengthSnafu { len: passphrase.len() }
    );
    Ok(())
}

/// Errors unlocking, adding, or wiping a keyslot, or verifying a master
/// key against a digest.
#[derive(Debug, Snafu)]
pub enum CryptoError {
    #[snafu(display("no keyslot unlocked with the given passphrase"))]
    InvalidPassphrase,

    #[snafu(display("passphrase length {len} is outside the accepted range [{MIN_PASSPHRASE_LEN}, {MAX_PASSPHRASE_LEN}]"))]
    InvalidPassphraseLength { len: usize },

    #[snafu(display("keyslot {id} does not exist"))]
    KeyslotNotFound { id: String },

    #[snafu(display("wiping keyslot {id} would leave digest {digest_id} with no keyslots"))]
    NoKeyslots { id: String, digest_id: String },

    #[snafu(display("keyslots area ({available} bytes) has no room for a {needed}-byte keyslot"))]
    KeyslotAreaOverflow { available: u64, needed: u64 },

    #[snafu(display("keyslot {id} af geometry (key_size * stripes) overflows or exceeds its area size"))]
    AfGeometryOverflow { id: String },

    #[snafu(display("unsupported encryption spec: {name}"))]
    UnsupportedCipher { name: String },

    #[snafu(display("invalid kdf parameters"))]
    Kdf { source: InvalidKdfParams },

    #[snafu(display("unsupported hash"))]
    Hash { source: UnsupportedHash },

    #[snafu(display("device I/O failed"))]
    Device { source: DeviceError },
}

enum XtsCipher {
    Aes128(Xts128<Aes128>),
    Aes256(Xts128<Aes256>),
}

/// Build an AES-XTS cipher from a key twice the width of one AES key (the
/// first half keys the data cipher, the second half the tweak cipher),
/// per the `aes-xts-plain64` convention.
fn xts_cipher(key: &[u8]) -> Result<XtsCipher, CryptoError> {
    use aes::cipher::KeyInit;

    let half = key.len() / 2;
    let (data_key, tweak_key) = key.split_at(half);
    match half {
        16 => Ok(XtsCipher::Aes128(Xts128::new(
            Aes128::new_from_slice(data_key).expect("16-byte key"),
            Aes128::new_from_slice(tweak_key).expect("16-byte key"),
        ))),
        32 => Ok(XtsCipher::Aes256(Xts128::new(
            Aes256::new_from_slice(data_key).expect("32-byte key"),
            Aes256::new_from_slice(tweak_key).expect("32-byte key"),
        ))),
        _ => UnsupportedCipherSnafu {
            name: format!("aes-xts-plain64 with {}-byte key", key.len()),
        }
        .fail(),
    }
}

fn xts_transform(key: &[u8], buf: &mut [u8], sector_size: u64, starting_sector: u128, encrypt: bool) -> Result<(), CryptoError> {
    let cipher = xts_cipher(key)?;
    for (i, sector) in buf.chunks_mut(sector_size as usize).enumerate() {
        let tweak = get_tweak_default(starting_sector + i as u128);
        match &cipher {
            XtsCipher::Aes128(c) => {
                if encrypt {
                    c.encrypt_sector(sector, tweak)
                } else {
                    c.decrypt_sector(sector, tweak)
                }
            }
            XtsCipher::Aes256(c) => {
                if encrypt {
                    c.encrypt_sector(sector, tweak)
                } else {
                    c.decrypt_sector(sector, tweak)
                }
            }
        }
    }
    Ok(())
}

fn validate_encryption_spec(spec: &str) -> Result<(), CryptoError> {
    ensure!(
        spec == "aes-xts-plain64",
        UnsupportedCipherSnafu { name: spec.to_string() }
    );
    Ok(())
}

/// Allocate the lowest unused numeric keyslot id ("0", "1", ...).
fn next_keyslot_id(engine: &HeaderEngine) -> String {
    let mut n = 0u32;
    loop {
        let candidate = n.to_string();
        if !engine.metadata.keyslots.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Derive the PBKDF2 digest used to verify a recovered master key without
/// ever storing the key itself (spec.md §4.4 step 7 — always PBKDF2
/// regardless of which KDF protects the keyslot it came from).
pub fn compute_master_key_digest(hash: HashAlgorithm, master_key: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    pbkdf2_derive(hash, master_key, salt, iterations, hash.digest_size()).to_vec()
}

/// Default PBKDF2 iteration count for a freshly created digest (spec.md
/// §4.4 step 7 / §6 defaults).
pub const DEFAULT_DIGEST_ITERATIONS: u32 = 100_000;

/// Build a fresh digest binding `master_key` to the given keyslots and
/// segments, with a new random salt.
pub fn new_digest(master_key: &[u8], hash: HashAlgorithm, keyslot_ids: Vec<String>, segment_ids: Vec<String>) -> crate::metadata::Digest {
    let salt = random_bytes(DIGEST_SALT_LEN);
    let digest = compute_master_key_digest(hash, master_key, &salt, DEFAULT_DIGEST_ITERATIONS);
    crate::metadata::Digest {
        type_: "pbkdf2".to_string(),
        keyslots: keyslot_ids,
        segments: segment_ids,
        hash: hash.name().to_string(),
        iterations: DEFAULT_DIGEST_ITERATIONS,
        salt: salt.to_vec(),
        digest,
        extra: Default::default(),
    }
}

/// Write a brand-new keyslot protecting `master_key` under `passphrase`,
/// allocating its area from the volume's keyslots budget. Returns the new
/// keyslot's id.
#[allow(clippy::too_many_arguments)]
pub fn add_keyslot(
    engine: &mut HeaderEngine,
    passphrase: &[u8],
    master_key: &[u8],
    kdf: &KdfParams,
    af_hash: HashAlgorithm,
    priority: Option<i32>,
) -> Result<String, CryptoError> {
    kdf.validate().context(KdfSnafu)?;
    validate_passphrase_len(passphrase)?;

    let stripes = DEFAULT_AF_STRIPES;
    let key_size = master_key.len() as u32;

    let af_blob = af_split(master_key, stripes, af_hash);
    let area_size = crate::primitives::align_up(af_blob.len() as u64, KEYSLOT_AREA_SECTOR_SIZE);

    let keyslots_base = engine.keyslots_area_offset();
    let keyslots_size = engine.metadata.config.keyslots_size;
    // Allocate past the highest extent any existing keyslot area reaches,
    // not by summing areas' sizes: a prior `wipe_keyslot` can leave a hole
    // below that extent, and summing would place a new area on top of one
    // still in use.
    let next_free_offset = engine
        .metadata
        .keyslots
        .values()
        .map(|k| k.area.offset + k.area.size)
        .max()
        .unwrap_or(keyslots_base);
    let used = next_free_offset - keyslots_base;
    if used + area_size > keyslots_size {
        return KeyslotAreaOverflowSnafu {
            available: keyslots_size - used,
            needed: area_size,
        }
        .fail();
    }

    let salt = random_bytes(KDF_SALT_LEN);
    let area_key = kdf.derive(passphrase, &salt, master_key.len());

    let mut ciphertext = vec![0u8; area_size as usize];
    ciphertext[..af_blob.len()].copy_from_slice(&af_blob);
    if area_size as usize > af_blob.len() {
        fill_random(&mut ciphertext[af_blob.len()..]);
    }

    let offset = next_free_offset;
    let starting_sector = offset / KEYSLOT_AREA_SECTOR_SIZE;
    xts_transform(&area_key, &mut ciphertext, KEYSLOT_AREA_SECTOR_SIZE, starting_sector as u128, true)?;

    engine.device_mut().write_at(offset, &ciphertext).context(DeviceSnafu)?;

    let id = next_keyslot_id(engine);
    let keyslot = Keyslot {
        type_: "luks2".to_string(),
        key_size,
        priority,
        area: KeyslotArea {
            type_: "raw".to_string(),
            encryption: "aes-xts-plain64".to_string(),
            key_size,
            offset,
            size: area_size,
        },
        kdf: KdfField::from_params(kdf, salt.to_vec()),
        af: AfField {
            type_: "luks1".to_string(),
            stripes,
            hash: af_hash.name().to_string(),
        },
        extra: Default::default(),
    };

    engine.metadata.keyslots.insert(id.clone(), keyslot);
    info!("added keyslot {id} ({} bytes)", area_size);
    Ok(id)
}

/// Remove a keyslot (and its membership in every digest that references
/// it). Refuses to leave any digest with zero remaining keyslots, since
/// that would make the master key it guards permanently unrecoverable.
pub fn wipe_keyslot(engine: &mut HeaderEngine, id: &str) -> Result<(), CryptoError> {
    let keyslot = engine
        .metadata
        .keyslots
        .get(id)
        .cloned()
        .context(KeyslotNotFoundSnafu { id: id.to_string() })?;

    for (digest_id, digest) in &engine.metadata.digests {
        if digest.keyslots.iter().any(|k| k == id) {
            let remaining = digest.keyslots.iter().filter(|k| k.as_str() != id).count();
            if remaining == 0 {
                return NoKeyslotsSnafu {
                    id: id.to_string(),
                    digest_id: digest_id.clone(),
                }
                .fail();
            }
        }
    }

    let mut wipe_buf = vec![0u8; keyslot.area.size as usize];
    fill_random(&mut wipe_buf);
    engine
        .device_mut()
        .write_at(keyslot.area.offset, &wipe_buf)
        .context(DeviceSnafu)?;

    engine.metadata.keyslots.remove(id);
    for digest in engine.metadata.digests.values_mut() {
        digest.keyslots.retain(|k| k != id);
    }

    warn!("wiped keyslot {id}");
    Ok(())
}

/// Recover the master key by trying `passphrase` against every keyslot,
/// highest `priority` first, verifying each candidate against the digest
/// that references it. Returns the master key, the id of the keyslot
/// that unlocked it, and the id of the digest that verified it (callers
/// adding an alternate keyslot for the same key bind the new keyslot id
/// into this digest).
pub fn unlock(engine: &mut HeaderEngine, passphrase: &[u8]) -> Result<(Zeroizing<Vec<u8>>, String, String), CryptoError> {
    let mut ids: Vec<String> = engine.metadata.keyslots.keys().cloned().collect();
    ids.sort_by_key(|id| std::cmp::Reverse(engine.metadata.keyslots[id].priority.unwrap_or(0)));

    for id in &ids {
        let keyslot = &engine.metadata.keyslots[id];
        validate_encryption_spec(&keyslot.area.encryption)?;

        let params = keyslot.kdf.to_params().context(HashSnafu)?;
        let area_key = params.derive(passphrase, keyslot.kdf.salt(), keyslot.key_size as usize);

        let mut ciphertext = vec![0u8; keyslot.area.size as usize];
        engine
            .device
            .read_at(keyslot.area.offset, &mut ciphertext)
            .context(DeviceSnafu)?;
        let starting_sector = keyslot.area.offset / KEYSLOT_AREA_SECTOR_SIZE;
        xts_transform(&area_key, &mut ciphertext, KEYSLOT_AREA_SECTOR_SIZE, starting_sector as u128, false)?;

        let af_hash = HashAlgorithm::parse(&keyslot.af.hash).context(HashSnafu)?;
        // key_size/stripes come straight from (attacker-controllable)
        // header JSON; guard the product before trusting it as a slice
        // bound instead of letting a crafted header panic here.
        let af_blob_len = (keyslot.key_size as u64)
            .checked_mul(keyslot.af.stripes as u64)
            .filter(|&n| n <= ciphertext.len() as u64)
            .context(AfGeometryOverflowSnafu { id: id.clone() })?;
        let candidate = af_merge(
            &ciphertext[..af_blob_len as usize],
            keyslot.af.stripes,
            keyslot.key_size as usize,
            af_hash,
        );

        for (digest_id, digest) in &engine.metadata.digests {
            if !digest.keyslots.iter().any(|k| k == id) {
                continue;
            }
            let hash = HashAlgorithm::parse(&digest.hash).context(HashSnafu)?;
            let computed = compute_master_key_digest(hash, &candidate, &digest.salt, digest.iterations);
            if constant_time_eq(&computed, &digest.digest) {
                debug!("unlocked with keyslot {id}");
                return Ok((candidate, id.clone(), digest_id.clone()));
            }
        }
    }

    InvalidPassphraseSnafu.fail()
}
