// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The anti-forensic splitter (AFSplit/AFMerge). Expands a master key into
//! a large, hash-diffused blob before it is written to a keyslot area, so
//! that partial recovery of the on-disk bytes (e.g. from flash wear
//! leveling) cannot recover the key.

use zeroize::Zeroizing;

use crate::hash::HashAlgorithm;

/// Diffuse `buf` in place: split it into `ceil(buf.len() / digest_size)`
/// chunks and replace chunk `i` with `hash(be32(i) || chunk_i)`, truncated
/// to the chunk's own length for a short final chunk.
fn diffuse(buf: &[u8], hash: HashAlgorithm) -> Zeroizing<Vec<u8>> {
    let digest_size = hash.digest_size();
    let mut out = Zeroizing::new(Vec::with_capacity(buf.len()));

    let mut index: u32 = 0;
    let mut offset = 0;
    while offset < buf.len() {
        let end = (offset + digest_size).min(buf.len());
        let chunk = &buf[offset..end];
        let digest = hash.digest_concat(&[&index.to_be_bytes(), chunk]);
        out.extend_from_slice(&digest[..chunk.len()]);
        offset = end;
        index += 1;
    }

    out
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

/// Anti-forensic split of `data` into `stripes * data.len()` bytes.
///
/// `stripes` must be at least 1; `data` must be non-empty. The first
/// `stripes - 1` stripes are independent CSPRNG noise; the diffusion of
/// their XOR is XORed into the final stripe together with `data`, so the
/// output cannot be merged back into `data` without all `stripes` pieces.
pub fn af_split(data: &[u8], stripes: u32, hash: HashAlgorithm) -> Zeroizing<Vec<u8>> {
    let n = data.len();
    let stripes = stripes as usize;
    let mut out = Zeroizing::new(vec![0u8; n * stripes]);

    if stripes > 1 {
        crate::primitives::fill_random(&mut out[..n * (stripes - 1)]);
    }

    let mut d = Zeroizing::new(vec![0u8; n]);
    for i in 0..stripes.saturating_sub(1) {
        let stripe = &out[i * n..(i + 1) * n];
        let mut mixed = Zeroizing::new(vec![0u8; n]);
        mixed.copy_from_slice(stripe);
        xor_into(&mut mixed, &d);
        d = diffuse(&mixed, hash);
    }

    let last = &mut out[(stripes - 1) * n..stripes * n];
    last.copy_from_slice(data);
    xor_into(last, &d);

    out
}

/// Reconstruct the original data from an AF-split blob.
///
/// `data_len` must equal the length originally passed to [`af_split`];
/// `stripes` and `hash` must match the parameters used there.
pub fn af_merge(blob: &[u8], stripes: u32, data_len: usize, hash: HashAlgorithm) -> Zeroizing<Vec<u8>> {
    let n = data_len;
    let stripes = stripes as usize;

    let mut d = Zeroizing::new(vec![0u8; n]);
    for i in 0..stripes.saturating_sub(1) {
        let stripe = &blob[i * n..(i + 1) * n];
        let mut mixed = Zeroizing::new(vec![0u8; n]);
        mixed.copy_from_slice(stripe);
        xor_into(&mut mixed, &d);
        d = diffuse(&mixed, hash);
    }

    let mut data = Zeroizing::new(vec![0u8; n]);
    data.copy_from_slice(&blob[(stripes - 1) * n..stripes * n]);
    xor_into(&mut data, &d);
    data
}
