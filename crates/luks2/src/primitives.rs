// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Low-level building blocks shared by every other module: constant-time
//! comparison, secret zeroization, a CSPRNG fill helper, base64, and the
//! alignment helpers from the `disks` crate.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

pub use disks::{align_down, align_up, is_aligned};

/// Compare two byte slices in constant time. Returns `false` immediately
/// (no timing guarantee) if the lengths differ, since LUKS2 digests and
/// MACs are always compared at a known, fixed length.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Fill `buf` with cryptographically secure random bytes.
pub fn fill_random(buf: &mut [u8]) {
    rand::rngs::OsRng.fill_bytes(buf);
}

/// Allocate `len` cryptographically secure random bytes, zeroized on drop.
pub fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut buf = Zeroizing::new(vec![0u8; len]);
    fill_random(&mut buf);
    buf
}

/// Decode a base64 string as used throughout LUKS2 JSON metadata (KDF
/// salts, AF stripe data, digest salts/values).
pub fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(s)
}

/// Encode bytes as base64 for embedding in LUKS2 JSON metadata.
pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// `true` if `value` is a power of two (used to validate sector sizes).
pub fn is_power_of_two(value: u64) -> bool {
    value != 0 && value & (value - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn ct_eq_matches_normal_eq_on_equal_input() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
    }

    #[test_log::test]
    fn ct_eq_rejects_different_content() {
        assert!(!constant_time_eq(b"abcdef", b"abcxef"));
    }

    #[test_log::test]
    fn ct_eq_rejects_different_length() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test_log::test]
    fn power_of_two_checks_sector_sizes() {
        assert!(is_power_of_two(512));
        assert!(is_power_of_two(4096));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(513));
    }

    #[test_log::test]
    fn base64_round_trips() {
        let data = b"some salt bytes";
        let encoded = base64_encode(data);
        assert_eq!(base64_decode(&encoded).unwrap(), data);
    }
}
