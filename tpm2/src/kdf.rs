// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! KDFa (SP800-108 counter mode with HMAC-SHA256) and XOR parameter obfuscation

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

fn new_mac(key: &[u8]) -> HmacSha256 {
    KeyInit::new_from_slice(key).expect("hmac accepts any key length")
}

/// Label used to derive a bound/salted session key
pub const LABEL_SESSION_KEY: &[u8] = b"ATH";
/// Label used to derive XOR obfuscation masks
pub const LABEL_XOR: &[u8] = b"XOR";

/// TPM2 KDFa over HMAC-SHA256.
///
/// `label` is given without its terminating NUL; the NUL separator is always
/// inserted. The result is truncated to `bits / 8` bytes.
pub fn kdfa(
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Zeroizing<Vec<u8>> {
    let len = (bits as usize).div_ceil(8);
    let mut out = Zeroizing::new(Vec::with_capacity(len + 32));
    let mut counter: u32 = 1;
    while out.len() < len {
        let mut mac = new_mac(key);
        mac.update(&counter.to_be_bytes());
        mac.update(label);
        mac.update(&[0]);
        mac.update(context_u);
        mac.update(context_v);
        mac.update(&bits.to_be_bytes());
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(len);
    if bits % 8 != 0 {
        out[0] &= (1u8 << (bits % 8)) - 1;
    }
    out
}

/// XOR obfuscation mask for a parameter of `len` bytes.
///
/// For command parameters `nonce_newer` is the caller nonce of the command;
/// for response parameters it is the TPM nonce of the response.
pub fn xor_mask(
    session_key: &[u8],
    nonce_newer: &[u8],
    nonce_older: &[u8],
    len: usize,
) -> Zeroizing<Vec<u8>> {
    kdfa(
        session_key,
        LABEL_XOR,
        nonce_newer,
        nonce_older,
        (len * 8) as u32,
    )
}

/// XOR `mask` into `data` in place
pub fn xor_in_place(data: &mut [u8], mask: &[u8]) {
    for (d, m) in data.iter_mut().zip(mask) {
        *d ^= m;
    }
}

/// Compute an HMAC-SHA256 over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = new_mac(key);
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time HMAC-SHA256 verification
pub fn verify_hmac_sha256(key: &[u8], parts: &[&[u8]], expected: &[u8]) -> bool {
    let mut mac = new_mac(key);
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdfa_length_and_determinism() {
        let a = kdfa(b"key", LABEL_XOR, b"u", b"v", 8 * 70);
        let b = kdfa(b"key", LABEL_XOR, b"u", b"v", 8 * 70);
        assert_eq!(a.len(), 70);
        assert_eq!(*a, *b);

        let c = kdfa(b"key", LABEL_XOR, b"v", b"u", 8 * 70);
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_kdfa_binds_output_length() {
        // the bit count is part of every block's input
        let short = kdfa(b"key", LABEL_SESSION_KEY, b"n1", b"n2", 128);
        let long = kdfa(b"key", LABEL_SESSION_KEY, b"n1", b"n2", 256);
        assert_eq!(short.len(), 16);
        assert_eq!(long.len(), 32);
        assert_ne!(&short[..], &long[..16]);
    }

    #[test]
    fn test_xor_mask_cancels() {
        let mask = xor_mask(b"session", b"newer", b"older", 13);
        let mut data = b"disk-key-0001".to_vec();
        xor_in_place(&mut data, &mask);
        assert_ne!(data, b"disk-key-0001");
        xor_in_place(&mut data, &mask);
        assert_eq!(data, b"disk-key-0001");
    }

    #[test]
    fn test_hmac_verify() {
        let tag = hmac_sha256(b"k", &[b"a", b"bc"]);
        assert!(verify_hmac_sha256(b"k", &[b"ab", b"c"], &tag));
        assert!(!verify_hmac_sha256(b"other", &[b"abc"], &tag));
    }
}
