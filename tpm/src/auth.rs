// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Passphrase to authorization secret derivation

use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Caller passphrase, possibly empty
#[derive(Clone, Default)]
pub struct AuthContext {
    passphrase: Zeroizing<String>,
}

impl AuthContext {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn passphrase(&self) -> &[u8] {
        self.passphrase.as_bytes()
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthContext(..)")
    }
}

/// Fixed-length authorization secret derived from a passphrase.
///
/// The length selects the algorithm: `AuthSecret<20>` is SHA1 (TPM 1.2),
/// `AuthSecret<32>` is SHA256 (TPM 2.0).
#[derive(Clone)]
pub struct AuthSecret<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> Zeroize for AuthSecret<N> {
    fn zeroize(&mut self) {
        self.bytes.zeroize();
    }
}

impl<const N: usize> Drop for AuthSecret<N> {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl<const N: usize> ZeroizeOnDrop for AuthSecret<N> {}

impl AuthSecret<20> {
    pub fn sha1(auth: &AuthContext) -> Self {
        Self {
            bytes: Sha1::digest(auth.passphrase()).into(),
        }
    }
}

impl AuthSecret<32> {
    pub fn sha256(auth: &AuthContext) -> Self {
        Self {
            bytes: Sha256::digest(auth.passphrase()).into(),
        }
    }
}

impl<const N: usize> AuthSecret<N> {
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    /// One-way fingerprint, safe to keep beyond the secret's lifetime
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"srk-auth-fingerprint");
        hasher.update(self.bytes);
        hasher.finalize().into()
    }
}

impl<const N: usize> std::fmt::Debug for AuthSecret<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthSecret<{}>(..)", N)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_passphrase_is_hash_of_empty_string() {
        let empty = AuthContext::empty();
        assert_eq!(
            hex::encode(AuthSecret::sha256(&empty).as_bytes()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hex::encode(AuthSecret::sha1(&empty).as_bytes()),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(
            AuthSecret::sha256(&empty).as_bytes(),
            AuthSecret::sha256(&AuthContext::new("")).as_bytes()
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = AuthSecret::sha256(&AuthContext::new("hunter2"));
        let b = AuthSecret::sha256(&AuthContext::new("hunter2"));
        let c = AuthSecret::sha256(&AuthContext::new("hunter3"));
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(&a.fingerprint(), a.as_bytes());
    }

    #[test]
    fn test_debug_hides_secret() {
        let auth = AuthContext::new("secret");
        assert!(!format!("{:?}", auth).contains("secret"));
        assert_eq!(format!("{:?}", AuthSecret::sha1(&auth)), "AuthSecret<20>(..)");
    }
}
