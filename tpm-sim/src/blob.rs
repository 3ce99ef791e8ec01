// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! AES-256-GCM protection of sealed blobs
//!
//! Layout: `nonce (12) || ciphertext || tag (16)`. The additional data binds a
//! blob to the public information it travels with.

use anyhow::{anyhow, bail, Result};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use zeroize::{Zeroize, Zeroizing};

pub struct BlobKey {
    key: LessSafeKey,
}

impl BlobKey {
    pub fn generate() -> Result<Self> {
        let mut raw = Zeroizing::new([0u8; 32]);
        rand::Rng::fill(&mut rand::thread_rng(), &mut raw[..]);
        let unbound = UnboundKey::new(&AES_256_GCM, &raw[..])
            .map_err(|_| anyhow!("failed to create AES-256-GCM key"))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let mut in_out = plaintext.to_vec();
        if self
            .key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(aad),
                &mut in_out,
            )
            .is_err()
        {
            in_out.zeroize();
            bail!("AES-256-GCM encryption failed");
        }
        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    pub fn open(&self, aad: &[u8], blob: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if blob.len() < NONCE_LEN + aead::MAX_TAG_LEN {
            bail!("sealed blob too short");
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| anyhow!("bad nonce"))?;
        let mut in_out = Zeroizing::new(sealed.to_vec());
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut in_out[..])
            .map_err(|_| anyhow!("sealed blob failed authentication"))?;
        Ok(Zeroizing::new(plaintext.to_vec()))
    }
}
