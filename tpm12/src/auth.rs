// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! OIAP and OSAP authorization sessions
//!
//! Both session types authorize a command with
//! `HMAC-SHA1(key, inParamDigest || nonceEven || nonceOdd || continue)`.
//! For OIAP the key is the entity's usage auth; for OSAP it is the shared
//! secret derived from the usage auth and both OSAP nonces.

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use tpm2::{ResponseBuffer, TpmTransport};
use tracing::debug;
use zeroize::Zeroizing;

use super::constants::*;
use super::types::Digest20;
use super::wire::*;

type HmacSha1 = Hmac<Sha1>;

fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> Digest20 {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn fresh_nonce() -> Digest20 {
    rand::random()
}

/// SHA1 over the concatenation of `parts`
pub fn sha1_digest(parts: &[&[u8]]) -> Digest20 {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// OSAP shared secret: HMAC(usageAuth, nonceEvenOSAP || nonceOddOSAP)
pub fn osap_shared_secret(
    usage_auth: &Digest20,
    nonce_even_osap: &Digest20,
    nonce_odd_osap: &Digest20,
) -> Zeroizing<Digest20> {
    Zeroizing::new(hmac_sha1(usage_auth, &[nonce_even_osap, nonce_odd_osap]))
}

/// ADIP encryption of a new auth value: `auth XOR SHA1(sharedSecret || nonceEven)`
pub fn encrypt_auth(shared_secret: &Digest20, nonce_even: &Digest20, auth: &Digest20) -> Digest20 {
    let pad = sha1_digest(&[shared_secret, nonce_even]);
    let mut out = *auth;
    for (b, p) in out.iter_mut().zip(pad) {
        *b ^= p;
    }
    out
}

/// An open OIAP or OSAP session
pub struct AuthSession12 {
    pub handle: u32,
    nonce_even: Digest20,
    nonce_odd: Digest20,
    key: Zeroizing<Digest20>,
}

impl std::fmt::Debug for AuthSession12 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession12")
            .field("handle", &format_args!("0x{:08x}", self.handle))
            .finish_non_exhaustive()
    }
}

impl AuthSession12 {
    /// Open an OIAP session for an entity whose usage auth is `usage_auth`
    pub fn start_oiap<T: TpmTransport + ?Sized>(
        device: &mut T,
        usage_auth: &Digest20,
    ) -> Result<Self> {
        let cmd = Tpm12Command::new(tag::RQU_COMMAND, Ordinal::Oiap);
        let response = execute(device, &cmd.finalize())?;
        response.ensure_success().context("TPM_OIAP failed")?;

        let mut buf = ResponseBuffer::new(&response.data);
        let handle = buf.get_u32()?;
        let nonce_even = buf.get_array()?;
        debug!("opened OIAP session 0x{:08x}", handle);
        Ok(Self {
            handle,
            nonce_even,
            nonce_odd: [0; DIGEST_SIZE],
            key: Zeroizing::new(*usage_auth),
        })
    }

    /// Open an OSAP session for `entity_value`
    pub fn start_osap<T: TpmTransport + ?Sized>(
        device: &mut T,
        entity_type: u16,
        entity_value: u32,
        usage_auth: &Digest20,
    ) -> Result<Self> {
        let nonce_odd_osap = fresh_nonce();
        let mut cmd = Tpm12Command::new(tag::RQU_COMMAND, Ordinal::Osap);
        cmd.add_u16(entity_type);
        cmd.add_u32(entity_value);
        cmd.add_bytes(&nonce_odd_osap);
        let response = execute(device, &cmd.finalize())?;
        response.ensure_success().context("TPM_OSAP failed")?;

        let mut buf = ResponseBuffer::new(&response.data);
        let handle = buf.get_u32()?;
        let nonce_even = buf.get_array()?;
        let nonce_even_osap: Digest20 = buf.get_array()?;
        debug!("opened OSAP session 0x{:08x}", handle);
        Ok(Self {
            handle,
            nonce_even,
            nonce_odd: [0; DIGEST_SIZE],
            key: osap_shared_secret(usage_auth, &nonce_even_osap, &nonce_odd_osap),
        })
    }

    /// Even nonce the next command will be authorized against
    pub fn nonce_even(&self) -> &Digest20 {
        &self.nonce_even
    }

    /// OSAP shared secret, or the usage auth for OIAP
    pub fn key(&self) -> &Digest20 {
        &self.key
    }

    /// Build the auth block for a command with `param_digest`.
    ///
    /// The session is consumed by the TPM unless `continue_session` is set.
    pub fn authorize(&mut self, param_digest: &Digest20, continue_session: bool) -> CommandAuth {
        self.nonce_odd = fresh_nonce();
        let auth = hmac_sha1(
            &self.key[..],
            &[
                param_digest,
                &self.nonce_even,
                &self.nonce_odd,
                &[continue_session as u8],
            ],
        );
        CommandAuth {
            handle: self.handle,
            nonce_odd: self.nonce_odd,
            continue_session,
            auth,
        }
    }

    /// Check the TPM's resAuth over `out_param_digest`
    pub fn verify(&mut self, out_param_digest: &Digest20, response: &ResponseAuth) -> Result<()> {
        let expected = hmac_sha1(
            &self.key[..],
            &[
                out_param_digest,
                &response.nonce_even,
                &self.nonce_odd,
                &[response.continue_session as u8],
            ],
        );
        if expected != response.auth {
            bail!("resAuth mismatch on session 0x{:08x}", self.handle);
        }
        self.nonce_even = response.nonce_even;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(key: Digest20) -> AuthSession12 {
        AuthSession12 {
            handle: 0x0200_0000,
            nonce_even: [7; 20],
            nonce_odd: [0; 20],
            key: Zeroizing::new(key),
        }
    }

    #[test]
    fn test_encrypt_auth_is_involution() {
        let shared = [3u8; 20];
        let nonce = [4u8; 20];
        let auth = [5u8; 20];
        let enc = encrypt_auth(&shared, &nonce, &auth);
        assert_ne!(enc, auth);
        assert_eq!(encrypt_auth(&shared, &nonce, &enc), auth);
    }

    #[test]
    fn test_authorize_layout() {
        let mut s = session([9; 20]);
        let digest = [1u8; 20];
        let block = s.authorize(&digest, false);
        assert_eq!(block.handle, 0x0200_0000);
        let expected = hmac_sha1(&[9; 20], &[&digest, &[7; 20], &block.nonce_odd, &[0]]);
        assert_eq!(block.auth, expected);
    }

    #[test]
    fn test_verify_response() {
        let mut s = session([9; 20]);
        let block = s.authorize(&[1; 20], false);
        let out = [2u8; 20];
        let nonce_even = [8u8; 20];
        let good = ResponseAuth {
            nonce_even,
            continue_session: false,
            auth: hmac_sha1(&[9; 20], &[&out, &nonce_even, &block.nonce_odd, &[0]]),
        };
        let mut bad = good.clone();
        bad.auth[0] ^= 1;
        assert!(s.verify(&out, &bad).is_err());
        s.verify(&out, &good).unwrap();
        assert_eq!(s.nonce_even(), &nonce_even);
    }

    #[test]
    fn test_osap_secret_depends_on_nonces() {
        let auth = [1u8; 20];
        let a = osap_shared_secret(&auth, &[2; 20], &[3; 20]);
        let b = osap_shared_secret(&auth, &[2; 20], &[4; 20]);
        assert_ne!(*a, *b);
    }
}
