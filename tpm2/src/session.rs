// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session management
//!
//! Policy sessions are either unbound (no session key, empty HMACs) or bound
//! to an entity whose auth value seeds the session key. Bound sessions carry
//! XOR parameter obfuscation and authenticate every response.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use super::constants::*;
use super::device::*;
use super::kdf;
use super::marshal::*;
use super::types::*;

const NONCE_SIZE: usize = 32;

fn fresh_nonce() -> Vec<u8> {
    rand::random::<[u8; NONCE_SIZE]>().to_vec()
}

/// Auth values are used with trailing zero octets removed
fn trim_auth(auth: &[u8]) -> &[u8] {
    let end = auth.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &auth[..end]
}

/// Authorization session handle
#[derive(Debug)]
pub struct AuthSession {
    pub handle: u32,
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
    symmetric: TpmtSymDef,
    session_key: Zeroizing<Vec<u8>>,
    nonce_caller: Vec<u8>,
    nonce_tpm: Vec<u8>,
}

impl AuthSession {
    fn start_inner<T: TpmTransport + ?Sized>(
        device: &mut T,
        session_type: TpmSe,
        bind: Option<(u32, &[u8])>,
    ) -> Result<Self> {
        let nonce_caller = fresh_nonce();
        let (bind_handle, symmetric) = match bind {
            Some((handle, _)) => (handle, TpmtSymDef::xor(TpmAlgId::Sha256)),
            None => (tpm_rh::NULL, TpmtSymDef::null()),
        };

        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        // tpmKey: no salt
        cmd.add_handle(tpm_rh::NULL);
        cmd.add_handle(bind_handle);
        cmd.add_tpm2b(&nonce_caller);
        // encryptedSalt
        cmd.add_tpm2b_empty();
        cmd.add_u8(session_type as u8);
        cmd.add(&symmetric);
        cmd.add_u16(TpmAlgId::Sha256.to_u16());

        let response = device.execute(&cmd.finalize())?;
        response
            .ensure_success()
            .context("StartAuthSession failed")?;

        let mut buf = response.data_buffer();
        let handle = buf.get_u32()?;
        let nonce_tpm = buf.get_tpm2b()?;

        let session_key = match bind {
            Some((_, bind_auth)) => kdf::kdfa(
                trim_auth(bind_auth),
                kdf::LABEL_SESSION_KEY,
                &nonce_tpm,
                &nonce_caller,
                256,
            ),
            None => Zeroizing::new(Vec::new()),
        };

        debug!(
            "started {:?} session 0x{:08x} (bound: {})",
            session_type,
            handle,
            bind.is_some()
        );
        Ok(Self {
            handle,
            session_type,
            hash_alg: TpmAlgId::Sha256,
            symmetric,
            session_key,
            nonce_caller,
            nonce_tpm,
        })
    }

    /// Start an unbound policy session
    pub fn start_policy<T: TpmTransport + ?Sized>(device: &mut T) -> Result<Self> {
        Self::start_inner(device, TpmSe::Policy, None)
    }

    /// Start a policy session bound to `bind_handle`, whose auth value is
    /// `bind_auth`, with XOR parameter obfuscation enabled
    pub fn start_bound_policy<T: TpmTransport + ?Sized>(
        device: &mut T,
        bind_handle: u32,
        bind_auth: &[u8],
    ) -> Result<Self> {
        Self::start_inner(device, TpmSe::Policy, Some((bind_handle, bind_auth)))
    }

    pub fn is_bound(&self) -> bool {
        !self.session_key.is_empty()
    }

    /// Whether parameters can be obfuscated through this session
    pub fn can_obfuscate(&self) -> bool {
        self.is_bound() && self.symmetric.algorithm == TpmAlgId::Xor
    }

    /// Apply PCR policy to this session.
    ///
    /// An empty `pcr_digest` makes the TPM use the live PCR values.
    pub fn policy_pcr<T: TpmTransport + ?Sized>(
        &self,
        device: &mut T,
        pcr_digest: &[u8],
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::PolicyPcr);
        cmd.add_handle(self.handle);
        cmd.add_tpm2b(pcr_digest);
        cmd.add(pcr_selection);

        let response = device.execute(&cmd.finalize())?;
        response.ensure_success().context("PolicyPCR failed")?;

        Ok(())
    }

    /// Get the current policy digest
    pub fn get_digest<T: TpmTransport + ?Sized>(&self, device: &mut T) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::new(TpmCc::PolicyGetDigest);
        cmd.add_handle(self.handle);

        let response = device.execute(&cmd.finalize())?;
        response
            .ensure_success()
            .context("PolicyGetDigest failed")?;

        let mut buf = response.data_buffer();
        buf.get_tpm2b()
    }

    /// Flush (close) this session
    pub fn flush<T: TpmTransport + ?Sized>(self, device: &mut T) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(self.handle);

        let response = device.execute(&cmd.finalize())?;
        response.ensure_success().context("FlushContext failed")?;

        Ok(())
    }

    /// Roll the caller nonce for the next command that uses this session
    pub fn begin_command(&mut self) {
        self.nonce_caller = fresh_nonce();
    }

    /// Build the authorization entry for a command whose cpHash is `cp_hash`
    pub fn authorize(&self, cp_hash: &[u8], attributes: TpmaSa) -> TpmsAuthCommand {
        let hmac = if self.is_bound() {
            kdf::hmac_sha256(
                &self.session_key,
                &[cp_hash, &self.nonce_caller, &self.nonce_tpm, &[attributes.0]],
            )
        } else {
            Vec::new()
        };
        TpmsAuthCommand {
            session_handle: self.handle,
            nonce: self.nonce_caller.clone(),
            attributes,
            hmac,
        }
    }

    /// Accept the TPM's session entry, checking its HMAC on bound sessions
    pub fn verify_response(&mut self, rp_hash: &[u8], auth: &TpmsAuthResponse) -> Result<()> {
        if self.is_bound()
            && !kdf::verify_hmac_sha256(
                &self.session_key,
                &[rp_hash, &auth.nonce, &self.nonce_caller, &[auth.attributes.0]],
                &auth.hmac,
            )
        {
            bail!("response HMAC mismatch on session 0x{:08x}", self.handle);
        }
        self.nonce_tpm = auth.nonce.clone();
        Ok(())
    }

    /// Mask for an obfuscated command parameter of `len` bytes
    pub fn command_mask(&self, len: usize) -> Result<Zeroizing<Vec<u8>>> {
        if !self.can_obfuscate() {
            bail!("session 0x{:08x} cannot obfuscate parameters", self.handle);
        }
        Ok(kdf::xor_mask(
            &self.session_key,
            &self.nonce_caller,
            &self.nonce_tpm,
            len,
        ))
    }

    /// Mask for an obfuscated response parameter of `len` bytes
    pub fn response_mask(&self, len: usize) -> Result<Zeroizing<Vec<u8>>> {
        if !self.can_obfuscate() {
            bail!("session 0x{:08x} cannot obfuscate parameters", self.handle);
        }
        Ok(kdf::xor_mask(
            &self.session_key,
            &self.nonce_tpm,
            &self.nonce_caller,
            len,
        ))
    }
}

/// cpHash: SHA256(commandCode || names || parameters)
pub fn cp_hash(command_code: TpmCc, names: &[&[u8]], parameters: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(command_code.to_u32().to_be_bytes());
    for name in names {
        hasher.update(name);
    }
    hasher.update(parameters);
    hasher.finalize().to_vec()
}

/// rpHash of a successful response: SHA256(TPM_RC_SUCCESS || commandCode || parameters)
pub fn rp_hash(command_code: TpmCc, parameters: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(0u32.to_be_bytes());
    hasher.update(command_code.to_u32().to_be_bytes());
    hasher.update(parameters);
    hasher.finalize().to_vec()
}

/// Digest of PCR values in selection order, as PolicyPCR expects
pub fn pcr_values_digest<V: AsRef<[u8]>>(values: &[V]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for value in values {
        hasher.update(value.as_ref());
    }
    hasher.finalize().to_vec()
}

/// Extend a policy digest with TPM2_PolicyPCR
pub fn policy_pcr_digest(
    previous: &[u8],
    pcr_selection: &TpmlPcrSelection,
    pcr_digest: &[u8],
) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(previous);
    hasher.update(TpmCc::PolicyPcr.to_u32().to_be_bytes());
    hasher.update(pcr_selection.to_bytes());
    hasher.update(pcr_digest);
    hasher.finalize().to_vec()
}

/// Policy digest of a fresh session after a single PolicyPCR over `values`
pub fn compute_policy_pcr<V: AsRef<[u8]>>(
    pcr_selection: &TpmlPcrSelection,
    values: &[V],
) -> Vec<u8> {
    policy_pcr_digest(
        &[0u8; 32],
        pcr_selection,
        &pcr_values_digest(values),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_auth() {
        assert_eq!(trim_auth(&[1, 2, 0, 0]), &[1u8, 2]);
        assert_eq!(trim_auth(&[0, 0]), &[] as &[u8]);
        assert_eq!(trim_auth(&[0, 3]), &[0u8, 3]);
    }

    #[test]
    fn test_policy_pcr_depends_on_values_and_selection() {
        let sel = TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 2, 4]);
        let zeros = vec![vec![0u8; 32]; 3];
        let a = compute_policy_pcr(&sel, &zeros);
        assert_eq!(a.len(), 32);
        assert_eq!(a, compute_policy_pcr(&sel, &zeros));

        let mut changed = zeros.clone();
        changed[2][0] = 1;
        assert_ne!(a, compute_policy_pcr(&sel, &changed));

        let other = TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 2, 7]);
        assert_ne!(a, compute_policy_pcr(&other, &zeros));
    }

    #[test]
    fn test_policy_pcr_manual_layout() {
        let sel = TpmlPcrSelection::single(TpmAlgId::Sha256, &[1]);
        let value = [0x11u8; 32];
        let mut expected = Sha256::new();
        expected.update([0u8; 32]);
        expected.update([0x00, 0x00, 0x01, 0x7F]);
        expected.update([0, 0, 0, 1, 0x00, 0x0B, 3, 0x02, 0, 0]);
        expected.update(Sha256::digest(value));
        assert_eq!(
            compute_policy_pcr(&sel, &[value]),
            expected.finalize().to_vec()
        );
    }

    #[test]
    fn test_cp_hash_covers_names() {
        let a = cp_hash(TpmCc::Unseal, &[b"name-a"], &[]);
        let b = cp_hash(TpmCc::Unseal, &[b"name-b"], &[]);
        assert_ne!(a, b);
        assert_ne!(rp_hash(TpmCc::Unseal, &[]), rp_hash(TpmCc::Create, &[]));
    }
}
