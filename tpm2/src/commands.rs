// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command implementations
//!
//! This module provides high-level TPM operations over any [`TpmTransport`].

use anyhow::{bail, Context, Result};
use tracing::debug;
use zeroize::Zeroizing;

use super::constants::*;
use super::device::*;
use super::kdf::xor_in_place;
use super::marshal::*;
use super::session::*;
use super::types::*;

/// A transient object loaded into the TPM
#[derive(Debug, Clone)]
pub struct LoadedObject {
    pub handle: u32,
    pub name: Vec<u8>,
}

/// Result of `TPM2_ReadPublic`
#[derive(Debug, Clone)]
pub struct ReadPublicOut {
    pub public: TpmtPublic,
    pub name: Vec<u8>,
}

/// Sealed data as returned by an obfuscated `TPM2_Unseal`.
///
/// Holds the ciphertext and the session mask separately; the two are only
/// ever combined with another mask, never with each other.
pub struct ObfuscatedSecret {
    ciphertext: Zeroizing<Vec<u8>>,
    mask: Zeroizing<Vec<u8>>,
}

impl ObfuscatedSecret {
    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

/// Public and private parts of a newly created object
#[derive(Debug, Clone)]
pub struct CreatedObject {
    /// Marshalled TPMT_PUBLIC
    pub public: Vec<u8>,
    /// TPM2B_PRIVATE contents
    pub private: Vec<u8>,
}

/// Pure Rust TPM context
pub struct TpmContext<T: TpmTransport = TpmDevice> {
    device: T,
}

impl TpmContext<TpmDevice> {
    /// Create a new TPM context with the given device path
    pub fn new(tcti_path: Option<&str>) -> Result<Self> {
        let device = match tcti_path {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };

        Ok(Self { device })
    }

    pub fn device_path(&self) -> &str {
        self.device.path()
    }
}

impl<T: TpmTransport> TpmContext<T> {
    /// Wrap an already open channel
    pub fn from_transport(device: T) -> Self {
        Self { device }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.device
    }

    pub fn into_transport(self) -> T {
        self.device
    }

    // ==================== Capabilities ====================

    /// Read a single TPM_PT property
    pub fn get_tpm_property(&mut self, property: u32) -> Result<u32> {
        let mut cmd = TpmCommand::new(TpmCc::GetCapability);
        cmd.add_u32(TpmCap::TpmProperties as u32);
        cmd.add_u32(property);
        cmd.add_u32(1);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("GetCapability failed")?;

        let mut buf = response.data_buffer();
        let _more_data = buf.get_u8()?;
        let capability = buf.get_u32()?;
        if capability != TpmCap::TpmProperties as u32 {
            bail!("unexpected capability in response: 0x{:08x}", capability);
        }
        let count = buf.get_u32()?;
        for _ in 0..count {
            let tag = buf.get_u32()?;
            let value = buf.get_u32()?;
            if tag == property {
                return Ok(value);
            }
        }
        bail!("property 0x{:08x} not reported", property)
    }

    /// `TPM_PT_FAMILY_INDICATOR`, [`TPM2_FAMILY_2_0`] on a TPM 2.0 part
    pub fn family_indicator(&mut self) -> Result<u32> {
        self.get_tpm_property(tpm_pt::FAMILY_INDICATOR)
    }

    // ==================== PCR Operations ====================

    /// Read PCR values for the given selection, in ascending index order.
    ///
    /// A TPM returns at most eight digests per call, so this loops until the
    /// whole selection has been read.
    pub fn pcr_read(&mut self, pcr_selection: &TpmlPcrSelection) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut result = Vec::new();
        for sel in &pcr_selection.pcr_selections {
            let mut pending = sel.indices();
            while !pending.is_empty() {
                let request = TpmlPcrSelection::single(sel.hash, &pending);
                let mut cmd = TpmCommand::new(TpmCc::PcrRead);
                cmd.add(&request);

                let response = self.device.execute(&cmd.finalize())?;
                response.ensure_success().context("PCR_Read failed")?;

                let mut buf = response.data_buffer();
                let _update_counter = buf.get_u32()?;
                let selection_out = TpmlPcrSelection::unmarshal(&mut buf)?;
                let digest_list = TpmlDigest::unmarshal(&mut buf)?;

                let returned: Vec<u32> = selection_out
                    .entries()
                    .into_iter()
                    .filter(|(hash, _)| *hash == sel.hash)
                    .map(|(_, idx)| idx)
                    .collect();
                if returned.is_empty() || returned.len() != digest_list.digests.len() {
                    bail!(
                        "PCR_Read returned {} digests for {} PCRs",
                        digest_list.digests.len(),
                        returned.len()
                    );
                }
                for (idx, digest) in returned.iter().zip(digest_list.digests) {
                    if digest.buffer.len() != sel.hash.digest_size() {
                        bail!("PCR {} digest has wrong size", idx);
                    }
                    result.push((*idx, digest.buffer));
                }
                pending.retain(|p| !returned.contains(p));
            }
        }
        result.sort_by_key(|(idx, _)| *idx);
        Ok(result)
    }

    /// Read a single PCR value
    pub fn pcr_read_single(&mut self, pcr_idx: u32, hash_alg: TpmAlgId) -> Result<Vec<u8>> {
        let selection = TpmlPcrSelection::single(hash_alg, &[pcr_idx]);
        let values = self.pcr_read(&selection)?;

        values
            .into_iter()
            .find(|(idx, _)| *idx == pcr_idx)
            .map(|(_, v)| v)
            .ok_or_else(|| anyhow::anyhow!("PCR {} not found in response", pcr_idx))
    }

    /// Extend a PCR with a hash value
    pub fn pcr_extend(&mut self, pcr: u32, hash: &[u8], hash_alg: TpmAlgId) -> Result<()> {
        let digest_values = TpmlDigestValues::single(TpmtHa {
            hash_alg,
            digest: hash.to_vec(),
        });

        let mut cmd = TpmCommand::with_sessions(TpmCc::PcrExtend);
        cmd.add_handle(pcr);
        cmd.add_null_auth_area();
        cmd.add(&digest_values);

        let response = self.device.execute(&cmd.finalize())?;
        response
            .ensure_success()
            .with_context(|| format!("PCR_Extend failed for PCR {}", pcr))?;

        debug!("extended PCR {}", pcr);
        Ok(())
    }

    // ==================== Primary Key Operations ====================

    /// Read public area and name of a loaded or persistent object
    pub fn read_public(&mut self, handle: u32) -> Result<ReadPublicOut> {
        let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
        cmd.add_handle(handle);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("ReadPublic failed")?;

        let mut buf = response.data_buffer();
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
        let name = buf.get_tpm2b()?;
        let public = out_public.parse()?;
        if name != object_name(&out_public.public_area) {
            bail!("ReadPublic name does not match public area");
        }

        Ok(ReadPublicOut { public, name })
    }

    /// Check if a persistent handle exists
    pub fn handle_exists(&mut self, handle: u32) -> Result<bool> {
        match self.read_public(handle) {
            Ok(_) => Ok(true),
            Err(err) => match err.downcast_ref::<ResponseCodeError>().and_then(|e| e.rc()) {
                Some(TpmRc::Handle) => Ok(false),
                _ => Err(err),
            },
        }
    }

    /// Create a primary key in `hierarchy`, authorizing with `hierarchy_auth`
    /// and giving the new key `user_auth`
    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        hierarchy_auth: &[u8],
        user_auth: &[u8],
        template: &TpmtPublic,
    ) -> Result<(LoadedObject, TpmtPublic)> {
        let public = Tpm2bPublic::from_template(template);

        let mut cmd = TpmCommand::with_sessions(TpmCc::CreatePrimary);
        cmd.add_handle(hierarchy);
        cmd.add_password_auth(hierarchy_auth);
        cmd.add(&Tpm2bSensitiveCreate::new(user_auth, &[]));
        cmd.add(&public);
        // outsideInfo
        cmd.add_tpm2b_empty();
        // creationPCR
        cmd.add(&TpmlPcrSelection::default());

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("CreatePrimary failed")?;

        // handle precedes the parameter area
        let parts = response.split(1)?;
        let mut buf = ResponseBuffer::new(&parts.parameters);
        let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
        let created = out_public.parse()?;

        let handle = parts.handles[0];
        debug!("created primary key with handle 0x{:08x}", handle);
        Ok((
            LoadedObject {
                handle,
                name: object_name(&out_public.public_area),
            },
            created,
        ))
    }

    /// Make a transient key persistent at `persistent_handle`, or evict a
    /// persistent key when `object_handle == persistent_handle`
    pub fn evict_control(
        &mut self,
        owner_auth: &[u8],
        object_handle: u32,
        persistent_handle: u32,
    ) -> Result<()> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::EvictControl);
        cmd.add_handle(tpm_rh::OWNER);
        cmd.add_handle(object_handle);
        cmd.add_password_auth(owner_auth);
        cmd.add_handle(persistent_handle);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("EvictControl failed")?;

        debug!(
            "evict control 0x{:08x} -> 0x{:08x}",
            object_handle, persistent_handle
        );
        Ok(())
    }

    /// Flush a context (handle)
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("FlushContext failed")?;

        Ok(())
    }

    // ==================== Sessions ====================

    pub fn start_policy_session(&mut self) -> Result<AuthSession> {
        AuthSession::start_policy(&mut self.device)
    }

    /// Policy session bound to `bind_handle` with parameter obfuscation
    pub fn start_bound_policy_session(
        &mut self,
        bind_handle: u32,
        bind_auth: &[u8],
    ) -> Result<AuthSession> {
        AuthSession::start_bound_policy(&mut self.device, bind_handle, bind_auth)
    }

    /// Run PolicyPCR on `session` against the live PCR values
    pub fn policy_pcr(
        &mut self,
        session: &AuthSession,
        pcr_selection: &TpmlPcrSelection,
    ) -> Result<()> {
        session.policy_pcr(&mut self.device, &[], pcr_selection)
    }

    pub fn policy_digest(&mut self, session: &AuthSession) -> Result<Vec<u8>> {
        session.get_digest(&mut self.device)
    }

    pub fn flush_session(&mut self, session: AuthSession) -> Result<()> {
        session.flush(&mut self.device)
    }

    // ==================== Seal/Unseal Operations ====================

    /// Create a sealed data object under `parent` bound to `policy_digest`
    pub fn create_sealed(
        &mut self,
        parent: u32,
        parent_auth: &[u8],
        data: &[u8],
        policy_digest: &[u8],
    ) -> Result<CreatedObject> {
        if Tpm2bSensitiveCreate::inner_len(data.len()) > u16::MAX as usize {
            bail!("sealed payload of {} bytes does not fit a TPM2B", data.len());
        }
        let template = TpmtPublic::sealed_object(Tpm2bDigest::new(policy_digest.to_vec()));
        let public = Tpm2bPublic::from_template(&template);

        let mut cmd = TpmCommand::with_sessions(TpmCc::Create);
        cmd.add_handle(parent);
        cmd.add_password_auth(parent_auth);
        cmd.add(&Tpm2bSensitiveCreate::with_data(data));
        cmd.add(&public);
        // outsideInfo
        cmd.add_tpm2b_empty();
        // creationPCR
        cmd.add(&TpmlPcrSelection::default());

        let response = self.device.execute(&Zeroizing::new(cmd.finalize()))?;
        response.ensure_success().context("Create (seal) failed")?;

        let created = parse_create_out(&response.split(0)?.parameters)?;
        debug!("sealed {} bytes under 0x{:08x}", data.len(), parent);
        Ok(created)
    }

    /// Load an object under `parent`
    pub fn load(
        &mut self,
        parent: u32,
        parent_auth: &[u8],
        private: &[u8],
        public: &[u8],
    ) -> Result<LoadedObject> {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Load);
        cmd.add_handle(parent);
        cmd.add_password_auth(parent_auth);
        cmd.add_tpm2b(private);
        cmd.add_tpm2b(public);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Load failed")?;

        let parts = response.split(1)?;
        let mut buf = ResponseBuffer::new(&parts.parameters);
        let name = buf.get_tpm2b()?;
        if name != object_name(public) {
            bail!("Load returned a name that does not match the public area");
        }

        let handle = parts.handles[0];
        debug!("loaded object with handle 0x{:08x}", handle);
        Ok(LoadedObject { handle, name })
    }

    /// Unseal `object` authorizing through the policy `session`
    pub fn unseal(
        &mut self,
        object: &LoadedObject,
        session: &mut AuthSession,
    ) -> Result<Zeroizing<Vec<u8>>> {
        session.begin_command();
        let cp = cp_hash(TpmCc::Unseal, &[&object.name], &[]);
        let auth = session.authorize(&cp, TpmaSa::new().with_continue_session());

        let mut cmd = TpmCommand::with_sessions(TpmCc::Unseal);
        cmd.add_handle(object.handle);
        cmd.add_auth_area([&auth]);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Unseal failed")?;

        let parts = response.split(0)?;
        let params = Zeroizing::new(parts.parameters);
        let session_out = parts
            .sessions
            .first()
            .context("Unseal response carries no session")?;
        session.verify_response(&rp_hash(TpmCc::Unseal, &params), session_out)?;

        let mut buf = ResponseBuffer::new(&params);
        let data = Zeroizing::new(buf.get_tpm2b()?);

        debug!("unsealed {} bytes from TPM", data.len());
        Ok(data)
    }

    /// Unseal `object` with the response parameter obfuscated by the bound
    /// `session`
    pub fn unseal_obfuscated(
        &mut self,
        object: &LoadedObject,
        session: &mut AuthSession,
    ) -> Result<ObfuscatedSecret> {
        if !session.can_obfuscate() {
            bail!("obfuscated unseal needs a bound session");
        }
        session.begin_command();
        let cp = cp_hash(TpmCc::Unseal, &[&object.name], &[]);
        let attributes = TpmaSa::new().with_continue_session().with_encrypt();
        let auth = session.authorize(&cp, attributes);

        let mut cmd = TpmCommand::with_sessions(TpmCc::Unseal);
        cmd.add_handle(object.handle);
        cmd.add_auth_area([&auth]);

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Unseal failed")?;

        let parts = response.split(0)?;
        let session_out = parts
            .sessions
            .first()
            .context("Unseal response carries no session")?;
        session.verify_response(&rp_hash(TpmCc::Unseal, &parts.parameters), session_out)?;

        let mut buf = ResponseBuffer::new(&parts.parameters);
        let ciphertext = Zeroizing::new(buf.get_tpm2b()?);
        let mask = session.response_mask(ciphertext.len())?;

        debug!("unsealed {} obfuscated bytes", ciphertext.len());
        Ok(ObfuscatedSecret { ciphertext, mask })
    }

    /// Create a sealed data object from an [`ObfuscatedSecret`] without
    /// recovering the plaintext.
    ///
    /// `session` must be the bound session the secret was unsealed through;
    /// it is attached as the decrypt session, and the unseal mask is swapped
    /// for the create mask directly on the ciphertext.
    pub fn create_sealed_obfuscated(
        &mut self,
        parent: &LoadedObject,
        parent_auth: &[u8],
        secret: ObfuscatedSecret,
        policy_digest: &[u8],
        session: &mut AuthSession,
    ) -> Result<CreatedObject> {
        let data_len = secret.len();
        session.begin_command();
        let inner_len = Tpm2bSensitiveCreate::inner_len(data_len);
        let create_mask = session.command_mask(inner_len)?;

        // userAuth (empty) and the data size, then the data itself
        let mut inner = Zeroizing::new(Vec::with_capacity(inner_len));
        inner.extend_from_slice(&0u16.to_be_bytes());
        inner.extend_from_slice(&(data_len as u16).to_be_bytes());
        xor_in_place(&mut inner[..4], &create_mask[..4]);

        let mut swap = Zeroizing::new(secret.mask.to_vec());
        xor_in_place(&mut swap, &create_mask[4..]);
        let mut payload = Zeroizing::new(secret.ciphertext.to_vec());
        xor_in_place(&mut payload, &swap);
        inner.extend_from_slice(&payload);

        let template = TpmtPublic::sealed_object(Tpm2bDigest::new(policy_digest.to_vec()));
        let mut params = CommandBuffer::new();
        params.put_tpm2b(&inner);
        Tpm2bPublic::from_template(&template).marshal(&mut params);
        params.put_tpm2b_empty();
        TpmlPcrSelection::default().marshal(&mut params);

        let cp = cp_hash(TpmCc::Create, &[&parent.name], params.as_bytes());
        let attributes = TpmaSa::new().with_continue_session().with_decrypt();
        let auths = [
            TpmsAuthCommand::password(parent_auth),
            session.authorize(&cp, attributes),
        ];

        let mut cmd = TpmCommand::with_sessions(TpmCc::Create);
        cmd.add_handle(parent.handle);
        cmd.add_auth_area(&auths);
        cmd.add_bytes(params.as_bytes());

        let response = self.device.execute(&cmd.finalize())?;
        response.ensure_success().context("Create (reseal) failed")?;

        let parts = response.split(0)?;
        let session_out = parts
            .sessions
            .get(1)
            .context("Create response carries no decrypt session")?;
        session.verify_response(&rp_hash(TpmCc::Create, &parts.parameters), session_out)?;

        let created = parse_create_out(&parts.parameters)?;
        debug!("resealed {} obfuscated bytes", data_len);
        Ok(created)
    }
}

fn parse_create_out(parameters: &[u8]) -> Result<CreatedObject> {
    let mut buf = ResponseBuffer::new(parameters);
    let out_private = Tpm2bPrivate::unmarshal(&mut buf)?;
    let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
    Ok(CreatedObject {
        public: out_public.public_area,
        private: out_private.buffer,
    })
}
