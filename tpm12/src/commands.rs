// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 command implementations

use anyhow::{bail, Context, Result};
use tpm2::{Marshal, ResponseBuffer, TpmTransport, Unmarshal};
use tracing::debug;
use zeroize::Zeroizing;

use super::auth::*;
use super::constants::*;
use super::types::*;
use super::wire::*;

/// TPM 1.2 command context over an open channel
pub struct Tpm12Context<T: TpmTransport> {
    device: T,
}

impl<T: TpmTransport> Tpm12Context<T> {
    pub fn from_transport(device: T) -> Self {
        Self { device }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.device
    }

    pub fn into_transport(self) -> T {
        self.device
    }

    /// Major and minor version from `TPM_CAP_VERSION_VAL`
    pub fn get_version(&mut self) -> Result<(u8, u8)> {
        let mut cmd = Tpm12Command::new(tag::RQU_COMMAND, Ordinal::GetCapability);
        cmd.add_u32(TPM_CAP_VERSION_VAL);
        cmd.add_sized(&[]);
        let response = execute(&mut self.device, &cmd.finalize())?;
        response
            .ensure_success()
            .context("TPM_GetCapability failed")?;

        let mut buf = ResponseBuffer::new(&response.data);
        let info = buf.get_sized_u32()?;
        let mut info = ResponseBuffer::new(&info);
        let info_tag = info.get_u16()?;
        if info_tag != tag::CAP_VERSION_INFO {
            bail!("unexpected version info tag 0x{:04x}", info_tag);
        }
        let major = info.get_u8()?;
        let minor = info.get_u8()?;
        Ok((major, minor))
    }

    pub fn pcr_read(&mut self, index: u32) -> Result<Digest20> {
        let mut cmd = Tpm12Command::new(tag::RQU_COMMAND, Ordinal::PcrRead);
        cmd.add_u32(index);
        let response = execute(&mut self.device, &cmd.finalize())?;
        response
            .ensure_success()
            .with_context(|| format!("TPM_PCRRead failed for PCR {}", index))?;
        ResponseBuffer::new(&response.data).get_array()
    }

    /// Read several PCRs, in the order given
    pub fn pcr_read_many(&mut self, indices: &[u32]) -> Result<Vec<Digest20>> {
        indices.iter().map(|&i| self.pcr_read(i)).collect()
    }

    /// Extend PCR `index` with `digest`, returning the new value
    pub fn extend(&mut self, index: u32, digest: &Digest20) -> Result<Digest20> {
        let mut cmd = Tpm12Command::new(tag::RQU_COMMAND, Ordinal::Extend);
        cmd.add_u32(index);
        cmd.add_bytes(digest);
        let response = execute(&mut self.device, &cmd.finalize())?;
        response
            .ensure_success()
            .with_context(|| format!("TPM_Extend failed for PCR {}", index))?;
        debug!("extended PCR {}", index);
        ResponseBuffer::new(&response.data).get_array()
    }

    /// Seal `data` under the SRK, releasable when `pcr_info` holds and the
    /// caller proves knowledge of `data_auth`.
    ///
    /// Returns the marshalled `TPM_STORED_DATA12`.
    pub fn seal(
        &mut self,
        srk_auth: &Digest20,
        data_auth: &Digest20,
        pcr_info: &PcrInfoLong,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut session =
            AuthSession12::start_osap(&mut self.device, TPM_ET_SRK, TPM_KH_SRK, srk_auth)?;
        let enc_auth = encrypt_auth(session.key(), session.nonce_even(), data_auth);
        let pcr_info = pcr_info.to_bytes();
        let ordinal = Ordinal::Seal.to_u32().to_be_bytes();

        let in_digest = sha1_digest(&[
            &ordinal,
            &enc_auth,
            &(pcr_info.len() as u32).to_be_bytes(),
            &pcr_info,
            &(data.len() as u32).to_be_bytes(),
            data,
        ]);
        let auth = session.authorize(&in_digest, false);

        let mut cmd = Tpm12Command::new(tag::RQU_AUTH1_COMMAND, Ordinal::Seal);
        cmd.add_u32(TPM_KH_SRK);
        cmd.add_bytes(&enc_auth);
        cmd.add_sized(&pcr_info);
        cmd.add_sized(data);
        cmd.add_auth(&auth);

        let response = execute(&mut self.device, &Zeroizing::new(cmd.finalize()))?;
        response.ensure_success().context("TPM_Seal failed")?;

        let (params, auths) = response.split_auth(1)?;
        let out_digest = sha1_digest(&[&0u32.to_be_bytes(), &ordinal, params]);
        session.verify(&out_digest, &auths[0])?;

        let stored = StoredData12::from_bytes(params).context("malformed TPM_STORED_DATA12")?;
        debug!("sealed {} bytes under the SRK", data.len());
        Ok(stored.to_bytes())
    }

    /// Unseal a marshalled `TPM_STORED_DATA12`
    pub fn unseal(
        &mut self,
        srk_auth: &Digest20,
        data_auth: &Digest20,
        stored_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        StoredData12::from_bytes(stored_data).context("malformed TPM_STORED_DATA12")?;

        let mut srk_session = AuthSession12::start_oiap(&mut self.device, srk_auth)?;
        let mut data_session = AuthSession12::start_oiap(&mut self.device, data_auth)?;
        let ordinal = Ordinal::Unseal.to_u32().to_be_bytes();
        let in_digest = sha1_digest(&[&ordinal, stored_data]);
        let srk_block = srk_session.authorize(&in_digest, false);
        let data_block = data_session.authorize(&in_digest, false);

        let mut cmd = Tpm12Command::new(tag::RQU_AUTH2_COMMAND, Ordinal::Unseal);
        cmd.add_u32(TPM_KH_SRK);
        cmd.add_bytes(stored_data);
        cmd.add_auth(&srk_block);
        cmd.add_auth(&data_block);

        let response = execute(&mut self.device, &cmd.finalize())?;
        response.ensure_success().context("TPM_Unseal failed")?;

        let (params, auths) = response.split_auth(2)?;
        let out_digest = sha1_digest(&[&0u32.to_be_bytes(), &ordinal, params]);
        srk_session.verify(&out_digest, &auths[0])?;
        data_session.verify(&out_digest, &auths[1])?;

        let mut buf = ResponseBuffer::new(params);
        let secret = Zeroizing::new(buf.get_sized_u32()?);
        buf.finish()?;
        debug!("unsealed {} bytes", secret.len());
        Ok(secret)
    }
}
