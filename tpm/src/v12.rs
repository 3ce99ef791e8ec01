// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 sealing
//!
//! Blobs are `TPM_STORED_DATA12` structures sealed under the SRK with a
//! `TPM_PCR_INFO_LONG` release policy. TPM 1.2 has no way to move a secret
//! between policies inside the chip, so reseal unseals into host memory and
//! seals again.

use tpm12::{composite_digest, Digest20, PcrInfoLong, Tpm12Context, MAX_SEAL_DATA};
use tpm2::TpmTransport;
use tpm_types::{PcrSelection, PcrValue, SealedBlob, SealedSecret, TpmGeneration};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::auth::{AuthContext, AuthSecret};
use crate::error::{ClassifyExt, Result, SealError};
use crate::policy::{self, PolicyTarget};
use crate::session::{
    ensure_generation, ensure_plaintext_fits, PlaintextExposure, Resealed, Sealer,
};

const GENERATION: TpmGeneration = TpmGeneration::Tpm12;

pub struct Tpm12Sealer<T: TpmTransport> {
    tpm: Tpm12Context<T>,
}

impl<T: TpmTransport> Tpm12Sealer<T> {
    pub fn new(channel: T) -> Self {
        Self {
            tpm: Tpm12Context::from_transport(channel),
        }
    }

    fn target_values(&mut self, target: &PolicyTarget) -> Result<Vec<Digest20>> {
        match target {
            PolicyTarget::Live(selection) => {
                let indices: Vec<u32> = selection.indices().collect();
                self.tpm
                    .pcr_read_many(&indices)
                    .classify("reading PCR values")
            }
            PolicyTarget::Expected { values, .. } => values
                .iter()
                .map(|value| {
                    Digest20::try_from(value.as_slice()).map_err(|_| {
                        SealError::PolicyConstruction("SHA1 PCR values are 20 bytes".into())
                    })
                })
                .collect(),
        }
    }

    fn seal_target(
        &mut self,
        target: &PolicyTarget,
        plaintext: &[u8],
        secret: &AuthSecret<20>,
    ) -> Result<SealedSecret> {
        ensure_plaintext_fits(plaintext, MAX_SEAL_DATA)?;
        let selection = policy::to_tpm12(target.selection())?;
        let values = self.target_values(target)?;
        let composite = composite_digest(&selection, &values)
            .map_err(|e| SealError::PolicyConstruction(e.to_string()))?;
        let pcr_info = PcrInfoLong::for_release(selection, composite);

        let stored_data = self
            .tpm
            .seal(secret.as_bytes(), secret.as_bytes(), &pcr_info, plaintext)
            .classify("sealing")?;
        debug!("sealed secret to {}", target.selection());
        Ok(SealedSecret {
            pcr_selection: target.selection().clone(),
            blob: SealedBlob::Tpm12 { stored_data },
        })
    }

    fn unseal_with(
        &mut self,
        sealed: &SealedSecret,
        secret: &AuthSecret<20>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let SealedBlob::Tpm12 { stored_data } = &sealed.blob else {
            return Err(SealError::UnsupportedVersion(
                "not a TPM 1.2 blob".into(),
            ));
        };
        self.tpm
            .unseal(secret.as_bytes(), secret.as_bytes(), stored_data)
            .classify("unsealing")
    }

    fn reseal_target(
        &mut self,
        sealed: &SealedSecret,
        old_selection: &PcrSelection,
        target: &PolicyTarget,
        auth: &AuthContext,
    ) -> Result<Resealed> {
        ensure_generation(sealed, GENERATION)?;
        policy::validate(old_selection, GENERATION)?;
        if sealed.pcr_selection != *old_selection {
            return Err(SealError::policy_mismatch(
                "resealing",
                format!(
                    "secret is bound to {}, not {}",
                    sealed.pcr_selection, old_selection
                ),
            ));
        }

        let secret = AuthSecret::sha1(auth);
        let plaintext = self.unseal_with(sealed, &secret)?;
        warn!(
            "resealing from {} to {} through host memory",
            old_selection,
            target.selection()
        );
        let sealed = self.seal_target(target, &plaintext, &secret)?;
        Ok(Resealed {
            sealed,
            exposure: PlaintextExposure::HostMemory,
        })
    }
}

impl<T: TpmTransport> Sealer<T> for Tpm12Sealer<T> {
    fn generation(&self) -> TpmGeneration {
        GENERATION
    }

    fn seal(
        &mut self,
        selection: &PcrSelection,
        plaintext: &[u8],
        auth: &AuthContext,
    ) -> Result<SealedSecret> {
        let target = PolicyTarget::live(selection, GENERATION)?;
        self.seal_target(&target, plaintext, &AuthSecret::sha1(auth))
    }

    fn seal_to_values(
        &mut self,
        expected: &[PcrValue],
        plaintext: &[u8],
        auth: &AuthContext,
    ) -> Result<SealedSecret> {
        let target = PolicyTarget::expected(expected, GENERATION)?;
        self.seal_target(&target, plaintext, &AuthSecret::sha1(auth))
    }

    fn unseal(&mut self, sealed: &SealedSecret, auth: &AuthContext) -> Result<Zeroizing<Vec<u8>>> {
        ensure_generation(sealed, GENERATION)?;
        self.unseal_with(sealed, &AuthSecret::sha1(auth))
    }

    fn reseal(
        &mut self,
        sealed: &SealedSecret,
        old_selection: &PcrSelection,
        new_selection: &PcrSelection,
        auth: &AuthContext,
    ) -> Result<Resealed> {
        let target = PolicyTarget::live(new_selection, GENERATION)?;
        self.reseal_target(sealed, old_selection, &target, auth)
    }

    fn reseal_to_values(
        &mut self,
        sealed: &SealedSecret,
        old_selection: &PcrSelection,
        expected: &[PcrValue],
        auth: &AuthContext,
    ) -> Result<Resealed> {
        let target = PolicyTarget::expected(expected, GENERATION)?;
        self.reseal_target(sealed, old_selection, &target, auth)
    }

    fn into_transport(self: Box<Self>) -> T {
        self.tpm.into_transport()
    }
}
