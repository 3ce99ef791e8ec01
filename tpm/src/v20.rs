// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 sealing
//!
//! Blobs are keyed-hash sealed-data objects under the storage root key whose
//! `authPolicy` is a single `TPM2_PolicyPCR`. Reseal keeps the secret inside
//! the TPM: the unseal response and the create command are both obfuscated
//! through one SRK-bound session, and the host only swaps masks.

use tpm2::{
    compute_policy_pcr, AuthSession, LoadedObject, TpmContext, TpmTransport, TpmlPcrSelection,
    MAX_SYM_DATA,
};
use tpm_types::{PcrSelection, PcrValue, SealedBlob, SealedSecret, TpmGeneration};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::auth::{AuthContext, AuthSecret};
use crate::error::{ClassifyExt, Result, SealError};
use crate::policy::{self, PolicyTarget};
use crate::root_key::{RootKeyHandle, RootKeyManager};
use crate::session::{
    ensure_generation, ensure_plaintext_fits, PlaintextExposure, Resealed, Sealer,
};

const GENERATION: TpmGeneration = TpmGeneration::Tpm20;

pub struct Tpm20Sealer<T: TpmTransport> {
    tpm: TpmContext<T>,
    root_key: RootKeyManager,
}

impl<T: TpmTransport> Tpm20Sealer<T> {
    pub fn new(channel: T, srk_handle: u32) -> Self {
        Self {
            tpm: TpmContext::from_transport(channel),
            root_key: RootKeyManager::new(srk_handle),
        }
    }

    pub fn root_key(&self) -> &RootKeyManager {
        &self.root_key
    }

    fn srk(&mut self, secret: &AuthSecret<32>) -> Result<RootKeyHandle> {
        self.root_key.load_or_create(&mut self.tpm, secret)
    }

    fn flush(&mut self, handle: u32) {
        if let Err(err) = self.tpm.flush_context(handle) {
            warn!("failed to flush handle 0x{:08x}: {:#}", handle, err);
        }
    }

    /// Policy digest binding a new object to `target`
    fn target_policy(&mut self, target: &PolicyTarget) -> Result<Vec<u8>> {
        let selection = policy::to_tpm2(target.selection());
        let values = match target {
            PolicyTarget::Live(pcrs) => {
                let read = self
                    .tpm
                    .pcr_read(&selection)
                    .classify("reading PCR values")?;
                if read.len() != pcrs.pcrs.len() {
                    return Err(SealError::Transport {
                        message: "reading PCR values".into(),
                        source: format!("TPM returned {} of {} PCRs", read.len(), pcrs.pcrs.len())
                            .into(),
                    });
                }
                read.into_iter().map(|(_, value)| value).collect()
            }
            PolicyTarget::Expected { values, .. } => values.clone(),
        };
        Ok(compute_policy_pcr(&selection, &values))
    }

    fn seal_target(
        &mut self,
        target: &PolicyTarget,
        plaintext: &[u8],
        auth: &AuthContext,
    ) -> Result<SealedSecret> {
        ensure_plaintext_fits(plaintext, MAX_SYM_DATA)?;
        let secret = AuthSecret::sha256(auth);
        let srk = self.srk(&secret)?;
        let policy_digest = self.target_policy(target)?;
        let created = self
            .tpm
            .create_sealed(srk.handle, secret.as_bytes(), plaintext, &policy_digest)
            .classify("sealing")?;
        debug!("sealed secret to {}", target.selection());
        Ok(SealedSecret {
            pcr_selection: target.selection().clone(),
            blob: SealedBlob::Tpm20 {
                public: created.public,
                private: created.private,
            },
        })
    }

    fn load(
        &mut self,
        sealed: &SealedSecret,
        srk: &RootKeyHandle,
        secret: &AuthSecret<32>,
    ) -> Result<LoadedObject> {
        let SealedBlob::Tpm20 { public, private } = &sealed.blob else {
            return Err(SealError::UnsupportedVersion(
                "not a TPM 2.0 blob".into(),
            ));
        };
        self.tpm
            .load(srk.handle, secret.as_bytes(), private, public)
            .classify("loading sealed object")
    }

    fn unseal_loaded(
        &mut self,
        object: &LoadedObject,
        selection: &TpmlPcrSelection,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let mut session = self
            .tpm
            .start_policy_session()
            .classify("starting policy session")?;
        let result = match self.tpm.policy_pcr(&session, selection) {
            Ok(()) => self.tpm.unseal(object, &mut session),
            Err(err) => Err(err),
        };
        self.flush(session.handle);
        result.classify("unsealing")
    }

    fn reseal_loaded(
        &mut self,
        object: &LoadedObject,
        srk: &RootKeyHandle,
        secret: &AuthSecret<32>,
        old_selection: &TpmlPcrSelection,
        target: &PolicyTarget,
    ) -> Result<SealedSecret> {
        let mut session = self
            .tpm
            .start_bound_policy_session(srk.handle, secret.as_bytes())
            .classify("starting bound policy session")?;
        let result = self.reseal_in_session(object, srk, secret, old_selection, target, &mut session);
        self.flush(session.handle);
        result
    }

    fn reseal_in_session(
        &mut self,
        object: &LoadedObject,
        srk: &RootKeyHandle,
        secret: &AuthSecret<32>,
        old_selection: &TpmlPcrSelection,
        target: &PolicyTarget,
        session: &mut AuthSession,
    ) -> Result<SealedSecret> {
        self.tpm
            .policy_pcr(session, old_selection)
            .classify("applying PCR policy")?;
        let obfuscated = self
            .tpm
            .unseal_obfuscated(object, session)
            .classify("unsealing")?;
        let policy_digest = self.target_policy(target)?;
        let created = self
            .tpm
            .create_sealed_obfuscated(srk, secret.as_bytes(), obfuscated, &policy_digest, session)
            .classify("sealing under the new policy")?;
        Ok(SealedSecret {
            pcr_selection: target.selection().clone(),
            blob: SealedBlob::Tpm20 {
                public: created.public,
                private: created.private,
            },
        })
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
        let old = policy::to_tpm2(old_selection);

        let secret = AuthSecret::sha256(auth);
        let srk = self.srk(&secret)?;
        let object = self.load(sealed, &srk, &secret)?;
        let result = self.reseal_loaded(&object, &srk, &secret, &old, target);
        self.flush(object.handle);

        let sealed = result?;
        debug!(
            "resealed secret from {} to {} inside the TPM",
            old_selection,
            target.selection()
        );
        Ok(Resealed {
            sealed,
            exposure: PlaintextExposure::None,
        })
    }
}

impl<T: TpmTransport> Sealer<T> for Tpm20Sealer<T> {
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
        self.seal_target(&target, plaintext, auth)
    }

    fn seal_to_values(
        &mut self,
        expected: &[PcrValue],
        plaintext: &[u8],
        auth: &AuthContext,
    ) -> Result<SealedSecret> {
        let target = PolicyTarget::expected(expected, GENERATION)?;
        self.seal_target(&target, plaintext, auth)
    }

    fn unseal(&mut self, sealed: &SealedSecret, auth: &AuthContext) -> Result<Zeroizing<Vec<u8>>> {
        ensure_generation(sealed, GENERATION)?;
        policy::validate(&sealed.pcr_selection, GENERATION)?;
        let selection = policy::to_tpm2(&sealed.pcr_selection);

        let secret = AuthSecret::sha256(auth);
        let srk = self.srk(&secret)?;
        let object = self.load(sealed, &srk, &secret)?;
        let result = self.unseal_loaded(&object, &selection);
        self.flush(object.handle);
        result
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SRK_HANDLE;
    use tpm_sim::TpmSimulator;

    #[test]
    fn test_root_key_cache_follows_passphrase() {
        let empty = AuthContext::empty();
        let rotated = AuthContext::new("rotated");
        let sim = TpmSimulator::tpm20(AuthSecret::sha256(&empty).as_bytes()).unwrap();
        let mut sealer = Tpm20Sealer::new(sim, DEFAULT_SRK_HANDLE);
        assert_eq!(sealer.generation(), TpmGeneration::Tpm20);
        assert_eq!(sealer.root_key().srk_handle(), DEFAULT_SRK_HANDLE);
        assert!(!sealer.root_key().is_cached(&AuthSecret::sha256(&empty)));

        let sealed = sealer
            .seal(&PcrSelection::sha256(&[0]), b"cached", &empty)
            .unwrap();
        assert!(sealer.root_key().is_cached(&AuthSecret::sha256(&empty)));
        assert!(!sealer.root_key().is_cached(&AuthSecret::sha256(&rotated)));

        let err = sealer.unseal(&sealed, &rotated).unwrap_err();
        assert!(err.is_authorization(), "{err}");
        assert!(!sealer.root_key().is_cached(&AuthSecret::sha256(&empty)));

        assert_eq!(&sealer.unseal(&sealed, &empty).unwrap()[..], b"cached");
        assert!(sealer.root_key().is_cached(&AuthSecret::sha256(&empty)));
    }
}
