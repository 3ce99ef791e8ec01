// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 storage root key at a reserved persistent handle

use tpm2::{tpm_rh, LoadedObject, ResponseCodeError, TpmContext, TpmRc, TpmTransport, TpmtPublic};
use tracing::{debug, info, warn};

use crate::auth::AuthSecret;
use crate::error::{classify, ClassifyExt, Result};

/// Persistent SRK as a parent for sealed objects
pub type RootKeyHandle = LoadedObject;

/// Loads or creates the SRK and caches its handle for one sealing session
#[derive(Debug)]
pub struct RootKeyManager {
    srk_handle: u32,
    cached: Option<([u8; 32], RootKeyHandle)>,
}

impl RootKeyManager {
    pub fn new(srk_handle: u32) -> Self {
        Self {
            srk_handle,
            cached: None,
        }
    }

    pub fn srk_handle(&self) -> u32 {
        self.srk_handle
    }

    /// Whether a handle is cached for `auth`
    pub fn is_cached(&self, auth: &AuthSecret<32>) -> bool {
        matches!(&self.cached, Some((fp, _)) if *fp == auth.fingerprint())
    }

    /// Return the SRK handle, creating and persisting the key if the reserved
    /// slot is empty or holds a key with a different template
    pub fn load_or_create<T: TpmTransport>(
        &mut self,
        tpm: &mut TpmContext<T>,
        auth: &AuthSecret<32>,
    ) -> Result<RootKeyHandle> {
        let fingerprint = auth.fingerprint();
        match &self.cached {
            Some((fp, handle)) if *fp == fingerprint => return Ok(handle.clone()),
            Some(_) => {
                debug!("SRK authorization changed, dropping cached handle");
                self.cached = None;
            }
            None => {}
        }

        let template = TpmtPublic::ecc_storage_key();
        let handle = match self.read_existing(tpm)? {
            Some(existing) if existing.0.matches_template(&template) => {
                debug!("using SRK at 0x{:08x}", self.srk_handle);
                existing.1
            }
            Some(_) => {
                warn!(
                    "key at 0x{:08x} does not match the SRK template, evicting it",
                    self.srk_handle
                );
                tpm.evict_control(auth.as_bytes(), self.srk_handle, self.srk_handle)
                    .classify("evicting stale SRK")?;
                self.create(tpm, auth, &template)?
            }
            None => self.create(tpm, auth, &template)?,
        };

        self.cached = Some((fingerprint, handle.clone()));
        Ok(handle)
    }

    fn read_existing<T: TpmTransport>(
        &self,
        tpm: &mut TpmContext<T>,
    ) -> Result<Option<(TpmtPublic, RootKeyHandle)>> {
        match tpm.read_public(self.srk_handle) {
            Ok(out) => Ok(Some((
                out.public,
                LoadedObject {
                    handle: self.srk_handle,
                    name: out.name,
                },
            ))),
            Err(err)
                if err.downcast_ref::<ResponseCodeError>().and_then(|e| e.rc())
                    == Some(TpmRc::Handle) =>
            {
                Ok(None)
            }
            Err(err) => Err(classify(err, "reading SRK public area")),
        }
    }

    fn create<T: TpmTransport>(
        &self,
        tpm: &mut TpmContext<T>,
        auth: &AuthSecret<32>,
        template: &TpmtPublic,
    ) -> Result<RootKeyHandle> {
        let (transient, _) = tpm
            .create_primary(tpm_rh::OWNER, auth.as_bytes(), auth.as_bytes(), template)
            .classify("creating SRK")?;
        let persisted = tpm.evict_control(auth.as_bytes(), transient.handle, self.srk_handle);
        if let Err(err) = tpm.flush_context(transient.handle) {
            warn!("failed to flush transient SRK: {:#}", err);
        }
        persisted.classify("persisting SRK")?;

        info!("created SRK at 0x{:08x}", self.srk_handle);
        Ok(LoadedObject {
            handle: self.srk_handle,
            name: transient.name,
        })
    }
}
