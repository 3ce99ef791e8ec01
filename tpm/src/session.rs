// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Generation dispatch
//!
//! A [`SealingSession`] owns the device channel for its lifetime, probes the
//! TPM generation once and routes every operation to the matching
//! [`Sealer`]. Each operation holds the session lock for its whole command
//! sequence.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tpm2::TpmTransport;
use tpm_types::{PcrSelection, PcrValue, SealedSecret, TpmGeneration};
use tracing::info;
use zeroize::Zeroizing;

use crate::auth::AuthContext;
use crate::config::SealingConfig;
use crate::error::{Result, SealError};
use crate::probe::probe;
use crate::v12::Tpm12Sealer;
use crate::v20::Tpm20Sealer;

/// Where the plaintext was visible while resealing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextExposure {
    /// Plaintext stayed inside the TPM
    None,
    /// Plaintext passed through a zeroizing buffer in host memory
    HostMemory,
}

/// Output of a reseal
#[derive(Debug, Clone)]
pub struct Resealed {
    pub sealed: SealedSecret,
    pub exposure: PlaintextExposure,
}

/// Seal, unseal and reseal for one TPM generation
pub trait Sealer<T: TpmTransport>: Send {
    fn generation(&self) -> TpmGeneration;

    fn seal(
        &mut self,
        selection: &PcrSelection,
        plaintext: &[u8],
        auth: &AuthContext,
    ) -> Result<SealedSecret>;

    /// Seal against caller-supplied PCR values instead of the live ones
    fn seal_to_values(
        &mut self,
        expected: &[PcrValue],
        plaintext: &[u8],
        auth: &AuthContext,
    ) -> Result<SealedSecret>;

    fn unseal(&mut self, sealed: &SealedSecret, auth: &AuthContext) -> Result<Zeroizing<Vec<u8>>>;

    fn reseal(
        &mut self,
        sealed: &SealedSecret,
        old_selection: &PcrSelection,
        new_selection: &PcrSelection,
        auth: &AuthContext,
    ) -> Result<Resealed>;

    fn reseal_to_values(
        &mut self,
        sealed: &SealedSecret,
        old_selection: &PcrSelection,
        expected: &[PcrValue],
        auth: &AuthContext,
    ) -> Result<Resealed>;

    /// Give the channel back
    fn into_transport(self: Box<Self>) -> T;
}

pub(crate) fn ensure_generation(sealed: &SealedSecret, generation: TpmGeneration) -> Result<()> {
    if sealed.generation() != generation {
        return Err(SealError::UnsupportedVersion(format!(
            "secret was sealed by a {} device, this session talks to a {} device",
            sealed.generation(),
            generation
        )));
    }
    Ok(())
}

pub(crate) fn ensure_plaintext_fits(plaintext: &[u8], max: usize) -> Result<()> {
    if plaintext.len() > max {
        return Err(SealError::PlaintextTooLarge {
            len: plaintext.len(),
            max,
        });
    }
    Ok(())
}

/// Sealing operations over one open TPM channel
pub struct SealingSession<T: TpmTransport + 'static> {
    generation: TpmGeneration,
    sealer: Mutex<Box<dyn Sealer<T>>>,
}

impl<T: TpmTransport + 'static> SealingSession<T> {
    /// Probe the device behind `channel` and set up the matching sealer
    pub fn new(channel: T) -> Result<Self> {
        Self::with_config(channel, SealingConfig::default())
    }

    pub fn with_config(mut channel: T, config: SealingConfig) -> Result<Self> {
        let generation = match config.generation {
            Some(generation) => {
                info!("using pinned generation {}", generation);
                generation
            }
            None => probe(&mut channel)?,
        };
        let sealer: Box<dyn Sealer<T>> = match generation {
            TpmGeneration::Tpm12 => Box::new(Tpm12Sealer::new(channel)),
            TpmGeneration::Tpm20 => Box::new(Tpm20Sealer::new(channel, config.srk_handle)),
        };
        Ok(Self {
            generation: sealer.generation(),
            sealer: Mutex::new(sealer),
        })
    }

    pub fn generation(&self) -> TpmGeneration {
        self.generation
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Sealer<T>>> {
        self.sealer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seal `plaintext` to the current values of `selection`
    pub fn seal(
        &self,
        selection: &PcrSelection,
        plaintext: &[u8],
        auth: &AuthContext,
    ) -> Result<SealedSecret> {
        self.lock().seal(selection, plaintext, auth)
    }

    /// Seal `plaintext` to the given PCR values
    pub fn seal_to_values(
        &self,
        expected: &[PcrValue],
        plaintext: &[u8],
        auth: &AuthContext,
    ) -> Result<SealedSecret> {
        self.lock().seal_to_values(expected, plaintext, auth)
    }

    pub fn unseal(&self, sealed: &SealedSecret, auth: &AuthContext) -> Result<Zeroizing<Vec<u8>>> {
        self.lock().unseal(sealed, auth)
    }

    /// Bind the secret in `sealed` to the current values of `new_selection`.
    ///
    /// `sealed` must be unsealable under `old_selection` right now. The input
    /// is left untouched and stays valid.
    pub fn reseal(
        &self,
        sealed: &SealedSecret,
        old_selection: &PcrSelection,
        new_selection: &PcrSelection,
        auth: &AuthContext,
    ) -> Result<Resealed> {
        self.lock()
            .reseal(sealed, old_selection, new_selection, auth)
    }

    /// Bind the secret in `sealed` to the given future PCR values
    pub fn reseal_to_values(
        &self,
        sealed: &SealedSecret,
        old_selection: &PcrSelection,
        expected: &[PcrValue],
        auth: &AuthContext,
    ) -> Result<Resealed> {
        self.lock()
            .reseal_to_values(sealed, old_selection, expected, auth)
    }

    /// Close the session and hand the channel back to the caller
    pub fn into_channel(self) -> T {
        self.sealer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_transport()
    }
}
