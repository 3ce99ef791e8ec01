// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software TPM for device-free sealing
//!
//! [`TpmSimulator`] implements [`TpmTransport`] and answers the TPM 1.2 or
//! TPM 2.0 command subset used for PCR-bound sealing on the real wire format:
//! authorization HMACs are checked, PCR policies are enforced and parameter
//! obfuscation is applied exactly as a hardware TPM would. Sealed blobs are
//! protected with AES-256-GCM under a key that never leaves the simulator.
//!
//! A [`SimulatorControl`] handle shares the simulator state, so tests can
//! extend PCRs, inject channel failures and reopen the device.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tpm2::{TpmAlgId, TpmTransport};
use tracing::debug;

mod blob;
mod v12;
mod v20;

use blob::BlobKey;

const PCR_COUNT: usize = 24;

/// Protocol the simulated device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedGeneration {
    Tpm12,
    Tpm20,
    /// Answers every command with bytes no TPM would produce
    Unknown,
}

struct State {
    generation: SimulatedGeneration,
    pcr_sha1: [[u8; 20]; PCR_COUNT],
    pcr_sha256: [[u8; 32]; PCR_COUNT],
    blob_key: BlobKey,
    fail_next: bool,
    command_log: Vec<u32>,
    tpm20: v20::State,
    tpm12: v12::State,
}

impl State {
    fn new(
        generation: SimulatedGeneration,
        tpm20: v20::State,
        tpm12: v12::State,
    ) -> Result<Self> {
        Ok(Self {
            generation,
            pcr_sha1: [[0; 20]; PCR_COUNT],
            pcr_sha256: [[0; 32]; PCR_COUNT],
            blob_key: BlobKey::generate()?,
            fail_next: false,
            command_log: Vec::new(),
            tpm20,
            tpm12,
        })
    }

    fn extend_sha1(&mut self, index: usize, digest: &[u8]) {
        let mut hasher = Sha1::new();
        hasher.update(self.pcr_sha1[index]);
        hasher.update(digest);
        self.pcr_sha1[index] = hasher.finalize().into();
    }

    fn extend_sha256(&mut self, index: usize, digest: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.pcr_sha256[index]);
        hasher.update(digest);
        self.pcr_sha256[index] = hasher.finalize().into();
    }

    fn pcr_value(&self, bank: TpmAlgId, index: u32) -> Option<Vec<u8>> {
        let index = index as usize;
        match bank {
            TpmAlgId::Sha1 => self.pcr_sha1.get(index).map(|v| v.to_vec()),
            TpmAlgId::Sha256 => self.pcr_sha256.get(index).map(|v| v.to_vec()),
            _ => None,
        }
    }

    fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        let tag = command
            .get(..2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .unwrap_or_default();
        if let Some(code) = command.get(6..10) {
            self.command_log
                .push(u32::from_be_bytes([code[0], code[1], code[2], code[3]]));
        }
        let is_tpm2_tag = matches!(tag, 0x8001 | 0x8002);
        match self.generation {
            SimulatedGeneration::Tpm20 if is_tpm2_tag => v20::execute(self, command),
            SimulatedGeneration::Tpm12 if !is_tpm2_tag => v12::execute(self, command),
            // both generations reject the other's framing with a 1.2 style TPM_BADTAG
            SimulatedGeneration::Tpm20 | SimulatedGeneration::Tpm12 => v12::bad_tag(),
            SimulatedGeneration::Unknown => vec![0xff; 6],
        }
    }

    /// Drop everything a resource manager flushes when a channel closes
    fn close_channel(&mut self) {
        self.tpm20.close_channel();
        self.tpm12.close_channel();
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An open channel to the simulated TPM
pub struct TpmSimulator {
    state: Arc<Mutex<State>>,
}

impl TpmSimulator {
    fn with_state(state: State) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// TPM 2.0 device whose owner hierarchy is authorized with `owner_auth`
    pub fn tpm20(owner_auth: &[u8]) -> Result<Self> {
        Ok(Self::with_state(State::new(
            SimulatedGeneration::Tpm20,
            v20::State::new(owner_auth),
            v12::State::default(),
        )?))
    }

    /// TPM 1.2 device with an SRK whose usage auth is `srk_auth`
    pub fn tpm12(srk_auth: [u8; 20]) -> Result<Self> {
        Ok(Self::with_state(State::new(
            SimulatedGeneration::Tpm12,
            v20::State::new(&[]),
            v12::State::new(srk_auth),
        )?))
    }

    /// Device that speaks neither protocol
    pub fn unknown() -> Result<Self> {
        Ok(Self::with_state(State::new(
            SimulatedGeneration::Unknown,
            v20::State::new(&[]),
            v12::State::default(),
        )?))
    }

    pub fn control(&self) -> SimulatorControl {
        SimulatorControl {
            state: self.state.clone(),
        }
    }
}

impl TpmTransport for TpmSimulator {
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>> {
        let mut state = lock(&self.state);
        if state.fail_next {
            state.fail_next = false;
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated channel failure",
            ));
        }
        let response = state.execute(command);
        debug!(
            "simulator: {} byte command, {} byte response",
            command.len(),
            response.len()
        );
        Ok(response)
    }
}

impl Drop for TpmSimulator {
    fn drop(&mut self) {
        lock(&self.state).close_channel();
    }
}

impl std::fmt::Debug for TpmSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmSimulator")
            .field("generation", &lock(&self.state).generation)
            .finish()
    }
}

/// Out-of-band access to a simulator's state
#[derive(Clone)]
pub struct SimulatorControl {
    state: Arc<Mutex<State>>,
}

impl SimulatorControl {
    /// Measure `data` into PCR `index` of every bank, as boot firmware would
    pub fn extend_pcr(&self, index: u32, data: &[u8]) {
        let index = index as usize;
        assert!(index < PCR_COUNT, "PCR index out of range");
        let mut state = lock(&self.state);
        let sha1: [u8; 20] = Sha1::digest(data).into();
        let sha256: [u8; 32] = Sha256::digest(data).into();
        state.extend_sha1(index, &sha1);
        state.extend_sha256(index, &sha256);
    }

    pub fn pcr_sha1(&self, index: u32) -> [u8; 20] {
        lock(&self.state).pcr_sha1[index as usize]
    }

    pub fn pcr_sha256(&self, index: u32) -> [u8; 32] {
        lock(&self.state).pcr_sha256[index as usize]
    }

    /// Make the next transmit fail with an I/O error
    pub fn fail_next_command(&self) {
        lock(&self.state).fail_next = true;
    }

    /// Command codes (TPM 2.0) or ordinals (TPM 1.2) received so far
    pub fn command_log(&self) -> Vec<u32> {
        lock(&self.state).command_log.clone()
    }

    /// How many times `code` was received
    pub fn command_count(&self, code: u32) -> usize {
        lock(&self.state)
            .command_log
            .iter()
            .filter(|c| **c == code)
            .count()
    }

    /// Open a new channel to the same device.
    ///
    /// Dropping any channel flushes every transient object and session, as a
    /// resource manager does when its last client disconnects.
    pub fn reopen(&self) -> TpmSimulator {
        TpmSimulator {
            state: self.state.clone(),
        }
    }

    /// Number of loaded transient objects and open sessions
    pub fn loaded_handles(&self) -> usize {
        let state = lock(&self.state);
        state.tpm20.loaded_handles() + state.tpm12.loaded_handles()
    }

    /// Persistent handles currently in use
    pub fn persistent_handles(&self) -> Vec<u32> {
        lock(&self.state).tpm20.persistent_handles()
    }

    /// Occupy `handle` with a persistent key that is not a storage root key
    pub fn persist_foreign_key(&self, handle: u32) {
        lock(&self.state).tpm20.persist_foreign_key(handle);
    }
}

impl std::fmt::Debug for SimulatorControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorControl").finish_non_exhaustive()
    }
}
