// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 implementation
//!
//! This crate provides TPM 2.0 commands over any [`TpmTransport`], talking
//! the wire protocol directly without C library dependencies.
//!
//! ## Supported Commands
//!
//! - Capabilities: `GetCapability` (TPM properties)
//! - PCR operations: `PCR_Read`, `PCR_Extend`
//! - Key operations: `CreatePrimary`, `Create`, `Load`, `EvictControl`, `ReadPublic`
//! - Sealing: `Create`/`Unseal` with PCR policy, including a reseal path that
//!   swaps XOR obfuscation masks so the payload never appears in the clear
//! - Sessions: unbound and bound policy sessions, `PolicyPCR`
//!
//! ## Example
//!
//! ```no_run
//! use tpm2::{TpmAlgId, TpmContext, TpmlPcrSelection};
//!
//! let mut ctx = TpmContext::new(None)?; // Auto-detect TPM device
//! let pcrs = ctx.pcr_read(&TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 7]))?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod commands;
mod constants;
mod device;
pub mod kdf;
mod marshal;
mod session;
mod types;

pub use commands::{CreatedObject, LoadedObject, ObfuscatedSecret, ReadPublicOut, TpmContext};
pub use constants::*;
pub use types::*;

pub use device::{ResponseCodeError, ResponseParts, TpmCommand, TpmDevice, TpmResponse, TpmTransport};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::{
    compute_policy_pcr, cp_hash, pcr_values_digest, policy_pcr_digest, rp_hash, AuthSession,
};
