// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 sealing commands
//!
//! Speaks the TPM 1.2 wire protocol over the same [`tpm2::TpmTransport`]
//! channel the TPM 2.0 layer uses. Covers what PCR-bound sealing needs:
//! `TPM_GetCapability` (version), `TPM_PCRRead`, `TPM_Extend`, `TPM_Seal`
//! and `TPM_Unseal`, authorized through OIAP and OSAP sessions.

mod auth;
mod commands;
mod constants;
mod types;
mod wire;

pub use auth::{encrypt_auth, osap_shared_secret, sha1_digest, AuthSession12};
pub use commands::Tpm12Context;
pub use constants::*;
pub use types::*;
pub use wire::{execute, CommandAuth, ResponseAuth, ReturnCodeError, Tpm12Command, Tpm12Response};
