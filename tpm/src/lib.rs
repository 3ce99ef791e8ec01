// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! PCR-bound secret sealing
//!
//! Binds secret bytes to the measured boot state held in TPM PCRs, on TPM 1.2
//! and TPM 2.0 devices behind one API. The caller opens the device channel and
//! hands it to a [`SealingSession`], which detects the TPM generation once and
//! serializes all operations on the channel.
//!
//! ```no_run
//! use tpm::{AuthContext, SealingSession};
//! use tpm2::TpmDevice;
//! use tpm_types::PcrSelection;
//!
//! let session = SealingSession::new(TpmDevice::detect()?)?;
//! let auth = AuthContext::empty();
//! let sealed = session.seal(&PcrSelection::sha256(&[0, 2, 4]), b"disk-key", &auth)?;
//! let secret = session.unseal(&sealed, &auth)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod auth;
mod config;
mod error;
mod policy;
mod probe;
mod root_key;
mod session;
mod v12;
mod v20;

pub use auth::{AuthContext, AuthSecret};
pub use config::{SealingConfig, DEFAULT_SRK_HANDLE};
pub use error::{BoxError, Result, SealError};
pub use policy::MAX_PCR_INDEX;
pub use probe::probe;
pub use root_key::{RootKeyHandle, RootKeyManager};
pub use session::{PlaintextExposure, Resealed, Sealer, SealingSession};
pub use v12::Tpm12Sealer;
pub use v20::Tpm20Sealer;

pub use tpm_types::{HashAlgorithm, PcrSelection, PcrValue, SealedBlob, SealedSecret, TpmGeneration};
