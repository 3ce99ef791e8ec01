// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy of the sealing API
//!
//! The protocol crates report failures as `anyhow` chains whose root cause is
//! a typed response code. [`classify`] turns such a chain into a [`SealError`]
//! by looking at that code.

use tpm12::{ReturnCode, ReturnCodeError};
use tpm2::{ResponseCodeError, TpmRc};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = SealError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// Channel I/O failure, malformed or unauthenticated response
    #[error("TPM transport failure: {message}")]
    Transport {
        message: String,
        #[source]
        source: BoxError,
    },

    /// The TPM rejected the authorization derived from the passphrase
    #[error("TPM authorization failed: {message}")]
    Authorization {
        message: String,
        #[source]
        source: BoxError,
    },

    /// Live PCR state does not satisfy the sealed policy
    #[error("PCR policy not satisfied: {message}")]
    PolicyMismatch {
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid PCR policy: {0}")]
    PolicyConstruction(String),

    #[error("unsupported TPM: {0}")]
    UnsupportedVersion(String),

    /// Plaintext is larger than one sealed object can hold
    #[error("plaintext of {len} bytes exceeds the {max} byte sealing limit")]
    PlaintextTooLarge { len: usize, max: usize },
}

impl SealError {
    pub fn is_policy_mismatch(&self) -> bool {
        matches!(self, SealError::PolicyMismatch { .. })
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, SealError::Authorization { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, SealError::Transport { .. })
    }

    pub(crate) fn policy_mismatch(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SealError::PolicyMismatch {
            message: message.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Transport,
    Authorization,
    PolicyMismatch,
}

fn tpm2_kind(code: &ResponseCodeError) -> Kind {
    match code.rc() {
        Some(TpmRc::AuthFail | TpmRc::BadAuth | TpmRc::Lockout) => Kind::Authorization,
        Some(TpmRc::PolicyFail | TpmRc::PcrChanged) => Kind::PolicyMismatch,
        _ => Kind::Transport,
    }
}

fn tpm12_kind(code: &ReturnCodeError) -> Kind {
    match code.return_code() {
        Some(ReturnCode::AuthFail | ReturnCode::Auth2Fail | ReturnCode::DefendLockRunning) => {
            Kind::Authorization
        }
        Some(ReturnCode::WrongPcrVal | ReturnCode::BadLocality) => Kind::PolicyMismatch,
        _ => Kind::Transport,
    }
}

/// Map a protocol-layer failure onto the public taxonomy, keeping the whole
/// chain as the source
pub(crate) fn classify(err: anyhow::Error, message: impl Into<String>) -> SealError {
    let kind = if let Some(code) = err.downcast_ref::<ResponseCodeError>() {
        tpm2_kind(code)
    } else if let Some(code) = err.downcast_ref::<ReturnCodeError>() {
        tpm12_kind(code)
    } else {
        Kind::Transport
    };
    let message = message.into();
    let source: BoxError = err.into();
    match kind {
        Kind::Transport => SealError::Transport { message, source },
        Kind::Authorization => SealError::Authorization { message, source },
        Kind::PolicyMismatch => SealError::PolicyMismatch { message, source },
    }
}

/// Attach a classification message to protocol-layer results
pub(crate) trait ClassifyExt<T> {
    fn classify(self, message: &str) -> Result<T>;
}

impl<T> ClassifyExt<T> for anyhow::Result<T> {
    fn classify(self, message: &str) -> Result<T> {
        self.map_err(|err| classify(err, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn tpm2_err(code: u32) -> anyhow::Error {
        anyhow::Error::from(ResponseCodeError { code }).context("Unseal failed")
    }

    #[test]
    fn test_tpm2_codes() {
        assert!(classify(tpm2_err(0x98E), "unseal").is_authorization());
        assert!(classify(tpm2_err(0x9A2), "unseal").is_authorization());
        assert!(classify(tpm2_err(0x921), "unseal").is_authorization());
        assert!(classify(tpm2_err(0x99D), "unseal").is_policy_mismatch());
        assert!(classify(tpm2_err(0x128), "unseal").is_policy_mismatch());
        assert!(classify(tpm2_err(0x18B), "unseal").is_transport());
    }

    #[test]
    fn test_tpm12_codes() {
        let err = |code| anyhow::Error::from(ReturnCodeError { code });
        assert!(classify(err(0x01), "unseal").is_authorization());
        assert!(classify(err(0x1D), "unseal").is_authorization());
        assert!(classify(err(0x18), "unseal").is_policy_mismatch());
        assert!(classify(err(0x3D), "unseal").is_policy_mismatch());
        assert!(classify(err(0x21), "unseal").is_transport());
    }

    #[test]
    fn test_io_error_is_transport_with_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err = Err::<(), _>(io)
            .context("TPM channel I/O failed")
            .classify("unseal")
            .unwrap_err();
        assert!(err.is_transport());
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "TPM channel I/O failed");
    }
}
