// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM generation detection

use tpm12::Tpm12Context;
use tpm2::{TpmContext, TpmTransport, TPM2_FAMILY_2_0};
use tpm_types::TpmGeneration;
use tracing::{debug, info};

use crate::error::{classify, Result, SealError};

fn is_io_failure(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<std::io::Error>().is_some())
}

/// Ask the device which protocol it speaks.
///
/// A TPM 2.0 part answers `TPM2_GetCapability` with family "2.0"; a TPM 1.2
/// part rejects that command with a 1.2 style reply and then reports version
/// 1.2 from `TPM_GetCapability`.
pub fn probe<T: TpmTransport + ?Sized>(channel: &mut T) -> Result<TpmGeneration> {
    let mut tpm2 = TpmContext::from_transport(&mut *channel);
    match tpm2.family_indicator() {
        Ok(TPM2_FAMILY_2_0) => {
            info!("detected TPM 2.0");
            return Ok(TpmGeneration::Tpm20);
        }
        Ok(family) => {
            return Err(SealError::UnsupportedVersion(format!(
                "unknown TPM 2.0 family indicator 0x{:08x}",
                family
            )))
        }
        Err(err) if is_io_failure(&err) => {
            return Err(classify(err, "probing for TPM 2.0"));
        }
        Err(err) => debug!("TPM 2.0 probe rejected: {:#}", err),
    }

    let mut tpm12 = Tpm12Context::from_transport(&mut *channel);
    match tpm12.get_version() {
        Ok((1, 2)) => {
            info!("detected TPM 1.2");
            Ok(TpmGeneration::Tpm12)
        }
        Ok((major, minor)) => Err(SealError::UnsupportedVersion(format!(
            "TPM reports version {}.{}",
            major, minor
        ))),
        Err(err) if is_io_failure(&err) => Err(classify(err, "probing for TPM 1.2")),
        Err(err) => Err(SealError::UnsupportedVersion(format!(
            "device answers neither TPM 2.0 nor TPM 1.2 capability queries: {:#}",
            err
        ))),
    }
}
