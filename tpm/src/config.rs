// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use tpm_types::TpmGeneration;

/// Reserved persistent slot of the storage root key
pub const DEFAULT_SRK_HANDLE: u32 = 0x81000002;

/// Sealing session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealingConfig {
    /// Skip the probe and use this generation
    pub generation: Option<TpmGeneration>,
    /// Persistent handle of the TPM 2.0 storage root key
    pub srk_handle: u32,
}

impl Default for SealingConfig {
    fn default() -> Self {
        Self {
            generation: None,
            srk_handle: DEFAULT_SRK_HANDLE,
        }
    }
}

impl SealingConfig {
    pub fn pinned(generation: TpmGeneration) -> Self {
        Self {
            generation: Some(generation),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: SealingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SealingConfig::default());
        assert_eq!(config.srk_handle, 0x81000002);

        let config: SealingConfig =
            serde_json::from_str(r#"{"generation":"tpm12","srk_handle":2164260867}"#).unwrap();
        assert_eq!(config.generation, Some(TpmGeneration::Tpm12));
        assert_eq!(config.srk_handle, 0x81000003);
    }
}
