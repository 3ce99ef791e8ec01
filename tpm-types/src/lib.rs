// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM Types - Common type definitions for PCR-bound sealing
//!
//! This crate contains the data model shared across the sealing crates:
//! - tpm (sealing engines and dispatcher)
//! - tpm-sim (software device used in tests)
//! - callers that persist sealed secrets

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use scale::{Decode, DecodeAll, Encode};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

/// Digest algorithm of a PCR bank
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Size of a digest (and of a PCR value) in bytes
    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(format!("unsupported PCR bank: {other}")),
        }
    }
}

/// TPM protocol generation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum TpmGeneration {
    /// TPM 1.2 (SHA1 PCR bank, OIAP/OSAP authorization)
    Tpm12,
    /// TPM 2.0 (SHA256 PCR bank, policy sessions)
    Tpm20,
}

impl TpmGeneration {
    /// The only PCR bank this subsystem binds policies to on this generation
    pub fn pcr_bank(self) -> HashAlgorithm {
        match self {
            TpmGeneration::Tpm12 => HashAlgorithm::Sha1,
            TpmGeneration::Tpm20 => HashAlgorithm::Sha256,
        }
    }
}

impl fmt::Display for TpmGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TpmGeneration::Tpm12 => f.write_str("TPM 1.2"),
            TpmGeneration::Tpm20 => f.write_str("TPM 2.0"),
        }
    }
}

/// PCR (Platform Configuration Register) value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct PcrValue {
    /// PCR index (0-23)
    pub index: u32,

    /// Bank the value was read from
    pub algorithm: HashAlgorithm,

    /// PCR value (hash)
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

impl PcrValue {
    pub fn new(index: u32, algorithm: HashAlgorithm, value: Vec<u8>) -> Self {
        Self {
            index,
            algorithm,
            value,
        }
    }
}

/// PCR selection specifying which PCRs define a sealing policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct PcrSelection {
    /// Hash bank
    pub bank: HashAlgorithm,

    /// PCR indices, unique and ordered
    pub pcrs: BTreeSet<u32>,
}

impl PcrSelection {
    pub fn new(bank: HashAlgorithm, pcrs: &[u32]) -> Self {
        Self {
            bank,
            pcrs: pcrs.iter().copied().collect(),
        }
    }

    pub fn sha1(pcrs: &[u32]) -> Self {
        Self::new(HashAlgorithm::Sha1, pcrs)
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(HashAlgorithm::Sha256, pcrs)
    }

    /// Selection covering exactly the given values.
    ///
    /// Returns `None` when the values are empty or span more than one bank.
    pub fn of_values(values: &[PcrValue]) -> Option<Self> {
        let bank = values.first()?.algorithm;
        if values.iter().any(|v| v.algorithm != bank) {
            return None;
        }
        Some(Self {
            bank,
            pcrs: values.iter().map(|v| v.index).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pcrs.is_empty()
    }

    /// Selected indices in ascending order
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.pcrs.iter().copied()
    }

    pub fn to_arg(&self) -> String {
        let pcr_list: Vec<String> = self.pcrs.iter().map(|p| p.to_string()).collect();
        format!("{}:{}", self.bank, pcr_list.join(","))
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_arg())
    }
}

/// Generation-specific hardware output of a seal operation.
///
/// Callers must treat the contents as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(tag = "generation", rename_all = "snake_case")]
pub enum SealedBlob {
    /// TPM 1.2 `TPM_STORED_DATA12` structure
    Tpm12 {
        #[serde(with = "hex_bytes")]
        stored_data: Vec<u8>,
    },
    /// TPM 2.0 sealed data object, loadable under the storage root key
    Tpm20 {
        /// Marshalled TPMT_PUBLIC
        #[serde(with = "hex_bytes")]
        public: Vec<u8>,
        /// TPM2B_PRIVATE contents
        #[serde(with = "hex_bytes")]
        private: Vec<u8>,
    },
}

/// A secret sealed to a PCR selection.
///
/// The selection recorded here is the one the blob was bound to at seal time
/// and never changes; resealing produces a new `SealedSecret`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct SealedSecret {
    pub pcr_selection: PcrSelection,
    pub blob: SealedBlob,
}

impl SealedSecret {
    pub fn generation(&self) -> TpmGeneration {
        match self.blob {
            SealedBlob::Tpm12 { .. } => TpmGeneration::Tpm12,
            SealedBlob::Tpm20 { .. } => TpmGeneration::Tpm20,
        }
    }

    /// Byte-exact binary form for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode()
    }

    /// Parse the binary form produced by [`SealedSecret::to_bytes`].
    ///
    /// Trailing bytes are rejected.
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, scale::Error> {
        Self::decode_all(&mut input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tpm20() -> SealedSecret {
        SealedSecret {
            pcr_selection: PcrSelection::sha256(&[4, 0, 2]),
            blob: SealedBlob::Tpm20 {
                public: vec![0x00, 0x08, 0x00, 0x0b],
                private: vec![0xaa; 48],
            },
        }
    }

    #[test]
    fn test_pcr_selection_dedups_and_orders() {
        let sel = PcrSelection::sha256(&[7, 2, 2, 0]);
        assert_eq!(sel.indices().collect::<Vec<_>>(), vec![0, 2, 7]);
        assert_eq!(sel.to_arg(), "sha256:0,2,7");
    }

    #[test]
    fn test_pcr_selection_of_values() {
        let values = vec![
            PcrValue::new(7, HashAlgorithm::Sha1, vec![0; 20]),
            PcrValue::new(1, HashAlgorithm::Sha1, vec![1; 20]),
        ];
        let sel = PcrSelection::of_values(&values).unwrap();
        assert_eq!(sel, PcrSelection::sha1(&[1, 7]));

        let mixed = vec![
            PcrValue::new(1, HashAlgorithm::Sha1, vec![0; 20]),
            PcrValue::new(2, HashAlgorithm::Sha256, vec![0; 32]),
        ];
        assert!(PcrSelection::of_values(&mixed).is_none());
        assert!(PcrSelection::of_values(&[]).is_none());
    }

    #[test]
    fn test_sealed_secret_bytes_roundtrip() {
        let sealed = sample_tpm20();
        let bytes = sealed.to_bytes();
        let decoded = SealedSecret::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, sealed);
        assert_eq!(decoded.to_bytes(), bytes);
        assert_eq!(decoded.generation(), TpmGeneration::Tpm20);
    }

    #[test]
    fn test_sealed_secret_rejects_trailing_bytes() {
        let mut bytes = sample_tpm20().to_bytes();
        bytes.push(0);
        assert!(SealedSecret::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_sealed_secret_json() {
        let sealed = SealedSecret {
            pcr_selection: PcrSelection::sha1(&[0]),
            blob: SealedBlob::Tpm12 {
                stored_data: vec![0x00, 0x16, 0xbe, 0xef],
            },
        };
        let json = serde_json::to_string(&sealed).unwrap();
        assert!(json.contains("\"generation\":\"tpm12\""));
        assert!(json.contains("\"0016beef\""));
        let parsed: SealedSecret = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, sealed);
    }

    #[test]
    fn test_generation_banks() {
        assert_eq!(TpmGeneration::Tpm12.pcr_bank(), HashAlgorithm::Sha1);
        assert_eq!(TpmGeneration::Tpm20.pcr_bank(), HashAlgorithm::Sha256);
        assert_eq!("SHA256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
    }
}
