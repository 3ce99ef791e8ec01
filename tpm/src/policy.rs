// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! PCR selection checks and conversion to the wire selections
//!
//! Everything here runs before any device traffic.

use tpm12::PcrSelection12;
use tpm2::{TpmAlgId, TpmlPcrSelection};
use tpm_types::{PcrSelection, PcrValue, TpmGeneration};

use crate::error::{Result, SealError};

/// Highest PCR index a policy may reference
pub const MAX_PCR_INDEX: u32 = 23;

/// PCR state a new blob is bound to
#[derive(Debug, Clone)]
pub enum PolicyTarget {
    /// The values the PCRs hold right now
    Live(PcrSelection),
    /// Caller-supplied values in ascending index order
    Expected {
        selection: PcrSelection,
        values: Vec<Vec<u8>>,
    },
}

impl PolicyTarget {
    /// Validated target for the current PCR values of `selection`
    pub fn live(selection: &PcrSelection, generation: TpmGeneration) -> Result<Self> {
        validate(selection, generation)?;
        Ok(PolicyTarget::Live(selection.clone()))
    }

    /// Validated target for caller-supplied PCR values
    pub fn expected(values: &[PcrValue], generation: TpmGeneration) -> Result<Self> {
        let (selection, values) = validate_values(values, generation)?;
        Ok(PolicyTarget::Expected { selection, values })
    }

    pub fn selection(&self) -> &PcrSelection {
        match self {
            PolicyTarget::Live(selection) => selection,
            PolicyTarget::Expected { selection, .. } => selection,
        }
    }
}

pub fn validate(selection: &PcrSelection, generation: TpmGeneration) -> Result<()> {
    if selection.is_empty() {
        return Err(SealError::PolicyConstruction(
            "PCR selection is empty".into(),
        ));
    }
    let bank = generation.pcr_bank();
    if selection.bank != bank {
        return Err(SealError::PolicyConstruction(format!(
            "{} policies use the {} bank, got {}",
            generation, bank, selection.bank
        )));
    }
    if let Some(index) = selection.indices().find(|i| *i > MAX_PCR_INDEX) {
        return Err(SealError::PolicyConstruction(format!(
            "PCR index {} out of range 0..={}",
            index, MAX_PCR_INDEX
        )));
    }
    Ok(())
}

/// Check caller-supplied expected values and return their selection with the
/// values in ascending index order
pub fn validate_values(
    values: &[PcrValue],
    generation: TpmGeneration,
) -> Result<(PcrSelection, Vec<Vec<u8>>)> {
    let selection = PcrSelection::of_values(values).ok_or_else(|| {
        SealError::PolicyConstruction("expected PCR values are empty or span several banks".into())
    })?;
    validate(&selection, generation)?;
    if selection.pcrs.len() != values.len() {
        return Err(SealError::PolicyConstruction(
            "expected PCR values name an index twice".into(),
        ));
    }
    let size = selection.bank.digest_size();
    if let Some(bad) = values.iter().find(|v| v.value.len() != size) {
        return Err(SealError::PolicyConstruction(format!(
            "PCR {} value is {} bytes, {} expects {}",
            bad.index,
            bad.value.len(),
            selection.bank,
            size
        )));
    }
    let mut sorted: Vec<&PcrValue> = values.iter().collect();
    sorted.sort_by_key(|v| v.index);
    let ordered = sorted.into_iter().map(|v| v.value.clone()).collect();
    Ok((selection, ordered))
}

pub fn to_tpm2(selection: &PcrSelection) -> TpmlPcrSelection {
    let pcrs: Vec<u32> = selection.indices().collect();
    TpmlPcrSelection::single(TpmAlgId::Sha256, &pcrs)
}

pub fn to_tpm12(selection: &PcrSelection) -> Result<PcrSelection12> {
    let pcrs: Vec<u32> = selection.indices().collect();
    PcrSelection12::new(&pcrs).map_err(|e| SealError::PolicyConstruction(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tpm_types::HashAlgorithm;

    #[test]
    fn test_rejects_bad_selections() {
        let gen2 = TpmGeneration::Tpm20;
        assert!(validate(&PcrSelection::sha256(&[0, 2, 4]), gen2).is_ok());
        assert!(validate(&PcrSelection::sha256(&[23]), gen2).is_ok());

        for bad in [
            PcrSelection::sha256(&[]),
            PcrSelection::sha1(&[0]),
            PcrSelection::sha256(&[24]),
        ] {
            assert!(matches!(
                validate(&bad, gen2),
                Err(SealError::PolicyConstruction(_))
            ));
        }
        assert!(validate(&PcrSelection::sha256(&[0]), TpmGeneration::Tpm12).is_err());
    }

    #[test]
    fn test_values_are_ordered_and_sized() {
        let values = vec![
            PcrValue::new(7, HashAlgorithm::Sha1, vec![7; 20]),
            PcrValue::new(1, HashAlgorithm::Sha1, vec![1; 20]),
        ];
        let (sel, ordered) = validate_values(&values, TpmGeneration::Tpm12).unwrap();
        assert_eq!(sel, PcrSelection::sha1(&[1, 7]));
        assert_eq!(ordered, vec![vec![1; 20], vec![7; 20]]);

        let short = vec![PcrValue::new(1, HashAlgorithm::Sha256, vec![0; 20])];
        assert!(validate_values(&short, TpmGeneration::Tpm20).is_err());

        let twice = vec![
            PcrValue::new(1, HashAlgorithm::Sha256, vec![0; 32]),
            PcrValue::new(1, HashAlgorithm::Sha256, vec![1; 32]),
        ];
        assert!(validate_values(&twice, TpmGeneration::Tpm20).is_err());
    }

    #[test]
    fn test_wire_selections() {
        let sel = PcrSelection::sha256(&[0, 2, 4]);
        assert_eq!(to_tpm2(&sel).entries().len(), 3);
        let sel = PcrSelection::sha1(&[0, 2, 4]);
        assert_eq!(to_tpm12(&sel).unwrap().bitmap, [0x15, 0, 0]);
    }
}
