// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 structures: PCR selection, PCR_INFO_LONG and STORED_DATA12

use anyhow::{bail, Result};
use sha1::{Digest, Sha1};
use tpm2::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};

use super::constants::*;

pub type Digest20 = [u8; DIGEST_SIZE];

/// TPM_PCR_SELECTION with a fixed three-byte bitmap (PCR 0-23)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcrSelection12 {
    pub bitmap: [u8; 3],
}

impl PcrSelection12 {
    pub fn new(pcrs: &[u32]) -> Result<Self> {
        let mut bitmap = [0u8; 3];
        for &pcr in pcrs {
            if pcr >= PCR_COUNT {
                bail!("PCR index {} out of range", pcr);
            }
            bitmap[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        Ok(Self { bitmap })
    }

    /// Selected indices in ascending order
    pub fn indices(&self) -> Vec<u32> {
        (0..PCR_COUNT)
            .filter(|i| self.bitmap[(i / 8) as usize] & (1 << (i % 8)) != 0)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == [0; 3]
    }
}

impl Marshal for PcrSelection12 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.bitmap.len() as u16);
        buf.put_bytes(&self.bitmap);
    }
}

impl Unmarshal for PcrSelection12 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let size = buf.get_u16()? as usize;
        if size != 3 {
            bail!("unsupported PCR selection size: {}", size);
        }
        Ok(Self {
            bitmap: buf.get_array()?,
        })
    }
}

/// SHA1 of the TPM_PCR_COMPOSITE over `values`, given in ascending index
/// order of `selection`
pub fn composite_digest(selection: &PcrSelection12, values: &[Digest20]) -> Result<Digest20> {
    if selection.indices().len() != values.len() {
        bail!(
            "composite needs {} PCR values, got {}",
            selection.indices().len(),
            values.len()
        );
    }
    let mut hasher = Sha1::new();
    hasher.update(selection.to_bytes());
    hasher.update(((values.len() * DIGEST_SIZE) as u32).to_be_bytes());
    for value in values {
        hasher.update(value);
    }
    Ok(hasher.finalize().into())
}

/// TPM_PCR_INFO_LONG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrInfoLong {
    pub locality_at_creation: u8,
    pub locality_at_release: u8,
    pub creation_pcr_selection: PcrSelection12,
    pub release_pcr_selection: PcrSelection12,
    pub digest_at_creation: Digest20,
    pub digest_at_release: Digest20,
}

impl PcrInfoLong {
    /// Release policy over `selection` at locality 0 with the given composite
    pub fn for_release(selection: PcrSelection12, digest_at_release: Digest20) -> Self {
        Self {
            locality_at_creation: TPM_LOC_ZERO,
            locality_at_release: TPM_LOC_ZERO,
            creation_pcr_selection: selection,
            release_pcr_selection: selection,
            digest_at_creation: digest_at_release,
            digest_at_release,
        }
    }
}

impl Marshal for PcrInfoLong {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(tag::PCR_INFO_LONG);
        buf.put_u8(self.locality_at_creation);
        buf.put_u8(self.locality_at_release);
        self.creation_pcr_selection.marshal(buf);
        self.release_pcr_selection.marshal(buf);
        buf.put_bytes(&self.digest_at_creation);
        buf.put_bytes(&self.digest_at_release);
    }
}

impl Unmarshal for PcrInfoLong {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        if tag != tag::PCR_INFO_LONG {
            bail!("not a PCR_INFO_LONG: tag 0x{:04x}", tag);
        }
        Ok(Self {
            locality_at_creation: buf.get_u8()?,
            locality_at_release: buf.get_u8()?,
            creation_pcr_selection: PcrSelection12::unmarshal(buf)?,
            release_pcr_selection: PcrSelection12::unmarshal(buf)?,
            digest_at_creation: buf.get_array()?,
            digest_at_release: buf.get_array()?,
        })
    }
}

/// TPM_STORED_DATA12, the output of TPM_Seal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredData12 {
    pub entity_type: u16,
    pub seal_info: Vec<u8>,
    pub enc_data: Vec<u8>,
}

impl StoredData12 {
    pub fn pcr_info(&self) -> Result<PcrInfoLong> {
        PcrInfoLong::from_bytes(&self.seal_info)
    }
}

impl Marshal for StoredData12 {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(tag::STORED_DATA12);
        buf.put_u16(self.entity_type);
        buf.put_sized_u32(&self.seal_info);
        buf.put_sized_u32(&self.enc_data);
    }
}

impl Unmarshal for StoredData12 {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        if tag != tag::STORED_DATA12 {
            bail!("not a STORED_DATA12: tag 0x{:04x}", tag);
        }
        Ok(Self {
            entity_type: buf.get_u16()?,
            seal_info: buf.get_sized_u32()?,
            enc_data: buf.get_sized_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_bitmap() {
        let sel = PcrSelection12::new(&[0, 2, 4, 23]).unwrap();
        assert_eq!(sel.bitmap, [0x15, 0x00, 0x80]);
        assert_eq!(sel.indices(), vec![0, 2, 4, 23]);
        assert_eq!(sel.to_bytes(), vec![0x00, 0x03, 0x15, 0x00, 0x80]);
        assert!(PcrSelection12::new(&[24]).is_err());
    }

    #[test]
    fn test_composite_layout() {
        let sel = PcrSelection12::new(&[1]).unwrap();
        let value = [0xabu8; 20];
        let mut expected = Sha1::new();
        expected.update([0x00, 0x03, 0x02, 0x00, 0x00]);
        expected.update([0x00, 0x00, 0x00, 0x14]);
        expected.update(value);
        let expected: Digest20 = expected.finalize().into();
        assert_eq!(composite_digest(&sel, &[value]).unwrap(), expected);
        assert!(composite_digest(&sel, &[]).is_err());
    }

    #[test]
    fn test_pcr_info_long_layout() {
        let sel = PcrSelection12::new(&[7]).unwrap();
        let info = PcrInfoLong::for_release(sel, [1; 20]);
        let bytes = info.to_bytes();
        assert_eq!(&bytes[..4], &[0x00, 0x06, 0x01, 0x01]);
        assert_eq!(bytes.len(), 2 + 1 + 1 + 5 + 5 + 20 + 20);
        assert_eq!(PcrInfoLong::from_bytes(&bytes).unwrap(), info);
    }

    #[test]
    fn test_stored_data_parse() {
        let stored = StoredData12 {
            entity_type: 0,
            seal_info: vec![1, 2, 3],
            enc_data: vec![9; 40],
        };
        let bytes = stored.to_bytes();
        assert_eq!(&bytes[..2], &[0x00, 0x16]);
        assert_eq!(StoredData12::from_bytes(&bytes).unwrap(), stored);
        assert!(StoredData12::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
