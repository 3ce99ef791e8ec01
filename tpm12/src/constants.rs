// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 tags, ordinals and return codes

/// Command and response tags (TPM_TAG)
pub mod tag {
    pub const RQU_COMMAND: u16 = 0x00C1;
    pub const RQU_AUTH1_COMMAND: u16 = 0x00C2;
    pub const RQU_AUTH2_COMMAND: u16 = 0x00C3;
    pub const RSP_COMMAND: u16 = 0x00C4;
    pub const RSP_AUTH1_COMMAND: u16 = 0x00C5;
    pub const RSP_AUTH2_COMMAND: u16 = 0x00C6;

    pub const PCR_INFO_LONG: u16 = 0x0006;
    pub const STORED_DATA12: u16 = 0x0016;
    pub const CAP_VERSION_INFO: u16 = 0x0030;
}

/// Command ordinals (TPM_ORD)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ordinal {
    Oiap = 0x0000000A,
    Osap = 0x0000000B,
    Extend = 0x00000014,
    PcrRead = 0x00000015,
    Seal = 0x00000017,
    Unseal = 0x00000018,
    GetCapability = 0x00000065,
}

impl Ordinal {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x0A => Ordinal::Oiap,
            0x0B => Ordinal::Osap,
            0x14 => Ordinal::Extend,
            0x15 => Ordinal::PcrRead,
            0x17 => Ordinal::Seal,
            0x18 => Ordinal::Unseal,
            0x65 => Ordinal::GetCapability,
            _ => return None,
        })
    }
}

/// Return codes (TPM_RESULT)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReturnCode {
    Success = 0x00,
    AuthFail = 0x01,
    BadIndex = 0x02,
    BadParameter = 0x03,
    BadOrdinal = 0x0A,
    InvalidKeyHandle = 0x0C,
    Resources = 0x15,
    NoSrk = 0x12,
    WrongPcrVal = 0x18,
    Auth2Fail = 0x1D,
    BadTag = 0x1E,
    DecryptError = 0x21,
    InvalidAuthHandle = 0x22,
    BadDataSize = 0x2B,
    BadLocality = 0x3D,
    DefendLockRunning = 0x803,
}

impl ReturnCode {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x00 => ReturnCode::Success,
            0x01 => ReturnCode::AuthFail,
            0x02 => ReturnCode::BadIndex,
            0x03 => ReturnCode::BadParameter,
            0x0A => ReturnCode::BadOrdinal,
            0x0C => ReturnCode::InvalidKeyHandle,
            0x12 => ReturnCode::NoSrk,
            0x15 => ReturnCode::Resources,
            0x18 => ReturnCode::WrongPcrVal,
            0x1D => ReturnCode::Auth2Fail,
            0x1E => ReturnCode::BadTag,
            0x21 => ReturnCode::DecryptError,
            0x22 => ReturnCode::InvalidAuthHandle,
            0x2B => ReturnCode::BadDataSize,
            0x3D => ReturnCode::BadLocality,
            0x803 => ReturnCode::DefendLockRunning,
            _ => return None,
        })
    }
}

/// Capability area for `TPM_GetCapability`
pub const TPM_CAP_VERSION_VAL: u32 = 0x0000001A;

/// Largest `TPM_Seal` payload under a 2048-bit SRK: the OAEP capacity of
/// 214 bytes minus the 65 bytes `TPM_SEALED_DATA` wraps around the data
pub const MAX_SEAL_DATA: usize = 149;

/// Entity type of the storage root key for OSAP
pub const TPM_ET_SRK: u16 = 0x0004;

/// Reserved key handle of the storage root key
pub const TPM_KH_SRK: u32 = 0x40000000;

/// Locality bitmask selecting locality 0 only
pub const TPM_LOC_ZERO: u8 = 0x01;

/// Number of PCRs on a TPM 1.2 part
pub const PCR_COUNT: u32 = 24;

/// SHA1 digest, nonce and auth size
pub const DIGEST_SIZE: usize = 20;
