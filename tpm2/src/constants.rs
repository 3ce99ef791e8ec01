// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 constants and command codes

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCc {
    EvictControl = 0x00000120,
    CreatePrimary = 0x00000131,
    Create = 0x00000153,
    Load = 0x00000157,
    Unseal = 0x0000015E,
    FlushContext = 0x00000165,
    ReadPublic = 0x00000173,
    StartAuthSession = 0x00000176,
    GetCapability = 0x0000017A,
    PcrRead = 0x0000017E,
    PolicyPcr = 0x0000017F,
    PcrExtend = 0x00000182,
    PolicyGetDigest = 0x00000189,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x00000120 => TpmCc::EvictControl,
            0x00000131 => TpmCc::CreatePrimary,
            0x00000153 => TpmCc::Create,
            0x00000157 => TpmCc::Load,
            0x0000015E => TpmCc::Unseal,
            0x00000165 => TpmCc::FlushContext,
            0x00000173 => TpmCc::ReadPublic,
            0x00000176 => TpmCc::StartAuthSession,
            0x0000017A => TpmCc::GetCapability,
            0x0000017E => TpmCc::PcrRead,
            0x0000017F => TpmCc::PolicyPcr,
            0x00000182 => TpmCc::PcrExtend,
            0x00000189 => TpmCc::PolicyGetDigest,
            _ => return None,
        })
    }
}

/// TPM 2.0 Response Codes (TPM_RC), in base form.
///
/// Format-one codes carry the offending handle, session or parameter number
/// in the upper bits; [`TpmRc::from_u32`] strips those before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmRc {
    Success = 0x00000000,
    BadTag = 0x0000001E,
    Initialize = 0x00000100,
    Failure = 0x00000101,
    AuthMissing = 0x00000125,
    PcrChanged = 0x00000128,
    NvDefined = 0x0000014C,
    Integrity = 0x0000009F,
    Value = 0x00000084,
    Handle = 0x0000008B,
    AuthFail = 0x0000008E,
    PolicyFail = 0x0000009D,
    Size = 0x00000095,
    BadAuth = 0x000000A2,
    Lockout = 0x00000921,
}

impl TpmRc {
    /// Format-one flag
    pub const FMT1: u32 = 0x080;
    /// Parameter flag of a format-one code
    pub const P: u32 = 0x040;

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Strip handle/session/parameter numbering from a format-one code
    pub fn base(code: u32) -> u32 {
        if code & Self::FMT1 != 0 {
            code & 0xBF
        } else {
            code
        }
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match Self::base(code) {
            0x00000000 => TpmRc::Success,
            0x0000001E => TpmRc::BadTag,
            0x00000100 => TpmRc::Initialize,
            0x00000101 => TpmRc::Failure,
            0x00000125 => TpmRc::AuthMissing,
            0x00000128 => TpmRc::PcrChanged,
            0x0000014C => TpmRc::NvDefined,
            0x0000009F => TpmRc::Integrity,
            0x00000084 => TpmRc::Value,
            0x0000008B => TpmRc::Handle,
            0x0000008E => TpmRc::AuthFail,
            0x0000009D => TpmRc::PolicyFail,
            0x00000095 => TpmRc::Size,
            0x000000A2 => TpmRc::BadAuth,
            0x00000921 => TpmRc::Lockout,
            _ => return None,
        })
    }

    /// Encode as a format-one error on session `n` (1-based)
    pub fn on_session(self, n: u32) -> u32 {
        self.to_u32() | ((8 + n) << 8)
    }

    /// Encode as a format-one error on handle `n` (1-based)
    pub fn on_handle(self, n: u32) -> u32 {
        self.to_u32() | (n << 8)
    }

    /// Encode as a format-one error on parameter `n` (1-based)
    pub fn on_parameter(self, n: u32) -> u32 {
        self.to_u32() | Self::P | (n << 8)
    }

    pub fn is_success(self) -> bool {
        matches!(self, TpmRc::Success)
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Aes = 0x0006,
    KeyedHash = 0x0008,
    Xor = 0x000A,
    Sha256 = 0x000B,
    Null = 0x0010,
    EcDsa = 0x0018,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Cfb = 0x0043,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0001 => Some(TpmAlgId::Rsa),
            0x0004 => Some(TpmAlgId::Sha1),
            0x0006 => Some(TpmAlgId::Aes),
            0x0008 => Some(TpmAlgId::KeyedHash),
            0x000A => Some(TpmAlgId::Xor),
            0x000B => Some(TpmAlgId::Sha256),
            0x0010 => Some(TpmAlgId::Null),
            0x0018 => Some(TpmAlgId::EcDsa),
            0x0023 => Some(TpmAlgId::Ecc),
            0x0025 => Some(TpmAlgId::SymCipher),
            0x0043 => Some(TpmAlgId::Cfb),
            _ => None,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            _ => 0,
        }
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    /// Password authorization pseudo-session
    pub const PW: u32 = 0x40000009;
}

/// Handle ranges
pub mod tpm_ht {
    pub const TRANSIENT_FIRST: u32 = 0x80000000;
    pub const POLICY_SESSION_FIRST: u32 = 0x03000000;
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }
}

/// TPM 2.0 Capability Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmCap {
    Handles = 0x00000001,
    TpmProperties = 0x00000006,
}

/// TPM_PT property tags
pub mod tpm_pt {
    /// "2.0" as a big-endian u32
    pub const FAMILY_INDICATOR: u32 = 0x00000100;
}

/// Value of `TPM_PT_FAMILY_INDICATOR` on a TPM 2.0 device
pub const TPM2_FAMILY_2_0: u32 = 0x322E3000;

/// Largest sealed-data payload of a keyed-hash object (MAX_SYM_DATA)
pub const MAX_SYM_DATA: usize = 128;

/// TPM 2.0 Object Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaObject(pub u32);

impl TpmaObject {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const ADMIN_WITH_POLICY: u32 = 1 << 7;
    pub const NO_DA: u32 = 1 << 10;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn with_fixed_tpm(mut self) -> Self {
        self.0 |= Self::FIXED_TPM;
        self
    }

    pub fn with_fixed_parent(mut self) -> Self {
        self.0 |= Self::FIXED_PARENT;
        self
    }

    pub fn with_sensitive_data_origin(mut self) -> Self {
        self.0 |= Self::SENSITIVE_DATA_ORIGIN;
        self
    }

    pub fn with_user_with_auth(mut self) -> Self {
        self.0 |= Self::USER_WITH_AUTH;
        self
    }

    pub fn with_admin_with_policy(mut self) -> Self {
        self.0 |= Self::ADMIN_WITH_POLICY;
        self
    }

    pub fn with_no_da(mut self) -> Self {
        self.0 |= Self::NO_DA;
        self
    }

    pub fn with_restricted(mut self) -> Self {
        self.0 |= Self::RESTRICTED;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }
}

/// TPM 2.0 Session Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaSa(pub u8);

impl TpmaSa {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    /// First command parameter is XOR-obfuscated by the caller
    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    /// First response parameter is XOR-obfuscated by the TPM
    pub fn with_encrypt(mut self) -> Self {
        self.0 |= Self::ENCRYPT;
        self
    }
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    /// TPM 1.2 `TPM_TAG_RSP_COMMAND`, returned by 1.2 parts to 2.0 commands
    RspCommand = 0x00C4,
    NoSessions = 0x8001,
    Sessions = 0x8002,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x00C4 => Some(TpmSt::RspCommand),
            _ => None,
        }
    }
}

/// ECC Curve IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmEccCurve {
    None = 0x0000,
    NistP256 = 0x0003,
}

impl TpmEccCurve {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(TpmEccCurve::None),
            0x0003 => Some(TpmEccCurve::NistP256),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rc_base_strips_numbering() {
        assert_eq!(TpmRc::from_u32(0x98E), Some(TpmRc::AuthFail));
        assert_eq!(TpmRc::from_u32(0x9A2), Some(TpmRc::BadAuth));
        assert_eq!(TpmRc::from_u32(0x99D), Some(TpmRc::PolicyFail));
        assert_eq!(TpmRc::from_u32(0x18B), Some(TpmRc::Handle));
        assert_eq!(TpmRc::from_u32(0x921), Some(TpmRc::Lockout));
        assert_eq!(TpmRc::from_u32(0x128), Some(TpmRc::PcrChanged));
        assert_eq!(TpmRc::from_u32(0x12345), None);
    }

    #[test]
    fn test_rc_encoding_helpers() {
        assert_eq!(TpmRc::AuthFail.on_session(1), 0x98E);
        assert_eq!(TpmRc::BadAuth.on_session(1), 0x9A2);
        assert_eq!(TpmRc::Handle.on_handle(1), 0x18B);
        assert_eq!(TpmRc::Value.on_parameter(1), 0x1C4);
    }
}
