// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 data types

use anyhow::{anyhow, bail, Result};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::constants::*;
use super::marshal::*;

fn alg(buf: &mut ResponseBuffer) -> Result<TpmAlgId> {
    let raw = buf.get_u16()?;
    TpmAlgId::from_u16(raw).ok_or_else(|| anyhow!("unknown algorithm: 0x{:04x}", raw))
}

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    /// Bitmap of selected PCRs
    pub pcr_select: Vec<u8>,
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // at least 3 bytes for PCR 0-23
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];

        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }

        Self { hash, pcr_select }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha256, pcrs)
    }

    /// Selected indices in ascending order
    pub fn indices(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (byte_idx, &byte) in self.pcr_select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    out.push((byte_idx * 8 + bit) as u32);
                }
            }
        }
        out
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = alg(buf)?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pcr_selections
            .iter()
            .all(|s| s.pcr_select.iter().all(|b| *b == 0))
    }

    /// (bank, index) pairs in marshalling order
    pub fn entries(&self) -> Vec<(TpmAlgId, u32)> {
        self.pcr_selections
            .iter()
            .flat_map(|s| s.indices().into_iter().map(move |i| (s.hash, i)))
            .collect()
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > 16 {
            bail!("too many PCR selections: {}", count);
        }
        let mut pcr_selections = Vec::with_capacity(count);
        for _ in 0..count {
            pcr_selections.push(TpmsPcrSelection::unmarshal(buf)?);
        }
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for d in &self.digests {
            d.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > 8 {
            bail!("too many digests in list: {}", count);
        }
        let mut digests = Vec::with_capacity(count);
        for _ in 0..count {
            digests.push(Tpm2bDigest::unmarshal(buf)?);
        }
        Ok(Self { digests })
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm definition
///
/// For `TPM_ALG_XOR` the key-bits field carries the hash algorithm and no mode
/// follows on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }

    /// XOR parameter obfuscation keyed through `hash`
    pub fn xor(hash: TpmAlgId) -> Self {
        Self {
            algorithm: TpmAlgId::Xor,
            key_bits: hash.to_u16(),
            mode: TpmAlgId::Null,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        match self.algorithm {
            TpmAlgId::Null => {}
            TpmAlgId::Xor => buf.put_u16(self.key_bits),
            _ => {
                buf.put_u16(self.key_bits);
                buf.put_u16(self.mode.to_u16());
            }
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = alg(buf)?;
        match algorithm {
            TpmAlgId::Null => Ok(Self::null()),
            TpmAlgId::Xor => Ok(Self::xor(alg(buf)?)),
            _ => {
                let key_bits = buf.get_u16()?;
                let mode = alg(buf)?;
                Ok(Self {
                    algorithm,
                    key_bits,
                    mode,
                })
            }
        }
    }
}

/// TPMT_SYM_DEF_OBJECT - Symmetric definition for objects
pub type TpmtSymDefObject = TpmtSymDef;

/// TPMT_ECC_SCHEME - ECC signature scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtEccScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

impl TpmtEccScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }
}

impl Marshal for TpmtEccScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

impl Unmarshal for TpmtEccScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = alg(buf)?;
        let hash_alg = match scheme {
            TpmAlgId::Null => None,
            _ => Some(alg(buf)?),
        };
        Ok(Self { scheme, hash_alg })
    }
}

/// TPMS_ECC_PARMS - ECC key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtEccScheme,
    pub curve_id: TpmEccCurve,
    pub kdf: TpmAlgId,
}

impl TpmsEccParms {
    pub fn storage_key() -> Self {
        Self {
            symmetric: TpmtSymDef::aes_128_cfb(),
            scheme: TpmtEccScheme::null(),
            curve_id: TpmEccCurve::NistP256,
            kdf: TpmAlgId::Null,
        }
    }
}

impl Marshal for TpmsEccParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.curve_id.to_u16());
        // KDF scheme, NULL carries no details
        buf.put_u16(self.kdf.to_u16());
    }
}

impl Unmarshal for TpmsEccParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let scheme = TpmtEccScheme::unmarshal(buf)?;
        let curve_raw = buf.get_u16()?;
        let curve_id = TpmEccCurve::from_u16(curve_raw)
            .ok_or_else(|| anyhow!("unsupported ECC curve: 0x{:04x}", curve_raw))?;
        let kdf = alg(buf)?;
        if kdf != TpmAlgId::Null {
            bail!("unsupported ECC KDF scheme: {:?}", kdf);
        }
        Ok(Self {
            symmetric,
            scheme,
            curve_id,
            kdf,
        })
    }
}

/// TPMS_KEYEDHASH_PARMS - Keyed hash parameters (for sealed data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsKeyedHashParms {
    pub scheme: TpmAlgId,
}

impl TpmsKeyedHashParms {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
        }
    }
}

impl Marshal for TpmsKeyedHashParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
    }
}

impl Unmarshal for TpmsKeyedHashParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = alg(buf)?;
        if scheme != TpmAlgId::Null {
            bail!("unsupported keyed-hash scheme: {:?}", scheme);
        }
        Ok(Self { scheme })
    }
}

/// TPMU_PUBLIC_PARMS - Public parameters union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Ecc(TpmsEccParms),
    KeyedHash(TpmsKeyedHashParms),
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicParms::Ecc(p) => p.marshal(buf),
            TpmtPublicParms::KeyedHash(p) => p.marshal(buf),
        }
    }
}

/// TPMU_PUBLIC_ID - Unique identifier union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicUnique {
    /// TPMS_ECC_POINT (x, y)
    Ecc(Vec<u8>, Vec<u8>),
    /// TPM2B_DIGEST
    KeyedHash(Vec<u8>),
}

impl Marshal for TpmtPublicUnique {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicUnique::Ecc(x, y) => {
                buf.put_tpm2b(x);
                buf.put_tpm2b(y);
            }
            TpmtPublicUnique::KeyedHash(d) => buf.put_tpm2b(d),
        }
    }
}

/// TPMT_PUBLIC - Public area template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

impl TpmtPublic {
    /// ECC P-256 storage root key template with a zero unique point
    pub fn ecc_storage_key() -> Self {
        Self {
            type_alg: TpmAlgId::Ecc,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_sensitive_data_origin()
                .with_user_with_auth()
                .with_no_da()
                .with_restricted()
                .with_decrypt(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::Ecc(TpmsEccParms::storage_key()),
            unique: TpmtPublicUnique::Ecc(vec![0u8; 32], vec![0u8; 32]),
        }
    }

    /// Sealed data object usable only through `policy_digest`
    pub fn sealed_object(policy_digest: Tpm2bDigest) -> Self {
        Self {
            type_alg: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new()
                .with_fixed_tpm()
                .with_fixed_parent()
                .with_admin_with_policy(),
            auth_policy: policy_digest,
            parameters: TpmtPublicParms::KeyedHash(TpmsKeyedHashParms::null()),
            unique: TpmtPublicUnique::KeyedHash(Vec::new()),
        }
    }

    /// Object name: nameAlg || SHA256(TPMT_PUBLIC)
    pub fn name(&self) -> Vec<u8> {
        object_name(&self.to_bytes())
    }

    /// Compare everything except the unique field, which the TPM fills in
    pub fn matches_template(&self, template: &TpmtPublic) -> bool {
        self.type_alg == template.type_alg
            && self.name_alg == template.name_alg
            && self.object_attributes == template.object_attributes
            && self.auth_policy == template.auth_policy
            && self.parameters == template.parameters
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = alg(buf)?;
        let name_alg = alg(buf)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let (parameters, unique) = match type_alg {
            TpmAlgId::Ecc => {
                let parms = TpmsEccParms::unmarshal(buf)?;
                let x = buf.get_tpm2b()?;
                let y = buf.get_tpm2b()?;
                (TpmtPublicParms::Ecc(parms), TpmtPublicUnique::Ecc(x, y))
            }
            TpmAlgId::KeyedHash => {
                let parms = TpmsKeyedHashParms::unmarshal(buf)?;
                let unique = buf.get_tpm2b()?;
                (
                    TpmtPublicParms::KeyedHash(parms),
                    TpmtPublicUnique::KeyedHash(unique),
                )
            }
            other => bail!("unsupported public area type: {:?}", other),
        };
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// Name of an object given its marshalled TPMT_PUBLIC
pub fn object_name(public_area: &[u8]) -> Vec<u8> {
    let mut name = TpmAlgId::Sha256.to_u16().to_be_bytes().to_vec();
    name.extend_from_slice(&Sha256::digest(public_area));
    name
}

/// TPM2B_PUBLIC - Public area with size prefix
#[derive(Debug, Clone)]
pub struct Tpm2bPublic {
    /// Raw marshalled TPMT_PUBLIC
    pub public_area: Vec<u8>,
}

impl Tpm2bPublic {
    pub fn from_template(template: &TpmtPublic) -> Self {
        Self {
            public_area: template.to_bytes(),
        }
    }

    pub fn parse(&self) -> Result<TpmtPublic> {
        TpmtPublic::from_bytes(&self.public_area)
    }
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.public_area);
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let public_area = buf.get_tpm2b()?;
        Ok(Self { public_area })
    }
}

/// TPM2B_PRIVATE - Private area
#[derive(Debug, Clone)]
pub struct Tpm2bPrivate {
    pub buffer: Vec<u8>,
}

impl Tpm2bPrivate {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }
}

impl Marshal for Tpm2bPrivate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bPrivate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_SENSITIVE_CREATE - Inner sensitive create structure
#[derive(Clone, Default)]
pub struct TpmsSensitiveCreate {
    pub user_auth: Zeroizing<Vec<u8>>,
    pub data: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for TpmsSensitiveCreate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmsSensitiveCreate")
            .field("user_auth_len", &self.user_auth.len())
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// TPM2B_SENSITIVE_CREATE - Sensitive data for object creation
#[derive(Debug, Clone, Default)]
pub struct Tpm2bSensitiveCreate {
    pub sensitive: TpmsSensitiveCreate,
}

impl Tpm2bSensitiveCreate {
    pub fn new(user_auth: &[u8], data: &[u8]) -> Self {
        Self {
            sensitive: TpmsSensitiveCreate {
                user_auth: Zeroizing::new(user_auth.to_vec()),
                data: Zeroizing::new(data.to_vec()),
            },
        }
    }

    /// Sealed-data payload with an empty `userAuth`; the object is released
    /// through its policy only
    pub fn with_data(data: &[u8]) -> Self {
        Self::new(&[], data)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Size of the inner structure for a sealed payload of `data_len` bytes
    /// with an empty user auth
    pub fn inner_len(data_len: usize) -> usize {
        2 + 2 + data_len
    }
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        let mut inner = CommandBuffer::new();
        inner.put_tpm2b(&self.sensitive.user_auth);
        inner.put_tpm2b(&self.sensitive.data);
        buf.put_tpm2b(&Zeroizing::new(inner.into_vec()));
    }
}

impl Unmarshal for Tpm2bSensitiveCreate {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let inner = buf.get_tpm2b()?;
        let mut inner = ResponseBuffer::new(&inner);
        let user_auth = Zeroizing::new(inner.get_tpm2b()?);
        let data = Zeroizing::new(inner.get_tpm2b()?);
        inner.finish()?;
        Ok(Self {
            sensitive: TpmsSensitiveCreate { user_auth, data },
        })
    }
}

/// TPMT_HA - Hash value with algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtHa {
    pub hash_alg: TpmAlgId,
    pub digest: Vec<u8>,
}

impl TpmtHa {
    pub fn sha256(digest: Vec<u8>) -> Self {
        Self {
            hash_alg: TpmAlgId::Sha256,
            digest,
        }
    }
}

impl Marshal for TpmtHa {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_bytes(&self.digest);
    }
}

impl Unmarshal for TpmtHa {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = alg(buf)?;
        let size = hash_alg.digest_size();
        if size == 0 {
            bail!("not a hash algorithm: {:?}", hash_alg);
        }
        Ok(Self {
            hash_alg,
            digest: buf.get_bytes(size)?,
        })
    }
}

/// TPML_DIGEST_VALUES - List of digest values for PCR extend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmlDigestValues {
    pub digests: Vec<TpmtHa>,
}

impl TpmlDigestValues {
    pub fn single(digest: TpmtHa) -> Self {
        Self {
            digests: vec![digest],
        }
    }
}

impl Marshal for TpmlDigestValues {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for d in &self.digests {
            d.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlDigestValues {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > 8 {
            bail!("too many digest values: {}", count);
        }
        let mut digests = Vec::with_capacity(count);
        for _ in 0..count {
            digests.push(TpmtHa::unmarshal(buf)?);
        }
        Ok(Self { digests })
    }
}

/// TPMS_AUTH_COMMAND - One entry of a command authorization area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsAuthCommand {
    pub session_handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Vec<u8>,
}

impl TpmsAuthCommand {
    /// Password authorization with the given auth value
    pub fn password(auth: &[u8]) -> Self {
        Self {
            session_handle: tpm_rh::PW,
            nonce: Vec::new(),
            attributes: TpmaSa::new(),
            hmac: auth.to_vec(),
        }
    }
}

impl Marshal for TpmsAuthCommand {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.session_handle);
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

impl Unmarshal for TpmsAuthCommand {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            session_handle: buf.get_u32()?,
            nonce: buf.get_tpm2b()?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: buf.get_tpm2b()?,
        })
    }
}

/// TPMS_AUTH_RESPONSE - One entry of a response authorization area
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmsAuthResponse {
    pub nonce: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Vec<u8>,
}

impl Marshal for TpmsAuthResponse {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

impl Unmarshal for TpmsAuthResponse {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce: buf.get_tpm2b()?,
            attributes: TpmaSa(buf.get_u8()?),
            hmac: buf.get_tpm2b()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcr_selection_bitmap() {
        let sel = TpmsPcrSelection::sha256(&[0, 1, 2, 7]);
        assert_eq!(sel.hash, TpmAlgId::Sha256);
        // PCR 0, 1, 2, 7 = bits 0, 1, 2, 7 = 0b10000111 = 0x87
        assert_eq!(sel.pcr_select, vec![0x87, 0x00, 0x00]);
        assert_eq!(sel.indices(), vec![0, 1, 2, 7]);

        let high = TpmsPcrSelection::sha256(&[23]);
        assert_eq!(high.pcr_select, vec![0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_storage_key_roundtrip_and_match() {
        let template = TpmtPublic::ecc_storage_key();
        let bytes = template.to_bytes();
        let parsed = TpmtPublic::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, template);

        let mut created = parsed.clone();
        created.unique = TpmtPublicUnique::Ecc(vec![7; 32], vec![9; 32]);
        assert!(created.matches_template(&template));
        assert_ne!(created.name(), template.name());

        let mut other = created;
        other.object_attributes = TpmaObject::new().with_decrypt();
        assert!(!other.matches_template(&template));
    }

    #[test]
    fn test_sealed_object_attributes() {
        let template = TpmtPublic::sealed_object(Tpm2bDigest::new(vec![1; 32]));
        let attrs = template.object_attributes;
        assert!(attrs.contains(TpmaObject::ADMIN_WITH_POLICY));
        assert!(!attrs.contains(TpmaObject::USER_WITH_AUTH));
        assert!(!attrs.contains(TpmaObject::SENSITIVE_DATA_ORIGIN));
        let parsed = TpmtPublic::from_bytes(&template.to_bytes()).unwrap();
        assert_eq!(parsed.auth_policy.buffer, vec![1; 32]);
    }

    #[test]
    fn test_xor_symdef_wire_format() {
        let bytes = TpmtSymDef::xor(TpmAlgId::Sha256).to_bytes();
        assert_eq!(bytes, vec![0x00, 0x0A, 0x00, 0x0B]);
        assert_eq!(
            TpmtSymDef::from_bytes(&bytes).unwrap(),
            TpmtSymDef::xor(TpmAlgId::Sha256)
        );
        assert_eq!(TpmtSymDef::null().to_bytes(), vec![0x00, 0x10]);
    }

    #[test]
    fn test_sensitive_create_layout() {
        let sc = Tpm2bSensitiveCreate::with_data(b"abc");
        let bytes = sc.to_bytes();
        assert_eq!(bytes, vec![0, 7, 0, 0, 0, 3, b'a', b'b', b'c']);
        assert_eq!(Tpm2bSensitiveCreate::inner_len(3), 7);
        let parsed = Tpm2bSensitiveCreate::from_bytes(&bytes).unwrap();
        assert!(parsed.sensitive.user_auth.is_empty());
        assert_eq!(&parsed.sensitive.data[..], b"abc");

        let sc = Tpm2bSensitiveCreate::new(b"pw", b"abc");
        let parsed = Tpm2bSensitiveCreate::from_bytes(&sc.to_bytes()).unwrap();
        assert_eq!(&parsed.sensitive.user_auth[..], b"pw");
        assert_eq!(
            format!("{:?}", parsed.sensitive),
            "TpmsSensitiveCreate { user_auth_len: 2, data_len: 3 }"
        );
    }
}
