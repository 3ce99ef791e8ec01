// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 command handlers

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use tpm12::{
    composite_digest, encrypt_auth, osap_shared_secret, sha1_digest, tag, Digest20, Ordinal,
    PcrInfoLong, ReturnCode, StoredData12, DIGEST_SIZE, MAX_SEAL_DATA, TPM_ET_SRK, TPM_KH_SRK,
    TPM_LOC_ZERO,
};
use tpm2::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
use tracing::debug;
use zeroize::Zeroizing;

use crate::State as Device;

type HmacSha1 = Hmac<Sha1>;

/// Size of one command auth block: handle, nonceOdd, continueAuthSession, auth
const COMMAND_AUTH_SIZE: usize = 4 + DIGEST_SIZE + 1 + DIGEST_SIZE;
const FIRST_AUTH_HANDLE: u32 = 0x0200_0000;
/// `et` of a sealed blob
const SEALED_ENTITY_TYPE: u16 = 0x0000;

#[derive(Debug)]
struct Rc(u32);

impl From<anyhow::Error> for Rc {
    fn from(_: anyhow::Error) -> Self {
        Rc(ReturnCode::BadParameter.to_u32())
    }
}

impl From<ReturnCode> for Rc {
    fn from(code: ReturnCode) -> Self {
        Rc(code.to_u32())
    }
}

type Handled<T> = std::result::Result<T, Rc>;

fn fresh_nonce() -> Digest20 {
    rand::random()
}

fn new_mac(key: &[u8]) -> HmacSha1 {
    <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC can take key of any size")
}

enum SessionKind {
    Oiap,
    Osap { shared: Zeroizing<Digest20> },
}

struct Session {
    kind: SessionKind,
    nonce_even: Digest20,
}

/// TPM 1.2 side of the simulated device
#[derive(Default)]
pub(crate) struct State {
    srk_auth: Digest20,
    sessions: BTreeMap<u32, Session>,
    next_handle: u32,
}

impl State {
    pub(crate) fn new(srk_auth: Digest20) -> Self {
        Self {
            srk_auth,
            ..Default::default()
        }
    }

    pub(crate) fn close_channel(&mut self) {
        self.sessions.clear();
    }

    pub(crate) fn loaded_handles(&self) -> usize {
        self.sessions.len()
    }

    fn open(&mut self, kind: SessionKind) -> (u32, Digest20) {
        let handle = FIRST_AUTH_HANDLE + self.next_handle;
        self.next_handle += 1;
        let nonce_even = fresh_nonce();
        self.sessions.insert(handle, Session { kind, nonce_even });
        (handle, nonce_even)
    }
}

struct CommandAuth {
    handle: u32,
    nonce_odd: Digest20,
    continue_session: bool,
    auth: Digest20,
}

impl CommandAuth {
    fn parse(data: &[u8]) -> Handled<Self> {
        let mut buf = ResponseBuffer::new(data);
        Ok(Self {
            handle: buf.get_u32()?,
            nonce_odd: buf.get_array()?,
            continue_session: buf.get_u8()? != 0,
            auth: buf.get_array()?,
        })
    }

    /// Check the caller's HMAC and take the session out of the table
    fn verify(
        &self,
        sessions: &mut BTreeMap<u32, Session>,
        key: impl FnOnce(&Session) -> Option<Zeroizing<Digest20>>,
        in_digest: &Digest20,
        failure: ReturnCode,
    ) -> Handled<(Session, Zeroizing<Digest20>)> {
        let session = sessions
            .remove(&self.handle)
            .ok_or(Rc::from(ReturnCode::InvalidAuthHandle))?;
        let key = key(&session).ok_or(Rc::from(ReturnCode::InvalidAuthHandle))?;
        let mut mac = new_mac(&key[..]);
        mac.update(in_digest);
        mac.update(&session.nonce_even);
        mac.update(&self.nonce_odd);
        mac.update(&[self.continue_session as u8]);
        mac.verify_slice(&self.auth)
            .map_err(|_| Rc::from(failure))?;
        Ok((session, key))
    }

    /// Response auth block; the session goes back into the table if the
    /// caller asked to keep it
    fn respond(
        &self,
        sessions: &mut BTreeMap<u32, Session>,
        mut session: Session,
        key: &Digest20,
        out_digest: &Digest20,
        out: &mut CommandBuffer,
    ) {
        let nonce_even = fresh_nonce();
        let mut mac = new_mac(key);
        mac.update(out_digest);
        mac.update(&nonce_even);
        mac.update(&self.nonce_odd);
        mac.update(&[self.continue_session as u8]);
        out.put_bytes(&nonce_even);
        out.put_u8(self.continue_session as u8);
        out.put_bytes(&mac.finalize().into_bytes());
        if self.continue_session {
            session.nonce_even = nonce_even;
            sessions.insert(self.handle, session);
        }
    }
}

/// Split a command body into parameters and `count` trailing auth blocks
fn split_auth(body: &[u8], count: usize) -> Handled<(&[u8], Vec<CommandAuth>)> {
    let auth_len = count * COMMAND_AUTH_SIZE;
    if body.len() < auth_len {
        return Err(ReturnCode::BadParameter.into());
    }
    let (params, auths) = body.split_at(body.len() - auth_len);
    let auths = auths
        .chunks(COMMAND_AUTH_SIZE)
        .map(CommandAuth::parse)
        .collect::<Handled<Vec<_>>>()?;
    Ok((params, auths))
}

fn response(tag: u16, return_code: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = CommandBuffer::new();
    buf.put_u16(tag);
    buf.put_u32((10 + body.len()) as u32);
    buf.put_u32(return_code);
    buf.put_bytes(body);
    buf.into_vec()
}

/// Reply to a command framed for the other TPM generation
pub(crate) fn bad_tag() -> Vec<u8> {
    response(tag::RSP_COMMAND, ReturnCode::BadTag.to_u32(), &[])
}

fn out_digest(ordinal: Ordinal, out: &[u8]) -> Digest20 {
    sha1_digest(&[&0u32.to_be_bytes(), &ordinal.to_u32().to_be_bytes(), out])
}

fn live_composite(device: &Device, info: &PcrInfoLong, creation: bool) -> Digest20 {
    let selection = if creation {
        &info.creation_pcr_selection
    } else {
        &info.release_pcr_selection
    };
    let values: Vec<Digest20> = selection
        .indices()
        .into_iter()
        .map(|i| device.pcr_sha1[i as usize])
        .collect();
    // indices come from the selection itself, so the counts always agree
    composite_digest(selection, &values).unwrap_or_default()
}

/// paramSize and ordinal of a command header
fn parse_header(command: &[u8]) -> anyhow::Result<(u32, u32)> {
    let mut buf = ResponseBuffer::new(command);
    let _tag = buf.get_u16()?;
    let size = buf.get_u32()?;
    Ok((size, buf.get_u32()?))
}

pub(crate) fn execute(device: &mut Device, command: &[u8]) -> Vec<u8> {
    let Ok((size, ordinal)) = parse_header(command) else {
        return bad_tag();
    };
    if size as usize != command.len() {
        return response(tag::RSP_COMMAND, ReturnCode::BadParameter.to_u32(), &[]);
    }
    let body = &command[10..];
    let result = match Ordinal::from_u32(ordinal) {
        Some(Ordinal::GetCapability) => get_capability(body),
        Some(Ordinal::Oiap) => Ok(oiap(device)),
        Some(Ordinal::Osap) => osap(device, body),
        Some(Ordinal::PcrRead) => pcr_read(device, body),
        Some(Ordinal::Extend) => extend(device, body),
        Some(Ordinal::Seal) => seal(device, body),
        Some(Ordinal::Unseal) => unseal(device, body),
        None => Err(ReturnCode::BadOrdinal.into()),
    };
    match result {
        Ok((rsp_tag, out)) => response(rsp_tag, 0, &out),
        Err(Rc(code)) => {
            debug!("simulated TPM 1.2 ordinal 0x{:x} failed with 0x{:x}", ordinal, code);
            response(tag::RSP_COMMAND, code, &[])
        }
    }
}

type Output = Handled<(u16, Vec<u8>)>;

fn get_capability(body: &[u8]) -> Output {
    let mut buf = ResponseBuffer::new(body);
    let area = buf.get_u32()?;
    let _sub_cap = buf.get_sized_u32()?;
    if area != tpm12::TPM_CAP_VERSION_VAL {
        return Err(ReturnCode::BadParameter.into());
    }
    let mut info = CommandBuffer::new();
    info.put_u16(tag::CAP_VERSION_INFO);
    // major, minor, revMajor, revMinor
    info.put_bytes(&[1, 2, 8, 0]);
    // specLevel, errataRev, vendor ID, no vendor data
    info.put_u16(2);
    info.put_u8(3);
    info.put_bytes(b"SIM\0");
    info.put_u16(0);
    let mut out = CommandBuffer::new();
    out.put_sized_u32(info.as_bytes());
    Ok((tag::RSP_COMMAND, out.into_vec()))
}

fn oiap(device: &mut Device) -> (u16, Vec<u8>) {
    let (handle, nonce_even) = device.tpm12.open(SessionKind::Oiap);
    let mut out = CommandBuffer::new();
    out.put_u32(handle);
    out.put_bytes(&nonce_even);
    (tag::RSP_COMMAND, out.into_vec())
}

fn osap(device: &mut Device, body: &[u8]) -> Output {
    let mut buf = ResponseBuffer::new(body);
    let entity_type = buf.get_u16()?;
    let entity_value = buf.get_u32()?;
    let nonce_odd_osap: Digest20 = buf.get_array()?;
    if entity_type != TPM_ET_SRK || entity_value != TPM_KH_SRK {
        return Err(ReturnCode::InvalidKeyHandle.into());
    }

    let nonce_even_osap = fresh_nonce();
    let shared = osap_shared_secret(&device.tpm12.srk_auth, &nonce_even_osap, &nonce_odd_osap);
    let (handle, nonce_even) = device.tpm12.open(SessionKind::Osap { shared });
    let mut out = CommandBuffer::new();
    out.put_u32(handle);
    out.put_bytes(&nonce_even);
    out.put_bytes(&nonce_even_osap);
    Ok((tag::RSP_COMMAND, out.into_vec()))
}

fn pcr_index(buf: &mut ResponseBuffer) -> Handled<usize> {
    let index = buf.get_u32()? as usize;
    if index >= crate::PCR_COUNT {
        return Err(ReturnCode::BadIndex.into());
    }
    Ok(index)
}

fn pcr_read(device: &Device, body: &[u8]) -> Output {
    let index = pcr_index(&mut ResponseBuffer::new(body))?;
    Ok((tag::RSP_COMMAND, device.pcr_sha1[index].to_vec()))
}

fn extend(device: &mut Device, body: &[u8]) -> Output {
    let mut buf = ResponseBuffer::new(body);
    let index = pcr_index(&mut buf)?;
    let digest: Digest20 = buf.get_array()?;
    device.extend_sha1(index, &digest);
    Ok((tag::RSP_COMMAND, device.pcr_sha1[index].to_vec()))
}

fn seal(device: &mut Device, body: &[u8]) -> Output {
    let (params, auths) = split_auth(body, 1)?;
    let mut buf = ResponseBuffer::new(params);
    if buf.get_u32()? != TPM_KH_SRK {
        return Err(ReturnCode::InvalidKeyHandle.into());
    }
    let enc_auth: Digest20 = buf.get_array()?;
    let pcr_info = buf.get_sized_u32()?;
    let data = Zeroizing::new(buf.get_sized_u32()?);
    buf.finish()?;

    let in_digest = sha1_digest(&[&Ordinal::Seal.to_u32().to_be_bytes(), &params[4..]]);
    let auth = &auths[0];
    let (session, shared) = auth.verify(
        &mut device.tpm12.sessions,
        |s| match &s.kind {
            SessionKind::Osap { shared } => Some(shared.clone()),
            SessionKind::Oiap => None,
        },
        &in_digest,
        ReturnCode::AuthFail,
    )?;
    if data.len() > MAX_SEAL_DATA {
        return Err(ReturnCode::BadDataSize.into());
    }
    let data_auth = Zeroizing::new(encrypt_auth(&shared, &session.nonce_even, &enc_auth));

    let mut seal_info = Vec::new();
    if !pcr_info.is_empty() {
        let mut info = PcrInfoLong::from_bytes(&pcr_info)?;
        info.digest_at_creation = live_composite(device, &info, true);
        seal_info = info.to_bytes();
    }
    let mut plaintext = Zeroizing::new(data_auth.to_vec());
    plaintext.extend_from_slice(&data);
    let enc_data = device
        .blob_key
        .seal(&seal_info, &plaintext)
        .map_err(|_| Rc(ReturnCode::Resources.to_u32()))?;

    let stored = StoredData12 {
        entity_type: SEALED_ENTITY_TYPE,
        seal_info,
        enc_data,
    }
    .to_bytes();
    let mut out = CommandBuffer::new();
    out.put_bytes(&stored);
    auth.respond(
        &mut device.tpm12.sessions,
        session,
        &shared,
        &out_digest(Ordinal::Seal, &stored),
        &mut out,
    );
    Ok((tag::RSP_AUTH1_COMMAND, out.into_vec()))
}

fn unseal(device: &mut Device, body: &[u8]) -> Output {
    let (params, auths) = split_auth(body, 2)?;
    let mut buf = ResponseBuffer::new(params);
    if buf.get_u32()? != TPM_KH_SRK {
        return Err(ReturnCode::InvalidKeyHandle.into());
    }
    let stored = StoredData12::unmarshal(&mut buf)?;
    buf.finish()?;
    let in_digest = sha1_digest(&[&Ordinal::Unseal.to_u32().to_be_bytes(), &params[4..]]);

    let srk_auth = Zeroizing::new(device.tpm12.srk_auth);
    let oiap_key = |key: &Zeroizing<Digest20>| {
        let key = key.clone();
        move |s: &Session| matches!(s.kind, SessionKind::Oiap).then_some(key)
    };
    let verified = auths[0].verify(
        &mut device.tpm12.sessions,
        oiap_key(&srk_auth),
        &in_digest,
        ReturnCode::AuthFail,
    );
    let (srk_session, srk_key) = match verified {
        Ok(verified) => verified,
        Err(err) => {
            device.tpm12.sessions.remove(&auths[1].handle);
            return Err(err);
        }
    };

    let plaintext = match device.blob_key.open(&stored.seal_info, &stored.enc_data) {
        Ok(plaintext) if plaintext.len() >= DIGEST_SIZE => plaintext,
        _ => {
            device.tpm12.sessions.remove(&auths[1].handle);
            return Err(ReturnCode::DecryptError.into());
        }
    };
    let mut data_auth = Zeroizing::new([0u8; DIGEST_SIZE]);
    data_auth.copy_from_slice(&plaintext[..DIGEST_SIZE]);
    let (data_session, data_key) = auths[1].verify(
        &mut device.tpm12.sessions,
        oiap_key(&data_auth),
        &in_digest,
        ReturnCode::Auth2Fail,
    )?;

    if !stored.seal_info.is_empty() {
        let info = stored.pcr_info()?;
        if info.locality_at_release & TPM_LOC_ZERO == 0 {
            return Err(ReturnCode::BadLocality.into());
        }
        if live_composite(device, &info, false) != info.digest_at_release {
            return Err(ReturnCode::WrongPcrVal.into());
        }
    }

    let mut out = CommandBuffer::new();
    out.put_sized_u32(&plaintext[DIGEST_SIZE..]);
    let digest = out_digest(Ordinal::Unseal, out.as_bytes());
    auths[0].respond(
        &mut device.tpm12.sessions,
        srk_session,
        &srk_key,
        &digest,
        &mut out,
    );
    auths[1].respond(
        &mut device.tpm12.sessions,
        data_session,
        &data_key,
        &digest,
        &mut out,
    );
    Ok((tag::RSP_AUTH2_COMMAND, out.into_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TpmSimulator;
    use tpm12::{PcrSelection12, ReturnCodeError, Tpm12Context};

    const SRK_AUTH: Digest20 = [0x5a; 20];

    fn context() -> Tpm12Context<TpmSimulator> {
        Tpm12Context::from_transport(TpmSimulator::tpm12(SRK_AUTH).unwrap())
    }

    fn return_code(err: &anyhow::Error) -> Option<ReturnCode> {
        err.downcast_ref::<ReturnCodeError>()
            .and_then(|e| e.return_code())
    }

    fn release_policy(tpm: &mut Tpm12Context<TpmSimulator>, pcrs: &[u32]) -> PcrInfoLong {
        let selection = PcrSelection12::new(pcrs).unwrap();
        let values = tpm.pcr_read_many(&selection.indices()).unwrap();
        PcrInfoLong::for_release(selection, composite_digest(&selection, &values).unwrap())
    }

    #[test]
    fn test_version() {
        assert_eq!(context().get_version().unwrap(), (1, 2));
    }

    #[test]
    fn test_extend_and_read() {
        let mut tpm = context();
        assert_eq!(tpm.pcr_read(3).unwrap(), [0; 20]);
        let value = tpm.extend(3, &[0x11; 20]).unwrap();
        assert_eq!(value, sha1_digest(&[&[0; 20], &[0x11; 20]]));
        assert_eq!(tpm.pcr_read(3).unwrap(), value);

        let err = tpm.pcr_read(24).unwrap_err();
        assert_eq!(return_code(&err), Some(ReturnCode::BadIndex));
    }

    #[test]
    fn test_seal_unseal() {
        let mut tpm = context();
        let policy = release_policy(&mut tpm, &[0, 2]);
        let stored = tpm
            .seal(&SRK_AUTH, &[7; 20], &policy, b"sealed bytes")
            .unwrap();
        let secret = tpm.unseal(&SRK_AUTH, &[7; 20], &stored).unwrap();
        assert_eq!(&secret[..], b"sealed bytes");
        assert_eq!(tpm.transport_mut().control().loaded_handles(), 0);
    }

    #[test]
    fn test_seal_enforces_payload_limit() {
        let mut tpm = context();
        let policy = release_policy(&mut tpm, &[0]);
        let stored = tpm
            .seal(&SRK_AUTH, &[7; 20], &policy, &[1; MAX_SEAL_DATA])
            .unwrap();
        let secret = tpm.unseal(&SRK_AUTH, &[7; 20], &stored).unwrap();
        assert_eq!(secret.len(), MAX_SEAL_DATA);

        let err = tpm
            .seal(&SRK_AUTH, &[7; 20], &policy, &[1; MAX_SEAL_DATA + 1])
            .unwrap_err();
        assert_eq!(return_code(&err), Some(ReturnCode::BadDataSize));
        assert_eq!(tpm.transport_mut().control().loaded_handles(), 0);
    }

    #[test]
    fn test_auth_failures() {
        let mut tpm = context();
        let policy = release_policy(&mut tpm, &[1]);
        let err = tpm
            .seal(&[0; 20], &[7; 20], &policy, b"x")
            .unwrap_err();
        assert_eq!(return_code(&err), Some(ReturnCode::AuthFail));

        let stored = tpm.seal(&SRK_AUTH, &[7; 20], &policy, b"x").unwrap();
        let err = tpm.unseal(&[0; 20], &[7; 20], &stored).unwrap_err();
        assert_eq!(return_code(&err), Some(ReturnCode::AuthFail));
        let err = tpm.unseal(&SRK_AUTH, &[8; 20], &stored).unwrap_err();
        assert_eq!(return_code(&err), Some(ReturnCode::Auth2Fail));
        assert_eq!(tpm.transport_mut().control().loaded_handles(), 0);
    }

    #[test]
    fn test_release_checks() {
        let mut tpm = context();
        let policy = release_policy(&mut tpm, &[5]);
        let stored = tpm.seal(&SRK_AUTH, &[7; 20], &policy, b"x").unwrap();
        tpm.extend(5, &[1; 20]).unwrap();
        let err = tpm.unseal(&SRK_AUTH, &[7; 20], &stored).unwrap_err();
        assert_eq!(return_code(&err), Some(ReturnCode::WrongPcrVal));

        let mut remote = policy.clone();
        remote.locality_at_release = 0x02;
        let stored = tpm.seal(&SRK_AUTH, &[7; 20], &remote, b"x").unwrap();
        let err = tpm.unseal(&SRK_AUTH, &[7; 20], &stored).unwrap_err();
        assert_eq!(return_code(&err), Some(ReturnCode::BadLocality));
    }

    #[test]
    fn test_tampered_blob() {
        let mut tpm = context();
        let policy = release_policy(&mut tpm, &[0]);
        let stored = tpm.seal(&SRK_AUTH, &[7; 20], &policy, b"x").unwrap();
        let mut parsed = StoredData12::from_bytes(&stored).unwrap();
        let last = parsed.enc_data.len() - 1;
        parsed.enc_data[last] ^= 1;
        let err = tpm
            .unseal(&SRK_AUTH, &[7; 20], &parsed.to_bytes())
            .unwrap_err();
        assert_eq!(return_code(&err), Some(ReturnCode::DecryptError));
    }
}
