// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command handlers

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use tpm2::kdf::{kdfa, verify_hmac_sha256, hmac_sha256, xor_in_place, xor_mask, LABEL_SESSION_KEY};
use tpm2::{
    cp_hash, object_name, pcr_values_digest, policy_pcr_digest, rp_hash, tpm_ht, tpm_pt, tpm_rh,
    CommandBuffer, Marshal, ResponseBuffer, Tpm2bDigest, Tpm2bPublic, Tpm2bSensitiveCreate,
    TpmAlgId, TpmCap, TpmCc, TpmRc, TpmSe, TpmSt, TpmaSa, TpmlDigest, TpmlDigestValues,
    TpmlPcrSelection, TpmsAuthCommand, TpmsAuthResponse, TpmsPcrSelection, TpmtPublic,
    TpmtPublicUnique, TpmtSymDef, Unmarshal, MAX_SYM_DATA, TPM2_FAMILY_2_0,
};
use tracing::debug;
use zeroize::Zeroizing;

use crate::State as Device;

/// TPM_RC_INSUFFICIENT: the command was shorter than its structures
const RC_INSUFFICIENT: u32 = 0x09A;
const RC_COMMAND_SIZE: u32 = 0x142;
const RC_COMMAND_CODE: u32 = 0x143;
const RC_AUTH_UNAVAILABLE: u32 = 0x12F;
const RC_ATTRIBUTES: u32 = 0x082;

const NONCE_SIZE: usize = 32;
const SEED_SIZE: usize = 32;
const MAX_PCR_DIGESTS: usize = 8;
const TAG_CREATION: u16 = 0x8021;

/// Response code of a failed command
#[derive(Debug)]
struct Rc(u32);

impl From<anyhow::Error> for Rc {
    fn from(_: anyhow::Error) -> Self {
        Rc(RC_INSUFFICIENT)
    }
}

type Handled<T> = std::result::Result<T, Rc>;

fn fresh_nonce() -> Vec<u8> {
    rand::random::<[u8; NONCE_SIZE]>().to_vec()
}

fn trim_auth(auth: &[u8]) -> &[u8] {
    let end = auth.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &auth[..end]
}

fn is_transient(handle: u32) -> bool {
    handle & 0xFF00_0000 == tpm_ht::TRANSIENT_FIRST
}

#[derive(Clone)]
struct Object {
    public: Vec<u8>,
    parsed: TpmtPublic,
    auth: Zeroizing<Vec<u8>>,
    data: Zeroizing<Vec<u8>>,
}

impl Object {
    fn new(parsed: TpmtPublic, auth: &[u8], data: &[u8]) -> Self {
        Self {
            public: parsed.to_bytes(),
            parsed,
            auth: Zeroizing::new(auth.to_vec()),
            data: Zeroizing::new(data.to_vec()),
        }
    }

    fn name(&self) -> Vec<u8> {
        object_name(&self.public)
    }
}

struct Session {
    bound: bool,
    obfuscate: bool,
    session_key: Zeroizing<Vec<u8>>,
    nonce_tpm: Vec<u8>,
    policy_digest: Vec<u8>,
}

impl Session {
    fn check_hmac(&self, cp: &[u8], entry: &TpmsAuthCommand, position: u32) -> Handled<()> {
        let ok = if self.bound {
            verify_hmac_sha256(
                &self.session_key,
                &[cp, &entry.nonce, &self.nonce_tpm, &[entry.attributes.0]],
                &entry.hmac,
            )
        } else {
            entry.hmac.is_empty()
        };
        if ok {
            Ok(())
        } else {
            Err(Rc(TpmRc::AuthFail.on_session(position)))
        }
    }

    /// Response entry over `rp`; the TPM nonce must already be rolled
    fn respond(&self, rp: &[u8], entry: &TpmsAuthCommand) -> TpmsAuthResponse {
        let hmac = if self.bound {
            hmac_sha256(
                &self.session_key,
                &[rp, &self.nonce_tpm, &entry.nonce, &[entry.attributes.0]],
            )
        } else {
            Vec::new()
        };
        TpmsAuthResponse {
            nonce: self.nonce_tpm.clone(),
            attributes: entry.attributes,
            hmac,
        }
    }
}

/// TPM 2.0 side of the simulated device
pub(crate) struct State {
    owner_auth: Zeroizing<Vec<u8>>,
    seed: [u8; SEED_SIZE],
    objects: BTreeMap<u32, Object>,
    sessions: BTreeMap<u32, Session>,
    next_transient: u32,
    next_session: u32,
}

impl State {
    pub(crate) fn new(owner_auth: &[u8]) -> Self {
        Self {
            owner_auth: Zeroizing::new(owner_auth.to_vec()),
            seed: rand::random(),
            objects: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_transient: tpm_ht::TRANSIENT_FIRST,
            next_session: tpm_ht::POLICY_SESSION_FIRST,
        }
    }

    pub(crate) fn close_channel(&mut self) {
        self.objects.retain(|handle, _| !is_transient(*handle));
        self.sessions.clear();
    }

    pub(crate) fn loaded_handles(&self) -> usize {
        self.objects.keys().filter(|h| is_transient(**h)).count() + self.sessions.len()
    }

    pub(crate) fn persistent_handles(&self) -> Vec<u32> {
        self.objects
            .keys()
            .copied()
            .filter(|h| !is_transient(*h))
            .collect()
    }

    pub(crate) fn persist_foreign_key(&mut self, handle: u32) {
        let public = TpmtPublic::sealed_object(Tpm2bDigest::empty());
        self.objects.insert(handle, Object::new(public, &[], b"foreign"));
    }

    fn insert_transient(&mut self, object: Object) -> u32 {
        let handle = self.next_transient;
        self.next_transient += 1;
        self.objects.insert(handle, object);
        handle
    }

    fn object(&self, handle: u32, position: u32) -> Handled<&Object> {
        self.objects
            .get(&handle)
            .ok_or(Rc(TpmRc::Handle.on_handle(position)))
    }

    fn session_mut(&mut self, handle: u32, position: u32) -> Handled<&mut Session> {
        self.sessions
            .get_mut(&handle)
            .ok_or(Rc(TpmRc::Value.on_session(position)))
    }

    /// Drop a policy session the caller did not ask to keep
    fn retire(&mut self, entry: &TpmsAuthCommand) {
        if !entry.attributes.contains(TpmaSa::CONTINUE_SESSION) {
            self.sessions.remove(&entry.session_handle);
        }
    }
}

struct Request {
    handles: Vec<u32>,
    sessions: Vec<TpmsAuthCommand>,
    parameters: Vec<u8>,
}

fn handle_count(cc: TpmCc) -> usize {
    match cc {
        TpmCc::EvictControl | TpmCc::StartAuthSession => 2,
        TpmCc::CreatePrimary
        | TpmCc::Create
        | TpmCc::Load
        | TpmCc::Unseal
        | TpmCc::ReadPublic
        | TpmCc::PolicyPcr
        | TpmCc::PolicyGetDigest
        | TpmCc::PcrExtend => 1,
        TpmCc::FlushContext | TpmCc::GetCapability | TpmCc::PcrRead => 0,
    }
}

fn parse_request(command: &[u8]) -> Handled<(TpmCc, Request)> {
    let mut buf = ResponseBuffer::new(command);
    let tag = buf.get_u16()?;
    let size = buf.get_u32()? as usize;
    if size != command.len() {
        return Err(Rc(RC_COMMAND_SIZE));
    }
    let cc = TpmCc::from_u32(buf.get_u32()?).ok_or(Rc(RC_COMMAND_CODE))?;

    let mut handles = Vec::new();
    for _ in 0..handle_count(cc) {
        handles.push(buf.get_u32()?);
    }
    let mut sessions = Vec::new();
    if tag == TpmSt::Sessions.to_u16() {
        let area_size = buf.get_u32()? as usize;
        let mut area = ResponseBuffer::new(buf.get_slice(area_size)?);
        while area.remaining() > 0 {
            sessions.push(TpmsAuthCommand::unmarshal(&mut area)?);
        }
    }
    Ok((
        cc,
        Request {
            handles,
            sessions,
            parameters: buf.get_remaining(),
        },
    ))
}

#[derive(Default)]
struct Reply {
    handles: Vec<u32>,
    parameters: Vec<u8>,
    sessions: Option<Vec<TpmsAuthResponse>>,
}

impl Reply {
    fn parameters(parameters: Vec<u8>) -> Self {
        Self {
            parameters,
            ..Default::default()
        }
    }

    fn encode(self) -> Vec<u8> {
        let tag = match self.sessions {
            Some(_) => TpmSt::Sessions,
            None => TpmSt::NoSessions,
        };
        let mut buf = CommandBuffer::new();
        buf.put_u16(tag.to_u16());
        buf.put_u32(0);
        buf.put_u32(TpmRc::Success.to_u32());
        for handle in &self.handles {
            buf.put_u32(*handle);
        }
        match &self.sessions {
            Some(sessions) => {
                buf.put_u32(self.parameters.len() as u32);
                buf.put_bytes(&self.parameters);
                for session in sessions {
                    session.marshal(&mut buf);
                }
            }
            None => buf.put_bytes(&self.parameters),
        }
        let size = buf.len() as u32;
        buf.update_u32(2, size);
        buf.into_vec()
    }
}

fn error_response(code: u32) -> Vec<u8> {
    let mut buf = CommandBuffer::new();
    buf.put_u16(TpmSt::NoSessions.to_u16());
    buf.put_u32(10);
    buf.put_u32(code);
    buf.into_vec()
}

/// Password authorization of the entity whose auth value is `expected`
fn check_password(
    entry: Option<&TpmsAuthCommand>,
    expected: &[u8],
    failure: TpmRc,
) -> Handled<TpmsAuthResponse> {
    let entry = entry.ok_or(Rc(TpmRc::AuthMissing.to_u32()))?;
    if entry.session_handle != tpm_rh::PW {
        return Err(Rc(TpmRc::Value.on_session(1)));
    }
    if trim_auth(&entry.hmac) != trim_auth(expected) {
        return Err(Rc(failure.on_session(1)));
    }
    Ok(TpmsAuthResponse {
        nonce: Vec::new(),
        attributes: TpmaSa::new().with_continue_session(),
        hmac: Vec::new(),
    })
}

fn creation_trailer(buf: &mut CommandBuffer) {
    // creationData, creationHash, creationTicket
    buf.put_tpm2b_empty();
    buf.put_tpm2b_empty();
    buf.put_u16(TAG_CREATION);
    buf.put_u32(tpm_rh::OWNER);
    buf.put_tpm2b_empty();
}

pub(crate) fn execute(device: &mut Device, command: &[u8]) -> Vec<u8> {
    let result = parse_request(command).and_then(|(cc, request)| {
        let reply = dispatch(device, cc, request);
        if let Err(Rc(code)) = &reply {
            debug!("simulated TPM2 {:?} failed with 0x{:03x}", cc, code);
        }
        reply
    });
    match result {
        Ok(reply) => reply.encode(),
        Err(Rc(code)) => error_response(code),
    }
}

fn dispatch(device: &mut Device, cc: TpmCc, request: Request) -> Handled<Reply> {
    match cc {
        TpmCc::GetCapability => get_capability(&request),
        TpmCc::PcrRead => pcr_read(device, &request),
        TpmCc::PcrExtend => pcr_extend(device, &request),
        TpmCc::ReadPublic => read_public(device, &request),
        TpmCc::CreatePrimary => create_primary(device, &request),
        TpmCc::EvictControl => evict_control(device, &request),
        TpmCc::FlushContext => flush_context(device, &request),
        TpmCc::StartAuthSession => start_auth_session(device, &request),
        TpmCc::PolicyPcr => policy_pcr(device, &request),
        TpmCc::PolicyGetDigest => policy_get_digest(device, &request),
        TpmCc::Create => create(device, &request),
        TpmCc::Load => load(device, &request),
        TpmCc::Unseal => unseal(device, &request),
    }
}

fn get_capability(request: &Request) -> Handled<Reply> {
    let mut buf = ResponseBuffer::new(&request.parameters);
    let capability = buf.get_u32()?;
    let property = buf.get_u32()?;
    let _count = buf.get_u32()?;
    if capability != TpmCap::TpmProperties as u32 {
        return Err(Rc(TpmRc::Value.on_parameter(1)));
    }

    let mut out = CommandBuffer::new();
    // moreData
    out.put_u8(0);
    out.put_u32(capability);
    if property == tpm_pt::FAMILY_INDICATOR {
        out.put_u32(1);
        out.put_u32(property);
        out.put_u32(TPM2_FAMILY_2_0);
    } else {
        out.put_u32(0);
    }
    Ok(Reply::parameters(out.into_vec()))
}

fn pcr_read(device: &Device, request: &Request) -> Handled<Reply> {
    let selection = TpmlPcrSelection::from_bytes(&request.parameters)?;
    let mut selected = Vec::new();
    let mut digests = Vec::new();
    for sel in &selection.pcr_selections {
        let mut returned = Vec::new();
        for index in sel.indices() {
            if digests.len() == MAX_PCR_DIGESTS {
                break;
            }
            if let Some(value) = device.pcr_value(sel.hash, index) {
                returned.push(index);
                digests.push(Tpm2bDigest::new(value));
            }
        }
        selected.push(TpmsPcrSelection::new(sel.hash, &returned));
    }

    let mut out = CommandBuffer::new();
    // pcrUpdateCounter
    out.put_u32(0);
    TpmlPcrSelection::new(selected).marshal(&mut out);
    TpmlDigest { digests }.marshal(&mut out);
    Ok(Reply::parameters(out.into_vec()))
}

fn pcr_extend(device: &mut Device, request: &Request) -> Handled<Reply> {
    let index = request.handles[0] as usize;
    if index >= crate::PCR_COUNT {
        return Err(Rc(TpmRc::Value.on_handle(1)));
    }
    let auth = check_password(request.sessions.first(), &[], TpmRc::AuthFail)?;
    let values = TpmlDigestValues::from_bytes(&request.parameters)?;
    for value in &values.digests {
        match value.hash_alg {
            TpmAlgId::Sha1 => device.extend_sha1(index, &value.digest),
            TpmAlgId::Sha256 => device.extend_sha256(index, &value.digest),
            _ => return Err(Rc(TpmRc::Value.on_parameter(1))),
        }
    }
    Ok(Reply {
        sessions: Some(vec![auth]),
        ..Default::default()
    })
}

fn read_public(device: &Device, request: &Request) -> Handled<Reply> {
    let object = device.tpm20.object(request.handles[0], 1)?;
    let name = object.name();
    let mut out = CommandBuffer::new();
    out.put_tpm2b(&object.public);
    out.put_tpm2b(&name);
    // qualifiedName
    out.put_tpm2b(&name);
    Ok(Reply::parameters(out.into_vec()))
}

fn create_primary(device: &mut Device, request: &Request) -> Handled<Reply> {
    if request.handles[0] != tpm_rh::OWNER {
        return Err(Rc(TpmRc::Value.on_handle(1)));
    }
    let state = &mut device.tpm20;
    let auth = check_password(request.sessions.first(), &state.owner_auth, TpmRc::AuthFail)?;

    let mut buf = ResponseBuffer::new(&request.parameters);
    let sensitive = Tpm2bSensitiveCreate::unmarshal(&mut buf)?;
    let template = Tpm2bPublic::unmarshal(&mut buf)?;
    let mut public = template
        .parse()
        .map_err(|_| Rc(TpmRc::Value.on_parameter(2)))?;

    // primary keys derive from the hierarchy seed and the template
    let derive = |label: &[u8]| -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(state.seed);
        hasher.update(label);
        hasher.update(&template.public_area);
        hasher.update(&sensitive.sensitive.data[..]);
        hasher.finalize().to_vec()
    };
    public.unique = match public.unique {
        TpmtPublicUnique::Ecc(..) => TpmtPublicUnique::Ecc(derive(b"x"), derive(b"y")),
        TpmtPublicUnique::KeyedHash(_) => TpmtPublicUnique::KeyedHash(derive(b"unique")),
    };

    let object = Object::new(public, &sensitive.sensitive.user_auth, &[]);
    let name = object.name();
    let mut out = CommandBuffer::new();
    out.put_tpm2b(&object.public);
    creation_trailer(&mut out);
    out.put_tpm2b(&name);

    let handle = state.insert_transient(object);
    Ok(Reply {
        handles: vec![handle],
        parameters: out.into_vec(),
        sessions: Some(vec![auth]),
    })
}

fn evict_control(device: &mut Device, request: &Request) -> Handled<Reply> {
    if request.handles[0] != tpm_rh::OWNER {
        return Err(Rc(TpmRc::Value.on_handle(1)));
    }
    let state = &mut device.tpm20;
    let auth = check_password(request.sessions.first(), &state.owner_auth, TpmRc::AuthFail)?;
    let object_handle = request.handles[1];
    let persistent = ResponseBuffer::new(&request.parameters).get_u32()?;
    let object = state.object(object_handle, 2)?.clone();

    if is_transient(object_handle) {
        if state.objects.contains_key(&persistent) {
            return Err(Rc(TpmRc::NvDefined.to_u32()));
        }
        state.objects.insert(persistent, object);
    } else if object_handle == persistent {
        state.objects.remove(&persistent);
    } else {
        return Err(Rc(TpmRc::Value.on_parameter(1)));
    }
    Ok(Reply {
        sessions: Some(vec![auth]),
        ..Default::default()
    })
}

fn flush_context(device: &mut Device, request: &Request) -> Handled<Reply> {
    let handle = ResponseBuffer::new(&request.parameters).get_u32()?;
    let state = &mut device.tpm20;
    let flushed = if is_transient(handle) {
        state.objects.remove(&handle).is_some()
    } else {
        state.sessions.remove(&handle).is_some()
    };
    if !flushed {
        return Err(Rc(TpmRc::Handle.on_parameter(1)));
    }
    Ok(Reply::default())
}

fn start_auth_session(device: &mut Device, request: &Request) -> Handled<Reply> {
    if request.handles[0] != tpm_rh::NULL {
        // salted sessions are not simulated
        return Err(Rc(TpmRc::Value.on_handle(1)));
    }
    let mut buf = ResponseBuffer::new(&request.parameters);
    let nonce_caller = buf.get_tpm2b()?;
    let _encrypted_salt = buf.get_tpm2b()?;
    let session_type = buf.get_u8()?;
    let symmetric = TpmtSymDef::unmarshal(&mut buf)?;
    let _auth_hash = buf.get_u16()?;
    if TpmSe::from_u8(session_type).is_none() {
        return Err(Rc(TpmRc::Value.on_parameter(3)));
    }

    let state = &mut device.tpm20;
    let bind = request.handles[1];
    let nonce_tpm = fresh_nonce();
    let session_key = if bind == tpm_rh::NULL {
        Zeroizing::new(Vec::new())
    } else {
        let entity = state.object(bind, 2)?;
        kdfa(
            trim_auth(&entity.auth),
            LABEL_SESSION_KEY,
            &nonce_tpm,
            &nonce_caller,
            256,
        )
    };

    let handle = state.next_session;
    state.next_session += 1;
    state.sessions.insert(
        handle,
        Session {
            bound: bind != tpm_rh::NULL,
            obfuscate: symmetric.algorithm == TpmAlgId::Xor,
            session_key,
            nonce_tpm: nonce_tpm.clone(),
            policy_digest: vec![0; 32],
        },
    );

    let mut out = CommandBuffer::new();
    out.put_tpm2b(&nonce_tpm);
    Ok(Reply {
        handles: vec![handle],
        parameters: out.into_vec(),
        sessions: None,
    })
}

fn policy_pcr(device: &mut Device, request: &Request) -> Handled<Reply> {
    let mut buf = ResponseBuffer::new(&request.parameters);
    let pcr_digest = buf.get_tpm2b()?;
    let selection = TpmlPcrSelection::unmarshal(&mut buf)?;

    let values = selection
        .entries()
        .into_iter()
        .map(|(bank, index)| device.pcr_value(bank, index))
        .collect::<Option<Vec<_>>>()
        .ok_or(Rc(TpmRc::Value.on_parameter(2)))?;
    let live = pcr_values_digest(&values);
    if !pcr_digest.is_empty() && pcr_digest != live {
        return Err(Rc(TpmRc::Value.on_parameter(1)));
    }

    let session = device
        .tpm20
        .sessions
        .get_mut(&request.handles[0])
        .ok_or(Rc(TpmRc::Handle.on_handle(1)))?;
    session.policy_digest = policy_pcr_digest(&session.policy_digest, &selection, &live);
    Ok(Reply::default())
}

fn policy_get_digest(device: &Device, request: &Request) -> Handled<Reply> {
    let session = device
        .tpm20
        .sessions
        .get(&request.handles[0])
        .ok_or(Rc(TpmRc::Handle.on_handle(1)))?;
    let mut out = CommandBuffer::new();
    out.put_tpm2b(&session.policy_digest);
    Ok(Reply::parameters(out.into_vec()))
}

/// Sensitive area of a sealed object: seed, auth value and data
fn sealed_sensitive(seed: &[u8], auth: &[u8], data: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut buf = CommandBuffer::new();
    buf.put_bytes(seed);
    buf.put_tpm2b(auth);
    buf.put_tpm2b(data);
    Zeroizing::new(buf.into_vec())
}

fn sealed_unique(seed: &[u8], data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn create(device: &mut Device, request: &Request) -> Handled<Reply> {
    let parent = device.tpm20.object(request.handles[0], 1)?;
    let parent_name = parent.name();
    let parent_auth = parent.auth.clone();
    let mut sessions = vec![check_password(
        request.sessions.first(),
        &parent_auth,
        TpmRc::BadAuth,
    )?];

    let mut parameters = Zeroizing::new(request.parameters.clone());
    if let Some(entry) = request.sessions.get(1) {
        let cp = cp_hash(TpmCc::Create, &[&parent_name], &request.parameters);
        let session = device.tpm20.session_mut(entry.session_handle, 2)?;
        session.check_hmac(&cp, entry, 2)?;
        if entry.attributes.contains(TpmaSa::DECRYPT) {
            if !session.obfuscate {
                return Err(Rc(RC_ATTRIBUTES));
            }
            // only the buffer of the leading TPM2B is obfuscated
            let len = ResponseBuffer::new(&parameters).get_u16()? as usize;
            if parameters.len() < 2 + len {
                return Err(Rc(RC_INSUFFICIENT));
            }
            let mask = xor_mask(&session.session_key, &entry.nonce, &session.nonce_tpm, len);
            xor_in_place(&mut parameters[2..2 + len], &mask);
        }
    }

    let mut buf = ResponseBuffer::new(&parameters);
    let sensitive = Tpm2bSensitiveCreate::unmarshal(&mut buf)?;
    if sensitive.sensitive.data.len() > MAX_SYM_DATA {
        return Err(Rc(TpmRc::Size.on_parameter(1)));
    }
    let template = Tpm2bPublic::unmarshal(&mut buf)?;
    let _outside_info = buf.get_tpm2b()?;
    let _creation_pcr = TpmlPcrSelection::unmarshal(&mut buf)?;
    let mut public = template
        .parse()
        .map_err(|_| Rc(TpmRc::Value.on_parameter(2)))?;
    if public.type_alg != TpmAlgId::KeyedHash {
        return Err(Rc(TpmRc::Value.on_parameter(2)));
    }

    let seed: [u8; SEED_SIZE] = rand::random();
    let data = sensitive.sensitive.data.clone();
    public.unique = TpmtPublicUnique::KeyedHash(sealed_unique(&seed, &data));
    let public = public.to_bytes();
    let plaintext = sealed_sensitive(&seed, &sensitive.sensitive.user_auth, &data);
    let aad = [object_name(&public), parent_name].concat();
    let private = device
        .blob_key
        .seal(&aad, &plaintext)
        .map_err(|_| Rc(TpmRc::Failure.to_u32()))?;

    let mut out = CommandBuffer::new();
    out.put_tpm2b(&private);
    out.put_tpm2b(&public);
    creation_trailer(&mut out);
    let out = out.into_vec();

    if let Some(entry) = request.sessions.get(1) {
        let session = device.tpm20.session_mut(entry.session_handle, 2)?;
        session.nonce_tpm = fresh_nonce();
        sessions.push(session.respond(&rp_hash(TpmCc::Create, &out), entry));
        device.tpm20.retire(entry);
    }
    Ok(Reply {
        handles: Vec::new(),
        parameters: out,
        sessions: Some(sessions),
    })
}

fn load(device: &mut Device, request: &Request) -> Handled<Reply> {
    let parent = device.tpm20.object(request.handles[0], 1)?;
    let parent_name = parent.name();
    let parent_auth = parent.auth.clone();
    let auth = check_password(request.sessions.first(), &parent_auth, TpmRc::BadAuth)?;

    let mut buf = ResponseBuffer::new(&request.parameters);
    let private = buf.get_tpm2b()?;
    let public_area = buf.get_tpm2b()?;
    let public = TpmtPublic::from_bytes(&public_area)
        .map_err(|_| Rc(TpmRc::Value.on_parameter(2)))?;

    let aad = [object_name(&public_area), parent_name].concat();
    let plaintext = device
        .blob_key
        .open(&aad, &private)
        .map_err(|_| Rc(TpmRc::Integrity.on_parameter(1)))?;
    let mut sensitive = ResponseBuffer::new(&plaintext);
    let seed: [u8; SEED_SIZE] = sensitive.get_array()?;
    let user_auth = Zeroizing::new(sensitive.get_tpm2b()?);
    let data = Zeroizing::new(sensitive.get_tpm2b()?);
    if public.unique != TpmtPublicUnique::KeyedHash(sealed_unique(&seed, &data)) {
        return Err(Rc(TpmRc::Integrity.on_parameter(1)));
    }

    let object = Object {
        public: public_area,
        parsed: public,
        auth: user_auth,
        data,
    };
    let mut out = CommandBuffer::new();
    out.put_tpm2b(&object.name());
    let handle = device.tpm20.insert_transient(object);
    Ok(Reply {
        handles: vec![handle],
        parameters: out.into_vec(),
        sessions: Some(vec![auth]),
    })
}

fn unseal(device: &mut Device, request: &Request) -> Handled<Reply> {
    let entry = request
        .sessions
        .first()
        .ok_or(Rc(TpmRc::AuthMissing.to_u32()))?;
    let object = device.tpm20.object(request.handles[0], 1)?;
    if entry.session_handle == tpm_rh::PW {
        // sealed objects only admit policy authorization
        return Err(Rc(RC_AUTH_UNAVAILABLE));
    }
    let name = object.name();
    let auth_policy = object.parsed.auth_policy.buffer.clone();
    let mut data = object.data.clone();

    let cp = cp_hash(TpmCc::Unseal, &[&name], &request.parameters);
    let session = device.tpm20.session_mut(entry.session_handle, 1)?;
    session.check_hmac(&cp, entry, 1)?;
    if session.policy_digest != auth_policy {
        return Err(Rc(TpmRc::PolicyFail.on_session(1)));
    }

    session.nonce_tpm = fresh_nonce();
    session.policy_digest = vec![0; 32];
    if entry.attributes.contains(TpmaSa::ENCRYPT) {
        if !session.obfuscate {
            return Err(Rc(RC_ATTRIBUTES));
        }
        let mask = xor_mask(&session.session_key, &session.nonce_tpm, &entry.nonce, data.len());
        xor_in_place(&mut data, &mask);
    }

    let mut out = CommandBuffer::new();
    out.put_tpm2b(&data);
    let out = out.into_vec();
    let response = session.respond(&rp_hash(TpmCc::Unseal, &out), entry);
    device.tpm20.retire(entry);
    Ok(Reply {
        handles: Vec::new(),
        parameters: out,
        sessions: Some(vec![response]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TpmSimulator;
    use tpm2::{TpmContext, TpmRc, ResponseCodeError};

    fn context(owner_auth: &[u8]) -> TpmContext<TpmSimulator> {
        TpmContext::from_transport(TpmSimulator::tpm20(owner_auth).unwrap())
    }

    fn rc(err: &anyhow::Error) -> Option<TpmRc> {
        err.downcast_ref::<ResponseCodeError>().and_then(|e| e.rc())
    }

    #[test]
    fn test_family_indicator() {
        let mut tpm = context(b"owner");
        assert_eq!(tpm.family_indicator().unwrap(), TPM2_FAMILY_2_0);
    }

    #[test]
    fn test_pcr_read_and_extend() {
        let mut tpm = context(b"owner");
        let control = tpm.transport_mut().control();
        let all: Vec<u32> = (0..24).collect();
        let values = tpm
            .pcr_read(&TpmlPcrSelection::single(TpmAlgId::Sha256, &all))
            .unwrap();
        assert_eq!(values.len(), 24);
        assert!(values.iter().all(|(_, v)| *v == vec![0u8; 32]));

        tpm.pcr_extend(7, &[0xaa; 32], TpmAlgId::Sha256).unwrap();
        let expected: Vec<u8> = Sha256::digest([[0u8; 32], [0xaa; 32]].concat()).to_vec();
        assert_eq!(
            tpm.pcr_read_single(7, TpmAlgId::Sha256).unwrap(),
            expected
        );
        assert_eq!(control.pcr_sha256(7).to_vec(), expected);
    }

    #[test]
    fn test_primary_requires_owner_auth() {
        let mut tpm = context(b"owner");
        let template = TpmtPublic::ecc_storage_key();
        let err = tpm
            .create_primary(tpm_rh::OWNER, b"wrong", b"srk", &template)
            .unwrap_err();
        assert_eq!(rc(&err), Some(TpmRc::AuthFail));

        let (key, public) = tpm
            .create_primary(tpm_rh::OWNER, b"owner", b"srk", &template)
            .unwrap();
        assert!(public.matches_template(&template));
        assert_eq!(key.name, public.name());
    }

    #[test]
    fn test_seal_unseal_with_policy() {
        let mut tpm = context(b"owner");
        let template = TpmtPublic::ecc_storage_key();
        let (srk, _) = tpm
            .create_primary(tpm_rh::OWNER, b"owner", b"srk", &template)
            .unwrap();
        let selection = TpmlPcrSelection::single(TpmAlgId::Sha256, &[0, 2]);
        let values: Vec<Vec<u8>> = vec![vec![0; 32]; 2];
        let policy = tpm2::compute_policy_pcr(&selection, &values);
        let created = tpm
            .create_sealed(srk.handle, b"srk", b"payload", &policy)
            .unwrap();

        let object = tpm
            .load(srk.handle, b"srk", &created.private, &created.public)
            .unwrap();
        let mut session = tpm.start_policy_session().unwrap();
        tpm.policy_pcr(&session, &selection).unwrap();
        assert_eq!(tpm.policy_digest(&session).unwrap(), policy);
        let data = tpm.unseal(&object, &mut session).unwrap();
        assert_eq!(&data[..], b"payload");

        // the policy digest resets after use
        let err = tpm.unseal(&object, &mut session).unwrap_err();
        assert_eq!(rc(&err), Some(TpmRc::PolicyFail));
    }

    #[test]
    fn test_create_enforces_payload_limit() {
        let mut tpm = context(b"owner");
        let control = tpm.transport_mut().control();
        let (srk, _) = tpm
            .create_primary(tpm_rh::OWNER, b"owner", b"srk", &TpmtPublic::ecc_storage_key())
            .unwrap();
        tpm.create_sealed(srk.handle, b"srk", &[1; MAX_SYM_DATA], &[1; 32])
            .unwrap();
        let err = tpm
            .create_sealed(srk.handle, b"srk", &[1; MAX_SYM_DATA + 1], &[1; 32])
            .unwrap_err();
        assert_eq!(rc(&err), Some(TpmRc::Size));

        // too large for the wire format: refused before transmission
        let err = tpm
            .create_sealed(srk.handle, b"srk", &vec![1; 1 << 16], &[1; 32])
            .unwrap_err();
        assert_eq!(rc(&err), None);
        assert_eq!(control.command_count(TpmCc::Create.to_u32()), 2);
    }

    #[test]
    fn test_load_rejects_tampered_private() {
        let mut tpm = context(b"owner");
        let (srk, _) = tpm
            .create_primary(tpm_rh::OWNER, b"owner", b"srk", &TpmtPublic::ecc_storage_key())
            .unwrap();
        let created = tpm
            .create_sealed(srk.handle, b"srk", b"payload", &[1; 32])
            .unwrap();
        let mut private = created.private.clone();
        let last = private.len() - 1;
        private[last] ^= 1;
        let err = tpm
            .load(srk.handle, b"srk", &private, &created.public)
            .unwrap_err();
        assert_eq!(rc(&err), Some(TpmRc::Integrity));

        let err = tpm
            .load(srk.handle, b"other", &created.private, &created.public)
            .unwrap_err();
        assert_eq!(rc(&err), Some(TpmRc::BadAuth));
    }

    #[test]
    fn test_evict_and_flush() {
        let mut tpm = context(b"owner");
        let control = tpm.transport_mut().control();
        let (srk, _) = tpm
            .create_primary(tpm_rh::OWNER, b"owner", b"srk", &TpmtPublic::ecc_storage_key())
            .unwrap();
        tpm.evict_control(b"owner", srk.handle, 0x8100_0002).unwrap();
        tpm.flush_context(srk.handle).unwrap();
        assert_eq!(control.persistent_handles(), vec![0x8100_0002]);
        assert_eq!(control.loaded_handles(), 0);
        assert!(tpm.handle_exists(0x8100_0002).unwrap());

        let err = tpm
            .evict_control(b"owner", 0x8100_0002, 0x8100_0003)
            .unwrap_err();
        assert_eq!(rc(&err), Some(TpmRc::Value));
        tpm.evict_control(b"owner", 0x8100_0002, 0x8100_0002).unwrap();
        assert!(!tpm.handle_exists(0x8100_0002).unwrap());
        assert!(tpm.flush_context(srk.handle).is_err());
    }

    #[test]
    fn test_obfuscated_reseal_round_trip() {
        let mut tpm = context(b"owner");
        let (srk, _) = tpm
            .create_primary(tpm_rh::OWNER, b"owner", b"srk", &TpmtPublic::ecc_storage_key())
            .unwrap();
        let selection = TpmlPcrSelection::single(TpmAlgId::Sha256, &[4]);
        let policy = tpm2::compute_policy_pcr(&selection, &[[0u8; 32]]);
        let created = tpm
            .create_sealed(srk.handle, b"srk", b"moving secret", &policy)
            .unwrap();
        let object = tpm
            .load(srk.handle, b"srk", &created.private, &created.public)
            .unwrap();

        let mut session = tpm.start_bound_policy_session(srk.handle, b"srk").unwrap();
        tpm.policy_pcr(&session, &selection).unwrap();
        let secret = tpm.unseal_obfuscated(&object, &mut session).unwrap();
        let resealed = tpm
            .create_sealed_obfuscated(&srk, b"srk", secret, &policy, &mut session)
            .unwrap();
        tpm.flush_session(session).unwrap();
        tpm.flush_context(object.handle).unwrap();

        let object = tpm
            .load(srk.handle, b"srk", &resealed.private, &resealed.public)
            .unwrap();
        let mut session = tpm.start_policy_session().unwrap();
        tpm.policy_pcr(&session, &selection).unwrap();
        assert_eq!(&tpm.unseal(&object, &mut session).unwrap()[..], b"moving secret");
    }

    #[test]
    fn test_closing_channel_flushes_transients() {
        let tpm = TpmSimulator::tpm20(b"owner").unwrap();
        let control = tpm.control();
        let mut ctx = TpmContext::from_transport(tpm);
        let (srk, _) = ctx
            .create_primary(tpm_rh::OWNER, b"owner", b"srk", &TpmtPublic::ecc_storage_key())
            .unwrap();
        ctx.evict_control(b"owner", srk.handle, 0x8100_0002).unwrap();
        let _session = ctx.start_policy_session().unwrap();
        assert_eq!(control.loaded_handles(), 2);
        drop(ctx);
        assert_eq!(control.loaded_handles(), 0);
        assert_eq!(control.persistent_handles(), vec![0x8100_0002]);
    }
}
