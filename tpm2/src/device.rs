// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM device communication layer
//!
//! [`TpmTransport`] is the byte channel every command travels over. The
//! character device at `/dev/tpmrm0` or `/dev/tpm0` is one implementation;
//! a software TPM is another.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use super::constants::*;
use super::marshal::*;
use super::types::{TpmsAuthCommand, TpmsAuthResponse};

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// An open command/response channel to a TPM.
///
/// Callers open and close the channel; the command layers only borrow it.
pub trait TpmTransport: Send {
    /// Send one command and return the raw response bytes
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>>;

    /// Send a TPM 2.0 command and parse the response header
    fn execute(&mut self, command: &[u8]) -> Result<TpmResponse> {
        let response_bytes = self
            .transmit(command)
            .context("TPM channel I/O failed")?;
        TpmResponse::parse(&response_bytes)
    }
}

impl<T: TpmTransport + ?Sized> TpmTransport for Box<T> {
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>> {
        (**self).transmit(command)
    }
}

impl<T: TpmTransport + ?Sized> TpmTransport for &mut T {
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>> {
        (**self).transmit(command)
    }
}

/// TPM device handle
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device, accepting TCTI-style `device:` prefixed paths
    pub fn open(path: &str) -> Result<Self> {
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open TPM device: {}", device_path))?;

        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Detect and open the default TPM device
    pub fn detect() -> Result<Self> {
        if Path::new("/dev/tpmrm0").exists() {
            Self::open("/dev/tpmrm0")
        } else if Path::new("/dev/tpm0").exists() {
            Self::open("/dev/tpm0")
        } else {
            bail!("TPM device not found")
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl TpmTransport for TpmDevice {
    fn transmit(&mut self, command: &[u8]) -> io::Result<Vec<u8>> {
        self.file.write_all(command)?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self.file.read(&mut response)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "TPM device returned no data",
            ));
        }

        response.truncate(n);
        Ok(response)
    }
}

impl std::fmt::Debug for TpmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmDevice").field("path", &self.path).finish()
    }
}

/// TPM command builder
pub struct TpmCommand {
    buf: CommandBuffer,
}

impl TpmCommand {
    fn with_tag(tag: TpmSt, command_code: TpmCc) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);

        // Header: tag (2) + size (4) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0);
        buf.put_u32(command_code.to_u32());

        Self { buf }
    }

    /// Create a new command without sessions
    pub fn new(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::NoSessions, command_code)
    }

    /// Create a new command with an authorization area
    pub fn with_sessions(command_code: TpmCc) -> Self {
        Self::with_tag(TpmSt::Sessions, command_code)
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    pub fn add_tpm2b_empty(&mut self) {
        self.buf.put_tpm2b_empty();
    }

    /// Add a marshallable structure
    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Add the authorization area: a u32 size followed by each session
    pub fn add_auth_area<'a>(&mut self, sessions: impl IntoIterator<Item = &'a TpmsAuthCommand>) {
        let mut area = CommandBuffer::new();
        for session in sessions {
            session.marshal(&mut area);
        }
        self.buf.put_u32(area.len() as u32);
        self.buf.put_bytes(area.as_bytes());
    }

    /// Add a single password authorization
    pub fn add_password_auth(&mut self, auth: &[u8]) {
        self.add_auth_area([&TpmsAuthCommand::password(auth)]);
    }

    /// Add password authorization with an empty auth value
    pub fn add_null_auth_area(&mut self) {
        self.add_password_auth(&[]);
    }

    /// Finalize the command and return the bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }

    pub fn buffer(&self) -> &CommandBuffer {
        &self.buf
    }
}

/// A non-success TPM response code.
///
/// Raised by [`TpmResponse::ensure_success`] and kept as the root cause so
/// callers can classify failures with `anyhow::Error::downcast_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("TPM error: 0x{code:08x}")]
pub struct ResponseCodeError {
    pub code: u32,
}

impl ResponseCodeError {
    /// Known response code, with handle/session/parameter numbering removed
    pub fn rc(&self) -> Option<TpmRc> {
        TpmRc::from_u32(self.code)
    }
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub data: Vec<u8>,
}

/// Response body split into its handle, parameter and session areas
#[derive(Debug, Default)]
pub struct ResponseParts {
    pub handles: Vec<u32>,
    pub parameters: Vec<u8>,
    pub sessions: Vec<TpmsAuthResponse>,
}

impl TpmResponse {
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < 10 {
            bail!("TPM response too short: {} bytes", response.len());
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| anyhow::anyhow!("invalid response tag: 0x{:04x}", tag_raw))?;

        let size = buf.get_u32()? as usize;
        if size < 10 || response.len() < size {
            bail!(
                "TPM response size mismatch: header says {}, got {}",
                size,
                response.len()
            );
        }

        let response_code = buf.get_u32()?;

        Ok(Self {
            tag,
            response_code,
            data: response[10..size].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == 0
    }

    /// Ensure the response is successful
    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(ResponseCodeError {
                code: self.response_code,
            }
            .into())
        }
    }

    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }

    /// Split a successful response carrying `handle_count` output handles
    pub fn split(&self, handle_count: usize) -> Result<ResponseParts> {
        let mut buf = self.data_buffer();
        let mut parts = ResponseParts::default();
        for _ in 0..handle_count {
            parts.handles.push(buf.get_u32()?);
        }
        match self.tag {
            TpmSt::Sessions => {
                let param_size = buf.get_u32()? as usize;
                parts.parameters = buf.get_bytes(param_size)?;
                while buf.remaining() > 0 {
                    parts.sessions.push(TpmsAuthResponse::unmarshal(&mut buf)?);
                }
            }
            _ => parts.parameters = buf.get_remaining(),
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(0x80000001);

        let bytes = cmd.finalize();

        assert_eq!(&bytes[0..2], &[0x80, 0x01]); // TPM_ST_NO_SESSIONS
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x65]); // TPM_CC_FlushContext

        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
    }

    #[test]
    fn test_password_auth_area() {
        let mut cmd = TpmCommand::with_sessions(TpmCc::Create);
        cmd.add_handle(0x81000002);
        cmd.add_password_auth(&[0xaa, 0xbb]);
        let bytes = cmd.finalize();
        // area size: handle(4) + nonce(2) + attrs(1) + hmac(2 + 2)
        assert_eq!(&bytes[14..18], &11u32.to_be_bytes());
        assert_eq!(&bytes[18..22], &tpm_rh::PW.to_be_bytes());
        assert_eq!(&bytes[25..29], &[0x00, 0x02, 0xaa, 0xbb]);
    }

    #[test]
    fn test_response_parse() {
        let response = vec![
            0x80, 0x01, // TPM_ST_NO_SESSIONS
            0x00, 0x00, 0x00, 0x0A, // Size = 10
            0x00, 0x00, 0x00, 0x00, // TPM_RC_SUCCESS
        ];

        let parsed = TpmResponse::parse(&response).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_response_code_error_downcasts() {
        let response = vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x09, 0x8E];
        let parsed = TpmResponse::parse(&response).unwrap();
        let err = parsed
            .ensure_success()
            .context("Create failed")
            .unwrap_err();
        let rc = err.downcast_ref::<ResponseCodeError>().unwrap();
        assert_eq!(rc.rc(), Some(TpmRc::AuthFail));
    }

    #[test]
    fn test_tpm12_reply_is_recognised() {
        // TPM_TAG_RSP_COMMAND, size 10, TPM_BADTAG
        let response = vec![0x00, 0xC4, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x1E];
        let parsed = TpmResponse::parse(&response).unwrap();
        assert_eq!(parsed.tag, TpmSt::RspCommand);
        assert_eq!(parsed.response_code, 0x1E);
    }

    #[test]
    fn test_split_with_sessions() {
        let mut body = CommandBuffer::new();
        body.put_u32(0x80000001); // handle
        body.put_u32(4); // parameterSize
        body.put_tpm2b(&[1, 2]);
        TpmsAuthResponse::default().marshal(&mut body);

        let mut raw = CommandBuffer::new();
        raw.put_u16(TpmSt::Sessions.to_u16());
        raw.put_u32(10 + body.len() as u32);
        raw.put_u32(0);
        raw.put_bytes(body.as_bytes());

        let parts = TpmResponse::parse(raw.as_bytes())
            .unwrap()
            .split(1)
            .unwrap();
        assert_eq!(parts.handles, vec![0x80000001]);
        assert_eq!(parts.parameters, vec![0, 2, 1, 2]);
        assert_eq!(parts.sessions.len(), 1);
    }
}
