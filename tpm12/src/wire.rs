// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 command framing
//!
//! A 1.2 command is `tag || paramSize || ordinal || body || auth blocks`;
//! the response mirrors it with a return code in place of the ordinal.

use anyhow::{bail, Context, Result};
use tpm2::{CommandBuffer, Marshal, ResponseBuffer, TpmTransport};
use zeroize::Zeroize;

use super::constants::*;
use super::types::Digest20;

/// Size of one response auth block: nonceEven, continueAuthSession, resAuth
const RESPONSE_AUTH_SIZE: usize = DIGEST_SIZE + 1 + DIGEST_SIZE;

/// Authorization block appended to an authorized command
#[derive(Debug, Clone)]
pub struct CommandAuth {
    pub handle: u32,
    pub nonce_odd: Digest20,
    pub continue_session: bool,
    pub auth: Digest20,
}

/// Authorization block trailing an authorized response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseAuth {
    pub nonce_even: Digest20,
    pub continue_session: bool,
    pub auth: Digest20,
}

impl ResponseAuth {
    fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        Ok(Self {
            nonce_even: buf.get_array()?,
            continue_session: buf.get_u8()? != 0,
            auth: buf.get_array()?,
        })
    }
}

pub struct Tpm12Command {
    buf: CommandBuffer,
}

impl Tpm12Command {
    pub fn new(tag: u16, ordinal: Ordinal) -> Self {
        let mut buf = CommandBuffer::with_capacity(128);
        buf.put_u16(tag);
        buf.put_u32(0);
        buf.put_u32(ordinal.to_u32());
        Self { buf }
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

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn add_sized(&mut self, data: &[u8]) {
        self.buf.put_sized_u32(data);
    }

    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    pub fn add_auth(&mut self, auth: &CommandAuth) {
        self.buf.put_u32(auth.handle);
        self.buf.put_bytes(&auth.nonce_odd);
        self.buf.put_u8(auth.continue_session as u8);
        self.buf.put_bytes(&auth.auth);
    }

    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }
}

/// A non-success TPM 1.2 return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("TPM 1.2 error: 0x{code:08x}")]
pub struct ReturnCodeError {
    pub code: u32,
}

impl ReturnCodeError {
    pub fn return_code(&self) -> Option<ReturnCode> {
        ReturnCode::from_u32(self.code)
    }
}

#[derive(Debug)]
pub struct Tpm12Response {
    pub tag: u16,
    pub return_code: u32,
    pub data: Vec<u8>,
}

impl Tpm12Response {
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < 10 {
            bail!("TPM response too short: {} bytes", response.len());
        }
        let mut buf = ResponseBuffer::new(response);
        let tag = buf.get_u16()?;
        if !matches!(
            tag,
            tag::RSP_COMMAND | tag::RSP_AUTH1_COMMAND | tag::RSP_AUTH2_COMMAND
        ) {
            bail!("not a TPM 1.2 response: tag 0x{:04x}", tag);
        }
        let size = buf.get_u32()? as usize;
        if size < 10 || response.len() < size {
            bail!(
                "TPM response size mismatch: header says {}, got {}",
                size,
                response.len()
            );
        }
        let return_code = buf.get_u32()?;
        Ok(Self {
            tag,
            return_code,
            data: response[10..size].to_vec(),
        })
    }

    pub fn ensure_success(&self) -> Result<()> {
        if self.return_code == 0 {
            Ok(())
        } else {
            Err(ReturnCodeError {
                code: self.return_code,
            }
            .into())
        }
    }

    /// Split the body into output parameters and `count` trailing auth blocks
    pub fn split_auth(&self, count: usize) -> Result<(&[u8], Vec<ResponseAuth>)> {
        let auth_len = count * RESPONSE_AUTH_SIZE;
        if self.data.len() < auth_len {
            bail!("response too short for {} auth blocks", count);
        }
        let (params, auths) = self.data.split_at(self.data.len() - auth_len);
        let auths = auths
            .chunks(RESPONSE_AUTH_SIZE)
            .map(ResponseAuth::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok((params, auths))
    }
}

impl Drop for Tpm12Response {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// Send a 1.2 command over `device` and parse the response header
pub fn execute<T: TpmTransport + ?Sized>(device: &mut T, command: &[u8]) -> Result<Tpm12Response> {
    let response = device.transmit(command).context("TPM channel I/O failed")?;
    Tpm12Response::parse(&response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_header() {
        let mut cmd = Tpm12Command::new(tag::RQU_COMMAND, Ordinal::PcrRead);
        cmd.add_u32(7);
        let bytes = cmd.finalize();
        assert_eq!(
            bytes,
            vec![0x00, 0xC1, 0, 0, 0, 14, 0, 0, 0, 0x15, 0, 0, 0, 7]
        );
    }

    #[test]
    fn test_response_auth_split() {
        let mut raw = vec![0x00, 0xC5, 0, 0, 0, 0, 0, 0, 0, 0];
        raw.extend_from_slice(&[0xaa, 0xbb]);
        raw.extend_from_slice(&[1; 20]);
        raw.push(0);
        raw.extend_from_slice(&[2; 20]);
        let len = raw.len() as u32;
        raw[2..6].copy_from_slice(&len.to_be_bytes());

        let response = Tpm12Response::parse(&raw).unwrap();
        let (params, auths) = response.split_auth(1).unwrap();
        assert_eq!(params, &[0xaa, 0xbb]);
        assert_eq!(auths[0].nonce_even, [1; 20]);
        assert!(!auths[0].continue_session);
        assert_eq!(auths[0].auth, [2; 20]);
        assert!(response.split_auth(2).is_err());
    }

    #[test]
    fn test_tpm2_reply_is_rejected() {
        let raw = vec![0x80, 0x01, 0, 0, 0, 10, 0, 0, 0, 0];
        assert!(Tpm12Response::parse(&raw).is_err());
    }

    #[test]
    fn test_return_code_error() {
        let raw = vec![0x00, 0xC4, 0, 0, 0, 10, 0, 0, 0, 0x18];
        let err = Tpm12Response::parse(&raw)
            .unwrap()
            .ensure_success()
            .unwrap_err();
        let rc = err.downcast_ref::<ReturnCodeError>().unwrap();
        assert_eq!(rc.return_code(), Some(ReturnCode::WrongPcrVal));
    }
}
