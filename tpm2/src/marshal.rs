// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Big-endian marshalling shared by the TPM 1.2 and TPM 2.0 encoders
//!
//! Both generations use the same framing primitives, so `tpm12` builds on
//! these buffers as well.

use anyhow::{bail, Result};

/// Buffer for building TPM commands
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    /// Put a TPM 1.2 style sized blob (4-byte size prefix + data)
    pub fn put_sized_u32(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.put_bytes(data);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Overwrite a u32 at `pos` (used for size fields)
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// XOR `mask` into the buffer starting at `pos`
    pub fn xor_at(&mut self, pos: usize, mask: &[u8]) {
        for (b, m) in self.data[pos..pos + mask.len()].iter_mut().zip(mask) {
            *b ^= m;
        }
    }
}

/// Buffer for parsing TPM responses
#[derive(Debug, Clone)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            bail!(
                "buffer underflow reading {} bytes (remaining: {})",
                len,
                self.remaining()
            );
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_be_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_be_bytes)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.take(len).map(<[u8]>::to_vec)
    }

    /// Borrow `len` bytes without copying
    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Read a fixed-size field such as a TPM 1.2 nonce
    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take_array()
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Get a TPM 1.2 style sized blob (4-byte size prefix + data)
    pub fn get_sized_u32(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u32()? as usize;
        self.get_bytes(size)
    }

    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    /// Fail if unread bytes are left over
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            bail!("{} trailing bytes after structure", self.remaining());
        }
        Ok(())
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    /// Parse a complete structure, rejecting trailing bytes
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        let value = Self::unmarshal(&mut buf)?;
        buf.finish()?;
        Ok(value)
    }
}

macro_rules! impl_primitive {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, buf: &mut CommandBuffer) {
                    buf.$put(*self);
                }
            }

            impl Unmarshal for $ty {
                fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                    buf.$get()
                }
            }
        )*
    };
}

impl_primitive! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tpm2b_roundtrip() {
        let mut cmd = CommandBuffer::new();
        cmd.put_tpm2b(b"abc");
        cmd.put_sized_u32(b"de");
        assert_eq!(cmd.as_bytes(), &[0, 3, b'a', b'b', b'c', 0, 0, 0, 2, b'd', b'e']);

        let mut rsp = ResponseBuffer::new(cmd.as_bytes());
        assert_eq!(rsp.get_tpm2b().unwrap(), b"abc");
        assert_eq!(rsp.get_sized_u32().unwrap(), b"de");
        assert!(rsp.finish().is_ok());
    }

    #[test]
    fn test_underflow_is_error() {
        let mut rsp = ResponseBuffer::new(&[0x00, 0x05, 0x01]);
        assert!(rsp.get_tpm2b().is_err());
        let mut rsp = ResponseBuffer::new(&[0x01]);
        assert!(rsp.get_u32().is_err());
    }

    #[test]
    fn test_from_bytes_rejects_trailing() {
        assert_eq!(u16::from_bytes(&[0x12, 0x34]).unwrap(), 0x1234);
        assert!(u16::from_bytes(&[0x12, 0x34, 0x56]).is_err());
    }

    #[test]
    fn test_xor_at() {
        let mut cmd = CommandBuffer::new();
        cmd.put_bytes(&[0xff, 0x00, 0x0f, 0xf0]);
        cmd.xor_at(1, &[0xaa, 0xff]);
        assert_eq!(cmd.as_bytes(), &[0xff, 0xaa, 0xf0, 0xf0]);
    }
}
