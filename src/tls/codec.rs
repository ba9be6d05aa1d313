/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! Cursor-style reader and length-prefixed writers for TLS wire structures.

use bytes::BufMut;

use crate::utils::{TlsError, TlsResult};

/// Borrowing cursor over a handshake body. Every short read is a `decode_error`.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, len: usize) -> TlsResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(TlsError::decode(format!(
                "need {len} bytes, {} left",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    pub fn u8(&mut self) -> TlsResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> TlsResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u24(&mut self) -> TlsResult<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn u32(&mut self) -> TlsResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn array<const N: usize>(&mut self) -> TlsResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn vec_u8(&mut self) -> TlsResult<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    pub fn vec_u16(&mut self) -> TlsResult<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    pub fn vec_u24(&mut self) -> TlsResult<&'a [u8]> {
        let len = self.u24()? as usize;
        self.take(len)
    }

    /// Sub-reader over a u16-length-prefixed block.
    pub fn sub_u16(&mut self) -> TlsResult<Reader<'a>> {
        Ok(Reader::new(self.vec_u16()?))
    }

    pub fn sub_u8(&mut self) -> TlsResult<Reader<'a>> {
        Ok(Reader::new(self.vec_u8()?))
    }

    pub fn sub_u24(&mut self) -> TlsResult<Reader<'a>> {
        Ok(Reader::new(self.vec_u24()?))
    }

    /// Reads a u16-prefixed list of u16 values.
    pub fn list_u16(&mut self) -> TlsResult<Vec<u16>> {
        let mut sub = self.sub_u16()?;
        if sub.remaining() % 2 != 0 {
            return Err(TlsError::decode("odd-length u16 list"));
        }
        let mut out = Vec::with_capacity(sub.remaining() / 2);
        while !sub.is_empty() {
            out.push(sub.u16()?);
        }
        Ok(out)
    }

    pub fn expect_empty(&self, what: &str) -> TlsResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(TlsError::decode(format!(
                "{} trailing bytes after {what}",
                self.remaining()
            )))
        }
    }
}

pub fn put_u24(out: &mut Vec<u8>, value: u32) {
    out.put_u8((value >> 16) as u8);
    out.put_u8((value >> 8) as u8);
    out.put_u8(value as u8);
}

/// Writes a u8 length prefix around whatever `body` appends.
pub fn put_u8_prefixed(out: &mut Vec<u8>, body: impl FnOnce(&mut Vec<u8>)) {
    let at = out.len();
    out.put_u8(0);
    body(out);
    let len = out.len() - at - 1;
    out[at] = len as u8;
}

pub fn put_u16_prefixed(out: &mut Vec<u8>, body: impl FnOnce(&mut Vec<u8>)) {
    let at = out.len();
    out.put_u16(0);
    body(out);
    let len = (out.len() - at - 2) as u16;
    out[at..at + 2].copy_from_slice(&len.to_be_bytes());
}

pub fn put_u24_prefixed(out: &mut Vec<u8>, body: impl FnOnce(&mut Vec<u8>)) {
    let at = out.len();
    put_u24(out, 0);
    body(out);
    let len = (out.len() - at - 3) as u32;
    out[at..at + 3].copy_from_slice(&len.to_be_bytes()[1..]);
}

pub fn put_vec_u8(out: &mut Vec<u8>, data: &[u8]) {
    out.put_u8(data.len() as u8);
    out.extend_from_slice(data);
}

pub fn put_vec_u16(out: &mut Vec<u8>, data: &[u8]) {
    out.put_u16(data.len() as u16);
    out.extend_from_slice(data);
}

pub fn put_vec_u24(out: &mut Vec<u8>, data: &[u8]) {
    put_u24(out, data.len() as u32);
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_writers_patch_lengths() {
        let mut out = Vec::new();
        put_u16_prefixed(&mut out, |w| {
            put_u24_prefixed(w, |w| w.extend_from_slice(b"abc"));
        });
        assert_eq!(out, vec![0, 6, 0, 0, 3, b'a', b'b', b'c']);

        let mut reader = Reader::new(&out);
        let mut inner = reader.sub_u16().unwrap();
        assert_eq!(inner.vec_u24().unwrap(), b"abc");
        assert!(reader.is_empty());
    }

    #[test]
    fn short_reads_are_decode_errors() {
        let mut reader = Reader::new(&[0, 5, 1]);
        let err = reader.vec_u16().unwrap_err();
        assert_eq!(
            err.local_alert(),
            Some(crate::tls::alert::AlertDescription::DecodeError)
        );
    }
}
