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

//! Reassembles protocol messages that may be split across (or packed into) records.
//!
//! **Size classes:**
//! - Static: every message of the type has a fixed size (alert = 2, change_cipher_spec = 1).
//! - Dynamic: the message carries its own length field at a fixed offset (handshake:
//!   one type byte, then a 3-byte length, then the body). A declared length above the
//!   registered maximum fails before the body is buffered.
//!
//! Application data never goes through here.

use std::collections::HashMap;

use crate::utils::{TlsError, TlsResult};

#[derive(Debug, Clone, Copy)]
enum SizeClass {
    Static(usize),
    Dynamic {
        offset: usize,
        size_len: usize,
        header_len: usize,
        max_len: usize,
    },
}

/// Per-content-type buffers; messages come out in arrival order per type, and the
/// lowest content type with a complete message goes first.
#[derive(Debug, Default)]
pub struct Defragmenter {
    priorities: Vec<u8>,
    classes: HashMap<u8, SizeClass>,
    buffers: HashMap<u8, Vec<u8>>,
}

impl Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type whose messages are always `size` bytes.
    pub fn add_static_size(&mut self, typ: u8, size: usize) -> TlsResult<()> {
        if size == 0 {
            return Err(TlsError::internal("static message size must be positive"));
        }
        self.register(typ, SizeClass::Static(size))
    }

    /// Registers a type with a big-endian `size_len`-byte length at `offset`; the length
    /// excludes the `header_len`-byte header and may not exceed `max_len`.
    pub fn add_dynamic_size(
        &mut self,
        typ: u8,
        offset: usize,
        size_len: usize,
        header_len: usize,
        max_len: usize,
    ) -> TlsResult<()> {
        if size_len == 0 || size_len > 4 || offset + size_len > header_len {
            return Err(TlsError::internal("bad dynamic size layout"));
        }
        self.register(
            typ,
            SizeClass::Dynamic {
                offset,
                size_len,
                header_len,
                max_len,
            },
        )
    }

    fn register(&mut self, typ: u8, class: SizeClass) -> TlsResult<()> {
        if self.classes.contains_key(&typ) {
            return Err(TlsError::internal(format!("content type {typ} registered twice")));
        }
        self.classes.insert(typ, class);
        self.buffers.insert(typ, Vec::new());
        self.priorities.push(typ);
        self.priorities.sort_unstable();
        Ok(())
    }

    pub fn is_registered(&self, typ: u8) -> bool {
        self.classes.contains_key(&typ)
    }

    pub fn add_data(&mut self, typ: u8, data: &[u8]) -> TlsResult<()> {
        match self.buffers.get_mut(&typ) {
            Some(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            None => Err(TlsError::internal(format!("content type {typ} not registered"))),
        }
    }

    /// Next complete message as `(type, bytes)`, or `None` if every buffer is partial.
    pub fn get_message(&mut self) -> TlsResult<Option<(u8, Vec<u8>)>> {
        for typ in &self.priorities {
            let (Some(class), Some(buf)) = (self.classes.get(typ), self.buffers.get_mut(typ)) else {
                continue;
            };
            let need = match *class {
                SizeClass::Static(size) => size,
                SizeClass::Dynamic {
                    offset,
                    size_len,
                    header_len,
                    max_len,
                } => {
                    if buf.len() < header_len {
                        continue;
                    }
                    let len = buf[offset..offset + size_len]
                        .iter()
                        .fold(0usize, |acc, b| (acc << 8) | *b as usize);
                    if len > max_len {
                        return Err(TlsError::decode(format!(
                            "{len}-byte message of type {typ} exceeds {max_len}"
                        )));
                    }
                    header_len + len
                }
            };
            if buf.len() >= need {
                let rest = buf.split_off(need);
                let message = std::mem::replace(buf, rest);
                return Ok(Some((*typ, message)));
            }
        }
        Ok(None)
    }

    /// True if any registered type holds a partial message.
    pub fn has_partial(&self) -> bool {
        self.buffers.values().any(|b| !b.is_empty())
    }

    pub fn has_partial_of(&self, typ: u8) -> bool {
        self.buffers.get(&typ).map(|b| !b.is_empty()).unwrap_or(false)
    }

    pub fn clear_buffers(&mut self) {
        for buf in self.buffers.values_mut() {
            buf.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls_defrag() -> Defragmenter {
        let mut d = Defragmenter::new();
        d.add_static_size(21, 2).unwrap();
        d.add_static_size(20, 1).unwrap();
        d.add_dynamic_size(22, 1, 3, 4, 1024).unwrap();
        d
    }

    #[test]
    fn handshake_split_across_records() {
        let mut d = tls_defrag();
        d.add_data(22, &[1, 0, 0]).unwrap();
        assert!(d.get_message().unwrap().is_none());
        d.add_data(22, &[3, 0xaa]).unwrap();
        assert!(d.get_message().unwrap().is_none());
        d.add_data(22, &[0xbb, 0xcc, 2, 0, 0]).unwrap();
        assert_eq!(d.get_message().unwrap(), Some((22, vec![1, 0, 0, 3, 0xaa, 0xbb, 0xcc])));
        assert!(d.get_message().unwrap().is_none());
        assert!(d.has_partial_of(22));
    }

    #[test]
    fn packed_messages_come_out_one_by_one() {
        let mut d = tls_defrag();
        d.add_data(22, &[14, 0, 0, 0, 20, 0, 0, 1, 9]).unwrap();
        assert_eq!(d.get_message().unwrap(), Some((22, vec![14, 0, 0, 0])));
        assert_eq!(d.get_message().unwrap(), Some((22, vec![20, 0, 0, 1, 9])));
        assert!(!d.has_partial());
    }

    #[test]
    fn static_types_complete_immediately_and_take_priority() {
        let mut d = tls_defrag();
        d.add_data(22, &[14, 0, 0, 0]).unwrap();
        d.add_data(21, &[2, 40]).unwrap();
        assert_eq!(d.get_message().unwrap(), Some((21, vec![2, 40])));
        assert_eq!(d.get_message().unwrap(), Some((22, vec![14, 0, 0, 0])));
    }

    #[test]
    fn oversized_length_fails_before_the_body_arrives() {
        let mut d = tls_defrag();
        d.add_data(22, &[11, 0x00, 0x04, 0x01]).unwrap();
        assert!(d.get_message().is_err());

        let mut d = tls_defrag();
        d.add_data(22, &[11, 0x00, 0x04, 0x00]).unwrap();
        assert!(d.get_message().unwrap().is_none());
    }

    #[test]
    fn unregistered_type_is_rejected_and_clear_empties() {
        let mut d = tls_defrag();
        assert!(d.add_data(23, b"x").is_err());
        assert!(d.add_static_size(21, 2).is_err());
        d.add_data(21, &[1]).unwrap();
        d.clear_buffers();
        assert!(!d.has_partial());
    }
}
