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

//! HTTP/2 frame codec (RFC 7540 §4, §6).
//!
//! Frames are decoded once into [`Frame`] and matched exhaustively by the connection
//! and stream code. Unknown frame types decode to [`Frame::Unknown`] so the consumer can
//! log and skip them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
pub const MAX_FRAME_SIZE_LIMIT: usize = (1 << 24) - 1;
pub const DEFAULT_WINDOW: u32 = 65_535;
pub const MAX_WINDOW: u32 = (1 << 31) - 1;
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

pub mod settings {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

pub mod error_code {
    pub const NO_ERROR: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const FLOW_CONTROL_ERROR: u32 = 0x3;
    pub const CANCEL: u32 = 0x8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    /// Draft-era BLOCKED frame, sent by peers that are stalled on flow control.
    Blocked,
    Unknown(u8),
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            0xb => Self::Blocked,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Data => 0x0,
            Self::Headers => 0x1,
            Self::Priority => 0x2,
            Self::RstStream => 0x3,
            Self::Settings => 0x4,
            Self::PushPromise => 0x5,
            Self::Ping => 0x6,
            Self::GoAway => 0x7,
            Self::WindowUpdate => 0x8,
            Self::Continuation => 0x9,
            Self::Blocked => 0xb,
            Self::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("{len}-byte frame exceeds the {max}-byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("malformed {kind:?} frame: {reason}")]
    Malformed { kind: FrameKind, reason: &'static str },

    #[error("{kind:?} frame on stream {stream_id}")]
    WrongStream { kind: FrameKind, stream_id: u32 },
}

fn malformed(kind: FrameKind, reason: &'static str) -> FrameError {
    FrameError::Malformed { kind, reason }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub kind: FrameKind,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        Some(Self {
            length: (usize::from(buf[0]) << 16) | (usize::from(buf[1]) << 8) | usize::from(buf[2]),
            kind: FrameKind::from_u8(buf[3]),
            flags: buf[4],
            stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & MAX_WINDOW,
        })
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_uint(self.length as u64, 3);
        out.put_u8(self.kind.to_u8());
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & MAX_WINDOW);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Bytes charged against flow control, padding included.
        flow_len: usize,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        error_code: u32,
    },
    Settings {
        ack: bool,
        params: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Blocked {
        stream_id: u32,
    },
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

/// Strips the pad-length byte and trailing padding from a PADDED payload.
fn unpad(kind: FrameKind, flags: u8, mut payload: Bytes) -> Result<Bytes, FrameError> {
    if flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(malformed(kind, "missing pad length"));
    }
    let pad = usize::from(payload.get_u8());
    if pad > payload.len() {
        return Err(malformed(kind, "padding exceeds payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data { .. } => FrameKind::Data,
            Frame::Headers { .. } => FrameKind::Headers,
            Frame::Priority { .. } => FrameKind::Priority,
            Frame::RstStream { .. } => FrameKind::RstStream,
            Frame::Settings { .. } => FrameKind::Settings,
            Frame::PushPromise { .. } => FrameKind::PushPromise,
            Frame::Ping { .. } => FrameKind::Ping,
            Frame::GoAway { .. } => FrameKind::GoAway,
            Frame::WindowUpdate { .. } => FrameKind::WindowUpdate,
            Frame::Continuation { .. } => FrameKind::Continuation,
            Frame::Blocked { .. } => FrameKind::Blocked,
            Frame::Unknown { kind, .. } => FrameKind::Unknown(*kind),
        }
    }

    /// Stream the frame belongs to; 0 for connection-level frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Blocked { stream_id }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    pub fn decode(header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        let FrameHeader {
            kind,
            flags,
            stream_id,
            ..
        } = header;
        let connection_level = matches!(kind, FrameKind::Settings | FrameKind::Ping | FrameKind::GoAway);
        let stream_level = matches!(
            kind,
            FrameKind::Data
                | FrameKind::Headers
                | FrameKind::Priority
                | FrameKind::RstStream
                | FrameKind::PushPromise
                | FrameKind::Continuation
        );
        if (connection_level && stream_id != 0) || (stream_level && stream_id == 0) {
            return Err(FrameError::WrongStream { kind, stream_id });
        }

        let frame = match kind {
            FrameKind::Data => {
                let flow_len = payload.len();
                Frame::Data {
                    stream_id,
                    data: unpad(kind, flags, payload)?,
                    end_stream: flags & flags::END_STREAM != 0,
                    flow_len,
                }
            }
            FrameKind::Headers => {
                let mut block = unpad(kind, flags, payload)?;
                if flags & flags::PRIORITY != 0 {
                    if block.len() < 5 {
                        return Err(malformed(kind, "truncated priority fields"));
                    }
                    block.advance(5);
                }
                Frame::Headers {
                    stream_id,
                    block,
                    end_stream: flags & flags::END_STREAM != 0,
                    end_headers: flags & flags::END_HEADERS != 0,
                }
            }
            FrameKind::Priority => {
                if payload.len() != 5 {
                    return Err(malformed(kind, "length must be 5"));
                }
                Frame::Priority { stream_id }
            }
            FrameKind::RstStream => {
                if payload.len() != 4 {
                    return Err(malformed(kind, "length must be 4"));
                }
                Frame::RstStream {
                    stream_id,
                    error_code: payload.get_u32(),
                }
            }
            FrameKind::Settings => {
                let ack = flags & flags::ACK != 0;
                if ack && !payload.is_empty() {
                    return Err(malformed(kind, "ACK with a payload"));
                }
                if payload.len() % 6 != 0 {
                    return Err(malformed(kind, "length not a multiple of 6"));
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    params.push((payload.get_u16(), payload.get_u32()));
                }
                Frame::Settings { ack, params }
            }
            FrameKind::PushPromise => {
                let mut body = unpad(kind, flags, payload)?;
                if body.len() < 4 {
                    return Err(malformed(kind, "missing promised stream id"));
                }
                Frame::PushPromise {
                    stream_id,
                    promised_id: body.get_u32() & MAX_WINDOW,
                }
            }
            FrameKind::Ping => {
                if payload.len() != 8 {
                    return Err(malformed(kind, "length must be 8"));
                }
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                Frame::Ping {
                    ack: flags & flags::ACK != 0,
                    payload: data,
                }
            }
            FrameKind::GoAway => {
                if payload.len() < 8 {
                    return Err(malformed(kind, "shorter than 8 bytes"));
                }
                let last_stream_id = payload.get_u32() & MAX_WINDOW;
                let error_code = payload.get_u32();
                Frame::GoAway {
                    last_stream_id,
                    error_code,
                    debug: payload,
                }
            }
            FrameKind::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(malformed(kind, "length must be 4"));
                }
                let increment = payload.get_u32() & MAX_WINDOW;
                if increment == 0 {
                    return Err(malformed(kind, "zero increment"));
                }
                Frame::WindowUpdate { stream_id, increment }
            }
            FrameKind::Continuation => Frame::Continuation {
                stream_id,
                block: payload,
                end_headers: flags & flags::END_HEADERS != 0,
            },
            FrameKind::Blocked => Frame::Blocked { stream_id },
            FrameKind::Unknown(kind) => Frame::Unknown { kind, stream_id },
        };
        Ok(frame)
    }

    /// Takes one complete frame off the front of `buf`, if there is one.
    pub fn parse(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>, FrameError> {
        let Some(header) = FrameHeader::parse(buf) else {
            return Ok(None);
        };
        if header.length > max_frame_size {
            return Err(FrameError::TooLarge {
                len: header.length,
                max: max_frame_size,
            });
        }
        if buf.len() < FRAME_HEADER_LEN + header.length {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(header.length).freeze();
        Frame::decode(header, payload).map(Some)
    }

    pub fn encode(&self, out: &mut BytesMut) {
        let mut header = FrameHeader {
            length: 0,
            kind: self.kind(),
            flags: 0,
            stream_id: self.stream_id(),
        };
        let mut payload = BytesMut::new();
        match self {
            Frame::Data { data, end_stream, .. } => {
                if *end_stream {
                    header.flags |= flags::END_STREAM;
                }
                payload.extend_from_slice(data);
            }
            Frame::Headers {
                block,
                end_stream,
                end_headers,
                ..
            } => {
                if *end_stream {
                    header.flags |= flags::END_STREAM;
                }
                if *end_headers {
                    header.flags |= flags::END_HEADERS;
                }
                payload.extend_from_slice(block);
            }
            Frame::Priority { .. } => payload.put_slice(&[0, 0, 0, 0, 15]),
            Frame::RstStream { error_code, .. } => payload.put_u32(*error_code),
            Frame::Settings { ack, params } => {
                if *ack {
                    header.flags |= flags::ACK;
                }
                for (id, value) in params {
                    payload.put_u16(*id);
                    payload.put_u32(*value);
                }
            }
            Frame::PushPromise { promised_id, .. } => payload.put_u32(*promised_id),
            Frame::Ping { ack, payload: data } => {
                if *ack {
                    header.flags |= flags::ACK;
                }
                payload.put_slice(data);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug,
            } => {
                payload.put_u32(*last_stream_id);
                payload.put_u32(*error_code);
                payload.extend_from_slice(debug);
            }
            Frame::WindowUpdate { increment, .. } => payload.put_u32(*increment),
            Frame::Continuation { block, end_headers, .. } => {
                if *end_headers {
                    header.flags |= flags::END_HEADERS;
                }
                payload.extend_from_slice(block);
            }
            Frame::Blocked { .. } | Frame::Unknown { .. } => {}
        }
        header.length = payload.len();
        out.reserve(FRAME_HEADER_LEN + payload.len());
        header.write(out);
        out.extend_from_slice(&payload);
    }
}

/// Splits an encoded header block into HEADERS plus as many CONTINUATION frames as needed.
pub fn header_frames(stream_id: u32, block: Bytes, end_stream: bool, max_frame_size: usize) -> Vec<Frame> {
    let max = max_frame_size.max(1);
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut rest = block;
    while rest.len() > max {
        chunks.push(rest.split_to(max));
    }
    chunks.push(rest);

    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            if i == 0 {
                Frame::Headers {
                    stream_id,
                    block: chunk,
                    end_stream,
                    end_headers: i == last,
                }
            } else {
                Frame::Continuation {
                    stream_id,
                    block: chunk,
                    end_headers: i == last,
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        out
    }

    #[test]
    fn partial_input_waits_for_more_bytes() {
        let frame = Frame::WindowUpdate {
            stream_id: 3,
            increment: 1024,
        };
        let full = encoded(&frame);
        let mut buf = BytesMut::from(&full[..10]);
        assert_eq!(Frame::parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(), None);
        buf.extend_from_slice(&full[10..]);
        assert_eq!(Frame::parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn padded_data_charges_padding_to_flow_control() {
        let mut raw = BytesMut::new();
        FrameHeader {
            length: 8,
            kind: FrameKind::Data,
            flags: flags::PADDED | flags::END_STREAM,
            stream_id: 1,
        }
        .write(&mut raw);
        raw.extend_from_slice(&[3, b'a', b'b', b'c', b'd', 0, 0, 0]);
        match Frame::parse(&mut raw, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            Some(Frame::Data {
                data,
                end_stream,
                flow_len,
                ..
            }) => {
                assert_eq!(&data[..], b"abcd");
                assert!(end_stream);
                assert_eq!(flow_len, 8);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversize_and_misplaced_frames_are_rejected() {
        let big = Frame::Data {
            stream_id: 1,
            data: Bytes::from(vec![0u8; 100]),
            end_stream: false,
            flow_len: 100,
        };
        let mut buf = encoded(&big);
        assert!(matches!(
            Frame::parse(&mut buf, 64),
            Err(FrameError::TooLarge { len: 100, max: 64 })
        ));

        let mut raw = BytesMut::new();
        FrameHeader {
            length: 8,
            kind: FrameKind::Ping,
            flags: 0,
            stream_id: 5,
        }
        .write(&mut raw);
        raw.extend_from_slice(&[0; 8]);
        assert!(matches!(
            Frame::parse(&mut raw, DEFAULT_MAX_FRAME_SIZE),
            Err(FrameError::WrongStream { .. })
        ));
    }

    #[test]
    fn zero_window_increment_is_malformed() {
        let mut raw = BytesMut::new();
        FrameHeader {
            length: 4,
            kind: FrameKind::WindowUpdate,
            flags: 0,
            stream_id: 0,
        }
        .write(&mut raw);
        raw.extend_from_slice(&[0; 4]);
        assert!(Frame::parse(&mut raw, DEFAULT_MAX_FRAME_SIZE).is_err());
    }

    #[test]
    fn long_header_blocks_use_continuation() {
        let frames = header_frames(7, Bytes::from(vec![1u8; 25]), true, 10);
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            frames[0],
            Frame::Headers {
                end_stream: true,
                end_headers: false,
                ..
            }
        ));
        assert!(matches!(frames[2], Frame::Continuation { end_headers: true, .. }));
    }

    #[test]
    fn unknown_types_survive_decoding() {
        let mut raw = BytesMut::new();
        FrameHeader {
            length: 2,
            kind: FrameKind::Unknown(0xfa),
            flags: 0,
            stream_id: 0,
        }
        .write(&mut raw);
        raw.extend_from_slice(&[9, 9]);
        assert_eq!(
            Frame::parse(&mut raw, DEFAULT_MAX_FRAME_SIZE).unwrap(),
            Some(Frame::Unknown { kind: 0xfa, stream_id: 0 })
        );
    }
}
