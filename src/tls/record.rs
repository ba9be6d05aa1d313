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

//! Record layer over an async byte channel.
//!
//! Reading and writing are split so a channel can hand each half to its own task.
//! `RecordWriter` buffers whole flights and only touches the socket on `flush`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    tls::{
        alert::{Alert, AlertDescription, AlertLevel},
        cipher::RecordProtection,
        defrag::Defragmenter,
        messages::HandshakeMessage,
        suites::ProtocolVersion,
    },
    utils::{TlsError, TlsResult},
};

pub const MAX_PLAINTEXT: usize = 1 << 14;
const HEADER_LEN: usize = 5;
/// Largest handshake body: 64 KiB, plus room for long certificate chains.
pub const MAX_HANDSHAKE_LEN: usize = 64 * 1024 + 192 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    Heartbeat,
    Unknown(u8),
}

impl ContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => Self::ChangeCipherSpec,
            21 => Self::Alert,
            22 => Self::Handshake,
            23 => Self::ApplicationData,
            24 => Self::Heartbeat,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::ChangeCipherSpec => 20,
            Self::Alert => 21,
            Self::Handshake => 22,
            Self::ApplicationData => 23,
            Self::Heartbeat => 24,
            Self::Unknown(v) => v,
        }
    }
}

/// One complete protocol message as seen above the record layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(HandshakeMessage),
    Alert(Alert),
    ChangeCipherSpec,
    ApplicationData(Vec<u8>),
    Heartbeat(Vec<u8>),
}

fn record_overflow(reason: impl Into<String>) -> TlsError {
    TlsError::alert(AlertDescription::RecordOverflow, reason)
}

/// Inbound half: header parsing, size limits, decryption and message reassembly.
pub struct RecordReader<R> {
    io: R,
    protection: RecordProtection,
    max_plaintext: usize,
    tls13: bool,
    negotiated: Option<ProtocolVersion>,
    defrag: Defragmenter,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(io: R) -> Self {
        let mut defrag = Defragmenter::new();
        // Registration of fixed types cannot collide.
        let _ = defrag.add_static_size(ContentType::Alert.to_u8(), 2);
        let _ = defrag.add_static_size(ContentType::ChangeCipherSpec.to_u8(), 1);
        let _ = defrag.add_dynamic_size(ContentType::Handshake.to_u8(), 1, 3, 4, MAX_HANDSHAKE_LEN);
        Self {
            io,
            protection: RecordProtection::Null,
            max_plaintext: MAX_PLAINTEXT,
            tls13: false,
            negotiated: None,
            defrag,
        }
    }

    /// Switches decryption keys. Fails if a handshake message straddles the change.
    pub fn set_protection(&mut self, protection: RecordProtection) -> TlsResult<()> {
        if self.defrag.has_partial_of(ContentType::Handshake.to_u8()) {
            return Err(TlsError::unexpected("handshake message spans a key change"));
        }
        self.protection = protection;
        Ok(())
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.negotiated = Some(version);
        self.tls13 = version.is_tls13();
    }

    /// Largest plaintext accepted, from our advertised record_size_limit.
    pub fn set_max_plaintext(&mut self, limit: usize) {
        self.max_plaintext = limit.min(MAX_PLAINTEXT);
    }

    pub fn is_protected(&self) -> bool {
        !self.protection.is_null()
    }

    pub fn get_ref(&self) -> &R {
        &self.io
    }

    pub fn into_inner(self) -> R {
        self.io
    }

    fn ciphertext_limit(&self) -> usize {
        if self.protection.is_null() {
            self.max_plaintext
        } else if self.tls13 {
            self.max_plaintext + 256
        } else {
            self.max_plaintext + 2048
        }
    }

    /// Reads and decrypts exactly one record.
    pub async fn read_record(&mut self) -> TlsResult<(ContentType, Vec<u8>)> {
        let mut header = [0u8; HEADER_LEN];
        self.io.read_exact(&mut header).await?;
        if header[0] & 0x80 != 0 {
            return Err(TlsError::unexpected("SSLv2 record header"));
        }
        if header[1] != 3 {
            return Err(TlsError::alert(
                AlertDescription::ProtocolVersion,
                format!("record version {}.{}", header[1], header[2]),
            ));
        }
        let version = ProtocolVersion(u16::from_be_bytes([header[1], header[2]]));
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if len > self.ciphertext_limit() {
            return Err(record_overflow(format!("{len}-byte record")));
        }
        let mut body = vec![0u8; len];
        self.io.read_exact(&mut body).await?;

        let outer = header[0];
        // Middlebox-compatibility CCS arrives unprotected in TLS 1.3.
        let plain = if self.tls13 && outer == ContentType::ChangeCipherSpec.to_u8() {
            (outer, body)
        } else {
            self.protection.decrypt(outer, version, &body)?
        };
        let (typ, payload) = (ContentType::from_u8(plain.0), plain.1);
        if payload.len() > self.max_plaintext {
            return Err(record_overflow(format!("{}-byte plaintext", payload.len())));
        }
        if payload.is_empty() && typ != ContentType::ApplicationData {
            return Err(TlsError::unexpected(format!("empty {typ:?} record")));
        }
        tracing::trace!(?typ, len = payload.len(), "record in");
        Ok((typ, payload))
    }

    /// Next complete message, reassembling handshake/alert fragments.
    pub async fn read_message(&mut self) -> TlsResult<Message> {
        loop {
            if let Some((typ, data)) = self.defrag.get_message()? {
                match ContentType::from_u8(typ) {
                    ContentType::Handshake => {
                        return Ok(Message::Handshake(HandshakeMessage::decode(data, self.negotiated)?));
                    }
                    ContentType::Alert => {
                        return Ok(Message::Alert(Alert {
                            level: AlertLevel::from_u8(data[0]),
                            description: AlertDescription::from_u8(data[1]),
                        }));
                    }
                    _ => {
                        if data != [1] {
                            return Err(TlsError::decode("malformed ChangeCipherSpec"));
                        }
                        if self.tls13 {
                            continue;
                        }
                        return Ok(Message::ChangeCipherSpec);
                    }
                }
            }
            let (typ, payload) = self.read_record().await?;
            match typ {
                ContentType::ApplicationData => {
                    if self.defrag.has_partial() {
                        return Err(TlsError::unexpected("application data inside a fragmented message"));
                    }
                    return Ok(Message::ApplicationData(payload));
                }
                ContentType::Heartbeat => return Ok(Message::Heartbeat(payload)),
                ContentType::Handshake | ContentType::Alert | ContentType::ChangeCipherSpec => {
                    self.defrag.add_data(typ.to_u8(), &payload)?;
                }
                ContentType::Unknown(other) => {
                    return Err(TlsError::unexpected(format!("record content type {other}")));
                }
            }
        }
    }
}

/// Outbound half: fragmentation, encryption and flight buffering.
pub struct RecordWriter<W> {
    io: W,
    protection: RecordProtection,
    version: ProtocolVersion,
    max_fragment: usize,
    pending: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            protection: RecordProtection::Null,
            version: ProtocolVersion::TLS10,
            max_fragment: MAX_PLAINTEXT,
            pending: Vec::new(),
        }
    }

    pub fn set_protection(&mut self, protection: RecordProtection) {
        self.protection = protection;
    }

    /// Version stamped into record headers (TLS 1.3 keeps 1.2).
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = if version.is_tls13() {
            ProtocolVersion::TLS12
        } else {
            version
        };
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Peer's record_size_limit (already adjusted for the TLS 1.3 content-type byte).
    pub fn set_max_fragment(&mut self, limit: usize) {
        self.max_fragment = limit.clamp(1, MAX_PLAINTEXT);
    }

    pub fn is_protected(&self) -> bool {
        !self.protection.is_null()
    }

    pub fn get_ref(&self) -> &W {
        &self.io
    }

    pub fn into_inner(self) -> W {
        self.io
    }

    /// Queues `payload`, split into records no larger than the fragment limit.
    pub fn buffer(&mut self, typ: ContentType, payload: &[u8]) -> TlsResult<()> {
        for chunk in payload.chunks(self.max_fragment) {
            let (outer, body) = self.protection.encrypt(typ.to_u8(), self.version, chunk)?;
            self.pending.push(outer);
            self.pending.extend_from_slice(&self.version.0.to_be_bytes());
            self.pending.extend_from_slice(&(body.len() as u16).to_be_bytes());
            self.pending.extend_from_slice(&body);
            tracing::trace!(?typ, len = chunk.len(), "record out");
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> TlsResult<()> {
        if !self.pending.is_empty() {
            let data = std::mem::take(&mut self.pending);
            self.io.write_all(&data).await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    pub async fn write(&mut self, typ: ContentType, payload: &[u8]) -> TlsResult<()> {
        self.buffer(typ, payload)?;
        self.flush().await
    }

    /// Best-effort alert; write errors are swallowed.
    pub async fn send_alert(&mut self, alert: Alert) {
        self.pending.clear();
        if self.buffer(ContentType::Alert, &alert.encode()).is_ok() {
            let _ = self.flush().await;
        }
    }

    pub async fn shutdown(&mut self) -> TlsResult<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::messages::HandshakePayload;

    #[tokio::test]
    async fn large_handshake_message_is_fragmented_and_reassembled() {
        let (a, b) = tokio::io::duplex(1 << 17);
        let mut writer = RecordWriter::new(a);
        let mut reader = RecordReader::new(b);
        writer.set_max_fragment(512);

        let msg = HandshakeMessage::new(HandshakePayload::Certificate12(vec![vec![0x42; 3000]]));
        writer.buffer(ContentType::Handshake, &msg.raw).unwrap();
        writer.buffer(ContentType::Alert, &Alert::warning(AlertDescription::CloseNotify).encode()).unwrap();
        writer.flush().await.unwrap();

        reader.set_version(ProtocolVersion::TLS12);
        match reader.read_message().await.unwrap() {
            Message::Handshake(got) => assert_eq!(got.raw, msg.raw),
            other => panic!("unexpected {other:?}"),
        }
        match reader.read_message().await.unwrap() {
            Message::Alert(alert) => assert!(alert.is_graceful()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_record_is_record_overflow() {
        let (mut a, b) = tokio::io::duplex(1 << 16);
        let mut reader = RecordReader::new(b);
        let mut raw = vec![22, 3, 3, 0x40, 0x01];
        raw.extend(vec![0u8; 0x4001]);
        a.write_all(&raw).await.unwrap();
        let err = reader.read_record().await.unwrap_err();
        assert_eq!(err.local_alert(), Some(AlertDescription::RecordOverflow));
    }

    #[tokio::test]
    async fn handshake_length_beyond_cap_is_decode_error() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = RecordReader::new(b);
        a.write_all(&[22, 3, 3, 0, 4, 11, 0xff, 0xff, 0xff]).await.unwrap();
        let err = reader.read_message().await.unwrap_err();
        assert_eq!(err.local_alert(), Some(AlertDescription::DecodeError));
    }

    #[tokio::test]
    async fn empty_handshake_record_is_fatal() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = RecordReader::new(b);
        a.write_all(&[22, 3, 3, 0, 0]).await.unwrap();
        let err = reader.read_record().await.unwrap_err();
        assert_eq!(err.local_alert(), Some(AlertDescription::UnexpectedMessage));
    }

    #[tokio::test]
    async fn application_data_passes_through_unbuffered() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = RecordWriter::new(a);
        let mut reader = RecordReader::new(b);
        writer.write(ContentType::ApplicationData, b"hello").await.unwrap();
        assert_eq!(
            reader.read_message().await.unwrap(),
            Message::ApplicationData(b"hello".to_vec())
        );
    }
}
