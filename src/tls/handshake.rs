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

//! Plumbing shared by the client and server state machines.
//!
//! **Pieces:**
//! - `Conn`: record reader/writer halves plus the running transcript. Every handshake
//!   message queued or received through it lands in the transcript unless the caller
//!   explicitly takes the raw path (hello messages, whose hashing depends on HRR/PSK).
//! - `Established`: everything the application-data phase needs once Finished has been
//!   verified.
//! - Negotiation helpers both roles use (ALPN, Finished comparison, key derivation).

use std::sync::Arc;

use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::{
    tls::{
        alert::{Alert, AlertDescription, AlertLevel},
        cipher::{key_block_len, split_key_block, RecordProtection},
        credentials::{select_scheme, tls13_signed_content, CertifiedKey, PeerKey, SignatureScheme},
        messages::{
            Certificate13, CertificateEntry, CertificateVerify, HandshakeMessage, HandshakePayload,
            HandshakeType,
        },
        prf::{key_block, HashAlgorithm, Transcript},
        record::{ContentType, Message, RecordReader, RecordWriter},
        schedule::{finished_verify_data, KeySchedule},
        session::Session,
        suites::{CipherSuite, ProtocolVersion},
    },
    utils::{TlsError, TlsResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Maps a received alert onto the error it terminates the connection with.
///
/// close_notify and every warning end the connection gracefully as `Closed`.
pub(crate) fn alert_outcome(alert: Alert) -> TlsError {
    match alert.level {
        _ if alert.description == AlertDescription::CloseNotify => TlsError::Closed,
        AlertLevel::Warning => {
            tracing::debug!(description = ?alert.description, "warning alert, closing");
            TlsError::Closed
        }
        _ => TlsError::PeerAlert(alert.description),
    }
}

fn describe(message: &Message) -> String {
    match message {
        Message::Handshake(m) => format!("{:?}", m.typ()),
        Message::Alert(a) => format!("alert {:?}", a.description),
        Message::ChangeCipherSpec => "ChangeCipherSpec".to_string(),
        Message::ApplicationData(_) => "application data".to_string(),
        Message::Heartbeat(_) => "heartbeat".to_string(),
    }
}

/// Unexpected-message error naming what arrived instead of `wanted`.
pub(crate) fn out_of_order(wanted: &str, got: HandshakeType) -> TlsError {
    TlsError::unexpected(format!("expected {wanted}, got {got:?}"))
}

/// A connection while its handshake runs.
pub(crate) struct Conn<IO> {
    pub reader: RecordReader<ReadHalf<IO>>,
    pub writer: RecordWriter<WriteHalf<IO>>,
    pub transcript: Transcript,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Conn<IO> {
    pub fn new(io: IO) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            reader: RecordReader::new(read),
            writer: RecordWriter::new(write),
            transcript: Transcript::new(),
        }
    }

    /// Next message; any alert becomes the error that ends the handshake.
    pub async fn recv(&mut self) -> TlsResult<Message> {
        match self.reader.read_message().await {
            Ok(Message::Alert(alert)) => Err(alert_outcome(alert)),
            Ok(message) => Ok(message),
            Err(TlsError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(TlsError::Closed),
            Err(err) => Err(err),
        }
    }

    /// Next handshake message, not yet added to the transcript.
    pub async fn recv_handshake_raw(&mut self) -> TlsResult<HandshakeMessage> {
        match self.recv().await? {
            Message::Handshake(message) => Ok(message),
            other => Err(TlsError::unexpected(format!(
                "expected a handshake message, got {}",
                describe(&other)
            ))),
        }
    }

    /// Next handshake message, added to the transcript.
    pub async fn recv_handshake(&mut self) -> TlsResult<HandshakeMessage> {
        let message = self.recv_handshake_raw().await?;
        self.transcript.add(&message.raw);
        Ok(message)
    }

    pub async fn expect_ccs(&mut self) -> TlsResult<()> {
        match self.recv().await? {
            Message::ChangeCipherSpec => Ok(()),
            other => Err(TlsError::unexpected(format!(
                "expected ChangeCipherSpec, got {}",
                describe(&other)
            ))),
        }
    }

    /// Buffers a message for the current flight and records it in the transcript.
    pub fn queue(&mut self, payload: HandshakePayload) -> TlsResult<HandshakeMessage> {
        let message = HandshakeMessage::new(payload);
        self.queue_message(&message)?;
        Ok(message)
    }

    pub fn queue_message(&mut self, message: &HandshakeMessage) -> TlsResult<()> {
        self.transcript.add(&message.raw);
        self.writer.buffer(ContentType::Handshake, &message.raw)
    }

    /// Buffers a message without touching the transcript.
    pub fn queue_untracked(&mut self, message: &HandshakeMessage) -> TlsResult<()> {
        self.writer.buffer(ContentType::Handshake, &message.raw)
    }

    pub fn queue_ccs(&mut self) -> TlsResult<()> {
        self.writer.buffer(ContentType::ChangeCipherSpec, &[1])
    }

    pub async fn flush(&mut self) -> TlsResult<()> {
        self.writer.flush().await
    }

    /// Sends the fatal alert for a locally detected failure, then hands the error back.
    pub async fn fail(&mut self, err: TlsError) -> TlsError {
        if let Some(description) = err.local_alert() {
            tracing::debug!(?description, error = %err, "aborting handshake");
            self.writer.send_alert(Alert::fatal(description)).await;
        }
        err
    }

    pub fn into_parts(self) -> (RecordReader<ReadHalf<IO>>, RecordWriter<WriteHalf<IO>>, Transcript) {
        (self.reader, self.writer, self.transcript)
    }
}

/// Constant-time Finished comparison; mismatches are decrypt_error.
pub(crate) fn check_finished(expected: &[u8], received: &[u8]) -> TlsResult<()> {
    if expected.len() == received.len() && bool::from(expected.ct_eq(received)) {
        Ok(())
    } else {
        Err(TlsError::alert(AlertDescription::DecryptError, "Finished verify_data mismatch"))
    }
}

/// PSK binder over `transcript_hash` (ClientHello truncated before the binders list).
pub(crate) fn psk_binder(hash: HashAlgorithm, psk: &[u8], external: bool, transcript_hash: &[u8]) -> Vec<u8> {
    let binder_key = KeySchedule::new(hash, Some(psk)).binder_key(external);
    finished_verify_data(hash, &binder_key, transcript_hash)
}

/// TLS 1.3 Certificate and, when a key could sign, CertificateVerify.
///
/// Both messages are appended to `transcript`. An absent or unusable certificate yields
/// an empty Certificate message, which is how a client declines a request.
pub(crate) fn certificate_flight13(
    cert: Option<&CertifiedKey>,
    context: &[u8],
    peer_schemes: &[SignatureScheme],
    transcript: &mut Transcript,
    hash: HashAlgorithm,
    server: bool,
) -> TlsResult<Vec<HandshakeMessage>> {
    let chosen = cert.and_then(|c| {
        select_scheme(ProtocolVersion::TLS13, c.key.as_ref(), peer_schemes).map(|scheme| (c, scheme))
    });
    let entries = chosen
        .map(|(c, _)| {
            c.chain
                .iter()
                .map(|der| CertificateEntry {
                    cert: der.clone(),
                    extensions: Vec::new(),
                })
                .collect()
        })
        .unwrap_or_default();
    let certificate = HandshakeMessage::new(HandshakePayload::Certificate13(Certificate13 {
        context: context.to_vec(),
        entries,
    }));
    transcript.add(&certificate.raw);
    let mut flight = vec![certificate];

    if let Some((cert, scheme)) = chosen {
        let content = tls13_signed_content(server, &transcript.hash(hash));
        let signature = cert.key.sign(scheme, &content)?;
        let verify = HandshakeMessage::new(HandshakePayload::CertificateVerify(CertificateVerify {
            scheme: Some(scheme),
            signature,
        }));
        transcript.add(&verify.raw);
        flight.push(verify);
    }
    Ok(flight)
}

/// Record protection for both directions of a TLS ≤1.2 connection.
pub(crate) struct LegacyKeys {
    pub client: RecordProtection,
    pub server: RecordProtection,
}

pub(crate) fn legacy_keys(
    version: ProtocolVersion,
    suite: &CipherSuite,
    master: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    encrypt_then_mac: bool,
) -> TlsResult<LegacyKeys> {
    let block = key_block(
        version,
        suite.hash,
        master,
        client_random,
        server_random,
        key_block_len(suite),
    );
    let (client, server) = split_key_block(suite, &block)?;
    Ok(LegacyKeys {
        client: RecordProtection::legacy(suite, &client, encrypt_then_mac)?,
        server: RecordProtection::legacy(suite, &server, encrypt_then_mac)?,
    })
}

/// Server-side ALPN choice: our first protocol the client also offered.
pub(crate) fn select_alpn(ours: &[Vec<u8>], offered: Option<&[Vec<u8>]>) -> TlsResult<Option<Vec<u8>>> {
    let Some(offered) = offered else {
        return Ok(None);
    };
    if ours.is_empty() {
        return Ok(None);
    }
    ours.iter()
        .find(|p| offered.contains(p))
        .cloned()
        .map(Some)
        .ok_or_else(|| {
            TlsError::alert(
                AlertDescription::NoApplicationProtocol,
                "no application protocol in common",
            )
        })
}

/// Plaintext limit implied by a record_size_limit value.
pub(crate) fn fragment_limit(limit: u16, version: ProtocolVersion) -> usize {
    let limit = usize::from(limit);
    if version.is_tls13() {
        limit.saturating_sub(1)
    } else {
        limit
    }
}

/// TLS 1.3 secrets still needed after the handshake.
#[derive(Clone)]
pub(crate) struct Tls13Secrets {
    pub hash: HashAlgorithm,
    pub client_traffic: Vec<u8>,
    pub server_traffic: Vec<u8>,
    pub resumption_master: Vec<u8>,
    /// Fingerprint shared by every session resumed from the same full handshake.
    pub lineage: [u8; 32],
}

/// Result of a completed handshake.
pub struct Established {
    pub role: Role,
    pub version: ProtocolVersion,
    pub suite: &'static CipherSuite,
    pub session: Session,
    pub resumed: bool,
    pub peer_key: Option<Arc<dyn PeerKey>>,
    /// Peer agreed to receive heartbeat requests from us.
    pub heartbeat_send: bool,
    /// We advertised willingness to answer heartbeat requests.
    pub heartbeat_answer: bool,
    pub(crate) tls13: Option<Tls13Secrets>,
    /// Handshake context through the client Finished (post-handshake authentication).
    pub(crate) transcript: Transcript,
    pub(crate) post_handshake_auth: bool,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("role", &self.role)
            .field("version", &self.version)
            .field("suite", &self.suite.name)
            .field("resumed", &self.resumed)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_mismatch_is_decrypt_error() {
        assert!(check_finished(&[1, 2, 3], &[1, 2, 3]).is_ok());
        let err = check_finished(&[1, 2, 3], &[1, 2, 4]).unwrap_err();
        assert_eq!(err.local_alert(), Some(AlertDescription::DecryptError));
        assert!(check_finished(&[1, 2, 3], &[1, 2]).is_err());
    }

    #[test]
    fn alpn_prefers_server_order() {
        let ours = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let offered = vec![b"http/1.1".to_vec(), b"h2".to_vec()];
        assert_eq!(select_alpn(&ours, Some(offered.as_slice())).unwrap(), Some(b"h2".to_vec()));
        assert_eq!(select_alpn(&ours, None).unwrap(), None);
        let err = select_alpn(&ours, Some(&[b"spdy/3".to_vec()][..])).unwrap_err();
        assert_eq!(err.local_alert(), Some(AlertDescription::NoApplicationProtocol));
    }

    #[test]
    fn warnings_and_close_notify_end_gracefully() {
        assert!(matches!(
            alert_outcome(Alert::warning(AlertDescription::UserCanceled)),
            TlsError::Closed
        ));
        assert!(matches!(
            alert_outcome(Alert::warning(AlertDescription::CloseNotify)),
            TlsError::Closed
        ));
        assert!(matches!(
            alert_outcome(Alert::fatal(AlertDescription::HandshakeFailure)),
            TlsError::PeerAlert(AlertDescription::HandshakeFailure)
        ));
    }

    #[test]
    fn record_size_limit_reserves_type_byte_in_tls13() {
        assert_eq!(fragment_limit(1024, ProtocolVersion::TLS13), 1023);
        assert_eq!(fragment_limit(1024, ProtocolVersion::TLS12), 1024);
    }
}
