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

//! Established TLS connection.
//!
//! **Post-handshake traffic handled here:**
//! - TLS 1.3 NewSessionTicket (stored for later resumption) and KeyUpdate.
//! - TLS 1.3 post-handshake client authentication (client role).
//! - Heartbeat request/response (RFC 6520) when negotiated.
//! - Renegotiation attempts, which are refused with a `no_renegotiation` warning.
//!
//! The inbound half never writes. Anything that requires an answer is turned into a
//! [`Reaction`] and applied by the outbound half, either inline (`read_chunk`) or by the
//! pump tasks behind [`SecureChannel::into_io`].

use std::{sync::Arc, time::Instant};

use parking_lot::Mutex;
use rand::RngCore;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf},
    sync::mpsc,
};

use crate::{
    tls::{
        alert::{Alert, AlertDescription},
        cipher::RecordProtection,
        config::ClientConfig,
        credentials::PeerKey,
        handshake::{alert_outcome, certificate_flight13, Conn, Established, Role},
        messages::{HandshakeMessage, HandshakePayload},
        prf::{HashAlgorithm, Transcript},
        record::{ContentType, Message, RecordReader, RecordWriter, MAX_PLAINTEXT},
        schedule::{finished_verify_data, next_traffic_secret, resumption_psk},
        session::{secret_fingerprint, ClientTicket, Session, SessionCache},
        suites::{CipherSuite, ProtocolVersion},
    },
    utils::{TlsError, TlsResult},
};

const HEARTBEAT_REQUEST: u8 = 1;
const HEARTBEAT_RESPONSE: u8 = 2;
const HEARTBEAT_PADDING: usize = 16;

/// Work the inbound half hands to the outbound half.
pub(crate) enum Reaction {
    /// Peer rotated its key and asked us to rotate ours.
    UpdateKey,
    HeartbeatResponse(Vec<u8>),
    Warning(AlertDescription),
    /// Post-handshake Certificate/CertificateVerify; Finished is added with the current key.
    Authenticate {
        flight: Vec<HandshakeMessage>,
        transcript: Transcript,
    },
    Fatal(AlertDescription),
}

/// Negotiated parameters shared by both halves.
struct Shared {
    role: Role,
    version: ProtocolVersion,
    suite: &'static CipherSuite,
    session: Session,
    resumed: bool,
    peer_key: Option<Arc<dyn PeerKey>>,
    heartbeat_send: bool,
    heartbeat_answer: bool,
    /// Payload of the heartbeat request still waiting for its response.
    heartbeat_pending: Mutex<Option<Vec<u8>>>,
}

struct ReadSide<IO> {
    reader: RecordReader<ReadHalf<IO>>,
    shared: Arc<Shared>,
    /// TLS 1.3 hash and the secret protecting inbound records.
    secret: Option<(HashAlgorithm, Vec<u8>)>,
    resumption_master: Vec<u8>,
    transcript: Transcript,
    post_handshake_auth: bool,
    client_config: Option<Arc<ClientConfig>>,
    server_cache: Option<Arc<SessionCache>>,
    /// Fingerprint of the session family, revoked on a fatal error.
    lineage: [u8; 32],
    closed: bool,
}

struct WriteSide<IO> {
    writer: RecordWriter<WriteHalf<IO>>,
    shared: Arc<Shared>,
    secret: Option<(HashAlgorithm, Vec<u8>)>,
    closed: bool,
}

/// A TLS connection after a successful handshake.
pub struct SecureChannel<IO> {
    read: ReadSide<IO>,
    write: WriteSide<IO>,
    pending: Vec<u8>,
}

impl<IO> std::fmt::Debug for SecureChannel<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("role", &self.read.shared.role)
            .field("version", &self.read.shared.version)
            .field("suite", &self.read.shared.suite.name)
            .field("alpn", &self.read.shared.session.alpn)
            .finish()
    }
}

impl<IO> SecureChannel<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        conn: Conn<IO>,
        established: Established,
        client_config: Option<Arc<ClientConfig>>,
        server_cache: Option<Arc<SessionCache>>,
    ) -> Self {
        let (reader, writer, _) = conn.into_parts();
        let Established {
            role,
            version,
            suite,
            session,
            resumed,
            peer_key,
            heartbeat_send,
            heartbeat_answer,
            tls13,
            transcript,
            post_handshake_auth,
        } = established;

        let (read_secret, write_secret, resumption_master, lineage) = match tls13 {
            Some(secrets) => {
                let (inbound, outbound) = match role {
                    Role::Client => (secrets.server_traffic, secrets.client_traffic),
                    Role::Server => (secrets.client_traffic, secrets.server_traffic),
                };
                (
                    Some((secrets.hash, inbound)),
                    Some((secrets.hash, outbound)),
                    secrets.resumption_master,
                    secrets.lineage,
                )
            }
            None => (None, None, Vec::new(), secret_fingerprint(&session.master_secret)),
        };
        let shared = Arc::new(Shared {
            role,
            version,
            suite,
            session,
            resumed,
            peer_key,
            heartbeat_send,
            heartbeat_answer,
            heartbeat_pending: Mutex::new(None),
        });
        Self {
            read: ReadSide {
                reader,
                shared: shared.clone(),
                secret: read_secret,
                resumption_master,
                transcript,
                post_handshake_auth,
                client_config,
                server_cache,
                lineage,
                closed: false,
            },
            write: WriteSide {
                writer,
                shared,
                secret: write_secret,
                closed: false,
            },
            pending: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.read.shared.role
    }

    pub fn version(&self) -> ProtocolVersion {
        self.read.shared.version
    }

    pub fn suite(&self) -> &'static CipherSuite {
        self.read.shared.suite
    }

    pub fn session(&self) -> &Session {
        &self.read.shared.session
    }

    pub fn alpn(&self) -> Option<&[u8]> {
        self.read.shared.session.alpn.as_deref()
    }

    pub fn is_resumed(&self) -> bool {
        self.read.shared.resumed
    }

    pub fn peer_key(&self) -> Option<&Arc<dyn PeerKey>> {
        self.read.shared.peer_key.as_ref()
    }

    /// Next block of application data; `None` once the peer sent close_notify.
    pub async fn read_chunk(&mut self) -> TlsResult<Option<Vec<u8>>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        let mut reactions = Vec::new();
        let result = self.read.read_chunk(&mut reactions).await;
        for reaction in reactions {
            self.write.react(reaction).await?;
        }
        if let Err(err) = &result {
            if let Some(description) = err.local_alert() {
                self.write.react(Reaction::Fatal(description)).await?;
            }
        }
        result
    }

    /// Fills `buf` from buffered or freshly read application data; 0 means closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> TlsResult<usize> {
        if self.pending.is_empty() {
            match self.read_chunk().await? {
                Some(data) => self.pending = data,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> TlsResult<()> {
        self.write.write_all(data).await
    }

    /// Rotates our TLS 1.3 sending key, optionally asking the peer to do the same.
    pub async fn key_update(&mut self, request_peer: bool) -> TlsResult<()> {
        self.write.key_update(request_peer).await
    }

    /// Sends a heartbeat request; the matching response is consumed by the read path.
    pub async fn send_heartbeat(&mut self, payload: &[u8]) -> TlsResult<()> {
        self.write.send_heartbeat(payload).await
    }

    /// Sends close_notify and shuts the write side down.
    pub async fn close(&mut self) -> TlsResult<()> {
        self.write.close().await
    }

    /// Bridges the channel to an in-memory byte stream driven by two pump tasks.
    pub fn into_io(self) -> DuplexStream {
        let (app, inner) = tokio::io::duplex(4 * MAX_PLAINTEXT);
        let (mut inner_read, mut inner_write) = tokio::io::split(inner);
        let (tx, mut rx) = mpsc::unbounded_channel::<Reaction>();
        let Self {
            read: mut read_side,
            write: mut write_side,
            pending,
        } = self;

        tokio::spawn(async move {
            if !pending.is_empty() && inner_write.write_all(&pending).await.is_err() {
                return;
            }
            loop {
                let mut reactions = Vec::new();
                let result = read_side.read_chunk(&mut reactions).await;
                for reaction in reactions {
                    let _ = tx.send(reaction);
                }
                match result {
                    Ok(Some(data)) => {
                        if inner_write.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(error = %err, "secure channel read failed");
                        if let Some(description) = err.local_alert() {
                            let _ = tx.send(Reaction::Fatal(description));
                        }
                        break;
                    }
                }
            }
            let _ = inner_write.shutdown().await;
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PLAINTEXT];
            let mut reactions_open = true;
            loop {
                tokio::select! {
                    reaction = rx.recv(), if reactions_open => match reaction {
                        Some(reaction) => {
                            if write_side.react(reaction).await.is_err() {
                                break;
                            }
                        }
                        None => reactions_open = false,
                    },
                    read = inner_read.read(&mut buf) => match read {
                        Ok(0) | Err(_) => {
                            let _ = write_side.close().await;
                            break;
                        }
                        Ok(n) => {
                            if let Err(err) = write_side.write_all(&buf[..n]).await {
                                tracing::debug!(error = %err, "secure channel write failed");
                                break;
                            }
                        }
                    },
                }
            }
        });
        app
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> ReadSide<IO> {
    async fn read_chunk(&mut self, reactions: &mut Vec<Reaction>) -> TlsResult<Option<Vec<u8>>> {
        if self.closed {
            return Ok(None);
        }
        let result = self.next_data(reactions).await;
        match &result {
            Ok(None) => self.closed = true,
            Err(TlsError::Closed) => {
                self.closed = true;
                return Ok(None);
            }
            Err(err) => {
                self.closed = true;
                self.invalidate_session(err);
            }
            Ok(Some(_)) => {}
        }
        result
    }

    async fn next_data(&mut self, reactions: &mut Vec<Reaction>) -> TlsResult<Option<Vec<u8>>> {
        loop {
            let message = match self.reader.read_message().await {
                Ok(message) => message,
                Err(TlsError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("peer closed without close_notify");
                    return Err(TlsError::Closed);
                }
                Err(err) => return Err(err),
            };
            match message {
                Message::ApplicationData(data) if data.is_empty() => continue,
                Message::ApplicationData(data) => return Ok(Some(data)),
                Message::Alert(alert) => match alert_outcome(alert) {
                    TlsError::Closed => return Ok(None),
                    err => return Err(err),
                },
                Message::Handshake(message) => self.post_handshake(message, reactions)?,
                Message::Heartbeat(payload) => self.heartbeat(&payload, reactions)?,
                Message::ChangeCipherSpec => {
                    return Err(TlsError::unexpected("ChangeCipherSpec after the handshake"));
                }
            }
        }
    }

    /// A fatal error makes the session unusable for resumption.
    fn invalidate_session(&self, err: &TlsError) {
        if err.local_alert().is_none() && !matches!(err, TlsError::PeerAlert(_)) {
            return;
        }
        let name = self.shared.session.server_name.as_deref();
        if let (Some(config), Some(name)) = (&self.client_config, name) {
            if let Some(store) = &config.sessions {
                store.forget(name);
            }
        }
        if let Some(cache) = &self.server_cache {
            tracing::debug!(reason = %err, "revoking session after fatal error");
            cache.revoke(&self.shared.session.session_id, self.lineage);
        }
    }

    fn post_handshake(&mut self, message: HandshakeMessage, reactions: &mut Vec<Reaction>) -> TlsResult<()> {
        let tls13 = self.shared.version.is_tls13();
        let role = self.shared.role;
        match message.payload {
            HandshakePayload::NewSessionTicket13(ticket) if tls13 && role == Role::Client => {
                let Some((hash, _)) = &self.secret else {
                    return Err(TlsError::internal("TLS 1.3 channel without secrets"));
                };
                let name = self.shared.session.server_name.as_deref();
                let store = self.client_config.as_ref().and_then(|c| c.sessions.as_ref());
                if let (Some(store), Some(name)) = (store, name) {
                    tracing::debug!(server_name = name, lifetime = ticket.lifetime, "storing session ticket");
                    store.push_ticket(
                        name,
                        ClientTicket {
                            psk: resumption_psk(*hash, &self.resumption_master, &ticket.nonce),
                            ticket: ticket.ticket,
                            suite: self.shared.suite.id,
                            age_add: ticket.age_add,
                            lifetime: ticket.lifetime,
                            received_at: Instant::now(),
                            alpn: self.shared.session.alpn.clone(),
                        },
                    );
                }
                Ok(())
            }
            HandshakePayload::KeyUpdate { update_requested } if tls13 => {
                let Some((hash, secret)) = &self.secret else {
                    return Err(TlsError::internal("TLS 1.3 channel without secrets"));
                };
                let next = next_traffic_secret(*hash, secret);
                self.reader
                    .set_protection(RecordProtection::tls13(self.shared.suite, &next)?)?;
                self.secret = Some((*hash, next));
                tracing::debug!(update_requested, "peer updated its traffic key");
                if update_requested {
                    reactions.push(Reaction::UpdateKey);
                }
                Ok(())
            }
            HandshakePayload::CertificateRequest13(request) if tls13 && role == Role::Client => {
                if !self.post_handshake_auth {
                    return Err(TlsError::unexpected("unsolicited post-handshake CertificateRequest"));
                }
                if request.context.is_empty() {
                    return Err(TlsError::illegal("post-handshake CertificateRequest without a context"));
                }
                let Some((hash, _)) = &self.secret else {
                    return Err(TlsError::internal("TLS 1.3 channel without secrets"));
                };
                let cert = self.client_config.as_ref().and_then(|c| c.client_cert.as_ref());
                let mut transcript = self.transcript.fork();
                transcript.add(&message.raw);
                let flight =
                    certificate_flight13(cert, &request.context, request.schemes(), &mut transcript, *hash, false)?;
                tracing::debug!(certificate = flight.len() > 1, "answering post-handshake authentication");
                reactions.push(Reaction::Authenticate { flight, transcript });
                Ok(())
            }
            HandshakePayload::HelloRequest if !tls13 && role == Role::Client => {
                tracing::debug!("refusing renegotiation");
                reactions.push(Reaction::Warning(AlertDescription::NoRenegotiation));
                Ok(())
            }
            HandshakePayload::ClientHello(_) if !tls13 && role == Role::Server => {
                tracing::debug!("refusing renegotiation");
                reactions.push(Reaction::Warning(AlertDescription::NoRenegotiation));
                Ok(())
            }
            other => Err(TlsError::unexpected(format!(
                "{:?} after the handshake",
                other.typ()
            ))),
        }
    }

    fn heartbeat(&mut self, payload: &[u8], reactions: &mut Vec<Reaction>) -> TlsResult<()> {
        if !self.shared.heartbeat_answer && !self.shared.heartbeat_send {
            return Err(TlsError::unexpected("heartbeat was not negotiated"));
        }
        if payload.len() < 3 {
            return Ok(());
        }
        let len = usize::from(u16::from_be_bytes([payload[1], payload[2]]));
        // Messages whose length field overruns the record are discarded silently.
        if 3 + len + HEARTBEAT_PADDING > payload.len() {
            tracing::debug!(len, record = payload.len(), "discarding malformed heartbeat");
            return Ok(());
        }
        let body = &payload[3..3 + len];
        match payload[0] {
            HEARTBEAT_REQUEST if self.shared.heartbeat_answer => {
                reactions.push(Reaction::HeartbeatResponse(body.to_vec()));
            }
            HEARTBEAT_RESPONSE => {
                let mut pending = self.shared.heartbeat_pending.lock();
                if pending.as_deref() == Some(body) {
                    *pending = None;
                    tracing::debug!(len, "heartbeat answered");
                }
            }
            other => tracing::debug!(typ = other, "ignoring heartbeat message"),
        }
        Ok(())
    }
}

fn heartbeat_message(typ: u8, payload: &[u8]) -> TlsResult<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| TlsError::internal("heartbeat payload too long"))?;
    let mut out = Vec::with_capacity(3 + payload.len() + HEARTBEAT_PADDING);
    out.push(typ);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    let mut padding = [0u8; HEARTBEAT_PADDING];
    rand::rngs::OsRng.fill_bytes(&mut padding);
    out.extend_from_slice(&padding);
    Ok(out)
}

impl<IO: AsyncRead + AsyncWrite + Unpin> WriteSide<IO> {
    async fn write_all(&mut self, data: &[u8]) -> TlsResult<()> {
        if self.closed {
            return Err(TlsError::Closed);
        }
        self.writer.write(ContentType::ApplicationData, data).await
    }

    fn rotate(&mut self) -> TlsResult<()> {
        let Some((hash, secret)) = &self.secret else {
            return Err(TlsError::internal("key update needs TLS 1.3"));
        };
        let next = next_traffic_secret(*hash, secret);
        self.writer
            .set_protection(RecordProtection::tls13(self.shared.suite, &next)?);
        self.secret = Some((*hash, next));
        Ok(())
    }

    async fn key_update(&mut self, request_peer: bool) -> TlsResult<()> {
        if !self.shared.version.is_tls13() {
            return Err(TlsError::internal("key update needs TLS 1.3"));
        }
        let message = HandshakeMessage::new(HandshakePayload::KeyUpdate {
            update_requested: request_peer,
        });
        self.writer.buffer(ContentType::Handshake, &message.raw)?;
        self.rotate()?;
        self.writer.flush().await?;
        tracing::debug!(request_peer, "updated sending key");
        Ok(())
    }

    async fn send_heartbeat(&mut self, payload: &[u8]) -> TlsResult<()> {
        if !self.shared.heartbeat_send {
            return Err(TlsError::internal("peer does not accept heartbeat requests"));
        }
        let message = heartbeat_message(HEARTBEAT_REQUEST, payload)?;
        *self.shared.heartbeat_pending.lock() = Some(payload.to_vec());
        self.writer.write(ContentType::Heartbeat, &message).await
    }

    async fn react(&mut self, reaction: Reaction) -> TlsResult<()> {
        if self.closed {
            return Ok(());
        }
        match reaction {
            Reaction::UpdateKey => self.key_update(false).await,
            Reaction::HeartbeatResponse(payload) => {
                let message = heartbeat_message(HEARTBEAT_RESPONSE, &payload)?;
                self.writer.write(ContentType::Heartbeat, &message).await
            }
            Reaction::Warning(description) => {
                let alert = Alert::warning(description);
                self.writer.write(ContentType::Alert, &alert.encode()).await
            }
            Reaction::Authenticate { flight, transcript } => {
                let Some((hash, secret)) = &self.secret else {
                    return Err(TlsError::internal("post-handshake authentication needs TLS 1.3"));
                };
                for message in &flight {
                    self.writer.buffer(ContentType::Handshake, &message.raw)?;
                }
                let verify_data = finished_verify_data(*hash, secret, &transcript.hash(*hash));
                let finished = HandshakeMessage::new(HandshakePayload::Finished(verify_data));
                self.writer.buffer(ContentType::Handshake, &finished.raw)?;
                self.writer.flush().await
            }
            Reaction::Fatal(description) => {
                self.writer.send_alert(Alert::fatal(description)).await;
                self.closed = true;
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> TlsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.send_alert(Alert::warning(AlertDescription::CloseNotify)).await;
        self.writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_messages_carry_padding() {
        let message = heartbeat_message(HEARTBEAT_REQUEST, b"ping").unwrap();
        assert_eq!(message[0], HEARTBEAT_REQUEST);
        assert_eq!(&message[1..3], &[0, 4]);
        assert_eq!(&message[3..7], b"ping");
        assert_eq!(message.len(), 3 + 4 + HEARTBEAT_PADDING);
    }
}
