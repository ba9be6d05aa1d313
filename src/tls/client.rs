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

//! Client side of the handshake, SSL 3.0 through TLS 1.3.
//!
//! **Flow:**
//! 1. ClientHello offering every enabled version, with resumption state from the
//!    configured `ClientSessionStore` (a TLS 1.3 ticket, or a TLS ≤1.2 session id/ticket).
//! 2. At most one HelloRetryRequest, answered with a second ClientHello.
//! 3. ServerHello validation: version, downgrade sentinel, suite, unsolicited extensions.
//! 4. The TLS 1.3 or TLS ≤1.2 remainder, full or abbreviated.
//!
//! A failed handshake sends the matching fatal alert and drops any resumption state held
//! for the server, so the next attempt starts from a full handshake.

use std::{net::IpAddr, sync::Arc};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    tls::{
        alert::AlertDescription,
        channel::SecureChannel,
        cipher::RecordProtection,
        config::ClientConfig,
        credentials::{select_scheme, tls13_signed_content, CertifiedKey, KeyKind, PeerKey, SignatureScheme},
        extensions::{
            Extension, ExtensionList, HeartbeatMode, KeyShareEntry, PskIdentity, PskKeyExchangeMode, PskOffer,
            EXT_COOKIE, EXT_EC_POINT_FORMATS, EXT_ENCRYPT_THEN_MAC, EXT_EXTENDED_MASTER_SECRET, EXT_KEY_SHARE,
            EXT_POST_HANDSHAKE_AUTH, EXT_PRE_SHARED_KEY, EXT_PSK_KEY_EXCHANGE_MODES, EXT_RENEGOTIATION_INFO,
            EXT_SESSION_TICKET, EXT_SIGNATURE_ALGORITHMS, EXT_SRP, EXT_SUPPORTED_VERSIONS,
        },
        groups::EphemeralKey,
        handshake::{
            certificate_flight13, check_finished, fragment_limit, legacy_keys, out_of_order, psk_binder, Conn,
            Established, Role, Tls13Secrets,
        },
        kx::{ClientKx, ClientKxInput, Randoms},
        messages::{
            CertificateVerify, ClientHello, HandshakeMessage, HandshakePayload, NewSessionTicket12, ServerHello,
            DOWNGRADE_TLS11, DOWNGRADE_TLS12,
        },
        prf::{self, master_secret, HashAlgorithm, Transcript},
        schedule::{finished_verify_data, KeySchedule},
        session::{secret_fingerprint, Session},
        suites::{
            AuthAlgorithm, CipherSuite, KeyExchangeAlgorithm, ProtocolVersion,
            TLS_EMPTY_RENEGOTIATION_INFO_SCSV, TLS_FALLBACK_SCSV,
        },
    },
    utils::{TlsError, TlsResult},
};

/// Runs a client handshake over `io`.
///
/// `server_name` is sent as SNI unless it is an IP literal, handed to the certificate
/// verifier and used as the key for stored resumption state.
pub async fn connect<IO>(
    config: Arc<ClientConfig>,
    server_name: Option<&str>,
    io: IO,
) -> TlsResult<SecureChannel<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = Conn::new(io);
    let mut handshake = ClientHandshake::new(config.clone(), server_name)?;
    match handshake.run(&mut conn).await {
        Ok(established) => {
            tracing::debug!(
                version = %established.version,
                suite = established.suite.name,
                resumed = established.resumed,
                server_name = ?server_name,
                "client handshake complete"
            );
            Ok(SecureChannel::new(conn, established, Some(config), None))
        }
        Err(err) => {
            if let (Some(store), Some(name)) = (config.sessions.as_ref(), server_name) {
                if handshake.resuming() {
                    store.forget(name);
                }
            }
            Err(conn.fail(err).await)
        }
    }
}

fn sni_host(name: &str) -> Option<&str> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() || trimmed.parse::<IpAddr>().is_ok() {
        None
    } else {
        Some(trimmed)
    }
}

fn random32() -> [u8; 32] {
    let mut out = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut out);
    out
}

/// A PSK offered in the ClientHello.
#[derive(Clone)]
struct OfferedPsk {
    identity: Vec<u8>,
    obfuscated_age: u32,
    secret: Vec<u8>,
    hash: HashAlgorithm,
    external: bool,
}

/// What the server agreed to in its hello messages (TLS ≤1.2) or EncryptedExtensions.
#[derive(Debug, Default)]
struct Negotiated {
    alpn: Option<Vec<u8>>,
    heartbeat_send: bool,
    heartbeat_answer: bool,
    record_size_limit: Option<u16>,
}

struct ClientHandshake {
    config: Arc<ClientConfig>,
    server_name: Option<String>,
    random: [u8; 32],
    session_id: Vec<u8>,
    offered_suites: Vec<&'static CipherSuite>,
    key_shares: Vec<EphemeralKey>,
    psks: Vec<OfferedPsk>,
    cached: Option<Session>,
    sent_extensions: Vec<u16>,
    hello_version: ProtocolVersion,
    cookie: Option<Vec<u8>>,
    retry_suite: Option<u16>,
    sent_ccs: bool,
}

impl ClientHandshake {
    fn new(config: Arc<ClientConfig>, server_name: Option<&str>) -> TlsResult<Self> {
        let versions = config.versions;
        let offered_suites = config.offered_suites();
        if offered_suites.is_empty() {
            return Err(TlsError::internal("no cipher suite usable for the enabled versions"));
        }
        let offer_tls13 = versions.max.is_tls13();
        let allows_legacy = versions.min < ProtocolVersion::TLS13;

        let mut key_shares = Vec::new();
        if offer_tls13 {
            for group in config
                .key_share_groups
                .iter()
                .filter(|g| config.groups.contains(*g))
            {
                key_shares.push(EphemeralKey::generate(*group)?);
            }
            if key_shares.is_empty() {
                if let Some(group) = config.groups.first() {
                    key_shares.push(EphemeralKey::generate(*group)?);
                }
            }
        }

        let mut psks = Vec::new();
        let mut cached = None;
        if let (Some(store), Some(name)) = (config.sessions.as_ref(), server_name) {
            if offer_tls13 {
                if let Some(ticket) = store.take_ticket(name) {
                    if let Some(suite) = offered_suites.iter().find(|s| s.id == ticket.suite) {
                        psks.push(OfferedPsk {
                            identity: ticket.ticket.clone(),
                            obfuscated_age: ticket.obfuscated_age(),
                            secret: ticket.psk.clone(),
                            hash: suite.hash,
                            external: false,
                        });
                    }
                }
            }
            if allows_legacy {
                cached = store.session(name).filter(|s| {
                    !s.version.is_tls13()
                        && versions.contains(s.version)
                        && offered_suites.iter().any(|suite| suite.id == s.suite)
                });
            }
        }
        if offer_tls13 {
            for psk in &config.external_psks {
                psks.push(OfferedPsk {
                    identity: psk.identity.clone(),
                    obfuscated_age: 0,
                    secret: psk.secret.clone(),
                    hash: psk.hash,
                    external: true,
                });
            }
        }

        let session_id = match &cached {
            Some(session) if session.ticket.is_none() => session.session_id.clone(),
            Some(_) => random32().to_vec(),
            None if offer_tls13 => random32().to_vec(),
            None => Vec::new(),
        };

        Ok(Self {
            server_name: server_name.map(str::to_owned),
            random: random32(),
            session_id,
            offered_suites,
            key_shares,
            psks,
            cached,
            sent_extensions: Vec::new(),
            hello_version: versions.max.min(ProtocolVersion::TLS12),
            cookie: None,
            retry_suite: None,
            sent_ccs: false,
            config,
        })
    }

    fn resuming(&self) -> bool {
        self.cached.is_some() || self.psks.iter().any(|p| !p.external)
    }

    fn build_hello(&mut self, prefix: &Transcript) -> TlsResult<HandshakeMessage> {
        let config = self.config.clone();
        let versions = config.versions;
        let offer_tls13 = versions.max.is_tls13();
        let allows_legacy = versions.min < ProtocolVersion::TLS13;

        let mut cipher_suites: Vec<u16> = self.offered_suites.iter().map(|s| s.id).collect();
        if versions.max.is_ssl3() {
            cipher_suites.push(TLS_EMPTY_RENEGOTIATION_INFO_SCSV);
        }
        if config.send_fallback_scsv {
            cipher_suites.push(TLS_FALLBACK_SCSV);
        }

        let mut extensions = Vec::new();
        if !versions.max.is_ssl3() {
            if let Some(host) = self.server_name.as_deref().and_then(sni_host) {
                extensions.push(Extension::ServerName(Some(host.to_owned())));
            }
            if offer_tls13 {
                extensions.push(Extension::SupportedVersionsOffer(versions.descending()));
            }
            let uses_curves = self.offered_suites.iter().any(|s| {
                matches!(
                    s.kx,
                    KeyExchangeAlgorithm::Tls13 | KeyExchangeAlgorithm::Ecdhe | KeyExchangeAlgorithm::EcdhAnon
                )
            });
            if uses_curves {
                extensions.push(Extension::SupportedGroups(config.groups.clone()));
                if allows_legacy {
                    extensions.push(Extension::EcPointFormats(vec![0]));
                }
            }
            if versions.max >= ProtocolVersion::TLS12 {
                extensions.push(Extension::SignatureAlgorithms(config.signature_schemes.clone()));
            }
            if !config.alpn_protocols.is_empty() {
                extensions.push(Extension::Alpn(config.alpn_protocols.clone()));
            }
            if allows_legacy {
                extensions.push(Extension::RenegotiationInfo(Vec::new()));
                if config.extended_master_secret {
                    extensions.push(Extension::ExtendedMasterSecret);
                }
                if config.encrypt_then_mac && self.offered_suites.iter().any(|s| s.is_cbc()) {
                    extensions.push(Extension::EncryptThenMac);
                }
                if config.sessions.is_some() {
                    let ticket = self
                        .cached
                        .as_ref()
                        .and_then(|s| s.ticket.clone())
                        .unwrap_or_default();
                    extensions.push(Extension::SessionTicket(ticket));
                }
                if let Some((user, _)) = &config.srp {
                    if self.offered_suites.iter().any(|s| s.kx == KeyExchangeAlgorithm::Srp) {
                        extensions.push(Extension::Srp(user.as_bytes().to_vec()));
                    }
                }
            }
            if let Some(limit) = config.record_size_limit {
                extensions.push(Extension::RecordSizeLimit(limit));
            }
            if config.heartbeat {
                extensions.push(Extension::Heartbeat(HeartbeatMode::PeerAllowedToSend));
            }
            if offer_tls13 {
                extensions.push(Extension::KeyShareOffer(
                    self.key_shares
                        .iter()
                        .map(|k| KeyShareEntry {
                            group: k.group(),
                            key_exchange: k.public_key().to_vec(),
                        })
                        .collect(),
                ));
                if let Some(cookie) = &self.cookie {
                    extensions.push(Extension::Cookie(cookie.clone()));
                }
                extensions.push(Extension::PskKeyExchangeModes(vec![
                    PskKeyExchangeMode::PskDheKe,
                    PskKeyExchangeMode::PskKe,
                ]));
                if config.post_handshake_auth && config.client_cert.is_some() {
                    extensions.push(Extension::PostHandshakeAuth);
                }
                if !self.psks.is_empty() {
                    extensions.push(Extension::PreSharedKeyOffer(PskOffer {
                        identities: self
                            .psks
                            .iter()
                            .map(|p| PskIdentity {
                                identity: p.identity.clone(),
                                obfuscated_ticket_age: p.obfuscated_age,
                            })
                            .collect(),
                        binders: self.psks.iter().map(|p| vec![0u8; p.hash.output_len()]).collect(),
                    }));
                }
            }
        }

        let mut hello = ClientHello {
            legacy_version: self.hello_version,
            random: self.random,
            session_id: self.session_id.clone(),
            cipher_suites,
            compression_methods: vec![0],
            extensions,
        };
        self.sent_extensions = hello.extensions.iter().map(Extension::typ).collect();
        if self.psks.is_empty() {
            return Ok(HandshakeMessage::new(HandshakePayload::ClientHello(hello)));
        }

        // Binders cover the hello up to (not including) the binders list itself.
        let placeholder = HandshakeMessage::new(HandshakePayload::ClientHello(hello.clone()));
        let truncated = &placeholder.raw[..placeholder.raw.len() - hello.binders_len()];
        let mut partial = prefix.fork();
        partial.add(truncated);
        let binders: Vec<Vec<u8>> = self
            .psks
            .iter()
            .map(|p| psk_binder(p.hash, &p.secret, p.external, &partial.hash(p.hash)))
            .collect();
        if let Some(Extension::PreSharedKeyOffer(offer)) = hello.extensions.last_mut() {
            offer.binders = binders;
        }
        Ok(HandshakeMessage::new(HandshakePayload::ClientHello(hello)))
    }

    async fn run<IO>(&mut self, conn: &mut Conn<IO>) -> TlsResult<Established>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        conn.writer.set_version(if self.config.versions.max.is_ssl3() {
            ProtocolVersion::SSL3
        } else {
            ProtocolVersion::TLS10
        });
        let hello = self.build_hello(&Transcript::new())?;
        conn.queue_message(&hello)?;
        conn.flush().await?;

        let mut message = conn.recv_handshake_raw().await?;
        let mut server_hello = expect_server_hello(message.payload.clone())?;
        if server_hello.is_retry_request() {
            let suite = self.process_retry(&server_hello)?;
            // The compatibility ChangeCipherSpec may follow the retry request.
            conn.reader.set_version(ProtocolVersion::TLS13);
            conn.transcript.replace_with_message_hash(suite.hash);
            conn.transcript.add(&message.raw);
            if !self.session_id.is_empty() {
                conn.queue_ccs()?;
                self.sent_ccs = true;
            }
            let prefix = conn.transcript.fork();
            let hello = self.build_hello(&prefix)?;
            conn.queue_message(&hello)?;
            conn.flush().await?;

            message = conn.recv_handshake_raw().await?;
            server_hello = expect_server_hello(message.payload.clone())?;
            if server_hello.is_retry_request() {
                return Err(TlsError::unexpected("second HelloRetryRequest"));
            }
        }
        conn.transcript.add(&message.raw);

        let (version, suite) = self.check_server_hello(&server_hello)?;
        conn.reader.set_version(version);
        conn.writer.set_version(version);
        tracing::debug!(%version, suite = suite.name, "server hello accepted");
        if version.is_tls13() {
            self.run_tls13(conn, server_hello, suite).await
        } else {
            self.run_legacy(conn, server_hello, version, suite).await
        }
    }

    /// Validates a HelloRetryRequest and prepares the second ClientHello.
    fn process_retry(&mut self, retry: &ServerHello) -> TlsResult<&'static CipherSuite> {
        if !self.config.versions.max.is_tls13() || retry.version() != ProtocolVersion::TLS13 {
            return Err(TlsError::illegal("HelloRetryRequest without TLS 1.3"));
        }
        let suite = self
            .offered_suites
            .iter()
            .copied()
            .find(|s| s.id == retry.cipher_suite && s.is_tls13())
            .ok_or_else(|| TlsError::illegal("HelloRetryRequest selected an unoffered suite"))?;
        for ext in &retry.extensions {
            if !self.sent_extensions.contains(&ext.typ()) {
                return Err(TlsError::alert(
                    AlertDescription::UnsupportedExtension,
                    format!("unsolicited extension {} in HelloRetryRequest", ext.typ()),
                ));
            }
        }

        let mut changed = false;
        if let Some(Extension::KeyShareRetry(group)) = retry.extensions.find_ext(EXT_KEY_SHARE) {
            if !self.config.groups.contains(group) || self.key_shares.iter().any(|k| k.group() == *group) {
                return Err(TlsError::illegal(format!("HelloRetryRequest asked for {group:?}")));
            }
            self.key_shares = vec![EphemeralKey::generate(*group)?];
            changed = true;
        }
        if let Some(Extension::Cookie(cookie)) = retry.extensions.find_ext(EXT_COOKIE) {
            self.cookie = Some(cookie.clone());
            changed = true;
        }
        if !changed {
            return Err(TlsError::illegal("HelloRetryRequest would not change the ClientHello"));
        }
        // PSKs for another hash cannot be used with the chosen suite.
        self.psks.retain(|p| p.hash == suite.hash);
        self.retry_suite = Some(suite.id);
        tracing::debug!(suite = suite.name, "answering HelloRetryRequest");
        Ok(suite)
    }

    fn check_server_hello(&self, hello: &ServerHello) -> TlsResult<(ProtocolVersion, &'static CipherSuite)> {
        let versions = self.config.versions;
        let selected = hello.extensions.iter().find_map(|e| match e {
            Extension::SupportedVersionSelected(v) => Some(*v),
            _ => None,
        });
        let version = match selected {
            Some(v) => {
                if !v.is_tls13() || !versions.contains(v) || hello.legacy_version != ProtocolVersion::TLS12 {
                    return Err(TlsError::illegal(format!("server selected {v}")));
                }
                v
            }
            None => {
                let v = hello.legacy_version;
                if v.is_tls13() || !versions.contains(v) {
                    return Err(TlsError::alert(
                        AlertDescription::ProtocolVersion,
                        format!("server negotiated {v}"),
                    ));
                }
                v
            }
        };

        let scsv_sent = versions.max.is_ssl3();
        for ext in &hello.extensions {
            let typ = ext.typ();
            let solicited = self.sent_extensions.contains(&typ)
                || (typ == EXT_RENEGOTIATION_INFO && scsv_sent);
            if !solicited {
                return Err(TlsError::alert(
                    AlertDescription::UnsupportedExtension,
                    format!("unsolicited extension {typ} in ServerHello"),
                ));
            }
        }

        if !version.is_tls13() {
            let tail = &hello.random[24..];
            if versions.max.is_tls13() && tail == DOWNGRADE_TLS12 {
                return Err(TlsError::illegal("TLS 1.2 downgrade sentinel"));
            }
            if versions.max >= ProtocolVersion::TLS12
                && version < ProtocolVersion::TLS12
                && tail == DOWNGRADE_TLS11
            {
                return Err(TlsError::illegal("TLS 1.1 downgrade sentinel"));
            }
        }

        let suite = self
            .offered_suites
            .iter()
            .copied()
            .find(|s| s.id == hello.cipher_suite)
            .filter(|s| s.usable_in(version))
            .ok_or_else(|| {
                TlsError::illegal(format!("server selected suite {:#06x}", hello.cipher_suite))
            })?;
        if let Some(retry_suite) = self.retry_suite {
            if retry_suite != suite.id {
                return Err(TlsError::illegal("suite changed after HelloRetryRequest"));
            }
        }
        if hello.compression_method != 0 {
            return Err(TlsError::illegal("compression is not supported"));
        }
        Ok((version, suite))
    }

    fn negotiated(&self, extensions: &[Extension], version: ProtocolVersion) -> TlsResult<Negotiated> {
        let mut out = Negotiated::default();
        for ext in extensions {
            match ext {
                Extension::Alpn(list) => {
                    if list.len() != 1 || !self.config.alpn_protocols.contains(&list[0]) {
                        return Err(TlsError::illegal("server selected an unoffered protocol"));
                    }
                    out.alpn = Some(list[0].clone());
                }
                Extension::Heartbeat(mode) => {
                    out.heartbeat_answer = self.config.heartbeat;
                    out.heartbeat_send = *mode == HeartbeatMode::PeerAllowedToSend;
                }
                Extension::RecordSizeLimit(limit) => {
                    if version.is_tls13() && *limit > 16385 {
                        return Err(TlsError::illegal(format!("record_size_limit {limit}")));
                    }
                    out.record_size_limit = Some(*limit);
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn apply_record_limits<IO>(&self, conn: &mut Conn<IO>, negotiated: &Negotiated, version: ProtocolVersion)
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        if let (Some(ours), Some(theirs)) = (self.config.record_size_limit, negotiated.record_size_limit) {
            conn.writer.set_max_fragment(fragment_limit(theirs, version));
            conn.reader.set_max_plaintext(fragment_limit(ours, version));
        }
    }

    async fn run_tls13<IO>(
        &mut self,
        conn: &mut Conn<IO>,
        hello: ServerHello,
        suite: &'static CipherSuite,
    ) -> TlsResult<Established>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let hash = suite.hash;
        if hello.session_id != self.session_id {
            return Err(TlsError::illegal("legacy_session_id not echoed"));
        }

        let psk = match hello.extensions.find_ext(EXT_PRE_SHARED_KEY) {
            Some(Extension::PreSharedKeySelected(index)) => {
                let psk = self
                    .psks
                    .get(usize::from(*index))
                    .cloned()
                    .ok_or_else(|| TlsError::illegal(format!("server selected PSK {index}")))?;
                if psk.hash != hash {
                    return Err(TlsError::illegal("selected PSK does not match the suite hash"));
                }
                Some(psk)
            }
            _ => None,
        };
        let shared = match hello.extensions.find_ext(EXT_KEY_SHARE) {
            Some(Extension::KeyShareSelected(entry)) => {
                let index = self
                    .key_shares
                    .iter()
                    .position(|k| k.group() == entry.group)
                    .ok_or_else(|| TlsError::illegal(format!("key share for unoffered {:?}", entry.group)))?;
                let key = self.key_shares.swap_remove(index);
                Some(key.agree(&entry.key_exchange)?)
            }
            _ if psk.is_some() => None,
            _ => {
                return Err(TlsError::alert(
                    AlertDescription::MissingExtension,
                    "ServerHello without key_share",
                ))
            }
        };

        let mut schedule = KeySchedule::new(hash, psk.as_ref().map(|p| p.secret.as_slice()));
        schedule.enter_handshake(shared.as_deref());
        let hello_hash = conn.transcript.hash(hash);
        let client_hs = schedule.derive(b"c hs traffic", &hello_hash);
        let server_hs = schedule.derive(b"s hs traffic", &hello_hash);
        conn.reader.set_protection(RecordProtection::tls13(suite, &server_hs)?)?;

        let extensions = match conn.recv_handshake().await?.payload {
            HandshakePayload::EncryptedExtensions(exts) => exts,
            other => return Err(out_of_order("EncryptedExtensions", other.typ())),
        };
        for ext in &extensions {
            let typ = ext.typ();
            if !self.sent_extensions.contains(&typ) {
                return Err(TlsError::alert(
                    AlertDescription::UnsupportedExtension,
                    format!("unsolicited extension {typ} in EncryptedExtensions"),
                ));
            }
            if matches!(
                typ,
                EXT_KEY_SHARE
                    | EXT_PRE_SHARED_KEY
                    | EXT_SUPPORTED_VERSIONS
                    | EXT_PSK_KEY_EXCHANGE_MODES
                    | EXT_COOKIE
                    | EXT_SIGNATURE_ALGORITHMS
                    | EXT_EC_POINT_FORMATS
                    | EXT_SESSION_TICKET
                    | EXT_EXTENDED_MASTER_SECRET
                    | EXT_ENCRYPT_THEN_MAC
                    | EXT_RENEGOTIATION_INFO
                    | EXT_SRP
                    | EXT_POST_HANDSHAKE_AUTH
            ) {
                return Err(TlsError::illegal(format!("extension {typ} not allowed in EncryptedExtensions")));
            }
        }
        let negotiated = self.negotiated(&extensions, ProtocolVersion::TLS13)?;

        let mut cert_request = None;
        let mut peer_key: Option<Arc<dyn PeerKey>> = None;
        let mut peer_chain = Vec::new();
        if psk.is_none() {
            let payload = match conn.recv_handshake().await?.payload {
                HandshakePayload::CertificateRequest13(request) => {
                    if !request.context.is_empty() {
                        return Err(TlsError::illegal("handshake CertificateRequest with a context"));
                    }
                    cert_request = Some(request);
                    conn.recv_handshake().await?.payload
                }
                other => other,
            };
            let certificate = match payload {
                HandshakePayload::Certificate13(cert) => cert,
                other => return Err(out_of_order("Certificate", other.typ())),
            };
            let chain = certificate.chain();
            if chain.is_empty() {
                return Err(TlsError::decode("server sent an empty certificate chain"));
            }
            let key = self
                .config
                .verifier
                .verify_server_chain(&chain, self.server_name.as_deref())?;

            let signed_hash = conn.transcript.hash(hash);
            let verify = match conn.recv_handshake().await?.payload {
                HandshakePayload::CertificateVerify(cv) => cv,
                other => return Err(out_of_order("CertificateVerify", other.typ())),
            };
            let scheme = verify
                .scheme
                .ok_or_else(|| TlsError::decode("CertificateVerify without a scheme"))?;
            if !scheme.allowed_in_tls13() || !self.config.signature_schemes.contains(&scheme) {
                return Err(TlsError::illegal(format!("server signed with {scheme:?}")));
            }
            key.verify(scheme, &tls13_signed_content(true, &signed_hash), &verify.signature)?;
            peer_key = Some(key);
            peer_chain = chain;
        }

        let expected = finished_verify_data(hash, &server_hs, &conn.transcript.hash(hash));
        match conn.recv_handshake().await?.payload {
            HandshakePayload::Finished(verify_data) => check_finished(&expected, &verify_data)?,
            other => return Err(out_of_order("Finished", other.typ())),
        }

        schedule.enter_master();
        let server_finished_hash = conn.transcript.hash(hash);
        let client_app = schedule.derive(b"c ap traffic", &server_finished_hash);
        let server_app = schedule.derive(b"s ap traffic", &server_finished_hash);
        conn.reader.set_protection(RecordProtection::tls13(suite, &server_app)?)?;

        if !self.session_id.is_empty() && !self.sent_ccs {
            conn.queue_ccs()?;
        }
        conn.writer.set_protection(RecordProtection::tls13(suite, &client_hs)?);
        if let Some(request) = &cert_request {
            let flight = certificate_flight13(
                self.config.client_cert.as_ref(),
                &request.context,
                request.schemes(),
                &mut conn.transcript,
                hash,
                false,
            )?;
            for message in &flight {
                conn.queue_untracked(message)?;
            }
        }
        let verify_data = finished_verify_data(hash, &client_hs, &conn.transcript.hash(hash));
        conn.queue(HandshakePayload::Finished(verify_data))?;
        conn.flush().await?;
        conn.writer.set_protection(RecordProtection::tls13(suite, &client_app)?);
        self.apply_record_limits(conn, &negotiated, ProtocolVersion::TLS13);

        let resumption_master = schedule.derive(b"res master", &conn.transcript.hash(hash));
        let resumed = psk.as_ref().map(|p| !p.external).unwrap_or(false);
        Ok(Established {
            role: Role::Client,
            version: ProtocolVersion::TLS13,
            suite,
            session: Session {
                version: ProtocolVersion::TLS13,
                suite: suite.id,
                session_id: Vec::new(),
                master_secret: Vec::new(),
                server_name: self.server_name.clone(),
                extended_master_secret: false,
                encrypt_then_mac: false,
                alpn: negotiated.alpn,
                peer_chain,
                ticket: None,
                resumable: false,
            },
            resumed,
            peer_key,
            heartbeat_send: negotiated.heartbeat_send,
            heartbeat_answer: negotiated.heartbeat_answer,
            tls13: Some(Tls13Secrets {
                hash,
                client_traffic: client_app,
                server_traffic: server_app,
                lineage: secret_fingerprint(&resumption_master),
                resumption_master,
            }),
            transcript: conn.transcript.fork(),
            post_handshake_auth: self.sent_extensions.contains(&EXT_POST_HANDSHAKE_AUTH),
        })
    }

    async fn run_legacy<IO>(
        &mut self,
        conn: &mut Conn<IO>,
        hello: ServerHello,
        version: ProtocolVersion,
        suite: &'static CipherSuite,
    ) -> TlsResult<Established>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let config = self.config.clone();
        let ems = hello.extensions.has_ext(EXT_EXTENDED_MASTER_SECRET);
        let etm = suite.is_cbc() && hello.extensions.has_ext(EXT_ENCRYPT_THEN_MAC);
        if let Some(Extension::RenegotiationInfo(data)) = hello.extensions.find_ext(EXT_RENEGOTIATION_INFO) {
            if !data.is_empty() {
                return Err(TlsError::alert(
                    AlertDescription::HandshakeFailure,
                    "non-empty renegotiation_info on an initial handshake",
                ));
            }
        }
        let ticket_expected = hello.extensions.has_ext(EXT_SESSION_TICKET);
        let negotiated = self.negotiated(&hello.extensions, version)?;
        let server_random = hello.random;

        let resumed = self
            .cached
            .clone()
            .filter(|_| !hello.session_id.is_empty() && hello.session_id == self.session_id);
        if let Some(session) = resumed {
            check_resumed(&session, version, suite, ems, etm)?;
            let keys = legacy_keys(version, suite, &session.master_secret, &self.random, &server_random, etm)?;
            let ticket = read_ticket(conn, ticket_expected).await?;
            conn.expect_ccs().await?;
            conn.reader.set_protection(keys.server)?;
            let expected = prf::finished_verify_data(version, suite.hash, &session.master_secret, &conn.transcript, false);
            expect_finished(conn, &expected).await?;

            conn.queue_ccs()?;
            conn.writer.set_protection(keys.client);
            let verify_data =
                prf::finished_verify_data(version, suite.hash, &session.master_secret, &conn.transcript, true);
            conn.queue(HandshakePayload::Finished(verify_data))?;
            conn.flush().await?;
            self.apply_record_limits(conn, &negotiated, version);

            let mut session = session;
            session.alpn = negotiated.alpn.clone();
            if let Some(nst) = ticket.filter(|t| !t.ticket.is_empty()) {
                session.ticket = Some(nst.ticket);
            }
            self.remember(&session);
            return Ok(self.legacy_established(version, suite, session, true, None, &negotiated, conn));
        }

        // Full handshake.
        let mut payload = conn.recv_handshake().await?.payload;
        let mut peer_key: Option<Arc<dyn PeerKey>> = None;
        let mut peer_chain = Vec::new();
        if suite.needs_certificate() {
            let chain = match payload {
                HandshakePayload::Certificate12(chain) => chain,
                other => return Err(out_of_order("Certificate", other.typ())),
            };
            if chain.is_empty() {
                return Err(TlsError::alert(AlertDescription::HandshakeFailure, "empty server certificate"));
            }
            let key = config.verifier.verify_server_chain(&chain, self.server_name.as_deref())?;
            let expected_kind = match suite.auth {
                AuthAlgorithm::Ecdsa => KeyKind::Ecdsa,
                _ => KeyKind::Rsa,
            };
            if key.key_type().kind() != expected_kind {
                return Err(TlsError::alert(
                    AlertDescription::UnsupportedCertificate,
                    format!("{:?} certificate for {}", key.key_type(), suite.name),
                ));
            }
            peer_key = Some(key);
            peer_chain = chain;
            payload = conn.recv_handshake().await?.payload;
        }

        let server_params = if suite.kx != KeyExchangeAlgorithm::Rsa {
            let body = match payload {
                HandshakePayload::ServerKeyExchange(body) => body,
                other => return Err(out_of_order("ServerKeyExchange", other.typ())),
            };
            payload = conn.recv_handshake().await?.payload;
            Some(body)
        } else {
            None
        };
        let randoms = Randoms {
            client: &self.random,
            server: &server_random,
        };
        let kx = ClientKx::from_server_message(
            suite,
            ClientKxInput {
                version,
                randoms,
                peer_key: peer_key.clone(),
                our_schemes: &config.signature_schemes,
                our_groups: &config.groups,
                min_dh_bits: config.min_dh_bits,
                srp_credentials: config
                    .srp
                    .as_ref()
                    .map(|(user, pass)| (user.as_bytes(), pass.as_bytes())),
            },
            server_params.as_deref(),
        )?;

        let cert_request = match payload {
            HandshakePayload::CertificateRequest12(request) => {
                if !suite.needs_certificate() {
                    return Err(TlsError::alert(
                        AlertDescription::HandshakeFailure,
                        "certificate requested on an anonymous suite",
                    ));
                }
                payload = conn.recv_handshake().await?.payload;
                Some(request)
            }
            other => {
                payload = other;
                None
            }
        };
        match payload {
            HandshakePayload::ServerHelloDone => {}
            other => return Err(out_of_order("ServerHelloDone", other.typ())),
        }

        let mut signer: Option<(&CertifiedKey, SignatureScheme)> = None;
        if let Some(request) = &cert_request {
            signer = config
                .client_cert
                .as_ref()
                .filter(|_| version >= ProtocolVersion::TLS12)
                .and_then(|cert| {
                    select_scheme(version, cert.key.as_ref(), &request.schemes).map(|scheme| (cert, scheme))
                });
            let chain = signer.map(|(cert, _)| cert.chain.clone()).unwrap_or_default();
            conn.queue(HandshakePayload::Certificate12(chain))?;
        }

        let (exchange, premaster) = kx.client_message(version, self.hello_version)?;
        conn.queue(HandshakePayload::ClientKeyExchange(exchange))?;
        let session_hash = ems.then(|| conn.transcript.prf_hash(version, suite.hash));
        let master = master_secret(
            version,
            suite.hash,
            &premaster,
            &self.random,
            &server_random,
            session_hash.as_deref(),
        );
        if let Some((cert, scheme)) = signer {
            let signature = cert.key.sign(scheme, conn.transcript.bytes())?;
            conn.queue(HandshakePayload::CertificateVerify(CertificateVerify {
                scheme: Some(scheme),
                signature,
            }))?;
        }

        let keys = legacy_keys(version, suite, &master, &self.random, &server_random, etm)?;
        conn.queue_ccs()?;
        conn.writer.set_protection(keys.client);
        let verify_data = prf::finished_verify_data(version, suite.hash, &master, &conn.transcript, true);
        conn.queue(HandshakePayload::Finished(verify_data))?;
        conn.flush().await?;

        let ticket = read_ticket(conn, ticket_expected).await?;
        conn.expect_ccs().await?;
        conn.reader.set_protection(keys.server)?;
        let expected = prf::finished_verify_data(version, suite.hash, &master, &conn.transcript, false);
        expect_finished(conn, &expected).await?;
        self.apply_record_limits(conn, &negotiated, version);

        let ticket = ticket.map(|t| t.ticket).filter(|t| !t.is_empty());
        let session = Session {
            version,
            suite: suite.id,
            resumable: !hello.session_id.is_empty() || ticket.is_some(),
            session_id: hello.session_id,
            master_secret: master,
            server_name: self.server_name.clone(),
            extended_master_secret: ems,
            encrypt_then_mac: etm,
            alpn: negotiated.alpn.clone(),
            peer_chain,
            ticket,
        };
        self.remember(&session);
        Ok(self.legacy_established(version, suite, session, false, peer_key, &negotiated, conn))
    }

    fn remember(&self, session: &Session) {
        if let (Some(store), Some(name)) = (self.config.sessions.as_ref(), self.server_name.as_deref()) {
            store.store_session(name, session.clone());
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn legacy_established<IO>(
        &self,
        version: ProtocolVersion,
        suite: &'static CipherSuite,
        session: Session,
        resumed: bool,
        peer_key: Option<Arc<dyn PeerKey>>,
        negotiated: &Negotiated,
        conn: &Conn<IO>,
    ) -> Established {
        Established {
            role: Role::Client,
            version,
            suite,
            session,
            resumed,
            peer_key,
            heartbeat_send: negotiated.heartbeat_send,
            heartbeat_answer: negotiated.heartbeat_answer,
            tls13: None,
            transcript: conn.transcript.fork(),
            post_handshake_auth: false,
        }
    }
}

/// A resumed ServerHello must keep every parameter the cached session was built with.
fn check_resumed(
    session: &Session,
    version: ProtocolVersion,
    suite: &CipherSuite,
    ems: bool,
    etm: bool,
) -> TlsResult<()> {
    if session.version != version || session.suite != suite.id {
        return Err(TlsError::illegal("resumed session parameters changed"));
    }
    if session.extended_master_secret != ems {
        return Err(TlsError::alert(
            AlertDescription::HandshakeFailure,
            "extended_master_secret changed on resumption",
        ));
    }
    if session.encrypt_then_mac != etm {
        return Err(TlsError::alert(
            AlertDescription::HandshakeFailure,
            "encrypt_then_mac changed on resumption",
        ));
    }
    Ok(())
}

fn expect_server_hello(payload: HandshakePayload) -> TlsResult<ServerHello> {
    match payload {
        HandshakePayload::ServerHello(hello) => Ok(hello),
        other => Err(out_of_order("ServerHello", other.typ())),
    }
}

/// Reads the NewSessionTicket a server promised with an empty session_ticket extension.
async fn read_ticket<IO>(conn: &mut Conn<IO>, expected: bool) -> TlsResult<Option<NewSessionTicket12>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    if !expected {
        return Ok(None);
    }
    match conn.recv_handshake().await?.payload {
        HandshakePayload::NewSessionTicket12(ticket) => Ok(Some(ticket)),
        other => Err(out_of_order("NewSessionTicket", other.typ())),
    }
}

async fn expect_finished<IO>(conn: &mut Conn<IO>, expected: &[u8]) -> TlsResult<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    match conn.recv_handshake().await?.payload {
        HandshakePayload::Finished(verify_data) => check_finished(expected, &verify_data),
        other => Err(out_of_order("Finished", other.typ())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literals_are_not_sent_as_sni() {
        assert_eq!(sni_host("front.example.com."), Some("front.example.com"));
        assert_eq!(sni_host("192.0.2.7"), None);
        assert_eq!(sni_host("2001:db8::1"), None);
    }

    #[test]
    fn resumption_rejects_changed_record_mac_order() {
        let suite = crate::tls::suites::lookup_suite(0x002f).unwrap();
        let session = Session {
            version: ProtocolVersion::TLS12,
            suite: suite.id,
            session_id: vec![7; 32],
            master_secret: vec![1; 48],
            server_name: Some("front.test".into()),
            extended_master_secret: true,
            encrypt_then_mac: true,
            alpn: None,
            peer_chain: Vec::new(),
            ticket: None,
            resumable: true,
        };
        check_resumed(&session, ProtocolVersion::TLS12, suite, true, true).unwrap();

        let err = check_resumed(&session, ProtocolVersion::TLS12, suite, true, false).unwrap_err();
        assert_eq!(err.local_alert(), Some(AlertDescription::HandshakeFailure));
        let err = check_resumed(&session, ProtocolVersion::TLS12, suite, false, true).unwrap_err();
        assert_eq!(err.local_alert(), Some(AlertDescription::HandshakeFailure));
        let err = check_resumed(&session, ProtocolVersion::TLS11, suite, true, true).unwrap_err();
        assert_eq!(err.local_alert(), Some(AlertDescription::IllegalParameter));
    }
}
