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

//! Server side of the handshake, SSL 3.0 through TLS 1.3.
//!
//! **Certificate and suite selection:** virtual-host pairs whose names match the SNI are
//! tried before the primary pair. A pair/suite combination must pass the mandatory checks
//! (key type, a signature scheme the client accepts, curve and group availability) and
//! should pass the secondary check (the chain's own signature algorithms are acceptable
//! to the client). When nothing passes both, the first combination that passes only the
//! mandatory checks is used.
//!
//! **Resumption:** TLS 1.3 PSKs (sealed tickets or external keys) with binder
//! verification; TLS ≤1.2 session ids and RFC 5077 tickets. A stored session that does
//! not match the new ClientHello silently falls back to a full handshake.

use std::sync::Arc;

use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    tls::{
        alert::AlertDescription,
        channel::SecureChannel,
        cipher::RecordProtection,
        config::{ClientAuth, ServerConfig},
        credentials::{select_scheme, tls13_signed_content, CertifiedKey, KeyKind, KeyType, PeerKey, SignatureScheme},
        extensions::{
            Extension, ExtensionList, HeartbeatMode, KeyShareEntry, PskKeyExchangeMode, EXT_EC_POINT_FORMATS,
            EXT_ENCRYPT_THEN_MAC, EXT_EXTENDED_MASTER_SECRET,
            EXT_PRE_SHARED_KEY, EXT_PSK_KEY_EXCHANGE_MODES, EXT_RENEGOTIATION_INFO,
            EXT_SESSION_TICKET, EXT_SIGNATURE_ALGORITHMS, EXT_SRP, EXT_SUPPORTED_GROUPS,
        },
        groups::{EphemeralKey, NamedGroup},
        handshake::{
            certificate_flight13, check_finished, fragment_limit, legacy_keys, out_of_order, psk_binder,
            select_alpn, Conn, Established, Role, Tls13Secrets,
        },
        kx::{Randoms, ServerKx, ServerKxInput},
        messages::{
            CertificateRequest12, CertificateRequest13, ClientHello, HandshakeMessage, HandshakePayload,
            NewSessionTicket12, NewSessionTicket13, ServerHello, DOWNGRADE_TLS11, DOWNGRADE_TLS12, HRR_RANDOM,
        },
        prf::{self, master_secret, HashAlgorithm, Transcript},
        schedule::{finished_verify_data, resumption_psk, KeySchedule},
        session::{secret_fingerprint, unix_millis, Session, TicketPayload},
        suites::{lookup_suite, AuthAlgorithm, CipherSuite, KeyExchangeAlgorithm, ProtocolVersion, TLS_EMPTY_RENEGOTIATION_INFO_SCSV, TLS_FALLBACK_SCSV},
    },
    utils::{TlsError, TlsResult},
};

/// Longest ticket lifetime TLS 1.3 allows (seven days).
const MAX_TICKET_LIFETIME: u64 = 7 * 24 * 60 * 60;

/// Runs a server handshake over `io`.
pub async fn accept<IO>(config: Arc<ServerConfig>, io: IO) -> TlsResult<SecureChannel<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = Conn::new(io);
    let cache = config.session_cache.clone();
    let mut handshake = ServerHandshake::new(config);
    match handshake.run(&mut conn).await {
        Ok(established) => {
            tracing::debug!(
                version = %established.version,
                suite = established.suite.name,
                resumed = established.resumed,
                server_name = ?established.session.server_name,
                "server handshake complete"
            );
            Ok(SecureChannel::new(conn, established, None, cache))
        }
        Err(err) => Err(conn.fail(err).await),
    }
}

fn handshake_failure(reason: impl Into<String>) -> TlsError {
    TlsError::alert(AlertDescription::HandshakeFailure, reason)
}

fn expect_client_hello(payload: HandshakePayload) -> TlsResult<ClientHello> {
    match payload {
        HandshakePayload::ClientHello(hello) => Ok(hello),
        other => Err(out_of_order("ClientHello", other.typ())),
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

/// Highest version both sides support.
///
/// `supported_versions` wins when present; otherwise the legacy ClientHello version is
/// capped at TLS 1.2.
pub fn negotiate_version(
    range: crate::tls::config::VersionRange,
    hello: &ClientHello,
) -> TlsResult<ProtocolVersion> {
    let no_overlap = |detail: String| TlsError::alert(AlertDescription::ProtocolVersion, detail);
    if let Some(offered) = hello.supported_versions() {
        return offered
            .iter()
            .copied()
            .filter(|v| v.is_known() && range.contains(*v))
            .max()
            .ok_or_else(|| no_overlap(format!("no common version in {offered:?}")));
    }
    let client = hello.legacy_version;
    let version = client.min(range.max).min(ProtocolVersion::TLS12);
    if client < range.min || !range.contains(version) {
        return Err(no_overlap(format!("client offered {client}")));
    }
    Ok(version)
}

fn psk_modes(hello: &ClientHello) -> &[PskKeyExchangeMode] {
    hello
        .extensions
        .iter()
        .find_map(|e| match e {
            Extension::PskKeyExchangeModes(modes) => Some(modes.as_slice()),
            _ => None,
        })
        .unwrap_or(&[])
}

fn key_shares(hello: &ClientHello) -> Option<&[KeyShareEntry]> {
    hello.extensions.iter().find_map(|e| match e {
        Extension::KeyShareOffer(entries) => Some(entries.as_slice()),
        _ => None,
    })
}

fn peer_heartbeat(hello: &ClientHello) -> Option<HeartbeatMode> {
    hello.extensions.iter().find_map(|e| match e {
        Extension::Heartbeat(mode) => Some(*mode),
        _ => None,
    })
}

fn peer_record_limit(hello: &ClientHello) -> Option<u16> {
    hello.extensions.iter().find_map(|e| match e {
        Extension::RecordSizeLimit(limit) => Some(*limit),
        _ => None,
    })
}

/// Chosen suite plus the index of the certificate pair that authenticates it.
#[derive(Debug, Clone, Copy)]
struct Selection {
    suite: &'static CipherSuite,
    cert: Option<usize>,
}

/// A PSK the client offered and we accepted.
struct ChosenPsk {
    index: u16,
    secret: Vec<u8>,
    suite: &'static CipherSuite,
    external: bool,
    /// Session family of a resumption ticket.
    lineage: Option<[u8; 32]>,
}

struct ServerHandshake {
    config: Arc<ServerConfig>,
    random: [u8; 32],
    retry: Option<(u16, NamedGroup)>,
    sent_ccs: bool,
}

impl ServerHandshake {
    fn new(config: Arc<ServerConfig>) -> Self {
        let mut random = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut random);
        Self {
            config,
            random,
            retry: None,
            sent_ccs: false,
        }
    }

    async fn run<IO>(&mut self, conn: &mut Conn<IO>) -> TlsResult<Established>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let message = conn.recv_handshake_raw().await?;
        let hello = expect_client_hello(message.payload.clone())?;
        let range = self.config.versions;
        let version = negotiate_version(range, &hello)?;
        if hello.cipher_suites.contains(&TLS_FALLBACK_SCSV) && version < range.max {
            return Err(TlsError::alert(
                AlertDescription::InappropriateFallback,
                format!("fallback to {version} while {} is supported", range.max),
            ));
        }
        tracing::debug!(%version, server_name = ?hello.server_name(), "client hello received");
        conn.reader.set_version(version);
        conn.writer.set_version(version);

        if version.is_tls13() {
            return self.run_tls13(conn, message, hello).await;
        }
        if range.max.is_tls13() && version == ProtocolVersion::TLS12 {
            self.random[24..].copy_from_slice(&DOWNGRADE_TLS12);
        } else if range.max >= ProtocolVersion::TLS12 && version < ProtocolVersion::TLS12 {
            self.random[24..].copy_from_slice(&DOWNGRADE_TLS11);
        }
        conn.transcript.add(&message.raw);
        self.run_legacy(conn, hello, version).await
    }

    /// Mandatory checks for serving `suite` with `cert`.
    fn cert_fits(&self, version: ProtocolVersion, suite: &CipherSuite, cert: &CertifiedKey, hello: &ClientHello) -> bool {
        let key = cert.key.as_ref();
        let kind = key.key_type().kind();
        let schemes = hello.signature_schemes();
        if suite.is_tls13() {
            return select_scheme(ProtocolVersion::TLS13, key, schemes).is_some();
        }
        let auth_ok = match suite.auth {
            AuthAlgorithm::Rsa | AuthAlgorithm::SrpRsa if suite.kx == KeyExchangeAlgorithm::Rsa => kind == KeyKind::Rsa,
            AuthAlgorithm::Rsa | AuthAlgorithm::SrpRsa => {
                kind == KeyKind::Rsa && select_scheme(version, key, schemes).is_some()
            }
            AuthAlgorithm::Ecdsa => {
                let curve_ok = match key.key_type() {
                    KeyType::Ecdsa(curve) => hello.groups().is_empty() || hello.groups().contains(&curve),
                    _ => false,
                };
                curve_ok && select_scheme(version, key, schemes).is_some()
            }
            _ => false,
        };
        auth_ok && self.kx_fits(suite, hello)
    }

    /// Key-exchange prerequisites independent of the certificate.
    fn kx_fits(&self, suite: &CipherSuite, hello: &ClientHello) -> bool {
        match suite.kx {
            KeyExchangeAlgorithm::Ecdhe | KeyExchangeAlgorithm::EcdhAnon => self.legacy_group(hello).is_some(),
            KeyExchangeAlgorithm::Srp => hello.extensions.has_ext(EXT_SRP),
            _ => true,
        }
    }

    /// Secondary check: the client accepts how the chain itself was signed.
    fn chain_fits(cert: &CertifiedKey, hello: &ClientHello) -> bool {
        let accepted = hello.cert_signature_schemes();
        cert.chain_schemes.is_empty()
            || accepted.is_empty()
            || cert.chain_schemes.iter().all(|s| accepted.contains(s))
    }

    fn select(&self, version: ProtocolVersion, hello: &ClientHello, only: Option<u16>) -> TlsResult<Selection> {
        let suites: Vec<&'static CipherSuite> = self
            .config
            .cipher_suites
            .iter()
            .copied()
            .filter(|s| s.usable_in(version) && hello.cipher_suites.contains(&s.id))
            .filter(|s| only.map(|id| id == s.id).unwrap_or(true))
            .collect();
        if suites.is_empty() {
            return Err(handshake_failure("no cipher suite in common"));
        }

        let certs = &self.config.certificates;
        let mut candidates = Vec::new();
        if let Some(name) = hello.server_name() {
            candidates.extend(
                certs
                    .iter()
                    .enumerate()
                    .skip(1)
                    .filter(|(_, c)| c.matches_host(name))
                    .map(|(i, _)| i),
            );
        }
        if !certs.is_empty() {
            candidates.push(0);
        }

        for strict in [true, false] {
            for &index in &candidates {
                let cert = &certs[index];
                if strict && !Self::chain_fits(cert, hello) {
                    continue;
                }
                if let Some(suite) = suites
                    .iter()
                    .copied()
                    .filter(|s| s.is_tls13() || s.needs_certificate())
                    .find(|s| self.cert_fits(version, s, cert, hello))
                {
                    if !strict {
                        tracing::debug!(cert = index, "certificate chain algorithms not advertised by client");
                    }
                    return Ok(Selection {
                        suite,
                        cert: Some(index),
                    });
                }
            }
        }

        suites
            .iter()
            .copied()
            .find(|s| !s.is_tls13() && !s.needs_certificate() && self.kx_fits(s, hello))
            .map(|suite| Selection { suite, cert: None })
            .ok_or_else(|| handshake_failure("no certificate and suite combination fits the client"))
    }

    /// ECDHE curve for TLS ≤1.2: our first group the client lists.
    fn legacy_group(&self, hello: &ClientHello) -> Option<NamedGroup> {
        let client = hello.groups();
        if client.is_empty() {
            return self
                .config
                .groups
                .iter()
                .copied()
                .find(|g| *g == NamedGroup::Secp256r1);
        }
        self.config
            .groups
            .iter()
            .copied()
            .find(|g| g.is_supported() && client.contains(g))
    }

    /// TLS 1.3 suites the client offered, in our preference order.
    fn tls13_suites(&self, hello: &ClientHello) -> Vec<&'static CipherSuite> {
        self.config
            .cipher_suites
            .iter()
            .copied()
            .filter(|s| s.is_tls13() && hello.cipher_suites.contains(&s.id))
            .filter(|s| self.retry.map(|(id, _)| id == s.id).unwrap_or(true))
            .collect()
    }

    /// Finds the first acceptable PSK identity and verifies its binder.
    fn choose_psk(&self, hello: &ClientHello, raw: &[u8], prefix: &Transcript) -> TlsResult<Option<ChosenPsk>> {
        let Some(Extension::PreSharedKeyOffer(offer)) = hello.extensions.find_ext(EXT_PRE_SHARED_KEY) else {
            return Ok(None);
        };
        let modes = psk_modes(hello);
        if modes.is_empty() {
            return Err(TlsError::alert(
                AlertDescription::MissingExtension,
                "pre_shared_key without psk_key_exchange_modes",
            ));
        }
        if !modes.iter().any(|m| matches!(m, PskKeyExchangeMode::PskKe | PskKeyExchangeMode::PskDheKe)) {
            return Ok(None);
        }
        let suites = self.tls13_suites(hello);
        for (index, identity) in offer.identities.iter().enumerate() {
            let candidate: Option<(Vec<u8>, HashAlgorithm, Option<[u8; 32]>)> = if let Some(external) = self
                .config
                .external_psks
                .iter()
                .find(|p| p.identity == identity.identity)
            {
                Some((external.secret.clone(), external.hash, None))
            } else {
                match self.config.ticket_sealer.as_ref().and_then(|s| s.open(&identity.identity)) {
                    Some(TicketPayload::Tls13 {
                        suite,
                        psk,
                        lineage,
                        server_name,
                        ..
                    }) if server_name.as_deref() == hello.server_name() && !self.is_revoked(&lineage) => {
                        lookup_suite(suite).map(|s| (psk, s.hash, Some(lineage)))
                    }
                    _ => None,
                }
            };
            let Some((secret, hash, lineage)) = candidate else {
                continue;
            };
            let Some(suite) = suites.iter().copied().find(|s| s.hash == hash) else {
                continue;
            };
            let external = lineage.is_none();

            let truncated = &raw[..raw.len() - offer.binders_len()];
            let mut partial = prefix.fork();
            partial.add(truncated);
            let expected = psk_binder(hash, &secret, external, &partial.hash(hash));
            let received = &offer.binders[index];
            if expected.len() != received.len() || !bool::from(expected.ct_eq(received)) {
                return Err(TlsError::alert(AlertDescription::DecryptError, "PSK binder mismatch"));
            }
            tracing::debug!(index, external, "accepted PSK");
            return Ok(Some(ChosenPsk {
                index: index as u16,
                secret,
                suite,
                external,
                lineage,
            }));
        }
        Ok(None)
    }

    fn is_revoked(&self, fingerprint: &[u8; 32]) -> bool {
        self.config
            .session_cache
            .as_ref()
            .map(|cache| cache.is_revoked(fingerprint))
            .unwrap_or(false)
    }

    async fn run_tls13<IO>(
        &mut self,
        conn: &mut Conn<IO>,
        mut message: HandshakeMessage,
        mut hello: ClientHello,
    ) -> TlsResult<Established>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let config = self.config.clone();
        let (psk, selection, share) = loop {
            if hello.compression_methods != [0] {
                return Err(TlsError::illegal("TLS 1.3 ClientHello with compression"));
            }
            let psk = self.choose_psk(&hello, &message.raw, &conn.transcript)?;
            let selection = match &psk {
                Some(chosen) => Selection {
                    suite: chosen.suite,
                    cert: None,
                },
                None => {
                    if !hello.extensions.has_ext(EXT_SIGNATURE_ALGORITHMS) {
                        return Err(TlsError::alert(
                            AlertDescription::MissingExtension,
                            "signature_algorithms required",
                        ));
                    }
                    self.select(ProtocolVersion::TLS13, &hello, self.retry.map(|(id, _)| id))?
                }
            };

            let modes = psk_modes(&hello);
            let want_dhe = psk.is_none() || modes.contains(&PskKeyExchangeMode::PskDheKe);
            let offered = key_shares(&hello).unwrap_or(&[]);
            if let Some((_, group)) = self.retry {
                if offered.len() != 1 || offered[0].group != group {
                    return Err(TlsError::illegal("second ClientHello lacks the requested key share"));
                }
            }
            let share = if want_dhe {
                config
                    .groups
                    .iter()
                    .find_map(|g| offered.iter().find(|e| e.group == *g))
                    .cloned()
            } else {
                None
            };
            if share.is_some() || (psk.is_some() && modes.contains(&PskKeyExchangeMode::PskKe)) {
                break (psk, selection, share);
            }

            if !hello.extensions.has_ext(EXT_SUPPORTED_GROUPS) {
                return Err(TlsError::alert(AlertDescription::MissingExtension, "supported_groups required"));
            }
            let group = config
                .groups
                .iter()
                .copied()
                .find(|g| g.is_supported() && hello.groups().contains(g))
                .ok_or_else(|| handshake_failure("no common group"))?;
            if self.retry.is_some() {
                return Err(TlsError::illegal("second ClientHello still unusable"));
            }

            conn.transcript.add(&message.raw);
            conn.transcript.replace_with_message_hash(selection.suite.hash);
            let retry = ServerHello {
                legacy_version: ProtocolVersion::TLS12,
                random: HRR_RANDOM,
                session_id: hello.session_id.clone(),
                cipher_suite: selection.suite.id,
                compression_method: 0,
                extensions: vec![
                    Extension::SupportedVersionSelected(ProtocolVersion::TLS13),
                    Extension::KeyShareRetry(group),
                ],
            };
            conn.queue(HandshakePayload::ServerHello(retry))?;
            if !hello.session_id.is_empty() {
                conn.queue_ccs()?;
                self.sent_ccs = true;
            }
            conn.flush().await?;
            self.retry = Some((selection.suite.id, group));
            tracing::debug!(?group, suite = selection.suite.name, "sent HelloRetryRequest");

            message = conn.recv_handshake_raw().await?;
            hello = expect_client_hello(message.payload.clone())?;
            if negotiate_version(config.versions, &hello)? != ProtocolVersion::TLS13 {
                return Err(TlsError::illegal("version changed after HelloRetryRequest"));
            }
        };

        let suite = selection.suite;
        let hash = suite.hash;
        conn.transcript.add(&message.raw);

        let (shared, server_share) = match &share {
            Some(entry) => {
                let key = EphemeralKey::generate(entry.group)?;
                let public = key.public_key().to_vec();
                (
                    Some(key.agree(&entry.key_exchange)?),
                    Some(KeyShareEntry {
                        group: entry.group,
                        key_exchange: public,
                    }),
                )
            }
            None => (None, None),
        };
        let mut extensions = vec![Extension::SupportedVersionSelected(ProtocolVersion::TLS13)];
        if let Some(entry) = server_share {
            extensions.push(Extension::KeyShareSelected(entry));
        }
        if let Some(chosen) = &psk {
            extensions.push(Extension::PreSharedKeySelected(chosen.index));
        }
        conn.queue(HandshakePayload::ServerHello(ServerHello {
            legacy_version: ProtocolVersion::TLS12,
            random: self.random,
            session_id: hello.session_id.clone(),
            cipher_suite: suite.id,
            compression_method: 0,
            extensions,
        }))?;
        if !hello.session_id.is_empty() && !self.sent_ccs {
            conn.queue_ccs()?;
        }

        let mut schedule = KeySchedule::new(hash, psk.as_ref().map(|p| p.secret.as_slice()));
        schedule.enter_handshake(shared.as_deref());
        let hello_hash = conn.transcript.hash(hash);
        let client_hs = schedule.derive(b"c hs traffic", &hello_hash);
        let server_hs = schedule.derive(b"s hs traffic", &hello_hash);
        conn.writer.set_protection(RecordProtection::tls13(suite, &server_hs)?);

        let alpn = select_alpn(&config.alpn_protocols, hello.alpn())?;
        let heartbeat = peer_heartbeat(&hello).filter(|_| config.heartbeat);
        let record_limit = config.record_size_limit.zip(peer_record_limit(&hello));
        let mut encrypted = Vec::new();
        if let Some(protocol) = &alpn {
            encrypted.push(Extension::Alpn(vec![protocol.clone()]));
        }
        if hello.server_name().is_some() && psk.is_none() {
            encrypted.push(Extension::ServerName(None));
        }
        if let Some((ours, _)) = record_limit {
            encrypted.push(Extension::RecordSizeLimit(ours));
        }
        if heartbeat.is_some() {
            encrypted.push(Extension::Heartbeat(HeartbeatMode::PeerAllowedToSend));
        }
        conn.queue(HandshakePayload::EncryptedExtensions(encrypted))?;

        let request_cert = psk.is_none() && config.client_auth != ClientAuth::None;
        if request_cert {
            conn.queue(HandshakePayload::CertificateRequest13(CertificateRequest13 {
                context: Vec::new(),
                extensions: vec![Extension::SignatureAlgorithms(config.signature_schemes.clone())],
            }))?;
        }
        if let Some(index) = selection.cert {
            let flight = certificate_flight13(
                config.certificates.get(index),
                &[],
                hello.signature_schemes(),
                &mut conn.transcript,
                hash,
                true,
            )?;
            if flight.len() < 2 {
                return Err(TlsError::internal("selected certificate cannot sign"));
            }
            for message in &flight {
                conn.queue_untracked(message)?;
            }
        }
        let verify_data = finished_verify_data(hash, &server_hs, &conn.transcript.hash(hash));
        conn.queue(HandshakePayload::Finished(verify_data))?;
        conn.flush().await?;

        schedule.enter_master();
        let server_finished_hash = conn.transcript.hash(hash);
        let client_app = schedule.derive(b"c ap traffic", &server_finished_hash);
        let server_app = schedule.derive(b"s ap traffic", &server_finished_hash);
        conn.writer.set_protection(RecordProtection::tls13(suite, &server_app)?);
        conn.reader.set_protection(RecordProtection::tls13(suite, &client_hs)?)?;

        let mut peer_key = None;
        let mut peer_chain = Vec::new();
        if request_cert {
            let certificate = match conn.recv_handshake().await?.payload {
                HandshakePayload::Certificate13(cert) => cert,
                other => return Err(out_of_order("Certificate", other.typ())),
            };
            if !certificate.context.is_empty() {
                return Err(TlsError::illegal("client Certificate with a context"));
            }
            let chain = certificate.chain();
            if chain.is_empty() {
                if config.client_auth == ClientAuth::Required {
                    return Err(TlsError::alert(
                        AlertDescription::CertificateRequired,
                        "client sent no certificate",
                    ));
                }
            } else {
                let key = self.verify_client_chain(&chain)?;
                let signed_hash = conn.transcript.hash(hash);
                let verify = match conn.recv_handshake().await?.payload {
                    HandshakePayload::CertificateVerify(cv) => cv,
                    other => return Err(out_of_order("CertificateVerify", other.typ())),
                };
                let scheme = verify
                    .scheme
                    .ok_or_else(|| TlsError::decode("CertificateVerify without a scheme"))?;
                if !scheme.allowed_in_tls13() || !config.signature_schemes.contains(&scheme) {
                    return Err(TlsError::illegal(format!("client signed with {scheme:?}")));
                }
                key.verify(scheme, &tls13_signed_content(false, &signed_hash), &verify.signature)?;
                peer_key = Some(key);
                peer_chain = chain;
            }
        }

        let expected = finished_verify_data(hash, &client_hs, &conn.transcript.hash(hash));
        expect_finished(conn, &expected).await?;
        conn.reader.set_protection(RecordProtection::tls13(suite, &client_app)?)?;
        if let Some((ours, theirs)) = record_limit {
            conn.writer.set_max_fragment(fragment_limit(theirs, ProtocolVersion::TLS13));
            conn.reader.set_max_plaintext(fragment_limit(ours, ProtocolVersion::TLS13));
        }

        let resumption_master = schedule.derive(b"res master", &conn.transcript.hash(hash));
        let lineage = psk
            .as_ref()
            .and_then(|p| p.lineage)
            .unwrap_or_else(|| secret_fingerprint(&resumption_master));
        let server_name = hello.server_name().map(str::to_owned);
        if hello.extensions.has_ext(EXT_PSK_KEY_EXCHANGE_MODES) {
            self.send_tickets13(conn, suite, &resumption_master, lineage, &server_name, &alpn)
                .await?;
        }

        Ok(Established {
            role: Role::Server,
            version: ProtocolVersion::TLS13,
            suite,
            session: Session {
                version: ProtocolVersion::TLS13,
                suite: suite.id,
                session_id: Vec::new(),
                master_secret: Vec::new(),
                server_name,
                extended_master_secret: false,
                encrypt_then_mac: false,
                alpn,
                peer_chain,
                ticket: None,
                resumable: false,
            },
            resumed: psk.as_ref().map(|p| !p.external).unwrap_or(false),
            peer_key,
            heartbeat_send: heartbeat == Some(HeartbeatMode::PeerAllowedToSend),
            heartbeat_answer: heartbeat.is_some(),
            tls13: Some(Tls13Secrets {
                hash,
                client_traffic: client_app,
                server_traffic: server_app,
                resumption_master,
                lineage,
            }),
            transcript: conn.transcript.fork(),
            post_handshake_auth: false,
        })
    }

    fn verify_client_chain(&self, chain: &[Vec<u8>]) -> TlsResult<Arc<dyn PeerKey>> {
        let verifier = self
            .config
            .client_verifier
            .as_ref()
            .ok_or_else(|| TlsError::internal("client authentication without a verifier"))?;
        verifier.verify_client_chain(chain)
    }

    async fn send_tickets13<IO>(
        &self,
        conn: &mut Conn<IO>,
        suite: &CipherSuite,
        resumption_master: &[u8],
        lineage: [u8; 32],
        server_name: &Option<String>,
        alpn: &Option<Vec<u8>>,
    ) -> TlsResult<()>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(sealer) = self.config.ticket_sealer.as_ref() else {
            return Ok(());
        };
        let lifetime = sealer.lifetime().as_secs().min(MAX_TICKET_LIFETIME) as u32;
        for i in 0..self.config.tickets_to_send {
            let nonce = vec![i as u8];
            let age_add = rand::rngs::OsRng.next_u32();
            let ticket = sealer.seal(&TicketPayload::Tls13 {
                suite: suite.id,
                psk: resumption_psk(suite.hash, resumption_master, &nonce),
                lineage,
                age_add,
                server_name: server_name.clone(),
                alpn: alpn.clone(),
                issued_at_ms: unix_millis(),
            })?;
            let message = HandshakeMessage::new(HandshakePayload::NewSessionTicket13(NewSessionTicket13 {
                lifetime,
                age_add,
                nonce,
                ticket,
                extensions: Vec::new(),
            }));
            conn.queue_untracked(&message)?;
        }
        conn.flush().await
    }

    /// Stored TLS ≤1.2 session the ClientHello may resume, with whether it came from a ticket.
    fn find_session(&self, hello: &ClientHello, version: ProtocolVersion, ems: bool, etm_offered: bool) -> Option<(Session, bool)> {
        let usable = |session: &Session| {
            let Some(suite) = lookup_suite(session.suite) else {
                return false;
            };
            session.version == version
                && suite.usable_in(version)
                && hello.cipher_suites.contains(&session.suite)
                && self.config.cipher_suites.iter().any(|s| s.id == session.suite)
                && session.matches(session.suite, hello.server_name(), ems)
                && session.encrypt_then_mac == (suite.is_cbc() && etm_offered)
                && !self.is_revoked(&secret_fingerprint(&session.master_secret))
        };

        if let (Some(Extension::SessionTicket(ticket)), Some(sealer)) = (
            hello.extensions.find_ext(EXT_SESSION_TICKET),
            self.config.ticket_sealer.as_ref(),
        ) {
            if !ticket.is_empty() && !hello.session_id.is_empty() {
                if let Some(TicketPayload::Tls12 {
                    version,
                    suite,
                    master_secret,
                    extended_master_secret,
                    encrypt_then_mac,
                    server_name,
                    ..
                }) = sealer.open(ticket)
                {
                    let session = Session {
                        version,
                        suite,
                        session_id: hello.session_id.clone(),
                        master_secret,
                        server_name,
                        extended_master_secret,
                        encrypt_then_mac,
                        alpn: None,
                        peer_chain: Vec::new(),
                        ticket: None,
                        resumable: true,
                    };
                    if usable(&session) {
                        return Some((session, true));
                    }
                    tracing::debug!("session ticket does not match the ClientHello");
                }
            }
        }
        let cache = self.config.session_cache.as_ref()?;
        let session = cache.get(&hello.session_id)?;
        if usable(&session) {
            Some((session, false))
        } else {
            tracing::debug!("cached session does not match the ClientHello");
            None
        }
    }

    fn seal_ticket12(&self, session: &Session) -> TlsResult<Option<NewSessionTicket12>> {
        let Some(sealer) = self.config.ticket_sealer.as_ref() else {
            return Ok(None);
        };
        let ticket = sealer.seal(&TicketPayload::Tls12 {
            version: session.version,
            suite: session.suite,
            master_secret: session.master_secret.clone(),
            extended_master_secret: session.extended_master_secret,
            encrypt_then_mac: session.encrypt_then_mac,
            server_name: session.server_name.clone(),
            issued_at_ms: unix_millis(),
        })?;
        Ok(Some(NewSessionTicket12 {
            lifetime: sealer.lifetime().as_secs().min(u64::from(u32::MAX)) as u32,
            ticket,
        }))
    }

    async fn run_legacy<IO>(
        &mut self,
        conn: &mut Conn<IO>,
        hello: ClientHello,
        version: ProtocolVersion,
    ) -> TlsResult<Established>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let config = self.config.clone();
        if !hello.compression_methods.contains(&0) {
            return Err(handshake_failure("client does not offer null compression"));
        }
        let reneg_ext = hello.extensions.find_ext(EXT_RENEGOTIATION_INFO);
        if let Some(Extension::RenegotiationInfo(data)) = reneg_ext {
            if !data.is_empty() {
                return Err(handshake_failure("non-empty renegotiation_info on an initial handshake"));
            }
        }
        let secure_renegotiation =
            reneg_ext.is_some() || hello.cipher_suites.contains(&TLS_EMPTY_RENEGOTIATION_INFO_SCSV);
        let ems = config.extended_master_secret && hello.extensions.has_ext(EXT_EXTENDED_MASTER_SECRET);
        let etm_offered = config.encrypt_then_mac && hello.extensions.has_ext(EXT_ENCRYPT_THEN_MAC);
        let alpn = select_alpn(&config.alpn_protocols, hello.alpn())?;
        let issue_ticket = config.ticket_sealer.is_some() && hello.extensions.has_ext(EXT_SESSION_TICKET);
        let heartbeat = peer_heartbeat(&hello).filter(|_| config.heartbeat);
        let record_limit = config.record_size_limit.zip(peer_record_limit(&hello));
        let server_name = hello.server_name().map(str::to_owned);

        let base_extensions = |etm: bool, resumed: bool, suite: &CipherSuite| {
            let mut exts = Vec::new();
            if secure_renegotiation {
                exts.push(Extension::RenegotiationInfo(Vec::new()));
            }
            if ems {
                exts.push(Extension::ExtendedMasterSecret);
            }
            if etm {
                exts.push(Extension::EncryptThenMac);
            }
            if let Some(protocol) = &alpn {
                exts.push(Extension::Alpn(vec![protocol.clone()]));
            }
            if issue_ticket {
                exts.push(Extension::SessionTicket(Vec::new()));
            }
            if let Some((ours, _)) = record_limit {
                exts.push(Extension::RecordSizeLimit(ours));
            }
            if heartbeat.is_some() {
                exts.push(Extension::Heartbeat(HeartbeatMode::PeerAllowedToSend));
            }
            if server_name.is_some() && !resumed {
                exts.push(Extension::ServerName(None));
            }
            if matches!(suite.kx, KeyExchangeAlgorithm::Ecdhe | KeyExchangeAlgorithm::EcdhAnon)
                && hello.extensions.has_ext(EXT_EC_POINT_FORMATS)
            {
                exts.push(Extension::EcPointFormats(vec![0]));
            }
            exts
        };

        if let Some((session, via_ticket)) = self.find_session(&hello, version, ems, etm_offered) {
            let suite = lookup_suite(session.suite).ok_or_else(|| TlsError::internal("cached suite vanished"))?;
            let etm = session.encrypt_then_mac;
            tracing::debug!(via_ticket, suite = suite.name, "resuming session");
            conn.queue(HandshakePayload::ServerHello(ServerHello {
                legacy_version: version,
                random: self.random,
                session_id: hello.session_id.clone(),
                cipher_suite: suite.id,
                compression_method: 0,
                extensions: base_extensions(etm, true, suite),
            }))?;
            let keys = legacy_keys(version, suite, &session.master_secret, &hello.random, &self.random, etm)?;
            let mut session = session;
            session.alpn = alpn.clone();
            if issue_ticket {
                if let Some(ticket) = self.seal_ticket12(&session)? {
                    conn.queue(HandshakePayload::NewSessionTicket12(ticket))?;
                }
            }
            conn.queue_ccs()?;
            conn.writer.set_protection(keys.server);
            let verify_data = prf::finished_verify_data(version, suite.hash, &session.master_secret, &conn.transcript, false);
            conn.queue(HandshakePayload::Finished(verify_data))?;
            conn.flush().await?;

            conn.expect_ccs().await?;
            conn.reader.set_protection(keys.client)?;
            let expected = prf::finished_verify_data(version, suite.hash, &session.master_secret, &conn.transcript, true);
            expect_finished(conn, &expected).await?;
            if let Some((ours, theirs)) = record_limit {
                conn.writer.set_max_fragment(fragment_limit(theirs, version));
                conn.reader.set_max_plaintext(fragment_limit(ours, version));
            }
            return Ok(Established {
                role: Role::Server,
                version,
                suite,
                session,
                resumed: true,
                peer_key: None,
                heartbeat_send: heartbeat == Some(HeartbeatMode::PeerAllowedToSend),
                heartbeat_answer: heartbeat.is_some(),
                tls13: None,
                transcript: conn.transcript.fork(),
                post_handshake_auth: false,
            });
        }

        let selection = self.select(version, &hello, None)?;
        let suite = selection.suite;
        let cert = selection.cert.and_then(|i| config.certificates.get(i));
        let etm = suite.is_cbc() && etm_offered;
        let session_id = if config.session_cache.is_some() {
            let mut id = vec![0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut id);
            id
        } else {
            Vec::new()
        };
        tracing::debug!(suite = suite.name, cert = ?selection.cert, "full handshake");

        conn.queue(HandshakePayload::ServerHello(ServerHello {
            legacy_version: version,
            random: self.random,
            session_id: session_id.clone(),
            cipher_suite: suite.id,
            compression_method: 0,
            extensions: base_extensions(etm, false, suite),
        }))?;
        if suite.needs_certificate() {
            let cert = cert.ok_or_else(|| TlsError::internal("authenticated suite without a certificate"))?;
            conn.queue(HandshakePayload::Certificate12(cert.chain.clone()))?;
        }

        let srp_record = hello.extensions.iter().find_map(|e| match e {
            Extension::Srp(identity) => config
                .srp_users
                .get(&*String::from_utf8_lossy(identity))
                .cloned(),
            _ => None,
        });
        let client_random = hello.random;
        let (kx, server_params) = ServerKx::start(
            suite,
            ServerKxInput {
                version,
                randoms: Randoms {
                    client: &client_random,
                    server: &self.random,
                },
                signing_key: cert.map(|c| &c.key),
                peer_schemes: hello.signature_schemes(),
                group: self.legacy_group(&hello),
                dh_params: &config.dh_params,
                srp_record,
            },
        )?;
        if let Some(body) = server_params {
            conn.queue(HandshakePayload::ServerKeyExchange(body))?;
        }
        let request_cert = config.client_auth != ClientAuth::None && suite.needs_certificate();
        if request_cert {
            conn.queue(HandshakePayload::CertificateRequest12(CertificateRequest12 {
                certificate_types: vec![1, 64],
                schemes: if version >= ProtocolVersion::TLS12 {
                    config.signature_schemes.clone()
                } else {
                    Vec::new()
                },
                authorities: Vec::new(),
            }))?;
        }
        conn.queue(HandshakePayload::ServerHelloDone)?;
        conn.flush().await?;

        let mut payload = conn.recv_handshake().await?.payload;
        let mut peer_key: Option<Arc<dyn PeerKey>> = None;
        let mut peer_chain = Vec::new();
        if request_cert {
            let chain = match payload {
                HandshakePayload::Certificate12(chain) => chain,
                other => return Err(out_of_order("Certificate", other.typ())),
            };
            if chain.is_empty() {
                if config.client_auth == ClientAuth::Required {
                    return Err(handshake_failure("client sent no certificate"));
                }
            } else {
                peer_key = Some(self.verify_client_chain(&chain)?);
                peer_chain = chain;
            }
            payload = conn.recv_handshake().await?.payload;
        }
        let exchange = match payload {
            HandshakePayload::ClientKeyExchange(body) => body,
            other => return Err(out_of_order("ClientKeyExchange", other.typ())),
        };
        let premaster = kx.process_client_message(version, hello.legacy_version, &exchange)?;
        let session_hash = ems.then(|| conn.transcript.prf_hash(version, suite.hash));
        let master = master_secret(
            version,
            suite.hash,
            &premaster,
            &client_random,
            &self.random,
            session_hash.as_deref(),
        );

        if let Some(key) = &peer_key {
            let signed = conn.transcript.bytes().to_vec();
            let verify = match conn.recv_handshake().await?.payload {
                HandshakePayload::CertificateVerify(cv) => cv,
                other => return Err(out_of_order("CertificateVerify", other.typ())),
            };
            let scheme = match verify.scheme {
                Some(scheme) if config.signature_schemes.contains(&scheme) => scheme,
                Some(scheme) => return Err(TlsError::illegal(format!("client signed with {scheme:?}"))),
                None => match key.key_type().kind() {
                    KeyKind::Rsa => SignatureScheme::RsaPkcs1Md5Sha1,
                    KeyKind::Ecdsa => SignatureScheme::EcdsaSha1,
                    other => return Err(TlsError::illegal(format!("{other:?} client key before TLS 1.2"))),
                },
            };
            key.verify(scheme, &signed, &verify.signature)?;
        }

        conn.expect_ccs().await?;
        let keys = legacy_keys(version, suite, &master, &client_random, &self.random, etm)?;
        conn.reader.set_protection(keys.client)?;
        let expected = prf::finished_verify_data(version, suite.hash, &master, &conn.transcript, true);
        expect_finished(conn, &expected).await?;

        let session = Session {
            version,
            suite: suite.id,
            session_id,
            master_secret: master,
            server_name: server_name.clone(),
            extended_master_secret: ems,
            encrypt_then_mac: etm,
            alpn: alpn.clone(),
            peer_chain,
            ticket: None,
            resumable: true,
        };
        if issue_ticket {
            if let Some(ticket) = self.seal_ticket12(&session)? {
                conn.queue(HandshakePayload::NewSessionTicket12(ticket))?;
            }
        }
        conn.queue_ccs()?;
        conn.writer.set_protection(keys.server);
        let verify_data = prf::finished_verify_data(version, suite.hash, &session.master_secret, &conn.transcript, false);
        conn.queue(HandshakePayload::Finished(verify_data))?;
        conn.flush().await?;
        if let Some((ours, theirs)) = record_limit {
            conn.writer.set_max_fragment(fragment_limit(theirs, version));
            conn.reader.set_max_plaintext(fragment_limit(ours, version));
        }
        if let Some(cache) = &config.session_cache {
            cache.insert(session.clone());
        }

        Ok(Established {
            role: Role::Server,
            version,
            suite,
            session,
            resumed: false,
            peer_key,
            heartbeat_send: heartbeat == Some(HeartbeatMode::PeerAllowedToSend),
            heartbeat_answer: heartbeat.is_some(),
            tls13: None,
            transcript: conn.transcript.fork(),
            post_handshake_auth: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::config::VersionRange;

    fn hello(legacy: ProtocolVersion, supported: Option<Vec<ProtocolVersion>>) -> ClientHello {
        let mut extensions = Vec::new();
        if let Some(versions) = supported {
            extensions.push(Extension::SupportedVersionsOffer(versions));
        }
        ClientHello {
            legacy_version: legacy,
            random: [7; 32],
            session_id: Vec::new(),
            cipher_suites: vec![0x1301],
            compression_methods: vec![0],
            extensions,
        }
    }

    #[test]
    fn supported_versions_pick_the_highest_common() {
        let range = VersionRange::default();
        let h = hello(
            ProtocolVersion::TLS12,
            Some(vec![ProtocolVersion(0x7a7a), ProtocolVersion::TLS13, ProtocolVersion::TLS12]),
        );
        assert_eq!(negotiate_version(range, &h).unwrap(), ProtocolVersion::TLS13);
    }

    #[test]
    fn legacy_clients_are_capped_at_tls12() {
        let range = VersionRange {
            min: ProtocolVersion::TLS10,
            max: ProtocolVersion::TLS13,
        };
        let h = hello(ProtocolVersion(0x0305), None);
        assert_eq!(negotiate_version(range, &h).unwrap(), ProtocolVersion::TLS12);
        let h = hello(ProtocolVersion::TLS11, None);
        assert_eq!(negotiate_version(range, &h).unwrap(), ProtocolVersion::TLS11);
    }

    #[test]
    fn no_common_version_is_protocol_version_alert() {
        let range = VersionRange::default();
        let h = hello(ProtocolVersion::TLS10, None);
        let err = negotiate_version(range, &h).unwrap_err();
        assert_eq!(err.local_alert(), Some(AlertDescription::ProtocolVersion));

        let h = hello(ProtocolVersion::TLS12, Some(vec![ProtocolVersion::TLS11]));
        assert!(negotiate_version(range, &h).is_err());
    }
}
