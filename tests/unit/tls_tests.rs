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

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use front_transport::{
    tls::{
        self,
        credentials::PinnedVerifier,
        groups::DhParams,
        lookup_suite,
        srp::{SrpGroup, SrpVerifier},
        AlertDescription, CertifiedKey, ClientConfig, ClientSessionStore, EcdsaP256Key, Ed25519Key, KeyType,
        NamedGroup, ProtocolVersion, RingPeerKey, RsaKey, SecureChannel, ServerConfig, SignatureScheme,
        TicketSealer, VersionRange,
    },
    utils::{TlsError, TlsResult},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

type Pair = (TlsResult<SecureChannel<DuplexStream>>, TlsResult<SecureChannel<DuplexStream>>);

fn ed25519_identity() -> (CertifiedKey, PinnedVerifier) {
    let key = Ed25519Key::generate().unwrap();
    let leaf = b"front-test-leaf-ed25519".to_vec();
    let verifier = PinnedVerifier::new().pin(
        PinnedVerifier::fingerprint(&leaf),
        RingPeerKey::new(KeyType::Ed25519, key.public_key()),
    );
    (CertifiedKey::new(vec![leaf], Arc::new(key)), verifier)
}

fn p256_identity() -> (CertifiedKey, PinnedVerifier) {
    let key = EcdsaP256Key::generate().unwrap();
    let leaf = b"front-test-leaf-p256".to_vec();
    let verifier = PinnedVerifier::new().pin(
        PinnedVerifier::fingerprint(&leaf),
        RingPeerKey::new(KeyType::Ecdsa(NamedGroup::Secp256r1), key.public_key()),
    );
    (CertifiedKey::new(vec![leaf], Arc::new(key)), verifier)
}

fn tls12_only() -> VersionRange {
    VersionRange {
        min: ProtocolVersion::TLS12,
        max: ProtocolVersion::TLS12,
    }
}

async fn handshake(client: &Arc<ClientConfig>, server: &Arc<ServerConfig>) -> Pair {
    let (c, s) = tokio::io::duplex(64 * 1024);
    tokio::join!(
        tls::connect(Arc::clone(client), Some("front.test"), c),
        tls::accept(Arc::clone(server), s)
    )
}

const RSA_PKCS8: &[u8] = include_bytes!("fixtures/rsa2048.der");

fn rsa_identity() -> (CertifiedKey, PinnedVerifier) {
    let key = RsaKey::from_pkcs8(RSA_PKCS8).unwrap();
    let leaf = b"front-test-leaf-rsa".to_vec();
    let verifier = PinnedVerifier::new().pin(
        PinnedVerifier::fingerprint(&leaf),
        RingPeerKey::new(KeyType::Rsa, key.public_key()),
    );
    (CertifiedKey::new(vec![leaf], Arc::new(key)), verifier)
}

/// An Ed25519 pair whose leaf is `name`, with the pin a client needs for it.
fn named_ed25519(name: &str) -> (CertifiedKey, [u8; 32], RingPeerKey) {
    let key = Ed25519Key::generate().unwrap();
    let leaf = name.as_bytes().to_vec();
    let pin = PinnedVerifier::fingerprint(&leaf);
    let peer = RingPeerKey::new(KeyType::Ed25519, key.public_key());
    (CertifiedKey::new(vec![leaf], Arc::new(key)), pin, peer)
}

fn only(version: ProtocolVersion) -> VersionRange {
    VersionRange {
        min: version,
        max: version,
    }
}

fn suites(ids: &[u16]) -> Vec<&'static tls::CipherSuite> {
    ids.iter().map(|id| lookup_suite(*id).unwrap()).collect()
}

/// Like [`handshake`], but every chunk the client sends passes through `tamper` first,
/// together with its offset in the client's byte stream.
async fn relayed_handshake<F>(client: &Arc<ClientConfig>, server: &Arc<ServerConfig>, mut tamper: F) -> Pair
where
    F: FnMut(usize, &mut [u8]) + Send + 'static,
{
    let (c, relay_client) = tokio::io::duplex(64 * 1024);
    let (relay_server, s) = tokio::io::duplex(64 * 1024);
    let (mut from_client, mut to_client) = tokio::io::split(relay_client);
    let (mut from_server, mut to_server) = tokio::io::split(relay_server);
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = 0;
        loop {
            let n = match from_client.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            tamper(offset, &mut buf[..n]);
            offset += n;
            if to_server.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = to_server.shutdown().await;
    });
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut from_server, &mut to_client).await;
    });
    tokio::join!(
        tls::connect(Arc::clone(client), Some("front.test"), c),
        tls::accept(Arc::clone(server), s)
    )
}

/// Flips the last byte of every chunk once `armed` is set.
fn flip_tail_when(armed: Arc<AtomicBool>) -> impl FnMut(usize, &mut [u8]) + Send + 'static {
    move |_, chunk| {
        if armed.load(Ordering::SeqCst) {
            if let Some(last) = chunk.last_mut() {
                *last ^= 0x01;
            }
        }
    }
}

/// Flips the byte at `position` of the client's stream.
fn flip_at(position: usize) -> impl FnMut(usize, &mut [u8]) + Send + 'static {
    move |offset, chunk| {
        if (offset..offset + chunk.len()).contains(&position) {
            chunk[position - offset] ^= 0x01;
        }
    }
}

/// Leaf the client saw after a handshake against `certificates`.
async fn served_leaf(client: &Arc<ClientConfig>, certificates: Vec<CertifiedKey>) -> Vec<u8> {
    let server = Arc::new(ServerConfig::new(certificates));
    let (client, server) = handshake(client, &server).await;
    server.expect("server handshake");
    client.expect("client handshake").session().peer_chain[0].clone()
}

async fn exchange(client: &mut SecureChannel<DuplexStream>, server: &mut SecureChannel<DuplexStream>) {
    client.write_all(b"ping").await.unwrap();
    assert_eq!(server.read_chunk().await.unwrap().as_deref(), Some(b"ping".as_slice()));
    server.write_all(b"pong").await.unwrap();
    assert_eq!(client.read_chunk().await.unwrap().as_deref(), Some(b"pong".as_slice()));
}

#[tokio::test]
async fn tls13_handshake_negotiates_alpn_and_carries_data() {
    let (identity, verifier) = ed25519_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let mut client = ClientConfig::new(Arc::new(verifier));
    client.alpn_protocols = vec![b"http/1.1".to_vec(), b"h2".to_vec()];

    let (client, server) = handshake(&Arc::new(client), &Arc::new(server)).await;
    let mut client = client.expect("client handshake");
    let mut server = server.expect("server handshake");

    assert_eq!(client.version(), ProtocolVersion::TLS13);
    assert_eq!(server.version(), ProtocolVersion::TLS13);
    assert_eq!(client.alpn(), Some(b"h2".as_slice()));
    assert!(!client.is_resumed());
    assert!(client.peer_key().is_some());

    client.write_all(b"ping").await.unwrap();
    assert_eq!(server.read_chunk().await.unwrap().as_deref(), Some(b"ping".as_slice()));
    server.write_all(b"pong").await.unwrap();
    assert_eq!(client.read_chunk().await.unwrap().as_deref(), Some(b"pong".as_slice()));

    client.close().await.unwrap();
    assert_eq!(server.read_chunk().await.unwrap(), None);
}

#[tokio::test]
async fn tls12_session_id_resumption_and_ems_mismatch() {
    let (identity, verifier) = p256_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.versions = tls12_only();
    let server = Arc::new(server);

    let store = Arc::new(ClientSessionStore::new());
    let mut client = ClientConfig::new(Arc::new(verifier));
    client.versions = tls12_only();
    client.sessions = Some(Arc::clone(&store));
    let client = Arc::new(client);

    let (c1, s1) = handshake(&client, &server).await;
    let (c1, s1) = (c1.expect("first client"), s1.expect("first server"));
    assert_eq!(c1.version(), ProtocolVersion::TLS12);
    assert!(!c1.is_resumed());
    assert!(!c1.session().session_id.is_empty());
    assert_eq!(c1.session().session_id, s1.session().session_id);

    let (c2, s2) = handshake(&client, &server).await;
    let (c2, s2) = (c2.expect("resumed client"), s2.expect("resumed server"));
    assert!(c2.is_resumed());
    assert!(s2.is_resumed());
    assert_eq!(c2.session().session_id, c1.session().session_id);
    assert_eq!(c2.session().master_secret, c1.session().master_secret);

    // Same store, but without extended_master_secret: the cached session no longer fits.
    let mut no_ems = (*client).clone();
    no_ems.extended_master_secret = false;
    let (c3, s3) = handshake(&Arc::new(no_ems), &server).await;
    let (c3, s3) = (c3.expect("full client"), s3.expect("full server"));
    assert!(!c3.is_resumed());
    assert!(!s3.is_resumed());
    assert_ne!(c3.session().session_id, c1.session().session_id);
}

#[tokio::test]
async fn tls13_ticket_resumes_next_connection() {
    let (identity, verifier) = ed25519_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.ticket_sealer = Some(Arc::new(TicketSealer::random(Duration::from_secs(3600)).unwrap()));
    let server = Arc::new(server);

    let store = Arc::new(ClientSessionStore::new());
    let mut client = ClientConfig::new(Arc::new(verifier));
    client.sessions = Some(Arc::clone(&store));
    let client = Arc::new(client);

    let (c1, s1) = handshake(&client, &server).await;
    let (mut c1, mut s1) = (c1.expect("first client"), s1.expect("first server"));
    assert!(!c1.is_resumed());
    // The ticket travels ahead of this data.
    s1.write_all(b"welcome").await.unwrap();
    assert_eq!(c1.read_chunk().await.unwrap().as_deref(), Some(b"welcome".as_slice()));

    let (c2, s2) = handshake(&client, &server).await;
    let (c2, s2) = (c2.expect("resumed client"), s2.expect("resumed server"));
    assert_eq!(c2.version(), ProtocolVersion::TLS13);
    assert!(c2.is_resumed());
    assert!(s2.is_resumed());
}

#[tokio::test]
async fn unpinned_certificate_is_rejected() {
    let (identity, _) = ed25519_identity();
    let (_, other_verifier) = ed25519_identity();
    let server = Arc::new(ServerConfig::new(vec![identity]));
    let client = Arc::new(ClientConfig::new(Arc::new(other_verifier)));

    let (client, server) = handshake(&client, &server).await;
    assert!(client.is_err());
    assert!(server.is_err());
}

#[tokio::test]
async fn key_update_keeps_the_channel_usable() {
    let (identity, verifier) = ed25519_identity();
    let server = Arc::new(ServerConfig::new(vec![identity]));
    let client = Arc::new(ClientConfig::new(Arc::new(verifier)));

    let (client, server) = handshake(&client, &server).await;
    let (mut client, mut server) = (client.unwrap(), server.unwrap());

    client.key_update(true).await.unwrap();
    client.write_all(b"after update").await.unwrap();
    assert_eq!(server.read_chunk().await.unwrap().as_deref(), Some(b"after update".as_slice()));

    server.write_all(b"reply").await.unwrap();
    assert_eq!(client.read_chunk().await.unwrap().as_deref(), Some(b"reply".as_slice()));
}

#[tokio::test]
async fn fatal_record_error_evicts_tls12_session() {
    let (identity, verifier) = p256_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.versions = tls12_only();
    let server = Arc::new(server);

    let mut client = ClientConfig::new(Arc::new(verifier));
    client.versions = tls12_only();
    client.sessions = Some(Arc::new(ClientSessionStore::new()));
    let client = Arc::new(client);

    let tamper = Arc::new(AtomicBool::new(false));
    let (c1, s1) = relayed_handshake(&client, &server, flip_tail_when(Arc::clone(&tamper))).await;
    let (mut c1, mut s1) = (c1.expect("first client"), s1.expect("first server"));
    tamper.store(true, Ordering::SeqCst);
    c1.write_all(b"corrupted in flight").await.unwrap();
    assert!(s1.read_chunk().await.is_err());

    // The client still offers the session id; the server must not honour it.
    let (c2, s2) = handshake(&client, &server).await;
    let (c2, s2) = (c2.expect("second client"), s2.expect("second server"));
    assert!(!s2.is_resumed());
    assert!(!c2.is_resumed());
    assert_ne!(c2.session().session_id, c1.session().session_id);
}

#[tokio::test]
async fn fatal_record_error_revokes_tls13_tickets() {
    let (identity, verifier) = ed25519_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.ticket_sealer = Some(Arc::new(TicketSealer::random(Duration::from_secs(3600)).unwrap()));
    let server = Arc::new(server);

    let store = Arc::new(ClientSessionStore::new());
    let mut client = ClientConfig::new(Arc::new(verifier));
    client.sessions = Some(Arc::clone(&store));
    let client = Arc::new(client);

    let tamper = Arc::new(AtomicBool::new(false));
    let (c1, s1) = relayed_handshake(&client, &server, flip_tail_when(Arc::clone(&tamper))).await;
    let (mut c1, mut s1) = (c1.expect("first client"), s1.expect("first server"));
    s1.write_all(b"welcome").await.unwrap();
    assert_eq!(c1.read_chunk().await.unwrap().as_deref(), Some(b"welcome".as_slice()));

    tamper.store(true, Ordering::SeqCst);
    c1.write_all(b"corrupted in flight").await.unwrap();
    assert!(s1.read_chunk().await.is_err());

    let (c2, s2) = handshake(&client, &server).await;
    let (c2, s2) = (c2.expect("second client"), s2.expect("second server"));
    assert!(!s2.is_resumed());
    assert!(!c2.is_resumed());
}

#[tokio::test]
async fn hello_retry_request_round_trip() {
    let (identity, verifier) = ed25519_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.groups = vec![NamedGroup::Secp256r1];
    let mut client = ClientConfig::new(Arc::new(verifier));
    client.key_share_groups = vec![NamedGroup::X25519];

    let (client, server) = handshake(&Arc::new(client), &Arc::new(server)).await;
    let (mut client, mut server) = (client.expect("client after retry"), server.expect("server after retry"));
    assert_eq!(client.version(), ProtocolVersion::TLS13);
    exchange(&mut client, &mut server).await;
}

#[tokio::test]
async fn certificate_selection_prefers_sni_then_strict_chain() {
    let (primary, primary_pin, primary_key) = named_ed25519("primary");
    let (alternate, alternate_pin, alternate_key) = named_ed25519("alternate");
    let verifier = PinnedVerifier::new()
        .pin(primary_pin, primary_key)
        .pin(alternate_pin, alternate_key);
    let client = Arc::new(ClientConfig::new(Arc::new(verifier)));
    let unadvertised = vec![SignatureScheme::Unknown(0x0b0b)];
    let for_sni = alternate.clone().for_hosts(vec!["front.test".into()]);

    // SNI alternate before the primary pair.
    let leaf = served_leaf(&client, vec![primary.clone(), for_sni.clone()]).await;
    assert_eq!(leaf, b"alternate");

    // A chain signed with algorithms the client never listed loses the strict pass.
    let weak_alternate = for_sni.clone().with_chain_schemes(unadvertised.clone());
    let leaf = served_leaf(&client, vec![primary.clone(), weak_alternate.clone()]).await;
    assert_eq!(leaf, b"primary");

    // With no strict match, the fallback pass keeps the SNI order.
    let weak_primary = primary.clone().with_chain_schemes(unadvertised);
    let leaf = served_leaf(&client, vec![weak_primary, weak_alternate]).await;
    assert_eq!(leaf, b"alternate");

    let elsewhere = alternate.for_hosts(vec!["other.test".into()]);
    let leaf = served_leaf(&client, vec![primary, elsewhere]).await;
    assert_eq!(leaf, b"primary");
}

#[tokio::test]
async fn corrupted_client_hello_fails_finished_with_decrypt_error() {
    let (identity, verifier) = p256_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.versions = tls12_only();
    let server = Arc::new(server);

    let store = Arc::new(ClientSessionStore::new());
    let mut client = ClientConfig::new(Arc::new(verifier));
    client.versions = tls12_only();
    // Without extended_master_secret the keys still agree; only the transcripts differ.
    client.extended_master_secret = false;
    client.cipher_suites = suites(&[0xc02b, 0xc02c]);
    client.sessions = Some(Arc::clone(&store));
    let client = Arc::new(client);

    // Record header (5), handshake header (4), version (2), random (32), empty session id (1),
    // suite list length (2): low byte of the second suite.
    let (c1, s1) = relayed_handshake(&client, &server, flip_at(5 + 4 + 2 + 32 + 1 + 2 + 3)).await;
    let server_err = s1.unwrap_err();
    assert_eq!(server_err.local_alert(), Some(AlertDescription::DecryptError));
    assert!(matches!(c1.unwrap_err(), TlsError::PeerAlert(AlertDescription::DecryptError)));

    let (c2, s2) = handshake(&client, &server).await;
    let (c2, s2) = (c2.expect("clean client"), s2.expect("clean server"));
    assert!(!c2.is_resumed());
    assert!(!s2.is_resumed());
}

#[tokio::test]
async fn legacy_versions_complete_cbc_handshakes() {
    for (version, etm) in [
        (ProtocolVersion::TLS10, true),
        (ProtocolVersion::TLS11, false),
        (ProtocolVersion::TLS12, true),
    ] {
        let (identity, verifier) = p256_identity();
        let mut server = ServerConfig::new(vec![identity]);
        server.versions = only(version);
        let mut client = ClientConfig::new(Arc::new(verifier));
        client.versions = only(version);
        client.cipher_suites = suites(&[0xc009]);
        client.encrypt_then_mac = etm;

        let (client, server) = handshake(&Arc::new(client), &Arc::new(server)).await;
        let (mut client, mut server) = (client.expect("legacy client"), server.expect("legacy server"));
        assert_eq!(client.version(), version);
        assert_eq!(client.suite().id, 0xc009);
        assert_eq!(client.session().encrypt_then_mac, etm);
        assert_eq!(server.session().encrypt_then_mac, etm);
        exchange(&mut client, &mut server).await;
    }
}

#[tokio::test]
async fn ssl3_dhe_rsa_handshake() {
    let (identity, verifier) = rsa_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.versions = only(ProtocolVersion::SSL3);
    let mut client = ClientConfig::new(Arc::new(verifier));
    client.versions = only(ProtocolVersion::SSL3);
    client.cipher_suites = suites(&[0x0033]);

    let (client, server) = handshake(&Arc::new(client), &Arc::new(server)).await;
    let (mut client, mut server) = (client.expect("SSL 3.0 client"), server.expect("SSL 3.0 server"));
    assert_eq!(client.version(), ProtocolVersion::SSL3);
    assert_eq!(server.suite().id, 0x0033);
    exchange(&mut client, &mut server).await;
}

#[tokio::test]
async fn rsa_key_transport_and_rsa_signatures() {
    for (versions, suite) in [
        (only(ProtocolVersion::TLS12), 0x002f),
        (only(ProtocolVersion::TLS10), 0x002f),
        (only(ProtocolVersion::TLS12), 0xc02f),
        (only(ProtocolVersion::TLS11), 0xc013),
    ] {
        let (identity, verifier) = rsa_identity();
        let mut server = ServerConfig::new(vec![identity]);
        server.versions = versions;
        let mut client = ClientConfig::new(Arc::new(verifier));
        client.versions = versions;
        client.cipher_suites = suites(&[suite]);

        let (client, server) = handshake(&Arc::new(client), &Arc::new(server)).await;
        let (mut client, mut server) = (client.expect("RSA client"), server.expect("RSA server"));
        assert_eq!(client.suite().id, suite);
        exchange(&mut client, &mut server).await;
    }

    // TLS 1.3 signs with RSA-PSS.
    let (identity, verifier) = rsa_identity();
    let server = Arc::new(ServerConfig::new(vec![identity]));
    let client = Arc::new(ClientConfig::new(Arc::new(verifier)));
    let (client, server) = handshake(&client, &server).await;
    let (mut client, mut server) = (client.expect("RSA 1.3 client"), server.expect("RSA 1.3 server"));
    assert_eq!(client.version(), ProtocolVersion::TLS13);
    exchange(&mut client, &mut server).await;
}

/// RFC 2409 second Oakley group (1024-bit MODP).
const MODP_1024_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381",
    "FFFFFFFFFFFFFFFF",
);

fn hex_bytes(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

#[tokio::test]
async fn dhe_prime_below_client_minimum_is_refused() {
    let (identity, verifier) = rsa_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.versions = tls12_only();
    server.dh_params = DhParams::from_bytes(&hex_bytes(MODP_1024_HEX), &[2]);
    let server = Arc::new(server);
    assert_eq!(server.dh_params.bits(), 1024);

    let mut client = ClientConfig::new(Arc::new(verifier));
    client.versions = tls12_only();
    client.cipher_suites = suites(&[0x0033]);
    assert_eq!(client.min_dh_bits, 2048);

    let (refused, _) = handshake(&Arc::new(client.clone()), &server).await;
    assert_eq!(
        refused.unwrap_err().local_alert(),
        Some(AlertDescription::InsufficientSecurity)
    );

    client.min_dh_bits = 1024;
    let (accepted, server_side) = handshake(&Arc::new(client), &server).await;
    let (mut accepted, mut server_side) = (accepted.expect("1024-bit client"), server_side.expect("1024-bit server"));
    assert_eq!(accepted.suite().id, 0x0033);
    exchange(&mut accepted, &mut server_side).await;
}

#[tokio::test]
async fn srp_handshake_authenticates_with_password() {
    let (identity, verifier) = ed25519_identity();
    let mut server = ServerConfig::new(vec![identity]);
    server.versions = tls12_only();
    server.cipher_suites = suites(&[0xc01d]);
    server.srp_users.insert(
        "alice".into(),
        SrpVerifier::derive(SrpGroup::rfc5054_1024(), b"alice", b"correct horse"),
    );
    let server = Arc::new(server);

    let mut client = ClientConfig::new(Arc::new(verifier));
    client.versions = tls12_only();
    client.cipher_suites = suites(&[0xc01d]);
    client.srp = Some(("alice".into(), "correct horse".into()));

    let (c, s) = handshake(&Arc::new(client.clone()), &server).await;
    let (mut c, mut s) = (c.expect("SRP client"), s.expect("SRP server"));
    assert_eq!(c.suite().id, 0xc01d);
    assert!(c.peer_key().is_none());
    exchange(&mut c, &mut s).await;

    client.srp = Some(("alice".into(), "battery staple".into()));
    let (c, s) = handshake(&Arc::new(client), &server).await;
    assert!(c.is_err());
    assert!(s.is_err());
}

#[tokio::test]
async fn warning_alert_during_handshake_closes_gracefully() {
    let (_, verifier) = ed25519_identity();
    let client = Arc::new(ClientConfig::new(Arc::new(verifier)));
    let (c, mut s) = tokio::io::duplex(64 * 1024);

    let peer = async move {
        let mut header = [0u8; 5];
        s.read_exact(&mut header).await.unwrap();
        let mut hello = vec![0u8; u16::from_be_bytes([header[3], header[4]]) as usize];
        s.read_exact(&mut hello).await.unwrap();
        // warning(1), user_canceled(90)
        s.write_all(&[21, 3, 3, 0, 2, 1, 90]).await.unwrap();
        // Stay open until the client gives up.
        let mut rest = Vec::new();
        let _ = s.read_to_end(&mut rest).await;
    };
    let (result, ()) = tokio::join!(tls::connect(client, Some("front.test"), c), peer);
    assert!(matches!(result, Err(TlsError::Closed)));
}
