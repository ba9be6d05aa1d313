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

//! Resumption state: negotiated sessions, the server's session-id cache, the client's
//! per-server store and the sealed ticket format shared by TLS 1.2 and TLS 1.3.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bytes::BufMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};

use crate::{
    tls::{
        codec::{put_vec_u16, put_vec_u8, Reader},
        suites::ProtocolVersion,
    },
    utils::{TlsError, TlsResult},
};

/// Outcome of a completed handshake, kept for resumption and inspection.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub version: ProtocolVersion,
    pub suite: u16,
    pub session_id: Vec<u8>,
    pub master_secret: Vec<u8>,
    pub server_name: Option<String>,
    pub extended_master_secret: bool,
    pub encrypt_then_mac: bool,
    pub alpn: Option<Vec<u8>>,
    pub peer_chain: Vec<Vec<u8>>,
    /// TLS 1.2 ticket received from the server (client side only).
    pub ticket: Option<Vec<u8>>,
    pub resumable: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("version", &self.version)
            .field("suite", &format_args!("{:#06x}", self.suite))
            .field("server_name", &self.server_name)
            .field("ems", &self.extended_master_secret)
            .field("etm", &self.encrypt_then_mac)
            .field("alpn", &self.alpn.as_ref().map(|a| String::from_utf8_lossy(a).into_owned()))
            .field("resumable", &self.resumable)
            .finish()
    }
}

impl Session {
    /// Whether resuming this session for a ClientHello with the given parameters is
    /// consistent with how it was established.
    pub fn matches(&self, suite: u16, server_name: Option<&str>, ems: bool) -> bool {
        self.resumable
            && self.suite == suite
            && self.server_name.as_deref() == server_name
            && self.extended_master_secret == ems
    }
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedSession {
    session: Session,
    created_at: Instant,
}

/// SHA-256 of a session secret; names a session family without holding its secret.
pub fn secret_fingerprint(secret: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(ring::digest::digest(&ring::digest::SHA256, secret).as_ref());
    out
}

/// Revocations outlive the longest TLS 1.3 ticket.
const MIN_REVOCATION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Server-side TLS ≤1.2 session cache keyed by session id.
///
/// Also holds the revocation list consulted for tickets, which carry their state with
/// them and cannot be dropped from a store.
#[derive(Debug)]
pub struct SessionCache {
    store: DashMap<Vec<u8>, CachedSession>,
    revoked: DashMap<[u8; 32], Instant>,
    ttl: Duration,
    capacity: usize,
    stats: CacheStats,
}

impl SessionCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            store: DashMap::new(),
            revoked: DashMap::new(),
            ttl,
            capacity,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, session_id: &[u8]) -> Option<Session> {
        if session_id.is_empty() {
            return None;
        }
        let expired = match self.store.get(session_id) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => {
                self.stats.record_hit();
                return Some(entry.session.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.stats.record_expired();
            self.store.remove(session_id);
        } else {
            self.stats.record_miss();
        }
        None
    }

    pub fn insert(&self, session: Session) {
        if session.session_id.is_empty() || !session.resumable {
            return;
        }
        if self.store.len() >= self.capacity {
            let ttl = self.ttl;
            self.store.retain(|_, cached| cached.created_at.elapsed() < ttl);
            if self.store.len() >= self.capacity {
                tracing::debug!(capacity = self.capacity, "session cache full, not caching");
                return;
            }
        }
        self.store.insert(
            session.session_id.clone(),
            CachedSession {
                session,
                created_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, session_id: &[u8]) {
        self.store.remove(session_id);
    }

    /// Makes a session non-resumable by id and by every ticket of its family.
    pub fn revoke(&self, session_id: &[u8], fingerprint: [u8; 32]) {
        if !session_id.is_empty() {
            self.store.remove(session_id);
        }
        let ttl = self.revocation_ttl();
        self.revoked.retain(|_, at| at.elapsed() < ttl);
        self.revoked.insert(fingerprint, Instant::now());
    }

    pub fn is_revoked(&self, fingerprint: &[u8; 32]) -> bool {
        let live = match self.revoked.get(fingerprint) {
            Some(at) => at.elapsed() < self.revocation_ttl(),
            None => return false,
        };
        if !live {
            self.revoked.remove(fingerprint);
        }
        live
    }

    fn revocation_ttl(&self) -> Duration {
        self.ttl.max(MIN_REVOCATION_TTL)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.stats.snapshot()
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), 10_000)
    }
}

/// A TLS 1.3 ticket as held by the client.
#[derive(Clone)]
pub struct ClientTicket {
    pub ticket: Vec<u8>,
    pub psk: Vec<u8>,
    pub suite: u16,
    pub age_add: u32,
    pub lifetime: u32,
    pub received_at: Instant,
    pub alpn: Option<Vec<u8>>,
}

impl ClientTicket {
    pub fn is_fresh(&self) -> bool {
        self.received_at.elapsed() < Duration::from_secs(u64::from(self.lifetime))
    }

    /// `obfuscated_ticket_age` for the pre_shared_key extension.
    pub fn obfuscated_age(&self) -> u32 {
        (self.received_at.elapsed().as_millis() as u32).wrapping_add(self.age_add)
    }
}

#[derive(Default)]
struct ClientEntry {
    session: Option<Session>,
    tickets: Vec<ClientTicket>,
}

const MAX_TICKETS_PER_SERVER: usize = 4;

/// Client-side resumption state keyed by server name.
#[derive(Default)]
pub struct ClientSessionStore {
    entries: Mutex<std::collections::HashMap<String, ClientEntry>>,
}

impl ClientSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_session(&self, server_name: &str, session: Session) {
        if !session.resumable {
            return;
        }
        self.entries
            .lock()
            .entry(server_name.to_ascii_lowercase())
            .or_default()
            .session = Some(session);
    }

    pub fn session(&self, server_name: &str) -> Option<Session> {
        self.entries
            .lock()
            .get(&server_name.to_ascii_lowercase())
            .and_then(|e| e.session.clone())
    }

    pub fn push_ticket(&self, server_name: &str, ticket: ClientTicket) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(server_name.to_ascii_lowercase()).or_default();
        entry.tickets.push(ticket);
        if entry.tickets.len() > MAX_TICKETS_PER_SERVER {
            entry.tickets.remove(0);
        }
    }

    /// Takes the newest fresh ticket; tickets are single-use.
    pub fn take_ticket(&self, server_name: &str) -> Option<ClientTicket> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&server_name.to_ascii_lowercase())?;
        entry.tickets.retain(ClientTicket::is_fresh);
        entry.tickets.pop()
    }

    /// Drops everything known about a server, e.g. after a failed resumption.
    pub fn forget(&self, server_name: &str) {
        self.entries.lock().remove(&server_name.to_ascii_lowercase());
    }
}

/// Server-internal state carried inside a sealed ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketPayload {
    /// RFC 5077 ticket standing in for a cached TLS ≤1.2 session.
    Tls12 {
        version: ProtocolVersion,
        suite: u16,
        master_secret: Vec<u8>,
        extended_master_secret: bool,
        encrypt_then_mac: bool,
        server_name: Option<String>,
        issued_at_ms: u64,
    },
    /// TLS 1.3 resumption PSK.
    Tls13 {
        suite: u16,
        psk: Vec<u8>,
        /// Fingerprint of the full handshake this ticket descends from.
        lineage: [u8; 32],
        age_add: u32,
        server_name: Option<String>,
        alpn: Option<Vec<u8>>,
        issued_at_ms: u64,
    },
}

fn put_opt(out: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(v) => {
            out.put_u8(1);
            put_vec_u16(out, v);
        }
        None => out.put_u8(0),
    }
}

fn get_opt(r: &mut Reader<'_>) -> TlsResult<Option<Vec<u8>>> {
    Ok(match r.u8()? {
        0 => None,
        _ => Some(r.vec_u16()?.to_vec()),
    })
}

fn get_name(r: &mut Reader<'_>) -> TlsResult<Option<String>> {
    get_opt(r)?
        .map(|raw| String::from_utf8(raw).map_err(|_| TlsError::decode("ticket server name")))
        .transpose()
}

impl TicketPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            TicketPayload::Tls12 {
                version,
                suite,
                master_secret,
                extended_master_secret,
                encrypt_then_mac,
                server_name,
                issued_at_ms,
            } => {
                out.put_u8(1);
                out.put_u16(version.0);
                out.put_u16(*suite);
                put_vec_u8(&mut out, master_secret);
                out.put_u8(u8::from(*extended_master_secret));
                out.put_u8(u8::from(*encrypt_then_mac));
                put_opt(&mut out, server_name.as_deref().map(str::as_bytes));
                out.put_u64(*issued_at_ms);
            }
            TicketPayload::Tls13 {
                suite,
                psk,
                lineage,
                age_add,
                server_name,
                alpn,
                issued_at_ms,
            } => {
                out.put_u8(2);
                out.put_u16(*suite);
                put_vec_u8(&mut out, psk);
                out.put_slice(lineage);
                out.put_u32(*age_add);
                put_opt(&mut out, server_name.as_deref().map(str::as_bytes));
                put_opt(&mut out, alpn.as_deref());
                out.put_u64(*issued_at_ms);
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> TlsResult<Self> {
        let mut r = Reader::new(data);
        let payload = match r.u8()? {
            1 => TicketPayload::Tls12 {
                version: ProtocolVersion(r.u16()?),
                suite: r.u16()?,
                master_secret: r.vec_u8()?.to_vec(),
                extended_master_secret: r.u8()? == 1,
                encrypt_then_mac: r.u8()? == 1,
                server_name: get_name(&mut r)?,
                issued_at_ms: u64::from_be_bytes(r.array::<8>()?),
            },
            2 => TicketPayload::Tls13 {
                suite: r.u16()?,
                psk: r.vec_u8()?.to_vec(),
                lineage: r.array::<32>()?,
                age_add: r.u32()?,
                server_name: get_name(&mut r)?,
                alpn: get_opt(&mut r)?,
                issued_at_ms: u64::from_be_bytes(r.array::<8>()?),
            },
            other => return Err(TlsError::decode(format!("ticket kind {other}"))),
        };
        r.expect_empty("ticket")?;
        Ok(payload)
    }

    pub fn issued_at_ms(&self) -> u64 {
        match self {
            TicketPayload::Tls12 { issued_at_ms, .. } | TicketPayload::Tls13 { issued_at_ms, .. } => {
                *issued_at_ms
            }
        }
    }
}

const TICKET_NONCE_LEN: usize = 12;

/// Seals tickets as `nonce || AES-256-GCM(payload)`; opens by trying each key in order.
pub struct TicketSealer {
    keys: Vec<LessSafeKey>,
    lifetime: Duration,
}

impl std::fmt::Debug for TicketSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketSealer")
            .field("keys", &self.keys.len())
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl TicketSealer {
    /// The first key seals; all keys open (rotation keeps old keys at the back).
    pub fn new(keys: &[[u8; 32]], lifetime: Duration) -> TlsResult<Self> {
        if keys.is_empty() {
            return Err(TlsError::internal("ticket sealer needs at least one key"));
        }
        let keys = keys
            .iter()
            .map(|k| {
                UnboundKey::new(&aead::AES_256_GCM, k)
                    .map(LessSafeKey::new)
                    .map_err(|_| TlsError::internal("bad ticket key"))
            })
            .collect::<TlsResult<Vec<_>>>()?;
        Ok(Self { keys, lifetime })
    }

    pub fn random(lifetime: Duration) -> TlsResult<Self> {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self::new(&[key], lifetime)
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn seal(&self, payload: &TicketPayload) -> TlsResult<Vec<u8>> {
        let mut nonce = [0u8; TICKET_NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let mut sealed = payload.encode();
        self.keys[0]
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
            .map_err(|_| TlsError::internal("ticket seal failed"))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// `None` for tickets that fail to open, fail to parse, or have expired.
    pub fn open(&self, ticket: &[u8]) -> Option<TicketPayload> {
        if ticket.len() <= TICKET_NONCE_LEN {
            return None;
        }
        let (nonce, sealed) = ticket.split_at(TICKET_NONCE_LEN);
        for key in &self.keys {
            let mut nonce_bytes = [0u8; TICKET_NONCE_LEN];
            nonce_bytes.copy_from_slice(nonce);
            let mut buf = sealed.to_vec();
            let Ok(plain) = key.open_in_place(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut buf)
            else {
                continue;
            };
            let payload = TicketPayload::decode(plain).ok()?;
            let age_ms = unix_millis().saturating_sub(payload.issued_at_ms());
            if age_ms > self.lifetime.as_millis() as u64 {
                tracing::debug!(age_ms, "ticket expired");
                return None;
            }
            return Some(payload);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: u8) -> Session {
        Session {
            version: ProtocolVersion::TLS12,
            suite: 0xc02f,
            session_id: vec![id; 32],
            master_secret: vec![9; 48],
            server_name: Some("front.test".into()),
            extended_master_secret: true,
            encrypt_then_mac: false,
            alpn: None,
            peer_chain: vec![],
            ticket: None,
            resumable: true,
        }
    }

    #[test]
    fn cache_hits_and_expires() {
        let cache = SessionCache::new(Duration::from_secs(60), 2);
        cache.insert(session(1));
        assert!(cache.get(&[1; 32]).is_some());
        assert!(cache.get(&[2; 32]).is_none());
        let metrics = cache.metrics();
        assert_eq!((metrics.hits, metrics.misses), (1, 1));

        let short = SessionCache::new(Duration::ZERO, 2);
        short.insert(session(3));
        assert!(short.get(&[3; 32]).is_none());
        assert_eq!(short.metrics().expired, 1);
    }

    #[test]
    fn consistency_check_covers_suite_sni_and_ems() {
        let s = session(1);
        assert!(s.matches(0xc02f, Some("front.test"), true));
        assert!(!s.matches(0xc030, Some("front.test"), true));
        assert!(!s.matches(0xc02f, Some("other.test"), true));
        assert!(!s.matches(0xc02f, Some("front.test"), false));
    }

    #[test]
    fn revoked_family_stays_out_of_the_cache() {
        let cache = SessionCache::new(Duration::from_secs(60), 4);
        let s = session(1);
        cache.insert(s.clone());
        let fingerprint = secret_fingerprint(&s.master_secret);
        assert!(!cache.is_revoked(&fingerprint));

        cache.revoke(&s.session_id, fingerprint);
        assert!(cache.get(&s.session_id).is_none());
        assert!(cache.is_revoked(&fingerprint));
        assert!(!cache.is_revoked(&secret_fingerprint(b"other")));

        let short = SessionCache::new(Duration::ZERO, 4);
        short.revoke(&[], fingerprint);
        assert!(!short.is_revoked(&fingerprint));
    }

    #[test]
    fn sealer_tries_every_key() {
        let old = TicketSealer::new(&[[1; 32]], Duration::from_secs(60)).unwrap();
        let rotated = TicketSealer::new(&[[2; 32], [1; 32]], Duration::from_secs(60)).unwrap();
        let payload = TicketPayload::Tls13 {
            suite: 0x1301,
            psk: vec![4; 32],
            lineage: [6; 32],
            age_add: 77,
            server_name: Some("a".into()),
            alpn: Some(b"h2".to_vec()),
            issued_at_ms: unix_millis(),
        };
        let ticket = old.seal(&payload).unwrap();
        assert_eq!(rotated.open(&ticket), Some(payload));

        let mut tampered = ticket.clone();
        tampered[20] ^= 1;
        assert!(rotated.open(&tampered).is_none());
        let stranger = TicketSealer::new(&[[3; 32]], Duration::from_secs(60)).unwrap();
        assert!(stranger.open(&ticket).is_none());
    }

    #[test]
    fn client_store_hands_out_tickets_once() {
        let store = ClientSessionStore::new();
        store.push_ticket(
            "Front.Test",
            ClientTicket {
                ticket: vec![1],
                psk: vec![2; 32],
                suite: 0x1301,
                age_add: 5,
                lifetime: 3600,
                received_at: Instant::now(),
                alpn: None,
            },
        );
        assert!(store.take_ticket("front.test").is_some());
        assert!(store.take_ticket("front.test").is_none());
    }
}
