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

//! Collaborators that supply secured connections and track the candidate fleet.
//!
//! The dispatcher only sees [`ConnectionManager`] and [`IpManager`]. The concrete
//! [`TlsConnectionManager`] dials a candidate over TCP, runs the in-crate TLS client
//! handshake and reports whether ALPN settled on HTTP/2.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::Instant,
};

use crate::{
    config::FrontSection,
    tls::{self, ClientConfig},
    utils::{FrontError, FrontResult},
};

/// Byte stream a worker runs HTTP over.
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

/// A ready connection plus what the handshake learned.
pub struct SecuredConnection {
    pub io: Box<dyn AsyncIo>,
    pub ip: IpAddr,
    pub sni: String,
    pub handshake_time: Duration,
    pub http2: bool,
}

impl std::fmt::Debug for SecuredConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuredConnection")
            .field("ip", &self.ip)
            .field("sni", &self.sni)
            .field("handshake_time", &self.handshake_time)
            .field("http2", &self.http2)
            .finish()
    }
}

#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn get_ssl_connection(&self, timeout: Duration) -> FrontResult<SecuredConnection>;
}

/// Fleet-wide health and throughput bookkeeping.
pub trait IpManager: Send + Sync {
    /// Bytes per second last measured for `ip`; 0 when unknown.
    fn get_speed(&self, ip: IpAddr) -> f64;

    fn update_speed(&self, ip: IpAddr, speed: f64);

    fn report_connect_closed(&self, ip: IpAddr, sni: &str, reason: &str);
}

/// Weight of a new speed sample in the rolling average.
const SPEED_SMOOTHING: f64 = 0.3;
/// Connect failures after which a candidate is skipped while others remain.
const MAX_CONNECT_FAILURES: u32 = 3;

/// Fixed candidate list with round-robin selection.
#[derive(Debug)]
pub struct StaticIpManager {
    candidates: Vec<IpAddr>,
    cursor: AtomicUsize,
    speeds: DashMap<IpAddr, f64>,
    failures: DashMap<IpAddr, u32>,
    closed: DashMap<IpAddr, u64>,
}

impl StaticIpManager {
    pub fn new(candidates: Vec<IpAddr>) -> Self {
        Self {
            candidates,
            cursor: AtomicUsize::new(0),
            speeds: DashMap::new(),
            failures: DashMap::new(),
            closed: DashMap::new(),
        }
    }

    pub fn candidates(&self) -> &[IpAddr] {
        &self.candidates
    }

    /// Next candidate in rotation, skipping ones that keep failing to connect.
    pub fn next_candidate(&self) -> Option<IpAddr> {
        if self.candidates.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let n = self.candidates.len();
        (0..n)
            .map(|i| self.candidates[(start + i) % n])
            .find(|ip| self.failures.get(ip).map_or(true, |f| *f < MAX_CONNECT_FAILURES))
            .or_else(|| Some(self.candidates[start % n]))
    }

    pub fn report_connect_failed(&self, ip: IpAddr) {
        *self.failures.entry(ip).or_insert(0) += 1;
    }

    pub fn report_connect_ok(&self, ip: IpAddr) {
        self.failures.remove(&ip);
    }

    pub fn closed_count(&self, ip: IpAddr) -> u64 {
        self.closed.get(&ip).map_or(0, |c| *c)
    }
}

impl IpManager for StaticIpManager {
    fn get_speed(&self, ip: IpAddr) -> f64 {
        self.speeds.get(&ip).map_or(0.0, |s| *s)
    }

    fn update_speed(&self, ip: IpAddr, speed: f64) {
        if !speed.is_finite() || speed <= 0.0 {
            return;
        }
        self.speeds
            .entry(ip)
            .and_modify(|s| *s = *s * (1.0 - SPEED_SMOOTHING) + speed * SPEED_SMOOTHING)
            .or_insert(speed);
    }

    fn report_connect_closed(&self, ip: IpAddr, sni: &str, reason: &str) {
        tracing::debug!(%ip, sni, reason, "connection closed");
        *self.closed.entry(ip).or_insert(0) += 1;
    }
}

/// Dials candidates and runs the client handshake.
pub struct TlsConnectionManager {
    front: FrontSection,
    tls: Arc<ClientConfig>,
    ips: Arc<StaticIpManager>,
    sni_cursor: AtomicUsize,
}

impl TlsConnectionManager {
    pub fn new(front: FrontSection, tls: Arc<ClientConfig>, ips: Arc<StaticIpManager>) -> Self {
        Self {
            front,
            tls,
            ips,
            sni_cursor: AtomicUsize::new(0),
        }
    }

    fn next_sni(&self) -> String {
        if self.front.sni.is_empty() {
            return self.front.host.clone();
        }
        let i = self.sni_cursor.fetch_add(1, Ordering::Relaxed) % self.front.sni.len();
        self.front.sni[i].clone()
    }

    async fn dial(&self, ip: IpAddr, sni: &str, timeout: Duration) -> FrontResult<SecuredConnection> {
        let started = Instant::now();
        let addr = SocketAddr::new(ip, self.front.port);
        let tcp = tokio::time::timeout(self.front.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| FrontError::Timeout("tcp connect"))??;
        tcp.set_nodelay(true)?;

        let budget = timeout.min(self.front.handshake_timeout());
        let channel = tokio::time::timeout(budget, tls::connect(self.tls.clone(), Some(sni), tcp))
            .await
            .map_err(|_| FrontError::Timeout("tls handshake"))??;
        let handshake_time = started.elapsed();
        let http2 = channel.alpn() == Some(b"h2".as_slice());
        tracing::debug!(
            %ip,
            sni,
            version = %channel.version(),
            suite = channel.suite().name,
            resumed = channel.is_resumed(),
            http2,
            handshake_ms = handshake_time.as_millis() as u64,
            "secured connection ready"
        );
        Ok(SecuredConnection {
            io: Box::new(channel.into_io()),
            ip,
            sni: sni.to_string(),
            handshake_time,
            http2,
        })
    }
}

#[async_trait]
impl ConnectionManager for TlsConnectionManager {
    async fn get_ssl_connection(&self, timeout: Duration) -> FrontResult<SecuredConnection> {
        let ip = self.ips.next_candidate().ok_or(FrontError::NoCandidate)?;
        let sni = self.next_sni();
        match self.dial(ip, &sni, timeout).await {
            Ok(conn) => {
                self.ips.report_connect_ok(ip);
                Ok(conn)
            }
            Err(err) => {
                tracing::debug!(%ip, sni = %sni, error = %err, "connect failed");
                self.ips.report_connect_failed(ip);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn rotation_skips_failing_candidates() {
        let ips = StaticIpManager::new(vec![ip("192.0.2.1"), ip("192.0.2.2")]);
        for _ in 0..MAX_CONNECT_FAILURES {
            ips.report_connect_failed(ip("192.0.2.1"));
        }
        for _ in 0..4 {
            assert_eq!(ips.next_candidate(), Some(ip("192.0.2.2")));
        }
        ips.report_connect_ok(ip("192.0.2.1"));
        let picks: Vec<_> = (0..2).filter_map(|_| ips.next_candidate()).collect();
        assert!(picks.contains(&ip("192.0.2.1")));
    }

    #[test]
    fn speed_is_smoothed() {
        let ips = StaticIpManager::new(vec![ip("192.0.2.1")]);
        assert_eq!(ips.get_speed(ip("192.0.2.1")), 0.0);
        ips.update_speed(ip("192.0.2.1"), 1000.0);
        ips.update_speed(ip("192.0.2.1"), 2000.0);
        assert!((ips.get_speed(ip("192.0.2.1")) - 1300.0).abs() < 1e-9);
        ips.update_speed(ip("192.0.2.1"), f64::NAN);
        assert!((ips.get_speed(ip("192.0.2.1")) - 1300.0).abs() < 1e-9);
    }

    #[test]
    fn empty_fleet_has_no_candidate() {
        assert_eq!(StaticIpManager::new(Vec::new()).next_candidate(), None);
    }
}
