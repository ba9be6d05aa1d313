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
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tls::{
    credentials::{KeyType, PinnedVerifier, RingPeerKey},
    groups::lookup_group,
    lookup_cipher, ClientConfig, ClientSessionStore, NamedGroup, ProtocolVersion, VersionRange,
};

/// Configuration loaders and structures for the front transport.
///
/// These types mirror `front.example.toml`, apply defaults to every tunable, and
/// normalize relative paths against the config file's directory.
#[derive(Debug, Clone, Deserialize)]
pub struct FrontConfig {
    /// Candidate fleet, SNI and request identity.
    pub front: FrontSection,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub http2: Http2Config,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl FrontConfig {
    /// Reads the config file, deserializes TOML, and normalizes relative paths.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut cfg: FrontConfig =
            toml::from_str(&raw).with_context(|| format!("invalid front config: {}", path.display()))?;

        let base_dir = path.parent();
        if let Some(list) = cfg.front.ip_list_path.as_mut() {
            Self::absolutize(base_dir, list);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn absolutize(base_dir: Option<&Path>, target: &mut PathBuf) {
        if target.is_relative() {
            if let Some(dir) = base_dir {
                *target = dir.join(&*target);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.front.ips.is_empty() && self.front.ip_list_path.is_none() {
            bail!("[front] needs `ips` or `ip_list_path`");
        }
        if self.dispatcher.max_workers == 0 {
            bail!("[dispatcher] max_workers must be positive");
        }
        if self.dispatcher.min_workers > self.dispatcher.max_workers {
            bail!("[dispatcher] min_workers exceeds max_workers");
        }
        if !(0.0..=1.0).contains(&self.http2.window_update_fraction) || self.http2.window_update_fraction == 0.0 {
            bail!("[http2] window_update_fraction must be in (0, 1]");
        }
        if self.http2.initial_window > crate::http2::frame::MAX_WINDOW {
            bail!("[http2] initial_window exceeds 2^31-1");
        }
        Ok(())
    }

    /// Candidate IPs from the inline list plus the optional list file (one per line, `#` comments).
    pub fn candidate_ips(&self) -> Result<Vec<IpAddr>> {
        let mut ips = Vec::new();
        for ip in &self.front.ips {
            ips.push(ip.parse().with_context(|| format!("invalid candidate IP: {ip}"))?);
        }
        if let Some(path) = &self.front.ip_list_path {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read IP list: {}", path.display()))?;
            for line in raw.lines() {
                let line = line.split('#').next().unwrap_or_default().trim();
                if line.is_empty() {
                    continue;
                }
                ips.push(line.parse().with_context(|| format!("invalid IP in list: {line}"))?);
            }
        }
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrontSection {
    /// Inline candidate IPs.
    #[serde(default)]
    pub ips: Vec<String>,
    /// File with more candidate IPs (relative paths resolve beside the config file).
    #[serde(default)]
    pub ip_list_path: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SNI values rotated across new connections.
    pub sni: Vec<String>,
    /// `:authority` / Host sent inside the tunnel.
    pub host: String,
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

impl FrontSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

fn default_port() -> u16 {
    443
}

fn default_alpn() -> Vec<String> {
    vec!["h2".into(), "http/1.1".into()]
}

fn default_connect_timeout_secs() -> u64 {
    4
}

fn default_handshake_timeout_secs() -> u64 {
    6
}

/// Pool sizing, scoring thresholds and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_min_idle_workers")]
    pub min_idle_workers: usize,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers", alias = "dispather_max_workers")]
    pub max_workers: usize,
    /// Best score above this (seconds) asks for a fresh connection.
    #[serde(default = "default_work_max_score", alias = "dispather_work_max_score")]
    pub work_max_score: f64,
    /// In-flight task cap.
    #[serde(default = "default_max_task_num")]
    pub max_task_num: usize,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Best worker used more recently than this triggers creation.
    #[serde(default = "default_min_reuse_interval_ms")]
    pub min_reuse_interval_ms: u64,
    #[serde(default = "default_get_worker_poll_ms")]
    pub get_worker_poll_ms: u64,
    /// Pool size above which the creator evicts the worst idle worker.
    #[serde(default = "default_max_idle_workers")]
    pub max_idle_workers: usize,
    /// Consecutive task failures that mark the front unhealthy.
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
    #[serde(default = "default_fail_cooldown_secs")]
    pub fail_cooldown_secs: u64,
    /// Weight applied by `get_score` for cross-front comparison.
    #[serde(default = "default_score_factor")]
    pub score_factor: f64,
    /// Extra wait past the task timeout before `request` gives up.
    #[serde(default = "default_request_grace_secs")]
    pub request_grace_secs: u64,
    #[serde(default = "default_true")]
    pub ping_on_create: bool,
    #[serde(default = "default_ping_path")]
    pub ping_path: String,
    #[serde(default)]
    pub show_state_debug: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            min_idle_workers: default_min_idle_workers(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            work_max_score: default_work_max_score(),
            max_task_num: default_max_task_num(),
            max_retry: default_max_retry(),
            min_reuse_interval_ms: default_min_reuse_interval_ms(),
            get_worker_poll_ms: default_get_worker_poll_ms(),
            max_idle_workers: default_max_idle_workers(),
            fail_threshold: default_fail_threshold(),
            fail_cooldown_secs: default_fail_cooldown_secs(),
            score_factor: default_score_factor(),
            request_grace_secs: default_request_grace_secs(),
            ping_on_create: true,
            ping_path: default_ping_path(),
            show_state_debug: false,
        }
    }
}

fn default_min_idle_workers() -> usize {
    2
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    20
}

fn default_work_max_score() -> f64 {
    1.0
}

fn default_max_task_num() -> usize {
    120
}

fn default_max_retry() -> u32 {
    3
}

fn default_min_reuse_interval_ms() -> u64 {
    0
}

fn default_get_worker_poll_ms() -> u64 {
    100
}

fn default_max_idle_workers() -> usize {
    10
}

fn default_fail_threshold() -> u32 {
    10
}

fn default_fail_cooldown_secs() -> u64 {
    60
}

fn default_score_factor() -> f64 {
    1.0
}

fn default_request_grace_secs() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_ping_path() -> String {
    "/".into()
}

/// Per-connection lifecycle and scoring constants.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_connection_ttl_secs")]
    pub connection_ttl_secs: u64,
    /// Fraction of the TTL randomly added so a pool does not expire all at once.
    #[serde(default = "default_ttl_jitter")]
    pub ttl_jitter: f64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_continue_fail")]
    pub max_continue_fail: u32,
    #[serde(default = "default_http1_max_process_tasks")]
    pub http1_max_process_tasks: u64,
    #[serde(default = "default_http2_max_process_tasks")]
    pub http2_max_process_tasks: u64,
    /// Score multiplier for a connection that never carried traffic.
    #[serde(default = "default_idle_unused_factor")]
    pub idle_unused_factor: f64,
    /// Added per concurrent HTTP/2 stream.
    #[serde(default = "default_stream_penalty_ms")]
    pub stream_penalty_ms: u64,
    #[serde(default = "default_hypothetical_request_bytes")]
    pub hypothetical_request_bytes: u64,
    /// Bytes/second assumed before the first sample.
    #[serde(default = "default_speed")]
    pub default_speed: f64,
    #[serde(default = "default_speed_sample_min_bytes")]
    pub speed_sample_min_bytes: u64,
    #[serde(default = "default_server_cost_header")]
    pub server_cost_header: String,
    /// Patience for response headers before a task is retried on another connection.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connection_ttl_secs: default_connection_ttl_secs(),
            ttl_jitter: default_ttl_jitter(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_continue_fail: default_max_continue_fail(),
            http1_max_process_tasks: default_http1_max_process_tasks(),
            http2_max_process_tasks: default_http2_max_process_tasks(),
            idle_unused_factor: default_idle_unused_factor(),
            stream_penalty_ms: default_stream_penalty_ms(),
            hypothetical_request_bytes: default_hypothetical_request_bytes(),
            default_speed: default_speed(),
            speed_sample_min_bytes: default_speed_sample_min_bytes(),
            server_cost_header: default_server_cost_header(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn stream_penalty(&self) -> f64 {
        self.stream_penalty_ms as f64 / 1000.0
    }
}

fn default_connection_ttl_secs() -> u64 {
    600
}

fn default_ttl_jitter() -> f64 {
    0.2
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_max_continue_fail() -> u32 {
    3
}

fn default_http1_max_process_tasks() -> u64 {
    100
}

fn default_http2_max_process_tasks() -> u64 {
    1_000
}

fn default_idle_unused_factor() -> f64 {
    0.5
}

fn default_stream_penalty_ms() -> u64 {
    60
}

fn default_hypothetical_request_bytes() -> u64 {
    16 * 1024
}

fn default_speed() -> f64 {
    200_000.0
}

fn default_speed_sample_min_bytes() -> u64 {
    64 * 1024
}

fn default_server_cost_header() -> String {
    "x-server-time".into()
}

fn default_attempt_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct Http2Config {
    /// Streams per connection above which another connection is wanted.
    #[serde(default = "default_target_concurrent")]
    pub target_concurrent: usize,
    /// Receive window advertised per stream and for the connection.
    #[serde(default = "default_initial_window")]
    pub initial_window: u32,
    #[serde(default = "default_window_update_fraction")]
    pub window_update_fraction: f64,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Idle time after which a PING is sent.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            target_concurrent: default_target_concurrent(),
            initial_window: default_initial_window(),
            window_update_fraction: default_window_update_fraction(),
            max_frame_size: default_max_frame_size(),
            check_interval_ms: default_check_interval_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
        }
    }
}

fn default_target_concurrent() -> usize {
    60
}

fn default_initial_window() -> u32 {
    crate::http2::frame::DEFAULT_WINDOW
}

fn default_window_update_fraction() -> f64 {
    0.5
}

fn default_max_frame_size() -> u32 {
    crate::http2::frame::DEFAULT_MAX_FRAME_SIZE as u32
}

fn default_check_interval_ms() -> u64 {
    1_000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_ping_timeout_secs() -> u64 {
    10
}

/// `[tls]` section; names resolve against the static cipher and group catalogs.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub ssl3: bool,
    #[serde(default)]
    pub tls10: bool,
    #[serde(default)]
    pub tls11: bool,
    #[serde(default = "default_true")]
    pub tls12: bool,
    #[serde(default = "default_true")]
    pub tls13: bool,
    /// IANA cipher names; empty means the built-in default list.
    #[serde(default)]
    pub ciphers: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "default_true")]
    pub extended_master_secret: bool,
    #[serde(default = "default_true")]
    pub encrypt_then_mac: bool,
    #[serde(default)]
    pub heartbeat: bool,
    #[serde(default)]
    pub record_size_limit: Option<u16>,
    #[serde(default = "default_min_dh_bits")]
    pub min_dh_bits: u64,
    /// Leaf certificates the client accepts.
    #[serde(default)]
    pub pins: Vec<CertificatePin>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            ssl3: false,
            tls10: false,
            tls11: false,
            tls12: true,
            tls13: true,
            ciphers: Vec::new(),
            groups: Vec::new(),
            extended_master_secret: true,
            encrypt_then_mac: true,
            heartbeat: false,
            record_size_limit: None,
            min_dh_bits: default_min_dh_bits(),
            pins: Vec::new(),
        }
    }
}

fn default_min_dh_bits() -> u64 {
    2048
}

/// One pinned leaf: SHA-256 of its DER plus the public key it carries.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificatePin {
    pub sha256: String,
    /// `ed25519`, `p256`, `p384` or `rsa`.
    pub key_type: String,
    /// Hex public key (SEC1 point, raw Ed25519 or DER RSAPublicKey).
    pub public_key: String,
}

impl TlsSettings {
    pub fn version_range(&self) -> Result<VersionRange> {
        let enabled: Vec<ProtocolVersion> = [
            (self.ssl3, ProtocolVersion::SSL3),
            (self.tls10, ProtocolVersion::TLS10),
            (self.tls11, ProtocolVersion::TLS11),
            (self.tls12, ProtocolVersion::TLS12),
            (self.tls13, ProtocolVersion::TLS13),
        ]
        .into_iter()
        .filter_map(|(on, version)| on.then_some(version))
        .collect();
        match (enabled.first(), enabled.last()) {
            (Some(min), Some(max)) => Ok(VersionRange { min: *min, max: *max }),
            _ => bail!("[tls] enables no protocol version"),
        }
    }

    pub fn verifier(&self) -> Result<PinnedVerifier> {
        let mut verifier = PinnedVerifier::new();
        for pin in &self.pins {
            let fingerprint: [u8; 32] = decode_hex(&pin.sha256)?
                .try_into()
                .map_err(|_| anyhow::anyhow!("pin sha256 must be 32 bytes: {}", pin.sha256))?;
            let key_type = match pin.key_type.to_ascii_lowercase().as_str() {
                "ed25519" => KeyType::Ed25519,
                "p256" | "secp256r1" => KeyType::Ecdsa(NamedGroup::Secp256r1),
                "p384" | "secp384r1" => KeyType::Ecdsa(NamedGroup::Secp384r1),
                "rsa" => KeyType::Rsa,
                other => bail!("unknown pinned key type: {other}"),
            };
            verifier = verifier.pin(fingerprint, RingPeerKey::new(key_type, decode_hex(&pin.public_key)?));
        }
        Ok(verifier)
    }

    /// Resolves names and builds the handshake configuration for outbound connections.
    pub fn client_config(&self, alpn: &[String], sessions: Arc<ClientSessionStore>) -> Result<ClientConfig> {
        let mut cfg = ClientConfig::new(Arc::new(self.verifier()?));
        cfg.versions = self.version_range()?;
        if !self.ciphers.is_empty() {
            cfg.cipher_suites = self
                .ciphers
                .iter()
                .map(|name| lookup_cipher(name).with_context(|| format!("unknown cipher: {name}")))
                .collect::<Result<_>>()?;
        }
        if !self.groups.is_empty() {
            cfg.groups = self
                .groups
                .iter()
                .map(|name| lookup_group(name).with_context(|| format!("unknown group: {name}")))
                .collect::<Result<_>>()?;
            cfg.key_share_groups = cfg.groups.iter().take(1).copied().collect();
        }
        cfg.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        cfg.extended_master_secret = self.extended_master_secret;
        cfg.encrypt_then_mac = self.encrypt_then_mac;
        cfg.heartbeat = self.heartbeat;
        cfg.record_size_limit = self.record_size_limit;
        cfg.min_dh_bits = self.min_dh_bits;
        cfg.sessions = Some(sessions);
        if cfg.offered_suites().is_empty() {
            bail!("[tls] no cipher suite is usable with the enabled versions");
        }
        Ok(cfg)
    }
}

fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    let clean: String = raw.chars().filter(|c| !matches!(c, ':' | ' ')).collect();
    if !clean.is_ascii() || clean.len() % 2 != 0 {
        bail!("malformed hex string: {raw}");
    }
    (0..clean.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&clean[i..i + 2], 16).with_context(|| format!("invalid hex: {raw}"))
        })
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Telemetry output: human-friendly stdout or structured JSON.
    #[serde(default)]
    pub mode: TelemetryMode,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Print structured, readable logs to stdout.
    #[default]
    Stdout,
    /// Emit JSON objects for ingestion systems.
    Json,
}
