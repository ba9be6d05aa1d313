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

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::Method;

use crate::{
    config::FrontConfig,
    front::{Dispatcher, StaticIpManager, TlsConnectionManager},
    telemetry::TelemetrySink,
    tls::ClientSessionStore,
};

/// Wires configuration, the TLS client, the candidate fleet and the dispatcher.
///
/// Construction order: telemetry first so later steps can log, then the client TLS
/// configuration (fails fast on unknown cipher or group names), then the collaborators
/// and finally the dispatcher, which spawns its loops immediately.
pub struct FrontApp {
    config: Arc<FrontConfig>,
    dispatcher: Dispatcher,
    ips: Arc<StaticIpManager>,
}

/// Outcome of one probe request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeResult {
    pub status: u16,
    pub bytes: usize,
    pub worker: Option<u64>,
    pub elapsed_ms: u64,
    pub failure: Option<String>,
}

impl FrontApp {
    /// Must be called inside a tokio runtime.
    pub fn new(config: FrontConfig) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = TelemetrySink::new(config.telemetry.clone());

        let sessions = Arc::new(ClientSessionStore::new());
        let tls = config
            .tls
            .client_config(&config.front.alpn, sessions)
            .context("building TLS client configuration")?;

        let ips = Arc::new(StaticIpManager::new(config.candidate_ips()?));
        let connector = Arc::new(TlsConnectionManager::new(
            config.front.clone(),
            Arc::new(tls),
            Arc::clone(&ips),
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&config), connector, ips.clone(), telemetry);
        tracing::info!(
            host = %config.front.host,
            candidates = ips.candidates().len(),
            max_workers = config.dispatcher.max_workers,
            "front initialised"
        );
        Ok(Self { config, dispatcher, ips })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn ips(&self) -> &StaticIpManager {
        &self.ips
    }

    /// Issues `count` sequential GET requests for `path` and collects what came back.
    pub async fn run_probe(&self, path: &str, count: usize) -> Vec<ProbeResult> {
        self.dispatcher.connect_all(self.config.dispatcher.min_workers);
        let timeout = self.config.worker.attempt_timeout() + self.config.front.handshake_timeout();
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            results.push(self.probe_once(path, timeout).await);
        }
        results
    }

    async fn probe_once(&self, path: &str, timeout: Duration) -> ProbeResult {
        let started = tokio::time::Instant::now();
        let response = self
            .dispatcher
            .request(
                Method::GET,
                &self.config.front.host,
                path,
                Vec::new(),
                Bytes::new(),
                timeout,
            )
            .await;
        match response {
            Some(mut response) => {
                let body = response.read_all().await;
                ProbeResult {
                    status: response.status,
                    bytes: body.len(),
                    worker: response.worker,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    failure: response.failure_reason().map(str::to_string),
                }
            }
            None => ProbeResult {
                status: 0,
                bytes: 0,
                worker: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
                failure: Some("front unavailable".to_string()),
            },
        }
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
