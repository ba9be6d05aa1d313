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

//! Capability set shared by the HTTP/1.1 and HTTP/2 connection workers.
//!
//! A worker owns one secured connection. The dispatcher only talks to it through
//! [`Worker`]; the bookkeeping both variants need (lifecycle flags, TTL, RTT history,
//! scoring inputs) lives in [`WorkerCore`].
//!
//! **Score (seconds, lower is better):**
//! `rtt × idle_unused_factor? + (inflight_bytes + hypothetical_bytes) / speed
//!  + stream_penalty × streams + mean(adjust)`.

use std::{
    collections::VecDeque,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

use crate::{
    config::WorkerConfig,
    front::{connect::IpManager, task::Task},
};

/// Rolling window size for RTT and prediction-error samples.
pub const RTT_HISTORY: usize = 10;

/// Callbacks from workers back into the dispatcher.
pub trait TaskRouter: Send + Sync {
    /// A task lost its connection before a response; re-queue or fail it.
    fn retry_task(&self, task: Arc<Task>, reason: &str);

    /// Removal callback; invoked once per worker.
    fn worker_closed(&self, worker_id: u64, reason: &str);

    /// Outcome of one task attempt, for front-wide health tracking.
    fn task_result(&self, success: bool);
}

pub trait Worker: Send + Sync {
    fn core(&self) -> &WorkerCore;

    /// Admits a task. `false` means the task was not taken and must be routed elsewhere.
    fn request(&self, task: Arc<Task>) -> bool;

    /// Tasks (HTTP/1.1) or streams (HTTP/2) currently in flight.
    fn inflight(&self) -> usize;

    /// Request body bytes not yet written.
    fn inflight_bytes(&self) -> u64;

    fn close(&self, reason: &str);

    /// Keepalive and timeout sweep; only HTTP/2 has anything to do.
    fn check_active(&self) {}

    fn is_http2(&self) -> bool {
        self.core().http2
    }

    fn accepting(&self) -> bool {
        self.core().is_accepting()
    }

    fn get_score(&self) -> f64 {
        self.core().score(self.inflight(), self.inflight_bytes())
    }

    fn is_life_end(&self) -> Option<String> {
        self.core().life_end(self.inflight(), Instant::now())
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    processed_tasks: u64,
    continue_fail_tasks: u32,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
    last_assigned: Option<Instant>,
    rtts: VecDeque<f64>,
    adjusts: VecDeque<f64>,
}

/// Shared state of one pooled connection.
pub struct WorkerCore {
    pub id: u64,
    pub ip: IpAddr,
    pub sni: String,
    pub http2: bool,
    pub handshake_time: Duration,
    pub created_at: Instant,
    config: Arc<WorkerConfig>,
    expires_at: Instant,
    max_process_tasks: u64,
    accept_task: AtomicBool,
    closed: AtomicBool,
    life_end: Mutex<Option<String>>,
    stats: Mutex<WorkerStats>,
    ip_manager: Arc<dyn IpManager>,
    router: Weak<dyn TaskRouter>,
}

impl std::fmt::Debug for WorkerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCore")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("sni", &self.sni)
            .field("http2", &self.http2)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub struct WorkerSpec {
    pub id: u64,
    pub ip: IpAddr,
    pub sni: String,
    pub http2: bool,
    pub handshake_time: Duration,
}

impl WorkerCore {
    pub fn new(
        spec: WorkerSpec,
        config: Arc<WorkerConfig>,
        ip_manager: Arc<dyn IpManager>,
        router: Weak<dyn TaskRouter>,
    ) -> Self {
        let created_at = Instant::now();
        let ttl = config.connection_ttl_secs as f64;
        let jitter = if config.ttl_jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=config.ttl_jitter)
        } else {
            0.0
        };
        let max_process_tasks = if spec.http2 {
            config.http2_max_process_tasks
        } else {
            config.http1_max_process_tasks
        };
        Self {
            id: spec.id,
            ip: spec.ip,
            sni: spec.sni,
            http2: spec.http2,
            handshake_time: spec.handshake_time,
            created_at,
            expires_at: created_at + Duration::from_secs_f64(ttl * (1.0 + jitter)),
            max_process_tasks,
            config,
            accept_task: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            life_end: Mutex::new(None),
            stats: Mutex::new(WorkerStats::default()),
            ip_manager,
            router,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn router(&self) -> Option<Arc<dyn TaskRouter>> {
        self.router.upgrade()
    }

    pub fn is_accepting(&self) -> bool {
        self.accept_task.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn stop_accepting(&self) {
        self.accept_task.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_send(&self, now: Instant) {
        self.stats.lock().last_send = Some(now);
    }

    pub fn mark_recv(&self, now: Instant) {
        self.stats.lock().last_recv = Some(now);
    }

    pub fn mark_assigned(&self, now: Instant) {
        self.stats.lock().last_assigned = Some(now);
    }

    pub fn last_assigned(&self) -> Option<Instant> {
        self.stats.lock().last_assigned
    }

    pub fn processed_tasks(&self) -> u64 {
        self.stats.lock().processed_tasks
    }

    pub fn continue_fail_tasks(&self) -> u32 {
        self.stats.lock().continue_fail_tasks
    }

    /// Adds an RTT sample and, with a prediction, a prediction-error sample.
    pub fn update_rtt(&self, sample: Duration, predicted: Option<f64>) {
        let sample = sample.as_secs_f64();
        let mut stats = self.stats.lock();
        stats.rtts.push_back(sample);
        if stats.rtts.len() > RTT_HISTORY {
            stats.rtts.pop_front();
        }
        if let Some(predicted) = predicted {
            stats.adjusts.push_back(sample - predicted);
            if stats.adjusts.len() > RTT_HISTORY {
                stats.adjusts.pop_front();
            }
        }
    }

    pub fn update_speed(&self, bytes_per_sec: f64) {
        self.ip_manager.update_speed(self.ip, bytes_per_sec);
    }

    pub fn rtt(&self) -> f64 {
        let stats = self.stats.lock();
        mean(&stats.rtts).unwrap_or_else(|| self.handshake_time.as_secs_f64())
    }

    pub fn task_succeeded(&self) {
        {
            let mut stats = self.stats.lock();
            stats.processed_tasks += 1;
            stats.continue_fail_tasks = 0;
        }
        if let Some(router) = self.router() {
            router.task_result(true);
        }
    }

    pub fn task_failed(&self) {
        self.stats.lock().continue_fail_tasks += 1;
        if let Some(router) = self.router() {
            router.task_result(false);
        }
    }

    pub fn score(&self, streams: usize, inflight_bytes: u64) -> f64 {
        let stats = self.stats.lock();
        let mut rtt = mean(&stats.rtts).unwrap_or_else(|| self.handshake_time.as_secs_f64());
        if stats.processed_tasks == 0 && stats.last_send.is_none() {
            rtt *= self.config.idle_unused_factor;
        }
        let adjust = mean(&stats.adjusts).unwrap_or(0.0);
        drop(stats);

        let speed = Some(self.ip_manager.get_speed(self.ip))
            .filter(|s| *s > 0.0)
            .unwrap_or(self.config.default_speed)
            .max(1.0);
        let drain = (inflight_bytes + self.config.hypothetical_request_bytes) as f64 / speed;
        let penalty = if self.http2 {
            streams as f64 * self.config.stream_penalty()
        } else {
            0.0
        };
        rtt + drain + penalty + adjust
    }

    /// Lifecycle check; once a reason is found it sticks.
    pub fn life_end(&self, inflight: usize, now: Instant) -> Option<String> {
        let mut latched = self.life_end.lock();
        if let Some(reason) = latched.as_ref() {
            return Some(reason.clone());
        }
        let stats = self.stats.lock();
        let last_active = [stats.last_send, stats.last_recv]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created_at);
        let reason = if now >= self.expires_at {
            Some("ttl expired".to_string())
        } else if inflight == 0 && now.saturating_duration_since(last_active) >= self.config.idle_timeout() {
            Some("idle timeout".to_string())
        } else if stats.continue_fail_tasks >= self.config.max_continue_fail {
            Some(format!("{} consecutive failures", stats.continue_fail_tasks))
        } else if stats.processed_tasks >= self.max_process_tasks {
            Some(format!("processed {} tasks", stats.processed_tasks))
        } else {
            None
        };
        drop(stats);
        if let Some(reason) = &reason {
            tracing::debug!(worker = self.id, ip = %self.ip, %reason, "worker reached end of life");
            self.stop_accepting();
            *latched = Some(reason.clone());
        }
        reason
    }

    /// First caller wins: stops admission, reports the closure and removes the worker.
    pub fn begin_close(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop_accepting();
        tracing::info!(
            worker = self.id,
            ip = %self.ip,
            sni = %self.sni,
            http2 = self.http2,
            processed = self.processed_tasks(),
            %reason,
            "closing worker"
        );
        self.ip_manager.report_connect_closed(self.ip, &self.sni, reason);
        if let Some(router) = self.router() {
            router.worker_closed(self.id, reason);
        }
        true
    }
}

fn mean(values: &VecDeque<f64>) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::front::connect::StaticIpManager;

    struct NoRouter;

    impl TaskRouter for NoRouter {
        fn retry_task(&self, task: Arc<Task>, reason: &str) {
            task.respond_failure(reason);
        }

        fn worker_closed(&self, _worker_id: u64, _reason: &str) {}

        fn task_result(&self, _success: bool) {}
    }

    pub(crate) fn core(id: u64, http2: bool, handshake_ms: u64, config: WorkerConfig) -> WorkerCore {
        let ips = Arc::new(StaticIpManager::new(vec!["192.0.2.1".parse().unwrap()]));
        WorkerCore::new(
            WorkerSpec {
                id,
                ip: "192.0.2.1".parse().unwrap(),
                sni: "front.test".into(),
                http2,
                handshake_time: Duration::from_millis(handshake_ms),
            },
            Arc::new(config),
            ips,
            Weak::<NoRouter>::new(),
        )
    }

    #[test]
    fn rtt_history_is_bounded() {
        let core = core(1, true, 100, WorkerConfig::default());
        for i in 0..25 {
            core.update_rtt(Duration::from_millis(i), Some(0.0));
        }
        let stats = core.stats.lock();
        assert_eq!(stats.rtts.len(), RTT_HISTORY);
        assert_eq!(stats.adjusts.len(), RTT_HISTORY);
        assert!((stats.rtts[0] - 0.015).abs() < 1e-9);
    }

    #[test]
    fn unused_connection_gets_a_discount() {
        let core = core(1, false, 200, WorkerConfig::default());
        let fresh = core.score(0, 0);
        core.mark_send(Instant::now());
        let used = core.score(0, 0);
        assert!(fresh < used);
        assert!((used - fresh - 0.1).abs() < 1e-9);
    }

    #[test]
    fn streams_and_bytes_raise_the_score() {
        let core = core(1, true, 100, WorkerConfig::default());
        core.mark_send(Instant::now());
        let base = core.score(0, 0);
        assert!((core.score(2, 0) - base - 0.12).abs() < 1e-9);
        assert!(core.score(0, 200_000) > base + 0.99);
    }

    #[test]
    fn life_end_latches() {
        let config = WorkerConfig {
            max_continue_fail: 2,
            ..WorkerConfig::default()
        };
        let core = core(1, true, 100, config);
        let now = Instant::now();
        assert_eq!(core.life_end(0, now), None);
        core.task_failed();
        core.task_failed();
        assert!(core.life_end(0, now).is_some());
        core.task_succeeded();
        assert!(core.life_end(0, now).is_some());
        assert!(!core.is_accepting());
    }

    #[test]
    fn close_runs_once() {
        let core = core(1, true, 100, WorkerConfig::default());
        assert!(core.begin_close("test"));
        assert!(!core.begin_close("again"));
        assert!(core.is_closed());
    }
}
