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

//! Pool of secured connections and the entry point for requests.
//!
//! **Loops** (spawned by [`Dispatcher::new`], stopped when the dispatcher is dropped):
//! - *assignment*: takes queued tasks in FIFO order and hands each to the best worker.
//! - *creator*: waits for a creation trigger, dials a new connection and wraps it in
//!   the worker variant matching the negotiated protocol.
//! - *checker*: periodic keepalive and stream-timeout sweep over HTTP/2 workers; also
//!   closes drained workers that reached end of life.
//!
//! Callers only ever see `Option<Response>`; transport failures become retries or a
//! synthetic failure response.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch, Notify},
    time::Instant,
};
use uuid::Uuid;

use crate::{
    config::{FrontConfig, WorkerConfig},
    front::{
        connect::{ConnectionManager, IpManager, SecuredConnection},
        http1_worker::Http1Worker,
        http2_worker::Http2Worker,
        task::{Response, Task},
        worker::{TaskRouter, Worker, WorkerCore, WorkerSpec},
    },
    http2::StreamSettings,
    telemetry::{FrontEvent, TelemetrySink},
};

/// Point-in-time counters, serializable for the probe binary and telemetry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub workers: usize,
    pub http2_workers: usize,
    pub idle_workers: usize,
    pub creating: usize,
    pub inflight_tasks: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub continue_fail: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: u64,
    pub ip: String,
    pub sni: String,
    pub http2: bool,
    pub accepting: bool,
    pub inflight: usize,
    pub processed: u64,
    pub rtt_ms: f64,
    pub score: f64,
}

#[derive(Default)]
struct Health {
    succeeded: u64,
    failed: u64,
    retried: u64,
    continue_fail: u32,
    last_fail: Option<Instant>,
}

struct DispatcherInner {
    id: Uuid,
    config: Arc<FrontConfig>,
    worker_config: Arc<WorkerConfig>,
    stream_settings: Arc<StreamSettings>,
    connection_manager: Arc<dyn ConnectionManager>,
    ip_manager: Arc<dyn IpManager>,
    telemetry: TelemetrySink,
    workers: Mutex<Vec<Arc<dyn Worker>>>,
    queue: mpsc::UnboundedSender<Arc<Task>>,
    create_trigger: Notify,
    creating: AtomicUsize,
    next_worker_id: AtomicU64,
    inflight_tasks: AtomicUsize,
    health: Mutex<Health>,
    shutdown: watch::Sender<bool>,
    this: Weak<DispatcherInner>,
}

pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

/// Releases an in-flight slot when the caller is done waiting.
struct InflightSlot<'a>(&'a AtomicUsize);

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Dispatcher {
    /// Builds the pool and spawns its background loops; requires a tokio runtime.
    pub fn new(
        config: Arc<FrontConfig>,
        connection_manager: Arc<dyn ConnectionManager>,
        ip_manager: Arc<dyn IpManager>,
        telemetry: TelemetrySink,
    ) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker_config = Arc::new(config.worker.clone());
        let stream_settings = Arc::new(StreamSettings {
            recv_window: config.http2.initial_window,
            window_update_fraction: config.http2.window_update_fraction,
            attempt_timeout: worker_config.attempt_timeout(),
            speed_sample_min_bytes: worker_config.speed_sample_min_bytes,
            server_cost_header: worker_config.server_cost_header.to_ascii_lowercase(),
        });
        let inner = Arc::new_cyclic(|this| DispatcherInner {
            id: Uuid::new_v4(),
            config,
            worker_config,
            stream_settings,
            connection_manager,
            ip_manager,
            telemetry,
            workers: Mutex::new(Vec::new()),
            queue,
            create_trigger: Notify::new(),
            creating: AtomicUsize::new(0),
            next_worker_id: AtomicU64::new(1),
            inflight_tasks: AtomicUsize::new(0),
            health: Mutex::new(Health::default()),
            shutdown,
            this: this.clone(),
        });

        tokio::spawn(Arc::clone(&inner).assignment_loop(queue_rx, shutdown_rx.clone()));
        tokio::spawn(Arc::clone(&inner).creator_loop(shutdown_rx.clone()));
        tokio::spawn(Arc::clone(&inner).checker_loop(shutdown_rx));
        tracing::info!(dispatcher = %inner.id, host = %inner.config.front.host, "dispatcher started");
        Self { inner }
    }

    /// Performs one request on the best pooled connection.
    ///
    /// Returns `None` when the in-flight cap is reached, or when no response head
    /// (real or synthetic failure) arrived within `timeout` plus the grace period.
    pub async fn request(
        &self,
        method: Method,
        host: &str,
        path: &str,
        headers: Vec<(String, String)>,
        body: Bytes,
        timeout: Duration,
    ) -> Option<Response> {
        let inner = &self.inner;
        if !inner.admit().await {
            tracing::warn!(
                dispatcher = %inner.id,
                inflight = inner.inflight_tasks.load(Ordering::Acquire),
                "in-flight task cap reached"
            );
            return None;
        }
        let _slot = InflightSlot(&inner.inflight_tasks);

        let (task, mut response_rx) = Task::new(method, host, path, headers, body, timeout);
        let task = Arc::new(task.with_trace_logging(inner.config.dispatcher.show_state_debug));
        task.set_state("queued");
        if inner.queue.send(Arc::clone(&task)).is_err() {
            task.respond_failure("dispatcher stopped");
            return None;
        }

        let grace = Duration::from_secs(inner.config.dispatcher.request_grace_secs);
        let response = match tokio::time::timeout(timeout + grace, &mut response_rx).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => None,
            Err(_) => {
                task.respond_failure("no response before deadline");
                response_rx.try_recv().ok()
            }
        };
        if let Some(response) = &response {
            inner.telemetry.emit(
                inner.id,
                FrontEvent::TaskFinished {
                    task: task.id,
                    path: task.path.clone(),
                    status: response.status,
                    worker: response.worker,
                    retries: task.retry_count(),
                    elapsed_ms: task.created_at.elapsed().as_millis() as u64,
                    failure: response.failure_reason().map(str::to_owned),
                },
            );
        }
        response
    }

    /// Best worker right now. With `nowait` unset, polls until `deadline`.
    pub async fn get_worker(&self, nowait: bool, deadline: Instant) -> Option<Arc<dyn Worker>> {
        self.inner.get_worker(nowait, deadline).await
    }

    /// Wraps an already secured connection into a pooled worker.
    pub fn add_worker(&self, conn: SecuredConnection) -> Arc<dyn Worker> {
        self.inner.add_worker(conn)
    }

    /// Starts up to `count` connection attempts, bounded by the worker cap.
    pub fn connect_all(&self, count: usize) {
        for _ in 0..count {
            if !self.inner.reserve_creation() {
                break;
            }
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.connect_process().await;
                inner.creating.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }

    /// Front-level score for cross-front selection; `None` while this front is unhealthy.
    pub fn get_score(&self) -> Option<f64> {
        self.inner.get_score()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.inner.stats()
    }

    pub fn workers(&self) -> Vec<WorkerSummary> {
        self.inner
            .snapshot()
            .iter()
            .map(|worker| {
                let core = worker.core();
                WorkerSummary {
                    id: core.id,
                    ip: core.ip.to_string(),
                    sni: core.sni.clone(),
                    http2: core.http2,
                    accepting: worker.accepting(),
                    inflight: worker.inflight(),
                    processed: core.processed_tasks(),
                    rtt_ms: core.rtt() * 1000.0,
                    score: worker.get_score(),
                }
            })
            .collect()
    }

    /// Stops the loops and closes every worker.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        for worker in self.inner.snapshot() {
            worker.close("dispatcher shutdown");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.inner.shutdown.send(true);
    }
}

impl DispatcherInner {
    fn snapshot(&self) -> Vec<Arc<dyn Worker>> {
        self.workers.lock().clone()
    }

    fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    async fn admit(&self) -> bool {
        let max = self.config.dispatcher.max_task_num;
        for attempt in 0..2 {
            if self.inflight_tasks.fetch_add(1, Ordering::AcqRel) < max {
                return true;
            }
            self.inflight_tasks.fetch_sub(1, Ordering::AcqRel);
            if attempt == 0 {
                tokio::time::sleep(self.poll_interval()).await;
            }
        }
        false
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.dispatcher.get_worker_poll_ms.max(1))
    }

    async fn assignment_loop(
        self: Arc<Self>,
        mut queue: mpsc::UnboundedReceiver<Arc<Task>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let task = tokio::select! {
                next = queue.recv() => match next {
                    Some(task) => task,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            self.assign(task).await;
        }
        while let Ok(task) = queue.try_recv() {
            task.respond_failure("dispatcher stopped");
        }
        tracing::debug!(dispatcher = %self.id, "assignment loop stopped");
    }

    async fn assign(&self, task: Arc<Task>) {
        loop {
            if task.is_responsed() || task.is_finished() {
                return;
            }
            let deadline = task.deadline();
            if task.is_expired(Instant::now()) {
                task.respond_failure("deadline passed while queued");
                return;
            }
            let Some(worker) = self.get_worker(false, deadline).await else {
                task.respond_failure("no worker available");
                return;
            };
            task.set_state(format!("assigned to worker {}", worker.core().id));
            if worker.request(Arc::clone(&task)) {
                return;
            }
            task.set_state(format!("worker {} refused", worker.core().id));
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    async fn get_worker(&self, nowait: bool, deadline: Instant) -> Option<Arc<dyn Worker>> {
        loop {
            let now = Instant::now();
            if let Some((_, worker)) = self.scan(now) {
                worker.core().mark_assigned(now);
                return Some(worker);
            }
            if nowait || now >= deadline {
                return None;
            }
            let wait = self.poll_interval().min(deadline.saturating_duration_since(now));
            tokio::time::sleep(wait).await;
        }
    }

    /// Picks the best accepting worker and decides whether the pool should grow.
    fn scan(&self, now: Instant) -> Option<(f64, Arc<dyn Worker>)> {
        let cfg = &self.config.dispatcher;
        let mut best: Option<(f64, Arc<dyn Worker>)> = None;
        let mut live = 0;
        let mut idle = 0;
        for worker in self.snapshot() {
            if let Some(reason) = worker.is_life_end() {
                if worker.inflight() == 0 {
                    worker.close(&reason);
                }
                continue;
            }
            live += 1;
            if !worker.accepting() {
                continue;
            }
            if worker.inflight() == 0 {
                idle += 1;
            }
            let score = worker.get_score();
            if best.as_ref().map_or(true, |(current, _)| score < *current) {
                best = Some((score, worker));
            }
        }

        let grow = match &best {
            None => Some("no accepting worker"),
            Some(_) if idle < cfg.min_idle_workers => Some("idle workers below minimum"),
            Some(_) if live < cfg.min_workers => Some("workers below minimum"),
            Some((_, worker))
                if worker.core().last_assigned().is_some_and(|at| {
                    now.saturating_duration_since(at) < Duration::from_millis(cfg.min_reuse_interval_ms)
                }) =>
            {
                Some("best worker reused too recently")
            }
            Some((score, _)) if *score > cfg.work_max_score => Some("best score above ceiling"),
            Some((_, worker)) if worker.is_http2() && worker.inflight() >= self.config.http2.target_concurrent => {
                Some("best worker saturated")
            }
            Some(_) => None,
        };
        if let Some(reason) = grow {
            self.trigger_creation(reason, live);
        }
        best
    }

    fn trigger_creation(&self, reason: &str, live: usize) {
        let creating = self.creating.load(Ordering::Acquire);
        if live + creating >= self.config.dispatcher.max_workers {
            tracing::trace!(dispatcher = %self.id, live, creating, reason, "pool at worker cap");
            return;
        }
        tracing::debug!(dispatcher = %self.id, live, creating, reason, "requesting new connection");
        self.create_trigger.notify_one();
    }

    /// Claims a creation slot if the pool has room for another worker.
    fn reserve_creation(&self) -> bool {
        let max = self.config.dispatcher.max_workers;
        let creating = self.creating.fetch_add(1, Ordering::AcqRel);
        if self.worker_count() + creating >= max {
            self.creating.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    async fn creator_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.create_trigger.notified() => {}
                _ = shutdown.changed() => break,
            }
            if !self.reserve_creation() {
                continue;
            }
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                inner.connect_process().await;
                inner.creating.fetch_sub(1, Ordering::AcqRel);
            });
        }
        tracing::debug!(dispatcher = %self.id, "creator loop stopped");
    }

    async fn connect_process(&self) -> Option<Arc<dyn Worker>> {
        let front = &self.config.front;
        let budget = front.connect_timeout() + front.handshake_timeout();
        match self.connection_manager.get_ssl_connection(budget).await {
            Ok(conn) => Some(self.add_worker(conn)),
            Err(err) => {
                tracing::debug!(dispatcher = %self.id, error = %err, "connection attempt failed");
                None
            }
        }
    }

    fn add_worker(&self, conn: SecuredConnection) -> Arc<dyn Worker> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let router: Weak<dyn TaskRouter> = self.this.clone();
        let core = WorkerCore::new(
            WorkerSpec {
                id,
                ip: conn.ip,
                sni: conn.sni.clone(),
                http2: conn.http2,
                handshake_time: conn.handshake_time,
            },
            Arc::clone(&self.worker_config),
            Arc::clone(&self.ip_manager),
            router,
        );
        let worker: Arc<dyn Worker> = if conn.http2 {
            Http2Worker::spawn(
                core,
                conn.io,
                self.config.http2.clone(),
                Arc::clone(&self.stream_settings),
            )
        } else {
            Http1Worker::spawn(core, conn.io)
        };
        self.workers.lock().push(Arc::clone(&worker));
        tracing::info!(
            dispatcher = %self.id,
            worker = id,
            ip = %conn.ip,
            sni = %conn.sni,
            http2 = conn.http2,
            handshake_ms = conn.handshake_time.as_millis() as u64,
            "worker created"
        );
        self.telemetry.emit(
            self.id,
            FrontEvent::WorkerCreated {
                worker: id,
                ip: conn.ip.to_string(),
                sni: conn.sni.clone(),
                http2: conn.http2,
                handshake_ms: conn.handshake_time.as_millis() as u64,
            },
        );

        if self.config.dispatcher.ping_on_create {
            self.ping(&worker);
        }
        self.evict_idle();
        worker
    }

    /// Seeds RTT and speed with a synthetic request on a fresh worker.
    fn ping(&self, worker: &Arc<dyn Worker>) {
        let (task, response_rx) = Task::new(
            Method::GET,
            self.config.front.host.clone(),
            self.config.dispatcher.ping_path.clone(),
            Vec::new(),
            Bytes::new(),
            self.worker_config.attempt_timeout(),
        );
        let task = Arc::new(task.as_probe());
        task.set_state("probe");
        if !worker.request(task) {
            return;
        }
        let worker_id = worker.core().id;
        tokio::spawn(async move {
            if let Ok(mut response) = response_rx.await {
                let body = response.read_all().await;
                tracing::debug!(worker = worker_id, status = response.status, bytes = body.len(), "probe finished");
            }
        });
    }

    /// Closes the worst-scoring idle worker when too many sit idle.
    fn evict_idle(&self) {
        let idle: Vec<Arc<dyn Worker>> = self
            .snapshot()
            .into_iter()
            .filter(|worker| worker.accepting() && worker.inflight() == 0)
            .collect();
        if idle.len() <= self.config.dispatcher.max_idle_workers {
            return;
        }
        let worst = idle
            .into_iter()
            .map(|worker| (worker.get_score(), worker))
            .max_by(|a, b| a.0.total_cmp(&b.0));
        if let Some((score, worker)) = worst {
            tracing::debug!(dispatcher = %self.id, worker = worker.core().id, score, "evicting idle worker");
            worker.close("too many idle workers");
        }
    }

    async fn checker_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.http2.check_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            for worker in self.snapshot() {
                if worker.is_http2() {
                    worker.check_active();
                }
                if worker.inflight() == 0 {
                    if let Some(reason) = worker.is_life_end() {
                        worker.close(&reason);
                    }
                }
            }
        }
        tracing::debug!(dispatcher = %self.id, "checker loop stopped");
    }

    fn get_score(&self) -> Option<f64> {
        let cfg = &self.config.dispatcher;
        if self.inflight_tasks.load(Ordering::Acquire) >= cfg.max_task_num {
            return None;
        }
        let now = Instant::now();
        {
            let health = self.health.lock();
            let cooling = health
                .last_fail
                .is_some_and(|at| now.saturating_duration_since(at) < Duration::from_secs(cfg.fail_cooldown_secs));
            if health.continue_fail >= cfg.fail_threshold && cooling {
                return None;
            }
        }
        let score = self.scan(now).map_or(cfg.work_max_score, |(score, _)| score);
        Some(score * cfg.score_factor)
    }

    fn stats(&self) -> DispatcherStats {
        let workers = self.snapshot();
        let health = self.health.lock();
        DispatcherStats {
            workers: workers.len(),
            http2_workers: workers.iter().filter(|w| w.is_http2()).count(),
            idle_workers: workers.iter().filter(|w| w.accepting() && w.inflight() == 0).count(),
            creating: self.creating.load(Ordering::Acquire),
            inflight_tasks: self.inflight_tasks.load(Ordering::Acquire),
            succeeded: health.succeeded,
            failed: health.failed,
            retried: health.retried,
            continue_fail: health.continue_fail,
        }
    }
}

impl TaskRouter for DispatcherInner {
    fn retry_task(&self, task: Arc<Task>, reason: &str) {
        if task.is_responsed() {
            task.finish();
            return;
        }
        if task.is_probe() {
            task.respond_failure(reason);
            return;
        }
        let retries = task.increment_retry();
        if retries > self.config.dispatcher.max_retry {
            task.respond_failure(&format!("retries exhausted: {reason}"));
            return;
        }
        if task.is_expired(Instant::now()) {
            task.respond_failure(&format!("deadline passed: {reason}"));
            return;
        }
        self.health.lock().retried += 1;
        task.set_state(format!("retry {retries}: {reason}"));
        tracing::debug!(dispatcher = %self.id, task = %task.id, retries, %reason, "re-queueing task");
        self.telemetry.emit(
            self.id,
            FrontEvent::TaskRetry {
                task: task.id,
                retries,
                reason: reason.to_owned(),
            },
        );
        if let Err(mpsc::error::SendError(task)) = self.queue.send(task) {
            task.respond_failure("dispatcher stopped");
        }
    }

    fn worker_closed(&self, worker_id: u64, reason: &str) {
        self.workers.lock().retain(|worker| worker.core().id != worker_id);
        self.telemetry.emit(
            self.id,
            FrontEvent::WorkerClosed {
                worker: worker_id,
                reason: reason.to_owned(),
            },
        );
    }

    fn task_result(&self, success: bool) {
        let mut health = self.health.lock();
        if success {
            health.succeeded += 1;
            health.continue_fail = 0;
        } else {
            health.failed += 1;
            health.continue_fail += 1;
            health.last_fail = Some(Instant::now());
        }
    }
}
