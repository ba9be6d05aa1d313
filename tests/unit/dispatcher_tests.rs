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

use bytes::Bytes;
use front_transport::{
    front::{Dispatcher, StaticIpManager, Task},
    telemetry::TelemetrySink,
};
use http::Method;
use tokio::time::Instant;

use crate::support::{config_with, front_ip, H2Log, MockConnector, ServerKind};

fn dispatcher(connector: Arc<MockConnector>, extra: &str) -> Dispatcher {
    let config = Arc::new(config_with(extra));
    let ips = Arc::new(StaticIpManager::new(vec![front_ip()]));
    Dispatcher::new(config, connector, ips, TelemetrySink::new(Default::default()))
}

fn silent_h2() -> Arc<MockConnector> {
    MockConnector::new(ServerKind::Silent, true)
}

/// Lets spawned loops run without moving the paused clock far.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn lower_handshake_latency_wins() {
    let connector = silent_h2();
    let dispatcher = dispatcher(
        Arc::clone(&connector),
        "[dispatcher]\nping_on_create = false\nmin_idle_workers = 0\nwork_max_score = 100.0\n",
    );
    let slow = dispatcher.add_worker(connector.secured(Duration::from_millis(200)));
    let fast = dispatcher.add_worker(connector.secured(Duration::from_millis(50)));
    assert!(fast.get_score() < slow.get_score());

    for _ in 0..3 {
        let chosen = dispatcher
            .get_worker(true, Instant::now())
            .await
            .expect("a worker is available");
        assert_eq!(chosen.core().id, fast.core().id);
    }
}

#[tokio::test(start_paused = true)]
async fn saturated_http2_worker_triggers_creation() {
    let connector = silent_h2();
    let dispatcher = dispatcher(
        Arc::clone(&connector),
        "[dispatcher]\nping_on_create = false\nmin_idle_workers = 0\nwork_max_score = 100.0\n\n[http2]\ntarget_concurrent = 2\n",
    );
    let worker = dispatcher.add_worker(connector.secured(Duration::from_millis(50)));

    let chosen = dispatcher.get_worker(true, Instant::now()).await.expect("worker");
    assert_eq!(chosen.core().id, worker.core().id);
    settle().await;
    assert_eq!(connector.connects(), 0, "unsaturated pool must not grow");

    let mut receivers = Vec::new();
    for _ in 0..2 {
        let (task, rx) = Task::new(
            Method::GET,
            "origin.test",
            "/slow",
            Vec::new(),
            Bytes::new(),
            Duration::from_secs(30),
        );
        assert!(worker.request(Arc::new(task)));
        receivers.push(rx);
    }
    assert_eq!(worker.inflight(), 2);

    let chosen = dispatcher.get_worker(true, Instant::now()).await.expect("worker");
    assert_eq!(chosen.core().id, worker.core().id);
    settle().await;
    assert_eq!(connector.connects(), 1);
    assert_eq!(dispatcher.stats().workers, 2);
}

#[tokio::test(start_paused = true)]
async fn full_pool_degrades_instead_of_blocking() {
    let connector = silent_h2();
    let dispatcher = dispatcher(
        Arc::clone(&connector),
        "[dispatcher]\nping_on_create = false\nmin_idle_workers = 0\ndispather_max_workers = 5\ndispather_work_max_score = 0.000001\n",
    );
    for i in 0..5 {
        dispatcher.add_worker(connector.secured(Duration::from_millis(40 + i * 10)));
    }

    let chosen = dispatcher.get_worker(false, Instant::now() + Duration::from_secs(1)).await;
    let chosen = chosen.expect("best worker is returned even above the score ceiling");
    assert_eq!(chosen.core().handshake_time, Duration::from_millis(40));
    settle().await;
    assert_eq!(connector.connects(), 0);
    assert_eq!(dispatcher.stats().workers, 5);
}

#[tokio::test(start_paused = true)]
async fn unanswered_task_times_out_with_retries() {
    let connector = silent_h2();
    let dispatcher = dispatcher(
        Arc::clone(&connector),
        "[dispatcher]\nping_on_create = false\nmin_idle_workers = 0\n\n[worker]\nattempt_timeout_secs = 2\n",
    );

    let started = Instant::now();
    let response = dispatcher
        .request(Method::GET, "origin.test", "/never", Vec::new(), Bytes::new(), Duration::from_secs(5))
        .await
        .expect("a synthetic failure response");
    let elapsed = started.elapsed();

    assert!(response.is_failure());
    assert!(response.failure_reason().is_some());
    assert!(elapsed >= Duration::from_secs(5), "resolved too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(6), "resolved too late: {elapsed:?}");
    assert!(dispatcher.stats().retried >= 1);
}

#[tokio::test(start_paused = true)]
async fn http1_connection_serves_requests() {
    let connector = MockConnector::new(ServerKind::Http1 { body: "hello" }, false);
    let dispatcher = dispatcher(Arc::clone(&connector), "[dispatcher]\nping_on_create = false\nmin_idle_workers = 0\n");

    for _ in 0..2 {
        let mut response = dispatcher
            .request(Method::GET, "origin.test", "/", Vec::new(), Bytes::new(), Duration::from_secs(5))
            .await
            .expect("response");
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(&response.read_all().await[..], b"hello");
    }
    assert_eq!(connector.connects(), 1);
    let workers = dispatcher.workers();
    assert_eq!(workers.len(), 1);
    assert!(!workers[0].http2);
}

#[tokio::test(start_paused = true)]
async fn front_score_reflects_pool_health() {
    let log = Arc::new(H2Log::default());
    let connector = MockConnector::new(ServerKind::H2 { body_len: 1, log }, true);
    let dispatcher = dispatcher(
        Arc::clone(&connector),
        "[dispatcher]\nping_on_create = false\nmin_idle_workers = 0\nscore_factor = 2.0\nwork_max_score = 3.0\n",
    );

    // An empty pool reports the ceiling and starts a connection.
    assert_eq!(dispatcher.get_score(), Some(6.0));
    settle().await;
    assert_eq!(connector.connects(), 1);

    let score = dispatcher.get_score().expect("healthy front");
    let raw = dispatcher.workers()[0].score;
    assert!((score - raw * 2.0).abs() < 1e-9);
}
