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
    front::{Dispatcher, StaticIpManager},
    http2::frame::DEFAULT_WINDOW,
    telemetry::TelemetrySink,
};
use http::Method;

use crate::support::{config_with, front_ip, H2Log, MockConnector, ServerKind};

const QUIET_POOL: &str = "[dispatcher]\nping_on_create = false\nmin_idle_workers = 0\n";

fn dispatcher(connector: Arc<MockConnector>, extra: &str) -> Dispatcher {
    let config = Arc::new(config_with(extra));
    let ips = Arc::new(StaticIpManager::new(vec![front_ip()]));
    Dispatcher::new(config, connector, ips, TelemetrySink::new(Default::default()))
}

#[tokio::test(start_paused = true)]
async fn large_response_drives_window_updates() {
    let log = Arc::new(H2Log::default());
    let body_len = 2 * DEFAULT_WINDOW as usize;
    let connector = MockConnector::new(
        ServerKind::H2 {
            body_len,
            log: Arc::clone(&log),
        },
        true,
    );
    let dispatcher = dispatcher(Arc::clone(&connector), QUIET_POOL);

    let mut response = dispatcher
        .request(Method::GET, "origin.test", "/x", Vec::new(), Bytes::new(), Duration::from_secs(5))
        .await
        .expect("response");
    assert_eq!(response.status, 200);
    assert!(!response.is_failure());
    assert_eq!(response.content_length(), Some(body_len));

    let body = response.read_all().await;
    assert_eq!(body.len(), body_len);
    assert!(log.stream_window_updates() >= 1, "server saw no stream WINDOW_UPDATE");
    assert!(
        log.window_updates.lock().iter().any(|(id, _)| *id == 0),
        "server saw no connection WINDOW_UPDATE"
    );
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn request_headers_are_normalised() {
    let log = Arc::new(H2Log::default());
    let connector = MockConnector::new(
        ServerKind::H2 {
            body_len: 3,
            log: Arc::clone(&log),
        },
        true,
    );
    let dispatcher = dispatcher(connector, QUIET_POOL);

    let headers = vec![
        ("Connection".to_string(), "keep-alive".to_string()),
        ("X-Trace".to_string(), "abc".to_string()),
        ("Content-Length".to_string(), "999".to_string()),
    ];
    let mut response = dispatcher
        .request(
            Method::POST,
            "origin.test",
            "/submit",
            headers,
            Bytes::from_static(b"hello"),
            Duration::from_secs(5),
        )
        .await
        .expect("response");
    assert_eq!(response.read_all().await.len(), 3);

    let requests = log.requests.lock();
    let sent = requests.first().expect("one request");
    let names: Vec<&str> = sent.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(&names[..4], &[":method", ":scheme", ":authority", ":path"]);
    assert!(sent.contains(&(":method".to_string(), "POST".to_string())));
    assert!(sent.contains(&(":authority".to_string(), "origin.test".to_string())));
    assert!(sent.contains(&("x-trace".to_string(), "abc".to_string())));
    assert!(sent.contains(&("content-length".to_string(), "5".to_string())));
    assert!(!names.contains(&"connection"));
    assert_eq!(names.iter().filter(|n| **n == "content-length").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn goaway_moves_unanswered_task_to_a_new_connection() {
    let log = Arc::new(H2Log::default());
    let connector = MockConnector::new(
        ServerKind::H2 {
            body_len: 4,
            log: Arc::clone(&log),
        },
        true,
    );
    connector.then(ServerKind::H2GoAway);
    let dispatcher = dispatcher(Arc::clone(&connector), QUIET_POOL);

    let mut response = dispatcher
        .request(Method::GET, "origin.test", "/", Vec::new(), Bytes::new(), Duration::from_secs(5))
        .await
        .expect("response");
    assert_eq!(response.status, 200);
    assert_eq!(response.read_all().await.len(), 4);
    assert_eq!(connector.connects(), 2);
    assert!(dispatcher.stats().retried >= 1);
}
