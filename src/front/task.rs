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

//! One application request travelling through the dispatcher.
//!
//! A [`Task`] is shared between the caller, the dispatcher queue and whichever worker
//! currently carries it. The caller holds the receiving ends: a oneshot for the response
//! head and, inside [`Response`], an unbounded channel for body chunks.
//!
//! **State flags:** `responsed` and `finished` each flip false→true once. A task that
//! finishes without a response first gets a synthetic failure response, so `finished`
//! never precedes `responsed`.

use std::{
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use http::Method;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use uuid::Uuid;

/// Status carried by synthetic failure responses.
pub const FAILURE_STATUS: u16 = 600;

pub struct Task {
    pub id: Uuid,
    pub method: Method,
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Duration,
    pub created_at: Instant,
    deadline: Instant,
    retry_count: AtomicU32,
    responsed: AtomicBool,
    finished: AtomicBool,
    trace: Mutex<Vec<(Duration, String)>>,
    worker: Mutex<Option<u64>>,
    response_tx: Mutex<Option<oneshot::Sender<Response>>>,
    body_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    body_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    log_trace: bool,
    probe: bool,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("host", &self.host)
            .field("path", &self.path)
            .field("retry_count", &self.retry_count())
            .field("responsed", &self.is_responsed())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Task {
    /// Creates a task and the receiver its response head will arrive on.
    pub fn new(
        method: Method,
        host: impl Into<String>,
        path: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Bytes,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<Response>) {
        let (response_tx, response_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let created_at = Instant::now();
        let task = Self {
            id: Uuid::now_v7(),
            method,
            host: host.into(),
            path: path.into(),
            headers,
            body,
            timeout,
            created_at,
            deadline: created_at + timeout,
            retry_count: AtomicU32::new(0),
            responsed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            trace: Mutex::new(Vec::new()),
            worker: Mutex::new(None),
            response_tx: Mutex::new(Some(response_tx)),
            body_tx: Mutex::new(Some(body_tx)),
            body_rx: Mutex::new(Some(body_rx)),
            log_trace: false,
            probe: false,
        };
        (task, response_rx)
    }

    /// Logs the full state trace when the task finishes.
    pub fn with_trace_logging(mut self, enabled: bool) -> Self {
        self.log_trace = enabled;
        self
    }

    /// Marks a synthetic measurement request; probes are never re-queued.
    pub fn as_probe(mut self) -> Self {
        self.probe = true;
        self
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    /// Bumps the retry counter and returns the new value.
    pub fn increment_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_responsed(&self) -> bool {
        self.responsed.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_state(&self, event: impl Into<String>) {
        let event = event.into();
        tracing::trace!(task = %self.id, %event, "task state");
        self.trace.lock().push((self.created_at.elapsed(), event));
    }

    pub fn trace(&self) -> Vec<(Duration, String)> {
        self.trace.lock().clone()
    }

    pub fn assign_worker(&self, worker_id: u64) {
        *self.worker.lock() = Some(worker_id);
        self.set_state(format!("assigned to worker {worker_id}"));
    }

    pub fn worker(&self) -> Option<u64> {
        *self.worker.lock()
    }

    /// Delivers the response head; only the first call wins.
    pub fn set_response(&self, status: u16, headers: Vec<(String, String)>) -> bool {
        self.deliver(status, headers, None)
    }

    fn deliver(&self, status: u16, headers: Vec<(String, String)>, failure: Option<String>) -> bool {
        if self.responsed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let body = self
            .body_rx
            .lock()
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        let response = Response {
            task_id: self.id,
            status,
            headers,
            failure,
            worker: self.worker(),
            deadline: self.deadline,
            body,
        };
        self.set_state(format!("responded {status}"));
        if let Some(tx) = self.response_tx.lock().take() {
            // The caller may have given up already.
            let _ = tx.send(response);
        }
        true
    }

    /// Appends a body chunk unless the task already finished.
    pub fn put_data(&self, data: Bytes) -> bool {
        if self.is_finished() || data.is_empty() {
            return false;
        }
        match self.body_tx.lock().as_ref() {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Ends the body stream; a task without a response gets a failure response first.
    pub fn finish(&self) -> bool {
        if !self.is_responsed() {
            self.deliver(FAILURE_STATUS, Vec::new(), Some("finished without response".into()));
        }
        if self.finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.body_tx.lock().take();
        self.set_state("finished");
        if self.log_trace {
            tracing::debug!(task = %self.id, trace = ?self.trace(), "task trace");
        }
        true
    }

    /// Resolves the task as failed: a synthetic response if none was sent, then finish.
    pub fn respond_failure(&self, reason: &str) -> bool {
        let delivered = self.deliver(FAILURE_STATUS, Vec::new(), Some(reason.to_string()));
        if delivered {
            tracing::debug!(task = %self.id, reason, retries = self.retry_count(), "task failed");
        }
        self.finish();
        delivered
    }
}

/// Response head plus a streaming body reader.
#[derive(Debug)]
pub struct Response {
    pub task_id: Uuid,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub worker: Option<u64>,
    failure: Option<String>,
    deadline: Instant,
    body: mpsc::UnboundedReceiver<Bytes>,
}

impl Response {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Next body chunk; `None` at end of body or once the task deadline passes.
    pub async fn read(&mut self) -> Option<Bytes> {
        tokio::time::timeout_at(self.deadline, self.body.recv())
            .await
            .ok()
            .flatten()
    }

    /// Whole body (whatever arrived before the deadline).
    pub async fn read_all(&mut self) -> Bytes {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.read().await {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> (Task, oneshot::Receiver<Response>) {
        Task::new(
            Method::GET,
            "example.com",
            "/",
            Vec::new(),
            Bytes::new(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn response_and_finish_flip_once() {
        let (task, rx) = task();
        assert!(task.set_response(200, vec![("content-length".into(), "3".into())]));
        assert!(!task.set_response(500, Vec::new()));
        assert!(task.put_data(Bytes::from_static(b"abc")));
        assert!(task.finish());
        assert!(!task.finish());
        assert!(!task.put_data(Bytes::from_static(b"late")));

        let mut response = rx.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_length(), Some(3));
        assert_eq!(&response.read_all().await[..], b"abc");
    }

    #[tokio::test]
    async fn finishing_without_response_yields_failure() {
        let (task, rx) = task();
        assert!(task.respond_failure("timeout"));
        assert!(task.is_responsed() && task.is_finished());
        let response = rx.await.unwrap();
        assert!(response.is_failure());
        assert_eq!(response.failure_reason(), Some("timeout"));
        assert_eq!(response.status, FAILURE_STATUS);
    }

    #[test]
    fn retries_are_counted() {
        let (task, _rx) = task();
        assert_eq!(task.increment_retry(), 1);
        assert_eq!(task.increment_retry(), 2);
        assert_eq!(task.retry_count(), 2);
    }
}
