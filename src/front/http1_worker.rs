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

//! HTTP/1.1 worker: one request in flight per connection.
//!
//! A driver task owns the connection and serializes tasks handed to it through a
//! channel. Responses are framed by `content-length`, chunked encoding or, failing
//! both, by the connection closing.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use bytes::{Bytes, BytesMut};
use http::Method;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    sync::{mpsc, watch},
    time::Instant,
};

use crate::{
    front::{
        connect::AsyncIo,
        task::Task,
        worker::{Worker, WorkerCore},
    },
    utils::{FrontError, FrontResult},
};

const MAX_HEADER_LINE: usize = 16 * 1024;
const MAX_HEADERS: usize = 128;
const READ_CHUNK: usize = 16 * 1024;

pub struct Http1Worker {
    core: WorkerCore,
    tx: mpsc::UnboundedSender<Arc<Task>>,
    busy: AtomicBool,
    current: Mutex<Option<Arc<Task>>>,
    pending_bytes: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
    framing: BodyFraming,
    keep_alive: bool,
}

impl Http1Worker {
    pub fn spawn(core: WorkerCore, io: Box<dyn AsyncIo>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Arc::new(Self {
            core,
            tx,
            busy: AtomicBool::new(false),
            current: Mutex::new(None),
            pending_bytes: AtomicU64::new(0),
            shutdown,
        });
        tokio::spawn(Arc::clone(&worker).drive(io, rx, shutdown_rx));
        worker
    }

    async fn drive(
        self: Arc<Self>,
        io: Box<dyn AsyncIo>,
        mut rx: mpsc::UnboundedReceiver<Arc<Task>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut conn = BufReader::new(io);
        loop {
            let task = tokio::select! {
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            let outcome = tokio::select! {
                outcome = self.process(&mut conn, &task) => outcome,
                _ = shutdown.changed() => Err(FrontError::WorkerClosed("shutdown".into())),
            };
            // Whoever takes the task out of `current` settles it.
            let owned = self.current.lock().take().is_some();
            self.pending_bytes.store(0, Ordering::Release);
            match outcome {
                Ok(true) => self.busy.store(false, Ordering::Release),
                Ok(false) => {
                    self.close("connection not reusable");
                    break;
                }
                Err(err) => {
                    if owned {
                        self.fail_task(&task);
                    }
                    self.close(&err.to_string());
                    break;
                }
            }
        }
        // Tasks queued behind a dying connection go back to the dispatcher.
        rx.close();
        while let Ok(task) = rx.try_recv() {
            self.hand_back(task, "worker closed");
        }
    }

    fn hand_back(&self, task: Arc<Task>, reason: &str) {
        match self.core.router() {
            Some(router) => router.retry_task(task, reason),
            None => {
                task.respond_failure(reason);
            }
        }
    }

    fn fail_task(&self, task: &Arc<Task>) {
        self.core.task_failed();
        if task.is_responsed() {
            task.finish();
        } else {
            self.hand_back(Arc::clone(task), "http/1.1 exchange failed");
        }
    }

    /// Runs one exchange; `Ok(true)` when the connection can carry another request.
    async fn process(&self, conn: &mut BufReader<Box<dyn AsyncIo>>, task: &Arc<Task>) -> FrontResult<bool> {
        let started = Instant::now();
        let predicted = self.core.score(0, task.body.len() as u64);
        let request = encode_request(task);
        conn.get_mut().write_all(&request).await?;
        conn.get_mut().flush().await?;
        self.pending_bytes.store(0, Ordering::Release);
        self.core.mark_send(Instant::now());
        task.set_state("h1 request sent");

        let header_deadline = task.deadline().min(started + self.core.config().attempt_timeout());
        let head = tokio::time::timeout_at(header_deadline, read_head(conn, &task.method))
            .await
            .map_err(|_| FrontError::Timeout("response headers"))??;
        let headers_at = Instant::now();
        self.core.mark_recv(headers_at);
        task.set_response(head.status, head.headers);

        let received = tokio::time::timeout_at(task.deadline(), read_body(conn, head.framing, task))
            .await
            .map_err(|_| {
                tracing::debug!(worker = self.core.id, task = %task.id, "body read hit task deadline");
                FrontError::Timeout("response body")
            })??;
        task.finish();
        let now = Instant::now();
        self.core.mark_recv(now);
        self.core.update_rtt(headers_at.saturating_duration_since(started), Some(predicted));
        let transfer = now.saturating_duration_since(started).as_secs_f64();
        if received >= self.core.config().speed_sample_min_bytes && transfer > 0.0 {
            self.core.update_speed(received as f64 / transfer);
        }
        self.core.task_succeeded();
        Ok(head.keep_alive && head.framing != BodyFraming::UntilClose)
    }
}

impl Worker for Http1Worker {
    fn core(&self) -> &WorkerCore {
        &self.core
    }

    fn request(&self, task: Arc<Task>) -> bool {
        if !self.core.is_accepting() || self.busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        task.assign_worker(self.core.id);
        self.pending_bytes.store(task.body.len() as u64, Ordering::Release);
        *self.current.lock() = Some(Arc::clone(&task));
        if self.tx.send(task).is_err() {
            self.current.lock().take();
            self.busy.store(false, Ordering::Release);
            return false;
        }
        true
    }

    fn inflight(&self) -> usize {
        usize::from(self.busy.load(Ordering::Acquire))
    }

    fn inflight_bytes(&self) -> u64 {
        self.pending_bytes.load(Ordering::Acquire)
    }

    fn accepting(&self) -> bool {
        self.core.is_accepting() && !self.busy.load(Ordering::Acquire)
    }

    fn close(&self, reason: &str) {
        if !self.core.begin_close(reason) {
            return;
        }
        let _ = self.shutdown.send(true);
        let current = self.current.lock().take();
        if let Some(task) = current {
            if task.is_responsed() {
                task.finish();
            } else {
                self.hand_back(task, reason);
            }
        }
    }
}

/// Hop-by-hop request headers the worker manages itself.
const MANAGED_HEADERS: &[&str] = &["host", "connection", "content-length", "transfer-encoding", "keep-alive"];

pub(crate) fn encode_request(task: &Task) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + task.body.len());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", task.method, task.path).as_bytes());
    out.extend_from_slice(format!("Host: {}\r\n", task.host).as_bytes());
    for (name, value) in &task.headers {
        if MANAGED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !task.body.is_empty() || matches!(task.method, Method::POST | Method::PUT | Method::PATCH) {
        out.extend_from_slice(format!("Content-Length: {}\r\n", task.body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: keep-alive\r\n\r\n");
    out.extend_from_slice(&task.body);
    out
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> FrontResult<String> {
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(MAX_HEADER_LINE as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Err(FrontError::Http1("connection closed mid-response".into()));
    }
    if line.last() != Some(&b'\n') {
        return Err(FrontError::Http1("header line too long".into()));
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| FrontError::Http1("non-UTF-8 header line".into()))
}

async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R, method: &Method) -> FrontResult<ResponseHead> {
    loop {
        let status_line = read_line(reader).await?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(FrontError::Http1(format!("bad status line: {status_line}")));
        }
        let status: u16 = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| FrontError::Http1(format!("bad status line: {status_line}")))?;

        let mut headers = Vec::new();
        loop {
            let line = read_line(reader).await?;
            if line.is_empty() {
                break;
            }
            if headers.len() >= MAX_HEADERS {
                return Err(FrontError::Http1("too many response headers".into()));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrontError::Http1(format!("malformed header: {line}")))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
        if (100..200).contains(&status) {
            continue;
        }

        let header = |name: &str| headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
        let keep_alive = match header("connection") {
            Some(v) => !v.eq_ignore_ascii_case("close"),
            None => version == "HTTP/1.1",
        };
        let framing = if *method == Method::HEAD || status == 204 || status == 304 {
            BodyFraming::Empty
        } else if header("transfer-encoding").is_some_and(|v| v.to_ascii_lowercase().contains("chunked")) {
            BodyFraming::Chunked
        } else if let Some(len) = header("content-length") {
            BodyFraming::Length(
                len.parse()
                    .map_err(|_| FrontError::Http1(format!("bad content-length: {len}")))?,
            )
        } else {
            BodyFraming::UntilClose
        };
        return Ok(ResponseHead {
            status,
            headers,
            framing,
            keep_alive,
        });
    }
}

/// Streams the body into the task; returns the byte count.
async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R, framing: BodyFraming, task: &Task) -> FrontResult<u64> {
    match framing {
        BodyFraming::Empty => Ok(0),
        BodyFraming::Length(len) => read_exact_into(reader, len, task).await,
        BodyFraming::UntilClose => {
            let mut total = 0u64;
            loop {
                let mut buf = BytesMut::with_capacity(READ_CHUNK);
                if reader.read_buf(&mut buf).await? == 0 {
                    return Ok(total);
                }
                total += buf.len() as u64;
                task.put_data(buf.freeze());
            }
        }
        BodyFraming::Chunked => {
            let mut total = 0u64;
            loop {
                let line = read_line(reader).await?;
                let size = line.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(size, 16)
                    .map_err(|_| FrontError::Http1(format!("bad chunk size: {line}")))?;
                if size == 0 {
                    // Trailers end with an empty line.
                    while !read_line(reader).await?.is_empty() {}
                    return Ok(total);
                }
                total += read_exact_into(reader, size, task).await?;
                if !read_line(reader).await?.is_empty() {
                    return Err(FrontError::Http1("chunk not followed by CRLF".into()));
                }
            }
        }
    }
}

async fn read_exact_into<R: AsyncBufRead + Unpin>(reader: &mut R, len: u64, task: &Task) -> FrontResult<u64> {
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(READ_CHUNK as u64) as usize;
        let mut buf = vec![0u8; want];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(FrontError::Http1(format!("body truncated with {remaining} bytes missing")));
        }
        buf.truncate(n);
        task.put_data(Bytes::from(buf));
        remaining -= n as u64;
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task(method: Method, body: &'static [u8]) -> Task {
        Task::new(
            method,
            "front.example",
            "/q?x=1",
            vec![("Accept".into(), "*/*".into()), ("Connection".into(), "close".into())],
            Bytes::from_static(body),
            Duration::from_secs(5),
        )
        .0
    }

    #[test]
    fn request_carries_host_and_length() {
        let raw = encode_request(&task(Method::POST, b"abc"));
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("POST /q?x=1 HTTP/1.1\r\nHost: front.example\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(!text.contains("close"));
        assert!(text.ends_with("Content-Length: 3\r\nConnection: keep-alive\r\n\r\nabc"));
    }

    #[tokio::test]
    async fn chunked_response_is_reassembled() {
        let raw: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut reader = BufReader::new(raw);
        let head = read_head(&mut reader, &Method::GET).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.framing, BodyFraming::Chunked);
        assert!(head.keep_alive);

        let (task, rx) = Task::new(Method::GET, "h", "/", Vec::new(), Bytes::new(), Duration::from_secs(5));
        task.set_response(head.status, head.headers);
        assert_eq!(read_body(&mut reader, head.framing, &task).await.unwrap(), 9);
        task.finish();
        assert_eq!(&rx.await.unwrap().read_all().await[..], b"Wikipedia");
    }

    #[tokio::test]
    async fn framing_follows_headers() {
        let mut reader = BufReader::new(&b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nok"[..]);
        let head = read_head(&mut reader, &Method::GET).await.unwrap();
        assert_eq!(head.framing, BodyFraming::Length(2));
        assert!(!head.keep_alive);

        let mut reader = BufReader::new(&b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n"[..]);
        let head = read_head(&mut reader, &Method::HEAD).await.unwrap();
        assert_eq!(head.framing, BodyFraming::Empty);

        let mut reader = BufReader::new(&b"HTTP/1.1 200 OK\r\n\r\nrest"[..]);
        let head = read_head(&mut reader, &Method::GET).await.unwrap();
        assert_eq!(head.framing, BodyFraming::UntilClose);

        let mut reader = BufReader::new(&b"SSH-2.0\r\n\r\n"[..]);
        assert!(read_head(&mut reader, &Method::GET).await.is_err());
    }
}
