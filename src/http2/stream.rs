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

//! Per-stream HTTP/2 state machine.
//!
//! A [`Stream`] owns no I/O. The owning worker lends it the connection's shared pieces
//! through [`StreamCtx`] (HPACK tables, the connection send window, an outbound frame
//! queue and an event sink) while holding its connection lock, then writes the queued
//! frames and applies the events afterwards.
//!
//! **Lifecycle:** `idle → open → half-closed-(local|remote) → closed`. A forced close
//! may jump straight from `open` to `closed`. Push promises are never acted upon.

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

use crate::{
    front::task::Task,
    http2::{
        flow_control::{FlowControlWindow, SendWindow},
        frame::{error_code, header_frames, Frame},
    },
    utils::{FrontError, FrontResult},
};

/// Request headers that have no meaning on an HTTP/2 connection.
const CONNECTION_HEADERS: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Tunables every stream on a connection shares.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub recv_window: u32,
    pub window_update_fraction: f64,
    /// Per-attempt patience before a stream without response headers is retried elsewhere.
    pub attempt_timeout: Duration,
    pub speed_sample_min_bytes: u64,
    /// Response header carrying the server's own processing time in milliseconds.
    pub server_cost_header: String,
}

/// What a stream asks its worker to do once the connection lock is released.
#[derive(Debug)]
pub enum StreamEvent {
    /// Response headers arrived.
    Responded { stream_id: u32 },
    /// Response completed; feeds the worker's RTT and speed estimators.
    Completed {
        stream_id: u32,
        rtt: Duration,
        predicted: Option<f64>,
        speed: Option<f64>,
    },
    /// Counts toward the worker's consecutive-failure threshold.
    Failed { stream_id: u32 },
    /// Task never got a response here; hand it back to the dispatcher.
    Retry { task: Arc<Task>, reason: String },
    /// Stream released; remove it from the connection.
    Closed { stream_id: u32 },
}

pub struct StreamCtx<'a> {
    pub encoder: &'a mut hpack::Encoder<'static>,
    pub decoder: &'a mut hpack::Decoder<'static>,
    pub conn_send: &'a mut SendWindow,
    pub max_frame_size: usize,
    pub out: &'a mut Vec<Frame>,
    pub events: &'a mut Vec<StreamEvent>,
    pub now: Instant,
}

pub struct Stream {
    pub id: u32,
    task: Arc<Task>,
    settings: Arc<StreamSettings>,
    state: StreamState,
    history: Vec<StreamState>,
    send_window: SendWindow,
    recv_window: FlowControlWindow,
    body_sent: usize,
    header_block: BytesMut,
    awaiting_continuation: bool,
    block_ends_stream: bool,
    headers_received: bool,
    started_at: Instant,
    headers_at: Option<Instant>,
    received_bytes: u64,
    server_cost: Option<Duration>,
    predicted: Option<f64>,
    released: bool,
}

impl Stream {
    pub fn new(
        id: u32,
        task: Arc<Task>,
        settings: Arc<StreamSettings>,
        peer_initial_window: u32,
        predicted: Option<f64>,
        now: Instant,
    ) -> Self {
        let recv_window = FlowControlWindow::new(settings.recv_window, settings.window_update_fraction);
        Self {
            id,
            task,
            settings,
            state: StreamState::Idle,
            history: vec![StreamState::Idle],
            send_window: SendWindow::new(peer_initial_window),
            recv_window,
            body_sent: 0,
            header_block: BytesMut::new(),
            awaiting_continuation: false,
            block_ends_stream: false,
            headers_received: false,
            started_at: now,
            headers_at: None,
            received_bytes: 0,
            server_cost: None,
            predicted,
            released: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[StreamState] {
        &self.history
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Request body bytes still waiting for send credit.
    pub fn pending_body(&self) -> usize {
        self.task.body.len().saturating_sub(self.body_sent)
    }

    pub fn send_window_mut(&mut self) -> &mut SendWindow {
        &mut self.send_window
    }

    fn transition(&mut self, next: StreamState) {
        if self.state != next {
            tracing::trace!(stream_id = self.id, from = ?self.state, to = ?next, "stream state");
            self.state = next;
            self.history.push(next);
        }
    }

    fn local_end(&mut self) {
        match self.state {
            StreamState::Open => self.transition(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => self.transition(StreamState::Closed),
            _ => {}
        }
    }

    /// Sends HEADERS for the task and as much of the body as credit allows.
    pub fn start_request(&mut self, ctx: &mut StreamCtx<'_>) -> FrontResult<()> {
        let task = Arc::clone(&self.task);
        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = vec![
            (b":method".to_vec(), task.method.as_str().as_bytes().to_vec()),
            (b":scheme".to_vec(), b"https".to_vec()),
            (b":authority".to_vec(), task.host.as_bytes().to_vec()),
            (b":path".to_vec(), task.path.as_bytes().to_vec()),
        ];
        for (name, value) in &task.headers {
            let name = name.to_ascii_lowercase();
            if CONNECTION_HEADERS.contains(&name.as_str()) || name == "content-length" {
                continue;
            }
            fields.push((name.into_bytes(), value.as_bytes().to_vec()));
        }
        if !task.body.is_empty() {
            fields.push((b"content-length".to_vec(), task.body.len().to_string().into_bytes()));
        }
        let block = ctx
            .encoder
            .encode(fields.iter().map(|(k, v)| (k.as_slice(), v.as_slice())));

        let end_stream = task.body.is_empty();
        ctx.out
            .extend(header_frames(self.id, Bytes::from(block), end_stream, ctx.max_frame_size));
        self.transition(StreamState::Open);
        task.set_state(format!("h2 stream {} headers sent", self.id));
        if end_stream {
            self.local_end();
            return Ok(());
        }
        self.send_body(ctx)
    }

    /// Emits DATA frames bounded by stream credit, connection credit and frame size.
    pub fn send_body(&mut self, ctx: &mut StreamCtx<'_>) -> FrontResult<()> {
        if !matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote) {
            return Ok(());
        }
        let body = self.task.body.clone();
        while self.body_sent < body.len() {
            let remaining = body.len() - self.body_sent;
            let credit = self.send_window.available().min(ctx.conn_send.available());
            let n = credit.min(remaining).min(ctx.max_frame_size);
            if n == 0 {
                tracing::trace!(stream_id = self.id, remaining, "body send blocked on window");
                return Ok(());
            }
            self.send_window.consume(n)?;
            ctx.conn_send.consume(n)?;
            let chunk = body.slice(self.body_sent..self.body_sent + n);
            self.body_sent += n;
            let end_stream = self.body_sent == body.len();
            ctx.out.push(Frame::Data {
                stream_id: self.id,
                data: chunk,
                end_stream,
                flow_len: n,
            });
        }
        self.local_end();
        self.task.set_state(format!("h2 stream {} body sent", self.id));
        Ok(())
    }

    /// Handles one frame addressed to this stream.
    ///
    /// An `Err` is fatal to the whole connection.
    pub fn receive_frame(&mut self, frame: Frame, ctx: &mut StreamCtx<'_>) -> FrontResult<()> {
        if self.state == StreamState::Closed {
            tracing::trace!(stream_id = self.id, kind = ?frame.kind(), "frame on closed stream");
            return Ok(());
        }
        match frame {
            Frame::WindowUpdate { increment, .. } => {
                self.send_window.increase(increment)?;
                self.send_body(ctx)?;
            }
            Frame::Headers {
                block,
                end_stream,
                end_headers,
                ..
            } => {
                if self.awaiting_continuation {
                    return Err(FrontError::Http2(format!(
                        "HEADERS on stream {} while a header block is open",
                        self.id
                    )));
                }
                self.header_block.extend_from_slice(&block);
                self.block_ends_stream = end_stream;
                if end_headers {
                    self.headers_complete(ctx)?;
                } else {
                    self.awaiting_continuation = true;
                }
            }
            Frame::Continuation { block, end_headers, .. } => {
                if !self.awaiting_continuation {
                    return Err(FrontError::Http2(format!(
                        "unexpected CONTINUATION on stream {}",
                        self.id
                    )));
                }
                self.header_block.extend_from_slice(&block);
                if end_headers {
                    self.awaiting_continuation = false;
                    self.headers_complete(ctx)?;
                }
            }
            Frame::Data {
                data,
                end_stream,
                flow_len,
                ..
            } => {
                if !self.headers_received || self.awaiting_continuation {
                    return Err(FrontError::Http2(format!("DATA before headers on stream {}", self.id)));
                }
                if self.recv_window.would_overrun(flow_len) {
                    return Err(FrontError::FlowControl(format!(
                        "stream {} received {flow_len} bytes with {} bytes of window",
                        self.id,
                        self.recv_window.available()
                    )));
                }
                self.received_bytes += data.len() as u64;
                if !self.task.is_finished() {
                    self.task.put_data(data);
                }
                if end_stream {
                    self.remote_end(ctx);
                } else {
                    let increment = self.recv_window.on_bytes_received(flow_len);
                    if increment > 0 {
                        ctx.out.push(Frame::WindowUpdate {
                            stream_id: self.id,
                            increment,
                        });
                    }
                }
            }
            Frame::Blocked { .. } => {
                let increment = self.recv_window.on_blocked();
                if increment > 0 {
                    ctx.out.push(Frame::WindowUpdate {
                        stream_id: self.id,
                        increment,
                    });
                }
            }
            Frame::RstStream { error_code, .. } => {
                tracing::warn!(stream_id = self.id, error_code, "stream reset by peer");
                return Err(FrontError::Http2(format!(
                    "stream {} reset by peer with code {error_code}",
                    self.id
                )));
            }
            Frame::PushPromise { promised_id, .. } => {
                tracing::error!(stream_id = self.id, promised_id, "push promise received with push disabled");
            }
            other => {
                tracing::debug!(stream_id = self.id, kind = ?other.kind(), "ignoring frame");
            }
        }
        Ok(())
    }

    fn headers_complete(&mut self, ctx: &mut StreamCtx<'_>) -> FrontResult<()> {
        let block = self.header_block.split().freeze();
        let fields = ctx
            .decoder
            .decode(&block)
            .map_err(|err| FrontError::Http2(format!("header block decode failed: {err:?}")))?;

        if !self.headers_received {
            let mut status = None;
            let mut headers = Vec::with_capacity(fields.len());
            for (name, value) in fields {
                let name = String::from_utf8_lossy(&name).into_owned();
                let value = String::from_utf8_lossy(&value).into_owned();
                if name == ":status" {
                    status = value.parse::<u16>().ok();
                } else if !name.starts_with(':') {
                    headers.push((name, value));
                }
            }
            let status = status
                .ok_or_else(|| FrontError::Http2(format!("response on stream {} lacks :status", self.id)))?;
            if (100..200).contains(&status) {
                tracing::trace!(stream_id = self.id, status, "interim response");
                return Ok(());
            }

            self.server_cost = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&self.settings.server_cost_header))
                .and_then(|(_, v)| v.trim().parse::<f64>().ok())
                .filter(|ms| ms.is_finite() && *ms >= 0.0)
                .map(|ms| Duration::from_secs_f64(ms / 1000.0));
            self.headers_received = true;
            self.headers_at = Some(ctx.now);
            if let StreamState::Idle = self.state {
                self.transition(StreamState::Open);
            }
            self.task.set_response(status, headers);
            ctx.events.push(StreamEvent::Responded { stream_id: self.id });
        }

        if self.block_ends_stream {
            self.remote_end(ctx);
        }
        Ok(())
    }

    fn remote_end(&mut self, ctx: &mut StreamCtx<'_>) {
        match self.state {
            StreamState::Open => self.transition(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => self.transition(StreamState::Closed),
            _ => {}
        }

        let headers_at = self.headers_at.unwrap_or(ctx.now);
        let cost = self.server_cost.unwrap_or_default();
        let rtt = headers_at.saturating_duration_since(self.started_at).saturating_sub(cost);
        let speed = self.server_cost.and_then(|cost| {
            if self.received_bytes < self.settings.speed_sample_min_bytes {
                return None;
            }
            let transfer = ctx.now.saturating_duration_since(self.started_at).saturating_sub(cost);
            let secs = transfer.as_secs_f64();
            (secs > 0.0).then(|| self.received_bytes as f64 / secs)
        });
        ctx.events.push(StreamEvent::Completed {
            stream_id: self.id,
            rtt,
            predicted: self.predicted,
            speed,
        });
        self.task.finish();

        if self.state != StreamState::Closed {
            // Response is complete while the request body is still going out.
            ctx.out.push(Frame::RstStream {
                stream_id: self.id,
                error_code: error_code::CANCEL,
            });
        }
        self.release(ctx);
    }

    fn release(&mut self, ctx: &mut StreamCtx<'_>) {
        if self.released {
            return;
        }
        self.released = true;
        self.transition(StreamState::Closed);
        ctx.events.push(StreamEvent::Closed { stream_id: self.id });
    }

    /// Sweeps the task deadline and the per-attempt timeout; returns whether the stream closed.
    pub fn check_timeout(&mut self, ctx: &mut StreamCtx<'_>) -> bool {
        if self.released || matches!(self.state, StreamState::HalfClosedRemote | StreamState::Closed) {
            return false;
        }
        if self.task.is_expired(ctx.now) {
            tracing::debug!(stream_id = self.id, task = %self.task.id, "task deadline passed");
            if self.task.is_responsed() {
                self.task.finish();
            } else {
                self.task.respond_failure("timeout");
            }
            ctx.events.push(StreamEvent::Failed { stream_id: self.id });
            self.reset(ctx);
            self.release(ctx);
            return true;
        }
        if !self.task.is_responsed()
            && ctx.now.saturating_duration_since(self.started_at) >= self.settings.attempt_timeout
        {
            tracing::debug!(stream_id = self.id, task = %self.task.id, "no response within attempt timeout");
            ctx.events.push(StreamEvent::Failed { stream_id: self.id });
            self.reset(ctx);
            self.close("attempt timeout", ctx);
            return true;
        }
        false
    }

    fn reset(&mut self, ctx: &mut StreamCtx<'_>) {
        if matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal) {
            ctx.out.push(Frame::RstStream {
                stream_id: self.id,
                error_code: error_code::CANCEL,
            });
        }
    }

    /// Forced close: an unanswered task goes back for retry, an answered one is finished.
    pub fn close(&mut self, reason: &str, ctx: &mut StreamCtx<'_>) {
        if self.released {
            return;
        }
        if self.task.is_responsed() {
            self.task.finish();
        } else {
            self.task.set_state(format!("h2 stream {} closed: {reason}", self.id));
            ctx.events.push(StreamEvent::Retry {
                task: Arc::clone(&self.task),
                reason: reason.to_string(),
            });
        }
        self.release(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http2::frame::DEFAULT_MAX_FRAME_SIZE;
    use http::Method;

    struct Harness {
        encoder: hpack::Encoder<'static>,
        decoder: hpack::Decoder<'static>,
        peer_encoder: hpack::Encoder<'static>,
        peer_decoder: hpack::Decoder<'static>,
        conn_send: SendWindow,
        out: Vec<Frame>,
        events: Vec<StreamEvent>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                encoder: hpack::Encoder::new(),
                decoder: hpack::Decoder::new(),
                peer_encoder: hpack::Encoder::new(),
                peer_decoder: hpack::Decoder::new(),
                conn_send: SendWindow::new(65_535),
                out: Vec::new(),
                events: Vec::new(),
            }
        }

        fn ctx(&mut self, now: Instant) -> StreamCtx<'_> {
            StreamCtx {
                encoder: &mut self.encoder,
                decoder: &mut self.decoder,
                conn_send: &mut self.conn_send,
                max_frame_size: DEFAULT_MAX_FRAME_SIZE,
                out: &mut self.out,
                events: &mut self.events,
                now,
            }
        }

        fn response_headers(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) -> Frame {
            let block = self
                .peer_encoder
                .encode(fields.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes())));
            Frame::Headers {
                stream_id,
                block: Bytes::from(block),
                end_stream,
                end_headers: true,
            }
        }
    }

    fn settings() -> Arc<StreamSettings> {
        Arc::new(StreamSettings {
            recv_window: 100,
            window_update_fraction: 0.5,
            attempt_timeout: Duration::from_secs(2),
            speed_sample_min_bytes: 10,
            server_cost_header: "x-server-cost".into(),
        })
    }

    fn stream(body: &'static [u8], timeout: Duration) -> (Stream, tokio::sync::oneshot::Receiver<crate::front::task::Response>) {
        let (task, rx) = Task::new(
            if body.is_empty() { Method::GET } else { Method::POST },
            "front.example",
            "/x",
            vec![("Connection".into(), "keep-alive".into()), ("Accept".into(), "*/*".into())],
            Bytes::from_static(body),
            timeout,
        );
        let stream = Stream::new(1, Arc::new(task), settings(), 65_535, Some(0.05), Instant::now());
        (stream, rx)
    }

    #[tokio::test]
    async fn get_walks_the_full_lifecycle() {
        let mut h = Harness::new();
        let (mut stream, rx) = stream(b"", Duration::from_secs(5));
        let now = Instant::now();
        stream.start_request(&mut h.ctx(now)).unwrap();

        let Frame::Headers { block, end_stream, .. } = h.out.remove(0) else {
            panic!("expected HEADERS");
        };
        assert!(end_stream);
        let fields = h.peer_decoder.decode(&block).unwrap();
        let names: Vec<_> = fields.iter().map(|(k, _)| String::from_utf8_lossy(k).into_owned()).collect();
        assert_eq!(&names[..4], &[":method", ":scheme", ":authority", ":path"]);
        assert!(names.contains(&"accept".to_string()));
        assert!(!names.contains(&"connection".to_string()));

        let headers = h.response_headers(1, &[(":status", "200"), ("x-server-cost", "1")], false);
        stream.receive_frame(headers, &mut h.ctx(now)).unwrap();
        let data = Frame::Data {
            stream_id: 1,
            data: Bytes::from_static(b"hello world!"),
            end_stream: true,
            flow_len: 12,
        };
        stream
            .receive_frame(data, &mut h.ctx(now + Duration::from_millis(20)))
            .unwrap();

        assert_eq!(
            stream.history(),
            &[
                StreamState::Idle,
                StreamState::Open,
                StreamState::HalfClosedLocal,
                StreamState::Closed
            ]
        );
        assert!(matches!(h.events[0], StreamEvent::Responded { stream_id: 1 }));
        assert!(matches!(
            h.events[1],
            StreamEvent::Completed { speed: Some(_), predicted: Some(_), .. }
        ));
        assert!(matches!(h.events[2], StreamEvent::Closed { stream_id: 1 }));

        let mut response = rx.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(&response.read_all().await[..], b"hello world!");
    }

    #[tokio::test]
    async fn data_triggers_window_updates_in_threshold_steps() {
        let mut h = Harness::new();
        let (mut stream, _rx) = stream(b"", Duration::from_secs(5));
        let now = Instant::now();
        stream.start_request(&mut h.ctx(now)).unwrap();
        h.out.clear();
        let headers = h.response_headers(1, &[(":status", "200")], false);
        stream.receive_frame(headers, &mut h.ctx(now)).unwrap();

        for _ in 0..3 {
            let data = Frame::Data {
                stream_id: 1,
                data: Bytes::from(vec![0u8; 30]),
                end_stream: false,
                flow_len: 30,
            };
            stream.receive_frame(data, &mut h.ctx(now)).unwrap();
        }
        // 90 bytes against a threshold of 50.
        assert_eq!(
            h.out,
            vec![Frame::WindowUpdate {
                stream_id: 1,
                increment: 50
            }]
        );

        let overrun = Frame::Data {
            stream_id: 1,
            data: Bytes::from(vec![0u8; 80]),
            end_stream: false,
            flow_len: 80,
        };
        assert!(matches!(
            stream.receive_frame(overrun, &mut h.ctx(now)),
            Err(FrontError::FlowControl(_))
        ));
    }

    #[tokio::test]
    async fn body_waits_for_credit() {
        let mut h = Harness::new();
        let (task, _rx) = Task::new(
            Method::POST,
            "front.example",
            "/upload",
            Vec::new(),
            Bytes::from(vec![7u8; 25]),
            Duration::from_secs(5),
        );
        let mut stream = Stream::new(3, Arc::new(task), settings(), 10, None, Instant::now());
        let now = Instant::now();
        stream.start_request(&mut h.ctx(now)).unwrap();
        let sent: usize = h
            .out
            .iter()
            .map(|f| match f {
                Frame::Data { data, .. } => data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(sent, 10);
        assert_eq!(stream.pending_body(), 15);
        assert_eq!(stream.state(), StreamState::Open);

        stream
            .receive_frame(
                Frame::WindowUpdate {
                    stream_id: 3,
                    increment: 100,
                },
                &mut h.ctx(now),
            )
            .unwrap();
        assert_eq!(stream.pending_body(), 0);
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(matches!(h.out.last(), Some(Frame::Data { end_stream: true, .. })));
    }

    #[tokio::test]
    async fn peer_reset_is_connection_fatal() {
        let mut h = Harness::new();
        let (mut stream, _rx) = stream(b"", Duration::from_secs(5));
        let now = Instant::now();
        stream.start_request(&mut h.ctx(now)).unwrap();
        let reset = Frame::RstStream {
            stream_id: 1,
            error_code: error_code::CANCEL,
        };
        assert!(stream.receive_frame(reset, &mut h.ctx(now)).is_err());

        let push = Frame::PushPromise {
            stream_id: 1,
            promised_id: 2,
        };
        assert!(stream.receive_frame(push, &mut h.ctx(now)).is_ok());
    }

    #[tokio::test]
    async fn attempt_timeout_routes_to_retry() {
        let mut h = Harness::new();
        let (mut stream, _rx) = stream(b"", Duration::from_secs(5));
        let now = Instant::now();
        stream.start_request(&mut h.ctx(now)).unwrap();
        assert!(!stream.check_timeout(&mut h.ctx(now + Duration::from_secs(1))));
        assert!(stream.check_timeout(&mut h.ctx(now + Duration::from_secs(3))));
        assert!(h.events.iter().any(|e| matches!(e, StreamEvent::Failed { .. })));
        assert!(h.events.iter().any(|e| matches!(e, StreamEvent::Retry { .. })));
        assert!(!stream.task().is_responsed());
        assert!(stream.is_released());
    }

    #[tokio::test]
    async fn deadline_fails_an_unanswered_task() {
        let mut h = Harness::new();
        let (mut stream, rx) = stream(b"", Duration::from_secs(1));
        let now = Instant::now();
        stream.start_request(&mut h.ctx(now)).unwrap();
        assert!(stream.check_timeout(&mut h.ctx(now + Duration::from_secs(2))));
        assert!(!h.events.iter().any(|e| matches!(e, StreamEvent::Retry { .. })));
        assert!(rx.await.unwrap().is_failure());
        // A second close is a no-op.
        stream.close("late", &mut h.ctx(now));
        let closes = h
            .events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Closed { .. }))
            .count();
        assert_eq!(closes, 1);
    }
}
