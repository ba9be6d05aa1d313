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

//! HTTP/2 worker: many streams over one connection.
//!
//! **Tasks:** a reader task parses frames and feeds them to [`Http2Worker::handle_frame`];
//! a single writer task drains an ordered queue of encoded frames. Everything that
//! touches HPACK state or windows runs under the connection lock, and frames produced
//! under the lock are queued before it is released, so header blocks reach the wire in
//! the order they were compressed.
//!
//! **Failure policy:** any protocol error (bad frame, HPACK failure, flow-control
//! violation, peer RST_STREAM) closes the whole worker; unanswered tasks go back to
//! the dispatcher.

use std::{collections::HashMap, sync::Arc};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
    time::Instant,
};

use crate::{
    config::Http2Config,
    front::{
        connect::AsyncIo,
        task::Task,
        worker::{Worker, WorkerCore},
    },
    http2::{
        flow_control::{FlowControlWindow, SendWindow},
        frame::{
            error_code, settings, Frame, DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW, MAX_FRAME_SIZE_LIMIT,
            MAX_WINDOW, PREFACE,
        },
        stream::{Stream, StreamCtx, StreamEvent, StreamSettings},
    },
    utils::{FrontError, FrontResult},
};

struct ConnState {
    streams: HashMap<u32, Stream>,
    encoder: hpack::Encoder<'static>,
    decoder: hpack::Decoder<'static>,
    conn_send: SendWindow,
    conn_recv: FlowControlWindow,
    next_stream_id: u32,
    peer_initial_window: u32,
    peer_max_frame_size: usize,
    peer_max_concurrent: Option<u32>,
    goaway: Option<u32>,
    /// Header block of a stream we no longer track; still decoded to keep HPACK in sync.
    orphan_block: Option<BytesMut>,
    ping: Option<(Instant, [u8; 8])>,
    last_recv: Instant,
}

/// Borrows the stream-independent parts of the connection as a stream context.
macro_rules! stream_ctx {
    ($st:ident, $out:expr, $events:expr, $now:expr) => {
        StreamCtx {
            encoder: &mut $st.encoder,
            decoder: &mut $st.decoder,
            conn_send: &mut $st.conn_send,
            max_frame_size: $st.peer_max_frame_size,
            out: &mut *$out,
            events: &mut *$events,
            now: $now,
        }
    };
}

pub struct Http2Worker {
    core: WorkerCore,
    config: Http2Config,
    stream_settings: Arc<StreamSettings>,
    state: Mutex<ConnState>,
    out: mpsc::UnboundedSender<Bytes>,
    shutdown: watch::Sender<bool>,
}

impl Http2Worker {
    pub fn spawn(
        core: WorkerCore,
        io: Box<dyn AsyncIo>,
        config: Http2Config,
        stream_settings: Arc<StreamSettings>,
    ) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(io);
        let (out, out_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let now = Instant::now();
        let local_window = config.initial_window.max(DEFAULT_WINDOW);

        let mut preface = BytesMut::from(PREFACE);
        Frame::Settings {
            ack: false,
            params: vec![
                (settings::ENABLE_PUSH, 0),
                (settings::INITIAL_WINDOW_SIZE, config.initial_window),
                (settings::MAX_FRAME_SIZE, config.max_frame_size),
            ],
        }
        .encode(&mut preface);
        if local_window > DEFAULT_WINDOW {
            Frame::WindowUpdate {
                stream_id: 0,
                increment: local_window - DEFAULT_WINDOW,
            }
            .encode(&mut preface);
        }
        // Receiver is alive until the writer task below starts.
        let _ = out.send(preface.freeze());

        let state = ConnState {
            streams: HashMap::new(),
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
            conn_send: SendWindow::new(DEFAULT_WINDOW),
            conn_recv: FlowControlWindow::new(local_window, config.window_update_fraction),
            next_stream_id: 1,
            peer_initial_window: DEFAULT_WINDOW,
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            peer_max_concurrent: None,
            goaway: None,
            orphan_block: None,
            ping: None,
            last_recv: now,
        };
        let worker = Arc::new(Self {
            core,
            config,
            stream_settings,
            state: Mutex::new(state),
            out,
            shutdown,
        });

        let writer = Arc::clone(&worker);
        let writer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(err) = write_loop(write_half, out_rx, writer_shutdown).await {
                writer.close(&format!("write failed: {err}"));
            }
        });
        tokio::spawn(Arc::clone(&worker).read_loop(read_half, shutdown_rx));
        worker
    }

    async fn read_loop(self: Arc<Self>, mut io: ReadHalf<Box<dyn AsyncIo>>, mut shutdown: watch::Receiver<bool>) {
        let max_frame_size = self.config.max_frame_size as usize;
        let mut buf = BytesMut::with_capacity(64 * 1024);
        let reason = 'conn: loop {
            loop {
                match Frame::parse(&mut buf, max_frame_size) {
                    Ok(Some(frame)) => {
                        if let Err(err) = self.handle_frame(frame) {
                            tracing::warn!(worker = self.core.id, error = %err, "http2 protocol failure");
                            break 'conn err.to_string();
                        }
                    }
                    Ok(None) => break,
                    Err(err) => break 'conn format!("bad frame: {err}"),
                }
            }
            tokio::select! {
                read = io.read_buf(&mut buf) => match read {
                    Ok(0) => break 'conn "connection closed by peer".to_string(),
                    Ok(_) => {}
                    Err(err) => break 'conn format!("read failed: {err}"),
                },
                _ = shutdown.changed() => return,
            }
        };
        self.close(&reason);
    }

    /// Queues encoded frames for the writer; call with the connection lock held.
    fn queue(&self, frames: &[Frame]) {
        if frames.is_empty() {
            return;
        }
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode(&mut buf);
        }
        if self.out.send(buf.freeze()).is_err() {
            tracing::trace!(worker = self.core.id, "writer gone; frames dropped");
        }
    }

    /// Applies one received frame. An `Err` means the connection must close.
    pub fn handle_frame(&self, frame: Frame) -> FrontResult<()> {
        let now = Instant::now();
        self.core.mark_recv(now);
        let mut events = Vec::new();
        let result = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.last_recv = now;
            let mut out = Vec::new();
            let result = self.dispatch(st, frame, now, &mut out, &mut events);
            st.streams.retain(|_, stream| !stream.is_released());
            self.queue(&out);
            result
        };
        self.apply_events(events);
        result
    }

    fn dispatch(
        &self,
        st: &mut ConnState,
        frame: Frame,
        now: Instant,
        out: &mut Vec<Frame>,
        events: &mut Vec<StreamEvent>,
    ) -> FrontResult<()> {
        match frame {
            Frame::Settings { ack: true, .. } => {
                tracing::trace!(worker = self.core.id, "settings acknowledged");
            }
            Frame::Settings { params, .. } => {
                let grew = self.apply_settings(st, &params)?;
                out.push(Frame::Settings {
                    ack: true,
                    params: Vec::new(),
                });
                if grew {
                    resume_streams(st, out, events, now)?;
                }
            }
            Frame::Ping { ack: false, payload } => out.push(Frame::Ping { ack: true, payload }),
            Frame::Ping { ack: true, payload } => {
                if let Some((sent, expected)) = st.ping {
                    if expected == payload {
                        st.ping = None;
                        tracing::trace!(
                            worker = self.core.id,
                            rtt_ms = now.saturating_duration_since(sent).as_millis() as u64,
                            "ping answered"
                        );
                    }
                }
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug: goaway_debug,
            } => {
                tracing::info!(
                    worker = self.core.id,
                    last_stream_id,
                    error_code,
                    debug = %String::from_utf8_lossy(&goaway_debug),
                    "peer sent GOAWAY"
                );
                st.goaway = Some(last_stream_id);
                self.core.stop_accepting();
                let mut ids: Vec<u32> = st.streams.keys().copied().filter(|id| *id > last_stream_id).collect();
                ids.sort_unstable();
                for id in ids {
                    if let Some(stream) = st.streams.get_mut(&id) {
                        stream.close("goaway", &mut stream_ctx!(st, out, events, now));
                    }
                }
            }
            Frame::WindowUpdate { stream_id: 0, increment } => {
                st.conn_send.increase(increment)?;
                resume_streams(st, out, events, now)?;
            }
            Frame::Blocked { stream_id: 0 } => {
                let increment = st.conn_recv.on_blocked();
                if increment > 0 {
                    out.push(Frame::WindowUpdate { stream_id: 0, increment });
                }
            }
            Frame::Data { flow_len, .. } if frame.stream_id() != 0 => {
                if st.conn_recv.would_overrun(flow_len) {
                    return Err(FrontError::FlowControl(format!(
                        "connection received {flow_len} bytes with {} bytes of window",
                        st.conn_recv.available()
                    )));
                }
                let increment = st.conn_recv.on_bytes_received(flow_len);
                if increment > 0 {
                    out.push(Frame::WindowUpdate { stream_id: 0, increment });
                }
                self.route(st, frame, now, out, events)?;
            }
            frame if frame.stream_id() != 0 => self.route(st, frame, now, out, events)?,
            other => {
                tracing::debug!(worker = self.core.id, kind = ?other.kind(), "ignoring connection frame");
            }
        }
        Ok(())
    }

    fn route(
        &self,
        st: &mut ConnState,
        frame: Frame,
        now: Instant,
        out: &mut Vec<Frame>,
        events: &mut Vec<StreamEvent>,
    ) -> FrontResult<()> {
        let stream_id = frame.stream_id();
        if let Some(stream) = st.streams.get_mut(&stream_id) {
            return stream.receive_frame(frame, &mut stream_ctx!(st, out, events, now));
        }
        match frame {
            Frame::Headers { block, end_headers, .. } => {
                st.orphan_block = Some(BytesMut::from(&block[..]));
                if end_headers {
                    decode_orphan(st)?;
                }
            }
            Frame::Continuation { block, end_headers, .. } => {
                let Some(pending) = st.orphan_block.as_mut() else {
                    return Err(FrontError::Http2(format!("unexpected CONTINUATION on stream {stream_id}")));
                };
                pending.extend_from_slice(&block);
                if end_headers {
                    decode_orphan(st)?;
                }
            }
            other => {
                tracing::trace!(worker = self.core.id, stream_id, kind = ?other.kind(), "frame for unknown stream");
            }
        }
        Ok(())
    }

    /// Returns whether stream send windows grew.
    fn apply_settings(&self, st: &mut ConnState, params: &[(u16, u32)]) -> FrontResult<bool> {
        let mut grew = false;
        for &(id, value) in params {
            match id {
                settings::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW {
                        return Err(FrontError::FlowControl(format!("initial window {value}")));
                    }
                    let old = st.peer_initial_window;
                    for stream in st.streams.values_mut() {
                        stream.send_window_mut().adjust(old, value)?;
                    }
                    grew |= value > old;
                    st.peer_initial_window = value;
                }
                settings::MAX_FRAME_SIZE => {
                    let size = value as usize;
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&size) {
                        return Err(FrontError::Http2(format!("max frame size {value}")));
                    }
                    st.peer_max_frame_size = size;
                }
                settings::MAX_CONCURRENT_STREAMS => st.peer_max_concurrent = Some(value),
                settings::ENABLE_PUSH if value > 1 => {
                    return Err(FrontError::Http2(format!("enable_push {value}")));
                }
                _ => {}
            }
        }
        tracing::debug!(worker = self.core.id, ?params, "peer settings applied");
        Ok(grew)
    }

    fn apply_events(&self, events: Vec<StreamEvent>) {
        for event in events {
            match event {
                StreamEvent::Responded { stream_id } => {
                    tracing::trace!(worker = self.core.id, stream_id, "response headers");
                }
                StreamEvent::Completed {
                    rtt, predicted, speed, ..
                } => {
                    self.core.update_rtt(rtt, predicted);
                    if let Some(speed) = speed {
                        self.core.update_speed(speed);
                    }
                    self.core.task_succeeded();
                }
                StreamEvent::Failed { .. } => self.core.task_failed(),
                StreamEvent::Retry { task, reason } => self.hand_back(task, &reason),
                StreamEvent::Closed { stream_id } => {
                    tracing::trace!(worker = self.core.id, stream_id, "stream released");
                }
            }
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

    pub fn stream_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.state.lock().streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn resume_streams(
    st: &mut ConnState,
    out: &mut Vec<Frame>,
    events: &mut Vec<StreamEvent>,
    now: Instant,
) -> FrontResult<()> {
    let mut ids: Vec<u32> = st.streams.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        if let Some(stream) = st.streams.get_mut(&id) {
            stream.send_body(&mut stream_ctx!(st, out, events, now))?;
        }
    }
    Ok(())
}

fn decode_orphan(st: &mut ConnState) -> FrontResult<()> {
    if let Some(block) = st.orphan_block.take() {
        st.decoder
            .decode(&block)
            .map_err(|err| FrontError::Http2(format!("header block decode failed: {err:?}")))?;
    }
    Ok(())
}

async fn write_loop(
    mut io: WriteHalf<Box<dyn AsyncIo>>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) -> FrontResult<()> {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(chunk) => {
                    io.write_all(&chunk).await?;
                    while let Ok(more) = rx.try_recv() {
                        io.write_all(&more).await?;
                    }
                    io.flush().await?;
                }
                None => break,
            },
            _ = shutdown.changed() => {
                while let Ok(rest) = rx.try_recv() {
                    io.write_all(&rest).await?;
                }
                io.flush().await?;
                break;
            }
        }
    }
    let _ = io.shutdown().await;
    Ok(())
}

impl Worker for Http2Worker {
    fn core(&self) -> &WorkerCore {
        &self.core
    }

    fn request(&self, task: Arc<Task>) -> bool {
        if !self.core.is_accepting() {
            return false;
        }
        let predicted = self.get_score();
        let now = Instant::now();
        let mut events = Vec::new();
        let started = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let saturated = st
                .peer_max_concurrent
                .is_some_and(|max| st.streams.len() >= max as usize);
            if st.goaway.is_some() || saturated {
                return false;
            }
            if st.next_stream_id > MAX_WINDOW {
                self.core.stop_accepting();
                return false;
            }
            let id = st.next_stream_id;
            st.next_stream_id += 2;
            task.assign_worker(self.core.id);
            let mut stream = Stream::new(
                id,
                Arc::clone(&task),
                Arc::clone(&self.stream_settings),
                st.peer_initial_window,
                Some(predicted),
                now,
            );
            let mut out = Vec::new();
            let result = stream.start_request(&mut stream_ctx!(st, &mut out, &mut events, now));
            self.queue(&out);
            match result {
                Ok(()) => {
                    st.streams.insert(id, stream);
                    true
                }
                Err(err) => {
                    tracing::error!(worker = self.core.id, stream_id = id, error = %err, "failed to start stream");
                    false
                }
            }
        };
        self.apply_events(events);
        if started {
            self.core.mark_send(now);
        } else {
            self.close("stream start failed");
        }
        started
    }

    fn inflight(&self) -> usize {
        self.state.lock().streams.len()
    }

    fn inflight_bytes(&self) -> u64 {
        self.state
            .lock()
            .streams
            .values()
            .map(|stream| stream.pending_body() as u64)
            .sum()
    }

    fn check_active(&self) {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut dead = None;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let mut out = Vec::new();
            let mut ids: Vec<u32> = st.streams.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                if let Some(stream) = st.streams.get_mut(&id) {
                    stream.check_timeout(&mut stream_ctx!(st, &mut out, &mut events, now));
                }
            }
            st.streams.retain(|_, stream| !stream.is_released());

            let ping_interval = std::time::Duration::from_secs(self.config.ping_interval_secs);
            let ping_timeout = std::time::Duration::from_secs(self.config.ping_timeout_secs);
            match st.ping {
                Some((sent, _)) if now.saturating_duration_since(sent) >= ping_timeout => {
                    dead = Some("ping timeout");
                }
                None if now.saturating_duration_since(st.last_recv) >= ping_interval => {
                    let payload: [u8; 8] = rand::random();
                    st.ping = Some((now, payload));
                    out.push(Frame::Ping { ack: false, payload });
                }
                _ => {}
            }
            self.queue(&out);
        }
        self.apply_events(events);
        if let Some(reason) = dead {
            self.close(reason);
        }
    }

    fn close(&self, reason: &str) {
        if !self.core.begin_close(reason) {
            return;
        }
        let now = Instant::now();
        let mut events = Vec::new();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let mut out = vec![Frame::GoAway {
                last_stream_id: 0,
                error_code: error_code::NO_ERROR,
                debug: Bytes::new(),
            }];
            let mut streams: Vec<(u32, Stream)> = st.streams.drain().collect();
            streams.sort_unstable_by_key(|(id, _)| *id);
            for (_, mut stream) in streams {
                stream.close(reason, &mut stream_ctx!(st, &mut out, &mut events, now));
            }
            self.queue(&out);
        }
        let _ = self.shutdown.send(true);
        self.apply_events(events);
    }
}
