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

//! In-process peers for the integration tests: a scripted HTTP/2 server built on the
//! crate's frame codec plus `hpack`, a canned HTTP/1.1 server and a connector that
//! hands out in-memory connections to them.

use std::{
    collections::VecDeque,
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use front_transport::{
    config::FrontConfig,
    front::{ConnectionManager, SecuredConnection},
    http2::frame::{settings, Frame, DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW, MAX_FRAME_SIZE_LIMIT, PREFACE},
    utils::FrontResult,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const FRONT_IP: &str = "192.0.2.1";

/// Parses a config with a fixed `[front]` section followed by `extra`.
pub fn config_with(extra: &str) -> FrontConfig {
    let raw = format!(
        "[front]\nips = [\"{FRONT_IP}\"]\nsni = [\"front.test\"]\nhost = \"origin.test\"\n\n{extra}"
    );
    toml::from_str(&raw).expect("test config parses")
}

pub fn front_ip() -> IpAddr {
    FRONT_IP.parse().expect("valid ip")
}

#[derive(Debug, Default)]
pub struct H2Log {
    pub requests: Mutex<Vec<Vec<(String, String)>>>,
    pub window_updates: Mutex<Vec<(u32, u32)>>,
    pub resets: Mutex<Vec<u32>>,
}

impl H2Log {
    pub fn stream_window_updates(&self) -> usize {
        self.window_updates.lock().iter().filter(|(id, _)| *id != 0).count()
    }
}

/// What the server on the other end of a mock connection does.
#[derive(Debug, Clone)]
pub enum ServerKind {
    /// HTTP/2: answers every request with `200` and `body_len` bytes, honouring flow control.
    H2 { body_len: usize, log: Arc<H2Log> },
    /// HTTP/2: sends GOAWAY(last_stream_id = 0) on the first request and never answers.
    H2GoAway,
    /// Reads everything and never writes.
    Silent,
    /// HTTP/1.1: answers each request with `200` and the given body.
    Http1 { body: &'static str },
}

/// Connector that returns in-memory connections to scripted servers.
pub struct MockConnector {
    http2: bool,
    default_kind: ServerKind,
    queued: Mutex<VecDeque<ServerKind>>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(default_kind: ServerKind, http2: bool) -> Arc<Self> {
        Arc::new(Self {
            http2,
            default_kind,
            queued: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
        })
    }

    /// Serves the next connection with `kind` instead of the default.
    pub fn then(&self, kind: ServerKind) {
        self.queued.lock().push_back(kind);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Builds a connection without counting it as a dial.
    pub fn secured(&self, handshake_time: Duration) -> SecuredConnection {
        let kind = self.queued.lock().pop_front().unwrap_or_else(|| self.default_kind.clone());
        let (client, server) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve(kind, server));
        SecuredConnection {
            io: Box::new(client),
            ip: front_ip(),
            sni: "front.test".into(),
            handshake_time,
            http2: self.http2,
        }
    }
}

#[async_trait]
impl ConnectionManager for MockConnector {
    async fn get_ssl_connection(&self, _timeout: Duration) -> FrontResult<SecuredConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.secured(Duration::from_millis(100)))
    }
}

async fn serve(kind: ServerKind, io: DuplexStream) {
    match kind {
        ServerKind::H2 { body_len, log } => serve_h2(io, Some(body_len), false, log).await,
        ServerKind::H2GoAway => serve_h2(io, None, true, Arc::default()).await,
        ServerKind::Silent => serve_silent(io).await,
        ServerKind::Http1 { body } => serve_http1(io, body).await,
    }
}

async fn serve_silent(io: DuplexStream) {
    let (mut rd, _wr) = tokio::io::split(io);
    let mut sink = tokio::io::sink();
    let _ = tokio::io::copy(&mut rd, &mut sink).await;
}

async fn serve_http1(mut io: DuplexStream, body: &'static str) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        while let Some(end) = find(&buf, b"\r\n\r\n") {
            buf.drain(..end + 4);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
                body.len(),
                body
            );
            if io.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
        match io.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

struct PendingBody {
    id: u32,
    window: i64,
    remaining: usize,
}

async fn serve_h2(io: DuplexStream, body_len: Option<usize>, goaway: bool, log: Arc<H2Log>) {
    let (mut rd, mut wr) = tokio::io::split(io);
    let mut buf = BytesMut::new();
    while buf.len() < PREFACE.len() {
        match rd.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
    assert_eq!(&buf[..PREFACE.len()], PREFACE);
    buf.advance(PREFACE.len());

    let mut out = BytesMut::new();
    Frame::Settings {
        ack: false,
        params: vec![(settings::MAX_CONCURRENT_STREAMS, 100)],
    }
    .encode(&mut out);

    let mut encoder = hpack::Encoder::new();
    let mut decoder = hpack::Decoder::new();
    let mut conn_window = i64::from(DEFAULT_WINDOW);
    let mut peer_initial = i64::from(DEFAULT_WINDOW);
    let mut pending: Vec<PendingBody> = Vec::new();

    loop {
        loop {
            let frame = match Frame::parse(&mut buf, MAX_FRAME_SIZE_LIMIT) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            match frame {
                Frame::Settings { ack: false, params } => {
                    for (id, value) in params {
                        if id == settings::INITIAL_WINDOW_SIZE {
                            let delta = i64::from(value) - peer_initial;
                            peer_initial = i64::from(value);
                            for body in pending.iter_mut() {
                                body.window += delta;
                            }
                        }
                    }
                    Frame::Settings {
                        ack: true,
                        params: Vec::new(),
                    }
                    .encode(&mut out);
                }
                Frame::Headers { stream_id, block, .. } => {
                    let headers = decoder
                        .decode(&block)
                        .expect("request header block decodes")
                        .into_iter()
                        .map(|(k, v)| {
                            (
                                String::from_utf8_lossy(&k).into_owned(),
                                String::from_utf8_lossy(&v).into_owned(),
                            )
                        })
                        .collect();
                    log.requests.lock().push(headers);
                    if goaway {
                        Frame::GoAway {
                            last_stream_id: 0,
                            error_code: 0,
                            debug: Bytes::from_static(b"maintenance"),
                        }
                        .encode(&mut out);
                        continue;
                    }
                    let Some(len) = body_len else { continue };
                    let len_text = len.to_string();
                    let block = encoder.encode(vec![
                        (b":status".as_slice(), b"200".as_slice()),
                        (b"content-length".as_slice(), len_text.as_bytes()),
                    ]);
                    Frame::Headers {
                        stream_id,
                        block: Bytes::from(block),
                        end_stream: len == 0,
                        end_headers: true,
                    }
                    .encode(&mut out);
                    if len > 0 {
                        pending.push(PendingBody {
                            id: stream_id,
                            window: peer_initial,
                            remaining: len,
                        });
                    }
                }
                Frame::WindowUpdate { stream_id, increment } => {
                    log.window_updates.lock().push((stream_id, increment));
                    if stream_id == 0 {
                        conn_window += i64::from(increment);
                    } else if let Some(body) = pending.iter_mut().find(|b| b.id == stream_id) {
                        body.window += i64::from(increment);
                    }
                }
                Frame::Ping { ack: false, payload } => Frame::Ping { ack: true, payload }.encode(&mut out),
                Frame::RstStream { stream_id, .. } => {
                    log.resets.lock().push(stream_id);
                    pending.retain(|b| b.id != stream_id);
                }
                Frame::GoAway { .. } => {
                    let _ = wr.write_all(&out).await;
                    return;
                }
                _ => {}
            }
        }

        for body in pending.iter_mut() {
            while body.remaining > 0 {
                let n = (body.remaining as i64)
                    .min(conn_window)
                    .min(body.window)
                    .min(DEFAULT_MAX_FRAME_SIZE as i64);
                if n <= 0 {
                    break;
                }
                let n = n as usize;
                body.remaining -= n;
                body.window -= n as i64;
                conn_window -= n as i64;
                Frame::Data {
                    stream_id: body.id,
                    data: Bytes::from(vec![b'x'; n]),
                    end_stream: body.remaining == 0,
                    flow_len: n,
                }
                .encode(&mut out);
            }
        }
        pending.retain(|b| b.remaining > 0);

        if !out.is_empty() {
            if wr.write_all(&out).await.is_err() {
                return;
            }
            out.clear();
        }
        match rd.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
