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

//! Front lifecycle events, printed through `tracing` or as one JSON object per line.

use serde::Serialize;
use uuid::Uuid;

use crate::config::{TelemetryConfig, TelemetryMode};

/// Events a dispatcher reports about its workers and tasks.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FrontEvent {
    WorkerCreated {
        worker: u64,
        ip: String,
        sni: String,
        http2: bool,
        handshake_ms: u64,
    },
    WorkerClosed {
        worker: u64,
        reason: String,
    },
    TaskFinished {
        task: Uuid,
        path: String,
        status: u16,
        worker: Option<u64>,
        retries: u32,
        elapsed_ms: u64,
        failure: Option<String>,
    },
    TaskRetry {
        task: Uuid,
        retries: u32,
        reason: String,
    },
}

impl FrontEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FrontEvent::WorkerCreated { .. } => "worker_created",
            FrontEvent::WorkerClosed { .. } => "worker_closed",
            FrontEvent::TaskFinished { .. } => "task_finished",
            FrontEvent::TaskRetry { .. } => "task_retry",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Record<'a> {
    dispatcher: Uuid,
    #[serde(flatten)]
    event: &'a FrontEvent,
}

#[derive(Debug, Clone)]
pub struct TelemetrySink {
    mode: TelemetryMode,
}

impl TelemetrySink {
    pub fn new(cfg: TelemetryConfig) -> Self {
        Self { mode: cfg.mode }
    }

    pub fn emit(&self, dispatcher: Uuid, event: FrontEvent) {
        let line = render(dispatcher, &event);
        match self.mode {
            TelemetryMode::Stdout => {
                tracing::info!(target: "front_transport::telemetry", %dispatcher, event = event.name(), detail = %line);
            }
            TelemetryMode::Json => println!("{line}"),
        }
    }
}

fn render(dispatcher: Uuid, event: &FrontEvent) -> String {
    serde_json::to_string(&Record { dispatcher, event })
        .unwrap_or_else(|err| format!("{{\"event\":\"{}\",\"error\":\"{err}\"}}", event.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_render_flat_with_their_dispatcher() {
        let dispatcher = Uuid::nil();
        let line = render(
            dispatcher,
            &FrontEvent::TaskRetry {
                task: Uuid::nil(),
                retries: 2,
                reason: "stream reset".into(),
            },
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "task_retry");
        assert_eq!(value["dispatcher"], dispatcher.to_string());
        assert_eq!(value["retries"], 2);
        assert_eq!(value["reason"], "stream reset");
    }
}
