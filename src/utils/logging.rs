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

use tracing_subscriber::EnvFilter;

/// Filter directives for the front; `RUST_LOG` is the fallback.
pub const LOG_ENV: &str = "FRONT_LOG";

/// Per-record TLS tracing stays at `info` by default.
const DEFAULT_FILTER: &str =
    "info,front_transport=debug,front_transport::tls::record=info,front_transport::telemetry=info";

fn filter_directives() -> String {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// Installs the global subscriber for the front binary and the integration tests.
///
/// Repeated calls (one per test) keep the first subscriber.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::new(filter_directives());

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .flatten_event(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .try_init()
    };

    if let Err(err) = result {
        tracing::trace!(error = %err, "tracing subscriber already installed");
    }
}
