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

use std::path::PathBuf;

use clap::Parser;
use front_transport::{app::FrontApp, config::FrontConfig, utils::init_tracing};

/// Diagnostic client: builds the pool from a config file and issues a few requests.
#[derive(Debug, Parser)]
#[command(name = "front-probe", about = "Probe an HTTPS front through the pooled transport")]
struct Cli {
    /// Path to the front configuration file (TOML format).
    #[arg(short, long, default_value = "config/front.example.toml")]
    config: PathBuf,

    /// Enable JSON-formatted logs (default: human-readable stdout).
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Request path to fetch.
    #[arg(long, default_value = "/")]
    path: String,

    /// Number of sequential requests.
    #[arg(long, default_value_t = 3)]
    count: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = FrontConfig::load(&cli.config)?;
    let app = FrontApp::new(config)?;

    for (i, result) in app.run_probe(&cli.path, cli.count).await.into_iter().enumerate() {
        println!("{i}: {}", serde_json::to_string(&result)?);
    }
    println!("stats: {}", serde_json::to_string(&app.dispatcher().stats())?);
    for worker in app.dispatcher().workers() {
        println!("worker: {}", serde_json::to_string(&worker)?);
    }
    app.shutdown();
    Ok(())
}
