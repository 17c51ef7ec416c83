// ecowitt_relay - Prometheus metrics relay for Ecowitt weather stations
//
// Copyright 2023 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use axum::http::HeaderName;
use clap::{Parser, ValueEnum};
use ecowitt_relay::config::RelayConfig;
use ecowitt_relay::http::RequestContext;
use ecowitt_relay::metrics::RelayMetrics;
use ecowitt_relay::watchdog::{Activity, Outcome, RestartPolicy, Watchdog};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::oneshot;
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8080);
const DEFAULT_TTL_SECS: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyKind {
    /// Exit when no reports have arrived for longer than the TTL
    Inactivity,
    /// Exit once after the TTL regardless of reports
    Fixed,
}

#[derive(Debug, Parser)]
#[clap(name = "ecowitt_relay", version = clap::crate_version!())]
struct EcowittRelayApplication {
    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Show debug logs, equivalent to '--log-level debug'
    #[clap(long)]
    debug: bool,

    /// Path to a JSON config file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Exit with status 1 after this many seconds so a supervisor can restart the
    /// relay. Zero disables restarts.
    #[clap(long, alias = "ttl", default_value_t = DEFAULT_TTL_SECS)]
    ttl_secs: u64,

    /// How the TTL is applied when restarts are enabled
    #[clap(long, value_enum, default_value_t = PolicyKind::Inactivity)]
    restart_policy: PolicyKind,

    /// Header containing the address of the station, set by a reverse proxy (e.g.
    /// 'X-Real-IP'). When set, metrics get a 'source_ip' label.
    #[clap(long)]
    source_ip_header: Option<HeaderName>,

    /// Address to bind to. By default, ecowitt_relay will bind to public address since
    /// weather stations on the local network need to reach it.
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = EcowittRelayApplication::parse();
    let level = if opts.debug { Level::DEBUG } else { opts.log_level };
    tracing::subscriber::set_global_default(tracing_subscriber::FmtSubscriber::builder().with_max_level(level).finish())
        .expect("failed to set tracing subscriber");

    if let Some(path) = &opts.config {
        tracing::info!(message = "loading config", config = %path.display());
        let config = RelayConfig::from_path(path).unwrap_or_else(|e| {
            tracing::error!(message = "unable to load config", error = %e);
            process::exit(1)
        });
        tracing::debug!(message = "loaded config", config = ?config);
    }

    let ttl = Duration::from_secs(opts.ttl_secs);
    let policy = match opts.restart_policy {
        PolicyKind::Inactivity => RestartPolicy::inactivity(ttl),
        PolicyKind::Fixed => RestartPolicy::fixed(ttl),
    };

    let activity = Activity::default();
    let metrics = RelayMetrics::new(opts.source_ip_header.is_some());
    let context = Arc::new(RequestContext::new(metrics, activity.clone(), opts.source_ip_header.clone()));
    let handler = ecowitt_relay::http::app(context);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let watchdog = Watchdog::new(policy, activity);
    tokio::spawn(async move {
        tracing::debug!(message = "watchdog started", policy = ?policy);
        let outcome = watchdog
            .run(async {
                let _ = stop_rx.await;
            })
            .await;

        match outcome {
            Outcome::Expired => {
                tracing::info!(message = "ttl expired with no reports", policy = ?policy);
                process::exit(1)
            }
            Outcome::Cancelled => tracing::info!("closing background routine"),
        }
    });

    let server = axum::Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(message = "server started", address = %opts.bind);

    server
        .serve(handler.into_make_service())
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    let _ = stop_tx.send(());
    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
