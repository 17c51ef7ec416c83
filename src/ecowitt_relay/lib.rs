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

//! Prometheus metrics relay for Ecowitt weather stations
//!
//! ## Features
//!
//! `ecowitt_relay` accepts the reports that an Ecowitt weather station (or gateway) uploads
//! using the "customized" upload protocol and exposes every numeric field of the most recent
//! report as a Prometheus gauge. Metadata fields (`dateutc`, `PASSKEY`, `model`, `stationtype`,
//! and `freq`) are not emitted as gauges. The station model and type are used as labels.
//!
//! * `ecowitt_relay_${FIELD}_raw{model=$MODEL, stationType=$STATION_TYPE}` - Raw value of
//!   `$FIELD` exactly as reported by the station, in whatever units the station uses.
//!
//! When source address tracking is enabled with `--source-ip-header`, every series also gets
//! a `source_ip` label and the following counter is emitted.
//!
//! * `ecowitt_relay_report_count_total{model=$MODEL, stationType=$STATION_TYPE, source_ip=$IP}` -
//!   Number of reports received.
//!
//! ## Build
//!
//! `ecowitt_relay` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Station
//!
//! In the WS View (or WS View Plus) app, add a "Customized" upload server for your station
//! using the "Ecowitt" protocol. Set the server to the host running `ecowitt_relay`, the port
//! to `8080`, and the path to `/data/report/`. Any path below `/data/report` is accepted.
//!
//! ### Run
//!
//! ```text
//! ./ecowitt_relay --bind 0.0.0.0:8080
//! ```
//!
//! If the station is known to stop uploading until the receiving end restarts, the relay
//! can exit when no reports have arrived for some number of seconds, relying on a supervisor
//! (Systemd, Docker, etc.) to start it again.
//!
//! ```text
//! ./ecowitt_relay --ttl-secs 300
//! ```
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `8080` at `/metrics`. Add the host running
//! `ecowitt_relay` as a target under the Prometheus `scrape_configs` section.
//!
//! ```yaml
//! scrape_configs:
//! - job_name: ecowitt_relay
//!   static_configs:
//!   - targets: ['example:8080']
//! ```
//!

pub mod config;
pub mod http;
pub mod metrics;
pub mod report;
pub mod watchdog;
