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

use crate::report::Report;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Mutex, PoisonError};

const NAMESPACE: &str = "ecowitt_relay";
const LABEL_MODEL: &str = "model";
const LABEL_STATION_TYPE: &str = "stationType";
const LABEL_SOURCE_IP: &str = "source_ip";

pub type FieldGauge = Family<StationLabels, Gauge<f64, AtomicU64>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    InvalidName(String),
}

impl fmt::Display for MetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(s) => write!(f, "invalid metric name for field {:?}", s),
        }
    }
}

impl error::Error for MetricsError {}

/// Identity of the station a series came from.
///
/// The `source_ip` label is only emitted when source address tracking is enabled.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct StationLabels {
    model: String,
    station_type: String,
    source_ip: Option<String>,
}

impl StationLabels {
    pub fn from_report(report: &Report) -> Self {
        StationLabels {
            model: report.model.clone(),
            station_type: report.station_type.clone(),
            source_ip: report.source_ip.clone(),
        }
    }
}

impl EncodeLabelSet for StationLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), fmt::Error> {
        (LABEL_MODEL, self.model.as_str()).encode(encoder.encode_label())?;
        (LABEL_STATION_TYPE, self.station_type.as_str()).encode(encoder.encode_label())?;
        if let Some(ip) = &self.source_ip {
            (LABEL_SOURCE_IP, ip.as_str()).encode(encoder.encode_label())?;
        }

        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    registry: Registry,
    gauges: HashMap<String, FieldGauge>,
}

/// Registry of every series created from station reports.
///
/// Gauges are created the first time a field name is seen and are never removed.
/// Each gauge is named `ecowitt_relay_${FIELD}_raw` and has `model` and `stationType`
/// labels, plus `source_ip` when tracking is enabled. When tracking is enabled a
/// `ecowitt_relay_report_count` counter with the same labels counts reports.
#[derive(Debug)]
pub struct RelayMetrics {
    inner: Mutex<Inner>,
    reports: Option<Family<StationLabels, Counter>>,
}

impl RelayMetrics {
    pub fn new(track_source_ip: bool) -> Self {
        let mut registry = Registry::with_prefix(NAMESPACE);
        let reports = if track_source_ip {
            let reports = Family::<StationLabels, Counter>::default();
            registry.register("report_count", "Number of reports received per station", reports.clone());
            Some(reports)
        } else {
            None
        };

        RelayMetrics {
            inner: Mutex::new(Inner {
                registry,
                gauges: HashMap::new(),
            }),
            reports,
        }
    }

    /// Get the gauge for a field, creating and registering it if it doesn't exist yet.
    ///
    /// Lookup and registration happen under one lock so concurrent reports with a
    /// new field always end up sharing a single registered gauge.
    pub fn gauge(&self, field: &str) -> Result<FieldGauge, MetricsError> {
        if !is_valid_name(field) {
            return Err(MetricsError::InvalidName(field.to_owned()));
        }

        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = &mut *guard;

        if let Some(existing) = inner.gauges.get(field) {
            return Ok(existing.clone());
        }

        let gauge = FieldGauge::default();
        inner.registry.register(
            format!("{}_raw", field),
            format!("Raw value of the {} field reported by the station", field),
            gauge.clone(),
        );
        inner.gauges.insert(field.to_owned(), gauge.clone());

        tracing::debug!(message = "registered new gauge", field = %field);
        Ok(gauge)
    }

    /// Set a gauge for every field of the report, returning the number of gauges set.
    ///
    /// Fields that can't be used as a metric name are logged and skipped.
    pub fn observe(&self, report: &Report) -> usize {
        let labels = StationLabels::from_report(report);
        let mut updated = 0;

        for (field, value) in report.fields.iter() {
            match self.gauge(field) {
                Ok(gauge) => {
                    gauge.get_or_create(&labels).set(*value);
                    updated += 1;
                }
                Err(e) => {
                    tracing::warn!(message = "skipping field", field = %field, error = %e);
                }
            }
        }

        if let Some(reports) = &self.reports {
            reports.get_or_create(&labels).inc();
        }

        updated
    }

    /// Number of distinct field gauges registered.
    pub fn num_gauges(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).gauges.len()
    }

    /// Render all metrics in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut buf = String::new();
        encode(&mut buf, &guard.registry)?;
        Ok(buf)
    }
}

fn is_valid_name(field: &str) -> bool {
    !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}
