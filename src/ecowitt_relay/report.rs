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

use percent_encoding::percent_decode;
use std::collections::BTreeMap;
use std::error;
use std::fmt;

/// Value used for station identity fields that are missing from a report.
pub const UNKNOWN: &str = "unknown";

const FIELD_MODEL: &str = "model";
const FIELD_STATION_TYPE: &str = "stationtype";

/// Keys that identify the station or the upload rather than being measurements.
const DROPPED_FIELDS: &[&str] = &["dateutc", "PASSKEY", FIELD_MODEL, FIELD_STATION_TYPE, "freq"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormError {
    Semicolon,
    InvalidEscape(String),
}

impl fmt::Display for FormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Semicolon => write!(f, "invalid semicolon separator in form body"),
            Self::InvalidEscape(s) => write!(f, "invalid percent escape in {:?}", s),
        }
    }
}

impl error::Error for FormError {}

/// Decoded `application/x-www-form-urlencoded` body.
///
/// Keys may be repeated, all values are kept in order of appearance but only the
/// first one is used when building a [`Report`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Form {
    values: BTreeMap<String, Vec<String>>,
}

impl Form {
    /// Decode a form body, failing on the first malformed pair.
    ///
    /// Pairs are separated by `&`, empty pairs are ignored and a pair without `=`
    /// has an empty value. `+` decodes to a space. Percent escapes must be complete,
    /// decoded bytes that aren't valid UTF-8 are replaced rather than rejected.
    pub fn parse(body: &[u8]) -> Result<Self, FormError> {
        let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for pair in body.split(|b| *b == b'&') {
            if pair.is_empty() {
                continue;
            }

            if pair.contains(&b';') {
                return Err(FormError::Semicolon);
            }

            let (key, value) = match pair.iter().position(|b| *b == b'=') {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, &pair[pair.len()..]),
            };

            let key = unescape(key)?;
            let value = unescape(value)?;
            values.entry(key).or_default().push(value);
        }

        Ok(Form { values })
    }

    /// First value for the key, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.first()).map(|s| s.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn unescape(raw: &[u8]) -> Result<String, FormError> {
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            match raw.get(i + 1..i + 3) {
                Some(hex) if hex.iter().all(u8::is_ascii_hexdigit) => i += 3,
                _ => return Err(FormError::InvalidEscape(String::from_utf8_lossy(raw).into_owned())),
            }
        } else {
            i += 1;
        }
    }

    let spaced: Vec<u8> = raw.iter().map(|b| if *b == b'+' { b' ' } else { *b }).collect();
    Ok(percent_decode(&spaced).decode_utf8_lossy().into_owned())
}

/// Measurements pushed by a single station upload along with the identity of the station.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub model: String,
    pub station_type: String,
    /// `None` unless source address tracking is enabled.
    pub source_ip: Option<String>,
    pub fields: BTreeMap<String, f64>,
    /// Fields whose value wasn't a number and were skipped.
    pub rejected: Vec<String>,
}

impl Report {
    /// Build a report from a decoded form, dropping identity and upload metadata
    /// and keeping every field whose first value parses as a float.
    pub fn from_form(mut form: Form, source_ip: Option<String>) -> Self {
        let model = or_unknown(form.get(FIELD_MODEL));
        let station_type = or_unknown(form.get(FIELD_STATION_TYPE));

        for key in DROPPED_FIELDS {
            form.remove(key);
        }

        let mut fields = BTreeMap::new();
        let mut rejected = Vec::new();

        for (name, values) in form.values {
            let raw = values.first().map(|s| s.as_str()).unwrap_or_default();
            match raw.parse::<f64>() {
                Ok(v) => {
                    fields.insert(name, v);
                }
                Err(e) => {
                    tracing::warn!(message = "failed to parse numeric value", field = %name, value = %raw, error = %e);
                    rejected.push(name);
                }
            }
        }

        Report {
            model,
            station_type,
            source_ip,
            fields,
            rejected,
        }
    }
}

/// Normalize an optional header or field value, treating empty as missing.
pub fn or_unknown(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => v.to_owned(),
        _ => UNKNOWN.to_owned(),
    }
}
