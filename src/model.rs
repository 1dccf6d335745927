// Copyright 2025 Salvini
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Shared data model: measurements, samples, snapshots and JSON renderings

use chrono::NaiveDateTime;
use serde_json::{json, Map, Value};

/// Textual timestamp rendering used across both stores.
pub const TIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Series classification, affecting decode rounding.
///
/// Stored as the two-letter codes `AI` (analog, continuous-valued) and
/// `DI` (digital, boolean-like).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointType {
    #[default]
    Analog,
    Digital,
}

impl PointType {
    pub fn as_code(self) -> &'static str {
        match self {
            PointType::Analog => "AI",
            PointType::Digital => "DI",
        }
    }

    /// Tolerant: anything other than `DI` classifies as analog.
    pub fn from_code(code: &str) -> Self {
        if code.trim().eq_ignore_ascii_case("DI") {
            PointType::Digital
        } else {
            PointType::Analog
        }
    }
}

/// Catalog entry for one measurement point within a device.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Measurement {
    pub tag: String,
    pub kind: PointType,
    pub desc: String,
    pub unit: String,
    pub downlimit: Option<f64>,
    pub uplimit: Option<f64>,
    pub modify_time: Option<NaiveDateTime>,
}

/// One timestamped value. `NaN` is the read-side sentinel for "no data".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: NaiveDateTime,
    pub value: f64,
}

impl Sample {
    pub fn new(time: NaiveDateTime, value: f64) -> Self {
        Self { time, value }
    }
}

/// Latest known value for one tag; last write wins.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub tag: String,
    pub time: NaiveDateTime,
    pub value: f64,
}

/// Round to `digits` decimal places. `NaN` passes through.
pub fn round_digits(value: f64, digits: i32) -> f64 {
    if value.is_nan() {
        return value;
    }
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}

pub fn format_time(time: NaiveDateTime) -> String {
    time.format(TIME_FMT).to_string()
}

/// Parse a store timestamp string, with or without fractional seconds.
pub fn parse_time(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

pub fn epoch_millis(time: NaiveDateTime) -> i64 {
    time.and_utc().timestamp_millis()
}

pub fn from_epoch_millis(ms: i64) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp_millis(ms).map(|t| t.naive_utc())
}

/// Time-axis rendering selected by the surrounding HTTP collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAxis {
    /// `[{"time": "YYYY-MM-DD HH:MM:SS", "value": v}, ...]`
    Text,
    /// Chart-style epoch-millisecond pairs `[{"x": ms, "y": v}, ...]`
    EpochMillis,
}

// JSON numbers cannot carry NaN; the sentinel renders as null.
fn json_value(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

pub fn samples_to_json(data: &[Sample], axis: TimeAxis) -> Value {
    let rows = data
        .iter()
        .map(|s| match axis {
            TimeAxis::Text => json!({ "time": format_time(s.time), "value": json_value(s.value) }),
            TimeAxis::EpochMillis => {
                json!({ "x": epoch_millis(s.time), "y": json_value(s.value) })
            }
        })
        .collect();
    Value::Array(rows)
}

/// Object keyed by tag, one entry per catalog record.
pub fn measurements_to_json(measurements: &[Measurement]) -> Value {
    let mut out = Map::new();
    for m in measurements {
        out.insert(
            m.tag.clone(),
            json!({
                "tag": m.tag,
                "type": m.kind.as_code(),
                "desc": m.desc,
                "unit": m.unit,
                "downlimit": m.downlimit.map_or(Value::Null, json_value),
                "uplimit": m.uplimit.map_or(Value::Null, json_value),
                "@modifyTime": m.modify_time.map_or(Value::Null, |t| Value::String(format_time(t))),
            }),
        );
    }
    Value::Object(out)
}

/// Object keyed by tag holding the latest `(time, value)` per tag.
pub fn snapshots_to_json(snapshots: &[SnapshotRecord]) -> Value {
    let mut out = Map::new();
    for s in snapshots {
        out.insert(
            s.tag.clone(),
            json!({ "time": format_time(s.time), "value": json_value(s.value) }),
        );
    }
    Value::Object(out)
}
