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

// Apache IoTDB backend over the REST v2 API

use crate::client::TimeSeriesBackend;
use crate::config::ConnectionConfig;
use crate::matrix::BulkWriteMatrix;
use crate::model::{
    epoch_millis, format_time, from_epoch_millis, parse_time, round_digits, Measurement,
    PointType, Sample, SnapshotRecord,
};
use crate::pattern::TagFilter;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Local, NaiveDateTime};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

const REST_QUERY: &str = "/rest/v2/query";
const REST_NON_QUERY: &str = "/rest/v2/nonQuery";
const REST_INSERT_TABLET: &str = "/rest/v2/insertTablet";
const REST_INSERT_RECORDS: &str = "/rest/v2/insertRecords";
const REST_OK: i64 = 200;

// A history over more than this span runs an existence probe first.
const PROBE_SPAN_HOURS: i64 = 4;

/// Columnar query response: `values[column][row]`.
#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    expressions: Option<Vec<String>>,
    #[serde(default)]
    column_names: Option<Vec<String>>,
    #[serde(default)]
    timestamps: Option<Vec<i64>>,
    #[serde(default)]
    values: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

impl QueryResponse {
    fn row_count(&self) -> usize {
        self.timestamps
            .as_ref()
            .map(Vec::len)
            .or_else(|| self.values.as_ref().and_then(|v| v.first().map(Vec::len)))
            .unwrap_or(0)
    }

    /// Locate a column by its reported name or select-expression suffix.
    fn column(&self, name: &str) -> Option<usize> {
        let matches = |label: &String| {
            label.eq_ignore_ascii_case(name)
                || label
                    .rsplit('.')
                    .next()
                    .is_some_and(|tail| tail.eq_ignore_ascii_case(name))
        };
        if let Some(names) = &self.column_names {
            if let Some(idx) = names.iter().position(matches) {
                return Some(idx);
            }
        }
        self.expressions
            .as_ref()
            .and_then(|exprs| exprs.iter().position(matches))
    }

    fn cell(&self, column: usize, row: usize) -> Option<&Value> {
        self.values.as_ref()?.get(column)?.get(row)
    }
}

#[derive(Debug, Deserialize)]
struct ExecStatus {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Store nulls and the literal `NULL` marker decode to `NaN`; analog
/// values round to `digits`.
fn cell_to_f64(cell: &Value, digits: i32) -> f64 {
    match cell {
        Value::Number(n) => n.as_f64().map_or(f64::NAN, |v| round_digits(v, digits)),
        Value::String(s) if s == "NULL" => f64::NAN,
        Value::String(s) => s
            .parse::<f64>()
            .map_or(f64::NAN, |v| round_digits(v, digits)),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => f64::NAN,
    }
}

fn cell_to_i64(cell: &Value) -> Option<i64> {
    match cell {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Tag and attribute payloads arrive as JSON text; anything malformed
/// reads as an empty payload rather than a failure.
fn parse_payload(cell: Option<&Value>) -> Map<String, Value> {
    let parsed = match cell {
        Some(Value::Object(map)) => Some(map.clone()),
        Some(Value::String(text)) if !text.is_empty() && text != "NULL" && text != "null" => {
            serde_json::from_str::<Map<String, Value>>(&text.replace('\\', "/")).ok()
        }
        _ => None,
    };
    parsed.unwrap_or_default()
}

fn payload_str(payload: &Map<String, Value>, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn payload_f64(payload: &Map<String, Value>, key: &str) -> Option<f64> {
    match payload.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// IoTDB client speaking the REST v2 endpoints with Basic auth.
pub struct IoTdbBackend {
    client: Client,
    base_url: String,
    fetch_size: u32,
}

impl IoTdbBackend {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let credentials = BASE64.encode(format!("{}:{}", config.username, config.password));
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Basic {}", credentials))
                .context("invalid store credentials")?,
        );

        let client = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(StdDuration::from_secs(90))
            .connect_timeout(StdDuration::from_millis(config.connect_timeout_ms()))
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.http_base(),
            fetch_size: config.fetch_size,
        })
    }

    fn device_path(device: &str) -> String {
        format!("root.{}", device)
    }

    async fn query(&self, sql: &str) -> Result<QueryResponse> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, REST_QUERY))
            .json(&json!({ "sql": sql, "rowLimit": self.fetch_size }))
            .send()
            .await
            .with_context(|| format!("query failed: {}", sql))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("query '{}' failed with status {}: {}", sql, status, text);
        }
        let body: QueryResponse = response.json().await.context("malformed query response")?;
        if let Some(code) = body.code {
            if code != REST_OK && body.values.is_none() {
                bail!(
                    "query '{}' rejected by store ({}): {}",
                    sql,
                    code,
                    body.message.unwrap_or_default()
                );
            }
        }
        Ok(body)
    }

    async fn non_query(&self, sql: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, REST_NON_QUERY))
            .json(&json!({ "sql": sql }))
            .send()
            .await
            .with_context(|| format!("statement failed: {}", sql))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("statement '{}' failed with status {}: {}", sql, status, text);
        }
        let status: ExecStatus = response
            .json()
            .await
            .context("malformed statement response")?;
        if status.code != REST_OK {
            bail!(
                "statement '{}' rejected by store ({}): {}",
                sql,
                status.code,
                status.message
            );
        }
        Ok(())
    }

    async fn insert(&self, endpoint: &str, body: &Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(body)
            .send()
            .await
            .context("insert failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("insert failed with status {}: {}", status, text);
        }
        let status: ExecStatus = response.json().await.context("malformed insert response")?;
        if status.code != REST_OK {
            bail!("insert rejected by store ({}): {}", status.code, status.message);
        }
        Ok(())
    }

    /// Decode a timestamps-plus-one-value-column response into samples.
    fn decode_series(response: &QueryResponse, digits: i32) -> Vec<Sample> {
        let Some(timestamps) = &response.timestamps else {
            return Vec::new();
        };
        let mut data = Vec::with_capacity(timestamps.len());
        for (row, &ms) in timestamps.iter().enumerate() {
            let Some(time) = from_epoch_millis(ms) else {
                continue;
            };
            let value = response
                .cell(0, row)
                .map_or(f64::NAN, |cell| cell_to_f64(cell, digits));
            data.push(Sample::new(time, value));
        }
        data
    }
}

#[async_trait]
impl TimeSeriesBackend for IoTdbBackend {
    async fn open(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/ping", self.base_url))
            .send()
            .await
            .context("store is unreachable")?;
        Ok(response.status().is_success())
    }

    async fn close(&self) -> Result<bool> {
        Ok(true)
    }

    async fn drop_device(&self, device: &str) -> Result<bool> {
        self.non_query(&format!(
            "delete storage group {}",
            Self::device_path(device)
        ))
        .await?;
        Ok(true)
    }

    async fn initialize(&self, device: &str, measurements: &[Measurement]) -> Result<()> {
        // A brand-new device has no series to list; treat a failed listing
        // as an empty catalog.
        let existing = match self.points(device, "").await {
            Ok(points) => points,
            Err(e) => {
                warn!("listing '{}' before initialize failed: {}", device, e);
                Vec::new()
            }
        };
        let path = Self::device_path(device);
        let stamp = format_time(Local::now().naive_local());
        for m in measurements {
            let series_tags = format!(
                "tags (t='{}', u='{}', d='{}', @t='{}')",
                m.kind.as_code(),
                m.unit,
                m.desc,
                stamp
            );
            let mut sql = if existing.iter().any(|p| p.tag == m.tag) {
                format!("alter timeseries {}.{} upsert {}", path, m.tag, series_tags)
            } else {
                format!(
                    "create timeseries {}.{} with datatype=DOUBLE {}",
                    path, m.tag, series_tags
                )
            };
            if let (Some(down), Some(up)) = (m.downlimit, m.uplimit) {
                sql.push_str(&format!(" attributes (l='{}', h='{}')", down, up));
            }
            self.non_query(&sql).await?;
            debug!("initialize {} -> {}", device, sql);
        }
        Ok(())
    }

    async fn bulk_write(&self, device: &str, matrix: &BulkWriteMatrix) -> Result<()> {
        let path = Self::device_path(device);
        match matrix {
            BulkWriteMatrix::MultiTagSnapshot { tags, time, values } => {
                // One multi-measurement record at a single instant.
                let body = json!({
                    "prefix_paths": [path],
                    "timestamps": [epoch_millis(*time)],
                    "measurements_list": [tags],
                    "data_types_list": [vec!["DOUBLE"; tags.len()]],
                    "values_list": [values],
                    "is_aligned": false,
                });
                self.insert(REST_INSERT_RECORDS, &body).await
            }
            BulkWriteMatrix::SingleTagSeries { tag, rows } => {
                if rows.is_empty() {
                    return Ok(());
                }
                // One batched columnar tablet for throughput.
                let timestamps: Vec<i64> = rows.iter().map(|s| epoch_millis(s.time)).collect();
                let column: Vec<f64> = rows.iter().map(|s| s.value).collect();
                let body = json!({
                    "device": path,
                    "timestamps": timestamps,
                    "measurements": [tag],
                    "data_types": ["DOUBLE"],
                    "values": [column],
                    "is_aligned": false,
                });
                self.insert(REST_INSERT_TABLET, &body).await
            }
        }
    }

    async fn points(&self, device: &str, keywords: &str) -> Result<Vec<Measurement>> {
        let filter = TagFilter::new(keywords)?;
        let path = Self::device_path(device);
        let response = self.query(&format!("show timeseries {}", path)).await?;

        let name_col = response.column("timeseries").unwrap_or(0);
        let column_count = response.values.as_ref().map_or(0, Vec::len);
        let tags_col = response
            .column("tags")
            .unwrap_or(column_count.saturating_sub(2));
        let attrs_col = response
            .column("attributes")
            .unwrap_or(column_count.saturating_sub(1));
        let prefix = format!("{}.", path);

        let mut points = Vec::new();
        for row in 0..response.row_count() {
            let Some(full) = response.cell(name_col, row).and_then(Value::as_str) else {
                continue;
            };
            let tag = full.strip_prefix(&prefix).unwrap_or(full);
            if !filter.matches(tag) {
                continue;
            }
            let series_tags = parse_payload(response.cell(tags_col, row));
            let attributes = parse_payload(response.cell(attrs_col, row));
            points.push(Measurement {
                tag: tag.to_string(),
                kind: PointType::from_code(&payload_str(&series_tags, "t")),
                desc: payload_str(&series_tags, "d"),
                unit: payload_str(&series_tags, "u"),
                downlimit: payload_f64(&attributes, "l"),
                uplimit: payload_f64(&attributes, "h"),
                modify_time: series_tags
                    .get("@t")
                    .and_then(Value::as_str)
                    .and_then(parse_time),
            });
        }
        points.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(points)
    }

    async fn snapshot(&self, device: &str, tags: &[String]) -> Result<Vec<SnapshotRecord>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let path = Self::device_path(device);
        let sql = format!("select last {} from {}", tags.join(","), path);
        let response = self.query(&sql).await?;

        let name_col = response.column("timeseries").unwrap_or(0);
        let value_col = response.column("value").unwrap_or(1);
        let prefix = format!("{}.", path);
        let timestamps = response.timestamps.clone().unwrap_or_default();

        let mut data = Vec::with_capacity(timestamps.len());
        for (row, &ms) in timestamps.iter().enumerate() {
            let Some(full) = response.cell(name_col, row).and_then(Value::as_str) else {
                continue;
            };
            let Some(time) = from_epoch_millis(ms) else {
                continue;
            };
            let value = response
                .cell(value_col, row)
                .map_or(f64::NAN, |cell| cell_to_f64(cell, 6));
            data.push(SnapshotRecord {
                tag: full.strip_prefix(&prefix).unwrap_or(full).to_string(),
                time,
                value,
            });
        }
        Ok(data)
    }

    async fn archive(
        &self,
        device: &str,
        tag: &str,
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
    ) -> Result<Vec<Sample>> {
        let sql = format!(
            "select {} from {} where time >= {} and time <= {}",
            tag,
            Self::device_path(device),
            epoch_millis(begin),
            epoch_millis(end)
        );
        let response = self.query(&sql).await?;
        Ok(Self::decode_series(&response, digits))
    }

    async fn history(
        &self,
        device: &str,
        tag: &str,
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
        interval_ms: i64,
    ) -> Result<Vec<Sample>> {
        if interval_ms <= 0 || end < begin {
            return Ok(Vec::new());
        }
        let path = Self::device_path(device);

        // Long ranges get a cheap existence probe before the bucketed scan.
        if end - begin > Duration::hours(PROBE_SPAN_HOURS) {
            let sql = format!(
                "select count({}) from {} where time >= {} and time < {}",
                tag,
                path,
                epoch_millis(begin),
                epoch_millis(end)
            );
            let response = self.query(&sql).await?;
            let count = response.cell(0, 0).and_then(cell_to_i64).unwrap_or(0);
            if count == 0 {
                return Ok(Vec::new());
            }
        }

        let sql = format!(
            "select last_value({}) from {} group by ([{}, {}), {}ms) fill(previous)",
            tag,
            path,
            epoch_millis(begin),
            epoch_millis(end + Duration::milliseconds(interval_ms)),
            interval_ms
        );
        let response = self.query(&sql).await?;
        Ok(Self::decode_series(&response, digits))
    }

    fn backend_type(&self) -> &str {
        "iotdb"
    }
}
