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

// CouchDB backend: a generic document store repurposed as a time-series
// engine via a per-tag-per-day bucketed document schema

use crate::client::TimeSeriesBackend;
use crate::config::ConnectionConfig;
use crate::matrix::BulkWriteMatrix;
use crate::model::{
    format_time, parse_time, round_digits, Measurement, PointType, Sample, SnapshotRecord,
};
use crate::pattern::{exact_any, TagFilter};
use crate::resample::fill;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

const DB_POINT: &str = "point";
const DB_SNAPSHOT: &str = "snapshot";
const DB_ARCHIVE: &str = "archive";
const BUCKET_DATE_FMT: &str = "%Y%m%d";
// Upper bound for catalog listings; devices stay far below this.
const CATALOG_LIMIT: usize = 100_000;

/// One calendar day of samples for one tag.
///
/// Stored as `{_id: "tag#YYYYMMDD", date, HH: {MM: {SS: value}}}` with
/// zero-padded two-digit keys, so lexical key order equals chronological
/// order. In memory the three nesting levels flatten to a map keyed by
/// second-of-day. A bucket never spans a day boundary and holds at most
/// one value per second; a later write in the same second overwrites.
#[derive(Debug, Clone, PartialEq)]
pub struct DayBucket {
    pub id: String,
    pub date: NaiveDate,
    pub rev: Option<String>,
    seconds: BTreeMap<u32, Value>,
}

impl DayBucket {
    pub fn key(tag: &str, date: NaiveDate) -> String {
        format!("{}#{}", tag, date.format(BUCKET_DATE_FMT))
    }

    pub fn new(tag: &str, date: NaiveDate) -> Self {
        Self {
            id: Self::key(tag, date),
            date,
            rev: None,
            seconds: BTreeMap::new(),
        }
    }

    /// Set the value for `time`'s second of day. The caller guarantees the
    /// timestamp falls on this bucket's date.
    pub fn set(&mut self, time: NaiveDateTime, value: f64) {
        self.seconds.insert(
            time.time().num_seconds_from_midnight(),
            serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.seconds.is_empty()
    }

    /// Encode to the nested wire shape.
    pub fn to_doc(&self) -> Value {
        let mut root = Map::new();
        root.insert("_id".to_string(), Value::String(self.id.clone()));
        if let Some(rev) = &self.rev {
            root.insert("_rev".to_string(), Value::String(rev.clone()));
        }
        root.insert(
            "date".to_string(),
            Value::String(self.date.format("%Y-%m-%d").to_string()),
        );
        for (&sod, value) in &self.seconds {
            let hh = format!("{:02}", sod / 3600);
            let mm = format!("{:02}", sod % 3600 / 60);
            let ss = format!("{:02}", sod % 60);
            let hours = root
                .entry(hh)
                .or_insert_with(|| Value::Object(Map::new()));
            let Some(minutes) = hours.as_object_mut() else {
                continue;
            };
            let minute = minutes
                .entry(mm)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(slot) = minute.as_object_mut() {
                slot.insert(ss, value.clone());
            }
        }
        Value::Object(root)
    }

    /// Decode the nested wire shape back to the flat second-of-day map.
    /// Non-document top-level fields (`_id`, `_rev`, `date`) are skipped;
    /// unparsable keys are ignored rather than fatal.
    pub fn from_doc(doc: &Value) -> Result<Self> {
        let obj = doc.as_object().context("day bucket is not a document")?;
        let id = obj
            .get("_id")
            .and_then(Value::as_str)
            .context("day bucket is missing _id")?
            .to_string();
        let rev = obj.get("_rev").and_then(Value::as_str).map(String::from);
        let date = obj
            .get("date")
            .and_then(Value::as_str)
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .with_context(|| format!("day bucket '{}' has no parsable date", id))?;

        let mut seconds = BTreeMap::new();
        for (hk, hv) in obj {
            let (Some(hour), Some(minutes)) = (two_digit(hk), hv.as_object()) else {
                continue;
            };
            for (mk, mv) in minutes {
                let (Some(minute), Some(leaves)) = (two_digit(mk), mv.as_object()) else {
                    continue;
                };
                for (sk, sv) in leaves {
                    if let Some(second) = two_digit(sk) {
                        seconds.insert(hour * 3600 + minute * 60 + second, sv.clone());
                    }
                }
            }
        }
        Ok(Self {
            id,
            date,
            rev,
            seconds,
        })
    }

    /// Chronologically ordered samples, decoded per the tag's type. `NaN`
    /// leaves are kept; classification happens at the scan layer.
    pub fn samples(&self, kind: PointType, digits: i32) -> Vec<Sample> {
        self.seconds
            .iter()
            .filter_map(|(&sod, value)| {
                let time = NaiveTime::from_num_seconds_from_midnight_opt(sod, 0)?;
                Some(Sample::new(self.date.and_time(time), decode_typed(value, kind, digits)))
            })
            .collect()
    }
}

// Leading two digits of a bucket key; tolerates legacy sub-second suffixes.
fn two_digit(key: &str) -> Option<u32> {
    key.get(..2).and_then(|s| s.parse().ok())
}

/// Decode a stored leaf: double, integer, numeric string or boolean.
/// Analog values round to `digits`; anything unrecognized is `NaN`.
pub fn decode_value(value: &Value, digits: i32) -> f64 {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i as f64
            } else {
                n.as_f64().map_or(f64::NAN, |v| round_digits(v, digits))
            }
        }
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

/// Digital decode: truncated integer, defaulting to 0 when unreadable.
pub fn decode_digital(value: &Value) -> f64 {
    let v = decode_value(value, 0);
    if v.is_nan() {
        0.0
    } else {
        v.trunc()
    }
}

fn decode_typed(value: &Value, kind: PointType, digits: i32) -> f64 {
    match kind {
        PointType::Digital => decode_digital(value),
        PointType::Analog => decode_value(value, digits),
    }
}

/// Calendar days spanned by `[begin, end]`, per the bucket key convention.
fn days_spanning(begin: NaiveDateTime, end: NaiveDateTime) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut day = begin.date();
    loop {
        days.push(day);
        let Some(next) = day.succ_opt() else { break };
        if next.and_time(NaiveTime::MIN) >= end {
            break;
        }
        day = next;
    }
    days
}

// Document ids carry '#', which must not terminate the URL path early.
fn encode_id(id: &str) -> String {
    id.replace('%', "%25")
        .replace('#', "%23")
        .replace('/', "%2F")
        .replace('+', "%2B")
}

struct ArchiveScan {
    samples: Vec<Sample>,
    carry_left: Option<f64>,
    carry_right: Option<f64>,
}

/// Pad an in-range series so both window borders carry a value.
///
/// With no in-range sample, both borders take one synthesized value:
/// carry-left, else the previous day's last value, else carry-right, else
/// `NaN` (which the fill grid then collapses to an empty series). A partial
/// window left-pads `begin` with carry-left / previous-day / the first
/// in-range value, and right-pads `end` holding the last in-range value.
fn pad_history_window(
    mut series: Vec<Sample>,
    carry_left: Option<f64>,
    previous_day: Option<f64>,
    carry_right: Option<f64>,
    begin: NaiveDateTime,
    end: NaiveDateTime,
) -> Vec<Sample> {
    let left = carry_left.or(previous_day);
    if series.is_empty() {
        let value = left.or(carry_right).unwrap_or(f64::NAN);
        series.push(Sample::new(begin, value));
        series.push(Sample::new(end, value));
        return series;
    }
    if series[0].time != begin {
        let value = left.unwrap_or(series[0].value);
        series.insert(0, Sample::new(begin, value));
    }
    let last = series[series.len() - 1];
    if last.time != end {
        series.push(Sample::new(end, last.value));
    }
    series
}

/// CouchDB-backed store client. Three databases per device
/// (`{device}_point`, `{device}_snapshot`, `{device}_archive`).
pub struct CouchBackend {
    client: Client,
    base_url: String,
}

impl CouchBackend {
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
        })
    }

    // Store database names must be lowercase.
    fn db_name(device: &str, collection: &str) -> String {
        format!("{}_{}", device.to_lowercase(), collection)
    }

    fn db_url(&self, device: &str, collection: &str) -> String {
        format!("{}/{}", self.base_url, Self::db_name(device, collection))
    }

    fn doc_url(&self, device: &str, collection: &str, id: &str) -> String {
        format!("{}/{}", self.db_url(device, collection), encode_id(id))
    }

    async fn get_doc(&self, device: &str, collection: &str, id: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .get(self.doc_url(device, collection, id))
            .send()
            .await
            .context("document fetch failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("document fetch failed with status {}: {}", status, text);
        }
        Ok(Some(response.json().await.context("malformed document")?))
    }

    async fn put_doc(&self, device: &str, collection: &str, id: &str, doc: &Value) -> Result<()> {
        let response = self
            .client
            .put(self.doc_url(device, collection, id))
            .json(doc)
            .send()
            .await
            .context("document write failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("document write failed with status {}: {}", status, text);
        }
        Ok(())
    }

    /// Read-rev-then-replace upsert; every write overwrites the document.
    async fn upsert_doc(
        &self,
        device: &str,
        collection: &str,
        id: &str,
        mut body: Map<String, Value>,
    ) -> Result<()> {
        body.insert("_id".to_string(), Value::String(id.to_string()));
        if let Some(existing) = self.get_doc(device, collection, id).await? {
            if let Some(rev) = existing.get("_rev").and_then(Value::as_str) {
                body.insert("_rev".to_string(), Value::String(rev.to_string()));
            }
        }
        self.put_doc(device, collection, id, &Value::Object(body))
            .await
    }

    async fn ensure_db(&self, device: &str, collection: &str) -> Result<()> {
        let response = self
            .client
            .put(self.db_url(device, collection))
            .send()
            .await
            .context("database create failed")?;
        // 412: already exists
        if response.status().is_success() || response.status() == StatusCode::PRECONDITION_FAILED {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("database create failed with status {}: {}", status, text)
        }
    }

    async fn delete_db(&self, device: &str, collection: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.db_url(device, collection))
            .send()
            .await
            .context("database delete failed")?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("database delete failed with status {}: {}", status, text)
        }
    }

    /// Mango `_find`; an absent database reads as empty.
    async fn find(
        &self,
        device: &str,
        collection: &str,
        selector: Value,
        limit: usize,
        fields: Option<Value>,
    ) -> Result<Vec<Value>> {
        let mut body = json!({ "selector": selector, "limit": limit });
        if let Some(fields) = fields {
            body["fields"] = fields;
        }
        let response = self
            .client
            .post(format!("{}/_find", self.db_url(device, collection)))
            .json(&body)
            .send()
            .await
            .context("find query failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("find query failed with status {}: {}", status, text);
        }
        let body: Value = response.json().await.context("malformed find response")?;
        Ok(body
            .get("docs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Fetch the day buckets for one tag across `days` in a single
    /// bulk-keyed query. Missing days simply produce no row.
    async fn read_buckets(
        &self,
        device: &str,
        tag: &str,
        days: &[NaiveDate],
    ) -> Result<Vec<DayBucket>> {
        let keys: Vec<String> = days.iter().map(|&d| DayBucket::key(tag, d)).collect();
        let response = self
            .client
            .post(format!(
                "{}/_all_docs?include_docs=true",
                self.db_url(device, DB_ARCHIVE)
            ))
            .json(&json!({ "keys": keys }))
            .send()
            .await
            .context("bucket fetch failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            bail!("bucket fetch failed with status {}: {}", status, text);
        }
        let body: Value = response.json().await.context("malformed bucket response")?;
        let rows = body
            .get("rows")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut buckets = Vec::new();
        for row in rows {
            let Some(doc) = row.get("doc").filter(|d| d.is_object()) else {
                continue;
            };
            match DayBucket::from_doc(doc) {
                Ok(bucket) => buckets.push(bucket),
                Err(e) => warn!("skipping undecodable day bucket: {}", e),
            }
        }
        buckets.sort_by_key(|b| b.date);
        Ok(buckets)
    }

    /// Declared type of a tag, exact case-insensitive catalog match.
    /// Any failure degrades to analog with a warning, never an error.
    async fn tag_type(&self, device: &str, tag: &str) -> PointType {
        let selector = json!({ "_id": { "$regex": format!("(?i)^{}$", regex::escape(tag)) } });
        match self
            .find(device, DB_POINT, selector, 1, Some(json!(["_id", "type"])))
            .await
        {
            Ok(docs) => docs
                .first()
                .and_then(|doc| doc.get("type"))
                .and_then(Value::as_str)
                .map_or_else(
                    || {
                        debug!("tag '{}' has no catalog type, assuming analog", tag);
                        PointType::Analog
                    },
                    PointType::from_code,
                ),
            Err(e) => {
                warn!("type lookup for '{}' failed, assuming analog: {}", tag, e);
                PointType::Analog
            }
        }
    }

    /// Scan the buckets over `[begin, end]`, keeping the nearest values on
    /// either side of the window. Bucket key order is chronological, so
    /// the first sample past `end` terminates the scan.
    async fn scan_archive(
        &self,
        device: &str,
        tag: &str,
        kind: PointType,
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
    ) -> Result<ArchiveScan> {
        let days = days_spanning(begin, end);
        let buckets = self.read_buckets(device, tag, &days).await?;

        let mut scan = ArchiveScan {
            samples: Vec::new(),
            carry_left: None,
            carry_right: None,
        };
        'outer: for bucket in &buckets {
            for sample in bucket.samples(kind, digits) {
                if sample.value.is_nan() {
                    continue;
                }
                if sample.time < begin {
                    scan.carry_left = Some(sample.value);
                    continue;
                }
                if sample.time > end {
                    scan.carry_right = Some(sample.value);
                    break 'outer;
                }
                scan.samples.push(sample);
            }
        }
        Ok(scan)
    }

    /// Last stored value of `day`, for the previous-day probe of History's
    /// edge synthesis.
    async fn last_of_day(
        &self,
        device: &str,
        tag: &str,
        kind: PointType,
        day: NaiveDate,
        digits: i32,
    ) -> Result<Option<Sample>> {
        let Some(doc) = self
            .get_doc(device, DB_ARCHIVE, &DayBucket::key(tag, day))
            .await?
        else {
            return Ok(None);
        };
        let bucket = DayBucket::from_doc(&doc)?;
        Ok(bucket.samples(kind, digits).into_iter().last())
    }

    async fn write_bucket(
        &self,
        device: &str,
        tag: &str,
        day: NaiveDate,
        entries: &[(NaiveDateTime, f64)],
    ) -> Result<()> {
        let key = DayBucket::key(tag, day);
        let mut bucket = match self.get_doc(device, DB_ARCHIVE, &key).await? {
            Some(doc) => DayBucket::from_doc(&doc)
                .with_context(|| format!("existing day bucket '{}' is undecodable", key))?,
            None => DayBucket::new(tag, day),
        };
        for &(time, value) in entries {
            bucket.set(time, value);
        }
        self.put_doc(device, DB_ARCHIVE, &key, &bucket.to_doc())
            .await
    }

    async fn write_snapshot(
        &self,
        device: &str,
        tag: &str,
        time: NaiveDateTime,
        value: f64,
    ) -> Result<()> {
        let mut body = Map::new();
        body.insert("time".to_string(), Value::String(format_time(time)));
        body.insert(
            "value".to_string(),
            serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number),
        );
        self.upsert_doc(device, DB_SNAPSHOT, tag, body).await
    }
}

// Tolerant catalog field coercion. Missing and null read as defaults;
// a present-but-unreadable field is a decode failure for that record.
fn field_str(doc: &Value, field: &str) -> Result<String> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => bail!("field '{}' is not a string: {}", field, other),
    }
}

fn field_f64(doc: &Value, field: &str) -> Result<Option<f64>> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .with_context(|| format!("field '{}' holds unparsable number '{}'", field, s)),
        Some(other) => bail!("field '{}' is not numeric: {}", field, other),
    }
}

fn field_time(doc: &Value, field: &str) -> Result<Option<NaiveDateTime>> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(parse_time(s)),
        Some(other) => bail!("field '{}' is not a timestamp: {}", field, other),
    }
}

#[async_trait]
impl TimeSeriesBackend for CouchBackend {
    async fn open(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .context("store is unreachable")?;
        Ok(response.status().is_success())
    }

    async fn close(&self) -> Result<bool> {
        Ok(true)
    }

    async fn drop_device(&self, device: &str) -> Result<bool> {
        for collection in [DB_POINT, DB_SNAPSHOT, DB_ARCHIVE] {
            self.delete_db(device, collection).await?;
        }
        Ok(true)
    }

    async fn initialize(&self, device: &str, measurements: &[Measurement]) -> Result<()> {
        for collection in [DB_POINT, DB_SNAPSHOT, DB_ARCHIVE] {
            self.ensure_db(device, collection).await?;
        }
        let stamp = format_time(Local::now().naive_local());
        for m in measurements {
            let mut body = Map::new();
            body.insert("type".to_string(), json!(m.kind.as_code()));
            body.insert("desc".to_string(), json!(m.desc));
            body.insert("unit".to_string(), json!(m.unit));
            body.insert("downlimit".to_string(), json!(m.downlimit));
            body.insert("uplimit".to_string(), json!(m.uplimit));
            body.insert("@modifyTime".to_string(), json!(stamp));
            self.upsert_doc(device, DB_POINT, &m.tag, body).await?;
        }
        Ok(())
    }

    async fn bulk_write(&self, device: &str, matrix: &BulkWriteMatrix) -> Result<()> {
        match matrix {
            BulkWriteMatrix::MultiTagSnapshot { tags, time, values } => {
                for (tag, &value) in tags.iter().zip(values) {
                    self.write_bucket(device, tag, time.date(), &[(*time, value)])
                        .await?;
                    self.write_snapshot(device, tag, *time, value).await?;
                }
                Ok(())
            }
            BulkWriteMatrix::SingleTagSeries { tag, rows } => {
                if rows.is_empty() {
                    return Ok(());
                }
                // One replace per touched calendar day.
                let mut by_day: BTreeMap<NaiveDate, Vec<(NaiveDateTime, f64)>> = BTreeMap::new();
                for sample in rows {
                    by_day
                        .entry(sample.time.date())
                        .or_default()
                        .push((sample.time, sample.value));
                }
                for (day, entries) in &by_day {
                    self.write_bucket(device, tag, *day, entries).await?;
                }
                let last = rows[rows.len() - 1];
                self.write_snapshot(device, tag, last.time, last.value).await
            }
        }
    }

    async fn points(&self, device: &str, keywords: &str) -> Result<Vec<Measurement>> {
        let filter = TagFilter::new(keywords)?;
        let selector = if filter.source().is_empty() {
            json!({ "_id": { "$gt": null } })
        } else {
            json!({ "_id": { "$regex": format!("(?i){}", filter.source()) } })
        };
        let fields = json!(["_id", "type", "desc", "unit", "downlimit", "uplimit", "@modifyTime"]);
        let docs = self
            .find(device, DB_POINT, selector, CATALOG_LIMIT, Some(fields))
            .await?;

        let mut points = Vec::with_capacity(docs.len());
        for doc in docs {
            let decoded = (|| -> Result<Measurement> {
                Ok(Measurement {
                    tag: field_str(&doc, "_id")?,
                    kind: PointType::from_code(&field_str(&doc, "type")?),
                    desc: field_str(&doc, "desc")?,
                    unit: field_str(&doc, "unit")?,
                    downlimit: field_f64(&doc, "downlimit")?,
                    uplimit: field_f64(&doc, "uplimit")?,
                    modify_time: field_time(&doc, "@modifyTime")?,
                })
            })();
            match decoded {
                Ok(point) => points.push(point),
                Err(e) => bail!("failed to decode catalog record {}: {}", doc, e),
            }
        }
        points.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(points)
    }

    async fn snapshot(&self, device: &str, tags: &[String]) -> Result<Vec<SnapshotRecord>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let mut unique: Vec<String> = Vec::new();
        for tag in tags {
            if !unique.contains(tag) {
                unique.push(tag.clone());
            }
        }
        let selector = json!({ "_id": { "$regex": format!("(?i){}", exact_any(&unique)) } });
        let docs = self
            .find(device, DB_SNAPSHOT, selector, unique.len(), None)
            .await?;

        let mut data = Vec::new();
        for doc in docs {
            let Some(tag) = doc.get("_id").and_then(Value::as_str) else {
                continue;
            };
            let Some(time) = doc
                .get("time")
                .and_then(Value::as_str)
                .and_then(parse_time)
            else {
                continue;
            };
            let Some(value) = doc.get("value") else {
                continue;
            };
            data.push(SnapshotRecord {
                tag: tag.to_string(),
                time,
                value: decode_value(value, 6),
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
        let kind = self.tag_type(device, tag).await;
        let scan = self
            .scan_archive(device, tag, kind, begin, end, digits)
            .await?;
        Ok(scan.samples)
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
        let kind = self.tag_type(device, tag).await;
        let scan = self
            .scan_archive(device, tag, kind, begin, end, digits)
            .await?;

        // Probe the previous day only when nothing carries into the left
        // edge of the window.
        let needs_left = scan.samples.first().map_or(true, |s| s.time != begin);
        let mut previous_day = None;
        if scan.carry_left.is_none() && needs_left {
            if let Some(prev) = begin.date().pred_opt() {
                previous_day = self
                    .last_of_day(device, tag, kind, prev, digits)
                    .await?
                    .map(|s| s.value);
            }
        }

        let series = pad_history_window(
            scan.samples,
            scan.carry_left,
            previous_day,
            scan.carry_right,
            begin,
            end,
        );
        Ok(fill(&series, begin, end, interval_ms))
    }

    fn backend_type(&self) -> &str {
        "couchdb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> NaiveDateTime {
        parse_time(s).unwrap()
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_bucket_key_and_day_boundary() {
        assert_eq!(DayBucket::key("TEMP1", day("2024-03-05")), "TEMP1#20240305");
        let days = days_spanning(dt("2024-03-05 23:00:00"), dt("2024-03-07 01:00:00"));
        assert_eq!(
            days,
            vec![day("2024-03-05"), day("2024-03-06"), day("2024-03-07")]
        );
        // single-day window
        assert_eq!(
            days_spanning(dt("2024-03-05 01:00:00"), dt("2024-03-05 23:00:00")),
            vec![day("2024-03-05")]
        );
        // end exactly at the next midnight does not pull in the next day
        assert_eq!(
            days_spanning(dt("2024-03-05 12:00:00"), dt("2024-03-06 00:00:00")),
            vec![day("2024-03-05")]
        );
    }

    #[test]
    fn test_bucket_doc_round_trip() {
        let mut bucket = DayBucket::new("TEMP1", day("2024-03-05"));
        bucket.set(dt("2024-03-05 08:30:45"), 1.25);
        bucket.set(dt("2024-03-05 08:30:46"), 2.5);
        bucket.set(dt("2024-03-05 23:59:59"), -3.0);

        let doc = bucket.to_doc();
        assert_eq!(doc["_id"], "TEMP1#20240305");
        assert_eq!(doc["date"], "2024-03-05");
        assert_eq!(doc["08"]["30"]["45"], 1.25);
        assert_eq!(doc["23"]["59"]["59"], -3.0);

        let back = DayBucket::from_doc(&doc).unwrap();
        assert_eq!(back, bucket);
        let samples = back.samples(PointType::Analog, 6);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], Sample::new(dt("2024-03-05 08:30:45"), 1.25));
        assert_eq!(samples[2], Sample::new(dt("2024-03-05 23:59:59"), -3.0));
    }

    #[test]
    fn test_bucket_same_second_overwrites() {
        let mut bucket = DayBucket::new("T", day("2024-03-05"));
        bucket.set(dt("2024-03-05 10:00:00"), 1.0);
        bucket.set(dt("2024-03-05 10:00:00"), 2.0);
        let samples = bucket.samples(PointType::Analog, 6);
        assert_eq!(samples, vec![Sample::new(dt("2024-03-05 10:00:00"), 2.0)]);
    }

    #[test]
    fn test_decode_value_variants() {
        assert_eq!(decode_value(&json!(1.234_567_89), 3), 1.235);
        assert_eq!(decode_value(&json!(42), 3), 42.0);
        assert_eq!(decode_value(&json!("3.14159"), 2), 3.14);
        assert_eq!(decode_value(&json!(true), 6), 1.0);
        assert_eq!(decode_value(&json!(false), 6), 0.0);
        assert!(decode_value(&Value::Null, 6).is_nan());
        assert!(decode_value(&json!("not a number"), 6).is_nan());
        assert!(decode_value(&json!({}), 6).is_nan());
    }

    #[test]
    fn test_decode_digital() {
        assert_eq!(decode_digital(&json!(1.9)), 1.0);
        assert_eq!(decode_digital(&json!("1")), 1.0);
        assert_eq!(decode_digital(&json!(true)), 1.0);
        assert_eq!(decode_digital(&Value::Null), 0.0);
        assert_eq!(decode_digital(&json!("garbage")), 0.0);
    }

    #[test]
    fn test_bucket_tolerates_legacy_subsecond_keys() {
        let doc = json!({
            "_id": "T#20240305",
            "date": "2024-03-05",
            "10": { "00": { "05250": 7.0 } }
        });
        let bucket = DayBucket::from_doc(&doc).unwrap();
        let samples = bucket.samples(PointType::Analog, 6);
        assert_eq!(samples, vec![Sample::new(dt("2024-03-05 10:00:05"), 7.0)]);
    }

    #[test]
    fn test_history_padding_synthesizes_empty_window_from_carries() {
        let begin = dt("2024-03-05 10:00:00");
        let end = dt("2024-03-05 10:01:00");

        // only a value before the window
        let out = pad_history_window(Vec::new(), Some(5.0), None, None, begin, end);
        assert_eq!(out, vec![Sample::new(begin, 5.0), Sample::new(end, 5.0)]);

        // only a value after the window
        let out = pad_history_window(Vec::new(), None, None, Some(7.0), begin, end);
        assert_eq!(out, vec![Sample::new(begin, 7.0), Sample::new(end, 7.0)]);

        // only the previous day's last value
        let out = pad_history_window(Vec::new(), None, Some(3.0), None, begin, end);
        assert_eq!(out, vec![Sample::new(begin, 3.0), Sample::new(end, 3.0)]);

        // the in-window carry outranks the previous-day probe
        let out = pad_history_window(Vec::new(), Some(5.0), Some(3.0), Some(7.0), begin, end);
        assert_eq!(out[0].value, 5.0);
    }

    #[test]
    fn test_history_padding_unknown_edges_fill_to_empty() {
        let begin = dt("2024-03-05 10:00:00");
        let end = dt("2024-03-05 10:01:00");
        let out = pad_history_window(Vec::new(), None, None, None, begin, end);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|s| s.value.is_nan()));
        // an all-NaN synthesized window collapses to no data downstream
        assert!(fill(&out, begin, end, 1000).is_empty());
    }

    #[test]
    fn test_history_padding_pads_partial_window() {
        let begin = dt("2024-03-05 10:00:00");
        let end = dt("2024-03-05 10:01:00");
        let mid = dt("2024-03-05 10:00:30");

        // left pad from the carry, right pad holds the last in-range value
        // even when a value exists past the window
        let out = pad_history_window(
            vec![Sample::new(mid, 2.0)],
            Some(1.0),
            None,
            Some(9.0),
            begin,
            end,
        );
        assert_eq!(
            out,
            vec![
                Sample::new(begin, 1.0),
                Sample::new(mid, 2.0),
                Sample::new(end, 2.0),
            ]
        );

        // without any left carry the first in-range value holds backward
        let out = pad_history_window(vec![Sample::new(mid, 2.0)], None, None, None, begin, end);
        assert_eq!(out[0], Sample::new(begin, 2.0));

        // a series already touching both borders is untouched
        let exact = vec![Sample::new(begin, 1.0), Sample::new(end, 2.0)];
        let out = pad_history_window(exact.clone(), Some(8.0), None, Some(9.0), begin, end);
        assert_eq!(out, exact);
    }

    #[test]
    fn test_encode_id_escapes_reserved_characters() {
        assert_eq!(encode_id("TEMP1#20240305"), "TEMP1%2320240305");
        assert_eq!(encode_id("a/b+c%d"), "a%2Fb%2Bc%25d");
    }

    #[test]
    fn test_field_coercion() {
        let doc = json!({
            "_id": "T1", "type": "AI", "downlimit": "0.5", "uplimit": 10,
            "@modifyTime": "2024-03-05 08:00:00"
        });
        assert_eq!(field_str(&doc, "_id").unwrap(), "T1");
        assert_eq!(field_str(&doc, "desc").unwrap(), "");
        assert_eq!(field_f64(&doc, "downlimit").unwrap(), Some(0.5));
        assert_eq!(field_f64(&doc, "uplimit").unwrap(), Some(10.0));
        assert_eq!(field_f64(&doc, "missing").unwrap(), None);
        assert_eq!(
            field_time(&doc, "@modifyTime").unwrap(),
            Some(dt("2024-03-05 08:00:00"))
        );
        // present but unreadable is a decode failure
        let bad = json!({ "_id": "T1", "downlimit": { "nested": true } });
        assert!(field_f64(&bad, "downlimit").is_err());
    }
}
