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

// Unified backend contract and the client facade with the composed
// operations every backend gets for free

use crate::backend::{CouchBackend, IoTdbBackend};
use crate::config::{ConnectionConfig, Scheme};
use crate::matrix::BulkWriteMatrix;
use crate::model::{Measurement, Sample, SnapshotRecord};
use crate::resample::{fill, plot_reduce};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::warn;

/// Decimal precision applied to analog reads unless a caller overrides it.
pub const DEFAULT_DIGITS: i32 = 6;
/// Resampling interval for history reads.
pub const DEFAULT_INTERVAL_MS: i64 = 1000;
/// Screen pixel budget for plot reads.
pub const DEFAULT_PIXELS: usize = 1200;

/// Primitives any store backend must supply.
///
/// `history` ships with a default archive-plus-fill implementation so a
/// minimal backend only has to answer raw range queries; both bundled
/// backends override it (IoTDB pushes the aggregation down, CouchDB adds
/// day-boundary edge synthesis).
#[async_trait]
pub trait TimeSeriesBackend: Send + Sync {
    async fn open(&self) -> Result<bool>;

    async fn close(&self) -> Result<bool>;

    /// Delete a whole device (database/storage group) with its catalog.
    async fn drop_device(&self, device: &str) -> Result<bool>;

    /// Create or update the catalog entries for a device.
    async fn initialize(&self, device: &str, measurements: &[Measurement]) -> Result<()>;

    /// Persist one bulk-write matrix.
    async fn bulk_write(&self, device: &str, matrix: &BulkWriteMatrix) -> Result<()>;

    /// List catalog entries matching the keyword filter convention.
    async fn points(&self, device: &str, keywords: &str) -> Result<Vec<Measurement>>;

    /// Latest known value per requested tag.
    async fn snapshot(&self, device: &str, tags: &[String]) -> Result<Vec<SnapshotRecord>>;

    /// Raw irregularly-sampled series for one tag over `[begin, end]`.
    async fn archive(
        &self,
        device: &str,
        tag: &str,
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
    ) -> Result<Vec<Sample>>;

    /// Evenly spaced, gap-filled series derived from the archive.
    async fn history(
        &self,
        device: &str,
        tag: &str,
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
        interval_ms: i64,
    ) -> Result<Vec<Sample>> {
        let raw = self.archive(device, tag, begin, end, digits).await?;
        Ok(fill(&raw, begin, end, interval_ms))
    }

    /// Backend type identifier.
    fn backend_type(&self) -> &str;
}

/// Aligned multi-tag history: one row per grid instant, one column per tag.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMatrix {
    pub begin: NaiveDateTime,
    pub end: NaiveDateTime,
    pub tags: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

/// Facade over a scheme-selected backend.
pub struct TimeSeriesClient {
    url: String,
    backend: Arc<dyn TimeSeriesBackend>,
}

impl TimeSeriesClient {
    /// Create a client for the backend selected by the URL scheme.
    /// An unrecognized scheme is a fatal configuration error.
    pub fn create(url: &str) -> Result<Self> {
        let config = ConnectionConfig::parse(url)?;
        let backend: Arc<dyn TimeSeriesBackend> = match config.scheme {
            Scheme::IoTdb => Arc::new(IoTdbBackend::new(config)?),
            Scheme::CouchDb => Arc::new(CouchBackend::new(config)?),
        };
        Ok(Self {
            url: url.to_string(),
            backend,
        })
    }

    /// Wrap an already-built backend, mainly for tests and embedding.
    pub fn with_backend(backend: Arc<dyn TimeSeriesBackend>) -> Self {
        Self {
            url: String::new(),
            backend,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn backend_type(&self) -> &str {
        self.backend.backend_type()
    }

    pub async fn open(&self) -> Result<bool> {
        self.backend.open().await
    }

    pub async fn close(&self) -> Result<bool> {
        self.backend.close().await
    }

    pub async fn drop_device(&self, device: &str) -> Result<bool> {
        self.backend.drop_device(device).await
    }

    pub async fn initialize(&self, device: &str, measurements: &[Measurement]) -> Result<()> {
        self.backend.initialize(device, measurements).await
    }

    pub async fn bulk_write(&self, device: &str, matrix: &BulkWriteMatrix) -> Result<()> {
        self.backend.bulk_write(device, matrix).await
    }

    /// Write a time series for one tag.
    pub async fn bulk_write_series(
        &self,
        device: &str,
        tag: &str,
        rows: Vec<Sample>,
    ) -> Result<()> {
        let matrix = BulkWriteMatrix::series(tag, rows)?;
        self.backend.bulk_write(device, &matrix).await
    }

    /// Write many tags at one instant.
    pub async fn bulk_write_at(
        &self,
        device: &str,
        time: NaiveDateTime,
        data: Vec<(String, f64)>,
    ) -> Result<()> {
        let matrix = BulkWriteMatrix::snapshot_at(time, data)?;
        self.backend.bulk_write(device, &matrix).await
    }

    pub async fn points(&self, device: &str, keywords: &str) -> Result<Vec<Measurement>> {
        self.backend.points(device, keywords).await
    }

    pub async fn snapshot(&self, device: &str, tags: &[String]) -> Result<Vec<SnapshotRecord>> {
        self.backend.snapshot(device, tags).await
    }

    pub async fn archive(
        &self,
        device: &str,
        tag: &str,
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
    ) -> Result<Vec<Sample>> {
        self.backend.archive(device, tag, begin, end, digits).await
    }

    pub async fn history(
        &self,
        device: &str,
        tag: &str,
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
        interval_ms: i64,
    ) -> Result<Vec<Sample>> {
        self.backend
            .history(device, tag, begin, end, digits, interval_ms)
            .await
    }

    /// Visually reduced series for plotting: raw archive samples squeezed
    /// into a screen pixel budget.
    pub async fn plot(
        &self,
        device: &str,
        tag: &str,
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
        pixels: usize,
    ) -> Result<Vec<Sample>> {
        let raw = self.backend.archive(device, tag, begin, end, digits).await?;
        Ok(plot_reduce(&raw, begin, end, pixels))
    }

    pub async fn archive_many(
        &self,
        device: &str,
        tags: &[String],
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
    ) -> Result<Vec<(String, Vec<Sample>)>> {
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            let data = match self.backend.archive(device, tag, begin, end, digits).await {
                Ok(data) => data,
                Err(e) => {
                    warn!("archive for tag '{}' failed: {}", tag, e);
                    Vec::new()
                }
            };
            out.push((tag.clone(), data));
        }
        Ok(out)
    }

    pub async fn history_many(
        &self,
        device: &str,
        tags: &[String],
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
        interval_ms: i64,
    ) -> Result<Vec<(String, Vec<Sample>)>> {
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            let data = match self
                .backend
                .history(device, tag, begin, end, digits, interval_ms)
                .await
            {
                Ok(data) => data,
                Err(e) => {
                    warn!("history for tag '{}' failed: {}", tag, e);
                    Vec::new()
                }
            };
            out.push((tag.clone(), data));
        }
        Ok(out)
    }

    pub async fn plot_many(
        &self,
        device: &str,
        tags: &[String],
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
        pixels: usize,
    ) -> Result<Vec<(String, Vec<Sample>)>> {
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            let data = match self.plot(device, tag, begin, end, digits, pixels).await {
                Ok(data) => data,
                Err(e) => {
                    warn!("plot for tag '{}' failed: {}", tag, e);
                    Vec::new()
                }
            };
            out.push((tag.clone(), data));
        }
        Ok(out)
    }

    /// Aligned history matrix across tags. Tags with no data (or a failed
    /// read) contribute `NaN` columns so rows stay aligned to the grid.
    pub async fn history_matrix(
        &self,
        device: &str,
        tags: &[String],
        begin: NaiveDateTime,
        end: NaiveDateTime,
        digits: i32,
        interval_ms: i64,
    ) -> Result<HistoryMatrix> {
        let series = self
            .history_many(device, tags, begin, end, digits, interval_ms)
            .await?;

        let span_ms = (end - begin).num_milliseconds().max(0);
        let steps = if interval_ms > 0 {
            span_ms / interval_ms + i64::from(span_ms % interval_ms != 0)
        } else {
            0
        };
        let rows = steps as usize + 1;

        let mut values = vec![vec![f64::NAN; tags.len()]; rows];
        for (col, (_, data)) in series.iter().enumerate() {
            for (row, sample) in data.iter().take(rows).enumerate() {
                values[row][col] = sample.value;
            }
        }
        Ok(HistoryMatrix {
            begin,
            end,
            tags: tags.to_vec(),
            values,
        })
    }
}
