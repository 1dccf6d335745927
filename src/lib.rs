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

// Backend-agnostic time-series access layer
//
// One contract for storing and querying tagged numeric measurements against
// two structurally different stores:
// - Apache IoTDB, a purpose-built time-series engine, driven over REST v2
// - Apache CouchDB, a generic document store repurposed as a time-series
//   engine via a per-tag-per-day bucketed document schema
//
// The facade implements the shared algorithms (zero-order-hold gap filling,
// pixel-budget downsampling, the bulk-write matrix protocol) once, purely in
// terms of the backend primitives.

pub mod backend;
pub mod client;
pub mod config;
pub mod matrix;
pub mod model;
pub mod pattern;
pub mod resample;

// Re-export main types
pub use backend::{CouchBackend, IoTdbBackend};
pub use client::{
    HistoryMatrix, TimeSeriesBackend, TimeSeriesClient, DEFAULT_DIGITS, DEFAULT_INTERVAL_MS,
    DEFAULT_PIXELS,
};
pub use config::{ConfigError, ConnectionConfig, Scheme};
pub use matrix::BulkWriteMatrix;
pub use model::{Measurement, PointType, Sample, SnapshotRecord, TimeAxis};
pub use resample::{fill, plot_reduce};
