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

// Bulk-write matrix protocol: the two concrete wire shapes

use crate::model::{from_epoch_millis, parse_time, Sample};
use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use serde_json::Value;

const HEADER_TIMESTAMP: &str = "Timestamp";

/// One bulk-write payload. The shape is decided at the boundary, never
/// inside the storage layer.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkWriteMatrix {
    /// One tag, many timestamped rows.
    SingleTagSeries { tag: String, rows: Vec<Sample> },
    /// One timestamp, many tags.
    MultiTagSnapshot {
        tags: Vec<String>,
        time: NaiveDateTime,
        values: Vec<f64>,
    },
}

/// Strip any series path prefix from a tag name supplied on the wire.
pub(crate) fn normalize_tag(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.strip_prefix("root.").unwrap_or(trimmed).to_string()
}

impl BulkWriteMatrix {
    /// Single-tag time series. `NaN` is a read-side sentinel and is
    /// rejected on the write path.
    pub fn series(tag: &str, rows: Vec<Sample>) -> Result<Self> {
        if rows.iter().any(|s| s.value.is_nan()) {
            bail!("refusing to write NaN for tag '{}'", tag);
        }
        Ok(Self::SingleTagSeries {
            tag: normalize_tag(tag),
            rows,
        })
    }

    /// Many tags at one instant.
    pub fn snapshot_at(time: NaiveDateTime, data: Vec<(String, f64)>) -> Result<Self> {
        if let Some((tag, _)) = data.iter().find(|(_, v)| v.is_nan()) {
            bail!("refusing to write NaN for tag '{}'", tag);
        }
        let (tags, values) = data
            .into_iter()
            .map(|(tag, value)| (normalize_tag(&tag), value))
            .unzip();
        Ok(Self::MultiTagSnapshot { tags, time, values })
    }

    /// Parse the raw header+rows wire shape.
    ///
    /// The header row is `["Timestamp", tag, ...]`. Exactly two rows means
    /// one timestamp across many tags; more rows means a time series for a
    /// single tag column.
    pub fn from_rows(rows: &[Vec<Value>]) -> Result<Self> {
        let Some(header) = rows.first() else {
            bail!("bulk-write matrix is empty");
        };
        match header.first().and_then(Value::as_str) {
            Some(h) if h.eq_ignore_ascii_case(HEADER_TIMESTAMP) => {}
            other => bail!("matrix header must start with 'Timestamp', got {:?}", other),
        }
        let mut tags = Vec::with_capacity(header.len().saturating_sub(1));
        for cell in &header[1..] {
            match cell.as_str() {
                Some(name) => tags.push(normalize_tag(name)),
                None => bail!("matrix header tag is not a string: {}", cell),
            }
        }
        if tags.is_empty() {
            bail!("bulk-write matrix carries no tags");
        }
        if rows.len() < 2 {
            bail!("bulk-write matrix carries no data rows");
        }

        if rows.len() == 2 {
            // One timestamp across many tags.
            let row = &rows[1];
            if row.len() != tags.len() + 1 {
                bail!(
                    "matrix data row has {} cells, expected {}",
                    row.len(),
                    tags.len() + 1
                );
            }
            let time = cell_time(&row[0])?;
            let values = row[1..]
                .iter()
                .map(cell_value)
                .collect::<Result<Vec<f64>>>()?;
            Ok(Self::MultiTagSnapshot { tags, time, values })
        } else {
            // A time series, single tag column only.
            if tags.len() != 1 {
                bail!(
                    "a multi-row matrix must carry exactly one tag column, got {}",
                    tags.len()
                );
            }
            let mut series = Vec::with_capacity(rows.len() - 1);
            for row in &rows[1..] {
                if row.len() != 2 {
                    bail!("matrix series row has {} cells, expected 2", row.len());
                }
                series.push(Sample::new(cell_time(&row[0])?, cell_value(&row[1])?));
            }
            Ok(Self::SingleTagSeries {
                tag: tags.remove(0),
                rows: series,
            })
        }
    }
}

fn cell_time(cell: &Value) -> Result<NaiveDateTime> {
    if let Some(ms) = cell.as_i64() {
        return from_epoch_millis(ms)
            .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", ms));
    }
    if let Some(text) = cell.as_str() {
        return parse_time(text).ok_or_else(|| anyhow::anyhow!("unparsable timestamp: {}", text));
    }
    bail!("matrix timestamp cell is neither millis nor text: {}", cell)
}

fn cell_value(cell: &Value) -> Result<f64> {
    let value = match cell {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    match value {
        Some(v) if v.is_nan() => bail!("NaN is a read-side sentinel and cannot be written"),
        Some(v) => Ok(v),
        None => bail!("matrix value cell is not numeric: {}", cell),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::epoch_millis;
    use serde_json::json;

    fn dt(s: &str) -> NaiveDateTime {
        parse_time(s).unwrap()
    }

    #[test]
    fn test_from_rows_single_tag_series() {
        let rows = vec![
            vec![json!("Timestamp"), json!("root.TEMP1")],
            vec![json!("2024-05-01 00:00:00"), json!(1.0)],
            vec![json!("2024-05-01 00:00:01"), json!(2.0)],
            vec![json!("2024-05-01 00:00:02"), json!(3.0)],
        ];
        let matrix = BulkWriteMatrix::from_rows(&rows).unwrap();
        match matrix {
            BulkWriteMatrix::SingleTagSeries { tag, rows } => {
                assert_eq!(tag, "TEMP1");
                assert_eq!(rows.len(), 3);
                assert_eq!(rows[2], Sample::new(dt("2024-05-01 00:00:02"), 3.0));
            }
            other => panic!("wrong shape: {:?}", other),
        }
    }

    #[test]
    fn test_from_rows_multi_tag_snapshot() {
        let t = dt("2024-05-01 12:00:00");
        let rows = vec![
            vec![json!("Timestamp"), json!("TEMP1"), json!("PRESS1")],
            vec![json!(epoch_millis(t)), json!(42.0), json!(1.5)],
        ];
        let matrix = BulkWriteMatrix::from_rows(&rows).unwrap();
        assert_eq!(
            matrix,
            BulkWriteMatrix::MultiTagSnapshot {
                tags: vec!["TEMP1".to_string(), "PRESS1".to_string()],
                time: t,
                values: vec![42.0, 1.5],
            }
        );
    }

    #[test]
    fn test_from_rows_rejects_nan_and_bad_header() {
        let rows = vec![
            vec![json!("Timestamp"), json!("T1")],
            vec![json!("2024-05-01 00:00:00"), json!("NaN")],
            vec![json!("2024-05-01 00:00:01"), json!(1.0)],
        ];
        assert!(BulkWriteMatrix::from_rows(&rows).is_err());

        let rows = vec![
            vec![json!("time"), json!("T1")],
            vec![json!("2024-05-01 00:00:00"), json!(1.0)],
        ];
        assert!(BulkWriteMatrix::from_rows(&rows).is_err());

        assert!(BulkWriteMatrix::from_rows(&[]).is_err());
    }

    #[test]
    fn test_from_rows_multi_tag_requires_two_rows() {
        let rows = vec![
            vec![json!("Timestamp"), json!("T1"), json!("T2")],
            vec![json!("2024-05-01 00:00:00"), json!(1.0), json!(2.0)],
            vec![json!("2024-05-01 00:00:01"), json!(3.0), json!(4.0)],
        ];
        assert!(BulkWriteMatrix::from_rows(&rows).is_err());
    }

    #[test]
    fn test_constructors_reject_nan() {
        assert!(BulkWriteMatrix::series(
            "T1",
            vec![Sample::new(dt("2024-05-01 00:00:00"), f64::NAN)]
        )
        .is_err());
        assert!(BulkWriteMatrix::snapshot_at(
            dt("2024-05-01 00:00:00"),
            vec![("T1".to_string(), f64::NAN)]
        )
        .is_err());
    }

    #[test]
    fn test_normalize_tag_strips_path_prefix() {
        assert_eq!(normalize_tag("root.TEMP1"), "TEMP1");
        assert_eq!(normalize_tag(" TEMP1 "), "TEMP1");
        assert_eq!(normalize_tag("TEMP1"), "TEMP1");
    }
}
