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

// Backend-independent resampling: zero-order-hold gap fill and
// pixel-budget reduction over ordered raw samples

use crate::model::Sample;
use chrono::{Duration, NaiveDateTime};

/// Reduction only kicks in above this span; shorter windows are returned raw.
const PLOT_MIN_SPAN_HOURS: i64 = 6;

/// Zero-order-hold resampling of `source` onto the grid
/// `begin, begin+interval, ..` with the final point clamped to `end`.
///
/// The value at grid time `t` is the latest raw value at or before `t`;
/// before the first raw sample its value is held backward. Output has
/// exactly `ceil(span/interval) + 1` points. An empty or all-`NaN` input
/// yields an empty output: complete absence of data is not represented as
/// an all-`NaN` series.
pub fn fill(
    source: &[Sample],
    begin: NaiveDateTime,
    end: NaiveDateTime,
    interval_ms: i64,
) -> Vec<Sample> {
    if interval_ms <= 0 || end < begin {
        return Vec::new();
    }
    if source.is_empty() || source.iter().all(|s| s.value.is_nan()) {
        return Vec::new();
    }
    let span_ms = (end - begin).num_milliseconds();
    let steps = span_ms / interval_ms + i64::from(span_ms % interval_ms != 0);

    let mut out = Vec::with_capacity(steps as usize + 1);
    let mut idx = 0usize; // last source index at or before the grid point
    for k in 0..=steps {
        let mut t = begin + Duration::milliseconds(k * interval_ms);
        if t > end {
            t = end;
        }
        while idx + 1 < source.len() && source[idx + 1].time <= t {
            idx += 1;
        }
        let value = if source[idx].time <= t {
            source[idx].value
        } else {
            source[0].value
        };
        out.push(Sample::new(t, value));
    }
    out
}

/// Pixel-budget reduction for plotting.
///
/// Raw samples pass through unchanged unless the count exceeds `pixels`
/// and the span exceeds six hours. Otherwise `[begin, end]` is split into
/// `pixels` equal windows and the last raw sample of each window survives,
/// written into a pre-sized index-addressed array so the result is
/// chronological by construction. If the survivors do not reach `end`, the
/// true last raw sample is appended.
pub fn plot_reduce(
    raw: &[Sample],
    begin: NaiveDateTime,
    end: NaiveDateTime,
    pixels: usize,
) -> Vec<Sample> {
    if pixels == 0 || raw.len() <= pixels {
        return raw.to_vec();
    }
    let span = end - begin;
    if span <= Duration::hours(PLOT_MIN_SPAN_HOURS) {
        return raw.to_vec();
    }
    let span_ms = span.num_milliseconds();

    let mut picked: Vec<Option<Sample>> = vec![None; pixels];
    for (i, slot) in picked.iter_mut().enumerate() {
        let window_begin = begin + Duration::milliseconds(span_ms * i as i64 / pixels as i64);
        let window_end = if i + 1 == pixels {
            // Final window is closed so a sample exactly at `end` survives.
            end + Duration::milliseconds(1)
        } else {
            begin + Duration::milliseconds(span_ms * (i as i64 + 1) / pixels as i64)
        };
        let hi = raw.partition_point(|s| s.time < window_end);
        if hi > 0 && raw[hi - 1].time >= window_begin {
            *slot = Some(raw[hi - 1]);
        }
    }

    let mut out: Vec<Sample> = picked.into_iter().flatten().collect();
    if let (Some(last), Some(tail)) = (out.last().copied(), raw.last().copied()) {
        if last.time != end && last.time != tail.time {
            out.push(tail);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_time;

    fn dt(s: &str) -> NaiveDateTime {
        parse_time(s).unwrap()
    }

    fn s(time: &str, value: f64) -> Sample {
        Sample::new(dt(time), value)
    }

    #[test]
    fn test_fill_grid_size_and_hold() {
        let source = vec![
            s("2024-01-01 00:00:01", 1.0),
            s("2024-01-01 00:00:04", 4.0),
        ];
        let out = fill(
            &source,
            dt("2024-01-01 00:00:00"),
            dt("2024-01-01 00:00:06"),
            1000,
        );
        assert_eq!(out.len(), 7);
        let values: Vec<f64> = out.iter().map(|x| x.value).collect();
        // held backward to begin, ZOH in the middle, held forward to end
        assert_eq!(values, vec![1.0, 1.0, 1.0, 1.0, 4.0, 4.0, 4.0]);
        assert_eq!(out[0].time, dt("2024-01-01 00:00:00"));
        assert_eq!(out[6].time, dt("2024-01-01 00:00:06"));
    }

    #[test]
    fn test_fill_non_divisible_span_clamps_last_point() {
        let source = vec![s("2024-01-01 00:00:00", 7.0)];
        let out = fill(
            &source,
            dt("2024-01-01 00:00:00"),
            dt("2024-01-01 00:00:02") + Duration::milliseconds(500),
            1000,
        );
        // ceil(2500/1000) + 1 = 4 points, last clamped to end
        assert_eq!(out.len(), 4);
        assert_eq!(
            out[3].time,
            dt("2024-01-01 00:00:02") + Duration::milliseconds(500)
        );
        assert!(out.iter().all(|x| x.value == 7.0));
    }

    #[test]
    fn test_fill_single_sample_constant_series() {
        let source = vec![s("2024-01-01 00:00:05", 42.0)];
        let out = fill(
            &source,
            dt("2024-01-01 00:00:00"),
            dt("2024-01-01 00:00:10"),
            1000,
        );
        assert_eq!(out.len(), 11);
        assert!(out.iter().all(|x| x.value == 42.0));
    }

    #[test]
    fn test_fill_all_nan_is_empty() {
        let source = vec![
            s("2024-01-01 00:00:00", f64::NAN),
            s("2024-01-01 00:00:05", f64::NAN),
        ];
        let out = fill(
            &source,
            dt("2024-01-01 00:00:00"),
            dt("2024-01-01 00:00:10"),
            1000,
        );
        assert!(out.is_empty());
        assert!(fill(&[], dt("2024-01-01 00:00:00"), dt("2024-01-01 00:00:10"), 1000).is_empty());
    }

    #[test]
    fn test_fill_idempotent_on_equidistant_input() {
        let source = vec![
            s("2024-01-01 00:00:00", 1.0),
            s("2024-01-01 00:00:01", 2.0),
            s("2024-01-01 00:00:02", 3.0),
        ];
        let once = fill(
            &source,
            dt("2024-01-01 00:00:00"),
            dt("2024-01-01 00:00:02"),
            1000,
        );
        assert_eq!(once, source);
        let twice = fill(
            &once,
            dt("2024-01-01 00:00:00"),
            dt("2024-01-01 00:00:02"),
            1000,
        );
        assert_eq!(twice, once);
    }

    #[test]
    fn test_fill_guards_degenerate_arguments() {
        let source = vec![s("2024-01-01 00:00:00", 1.0)];
        let reversed = fill(&source, dt("2024-01-01 00:00:10"), dt("2024-01-01 00:00:00"), 1000);
        assert!(reversed.is_empty());
        assert!(fill(&source, dt("2024-01-01 00:00:00"), dt("2024-01-01 00:00:10"), 0).is_empty());
        // zero span still yields the single begin==end grid point
        let out = fill(&source, dt("2024-01-01 00:00:05"), dt("2024-01-01 00:00:05"), 1000);
        assert_eq!(out, vec![s("2024-01-01 00:00:05", 1.0)]);
    }

    fn dense_day(samples: usize) -> (Vec<Sample>, NaiveDateTime, NaiveDateTime) {
        let begin = dt("2024-01-01 00:00:00");
        let end = dt("2024-01-01 12:00:00");
        let step = (end - begin).num_milliseconds() / samples as i64;
        let raw = (0..samples)
            .map(|i| Sample::new(begin + Duration::milliseconds(step * i as i64), i as f64))
            .collect();
        (raw, begin, end)
    }

    #[test]
    fn test_plot_passthrough_below_budget_or_span() {
        // sparse: fewer samples than pixels
        let (raw, begin, end) = dense_day(100);
        assert_eq!(plot_reduce(&raw, begin, end, 1200), raw);

        // dense but short span (<= 6h)
        let begin = dt("2024-01-01 00:00:00");
        let end = dt("2024-01-01 03:00:00");
        let raw: Vec<Sample> = (0..500)
            .map(|i| Sample::new(begin + Duration::seconds(i * 20), i as f64))
            .collect();
        assert_eq!(plot_reduce(&raw, begin, end, 100), raw);
    }

    #[test]
    fn test_plot_reduction_bounds_and_order() {
        let (raw, begin, end) = dense_day(5000);
        let out = plot_reduce(&raw, begin, end, 300);
        assert!(out.len() <= 301);
        assert!(out.windows(2).all(|w| w[0].time < w[1].time));
        // raw does not reach end, so the true last raw sample closes the plot
        assert_eq!(out.last(), raw.last());
    }

    #[test]
    fn test_plot_reduction_keeps_end_sample() {
        let begin = dt("2024-01-01 00:00:00");
        let end = dt("2024-01-01 10:00:00");
        let step = (end - begin).num_milliseconds() / 2000;
        let mut raw: Vec<Sample> = (0..2000)
            .map(|i| Sample::new(begin + Duration::milliseconds(step * i), i as f64))
            .collect();
        raw.push(Sample::new(end, 9999.0));
        let out = plot_reduce(&raw, begin, end, 400);
        assert_eq!(out.last().unwrap().time, end);
        assert_eq!(out.last().unwrap().value, 9999.0);
        assert!(out.len() <= 401);
    }
}
