//! Cross-run statistics: median run selection, aggregates and averages.
//!
//! Two median conventions coexist: run selection and aggregate stats take the
//! upper of two middle values for even counts, while the plain numeric
//! [`median`] helper takes the lower. Callers depend on both behaviors.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type PageRecord = Map<String, Value>;
/// Run index -> cache state (0 first view, 1 repeat view) -> metrics record.
pub type RunRecords = BTreeMap<u64, BTreeMap<u8, PageRecord>>;

pub const FIRST_VIEW: u8 = 0;
pub const REPEAT_VIEW: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateStats {
    pub count: usize,
    pub avg: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

fn metric_f64(record: &PageRecord, metric: &str) -> Option<f64> {
    record.get(metric).and_then(Value::as_f64)
}

/// A run counts as successful when its result code is 0 or 99999 (content
/// error, still a complete measurement).
pub fn successful_run(record: &PageRecord) -> bool {
    match record.get("result").and_then(Value::as_i64) {
        Some(result) => result == 0 || result == 99999,
        None => false,
    }
}

/// Collect `(run index, value)` pairs for a metric and cache state, in run
/// order.
pub fn values(
    runs: &RunRecords,
    cached: u8,
    metric: &str,
    successful_only: bool,
) -> Vec<(u64, f64)> {
    let mut out = Vec::new();
    for (&run, views) in runs {
        if let Some(record) = views.get(&cached) {
            if successful_only && !successful_run(record) {
                continue;
            }
            if let Some(value) = metric_f64(record, metric) {
                out.push((run, value));
            }
        }
    }
    out
}

/// Pick the run whose metric value is the median across runs (upper middle
/// for even counts), or the fastest run when requested. Falls back from
/// successful-only to all runs, and from the requested metric to `loadTime`.
/// Returns 0 when no run qualifies.
pub fn get_median_run(runs: &RunRecords, cached: u8, metric: &str, fastest: bool) -> u64 {
    let mut times = values(runs, cached, metric, true);
    if times.is_empty() {
        times = values(runs, cached, metric, false);
    }

    let mut run = 0u64;
    if times.len() > 1 {
        times.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let index = if fastest { 0 } else { times.len() / 2 };
        run = times[index].0;
    } else if let Some(&(only, _)) = times.first() {
        run = only;
    }

    if run == 0 && metric != "loadTime" {
        run = get_median_run(runs, cached, "loadTime", fastest);
    }
    run
}

/// Lower-middle median of a plain numeric series.
pub fn median(series: &[f64]) -> Option<f64> {
    if series.is_empty() {
        return None;
    }
    let mut sorted = series.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(sorted[(sorted.len() - 1) / 2])
}

pub fn count_successful_tests(runs: &RunRecords, cached: u8) -> usize {
    runs.values()
        .filter(|views| views.get(&cached).map(successful_run).unwrap_or(false))
        .count()
}

/// Average, median, population standard deviation, min and max of a metric
/// over the successful runs.
pub fn calculate_aggregate_stats(
    runs: &RunRecords,
    cached: u8,
    metric: &str,
) -> Option<AggregateStats> {
    let samples: Vec<f64> = values(runs, cached, metric, true)
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    if samples.is_empty() {
        return None;
    }
    let count = samples.len();
    let avg = samples.iter().sum::<f64>() / count as f64;
    let mut sorted = samples.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let variance = samples.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / count as f64;
    Some(AggregateStats {
        count,
        avg,
        median: sorted[count / 2],
        std_dev: variance.sqrt(),
        min: sorted[0],
        max: sorted[count - 1],
    })
}

/// Integer population standard deviation of a metric over successful runs
/// that carry both the metric and a result code.
pub fn standard_deviation(runs: &RunRecords, metric: &str, cached: u8) -> Option<i64> {
    let mut samples = Vec::new();
    for views in runs.values() {
        if let Some(record) = views.get(&cached) {
            if record.contains_key("result") && successful_run(record) {
                if let Some(value) = metric_f64(record, metric) {
                    samples.push(value);
                }
            }
        }
    }
    if samples.is_empty() {
        return None;
    }
    let avg = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance =
        samples.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / samples.len() as f64;
    Some(variance.sqrt() as i64)
}

fn average_view(runs: &RunRecords, cached: u8, metrics: &[String]) -> Option<PageRecord> {
    let mut sums: PageRecord = Map::new();
    let mut count = 0u64;
    for views in runs.values() {
        let Some(record) = views.get(&cached) else {
            continue;
        };
        let record_cached = record.get("cached").and_then(Value::as_i64).unwrap_or(0);
        let wanted = if cached == FIRST_VIEW {
            record_cached == 0
        } else {
            record_cached != 0
        };
        if !wanted || !successful_run(record) {
            continue;
        }
        for metric in metrics {
            if let Some(value) = metric_f64(record, metric) {
                let slot = sums
                    .entry(metric.clone())
                    .or_insert(Value::from(0.0));
                if let Some(current) = slot.as_f64() {
                    *slot = Value::from(current + value);
                }
            }
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    for value in sums.values_mut() {
        if let Some(total) = value.as_f64() {
            *value = Value::from(total / count as f64);
        }
    }

    // Tag the run whose load time sits closest to the average.
    if let Some(avg_load) = metric_f64(&sums, "loadTime") {
        let mut closest: Option<u64> = None;
        let mut distance = f64::MAX;
        for (&run, views) in runs {
            if let Some(record) = views.get(&cached) {
                if !successful_run(record) {
                    continue;
                }
                if let Some(load) = metric_f64(record, "loadTime") {
                    let current = (load - avg_load).abs();
                    if current < distance {
                        closest = Some(run);
                        distance = current;
                    }
                }
            }
        }
        if let Some(run) = closest {
            sums.insert("avgRun".to_string(), Value::from(run));
        }
    }
    Some(sums)
}

/// Per-metric averages across successful runs for both cache states. The
/// metric list comes from the numeric fields of the first first-view record.
pub fn calculate_page_stats(runs: &RunRecords) -> (Option<PageRecord>, Option<PageRecord>) {
    let metrics: Vec<String> = runs
        .values()
        .find_map(|views| views.get(&FIRST_VIEW))
        .map(|record| {
            record
                .iter()
                .filter(|(_, v)| v.as_f64().is_some())
                .map(|(k, _)| k.clone())
                .collect()
        })
        .unwrap_or_default();
    if metrics.is_empty() {
        return (None, None);
    }
    (
        average_view(runs, FIRST_VIEW, &metrics),
        average_view(runs, REPEAT_VIEW, &metrics),
    )
}

/// Average of a keyed series of 100ms buckets over `[start, end]` seconds.
/// Keys are the bucket start times formatted with one decimal.
pub fn average_slice_value(slices: &Map<String, Value>, start: f64, end: f64) -> f64 {
    let bucket_key = |index: i64| format!("{:.1}", index as f64 / 10.0);
    let start_index = (start * 10.0).floor() as i64;
    let end_index = (end * 10.0).ceil() as i64;

    if end - start > 0.1 {
        let mut count = 0u64;
        let mut total = 0.0f64;
        for index in start_index..=end_index {
            if let Some(value) = slices.get(&bucket_key(index)).and_then(Value::as_f64) {
                count += 1;
                total += value;
            }
        }
        if count > 0 {
            return total / count as f64;
        }
        0.0
    } else if end == start {
        slices
            .get(&bucket_key(start_index))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    } else {
        // Falls between two buckets; interpolate by distance from the start
        // bucket boundary.
        let start_value = slices.get(&bucket_key(start_index)).and_then(Value::as_f64);
        let end_value = slices.get(&bucket_key(end_index)).and_then(Value::as_f64);
        match (start_value, end_value) {
            (Some(start_value), Some(end_value)) => {
                let end_weight = (start - start_index as f64 / 10.0) / 0.1;
                let start_weight = 1.0 - end_weight;
                start_weight * start_value + end_weight * end_value
            }
            _ => 0.0,
        }
    }
}
