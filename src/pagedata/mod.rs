//! Page metrics aggregation.
//!
//! A run's canonical metrics record is assembled from whichever raw sources
//! the agent uploaded: a legacy tab-delimited log line, an authoritative
//! `page_data.json`, and a family of JSON side files (user timing, custom
//! metrics, traces, video frames). The assembled record is cached per run in
//! a versioned JSON file so later reads skip the expensive enrichment.

pub mod interactive;
pub mod logline;
pub mod paths;
pub mod stats;
pub mod trace;

use crate::config::{PAGE_DATA_CACHE_VERSION, RESULT_TEST_ERROR, SANE_MS_MAX};
use crate::gzio;
use paths::RunPaths;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::OnceLock;

use stats::{PageRecord, RunRecords};

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Ignore the per-run cache and rebuild the record from raw files.
    pub recalculate: bool,
    /// Skip side-file enrichment and cache persistence.
    pub basic: bool,
}

fn get_f64(record: &PageRecord, key: &str) -> Option<f64> {
    record.get(key).and_then(Value::as_f64)
}

fn positive(record: &PageRecord, key: &str) -> Option<f64> {
    get_f64(record, key).filter(|v| *v > 0.0)
}

fn read_json(path: &Path) -> Option<Value> {
    let text = gzio::gz_read_to_string(path)?;
    serde_json::from_str(&text).ok()
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    match read_json(path)? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn read_window_list(path: &Path) -> Option<Vec<Value>> {
    match read_json(path)? {
        Value::Array(list) => Some(list),
        _ => None,
    }
}

fn window_pairs(value: &Value) -> Vec<(f64, f64)> {
    value
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|w| {
                    let pair = w.as_array()?;
                    Some((pair.first()?.as_f64()?, pair.get(1)?.as_f64()?))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Test-level metadata (`testinfo.json` in the test directory).
pub fn load_test_info(test_path: &Path) -> Option<Map<String, Value>> {
    read_json_object(&test_path.join("testinfo.json"))
}

pub fn test_complete(test_path: &Path, test_info: Option<&Map<String, Value>>) -> bool {
    if test_path.join("test.complete").is_file() {
        return true;
    }
    test_info
        .and_then(|info| info.get("completed"))
        .map(|c| !c.is_null() && c.as_i64() != Some(0))
        .unwrap_or(false)
}

/// Load every run of a completed test, keyed run index then cache state.
pub fn load_all_page_data(test_path: &Path, options: LoadOptions) -> RunRecords {
    let mut records = RunRecords::new();
    let Some(test_info) = load_test_info(test_path) else {
        return records;
    };
    if !test_complete(test_path, Some(&test_info)) {
        return records;
    }
    let runs = test_info.get("runs").and_then(Value::as_u64).unwrap_or(1) as u32;
    let fv_only = test_info
        .get("fvonly")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        != 0;

    for run in 1..=runs {
        let mut views = std::collections::BTreeMap::new();
        if let Some(data) = load_page_run_data(test_path, run, false, Some(&test_info), options) {
            views.insert(stats::FIRST_VIEW, data);
        }
        if !fv_only {
            if let Some(data) = load_page_run_data(test_path, run, true, Some(&test_info), options)
            {
                views.insert(stats::REPEAT_VIEW, data);
            }
        }
        if !views.is_empty() {
            records.insert(run as u64, views);
        }
    }
    records
}

/// Load and enrich the metrics record for one run and cache state.
pub fn load_page_run_data(
    test_path: &Path,
    run: u32,
    cached: bool,
    test_info: Option<&Map<String, Value>>,
    options: LoadOptions,
) -> Option<PageRecord> {
    let local = RunPaths::new(test_path, run, cached);
    let cache_file = local.page_data_cache_file(PAGE_DATA_CACHE_VERSION);

    let mut record: Option<PageRecord> = None;
    if !options.recalculate && gzio::gz_is_file(&cache_file) {
        record = read_json_object(&cache_file).filter(|r| r.contains_key("result"));
    }

    let mut record = match record {
        Some(record) => record,
        None => build_record(&local, test_info, options, &cache_file)?,
    };

    // Never cached: the timing summary and test-level attachments below can
    // arrive after the per-run record was first cached.
    if record.contains_key("testTiming") {
        if let Some(info) = test_info {
            let started = info.get("started").and_then(Value::as_f64);
            let completed = info.get("completed").and_then(Value::as_f64);
            if let (Some(started), Some(completed)) = (started, completed) {
                if completed > started {
                    if let Some(Value::Object(timing)) = record.get_mut("testTiming") {
                        timing.insert(
                            "AllRunsDuration".to_string(),
                            json!((completed - started) * 1000.0),
                        );
                    }
                }
            }
        }
    }

    if !record.contains_key("requestsFull") {
        if let Some(requests) = record.get("requests").cloned() {
            record.insert("requestsFull".to_string(), requests);
        }
    }
    if let Some(analysis) = read_json_object(&local.requests_analysis_file()) {
        for (key, value) in analysis {
            record.entry(key).or_insert(value);
        }
    }
    if let Some(crux) = read_json_object(&local.crux_json_file()) {
        let field_data = crux
            .get("record")
            .cloned()
            .unwrap_or(Value::Object(crux));
        record.insert("CrUX".to_string(), field_data);
    }
    if let Some(metadata) = test_info.and_then(|info| info.get("metadata")) {
        record.insert("metadata".to_string(), metadata.clone());
    }
    attach_lighthouse(&mut record, &local);

    if !record.contains_key("firstContentfulPaint") {
        top_level_fcp(&mut record);
    }
    if let Some(fully_loaded) = get_f64(&record, "fullyLoaded") {
        record.insert("fullyLoaded".to_string(), json!(fully_loaded.round() as i64));
    }
    if record.is_empty() {
        return None;
    }
    if let Some(id) = test_info.and_then(|info| info.get("id")) {
        record.insert("testID".to_string(), id.clone());
    }
    Some(record)
}

/// Assemble the record from raw result files and persist it to the cache.
fn build_record(
    local: &RunPaths,
    test_info: Option<&Map<String, Value>>,
    options: LoadOptions,
    cache_file: &Path,
) -> Option<PageRecord> {
    let mut record = logline::load_log_file(&local.page_data_file()).unwrap_or_default();
    if record.is_empty() {
        record = requests_fallback(local).unwrap_or_default();
    }

    // The agent-reported metrics win over anything derived.
    if let Some(reported) = read_json_object(&local.page_data_json_file()) {
        for (key, value) in reported {
            record.insert(key, value);
        }
    }
    top_level_fcp(&mut record);

    if !record.is_empty() && !options.basic {
        let start_offset = get_f64(&record, "testStartOffset")
            .map(|v| v.round() as i64)
            .unwrap_or(0);
        apply_user_timing_marks(&mut record, &local.user_timed_events_file());
        apply_custom_metrics(&mut record, &local.custom_metrics_file());

        if let Some(interactive) = read_window_list(&local.interactive_file()) {
            record.insert("interactivePeriods".to_string(), Value::Array(interactive));
        }
        if let Some(tasks) = read_window_list(&local.long_tasks_file()) {
            record.insert("longTasks".to_string(), Value::Array(tasks));
        }
        apply_test_timing(&mut record, &local.test_timing_file());

        if get_f64(&record, "loadTime") == Some(0.0) {
            if let Some(fully_loaded) = positive(&record, "fullyLoaded") {
                record.insert("loadTime".to_string(), json!(fully_loaded));
            }
        }
        apply_video_frames(&mut record, local, start_offset);
        apply_visual_progress(&mut record, local);
        apply_cpu_times(&mut record, local);
        apply_chrome_user_timing(&mut record, local);

        if let Some(features) = read_json(&local.feature_usage_file()) {
            if features.is_object() || features.is_array() {
                record.insert("blinkFeatureFirstUsed".to_string(), features);
            }
        }
        if let Some(Value::Array(streams)) = read_json(&local.priority_streams_file()) {
            if !streams.is_empty() {
                record.insert("priorityStreams".to_string(), Value::Array(streams));
            }
        }
        apply_interactive_metrics(&mut record, local);

        // Black-box visual tests have no navigation timings; the visual
        // metrics stand in for them.
        if record
            .get("visualTest")
            .map(|v| v.as_bool().unwrap_or_else(|| v.as_i64().unwrap_or(0) != 0))
            .unwrap_or(false)
        {
            if let Some(complete) = record.get("visualComplete").cloned() {
                record.insert("loadTime".to_string(), complete.clone());
                record.insert("docTime".to_string(), complete);
                if let Some(last) = record.get("lastVisualChange").cloned() {
                    record.insert("fullyLoaded".to_string(), last);
                }
            }
        }
    }

    if !record.is_empty() {
        for (target, source) in [
            ("bytesIn", "pcapBytesIn"),
            ("bytesInDoc", "pcapBytesIn"),
            ("bytesOut", "pcapBytesOut"),
            ("bytesOutDoc", "pcapBytesOut"),
        ] {
            if positive(&record, target).is_none() {
                if let Some(pcap) = positive(&record, source) {
                    record.insert(target.to_string(), json!(pcap));
                }
            }
        }

        record.insert("run".to_string(), json!(local.run()));
        record.insert("cached".to_string(), json!(if local.cached() { 1 } else { 0 }));
        record.insert("step".to_string(), json!(1));

        apply_effective_bps(&mut record);

        // Clean up insane values, most likely negative numbers read as
        // unsigned.
        if let (Some(first_paint), Some(fully_loaded)) =
            (get_f64(&record, "firstPaint"), get_f64(&record, "fullyLoaded"))
        {
            if first_paint > fully_loaded {
                record.insert("firstPaint".to_string(), json!(0));
            }
        }
        const CLAMPED_TIMES: [&str; 18] = [
            "loadTime",
            "TTFB",
            "render",
            "fullyLoaded",
            "docTime",
            "domTime",
            "aft",
            "titleTime",
            "loadEventStart",
            "loadEventEnd",
            "domContentLoadedEventStart",
            "domContentLoadedEventEnd",
            "domLoading",
            "domInteractive",
            "lastVisualChange",
            "visualComplete",
            "server_rtt",
            "firstPaint",
        ];
        for key in CLAMPED_TIMES {
            let sane = get_f64(&record, key)
                .map(|v| (0.0..=SANE_MS_MAX).contains(&v))
                .unwrap_or(false);
            if !sane {
                record.insert(key.to_string(), json!(0));
            }
        }

        if let Some(error) = run_error(test_info, local) {
            let result = record.get("result").and_then(Value::as_i64);
            if matches!(result, None | Some(0) | Some(99999)) {
                record.insert("result".to_string(), json!(RESULT_TEST_ERROR));
            }
            record.insert("error".to_string(), error);
        }

        if record.contains_key("result") && !options.basic {
            if let Ok(encoded) = serde_json::to_vec(&Value::Object(record.clone())) {
                if let Err(err) = gzio::gz_write(cache_file, &encoded) {
                    tracing::warn!("failed to cache page data {}: {err}", cache_file.display());
                }
            }
        }
    }

    if record.is_empty() {
        None
    } else {
        Some(record)
    }
}

fn run_error(test_info: Option<&Map<String, Value>>, local: &RunPaths) -> Option<Value> {
    test_info?
        .get("errors")?
        .get(local.run().to_string())?
        .get(if local.cached() { "1" } else { "0" })
        .cloned()
}

/// Summary metrics derived from the request log when no legacy log line
/// exists.
fn requests_fallback(local: &RunPaths) -> Option<PageRecord> {
    let requests = read_window_list(&local.requests_file())?;
    if requests.is_empty() {
        return None;
    }
    let mut bytes_in = 0i64;
    let mut bytes_out = 0i64;
    let mut end = 0.0f64;
    for request in &requests {
        bytes_in += request.get("bytesIn").and_then(Value::as_i64).unwrap_or(0);
        bytes_out += request.get("bytesOut").and_then(Value::as_i64).unwrap_or(0);
        if let Some(load_end) = request.get("load_end").and_then(Value::as_f64) {
            end = end.max(load_end);
        }
    }
    let mut record = PageRecord::new();
    record.insert("result".to_string(), json!(0));
    record.insert("requests".to_string(), json!(requests.len()));
    record.insert("bytesIn".to_string(), json!(bytes_in));
    record.insert("bytesOut".to_string(), json!(bytes_out));
    record.insert("loadTime".to_string(), json!(end));
    record.insert("fullyLoaded".to_string(), json!(end));
    Some(record)
}

/// Promote a trace-reported first-contentful-paint synonym to the top level.
fn top_level_fcp(record: &mut PageRecord) {
    if record.contains_key("firstContentfulPaint") {
        return;
    }
    for synonym in [
        "chromeUserTiming.firstContentfulPaint",
        "PerformancePaintTiming.first-contentful-paint",
    ] {
        if let Some(value) = record.get(synonym).cloned() {
            record.insert("firstContentfulPaint".to_string(), value);
            return;
        }
    }
}

fn sanitize_event_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '(' | ')' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// W3C user timing marks and measures reported by the agent.
fn apply_user_timing_marks(record: &mut PageRecord, file: &Path) {
    let Some(events) = read_window_list(file) else {
        return;
    };
    if events.is_empty() {
        return;
    }
    let mut last_event = 0.0f64;
    let mut user_times = Map::new();
    let mut measures = Vec::new();
    for event in &events {
        let (Some(name), Some(start), Some(entry_type)) = (
            event.get("name").and_then(Value::as_str),
            event.get("startTime").and_then(Value::as_f64),
            event.get("entryType").and_then(Value::as_str),
        ) else {
            continue;
        };
        let safe = sanitize_event_name(name);
        match entry_type {
            "mark" => {
                let time = (start + 0.5) as i64;
                if time > 0 && (time as f64) < SANE_MS_MAX {
                    last_event = last_event.max(start);
                    record.insert(format!("userTime.{safe}"), json!(time));
                    user_times.insert(safe, json!(time));
                }
            }
            "measure" => {
                if let Some(duration) = event.get("duration").and_then(Value::as_f64) {
                    record.insert(format!("userTimingMeasure.{safe}"), json!((duration + 0.5) as i64));
                    measures.push(json!({
                        "name": name,
                        "startTime": start,
                        "duration": duration,
                    }));
                }
            }
            _ => {}
        }
    }
    if !user_times.is_empty() {
        record.insert("userTimes".to_string(), Value::Object(user_times));
    }
    if !measures.is_empty() {
        record.insert("userTimingMeasures".to_string(), Value::Array(measures));
    }
    record.insert("userTime".to_string(), json!((last_event + 0.5) as i64));
}

/// Agent-executed custom metrics, sniffed into int / float / raw.
fn apply_custom_metrics(record: &mut PageRecord, file: &Path) {
    static INT_RE: OnceLock<regex::Regex> = OnceLock::new();
    static FLOAT_RE: OnceLock<regex::Regex> = OnceLock::new();
    let int_re = INT_RE.get_or_init(|| regex::Regex::new(r"^[0-9]+$").unwrap());
    let float_re = FLOAT_RE.get_or_init(|| regex::Regex::new(r"^[0-9]*\.[0-9]+$").unwrap());

    let Some(metrics) = read_json_object(file) else {
        return;
    };
    if metrics.is_empty() {
        return;
    }
    let mut names = Vec::new();
    for (name, value) in metrics {
        let typed = match &value {
            Value::String(text) if int_re.is_match(text) => {
                text.parse::<i64>().map(Value::from).unwrap_or(value)
            }
            Value::String(text) if float_re.is_match(text) => {
                text.parse::<f64>().map(Value::from).unwrap_or(value)
            }
            _ => value,
        };
        record.insert(name.clone(), typed);
        names.push(json!(name));
    }
    record.insert("custom".to_string(), Value::Array(names));
}

/// Diagnostic timing breakdown written as `key=value` lines.
fn apply_test_timing(record: &mut PageRecord, file: &Path) {
    let Some(lines) = gzio::gz_read_lines(file) else {
        return;
    };
    let mut entries = Map::new();
    for line in lines {
        let line = line.trim();
        if let Some((key, value)) = line.split_once('=') {
            if !key.is_empty() {
                let key: String = key.chars().filter(|c| *c != ' ').collect();
                let value = value.trim().parse::<i64>().unwrap_or(0);
                entries.insert(key, json!(value));
            }
        }
    }
    if !entries.is_empty() {
        record.insert("testTiming".to_string(), Value::Object(entries));
    }
}

/// Frame timestamp in ms from a video frame filename,
/// `ms_<time>.jpg` or `frame_<n>.jpg` at 10fps.
fn frame_time_ms(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".jpg").or_else(|| name.strip_suffix(".png"))?;
    if let Some(ms) = stem.strip_prefix("ms_") {
        return ms.parse().ok();
    }
    if let Some(frame) = stem.strip_prefix("frame_") {
        return frame.parse::<i64>().ok().map(|n| n * 100);
    }
    None
}

fn video_frame_times(dir: &Path) -> Vec<i64> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut times: Vec<i64> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| frame_time_ms(&entry.file_name().to_string_lossy()))
        .collect();
    times.sort_unstable();
    times
}

/// Backfill `lastVisualChange` and `render` from captured video frames.
fn apply_video_frames(record: &mut PageRecord, local: &RunPaths, start_offset: i64) {
    let frames = video_frame_times(&local.video_dir());
    if frames.is_empty() {
        return;
    }
    if positive(record, "lastVisualChange").is_none() {
        if let Some(&last) = frames.last() {
            let last = (last - start_offset).max(0);
            if last > 0 {
                record.insert("lastVisualChange".to_string(), json!(last));
                if !record.contains_key("visualComplete") {
                    record.insert("visualComplete".to_string(), json!(last));
                }
            }
        }
    }
    if positive(record, "render").is_none() && frames.len() > 1 {
        let first = (frames[1] - start_offset).max(0);
        if first > 0 {
            record.insert("render".to_string(), json!(first));
        }
    }
}

/// Fill the SpeedIndex family from the precomputed visual progress summary
/// when any of those metrics is missing.
fn apply_visual_progress(record: &mut PageRecord, local: &RunPaths) {
    let complete = record.contains_key("SpeedIndex")
        && positive(record, "render").is_some()
        && positive(record, "lastVisualChange").is_some()
        && positive(record, "visualComplete85").is_some()
        && positive(record, "visualComplete").is_some();
    if complete {
        return;
    }
    let Some(progress) = read_json_object(&local.visual_progress_file()) else {
        return;
    };
    for key in [
        "SpeedIndex",
        "visualComplete85",
        "visualComplete90",
        "visualComplete95",
        "visualComplete99",
        "visualComplete",
    ] {
        if let Some(value) = progress.get(key) {
            record.insert(key.to_string(), value.clone());
        }
    }
    if positive(record, "render").is_none() {
        if let Some(start_render) = progress.get("startRender") {
            record.insert("render".to_string(), start_render.clone());
        }
    }
    if positive(record, "lastVisualChange").is_none() {
        if let Some(complete) = record.get("visualComplete").cloned() {
            record.insert("lastVisualChange".to_string(), complete);
        }
    }
}

/// Main-thread busy time per category from the trace CPU slices, summed up
/// to `end_time` ms, with the remainder reported as Idle.
fn cpu_busy_times(local: &RunPaths, end_time: f64) -> Option<Map<String, Value>> {
    let slices = read_json_object(&local.cpu_slices_file())?;
    let main_thread = slices.get("main_thread")?.as_str()?;
    let categories = slices.get("slices")?.get(main_thread)?.as_object()?;
    let limit = end_time as usize;

    let mut busy = Map::new();
    let mut total = 0.0f64;
    for (category, buckets) in categories {
        let buckets = buckets.as_array()?;
        let sum_usec: f64 = buckets
            .iter()
            .take(limit)
            .filter_map(Value::as_f64)
            .sum();
        let ms = (sum_usec / 1000.0).round();
        total += ms;
        busy.insert(category.clone(), json!(ms as i64));
    }
    if busy.is_empty() {
        return None;
    }
    let idle = (end_time - total).max(0.0);
    busy.insert("Idle".to_string(), json!(idle.round() as i64));
    Some(busy)
}

fn apply_cpu_times(record: &mut PageRecord, local: &RunPaths) {
    if record.contains_key("cpuTimes") {
        return;
    }
    let Some(fully_loaded) = positive(record, "fullyLoaded") else {
        return;
    };
    let Some(times) = cpu_busy_times(local, fully_loaded) else {
        return;
    };
    for (key, value) in &times {
        record.insert(format!("cpu.{key}"), value.clone());
    }
    record.insert("cpuTimes".to_string(), Value::Object(times));
    if let Some(doc_time) = positive(record, "docTime") {
        if let Some(doc_times) = cpu_busy_times(local, doc_time) {
            record.insert("cpuTimesDoc".to_string(), Value::Object(doc_times));
        }
    }
}

/// Merge the Chrome trace user-timing milestones, earliest-wins for
/// `first*` events and latest-wins otherwise, plus the layout shift list.
fn apply_chrome_user_timing(record: &mut PageRecord, local: &RunPaths) {
    let Some(events) = read_window_list(&local.chrome_user_timing_file()) else {
        return;
    };
    let browser_version = record
        .get("browser_version")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.split('.').next()?.parse::<f64>().ok());
    let Some(timing) = trace::parse_user_timing(&events, browser_version, record) else {
        return;
    };

    record.insert(
        "chromeUserTiming".to_string(),
        Value::Array(timing.user_timing.clone()),
    );
    for entry in &timing.user_timing {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            continue;
        };
        let key = format!("chromeUserTiming.{name}");
        if let Some(time) = entry.get("time").and_then(Value::as_f64) {
            let current = get_f64(record, &key);
            let earliest_wins = name.to_ascii_lowercase().starts_with("first");
            let replace = match current {
                None => true,
                Some(existing) => {
                    if earliest_wins {
                        time < existing
                    } else {
                        time > existing
                    }
                }
            };
            if replace {
                record.insert(key, json!(time));
            }
        } else if let Some(value) = entry.get("value") {
            record.insert(key, value.clone());
        }
    }

    if !timing.layout_shifts.is_empty() {
        let total = get_f64(record, "chromeUserTiming.TotalLayoutShift");
        let first_paint = get_f64(record, "chromeUserTiming.firstPaint");
        if let (Some(total), Some(first_paint)) = (total, first_paint) {
            let mut count = 0u64;
            let mut cumulative = 0.0f64;
            for shift in &timing.layout_shifts {
                if let Some(time) = shift.get("time").and_then(Value::as_f64) {
                    if time <= first_paint {
                        count += 1;
                        cumulative = shift
                            .get("cumulative_score")
                            .and_then(Value::as_f64)
                            .unwrap_or(cumulative);
                    }
                }
            }
            let fraction = if total > 0.0 { cumulative / total } else { 0.0 };
            record.insert(
                "LayoutShiftsBeforePaint".to_string(),
                json!({
                    "count": count,
                    "cumulative_score": cumulative,
                    "fraction_of_total": fraction,
                }),
            );
        }
        record.insert(
            "LayoutShifts".to_string(),
            Value::Array(timing.layout_shifts),
        );
    }
}

/// TTI, TBT and max-FID from interactive windows, long tasks and requests.
fn apply_interactive_metrics(record: &mut PageRecord, local: &RunPaths) {
    let periods = match record.get("interactivePeriods") {
        Some(value) => window_pairs(value),
        None => return,
    };
    if periods.is_empty() {
        return;
    }
    let seek_start = positive(record, "render")
        .or_else(|| positive(record, "firstContentfulPaint"))
        .or_else(|| positive(record, "firstPaint"))
        .unwrap_or(0.0);
    if seek_start <= 0.0 {
        return;
    }
    let dcl = get_f64(record, "domContentLoadedEventEnd");
    let long_tasks = record.get("longTasks").map(window_pairs);
    let requests = read_window_list(&local.requests_file()).unwrap_or_default();

    let result = interactive::calculate_time_to_interactive(
        seek_start,
        &periods,
        long_tasks.as_deref(),
        &requests,
        dcl,
    );

    if let Some(first) = result.first_interactive.filter(|f| *f > 0.0) {
        record.insert("FirstInteractive".to_string(), json!(first));
    }
    if let Some(tti) = result.tti.filter(|t| *t > 0.0) {
        record.insert("TimeToInteractive".to_string(), json!(tti));
    }
    if let Some(max_fid) = result.max_fid {
        record.insert("maxFID".to_string(), json!(max_fid));
    }
    if result.measurement_end > 0.0 {
        record.insert("TTIMeasurementEnd".to_string(), json!(result.measurement_end));
    }
    if result.last_interactive > 0.0 {
        record.insert("LastInteractive".to_string(), json!(result.last_interactive));
    }
    // When the page never produced a qualifying window but the measurement
    // ran at least 5s past the last interactive point, use that point.
    if !record.contains_key("TimeToInteractive")
        && result.measurement_end > 0.0
        && result.last_interactive > 0.0
        && result.measurement_end - result.last_interactive >= 5000.0
    {
        record.insert("TimeToInteractive".to_string(), json!(result.last_interactive));
        if !record.contains_key("FirstInteractive") {
            record.insert("FirstInteractive".to_string(), json!(result.last_interactive));
        }
    }
    if let Some(first) = record.get("FirstInteractive").cloned() {
        record.insert("FirstCPUIdle".to_string(), first);
    }
    if let Some(tbt) = result.total_blocking_time {
        record.insert("TotalBlockingTime".to_string(), json!(tbt));
    }
}

fn apply_effective_bps(record: &mut PageRecord) {
    let ttfb = get_f64(record, "TTFB").unwrap_or(0.0);
    if ttfb <= 0.0 {
        return;
    }
    if let (Some(fully_loaded), Some(bytes_in)) =
        (positive(record, "fullyLoaded"), positive(record, "bytesIn"))
    {
        if fully_loaded > ttfb {
            let bps = bytes_in / ((fully_loaded - ttfb) / 1000.0);
            record.insert("effectiveBps".to_string(), json!(bps as i64));
        }
    }
    if let (Some(doc_time), Some(bytes_in_doc)) =
        (positive(record, "docTime"), positive(record, "bytesInDoc"))
    {
        if doc_time > ttfb {
            let bps = bytes_in_doc / ((doc_time - ttfb) / 1000.0);
            record.insert("effectiveBpsDoc".to_string(), json!(bps as i64));
        }
    }
}

/// Attach test-level Lighthouse results. These are never cached because the
/// Lighthouse run can finish after the per-run records were cached.
fn attach_lighthouse(record: &mut PageRecord, local: &RunPaths) {
    if let Some(audits) = read_json_object(&local.lighthouse_audits_file()) {
        for (name, value) in audits {
            record.insert(format!("lighthouse.{name}"), value);
        }
        return;
    }
    let Some(lighthouse) = read_json_object(&local.lighthouse_json_file()) else {
        return;
    };
    if let Some(aggregations) = lighthouse.get("aggregations").and_then(Value::as_array) {
        for agg in aggregations {
            let scored = agg
                .get("scored")
                .map(|s| s.as_bool().unwrap_or_else(|| s.as_i64().unwrap_or(0) != 0))
                .unwrap_or(false);
            if let (Some(name), Some(total), true) = (
                agg.get("name").and_then(Value::as_str),
                agg.get("total"),
                scored,
            ) {
                let name: String = name.chars().filter(|c| *c != ' ').collect();
                record.insert(format!("lighthouse.{name}"), total.clone());
            }
        }
    } else if let Some(categories) = lighthouse.get("reportCategories").and_then(Value::as_array) {
        for category in categories {
            let (Some(name), Some(score)) = (
                category.get("name").and_then(Value::as_str),
                category.get("score").and_then(Value::as_f64),
            ) else {
                continue;
            };
            let compact: String = name.chars().filter(|c| *c != ' ').collect();
            record.insert(format!("lighthouse.{compact}"), json!(score / 100.0));
            if name == "Performance" {
                if let Some(audits) = category.get("audits").and_then(Value::as_array) {
                    for audit in audits {
                        if audit.get("group").and_then(Value::as_str) != Some("perf-metric") {
                            continue;
                        }
                        if let (Some(id), Some(raw)) = (
                            audit.get("id").and_then(Value::as_str),
                            audit.pointer("/result/rawValue"),
                        ) {
                            let id: String = id.chars().filter(|c| *c != ' ').collect();
                            record.insert(
                                format!("lighthouse.{compact}.{id}"),
                                raw.clone(),
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_json(path: &Path, value: &Value) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, serde_json::to_vec(value).unwrap()).unwrap();
    }

    fn base_page_data(dir: &Path, extra: &[(&str, Value)]) {
        let mut data = json!({
            "result": 0,
            "loadTime": 2500,
            "TTFB": 300,
            "fullyLoaded": 4000,
            "bytesIn": 400000,
            "requests": 30,
        });
        for (key, value) in extra {
            data[*key] = value.clone();
        }
        write_json(&dir.join("1_page_data.json"), &data);
    }

    #[test]
    fn test_record_from_reported_json() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[]);
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["result"], 0);
        assert_eq!(record["run"], 1);
        assert_eq!(record["cached"], 0);
        assert_eq!(record["requestsFull"], 30);
        // bytesIn / ((4000 - 300) / 1000)
        assert_eq!(record["effectiveBps"], 108108);
    }

    #[test]
    fn test_cache_round_trip_and_recalculate() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[]);
        let first =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert!(dir.path().join("1_page_data_10.json.gz").is_file());

        // A later change to the raw file is invisible until a recalculate.
        base_page_data(dir.path(), &[("loadTime", json!(9000))]);
        let cached =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(cached["loadTime"], first["loadTime"]);
        let fresh = load_page_run_data(
            dir.path(),
            1,
            false,
            None,
            LoadOptions {
                recalculate: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(fresh["loadTime"], 9000);
    }

    #[test]
    fn test_insane_times_clamped() {
        let dir = TempDir::new().unwrap();
        base_page_data(
            dir.path(),
            &[("render", json!(5_000_000)), ("domTime", json!(-20))],
        );
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["render"], 0);
        assert_eq!(record["domTime"], 0);
        assert_eq!(record["aft"], 0); // missing keys are zeroed too
    }

    #[test]
    fn test_first_paint_after_fully_loaded_zeroed() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[("firstPaint", json!(90000))]);
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["firstPaint"], 0);
    }

    #[test]
    fn test_test_level_error_sets_sentinel() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[]);
        let info = json!({
            "id": "260830_AB_1",
            "errors": {"1": {"0": "agent crashed"}}
        });
        let record = load_page_run_data(
            dir.path(),
            1,
            false,
            info.as_object(),
            LoadOptions::default(),
        )
        .unwrap();
        assert_eq!(record["result"], 99995);
        assert_eq!(record["error"], "agent crashed");
        assert_eq!(record["testID"], "260830_AB_1");
    }

    #[test]
    fn test_user_timing_marks() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[]);
        write_json(
            &dir.path().join("1_timed_events.json"),
            &json!([
                {"name": "hero:visible", "startTime": 812.6, "entryType": "mark"},
                {"name": "too late", "startTime": 4_000_000.0, "entryType": "mark"},
                {"name": "fetch", "startTime": 100.0, "duration": 241.7, "entryType": "measure"},
            ]),
        );
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["userTime.hero_visible"], 813);
        assert_eq!(record["userTimes"]["hero_visible"], 813);
        assert_eq!(record["userTime"], 813);
        assert_eq!(record["userTimingMeasure.fetch"], 242);
        assert!(!record.contains_key("userTime.too late"));
    }

    #[test]
    fn test_custom_metrics_typed() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[]);
        write_json(
            &dir.path().join("1_metrics.json"),
            &json!({"adCount": "12", "heroRatio": "0.43", "generator": "wordpress"}),
        );
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["adCount"], 12);
        assert_eq!(record["heroRatio"], 0.43);
        assert_eq!(record["generator"], "wordpress");
        let custom = record["custom"].as_array().unwrap();
        assert_eq!(custom.len(), 3);
    }

    #[test]
    fn test_video_frames_fill_visual_metrics() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[("testStartOffset", json!(100))]);
        let video = dir.path().join("video_1");
        std::fs::create_dir_all(&video).unwrap();
        for name in ["ms_000100.jpg", "ms_000600.jpg", "ms_002400.jpg"] {
            std::fs::write(video.join(name), b"frame").unwrap();
        }
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["lastVisualChange"], 2300);
        assert_eq!(record["visualComplete"], 2300);
        assert_eq!(record["render"], 500);
    }

    #[test]
    fn test_tti_from_side_files() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[("render", json!(900))]);
        write_json(
            &dir.path().join("1_interactive.json"),
            &json!([[1000, 2000], [2500, 12000]]),
        );
        write_json(
            &dir.path().join("1_long_tasks.json"),
            &json!([[1200, 1500]]),
        );
        write_json(
            &dir.path().join("1_requests.json"),
            &json!([{"contentType": "text/html", "method": "GET",
                     "load_start": 0, "load_end": 1200}]),
        );
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["TimeToInteractive"], 2500.0);
        assert_eq!(record["FirstInteractive"], 2500.0);
        assert_eq!(record["FirstCPUIdle"], 2500.0);
        assert_eq!(record["TTIMeasurementEnd"], 12000.0);
        // 1500 - (1200 + 50)
        assert_eq!(record["TotalBlockingTime"], 250.0);
        assert_eq!(record["maxFID"], 250.0);
    }

    #[test]
    fn test_chrome_user_timing_merge() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[("browser_version", json!("96.0.4664.45"))]);
        write_json(
            &dir.path().join("1_user_timing.json"),
            &json!([
                {"name": "navigationStart", "ts": 0, "args": {"frame": "F1"}},
                {"name": "firstPaint", "ts": 600_000, "args": {"frame": "F1"}},
                {"name": "firstPaint", "ts": 400_000, "args": {"frame": "F1"}},
                {"name": "domComplete", "ts": 900_000, "args": {"frame": "F1"}},
                {"name": "domComplete", "ts": 1_500_000, "args": {"frame": "F1"}},
                {"name": "LayoutShift", "ts": 300_000,
                 "args": {"frame": "F1", "data": {"is_main_frame": true, "score": 0.2}}},
            ]),
        );
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        // Earliest firstPaint, latest domComplete.
        assert_eq!(record["chromeUserTiming.firstPaint"], 400.0);
        assert_eq!(record["chromeUserTiming.domComplete"], 1500.0);
        assert_eq!(record["chromeUserTiming.TotalLayoutShift"], 0.2);
        let before_paint = &record["LayoutShiftsBeforePaint"];
        assert_eq!(before_paint["count"], 1);
        assert_eq!(before_paint["fraction_of_total"], 1.0);
    }

    #[test]
    fn test_visual_test_substitutes_timings() {
        let dir = TempDir::new().unwrap();
        base_page_data(
            dir.path(),
            &[
                ("visualTest", json!(1)),
                ("visualComplete", json!(1800)),
                ("lastVisualChange", json!(2100)),
            ],
        );
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["loadTime"], 1800);
        assert_eq!(record["docTime"], 1800);
        assert_eq!(record["fullyLoaded"], 2100);
    }

    #[test]
    fn test_load_all_requires_completion() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[]);
        write_json(
            &dir.path().join("testinfo.json"),
            &json!({"id": "260830_AB_1", "runs": 1, "fvonly": 1}),
        );
        assert!(load_all_page_data(dir.path(), LoadOptions::default()).is_empty());

        std::fs::write(dir.path().join("test.complete"), b"").unwrap();
        let runs = load_all_page_data(dir.path(), LoadOptions::default());
        assert_eq!(runs.len(), 1);
        assert!(runs[&1].contains_key(&stats::FIRST_VIEW));
        assert!(!runs[&1].contains_key(&stats::REPEAT_VIEW));
    }

    #[test]
    fn test_lighthouse_report_categories() {
        let dir = TempDir::new().unwrap();
        base_page_data(dir.path(), &[]);
        write_json(
            &dir.path().join("lighthouse.json"),
            &json!({"reportCategories": [{
                "name": "Performance",
                "score": 87.0,
                "audits": [
                    {"id": "interactive", "group": "perf-metric",
                     "result": {"rawValue": 4821.0}},
                    {"id": "unused-css", "group": "diagnostics",
                     "result": {"rawValue": 12.0}},
                ]
            }]}),
        );
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["lighthouse.Performance"], 0.87);
        assert_eq!(record["lighthouse.Performance.interactive"], 4821.0);
        assert!(!record.contains_key("lighthouse.Performance.unused-css"));
    }

    #[test]
    fn test_pcap_fallbacks_and_load_time_backfill() {
        let dir = TempDir::new().unwrap();
        write_json(
            &dir.path().join("1_page_data.json"),
            &json!({
                "result": 0,
                "loadTime": 0,
                "fullyLoaded": 3200,
                "bytesIn": 0,
                "pcapBytesIn": 250000,
            }),
        );
        let record =
            load_page_run_data(dir.path(), 1, false, None, LoadOptions::default()).unwrap();
        assert_eq!(record["loadTime"], 3200.0);
        assert_eq!(record["bytesIn"], 250000.0);
        assert_eq!(record["bytesInDoc"], 250000.0);
    }
}
