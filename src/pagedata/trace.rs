//! Chrome trace user-timing extraction.
//!
//! Pulls milestone timings, largest-paint candidates, element timing and
//! windowed layout-shift scores out of the raw trace events. Only events on
//! the main frame count; the main frame is identified from explicit tags and
//! falls back to the frame of the first navigation event.

use serde_json::{json, Map, Value};
use std::sync::OnceLock;

pub struct TraceTiming {
    /// `{name, time}` milestones plus `{name, value}` scores.
    pub user_timing: Vec<Value>,
    pub layout_shifts: Vec<Value>,
}

fn event_str<'a>(event: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = event;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str()
}

fn event_value<'a>(event: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = event;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}

fn event_f64(event: &Value, path: &[&str]) -> Option<f64> {
    event_value(event, path)?.as_f64()
}

fn event_bool(event: &Value, path: &[&str]) -> bool {
    event_value(event, path)
        .map(|v| v.as_bool().unwrap_or_else(|| v.as_i64().unwrap_or(0) != 0))
        .unwrap_or(false)
}

fn frame_of(event: &Value) -> Option<&str> {
    event_str(event, &["args", "frame"])
}

fn find_main_frames(events: &[Value]) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    for event in events {
        let Some(frame) = frame_of(event) else {
            continue;
        };
        if event.get("name").is_none() || frames.iter().any(|f| f == frame) {
            continue;
        }
        let tagged_loading = event_bool(event, &["args", "data", "isLoadingMainFrame"])
            && event_str(event, &["args", "data", "documentLoaderURL"])
                .map(|u| !u.is_empty())
                .unwrap_or(false);
        let tagged_main = event_bool(event, &["args", "data", "isMainFrame"]);
        let marked = event.get("name").and_then(Value::as_str) == Some("markAsMainFrame");
        if tagged_loading || tagged_main || marked {
            frames.push(frame.to_string());
        }
    }
    frames
}

/// Milestone time for an event: explicit `args.value` wins, else elapsed ms
/// from the trace start, with `durationInMilliseconds` overriding both.
fn event_time(event: &Value, start_time: f64) -> Option<f64> {
    let mut time = match event_f64(event, &["args", "value"]) {
        Some(value) => Some(value),
        None => event_f64(event, &["ts"]).map(|ts| ((ts - start_time) / 1000.0).trunc()),
    };
    if let Some(duration) = event_f64(event, &["args", "data", "durationInMilliseconds"]) {
        time = Some(duration);
    }
    time
}

fn in_scope(event: &Value, main_frames: &[String], start_time: f64) -> bool {
    let Some(frame) = frame_of(event) else {
        return false;
    };
    if !main_frames.iter().any(|f| f == frame) {
        return false;
    }
    let has_value = event_value(event, &["args", "value"]).is_some();
    event_f64(event, &["ts"]).map(|ts| ts >= start_time).unwrap_or(false) || has_value
}

fn background_image_url(styles: &Value) -> Option<String> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r#"url\("?'?([^"')]+)"#).unwrap());
    let background = styles.get("background-image")?.as_str()?;
    re.captures(background)
        .map(|c| c.get(1).map(|m| m.as_str().to_string()))?
}

/// Parse the trace user-timing events, filling largest-paint, element-timing
/// and LCP attribution fields into `page_data` along the way.
pub fn parse_user_timing(
    events: &[Value],
    browser_version: Option<f64>,
    page_data: &mut Map<String, Value>,
) -> Option<TraceTiming> {
    let mut events: Vec<Value> = events.to_vec();
    events.sort_by(|a, b| {
        let a_ts = event_f64(a, &["ts"]).unwrap_or(0.0);
        let b_ts = event_f64(b, &["ts"]).unwrap_or(0.0);
        a_ts.partial_cmp(&b_ts).unwrap_or(std::cmp::Ordering::Equal)
    });

    // Explicit start time wins; otherwise the first event's timestamp.
    let mut start_time = events
        .iter()
        .filter_map(|e| event_f64(e, &["startTime"]))
        .last();

    let mut main_frames = find_main_frames(&events);
    for event in &events {
        if event.get("name").is_none() || event.get("ts").is_none() {
            continue;
        }
        if start_time.is_none() {
            start_time = event_f64(event, &["ts"]);
        }
        if main_frames.is_empty() {
            let name = event.get("name").and_then(Value::as_str).unwrap_or("");
            if matches!(
                name,
                "navigationStart" | "unloadEventStart" | "redirectStart" | "domLoading"
            ) {
                if let Some(frame) = frame_of(event) {
                    main_frames.push(frame.to_string());
                    break;
                }
            }
        }
    }
    let start_time = start_time?;
    if main_frames.is_empty() {
        return None;
    }

    // Largest* events: keep the biggest candidate per event name.
    let mut largest: Map<String, Value> = Map::new();
    let mut largest_paints: Vec<Value> = Vec::new();
    for event in &events {
        let name = match event.get("name").and_then(Value::as_str) {
            Some(n) => n,
            None => continue,
        };
        if in_scope(event, &main_frames, start_time)
            && name.to_ascii_lowercase().starts_with("largest")
        {
            if let Some(size) = event_f64(event, &["args", "data", "size"]) {
                let current_size = largest
                    .get(name)
                    .and_then(|e| event_f64(e, &["args", "data", "size"]))
                    .unwrap_or(f64::NEG_INFINITY);
                if size > current_size {
                    if let Some(time) = event_time(event, start_time) {
                        let mut tagged = event.clone();
                        tagged["time"] = json!(time);
                        largest.insert(name.to_string(), tagged);

                        let mut paint = Map::new();
                        paint.insert("event".to_string(), json!(name));
                        paint.insert("time".to_string(), json!(time));
                        paint.insert("size".to_string(), json!(size));
                        for (source, target) in [
                            ("DOMNodeId", "DOMNodeId"),
                            ("node", "nodeInfo"),
                            ("element", "element"),
                            ("type", "type"),
                        ] {
                            if let Some(value) = event_value(event, &["args", "data", source]) {
                                paint.insert(target.to_string(), value.clone());
                            }
                        }
                        largest_paints.push(Value::Object(paint));
                    }
                }
            }
        }
        if in_scope(event, &main_frames, start_time) && name == "PerformanceElementTiming" {
            let identifier = event_str(event, &["args", "data", "identifier"]).unwrap_or("");
            let render_time = event_value(event, &["args", "data", "renderTime"])
                .cloned()
                .unwrap_or(Value::Null);
            let entry = json!({
                "identifier": identifier,
                "time": render_time,
                "elementType": event_value(event, &["args", "data", "elementType"]).cloned().unwrap_or(Value::Null),
                "url": event_value(event, &["args", "data", "url"]).cloned().unwrap_or(Value::Null),
            });
            page_data
                .entry("elementTiming".to_string())
                .or_insert_with(|| Value::Array(Vec::new()))
                .as_array_mut()
                .map(|list| list.push(entry));
            page_data.insert(format!("elementTiming.{identifier}"), render_time);
        }
    }
    if !largest_paints.is_empty() {
        page_data.insert("largestPaints".to_string(), Value::Array(largest_paints));
    }

    let mut user_timing: Vec<Value> = Vec::new();
    let mut layout_shifts: Vec<Value> = Vec::new();
    let mut total_layout_shift: Option<f64> = None;
    let mut max_layout_window = 0.0f64;

    // Layout-shift scoring only became reliable in Chrome 81.
    if browser_version.map(|v| v >= 81.0).unwrap_or(false) {
        total_layout_shift = Some(0.0);
        let mut first_shift = 0.0f64;
        let mut prev_shift = 0.0f64;
        let mut window_score = 0.0f64;
        let mut shift_window_num = 0u64;

        for event in &events {
            if !in_scope(event, &main_frames, start_time) {
                continue;
            }
            let name = match event.get("name").and_then(Value::as_str) {
                Some(n) => n,
                None => continue,
            };
            let Some(time) = event_time(event, start_time) else {
                continue;
            };
            if name == "LayoutShift" && event_bool(event, &["args", "data", "is_main_frame"]) {
                if let Some(score) = event_f64(event, &["args", "data", "score"]) {
                    let total = total_layout_shift.get_or_insert(0.0);
                    *total += score;

                    // A shift starts a new window when the current window is
                    // older than 5s or the gap since the last shift exceeds 1s.
                    if time - first_shift > 5000.0 || time - prev_shift > 1000.0 {
                        first_shift = time;
                        window_score = 0.0;
                        shift_window_num += 1;
                    }
                    prev_shift = time;
                    window_score += score;
                    max_layout_window = max_layout_window.max(window_score);

                    let mut shift = Map::new();
                    shift.insert("time".to_string(), json!(time));
                    shift.insert("score".to_string(), json!(score));
                    shift.insert("cumulative_score".to_string(), json!(*total));
                    shift.insert("window_score".to_string(), json!(window_score));
                    shift.insert("shift_window_num".to_string(), json!(shift_window_num));
                    if let Some(rects) = event_value(event, &["args", "data", "region_rects"]) {
                        shift.insert("rects".to_string(), rects.clone());
                    }
                    if let Some(sources) = event_value(event, &["args", "data", "sources"]) {
                        shift.insert("sources".to_string(), sources.clone());
                    }
                    layout_shifts.push(Value::Object(shift));
                }
            }
            if !largest.contains_key(name) {
                user_timing.push(json!({"name": name, "time": time}));
            }
        }
    }

    for (name, event) in &largest {
        user_timing.push(json!({"name": name, "time": event["time"]}));
    }

    // LCP attribution.
    if let Some(lcp) = largest.get("LargestContentfulPaint") {
        if let Some(lcp_type) = event_str(lcp, &["args", "data", "type"]) {
            page_data.insert("LargestContentfulPaintType".to_string(), json!(lcp_type));
            let lcp_time = lcp.get("time").cloned().unwrap_or(Value::Null);
            let paints = page_data
                .get("largestPaints")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let matching_event = if lcp_type == "image" {
                "LargestImagePaint"
            } else {
                "LargestTextPaint"
            };
            for paint in &paints {
                if paint.get("event").and_then(Value::as_str) != Some(matching_event)
                    || paint.get("time") != Some(&lcp_time)
                {
                    continue;
                }
                if let Some(node_type) = event_value(paint, &["nodeInfo", "nodeType"]) {
                    page_data.insert(
                        "LargestContentfulPaintNodeType".to_string(),
                        node_type.clone(),
                    );
                }
                if lcp_type == "image" {
                    if let Some(url) = event_str(paint, &["nodeInfo", "sourceURL"]) {
                        page_data
                            .insert("LargestContentfulPaintImageURL".to_string(), json!(url));
                    } else if let Some(styles) = event_value(paint, &["nodeInfo", "styles"]) {
                        if let Some(url) = background_image_url(styles) {
                            page_data.insert(
                                "LargestContentfulPaintType".to_string(),
                                json!("background-image"),
                            );
                            page_data
                                .insert("LargestContentfulPaintImageURL".to_string(), json!(url));
                        }
                    }
                }
            }
        }
    }

    if let Some(total) = total_layout_shift {
        user_timing.push(json!({"name": "TotalLayoutShift", "value": total}));
    }
    user_timing.push(json!({"name": "CumulativeLayoutShift", "value": max_layout_window}));

    Some(TraceTiming {
        user_timing,
        layout_shifts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nav_event(ts: f64, frame: &str) -> Value {
        json!({"name": "navigationStart", "ts": ts, "args": {"frame": frame}})
    }

    fn shift_event(ts_ms: f64, score: f64) -> Value {
        json!({
            "name": "LayoutShift",
            "ts": ts_ms * 1000.0,
            "args": {"frame": "F1", "data": {"is_main_frame": true, "score": score}}
        })
    }

    fn parse(events: Vec<Value>, version: f64) -> (TraceTiming, Map<String, Value>) {
        let mut page_data = Map::new();
        let timing = parse_user_timing(&events, Some(version), &mut page_data).unwrap();
        (timing, page_data)
    }

    fn named_value(timing: &TraceTiming, name: &str) -> Option<Value> {
        timing
            .user_timing
            .iter()
            .find(|e| e["name"] == name)
            .map(|e| e.get("value").or_else(|| e.get("time")).cloned().unwrap())
    }

    #[test]
    fn test_milestones_relative_to_first_navigation() {
        let events = vec![
            nav_event(1_000_000.0, "F1"),
            json!({"name": "firstPaint", "ts": 1_500_000.0, "args": {"frame": "F1"}}),
            json!({"name": "offFrame", "ts": 1_600_000.0, "args": {"frame": "F2"}}),
        ];
        let (timing, _) = parse(events, 90.0);
        assert_eq!(named_value(&timing, "firstPaint"), Some(json!(500.0)));
        assert!(named_value(&timing, "offFrame").is_none());
    }

    #[test]
    fn test_cls_window_accounting() {
        // Shifts at 0, 1000 and 6500ms: the 6.5s shift is both past the 5s
        // window age and past the 1s gap, so it opens a second window.
        let mut events = vec![nav_event(0.0, "F1")];
        events.push(shift_event(0.0, 0.1));
        events.push(shift_event(1000.0, 0.1));
        events.push(shift_event(6500.0, 0.1));
        let (timing, _) = parse(events, 90.0);
        let total = named_value(&timing, "TotalLayoutShift").unwrap();
        let max_window = named_value(&timing, "CumulativeLayoutShift").unwrap();
        assert!((total.as_f64().unwrap() - 0.3).abs() < 1e-9);
        assert!((max_window.as_f64().unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_cls_skipped_for_old_browsers() {
        let events = vec![nav_event(0.0, "F1"), shift_event(100.0, 0.25)];
        let (timing, _) = parse(events, 80.0);
        assert!(named_value(&timing, "TotalLayoutShift").is_none());
        assert_eq!(named_value(&timing, "CumulativeLayoutShift"), Some(json!(0.0)));
        assert!(timing.layout_shifts.is_empty());
    }

    #[test]
    fn test_largest_paint_keeps_biggest() {
        let events = vec![
            nav_event(0.0, "F1"),
            json!({"name": "LargestImagePaint", "ts": 100_000.0,
                   "args": {"frame": "F1", "data": {"size": 100}}}),
            json!({"name": "LargestImagePaint", "ts": 400_000.0,
                   "args": {"frame": "F1", "data": {"size": 5000}}}),
            json!({"name": "LargestImagePaint", "ts": 600_000.0,
                   "args": {"frame": "F1", "data": {"size": 50}}}),
        ];
        let (timing, page_data) = parse(events, 90.0);
        assert_eq!(named_value(&timing, "LargestImagePaint"), Some(json!(400.0)));
        let paints = page_data["largestPaints"].as_array().unwrap();
        assert_eq!(paints.last().unwrap()["size"], 5000.0);
    }

    #[test]
    fn test_lcp_image_url_attribution() {
        let events = vec![
            nav_event(0.0, "F1"),
            json!({"name": "LargestImagePaint", "ts": 300_000.0,
                   "args": {"frame": "F1", "data": {"size": 900,
                       "node": {"nodeType": "IMG", "sourceURL": "https://example.com/hero.png"}}}}),
            json!({"name": "LargestContentfulPaint", "ts": 300_000.0,
                   "args": {"frame": "F1", "data": {"size": 900, "type": "image"}}}),
        ];
        let (_, page_data) = parse(events, 90.0);
        assert_eq!(page_data["LargestContentfulPaintType"], "image");
        assert_eq!(page_data["LargestContentfulPaintNodeType"], "IMG");
        assert_eq!(
            page_data["LargestContentfulPaintImageURL"],
            "https://example.com/hero.png"
        );
    }

    #[test]
    fn test_lcp_background_image_attribution() {
        let events = vec![
            nav_event(0.0, "F1"),
            json!({"name": "LargestImagePaint", "ts": 300_000.0,
                   "args": {"frame": "F1", "data": {"size": 900,
                       "node": {"styles": {"background-image": "url(\"https://example.com/bg.jpg\")"}}}}}),
            json!({"name": "LargestContentfulPaint", "ts": 300_000.0,
                   "args": {"frame": "F1", "data": {"size": 900, "type": "image"}}}),
        ];
        let (_, page_data) = parse(events, 90.0);
        assert_eq!(page_data["LargestContentfulPaintType"], "background-image");
        assert_eq!(
            page_data["LargestContentfulPaintImageURL"],
            "https://example.com/bg.jpg"
        );
    }

    #[test]
    fn test_no_main_frame_yields_nothing() {
        let events = vec![json!({"name": "something", "ts": 100.0, "args": {}})];
        let mut page_data = Map::new();
        assert!(parse_user_timing(&events, Some(90.0), &mut page_data).is_none());
    }

    #[test]
    fn test_element_timing_records() {
        let events = vec![
            nav_event(0.0, "F1"),
            json!({"name": "PerformanceElementTiming", "ts": 200_000.0,
                   "args": {"frame": "F1", "data": {"identifier": "hero", "renderTime": 180,
                            "elementType": "img", "url": "https://example.com/x.png"}}}),
        ];
        let (_, page_data) = parse(events, 90.0);
        assert_eq!(page_data["elementTiming.hero"], 180);
        let list = page_data["elementTiming"].as_array().unwrap();
        assert_eq!(list[0]["identifier"], "hero");
    }
}
