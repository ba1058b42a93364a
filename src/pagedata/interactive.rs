//! Time-to-interactive estimation from interactive periods, long tasks and
//! the network request log.
//!
//! An interactive window is a span where the main thread had no long tasks.
//! TTI is the start of the first such window of at least 5 seconds that also
//! overlaps a 5 second network-quiet window (no more than 2 in-flight GET
//! requests) by at least 5 seconds.

use serde_json::Value;

pub struct InteractiveResult {
    pub tti: Option<f64>,
    pub first_interactive: Option<f64>,
    pub last_interactive: f64,
    pub measurement_end: f64,
    pub total_blocking_time: Option<f64>,
    pub max_fid: Option<f64>,
}

fn request_f64(request: &Value, key: &str) -> Option<f64> {
    request.get(key).and_then(Value::as_f64)
}

/// Network-quiet windows of 5+ seconds with at most 2 concurrent GET
/// requests, bounded by `trailing_end` (the last interactive window's end).
fn quiet_windows(requests: &[Value], start_time: f64, trailing_end: f64) -> Vec<(f64, f64)> {
    let mut events: Vec<(f64, bool)> = Vec::new();
    for request in requests {
        if request.get("contentType").is_none() {
            continue;
        }
        let method = request.get("method").and_then(Value::as_str).unwrap_or("GET");
        if method != "GET" {
            continue;
        }
        match (request_f64(request, "load_start"), request_f64(request, "load_end")) {
            (Some(start), Some(end)) if start >= 0.0 && end >= start_time => {
                events.push((start, true));
                events.push((end, false));
            }
            _ => {}
        }
    }
    if events.is_empty() {
        return Vec::new();
    }
    events.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut windows = Vec::new();
    let mut window_start: Option<f64> = Some(0.0);
    let mut in_flight = 0i32;
    for (time, is_start) in events {
        if is_start {
            in_flight += 1;
            if let Some(start) = window_start {
                if in_flight > 2 {
                    if time - start >= 5000.0 {
                        windows.push((start, time));
                    }
                    window_start = None;
                }
            }
        } else {
            in_flight -= 1;
            if window_start.is_none() && in_flight <= 2 {
                window_start = Some(time);
            }
        }
    }
    if let Some(start) = window_start {
        if trailing_end - start >= 5000.0 {
            windows.push((start, trailing_end));
        }
    }
    windows
}

pub fn calculate_time_to_interactive(
    start_time: f64,
    interactive_windows: &[(f64, f64)],
    long_tasks: Option<&[(f64, f64)]>,
    requests: &[Value],
    dcl: Option<f64>,
) -> InteractiveResult {
    let mut measurement_end = 0.0f64;
    let mut last_interactive = 0.0f64;
    for &(start, end) in interactive_windows {
        if end > measurement_end {
            measurement_end = end.max(start_time);
            last_interactive = start.max(start_time);
        }
    }

    // Keep only 5+ second windows that do not end before the start time.
    let mut trailing_end = 0.0f64;
    let mut first_interactive: Option<f64> = None;
    let mut candidates: Vec<(f64, f64)> = Vec::new();
    for &(start, end) in interactive_windows {
        trailing_end = end;
        if end >= start_time && end - start >= 5000.0 {
            candidates.push((start, end));
            if first_interactive.map(|f| start < f).unwrap_or(true) {
                first_interactive = Some(start.max(start_time));
            }
        }
    }

    let mut tti: Option<f64> = None;
    if !candidates.is_empty() {
        let quiet = quiet_windows(requests, start_time, trailing_end);
        'search: for &(i_start, i_end) in &candidates {
            for &(q_start, q_end) in &quiet {
                if i_end.min(q_end) - i_start.max(q_start) >= 5000.0 {
                    tti = Some(start_time.max(i_start));
                    break 'search;
                }
            }
        }
    }

    // Total blocking time and the longest possible first-input delay, summed
    // up to TTI (or the last interactive measurement when TTI is unknown).
    let end_time = tti.unwrap_or(last_interactive);
    let mut total_blocking_time = None;
    let mut max_fid = None;
    if let Some(tasks) = long_tasks {
        let mut total = 0.0f64;
        let mut longest = 0.0f64;
        if end_time > start_time {
            for &(task_start, task_end) in tasks {
                // The first 50ms of a long task do not count as blocking.
                let busy = task_end.min(end_time) - (task_start.max(start_time) + 50.0);
                if busy > 0.0 {
                    total += busy;
                    longest = longest.max(busy);
                }
            }
        }
        total_blocking_time = Some(total);
        max_fid = Some(longest);
    }

    if let Some(dcl) = dcl {
        if tti.map(|t| t > 0.0 && dcl > t).unwrap_or(false) {
            tti = Some(dcl);
        }
        if first_interactive.map(|f| f > 0.0 && dcl > f).unwrap_or(false) {
            first_interactive = Some(dcl);
        }
    }

    InteractiveResult {
        tti,
        first_interactive,
        last_interactive,
        measurement_end,
        total_blocking_time,
        max_fid,
    }
}
