//! Legacy tab-delimited page metrics log.
//!
//! Older agents report one tab-separated record per page load with a fixed
//! column layout (header rows start with "Date"). Columns past 87 were added
//! over time and may be absent. Column numbers below are the positions after
//! splitting, matching the historical format exactly.

use crate::gzio;
use serde_json::{json, Map, Value};
use std::path::Path;

fn int_at(fields: &[&str], index: usize) -> i64 {
    fields
        .get(index)
        .map(|f| f.trim())
        .and_then(|f| f.parse::<f64>().ok())
        .map(|f| f as i64)
        .unwrap_or(0)
}

fn float_at(fields: &[&str], index: usize) -> f64 {
    fields
        .get(index)
        .map(|f| f.trim())
        .and_then(|f| f.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn str_at<'a>(fields: &[&'a str], index: usize) -> &'a str {
    fields.get(index).map(|f| f.trim()).unwrap_or("")
}

fn opt_int(fields: &[&str], index: usize) -> Option<i64> {
    let raw = fields.get(index)?.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok().map(|f| f as i64)
}

const INT_COLUMNS: [(&str, usize); 42] = [
    ("TTFB", 5),
    ("bytesOut", 7),
    ("bytesIn", 8),
    ("connections", 10),
    ("requests", 11),
    ("requestsFull", 11),
    ("responses_200", 12),
    ("responses_404", 15),
    ("responses_other", 16),
    ("result", 17),
    ("render", 18),
    ("fullyLoaded", 22),
    ("cached", 27),
    ("loadTime", 32),
    ("docTime", 32),
    ("domTime", 34),
    ("score_cache", 36),
    ("score_cdn", 37),
    ("score_gzip", 39),
    ("score_cookies", 40),
    ("score_keep-alive", 41),
    ("score_minify", 43),
    ("score_combine", 44),
    ("bytesOutDoc", 45),
    ("bytesInDoc", 46),
    ("requestsDoc", 49),
    ("score_compress", 55),
    ("score_etags", 58),
    ("gzip_total", 64),
    ("gzip_savings", 65),
    ("minify_total", 66),
    ("minify_savings", 67),
    ("image_total", 68),
    ("image_savings", 69),
    ("base_page_redirects", 70),
    ("optimization_checked", 71),
    ("aft", 72),
    ("domElements", 73),
    ("titleTime", 76),
    ("loadEventStart", 77),
    ("loadEventEnd", 78),
    ("domContentLoadedEventStart", 79),
];

const OPTIONAL_INT_COLUMNS: [(&str, usize); 9] = [
    ("browser_process_count", 98),
    ("browser_main_memory_kb", 99),
    ("browser_other_private_memory_kb", 100),
    ("domInteractive", 101),
    ("domLoading", 102),
    ("base_page_ttfb", 103),
    ("visualComplete", 104),
    ("SpeedIndex", 105),
    ("certificate_bytes", 106),
];

/// Parse one legacy record into a metric map, or None when the line is a
/// header or too short to hold data.
pub fn parse_log_line(line: &str) -> Option<Map<String, Value>> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() <= 34 || str_at(&fields, 0) == "Date" {
        return None;
    }

    let mut out = Map::new();
    out.insert("URL".to_string(), json!(str_at(&fields, 3)));
    out.insert("eventName".to_string(), json!(str_at(&fields, 2)));
    for (name, index) in INT_COLUMNS {
        out.insert(name.to_string(), json!(int_at(&fields, index)));
    }
    out.insert(
        "domContentLoadedEventEnd".to_string(),
        json!(int_at(&fields, 80)),
    );
    out.insert("lastVisualChange".to_string(), json!(int_at(&fields, 81)));
    out.insert("browser_name".to_string(), json!(str_at(&fields, 82)));
    out.insert("browser_version".to_string(), json!(str_at(&fields, 83)));
    out.insert("server_count".to_string(), json!(int_at(&fields, 84)));
    out.insert("server_rtt".to_string(), json!(int_at(&fields, 85)));
    out.insert("base_page_cdn".to_string(), json!(str_at(&fields, 86)));
    out.insert("adult_site".to_string(), json!(int_at(&fields, 87)));
    out.insert("title".to_string(), json!(str_at(&fields, 75)));

    out.insert(
        "fixed_viewport".to_string(),
        json!(opt_int(&fields, 88).unwrap_or(-1)),
    );
    out.insert(
        "score_progressive_jpeg".to_string(),
        json!(opt_int(&fields, 89).unwrap_or(-1)),
    );
    out.insert(
        "firstPaint".to_string(),
        json!(opt_int(&fields, 90).unwrap_or(0)),
    );
    out.insert("docCPUms".to_string(), json!(float_at(&fields, 93)));
    out.insert("fullyLoadedCPUms".to_string(), json!(float_at(&fields, 94)));
    out.insert("docCPUpct".to_string(), json!(float_at(&fields, 95)));
    out.insert(
        "fullyLoadedCPUpct".to_string(),
        json!(float_at(&fields, 96)),
    );
    out.insert(
        "isResponsive".to_string(),
        json!(opt_int(&fields, 97).unwrap_or(-1)),
    );
    for (name, index) in OPTIONAL_INT_COLUMNS {
        if let Some(value) = opt_int(&fields, index) {
            out.insert(name.to_string(), json!(value));
        }
    }
    if let (Some(main), Some(other)) = (
        out.get("browser_main_memory_kb").and_then(Value::as_i64),
        out.get("browser_other_private_memory_kb")
            .and_then(Value::as_i64),
    ) {
        out.insert("browser_working_set_kb".to_string(), json!(main + other));
    }

    Some(out)
}

/// Parse the first data record from a legacy log file.
pub fn load_log_file(path: &Path) -> Option<Map<String, Value>> {
    let lines = gzio::gz_read_lines(path)?;
    lines.iter().find_map(|line| parse_log_line(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Build a record with the named columns set and everything else blank.
    fn record(columns: &[(usize, &str)]) -> String {
        let max = columns.iter().map(|(i, _)| *i).max().unwrap_or(0);
        let mut fields = vec![""; max.max(40) + 1];
        for (index, value) in columns {
            fields[*index] = value;
        }
        fields.join("\t")
    }

    #[test]
    fn test_header_and_short_lines_skipped() {
        assert!(parse_log_line("Date\tTime\tEvent").is_none());
        let mut header = vec!["x"; 40];
        header[0] = "Date";
        assert!(parse_log_line(&header.join("\t")).is_none());
    }

    #[test]
    fn test_fixed_column_mapping() {
        let line = record(&[
            (3, "https://example.com/"),
            (5, "340"),
            (7, "1200"),
            (8, "450000"),
            (11, "42"),
            (17, "0"),
            (18, "900"),
            (22, "5200"),
            (32, "3100"),
            (82, "Chrome"),
            (83, "120.0"),
            (90, "850"),
            (104, "4000"),
            (105, "1700"),
        ]);
        let data = parse_log_line(&line).unwrap();
        assert_eq!(data["URL"], "https://example.com/");
        assert_eq!(data["TTFB"], 340);
        assert_eq!(data["bytesOut"], 1200);
        assert_eq!(data["bytesIn"], 450000);
        assert_eq!(data["requests"], 42);
        assert_eq!(data["result"], 0);
        assert_eq!(data["render"], 900);
        assert_eq!(data["fullyLoaded"], 5200);
        // loadTime and docTime share column 32.
        assert_eq!(data["loadTime"], 3100);
        assert_eq!(data["docTime"], 3100);
        assert_eq!(data["browser_name"], "Chrome");
        assert_eq!(data["firstPaint"], 850);
        assert_eq!(data["visualComplete"], 4000);
        assert_eq!(data["SpeedIndex"], 1700);
    }

    #[test]
    fn test_absent_trailing_columns_use_defaults() {
        let line = record(&[(3, "https://example.com/"), (17, "0")]);
        let data = parse_log_line(&line).unwrap();
        assert_eq!(data["fixed_viewport"], -1);
        assert_eq!(data["firstPaint"], 0);
        assert!(data.get("SpeedIndex").is_none());
        assert!(data.get("domInteractive").is_none());
    }

    #[test]
    fn test_working_set_derived_from_memory_columns() {
        let line = record(&[(3, "u"), (99, "1000"), (100, "500")]);
        let data = parse_log_line(&line).unwrap();
        assert_eq!(data["browser_working_set_kb"], 1500);
    }

    #[test]
    fn test_load_log_file_finds_first_data_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1_IEWPG.txt");
        let header = "Date\tTime";
        let data = record(&[(3, "https://example.com/"), (32, "2500")]);
        gzio::gz_write(&path, format!("{header}\n{data}\n").as_bytes()).unwrap();
        let parsed = load_log_file(&path).unwrap();
        assert_eq!(parsed["loadTime"], 2500);
    }
}
