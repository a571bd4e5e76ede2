//! Formatting helpers: timestamps, readable durations, access-log records
//! and socket path derivation.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Current local time as `YYYY-MM-DD HH:MM:SS.mmm`.
pub fn timestamp() -> String {
    format_timestamp(Local::now())
}

/// Format a local time as `YYYY-MM-DD HH:MM:SS.mmm`.
pub fn format_timestamp(time: DateTime<Local>) -> String {
    time.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Render a duration with a unit chosen so the number stays readable.
///
/// At most three significant digits: `850ns`, `12.3µs`, `1.25ms`, `2.00s`.
pub fn scale_duration(duration: Duration) -> String {
    let nanos = round_significant(duration.as_nanos(), 3);
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }

    let (value, unit) = if nanos < 1_000_000 {
        (nanos as f64 / 1e3, "µs")
    } else if nanos < 1_000_000_000 {
        (nanos as f64 / 1e6, "ms")
    } else {
        (nanos as f64 / 1e9, "s")
    };

    if value < 10.0 {
        format!("{:.2}{}", value, unit)
    } else if value < 100.0 {
        format!("{:.1}{}", value, unit)
    } else {
        format!("{:.0}{}", value, unit)
    }
}

/// Round half up to `digits` significant digits, so the unit is picked
/// from the value that will actually be printed.
fn round_significant(value: u128, digits: u32) -> u128 {
    let len = value.checked_ilog10().map_or(1, |log| log + 1);
    if len <= digits {
        return value;
    }
    let factor = 10u128.pow(len - digits);
    (value + factor / 2) / factor * factor
}

/// Socket file prefix for an application.
///
/// Characters outside `[A-Za-z0-9_-]` are replaced so the prefix is always
/// a single safe path component.
pub fn socket_prefix(app: &str) -> String {
    let sanitized: String = app
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("rip-{}", sanitized)
}

/// Socket path for worker `id`: `<dir>/<prefix>-<id>.sock`.
pub fn socket_path(dir: impl AsRef<Path>, prefix: &str, id: usize) -> PathBuf {
    dir.as_ref().join(format!("{}-{}.sock", prefix, id))
}

/// Parse the worker id out of a socket file name produced by [`socket_path`].
pub fn parse_worker_id(file_name: &str, prefix: &str) -> Option<usize> {
    file_name
        .strip_prefix(prefix)?
        .strip_prefix('-')?
        .strip_suffix(".sock")?
        .parse()
        .ok()
}

/// One forwarded request, as written to the access log.
#[derive(Debug, Clone, Serialize)]
pub struct AccessRecord {
    pub timestamp: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub bytes: usize,
    #[serde(rename = "total_ms", serialize_with = "as_millis")]
    pub total: Duration,
    #[serde(rename = "worker_ms", serialize_with = "as_opt_millis")]
    pub worker: Option<Duration>,
    pub worker_id: Option<u32>,
}

impl AccessRecord {
    /// Human-readable single line.
    pub fn human(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {}B total={}",
            self.timestamp,
            self.method,
            self.path,
            self.status,
            self.bytes,
            scale_duration(self.total)
        );
        if let Some(worker) = self.worker {
            line.push_str(&format!(" worker={}", scale_duration(worker)));
        }
        if let Some(id) = self.worker_id {
            line.push_str(&format!(" w{}", id));
        }
        line
    }

    /// Single JSON object.
    pub fn json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.human())
    }

    /// Render in the requested format.
    pub fn render(&self, json: bool) -> String {
        if json { self.json() } else { self.human() }
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1e3)
}

fn as_opt_millis<S: serde::Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_f64(d.as_secs_f64() * 1e3),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_scale_duration_units() {
        assert_eq!(scale_duration(Duration::from_nanos(850)), "850ns");
        assert_eq!(scale_duration(Duration::from_nanos(12_300)), "12.3µs");
        assert_eq!(scale_duration(Duration::from_micros(1_250)), "1.25ms");
        assert_eq!(scale_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(scale_duration(Duration::from_secs(2)), "2.00s");
    }

    #[test]
    fn test_scale_duration_rounds_before_picking_unit() {
        assert_eq!(scale_duration(Duration::from_micros(999_500)), "1.00s");
        assert_eq!(scale_duration(Duration::from_nanos(9_999_600)), "10.0ms");
        assert_eq!(scale_duration(Duration::from_nanos(99_960)), "100µs");
        assert_eq!(scale_duration(Duration::from_nanos(999_999)), "1.00ms");
        assert_eq!(scale_duration(Duration::from_nanos(1_234_567)), "1.23ms");
        assert_eq!(scale_duration(Duration::from_nanos(999)), "999ns");
    }

    #[test]
    fn test_format_timestamp() {
        let time = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(format_timestamp(time), "2024-03-09 07:05:01.000");
    }

    #[test]
    fn test_socket_prefix_sanitizes() {
        assert_eq!(socket_prefix("blog"), "rip-blog");
        assert_eq!(socket_prefix("my app/v2"), "rip-my_app_v2");
    }

    #[test]
    fn test_socket_path_and_parse() {
        let path = socket_path("/tmp/rip", "rip-blog", 3);
        assert_eq!(path, PathBuf::from("/tmp/rip/rip-blog-3.sock"));

        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_worker_id(name, "rip-blog"), Some(3));
        assert_eq!(parse_worker_id("rip-blog-x.sock", "rip-blog"), None);
        assert_eq!(parse_worker_id("rip-blogger-1.sock", "rip-blog"), None);
        assert_eq!(parse_worker_id("rip-blog-1.pid", "rip-blog"), None);
    }

    fn record() -> AccessRecord {
        AccessRecord {
            timestamp: "2024-03-09 07:05:01.000".to_string(),
            method: "GET".to_string(),
            path: "/hello".to_string(),
            status: 200,
            bytes: 12,
            total: Duration::from_micros(1_500),
            worker: Some(Duration::from_micros(900)),
            worker_id: Some(2),
        }
    }

    #[test]
    fn test_access_record_human() {
        assert_eq!(
            record().human(),
            "2024-03-09 07:05:01.000 GET /hello 200 12B total=1.50ms worker=900µs w2"
        );

        let mut bare = record();
        bare.worker = None;
        bare.worker_id = None;
        assert!(bare.human().ends_with("total=1.50ms"));
    }

    #[test]
    fn test_access_record_json() {
        let value: serde_json::Value = serde_json::from_str(&record().json()).unwrap();
        assert_eq!(value["method"], "GET");
        assert_eq!(value["status"], 200);
        assert_eq!(value["worker_id"], 2);
        assert!((value["total_ms"].as_f64().unwrap() - 1.5).abs() < 1e-9);
        assert!((value["worker_ms"].as_f64().unwrap() - 0.9).abs() < 1e-9);
    }
}
