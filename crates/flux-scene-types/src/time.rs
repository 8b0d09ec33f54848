//! ISO-8601 时间戳与 epoch 秒之间的转换

use chrono::{DateTime, TimeZone, Utc};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// 解析 ISO-8601 时间戳为 epoch 秒
pub fn parse_iso(ts: &str) -> Option<f64> {
    let parsed = DateTime::parse_from_rfc3339(ts).ok()?;
    Some(parsed.timestamp_micros() as f64 / 1_000_000.0)
}

/// epoch 秒格式化为毫秒精度的 ISO-8601（UTC）
pub fn format_iso(epoch: f64) -> String {
    let micros = (epoch * 1_000_000.0).round() as i64;
    match Utc.timestamp_micros(micros).single() {
        Some(dt) => dt.format(ISO_FORMAT).to_string(),
        None => Utc::now().format(ISO_FORMAT).to_string(),
    }
}

/// 当前 epoch 秒
pub fn epoch_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let ts = format_iso(1_700_000_000.25);
        assert_eq!(ts, "2023-11-14T22:13:20.250Z");
        let back = parse_iso(&ts).unwrap();
        assert!((back - 1_700_000_000.25).abs() < 1e-6);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_iso("yesterday").is_none());
    }
}
