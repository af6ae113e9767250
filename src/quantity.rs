//! Kubernetes resource quantity conversion and age formatting.

use chrono::{DateTime, Utc};
use serde::Serialize;

const BINARY_SUFFIXES: [(&str, u64); 4] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
];

const DECIMAL_SUFFIXES: [(&str, u64); 4] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

/// Parse a CPU quantity into nanocores.
///
/// `"250m"` is 250 millicores, `"2"` is two whole cores, `"1500n"` is already in
/// nanocores. Returns `None` for values that do not parse.
pub fn parse_cpu_quantity(cpu: &str) -> Option<u64> {
    let cpu = cpu.trim();
    if let Some(n) = cpu.strip_suffix('n') {
        return n.parse().ok();
    }
    if let Some(u) = cpu.strip_suffix('u') {
        return scale(u, 1_000.0);
    }
    if let Some(m) = cpu.strip_suffix('m') {
        return scale(m, 1_000_000.0);
    }
    scale(cpu, 1_000_000_000.0)
}

/// Parse a memory quantity into bytes.
pub fn parse_memory_quantity(memory: &str) -> Option<u64> {
    let memory = memory.trim();
    for (suffix, factor) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES.iter()) {
        if let Some(value) = memory.strip_suffix(suffix) {
            return scale(value, *factor as f64);
        }
    }
    memory.parse().ok().or_else(|| scale(memory, 1.0))
}

fn scale(value: &str, factor: f64) -> Option<u64> {
    let parsed: f64 = value.parse().ok()?;
    if !parsed.is_finite() || parsed < 0.0 {
        return None;
    }
    Some((parsed * factor).round() as u64)
}

/// Elapsed time since an object's creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Age {
    pub seconds: i64,
    pub human_readable: String,
}

impl Age {
    pub fn since(created: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let seconds = now.signed_duration_since(created).num_seconds().max(0);
        Self {
            seconds,
            human_readable: format_duration(seconds),
        }
    }
}

/// Compact duration: the largest non-zero unit followed by the next smaller one.
pub fn format_duration(total_secs: i64) -> String {
    let seconds = total_secs % 60;
    let minutes = total_secs / 60 % 60;
    let hours = total_secs / 3600 % 24;
    let days = total_secs / 86400;

    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_cpu_quantities() {
        assert_eq!(parse_cpu_quantity("250m"), Some(250_000_000));
        assert_eq!(parse_cpu_quantity("2"), Some(2_000_000_000));
        assert_eq!(parse_cpu_quantity("0.5"), Some(500_000_000));
        assert_eq!(parse_cpu_quantity("123456789n"), Some(123_456_789));
        assert_eq!(parse_cpu_quantity("350u"), Some(350_000));
    }

    #[test]
    fn test_cpu_garbage_is_missing_not_zero() {
        assert_eq!(parse_cpu_quantity(""), None);
        assert_eq!(parse_cpu_quantity("lots"), None);
        assert_eq!(parse_cpu_quantity("-1"), None);
        assert_eq!(parse_cpu_quantity("0"), Some(0));
    }

    #[test]
    fn test_memory_quantities() {
        assert_eq!(parse_memory_quantity("128Mi"), Some(134_217_728));
        assert_eq!(parse_memory_quantity("16Ki"), Some(16_384));
        assert_eq!(parse_memory_quantity("2Gi"), Some(2_147_483_648));
        assert_eq!(parse_memory_quantity("1Ti"), Some(1_099_511_627_776));
        assert_eq!(parse_memory_quantity("129M"), Some(129_000_000));
        assert_eq!(parse_memory_quantity("1k"), Some(1_000));
        assert_eq!(parse_memory_quantity("4096"), Some(4096));
        assert_eq!(parse_memory_quantity("1e3"), Some(1000));
        assert_eq!(parse_memory_quantity("Mi"), None);
        assert_eq!(parse_memory_quantity("12Pb"), None);
    }

    #[test]
    fn test_age_two_units() {
        let now = Utc::now();
        let age = Age::since(now - Duration::hours(51), now);
        assert_eq!(age.seconds, 183_600);
        assert_eq!(age.human_readable, "2d3h");
    }

    #[test]
    fn test_format_duration_units() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(7 * 60 + 12), "7m12s");
        assert_eq!(format_duration(5 * 3600), "5h0m");
    }

    #[test]
    fn test_age_in_future_clamps_to_zero() {
        let now = Utc::now();
        let age = Age::since(now + Duration::seconds(30), now);
        assert_eq!(age.seconds, 0);
        assert_eq!(age.human_readable, "0s");
    }
}
