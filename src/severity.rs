use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// glog-style prefix, e.g. `E0912 12:00:00.123456 ...`
static KLOG_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([IWE])\d{4}").expect("valid klog prefix regex"));

static LEVEL_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(ERROR|WARN(?:ING)?|INFO|DEBUG|TRACE)\b").expect("valid level regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
    Unknown,
}

/// Extract a severity from a raw log message.
pub fn classify_severity(message: &str) -> Severity {
    if let Some(caps) = KLOG_PREFIX.captures(message) {
        return match &caps[1] {
            "I" => Severity::Info,
            "W" => Severity::Warning,
            _ => Severity::Error,
        };
    }

    let Some(caps) = LEVEL_WORD.captures(message) else {
        return Severity::Unknown;
    };
    match caps[1].to_ascii_uppercase().as_str() {
        "ERROR" => Severity::Error,
        "WARN" | "WARNING" => Severity::Warning,
        "INFO" => Severity::Info,
        "DEBUG" => Severity::Debug,
        _ => Severity::Trace,
    }
}
