//! Shared parameter parsing for the shipped executors.

use crate::error::Result;
use crate::executor::invalid_params;
use crate::types::Parameters;

/// Parse a boolean parameter value.
///
/// Accepts `true/false`, `yes/no`, `on/off`, `1/0`, `t/f` and `y/n`, ignoring
/// case and surrounding whitespace.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" | "t" | "y" => Some(true),
        "false" | "no" | "off" | "0" | "f" | "n" => Some(false),
        _ => None,
    }
}

/// Optional boolean `key`, falling back to `default` when absent.
pub fn bool_param(kind: &str, params: &Parameters, key: &str, default: bool) -> Result<bool> {
    match params.get(key) {
        None => Ok(default),
        Some(raw) => parse_bool(raw)
            .ok_or_else(|| invalid_params(kind, format!("`{key}` must be a boolean, got `{raw}`"))),
    }
}

/// Optional strictly positive integer `key`.
pub fn positive_int_param(kind: &str, params: &Parameters, key: &str) -> Result<Option<u64>> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(Some(n)),
            _ => Err(invalid_params(
                kind,
                format!("`{key}` must be a positive integer, got `{raw}`"),
            )),
        },
    }
}

/// Required parameter that must not be blank.
pub fn required<'a>(kind: &str, params: &'a Parameters, key: &str) -> Result<&'a str> {
    match params.get(key).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(invalid_params(kind, format!("missing required parameter: {key}"))),
    }
}
