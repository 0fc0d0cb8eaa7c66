//! Rate-limit signals carried by Podio responses
//!
//! Podio reports quota figures in `X-Rate-Limit-Limit` /
//! `X-Rate-Limit-Remaining` and, when it rejects a call, may say how long
//! to wait either in `Retry-After` or inside the error description
//! ("... try again in 42 seconds").

use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::warn;

use podsync_core::domain::QuotaHeaders;

pub const RATE_LIMIT_LIMIT: &str = "X-Rate-Limit-Limit";
pub const RATE_LIMIT_REMAINING: &str = "X-Rate-Limit-Remaining";
pub const RETRY_AFTER: &str = "Retry-After";

/// Longest wait accepted from an HTTP-date `Retry-After`
const MAX_DATE_WAIT_SECS: u64 = 3600;

// ============================================================================
// Retry-After
// ============================================================================

/// Parses a Retry-After header value into a Duration.
///
/// The header can be either:
/// - An integer number of seconds (e.g., "30")
/// - An HTTP-date (e.g., "Fri, 31 Dec 2025 23:59:59 GMT"), parsed as seconds from now
///
/// Returns `None` if the value cannot be understood.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        let now = chrono::Utc::now();
        let target = date.with_timezone(&chrono::Utc);
        if target > now {
            return (target - now)
                .num_seconds()
                .try_into()
                .ok()
                .filter(|&s: &u64| s <= MAX_DATE_WAIT_SECS)
                .map(Duration::from_secs);
        }
        return Some(Duration::ZERO);
    }

    warn!(value, "Could not parse Retry-After header");
    None
}

/// Extracts a wait such as "30 seconds" or "2 minutes" from error text
pub fn wait_from_description(text: &str) -> Option<Duration> {
    let words: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.')
        .filter(|w| !w.is_empty())
        .collect();
    words.windows(2).find_map(|pair| {
        let value: u64 = pair[0].parse().ok()?;
        let unit = pair[1].to_ascii_lowercase();
        let seconds = if unit.starts_with("second") || unit.starts_with("sec") {
            value
        } else if unit.starts_with("minute") || unit.starts_with("min") {
            value * 60
        } else if unit.starts_with("hour") {
            value * 3600
        } else {
            return None;
        };
        Some(Duration::from_secs(seconds))
    })
}

/// Reads the Retry-After header, if present and valid
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

// ============================================================================
// Quota headers
// ============================================================================

/// Reads the server's quota figures; `None` when neither header is present
pub fn parse_quota_headers(headers: &HeaderMap) -> Option<QuotaHeaders> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok())
    };
    let quota = QuotaHeaders {
        limit: read(RATE_LIMIT_LIMIT),
        remaining: read(RATE_LIMIT_REMAINING),
    };
    (!quota.is_empty()).then_some(quota)
}
