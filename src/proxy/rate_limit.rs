use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;

// Extracts a reset duration in milliseconds from an upstream rate-limit
// response. The result is advisory: `None` means the caller applies its
// configured default cooldown.
//
// Precedence, stopping at the first hit:
//   1. `retry-after` header (integer seconds or HTTP-date)
//   2. `x-ratelimit-reset` header (absolute unix seconds)
//   3. `x-ratelimit-reset-after` header (integer seconds)
//   4. body scan for retryDelay / retry-after-ms style fields
pub fn parse_reset_from_response(headers: &HeaderMap, body: &str) -> Option<u64> {
    let now_ms = chrono::Utc::now().timestamp_millis();

    if let Some(value) = header_str(headers, "retry-after") {
        if let Some(ms) = parse_retry_after(value, now_ms) {
            return positive(ms);
        }
    }
    if let Some(value) = header_str(headers, "x-ratelimit-reset") {
        if let Ok(reset_secs) = value.trim().parse::<i64>() {
            return positive(reset_secs * 1000 - now_ms);
        }
    }
    if let Some(value) = header_str(headers, "x-ratelimit-reset-after") {
        if let Ok(secs) = value.trim().parse::<i64>() {
            return positive(secs * 1000);
        }
    }
    parse_reset_from_body(body, now_ms)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn positive(ms: i64) -> Option<u64> {
    if ms > 0 {
        Some(ms as u64)
    } else {
        None
    }
}

// `retry-after` carries either integer seconds or an HTTP-date. Anything
// else is ignored so the next signal gets a chance.
fn parse_retry_after(value: &str, now_ms: i64) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<i64>() {
        return Some(secs * 1000);
    }
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(trimmed) {
        return Some(date.timestamp_millis() - now_ms);
    }
    None
}

static RETRY_DELAY_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(?:retryDelay|retry-after-ms|retry_after_ms)"\s*:\s*"?([^",}]+)"?"#)
        .expect("invalid retry delay regex")
});

// "1h23m45s", "23m45s", "7.5s"; at least one component must be present.
static HUMAN_DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+(?:\.\d+)?)s)?$").expect("invalid duration regex")
});

pub fn parse_reset_from_body(body: &str, now_ms: i64) -> Option<u64> {
    for captures in RETRY_DELAY_FIELD.captures_iter(body) {
        let raw = captures.get(1)?.as_str().trim();
        if let Some(ms) = parse_duration_token(raw, now_ms) {
            return positive(ms);
        }
    }
    None
}

// Accepts decimal seconds with a trailing `s`, explicit or bare integer
// milliseconds, `HhMmSs` human durations, and ISO-8601 reset timestamps.
fn parse_duration_token(raw: &str, now_ms: i64) -> Option<i64> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(ts.timestamp_millis() - now_ms);
    }
    if let Some(ms_str) = raw.strip_suffix("ms") {
        if let Ok(ms) = ms_str.trim().parse::<f64>() {
            return Some(ms.ceil() as i64);
        }
        return None;
    }
    if let Some(captures) = HUMAN_DURATION.captures(raw) {
        let hours = captures.get(1).and_then(|m| m.as_str().parse::<i64>().ok());
        let minutes = captures.get(2).and_then(|m| m.as_str().parse::<i64>().ok());
        let seconds = captures.get(3).and_then(|m| m.as_str().parse::<f64>().ok());
        if hours.is_some() || minutes.is_some() || seconds.is_some() {
            let total_ms = hours.unwrap_or(0) * 3_600_000
                + minutes.unwrap_or(0) * 60_000
                + (seconds.unwrap_or(0.0) * 1000.0).round() as i64;
            return Some(total_ms);
        }
    }
    // A bare number is taken as milliseconds.
    if let Ok(ms) = raw.parse::<i64>() {
        return Some(ms);
    }
    None
}
