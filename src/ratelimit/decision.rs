//! Admission decisions and the rate limit response headers.

use std::time::Duration;

/// Header carrying the configured limit.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Header carrying the requests left in the current window.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Header carrying the Unix time at which the quota resets.
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Header carrying the window length in human readable form.
pub const HEADER_WINDOW: &str = "x-ratelimit-window";

/// The outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Exempt path; no state touched and no headers set.
    Bypass,
    /// Request admitted.
    Admit(RateLimitHeaders),
    /// Request over quota.
    Reject {
        headers: RateLimitHeaders,
        /// Seconds the caller should wait, always at least 1
        retry_after: u64,
    },
    /// The counter store failed and the policy admits on failure.
    Degraded,
    /// The counter store failed and the policy rejects on failure.
    Unavailable,
}

impl Decision {
    /// Whether the request proceeds to the handler.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Bypass | Decision::Admit(_) | Decision::Degraded)
    }

    /// Headers to attach to the response, if any.
    pub fn headers(&self) -> Option<&RateLimitHeaders> {
        match self {
            Decision::Admit(headers) | Decision::Reject { headers, .. } => Some(headers),
            _ => None,
        }
    }
}

/// `X-RateLimit-*` header values for one decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Configured limit: requests per window, or requests per second for token buckets
    pub limit: u64,
    /// Requests left in the current window, never negative
    pub remaining: Option<u64>,
    /// Unix time in seconds at which the quota resets
    pub reset: Option<i64>,
    /// Window length, formatted by [`format_window`]
    pub window: Option<String>,
}

impl RateLimitHeaders {
    /// Header name/value pairs in a stable order.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![(HEADER_LIMIT, self.limit.to_string())];
        if let Some(remaining) = self.remaining {
            pairs.push((HEADER_REMAINING, remaining.to_string()));
        }
        if let Some(reset) = self.reset {
            pairs.push((HEADER_RESET, reset.to_string()));
        }
        if let Some(ref window) = self.window {
            pairs.push((HEADER_WINDOW, window.clone()));
        }
        pairs
    }
}

/// Render a duration the way Go's `time.Duration` prints it (`1m0s`,
/// `1h30m0s`, `250ms`), which is the format downstream services parse.
pub fn format_window(window: Duration) -> String {
    if window.is_zero() {
        return "0s".to_string();
    }

    let total_secs = window.as_secs();
    let nanos = window.subsec_nanos();

    if total_secs == 0 {
        if nanos % 1_000_000 == 0 {
            return format!("{}ms", nanos / 1_000_000);
        }
        return format!("{}µs", nanos / 1_000);
    }

    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;
    let secs = if nanos == 0 {
        format!("{}s", secs)
    } else {
        let frac = format!("{:09}", nanos);
        format!("{}.{}s", secs, frac.trim_end_matches('0'))
    };

    if hours > 0 {
        format!("{}h{}m{}", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m{}", minutes, secs)
    } else {
        secs
    }
}

/// Whole seconds until `remaining` elapses, rounded up, never below 1.
pub(crate) fn retry_after_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    secs.max(1)
}
