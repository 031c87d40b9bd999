//! Rate-limit response header extraction and reset computation.

use reqwest::header::HeaderMap;

/// Extra padding applied to reaction-route resets computed from the
/// absolute `reset` header; the server coalesces reaction updates in a
/// short window that the header does not account for.
const REACTION_RESET_PAD_MS: i64 = 250;

/// Scope of a rate limit reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatelimitScope {
    /// Ordinary per-user bucket limit.
    #[default]
    User,
    /// The account-wide global limit.
    Global,
    /// A limit shared with other consumers of the resource; not the
    /// caller's fault and never counted as an invalid request.
    Shared,
}

/// The rate-limit-relevant slice of a response's headers.
#[derive(Debug, Clone, Default)]
pub struct RatelimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Absolute reset, unix seconds (fractional).
    pub reset: Option<f64>,
    /// Relative reset, seconds (fractional).
    pub reset_after: Option<f64>,
    /// Seconds to wait, from a 429.
    pub retry_after: Option<f64>,
    pub scope: RatelimitScope,
    /// The `x-ratelimit-global` presence flag.
    pub global: bool,
    /// Server wall clock from the `date` header, unix milliseconds.
    pub server_date_ms: Option<i64>,
}

impl RatelimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let number = |name: &str| text(name).and_then(|v| v.parse::<f64>().ok());

        let scope = match text("x-ratelimit-scope") {
            Some("global") => RatelimitScope::Global,
            Some("shared") => RatelimitScope::Shared,
            _ => RatelimitScope::User,
        };

        Self {
            bucket: text("x-ratelimit-bucket").map(str::to_owned),
            limit: number("x-ratelimit-limit").map(|v| v as u32),
            remaining: number("x-ratelimit-remaining").map(|v| v as u32),
            reset: number("x-ratelimit-reset"),
            reset_after: number("x-ratelimit-reset-after"),
            retry_after: number("retry-after"),
            scope,
            global: headers.contains_key("x-ratelimit-global"),
            server_date_ms: text("date")
                .and_then(|date| chrono::DateTime::parse_from_rfc2822(date).ok())
                .map(|date| date.timestamp_millis()),
        }
    }

    /// When the bucket resets, as local unix milliseconds.
    ///
    /// Prefers the relative `reset-after` header since it is immune to
    /// clock skew. Falls back to the absolute `reset` corrected by the
    /// difference between the server's `date` and the local clock; for
    /// reaction routes the absolute path also gets a small pad.
    pub fn reset_at_ms(&self, reaction_route: bool, now_unix_ms: i64) -> Option<i64> {
        if let Some(after) = self.reset_after {
            return Some(now_unix_ms + (after * 1_000.0) as i64);
        }
        let reset = self.reset?;
        let skew = self
            .server_date_ms
            .map(|server| server - now_unix_ms)
            .unwrap_or(0);
        let mut at = (reset * 1_000.0) as i64 - skew;
        if reaction_route {
            at += REACTION_RESET_PAD_MS;
        }
        Some(at)
    }

    /// The 429 wait in milliseconds, when the response carried one.
    pub fn retry_after_ms(&self) -> Option<u64> {
        self.retry_after
            .filter(|v| *v > 0.0)
            .map(|v| (v * 1_000.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<HeaderName>().expect("valid name"),
                HeaderValue::from_str(value).expect("valid value"),
            );
        }
        map
    }

    #[test]
    fn parses_the_full_header_set() {
        let parsed = RatelimitHeaders::parse(&headers(&[
            ("x-ratelimit-bucket", "abcd1234"),
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset", "1700000060.123"),
            ("x-ratelimit-reset-after", "60.000"),
            ("x-ratelimit-scope", "user"),
            ("retry-after", "5"),
        ]));

        assert_eq!(parsed.bucket.as_deref(), Some("abcd1234"));
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(4));
        assert_eq!(parsed.reset_after, Some(60.0));
        assert_eq!(parsed.retry_after_ms(), Some(5_000));
        assert_eq!(parsed.scope, RatelimitScope::User);
        assert!(!parsed.global);
    }

    #[test]
    fn scope_and_global_flag_parse() {
        let shared = RatelimitHeaders::parse(&headers(&[("x-ratelimit-scope", "shared")]));
        assert_eq!(shared.scope, RatelimitScope::Shared);

        let global = RatelimitHeaders::parse(&headers(&[
            ("x-ratelimit-scope", "global"),
            ("x-ratelimit-global", "true"),
        ]));
        assert_eq!(global.scope, RatelimitScope::Global);
        assert!(global.global);
    }

    #[test]
    fn reset_after_wins_over_absolute_reset() {
        let parsed = RatelimitHeaders::parse(&headers(&[
            ("x-ratelimit-reset", "1700009999.000"),
            ("x-ratelimit-reset-after", "2.5"),
        ]));
        let now = 1_700_000_000_000;
        assert_eq!(parsed.reset_at_ms(false, now), Some(now + 2_500));
    }

    #[test]
    fn absolute_reset_absorbs_clock_skew() {
        // Server clock runs 30 s ahead of ours; its absolute reset must be
        // pulled back by the same amount.
        let parsed = RatelimitHeaders::parse(&headers(&[
            ("x-ratelimit-reset", "1700000090.000"),
            ("date", "Tue, 14 Nov 2023 22:13:50 GMT"), // 1700000030 unix
        ]));
        let now = 1_700_000_000_000;
        let at = parsed.reset_at_ms(false, now).expect("reset computed");
        assert_eq!(at, 1_700_000_090_000 - 30_000);
    }

    #[test]
    fn reaction_routes_get_padding_only_on_absolute_resets() {
        let absolute = RatelimitHeaders::parse(&headers(&[("x-ratelimit-reset", "1700000001.000")]));
        let now = 1_700_000_000_000;
        assert_eq!(absolute.reset_at_ms(true, now), Some(1_700_000_001_000 + 250));
        assert_eq!(absolute.reset_at_ms(false, now), Some(1_700_000_001_000));

        let relative = RatelimitHeaders::parse(&headers(&[
            ("x-ratelimit-reset", "1700000001.000"),
            ("x-ratelimit-reset-after", "1.0"),
        ]));
        assert_eq!(relative.reset_at_ms(true, now), Some(now + 1_000));
    }

    #[test]
    fn zero_retry_after_reads_as_absent() {
        let parsed = RatelimitHeaders::parse(&headers(&[("retry-after", "0")]));
        assert_eq!(parsed.retry_after_ms(), None);
    }

    #[test]
    fn empty_headers_parse_to_defaults() {
        let parsed = RatelimitHeaders::parse(&HeaderMap::new());
        assert_eq!(parsed.bucket, None);
        assert_eq!(parsed.scope, RatelimitScope::User);
        assert_eq!(parsed.reset_at_ms(false, 0), None);
    }
}
