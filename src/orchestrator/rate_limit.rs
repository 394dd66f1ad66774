//! Rate-limit signal detection in sandbox output.

use std::sync::LazyLock;

use regex::Regex;

use super::supervisor::StreamKind;

#[allow(
    clippy::expect_used,
    reason = "constant pattern, compiled on first use and covered by tests"
)]
static RATE_LIMIT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:429|rate.?limit|too many requests|quota exceeded|usage limit|hit your limit|hit .+ limit)\b|\bresets \d+\w*\s*\(UTC\)",
    )
    .expect("rate-limit pattern is a valid regex")
});

/// First rate-limit phrase seen during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSignal {
    pub stream: StreamKind,
    pub matched: String,
}

/// One-shot latch: once a chunk matches, later matches are ignored.
#[derive(Debug, Default)]
pub struct RateLimitDetector {
    signal: Option<RateLimitSignal>,
}

impl RateLimitDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan a chunk. Returns `true` only for the chunk that trips the latch.
    pub fn observe(&mut self, stream: StreamKind, chunk: &str) -> bool {
        if self.signal.is_some() {
            return false;
        }
        let Some(m) = RATE_LIMIT_PATTERN.find(chunk) else {
            return false;
        };
        self.signal = Some(RateLimitSignal {
            stream,
            matched: m.as_str().to_string(),
        });
        true
    }

    pub fn is_latched(&self) -> bool {
        self.signal.is_some()
    }

    pub fn signal(&self) -> Option<&RateLimitSignal> {
        self.signal.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches_known_phrases() {
        for text in [
            "API Error: 429 {\"type\":\"error\"}",
            "Rate limit reached for requests",
            "ratelimit exceeded",
            "rate-limit from upstream",
            "Too Many Requests",
            "quota exceeded for this month",
            "Claude usage limit reached",
            "You've hit your limit",
            "you have hit the weekly limit",
            "Your limit resets 5pm (UTC)",
        ] {
            assert!(RATE_LIMIT_PATTERN.is_match(text), "should match: {text}");
        }
    }

    #[test]
    fn test_pattern_ignores_ordinary_output() {
        for text in [
            "Processed 4290 rows",
            "generated the report",
            "moderate limitless",
            "",
        ] {
            assert!(!RATE_LIMIT_PATTERN.is_match(text), "should not match: {text}");
        }
    }

    #[test]
    fn test_latches_once() {
        let mut detector = RateLimitDetector::new();
        assert!(!detector.observe(StreamKind::Stdout, "all good"));
        assert!(detector.observe(StreamKind::Stderr, "HTTP 429 Too Many Requests"));
        assert!(!detector.observe(StreamKind::Stdout, "rate limit again"));

        let signal = detector.signal().unwrap();
        assert_eq!(signal.stream, StreamKind::Stderr);
        assert_eq!(signal.matched, "429");
    }
}
