//! Failure classification at the unit-of-work boundary
//!
//! The pool never inspects provider errors itself; callers map whatever their
//! upstream returns into `FailureKind` before reporting. The helpers here cover
//! the two common cases: classifying by HTTP status, and falling back to
//! message-text matching when no status is available (network errors, SDK
//! exceptions surfaced as strings).

use std::fmt;

/// Stable classification of a failed generation attempt.
///
/// The kind is recorded for diagnostics and logging; cooldown treatment is
/// uniform across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Per-key quota or rate limit hit; expected to recover after cooldown.
    RateLimited,
    /// Key rejected by the upstream (revoked, malformed, unauthorized).
    InvalidCredential,
    /// Anything else: network faults, 5xx, malformed responses.
    Other,
}

impl FailureKind {
    /// Label for logs, metrics, and status output.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::InvalidCredential => "invalid_credential",
            FailureKind::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Message-text patterns indicating a quota or rate-limit rejection.
const RATE_PATTERNS: &[&str] = &["quota", "rate", "resource exhausted", "too many requests"];

/// Message-text patterns indicating a rejected key.
const INVALID_PATTERNS: &[&str] = &["invalid", "api key not valid", "unauthorized", "permission denied"];

/// Classify an error message by text matching.
///
/// Last resort for errors that carry no HTTP status. Rate/quota patterns are
/// checked before invalid-key patterns because quota messages occasionally
/// mention the word "valid" in unrelated contexts.
pub fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    for pattern in RATE_PATTERNS {
        if lower.contains(pattern) {
            return FailureKind::RateLimited;
        }
    }
    for pattern in INVALID_PATTERNS {
        if lower.contains(pattern) {
            return FailureKind::InvalidCredential;
        }
    }
    FailureKind::Other
}

/// Classify an upstream rejection by HTTP status and response body.
///
/// 429 is always a rate limit. 401/403 are rejected keys. The Gemini API
/// reports bad keys as 400 with an "API key not valid" body, so 400 falls
/// through to message matching. Everything else is `Other`.
pub fn classify_status(status: u16, body: &str) -> FailureKind {
    match status {
        429 => FailureKind::RateLimited,
        401 | 403 => FailureKind::InvalidCredential,
        400 => match classify_message(body) {
            FailureKind::InvalidCredential => FailureKind::InvalidCredential,
            _ => FailureKind::Other,
        },
        _ => FailureKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_message_quota() {
        let msg = "429 Resource has been exhausted (e.g. check quota).";
        assert_eq!(classify_message(msg), FailureKind::RateLimited);
    }

    #[test]
    fn classify_message_rate() {
        assert_eq!(
            classify_message("Rate limit exceeded, please retry"),
            FailureKind::RateLimited
        );
    }

    #[test]
    fn classify_message_invalid_key() {
        assert_eq!(
            classify_message("400 API key not valid. Please pass a valid API key."),
            FailureKind::InvalidCredential
        );
    }

    #[test]
    fn classify_message_unknown_is_other() {
        assert_eq!(
            classify_message("connection reset by peer"),
            FailureKind::Other
        );
    }

    #[test]
    fn classify_message_empty_is_other() {
        assert_eq!(classify_message(""), FailureKind::Other);
    }

    #[test]
    fn classify_message_case_insensitive() {
        assert_eq!(
            classify_message("QUOTA EXCEEDED FOR PROJECT"),
            FailureKind::RateLimited
        );
    }

    #[test]
    fn classify_status_429_rate_limited() {
        assert_eq!(
            classify_status(429, "whatever body"),
            FailureKind::RateLimited
        );
    }

    #[test]
    fn classify_status_401_invalid() {
        assert_eq!(
            classify_status(401, "unauthorized"),
            FailureKind::InvalidCredential
        );
    }

    #[test]
    fn classify_status_403_invalid() {
        assert_eq!(
            classify_status(403, "forbidden"),
            FailureKind::InvalidCredential
        );
    }

    #[test]
    fn classify_status_400_bad_key_is_invalid() {
        let body = r#"{"error":{"message":"API key not valid. Please pass a valid API key."}}"#;
        assert_eq!(classify_status(400, body), FailureKind::InvalidCredential);
    }

    #[test]
    fn classify_status_400_other_body_is_other() {
        let body = r#"{"error":{"message":"Unknown field in request"}}"#;
        assert_eq!(classify_status(400, body), FailureKind::Other);
    }

    #[test]
    fn classify_status_500_is_other() {
        assert_eq!(classify_status(500, "internal error"), FailureKind::Other);
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(FailureKind::RateLimited.label(), "rate_limited");
        assert_eq!(FailureKind::InvalidCredential.label(), "invalid_credential");
        assert_eq!(FailureKind::Other.label(), "other");
    }
}
