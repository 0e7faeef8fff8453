//! Per-attempt error classification. Lower layers only report; this table
//! is the one place that decides what happens next.

use manifold_core::{ErrorKind, RelayError};

/// What the relay loop does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The caller's own fault (quota, expired token, model not allowed).
    /// Surface verbatim, never retry, never bill.
    UserOriginated,
    /// Upstream credential/quota problem: suspend the channel, add it to
    /// the exclude set, retry elsewhere.
    SuspendAndRetry,
    /// Worth retrying on the same channel with backoff.
    Transient,
    /// 429/413: suspend the channel briefly, retry on a different one.
    RateLimited,
    /// Client-shaped error that only a different channel can fix.
    RetryDifferentChannel,
    /// Terminal and not the caller's fault; the attempt is skipped, not
    /// billed, not retried further.
    SoftSkip,
    /// Terminal; surface as-is.
    Fatal,
}

const USER_ORIGINATED_MARKERS: &[&str] = &[
    "invalid_text_request",
    "insufficient_user_quota",
    "insufficient token quota",
    "token_expired",
    "token expired",
    "model_not_allowed",
    "model not allowed",
    "API key quota has been exhausted",
];

const UPSTREAM_AUTH_CODES: &[&str] = &[
    "invalid_api_key",
    "account_deactivated",
    "insufficient_quota",
];

const UPSTREAM_AUTH_MESSAGES: &[&str] = &[
    "API key not valid",
    "api key not valid",
    "key has expired",
    "key expired",
    "insufficient quota",
    "insufficient balance",
    "organization has been restricted",
    "organization restricted",
];

const WS_RETRY_MARKERS: &[&str] = &[
    "websocket_connection_limit_reached",
    "create a new websocket connection",
];

pub fn classify(err: &RelayError) -> Disposition {
    let message = err.message.as_str();
    let raw = err.raw.as_deref().unwrap_or_default();
    let code = err.provider_code.as_deref().unwrap_or_default();

    if USER_ORIGINATED_MARKERS
        .iter()
        .any(|m| message.contains(m) || code == *m)
    {
        return Disposition::UserOriginated;
    }

    // A 401 from a provider fronted by a busy SQLite store is the store
    // hiccuping, not a bad key.
    if err.status == 401 && (contains_ci(message, "database is locked") || contains_ci(message, "database is busy"))
    {
        return Disposition::Transient;
    }

    if err.status == 429 || err.status == 413 {
        return Disposition::RateLimited;
    }

    if err.status == 401
        || err.status == 403
        || matches!(
            err.kind,
            ErrorKind::Authentication
                | ErrorKind::Permission
                | ErrorKind::InsufficientQuota
                | ErrorKind::Forbidden
        )
        || UPSTREAM_AUTH_CODES.contains(&code)
        || UPSTREAM_AUTH_MESSAGES.iter().any(|m| contains_ci(message, m))
    {
        return Disposition::SuspendAndRetry;
    }

    if err.status == 400 && WS_RETRY_MARKERS.iter().any(|m| message.contains(m) || raw.contains(m))
    {
        return Disposition::RetryDifferentChannel;
    }

    if matches!(err.status, 400 | 404) {
        return Disposition::Fatal;
    }

    // 5xx bodies that self-identify as server errors are not worth
    // hammering; skip the attempt outright.
    if err.status >= 500
        && (raw.contains(r#""type":"server_error""#) || raw.contains(r#""code":"server_error""#))
    {
        return Disposition::SoftSkip;
    }

    if err.status == 0
        || err.status >= 500
        || contains_ci(message, "timeout")
        || contains_ci(message, "temporarily")
        || contains_ci(raw, "timeout")
        || contains_ci(raw, "temporarily")
    {
        return Disposition::Transient;
    }

    Disposition::Fatal
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
