use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification tag carried by every [`RelayError`].
///
/// Only the relay loop interprets these; lower layers just report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Permission,
    InsufficientQuota,
    Forbidden,
    RateLimit,
    BadRequest,
    Server,
    Transport,
    Internal,
}

impl ErrorKind {
    /// The wire tag used in the `{"error":{"type":…}}` envelope.
    pub fn tag(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication_error",
            ErrorKind::Permission => "permission_error",
            ErrorKind::InsufficientQuota => "insufficient_quota",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimit => "rate_limit_error",
            ErrorKind::BadRequest => "invalid_request_error",
            ErrorKind::Server => "server_error",
            ErrorKind::Transport => "transport_error",
            ErrorKind::Internal => "internal_error",
        }
    }
}

/// Maximum number of upstream body bytes retained for triage.
const RAW_SNIPPET_CAP: usize = 1024;

/// The typed error that flows through every layer of the gateway.
///
/// Carries the HTTP status observed (0 when the request never reached the
/// upstream), the taxonomy kind, the provider's own error code when one was
/// present, and a bounded snippet of the raw body.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct RelayError {
    pub status: u16,
    pub kind: ErrorKind,
    pub provider_code: Option<String>,
    pub message: String,
    pub raw: Option<String>,
}

impl RelayError {
    pub fn new(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            provider_code: None,
            message: message.into(),
            raw: None,
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, 401, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, 403, message)
    }

    pub fn insufficient_quota(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientQuota, 403, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, 403, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, 429, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, 400, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, 404, message)
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, status, message)
    }

    /// The request never completed at the HTTP layer; status 0 by convention.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, 0, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, 500, message)
    }

    pub fn no_channel(group: &str, model: &str) -> Self {
        Self::new(
            ErrorKind::Server,
            503,
            format!("no available channel for model {model} in group {group}"),
        )
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    /// Attach a snippet of the raw upstream body, truncated at a KiB.
    pub fn with_raw(mut self, raw: &str) -> Self {
        let mut end = raw.len().min(RAW_SNIPPET_CAP);
        while end > 0 && !raw.is_char_boundary(end) {
            end -= 1;
        }
        self.raw = Some(raw[..end].to_string());
        self
    }

    /// The HTTP status written back to the caller. Transport failures and
    /// upstream statuses outside the valid range collapse to 502.
    pub fn caller_status(&self) -> u16 {
        match self.status {
            s @ 100..=599 => s,
            _ => 502,
        }
    }

    /// The message shown to the caller. Upstream internals behind 5xx are
    /// replaced with a generic line; the taxonomy tag survives in the
    /// envelope.
    pub fn public_message(&self, request_id: &str) -> String {
        if self.caller_status() >= 500 && self.kind != ErrorKind::Internal {
            format!("upstream provider error (request id {request_id})")
        } else {
            format!("{} (request id {request_id})", self.message)
        }
    }

    /// The OpenAI-compatible error envelope.
    pub fn envelope(&self, request_id: &str) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.public_message(request_id),
                "type": self.kind.tag(),
            }
        })
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::bad_request(format!("invalid json: {e}"))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::transport(format!("io error: {e}"))
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_snippet_is_bounded() {
        let body = "x".repeat(4096);
        let err = RelayError::server(502, "bad gateway").with_raw(&body);
        assert_eq!(err.raw.unwrap().len(), 1024);
    }

    #[test]
    fn public_message_hides_upstream_internals() {
        let err = RelayError::server(502, "connection refused by 10.0.0.5:443");
        let msg = err.public_message("req-1");
        assert!(!msg.contains("10.0.0.5"));
        assert!(msg.contains("req-1"));
    }

    #[test]
    fn envelope_carries_taxonomy_tag() {
        let err = RelayError::rate_limit("slow down");
        let env = err.envelope("req-2");
        assert_eq!(env["error"]["type"], "rate_limit_error");
        assert!(env["error"]["message"].as_str().unwrap().contains("req-2"));
    }

    #[test]
    fn transport_status_maps_to_502() {
        assert_eq!(RelayError::transport("dns failure").caller_status(), 502);
    }
}
