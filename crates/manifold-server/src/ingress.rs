//! Path normalization, relay-mode resolution, and body caching.

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use manifold_core::RelayMode;

/// Largest request body the gateway will read.
const BODY_CAP: usize = 16 * 1024 * 1024;

/// Historical client path shapes rewritten to canonical `/v1/...` before
/// dispatch.
pub fn canonical_path(path: &str) -> String {
    let mut p = path;
    for prefix in ["/openai", "/api"] {
        if let Some(stripped) = p.strip_prefix(prefix) {
            p = stripped;
        }
    }
    // Double-versioned shapes like /v1/v1/messages.
    if let Some(stripped) = p.strip_prefix("/v1/v1/") {
        let candidate = format!("/v1/{stripped}");
        if RelayMode::from_path(&candidate).is_some() {
            return candidate;
        }
    }
    p.to_string()
}

/// Relay mode for a caller path, after alias rewriting.
pub fn mode_of(path: &str) -> Option<RelayMode> {
    RelayMode::from_path(&canonical_path(path))
}

/// Read the body once, cache the bytes in request extensions, and hand the
/// original bytes back to downstream extractors.
pub async fn cache_body(request: Request, next: Next) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, BODY_CAP)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE)?;

    let mut request = Request::from_parts(parts, Body::from(bytes.clone()));
    request.extensions_mut().insert(CachedBody(bytes));
    Ok(next.run(request).await)
}

/// The raw request bytes, readable any number of times downstream.
#[derive(Clone)]
pub struct CachedBody(pub Bytes);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_collapse_to_canonical() {
        for alias in [
            "/v1/messages",
            "/v1/v1/messages",
            "/openai/v1/messages",
            "/openai/v1/v1/messages",
            "/api/v1/v1/messages",
        ] {
            assert_eq!(canonical_path(alias), "/v1/messages", "{alias}");
            assert_eq!(mode_of(alias), Some(RelayMode::ClaudeMessages), "{alias}");
        }
    }

    #[test]
    fn unrelated_paths_survive() {
        assert_eq!(canonical_path("/v1/chat/completions"), "/v1/chat/completions");
        assert_eq!(mode_of("/v1/chat/completions"), Some(RelayMode::ChatCompletions));
        assert_eq!(mode_of("/v2/other"), None);
    }
}
