//! Caller authentication: bearer/x-api-key extraction, prefix stripping,
//! `{token}[-{channel-id}]` splitting, subnet ACL, tenant resolution.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

use crate::AppState;
use manifold_core::{RelayError, Token, TokenStatus};

/// Auth outcome attached to the request for downstream handlers.
#[derive(Clone)]
pub struct AuthContext {
    pub token: Token,
    /// Channel id pinned via the `-{id}` key suffix, admins only.
    pub pinned_channel: Option<i64>,
}

/// Key prefixes always accepted alongside the configured one.
const LEGACY_PREFIXES: &[&str] = &["sk-", "laisky-"];

/// Pull the presented key out of `Authorization: Bearer …` or `X-Api-Key`.
pub fn presented_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let raw = auth.strip_prefix("Bearer ").unwrap_or(auth);
        if !raw.is_empty() {
            return Some(raw.to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Strip the configured or legacy prefix, then split a trailing
/// `-{channel-id}` pin.
pub fn parse_key(raw: &str, configured_prefix: &str) -> (String, Option<i64>) {
    let mut key = raw;
    for prefix in std::iter::once(configured_prefix).chain(LEGACY_PREFIXES.iter().copied()) {
        if !prefix.is_empty()
            && let Some(stripped) = key.strip_prefix(prefix)
        {
            key = stripped;
            break;
        }
    }
    if let Some((token_part, channel_part)) = key.rsplit_once('-')
        && !channel_part.is_empty()
        && channel_part.chars().all(|c| c.is_ascii_digit())
        && let Ok(id) = channel_part.parse::<i64>()
    {
        return (token_part.to_string(), Some(id));
    }
    (key.to_string(), None)
}

fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(forwarded) = headers.get("x-forwarded-for")
        && let Ok(val) = forwarded.to_str()
        && let Some(first) = val.split(',').next()
        && let Ok(ip) = first.trim().parse::<IpAddr>()
    {
        return Some(ip);
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Middleware guarding every relay route.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let request_id = request
        .extensions()
        .get::<crate::RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    let Some(raw) = presented_key(request.headers()) else {
        return Err(unauthorized("missing api key", &request_id));
    };
    let (key, pinned) = parse_key(&raw, &state.key_prefix);

    let token = match state.tokens.token_by_key(&key).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            // Probes with made-up keys are routine; keep the noise down.
            warn!(request_id = %request_id, "no token found for presented key");
            return Err(unauthorized("invalid api key", &request_id));
        }
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "token lookup failed");
            return Err(error_response(&RelayError::internal("token lookup failed"), &request_id));
        }
    };

    match token.status {
        TokenStatus::Enabled => {}
        TokenStatus::Expired => {
            return Err(error_response(
                &RelayError::authentication("token_expired"),
                &request_id,
            ));
        }
        TokenStatus::Exhausted => {
            return Err(error_response(
                &RelayError::insufficient_quota("API key quota has been exhausted"),
                &request_id,
            ));
        }
        TokenStatus::Disabled => {
            return Err(unauthorized("token disabled", &request_id));
        }
    }

    if let Some(ip) = client_ip(request.headers())
        && !token.allows_ip(ip)
    {
        warn!(request_id = %request_id, client_ip = %ip, token_id = token.id, "subnet acl rejected caller");
        return Err(error_response(
            &RelayError::forbidden("request source not permitted for this token"),
            &request_id,
        ));
    }

    let pinned_channel = match pinned {
        Some(id) if token.admin => Some(id),
        Some(_) => {
            return Err(error_response(
                &RelayError::forbidden("channel pinning requires an admin token"),
                &request_id,
            ));
        }
        None => None,
    };

    request.extensions_mut().insert(AuthContext {
        token,
        pinned_channel,
    });
    Ok(next.run(request).await)
}

fn unauthorized(message: &str, request_id: &str) -> Response {
    error_response(&RelayError::authentication(message), request_id)
}

/// Render a typed error as the OpenAI-compatible envelope.
pub fn error_response(err: &RelayError, request_id: &str) -> Response {
    let status =
        StatusCode::from_u16(err.caller_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(err.envelope(request_id))).into_response()
}
