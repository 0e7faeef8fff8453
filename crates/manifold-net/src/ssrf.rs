//! SSRF guard for caller-supplied URLs (image prompts, audio sources).
//!
//! The check runs after DNS resolution and the connection is pinned to the
//! vetted address, so a hostname that re-resolves between check and connect
//! gains nothing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::warn;
use url::Url;

use manifold_core::{RelayError, Result};

/// Addresses the `user_content` client refuses when `block_internal` is on:
/// loopback, RFC1918 private, link-local, multicast, CG-NAT (100.64.0.0/10),
/// unspecified, and their IPv6 counterparts (incl. unique-local fc00::/7 and
/// v4-mapped forms).
pub fn ip_is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || in_cgnat(v4)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return ip_is_internal(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // unique-local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn in_cgnat(v4: Ipv4Addr) -> bool {
    let octets = v4.octets();
    octets[0] == 100 && (octets[1] & 0xc0) == 64
}

/// Resolve `host` and report whether any of its addresses is internal.
/// Returns the first vetted address for connection pinning.
pub async fn host_is_blocked(host: &str, port: u16) -> Result<SocketAddr> {
    // Literal addresses skip DNS entirely.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip_is_internal(ip) {
            return Err(blocked(host));
        }
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| RelayError::transport(format!("resolve {host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(RelayError::transport(format!("{host} did not resolve")));
    }
    // One internal record poisons the whole name; a partially-internal
    // answer is how rebinding setups look.
    if let Some(bad) = addrs.iter().find(|a| ip_is_internal(a.ip())) {
        warn!(host, addr = %bad.ip(), "refusing user-content fetch to internal address");
        return Err(blocked(host));
    }
    Ok(addrs[0])
}

fn blocked(host: &str) -> RelayError {
    RelayError::forbidden(format!("fetching {host} is not permitted"))
}

/// Fetch a caller-supplied URL through the guard. With `block_internal`
/// unset only the scheme check applies.
pub async fn fetch_user_content(raw_url: &str, block_internal: bool) -> Result<reqwest::Response> {
    let url = Url::parse(raw_url)
        .map_err(|e| RelayError::bad_request(format!("invalid content url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RelayError::bad_request(format!(
            "unsupported content url scheme {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::bad_request("content url has no host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RelayError::bad_request("content url has no port"))?;

    if !block_internal {
        return crate::clients()
            .user_content
            .get(url)
            .send()
            .await
            .map_err(|e| RelayError::transport(format!("fetch {host}: {e}")));
    }

    let pinned = host_is_blocked(&host, port).await?;

    // Pin the connection to the vetted address so a second resolution
    // cannot swap in an internal one.
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .redirect(reqwest::redirect::Policy::none())
        .resolve(&host, pinned)
        .build()
        .map_err(|e| RelayError::internal(format!("user-content client: {e}")))?;

    client
        .get(url)
        .send()
        .await
        .map_err(|e| RelayError::transport(format!("fetch {host}: {e}")))
}
