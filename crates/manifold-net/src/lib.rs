//! # manifold-net
//!
//! The three shared, pooled HTTP clients the gateway uses, plus the
//! SSRF guard applied to caller-supplied URLs. Clients are built once at
//! startup and never rebound at runtime.

pub mod clients;
pub mod ssrf;

pub use clients::{ClientConfig, HttpClients, clients, init};
pub use ssrf::{fetch_user_content, host_is_blocked, ip_is_internal};
