//! # manifold-adaptor
//!
//! The polymorphic boundary between the gateway's caller dialects (Chat
//! Completions, Claude Messages, Response API) and the provider dialects
//! behind the channels. Every provider implements the same capability set:
//! URL construction, header/auth injection, request rewrites, response
//! normalization, streaming, and pricing lookup.

pub mod adaptor;
pub mod anthropic;
pub mod azure;
pub mod bridge;
pub mod compat;
pub mod copilot;
pub mod dialect;
pub mod gemini;
pub mod openai;
pub mod pricing;
pub mod signature;

pub use adaptor::{
    Adaptor, ResponseSink, adaptor_for, detect_error_envelope, error_from_body, extract_usage,
};
pub use pricing::{ModelPrice, ModelRatios, quota_cost, reservation_cost};
pub use signature::{SignatureCache, SignatureKey};
