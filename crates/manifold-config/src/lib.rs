//! # manifold-config
//!
//! Configuration for the Manifold gateway: the `manifold.toml` schema with
//! defaults for every field, and a loader with path discovery and
//! environment-variable overrides.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    AuthConfig, BillingConfig, LoggingConfig, ManifoldConfig, NetConfig, RelayConfig, SeedChannel,
    SeedConfig, SeedToken, ServerConfig,
};
