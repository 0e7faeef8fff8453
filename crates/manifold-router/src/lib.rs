//! # manifold-router
//!
//! Channel selection for the gateway: a read-mostly snapshot of channels and
//! their materialized abilities, a suspension map fed by the relay loop, and
//! the selector that resolves `(group, model, endpoint, transport)` to a
//! channel.

pub mod cache;
pub mod ratelimit;
pub mod selector;
pub mod suspend;

pub use cache::AbilityCache;
pub use ratelimit::ChannelRateLimiter;
pub use selector::{SelectQuery, Selector};
pub use suspend::SuspensionMap;
