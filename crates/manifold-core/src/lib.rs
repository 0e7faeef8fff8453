//! # manifold-core
//!
//! Core types, traits, and primitives for the Manifold LLM API gateway.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace: channels, tokens, abilities, relay modes, usage accounting,
//! the error taxonomy, and the store traits behind which persistence lives.

pub mod error;
pub mod store;
pub mod tool;
pub mod types;

pub use error::{ErrorKind, RelayError, Result};
pub use store::{ChannelStore, MemoryStore, RelayLogEntry, RelayLogStore, TokenStore};
pub use tool::{FunctionCall, McpCall, ToolArguments, ToolCall, ToolCallKind};
pub use types::*;
