//! # manifold-stream
//!
//! The shared Server-Sent-Events processor every adaptor streams through:
//! one reader, one writer, chunk order preserved. Accumulates content and
//! tool-call arguments, extracts reasoning, detects terminal events, bounds
//! its buffers, and synthesizes usage when the upstream omits it.

pub mod builder;
pub mod processor;
pub mod sse;
pub mod thinking;

pub use builder::BoundedBuilder;
pub use processor::{ChunkAction, StreamContext, error_chunk, pump_sse};
pub use sse::SseLineReader;
pub use thinking::ThinkingProcessor;
