//! # manifold-relay
//!
//! The loop that wraps selection, adaptation, and streaming: classify every
//! terminal error, decide retry vs fatal vs soft-skip, suspend channels on
//! rate/capacity signals, pre-reserve quota, and reconcile it from observed
//! usage on completion.

pub mod billing;
pub mod classify;
pub mod engine;

pub use billing::{Biller, Reservation};
pub use classify::{Disposition, classify};
pub use engine::{RelayEngine, RelayPayload, RelayRequest, RelayResult};
