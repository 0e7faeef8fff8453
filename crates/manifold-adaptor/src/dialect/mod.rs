//! Wire types for the three caller dialects. Unknown provider fields ride
//! the `extra` overflow map on every struct, so payloads round-trip without
//! central modeling of every provider variant.

pub mod claude;
pub mod openai;
pub mod response;
