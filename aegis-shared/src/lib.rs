//! Shared types for AegisVM host↔guest communication.
//!
//! Everything the daemon and an in-guest harness must agree on lives here:
//! the error taxonomy, the newline-framed JSON-RPC control protocol, and the
//! tether frame envelope. The crate depends only on serde, tokio's io traits
//! and chrono so a static guest binary can link it without pulling the
//! daemon's stack.

pub mod errors;
pub mod rpc;
pub mod tether;

pub use errors::{AegisError, AegisResult, ErrorKind};
pub use tether::{TetherFrame, TetherSession};
