//! Wire layer for bridge-worker communication over the worker's stdio.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response, Ready signal)
//! - **codec**: Newline-delimited JSON framing, both as pure functions and as a
//!   `tokio_util` codec
//! - **finite**: Rejects NaN and infinities in typed params

pub mod codec;
pub mod finite;
pub mod protocol;
