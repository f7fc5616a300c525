//! Control channel between the supervisor and a worker process.
//!
//! - **protocol**: command tokens, responses, heartbeat frames
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **transport**: loopback listener, accepted endpoint, worker-side dial

pub mod codec;
pub mod protocol;
pub mod transport;
