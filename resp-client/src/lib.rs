pub mod client;
pub mod protocol;

pub use client::RespConnection;
pub use protocol::{RespCodec, encode_reply};

// Re-export Bytes for convenience
pub use bytes::Bytes;
