//! HTTP/1.1 side of the scanner: a payload model that serializes probe
//! requests byte-for-byte (injected control characters included) and a raw
//! one-shot client that writes those bytes verbatim.

pub mod client;
pub mod payload;

pub use client::{H1Response, round_trip};
pub use payload::Payload;
