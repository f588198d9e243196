//! HTTP/2 side of the scanner: a hand-rolled client-side framer plus an
//! HPACK-encoding client that happily puts CR, LF and NUL inside header names
//! and values. Speaks h2 over ALPN TLS and h2c via the Upgrade dance.

pub mod client;
pub mod frame;

pub use client::{H2Request, H2Response, Mode, round_trip};
