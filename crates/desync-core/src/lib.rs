//! Shared types for the desync scanner: the parsed target endpoint, the
//! outcome classifier that turns timing + response shape into a desync signal,
//! process-wide settings, and the insecure TLS configuration used by every
//! wire client.

pub mod classify;
pub mod endpoint;
pub mod error;
pub mod escape;
pub mod settings;
pub mod tls;
