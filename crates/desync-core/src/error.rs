use thiserror::Error;

/// Why a target was rejected before any probe ran.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid URL `{0}`: {1}")]
    InvalidUrl(String, String),
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("port out of range: {0}")]
    InvalidPort(u16),
}

/// Transport-level failure surfaced by the wire clients.
///
/// `Timeout` is not treated as an error by callers; it is a first-class
/// signal into the probe state machines.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("read timeout")]
    Timeout,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("stream reset by peer: {0}")]
    Reset(String),
}

impl WireError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WireError::Timeout)
    }
}
