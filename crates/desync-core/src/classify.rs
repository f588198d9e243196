use std::time::Duration;

use crate::error::WireError;

/// What a single probe send looked like from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Server produced a readable response body.
    Normal,
    /// The bounded wait elapsed with nothing to show for it.
    Timeout,
    /// Connection closed with an empty body well before the deadline.
    Disconnected,
    /// Transport or protocol failure.
    SocketError,
}

/// Margin subtracted from the configured timeout when deciding whether an
/// empty reply means the server dropped us or the connection simply hung
/// until it was torn down.
const DISCONNECT_MARGIN: Duration = Duration::from_secs(1);

/// Classify one request round-trip. Pure function of the elapsed wall time,
/// the configured timeout and the reply (a body sample on success, the
/// transport error otherwise).
pub fn classify(
    elapsed: Duration,
    timeout: Duration,
    reply: Result<&[u8], &WireError>,
) -> Outcome {
    match reply {
        Err(e) if e.is_timeout() => Outcome::Timeout,
        Err(_) => Outcome::SocketError,
        Ok(sample) if sample.is_empty() => {
            if elapsed < timeout.saturating_sub(DISCONNECT_MARGIN) {
                Outcome::Disconnected
            } else {
                Outcome::Timeout
            }
        }
        Ok(_) => Outcome::Normal,
    }
}
