use thiserror::Error;

/// Failures establishing the browser channel.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Nothing is listening on the debug endpoint.
    #[error("debug endpoint unreachable: {0}")]
    Unreachable(String),
    /// The endpoint answered, but not with the debugging protocol.
    #[error("debug endpoint handshake failed: {0}")]
    HandshakeFailed(String),
    /// The peer closed the channel mid-handshake.
    #[error("peer closed the channel during handshake")]
    Closed,
}

impl ConnectError {
    /// Handshake failures are final; the rest are worth another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ConnectError::HandshakeFailed(_))
    }
}

/// Failures of an individual method call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The browser rejected the call.
    #[error("protocol error {code}: {message}")]
    Protocol { code: i64, message: String },
    /// No reply arrived within the call timeout.
    #[error("call timed out")]
    Timeout,
    /// The channel died before a reply arrived.
    #[error("connection lost")]
    Disconnected,
}
