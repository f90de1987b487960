use std::net::SocketAddr;
use thiserror::Error;

/// All the ways the transport can fail. Codec errors on inbound data are logged and the
///  offending datagram dropped, they are never returned to application code; the variants
///  here surface through the public API and through [`EventSink::on_peer_error`].
///
/// [`EventSink::on_peer_error`]: crate::events::EventSink::on_peer_error
#[derive(Debug, Error)]
pub enum RakNetError {
    /// A wire field could not be decoded (truncated buffer, bad discriminator, ...)
    #[error("malformed field: {0}")]
    MalformedField(&'static str),

    /// A well-formed message arrived in a state where it is illegal
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Channel outside `0..MAX_CHANNELS`
    #[error("invalid channel {0}")]
    InvalidChannel(u8),

    /// Unknown reliability id on the wire
    #[error("invalid reliability id {0}")]
    InvalidReliability(u8),

    /// The configured MTU is below the protocol floor
    #[error("maximum transfer unit {0} is below the minimum of 400")]
    MtuExceeded(u16),

    /// Send or disconnect addressed to a peer that does not exist
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("endpoint is already running")]
    AlreadyRunning,

    #[error("endpoint is not running")]
    NotRunning,

    #[error("socket error")]
    Socket(#[from] std::io::Error),

    /// No datagram was received within the configured idle timeout
    #[error("no datagram received within the timeout")]
    Timeout,

    /// The peer exceeded the configured packets-per-second cap
    #[error("packets-per-second cap exceeded")]
    Flood,

    /// Connection attempt did not reach the logged-in state in time
    #[error("connection attempt to {0} timed out")]
    ConnectTimeout(SocketAddr),

    /// Connection attempt was refused by the remote end
    #[error("connection attempt to {addr} was refused: {reason}")]
    ConnectRefused { addr: SocketAddr, reason: &'static str },
}

impl From<bytes::TryGetError> for RakNetError {
    fn from(_: bytes::TryGetError) -> Self {
        RakNetError::MalformedField("truncated buffer")
    }
}

/// Why a peer was disconnected, as surfaced in `on_disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local application asked for the disconnect
    Disconnected,
    /// The remote end sent a disconnection notification
    PeerDisconnected,
    /// No datagram was received within the configured timeout
    Timeout,
    /// The peer exceeded the configured packets-per-second cap
    Flood,
    /// The endpoint is shutting down
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Disconnected => write!(f, "disconnected"),
            DisconnectReason::PeerDisconnected => write!(f, "peer disconnected"),
            DisconnectReason::Timeout => write!(f, "timeout"),
            DisconnectReason::Flood => write!(f, "flood"),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
        }
    }
}
