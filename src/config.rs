use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::error::RakNetError;
use crate::{MAXIMUM_MTU, MINIMUM_MTU};

/// Endpoint configuration. `default_v4()` gives values that work on a typical LAN; servers
///  usually override `bind_address`, `max_connections` and `identifier`.
#[derive(Debug, Clone)]
pub struct RakNetConfig {
    /// Local UDP address. Port 0 binds an ephemeral port.
    pub bind_address: SocketAddr,

    /// Upper bound on the size of a single datagram (the UDP payload). Peers negotiate the
    ///  effective value during the handshake; this is the local cap. The protocol enforces
    ///  non-fragmentation at the IP level, so this must be supported end-to-end - with full
    ///  Ethernet frames and no optional IP headers, 1492 is safe.
    pub maximum_transfer_unit: u16,

    /// Server-side connection cap. `-1` means unlimited.
    pub max_connections: i32,

    /// Opaque bytes advertised in unconnected pong responses
    pub identifier: Bytes,

    /// If false, unconnected pings are never answered
    pub broadcasting_enabled: bool,

    /// Idle time after which a peer is disconnected
    pub timeout: Duration,

    /// How long an idle connection may go without outbound traffic before a keep-alive ping
    ///  is sent. Must be well below `timeout`.
    pub keep_alive_interval: Duration,

    /// Per-peer inbound datagram rate above which the peer is treated as flooding
    pub max_packets_per_second: u32,

    /// How long a flooding peer's IP stays blocked
    pub flood_block_duration: Duration,

    /// Period of the loop that drives retransmission, ACK/NACK emission and timeouts
    pub tick_interval: Duration,

    /// First retransmission of an unacknowledged message happens after this long; subsequent
    ///  attempts back off exponentially up to `retransmit_timeout_max`.
    pub retransmit_timeout_initial: Duration,
    pub retransmit_timeout_max: Duration,

    /// Client side: how long `connect` waits for the handshake to reach the logged-in state
    pub connection_timeout: Duration,
}

impl RakNetConfig {
    pub fn default_v4() -> RakNetConfig {
        RakNetConfig {
            bind_address: "0.0.0.0:0".parse().expect("valid wildcard address"),
            maximum_transfer_unit: MAXIMUM_MTU,
            max_connections: 10,
            identifier: Bytes::new(),
            broadcasting_enabled: true,
            timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_millis(2500),
            max_packets_per_second: 500,
            flood_block_duration: Duration::from_secs(10),
            tick_interval: Duration::from_millis(10),
            retransmit_timeout_initial: Duration::from_millis(500),
            retransmit_timeout_max: Duration::from_secs(4),
            connection_timeout: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> Result<(), RakNetError> {
        if self.maximum_transfer_unit < MINIMUM_MTU {
            return Err(RakNetError::MtuExceeded(self.maximum_transfer_unit));
        }
        // the encapsulated-message length field counts bits in a u16, which bounds a single
        //  datagram well below the u16 range of the config field
        if self.maximum_transfer_unit > 8192 {
            return Err(RakNetError::ProtocolViolation(
                "maximum_transfer_unit must not exceed 8192",
            ));
        }
        if self.max_connections < -1 {
            return Err(RakNetError::ProtocolViolation(
                "max_connections must be -1 (unlimited) or non-negative",
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(RakNetError::ProtocolViolation(
                "tick_interval must be non-zero",
            ));
        }
        if self.retransmit_timeout_initial < Duration::from_millis(100) {
            return Err(RakNetError::ProtocolViolation(
                "retransmit_timeout_initial must be at least 100ms",
            ));
        }
        Ok(())
    }

    /// Room for another incoming connection given the current peer count
    pub fn has_room_for(&self, current_connections: usize) -> bool {
        self.max_connections < 0 || current_connections < self.max_connections as usize
    }
}
