//! The capability through which the endpoint talks back to the application: one typed sink
//!  passed in at construction. Callbacks run on a dedicated dispatch task so a slow handler
//!  never stalls the protocol loops; for one peer they fire in the wire order of the
//!  messages that caused them.

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;

use crate::error::{DisconnectReason, RakNetError};

/// A connected remote endpoint, identified by its address and its 64-bit GUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub address: SocketAddr,
    pub guid: u64,
}

/// Handle returned by `send_message` for the `*_WITH_ACK_RECEIPT` reliabilities. The matching
///  `on_acknowledge` / `on_not_acknowledge` callback fires at most once, after the covering
///  ACK or NACK has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(pub u64);

/// Application callbacks. All methods have no-op defaults, implement what you need.
///
/// A returned `Err` is caught, logged and reported through `on_handler_error`; it never
///  propagates into the protocol loops.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// A peer completed the offline handshake and entered the connected state
    async fn on_connect(&self, _peer: PeerHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// A peer completed the connected handshake and is fully logged in
    async fn on_login(&self, _peer: PeerHandle) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disconnect(
        &self,
        _peer: PeerHandle,
        _reason: DisconnectReason,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A user message was delivered on a channel
    async fn on_message(
        &self,
        _peer: PeerHandle,
        _channel: u8,
        _payload: Bytes,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_acknowledge(&self, _peer: PeerHandle, _receipt: Receipt) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_not_acknowledge(
        &self,
        _peer: PeerHandle,
        _receipt: Receipt,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// An unconnected ping is about to be answered. Return `Some` to substitute the
    ///  advertised identifier for this one pong, `None` to use the configured identifier.
    ///
    /// Unlike the other callbacks this one is consulted inline on the receive path, so it
    ///  should return quickly.
    async fn handle_ping(&self, _sender: SocketAddr) -> Option<Bytes> {
        None
    }

    /// A callback returned an error; the error never propagates into the protocol loops
    async fn on_handler_error(&self, _address: SocketAddr, _cause: anyhow::Error) {}

    /// A per-peer runtime error; the peer in question is disconnected, others are unaffected
    async fn on_peer_error(&self, _peer: PeerHandle, _cause: RakNetError) {}
}

/// Queued towards the dispatch task by the protocol loops
#[derive(Debug)]
pub(crate) enum Event {
    Connect(PeerHandle),
    Login(PeerHandle),
    Disconnect(PeerHandle, DisconnectReason),
    Message(PeerHandle, u8, Bytes),
    Acknowledge(PeerHandle, Receipt),
    NotAcknowledge(PeerHandle, Receipt),
    PeerError(PeerHandle, RakNetError),
}
