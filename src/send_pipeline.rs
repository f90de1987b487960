//! The outbound half of the endpoint's socket: everything the protocol puts on the wire
//!  leaves through here. The pipeline owns the encode step for offline messages, sends one
//!  peer's tick output as an ordered batch, and applies the error policy: a failed send is
//!  transient - reliable traffic is retransmitted anyway, and a peer is only torn down by
//!  timeout or an API call - so failures are logged and never propagate.

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::offline::OfflineMessage;

/// The raw datagram surface the pipeline drives. Narrow on purpose so tests can swap the
///  I/O out for a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Put one UDP payload on the wire
    async fn send(&self, to: SocketAddr, payload: &[u8]) -> std::io::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send(&self, to: SocketAddr, payload: &[u8]) -> std::io::Result<()> {
        self.send_to(payload, to).await.map(|_| ())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("a bound socket has a local address")
    }
}

#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn DatagramSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn DatagramSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Send one peer's tick output in order: data datagrams first, then ACK/NACK feedback,
    ///  exactly as the reliability engine emitted them. A failed send does not stop the
    ///  rest of the batch; dropping the tail would only add artificial gaps for the
    ///  receiver to NACK.
    pub async fn send_datagrams(&self, to: SocketAddr, datagrams: &[BytesMut]) {
        for datagram in datagrams {
            self.send_raw(to, datagram).await;
        }
    }

    /// Encode and send a single offline message. Offline traffic is connectionless, one
    ///  message per datagram; retries are the business of whoever is running the handshake.
    pub async fn send_offline(&self, to: SocketAddr, message: &OfflineMessage) {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        trace!(
            "sending offline message {:#04x} ({} bytes) to {:?}",
            message.message_id(),
            buf.len(),
            to
        );
        self.send_raw(to, &buf).await;
    }

    async fn send_raw(&self, to: SocketAddr, payload: &[u8]) {
        if let Err(e) = self.socket.send(to, payload).await {
            warn!("failed to send {} bytes to {:?}: {}", payload.len(), to, e);
        }
    }
}
