//! Per-peer session state: the connection state machine, liveness accounting (keep-alive,
//!  idle timeout, flood counter) and the two halves of the reliability engine. A peer comes
//!  into existence when the second offline handshake round completes and is torn down when
//!  it reaches `Disconnected`.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::trace;

use crate::config::RakNetConfig;
use crate::connected::ConnectedMessage;
use crate::datagram::{AckRecord, Datagram};
use crate::encapsulated::EncapsulatedMessage;
use crate::error::RakNetError;
use crate::events::{PeerHandle, Receipt};
use crate::receive_queue::ReceiveQueue;
use crate::reliability::Reliability;
use crate::send_queue::SendQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// offline handshake complete, waiting for the connected-mode connection request
    Connected,
    /// connection request accepted, waiting for the final round
    Handshaking,
    /// fully established, user data flows
    LoggedIn,
    /// terminal
    Disconnected,
}

pub(crate) struct Peer {
    pub handle: PeerHandle,
    pub state: PeerState,
    pub mtu: u16,

    send_queue: SendQueue,
    receive_queue: ReceiveQueue,

    last_receive: Instant,
    last_send: Instant,

    flood_window_start: Instant,
    flood_counter: u32,

    next_receipt: u64,
}

impl Peer {
    pub fn new(
        address: SocketAddr,
        guid: u64,
        mtu: u16,
        config: &RakNetConfig,
        now: Instant,
    ) -> Peer {
        Peer {
            handle: PeerHandle { address, guid },
            state: PeerState::Connected,
            mtu,
            send_queue: SendQueue::new(
                mtu,
                config.retransmit_timeout_initial,
                config.retransmit_timeout_max,
            ),
            receive_queue: ReceiveQueue::new(),
            last_receive: now,
            last_send: now,
            flood_window_start: now,
            flood_counter: 0,
            next_receipt: 0,
        }
    }

    /// Queue a message for sending; the wire traffic happens on the next tick. Returns a
    ///  receipt handle iff the reliability asks for an ack receipt.
    pub fn submit(
        &mut self,
        reliability: Reliability,
        channel: u8,
        payload: Bytes,
    ) -> Result<Option<Receipt>, RakNetError> {
        let receipt = if reliability.wants_ack_receipt() {
            let receipt = Receipt(self.next_receipt);
            self.next_receipt += 1;
            Some(receipt)
        } else {
            None
        };
        self.send_queue.submit(reliability, channel, payload, receipt)?;
        Ok(receipt)
    }

    /// Queue a protocol-internal message
    pub fn submit_system(
        &mut self,
        reliability: Reliability,
        message: &ConnectedMessage,
    ) -> Result<(), RakNetError> {
        self.send_queue
            .submit(reliability, 0, message.to_payload(), None)?;
        Ok(())
    }

    pub fn on_data(
        &mut self,
        sequence_number: u32,
        messages: Vec<EncapsulatedMessage>,
    ) -> Vec<(u8, Bytes)> {
        self.receive_queue.on_datagram(sequence_number, messages)
    }

    pub fn on_ack(&mut self, records: &[AckRecord]) -> Vec<Receipt> {
        self.send_queue.on_ack(records)
    }

    pub fn on_nack(&mut self, records: &[AckRecord]) -> Vec<Receipt> {
        self.send_queue.on_nack(records)
    }

    /// Count an inbound datagram against the flood cap; false means the peer is flooding.
    ///  Also refreshes the liveness timestamp.
    pub fn register_inbound(&mut self, now: Instant, max_packets_per_second: u32) -> bool {
        self.last_receive = now;
        if now.duration_since(self.flood_window_start) >= Duration::from_secs(1) {
            self.flood_window_start = now;
            self.flood_counter = 0;
        }
        self.flood_counter += 1;
        self.flood_counter <= max_packets_per_second
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_receive) >= timeout
    }

    /// One protocol tick: emit pending ACKs/NACKs, send a keep-alive ping if the connection
    ///  is send-idle, drive retransmission and drain queued sends into datagrams. Returns the
    ///  datagrams to put on the wire and the receipts that must be reported as lost.
    pub fn tick(
        &mut self,
        now: Instant,
        timestamp: u64,
        keep_alive_interval: Duration,
    ) -> (Vec<BytesMut>, Vec<Receipt>) {
        let mut out = Vec::new();

        self.emit_acknowledgements(&mut out);

        if now.duration_since(self.last_send) >= keep_alive_interval {
            trace!("connection to {:?} is idle - sending keep-alive ping", self.handle.address);
            let _ = self.submit_system(
                Reliability::Reliable,
                &ConnectedMessage::Ping { timestamp },
            );
        }

        let written_off = self.send_queue.tick(now, &mut out);

        if !out.is_empty() {
            self.last_send = now;
        }
        (out, written_off)
    }

    /// Drain queued sends into datagrams right now, without the tick's liveness side
    ///  effects. Used to push out a disconnection notification synchronously.
    pub fn flush(&mut self, now: Instant) -> Vec<BytesMut> {
        let mut out = Vec::new();
        self.emit_acknowledgements(&mut out);
        let _ = self.send_queue.tick(now, &mut out);
        out
    }

    fn emit_acknowledgements(&mut self, out: &mut Vec<BytesMut>) {
        // a range record is the bigger encoding; staying under the MTU with that pessimism
        //  keeps the chunking trivial
        let max_records = (self.mtu as usize - 1 - 2) / 7;

        let acks = self.receive_queue.take_acks();
        if !acks.is_empty() {
            for chunk in AckRecord::condense(acks).chunks(max_records) {
                let mut buf = BytesMut::new();
                Datagram::Ack {
                    records: chunk.to_vec(),
                }
                .ser(&mut buf);
                out.push(buf);
            }
        }

        let nacks = self.receive_queue.take_nacks();
        if !nacks.is_empty() {
            for chunk in AckRecord::condense(nacks).chunks(max_records) {
                let mut buf = BytesMut::new();
                Datagram::Nack {
                    records: chunk.to_vec(),
                }
                .ser(&mut buf);
                out.push(buf);
            }
        }
    }
}
