//! The outbound half of the per-peer reliability engine: assigns reliable / ordered /
//!  sequenced indices, splits messages that do not fit the negotiated MTU, packs pending
//!  messages into datagrams, and retransmits unacknowledged reliable messages - immediately
//!  on NACK, otherwise on an exponentially backed-off timeout.
//!
//! Application sends are enqueued here and drained by the endpoint's tick, so submitting
//!  never touches the socket.

use std::collections::{BTreeMap, VecDeque};

use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::put_u24_le;
use crate::datagram::{AckRecord, DatagramFlags, DATAGRAM_HEADER_LEN};
use crate::encapsulated::{EncapsulatedMessage, SplitHeader};
use crate::error::RakNetError;
use crate::events::Receipt;
use crate::reliability::Reliability;
use crate::MAX_CHANNELS;

/// A datagram whose ACK/NACK fate is unknown for this long is written off; pending
///  unreliable-with-receipt messages in it surface as not acknowledged.
const SENT_DATAGRAM_TTL: Duration = Duration::from_secs(10);

struct PendingMessage {
    message: EncapsulatedMessage,
    receipt: Option<Receipt>,
}

struct UnackedMessage {
    message: EncapsulatedMessage,
    receipt: Option<Receipt>,
    last_send: Instant,
    /// retransmissions so far, drives the backoff
    attempts: u32,
}

#[derive(Default)]
struct SentDatagram {
    sent_at: Option<Instant>,
    message_indexes: Vec<u32>,
    unreliable_receipts: Vec<Receipt>,
}

impl SentDatagram {
    fn is_trivial(&self) -> bool {
        self.message_indexes.is_empty() && self.unreliable_receipts.is_empty()
    }
}

pub(crate) struct SendQueue {
    mtu: usize,
    retransmit_initial: Duration,
    retransmit_max: Duration,

    next_sequence_number: u32,
    next_message_index: u32,
    next_split_id: u16,
    ordered_index: [u32; MAX_CHANNELS],
    sequenced_index: [u32; MAX_CHANNELS],

    /// submitted but not yet packed into a datagram
    pending: VecDeque<PendingMessage>,
    /// reliable messages awaiting acknowledgement, keyed by message index
    unacked: BTreeMap<u32, UnackedMessage>,
    /// message indexes scheduled for immediate retransmission by a NACK
    resend_requests: Vec<u32>,
    /// what each in-flight datagram carried, keyed by datagram sequence number
    sent_datagrams: FxHashMap<u32, SentDatagram>,
}

impl SendQueue {
    pub fn new(
        mtu: u16,
        retransmit_initial: Duration,
        retransmit_max: Duration,
    ) -> SendQueue {
        SendQueue {
            mtu: mtu as usize,
            retransmit_initial,
            retransmit_max,
            next_sequence_number: 0,
            next_message_index: 0,
            next_split_id: 0,
            ordered_index: [0; MAX_CHANNELS],
            sequenced_index: [0; MAX_CHANNELS],
            pending: VecDeque::new(),
            unacked: BTreeMap::new(),
            resend_requests: Vec::new(),
            sent_datagrams: FxHashMap::default(),
        }
    }

    /// Register a message for sending. Indices are assigned here so that the send order is
    ///  the submission order; the wire traffic happens on the next tick.
    pub fn submit(
        &mut self,
        reliability: Reliability,
        channel: u8,
        payload: Bytes,
        receipt: Option<Receipt>,
    ) -> Result<(), RakNetError> {
        if channel as usize >= MAX_CHANNELS {
            return Err(RakNetError::InvalidChannel(channel));
        }
        let ch = channel as usize;

        let sequence_index = if reliability.is_sequenced() {
            let index = self.sequenced_index[ch];
            self.sequenced_index[ch] = (index + 1) & 0x00ff_ffff;
            Some(index)
        } else {
            None
        };
        let ordering = if reliability.is_ordered() {
            let index = self.ordered_index[ch];
            self.ordered_index[ch] = (index + 1) & 0x00ff_ffff;
            Some((index, channel))
        } else if reliability.is_sequenced() {
            // sequenced messages carry the channel's current ordered index without advancing it
            Some((self.ordered_index[ch], channel))
        } else {
            None
        };

        let max_single_payload =
            self.mtu - DATAGRAM_HEADER_LEN - EncapsulatedMessage::header_len(reliability, false);
        if payload.len() <= max_single_payload {
            let message_index = reliability.is_reliable().then(|| self.take_message_index());
            self.pending.push_back(PendingMessage {
                message: EncapsulatedMessage {
                    reliability,
                    message_index,
                    sequence_index,
                    ordering,
                    split: None,
                    payload,
                },
                receipt,
            });
            return Ok(());
        }

        // does not fit into one datagram: fragment. Every fragment inherits the parent's
        //  reliability and ordering; reliable fragments get distinct message indexes.
        let chunk_len =
            self.mtu - DATAGRAM_HEADER_LEN - EncapsulatedMessage::header_len(reliability, true);
        let split_count = payload.len().div_ceil(chunk_len);
        let split_id = self.next_split_id;
        self.next_split_id = self.next_split_id.wrapping_add(1);

        debug!(
            "splitting message of {} bytes into {} fragments (split id {})",
            payload.len(),
            split_count,
            split_id
        );

        for index in 0..split_count {
            let start = index * chunk_len;
            let end = (start + chunk_len).min(payload.len());
            let message_index = reliability.is_reliable().then(|| self.take_message_index());
            let is_last = index + 1 == split_count;
            self.pending.push_back(PendingMessage {
                message: EncapsulatedMessage {
                    reliability,
                    message_index,
                    sequence_index,
                    ordering,
                    split: Some(SplitHeader {
                        split_count: split_count as u32,
                        split_id,
                        split_index: index as u32,
                    }),
                    payload: payload.slice(start..end),
                },
                // the receipt covers the whole message: it rides on the last fragment
                receipt: if is_last { receipt } else { None },
            });
        }
        Ok(())
    }

    /// Every reliable message carried by an acknowledged datagram leaves the unacked set.
    ///  Returns the receipts that are now acknowledged.
    pub fn on_ack(&mut self, records: &[AckRecord]) -> Vec<Receipt> {
        let mut acknowledged = Vec::new();
        for sequence_number in AckRecord::expand(records) {
            let Some(sent) = self.sent_datagrams.remove(&sequence_number) else {
                continue;
            };
            trace!("datagram {} acknowledged", sequence_number);
            for message_index in sent.message_indexes {
                if let Some(unacked) = self.unacked.remove(&message_index) {
                    if let Some(receipt) = unacked.receipt {
                        acknowledged.push(receipt);
                    }
                }
            }
            acknowledged.extend(sent.unreliable_receipts);
        }
        acknowledged
    }

    /// A NACKed datagram's reliable messages are scheduled for immediate retransmission;
    ///  its unreliable-with-receipt messages are reported lost and not retransmitted.
    pub fn on_nack(&mut self, records: &[AckRecord]) -> Vec<Receipt> {
        let mut not_acknowledged = Vec::new();
        for sequence_number in AckRecord::expand(records) {
            let Some(sent) = self.sent_datagrams.remove(&sequence_number) else {
                continue;
            };
            debug!(
                "datagram {} was NACKed, rescheduling {} reliable messages",
                sequence_number,
                sent.message_indexes.len()
            );
            for message_index in sent.message_indexes {
                if self.unacked.contains_key(&message_index) {
                    self.resend_requests.push(message_index);
                }
            }
            not_acknowledged.extend(sent.unreliable_receipts);
        }
        not_acknowledged
    }

    /// Drive retransmission and drain the pending queue into datagrams. Returns the receipts
    ///  of unreliable-with-receipt messages whose covering datagram fate never arrived.
    pub fn tick(&mut self, now: Instant, out: &mut Vec<BytesMut>) -> Vec<Receipt> {
        let mut to_pack: Vec<(EncapsulatedMessage, Option<Receipt>, bool)> = Vec::new();

        // NACK-requested resends go out first
        let mut resends = std::mem::take(&mut self.resend_requests);
        resends.sort_unstable();
        resends.dedup();
        for message_index in resends {
            if let Some(unacked) = self.unacked.get_mut(&message_index) {
                unacked.attempts += 1;
                unacked.last_send = now;
                to_pack.push((unacked.message.clone(), None, false));
            }
        }

        // timeout-based retransmission with exponential backoff
        for (&message_index, unacked) in self.unacked.iter_mut() {
            let timeout = retransmit_timeout(
                self.retransmit_initial,
                self.retransmit_max,
                unacked.attempts,
            );
            if now >= unacked.last_send + timeout {
                debug!(
                    "message {} unacknowledged after {:?} (attempt {}), retransmitting",
                    message_index, timeout, unacked.attempts
                );
                unacked.attempts += 1;
                unacked.last_send = now;
                to_pack.push((unacked.message.clone(), None, false));
            }
        }

        while let Some(pending) = self.pending.pop_front() {
            to_pack.push((pending.message, pending.receipt, true));
        }

        self.pack(now, to_pack, out);

        // give up on datagrams whose ACK/NACK never arrived
        let mut written_off = Vec::new();
        let unacked = &self.unacked;
        self.sent_datagrams.retain(|_, sent| {
            let expired = sent
                .sent_at
                .map(|at| now.duration_since(at) >= SENT_DATAGRAM_TTL)
                .unwrap_or(false);
            let still_relevant = sent
                .message_indexes
                .iter()
                .any(|index| unacked.contains_key(index))
                || !sent.unreliable_receipts.is_empty();
            if expired {
                written_off.append(&mut sent.unreliable_receipts);
            }
            !expired && still_relevant
        });
        written_off
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.unacked.is_empty() && self.resend_requests.is_empty()
    }

    fn take_message_index(&mut self) -> u32 {
        let index = self.next_message_index;
        self.next_message_index = (index + 1) & 0x00ff_ffff;
        index
    }

    fn take_sequence_number(&mut self) -> u32 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number = (sequence_number + 1) & 0x00ff_ffff;
        sequence_number
    }

    /// Greedily pack messages into datagrams of at most `mtu` bytes, in order
    fn pack(
        &mut self,
        now: Instant,
        to_pack: Vec<(EncapsulatedMessage, Option<Receipt>, bool)>,
        out: &mut Vec<BytesMut>,
    ) {
        let mut current: Option<(u32, BytesMut, SentDatagram)> = None;

        for (message, receipt, fresh) in to_pack {
            let wire_len = message.wire_len();
            debug_assert!(DATAGRAM_HEADER_LEN + wire_len <= self.mtu);

            if let Some((_, buf, _)) = &current {
                if buf.len() + wire_len > self.mtu {
                    self.finalize_datagram(current.take().expect("checked above"), now, out);
                }
            }
            let (_, buf, meta) = current.get_or_insert_with(|| {
                let sequence_number = self.take_sequence_number();
                let mut buf = BytesMut::with_capacity(self.mtu);
                buf.put_u8(DatagramFlags::VALID.bits());
                put_u24_le(&mut buf, sequence_number);
                (sequence_number, buf, SentDatagram::default())
            });

            message.ser(buf);

            if message.reliability.is_reliable() {
                let message_index = message
                    .message_index
                    .expect("reliable message without a message index");
                meta.message_indexes.push(message_index);
                if fresh {
                    self.unacked.insert(
                        message_index,
                        UnackedMessage {
                            message,
                            receipt,
                            last_send: now,
                            attempts: 0,
                        },
                    );
                }
            } else if let Some(receipt) = receipt {
                meta.unreliable_receipts.push(receipt);
            }
        }

        if let Some(datagram) = current {
            self.finalize_datagram(datagram, now, out);
        }
    }

    fn finalize_datagram(
        &mut self,
        (sequence_number, buf, mut meta): (u32, BytesMut, SentDatagram),
        now: Instant,
        out: &mut Vec<BytesMut>,
    ) {
        trace!(
            "packed datagram {} with {} bytes",
            sequence_number,
            buf.len()
        );
        if !meta.is_trivial() {
            meta.sent_at = Some(now);
            self.sent_datagrams.insert(sequence_number, meta);
        }
        out.push(buf);
    }
}

fn retransmit_timeout(initial: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 1u32 << attempts.min(3);
    (initial * factor).min(max)
}
