//! The inbound half of the per-peer reliability engine. Datagram sequence numbers feed the
//!  ACK/NACK sets and duplicate detection; encapsulated messages are deduplicated by their
//!  reliable index, reordered per channel, filtered by sequence index, and reassembled from
//!  split fragments before delivery.
//!
//! Missing datagrams are tracked in a materialized set bounded by the receive window. A gap
//!  is NACKed once, after a one-tick grace period so ordinary reordering does not trigger a
//!  retransmission; the entry stays in the set until the datagram arrives or falls out of
//!  the window, so a late arrival is not mistaken for a duplicate.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::encapsulated::EncapsulatedMessage;
use crate::reliability::Reliability;
use crate::MAX_CHANNELS;

/// Sequence numbers this far beyond the highest seen are treated as hostile and dropped
const DATAGRAM_RECEIVE_WINDOW: u32 = 4096;
/// A fragmented message may consist of at most this many fragments
const MAX_SPLIT_COUNT: u32 = 4096;
/// At most this many partially reassembled messages are kept per peer
const MAX_ACTIVE_SPLITS: usize = 64;
/// Ticks a gap must persist before it is NACKed
const NACK_GRACE_TICKS: u32 = 2;

struct MissingDatagram {
    ticks_waited: u32,
    nacked: bool,
}

struct OrderedChannel {
    next_expected: u32,
    buffer: BTreeMap<u32, Bytes>,
}

struct SplitAssembly {
    split_count: u32,
    fragments: FxHashMap<u32, Bytes>,
    reliability: Reliability,
    sequence_index: Option<u32>,
    ordering: Option<(u32, u8)>,
}

pub(crate) struct ReceiveQueue {
    /// all datagram sequence numbers below this were received or are tracked as missing
    next_datagram_expected: u32,
    missing_datagrams: BTreeMap<u32, MissingDatagram>,
    ack_pending: Vec<u32>,

    /// all reliable message indexes below this have been accepted
    next_contiguous_message_index: u32,
    /// accepted reliable indexes above the contiguous threshold
    received_message_indexes: BTreeSet<u32>,

    ordered: Vec<OrderedChannel>,
    /// lowest sequence index still accepted per channel (highest seen + 1)
    sequenced_floor: [u32; MAX_CHANNELS],

    splits: FxHashMap<u16, SplitAssembly>,
}

impl ReceiveQueue {
    pub fn new() -> ReceiveQueue {
        ReceiveQueue {
            next_datagram_expected: 0,
            missing_datagrams: BTreeMap::new(),
            ack_pending: Vec::new(),
            next_contiguous_message_index: 0,
            received_message_indexes: BTreeSet::new(),
            ordered: (0..MAX_CHANNELS)
                .map(|_| OrderedChannel {
                    next_expected: 0,
                    buffer: BTreeMap::new(),
                })
                .collect(),
            sequenced_floor: [0; MAX_CHANNELS],
            splits: FxHashMap::default(),
        }
    }

    /// Process one data datagram. Returns the `(channel, payload)` pairs that became
    ///  deliverable, in delivery order.
    pub fn on_datagram(
        &mut self,
        sequence_number: u32,
        messages: Vec<EncapsulatedMessage>,
    ) -> Vec<(u8, Bytes)> {
        if !self.register_datagram(sequence_number) {
            return Vec::new();
        }

        let mut delivered = Vec::new();
        for message in messages {
            self.on_message(message, &mut delivered);
        }
        delivered
    }

    /// Drain the sequence numbers to acknowledge on the next tick
    pub fn take_acks(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.ack_pending)
    }

    /// Advance the NACK grace counters and return the gaps that are now due for a NACK.
    ///  Each gap is NACKed at most once.
    pub fn take_nacks(&mut self) -> Vec<u32> {
        let mut due = Vec::new();
        for (&sequence_number, missing) in self.missing_datagrams.iter_mut() {
            missing.ticks_waited += 1;
            if !missing.nacked && missing.ticks_waited >= NACK_GRACE_TICKS {
                missing.nacked = true;
                due.push(sequence_number);
            }
        }
        due
    }

    /// Track a datagram sequence number; false means the datagram is a duplicate (or far
    ///  outside the receive window) and must be dropped.
    fn register_datagram(&mut self, sequence_number: u32) -> bool {
        if sequence_number >= self.next_datagram_expected {
            if sequence_number - self.next_datagram_expected > DATAGRAM_RECEIVE_WINDOW {
                warn!(
                    "datagram sequence number {} is wildly ahead of the expected {} - dropping",
                    sequence_number, self.next_datagram_expected
                );
                return false;
            }
            for missing in self.next_datagram_expected..sequence_number {
                self.missing_datagrams.insert(
                    missing,
                    MissingDatagram {
                        ticks_waited: 0,
                        nacked: false,
                    },
                );
            }
            self.next_datagram_expected = sequence_number + 1;
            self.evict_stale_missing();
            self.ack_pending.push(sequence_number);
            true
        } else if self.missing_datagrams.remove(&sequence_number).is_some() {
            trace!("gap datagram {} arrived late", sequence_number);
            self.ack_pending.push(sequence_number);
            true
        } else {
            debug!("duplicate datagram {} - dropping", sequence_number);
            false
        }
    }

    /// missing entries that fell out of the receive window will never be waited for again
    fn evict_stale_missing(&mut self) {
        let lower_bound = self
            .next_datagram_expected
            .saturating_sub(DATAGRAM_RECEIVE_WINDOW);
        while let Some((&sequence_number, _)) = self.missing_datagrams.first_key_value() {
            if sequence_number >= lower_bound {
                break;
            }
            debug!(
                "missing datagram {} moved out of the receive window - giving up on it",
                sequence_number
            );
            self.missing_datagrams.remove(&sequence_number);
        }
    }

    fn on_message(&mut self, message: EncapsulatedMessage, delivered: &mut Vec<(u8, Bytes)>) {
        // reliable dedup happens before anything else so retransmitted fragments and
        //  ordered messages are counted once
        if let Some(message_index) = message.message_index {
            if !self.accept_message_index(message_index) {
                trace!("duplicate reliable message {} - dropping", message_index);
                return;
            }
        }

        if let Some((_, channel)) = message.ordering {
            if channel as usize >= MAX_CHANNELS {
                warn!("message on invalid channel {} - dropping", channel);
                return;
            }
        }

        let message = match self.reassemble(message) {
            Some(message) => message,
            None => return, // fragment buffered or dropped
        };

        if message.reliability.is_sequenced() {
            self.deliver_sequenced(message, delivered);
        } else if message.reliability.is_ordered() {
            self.deliver_ordered(message, delivered);
        } else {
            delivered.push((0, message.payload));
        }
    }

    /// Accept a reliable message index at most once
    fn accept_message_index(&mut self, message_index: u32) -> bool {
        if message_index < self.next_contiguous_message_index
            || self.received_message_indexes.contains(&message_index)
        {
            return false;
        }
        if message_index == self.next_contiguous_message_index {
            self.next_contiguous_message_index += 1;
            while self
                .received_message_indexes
                .remove(&self.next_contiguous_message_index)
            {
                self.next_contiguous_message_index += 1;
            }
        } else {
            self.received_message_indexes.insert(message_index);
        }
        true
    }

    /// Pass a complete message through; buffer a fragment, reassembling once all fragments
    ///  of its split id are present.
    fn reassemble(&mut self, message: EncapsulatedMessage) -> Option<EncapsulatedMessage> {
        let Some(split) = message.split else {
            return Some(message);
        };

        if split.split_count == 0
            || split.split_count > MAX_SPLIT_COUNT
            || split.split_index >= split.split_count
        {
            warn!(
                "fragment with inconsistent split header {:?} - dropping",
                split
            );
            return None;
        }

        if !self.splits.contains_key(&split.split_id) && self.splits.len() >= MAX_ACTIVE_SPLITS {
            // the table is full; evicting an incomplete transfer keeps a misbehaving peer
            //  from pinning unbounded memory
            let stale = self.splits.keys().next().copied();
            if let Some(stale) = stale {
                warn!("too many concurrent split transfers, evicting split id {}", stale);
                self.splits.remove(&stale);
            }
        }

        let assembly = self
            .splits
            .entry(split.split_id)
            .or_insert_with(|| SplitAssembly {
                split_count: split.split_count,
                fragments: FxHashMap::default(),
                reliability: message.reliability,
                sequence_index: message.sequence_index,
                ordering: message.ordering,
            });
        if assembly.split_count != split.split_count {
            warn!(
                "fragment of split {} disagrees about the fragment count - dropping",
                split.split_id
            );
            return None;
        }
        assembly.fragments.insert(split.split_index, message.payload);
        if assembly.fragments.len() < assembly.split_count as usize {
            return None;
        }

        let assembly = self
            .splits
            .remove(&split.split_id)
            .expect("just inserted above");
        let mut payload = BytesMut::new();
        for index in 0..assembly.split_count {
            payload.extend_from_slice(
                &assembly.fragments[&index],
            );
        }
        debug!(
            "reassembled split {} from {} fragments ({} bytes)",
            split.split_id,
            assembly.split_count,
            payload.len()
        );

        Some(EncapsulatedMessage {
            reliability: assembly.reliability,
            message_index: None,
            sequence_index: assembly.sequence_index,
            ordering: assembly.ordering,
            split: None,
            payload: payload.freeze(),
        })
    }

    /// latest-wins: drop anything at or below the highest sequence index already handled
    fn deliver_sequenced(
        &mut self,
        message: EncapsulatedMessage,
        delivered: &mut Vec<(u8, Bytes)>,
    ) {
        let sequence_index = message
            .sequence_index
            .expect("sequenced message without a sequence index");
        let (_, channel) = message.ordering.expect("sequenced message without a channel");
        let floor = &mut self.sequenced_floor[channel as usize];
        if sequence_index < *floor {
            trace!(
                "sequenced message {} on channel {} is older than {} - dropping",
                sequence_index,
                channel,
                *floor
            );
            return;
        }
        *floor = sequence_index + 1;
        delivered.push((channel, message.payload));
    }

    /// gapless in-order: buffer until the next expected ordered index arrives, then drain
    fn deliver_ordered(&mut self, message: EncapsulatedMessage, delivered: &mut Vec<(u8, Bytes)>) {
        let (ordered_index, channel) =
            message.ordering.expect("ordered message without an ordering");
        let state = &mut self.ordered[channel as usize];

        if ordered_index < state.next_expected {
            // reliable dedup already caught true duplicates; this can only happen if the
            //  peer reuses an ordered index, which there is no meaningful way to honor
            debug!(
                "ordered message {} on channel {} is below the delivery cursor - dropping",
                ordered_index, channel
            );
            return;
        }
        if ordered_index == state.next_expected {
            state.next_expected += 1;
            delivered.push((channel, message.payload));
            while let Some(payload) = state.buffer.remove(&state.next_expected) {
                state.next_expected += 1;
                delivered.push((channel, payload));
            }
        } else {
            trace!(
                "ordered message {} on channel {} buffered, waiting for {}",
                ordered_index,
                channel,
                state.next_expected
            );
            state.buffer.insert(ordered_index, message.payload);
        }
    }
}
