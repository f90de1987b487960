//! The delivery guarantees a message can be sent with. The numeric ids are part of the wire
//!  format (bits 7:5 of the encapsulated-message flag byte).

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::RakNetError;

/// How a message is delivered. "Ordered" and "sequenced" are mutually exclusive by
///  construction: ordered delivery holds back newer messages until all older ones arrived,
///  sequenced delivery drops anything older than the newest already handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Reliability {
    /// Sent once, may be lost, duplicated or reordered
    Unreliable = 0,
    /// Unreliable, but anything older than the newest handled message on the channel is dropped
    UnreliableSequenced = 1,
    /// Retransmitted until acknowledged, delivered exactly once
    Reliable = 2,
    /// Reliable, delivered in send order per channel with no gaps
    ReliableOrdered = 3,
    /// Reliable, but anything older than the newest handled message on the channel is dropped
    ReliableSequenced = 4,
    /// Unreliable; the sender is told through an ack receipt whether the covering datagram
    ///  was acknowledged or lost
    UnreliableWithAckReceipt = 5,
    /// Reliable with an ack receipt once the message is acknowledged
    ReliableWithAckReceipt = 6,
    /// Reliable ordered with an ack receipt once the message is acknowledged
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    /// Decode a wire id, mapping unknown ids to `InvalidReliability`
    pub fn from_id(id: u8) -> Result<Reliability, RakNetError> {
        Reliability::try_from(id).map_err(|_| RakNetError::InvalidReliability(id))
    }

    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Reliability::Reliable
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Reliability::ReliableOrdered | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced | Reliability::ReliableSequenced
        )
    }

    pub fn wants_ack_receipt(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableWithAckReceipt
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }
}
