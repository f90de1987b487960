//! Codec for the messages carried inside a connected data datagram. Each message has its own
//!  reliability metadata so one datagram can mix guarantees freely.
//!
//! Wire layout (see the crate docs for the full picture):
//!
//! ```ascii
//! 0: flags - bits 7:5 reliability id, bit 4 split fragment
//! 1: payload length in BITS (u16 BE)
//! *: message index (u24 LE)               - reliable variants only
//! *: sequence index (u24 LE)              - sequenced variants only
//! *: ordered index (u24 LE) + channel (u8) - ordered or sequenced variants
//! *: split count (u32 BE), split id (u16 BE), split index (u32 BE) - split fragments only
//! *: payload
//! ```

use bytes::{Buf, BufMut, Bytes};

use crate::codec::{put_u24_le, try_get_u24_le};
use crate::error::RakNetError;
use crate::reliability::Reliability;

const FLAG_SPLIT: u8 = 0x10;

/// Fragment bookkeeping for a message that did not fit into one datagram. All fragments of
///  one message share the split id; indices run `0..split_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitHeader {
    pub split_count: u32,
    pub split_id: u16,
    pub split_index: u32,
}

impl SplitHeader {
    pub const SERIALIZED_LEN: usize = 4 + 2 + 4;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulatedMessage {
    pub reliability: Reliability,
    /// reliable index, present iff the reliability is reliable
    pub message_index: Option<u32>,
    /// present iff the reliability is sequenced
    pub sequence_index: Option<u32>,
    /// ordered index and channel, present iff the reliability is ordered or sequenced
    pub ordering: Option<(u32, u8)>,
    pub split: Option<SplitHeader>,
    pub payload: Bytes,
}

impl EncapsulatedMessage {
    /// Header size ahead of the payload for a given reliability / split combination
    pub fn header_len(reliability: Reliability, split: bool) -> usize {
        let mut len = 1 + 2; // flags + bit length
        if reliability.is_reliable() {
            len += 3;
        }
        if reliability.is_sequenced() {
            len += 3;
        }
        if reliability.is_ordered() || reliability.is_sequenced() {
            len += 3 + 1;
        }
        if split {
            len += SplitHeader::SERIALIZED_LEN;
        }
        len
    }

    pub fn wire_len(&self) -> usize {
        Self::header_len(self.reliability, self.split.is_some()) + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let reliability_id: u8 = self.reliability.into();
        let mut flags = reliability_id << 5;
        if self.split.is_some() {
            flags |= FLAG_SPLIT;
        }
        buf.put_u8(flags);

        debug_assert!(self.payload.len() * 8 <= u16::MAX as usize);
        buf.put_u16((self.payload.len() * 8) as u16);

        if self.reliability.is_reliable() {
            let message_index = self
                .message_index
                .expect("reliable message without a message index");
            put_u24_le(buf, message_index);
        }
        if self.reliability.is_sequenced() {
            let sequence_index = self
                .sequence_index
                .expect("sequenced message without a sequence index");
            put_u24_le(buf, sequence_index);
        }
        if self.reliability.is_ordered() || self.reliability.is_sequenced() {
            let (ordered_index, channel) =
                self.ordering.expect("ordered message without an ordering");
            put_u24_le(buf, ordered_index);
            buf.put_u8(channel);
        }
        if let Some(split) = &self.split {
            buf.put_u32(split.split_count);
            buf.put_u16(split.split_id);
            buf.put_u32(split.split_index);
        }
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<EncapsulatedMessage, RakNetError> {
        let flags = buf.try_get_u8()?;
        let reliability = Reliability::from_id(flags >> 5)?;
        let is_split = flags & FLAG_SPLIT != 0;

        // length is transmitted in bits, round up to whole bytes
        let bit_length = buf.try_get_u16()?;
        let payload_len = (bit_length as usize + 7) / 8;

        let message_index = if reliability.is_reliable() {
            Some(try_get_u24_le(buf)?)
        } else {
            None
        };
        let sequence_index = if reliability.is_sequenced() {
            Some(try_get_u24_le(buf)?)
        } else {
            None
        };
        let ordering = if reliability.is_ordered() || reliability.is_sequenced() {
            let ordered_index = try_get_u24_le(buf)?;
            let channel = buf.try_get_u8()?;
            Some((ordered_index, channel))
        } else {
            None
        };
        let split = if is_split {
            Some(SplitHeader {
                split_count: buf.try_get_u32()?,
                split_id: buf.try_get_u16()?,
                split_index: buf.try_get_u32()?,
            })
        } else {
            None
        };

        if buf.remaining() < payload_len {
            return Err(RakNetError::MalformedField("encapsulated payload"));
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(EncapsulatedMessage {
            reliability,
            message_index,
            sequence_index,
            ordering,
            split,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    fn roundtrip(message: &EncapsulatedMessage) -> EncapsulatedMessage {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        assert_eq!(buf.len(), message.wire_len());

        let mut b: &[u8] = &buf;
        let deser = EncapsulatedMessage::deser(&mut b).unwrap();
        assert!(b.is_empty());
        deser
    }

    #[rstest]
    #[case::unreliable(EncapsulatedMessage {
        reliability: Reliability::Unreliable,
        message_index: None,
        sequence_index: None,
        ordering: None,
        split: None,
        payload: Bytes::from_static(b"hello"),
    })]
    #[case::unreliable_sequenced(EncapsulatedMessage {
        reliability: Reliability::UnreliableSequenced,
        message_index: None,
        sequence_index: Some(77),
        ordering: Some((12, 3)),
        split: None,
        payload: Bytes::from_static(b"x"),
    })]
    #[case::reliable(EncapsulatedMessage {
        reliability: Reliability::Reliable,
        message_index: Some(0xabcdef),
        sequence_index: None,
        ordering: None,
        split: None,
        payload: Bytes::from_static(&[0, 1, 2, 3]),
    })]
    #[case::reliable_ordered(EncapsulatedMessage {
        reliability: Reliability::ReliableOrdered,
        message_index: Some(5),
        sequence_index: None,
        ordering: Some((9, 31)),
        split: None,
        payload: Bytes::from_static(b"ordered"),
    })]
    #[case::reliable_sequenced(EncapsulatedMessage {
        reliability: Reliability::ReliableSequenced,
        message_index: Some(1),
        sequence_index: Some(2),
        ordering: Some((3, 0)),
        split: None,
        payload: Bytes::new(),
    })]
    #[case::reliable_ordered_split(EncapsulatedMessage {
        reliability: Reliability::ReliableOrderedWithAckReceipt,
        message_index: Some(100),
        sequence_index: None,
        ordering: Some((50, 7)),
        split: Some(SplitHeader { split_count: 44, split_id: 9, split_index: 43 }),
        payload: Bytes::from_static(b"fragment"),
    })]
    #[case::unreliable_ack(EncapsulatedMessage {
        reliability: Reliability::UnreliableWithAckReceipt,
        message_index: None,
        sequence_index: None,
        ordering: None,
        split: None,
        payload: Bytes::from_static(b"receipt me"),
    })]
    fn test_roundtrip(#[case] message: EncapsulatedMessage) {
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn test_wire_bytes_reliable() {
        let message = EncapsulatedMessage {
            reliability: Reliability::Reliable,
            message_index: Some(7),
            sequence_index: None,
            ordering: None,
            split: None,
            payload: Bytes::from_static(&[0xaa, 0xbb]),
        };
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        // flags 2<<5, 16 bits of payload, message index 7 as u24 LE, payload
        assert_eq!(buf.as_ref(), &[0x40, 0x00, 0x10, 0x07, 0x00, 0x00, 0xaa, 0xbb]);
    }

    #[test]
    fn test_wire_bytes_split_flag() {
        let message = EncapsulatedMessage {
            reliability: Reliability::Unreliable,
            message_index: None,
            sequence_index: None,
            ordering: None,
            split: Some(SplitHeader { split_count: 2, split_id: 1, split_index: 0 }),
            payload: Bytes::from_static(&[0x11]),
        };
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[0x10, 0x00, 0x08, 0, 0, 0, 2, 0, 1, 0, 0, 0, 0, 0x11]
        );
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_ordered_header(vec![0xff, 0x00, 0x08, 1])]
    #[case::truncated_index(vec![0x40, 0x00, 0x08, 1, 2])]
    #[case::truncated_payload(vec![0x00, 0x00, 0x20, 1, 2])]
    fn test_malformed(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert!(EncapsulatedMessage::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::unreliable(Reliability::Unreliable, false, 3)]
    #[case::unreliable_sequenced(Reliability::UnreliableSequenced, false, 10)]
    #[case::reliable(Reliability::Reliable, false, 6)]
    #[case::reliable_ordered(Reliability::ReliableOrdered, false, 10)]
    #[case::reliable_sequenced(Reliability::ReliableSequenced, false, 13)]
    #[case::reliable_ordered_split(Reliability::ReliableOrdered, true, 20)]
    #[case::unreliable_split(Reliability::Unreliable, true, 13)]
    fn test_header_len(
        #[case] reliability: Reliability,
        #[case] split: bool,
        #[case] expected: usize,
    ) {
        assert_eq!(EncapsulatedMessage::header_len(reliability, split), expected);
    }
}
