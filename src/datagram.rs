//! The outer envelope of every connected-mode UDP payload. The first byte carries flag bits:
//!  the high bit marks the payload as a connected datagram at all (offline messages keep it
//!  clear), and the ACK / NACK bits turn the datagram into pure acknowledgement feedback.
//!
//! ACK and NACK datagrams carry *records*: either a single 24-bit sequence number or an
//!  inclusive range. Contiguous runs are condensed into ranges on encode and expanded back
//!  into individual ids on decode.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::codec::{put_u24_le, try_get_u24_le};
use crate::encapsulated::EncapsulatedMessage;
use crate::error::RakNetError;

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct DatagramFlags: u8 {
        const VALID = 0x80;
        const ACK   = 0x40;
        const NACK  = 0x20;
    }
}

/// flag byte + 24-bit sequence number
pub const DATAGRAM_HEADER_LEN: usize = 1 + 3;

const RECORD_RANGE: u8 = 0x00;
const RECORD_SINGLE: u8 = 0x01;

/// Upper bound on the span of a decoded range record; honest senders never acknowledge more
///  than a receive window at once, and expanding an arbitrary 24-bit span must not be possible
const MAX_RECORD_SPAN: u32 = 8192;

/// A single acknowledgement record: one sequence number or an inclusive range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRecord {
    Single(u32),
    Range(u32, u32),
}

impl AckRecord {
    /// Sort the ids and merge contiguous runs into ranges. Duplicates are dropped.
    pub fn condense(mut sequence_numbers: Vec<u32>) -> Vec<AckRecord> {
        sequence_numbers.sort_unstable();
        sequence_numbers.dedup();

        let mut records = Vec::new();
        let mut iter = sequence_numbers.into_iter();
        let Some(mut start) = iter.next() else {
            return records;
        };
        let mut end = start;
        for id in iter {
            if id == end + 1 {
                end = id;
            } else {
                records.push(AckRecord::from_bounds(start, end));
                start = id;
                end = id;
            }
        }
        records.push(AckRecord::from_bounds(start, end));
        records
    }

    /// Expand ranges back into the individual sequence numbers
    pub fn expand(records: &[AckRecord]) -> Vec<u32> {
        let mut out = Vec::new();
        for record in records {
            match *record {
                AckRecord::Single(id) => out.push(id),
                AckRecord::Range(start, end) => out.extend(start..=end),
            }
        }
        out
    }

    fn from_bounds(start: u32, end: u32) -> AckRecord {
        if start == end {
            AckRecord::Single(start)
        } else {
            AckRecord::Range(start, end)
        }
    }

    pub fn wire_len(&self) -> usize {
        match self {
            AckRecord::Single(_) => 1 + 3,
            AckRecord::Range(_, _) => 1 + 3 + 3,
        }
    }
}

fn ser_records(records: &[AckRecord], buf: &mut impl BufMut) {
    debug_assert!(records.len() <= u16::MAX as usize);
    buf.put_u16(records.len() as u16);
    for record in records {
        match *record {
            AckRecord::Single(id) => {
                buf.put_u8(RECORD_SINGLE);
                put_u24_le(buf, id);
            }
            AckRecord::Range(start, end) => {
                buf.put_u8(RECORD_RANGE);
                put_u24_le(buf, start);
                put_u24_le(buf, end);
            }
        }
    }
}

fn deser_records(buf: &mut impl Buf) -> Result<Vec<AckRecord>, RakNetError> {
    let count = buf.try_get_u16()? as usize;
    let mut records = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let record = match buf.try_get_u8()? {
            RECORD_SINGLE => AckRecord::Single(try_get_u24_le(buf)?),
            RECORD_RANGE => {
                let start = try_get_u24_le(buf)?;
                let end = try_get_u24_le(buf)?;
                if end < start {
                    return Err(RakNetError::MalformedField("inverted ack range"));
                }
                if end - start > MAX_RECORD_SPAN {
                    return Err(RakNetError::MalformedField("oversized ack range"));
                }
                AckRecord::Range(start, end)
            }
            _ => return Err(RakNetError::MalformedField("ack record tag")),
        };
        records.push(record);
    }
    Ok(records)
}

/// A decoded connected-mode datagram
#[derive(Debug, PartialEq, Eq)]
pub enum Datagram {
    Data {
        sequence_number: u32,
        messages: Vec<EncapsulatedMessage>,
    },
    Ack {
        records: Vec<AckRecord>,
    },
    Nack {
        records: Vec<AckRecord>,
    },
}

impl Datagram {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            Datagram::Data {
                sequence_number,
                messages,
            } => {
                buf.put_u8(DatagramFlags::VALID.bits());
                put_u24_le(buf, *sequence_number);
                for message in messages {
                    message.ser(buf);
                }
            }
            Datagram::Ack { records } => {
                buf.put_u8((DatagramFlags::VALID | DatagramFlags::ACK).bits());
                ser_records(records, buf);
            }
            Datagram::Nack { records } => {
                buf.put_u8((DatagramFlags::VALID | DatagramFlags::NACK).bits());
                ser_records(records, buf);
            }
        }
    }

    /// Decode a connected datagram. The caller has already established that the high bit of
    ///  the first byte is set, distinguishing this from an offline message.
    pub fn deser(buf: &mut impl Buf) -> Result<Datagram, RakNetError> {
        let flags = DatagramFlags::from_bits_truncate(buf.try_get_u8()?);
        if !flags.contains(DatagramFlags::VALID) {
            return Err(RakNetError::MalformedField("datagram flags"));
        }

        if flags.contains(DatagramFlags::ACK) {
            return Ok(Datagram::Ack {
                records: deser_records(buf)?,
            });
        }
        if flags.contains(DatagramFlags::NACK) {
            return Ok(Datagram::Nack {
                records: deser_records(buf)?,
            });
        }

        let sequence_number = try_get_u24_le(buf)?;
        let mut messages = Vec::new();
        while buf.has_remaining() {
            messages.push(EncapsulatedMessage::deser(buf)?);
        }
        Ok(Datagram::Data {
            sequence_number,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::Reliability;
    use bytes::{Bytes, BytesMut};
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![5], vec![AckRecord::Single(5)])]
    #[case::run(vec![1, 2, 3], vec![AckRecord::Range(1, 3)])]
    #[case::unsorted(vec![3, 1, 2], vec![AckRecord::Range(1, 3)])]
    #[case::duplicates(vec![2, 2, 3], vec![AckRecord::Range(2, 3)])]
    #[case::mixed(
        vec![9, 1, 2, 3, 7, 5],
        vec![AckRecord::Range(1, 3), AckRecord::Single(5), AckRecord::Single(7), AckRecord::Single(9)],
    )]
    #[case::two_runs(
        vec![0, 1, 10, 11, 12],
        vec![AckRecord::Range(0, 1), AckRecord::Range(10, 12)],
    )]
    fn test_condense(#[case] ids: Vec<u32>, #[case] expected: Vec<AckRecord>) {
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();

        let records = AckRecord::condense(ids);
        assert_eq!(records, expected);
        // condense then expand yields the original set
        assert_eq!(AckRecord::expand(&records), sorted);
    }

    #[test]
    fn test_ack_wire_bytes() {
        let datagram = Datagram::Ack {
            records: vec![AckRecord::Range(1, 3), AckRecord::Single(7)],
        };
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        assert_eq!(
            buf.as_ref(),
            &[0xc0, 0, 2, 0x00, 1, 0, 0, 3, 0, 0, 0x01, 7, 0, 0]
        );

        let mut b: &[u8] = &buf;
        assert_eq!(Datagram::deser(&mut b).unwrap(), datagram);
        assert!(b.is_empty());
    }

    #[test]
    fn test_nack_flag_byte() {
        let datagram = Datagram::Nack {
            records: vec![AckRecord::Single(0)],
        };
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        assert_eq!(buf[0], 0xa0);

        let mut b: &[u8] = &buf;
        assert_eq!(Datagram::deser(&mut b).unwrap(), datagram);
    }

    #[test]
    fn test_data_roundtrip() {
        let datagram = Datagram::Data {
            sequence_number: 0x123456,
            messages: vec![
                EncapsulatedMessage {
                    reliability: Reliability::Reliable,
                    message_index: Some(4),
                    sequence_index: None,
                    ordering: None,
                    split: None,
                    payload: Bytes::from_static(b"first"),
                },
                EncapsulatedMessage {
                    reliability: Reliability::Unreliable,
                    message_index: None,
                    sequence_index: None,
                    ordering: None,
                    split: None,
                    payload: Bytes::from_static(b"second"),
                },
            ],
        };

        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        assert_eq!(buf[0], 0x80);
        assert_eq!(&buf[1..4], &[0x56, 0x34, 0x12]);

        let mut b: &[u8] = &buf;
        assert_eq!(Datagram::deser(&mut b).unwrap(), datagram);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::no_valid_bit(vec![0x40, 0, 0])]
    #[case::truncated_sequence(vec![0x80, 1, 2])]
    #[case::bad_record_tag(vec![0xc0, 0, 1, 0x02, 1, 0, 0])]
    #[case::inverted_range(vec![0xc0, 0, 1, 0x00, 5, 0, 0, 1, 0, 0])]
    #[case::oversized_range(vec![0xc0, 0, 1, 0x00, 0, 0, 0, 0xff, 0xff, 0xff])]
    #[case::garbage_message(vec![0x80, 0, 0, 0, 0xff, 0xff])]
    fn test_malformed(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert!(Datagram::deser(&mut b).is_err());
    }
}
