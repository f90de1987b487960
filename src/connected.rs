//! System messages exchanged inside connected datagrams: the login handshake that follows the
//!  offline rounds, keep-alive ping/pong and the disconnection notification. They travel as
//!  encapsulated payloads like user messages; the first payload byte tells them apart.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{put_address, try_get_address};
use crate::error::RakNetError;

pub const CONNECTED_PING: u8 = 0x00;
pub const CONNECTED_PONG: u8 = 0x03;
pub const CONNECTION_REQUEST: u8 = 0x09;
pub const CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
pub const NEW_INCOMING_CONNECTION: u8 = 0x13;
pub const DISCONNECTION_NOTIFICATION: u8 = 0x15;

/// Whether a delivered payload is protocol-internal rather than application data
pub fn is_system_message(payload: &[u8]) -> bool {
    matches!(
        payload.first().copied(),
        Some(
            CONNECTED_PING
                | CONNECTED_PONG
                | CONNECTION_REQUEST
                | CONNECTION_REQUEST_ACCEPTED
                | NEW_INCOMING_CONNECTION
                | DISCONNECTION_NOTIFICATION
        )
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectedMessage {
    Ping {
        timestamp: u64,
    },
    Pong {
        ping_timestamp: u64,
        pong_timestamp: u64,
    },
    ConnectionRequest {
        client_guid: u64,
        timestamp: u64,
    },
    ConnectionRequestAccepted {
        client_address: SocketAddr,
        request_timestamp: u64,
        timestamp: u64,
    },
    NewIncomingConnection {
        server_address: SocketAddr,
        request_timestamp: u64,
        timestamp: u64,
    },
    DisconnectionNotification,
}

impl ConnectedMessage {
    pub fn message_id(&self) -> u8 {
        match self {
            ConnectedMessage::Ping { .. } => CONNECTED_PING,
            ConnectedMessage::Pong { .. } => CONNECTED_PONG,
            ConnectedMessage::ConnectionRequest { .. } => CONNECTION_REQUEST,
            ConnectedMessage::ConnectionRequestAccepted { .. } => CONNECTION_REQUEST_ACCEPTED,
            ConnectedMessage::NewIncomingConnection { .. } => NEW_INCOMING_CONNECTION,
            ConnectedMessage::DisconnectionNotification => DISCONNECTION_NOTIFICATION,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_id());
        match self {
            ConnectedMessage::Ping { timestamp } => {
                buf.put_u64(*timestamp);
            }
            ConnectedMessage::Pong {
                ping_timestamp,
                pong_timestamp,
            } => {
                buf.put_u64(*ping_timestamp);
                buf.put_u64(*pong_timestamp);
            }
            ConnectedMessage::ConnectionRequest {
                client_guid,
                timestamp,
            } => {
                buf.put_u64(*client_guid);
                buf.put_u64(*timestamp);
            }
            ConnectedMessage::ConnectionRequestAccepted {
                client_address,
                request_timestamp,
                timestamp,
            } => {
                put_address(buf, client_address);
                buf.put_u64(*request_timestamp);
                buf.put_u64(*timestamp);
            }
            ConnectedMessage::NewIncomingConnection {
                server_address,
                request_timestamp,
                timestamp,
            } => {
                put_address(buf, server_address);
                buf.put_u64(*request_timestamp);
                buf.put_u64(*timestamp);
            }
            ConnectedMessage::DisconnectionNotification => {}
        }
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> Result<ConnectedMessage, RakNetError> {
        match buf.try_get_u8()? {
            CONNECTED_PING => Ok(ConnectedMessage::Ping {
                timestamp: buf.try_get_u64()?,
            }),
            CONNECTED_PONG => Ok(ConnectedMessage::Pong {
                ping_timestamp: buf.try_get_u64()?,
                pong_timestamp: buf.try_get_u64()?,
            }),
            CONNECTION_REQUEST => Ok(ConnectedMessage::ConnectionRequest {
                client_guid: buf.try_get_u64()?,
                timestamp: buf.try_get_u64()?,
            }),
            CONNECTION_REQUEST_ACCEPTED => Ok(ConnectedMessage::ConnectionRequestAccepted {
                client_address: try_get_address(buf)?,
                request_timestamp: buf.try_get_u64()?,
                timestamp: buf.try_get_u64()?,
            }),
            NEW_INCOMING_CONNECTION => Ok(ConnectedMessage::NewIncomingConnection {
                server_address: try_get_address(buf)?,
                request_timestamp: buf.try_get_u64()?,
                timestamp: buf.try_get_u64()?,
            }),
            DISCONNECTION_NOTIFICATION => Ok(ConnectedMessage::DisconnectionNotification),
            _ => Err(RakNetError::ProtocolViolation("unknown system message id")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case::ping(ConnectedMessage::Ping { timestamp: 17 })]
    #[case::pong(ConnectedMessage::Pong { ping_timestamp: 17, pong_timestamp: 18 })]
    #[case::request(ConnectedMessage::ConnectionRequest { client_guid: 0xfeed, timestamp: 99 })]
    #[case::accepted(ConnectedMessage::ConnectionRequestAccepted {
        client_address: SocketAddr::from_str("192.168.1.17:60000").unwrap(),
        request_timestamp: 99,
        timestamp: 100,
    })]
    #[case::new_incoming(ConnectedMessage::NewIncomingConnection {
        server_address: SocketAddr::from_str("127.0.0.1:19132").unwrap(),
        request_timestamp: 100,
        timestamp: 101,
    })]
    #[case::disconnect(ConnectedMessage::DisconnectionNotification)]
    fn test_roundtrip(#[case] message: ConnectedMessage) {
        let payload = message.to_payload();
        assert!(is_system_message(&payload));

        let mut b: &[u8] = &payload;
        let deser = ConnectedMessage::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, message);
    }

    #[rstest]
    #[case::ping(ConnectedMessage::Ping { timestamp: 0 }, 0x00)]
    #[case::pong(ConnectedMessage::Pong { ping_timestamp: 0, pong_timestamp: 0 }, 0x03)]
    #[case::request(ConnectedMessage::ConnectionRequest { client_guid: 0, timestamp: 0 }, 0x09)]
    #[case::accepted(ConnectedMessage::ConnectionRequestAccepted {
        client_address: SocketAddr::from_str("0.0.0.0:0").unwrap(),
        request_timestamp: 0,
        timestamp: 0,
    }, 0x10)]
    #[case::new_incoming(ConnectedMessage::NewIncomingConnection {
        server_address: SocketAddr::from_str("0.0.0.0:0").unwrap(),
        request_timestamp: 0,
        timestamp: 0,
    }, 0x13)]
    #[case::disconnect(ConnectedMessage::DisconnectionNotification, 0x15)]
    fn test_message_ids(#[case] message: ConnectedMessage, #[case] expected_id: u8) {
        assert_eq!(message.message_id(), expected_id);
        assert_eq!(message.to_payload()[0], expected_id);
    }

    #[rstest]
    #[case::user_payload(&[0x86, 1, 2, 3], false)]
    #[case::empty(&[], false)]
    #[case::ping(&[0x00, 0, 0, 0, 0, 0, 0, 0, 1], true)]
    #[case::disconnect(&[0x15], true)]
    fn test_is_system_message(#[case] payload: &[u8], #[case] expected: bool) {
        assert_eq!(is_system_message(payload), expected);
    }

    #[test]
    fn test_malformed() {
        let mut b: &[u8] = &[CONNECTION_REQUEST, 1, 2];
        assert!(ConnectedMessage::deser(&mut b).is_err());

        let mut b: &[u8] = &[0x42];
        assert!(ConnectedMessage::deser(&mut b).is_err());
    }
}
