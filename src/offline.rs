//! The offline (connectionless) protocol messages: discovery pings and the two-round
//!  open-connection handshake, plus the rejection replies. An offline message is a UDP
//!  payload whose first byte has the high bit clear; that byte is the message identifier.
//!
//! The identifiers and field layouts are fixed by existing deployments; the test fixtures
//!  below pin them byte for byte.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes};

use crate::codec::{
    put_address, put_magic, try_get_address, try_get_magic,
};
use crate::error::RakNetError;

pub const UNCONNECTED_PING: u8 = 0x01;
pub const UNCONNECTED_PING_OPEN_CONNECTIONS: u8 = 0x02;
pub const OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
pub const OPEN_CONNECTION_REPLY_1: u8 = 0x06;
pub const OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
pub const OPEN_CONNECTION_REPLY_2: u8 = 0x08;
pub const ALREADY_CONNECTED: u8 = 0x12;
pub const NO_FREE_INCOMING_CONNECTIONS: u8 = 0x14;
pub const CONNECTION_BANNED: u8 = 0x17;
pub const INCOMPATIBLE_PROTOCOL_VERSION: u8 = 0x19;
pub const UNCONNECTED_PONG: u8 = 0x1c;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineMessage {
    UnconnectedPing {
        /// only answered when the server has room for another connection
        open_connections_only: bool,
        timestamp: u64,
        client_guid: u64,
    },
    UnconnectedPong {
        /// echo of the ping's timestamp
        timestamp: u64,
        server_guid: u64,
        identifier: Bytes,
    },
    /// First handshake round. The message is padded up to the transfer unit the client wants
    ///  to probe; a request that arrives proves the path carries datagrams of that size.
    OpenConnectionRequest1 {
        protocol_version: u8,
        /// derived from the padded on-wire size when decoding
        mtu: u16,
    },
    OpenConnectionReply1 {
        server_guid: u64,
        mtu: u16,
    },
    OpenConnectionRequest2 {
        server_address: SocketAddr,
        mtu: u16,
        client_guid: u64,
    },
    OpenConnectionReply2 {
        server_guid: u64,
        client_address: SocketAddr,
        mtu: u16,
    },
    IncompatibleProtocolVersion {
        protocol_version: u8,
        server_guid: u64,
    },
    AlreadyConnected {
        server_guid: u64,
    },
    NoFreeIncomingConnections {
        server_guid: u64,
    },
    ConnectionBanned {
        server_guid: u64,
    },
}

impl OfflineMessage {
    pub fn message_id(&self) -> u8 {
        match self {
            OfflineMessage::UnconnectedPing {
                open_connections_only: false,
                ..
            } => UNCONNECTED_PING,
            OfflineMessage::UnconnectedPing {
                open_connections_only: true,
                ..
            } => UNCONNECTED_PING_OPEN_CONNECTIONS,
            OfflineMessage::UnconnectedPong { .. } => UNCONNECTED_PONG,
            OfflineMessage::OpenConnectionRequest1 { .. } => OPEN_CONNECTION_REQUEST_1,
            OfflineMessage::OpenConnectionReply1 { .. } => OPEN_CONNECTION_REPLY_1,
            OfflineMessage::OpenConnectionRequest2 { .. } => OPEN_CONNECTION_REQUEST_2,
            OfflineMessage::OpenConnectionReply2 { .. } => OPEN_CONNECTION_REPLY_2,
            OfflineMessage::IncompatibleProtocolVersion { .. } => INCOMPATIBLE_PROTOCOL_VERSION,
            OfflineMessage::AlreadyConnected { .. } => ALREADY_CONNECTED,
            OfflineMessage::NoFreeIncomingConnections { .. } => NO_FREE_INCOMING_CONNECTIONS,
            OfflineMessage::ConnectionBanned { .. } => CONNECTION_BANNED,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_id());
        match self {
            OfflineMessage::UnconnectedPing {
                timestamp,
                client_guid,
                ..
            } => {
                buf.put_u64(*timestamp);
                put_magic(buf);
                buf.put_u64(*client_guid);
            }
            OfflineMessage::UnconnectedPong {
                timestamp,
                server_guid,
                identifier,
            } => {
                buf.put_u64(*timestamp);
                buf.put_u64(*server_guid);
                put_magic(buf);
                debug_assert!(identifier.len() <= u16::MAX as usize);
                buf.put_u16(identifier.len() as u16);
                buf.put_slice(identifier);
            }
            OfflineMessage::OpenConnectionRequest1 {
                protocol_version,
                mtu,
            } => {
                put_magic(buf);
                buf.put_u8(*protocol_version);
                // pad so the whole UDP payload probes the requested transfer unit
                let written = 1 + crate::codec::MAGIC.len() + 1;
                buf.put_bytes(0, (*mtu as usize).saturating_sub(written));
            }
            OfflineMessage::OpenConnectionReply1 { server_guid, mtu } => {
                put_magic(buf);
                buf.put_u64(*server_guid);
                buf.put_u8(0); // no connection security
                buf.put_u16(*mtu);
            }
            OfflineMessage::OpenConnectionRequest2 {
                server_address,
                mtu,
                client_guid,
            } => {
                put_magic(buf);
                put_address(buf, server_address);
                buf.put_u16(*mtu);
                buf.put_u64(*client_guid);
            }
            OfflineMessage::OpenConnectionReply2 {
                server_guid,
                client_address,
                mtu,
            } => {
                put_magic(buf);
                buf.put_u64(*server_guid);
                put_address(buf, client_address);
                buf.put_u16(*mtu);
                buf.put_u8(0); // no encryption
            }
            OfflineMessage::IncompatibleProtocolVersion {
                protocol_version,
                server_guid,
            } => {
                buf.put_u8(*protocol_version);
                put_magic(buf);
                buf.put_u64(*server_guid);
            }
            OfflineMessage::AlreadyConnected { server_guid }
            | OfflineMessage::NoFreeIncomingConnections { server_guid }
            | OfflineMessage::ConnectionBanned { server_guid } => {
                put_magic(buf);
                buf.put_u64(*server_guid);
            }
        }
    }

    /// Decode an offline message from a full UDP payload (including the id byte).
    pub fn deser(buf: &mut impl Buf) -> Result<OfflineMessage, RakNetError> {
        let total_len = buf.remaining();
        let id = buf.try_get_u8()?;
        match id {
            UNCONNECTED_PING | UNCONNECTED_PING_OPEN_CONNECTIONS => {
                let timestamp = buf.try_get_u64()?;
                try_get_magic(buf)?;
                let client_guid = buf.try_get_u64()?;
                Ok(OfflineMessage::UnconnectedPing {
                    open_connections_only: id == UNCONNECTED_PING_OPEN_CONNECTIONS,
                    timestamp,
                    client_guid,
                })
            }
            UNCONNECTED_PONG => {
                let timestamp = buf.try_get_u64()?;
                let server_guid = buf.try_get_u64()?;
                try_get_magic(buf)?;
                let len = buf.try_get_u16()? as usize;
                if buf.remaining() < len {
                    return Err(RakNetError::MalformedField("pong identifier"));
                }
                let identifier = buf.copy_to_bytes(len);
                Ok(OfflineMessage::UnconnectedPong {
                    timestamp,
                    server_guid,
                    identifier,
                })
            }
            OPEN_CONNECTION_REQUEST_1 => {
                try_get_magic(buf)?;
                let protocol_version = buf.try_get_u8()?;
                // the padding is the MTU probe - its only information is the payload size
                buf.advance(buf.remaining());
                let mtu = total_len.min(u16::MAX as usize) as u16;
                Ok(OfflineMessage::OpenConnectionRequest1 {
                    protocol_version,
                    mtu,
                })
            }
            OPEN_CONNECTION_REPLY_1 => {
                try_get_magic(buf)?;
                let server_guid = buf.try_get_u64()?;
                let _security = buf.try_get_u8()?;
                let mtu = buf.try_get_u16()?;
                Ok(OfflineMessage::OpenConnectionReply1 { server_guid, mtu })
            }
            OPEN_CONNECTION_REQUEST_2 => {
                try_get_magic(buf)?;
                let server_address = try_get_address(buf)?;
                let mtu = buf.try_get_u16()?;
                let client_guid = buf.try_get_u64()?;
                Ok(OfflineMessage::OpenConnectionRequest2 {
                    server_address,
                    mtu,
                    client_guid,
                })
            }
            OPEN_CONNECTION_REPLY_2 => {
                try_get_magic(buf)?;
                let server_guid = buf.try_get_u64()?;
                let client_address = try_get_address(buf)?;
                let mtu = buf.try_get_u16()?;
                let _encryption = buf.try_get_u8()?;
                Ok(OfflineMessage::OpenConnectionReply2 {
                    server_guid,
                    client_address,
                    mtu,
                })
            }
            INCOMPATIBLE_PROTOCOL_VERSION => {
                let protocol_version = buf.try_get_u8()?;
                try_get_magic(buf)?;
                let server_guid = buf.try_get_u64()?;
                Ok(OfflineMessage::IncompatibleProtocolVersion {
                    protocol_version,
                    server_guid,
                })
            }
            ALREADY_CONNECTED => {
                try_get_magic(buf)?;
                let server_guid = buf.try_get_u64()?;
                Ok(OfflineMessage::AlreadyConnected { server_guid })
            }
            NO_FREE_INCOMING_CONNECTIONS => {
                try_get_magic(buf)?;
                let server_guid = buf.try_get_u64()?;
                Ok(OfflineMessage::NoFreeIncomingConnections { server_guid })
            }
            CONNECTION_BANNED => {
                try_get_magic(buf)?;
                let server_guid = buf.try_get_u64()?;
                Ok(OfflineMessage::ConnectionBanned { server_guid })
            }
            _ => Err(RakNetError::ProtocolViolation("unknown offline message id")),
        }
    }
}
