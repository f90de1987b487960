//! Wire primitives shared by all message codecs: 24-bit little-endian "triads",
//!  length-prefixed strings, bit-inverted address records and the offline magic cookie.
//!
//! Everything here is pure: `put_*` appends to a `BufMut`, `try_get_*` consumes from a `Buf`
//!  and fails with `MalformedField` on truncation or a bad discriminator.

use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut};

use crate::error::RakNetError;

/// The cookie that marks a datagram as an offline (connectionless) protocol message.
pub const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56,
    0x78,
];

const ADDRESS_FAMILY_V4: u8 = 4;
const ADDRESS_FAMILY_V6: u8 = 6;
const ADDRESS_V6_PAD: usize = 10;

pub fn put_u24_le(buf: &mut impl BufMut, value: u32) {
    debug_assert!(value <= 0x00ff_ffff);
    buf.put_uint_le(value as u64 & 0x00ff_ffff, 3);
}

pub fn try_get_u24_le(buf: &mut impl Buf) -> Result<u32, RakNetError> {
    if buf.remaining() < 3 {
        return Err(RakNetError::MalformedField("u24"));
    }
    Ok(buf.get_uint_le(3) as u32)
}

/// UTF-8 string with an unsigned 16-bit big-endian length prefix
pub fn put_string(buf: &mut impl BufMut, value: &str) {
    debug_assert!(value.len() <= u16::MAX as usize);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> Result<String, RakNetError> {
    let len = buf.try_get_u16()? as usize;
    if buf.remaining() < len {
        return Err(RakNetError::MalformedField("string body"));
    }
    String::from_utf8(buf.copy_to_bytes(len).to_vec())
        .map_err(|_| RakNetError::MalformedField("string utf-8"))
}

/// UTF-8 string with an unsigned 16-bit little-endian length prefix
pub fn put_string_le(buf: &mut impl BufMut, value: &str) {
    debug_assert!(value.len() <= u16::MAX as usize);
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

pub fn try_get_string_le(buf: &mut impl Buf) -> Result<String, RakNetError> {
    let len = buf.try_get_u16_le()? as usize;
    if buf.remaining() < len {
        return Err(RakNetError::MalformedField("string body"));
    }
    String::from_utf8(buf.copy_to_bytes(len).to_vec())
        .map_err(|_| RakNetError::MalformedField("string utf-8"))
}

/// Address record: 1-byte family tag, address bytes with every byte bitwise inverted,
///  10 pad bytes for IPv6, then the port as u16 big-endian.
pub fn put_address(buf: &mut impl BufMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(ADDRESS_FAMILY_V4);
            for b in v4.ip().octets() {
                buf.put_u8(!b);
            }
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(ADDRESS_FAMILY_V6);
            for b in v6.ip().octets() {
                buf.put_u8(!b);
            }
            buf.put_bytes(0, ADDRESS_V6_PAD);
        }
    }
    buf.put_u16(addr.port());
}

pub fn try_get_address(buf: &mut impl Buf) -> Result<SocketAddr, RakNetError> {
    let family = buf.try_get_u8()?;
    let ip = match family {
        ADDRESS_FAMILY_V4 => {
            if buf.remaining() < 4 {
                return Err(RakNetError::MalformedField("ipv4 address"));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            octets.iter_mut().for_each(|b| *b = !*b);
            IpAddr::from(octets)
        }
        ADDRESS_FAMILY_V6 => {
            if buf.remaining() < 16 + ADDRESS_V6_PAD {
                return Err(RakNetError::MalformedField("ipv6 address"));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            octets.iter_mut().for_each(|b| *b = !*b);
            buf.advance(ADDRESS_V6_PAD);
            IpAddr::from(octets)
        }
        _ => return Err(RakNetError::MalformedField("address family")),
    };
    let port = buf.try_get_u16()?;
    Ok(match ip {
        IpAddr::V4(ip) => SocketAddr::V4(SocketAddrV4::new(ip, port)),
        IpAddr::V6(ip) => SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)),
    })
}

pub fn address_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 1 + 4 + 2,
        SocketAddr::V6(_) => 1 + 16 + ADDRESS_V6_PAD + 2,
    }
}

pub fn put_magic(buf: &mut impl BufMut) {
    buf.put_slice(&MAGIC);
}

pub fn try_get_magic(buf: &mut impl Buf) -> Result<(), RakNetError> {
    if buf.remaining() < MAGIC.len() {
        return Err(RakNetError::MalformedField("magic"));
    }
    let mut actual = [0u8; 16];
    buf.copy_to_slice(&mut actual);
    if actual != MAGIC {
        return Err(RakNetError::MalformedField("magic"));
    }
    Ok(())
}
