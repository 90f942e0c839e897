// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Multicast data packets as seen by the forwarding decision and carried
//! inside Register messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use super::{ensure, internet_checksum, PacketError};

const IPV4_HEADER_LEN: usize = 20;
pub const IPPROTO_UDP: u8 = 17;

/// An IPv4 multicast datagram reduced to the fields routing looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    pub ttl: u8,
    pub protocol: u8,
    pub payload: Bytes,
}

impl DataPacket {
    /// UDP datagram with TTL 64
    pub fn new(source: Ipv4Addr, group: Ipv4Addr, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            group,
            ttl: 64,
            protocol: IPPROTO_UDP,
            payload: payload.into(),
        }
    }

    /// Serialize as an IPv4 datagram with a 20-byte header
    pub fn to_ipv4_bytes(&self) -> Bytes {
        let total_len = IPV4_HEADER_LEN + self.payload.len();
        let mut buf = BytesMut::with_capacity(total_len);
        buf.put_u8(0x45); // Version 4, IHL 5
        buf.put_u8(0); // DSCP/ECN
        buf.put_u16(total_len as u16);
        buf.put_u16(0); // Identification
        buf.put_u16(0); // Flags/fragment offset
        buf.put_u8(self.ttl);
        buf.put_u8(self.protocol);
        buf.put_u16(0); // Checksum placeholder
        buf.put_u32(u32::from(self.source));
        buf.put_u32(u32::from(self.group));

        let checksum = internet_checksum(&buf[..IPV4_HEADER_LEN]);
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse an IPv4 datagram. The header checksum is not verified.
    pub fn from_ipv4_bytes(data: &[u8]) -> Result<Self, PacketError> {
        ensure(data, IPV4_HEADER_LEN)?;
        let mut buf = data;
        let ver_ihl = buf.get_u8();
        let version = ver_ihl >> 4;
        if version != 4 {
            return Err(PacketError::BadVersion(version));
        }
        let header_len = usize::from(ver_ihl & 0x0F) * 4;
        if header_len < IPV4_HEADER_LEN {
            return Err(PacketError::Truncated("IPv4 header"));
        }
        buf.advance(1);
        let total_len = usize::from(buf.get_u16());
        if total_len < header_len || data.len() < total_len {
            return Err(PacketError::Truncated("IPv4 datagram"));
        }
        buf.advance(4);
        let ttl = buf.get_u8();
        let protocol = buf.get_u8();
        buf.advance(2);
        let source = Ipv4Addr::from(buf.get_u32());
        let group = Ipv4Addr::from(buf.get_u32());

        Ok(Self {
            source,
            group,
            ttl,
            protocol,
            payload: Bytes::copy_from_slice(&data[header_len..total_len]),
        })
    }
}
