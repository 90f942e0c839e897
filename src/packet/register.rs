// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Register (type 1) and Register-Stop (type 2)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use super::address::{get_unicast, put_unicast, EncodedGroup};
use super::{ensure, DataPacket, PacketBuilder, PacketError, PIM_REGISTER, PIM_REGISTER_STOP};

/// The Register checksum covers the PIM header and the flags word only
pub(super) const REGISTER_CHECKSUM_LEN: usize = 8;

const BORDER_BIT: u32 = 0x8000_0000;
const NULL_REGISTER_BIT: u32 = 0x4000_0000;

/// Register message carrying an encapsulated IPv4 datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub border: bool,
    pub null_register: bool,
    /// The encapsulated datagram, IP header included
    pub packet: Bytes,
}

impl Register {
    /// Encapsulate a data packet
    pub fn encapsulate(packet: &DataPacket) -> Self {
        Self {
            border: false,
            null_register: false,
            packet: packet.to_ipv4_bytes(),
        }
    }

    /// Null-Register probe: an IP header for (S,G) with no payload
    pub fn null(source: Ipv4Addr, group: Ipv4Addr) -> Self {
        Self {
            border: false,
            null_register: true,
            packet: DataPacket::new(source, group, Bytes::new()).to_ipv4_bytes(),
        }
    }

    /// Decapsulate the inner datagram
    pub fn inner(&self) -> Result<DataPacket, PacketError> {
        DataPacket::from_ipv4_bytes(&self.packet)
    }

    pub(super) fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        ensure(buf, 4)?;
        let flags = buf.get_u32();
        let packet = Bytes::copy_from_slice(&buf[..]);
        *buf = &[];
        Ok(Self {
            border: flags & BORDER_BIT != 0,
            null_register: flags & NULL_REGISTER_BIT != 0,
            packet,
        })
    }
}

impl PacketBuilder for Register {
    fn msg_type(&self) -> u8 {
        PIM_REGISTER
    }

    fn write_body(&self, buf: &mut BytesMut) {
        let mut flags = 0;
        if self.border {
            flags |= BORDER_BIT;
        }
        if self.null_register {
            flags |= NULL_REGISTER_BIT;
        }
        buf.put_u32(flags);
        buf.put_slice(&self.packet);
    }

    fn checksum_span(&self, _total_len: usize) -> usize {
        REGISTER_CHECKSUM_LEN
    }
}

/// Register-Stop message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterStop {
    pub group: Ipv4Addr,
    pub source: Ipv4Addr,
}

impl RegisterStop {
    pub(super) fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        let group = EncodedGroup::decode(buf)?;
        let source = get_unicast(buf)?;
        Ok(Self {
            group: group.address,
            source,
        })
    }
}

impl PacketBuilder for RegisterStop {
    fn msg_type(&self) -> u8 {
        PIM_REGISTER_STOP
    }

    fn write_body(&self, buf: &mut BytesMut) {
        EncodedGroup::host(self.group).encode(buf);
        put_unicast(buf, self.source);
    }
}
