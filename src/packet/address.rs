// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Encoded address formats (RFC 4601 section 4.9.1)
//!
//! | Format | Layout |
//! |--------|--------|
//! | Encoded-Unicast | family, encoding, address |
//! | Encoded-Group | family, encoding, B/Z flags, mask length, group |
//! | Encoded-Source | family, encoding, S/W/R flags, mask length, source |

use bytes::{Buf, BufMut};
use std::net::Ipv4Addr;

use super::{ensure, PacketError};

/// IANA address family number for IPv4
pub const ADDRESS_FAMILY_IPV4: u8 = 1;
/// Native encoding for the address family
pub const ENCODING_NATIVE: u8 = 0;

pub const ENCODED_UNICAST_LEN: usize = 6;
pub const ENCODED_GROUP_LEN: usize = 8;
pub const ENCODED_SOURCE_LEN: usize = 8;

const GROUP_FLAG_BIDIR: u8 = 0x80;
const GROUP_FLAG_ADMIN_SCOPE: u8 = 0x01;

const SOURCE_FLAG_SPARSE: u8 = 0x04;
const SOURCE_FLAG_WILDCARD: u8 = 0x02;
const SOURCE_FLAG_RPT: u8 = 0x01;

fn get_family_and_encoding(buf: &mut &[u8]) -> Result<(), PacketError> {
    let family = buf.get_u8();
    if family != ADDRESS_FAMILY_IPV4 {
        return Err(PacketError::BadAddressFamily(family));
    }
    let encoding = buf.get_u8();
    if encoding != ENCODING_NATIVE {
        return Err(PacketError::BadEncoding(encoding));
    }
    Ok(())
}

fn get_ipv4(buf: &mut &[u8]) -> Ipv4Addr {
    Ipv4Addr::from(buf.get_u32())
}

/// Write an Encoded-Unicast address
pub fn put_unicast(buf: &mut impl BufMut, address: Ipv4Addr) {
    buf.put_u8(ADDRESS_FAMILY_IPV4);
    buf.put_u8(ENCODING_NATIVE);
    buf.put_u32(u32::from(address));
}

/// Read an Encoded-Unicast address
pub fn get_unicast(buf: &mut &[u8]) -> Result<Ipv4Addr, PacketError> {
    ensure(buf, ENCODED_UNICAST_LEN)?;
    get_family_and_encoding(buf)?;
    Ok(get_ipv4(buf))
}

/// Encoded-Group address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodedGroup {
    pub address: Ipv4Addr,
    pub mask_len: u8,
    /// Bidirectional PIM group range (B bit)
    pub bidir: bool,
    /// Administratively scoped zone (Z bit)
    pub admin_scope: bool,
}

impl EncodedGroup {
    /// A single group (/32) with no flags
    pub fn host(address: Ipv4Addr) -> Self {
        Self::new(address, 32)
    }

    pub fn new(address: Ipv4Addr, mask_len: u8) -> Self {
        Self {
            address,
            mask_len,
            bidir: false,
            admin_scope: false,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut flags = 0;
        if self.bidir {
            flags |= GROUP_FLAG_BIDIR;
        }
        if self.admin_scope {
            flags |= GROUP_FLAG_ADMIN_SCOPE;
        }
        buf.put_u8(ADDRESS_FAMILY_IPV4);
        buf.put_u8(ENCODING_NATIVE);
        buf.put_u8(flags);
        buf.put_u8(self.mask_len);
        buf.put_u32(u32::from(self.address));
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        ensure(buf, ENCODED_GROUP_LEN)?;
        get_family_and_encoding(buf)?;
        let flags = buf.get_u8();
        let mask_len = buf.get_u8();
        Ok(Self {
            address: get_ipv4(buf),
            mask_len,
            bidir: flags & GROUP_FLAG_BIDIR != 0,
            admin_scope: flags & GROUP_FLAG_ADMIN_SCOPE != 0,
        })
    }
}

/// Encoded-Source address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodedSource {
    pub address: Ipv4Addr,
    pub mask_len: u8,
    /// Always set for PIM-SM (S bit)
    pub sparse: bool,
    /// Join/Prune applies to the (*,G) or (*,*,RP) entry (W bit)
    pub wildcard: bool,
    /// Join/Prune travels toward the RP (R bit)
    pub rpt: bool,
}

impl EncodedSource {
    /// (S,G) source: S bit only
    pub fn source(address: Ipv4Addr) -> Self {
        Self {
            address,
            mask_len: 32,
            sparse: true,
            wildcard: false,
            rpt: false,
        }
    }

    /// (S,G,rpt) source: S and R bits
    pub fn source_rpt(address: Ipv4Addr) -> Self {
        Self {
            rpt: true,
            ..Self::source(address)
        }
    }

    /// (*,G) or (*,*,RP) entry: the address is the RP, S, W and R bits set
    pub fn wildcard_rp(rp: Ipv4Addr) -> Self {
        Self {
            address: rp,
            mask_len: 32,
            sparse: true,
            wildcard: true,
            rpt: true,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut flags = 0;
        if self.sparse {
            flags |= SOURCE_FLAG_SPARSE;
        }
        if self.wildcard {
            flags |= SOURCE_FLAG_WILDCARD;
        }
        if self.rpt {
            flags |= SOURCE_FLAG_RPT;
        }
        buf.put_u8(ADDRESS_FAMILY_IPV4);
        buf.put_u8(ENCODING_NATIVE);
        buf.put_u8(flags);
        buf.put_u8(self.mask_len);
        buf.put_u32(u32::from(self.address));
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        ensure(buf, ENCODED_SOURCE_LEN)?;
        get_family_and_encoding(buf)?;
        let flags = buf.get_u8();
        let mask_len = buf.get_u8();
        Ok(Self {
            address: get_ipv4(buf),
            mask_len,
            sparse: flags & SOURCE_FLAG_SPARSE != 0,
            wildcard: flags & SOURCE_FLAG_WILDCARD != 0,
            rpt: flags & SOURCE_FLAG_RPT != 0,
        })
    }
}
