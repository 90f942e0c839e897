// SPDX-License-Identifier: Apache-2.0 OR MIT
//! PIM wire codecs (RFC 4601 section 4.9, RFC 5059 section 4)
//!
//! ## Message Types
//!
//! | Type | Value | Description |
//! |------|-------|-------------|
//! | Hello | 0 | Neighbor discovery |
//! | Register | 1 | First-hop to RP |
//! | Register-Stop | 2 | RP to first-hop |
//! | Join/Prune | 3 | Tree maintenance |
//! | Bootstrap | 4 | BSR election and RP-set flooding |
//! | Assert | 5 | Forwarder election |
//! | Candidate-RP-Advertisement | 8 | C-RP to BSR |
//!
//! Every message is encoded to a `Bytes` with its checksum filled in, and
//! decoded from a byte slice after checksum verification. Decoding never
//! panics: every read is preceded by a length check.

mod address;
mod assert;
mod bootstrap;
mod data;
mod hello;
mod join_prune;
mod register;

pub use address::{get_unicast, put_unicast, EncodedGroup, EncodedSource};
pub use assert::Assert;
pub use bootstrap::{
    Bootstrap, BootstrapGroup, BootstrapRp, CandidateRpAdvertisement, MAX_BSM_RPS, MAX_CRP_PREFIXES,
};
pub use data::DataPacket;
pub use hello::{Hello, HelloOption, HOLDTIME_INFINITE};
pub use join_prune::{JoinPrune, JoinPruneGroup};
pub use register::{Register, RegisterStop};

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;
use thiserror::Error;

pub const PIM_VERSION: u8 = 2;
pub const PIM_HEADER_LEN: usize = 4;

// PIM message types
pub const PIM_HELLO: u8 = 0;
pub const PIM_REGISTER: u8 = 1;
pub const PIM_REGISTER_STOP: u8 = 2;
pub const PIM_JOIN_PRUNE: u8 = 3;
pub const PIM_BOOTSTRAP: u8 = 4;
pub const PIM_ASSERT: u8 = 5;
pub const PIM_GRAFT: u8 = 6;
pub const PIM_GRAFT_ACK: u8 = 7;
pub const PIM_CANDIDATE_RP: u8 = 8;

/// All PIM routers multicast address (224.0.0.13)
pub const ALL_PIM_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 13);

/// Errors that can occur while decoding a PIM message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Invalid PIM version: expected 2, got {0}")]
    BadVersion(u8),

    #[error("PIM checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    BadChecksum { expected: u16, actual: u16 },

    #[error("Unsupported PIM message type {0}")]
    UnknownType(u8),

    #[error("Unsupported address family {0}")]
    BadAddressFamily(u8),

    #[error("Unsupported address encoding {0}")]
    BadEncoding(u8),

    #[error("Truncated {0}")]
    Truncated(&'static str),
}

/// Fail with `TooShort` unless `buf` holds at least `needed` bytes
pub(crate) fn ensure(buf: &[u8], needed: usize) -> Result<(), PacketError> {
    if buf.len() < needed {
        return Err(PacketError::TooShort {
            expected: needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Internet checksum (RFC 1071)
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum = sum.wrapping_add(u32::from(word));
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Parsed PIM header (common header for all PIM messages)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PimHeader {
    /// PIM version (must be 2)
    pub version: u8,
    /// Message type
    pub msg_type: u8,
    /// Reserved field
    pub reserved: u8,
    /// Checksum
    pub checksum: u16,
}

impl PimHeader {
    /// Parse a PIM header from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        ensure(data, PIM_HEADER_LEN)?;

        let ver_type = data[0];
        let version = (ver_type >> 4) & 0x0F;
        let msg_type = ver_type & 0x0F;

        if version != PIM_VERSION {
            return Err(PacketError::BadVersion(version));
        }

        Ok(Self {
            version,
            msg_type,
            reserved: data[1],
            checksum: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    /// Get the message type as a string
    pub fn type_name(&self) -> &'static str {
        type_name(self.msg_type)
    }
}

fn type_name(msg_type: u8) -> &'static str {
    match msg_type {
        PIM_HELLO => "Hello",
        PIM_REGISTER => "Register",
        PIM_REGISTER_STOP => "Register-Stop",
        PIM_JOIN_PRUNE => "Join/Prune",
        PIM_BOOTSTRAP => "Bootstrap",
        PIM_ASSERT => "Assert",
        PIM_GRAFT => "Graft",
        PIM_GRAFT_ACK => "Graft-Ack",
        PIM_CANDIDATE_RP => "Candidate-RP",
        _ => "Unknown",
    }
}

/// Common trait for PIM message bodies
pub trait PacketBuilder {
    /// PIM message type carried in the header
    fn msg_type(&self) -> u8;

    /// Append the message body (everything after the common header)
    fn write_body(&self, buf: &mut BytesMut);

    /// Number of leading bytes covered by the checksum
    fn checksum_span(&self, total_len: usize) -> usize {
        total_len
    }

    /// Build the full message with header and checksum
    fn build(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8((PIM_VERSION << 4) | self.msg_type());
        buf.put_u8(0); // Reserved
        buf.put_u16(0); // Checksum placeholder
        self.write_body(&mut buf);

        let span = self.checksum_span(buf.len()).min(buf.len());
        let checksum = internet_checksum(&buf[..span]);
        buf[2..4].copy_from_slice(&checksum.to_be_bytes());
        buf.freeze()
    }
}

/// Any decoded PIM control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PimMessage {
    Hello(Hello),
    Register(Register),
    RegisterStop(RegisterStop),
    JoinPrune(JoinPrune),
    Bootstrap(Bootstrap),
    Assert(Assert),
    CandidateRp(CandidateRpAdvertisement),
}

impl PimMessage {
    fn body(&self) -> &dyn PacketBuilder {
        match self {
            PimMessage::Hello(m) => m,
            PimMessage::Register(m) => m,
            PimMessage::RegisterStop(m) => m,
            PimMessage::JoinPrune(m) => m,
            PimMessage::Bootstrap(m) => m,
            PimMessage::Assert(m) => m,
            PimMessage::CandidateRp(m) => m,
        }
    }

    pub fn msg_type(&self) -> u8 {
        self.body().msg_type()
    }

    pub fn type_name(&self) -> &'static str {
        type_name(self.msg_type())
    }

    /// Encode to wire format with the checksum filled in
    pub fn encode(&self) -> Bytes {
        self.body().build()
    }

    /// Decode a PIM message, verifying version and checksum
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let header = PimHeader::parse(data)?;

        let span = if header.msg_type == PIM_REGISTER {
            data.len().min(register::REGISTER_CHECKSUM_LEN)
        } else {
            data.len()
        };
        let mut scratch = data[..span].to_vec();
        scratch[2] = 0;
        scratch[3] = 0;
        let expected = internet_checksum(&scratch);
        if expected != header.checksum {
            return Err(PacketError::BadChecksum {
                expected,
                actual: header.checksum,
            });
        }

        let mut body = &data[PIM_HEADER_LEN..];
        let message = match header.msg_type {
            PIM_HELLO => PimMessage::Hello(Hello::decode(&mut body)?),
            PIM_REGISTER => PimMessage::Register(Register::decode(&mut body)?),
            PIM_REGISTER_STOP => PimMessage::RegisterStop(RegisterStop::decode(&mut body)?),
            PIM_JOIN_PRUNE => PimMessage::JoinPrune(JoinPrune::decode(&mut body)?),
            PIM_BOOTSTRAP => PimMessage::Bootstrap(Bootstrap::decode(&mut body)?),
            PIM_ASSERT => PimMessage::Assert(Assert::decode(&mut body)?),
            PIM_CANDIDATE_RP => {
                PimMessage::CandidateRp(CandidateRpAdvertisement::decode(&mut body)?)
            }
            other => return Err(PacketError::UnknownType(other)),
        };
        Ok(message)
    }
}
