// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Hello message (type 0): a list of TLV options

use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

use super::address::{get_unicast, put_unicast, ENCODED_UNICAST_LEN};
use super::{ensure, PacketBuilder, PacketError, PIM_HELLO};

// Hello option types
pub const PIM_HELLO_HOLDTIME: u16 = 1;
pub const PIM_HELLO_LAN_PRUNE_DELAY: u16 = 2;
pub const PIM_HELLO_DR_PRIORITY: u16 = 19;
pub const PIM_HELLO_GENERATION_ID: u16 = 20;
pub const PIM_HELLO_ADDRESS_LIST: u16 = 24;

/// Holdtime value meaning "never time out"
pub const HOLDTIME_INFINITE: u16 = 0xFFFF;

/// Parsed PIM Hello option
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloOption {
    /// Holdtime in seconds
    Holdtime(u16),
    /// LAN Prune Delay, delays in milliseconds
    LanPruneDelay {
        tracking_support: bool,
        propagation_delay_ms: u16,
        override_interval_ms: u16,
    },
    /// DR Priority
    DrPriority(u32),
    /// Generation ID
    GenerationId(u32),
    /// Secondary addresses of the sender
    AddressList(Vec<Ipv4Addr>),
    /// Unknown option, kept verbatim
    Unknown { option_type: u16, data: Vec<u8> },
}

impl HelloOption {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            HelloOption::Holdtime(holdtime) => {
                buf.put_u16(PIM_HELLO_HOLDTIME);
                buf.put_u16(2);
                buf.put_u16(*holdtime);
            }
            HelloOption::LanPruneDelay {
                tracking_support,
                propagation_delay_ms,
                override_interval_ms,
            } => {
                buf.put_u16(PIM_HELLO_LAN_PRUNE_DELAY);
                buf.put_u16(4);
                let t_bit = if *tracking_support { 0x8000 } else { 0 };
                buf.put_u16(t_bit | (propagation_delay_ms & 0x7FFF));
                buf.put_u16(*override_interval_ms);
            }
            HelloOption::DrPriority(priority) => {
                buf.put_u16(PIM_HELLO_DR_PRIORITY);
                buf.put_u16(4);
                buf.put_u32(*priority);
            }
            HelloOption::GenerationId(gen_id) => {
                buf.put_u16(PIM_HELLO_GENERATION_ID);
                buf.put_u16(4);
                buf.put_u32(*gen_id);
            }
            HelloOption::AddressList(addresses) => {
                buf.put_u16(PIM_HELLO_ADDRESS_LIST);
                buf.put_u16((addresses.len() * ENCODED_UNICAST_LEN) as u16);
                for address in addresses {
                    put_unicast(buf, *address);
                }
            }
            HelloOption::Unknown { option_type, data } => {
                buf.put_u16(*option_type);
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
        }
    }

    fn decode(option_type: u16, mut data: &[u8]) -> Result<Self, PacketError> {
        let option = match option_type {
            PIM_HELLO_HOLDTIME if data.len() >= 2 => HelloOption::Holdtime(data.get_u16()),
            PIM_HELLO_LAN_PRUNE_DELAY if data.len() >= 4 => {
                let first = data.get_u16();
                HelloOption::LanPruneDelay {
                    tracking_support: first & 0x8000 != 0,
                    propagation_delay_ms: first & 0x7FFF,
                    override_interval_ms: data.get_u16(),
                }
            }
            PIM_HELLO_DR_PRIORITY if data.len() >= 4 => HelloOption::DrPriority(data.get_u32()),
            PIM_HELLO_GENERATION_ID if data.len() >= 4 => {
                HelloOption::GenerationId(data.get_u32())
            }
            PIM_HELLO_ADDRESS_LIST => {
                let mut addresses = Vec::new();
                while !data.is_empty() {
                    addresses.push(get_unicast(&mut data)?);
                }
                HelloOption::AddressList(addresses)
            }
            _ => HelloOption::Unknown {
                option_type,
                data: data.to_vec(),
            },
        };
        Ok(option)
    }
}

/// Hello message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hello {
    pub options: Vec<HelloOption>,
}

impl Hello {
    /// Hello with Holdtime, DR Priority and Generation ID options
    pub fn new(holdtime_secs: u16, dr_priority: u32, generation_id: u32) -> Self {
        Self {
            options: vec![
                HelloOption::Holdtime(holdtime_secs),
                HelloOption::DrPriority(dr_priority),
                HelloOption::GenerationId(generation_id),
            ],
        }
    }

    /// Add a LAN Prune Delay option
    pub fn with_lan_prune_delay(mut self, propagation_delay_ms: u16, override_ms: u16) -> Self {
        self.options.push(HelloOption::LanPruneDelay {
            tracking_support: false,
            propagation_delay_ms,
            override_interval_ms: override_ms,
        });
        self
    }

    pub fn holdtime(&self) -> Option<u16> {
        self.options.iter().find_map(|o| match o {
            HelloOption::Holdtime(h) => Some(*h),
            _ => None,
        })
    }

    pub fn dr_priority(&self) -> Option<u32> {
        self.options.iter().find_map(|o| match o {
            HelloOption::DrPriority(p) => Some(*p),
            _ => None,
        })
    }

    pub fn generation_id(&self) -> Option<u32> {
        self.options.iter().find_map(|o| match o {
            HelloOption::GenerationId(g) => Some(*g),
            _ => None,
        })
    }

    pub(super) fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        let mut options = Vec::new();
        while !buf.is_empty() {
            ensure(buf, 4)?;
            let option_type = buf.get_u16();
            let option_len = buf.get_u16() as usize;
            if buf.len() < option_len {
                return Err(PacketError::Truncated("Hello option"));
            }
            options.push(HelloOption::decode(option_type, &buf[..option_len])?);
            buf.advance(option_len);
        }
        Ok(Self { options })
    }
}

impl PacketBuilder for Hello {
    fn msg_type(&self) -> u8 {
        PIM_HELLO
    }

    fn write_body(&self, buf: &mut BytesMut) {
        for option in &self.options {
            option.encode(buf);
        }
    }
}
