// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Assert message (type 5)

use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

use super::address::{get_unicast, put_unicast, EncodedGroup};
use super::{ensure, PacketBuilder, PacketError, PIM_ASSERT};

const RPT_BIT: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assert {
    pub group: EncodedGroup,
    /// Source of the data packet that triggered the assert
    pub source: Ipv4Addr,
    pub rpt_bit: bool,
    /// Metric preference (admin distance), 31 bits
    pub preference: u32,
    pub metric: u32,
}

impl Assert {
    pub(super) fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        let group = EncodedGroup::decode(buf)?;
        let source = get_unicast(buf)?;
        ensure(buf, 8)?;
        let word = buf.get_u32();
        Ok(Self {
            group,
            source,
            rpt_bit: word & RPT_BIT != 0,
            preference: word & !RPT_BIT,
            metric: buf.get_u32(),
        })
    }
}

impl PacketBuilder for Assert {
    fn msg_type(&self) -> u8 {
        PIM_ASSERT
    }

    fn write_body(&self, buf: &mut BytesMut) {
        self.group.encode(buf);
        put_unicast(buf, self.source);
        let rpt = if self.rpt_bit { RPT_BIT } else { 0 };
        buf.put_u32(rpt | (self.preference & !RPT_BIT));
        buf.put_u32(self.metric);
    }
}
