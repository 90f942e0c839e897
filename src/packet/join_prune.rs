// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Join/Prune message (type 3)

use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

use super::address::{get_unicast, put_unicast, EncodedGroup, EncodedSource};
use super::{ensure, PacketBuilder, PacketError, PIM_JOIN_PRUNE};

/// Joined and pruned sources for one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPruneGroup {
    pub group: EncodedGroup,
    pub joins: Vec<EncodedSource>,
    pub prunes: Vec<EncodedSource>,
}

impl JoinPruneGroup {
    pub fn new(group: EncodedGroup) -> Self {
        Self {
            group,
            joins: Vec::new(),
            prunes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.prunes.is_empty()
    }
}

/// Join/Prune message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPrune {
    /// RPF neighbor this message is addressed to
    pub upstream_neighbor: Ipv4Addr,
    /// Holdtime in seconds applied by the receiver
    pub holdtime: u16,
    pub groups: Vec<JoinPruneGroup>,
}

impl JoinPrune {
    pub fn new(upstream_neighbor: Ipv4Addr, holdtime: u16) -> Self {
        Self {
            upstream_neighbor,
            holdtime,
            groups: Vec::new(),
        }
    }

    /// Group block for `group`, created on first use
    pub fn group_mut(&mut self, group: EncodedGroup) -> &mut JoinPruneGroup {
        let index = match self.groups.iter().position(|g| g.group == group) {
            Some(index) => index,
            None => {
                self.groups.push(JoinPruneGroup::new(group));
                self.groups.len() - 1
            }
        };
        &mut self.groups[index]
    }

    pub fn add_join(&mut self, group: EncodedGroup, source: EncodedSource) {
        self.group_mut(group).joins.push(source);
    }

    pub fn add_prune(&mut self, group: EncodedGroup, source: EncodedSource) {
        self.group_mut(group).prunes.push(source);
    }

    pub(super) fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        let upstream_neighbor = get_unicast(buf)?;
        ensure(buf, 4)?;
        let _reserved = buf.get_u8();
        let num_groups = buf.get_u8();
        let holdtime = buf.get_u16();

        let mut groups = Vec::with_capacity(num_groups as usize);
        for _ in 0..num_groups {
            let group = EncodedGroup::decode(buf)?;
            ensure(buf, 4)?;
            let num_joins = buf.get_u16();
            let num_prunes = buf.get_u16();
            let mut block = JoinPruneGroup::new(group);
            for _ in 0..num_joins {
                block.joins.push(EncodedSource::decode(buf)?);
            }
            for _ in 0..num_prunes {
                block.prunes.push(EncodedSource::decode(buf)?);
            }
            groups.push(block);
        }

        Ok(Self {
            upstream_neighbor,
            holdtime,
            groups,
        })
    }
}

impl PacketBuilder for JoinPrune {
    fn msg_type(&self) -> u8 {
        PIM_JOIN_PRUNE
    }

    fn write_body(&self, buf: &mut BytesMut) {
        put_unicast(buf, self.upstream_neighbor);
        buf.put_u8(0); // Reserved
        let groups = &self.groups[..self.groups.len().min(usize::from(u8::MAX))];
        buf.put_u8(u8::try_from(groups.len()).unwrap_or(u8::MAX));
        buf.put_u16(self.holdtime);
        for block in groups {
            let joins = &block.joins[..block.joins.len().min(usize::from(u16::MAX))];
            let prunes = &block.prunes[..block.prunes.len().min(usize::from(u16::MAX))];
            block.group.encode(buf);
            buf.put_u16(u16::try_from(joins.len()).unwrap_or(u16::MAX));
            buf.put_u16(u16::try_from(prunes.len()).unwrap_or(u16::MAX));
            for source in joins.iter().chain(prunes) {
                source.encode(buf);
            }
        }
    }
}
