// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Bootstrap (type 4) and Candidate-RP-Advertisement (type 8), RFC 5059

use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

use super::address::{get_unicast, put_unicast, EncodedGroup};
use super::{ensure, PacketBuilder, PacketError, PIM_BOOTSTRAP, PIM_CANDIDATE_RP};

/// RP records one group block can carry (8-bit Frag RP Count)
pub const MAX_BSM_RPS: usize = u8::MAX as usize;

/// Group prefixes one C-RP advertisement can carry (8-bit Prefix Count)
pub const MAX_CRP_PREFIXES: usize = u8::MAX as usize;

/// One RP inside a Bootstrap group block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRp {
    pub address: Ipv4Addr,
    pub holdtime: u16,
    pub priority: u8,
}

/// Group range with its RPs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapGroup {
    pub group: EncodedGroup,
    /// Total RPs for this range across all fragments
    pub rp_count: u8,
    pub rps: Vec<BootstrapRp>,
}

/// Bootstrap message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub fragment_tag: u16,
    pub hash_mask_len: u8,
    pub bsr_priority: u8,
    pub bsr_address: Ipv4Addr,
    pub groups: Vec<BootstrapGroup>,
}

impl Bootstrap {
    pub(super) fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        ensure(buf, 4)?;
        let fragment_tag = buf.get_u16();
        let hash_mask_len = buf.get_u8();
        let bsr_priority = buf.get_u8();
        let bsr_address = get_unicast(buf)?;

        let mut groups = Vec::new();
        while !buf.is_empty() {
            let group = EncodedGroup::decode(buf)?;
            ensure(buf, 4)?;
            let rp_count = buf.get_u8();
            let frag_rp_count = buf.get_u8();
            let _reserved = buf.get_u16();
            let mut rps = Vec::with_capacity(frag_rp_count as usize);
            for _ in 0..frag_rp_count {
                let address = get_unicast(buf)?;
                ensure(buf, 4)?;
                let holdtime = buf.get_u16();
                let priority = buf.get_u8();
                let _reserved = buf.get_u8();
                rps.push(BootstrapRp {
                    address,
                    holdtime,
                    priority,
                });
            }
            groups.push(BootstrapGroup {
                group,
                rp_count,
                rps,
            });
        }

        Ok(Self {
            fragment_tag,
            hash_mask_len,
            bsr_priority,
            bsr_address,
            groups,
        })
    }
}

impl PacketBuilder for Bootstrap {
    fn msg_type(&self) -> u8 {
        PIM_BOOTSTRAP
    }

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u16(self.fragment_tag);
        buf.put_u8(self.hash_mask_len);
        buf.put_u8(self.bsr_priority);
        put_unicast(buf, self.bsr_address);
        for block in &self.groups {
            block.group.encode(buf);
            // Records past the count field are never written
            let rps = &block.rps[..block.rps.len().min(MAX_BSM_RPS)];
            buf.put_u8(block.rp_count);
            buf.put_u8(u8::try_from(rps.len()).unwrap_or(u8::MAX));
            buf.put_u16(0);
            for rp in rps {
                put_unicast(buf, rp.address);
                buf.put_u16(rp.holdtime);
                buf.put_u8(rp.priority);
                buf.put_u8(0);
            }
        }
    }
}

/// Candidate-RP-Advertisement, unicast from a C-RP to the BSR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRpAdvertisement {
    pub priority: u8,
    pub holdtime: u16,
    pub rp: Ipv4Addr,
    /// Empty means the whole multicast range
    pub groups: Vec<EncodedGroup>,
}

impl CandidateRpAdvertisement {
    pub(super) fn decode(buf: &mut &[u8]) -> Result<Self, PacketError> {
        ensure(buf, 4)?;
        let prefix_count = buf.get_u8();
        let priority = buf.get_u8();
        let holdtime = buf.get_u16();
        let rp = get_unicast(buf)?;
        let mut groups = Vec::with_capacity(prefix_count as usize);
        for _ in 0..prefix_count {
            groups.push(EncodedGroup::decode(buf)?);
        }
        Ok(Self {
            priority,
            holdtime,
            rp,
            groups,
        })
    }
}

impl PacketBuilder for CandidateRpAdvertisement {
    fn msg_type(&self) -> u8 {
        PIM_CANDIDATE_RP
    }

    fn write_body(&self, buf: &mut BytesMut) {
        let groups = &self.groups[..self.groups.len().min(MAX_CRP_PREFIXES)];
        buf.put_u8(u8::try_from(groups.len()).unwrap_or(u8::MAX));
        buf.put_u8(self.priority);
        buf.put_u16(self.holdtime);
        put_unicast(buf, self.rp);
        for group in groups {
            group.encode(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PimMessage;

    fn sample_bsm() -> Bootstrap {
        Bootstrap {
            fragment_tag: 0x1234,
            hash_mask_len: 30,
            bsr_priority: 64,
            bsr_address: "10.0.0.1".parse().unwrap(),
            groups: vec![
                BootstrapGroup {
                    group: EncodedGroup::new("224.0.0.0".parse().unwrap(), 4),
                    rp_count: 2,
                    rps: vec![
                        BootstrapRp {
                            address: "10.0.0.5".parse().unwrap(),
                            holdtime: 150,
                            priority: 192,
                        },
                        BootstrapRp {
                            address: "10.0.0.6".parse().unwrap(),
                            holdtime: 150,
                            priority: 10,
                        },
                    ],
                },
                BootstrapGroup {
                    group: EncodedGroup::new("239.1.0.0".parse().unwrap(), 16),
                    rp_count: 0,
                    rps: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn test_bootstrap_layout() {
        let packet = PimMessage::Bootstrap(sample_bsm()).encode();
        // header + fixed part + 2 group blocks + 2 RP records
        assert_eq!(packet.len(), 4 + 4 + 6 + 2 * 12 + 2 * 10);
        assert_eq!(&packet[4..6], &[0x12, 0x34]);
        assert_eq!(packet[6], 30);
        assert_eq!(
            PimMessage::decode(&packet).unwrap(),
            PimMessage::Bootstrap(sample_bsm())
        );
    }

    #[test]
    fn test_bootstrap_truncated_rp_record() {
        let mut body = BytesMut::new();
        sample_bsm().write_body(&mut body);
        assert!(Bootstrap::decode(&mut &body[..30]).is_err());
    }

    #[test]
    fn test_oversized_rp_block_keeps_following_blocks_intact() {
        let mut bsm = sample_bsm();
        bsm.groups[0].rp_count = u8::MAX;
        bsm.groups[0].rps = (0..300u32)
            .map(|n| BootstrapRp {
                address: Ipv4Addr::from(0x0A00_0000 + n),
                holdtime: 150,
                priority: 0,
            })
            .collect();

        let packet = PimMessage::Bootstrap(bsm.clone()).encode();
        assert_eq!(packet.len(), 4 + 4 + 6 + 2 * 12 + MAX_BSM_RPS * 10);
        let PimMessage::Bootstrap(decoded) = PimMessage::decode(&packet).unwrap() else {
            panic!("expected Bootstrap");
        };
        assert_eq!(decoded.groups.len(), 2);
        assert_eq!(decoded.groups[0].rps[..], bsm.groups[0].rps[..MAX_BSM_RPS]);
        assert_eq!(decoded.groups[1], bsm.groups[1]);
    }

    #[test]
    fn test_candidate_rp_without_groups() {
        let adv = CandidateRpAdvertisement {
            priority: 192,
            holdtime: 150,
            rp: "10.0.0.5".parse().unwrap(),
            groups: Vec::new(),
        };
        let packet = PimMessage::CandidateRp(adv.clone()).encode();
        assert_eq!(packet.len(), 4 + 4 + 6);
        assert_eq!(packet[4], 0);
        assert_eq!(
            PimMessage::decode(&packet).unwrap(),
            PimMessage::CandidateRp(adv)
        );
    }
}
