// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Property-Based Tests: PIM Codec
//!
//! The decoder faces raw bytes from the network. Whatever arrives, it must
//! return `Ok` or `Err` without panicking, and anything the router itself
//! encodes must decode back to the same message.

use std::net::Ipv4Addr;

use pim_sm::packet::{
    get_unicast, put_unicast, Assert, EncodedGroup, EncodedSource, Hello, JoinPrune, PimMessage,
};
use proptest::prelude::*;

fn multicast_group() -> impl Strategy<Value = Ipv4Addr> {
    (224u8..=239, any::<[u8; 3]>()).prop_map(|(a, [b, c, d])| Ipv4Addr::new(a, b, c, d))
}

fn unicast() -> impl Strategy<Value = Ipv4Addr> {
    (1u8..=223, any::<[u8; 3]>()).prop_map(|(a, [b, c, d])| Ipv4Addr::new(a, b, c, d))
}

/// Any Encoded-Group, flags and mask length included
fn encoded_group() -> impl Strategy<Value = EncodedGroup> {
    (any::<[u8; 4]>(), 0u8..=32, any::<(bool, bool)>()).prop_map(|(address, mask_len, (bidir, admin_scope))| {
        EncodedGroup {
            address: Ipv4Addr::from(address),
            mask_len,
            bidir,
            admin_scope,
        }
    })
}

/// Any Encoded-Source, flags and mask length included
fn encoded_source() -> impl Strategy<Value = EncodedSource> {
    (any::<[u8; 4]>(), 0u8..=32, any::<(bool, bool, bool)>()).prop_map(
        |(address, mask_len, (sparse, wildcard, rpt))| EncodedSource {
            address: Ipv4Addr::from(address),
            mask_len,
            sparse,
            wildcard,
            rpt,
        },
    )
}

fn join_prune() -> impl Strategy<Value = JoinPrune> {
    (
        unicast(),
        any::<u16>(),
        prop::collection::vec(
            (
                multicast_group(),
                prop::collection::vec(unicast(), 0..4),
                prop::collection::vec(unicast(), 0..4),
            ),
            0..4,
        ),
    )
        .prop_map(|(upstream, holdtime, groups)| {
            let mut jp = JoinPrune::new(upstream, holdtime);
            for (group, joins, prunes) in groups {
                let block = jp.group_mut(EncodedGroup::host(group));
                block.joins.extend(joins.into_iter().map(EncodedSource::source));
                block.prunes.extend(prunes.into_iter().map(EncodedSource::source_rpt));
            }
            jp
        })
}

proptest! {
    /// Arbitrary bytes never panic the decoder
    #[test]
    fn test_decode_does_not_panic(input in any::<Vec<u8>>()) {
        let _ = PimMessage::decode(&input);
    }

    /// A valid PIMv2 header in front of random bodies, so decoding gets past
    /// the version check more often
    #[test]
    fn test_decode_random_bodies_does_not_panic(msg_type in 0u8..16, body in any::<Vec<u8>>()) {
        let mut input = vec![0x20 | msg_type, 0, 0, 0];
        input.extend(body);
        let _ = PimMessage::decode(&input);
    }

    #[test]
    fn test_encoded_unicast_round_trip(address in any::<[u8; 4]>()) {
        let address = Ipv4Addr::from(address);
        let mut wire = Vec::new();
        put_unicast(&mut wire, address);
        prop_assert_eq!(get_unicast(&mut &wire[..]).unwrap(), address);
    }

    #[test]
    fn test_encoded_group_round_trip(group in encoded_group()) {
        let mut wire = Vec::new();
        group.encode(&mut wire);
        let mut input = &wire[..];
        prop_assert_eq!(EncodedGroup::decode(&mut input).unwrap(), group);
        prop_assert!(input.is_empty());
    }

    #[test]
    fn test_encoded_source_round_trip(source in encoded_source()) {
        let mut wire = Vec::new();
        source.encode(&mut wire);
        let mut input = &wire[..];
        prop_assert_eq!(EncodedSource::decode(&mut input).unwrap(), source);
        prop_assert!(input.is_empty());
    }

    /// Flag bits and masks survive inside a whole message too
    #[test]
    fn test_join_prune_with_any_flags_round_trip(
        upstream in unicast(),
        group in encoded_group(),
        joins in prop::collection::vec(encoded_source(), 0..4),
        prunes in prop::collection::vec(encoded_source(), 0..4),
    ) {
        let mut jp = JoinPrune::new(upstream, 210);
        let block = jp.group_mut(group);
        block.joins = joins;
        block.prunes = prunes;
        let message = PimMessage::JoinPrune(jp);
        prop_assert_eq!(PimMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn test_hello_round_trip(holdtime in any::<u16>(), priority in any::<u32>(), gen_id in any::<u32>()) {
        let message = PimMessage::Hello(Hello::new(holdtime, priority, gen_id));
        prop_assert_eq!(PimMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn test_join_prune_round_trip(jp in join_prune()) {
        let message = PimMessage::JoinPrune(jp);
        prop_assert_eq!(PimMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn test_assert_round_trip(
        group in multicast_group(),
        source in unicast(),
        rpt_bit in any::<bool>(),
        preference in 0u32..(1 << 31),
        metric in any::<u32>(),
    ) {
        let message = PimMessage::Assert(Assert {
            group: EncodedGroup::host(group),
            source,
            rpt_bit,
            preference,
            metric,
        });
        prop_assert_eq!(PimMessage::decode(&message.encode()).unwrap(), message);
    }

    /// A single flipped bit is caught by the checksum or the parser
    #[test]
    fn test_corrupted_join_prune_never_decodes_unchanged(jp in join_prune(), bit in any::<prop::sample::Index>()) {
        let message = PimMessage::JoinPrune(jp);
        let mut wire = message.encode().to_vec();
        let bit = bit.index(wire.len() * 8);
        wire[bit / 8] ^= 1 << (bit % 8);
        if let Ok(decoded) = PimMessage::decode(&wire) {
            prop_assert_ne!(decoded, message);
        }
    }
}
