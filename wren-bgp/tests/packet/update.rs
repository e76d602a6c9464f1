//
// Copyright (c) The Wren Project Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::LazyLock as Lazy;

use ipnetwork::{Ipv4Network, Ipv6Network};
use wren_bgp::packet::attribute::{AsPath, AsPathSegment, Attrs, BaseAttrs};
use wren_bgp::packet::consts::{
    AddPathMode, Afi, AsPathSegmentType, Origin, Safi,
};
use wren_bgp::packet::message::{
    AddPathTuple, DecodeCxt, EncodeCxt, Ipv4Nlri, Ipv6Nlri, Message,
    MpReachNlri, MpUnreachNlri, NegotiatedCapability, ReachNlri, UnreachNlri,
    UpdateMsg, rx_capabilities,
};
use wren_bgp::session::PeerType;
use wren_utils::assert_eq_hex;

use super::{test_decode_msg, test_encode_msg};

// Withdrawal of two IPv4 prefixes, no path attributes.
static UPDATE1: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x1f, 0x02, 0x00, 0x08, 0x18,
            0x0a, 0x00, 0x01, 0x18, 0x0a, 0x00, 0x02, 0x00, 0x00,
        ],
        Message::Update(UpdateMsg {
            reach: None,
            unreach: Some(UnreachNlri {
                prefixes: vec![
                    Ipv4Nlri {
                        path_id: None,
                        prefix: Ipv4Network::from_str("10.0.1.0/24").unwrap(),
                    },
                    Ipv4Nlri {
                        path_id: None,
                        prefix: Ipv4Network::from_str("10.0.2.0/24").unwrap(),
                    },
                ],
            }),
            mp_reach: None,
            mp_unreach: None,
            attrs: None,
        }),
    )
});

// IPv4 route with the mandatory attributes plus MULTI_EXIT_DISC.
static UPDATE2: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x42, 0x02, 0x00, 0x00, 0x00,
            0x27,
            // ORIGIN
            0x40, 0x01, 0x01, 0x00,
            // AS_PATH
            0x50, 0x02, 0x00, 0x0a, 0x02, 0x02, 0x00, 0x01, 0x00, 0x0e, 0x00,
            0x00, 0xfd, 0xe9,
            // NEXT_HOP
            0x40, 0x03, 0x04, 0x0a, 0x00, 0x00, 0x01,
            // MULTI_EXIT_DISC
            0x80, 0x04, 0x04, 0x00, 0x00, 0x00, 0x0a,
            // LOCAL_PREF
            0x40, 0x05, 0x04, 0x00, 0x00, 0x00, 0x64,
            // NLRI
            0x18, 0xac, 0x10, 0x01,
        ],
        Message::Update(UpdateMsg {
            reach: Some(ReachNlri {
                prefixes: vec![Ipv4Nlri {
                    path_id: None,
                    prefix: Ipv4Network::from_str("172.16.1.0/24").unwrap(),
                }],
                nexthop: Ipv4Addr::from_str("10.0.0.1").unwrap(),
            }),
            unreach: None,
            mp_reach: None,
            mp_unreach: None,
            attrs: Some(Attrs {
                base: BaseAttrs {
                    origin: Origin::Igp,
                    as_path: AsPath {
                        segments: [AsPathSegment {
                            seg_type: AsPathSegmentType::Sequence,
                            members: [65550, 65001].into(),
                        }]
                        .into(),
                    },
                    as4_path: None,
                    nexthop: None,
                    ll_nexthop: None,
                    med: Some(10),
                    local_pref: Some(100),
                },
                unknown: vec![],
            }),
        }),
    )
});

// IPv6 route carried in MP_REACH_NLRI with a link-local nexthop.
static UPDATE3: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x5e, 0x02, 0x00, 0x00, 0x00,
            0x47,
            // MP_REACH_NLRI
            0x90, 0x0e, 0x00, 0x2e, 0x00, 0x02, 0x01, 0x20, 0x20, 0x01, 0x0d,
            0xb8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x01, 0xfe, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x40, 0x20, 0x01,
            0x0d, 0xb8, 0x00, 0x01, 0x00, 0x00,
            // ORIGIN
            0x40, 0x01, 0x01, 0x00,
            // AS_PATH
            0x50, 0x02, 0x00, 0x06, 0x02, 0x01, 0x00, 0x01, 0x00, 0x0e,
            // LOCAL_PREF
            0x40, 0x05, 0x04, 0x00, 0x00, 0x00, 0x64,
        ],
        Message::Update(UpdateMsg {
            reach: None,
            unreach: None,
            mp_reach: Some(MpReachNlri::Ipv6Unicast {
                prefixes: vec![Ipv6Nlri {
                    path_id: None,
                    prefix: Ipv6Network::from_str("2001:db8:1::/64").unwrap(),
                }],
                nexthop: Ipv6Addr::from_str("2001:db8::1").unwrap(),
                ll_nexthop: Some(Ipv6Addr::from_str("fe80::1").unwrap()),
            }),
            mp_unreach: None,
            attrs: Some(Attrs {
                base: BaseAttrs {
                    origin: Origin::Igp,
                    as_path: AsPath {
                        segments: [AsPathSegment {
                            seg_type: AsPathSegmentType::Sequence,
                            members: [65550].into(),
                        }]
                        .into(),
                    },
                    as4_path: None,
                    nexthop: None,
                    ll_nexthop: None,
                    med: None,
                    local_pref: Some(100),
                },
                unknown: vec![],
            }),
        }),
    )
});

// IPv6 withdrawal carried in MP_UNREACH_NLRI.
static UPDATE4: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x3c, 0x02, 0x00, 0x00, 0x00,
            0x25,
            // MP_UNREACH_NLRI
            0x90, 0x0f, 0x00, 0x0c, 0x00, 0x02, 0x01, 0x40, 0x20, 0x01, 0x0d,
            0xb8, 0x00, 0x01, 0x00, 0x00,
            // ORIGIN
            0x40, 0x01, 0x01, 0x00,
            // AS_PATH
            0x50, 0x02, 0x00, 0x06, 0x02, 0x01, 0x00, 0x01, 0x00, 0x0e,
            // LOCAL_PREF
            0x40, 0x05, 0x04, 0x00, 0x00, 0x00, 0x64,
        ],
        Message::Update(UpdateMsg {
            reach: None,
            unreach: None,
            mp_reach: None,
            mp_unreach: Some(MpUnreachNlri::Ipv6Unicast {
                prefixes: vec![Ipv6Nlri {
                    path_id: None,
                    prefix: Ipv6Network::from_str("2001:db8:1::/64").unwrap(),
                }],
            }),
            attrs: Some(Attrs {
                base: BaseAttrs {
                    origin: Origin::Igp,
                    as_path: AsPath {
                        segments: [AsPathSegment {
                            seg_type: AsPathSegmentType::Sequence,
                            members: [65550].into(),
                        }]
                        .into(),
                    },
                    as4_path: None,
                    nexthop: None,
                    ll_nexthop: None,
                    med: None,
                    local_pref: Some(100),
                },
                unknown: vec![],
            }),
        }),
    )
});

// IPv4 route with a path identifier (RFC 7911).
static UPDATE5: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x3b, 0x02, 0x00, 0x00, 0x00,
            0x1c,
            // ORIGIN
            0x40, 0x01, 0x01, 0x00,
            // AS_PATH
            0x50, 0x02, 0x00, 0x06, 0x02, 0x01, 0x00, 0x01, 0x00, 0x0e,
            // NEXT_HOP
            0x40, 0x03, 0x04, 0x0a, 0x00, 0x00, 0x01,
            // LOCAL_PREF
            0x40, 0x05, 0x04, 0x00, 0x00, 0x00, 0x64,
            // NLRI
            0x00, 0x00, 0x00, 0x01, 0x18, 0xc6, 0x33, 0x64,
        ],
        Message::Update(UpdateMsg {
            reach: Some(ReachNlri {
                prefixes: vec![Ipv4Nlri {
                    path_id: Some(1),
                    prefix: Ipv4Network::from_str("198.51.100.0/24").unwrap(),
                }],
                nexthop: Ipv4Addr::from_str("10.0.0.1").unwrap(),
            }),
            unreach: None,
            mp_reach: None,
            mp_unreach: None,
            attrs: Some(Attrs {
                base: BaseAttrs {
                    origin: Origin::Igp,
                    as_path: AsPath {
                        segments: [AsPathSegment {
                            seg_type: AsPathSegmentType::Sequence,
                            members: [65550].into(),
                        }]
                        .into(),
                    },
                    as4_path: None,
                    nexthop: None,
                    ll_nexthop: None,
                    med: None,
                    local_pref: Some(100),
                },
                unknown: vec![],
            }),
        }),
    )
});

#[test]
fn test_encode_update1() {
    let (ref bytes, ref msg) = *UPDATE1;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_update1() {
    let (ref bytes, ref msg) = *UPDATE1;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_update2() {
    let (ref bytes, ref msg) = *UPDATE2;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_update2() {
    let (ref bytes, ref msg) = *UPDATE2;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_update3() {
    let (ref bytes, ref msg) = *UPDATE3;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_update3() {
    let (ref bytes, ref msg) = *UPDATE3;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_update4() {
    let (ref bytes, ref msg) = *UPDATE4;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_update4() {
    let (ref bytes, ref msg) = *UPDATE4;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_update5() {
    let (ref bytes, ref msg) = *UPDATE5;
    let cxt = EncodeCxt {
        capabilities: [
            NegotiatedCapability::FourOctetAsNumber,
            NegotiatedCapability::AddPath(
                [AddPathTuple {
                    afi: Afi::Ipv4,
                    safi: Safi::Unicast,
                    mode: AddPathMode::ReceiveSend,
                }]
                .into(),
            ),
        ]
        .into(),
    };

    let bytes_actual = msg.encode(&cxt);
    assert_eq_hex!(bytes.as_slice(), bytes_actual);
}

#[test]
fn test_add_path_rx_negotiation() {
    let adv = |mode| -> BTreeSet<NegotiatedCapability> {
        [
            NegotiatedCapability::FourOctetAsNumber,
            NegotiatedCapability::AddPath(
                [AddPathTuple {
                    afi: Afi::Ipv4,
                    safi: Safi::Unicast,
                    mode,
                }]
                .into(),
            ),
        ]
        .into()
    };

    // Path identifiers are expected from the peer only when it advertised
    // Send and we advertised Receive.
    let capabilities =
        rx_capabilities(&adv(AddPathMode::Receive), &adv(AddPathMode::Send));
    assert_eq!(
        capabilities,
        BTreeSet::from([
            NegotiatedCapability::FourOctetAsNumber,
            NegotiatedCapability::AddPath(
                [AddPathTuple {
                    afi: Afi::Ipv4,
                    safi: Safi::Unicast,
                    mode: AddPathMode::Receive,
                }]
                .into(),
            ),
        ])
    );

    // With the modes reversed the receive direction isn't negotiated.
    let capabilities =
        rx_capabilities(&adv(AddPathMode::Send), &adv(AddPathMode::Receive));
    assert_eq!(
        capabilities,
        BTreeSet::from([NegotiatedCapability::FourOctetAsNumber])
    );

    // The negotiated set drives path identifier parsing.
    let (ref bytes, ref msg) = *UPDATE5;
    let cxt = DecodeCxt {
        peer_type: PeerType::Internal,
        peer_as: 65550,
        capabilities: rx_capabilities(
            &adv(AddPathMode::Receive),
            &adv(AddPathMode::Send),
        ),
    };
    let msg_size = Message::get_message_len(bytes)
        .expect("Buffer doesn't contain a full BGP message");
    let msg_actual = Message::decode(&bytes[0..msg_size], &cxt).unwrap();
    assert_eq!(*msg, msg_actual);
}

#[test]
fn test_decode_update5() {
    let (ref bytes, ref msg) = *UPDATE5;
    let cxt = DecodeCxt {
        peer_type: PeerType::Internal,
        peer_as: 65550,
        capabilities: [
            NegotiatedCapability::FourOctetAsNumber,
            NegotiatedCapability::AddPath(
                [AddPathTuple {
                    afi: Afi::Ipv4,
                    safi: Safi::Unicast,
                    mode: AddPathMode::ReceiveSend,
                }]
                .into(),
            ),
        ]
        .into(),
    };

    let msg_size = Message::get_message_len(bytes)
        .expect("Buffer doesn't contain a full BGP message");
    let msg_actual = Message::decode(&bytes[0..msg_size], &cxt).unwrap();
    assert_eq!(*msg, msg_actual);
}
