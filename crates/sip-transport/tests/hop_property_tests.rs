// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Property-based tests for hop parsing and formatting.

use proptest::prelude::*;
use sip_transport::{channel_key, HopAddress, TransportKind};

fn transport() -> impl Strategy<Value = TransportKind> {
    prop_oneof![
        Just(TransportKind::Udp),
        Just(TransportKind::Tcp),
        Just(TransportKind::Tls),
        Just(TransportKind::Ws),
        Just(TransportKind::Wss),
    ]
}

fn hostname() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,15}(\\.[a-z][a-z0-9-]{0,15}){0,3}"
}

fn ipv6() -> impl Strategy<Value = String> {
    prop::array::uniform8(any::<u16>()).prop_map(|segments| {
        std::net::Ipv6Addr::new(
            segments[0], segments[1], segments[2], segments[3], segments[4], segments[5],
            segments[6], segments[7],
        )
        .to_string()
    })
}

proptest! {
    #[test]
    fn formatted_hops_parse_back(host in hostname(), port in any::<u16>(), kind in transport()) {
        let hop = HopAddress::new(&host, port, kind);
        let parsed = HopAddress::parse(&hop.to_string()).unwrap();
        prop_assert_eq!(parsed, hop);
    }

    #[test]
    fn ipv6_hosts_are_bracketed(host in ipv6(), port in any::<u16>(), kind in transport()) {
        let hop = HopAddress::new(&host, port, kind);
        let text = hop.to_string();
        prop_assert!(text.starts_with('['));
        prop_assert_eq!(hop.unbracketed_host(), host.as_str());
        let parsed = HopAddress::parse(&text).unwrap();
        prop_assert_eq!(parsed.port(), port);
        prop_assert_eq!(parsed.transport(), kind);
    }

    #[test]
    fn transport_case_does_not_matter(host in hostname(), port in any::<u16>(), kind in transport()) {
        let lower = format!("{}:{}/{}", host, port, kind.as_str());
        let upper = format!("{}:{}/{}", host, port, kind.via_transport());
        prop_assert_eq!(HopAddress::parse(&lower).unwrap(), HopAddress::parse(&upper).unwrap());
    }

    #[test]
    fn hop_display_matches_channel_key(host in hostname(), port in any::<u16>(), kind in transport()) {
        let hop = HopAddress::new(&host, port, kind);
        prop_assert_eq!(hop.to_string(), channel_key(&host, port, kind));
    }

    #[test]
    fn parse_never_panics(input in "\\PC{0,40}") {
        let _ = HopAddress::parse(&input);
    }
}
