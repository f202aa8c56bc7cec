//! Property tests for payload type resolution and address classification

use std::net::{Ipv4Addr, Ipv6Addr};

use proptest::prelude::*;

use rtpsrc_core::registry::{lookup_static, DYNAMIC_PAYLOAD_TYPES, STATIC_PAYLOAD_TYPES};
use rtpsrc_core::resolver::{entry_caps, fixup_caps, MatchSource};
use rtpsrc_core::{is_multicast, resolve, Caps};

/// Dynamic encoding names that have no static counterpart
fn dynamic_only_names() -> Vec<&'static str> {
    DYNAMIC_PAYLOAD_TYPES
        .iter()
        .map(|e| e.encoding_name)
        .filter(|name| STATIC_PAYLOAD_TYPES.iter().all(|s| s.encoding_name != *name))
        .collect()
}

proptest! {
    #[test]
    fn static_payload_types_are_authoritative(pt in 0u8..128) {
        let resolution = resolve(pt, None);
        match lookup_static(pt) {
            Some(entry) => {
                prop_assert_eq!(resolution.source, Some(MatchSource::Static));
                prop_assert_eq!(resolution.defaulted, None);
                let caps = resolution.caps.unwrap();
                prop_assert_eq!(
                    caps,
                    fixup_caps(entry_caps(entry, pt), entry.encoding_name)
                );
            }
            None => {
                prop_assert_eq!(resolution.defaulted, Some("MP4V-ES"));
                prop_assert_eq!(resolution.source, Some(MatchSource::Dynamic));
            }
        }
    }

    #[test]
    fn forced_dynamic_name_ignores_static_table(
        pt in 0u8..128,
        index in any::<prop::sample::Index>(),
    ) {
        let names = dynamic_only_names();
        let name = names[index.index(names.len())];

        let resolution = resolve(pt, Some(name));
        prop_assert_eq!(resolution.source, Some(MatchSource::Dynamic));
        prop_assert_eq!(resolution.defaulted, None);

        let caps = resolution.caps.unwrap();
        prop_assert_eq!(caps.payload(), Some(i32::from(pt)));
    }

    #[test]
    fn fixup_is_idempotent(
        entry in prop::sample::select(
            STATIC_PAYLOAD_TYPES.iter().chain(DYNAMIC_PAYLOAD_TYPES.iter()).collect::<Vec<_>>()
        ),
        pt in 0u8..128,
    ) {
        let once = fixup_caps(entry_caps(entry, pt), entry.encoding_name);
        let twice = fixup_caps(once.clone(), entry.encoding_name);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn fixup_leaves_other_names_alone(
        name in "[A-Z][A-Z0-9-]{0,12}",
        pt in 0i32..128,
    ) {
        prop_assume!(!matches!(name.as_str(), "MPEG4-GENERIC-AUDIO" | "L16" | "RAW-RGB24"));
        let caps = Caps::rtp()
            .with("encoding-name", name.as_str())
            .with("payload", pt);
        prop_assert_eq!(fixup_caps(caps.clone(), &name), caps);
    }

    #[test]
    fn class_d_addresses_are_multicast(a in any::<u8>(), b in any::<u8>(), c in any::<u8>(), d in any::<u8>()) {
        let addr = Ipv4Addr::new(a, b, c, d);
        prop_assert_eq!(is_multicast(&addr.to_string()), (224..=239).contains(&a));
    }

    #[test]
    fn ipv6_multicast_follows_prefix(segments in any::<[u16; 8]>()) {
        let addr = Ipv6Addr::from(segments);
        prop_assert_eq!(is_multicast(&addr.to_string()), segments[0] >> 8 == 0xff);
    }

    #[test]
    fn classifier_never_panics(input in ".*") {
        let _ = is_multicast(&input);
    }
}

#[test]
fn test_known_multicast_examples() {
    for addr in ["224.0.0.1", "239.255.255.250", "ff02::1"] {
        assert!(is_multicast(addr), "{} should be multicast", addr);
    }
    for addr in ["192.168.1.10", "10.0.0.1", "::1"] {
        assert!(!is_multicast(addr), "{} should be unicast", addr);
    }
}
