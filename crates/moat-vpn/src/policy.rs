//! Routing Policy Engine
//!
//! Turns a [`Preferences`] snapshot into the [`NetworkCaptureSettings`]
//! applied to the virtual interface when the airlock starts.
//!
//! # Policy
//!
//! ```text
//!   captured:  0.0.0.0/0                      ::/0
//!   excluded:  10.0.0.0/8                     fc00::/7
//!              172.16.0.0/12                  fe80::/10
//!              192.168.0.0/16                 ff00::/8      (multicast discovery)
//!              169.254.0.0/16
//!              255.255.255.255/32
//!              224.0.0.0/4   (multicast discovery)
//! ```
//!
//! The OS resolves routes longest-prefix-first, so every excluded range is a
//! hole punched into the captured default. Anything not excluded goes into
//! the tunnel and is discarded.
//!
//! DNS always points at the tunnel's own address, which never answers. With
//! local name resolution allowed, the redirection is scoped to the empty
//! match domain so the system resolver still consults LAN-provided servers.

use crate::preferences::Preferences;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address of the virtual interface.
///
/// Taken from the benchmarking range (198.18.0.0/15) so it can never
/// collide with the private ranges being excluded.
pub const TUNNEL_ADDRESS_V4: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(198, 18, 0, 1), 24);

/// IPv6 address of the virtual interface (benchmarking range 2001:2::/48)
pub const TUNNEL_ADDRESS_V6: Ipv6Net =
    Ipv6Net::new_assert(Ipv6Addr::new(0x2001, 0x2, 0, 0, 0, 0, 0, 1), 128);

/// Tunnel MTU, below common path MTUs to avoid fragmentation
pub const TUNNEL_MTU: u16 = 1400;

/// Match-domain token meaning "no specific domain"
pub const MATCH_ALL_DOMAINS: &str = "";

const DEFAULT_ROUTE_V4: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 0);
const DEFAULT_ROUTE_V6: Ipv6Net = Ipv6Net::new_assert(Ipv6Addr::UNSPECIFIED, 0);

/// Always-excluded IPv4 ranges: RFC 1918, link-local, limited broadcast
const LOCAL_RANGES_V4: [Ipv4Net; 5] = [
    Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 8),
    Ipv4Net::new_assert(Ipv4Addr::new(172, 16, 0, 0), 12),
    Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 0, 0), 16),
    Ipv4Net::new_assert(Ipv4Addr::new(169, 254, 0, 0), 16),
    Ipv4Net::new_assert(Ipv4Addr::BROADCAST, 32),
];

/// Always-excluded IPv6 ranges: unique-local, link-local
const LOCAL_RANGES_V6: [Ipv6Net; 2] = [
    Ipv6Net::new_assert(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    Ipv6Net::new_assert(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
];

const MULTICAST_V4: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(224, 0, 0, 0), 4);
const MULTICAST_V6: Ipv6Net = Ipv6Net::new_assert(Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8);

/// Captured and excluded routes for one address family
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteSet<N> {
    /// Routes sent into the tunnel (always exactly the family default)
    pub captured: Vec<N>,
    /// Exceptions carved out of the captured default
    pub excluded: Vec<N>,
}

impl<N: Copy> RouteSet<N> {
    fn capture_all(default: N, excluded: Vec<N>) -> Self {
        Self {
            captured: vec![default],
            excluded,
        }
    }
}

/// DNS redirection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSettings {
    /// Resolver addresses (only the tunnel's dead end)
    pub servers: Vec<IpAddr>,
    /// Domains the redirection is scoped to; empty means exclusive
    pub match_domains: Vec<String>,
}

impl DnsSettings {
    /// Whether lookups not answered by the dead end still reach other resolvers
    pub fn falls_back_to_system(&self) -> bool {
        !self.match_domains.is_empty()
    }
}

/// Where traffic to a destination ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Sent into the tunnel and discarded
    Captured,
    /// Left on the normal network path
    Excluded,
}

/// Network settings applied to the virtual interface
///
/// Built fresh on every start and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCaptureSettings {
    /// IPv4 address (and mask) of the virtual interface
    pub tunnel_self_address: Ipv4Net,
    /// IPv6 address (and prefix) of the virtual interface
    pub tunnel_self_address6: Ipv6Net,
    /// IPv4 routes
    pub ipv4: RouteSet<Ipv4Net>,
    /// IPv6 routes
    pub ipv6: RouteSet<Ipv6Net>,
    /// DNS redirection
    pub dns: DnsSettings,
    /// Interface MTU
    pub mtu: u16,
}

impl NetworkCaptureSettings {
    /// Whether DNS falls back to the system's other resolvers
    pub fn dns_fallback_to_system(&self) -> bool {
        self.dns.falls_back_to_system()
    }

    /// Classify a destination address against this policy
    pub fn classify(&self, addr: IpAddr) -> RouteDecision {
        let excluded = match addr {
            IpAddr::V4(v4) => self.ipv4.excluded.iter().any(|net| net.contains(&v4)),
            IpAddr::V6(v6) => self.ipv6.excluded.iter().any(|net| net.contains(&v6)),
        };

        if excluded {
            RouteDecision::Excluded
        } else {
            RouteDecision::Captured
        }
    }
}

/// Compute the capture policy for a preference snapshot.
///
/// Pure and total: every combination of preferences yields valid settings.
pub fn compute_settings(preferences: &Preferences) -> NetworkCaptureSettings {
    let mut excluded_v4 = LOCAL_RANGES_V4.to_vec();
    let mut excluded_v6 = LOCAL_RANGES_V6.to_vec();

    // Every allowance needs both families or v6-preferring LANs break
    if preferences.allow_multicast_discovery {
        excluded_v4.push(MULTICAST_V4);
        excluded_v6.push(MULTICAST_V6);
    }

    let match_domains = if preferences.allow_local_name_resolution {
        vec![MATCH_ALL_DOMAINS.to_string()]
    } else {
        Vec::new()
    };

    NetworkCaptureSettings {
        tunnel_self_address: TUNNEL_ADDRESS_V4,
        tunnel_self_address6: TUNNEL_ADDRESS_V6,
        ipv4: RouteSet::capture_all(DEFAULT_ROUTE_V4, excluded_v4),
        ipv6: RouteSet::capture_all(DEFAULT_ROUTE_V6, excluded_v6),
        dns: DnsSettings {
            servers: vec![IpAddr::V4(TUNNEL_ADDRESS_V4.addr())],
            match_domains,
        },
        mtu: TUNNEL_MTU,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn net4(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn net6(s: &str) -> Ipv6Net {
        s.parse().unwrap()
    }

    fn preferences_strategy() -> impl Strategy<Value = Preferences> {
        (any::<bool>(), any::<bool>()).prop_map(|(mdns, dns)| Preferences::new(mdns, dns))
    }

    #[test]
    fn test_strict_policy() {
        let settings = compute_settings(&Preferences::strict());

        assert_eq!(settings.ipv4.captured, vec![net4("0.0.0.0/0")]);
        assert_eq!(
            settings.ipv4.excluded,
            vec![
                net4("10.0.0.0/8"),
                net4("172.16.0.0/12"),
                net4("192.168.0.0/16"),
                net4("169.254.0.0/16"),
                net4("255.255.255.255/32"),
            ]
        );
        assert_eq!(settings.ipv6.captured, vec![net6("::/0")]);
        assert_eq!(settings.ipv6.excluded, vec![net6("fc00::/7"), net6("fe80::/10")]);
        assert!(!settings.dns_fallback_to_system());
        assert!(settings.dns.match_domains.is_empty());
    }

    #[test]
    fn test_default_policy() {
        let settings = compute_settings(&Preferences::default());

        assert_eq!(settings.ipv4.excluded.len(), 6);
        assert_eq!(settings.ipv4.excluded.last(), Some(&net4("224.0.0.0/4")));
        assert_eq!(settings.ipv6.excluded.len(), 3);
        assert_eq!(settings.ipv6.excluded.last(), Some(&net6("ff00::/8")));
        assert!(settings.dns_fallback_to_system());
        assert_eq!(settings.dns.match_domains, vec![String::new()]);
    }

    #[test]
    fn test_tunnel_addressing() {
        let settings = compute_settings(&Preferences::default());

        assert_eq!(settings.tunnel_self_address.addr(), Ipv4Addr::new(198, 18, 0, 1));
        assert_eq!(settings.tunnel_self_address.prefix_len(), 24);
        assert_eq!(settings.tunnel_self_address6.prefix_len(), 128);
        assert_eq!(
            settings.dns.servers,
            vec![IpAddr::V4(Ipv4Addr::new(198, 18, 0, 1))]
        );
        assert_eq!(settings.mtu, 1400);
    }

    #[test]
    fn test_tunnel_address_is_not_excluded() {
        let settings = compute_settings(&Preferences::default());

        assert_eq!(
            settings.classify(IpAddr::V4(settings.tunnel_self_address.addr())),
            RouteDecision::Captured
        );
        assert_eq!(
            settings.classify(IpAddr::V6(settings.tunnel_self_address6.addr())),
            RouteDecision::Captured
        );
    }

    #[test]
    fn test_classify_destinations() {
        let strict = compute_settings(&Preferences::strict());
        let open = compute_settings(&Preferences::default());

        let lan: IpAddr = "192.168.1.20".parse().unwrap();
        let corp: IpAddr = "172.31.255.1".parse().unwrap();
        let outside_corp: IpAddr = "172.32.0.1".parse().unwrap();
        let internet: IpAddr = "1.1.1.1".parse().unwrap();
        let mdns: IpAddr = "224.0.0.251".parse().unwrap();
        let mdns6: IpAddr = "ff02::fb".parse().unwrap();
        let link_local6: IpAddr = "fe80::1".parse().unwrap();
        let internet6: IpAddr = "2606:4700::1111".parse().unwrap();

        assert_eq!(strict.classify(lan), RouteDecision::Excluded);
        assert_eq!(strict.classify(corp), RouteDecision::Excluded);
        assert_eq!(strict.classify(outside_corp), RouteDecision::Captured);
        assert_eq!(strict.classify(internet), RouteDecision::Captured);
        assert_eq!(strict.classify(link_local6), RouteDecision::Excluded);
        assert_eq!(strict.classify(internet6), RouteDecision::Captured);

        assert_eq!(strict.classify(mdns), RouteDecision::Captured);
        assert_eq!(strict.classify(mdns6), RouteDecision::Captured);
        assert_eq!(open.classify(mdns), RouteDecision::Excluded);
        assert_eq!(open.classify(mdns6), RouteDecision::Excluded);
    }

    #[test]
    fn test_settings_serialize_as_cidr_strings() {
        let settings = compute_settings(&Preferences::strict());
        let json = serde_json::to_value(&settings).unwrap();

        assert_eq!(json["tunnelSelfAddress"], "198.18.0.1/24");
        assert_eq!(json["ipv4"]["excluded"][1], "172.16.0.0/12");
        assert_eq!(json["dns"]["matchDomains"].as_array().unwrap().len(), 0);
        assert_eq!(json["mtu"], 1400);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_compute_is_deterministic(prefs in preferences_strategy()) {
            prop_assert_eq!(compute_settings(&prefs), compute_settings(&prefs));
        }

        #[test]
        fn prop_exclusions_are_disjoint_and_never_default(prefs in preferences_strategy()) {
            let settings = compute_settings(&prefs);

            prop_assert_eq!(settings.ipv4.captured.len(), 1);
            prop_assert_eq!(settings.ipv6.captured.len(), 1);

            let v4 = &settings.ipv4.excluded;
            for (i, a) in v4.iter().enumerate() {
                prop_assert!(!settings.ipv4.captured.contains(a));
                for b in &v4[i + 1..] {
                    prop_assert!(!a.contains(b) && !b.contains(a), "{} overlaps {}", a, b);
                }
            }

            let v6 = &settings.ipv6.excluded;
            for (i, a) in v6.iter().enumerate() {
                prop_assert!(!settings.ipv6.captured.contains(a));
                for b in &v6[i + 1..] {
                    prop_assert!(!a.contains(b) && !b.contains(a), "{} overlaps {}", a, b);
                }
            }
        }

        #[test]
        fn prop_multicast_adds_one_range_per_family(dns in any::<bool>()) {
            let off = compute_settings(&Preferences::new(false, dns));
            let on = compute_settings(&Preferences::new(true, dns));

            prop_assert_eq!(on.ipv4.excluded.len(), off.ipv4.excluded.len() + 1);
            prop_assert_eq!(on.ipv6.excluded.len(), off.ipv6.excluded.len() + 1);
            prop_assert_eq!(&on.ipv4.excluded[..off.ipv4.excluded.len()], &off.ipv4.excluded[..]);
            prop_assert_eq!(&on.ipv6.excluded[..off.ipv6.excluded.len()], &off.ipv6.excluded[..]);
            prop_assert_eq!(&on.ipv4.captured, &off.ipv4.captured);
            prop_assert_eq!(&on.ipv6.captured, &off.ipv6.captured);
            prop_assert_eq!(&on.dns, &off.dns);
        }

        #[test]
        fn prop_local_dns_only_changes_scoping(mdns in any::<bool>()) {
            let off = compute_settings(&Preferences::new(mdns, false));
            let on = compute_settings(&Preferences::new(mdns, true));

            prop_assert_eq!(&on.dns.servers, &off.dns.servers);
            prop_assert!(on.dns_fallback_to_system());
            prop_assert!(!off.dns_fallback_to_system());
            prop_assert_eq!(&on.ipv4, &off.ipv4);
            prop_assert_eq!(&on.ipv6, &off.ipv6);
            prop_assert_eq!(on.mtu, off.mtu);
        }
    }
}
