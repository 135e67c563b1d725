// BGP exporter: announces a network's reachable prefixes and its configured
// peers to the embedded speaker, so external routers can reach routed-mode
// workload addresses.
//
// Prefixes are owner-tagged ("network_<id>") so one network's announcements
// can be withdrawn without touching another's. Config changes remove or add
// only the peers whose (address, asn, password) triple actually changed.

use crate::net::config::{addr_is_set, enabled, Ipv4Cidr, Ipv6Cidr};
use crate::net::error::{NetworkError, NetworkResult};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpPeer {
    pub address: IpAddr,
    pub asn: u32,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpPrefix {
    pub subnet: String,
    pub nexthop: IpAddr,
    pub owner: String,
}

/// The embedded speaker: an in-process registry the daemon's BGP sessions
/// are driven from.
#[derive(Default)]
pub struct BgpSpeaker {
    peers: Mutex<Vec<BgpPeer>>,
    prefixes: Mutex<Vec<BgpPrefix>>,
}

impl BgpSpeaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&self, address: IpAddr, asn: u32, password: &str) -> NetworkResult<()> {
        let mut peers = self.peers.lock();
        if peers.iter().any(|p| p.address == address) {
            return Ok(());
        }
        peers.push(BgpPeer {
            address,
            asn,
            password: password.to_string(),
        });
        Ok(())
    }

    pub fn remove_peer(&self, address: IpAddr) -> NetworkResult<()> {
        self.peers.lock().retain(|p| p.address != address);
        Ok(())
    }

    pub fn add_prefix(&self, subnet: &str, nexthop: IpAddr, owner: &str) -> NetworkResult<()> {
        self.prefixes.lock().push(BgpPrefix {
            subnet: subnet.to_string(),
            nexthop,
            owner: owner.to_string(),
        });
        Ok(())
    }

    pub fn remove_prefixes_by_owner(&self, owner: &str) -> NetworkResult<()> {
        self.prefixes.lock().retain(|p| p.owner != owner);
        Ok(())
    }

    pub fn peers(&self) -> Vec<BgpPeer> {
        self.peers.lock().clone()
    }

    pub fn prefixes(&self) -> Vec<BgpPrefix> {
        self.prefixes.lock().clone()
    }
}

/// The owner tag carried by every prefix a network announces.
pub fn owner_tag(network_id: i64) -> String {
    format!("network_{}", network_id)
}

/// Collect the peer triples out of "bgp.peers.<name>.*" keys. Peers missing
/// an address or ASN are skipped.
pub fn peers_from_config(config: &HashMap<String, String>) -> Vec<(IpAddr, u32, String)> {
    let mut names = BTreeSet::new();
    for key in config.keys() {
        if let Some(rest) = key.strip_prefix("bgp.peers.") {
            if let Some((name, _)) = rest.split_once('.') {
                names.insert(name.to_string());
            }
        }
    }

    let mut peers = Vec::new();
    for name in names {
        let get = |field: &str| {
            config
                .get(&format!("bgp.peers.{}.{}", name, field))
                .map(|s| s.as_str())
                .unwrap_or("")
        };

        let address: IpAddr = match get("address").parse() {
            Ok(a) => a,
            Err(_) => continue,
        };
        let asn: u32 = match get("asn").parse() {
            Ok(a) => a,
            Err(_) => continue,
        };
        peers.push((address, asn, get("password").to_string()));
    }
    peers
}

/// Compute the prefixes a network should announce: the NAT address host
/// route in NAT mode, the configured subnet otherwise.
pub fn prefixes_from_config(
    config: &HashMap<String, String>,
) -> NetworkResult<Vec<(String, IpAddr)>> {
    let get = |key: &str| config.get(key).map(|s| s.as_str()).unwrap_or("");

    let nexthop_v4: IpAddr = get("bgp.ipv4.nexthop")
        .parse()
        .or_else(|_| get("volatile.network.ipv4.address").parse())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    let nexthop_v6: IpAddr = get("bgp.ipv6.nexthop")
        .parse()
        .or_else(|_| get("volatile.network.ipv6.address").parse())
        .unwrap_or(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED));

    let mut prefixes = Vec::new();

    if enabled(config, "ipv4.nat", false) {
        if !get("ipv4.nat.address").is_empty() {
            let cidr = Ipv4Cidr::parse(&format!("{}/32", get("ipv4.nat.address")))?;
            prefixes.push((cidr.subnet_string(), nexthop_v4));
        }
    } else if addr_is_set(config, "ipv4.address") {
        let cidr = Ipv4Cidr::parse(get("ipv4.address"))?;
        prefixes.push((cidr.subnet_string(), nexthop_v4));
    }

    if enabled(config, "ipv6.nat", false) {
        if !get("ipv6.nat.address").is_empty() {
            let cidr = Ipv6Cidr::parse(&format!("{}/128", get("ipv6.nat.address")))?;
            prefixes.push((cidr.subnet_string(), nexthop_v6));
        }
    } else if addr_is_set(config, "ipv6.address") {
        let cidr = Ipv6Cidr::parse(get("ipv6.address"))?;
        prefixes.push((cidr.subnet_string(), nexthop_v6));
    }

    Ok(prefixes)
}

/// Apply a network's BGP state to the speaker: minimal peer churn against
/// the old config, full prefix refresh under the owner tag.
pub fn bgp_setup(
    speaker: &BgpSpeaker,
    network_id: i64,
    old_config: Option<&HashMap<String, String>>,
    new_config: &HashMap<String, String>,
) -> NetworkResult<()> {
    let new_peers = peers_from_config(new_config);
    let old_peers = old_config.map(peers_from_config).unwrap_or_default();

    for peer in &old_peers {
        if !new_peers.contains(peer) {
            speaker.remove_peer(peer.0)?;
        }
    }
    for peer in &new_peers {
        if !old_peers.contains(peer) {
            speaker.add_peer(peer.0, peer.1, &peer.2)?;
        }
    }

    let owner = owner_tag(network_id);
    if old_config.is_some() {
        speaker.remove_prefixes_by_owner(&owner)?;
    }
    for (subnet, nexthop) in prefixes_from_config(new_config)? {
        speaker.add_prefix(&subnet, nexthop, &owner)?;
    }
    Ok(())
}

/// Withdraw everything a network announced.
pub fn bgp_clear(
    speaker: &BgpSpeaker,
    network_id: i64,
    config: &HashMap<String, String>,
) -> NetworkResult<()> {
    for (address, _, _) in peers_from_config(config) {
        speaker.remove_peer(address)?;
    }
    speaker.remove_prefixes_by_owner(&owner_tag(network_id))?;
    Ok(())
}

/// Validate a peer ASN out of the config surface (1..=4294967294; 0 and the
/// full 32-bit value are reserved).
pub fn validate_asn(value: &str) -> NetworkResult<u32> {
    match value.parse::<u64>() {
        Ok(asn) if (1..=4294967294).contains(&asn) => Ok(asn as u32),
        _ => Err(NetworkError::Validation(format!(
            "'{}' is not a valid ASN",
            value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn peers_are_collected_and_sorted_by_name() {
        let config = cfg(&[
            ("bgp.peers.zed.address", "192.0.2.2"),
            ("bgp.peers.zed.asn", "65002"),
            ("bgp.peers.abe.address", "192.0.2.1"),
            ("bgp.peers.abe.asn", "65001"),
            ("bgp.peers.abe.password", "secret"),
            // Incomplete peer is skipped.
            ("bgp.peers.nul.address", "192.0.2.3"),
        ]);
        let peers = peers_from_config(&config);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].0, "192.0.2.1".parse::<IpAddr>().unwrap());
        assert_eq!(peers[0].2, "secret");
        assert_eq!(peers[1].1, 65002);
    }

    #[test]
    fn prefixes_follow_nat_mode() {
        // NAT with a pinned SNAT address announces the host route.
        let config = cfg(&[
            ("ipv4.address", "10.0.0.1/24"),
            ("ipv4.nat", "true"),
            ("ipv4.nat.address", "192.0.2.10"),
        ]);
        let prefixes = prefixes_from_config(&config).unwrap();
        assert_eq!(prefixes, vec![("192.0.2.10/32".to_string(), "0.0.0.0".parse().unwrap())]);

        // Plain routed subnet announces the subnet itself.
        let config = cfg(&[("ipv4.address", "10.0.0.1/24")]);
        let prefixes = prefixes_from_config(&config).unwrap();
        assert_eq!(prefixes[0].0, "10.0.0.0/24");

        // NAT without a pinned address announces nothing for that family.
        let config = cfg(&[("ipv4.address", "10.0.0.1/24"), ("ipv4.nat", "true")]);
        assert!(prefixes_from_config(&config).unwrap().is_empty());
    }

    #[test]
    fn nexthop_precedence() {
        let config = cfg(&[
            ("ipv4.address", "10.0.0.1/24"),
            ("volatile.network.ipv4.address", "172.16.0.5"),
        ]);
        let prefixes = prefixes_from_config(&config).unwrap();
        assert_eq!(prefixes[0].1, "172.16.0.5".parse::<IpAddr>().unwrap());

        let config = cfg(&[
            ("ipv4.address", "10.0.0.1/24"),
            ("volatile.network.ipv4.address", "172.16.0.5"),
            ("bgp.ipv4.nexthop", "172.16.0.9"),
        ]);
        let prefixes = prefixes_from_config(&config).unwrap();
        assert_eq!(prefixes[0].1, "172.16.0.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn setup_applies_minimal_peer_churn() {
        let speaker = BgpSpeaker::new();
        let old = cfg(&[
            ("ipv4.address", "10.0.0.1/24"),
            ("bgp.peers.a.address", "192.0.2.1"),
            ("bgp.peers.a.asn", "65001"),
            ("bgp.peers.b.address", "192.0.2.2"),
            ("bgp.peers.b.asn", "65002"),
        ]);
        bgp_setup(&speaker, 7, None, &old).unwrap();
        assert_eq!(speaker.peers().len(), 2);
        assert_eq!(speaker.prefixes().len(), 1);
        assert_eq!(speaker.prefixes()[0].owner, "network_7");

        // Peer b changes password, peer c appears, peer a unchanged.
        let new = cfg(&[
            ("ipv4.address", "10.0.0.1/24"),
            ("bgp.peers.a.address", "192.0.2.1"),
            ("bgp.peers.a.asn", "65001"),
            ("bgp.peers.b.address", "192.0.2.2"),
            ("bgp.peers.b.asn", "65002"),
            ("bgp.peers.b.password", "changed"),
            ("bgp.peers.c.address", "192.0.2.3"),
            ("bgp.peers.c.asn", "65003"),
        ]);
        bgp_setup(&speaker, 7, Some(&old), &new).unwrap();
        let peers = speaker.peers();
        assert_eq!(peers.len(), 3);
        assert!(peers
            .iter()
            .any(|p| p.address == "192.0.2.2".parse::<IpAddr>().unwrap()
                && p.password == "changed"));
    }

    #[test]
    fn clear_withdraws_only_own_prefixes() {
        let speaker = BgpSpeaker::new();
        let config_a = cfg(&[("ipv4.address", "10.0.0.1/24")]);
        let config_b = cfg(&[("ipv4.address", "10.1.0.1/24")]);
        bgp_setup(&speaker, 1, None, &config_a).unwrap();
        bgp_setup(&speaker, 2, None, &config_b).unwrap();
        assert_eq!(speaker.prefixes().len(), 2);

        bgp_clear(&speaker, 1, &config_a).unwrap();
        let prefixes = speaker.prefixes();
        assert_eq!(prefixes.len(), 1);
        assert_eq!(prefixes[0].owner, "network_2");
    }

    #[test]
    fn asn_bounds() {
        assert!(validate_asn("1").is_ok());
        assert!(validate_asn("4294967294").is_ok());
        assert!(validate_asn("0").is_err());
        assert!(validate_asn("4294967295").is_err());
    }
}
