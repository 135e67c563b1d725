// Overlay and tunnel construction: GRE, VXLAN and the fan mapping.
//
// Tunnel devices are created through ip(8): the fan-map attribute and gretap
// kind aren't expressible through rtnetlink. MTU policy and the fan address
// arithmetic live here so the engine deals only in computed values.

use crate::net::config::{FanType, Ipv4Cidr, ParsedConfig, TunnelConfig, TunnelProtocol};
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::netlink::{self, NetlinkHandle};
use std::net::Ipv4Addr;

/// Default bridge MTU when nothing forces a smaller one.
pub const DEFAULT_MTU: u32 = 1500;
/// MTU when plain tunnels are attached to the bridge.
pub const TUNNEL_MTU: u32 = 1400;
/// Fan defaults when the underlay device MTU is unknown.
pub const FAN_IPIP_MTU: u32 = 1480;
pub const FAN_VXLAN_MTU: u32 = 1450;

/// Encapsulation overhead subtracted from a known underlay MTU.
pub const IPIP_OVERHEAD: u32 = 20;
pub const VXLAN_OVERHEAD: u32 = 50;

/// Static MTU selection: explicit override, then tunnel presence, then fan
/// encapsulation, then the default. The fan path may lower this further at
/// runtime once the underlay device MTU is known.
pub fn compute_mtu(parsed: &ParsedConfig) -> u32 {
    if let Some(mtu) = parsed.mtu_override {
        return mtu;
    }
    if !parsed.tunnels.is_empty() {
        return TUNNEL_MTU;
    }
    if let Some(fan) = &parsed.fan {
        return match fan.fan_type {
            FanType::Ipip => FAN_IPIP_MTU,
            FanType::Vxlan => FAN_VXLAN_MTU,
        };
    }
    DEFAULT_MTU
}

/// A computed fan address for this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanAddress {
    /// The bridge address, e.g. 240.1.7.1/8.
    pub address: Ipv4Addr,
    /// Prefix of the bridge address (the overlay size).
    pub prefix: u8,
    /// This host's /24 slice of the overlay.
    pub host_subnet: Ipv4Cidr,
    /// The underlay interface carrying the tunnel.
    pub underlay_dev: String,
    /// This host's address on the underlay.
    pub underlay_addr: Ipv4Addr,
}

impl FanAddress {
    pub fn cidr_string(&self) -> String {
        format!("{}/{}", self.address, self.prefix)
    }
}

/// Derive the fan address from the underlay/overlay pair and this host's
/// underlay address. The host bits are re-derived from the masks: the
/// address is `overlay_network | (host_suffix << 8) | 1` where the suffix is
/// the low `32 - overlay - 8` bits of the underlay address. The result
/// always lies inside the overlay and ends in .1.
pub fn fan_address(
    underlay: &Ipv4Cidr,
    overlay: &Ipv4Cidr,
    host_addr: Ipv4Addr,
) -> NetworkResult<(Ipv4Addr, u8, Ipv4Cidr)> {
    if underlay.prefix != 16 && underlay.prefix != 24 {
        return Err(NetworkError::Validation(
            "only /16 or /24 underlay subnets are supported".into(),
        ));
    }
    if overlay.prefix != 8 && overlay.prefix != 16 {
        return Err(NetworkError::Validation(
            "only /8 or /16 overlay subnets are supported".into(),
        ));
    }
    if overlay.prefix as u32 + (32 - underlay.prefix as u32) + 8 > 32 {
        return Err(NetworkError::Validation(
            "underlay or overlay subnets too large to accommodate the fan".into(),
        ));
    }
    if !underlay.contains(host_addr) {
        return Err(NetworkError::Validation(format!(
            "host address {} is not inside the underlay {}",
            host_addr,
            underlay.subnet_string()
        )));
    }

    let slot_bits = 32 - overlay.prefix as u32 - 8;
    let suffix_mask = (1u32 << slot_bits) - 1;
    let suffix = u32::from(host_addr) & suffix_mask;

    let derived = u32::from(overlay.network()) | (suffix << 8) | 1;
    let address = Ipv4Addr::from(derived);

    let host_subnet = Ipv4Cidr {
        addr: Ipv4Addr::from(derived & !0xffu32),
        prefix: 24,
    };

    Ok((address, overlay.prefix, host_subnet))
}

/// VXLAN network id of the fan tunnel, derived from the overlay prefix.
pub fn fan_vxlan_id(overlay: &Ipv4Cidr) -> u32 {
    u32::from(overlay.network()) >> 8
}

/// Locate this host's address inside the fan underlay and resolve the full
/// fan address for it.
pub async fn resolve_fan_address(
    nl: &NetlinkHandle,
    underlay: &Ipv4Cidr,
    overlay: &Ipv4Cidr,
) -> NetworkResult<FanAddress> {
    let underlay_copy = *underlay;
    let (host_addr, dev) = nl
        .address_in_subnet(move |ip| underlay_copy.contains(ip))
        .await?;

    let (address, prefix, host_subnet) = fan_address(underlay, overlay, host_addr)?;
    Ok(FanAddress {
        address,
        prefix,
        host_subnet,
        underlay_dev: dev,
        underlay_addr: host_addr,
    })
}

/// Derive the subnet of the interface carrying the IPv4 default route, used
/// to backfill fan.underlay_subnet when the config omits it.
pub async fn default_underlay_subnet(nl: &NetlinkHandle) -> NetworkResult<String> {
    let dev = netlink::default_gateway_v4().await?;
    let addrs = nl.addr_list_v4_prefixed(&dev).await?;
    let (addr, prefix) = addrs
        .first()
        .ok_or_else(|| NetworkError::NotFound(format!("no IPv4 address on {}", dev)))?;
    let cidr = Ipv4Cidr {
        addr: *addr,
        prefix: *prefix,
    };
    Ok(cidr.subnet_string())
}

// ── Device construction ───────────────────────────────────────────────

/// Create a gretap tunnel device.
pub async fn create_gretap(name: &str, local: &str, remote: &str) -> NetworkResult<()> {
    netlink::run_ip(&[
        "link", "add", "dev", name, "type", "gretap", "local", local, "remote", remote,
    ])
    .await
}

/// Create a unicast or multicast VXLAN tunnel device from per-peer config.
pub async fn create_vxlan(name: &str, tunnel: &TunnelConfig) -> NetworkResult<()> {
    let port = tunnel.port.to_string();
    let id = tunnel.id.to_string();
    let ttl = tunnel.ttl.to_string();

    let mut args: Vec<String> = vec![
        "link".into(),
        "add".into(),
        "dev".into(),
        name.into(),
        "type".into(),
        "vxlan".into(),
    ];

    match (&tunnel.local, &tunnel.remote) {
        (Some(local), Some(remote)) => {
            args.extend([
                "local".into(),
                local.to_string(),
                "remote".into(),
                remote.to_string(),
            ]);
        }
        _ => {
            let group = tunnel
                .group
                .map(|g| g.to_string())
                .unwrap_or_else(|| "239.0.0.1".to_string());
            let dev = match &tunnel.interface {
                Some(dev) => dev.clone(),
                None => netlink::default_gateway_v4().await?,
            };
            args.extend(["group".into(), group, "dev".into(), dev]);
        }
    }

    args.extend([
        "dstport".into(),
        port,
        "id".into(),
        id,
        "ttl".into(),
        ttl,
    ]);

    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    netlink::run_ip(&arg_refs).await
}

/// Build a tunnel device named `<network>-<peer>` and attach it to the
/// bridge at the computed MTU.
pub async fn setup_tunnel(
    nl: &NetlinkHandle,
    network: &str,
    tunnel: &TunnelConfig,
    mtu: u32,
) -> NetworkResult<()> {
    let tun_name = format!("{}-{}", network, tunnel.name);

    match tunnel.protocol {
        TunnelProtocol::Gre => {
            let local = tunnel
                .local
                .ok_or_else(|| {
                    NetworkError::Validation(format!("tunnel {} missing local address", tunnel.name))
                })?
                .to_string();
            let remote = tunnel
                .remote
                .ok_or_else(|| {
                    NetworkError::Validation(format!(
                        "tunnel {} missing remote address",
                        tunnel.name
                    ))
                })?
                .to_string();
            create_gretap(&tun_name, &local, &remote).await?;
        }
        TunnelProtocol::Vxlan => {
            create_vxlan(&tun_name, tunnel).await?;
        }
    }

    nl.link_set_master(&tun_name, network).await?;
    nl.link_set_mtu(&tun_name, mtu).await?;
    nl.link_set_up(&tun_name).await?;
    Ok(())
}

/// Create the fan VXLAN device `<network>-fan` carrying the overlay.
pub async fn setup_fan_vxlan(
    nl: &NetlinkHandle,
    network: &str,
    fan: &FanAddress,
    overlay: &Ipv4Cidr,
    underlay: &Ipv4Cidr,
    mtu: u32,
) -> NetworkResult<()> {
    let tun_name = format!("{}-fan", network);
    let id = fan_vxlan_id(overlay).to_string();
    let local = fan.underlay_addr.to_string();
    let fan_map = format!("{}:{}", overlay.subnet_string(), underlay.subnet_string());

    netlink::run_ip(&[
        "link", "add", &tun_name, "type", "vxlan", "id", &id, "dev", &fan.underlay_dev,
        "dstport", "0", "local", &local, "fan-map", &fan_map,
    ])
    .await?;

    nl.link_set_master(&tun_name, network).await?;
    nl.link_set_mtu(&tun_name, mtu).await?;
    nl.link_set_up(&tun_name).await?;
    nl.link_set_up(network).await?;
    Ok(())
}

/// Configure the shared tunl0 device for an IPIP fan.
pub async fn setup_fan_ipip(
    fan: &FanAddress,
    overlay: &Ipv4Cidr,
    underlay: &Ipv4Cidr,
) -> NetworkResult<()> {
    netlink::run_ip(&["-4", "route", "flush", "dev", "tunl0"]).await?;
    netlink::run_ip(&["link", "set", "dev", "tunl0", "up"]).await?;

    // Setting the map again fails once it exists; that's fine.
    let fan_map = format!("{}:{}", overlay.subnet_string(), underlay.subnet_string());
    let _ = netlink::run_ip(&[
        "link", "change", "dev", "tunl0", "type", "ipip", "fan-map", &fan_map,
    ])
    .await;

    let overlay_s = overlay.subnet_string();
    let addr = fan.address.to_string();
    netlink::run_ip(&["route", "add", &overlay_s, "dev", "tunl0", "src", &addr]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cidr(s: &str) -> Ipv4Cidr {
        Ipv4Cidr::parse(s).unwrap()
    }

    #[test]
    fn fan_address_for_slash24_underlay() {
        let (addr, prefix, host_subnet) = fan_address(
            &cidr("192.168.1.0/24"),
            &cidr("240.0.0.0/8"),
            "192.168.1.7".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(addr, Ipv4Addr::new(240, 1, 7, 1));
        assert_eq!(prefix, 8);
        assert_eq!(host_subnet.subnet_string(), "240.1.7.0/24");
    }

    #[test]
    fn fan_address_for_slash16_underlay() {
        let (addr, _, _) = fan_address(
            &cidr("10.1.0.0/16"),
            &cidr("240.0.0.0/8"),
            "10.1.3.5".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(addr, Ipv4Addr::new(240, 3, 5, 1));
    }

    #[test]
    fn fan_address_for_slash16_overlay() {
        let (addr, prefix, _) = fan_address(
            &cidr("192.168.1.0/24"),
            &cidr("250.10.0.0/16"),
            "192.168.1.7".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(addr, Ipv4Addr::new(250, 10, 7, 1));
        assert_eq!(prefix, 16);
    }

    #[test]
    fn fan_address_always_inside_overlay_ending_in_one() {
        // Walk a spread of hosts; the derived address must stay inside the
        // overlay and carry a final octet of 1.
        let underlay = cidr("172.16.0.0/16");
        let overlay = cidr("240.0.0.0/8");
        for host in [
            "172.16.0.1",
            "172.16.1.200",
            "172.16.255.254",
            "172.16.42.42",
        ] {
            let (addr, _, subnet) =
                fan_address(&underlay, &overlay, host.parse().unwrap()).unwrap();
            assert!(overlay.contains(addr), "{} escaped the overlay", addr);
            assert_eq!(addr.octets()[3], 1);
            assert!(subnet.contains(addr));
        }
    }

    #[test]
    fn fan_address_rejects_bad_sizes() {
        let host = "10.0.0.5".parse().unwrap();
        // Underlay not /16 or /24.
        assert!(fan_address(&cidr("10.0.0.0/20"), &cidr("240.0.0.0/8"), host).is_err());
        // Overlay not /8 or /16.
        assert!(fan_address(&cidr("10.0.0.0/24"), &cidr("240.0.0.0/12"), host).is_err());
        // /16 overlay plus /16 underlay cannot fit: 16 + 16 + 8 > 32.
        assert!(fan_address(&cidr("10.0.0.0/16"), &cidr("250.0.0.0/16"), host).is_err());
        // Host outside the underlay.
        assert!(
            fan_address(&cidr("10.0.0.0/24"), &cidr("240.0.0.0/8"), "10.9.9.9".parse().unwrap())
                .is_err()
        );
    }

    #[test]
    fn vxlan_id_from_overlay() {
        assert_eq!(fan_vxlan_id(&cidr("240.0.0.0/8")), 240 << 16);
        assert_eq!(fan_vxlan_id(&cidr("250.10.0.0/16")), (250 << 16) | (10 << 8));
    }

    fn parsed(pairs: &[(&str, &str)]) -> ParsedConfig {
        let config: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ParsedConfig::parse(&config).unwrap()
    }

    #[test]
    fn mtu_policy() {
        assert_eq!(compute_mtu(&parsed(&[])), DEFAULT_MTU);
        assert_eq!(compute_mtu(&parsed(&[("bridge.mtu", "9000")])), 9000);
        assert_eq!(
            compute_mtu(&parsed(&[
                ("tunnel.a.protocol", "vxlan"),
                ("tunnel.a.group", "239.0.0.1"),
            ])),
            TUNNEL_MTU
        );
        assert_eq!(
            compute_mtu(&parsed(&[("bridge.mode", "fan"), ("fan.type", "ipip")])),
            FAN_IPIP_MTU
        );
        assert_eq!(
            compute_mtu(&parsed(&[("bridge.mode", "fan")])),
            FAN_VXLAN_MTU
        );
        // Explicit MTU wins over everything.
        assert_eq!(
            compute_mtu(&parsed(&[
                ("bridge.mode", "fan"),
                ("bridge.mtu", "1200"),
                ("tunnel.a.protocol", "vxlan"),
                ("tunnel.a.group", "239.0.0.1"),
            ])),
            1200
        );
    }
}
