// Network configuration: the declarative string map, its validation rules,
// and the typed projection the engine works from after validation.
//
// The map-of-dotted-strings shape is part of the API contract and is kept
// as-is; `ParsedConfig::parse` turns a validated map into typed values so
// the reconciliation path never re-parses strings.

use crate::net::error::{NetworkError, NetworkResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Wire payload for network create/update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkPut {
    pub description: String,
    pub config: HashMap<String, String>,
}

/// Truthy config values, matching the API's boolean convention.
pub fn is_true(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Boolean key with a default for the empty/unset value.
pub fn enabled(config: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match config.get(key).map(|s| s.as_str()) {
        None | Some("") => default,
        Some(v) => is_true(v),
    }
}

/// Address keys hold "", "none", or a CIDR.
pub fn addr_is_set(config: &HashMap<String, String>, key: &str) -> bool {
    !matches!(config.get(key).map(|s| s.as_str()), None | Some("") | Some("none"))
}

/// Config keys that are supplied per cluster member and never replicated.
pub fn is_node_specific(key: &str) -> bool {
    key == "bridge.external_interfaces"
        || key.starts_with("bgp.peers.")
        || key.starts_with("volatile.")
}

/// Copy of a config with node-specific keys removed, for cross-member puts.
pub fn strip_node_specific(config: &HashMap<String, String>) -> HashMap<String, String> {
    config
        .iter()
        .filter(|(k, _)| !is_node_specific(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Network names become kernel interface names, so they are restricted to
/// URL-segment-safe characters and the interface name length limit.
pub fn validate_network_name(name: &str) -> NetworkResult<()> {
    if name.is_empty() {
        return Err(NetworkError::Validation("network name is empty".into()));
    }
    if name.len() > 15 {
        return Err(NetworkError::Validation(format!(
            "network name '{}' is longer than 15 characters",
            name
        )));
    }
    if name.contains(':') {
        return Err(NetworkError::Validation(format!(
            "network name '{}' cannot contain ':'",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
    {
        return Err(NetworkError::Validation(format!(
            "network name '{}' is not URL-segment safe",
            name
        )));
    }
    Ok(())
}

// ── CIDR helpers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn parse(s: &str) -> NetworkResult<Self> {
        let (addr, prefix) = split_cidr(s)?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| NetworkError::Validation(format!("invalid IPv4 CIDR '{}'", s)))?;
        if prefix > 32 {
            return Err(NetworkError::Validation(format!(
                "invalid IPv4 prefix length in '{}'",
                s
            )));
        }
        Ok(Self { addr, prefix })
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            (!0u32) << (32 - self.prefix)
        }
    }

    /// Network base address.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    /// Last address in the subnet (the broadcast address for IPv4).
    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        (u32::from(ip) & self.mask()) == u32::from(self.network())
    }

    /// Address at position `n` in the subnet; negative positions count from
    /// the end, with -1 being the last address.
    pub fn nth(&self, n: i64) -> Ipv4Addr {
        if n >= 0 {
            Ipv4Addr::from(u32::from(self.network()).wrapping_add(n as u32))
        } else {
            Ipv4Addr::from(u32::from(self.last()).wrapping_add((n + 1) as u32))
        }
    }

    /// "network/prefix" form.
    pub fn subnet_string(&self) -> String {
        format!("{}/{}", self.network(), self.prefix)
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Cidr {
    pub addr: Ipv6Addr,
    pub prefix: u8,
}

impl Ipv6Cidr {
    pub fn parse(s: &str) -> NetworkResult<Self> {
        let (addr, prefix) = split_cidr(s)?;
        let addr: Ipv6Addr = addr
            .parse()
            .map_err(|_| NetworkError::Validation(format!("invalid IPv6 CIDR '{}'", s)))?;
        if prefix > 128 {
            return Err(NetworkError::Validation(format!(
                "invalid IPv6 prefix length in '{}'",
                s
            )));
        }
        Ok(Self { addr, prefix })
    }

    fn mask(&self) -> u128 {
        if self.prefix == 0 {
            0
        } else {
            (!0u128) << (128 - self.prefix)
        }
    }

    pub fn network(&self) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.addr) & self.mask())
    }

    pub fn last(&self) -> Ipv6Addr {
        Ipv6Addr::from(u128::from(self.network()) | !self.mask())
    }

    pub fn contains(&self, ip: Ipv6Addr) -> bool {
        (u128::from(ip) & self.mask()) == u128::from(self.network())
    }

    pub fn nth(&self, n: i64) -> Ipv6Addr {
        if n >= 0 {
            Ipv6Addr::from(u128::from(self.network()).wrapping_add(n as u128))
        } else {
            Ipv6Addr::from(u128::from(self.last()).wrapping_add((n + 1) as u128))
        }
    }

    pub fn subnet_string(&self) -> String {
        format!("{}/{}", self.network(), self.prefix)
    }
}

impl std::fmt::Display for Ipv6Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

fn split_cidr(s: &str) -> NetworkResult<(&str, u8)> {
    let mut parts = s.splitn(2, '/');
    let addr = parts.next().unwrap_or("");
    let prefix = parts
        .next()
        .ok_or_else(|| NetworkError::Validation(format!("'{}' is not in CIDR notation", s)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| NetworkError::Validation(format!("invalid prefix length in '{}'", s)))?;
    Ok((addr, prefix))
}

// ── DHCP ranges ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

/// Parse "start-end[,start-end...]" into ranges of one family, each inside
/// the given subnet, with start <= end in network order.
pub fn parse_dhcp_ranges_v4(value: &str, subnet: &Ipv4Cidr) -> NetworkResult<Vec<DhcpRange>> {
    let mut ranges = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (start_s, end_s) = part.split_once('-').ok_or_else(|| {
            NetworkError::Validation(format!("DHCP range '{}' is not 'start-end'", part))
        })?;
        let start: Ipv4Addr = start_s.trim().parse().map_err(|_| {
            NetworkError::Validation(format!("invalid DHCP range start '{}'", start_s))
        })?;
        let end: Ipv4Addr = end_s
            .trim()
            .parse()
            .map_err(|_| NetworkError::Validation(format!("invalid DHCP range end '{}'", end_s)))?;
        if u32::from(start) > u32::from(end) {
            return Err(NetworkError::Validation(format!(
                "DHCP range start {} is after end {}",
                start, end
            )));
        }
        if !subnet.contains(start) || !subnet.contains(end) {
            return Err(NetworkError::Validation(format!(
                "DHCP range {}-{} is outside subnet {}",
                start,
                end,
                subnet.subnet_string()
            )));
        }
        ranges.push(DhcpRange {
            start: IpAddr::V4(start),
            end: IpAddr::V4(end),
        });
    }
    Ok(ranges)
}

pub fn parse_dhcp_ranges_v6(value: &str, subnet: &Ipv6Cidr) -> NetworkResult<Vec<DhcpRange>> {
    let mut ranges = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (start_s, end_s) = part.split_once('-').ok_or_else(|| {
            NetworkError::Validation(format!("DHCP range '{}' is not 'start-end'", part))
        })?;
        let start: Ipv6Addr = start_s.trim().parse().map_err(|_| {
            NetworkError::Validation(format!("invalid DHCP range start '{}'", start_s))
        })?;
        let end: Ipv6Addr = end_s
            .trim()
            .parse()
            .map_err(|_| NetworkError::Validation(format!("invalid DHCP range end '{}'", end_s)))?;
        if u128::from(start) > u128::from(end) {
            return Err(NetworkError::Validation(format!(
                "DHCP range start {} is after end {}",
                start, end
            )));
        }
        if !subnet.contains(start) || !subnet.contains(end) {
            return Err(NetworkError::Validation(format!(
                "DHCP range {}-{} is outside subnet {}",
                start,
                end,
                subnet.subnet_string()
            )));
        }
        ranges.push(DhcpRange {
            start: IpAddr::V6(start),
            end: IpAddr::V6(end),
        });
    }
    Ok(ranges)
}

/// Default IPv4 DHCP range: [subnet+2, subnet-2].
pub fn default_dhcp_range_v4(subnet: &Ipv4Cidr) -> (Ipv4Addr, Ipv4Addr) {
    (subnet.nth(2), subnet.nth(-2))
}

/// Default IPv6 DHCP range: [subnet+2, subnet-1].
pub fn default_dhcp_range_v6(subnet: &Ipv6Cidr) -> (Ipv6Addr, Ipv6Addr) {
    (subnet.nth(2), subnet.nth(-1))
}

// ── Validation ────────────────────────────────────────────────────────

fn check_bool(v: &str) -> NetworkResult<()> {
    match v.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" | "false" | "0" | "no" | "off" => Ok(()),
        _ => Err(NetworkError::Validation(format!("'{}' is not a boolean", v))),
    }
}

fn check_ipv4(v: &str) -> NetworkResult<()> {
    v.parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| NetworkError::Validation(format!("'{}' is not an IPv4 address", v)))
}

fn check_ipv6(v: &str) -> NetworkResult<()> {
    v.parse::<Ipv6Addr>()
        .map(|_| ())
        .map_err(|_| NetworkError::Validation(format!("'{}' is not an IPv6 address", v)))
}

fn check_ip(v: &str) -> NetworkResult<()> {
    v.parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| NetworkError::Validation(format!("'{}' is not an IP address", v)))
}

fn check_addr_or_none_v4(v: &str) -> NetworkResult<()> {
    if v == "none" {
        return Ok(());
    }
    Ipv4Cidr::parse(v).map(|_| ())
}

fn check_addr_or_none_v6(v: &str) -> NetworkResult<()> {
    if v == "none" {
        return Ok(());
    }
    Ipv6Cidr::parse(v).map(|_| ())
}

fn check_uint(v: &str, what: &str) -> NetworkResult<()> {
    v.parse::<u32>()
        .map(|_| ())
        .map_err(|_| NetworkError::Validation(format!("'{}' is not a valid {}", v, what)))
}

fn check_one_of(v: &str, allowed: &[&str]) -> NetworkResult<()> {
    if allowed.contains(&v) {
        Ok(())
    } else {
        Err(NetworkError::Validation(format!(
            "'{}' is not one of {:?}",
            v, allowed
        )))
    }
}

fn check_mac(v: &str) -> NetworkResult<()> {
    crate::net::netlink::parse_mac(v).map(|_| ())
}

fn check_any(_v: &str) -> NetworkResult<()> {
    Ok(())
}

fn check_cidr_list_v4(v: &str) -> NetworkResult<()> {
    for part in v.split(',') {
        Ipv4Cidr::parse(part.trim())?;
    }
    Ok(())
}

fn check_cidr_list_v6(v: &str) -> NetworkResult<()> {
    for part in v.split(',') {
        Ipv6Cidr::parse(part.trim())?;
    }
    Ok(())
}

fn check_asn(v: &str) -> NetworkResult<()> {
    match v.parse::<u64>() {
        Ok(asn) if (1..=4294967294).contains(&asn) => Ok(()),
        _ => Err(NetworkError::Validation(format!(
            "'{}' is not a valid ASN (1-4294967294)",
            v
        ))),
    }
}

/// Validate a full network config map. Unknown non-user keys fail; empty
/// values mean "unset, use default" and skip format checks.
pub fn validate_config(name: &str, config: &HashMap<String, String>) -> NetworkResult<()> {
    validate_network_name(name)?;

    for (key, value) in config {
        // User keys are opaque and never validated.
        if key.starts_with("user.") {
            continue;
        }
        if value.is_empty() {
            if known_key(key) {
                continue;
            }
            return Err(NetworkError::Validation(format!(
                "invalid option '{}' for network '{}'",
                key, name
            )));
        }

        let result = match key.as_str() {
            "bridge.driver" => check_one_of(value, &["native", "openvswitch"]),
            "bridge.mode" => check_one_of(value, &["standard", "fan"]),
            "bridge.mtu" => check_uint(value, "MTU"),
            "bridge.hwaddr" => check_mac(value),
            "bridge.external_interfaces" => {
                for part in value.split(',') {
                    let part = part.trim();
                    if part.is_empty() || part.len() > 15 || part.contains('/') {
                        return Err(NetworkError::Validation(format!(
                            "invalid interface name '{}' in bridge.external_interfaces",
                            part
                        )));
                    }
                }
                Ok(())
            }
            "ipv4.address" => check_addr_or_none_v4(value),
            "ipv6.address" => check_addr_or_none_v6(value),
            "ipv4.nat" | "ipv6.nat" | "ipv4.firewall" | "ipv6.firewall" | "ipv4.routing"
            | "ipv6.routing" | "ipv4.dhcp" | "ipv6.dhcp" | "ipv6.dhcp.stateful" => {
                check_bool(value)
            }
            "ipv4.nat.address" => check_ipv4(value),
            "ipv6.nat.address" => check_ipv6(value),
            "ipv4.nat.order" | "ipv6.nat.order" => check_one_of(value, &["before", "after"]),
            "ipv4.dhcp.expiry" | "ipv6.dhcp.expiry" => check_any(value),
            "ipv4.dhcp.gateway" => check_ipv4(value),
            "ipv4.dhcp.ranges" => {
                let subnet = config
                    .get("ipv4.address")
                    .filter(|v| !v.is_empty() && *v != "none")
                    .ok_or_else(|| {
                        NetworkError::Validation(
                            "ipv4.dhcp.ranges requires ipv4.address".to_string(),
                        )
                    })?;
                let subnet = Ipv4Cidr::parse(subnet)?;
                parse_dhcp_ranges_v4(value, &subnet).map(|_| ())
            }
            "ipv6.dhcp.ranges" => {
                let subnet = config
                    .get("ipv6.address")
                    .filter(|v| !v.is_empty() && *v != "none")
                    .ok_or_else(|| {
                        NetworkError::Validation(
                            "ipv6.dhcp.ranges requires ipv6.address".to_string(),
                        )
                    })?;
                let subnet = Ipv6Cidr::parse(subnet)?;
                parse_dhcp_ranges_v6(value, &subnet).map(|_| ())
            }
            "ipv4.routes" => check_cidr_list_v4(value),
            "ipv6.routes" => check_cidr_list_v6(value),
            "fan.type" => check_one_of(value, &["ipip", "vxlan"]),
            "fan.underlay_subnet" | "fan.overlay_subnet" => Ipv4Cidr::parse(value).map(|_| ()),
            "dns.domain" => check_any(value),
            "dns.mode" => check_one_of(value, &["managed", "dynamic", "none"]),
            "raw.dnsmasq" => check_any(value),
            "bgp.ipv4.nexthop" => check_ipv4(value),
            "bgp.ipv6.nexthop" => check_ipv6(value),
            "volatile.network.ipv4.address" => check_ipv4(value),
            "volatile.network.ipv6.address" => check_ipv6(value),
            k if k.starts_with("tunnel.") => validate_tunnel_key(k, value),
            k if k.starts_with("bgp.peers.") => validate_bgp_peer_key(k, value),
            _ => Err(NetworkError::Validation(format!(
                "invalid option '{}' for network '{}'",
                key, name
            ))),
        };

        result.map_err(|e| {
            NetworkError::Validation(format!("invalid value for option '{}': {}", key, e))
        })?;
    }

    Ok(())
}

fn known_key(key: &str) -> bool {
    const KNOWN: &[&str] = &[
        "bridge.driver",
        "bridge.mode",
        "bridge.mtu",
        "bridge.hwaddr",
        "bridge.external_interfaces",
        "ipv4.address",
        "ipv6.address",
        "ipv4.nat",
        "ipv6.nat",
        "ipv4.nat.address",
        "ipv6.nat.address",
        "ipv4.nat.order",
        "ipv6.nat.order",
        "ipv4.firewall",
        "ipv6.firewall",
        "ipv4.routing",
        "ipv6.routing",
        "ipv4.dhcp",
        "ipv6.dhcp",
        "ipv4.dhcp.expiry",
        "ipv6.dhcp.expiry",
        "ipv4.dhcp.gateway",
        "ipv4.dhcp.ranges",
        "ipv6.dhcp.ranges",
        "ipv6.dhcp.stateful",
        "ipv4.routes",
        "ipv6.routes",
        "fan.type",
        "fan.underlay_subnet",
        "fan.overlay_subnet",
        "dns.domain",
        "dns.mode",
        "raw.dnsmasq",
        "bgp.ipv4.nexthop",
        "bgp.ipv6.nexthop",
        "volatile.network.ipv4.address",
        "volatile.network.ipv6.address",
    ];
    KNOWN.contains(&key) || key.starts_with("tunnel.") || key.starts_with("bgp.peers.")
}

fn validate_tunnel_key(key: &str, value: &str) -> NetworkResult<()> {
    let fields: Vec<&str> = key.split('.').collect();
    if fields.len() != 3 {
        return Err(NetworkError::Validation(format!(
            "invalid tunnel configuration key '{}'",
            key
        )));
    }
    match fields[2] {
        "protocol" => check_one_of(value, &["gre", "vxlan"]),
        "local" | "remote" => check_ip(value),
        "group" => check_ipv4(value),
        "interface" => {
            if value.len() > 15 {
                Err(NetworkError::Validation(format!(
                    "invalid interface name '{}'",
                    value
                )))
            } else {
                Ok(())
            }
        }
        "port" => value
            .parse::<u16>()
            .map(|_| ())
            .map_err(|_| NetworkError::Validation(format!("'{}' is not a valid port", value))),
        "id" => check_uint(value, "tunnel id"),
        "ttl" => value
            .parse::<u8>()
            .map(|_| ())
            .map_err(|_| NetworkError::Validation(format!("'{}' is not a valid TTL", value))),
        other => Err(NetworkError::Validation(format!(
            "unknown tunnel option '{}'",
            other
        ))),
    }
}

fn validate_bgp_peer_key(key: &str, value: &str) -> NetworkResult<()> {
    let fields: Vec<&str> = key.split('.').collect();
    if fields.len() != 4 {
        return Err(NetworkError::Validation(format!(
            "invalid BGP configuration key '{}'",
            key
        )));
    }
    match fields[3] {
        "address" => check_ip(value),
        "asn" => check_asn(value),
        "password" => check_any(value),
        other => Err(NetworkError::Validation(format!(
            "unknown BGP peer option '{}'",
            other
        ))),
    }
}

// ── Diffing ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConfigDiff {
    /// All keys whose value changed, sorted.
    pub changed: Vec<String>,
    /// Changed keys without a "user." prefix, sorted.
    pub changed_non_user: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// True when every changed key is a user key (no kernel effect).
    pub fn user_only(&self) -> bool {
        self.changed_non_user.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.changed.iter().any(|k| k == key)
    }
}

pub fn diff_config(
    old: &HashMap<String, String>,
    new: &HashMap<String, String>,
) -> ConfigDiff {
    let mut changed = BTreeSet::new();
    for (k, v) in old {
        if new.get(k).map(|s| s.as_str()).unwrap_or("") != v {
            changed.insert(k.clone());
        }
    }
    for (k, v) in new {
        if old.get(k).map(|s| s.as_str()).unwrap_or("") != v {
            changed.insert(k.clone());
        }
    }

    let changed: Vec<String> = changed.into_iter().collect();
    let changed_non_user = changed
        .iter()
        .filter(|k| !k.starts_with("user."))
        .cloned()
        .collect();
    ConfigDiff {
        changed,
        changed_non_user,
    }
}

// ── Typed projection ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeDriver {
    Native,
    Openvswitch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanType {
    Ipip,
    Vxlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMode {
    Managed,
    Dynamic,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProtocol {
    Gre,
    Vxlan,
}

#[derive(Debug, Clone)]
pub struct V4Config {
    pub cidr: Ipv4Cidr,
    pub nat: bool,
    pub nat_address: Option<Ipv4Addr>,
    pub nat_append: bool,
    pub firewall: bool,
    pub routing: bool,
    pub dhcp: bool,
    pub dhcp_expiry: String,
    pub dhcp_gateway: Option<Ipv4Addr>,
    pub dhcp_ranges: Vec<DhcpRange>,
    pub routes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct V6Config {
    pub cidr: Ipv6Cidr,
    pub nat: bool,
    pub nat_address: Option<Ipv6Addr>,
    pub nat_append: bool,
    pub firewall: bool,
    pub routing: bool,
    pub dhcp: bool,
    pub dhcp_stateful: bool,
    pub dhcp_expiry: String,
    pub dhcp_ranges: Vec<DhcpRange>,
    pub routes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FanConfig {
    pub fan_type: FanType,
    pub underlay: Option<Ipv4Cidr>,
    pub overlay: Ipv4Cidr,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub name: String,
    pub protocol: TunnelProtocol,
    pub local: Option<IpAddr>,
    pub remote: Option<IpAddr>,
    pub group: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub port: u16,
    pub id: u32,
    pub ttl: u8,
}

#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub driver: BridgeDriver,
    pub mtu_override: Option<u32>,
    pub hwaddr: Option<String>,
    pub external_interfaces: Vec<String>,
    pub v4: Option<V4Config>,
    pub v6: Option<V6Config>,
    pub fan: Option<FanConfig>,
    pub dns_domain: String,
    pub dns_mode: DnsMode,
    pub raw_dnsmasq: String,
    pub tunnels: Vec<TunnelConfig>,
}

impl ParsedConfig {
    pub fn parse(config: &HashMap<String, String>) -> NetworkResult<Self> {
        let get = |key: &str| config.get(key).map(|s| s.as_str()).unwrap_or("");

        let driver = match get("bridge.driver") {
            "" | "native" => BridgeDriver::Native,
            "openvswitch" => BridgeDriver::Openvswitch,
            other => {
                return Err(NetworkError::Validation(format!(
                    "unknown bridge.driver '{}'",
                    other
                )))
            }
        };

        let mtu_override = match get("bridge.mtu") {
            "" => None,
            v => Some(v.parse::<u32>().map_err(|_| {
                NetworkError::Validation(format!("invalid bridge.mtu '{}'", v))
            })?),
        };

        let hwaddr = match get("bridge.hwaddr") {
            "" => None,
            v => Some(v.to_string()),
        };

        let external_interfaces: Vec<String> = get("bridge.external_interfaces")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let v4 = if addr_is_set(config, "ipv4.address") {
            let cidr = Ipv4Cidr::parse(get("ipv4.address"))?;
            let dhcp_ranges = match get("ipv4.dhcp.ranges") {
                "" => Vec::new(),
                v => parse_dhcp_ranges_v4(v, &cidr)?,
            };
            Some(V4Config {
                cidr,
                nat: enabled(config, "ipv4.nat", false),
                nat_address: match get("ipv4.nat.address") {
                    "" => None,
                    v => Some(v.parse().map_err(|_| {
                        NetworkError::Validation(format!("invalid ipv4.nat.address '{}'", v))
                    })?),
                },
                nat_append: get("ipv4.nat.order") == "after",
                firewall: enabled(config, "ipv4.firewall", true),
                routing: enabled(config, "ipv4.routing", true),
                dhcp: enabled(config, "ipv4.dhcp", true),
                dhcp_expiry: match get("ipv4.dhcp.expiry") {
                    "" => "1h".to_string(),
                    v => v.to_string(),
                },
                dhcp_gateway: match get("ipv4.dhcp.gateway") {
                    "" => None,
                    v => Some(v.parse().map_err(|_| {
                        NetworkError::Validation(format!("invalid ipv4.dhcp.gateway '{}'", v))
                    })?),
                },
                dhcp_ranges,
                routes: split_list(get("ipv4.routes")),
            })
        } else {
            None
        };

        let v6 = if addr_is_set(config, "ipv6.address") {
            let cidr = Ipv6Cidr::parse(get("ipv6.address"))?;
            let dhcp_ranges = match get("ipv6.dhcp.ranges") {
                "" => Vec::new(),
                v => parse_dhcp_ranges_v6(v, &cidr)?,
            };
            Some(V6Config {
                cidr,
                nat: enabled(config, "ipv6.nat", false),
                nat_address: match get("ipv6.nat.address") {
                    "" => None,
                    v => Some(v.parse().map_err(|_| {
                        NetworkError::Validation(format!("invalid ipv6.nat.address '{}'", v))
                    })?),
                },
                nat_append: get("ipv6.nat.order") == "after",
                firewall: enabled(config, "ipv6.firewall", true),
                routing: enabled(config, "ipv6.routing", true),
                dhcp: enabled(config, "ipv6.dhcp", true),
                dhcp_stateful: enabled(config, "ipv6.dhcp.stateful", false),
                dhcp_expiry: match get("ipv6.dhcp.expiry") {
                    "" => "1h".to_string(),
                    v => v.to_string(),
                },
                dhcp_ranges,
                routes: split_list(get("ipv6.routes")),
            })
        } else {
            None
        };

        let fan = if get("bridge.mode") == "fan" {
            let fan_type = match get("fan.type") {
                "ipip" => FanType::Ipip,
                "" | "vxlan" => FanType::Vxlan,
                other => {
                    return Err(NetworkError::Validation(format!(
                        "unknown fan.type '{}'",
                        other
                    )))
                }
            };
            let underlay = match get("fan.underlay_subnet") {
                "" => None,
                v => Some(Ipv4Cidr::parse(v)?),
            };
            let overlay = match get("fan.overlay_subnet") {
                "" => Ipv4Cidr::parse("240.0.0.0/8")?,
                v => Ipv4Cidr::parse(v)?,
            };
            Some(FanConfig {
                fan_type,
                underlay,
                overlay,
            })
        } else {
            None
        };

        let dns_domain = match get("dns.domain") {
            "" => "warren".to_string(),
            v => v.to_string(),
        };

        let dns_mode = match get("dns.mode") {
            "" | "managed" => DnsMode::Managed,
            "dynamic" => DnsMode::Dynamic,
            "none" => DnsMode::None,
            other => {
                return Err(NetworkError::Validation(format!(
                    "unknown dns.mode '{}'",
                    other
                )))
            }
        };

        let tunnels = parse_tunnels(config)?;

        Ok(Self {
            driver,
            mtu_override,
            hwaddr,
            external_interfaces,
            v4,
            v6,
            fan,
            dns_domain,
            dns_mode,
            raw_dnsmasq: get("raw.dnsmasq").to_string(),
            tunnels,
        })
    }

    /// Whether dnsmasq needs to run at all for this config.
    pub fn wants_dnsmasq(&self) -> bool {
        self.fan.is_some() || self.v4.is_some() || self.v6.is_some()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Collect tunnel configs from "tunnel.<peer>.*" keys, skipping peers with
/// partial configuration (GRE without both endpoints, or no protocol).
fn parse_tunnels(config: &HashMap<String, String>) -> NetworkResult<Vec<TunnelConfig>> {
    let mut names = BTreeSet::new();
    for key in config.keys() {
        if let Some(rest) = key.strip_prefix("tunnel.") {
            if let Some((peer, _)) = rest.split_once('.') {
                names.insert(peer.to_string());
            }
        }
    }

    let mut tunnels = Vec::new();
    for name in names {
        let get = |field: &str| {
            config
                .get(&format!("tunnel.{}.{}", name, field))
                .map(|s| s.as_str())
                .unwrap_or("")
        };

        let protocol = match get("protocol") {
            "gre" => TunnelProtocol::Gre,
            "vxlan" => TunnelProtocol::Vxlan,
            // Partial configs are skipped, matching the create-time leniency
            // for tunnels being assembled key by key.
            "" => continue,
            other => {
                return Err(NetworkError::Validation(format!(
                    "unknown tunnel protocol '{}'",
                    other
                )))
            }
        };

        let parse_ip = |field: &str| -> NetworkResult<Option<IpAddr>> {
            match get(field) {
                "" => Ok(None),
                v => Ok(Some(v.parse().map_err(|_| {
                    NetworkError::Validation(format!("invalid tunnel.{}.{} '{}'", name, field, v))
                })?)),
            }
        };

        let local = parse_ip("local")?;
        let remote = parse_ip("remote")?;

        if protocol == TunnelProtocol::Gre && (local.is_none() || remote.is_none()) {
            continue;
        }

        tunnels.push(TunnelConfig {
            name: name.clone(),
            protocol,
            local,
            remote,
            group: match get("group") {
                "" => None,
                v => Some(v.parse().map_err(|_| {
                    NetworkError::Validation(format!("invalid tunnel.{}.group '{}'", name, v))
                })?),
            },
            interface: match get("interface") {
                "" => None,
                v => Some(v.to_string()),
            },
            port: match get("port") {
                "" => 0,
                v => v.parse().map_err(|_| {
                    NetworkError::Validation(format!("invalid tunnel.{}.port '{}'", name, v))
                })?,
            },
            id: match get("id") {
                "" => 1,
                v => v.parse().map_err(|_| {
                    NetworkError::Validation(format!("invalid tunnel.{}.id '{}'", name, v))
                })?,
            },
            ttl: match get("ttl") {
                "" => 1,
                v => v.parse().map_err(|_| {
                    NetworkError::Validation(format!("invalid tunnel.{}.ttl '{}'", name, v))
                })?,
            },
        });
    }

    Ok(tunnels)
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
    fn truthiness() {
        assert!(is_true("true"));
        assert!(is_true("1"));
        assert!(is_true("YES"));
        assert!(!is_true("false"));
        assert!(!is_true(""));
    }

    #[test]
    fn network_names() {
        assert!(validate_network_name("br0").is_ok());
        assert!(validate_network_name("my-net.42").is_ok());
        assert!(validate_network_name("").is_err());
        assert!(validate_network_name("has:colon").is_err());
        assert!(validate_network_name("way-too-long-for-an-interface").is_err());
        assert!(validate_network_name("no spaces").is_err());
    }

    #[test]
    fn cidr_math() {
        let c = Ipv4Cidr::parse("10.0.0.1/24").unwrap();
        assert_eq!(c.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(c.last(), Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(c.nth(2), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(c.nth(-1), Ipv4Addr::new(10, 0, 0, 255));
        assert_eq!(c.nth(-2), Ipv4Addr::new(10, 0, 0, 254));
        assert!(c.contains(Ipv4Addr::new(10, 0, 0, 77)));
        assert!(!c.contains(Ipv4Addr::new(10, 0, 1, 1)));
        assert_eq!(c.subnet_string(), "10.0.0.0/24");

        assert!(Ipv4Cidr::parse("10.0.0.1").is_err());
        assert!(Ipv4Cidr::parse("10.0.0.1/33").is_err());
    }

    #[test]
    fn default_ranges() {
        let v4 = Ipv4Cidr::parse("10.0.0.1/24").unwrap();
        let (start, end) = default_dhcp_range_v4(&v4);
        assert_eq!(start, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(end, Ipv4Addr::new(10, 0, 0, 254));

        let v6 = Ipv6Cidr::parse("fd42:1234::1/64").unwrap();
        let (start, end) = default_dhcp_range_v6(&v6);
        assert_eq!(start, "fd42:1234::2".parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            end,
            "fd42:1234::ffff:ffff:ffff:ffff".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn explicit_ranges() {
        let subnet = Ipv4Cidr::parse("10.0.0.1/24").unwrap();
        let ranges = parse_dhcp_ranges_v4("10.0.0.10-10.0.0.50, 10.0.0.60-10.0.0.70", &subnet)
            .unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, "10.0.0.10".parse::<IpAddr>().unwrap());

        // Start after end.
        assert!(parse_dhcp_ranges_v4("10.0.0.50-10.0.0.10", &subnet).is_err());
        // Outside the subnet.
        assert!(parse_dhcp_ranges_v4("10.0.1.10-10.0.1.50", &subnet).is_err());
        // Bad syntax.
        assert!(parse_dhcp_ranges_v4("10.0.0.10", &subnet).is_err());
    }

    #[test]
    fn validation_accepts_reasonable_config() {
        let config = cfg(&[
            ("ipv4.address", "10.0.0.1/24"),
            ("ipv4.nat", "true"),
            ("ipv6.address", "none"),
            ("dns.domain", "warren"),
            ("user.mykey", "whatever I want"),
            ("tunnel.peer1.protocol", "vxlan"),
            ("tunnel.peer1.id", "5"),
            ("bgp.peers.up1.address", "192.0.2.1"),
            ("bgp.peers.up1.asn", "65001"),
        ]);
        validate_config("testbr", &config).unwrap();
    }

    #[test]
    fn validation_rejects_unknown_keys() {
        let config = cfg(&[("ipv4.addres", "10.0.0.1/24")]);
        assert!(validate_config("testbr", &config).is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(validate_config("t", &cfg(&[("ipv4.address", "10.0.0.1")])).is_err());
        assert!(validate_config("t", &cfg(&[("bridge.driver", "linuxbridge")])).is_err());
        assert!(validate_config("t", &cfg(&[("bgp.peers.x.asn", "0")])).is_err());
        assert!(validate_config("t", &cfg(&[("bgp.peers.x.asn", "4294967295")])).is_err());
        assert!(validate_config("t", &cfg(&[("tunnel.a.protocol", "geneve")])).is_err());
        assert!(validate_config("t", &cfg(&[("ipv4.nat", "maybe")])).is_err());
    }

    #[test]
    fn node_specific_masking() {
        let config = cfg(&[
            ("ipv4.address", "10.0.0.1/24"),
            ("bridge.external_interfaces", "eth1"),
            ("bgp.peers.up1.address", "192.0.2.1"),
            ("bgp.peers.up1.asn", "65001"),
            ("volatile.network.ipv4.address", "192.0.2.5"),
            ("user.note", "kept"),
        ]);
        let stripped = strip_node_specific(&config);
        assert!(stripped.contains_key("ipv4.address"));
        assert!(stripped.contains_key("user.note"));
        assert!(!stripped.contains_key("bridge.external_interfaces"));
        assert!(!stripped.keys().any(|k| k.starts_with("bgp.peers.")));
        assert!(!stripped.keys().any(|k| k.starts_with("volatile.")));
    }

    #[test]
    fn diff_classification() {
        let old = cfg(&[("ipv4.nat", "true"), ("user.a", "1")]);
        let new = cfg(&[("ipv4.nat", "true"), ("user.a", "2")]);
        let diff = diff_config(&old, &new);
        assert!(diff.user_only());
        assert_eq!(diff.changed, vec!["user.a".to_string()]);

        let new = cfg(&[("ipv4.nat", "false"), ("user.a", "1")]);
        let diff = diff_config(&old, &new);
        assert!(!diff.user_only());
        assert_eq!(diff.changed_non_user, vec!["ipv4.nat".to_string()]);

        // Removed keys count as changed.
        let new = cfg(&[("user.a", "1")]);
        let diff = diff_config(&old, &new);
        assert!(diff.contains("ipv4.nat"));

        let diff = diff_config(&old, &old);
        assert!(diff.is_empty());
    }

    #[test]
    fn parsed_config_defaults() {
        let config = cfg(&[("ipv4.address", "10.0.0.1/24")]);
        let parsed = ParsedConfig::parse(&config).unwrap();
        assert_eq!(parsed.driver, BridgeDriver::Native);
        assert_eq!(parsed.dns_domain, "warren");
        assert_eq!(parsed.dns_mode, DnsMode::Managed);
        assert!(parsed.wants_dnsmasq());
        let v4 = parsed.v4.unwrap();
        assert!(!v4.nat);
        assert!(v4.firewall);
        assert!(v4.routing);
        assert!(v4.dhcp);
        assert_eq!(v4.dhcp_expiry, "1h");
        assert!(parsed.v6.is_none());
        assert!(parsed.fan.is_none());
    }

    #[test]
    fn parsed_config_fan_defaults() {
        let config = cfg(&[
            ("bridge.mode", "fan"),
            ("fan.underlay_subnet", "192.168.1.0/24"),
        ]);
        let parsed = ParsedConfig::parse(&config).unwrap();
        let fan = parsed.fan.unwrap();
        assert_eq!(fan.fan_type, FanType::Vxlan);
        assert_eq!(fan.overlay.subnet_string(), "240.0.0.0/8");
    }

    #[test]
    fn parsed_config_tunnels() {
        let config = cfg(&[
            ("tunnel.a.protocol", "gre"),
            ("tunnel.a.local", "192.0.2.1"),
            ("tunnel.a.remote", "192.0.2.2"),
            ("tunnel.b.protocol", "vxlan"),
            ("tunnel.b.group", "239.0.0.5"),
            ("tunnel.b.port", "4789"),
            // Partial GRE config is skipped.
            ("tunnel.c.protocol", "gre"),
            ("tunnel.c.local", "192.0.2.3"),
        ]);
        let parsed = ParsedConfig::parse(&config).unwrap();
        assert_eq!(parsed.tunnels.len(), 2);
        assert_eq!(parsed.tunnels[0].name, "a");
        assert_eq!(parsed.tunnels[0].protocol, TunnelProtocol::Gre);
        assert_eq!(parsed.tunnels[1].name, "b");
        assert_eq!(parsed.tunnels[1].port, 4789);
        assert_eq!(parsed.tunnels[1].id, 1);
        assert_eq!(parsed.tunnels[1].ttl, 1);
    }

    #[test]
    fn empty_values_mean_unset() {
        let config = cfg(&[("ipv4.address", ""), ("bridge.mtu", "")]);
        validate_config("t", &config).unwrap();
        let parsed = ParsedConfig::parse(&config).unwrap();
        assert!(parsed.v4.is_none());
        assert!(parsed.mtu_override.is_none());
        assert!(!parsed.wants_dnsmasq());
    }
}
