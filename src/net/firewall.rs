// Firewall policy layer: translates network intent into tagged
// iptables/ip6tables rule groups.
//
// Every rule carries a comment tag, "warren-<network>-<table>-<purpose>" for
// network-owned rules and "warren-<project>-<instance>-<device>-<purpose>"
// for per-device rules. Clearing scans the live rule set for the tag, so no
// local bookkeeping is needed and clears are idempotent.

use crate::net::error::{NetworkError, NetworkResult};
use crate::net::netlink::run_cmd;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn bin(&self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    fn save_bin(&self) -> &'static str {
        match self {
            Family::V4 => "iptables-save",
            Family::V6 => "ip6tables-save",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Mangle,
    Nat,
    Raw,
    All,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Mangle => "mangle",
            Table::Nat => "nat",
            Table::Raw => "raw",
            Table::All => "all",
        }
    }

    fn concrete(&self) -> Vec<Table> {
        match self {
            Table::All => vec![Table::Filter, Table::Mangle, Table::Nat, Table::Raw],
            t => vec![*t],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Prepend,
    Append,
}

/// Tag for rules owned by a network, scoped to one table.
pub fn network_tag(network: &str, table: Table, purpose: &str) -> String {
    format!("warren-{}-{}-{}", network, table.name(), purpose)
}

/// Prefix matching every rule a network owns in one table.
fn network_tag_prefix(network: &str, table: Table) -> String {
    format!("warren-{}-{}-", network, table.name())
}

/// Tag for rules owned by an instance device.
pub fn instance_tag(project: &str, instance: &str, device: &str, purpose: &str) -> String {
    format!("warren-{}-{}-{}-{}", project, instance, device, purpose)
}

fn instance_tag_prefix(project: &str, instance: &str, device: &str) -> String {
    format!("warren-{}-{}-{}-", project, instance, device)
}

/// One listen→connect mapping materialised as NAT rules.
#[derive(Debug, Clone)]
pub struct ProxyNatRule {
    pub v6: bool,
    pub proto: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub connect_host: String,
    pub connect_port: u16,
}

pub struct Firewall;

impl Firewall {
    pub fn new() -> Self {
        Self
    }

    // ── Clears ────────────────────────────────────────────────────────

    /// Remove every rule bearing this network's tag in the given table(s).
    pub async fn network_clear(
        &self,
        family: Family,
        table: Table,
        network: &str,
    ) -> NetworkResult<()> {
        for t in table.concrete() {
            self.clear_tagged(family, t, &network_tag_prefix(network, t))
                .await?;
        }
        Ok(())
    }

    async fn clear_tagged(
        &self,
        family: Family,
        table: Table,
        tag_prefix: &str,
    ) -> NetworkResult<()> {
        let out = match run_cmd(family.save_bin(), &["-t", table.name()]).await {
            Ok(out) => out,
            // A table that was never touched may not exist yet.
            Err(NetworkError::Command { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        for line in out.lines() {
            if !line.starts_with("-A") || !line.contains(tag_prefix) {
                continue;
            }
            let fields = split_rule(line);
            if fields.len() < 2 {
                continue;
            }

            let mut args: Vec<&str> = vec!["-t", table.name(), "-D", &fields[1]];
            args.extend(fields[2..].iter().map(|s| s.as_str()));
            // Racing deletions of the same tag are harmless.
            let _ = run_cmd(family.bin(), &args).await;
        }
        Ok(())
    }

    // ── Network rule groups ───────────────────────────────────────────

    /// Allow or reject forwarded traffic in and out of the bridge.
    pub async fn network_setup_allow_forwarding(
        &self,
        family: Family,
        network: &str,
        action: Action,
    ) -> NetworkResult<()> {
        let target = match action {
            Action::Accept => "ACCEPT",
            Action::Reject => "REJECT",
        };
        let tag = network_tag(network, Table::Filter, "fwd");

        for dir in [["-i", network], ["-o", network]] {
            let args = vec![dir[0], dir[1], "-j", target];
            self.add_rule(
                family,
                Table::Filter,
                "FORWARD",
                Location::Append,
                &args,
                &tag,
            )
            .await?;
        }
        Ok(())
    }

    /// Outbound NAT for the bridge subnet: MASQUERADE, or SNAT when the
    /// caller supplies a source address.
    pub async fn network_setup_nat(
        &self,
        family: Family,
        network: &str,
        location: Location,
        subnet: &str,
        snat_address: Option<IpAddr>,
    ) -> NetworkResult<()> {
        let tag = network_tag(network, Table::Nat, "nat");
        let args = nat_rule_args(subnet, snat_address);
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.add_rule(
            family,
            Table::Nat,
            "POSTROUTING",
            location,
            &arg_refs,
            &tag,
        )
        .await
    }

    /// NAT for the fan overlay subnet.
    pub async fn network_setup_tunnel_nat(
        &self,
        network: &str,
        location: Location,
        overlay_subnet: &str,
    ) -> NetworkResult<()> {
        let tag = network_tag(network, Table::Nat, "fannat");
        let args = nat_rule_args(overlay_subnet, None);
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.add_rule(
            Family::V4,
            Table::Nat,
            "POSTROUTING",
            location,
            &arg_refs,
            &tag,
        )
        .await
    }

    /// Let DHCP/DNS traffic reach the network's resolver even under a
    /// restrictive host policy.
    pub async fn network_setup_ipv4_dns_overrides(&self, network: &str) -> NetworkResult<()> {
        let tag = network_tag(network, Table::Filter, "dns");
        let rules: &[&[&str]] = &[
            &["-i", network, "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
            &["-i", network, "-p", "tcp", "--dport", "53", "-j", "ACCEPT"],
            &["-i", network, "-p", "udp", "--dport", "67", "-j", "ACCEPT"],
        ];
        for args in rules {
            self.add_rule(Family::V4, Table::Filter, "INPUT", Location::Append, args, &tag)
                .await?;
        }
        let out_rules: &[&[&str]] = &[
            &["-o", network, "-p", "udp", "--sport", "53", "-j", "ACCEPT"],
            &["-o", network, "-p", "tcp", "--sport", "53", "-j", "ACCEPT"],
            &["-o", network, "-p", "udp", "--sport", "67", "-j", "ACCEPT"],
        ];
        for args in out_rules {
            self.add_rule(
                Family::V4,
                Table::Filter,
                "OUTPUT",
                Location::Append,
                args,
                &tag,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn network_setup_ipv6_dns_overrides(&self, network: &str) -> NetworkResult<()> {
        let tag = network_tag(network, Table::Filter, "dns");
        let rules: &[&[&str]] = &[
            &["-i", network, "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
            &["-i", network, "-p", "tcp", "--dport", "53", "-j", "ACCEPT"],
            &["-i", network, "-p", "udp", "--dport", "547", "-j", "ACCEPT"],
        ];
        for args in rules {
            self.add_rule(Family::V6, Table::Filter, "INPUT", Location::Append, args, &tag)
                .await?;
        }
        let out_rules: &[&[&str]] = &[
            &["-o", network, "-p", "udp", "--sport", "53", "-j", "ACCEPT"],
            &["-o", network, "-p", "tcp", "--sport", "53", "-j", "ACCEPT"],
            &["-o", network, "-p", "udp", "--sport", "547", "-j", "ACCEPT"],
        ];
        for args in out_rules {
            self.add_rule(
                Family::V6,
                Table::Filter,
                "OUTPUT",
                Location::Append,
                args,
                &tag,
            )
            .await?;
        }
        Ok(())
    }

    /// Recompute UDP checksums on DHCP replies. Some DHCP clients discard
    /// replies with the zero checksum produced by checksum offload.
    pub async fn network_setup_ipv4_dhcp_workaround(&self, network: &str) -> NetworkResult<()> {
        let tag = network_tag(network, Table::Mangle, "dhcp");
        let args = [
            "-o", network, "-p", "udp", "--dport", "68", "-j", "CHECKSUM", "--checksum-fill",
        ];
        self.add_rule(
            Family::V4,
            Table::Mangle,
            "POSTROUTING",
            Location::Append,
            &args,
            &tag,
        )
        .await
    }

    // ── Instance device rule groups ───────────────────────────────────

    /// NAT-mode proxy device: DNAT the listen address to the instance,
    /// with a hairpin SNAT so bridge peers can reach the listen address.
    pub async fn instance_setup_proxy_nat(
        &self,
        project: &str,
        instance: &str,
        device: &str,
        rules: &[ProxyNatRule],
    ) -> NetworkResult<()> {
        let tag = instance_tag(project, instance, device, "proxy");

        for rule in rules {
            let family = if rule.v6 { Family::V6 } else { Family::V4 };
            let connect = format_host_port(&rule.connect_host, rule.connect_port, rule.v6);
            let listen_port = rule.listen_port.to_string();
            let connect_port = rule.connect_port.to_string();

            let mut dnat: Vec<&str> = vec!["-p", &rule.proto];
            if !is_wildcard(&rule.listen_host) {
                dnat.extend(["-d", &rule.listen_host]);
            }
            dnat.extend(["--dport", &listen_port, "-j", "DNAT", "--to-destination", &connect]);

            self.add_rule(family, Table::Nat, "PREROUTING", Location::Append, &dnat, &tag)
                .await?;
            self.add_rule(family, Table::Nat, "OUTPUT", Location::Append, &dnat, &tag)
                .await?;

            // Hairpin: instance talking to its own proxied address.
            let hairpin: Vec<&str> = vec![
                "-p",
                &rule.proto,
                "-s",
                &rule.connect_host,
                "-d",
                &rule.connect_host,
                "--dport",
                &connect_port,
                "-j",
                "MASQUERADE",
            ];
            self.add_rule(
                family,
                Table::Nat,
                "POSTROUTING",
                Location::Append,
                &hairpin,
                &tag,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn instance_clear_proxy_nat(
        &self,
        project: &str,
        instance: &str,
        device: &str,
    ) -> NetworkResult<()> {
        let prefix = instance_tag_prefix(project, instance, device);
        for family in [Family::V4, Family::V6] {
            self.clear_tagged(family, Table::Nat, &prefix).await?;
        }
        Ok(())
    }

    /// Reverse-path filter for a routed NIC's host-side interface: drop
    /// spoofed source addresses arriving from the instance.
    pub async fn instance_setup_rp_filter(
        &self,
        project: &str,
        instance: &str,
        device: &str,
        host_name: &str,
    ) -> NetworkResult<()> {
        let tag = instance_tag(project, instance, device, "rpfilter");
        let args = ["-i", host_name, "-m", "rpfilter", "--invert", "-j", "DROP"];
        for family in [Family::V4, Family::V6] {
            self.add_rule(family, Table::Raw, "PREROUTING", Location::Append, &args, &tag)
                .await?;
        }
        Ok(())
    }

    pub async fn instance_clear_rp_filter(
        &self,
        project: &str,
        instance: &str,
        device: &str,
    ) -> NetworkResult<()> {
        let prefix = instance_tag_prefix(project, instance, device);
        for family in [Family::V4, Family::V6] {
            self.clear_tagged(family, Table::Raw, &prefix).await?;
        }
        Ok(())
    }

    // ── Plumbing ──────────────────────────────────────────────────────

    async fn add_rule(
        &self,
        family: Family,
        table: Table,
        chain: &str,
        location: Location,
        args: &[&str],
        comment: &str,
    ) -> NetworkResult<()> {
        let mut full: Vec<&str> = vec!["-t", table.name()];
        match location {
            Location::Append => full.extend(["-A", chain]),
            Location::Prepend => full.extend(["-I", chain, "1"]),
        }
        full.extend_from_slice(args);
        full.extend(["-m", "comment", "--comment", comment]);

        run_cmd(family.bin(), &full).await.map(|_| ())
    }
}

impl Default for Firewall {
    fn default() -> Self {
        Self::new()
    }
}

/// NAT rule body: MASQUERADE by default, SNAT when an address is pinned.
pub fn nat_rule_args(subnet: &str, snat_address: Option<IpAddr>) -> Vec<String> {
    let mut args = vec![
        "-s".to_string(),
        subnet.to_string(),
        "!".to_string(),
        "-d".to_string(),
        subnet.to_string(),
    ];
    match snat_address {
        Some(addr) => {
            args.extend([
                "-j".to_string(),
                "SNAT".to_string(),
                "--to".to_string(),
                addr.to_string(),
            ]);
        }
        None => args.extend(["-j".to_string(), "MASQUERADE".to_string()]),
    }
    args
}

fn is_wildcard(host: &str) -> bool {
    host == "0.0.0.0" || host == "::"
}

fn format_host_port(host: &str, port: u16, v6: bool) -> String {
    if v6 {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split an iptables-save rule line into fields, honouring the double-quoted
/// comment argument.
fn split_rule(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_identify_owner_and_table() {
        assert_eq!(network_tag("br0", Table::Nat, "nat"), "warren-br0-nat-nat");
        assert_eq!(
            instance_tag("default", "web1", "eth0", "proxy"),
            "warren-default-web1-eth0-proxy"
        );
        assert!(network_tag("br0", Table::Nat, "nat").starts_with(&network_tag_prefix("br0", Table::Nat)));
    }

    #[test]
    fn masquerade_rule_shape() {
        let args = nat_rule_args("10.0.0.0/24", None);
        assert_eq!(
            args,
            vec!["-s", "10.0.0.0/24", "!", "-d", "10.0.0.0/24", "-j", "MASQUERADE"]
        );
    }

    #[test]
    fn snat_rule_shape() {
        let args = nat_rule_args("10.0.0.0/24", Some("192.0.2.10".parse().unwrap()));
        assert_eq!(
            args,
            vec![
                "-s",
                "10.0.0.0/24",
                "!",
                "-d",
                "10.0.0.0/24",
                "-j",
                "SNAT",
                "--to",
                "192.0.2.10"
            ]
        );
    }

    #[test]
    fn rule_splitting_honours_quoted_comments() {
        let line = r#"-A POSTROUTING -s 10.0.0.0/24 -j MASQUERADE -m comment --comment "warren-br0-nat-nat""#;
        let fields = split_rule(line);
        assert_eq!(fields[0], "-A");
        assert_eq!(fields[1], "POSTROUTING");
        assert_eq!(fields.last().unwrap(), "warren-br0-nat-nat");
    }

    #[test]
    fn table_expansion() {
        assert_eq!(Table::All.concrete().len(), 4);
        assert_eq!(Table::Nat.concrete(), vec![Table::Nat]);
    }

    #[test]
    fn host_port_formatting() {
        assert_eq!(format_host_port("10.0.0.5", 80, false), "10.0.0.5:80");
        assert_eq!(format_host_port("fd42::5", 80, true), "[fd42::5]:80");
    }
}
