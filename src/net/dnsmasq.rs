// dnsmasq supervision: one resolver+DHCP daemon per bridge network.
//
// The network config is materialised as argv; raw.dnsmasq goes into a config
// file referenced with --conf-file so user directives never touch the argv.
// The static-hosts directory is rewritten deterministically, one file per
// instance. Stop goes through the pidfile + cmdline verification discipline.

use crate::net::config::{default_dhcp_range_v4, default_dhcp_range_v6, DnsMode, ParsedConfig};
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::overlay::FanAddress;
use crate::net::NetworkPaths;
use crate::utils::fs::{ensure_dir, remove_if_exists, write_atomic};
use crate::utils::process::{adopt, terminate, Supervisor};
use std::path::Path;
use std::time::Duration;

/// Versions above which optional dnsmasq flags become available.
const RAPID_COMMIT_VERSION: &[u32] = &[2, 79];
const QUIET_VERSION: &[u32] = &[2, 67];

/// A dotted version string, compared component-wise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DottedVersion(pub Vec<u32>);

impl DottedVersion {
    pub fn parse(s: &str) -> NetworkResult<Self> {
        let parts: Result<Vec<u32>, _> = s
            .trim()
            .split('.')
            .map(|p| {
                // Tolerate suffixes like "2.90rc1".
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse::<u32>()
            })
            .collect();
        match parts {
            Ok(v) if !v.is_empty() => Ok(Self(v)),
            _ => Err(NetworkError::Validation(format!(
                "cannot parse version '{}'",
                s
            ))),
        }
    }

    pub fn newer_than(&self, other: &[u32]) -> bool {
        let a = &self.0;
        for i in 0..a.len().max(other.len()) {
            let x = a.get(i).copied().unwrap_or(0);
            let y = other.get(i).copied().unwrap_or(0);
            if x != y {
                return x > y;
            }
        }
        false
    }
}

/// Probe the installed dnsmasq version. Missing binary is a precondition
/// failure: managed bridges require dnsmasq.
pub async fn installed_version() -> NetworkResult<DottedVersion> {
    let output = tokio::process::Command::new("dnsmasq")
        .arg("--version")
        .output()
        .await
        .map_err(|_| {
            NetworkError::Precondition("dnsmasq is required for managed bridges".into())
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    // First line: "Dnsmasq version 2.80  Copyright ...".
    let version = stdout
        .split_whitespace()
        .nth(2)
        .ok_or_else(|| NetworkError::Precondition("cannot determine dnsmasq version".into()))?;
    DottedVersion::parse(version)
}

/// Cluster DNS delegation parameters for fan networks.
#[derive(Debug, Clone)]
pub struct ClusterDns {
    /// The address the forkdns forwarder listens on.
    pub address: String,
    /// The overlay subnet delegated for reverse lookups.
    pub overlay_subnet: String,
}

/// Materialise the dnsmasq argv for a network. Pure so the flag set per
/// config shape is testable.
#[allow(clippy::too_many_arguments)]
pub fn build_argv(
    name: &str,
    parsed: &ParsedConfig,
    paths: &NetworkPaths,
    version: &DottedVersion,
    debug: bool,
    unpriv_user: Option<&str>,
    fan_addr: Option<&FanAddress>,
    cluster: Option<&ClusterDns>,
) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "--keep-in-foreground".into(),
        "--strict-order".into(),
        "--bind-interfaces".into(),
        "--except-interface=lo".into(),
        // Without --no-ping lease file updates stall on probe timeouts.
        "--no-ping".into(),
        format!("--interface={}", name),
    ];

    if version.newer_than(RAPID_COMMIT_VERSION) {
        argv.push("--dhcp-rapid-commit".into());
    }
    if !debug && version.newer_than(QUIET_VERSION) {
        argv.extend([
            "--quiet-dhcp".into(),
            "--quiet-dhcp6".into(),
            "--quiet-ra".into(),
        ]);
    }

    let leases = paths.leases().display().to_string();
    let hosts = paths.hosts_dir().display().to_string();
    let mut dhcp_common_added = false;
    let mut add_dhcp_common = |argv: &mut Vec<String>| {
        if !dhcp_common_added {
            argv.extend([
                "--dhcp-no-override".into(),
                "--dhcp-authoritative".into(),
                format!("--dhcp-leasefile={}", leases),
                format!("--dhcp-hostsfile={}", hosts),
            ]);
            dhcp_common_added = true;
        }
    };

    if let Some(v4) = &parsed.v4 {
        argv.push(format!("--listen-address={}", v4.cidr.addr));
        if v4.dhcp {
            add_dhcp_common(&mut argv);

            if let Some(gw) = v4.dhcp_gateway {
                argv.push(format!("--dhcp-option=3,{}", gw));
            }

            if v4.dhcp_ranges.is_empty() {
                let (start, end) = default_dhcp_range_v4(&v4.cidr);
                argv.push("--dhcp-range".into());
                argv.push(format!("{},{},{}", start, end, v4.dhcp_expiry));
            } else {
                for range in &v4.dhcp_ranges {
                    argv.push("--dhcp-range".into());
                    argv.push(format!("{},{},{}", range.start, range.end, v4.dhcp_expiry));
                }
            }
        }
    }

    if let Some(v6) = &parsed.v6 {
        argv.push(format!("--listen-address={}", v6.cidr.addr));
        argv.push("--enable-ra".into());
        if v6.dhcp {
            add_dhcp_common(&mut argv);

            if v6.dhcp_stateful {
                let subnet_size = v6.cidr.prefix;
                if v6.dhcp_ranges.is_empty() {
                    let (start, end) = default_dhcp_range_v6(&v6.cidr);
                    argv.push("--dhcp-range".into());
                    argv.push(format!("{},{},{},{}", start, end, subnet_size, v6.dhcp_expiry));
                } else {
                    for range in &v6.dhcp_ranges {
                        argv.push("--dhcp-range".into());
                        argv.push(format!(
                            "{},{},{},{}",
                            range.start, range.end, subnet_size, v6.dhcp_expiry
                        ));
                    }
                }
            } else {
                argv.push("--dhcp-range".into());
                argv.push(format!("::,constructor:{},ra-stateless,ra-names", name));
            }
        } else {
            argv.push("--dhcp-range".into());
            argv.push(format!("::,constructor:{},ra-only", name));
        }
    }

    if let Some(fan) = fan_addr {
        argv.push(format!("--listen-address={}", fan.address));
        add_dhcp_common(&mut argv);
        let expiry = parsed
            .v4
            .as_ref()
            .map(|v4| v4.dhcp_expiry.clone())
            .unwrap_or_else(|| "1h".to_string());
        let (start, end) = default_dhcp_range_v4(&fan.host_subnet);
        argv.push("--dhcp-range".into());
        argv.push(format!("{},{},{}", start, end, expiry));
    }

    if parsed.dns_mode != DnsMode::None {
        argv.push("-s".into());
        argv.push(parsed.dns_domain.clone());
        match cluster {
            Some(cluster) => {
                argv.push("-S".into());
                argv.push(format!("/{}/{}#1053", parsed.dns_domain, cluster.address));
                argv.push(format!(
                    "--rev-server={},{}#1053",
                    cluster.overlay_subnet, cluster.address
                ));
            }
            None => {
                argv.push("-S".into());
                argv.push(format!("/{}/", parsed.dns_domain));
            }
        }
    }

    argv.push(format!("--conf-file={}", paths.raw().display()));

    if let Some(user) = unpriv_user {
        argv.push("-u".into());
        argv.push(user.to_string());
    }

    argv
}

/// Running dnsmasq instance for one network.
pub struct Dnsmasq {
    supervisor: Supervisor,
}

impl Dnsmasq {
    /// Write the raw config file, ensure the hosts directory exists, then
    /// spawn dnsmasq and record its pidfile.
    pub async fn start(paths: &NetworkPaths, parsed: &ParsedConfig, argv: Vec<String>) -> NetworkResult<Self> {
        write_atomic(&paths.raw(), format!("{}\n", parsed.raw_dnsmasq).as_bytes())?;
        ensure_dir(&paths.hosts_dir(), 0o755)?;

        let mut supervisor = Supervisor::new("dnsmasq", argv, &paths.pidfile(), None);
        supervisor.start().await?;
        Ok(Self { supervisor })
    }

    pub async fn stop(&mut self) -> NetworkResult<()> {
        self.supervisor.stop(Duration::from_secs(10)).await
    }
}

/// Ask the resolver to re-read its static hosts directory. SIGHUP only goes
/// to a verified dnsmasq pid.
pub fn reload(paths: &NetworkPaths) -> NetworkResult<()> {
    if let Some(pid) = adopt(&paths.pidfile(), &["dnsmasq".to_string()])? {
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGHUP).map_err(|e| {
            NetworkError::Command {
                cmd: format!("kill -HUP {}", pid),
                stderr: e.to_string(),
            }
        })?;
    }
    Ok(())
}

/// Kill any dnsmasq recorded in the network's pidfile, verifying it is
/// actually a dnsmasq before signalling. Stale pidfiles vanish silently.
pub async fn kill_existing(paths: &NetworkPaths) -> NetworkResult<()> {
    if let Some(pid) = adopt(&paths.pidfile(), &["dnsmasq".to_string()])? {
        terminate(pid, Duration::from_secs(10)).await;
    }
    remove_if_exists(&paths.pidfile())?;
    Ok(())
}

/// Remove lease and pid files for a network that no longer runs dnsmasq.
pub fn cleanup_files(paths: &NetworkPaths) -> NetworkResult<()> {
    remove_if_exists(&paths.leases())?;
    remove_if_exists(&paths.pidfile())?;
    Ok(())
}

// ── Static host entries ───────────────────────────────────────────────

/// One instance's static DHCP allocation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StaticHostEntry {
    pub instance: String,
    pub mac: String,
    pub ip: String,
    pub name: String,
}

impl StaticHostEntry {
    fn file_contents(&self) -> String {
        format!("{},{},{}\n", self.mac, self.ip, self.name)
    }
}

/// Rewrite the dnsmasq.hosts directory to exactly match `entries`: files for
/// unknown instances are removed, contents are deterministic.
pub fn rewrite_static_hosts(
    hosts_dir: &Path,
    entries: &[StaticHostEntry],
) -> NetworkResult<()> {
    ensure_dir(hosts_dir, 0o755)?;

    let mut sorted: Vec<&StaticHostEntry> = entries.iter().collect();
    sorted.sort();

    let keep: Vec<&str> = sorted.iter().map(|e| e.instance.as_str()).collect();
    for entry in std::fs::read_dir(hosts_dir).map_err(NetworkError::Io)? {
        let entry = entry.map_err(NetworkError::Io)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !keep.contains(&name.as_str()) {
            remove_if_exists(&entry.path())?;
        }
    }

    for entry in sorted {
        write_atomic(
            &hosts_dir.join(&entry.instance),
            entry.file_contents().as_bytes(),
        )?;
    }
    Ok(())
}

/// Add or replace one instance's static allocation file.
pub fn write_static_host(hosts_dir: &Path, entry: &StaticHostEntry) -> NetworkResult<()> {
    ensure_dir(hosts_dir, 0o755)?;
    write_atomic(
        &hosts_dir.join(&entry.instance),
        entry.file_contents().as_bytes(),
    )
}

pub fn remove_static_host(hosts_dir: &Path, instance: &str) -> NetworkResult<()> {
    remove_if_exists(&hosts_dir.join(instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parsed(pairs: &[(&str, &str)]) -> ParsedConfig {
        let config: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ParsedConfig::parse(&config).unwrap()
    }

    fn paths() -> NetworkPaths {
        NetworkPaths::new(Path::new("/var/lib/warren"), "testbr")
    }

    fn v(s: &str) -> DottedVersion {
        DottedVersion::parse(s).unwrap()
    }

    #[test]
    fn version_comparison() {
        assert!(v("2.80").newer_than(&[2, 79]));
        assert!(!v("2.79").newer_than(&[2, 79]));
        assert!(!v("2.67").newer_than(&[2, 79]));
        assert!(v("3.0").newer_than(&[2, 79]));
        assert!(v("2.90rc1").newer_than(&[2, 79]));
        assert!(DottedVersion::parse("garbage").is_err());
    }

    #[test]
    fn argv_for_simple_v4_bridge() {
        let parsed = parsed(&[("ipv4.address", "10.0.0.1/24"), ("ipv4.nat", "true")]);
        let argv = build_argv(
            "testbr",
            &parsed,
            &paths(),
            &v("2.80"),
            false,
            None,
            None,
            None,
        );

        assert!(argv.contains(&"--interface=testbr".to_string()));
        assert!(argv.contains(&"--listen-address=10.0.0.1".to_string()));
        assert!(argv.contains(&"--dhcp-rapid-commit".to_string()));
        assert!(argv.contains(&"--quiet-dhcp".to_string()));
        assert!(argv.contains(&"--dhcp-authoritative".to_string()));
        // Default range per the subnet.
        let range_pos = argv.iter().position(|a| a == "--dhcp-range").unwrap();
        assert_eq!(argv[range_pos + 1], "10.0.0.2,10.0.0.254,1h");
        // Plain (non-cluster) DNS delegation.
        assert!(argv.contains(&"/warren/".to_string()));
    }

    #[test]
    fn argv_respects_version_gates() {
        let parsed = parsed(&[("ipv4.address", "10.0.0.1/24")]);
        let argv = build_argv(
            "testbr",
            &parsed,
            &paths(),
            &v("2.75"),
            false,
            None,
            None,
            None,
        );
        assert!(!argv.contains(&"--dhcp-rapid-commit".to_string()));
        assert!(argv.contains(&"--quiet-dhcp".to_string()));

        let argv = build_argv(
            "testbr",
            &parsed,
            &paths(),
            &v("2.60"),
            false,
            None,
            None,
            None,
        );
        assert!(!argv.contains(&"--quiet-dhcp".to_string()));

        // Debug disables quiet flags regardless of version.
        let argv = build_argv(
            "testbr",
            &parsed,
            &paths(),
            &v("2.80"),
            true,
            None,
            None,
            None,
        );
        assert!(!argv.contains(&"--quiet-dhcp".to_string()));
    }

    #[test]
    fn argv_v6_stateless_uses_slaac_range() {
        let parsed = parsed(&[("ipv6.address", "fd42::1/64")]);
        let argv = build_argv(
            "testbr",
            &parsed,
            &paths(),
            &v("2.80"),
            false,
            None,
            None,
            None,
        );
        assert!(argv.contains(&"--enable-ra".to_string()));
        assert!(argv.contains(&"::,constructor:testbr,ra-stateless,ra-names".to_string()));
    }

    #[test]
    fn argv_v6_stateful_carries_subnet_size() {
        let parsed = parsed(&[
            ("ipv6.address", "fd42::1/64"),
            ("ipv6.dhcp.stateful", "true"),
        ]);
        let argv = build_argv(
            "testbr",
            &parsed,
            &paths(),
            &v("2.80"),
            false,
            None,
            None,
            None,
        );
        let range_pos = argv.iter().position(|a| a == "--dhcp-range").unwrap();
        assert!(argv[range_pos + 1].contains(",64,1h"));
    }

    #[test]
    fn argv_v6_dhcp_disabled_is_ra_only() {
        let parsed = parsed(&[("ipv6.address", "fd42::1/64"), ("ipv6.dhcp", "false")]);
        let argv = build_argv(
            "testbr",
            &parsed,
            &paths(),
            &v("2.80"),
            false,
            None,
            None,
            None,
        );
        assert!(argv.contains(&"::,constructor:testbr,ra-only".to_string()));
    }

    #[test]
    fn argv_cluster_dns_delegation() {
        let parsed = parsed(&[("bridge.mode", "fan"), ("fan.underlay_subnet", "10.1.0.0/16")]);
        let cluster = ClusterDns {
            address: "240.3.5.1".to_string(),
            overlay_subnet: "240.0.0.0/8".to_string(),
        };
        let argv = build_argv(
            "testbr",
            &parsed,
            &paths(),
            &v("2.80"),
            false,
            None,
            None,
            Some(&cluster),
        );
        assert!(argv.contains(&"/warren/240.3.5.1#1053".to_string()));
        assert!(argv.contains(&"--rev-server=240.0.0.0/8,240.3.5.1#1053".to_string()));
    }

    #[test]
    fn argv_drops_privileges_when_user_given() {
        let parsed = parsed(&[("ipv4.address", "10.0.0.1/24")]);
        let argv = build_argv(
            "testbr",
            &parsed,
            &paths(),
            &v("2.80"),
            false,
            Some("warren-dns"),
            None,
            None,
        );
        let pos = argv.iter().position(|a| a == "-u").unwrap();
        assert_eq!(argv[pos + 1], "warren-dns");
    }

    #[test]
    fn static_hosts_rewrite_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("dnsmasq.hosts");

        let entries = vec![
            StaticHostEntry {
                instance: "web2".into(),
                mac: "00:16:3e:00:00:02".into(),
                ip: "10.0.0.6".into(),
                name: "web2".into(),
            },
            StaticHostEntry {
                instance: "web1".into(),
                mac: "00:16:3e:00:00:01".into(),
                ip: "10.0.0.5".into(),
                name: "web1".into(),
            },
        ];
        rewrite_static_hosts(&hosts, &entries).unwrap();

        let contents = std::fs::read_to_string(hosts.join("web1")).unwrap();
        assert_eq!(contents, "00:16:3e:00:00:01,10.0.0.5,web1\n");

        // A removed instance's file disappears on the next rewrite.
        rewrite_static_hosts(&hosts, &entries[..1]).unwrap();
        assert!(!hosts.join("web1").exists());
        assert!(hosts.join("web2").exists());
    }
}
