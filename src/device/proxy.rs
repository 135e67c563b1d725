// Proxy device: forwards traffic between the host and an instance, either
// through per-device NAT rules (pure kernel path) or a supervised forwarder
// child listening in one namespace and connecting in the other.

use crate::device::{DeviceContext, InstanceInfo, RunConfig};
use crate::net::config::is_true;
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::firewall::ProxyNatRule;
use crate::net::netlink::run_cmd;
use crate::net::sysctl::sysctl_get;
use crate::utils::fs::ensure_dir;
use crate::utils::process::{kill_from_pidfile, Supervisor};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// A parsed "proto:addr[,addr]" endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddr {
    pub conn_type: String,
    pub addrs: Vec<String>,
}

impl ProxyAddr {
    pub fn parse(value: &str) -> NetworkResult<Self> {
        let (proto, rest) = value.split_once(':').ok_or_else(|| {
            NetworkError::Validation(format!("proxy address '{}' has no protocol", value))
        })?;

        match proto {
            "unix" => {
                if rest.is_empty() {
                    return Err(NetworkError::Validation(
                        "unix proxy address has no socket path".into(),
                    ));
                }
                Ok(Self {
                    conn_type: proto.to_string(),
                    addrs: vec![rest.to_string()],
                })
            }
            "tcp" | "udp" => {
                let mut addrs = Vec::new();
                let mut last_host: Option<String> = None;
                for part in rest.split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    let (host, port) = match split_host_port(part) {
                        Some(pair) => pair,
                        // A bare port inherits the previous host.
                        None => match &last_host {
                            Some(host) => (host.clone(), part.to_string()),
                            None => {
                                return Err(NetworkError::Validation(format!(
                                    "proxy address '{}' is not host:port",
                                    part
                                )))
                            }
                        },
                    };
                    port.parse::<u16>().map_err(|_| {
                        NetworkError::Validation(format!("invalid proxy port '{}'", port))
                    })?;
                    last_host = Some(host.clone());
                    addrs.push(join_host_port(&host, &port));
                }
                if addrs.is_empty() {
                    return Err(NetworkError::Validation(format!(
                        "proxy address '{}' has no addresses",
                        value
                    )));
                }
                Ok(Self {
                    conn_type: proto.to_string(),
                    addrs,
                })
            }
            other => Err(NetworkError::Validation(format!(
                "unsupported proxy protocol '{}'",
                other
            ))),
        }
    }

    pub fn is_unix(&self) -> bool {
        self.conn_type == "unix"
    }
}

/// Split "host:port" / "[v6]:port" into (host, port).
fn split_host_port(value: &str) -> Option<(String, String)> {
    if let Some(rest) = value.strip_prefix('[') {
        let (host, port_part) = rest.split_once(']')?;
        let port = port_part.strip_prefix(':')?;
        return Some((host.to_string(), port.to_string()));
    }
    let (host, port) = value.rsplit_once(':')?;
    Some((host.to_string(), port.to_string()))
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn host_of(addr: &str) -> String {
    split_host_port(addr).map(|(h, _)| h).unwrap_or_default()
}

fn port_of(addr: &str) -> u16 {
    split_host_port(addr)
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(0)
}

/// Pure validation of a proxy device config.
pub fn validate_proxy_config(config: &HashMap<String, String>) -> NetworkResult<()> {
    let get = |key: &str| config.get(key).map(|s| s.as_str()).unwrap_or("");

    let listen = ProxyAddr::parse(get("listen"))?;
    let connect = ProxyAddr::parse(get("connect"))?;

    if connect.addrs.len() > listen.addrs.len() {
        return Err(NetworkError::Validation(
            "cannot map a single port to multiple ports".into(),
        ));
    }

    if !matches!(get("bind"), "" | "host" | "guest" | "container") {
        return Err(NetworkError::Validation(
            "invalid binding side, must be \"host\" or \"guest\"".into(),
        ));
    }

    let nat = is_true(get("nat"));

    if is_true(get("proxy_protocol")) && (connect.conn_type != "tcp" || nat) {
        return Err(NetworkError::Validation(
            "the PROXY header can only be sent to tcp servers in non-nat mode".into(),
        ));
    }

    let non_abstract_unix = get("listen").starts_with("unix:") && !get("listen").starts_with("unix:@");
    if !non_abstract_unix && (!get("uid").is_empty() || !get("gid").is_empty() || !get("mode").is_empty())
    {
        return Err(NetworkError::Validation(
            "only proxy devices for non-abstract unix sockets can carry uid, gid, or mode".into(),
        ));
    }

    if nat {
        if !matches!(get("bind"), "" | "host") {
            return Err(NetworkError::Validation(
                "only host-bound proxies can use NAT".into(),
            ));
        }
        if listen.is_unix() || connect.is_unix() || listen.conn_type != connect.conn_type {
            return Err(NetworkError::Validation(format!(
                "proxying {} <-> {} is not supported when using NAT",
                listen.conn_type, connect.conn_type
            )));
        }
    }

    Ok(())
}

/// Resolve the connect host against the instance's bridged NICs: it must
/// match one of their statically configured addresses, or be the wildcard
/// (which picks the first NIC with a static address of that family).
/// Returns the chosen address and the matching device name.
pub fn find_connect_ip(
    devices: &HashMap<String, HashMap<String, String>>,
    connect_host: &str,
    v6: bool,
) -> Option<(IpAddr, String)> {
    let addr_key = if v6 { "ipv6.address" } else { "ipv4.address" };
    let wildcard = if v6 { "::" } else { "0.0.0.0" };

    let mut names: Vec<&String> = devices.keys().collect();
    names.sort();

    for name in names {
        let dev = &devices[name];
        if dev.get("type").map(|s| s.as_str()) != Some("nic")
            || dev.get("nictype").map(|s| s.as_str()) != Some("bridged")
        {
            continue;
        }
        let static_addr = dev.get(addr_key).map(|s| s.as_str()).unwrap_or("");
        if static_addr.is_empty() {
            continue;
        }
        if connect_host == static_addr || connect_host == wildcard {
            if let Ok(ip) = static_addr.parse() {
                return Some((ip, name.clone()));
            }
        }
    }
    None
}

/// Materialise the NAT rules for a listen/connect pair once the connect IP
/// is pinned.
pub fn compute_nat_rules(
    listen: &ProxyAddr,
    connect: &ProxyAddr,
    connect_ip: IpAddr,
) -> Vec<ProxyNatRule> {
    let v6 = connect_ip.is_ipv6();
    let mut rules = Vec::new();

    for (i, laddr) in listen.addrs.iter().enumerate() {
        let caddr = connect
            .addrs
            .get(i)
            .or_else(|| connect.addrs.last())
            .cloned()
            .unwrap_or_default();
        rules.push(ProxyNatRule {
            v6,
            proto: listen.conn_type.clone(),
            listen_host: host_of(laddr),
            listen_port: port_of(laddr),
            connect_host: connect_ip.to_string(),
            connect_port: port_of(&caddr),
        });
    }
    rules
}

pub struct ProxyDevice {
    ctx: DeviceContext,
    inst: InstanceInfo,
    name: String,
    config: HashMap<String, String>,
}

impl ProxyDevice {
    pub fn new(
        ctx: DeviceContext,
        inst: InstanceInfo,
        name: &str,
        config: HashMap<String, String>,
    ) -> Self {
        Self {
            ctx,
            inst,
            name: name.to_string(),
            config,
        }
    }

    fn get(&self, key: &str) -> &str {
        self.config.get(key).map(|s| s.as_str()).unwrap_or("")
    }

    pub fn validate(&self) -> NetworkResult<()> {
        if self.name.is_empty() {
            return Err(NetworkError::Validation("device name cannot be empty".into()));
        }
        validate_proxy_config(&self.config)
    }

    fn pidfile(&self) -> PathBuf {
        self.ctx
            .state
            .var_dir
            .join("devices")
            .join(format!("{}_{}", self.inst.project, self.inst.name))
            .join(format!("proxy.{}", self.name))
    }

    fn log_file(&self) -> PathBuf {
        self.ctx
            .state
            .log_path(&format!("{}_{}", self.inst.project, self.inst.name))
            .join(format!("proxy.{}.log", self.name))
    }

    pub async fn start(&self) -> NetworkResult<RunConfig> {
        self.validate()?;

        if is_true(self.get("nat")) {
            self.setup_nat().await?;
        } else {
            self.spawn_forwarder().await?;
        }
        Ok(RunConfig::default())
    }

    /// NAT mode: no forwarder process, only DNAT/SNAT rules plus hairpin
    /// mode on the instance's bridge port when bridge netfilter is active.
    async fn setup_nat(&self) -> NetworkResult<()> {
        let state = &self.ctx.state;
        let listen = ProxyAddr::parse(self.get("listen"))?;
        let connect = ProxyAddr::parse(self.get("connect"))?;

        let connect_host = host_of(&connect.addrs[0]);
        let v6 = connect_host.contains(':');

        let (connect_ip, nic_name) = find_connect_ip(&self.inst.devices, &connect_host, v6)
            .ok_or_else(|| {
                NetworkError::Validation(
                    "proxy connect IP cannot be used with any of the instance NICs static IPs"
                        .into(),
                )
            })?;

        match self.bridge_netfilter_enabled(v6) {
            Err(e) => {
                tracing::warn!(
                    "proxy bridge netfilter not enabled: {}; instances using the bridge will \
                     not be able to connect to the proxy's listen address",
                    e
                );
            }
            Ok(()) => {
                // br_netfilter is active, so bridge-local traffic traverses
                // the NAT rules; hairpin mode lets replies re-enter the
                // instance's own port.
                let volatile = state
                    .store
                    .volatile_get(&self.inst.project, &self.inst.name, &nic_name)
                    .await?;
                let host_name = volatile
                    .get("host_name")
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| {
                        NetworkError::Invariant(
                            "proxy cannot find bridge port host_name to enable hairpin mode"
                                .into(),
                        )
                    })?;
                run_cmd("bridge", &["link", "set", "dev", host_name, "hairpin", "on"]).await?;
            }
        }

        let rules = compute_nat_rules(&listen, &connect, connect_ip);
        state
            .firewall
            .instance_setup_proxy_nat(&self.inst.project, &self.inst.name, &self.name, &rules)
            .await
    }

    fn bridge_netfilter_enabled(&self, v6: bool) -> NetworkResult<()> {
        let sysctl_name = if v6 { "ip6tables" } else { "iptables" };
        let key = format!("net/bridge/bridge-nf-call-{}", sysctl_name);
        let value = sysctl_get(&key)
            .map_err(|_| NetworkError::Precondition("br_netfilter not loaded".into()))?;
        if value.trim() != "1" {
            return Err(NetworkError::Precondition(format!(
                "br_netfilter sysctl net.bridge.bridge-nf-call-{}={}",
                sysctl_name,
                value.trim()
            )));
        }
        Ok(())
    }

    /// Forwarder mode: spawn the supervised forkproxy child with the listen
    /// and connect pids chosen by the bind side, then poll its log until it
    /// reports having started.
    async fn spawn_forwarder(&self) -> NetworkResult<()> {
        let state = &self.ctx.state;

        let instance_pid = self.inst.init_pid.ok_or_else(|| {
            NetworkError::Precondition("proxy devices require a running instance".into())
        })?;
        let own_pid = std::process::id();

        let (listen_pid, connect_pid) = match self.get("bind") {
            "guest" | "container" => (instance_pid, own_pid),
            _ => (own_pid, instance_pid),
        };

        let pidfile = self.pidfile();
        let log_file = self.log_file();
        if let Some(parent) = pidfile.parent() {
            ensure_dir(parent, 0o711)?;
        }
        if let Some(parent) = log_file.parent() {
            ensure_dir(parent, 0o755)?;
        }
        crate::utils::fs::remove_if_exists(&log_file)?;

        let mode = if self.get("mode").is_empty() {
            "0644"
        } else {
            self.get("mode")
        };

        let args = vec![
            "forkproxy".to_string(),
            listen_pid.to_string(),
            self.get("listen").to_string(),
            connect_pid.to_string(),
            self.get("connect").to_string(),
            log_file.display().to_string(),
            pidfile.display().to_string(),
            self.get("gid").to_string(),
            self.get("uid").to_string(),
            mode.to_string(),
            is_true(self.get("proxy_protocol")).to_string(),
        ];

        let exec = state.exec_path.display().to_string();
        let mut supervisor = Supervisor::new(&exec, args, &pidfile, Some(&log_file));
        supervisor.start().await?;

        // The child reports through its log; up to ten seconds for the
        // listeners to come up.
        for _ in 0..10 {
            match check_forwarder_log(&log_file) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    let _ = supervisor.stop(Duration::from_secs(1)).await;
                    return Err(e);
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let _ = supervisor.stop(Duration::from_secs(1)).await;
        Err(NetworkError::Command {
            cmd: "forkproxy".to_string(),
            stderr: format!(
                "proxy device did not start, see {}",
                log_file.display()
            ),
        })
    }

    pub async fn stop(&self) -> NetworkResult<()> {
        let state = &self.ctx.state;

        if let Err(e) = state
            .firewall
            .instance_clear_proxy_nat(&self.inst.project, &self.inst.name, &self.name)
            .await
        {
            tracing::error!("failed to remove proxy NAT rules: {}", e);
        }

        let pidfile = self.pidfile();
        if !pidfile.exists() {
            // NAT mode leaves no forwarder behind.
            return Ok(());
        }

        let expected = vec![
            state.exec_path.display().to_string(),
            "forkproxy".to_string(),
        ];
        kill_from_pidfile(&pidfile, &expected)
    }
}

/// Scan the forwarder log: Ok(true) once "Status: Started" appears, an
/// error if the child logged "Error:".
pub fn check_forwarder_log(log_file: &std::path::Path) -> NetworkResult<bool> {
    let contents = match std::fs::read_to_string(log_file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(NetworkError::Io(e)),
    };

    for line in contents.lines() {
        let line = line.trim();
        if line == "Status: Started" {
            return Ok(true);
        }
        if line.starts_with("Error:") {
            return Err(NetworkError::Command {
                cmd: "forkproxy".to_string(),
                stderr: line.to_string(),
            });
        }
    }
    Ok(false)
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
    fn proxy_addr_parsing() {
        let addr = ProxyAddr::parse("tcp:0.0.0.0:80").unwrap();
        assert_eq!(addr.conn_type, "tcp");
        assert_eq!(addr.addrs, vec!["0.0.0.0:80"]);

        let addr = ProxyAddr::parse("tcp:10.0.0.5:80,81").unwrap();
        assert_eq!(addr.addrs, vec!["10.0.0.5:80", "10.0.0.5:81"]);

        let addr = ProxyAddr::parse("tcp:[fd42::5]:80").unwrap();
        assert_eq!(addr.addrs, vec!["[fd42::5]:80"]);

        let addr = ProxyAddr::parse("unix:/run/app.sock").unwrap();
        assert!(addr.is_unix());

        assert!(ProxyAddr::parse("tcp:no-port").is_err());
        assert!(ProxyAddr::parse("sctp:1.2.3.4:80").is_err());
        assert!(ProxyAddr::parse("bare-string").is_err());
        assert!(ProxyAddr::parse("tcp:1.2.3.4:99999").is_err());
    }

    #[test]
    fn validation_rejects_one_to_many() {
        let err = validate_proxy_config(&cfg(&[
            ("listen", "tcp:0.0.0.0:80"),
            ("connect", "tcp:10.0.0.5:80,81"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("multiple ports"));
    }

    #[test]
    fn validation_constrains_proxy_protocol() {
        // PROXY header needs a tcp connect side.
        assert!(validate_proxy_config(&cfg(&[
            ("listen", "tcp:0.0.0.0:80"),
            ("connect", "udp:10.0.0.5:80"),
            ("proxy_protocol", "true"),
        ]))
        .is_err());

        // And non-nat mode.
        assert!(validate_proxy_config(&cfg(&[
            ("listen", "tcp:0.0.0.0:80"),
            ("connect", "tcp:10.0.0.5:80"),
            ("nat", "true"),
            ("proxy_protocol", "true"),
        ]))
        .is_err());

        validate_proxy_config(&cfg(&[
            ("listen", "tcp:0.0.0.0:80"),
            ("connect", "tcp:10.0.0.5:80"),
            ("proxy_protocol", "true"),
        ]))
        .unwrap();
    }

    #[test]
    fn validation_constrains_unix_modes() {
        // uid/gid/mode only for non-abstract unix listens.
        assert!(validate_proxy_config(&cfg(&[
            ("listen", "tcp:0.0.0.0:80"),
            ("connect", "tcp:10.0.0.5:80"),
            ("mode", "0600"),
        ]))
        .is_err());

        assert!(validate_proxy_config(&cfg(&[
            ("listen", "unix:@abstract"),
            ("connect", "unix:/run/app.sock"),
            ("mode", "0600"),
        ]))
        .is_err());

        validate_proxy_config(&cfg(&[
            ("listen", "unix:/run/listen.sock"),
            ("connect", "unix:/run/app.sock"),
            ("mode", "0600"),
        ]))
        .unwrap();
    }

    #[test]
    fn validation_constrains_nat() {
        // NAT requires matching non-unix protocols.
        assert!(validate_proxy_config(&cfg(&[
            ("listen", "tcp:0.0.0.0:80"),
            ("connect", "udp:10.0.0.5:80"),
            ("nat", "true"),
        ]))
        .is_err());

        // And host binding.
        assert!(validate_proxy_config(&cfg(&[
            ("listen", "tcp:0.0.0.0:80"),
            ("connect", "tcp:10.0.0.5:80"),
            ("nat", "true"),
            ("bind", "guest"),
        ]))
        .is_err());

        // Legacy "container" alias for guest still validates without NAT.
        validate_proxy_config(&cfg(&[
            ("listen", "tcp:0.0.0.0:80"),
            ("connect", "tcp:10.0.0.5:80"),
            ("bind", "container"),
        ]))
        .unwrap();
    }

    fn bridged_nic(addr: &str) -> HashMap<String, String> {
        cfg(&[
            ("type", "nic"),
            ("nictype", "bridged"),
            ("parent", "br0"),
            ("ipv4.address", addr),
        ])
    }

    #[test]
    fn connect_ip_must_match_instance_nic() {
        let mut devices = HashMap::new();
        devices.insert("eth0".to_string(), bridged_nic("10.0.0.5"));

        // Exact match.
        let (ip, dev) = find_connect_ip(&devices, "10.0.0.5", false).unwrap();
        assert_eq!(ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(dev, "eth0");

        // Wildcard picks the first NIC with a static address.
        let (ip, _) = find_connect_ip(&devices, "0.0.0.0", false).unwrap();
        assert_eq!(ip, "10.0.0.5".parse::<IpAddr>().unwrap());

        // Unrelated address is refused.
        assert!(find_connect_ip(&devices, "10.0.0.99", false).is_none());
    }

    #[test]
    fn nat_rules_for_single_mapping() {
        let listen = ProxyAddr::parse("tcp:0.0.0.0:80").unwrap();
        let connect = ProxyAddr::parse("tcp:0.0.0.0:8080").unwrap();
        let rules = compute_nat_rules(&listen, &connect, "10.0.0.5".parse().unwrap());

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].proto, "tcp");
        assert_eq!(rules[0].listen_host, "0.0.0.0");
        assert_eq!(rules[0].listen_port, 80);
        assert_eq!(rules[0].connect_host, "10.0.0.5");
        assert_eq!(rules[0].connect_port, 8080);
        assert!(!rules[0].v6);
    }

    #[test]
    fn forwarder_log_scanning() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("proxy.log");

        assert!(!check_forwarder_log(&log).unwrap());

        std::fs::write(&log, "Status: Starting\n").unwrap();
        assert!(!check_forwarder_log(&log).unwrap());

        std::fs::write(&log, "Status: Starting\nStatus: Started\n").unwrap();
        assert!(check_forwarder_log(&log).unwrap());

        std::fs::write(&log, "Error: could not bind listener\n").unwrap();
        let err = check_forwarder_log(&log).unwrap_err();
        assert!(err.to_string().contains("could not bind"));
    }
}
