// Routed NIC: the host answers ARP/NDP for the instance's addresses on a
// parent interface and routes packets through a host-side veth, without
// putting the instance on any bridge.
//
// The host end carries only link-local gateway addresses; every instance
// address gets a /32 (or /128) host route plus a neighbour-proxy entry on
// the parent. The VLAN parent is created on demand and the volatile
// "last_state.created" marker records whether teardown owns it.

use crate::device::{
    create_tap, create_veth_pair, create_vlan_parent_if_needed, host_device_name,
    random_device_name, setup_host_veth_limits, validate_nic_common, validate_nic_limits,
    DeviceContext, InstanceInfo, InstanceType, Revert, RunConfig,
};
use crate::net::config::is_true;
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::netlink;
use crate::net::sysctl::{sysctl_get, sysctl_set};
use std::collections::HashMap;
use std::net::IpAddr;

/// Default host-side gateway addresses presented to the instance.
pub const GATEWAY_V4: &str = "169.254.0.1";
pub const GATEWAY_V6: &str = "fe80::1";

pub struct RoutedNic {
    ctx: DeviceContext,
    inst: InstanceInfo,
    name: String,
    config: HashMap<String, String>,
}

impl RoutedNic {
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

    fn effective_parent(&self) -> String {
        host_device_name(self.get("parent"), self.get("vlan"))
    }

    fn addresses(&self, family: &str) -> Vec<String> {
        split_addresses(self.get(&format!("{}.address", family)))
    }

    fn host_address(&self, family: &str) -> String {
        let key = format!("{}.host_address", family);
        let value = self.get(&key);
        if !value.is_empty() {
            return value.to_string();
        }
        match family {
            "ipv6" => GATEWAY_V6.to_string(),
            _ => GATEWAY_V4.to_string(),
        }
    }

    pub fn validate(&self) -> NetworkResult<()> {
        validate_routed_config(&self.config)?;
        validate_gateway_auto_unique(&self.name, &self.config, &self.inst.devices)
    }

    /// Precondition checks against the live sysctl state of the effective
    /// parent. Skipped when the VLAN parent doesn't exist yet: we will
    /// create it and set the sysctls ourselves.
    async fn validate_environment(&self) -> NetworkResult<()> {
        if self.inst.instance_type == InstanceType::Container && self.get("name").is_empty() {
            return Err(NetworkError::Validation(
                "routed NIC requires the name property to start".into(),
            ));
        }

        let parent = self.get("parent");
        if parent.is_empty() {
            return Ok(());
        }

        if !self.ctx.state.nl.link_exists(parent).await {
            return Err(NetworkError::Precondition(format!(
                "parent device '{}' doesn't exist",
                parent
            )));
        }

        let effective = self.effective_parent();
        if !self.get("vlan").is_empty() && !self.ctx.state.nl.link_exists(&effective).await {
            return Ok(());
        }

        if !self.addresses("ipv4").is_empty() {
            let key = format!("net/ipv4/conf/{}/forwarding", effective);
            if sysctl_get(&key)? != "1\n" {
                return Err(NetworkError::Precondition(format!(
                    "routed mode requires sysctl net.ipv4.conf.{}.forwarding=1",
                    effective
                )));
            }
        }

        if !self.addresses("ipv6").is_empty() {
            for sysctl_name in ["forwarding", "proxy_ndp"] {
                for scope in ["all", effective.as_str()] {
                    let key = format!("net/ipv6/conf/{}/{}", scope, sysctl_name);
                    if sysctl_get(&key)? != "1\n" {
                        return Err(NetworkError::Precondition(format!(
                            "routed mode requires sysctl net.ipv6.conf.{}.{}=1",
                            scope, sysctl_name
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn start(&self) -> NetworkResult<RunConfig> {
        self.validate()?;
        self.validate_environment().await?;

        let _lock = self.ctx.state.shared_device_lock.lock().await;
        let mut revert = Revert::new();

        match self.start_inner(&mut revert).await {
            Ok(run) => {
                revert.success();
                Ok(run)
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    async fn start_inner(&self, revert: &mut Revert) -> NetworkResult<RunConfig> {
        let state = &self.ctx.state;
        let nl = &state.nl;
        let effective_parent = self.effective_parent();

        let mut volatile = HashMap::new();

        // VLAN parent on demand; record ownership for teardown.
        if !self.get("vlan").is_empty() {
            let created = create_vlan_parent_if_needed(
                nl,
                self.get("parent"),
                &effective_parent,
                self.get("vlan"),
            )
            .await?;
            volatile.insert("last_state.created".to_string(), created.to_string());

            if created {
                {
                    let state = state.clone();
                    let parent = effective_parent.clone();
                    revert.add(move || {
                        Box::pin(async move {
                            let _ = state.nl.link_del(&parent).await;
                        })
                    });
                }

                // We never touch sysctls on interfaces we didn't create.
                if !self.addresses("ipv4").is_empty() {
                    sysctl_set(&format!("net/ipv4/conf/{}/forwarding", effective_parent), "1")?;
                }
                if !self.addresses("ipv6").is_empty() {
                    sysctl_set(&format!("net/ipv6/conf/{}/forwarding", effective_parent), "1")?;
                    sysctl_set(&format!("net/ipv6/conf/{}/proxy_ndp", effective_parent), "1")?;
                }
            }
        }

        let host_name = if !self.get("host_name").is_empty() {
            self.get("host_name").to_string()
        } else {
            match self.inst.instance_type {
                InstanceType::Container => random_device_name("veth"),
                InstanceType::Vm => random_device_name("tap"),
            }
        };
        volatile.insert("host_name".to_string(), host_name.clone());

        let peer_name = match self.inst.instance_type {
            InstanceType::Container => create_veth_pair(nl, &host_name, &self.config).await?,
            InstanceType::Vm => {
                create_tap(nl, &host_name, &self.config).await?;
                host_name.clone()
            }
        };
        {
            let state = state.clone();
            let host_name = host_name.clone();
            revert.add(move || {
                Box::pin(async move {
                    let _ = state.nl.link_del(&host_name).await;
                })
            });
        }

        // No router advertisements from the instance side; no spoofed
        // sources past the host end.
        if let Err(e) = sysctl_set(&format!("net/ipv6/conf/{}/accept_ra", host_name), "0") {
            if !is_not_found(&e) {
                return Err(e);
            }
        }
        if let Err(e) = sysctl_set(&format!("net/ipv4/conf/{}/rp_filter", host_name), "1") {
            if !is_not_found(&e) {
                return Err(e);
            }
        }

        state
            .firewall
            .instance_setup_rp_filter(&self.inst.project, &self.inst.name, &self.name, &host_name)
            .await?;
        {
            let state = state.clone();
            let (project, instance, device) = (
                self.inst.project.clone(),
                self.inst.name.clone(),
                self.name.clone(),
            );
            revert.add(move || {
                Box::pin(async move {
                    let _ = state
                        .firewall
                        .instance_clear_rp_filter(&project, &instance, &device)
                        .await;
                })
            });
        }

        nl.link_set_up(&host_name).await?;

        setup_host_veth_limits(&host_name, &self.config).await?;

        for family in ["ipv4", "ipv6"] {
            let v6 = family == "ipv6";
            let subnet_size: u8 = if v6 { 128 } else { 32 };
            let addresses = self.addresses(family);
            if addresses.is_empty() {
                continue;
            }

            // Gateway IP on the host end: keeps gateway liveness detection
            // inside the instance working rather than relying on the
            // neighbour proxies alone.
            let gateway = self.host_address(family);
            let gateway_addr: IpAddr = gateway.parse().map_err(|_| {
                NetworkError::Validation(format!("invalid {}.host_address '{}'", family, gateway))
            })?;
            nl.addr_add(&host_name, gateway_addr, subnet_size).await?;

            sysctl_set(
                &format!("net/{}/conf/{}/forwarding", family, host_name),
                "1",
            )?;

            for addr in &addresses {
                let cidr = format!("{}/{}", addr, subnet_size);
                netlink::route_add(&host_name, v6, &cidr, "static").await?;

                let table = self.get(&format!("{}.host_table", family));
                if !table.is_empty() {
                    netlink::route_add_table(&host_name, v6, &cidr, table).await?;
                }

                if !effective_parent.is_empty() && !self.get("parent").is_empty() {
                    let ip: IpAddr = addr.parse().map_err(|_| {
                        NetworkError::Validation(format!("invalid address '{}'", addr))
                    })?;
                    netlink::neigh_proxy_add(&effective_parent, ip).await?;
                    {
                        let parent = effective_parent.clone();
                        revert.add(move || {
                            Box::pin(async move {
                                let _ = netlink::neigh_proxy_del(&parent, ip).await;
                            })
                        });
                    }
                }
            }
        }

        state
            .store
            .volatile_set(&self.inst.project, &self.inst.name, &self.name, &volatile)
            .await?;

        Ok(self.build_run_config(&peer_name))
    }

    fn build_run_config(&self, peer_name: &str) -> RunConfig {
        routed_run_config(
            self.inst.instance_type,
            &self.name,
            &self.config,
            peer_name,
        )
    }

    /// Live update for a running instance. The host-side limits are the
    /// only fields that can change without a device remove and re-add;
    /// they are re-applied to the recorded host interface.
    pub async fn update(&self, is_running: bool) -> NetworkResult<()> {
        if !is_running {
            return Ok(());
        }

        self.validate_environment().await?;

        let volatile = self
            .ctx
            .state
            .store
            .volatile_get(&self.inst.project, &self.inst.name, &self.name)
            .await?;
        if let Some(host_name) = volatile.get("host_name").filter(|v| !v.is_empty()) {
            setup_host_veth_limits(host_name, &self.config).await?;
        }
        Ok(())
    }

    pub async fn stop(&self) -> NetworkResult<()> {
        let state = &self.ctx.state;
        let mut errors: Vec<String> = Vec::new();

        let volatile = state
            .store
            .volatile_get(&self.inst.project, &self.inst.name, &self.name)
            .await?;
        let effective_parent = if self.get("parent").is_empty() {
            String::new()
        } else {
            self.effective_parent()
        };

        if let Some(host_name) = volatile.get("host_name").filter(|v| !v.is_empty()) {
            if state.nl.link_exists(host_name).await {
                if let Err(e) = state.nl.link_del(host_name).await {
                    errors.push(format!("failed to remove interface {}: {}", host_name, e));
                }
            }
        }

        if !effective_parent.is_empty() {
            for family in ["ipv4", "ipv6"] {
                for addr in self.addresses(family) {
                    if let Ok(ip) = addr.parse::<IpAddr>() {
                        let _ = netlink::neigh_proxy_del(&effective_parent, ip).await;
                    }
                }
            }
        }

        // The VLAN parent goes away only if this device created it.
        if is_true(
            volatile
                .get("last_state.created")
                .map(|s| s.as_str())
                .unwrap_or(""),
        ) && !effective_parent.is_empty()
        {
            if let Err(e) = state.nl.link_del(&effective_parent).await {
                errors.push(format!(
                    "failed to remove VLAN parent {}: {}",
                    effective_parent, e
                ));
            }
        }

        if let Err(e) = state
            .firewall
            .instance_clear_rp_filter(&self.inst.project, &self.inst.name, &self.name)
            .await
        {
            errors.push(e.to_string());
        }

        let mut clear = HashMap::new();
        clear.insert("host_name".to_string(), String::new());
        clear.insert("last_state.created".to_string(), String::new());
        state
            .store
            .volatile_set(&self.inst.project, &self.inst.name, &self.name, &clear)
            .await?;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetworkError::Invariant(errors.join("; ")))
        }
    }
}

/// Instance-facing network configuration for a started routed NIC.
pub fn routed_run_config(
    instance_type: InstanceType,
    device_name: &str,
    config: &HashMap<String, String>,
    peer_name: &str,
) -> RunConfig {
    let get = |key: &str| config.get(key).map(|s| s.as_str()).unwrap_or("");
    let mut run = RunConfig::default();

    match instance_type {
        InstanceType::Container => {
            run.push("type", "phys".to_string());
            run.push("link", peer_name.to_string());
            run.push("name", get("name").to_string());
            run.push("flags", "up".to_string());

            for family in ["ipv4", "ipv6"] {
                let addresses = split_addresses(get(&format!("{}.address", family)));
                if addresses.is_empty() {
                    continue;
                }

                let gateway_key = format!("{}.gateway", family);
                if gateway_is_auto(get(&gateway_key)) {
                    let host_key = format!("{}.host_address", family);
                    let gateway = match get(&host_key) {
                        "" => {
                            if family == "ipv6" {
                                GATEWAY_V6
                            } else {
                                GATEWAY_V4
                            }
                        }
                        v => v,
                    };
                    run.push(&gateway_key, gateway.to_string());
                }

                for addr in &addresses {
                    if family == "ipv6" {
                        run.push("ipv6.address", format!("{}/128", addr));
                    } else {
                        // Forcing the broadcast to 0.0.0.0 stops the
                        // container runtime from computing one for the /32,
                        // which would break adjacent-address traffic.
                        run.push("ipv4.address", format!("{}/32 0.0.0.0", addr));
                    }
                }
            }
        }
        InstanceType::Vm => {
            run.push("devName", device_name.to_string());
            run.push("link", peer_name.to_string());
            run.push("hwaddr", get("hwaddr").to_string());
        }
    }

    run
}

/// Pure config validation for routed NICs.
pub fn validate_routed_config(config: &HashMap<String, String>) -> NetworkResult<()> {
    validate_nic_common(config)?;
    validate_nic_limits(config)?;

    for (key, v6) in [("ipv4.address", false), ("ipv6.address", true)] {
        let value = config.get(key).map(|s| s.as_str()).unwrap_or("");
        if value.is_empty() {
            continue;
        }

        let mut seen = std::collections::HashSet::new();
        for addr in split_addresses(value) {
            let parse_ok = if v6 {
                addr.parse::<std::net::Ipv6Addr>().is_ok()
            } else {
                addr.parse::<std::net::Ipv4Addr>().is_ok()
            };
            if !parse_ok {
                return Err(NetworkError::Validation(format!(
                    "invalid address '{}' in {}",
                    addr, key
                )));
            }
            if !seen.insert(addr.clone()) {
                return Err(NetworkError::Validation(format!(
                    "duplicate address '{}' in {}",
                    addr, key
                )));
            }
        }
    }

    for key in ["ipv4.host_address", "ipv6.host_address"] {
        let value = config.get(key).map(|s| s.as_str()).unwrap_or("");
        if !value.is_empty() && value.parse::<IpAddr>().is_err() {
            return Err(NetworkError::Validation(format!(
                "invalid {} '{}'",
                key, value
            )));
        }
    }

    Ok(())
}

/// Only one routed NIC per instance may leave a gateway key in auto mode:
/// every auto NIC injects the same link-local next hop, so a second one
/// would make the instance's default route ambiguous.
pub fn validate_gateway_auto_unique(
    device_name: &str,
    config: &HashMap<String, String>,
    devices: &HashMap<String, HashMap<String, String>>,
) -> NetworkResult<()> {
    for key in ["ipv4.gateway", "ipv6.gateway"] {
        let own = config.get(key).map(|s| s.as_str()).unwrap_or("");
        if !gateway_is_auto(own) {
            continue;
        }

        for (name, dev) in devices {
            if name == device_name
                || dev.get("nictype").map(|s| s.as_str()) != Some("routed")
            {
                continue;
            }
            let other = dev.get(key).map(|s| s.as_str()).unwrap_or("");
            if gateway_is_auto(other) {
                return Err(NetworkError::Validation(format!(
                    "existing NIC '{}' already uses '{}' in auto mode",
                    name, key
                )));
            }
        }
    }
    Ok(())
}

fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A gateway key set to "auto" (or unset) means the host gateway address
/// is injected into the instance.
fn gateway_is_auto(value: &str) -> bool {
    value.is_empty() || value == "auto"
}

fn is_not_found(err: &NetworkError) -> bool {
    matches!(err, NetworkError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
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
    fn address_lists_are_validated() {
        validate_routed_config(&cfg(&[("ipv4.address", "192.0.2.10,192.0.2.11")])).unwrap();

        let err = validate_routed_config(&cfg(&[("ipv4.address", "192.0.2.10,192.0.2.10")]))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"));

        assert!(validate_routed_config(&cfg(&[("ipv4.address", "not-an-ip")])).is_err());
        assert!(validate_routed_config(&cfg(&[("ipv6.address", "192.0.2.10")])).is_err());
    }

    #[test]
    fn vlan_needs_parent() {
        assert!(validate_routed_config(&cfg(&[("vlan", "100")])).is_err());
        validate_routed_config(&cfg(&[("vlan", "100"), ("parent", "eth0")])).unwrap();
    }

    #[test]
    fn gateway_auto_detection() {
        assert!(gateway_is_auto(""));
        assert!(gateway_is_auto("auto"));
        assert!(!gateway_is_auto("none"));
    }

    #[test]
    fn limits_are_validated() {
        validate_routed_config(&cfg(&[
            ("ipv4.address", "192.0.2.10"),
            ("limits.max", "50Mbit"),
        ]))
        .unwrap();

        assert!(validate_routed_config(&cfg(&[
            ("ipv4.address", "192.0.2.10"),
            ("limits.ingress", "plenty"),
        ]))
        .is_err());
    }

    fn routed_sibling(gateway: &str) -> HashMap<String, String> {
        let mut dev = cfg(&[
            ("type", "nic"),
            ("nictype", "routed"),
            ("ipv4.address", "192.0.2.20"),
        ]);
        if !gateway.is_empty() {
            dev.insert("ipv4.gateway".to_string(), gateway.to_string());
        }
        dev
    }

    #[test]
    fn only_one_routed_nic_may_use_gateway_auto() {
        let own = cfg(&[("ipv4.address", "192.0.2.10")]);

        // A sibling routed NIC also in auto mode is rejected.
        let mut devices = HashMap::new();
        devices.insert("eth1".to_string(), routed_sibling(""));
        let err = validate_gateway_auto_unique("eth0", &own, &devices).unwrap_err();
        assert!(err.to_string().contains("auto mode"));

        // A sibling with an explicit gateway is fine.
        let mut devices = HashMap::new();
        devices.insert("eth1".to_string(), routed_sibling("none"));
        validate_gateway_auto_unique("eth0", &own, &devices).unwrap();

        // Non-routed siblings are ignored.
        let mut devices = HashMap::new();
        let mut bridged = routed_sibling("");
        bridged.insert("nictype".to_string(), "bridged".to_string());
        devices.insert("eth1".to_string(), bridged);
        validate_gateway_auto_unique("eth0", &own, &devices).unwrap();

        // The device never conflicts with itself.
        let mut devices = HashMap::new();
        devices.insert("eth0".to_string(), routed_sibling(""));
        validate_gateway_auto_unique("eth0", &own, &devices).unwrap();

        // An explicit own gateway sidesteps the check entirely.
        let own_explicit = cfg(&[("ipv4.address", "192.0.2.10"), ("ipv4.gateway", "none")]);
        let mut devices = HashMap::new();
        devices.insert("eth1".to_string(), routed_sibling(""));
        validate_gateway_auto_unique("eth0", &own_explicit, &devices).unwrap();
    }

    #[test]
    fn container_run_config_carries_gateway_and_host_routes() {
        let config = cfg(&[
            ("name", "eth0"),
            ("parent", "eth0"),
            ("ipv4.address", "192.0.2.10"),
        ]);
        let run = routed_run_config(InstanceType::Container, "eth0", &config, "vethpeer0");

        assert_eq!(run.get("ipv4.gateway"), Some("169.254.0.1"));
        assert_eq!(run.get("ipv4.address"), Some("192.0.2.10/32 0.0.0.0"));
        assert_eq!(run.get("link"), Some("vethpeer0"));
        assert_eq!(run.get("flags"), Some("up"));
    }

    #[test]
    fn run_config_honours_host_address_override() {
        let config = cfg(&[
            ("name", "eth0"),
            ("ipv6.address", "fd42::10"),
            ("ipv6.host_address", "fe80::aa"),
        ]);
        let run = routed_run_config(InstanceType::Container, "eth0", &config, "veth1");
        assert_eq!(run.get("ipv6.gateway"), Some("fe80::aa"));
        assert_eq!(run.get("ipv6.address"), Some("fd42::10/128"));
    }

    #[test]
    fn vm_run_config_links_the_tap() {
        let config = cfg(&[("hwaddr", "00:16:3e:aa:bb:cc"), ("ipv4.address", "192.0.2.10")]);
        let run = routed_run_config(InstanceType::Vm, "eth0", &config, "tap123");
        assert_eq!(run.get("devName"), Some("eth0"));
        assert_eq!(run.get("link"), Some("tap123"));
        assert_eq!(run.get("hwaddr"), Some("00:16:3e:aa:bb:cc"));
    }

    #[test]
    fn address_splitting() {
        assert_eq!(
            split_addresses(" 192.0.2.1, 192.0.2.2 "),
            vec!["192.0.2.1".to_string(), "192.0.2.2".to_string()]
        );
        assert!(split_addresses("").is_empty());
    }
}
