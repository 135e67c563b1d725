// The managed bridge network: one stateful object per network, owning the
// reconciliation between declarative config and kernel state.
//
// All mutating operations (setup, stop, update, rename, delete) serialise on
// the per-network data lock for their full duration. setup() is the
// reconciliation primitive: it converges kernel state onto the current
// config, taking the previous config only to decide which firewall state
// needs clearing first.

use crate::bgp::{bgp_clear, bgp_setup};
use crate::cluster::{new_notifier, NotifyPolicy, PeerClient, DEFAULT_OFFLINE_THRESHOLD};
use crate::net::config::{
    self, diff_config, enabled, is_true, strip_node_specific, validate_config, BridgeDriver,
    FanType, NetworkPut, ParsedConfig,
};
use crate::net::dnsmasq::{self, ClusterDns, Dnsmasq};
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::firewall::{Action, Family, Location, Table};
use crate::net::netlink::{self, run_cmd};
use crate::net::overlay::{self, FanAddress};
use crate::net::sysctl::{sysctl_entries, sysctl_exists, sysctl_get, sysctl_set};
use crate::net::{NetworkPaths, State};
use crate::store::{NetworkRecord, NetworkState};
use crate::utils::fs::{ensure_dir, read_lines, write_atomic};
use crate::utils::process::{adopt, terminate, Supervisor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct NetworkData {
    name: String,
    description: String,
    config: HashMap<String, String>,
    dnsmasq: Option<Dnsmasq>,
    forkdns: Option<Supervisor>,
}

pub struct Network {
    state: Arc<State>,
    id: i64,
    project: String,
    data: tokio::sync::Mutex<NetworkData>,
}

impl Network {
    pub fn new(state: Arc<State>, record: &NetworkRecord) -> Arc<Self> {
        Arc::new(Self {
            state,
            id: record.id,
            project: record.project.clone(),
            data: tokio::sync::Mutex::new(NetworkData {
                name: record.name.clone(),
                description: record.description.clone(),
                config: record.config.clone(),
                dnsmasq: None,
                forkdns: None,
            }),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub async fn name(&self) -> String {
        self.data.lock().await.name.clone()
    }

    pub async fn description(&self) -> String {
        self.data.lock().await.description.clone()
    }

    pub async fn config(&self) -> HashMap<String, String> {
        self.data.lock().await.config.clone()
    }

    pub async fn has_dhcp_v4(&self) -> bool {
        enabled(&self.data.lock().await.config, "ipv4.dhcp", true)
    }

    pub async fn has_dhcp_v6(&self) -> bool {
        enabled(&self.data.lock().await.config, "ipv6.dhcp", true)
    }

    pub async fn hosts_dir(&self) -> std::path::PathBuf {
        let data = self.data.lock().await;
        self.state.network_paths(&data.name).hosts_dir()
    }

    /// Whether the bridge interface currently exists on this host.
    pub async fn is_running(&self) -> bool {
        if self.state.mock {
            return false;
        }
        let name = self.data.lock().await.name.clone();
        self.state.nl.link_exists(&name).await
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Bring the network up and mark the store record accordingly.
    pub async fn start(&self) -> NetworkResult<()> {
        let mut data = self.data.lock().await;
        let result = self.setup_locked(&mut data, None).await;

        match result {
            Ok(()) => {
                bgp_setup(&self.state.bgp, self.id, None, &data.config)?;
                self.state
                    .store
                    .set_network_state(self.id, NetworkState::Created)
                    .await?;
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .state
                    .store
                    .set_network_state(self.id, NetworkState::Errored)
                    .await;
                Err(e)
            }
        }
    }

    pub async fn stop(&self) -> NetworkResult<()> {
        let mut data = self.data.lock().await;
        self.stop_locked(&mut data).await
    }

    /// Tear down runtime state and, unless acting as a notification
    /// recipient, erase the store record.
    pub async fn delete(&self, notification: bool) -> NetworkResult<()> {
        let mut data = self.data.lock().await;

        if !self.state.mock {
            let running = self.state.nl.link_exists(&data.name).await;
            if running {
                self.stop_locked(&mut data).await?;
            }
        }

        bgp_clear(&self.state.bgp, self.id, &data.config)?;

        let paths = self.state.network_paths(&data.name);
        if paths.dir().exists() {
            std::fs::remove_dir_all(paths.dir()).map_err(NetworkError::Io)?;
        }

        if !notification {
            self.state
                .store
                .delete_network(&self.project, &data.name)
                .await?;
        }
        Ok(())
    }

    /// Rename a stopped network: move its directory, rewrite the store
    /// record, re-key internal state.
    pub async fn rename(&self, new_name: &str) -> NetworkResult<()> {
        config::validate_network_name(new_name)?;
        let mut data = self.data.lock().await;

        if !self.state.mock && self.state.nl.link_exists(&data.name).await {
            return Err(NetworkError::Validation(
                "cannot rename a running network".into(),
            ));
        }

        let old_paths = self.state.network_paths(&data.name);
        let new_paths = self.state.network_paths(new_name);
        if new_paths.dir().exists() {
            std::fs::remove_dir_all(new_paths.dir()).map_err(NetworkError::Io)?;
        }
        if old_paths.dir().exists() {
            std::fs::rename(old_paths.dir(), new_paths.dir()).map_err(NetworkError::Io)?;
        }

        self.state
            .store
            .rename_network(&self.project, &data.name, new_name)
            .await?;

        data.name = new_name.to_string();
        Ok(())
    }

    /// No-op hook for changes on networks this one depends on.
    pub async fn handle_dependency_change(
        &self,
        _changed_name: &str,
        _changed_keys: &[String],
    ) -> NetworkResult<()> {
        Ok(())
    }

    // ── Update path ───────────────────────────────────────────────────

    /// Report whether an incoming put changes anything, and hand back the
    /// changed non-user keys plus a restorable snapshot.
    pub async fn config_changed(&self, put: &NetworkPut) -> (bool, Vec<String>, NetworkPut) {
        let data = self.data.lock().await;
        let diff = diff_config(&data.config, &put.config);
        let db_update_needed = !diff.is_empty() || put.description != data.description;
        let old = NetworkPut {
            description: data.description.clone(),
            config: data.config.clone(),
        };
        (db_update_needed, diff.changed_non_user.clone(), old)
    }

    /// Apply a new put. When not acting as a notification recipient the
    /// change is replayed on every peer (policy all, node-local keys
    /// stripped) before the store is updated. Any failure restores the
    /// previous config in memory and in the store, then reconciles the
    /// kernel back with setup(old).
    pub async fn update(&self, mut put: NetworkPut, notification: bool) -> NetworkResult<()> {
        self.fill_auto(&mut put.config).await?;

        let mut data = self.data.lock().await;
        validate_config(&data.name, &put.config)?;

        let diff = diff_config(&data.config, &put.config);
        if diff.is_empty() && put.description == data.description {
            return Ok(());
        }

        let old_config = data.config.clone();
        let old_description = data.description.clone();

        let result = self
            .apply_update_locked(&mut data, &put, &diff.changed, diff.user_only(), notification, &old_config)
            .await;

        if let Err(e) = result {
            // Compensation: restore the previous config in memory and in
            // the store, then converge the kernel back onto it.
            data.config = old_config.clone();
            data.description = old_description;
            let _ = self
                .state
                .store
                .update_network(&self.project, &data.name, &data.description, &data.config)
                .await;
            if let Err(revert_err) = self.setup_locked(&mut data, Some(&old_config)).await {
                tracing::error!(
                    "reverting network {} after failed update also failed: {}",
                    data.name,
                    revert_err
                );
            }
            return Err(e);
        }

        Ok(())
    }

    async fn apply_update_locked(
        &self,
        data: &mut NetworkData,
        put: &NetworkPut,
        changed: &[String],
        user_only: bool,
        notification: bool,
        old_config: &HashMap<String, String>,
    ) -> NetworkResult<()> {
        if !user_only {
            if changed.iter().any(|k| k == "bridge.driver") && self.is_running_locked(data).await {
                self.stop_locked(data).await?;
            }

            if changed.iter().any(|k| k == "bridge.external_interfaces")
                && self.is_running_locked(data).await
            {
                let keep: Vec<String> = put
                    .config
                    .get("bridge.external_interfaces")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default();
                let old: Vec<String> = old_config
                    .get("bridge.external_interfaces")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default();
                for dev in old {
                    if dev.is_empty() || keep.contains(&dev) {
                        continue;
                    }
                    if self.state.nl.link_exists(&dev).await {
                        netlink::run_ip(&["link", "set", "dev", &dev, "nomaster"]).await?;
                    }
                }
            }
        }

        data.config = put.config.clone();
        data.description = put.description.clone();

        if !notification {
            let members = self.state.store.members().await?;
            let notifier = new_notifier(
                &members,
                &self.state.local_cluster_address,
                self.state.cluster_cert.as_ref(),
                NotifyPolicy::All,
                DEFAULT_OFFLINE_THRESHOLD,
            )?;

            let send_put = NetworkPut {
                description: put.description.clone(),
                config: strip_node_specific(&put.config),
            };
            let project = self.project.clone();
            let name = data.name.clone();
            notifier
                .invoke(|peer| {
                    let put = send_put.clone();
                    let project = project.clone();
                    let name = name.clone();
                    async move { peer.update_network(&project, &name, &put).await }
                })
                .await?;

            self.state
                .store
                .update_network(&self.project, &data.name, &data.description, &data.config)
                .await?;
        }

        if !user_only {
            self.setup_locked(data, Some(old_config)).await?;
            bgp_setup(&self.state.bgp, self.id, Some(old_config), &data.config)?;
        }

        Ok(())
    }

    /// Backfill derivable config before validation: a fan network without an
    /// underlay gets the subnet of the default-route interface.
    async fn fill_auto(&self, config: &mut HashMap<String, String>) -> NetworkResult<()> {
        let is_fan = config.get("bridge.mode").map(|v| v.as_str()) == Some("fan");
        let missing_underlay = config
            .get("fan.underlay_subnet")
            .map(|v| v.is_empty())
            .unwrap_or(true);

        if is_fan && missing_underlay && !self.state.mock {
            let subnet = overlay::default_underlay_subnet(&self.state.nl).await?;
            config.insert("fan.underlay_subnet".to_string(), subnet);
        }
        Ok(())
    }

    async fn is_running_locked(&self, data: &NetworkData) -> bool {
        if self.state.mock {
            return false;
        }
        self.state.nl.link_exists(&data.name).await
    }

    // ── Reconciliation ────────────────────────────────────────────────

    async fn setup_locked(
        &self,
        data: &mut NetworkData,
        old_config: Option<&HashMap<String, String>>,
    ) -> NetworkResult<()> {
        if self.state.mock {
            return Ok(());
        }

        let name = data.name.clone();
        let nl = &self.state.nl;
        let fw = &self.state.firewall;
        let paths = self.state.network_paths(&name);

        ensure_dir(paths.dir(), 0o711)?;

        let parsed = ParsedConfig::parse(&data.config)?;

        // Create the bridge interface.
        if !nl.link_exists(&name).await {
            match parsed.driver {
                BridgeDriver::Openvswitch => {
                    if run_cmd("which", &["ovs-vsctl"]).await.is_err() {
                        return Err(NetworkError::Precondition(
                            "openvswitch is not installed on this system".into(),
                        ));
                    }
                    run_cmd("ovs-vsctl", &["add-br", &name]).await?;
                }
                BridgeDriver::Native => {
                    nl.link_add_bridge(&name).await?;
                }
            }
        }

        // IPv6 bridge behaviour: the bridge address is static, so no
        // autoconf and no duplicate address detection.
        if parsed.v6.is_some() {
            if !sysctl_exists("net/ipv6") {
                return Err(NetworkError::Precondition(
                    "network has ipv6.address but kernel IPv6 support is missing".into(),
                ));
            }
            sysctl_set(&format!("net/ipv6/conf/{}/autoconf", name), "0")?;
            sysctl_set(&format!("net/ipv6/conf/{}/accept_dad", name), "0")?;
        }

        // Stale tunnel/MTU devices from a previous config version.
        for dev in nl.links_with_prefix(&format!("{}-", name)).await? {
            nl.link_del(&dev).await?;
        }

        // MTU: pinned by a dummy bridge member so the bridge can't drift
        // upward when ports detach.
        let mut mtu = overlay::compute_mtu(&parsed);
        let wants_pin = parsed.mtu_override.is_some()
            || !parsed.tunnels.is_empty()
            || parsed.fan.is_some();
        if wants_pin && parsed.driver != BridgeDriver::Openvswitch {
            let mtu_dev = format!("{}-mtu", name);
            if nl.link_add_dummy(&mtu_dev).await.is_ok() {
                let _ = nl.link_set_mtu(&mtu_dev, mtu).await;
                let _ = nl.link_set_up(&mtu_dev).await;
                let _ = nl.link_set_master(&mtu_dev, &name).await;
            }
        }
        nl.link_set_mtu(&name, mtu).await?;

        if let Some(hwaddr) = &parsed.hwaddr {
            nl.link_set_hwaddr(&name, hwaddr).await?;
        }

        nl.link_set_up(&name).await?;

        // External interfaces: only unconfigured interfaces may be bridged.
        for iface in &parsed.external_interfaces {
            if !nl.link_exists(iface).await {
                continue;
            }
            let mut addrs = nl.addr_list(iface, false).await?;
            addrs.extend(nl.addr_list(iface, true).await?);
            if !addrs.is_empty() {
                return Err(NetworkError::Precondition(
                    "only unconfigured network interfaces can be bridged".into(),
                ));
            }
            nl.link_set_master(iface, &name).await?;
        }

        // Clear old IPv4 rules for tags this network owns, considering both
        // the new and previous firewall settings.
        let v4_firewall = enabled(&data.config, "ipv4.firewall", true);
        let v4_firewall_old = old_config
            .map(|c| enabled(c, "ipv4.firewall", true))
            .unwrap_or(false);
        if v4_firewall || v4_firewall_old {
            fw.network_clear(Family::V4, Table::Filter, &name).await?;
            fw.network_clear(Family::V4, Table::Mangle, &name).await?;
        }
        let v4_nat = is_true(data.config.get("ipv4.nat").map(|s| s.as_str()).unwrap_or(""));
        let v4_nat_old = old_config
            .map(|c| is_true(c.get("ipv4.nat").map(|s| s.as_str()).unwrap_or("")))
            .unwrap_or(false);
        if v4_nat || v4_nat_old || parsed.fan.is_some() {
            fw.network_clear(Family::V4, Table::Nat, &name).await?;
        }

        // The kernel drops static routes when the last address goes; boot
        // proto routes (instance-specific) are snapshotted and re-applied.
        let boot_routes_v4 = netlink::route_list(&name, false, "boot").await?;
        nl.addr_flush(&name, false).await?;
        netlink::route_flush(&name, false, "static").await?;

        let has_dhcp_v4 = parsed.v4.as_ref().map(|v4| v4.dhcp).unwrap_or(false);

        // IPv4 firewall posture (shared with fan mode).
        if parsed.fan.is_some() || parsed.v4.is_some() {
            if has_dhcp_v4 && v4_firewall {
                fw.network_setup_ipv4_dns_overrides(&name).await?;
            }
            if v4_firewall {
                fw.network_setup_ipv4_dhcp_workaround(&name).await?;
            }

            let routing = parsed.v4.as_ref().map(|v4| v4.routing).unwrap_or(true);
            if parsed.fan.is_some() || routing {
                sysctl_set("net/ipv4/ip_forward", "1")?;
                if v4_firewall {
                    fw.network_setup_allow_forwarding(Family::V4, &name, Action::Accept)
                        .await?;
                }
            } else if v4_firewall {
                fw.network_setup_allow_forwarding(Family::V4, &name, Action::Reject)
                    .await?;
            }
        }

        if let Some(v4) = &parsed.v4 {
            nl.addr_add(&name, v4.cidr.addr.into(), v4.cidr.prefix).await?;

            if v4.nat {
                let location = if v4.nat_append {
                    Location::Append
                } else {
                    Location::Prepend
                };
                fw.network_setup_nat(
                    Family::V4,
                    &name,
                    location,
                    &v4.cidr.subnet_string(),
                    v4.nat_address.map(Into::into),
                )
                .await?;
            }

            for route in &v4.routes {
                netlink::route_add(&name, false, route, "static").await?;
            }
            for route in &boot_routes_v4 {
                netlink::route_replace(&name, false, "boot", route).await?;
            }
        }

        // Symmetric IPv6 block.
        let v6_firewall = enabled(&data.config, "ipv6.firewall", true);
        let v6_firewall_old = old_config
            .map(|c| enabled(c, "ipv6.firewall", true))
            .unwrap_or(false);
        if v6_firewall || v6_firewall_old {
            fw.network_clear(Family::V6, Table::Filter, &name).await?;
        }
        let v6_nat = is_true(data.config.get("ipv6.nat").map(|s| s.as_str()).unwrap_or(""));
        let v6_nat_old = old_config
            .map(|c| is_true(c.get("ipv6.nat").map(|s| s.as_str()).unwrap_or("")))
            .unwrap_or(false);
        if v6_nat || v6_nat_old {
            fw.network_clear(Family::V6, Table::Nat, &name).await?;
        }

        let boot_routes_v6 = netlink::route_list(&name, true, "boot").await?;
        nl.addr_flush(&name, true).await?;
        netlink::route_flush(&name, true, "static").await?;

        if let Some(v6) = &parsed.v6 {
            sysctl_set(&format!("net/ipv6/conf/{}/disable_ipv6", name), "0")?;

            if v6.dhcp && v6_firewall {
                fw.network_setup_ipv6_dns_overrides(&name).await?;
            }

            if v6.routing {
                // Interfaces accepting router advertisements must keep doing
                // so once forwarding turns on (accept_ra=2), and forwarding
                // has to be enabled across the board for the bridge to route.
                for entry in sysctl_entries("net/ipv6/conf")? {
                    let ra_key = format!("net/ipv6/conf/{}/accept_ra", entry);
                    match sysctl_get(&ra_key) {
                        Ok(v) if v == "1\n" => {
                            if let Err(e) = sysctl_set(&ra_key, "2") {
                                if !is_not_found(&e) {
                                    return Err(e);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                for entry in sysctl_entries("net/ipv6/conf")? {
                    let fwd_key = format!("net/ipv6/conf/{}/forwarding", entry);
                    if let Err(e) = sysctl_set(&fwd_key, "1") {
                        if !is_not_found(&e) {
                            return Err(e);
                        }
                    }
                }

                if v6_firewall {
                    fw.network_setup_allow_forwarding(Family::V6, &name, Action::Accept)
                        .await?;
                }
            } else if v6_firewall {
                fw.network_setup_allow_forwarding(Family::V6, &name, Action::Reject)
                    .await?;
            }

            nl.addr_add(&name, v6.cidr.addr.into(), v6.cidr.prefix).await?;

            if v6.nat {
                let location = if v6.nat_append {
                    Location::Append
                } else {
                    Location::Prepend
                };
                fw.network_setup_nat(
                    Family::V6,
                    &name,
                    location,
                    &v6.cidr.subnet_string(),
                    v6.nat_address.map(Into::into),
                )
                .await?;
            }

            for route in &v6.routes {
                netlink::route_add(&name, true, route, "static").await?;
            }
            for route in &boot_routes_v6 {
                netlink::route_replace(&name, true, "boot", route).await?;
            }
        }

        // Fan overlay.
        let mut fan_addr: Option<FanAddress> = None;
        let mut cluster_dns: Option<ClusterDns> = None;
        if let Some(fan) = &parsed.fan {
            let underlay = fan.underlay.ok_or_else(|| {
                NetworkError::Validation("fan.underlay_subnet is not set".into())
            })?;

            let fa = overlay::resolve_fan_address(nl, &underlay, &fan.overlay).await?;

            // Tighten the MTU to the underlay device minus encapsulation
            // overhead, when the device MTU is known.
            if let Ok(dev_mtu) = nl.link_mtu(&fa.underlay_dev).await {
                let overhead = match fan.fan_type {
                    FanType::Ipip => overlay::IPIP_OVERHEAD,
                    FanType::Vxlan => overlay::VXLAN_OVERHEAD,
                };
                let fan_mtu = dev_mtu.saturating_sub(overhead);
                if fan_mtu != mtu {
                    mtu = fan_mtu;
                    if parsed.driver != BridgeDriver::Openvswitch {
                        let _ = nl.link_set_mtu(&format!("{}-mtu", name), mtu).await;
                    }
                    nl.link_set_mtu(&name, mtu).await?;
                }
            }

            // IPIP shares tunl0 host-wide and addresses the bridge /24.
            let prefix = match fan.fan_type {
                FanType::Ipip => 24,
                FanType::Vxlan => fa.prefix,
            };
            nl.addr_add(&name, fa.address.into(), prefix).await?;

            match fan.fan_type {
                FanType::Ipip => {
                    overlay::setup_fan_ipip(&fa, &fan.overlay, &underlay).await?;
                }
                FanType::Vxlan => {
                    overlay::setup_fan_vxlan(nl, &name, &fa, &fan.overlay, &underlay, mtu)
                        .await?;
                }
            }

            // Fan networks NAT by default.
            if enabled(&data.config, "ipv4.nat", true) {
                let location = if data.config.get("ipv4.nat.order").map(|s| s.as_str())
                    == Some("after")
                {
                    Location::Append
                } else {
                    Location::Prepend
                };
                fw.network_setup_tunnel_nat(&name, location, &fan.overlay.subnet_string())
                    .await?;
            }

            // A non-empty cluster address marks the intent to be part of a
            // cluster; the DNS processes start in cluster mode even if the
            // cluster is still forming.
            if !self.state.local_cluster_address.is_empty() {
                cluster_dns = Some(ClusterDns {
                    address: fa.address.to_string(),
                    overlay_subnet: fan.overlay.subnet_string(),
                });
            }

            fan_addr = Some(fa);
        }

        // Named tunnels.
        for tunnel in &parsed.tunnels {
            overlay::setup_tunnel(nl, &name, tunnel, mtu).await?;
        }

        // Restart the DNS stack for this network.
        if let Some(mut proc) = data.dnsmasq.take() {
            proc.stop().await?;
        } else {
            dnsmasq::kill_existing(&paths).await?;
        }
        self.kill_forkdns_locked(data, &paths).await?;

        if parsed.wants_dnsmasq() {
            let version = dnsmasq::installed_version().await?;

            // Deterministic rewrite of the static lease directory.
            let entries = load_static_hosts(&paths)?;
            dnsmasq::rewrite_static_hosts(&paths.hosts_dir(), &entries)?;

            let argv = dnsmasq::build_argv(
                &name,
                &parsed,
                &paths,
                &version,
                self.state.debug,
                self.state.unpriv_user.as_deref(),
                fan_addr.as_ref(),
                cluster_dns.as_ref(),
            );
            data.dnsmasq = Some(Dnsmasq::start(&paths, &parsed, argv).await?);

            if let Some(cluster) = &cluster_dns {
                ensure_dir(&paths.forkdns_servers_dir(), 0o755)?;
                if !paths.forkdns_servers_file().exists() {
                    write_atomic(&paths.forkdns_servers_file(), b"")?;
                }
                data.forkdns = Some(
                    self.spawn_forkdns(&name, &cluster.address, &parsed.dns_domain, &paths)
                        .await?,
                );
            }
        } else {
            dnsmasq::cleanup_files(&paths)?;
        }

        Ok(())
    }

    async fn stop_locked(&self, data: &mut NetworkData) -> NetworkResult<()> {
        if self.state.mock {
            return Ok(());
        }

        let name = data.name.clone();
        let nl = &self.state.nl;
        let fw = &self.state.firewall;
        let paths = self.state.network_paths(&name);

        if !nl.link_exists(&name).await {
            return Err(NetworkError::Validation(
                "the network is already stopped".into(),
            ));
        }

        let parsed = ParsedConfig::parse(&data.config)?;
        match parsed.driver {
            BridgeDriver::Openvswitch => {
                run_cmd("ovs-vsctl", &["del-br", &name]).await?;
            }
            BridgeDriver::Native => {
                nl.link_del(&name).await?;
            }
        }

        if enabled(&data.config, "ipv4.firewall", true) {
            fw.network_clear(Family::V4, Table::Filter, &name).await?;
            fw.network_clear(Family::V4, Table::Mangle, &name).await?;
        }
        if is_true(data.config.get("ipv4.nat").map(|s| s.as_str()).unwrap_or("")) {
            fw.network_clear(Family::V4, Table::Nat, &name).await?;
        }
        if enabled(&data.config, "ipv6.firewall", true) {
            fw.network_clear(Family::V6, Table::Filter, &name).await?;
        }
        if is_true(data.config.get("ipv6.nat").map(|s| s.as_str()).unwrap_or("")) {
            fw.network_clear(Family::V6, Table::Nat, &name).await?;
        }

        if let Some(mut proc) = data.dnsmasq.take() {
            proc.stop().await?;
        } else {
            dnsmasq::kill_existing(&paths).await?;
        }
        self.kill_forkdns_locked(data, &paths).await?;

        for dev in nl.links_with_prefix(&format!("{}-", name)).await? {
            nl.link_del(&dev).await?;
        }

        Ok(())
    }

    // ── forkdns ───────────────────────────────────────────────────────

    async fn spawn_forkdns(
        &self,
        name: &str,
        listen_address: &str,
        domain: &str,
        paths: &NetworkPaths,
    ) -> NetworkResult<Supervisor> {
        let log = self.state.log_path(&format!("forkdns.{}.log", name));
        if let Some(parent) = log.parent() {
            ensure_dir(parent, 0o755)?;
        }

        let exec = self.state.exec_path.display().to_string();
        let args = vec![
            "forkdns".to_string(),
            format!("{}:1053", listen_address),
            domain.to_string(),
            name.to_string(),
        ];

        let mut supervisor = Supervisor::new(&exec, args, &paths.forkdns_pidfile(), Some(&log));
        supervisor.start().await?;
        Ok(supervisor)
    }

    async fn kill_forkdns_locked(
        &self,
        data: &mut NetworkData,
        paths: &NetworkPaths,
    ) -> NetworkResult<()> {
        if let Some(mut supervisor) = data.forkdns.take() {
            return supervisor.stop(Duration::from_secs(5)).await;
        }

        let expected = vec![
            self.state.exec_path.display().to_string(),
            "forkdns".to_string(),
        ];
        if let Some(pid) = adopt(&paths.forkdns_pidfile(), &expected)? {
            terminate(pid, Duration::from_secs(5)).await;
        }
        crate::utils::fs::remove_if_exists(&paths.forkdns_pidfile())?;
        Ok(())
    }

    /// Recompute the peer resolver list for the forkdns forwarder from the
    /// other members' network state, rewriting servers.conf atomically only
    /// when the sorted list changed.
    pub async fn refresh_forkdns_servers(&self) -> NetworkResult<()> {
        let (name, paths) = {
            let data = self.data.lock().await;
            (
                data.name.clone(),
                self.state.network_paths(&data.name),
            )
        };

        let members = self.state.store.members().await?;
        let mut addresses = Vec::new();

        for member in &members {
            if member.address == self.state.local_cluster_address {
                continue;
            }

            let client = PeerClient::connect(member, self.state.cluster_cert.as_ref())?;
            let state = match client.network_state(&self.project, &name).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!("forkdns refresh: skipping peer {}: {}", member.address, e);
                    continue;
                }
            };

            for addr in &state.addresses {
                if addr.family == "inet" && addr.scope == "global" {
                    addresses.push(addr.address.clone());
                    break;
                }
            }
        }

        addresses.sort();

        let current = read_lines(&paths.forkdns_servers_file()).unwrap_or_default();
        if current == addresses {
            return Ok(());
        }

        let _guard = self.state.servers_file_lock.lock();
        ensure_dir(&paths.forkdns_servers_dir(), 0o755)?;
        write_atomic(
            &paths.forkdns_servers_file(),
            addresses
                .iter()
                .map(|a| format!("{}\n", a))
                .collect::<String>()
                .as_bytes(),
        )?;
        tracing::info!("updated forkdns server list for {}: {:?}", name, addresses);
        Ok(())
    }
}

/// Load the current static lease entries out of the hosts directory.
fn load_static_hosts(paths: &NetworkPaths) -> NetworkResult<Vec<dnsmasq::StaticHostEntry>> {
    let dir = paths.hosts_dir();
    let mut entries = Vec::new();
    if !dir.exists() {
        return Ok(entries);
    }

    for entry in std::fs::read_dir(&dir).map_err(NetworkError::Io)? {
        let entry = entry.map_err(NetworkError::Io)?;
        let instance = entry.file_name().to_string_lossy().to_string();
        let contents = std::fs::read_to_string(entry.path()).map_err(NetworkError::Io)?;
        let line = contents.lines().next().unwrap_or("");
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() == 3 {
            entries.push(dnsmasq::StaticHostEntry {
                instance,
                mac: fields[0].to_string(),
                ip: fields[1].to_string(),
                name: fields[2].to_string(),
            });
        }
    }
    Ok(entries)
}

fn is_not_found(err: &NetworkError) -> bool {
    matches!(err, NetworkError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::BgpSpeaker;
    use crate::net::firewall::Firewall;
    use crate::net::netlink::NetlinkHandle;
    use crate::store::{now_ts, Store};
    use tempfile::TempDir;

    async fn mock_state(var_dir: &TempDir) -> Arc<State> {
        let store = Store::open(&var_dir.path().join("db.sqlite")).await.unwrap();
        Arc::new(State {
            var_dir: var_dir.path().to_path_buf(),
            store,
            firewall: Firewall::new(),
            nl: Arc::new(NetlinkHandle::new().unwrap()),
            bgp: BgpSpeaker::new(),
            shared_device_lock: tokio::sync::Mutex::new(()),
            servers_file_lock: parking_lot::Mutex::new(()),
            mock: true,
            debug: false,
            unpriv_user: None,
            cluster_cert: None,
            local_cluster_address: String::new(),
            exec_path: std::path::PathBuf::from("/usr/bin/warren"),
        })
    }

    fn cfg(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn make_network(
        state: &Arc<State>,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Arc<Network> {
        let id = state
            .store
            .create_network("default", name, "", config)
            .await
            .unwrap();
        let record = NetworkRecord {
            id,
            project: "default".to_string(),
            name: name.to_string(),
            description: String::new(),
            state: crate::store::NetworkState::Pending,
            config: config.clone(),
        };
        Network::new(state.clone(), &record)
    }

    #[tokio::test]
    async fn start_marks_record_created() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;
        let config = cfg(&[("ipv4.address", "10.0.0.1/24"), ("ipv4.nat", "true")]);
        let network = make_network(&state, "br0", &config).await;

        network.start().await.unwrap();

        let record = state
            .store
            .get_network("default", "br0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, crate::store::NetworkState::Created);

        // BGP prefixes were announced under the network's owner tag.
        assert!(state
            .bgp
            .prefixes()
            .iter()
            .all(|p| p.owner == format!("network_{}", network.id())));
    }

    #[tokio::test]
    async fn update_noop_when_nothing_changed() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;
        let config = cfg(&[("ipv4.address", "10.0.0.1/24")]);
        let network = make_network(&state, "br0", &config).await;

        let put = NetworkPut {
            description: String::new(),
            config: config.clone(),
        };
        network.update(put, false).await.unwrap();

        // Nothing changed, so no store write happened; record still intact.
        let record = state
            .store
            .get_network("default", "br0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.config, config);
    }

    #[tokio::test]
    async fn update_applies_and_persists() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;
        let config = cfg(&[("ipv4.address", "10.0.0.1/24"), ("ipv4.nat", "true")]);
        let network = make_network(&state, "br0", &config).await;

        let new_config = cfg(&[("ipv4.address", "10.0.0.1/24"), ("ipv4.nat", "false")]);
        let put = NetworkPut {
            description: "updated".to_string(),
            config: new_config.clone(),
        };
        network.update(put, false).await.unwrap();

        assert_eq!(network.config().await, new_config);
        let record = state
            .store
            .get_network("default", "br0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.config, new_config);
        assert_eq!(record.description, "updated");
    }

    #[tokio::test]
    async fn update_rejects_invalid_config_before_side_effects() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;
        let config = cfg(&[("ipv4.address", "10.0.0.1/24")]);
        let network = make_network(&state, "br0", &config).await;

        let put = NetworkPut {
            description: String::new(),
            config: cfg(&[("ipv4.address", "not-a-cidr")]),
        };
        let err = network.update(put, false).await.unwrap_err();
        assert!(matches!(err, NetworkError::Validation(_)));
        assert_eq!(network.config().await, config);
    }

    #[tokio::test]
    async fn failed_update_restores_config_and_store() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;

        // A peer with a stale heartbeat makes the "all" notifier fail, which
        // aborts the update midway: after the in-memory apply but before the
        // store write.
        state.store.add_member("node2", "10.9.9.2:8443").await.unwrap();
        state
            .store
            .set_member_heartbeat("10.9.9.2:8443", now_ts() - 300)
            .await
            .unwrap();

        let config = cfg(&[("ipv4.address", "10.0.0.1/24"), ("ipv4.nat", "true")]);
        let network = make_network(&state, "br0", &config).await;

        let put = NetworkPut {
            description: "should not stick".to_string(),
            config: cfg(&[
                ("ipv4.address", "10.0.0.1/24"),
                ("ipv4.nat", "false"),
                ("ipv4.firewall", "false"),
            ]),
        };
        let err = network.update(put, false).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("peer node") && message.contains("is down"));

        // In-memory and stored config both hold the original.
        assert_eq!(network.config().await, config);
        let record = state
            .store
            .get_network("default", "br0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.config, config);
        assert_eq!(record.description, "");
    }

    #[tokio::test]
    async fn notification_updates_apply_without_fanout() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;

        // Down peer would fail an originating update, but not a replay.
        state.store.add_member("node2", "10.9.9.2:8443").await.unwrap();
        state
            .store
            .set_member_heartbeat("10.9.9.2:8443", now_ts() - 300)
            .await
            .unwrap();

        let config = cfg(&[("ipv4.address", "10.0.0.1/24")]);
        let network = make_network(&state, "br0", &config).await;

        let new_config = cfg(&[("ipv4.address", "10.0.0.1/24"), ("ipv4.nat", "true")]);
        let put = NetworkPut {
            description: String::new(),
            config: new_config.clone(),
        };
        network.update(put, true).await.unwrap();
        assert_eq!(network.config().await, new_config);
    }

    #[tokio::test]
    async fn config_changed_reports_non_user_keys() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;
        let config = cfg(&[("ipv4.address", "10.0.0.1/24"), ("user.a", "1")]);
        let network = make_network(&state, "br0", &config).await;

        let put = NetworkPut {
            description: String::new(),
            config: cfg(&[
                ("ipv4.address", "10.0.0.1/24"),
                ("user.a", "2"),
                ("ipv4.nat", "true"),
            ]),
        };
        let (needed, changed_non_user, old) = network.config_changed(&put).await;
        assert!(needed);
        assert_eq!(changed_non_user, vec!["ipv4.nat".to_string()]);
        assert_eq!(old.config, config);
    }

    #[tokio::test]
    async fn rename_moves_directory_and_record() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;
        let config = cfg(&[("ipv4.address", "10.0.0.1/24")]);
        let network = make_network(&state, "br0", &config).await;

        let old_dir = state.network_paths("br0");
        ensure_dir(old_dir.dir(), 0o711).unwrap();
        std::fs::write(old_dir.dir().join("dnsmasq.raw"), "x").unwrap();

        network.rename("br1").await.unwrap();

        assert_eq!(network.name().await, "br1");
        assert!(!old_dir.dir().exists());
        assert!(state.network_paths("br1").dir().join("dnsmasq.raw").exists());
        assert!(state.store.get_network("default", "br0").await.unwrap().is_none());
        assert!(state.store.get_network("default", "br1").await.unwrap().is_some());

        assert!(network.rename("bad:name").await.is_err());
    }

    #[tokio::test]
    async fn delete_erases_record_and_directory() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;
        let config = cfg(&[("ipv4.address", "10.0.0.1/24")]);
        let network = make_network(&state, "br0", &config).await;

        let paths = state.network_paths("br0");
        ensure_dir(paths.dir(), 0o711).unwrap();

        network.delete(false).await.unwrap();
        assert!(!paths.dir().exists());
        assert!(state.store.get_network("default", "br0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_as_notification_keeps_record() {
        let dir = TempDir::new().unwrap();
        let state = mock_state(&dir).await;
        let config = cfg(&[("ipv4.address", "10.0.0.1/24")]);
        let network = make_network(&state, "br0", &config).await;

        network.delete(true).await.unwrap();
        assert!(state.store.get_network("default", "br0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn static_host_loading_round_trip() {
        let dir = TempDir::new().unwrap();
        let paths = NetworkPaths::new(dir.path(), "br0");
        ensure_dir(&paths.hosts_dir(), 0o755).unwrap();

        let entry = dnsmasq::StaticHostEntry {
            instance: "web1".to_string(),
            mac: "00:16:3e:aa:bb:cc".to_string(),
            ip: "10.0.0.5".to_string(),
            name: "web1".to_string(),
        };
        dnsmasq::write_static_host(&paths.hosts_dir(), &entry).unwrap();

        let loaded = load_static_hosts(&paths).unwrap();
        assert_eq!(loaded, vec![entry]);
    }
}
