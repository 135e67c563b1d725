// Bridged NIC: a veth pair whose host end is a port on a managed bridge.
//
// The generated host-side name is volatile state: it is persisted so a
// later stop (possibly after a daemon restart) can find and remove exactly
// the interface this device created.

use crate::device::{
    create_tap, create_veth_pair, random_device_name, setup_host_veth_limits,
    validate_nic_common, validate_nic_limits, DeviceContext, InstanceInfo, InstanceType, Revert,
    RunConfig,
};
use crate::net::bridge::Network;
use crate::net::config::is_true;
use crate::net::dnsmasq::{remove_static_host, write_static_host, StaticHostEntry};
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::netlink::run_cmd;
use std::collections::HashMap;
use std::sync::Arc;

pub struct BridgedNic {
    ctx: DeviceContext,
    inst: InstanceInfo,
    name: String,
    config: HashMap<String, String>,
}

impl BridgedNic {
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
        if self.get("parent").is_empty() {
            return Err(NetworkError::Validation(
                "bridged NIC requires a parent network".into(),
            ));
        }
        validate_nic_common(&self.config)?;

        for (key, check_v6) in [("ipv4.address", false), ("ipv6.address", true)] {
            let value = self.get(key);
            if value.is_empty() {
                continue;
            }
            let ok = if check_v6 {
                value.parse::<std::net::Ipv6Addr>().is_ok()
            } else {
                value.parse::<std::net::Ipv4Addr>().is_ok()
            };
            if !ok {
                return Err(NetworkError::Validation(format!(
                    "invalid {} '{}'",
                    key, value
                )));
            }
        }

        validate_nic_limits(&self.config)?;

        Ok(())
    }

    fn network(&self) -> NetworkResult<Arc<Network>> {
        let parent = self.get("parent");
        self.ctx
            .networks
            .get_network(&self.inst.project, parent)
            .or_else(|| self.ctx.networks.get_network("default", parent))
            .ok_or_else(|| {
                NetworkError::Precondition(format!("parent network '{}' is not available", parent))
            })
    }

    pub async fn start(&self) -> NetworkResult<RunConfig> {
        self.validate()?;
        let network = self.network()?;

        let _lock = self.ctx.state.shared_device_lock.lock().await;
        let mut revert = Revert::new();

        match self.start_inner(&mut revert, &network).await {
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

    async fn start_inner(
        &self,
        revert: &mut Revert,
        network: &Arc<Network>,
    ) -> NetworkResult<RunConfig> {
        let state = &self.ctx.state;
        let nl = &state.nl;
        let bridge = network.name().await;

        let volatile = state
            .store
            .volatile_get(&self.inst.project, &self.inst.name, &self.name)
            .await?;

        let host_name = if !self.get("host_name").is_empty() {
            self.get("host_name").to_string()
        } else if let Some(existing) = volatile.get("host_name").filter(|v| !v.is_empty()) {
            existing.clone()
        } else {
            random_device_name("veth")
        };

        // Create the pair (or tap) and keep an undo for it.
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

        nl.link_set_master(&host_name, &bridge).await?;
        nl.link_set_up(&host_name).await?;

        setup_host_veth_limits(&host_name, &self.config).await?;

        // MAC filtering: only frames from the configured hwaddr leave the
        // instance's port.
        if is_true(self.get("security.mac_filtering")) && !self.get("hwaddr").is_empty() {
            run_cmd(
                "ebtables",
                &[
                    "-A", "FORWARD", "-i", &host_name, "-s", "!", self.get("hwaddr"), "-j",
                    "DROP",
                ],
            )
            .await?;
            let host_name_undo = host_name.clone();
            let hwaddr = self.get("hwaddr").to_string();
            revert.add(move || {
                Box::pin(async move {
                    let _ = run_cmd(
                        "ebtables",
                        &[
                            "-D", "FORWARD", "-i", &host_name_undo, "-s", "!", &hwaddr, "-j",
                            "DROP",
                        ],
                    )
                    .await;
                })
            });
        }

        // Static DHCP allocation when the NIC pins an address.
        if !self.get("ipv4.address").is_empty() && network.has_dhcp_v4().await {
            let entry = StaticHostEntry {
                instance: self.inst.name.clone(),
                mac: self.get("hwaddr").to_string(),
                ip: self.get("ipv4.address").to_string(),
                name: self.inst.name.clone(),
            };
            write_static_host(&network.hosts_dir().await, &entry)?;
        }

        let mut volatile_update = HashMap::new();
        volatile_update.insert("host_name".to_string(), host_name.clone());
        state
            .store
            .volatile_set(&self.inst.project, &self.inst.name, &self.name, &volatile_update)
            .await?;

        let mut run = RunConfig::default();
        match self.inst.instance_type {
            InstanceType::Container => {
                run.push("type", "phys".to_string());
                run.push("link", peer_name);
                run.push("name", self.get("name").to_string());
                run.push("flags", "up".to_string());
            }
            InstanceType::Vm => {
                run.push("devName", self.name.clone());
                run.push("link", peer_name);
                run.push("hwaddr", self.get("hwaddr").to_string());
            }
        }
        Ok(run)
    }

    pub async fn stop(&self) -> NetworkResult<()> {
        let state = &self.ctx.state;
        let mut errors: Vec<String> = Vec::new();

        let volatile = state
            .store
            .volatile_get(&self.inst.project, &self.inst.name, &self.name)
            .await?;

        if let Some(host_name) = volatile.get("host_name").filter(|v| !v.is_empty()) {
            // Removing the host end deletes the peer too.
            if let Err(e) = state.nl.link_del(host_name).await {
                errors.push(format!("failed to remove interface {}: {}", host_name, e));
            }

            if is_true(self.get("security.mac_filtering")) && !self.get("hwaddr").is_empty() {
                let _ = run_cmd(
                    "ebtables",
                    &[
                        "-D", "FORWARD", "-i", host_name, "-s", "!", self.get("hwaddr"), "-j",
                        "DROP",
                    ],
                )
                .await;
            }
        }

        if let Ok(network) = self.network() {
            let _ = remove_static_host(&network.hosts_dir().await, &self.inst.name);
        }

        let mut clear = HashMap::new();
        clear.insert("host_name".to_string(), String::new());
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

