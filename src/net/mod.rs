// Managed-network engine: kernel facade, firewall policy, DHCP/DNS
// supervision, overlay construction and the per-network reconciliation
// driver.

pub mod bridge;
pub mod config;
pub mod dnsmasq;
pub mod error;
pub mod firewall;
pub mod forkdns;
pub mod netlink;
pub mod overlay;
pub mod sysctl;

use crate::bgp::BgpSpeaker;
use crate::cluster::ClusterCert;
use crate::net::bridge::Network;
use crate::net::error::NetworkResult;
use crate::net::firewall::Firewall;
use crate::net::netlink::NetlinkHandle;
use crate::store::Store;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk layout of one network's directory under `<var_dir>/networks/`.
#[derive(Debug, Clone)]
pub struct NetworkPaths {
    dir: PathBuf,
}

impl NetworkPaths {
    pub fn new(var_dir: &Path, name: &str) -> Self {
        Self {
            dir: var_dir.join("networks").join(name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn leases(&self) -> PathBuf {
        self.dir.join("dnsmasq.leases")
    }

    pub fn hosts_dir(&self) -> PathBuf {
        self.dir.join("dnsmasq.hosts")
    }

    pub fn pidfile(&self) -> PathBuf {
        self.dir.join("dnsmasq.pid")
    }

    pub fn raw(&self) -> PathBuf {
        self.dir.join("dnsmasq.raw")
    }

    pub fn forkdns_pidfile(&self) -> PathBuf {
        self.dir.join("forkdns.pid")
    }

    pub fn forkdns_servers_dir(&self) -> PathBuf {
        self.dir.join(forkdns::SERVERS_LIST_PATH)
    }

    pub fn forkdns_servers_file(&self) -> PathBuf {
        self.forkdns_servers_dir().join(forkdns::SERVERS_LIST_FILE)
    }
}

/// Process-wide context shared by the engine, the device attachments and
/// the cluster plumbing. Owns the cross-cutting locks so no module keeps
/// global mutable state of its own.
pub struct State {
    pub var_dir: PathBuf,
    pub store: Store,
    pub firewall: Firewall,
    pub nl: Arc<NetlinkHandle>,
    pub bgp: BgpSpeaker,
    /// Serialises NIC start across all instances: VLAN-parent creation and
    /// neighbour-proxy setup are not atomic across callers.
    pub shared_device_lock: tokio::sync::Mutex<()>,
    /// Serialises atomic replacement of the forkdns servers files.
    pub servers_file_lock: parking_lot::Mutex<()>,
    /// Short-circuit all kernel work (test harnesses).
    pub mock: bool,
    pub debug: bool,
    /// User dnsmasq drops privileges to, when present on the host.
    pub unpriv_user: Option<String>,
    /// TLS material for the cluster channel; None on standalone hosts.
    pub cluster_cert: Option<ClusterCert>,
    /// This member's cluster address; empty when not clustered.
    pub local_cluster_address: String,
    /// Our own binary, re-executed for forkdns/forkproxy children.
    pub exec_path: PathBuf,
}

impl State {
    pub fn network_paths(&self, name: &str) -> NetworkPaths {
        NetworkPaths::new(&self.var_dir, name)
    }

    pub fn log_path(&self, file: &str) -> PathBuf {
        self.var_dir.join("logs").join(file)
    }
}

/// Lookup seam consumed by device attachments, implemented by the registry.
/// Keeps devices depending on an interface rather than the engine itself.
pub trait NetworkLookup: Send + Sync {
    fn get_network(&self, project: &str, name: &str) -> Option<Arc<Network>>;
}

/// All managed networks known to this daemon, keyed by project/name.
pub struct NetworkRegistry {
    state: Arc<State>,
    networks: DashMap<String, Arc<Network>>,
}

fn registry_key(project: &str, name: &str) -> String {
    format!("{}/{}", project, name)
}

impl NetworkRegistry {
    pub fn new(state: Arc<State>) -> Self {
        Self {
            state,
            networks: DashMap::new(),
        }
    }

    /// Instantiate engine objects for every stored network record.
    pub async fn load_all(&self, project: &str) -> NetworkResult<()> {
        for record in self.state.store.list_networks(project).await? {
            let network = Network::new(self.state.clone(), &record);
            self.networks
                .insert(registry_key(&record.project, &record.name), network);
        }
        Ok(())
    }

    pub fn networks(&self) -> Vec<Arc<Network>> {
        self.networks.iter().map(|e| e.value().clone()).collect()
    }

    /// First phase of network creation: validate, record as pending, and
    /// register the engine object. The second phase is `Network::start`,
    /// run on every member before the record is marked created.
    pub async fn create(
        &self,
        project: &str,
        name: &str,
        put: &config::NetworkPut,
    ) -> NetworkResult<Arc<Network>> {
        config::validate_config(name, &put.config)?;

        let id = self
            .state
            .store
            .create_network(project, name, &put.description, &put.config)
            .await?;

        let record = crate::store::NetworkRecord {
            id,
            project: project.to_string(),
            name: name.to_string(),
            description: put.description.clone(),
            state: crate::store::NetworkState::Pending,
            config: put.config.clone(),
        };
        let network = Network::new(self.state.clone(), &record);
        self.insert(network.clone(), project, name);
        Ok(network)
    }

    pub fn insert(&self, network: Arc<Network>, project: &str, name: &str) {
        self.networks.insert(registry_key(project, name), network);
    }

    pub fn remove(&self, project: &str, name: &str) {
        self.networks.remove(&registry_key(project, name));
    }

    /// Re-key a renamed network.
    pub fn rename(&self, project: &str, old_name: &str, new_name: &str) {
        if let Some((_, network)) = self.networks.remove(&registry_key(project, old_name)) {
            self.networks
                .insert(registry_key(project, new_name), network);
        }
    }

    /// Give dependent networks a chance to react to a config change.
    pub async fn notify_dependent_networks(
        &self,
        project: &str,
        changed_name: &str,
        changed_keys: &[String],
    ) {
        for network in self.networks() {
            if network.project() != project || network.name().await == changed_name {
                continue;
            }
            if let Err(e) = network
                .handle_dependency_change(changed_name, changed_keys)
                .await
            {
                tracing::warn!(
                    "dependent network {} failed to apply change from {}: {}",
                    network.name().await,
                    changed_name,
                    e
                );
            }
        }
    }
}

impl NetworkLookup for NetworkRegistry {
    fn get_network(&self, project: &str, name: &str) -> Option<Arc<Network>> {
        self.networks
            .get(&registry_key(project, name))
            .map(|entry| entry.value().clone())
    }
}
