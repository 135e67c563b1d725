// Per-instance device attachments: bridged, routed and proxy devices that
// plug an instance into (or forward traffic across) a managed network.
//
// Devices follow a staged-revert pattern: every successful kernel-facing
// step pushes an undo, and a failure later in the start sequence runs the
// undos in reverse. Start sequences run under the process-wide shared
// device lock because VLAN-parent creation and neighbour-proxy setup are
// not atomic across callers.

pub mod bridged;
pub mod proxy;
pub mod routed;

use crate::net::error::{NetworkError, NetworkResult};
use crate::net::netlink::{run_cmd, NetlinkHandle};
use crate::net::{NetworkLookup, State};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceType {
    Container,
    Vm,
}

/// The slice of instance state a device needs.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub project: String,
    pub name: String,
    pub instance_type: InstanceType,
    /// Init pid when the instance is running.
    pub init_pid: Option<u32>,
    /// Expanded device configs of the instance, keyed by device name.
    pub devices: HashMap<String, HashMap<String, String>>,
}

/// Shared dependencies handed to every device.
#[derive(Clone)]
pub struct DeviceContext {
    pub state: Arc<State>,
    pub networks: Arc<dyn NetworkLookup>,
}

/// Key/value items handed to the instance driver after a successful start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConfig {
    pub network_interface: Vec<(String, String)>,
}

impl RunConfig {
    pub fn push(&mut self, key: &str, value: String) {
        self.network_interface.push((key.to_string(), value));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.network_interface
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// ── Staged revert ─────────────────────────────────────────────────────

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Collects undo steps during a start sequence; `fail` runs them in reverse
/// order, `success` discards them.
#[derive(Default)]
pub struct Revert {
    undos: Vec<Undo>,
}

impl Revert {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, undo: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.undos.push(Box::new(undo));
    }

    pub async fn fail(mut self) {
        while let Some(undo) = self.undos.pop() {
            undo().await;
        }
    }

    pub fn success(self) {
        // Undos are dropped without running.
    }
}

// ── Device dispatch ───────────────────────────────────────────────────

/// A loaded device attachment, dispatched on its type tag.
pub enum NicDevice {
    Bridged(bridged::BridgedNic),
    Routed(routed::RoutedNic),
    Proxy(proxy::ProxyDevice),
}

impl NicDevice {
    /// Instantiate a device from its config map. The type tag is "nictype"
    /// for NICs and "type" for proxy devices.
    pub fn load(
        ctx: DeviceContext,
        inst: InstanceInfo,
        device_name: &str,
        config: HashMap<String, String>,
    ) -> NetworkResult<Self> {
        let device_type = config.get("type").map(|s| s.as_str()).unwrap_or("");
        let nic_type = config.get("nictype").map(|s| s.as_str()).unwrap_or("");

        match (device_type, nic_type) {
            ("nic", "bridged") => Ok(NicDevice::Bridged(bridged::BridgedNic::new(
                ctx,
                inst,
                device_name,
                config,
            ))),
            ("nic", "routed") => Ok(NicDevice::Routed(routed::RoutedNic::new(
                ctx,
                inst,
                device_name,
                config,
            ))),
            ("proxy", _) => Ok(NicDevice::Proxy(proxy::ProxyDevice::new(
                ctx,
                inst,
                device_name,
                config,
            ))),
            _ => Err(NetworkError::Validation(format!(
                "unsupported device type '{}'/'{}'",
                device_type, nic_type
            ))),
        }
    }

    pub fn validate(&self) -> NetworkResult<()> {
        match self {
            NicDevice::Bridged(d) => d.validate(),
            NicDevice::Routed(d) => d.validate(),
            NicDevice::Proxy(d) => d.validate(),
        }
    }

    pub async fn start(&self) -> NetworkResult<RunConfig> {
        match self {
            NicDevice::Bridged(d) => d.start().await,
            NicDevice::Routed(d) => d.start().await,
            NicDevice::Proxy(d) => d.start().await,
        }
    }

    pub async fn stop(&self) -> NetworkResult<()> {
        match self {
            NicDevice::Bridged(d) => d.stop().await,
            NicDevice::Routed(d) => d.stop().await,
            NicDevice::Proxy(d) => d.stop().await,
        }
    }

    /// Live config update. Only routed NICs carry fields that can change
    /// while the instance runs; other devices are re-created instead.
    pub async fn update(&self, is_running: bool) -> NetworkResult<()> {
        match self {
            NicDevice::Routed(d) => d.update(is_running).await,
            _ => Ok(()),
        }
    }
}

// ── Shared helpers ────────────────────────────────────────────────────

/// Generate a random host-side device name, e.g. "veth3f9ac1d2".
pub fn random_device_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &id[..8])
}

/// Effective parent interface for a (parent, vlan) pair.
pub fn host_device_name(parent: &str, vlan: &str) -> String {
    if vlan.is_empty() {
        parent.to_string()
    } else {
        format!("{}.{}", parent, vlan)
    }
}

/// Create a veth pair for an instance NIC, applying mtu/hwaddr from the
/// device config to the peer end. Returns the peer name.
pub async fn create_veth_pair(
    nl: &NetlinkHandle,
    host_name: &str,
    config: &HashMap<String, String>,
) -> NetworkResult<String> {
    let peer_name = random_device_name("veth");
    nl.link_add_veth(host_name, &peer_name).await?;

    if let Some(mtu) = config.get("mtu").filter(|v| !v.is_empty()) {
        let mtu: u32 = mtu
            .parse()
            .map_err(|_| NetworkError::Validation(format!("invalid mtu '{}'", mtu)))?;
        nl.link_set_mtu(host_name, mtu).await?;
        nl.link_set_mtu(&peer_name, mtu).await?;
    }
    if let Some(hwaddr) = config.get("hwaddr").filter(|v| !v.is_empty()) {
        nl.link_set_hwaddr(&peer_name, hwaddr).await?;
    }

    Ok(peer_name)
}

/// Create a tap device for a VM NIC.
pub async fn create_tap(
    nl: &NetlinkHandle,
    host_name: &str,
    config: &HashMap<String, String>,
) -> NetworkResult<()> {
    nl.link_add_tap(host_name).await?;
    if let Some(mtu) = config.get("mtu").filter(|v| !v.is_empty()) {
        let mtu: u32 = mtu
            .parse()
            .map_err(|_| NetworkError::Validation(format!("invalid mtu '{}'", mtu)))?;
        nl.link_set_mtu(host_name, mtu).await?;
    }
    Ok(())
}

/// Create the VLAN parent for a device if it doesn't exist yet. Returns
/// true when this call created it (recorded in volatile so teardown knows
/// whether the parent is ours to remove).
pub async fn create_vlan_parent_if_needed(
    nl: &NetlinkHandle,
    parent: &str,
    effective: &str,
    vlan: &str,
) -> NetworkResult<bool> {
    if nl.link_exists(effective).await {
        return Ok(false);
    }

    let vlan_id: u16 = vlan
        .parse()
        .map_err(|_| NetworkError::Validation(format!("invalid vlan '{}'", vlan)))?;
    nl.link_add_vlan(effective, parent, vlan_id).await?;
    nl.link_set_up(effective).await?;
    Ok(true)
}

/// Parse a rate like "10Mbit" / "1Gbit" into mbit.
pub fn parse_rate_mbit(value: &str) -> NetworkResult<u32> {
    let lower = value.to_ascii_lowercase();
    let (digits, unit) = lower.split_at(
        lower
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(lower.len()),
    );
    let number: u32 = digits
        .parse()
        .map_err(|_| NetworkError::Validation(format!("invalid rate '{}'", value)))?;

    match unit {
        "mbit" | "" => Ok(number),
        "gbit" => Ok(number * 1000),
        "kbit" => Ok(number.max(1000) / 1000),
        _ => Err(NetworkError::Validation(format!(
            "invalid rate unit in '{}'",
            value
        ))),
    }
}

/// Apply a NIC's limits.* keys to its host-side interface. limits.ingress
/// is traffic towards the instance, shaped as egress on the host port;
/// limits.egress the other way around; limits.max sets both. Re-applying
/// replaces the previous qdiscs, so live updates converge.
pub async fn setup_host_veth_limits(
    host_name: &str,
    config: &HashMap<String, String>,
) -> NetworkResult<()> {
    let get = |key: &str| config.get(key).map(|s| s.as_str()).unwrap_or("");

    let max = get("limits.max");
    let ingress = if max.is_empty() { get("limits.ingress") } else { max };
    let egress = if max.is_empty() { get("limits.egress") } else { max };

    if !ingress.is_empty() {
        let rate = parse_rate_mbit(ingress)?;
        let _ = run_cmd("tc", &["qdisc", "del", "dev", host_name, "root"]).await;
        run_cmd(
            "tc",
            &[
                "qdisc", "add", "dev", host_name, "root", "tbf", "rate",
                &format!("{}mbit", rate), "burst", "256kb", "latency", "50ms",
            ],
        )
        .await?;
    }

    if !egress.is_empty() {
        let rate = parse_rate_mbit(egress)?;
        let _ = run_cmd("tc", &["qdisc", "del", "dev", host_name, "ingress"]).await;
        run_cmd("tc", &["qdisc", "add", "dev", host_name, "ingress"]).await?;
        run_cmd(
            "tc",
            &[
                "filter", "add", "dev", host_name, "parent", "ffff:", "protocol", "ip",
                "u32", "match", "u32", "0", "0", "police", "rate",
                &format!("{}mbit", rate), "burst", "256kb", "drop", "flowid", ":1",
            ],
        )
        .await?;
    }

    Ok(())
}

/// Validate a NIC's limits.* rate keys.
pub fn validate_nic_limits(config: &HashMap<String, String>) -> NetworkResult<()> {
    for key in ["limits.ingress", "limits.egress", "limits.max"] {
        let value = config.get(key).map(|s| s.as_str()).unwrap_or("");
        if !value.is_empty() {
            parse_rate_mbit(value)?;
        }
    }
    Ok(())
}

/// Common validation for NIC host-side naming keys.
pub fn validate_nic_common(config: &HashMap<String, String>) -> NetworkResult<()> {
    if let Some(mtu) = config.get("mtu").filter(|v| !v.is_empty()) {
        mtu.parse::<u32>()
            .map_err(|_| NetworkError::Validation(format!("invalid mtu '{}'", mtu)))?;
    }
    if let Some(hwaddr) = config.get("hwaddr").filter(|v| !v.is_empty()) {
        crate::net::netlink::parse_mac(hwaddr)?;
    }
    if let Some(host_name) = config.get("host_name").filter(|v| !v.is_empty()) {
        if host_name.len() > 15 {
            return Err(NetworkError::Validation(format!(
                "host_name '{}' is longer than 15 characters",
                host_name
            )));
        }
    }
    if let Some(vlan) = config.get("vlan").filter(|v| !v.is_empty()) {
        vlan.parse::<u16>()
            .map_err(|_| NetworkError::Validation(format!("invalid vlan '{}'", vlan)))?;
        // A VLAN only makes sense on top of a parent interface.
        if config.get("parent").map(|v| v.is_empty()).unwrap_or(true) {
            return Err(NetworkError::Validation(
                "the vlan setting can only be used when combined with a parent interface".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_names_fit_interface_limits() {
        let name = random_device_name("veth");
        assert!(name.starts_with("veth"));
        assert_eq!(name.len(), 12);
        assert_ne!(random_device_name("veth"), random_device_name("veth"));
    }

    #[test]
    fn effective_parent_names() {
        assert_eq!(host_device_name("eth0", ""), "eth0");
        assert_eq!(host_device_name("eth0", "100"), "eth0.100");
    }

    #[test]
    fn rates() {
        assert_eq!(parse_rate_mbit("10Mbit").unwrap(), 10);
        assert_eq!(parse_rate_mbit("2Gbit").unwrap(), 2000);
        assert_eq!(parse_rate_mbit("100").unwrap(), 100);
        assert!(parse_rate_mbit("10parsecs").is_err());
        assert!(parse_rate_mbit("fast").is_err());
    }

    #[test]
    fn limits_keys_are_validated() {
        let mut config = HashMap::new();
        config.insert("limits.max".to_string(), "50Mbit".to_string());
        validate_nic_limits(&config).unwrap();

        config.insert("limits.ingress".to_string(), "fast".to_string());
        assert!(validate_nic_limits(&config).is_err());
    }

    #[test]
    fn vlan_requires_parent() {
        let mut config = HashMap::new();
        config.insert("vlan".to_string(), "100".to_string());
        assert!(validate_nic_common(&config).is_err());

        config.insert("parent".to_string(), "eth0".to_string());
        validate_nic_common(&config).unwrap();

        config.insert("vlan".to_string(), "not-a-vlan".to_string());
        assert!(validate_nic_common(&config).is_err());
    }

    #[tokio::test]
    async fn revert_runs_undos_in_reverse() {
        use std::sync::{Arc, Mutex};

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut revert = Revert::new();

        for i in 0..3 {
            let order = order.clone();
            revert.add(move || {
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                })
            });
        }

        revert.fail().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn revert_success_skips_undos() {
        use std::sync::{Arc, Mutex};

        let ran = Arc::new(Mutex::new(false));
        let mut revert = Revert::new();
        let ran_clone = ran.clone();
        revert.add(move || {
            Box::pin(async move {
                *ran_clone.lock().unwrap() = true;
            })
        });

        revert.success();
        assert!(!*ran.lock().unwrap());
    }
}
