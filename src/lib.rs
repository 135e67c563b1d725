//! warren: the managed-bridge network engine of a container/VM manager.
//!
//! The daemon owns per-host network runtime state: bridge interfaces and
//! their addresses/routes/firewall rules, one dnsmasq per network, overlay
//! tunnels, instance NIC attachments, and the cluster-wide replication of
//! network configuration. The REST surface, instance runtimes and storage
//! layers are external collaborators.

pub mod bgp;
pub mod cluster;
pub mod device;
pub mod forkproxy;
pub mod net;
pub mod store;
pub mod utils;
