// Kernel facade: thin wrappers around link/address/route/neighbour state.
//
// Link and address operations go through rtnetlink on a persistent handle.
// Routes, neighbour proxies and tunnel devices go through ip(8) because the
// operations the engine needs (proto-scoped flushes, fan-map tunnels,
// neighbour proxy entries) have no stable rtnetlink equivalent.
//
// Every write is idempotent: retrying against a consistent kernel produces
// no observable difference. Failed shell commands that look transient
// (rule-set busy, EAGAIN) are retried once with a short backoff.

use crate::net::error::{NetworkError, NetworkResult};
use futures::TryStreamExt;
use netlink_packet_route::address::nlas::Nla as AddrNla;
use netlink_packet_route::link::nlas::Nla as LinkNla;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Scope value for globally routable addresses (RT_SCOPE_UNIVERSE).
const SCOPE_GLOBAL: u8 = 0;

/// Persistent netlink handle, one per process, shared by the engine and all
/// device attachments.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive for the life of the handle.
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    // ── Link creation ─────────────────────────────────────────────────

    /// Create a bridge. Fails with AlreadyExists if the name is taken.
    pub async fn link_add_bridge(&self, name: &str) -> NetworkResult<u32> {
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(|e| {
                if e.to_string().contains("File exists") {
                    NetworkError::AlreadyExists(name.to_string())
                } else {
                    NetworkError::Netlink(e)
                }
            })?;
        self.link_index(name).await
    }

    /// Create a dummy device (used to pin bridge MTU).
    pub async fn link_add_dummy(&self, name: &str) -> NetworkResult<u32> {
        self.handle
            .link()
            .add()
            .dummy(name.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;
        self.link_index(name).await
    }

    /// Create a veth pair, deleting any stale interfaces with the same names
    /// first. Returns (host_index, peer_index).
    pub async fn link_add_veth(&self, host: &str, peer: &str) -> NetworkResult<(u32, u32)> {
        self.link_del(host).await?;
        self.link_del(peer).await?;

        self.handle
            .link()
            .add()
            .veth(host.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        let host_idx = self.link_index(host).await?;
        let peer_idx = self.link_index(peer).await?;
        Ok((host_idx, peer_idx))
    }

    /// Create a VLAN device on top of a parent interface.
    pub async fn link_add_vlan(&self, name: &str, parent: &str, vlan_id: u16) -> NetworkResult<u32> {
        let parent_idx = self.link_index(parent).await?;
        self.handle
            .link()
            .add()
            .vlan(name.to_string(), parent_idx, vlan_id)
            .execute()
            .await
            .map_err(|e| {
                if e.to_string().contains("File exists") {
                    NetworkError::AlreadyExists(name.to_string())
                } else {
                    NetworkError::Netlink(e)
                }
            })?;
        self.link_index(name).await
    }

    /// Create a tap device. tuntap creation is not exposed by rtnetlink, so
    /// this goes through ip(8).
    pub async fn link_add_tap(&self, name: &str) -> NetworkResult<()> {
        run_ip(&["tuntap", "add", "name", name, "mode", "tap"]).await
    }

    // ── Link mutation ─────────────────────────────────────────────────

    /// Delete a link by name. NotFound collapses to success.
    pub async fn link_del(&self, name: &str) -> NetworkResult<()> {
        let index = match self.link_index(name).await {
            Ok(idx) => idx,
            Err(NetworkError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn link_set_up(&self, name: &str) -> NetworkResult<()> {
        let idx = self.link_index(name).await?;
        self.handle
            .link()
            .set(idx)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn link_set_down(&self, name: &str) -> NetworkResult<()> {
        let idx = self.link_index(name).await?;
        self.handle
            .link()
            .set(idx)
            .down()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn link_set_mtu(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        let idx = self.link_index(name).await?;
        self.handle
            .link()
            .set(idx)
            .mtu(mtu)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn link_set_hwaddr(&self, name: &str, hwaddr: &str) -> NetworkResult<()> {
        let mac = parse_mac(hwaddr)?;
        let idx = self.link_index(name).await?;
        self.handle
            .link()
            .set(idx)
            .address(mac)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Attach a link to a bridge (set master).
    pub async fn link_set_master(&self, name: &str, master: &str) -> NetworkResult<()> {
        let idx = self.link_index(name).await?;
        let master_idx = self.link_index(master).await?;
        self.handle
            .link()
            .set(idx)
            .master(master_idx)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Detach a link from its bridge.
    pub async fn link_set_nomaster(&self, name: &str) -> NetworkResult<()> {
        run_ip(&["link", "set", "dev", name, "nomaster"]).await
    }

    /// Move a link into the network namespace of a process.
    pub async fn link_set_netns(&self, name: &str, pid: u32) -> NetworkResult<()> {
        let idx = self.link_index(name).await?;
        self.handle
            .link()
            .set(idx)
            .setns_by_pid(pid)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    // ── Link queries ──────────────────────────────────────────────────

    /// Get a link's ifindex by name. NotFound if the link doesn't exist.
    pub async fn link_index(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => {
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    pub async fn link_exists(&self, name: &str) -> bool {
        self.link_index(name).await.is_ok()
    }

    /// Read a link's MTU.
    pub async fn link_mtu(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        while let Some(msg) = links.try_next().await.map_err(NetworkError::Netlink)? {
            for nla in &msg.nlas {
                if let LinkNla::Mtu(mtu) = nla {
                    return Ok(*mtu);
                }
            }
        }
        Err(NetworkError::NotFound(format!("link {}", name)))
    }

    /// List all link names matching a prefix (stale tunnel cleanup).
    pub async fn links_with_prefix(&self, prefix: &str) -> NetworkResult<Vec<String>> {
        let mut links = self.handle.link().get().execute();
        let mut names = Vec::new();
        while let Some(msg) = links.try_next().await.map_err(NetworkError::Netlink)? {
            for nla in &msg.nlas {
                if let LinkNla::IfName(name) = nla {
                    if name.starts_with(prefix) {
                        names.push(name.clone());
                    }
                }
            }
        }
        Ok(names)
    }

    // ── Addresses ─────────────────────────────────────────────────────

    /// Add an address with prefix to a link. Idempotent.
    pub async fn addr_add(&self, name: &str, addr: IpAddr, prefix_len: u8) -> NetworkResult<()> {
        let idx = self.link_index(name).await?;
        match self
            .handle
            .address()
            .add(idx, addr, prefix_len)
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// List global-scope addresses of a link for one address family.
    pub async fn addr_list(&self, name: &str, v6: bool) -> NetworkResult<Vec<IpAddr>> {
        let idx = self.link_index(name).await?;
        let family: u8 = if v6 { libc_af_inet6() } else { libc_af_inet() };

        let mut out = Vec::new();
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(idx)
            .execute();
        while let Some(msg) = addrs.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.family != family || msg.header.scope != SCOPE_GLOBAL {
                continue;
            }
            for nla in &msg.nlas {
                if let AddrNla::Address(bytes) = nla {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        out.push(ip);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Remove all global-scope addresses of one family from a link.
    pub async fn addr_flush(&self, name: &str, v6: bool) -> NetworkResult<()> {
        let idx = self.link_index(name).await?;
        let family: u8 = if v6 { libc_af_inet6() } else { libc_af_inet() };

        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(idx)
            .execute();
        let mut to_del = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.family == family && msg.header.scope == SCOPE_GLOBAL {
                to_del.push(msg);
            }
        }
        for msg in to_del {
            match self.handle.address().del(msg).execute().await {
                Ok(()) => {}
                Err(e) if e.to_string().contains("Cannot assign") => {}
                Err(e) => return Err(NetworkError::Netlink(e)),
            }
        }
        Ok(())
    }

    /// List IPv4 addresses of a link together with their prefix lengths.
    pub async fn addr_list_v4_prefixed(&self, name: &str) -> NetworkResult<Vec<(Ipv4Addr, u8)>> {
        let idx = self.link_index(name).await?;
        let mut out = Vec::new();
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(idx)
            .execute();
        while let Some(msg) = addrs.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.family != libc_af_inet() || msg.header.scope != SCOPE_GLOBAL {
                continue;
            }
            for nla in &msg.nlas {
                if let AddrNla::Address(bytes) = nla {
                    if bytes.len() == 4 {
                        out.push((
                            Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]),
                            msg.header.prefix_len,
                        ));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Find a host address (and its interface) inside a subnet. Used to pick
    /// the fan underlay address.
    pub async fn address_in_subnet(
        &self,
        contains: impl Fn(Ipv4Addr) -> bool,
    ) -> NetworkResult<(Ipv4Addr, String)> {
        let mut links = self.handle.link().get().execute();
        let mut names = Vec::new();
        while let Some(msg) = links.try_next().await.map_err(NetworkError::Netlink)? {
            let idx = msg.header.index;
            for nla in &msg.nlas {
                if let LinkNla::IfName(name) = nla {
                    names.push((idx, name.clone()));
                }
            }
        }

        for (idx, name) in names {
            let mut addrs = self
                .handle
                .address()
                .get()
                .set_link_index_filter(idx)
                .execute();
            while let Some(msg) = addrs.try_next().await.map_err(NetworkError::Netlink)? {
                for nla in &msg.nlas {
                    if let AddrNla::Address(bytes) = nla {
                        if bytes.len() == 4 {
                            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
                            if contains(ip) {
                                return Ok((ip, name));
                            }
                        }
                    }
                }
            }
        }

        Err(NetworkError::NotFound("no address found in subnet".into()))
    }
}

// ── Routes and neighbour proxies (ip(8)) ─────────────────────────────

/// Snapshot routes on a device filtered by proto (e.g. "boot" routes that
/// the kernel drops when the last address is flushed).
pub async fn route_list(dev: &str, v6: bool, proto: &str) -> NetworkResult<Vec<String>> {
    let family = if v6 { "-6" } else { "-4" };
    let out = run_ip_capture(&["route", "show", "dev", dev, "proto", proto], family).await?;
    Ok(out
        .lines()
        .map(|l| l.replace("linkdown", "").trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Re-apply a previously snapshotted route, idempotently.
pub async fn route_replace(dev: &str, v6: bool, proto: &str, route: &str) -> NetworkResult<()> {
    let family = if v6 { "-6" } else { "-4" };
    let mut args: Vec<&str> = vec![family, "route", "replace", "dev", dev, "proto", proto];
    args.extend(route.split_whitespace());
    run_ip(&args).await
}

/// Add a static route on a device. Idempotent.
pub async fn route_add(dev: &str, v6: bool, cidr: &str, proto: &str) -> NetworkResult<()> {
    let family = if v6 { "-6" } else { "-4" };
    let args = [family, "route", "replace", "dev", dev, cidr, "proto", proto];
    run_ip(&args).await
}

/// Add a host route to a specific routing table.
pub async fn route_add_table(dev: &str, v6: bool, cidr: &str, table: &str) -> NetworkResult<()> {
    let family = if v6 { "-6" } else { "-4" };
    let args = [family, "route", "replace", cidr, "dev", dev, "table", table];
    run_ip(&args).await
}

/// Remove all routes of one proto from a device.
pub async fn route_flush(dev: &str, v6: bool, proto: &str) -> NetworkResult<()> {
    let family = if v6 { "-6" } else { "-4" };
    run_ip(&[family, "route", "flush", "dev", dev, "proto", proto]).await
}

/// Add a neighbour proxy entry (the host answers ARP/NDP for this address
/// on the parent interface).
pub async fn neigh_proxy_add(dev: &str, addr: IpAddr) -> NetworkResult<()> {
    let addr_s = addr.to_string();
    run_ip(&["neigh", "replace", "proxy", &addr_s, "dev", dev]).await
}

/// Remove a neighbour proxy entry. Missing entries collapse to success.
pub async fn neigh_proxy_del(dev: &str, addr: IpAddr) -> NetworkResult<()> {
    let addr_s = addr.to_string();
    match run_ip(&["neigh", "del", "proxy", &addr_s, "dev", dev]).await {
        Ok(()) => Ok(()),
        Err(NetworkError::Command { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Find the interface and subnet of the IPv4 default route.
pub async fn default_gateway_v4() -> NetworkResult<String> {
    let out = run_ip_capture(&["route", "show", "default"], "-4").await?;
    for line in out.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if let Some(pos) = fields.iter().position(|f| *f == "dev") {
            if let Some(dev) = fields.get(pos + 1) {
                return Ok(dev.to_string());
            }
        }
    }
    Err(NetworkError::NotFound("no IPv4 default route".into()))
}

// ── Shell plumbing ────────────────────────────────────────────────────

/// Run an ip(8) command, retrying once on transient-looking failure.
pub async fn run_ip(args: &[&str]) -> NetworkResult<()> {
    match run_cmd("ip", args).await {
        Ok(_) => Ok(()),
        Err(e) if is_transient_stderr(&e) => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            run_cmd("ip", args).await.map(|_| ())
        }
        Err(e) => Err(e),
    }
}

async fn run_ip_capture(args: &[&str], family: &str) -> NetworkResult<String> {
    let mut full: Vec<&str> = vec![family];
    full.extend_from_slice(args);
    run_cmd("ip", &full).await
}

/// Run a command, capturing stdout. Failure carries the full command line
/// and stderr so errors surface with their input arguments.
pub async fn run_cmd(cmd: &str, args: &[&str]) -> NetworkResult<String> {
    let output = tokio::process::Command::new(cmd)
        .args(args)
        .output()
        .await
        .map_err(NetworkError::Io)?;

    if !output.status.success() {
        return Err(NetworkError::Command {
            cmd: format!("{} {}", cmd, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn is_transient_stderr(err: &NetworkError) -> bool {
    match err {
        NetworkError::Command { stderr, .. } => {
            let s = stderr.to_ascii_lowercase();
            s.contains("busy") || s.contains("try again") || s.contains("temporarily unavailable")
        }
        _ => false,
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

pub fn parse_mac(s: &str) -> NetworkResult<Vec<u8>> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(NetworkError::Validation(format!("invalid MAC '{}'", s)));
    }
    parts
        .iter()
        .map(|p| {
            u8::from_str_radix(p, 16)
                .map_err(|_| NetworkError::Validation(format!("invalid MAC '{}'", s)))
        })
        .collect()
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::new(
            bytes[0], bytes[1], bytes[2], bytes[3],
        ))),
        16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(bytes);
            Some(IpAddr::V6(std::net::Ipv6Addr::from(b)))
        }
        _ => None,
    }
}

fn libc_af_inet() -> u8 {
    2
}

fn libc_af_inet6() -> u8 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("00:16:3e:aa:bb:cc").unwrap(),
            vec![0x00, 0x16, 0x3e, 0xaa, 0xbb, 0xcc]
        );
        assert!(parse_mac("00:16:3e:aa:bb").is_err());
        assert!(parse_mac("zz:16:3e:aa:bb:cc").is_err());
    }

    #[test]
    fn address_bytes() {
        assert_eq!(
            ip_from_bytes(&[10, 42, 0, 1]),
            Some(IpAddr::V4(Ipv4Addr::new(10, 42, 0, 1)))
        );
        assert_eq!(ip_from_bytes(&[1, 2, 3]), None);
    }
}
