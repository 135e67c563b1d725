// The per-network forked DNS forwarder.
//
// Runs as a re-exec of our own binary ("warren forkdns <listen> <domain>
// <network>"), listening on the cluster address at port 1053. Queries for
// the network domain are forwarded to the resolvers of the other cluster
// members; the first affirmative answer wins. The peer list comes from the
// servers.conf file the engine rewrites atomically, re-read on modification.

use crate::net::error::{NetworkError, NetworkResult};
use crate::utils::fs::read_lines;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::net::UdpSocket;
use trust_dns_proto::op::{Message, MessageType, ResponseCode};

/// Port the forwarder and peer resolvers exchange cluster queries on.
pub const FORKDNS_PORT: u16 = 1053;

/// How long to wait for each upstream peer before moving on.
const UPSTREAM_TIMEOUT: Duration = Duration::from_millis(500);

/// Relative path of the servers list inside a network directory.
pub const SERVERS_LIST_PATH: &str = "forkdns.servers";
pub const SERVERS_LIST_FILE: &str = "servers.conf";

/// Parse the newline-separated servers.conf into peer addresses, skipping
/// anything that isn't an IPv4 address.
pub fn parse_servers(lines: &[String]) -> Vec<Ipv4Addr> {
    lines.iter().filter_map(|l| l.parse().ok()).collect()
}

/// Peer list with modification-time based reload.
pub struct ServerList {
    path: PathBuf,
    servers: Vec<Ipv4Addr>,
    last_modified: Option<SystemTime>,
}

impl ServerList {
    pub fn new(path: &Path) -> Self {
        let mut list = Self {
            path: path.to_path_buf(),
            servers: Vec::new(),
            last_modified: None,
        };
        list.reload_if_changed();
        list
    }

    /// Re-read the file when its mtime moved. The engine writes it via
    /// tmp → rename, so a partial read is never observed.
    pub fn reload_if_changed(&mut self) -> bool {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        if modified == self.last_modified {
            return false;
        }
        self.last_modified = modified;
        self.servers = match read_lines(&self.path) {
            Ok(lines) => parse_servers(&lines),
            Err(_) => Vec::new(),
        };
        true
    }

    pub fn servers(&self) -> &[Ipv4Addr] {
        &self.servers
    }
}

/// Build the negative response returned when no peer could answer.
pub fn negative_response(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(false);
    response.set_response_code(ResponseCode::NXDomain);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

/// Whether an upstream response settles the query.
pub fn is_affirmative(response: &Message) -> bool {
    response.response_code() == ResponseCode::NoError && response.answer_count() > 0
}

/// Forward a raw query to each peer in order; the first affirmative answer
/// is returned verbatim.
async fn resolve_upstream(raw: &[u8], servers: &[Ipv4Addr]) -> Option<Vec<u8>> {
    for server in servers {
        let upstream = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(_) => continue,
        };
        let target = SocketAddr::from((*server, FORKDNS_PORT));
        if upstream.send_to(raw, target).await.is_err() {
            continue;
        }

        let mut buf = vec![0u8; 4096];
        let result = tokio::time::timeout(UPSTREAM_TIMEOUT, upstream.recv_from(&mut buf)).await;
        let len = match result {
            Ok(Ok((len, from))) if from == target => len,
            _ => continue,
        };

        match Message::from_vec(&buf[..len]) {
            Ok(response) if is_affirmative(&response) => return Some(buf[..len].to_vec()),
            _ => continue,
        }
    }
    None
}

/// Run the forwarder until the process is killed.
pub async fn run(listen: SocketAddr, domain: String, servers_file: PathBuf) -> NetworkResult<()> {
    let socket = UdpSocket::bind(listen).await.map_err(|e| {
        NetworkError::Precondition(format!("cannot bind forkdns listener on {}: {}", listen, e))
    })?;

    tracing::info!("forkdns listening on {} for domain {}", listen, domain);

    let mut servers = ServerList::new(&servers_file);
    let mut buf = vec![0u8; 4096];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("forkdns receive failed: {}", e);
                continue;
            }
        };

        if servers.reload_if_changed() {
            tracing::info!("forkdns servers list reloaded: {:?}", servers.servers());
        }

        let query = match Message::from_vec(&buf[..len]) {
            Ok(q) => q,
            Err(e) => {
                tracing::debug!("forkdns dropping unparseable query from {}: {}", src, e);
                continue;
            }
        };

        let raw = buf[..len].to_vec();
        match resolve_upstream(&raw, servers.servers()).await {
            Some(answer) => {
                let _ = socket.send_to(&answer, src).await;
            }
            None => {
                if let Ok(bytes) = negative_response(&query).to_vec() {
                    let _ = socket.send_to(&bytes, src).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fs::write_atomic;
    use trust_dns_proto::op::Query;
    use trust_dns_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    #[test]
    fn servers_parsing_skips_junk() {
        let lines = vec![
            "10.0.0.1".to_string(),
            "not-an-ip".to_string(),
            "10.0.0.2".to_string(),
        ];
        assert_eq!(
            parse_servers(&lines),
            vec![
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2)
            ]
        );
    }

    #[test]
    fn server_list_reloads_on_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SERVERS_LIST_FILE);

        write_atomic(&path, b"10.0.0.1\n").unwrap();
        let mut list = ServerList::new(&path);
        assert_eq!(list.servers(), &[Ipv4Addr::new(10, 0, 0, 1)]);

        // Unchanged file is not re-read.
        assert!(!list.reload_if_changed());

        // The atomic rewrite bumps the mtime and the list follows. Set a
        // distinct mtime explicitly to avoid flaking on fast filesystems.
        write_atomic(&path, b"10.0.0.2\n10.0.0.3\n").unwrap();
        let later = SystemTime::now() + Duration::from_secs(2);
        let times = std::fs::FileTimes::new().set_modified(later);
        std::fs::File::options()
            .append(true)
            .open(&path)
            .unwrap()
            .set_times(times)
            .unwrap();

        assert!(list.reload_if_changed());
        assert_eq!(
            list.servers(),
            &[Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3)]
        );
    }

    #[test]
    fn negative_response_echoes_query() {
        let mut query = Message::new();
        query.set_id(4242);
        query.add_query(Query::query(
            Name::from_str("web1.warren.").unwrap(),
            RecordType::A,
        ));

        let response = negative_response(&query);
        assert_eq!(response.id(), 4242);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert_eq!(response.query_count(), 1);
        assert!(!is_affirmative(&response));
    }
}
