// Cluster fan-out: replay a local action on peer members over mutually
// authenticated TLS.
//
// A notifier is built against the current member list under a policy (all,
// alive, targeted). Construction fails under "all" if any peer's heartbeat
// is stale; invocation then runs the hook sequentially against each selected
// peer, surfacing independent failures as one combined error. Recipients
// mark their requests with client-type "notifier" so they don't re-notify.

use crate::net::config::NetworkPut;
use crate::net::error::{NetworkError, NetworkResult};
use crate::store::{now_ts, Member};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Seconds after which a member with no heartbeat counts as offline.
pub const DEFAULT_OFFLINE_THRESHOLD: i64 = 20;

/// Header marking a request as a cluster notification.
pub const CLIENT_TYPE_HEADER: &str = "X-Warren-Client-Type";
pub const CLIENT_TYPE_NOTIFIER: &str = "notifier";

/// Deadline applied to each peer call.
const PEER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyPolicy {
    /// Every peer must be reachable; construction fails if one is down.
    All,
    /// Down peers are skipped silently.
    Alive,
    /// A single named peer.
    Targeted(String),
}

/// TLS material for the cluster channel: our client identity plus the
/// cluster certificate peers present.
#[derive(Clone)]
pub struct ClusterCert {
    pub identity_pem: Vec<u8>,
    pub server_cert_pem: Vec<u8>,
}

/// HTTPS channel to one peer member.
#[derive(Debug)]
pub struct PeerClient {
    address: String,
    name: String,
    http: reqwest::Client,
}

/// Subset of a peer's network state the engine consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerNetworkState {
    pub addresses: Vec<PeerNetworkAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerNetworkAddress {
    pub family: String,
    pub scope: String,
    pub address: String,
}

impl PeerClient {
    /// Open a channel to one member directly (heartbeat-driven refresh
    /// paths that don't go through a policy fan-out).
    pub fn connect(member: &Member, cert: Option<&ClusterCert>) -> NetworkResult<Self> {
        Self::new(member, cert)
    }

    fn new(member: &Member, cert: Option<&ClusterCert>) -> NetworkResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(PEER_TIMEOUT);

        if let Some(cert) = cert {
            let identity = reqwest::Identity::from_pem(&cert.identity_pem)
                .map_err(|e| NetworkError::Peer(format!("invalid client identity: {}", e)))?;
            let server = reqwest::Certificate::from_pem(&cert.server_cert_pem)
                .map_err(|e| NetworkError::Peer(format!("invalid cluster certificate: {}", e)))?;
            // The cluster certificate is self-signed and shared by every
            // member; authentication comes from the mutual TLS identity, not
            // from hostname verification against member addresses.
            builder = builder
                .identity(identity)
                .add_root_certificate(server)
                .danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| NetworkError::Peer(format!("cannot build peer client: {}", e)))?;

        Ok(Self {
            address: member.address.clone(),
            name: member.name.clone(),
            http,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replay a network update on the peer. Node-local keys must already be
    /// stripped from the put by the caller.
    pub async fn update_network(
        &self,
        project: &str,
        name: &str,
        put: &NetworkPut,
    ) -> NetworkResult<()> {
        let url = format!(
            "https://{}/1.0/networks/{}?project={}",
            self.address, name, project
        );
        let response = self
            .http
            .put(&url)
            .header(CLIENT_TYPE_HEADER, CLIENT_TYPE_NOTIFIER)
            .json(put)
            .send()
            .await
            .map_err(|e| NetworkError::Peer(format!("peer {}: {}", self.address, e)))?;

        if !response.status().is_success() {
            return Err(NetworkError::Peer(format!(
                "peer {} rejected network update: {}",
                self.address,
                response.status()
            )));
        }
        Ok(())
    }

    /// Fetch the peer's local state for a network (interface addresses).
    pub async fn network_state(
        &self,
        project: &str,
        name: &str,
    ) -> NetworkResult<PeerNetworkState> {
        let url = format!(
            "https://{}/1.0/networks/{}/state?project={}",
            self.address, name, project
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| NetworkError::Peer(format!("peer {}: {}", self.address, e)))?;

        if !response.status().is_success() {
            return Err(NetworkError::Peer(format!(
                "peer {} network state query failed: {}",
                self.address,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| NetworkError::Peer(format!("peer {}: {}", self.address, e)))
    }
}

/// A built fan-out over the selected peers.
#[derive(Debug)]
pub struct Notifier {
    peers: Vec<std::sync::Arc<PeerClient>>,
}

/// Build a notifier from the member list. The local member is always
/// excluded; the policy decides what happens to unreachable peers.
pub fn new_notifier(
    members: &[Member],
    local_address: &str,
    cert: Option<&ClusterCert>,
    policy: NotifyPolicy,
    offline_threshold: i64,
) -> NetworkResult<Notifier> {
    let now = now_ts();
    let mut peers = Vec::new();

    for member in members {
        if member.address == local_address {
            continue;
        }

        match &policy {
            NotifyPolicy::All => {
                if !member.is_alive(offline_threshold, now) {
                    return Err(NetworkError::Peer(format!(
                        "peer node {} is down",
                        member.address
                    )));
                }
                peers.push(std::sync::Arc::new(PeerClient::new(member, cert)?));
            }
            NotifyPolicy::Alive => {
                if member.is_alive(offline_threshold, now) {
                    peers.push(std::sync::Arc::new(PeerClient::new(member, cert)?));
                }
            }
            NotifyPolicy::Targeted(name) => {
                if &member.name == name {
                    peers.push(std::sync::Arc::new(PeerClient::new(member, cert)?));
                }
            }
        }
    }

    if let NotifyPolicy::Targeted(name) = &policy {
        if peers.is_empty() {
            return Err(NetworkError::NotFound(format!("cluster member {}", name)));
        }
    }

    Ok(Notifier { peers })
}

impl Notifier {
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Run the hook against each selected peer in turn. Failures don't stop
    /// the fan-out; they are combined into one error at the end. The hook is
    /// responsible for being idempotent on the peer side.
    pub async fn invoke<F, Fut>(&self, hook: F) -> NetworkResult<()>
    where
        F: Fn(std::sync::Arc<PeerClient>) -> Fut,
        Fut: Future<Output = NetworkResult<()>>,
    {
        let mut failures = Vec::new();
        for peer in &self.peers {
            if let Err(e) = hook(peer.clone()).await {
                tracing::warn!("notifying peer {} failed: {}", peer.address(), e);
                failures.push(format!("{}: {}", peer.address(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(NetworkError::Peer(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn member(id: i64, name: &str, address: &str, heartbeat_age: i64) -> Member {
        Member {
            id,
            name: name.to_string(),
            address: address.to_string(),
            last_heartbeat: now_ts() - heartbeat_age,
        }
    }

    fn three_members(down: Option<usize>) -> Vec<Member> {
        let mut members = vec![
            member(1, "node1", "10.1.1.1:8443", 0),
            member(2, "node2", "10.1.1.2:8443", 0),
            member(3, "node3", "10.1.1.3:8443", 0),
        ];
        if let Some(i) = down {
            members[i].last_heartbeat = now_ts() - 60;
        }
        members
    }

    #[test]
    fn all_policy_connects_to_every_peer() {
        let notifier = new_notifier(
            &three_members(None),
            "10.1.1.1:8443",
            None,
            NotifyPolicy::All,
            DEFAULT_OFFLINE_THRESHOLD,
        )
        .unwrap();
        assert_eq!(notifier.peer_count(), 2);
    }

    #[test]
    fn all_policy_fails_when_a_peer_is_down() {
        let err = new_notifier(
            &three_members(Some(1)),
            "10.1.1.1:8443",
            None,
            NotifyPolicy::All,
            DEFAULT_OFFLINE_THRESHOLD,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("peer node") && message.contains("is down"),
            "unexpected error: {}",
            message
        );
        assert!(message.contains("10.1.1.2:8443"));
    }

    #[test]
    fn alive_policy_skips_down_peers() {
        // Node 2 of a 3-node cluster is down; the fan-out from node 1 still
        // builds and covers exactly node 3.
        let notifier = new_notifier(
            &three_members(Some(1)),
            "10.1.1.1:8443",
            None,
            NotifyPolicy::Alive,
            DEFAULT_OFFLINE_THRESHOLD,
        )
        .unwrap();
        assert_eq!(notifier.peer_count(), 1);
    }

    #[test]
    fn targeted_policy_selects_one_peer() {
        let notifier = new_notifier(
            &three_members(None),
            "10.1.1.1:8443",
            None,
            NotifyPolicy::Targeted("node3".to_string()),
            DEFAULT_OFFLINE_THRESHOLD,
        )
        .unwrap();
        assert_eq!(notifier.peer_count(), 1);

        let err = new_notifier(
            &three_members(None),
            "10.1.1.1:8443",
            None,
            NotifyPolicy::Targeted("node9".to_string()),
            DEFAULT_OFFLINE_THRESHOLD,
        )
        .unwrap_err();
        assert!(matches!(err, NetworkError::NotFound(_)));
    }

    #[tokio::test]
    async fn hook_runs_once_per_selected_peer() {
        let notifier = new_notifier(
            &three_members(Some(1)),
            "10.1.1.1:8443",
            None,
            NotifyPolicy::Alive,
            DEFAULT_OFFLINE_THRESHOLD,
        )
        .unwrap();

        let seen = Mutex::new(Vec::new());
        notifier
            .invoke(|peer| {
                seen.lock().unwrap().push(peer.address().to_string());
                async { Ok::<(), NetworkError>(()) }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["10.1.1.3:8443".to_string()]);
    }

    #[tokio::test]
    async fn hook_failures_are_combined() {
        let notifier = new_notifier(
            &three_members(None),
            "10.1.1.1:8443",
            None,
            NotifyPolicy::All,
            DEFAULT_OFFLINE_THRESHOLD,
        )
        .unwrap();

        let result = notifier
            .invoke(|peer| {
                let fail = peer.address().ends_with("2:8443");
                async move {
                    if fail {
                        Err(NetworkError::Peer("apply failed".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        let err = result.unwrap_err().to_string();
        assert!(err.contains("10.1.1.2:8443"));
        assert!(!err.contains("10.1.1.3:8443"));
    }
}
