// warren unified binary: the daemon plus the re-exec'd helper children
// (forkdns, forkproxy) it supervises.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use warren::bgp::BgpSpeaker;
use warren::net::firewall::Firewall;
use warren::net::netlink::NetlinkHandle;
use warren::net::{forkdns, NetworkPaths, NetworkRegistry, State};
use warren::store::Store;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Container and VM manager network daemon")]
#[clap(propagate_version = true)]
struct WarrenCli {
    #[clap(subcommand)]
    command: Commands,

    /// State directory for the store, network directories and logs.
    #[clap(long, global = true, default_value = "/var/lib/warren")]
    var_dir: PathBuf,

    /// Enable verbose logging (also passes verbose flags to children).
    #[clap(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the network manager daemon.
    Daemon {
        /// Cluster address of this member; empty for standalone hosts.
        #[clap(long, default_value = "")]
        cluster_address: String,

        /// Project whose networks this daemon manages.
        #[clap(long, default_value = "default")]
        project: String,

        /// Skip all kernel-facing work (test harnesses).
        #[clap(long, hide = true)]
        mock: bool,

        /// Unprivileged user dnsmasq drops to.
        #[clap(long)]
        dns_user: Option<String>,
    },

    /// Per-network cluster DNS forwarder (supervised child).
    #[clap(hide = true)]
    Forkdns {
        /// Listen address, e.g. "240.3.5.1:1053".
        listen: String,
        /// DNS domain the forwarder serves.
        domain: String,
        /// Owning network name.
        network: String,
    },

    /// Proxy device forwarder (supervised child).
    #[clap(hide = true)]
    Forkproxy {
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = WarrenCli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let result = match cli.command {
        Commands::Daemon {
            cluster_address,
            project,
            mock,
            dns_user,
        } => run_daemon(cli.var_dir, cluster_address, project, mock, dns_user, cli.debug).await,
        Commands::Forkdns {
            listen,
            domain,
            network,
        } => run_forkdns(cli.var_dir, listen, domain, network).await,
        Commands::Forkproxy { args } => warren::forkproxy::run(args).await,
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_daemon(
    var_dir: PathBuf,
    cluster_address: String,
    project: String,
    mock: bool,
    dns_user: Option<String>,
    debug: bool,
) -> warren::net::error::NetworkResult<()> {
    std::fs::create_dir_all(&var_dir)?;
    let store = Store::open(&var_dir.join("warren.db")).await?;

    let exec_path = std::env::current_exe()?;
    let cluster_cert = load_cluster_cert(&var_dir);
    let state = Arc::new(State {
        var_dir,
        store,
        firewall: Firewall::new(),
        nl: Arc::new(NetlinkHandle::new()?),
        bgp: BgpSpeaker::new(),
        shared_device_lock: tokio::sync::Mutex::new(()),
        servers_file_lock: parking_lot::Mutex::new(()),
        mock,
        debug,
        unpriv_user: dns_user,
        cluster_cert,
        local_cluster_address: cluster_address,
        exec_path,
    });

    let registry = NetworkRegistry::new(state.clone());
    registry.load_all(&project).await?;

    for network in registry.networks() {
        let name = network.name().await;
        if let Err(e) = network.start().await {
            tracing::error!("failed to start network {}: {}", name, e);
        } else {
            tracing::info!("network {} started", name);
        }
    }

    // Heartbeat-driven upkeep: refresh the forkdns peer lists of clustered
    // networks so the forwarders track membership changes.
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if state.local_cluster_address.is_empty() {
                    continue;
                }
                let _ = state.store.heartbeat_member(&state.local_cluster_address).await;
                for network in registry.networks() {
                    let config = network.config().await;
                    if config.get("bridge.mode").map(|v| v.as_str()) == Some("fan") {
                        if let Err(e) = network.refresh_forkdns_servers().await {
                            tracing::warn!(
                                "forkdns refresh for {} failed: {}",
                                network.name().await,
                                e
                            );
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn run_forkdns(
    var_dir: PathBuf,
    listen: String,
    domain: String,
    network: String,
) -> warren::net::error::NetworkResult<()> {
    let listen = listen.parse().map_err(|_| {
        warren::net::error::NetworkError::Validation(format!("invalid listen address '{}'", listen))
    })?;
    let paths = NetworkPaths::new(&var_dir, &network);
    forkdns::run(listen, domain, paths.forkdns_servers_file()).await
}

/// Cluster TLS material lives next to the store; absent files mean a
/// standalone host.
fn load_cluster_cert(dir: &std::path::Path) -> Option<warren::cluster::ClusterCert> {
    let identity = std::fs::read(dir.join("cluster.pem")).ok()?;
    let server = std::fs::read(dir.join("cluster.crt")).ok()?;
    Some(warren::cluster::ClusterCert {
        identity_pem: identity,
        server_cert_pem: server,
    })
}
