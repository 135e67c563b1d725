pub mod notifier;

pub use notifier::{
    new_notifier, ClusterCert, Notifier, NotifyPolicy, PeerClient, DEFAULT_OFFLINE_THRESHOLD,
};
