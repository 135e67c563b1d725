/// Error type shared by the network engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command '{cmd}' failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("peer error: {0}")]
    Peer(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NetworkError {
    /// True for failures the kernel facade may retry once before surfacing.
    pub fn is_transient(&self) -> bool {
        match self {
            NetworkError::Netlink(_) => true,
            NetworkError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
