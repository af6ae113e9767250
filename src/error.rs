use thiserror::Error;

/// Failure of a long-lived API stream (pod watch or log tail).
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),

    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch rejected by api server: {0}")]
    Rejected(String),
}

/// Item-level failure while consuming a pod watch.
#[derive(Debug, Error)]
pub enum WatchError {
    /// One event could not be decoded; the connection itself is fine.
    #[error("malformed watch event: {0}")]
    Malformed(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
