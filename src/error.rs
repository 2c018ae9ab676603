//! Error types for etcdq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The item handed to the queue cannot be stored (empty bucket or key).
    #[error("invalid item: {0}")]
    InvalidItem(String),

    /// The queue was stopped; no further operations are accepted.
    #[error("queue stopped")]
    Stopped,

    #[error("etcd error: {0}")]
    Store(#[from] etcd_client::Error),

    #[error("lease grant failed: {0}")]
    Lease(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
