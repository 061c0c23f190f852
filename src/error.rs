//! Error types for the skiff replication engine.
//!
//! One unified error type [`SkiffError`] covers every operation, with a
//! convenient [`Result`] alias. Variants fall into two groups: typed
//! errors surfaced to callers of the public API (`NotLeader`,
//! `SlaveMode`, `SameShard`, `Timeout`, ...) and carriers for failures
//! of the pluggable substrate (storage, network, serialization).

use std::io;
use thiserror::Error;

use crate::types::{LogIndex, MemberId};

/// Main error type for skiff operations.
#[derive(Error, Debug)]
pub enum SkiffError {
    // Errors surfaced to API callers.
    #[error("not the leader; leader is {leader:?}")]
    NotLeader { leader: Option<MemberId> },

    #[error("member is in slave mode")]
    SlaveMode,

    #[error("member {master} is in the same shard")]
    SameShard { master: MemberId },

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("engine is shut down")]
    Shutdown,

    #[error("invalid log index {0}; indices start at 1")]
    InvalidIndex(LogIndex),

    #[error("command of {size} bytes exceeds command_max_size {max}")]
    CommandTooLarge { size: usize, max: usize },

    #[error("unknown member: {0}")]
    UnknownMember(MemberId),

    #[error("member {0} is not hosted by this process")]
    NotLocal(MemberId),

    #[error("unknown shard: {0}")]
    UnknownShard(String),

    // Substrate failures.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("log corrupted: {0}")]
    CorruptLog(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SkiffError {
    /// Whether retrying the same call can reasonably succeed.
    ///
    /// `NotLeader` and `Timeout` are the usual reroute/retry cases;
    /// `Shutdown` and misuse errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SkiffError::NotLeader { .. }
                | SkiffError::Timeout(_)
                | SkiffError::Network(_)
                | SkiffError::ChannelClosed
        )
    }
}

impl From<rocksdb::Error> for SkiffError {
    fn from(e: rocksdb::Error) -> Self {
        SkiffError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for SkiffError {
    fn from(e: bincode::Error) -> Self {
        SkiffError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SkiffError {
    fn from(e: serde_json::Error) -> Self {
        SkiffError::Serialization(e.to_string())
    }
}

/// Result type alias for skiff operations.
pub type Result<T> = std::result::Result<T, SkiffError>;
