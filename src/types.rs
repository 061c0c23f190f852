//! Core type definitions shared across the engine.
//!
//! # Type aliases
//!
//! - [`MemberId`] = `u32`: cluster-unique member identifier
//! - [`Term`] = `u64`: election epoch
//! - [`LogIndex`] = `u64`: log position, starting at 1 (0 is the sentinel)

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Cluster-unique identifier of one replication-group participant.
pub type MemberId = u32;

/// Monotonic election epoch.
pub type Term = u64;

/// Position in the replicated log. Real entries start at index 1;
/// index 0 is the sentinel that matches any leader's prefix.
pub type LogIndex = u64;

/// The role a member currently plays in its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Passive; responds to leader and candidate traffic.
    Follower,
    /// Actively soliciting votes.
    Candidate,
    /// Accepts commands and drives replication.
    Leader,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// A single entry in the replicated log.
///
/// Uses `Arc<Vec<u8>>` for the payload so that cloning during fan-out
/// (save queue + every peer) is O(1) on the hot path. An empty payload
/// is a no-op entry, written by a fresh leader to force commit of
/// prior-term entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term under which the entry was appended.
    pub term: Term,
    /// The index of this entry in the log.
    pub index: LogIndex,
    /// The command payload (Arc-wrapped for cheap cloning).
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self { term, index, data: Arc::new(data) }
    }

    /// Create a new log entry from an already Arc-wrapped payload.
    pub fn with_arc_data(term: Term, index: LogIndex, data: Arc<Vec<u8>>) -> Self {
        Self { term, index, data }
    }

    /// True for the post-election no-op entry.
    pub fn is_noop(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Serde helper for `Arc<Vec<u8>>` payloads: serialized as raw bytes,
/// deserialized into a fresh Arc.
pub(crate) mod arc_bytes {
    use std::sync::Arc;

    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// Event delivered to role-change listeners, off the Raft hot path.
#[derive(Debug, Clone)]
pub struct RoleChangeEvent {
    /// The member whose role changed.
    pub member_id: MemberId,
    /// The shard the member belongs to.
    pub shard_id: String,
    pub old_role: Role,
    pub new_role: Role,
    /// The current leader of the shard, when known.
    pub leader_id: Option<MemberId>,
}

/// Status of a member operating in slave mode, mirroring a foreign
/// leader's log. `None` is returned by `Member::slave_status` when the
/// member is not slaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveStatus {
    /// The master being mirrored.
    pub master_id: MemberId,
    /// True while entries are flowing from the master.
    pub running: bool,
    pub commit_index: LogIndex,
    pub saved_index: LogIndex,
}
