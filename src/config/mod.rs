//! Configuration for a skiff process.
//!
//! A config file is a JSON document with tunables plus the cluster
//! topology: `hosts[]` (where processes run) and `shards[]` (which
//! members form each replication group). Most keys are read once at
//! engine start; the handful of dynamic keys live in a [`DynamicConfig`]
//! snapshot that [`Config::reload`] swaps atomically at runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SkiffError};
use crate::types::MemberId;

/// Raft protocol tunables. All periods are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Leader heartbeat interval.
    pub heartbeat_period: u64,
    /// Silence after which a follower becomes a candidate.
    pub election_timeout: u64,
    /// A leader with fewer than half its peers responsive within this
    /// window steps down.
    pub leader_timeout: u64,
    /// Ceiling for the candidate's jittered vote-retry period.
    pub request_vote_period: u64,
    /// Maximum size of a single command payload in bytes.
    pub command_max_size: usize,
    /// Write a no-op entry after winning an election (dynamic).
    pub write_empty_command_after_election: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_period: 250,
            election_timeout: 2000,
            leader_timeout: 10_000,
            request_vote_period: 300,
            command_max_size: 1000,
            write_empty_command_after_election: true,
        }
    }
}

/// Engine-level queue bounds and substrate tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the per-shard command submission queue.
    pub command_queue_size: usize,
    /// Capacity of the per-member incoming message queue.
    pub incoming_queue_size: usize,
    /// The leader stops dequeuing commands while more than this many
    /// are uncommitted.
    pub wait_queue_throttle_size: usize,
    /// Fold multiple queued commands into one AppendEntries (dynamic).
    pub batching: bool,
    /// Number of save-queue worker threads.
    pub save_queue_workers: usize,
    /// Prune a slave that has been silent this long, ms (dynamic).
    pub slave_inactivity_timeout: u64,
    /// Tear down a channel that has been silent this long, ms.
    pub channel_inactivity_timeout: u64,
    /// Reconnect retry period after a channel failure, ms.
    pub create_socket_retry_period: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_queue_size: 200,
            incoming_queue_size: 100,
            wait_queue_throttle_size: 100,
            batching: true,
            save_queue_workers: 5,
            slave_inactivity_timeout: 60_000,
            channel_inactivity_timeout: 10_000,
            create_socket_retry_period: 1000,
        }
    }
}

/// Verbose-logging toggles (all dynamic). These gate `debug!` dumps of
/// hot-path traffic and are off by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Dump every raft message sent and received.
    pub raft_messages: bool,
    /// Dump command submission and resolution.
    pub commands: bool,
    /// Dump save-queue activity.
    pub storage: bool,
}

/// Selects and parameterizes the storage plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Registry name of the storage implementation.
    pub impl_name: String,
    /// Data directory for file-backed implementations.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { impl_name: "rocks".to_string(), data_dir: PathBuf::from("/tmp/skiff") }
    }
}

/// Selects the network plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Registry name of the network implementation.
    pub impl_name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { impl_name: "memory".to_string() }
    }
}

/// Selects the clock plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Registry name of the clock implementation.
    pub impl_name: String,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self { impl_name: "system".to_string() }
    }
}

/// Logging and metrics surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logs: false }
    }
}

/// One process in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub host_id: String,
    /// Transport address, opaque to the engine.
    #[serde(default)]
    pub address: String,
    /// Storage partition this host writes to.
    #[serde(default)]
    pub store_id: String,
    /// Failure-domain label.
    #[serde(default)]
    pub site_id: String,
}

/// Placement of one member of a shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMemberConfig {
    pub host_id: String,
    pub member_id: MemberId,
}

/// One replication group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub shard_id: String,
    pub members: Vec<ShardMemberConfig>,
}

/// The dynamic subset of the configuration. Readers grab a snapshot
/// (`Config::dynamic`) and must not cache it across iterations.
#[derive(Debug, Clone)]
pub struct DynamicConfig {
    pub write_empty_command_after_election: bool,
    pub batching: bool,
    pub slave_inactivity_timeout: u64,
    pub tracing: TracingConfig,
}

/// On-disk shape of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub raft: RaftConfig,
    pub engine: EngineConfig,
    pub tracing: TracingConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub clock: ClockConfig,
    pub observability: ObservabilityConfig,
    pub hosts: Vec<HostConfig>,
    pub shards: Vec<ShardConfig>,
}

/// Validated configuration handle shared across the engine.
#[derive(Debug)]
pub struct Config {
    file: ConfigFile,
    dynamic: RwLock<Arc<DynamicConfig>>,
}

impl Config {
    /// Build a config from an already-parsed file.
    pub fn new(file: ConfigFile) -> Result<Self> {
        validate(&file)?;
        let dynamic = Arc::new(DynamicConfig {
            write_empty_command_after_election: file.raft.write_empty_command_after_election,
            batching: file.engine.batching,
            slave_inactivity_timeout: file.engine.slave_inactivity_timeout,
            tracing: file.tracing.clone(),
        });
        Ok(Self { file, dynamic: RwLock::new(dynamic) })
    }

    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SkiffError::Config(format!("failed to read config file: {}", e)))?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| SkiffError::Config(format!("failed to parse config: {}", e)))?;
        Self::new(file)
    }

    /// Re-read the file and swap the dynamic keys. Static keys in the
    /// new file are ignored until the next engine restart.
    pub fn reload(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SkiffError::Config(format!("failed to read config file: {}", e)))?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| SkiffError::Config(format!("failed to parse config: {}", e)))?;
        let snapshot = Arc::new(DynamicConfig {
            write_empty_command_after_election: file.raft.write_empty_command_after_election,
            batching: file.engine.batching,
            slave_inactivity_timeout: file.engine.slave_inactivity_timeout,
            tracing: file.tracing,
        });
        *self.dynamic.write() = snapshot;
        Ok(())
    }

    /// Current snapshot of the dynamic keys.
    pub fn dynamic(&self) -> Arc<DynamicConfig> {
        self.dynamic.read().clone()
    }

    pub fn raft(&self) -> &RaftConfig {
        &self.file.raft
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.file.engine
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.file.storage
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.file.network
    }

    pub fn clock(&self) -> &ClockConfig {
        &self.file.clock
    }

    pub fn observability(&self) -> &ObservabilityConfig {
        &self.file.observability
    }

    pub fn hosts(&self) -> &[HostConfig] {
        &self.file.hosts
    }

    pub fn shards(&self) -> &[ShardConfig] {
        &self.file.shards
    }

    /// Shard ids with a member placed on the given host.
    pub fn shard_ids_for_host(&self, host_id: &str) -> Vec<String> {
        self.file
            .shards
            .iter()
            .filter(|s| s.members.iter().any(|m| m.host_id == host_id))
            .map(|s| s.shard_id.clone())
            .collect()
    }

    /// The member of `shard_id` placed on `host_id`, if any.
    pub fn member_on_host(&self, shard_id: &str, host_id: &str) -> Option<MemberId> {
        self.shard(shard_id)?
            .members
            .iter()
            .find(|m| m.host_id == host_id)
            .map(|m| m.member_id)
    }

    pub fn shard(&self, shard_id: &str) -> Option<&ShardConfig> {
        self.file.shards.iter().find(|s| s.shard_id == shard_id)
    }

    /// The shard a member belongs to.
    pub fn shard_of_member(&self, member_id: MemberId) -> Option<&ShardConfig> {
        self.file
            .shards
            .iter()
            .find(|s| s.members.iter().any(|m| m.member_id == member_id))
    }

    pub fn address_for_host(&self, host_id: &str) -> Option<&str> {
        self.file
            .hosts
            .iter()
            .find(|h| h.host_id == host_id)
            .map(|h| h.address.as_str())
    }

    /// Minimal single-host development configuration: one three-member
    /// shard, memory substrate, fast timers.
    pub fn development() -> Self {
        let file = ConfigFile {
            raft: RaftConfig {
                heartbeat_period: 50,
                election_timeout: 400,
                leader_timeout: 2000,
                request_vote_period: 100,
                ..RaftConfig::default()
            },
            storage: StorageConfig { impl_name: "memory".into(), ..StorageConfig::default() },
            hosts: vec![HostConfig {
                host_id: "dev".into(),
                address: "local".into(),
                store_id: "store0".into(),
                site_id: "site0".into(),
            }],
            shards: vec![ShardConfig {
                shard_id: "shard1".into(),
                members: vec![ShardMemberConfig { host_id: "dev".into(), member_id: 1 }],
            }],
            ..ConfigFile::default()
        };
        Self::new(file).expect("development config is valid")
    }
}

fn validate(file: &ConfigFile) -> Result<()> {
    if file.engine.save_queue_workers == 0 {
        return Err(SkiffError::InvalidConfig {
            field: "engine.save_queue_workers".into(),
            reason: "at least one save-queue worker is required".into(),
        });
    }
    if file.raft.heartbeat_period == 0 || file.raft.election_timeout == 0 {
        return Err(SkiffError::InvalidConfig {
            field: "raft".into(),
            reason: "heartbeat_period and election_timeout must be non-zero".into(),
        });
    }

    let mut seen_members = std::collections::HashSet::new();
    for shard in &file.shards {
        let mut shard_hosts = std::collections::HashSet::new();
        for m in &shard.members {
            if !seen_members.insert(m.member_id) {
                return Err(SkiffError::InvalidConfig {
                    field: "shards".into(),
                    reason: format!("member id {} appears more than once", m.member_id),
                });
            }
            if !shard_hosts.insert(m.host_id.clone()) {
                return Err(SkiffError::InvalidConfig {
                    field: format!("shards.{}", shard.shard_id),
                    reason: format!("host {} holds more than one member of the shard", m.host_id),
                });
            }
            if !file.hosts.iter().any(|h| h.host_id == m.host_id) {
                return Err(SkiffError::InvalidConfig {
                    field: format!("shards.{}", shard.shard_id),
                    reason: format!("unknown host {}", m.host_id),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_file() -> ConfigFile {
        ConfigFile {
            hosts: ["A", "B", "C"]
                .iter()
                .map(|h| HostConfig {
                    host_id: h.to_string(),
                    address: format!("host-{}", h),
                    store_id: "store0".into(),
                    site_id: "site0".into(),
                })
                .collect(),
            shards: vec![ShardConfig {
                shard_id: "shard1".into(),
                members: vec![
                    ShardMemberConfig { host_id: "A".into(), member_id: 4 },
                    ShardMemberConfig { host_id: "B".into(), member_id: 5 },
                    ShardMemberConfig { host_id: "C".into(), member_id: 6 },
                ],
            }],
            ..ConfigFile::default()
        }
    }

    #[test]
    fn topology_lookups() {
        let config = Config::new(three_node_file()).unwrap();
        assert_eq!(config.shard_ids_for_host("B"), vec!["shard1".to_string()]);
        assert_eq!(config.member_on_host("shard1", "C"), Some(6));
        assert_eq!(config.shard_of_member(5).unwrap().shard_id, "shard1");
        assert_eq!(config.address_for_host("A"), Some("host-A"));
        assert!(config.shard_of_member(99).is_none());
    }

    #[test]
    fn duplicate_member_rejected() {
        let mut file = three_node_file();
        file.shards.push(ShardConfig {
            shard_id: "shard2".into(),
            members: vec![ShardMemberConfig { host_id: "A".into(), member_id: 4 }],
        });
        assert!(Config::new(file).is_err());
    }

    #[test]
    fn same_host_twice_in_shard_rejected() {
        let mut file = three_node_file();
        file.shards[0].members[1].host_id = "A".into();
        assert!(Config::new(file).is_err());
    }

    #[test]
    fn dynamic_snapshot_defaults() {
        let config = Config::new(three_node_file()).unwrap();
        let dynamic = config.dynamic();
        assert!(dynamic.write_empty_command_after_election);
        assert!(dynamic.batching);
        assert!(!dynamic.tracing.raft_messages);
    }
}
