//! Test harness: a multi-engine cluster over one in-memory network hub
//! and one shared in-memory storage.
//!
//! The standard topology mirrors the unit-test cluster the engine was
//! built against: shard1 with members 4/5/6 on hosts A/B/C, plus shard2
//! with members 1/2 on hosts D/E for cross-shard (slave) scenarios.
//! Hosts D and E are only started by tests that need them.
//!
//! Storage is shared by all engines and writable before `start`, so a
//! test can seed member logs and votes and have the engines recover
//! them — the equivalent of restarting a process against existing
//! durable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use skiff::config::{
    Config, ConfigFile, EngineConfig, HostConfig, RaftConfig, ShardConfig, ShardMemberConfig,
    StorageConfig,
};
use skiff::network::MemoryNetwork;
use skiff::storage::{MemoryStorage, Storage};
use skiff::{Engine, LogEntry, Member, MemberId, Shard};

pub const HOSTS: [&str; 5] = ["A", "B", "C", "D", "E"];

/// How long assertions wait for the cluster to converge.
pub const CONVERGE: Duration = Duration::from_secs(10);

pub struct Cluster {
    pub storage: Arc<MemoryStorage>,
    pub hub: MemoryNetwork,
    config: ConfigFile,
    engines: HashMap<String, Engine>,
}

fn topology(raft: RaftConfig) -> ConfigFile {
    ConfigFile {
        raft,
        engine: EngineConfig {
            slave_inactivity_timeout: 5_000,
            create_socket_retry_period: 100,
            ..EngineConfig::default()
        },
        storage: StorageConfig { impl_name: "memory".into(), ..StorageConfig::default() },
        hosts: HOSTS
            .iter()
            .map(|h| HostConfig {
                host_id: h.to_string(),
                address: format!("host-{}", h),
                store_id: "store0".into(),
                site_id: "site0".into(),
            })
            .collect(),
        shards: vec![
            ShardConfig {
                shard_id: "shard1".into(),
                members: vec![
                    ShardMemberConfig { host_id: "A".into(), member_id: 4 },
                    ShardMemberConfig { host_id: "B".into(), member_id: 5 },
                    ShardMemberConfig { host_id: "C".into(), member_id: 6 },
                ],
            },
            ShardConfig {
                shard_id: "shard2".into(),
                members: vec![
                    ShardMemberConfig { host_id: "D".into(), member_id: 1 },
                    ShardMemberConfig { host_id: "E".into(), member_id: 2 },
                ],
            },
        ],
        ..ConfigFile::default()
    }
}

impl Cluster {
    /// Fast timers; elections fire on their own.
    pub fn new() -> Self {
        Self::with_raft(RaftConfig {
            heartbeat_period: 25,
            election_timeout: 250,
            leader_timeout: 2_000,
            request_vote_period: 100,
            ..RaftConfig::default()
        })
    }

    /// Elections only happen when a test forces a role: the election
    /// and leader timeouts are effectively infinite, heartbeats stay
    /// fast. Deterministic ground for forced-role scenarios.
    pub fn controlled() -> Self {
        Self::with_raft(RaftConfig {
            heartbeat_period: 25,
            election_timeout: 600_000,
            leader_timeout: 600_000,
            request_vote_period: 100,
            ..RaftConfig::default()
        })
    }

    fn with_raft(raft: RaftConfig) -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            hub: MemoryNetwork::new(),
            config: topology(raft),
            engines: HashMap::new(),
        }
    }

    /// Start engines for hosts A, B and C (the shard1 replicas).
    pub fn start(&mut self) {
        for host in ["A", "B", "C"] {
            self.start_host(host);
        }
    }

    pub fn start_host(&mut self, host: &str) {
        if !self.engines.contains_key(host) {
            let engine = Engine::builder(Config::new(self.config.clone()).unwrap(), host)
                .storage(self.storage.clone() as Arc<dyn Storage>)
                .network(Arc::new(self.hub.handle()))
                .build()
                .unwrap();
            self.engines.insert(host.to_string(), engine);
        }
        self.engines[host].start().unwrap();
    }

    pub fn engine(&self, host: &str) -> &Engine {
        &self.engines[host]
    }

    /// Stop and restart every running engine so members recover from
    /// the (shared, seeded) storage.
    pub fn restart(&mut self) {
        let hosts: Vec<String> = self.engines.keys().cloned().collect();
        for host in &hosts {
            self.engines[host].stop();
        }
        for host in &hosts {
            self.engines[host].start().unwrap();
        }
    }

    pub fn stop_all(&mut self) {
        for engine in self.engines.values() {
            engine.stop();
        }
    }

    fn host_of(&self, member_id: MemberId) -> (&str, &str) {
        for shard in &self.config.shards {
            for m in &shard.members {
                if m.member_id == member_id {
                    return (
                        self.config
                            .hosts
                            .iter()
                            .find(|h| h.host_id == m.host_id)
                            .map(|h| h.host_id.as_str())
                            .unwrap(),
                        shard.shard_id.as_str(),
                    );
                }
            }
        }
        panic!("unknown member {}", member_id);
    }

    /// The shard handle on the engine that hosts `member_id`.
    pub fn shard_of(&self, member_id: MemberId) -> Shard {
        let (host, shard_id) = self.host_of(member_id);
        self.engines[host]
            .shard(shard_id)
            .unwrap_or_else(|| panic!("engine {} has no shard {}", host, shard_id))
    }

    /// The locally hosted member handle for `member_id`.
    pub fn member(&self, member_id: MemberId) -> Member {
        self.shard_of(member_id).local_member()
    }

    /* ---- storage seeding (before start / between restarts) ---- */

    pub fn insert(&self, member_id: MemberId, term: u64, index: u64, data: &str) {
        self.storage
            .append_log_entry(member_id, &LogEntry::new(term, index, data.as_bytes().to_vec()))
            .unwrap();
    }

    pub fn save_vote(&self, member_id: MemberId, term: u64, voted_for: Option<MemberId>) {
        self.storage.save_vote(member_id, term, voted_for).unwrap();
    }

    pub fn set_max_gap(&self, member_id: MemberId, gap: u32) {
        self.storage.set_max_gap(member_id, gap).unwrap();
    }

    /* ---- assertions and waiting ---- */

    /// Poll until `pred` holds or panic after [`CONVERGE`].
    pub fn wait_until(&self, what: &str, mut pred: impl FnMut() -> bool) {
        let deadline = Instant::now() + CONVERGE;
        while Instant::now() < deadline {
            if pred() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for: {}", what);
    }

    /// Members of shard1 (handles on their own engines).
    pub fn shard1_members(&self) -> Vec<Member> {
        [4, 5, 6].iter().map(|id| self.member(*id)).collect()
    }

    pub fn leader_count(&self) -> usize {
        self.shard1_members().iter().filter(|m| m.is_leader()).count()
    }

    /// Wait for exactly one leader in shard1 and return its member id.
    pub fn wait_for_leader(&self) -> MemberId {
        let mut leader = 0;
        self.wait_until("a single leader", || {
            let leaders: Vec<MemberId> = self
                .shard1_members()
                .iter()
                .filter(|m| m.is_leader())
                .map(|m| m.member_id())
                .collect();
            if leaders.len() == 1 {
                leader = leaders[0];
                true
            } else {
                false
            }
        });
        leader
    }

    /// Commit a string through the member's shard; panics on error.
    pub fn commit(&self, member_id: MemberId, s: &str) {
        let shard = self.shard_of(member_id);
        let mut command = shard.checkout_command();
        command.commit(s.as_bytes(), Some(CONVERGE.as_millis() as u64)).unwrap();
        command.release();
    }

    /// Fetch the committed entry at `index` as seen by `member_id` and
    /// assert its payload (and, when `term > 0`, its term).
    pub fn assert_command(&self, member_id: MemberId, term: u64, index: u64, expected: &str) {
        let shard = self.shard_of(member_id);
        let command = shard
            .committed_command(index, Some(CONVERGE.as_millis() as u64))
            .unwrap_or_else(|e| panic!("member {} index {}: {}", member_id, index, e));
        assert_eq!(
            command.as_string(),
            expected,
            "member {} index {}",
            member_id,
            index
        );
        if term > 0 {
            assert_eq!(command.term(), term, "member {} index {} term", member_id, index);
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop_all();
    }
}
