//! One replication group and its public command API.
//!
//! A [`Shard`] binds the local [`CoreMember`](crate::core) to its peers
//! and exposes the blocking command surface: check a command out,
//! commit bytes through it, fetch committed entries by index. [`Member`]
//! handles cover per-member operations — leadership queries on any
//! member, control operations (enable, slave mode, forced roles) on the
//! locally hosted one.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tracing::info;

use crate::clock::Clock;
use crate::config::Config;
use crate::core::command::{CommandPipeline, Resolution, Waiter};
use crate::core::member::{self, ControlRequest, MemberProgress, MemberRuntime};
use crate::core::peer::PeerShared;
use crate::core::Command;
use crate::error::{Result, SkiffError};
use crate::message::MessagePool;
use crate::network::Network;
use crate::storage::Storage;
use crate::types::{LogIndex, MemberId, Role, RoleChangeEvent, SlaveStatus, Term};

pub(crate) struct ShardInner {
    shard_id: String,
    local_member: MemberId,
    member_ids: Vec<MemberId>,
    progress: Arc<MemberProgress>,
    peers: HashMap<MemberId, Arc<PeerShared>>,
    control_tx: crossbeam_channel::Sender<ControlRequest>,
    pipeline: Arc<CommandPipeline>,
    runtime: Mutex<MemberRuntime>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

/// One Raft replication group hosted (in part) by this process.
#[derive(Clone)]
pub struct Shard {
    inner: Arc<ShardInner>,
}

impl Shard {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        config: Arc<Config>,
        shard_id: &str,
        host_id: &str,
        storage: Arc<dyn Storage>,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
        pool: MessagePool,
        role_tx: crossbeam_channel::Sender<RoleChangeEvent>,
    ) -> Result<Self> {
        let shard_config = config
            .shard(shard_id)
            .ok_or_else(|| SkiffError::UnknownShard(shard_id.to_string()))?;
        let local_member = config
            .member_on_host(shard_id, host_id)
            .ok_or_else(|| SkiffError::Config(format!(
                "host {} has no member in shard {}",
                host_id, shard_id
            )))?;
        let member_ids: Vec<MemberId> =
            shard_config.members.iter().map(|m| m.member_id).collect();
        let remote_ids: Vec<MemberId> = member_ids
            .iter()
            .copied()
            .filter(|id| *id != local_member)
            .collect();

        let registry = crate::core::command::WaitRegistry::new();
        let (pipeline, command_rx) = CommandPipeline::new(
            registry.clone(),
            clock.clone(),
            config.raft().command_max_size,
            config.engine().command_queue_size,
        );

        let runtime = member::spawn(
            config.clone(),
            shard_id.to_string(),
            local_member,
            remote_ids,
            storage.clone(),
            network,
            clock.clone(),
            pool,
            registry,
            command_rx,
            role_tx,
        )?;

        info!(shard_id, member_id = local_member, "shard started");
        Ok(Self {
            inner: Arc::new(ShardInner {
                shard_id: shard_id.to_string(),
                local_member,
                member_ids,
                progress: runtime.progress.clone(),
                peers: runtime.peers.clone(),
                control_tx: runtime.control_tx.clone(),
                pipeline,
                runtime: Mutex::new(runtime),
                storage,
                clock,
            }),
        })
    }

    pub fn shard_id(&self) -> &str {
        &self.inner.shard_id
    }

    /// Check a pooled command out of the free-list.
    pub fn checkout_command(&self) -> Command {
        self.inner.pipeline.checkout()
    }

    /// Fetch the committed entry at `index`, blocking until it commits
    /// or `timeout_ms` elapses. Index 0 is the sentinel and invalid.
    pub fn committed_command(&self, index: LogIndex, timeout_ms: Option<u64>) -> Result<Command> {
        if index == 0 {
            return Err(SkiffError::InvalidIndex(0));
        }
        let inner = &self.inner;
        let deadline = timeout_ms.map(|t| inner.clock.now() + t);

        loop {
            if inner.progress.slave_master().is_some() {
                return Err(SkiffError::SlaveMode);
            }
            if inner.progress.commit() >= index && inner.progress.saved() >= index {
                let entry = inner
                    .storage
                    .log_entry(inner.local_member, index)?
                    .ok_or_else(|| {
                        SkiffError::Internal(format!("committed entry {} missing", index))
                    })?;
                let mut command = inner.pipeline.checkout();
                command.load(entry);
                return Ok(command);
            }

            let waiter = Waiter::new();
            inner
                .pipeline
                .registry
                .add_read_waiter(index, deadline, waiter.clone());
            match waiter.wait() {
                Resolution::Committed => continue,
                Resolution::Timeout => return Err(SkiffError::Timeout(timeout_ms.unwrap_or(0))),
                Resolution::Shutdown | Resolution::NotLeader(_) => {
                    return Err(SkiffError::Shutdown)
                }
            }
        }
    }

    /// Handle for any member of the shard.
    pub fn member(&self, member_id: MemberId) -> Result<Member> {
        if !self.inner.member_ids.contains(&member_id) {
            return Err(SkiffError::UnknownMember(member_id));
        }
        Ok(Member { shard: self.inner.clone(), member_id })
    }

    /// The member of this shard hosted by this process.
    pub fn local_member(&self) -> Member {
        Member { shard: self.inner.clone(), member_id: self.inner.local_member }
    }

    pub fn members(&self) -> Vec<Member> {
        self.inner
            .member_ids
            .iter()
            .map(|id| Member { shard: self.inner.clone(), member_id: *id })
            .collect()
    }

    /// Highest locally durable index.
    pub fn last_saved_index(&self) -> LogIndex {
        self.inner.progress.saved()
    }

    /// Highest index known committed on a quorum.
    pub fn commit_index(&self) -> LogIndex {
        self.inner.progress.commit()
    }

    pub(crate) fn stop(&self) {
        self.inner.runtime.lock().stop();
        info!(shard_id = %self.inner.shard_id, "shard stopped");
    }
}

impl Drop for ShardInner {
    fn drop(&mut self) {
        // Idempotent; covers handles dropped without an explicit stop
        // (e.g. an engine start that failed partway).
        self.runtime.lock().stop();
    }
}

impl ShardInner {
    fn require_local(&self, member_id: MemberId) -> Result<()> {
        if member_id == self.local_member {
            Ok(())
        } else {
            Err(SkiffError::NotLocal(member_id))
        }
    }
}

/// One participant of a shard. Control operations only apply to the
/// locally hosted member; queries work on any member through the local
/// member's view of the group.
#[derive(Clone)]
pub struct Member {
    shard: Arc<ShardInner>,
    member_id: MemberId,
}

impl Member {
    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn is_local(&self) -> bool {
        self.member_id == self.shard.local_member
    }

    /// Whether this member currently leads the shard, as seen from the
    /// local member.
    pub fn is_leader(&self) -> bool {
        if self.is_local() {
            self.shard.progress.is_leader()
        } else {
            self.shard.progress.leader_id() == Some(self.member_id)
        }
    }

    /// Role of the local member. Only the local member's role is known.
    pub fn role(&self) -> Result<Role> {
        self.shard.require_local(self.member_id)?;
        Ok(self.shard.progress.role())
    }

    pub fn current_term(&self) -> Result<Term> {
        self.shard.require_local(self.member_id)?;
        Ok(self.shard.progress.term())
    }

    pub fn commit_index(&self) -> Result<LogIndex> {
        self.shard.require_local(self.member_id)?;
        Ok(self.shard.progress.commit())
    }

    pub fn saved_index(&self) -> Result<LogIndex> {
        self.shard.require_local(self.member_id)?;
        Ok(self.shard.progress.saved())
    }

    /// An enabled member participates in elections; a disabled one
    /// still votes and follows but refuses leadership.
    pub fn enable(&self, on: bool) -> Result<()> {
        self.shard.require_local(self.member_id)?;
        self.shard
            .control_tx
            .send(ControlRequest::Enable(on))
            .map_err(|_| SkiffError::Shutdown)
    }

    /// Attach this member as a passive mirror of `master`, a leader in
    /// another shard; `None` leaves slave mode. See the crate docs for
    /// the full contract.
    pub fn set_slave(&self, master: Option<MemberId>) -> Result<()> {
        self.shard.require_local(self.member_id)?;
        let (reply_tx, reply_rx) = bounded(1);
        self.shard
            .control_tx
            .send(ControlRequest::SetSlave { master, reply: reply_tx })
            .map_err(|_| SkiffError::Shutdown)?;
        reply_rx.recv().map_err(|_| SkiffError::Shutdown)?
    }

    /// `None` unless the member is in slave mode.
    pub fn slave_status(&self) -> Option<SlaveStatus> {
        if !self.is_local() {
            return None;
        }
        self.shard.progress.slave_status()
    }

    /// Test hook: force the local member into a role without going
    /// through an election. Returns once the transition happened.
    pub fn force_role(&self, role: Role) -> Result<()> {
        self.shard.require_local(self.member_id)?;
        let (reply_tx, reply_rx) = bounded(1);
        self.shard
            .control_tx
            .send(ControlRequest::ForceRole { role, reply: reply_tx })
            .map_err(|_| SkiffError::Shutdown)?;
        reply_rx.recv().map_err(|_| SkiffError::Shutdown)
    }

    /// Whether this remote member's replicated log has caught up with
    /// the local member's durable tail. True for the local member.
    pub fn is_log_up_to_date(&self) -> bool {
        if self.is_local() {
            return true;
        }
        match self.shard.peers.get(&self.member_id) {
            Some(peer) => peer.match_index() >= self.shard.progress.saved(),
            None => false,
        }
    }

    /// Test hook: persisted restart repair-window hint.
    pub fn set_max_gap(&self, gap: u32) -> Result<()> {
        self.shard.require_local(self.member_id)?;
        self.shard.storage.set_max_gap(self.member_id, gap)
    }

    pub fn max_gap(&self) -> Result<u32> {
        self.shard.require_local(self.member_id)?;
        self.shard.storage.max_gap(self.member_id)
    }
}
