//! The per-member Raft state machine.
//!
//! One thread per member runs [`CoreMember::run`]: a select loop over
//! the incoming message queue, the command queue, save-queue
//! notifications, control requests, network connect requests and a
//! clock ticker at the heartbeat period. Every role and term transition
//! happens on this thread, so no locks guard the protocol state.
//!
//! Progress that other threads need — role, term, commit/saved/last
//! indices — is published through [`MemberProgress`] atomics after
//! every turn of the loop.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, SkiffError};
use crate::message::{MessagePool, WireEntry, WireMessage};
use crate::network::Network;
use crate::storage::Storage;
use crate::types::{LogEntry, LogIndex, MemberId, Role, RoleChangeEvent, SlaveStatus, Term};

use super::command::{self, Resolution, Submission, WaitRegistry};
use super::peer::{Incoming, Peer, PeerContext, PeerShared};
use super::save_queue::{settle_log, SaveEvent, SaveQueue};

/// Soft byte budget for one live append batch.
const BATCH_BYTES: usize = 60 * 1024;

/// Upper bound on commands folded into one append.
const BATCH_COMMANDS: usize = 64;

/// Member state published to peers, handles and reader threads.
pub(crate) struct MemberProgress {
    role: AtomicU8,
    term: AtomicU64,
    commit: AtomicU64,
    saved: AtomicU64,
    last: AtomicU64,
    leader: AtomicI64,
    slave_master: AtomicI64,
    slave_running: AtomicBool,
    enabled: AtomicBool,
}

impl MemberProgress {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            role: AtomicU8::new(0),
            term: AtomicU64::new(0),
            commit: AtomicU64::new(0),
            saved: AtomicU64::new(0),
            last: AtomicU64::new(0),
            leader: AtomicI64::new(-1),
            slave_master: AtomicI64::new(-1),
            slave_running: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
        })
    }

    pub fn role(&self) -> Role {
        match self.role.load(Ordering::Acquire) {
            2 => Role::Leader,
            1 => Role::Candidate,
            _ => Role::Follower,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role.load(Ordering::Acquire) == 2
    }

    pub fn term(&self) -> Term {
        self.term.load(Ordering::Acquire)
    }

    pub fn commit(&self) -> LogIndex {
        self.commit.load(Ordering::Acquire)
    }

    pub fn saved(&self) -> LogIndex {
        self.saved.load(Ordering::Acquire)
    }

    pub fn last(&self) -> LogIndex {
        self.last.load(Ordering::Acquire)
    }

    pub fn leader_id(&self) -> Option<MemberId> {
        let id = self.leader.load(Ordering::Acquire);
        (id >= 0).then_some(id as MemberId)
    }

    pub fn slave_master(&self) -> Option<MemberId> {
        let id = self.slave_master.load(Ordering::Acquire);
        (id >= 0).then_some(id as MemberId)
    }

    pub fn slave_status(&self) -> Option<SlaveStatus> {
        self.slave_master().map(|master_id| SlaveStatus {
            master_id,
            running: self.slave_running.load(Ordering::Acquire),
            commit_index: self.commit(),
            saved_index: self.saved(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Requests from API handles onto the main loop.
pub(crate) enum ControlRequest {
    SetSlave { master: Option<MemberId>, reply: Sender<Result<()>> },
    Enable(bool),
    ForceRole { role: Role, reply: Sender<()> },
    Stop,
}

/// The running member as seen by its shard: published progress, waiter
/// registry, the control channel and per-peer replication state.
pub(crate) struct MemberRuntime {
    pub progress: Arc<MemberProgress>,
    pub registry: Arc<WaitRegistry>,
    pub control_tx: Sender<ControlRequest>,
    pub peers: HashMap<MemberId, Arc<PeerShared>>,
    handle: Option<JoinHandle<()>>,
}

impl MemberRuntime {
    pub fn stop(&mut self) {
        let _ = self.control_tx.send(ControlRequest::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct SlaveState {
    master: MemberId,
    running: bool,
    /// Clock time of the last append received from the master.
    last_contact: u64,
    /// Clock time of the last (re)connection attempt to the master.
    last_attach: u64,
}

/// The Raft state machine for one local member.
pub(crate) struct CoreMember {
    ctx: PeerContext,
    shard_id: String,
    member_id: MemberId,
    shard_size: usize,

    role: Role,
    current_term: Term,
    voted_for: Option<MemberId>,
    leader_id: Option<MemberId>,
    enabled: bool,

    /// In-memory tail, including entries still in flight to storage.
    last_index: LogIndex,
    last_term: Term,
    /// Terms of in-flight entries, keyed by index; pruned as the save
    /// queue catches up.
    unsaved: BTreeMap<LogIndex, Term>,
    saved_index: LogIndex,
    commit_index: LogIndex,

    /// Latest commit index advertised by the leader (follower side).
    leader_commit: LogIndex,
    last_leader_contact: u64,

    votes: HashSet<MemberId>,
    candidacy_started: u64,
    next_vote_time: u64,

    /// First index carrying the current term; commits only advance at
    /// or above it.
    term_start_index: LogIndex,

    peers: HashMap<MemberId, Peer>,
    slaves: HashMap<MemberId, Peer>,
    master_link: Option<Peer>,
    slave: Option<SlaveState>,

    save_queue: SaveQueue,
    registry: Arc<WaitRegistry>,
    role_tx: Sender<RoleChangeEvent>,

    command_rx: Receiver<Submission>,
    incoming_rx: Receiver<Incoming>,
    control_rx: Receiver<ControlRequest>,
    save_rx: Receiver<SaveEvent>,
    connect_rx: Receiver<MemberId>,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    config: Arc<Config>,
    shard_id: String,
    member_id: MemberId,
    remote_ids: Vec<MemberId>,
    storage: Arc<dyn Storage>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    pool: MessagePool,
    registry: Arc<WaitRegistry>,
    command_rx: Receiver<Submission>,
    role_tx: Sender<RoleChangeEvent>,
) -> Result<MemberRuntime> {
    // Recover durable state; a corrupt tail aborts startup loudly.
    let saved_index = settle_log(&storage, member_id)?;
    let (vote_term, voted_for) = storage.vote(member_id)?;
    let last_term = storage.last_log_term(member_id)?;
    // A log written under a higher term than the persisted vote means
    // the vote record lagged; adopt the higher term.
    let current_term = vote_term.max(last_term);

    let progress = MemberProgress::new();
    progress.term.store(current_term, Ordering::Release);
    progress.saved.store(saved_index, Ordering::Release);
    progress.last.store(saved_index, Ordering::Release);

    let (incoming_tx, incoming_rx) =
        crossbeam_channel::bounded(config.engine().incoming_queue_size);
    let (control_tx, control_rx) = unbounded();
    let (save_tx, save_rx) = unbounded();
    let connect_rx = network.connect_requests(member_id);

    let save_queue = SaveQueue::new(
        member_id,
        storage.clone(),
        config.engine().save_queue_workers,
        config.engine().command_queue_size,
        saved_index,
        save_tx,
    );

    let ctx = PeerContext {
        local: member_id,
        network,
        storage,
        clock,
        pool,
        config,
        progress: progress.clone(),
        incoming_tx,
    };

    let mut peers = HashMap::new();
    for remote in &remote_ids {
        peers.insert(*remote, Peer::new(&ctx, *remote, false));
    }
    let peer_shared: HashMap<MemberId, Arc<PeerShared>> =
        peers.iter().map(|(id, p)| (*id, p.shared.clone())).collect();

    let member = CoreMember {
        shard_size: remote_ids.len() + 1,
        shard_id: shard_id.clone(),
        member_id,
        role: Role::Follower,
        current_term,
        voted_for,
        leader_id: None,
        enabled: true,
        last_index: saved_index,
        last_term,
        unsaved: BTreeMap::new(),
        saved_index,
        commit_index: 0,
        leader_commit: 0,
        last_leader_contact: ctx.clock.now(),
        votes: HashSet::new(),
        candidacy_started: 0,
        next_vote_time: 0,
        term_start_index: 1,
        peers,
        slaves: HashMap::new(),
        master_link: None,
        slave: None,
        save_queue,
        registry: registry.clone(),
        role_tx,
        command_rx,
        incoming_rx,
        control_rx,
        save_rx,
        connect_rx,
        ctx,
    };

    info!(
        member_id,
        shard_id = %shard_id,
        term = current_term,
        saved_index,
        "member recovered"
    );

    let handle = std::thread::Builder::new()
        .name(format!("member-{}", member_id))
        .spawn(move || member.run())
        .map_err(|e| SkiffError::Internal(format!("spawn member thread: {}", e)))?;

    Ok(MemberRuntime {
        progress,
        registry,
        control_tx,
        peers: peer_shared,
        handle: Some(handle),
    })
}

impl CoreMember {
    fn run(mut self) {
        let ticker = self.ctx.clock.ticker(self.ctx.config.raft().heartbeat_period);
        let control_rx = self.control_rx.clone();
        let incoming_rx = self.incoming_rx.clone();
        let save_rx = self.save_rx.clone();
        let connect_rx = self.connect_rx.clone();
        let command_rx = self.command_rx.clone();
        let parked = never::<Submission>();
        let throttle = self.ctx.config.engine().wait_queue_throttle_size;

        loop {
            // Backpressure: a leader over the throttle stops dequeuing
            // commands; submitters then block on the bounded queue.
            let throttled =
                self.role.is_leader() && self.registry.waiting_commits() > throttle;
            let commands = if throttled { &parked } else { &command_rx };

            select! {
                recv(control_rx) -> req => match req {
                    Ok(ControlRequest::Stop) | Err(_) => break,
                    Ok(req) => self.handle_control(req),
                },
                recv(incoming_rx) -> msg => match msg {
                    Ok(incoming) => self.handle_message(incoming),
                    Err(_) => break,
                },
                recv(save_rx) -> event => match event {
                    Ok(event) => self.handle_save_event(event),
                    Err(_) => break,
                },
                recv(commands) -> submission => {
                    if let Ok(submission) = submission {
                        self.handle_commands(submission);
                    }
                },
                recv(connect_rx) -> remote => {
                    if let Ok(remote) = remote {
                        self.handle_connect_request(remote);
                    }
                },
                recv(ticker) -> now => match now {
                    Ok(now) => self.tick(now),
                    Err(_) => break,
                },
            }

            self.publish();
            self.registry
                .sweep(self.commit_index, self.saved_index, self.ctx.clock.now());
        }

        self.shutdown();
    }

    /// Mirror protocol state into the shared atomics.
    fn publish(&self) {
        let p = &self.ctx.progress;
        p.role.store(
            match self.role {
                Role::Follower => 0,
                Role::Candidate => 1,
                Role::Leader => 2,
            },
            Ordering::Release,
        );
        p.term.store(self.current_term, Ordering::Release);
        p.commit.store(self.commit_index, Ordering::Release);
        p.saved.store(self.saved_index, Ordering::Release);
        p.last.store(self.last_index, Ordering::Release);
        p.leader
            .store(self.leader_id.map(|id| id as i64).unwrap_or(-1), Ordering::Release);
        p.slave_master.store(
            self.slave.as_ref().map(|s| s.master as i64).unwrap_or(-1),
            Ordering::Release,
        );
        p.slave_running.store(
            self.slave.as_ref().map(|s| s.running).unwrap_or(false),
            Ordering::Release,
        );
        p.enabled.store(self.enabled, Ordering::Release);
    }

    /* ---------------- control ---------------- */

    fn handle_control(&mut self, req: ControlRequest) {
        match req {
            ControlRequest::Stop => {}
            ControlRequest::Enable(on) => {
                self.enabled = on;
                if !on && !self.role.is_follower() {
                    info!(member_id = self.member_id, "disabled; stepping down");
                    self.become_follower(self.current_term, None);
                }
            }
            ControlRequest::ForceRole { role, reply } => {
                self.force_role(role);
                let _ = reply.send(());
            }
            ControlRequest::SetSlave { master, reply } => {
                let result = self.set_slave(master);
                let _ = reply.send(result);
            }
        }
    }

    /// Test hook: jump straight into a role, with just enough term
    /// bookkeeping to keep the log consistent.
    fn force_role(&mut self, role: Role) {
        if self.slave.is_some() {
            return;
        }
        match role {
            Role::Leader => {
                let term = self.current_term.max(self.last_term);
                if term != self.current_term {
                    self.current_term = term;
                    self.persist_vote();
                }
                self.become_leader();
            }
            Role::Candidate => self.become_candidate(),
            Role::Follower => self.become_follower(self.current_term, None),
        }
    }

    fn set_slave(&mut self, master: Option<MemberId>) -> Result<()> {
        let Some(master) = master else {
            if let Some(slave) = self.slave.take() {
                info!(member_id = self.member_id, master = slave.master, "leaving slave mode");
                if let Some(link) = self.master_link.take() {
                    link.stop();
                }
                // Grace period before the next election fires.
                self.last_leader_contact = self.ctx.clock.now();
                self.leader_id = None;
            }
            return Ok(());
        };

        let master_shard = self
            .ctx
            .config
            .shard_of_member(master)
            .ok_or(SkiffError::UnknownMember(master))?;
        if master_shard.shard_id == self.shard_id {
            return Err(SkiffError::SameShard { master });
        }
        if let Some(slave) = &self.slave {
            if slave.master == master {
                // Idempotent; just refresh the advertisement.
                self.announce_to_master();
                return Ok(());
            }
        }

        info!(member_id = self.member_id, master, "entering slave mode");
        if !self.role.is_follower() {
            self.become_follower(self.current_term, None);
        }
        if let Some(link) = self.master_link.take() {
            link.stop();
        }

        // A slave mirrors the master from scratch: its own log goes.
        self.save_queue.drain();
        self.ctx.storage.delete_from(self.member_id, 1)?;
        self.save_queue.reset(0);
        self.unsaved.clear();
        self.last_index = 0;
        self.last_term = 0;
        self.saved_index = 0;
        self.commit_index = 0;
        self.leader_commit = 0;
        self.leader_id = None;

        let now = self.ctx.clock.now();
        self.slave = Some(SlaveState { master, running: false, last_contact: 0, last_attach: now });
        self.master_link = Some(Peer::new(&self.ctx, master, false));
        self.announce_to_master();
        Ok(())
    }

    /// Advertise (saved tail) to the master; doubles as the slave's
    /// keep-alive.
    fn announce_to_master(&mut self) {
        let Some(link) = &self.master_link else { return };
        let msg = WireMessage::AppendEntriesReply {
            term: self.current_term,
            from: self.member_id,
            success: true,
            last_index: self.saved_index,
        };
        if let Ok(frame) = self.ctx.pool.encode(&msg) {
            link.try_send(Arc::new(frame));
        }
    }

    /// A remote dialed us. Known shard peers are already wired; a
    /// foreign member is a slave wanting this leader's log.
    fn handle_connect_request(&mut self, remote: MemberId) {
        if self.slave.is_some()
            || remote == self.member_id
            || self.peers.contains_key(&remote)
            || self.slaves.contains_key(&remote)
        {
            return;
        }
        if !self.role.is_leader() {
            return; // the slave keeps redialing; a leader will pick it up
        }
        let foreign = self
            .ctx
            .config
            .shard_of_member(remote)
            .map(|s| s.shard_id != self.shard_id)
            .unwrap_or(false);
        if !foreign {
            return;
        }
        info!(member_id = self.member_id, slave = remote, "slave attached");
        self.slaves.insert(remote, Peer::new(&self.ctx, remote, true));
    }

    /* ---------------- commands ---------------- */

    fn handle_commands(&mut self, first: Submission) {
        if !self.role.is_leader() {
            first.waiter.resolve(Resolution::NotLeader(self.leader_id));
            return;
        }

        let mut batch = vec![first];
        if self.ctx.config.dynamic().batching {
            let mut bytes = batch[0].data.len();
            while batch.len() < BATCH_COMMANDS && bytes < BATCH_BYTES {
                match command::try_take(&self.command_rx) {
                    Some(submission) => {
                        bytes += submission.data.len();
                        batch.push(submission);
                    }
                    None => break,
                }
            }
        }

        let start_index = self.last_index + 1;
        let mut entries = Vec::with_capacity(batch.len());
        for (offset, submission) in batch.into_iter().enumerate() {
            let index = start_index + offset as u64;
            let entry = LogEntry::with_arc_data(self.current_term, index, submission.data);
            if self.ctx.config.dynamic().tracing.commands {
                debug!(member_id = self.member_id, index, "command assigned");
            }
            submission.waiter.term.store(self.current_term, Ordering::Release);
            self.registry
                .add_commit_waiter(index, submission.deadline, submission.waiter);
            entries.push(WireEntry { term: entry.term, data: entry.data.clone() });
            self.append_local(entry, None);
        }
        metrics::counter!("skiff_commands_appended").increment(entries.len() as u64);
        self.broadcast_entries(start_index, entries);
    }

    /// Record an entry in the in-memory tail and hand it to the save
    /// queue, in parallel with peer transmission.
    fn append_local(&mut self, entry: LogEntry, truncate_from: Option<LogIndex>) {
        self.last_index = entry.index;
        self.last_term = entry.term;
        self.unsaved.insert(entry.index, entry.term);
        if let Err(e) = self.save_queue.append(entry, truncate_from, self.last_index) {
            warn!(member_id = self.member_id, error = %e, "save queue rejected entry");
        }
    }

    /// Ship freshly appended entries to every caught-up peer; everyone
    /// else is (or becomes) served by backfill.
    fn broadcast_entries(&mut self, start_index: LogIndex, entries: Vec<WireEntry>) {
        let prev = start_index - 1;
        let msg = WireMessage::AppendEntries {
            term: self.current_term,
            leader: self.member_id,
            prev_log_index: prev,
            prev_log_term: self.term_at(prev),
            commit_index: self.commit_index,
            entries,
        };
        let frame = match self.ctx.pool.encode(&msg) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                error!(member_id = self.member_id, error = %e, "append encode failed");
                return;
            }
        };
        for peer in self.peers.values().chain(self.slaves.values()) {
            if peer.shared.is_backfilling() || peer.shared.next_index() != start_index {
                peer.shared.backfilling.store(true, Ordering::Release);
                continue;
            }
            if peer.try_send(frame.clone()) {
                peer.shared
                    .next_index
                    .fetch_max(self.last_index + 1, Ordering::AcqRel);
            } else {
                // Full outbound queue: let the backfill path recover.
                peer.shared.backfilling.store(true, Ordering::Release);
            }
        }
    }

    /// Term of the entry at `index`, from the in-flight window or
    /// storage; 0 for the sentinel.
    fn term_at(&self, index: LogIndex) -> Term {
        if index == 0 {
            return 0;
        }
        if let Some(term) = self.unsaved.get(&index) {
            return *term;
        }
        match self.ctx.storage.log_entry(self.member_id, index) {
            Ok(Some(entry)) => entry.term,
            Ok(None) => 0,
            Err(e) => {
                warn!(member_id = self.member_id, index, error = %e, "term lookup failed");
                0
            }
        }
    }

    /// Like [`Self::term_at`] but distinguishes "no entry".
    fn existing_term(&self, index: LogIndex) -> Option<Term> {
        if let Some(term) = self.unsaved.get(&index) {
            return Some(*term);
        }
        if index <= self.saved_index {
            if let Ok(Some(entry)) = self.ctx.storage.log_entry(self.member_id, index) {
                return Some(entry.term);
            }
        }
        None
    }

    /* ---------------- messages ---------------- */

    fn handle_message(&mut self, incoming: Incoming) {
        let Incoming { from, msg } = incoming;

        // Slave mode suspends normal protocol: only the master's
        // appends matter, and its term space is a foreign one.
        if let Some(slave) = &self.slave {
            if from == slave.master {
                self.handle_master_message(msg);
            }
            return;
        }
        // Messages from attached slaves live outside this shard's term
        // space as well.
        if self.slaves.contains_key(&from) {
            self.handle_slave_reply(from, msg);
            return;
        }
        // Anything else from outside the shard (say, an ex-master still
        // streaming after a detach) has no business in this group's
        // protocol.
        if !self.peers.contains_key(&from) {
            debug!(member_id = self.member_id, from, "ignoring foreign-shard message");
            return;
        }

        // Universal rule: a higher term forces step-down and adoption.
        if msg.term() > self.current_term {
            debug!(
                member_id = self.member_id,
                term = msg.term(),
                old_term = self.current_term,
                "higher term observed"
            );
            self.become_follower(msg.term(), None);
        }

        match msg {
            WireMessage::RequestVote { term, candidate, last_log_index, last_log_term } => {
                self.handle_request_vote(term, candidate, last_log_index, last_log_term);
            }
            WireMessage::RequestVoteReply { term, from, granted } => {
                self.handle_vote_reply(term, from, granted);
            }
            WireMessage::AppendEntries {
                term,
                leader,
                prev_log_index,
                prev_log_term,
                commit_index,
                entries,
            } => {
                self.handle_append_entries(
                    term,
                    leader,
                    prev_log_index,
                    prev_log_term,
                    commit_index,
                    entries,
                );
            }
            WireMessage::AppendEntriesReply { term, from, success, last_index } => {
                self.handle_append_reply(term, from, success, last_index);
            }
        }
    }

    fn handle_request_vote(
        &mut self,
        term: Term,
        candidate: MemberId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) {
        let granted = if term < self.current_term {
            false
        } else {
            let up_to_date = (last_log_term, last_log_index) >= (self.last_term, self.last_index);
            let unvoted = self.voted_for.is_none() || self.voted_for == Some(candidate);
            if up_to_date && !unvoted {
                debug!(
                    member_id = self.member_id,
                    candidate,
                    voted_for = ?self.voted_for,
                    "vote already spent this term"
                );
            }
            up_to_date && unvoted
        };

        if granted {
            self.voted_for = Some(candidate);
            // The vote must be durable before the reply leaves.
            self.persist_vote();
            self.last_leader_contact = self.ctx.clock.now();
        }
        debug!(member_id = self.member_id, candidate, term, granted, "vote handled");
        self.send_to(
            candidate,
            &WireMessage::RequestVoteReply {
                term: self.current_term,
                from: self.member_id,
                granted,
            },
        );
    }

    fn handle_vote_reply(&mut self, term: Term, from: MemberId, granted: bool) {
        if !self.role.is_candidate() || term != self.current_term || !granted {
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.quorum() {
            info!(
                member_id = self.member_id,
                term = self.current_term,
                votes = self.votes.len(),
                "election won"
            );
            self.become_leader();
        }
    }

    fn handle_append_entries(
        &mut self,
        term: Term,
        leader: MemberId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        commit_index: LogIndex,
        entries: Vec<WireEntry>,
    ) {
        if term < self.current_term {
            self.send_to(
                leader,
                &WireMessage::AppendEntriesReply {
                    term: self.current_term,
                    from: self.member_id,
                    success: false,
                    last_index: self.last_index,
                },
            );
            return;
        }
        if self.role.is_leader() {
            // Equal-term second leader: a protocol violation, not a
            // reason to crash.
            warn!(
                member_id = self.member_id,
                other = leader,
                term,
                "append entries from another leader of the same term; ignored"
            );
            return;
        }
        if self.role.is_candidate() {
            self.become_follower(self.current_term, Some(leader));
        }
        self.leader_id = Some(leader);
        self.last_leader_contact = self.ctx.clock.now();
        self.leader_commit = commit_index;

        if !self.accept_entries(prev_log_index, prev_log_term, entries) {
            self.send_to(
                leader,
                &WireMessage::AppendEntriesReply {
                    term: self.current_term,
                    from: self.member_id,
                    success: false,
                    last_index: self.rewind_hint(prev_log_index, prev_log_term),
                },
            );
            return;
        }

        self.commit_index = self
            .commit_index
            .max(self.leader_commit.min(self.saved_index));
        self.send_to(
            leader,
            &WireMessage::AppendEntriesReply {
                term: self.current_term,
                from: self.member_id,
                success: true,
                last_index: self.saved_index,
            },
        );
    }

    /// Consistency-check an append and fold its entries into the local
    /// log, truncating a conflicting suffix. Returns false on a failed
    /// prev check.
    fn accept_entries(
        &mut self,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<WireEntry>,
    ) -> bool {
        if prev_log_index > 0 && self.existing_term(prev_log_index) != Some(prev_log_term) {
            return false;
        }

        let mut index = prev_log_index;
        let mut truncated = false;
        for wire in entries {
            index += 1;
            match self.existing_term(index) {
                Some(term) if term == wire.term && !truncated => continue, // already have it
                Some(_) if !truncated => {
                    // First conflict: drop our suffix, rewrite from here.
                    self.truncate_suffix(index);
                    truncated = true;
                    self.append_local(
                        LogEntry::with_arc_data(wire.term, index, wire.data),
                        Some(index),
                    );
                }
                _ => {
                    self.append_local(LogEntry::with_arc_data(wire.term, index, wire.data), None);
                }
            }
        }
        true
    }

    /// Cut the in-memory tail before overwriting a conflicting suffix;
    /// the durable cut rides with the save-queue truncate item. The
    /// durable-tail view rewinds immediately so nothing above the cut
    /// is acked, committed or read while the rewrite is in flight.
    fn truncate_suffix(&mut self, from: LogIndex) {
        self.unsaved.split_off(&from);
        self.last_index = from - 1;
        self.last_term = self.term_at(self.last_index);
        self.saved_index = self.saved_index.min(from - 1);
    }

    /// Failure hint for the leader. When the probed slot holds an entry
    /// of the wrong term, point below that entire term run so the
    /// rewind skips it in one step; otherwise report the local tail.
    fn rewind_hint(&self, prev_log_index: LogIndex, _prev_log_term: Term) -> LogIndex {
        match self.existing_term(prev_log_index) {
            Some(conflicting) => {
                let mut first = prev_log_index;
                while first > 1 && self.existing_term(first - 1) == Some(conflicting) {
                    first -= 1;
                }
                first - 1
            }
            None => self.last_index,
        }
    }

    fn handle_append_reply(
        &mut self,
        term: Term,
        from: MemberId,
        success: bool,
        last_index: LogIndex,
    ) {
        if !self.role.is_leader() || term < self.current_term {
            return;
        }
        let Some(peer) = self.peers.get(&from) else { return };
        if success {
            // A follower carrying a longer stale suffix may ack past our
            // own tail; its extras are not part of this log yet.
            peer.shared.advance(last_index.min(self.last_index));
            self.advance_commit();
        } else {
            peer.shared.rewind(last_index);
        }
    }

    /// Leader-side handling of traffic from an attached slave: acks
    /// move its cursor, nothing here touches our term space.
    fn handle_slave_reply(&mut self, from: MemberId, msg: WireMessage) {
        if !self.role.is_leader() {
            return;
        }
        let Some(peer) = self.slaves.get(&from) else { return };
        if let WireMessage::AppendEntriesReply { success, last_index, .. } = msg {
            if success {
                peer.shared.advance(last_index.min(self.last_index));
                peer.shared.backfilling.store(true, Ordering::Release);
            } else {
                peer.shared.rewind(last_index);
            }
        }
    }

    /// Slave-side handling of the master's stream. Term comparisons are
    /// suspended — the master lives in a foreign term space — but log
    /// consistency checks work exactly as for a follower.
    fn handle_master_message(&mut self, msg: WireMessage) {
        let WireMessage::AppendEntries {
            prev_log_index,
            prev_log_term,
            commit_index,
            entries,
            ..
        } = msg
        else {
            return;
        };
        if self.slave.is_none() {
            return;
        }

        let accepted = self.accept_entries(prev_log_index, prev_log_term, entries);
        let now = self.ctx.clock.now();
        if let Some(slave) = self.slave.as_mut() {
            slave.running = true;
            slave.last_contact = now;
        }
        if accepted {
            // Keep our term at least as high as the mirrored log so a
            // later candidacy cannot write lower-termed entries above it.
            if self.last_term > self.current_term {
                self.current_term = self.last_term;
                self.voted_for = None;
                self.persist_vote();
            }
            self.commit_index = self.commit_index.max(commit_index.min(self.saved_index));
        }
        let reply = WireMessage::AppendEntriesReply {
            term: self.current_term,
            from: self.member_id,
            success: accepted,
            last_index: if accepted {
                self.saved_index
            } else {
                self.rewind_hint(prev_log_index, prev_log_term)
            },
        };
        if let Some(link) = &self.master_link {
            if let Ok(frame) = self.ctx.pool.encode(&reply) {
                link.try_send(Arc::new(frame));
            }
        }
    }

    /* ---------------- save events ---------------- */

    fn handle_save_event(&mut self, event: SaveEvent) {
        match event {
            SaveEvent::Saved(index) => {
                if self.ctx.config.dynamic().tracing.storage {
                    debug!(member_id = self.member_id, saved_index = index, "durable");
                }
                // The event value may predate a truncation that raced
                // past it; the queue itself is the authority.
                self.saved_index = self.save_queue.saved_index();
                // Entries at or below the durable tail leave the
                // in-flight window.
                self.unsaved = self.unsaved.split_off(&(self.saved_index + 1));

                if self.role.is_leader() {
                    self.advance_commit();
                } else {
                    self.commit_index = self
                        .commit_index
                        .max(self.leader_commit.min(self.saved_index));
                    self.ack_progress();
                }
            }
            SaveEvent::Failed(error) => {
                error!(member_id = self.member_id, error = %error, "durable write failed");
                if self.role.is_leader() {
                    // Cannot guarantee quorum durability any more;
                    // yield rather than advance a commit index we
                    // cannot back.
                    self.become_candidate();
                }
            }
        }
    }

    /// Durable ack to whoever is streaming to us.
    fn ack_progress(&mut self) {
        let target = match (&self.slave, self.leader_id) {
            (Some(slave), _) => Some(slave.master),
            (None, Some(leader)) => Some(leader),
            _ => None,
        };
        let Some(target) = target else { return };
        let msg = WireMessage::AppendEntriesReply {
            term: self.current_term,
            from: self.member_id,
            success: true,
            last_index: self.saved_index,
        };
        if self.slave.is_some() {
            if let Some(link) = &self.master_link {
                if let Ok(frame) = self.ctx.pool.encode(&msg) {
                    link.try_send(Arc::new(frame));
                }
            }
        } else {
            self.send_to(target, &msg);
        }
    }

    /// Leader commit rule: the highest index durable on a majority,
    /// provided it carries the current term.
    fn advance_commit(&mut self) {
        let mut indices: Vec<LogIndex> = self
            .peers
            .values()
            .map(|p| p.shared.match_index())
            .collect();
        indices.push(self.saved_index);
        indices.sort_unstable_by(|a, b| b.cmp(a));

        // Also capped at the local durable tail: commit never outruns
        // what this member can itself serve.
        let candidate = indices[self.quorum() - 1].min(self.saved_index);
        if candidate > self.commit_index && candidate >= self.term_start_index {
            self.commit_index = candidate;
            metrics::gauge!("skiff_commit_index").set(candidate as f64);
            if self.ctx.config.dynamic().tracing.commands {
                debug!(member_id = self.member_id, commit_index = candidate, "commit advanced");
            }
        }
    }

    /* ---------------- timers ---------------- */

    fn tick(&mut self, now: u64) {
        if self.slave.is_some() {
            self.slave_tick(now);
            return;
        }
        let election_timeout = self.ctx.config.raft().election_timeout;
        let request_vote_period = self.ctx.config.raft().request_vote_period;
        let leader_timeout = self.ctx.config.raft().leader_timeout;
        match self.role {
            Role::Follower => {
                if self.enabled
                    && now.saturating_sub(self.last_leader_contact) >= election_timeout
                {
                    self.become_candidate();
                }
            }
            Role::Candidate => {
                if now.saturating_sub(self.candidacy_started) >= election_timeout {
                    // Election fizzled; start over at a higher term.
                    self.become_candidate();
                } else if now >= self.next_vote_time {
                    self.broadcast_vote_request();
                    self.next_vote_time =
                        now + rand::thread_rng().gen_range(0..=request_vote_period);
                }
            }
            Role::Leader => {
                self.send_heartbeats();
                self.prune_slaves(now);

                let responsive = self
                    .peers
                    .values()
                    .filter(|p| {
                        now.saturating_sub(p.shared.last_received.load(Ordering::Acquire))
                            <= leader_timeout
                    })
                    .count();
                if responsive < self.shard_size / 2 {
                    warn!(
                        member_id = self.member_id,
                        responsive,
                        "not enough responsive followers; stepping down"
                    );
                    self.become_candidate();
                }
            }
        }
    }

    fn slave_tick(&mut self, now: u64) {
        let raft_election_timeout = self.ctx.config.raft().election_timeout;
        let retry = self.ctx.config.engine().create_socket_retry_period;
        let mut reattach = false;
        if let Some(slave) = self.slave.as_mut() {
            if slave.running
                && now.saturating_sub(slave.last_contact) >= raft_election_timeout
            {
                // The master went quiet — likely no longer the leader.
                slave.running = false;
            }
            if !slave.running && now.saturating_sub(slave.last_attach) >= retry {
                slave.last_attach = now;
                reattach = true;
            }
        }
        if reattach {
            // Redial so a newly elected master sees our connect request.
            if let Some(slave) = &self.slave {
                let master = slave.master;
                if let Some(link) = self.master_link.take() {
                    link.stop();
                }
                self.master_link = Some(Peer::new(&self.ctx, master, false));
            }
        }
        self.announce_to_master();
    }

    fn send_heartbeats(&mut self) {
        let msg = WireMessage::AppendEntries {
            term: self.current_term,
            leader: self.member_id,
            prev_log_index: self.last_index,
            prev_log_term: self.last_term,
            commit_index: self.commit_index,
            entries: vec![],
        };
        let frame = match self.ctx.pool.encode(&msg) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                error!(member_id = self.member_id, error = %e, "heartbeat encode failed");
                return;
            }
        };
        for peer in self.peers.values().chain(self.slaves.values()) {
            if peer.shared.is_backfilling() {
                continue; // its catch-up stream is the heartbeat
            }
            peer.try_send(frame.clone());
        }
    }

    fn prune_slaves(&mut self, now: u64) {
        let timeout = self.ctx.config.dynamic().slave_inactivity_timeout;
        let dead: Vec<MemberId> = self
            .slaves
            .iter()
            .filter(|(_, p)| {
                now.saturating_sub(p.shared.last_received.load(Ordering::Acquire)) > timeout
            })
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            info!(member_id = self.member_id, slave = id, "pruning inactive slave");
            if let Some(peer) = self.slaves.remove(&id) {
                peer.stop();
            }
        }
    }

    /* ---------------- role transitions ---------------- */

    fn quorum(&self) -> usize {
        self.shard_size / 2 + 1
    }

    fn persist_vote(&mut self) {
        if let Err(e) = self
            .ctx
            .storage
            .save_vote(self.member_id, self.current_term, self.voted_for)
        {
            error!(member_id = self.member_id, error = %e, "vote persistence failed");
        }
    }

    fn become_follower(&mut self, term: Term, leader: Option<MemberId>) {
        let old = self.role;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_vote();
        }
        self.role = Role::Follower;
        self.leader_id = leader;
        self.last_leader_contact = self.ctx.clock.now();
        if old.is_leader() {
            // Parked submitters reroute; their entries may still commit.
            self.registry.fail_commits(Resolution::NotLeader(leader));
        }
        if old != Role::Follower {
            info!(member_id = self.member_id, term = self.current_term, "became follower");
            self.role_event(old, Role::Follower);
        }
    }

    fn become_candidate(&mut self) {
        if !self.enabled || self.slave.is_some() {
            return;
        }
        let old = self.role;
        if old.is_leader() {
            self.registry.fail_commits(Resolution::NotLeader(None));
        }
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.member_id);
        self.persist_vote();
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.member_id);

        let now = self.ctx.clock.now();
        self.candidacy_started = now;
        self.next_vote_time =
            now + rand::thread_rng().gen_range(0..=self.ctx.config.raft().request_vote_period);
        info!(member_id = self.member_id, term = self.current_term, "became candidate");
        metrics::counter!("skiff_elections_started").increment(1);
        if old != Role::Candidate {
            self.role_event(old, Role::Candidate);
        }

        if self.votes.len() >= self.quorum() {
            // Single-member shard; nobody else to ask.
            self.become_leader();
        } else {
            self.broadcast_vote_request();
        }
    }

    fn broadcast_vote_request(&mut self) {
        let msg = WireMessage::RequestVote {
            term: self.current_term,
            candidate: self.member_id,
            last_log_index: self.last_index,
            last_log_term: self.last_term,
        };
        let frame = match self.ctx.pool.encode(&msg) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                error!(member_id = self.member_id, error = %e, "vote encode failed");
                return;
            }
        };
        for peer in self.peers.values() {
            peer.try_send(frame.clone());
        }
    }

    fn become_leader(&mut self) {
        if !self.enabled {
            return;
        }
        let old = self.role;
        self.role = Role::Leader;
        self.leader_id = Some(self.member_id);

        let now = self.ctx.clock.now();
        for peer in self.peers.values() {
            peer.shared.next_index.store(self.last_index + 1, Ordering::Release);
            peer.shared.match_index.store(0, Ordering::Release);
            peer.shared.backfilling.store(false, Ordering::Release);
            peer.shared.inflight_until.store(0, Ordering::Release);
            peer.shared.last_received.store(now, Ordering::Release);
        }

        // First index of the current-term run at the tail; commits only
        // advance at or above it.
        let mut index = self.last_index;
        while index >= 1 && self.term_at(index) == self.current_term {
            index -= 1;
        }
        self.term_start_index = index + 1;

        info!(
            member_id = self.member_id,
            term = self.current_term,
            last_index = self.last_index,
            "became leader"
        );
        if old != Role::Leader {
            self.role_event(old, Role::Leader);
        }

        // Entries of earlier terms cannot be counted for commit; an
        // empty command at the current term unblocks them.
        let dynamic = self.ctx.config.dynamic();
        if dynamic.write_empty_command_after_election
            && (self.last_index == 0 || self.last_term < self.current_term)
        {
            let index = self.last_index + 1;
            let noop = LogEntry::with_arc_data(self.current_term, index, Arc::new(Vec::new()));
            let wire = vec![WireEntry { term: noop.term, data: noop.data.clone() }];
            self.append_local(noop, None);
            self.broadcast_entries(index, wire);
        }
        self.publish();
        self.send_heartbeats();
    }

    fn role_event(&self, old: Role, new: Role) {
        let _ = self.role_tx.send(RoleChangeEvent {
            member_id: self.member_id,
            shard_id: self.shard_id.clone(),
            old_role: old,
            new_role: new,
            leader_id: self.leader_id,
        });
    }

    /* ---------------- plumbing ---------------- */

    fn send_to(&self, remote: MemberId, msg: &WireMessage) {
        let Some(peer) = self.peers.get(&remote) else {
            debug!(member_id = self.member_id, remote, "no peer for reply");
            return;
        };
        if self.ctx.config.dynamic().tracing.raft_messages {
            debug!(
                member_id = self.member_id,
                remote,
                kind = msg.kind(),
                term = msg.term(),
                "sending"
            );
        }
        match self.ctx.pool.encode(msg) {
            Ok(frame) => {
                peer.try_send(Arc::new(frame));
            }
            Err(e) => warn!(member_id = self.member_id, error = %e, "encode failed"),
        }
    }

    fn shutdown(mut self) {
        debug!(member_id = self.member_id, "member stopping");
        self.registry.fail_all(Resolution::Shutdown);
        for (_, peer) in self.peers.drain() {
            peer.stop();
        }
        for (_, peer) in self.slaves.drain() {
            peer.stop();
        }
        if let Some(link) = self.master_link.take() {
            link.stop();
        }
        self.save_queue.stop();
    }
}
