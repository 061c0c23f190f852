//! Command submission and commit notification.
//!
//! Applications check a [`Command`] out of the shard's free-list, commit
//! a payload through it (blocking until the entry is durable on a
//! quorum) and read committed entries back by index. Blocked callers
//! park on a per-waiter condvar; the member main loop resolves waiters
//! whenever the commit index moves and sweeps deadlines on every tick,
//! so timeouts follow the engine's [`Clock`](crate::clock::Clock) —
//! virtual or real.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::clock::Clock;
use crate::error::{Result, SkiffError};
use crate::types::{LogEntry, LogIndex, MemberId, Term};

/// Lifecycle state of a pooled command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// In the free-list, or checked out but not yet submitted.
    Free,
    /// Submitted; the caller is parked on the waiter.
    Waiting,
    /// The entry is committed on a quorum.
    Committed,
    /// The deadline passed first. The entry may still commit later —
    /// timeout is not rollback.
    Timeout,
    /// Rejected or aborted (not leader, shutdown, storage failure).
    Error,
}

/// How the main loop resolved a parked waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Committed,
    Timeout,
    NotLeader(Option<MemberId>),
    Shutdown,
}

#[derive(Default)]
struct WaiterState {
    resolution: Option<Resolution>,
}

/// One parked caller. Resolved exactly once.
pub(crate) struct Waiter {
    state: Mutex<WaiterState>,
    cond: Condvar,
    /// Log position assigned by the main loop (commit waiters only).
    pub index: AtomicU64,
    pub term: AtomicU64,
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaiterState::default()),
            cond: Condvar::new(),
            index: AtomicU64::new(0),
            term: AtomicU64::new(0),
        })
    }

    pub fn resolve(&self, resolution: Resolution) {
        let mut state = self.state.lock();
        if state.resolution.is_none() {
            state.resolution = Some(resolution);
            self.cond.notify_all();
        }
    }

    /// Park until resolved.
    pub fn wait(&self) -> Resolution {
        let mut state = self.state.lock();
        loop {
            if let Some(resolution) = state.resolution {
                return resolution;
            }
            self.cond.wait(&mut state);
        }
    }
}

/// A command submission travelling through the bounded command queue.
pub(crate) struct Submission {
    pub data: Arc<Vec<u8>>,
    /// Absolute deadline in clock ms; `None` waits indefinitely.
    pub deadline: Option<u64>,
    pub waiter: Arc<Waiter>,
}

struct PendingWait {
    index: LogIndex,
    deadline: Option<u64>,
    waiter: Arc<Waiter>,
}

/// Waiters keyed by the commit threshold that releases them.
///
/// Commit waiters are registered by the main loop at index assignment;
/// read waiters by arbitrary reader threads. Registration re-checks the
/// published commit/saved indices under the registry lock, so a commit
/// that lands between the caller's check and its registration cannot be
/// missed.
#[derive(Default)]
pub(crate) struct WaitRegistry {
    commit_waiters: Mutex<Vec<PendingWait>>,
    read_waiters: Mutex<Vec<PendingWait>>,
    commit_index: AtomicU64,
    saved_index: AtomicU64,
}

impl WaitRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of commands whose commit is still outstanding; the leader
    /// throttles the command queue on this.
    pub fn waiting_commits(&self) -> usize {
        self.commit_waiters.lock().len()
    }

    /// Register a commit waiter for an assigned index (main loop only).
    pub fn add_commit_waiter(&self, index: LogIndex, deadline: Option<u64>, waiter: Arc<Waiter>) {
        waiter.index.store(index, Ordering::Release);
        self.commit_waiters.lock().push(PendingWait { index, deadline, waiter });
    }

    /// Register a read waiter released once `commit >= index` and the
    /// entry is locally durable. Resolves immediately if it already is.
    pub fn add_read_waiter(&self, index: LogIndex, deadline: Option<u64>, waiter: Arc<Waiter>) {
        let mut waiters = self.read_waiters.lock();
        if self.commit_index.load(Ordering::Acquire) >= index
            && self.saved_index.load(Ordering::Acquire) >= index
        {
            waiter.resolve(Resolution::Committed);
            return;
        }
        waiters.push(PendingWait { index, deadline, waiter });
    }

    /// Publish progress and release every waiter whose threshold or
    /// deadline has been reached.
    pub fn sweep(&self, commit_index: LogIndex, saved_index: LogIndex, now: u64) {
        self.commit_index.store(commit_index, Ordering::Release);
        self.saved_index.store(saved_index, Ordering::Release);

        let mut commits = self.commit_waiters.lock();
        commits.retain(|w| {
            if w.index <= commit_index {
                w.waiter.resolve(Resolution::Committed);
                false
            } else if w.deadline.map(|d| now >= d).unwrap_or(false) {
                w.waiter.resolve(Resolution::Timeout);
                false
            } else {
                true
            }
        });
        drop(commits);

        let mut reads = self.read_waiters.lock();
        reads.retain(|w| {
            if w.index <= commit_index && w.index <= saved_index {
                w.waiter.resolve(Resolution::Committed);
                false
            } else if w.deadline.map(|d| now >= d).unwrap_or(false) {
                w.waiter.resolve(Resolution::Timeout);
                false
            } else {
                true
            }
        });
    }

    /// Fail every parked commit waiter (step-down, shutdown). Read
    /// waiters survive a step-down: committed reads work on followers.
    pub fn fail_commits(&self, resolution: Resolution) {
        let mut commits = self.commit_waiters.lock();
        for w in commits.drain(..) {
            w.waiter.resolve(resolution);
        }
    }

    /// Fail everything; only used on engine stop.
    pub fn fail_all(&self, resolution: Resolution) {
        self.fail_commits(resolution);
        let mut reads = self.read_waiters.lock();
        for w in reads.drain(..) {
            w.waiter.resolve(resolution);
        }
    }
}

/// Everything a checked-out command needs to submit and wait.
pub(crate) struct CommandPipeline {
    pub command_tx: Sender<Submission>,
    pub registry: Arc<WaitRegistry>,
    pub clock: Arc<dyn Clock>,
    pub command_max_size: usize,
    free: Mutex<Vec<CommandShell>>,
}

impl CommandPipeline {
    pub fn new(
        registry: Arc<WaitRegistry>,
        clock: Arc<dyn Clock>,
        command_max_size: usize,
        queue_size: usize,
    ) -> (Arc<Self>, Receiver<Submission>) {
        let (command_tx, command_rx) = crossbeam_channel::bounded(queue_size);
        let pipeline = Arc::new(Self {
            command_tx,
            registry,
            clock,
            command_max_size,
            free: Mutex::new(Vec::new()),
        });
        (pipeline, command_rx)
    }

    /// Pull a command shell from the free-list.
    pub fn checkout(self: &Arc<Self>) -> Command {
        let shell = self.free.lock().pop().unwrap_or_default();
        Command { pipeline: self.clone(), shell }
    }
}

/// Reusable interior of a [`Command`].
#[derive(Default)]
struct CommandShell {
    data: Arc<Vec<u8>>,
    status: CommandStatus,
    term: Term,
    index: LogIndex,
}

impl Default for CommandStatus {
    fn default() -> Self {
        CommandStatus::Free
    }
}

/// A pooled command handle. See the module docs for the lifecycle.
pub struct Command {
    pipeline: Arc<CommandPipeline>,
    shell: CommandShell,
}

impl Command {
    /// Replicate `payload` and block until it is committed on a quorum,
    /// the optional timeout elapses, or the submission fails.
    ///
    /// On `Ok`, [`Command::index`] and [`Command::term`] identify the
    /// committed entry. A `Timeout` error leaves the entry in flight;
    /// it may still commit and readers must tolerate seeing it.
    pub fn commit(&mut self, payload: &[u8], timeout_ms: Option<u64>) -> Result<()> {
        if payload.len() > self.pipeline.command_max_size {
            self.shell.status = CommandStatus::Error;
            return Err(SkiffError::CommandTooLarge {
                size: payload.len(),
                max: self.pipeline.command_max_size,
            });
        }

        let data = Arc::new(payload.to_vec());
        let waiter = Waiter::new();
        let deadline = timeout_ms.map(|t| self.pipeline.clock.now() + t);
        self.shell.data = data.clone();
        self.shell.status = CommandStatus::Waiting;

        let submission = Submission { data, deadline, waiter: waiter.clone() };
        if self.pipeline.command_tx.send(submission).is_err() {
            self.shell.status = CommandStatus::Error;
            return Err(SkiffError::Shutdown);
        }

        match waiter.wait() {
            Resolution::Committed => {
                self.shell.status = CommandStatus::Committed;
                self.shell.index = waiter.index.load(Ordering::Acquire);
                self.shell.term = waiter.term.load(Ordering::Acquire);
                Ok(())
            }
            Resolution::Timeout => {
                self.shell.status = CommandStatus::Timeout;
                Err(SkiffError::Timeout(timeout_ms.unwrap_or(0)))
            }
            Resolution::NotLeader(leader) => {
                self.shell.status = CommandStatus::Error;
                Err(SkiffError::NotLeader { leader })
            }
            Resolution::Shutdown => {
                self.shell.status = CommandStatus::Error;
                Err(SkiffError::Shutdown)
            }
        }
    }

    /// Fill this command with a fetched committed entry (read path).
    pub(crate) fn load(&mut self, entry: LogEntry) {
        self.shell.data = entry.data;
        self.shell.term = entry.term;
        self.shell.index = entry.index;
        self.shell.status = CommandStatus::Committed;
    }

    pub fn status(&self) -> CommandStatus {
        self.shell.status
    }

    /// The committed payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.shell.data
    }

    /// The payload as a string, lossily.
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.shell.data).into_owned()
    }

    /// Term of the committed entry (0 until committed).
    pub fn term(&self) -> Term {
        self.shell.term
    }

    /// Index of the committed entry (0 until committed).
    pub fn index(&self) -> LogIndex {
        self.shell.index
    }

    /// Return the command to the shard's free-list. Dropping does the
    /// same.
    pub fn release(self) {}
}

impl Drop for Command {
    fn drop(&mut self) {
        let mut shell = std::mem::take(&mut self.shell);
        shell.status = CommandStatus::Free;
        shell.data = Arc::new(Vec::new());
        shell.term = 0;
        shell.index = 0;
        let mut free = self.pipeline.free.lock();
        // Bound the free-list; shells are tiny but there is no reason
        // to keep thousands.
        if free.len() < 256 {
            free.push(shell);
        }
    }
}

/// Try to top up a batch from the command queue without blocking.
pub(crate) fn try_take(rx: &Receiver<Submission>) -> Option<Submission> {
    rx.try_recv().ok()
}
