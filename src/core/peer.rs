//! Per-remote connection handling.
//!
//! Each peer runs a send thread and a receive thread. The send thread
//! drains a bounded outbound queue of refcounted frames, owns the
//! channel lifecycle (reconnect after failure, recycle after
//! inactivity), and drives the backfill cursor when the local member is
//! a leader and this remote has fallen behind. The receive thread
//! decodes frames and pushes them onto the member's bounded incoming
//! queue — blocking there is the backpressure that keeps a fast remote
//! from outrunning the main loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::SkiffError;
use crate::message::{MessagePool, PooledFrame, WireEntry, WireMessage};
use crate::network::{Channel, Network};
use crate::storage::Storage;
use crate::types::{LogIndex, MemberId};

use super::member::MemberProgress;

/// Receive-side poll granularity (real time; only affects how quickly
/// threads notice stop flags and channel swaps).
const POLL_MS: u64 = 5;

/// Upper bound on entries packed into one backfill batch.
const BACKFILL_BATCH_MAX: usize = 100;

/// Soft byte budget for one backfill batch.
const BACKFILL_BATCH_BYTES: usize = 60 * 1024;

/// Outbound queue depth per peer.
const OUTBOUND_QUEUE_SIZE: usize = 64;

/// A decoded message handed to the member main loop.
pub(crate) struct Incoming {
    pub from: MemberId,
    pub msg: WireMessage,
}

/// Peer state shared between the main loop and the peer threads.
pub(crate) struct PeerShared {
    pub remote: MemberId,
    /// Next index the send thread will stream (backfill cursor).
    pub next_index: AtomicU64,
    /// Highest index known replicated on the remote.
    pub match_index: AtomicU64,
    /// Remote needs catch-up streaming from storage.
    pub backfilling: AtomicBool,
    /// Resend deadline for the one in-flight backfill batch (clock ms;
    /// 0 = nothing in flight).
    pub inflight_until: AtomicU64,
    /// Clock time of the last frame received from this remote.
    pub last_received: AtomicU64,
    /// True for a cross-shard slave attached to a local leader: not
    /// part of any quorum, pruned on inactivity.
    pub is_slave: bool,
    stop: AtomicBool,
}

impl PeerShared {
    pub fn next_index(&self) -> LogIndex {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn match_index(&self) -> LogIndex {
        self.match_index.load(Ordering::Acquire)
    }

    pub fn is_backfilling(&self) -> bool {
        self.backfilling.load(Ordering::Acquire)
    }

    /// Record a successful ack up to `index`.
    pub fn advance(&self, index: LogIndex) {
        self.match_index.fetch_max(index, Ordering::AcqRel);
        self.next_index.fetch_max(index + 1, Ordering::AcqRel);
        self.inflight_until.store(0, Ordering::Release);
    }

    /// Rewind after a failed consistency check. `hint` is the remote's
    /// conflict hint: below a conflicting term run, or its last index
    /// when the probed slot was missing. Every failure moves the cursor
    /// back at least one step so a useless hint still makes progress.
    pub fn rewind(&self, hint: LogIndex) {
        let current = self.next_index.load(Ordering::Acquire);
        let target = (hint + 1).min(current.saturating_sub(1)).max(1);
        self.next_index.store(target, Ordering::Release);
        self.backfilling.store(true, Ordering::Release);
        self.inflight_until.store(0, Ordering::Release);
    }
}

/// Everything peers of one member share.
#[derive(Clone)]
pub(crate) struct PeerContext {
    pub local: MemberId,
    pub network: Arc<dyn Network>,
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
    pub pool: MessagePool,
    pub config: Arc<Config>,
    pub progress: Arc<MemberProgress>,
    pub incoming_tx: Sender<Incoming>,
}

struct Conn {
    channel: Mutex<Option<Arc<dyn Channel>>>,
    established_at: AtomicU64,
}

impl Conn {
    fn current(&self) -> Option<Arc<dyn Channel>> {
        self.channel.lock().clone()
    }

    fn clear(&self) {
        if let Some(ch) = self.channel.lock().take() {
            ch.close();
        }
    }

    fn replace(&self, ch: Arc<dyn Channel>, now: u64) {
        let mut slot = self.channel.lock();
        if let Some(old) = slot.take() {
            old.close();
        }
        *slot = Some(ch);
        self.established_at.store(now, Ordering::Release);
    }
}

/// One remote member: outbound queue, channel, two threads.
pub(crate) struct Peer {
    pub shared: Arc<PeerShared>,
    outbound_tx: Sender<Arc<PooledFrame>>,
    conn: Arc<Conn>,
    handles: Vec<JoinHandle<()>>,
}

impl Peer {
    pub fn new(ctx: &PeerContext, remote: MemberId, is_slave: bool) -> Self {
        let now = ctx.clock.now();
        let shared = Arc::new(PeerShared {
            remote,
            next_index: AtomicU64::new(1),
            match_index: AtomicU64::new(0),
            backfilling: AtomicBool::new(is_slave),
            inflight_until: AtomicU64::new(0),
            last_received: AtomicU64::new(now),
            is_slave,
            stop: AtomicBool::new(false),
        });
        let conn = Arc::new(Conn {
            channel: Mutex::new(None),
            established_at: AtomicU64::new(0),
        });
        let (outbound_tx, outbound_rx) = bounded(OUTBOUND_QUEUE_SIZE);

        let mut handles = Vec::with_capacity(2);
        {
            let ctx = ctx.clone();
            let shared = shared.clone();
            let conn = conn.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("peer-send-{}-{}", ctx.local, remote))
                    .spawn(move || send_loop(ctx, shared, conn, outbound_rx))
                    .unwrap_or_else(|e| panic!("spawn peer sender: {}", e)),
            );
        }
        {
            let ctx = ctx.clone();
            let shared = shared.clone();
            let conn = conn.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("peer-recv-{}-{}", ctx.local, remote))
                    .spawn(move || receive_loop(ctx, shared, conn))
                    .unwrap_or_else(|e| panic!("spawn peer receiver: {}", e)),
            );
        }

        Self { shared, outbound_tx, conn, handles }
    }

    /// Queue a frame for transmission without blocking. Returns false
    /// when the outbound queue is full or torn down; the caller falls
    /// back to backfill.
    pub fn try_send(&self, frame: Arc<PooledFrame>) -> bool {
        self.outbound_tx.try_send(frame).is_ok()
    }

    pub fn stop(mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.conn.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn send_loop(
    ctx: PeerContext,
    shared: Arc<PeerShared>,
    conn: Arc<Conn>,
    outbound_rx: Receiver<Arc<PooledFrame>>,
) {
    let mut suppressor = ErrorSuppressor::new(ctx.clock.clone());
    let retry_period = ctx.config.engine().create_socket_retry_period;
    let inactivity = ctx.config.engine().channel_inactivity_timeout;
    let resend_window = (ctx.config.raft().heartbeat_period * 4).max(500);
    let mut next_reconnect = 0u64;

    while !shared.stop.load(Ordering::Acquire) {
        let now = ctx.clock.now();

        // Channel lifecycle: (re)establish, recycle after inactivity.
        if conn.current().is_none() {
            if now >= next_reconnect {
                match ctx.network.create_channel(ctx.local, shared.remote) {
                    Ok(ch) => conn.replace(Arc::from(ch), now),
                    Err(e) => {
                        suppressor.log("connect", &e);
                        next_reconnect = now + retry_period;
                    }
                }
            }
        } else {
            let active = shared
                .last_received
                .load(Ordering::Acquire)
                .max(conn.established_at.load(Ordering::Acquire));
            if now.saturating_sub(active) > inactivity {
                debug!(
                    local = ctx.local,
                    remote = shared.remote,
                    "channel inactive; recycling"
                );
                conn.clear();
                next_reconnect = now + retry_period;
                continue;
            }
        }

        match outbound_rx.recv_timeout(Duration::from_millis(POLL_MS)) {
            Ok(frame) => {
                if let Some(ch) = conn.current() {
                    if let Err(e) = ch.send(frame.bytes()) {
                        // Drop the frame; append-entries retransmission
                        // repairs the loss after reconnect.
                        suppressor.log("send", &e);
                        conn.clear();
                        next_reconnect = ctx.clock.now() + retry_period;
                    }
                }
                // No channel: drop silently, same recovery path.
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        maybe_backfill(&ctx, &shared, &conn, resend_window, &mut suppressor);
    }
}

/// Stream one catch-up batch from local storage when the remote is
/// behind, one batch in flight at a time.
fn maybe_backfill(
    ctx: &PeerContext,
    shared: &PeerShared,
    conn: &Conn,
    resend_window: u64,
    suppressor: &mut ErrorSuppressor,
) {
    if !ctx.progress.is_leader() || !shared.is_backfilling() {
        return;
    }
    let now = ctx.clock.now();
    if now < shared.inflight_until.load(Ordering::Acquire) {
        return;
    }
    let next = shared.next_index();
    let saved = ctx.progress.saved();
    if next > saved {
        // Caught up with everything durable; leave backfill mode once
        // the in-memory tail is covered too (live sends resume there).
        if next > ctx.progress.last() {
            shared.backfilling.store(false, Ordering::Release);
        }
        return;
    }

    let prev = next - 1;
    let prev_term = if prev == 0 {
        0
    } else {
        match ctx.storage.log_entry(ctx.local, prev) {
            Ok(Some(entry)) => entry.term,
            Ok(None) => {
                warn!(local = ctx.local, index = prev, "backfill predecessor missing");
                return;
            }
            Err(e) => {
                suppressor.log("backfill-read", &e);
                return;
            }
        }
    };

    let mut entries = Vec::new();
    let mut bytes = 0usize;
    let end = saved.min(prev + BACKFILL_BATCH_MAX as u64);
    for index in next..=end {
        match ctx.storage.log_entry(ctx.local, index) {
            Ok(Some(entry)) => {
                bytes += entry.data.len();
                entries.push(WireEntry { term: entry.term, data: entry.data });
                if bytes >= BACKFILL_BATCH_BYTES {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                suppressor.log("backfill-read", &e);
                return;
            }
        }
    }
    if entries.is_empty() {
        return;
    }

    let msg = WireMessage::AppendEntries {
        term: ctx.progress.term(),
        leader: ctx.local,
        prev_log_index: prev,
        prev_log_term: prev_term,
        commit_index: ctx.progress.commit(),
        entries,
    };
    let frame = match ctx.pool.encode(&msg) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(local = ctx.local, error = %e, "backfill encode failed");
            return;
        }
    };
    if let Some(ch) = conn.current() {
        match ch.send(frame.bytes()) {
            Ok(()) => {
                metrics::counter!("skiff_backfill_batches").increment(1);
                shared.inflight_until.store(now + resend_window, Ordering::Release);
            }
            Err(e) => {
                suppressor.log("send", &e);
                conn.clear();
            }
        }
    }
}

fn receive_loop(ctx: PeerContext, shared: Arc<PeerShared>, conn: Arc<Conn>) {
    let mut suppressor = ErrorSuppressor::new(ctx.clock.clone());
    while !shared.stop.load(Ordering::Acquire) {
        let Some(ch) = conn.current() else {
            thread::sleep(Duration::from_millis(POLL_MS));
            continue;
        };
        match ch.recv_timeout(POLL_MS) {
            Ok(Some(frame)) => {
                shared.last_received.store(ctx.clock.now(), Ordering::Release);
                match WireMessage::decode(&frame) {
                    Ok(msg) => {
                        if ctx.config.dynamic().tracing.raft_messages {
                            debug!(
                                local = ctx.local,
                                remote = shared.remote,
                                kind = msg.kind(),
                                term = msg.term(),
                                "received"
                            );
                        }
                        if !push_incoming(&ctx, &shared, msg) {
                            return;
                        }
                    }
                    Err(e) => warn!(local = ctx.local, remote = shared.remote, error = %e, "undecodable frame"),
                }
            }
            Ok(None) => {}
            Err(_) => {
                // Channel died; the send thread rebuilds it.
                suppressor.log("recv", &SkiffError::ChannelClosed);
                thread::sleep(Duration::from_millis(POLL_MS));
            }
        }
    }
}

/// Blocking push with stop checks; full queue means backpressure, not
/// loss.
fn push_incoming(ctx: &PeerContext, shared: &PeerShared, msg: WireMessage) -> bool {
    let mut incoming = Incoming { from: shared.remote, msg };
    loop {
        if shared.stop.load(Ordering::Acquire) {
            return false;
        }
        match ctx
            .incoming_tx
            .send_timeout(incoming, Duration::from_millis(100))
        {
            Ok(()) => return true,
            Err(crossbeam_channel::SendTimeoutError::Timeout(back)) => incoming = back,
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

/// Once-per-minute deduplication of known-noisy transient errors:
/// the first occurrence logs the message, repeats are counted and
/// summarized.
pub(crate) struct ErrorSuppressor {
    clock: Arc<dyn Clock>,
    seen: HashMap<&'static str, Suppressed>,
}

#[derive(Default)]
struct Suppressed {
    count: u64,
    last_emit: Option<u64>,
}

const SUPPRESS_WINDOW_MS: u64 = 60_000;

impl ErrorSuppressor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, seen: HashMap::new() }
    }

    pub fn log(&mut self, what: &'static str, error: &SkiffError) {
        let now = self.clock.now();
        let entry = self.seen.entry(what).or_default();
        let due = entry
            .last_emit
            .map(|at| now.saturating_sub(at) >= SUPPRESS_WINDOW_MS)
            .unwrap_or(true);
        if due {
            if entry.count > 0 {
                warn!(what, error = %error, suppressed = entry.count, "transient error (repeated)");
            } else {
                warn!(what, error = %error, "transient error");
            }
            entry.count = 0;
            entry.last_emit = Some(now);
        } else {
            entry.count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn rewind_only_moves_backwards() {
        let shared = PeerShared {
            remote: 5,
            next_index: AtomicU64::new(10),
            match_index: AtomicU64::new(4),
            backfilling: AtomicBool::new(false),
            inflight_until: AtomicU64::new(99),
            last_received: AtomicU64::new(0),
            is_slave: false,
            stop: AtomicBool::new(false),
        };
        shared.rewind(6);
        assert_eq!(shared.next_index(), 7);
        assert!(shared.is_backfilling());
        assert_eq!(shared.inflight_until.load(Ordering::Acquire), 0);

        // A hint at or above the cursor still steps it back by one.
        shared.rewind(20);
        assert_eq!(shared.next_index(), 6);

        // And the cursor never leaves the log.
        for _ in 0..10 {
            shared.rewind(0);
        }
        assert_eq!(shared.next_index(), 1);
    }

    #[test]
    fn advance_is_monotone() {
        let shared = PeerShared {
            remote: 5,
            next_index: AtomicU64::new(3),
            match_index: AtomicU64::new(2),
            backfilling: AtomicBool::new(true),
            inflight_until: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
            is_slave: false,
            stop: AtomicBool::new(false),
        };
        shared.advance(8);
        assert_eq!(shared.match_index(), 8);
        assert_eq!(shared.next_index(), 9);
        shared.advance(5);
        assert_eq!(shared.match_index(), 8);
        assert_eq!(shared.next_index(), 9);
    }

    #[test]
    fn suppressor_dedupes_within_window() {
        let clock = ManualClock::new();
        let mut suppressor = ErrorSuppressor::new(Arc::new(clock.clone()));
        suppressor.log("send", &SkiffError::ChannelClosed);
        for _ in 0..10 {
            suppressor.log("send", &SkiffError::ChannelClosed);
        }
        assert_eq!(suppressor.seen["send"].count, 10);

        clock.advance(SUPPRESS_WINDOW_MS);
        suppressor.log("send", &SkiffError::ChannelClosed);
        assert_eq!(suppressor.seen["send"].count, 0);
    }
}
