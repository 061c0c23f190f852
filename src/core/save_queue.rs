//! Durable log writer.
//!
//! A bounded queue fed by the member's main loop and drained by a fixed
//! crew of worker threads. Workers write to storage out of order for
//! throughput; the in-memory `saved_index` still only ever advances
//! contiguously — a worker that finished index `i` parks until
//! `saved_index == i - 1`.
//!
//! Conflict truncation serializes the queue: the main loop waits for the
//! queue to drain, then enqueues the truncating entry. A barrier keeps
//! replacement entries queued behind it from being written (and then
//! deleted) before the truncation itself runs.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::storage::Storage;
use crate::types::{LogEntry, LogIndex, MemberId};

/// Notification from the save queue to the member main loop.
#[derive(Debug)]
pub(crate) enum SaveEvent {
    /// `saved_index` changed; carries the new value. May be lower than
    /// the previous value after a conflict truncation.
    Saved(LogIndex),
    /// A storage write failed. A leader must step down rather than
    /// advance the commit index it can no longer back.
    Failed(String),
}

struct SaveItem {
    entry: LogEntry,
    /// When set, delete the suffix `>= truncate_from` before writing.
    truncate_from: Option<LogIndex>,
}

struct SaveInner {
    saved_index: LogIndex,
    /// Indices above an active truncation point may not be written yet.
    barrier: Option<LogIndex>,
    /// Items enqueued but not yet finished.
    pending: usize,
    /// Largest `last_index - saved_index` seen, persisted as the
    /// restart repair-window hint.
    max_gap_seen: u32,
    /// A write failed and left a hole; contiguity waiters above it must
    /// give up instead of parking forever. The member steps down and
    /// the hole is repaired on restart via the max-gap scan.
    failed: bool,
}

struct SaveState {
    member: MemberId,
    storage: Arc<dyn Storage>,
    inner: Mutex<SaveInner>,
    cond: Condvar,
    events: Sender<SaveEvent>,
}

/// Handle owned by the member main loop.
pub(crate) struct SaveQueue {
    tx: Option<Sender<SaveItem>>,
    state: Arc<SaveState>,
    workers: Vec<JoinHandle<()>>,
}

impl SaveQueue {
    /// `initial_saved` is the contiguous durable tail established by the
    /// startup repair scan.
    pub fn new(
        member: MemberId,
        storage: Arc<dyn Storage>,
        workers: usize,
        queue_size: usize,
        initial_saved: LogIndex,
        events: Sender<SaveEvent>,
    ) -> Self {
        let (tx, rx) = bounded(queue_size);
        let state = Arc::new(SaveState {
            member,
            storage,
            inner: Mutex::new(SaveInner {
                saved_index: initial_saved,
                barrier: None,
                pending: 0,
                max_gap_seen: 0,
                failed: false,
            }),
            cond: Condvar::new(),
            events,
        });

        let workers = (0..workers.max(1))
            .map(|i| {
                let state = state.clone();
                let rx: Receiver<SaveItem> = rx.clone();
                thread::Builder::new()
                    .name(format!("save-{}-{}", member, i))
                    .spawn(move || worker_loop(state, rx))
                    .unwrap_or_else(|e| panic!("spawn save worker: {}", e))
            })
            .collect();

        Self { tx: Some(tx), state, workers }
    }

    /// Contiguously durable tail.
    pub fn saved_index(&self) -> LogIndex {
        self.state.inner.lock().saved_index
    }

    /// Queue one entry for durable write. Blocks when the queue is full.
    /// `last_index` is the member's in-memory tail after this entry, used
    /// for max-gap bookkeeping.
    pub fn append(
        &self,
        entry: LogEntry,
        truncate_from: Option<LogIndex>,
        last_index: LogIndex,
    ) -> Result<()> {
        let persist_gap = {
            let mut inner = self.state.inner.lock();
            if let Some(from) = truncate_from {
                // Serialize: a truncation only runs against an idle queue.
                while inner.pending > 0 {
                    self.state.cond.wait(&mut inner);
                }
                inner.barrier = truncate_from;
                // The suffix is as good as gone; nothing above it may be
                // acked or read until the rewrite lands.
                inner.saved_index = inner.saved_index.min(from.saturating_sub(1));
            }
            inner.pending += 1;

            let gap = last_index.saturating_sub(inner.saved_index).min(u32::MAX as u64) as u32;
            if gap > inner.max_gap_seen {
                inner.max_gap_seen = gap;
                Some(gap)
            } else {
                None
            }
        };

        if let Some(gap) = persist_gap {
            // The hint only has to be an upper bound; losing the race to
            // a concurrent grower is fine.
            if let Err(e) = self.state.storage.set_max_gap(self.state.member, gap) {
                warn!(member_id = self.state.member, error = %e, "failed to persist max gap");
            }
        }

        if let Some(tx) = &self.tx {
            if tx.send(SaveItem { entry, truncate_from }).is_ok() {
                return Ok(());
            }
        }
        // Queue torn down under us; roll back the pending count.
        let mut inner = self.state.inner.lock();
        inner.pending -= 1;
        self.state.cond.notify_all();
        Err(crate::error::SkiffError::Shutdown)
    }

    /// Block until everything queued so far is durable.
    pub fn drain(&self) {
        let mut inner = self.state.inner.lock();
        while inner.pending > 0 {
            self.state.cond.wait(&mut inner);
        }
    }

    /// Rebase the durable tail after the caller wiped the log (slave
    /// attach). Only valid on an idle queue.
    pub fn reset(&self, saved: LogIndex) {
        let mut inner = self.state.inner.lock();
        debug_assert_eq!(inner.pending, 0);
        inner.saved_index = saved;
        inner.barrier = None;
        inner.failed = false;
    }

    /// Drain, stop the workers and persist a zero max-gap hint (the
    /// durable tail now matches the in-memory tail exactly).
    pub fn stop(mut self) {
        self.drain();
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Err(e) = self.state.storage.set_max_gap(self.state.member, 0) {
            warn!(member_id = self.state.member, error = %e, "failed to clear max gap");
        }
    }
}

fn worker_loop(state: Arc<SaveState>, rx: Receiver<SaveItem>) {
    while let Ok(item) = rx.recv() {
        let index = item.entry.index;

        if let Some(from) = item.truncate_from {
            // All earlier indices are settled (the enqueue drained the
            // queue), so delete and rewind without further waiting.
            let result = state
                .storage
                .delete_from(state.member, from)
                .and_then(|_| state.storage.append_log_entry(state.member, &item.entry));
            let mut inner = state.inner.lock();
            inner.barrier = None;
            inner.pending -= 1;
            match result {
                Ok(()) => {
                    debug_assert_eq!(index, from);
                    inner.saved_index = index;
                    state.cond.notify_all();
                    drop(inner);
                    metrics::counter!("skiff_log_truncations").increment(1);
                    let _ = state.events.send(SaveEvent::Saved(index));
                }
                Err(e) => {
                    inner.failed = true;
                    state.cond.notify_all();
                    drop(inner);
                    error!(member_id = state.member, index, error = %e, "log truncation failed");
                    let _ = state.events.send(SaveEvent::Failed(e.to_string()));
                }
            }
            continue;
        }

        {
            // Hold writes above an active truncation point.
            let mut inner = state.inner.lock();
            while inner.barrier.map(|b| index > b).unwrap_or(false) {
                state.cond.wait(&mut inner);
            }
        }

        let result = state.storage.append_log_entry(state.member, &item.entry);
        let mut inner = state.inner.lock();
        match result {
            Ok(()) => {
                // Out-of-order write done; advance contiguously.
                while !inner.failed && inner.saved_index + 1 < index {
                    state.cond.wait(&mut inner);
                }
                let advanced = if !inner.failed && index > inner.saved_index {
                    inner.saved_index = index;
                    true
                } else {
                    false
                };
                let saved = inner.saved_index;
                inner.pending -= 1;
                state.cond.notify_all();
                drop(inner);
                metrics::counter!("skiff_log_appends").increment(1);
                if advanced {
                    let _ = state.events.send(SaveEvent::Saved(saved));
                }
            }
            Err(e) => {
                inner.failed = true;
                inner.pending -= 1;
                state.cond.notify_all();
                drop(inner);
                error!(member_id = state.member, index, error = %e, "log append failed");
                let _ = state.events.send(SaveEvent::Failed(e.to_string()));
            }
        }
    }
}

/// Startup repair: establish the contiguous durable tail.
///
/// With a non-zero persisted max gap, the window `[last-gap, last]` may
/// contain holes left by out-of-order writes that never settled. The
/// suffix above the first hole is deleted; the leader re-sends whatever
/// was lost. Term monotonicity across the scanned window is checked
/// here as the corruption tripwire for startup.
pub(crate) fn settle_log(storage: &Arc<dyn Storage>, member: MemberId) -> Result<LogIndex> {
    let last = storage.last_log_index(member)?;
    let max_gap = storage.max_gap(member)? as LogIndex;
    if last == 0 {
        return Ok(0);
    }
    if max_gap == 0 {
        return Ok(last);
    }

    let window_start = last.saturating_sub(max_gap).max(1);
    let mut settled = window_start - 1;
    let mut prev_term = if settled == 0 {
        0
    } else {
        storage
            .log_entry(member, settled)?
            .map(|e| e.term)
            .unwrap_or(0)
    };
    for index in window_start..=last {
        match storage.log_entry(member, index)? {
            Some(entry) => {
                if entry.term < prev_term {
                    return Err(crate::error::SkiffError::CorruptLog(format!(
                        "member {}: term decreases from {} to {} at index {}",
                        member, prev_term, entry.term, index
                    )));
                }
                prev_term = entry.term;
                settled = index;
            }
            None => break,
        }
    }

    if settled < last {
        warn!(
            member_id = member,
            settled,
            last,
            "log tail has a gap; deleting unsettled suffix"
        );
        storage.delete_from(member, settled + 1)?;
    }
    debug!(member_id = member, saved_index = settled, "log settled");
    Ok(settled)
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;
    use crate::storage::MemoryStorage;

    fn setup(initial: &[(u64, u64, &str)]) -> (Arc<dyn Storage>, Receiver<SaveEvent>, SaveQueue) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        for (term, index, data) in initial {
            storage
                .append_log_entry(4, &LogEntry::new(*term, *index, data.as_bytes().to_vec()))
                .unwrap();
        }
        let (tx, rx) = unbounded();
        let saved = storage.last_log_index(4).unwrap();
        let queue = SaveQueue::new(4, storage.clone(), 5, 32, saved, tx);
        (storage, rx, queue)
    }

    #[test]
    fn appends_advance_contiguously() {
        let (storage, _events, queue) = setup(&[]);
        for i in 1..=20u64 {
            queue
                .append(LogEntry::new(1, i, format!("cmd {}", i).into_bytes()), None, i)
                .unwrap();
        }
        queue.drain();
        assert_eq!(queue.saved_index(), 20);
        assert_eq!(storage.last_log_index(4).unwrap(), 20);
        queue.stop();
        assert_eq!(storage.max_gap(4).unwrap(), 0);
    }

    #[test]
    fn truncation_rewrites_conflicting_suffix() {
        let (storage, _events, queue) = setup(&[(1, 1, "a"), (1, 2, "old 2"), (1, 3, "old 3")]);

        // New leader overwrites indices 2..3 with term-2 entries.
        queue
            .append(LogEntry::new(2, 2, b"new 2".to_vec()), Some(2), 2)
            .unwrap();
        queue.append(LogEntry::new(2, 3, b"new 3".to_vec()), None, 3).unwrap();
        queue.drain();

        assert_eq!(queue.saved_index(), 3);
        assert!(storage.has_log_entry(4, 2, 2).unwrap());
        assert!(storage.has_log_entry(4, 3, 2).unwrap());
        assert_eq!(storage.log_entry(4, 2).unwrap().unwrap().data_bytes(), b"new 2");
        queue.stop();
    }

    #[test]
    fn truncation_can_shorten_the_log() {
        let (storage, events, queue) = setup(&[(1, 1, "a"), (1, 2, "b"), (1, 3, "c")]);
        queue
            .append(LogEntry::new(3, 2, b"only 2".to_vec()), Some(2), 2)
            .unwrap();
        queue.drain();

        assert_eq!(queue.saved_index(), 2);
        assert_eq!(storage.last_log_index(4).unwrap(), 2);
        // The rewind is reported.
        let mut last = 0;
        while let Ok(SaveEvent::Saved(i)) = events.try_recv() {
            last = i;
        }
        assert_eq!(last, 2);
        queue.stop();
    }

    #[test]
    fn settle_log_removes_tail_gap() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.append_log_entry(4, &LogEntry::new(1, 1, b"command 1".to_vec())).unwrap();
        storage.append_log_entry(4, &LogEntry::new(1, 3, b"command 3".to_vec())).unwrap();
        storage.set_max_gap(4, 1).unwrap();

        let settled = settle_log(&storage, 4).unwrap();
        assert_eq!(settled, 1);
        assert!(storage.log_entry(4, 3).unwrap().is_none());
        assert_eq!(storage.last_log_index(4).unwrap(), 1);
    }

    #[test]
    fn settle_log_trusts_clean_shutdown() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.append_log_entry(4, &LogEntry::new(1, 1, b"a".to_vec())).unwrap();
        storage.append_log_entry(4, &LogEntry::new(1, 2, b"b".to_vec())).unwrap();
        assert_eq!(settle_log(&storage, 4).unwrap(), 2);
    }

    #[test]
    fn settle_log_detects_term_regression() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.append_log_entry(4, &LogEntry::new(5, 1, b"a".to_vec())).unwrap();
        storage.append_log_entry(4, &LogEntry::new(3, 2, b"b".to_vec())).unwrap();
        storage.set_max_gap(4, 2).unwrap();
        assert!(matches!(
            settle_log(&storage, 4),
            Err(crate::error::SkiffError::CorruptLog(_))
        ));
    }

    #[test]
    fn max_gap_hint_grows_with_inflight_window() {
        let (storage, _events, queue) = setup(&[]);
        // Pretend the in-memory tail is far ahead of the durable one.
        queue.append(LogEntry::new(1, 1, b"a".to_vec()), None, 6).unwrap();
        queue.drain();
        assert!(storage.max_gap(4).unwrap() >= 5);
        queue.stop();
        // Clean shutdown resets the hint.
        assert_eq!(storage.max_gap(4).unwrap(), 0);
    }
}
