//! Pooled wire messages.
//!
//! Exactly four message types cross the wire. Outbound messages are
//! encoded once into a buffer checked out of the [`MessagePool`] and
//! shared by reference count across every destination (save queue
//! fan-out aside, a heartbeat goes to all peers as one buffer); the
//! buffer returns to the pool when the last reference drops. Entry
//! payloads ride as `Arc<Vec<u8>>`, so encoding does not copy them out
//! of the log.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{arc_bytes, LogIndex, MemberId, Term};

/// One log entry as carried inside an AppendEntries message. Indices
/// are implicit: entries are contiguous starting at `prev_log_index+1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEntry {
    pub term: Term,
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

/// The wire protocol between members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    RequestVote {
        term: Term,
        candidate: MemberId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    RequestVoteReply {
        term: Term,
        from: MemberId,
        granted: bool,
    },
    AppendEntries {
        term: Term,
        leader: MemberId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        commit_index: LogIndex,
        entries: Vec<WireEntry>,
    },
    AppendEntriesReply {
        term: Term,
        from: MemberId,
        success: bool,
        /// On success: the sender's durable tail (ack). On failure: the
        /// sender's last index, used by the leader to rewind quickly.
        last_index: LogIndex,
    },
}

impl WireMessage {
    /// The sender's term, present in every message type.
    pub fn term(&self) -> Term {
        match self {
            WireMessage::RequestVote { term, .. }
            | WireMessage::RequestVoteReply { term, .. }
            | WireMessage::AppendEntries { term, .. }
            | WireMessage::AppendEntriesReply { term, .. } => *term,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::RequestVote { .. } => "RequestVote",
            WireMessage::RequestVoteReply { .. } => "RequestVoteReply",
            WireMessage::AppendEntries { .. } => "AppendEntries",
            WireMessage::AppendEntriesReply { .. } => "AppendEntriesReply",
        }
    }

    /// Decode one received frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(frame)?)
    }
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    /// Initial capacity of fresh buffers.
    buffer_capacity: usize,
    /// Free-list bound; buffers beyond it are dropped instead of pooled.
    max_pooled: usize,
    created: AtomicUsize,
}

/// Free-list of reusable encode buffers, shared by all shards of an
/// engine.
#[derive(Clone)]
pub struct MessagePool {
    inner: Arc<PoolInner>,
}

impl MessagePool {
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                buffer_capacity,
                max_pooled,
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Encode a message into a pooled buffer.
    pub fn encode(&self, msg: &WireMessage) -> Result<PooledFrame> {
        let mut buf = {
            let mut free = self.inner.free.lock();
            free.pop()
        }
        .unwrap_or_else(|| {
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("skiff_pool_buffers_created").increment(1);
            Vec::with_capacity(self.inner.buffer_capacity)
        });
        buf.clear();
        bincode::serialize_into(&mut buf, msg)?;
        Ok(PooledFrame { buf: Some(buf), pool: self.inner.clone() })
    }

    /// Buffers ever allocated (pool misses).
    pub fn buffers_created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// Buffers currently idle in the pool.
    pub fn free_buffers(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// One encoded message. Dropping the last clone of the surrounding
/// `Arc<PooledFrame>` returns the buffer to the pool.
pub struct PooledFrame {
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl PooledFrame {
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl Drop for PooledFrame {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let mut free = self.pool.free.lock();
            if free.len() < self.pool.max_pooled {
                free.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> WireMessage {
        WireMessage::AppendEntries {
            term: 3,
            leader: 4,
            prev_log_index: 10,
            prev_log_term: 3,
            commit_index: 9,
            entries: vec![],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let pool = MessagePool::new(1024, 16);
        let msg = WireMessage::AppendEntries {
            term: 2,
            leader: 4,
            prev_log_index: 0,
            prev_log_term: 0,
            commit_index: 0,
            entries: vec![
                WireEntry { term: 2, data: Arc::new(b"alpha".to_vec()) },
                WireEntry { term: 2, data: Arc::new(vec![]) },
            ],
        };
        let frame = pool.encode(&msg).unwrap();
        match WireMessage::decode(frame.bytes()).unwrap() {
            WireMessage::AppendEntries { term, leader, entries, .. } => {
                assert_eq!(term, 2);
                assert_eq!(leader, 4);
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[0].data.as_slice(), b"alpha");
                assert!(entries[1].data.is_empty());
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn buffers_are_reused() {
        let pool = MessagePool::new(256, 16);
        let frame = pool.encode(&heartbeat()).unwrap();
        drop(frame);
        assert_eq!(pool.free_buffers(), 1);

        let _frame = pool.encode(&heartbeat()).unwrap();
        assert_eq!(pool.free_buffers(), 0);
        assert_eq!(pool.buffers_created(), 1);
    }

    #[test]
    fn refcounted_fan_out_returns_once() {
        let pool = MessagePool::new(256, 16);
        let frame = Arc::new(pool.encode(&heartbeat()).unwrap());
        let clones: Vec<_> = (0..4).map(|_| frame.clone()).collect();
        drop(frame);
        assert_eq!(pool.free_buffers(), 0);
        drop(clones);
        assert_eq!(pool.free_buffers(), 1);
    }

    #[test]
    fn pool_bound_is_respected() {
        let pool = MessagePool::new(64, 1);
        let a = pool.encode(&heartbeat()).unwrap();
        let b = pool.encode(&heartbeat()).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.free_buffers(), 1);
    }
}
