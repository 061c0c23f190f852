//! Durable log and vote storage.
//!
//! One [`Storage`] instance serves every member hosted by the process;
//! all calls are keyed by member id and independent across members.
//! Implementations must be thread-safe: save-queue workers append
//! concurrently (targeting distinct indices — ordering is the save
//! queue's job, not storage's), while reader threads fetch committed
//! entries.

use crate::error::Result;
use crate::types::{LogEntry, LogIndex, MemberId, Term};

mod memory;
mod rocks;

pub use memory::MemoryStorage;
pub use rocks::RocksStorage;

/// Durable, per-member, append-mostly log with O(1) tail access plus a
/// persisted vote and a persisted max-gap hint.
pub trait Storage: Send + Sync {
    /// Atomically persist the member's term and vote. Durable before
    /// return; an affirmative vote reply must never precede this.
    fn save_vote(&self, member: MemberId, term: Term, voted_for: Option<MemberId>) -> Result<()>;

    /// The persisted `(term, voted_for)`, `(0, None)` if never saved.
    fn vote(&self, member: MemberId) -> Result<(Term, Option<MemberId>)>;

    /// True iff an entry with exactly this `(index, term)` exists.
    /// Index 0 never exists (the sentinel is implicit).
    fn has_log_entry(&self, member: MemberId, index: LogIndex, term: Term) -> Result<bool>;

    /// Fetch one entry by index.
    fn log_entry(&self, member: MemberId, index: LogIndex) -> Result<Option<LogEntry>>;

    /// Index of the durable tail, 0 when the log is empty.
    fn last_log_index(&self, member: MemberId) -> Result<LogIndex>;

    /// Term of the durable tail, 0 when the log is empty.
    fn last_log_term(&self, member: MemberId) -> Result<Term>;

    /// Persist one entry. Appends may arrive out of order within the
    /// save queue's in-flight window and may repeat an existing
    /// `(index, term)` (idempotent), but overwriting an index with a
    /// different term is rejected — callers must [`Storage::delete_from`]
    /// the conflicting suffix first.
    fn append_log_entry(&self, member: MemberId, entry: &LogEntry) -> Result<()>;

    /// Truncate the suffix `>= from`.
    fn delete_from(&self, member: MemberId, from: LogIndex) -> Result<()>;

    /// Persist the maximum in-flight gap observed between the in-memory
    /// tail and the durable tail. Consulted on restart to bound the
    /// tail-repair scan.
    fn set_max_gap(&self, member: MemberId, gap: u32) -> Result<()>;

    /// The persisted max-gap hint, 0 if never saved.
    fn max_gap(&self, member: MemberId) -> Result<u32>;
}
