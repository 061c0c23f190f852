//! In-memory storage, for tests and single-process experiments.
//!
//! Member ids are cluster-unique, so one instance can back several
//! engines in the same process; tests use that to pre-populate a
//! member's log before starting its engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use super::Storage;
use crate::error::{Result, SkiffError};
use crate::types::{LogEntry, LogIndex, MemberId, Term};

#[derive(Debug, Default)]
struct MemberStore {
    term: Term,
    voted_for: Option<MemberId>,
    max_gap: u32,
    entries: BTreeMap<LogIndex, (Term, Arc<Vec<u8>>)>,
}

/// Volatile [`Storage`] implementation.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    members: Mutex<HashMap<MemberId, MemberStore>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_member<T>(&self, member: MemberId, f: impl FnOnce(&mut MemberStore) -> T) -> T {
        let mut members = self.members.lock();
        f(members.entry(member).or_default())
    }
}

impl Storage for MemoryStorage {
    fn save_vote(&self, member: MemberId, term: Term, voted_for: Option<MemberId>) -> Result<()> {
        self.with_member(member, |m| {
            m.term = term;
            m.voted_for = voted_for;
        });
        Ok(())
    }

    fn vote(&self, member: MemberId) -> Result<(Term, Option<MemberId>)> {
        Ok(self.with_member(member, |m| (m.term, m.voted_for)))
    }

    fn has_log_entry(&self, member: MemberId, index: LogIndex, term: Term) -> Result<bool> {
        Ok(self.with_member(member, |m| {
            m.entries.get(&index).map(|(t, _)| *t == term).unwrap_or(false)
        }))
    }

    fn log_entry(&self, member: MemberId, index: LogIndex) -> Result<Option<LogEntry>> {
        Ok(self.with_member(member, |m| {
            m.entries
                .get(&index)
                .map(|(term, data)| LogEntry::with_arc_data(*term, index, data.clone()))
        }))
    }

    fn last_log_index(&self, member: MemberId) -> Result<LogIndex> {
        Ok(self.with_member(member, |m| m.entries.keys().next_back().copied().unwrap_or(0)))
    }

    fn last_log_term(&self, member: MemberId) -> Result<Term> {
        Ok(self.with_member(member, |m| {
            m.entries.values().next_back().map(|(t, _)| *t).unwrap_or(0)
        }))
    }

    fn append_log_entry(&self, member: MemberId, entry: &LogEntry) -> Result<()> {
        if entry.index == 0 {
            return Err(SkiffError::InvalidIndex(0));
        }
        self.with_member(member, |m| {
            if let Some((existing, _)) = m.entries.get(&entry.index) {
                if *existing != entry.term {
                    return Err(SkiffError::Storage(format!(
                        "append at index {} term {} conflicts with stored term {}; delete first",
                        entry.index, entry.term, existing
                    )));
                }
            }
            m.entries.insert(entry.index, (entry.term, entry.data.clone()));
            Ok(())
        })
    }

    fn delete_from(&self, member: MemberId, from: LogIndex) -> Result<()> {
        self.with_member(member, |m| {
            m.entries.split_off(&from);
        });
        Ok(())
    }

    fn set_max_gap(&self, member: MemberId, gap: u32) -> Result<()> {
        self.with_member(member, |m| m.max_gap = gap);
        Ok(())
    }

    fn max_gap(&self, member: MemberId) -> Result<u32> {
        Ok(self.with_member(member, |m| m.max_gap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.vote(4).unwrap(), (0, None));
        storage.save_vote(4, 5, Some(6)).unwrap();
        assert_eq!(storage.vote(4).unwrap(), (5, Some(6)));
    }

    #[test]
    fn tail_tracking() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.last_log_index(4).unwrap(), 0);
        assert_eq!(storage.last_log_term(4).unwrap(), 0);

        storage.append_log_entry(4, &LogEntry::new(1, 1, b"a".to_vec())).unwrap();
        storage.append_log_entry(4, &LogEntry::new(2, 2, b"b".to_vec())).unwrap();
        assert_eq!(storage.last_log_index(4).unwrap(), 2);
        assert_eq!(storage.last_log_term(4).unwrap(), 2);
    }

    #[test]
    fn conflicting_append_requires_delete() {
        let storage = MemoryStorage::new();
        storage.append_log_entry(4, &LogEntry::new(1, 1, b"a".to_vec())).unwrap();
        // Same (index, term) is an idempotent rewrite.
        storage.append_log_entry(4, &LogEntry::new(1, 1, b"a".to_vec())).unwrap();
        // Different term must be preceded by a delete.
        assert!(storage.append_log_entry(4, &LogEntry::new(2, 1, b"x".to_vec())).is_err());
        storage.delete_from(4, 1).unwrap();
        storage.append_log_entry(4, &LogEntry::new(2, 1, b"x".to_vec())).unwrap();
        assert!(storage.has_log_entry(4, 1, 2).unwrap());
    }

    #[test]
    fn index_zero_never_exists() {
        let storage = MemoryStorage::new();
        assert!(!storage.has_log_entry(4, 0, 1).unwrap());
        assert!(storage.log_entry(4, 1).unwrap().is_none());
    }

    #[test]
    fn max_gap_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.max_gap(4).unwrap(), 0);
        storage.set_max_gap(4, 99).unwrap();
        assert_eq!(storage.max_gap(4).unwrap(), 99);
    }

    #[test]
    fn members_are_independent() {
        let storage = MemoryStorage::new();
        storage.append_log_entry(4, &LogEntry::new(1, 1, b"a".to_vec())).unwrap();
        assert_eq!(storage.last_log_index(5).unwrap(), 0);
    }
}
