//! RocksDB-backed storage.
//!
//! Log entries are keyed by member id plus a big-endian index suffix so
//! a forward iterator walks the log in order and a reverse seek lands
//! on the durable tail. Entries and vote records are bincode-encoded.

use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};

use super::Storage;
use crate::error::{Result, SkiffError};
use crate::types::{LogEntry, LogIndex, MemberId, Term};

const VOTE_PREFIX: &[u8] = b"vote_";
const GAP_PREFIX: &[u8] = b"gap_";
const LOG_PREFIX: &[u8] = b"log_";

/// Durable [`Storage`] implementation over a single RocksDB database.
pub struct RocksStorage {
    db: DB,
}

impl RocksStorage {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    fn vote_key(member: MemberId) -> Vec<u8> {
        let mut key = VOTE_PREFIX.to_vec();
        key.extend_from_slice(&member.to_be_bytes());
        key
    }

    fn gap_key(member: MemberId) -> Vec<u8> {
        let mut key = GAP_PREFIX.to_vec();
        key.extend_from_slice(&member.to_be_bytes());
        key
    }

    fn log_prefix(member: MemberId) -> Vec<u8> {
        let mut key = LOG_PREFIX.to_vec();
        key.extend_from_slice(&member.to_be_bytes());
        key.push(b'_');
        key
    }

    fn log_key(member: MemberId, index: LogIndex) -> Vec<u8> {
        let mut key = Self::log_prefix(member);
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    /// The entry at the durable tail, if the log is non-empty.
    fn tail_entry(&self, member: MemberId) -> Result<Option<LogEntry>> {
        let prefix = Self::log_prefix(member);
        let mut upper = prefix.clone();
        upper.extend_from_slice(&LogIndex::MAX.to_be_bytes());
        let mut iter = self.db.iterator(IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    return Ok(None);
                }
                Ok(Some(bincode::deserialize(&value)?))
            }
            None => Ok(None),
        }
    }
}

impl Storage for RocksStorage {
    fn save_vote(&self, member: MemberId, term: Term, voted_for: Option<MemberId>) -> Result<()> {
        let value = bincode::serialize(&(term, voted_for))?;
        self.db.put(Self::vote_key(member), value)?;
        self.db.flush()?;
        Ok(())
    }

    fn vote(&self, member: MemberId) -> Result<(Term, Option<MemberId>)> {
        match self.db.get(Self::vote_key(member))? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok((0, None)),
        }
    }

    fn has_log_entry(&self, member: MemberId, index: LogIndex, term: Term) -> Result<bool> {
        if index == 0 {
            return Ok(false);
        }
        match self.db.get(Self::log_key(member, index))? {
            Some(value) => {
                let entry: LogEntry = bincode::deserialize(&value)?;
                Ok(entry.term == term)
            }
            None => Ok(false),
        }
    }

    fn log_entry(&self, member: MemberId, index: LogIndex) -> Result<Option<LogEntry>> {
        match self.db.get(Self::log_key(member, index))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn last_log_index(&self, member: MemberId) -> Result<LogIndex> {
        Ok(self.tail_entry(member)?.map(|e| e.index).unwrap_or(0))
    }

    fn last_log_term(&self, member: MemberId) -> Result<Term> {
        Ok(self.tail_entry(member)?.map(|e| e.term).unwrap_or(0))
    }

    fn append_log_entry(&self, member: MemberId, entry: &LogEntry) -> Result<()> {
        if entry.index == 0 {
            return Err(SkiffError::InvalidIndex(0));
        }
        let key = Self::log_key(member, entry.index);
        if let Some(existing) = self.db.get(&key)? {
            let existing: LogEntry = bincode::deserialize(&existing)?;
            if existing.term != entry.term {
                return Err(SkiffError::Storage(format!(
                    "append at index {} term {} conflicts with stored term {}; delete first",
                    entry.index, entry.term, existing.term
                )));
            }
        }
        self.db.put(key, bincode::serialize(entry)?)?;
        Ok(())
    }

    fn delete_from(&self, member: MemberId, from: LogIndex) -> Result<()> {
        let prefix = Self::log_prefix(member);
        let start = Self::log_key(member, from);
        let mut batch = WriteBatch::default();
        let iter = self.db.iterator(IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete(&key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn set_max_gap(&self, member: MemberId, gap: u32) -> Result<()> {
        self.db.put(Self::gap_key(member), gap.to_be_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn max_gap(&self, member: MemberId) -> Result<u32> {
        match self.db.get(Self::gap_key(member))? {
            Some(value) => {
                let bytes: [u8; 4] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| SkiffError::Storage("invalid max-gap record".into()))?;
                Ok(u32::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }
}
