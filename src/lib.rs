//! skiff — a Raft-based replicated-log engine.
//!
//! A fixed group of processes agrees on an ordered sequence of opaque
//! commands. One process hosts one [`Engine`]; an engine hosts one
//! member of each [`Shard`] (replication group) placed on it by the
//! config, and all shards share the engine's clock, network, storage
//! and message pool. Applications check a [`Command`] out of a shard,
//! commit bytes through it (blocking until the entry is durable on a
//! quorum) and read committed entries back by index from any member.
//!
//! # Committing a command
//!
//! ```no_run
//! use skiff::{Config, Engine};
//!
//! # fn main() -> skiff::Result<()> {
//! let config = Config::from_file(std::path::Path::new("skiff.json"))?;
//! let engine = Engine::new(config, "host-a")?;
//! engine.start()?;
//!
//! let shard = engine.shard("shard1").unwrap();
//! let mut command = shard.checkout_command();
//! // Blocks until the bytes are committed on a quorum.
//! command.commit(b"some data", None)?;
//! command.release();
//! # Ok(())
//! # }
//! ```
//!
//! # Reading a committed command
//!
//! ```no_run
//! # use skiff::{Config, Engine};
//! # fn main() -> skiff::Result<()> {
//! # let engine = Engine::new(Config::development(), "dev")?;
//! # engine.start()?;
//! # let shard = engine.shard("shard1").unwrap();
//! // Blocks until index 500 is committed, up to 5 seconds.
//! let command = shard.committed_command(500, Some(5000))?;
//! println!("{}", command.as_string());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Engine: lifecycle, role-change fan-out                    │
//! ├───────────────────────────────────────────────────────────┤
//! │ Shard: command API ─ CoreMember: raft state machine       │
//! │        Peers: send/receive/backfill ─ SaveQueue: fsync    │
//! ├───────────────────────────────────────────────────────────┤
//! │ Substrate: Storage | Network | Clock | MessagePool        │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The concurrency model is plain OS threads with bounded blocking
//! queues: one main thread per member, two threads per peer, a crew of
//! save-queue workers and one notifier thread. Blocking on a full
//! queue is the flow control.

pub mod clock;
pub mod config;
mod core;
mod engine;
pub mod error;
mod message;
pub mod network;
pub mod observability;
mod shard;
pub mod storage;
pub mod types;

pub use config::Config;
pub use crate::core::{Command, CommandStatus};
pub use engine::{Engine, EngineBuilder, PluginRegistry, RoleListener, RoleListenerId};
pub use error::{Result, SkiffError};
pub use message::{MessagePool, WireEntry, WireMessage};
pub use shard::{Member, Shard};
pub use types::{LogEntry, LogIndex, MemberId, Role, RoleChangeEvent, SlaveStatus, Term};
