//! The replication core: per-member Raft state machine, peers, durable
//! save queue and the command pipeline.
//!
//! All role and term transitions for one member are serialized on that
//! member's main-loop thread; peers and save-queue workers communicate
//! with it exclusively through bounded queues and shared atomics.

// unwrap() panics on these threads would take consensus down with them.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub(crate) mod command;
pub(crate) mod member;
pub(crate) mod peer;
pub(crate) mod save_queue;

pub use command::{Command, CommandStatus};
