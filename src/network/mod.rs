//! Byte transport between member pairs.
//!
//! The engine only assumes reliable FIFO framed channels while a
//! connection lasts; loss around reconnects is repaired by the
//! append-entries protocol, never by the transport. Besides explicit
//! channel creation, a [`Network`] surfaces *connect requests*: the ids
//! of remote members that opened a channel toward a local member. A
//! leader uses these to notice slaves from foreign shards attaching to
//! it; requests for already-connected shard peers are simply ignored.

use crossbeam_channel::Receiver;

use crate::error::Result;
use crate::types::MemberId;

mod memory;

pub use memory::MemoryNetwork;

/// A reliable framed byte channel to one remote member.
pub trait Channel: Send + Sync {
    /// Queue one frame for transmission. Fails once the channel or the
    /// network is closed.
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Receive the next frame, waiting at most `timeout_ms`. Returns
    /// `Ok(None)` on timeout and `Err(ChannelClosed)` once the channel
    /// is down.
    fn recv_timeout(&self, timeout_ms: u64) -> Result<Option<Vec<u8>>>;

    /// Tear the channel down; concurrent and subsequent calls fail.
    fn close(&self);
}

/// Factory for channels between the local host's members and remotes.
pub trait Network: Send + Sync {
    /// Open (or re-open) the channel `from → to`. `from` must be a
    /// member hosted by this process.
    fn create_channel(&self, from: MemberId, to: MemberId) -> Result<Box<dyn Channel>>;

    /// Connect requests addressed to `local`: each received id is a
    /// remote member that opened a channel toward `local`.
    fn connect_requests(&self, local: MemberId) -> Receiver<MemberId>;

    /// Release transport resources owned by this handle (listeners,
    /// acceptor registrations). Channels are closed by their owners.
    fn stop(&self);
}
