//! In-process loopback network.
//!
//! All engines sharing one hub instance (typically one per process, or
//! one per test cluster) exchange frames through unbounded in-memory
//! queues. Frames are never lost or reordered, so the reconnect path of
//! the peer machinery stays idle here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{Channel, Network};
use crate::error::{Result, SkiffError};
use crate::types::MemberId;

#[derive(Clone)]
struct Link {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

#[derive(Default)]
struct Hub {
    /// Directed frame queues, keyed by (sender, receiver).
    links: Mutex<HashMap<(MemberId, MemberId), Link>>,
    /// Connect-request listeners, keyed by local member.
    acceptors: Mutex<HashMap<MemberId, Sender<MemberId>>>,
}

impl Hub {
    fn link(&self, from: MemberId, to: MemberId) -> Link {
        let mut links = self.links.lock();
        links
            .entry((from, to))
            .or_insert_with(|| {
                let (tx, rx) = unbounded();
                Link { tx, rx }
            })
            .clone()
    }
}

/// Shared-hub [`Network`] implementation.
///
/// Several engines can talk over one hub; each engine holds its own
/// handle (see [`MemoryNetwork::handle`]) so that stopping one engine's
/// network does not tear down its neighbours.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
    /// Members whose acceptors were registered through this handle.
    registered: Arc<Mutex<Vec<MemberId>>>,
}

impl MemoryNetwork {
    /// A fresh, isolated hub (one test cluster).
    pub fn new() -> Self {
        Self { hub: Arc::new(Hub::default()), registered: Arc::new(Mutex::new(Vec::new())) }
    }

    /// A new handle onto the same hub with an independent lifecycle.
    pub fn handle(&self) -> Self {
        Self { hub: self.hub.clone(), registered: Arc::new(Mutex::new(Vec::new())) }
    }

    /// A handle onto the process-wide hub, used when the network is
    /// selected by config name. All engines in the process see each
    /// other.
    pub fn process_shared() -> Self {
        static SHARED: OnceLock<MemoryNetwork> = OnceLock::new();
        SHARED.get_or_init(MemoryNetwork::new).handle()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Network for MemoryNetwork {
    fn create_channel(&self, from: MemberId, to: MemberId) -> Result<Box<dyn Channel>> {
        let outgoing = self.hub.link(from, to);
        let incoming = self.hub.link(to, from);

        // Tell the remote someone dialed it; known peers ignore this.
        if let Some(acceptor) = self.hub.acceptors.lock().get(&to) {
            let _ = acceptor.send(from);
        }

        Ok(Box::new(MemoryChannel {
            outgoing,
            incoming,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn connect_requests(&self, local: MemberId) -> Receiver<MemberId> {
        let (tx, rx) = unbounded();
        self.hub.acceptors.lock().insert(local, tx);
        self.registered.lock().push(local);
        rx
    }

    fn stop(&self) {
        // Channels close with their peers; a handle only owns its
        // acceptor registrations. The hub outlives any one engine.
        let mut acceptors = self.hub.acceptors.lock();
        for member in self.registered.lock().drain(..) {
            acceptors.remove(&member);
        }
    }
}

struct MemoryChannel {
    outgoing: Link,
    incoming: Link,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Channel for MemoryChannel {
    fn send(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(SkiffError::ChannelClosed);
        }
        self.outgoing
            .tx
            .send(frame.to_vec())
            .map_err(|_| SkiffError::ChannelClosed)
    }

    fn recv_timeout(&self, timeout_ms: u64) -> Result<Option<Vec<u8>>> {
        if self.is_closed() {
            return Err(SkiffError::ChannelClosed);
        }
        match self.incoming.rx.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SkiffError::ChannelClosed),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_flow_both_ways_in_order() {
        let network = MemoryNetwork::new();
        let a = network.create_channel(4, 5).unwrap();
        let b = network.create_channel(5, 4).unwrap();

        a.send(b"one").unwrap();
        a.send(b"two").unwrap();
        b.send(b"ack").unwrap();

        assert_eq!(b.recv_timeout(100).unwrap().unwrap(), b"one");
        assert_eq!(b.recv_timeout(100).unwrap().unwrap(), b"two");
        assert_eq!(a.recv_timeout(100).unwrap().unwrap(), b"ack");
        assert_eq!(a.recv_timeout(1).unwrap(), None);
    }

    #[test]
    fn connect_request_surfaces_unknown_dialer() {
        let network = MemoryNetwork::new();
        let requests = network.connect_requests(4);
        let _slave_side = network.create_channel(31, 4).unwrap();
        assert_eq!(requests.recv_timeout(Duration::from_secs(1)).unwrap(), 31);
    }

    #[test]
    fn closed_channel_fails() {
        let network = MemoryNetwork::new();
        let a = network.create_channel(4, 5).unwrap();
        a.close();
        assert!(a.send(b"x").is_err());
        assert!(a.recv_timeout(1).is_err());
    }

    #[test]
    fn stop_releases_only_this_handles_acceptors() {
        let hub = MemoryNetwork::new();
        let engine_a = hub.handle();
        let engine_b = hub.handle();
        let _a_requests = engine_a.connect_requests(4);
        let b_requests = engine_b.connect_requests(5);

        engine_a.stop();
        assert!(hub.hub.acceptors.lock().get(&4).is_none());

        // The other engine keeps accepting.
        let _dialer = engine_b.create_channel(9, 5).unwrap();
        assert_eq!(b_requests.recv_timeout(Duration::from_secs(1)).unwrap(), 9);
    }
}
