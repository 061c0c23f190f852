//! Manually advanced clock for tests.
//!
//! Time stands still until [`ManualClock::advance`] is called; sleepers
//! and tickers observe the same virtual timeline. All engine waits run
//! through this clock, so a test can step a whole cluster through
//! elections and timeouts deterministically fast.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::Clock;

struct TickerState {
    period: u64,
    next_fire: u64,
    tx: Sender<u64>,
}

struct Inner {
    now: u64,
    tickers: Vec<TickerState>,
}

/// Virtual time source, shared by cloning.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<Inner>>,
    moved: Arc<Condvar>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { now: 0, tickers: Vec::new() })),
            moved: Arc::new(Condvar::new()),
        }
    }

    /// Advance virtual time by `ms`, firing tickers and waking sleepers
    /// in timeline order.
    pub fn advance(&self, ms: u64) {
        let mut inner = self.inner.lock();
        let target = inner.now + ms;
        loop {
            // Earliest pending ticker fire at or before the target.
            let next = inner
                .tickers
                .iter()
                .map(|t| t.next_fire)
                .filter(|&t| t <= target)
                .min();
            match next {
                Some(fire_at) => {
                    inner.now = inner.now.max(fire_at);
                    let now = inner.now;
                    inner.tickers.retain_mut(|t| {
                        if t.next_fire <= now {
                            t.next_fire = now + t.period;
                            t.tx.send(now).is_ok()
                        } else {
                            true
                        }
                    });
                    self.moved.notify_all();
                }
                None => break,
            }
        }
        inner.now = target;
        self.moved.notify_all();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.inner.lock().now
    }

    fn sleep(&self, ms: u64) {
        let mut inner = self.inner.lock();
        let deadline = inner.now + ms;
        while inner.now < deadline {
            self.moved.wait(&mut inner);
        }
    }

    fn ticker(&self, period_ms: u64) -> Receiver<u64> {
        let (tx, rx) = unbounded();
        let mut inner = self.inner.lock();
        let next_fire = inner.now + period_ms.max(1);
        inner.tickers.push(TickerState { period: period_ms.max(1), next_fire, tx });
        rx
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::clock::Clock;

    #[test]
    fn advance_moves_time() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), 0);
        clock.advance(120);
        assert_eq!(clock.now(), 120);
    }

    #[test]
    fn ticker_fires_per_period() {
        let clock = ManualClock::new();
        let ticks = clock.ticker(50);
        clock.advance(175);
        assert_eq!(ticks.try_recv().unwrap(), 50);
        assert_eq!(ticks.try_recv().unwrap(), 100);
        assert_eq!(ticks.try_recv().unwrap(), 150);
        assert!(ticks.try_recv().is_err());
    }

    #[test]
    fn sleeper_wakes_on_advance() {
        let clock = ManualClock::new();
        let sleeper = clock.clone();
        let handle = thread::spawn(move || {
            sleeper.sleep(100);
            sleeper.now()
        });
        // Give the sleeper a moment to park, then release it.
        thread::sleep(std::time::Duration::from_millis(20));
        clock.advance(100);
        assert_eq!(handle.join().unwrap(), 100);
    }

    #[test]
    fn dropped_ticker_is_pruned() {
        let clock = ManualClock::new();
        let ticks = clock.ticker(10);
        drop(ticks);
        clock.advance(50);
        assert!(clock.inner.lock().tickers.is_empty());
    }
}
