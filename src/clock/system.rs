//! Wall-clock implementation backed by `std::time::Instant`.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};

use super::Clock;

/// Real time. One instance per engine; `now` is measured from creation.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn sleep(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn ticker(&self, period_ms: u64) -> Receiver<u64> {
        let (tx, rx) = bounded(1);
        let epoch = self.epoch;
        let period = Duration::from_millis(period_ms.max(1));
        thread::Builder::new()
            .name(format!("ticker-{}ms", period_ms))
            .spawn(move || loop {
                thread::sleep(period);
                let now = epoch.elapsed().as_millis() as u64;
                // Exit once the consumer is gone.
                if tx.send(now).is_err() {
                    return;
                }
            })
            .expect("spawn ticker thread");
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_advances() {
        let clock = SystemClock::new();
        let before = clock.now();
        clock.sleep(5);
        assert!(clock.now() >= before + 4);
    }

    #[test]
    fn ticker_fires() {
        let clock = SystemClock::new();
        let ticks = clock.ticker(1);
        assert!(ticks.recv_timeout(std::time::Duration::from_secs(2)).is_ok());
    }
}
