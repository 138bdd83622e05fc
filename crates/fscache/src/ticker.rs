//! The Ticker: one tick per period, cycling 0..60, never blocking on the receiver.

use std::fmt;
use std::time::Duration;

use fscache_worker::CancellationToken;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const TICKS_PER_CYCLE: u8 = 60;

/// Second within the minute, always in `0..60`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tick(u8);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    pub fn new(second: u8) -> Option<Self> {
        (second < TICKS_PER_CYCLE).then_some(Tick(second))
    }

    pub fn second(self) -> u8 {
        self.0
    }

    /// The following tick, wrapping 59 -> 0.
    pub fn next(self) -> Self {
        Tick((self.0 + 1) % TICKS_PER_CYCLE)
    }

    /// All ticks of one cycle, starting at 0.
    pub fn cycle() -> impl Iterator<Item = Tick> {
        (0..TICKS_PER_CYCLE).map(Tick)
    }
}

impl fmt::Debug for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tick({})", self.0)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Emits [`Tick`]s over a bounded channel, starting at 0.
///
/// When the channel is full the tick is dropped with a warning; the counter
/// still advances so ticks keep tracking wall-clock seconds.
pub struct Ticker {
    period: Duration,
    next: Tick,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Tick::ZERO,
        }
    }

    /// Run on a background task until `shutdown` fires or the receiver is gone.
    ///
    /// The task resolves to the number of dropped ticks.
    pub fn spawn(self, tx: mpsc::Sender<Tick>, shutdown: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(tx, shutdown))
    }

    pub async fn run(mut self, tx: mpsc::Sender<Tick>, shutdown: CancellationToken) -> u64 {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dropped = 0u64;

        info!("Ticker started (period {:?})", self.period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let tick = self.next;
            self.next = tick.next();

            match tx.try_send(tick) {
                Ok(()) => debug!("Tick {}", tick),
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    warn!("Dispatcher busy, dropped tick {}", tick);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Tick receiver closed");
                    break;
                }
            }
        }

        info!("Ticker stopped ({} ticks dropped)", dropped);
        dropped
    }
}
