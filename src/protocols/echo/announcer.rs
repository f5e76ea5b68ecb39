//! Periodic liveness announcements for a single connection.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// The literal written to the client on every tick.
pub const ALIVE_MESSAGE: &[u8] = b"alive\n";

/// Offers `alive\n` to the owning handler once per interval.
///
/// The announcer never touches the socket. The handler is the only writer
/// of its connection and drains the channel between echo writes.
pub struct AliveAnnouncer {
    interval: Duration,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl AliveAnnouncer {
    pub fn new(interval: Duration, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Self {
        Self {
            interval,
            tx,
            cancel,
        }
    }

    /// Run until cancelled or until the handler drops its receiver.
    pub async fn run(self) {
        // First announcement after one full interval, not at start.
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let message = Bytes::from_static(ALIVE_MESSAGE);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("exiting due to cancelled context");
                    return;
                }
                _ = ticker.tick() => {
                    trace!("writing alive");
                    match self.tx.try_send(message.clone()) {
                        Ok(()) => {}
                        // Previous announcement still queued; skip this one
                        Err(TrySendError::Full(_)) => trace!("alive announcement still pending"),
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
            }
        }
    }
}
