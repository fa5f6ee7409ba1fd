use std::time::Duration;

use log::{debug, error, trace, warn};
use mac_address::MacAddress;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ErrorPolicy, TrackedDevice};
use crate::kismet::{FetchError, SnapshotFetcher};
use crate::messages::PresenceEvent;
use crate::presence::PresenceState;

/// Why a tracker stopped polling.
#[derive(Debug)]
pub enum TrackerExit {
    Cancelled,
    Fatal(FetchError),
}

/// Drives one device's [`PresenceState`]: fetch, evaluate, sleep.
pub struct Tracker {
    label: String,
    address: MacAddress,
    state: PresenceState,
    poll_interval: Duration,
    policy: ErrorPolicy,
    clock: fn() -> i64,
}

fn wall_clock() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Tracker {
    pub fn new(device: &TrackedDevice, poll_interval: Duration, policy: ErrorPolicy) -> Self {
        Tracker {
            label: device.label(),
            address: device.address,
            state: PresenceState::new(device),
            poll_interval,
            policy,
            clock: wall_clock,
        }
    }

    /// Replaces the wall clock used to measure silence.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn is_fatal(&self, err: &FetchError) -> bool {
        matches!(err, FetchError::Malformed(_)) && self.policy.malformed_is_fatal
    }

    /// Polls until `cancel` fires or a fetch error is classified fatal.
    ///
    /// The in-flight fetch, a send blocked on a full event channel and the
    /// sleep between polls are all abandoned as soon as the token is cancelled.
    pub async fn run<F: SnapshotFetcher>(
        mut self,
        fetcher: &F,
        events: mpsc::Sender<PresenceEvent>,
        cancel: CancellationToken,
    ) -> TrackerExit {
        debug!("Tracking {} ({})", self.label, self.address);

        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return TrackerExit::Cancelled,
                result = fetcher.fetch(&self.address) => result,
            };

            match result {
                Ok(snapshot) => {
                    debug!("{}: last seen {}", self.label, snapshot.last_seen);
                    for event in self.state.observe(snapshot, (self.clock)()) {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => return TrackerExit::Cancelled,
                            sent = events.send(event) => if sent.is_err() {
                                trace!("{}: no event receiver", self.label);
                            },
                        }
                    }
                }
                Err(FetchError::NotFound) => {
                    trace!("{}: no record yet", self.label);
                }
                Err(err) if self.is_fatal(&err) => {
                    error!("{}: giving up: {}", self.label, err);
                    return TrackerExit::Fatal(err);
                }
                Err(err) => {
                    warn!("{}: {}", self.label, err);
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return TrackerExit::Cancelled,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
