//! Per-device presence state machine.
//!
//! Each successful poll hands a fresh [`DeviceSnapshot`] to
//! [`PresenceState::observe`], which compares it to the previous one and
//! returns the events it produced:
//!
//! ```text
//!              first snapshot
//!   (empty) ───────────────────► Watching ──┐ delta > 0: Updated
//!               (Initialized)     │    ▲ ◄──┘ (and Back if delta >= return)
//!                                 │    │
//!   delta <= 0 and gap >= silence │    │ delta > 0: Updated
//!                          (Gone) ▼    │ (and Back if delta >= return)
//!                                 Silent ──┐
//!                                   ▲ ◄────┘ delta <= 0: no event
//! ```
//!
//! Both alerts are edge triggered: `Gone` fires once per silent episode and
//! `Back` once per activity jump.

use mac_address::MacAddress;

use crate::config::TrackedDevice;
use crate::messages::{DeviceSnapshot, PresenceEvent, PresenceKind};

/// Alert thresholds in seconds; `0` disables the alert.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Thresholds {
    pub silence_seconds: u64,
    pub return_seconds: u64,
}

impl Thresholds {
    fn silence(self) -> Option<i64> {
        as_limit(self.silence_seconds)
    }

    fn back(self) -> Option<i64> {
        as_limit(self.return_seconds)
    }
}

fn as_limit(seconds: u64) -> Option<i64> {
    match seconds {
        0 => None,
        s => Some(i64::try_from(s).unwrap_or(i64::MAX)),
    }
}

#[derive(Debug)]
pub struct PresenceState {
    address: MacAddress,
    name: Option<String>,
    thresholds: Thresholds,
    previous: Option<DeviceSnapshot>,
    gone_alerted: bool,
}

impl PresenceState {
    pub fn new(device: &TrackedDevice) -> Self {
        PresenceState {
            address: device.address,
            name: device.name.clone(),
            thresholds: Thresholds {
                silence_seconds: device.silence_seconds,
                return_seconds: device.return_seconds,
            },
            previous: None,
            gone_alerted: false,
        }
    }

    #[cfg(test)]
    pub fn previous(&self) -> Option<&DeviceSnapshot> {
        self.previous.as_ref()
    }

    /// Feeds one successful snapshot taken at `now` (epoch seconds).
    pub fn observe(&mut self, current: DeviceSnapshot, now: i64) -> Vec<PresenceEvent> {
        let mut events = Vec::new();

        let Some(previous) = self.previous.as_ref() else {
            events.push(self.event(&current, PresenceKind::Initialized, None));
            self.previous = Some(current);
            return events;
        };

        let delta = current.last_seen - previous.last_seen;
        if delta <= 0 {
            if let Some(silence) = self.thresholds.silence() {
                let gap = now - current.last_seen;
                if !self.gone_alerted && gap >= silence {
                    self.gone_alerted = true;
                    events.push(self.event(&current, PresenceKind::Gone, Some(gap)));
                }
            }
        } else {
            self.gone_alerted = false;
            if self.thresholds.back().is_some_and(|back| delta >= back) {
                events.push(self.event(&current, PresenceKind::Back, Some(delta)));
            }
            events.push(self.event(&current, PresenceKind::Updated, Some(delta)));
        }

        self.previous = Some(current);
        events
    }

    fn event(
        &self,
        snapshot: &DeviceSnapshot,
        kind: PresenceKind,
        delta: Option<i64>,
    ) -> PresenceEvent {
        PresenceEvent {
            device: self
                .name
                .clone()
                .unwrap_or_else(|| snapshot.identity.clone()),
            address: self.address,
            kind,
            last_seen: snapshot.last_seen,
            delta,
        }
    }
}
