use mac_address::MacAddress;

/// A point-in-time read of a device's visibility upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Epoch seconds of the last frame the monitor saw from the device.
    pub last_seen: i64,
    pub identity: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresenceKind {
    /// First successful read after the tracker started.
    Initialized,
    /// The device produced new activity.
    Updated,
    /// No new activity for at least the silence threshold.
    Gone,
    /// New activity after an absence of at least the return threshold.
    Back,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceEvent {
    pub device: String,
    pub address: MacAddress,
    pub kind: PresenceKind,
    pub last_seen: i64,
    /// Seconds between the two observations that produced the event; for
    /// `Gone` this is the silence measured against the wall clock.
    pub delta: Option<i64>,
}

impl PresenceEvent {
    /// Whether the device should be considered present after this event.
    pub fn is_present(&self) -> bool {
        !matches!(self.kind, PresenceKind::Gone)
    }

    /// Transitions worth interrupting the user for.
    pub fn is_alert(&self) -> bool {
        matches!(self.kind, PresenceKind::Gone | PresenceKind::Back)
    }
}
