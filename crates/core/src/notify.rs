use std::collections::VecDeque;

use serde::Serialize;
use time::OffsetDateTime;

use crate::store::SensorKind;
use crate::zones::ZoneRun;

/// Maximum number of notifications retained in the ring buffer.
pub const MAX_EVENTS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Explicit stop or end of a schedule.
    Commanded,
    /// Run duration elapsed.
    Finished,
    /// Station never confirmed the change.
    Unconfirmed,
    /// Station reported the zone off.
    Reported,
    /// Owning station was disabled or invalid when acted on.
    StationDisabled,
    /// Station answered the command with an error.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    ZoneStarted {
        #[serde(flatten)]
        run: ZoneRun,
    },
    ZoneStopped {
        zone: u8,
        reason: StopReason,
    },
    SensorReading {
        station: u8,
        channel: u8,
        sensor: Option<SensorKind>,
        value: u16,
    },
    Error {
        detail: String,
    },
    System {
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(flatten)]
    pub event: Event,
}

/// Bounded history of notifications plus the ones not yet handed to a
/// publisher.
#[derive(Debug, Default)]
pub struct EventLog {
    events: VecDeque<Notification>,
    pending: Vec<Notification>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, ts: OffsetDateTime, event: Event) {
        let n = Notification { ts, event };
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(n.clone());
        if self.pending.len() >= MAX_EVENTS {
            self.pending.remove(0);
        }
        self.pending.push(n);
    }

    /// Newest first.
    pub fn recent(&self) -> impl Iterator<Item = &Notification> {
        self.events.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Notifications recorded since the last call, oldest first.
    pub fn take_pending(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.pending)
    }
}
