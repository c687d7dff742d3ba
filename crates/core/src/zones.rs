//! Per-zone run state.
//!
//! Local zones switch straight between `Off` and `Running`. Remote zones go
//! through `Starting` / `Stopping` until the owning station confirms with a
//! zone report; unconfirmed transitions fall back to `Off` after
//! [`CONFIRM_TIMEOUT_TICKS`] ticks.

use serde::Serialize;
use time::OffsetDateTime;

pub const CONFIRM_TIMEOUT_TICKS: u8 = 5;

/// One tick is one second.
pub const TICKS_PER_MINUTE: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ZoneState {
    Off,
    Starting { ticks_left: u8 },
    Running,
    Stopping { ticks_left: u8 },
}

impl ZoneState {
    /// On, or on its way on.
    pub fn is_on(self) -> bool {
        matches!(self, ZoneState::Starting { .. } | ZoneState::Running)
    }

    pub fn is_pending(self) -> bool {
        matches!(self, ZoneState::Starting { .. } | ZoneState::Stopping { .. })
    }
}

/// A request to water one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ZoneRun {
    pub zone: u8,
    pub minutes: u8,
    /// Schedule that asked for the run; `None` for manual runs.
    pub schedule: Option<u8>,
    /// Seasonal adjustment applied, percent.
    pub seasonal: u8,
    /// Weather adjustment applied, percent.
    pub weather: u8,
}

impl ZoneRun {
    pub fn manual(zone: u8, minutes: u8) -> Self {
        Self {
            zone,
            minutes,
            schedule: None,
            seasonal: 100,
            weather: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStatus {
    pub state: ZoneState,
    /// Ticks until the run ends; 0 when there is no countdown.
    pub remaining_ticks: u32,
    pub run: Option<ZoneRun>,
    pub started_at: Option<OffsetDateTime>,
}

impl Default for ZoneStatus {
    fn default() -> Self {
        Self {
            state: ZoneState::Off,
            remaining_ticks: 0,
            run: None,
            started_at: None,
        }
    }
}

/// Something that happened to a zone on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The station never confirmed; the zone is now `Off`.
    Unconfirmed { zone: u8, was: ZoneState },
    /// The run duration elapsed; the zone is now `Off`.
    Finished { zone: u8 },
}

#[derive(Debug, Clone)]
pub struct ZoneBoard {
    zones: Vec<ZoneStatus>,
    timeout: u8,
}

impl ZoneBoard {
    pub fn new(count: usize) -> Self {
        Self {
            zones: vec![ZoneStatus::default(); count],
            timeout: CONFIRM_TIMEOUT_TICKS,
        }
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Grow or shrink to match the configured zone count.
    pub fn resize(&mut self, count: usize) {
        self.zones.resize(count, ZoneStatus::default());
    }

    pub fn state(&self, zone: u8) -> ZoneState {
        self.zones
            .get(zone as usize)
            .map_or(ZoneState::Off, |z| z.state)
    }

    pub fn status(&self, zone: u8) -> Option<&ZoneStatus> {
        self.zones.get(zone as usize)
    }

    /// Zones that are on or starting.
    pub fn active(&self) -> impl Iterator<Item = u8> + '_ {
        self.zones
            .iter()
            .enumerate()
            .filter(|(_, z)| z.state.is_on())
            .map(|(i, _)| i as u8)
    }

    /// Start a run, overwriting whatever the zone was doing. `confirmed`
    /// runs go straight to `Running`.
    pub fn start(&mut self, run: ZoneRun, confirmed: bool, now: OffsetDateTime) {
        let timeout = self.timeout;
        let Some(z) = self.zones.get_mut(run.zone as usize) else {
            return;
        };
        z.state = if confirmed {
            ZoneState::Running
        } else {
            ZoneState::Starting {
                ticks_left: timeout,
            }
        };
        z.remaining_ticks = run.minutes as u32 * TICKS_PER_MINUTE;
        z.run = Some(run);
        z.started_at = Some(now);
    }

    /// Stop a zone. Unconfirmed stops go through `Stopping`; an `Off` zone
    /// stays `Off`.
    pub fn stop(&mut self, zone: u8, confirmed: bool) {
        let timeout = self.timeout;
        let Some(z) = self.zones.get_mut(zone as usize) else {
            return;
        };
        if confirmed || z.state == ZoneState::Off {
            *z = ZoneStatus::default();
        } else {
            z.state = ZoneState::Stopping {
                ticks_left: timeout,
            };
            z.remaining_ticks = 0;
        }
    }

    pub fn force_off(&mut self, zone: u8) {
        if let Some(z) = self.zones.get_mut(zone as usize) {
            *z = ZoneStatus::default();
        }
    }

    pub fn all_off(&mut self) {
        self.zones.fill(ZoneStatus::default());
    }

    /// Apply a station's report of one zone. Returns `true` when the state
    /// changed.
    pub fn confirm(&mut self, zone: u8, on: bool) -> bool {
        let Some(z) = self.zones.get_mut(zone as usize) else {
            return false;
        };
        let before = z.state;
        if on {
            z.state = ZoneState::Running;
        } else {
            *z = ZoneStatus::default();
        }
        z.state != before
    }

    /// Advance one tick: expire unconfirmed transitions and count down runs.
    pub fn tick(&mut self) -> Vec<Transition> {
        let mut out = Vec::new();
        for (i, z) in self.zones.iter_mut().enumerate() {
            let zone = i as u8;
            match z.state {
                ZoneState::Off => {}
                ZoneState::Starting { ticks_left } | ZoneState::Stopping { ticks_left } => {
                    if ticks_left > 1 {
                        z.state = match z.state {
                            ZoneState::Starting { .. } => ZoneState::Starting {
                                ticks_left: ticks_left - 1,
                            },
                            _ => ZoneState::Stopping {
                                ticks_left: ticks_left - 1,
                            },
                        };
                        z.remaining_ticks = z.remaining_ticks.saturating_sub(1);
                    } else {
                        out.push(Transition::Unconfirmed { zone, was: z.state });
                        *z = ZoneStatus::default();
                    }
                }
                ZoneState::Running => {
                    if z.remaining_ticks > 0 {
                        z.remaining_ticks -= 1;
                        if z.remaining_ticks == 0 {
                            out.push(Transition::Finished { zone });
                            *z = ZoneStatus::default();
                        }
                    }
                }
            }
        }
        out
    }
}
