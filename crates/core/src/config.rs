//! TOML config file loading and validation for stations, zones, sensors and
//! schedules.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use time::UtcOffset;

use crate::codec::BROADCAST_UNIT;
use crate::scheduler::{Recurrence, Schedule, MAX_SCHEDULES, MAX_START_TIMES};
use crate::store::{MemoryStore, NetworkKind, SensorConfig, SensorKind, StationConfig};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    /// This controller's unit id.
    pub station_id: u8,
    #[serde(default = "default_max_run_duration")]
    pub max_run_duration: u8,
    /// Percent applied to weather-adjusted schedules.
    #[serde(default = "default_percent")]
    pub seasonal_adjust: u8,
    #[serde(default = "default_true")]
    pub schedules_enabled: bool,
    /// Local time offset from UTC, minutes.
    #[serde(default)]
    pub utc_offset_min: i16,
    #[serde(default)]
    pub stations: Vec<StationEntry>,
    /// Per-zone overrides. Zones not listed are enabled with default names.
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StationEntry {
    pub id: u8,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub remote_status: bool,
    #[serde(default = "default_true")]
    pub remote_control: bool,
    pub network: NetworkKind,
    #[serde(default)]
    pub network_address: u16,
    pub zone_count: u8,
    #[serde(default)]
    pub first_zone: u8,
}

#[derive(Debug, Deserialize)]
pub struct ZoneEntry {
    pub station: u8,
    pub channel: u8,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub valve_gpio_pin: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub kind: SensorKind,
    pub station: u8,
    pub channel: u8,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Three-letter day names ("mon", "tue", ...).
    #[serde(default)]
    pub days: Vec<String>,
    /// Run every n days instead of on fixed weekdays.
    #[serde(default)]
    pub interval: Option<u8>,
    /// "HH:MM", local time.
    pub start_times: Vec<String>,
    /// Minutes per zone, indexed by global zone number.
    pub durations: Vec<u8>,
    #[serde(default)]
    pub weather_adjust: bool,
}

fn default_true() -> bool {
    true
}

fn default_percent() -> u8 {
    100
}

fn default_max_run_duration() -> u8 {
    99
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

const MAX_SEASONAL_ADJUST: u8 = 200;
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

fn parse_day(name: &str) -> Option<u8> {
    let key = name.trim().to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .position(|d| key.starts_with(d))
        .map(|i| 1 << i)
}

/// "HH:MM" to minutes since midnight.
fn parse_time(s: &str) -> Option<u16> {
    let (h, m) = s.trim().split_once(':')?;
    let (h, m): (u16, u16) = (h.parse().ok()?, m.parse().ok()?);
    (h < 24 && m < 60).then_some(h * 60 + m)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_globals(&mut errors);
        self.validate_stations(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_schedules(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_globals(&self, errors: &mut Vec<String>) {
        if self.station_id == BROADCAST_UNIT {
            errors.push(format!("station_id {BROADCAST_UNIT} is reserved for broadcast"));
        }
        if self.max_run_duration == 0 || self.max_run_duration == u8::MAX {
            errors.push(format!(
                "max_run_duration {} out of range [1, 254]",
                self.max_run_duration
            ));
        }
        if self.seasonal_adjust > MAX_SEASONAL_ADJUST {
            errors.push(format!(
                "seasonal_adjust {} out of range [0, {MAX_SEASONAL_ADJUST}]",
                self.seasonal_adjust
            ));
        }
        if !(-720..=840).contains(&self.utc_offset_min) {
            errors.push(format!(
                "utc_offset_min {} out of range [-720, 840]",
                self.utc_offset_min
            ));
        }
    }

    fn validate_stations(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<u8> = HashSet::new();

        for (i, s) in self.stations.iter().enumerate() {
            let ctx = || {
                if s.name.is_empty() {
                    format!("stations[{i}]")
                } else {
                    format!("station '{}'", s.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if s.id == BROADCAST_UNIT {
                errors.push(format!("{}: id {BROADCAST_UNIT} is reserved", ctx()));
            } else if !seen_ids.insert(s.id) {
                errors.push(format!("{}: duplicate station id {}", ctx(), s.id));
            }
            if s.id == self.station_id && s.network == NetworkKind::Radio {
                errors.push(format!(
                    "{}: this controller's own station must be wired locally",
                    ctx()
                ));
            }

            // ── Zone range ──────────────────────────────────────
            if s.first_zone as usize + s.zone_count as usize > u8::MAX as usize {
                errors.push(format!(
                    "{}: zones {}..{} exceed the 255-zone address space",
                    ctx(),
                    s.first_zone,
                    s.first_zone as usize + s.zone_count as usize
                ));
            }
            if s.network.is_local() && s.network_address as u32 + s.zone_count as u32 > u16::MAX as u32 {
                errors.push(format!(
                    "{}: output channels {}..{} exceed the 16-bit channel space",
                    ctx(),
                    s.network_address,
                    s.network_address as u32 + s.zone_count as u32
                ));
            }
        }

        // overlapping global zone ranges
        for (i, a) in self.stations.iter().enumerate() {
            for b in self.stations.iter().skip(i + 1) {
                let (a0, a1) = (a.first_zone as usize, a.first_zone as usize + a.zone_count as usize);
                let (b0, b1) = (b.first_zone as usize, b.first_zone as usize + b.zone_count as usize);
                if a0 < b1 && b0 < a1 {
                    errors.push(format!(
                        "station '{}': zones overlap with station '{}'",
                        b.name, a.name
                    ));
                }
            }
        }
    }

    fn station(&self, id: u8) -> Option<&StationEntry> {
        self.stations.iter().find(|s| s.id == id)
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<(u8, u8)> = HashSet::new();
        let mut seen_pins: HashSet<u8> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || format!("zones[{i}] (station {} channel {})", z.station, z.channel);

            let Some(station) = self.station(z.station) else {
                errors.push(format!("{}: station does not exist", ctx()));
                continue;
            };
            if z.channel >= station.zone_count {
                errors.push(format!(
                    "{}: channel outside station range [0, {})",
                    ctx(),
                    station.zone_count
                ));
            }
            if !seen.insert((z.station, z.channel)) {
                errors.push(format!("{}: duplicate zone", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if let Some(pin) = z.valve_gpio_pin {
                if !station.network.is_local() {
                    errors.push(format!(
                        "{}: valve_gpio_pin set on a radio station",
                        ctx()
                    ));
                }
                if !VALID_GPIO_PINS.contains(&pin) {
                    errors.push(format!(
                        "{}: valve_gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                        ctx(),
                        pin
                    ));
                } else if !seen_pins.insert(pin) {
                    errors.push(format!(
                        "{}: valve_gpio_pin {} is already used by another zone",
                        ctx(),
                        pin
                    ));
                }
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<(u8, u8)> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || format!("sensors[{i}] (station {} channel {})", s.station, s.channel);
            if self.station(s.station).is_none() {
                errors.push(format!("{}: station does not exist", ctx()));
            }
            if !seen.insert((s.station, s.channel)) {
                errors.push(format!("{}: duplicate sensor", ctx()));
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        if self.schedules.len() > MAX_SCHEDULES {
            errors.push(format!(
                "{} schedules defined, at most {MAX_SCHEDULES} allowed",
                self.schedules.len()
            ));
        }
        let zone_total = self
            .stations
            .iter()
            .map(|s| s.first_zone as usize + s.zone_count as usize)
            .max()
            .unwrap_or(0);

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = || {
                if s.name.is_empty() {
                    format!("schedules[{i}]")
                } else {
                    format!("schedule '{}'", s.name)
                }
            };

            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Recurrence ──────────────────────────────────────
            match (s.days.is_empty(), s.interval) {
                (true, None) => errors.push(format!("{}: needs either days or interval", ctx())),
                (false, Some(_)) => {
                    errors.push(format!("{}: days and interval are mutually exclusive", ctx()))
                }
                (true, Some(0)) => errors.push(format!("{}: interval must be at least 1", ctx())),
                _ => {}
            }
            for day in &s.days {
                if parse_day(day).is_none() {
                    errors.push(format!("{}: unknown day '{day}'", ctx()));
                }
            }

            // ── Start times ─────────────────────────────────────
            if s.start_times.is_empty() || s.start_times.len() > MAX_START_TIMES {
                errors.push(format!(
                    "{}: {} start times, expected 1 to {MAX_START_TIMES}",
                    ctx(),
                    s.start_times.len()
                ));
            }
            for t in &s.start_times {
                if parse_time(t).is_none() {
                    errors.push(format!("{}: start time '{t}' is not HH:MM", ctx()));
                }
            }

            // ── Durations ───────────────────────────────────────
            if s.durations.len() > zone_total {
                errors.push(format!(
                    "{}: {} durations but only {zone_total} zones configured",
                    ctx(),
                    s.durations.len()
                ));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Conversion
    // -----------------------------------------------------------------------

    /// Build the runtime store. Call on a validated config.
    pub fn store(&self) -> MemoryStore {
        let mut store = MemoryStore::new(self.station_id, self.max_run_duration);
        for s in &self.stations {
            let sensor_count = self.sensors.iter().filter(|x| x.station == s.id).count();
            store = store.with_station(
                s.id,
                StationConfig {
                    name: s.name.clone(),
                    enabled: s.enabled,
                    remote_status: s.remote_status,
                    remote_control: s.remote_control,
                    network: s.network,
                    network_address: s.network_address,
                    zone_count: s.zone_count,
                    first_zone: s.first_zone,
                    sensor_count: sensor_count.min(u8::MAX as usize) as u8,
                },
            );
        }
        for z in &self.zones {
            let Some(station) = self.station(z.station) else {
                continue;
            };
            if let Some(zone) = store.zone_mut(station.first_zone.saturating_add(z.channel)) {
                zone.enabled = z.enabled;
                if !z.name.is_empty() {
                    zone.name = z.name.clone();
                }
            }
        }
        for s in &self.sensors {
            store = store.with_sensor(SensorConfig {
                kind: s.kind,
                station: s.station,
                channel: s.channel,
            });
        }
        store
    }

    pub fn schedules(&self) -> Vec<Schedule> {
        self.schedules
            .iter()
            .map(|s| Schedule {
                name: s.name.clone(),
                enabled: s.enabled,
                recurrence: match s.interval {
                    Some(n) => Recurrence::Interval(n),
                    None => Recurrence::Weekdays(
                        s.days.iter().filter_map(|d| parse_day(d)).fold(0, |m, b| m | b),
                    ),
                },
                start_times: s.start_times.iter().filter_map(|t| parse_time(t)).collect(),
                durations: s.durations.clone(),
                weather_adjust: s.weather_adjust,
            })
            .collect()
    }

    /// `(output channel, BCM pin)` for every locally wired zone with a pin.
    pub fn valve_channels(&self) -> Vec<(u16, u8)> {
        self.zones
            .iter()
            .filter_map(|z| {
                let station = self.station(z.station)?;
                let pin = z.valve_gpio_pin?;
                if !station.network.is_local() {
                    return None;
                }
                let output = station.network_address.checked_add(z.channel as u16)?;
                Some((output, pin))
            })
            .collect()
    }

    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(self.utc_offset_min as i32 * 60).unwrap_or(UtcOffset::UTC)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
