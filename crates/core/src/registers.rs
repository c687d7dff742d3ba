//! System registers exposed over RProtocol.
//!
//! Register map (16-bit words):
//!
//! | addr | name                    | rw |
//! |------|-------------------------|----|
//! | 0    | station type            | r  |
//! | 1    | hardware version        | r  |
//! | 2    | firmware version        | r  |
//! | 3    | zone count              | r  |
//! | 4-6  | temp/humidity/pressure sensor counts | r |
//! | 10   | unit id                 | rw |
//! | 11   | station status          | rw |
//! | 12   | network (PAN) id        | rw |
//! | 14   | time, low word          | rw |
//! | 16   | time, high word         | rw |
//! | 18   | max run duration        | rw |
//! | 19-21| sensor cycle seconds    | r  |
//! | 22+n | zone n remaining minutes| r  |

use crate::store::SensorKind;

pub const STATION_TYPE: u8 = 0;
pub const HARDWARE_VERSION: u8 = 1;
pub const FIRMWARE_VERSION: u8 = 2;
pub const ZONE_COUNT: u8 = 3;
pub const TEMPERATURE_SENSORS: u8 = 4;
pub const HUMIDITY_SENSORS: u8 = 5;
pub const PRESSURE_SENSORS: u8 = 6;
pub const UNIT_ID: u8 = 10;
pub const STATION_STATUS: u8 = 11;
pub const NETWORK_ID: u8 = 12;
pub const TIME_LOW: u8 = 14;
pub const TIME_HIGH: u8 = 16;
pub const MAX_DURATION: u8 = 18;
pub const TEMPERATURE_CYCLE: u8 = 19;
pub const HUMIDITY_CYCLE: u8 = 20;
pub const PRESSURE_CYCLE: u8 = 21;
pub const ZONE_COUNTDOWN: u8 = 22;

pub const STATION_TYPE_VALUE: u16 = 1;
pub const HARDWARE_VERSION_VALUE: u16 = 1;
pub const FIRMWARE_VERSION_VALUE: u16 = 0x0100;
pub const SENSOR_CYCLE_SECS: u16 = 60;

/// Everything a register read needs that lives outside the register file.
#[derive(Debug, Clone, Default)]
pub struct RegisterContext {
    pub zone_count: u8,
    pub sensor_kinds: Vec<SensorKind>,
    pub now_unix: i64,
    /// Remaining minutes per zone, indexed like the station's zones.
    pub countdown_minutes: Vec<u16>,
}

impl RegisterContext {
    pub fn register_count(&self) -> usize {
        ZONE_COUNTDOWN as usize + self.zone_count as usize
    }

    fn sensors_of(&self, kind: SensorKind) -> u16 {
        self.sensor_kinds.iter().filter(|k| **k == kind).count() as u16
    }
}

/// The writable part of the register file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRegisters {
    pub unit_id: u8,
    pub status: u16,
    pub network_id: u16,
    /// Overrides the configured max run duration once written.
    pub max_duration: Option<u8>,
    /// Seconds added to the system clock.
    pub clock_offset: i64,
}

impl SystemRegisters {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            status: 0,
            network_id: 0,
            max_duration: None,
            clock_offset: 0,
        }
    }

    pub fn read(&self, addr: u8, ctx: &RegisterContext, configured_max: u8) -> u16 {
        match addr {
            STATION_TYPE => STATION_TYPE_VALUE,
            HARDWARE_VERSION => HARDWARE_VERSION_VALUE,
            FIRMWARE_VERSION => FIRMWARE_VERSION_VALUE,
            ZONE_COUNT => ctx.zone_count as u16,
            TEMPERATURE_SENSORS => ctx.sensors_of(SensorKind::Temperature),
            HUMIDITY_SENSORS => ctx.sensors_of(SensorKind::Humidity),
            PRESSURE_SENSORS => ctx.sensors_of(SensorKind::Pressure),
            UNIT_ID => self.unit_id as u16,
            STATION_STATUS => self.status,
            NETWORK_ID => self.network_id,
            TIME_LOW => (ctx.now_unix as u32 & 0xFFFF) as u16,
            TIME_HIGH => (ctx.now_unix as u32 >> 16) as u16,
            MAX_DURATION => self.max_duration.unwrap_or(configured_max) as u16,
            TEMPERATURE_CYCLE | HUMIDITY_CYCLE | PRESSURE_CYCLE => SENSOR_CYCLE_SECS,
            a if a >= ZONE_COUNTDOWN => ctx
                .countdown_minutes
                .get((a - ZONE_COUNTDOWN) as usize)
                .copied()
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Write one register. `false` for read-only or unmapped addresses and
    /// out-of-range values.
    pub fn write(&mut self, addr: u8, value: u16, system_now_unix: i64) -> bool {
        match addr {
            UNIT_ID => {
                let Ok(id) = u8::try_from(value) else {
                    return false;
                };
                if id == crate::codec::BROADCAST_UNIT {
                    return false;
                }
                self.unit_id = id;
            }
            STATION_STATUS => self.status = value,
            NETWORK_ID => self.network_id = value,
            TIME_LOW | TIME_HIGH => {
                let now = (system_now_unix + self.clock_offset) as u32;
                let t = if addr == TIME_LOW {
                    (now & 0xFFFF_0000) | value as u32
                } else {
                    (now & 0x0000_FFFF) | (value as u32) << 16
                };
                self.clock_offset = t as i64 - system_now_unix;
            }
            MAX_DURATION => {
                let Ok(minutes) = u8::try_from(value) else {
                    return false;
                };
                self.max_duration = Some(minutes);
            }
            _ => return false,
        }
        true
    }
}
