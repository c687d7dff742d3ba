//! Read-side view of persisted station, zone and sensor configuration.
//!
//! The controller asks the store on every operation rather than caching, so
//! an edit (a station being disabled, say) takes effect on the next frame.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a station is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// Valves wired directly to this controller's outputs.
    Parallel,
    /// Valves behind a locally attached serial expander.
    Serial,
    /// A remote station reached over RProtocol.
    Radio,
}

impl NetworkKind {
    pub fn is_local(self) -> bool {
        matches!(self, NetworkKind::Parallel | NetworkKind::Serial)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationConfig {
    pub name: String,
    pub enabled: bool,
    /// Remote peers may read this station's status.
    pub remote_status: bool,
    /// Remote peers may command this station's zones.
    pub remote_control: bool,
    pub network: NetworkKind,
    /// Base output channel for local stations.
    pub network_address: u16,
    pub zone_count: u8,
    /// Index of the station's channel 0 in the global zone list.
    pub first_zone: u8,
    pub sensor_count: u8,
}

impl StationConfig {
    pub fn local(name: &str, zone_count: u8) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            remote_status: true,
            remote_control: true,
            network: NetworkKind::Parallel,
            network_address: 0,
            zone_count,
            first_zone: 0,
            sensor_count: 0,
        }
    }

    pub fn radio(name: &str, zone_count: u8, first_zone: u8) -> Self {
        Self {
            network: NetworkKind::Radio,
            first_zone,
            ..Self::local(name, zone_count)
        }
    }

    /// Global zone index of a station channel.
    pub fn zone_of(&self, channel: u8) -> u8 {
        self.first_zone.saturating_add(channel)
    }

    /// Valve output for a channel of a local station; `None` past the
    /// end of the 16-bit output space.
    pub fn output_channel(&self, channel: u8) -> Option<u16> {
        self.network_address.checked_add(channel as u16)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneConfig {
    pub name: String,
    pub enabled: bool,
    pub station: u8,
    pub channel: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Pressure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorConfig {
    pub kind: SensorKind,
    pub station: u8,
    pub channel: u8,
}

pub trait ConfigStore {
    /// This controller's own unit id.
    fn unit_id(&self) -> u8;
    /// `None` for an unknown (invalid) station.
    fn load_station(&self, id: u8) -> Option<StationConfig>;
    fn load_zone(&self, index: u8) -> Option<ZoneConfig>;
    fn zone_count(&self) -> u8;
    /// Upper bound in minutes for any single zone run.
    fn max_run_duration(&self) -> u8;
    fn station_ids(&self) -> Vec<u8>;
    fn sensors(&self) -> Vec<SensorConfig>;
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    unit_id: u8,
    max_run_duration: u8,
    stations: BTreeMap<u8, StationConfig>,
    zones: Vec<ZoneConfig>,
    sensors: Vec<SensorConfig>,
}

impl MemoryStore {
    pub fn new(unit_id: u8, max_run_duration: u8) -> Self {
        Self {
            unit_id,
            max_run_duration,
            stations: BTreeMap::new(),
            zones: Vec::new(),
            sensors: Vec::new(),
        }
    }

    /// Add a station and an enabled zone for each of its channels.
    pub fn with_station(mut self, id: u8, station: StationConfig) -> Self {
        for ch in 0..station.zone_count {
            let index = station.zone_of(ch) as usize;
            if self.zones.len() <= index {
                self.zones.resize(
                    index + 1,
                    ZoneConfig {
                        name: String::new(),
                        enabled: false,
                        station: 0,
                        channel: 0,
                    },
                );
            }
            self.zones[index] = ZoneConfig {
                name: format!("{} {}", station.name, ch + 1),
                enabled: true,
                station: id,
                channel: ch,
            };
        }
        self.stations.insert(id, station);
        self
    }

    pub fn with_sensor(mut self, sensor: SensorConfig) -> Self {
        self.sensors.push(sensor);
        self
    }

    pub fn station_mut(&mut self, id: u8) -> Option<&mut StationConfig> {
        self.stations.get_mut(&id)
    }

    pub fn zone_mut(&mut self, index: u8) -> Option<&mut ZoneConfig> {
        self.zones.get_mut(index as usize)
    }

    pub fn set_max_run_duration(&mut self, minutes: u8) {
        self.max_run_duration = minutes;
    }
}

impl ConfigStore for MemoryStore {
    fn unit_id(&self) -> u8 {
        self.unit_id
    }

    fn load_station(&self, id: u8) -> Option<StationConfig> {
        self.stations.get(&id).cloned()
    }

    fn load_zone(&self, index: u8) -> Option<ZoneConfig> {
        self.zones.get(index as usize).cloned()
    }

    fn zone_count(&self) -> u8 {
        self.zones.len().min(u8::MAX as usize) as u8
    }

    fn max_run_duration(&self) -> u8 {
        self.max_run_duration
    }

    fn station_ids(&self) -> Vec<u8> {
        self.stations.keys().copied().collect()
    }

    fn sensors(&self) -> Vec<SensorConfig> {
        self.sensors.clone()
    }
}

impl<S: ConfigStore + ?Sized> ConfigStore for std::sync::Arc<std::sync::RwLock<S>> {
    fn unit_id(&self) -> u8 {
        self.read().map_or(0, |s| s.unit_id())
    }

    fn load_station(&self, id: u8) -> Option<StationConfig> {
        self.read().ok()?.load_station(id)
    }

    fn load_zone(&self, index: u8) -> Option<ZoneConfig> {
        self.read().ok()?.load_zone(index)
    }

    fn zone_count(&self) -> u8 {
        self.read().map_or(0, |s| s.zone_count())
    }

    fn max_run_duration(&self) -> u8 {
        self.read().map_or(0, |s| s.max_run_duration())
    }

    fn station_ids(&self) -> Vec<u8> {
        self.read().map(|s| s.station_ids()).unwrap_or_default()
    }

    fn sensors(&self) -> Vec<SensorConfig> {
        self.read().map(|s| s.sensors()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stations_lay_out_global_zones() {
        let store = MemoryStore::new(0, 99)
            .with_station(0, StationConfig::local("Garden", 4))
            .with_station(4, StationConfig::radio("Orchard", 3, 4));

        assert_eq!(store.zone_count(), 7);
        let z = store.load_zone(5).unwrap();
        assert_eq!((z.station, z.channel), (4, 1));
        assert_eq!(z.name, "Orchard 2");
        assert_eq!(store.station_ids(), vec![0, 4]);
    }

    #[test]
    fn unknown_station_is_invalid() {
        let store = MemoryStore::new(0, 99).with_station(0, StationConfig::local("Garden", 2));
        assert!(store.load_station(3).is_none());
        assert!(store.load_zone(9).is_none());
    }

    #[test]
    fn edits_visible_through_shared_handle() {
        let shared = std::sync::Arc::new(std::sync::RwLock::new(
            MemoryStore::new(0, 99).with_station(0, StationConfig::local("Garden", 2)),
        ));
        shared.write().unwrap().station_mut(0).unwrap().enabled = false;
        assert!(!shared.load_station(0).unwrap().enabled);
    }

    #[test]
    fn output_channel_stops_at_u16_max() {
        let mut station = StationConfig::local("Garden", 8);
        station.network_address = u16::MAX - 2;
        assert_eq!(station.output_channel(2), Some(u16::MAX));
        assert_eq!(station.output_channel(3), None);
    }

    #[test]
    fn local_networks() {
        assert!(NetworkKind::Parallel.is_local());
        assert!(NetworkKind::Serial.is_local());
        assert!(!NetworkKind::Radio.is_local());
    }
}
