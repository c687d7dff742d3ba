//! The irrigation controller: zone commands, periodic housekeeping and the
//! state shared by both protocol roles. Frame handling lives in
//! [`crate::dispatch`].

use std::collections::{BTreeMap, BTreeSet};

use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};

use crate::codec::{AckFlags, EventFlags, Exception, Frame, Message, ZoneMask, STATION_ENABLED};
use crate::notify::{Event, EventLog, Notification, StopReason};
use crate::registers::{RegisterContext, SystemRegisters};
use crate::reliability::{Destination, ReliableLink};
use crate::scheduler::ZoneActuator;
use crate::sensors::SensorSource;
use crate::store::{ConfigStore, StationConfig};
use crate::transport::Transport;
use crate::valve::ValveDriver;
use crate::zones::{Transition, ZoneBoard, ZoneRun, ZoneState, TICKS_PER_MINUTE};

/// Which side of the protocol this controller plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Master: issues requests and consumes reports.
    Requester,
    /// Station: serves requests addressed to it.
    Responder,
    /// Both at once, for a master that also owns local zones.
    Gateway,
}

impl Role {
    pub fn serves_requests(self) -> bool {
        matches!(self, Role::Responder | Role::Gateway)
    }

    pub fn consumes_reports(self) -> bool {
        matches!(self, Role::Requester | Role::Gateway)
    }
}

/// Where a zone change came from. Changes made on behalf of a remote
/// request are not echoed back as unsolicited reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Local,
    Remote,
}

/// Recipient of unsolicited reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMaster {
    pub station: u8,
    pub address: u16,
    pub events: EventFlags,
}

/// What the requester side has learned about other stations.
#[derive(Debug, Default, Clone)]
pub struct RemoteView {
    /// (station, sensor index) -> last reading.
    pub sensors: BTreeMap<(u8, u8), u16>,
    /// (station, register) -> last value.
    pub registers: BTreeMap<(u8, u8), u16>,
    pub event_masters: BTreeMap<u8, EventMaster>,
    pub discovered: BTreeSet<u8>,
    pub pings: BTreeMap<u8, u32>,
    /// Last error response per station: (function code, exception).
    pub errors: BTreeMap<u8, (u8, Exception)>,
}

pub struct Controller<T, S> {
    pub(crate) role: Role,
    pub(crate) link: ReliableLink<T>,
    pub(crate) store: S,
    pub(crate) valves: Box<dyn ValveDriver>,
    pub(crate) sensors: Box<dyn SensorSource>,
    pub(crate) zones: ZoneBoard,
    pub(crate) registers: SystemRegisters,
    pub(crate) event_master: Option<EventMaster>,
    pub(crate) remote: RemoteView,
    events: EventLog,
    /// Zones commanded by each outstanding Zones-Set, keyed by
    /// (station, transaction id).
    pub(crate) in_flight: BTreeMap<(u8, u8), Vec<u8>>,
    next_transaction: u8,
    ticks: u64,
    last_readings: Vec<u16>,
}

impl<T: Transport, S: ConfigStore> Controller<T, S> {
    pub fn new(
        role: Role,
        transport: T,
        store: S,
        valves: Box<dyn ValveDriver>,
        sensors: Box<dyn SensorSource>,
    ) -> Self {
        let unit_id = store.unit_id();
        let zones = ZoneBoard::new(store.zone_count() as usize);
        info!(unit_id, ?role, zones = zones.len(), "controller ready");
        let mut controller = Self {
            role,
            link: ReliableLink::new(transport),
            store,
            valves,
            sensors,
            zones,
            registers: SystemRegisters::new(unit_id),
            event_master: None,
            remote: RemoteView::default(),
            events: EventLog::new(),
            in_flight: BTreeMap::new(),
            next_transaction: 1,
            ticks: 0,
            last_readings: Vec::new(),
        };
        controller.record(Event::System {
            detail: format!("{role:?} controller started as unit {unit_id}"),
        });
        controller
    }

    // -- Accessors -----------------------------------------------------------

    pub fn unit_id(&self) -> u8 {
        self.registers.unit_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn zone_state(&self, zone: u8) -> ZoneState {
        self.zones.state(zone)
    }

    pub fn zones(&self) -> &ZoneBoard {
        &self.zones
    }

    pub fn remote(&self) -> &RemoteView {
        &self.remote
    }

    pub fn event_master(&self) -> Option<EventMaster> {
        self.event_master
    }

    pub fn registers(&self) -> &SystemRegisters {
        &self.registers
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn link(&self) -> &ReliableLink<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut ReliableLink<T> {
        &mut self.link
    }

    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.events.recent()
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.events.take_pending()
    }

    /// Station clock: system time plus whatever offset time sync applied.
    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + Duration::seconds(self.registers.clock_offset)
    }

    /// Effective cap on a single run, in minutes.
    pub fn max_run_duration(&self) -> u8 {
        self.registers
            .max_duration
            .unwrap_or_else(|| self.store.max_run_duration())
    }

    pub(crate) fn record(&mut self, event: Event) {
        let ts = self.now();
        self.events.push(ts, event);
    }

    /// Valid and enabled station config.
    pub(crate) fn enabled_station(&self, id: u8) -> Option<StationConfig> {
        self.store.load_station(id).filter(|s| s.enabled)
    }

    // -- Frame output --------------------------------------------------------

    pub(crate) fn next_transaction(&mut self) -> u8 {
        let id = self.next_transaction;
        self.next_transaction = self.next_transaction.checked_add(1).unwrap_or(1);
        id
    }

    pub(crate) fn send_frame(&mut self, dest: Destination, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(bytes) => self.link.send(dest, &bytes),
            Err(e) => {
                error!(function = ?frame.function(), error = %e, "refusing to send frame");
                false
            }
        }
    }

    /// Send a request with a fresh transaction id.
    pub(crate) fn request(&mut self, station: u8, message: Message) -> bool {
        let txn = self.next_transaction();
        let commanded = self.commanded_zones(station, &message);
        let frame = Frame::new(txn, station, self.unit_id(), message);
        let sent = self.send_frame(Destination::Station(station), &frame);
        if sent && !commanded.is_empty() {
            self.in_flight.insert((station, txn), commanded);
        }
        sent
    }

    /// Global zones a Zones-Set for `station` selects.
    fn commanded_zones(&self, station: u8, message: &Message) -> Vec<u8> {
        let Message::ZonesSet {
            first, count, mask, ..
        } = message
        else {
            return Vec::new();
        };
        let Some(config) = self.store.load_station(station) else {
            return Vec::new();
        };
        let end = first.saturating_add(*count).min(config.zone_count);
        (*first..end)
            .filter(|ch| mask.get(*ch))
            .map(|ch| config.zone_of(ch))
            .collect()
    }

    /// Answer `req` with the same transaction id.
    pub(crate) fn reply(&mut self, req: &Frame, message: Message) -> bool {
        let frame = Frame::new(req.transaction_id, req.from, self.unit_id(), message);
        self.send_frame(Destination::Station(req.from), &frame)
    }

    fn send_unsolicited(&mut self, to: u8, message: Message) -> bool {
        let frame = Frame::new(0, to, self.unit_id(), message);
        self.send_frame(Destination::Station(to), &frame)
    }

    // -- Reports -------------------------------------------------------------

    /// Zone report for channels `first..first + count` of a station.
    pub(crate) fn zones_report(&self, station: &StationConfig, first: u8, count: u8) -> Message {
        let mut mask = ZoneMask::empty(first, count);
        for ch in first..first.saturating_add(count) {
            mask.set(ch, self.zones.state(station.zone_of(ch)).is_on());
        }
        Message::ZonesReport {
            station_flags: if station.enabled { STATION_ENABLED } else { 0 },
            first,
            count,
            mask,
        }
    }

    pub(crate) fn register_context(&self) -> RegisterContext {
        let me = self.unit_id();
        let station = self.store.load_station(me);
        let zone_count = station.as_ref().map_or(0, |s| s.zone_count);
        let mut sensors: Vec<_> = self
            .store
            .sensors()
            .into_iter()
            .filter(|s| s.station == me)
            .collect();
        sensors.sort_by_key(|s| s.channel);

        let countdown_minutes = (0..zone_count)
            .map(|ch| {
                let zone = station.as_ref().map_or(ch, |s| s.zone_of(ch));
                let ticks = self.zones.status(zone).map_or(0, |z| z.remaining_ticks);
                ticks.div_ceil(TICKS_PER_MINUTE) as u16
            })
            .collect();

        RegisterContext {
            zone_count,
            sensor_kinds: sensors.iter().map(|s| s.kind).collect(),
            now_unix: self.now().unix_timestamp(),
            countdown_minutes,
        }
    }

    /// Tell the event master about our own zones, if it asked for them.
    fn push_zone_report(&mut self, station_id: u8) {
        if station_id != self.unit_id() {
            return;
        }
        let Some(master) = self.event_master else {
            return;
        };
        if !master.events.contains(EventFlags::REPORT_ZONES) {
            return;
        }
        let Some(station) = self.store.load_station(station_id) else {
            return;
        };
        let report = self.zones_report(&station, 0, station.zone_count);
        if !self.send_unsolicited(master.station, report) {
            warn!(master = master.station, "unsolicited zone report not sent");
        }
    }

    fn push_sensor_report(&mut self, values: Vec<u16>) {
        let Some(master) = self.event_master else {
            return;
        };
        if master.events.contains(EventFlags::REPORT_SENSORS)
            && !self.send_unsolicited(master.station, Message::SensorsReport { first: 0, values })
        {
            warn!(master = master.station, "unsolicited sensor report not sent");
        }
    }

    // -- Zone commands -------------------------------------------------------

    /// Turn a zone on. Local zones start running at once; remote zones wait
    /// in `Starting` for the station to confirm.
    pub fn start_zone(&mut self, run: ZoneRun) -> bool {
        self.start_zone_from(run, Origin::Local)
    }

    pub fn stop_zone(&mut self, zone: u8) -> bool {
        self.stop_zone_from(zone, Origin::Local)
    }

    pub(crate) fn start_zone_from(&mut self, mut run: ZoneRun, origin: Origin) -> bool {
        let Some(zone) = self.store.load_zone(run.zone) else {
            warn!(zone = run.zone, "start requested for unknown zone");
            return false;
        };
        if !zone.enabled {
            warn!(zone = run.zone, "zone disabled, not starting");
            return false;
        }
        let Some(station) = self.enabled_station(zone.station) else {
            self.fail_safe_off(run.zone);
            return false;
        };

        run.minutes = run.minutes.min(self.max_run_duration());
        if run.minutes == 0 {
            return self.stop_zone_from(run.zone, origin);
        }

        let now = self.now();
        if station.network.is_local() {
            if !self.set_valve(&station, zone.channel, true) {
                return false;
            }
            self.zones.start(run, true, now);
        } else {
            if !self.channel_on(zone.station, zone.channel, run.minutes, run.schedule.unwrap_or(0)) {
                warn!(zone = run.zone, station = zone.station, "start command not sent");
                return false;
            }
            self.zones.start(run, false, now);
        }

        info!(
            zone = run.zone,
            minutes = run.minutes,
            schedule = ?run.schedule,
            state = ?self.zones.state(run.zone),
            "zone on"
        );
        self.record(Event::ZoneStarted { run });
        if origin == Origin::Local {
            self.push_zone_report(zone.station);
        }
        true
    }

    pub(crate) fn stop_zone_from(&mut self, index: u8, origin: Origin) -> bool {
        let Some(zone) = self.store.load_zone(index) else {
            return false;
        };
        if self.zones.state(index) == ZoneState::Off {
            return true;
        }
        let Some(station) = self.enabled_station(zone.station) else {
            self.fail_safe_off(index);
            return false;
        };

        if station.network.is_local() {
            if !self.set_valve(&station, zone.channel, false) {
                return false;
            }
            self.zones.stop(index, true);
        } else {
            if !self.channel_off(zone.station, zone.channel) {
                warn!(zone = index, station = zone.station, "stop command not sent");
                return false;
            }
            self.zones.stop(index, false);
        }

        info!(zone = index, state = ?self.zones.state(index), "zone off");
        self.record(Event::ZoneStopped {
            zone: index,
            reason: StopReason::Commanded,
        });
        if origin == Origin::Local {
            self.push_zone_report(zone.station);
        }
        true
    }

    /// Drive one local valve. `false` when the channel has no output.
    fn set_valve(&mut self, station: &StationConfig, channel: u8, on: bool) -> bool {
        match station.output_channel(channel) {
            Some(output) => self.valves.set(output, on),
            None => {
                warn!(station = %station.name, channel, "valve channel outside output range");
                false
            }
        }
    }

    /// The owning station is gone or disabled: the zone is `Off` no matter
    /// what it was doing.
    fn fail_safe_off(&mut self, index: u8) {
        if let Some(zone) = self.store.load_zone(index) {
            if let Some(station) = self.store.load_station(zone.station) {
                if station.network.is_local() {
                    self.set_valve(&station, zone.channel, false);
                }
            }
            warn!(zone = index, station = zone.station, "owning station disabled or invalid");
        }
        if self.zones.state(index) != ZoneState::Off {
            self.zones.force_off(index);
            self.record(Event::ZoneStopped {
                zone: index,
                reason: StopReason::StationDisabled,
            });
        }
    }

    /// Stop every active zone the normal way: one command per station,
    /// remote zones waiting for confirmation.
    pub fn turn_off_all(&mut self) {
        let mut by_station: BTreeMap<u8, Vec<(u8, u8)>> = BTreeMap::new();
        let active: Vec<u8> = self.zones.active().collect();
        for index in active {
            match self.store.load_zone(index) {
                Some(zone) => by_station
                    .entry(zone.station)
                    .or_default()
                    .push((index, zone.channel)),
                None => self.zones.force_off(index),
            }
        }

        for (station_id, zones) in by_station {
            let Some(station) = self.enabled_station(station_id) else {
                for (index, _) in zones {
                    self.fail_safe_off(index);
                }
                continue;
            };

            let confirmed = if station.network.is_local() {
                for (_, ch) in &zones {
                    self.set_valve(&station, *ch, false);
                }
                true
            } else {
                let mut mask = ZoneMask::empty(0, station.zone_count);
                for (_, ch) in &zones {
                    mask.set(*ch, true);
                }
                let sent = self.request(
                    station_id,
                    Message::ZonesSet {
                        flags: AckFlags::STD,
                        schedule_id: 0,
                        first: 0,
                        minutes: 0,
                        count: station.zone_count,
                        mask,
                    },
                );
                if !sent {
                    warn!(station = station_id, "turn-off command not sent");
                    continue;
                }
                false
            };

            for (index, _) in zones {
                self.zones.stop(index, confirmed);
                self.record(Event::ZoneStopped {
                    zone: index,
                    reason: StopReason::Commanded,
                });
            }
            info!(station = station_id, "station zones off");
            self.push_zone_report(station_id);
        }
    }

    /// Unconditionally stop everything: local outputs released, every
    /// enabled remote station told to stop, all zones `Off` immediately.
    pub fn stop_all(&mut self) {
        self.valves.all_off();
        for station_id in self.store.station_ids() {
            let Some(station) = self.enabled_station(station_id) else {
                continue;
            };
            if !station.network.is_local() && !self.all_channels_off(station_id) {
                warn!(station = station_id, "stop-all command not sent");
            }
        }

        let active: Vec<u8> = (0..self.zones.len() as u8)
            .filter(|z| self.zones.state(*z) != ZoneState::Off)
            .collect();
        self.zones.all_off();
        for zone in active {
            self.record(Event::ZoneStopped {
                zone,
                reason: StopReason::Commanded,
            });
        }
        info!("all zones stopped");
        let me = self.unit_id();
        self.push_zone_report(me);
    }

    // -- Housekeeping --------------------------------------------------------

    /// Process at most one inbound frame.
    pub fn poll(&mut self) -> Option<crate::dispatch::Outcome> {
        let delivery = self.link.receive()?;
        Some(self.process(delivery))
    }

    /// One-second housekeeping: confirmation timeouts, run countdowns and
    /// sensor change detection.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.link.set_tick(self.ticks);
        let configured = self.store.zone_count() as usize;
        if configured != self.zones.len() {
            debug!(from = self.zones.len(), to = configured, "zone count changed");
            self.zones.resize(configured);
        }

        let board = &self.zones;
        self.in_flight
            .retain(|_, zones| zones.iter().any(|z| board.state(*z).is_pending()));

        for transition in self.zones.tick() {
            match transition {
                Transition::Unconfirmed { zone, was } => {
                    warn!(zone, ?was, "no confirmation from station, zone off");
                    self.record(Event::ZoneStopped {
                        zone,
                        reason: StopReason::Unconfirmed,
                    });
                }
                Transition::Finished { zone } => {
                    self.finish_run(zone);
                }
            }
        }

        if self.sensors.sample() {
            self.check_sensors();
        }
    }

    fn finish_run(&mut self, index: u8) {
        info!(zone = index, "run finished");
        let Some(zone) = self.store.load_zone(index) else {
            return;
        };
        if let Some(station) = self.store.load_station(zone.station) {
            if station.network.is_local() {
                self.set_valve(&station, zone.channel, false);
            }
        }
        self.record(Event::ZoneStopped {
            zone: index,
            reason: StopReason::Finished,
        });
        self.push_zone_report(zone.station);
    }

    fn check_sensors(&mut self) {
        let count = self.sensors.count();
        let values: Vec<u16> = (0..count).map(|i| self.sensors.read(i)).collect();
        if values == self.last_readings {
            return;
        }

        let me = self.unit_id();
        let kinds = self.store.sensors();
        for (i, value) in values.iter().enumerate() {
            if self.last_readings.get(i) == Some(value) {
                continue;
            }
            let channel = i as u8;
            let sensor = kinds
                .iter()
                .find(|s| s.station == me && s.channel == channel)
                .map(|s| s.kind);
            debug!(channel, value, "sensor reading changed");
            self.record(Event::SensorReading {
                station: me,
                channel,
                sensor,
                value: *value,
            });
        }
        self.last_readings = values.clone();
        self.push_sensor_report(values);
    }
}

impl<T: Transport, S: ConfigStore> ZoneActuator for Controller<T, S> {
    fn turn_on(&mut self, run: ZoneRun) -> bool {
        self.start_zone(run)
    }

    fn turn_off_all(&mut self) {
        Controller::turn_off_all(self);
    }

    fn stop_all(&mut self) {
        Controller::stop_all(self);
    }

    fn max_run_minutes(&self) -> u8 {
        self.max_run_duration()
    }
}
