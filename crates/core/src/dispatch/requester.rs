//! Master side: issue requests to stations and fold their reports into
//! local state.

use tracing::{debug, info, warn};

use super::{DropReason, Outcome};
use crate::codec::{
    AckFlags, EventFlags, Frame, FunctionCode, Message, ZoneMask, BROADCAST_UNIT,
};
use crate::controller::{Controller, EventMaster};
use crate::notify::{Event, StopReason};
use crate::reliability::Destination;
use crate::store::ConfigStore;
use crate::transport::Transport;
use crate::zones::ZoneState;

impl<T: Transport, S: ConfigStore> Controller<T, S> {
    // -- Outgoing requests ---------------------------------------------------

    /// Run one channel of a remote station for `minutes`.
    pub fn channel_on(&mut self, station: u8, channel: u8, minutes: u8, schedule_id: u8) -> bool {
        self.request(
            station,
            Message::ZonesSet {
                flags: AckFlags::STD,
                schedule_id,
                first: channel,
                minutes,
                count: 1,
                mask: ZoneMask::single(channel),
            },
        )
    }

    pub fn channel_off(&mut self, station: u8, channel: u8) -> bool {
        self.request(
            station,
            Message::ZonesSet {
                flags: AckFlags::STD,
                schedule_id: 0,
                first: channel,
                minutes: 0,
                count: 1,
                mask: ZoneMask::single(channel),
            },
        )
    }

    /// Turn off every channel of a remote station.
    pub fn all_channels_off(&mut self, station: u8) -> bool {
        let Some(config) = self.store.load_station(station) else {
            warn!(station, "all-off for unknown station");
            return false;
        };
        self.request(
            station,
            Message::ZonesSet {
                flags: AckFlags::STD,
                schedule_id: 0,
                first: 0,
                minutes: 0,
                count: config.zone_count,
                mask: ZoneMask::range(0, config.zone_count),
            },
        )
    }

    pub fn read_zones(&mut self, station: u8) -> bool {
        self.request(
            station,
            Message::ZonesRead {
                first: 0,
                count: crate::codec::ALL,
            },
        )
    }

    pub fn poll_sensors(&mut self, station: u8) -> bool {
        self.request(
            station,
            Message::SensorsRead {
                first: 0,
                count: crate::codec::ALL,
            },
        )
    }

    pub fn read_registers(&mut self, station: u8, first: u8, count: u8) -> bool {
        self.request(station, Message::RegistersRead { first, count })
    }

    pub fn write_registers(&mut self, station: u8, first: u8, values: Vec<u16>) -> bool {
        self.request(
            station,
            Message::RegistersSet {
                flags: AckFlags::STD,
                first,
                values,
            },
        )
    }

    pub fn read_event_master(&mut self, station: u8) -> bool {
        self.request(station, Message::EventMasterRead)
    }

    /// Ask a station to push the given events to us.
    pub fn subscribe_events(&mut self, station: u8, events: EventFlags) -> bool {
        let me = self.unit_id();
        self.request(
            station,
            Message::EventMasterSet {
                flags: AckFlags::STD,
                events: events | EventFlags::REGISTER_SELF,
                master_id: me,
                master_address: me as u16,
            },
        )
    }

    pub fn ping(&mut self, station: u8, cookie: u32) -> bool {
        self.request(station, Message::Ping { cookie })
    }

    /// Ask every station on the network to identify itself.
    pub fn scan(&mut self) -> bool {
        let txn = self.next_transaction();
        let frame = Frame::new(txn, BROADCAST_UNIT, self.unit_id(), Message::Scan);
        self.send_frame(Destination::Broadcast, &frame)
    }

    /// Broadcast our clock so stations can synchronise.
    pub fn broadcast_time(&mut self) -> bool {
        let time = self.now().unix_timestamp() as u32;
        let frame = Frame::new(0, BROADCAST_UNIT, self.unit_id(), Message::TimeBroadcast { time });
        self.send_frame(Destination::Broadcast, &frame)
    }

    // -- Incoming reports ----------------------------------------------------

    pub(super) fn consume(&mut self, frame: &Frame) -> Outcome {
        let from = frame.from;
        let function = frame.function();
        match &frame.message {
            Message::ZonesReport {
                first,
                count,
                mask,
                ..
            } => {
                if frame.transaction_id != 0 {
                    self.in_flight.remove(&(from, frame.transaction_id));
                }
                return self.consume_zones_report(from, *first, *count, mask);
            }
            Message::SensorsReport { first, values } => {
                let sensors = self.store.sensors();
                for (i, value) in values.iter().enumerate() {
                    let channel = first.saturating_add(i as u8);
                    self.remote.sensors.insert((from, channel), *value);
                    let sensor = sensors
                        .iter()
                        .find(|s| s.station == from && s.channel == channel)
                        .map(|s| s.kind);
                    self.record(Event::SensorReading {
                        station: from,
                        channel,
                        sensor,
                        value: *value,
                    });
                }
                debug!(station = from, count = values.len(), "sensor report");
            }
            Message::RegistersReport { first, values } => {
                for (i, value) in values.iter().enumerate() {
                    self.remote
                        .registers
                        .insert((from, first.saturating_add(i as u8)), *value);
                }
                debug!(station = from, first, count = values.len(), "register report");
            }
            Message::EventMasterReport {
                events,
                master_id,
                master_address,
            } => {
                self.remote.event_masters.insert(
                    from,
                    EventMaster {
                        station: *master_id,
                        address: *master_address,
                        events: *events,
                    },
                );
            }
            Message::ScanReply => {
                if self.remote.discovered.insert(from) {
                    info!(station = from, "station discovered");
                }
            }
            Message::PingReply { cookie } => {
                debug!(station = from, cookie, "ping reply");
                self.remote.pings.insert(from, *cookie);
            }
            Message::ResponseOk { function } => {
                debug!(station = from, function, "request acknowledged");
                self.in_flight.remove(&(from, frame.transaction_id));
            }
            Message::ResponseError {
                function,
                exception,
            } => {
                warn!(station = from, function, ?exception, "station returned error");
                self.remote.errors.insert(from, (*function, *exception));
                self.record(Event::Error {
                    detail: format!("station {from} refused function {function}: {exception:?}"),
                });
                if *function == FunctionCode::ZonesSet.as_u8() {
                    self.revert_pending(from, frame.transaction_id);
                }
            }
            _ => {}
        }
        Outcome::Handled(function)
    }

    fn consume_zones_report(&mut self, from: u8, first: u8, count: u8, mask: &ZoneMask) -> Outcome {
        let Some(station) = self.enabled_station(from) else {
            debug!(station = from, "zone report from unknown or disabled station");
            return Outcome::Dropped(DropReason::UnknownStation(from));
        };
        if first as usize + count as usize > station.zone_count as usize {
            return Outcome::Dropped(DropReason::OutOfRange(FunctionCode::ZonesReport));
        }

        for ch in first..first + count {
            let zone = station.zone_of(ch);
            let before = self.zones.state(zone);
            let on = mask.get(ch);
            if self.zones.confirm(zone, on) {
                debug!(zone, ?before, on, "zone state confirmed");
                if !on && before.is_on() {
                    self.record(Event::ZoneStopped {
                        zone,
                        reason: StopReason::Reported,
                    });
                }
            }
        }
        Outcome::Handled(FunctionCode::ZonesReport)
    }

    /// A station refused a zone command: the zones that command left
    /// waiting are `Off`.
    fn revert_pending(&mut self, station_id: u8, transaction_id: u8) {
        let Some(zones) = self.in_flight.remove(&(station_id, transaction_id)) else {
            debug!(station = station_id, transaction_id, "error for no outstanding zone command");
            return;
        };
        for zone in zones {
            if let ZoneState::Starting { .. } | ZoneState::Stopping { .. } = self.zones.state(zone) {
                self.zones.force_off(zone);
                self.record(Event::ZoneStopped {
                    zone,
                    reason: StopReason::Rejected,
                });
            }
        }
    }
}
