//! Station side: serve requests addressed to this unit.
//!
//! Every request is checked in the same order: the station may be
//! addressed at all, the requested range exists, the change applies. Only
//! then are acknowledgements sent, as the request's flags ask.

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::{resolve_range, Outcome};
use crate::codec::{AckFlags, EventFlags, Exception, Frame, Message};
use crate::controller::{Controller, EventMaster, Origin};
use crate::notify::Event;
use crate::store::{ConfigStore, StationConfig};
use crate::transport::Transport;
use crate::zones::ZoneRun;

#[derive(Clone, Copy)]
enum Access {
    Status,
    Control,
}

impl<T: Transport, S: ConfigStore> Controller<T, S> {
    pub(super) fn serve(&mut self, req: &Frame) -> Outcome {
        debug!(from = req.from, txn = req.transaction_id, function = ?req.function(), "request");
        match &req.message {
            Message::ZonesRead { first, count } => self.serve_zones_read(req, *first, *count),
            Message::ZonesSet {
                flags,
                schedule_id,
                first,
                minutes,
                count,
                mask,
            } => {
                let (flags, schedule_id, first, minutes, count) =
                    (*flags, *schedule_id, *first, *minutes, *count);
                let channels: Vec<u8> = (first..first.saturating_add(count))
                    .filter(|ch| mask.get(*ch))
                    .collect();
                self.serve_zones_set(req, flags, schedule_id, first, minutes, count, &channels)
            }
            Message::SensorsRead { first, count } => self.serve_sensors_read(req, *first, *count),
            Message::RegistersRead { first, count } => {
                self.serve_registers_read(req, *first, *count)
            }
            Message::RegistersSet {
                flags,
                first,
                values,
            } => self.serve_registers_set(req, *flags, *first, values),
            Message::EventMasterRead => {
                let report = self.event_master_report();
                self.reply(req, report);
                Outcome::Handled(req.function())
            }
            Message::EventMasterSet {
                flags,
                events,
                master_id,
                master_address,
            } => self.serve_event_master_set(req, *flags, *events, *master_id, *master_address),
            Message::Ping { cookie } => {
                self.reply(req, Message::PingReply { cookie: *cookie });
                Outcome::Handled(req.function())
            }
            Message::Scan => {
                info!(from = req.from, "answering scan");
                self.reply(req, Message::ScanReply);
                Outcome::Handled(req.function())
            }
            Message::TimeBroadcast { time } => {
                let system_now = OffsetDateTime::now_utc().unix_timestamp();
                self.registers.clock_offset = *time as i64 - system_now;
                debug!(time, offset = self.registers.clock_offset, "clock synchronised");
                Outcome::Handled(req.function())
            }
            // is_request() keeps reports out of here
            _ => Outcome::Handled(req.function()),
        }
    }

    /// Reject `req`. The error response goes out only when `send` is set.
    fn reject(&mut self, req: &Frame, exception: Exception, send: bool) -> Outcome {
        let function = req.function();
        warn!(from = req.from, ?function, ?exception, "request rejected");
        if exception == Exception::ApplyFailure {
            self.record(Event::Error {
                detail: format!("{function:?} from station {} could not be applied", req.from),
            });
        }
        if send {
            self.reply(
                req,
                Message::ResponseError {
                    function: function.as_u8(),
                    exception,
                },
            );
        }
        Outcome::Rejected {
            function,
            exception,
        }
    }

    /// Our own station config, if remote peers may use it for `access`.
    fn addressable_station(&self, access: Access) -> Option<StationConfig> {
        let station = self.enabled_station(self.unit_id())?;
        let allowed = match access {
            Access::Status => station.remote_status,
            Access::Control => station.remote_control,
        };
        allowed.then_some(station)
    }

    fn serve_zones_read(&mut self, req: &Frame, first: u8, count: u8) -> Outcome {
        let Some(station) = self.addressable_station(Access::Status) else {
            return self.reject(req, Exception::IllegalAddress, true);
        };
        let Some((first, count)) = resolve_range(first, count, station.zone_count) else {
            return self.reject(req, Exception::IllegalAddress, true);
        };
        let report = self.zones_report(&station, first, count);
        self.reply(req, report);
        Outcome::Handled(req.function())
    }

    #[allow(clippy::too_many_arguments)]
    fn serve_zones_set(
        &mut self,
        req: &Frame,
        flags: AckFlags,
        schedule_id: u8,
        first: u8,
        minutes: u8,
        count: u8,
        channels: &[u8],
    ) -> Outcome {
        let send_error = flags.contains(AckFlags::ERROR);
        let Some(station) = self.addressable_station(Access::Control) else {
            return self.reject(req, Exception::IllegalAddress, send_error);
        };
        if resolve_range(first, count, station.zone_count).is_none() || count == crate::codec::ALL {
            return self.reject(req, Exception::IllegalAddress, send_error);
        }

        for &ch in channels {
            let zone = station.zone_of(ch);
            let applied = if minutes == 0 {
                self.stop_zone_from(zone, Origin::Remote)
            } else {
                let run = ZoneRun {
                    schedule: (schedule_id != 0).then_some(schedule_id),
                    ..ZoneRun::manual(zone, minutes)
                };
                self.start_zone_from(run, Origin::Remote)
            };
            if !applied {
                return self.reject(req, Exception::ApplyFailure, send_error);
            }
        }

        if flags.contains(AckFlags::REPORT) {
            let report = self.zones_report(&station, first, count);
            self.reply(req, report);
        }
        if flags.contains(AckFlags::BRIEF) {
            self.reply(
                req,
                Message::ResponseOk {
                    function: req.function().as_u8(),
                },
            );
        }
        Outcome::Handled(req.function())
    }

    fn serve_sensors_read(&mut self, req: &Frame, first: u8, count: u8) -> Outcome {
        if self.addressable_station(Access::Status).is_none() {
            return self.reject(req, Exception::IllegalAddress, true);
        }
        let Some((first, count)) = resolve_range(first, count, self.sensors.count()) else {
            return self.reject(req, Exception::IllegalAddress, true);
        };
        let values = (first..first + count).map(|i| self.sensors.read(i)).collect();
        self.reply(req, Message::SensorsReport { first, values });
        Outcome::Handled(req.function())
    }

    fn serve_registers_read(&mut self, req: &Frame, first: u8, count: u8) -> Outcome {
        let ctx = self.register_context();
        let limit = ctx.register_count().min(u8::MAX as usize) as u8;
        let Some((first, count)) = resolve_range(first, count, limit) else {
            return self.reject(req, Exception::IllegalAddress, true);
        };
        let configured_max = self.store.max_run_duration();
        let values = (first..first + count)
            .map(|addr| self.registers.read(addr, &ctx, configured_max))
            .collect();
        self.reply(req, Message::RegistersReport { first, values });
        Outcome::Handled(req.function())
    }

    fn serve_registers_set(
        &mut self,
        req: &Frame,
        flags: AckFlags,
        first: u8,
        values: &[u16],
    ) -> Outcome {
        let send_error = flags.contains(AckFlags::ERROR);
        let limit = self.register_context().register_count().min(u8::MAX as usize);
        if values.is_empty() || first as usize + values.len() > limit {
            return self.reject(req, Exception::IllegalAddress, send_error);
        }

        let system_now = OffsetDateTime::now_utc().unix_timestamp();
        for (i, value) in values.iter().enumerate() {
            let addr = first + i as u8;
            if !self.registers.write(addr, *value, system_now) {
                return self.reject(req, Exception::ApplyFailure, send_error);
            }
            info!(register = addr, value, "register written");
        }

        if flags.contains(AckFlags::REPORT) {
            let ctx = self.register_context();
            let configured_max = self.store.max_run_duration();
            let values = (first..first + values.len() as u8)
                .map(|addr| self.registers.read(addr, &ctx, configured_max))
                .collect();
            self.reply(req, Message::RegistersReport { first, values });
        }
        if flags.contains(AckFlags::BRIEF) {
            self.reply(
                req,
                Message::ResponseOk {
                    function: req.function().as_u8(),
                },
            );
        }
        Outcome::Handled(req.function())
    }

    fn event_master_report(&self) -> Message {
        let master = self.event_master.unwrap_or(EventMaster {
            station: 0,
            address: 0,
            events: EventFlags::NONE,
        });
        Message::EventMasterReport {
            events: master.events,
            master_id: master.station,
            master_address: master.address,
        }
    }

    fn serve_event_master_set(
        &mut self,
        req: &Frame,
        flags: AckFlags,
        events: EventFlags,
        master_id: u8,
        master_address: u16,
    ) -> Outcome {
        let master = if events.contains(EventFlags::REGISTER_SELF) {
            EventMaster {
                station: req.from,
                address: req.from as u16,
                events,
            }
        } else {
            EventMaster {
                station: master_id,
                address: master_address,
                events,
            }
        };
        info!(master = master.station, events = master.events.bits(), "event master registered");
        self.event_master = Some(master);

        if flags.contains(AckFlags::REPORT) {
            let report = self.event_master_report();
            self.reply(req, report);
        }
        if flags.contains(AckFlags::BRIEF) {
            self.reply(
                req,
                Message::ResponseOk {
                    function: req.function().as_u8(),
                },
            );
        }
        Outcome::Handled(req.function())
    }
}
