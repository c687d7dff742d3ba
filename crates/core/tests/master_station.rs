//! Master and station talking over the in-memory radio bus.
#![cfg(not(feature = "gpio"))]

use std::sync::{Arc, Mutex};

use irrigation_core::codec::{
    AckFlags, EventFlags, Exception, Frame, FunctionCode, Message, ZoneMask, STATION_ENABLED,
};
use irrigation_core::controller::{Controller, EventMaster, Role};
use irrigation_core::dispatch::{DropReason, Outcome};
use irrigation_core::notify::{Event, StopReason};
use irrigation_core::registers;
use irrigation_core::sensors::{FixedSensors, NoSensors};
use irrigation_core::store::{MemoryStore, SensorConfig, SensorKind, StationConfig};
use irrigation_core::transport::{
    Addressing, MemoryRadio, MemoryTransport, RadioAddress, Transport, MEMORY_LONG_PREFIX,
};
use irrigation_core::valve::ValveBoard;
use irrigation_core::zones::{ZoneRun, ZoneState};

const MASTER: u8 = 0;
const STATION: u8 = 4;

type Node = Controller<MemoryTransport, MemoryStore>;

struct Net {
    radio: MemoryRadio,
    master: Node,
    station: Node,
    valves: Arc<Mutex<ValveBoard>>,
}

// -- Helpers -----------------------------------------------------------------

fn net(addressing: Addressing) -> Net {
    let radio = MemoryRadio::new();

    let master_store =
        MemoryStore::new(MASTER, 99).with_station(STATION, StationConfig::radio("Orchard", 8, 0));
    let master = Controller::new(
        Role::Requester,
        radio.attach(MASTER, addressing),
        master_store,
        Box::new(ValveBoard::with_channels(0)),
        Box::new(NoSensors),
    );

    let station_store = MemoryStore::new(STATION, 99)
        .with_station(STATION, StationConfig::local("Orchard", 8))
        .with_sensor(SensorConfig {
            kind: SensorKind::Temperature,
            station: STATION,
            channel: 0,
        })
        .with_sensor(SensorConfig {
            kind: SensorKind::Humidity,
            station: STATION,
            channel: 1,
        })
        .with_sensor(SensorConfig {
            kind: SensorKind::Pressure,
            station: STATION,
            channel: 2,
        });
    let valves = Arc::new(Mutex::new(ValveBoard::with_channels(8)));
    let station = Controller::new(
        Role::Responder,
        radio.attach(STATION, addressing),
        station_store,
        Box::new(valves.clone()),
        Box::new(FixedSensors::new(vec![10, 20, 30])),
    );

    Net {
        radio,
        master,
        station,
        valves,
    }
}

/// Last frame a controller handed to its carrier, sequence byte stripped
/// when it went unicast.
fn last_sent(node: &Node) -> (RadioAddress, Frame) {
    let (to, bytes) = node.link().transport().sent().last().cloned().unwrap();
    let frame = if to == RadioAddress::Broadcast {
        &bytes[..]
    } else {
        &bytes[1..]
    };
    (to, Frame::decode(frame).unwrap())
}

fn stop_reasons(node: &mut Node, zone: u8) -> Vec<StopReason> {
    node.take_notifications()
        .into_iter()
        .filter_map(|n| match n.event {
            Event::ZoneStopped { zone: z, reason } if z == zone => Some(reason),
            _ => None,
        })
        .collect()
}

/// Frame from unit 9 to the station, tagged with sequence byte `seq`.
fn from_peer(seq: u8, message: Message) -> Vec<u8> {
    let frame = Frame::new(seq.wrapping_add(1), STATION, 9, message)
        .encode()
        .unwrap();
    [vec![seq], frame].concat()
}

/// Everything the station sent back to unit 9, decoded.
fn replies(peer: &mut MemoryTransport) -> Vec<Message> {
    std::iter::from_fn(|| peer.poll())
        .map(|inbound| Frame::decode(&inbound.payload[1..]).unwrap().message)
        .collect()
}

// -- Zone commands -----------------------------------------------------------

#[test]
fn remote_start_is_confirmed_by_zone_report() {
    let mut net = net(Addressing::Short);

    assert!(net.master.start_zone(ZoneRun::manual(2, 10)));
    assert_eq!(net.master.zone_state(2), ZoneState::Starting { ticks_left: 5 });
    let (to, bytes) = net.master.link().transport().sent()[0].clone();
    assert_eq!(to, RadioAddress::Short(STATION));
    assert_eq!(bytes[0], 0, "first unicast carries sequence 0");

    assert_eq!(
        net.station.poll(),
        Some(Outcome::Handled(FunctionCode::ZonesSet))
    );
    assert_eq!(net.station.zone_state(2), ZoneState::Running);
    assert!(net.valves.lock().unwrap().is_on(2));

    let (to, reply) = last_sent(&net.station);
    assert_eq!(to, RadioAddress::Short(MASTER));
    match reply.message {
        Message::ZonesReport {
            station_flags,
            first,
            count,
            mask,
        } => {
            assert_eq!(station_flags, STATION_ENABLED);
            assert_eq!((first, count), (2, 1));
            assert!(mask.get(2));
            assert_eq!(mask.as_bytes(), &[0b0000_0100]);
        }
        other => panic!("expected zone report, got {other:?}"),
    }

    assert_eq!(
        net.master.poll(),
        Some(Outcome::Handled(FunctionCode::ZonesReport))
    );
    assert_eq!(net.master.zone_state(2), ZoneState::Running);
}

#[test]
fn remote_stop_turns_station_valve_off() {
    let mut net = net(Addressing::Short);
    net.master.start_zone(ZoneRun::manual(2, 10));
    net.station.poll();
    net.master.poll();

    assert!(net.master.stop_zone(2));
    assert_eq!(net.master.zone_state(2), ZoneState::Stopping { ticks_left: 5 });
    net.station.poll();
    assert!(!net.valves.lock().unwrap().is_on(2));
    net.master.poll();
    assert_eq!(net.master.zone_state(2), ZoneState::Off);
}

#[test]
fn lost_command_times_out_exactly_once() {
    let mut net = net(Addressing::Short);
    net.master.link_mut().transport_mut().lose_next(1);

    assert!(net.master.start_zone(ZoneRun::manual(2, 10)));
    assert_eq!(net.station.poll(), None);
    net.master.take_notifications();

    for _ in 0..4 {
        net.master.tick();
        assert!(net.master.zone_state(2).is_pending());
    }
    net.master.tick();
    assert_eq!(net.master.zone_state(2), ZoneState::Off);
    for _ in 0..10 {
        net.master.tick();
    }
    assert_eq!(stop_reasons(&mut net.master, 2), vec![StopReason::Unconfirmed]);
}

#[test]
fn out_of_range_channel_gets_illegal_address() {
    let mut net = net(Addressing::Short);

    assert!(net.master.channel_on(STATION, 9, 5, 0));
    assert_eq!(
        net.station.poll(),
        Some(Outcome::Rejected {
            function: FunctionCode::ZonesSet,
            exception: Exception::IllegalAddress,
        })
    );
    assert_eq!(
        net.master.poll(),
        Some(Outcome::Handled(FunctionCode::ResponseError))
    );
    let (function, exception) = net.master.remote().errors[&STATION];
    assert_eq!(function, FunctionCode::ZonesSet.as_u8());
    assert_eq!(exception.as_u8(), 2);
}

#[test]
fn error_response_reverts_only_the_refused_command() {
    let mut net = net(Addressing::Short);
    let mut fake_station = net.radio.attach(STATION, Addressing::Short);

    assert!(net.master.start_zone(ZoneRun::manual(2, 10)));
    assert!(net.master.start_zone(ZoneRun::manual(5, 10)));
    let (_, first_cmd) = net.master.link().transport().sent()[0].clone();
    let refused_txn = Frame::decode(&first_cmd[1..]).unwrap().transaction_id;
    net.master.take_notifications();

    let error = Frame::new(
        refused_txn,
        MASTER,
        STATION,
        Message::ResponseError {
            function: FunctionCode::ZonesSet.as_u8(),
            exception: Exception::ApplyFailure,
        },
    )
    .encode()
    .unwrap();
    assert!(fake_station.send(RadioAddress::Short(MASTER), &[vec![0u8], error].concat()));

    assert_eq!(
        net.master.poll(),
        Some(Outcome::Handled(FunctionCode::ResponseError))
    );
    assert_eq!(net.master.zone_state(2), ZoneState::Off);
    assert!(net.master.zone_state(5).is_pending());

    let events: Vec<Event> = net
        .master
        .take_notifications()
        .into_iter()
        .map(|n| n.event)
        .collect();
    assert!(events.contains(&Event::ZoneStopped {
        zone: 2,
        reason: StopReason::Rejected,
    }));
    assert!(events.iter().any(|e| matches!(e, Event::Error { .. })));
}

#[test]
fn error_response_reverts_pending_start() {
    let mut net = net(Addressing::Short);
    net.station
        .store_mut()
        .station_mut(STATION)
        .unwrap()
        .remote_control = false;

    net.master.start_zone(ZoneRun::manual(2, 10));
    net.master.take_notifications();
    assert!(matches!(net.station.poll(), Some(Outcome::Rejected { .. })));
    assert!(!net.valves.lock().unwrap().is_on(2));

    net.master.poll();
    assert_eq!(net.master.zone_state(2), ZoneState::Off);
    assert_eq!(stop_reasons(&mut net.master, 2), vec![StopReason::Rejected]);
}

#[test]
fn station_caps_run_time_at_its_maximum() {
    let mut net = net(Addressing::Short);

    assert!(net
        .master
        .write_registers(STATION, registers::MAX_DURATION, vec![30]));
    assert_eq!(
        net.station.poll(),
        Some(Outcome::Handled(FunctionCode::RegistersSet))
    );
    net.master.poll();
    assert_eq!(
        net.master.remote().registers[&(STATION, registers::MAX_DURATION)],
        30
    );

    net.master.channel_on(STATION, 0, 99, 0);
    net.station.poll();
    let status = net.station.zones().status(0).unwrap();
    assert_eq!(status.state, ZoneState::Running);
    assert_eq!(status.remaining_ticks, 30 * 60);
}

#[test]
fn read_only_register_write_fails_with_apply_failure() {
    let mut net = net(Addressing::Short);

    net.master
        .write_registers(STATION, registers::ZONE_COUNT, vec![5]);
    assert_eq!(
        net.station.poll(),
        Some(Outcome::Rejected {
            function: FunctionCode::RegistersSet,
            exception: Exception::ApplyFailure,
        })
    );
    net.master.poll();
    assert_eq!(
        net.master.remote().errors[&STATION],
        (FunctionCode::RegistersSet.as_u8(), Exception::ApplyFailure)
    );
}

#[test]
fn apply_failure_is_logged_at_station() {
    let mut net = net(Addressing::Short);
    net.station.take_notifications();

    net.master
        .write_registers(STATION, registers::ZONE_COUNT, vec![5]);
    net.station.poll();
    assert!(net
        .station
        .take_notifications()
        .iter()
        .any(|n| matches!(n.event, Event::Error { .. })));
}

#[test]
fn controller_start_is_logged() {
    let net = net(Addressing::Short);
    let first = net.station.notifications().last().unwrap();
    assert!(matches!(first.event, Event::System { .. }));
}

#[test]
fn repeated_zone_command_acts_once() {
    let mut net = net(Addressing::Short);
    let mut peer = net.radio.attach(9, Addressing::Short);
    let set = from_peer(
        3,
        Message::ZonesSet {
            flags: AckFlags::STD | AckFlags::BRIEF,
            schedule_id: 0,
            first: 3,
            minutes: 5,
            count: 1,
            mask: ZoneMask::single(3),
        },
    );
    assert!(peer.send(RadioAddress::Short(STATION), &set));
    assert!(peer.send(RadioAddress::Short(STATION), &set));

    assert_eq!(
        net.station.poll(),
        Some(Outcome::Handled(FunctionCode::ZonesSet))
    );
    assert_eq!(net.station.poll(), None);

    assert_eq!(net.station.zone_state(3), ZoneState::Running);
    let valves = net.valves.lock().unwrap();
    assert!(valves.is_on(3));
    assert_eq!(valves.switch_count(), 1);
    drop(valves);

    let answered: Vec<FunctionCode> = replies(&mut peer).iter().map(Message::function).collect();
    assert_eq!(
        answered,
        vec![FunctionCode::ZonesReport, FunctionCode::ResponseOk]
    );
    assert_eq!(net.station.link().link_stats(9).unwrap().duplicates, 1);
}

// -- Reads -------------------------------------------------------------------

#[test]
fn out_of_range_zone_reads_get_illegal_address() {
    let mut net = net(Addressing::Short);
    let mut peer = net.radio.attach(9, Addressing::Short);

    let ranges = [(7, 2), (0, 9), (8, 1), (3, 0), (0, 0), (250, 10)];
    for (seq, (first, count)) in ranges.into_iter().enumerate() {
        let read = from_peer(seq as u8, Message::ZonesRead { first, count });
        assert!(peer.send(RadioAddress::Short(STATION), &read));
        assert_eq!(
            net.station.poll(),
            Some(Outcome::Rejected {
                function: FunctionCode::ZonesRead,
                exception: Exception::IllegalAddress,
            }),
            "range ({first}, {count})"
        );
        assert_eq!(
            replies(&mut peer),
            vec![Message::ResponseError {
                function: FunctionCode::ZonesRead.as_u8(),
                exception: Exception::IllegalAddress,
            }],
            "range ({first}, {count})"
        );
    }
}

#[test]
fn in_range_zone_read_reports() {
    let mut net = net(Addressing::Short);
    let mut peer = net.radio.attach(9, Addressing::Short);

    peer.send(
        RadioAddress::Short(STATION),
        &from_peer(0, Message::ZonesRead { first: 7, count: 1 }),
    );
    assert_eq!(
        net.station.poll(),
        Some(Outcome::Handled(FunctionCode::ZonesRead))
    );
    assert!(matches!(
        replies(&mut peer).as_slice(),
        [Message::ZonesReport { first: 7, count: 1, .. }]
    ));
}

#[test]
fn read_all_sensors_with_magic_count() {
    let mut net = net(Addressing::Short);

    assert!(net.master.poll_sensors(STATION));
    assert_eq!(
        net.station.poll(),
        Some(Outcome::Handled(FunctionCode::SensorsRead))
    );
    match last_sent(&net.station).1.message {
        Message::SensorsReport { first, values } => {
            assert_eq!(first, 0);
            assert_eq!(values, vec![10, 20, 30]);
        }
        other => panic!("expected sensor report, got {other:?}"),
    }

    net.master.poll();
    let sensors = &net.master.remote().sensors;
    assert_eq!(sensors[&(STATION, 0)], 10);
    assert_eq!(sensors[&(STATION, 1)], 20);
    assert_eq!(sensors[&(STATION, 2)], 30);
}

#[test]
fn register_read_reports_station_shape() {
    let mut net = net(Addressing::Short);

    net.master
        .read_registers(STATION, registers::ZONE_COUNT, 4);
    net.station.poll();
    net.master.poll();
    let regs = &net.master.remote().registers;
    assert_eq!(regs[&(STATION, registers::ZONE_COUNT)], 8);
    assert_eq!(regs[&(STATION, registers::TEMPERATURE_SENSORS)], 1);
    assert_eq!(regs[&(STATION, registers::HUMIDITY_SENSORS)], 1);
    assert_eq!(regs[&(STATION, registers::PRESSURE_SENSORS)], 1);
}

// -- Link layer --------------------------------------------------------------

#[test]
fn duplicate_sequence_is_dropped() {
    let mut net = net(Addressing::Short);
    let mut fake = net.radio.attach(STATION, Addressing::Short);

    let ping = |cookie| {
        Frame::new(1, MASTER, STATION, Message::PingReply { cookie })
            .encode()
            .unwrap()
    };
    let with_seq = |seq: u8, frame: Vec<u8>| [vec![seq], frame].concat();

    assert!(fake.send(RadioAddress::Short(MASTER), &with_seq(7, ping(42))));
    assert!(fake.send(RadioAddress::Short(MASTER), &with_seq(7, ping(42))));
    assert!(fake.send(RadioAddress::Short(MASTER), &with_seq(8, ping(43))));

    assert_eq!(
        net.master.poll(),
        Some(Outcome::Handled(FunctionCode::PingReply))
    );
    assert_eq!(net.master.poll(), None);
    assert_eq!(
        net.master.poll(),
        Some(Outcome::Handled(FunctionCode::PingReply))
    );
    assert_eq!(net.master.remote().pings[&STATION], 43);
    assert_eq!(net.master.link().link_stats(STATION).unwrap().duplicates, 1);
}

#[test]
fn address_learned_from_first_reply() {
    let mut net = net(Addressing::Long);

    net.master.start_zone(ZoneRun::manual(2, 10));
    assert_eq!(
        net.master.link().transport().sent()[0].0,
        RadioAddress::Broadcast
    );
    assert_eq!(net.master.link().next_sequence_for(STATION), 0);

    assert_eq!(
        net.station.poll(),
        Some(Outcome::Handled(FunctionCode::ZonesSet))
    );
    // the station learned us from the broadcast and answers directly
    let (to, _) = last_sent(&net.station);
    assert_eq!(to, RadioAddress::Long(MEMORY_LONG_PREFIX | MASTER as u64));

    net.master.poll();
    assert_eq!(
        net.master.link().learned_address(STATION),
        Some(MEMORY_LONG_PREFIX | STATION as u64)
    );

    net.master.stop_zone(2);
    let (to, bytes) = net.master.link().transport().sent().last().cloned().unwrap();
    assert_eq!(to, RadioAddress::Long(MEMORY_LONG_PREFIX | STATION as u64));
    assert_eq!(bytes[0], 0);
}

#[test]
fn frames_for_other_units_are_dropped() {
    let mut net = net(Addressing::Short);
    let mut fake = net.radio.attach(9, Addressing::Short);

    let frame = Frame::new(1, 5, 9, Message::Ping { cookie: 1 })
        .encode()
        .unwrap();
    fake.send(RadioAddress::Short(STATION), &[vec![0u8], frame].concat());
    assert_eq!(
        net.station.poll(),
        Some(Outcome::Dropped(DropReason::NotForUs { to: 5 }))
    );
}

#[test]
fn responder_ignores_reports() {
    let mut net = net(Addressing::Short);
    let mut fake = net.radio.attach(9, Addressing::Short);

    let frame = Frame::new(0, STATION, 9, Message::ScanReply)
        .encode()
        .unwrap();
    fake.send(RadioAddress::Short(STATION), &[vec![0u8], frame].concat());
    assert_eq!(
        net.station.poll(),
        Some(Outcome::Dropped(DropReason::WrongRole(FunctionCode::ScanReply)))
    );
}

// -- Network services --------------------------------------------------------

#[test]
fn scan_discovers_station() {
    let mut net = net(Addressing::Short);

    assert!(net.master.scan());
    assert_eq!(net.station.poll(), Some(Outcome::Handled(FunctionCode::Scan)));
    assert_eq!(
        net.master.poll(),
        Some(Outcome::Handled(FunctionCode::ScanReply))
    );
    assert!(net.master.remote().discovered.contains(&STATION));
}

#[test]
fn ping_echoes_cookie() {
    let mut net = net(Addressing::Short);

    net.master.ping(STATION, 0xDEAD_BEEF);
    net.station.poll();
    net.master.poll();
    assert_eq!(net.master.remote().pings[&STATION], 0xDEAD_BEEF);
}

#[test]
fn time_broadcast_syncs_station_clock() {
    let mut net = net(Addressing::Short);

    assert!(net.master.broadcast_time());
    let (to, frame) = last_sent(&net.master);
    assert_eq!(to, RadioAddress::Broadcast);
    assert!(frame.is_unsolicited());

    assert_eq!(
        net.station.poll(),
        Some(Outcome::Handled(FunctionCode::TimeBroadcast))
    );
    assert!(net.station.registers().clock_offset.abs() <= 1);
    // nothing comes back for a broadcast
    assert_eq!(net.master.poll(), None);
}

// -- Event master ------------------------------------------------------------

#[test]
fn subscribed_master_receives_unsolicited_zone_reports() {
    let mut net = net(Addressing::Short);

    assert!(net.master.subscribe_events(STATION, EventFlags::REPORT_ZONES));
    assert_eq!(
        net.station.poll(),
        Some(Outcome::Handled(FunctionCode::EventMasterSet))
    );
    assert_eq!(
        net.station.event_master(),
        Some(EventMaster {
            station: MASTER,
            address: MASTER as u16,
            events: EventFlags::REPORT_ZONES | EventFlags::REGISTER_SELF,
        })
    );
    net.master.poll();
    assert_eq!(net.master.remote().event_masters[&STATION].station, MASTER);

    // a local start at the station is pushed to the master
    assert!(net.station.start_zone(ZoneRun::manual(1, 5)));
    let (_, pushed) = last_sent(&net.station);
    assert!(pushed.is_unsolicited());
    assert_eq!(pushed.function(), FunctionCode::ZonesReport);

    assert_eq!(
        net.master.poll(),
        Some(Outcome::Handled(FunctionCode::ZonesReport))
    );
    assert_eq!(net.master.zone_state(1), ZoneState::Running);
}

#[test]
fn remote_commands_are_not_echoed_as_unsolicited() {
    let mut net = net(Addressing::Short);
    net.master.subscribe_events(STATION, EventFlags::REPORT_ZONES);
    net.station.poll();
    net.master.poll();
    let before = net.station.link().transport().sent().len();

    net.master.start_zone(ZoneRun::manual(3, 5));
    net.station.poll();
    // only the solicited report
    assert_eq!(net.station.link().transport().sent().len(), before + 1);
    assert!(!last_sent(&net.station).1.is_unsolicited());
}
