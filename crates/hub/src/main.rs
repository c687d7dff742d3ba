mod commands;

use std::{env, time::Duration};

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use time::UtcOffset;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_core::codec::EventFlags;
use irrigation_core::config;
use irrigation_core::controller::{Controller, Role};
use irrigation_core::mqtt::{BridgeOptions, MqttTransport};
use irrigation_core::scheduler::Scheduler;
use irrigation_core::sensors::NoSensors;
use irrigation_core::store::{ConfigStore, MemoryStore};
use irrigation_core::valve::{ValveBoard, ValveDriver};
use irrigation_core::zones::ZoneRun;

use commands::{parse_command, Command, COMMAND_TOPICS, EVENTS_TOPIC};

type Hub = Controller<MqttTransport, MemoryStore>;

/// Minutes between event subscriptions, so restarted stations pick us up.
const RESUBSCRIBE_EVERY_MIN: u8 = 15;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let network = env::var("RF_NETWORK").unwrap_or_else(|_| "irrigation".to_string());
    let poll_ms: u64 = env::var("TICK_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let store = cfg.store();
    info!(
        station = cfg.station_id,
        stations = store.station_ids().len(),
        zones = store.zone_count(),
        schedules = cfg.schedules.len(),
        "config loaded"
    );

    // ── Valve board ─────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);
    let mut valves = ValveBoard::new(&cfg.valve_channels(), active_low)?;
    valves.all_off();

    // ── Radio + controller ──────────────────────────────────────────
    let transport = MqttTransport::connect(BridgeOptions {
        client_id: format!("irrigation-hub-rf-{}", cfg.station_id),
        host: broker.clone(),
        port,
        network,
        address: cfg.station_id,
    });
    let mut controller = Controller::new(
        Role::Gateway,
        transport,
        store,
        Box::new(valves),
        Box::new(NoSensors),
    );
    let mut scheduler = Scheduler::new(cfg.schedules(), cfg.schedules_enabled, cfg.seasonal_adjust);
    let offset = cfg.utc_offset();

    // ── Command channel ─────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("irrigation-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    discover(&mut controller);

    let mut poll = interval(Duration::from_millis(poll_ms.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut second = interval(Duration::from_secs(1));
    second.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_minute: Option<u8> = None;

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if let Some(outcome) = controller.poll() {
                    debug!(?outcome, "frame processed");
                }
            }
            _ = second.tick() => {
                controller.tick();
                let now = controller.now().to_offset(offset);
                scheduler.tick(now, &mut controller);

                if last_minute != Some(now.minute()) {
                    last_minute = Some(now.minute());
                    if !controller.broadcast_time() {
                        warn!("time broadcast not sent");
                    }
                    if now.minute() % RESUBSCRIBE_EVERY_MIN == 0 {
                        subscribe_stations(&mut controller);
                    }
                }
                publish_notifications(&client, &mut controller);
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    handle_command(&p.topic, &p.payload, &mut controller, &mut scheduler, offset);
                    publish_notifications(&client, &mut controller);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    for topic in COMMAND_TOPICS {
                        if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                            warn!(topic, error = %e, "subscribe failed");
                        }
                    }
                    info!(topics = ?COMMAND_TOPICS, "hub subscribed");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, reconnecting");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

/// Find stations on the radio network and ask each configured remote
/// station to push its zone and sensor changes to us.
fn discover(controller: &mut Hub) {
    if !controller.scan() {
        warn!("scan not sent");
    }
    subscribe_stations(controller);
}

fn subscribe_stations(controller: &mut Hub) {
    let me = controller.unit_id();
    for id in controller.store().station_ids() {
        let Some(station) = controller.store().load_station(id) else {
            continue;
        };
        if id == me || !station.enabled || station.network.is_local() {
            continue;
        }
        let events = EventFlags::REPORT_ZONES | EventFlags::REPORT_SENSORS;
        if controller.subscribe_events(id, events) {
            debug!(station = id, "event subscription sent");
        } else {
            warn!(station = id, "event subscription not sent");
        }
    }
}

fn handle_command(
    topic: &str,
    payload: &[u8],
    controller: &mut Hub,
    scheduler: &mut Scheduler,
    offset: UtcOffset,
) {
    let command = match parse_command(topic, payload) {
        Ok(command) => command,
        Err(msg) => {
            warn!(topic, "{msg}");
            return;
        }
    };
    info!(?command, "manual command");
    match command {
        Command::ZoneOn { zone, minutes } => {
            if !controller.start_zone(ZoneRun::manual(zone, minutes)) {
                warn!(zone, "zone did not start");
            }
        }
        Command::ZoneOff { zone } => {
            if !controller.stop_zone(zone) {
                warn!(zone, "zone did not stop");
            }
        }
        Command::StopAll => scheduler.stop(controller),
        Command::QuickRun { durations } => {
            let now = controller.now().to_offset(offset);
            scheduler.run_quick(durations, now, controller);
        }
    }
}

fn publish_notifications(client: &AsyncClient, controller: &mut Hub) {
    for notification in controller.take_notifications() {
        let payload = match serde_json::to_vec(&notification) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "notification not serializable");
                continue;
            }
        };
        if let Err(e) = client.try_publish(EVENTS_TOPIC, QoS::AtLeastOnce, false, payload) {
            warn!(error = %e, "notification publish failed");
        }
    }
}
