#[cfg(feature = "sim")]
mod sim;

use std::{env, time::Duration};

use anyhow::{bail, Result};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use irrigation_core::config;
use irrigation_core::controller::{Controller, Role};
use irrigation_core::mqtt::{BridgeOptions, MqttTransport};
use irrigation_core::store::{ConfigStore, SensorKind};
use irrigation_core::valve::{ValveBoard, ValveDriver};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "192.168.1.10".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let network = env::var("RF_NETWORK").unwrap_or_else(|_| "irrigation".to_string());
    let poll_ms: u64 = env::var("TICK_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let store = cfg.store();
    let me = cfg.station_id;
    let Some(station) = store.load_station(me) else {
        bail!("station {me} is not defined in {config_path}");
    };
    info!(station = me, name = %station.name, zones = station.zone_count, "config loaded");

    let mut kinds: Vec<(u8, SensorKind)> = store
        .sensors()
        .into_iter()
        .filter(|s| s.station == me)
        .map(|s| (s.channel, s.kind))
        .collect();
    kinds.sort_by_key(|(channel, _)| *channel);
    let kinds: Vec<SensorKind> = kinds.into_iter().map(|(_, kind)| kind).collect();

    // ── Hardware ────────────────────────────────────────────────────
    let mut valves = ValveBoard::new(&cfg.valve_channels(), active_low)?;
    valves.all_off();
    let sensors = bank::new(&kinds);

    // ── Radio + controller ──────────────────────────────────────────
    let transport = MqttTransport::connect(BridgeOptions {
        client_id: format!("irrigation-node-{me}"),
        host: broker,
        port,
        network,
        address: me,
    });
    let mut controller = Controller::new(
        Role::Responder,
        transport,
        store,
        Box::new(valves),
        sensors.boxed(),
    );

    let mut poll = interval(Duration::from_millis(poll_ms.max(1)));
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut second = interval(Duration::from_secs(1));
    second.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if let Some(outcome) = controller.poll() {
                    debug!(?outcome, "frame processed");
                }
            }
            _ = second.tick() => {
                sensors.set_watering(controller.zones().active().next().is_some());
                controller.tick();
                for n in controller.take_notifications() {
                    debug!(event = ?n.event, "notification");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sensor bank
// ---------------------------------------------------------------------------

#[cfg(feature = "sim")]
mod bank {
    use std::sync::{Arc, Mutex};

    use irrigation_core::registers::SENSOR_CYCLE_SECS;
    use irrigation_core::sensors::SensorSource;
    use irrigation_core::store::SensorKind;
    use tracing::info;

    use crate::sim::{Scenario, SimSensors};

    /// Simulated sensors shared between the controller and the main loop,
    /// which feeds valve state back into the simulation.
    pub struct Bank(Arc<Mutex<SimSensors>>);

    pub fn new(kinds: &[SensorKind]) -> Bank {
        let scenario = Scenario::from_str_lossy(&std::env::var("SIM_SCENARIO").unwrap_or_default());
        let period_s: f64 = std::env::var("SIM_DIURNAL_PERIOD_S")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(86_400.0);
        info!(%scenario, channels = kinds.len(), "simulated sensors");
        Bank(Arc::new(Mutex::new(SimSensors::new(
            scenario,
            kinds,
            SENSOR_CYCLE_SECS as u32,
            period_s,
        ))))
    }

    impl Bank {
        pub fn boxed(&self) -> Box<dyn SensorSource> {
            Box::new(self.0.clone())
        }

        pub fn set_watering(&self, active: bool) {
            if let Ok(mut sim) = self.0.lock() {
                sim.set_watering(active);
            }
        }
    }
}

#[cfg(not(feature = "sim"))]
mod bank {
    use irrigation_core::sensors::{NoSensors, SensorSource};
    use irrigation_core::store::SensorKind;
    use tracing::warn;

    pub struct Bank;

    pub fn new(kinds: &[SensorKind]) -> Bank {
        if !kinds.is_empty() {
            warn!(channels = kinds.len(), "no sensor hardware support built in, reporting none");
        }
        Bank
    }

    impl Bank {
        pub fn boxed(&self) -> Box<dyn SensorSource> {
            Box::new(NoSensors)
        }

        pub fn set_watering(&self, _active: bool) {}
    }
}
