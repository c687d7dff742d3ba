//! Simulated sensor bank for running a station without hardware.
//!
//! Models plausible weather-sensor behaviour:
//! - Temporal coherence via random walk with mean reversion
//! - Diurnal (day/night) cycle
//! - Per-reading electronic noise and occasional spikes
//! - Per-sensor calibration offsets
//! - Humidity rising while any of the station's valves are open
//!
//! Readings are fixed-point words: temperature and humidity in tenths
//! (°C, %RH), pressure in tenths of a hectopascal.

use std::fmt;

use irrigation_core::sensors::SensorSource;
use irrigation_core::store::SensorKind;
use time::OffsetDateTime;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Humidity drifts down through the day. Moderate noise, ~3% spikes.
    Drying,
    /// Everything hovers near its baseline. Low noise, rare spikes.
    Stable,
    /// High noise, ~10% spike rate. Exercises change detection.
    Flaky,
    /// Starts humid and stays there.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-kind physics
// ---------------------------------------------------------------------------

struct Profile {
    center: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    /// Peak swing of the day/night cycle, peaking mid-afternoon.
    diurnal_amplitude: f64,
    min: f64,
    max: f64,
}

fn profile(kind: SensorKind) -> Profile {
    match kind {
        SensorKind::Temperature => Profile {
            center: 200.0,
            walk_sigma: 3.0,
            mean_reversion: 0.05,
            noise_sigma: 2.0,
            diurnal_amplitude: 60.0,
            min: 0.0,
            max: 600.0,
        },
        SensorKind::Humidity => Profile {
            center: 550.0,
            walk_sigma: 8.0,
            mean_reversion: 0.03,
            noise_sigma: 5.0,
            diurnal_amplitude: -80.0,
            min: 0.0,
            max: 1000.0,
        },
        SensorKind::Pressure => Profile {
            center: 10130.0,
            walk_sigma: 2.0,
            mean_reversion: 0.02,
            noise_sigma: 1.0,
            diurnal_amplitude: 10.0,
            min: 9500.0,
            max: 10500.0,
        },
    }
}

/// Internal state for a single simulated channel.
struct Channel {
    kind: SensorKind,
    /// Current "true" value. Evolves each sample.
    base: f64,
    /// Permanent calibration offset.
    offset: f64,
    last: u16,
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct SimSensors {
    channels: Vec<Channel>,
    humidity_drift: f64,
    noise_scale: f64,
    spike_prob: f32,
    /// Ticks between samples.
    cycle_ticks: u32,
    ticks: u32,
    diurnal_period_s: f64,
    watering: bool,
    wet_rate: f64,
}

impl SimSensors {
    /// One channel per entry of `kinds`, in channel order. A fresh sample
    /// is taken every `cycle_ticks` calls to [`SensorSource::sample`].
    pub fn new(scenario: Scenario, kinds: &[SensorKind], cycle_ticks: u32, diurnal_period_s: f64) -> Self {
        let (humidity_drift, noise_scale, spike_prob, humidity_start) = match scenario {
            Scenario::Drying => (-2.0, 1.0, 0.03_f32, 0.0),
            Scenario::Stable => (0.0, 0.5, 0.005, 0.0),
            Scenario::Flaky => (-1.0, 2.5, 0.10, 0.0),
            Scenario::Wet => (0.5, 0.75, 0.02, 250.0),
        };

        let channels = kinds
            .iter()
            .map(|&kind| {
                let p = profile(kind);
                let start = if kind == SensorKind::Humidity {
                    p.center + humidity_start
                } else {
                    p.center
                };
                let base = (start + gaussian(0.0, p.walk_sigma * 3.0)).clamp(p.min, p.max);
                Channel {
                    kind,
                    base,
                    offset: gaussian(0.0, p.noise_sigma * 2.0),
                    last: base.round() as u16,
                }
            })
            .collect();

        Self {
            channels,
            humidity_drift,
            noise_scale,
            spike_prob,
            cycle_ticks: cycle_ticks.max(1),
            ticks: 0,
            diurnal_period_s,
            watering: false,
            wet_rate: 15.0,
        }
    }

    /// Inform the simulator whether a valve is currently open.
    pub fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }

    fn step(&mut self) {
        let now_s = OffsetDateTime::now_utc().unix_timestamp() as f64;
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;

        for ch in &mut self.channels {
            let p = profile(ch.kind);

            // -- Evolve the base value --------------------------------------
            let pull = p.mean_reversion * (p.center - ch.base);
            let walk = gaussian(0.0, p.walk_sigma);
            let (drift, wet) = if ch.kind == SensorKind::Humidity {
                (
                    self.humidity_drift,
                    if self.watering { self.wet_rate } else { 0.0 },
                )
            } else {
                (0.0, 0.0)
            };
            ch.base = (ch.base + pull + walk + drift + wet).clamp(p.min, p.max);

            // -- Build the instantaneous reading ----------------------------
            let diurnal = p.diurnal_amplitude * phase.sin();
            let noise = gaussian(0.0, p.noise_sigma * self.noise_scale);
            let spike = if fastrand::f32() < self.spike_prob {
                gaussian(0.0, p.noise_sigma * 20.0)
            } else {
                0.0
            };
            let reading = ch.base + ch.offset + diurnal + noise + spike;
            ch.last = reading.round().clamp(p.min, p.max) as u16;
        }
    }
}

impl SensorSource for SimSensors {
    fn count(&self) -> u8 {
        self.channels.len().min(u8::MAX as usize) as u8
    }

    fn read(&mut self, index: u8) -> u16 {
        self.channels.get(index as usize).map_or(0, |c| c.last)
    }

    fn sample(&mut self) -> bool {
        self.ticks += 1;
        if self.ticks < self.cycle_ticks {
            return false;
        }
        self.ticks = 0;
        self.step();
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SensorKind; 3] = [
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::Pressure,
    ];

    fn humidity_average(sim: &mut SimSensors, n: usize) -> f64 {
        (0..n)
            .map(|_| {
                sim.sample();
                sim.read(0) as f64
            })
            .sum::<f64>()
            / n as f64
    }

    #[test]
    fn readings_stay_in_physical_range() {
        let mut sim = SimSensors::new(Scenario::Flaky, &ALL, 1, 600.0);
        for _ in 0..500 {
            assert!(sim.sample());
            assert!(sim.read(0) <= 600);
            assert!(sim.read(1) <= 1000);
            assert!((9500..=10500).contains(&sim.read(2)));
        }
    }

    #[test]
    fn samples_once_per_cycle() {
        let mut sim = SimSensors::new(Scenario::Stable, &ALL, 3, 600.0);
        assert!(!sim.sample());
        assert!(!sim.sample());
        assert!(sim.sample());
        assert!(!sim.sample());
    }

    #[test]
    fn unknown_channel_reads_zero() {
        let mut sim = SimSensors::new(Scenario::Stable, &ALL, 1, 600.0);
        assert_eq!(sim.count(), 3);
        assert_eq!(sim.read(7), 0);
    }

    #[test]
    fn watering_raises_humidity() {
        let mut sim = SimSensors::new(Scenario::Drying, &[SensorKind::Humidity], 1, 86_400.0);
        let before = humidity_average(&mut sim, 20);

        sim.set_watering(true);
        for _ in 0..50 {
            sim.sample();
        }
        let after = humidity_average(&mut sim, 20);

        assert!(
            after > before,
            "watering should raise humidity: before={before:.0} after={after:.0}"
        );
    }

    #[test]
    fn wet_scenario_starts_humid() {
        let sim = SimSensors::new(Scenario::Wet, &[SensorKind::Humidity], 1, 600.0);
        assert!(sim.channels[0].base > profile(SensorKind::Humidity).center);
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("drying"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Drying.to_string(), "drying");
        assert_eq!(Scenario::Wet.to_string(), "wet");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal()).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
