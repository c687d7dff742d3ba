//! Local valve outputs. The `gpio` feature gates the real rppal driver;
//! without it, a mock board records channel state and logs changes.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{info, warn};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Drives the valves of locally wired stations. Channels are
/// `station network address + zone channel`.
pub trait ValveDriver {
    /// `false` when the channel is not wired.
    fn set(&mut self, channel: u16, on: bool) -> bool;
    fn all_off(&mut self);
}

// ---------------------------------------------------------------------------
// Real GPIO valve board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct ValveBoard {
    pins: HashMap<u16, OutputPin>,
    active_low: bool, // most relay boards are active-low
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub fn new(channel_to_gpio: &[(u16, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (channel, pin_num) in channel_to_gpio {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // start with every relay released
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.insert(*channel, pin);
        }
        info!(channels = pins.len(), active_low, "valve board initialised");

        Ok(Self { pins, active_low })
    }
}

#[cfg(feature = "gpio")]
impl ValveDriver for ValveBoard {
    fn set(&mut self, channel: u16, on: bool) -> bool {
        let Some(pin) = self.pins.get_mut(&channel) else {
            warn!(channel, "no valve wired to channel");
            return false;
        };
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(channel, on, "valve set");
        true
    }

    fn all_off(&mut self) {
        let channels: Vec<u16> = self.pins.keys().copied().collect();
        for ch in channels {
            self.set(ch, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock valve board (no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct ValveBoard {
    channels: HashMap<u16, bool>,
    switched: usize,
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub fn new(channel_to_gpio: &[(u16, u8)], _active_low: bool) -> Result<Self> {
        let mut channels = HashMap::new();
        for (channel, pin_num) in channel_to_gpio {
            tracing::debug!(channel, gpio = pin_num, "mock valve registered");
            channels.insert(*channel, false);
        }
        info!(channels = channels.len(), "mock valve board initialised (no hardware)");
        Ok(Self {
            channels,
            switched: 0,
        })
    }

    /// Mock board with channels `0..count`, all off.
    pub fn with_channels(count: u16) -> Self {
        Self {
            channels: (0..count).map(|c| (c, false)).collect(),
            switched: 0,
        }
    }

    pub fn is_on(&self, channel: u16) -> bool {
        self.channels.get(&channel).copied().unwrap_or(false)
    }

    /// Successful `set` calls so far.
    pub fn switch_count(&self) -> usize {
        self.switched
    }
}

#[cfg(not(feature = "gpio"))]
impl ValveDriver for ValveBoard {
    fn set(&mut self, channel: u16, on: bool) -> bool {
        match self.channels.get_mut(&channel) {
            Some(state) => {
                *state = on;
                self.switched += 1;
                info!(channel, on, "[mock] valve set");
                true
            }
            None => {
                warn!(channel, "[mock] no valve wired to channel");
                false
            }
        }
    }

    fn all_off(&mut self) {
        for state in self.channels.values_mut() {
            *state = false;
        }
    }
}

/// Shares one board between the controller and an observer (tests, status
/// reporting).
impl<V: ValveDriver + ?Sized> ValveDriver for std::sync::Arc<std::sync::Mutex<V>> {
    fn set(&mut self, channel: u16, on: bool) -> bool {
        match self.lock() {
            Ok(mut board) => board.set(channel, on),
            Err(_) => false,
        }
    }

    fn all_off(&mut self) {
        if let Ok(mut board) = self.lock() {
            board.all_off();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
