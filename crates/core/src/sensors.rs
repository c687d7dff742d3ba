//! Local sensor inputs.

/// Raw readings from sensors wired to this controller. Values are opaque
/// 16-bit words; their scale is fixed per sensor kind by the station.
pub trait SensorSource {
    fn count(&self) -> u8;
    fn read(&mut self, index: u8) -> u16;

    /// Take a fresh sample. Returns `true` when readings may have changed.
    fn sample(&mut self) -> bool {
        false
    }
}

/// A controller with no local sensors.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSensors;

impl SensorSource for NoSensors {
    fn count(&self) -> u8 {
        0
    }

    fn read(&mut self, _index: u8) -> u16 {
        0
    }
}

/// Fixed readings, settable from outside.
#[derive(Debug, Default, Clone)]
pub struct FixedSensors {
    values: Vec<u16>,
    dirty: bool,
}

impl FixedSensors {
    pub fn new(values: Vec<u16>) -> Self {
        Self {
            values,
            dirty: false,
        }
    }

    pub fn set(&mut self, index: u8, value: u16) {
        if let Some(v) = self.values.get_mut(index as usize) {
            if *v != value {
                *v = value;
                self.dirty = true;
            }
        }
    }
}

impl SensorSource for FixedSensors {
    fn count(&self) -> u8 {
        self.values.len().min(u8::MAX as usize) as u8
    }

    fn read(&mut self, index: u8) -> u16 {
        self.values.get(index as usize).copied().unwrap_or(0)
    }

    fn sample(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl<S: SensorSource + ?Sized> SensorSource for std::sync::Arc<std::sync::Mutex<S>> {
    fn count(&self) -> u8 {
        self.lock().map_or(0, |s| s.count())
    }

    fn read(&mut self, index: u8) -> u16 {
        self.lock().map_or(0, |mut s| s.read(index))
    }

    fn sample(&mut self) -> bool {
        self.lock().map_or(false, |mut s| s.sample())
    }
}
