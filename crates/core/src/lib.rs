//! RProtocol irrigation control: wire codec, radio reliability, zone state
//! and the watering scheduler shared by the hub and node binaries.

pub mod codec;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod mqtt;
pub mod notify;
pub mod registers;
pub mod reliability;
pub mod scheduler;
pub mod sensors;
pub mod store;
pub mod transport;
pub mod valve;
pub mod zones;

pub use codec::{AckFlags, CodecError, EventFlags, Exception, Frame, FunctionCode, Message};
pub use controller::{Controller, Role};
pub use dispatch::{DropReason, Outcome};
pub use scheduler::{Schedule, Scheduler, ZoneActuator};
pub use store::{ConfigStore, MemoryStore};
pub use transport::{MemoryRadio, Transport};
pub use zones::{ZoneRun, ZoneState};
