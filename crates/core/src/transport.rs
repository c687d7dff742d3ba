//! Radio carrier seam.
//!
//! A [`Transport`] moves opaque byte frames between stations. It knows
//! nothing about the protocol: the reliability layer is its only caller.
//! [`MemoryRadio`] is an in-process bus used by tests and simulations; the
//! MQTT-backed carrier lives in [`crate::mqtt`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

/// Carrier-level address of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioAddress {
    Broadcast,
    /// Carriers whose addresses are the protocol unit id.
    Short(u8),
    /// Carriers with independent hardware addresses (learned by ARP).
    Long(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Short,
    Long,
}

/// A raw frame as delivered by the carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub payload: Vec<u8>,
    pub sender: RadioAddress,
    /// Signal-strength hint; 0 when the carrier has none.
    pub rssi: u8,
    pub broadcast: bool,
}

pub trait Transport {
    fn addressing(&self) -> Addressing;

    /// Hand a frame to the carrier. `false` when it was not accepted.
    fn send(&mut self, to: RadioAddress, payload: &[u8]) -> bool;

    /// Next received frame, without blocking.
    fn poll(&mut self) -> Option<Inbound>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn addressing(&self) -> Addressing {
        (**self).addressing()
    }

    fn send(&mut self, to: RadioAddress, payload: &[u8]) -> bool {
        (**self).send(to, payload)
    }

    fn poll(&mut self) -> Option<Inbound> {
        (**self).poll()
    }
}

// ---------------------------------------------------------------------------
// In-memory bus
// ---------------------------------------------------------------------------

/// Long addresses handed out by [`MemoryRadio`] are this prefix plus the
/// short id, which keeps them obviously distinct from unit ids.
pub const MEMORY_LONG_PREFIX: u64 = 0x0013_A200_0000_0000;

struct Endpoint {
    long: u64,
    tx: mpsc::UnboundedSender<Inbound>,
}

/// Shared in-process medium. Clone it to hand the same bus to several
/// stations.
#[derive(Clone, Default)]
pub struct MemoryRadio {
    endpoints: Arc<Mutex<HashMap<u8, Endpoint>>>,
}

impl MemoryRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a station to the bus. Re-attaching an id replaces the old
    /// endpoint.
    pub fn attach(&self, id: u8, addressing: Addressing) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        let long = MEMORY_LONG_PREFIX | id as u64;
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.insert(id, Endpoint { long, tx });
        }
        MemoryTransport {
            bus: self.clone(),
            id,
            long,
            addressing,
            rx,
            link_up: true,
            lose_next: 0,
            sent: Vec::new(),
        }
    }

    fn deliver(&self, from: u8, to: RadioAddress, inbound: Inbound) -> bool {
        let Ok(endpoints) = self.endpoints.lock() else {
            return false;
        };
        match to {
            RadioAddress::Broadcast => {
                for (id, ep) in endpoints.iter() {
                    if *id != from {
                        let _ = ep.tx.send(inbound.clone());
                    }
                }
                true
            }
            RadioAddress::Short(addr) => endpoints
                .get(&addr)
                .is_some_and(|ep| ep.tx.send(inbound).is_ok()),
            RadioAddress::Long(addr) => endpoints
                .values()
                .find(|ep| ep.long == addr)
                .is_some_and(|ep| ep.tx.send(inbound).is_ok()),
        }
    }
}

/// One station's view of a [`MemoryRadio`].
pub struct MemoryTransport {
    bus: MemoryRadio,
    id: u8,
    long: u64,
    addressing: Addressing,
    rx: mpsc::UnboundedReceiver<Inbound>,
    link_up: bool,
    lose_next: usize,
    sent: Vec<(RadioAddress, Vec<u8>)>,
}

impl MemoryTransport {
    pub fn long_address(&self) -> u64 {
        self.long
    }

    /// While down, every send is refused.
    pub fn set_link_up(&mut self, up: bool) {
        self.link_up = up;
    }

    /// Accept the next `n` sends but never deliver them.
    pub fn lose_next(&mut self, n: usize) {
        self.lose_next = n;
    }

    /// Everything accepted for sending so far, oldest first.
    pub fn sent(&self) -> &[(RadioAddress, Vec<u8>)] {
        &self.sent
    }
}

impl Transport for MemoryTransport {
    fn addressing(&self) -> Addressing {
        self.addressing
    }

    fn send(&mut self, to: RadioAddress, payload: &[u8]) -> bool {
        if !self.link_up {
            return false;
        }
        let sender = match self.addressing {
            Addressing::Short => RadioAddress::Short(self.id),
            Addressing::Long => RadioAddress::Long(self.long),
        };
        let inbound = Inbound {
            payload: payload.to_vec(),
            sender,
            rssi: 0,
            broadcast: to == RadioAddress::Broadcast,
        };

        if self.lose_next > 0 {
            self.lose_next -= 1;
            trace!(from = self.id, ?to, "frame lost in transit");
            self.sent.push((to, payload.to_vec()));
            return true;
        }
        let ok = self.bus.deliver(self.id, to, inbound);
        if ok {
            self.sent.push((to, payload.to_vec()));
        }
        ok
    }

    fn poll(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }
}
