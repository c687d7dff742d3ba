//! Per-link sequencing, duplicate suppression and address learning.
//!
//! Every unicast frame is prefixed with one sequence byte. The sender keeps
//! an independent counter per destination unit and the receiver drops a
//! frame whose byte equals the last one seen from that source. Broadcast
//! frames carry no sequence byte.
//!
//! On long-address carriers a station's hardware address is unknown until
//! it is heard from; until then, frames to it go out as broadcasts.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::codec;
use crate::transport::{Addressing, RadioAddress, Transport};

/// Highest sequence number ever sent; the counter wraps to 0 after it.
pub const SEQ_MAX: u8 = 254;

/// Never sent on the wire. Used as the "nothing seen yet" marker so the
/// first frame from a peer, whatever its sequence byte, is accepted.
pub const SEQ_UNSEEN: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Station(u8),
}

/// A frame accepted by the link, ready for decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub frame: Vec<u8>,
    pub source: u8,
    pub rssi: u8,
    pub broadcast: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub rssi: u8,
    pub last_contact_tick: u64,
    pub frames: u64,
    pub duplicates: u64,
}

pub struct ReliableLink<T> {
    transport: T,
    outbound: [u8; 256],
    last_seen: [u8; 256],
    arp: HashMap<u8, u64>,
    stats: HashMap<u8, LinkStats>,
    tick: u64,
}

impl<T: Transport> ReliableLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            outbound: [0; 256],
            last_seen: [SEQ_UNSEEN; 256],
            arp: HashMap::new(),
            stats: HashMap::new(),
            tick: 0,
        }
    }

    /// Send one frame. The destination's counter only advances when the
    /// carrier accepted the frame.
    pub fn send(&mut self, dest: Destination, frame: &[u8]) -> bool {
        let id = match dest {
            Destination::Broadcast => return self.transport.send(RadioAddress::Broadcast, frame),
            Destination::Station(id) => id,
        };
        let address = self.resolve(id);
        if address == RadioAddress::Broadcast {
            trace!(station = id, "no learned address, broadcasting");
            return self.transport.send(RadioAddress::Broadcast, frame);
        }

        let seq = self.outbound[id as usize];
        let mut buf = Vec::with_capacity(frame.len() + 1);
        buf.push(seq);
        buf.extend_from_slice(frame);

        let ok = self.transport.send(address, &buf);
        if ok {
            self.outbound[id as usize] = next_sequence(seq);
        } else {
            warn!(station = id, seq, "transport refused frame");
        }
        ok
    }

    /// Next accepted frame, if any. Duplicates and frames without a
    /// readable header are swallowed here.
    pub fn receive(&mut self) -> Option<Delivery> {
        let inbound = self.transport.poll()?;

        let (seq, frame) = if inbound.broadcast {
            (None, inbound.payload)
        } else {
            let (&seq, rest) = inbound.payload.split_first()?;
            (Some(seq), rest.to_vec())
        };
        let Some(source) = codec::peek_source(&frame) else {
            debug!(len = frame.len(), "dropping frame without header");
            return None;
        };

        if let RadioAddress::Long(addr) = inbound.sender {
            if self.arp.insert(source, addr) != Some(addr) {
                debug!(station = source, address = format!("{addr:016x}"), "learned address");
            }
        }

        let tick = self.tick;
        let stats = self.stats.entry(source).or_default();
        stats.rssi = inbound.rssi;
        stats.last_contact_tick = tick;

        if let Some(seq) = seq {
            if self.last_seen[source as usize] == seq {
                stats.duplicates += 1;
                debug!(station = source, seq, "duplicate frame dropped");
                return None;
            }
            self.last_seen[source as usize] = seq;
        }
        stats.frames += 1;

        Some(Delivery {
            frame,
            source,
            rssi: inbound.rssi,
            broadcast: inbound.broadcast,
        })
    }

    fn resolve(&self, id: u8) -> RadioAddress {
        match self.transport.addressing() {
            Addressing::Short => RadioAddress::Short(id),
            Addressing::Long => self
                .arp
                .get(&id)
                .map_or(RadioAddress::Broadcast, |a| RadioAddress::Long(*a)),
        }
    }

    /// Advance the clock used to stamp link statistics.
    pub fn set_tick(&mut self, tick: u64) {
        self.tick = tick;
    }

    pub fn next_sequence_for(&self, station: u8) -> u8 {
        self.outbound[station as usize]
    }

    pub fn learned_address(&self, station: u8) -> Option<u64> {
        self.arp.get(&station).copied()
    }

    pub fn link_stats(&self, station: u8) -> Option<LinkStats> {
        self.stats.get(&station).copied()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

fn next_sequence(seq: u8) -> u8 {
    if seq >= SEQ_MAX {
        0
    } else {
        seq + 1
    }
}
