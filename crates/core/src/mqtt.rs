//! Radio frames bridged over an MQTT broker.
//!
//! Every station subscribes to `rf/<net>/<addr>` for frames sent to it and
//! `rf/<net>/bcast` for broadcasts. Each publish carries an envelope of
//! `[sender][flags][frame..]`, so receivers learn who sent the frame the
//! same way a radio modem reports it.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::transport::{Addressing, Inbound, RadioAddress, Transport};

/// Envelope flag: the frame went to the broadcast topic.
pub const ENVELOPE_BROADCAST: u8 = 0x01;

const ENVELOPE_HEADER: usize = 2;
const BROADCAST_SEGMENT: &str = "bcast";

// ---------------------------------------------------------------------------
// Topic / envelope helpers
// ---------------------------------------------------------------------------

pub fn unicast_topic(network: &str, address: u8) -> String {
    format!("rf/{network}/{address}")
}

pub fn broadcast_topic(network: &str) -> String {
    format!("rf/{network}/{BROADCAST_SEGMENT}")
}

/// Destination encoded in an "rf/<net>/<addr|bcast>" topic.
pub fn extract_target(topic: &str, network: &str) -> Option<RadioAddress> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[0] != "rf" || parts[1] != network {
        return None;
    }
    if parts[2] == BROADCAST_SEGMENT {
        Some(RadioAddress::Broadcast)
    } else {
        parts[2].parse().ok().map(RadioAddress::Short)
    }
}

pub fn wrap(sender: u8, broadcast: bool, frame: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER + frame.len());
    buf.put_u8(sender);
    buf.put_u8(if broadcast { ENVELOPE_BROADCAST } else { 0 });
    buf.put_slice(frame);
    buf.to_vec()
}

/// `(sender, flags, frame)`, or `None` when the payload is too short.
pub fn unwrap_envelope(payload: &[u8]) -> Option<(u8, u8, &[u8])> {
    match payload {
        [sender, flags, frame @ ..] => Some((*sender, *flags, frame)),
        _ => None,
    }
}

/// Turn a received publish into an inbound frame. Our own broadcasts come
/// back from the broker and are dropped here.
fn inbound_from_publish(topic: &str, payload: &[u8], network: &str, me: u8) -> Option<Inbound> {
    let target = extract_target(topic, network)?;
    let (sender, flags, frame) = unwrap_envelope(payload)?;
    if sender == me {
        return None;
    }
    Some(Inbound {
        payload: frame.to_vec(),
        sender: RadioAddress::Short(sender),
        rssi: 0,
        broadcast: target == RadioAddress::Broadcast || flags & ENVELOPE_BROADCAST != 0,
    })
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Connection settings for [`MqttTransport::connect`].
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    /// Radio network name, the second topic segment.
    pub network: String,
    /// Our unit id on the radio network.
    pub address: u8,
}

pub struct MqttTransport {
    client: AsyncClient,
    network: String,
    address: u8,
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl MqttTransport {
    /// Start the MQTT event loop on the current tokio runtime. Frames
    /// arriving before the first `poll` are buffered.
    pub fn connect(opts: BridgeOptions) -> Self {
        let mut mqttoptions = MqttOptions::new(opts.client_id, opts.host, opts.port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(mqttoptions, 64);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_eventloop(
            eventloop,
            client.clone(),
            opts.network.clone(),
            opts.address,
            tx,
        ));

        Self {
            client,
            network: opts.network,
            address: opts.address,
            rx,
        }
    }
}

async fn run_eventloop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    network: String,
    address: u8,
    tx: mpsc::UnboundedSender<Inbound>,
) {
    let topics = [unicast_topic(&network, address), broadcast_topic(&network)];
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(network, address, "radio bridge connected");
                for topic in &topics {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
                        warn!(topic, error = %e, "subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(inbound) = inbound_from_publish(&p.topic, &p.payload, &network, address)
                else {
                    trace!(topic = %p.topic, "ignoring publish");
                    continue;
                };
                if tx.send(inbound).is_err() {
                    debug!("radio bridge closed");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("radio bridge disconnected");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

impl Transport for MqttTransport {
    fn addressing(&self) -> Addressing {
        Addressing::Short
    }

    fn send(&mut self, to: RadioAddress, payload: &[u8]) -> bool {
        let (topic, broadcast) = match to {
            RadioAddress::Broadcast => (broadcast_topic(&self.network), true),
            RadioAddress::Short(addr) => (unicast_topic(&self.network, addr), false),
            RadioAddress::Long(addr) => {
                warn!(addr, "long addresses are not routable over mqtt");
                return false;
            }
        };
        let envelope = wrap(self.address, broadcast, payload);
        match self
            .client
            .try_publish(&topic, QoS::AtMostOnce, false, envelope)
        {
            Ok(()) => true,
            Err(e) => {
                warn!(topic, error = %e, "publish failed");
                false
            }
        }
    }

    fn poll(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
