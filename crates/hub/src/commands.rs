use serde::Deserialize;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Manual control topics the hub subscribes to.
pub(crate) const COMMAND_TOPICS: [&str; 3] = ["zone/+/set", "zones/stop", "quick/run"];

/// Where notifications are published, one JSON object per message.
pub(crate) const EVENTS_TOPIC: &str = "irrigation/events";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    ZoneOn { zone: u8, minutes: u8 },
    ZoneOff { zone: u8 },
    StopAll,
    QuickRun { durations: Vec<u8> },
}

/// `quick/run` payload: either a bare list or `{"durations": [..]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum QuickRunMsg {
    List(Vec<u8>),
    Object { durations: Vec<u8> },
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract the zone index from "zone/<n>/set".
pub(crate) fn extract_zone(topic: &str) -> Option<u8> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "zone" && parts[2] == "set" {
        parts[1].parse().ok()
    } else {
        None
    }
}

/// Parse "ON <minutes>" / "OFF" (case-insensitive, trims whitespace).
/// `Some(minutes)` turns the zone on.
pub(crate) fn parse_zone_command(payload: &[u8]) -> Result<Option<u8>, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    let mut words = s.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("OFF"), None, None) => Ok(None),
        (Some("ON"), Some(minutes), None) => match minutes.parse::<u8>() {
            Ok(0) | Err(_) => Err(format!("bad run time '{minutes}' (1-255 minutes)")),
            Ok(m) => Ok(Some(m)),
        },
        (Some("ON"), None, None) => Err("ON needs a run time in minutes".to_string()),
        _ => Err(format!("unknown zone command '{s}'")),
    }
}

pub(crate) fn parse_command(topic: &str, payload: &[u8]) -> Result<Command, String> {
    if let Some(zone) = extract_zone(topic) {
        return Ok(match parse_zone_command(payload)? {
            Some(minutes) => Command::ZoneOn { zone, minutes },
            None => Command::ZoneOff { zone },
        });
    }
    match topic {
        "zones/stop" => Ok(Command::StopAll),
        "quick/run" => match serde_json::from_slice::<QuickRunMsg>(payload) {
            Ok(QuickRunMsg::List(durations) | QuickRunMsg::Object { durations }) => {
                Ok(Command::QuickRun { durations })
            }
            Err(e) => Err(format!("bad quick run json: {e}")),
        },
        _ => Err(format!("unhandled topic={topic}")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
