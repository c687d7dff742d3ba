//! RProtocol wire codec.
//!
//! Every frame is a fixed 6-byte header followed by a function-specific
//! payload:
//!
//! ```text
//! [protocol_id][transaction_id][to][from][length][function] payload...
//! ```
//!
//! `length` counts payload bytes only. Multi-byte fields are little-endian.
//! Decoding fails closed: anything that does not match the declared shape
//! exactly is rejected and must never be answered.

use std::fmt;
use std::ops::BitOr;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

pub const PROTOCOL_ID: u8 = 1;
pub const HEADER_LEN: usize = 6;
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Unit id used by frames meant for every station (time, scan).
pub const BROADCAST_UNIT: u8 = 255;

/// `count` sentinel in read requests: "everything the station has".
pub const ALL: u8 = 0xFF;

/// Station flag carried in zone reports.
pub const STATION_ENABLED: u8 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame too short ({len} bytes)")]
    TooShort { len: usize },

    #[error("bad protocol id {0}")]
    ProtocolId(u8),

    #[error("declared length {declared} does not match payload length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown function code {0}")]
    UnknownFunction(u8),

    #[error("malformed {function:?} payload ({len} bytes)")]
    Payload { function: FunctionCode, len: usize },

    #[error("payload of {len} bytes does not fit in one frame")]
    Oversized { len: usize },
}

// ---------------------------------------------------------------------------
// Function codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ZonesRead = 1,
    ZonesSet = 2,
    ZonesReport = 3,
    SensorsRead = 4,
    SensorsReport = 5,
    RegistersRead = 6,
    RegistersSet = 7,
    RegistersReport = 8,
    EventMasterRead = 12,
    EventMasterSet = 13,
    EventMasterReport = 14,
    Scan = 50,
    ScanReply = 51,
    Ping = 52,
    PingReply = 53,
    TimeBroadcast = 55,
    ResponseOk = 127,
    ResponseError = 128,
}

impl FunctionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        use FunctionCode::*;
        let code = match value {
            1 => ZonesRead,
            2 => ZonesSet,
            3 => ZonesReport,
            4 => SensorsRead,
            5 => SensorsReport,
            6 => RegistersRead,
            7 => RegistersSet,
            8 => RegistersReport,
            12 => EventMasterRead,
            13 => EventMasterSet,
            14 => EventMasterReport,
            50 => Scan,
            51 => ScanReply,
            52 => Ping,
            53 => PingReply,
            55 => TimeBroadcast,
            127 => ResponseOk,
            128 => ResponseError,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Requests are served by the responder role; everything else is a
    /// report or response consumed by the requester role.
    pub fn is_request(self) -> bool {
        use FunctionCode::*;
        matches!(
            self,
            ZonesRead
                | ZonesSet
                | SensorsRead
                | RegistersRead
                | RegistersSet
                | EventMasterRead
                | EventMasterSet
                | Scan
                | Ping
                | TimeBroadcast
        )
    }
}

// ---------------------------------------------------------------------------
// Flag words
// ---------------------------------------------------------------------------

/// Acknowledgement policy carried on mutating requests. Bits combine freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckFlags(u8);

impl AckFlags {
    pub const NONE: Self = Self(0);
    /// Send an error response on failure.
    pub const ERROR: Self = Self(1);
    /// Send a brief OK response on success.
    pub const BRIEF: Self = Self(2);
    /// Send the full state report on success.
    pub const REPORT: Self = Self(4);
    pub const STD: Self = Self(1 | 4);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AckFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Event-master subscription flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventFlags(u16);

impl EventFlags {
    pub const NONE: Self = Self(0);
    /// Register the sender of the request; the id/address fields are ignored.
    pub const REGISTER_SELF: Self = Self(1);
    pub const REPORT_ZONES: Self = Self(4);
    pub const REPORT_SENSORS: Self = Self(8);
    pub const REPORT_WATERING: Self = Self(16);
    pub const REPORT_SYSTEM: Self = Self(32);
    pub const REPORT_ALL: Self = Self(4 | 8 | 16 | 32);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Exception code quoted in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// Index/count out of range, or the station may not be addressed.
    IllegalAddress,
    /// The request was valid but applying it failed locally.
    ApplyFailure,
    Other(u8),
}

impl Exception {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::IllegalAddress,
            4 => Self::ApplyFailure,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::IllegalAddress => 2,
            Self::ApplyFailure => 4,
            Self::Other(v) => v,
        }
    }
}

// ---------------------------------------------------------------------------
// Zone bitmaps
// ---------------------------------------------------------------------------

/// Bytes needed for a bitmap covering channels `0..first + count`.
pub fn bitmap_len(first: u8, count: u8) -> usize {
    ((first as usize + count as usize + 7) / 8).max(1)
}

/// Zone bitmap with absolute channel positions (bit `n` is channel `n`).
#[derive(Clone, Default)]
pub struct ZoneMask(Vec<u8>);

impl ZoneMask {
    pub fn empty(first: u8, count: u8) -> Self {
        Self(vec![0; bitmap_len(first, count)])
    }

    /// Every channel in `first..first + count` set.
    pub fn range(first: u8, count: u8) -> Self {
        let mut mask = Self::empty(first, count);
        for ch in first..first.saturating_add(count) {
            mask.set(ch, true);
        }
        mask
    }

    pub fn single(channel: u8) -> Self {
        Self::range(channel, 1)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn get(&self, channel: u8) -> bool {
        let (byte, bit) = (channel as usize / 8, channel % 8);
        self.0.get(byte).is_some_and(|b| b & (1 << bit) != 0)
    }

    pub fn set(&mut self, channel: u8, on: bool) {
        let (byte, bit) = (channel as usize / 8, channel % 8);
        if byte >= self.0.len() {
            self.0.resize(byte + 1, 0);
        }
        if on {
            self.0[byte] |= 1 << bit;
        } else {
            self.0[byte] &= !(1 << bit);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn significant(&self) -> &[u8] {
        let end = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |i| i + 1);
        &self.0[..end]
    }
}

// Two masks are equal when the same channels are set, whatever their width.
impl PartialEq for ZoneMask {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for ZoneMask {}

impl fmt::Debug for ZoneMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ZoneMask(")?;
        for b in self.0.iter().rev() {
            write!(f, "{b:08b}")?;
        }
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ZonesRead {
        first: u8,
        count: u8,
    },
    /// Run the masked zones for `minutes`; `minutes == 0` turns them off.
    ZonesSet {
        flags: AckFlags,
        schedule_id: u8,
        first: u8,
        minutes: u8,
        count: u8,
        mask: ZoneMask,
    },
    ZonesReport {
        station_flags: u8,
        first: u8,
        count: u8,
        mask: ZoneMask,
    },
    SensorsRead {
        first: u8,
        count: u8,
    },
    SensorsReport {
        first: u8,
        values: Vec<u16>,
    },
    RegistersRead {
        first: u8,
        count: u8,
    },
    RegistersSet {
        flags: AckFlags,
        first: u8,
        values: Vec<u16>,
    },
    RegistersReport {
        first: u8,
        values: Vec<u16>,
    },
    EventMasterRead,
    EventMasterSet {
        flags: AckFlags,
        events: EventFlags,
        master_id: u8,
        master_address: u16,
    },
    EventMasterReport {
        events: EventFlags,
        master_id: u8,
        master_address: u16,
    },
    Scan,
    ScanReply,
    Ping {
        cookie: u32,
    },
    PingReply {
        cookie: u32,
    },
    TimeBroadcast {
        time: u32,
    },
    ResponseOk {
        function: u8,
    },
    ResponseError {
        function: u8,
        exception: Exception,
    },
}

impl Message {
    pub fn function(&self) -> FunctionCode {
        use FunctionCode as F;
        match self {
            Message::ZonesRead { .. } => F::ZonesRead,
            Message::ZonesSet { .. } => F::ZonesSet,
            Message::ZonesReport { .. } => F::ZonesReport,
            Message::SensorsRead { .. } => F::SensorsRead,
            Message::SensorsReport { .. } => F::SensorsReport,
            Message::RegistersRead { .. } => F::RegistersRead,
            Message::RegistersSet { .. } => F::RegistersSet,
            Message::RegistersReport { .. } => F::RegistersReport,
            Message::EventMasterRead => F::EventMasterRead,
            Message::EventMasterSet { .. } => F::EventMasterSet,
            Message::EventMasterReport { .. } => F::EventMasterReport,
            Message::Scan => F::Scan,
            Message::ScanReply => F::ScanReply,
            Message::Ping { .. } => F::Ping,
            Message::PingReply { .. } => F::PingReply,
            Message::TimeBroadcast { .. } => F::TimeBroadcast,
            Message::ResponseOk { .. } => F::ResponseOk,
            Message::ResponseError { .. } => F::ResponseError,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Message::ZonesRead { first, count }
            | Message::SensorsRead { first, count }
            | Message::RegistersRead { first, count } => {
                buf.put_u8(*first);
                buf.put_u8(*count);
            }
            Message::ZonesSet {
                flags,
                schedule_id,
                first,
                minutes,
                count,
                mask,
            } => {
                buf.put_u8(flags.bits());
                buf.put_u8(*schedule_id);
                buf.put_u8(*first);
                buf.put_u8(*minutes);
                buf.put_u8(*count);
                put_mask(buf, mask, *first, *count);
            }
            Message::ZonesReport {
                station_flags,
                first,
                count,
                mask,
            } => {
                buf.put_u8(*station_flags);
                buf.put_u8(*first);
                buf.put_u8(*count);
                put_mask(buf, mask, *first, *count);
            }
            Message::SensorsReport { first, values } | Message::RegistersReport { first, values } => {
                buf.put_u8(*first);
                put_words(buf, values);
            }
            Message::RegistersSet {
                flags,
                first,
                values,
            } => {
                buf.put_u8(flags.bits());
                buf.put_u8(*first);
                put_words(buf, values);
            }
            Message::EventMasterRead | Message::Scan | Message::ScanReply => {}
            Message::EventMasterSet {
                flags,
                events,
                master_id,
                master_address,
            } => {
                buf.put_u8(flags.bits());
                buf.put_u16_le(events.bits());
                buf.put_u8(*master_id);
                buf.put_u16_le(*master_address);
            }
            Message::EventMasterReport {
                events,
                master_id,
                master_address,
            } => {
                buf.put_u16_le(events.bits());
                buf.put_u8(*master_id);
                buf.put_u16_le(*master_address);
            }
            Message::Ping { cookie } | Message::PingReply { cookie } => buf.put_u32_le(*cookie),
            Message::TimeBroadcast { time } => buf.put_u32_le(*time),
            Message::ResponseOk { function } => buf.put_u8(*function),
            Message::ResponseError {
                function,
                exception,
            } => {
                buf.put_u8(*function);
                buf.put_u8(exception.as_u8());
            }
        }
    }

    fn decode_payload(function: FunctionCode, payload: &[u8]) -> Result<Self, CodecError> {
        use FunctionCode as F;

        let bad = || CodecError::Payload {
            function,
            len: payload.len(),
        };
        let exact = |n: usize| if payload.len() == n { Ok(()) } else { Err(bad()) };
        let mut buf = payload;

        let message = match function {
            F::ZonesRead | F::SensorsRead | F::RegistersRead => {
                exact(2)?;
                let (first, count) = (buf.get_u8(), buf.get_u8());
                match function {
                    F::ZonesRead => Message::ZonesRead { first, count },
                    F::SensorsRead => Message::SensorsRead { first, count },
                    _ => Message::RegistersRead { first, count },
                }
            }
            F::ZonesSet => {
                if payload.len() < 5 {
                    return Err(bad());
                }
                let (first, count) = (payload[2], payload[4]);
                exact(5 + bitmap_len(first, count))?;
                let flags = AckFlags::from_bits(buf.get_u8());
                let schedule_id = buf.get_u8();
                buf.advance(1);
                let minutes = buf.get_u8();
                buf.advance(1);
                Message::ZonesSet {
                    flags,
                    schedule_id,
                    first,
                    minutes,
                    count,
                    mask: ZoneMask::from_bytes(buf.to_vec()),
                }
            }
            F::ZonesReport => {
                if payload.len() < 3 {
                    return Err(bad());
                }
                let (first, count) = (payload[1], payload[2]);
                exact(3 + bitmap_len(first, count))?;
                let station_flags = buf.get_u8();
                buf.advance(2);
                Message::ZonesReport {
                    station_flags,
                    first,
                    count,
                    mask: ZoneMask::from_bytes(buf.to_vec()),
                }
            }
            F::SensorsReport | F::RegistersReport => {
                if payload.is_empty() {
                    return Err(bad());
                }
                let first = buf.get_u8();
                let values = get_words(&mut buf).ok_or_else(bad)?;
                if function == F::SensorsReport {
                    Message::SensorsReport { first, values }
                } else {
                    Message::RegistersReport { first, values }
                }
            }
            F::RegistersSet => {
                if payload.len() < 2 {
                    return Err(bad());
                }
                let flags = AckFlags::from_bits(buf.get_u8());
                let first = buf.get_u8();
                let values = get_words(&mut buf).ok_or_else(bad)?;
                Message::RegistersSet {
                    flags,
                    first,
                    values,
                }
            }
            F::EventMasterRead => {
                exact(0)?;
                Message::EventMasterRead
            }
            F::EventMasterSet => {
                exact(6)?;
                Message::EventMasterSet {
                    flags: AckFlags::from_bits(buf.get_u8()),
                    events: EventFlags::from_bits(buf.get_u16_le()),
                    master_id: buf.get_u8(),
                    master_address: buf.get_u16_le(),
                }
            }
            F::EventMasterReport => {
                exact(5)?;
                Message::EventMasterReport {
                    events: EventFlags::from_bits(buf.get_u16_le()),
                    master_id: buf.get_u8(),
                    master_address: buf.get_u16_le(),
                }
            }
            F::Scan => {
                exact(0)?;
                Message::Scan
            }
            F::ScanReply => {
                exact(0)?;
                Message::ScanReply
            }
            F::Ping => {
                exact(4)?;
                Message::Ping {
                    cookie: buf.get_u32_le(),
                }
            }
            F::PingReply => {
                exact(4)?;
                Message::PingReply {
                    cookie: buf.get_u32_le(),
                }
            }
            F::TimeBroadcast => {
                exact(4)?;
                Message::TimeBroadcast {
                    time: buf.get_u32_le(),
                }
            }
            F::ResponseOk => {
                exact(1)?;
                Message::ResponseOk {
                    function: buf.get_u8(),
                }
            }
            F::ResponseError => {
                exact(2)?;
                Message::ResponseError {
                    function: buf.get_u8(),
                    exception: Exception::from_u8(buf.get_u8()),
                }
            }
        };
        Ok(message)
    }
}

fn put_mask(buf: &mut BytesMut, mask: &ZoneMask, first: u8, count: u8) {
    let len = bitmap_len(first, count);
    let bytes = mask.as_bytes();
    for i in 0..len {
        buf.put_u8(bytes.get(i).copied().unwrap_or(0));
    }
}

fn put_words(buf: &mut BytesMut, values: &[u16]) {
    buf.put_u8(values.len() as u8);
    for v in values {
        buf.put_u16_le(*v);
    }
}

/// Count byte followed by exactly `count` words; the count is checked
/// against the remaining length before any element is read.
fn get_words(buf: &mut &[u8]) -> Option<Vec<u16>> {
    if buf.remaining() < 1 {
        return None;
    }
    let count = buf.get_u8() as usize;
    if buf.remaining() != count * 2 {
        return None;
    }
    Some((0..count).map(|_| buf.get_u16_le()).collect())
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// A decoded protocol frame: header addressing plus typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 0 for unsolicited messages, 1-255 to correlate request and response.
    pub transaction_id: u8,
    pub to: u8,
    pub from: u8,
    pub message: Message,
}

impl Frame {
    pub fn new(transaction_id: u8, to: u8, from: u8, message: Message) -> Self {
        Self {
            transaction_id,
            to,
            from,
            message,
        }
    }

    pub fn function(&self) -> FunctionCode {
        self.message.function()
    }

    pub fn is_unsolicited(&self) -> bool {
        self.transaction_id == 0
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut payload = BytesMut::with_capacity(16);
        self.message.encode_payload(&mut payload);
        if payload.len() > MAX_PAYLOAD {
            return Err(CodecError::Oversized { len: payload.len() });
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(PROTOCOL_ID);
        buf.put_u8(self.transaction_id);
        buf.put_u8(self.to);
        buf.put_u8(self.from);
        buf.put_u8(payload.len() as u8);
        buf.put_u8(self.function().as_u8());
        buf.extend_from_slice(&payload);
        Ok(buf.to_vec())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::TooShort { len: bytes.len() });
        }
        let mut header = &bytes[..HEADER_LEN];
        let protocol_id = header.get_u8();
        if protocol_id != PROTOCOL_ID {
            return Err(CodecError::ProtocolId(protocol_id));
        }
        let transaction_id = header.get_u8();
        let to = header.get_u8();
        let from = header.get_u8();
        let declared = header.get_u8() as usize;
        let actual = bytes.len() - HEADER_LEN;
        if declared != actual {
            return Err(CodecError::LengthMismatch { declared, actual });
        }
        let code = header.get_u8();
        let function = FunctionCode::from_u8(code).ok_or(CodecError::UnknownFunction(code))?;
        let message = Message::decode_payload(function, &bytes[HEADER_LEN..])?;

        Ok(Self {
            transaction_id,
            to,
            from,
            message,
        })
    }
}

/// Source unit id of a raw frame, if it at least carries our header.
pub fn peek_source(bytes: &[u8]) -> Option<u8> {
    (bytes.len() >= HEADER_LEN && bytes[0] == PROTOCOL_ID).then(|| bytes[3])
}

// ===========================================================================
// Tests
// ===========================================================================
