//! Inbound frame dispatch.
//!
//! A delivered frame is decoded, checked for addressing, and routed by
//! function code: requests to the responder handlers, reports and
//! responses to the requester handlers. Each role ignores the other's
//! traffic.

mod requester;
mod responder;

use tracing::debug;

use crate::codec::{CodecError, Exception, Frame, FunctionCode, BROADCAST_UNIT};
use crate::controller::Controller;
use crate::reliability::Delivery;
use crate::store::ConfigStore;
use crate::transport::Transport;

/// What became of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Handled(FunctionCode),
    /// The request failed validation; an error response may have been sent.
    Rejected {
        function: FunctionCode,
        exception: Exception,
    },
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(CodecError),
    NotForUs { to: u8 },
    /// Traffic for a role this controller does not play.
    WrongRole(FunctionCode),
    /// Report from a station we do not know or have disabled.
    UnknownStation(u8),
    /// Report covering zones or sensors the station does not have.
    OutOfRange(FunctionCode),
}

impl<T: Transport, S: ConfigStore> Controller<T, S> {
    /// Decode and act on one frame accepted by the link.
    pub fn process(&mut self, delivery: Delivery) -> Outcome {
        let frame = match Frame::decode(&delivery.frame) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(source = delivery.source, error = %e, "dropping malformed frame");
                return Outcome::Dropped(DropReason::Malformed(e));
            }
        };

        let function = frame.function();
        let me = self.unit_id();
        let broadcastable = matches!(function, FunctionCode::TimeBroadcast | FunctionCode::Scan);
        if frame.to != me && !(frame.to == BROADCAST_UNIT && broadcastable) {
            debug!(to = frame.to, me, ?function, "frame not addressed to us");
            return Outcome::Dropped(DropReason::NotForUs { to: frame.to });
        }

        if function.is_request() {
            if !self.role.serves_requests() {
                return Outcome::Dropped(DropReason::WrongRole(function));
            }
            self.serve(&frame)
        } else {
            if !self.role.consumes_reports() {
                return Outcome::Dropped(DropReason::WrongRole(function));
            }
            self.consume(&frame)
        }
    }
}

/// Expand the "everything" sentinel, then check the range against `limit`.
pub(crate) fn resolve_range(first: u8, count: u8, limit: u8) -> Option<(u8, u8)> {
    let count = if first == 0 && count == crate::codec::ALL {
        limit
    } else {
        count
    };
    (count >= 1 && first as usize + count as usize <= limit as usize).then_some((first, count))
}
