//! Negotiation payload carried in the first datagram of a flow.
//!
//! The initiator serializes its [`FlowOptions`] as JSON so the receiver can
//! decode them without any prior schema exchange. Every later datagram from
//! the same peer is opaque payload and is only counted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

/// Reasons a datagram is not accepted as a negotiation payload.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("payload is not a flow options document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{field} must be non-zero")]
    Zero { field: &'static str },

    #[error("{field} of {size} bytes exceeds the 65507 byte datagram limit")]
    Oversized { field: &'static str, size: usize },
}

/// Per-flow parameters agreed once, in the first datagram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowOptions {
    /// Time between two interval reports.
    pub report_interval: Duration,
    /// How long the flow lasts in total.
    pub total_duration: Duration,
    /// Receive buffer size in bytes.
    pub read_size: usize,
    /// Send buffer size in bytes.
    pub write_size: usize,
    /// Send rate cap in bits per second; `0` means unlimited.
    pub max_speed_bps: u64,
}

impl FlowOptions {
    /// Reject options no pump can run with.
    pub fn validate(&self) -> Result<(), NegotiationError> {
        if self.report_interval.is_zero() {
            return Err(NegotiationError::Zero {
                field: "report_interval",
            });
        }
        if self.total_duration.is_zero() {
            return Err(NegotiationError::Zero {
                field: "total_duration",
            });
        }
        for (field, size) in [("read_size", self.read_size), ("write_size", self.write_size)] {
            if size == 0 {
                return Err(NegotiationError::Zero { field });
            }
            if size > MAX_DATAGRAM {
                return Err(NegotiationError::Oversized { field, size });
            }
        }
        Ok(())
    }
}

/// Serialize options into a negotiation payload.
pub fn encode_options(opts: &FlowOptions) -> Result<Vec<u8>, NegotiationError> {
    opts.validate()?;
    Ok(serde_json::to_vec(opts)?)
}

/// Decode and validate a negotiation payload.
pub fn decode_options(payload: &[u8]) -> Result<FlowOptions, NegotiationError> {
    let opts: FlowOptions = serde_json::from_slice(payload)?;
    opts.validate()?;
    Ok(opts)
}
