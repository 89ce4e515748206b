//! Collaborator traits for the register-transport layer.
//!
//! Raw AUX/I2C byte transfer is outside this crate; implementations are
//! injected per link. Everything here is synchronous and blocking: a
//! transaction either completes, fails, or defers, and defers are retried
//! a bounded number of times before surfacing as [`DpError::Transport`].

use tracing::trace;

use crate::error::DpError;

/// Bounded retry budget applied to a deferred/failed AUX transaction
/// before the error is surfaced.
pub const AUX_RETRY_LIMIT: u32 = 3;

/// Outcome of a single low-level AUX transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxReply {
    /// Transaction completed.
    Ack,
    /// The sink asked the source to retry later.
    Defer,
    /// The sink rejected the transaction.
    Nack,
}

/// Synchronous register transport to the sink/branch device.
///
/// `aux_read`/`aux_write` address the DPCD space; `i2c_read`/`i2c_write`
/// run I2C (native or over AUX, as latched on the link) transactions
/// against a 7-bit device address.
pub trait AuxTransport {
    fn aux_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<AuxReply, DpError>;
    fn aux_write(&mut self, addr: u32, data: &[u8]) -> Result<AuxReply, DpError>;
    fn i2c_read(&mut self, dev: u8, offset: u8, buf: &mut [u8]) -> Result<AuxReply, DpError>;
    fn i2c_write(&mut self, dev: u8, offset: u8, data: &[u8]) -> Result<AuxReply, DpError>;
}

/// Hot-plug line state, or the tunnel layer's hot-plug flag for
/// tunneled links.
pub trait HotplugSense {
    fn hpd_asserted(&mut self) -> Result<bool, DpError>;
}

/// Raw EDID bytes as delivered by the out-of-scope EDID reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEdid(pub Vec<u8>);

/// EDID acquisition collaborator. Byte-level parsing stays external;
/// this crate only fingerprints and stores the block.
pub trait EdidSource {
    fn read_edid(&mut self) -> Result<RawEdid, DpError>;
}

/// Physical-encoder control consumed during training and stream
/// enable/disable. Register-level programming happens behind this trait.
pub trait EncoderControl {
    /// Bring the PHY up for the given settings (fresh setup).
    fn phy_setup(&mut self, settings: &crate::settings::LinkSettings);
    /// Drive a training or test pattern on the main link.
    fn set_pattern(&mut self, pattern: crate::train::PatternKind);
    /// Apply per-lane voltage swing / pre-emphasis levels.
    fn set_drive(&mut self, swing: u8, pre_emphasis: u8);
    /// Start pixel output for a stream.
    fn enable_output(&mut self, stream: crate::stream::StreamId);
    /// Stop pixel output for a stream.
    fn disable_output(&mut self, stream: crate::stream::StreamId);
    /// Program the local time-slot divider for an MST stream
    /// (average time slots per MTP, fixed point x256).
    fn set_throttled_vcp_size(&mut self, stream: crate::stream::StreamId, avg_slots_x256: u32);
}

/// Symbol-clock provisioning notify. Invoked only when committed link
/// settings actually change.
pub trait SymbolClock {
    fn provision(&mut self, settings: &crate::settings::LinkSettings);
}

// ── Retry-bounded helpers ────────────────────────────────────────

/// Read `buf.len()` bytes from `addr`, retrying defers/nacks up to
/// [`AUX_RETRY_LIMIT`] times.
pub fn read_dpcd(
    aux: &mut dyn AuxTransport,
    addr: u32,
    buf: &mut [u8],
) -> Result<(), DpError> {
    for attempt in 0..AUX_RETRY_LIMIT {
        match aux.aux_read(addr, buf)? {
            AuxReply::Ack => return Ok(()),
            AuxReply::Defer | AuxReply::Nack => {
                trace!(addr, attempt, "aux read deferred");
            }
        }
    }
    Err(DpError::Transport {
        addr,
        reason: "read retry budget exhausted",
    })
}

/// Write `data` to `addr`, retrying defers/nacks up to
/// [`AUX_RETRY_LIMIT`] times.
pub fn write_dpcd(
    aux: &mut dyn AuxTransport,
    addr: u32,
    data: &[u8],
) -> Result<(), DpError> {
    for attempt in 0..AUX_RETRY_LIMIT {
        match aux.aux_write(addr, data)? {
            AuxReply::Ack => return Ok(()),
            AuxReply::Defer | AuxReply::Nack => {
                trace!(addr, attempt, "aux write deferred");
            }
        }
    }
    Err(DpError::Transport {
        addr,
        reason: "write retry budget exhausted",
    })
}

/// Single-byte register read.
pub fn read_dpcd_byte(aux: &mut dyn AuxTransport, addr: u32) -> Result<u8, DpError> {
    let mut b = [0u8; 1];
    read_dpcd(aux, addr, &mut b)?;
    Ok(b[0])
}

/// Single-byte register write.
pub fn write_dpcd_byte(aux: &mut dyn AuxTransport, addr: u32, value: u8) -> Result<(), DpError> {
    write_dpcd(aux, addr, &[value])
}
