//! Domain-specific error types for the display-link subsystem.
//!
//! All fallible operations return `Result<T, DpError>`.
//! No panics on invalid register input: every error is typed, and every
//! recovery policy (fallback ladder, SST degradation, best-effort
//! continuation) is decided by the caller from the variant alone.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the display-link subsystem.
#[derive(Debug, Error)]
pub enum DpError {
    // ── Transport Errors ─────────────────────────────────────────
    /// An AUX or I2C transaction did not complete after bounded retries.
    #[error("aux transport failure at {addr:#07x}: {reason}")]
    Transport { addr: u32, reason: &'static str },

    /// An I2C-over-AUX or raw I2C transaction failed.
    #[error("i2c failure at address {addr:#04x}: {reason}")]
    I2c { addr: u8, reason: &'static str },

    /// The hot-plug line could not be read; detection aborts without
    /// side effects.
    #[error("hot-plug sense unavailable")]
    HotplugUnavailable,

    // ── Training Errors ──────────────────────────────────────────
    /// Clock recovery or channel equalization did not converge at the
    /// final ladder setting. Terminal only after ladder exhaustion.
    #[error("link training failed after {attempts} attempts, last setting {rate:?} x{lanes}")]
    TrainingFailed {
        attempts: u32,
        rate: crate::settings::LinkRate,
        lanes: u8,
    },

    // ── Topology Errors ──────────────────────────────────────────
    /// MST topology start/stop did not complete; the link degrades to SST.
    #[error("mst topology error: {0}")]
    Topology(&'static str),

    /// A sideband reply was malformed or NAKed by the branch device.
    #[error("sideband reply rejected: {0}")]
    SidebandNak(&'static str),

    // ── Allocation Errors ────────────────────────────────────────
    /// A VC table write was rejected or a bandwidth request denied.
    /// Hardware is left in the newly-attempted state, not rolled back.
    #[error("allocation failure: {0}")]
    Allocation(&'static str),

    /// The aggregate stream demand cannot fit even at maximum compression.
    #[error("bandwidth demand exceeds link budget: need {needed_pbn} PBN, have {budget_pbn}")]
    BandwidthExceeded { needed_pbn: u32, budget_pbn: u32 },

    // ── Link-state Errors ────────────────────────────────────────
    /// Lane status regressed during a wait. Always fatal to the in-flight
    /// operation; reported distinctly from an ordinary timeout.
    #[error("link lost: lane status regressed during {during}")]
    LinkLost { during: &'static str },

    /// A bounded poll loop exceeded its hard upper bound.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Wire Errors ──────────────────────────────────────────────
    /// A register or message field did not map to any known variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A sideband message failed header or body CRC verification.
    #[error("sideband crc mismatch")]
    CrcMismatch,

    /// A sideband reply was shorter than its declared body, or otherwise
    /// structurally invalid.
    #[error("invalid sideband reply: {0}")]
    InvalidReply(&'static str),

    // ── State-machine Errors ─────────────────────────────────────
    /// An operation was requested in a phase that does not permit it.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    /// A requested mode was rejected by link validation.
    #[error("mode rejected: {0}")]
    ModeRejected(&'static str),
}

impl DpError {
    /// Returns `true` when the error indicates the physical link dropped
    /// mid-operation, as opposed to a recoverable protocol condition.
    pub fn is_link_lost(&self) -> bool {
        matches!(self, DpError::LinkLost { .. })
    }

    /// Returns `true` when the caller may retry at reduced settings
    /// (training-class failures before ladder exhaustion are handled
    /// internally; this covers transport-class flakiness).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DpError::Transport { .. } | DpError::I2c { .. } | DpError::Timeout(_)
        )
    }
}
