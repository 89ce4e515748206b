//! Sink entity and EDID identity.
//!
//! A `Sink` is created on successful detection and replaced on each
//! detect cycle, unless the newly read EDID fingerprint matches the
//! previous one, in which case the old instance is retained so downstream
//! consumers see no spurious topology churn.

use crate::aux::RawEdid;
use crate::detect::{DongleKind, SignalType};
use crate::link::LinkId;

/// Content-addressed EDID identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdidFingerprint([u8; 32]);

impl EdidFingerprint {
    pub fn of(edid: &RawEdid) -> Self {
        Self(*blake3::hash(&edid.0).as_bytes())
    }
}

/// A detected display sink.
#[derive(Debug, Clone)]
pub struct Sink {
    /// Owning link, as an index.
    pub link: LinkId,
    /// Signal type negotiated at detection.
    pub signal: SignalType,
    /// Dongle classification, when the connector path goes through one.
    pub dongle: Option<DongleKind>,
    /// Raw EDID block, retained for the out-of-scope parser.
    pub edid: RawEdid,
    fingerprint: EdidFingerprint,
}

impl Sink {
    pub fn new(link: LinkId, signal: SignalType, dongle: Option<DongleKind>, edid: RawEdid) -> Self {
        let fingerprint = EdidFingerprint::of(&edid);
        Self {
            link,
            signal,
            dongle,
            edid,
            fingerprint,
        }
    }

    /// `true` when `edid` denotes the same panel as this sink.
    pub fn same_display(&self, edid: &RawEdid) -> bool {
        self.fingerprint == EdidFingerprint::of(edid)
    }

    /// Maximum pixel clock the sink path can carry, in kHz.
    /// Limited by the dongle when one is present.
    pub fn pixel_clock_ceiling_khz(&self) -> Option<u32> {
        self.dongle.map(|d| d.max_tmds_clock_khz())
    }
}
