//! Sink detection: hot-plug sensing, signal-type classification and
//! transaction-type latching.
//!
//! Detection is a single pass (one HPD read, one classification, one
//! EDID fetch), never a retrying poll. The only bounded retries live in
//! the dongle probe (2 attempts, ≤3 ms windows).

pub mod dongle;

pub use dongle::DongleKind;

use tracing::{debug, info, warn};

use crate::aux;
use crate::caps::SinkCapabilities;
use crate::dpcd;
use crate::error::DpError;
use crate::link::{ConnectionType, Link};
use crate::sink::Sink;

// ── Classification enums ─────────────────────────────────────────

/// Why detection is running. Short-pulse skips the DP presence probe;
/// everything else performs the full classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectReason {
    Boot,
    HpdIrq,
    HpdShortPulse,
    Resume,
    Manual,
}

/// Physical connector on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorType {
    Vga,
    DviSingleLink,
    DviDualLink,
    Hdmi,
    DisplayPort,
    Edp,
}

/// Capability class of the encoder wired to the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    /// DAC output only.
    Analog,
    /// TMDS output only (DVI/HDMI).
    Tmds,
    /// DP-capable PHY.
    DpPhy,
}

/// Negotiated signal type carried on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalType {
    Analog,
    DviSingleLink,
    DviDualLink,
    Hdmi,
    DisplayPort,
    Edp,
}

impl SignalType {
    /// DP-family signals talk DPCD over AUX.
    pub fn is_dp_family(self) -> bool {
        matches!(self, SignalType::DisplayPort | SignalType::Edp)
    }
}

/// EDID transaction path, latched on the link at detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    I2c,
    I2cOverAux,
}

impl TransactionType {
    pub fn for_signal(signal: SignalType) -> TransactionType {
        match signal {
            SignalType::Analog
            | SignalType::DviSingleLink
            | SignalType::DviDualLink
            | SignalType::Hdmi => TransactionType::I2c,
            SignalType::DisplayPort | SignalType::Edp => TransactionType::I2cOverAux,
        }
    }
}

/// Fixed (connector, encoder) → signal lookup. Rows not present are
/// board wiring errors and classify as `None`.
const SIGNAL_MATRIX: &[(ConnectorType, EncoderKind, SignalType)] = &[
    (ConnectorType::Vga, EncoderKind::Analog, SignalType::Analog),
    (ConnectorType::DviSingleLink, EncoderKind::Tmds, SignalType::DviSingleLink),
    (ConnectorType::DviDualLink, EncoderKind::Tmds, SignalType::DviDualLink),
    (ConnectorType::Hdmi, EncoderKind::Tmds, SignalType::Hdmi),
    (ConnectorType::Hdmi, EncoderKind::DpPhy, SignalType::Hdmi),
    (ConnectorType::DisplayPort, EncoderKind::DpPhy, SignalType::DisplayPort),
    (ConnectorType::Edp, EncoderKind::DpPhy, SignalType::Edp),
];

/// Base classification from the fixed matrix, before per-signal
/// overrides.
pub fn classify(connector: ConnectorType, encoder: EncoderKind) -> Option<SignalType> {
    SIGNAL_MATRIX
        .iter()
        .find(|(c, e, _)| *c == connector && *e == encoder)
        .map(|(_, _, s)| *s)
}

// ── Detection result ─────────────────────────────────────────────

/// Outcome of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionResult {
    pub connection: ConnectionType,
    pub signal: Option<SignalType>,
    /// The previous sink instance was kept because the EDID was
    /// byte-identical.
    pub sink_retained: bool,
}

// ── SinkDetector ─────────────────────────────────────────────────

/// Connection detection and classification over one link.
pub struct SinkDetector;

impl SinkDetector {
    /// Run one detection pass.
    ///
    /// On HPD-read failure the pass aborts with no side effects (the
    /// previous sink is retained). On disconnect the sink is released,
    /// sink-count zeroed, and MST/DPIA state torn down.
    pub fn detect(link: &mut Link, reason: DetectReason) -> Result<DetectionResult, DpError> {
        let connected = link
            .io
            .hpd
            .hpd_asserted()
            .map_err(|_| DpError::HotplugUnavailable)?;

        if !connected {
            Self::handle_disconnect(link);
            return Ok(DetectionResult {
                connection: ConnectionType::None,
                signal: None,
                sink_retained: false,
            });
        }

        let mut signal = match classify(link.connector, link.encoder_kind) {
            Some(s) => s,
            None => {
                warn!(link = %link.id, "no signal mapping for connector/encoder pair");
                return Ok(DetectionResult {
                    connection: ConnectionType::None,
                    signal: None,
                    sink_retained: false,
                });
            }
        };
        let mut dongle = None;

        match signal {
            // An HDMI connector without native audio support behind it is
            // electrically DVI.
            SignalType::Hdmi if !link.audio_capable => {
                signal = SignalType::DviSingleLink;
            }
            SignalType::DisplayPort => {
                if reason == DetectReason::HpdShortPulse {
                    // Presence assumed unchanged; keep the previous
                    // classification to avoid false renegotiation.
                    if let Some(prev) = link.signal {
                        signal = prev;
                        dongle = link.sink.as_ref().and_then(|s| s.dongle);
                    }
                } else if !Self::dp_sink_present(link)? {
                    // No DPCD responder: a passive dongle is wired in.
                    let kind = dongle::probe(link.io.aux.as_mut())?;
                    debug!(link = %link.id, ?kind, "passive dongle classified");
                    signal = match kind {
                        DongleKind::PassiveDvi => SignalType::DviSingleLink,
                        DongleKind::DpHdmiType1 | DongleKind::DpHdmiType2 { .. } => {
                            SignalType::Hdmi
                        }
                    };
                    dongle = Some(kind);
                }
            }
            _ => {}
        }

        link.transaction = Some(TransactionType::for_signal(signal));

        let edid = link.io.edid.read_edid()?;
        let sink_retained = match &link.sink {
            Some(prev) if prev.same_display(&edid) && prev.signal == signal => true,
            _ => false,
        };
        if !sink_retained {
            link.sink = Some(Sink::new(link.id, signal, dongle, edid));
        }

        if signal.is_dp_family() && dongle.is_none() {
            link.caps = Some(SinkCapabilities::read(link.io.aux.as_mut())?);
            link.sink_count =
                aux::read_dpcd_byte(link.io.aux.as_mut(), dpcd::SINK_COUNT)? & 0x3F;
        } else {
            link.caps = None;
            link.sink_count = 1;
        }

        link.signal = Some(signal);
        link.connection = ConnectionType::Single;
        info!(link = %link.id, ?signal, ?reason, sink_retained, "sink detected");

        Ok(DetectionResult {
            connection: ConnectionType::Single,
            signal: Some(signal),
            sink_retained,
        })
    }

    /// Sink-presence probe: a DP-native sink answers a capability-field
    /// read over AUX; a passive dongle does not.
    fn dp_sink_present(link: &mut Link) -> Result<bool, DpError> {
        let mut b = [0u8; 1];
        match aux::read_dpcd(link.io.aux.as_mut(), dpcd::DPCD_REV, &mut b) {
            Ok(()) => Ok(true),
            Err(DpError::Transport { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn handle_disconnect(link: &mut Link) {
        if link.connection == ConnectionType::None {
            return;
        }
        info!(link = %link.id, "sink disconnected");
        if link.connection == ConnectionType::MstBranch {
            crate::mst::MstTopologyManager::teardown(link);
        }
        link.sink = None;
        link.sink_count = 0;
        link.caps = None;
        link.signal = None;
        link.transaction = None;
        link.connection = ConnectionType::None;
        link.trained = false;
        link.training.reset();
        link.current = None;
        link.verified = None;
        link.reported = None;
        // A dropped hot-plug voids any tunneled-bandwidth grant.
        link.dpia.reset_on_unplug();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_is_exhaustive_for_wired_pairs() {
        assert_eq!(
            classify(ConnectorType::Hdmi, EncoderKind::Tmds),
            Some(SignalType::Hdmi)
        );
        assert_eq!(
            classify(ConnectorType::DisplayPort, EncoderKind::DpPhy),
            Some(SignalType::DisplayPort)
        );
        assert_eq!(
            classify(ConnectorType::Edp, EncoderKind::DpPhy),
            Some(SignalType::Edp)
        );
        // A DP connector on a TMDS-only encoder is a wiring error.
        assert_eq!(classify(ConnectorType::DisplayPort, EncoderKind::Tmds), None);
    }

    #[test]
    fn transaction_type_follows_signal_family() {
        assert_eq!(
            TransactionType::for_signal(SignalType::Hdmi),
            TransactionType::I2c
        );
        assert_eq!(
            TransactionType::for_signal(SignalType::Analog),
            TransactionType::I2c
        );
        assert_eq!(
            TransactionType::for_signal(SignalType::DisplayPort),
            TransactionType::I2cOverAux
        );
        assert_eq!(
            TransactionType::for_signal(SignalType::Edp),
            TransactionType::I2cOverAux
        );
    }
}
