//! The link entity: one per physical or tunneled connector.
//!
//! A `Link` exclusively owns its collaborator handles, payload table and
//! bandwidth ledger; streams refer to it by [`LinkId`] only. Every
//! operation takes `&mut Link`; callers that share a link across threads
//! wrap it in a mutex ([`SharedLink`]), which also serializes
//! out-of-band DPIA notifications with in-flight requests.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::aux::{AuxTransport, EdidSource, EncoderControl, HotplugSense, SymbolClock};
use crate::caps::SinkCapabilities;
use crate::detect::{
    ConnectorType, DetectReason, DetectionResult, EncoderKind, SignalType, SinkDetector,
    TransactionType,
};
use crate::dpia::{DpiaBwAllocator, DpiaBwState, RequestOutcome};
use crate::dsc::pbn;
use crate::error::DpError;
use crate::mst::{MstState, MstTopologyManager, VcPayloadTable};
use crate::settings::{LinkRate, LinkSettings};
use crate::sink::Sink;
use crate::stream::{Stream, StreamTiming};
use crate::train::{LinkTrainer, TrainOptions, TrainingPhase};
use crate::wait::WaitStrategy;

// ── Identity ─────────────────────────────────────────────────────

/// Link identity, stable for the life of the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u8);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link{}", self.0)
    }
}

/// What currently hangs off the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    #[default]
    None,
    Single,
    MstBranch,
}

/// How the link reaches its sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEndpoint {
    /// Dedicated PHY on the board.
    NativePhy,
    /// Carried through a tunnel whose bandwidth an external agent
    /// brokers.
    Tunneled,
}

// ── Collaborator bundle ──────────────────────────────────────────

/// The injected collaborators a link operates through.
pub struct LinkIo {
    pub aux: Box<dyn AuxTransport>,
    pub hpd: Box<dyn HotplugSense>,
    pub edid: Box<dyn EdidSource>,
    pub encoder: Box<dyn EncoderControl>,
    pub clock: Box<dyn SymbolClock>,
    pub wait: Box<dyn WaitStrategy>,
}

// ── Link ─────────────────────────────────────────────────────────

/// One display link. Created at driver init; never destroyed while the
/// connector exists.
pub struct Link {
    pub id: LinkId,
    pub connector: ConnectorType,
    pub encoder_kind: EncoderKind,
    pub endpoint: LinkEndpoint,
    /// The board routes native HDMI audio to this connector.
    pub audio_capable: bool,
    pub io: LinkIo,

    // Detection state.
    pub connection: ConnectionType,
    pub signal: Option<SignalType>,
    pub transaction: Option<TransactionType>,
    pub sink: Option<Sink>,
    pub sink_count: u8,
    pub caps: Option<SinkCapabilities>,

    // Training state.
    /// Sink-advertised settings (unproven).
    pub reported: Option<LinkSettings>,
    /// Best settings training has actually proven.
    pub verified: Option<LinkSettings>,
    /// Settings the link is running at right now.
    pub current: Option<LinkSettings>,
    pub trained: bool,
    pub training: TrainingPhase,

    // Topology state.
    pub payload_table: VcPayloadTable,
    pub mst: MstState,
    pub(crate) sideband_seqno: u8,

    // Tunneled-bandwidth ledger.
    pub dpia: DpiaBwState,
}

/// A link shared across threads. One lock per link; operations on
/// different links never contend.
pub type SharedLink = Arc<Mutex<Link>>;

impl Link {
    pub fn new(
        id: LinkId,
        connector: ConnectorType,
        encoder_kind: EncoderKind,
        endpoint: LinkEndpoint,
        audio_capable: bool,
        io: LinkIo,
    ) -> Self {
        Self {
            id,
            connector,
            encoder_kind,
            endpoint,
            audio_capable,
            io,
            connection: ConnectionType::None,
            signal: None,
            transaction: None,
            sink: None,
            sink_count: 0,
            caps: None,
            reported: None,
            verified: None,
            current: None,
            trained: false,
            training: TrainingPhase::default(),
            payload_table: VcPayloadTable::new(),
            mst: MstState::default(),
            sideband_seqno: 0,
            dpia: DpiaBwState::default(),
        }
    }

    pub fn is_tunneled(&self) -> bool {
        self.endpoint == LinkEndpoint::Tunneled
    }

    // ── Upward interface ─────────────────────────────────────────

    /// Run a detection pass and, for MST-capable sinks, bring the branch
    /// topology up (degrading to SST when enumeration fails).
    pub fn detect(&mut self, reason: DetectReason) -> Result<DetectionResult, DpError> {
        let mut result = SinkDetector::detect(self, reason)?;
        if let Some(caps) = &self.caps {
            self.reported = Some(caps.max_settings());
        }

        if result.connection != ConnectionType::None
            && self.is_tunneled()
            && !self.dpia.is_enabled()
        {
            match DpiaBwAllocator::enable(self) {
                Ok(true) => {}
                Ok(false) => {
                    info!(link = %self.id, "tunnel agent lacks bw-allocation support");
                }
                Err(e) => {
                    warn!(link = %self.id, error = %e, "bw-allocation enable failed");
                }
            }
        }

        if result.connection == ConnectionType::Single
            && self.caps.as_ref().is_some_and(|c| c.mst_capable)
        {
            match MstTopologyManager::start_topology(self) {
                Ok(()) => result.connection = ConnectionType::MstBranch,
                Err(e) => {
                    warn!(link = %self.id, error = %e, "mst unavailable, running sst");
                }
            }
        }
        Ok(result)
    }

    /// Bring a stream up on this link: train if needed, secure tunneled
    /// bandwidth, allocate a virtual channel on MST, start output.
    pub fn enable_stream(&mut self, stream: &mut Stream) -> Result<(), DpError> {
        if self.connection == ConnectionType::None {
            return Err(DpError::InvalidTransition("no sink connected"));
        }

        // TMDS/analog signals have no training sequence; only the DP
        // family runs the trainer.
        let dp_family = self.signal.is_some_and(|s| s.is_dp_family());
        if dp_family && !self.trained {
            let requested = self
                .verified
                .or(self.reported)
                .ok_or(DpError::InvalidTransition("no link settings to train at"))?;
            let opts = TrainOptions {
                requested,
                skip_video_pattern: requested.rate != LinkRate::lowest(),
                // The PHY is already up when another stream shares it.
                fresh_phy: !(self.connection == ConnectionType::MstBranch
                    && !self.payload_table.is_empty()),
            };
            match LinkTrainer::train(self, opts) {
                Ok(_) => {}
                Err(e) if self.connection == ConnectionType::MstBranch => {
                    // A branch that will not train cannot host any
                    // stream at all.
                    return Err(e);
                }
                Err(e) => {
                    // SST keeps going blanked rather than crashing the
                    // display path.
                    warn!(link = %self.id, error = %e, "training failed, blanking stream");
                    self.io.encoder.disable_output(stream.id);
                    return Ok(());
                }
            }
        }

        if self.is_tunneled() && self.dpia.is_enabled() {
            let mbps = (stream.demand_kbps() / 1000) as u32;
            match DpiaBwAllocator::request_bandwidth(self, mbps)? {
                RequestOutcome::Denied => {
                    warn!(link = %self.id, stream = %stream.id, mbps, "tunnel bandwidth denied");
                    return Err(DpError::Allocation("tunnel bandwidth denied"));
                }
                RequestOutcome::Granted(_) | RequestOutcome::Unchanged => {}
            }
        }

        if self.connection == ConnectionType::MstBranch {
            MstTopologyManager::allocate_payload(self, stream)?;
        }

        self.io.encoder.enable_output(stream.id);
        info!(link = %self.id, stream = %stream.id, "stream enabled");
        Ok(())
    }

    /// Stop a stream and release its resources. Best effort: teardown
    /// problems are logged, not surfaced.
    pub fn disable_stream(&mut self, stream: &Stream) {
        self.io.encoder.disable_output(stream.id);
        if self.connection == ConnectionType::MstBranch {
            if let Err(e) = MstTopologyManager::deallocate_payload(self, stream) {
                warn!(link = %self.id, stream = %stream.id, error = %e, "payload deallocation failed");
            }
        }
        info!(link = %self.id, stream = %stream.id, "stream disabled");
    }

    /// Re-point a stream's virtual channel after a mode or compression
    /// change, growing or shrinking in the order that never over-commits
    /// the link.
    pub fn update_stream(&mut self, stream: &Stream) -> Result<(), DpError> {
        if self.connection != ConnectionType::MstBranch {
            return Ok(());
        }
        let Some(entry) = self.payload_table.entry(stream.id).copied() else {
            return Err(DpError::Allocation("stream holds no virtual channel"));
        };
        let new_pbn = pbn::pbn_from_kbps(stream.demand_kbps());
        if new_pbn > entry.pbn as u32 {
            MstTopologyManager::increase_payload(self, stream)
        } else if new_pbn < entry.pbn as u32 {
            MstTopologyManager::reduce_payload(self, stream)
        } else {
            Ok(())
        }
    }

    /// Admission check for a candidate timing: pure local arithmetic
    /// against the capability snapshot, the dongle ceiling, the slot
    /// budget and the tunneled-bandwidth ledger.
    pub fn validate_mode(&self, timing: &StreamTiming) -> Result<(), DpError> {
        if let Some(sink) = &self.sink {
            if let Some(ceiling) = sink.pixel_clock_ceiling_khz() {
                if timing.pixel_clock_khz > ceiling {
                    return Err(DpError::ModeRejected("pixel clock above dongle ceiling"));
                }
            }
        }

        // TMDS/analog paths are bounded by the dongle/connector ceiling
        // alone; link-bandwidth arithmetic applies to the DP family.
        if !self.signal.is_some_and(|s| s.is_dp_family()) {
            return Ok(());
        }

        let settings = self
            .current
            .or(self.verified)
            .or(self.reported)
            .ok_or(DpError::ModeRejected("no link capability known"))?;
        if timing.peak_kbps() > settings.bandwidth_kbps() {
            return Err(DpError::ModeRejected("timing exceeds link bandwidth"));
        }

        if self.connection == ConnectionType::MstBranch {
            let per_slot = pbn::pbn_per_slot(&settings);
            let need = pbn::slots_for_pbn(pbn::pbn_from_kbps(timing.peak_kbps()), per_slot);
            if need > self.payload_table.free_slots() {
                return Err(DpError::ModeRejected("not enough free time slots"));
            }
        }

        if let Some(usable) = self.dpia.usable_mbps() {
            if timing.peak_kbps() / 1000 > usable as u64 {
                return Err(DpError::ModeRejected("timing exceeds tunnel bandwidth"));
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aux::{AuxReply, RawEdid};
    use crate::stream::StreamId;
    use crate::train::PatternKind;
    use crate::wait::NoopWait;

    struct DeadAux;
    impl AuxTransport for DeadAux {
        fn aux_read(&mut self, _: u32, _: &mut [u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Nack)
        }
        fn aux_write(&mut self, _: u32, _: &[u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Nack)
        }
        fn i2c_read(&mut self, _: u8, _: u8, _: &mut [u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Nack)
        }
        fn i2c_write(&mut self, _: u8, _: u8, _: &[u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Nack)
        }
    }

    struct NoHpd;
    impl HotplugSense for NoHpd {
        fn hpd_asserted(&mut self) -> Result<bool, DpError> {
            Ok(false)
        }
    }

    struct NoEdid;
    impl EdidSource for NoEdid {
        fn read_edid(&mut self) -> Result<RawEdid, DpError> {
            Ok(RawEdid(vec![0; 128]))
        }
    }

    struct NullEncoder;
    impl EncoderControl for NullEncoder {
        fn phy_setup(&mut self, _: &LinkSettings) {}
        fn set_pattern(&mut self, _: PatternKind) {}
        fn set_drive(&mut self, _: u8, _: u8) {}
        fn enable_output(&mut self, _: StreamId) {}
        fn disable_output(&mut self, _: StreamId) {}
        fn set_throttled_vcp_size(&mut self, _: StreamId, _: u32) {}
    }

    struct NullClock;
    impl SymbolClock for NullClock {
        fn provision(&mut self, _: &LinkSettings) {}
    }

    fn fixture() -> Link {
        let mut link = Link::new(
            LinkId(0),
            ConnectorType::DisplayPort,
            EncoderKind::DpPhy,
            LinkEndpoint::NativePhy,
            false,
            LinkIo {
                aux: Box::new(DeadAux),
                hpd: Box::new(NoHpd),
                edid: Box::new(NoEdid),
                encoder: Box::new(NullEncoder),
                clock: Box::new(NullClock),
                wait: Box::new(NoopWait::default()),
            },
        );
        link.signal = Some(crate::detect::SignalType::DisplayPort);
        link
    }

    #[test]
    fn validate_mode_without_capability_is_rejected() {
        let link = fixture();
        let timing = StreamTiming {
            pixel_clock_khz: 148_500,
            bpp: 24,
        };
        assert!(matches!(
            link.validate_mode(&timing),
            Err(DpError::ModeRejected(_))
        ));
    }

    #[test]
    fn validate_mode_against_link_bandwidth() {
        let mut link = fixture();
        link.current = Some(LinkSettings::new(
            crate::settings::LinkRate::Rbr,
            crate::settings::LaneCount::One,
        ));
        // RBR x1 carries 1,296,000 kbps.
        let ok = StreamTiming {
            pixel_clock_khz: 25_175,
            bpp: 24,
        };
        assert!(link.validate_mode(&ok).is_ok());

        let too_big = StreamTiming {
            pixel_clock_khz: 148_500,
            bpp: 24,
        };
        assert!(link.validate_mode(&too_big).is_err());
    }

    #[test]
    fn validate_mode_against_tunnel_ceiling() {
        let mut link = fixture();
        link.current = Some(LinkSettings::new(
            crate::settings::LinkRate::Hbr2,
            crate::settings::LaneCount::Four,
        ));
        link.dpia.phase = crate::dpia::DpiaPhase::Granted;
        link.dpia.allocated_mbps = 1000;

        // 1.485 Gbps timing over a 1 Gbps tunnel grant.
        let timing = StreamTiming {
            pixel_clock_khz: 61_875,
            bpp: 24,
        };
        assert!(matches!(
            link.validate_mode(&timing),
            Err(DpError::ModeRejected("timing exceeds tunnel bandwidth"))
        ));
    }

    #[test]
    fn enable_stream_without_sink_fails() {
        let mut link = fixture();
        let mut stream = Stream::new(
            StreamId(0),
            LinkId(0),
            StreamTiming {
                pixel_clock_khz: 148_500,
                bpp: 24,
            },
            crate::stream::DscLimits::unsupported(),
        );
        assert!(matches!(
            link.enable_stream(&mut stream),
            Err(DpError::InvalidTransition(_))
        ));
    }
}
