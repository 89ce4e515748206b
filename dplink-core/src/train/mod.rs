//! Electrical link training.
//!
//! Drives the clock-recovery / channel-equalization sequence for one
//! (rate, lane count) setting and walks the fallback ladder on repeated
//! failure. Also exposes receiver power control and test-pattern
//! injection as standalone operations for compliance testing.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::aux::{self, AuxTransport};
use crate::caps::{BranchId, SinkCapabilities};
use crate::detect::SignalType;
use crate::dpcd;
use crate::error::DpError;
use crate::link::Link;
use crate::settings::{LinkRate, LinkSettings};

/// Overall training attempts before giving up, counting every ladder
/// step.
pub const MAX_TRAIN_ATTEMPTS: u32 = 6;
/// Same-voltage retries within one clock-recovery phase.
const CR_MAX_LOOPS: u32 = 4;
/// Equalization iterations within one channel-eq phase.
const EQ_MAX_LOOPS: u32 = 5;
/// Highest voltage-swing level the PHY can drive.
const MAX_SWING: u8 = 3;

// ── Training phase state machine ─────────────────────────────────

/// Lifecycle of one training sequence.
///
/// ```text
///  Idle ──► ClockRecovery ──► ChannelEqualization ──► Trained
///               │                     │
///               └──────► Failed ◄─────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingPhase {
    #[default]
    Idle,
    ClockRecovery,
    ChannelEqualization,
    Trained,
    Failed,
}

impl TrainingPhase {
    /// Valid from `Idle` (or a terminal state, when retraining).
    pub fn begin_clock_recovery(&mut self) -> Result<(), DpError> {
        match self {
            Self::Idle | Self::Trained | Self::Failed => {
                *self = Self::ClockRecovery;
                Ok(())
            }
            _ => Err(DpError::InvalidTransition(
                "clock recovery requires an idle link",
            )),
        }
    }

    /// Valid from `ClockRecovery`.
    pub fn begin_channel_eq(&mut self) -> Result<(), DpError> {
        match self {
            Self::ClockRecovery => {
                *self = Self::ChannelEqualization;
                Ok(())
            }
            _ => Err(DpError::InvalidTransition(
                "channel eq requires completed clock recovery",
            )),
        }
    }

    /// Valid from `ChannelEqualization`.
    pub fn complete(&mut self) -> Result<(), DpError> {
        match self {
            Self::ChannelEqualization => {
                *self = Self::Trained;
                Ok(())
            }
            _ => Err(DpError::InvalidTransition(
                "training completes only from channel eq",
            )),
        }
    }

    /// Valid from either training state.
    pub fn fail(&mut self) -> Result<(), DpError> {
        match self {
            Self::ClockRecovery | Self::ChannelEqualization => {
                *self = Self::Failed;
                Ok(())
            }
            _ => Err(DpError::InvalidTransition(
                "only an in-flight training can fail",
            )),
        }
    }

    /// Force back to `Idle` (ladder restart).
    pub fn reset(&mut self) {
        *self = Self::Idle;
    }

    pub fn is_trained(&self) -> bool {
        matches!(self, Self::Trained)
    }
}

// ── Patterns and panel mode ──────────────────────────────────────

/// Main-link pattern driven on the PHY and announced to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Normal video / idle.
    Off,
    Training1,
    Training2,
    Training3,
    /// 80-bit custom compliance pattern.
    Custom80([u8; 10]),
}

impl PatternKind {
    /// `TRAINING_PATTERN_SET` encoding. Training patterns disable
    /// scrambling (bit 5).
    fn dpcd_value(&self) -> u8 {
        match self {
            PatternKind::Off => 0x00,
            PatternKind::Training1 => 0x21,
            PatternKind::Training2 => 0x22,
            PatternKind::Training3 => 0x23,
            PatternKind::Custom80(_) => 0x30,
        }
    }
}

/// Sink-side panel protocol selected before training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelMode {
    Default,
    Edp,
    /// A known VGA/LVDS converter branch that needs the alternate
    /// scrambler behavior despite not being eDP.
    SpecialVendor,
}

/// Branch converters that require the vendor-special panel mode,
/// matched on (OUI, device identification string).
const SPECIAL_VENDOR_BRANCHES: [([u8; 3], [u8; 6]); 2] = [
    ([0x00, 0x22, 0xB9], *b"sivarT"),
    ([0x00, 0x00, 0x1A], *b"dnomlA"),
];

fn is_special_vendor(branch: &BranchId) -> bool {
    SPECIAL_VENDOR_BRANCHES
        .iter()
        .any(|(oui, id)| branch.oui == *oui && branch.id == *id)
}

/// Decide the panel mode from branch identity and eDP capability.
pub fn decide_panel_mode(signal: SignalType, caps: &SinkCapabilities) -> PanelMode {
    if let Some(branch) = &caps.branch {
        if is_special_vendor(branch) {
            return PanelMode::SpecialVendor;
        }
    }
    if signal == SignalType::Edp || caps.edp_alt_scrambler {
        return PanelMode::Edp;
    }
    PanelMode::Default
}

// ── Entry parameters / outcome ───────────────────────────────────

/// Parameters for one training run.
#[derive(Debug, Clone, Copy)]
pub struct TrainOptions {
    pub requested: LinkSettings,
    /// Skip the post-training video pattern (false only at the lowest
    /// rate).
    pub skip_video_pattern: bool,
    /// The PHY needs fresh setup (false only when an already-trained MST
    /// link gains another stream on the shared PHY).
    pub fresh_phy: bool,
}

/// Result of a successful training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainOutcome {
    pub settings: LinkSettings,
    pub fallback_steps: u32,
    pub attempts: u32,
}

// ── LinkTrainer ──────────────────────────────────────────────────

/// Training sequencer over one link.
pub struct LinkTrainer;

impl LinkTrainer {
    /// Train the link, walking the fallback ladder on failure.
    ///
    /// The starting point is the component-wise minimum of the request
    /// and the sink's verified/reported capability. Returns
    /// [`DpError::TrainingFailed`] exactly once, after the attempt
    /// budget or the ladder is exhausted.
    pub fn train(link: &mut Link, opts: TrainOptions) -> Result<TrainOutcome, DpError> {
        let caps = link
            .caps
            .clone()
            .ok_or(DpError::InvalidTransition("no sink capability snapshot"))?;
        let signal = link
            .signal
            .ok_or(DpError::InvalidTransition("no signal classified"))?;

        let verified = link.verified.unwrap_or_else(|| caps.max_settings());
        let max = opts.requested.min(&verified);
        let mut setting = max;
        let mut fallback_steps = 0u32;
        let mut attempts = 0u32;

        let panel_mode = decide_panel_mode(signal, &caps);
        Self::apply_panel_mode(link.io.aux.as_mut(), panel_mode)?;

        loop {
            attempts += 1;
            link.training.reset();
            debug!(link = %link.id, %setting, attempts, "training attempt");

            if opts.fresh_phy {
                link.io.encoder.phy_setup(&setting);
            }
            Self::write_link_config(link.io.aux.as_mut(), signal, &setting, &caps)?;

            link.training.begin_clock_recovery()?;
            let cr_ok = Self::clock_recovery(link, &setting, &caps)?;
            let eq_ok = if cr_ok {
                link.training.begin_channel_eq()?;
                Self::channel_eq(link, &setting, &caps)?
            } else {
                false
            };

            if cr_ok && eq_ok {
                link.training.complete()?;
                Self::set_pattern_both(link, PatternKind::Off)?;
                if !opts.skip_video_pattern {
                    // Lowest-rate runs hand off through an idle-pattern
                    // settle so the sink re-locks before live video.
                    Self::pace(link, caps.training_interval());
                }
                break;
            }

            link.training.fail()?;
            if attempts >= MAX_TRAIN_ATTEMPTS {
                warn!(link = %link.id, attempts, "training attempt budget exhausted");
                return Err(DpError::TrainingFailed {
                    attempts,
                    rate: setting.rate,
                    lanes: setting.lanes as u8,
                });
            }
            match setting.fallback(&max) {
                Some(next) => {
                    info!(link = %link.id, from = %setting, to = %next, "training fallback");
                    setting = next;
                    fallback_steps += 1;
                }
                None => {
                    warn!(link = %link.id, "fallback ladder exhausted");
                    return Err(DpError::TrainingFailed {
                        attempts,
                        rate: setting.rate,
                        lanes: setting.lanes as u8,
                    });
                }
            }
        }

        let changed = link.current != Some(setting);
        link.current = Some(setting);
        link.verified = Some(setting);
        link.trained = true;
        // Any VC bookkeeping from a previous topology is stale at the
        // newly committed timing.
        link.payload_table.clear();
        if changed {
            link.io.clock.provision(&setting);
        }
        info!(link = %link.id, %setting, fallback_steps, "link trained");

        Ok(TrainOutcome {
            settings: setting,
            fallback_steps,
            attempts,
        })
    }

    // ── Standalone operations ────────────────────────────────────

    /// Receiver power control (D0 = on, D3 = low power).
    pub fn set_power(link: &mut Link, on: bool) -> Result<(), DpError> {
        let value = if on { dpcd::POWER_D0 } else { dpcd::POWER_D3 };
        aux::write_dpcd_byte(link.io.aux.as_mut(), dpcd::SET_POWER, value)
    }

    /// Drive an explicit pattern on PHY and sink (compliance testing).
    pub fn set_test_pattern(link: &mut Link, pattern: PatternKind) -> Result<(), DpError> {
        Self::set_pattern_both(link, pattern)
    }

    // ── Sequence internals ───────────────────────────────────────

    fn apply_panel_mode(aux: &mut dyn AuxTransport, mode: PanelMode) -> Result<(), DpError> {
        let value = match mode {
            PanelMode::Default => 0x00,
            PanelMode::Edp | PanelMode::SpecialVendor => 0x01,
        };
        aux::write_dpcd_byte(aux, dpcd::EDP_CONFIGURATION_SET, value)
    }

    fn write_link_config(
        aux: &mut dyn AuxTransport,
        signal: SignalType,
        setting: &LinkSettings,
        caps: &SinkCapabilities,
    ) -> Result<(), DpError> {
        if signal == SignalType::Edp && caps.dpcd_rev >= 0x13 {
            // eDP 1.4 sinks take an index into their advertised rate
            // table instead of a rate code.
            let index = match setting.rate {
                LinkRate::Rbr => 0u8,
                LinkRate::Hbr => 1,
                LinkRate::Hbr2 => 2,
                LinkRate::Hbr3 => 3,
            };
            aux::write_dpcd_byte(aux, dpcd::LINK_RATE_SET, index)?;
        } else {
            aux::write_dpcd_byte(aux, dpcd::LINK_BW_SET, setting.rate as u8)?;
        }

        let mut lanes = setting.lanes as u8;
        if caps.enhanced_framing {
            lanes |= 0x80;
        }
        aux::write_dpcd_byte(aux, dpcd::LANE_COUNT_SET, lanes)?;
        aux::write_dpcd_byte(
            aux,
            dpcd::DOWNSPREAD_CTRL,
            if setting.spread { 0x10 } else { 0x00 },
        )
    }

    fn set_pattern_both(link: &mut Link, pattern: PatternKind) -> Result<(), DpError> {
        link.io.encoder.set_pattern(pattern);
        if let PatternKind::Custom80(bits) = pattern {
            aux::write_dpcd(
                link.io.aux.as_mut(),
                dpcd::TEST_80BIT_CUSTOM_PATTERN_BASE,
                &bits,
            )?;
        }
        aux::write_dpcd_byte(
            link.io.aux.as_mut(),
            dpcd::TRAINING_PATTERN_SET,
            pattern.dpcd_value(),
        )
    }

    /// Write per-lane drive settings (same level on all lanes) to sink
    /// and PHY.
    fn write_drive(
        link: &mut Link,
        lanes: u8,
        swing: u8,
        pre_emphasis: u8,
    ) -> Result<(), DpError> {
        let mut byte = (swing & 0x3) | ((pre_emphasis & 0x3) << 3);
        if swing >= MAX_SWING {
            byte |= 0x04;
        }
        if pre_emphasis >= 2 {
            byte |= 0x20;
        }
        let set = [byte; 4];
        aux::write_dpcd(
            link.io.aux.as_mut(),
            dpcd::TRAINING_LANE0_SET,
            &set[..lanes as usize],
        )?;
        link.io.encoder.set_drive(swing, pre_emphasis);
        Ok(())
    }

    /// Highest swing/pre-emphasis the sink asks for across active lanes.
    fn read_adjust_request(link: &mut Link, lanes: u8) -> Result<(u8, u8), DpError> {
        let mut adj = [0u8; 2];
        aux::read_dpcd(link.io.aux.as_mut(), dpcd::ADJUST_REQUEST_LANE0_1, &mut adj)?;
        let mut swing = 0u8;
        let mut pre = 0u8;
        for lane in 0..lanes {
            let byte = adj[(lane / 2) as usize];
            let nibble = if lane % 2 == 0 { byte & 0xF } else { byte >> 4 };
            swing = swing.max(nibble & 0x3);
            pre = pre.max((nibble >> 2) & 0x3);
        }
        Ok((swing, pre))
    }

    fn lane_status(link: &mut Link) -> Result<[u8; 3], DpError> {
        let mut status = [0u8; 3];
        aux::read_dpcd(link.io.aux.as_mut(), dpcd::LANE0_1_STATUS, &mut status)?;
        Ok(status)
    }

    fn all_cr_done(status: &[u8; 3], lanes: u8) -> bool {
        (0..lanes).all(|lane| {
            let pair = dpcd::LanePairStatus::from_bits_truncate(status[(lane / 2) as usize]);
            pair.cr_done(lane % 2)
        })
    }

    fn all_eq_done(status: &[u8; 3], lanes: u8) -> bool {
        let align = dpcd::AlignStatus::from_bits_truncate(status[2]);
        if !align.contains(dpcd::AlignStatus::INTERLANE_ALIGN_DONE) {
            return false;
        }
        (0..lanes).all(|lane| {
            let pair = dpcd::LanePairStatus::from_bits_truncate(status[(lane / 2) as usize]);
            pair.eq_done(lane % 2) && pair.symbol_locked(lane % 2)
        })
    }

    /// Clock-recovery phase: drive TPS1 and walk the swing ladder until
    /// every lane reports CR-done or the swing range is exhausted.
    fn clock_recovery(
        link: &mut Link,
        setting: &LinkSettings,
        caps: &SinkCapabilities,
    ) -> Result<bool, DpError> {
        Self::set_pattern_both(link, PatternKind::Training1)?;
        let lanes = setting.lanes as u8;
        let mut swing = 0u8;
        let mut pre = 0u8;

        for _ in 0..CR_MAX_LOOPS {
            Self::write_drive(link, lanes, swing, pre)?;
            Self::pace(link, Duration::from_micros(100));

            let status = Self::lane_status(link)?;
            if Self::all_cr_done(&status, lanes) {
                return Ok(true);
            }
            if swing >= MAX_SWING {
                break;
            }
            let (req_swing, req_pre) = Self::read_adjust_request(link, lanes)?;
            // A sink that keeps asking for the same level is not going
            // to converge at this setting.
            if req_swing == swing && req_pre == pre {
                swing += 1;
            } else {
                swing = req_swing;
                pre = req_pre;
            }
        }
        debug!(link = %link.id, %setting, interval = ?caps.training_interval(), "clock recovery failed");
        Ok(false)
    }

    /// Channel-equalization phase at the sink's advertised pacing.
    fn channel_eq(
        link: &mut Link,
        setting: &LinkSettings,
        caps: &SinkCapabilities,
    ) -> Result<bool, DpError> {
        let pattern = if caps.tps3_supported && setting.rate >= LinkRate::Hbr2 {
            PatternKind::Training3
        } else {
            PatternKind::Training2
        };
        Self::set_pattern_both(link, pattern)?;
        let lanes = setting.lanes as u8;

        for _ in 0..EQ_MAX_LOOPS {
            Self::pace(link, caps.training_interval());
            let status = Self::lane_status(link)?;
            if !Self::all_cr_done(&status, lanes) {
                // CR dropped during EQ: this setting is hopeless.
                return Ok(false);
            }
            if Self::all_eq_done(&status, lanes) {
                return Ok(true);
            }
            let (swing, pre) = Self::read_adjust_request(link, lanes)?;
            Self::write_drive(link, lanes, swing, pre)?;
        }
        Ok(false)
    }

    fn pace(link: &mut Link, d: Duration) {
        link.io.wait.wait(d);
    }
}

// ── Tests ────────────────────────────────────────────────────────
