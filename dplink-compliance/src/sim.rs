//! Simulated sink for compliance runs.
//!
//! A small DPCD register file with a configurable training policy —
//! enough to drive the trainer and pattern injection end to end without
//! hardware.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use dplink_core::{
    AuxReply, AuxTransport, ConnectorType, DpError, EdidSource, EncoderControl, EncoderKind,
    HotplugSense, Link, LinkEndpoint, LinkId, LinkIo, LinkSettings, PatternKind, RawEdid,
    SleepWait, StreamId, SymbolClock, dpcd,
};

use crate::config::SinkConfig;

/// Scripted sink state shared by the collaborator adapters.
pub struct SimSink {
    regs: BTreeMap<u32, u8>,
    fail_attempts: u32,
    max_good_lanes: u8,
    attempts_seen: u32,
}

pub type Shared = Rc<RefCell<SimSink>>;

impl SimSink {
    pub fn new(cfg: &SinkConfig) -> Shared {
        let max_rate = crate::config::parse_rate(&cfg.max_rate)
            .unwrap_or(dplink_core::LinkRate::Hbr2);
        let mut regs = BTreeMap::new();
        regs.insert(dpcd::DPCD_REV, 0x12);
        regs.insert(dpcd::MAX_LINK_RATE, max_rate as u8);
        regs.insert(dpcd::MAX_LANE_COUNT, 0xC0 | (cfg.max_lanes & 0x1F));
        regs.insert(dpcd::MAX_DOWNSPREAD, 0x01);
        regs.insert(dpcd::SINK_COUNT, 0x01);
        Rc::new(RefCell::new(Self {
            regs,
            fail_attempts: cfg.fail_attempts,
            max_good_lanes: cfg.max_good_lanes,
            attempts_seen: 0,
        }))
    }

    fn reg(&self, addr: u32) -> u8 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }

    fn active_lanes(&self) -> u8 {
        self.reg(dpcd::LANE_COUNT_SET) & 0x1F
    }

    fn converges(&self) -> bool {
        self.attempts_seen > self.fail_attempts && self.active_lanes() <= self.max_good_lanes
    }

    fn set_lane_status(&mut self, cr: bool, eq: bool) {
        let lanes = self.active_lanes();
        let per_lane = (cr as u8) | (eq as u8) << 1 | (eq as u8) << 2;
        let mut low = 0u8;
        let mut high = 0u8;
        for lane in 0..lanes {
            let nibble = per_lane << ((lane % 2) * 4);
            if lane < 2 {
                low |= nibble;
            } else {
                high |= nibble;
            }
        }
        self.regs.insert(dpcd::LANE0_1_STATUS, low);
        self.regs.insert(dpcd::LANE2_3_STATUS, high);
        self.regs
            .insert(dpcd::LANE_ALIGN_STATUS_UPDATED, if eq { 0x01 } else { 0x00 });
    }

    fn handle_write(&mut self, addr: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.regs.insert(addr + i as u32, b);
        }
        if addr == dpcd::TRAINING_PATTERN_SET {
            match data[0] & 0x0F {
                0x1 => {
                    self.attempts_seen += 1;
                    let ok = self.converges();
                    self.set_lane_status(ok, false);
                }
                0x2 | 0x3 => {
                    let ok = self.converges();
                    self.set_lane_status(ok, ok);
                }
                _ => {}
            }
        }
    }
}

// ── Collaborator adapters ────────────────────────────────────────

struct SimAux(Shared);

impl AuxTransport for SimAux {
    fn aux_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<AuxReply, DpError> {
        let sink = self.0.borrow();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = sink.reg(addr + i as u32);
        }
        Ok(AuxReply::Ack)
    }

    fn aux_write(&mut self, addr: u32, data: &[u8]) -> Result<AuxReply, DpError> {
        self.0.borrow_mut().handle_write(addr, data);
        Ok(AuxReply::Ack)
    }

    fn i2c_read(&mut self, _: u8, _: u8, _: &mut [u8]) -> Result<AuxReply, DpError> {
        Ok(AuxReply::Nack)
    }

    fn i2c_write(&mut self, _: u8, _: u8, _: &[u8]) -> Result<AuxReply, DpError> {
        Ok(AuxReply::Nack)
    }
}

struct SimHpd;

impl HotplugSense for SimHpd {
    fn hpd_asserted(&mut self) -> Result<bool, DpError> {
        Ok(true)
    }
}

struct SimEdid;

impl EdidSource for SimEdid {
    fn read_edid(&mut self) -> Result<RawEdid, DpError> {
        let mut block = vec![0u8; 128];
        block[0..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        Ok(RawEdid(block))
    }
}

struct LoggingEncoder;

impl EncoderControl for LoggingEncoder {
    fn phy_setup(&mut self, settings: &LinkSettings) {
        tracing::debug!(%settings, "phy setup");
    }
    fn set_pattern(&mut self, pattern: PatternKind) {
        tracing::debug!(?pattern, "encoder pattern");
    }
    fn set_drive(&mut self, swing: u8, pre_emphasis: u8) {
        tracing::trace!(swing, pre_emphasis, "drive settings");
    }
    fn enable_output(&mut self, stream: StreamId) {
        tracing::info!(%stream, "output enabled");
    }
    fn disable_output(&mut self, stream: StreamId) {
        tracing::info!(%stream, "output disabled");
    }
    fn set_throttled_vcp_size(&mut self, stream: StreamId, avg_slots_x256: u32) {
        tracing::debug!(%stream, avg_slots_x256, "vcp size");
    }
}

struct LoggingClock;

impl SymbolClock for LoggingClock {
    fn provision(&mut self, settings: &LinkSettings) {
        tracing::info!(%settings, "symbol clock provisioned");
    }
}

/// Build a link wired to a fresh simulated sink.
pub fn simulated_link(cfg: &SinkConfig) -> (Link, Shared) {
    let sink = SimSink::new(cfg);
    let link = Link::new(
        LinkId(0),
        ConnectorType::DisplayPort,
        EncoderKind::DpPhy,
        LinkEndpoint::NativePhy,
        false,
        LinkIo {
            aux: Box::new(SimAux(sink.clone())),
            hpd: Box::new(SimHpd),
            edid: Box::new(SimEdid),
            encoder: Box::new(LoggingEncoder),
            clock: Box::new(LoggingClock),
            wait: Box::new(SleepWait),
        },
    );
    (link, sink)
}
