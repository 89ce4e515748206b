//! Link settings: rate, lane count, spread, and the fallback ladder.

use std::fmt;

use crate::error::DpError;

// ── LinkRate ─────────────────────────────────────────────────────

/// Main-link symbol rate, encoded as the standard link-rate code
/// (units of 0.27 Gbps per lane).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkRate {
    /// 1.62 Gbps per lane.
    Rbr = 0x06,
    /// 2.7 Gbps per lane.
    Hbr = 0x0A,
    /// 5.4 Gbps per lane.
    Hbr2 = 0x14,
    /// 8.1 Gbps per lane.
    Hbr3 = 0x1E,
}

impl TryFrom<u8> for LinkRate {
    type Error = DpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x06 => Ok(LinkRate::Rbr),
            0x0A => Ok(LinkRate::Hbr),
            0x14 => Ok(LinkRate::Hbr2),
            0x1E => Ok(LinkRate::Hbr3),
            _ => Err(DpError::UnknownVariant {
                type_name: "LinkRate",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for LinkRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gbps = match self {
            LinkRate::Rbr => "1.62",
            LinkRate::Hbr => "2.70",
            LinkRate::Hbr2 => "5.40",
            LinkRate::Hbr3 => "8.10",
        };
        write!(f, "{gbps} Gbps")
    }
}

impl LinkRate {
    /// Raw symbol rate per lane in kbps (before 8b/10b overhead).
    pub fn symbol_rate_kbps(self) -> u64 {
        (self as u64) * 270_000
    }

    /// One step down the rate ladder, or `None` at the floor.
    pub fn step_down(self) -> Option<LinkRate> {
        match self {
            LinkRate::Hbr3 => Some(LinkRate::Hbr2),
            LinkRate::Hbr2 => Some(LinkRate::Hbr),
            LinkRate::Hbr => Some(LinkRate::Rbr),
            LinkRate::Rbr => None,
        }
    }

    /// The lowest defined rate.
    pub fn lowest() -> LinkRate {
        LinkRate::Rbr
    }
}

// ── LaneCount ────────────────────────────────────────────────────

/// Active main-link lane count. Only 1, 2 and 4 are defined.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LaneCount {
    One = 1,
    Two = 2,
    Four = 4,
}

impl TryFrom<u8> for LaneCount {
    type Error = DpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(LaneCount::One),
            2 => Ok(LaneCount::Two),
            4 => Ok(LaneCount::Four),
            _ => Err(DpError::UnknownVariant {
                type_name: "LaneCount",
                value: value as u64,
            }),
        }
    }
}

impl LaneCount {
    /// Halve the lane count, or `None` below one lane.
    pub fn step_down(self) -> Option<LaneCount> {
        match self {
            LaneCount::Four => Some(LaneCount::Two),
            LaneCount::Two => Some(LaneCount::One),
            LaneCount::One => None,
        }
    }
}

// ── LinkSettings ─────────────────────────────────────────────────

/// One point in the (rate, lane count, spread) configuration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub rate: LinkRate,
    pub lanes: LaneCount,
    /// Down-spread enabled on the main link.
    pub spread: bool,
}

impl LinkSettings {
    pub fn new(rate: LinkRate, lanes: LaneCount) -> Self {
        Self {
            rate,
            lanes,
            spread: false,
        }
    }

    /// Total usable data bandwidth in kbps after 8b/10b overhead.
    ///
    /// Monotonically non-decreasing in rate and lane count; doubling the
    /// lane count exactly doubles the result.
    pub fn bandwidth_kbps(&self) -> u64 {
        self.rate.symbol_rate_kbps() * (self.lanes as u64) * 8 / 10
    }

    /// Component-wise minimum of two settings (used to cap a request to
    /// the sink's verified/reported capability).
    pub fn min(&self, other: &LinkSettings) -> LinkSettings {
        LinkSettings {
            rate: self.rate.min(other.rate),
            lanes: self.lanes.min(other.lanes),
            spread: self.spread && other.spread,
        }
    }

    /// One step down the fallback ladder: lane count is reduced first;
    /// once a single lane fails, the rate steps down and the lane count
    /// is restored to `max.lanes`.
    ///
    /// Returns `None` when the ladder is exhausted (1 lane at the lowest
    /// rate already failed). Never yields 0 lanes or an undefined rate.
    pub fn fallback(&self, max: &LinkSettings) -> Option<LinkSettings> {
        if let Some(lanes) = self.lanes.step_down() {
            return Some(LinkSettings { lanes, ..*self });
        }
        self.rate.step_down().map(|rate| LinkSettings {
            rate,
            lanes: max.lanes,
            spread: self.spread,
        })
    }
}

impl fmt::Display for LinkSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{}", self.rate, self.lanes as u8)
    }
}

// ── Tests ────────────────────────────────────────────────────────
