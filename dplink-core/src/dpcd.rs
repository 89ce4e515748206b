//! DPCD register map and bitfield views.
//!
//! Addresses and bit positions are the industry-standard DisplayPort
//! Configuration Data offsets; the rest of the crate never hard-codes a
//! raw address outside this module.

use bitflags::bitflags;

// ── Receiver capability field (0x00000..) ────────────────────────

/// DPCD revision.
pub const DPCD_REV: u32 = 0x00000;
/// Maximum link rate the sink advertises (link-rate code).
pub const MAX_LINK_RATE: u32 = 0x00001;
/// Maximum lane count, bits 0-4; bit 7 = enhanced framing.
pub const MAX_LANE_COUNT: u32 = 0x00002;
/// Max down-spread, bit 0 = spread supported.
pub const MAX_DOWNSPREAD: u32 = 0x00003;
/// Downstream port presence, bit 0.
pub const DOWNSTREAMPORT_PRESENT: u32 = 0x00005;
/// eDP configuration capability, bit 0 = alternate scrambler reset.
pub const EDP_CONFIGURATION_CAP: u32 = 0x0000D;
/// Training AUX read interval, bits 0-6 in units of 4 ms (0 = 100 us).
pub const TRAINING_AUX_RD_INTERVAL: u32 = 0x0000E;
/// MST capability, bit 0.
pub const MSTM_CAP: u32 = 0x00021;
/// Number of attached sinks, bits 0-5.
pub const SINK_COUNT_CAP: u32 = 0x00022;
/// DSC support, bit 0 of the DSC capability field.
pub const DSC_SUPPORT: u32 = 0x00060;

// ── Link configuration field (0x00100..) ─────────────────────────

/// Link rate in use (link-rate code), or 0 when the rate-table select
/// register is used instead.
pub const LINK_BW_SET: u32 = 0x00100;
/// Lane count in use, bits 0-4; bit 7 = enhanced framing enable.
pub const LANE_COUNT_SET: u32 = 0x00101;
/// Training pattern select, bits 0-3; bit 5 = scrambling disable.
pub const TRAINING_PATTERN_SET: u32 = 0x00102;
/// Per-lane drive settings, one byte per lane.
pub const TRAINING_LANE0_SET: u32 = 0x00103;
/// Down-spread control, bit 4 = spread enabled.
pub const DOWNSPREAD_CTRL: u32 = 0x00107;
/// eDP panel mode / alternate scrambler, bit 0.
pub const EDP_CONFIGURATION_SET: u32 = 0x0010A;
/// MST control, bit 0 = MST_EN, bit 1 = UP_REQ_EN, bit 2 = UPSTREAM_IS_SRC.
pub const MSTM_CTRL: u32 = 0x00111;
/// eDP link-rate table select (index into the sink rate table).
pub const LINK_RATE_SET: u32 = 0x00115;

// ── Payload table field (0x001C0..) ──────────────────────────────

/// Payload allocation: virtual channel payload ID.
pub const PAYLOAD_ALLOCATE_SET: u32 = 0x001C0;
/// Payload allocation: start time slot.
pub const PAYLOAD_ALLOCATE_START_TIME_SLOT: u32 = 0x001C1;
/// Payload allocation: time slot count.
pub const PAYLOAD_ALLOCATE_TIME_SLOT_COUNT: u32 = 0x001C2;

// ── Sink status field (0x00200..) ────────────────────────────────

/// Attached-sink count, bits 0-5.
pub const SINK_COUNT: u32 = 0x00200;
/// Device service IRQ vector, bit 4 = DOWN_REP ready, bit 5 = UP_REQ ready.
pub const DEVICE_SERVICE_IRQ_VECTOR: u32 = 0x00201;
/// Lane 0/1 status.
pub const LANE0_1_STATUS: u32 = 0x00202;
/// Lane 2/3 status.
pub const LANE2_3_STATUS: u32 = 0x00203;
/// Lane alignment status, bit 0 = interlane align done.
pub const LANE_ALIGN_STATUS_UPDATED: u32 = 0x00204;
/// Adjust request for lanes 0/1 (swing bits 0-1/4-5, pre-emphasis 2-3/6-7).
pub const ADJUST_REQUEST_LANE0_1: u32 = 0x00206;
/// Adjust request for lanes 2/3.
pub const ADJUST_REQUEST_LANE2_3: u32 = 0x00207;

/// Payload table update status.
pub const PAYLOAD_TABLE_UPDATE_STATUS: u32 = 0x002C0;

// ── Test/compliance field (0x00250..) ────────────────────────────

/// 80-bit custom test pattern, 10 bytes.
pub const TEST_80BIT_CUSTOM_PATTERN_BASE: u32 = 0x00250;

// ── Source/sink control field (0x00600..) ────────────────────────

/// Sink power state: 0x1 = D0 (on), 0x2 = D3 (powered down).
pub const SET_POWER: u32 = 0x00600;

// ── Branch device field (0x00500..) ──────────────────────────────

/// Branch device OUI, 3 bytes.
pub const BRANCH_OUI: u32 = 0x00500;
/// Branch device identification string, 6 bytes.
pub const BRANCH_DEVICE_ID: u32 = 0x00503;

// ── Sideband message boxes ───────────────────────────────────────

/// Down-request sideband message box (source → branch).
pub const DOWN_REQ_BASE: u32 = 0x01000;
/// Down-reply sideband message box (branch → source).
pub const DOWN_REP_BASE: u32 = 0x01400;
/// Maximum sideband chunk carried per message-box transaction.
pub const SIDEBAND_CHUNK: usize = 48;

// ── DP-in tunneling field (0xE0000..) ────────────────────────────

/// Tunneling capabilities, bit 0 = DP tunneling, bit 7 = BW allocation.
pub const TUNNELING_CAPABILITIES: u32 = 0xE000D;
/// Connection-manager driver BW-allocation capability, bit 7.
pub const USB4_DRIVER_BW_CAPABILITY: u32 = 0xE0020;
/// Requested bandwidth, 1 byte in units of the negotiated granularity.
pub const DPTX_REQUESTED_BW: u32 = 0xE0021;
/// Allocated bandwidth, 1 byte in units of the negotiated granularity.
pub const DPTX_ALLOCATED_BW: u32 = 0xE0022;
/// Estimated bandwidth, 1 byte in units of the negotiated granularity.
pub const DPTX_ESTIMATED_BW: u32 = 0xE0023;
/// Bandwidth granularity, bits 0-1.
pub const DPTX_BW_GRANULARITY: u32 = 0xE0024;
/// Bandwidth-request status, see [`DpiaStatus`].
pub const DPTX_STATUS: u32 = 0xE0025;
/// Bandwidth-allocation mode control, top bit = enable.
pub const DPTX_BW_ALLOCATION_MODE_CONTROL: u32 = 0xE0030;

// ── Bitfield views ───────────────────────────────────────────────

bitflags! {
    /// Per-lane-pair status as read from `LANE0_1_STATUS` / `LANE2_3_STATUS`.
    ///
    /// The low nibble describes the even lane, the high nibble the odd lane.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LanePairStatus: u8 {
        const CR_DONE_LOW        = 1 << 0;
        const EQ_DONE_LOW        = 1 << 1;
        const SYMBOL_LOCKED_LOW  = 1 << 2;
        const CR_DONE_HIGH       = 1 << 4;
        const EQ_DONE_HIGH       = 1 << 5;
        const SYMBOL_LOCKED_HIGH = 1 << 6;
    }
}

bitflags! {
    /// `LANE_ALIGN_STATUS_UPDATED` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AlignStatus: u8 {
        const INTERLANE_ALIGN_DONE = 1 << 0;
        const DOWNSTREAM_PORT_STATUS_CHANGED = 1 << 6;
        const LINK_STATUS_UPDATED = 1 << 7;
    }
}

bitflags! {
    /// `PAYLOAD_TABLE_UPDATE_STATUS` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PayloadTableStatus: u8 {
        /// The branch device consumed the last table write.
        const TABLE_UPDATED = 1 << 0;
        /// The branch device acted on the allocation change trigger.
        const ACT_HANDLED   = 1 << 1;
    }
}

bitflags! {
    /// `MSTM_CTRL` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MstmCtrl: u8 {
        const MST_EN         = 1 << 0;
        const UP_REQ_EN      = 1 << 1;
        const UPSTREAM_IS_SRC = 1 << 2;
    }
}

bitflags! {
    /// `DPTX_STATUS` bits reported by the bandwidth-management agent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DpiaStatus: u8 {
        /// The last bandwidth request was granted.
        const REQUEST_SUCCEEDED = 1 << 0;
        /// The last bandwidth request was denied.
        const REQUEST_FAILED    = 1 << 1;
        /// The estimated-bandwidth register changed.
        const ESTIMATED_CHANGED = 1 << 2;
        /// A response (either way) is ready to be read.
        const RESPONSE_READY    = 1 << 7;
    }
}

/// `SET_POWER` values.
pub const POWER_D0: u8 = 0x1;
/// `SET_POWER` value for the low-power state.
pub const POWER_D3: u8 = 0x2;

/// `TUNNELING_CAPABILITIES` bit for DP-in tunneling support.
pub const TUNNELING_SUPPORT: u8 = 1 << 0;
/// `TUNNELING_CAPABILITIES` bit for in-band BW allocation support.
pub const TUNNELING_BW_ALLOC_SUPPORT: u8 = 1 << 7;
/// `USB4_DRIVER_BW_CAPABILITY` bit for CM-side BW allocation support.
pub const DRIVER_BW_ALLOC_SUPPORT: u8 = 1 << 7;
/// `DPTX_BW_ALLOCATION_MODE_CONTROL` enable bit.
pub const BW_ALLOC_MODE_ENABLE: u8 = 1 << 7;

impl LanePairStatus {
    /// Clock recovery done for the lane at `index` within this pair
    /// (0 = low nibble, 1 = high nibble).
    pub fn cr_done(self, index: u8) -> bool {
        match index {
            0 => self.contains(Self::CR_DONE_LOW),
            _ => self.contains(Self::CR_DONE_HIGH),
        }
    }

    /// Channel equalization done for the lane at `index`.
    pub fn eq_done(self, index: u8) -> bool {
        match index {
            0 => self.contains(Self::EQ_DONE_LOW),
            _ => self.contains(Self::EQ_DONE_HIGH),
        }
    }

    /// Symbol lock for the lane at `index`.
    pub fn symbol_locked(self, index: u8) -> bool {
        match index {
            0 => self.contains(Self::SYMBOL_LOCKED_LOW),
            _ => self.contains(Self::SYMBOL_LOCKED_HIGH),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_pair_nibbles() {
        let status = LanePairStatus::from_bits_truncate(0x71);
        // Low lane: CR only. High lane: CR + EQ + symbol lock.
        assert!(status.cr_done(0));
        assert!(!status.eq_done(0));
        assert!(status.cr_done(1));
        assert!(status.eq_done(1));
        assert!(status.symbol_locked(1));
    }

    #[test]
    fn payload_status_bits() {
        let s = PayloadTableStatus::from_bits_truncate(0x03);
        assert!(s.contains(PayloadTableStatus::TABLE_UPDATED));
        assert!(s.contains(PayloadTableStatus::ACT_HANDLED));
    }
}
