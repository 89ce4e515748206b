//! Fixed-point PBN (payload bandwidth number) arithmetic.
//!
//! One PBN unit is 54/64 Mbps. Conversions carry the protocol's 0.6%
//! margin factor (x1.006) on the demand side and the 0.994 efficiency
//! factor on the capacity side, all in integer math. Slot-count
//! decisions must round exactly the way the branch device does, and
//! every division that feeds a slot count rounds up.

use crate::settings::LinkSettings;

/// Usable time slots per MTP (slot 0 carries the MTP header).
pub const SLOTS_PER_MTP: u32 = 63;

/// Stream bandwidth demand in kbps → PBN, with the 1.006 margin,
/// rounded up.
pub fn pbn_from_kbps(kbps: u64) -> u32 {
    (kbps * 64 * 1006).div_ceil(54 * 8 * 1000 * 1000) as u32
}

/// PBN → usable kbps at 0.994 link efficiency, rounded down.
pub fn kbps_from_pbn(pbn: u32) -> u64 {
    pbn as u64 * 54 * 8 * 1000 * 994 / (64 * 1000)
}

/// PBN capacity of one time slot at the given link settings, rounded
/// down (under-promising capacity is safe; over-promising is not).
pub fn pbn_per_slot(settings: &LinkSettings) -> u32 {
    pbn_from_kbps(settings.bandwidth_kbps()) / 64
}

/// Time slots needed to carry `pbn` at `per_slot` capacity, rounded up.
pub fn slots_for_pbn(pbn: u32, per_slot: u32) -> u32 {
    pbn.div_ceil(per_slot)
}

/// Average time slots per MTP for the local divider, fixed point x256,
/// rounded up.
pub fn avg_slots_x256(pbn: u32, per_slot: u32) -> u32 {
    (pbn * 256).div_ceil(per_slot)
}

/// Compressed target bpp (x16) that fits a PBN grant for a pixel clock,
/// rounded down and clamped to `[min_x16, max_x16]`.
pub fn bpp_x16_from_pbn(pbn: u32, pixel_clock_khz: u32, min_x16: u32, max_x16: u32) -> u32 {
    let kbps = kbps_from_pbn(pbn);
    let bpp_x16 = (kbps * 16 / pixel_clock_khz as u64) as u32;
    bpp_x16.clamp(min_x16, max_x16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{LaneCount, LinkRate};

    #[test]
    fn pbn_for_4k60() {
        // 533.25 MHz x 24 bpp = 12,798,000 kbps; x1.006 margin over
        // 54/64 Mbps units, rounded up.
        let pbn = pbn_from_kbps(12_798_000);
        assert_eq!(pbn, 1908);
    }

    #[test]
    fn pbn_rounds_up() {
        assert_eq!(pbn_from_kbps(0), 0);
        // Any nonzero demand costs at least one PBN.
        assert_eq!(pbn_from_kbps(1), 1);
        // Adjacent demands never round down across a unit boundary.
        for kbps in 6_700_000u64..6_700_016 {
            assert!(pbn_from_kbps(kbps + 1) >= pbn_from_kbps(kbps));
        }
    }

    #[test]
    fn per_slot_capacity_hbr2_x4() {
        let s = LinkSettings::new(LinkRate::Hbr2, LaneCount::Four);
        assert_eq!(pbn_per_slot(&s), 40);
    }

    #[test]
    fn per_slot_capacity_scales_with_lanes() {
        let two = LinkSettings::new(LinkRate::Hbr2, LaneCount::Two);
        let four = LinkSettings::new(LinkRate::Hbr2, LaneCount::Four);
        assert!(pbn_per_slot(&four) >= pbn_per_slot(&two) * 2 - 1);
    }

    #[test]
    fn slots_round_up() {
        assert_eq!(slots_for_pbn(1907, 40), 48);
        assert_eq!(slots_for_pbn(1600, 40), 40);
        assert_eq!(slots_for_pbn(1601, 40), 41);
    }

    #[test]
    fn inverse_is_conservative() {
        // Capacity-side conversion must never promise more than the
        // demand-side conversion charged for.
        for kbps in [890_000u64, 4_500_000, 12_798_000, 17_000_000] {
            let pbn = pbn_from_kbps(kbps);
            assert!(kbps_from_pbn(pbn) <= kbps * 1006 / 994);
            // And a grant of the charged PBN carries at least ~98% of
            // the original demand.
            assert!(kbps_from_pbn(pbn) >= kbps * 98 / 100);
        }
    }

    #[test]
    fn bpp_from_pbn_clamps() {
        let min = 8 * 16;
        let max = 16 * 16;
        // Huge grant clamps at max.
        assert_eq!(bpp_x16_from_pbn(4000, 300_000, min, max), max);
        // Tiny grant clamps at min.
        assert_eq!(bpp_x16_from_pbn(10, 300_000, min, max), min);
    }

    #[test]
    fn avg_slots_fixed_point() {
        // 1907 PBN over 40 PBN/slot = 47.675 slots -> 12205.x -> rounds up.
        assert_eq!(avg_slots_x256(1907, 40), 12205);
        assert_eq!(avg_slots_x256(1600, 40), 40 * 256);
    }
}
