//! Sink capability snapshot.
//!
//! One bulk read of the receiver capability field, decoded into a plain
//! struct. The snapshot is taken on detection and consulted by training,
//! topology and fairness; it is never re-read mid-operation.

use crate::aux::{self, AuxTransport};
use crate::dpcd;
use crate::error::DpError;
use crate::settings::{LaneCount, LinkRate, LinkSettings};

/// Identity of the immediate branch/converter device, from the branch
/// OUI and identification string registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchId {
    pub oui: [u8; 3],
    pub id: [u8; 6],
}

/// Decoded sink capability snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkCapabilities {
    /// DPCD revision (BCD, e.g. 0x12 for 1.2).
    pub dpcd_rev: u8,
    /// Highest link rate the sink advertises.
    pub max_rate: LinkRate,
    /// Highest lane count the sink advertises.
    pub max_lanes: LaneCount,
    /// Enhanced framing supported.
    pub enhanced_framing: bool,
    /// Training pattern 3 supported.
    pub tps3_supported: bool,
    /// Down-spread supported.
    pub downspread: bool,
    /// Sink is an MST-capable branch device.
    pub mst_capable: bool,
    /// Sink supports DSC decompression.
    pub dsc_supported: bool,
    /// eDP alternate-scrambler capability bit.
    pub edp_alt_scrambler: bool,
    /// Training AUX read interval register (raw).
    pub aux_rd_interval: u8,
    /// Downstream port present.
    pub downstream_port: bool,
    /// Branch device identity, when a downstream port is present.
    pub branch: Option<BranchId>,
}

impl SinkCapabilities {
    /// Read and decode the capability field.
    pub fn read(aux: &mut dyn AuxTransport) -> Result<Self, DpError> {
        let mut field = [0u8; 16];
        aux::read_dpcd(aux, dpcd::DPCD_REV, &mut field)?;

        let max_rate = LinkRate::try_from(field[dpcd::MAX_LINK_RATE as usize])?;
        let lane_byte = field[dpcd::MAX_LANE_COUNT as usize];
        let max_lanes = LaneCount::try_from(lane_byte & 0x1F)?;

        let mst_capable = {
            let b = aux::read_dpcd_byte(aux, dpcd::MSTM_CAP)?;
            b & 0x01 != 0
        };
        let dsc_supported = {
            let b = aux::read_dpcd_byte(aux, dpcd::DSC_SUPPORT)?;
            b & 0x01 != 0
        };

        let downstream_port = field[dpcd::DOWNSTREAMPORT_PRESENT as usize] & 0x01 != 0;
        let branch = if downstream_port {
            let mut oui = [0u8; 3];
            let mut id = [0u8; 6];
            aux::read_dpcd(aux, dpcd::BRANCH_OUI, &mut oui)?;
            aux::read_dpcd(aux, dpcd::BRANCH_DEVICE_ID, &mut id)?;
            Some(BranchId { oui, id })
        } else {
            None
        };

        Ok(Self {
            dpcd_rev: field[dpcd::DPCD_REV as usize],
            max_rate,
            max_lanes,
            enhanced_framing: lane_byte & 0x80 != 0,
            tps3_supported: lane_byte & 0x40 != 0,
            downspread: field[dpcd::MAX_DOWNSPREAD as usize] & 0x01 != 0,
            mst_capable,
            dsc_supported,
            edp_alt_scrambler: field[dpcd::EDP_CONFIGURATION_CAP as usize] & 0x01 != 0,
            aux_rd_interval: field[dpcd::TRAINING_AUX_RD_INTERVAL as usize] & 0x7F,
            downstream_port,
            branch,
        })
    }

    /// The best settings this sink can take.
    pub fn max_settings(&self) -> LinkSettings {
        LinkSettings {
            rate: self.max_rate,
            lanes: self.max_lanes,
            spread: self.downspread,
        }
    }

    /// Training wait between a pattern write and a status read, derived
    /// from the AUX read interval register: 0 means 100 µs, otherwise
    /// units of 4 ms.
    pub fn training_interval(&self) -> std::time::Duration {
        if self.aux_rd_interval == 0 {
            std::time::Duration::from_micros(100)
        } else {
            std::time::Duration::from_millis(4 * self.aux_rd_interval as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aux::AuxReply;

    /// Register-file transport with a canned capability field.
    struct CannedCaps {
        field: [u8; 16],
        mst: u8,
        dsc: u8,
    }

    impl AuxTransport for CannedCaps {
        fn aux_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<AuxReply, DpError> {
            match addr {
                dpcd::DPCD_REV => buf.copy_from_slice(&self.field[..buf.len()]),
                dpcd::MSTM_CAP => buf[0] = self.mst,
                dpcd::DSC_SUPPORT => buf[0] = self.dsc,
                dpcd::BRANCH_OUI => buf.copy_from_slice(&[0x00, 0x22, 0xB9]),
                dpcd::BRANCH_DEVICE_ID => buf.copy_from_slice(b"SYNA\0\0"),
                _ => buf.fill(0),
            }
            Ok(AuxReply::Ack)
        }

        fn aux_write(&mut self, _: u32, _: &[u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Ack)
        }

        fn i2c_read(&mut self, _: u8, _: u8, _: &mut [u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Nack)
        }

        fn i2c_write(&mut self, _: u8, _: u8, _: &[u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Nack)
        }
    }

    fn canned() -> CannedCaps {
        let mut field = [0u8; 16];
        field[dpcd::DPCD_REV as usize] = 0x12;
        field[dpcd::MAX_LINK_RATE as usize] = LinkRate::Hbr2 as u8;
        field[dpcd::MAX_LANE_COUNT as usize] = 0x84; // 4 lanes + enhanced framing
        field[dpcd::MAX_DOWNSPREAD as usize] = 0x01;
        field[dpcd::DOWNSTREAMPORT_PRESENT as usize] = 0x01;
        field[dpcd::TRAINING_AUX_RD_INTERVAL as usize] = 0x01;
        CannedCaps { field, mst: 1, dsc: 1 }
    }

    #[test]
    fn decode_full_field() {
        let caps = SinkCapabilities::read(&mut canned()).unwrap();
        assert_eq!(caps.max_rate, LinkRate::Hbr2);
        assert_eq!(caps.max_lanes, LaneCount::Four);
        assert!(caps.enhanced_framing);
        assert!(caps.downspread);
        assert!(caps.mst_capable);
        assert!(caps.dsc_supported);
        let branch = caps.branch.unwrap();
        assert_eq!(branch.oui, [0x00, 0x22, 0xB9]);
        assert_eq!(&branch.id[..4], b"SYNA");
    }

    #[test]
    fn training_interval_units() {
        let mut t = canned();
        t.field[dpcd::TRAINING_AUX_RD_INTERVAL as usize] = 0;
        let caps = SinkCapabilities::read(&mut t).unwrap();
        assert_eq!(caps.training_interval(), std::time::Duration::from_micros(100));

        let mut t = canned();
        t.field[dpcd::TRAINING_AUX_RD_INTERVAL as usize] = 4;
        let caps = SinkCapabilities::read(&mut t).unwrap();
        assert_eq!(caps.training_interval(), std::time::Duration::from_millis(16));
    }

    #[test]
    fn bad_rate_code_is_surfaced() {
        let mut t = canned();
        t.field[dpcd::MAX_LINK_RATE as usize] = 0x0B;
        assert!(matches!(
            SinkCapabilities::read(&mut t),
            Err(DpError::UnknownVariant { .. })
        ));
    }
}
