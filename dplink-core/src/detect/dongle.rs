//! Passive dongle classification over the DDC adaptor-ID register.
//!
//! A dual-mode (DP++) connector can carry a passive DVI or HDMI adaptor.
//! The adaptor identifies itself at a fixed I2C address; silence after a
//! bounded retry is classified conservatively as a DVI adaptor.

use tracing::debug;

use crate::aux::{AuxReply, AuxTransport};
use crate::error::DpError;

/// I2C address of the dual-mode adaptor ID register file.
pub const ADAPTOR_I2C_ADDR: u8 = 0x40;
/// Offset of the identification string.
const ADAPTOR_ID_OFFSET: u8 = 0x00;
/// Offset of the Type-2 adaptor ID byte.
const ADAPTOR_TYPE2_OFFSET: u8 = 0x10;
/// Offset of the Type-2 maximum TMDS clock register (units of 2.5 MHz).
const ADAPTOR_MAX_TMDS_OFFSET: u8 = 0x21;

/// Fixed identification signature of a DP-HDMI adaptor.
const DP_HDMI_SIGNATURE: &[u8; 16] = b"DP-HDMI ADAPTOR\x04";
/// Type-2 adaptor ID value.
const TYPE2_ADAPTOR_ID: u8 = 0xA0;

/// Probe attempts before declaring the adaptor silent.
const PROBE_ATTEMPTS: u32 = 2;

/// Conservative pixel-clock ceiling for a silent or Type-1 adaptor, kHz.
const SAFE_TMDS_KHZ: u32 = 165_000;
/// Ceiling applied when a Type-2 adaptor omits its clock register.
const TYPE2_DEFAULT_TMDS_KHZ: u32 = 300_000;

/// Classification of a passive adaptor on a dual-mode connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DongleKind {
    /// No adaptor-ID response: assume DVI with a safe clock ceiling.
    PassiveDvi,
    /// Type-1 DP-HDMI adaptor, fixed 165 MHz TMDS ceiling.
    DpHdmiType1,
    /// Type-2 DP-HDMI adaptor with an advertised TMDS ceiling.
    DpHdmiType2 { max_tmds_khz: u32 },
}

impl DongleKind {
    /// Maximum TMDS clock the adaptor path can carry, in kHz.
    pub fn max_tmds_clock_khz(self) -> u32 {
        match self {
            DongleKind::PassiveDvi | DongleKind::DpHdmiType1 => SAFE_TMDS_KHZ,
            DongleKind::DpHdmiType2 { max_tmds_khz } => max_tmds_khz,
        }
    }
}

/// Classify the adaptor behind a DP connector that failed the DPCD
/// presence probe.
pub fn probe(aux: &mut dyn AuxTransport) -> Result<DongleKind, DpError> {
    let mut id = [0u8; 16];
    let mut responded = false;
    for attempt in 0..PROBE_ATTEMPTS {
        match aux.i2c_read(ADAPTOR_I2C_ADDR, ADAPTOR_ID_OFFSET, &mut id)? {
            AuxReply::Ack => {
                responded = true;
                break;
            }
            AuxReply::Defer | AuxReply::Nack => {
                debug!(attempt, "adaptor id probe unanswered");
            }
        }
    }

    if !responded {
        return Ok(DongleKind::PassiveDvi);
    }
    if &id != DP_HDMI_SIGNATURE {
        // Something answered but it is not a known HDMI adaptor.
        return Ok(DongleKind::PassiveDvi);
    }

    let mut type2 = [0u8; 1];
    let is_type2 = matches!(
        aux.i2c_read(ADAPTOR_I2C_ADDR, ADAPTOR_TYPE2_OFFSET, &mut type2)?,
        AuxReply::Ack
    ) && type2[0] == TYPE2_ADAPTOR_ID;

    if !is_type2 {
        return Ok(DongleKind::DpHdmiType1);
    }

    let mut clk = [0u8; 1];
    let max_tmds_khz = match aux.i2c_read(ADAPTOR_I2C_ADDR, ADAPTOR_MAX_TMDS_OFFSET, &mut clk)? {
        AuxReply::Ack if clk[0] != 0 => clk[0] as u32 * 2_500,
        _ => TYPE2_DEFAULT_TMDS_KHZ,
    };
    Ok(DongleKind::DpHdmiType2 { max_tmds_khz })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted adaptor register file.
    struct Adaptor {
        /// `None` = never acks.
        id: Option<[u8; 16]>,
        type2: Option<u8>,
        max_tmds: Option<u8>,
        id_reads: u32,
    }

    impl AuxTransport for Adaptor {
        fn aux_read(&mut self, _: u32, _: &mut [u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Nack)
        }

        fn aux_write(&mut self, _: u32, _: &[u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Nack)
        }

        fn i2c_read(&mut self, dev: u8, offset: u8, buf: &mut [u8]) -> Result<AuxReply, DpError> {
            assert_eq!(dev, ADAPTOR_I2C_ADDR);
            match offset {
                ADAPTOR_ID_OFFSET => {
                    self.id_reads += 1;
                    match self.id {
                        Some(id) => {
                            buf.copy_from_slice(&id);
                            Ok(AuxReply::Ack)
                        }
                        None => Ok(AuxReply::Nack),
                    }
                }
                ADAPTOR_TYPE2_OFFSET => match self.type2 {
                    Some(v) => {
                        buf[0] = v;
                        Ok(AuxReply::Ack)
                    }
                    None => Ok(AuxReply::Nack),
                },
                ADAPTOR_MAX_TMDS_OFFSET => match self.max_tmds {
                    Some(v) => {
                        buf[0] = v;
                        Ok(AuxReply::Ack)
                    }
                    None => Ok(AuxReply::Nack),
                },
                _ => Ok(AuxReply::Nack),
            }
        }

        fn i2c_write(&mut self, _: u8, _: u8, _: &[u8]) -> Result<AuxReply, DpError> {
            Ok(AuxReply::Ack)
        }
    }

    #[test]
    fn silent_adaptor_is_dvi_after_two_attempts() {
        let mut a = Adaptor {
            id: None,
            type2: None,
            max_tmds: None,
            id_reads: 0,
        };
        let kind = probe(&mut a).unwrap();
        assert_eq!(kind, DongleKind::PassiveDvi);
        assert_eq!(a.id_reads, PROBE_ATTEMPTS);
        assert_eq!(kind.max_tmds_clock_khz(), 165_000);
    }

    #[test]
    fn type1_adaptor_from_signature() {
        let mut a = Adaptor {
            id: Some(*DP_HDMI_SIGNATURE),
            type2: Some(0x00),
            max_tmds: None,
            id_reads: 0,
        };
        assert_eq!(probe(&mut a).unwrap(), DongleKind::DpHdmiType1);
    }

    #[test]
    fn type2_adaptor_reads_clock_register() {
        let mut a = Adaptor {
            id: Some(*DP_HDMI_SIGNATURE),
            type2: Some(TYPE2_ADAPTOR_ID),
            max_tmds: Some(120), // 120 * 2.5 MHz = 300 MHz
            id_reads: 0,
        };
        assert_eq!(
            probe(&mut a).unwrap(),
            DongleKind::DpHdmiType2 {
                max_tmds_khz: 300_000
            }
        );
    }

    #[test]
    fn type2_with_empty_clock_register_gets_default() {
        let mut a = Adaptor {
            id: Some(*DP_HDMI_SIGNATURE),
            type2: Some(TYPE2_ADAPTOR_ID),
            max_tmds: Some(0),
            id_reads: 0,
        };
        assert_eq!(
            probe(&mut a).unwrap(),
            DongleKind::DpHdmiType2 {
                max_tmds_khz: TYPE2_DEFAULT_TMDS_KHZ
            }
        );
    }

    #[test]
    fn unknown_signature_is_dvi() {
        let mut a = Adaptor {
            id: Some([0x55; 16]),
            type2: None,
            max_tmds: None,
            id_reads: 0,
        };
        assert_eq!(probe(&mut a).unwrap(), DongleKind::PassiveDvi);
    }
}
