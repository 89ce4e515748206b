//! Bandwidth allocation for tunneled links.
//!
//! A tunneled link's bandwidth is brokered by an external
//! connection-manager agent through a request/response protocol layered
//! on the DP-in tunneling register block. The local ledger mirrors the
//! agent's grants so admission checks (mode validation) never need a
//! round trip.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::aux::{self, AuxTransport};
use crate::dpcd;
use crate::error::DpError;
use crate::link::Link;
use crate::wait::poll_until;

/// Attempts for the response-ready poll.
const RESPONSE_POLL_ATTEMPTS: u32 = 10;
/// Spacing between response-ready poll attempts.
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ── Granularity ──────────────────────────────────────────────────

/// Unit size of the bandwidth registers, from the 2-bit granularity
/// field.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    #[default]
    Mbps2 = 0b00,
    Mbps4 = 0b01,
}

impl TryFrom<u8> for Granularity {
    type Error = DpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0x03 {
            0b00 => Ok(Granularity::Mbps2),
            0b01 => Ok(Granularity::Mbps4),
            other => Err(DpError::UnknownVariant {
                type_name: "Granularity",
                value: other as u64,
            }),
        }
    }
}

impl Granularity {
    pub fn mbps_per_unit(self) -> u32 {
        match self {
            Granularity::Mbps2 => 2,
            Granularity::Mbps4 => 4,
        }
    }

    /// Mbps → register units, rounded up.
    fn units_for(self, mbps: u32) -> u32 {
        mbps.div_ceil(self.mbps_per_unit())
    }
}

// ── Per-link allocation state ────────────────────────────────────

/// Lifecycle of the allocation protocol on one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DpiaPhase {
    #[default]
    Disabled,
    EnabledIdle,
    RequestPending,
    Granted,
    Denied,
}

/// The link's bandwidth ledger. All values in Mbps; register traffic
/// converts through the negotiated granularity at the edge.
#[derive(Debug, Clone, Copy, Default)]
pub struct DpiaBwState {
    pub phase: DpiaPhase,
    pub granularity: Granularity,
    /// Agent's last advertised ceiling for this link.
    pub estimated_mbps: u32,
    /// Running total the agent has granted this link.
    pub allocated_mbps: u32,
    /// Sink-advertised peak (never request more than the sink can eat).
    pub max_sink_mbps: u32,
    /// Set by the notification path when a response landed.
    pub response_ready: bool,
}

impl DpiaBwState {
    /// A dropped hot-plug voids the entire ledger.
    pub fn reset_on_unplug(&mut self) {
        *self = DpiaBwState::default();
    }

    pub fn is_enabled(&self) -> bool {
        self.phase != DpiaPhase::Disabled
    }

    /// Ceiling the rest of the subsystem may assume is available.
    pub fn usable_mbps(&self) -> Option<u32> {
        match self.phase {
            DpiaPhase::Disabled => None,
            DpiaPhase::Granted => Some(self.allocated_mbps),
            _ => Some(self.estimated_mbps),
        }
    }
}

/// Out-of-band notifications from the bandwidth-management agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpiaNotification {
    /// The pending request was granted at `mbps`.
    AllocationGranted { mbps: u32 },
    /// The pending request was denied.
    AllocationFailed,
    /// The agent's estimate for this link moved.
    EstimatedChanged { mbps: u32 },
    /// The agent withdrew allocation support for this link.
    CapabilityRevoked,
}

/// Outcome of a blocking bandwidth request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Granted at this many Mbps.
    Granted(u32),
    /// The agent denied the request.
    Denied,
    /// The rounded request equals the current allocation; nothing sent.
    Unchanged,
}

// ── DpiaBwAllocator ──────────────────────────────────────────────

/// Request/response bandwidth negotiation for one tunneled link.
pub struct DpiaBwAllocator;

impl DpiaBwAllocator {
    /// Probe both capability registers and, when tunnel and
    /// connection-manager agree, switch allocation mode on and pull the
    /// granularity and initial estimate.
    ///
    /// Returns `false` (link stays [`DpiaPhase::Disabled`]) when either
    /// side lacks support.
    pub fn enable(link: &mut Link) -> Result<bool, DpError> {
        let aux = link.io.aux.as_mut();
        let tunnel = aux::read_dpcd_byte(aux, dpcd::TUNNELING_CAPABILITIES)?;
        let tunnel_ok = tunnel & dpcd::TUNNELING_SUPPORT != 0
            && tunnel & dpcd::TUNNELING_BW_ALLOC_SUPPORT != 0;
        let cm = aux::read_dpcd_byte(aux, dpcd::USB4_DRIVER_BW_CAPABILITY)?;
        let cm_ok = cm & dpcd::DRIVER_BW_ALLOC_SUPPORT != 0;
        if !(tunnel_ok && cm_ok) {
            debug!(link = %link.id, tunnel_ok, cm_ok, "bw-allocation mode unsupported");
            return Ok(false);
        }

        aux::write_dpcd_byte(
            aux,
            dpcd::DPTX_BW_ALLOCATION_MODE_CONTROL,
            dpcd::BW_ALLOC_MODE_ENABLE,
        )?;

        let granularity = Granularity::try_from(aux::read_dpcd_byte(aux, dpcd::DPTX_BW_GRANULARITY)?)?;
        let estimated_units = aux::read_dpcd_byte(aux, dpcd::DPTX_ESTIMATED_BW)?;

        link.dpia.granularity = granularity;
        link.dpia.estimated_mbps = estimated_units as u32 * granularity.mbps_per_unit();
        link.dpia.allocated_mbps = 0;
        link.dpia.phase = DpiaPhase::EnabledIdle;
        info!(
            link = %link.id,
            ?granularity,
            estimated_mbps = link.dpia.estimated_mbps,
            "bw-allocation mode enabled"
        );
        Ok(true)
    }

    /// Negotiate an allocation for `peak_mbps`.
    ///
    /// The request is clamped to the agent's current estimate, rounded
    /// up to granularity units, and skipped entirely when the rounded
    /// value equals the current allocation. Blocks on the response-ready
    /// flag for at most 10 × 10 ms.
    pub fn request_bandwidth(link: &mut Link, peak_mbps: u32) -> Result<RequestOutcome, DpError> {
        match link.dpia.phase {
            DpiaPhase::Disabled => {
                return Err(DpError::InvalidTransition("bw-allocation mode is disabled"));
            }
            DpiaPhase::RequestPending => {
                return Err(DpError::InvalidTransition("a bandwidth request is in flight"));
            }
            _ => {}
        }

        let gran = link.dpia.granularity;
        let mut clamped = peak_mbps.min(link.dpia.estimated_mbps);
        if link.dpia.max_sink_mbps > 0 {
            clamped = clamped.min(link.dpia.max_sink_mbps);
        }
        let units = gran.units_for(clamped);
        if units > u8::MAX as u32 {
            return Err(DpError::Allocation("request exceeds register range"));
        }
        if units == gran.units_for(link.dpia.allocated_mbps) && link.dpia.phase == DpiaPhase::Granted
        {
            return Ok(RequestOutcome::Unchanged);
        }

        debug!(link = %link.id, peak_mbps, clamped, units, "requesting bandwidth");
        link.dpia.response_ready = false;
        aux::write_dpcd_byte(link.io.aux.as_mut(), dpcd::DPTX_REQUESTED_BW, units as u8)?;
        link.dpia.phase = DpiaPhase::RequestPending;

        let crate::link::LinkIo { aux, wait, .. } = &mut link.io;
        let status = poll_until(
            wait.as_mut(),
            RESPONSE_POLL_ATTEMPTS,
            RESPONSE_POLL_INTERVAL,
            || -> Result<Option<dpcd::DpiaStatus>, DpError> {
                let s = dpcd::DpiaStatus::from_bits_truncate(aux::read_dpcd_byte(
                    aux.as_mut(),
                    dpcd::DPTX_STATUS,
                )?);
                Ok(s.contains(dpcd::DpiaStatus::RESPONSE_READY).then_some(s))
            },
        )?;

        let Some(status) = status else {
            warn!(link = %link.id, "bandwidth response not ready within budget");
            link.dpia.phase = DpiaPhase::EnabledIdle;
            return Err(DpError::Timeout(
                RESPONSE_POLL_INTERVAL * RESPONSE_POLL_ATTEMPTS,
            ));
        };
        link.dpia.response_ready = true;

        if status.contains(dpcd::DpiaStatus::REQUEST_FAILED) {
            info!(link = %link.id, "bandwidth request denied");
            link.dpia.phase = DpiaPhase::Denied;
            return Ok(RequestOutcome::Denied);
        }

        let allocated_units = aux::read_dpcd_byte(link.io.aux.as_mut(), dpcd::DPTX_ALLOCATED_BW)?;
        let granted = allocated_units as u32 * gran.mbps_per_unit();
        link.dpia.allocated_mbps = granted;
        link.dpia.phase = DpiaPhase::Granted;
        info!(link = %link.id, granted, "bandwidth granted");
        Ok(RequestOutcome::Granted(granted))
    }

    /// Apply an out-of-band agent notification. Runs under the same
    /// per-link lock as [`request_bandwidth`], so the two paths always
    /// observe each other's writes.
    pub fn handle_notification(link: &mut Link, note: DpiaNotification) -> Result<(), DpError> {
        if !link.dpia.is_enabled() {
            return Ok(());
        }
        match note {
            DpiaNotification::AllocationGranted { mbps } => {
                let delta = mbps as i64 - link.dpia.allocated_mbps as i64;
                info!(link = %link.id, mbps, delta, "allocation granted (async)");
                link.dpia.allocated_mbps = mbps;
                link.dpia.phase = DpiaPhase::Granted;
                link.dpia.response_ready = true;
            }
            DpiaNotification::AllocationFailed => {
                link.dpia.phase = DpiaPhase::Denied;
                link.dpia.response_ready = true;
                // Fall back to what the agent said it can actually give.
                let units = link.dpia.granularity.units_for(link.dpia.estimated_mbps);
                if units > 0 && units <= u8::MAX as u32 {
                    info!(link = %link.id, estimated = link.dpia.estimated_mbps, "re-requesting at estimate");
                    aux::write_dpcd_byte(
                        link.io.aux.as_mut(),
                        dpcd::DPTX_REQUESTED_BW,
                        units as u8,
                    )?;
                    link.dpia.phase = DpiaPhase::RequestPending;
                }
            }
            DpiaNotification::EstimatedChanged { mbps } => {
                let old = link.dpia.estimated_mbps;
                if mbps > old {
                    // More headroom can only come from a sibling link
                    // letting go of its share.
                    info!(link = %link.id, old, new = mbps, "estimate raised (sibling unplug)");
                } else {
                    info!(link = %link.id, old, new = mbps, "estimate lowered (reallocation)");
                }
                link.dpia.estimated_mbps = mbps;
                // Stay consistent: the ledger never exceeds the ceiling.
                if link.dpia.allocated_mbps > mbps {
                    link.dpia.allocated_mbps = mbps;
                }
            }
            DpiaNotification::CapabilityRevoked => {
                warn!(link = %link.id, "bw-allocation capability revoked");
                link.dpia.reset_on_unplug();
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_codes() {
        assert_eq!(Granularity::try_from(0b00).unwrap().mbps_per_unit(), 2);
        assert_eq!(Granularity::try_from(0b01).unwrap().mbps_per_unit(), 4);
        assert!(Granularity::try_from(0b10).is_err());
    }

    #[test]
    fn units_round_up() {
        assert_eq!(Granularity::Mbps4.units_for(401), 101);
        assert_eq!(Granularity::Mbps4.units_for(400), 100);
        assert_eq!(Granularity::Mbps2.units_for(1), 1);
        assert_eq!(Granularity::Mbps2.units_for(0), 0);
    }

    #[test]
    fn unplug_zeroes_ledger() {
        let mut state = DpiaBwState {
            phase: DpiaPhase::Granted,
            granularity: Granularity::Mbps4,
            estimated_mbps: 400,
            allocated_mbps: 200,
            max_sink_mbps: 500,
            response_ready: true,
        };
        state.reset_on_unplug();
        assert_eq!(state.allocated_mbps, 0);
        assert_eq!(state.estimated_mbps, 0);
        assert_eq!(state.phase, DpiaPhase::Disabled);
    }

    #[test]
    fn usable_bandwidth_tracks_phase() {
        let mut state = DpiaBwState::default();
        assert_eq!(state.usable_mbps(), None);

        state.phase = DpiaPhase::EnabledIdle;
        state.estimated_mbps = 400;
        assert_eq!(state.usable_mbps(), Some(400));

        state.phase = DpiaPhase::Granted;
        state.allocated_mbps = 200;
        assert_eq!(state.usable_mbps(), Some(200));
    }
}
