//! Multi-stream topology and virtual-channel payload management.
//!
//! Owns the per-link payload table and the conversations that commit it:
//! the three-register DPCD table write, the table-update/ACT polls, and
//! the sideband messages to the branch device. Poll timeouts here are
//! warnings, not failures: once the table write is in flight, finishing
//! the sequence leaves source and branch closer to agreement than
//! aborting halfway would.

pub mod payload;
pub mod sideband;

pub use payload::{PayloadEntry, VcPayloadTable};
pub use sideband::{DownReply, DownRequest, PortInfo};

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::aux::{self, AuxTransport};
use crate::dpcd;
use crate::dsc::pbn;
use crate::error::DpError;
use crate::link::{ConnectionType, Link, LinkIo};
use crate::stream::Stream;
use crate::wait::poll_until;

/// Attempts for the table-update and ACT polls.
const TABLE_POLL_ATTEMPTS: u32 = 30;
/// Spacing between table/ACT poll attempts.
const TABLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

// ── Topology state ───────────────────────────────────────────────

/// Lifecycle of the branch topology on one link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MstState {
    /// SST or nothing connected.
    #[default]
    NotMst,
    /// MST mode enabled, branch enumeration in flight.
    Discovering,
    /// Branch enumerated; payload operations permitted.
    BranchActive {
        guid: [u8; 16],
        ports: Vec<PortInfo>,
        /// Available PBN on the primary output port, when the branch
        /// answered ENUM_PATH_RESOURCES.
        available_pbn: Option<u16>,
    },
    /// Branch went away; waiting for the next detection cycle.
    TornDown,
}

impl MstState {
    pub fn is_branch_active(&self) -> bool {
        matches!(self, MstState::BranchActive { .. })
    }

    /// Branch-advertised available PBN, if known.
    pub fn available_pbn(&self) -> Option<u16> {
        match self {
            MstState::BranchActive { available_pbn, .. } => *available_pbn,
            _ => None,
        }
    }
}

// ── MstTopologyManager ───────────────────────────────────────────

/// Topology discovery and payload-table operations over one link.
pub struct MstTopologyManager;

impl MstTopologyManager {
    /// Enable MST mode and enumerate the branch device.
    ///
    /// Call only after the sink probed MST-capable. On success the local
    /// SST sink is disconnected (downstream ports are discovered
    /// independently) and the link becomes an MST branch. On failure MST
    /// mode is rolled back and the caller keeps the link as plain SST.
    pub fn start_topology(link: &mut Link) -> Result<(), DpError> {
        let mst_capable = link.caps.as_ref().is_some_and(|c| c.mst_capable);
        if !mst_capable {
            return Err(DpError::Topology("sink is not MST-capable"));
        }
        if link.mst.is_branch_active() {
            return Ok(());
        }

        link.mst = MstState::Discovering;
        let ctrl = dpcd::MstmCtrl::MST_EN | dpcd::MstmCtrl::UP_REQ_EN | dpcd::MstmCtrl::UPSTREAM_IS_SRC;

        let discovered = (|| -> Result<([u8; 16], Vec<PortInfo>, Option<u16>), DpError> {
            aux::write_dpcd_byte(link.io.aux.as_mut(), dpcd::MSTM_CTRL, ctrl.bits())?;

            match Self::transact(&mut link.io, &mut link.sideband_seqno, &DownRequest::ClearPayloadIdTable)? {
                DownReply::ClearPayloadIdTable => {}
                DownReply::Nak { reason, .. } => {
                    debug!(link = %link.id, reason, "clear-payload-table nacked");
                }
                _ => return Err(DpError::InvalidReply("unexpected reply to clear-payload-table")),
            }

            let (guid, ports) =
                match Self::transact(&mut link.io, &mut link.sideband_seqno, &DownRequest::LinkAddress)? {
                    DownReply::LinkAddress { guid, ports } => (guid, ports),
                    DownReply::Nak { .. } => {
                        return Err(DpError::SidebandNak("link-address"));
                    }
                    _ => return Err(DpError::InvalidReply("unexpected reply to link-address")),
                };

            // Query path resources on the first live output port.
            let available_pbn = ports
                .iter()
                .find(|p| !p.input && p.ddps)
                .map(|p| {
                    match Self::transact(
                        &mut link.io,
                        &mut link.sideband_seqno,
                        &DownRequest::EnumPathResources { port: p.port },
                    ) {
                        Ok(DownReply::EnumPathResources { available_pbn, .. }) => Some(available_pbn),
                        _ => None,
                    }
                })
                .flatten();

            Ok((guid, ports, available_pbn))
        })();

        match discovered {
            Ok((guid, ports, available_pbn)) => {
                info!(link = %link.id, ports = ports.len(), ?available_pbn, "mst branch active");
                link.mst = MstState::BranchActive {
                    guid,
                    ports,
                    available_pbn,
                };
                // Downstream sinks are enumerated through the branch from
                // here on; the local SST sink is stale.
                link.sink = None;
                link.connection = ConnectionType::MstBranch;
                link.payload_table.clear();
                Ok(())
            }
            Err(e) => {
                warn!(link = %link.id, error = %e, "mst start failed, staying sst");
                let _ = aux::write_dpcd_byte(link.io.aux.as_mut(), dpcd::MSTM_CTRL, 0);
                link.mst = MstState::NotMst;
                Err(DpError::Topology("branch enumeration failed"))
            }
        }
    }

    /// Tear the topology down: disable MST mode and drop all payload
    /// bookkeeping. Safe to call with a dead AUX channel (unplug).
    pub fn teardown(link: &mut Link) {
        if link.mst == MstState::NotMst {
            return;
        }
        info!(link = %link.id, "mst teardown");
        let _ = aux::write_dpcd_byte(link.io.aux.as_mut(), dpcd::MSTM_CTRL, 0);
        link.payload_table.clear();
        link.mst = MstState::TornDown;
    }

    // ── Payload operations ───────────────────────────────────────

    /// Allocate a virtual channel sized for the stream's current demand.
    pub fn allocate_payload(link: &mut Link, stream: &Stream) -> Result<(), DpError> {
        if !link.mst.is_branch_active() {
            return Err(DpError::InvalidTransition("payload ops need an active branch"));
        }
        let settings = link
            .current
            .ok_or(DpError::InvalidTransition("link is not trained"))?;
        let per_slot = pbn::pbn_per_slot(&settings);
        let stream_pbn = pbn::pbn_from_kbps(stream.demand_kbps());
        let slots = pbn::slots_for_pbn(stream_pbn, per_slot);

        let entry = link
            .payload_table
            .insert(stream.id, stream_pbn as u16, slots as u8)?;
        debug!(link = %link.id, stream = %stream.id, pbn = stream_pbn, slots, "allocating payload");

        Self::write_payload_triple(link.io.aux.as_mut(), entry.vcp_id, entry.start_slot, entry.slot_count)?;
        Self::poll_table_updated(&mut link.io, link.id)?;
        Self::poll_act_handled(&mut link.io, link.id, settings.lanes as u8)?;

        link.io
            .encoder
            .set_throttled_vcp_size(stream.id, pbn::avg_slots_x256(stream_pbn, per_slot));

        let reply = Self::transact(
            &mut link.io,
            &mut link.sideband_seqno,
            &DownRequest::AllocatePayload {
                port: 0,
                vcpi: entry.vcp_id,
                pbn: stream_pbn as u16,
            },
        )?;
        if let DownReply::Nak { reason, .. } = reply {
            warn!(link = %link.id, reason, "branch nacked allocate-payload");
            return Err(DpError::SidebandNak("allocate-payload"));
        }
        Ok(())
    }

    /// Release the stream's virtual channel. The local slot size is
    /// zeroed before the table entry goes away so the source never
    /// requests bandwidth that no live stream backs.
    pub fn deallocate_payload(link: &mut Link, stream: &Stream) -> Result<(), DpError> {
        let entry = match link.payload_table.entry(stream.id) {
            Some(e) => *e,
            None => return Ok(()),
        };
        debug!(link = %link.id, stream = %stream.id, "deallocating payload");

        link.io.encoder.set_throttled_vcp_size(stream.id, 0);

        Self::write_payload_triple(link.io.aux.as_mut(), entry.vcp_id, 0, 0)?;
        Self::poll_table_updated(&mut link.io, link.id)?;

        let _ = Self::transact(
            &mut link.io,
            &mut link.sideband_seqno,
            &DownRequest::AllocatePayload {
                port: 0,
                vcpi: entry.vcp_id,
                pbn: 0,
            },
        )?;

        let lanes = link.current.map(|s| s.lanes as u8).unwrap_or(0);
        Self::poll_act_handled(&mut link.io, link.id, lanes)?;

        link.payload_table.remove(stream.id);
        Ok(())
    }

    /// Shrink a channel for a stream whose demand dropped (DSC
    /// re-negotiation). The smaller local slot size is applied before
    /// the branch hears about it.
    pub fn reduce_payload(link: &mut Link, stream: &Stream) -> Result<(), DpError> {
        let settings = link
            .current
            .ok_or(DpError::InvalidTransition("link is not trained"))?;
        let per_slot = pbn::pbn_per_slot(&settings);
        let new_pbn = pbn::pbn_from_kbps(stream.demand_kbps());
        let slots = pbn::slots_for_pbn(new_pbn, per_slot);

        link.io
            .encoder
            .set_throttled_vcp_size(stream.id, pbn::avg_slots_x256(new_pbn, per_slot));

        let entry = link.payload_table.resize(stream.id, new_pbn as u16, slots as u8)?;
        Self::write_payload_triple(link.io.aux.as_mut(), entry.vcp_id, entry.start_slot, entry.slot_count)?;
        Self::poll_table_updated(&mut link.io, link.id)?;

        let _ = Self::transact(
            &mut link.io,
            &mut link.sideband_seqno,
            &DownRequest::AllocatePayload {
                port: 0,
                vcpi: entry.vcp_id,
                pbn: new_pbn as u16,
            },
        )?;
        Self::poll_act_handled(&mut link.io, link.id, settings.lanes as u8)?;
        Ok(())
    }

    /// Grow a channel for a stream whose demand rose. The branch commits
    /// (sideband + ACT) before the local slot size is enlarged, so the
    /// link never transiently carries more than it provisioned.
    pub fn increase_payload(link: &mut Link, stream: &Stream) -> Result<(), DpError> {
        let settings = link
            .current
            .ok_or(DpError::InvalidTransition("link is not trained"))?;
        let per_slot = pbn::pbn_per_slot(&settings);
        let new_pbn = pbn::pbn_from_kbps(stream.demand_kbps());
        let slots = pbn::slots_for_pbn(new_pbn, per_slot);

        let entry = link.payload_table.resize(stream.id, new_pbn as u16, slots as u8)?;
        Self::write_payload_triple(link.io.aux.as_mut(), entry.vcp_id, entry.start_slot, entry.slot_count)?;
        Self::poll_table_updated(&mut link.io, link.id)?;

        let _ = Self::transact(
            &mut link.io,
            &mut link.sideband_seqno,
            &DownRequest::AllocatePayload {
                port: 0,
                vcpi: entry.vcp_id,
                pbn: new_pbn as u16,
            },
        )?;
        Self::poll_act_handled(&mut link.io, link.id, settings.lanes as u8)?;

        link.io
            .encoder
            .set_throttled_vcp_size(stream.id, pbn::avg_slots_x256(new_pbn, per_slot));
        Ok(())
    }

    /// Reservation probe for the fairness engine: would these per-stream
    /// PBN demands fit the slot budget and the branch's advertised path
    /// resources?
    pub fn probe_reservation(link: &Link, demand_pbn: &[u32]) -> bool {
        let Some(settings) = link.current else {
            return false;
        };
        let per_slot = pbn::pbn_per_slot(&settings);
        if !VcPayloadTable::fits(demand_pbn, per_slot) {
            return false;
        }
        match link.mst.available_pbn() {
            Some(avail) => demand_pbn.iter().sum::<u32>() <= avail as u32,
            None => true,
        }
    }

    // ── Register conversations ───────────────────────────────────

    fn write_payload_triple(
        aux: &mut dyn AuxTransport,
        vcp_id: u8,
        start_slot: u8,
        slot_count: u8,
    ) -> Result<(), DpError> {
        aux::write_dpcd_byte(aux, dpcd::PAYLOAD_ALLOCATE_SET, vcp_id)?;
        aux::write_dpcd_byte(aux, dpcd::PAYLOAD_ALLOCATE_START_TIME_SLOT, start_slot)?;
        aux::write_dpcd_byte(aux, dpcd::PAYLOAD_ALLOCATE_TIME_SLOT_COUNT, slot_count)
    }

    /// Poll until the branch consumed the table write. Timeout is
    /// best-effort: warn and continue.
    fn poll_table_updated(io: &mut LinkIo, link_id: crate::link::LinkId) -> Result<(), DpError> {
        let LinkIo { aux, wait, .. } = io;
        let updated = poll_until(
            wait.as_mut(),
            TABLE_POLL_ATTEMPTS,
            TABLE_POLL_INTERVAL,
            || -> Result<Option<()>, DpError> {
                let s = aux::read_dpcd_byte(aux.as_mut(), dpcd::PAYLOAD_TABLE_UPDATE_STATUS)?;
                let s = dpcd::PayloadTableStatus::from_bits_truncate(s);
                Ok(s.contains(dpcd::PayloadTableStatus::TABLE_UPDATED).then_some(()))
            },
        )?;
        if updated.is_none() {
            warn!(link = %link_id, "payload table update not confirmed, continuing");
        }
        Ok(())
    }

    /// Poll for ACT-handled while watching for lane-status regression.
    /// A regression is fatal ([`DpError::LinkLost`]); a timeout is
    /// best-effort.
    fn poll_act_handled(
        io: &mut LinkIo,
        link_id: crate::link::LinkId,
        lanes: u8,
    ) -> Result<(), DpError> {
        let LinkIo { aux, wait, .. } = io;
        let handled = poll_until(
            wait.as_mut(),
            TABLE_POLL_ATTEMPTS,
            TABLE_POLL_INTERVAL,
            || -> Result<Option<()>, DpError> {
                let s = aux::read_dpcd_byte(aux.as_mut(), dpcd::PAYLOAD_TABLE_UPDATE_STATUS)?;
                let s = dpcd::PayloadTableStatus::from_bits_truncate(s);
                if s.contains(dpcd::PayloadTableStatus::ACT_HANDLED) {
                    return Ok(Some(()));
                }
                if lanes > 0 && !lanes_healthy(aux.as_mut(), lanes)? {
                    return Err(DpError::LinkLost { during: "act poll" });
                }
                Ok(None)
            },
        )?;
        if handled.is_none() {
            warn!(link = %link_id, "act not handled within budget, continuing");
        }
        Ok(())
    }

    /// One sideband round-trip: frame and write the down request, wait
    /// for the reply-ready interrupt, read and parse the reply.
    fn transact(
        io: &mut LinkIo,
        seqno: &mut u8,
        req: &DownRequest,
    ) -> Result<DownReply, DpError> {
        let msg = req.encode(*seqno);
        *seqno ^= 1;

        let LinkIo { aux, wait, .. } = io;
        aux::write_dpcd(aux.as_mut(), dpcd::DOWN_REQ_BASE, &msg)?;

        let ready = poll_until(
            wait.as_mut(),
            TABLE_POLL_ATTEMPTS,
            TABLE_POLL_INTERVAL,
            || -> Result<Option<()>, DpError> {
                let irq = aux::read_dpcd_byte(aux.as_mut(), dpcd::DEVICE_SERVICE_IRQ_VECTOR)?;
                Ok((irq & 0x10 != 0).then_some(()))
            },
        )?;
        if ready.is_none() {
            return Err(DpError::Timeout(
                TABLE_POLL_INTERVAL * TABLE_POLL_ATTEMPTS,
            ));
        }

        let mut raw = [0u8; dpcd::SIDEBAND_CHUNK];
        aux::read_dpcd(aux.as_mut(), dpcd::DOWN_REP_BASE, &mut raw)?;
        // Acknowledge the reply-ready interrupt.
        aux::write_dpcd_byte(aux.as_mut(), dpcd::DEVICE_SERVICE_IRQ_VECTOR, 0x10)?;

        DownReply::parse(&raw)
    }
}

/// All active lanes still hold CR, EQ, symbol lock and interlane
/// alignment.
pub(crate) fn lanes_healthy(aux: &mut dyn AuxTransport, lanes: u8) -> Result<bool, DpError> {
    let mut status = [0u8; 3];
    aux::read_dpcd(aux, dpcd::LANE0_1_STATUS, &mut status)?;
    let align = dpcd::AlignStatus::from_bits_truncate(status[2]);
    if lanes > 1 && !align.contains(dpcd::AlignStatus::INTERLANE_ALIGN_DONE) {
        return Ok(false);
    }
    for lane in 0..lanes {
        let pair = dpcd::LanePairStatus::from_bits_truncate(status[(lane / 2) as usize]);
        let idx = lane % 2;
        if !(pair.cr_done(idx) && pair.eq_done(idx) && pair.symbol_locked(idx)) {
            return Ok(false);
        }
    }
    Ok(true)
}
