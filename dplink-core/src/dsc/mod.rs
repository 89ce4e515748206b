//! Compression fairness across streams sharing one MST link.
//!
//! Invoked whenever the active stream set on an MST-capable link
//! changes. Decides, per stream, whether DSC is enabled and at what
//! target bpp, such that the combined time-slot demand fits the link's
//! slot budget. Three phases: try uncompressed, prove feasibility at
//! maximum compression, then redistribute the leftover bandwidth
//! fairly. Every phase probes a slot reservation before anything is
//! committed; stream configs are only written once the whole
//! computation succeeds.

pub mod pbn;

use tracing::{debug, info};

use crate::link::Link;
use crate::mst::MstTopologyManager;
use crate::stream::Stream;

/// Per-stream working state for one fairness pass. Discarded after the
/// computed bpp is applied to the stream's timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct DscFairnessParams {
    /// PBN at the uncompressed peak bandwidth.
    full_pbn: u32,
    /// PBN at the minimum viable compressed bpp (== `full_pbn` when the
    /// sink cannot decompress).
    min_pbn: u32,
    /// PBN at the maximum useful compressed bpp target.
    max_target_pbn: u32,
    /// Currently granted PBN.
    granted_pbn: u32,
    /// Compression decision so far.
    compressed: bool,
}

impl DscFairnessParams {
    fn for_stream(s: &Stream) -> Self {
        let full_pbn = pbn::pbn_from_kbps(s.timing.peak_kbps());
        if !s.dsc_limits.supported {
            return Self {
                full_pbn,
                min_pbn: full_pbn,
                max_target_pbn: full_pbn,
                granted_pbn: full_pbn,
                compressed: false,
            };
        }
        let pclk = s.timing.pixel_clock_khz as u64;
        let min_pbn = pbn::pbn_from_kbps(pclk * s.dsc_limits.min_bpp_x16 as u64 / 16);
        let max_target_pbn =
            pbn::pbn_from_kbps(pclk * s.dsc_limits.max_bpp_x16 as u64 / 16).min(full_pbn);
        Self {
            full_pbn,
            min_pbn,
            max_target_pbn,
            granted_pbn: min_pbn,
            compressed: true,
        }
    }

    fn can_compress(&self) -> bool {
        self.min_pbn < self.full_pbn
    }
}

/// DSC bandwidth fairness across the streams of one MST link.
pub struct BandwidthFairnessEngine;

impl BandwidthFairnessEngine {
    /// Compute per-stream compression for `streams`, all riding `link`.
    ///
    /// Returns `true` and writes each stream's DSC config when a fitting
    /// assignment exists; returns `false` and leaves every stream
    /// untouched when even maximum compression cannot fit (re-running
    /// produces the same answer).
    pub fn compute(link: &Link, streams: &mut [Stream]) -> bool {
        if streams.is_empty() {
            return true;
        }
        let mut params: Vec<DscFairnessParams> =
            streams.iter().map(DscFairnessParams::for_stream).collect();

        let fits = |demands: &[u32]| MstTopologyManager::probe_reservation(link, demands);
        if !Self::solve(&mut params, fits) {
            info!(link = %link.id, streams = streams.len(), "stream set does not fit at max compression");
            return false;
        }

        for (stream, p) in streams.iter_mut().zip(&params) {
            if p.compressed {
                stream.dsc.enabled = true;
                stream.dsc.target_bpp_x16 = pbn::bpp_x16_from_pbn(
                    p.granted_pbn,
                    stream.timing.pixel_clock_khz,
                    stream.dsc_limits.min_bpp_x16,
                    stream.dsc_limits.max_bpp_x16,
                );
            } else {
                stream.dsc.enabled = false;
                stream.dsc.target_bpp_x16 = 0;
            }
            debug!(
                link = %link.id,
                stream = %stream.id,
                dsc = stream.dsc.enabled,
                bpp_x16 = stream.dsc.target_bpp_x16,
                pbn = p.granted_pbn,
                "fairness grant"
            );
        }
        true
    }

    /// Core allocation over transient params, independent of the link
    /// plumbing. `fits` answers whether a demand vector reserves.
    fn solve(params: &mut [DscFairnessParams], fits: impl Fn(&[u32]) -> bool) -> bool {
        // Phase 1: no compression anywhere.
        let full: Vec<u32> = params.iter().map(|p| p.full_pbn).collect();
        if fits(&full) {
            for p in params.iter_mut() {
                p.granted_pbn = p.full_pbn;
                p.compressed = false;
            }
            return true;
        }

        // Phase 2: maximum compression must fit or the mode set is
        // rejected outright.
        let minimal: Vec<u32> = params.iter().map(|p| p.min_pbn).collect();
        if !fits(&minimal) {
            return false;
        }
        for p in params.iter_mut() {
            p.granted_pbn = p.min_pbn;
            p.compressed = p.can_compress();
        }

        Self::increase_pass(params, &fits);
        Self::disable_pass(params, &fits);
        true
    }

    /// Visit every compressed stream once, least slack first, granting
    /// each a fair share of whatever is still unallocated.
    fn increase_pass(params: &mut [DscFairnessParams], fits: &impl Fn(&[u32]) -> bool) {
        let mut visited = vec![false; params.len()];
        loop {
            let next = params
                .iter()
                .enumerate()
                .filter(|(i, p)| !visited[*i] && p.compressed && p.granted_pbn < p.max_target_pbn)
                .min_by_key(|(_, p)| p.full_pbn - p.granted_pbn);
            let Some((idx, _)) = next else { break };
            visited[idx] = true;

            let not_at_peak = params
                .iter()
                .filter(|p| p.compressed && p.granted_pbn < p.max_target_pbn)
                .count() as u32;
            if not_at_peak == 0 {
                break;
            }
            let current: Vec<u32> = params.iter().map(|p| p.granted_pbn).collect();
            let Some(remaining) = Self::headroom(&current, idx, fits) else {
                continue;
            };
            let fair = remaining / not_at_peak;
            if fair == 0 {
                continue;
            }

            let previous = params[idx].granted_pbn;
            let candidate = (previous + fair).min(params[idx].max_target_pbn);
            params[idx].granted_pbn = candidate;
            let demands: Vec<u32> = params.iter().map(|p| p.granted_pbn).collect();
            if !fits(&demands) {
                params[idx].granted_pbn = previous;
            }
        }
    }

    /// Among streams that reached their target in the increase pass,
    /// greedily disable DSC on the one gaining the most, while the
    /// aggregate still fits.
    fn disable_pass(params: &mut [DscFairnessParams], fits: &impl Fn(&[u32]) -> bool) {
        loop {
            let candidate = params
                .iter()
                .enumerate()
                .filter(|(_, p)| {
                    p.compressed && p.can_compress() && p.granted_pbn >= p.max_target_pbn
                })
                .max_by_key(|(_, p)| p.full_pbn - p.granted_pbn);
            let Some((idx, _)) = candidate else { break };

            let previous = params[idx];
            params[idx].granted_pbn = params[idx].full_pbn;
            params[idx].compressed = false;
            let demands: Vec<u32> = params.iter().map(|p| p.granted_pbn).collect();
            if !fits(&demands) {
                params[idx] = previous;
                break;
            }
        }
    }

    /// Largest extra PBN the reservation still accepts on stream `idx`
    /// on top of the current grants, found by binary search over the
    /// probe.
    fn headroom(current: &[u32], idx: usize, fits: &impl Fn(&[u32]) -> bool) -> Option<u32> {
        let mut probe_vec = current.to_vec();
        let (mut lo, mut hi) = (0u32, pbn::SLOTS_PER_MTP * 128);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            probe_vec[idx] = current[idx] + mid;
            if fits(&probe_vec) {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        (lo > 0).then_some(lo)
    }
}

// ── Tests ────────────────────────────────────────────────────────
