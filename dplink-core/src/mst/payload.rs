//! Virtual-channel payload table.
//!
//! The table is the source-side image of the branch device's slot
//! allocation: ordered entries, slot 0 reserved for the MTP header,
//! Σ slot_count ≤ 63. Every mutation here is local bookkeeping; the
//! DPCD writes and ACT round-trips that commit it live in the topology
//! manager.

use crate::dsc::pbn::SLOTS_PER_MTP;
use crate::error::DpError;
use crate::stream::StreamId;

/// One committed (or in-flight) virtual-channel allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadEntry {
    pub stream: StreamId,
    pub vcp_id: u8,
    pub start_slot: u8,
    pub slot_count: u8,
    /// PBN charged for this channel (what the branch was told).
    pub pbn: u16,
}

/// Source-side VC payload table for one link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcPayloadTable {
    entries: Vec<PayloadEntry>,
}

impl VcPayloadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[PayloadEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, stream: StreamId) -> Option<&PayloadEntry> {
        self.entries.iter().find(|e| e.stream == stream)
    }

    /// Total allocated time slots.
    pub fn total_slots(&self) -> u32 {
        self.entries.iter().map(|e| e.slot_count as u32).sum()
    }

    /// Slots still unallocated out of the 63 usable per MTP.
    pub fn free_slots(&self) -> u32 {
        SLOTS_PER_MTP - self.total_slots()
    }

    /// Insert an allocation for `stream`, assigning the lowest free
    /// vcp_id and the next start slot.
    ///
    /// Fails without mutating the table when the stream already holds a
    /// channel or the slot budget would be exceeded; the mode should
    /// have been rejected by validation, and a deterministic error here
    /// keeps the committed entries intact.
    pub fn insert(
        &mut self,
        stream: StreamId,
        pbn: u16,
        slot_count: u8,
    ) -> Result<PayloadEntry, DpError> {
        if self.entry(stream).is_some() {
            return Err(DpError::Allocation("stream already holds a virtual channel"));
        }
        if self.total_slots() + slot_count as u32 > SLOTS_PER_MTP {
            return Err(DpError::Allocation("slot budget exceeded"));
        }
        let vcp_id = self.lowest_free_vcp_id();
        let start_slot = self.next_start_slot();
        let entry = PayloadEntry {
            stream,
            vcp_id,
            start_slot,
            slot_count,
            pbn,
        };
        self.entries.push(entry);
        self.debug_check();
        Ok(entry)
    }

    /// Remove the allocation for `stream`, compacting the start slots of
    /// the entries behind it (the branch does the same on a zero-slot
    /// write).
    pub fn remove(&mut self, stream: StreamId) -> Option<PayloadEntry> {
        let idx = self.entries.iter().position(|e| e.stream == stream)?;
        let removed = self.entries.remove(idx);
        self.recompute_start_slots();
        self.debug_check();
        Some(removed)
    }

    /// Change the slot count and PBN of an existing allocation in place,
    /// shifting the entries behind it.
    pub fn resize(
        &mut self,
        stream: StreamId,
        pbn: u16,
        slot_count: u8,
    ) -> Result<PayloadEntry, DpError> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.stream == stream)
            .ok_or(DpError::Allocation("stream holds no virtual channel"))?;
        let others: u32 = self
            .entries
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, e)| e.slot_count as u32)
            .sum();
        if others + slot_count as u32 > SLOTS_PER_MTP {
            return Err(DpError::Allocation("slot budget exceeded"));
        }
        self.entries[idx].slot_count = slot_count;
        self.entries[idx].pbn = pbn;
        self.recompute_start_slots();
        self.debug_check();
        Ok(self.entries[idx])
    }

    /// Drop every entry (training succeeded at new settings, or the
    /// topology tore down).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Would a fresh set of per-stream PBN demands fit this link's slot
    /// budget at `per_slot` PBN per time slot? Pure arithmetic, without
    /// branch traffic or table mutation.
    pub fn fits(demand_pbn: &[u32], per_slot: u32) -> bool {
        let slots: u32 = demand_pbn
            .iter()
            .map(|&p| crate::dsc::pbn::slots_for_pbn(p, per_slot))
            .sum();
        slots <= SLOTS_PER_MTP
    }

    fn lowest_free_vcp_id(&self) -> u8 {
        let mut id = 1;
        while self.entries.iter().any(|e| e.vcp_id == id) {
            id += 1;
        }
        id
    }

    fn next_start_slot(&self) -> u8 {
        1 + self.total_slots() as u8
    }

    fn recompute_start_slots(&mut self) {
        let mut slot = 1u8;
        for e in &mut self.entries {
            e.start_slot = slot;
            slot += e.slot_count;
        }
    }

    fn debug_check(&self) {
        debug_assert!(self.total_slots() <= SLOTS_PER_MTP, "slot budget violated");
        for (i, a) in self.entries.iter().enumerate() {
            debug_assert!(
                !self.entries[..i].iter().any(|b| b.vcp_id == a.vcp_id),
                "duplicate vcp_id"
            );
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_deallocate_restores_table() {
        let mut table = VcPayloadTable::new();
        table.insert(StreamId(0), 800, 20).unwrap();
        let before = table.clone();

        table.insert(StreamId(1), 400, 10).unwrap();
        table.remove(StreamId(1)).unwrap();

        assert_eq!(table, before);
    }

    #[test]
    fn start_slots_are_packed_after_removal() {
        let mut table = VcPayloadTable::new();
        table.insert(StreamId(0), 800, 20).unwrap();
        table.insert(StreamId(1), 400, 10).unwrap();
        table.insert(StreamId(2), 400, 10).unwrap();

        table.remove(StreamId(1)).unwrap();
        let entries = table.entries();
        assert_eq!(entries[0].start_slot, 1);
        assert_eq!(entries[1].start_slot, 21);
        assert_eq!(entries[1].stream, StreamId(2));
    }

    #[test]
    fn third_25_slot_allocation_fails_without_corruption() {
        let mut table = VcPayloadTable::new();
        table.insert(StreamId(0), 1000, 25).unwrap();
        table.insert(StreamId(1), 1000, 25).unwrap();
        let snapshot = table.clone();

        let err = table.insert(StreamId(2), 1000, 25).unwrap_err();
        assert!(matches!(err, DpError::Allocation(_)));
        assert_eq!(table, snapshot);
        assert_eq!(table.total_slots(), 50);
    }

    #[test]
    fn vcp_ids_are_unique_and_reused() {
        let mut table = VcPayloadTable::new();
        let a = table.insert(StreamId(0), 100, 5).unwrap();
        let b = table.insert(StreamId(1), 100, 5).unwrap();
        assert_eq!((a.vcp_id, b.vcp_id), (1, 2));

        table.remove(StreamId(0)).unwrap();
        let c = table.insert(StreamId(2), 100, 5).unwrap();
        assert_eq!(c.vcp_id, 1);
    }

    #[test]
    fn resize_shifts_following_entries() {
        let mut table = VcPayloadTable::new();
        table.insert(StreamId(0), 800, 20).unwrap();
        table.insert(StreamId(1), 400, 10).unwrap();

        table.resize(StreamId(0), 400, 10).unwrap();
        assert_eq!(table.entries()[1].start_slot, 11);
        assert_eq!(table.total_slots(), 20);
    }

    #[test]
    fn duplicate_stream_rejected() {
        let mut table = VcPayloadTable::new();
        table.insert(StreamId(0), 100, 5).unwrap();
        assert!(table.insert(StreamId(0), 100, 5).is_err());
    }

    #[test]
    fn fits_is_pure_arithmetic() {
        // 3 x 25 slots worth of PBN at 40 PBN/slot.
        assert!(!VcPayloadTable::fits(&[1000, 1000, 1000], 40));
        assert!(VcPayloadTable::fits(&[800, 800, 800], 40));
    }
}
