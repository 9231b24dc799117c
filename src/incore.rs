//! In-core inode inventory.
//!
//! The inode btree visitors import chunk records here as they walk; later
//! phases consume the inventory to verify the inodes themselves. Records
//! from trees that looked healthy become authoritative chunk records;
//! inodes from suspect subtrees are filed as uncertain entries carrying
//! only their presumed free/used status.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::xfs::types::{INODES_PER_CHUNK, XfsAgino, XfsAgnumber};

/// One imported inode chunk: 64 inodes starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InoChunkRec {
    pub start: XfsAgino,
    free_mask: u64,
    sparse_mask: u64,
}

impl InoChunkRec {
    pub fn new(start: XfsAgino) -> Self {
        InoChunkRec {
            start,
            free_mask: 0,
            sparse_mask: 0,
        }
    }

    pub fn set_free(&mut self, j: u32) {
        self.free_mask |= 1u64 << j;
    }

    pub fn set_used(&mut self, j: u32) {
        self.free_mask &= !(1u64 << j);
    }

    pub fn set_sparse(&mut self, j: u32) {
        self.sparse_mask |= 1u64 << j;
    }

    pub fn is_free(&self, j: u32) -> bool {
        (self.free_mask & (1u64 << j)) != 0
    }

    pub fn is_sparse(&self, j: u32) -> bool {
        (self.sparse_mask & (1u64 << j)) != 0
    }

    /// Free inodes excluding sparse slots.
    pub fn free_count(&self) -> u32 {
        (self.free_mask & !self.sparse_mask).count_ones()
    }
}

#[derive(Default)]
struct AgInventory {
    chunks: BTreeMap<XfsAgino, InoChunkRec>,
    /// agino -> presumed-free, for inodes whose surrounding record is
    /// suspect.
    uncertain: BTreeMap<XfsAgino, bool>,
}

/// Whole-filesystem inventory, sharded by AG. Outlives the scan.
pub struct Inventory {
    ags: Vec<Mutex<AgInventory>>,
}

impl Inventory {
    pub fn new(ag_count: u32) -> Self {
        Inventory {
            ags: (0..ag_count).map(|_| Mutex::new(AgInventory::default())).collect(),
        }
    }

    pub fn insert_chunk(&self, agno: XfsAgnumber, rec: InoChunkRec) {
        let mut ag = self.ags[agno as usize].lock().expect("inventory lock poisoned");
        ag.chunks.insert(rec.start, rec);
    }

    /// The authoritative record starting exactly at `start`, if any.
    pub fn chunk_at(&self, agno: XfsAgnumber, start: XfsAgino) -> Option<InoChunkRec> {
        let ag = self.ags[agno as usize].lock().expect("inventory lock poisoned");
        ag.chunks.get(&start).copied()
    }

    /// Starting inode numbers of the first and last authoritative records
    /// whose chunk overlaps `[lo, hi)`.
    pub fn find_chunk_range(
        &self,
        agno: XfsAgnumber,
        lo: XfsAgino,
        hi: XfsAgino,
    ) -> Option<(XfsAgino, XfsAgino)> {
        let ag = self.ags[agno as usize].lock().expect("inventory lock poisoned");
        // A chunk starting up to 63 inodes below `lo` still overlaps it.
        let scan_lo = lo.saturating_sub(INODES_PER_CHUNK - 1);
        let mut overlapping = ag
            .chunks
            .range(scan_lo..hi)
            .map(|(&start, _)| start)
            .filter(|&start| start + INODES_PER_CHUNK > lo);
        let first = overlapping.next()?;
        let last = overlapping.last().unwrap_or(first);
        Some((first, last))
    }

    pub fn add_uncertain(&self, agno: XfsAgnumber, agino: XfsAgino, is_free: bool) {
        let mut ag = self.ags[agno as usize].lock().expect("inventory lock poisoned");
        ag.uncertain.insert(agino, is_free);
    }

    pub fn chunk_count(&self, agno: XfsAgnumber) -> usize {
        self.ags[agno as usize].lock().expect("inventory lock poisoned").chunks.len()
    }

    pub fn uncertain_count(&self, agno: XfsAgnumber) -> usize {
        self.ags[agno as usize].lock().expect("inventory lock poisoned").uncertain.len()
    }

    /// Snapshot of all authoritative chunk records in one AG, in inode
    /// order.
    pub fn chunks(&self, agno: XfsAgnumber) -> Vec<InoChunkRec> {
        let ag = self.ags[agno as usize].lock().expect("inventory lock poisoned");
        ag.chunks.values().copied().collect()
    }
}
