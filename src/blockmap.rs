//! Block-accounting state map.
//!
//! Every physical data block in the filesystem gets one state slot; the
//! tree visitors claim blocks as they discover owners and conflicting
//! claims collapse to [`BlockState::Mult`]. The map is scanner-scoped:
//! it is created when the scan starts, shared by reference with every
//! worker, and handed back to the caller in the scan report.

use std::sync::{Mutex, MutexGuard};

use crate::xfs::superblock::FsContext;
use crate::xfs::types::{XfsAgblock, XfsAgnumber, XfsExtlen};

/// Ownership state of one AG block.
///
/// Transitions are monotonic toward `Mult`: the only multi-step path is
/// `Unknown -> Free1 -> Free` (by-offset tree seen, then confirmed by the
/// by-count tree); every other second claim is a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// Not yet observed.
    Unknown,
    /// Seen in the by-offset freespace tree, not yet in the by-count tree.
    Free1,
    /// Confirmed free by both freespace trees.
    Free,
    /// Holds inode chunk data.
    Ino,
    /// Holds filesystem metadata (btree block, AGFL).
    FsMap,
    /// Claimed by a file or directory for data.
    InUse,
    /// Pre-allocated reserved metadata region (AG headers, internal log).
    InUseFs,
    /// Multiply claimed.
    Mult,
    /// Invalid transition observed.
    Bad,
}

/// One AG's slice of the map. Obtained via [`BlockMap::lock_ag`]; all
/// operations on an AG happen under that AG's lock.
pub struct AgBlockMap<'a> {
    guard: MutexGuard<'a, Vec<BlockState>>,
}

impl AgBlockMap<'_> {
    pub fn get(&self, bno: XfsAgblock) -> BlockState {
        self.guard
            .get(bno as usize)
            .copied()
            .unwrap_or(BlockState::Bad)
    }

    pub fn set(&mut self, bno: XfsAgblock, state: BlockState) {
        if let Some(slot) = self.guard.get_mut(bno as usize) {
            *slot = state;
        }
    }

    /// State at `bno` plus the length of the run of equal states, clamped
    /// to `maxbno`. Lets callers reconcile whole extents without touching
    /// every block individually.
    pub fn get_extent(&self, bno: XfsAgblock, maxbno: XfsAgblock) -> (BlockState, XfsExtlen) {
        let state = self.get(bno);
        let mut len = 1;
        while bno + len < maxbno && self.get(bno + len) == state {
            len += 1;
        }
        (state, len)
    }

    pub fn set_extent(&mut self, bno: XfsAgblock, len: XfsExtlen, state: BlockState) {
        for b in bno..bno.saturating_add(len) {
            self.set(b, state);
        }
    }

    /// Number of blocks currently in `state`.
    pub fn count(&self, state: BlockState) -> u64 {
        self.guard.iter().filter(|&&s| s == state).count() as u64
    }

    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

/// The whole-filesystem map, sharded by AG with one lock per shard.
pub struct BlockMap {
    ags: Vec<Mutex<Vec<BlockState>>>,
}

impl BlockMap {
    /// Build the map from filesystem geometry. The per-AG header blocks
    /// and the internal log extent start out reserved.
    pub fn new(fs: &FsContext) -> Self {
        let hdr_blocks = fs.ag_header_blocks();
        let mut ags = Vec::with_capacity(fs.ag_count as usize);
        for agno in 0..fs.ag_count {
            let mut states = vec![BlockState::Unknown; fs.ag_length(agno) as usize];
            for slot in states.iter_mut().take(hdr_blocks as usize) {
                *slot = BlockState::InUseFs;
            }
            ags.push(Mutex::new(states));
        }
        let map = BlockMap { ags };

        if fs.logstart != 0 {
            let (log_agno, log_agbno) = fs.fsblock_to_ag(fs.logstart);
            if log_agno < fs.ag_count {
                let mut ag = map.lock_ag(log_agno);
                ag.set_extent(log_agbno, fs.logblocks, BlockState::InUseFs);
            }
        }
        map
    }

    pub fn lock_ag(&self, agno: XfsAgnumber) -> AgBlockMap<'_> {
        AgBlockMap {
            guard: self.ags[agno as usize]
                .lock()
                .expect("block map lock poisoned"),
        }
    }

    pub fn ag_count(&self) -> u32 {
        self.ags.len() as u32
    }
}
