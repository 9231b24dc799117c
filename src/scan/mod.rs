//! The filesystem scan: a parallel walk of every AG's metadata btrees
//! that claims blocks in the accounting map, imports inode chunks, and
//! cross-checks every stored counter against what the trees actually
//! contain.

pub mod ag;
pub mod allocbt;
pub mod bmapbt;
pub mod dispatch;
pub mod inobt;
pub mod lbtree;
pub mod sbtree;

use std::ops::Range;

use crate::blockmap::BlockMap;
use crate::bmap::DupExtents;
use crate::incore::Inventory;
use crate::io::buffers::Buffers;
use crate::io::device::BlockDev;
use crate::report::Reporter;
use crate::xfs::superblock::FsContext;
use crate::xfs::types::{INODES_PER_CHUNK, XfsAgino, XfsAgnumber};

/// Per-AG tallies accumulated by one worker, then checked against the
/// stored AGF/AGI header values and reduced into the superblock totals.
#[derive(Debug, Default, Clone)]
pub struct AgCounts {
    pub agno: XfsAgnumber,
    pub agf_freeblks: u32,
    pub agf_longest: u32,
    pub agf_btreeblks: u64,
    pub agi_count: u32,
    pub agi_freecount: u32,
    pub fibt_freecount: u32,
    pub fdblocks: u64,
    pub ifreecount: u64,
    /// The inode btrees of this AG showed corruption; later phases must
    /// not trust the inventory alone.
    pub bad_ino_btree: bool,
}

impl AgCounts {
    pub fn new(agno: XfsAgnumber) -> Self {
        AgCounts {
            agno,
            ..Default::default()
        }
    }
}

/// Everything a worker needs, bundled once and shared by reference.
/// There is deliberately no global state: the block map, inventory, and
/// reporter all live exactly as long as the scan that owns them.
pub struct ScanContext<'a> {
    pub fs: &'a FsContext,
    pub bufs: Buffers<'a>,
    pub bmap: &'a BlockMap,
    pub inventory: &'a Inventory,
    pub dups: &'a DupExtents,
    pub report: &'a Reporter,
    pub no_modify: bool,
    /// AG-0 inodes that may legitimately sit on pre-reserved blocks (the
    /// chunk mkfs carves out next to the log for the root directory).
    pub prealloc_inos: Option<Range<XfsAgino>>,
}

impl<'a> ScanContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: &'a FsContext,
        dev: &'a dyn BlockDev,
        bmap: &'a BlockMap,
        inventory: &'a Inventory,
        dups: &'a DupExtents,
        report: &'a Reporter,
        no_modify: bool,
    ) -> Self {
        ScanContext {
            fs,
            bufs: Buffers::new(dev, fs.is_v5()),
            bmap,
            inventory,
            dups,
            report,
            no_modify,
            prealloc_inos: prealloc_ino_range(fs),
        }
    }

    /// Is `agino` inside the AG-0 pre-allocation range?
    pub fn is_prealloc_ino(&self, agino: XfsAgino) -> bool {
        self.prealloc_inos
            .as_ref()
            .is_some_and(|r| r.contains(&agino))
    }
}

/// The chunk holding the root inode, when the root lives in AG 0.
fn prealloc_ino_range(fs: &FsContext) -> Option<Range<XfsAgino>> {
    let shift = fs.inop_blog as u64 + fs.ag_blk_log as u64;
    let agno = (fs.root_ino >> shift) as XfsAgnumber;
    if agno != 0 {
        return None;
    }
    let agino = (fs.root_ino & ((1u64 << shift) - 1)) as XfsAgino;
    let start = agino & !(INODES_PER_CHUNK - 1);
    Some(start..start + INODES_PER_CHUNK)
}
