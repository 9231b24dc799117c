//! Per-file extent bookkeeping for the extent-tree walk: the logical
//! block map built up while a file's bmap btree is scanned, the
//! duplicate-extent index consulted in duplicate-detection mode, and the
//! leaf record-list processing shared by both modes.

use crate::blockmap::{BlockMap, BlockState};
use crate::report::Reporter;
use crate::xfs::btree::XfsBmbtRec;
use crate::xfs::superblock::FsContext;
use crate::xfs::types::*;

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Which fork of the inode a tree belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Data,
    Attr,
}

impl Fork {
    pub fn name(&self) -> &'static str {
        match self {
            Fork::Data => "data",
            Fork::Attr => "attr",
        }
    }
}

/// How the owning inode stores its data, as far as the extent walk cares:
/// realtime files keep data-fork extents on the realtime device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InoType {
    Data,
    RtData,
}

/// Logical-to-physical extent map for a single file, filled while its
/// extent btree is walked and consumed by later phases.
#[derive(Debug, Default)]
pub struct Blkmap {
    extents: Vec<BmbtMapping>,
}

#[derive(Debug, Clone, Copy)]
pub struct BmbtMapping {
    pub startoff: XfsFileoff,
    pub startblock: XfsFsblock,
    pub blockcount: XfsExtlen,
}

impl Blkmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ext(&mut self, startoff: XfsFileoff, startblock: XfsFsblock, blockcount: XfsExtlen) {
        self.extents.push(BmbtMapping {
            startoff,
            startblock,
            blockcount,
        });
    }

    pub fn extents(&self) -> &[BmbtMapping] {
        &self.extents
    }
}

/// Known duplicate extents, per AG plus the realtime device. Built by the
/// conflict-resolution phase, consulted read-only by duplicate-mode extent
/// walks.
pub struct DupExtents {
    ags: Vec<Mutex<BTreeMap<XfsAgblock, XfsAgblock>>>,
    rt: Mutex<BTreeMap<XfsFsblock, XfsFsblock>>,
}

impl DupExtents {
    pub fn new(ag_count: u32) -> Self {
        DupExtents {
            ags: (0..ag_count).map(|_| Mutex::new(BTreeMap::new())).collect(),
            rt: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_dup_extent(&self, agno: XfsAgnumber, start: XfsAgblock, end: XfsAgblock) {
        let mut ag = self.ags[agno as usize].lock().expect("dup index lock poisoned");
        ag.insert(start, end);
    }

    /// Does any known duplicate extent overlap `[start, end)` in `agno`?
    pub fn search_dup_extent(&self, agno: XfsAgnumber, start: XfsAgblock, end: XfsAgblock) -> bool {
        let ag = self.ags[agno as usize].lock().expect("dup index lock poisoned");
        ag.range(..end).next_back().is_some_and(|(_, &e)| e > start)
    }

    pub fn add_rt_dup_extent(&self, start: XfsFsblock, end: XfsFsblock) {
        let mut rt = self.rt.lock().expect("dup index lock poisoned");
        rt.insert(start, end);
    }

    pub fn search_rt_dup_extent(&self, bno: XfsFsblock) -> bool {
        let rt = self.rt.lock().expect("dup index lock poisoned");
        rt.range(..=bno).next_back().is_some_and(|(_, &e)| e > bno)
    }
}

/// Validate the extent records of one bmap btree leaf, claim their blocks
/// in the block-accounting map, and append them to the file's block map.
///
/// Returns true on bad news: the inode must be discarded. `first_key` and
/// `last_key` receive the logical offsets of the first and last record so
/// the caller can enforce key ordering across sibling leaves.
#[allow(clippy::too_many_arguments)]
pub fn process_bmbt_reclist(
    fs: &FsContext,
    report: &Reporter,
    bmap: &BlockMap,
    recs: &[XfsBmbtRec],
    ino: XfsIno,
    fork: Fork,
    tot: &mut u64,
    mut blkmap: Option<&mut Blkmap>,
    first_key: &mut XfsFileoff,
    last_key: &mut XfsFileoff,
) -> bool {
    let forkname = fork.name();
    let mut prev_end: Option<XfsFileoff> = None;

    for (i, rec) in recs.iter().enumerate() {
        let irec = rec.unpack();

        if irec.blockcount == 0 {
            report.warn(format_args!(
                "zero length extent (off = {}, fsbno = {}) in ino {ino} ({forkname} fork)",
                irec.startoff, irec.startblock
            ));
            return true;
        }
        if irec.unwritten && fork != Fork::Data {
            report.warn(format_args!(
                "unwritten extent (off = {}) in non-data fork of ino {ino}",
                irec.startoff
            ));
            return true;
        }
        let last = irec.startblock + irec.blockcount as u64 - 1;
        if !fs.verify_fsbno(irec.startblock) || !fs.verify_fsbno(last) {
            report.warn(format_args!(
                "inode {ino} - bad extent starting block number {}, offset {}",
                irec.startblock, irec.startoff
            ));
            return true;
        }
        // Allocations never span AGs.
        if fs.fsblock_to_ag(last).0 != fs.fsblock_to_ag(irec.startblock).0 {
            report.warn(format_args!(
                "inode {ino} - extent crosses AG boundary (fsbno {}, offset {})",
                irec.startblock, irec.startoff
            ));
            return true;
        }
        if let Some(end) = prev_end {
            if irec.startoff < end {
                report.warn(format_args!(
                    "out-of-order or overlapping extent (off = {}) in ino {ino} ({forkname} fork)",
                    irec.startoff
                ));
                return true;
            }
        }
        prev_end = Some(irec.startoff + irec.blockcount as u64);

        if i == 0 {
            *first_key = irec.startoff;
        }
        *last_key = irec.startoff;

        // Claim every block of the extent. A free block claimed by a file
        // is a conflict the freespace scan has to keep seeing, so it goes
        // to Mult rather than InUse.
        let (agno, agbno) = fs.fsblock_to_ag(irec.startblock);
        let end = agbno + irec.blockcount;
        let mut ag = bmap.lock_ag(agno);
        let mut b = agbno;
        while b < end {
            let (state, blen) = ag.get_extent(b, end);
            match state {
                BlockState::Unknown => ag.set_extent(b, blen, BlockState::InUse),
                BlockState::Free1 | BlockState::Free => {
                    report.warn(format_args!(
                        "{forkname} fork in ino {ino} claims free block {}/{b}",
                        agno
                    ));
                    ag.set_extent(b, blen, BlockState::Mult);
                }
                _ => {
                    report.warn(format_args!(
                        "{forkname} fork in ino {ino} claims used block {}/{b}, state {state:?}",
                        agno
                    ));
                    ag.set_extent(b, blen, BlockState::Mult);
                    return true;
                }
            }
            b += blen;
        }
        drop(ag);

        if let Some(map) = blkmap.as_deref_mut() {
            map.set_ext(irec.startoff, irec.startblock, irec.blockcount);
        }
        *tot += irec.blockcount as u64;
    }
    false
}

/// Duplicate-mode counterpart of [`process_bmbt_reclist`]: look each
/// extent up in the duplicate index and report a hit. Never touches the
/// block-accounting map.
pub fn scan_bmbt_reclist(
    fs: &FsContext,
    report: &Reporter,
    dups: &DupExtents,
    recs: &[XfsBmbtRec],
    ino: XfsIno,
    ino_type: InoType,
    fork: Fork,
    tot: &mut u64,
) -> bool {
    for rec in recs {
        let irec = rec.unpack();
        let is_rt = ino_type == InoType::RtData && fork == Fork::Data;
        // Realtime extents address the realtime device; the data-device
        // range check does not apply to them.
        if irec.blockcount == 0 || (!is_rt && !fs.verify_fsbno(irec.startblock)) {
            report.warn(format_args!(
                "bad extent (off = {}, fsbno = {}) in ino {ino} ({} fork)",
                irec.startoff,
                irec.startblock,
                fork.name()
            ));
            return true;
        }
        if is_rt {
            for b in irec.startblock..irec.startblock + irec.blockcount as u64 {
                if dups.search_rt_dup_extent(b) {
                    return true;
                }
            }
        } else {
            let (agno, agbno) = fs.fsblock_to_ag(irec.startblock);
            if dups.search_dup_extent(agno, agbno, agbno + irec.blockcount) {
                return true;
            }
        }
        *tot += irec.blockcount as u64;
    }
    false
}
