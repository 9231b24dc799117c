//! Visitor for file extent btrees.
//!
//! Unlike the AG freespace trees, anything that looks wrong in a file's
//! extent tree just condemns the inode: a file whose metadata cannot be
//! trusted is discarded rather than half-repaired. The one exception is
//! interior keys that disagree with the child's first key, which modify
//! mode corrects in place.

use zerocopy::byteorder::big_endian::U64;

use crate::blockmap::BlockState;
use crate::bmap::{Blkmap, Fork, InoType, process_bmbt_reclist, scan_bmbt_reclist};
use crate::scan::ScanContext;
use crate::scan::lbtree::{BmapCursor, scan_lbtree};
use crate::xfs::btree::{
    XFS_BMAP_CRC_MAGIC, XfsBmbtKey, XfsBmbtRec, long_hdr_size, parse_long_hdr, rec_slice,
    rec_slice_mut,
};
use crate::xfs::types::*;

#[allow(clippy::too_many_arguments)]
pub(crate) fn scan_bmapbt(
    ctx: &ScanContext<'_>,
    buf: &mut [u8],
    level: u32,
    ino: XfsIno,
    ino_type: InoType,
    fork: Fork,
    bno: XfsFsblock,
    tot: &mut u64,
    nex: &mut u64,
    mut blkmap: Option<&mut Blkmap>,
    cursor: &mut BmapCursor,
    isroot: bool,
    check_dups: bool,
    dirty: &mut bool,
    magic: u32,
) -> bool {
    let fs = ctx.fs;
    let forkname = fork.name();
    let lvl = level as usize;

    let hdr = match parse_long_hdr(buf, fs.is_v5()) {
        Ok(hdr) => hdr,
        Err(_) => {
            ctx.report.warn(format_args!(
                "truncated bmbt block {bno} in inode {ino} ({forkname} fork)"
            ));
            return true;
        }
    };

    // If anything looks wrong in an inode's extent tree, just bail; the
    // inode gets cleared rather than trusting a damaged map.
    if hdr.magic != magic {
        ctx.report.warn(format_args!(
            "bad magic # {:#x} in inode {ino} ({forkname} fork) bmbt block {bno}",
            hdr.magic
        ));
        return true;
    }
    if hdr.level != level {
        ctx.report.warn(format_args!(
            "expected level {level} got {} in inode {ino}, ({forkname} fork) bmbt block {bno}",
            hdr.level
        ));
        return true;
    }

    if magic == XFS_BMAP_CRC_MAGIC {
        if hdr.owner != ino {
            ctx.report.warn(format_args!(
                "expected owner inode {ino}, got {}, bmbt block {bno}",
                hdr.owner
            ));
            return true;
        }
        if hdr.blkno != fs.fsblock_to_daddr(bno) {
            ctx.report.warn(format_args!(
                "expected block {}, got {}, bmbt block {bno}",
                fs.fsblock_to_daddr(bno),
                hdr.blkno
            ));
            return true;
        }
        if hdr.uuid != fs.uuid {
            ctx.report
                .warn(format_args!("wrong FS UUID, bmbt block {bno}"));
            return true;
        }
    }

    let (agno, agbno) = fs.fsblock_to_ag(bno);

    if !check_dups {
        // Check sibling pointers. A mismatch is a conflict between this
        // block and the child pointers in the parent: condemn the inode.
        if cursor.level[lvl].fsbno != NULL_FSBLOCK {
            // Not the first block on this level; the cursor carries the
            // left sibling's view of the chain.
            if bno != cursor.level[lvl].right_fsbno {
                ctx.report.warn(format_args!(
                    "bad fwd (right) sibling pointer (saw {} parent block says {bno})\n\tin inode {ino} ({forkname} fork) bmap btree block {}",
                    cursor.level[lvl].right_fsbno,
                    cursor.level[lvl].fsbno
                ));
                return true;
            }
            if hdr.leftsib != cursor.level[lvl].fsbno {
                ctx.report.warn(format_args!(
                    "bad back (left) sibling pointer (saw {} parent block says {})\n\tin inode {ino} ({forkname} fork) bmap btree block {bno}",
                    hdr.leftsib,
                    cursor.level[lvl].fsbno
                ));
                return true;
            }
        } else if hdr.leftsib != NULL_FSBLOCK {
            // First or only block on this level must have no left sibling.
            ctx.report.warn(format_args!(
                "bad back (left) sibling pointer (saw {} should be NULL (0))\n\tin inode {ino} ({forkname} fork) bmap btree block {bno}",
                hdr.leftsib
            ));
            return true;
        }

        cursor.level[lvl].fsbno = bno;
        cursor.level[lvl].left_fsbno = hdr.leftsib;
        cursor.level[lvl].right_fsbno = hdr.rightsib;

        let mut ag = ctx.bmap.lock_ag(agno);
        let state = ag.get(agbno);
        match state {
            BlockState::Unknown | BlockState::Free1 | BlockState::Free => {
                ag.set(agbno, BlockState::InUse);
            }
            BlockState::Ino | BlockState::FsMap | BlockState::InUse => {
                // The block looked claimed already, but we got here via a
                // parent pointer, so it probably does hold btree data:
                // keep both claims visible.
                ag.set(agbno, BlockState::Mult);
                ctx.report.warn(format_args!(
                    "inode {ino:#x} bmap block {bno:#x} claimed, state is {state:?}"
                ));
            }
            BlockState::Mult | BlockState::InUseFs => {
                // Probably a bmap block shared with another file; keep
                // descending so every shared block of both files is marked
                // duplicate.
                ag.set(agbno, BlockState::Mult);
                ctx.report.warn(format_args!(
                    "inode {ino:#x} bmap block {bno:#x} claimed, state is {state:?}"
                ));
            }
            BlockState::Bad => {
                ctx.report.warn(format_args!(
                    "bad state {state:?}, inode {ino} bmap block {bno:#x}"
                ));
            }
        }
    } else {
        // Duplicate mode: the attribute fork of realtime files lives in
        // the regular filesystem, so only realtime data forks consult the
        // realtime index.
        if ino_type != InoType::RtData || fork != Fork::Data {
            if ctx.dups.search_dup_extent(agno, agbno, agbno + 1) {
                return true;
            }
        } else if ctx.dups.search_rt_dup_extent(bno) {
            return true;
        }
    }

    *tot += 1;
    let numrecs = hdr.numrecs;
    let limits = &fs.bmbt_limits;
    let hdr_size = long_hdr_size(fs.is_v5());

    if level == 0 {
        if numrecs > limits.leaf_max || (!isroot && numrecs < limits.leaf_min) {
            ctx.report.warn(format_args!(
                "inode {ino} bad # of bmap records ({numrecs}, min - {}, max - {})",
                limits.leaf_min, limits.leaf_max
            ));
            return true;
        }
        let recs = match rec_slice::<XfsBmbtRec>(buf, hdr_size, numrecs as usize) {
            Ok(recs) => recs,
            Err(_) => {
                ctx.report.warn(format_args!(
                    "truncated records in inode {ino} bmbt block {bno}"
                ));
                return true;
            }
        };
        *nex += numrecs as u64;

        if !check_dups {
            let mut first_key = NULL_FILEOFF;
            let mut last_key = NULL_FILEOFF;
            if process_bmbt_reclist(
                fs,
                ctx.report,
                ctx.bmap,
                recs,
                ino,
                fork,
                tot,
                blkmap,
                &mut first_key,
                &mut last_key,
            ) {
                return true;
            }

            // Keys must increase monotonically across sibling leaves. A
            // cursor last_key of NULL_FILEOFF means this is the first leaf,
            // with nothing to compare against yet.
            if first_key <= cursor.level[lvl].last_key
                && cursor.level[lvl].last_key != NULL_FILEOFF
            {
                ctx.report.warn(format_args!(
                    "out-of-order bmap key (file offset) in inode {ino}, {forkname} fork, fsbno {bno}"
                ));
                return true;
            }
            cursor.level[lvl].first_key = first_key;
            cursor.level[lvl].last_key = last_key;
            false
        } else {
            scan_bmbt_reclist(fs, ctx.report, ctx.dups, recs, ino, ino_type, fork, tot)
        }
    } else {
        if numrecs > limits.node_max || (!isroot && numrecs < limits.node_min) {
            ctx.report.warn(format_args!(
                "inode {ino} bad # of bmap records ({numrecs}, min - {}, max - {})",
                limits.node_min, limits.node_max
            ));
            return true;
        }

        let ptr_offset = hdr_size + limits.node_max as usize * std::mem::size_of::<XfsBmbtKey>();
        let ptrs: Vec<XfsFsblock> = match rec_slice::<U64>(buf, ptr_offset, numrecs as usize) {
            Ok(ptrs) => ptrs.iter().map(|p| p.get()).collect(),
            Err(_) => {
                ctx.report.warn(format_args!(
                    "truncated pointers in inode {ino} bmbt block {bno}"
                ));
                return true;
            }
        };

        for (i, &child) in ptrs.iter().enumerate() {
            if !fs.verify_fsbno(child) {
                ctx.report.warn(format_args!(
                    "bad bmap btree ptr {child:#x} in ino {ino}"
                ));
                return true;
            }

            if scan_lbtree(
                ctx,
                child,
                level,
                ino,
                ino_type,
                fork,
                tot,
                nex,
                blkmap.as_deref_mut(),
                cursor,
                false,
                check_dups,
                magic,
            ) {
                return true;
            }

            // Fix key mismatches between the first key in the child block
            // (recorded in the cursor by the recursion above) and the key
            // stored here: entries shifted between children without the
            // parent being updated.
            if !check_dups {
                let child_first = cursor.level[lvl - 1].first_key;
                let keys = match rec_slice_mut::<XfsBmbtKey>(buf, hdr_size, numrecs as usize) {
                    Ok(keys) => keys,
                    Err(_) => return true,
                };
                if keys[i].br_startoff.get() != child_first {
                    if !ctx.no_modify {
                        ctx.report.warn(format_args!(
                            "correcting bt key (was {}, now {child_first}) in inode {ino}\n\t\t{forkname} fork, btree block {bno}",
                            keys[i].br_startoff.get()
                        ));
                        *dirty = true;
                        keys[i].br_startoff = U64::new(child_first);
                    } else {
                        ctx.report.warn(format_args!(
                            "bad btree key (is {}, should be {child_first}) in inode {ino}\n\t\t{forkname} fork, btree block {bno}",
                            keys[i].br_startoff.get()
                        ));
                    }
                }
            }
        }

        // If we're the last node at our level, the rightmost child must
        // also end its chain.
        if !check_dups
            && cursor.level[lvl].right_fsbno == NULL_FSBLOCK
            && cursor.level[lvl - 1].right_fsbno != NULL_FSBLOCK
        {
            ctx.report.warn(format_args!(
                "bad fwd (right) sibling pointer (saw {} should be NULLFSBLOCK)\n\tin inode {ino} ({forkname} fork) bmap btree block {}",
                cursor.level[lvl - 1].right_fsbno,
                cursor.level[lvl - 1].fsbno
            ));
            return true;
        }

        if !check_dups {
            let keys = match rec_slice::<XfsBmbtKey>(buf, hdr_size, numrecs as usize) {
                Ok(keys) => keys,
                Err(_) => return true,
            };
            cursor.level[lvl].first_key = keys[0].br_startoff.get();
            cursor.level[lvl].last_key = keys[numrecs as usize - 1].br_startoff.get();
        }
        false
    }
}
