//! Visitor for the two freespace btrees.
//!
//! The by-offset and by-count trees index the same free extents; blocks
//! move Unknown -> Free1 when the by-offset tree claims them and
//! Free1 -> Free when the by-count tree confirms. Tree blocks themselves
//! become FsMap, and (except for the roots) count toward the free-block
//! totals since a fully used filesystem frees them.

use zerocopy::byteorder::big_endian::U32;

use crate::blockmap::BlockState;
use crate::scan::sbtree::{SbtreeVisitor, scan_sbtree};
use crate::scan::{AgCounts, ScanContext};
use crate::xfs::btree::{
    XFS_ABTB_CRC_MAGIC, XFS_ABTB_MAGIC, XfsAllocRec, parse_short_hdr, rec_slice, short_hdr_size,
};
use crate::xfs::types::{XfsAgblock, XfsAgnumber, XfsExtlen};

#[allow(clippy::too_many_arguments)]
pub(crate) fn scan_allocbt(
    ctx: &ScanContext<'_>,
    buf: &[u8],
    level: u32,
    bno: XfsAgblock,
    agno: XfsAgnumber,
    mut suspect: u32,
    isroot: bool,
    magic: u32,
    agcnts: &mut AgCounts,
) {
    let fs = ctx.fs;
    let is_bno_tree = magic == XFS_ABTB_MAGIC || magic == XFS_ABTB_CRC_MAGIC;
    let name = if is_bno_tree { "bno" } else { "cnt" };

    let hdr = match parse_short_hdr(buf, fs.is_v5()) {
        Ok(hdr) => hdr,
        Err(_) => {
            ctx.report.warn(format_args!(
                "truncated bt{name} block {agno}/{bno}"
            ));
            return;
        }
    };

    let mut hdr_errors = 0u32;
    if hdr.magic != magic {
        ctx.report.warn(format_args!(
            "bad magic # {:#x} in bt{name} block {agno}/{bno}",
            hdr.magic
        ));
        hdr_errors += 1;
        if suspect > 0 {
            return;
        }
    }

    // All freespace btree blocks except the roots are freed for a fully
    // used filesystem, so they count toward the free data blocks.
    if !isroot {
        agcnts.agf_btreeblks += 1;
        agcnts.fdblocks += 1;
    }

    if hdr.level != level {
        ctx.report.warn(format_args!(
            "expected level {level} got {} in bt{name} block {agno}/{bno}",
            hdr.level
        ));
        hdr_errors += 1;
        if suspect > 0 {
            return;
        }
    }

    // The tree block itself may only be claimed once.
    {
        let mut ag = ctx.bmap.lock_ag(agno);
        let state = ag.get(bno);
        if state != BlockState::Unknown {
            ag.set(bno, BlockState::Mult);
            ctx.report.warn(format_args!(
                "{name} freespace btree block claimed (state {state:?}), agno {agno}, bno {bno}, suspect {suspect}"
            ));
            return;
        }
        ag.set(bno, BlockState::FsMap);
    }

    let limits = &fs.alloc_limits;
    let hdr_size = short_hdr_size(fs.is_v5());
    let mut numrecs = hdr.numrecs;

    if level == 0 {
        if numrecs > limits.leaf_max {
            numrecs = limits.leaf_max;
            hdr_errors += 1;
        }
        if !isroot && numrecs < limits.leaf_min {
            numrecs = limits.leaf_min;
            hdr_errors += 1;
        }
        if hdr_errors > 0 {
            ctx.report.warn(format_args!(
                "bad btree nrecs ({}, min={}, max={}) in bt{name} block {agno}/{bno}",
                hdr.numrecs, limits.leaf_min, limits.leaf_max
            ));
            suspect += 1;
        }

        let recs = match rec_slice::<XfsAllocRec>(buf, hdr_size, numrecs as usize) {
            Ok(recs) => recs,
            Err(_) => {
                ctx.report.warn(format_args!(
                    "truncated records in bt{name} block {agno}/{bno}"
                ));
                return;
            }
        };

        let mut lastblock: XfsAgblock = 0;
        let mut lastcount: XfsExtlen = 0;
        for (i, rec) in recs.iter().enumerate() {
            let b = rec.ar_startblock.get();
            let len = rec.ar_blockcount.get();
            let end = b as u64 + len as u64;

            if b == 0 || !fs.verify_agbno(agno, b) {
                ctx.report.warn(format_args!(
                    "invalid start block {b} in record {i} of {name} btree block {agno}/{bno}"
                ));
                continue;
            }
            if len == 0 || end - 1 > u32::MAX as u64 || !fs.verify_agbno(agno, (end - 1) as u32) {
                ctx.report.warn(format_args!(
                    "invalid length {len} in record {i} of {name} btree block {agno}/{bno}"
                ));
                continue;
            }
            let end = end as XfsAgblock;

            if is_bno_tree {
                if b <= lastblock {
                    ctx.report.warn(format_args!(
                        "out-of-order bno btree record {i} ({b} {len}) block {agno}/{bno}"
                    ));
                } else {
                    lastblock = b;
                }
            } else {
                agcnts.fdblocks += len as u64;
                agcnts.agf_freeblks += len;
                if len > agcnts.agf_longest {
                    agcnts.agf_longest = len;
                }
                if len < lastcount {
                    ctx.report.warn(format_args!(
                        "out-of-order cnt btree record {i} ({b} {len}) block {agno}/{bno}"
                    ));
                } else {
                    lastcount = len;
                }
            }

            let mut ag = ctx.bmap.lock_ag(agno);
            let mut b = b;
            while b < end {
                let (state, blen) = ag.get_extent(b, end);
                match state {
                    BlockState::Unknown => ag.set_extent(b, blen, BlockState::Free1),
                    BlockState::Free1 if !is_bno_tree => {
                        ag.set_extent(b, blen, BlockState::Free)
                    }
                    _ => {
                        ctx.report.warn(format_args!(
                            "block ({agno},{b}-{}) multiply claimed by {name} space tree, state - {state:?}",
                            b + blen - 1
                        ));
                        ag.set_extent(b, blen, BlockState::Mult);
                    }
                }
                b += blen;
            }
        }
        return;
    }

    // Interior node.
    if numrecs > limits.node_max {
        numrecs = limits.node_max;
        hdr_errors += 1;
    }
    if !isroot && numrecs < limits.node_min {
        numrecs = limits.node_min;
        hdr_errors += 1;
    }

    // Don't pass the suspect flag down further if this block looked ok;
    // bail out if two levels in a row look bad.
    if hdr_errors > 0 {
        ctx.report.warn(format_args!(
            "bad btree nrecs ({}, min={}, max={}) in bt{name} block {agno}/{bno}",
            hdr.numrecs, limits.node_min, limits.node_max
        ));
        if suspect > 0 {
            return;
        }
        suspect += 1;
    } else if suspect > 0 {
        suspect = 0;
    }

    let ptr_offset = hdr_size + limits.node_max as usize * std::mem::size_of::<XfsAllocRec>();
    let ptrs = match rec_slice::<U32>(buf, ptr_offset, numrecs as usize) {
        Ok(ptrs) => ptrs,
        Err(_) => {
            ctx.report.warn(format_args!(
                "truncated pointers in bt{name} block {agno}/{bno}"
            ));
            return;
        }
    };

    for ptr in ptrs {
        let child = ptr.get();
        if child != 0 && fs.verify_agbno(agno, child) {
            scan_sbtree(
                ctx,
                child,
                level,
                agno,
                suspect,
                SbtreeVisitor::Alloc,
                false,
                magic,
                agcnts,
            );
        }
    }
}
