//! Visitor for the inode allocation btree and the free inode btree.
//!
//! The inobt is the source of truth for chunk allocation: it marks the
//! blocks its chunks cover and imports every chunk into the in-core
//! inventory. The finobt only lists chunks that still have free inodes,
//! so its scan cross-validates against what the inobt already imported
//! instead of claiming anything new. Records from subtrees that look
//! damaged are rescued as uncertain entries rather than trusted.

use zerocopy::byteorder::big_endian::U32;

use crate::blockmap::BlockState;
use crate::incore::InoChunkRec;
use crate::scan::sbtree::{SbtreeVisitor, scan_sbtree};
use crate::scan::{AgCounts, ScanContext};
use crate::xfs::btree::{
    XFS_IBT_CRC_MAGIC, XFS_IBT_MAGIC, XfsInobtKey, XfsInobtRec, parse_short_hdr, rec_slice,
    short_hdr_size,
};
use crate::xfs::types::{INODES_PER_CHUNK, XfsAgblock, XfsAgnumber};

/// Which of the two inode btrees a record came from; only the wording of
/// the diagnostics differs between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InobtKind {
    Inobt,
    Finobt,
}

impl InobtKind {
    fn name(self) -> &'static str {
        match self {
            InobtKind::Inobt => "inobt",
            InobtKind::Finobt => "finobt",
        }
    }
}

fn is_sparse(ctx: &ScanContext<'_>, rec: &XfsInobtRec, j: u32) -> bool {
    ctx.fs.has_sparse_inodes && rec.is_sparse(j)
}

/// Verify chunk alignment and that the inode range fits the AG. Returns
/// true when the record is too bogus to import at all.
fn verify_single_ino_chunk_align(
    ctx: &ScanContext<'_>,
    agno: XfsAgnumber,
    kind: InobtKind,
    rec: &XfsInobtRec,
    suspect: &mut u32,
) -> bool {
    let fs = ctx.fs;
    let name = kind.name();
    let ino = rec.start_ino();
    let off = fs.agino_offset(ino);
    let agbno = fs.agino_to_agbno(ino);
    let lino = fs.agino_to_ino(agno, ino);

    // On multi-block chunks the chunk starts at the beginning of a block;
    // on multi-chunk blocks it starts on a 64-inode boundary. Aligned-inode
    // filesystems additionally pin the block to the alignment.
    let inopb = fs.inodes_per_block as u32;
    if ino == 0
        || (inopb <= INODES_PER_CHUNK && off != 0)
        || (inopb > INODES_PER_CHUNK && off % INODES_PER_CHUNK != 0)
        || (fs.has_aligned_inodes && agbno % fs.ino_alignment != 0)
    {
        ctx.report.warn(format_args!(
            "badly aligned {name} rec (starting inode = {lino})"
        ));
        *suspect += 1;
    }

    if !fs.verify_agino(agno, ino) {
        ctx.report.warn(format_args!(
            "bad starting inode # ({lino} ({agno:#x} {ino:#x})) in {name} rec, skipping rec"
        ));
        *suspect += 1;
        return true;
    }
    if !fs.verify_agino(agno, ino + INODES_PER_CHUNK - 1) {
        ctx.report.warn(format_args!(
            "bad ending inode # ({} ({agno:#x} {:#x})) in {name} rec, skipping rec",
            lino + INODES_PER_CHUNK as u64 - 1,
            ino + INODES_PER_CHUNK - 1
        ));
        *suspect += 1;
        return true;
    }
    false
}

/// Import one chunk: an authoritative record when the tree looked
/// healthy, uncertain entries otherwise. Returns the updated suspect
/// count and the non-sparse total and free inode counts.
fn import_single_ino_chunk(
    ctx: &ScanContext<'_>,
    agno: XfsAgnumber,
    kind: InobtKind,
    rec: &XfsInobtRec,
    mut suspect: u32,
) -> (u32, u32, u32) {
    let ino = rec.start_ino();
    let name = kind.name();

    let mut chunk = if suspect == 0 {
        let mut chunk = InoChunkRec::new(ino);
        for j in 0..INODES_PER_CHUNK {
            if rec.is_free(j) {
                chunk.set_free(j);
            } else {
                chunk.set_used(j);
            }
        }
        Some(chunk)
    } else {
        for j in 0..INODES_PER_CHUNK {
            ctx.inventory.add_uncertain(agno, ino + j, rec.is_free(j));
        }
        None
    };

    // Sparse inodes must also be free, and the count fields only track
    // the non-sparse ones.
    let mut nfree = 0;
    let mut ninodes = 0;
    for j in 0..INODES_PER_CHUNK {
        if is_sparse(ctx, rec, j) {
            if suspect == 0 && !rec.is_free(j) {
                ctx.report.warn(format_args!(
                    "ir_holemask/ir_free mismatch, {name} chunk {agno}/{ino}, holemask {:#x} free {:#x}",
                    rec.ir_holemask.get(),
                    rec.ir_free.get()
                ));
                suspect += 1;
            }
            if suspect == 0 {
                if let Some(chunk) = chunk.as_mut() {
                    chunk.set_sparse(j);
                }
            }
        } else {
            if rec.is_free(j) {
                nfree += 1;
            }
            ninodes += 1;
        }
    }

    if let Some(chunk) = chunk {
        ctx.inventory.insert_chunk(agno, chunk);
    }
    (suspect, nfree, ninodes)
}

/// Process one inobt record: claim the chunk's blocks, check for overlap
/// with already-imported chunks, import, and cross-check the counts.
fn scan_single_ino_chunk(
    ctx: &ScanContext<'_>,
    agno: XfsAgnumber,
    rec: &XfsInobtRec,
    mut suspect: u32,
) -> u32 {
    let fs = ctx.fs;
    let ino = rec.start_ino();
    let off = fs.agino_offset(ino);
    let lino = fs.agino_to_ino(agno, ino);
    let freecount = rec.freecount(fs.has_sparse_inodes);

    if verify_single_ino_chunk_align(ctx, agno, InobtKind::Inobt, rec, &mut suspect) {
        return suspect;
    }

    // Set the state of each block holding inodes of this chunk.
    if off == 0 && suspect == 0 {
        let mut ag = ctx.bmap.lock_ag(agno);
        for j in (0..INODES_PER_CHUNK).step_by(fs.inodes_per_block.max(1) as usize) {
            // Inodes in sparse chunks don't use blocks.
            if is_sparse(ctx, rec, j) {
                continue;
            }
            let agbno = fs.agino_to_agbno(ino + j);
            let state = ag.get(agbno);
            if state == BlockState::Unknown {
                ag.set(agbno, BlockState::Ino);
            } else if state == BlockState::InUseFs && agno == 0 && ctx.is_prealloc_ino(ino + j) {
                ag.set(agbno, BlockState::Ino);
            } else {
                ctx.report.warn(format_args!(
                    "inode chunk claims used block, inobt block - agno {agno}, bno {agbno}, inopb {}",
                    fs.inodes_per_block
                ));
                ag.set(agbno, BlockState::Mult);
                return suspect + 1;
            }
        }
    }

    // Ensure only one authoritative record per chunk.
    if let Some((first, _)) = ctx
        .inventory
        .find_chunk_range(agno, ino, ino + INODES_PER_CHUNK)
    {
        ctx.report.warn(format_args!(
            "inode rec for ino {lino} ({agno}/{ino}) overlaps existing rec (start {agno}/{first})"
        ));
        suspect += 1;

        // Two chunks starting at the same place need no uncertain entry;
        // the existing record already covers these inodes.
        if first == ino {
            return suspect;
        }
    }

    let (suspect, nfree, ninodes) =
        import_single_ino_chunk(ctx, agno, InobtKind::Inobt, rec, suspect);

    if nfree != freecount {
        ctx.report.warn(format_args!(
            "ir_freecount/free mismatch, inode chunk {agno}/{ino}, freecount {freecount} nfree {nfree}"
        ));
    }

    if fs.has_sparse_inodes && ninodes != rec.count(true) {
        ctx.report.warn(format_args!(
            "invalid inode count, inode chunk {agno}/{ino}, count {} ninodes {ninodes}",
            rec.count(true)
        ));
    }

    suspect
}

/// Process one finobt record: cross-check the chunk's blocks and inode
/// states against what the inobt scan already established.
fn scan_single_finobt_chunk(
    ctx: &ScanContext<'_>,
    agno: XfsAgnumber,
    rec: &XfsInobtRec,
    mut suspect: u32,
) -> u32 {
    let fs = ctx.fs;
    let ino = rec.start_ino();
    let off = fs.agino_offset(ino);
    let lino = fs.agino_to_ino(agno, ino);
    let freecount = rec.freecount(fs.has_sparse_inodes);

    if verify_single_ino_chunk_align(ctx, agno, InobtKind::Finobt, rec, &mut suspect) {
        return suspect;
    }

    // Cross-check the state of each inode block against the inobt scan:
    // non-sparse blocks must already be tracked as inode blocks. The
    // finobt is never authoritative for allocation, so it only observes
    // the map and never writes to it.
    if off == 0 && suspect == 0 {
        let ag = ctx.bmap.lock_ag(agno);
        for j in (0..INODES_PER_CHUNK).step_by(fs.inodes_per_block.max(1) as usize) {
            let agbno = fs.agino_to_agbno(ino + j);
            let state = ag.get(agbno);

            // Sparse inodes should not refer to inode blocks.
            if is_sparse(ctx, rec, j) {
                if state == BlockState::Ino {
                    ctx.report.warn(format_args!(
                        "sparse inode chunk claims inode block, finobt block - agno {agno}, bno {agbno}, inopb {}",
                        fs.inodes_per_block
                    ));
                    suspect += 1;
                }
                continue;
            }

            if state == BlockState::Ino {
                continue;
            } else if state == BlockState::Unknown
                || (state == BlockState::InUseFs && agno == 0 && ctx.is_prealloc_ino(ino + j))
            {
                ctx.report.warn(format_args!(
                    "inode chunk claims untracked block, finobt block - agno {agno}, bno {agbno}, inopb {}",
                    fs.inodes_per_block
                ));
                suspect += 1;
            } else {
                ctx.report.warn(format_args!(
                    "inode chunk claims used block, finobt block - agno {agno}, bno {agbno}, inopb {}",
                    fs.inodes_per_block
                ));
                return suspect + 1;
            }
        }
    }

    let nfree;
    let ninodes;
    if let Some((first, _)) = ctx
        .inventory
        .find_chunk_range(agno, ino, ino + INODES_PER_CHUNK)
    {
        if suspect > 0 {
            return suspect;
        }

        if first != ino {
            ctx.report.warn(format_args!(
                "finobt rec for ino {lino} ({agno}/{ino}) does not match existing rec ({agno}/{first})"
            ));
            return suspect + 1;
        }

        let Some(auth) = ctx.inventory.chunk_at(agno, first) else {
            return suspect + 1;
        };

        // Inode allocation state should be consistent between the two
        // trees.
        let before = suspect;
        let mut free = 0;
        let mut total = 0;
        for j in 0..INODES_PER_CHUNK {
            let isfree = rec.is_free(j);
            let issparse = is_sparse(ctx, rec, j);

            if !issparse {
                total += 1;
            }
            if isfree && !issparse {
                free += 1;
            }

            if suspect == 0 && isfree != auth.is_free(j) {
                suspect += 1;
            }
            if suspect == 0 && issparse != auth.is_sparse(j) {
                suspect += 1;
            }
        }
        if suspect > before {
            ctx.report.warn(format_args!(
                "finobt rec for ino {lino} ({agno}/{ino}) disagrees with existing rec"
            ));
        }
        nfree = free;
        ninodes = total;
    } else {
        // The finobt knows a chunk the inobt scan never found. Import it;
        // if this tree is healthy these inodes supersede any uncertain
        // entries the inobt scan may have filed.
        ctx.report.warn(format_args!(
            "undiscovered finobt record, ino {lino} ({agno}/{ino})"
        ));
        let (s, free, total) = import_single_ino_chunk(ctx, agno, InobtKind::Finobt, rec, suspect);
        suspect = s;
        nfree = free;
        ninodes = total;
    }

    // Freecount inconsistencies are not suspect on their own; the
    // individual inode states were already verified above.
    if nfree != freecount {
        ctx.report.warn(format_args!(
            "finobt ir_freecount/free mismatch, inode chunk {agno}/{ino}, freecount {freecount} nfree {nfree}"
        ));
    }
    if nfree == 0 {
        ctx.report.warn(format_args!(
            "finobt record with no free inodes, inode chunk {agno}/{ino}"
        ));
    }
    if fs.has_sparse_inodes && ninodes != rec.count(true) {
        ctx.report.warn(format_args!(
            "invalid inode count, inode chunk {agno}/{ino}, count {} ninodes {ninodes}",
            rec.count(true)
        ));
    }

    suspect
}

/// Walk one inode btree node, rescuing what can be rescued. Chunks from
/// suspect subtrees land in the uncertain list so a later phase can judge
/// them against the on-disk inodes themselves.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scan_inobt(
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
    let is_inobt = magic == XFS_IBT_MAGIC || magic == XFS_IBT_CRC_MAGIC;

    let hdr = match parse_short_hdr(buf, fs.is_v5()) {
        Ok(hdr) => hdr,
        Err(_) => {
            ctx.report
                .warn(format_args!("truncated inobt block {agno}/{bno}"));
            agcnts.bad_ino_btree = true;
            return;
        }
    };

    let mut hdr_errors = 0u32;
    if hdr.magic != magic {
        ctx.report.warn(format_args!(
            "bad magic # {:#x} in inobt block {agno}/{bno}",
            hdr.magic
        ));
        hdr_errors += 1;
        agcnts.bad_ino_btree = true;
        if suspect > 0 {
            return;
        }
    }
    if hdr.level != level {
        ctx.report.warn(format_args!(
            "expected level {level} got {} in inobt block {agno}/{bno}",
            hdr.level
        ));
        hdr_errors += 1;
        agcnts.bad_ino_btree = true;
        if suspect > 0 {
            return;
        }
    }

    // Tree blocks multiply claimed are conflicts, but unknown or free
    // states are fine: freespace trees legitimately cover them.
    {
        let mut ag = ctx.bmap.lock_ag(agno);
        let state = ag.get(bno);
        match state {
            BlockState::Unknown | BlockState::Free1 | BlockState::Free => {
                ag.set(bno, BlockState::FsMap);
            }
            _ => {
                ag.set(bno, BlockState::Mult);
                ctx.report.warn(format_args!(
                    "inode btree block claimed (state {state:?}), agno {agno}, bno {bno}, suspect {suspect}"
                ));
            }
        }
    }

    let limits = &fs.inobt_limits;
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
            agcnts.bad_ino_btree = true;
            ctx.report.warn(format_args!(
                "dubious inode btree block header {agno}/{bno}"
            ));
            suspect += 1;
        }

        let recs = match rec_slice::<XfsInobtRec>(buf, hdr_size, numrecs as usize) {
            Ok(recs) => recs,
            Err(_) => {
                ctx.report.warn(format_args!(
                    "truncated records in inobt block {agno}/{bno}"
                ));
                agcnts.bad_ino_btree = true;
                return;
            }
        };

        for rec in recs {
            let freecount = rec.freecount(fs.has_sparse_inodes);
            if is_inobt {
                agcnts.agi_count += rec.count(fs.has_sparse_inodes);
                agcnts.agi_freecount += freecount;
                agcnts.ifreecount += freecount as u64;
                suspect = scan_single_ino_chunk(ctx, agno, rec, suspect);
            } else {
                // The finobt only tracks chunks with free inodes, so only
                // the free count is expected to be consistent with the AGI.
                agcnts.fibt_freecount += freecount;
                suspect = scan_single_finobt_chunk(ctx, agno, rec, suspect);
            }
        }

        if suspect > 0 {
            agcnts.bad_ino_btree = true;
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
    if suspect > 0 && hdr_errors == 0 {
        suspect = 0;
    }
    if hdr_errors > 0 {
        agcnts.bad_ino_btree = true;
        if suspect > 0 {
            return;
        }
        suspect += 1;
    }

    let ptr_offset = hdr_size + limits.node_max as usize * std::mem::size_of::<XfsInobtKey>();
    let ptrs = match rec_slice::<U32>(buf, ptr_offset, numrecs as usize) {
        Ok(ptrs) => ptrs,
        Err(_) => {
            ctx.report.warn(format_args!(
                "truncated pointers in inobt block {agno}/{bno}"
            ));
            agcnts.bad_ino_btree = true;
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
                SbtreeVisitor::Ino,
                false,
                magic,
                agcnts,
            );
        }
    }
}
