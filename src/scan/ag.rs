//! Per-AG scan: the header triple, the free list, and the four AG-local
//! btrees, followed by the header-counter cross-checks.

use bitflags::bitflags;
use zerocopy::FromBytes;

use crate::blockmap::BlockState;
use crate::error::FxfsckError;
use crate::io::buffers::{
    BlockBuf, BufVerifyError, XFS_AGF_BUF_OPS, XFS_AGFL_BUF_OPS, XFS_AGI_BUF_OPS, XFS_SB_BUF_OPS,
};
use crate::scan::sbtree::{MAX_SBTREE_LEVELS, SbtreeVisitor, scan_sbtree};
use crate::scan::{AgCounts, ScanContext};
use crate::xfs::agheader::{
    XFS_AGF_MAGIC, XFS_AGF_VERSION, XFS_AGI_MAGIC, XFS_AGI_VERSION, XfsAgf, XfsAgi, agfl_list_offset,
    agfl_size,
};
use crate::xfs::btree::{
    XFS_ABTB_CRC_MAGIC, XFS_ABTB_MAGIC, XFS_ABTC_CRC_MAGIC, XFS_ABTC_MAGIC, XFS_FIBT_CRC_MAGIC,
    XFS_FIBT_MAGIC, XFS_IBT_CRC_MAGIC, XFS_IBT_MAGIC,
};
use crate::xfs::superblock::{XFS_SB_MAGIC, XfsDsb};
use crate::xfs::types::{AGI_UNLINKED_BUCKETS, NULL_AGINO, XfsAgnumber};

use zerocopy::byteorder::big_endian::U32;

bitflags! {
    /// Which of the three AG headers the verify pass wants reset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AgHeaderStatus: u32 {
        /// Secondary superblock only has a checksum problem.
        const SB_SEC = 1 << 0;
        const SB = 1 << 1;
        const AGF = 1 << 2;
        const AGI = 1 << 3;
    }
}

/// Compact header verify pass: flag each of the three headers that could
/// not be taken at face value. Resets only happen in modify mode.
fn verify_agheader(
    ctx: &ScanContext<'_>,
    agno: XfsAgnumber,
    sbbuf: &BlockBuf,
    agfbuf: &BlockBuf,
    agf: &XfsAgf,
    agibuf: &BlockBuf,
    agi: &XfsAgi,
) -> AgHeaderStatus {
    let fs = ctx.fs;
    let mut status = AgHeaderStatus::empty();

    match XfsDsb::read_from_prefix(&sbbuf.data) {
        Ok((sb, _)) => {
            if sb.sb_magicnum.get() != XFS_SB_MAGIC
                || sb.sb_blocksize.get() != fs.block_size
                || sb.sb_agcount.get() != fs.ag_count
                || sb.sb_agblocks.get() != fs.ag_blocks
            {
                status |= AgHeaderStatus::SB;
            }
        }
        Err(_) => status |= AgHeaderStatus::SB,
    }
    match sbbuf.error {
        Some(BufVerifyError::Corrupt) => status |= AgHeaderStatus::SB,
        Some(BufVerifyError::BadCrc) => status |= AgHeaderStatus::SB_SEC,
        None => {}
    }

    if agf.agf_magicnum.get() != XFS_AGF_MAGIC
        || agf.agf_versionnum.get() != XFS_AGF_VERSION
        || agf.agf_seqno.get() != agno
        || agf.agf_length.get() != fs.ag_length(agno)
        || agf.agf_bno_level.get() == 0
        || agf.agf_bno_level.get() > MAX_SBTREE_LEVELS
        || agf.agf_cnt_level.get() == 0
        || agf.agf_cnt_level.get() > MAX_SBTREE_LEVELS
        || agfbuf.error == Some(BufVerifyError::Corrupt)
    {
        status |= AgHeaderStatus::AGF;
    }

    if agi.agi_magicnum.get() != XFS_AGI_MAGIC
        || agi.agi_versionnum.get() != XFS_AGI_VERSION
        || agi.agi_seqno.get() != agno
        || agi.agi_length.get() != fs.ag_length(agno)
        || agi.agi_level.get() == 0
        || agi.agi_level.get() > MAX_SBTREE_LEVELS
        || agibuf.error == Some(BufVerifyError::Corrupt)
    {
        status |= AgHeaderStatus::AGI;
    }

    status
}

/// Walk the AGFL ring: every listed block becomes Free, the list length
/// is checked against the stored flcount, and the blocks count toward the
/// free-block total.
fn scan_freelist(
    ctx: &ScanContext<'_>,
    agno: XfsAgnumber,
    agf: &XfsAgf,
    agcnts: &mut AgCounts,
) -> Result<(), FxfsckError> {
    let fs = ctx.fs;

    // The AGFL sector's block holds filesystem metadata, unless it shares
    // a block with the other headers (which are already reserved).
    let block_of = |sector: u32| (sector as u64 * fs.sect_size as u64 >> fs.block_log) as u32;
    let agfl_block = block_of(3);
    if agfl_block != block_of(0) && agfl_block != block_of(1) && agfl_block != block_of(2) {
        ctx.bmap.lock_ag(agno).set(agfl_block, BlockState::FsMap);
    }

    if agf.agf_flcount.get() == 0 {
        return Ok(());
    }

    let agflbuf = match ctx.bufs.read(
        fs.ag_header_byte(agno, 3),
        fs.sect_size as usize,
        &XFS_AGFL_BUF_OPS,
    ) {
        Ok(buf) => buf,
        Err(_) => {
            ctx.report
                .error(format_args!("can't read agfl block for ag {agno}"));
            return Err(FxfsckError::AgHeader { agno });
        }
    };
    if agflbuf.error == Some(BufVerifyError::BadCrc) {
        ctx.report
            .warn(format_args!("agfl has bad CRC for ag {agno}"));
    }

    let size = agfl_size(fs);
    let flfirst = agf.agf_flfirst.get();
    let fllast = agf.agf_fllast.get();
    if flfirst >= size || fllast >= size {
        ctx.report.warn(format_args!(
            "agf {agno} freelist blocks bad, skipping freelist scan"
        ));
        return Ok(());
    }

    let list = crate::xfs::btree::rec_slice::<U32>(
        &agflbuf.data,
        agfl_list_offset(fs),
        size as usize,
    )?;

    let mut ag = ctx.bmap.lock_ag(agno);
    let mut count = 0u32;
    let mut i = flfirst;
    loop {
        let bno = list[i as usize].get();
        if fs.verify_agbno(agno, bno) {
            ag.set(bno, BlockState::Free);
        } else {
            ctx.report
                .warn(format_args!("bad agbno {bno} in agfl, agno {agno}"));
        }
        count += 1;
        if i == fllast {
            break;
        }
        i += 1;
        if i == size {
            i = 0;
        }
    }
    drop(ag);

    if count != agf.agf_flcount.get() {
        ctx.report.warn(format_args!(
            "freeblk count {count} != flcount {} in ag {agno}",
            agf.agf_flcount.get()
        ));
    }
    agcnts.fdblocks += count as u64;
    Ok(())
}

/// Scan both freespace trees, then compare the AGF counters with the
/// tallies.
fn validate_agf(ctx: &ScanContext<'_>, agf: &XfsAgf, agno: XfsAgnumber, agcnts: &mut AgCounts) {
    let fs = ctx.fs;

    let bno = agf.agf_bno_root.get();
    if bno != 0 && fs.verify_agbno(agno, bno) {
        let magic = if fs.is_v5() {
            XFS_ABTB_CRC_MAGIC
        } else {
            XFS_ABTB_MAGIC
        };
        scan_sbtree(
            ctx,
            bno,
            agf.agf_bno_level.get(),
            agno,
            0,
            SbtreeVisitor::Alloc,
            true,
            magic,
            agcnts,
        );
    } else {
        ctx.report
            .warn(format_args!("bad agbno {bno} for btbno root, agno {agno}"));
    }

    let bno = agf.agf_cnt_root.get();
    if bno != 0 && fs.verify_agbno(agno, bno) {
        let magic = if fs.is_v5() {
            XFS_ABTC_CRC_MAGIC
        } else {
            XFS_ABTC_MAGIC
        };
        scan_sbtree(
            ctx,
            bno,
            agf.agf_cnt_level.get(),
            agno,
            0,
            SbtreeVisitor::Alloc,
            true,
            magic,
            agcnts,
        );
    } else {
        ctx.report
            .warn(format_args!("bad agbno {bno} for btbcnt root, agno {agno}"));
    }

    if agf.agf_freeblks.get() != agcnts.agf_freeblks {
        ctx.report.warn(format_args!(
            "agf_freeblks {}, counted {} in ag {agno}",
            agf.agf_freeblks.get(),
            agcnts.agf_freeblks
        ));
    }
    if agf.agf_longest.get() != agcnts.agf_longest {
        ctx.report.warn(format_args!(
            "agf_longest {}, counted {} in ag {agno}",
            agf.agf_longest.get(),
            agcnts.agf_longest
        ));
    }
    if fs.has_lazy_sb_count && agf.agf_btreeblks.get() as u64 != agcnts.agf_btreeblks {
        ctx.report.warn(format_args!(
            "agf_btreeblks {}, counted {} in ag {agno}",
            agf.agf_btreeblks.get(),
            agcnts.agf_btreeblks
        ));
    }
}

/// Scan the inode trees, then compare the AGI counters with the tallies.
fn validate_agi(ctx: &ScanContext<'_>, agi: &XfsAgi, agno: XfsAgnumber, agcnts: &mut AgCounts) {
    let fs = ctx.fs;

    let bno = agi.agi_root.get();
    if bno != 0 && fs.verify_agbno(agno, bno) {
        let magic = if fs.is_v5() {
            XFS_IBT_CRC_MAGIC
        } else {
            XFS_IBT_MAGIC
        };
        scan_sbtree(
            ctx,
            bno,
            agi.agi_level.get(),
            agno,
            0,
            SbtreeVisitor::Ino,
            true,
            magic,
            agcnts,
        );
    } else {
        ctx.report
            .warn(format_args!("bad agbno {bno} for inobt root, agno {agno}"));
    }

    if fs.has_finobt {
        let bno = agi.agi_free_root.get();
        if bno != 0 && fs.verify_agbno(agno, bno) {
            let magic = if fs.is_v5() {
                XFS_FIBT_CRC_MAGIC
            } else {
                XFS_FIBT_MAGIC
            };
            scan_sbtree(
                ctx,
                bno,
                agi.agi_free_level.get(),
                agno,
                0,
                SbtreeVisitor::Ino,
                true,
                magic,
                agcnts,
            );
        } else {
            ctx.report
                .warn(format_args!("bad agbno {bno} for finobt root, agno {agno}"));
        }
    }

    if agi.agi_count.get() != agcnts.agi_count {
        ctx.report.warn(format_args!(
            "agi_count {}, counted {} in ag {agno}",
            agi.agi_count.get(),
            agcnts.agi_count
        ));
    }
    if agi.agi_freecount.get() != agcnts.agi_freecount {
        ctx.report.warn(format_args!(
            "agi_freecount {}, counted {} in ag {agno}",
            agi.agi_freecount.get(),
            agcnts.agi_freecount
        ));
    }
    if fs.has_finobt && agi.agi_freecount.get() != agcnts.fibt_freecount {
        ctx.report.warn(format_args!(
            "agi_freecount {}, counted {} in ag {agno} finobt",
            agi.agi_freecount.get(),
            agcnts.fibt_freecount
        ));
    }

    for (i, bucket) in agi.agi_unlinked.iter().enumerate().take(AGI_UNLINKED_BUCKETS) {
        let agino = bucket.get();
        if agino != NULL_AGINO {
            ctx.report.warn(format_args!(
                "agi unlinked bucket {i} is {agino} in ag {agno} (inode={})",
                fs.agino_to_ino(agno, agino)
            ));
        }
    }
}

/// Scan one AG for obvious corruption.
///
/// The visit order inside an AG is fixed: AGF, AGFL, freespace-by-offset,
/// freespace-by-count, inode allocation tree, free inode tree. The
/// Free1 -> Free promotion and the finobt cross-checks both depend on it.
pub fn scan_ag(
    ctx: &ScanContext<'_>,
    agno: XfsAgnumber,
    agcnts: &mut AgCounts,
) -> Result<(), FxfsckError> {
    let fs = ctx.fs;
    let sect = fs.sect_size as usize;

    let sbbuf = ctx
        .bufs
        .read(fs.ag_header_byte(agno, 0), sect, &XFS_SB_BUF_OPS)
        .map_err(|_| FxfsckError::AgHeader { agno })?;
    let mut agfbuf = ctx
        .bufs
        .read(fs.ag_header_byte(agno, 1), sect, &XFS_AGF_BUF_OPS)
        .map_err(|_| FxfsckError::AgHeader { agno })?;
    let mut agibuf = ctx
        .bufs
        .read(fs.ag_header_byte(agno, 2), sect, &XFS_AGI_BUF_OPS)
        .map_err(|_| FxfsckError::AgHeader { agno })?;

    let agf = XfsAgf::read_from_prefix(&agfbuf.data)
        .map_err(|_| FxfsckError::AgHeader { agno })?
        .0;
    let agi = XfsAgi::read_from_prefix(&agibuf.data)
        .map_err(|_| FxfsckError::AgHeader { agno })?
        .0;

    // Fix up bad AG headers - or in no-modify mode, refuse to guess.
    let mut status = verify_agheader(ctx, agno, &sbbuf, &agfbuf, &agf, &agibuf, &agi);
    let mut sb_dirty = false;
    let mut agf_dirty = false;
    let mut agi_dirty = false;

    if status.contains(AgHeaderStatus::SB_SEC) {
        // A checksum-only problem on a secondary superblock is always
        // correctable; clear the bit so it doesn't force an AG skip.
        if !ctx.no_modify {
            sb_dirty = true;
        }
        status.remove(AgHeaderStatus::SB_SEC);
    }
    if status.contains(AgHeaderStatus::SB) {
        if !ctx.no_modify {
            ctx.report.warn(format_args!("reset bad sb for ag {agno}"));
            sb_dirty = true;
        } else {
            ctx.report
                .warn(format_args!("would reset bad sb for ag {agno}"));
        }
    }
    if status.contains(AgHeaderStatus::AGF) {
        if !ctx.no_modify {
            ctx.report.warn(format_args!("reset bad agf for ag {agno}"));
            agf_dirty = true;
        } else {
            ctx.report
                .warn(format_args!("would reset bad agf for ag {agno}"));
        }
    }
    if status.contains(AgHeaderStatus::AGI) {
        if !ctx.no_modify {
            ctx.report.warn(format_args!("reset bad agi for ag {agno}"));
            agi_dirty = true;
        } else {
            ctx.report
                .warn(format_args!("would reset bad agi for ag {agno}"));
        }
    }

    if !status.is_empty() && ctx.no_modify {
        ctx.report.warn(format_args!(
            "bad uncorrected agheader {agno}, skipping ag..."
        ));
        return Ok(());
    }

    scan_freelist(ctx, agno, &agf, agcnts)?;

    validate_agf(ctx, &agf, agno, agcnts);
    validate_agi(ctx, &agi, agno, agcnts);

    debug_assert!(!agi_dirty || !ctx.no_modify);
    debug_assert!(!agf_dirty || !ctx.no_modify);
    debug_assert!(!sb_dirty || !ctx.no_modify);

    // Bad checksums are correctable right away; structural problems the
    // verifier flagged have to wait for the rebuild phases.
    if !ctx.no_modify {
        agi_dirty |= agibuf.error == Some(BufVerifyError::BadCrc);
        agf_dirty |= agfbuf.error == Some(BufVerifyError::BadCrc);
    }

    if agi_dirty && !ctx.no_modify {
        if let Err(e) = ctx.bufs.writeback(&mut agibuf) {
            ctx.report
                .error(format_args!("can't write agi for ag {agno}: {e}"));
        }
    }
    if agf_dirty && !ctx.no_modify {
        if let Err(e) = ctx.bufs.writeback(&mut agfbuf) {
            ctx.report
                .error(format_args!("can't write agf for ag {agno}: {e}"));
        }
    }
    if sb_dirty && !ctx.no_modify {
        let mut sbbuf = sbbuf;
        if let Err(e) = ctx.bufs.writeback(&mut sbbuf) {
            ctx.report
                .error(format_args!("can't write sb for ag {agno}: {e}"));
        }
    }

    Ok(())
}
