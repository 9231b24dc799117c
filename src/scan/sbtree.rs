//! Walker for AG-local btrees with 32-bit block pointers (the freespace
//! pair and the inode pair).
//!
//! The walker loads exactly one node per call and hands it to the visitor;
//! descent is visitor-driven, because each visitor has its own policy for
//! whether a damaged node is still worth descending into.

use crate::io::buffers::{BufVerifyError, XFS_ALLOCBT_BUF_OPS, XFS_INOBT_BUF_OPS};
use crate::scan::allocbt::scan_allocbt;
use crate::scan::inobt::scan_inobt;
use crate::scan::{AgCounts, ScanContext};
use crate::xfs::types::{XfsAgblock, XfsAgnumber};

/// Deepest short-pointer btree the format allows.
pub const MAX_SBTREE_LEVELS: u32 = 8;

/// Which visitor the walker dispatches to. The freespace visitor handles
/// both the by-offset and by-count trees, the inode visitor both the
/// inobt and finobt; the expected magic tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbtreeVisitor {
    Alloc,
    Ino,
}

/// Read the node at `root`, mark it suspect on checksum or verifier
/// trouble, and dispatch. `nlevels` is the stored level count, so the
/// visitor sees `nlevels - 1` as the node's expected level.
#[allow(clippy::too_many_arguments)]
pub fn scan_sbtree(
    ctx: &ScanContext<'_>,
    root: XfsAgblock,
    nlevels: u32,
    agno: XfsAgnumber,
    suspect: u32,
    visitor: SbtreeVisitor,
    isroot: bool,
    magic: u32,
    agcnts: &mut AgCounts,
) {
    if nlevels == 0 || nlevels > MAX_SBTREE_LEVELS {
        ctx.report.warn(format_args!(
            "bad level count {nlevels} for btree block {agno}/{root}"
        ));
        return;
    }

    let ops = match visitor {
        SbtreeVisitor::Alloc => &XFS_ALLOCBT_BUF_OPS,
        SbtreeVisitor::Ino => &XFS_INOBT_BUF_OPS,
    };
    let offset = ctx.fs.ag_block_to_byte(agno, root);
    let buf = match ctx.bufs.read(offset, ctx.fs.block_size as usize, ops) {
        Ok(buf) => buf,
        Err(_) => {
            ctx.report
                .error(format_args!("can't read btree block {agno}/{root}"));
            return;
        }
    };

    let mut suspect = suspect;
    if let Some(err) = buf.error {
        let reason = match err {
            BufVerifyError::BadCrc => "bad CRC",
            BufVerifyError::Corrupt => "corrupt",
        };
        ctx.report.warn(format_args!(
            "btree block {agno}/{root} is suspect, error {reason}"
        ));
        suspect = suspect.max(1);
    }

    match visitor {
        SbtreeVisitor::Alloc => scan_allocbt(
            ctx,
            &buf.data,
            nlevels - 1,
            root,
            agno,
            suspect,
            isroot,
            magic,
            agcnts,
        ),
        SbtreeVisitor::Ino => scan_inobt(
            ctx,
            &buf.data,
            nlevels - 1,
            root,
            agno,
            suspect,
            isroot,
            magic,
            agcnts,
        ),
    }
}
