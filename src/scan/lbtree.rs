//! Walker for file extent btrees with 64-bit block pointers.
//!
//! One node per call, like the short walker, but the visitor carries a
//! per-level cursor for sibling tracking and may dirty the buffer (key
//! correction in modify mode). A bad checksum forces writeback even when
//! the visitor itself is satisfied. A `true` return means bad news: the
//! owning inode must be discarded.

use crate::bmap::{Blkmap, Fork, InoType};
use crate::io::buffers::{BufVerifyError, XFS_BMBT_BUF_OPS};
use crate::scan::ScanContext;
use crate::scan::bmapbt::scan_bmapbt;
use crate::xfs::types::*;

/// Deepest extent btree the format allows; the cursor is sized to it.
pub const XFS_BM_MAXLEVELS: usize = 9;

/// Cursor slot for one tree level: the node the walk last visited there,
/// its recorded siblings, and the key range it covered.
#[derive(Debug, Clone, Copy)]
pub struct CursorLevel {
    pub fsbno: XfsFsblock,
    pub left_fsbno: XfsFsblock,
    pub right_fsbno: XfsFsblock,
    pub first_key: XfsFileoff,
    pub last_key: XfsFileoff,
}

impl Default for CursorLevel {
    fn default() -> Self {
        CursorLevel {
            fsbno: NULL_FSBLOCK,
            left_fsbno: NULL_FSBLOCK,
            right_fsbno: NULL_FSBLOCK,
            first_key: NULL_FILEOFF,
            last_key: NULL_FILEOFF,
        }
    }
}

/// Per-walk cursor, one slot per level. `fsbno == NULL_FSBLOCK` marks
/// "no node seen yet on this level".
#[derive(Debug)]
pub struct BmapCursor {
    pub level: [CursorLevel; XFS_BM_MAXLEVELS],
    pub num_levels: usize,
    pub ino: XfsIno,
    pub fork: Fork,
}

impl BmapCursor {
    pub fn new(ino: XfsIno, fork: Fork, num_levels: usize) -> Self {
        BmapCursor {
            level: [CursorLevel::default(); XFS_BM_MAXLEVELS],
            num_levels,
            ino,
            fork,
        }
    }
}

/// Read the node at `root` and hand it to the extent-tree visitor.
/// Returns true when the subtree condemns the inode.
#[allow(clippy::too_many_arguments)]
pub fn scan_lbtree(
    ctx: &ScanContext<'_>,
    root: XfsFsblock,
    nlevels: u32,
    ino: XfsIno,
    ino_type: InoType,
    fork: Fork,
    tot: &mut u64,
    nex: &mut u64,
    blkmap: Option<&mut Blkmap>,
    cursor: &mut BmapCursor,
    isroot: bool,
    check_dups: bool,
    magic: u32,
) -> bool {
    let (agno, agbno) = ctx.fs.fsblock_to_ag(root);
    if !ctx.fs.verify_fsbno(root) {
        ctx.report
            .warn(format_args!("bad bmap btree ptr {root:#x} in ino {ino}"));
        return true;
    }
    if nlevels == 0 || nlevels as usize > XFS_BM_MAXLEVELS {
        ctx.report.warn(format_args!(
            "bad level count {nlevels} for bmbt block {agno}/{agbno}, inode {ino}"
        ));
        return true;
    }

    let offset = ctx.fs.fsblock_to_byte(root);
    let mut buf = match ctx
        .bufs
        .read(offset, ctx.fs.block_size as usize, &XFS_BMBT_BUF_OPS)
    {
        Ok(buf) => buf,
        Err(_) => {
            ctx.report
                .error(format_args!("can't read btree block {agno}/{agbno}"));
            return true;
        }
    };

    // Only flag bad CRCs here - the visitor decides whether the block is
    // corrupt and whether it got corrected. CRC errors always imply the
    // block needs writing back.
    let badcrc = buf.error == Some(BufVerifyError::BadCrc);
    if badcrc {
        ctx.report.warn(format_args!(
            "btree block {agno}/{agbno} is suspect, error bad CRC"
        ));
    }

    let mut dirty = false;
    let err = scan_bmapbt(
        ctx,
        &mut buf.data,
        nlevels - 1,
        ino,
        ino_type,
        fork,
        root,
        tot,
        nex,
        blkmap,
        cursor,
        isroot,
        check_dups,
        &mut dirty,
        magic,
    );

    debug_assert!(!dirty || !ctx.no_modify);

    if (dirty || badcrc) && !ctx.no_modify {
        if let Err(e) = ctx.bufs.writeback(&mut buf) {
            ctx.report
                .error(format_args!("can't write btree block {agno}/{agbno}: {e}"));
        }
    }
    err
}
