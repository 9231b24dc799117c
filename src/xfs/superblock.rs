use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::byteorder::little_endian::U32 as U32Le;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::FxfsckError;
use crate::xfs::types::*;

/// XFS superblock magic: "XFSB"
pub const XFS_SB_MAGIC: u32 = 0x58465342;

/// sb_versionnum flag: inode chunks are aligned to sb_inoalignmt.
const XFS_SB_VERSION_ALIGNBIT: u16 = 0x0080;

/// sb_features2 flag: lazy superblock counters (V4).
const XFS_SB_VERSION2_LAZYSBCOUNT: u32 = 0x0000_0002;

/// sb_features_ro_compat: free inode btree present.
const XFS_SB_FEAT_RO_COMPAT_FINOBT: u32 = 1 << 0;

/// sb_features_incompat: sparse inode chunks enabled.
const XFS_SB_FEAT_INCOMPAT_SPINODES: u32 = 1 << 1;
/// sb_features_incompat: metadata UUID differs from sb_uuid.
const XFS_SB_FEAT_INCOMPAT_META_UUID: u32 = 1 << 2;

/// On-disk XFS superblock (first 264 bytes; all the fields the scan needs,
/// including the V5 feature words and checksum).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsDsb {
    pub sb_magicnum: U32,
    pub sb_blocksize: U32,
    pub sb_dblocks: U64,
    pub sb_rblocks: U64,
    pub sb_rextents: U64,
    pub sb_uuid: [u8; 16],
    pub sb_logstart: U64,
    pub sb_rootino: U64,
    pub sb_rbmino: U64,
    pub sb_rsumino: U64,
    pub sb_rextsize: U32,
    pub sb_agblocks: U32,
    pub sb_agcount: U32,
    pub sb_rbmblocks: U32,
    pub sb_logblocks: U32,
    pub sb_versionnum: U16,
    pub sb_sectsize: U16,
    pub sb_inodesize: U16,
    pub sb_inopblock: U16,
    pub sb_fname: [u8; 12],
    pub sb_blocklog: u8,
    pub sb_sectlog: u8,
    pub sb_inodelog: u8,
    pub sb_inopblog: u8,
    pub sb_agblklog: u8,
    pub sb_rextslog: u8,
    pub sb_inprogress: u8,
    pub sb_imax_pct: u8,
    pub sb_icount: U64,
    pub sb_ifree: U64,
    pub sb_fdblocks: U64,
    pub sb_frextents: U64,
    pub sb_uquotino: U64,
    pub sb_gquotino: U64,
    pub sb_qflags: U16,
    pub sb_flags: u8,
    pub sb_shared_vn: u8,
    pub sb_inoalignmt: U32,
    pub sb_unit: U32,
    pub sb_width: U32,
    pub sb_dirblklog: u8,
    pub sb_logsectlog: u8,
    pub sb_logsectsize: U16,
    pub sb_logsunit: U32,
    pub sb_features2: U32,
    pub sb_bad_features2: U32,
    // V5 fields.
    pub sb_features_compat: U32,
    pub sb_features_ro_compat: U32,
    pub sb_features_incompat: U32,
    pub sb_features_log_incompat: U32,
    /// Metadata checksums are the one little-endian field on disk.
    pub sb_crc: U32Le,
    pub sb_spino_align: U32,
    pub sb_pquotino: U64,
    pub sb_lsn: U64,
    pub sb_meta_uuid: [u8; 16],
}

/// Byte offset of `sb_crc` within the sector, for verify/update.
pub const SB_CRC_OFFSET: usize = std::mem::offset_of!(XfsDsb, sb_crc);

/// Which XFS format version we're dealing with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V4,
    V5,
}

/// Record-count bounds for one btree geometry, indexed leaf/node.
#[derive(Debug, Clone, Copy)]
pub struct BtreeLimits {
    pub leaf_max: u32,
    pub leaf_min: u32,
    pub node_max: u32,
    pub node_min: u32,
}

impl BtreeLimits {
    fn compute(block_size: u32, hdr: u32, rec: u32, key: u32, ptr: u32) -> Self {
        let leaf_max = (block_size - hdr) / rec;
        let node_max = (block_size - hdr) / (key + ptr);
        BtreeLimits {
            leaf_max,
            leaf_min: leaf_max / 2,
            node_max,
            node_min: node_max / 2,
        }
    }

}

/// Filesystem context extracted from the primary superblock.
///
/// Geometry, feature predicates, stored global counters, and the btree
/// record-count limits every walker checks against.
#[derive(Debug, Clone)]
pub struct FsContext {
    pub version: FormatVersion,
    pub block_size: u32,
    pub block_log: u8,
    pub sect_size: u16,
    pub dblocks: u64,
    pub ag_count: u32,
    pub ag_blocks: u32,
    pub ag_blk_log: u8,
    pub inode_size: u16,
    pub inodes_per_block: u16,
    pub inop_blog: u8,
    pub root_ino: u64,
    pub uuid: [u8; 16],

    /// Stored global counters, cross-checked after the scan.
    pub icount: u64,
    pub ifree: u64,
    pub fdblocks: u64,

    /// Internal log location (fsblock) and length; logstart 0 = external log.
    pub logstart: u64,
    pub logblocks: u32,

    pub ino_alignment: u32,
    pub has_aligned_inodes: bool,
    pub has_finobt: bool,
    pub has_sparse_inodes: bool,
    pub has_lazy_sb_count: bool,

    pub alloc_limits: BtreeLimits,
    pub inobt_limits: BtreeLimits,
    pub bmbt_limits: BtreeLimits,
}

impl FsContext {
    /// Parse the primary superblock from `buf` and build an FsContext.
    pub fn from_superblock(buf: &[u8]) -> Result<Self, FxfsckError> {
        let sb = XfsDsb::ref_from_prefix(buf)
            .map_err(|_| FxfsckError::Parse("buffer too small for superblock"))?
            .0;

        if sb.sb_magicnum.get() != XFS_SB_MAGIC {
            return Err(FxfsckError::BadMagic("superblock"));
        }

        let versionnum = sb.sb_versionnum.get();
        // V5 superblocks have version number 5 in the low nibble.
        let version = if (versionnum & 0x000f) >= 5 {
            FormatVersion::V5
        } else {
            FormatVersion::V4
        };
        let is_v5 = version == FormatVersion::V5;

        let block_size = sb.sb_blocksize.get();
        if !block_size.is_power_of_two() || block_size < 512 {
            return Err(FxfsckError::Parse("bad superblock block size"));
        }
        if sb.sb_agcount.get() == 0 || sb.sb_agblocks.get() == 0 {
            return Err(FxfsckError::Parse("bad superblock AG geometry"));
        }
        if sb.sb_sectsize.get() < 512 || !sb.sb_sectsize.get().is_power_of_two() {
            return Err(FxfsckError::Parse("bad superblock sector size"));
        }
        if sb.sb_inopblock.get() == 0 {
            return Err(FxfsckError::Parse("bad superblock inodes-per-block"));
        }

        let ro_compat = sb.sb_features_ro_compat.get();
        let incompat = sb.sb_features_incompat.get();

        let has_aligned_inodes =
            (versionnum & XFS_SB_VERSION_ALIGNBIT) != 0 && sb.sb_inoalignmt.get() != 0;
        let has_lazy_sb_count =
            is_v5 || (sb.sb_features2.get() & XFS_SB_VERSION2_LAZYSBCOUNT) != 0;
        let has_finobt = is_v5 && (ro_compat & XFS_SB_FEAT_RO_COMPAT_FINOBT) != 0;
        let has_sparse_inodes = is_v5 && (incompat & XFS_SB_FEAT_INCOMPAT_SPINODES) != 0;

        let uuid = if is_v5 && (incompat & XFS_SB_FEAT_INCOMPAT_META_UUID) != 0 {
            sb.sb_meta_uuid
        } else {
            sb.sb_uuid
        };

        let (short_hdr, long_hdr) = if is_v5 { (56, 72) } else { (16, 24) };

        Ok(FsContext {
            version,
            block_size,
            block_log: sb.sb_blocklog,
            sect_size: sb.sb_sectsize.get(),
            dblocks: sb.sb_dblocks.get(),
            ag_count: sb.sb_agcount.get(),
            ag_blocks: sb.sb_agblocks.get(),
            ag_blk_log: sb.sb_agblklog,
            inode_size: sb.sb_inodesize.get(),
            inodes_per_block: sb.sb_inopblock.get(),
            inop_blog: sb.sb_inopblog,
            root_ino: sb.sb_rootino.get(),
            uuid,
            icount: sb.sb_icount.get(),
            ifree: sb.sb_ifree.get(),
            fdblocks: sb.sb_fdblocks.get(),
            logstart: sb.sb_logstart.get(),
            logblocks: sb.sb_logblocks.get(),
            ino_alignment: sb.sb_inoalignmt.get(),
            has_aligned_inodes,
            has_finobt,
            has_sparse_inodes,
            has_lazy_sb_count,
            alloc_limits: BtreeLimits::compute(block_size, short_hdr, 8, 4, 4),
            inobt_limits: BtreeLimits::compute(block_size, short_hdr, 16, 4, 4),
            bmbt_limits: BtreeLimits::compute(block_size, long_hdr, 16, 8, 8),
        })
    }

    pub fn is_v5(&self) -> bool {
        self.version == FormatVersion::V5
    }

    /// Length of `agno` in blocks; the last AG may be short.
    pub fn ag_length(&self, agno: XfsAgnumber) -> XfsAgblock {
        let start = agno as u64 * self.ag_blocks as u64;
        self.dblocks
            .saturating_sub(start)
            .min(self.ag_blocks as u64) as XfsAgblock
    }

    /// Is `bno` a valid block address within `agno`?
    pub fn verify_agbno(&self, agno: XfsAgnumber, bno: XfsAgblock) -> bool {
        bno < self.ag_length(agno)
    }

    /// Is `agino` a valid AG-relative inode number within `agno`?
    pub fn verify_agino(&self, agno: XfsAgnumber, agino: XfsAgino) -> bool {
        agino != NULL_AGINO && self.verify_agbno(agno, self.agino_to_agbno(agino))
    }

    /// Is `fsbno` a valid absolute filesystem block address?
    pub fn verify_fsbno(&self, fsbno: XfsFsblock) -> bool {
        let (agno, agbno) = self.fsblock_to_ag(fsbno);
        agno < self.ag_count && self.verify_agbno(agno, agbno)
    }

    /// Convert an absolute filesystem block number to (agno, agblock).
    pub fn fsblock_to_ag(&self, fsblock: XfsFsblock) -> (XfsAgnumber, XfsAgblock) {
        let agno = (fsblock >> self.ag_blk_log as u64) as XfsAgnumber;
        let agblock = (fsblock & ((1u64 << self.ag_blk_log as u64) - 1)) as XfsAgblock;
        (agno, agblock)
    }

    /// Inode index of `agino` within its block.
    pub fn agino_offset(&self, agino: XfsAgino) -> u32 {
        agino & ((1u32 << self.inop_blog) - 1)
    }

    /// AG block holding `agino`.
    pub fn agino_to_agbno(&self, agino: XfsAgino) -> XfsAgblock {
        agino >> self.inop_blog
    }

    /// Convert AG-relative inode to absolute inode number.
    pub fn agino_to_ino(&self, agno: XfsAgnumber, agino: XfsAgino) -> XfsIno {
        ((agno as u64) << (self.inop_blog as u64 + self.ag_blk_log as u64)) | (agino as u64)
    }

    /// Byte offset of an AG-relative block within the filesystem.
    pub fn ag_block_to_byte(&self, agno: XfsAgnumber, agblock: XfsAgblock) -> u64 {
        let abs_block = (agno as u64) * (self.ag_blocks as u64) + (agblock as u64);
        abs_block << self.block_log as u64
    }

    /// Byte offset of an absolute filesystem block. Fsblock numbers are
    /// packed (AG number in the upper bits), so unpack before scaling.
    pub fn fsblock_to_byte(&self, fsblock: XfsFsblock) -> u64 {
        let (agno, agblock) = self.fsblock_to_ag(fsblock);
        self.ag_block_to_byte(agno, agblock)
    }

    /// 512-byte disk address of an absolute filesystem block, as stored in
    /// the bb_blkno self-reference of V5 btree blocks.
    pub fn fsblock_to_daddr(&self, fsblock: XfsFsblock) -> u64 {
        self.fsblock_to_byte(fsblock) >> 9
    }

    /// Byte offset of header sector `sector` (0 = SB, 1 = AGF, 2 = AGI,
    /// 3 = AGFL) within `agno`.
    pub fn ag_header_byte(&self, agno: XfsAgnumber, sector: u32) -> u64 {
        self.ag_block_to_byte(agno, 0) + sector as u64 * self.sect_size as u64
    }

    /// Blocks covered by the per-AG header sectors (SB, AGF, AGI, AGFL).
    pub fn ag_header_blocks(&self) -> u32 {
        (4 * self.sect_size as u32).div_ceil(self.block_size)
    }
}
