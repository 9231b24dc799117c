use zerocopy::byteorder::big_endian::{U32, U64};
use zerocopy::byteorder::little_endian::U32 as U32Le;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::xfs::superblock::FsContext;
use crate::xfs::types::AGI_UNLINKED_BUCKETS;

/// AGF magic: "XAGF"
pub const XFS_AGF_MAGIC: u32 = 0x58414746;
/// AGI magic: "XAGI"
pub const XFS_AGI_MAGIC: u32 = 0x58414749;
/// AGFL magic: "XAFL" (V5 only; V4 free lists are a bare block-number array)
pub const XFS_AGFL_MAGIC: u32 = 0x5841464c;

pub const XFS_AGF_VERSION: u32 = 1;
pub const XFS_AGI_VERSION: u32 = 1;

/// On-disk AG freespace header (AGF).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsAgf {
    pub agf_magicnum: U32,
    pub agf_versionnum: U32,
    pub agf_seqno: U32,
    pub agf_length: U32,
    pub agf_bno_root: U32,
    pub agf_cnt_root: U32,
    pub agf_spare0: U32,
    pub agf_bno_level: U32,
    pub agf_cnt_level: U32,
    pub agf_spare1: U32,
    pub agf_flfirst: U32,
    pub agf_fllast: U32,
    pub agf_flcount: U32,
    pub agf_freeblks: U32,
    pub agf_longest: U32,
    pub agf_btreeblks: U32,
    // V5 fields.
    pub agf_uuid: [u8; 16],
    pub agf_spare64: [U64; 16],
    pub agf_lsn: U64,
    pub agf_crc: U32Le,
    pub agf_spare2: U32,
}

pub const AGF_CRC_OFFSET: usize = std::mem::offset_of!(XfsAgf, agf_crc);

/// On-disk AG inode header (AGI).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsAgi {
    pub agi_magicnum: U32,
    pub agi_versionnum: U32,
    pub agi_seqno: U32,
    pub agi_length: U32,
    pub agi_count: U32,
    pub agi_root: U32,
    pub agi_level: U32,
    pub agi_freecount: U32,
    pub agi_newino: U32,
    pub agi_dirino: U32,
    pub agi_unlinked: [U32; AGI_UNLINKED_BUCKETS],
    // V5 fields.
    pub agi_uuid: [u8; 16],
    pub agi_crc: U32Le,
    pub agi_pad32: U32,
    pub agi_lsn: U64,
    pub agi_free_root: U32,
    pub agi_free_level: U32,
}

pub const AGI_CRC_OFFSET: usize = std::mem::offset_of!(XfsAgi, agi_crc);

/// V5 AGFL header; the block-number array follows it. V4 free lists start
/// at byte 0 of the sector.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct XfsAgflHdr {
    pub agfl_magicnum: U32,
    pub agfl_seqno: U32,
    pub agfl_uuid: [u8; 16],
    pub agfl_lsn: U64,
    pub agfl_crc: U32Le,
}

pub const AGFL_CRC_OFFSET: usize = std::mem::offset_of!(XfsAgflHdr, agfl_crc);

/// Byte offset of the free-list array within the AGFL sector.
pub fn agfl_list_offset(fs: &FsContext) -> usize {
    if fs.is_v5() {
        std::mem::size_of::<XfsAgflHdr>()
    } else {
        0
    }
}

/// Number of block-number slots in the AGFL ring.
pub fn agfl_size(fs: &FsContext) -> u32 {
    ((fs.sect_size as usize - agfl_list_offset(fs)) / 4) as u32
}

