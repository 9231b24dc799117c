//! Synthetic filesystem images for the scan tests.
//!
//! Images are built with the same on-disk structs the crate parses, so
//! layouts and checksums round-trip exactly. The default geometry is one
//! 64-block AG with 4K blocks, 512-byte sectors and inodes, and the tree
//! roots at blocks 1..=4.

#![allow(dead_code)]

use zerocopy::byteorder::big_endian::{U16, U32, U64};
use zerocopy::{FromZeros, IntoBytes};

use fxfsck::blockmap::BlockMap;
use fxfsck::bmap::DupExtents;
use fxfsck::incore::Inventory;
use fxfsck::io::buffers::update_crc;
use fxfsck::io::device::MemDev;
use fxfsck::report::Reporter;
use fxfsck::scan::ScanContext;
use fxfsck::xfs::agheader::{
    AGF_CRC_OFFSET, AGFL_CRC_OFFSET, AGI_CRC_OFFSET, XFS_AGF_MAGIC, XFS_AGFL_MAGIC, XFS_AGI_MAGIC,
    XfsAgf, XfsAgflHdr, XfsAgi,
};
use fxfsck::xfs::btree::{
    LONG_CRC_OFFSET, SHORT_CRC_OFFSET, XFS_ABTB_CRC_MAGIC, XFS_ABTB_MAGIC, XFS_ABTC_CRC_MAGIC,
    XFS_ABTC_MAGIC, XFS_BMAP_CRC_MAGIC, XFS_BMAP_MAGIC, XFS_FIBT_CRC_MAGIC, XFS_FIBT_MAGIC,
    XFS_IBT_CRC_MAGIC, XFS_IBT_MAGIC, BmbtIrec, XfsAllocRec, XfsBmbtKey, XfsBmbtRec,
    XfsBtreeLongV4, XfsBtreeLongV5, XfsBtreeShortV4, XfsBtreeShortV5, XfsInobtRec, long_hdr_size,
    short_hdr_size,
};
use fxfsck::xfs::superblock::{FsContext, SB_CRC_OFFSET, XFS_SB_MAGIC, XfsDsb};
use fxfsck::xfs::types::{NULL_AGBLOCK, NULL_AGINO};

pub const BLOCK_SIZE: usize = 4096;
pub const SECT_SIZE: usize = 512;
pub const AG_BLOCKS: u32 = 64;
pub const UUID: [u8; 16] = [0x42; 16];

pub const BNO_ROOT: u32 = 1;
pub const CNT_ROOT: u32 = 2;
pub const INO_ROOT: u32 = 3;
pub const FINO_ROOT: u32 = 4;

/// One inobt/finobt record in the image.
#[derive(Clone)]
pub struct ChunkSpec {
    pub startino: u32,
    /// Free-inode bitmap.
    pub free: u64,
    pub holemask: u16,
    pub count_override: Option<u8>,
    pub freecount_override: Option<u32>,
}

impl ChunkSpec {
    pub fn new(startino: u32, free: u64) -> Self {
        ChunkSpec {
            startino,
            free,
            holemask: 0,
            count_override: None,
            freecount_override: None,
        }
    }

    /// Per-inode sparse bits expanded from the holemask.
    pub fn sparse_bits(&self) -> u64 {
        let mut bits = 0u64;
        for j in 0..64 {
            if self.holemask & (1u16 << (j / 4)) != 0 {
                bits |= 1u64 << j;
            }
        }
        bits
    }

    pub fn nfree(&self) -> u32 {
        (self.free & !self.sparse_bits()).count_ones()
    }

    pub fn ninodes(&self) -> u32 {
        64 - self.sparse_bits().count_ones()
    }

    fn encode(&self, sparse_fs: bool) -> XfsInobtRec {
        let mut rec = XfsInobtRec::new_zeroed();
        rec.ir_startino = U32::new(self.startino);
        rec.ir_free = U64::new(self.free);
        if sparse_fs {
            rec.ir_holemask = U16::new(self.holemask);
            rec.ir_count = self.count_override.unwrap_or(self.ninodes() as u8);
            rec.ir_freecount = self.freecount_override.unwrap_or_else(|| self.nfree()) as u8;
        } else {
            let fc = self.freecount_override.unwrap_or_else(|| self.nfree());
            rec.ir_holemask = U16::new((fc >> 16) as u16);
            rec.ir_count = (fc >> 8) as u8;
            rec.ir_freecount = fc as u8;
        }
        rec
    }
}

/// Contents of one AG.
#[derive(Clone, Default)]
pub struct AgSpec {
    pub bno_extents: Vec<(u32, u32)>,
    /// By-count records; `None` mirrors the by-offset records.
    pub cnt_extents: Option<Vec<(u32, u32)>>,
    pub agfl: Vec<u32>,
    pub inobt: Vec<ChunkSpec>,
    pub finobt: Vec<ChunkSpec>,
    pub flcount_override: Option<u32>,
    pub freeblks_override: Option<u32>,
    pub longest_override: Option<u32>,
    pub agi_count_override: Option<u32>,
    pub agi_freecount_override: Option<u32>,
}

impl AgSpec {
    fn cnt_extents(&self) -> Vec<(u32, u32)> {
        let mut ext = self
            .cnt_extents
            .clone()
            .unwrap_or_else(|| self.bno_extents.clone());
        ext.sort_by_key(|&(start, len)| (len, start));
        ext
    }

    fn freeblks(&self) -> u32 {
        self.cnt_extents().iter().map(|&(_, len)| len).sum()
    }

    fn longest(&self) -> u32 {
        self.cnt_extents()
            .iter()
            .map(|&(_, len)| len)
            .max()
            .unwrap_or(0)
    }
}

/// Whole-image description.
#[derive(Clone)]
pub struct ImageSpec {
    pub v5: bool,
    pub finobt: bool,
    pub sparse: bool,
    /// Blocks per AG; must be a power of two.
    pub ag_blocks: u32,
    pub ags: Vec<AgSpec>,
    pub fdblocks_override: Option<u64>,
    pub icount_override: Option<u64>,
    pub ifree_override: Option<u64>,
}

impl ImageSpec {
    pub fn new(ags: Vec<AgSpec>) -> Self {
        ImageSpec {
            v5: true,
            finobt: true,
            sparse: false,
            ag_blocks: AG_BLOCKS,
            ags,
            fdblocks_override: None,
            icount_override: None,
            ifree_override: None,
        }
    }
}

/// The clean single-AG image: 4 free extents, 3 inode chunks, 2 AGFL
/// blocks. Chunks cover blocks 8..32, free extents and AGFL 25 + 2
/// blocks; everything cross-sums, so a scan emits no warnings.
pub fn clean_spec() -> ImageSpec {
    let chunk1 = ChunkSpec::new(64, !0u64 << 4);
    let chunk2 = ChunkSpec::new(128, 0);
    let chunk3 = ChunkSpec::new(192, !0u64);
    ImageSpec::new(vec![AgSpec {
        bno_extents: vec![(32, 8), (41, 7), (50, 6), (60, 4)],
        agfl: vec![5, 6],
        inobt: vec![chunk1.clone(), chunk2, chunk3.clone()],
        finobt: vec![chunk1, chunk3],
        ..Default::default()
    }])
}

fn chunk_count(spec: &ImageSpec, chunk: &ChunkSpec) -> u32 {
    if spec.sparse {
        chunk.count_override.map(u32::from).unwrap_or_else(|| chunk.ninodes())
    } else {
        64
    }
}

pub fn build_image(spec: &ImageSpec) -> Vec<u8> {
    assert!(spec.ag_blocks.is_power_of_two());
    let ag_count = spec.ags.len() as u32;
    let mut img = vec![0u8; ag_count as usize * spec.ag_blocks as usize * BLOCK_SIZE];

    let mut icount = 0u64;
    let mut ifree = 0u64;
    let mut fdblocks = 0u64;
    for ag in &spec.ags {
        fdblocks += ag.freeblks() as u64 + ag.agfl.len() as u64;
        for chunk in &ag.inobt {
            icount += chunk_count(spec, chunk) as u64;
            ifree += chunk.freecount_override.unwrap_or_else(|| chunk.nfree()) as u64;
        }
    }
    icount = spec.icount_override.unwrap_or(icount);
    ifree = spec.ifree_override.unwrap_or(ifree);
    fdblocks = spec.fdblocks_override.unwrap_or(fdblocks);

    for (agno, ag) in spec.ags.iter().enumerate() {
        write_ag(&mut img, spec, agno as u32, ag, ag_count, icount, ifree, fdblocks);
    }
    img
}

#[allow(clippy::too_many_arguments)]
fn write_ag(
    img: &mut [u8],
    spec: &ImageSpec,
    agno: u32,
    ag: &AgSpec,
    ag_count: u32,
    icount: u64,
    ifree: u64,
    fdblocks: u64,
) {
    let ag_off = agno as usize * spec.ag_blocks as usize * BLOCK_SIZE;

    // ---- Superblock copy ----
    let mut sb = XfsDsb::new_zeroed();
    sb.sb_magicnum = U32::new(XFS_SB_MAGIC);
    sb.sb_blocksize = U32::new(BLOCK_SIZE as u32);
    sb.sb_dblocks = U64::new(ag_count as u64 * spec.ag_blocks as u64);
    sb.sb_uuid = UUID;
    sb.sb_rootino = U64::new(64);
    sb.sb_agblocks = U32::new(spec.ag_blocks);
    sb.sb_agcount = U32::new(ag_count);
    sb.sb_versionnum = U16::new(if spec.v5 { 5 } else { 4 });
    sb.sb_sectsize = U16::new(SECT_SIZE as u16);
    sb.sb_inodesize = U16::new(512);
    sb.sb_inopblock = U16::new(8);
    sb.sb_fname[..4].copy_from_slice(b"test");
    sb.sb_blocklog = 12;
    sb.sb_sectlog = 9;
    sb.sb_inodelog = 9;
    sb.sb_inopblog = 3;
    sb.sb_agblklog = spec.ag_blocks.trailing_zeros() as u8;
    sb.sb_imax_pct = 25;
    sb.sb_icount = U64::new(icount);
    sb.sb_ifree = U64::new(ifree);
    sb.sb_fdblocks = U64::new(fdblocks);
    if !spec.v5 {
        // lazy superblock counters
        sb.sb_features2 = U32::new(0x2);
    }
    if spec.v5 && spec.finobt {
        sb.sb_features_ro_compat = U32::new(0x1);
    }
    if spec.v5 && spec.sparse {
        sb.sb_features_incompat = U32::new(0x2);
    }
    let sector = &mut img[ag_off..ag_off + SECT_SIZE];
    sector[..std::mem::size_of::<XfsDsb>()].copy_from_slice(sb.as_bytes());
    if spec.v5 {
        update_crc(sector, SB_CRC_OFFSET);
    }

    // ---- AGF ----
    let mut agf = XfsAgf::new_zeroed();
    agf.agf_magicnum = U32::new(XFS_AGF_MAGIC);
    agf.agf_versionnum = U32::new(1);
    agf.agf_seqno = U32::new(agno);
    agf.agf_length = U32::new(spec.ag_blocks);
    agf.agf_bno_root = U32::new(BNO_ROOT);
    agf.agf_cnt_root = U32::new(CNT_ROOT);
    agf.agf_bno_level = U32::new(1);
    agf.agf_cnt_level = U32::new(1);
    agf.agf_flfirst = U32::new(0);
    agf.agf_fllast = U32::new(ag.agfl.len().saturating_sub(1) as u32);
    agf.agf_flcount = U32::new(ag.flcount_override.unwrap_or(ag.agfl.len() as u32));
    agf.agf_freeblks = U32::new(ag.freeblks_override.unwrap_or_else(|| ag.freeblks()));
    agf.agf_longest = U32::new(ag.longest_override.unwrap_or_else(|| ag.longest()));
    agf.agf_btreeblks = U32::new(0);
    agf.agf_uuid = UUID;
    let sector = &mut img[ag_off + SECT_SIZE..ag_off + 2 * SECT_SIZE];
    sector[..std::mem::size_of::<XfsAgf>()].copy_from_slice(agf.as_bytes());
    if spec.v5 {
        update_crc(sector, AGF_CRC_OFFSET);
    }

    // ---- AGI ----
    let mut agi = XfsAgi::new_zeroed();
    agi.agi_magicnum = U32::new(XFS_AGI_MAGIC);
    agi.agi_versionnum = U32::new(1);
    agi.agi_seqno = U32::new(agno);
    agi.agi_length = U32::new(spec.ag_blocks);
    let agi_count: u32 = ag.inobt.iter().map(|c| chunk_count(spec, c)).sum();
    let agi_freecount: u32 = ag
        .inobt
        .iter()
        .map(|c| c.freecount_override.unwrap_or_else(|| c.nfree()))
        .sum();
    agi.agi_count = U32::new(ag.agi_count_override.unwrap_or(agi_count));
    agi.agi_root = U32::new(INO_ROOT);
    agi.agi_level = U32::new(1);
    agi.agi_freecount = U32::new(ag.agi_freecount_override.unwrap_or(agi_freecount));
    agi.agi_newino = U32::new(ag.inobt.first().map(|c| c.startino).unwrap_or(NULL_AGINO));
    agi.agi_dirino = U32::new(NULL_AGINO);
    for bucket in agi.agi_unlinked.iter_mut() {
        *bucket = U32::new(NULL_AGINO);
    }
    agi.agi_uuid = UUID;
    agi.agi_free_root = U32::new(FINO_ROOT);
    agi.agi_free_level = U32::new(1);
    let sector = &mut img[ag_off + 2 * SECT_SIZE..ag_off + 3 * SECT_SIZE];
    sector[..std::mem::size_of::<XfsAgi>()].copy_from_slice(agi.as_bytes());
    if spec.v5 {
        update_crc(sector, AGI_CRC_OFFSET);
    }

    // ---- AGFL ----
    let sector = &mut img[ag_off + 3 * SECT_SIZE..ag_off + 4 * SECT_SIZE];
    let list_off = if spec.v5 {
        let mut hdr = XfsAgflHdr::new_zeroed();
        hdr.agfl_magicnum = U32::new(XFS_AGFL_MAGIC);
        hdr.agfl_seqno = U32::new(agno);
        hdr.agfl_uuid = UUID;
        sector[..std::mem::size_of::<XfsAgflHdr>()].copy_from_slice(hdr.as_bytes());
        std::mem::size_of::<XfsAgflHdr>()
    } else {
        0
    };
    let slots = (SECT_SIZE - list_off) / 4;
    for i in 0..slots {
        let bno = ag.agfl.get(i).copied().unwrap_or(NULL_AGBLOCK);
        sector[list_off + i * 4..list_off + i * 4 + 4].copy_from_slice(&bno.to_be_bytes());
    }
    if spec.v5 {
        update_crc(sector, AGFL_CRC_OFFSET);
    }

    // ---- Freespace trees ----
    let mut bno_recs = ag.bno_extents.clone();
    bno_recs.sort_by_key(|&(start, _)| start);
    let recs: Vec<XfsAllocRec> = bno_recs
        .iter()
        .map(|&(start, len)| XfsAllocRec {
            ar_startblock: U32::new(start),
            ar_blockcount: U32::new(len),
        })
        .collect();
    let magic = if spec.v5 { XFS_ABTB_CRC_MAGIC } else { XFS_ABTB_MAGIC };
    write_short_leaf(img, spec, agno, BNO_ROOT, magic, recs.as_bytes(), recs.len() as u16);

    let recs: Vec<XfsAllocRec> = ag
        .cnt_extents()
        .iter()
        .map(|&(start, len)| XfsAllocRec {
            ar_startblock: U32::new(start),
            ar_blockcount: U32::new(len),
        })
        .collect();
    let magic = if spec.v5 { XFS_ABTC_CRC_MAGIC } else { XFS_ABTC_MAGIC };
    write_short_leaf(img, spec, agno, CNT_ROOT, magic, recs.as_bytes(), recs.len() as u16);

    // ---- Inode trees ----
    let mut chunks = ag.inobt.clone();
    chunks.sort_by_key(|c| c.startino);
    let recs: Vec<XfsInobtRec> = chunks.iter().map(|c| c.encode(spec.sparse)).collect();
    let magic = if spec.v5 { XFS_IBT_CRC_MAGIC } else { XFS_IBT_MAGIC };
    write_short_leaf(img, spec, agno, INO_ROOT, magic, recs.as_bytes(), recs.len() as u16);

    if spec.finobt {
        let mut chunks = ag.finobt.clone();
        chunks.sort_by_key(|c| c.startino);
        let recs: Vec<XfsInobtRec> = chunks.iter().map(|c| c.encode(spec.sparse)).collect();
        let magic = if spec.v5 { XFS_FIBT_CRC_MAGIC } else { XFS_FIBT_MAGIC };
        write_short_leaf(img, spec, agno, FINO_ROOT, magic, recs.as_bytes(), recs.len() as u16);
    }
}

/// Write a single-level short-btree root at `agbno`.
fn write_short_leaf(
    img: &mut [u8],
    spec: &ImageSpec,
    agno: u32,
    agbno: u32,
    magic: u32,
    recs: &[u8],
    numrecs: u16,
) {
    let off = (agno * spec.ag_blocks + agbno) as usize * BLOCK_SIZE;
    let block = &mut img[off..off + BLOCK_SIZE];
    block.fill(0);
    let hdr_size = short_hdr_size(spec.v5);
    if spec.v5 {
        let mut hdr = XfsBtreeShortV5::new_zeroed();
        hdr.bb_magic = U32::new(magic);
        hdr.bb_level = U16::new(0);
        hdr.bb_numrecs = U16::new(numrecs);
        hdr.bb_leftsib = U32::new(NULL_AGBLOCK);
        hdr.bb_rightsib = U32::new(NULL_AGBLOCK);
        hdr.bb_blkno = U64::new(off as u64 / 512);
        hdr.bb_uuid = UUID;
        hdr.bb_owner = U32::new(agno);
        block[..hdr_size].copy_from_slice(hdr.as_bytes());
    } else {
        let mut hdr = XfsBtreeShortV4::new_zeroed();
        hdr.bb_magic = U32::new(magic);
        hdr.bb_level = U16::new(0);
        hdr.bb_numrecs = U16::new(numrecs);
        hdr.bb_leftsib = U32::new(NULL_AGBLOCK);
        hdr.bb_rightsib = U32::new(NULL_AGBLOCK);
        block[..hdr_size].copy_from_slice(hdr.as_bytes());
    }
    block[hdr_size..hdr_size + recs.len()].copy_from_slice(recs);
    if spec.v5 {
        update_crc(block, SHORT_CRC_OFFSET);
    }
}

/// Payload of one long-btree (bmbt) block.
pub enum BmbtPayload<'a> {
    Leaf(&'a [BmbtIrec]),
    Node { keys: &'a [u64], ptrs: &'a [u64] },
}

/// Interior-node fanout of a bmbt block for this geometry.
pub fn bmbt_node_max(v5: bool) -> usize {
    (BLOCK_SIZE - long_hdr_size(v5)) / 16
}

/// Write one bmbt block at absolute filesystem block `fsbno`.
#[allow(clippy::too_many_arguments)]
pub fn write_bmbt_block(
    img: &mut [u8],
    v5: bool,
    fsbno: u64,
    level: u16,
    leftsib: u64,
    rightsib: u64,
    owner: u64,
    payload: &BmbtPayload<'_>,
) {
    let off = fsbno as usize * BLOCK_SIZE;
    let block = &mut img[off..off + BLOCK_SIZE];
    block.fill(0);
    let hdr_size = long_hdr_size(v5);
    let numrecs = match payload {
        BmbtPayload::Leaf(recs) => recs.len(),
        BmbtPayload::Node { ptrs, .. } => ptrs.len(),
    } as u16;

    if v5 {
        let mut hdr = XfsBtreeLongV5::new_zeroed();
        hdr.bb_magic = U32::new(XFS_BMAP_CRC_MAGIC);
        hdr.bb_level = U16::new(level);
        hdr.bb_numrecs = U16::new(numrecs);
        hdr.bb_leftsib = U64::new(leftsib);
        hdr.bb_rightsib = U64::new(rightsib);
        hdr.bb_blkno = U64::new(off as u64 / 512);
        hdr.bb_uuid = UUID;
        hdr.bb_owner = U64::new(owner);
        block[..hdr_size].copy_from_slice(hdr.as_bytes());
    } else {
        let mut hdr = XfsBtreeLongV4::new_zeroed();
        hdr.bb_magic = U32::new(XFS_BMAP_MAGIC);
        hdr.bb_level = U16::new(level);
        hdr.bb_numrecs = U16::new(numrecs);
        hdr.bb_leftsib = U64::new(leftsib);
        hdr.bb_rightsib = U64::new(rightsib);
        block[..hdr_size].copy_from_slice(hdr.as_bytes());
    }

    match payload {
        BmbtPayload::Leaf(recs) => {
            let packed: Vec<XfsBmbtRec> = recs.iter().map(XfsBmbtRec::pack).collect();
            block[hdr_size..hdr_size + packed.as_bytes().len()].copy_from_slice(packed.as_bytes());
        }
        BmbtPayload::Node { keys, ptrs } => {
            let packed: Vec<XfsBmbtKey> = keys
                .iter()
                .map(|&k| XfsBmbtKey {
                    br_startoff: U64::new(k),
                })
                .collect();
            block[hdr_size..hdr_size + packed.as_bytes().len()].copy_from_slice(packed.as_bytes());
            let ptr_off = hdr_size + bmbt_node_max(v5) * 8;
            for (i, &ptr) in ptrs.iter().enumerate() {
                block[ptr_off + i * 8..ptr_off + i * 8 + 8].copy_from_slice(&ptr.to_be_bytes());
            }
        }
    }

    if v5 {
        update_crc(block, LONG_CRC_OFFSET);
    }
}

/// Scan-state bundle for tests that drive walkers directly.
pub struct Harness {
    pub fs: FsContext,
    pub dev: MemDev,
    pub bmap: BlockMap,
    pub inventory: Inventory,
    pub dups: DupExtents,
    pub report: Reporter,
    pub no_modify: bool,
}

impl Harness {
    pub fn new(img: Vec<u8>, no_modify: bool) -> Self {
        let fs = FsContext::from_superblock(&img[..SECT_SIZE]).expect("builder superblock parses");
        let bmap = BlockMap::new(&fs);
        let inventory = Inventory::new(fs.ag_count);
        let dups = DupExtents::new(fs.ag_count);
        Harness {
            fs,
            dev: MemDev::new(img),
            bmap,
            inventory,
            dups,
            report: Reporter::new(),
            no_modify,
        }
    }

    pub fn ctx(&self) -> ScanContext<'_> {
        ScanContext::new(
            &self.fs,
            &self.dev,
            &self.bmap,
            &self.inventory,
            &self.dups,
            &self.report,
            self.no_modify,
        )
    }
}

/// Build the image and run a full scan over it.
pub fn scan_spec(spec: &ImageSpec) -> fxfsck::ScanReport {
    let dev = MemDev::new(build_image(spec));
    fxfsck::scan(&dev, &fxfsck::ScanOptions::default()).expect("scan succeeds")
}
