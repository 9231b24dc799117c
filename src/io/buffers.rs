//! Buffer gateway between the tree walkers and the device.
//!
//! Every metadata read goes through [`Buffers::read`] with a verifier
//! descriptor naming the block kind. The result distinguishes a hard read
//! failure (error), a checksum mismatch (buffer returned, flagged BadCrc),
//! and a verifier rejection (flagged Corrupt); the walkers decide how
//! suspicious to get. Writeback refreshes the checksum and is only legal
//! in modify mode, which callers enforce.

use crate::error::FxfsckError;
use crate::io::device::{AlignedBuf, BlockDev, alloc_aligned};
use crate::xfs::agheader::{AGF_CRC_OFFSET, AGFL_CRC_OFFSET, AGI_CRC_OFFSET};
use crate::xfs::agheader::{XFS_AGF_MAGIC, XFS_AGFL_MAGIC, XFS_AGI_MAGIC};
use crate::xfs::btree::{
    LONG_CRC_OFFSET, SHORT_CRC_OFFSET, XFS_ABTB_CRC_MAGIC, XFS_ABTB_MAGIC, XFS_ABTC_CRC_MAGIC,
    XFS_ABTC_MAGIC, XFS_BMAP_CRC_MAGIC, XFS_BMAP_MAGIC, XFS_FIBT_CRC_MAGIC, XFS_FIBT_MAGIC,
    XFS_IBT_CRC_MAGIC, XFS_IBT_MAGIC,
};
use crate::xfs::superblock::{SB_CRC_OFFSET, XFS_SB_MAGIC};

/// Verification outcome attached to a buffer that could still be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufVerifyError {
    /// Stored checksum does not match the block contents.
    BadCrc,
    /// The verifier rejected the block structure (wrong magic).
    Corrupt,
}

/// Verifier descriptor: which magics a block kind may carry, per format
/// version, and where its V5 checksum lives.
pub struct BufOps {
    pub name: &'static str,
    pub magic_v4: &'static [u32],
    pub magic_v5: &'static [u32],
    pub crc_offset: usize,
}

pub static XFS_SB_BUF_OPS: BufOps = BufOps {
    name: "superblock",
    magic_v4: &[XFS_SB_MAGIC],
    magic_v5: &[XFS_SB_MAGIC],
    crc_offset: SB_CRC_OFFSET,
};

pub static XFS_AGF_BUF_OPS: BufOps = BufOps {
    name: "agf",
    magic_v4: &[XFS_AGF_MAGIC],
    magic_v5: &[XFS_AGF_MAGIC],
    crc_offset: AGF_CRC_OFFSET,
};

pub static XFS_AGI_BUF_OPS: BufOps = BufOps {
    name: "agi",
    magic_v4: &[XFS_AGI_MAGIC],
    magic_v5: &[XFS_AGI_MAGIC],
    crc_offset: AGI_CRC_OFFSET,
};

// V4 free lists are a bare array with nothing to verify.
pub static XFS_AGFL_BUF_OPS: BufOps = BufOps {
    name: "agfl",
    magic_v4: &[],
    magic_v5: &[XFS_AGFL_MAGIC],
    crc_offset: AGFL_CRC_OFFSET,
};

pub static XFS_ALLOCBT_BUF_OPS: BufOps = BufOps {
    name: "freespace btree",
    magic_v4: &[XFS_ABTB_MAGIC, XFS_ABTC_MAGIC],
    magic_v5: &[XFS_ABTB_CRC_MAGIC, XFS_ABTC_CRC_MAGIC],
    crc_offset: SHORT_CRC_OFFSET,
};

pub static XFS_INOBT_BUF_OPS: BufOps = BufOps {
    name: "inode btree",
    magic_v4: &[XFS_IBT_MAGIC, XFS_FIBT_MAGIC],
    magic_v5: &[XFS_IBT_CRC_MAGIC, XFS_FIBT_CRC_MAGIC],
    crc_offset: SHORT_CRC_OFFSET,
};

pub static XFS_BMBT_BUF_OPS: BufOps = BufOps {
    name: "bmap btree",
    magic_v4: &[XFS_BMAP_MAGIC],
    magic_v5: &[XFS_BMAP_CRC_MAGIC],
    crc_offset: LONG_CRC_OFFSET,
};

/// One borrowed metadata block. Owned data; dropping it releases the
/// buffer, [`Buffers::writeback`] releases with write.
pub struct BlockBuf {
    pub data: AlignedBuf,
    pub offset: u64,
    pub error: Option<BufVerifyError>,
    ops: &'static BufOps,
}

/// CRC32c of the buffer with the checksum field itself zeroed, the way
/// every XFS metadata checksum is defined.
pub fn compute_crc(buf: &[u8], crc_offset: usize) -> u32 {
    let crc = crc32c::crc32c(&buf[..crc_offset]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &buf[crc_offset + 4..])
}

/// Stamp the checksum into a block image. Shared with the image builders
/// used in tests.
pub fn update_crc(buf: &mut [u8], crc_offset: usize) {
    let crc = compute_crc(buf, crc_offset);
    buf[crc_offset..crc_offset + 4].copy_from_slice(&crc.to_le_bytes());
}

/// The gateway itself: a device handle plus the format version, which
/// decides whether checksums exist at all.
pub struct Buffers<'a> {
    dev: &'a dyn BlockDev,
    is_v5: bool,
}

impl<'a> Buffers<'a> {
    pub fn new(dev: &'a dyn BlockDev, is_v5: bool) -> Self {
        Buffers { dev, is_v5 }
    }

    pub fn device(&self) -> &'a dyn BlockDev {
        self.dev
    }

    /// Read and verify `len` bytes at `offset`. A hard read failure is an
    /// `Err`; verification problems come back attached to the buffer.
    pub fn read(
        &self,
        offset: u64,
        len: usize,
        ops: &'static BufOps,
    ) -> Result<BlockBuf, FxfsckError> {
        let mut data = alloc_aligned(len);
        self.dev.read_at(&mut data, offset)?;

        let mut error = None;
        if self.is_v5 && ops.crc_offset + 4 <= data.len() {
            let stored = u32::from_le_bytes(
                data[ops.crc_offset..ops.crc_offset + 4]
                    .try_into()
                    .expect("slice length is 4"),
            );
            if stored != compute_crc(&data, ops.crc_offset) {
                error = Some(BufVerifyError::BadCrc);
            }
        }
        if error.is_none() {
            let magics = if self.is_v5 { ops.magic_v5 } else { ops.magic_v4 };
            if !magics.is_empty() && data.len() >= 4 {
                let magic = u32::from_be_bytes(data[..4].try_into().expect("slice length is 4"));
                if !magics.contains(&magic) {
                    error = Some(BufVerifyError::Corrupt);
                }
            }
        }

        Ok(BlockBuf {
            data,
            offset,
            error,
            ops,
        })
    }

    /// Release with write: refresh the checksum and push the buffer back
    /// to the device. Callers must only do this in modify mode.
    pub fn writeback(&self, buf: &mut BlockBuf) -> Result<(), FxfsckError> {
        if self.is_v5 && buf.ops.crc_offset + 4 <= buf.data.len() {
            update_crc(&mut buf.data, buf.ops.crc_offset);
        }
        self.dev.write_at(&buf.data, buf.offset)?;
        Ok(())
    }
}
