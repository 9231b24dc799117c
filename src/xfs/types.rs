/// XFS inode number (absolute, 64-bit).
pub type XfsIno = u64;

/// XFS AG number.
pub type XfsAgnumber = u32;

/// XFS AG-relative block number.
pub type XfsAgblock = u32;

/// XFS AG-relative inode number (within the AG).
pub type XfsAgino = u32;

/// XFS filesystem block number (absolute, 64-bit).
pub type XfsFsblock = u64;

/// XFS file offset in filesystem blocks.
pub type XfsFileoff = u64;

/// XFS extent length in filesystem blocks.
pub type XfsExtlen = u32;

/// Null sentinel for an AG-relative block number.
pub const NULL_AGBLOCK: XfsAgblock = u32::MAX;

/// Null sentinel for an AG-relative inode number.
pub const NULL_AGINO: XfsAgino = u32::MAX;

/// Null sentinel for an absolute filesystem block number.
pub const NULL_FSBLOCK: XfsFsblock = u64::MAX;

/// Null sentinel for a file offset.
pub const NULL_FILEOFF: XfsFileoff = u64::MAX;

/// Inodes per inode chunk. A chunk is the allocation unit of the inode
/// btrees and is tracked by exactly one inobt record.
pub const INODES_PER_CHUNK: u32 = 64;

/// Number of hash buckets in the AGI unlinked-inode table.
pub const AGI_UNLINKED_BUCKETS: usize = 64;
