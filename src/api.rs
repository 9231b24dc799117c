use crate::blockmap::BlockMap;
use crate::bmap::DupExtents;
use crate::error::FxfsckError;
use crate::incore::Inventory;
use crate::io::device::BlockDev;
use crate::report::Reporter;
use crate::scan::dispatch::{SCAN_THREADS, scan_ags};
use crate::scan::{AgCounts, ScanContext};
use crate::xfs::superblock::FsContext;

/// The primary superblock lives in the first sector; 512 bytes is enough
/// to parse it before the real sector size is known.
const SB_PROBE_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Diagnosis-only: never write to the device. This is the default.
    pub no_modify: bool,
    /// Worker pool size; capped at the AG count.
    pub threads: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            no_modify: true,
            threads: SCAN_THREADS,
        }
    }
}

/// Everything the scan learned, handed to the later repair phases.
pub struct ScanReport {
    pub fs: FsContext,
    pub ag_counts: Vec<AgCounts>,
    /// Computed global counters.
    pub fdblocks: u64,
    pub icount: u64,
    pub ifree: u64,
    /// Total warnings emitted; zero for a clean image.
    pub warnings: u64,
    pub block_map: BlockMap,
    pub inventory: Inventory,
}

/// Scan the filesystem on `dev`: walk every AG's metadata btrees, build
/// the block-accounting map, import the inode inventory, and cross-check
/// all header and superblock counters.
///
/// Corruption is reported through the `log` facade and tallied in the
/// report; only an unreadable primary superblock is a hard error.
pub fn scan(dev: &dyn BlockDev, opts: &ScanOptions) -> Result<ScanReport, FxfsckError> {
    let mut sb_probe = crate::io::device::alloc_aligned(SB_PROBE_SIZE);
    dev.read_at(&mut sb_probe, 0)?;
    let fs = FsContext::from_superblock(&sb_probe)?;

    let block_map = BlockMap::new(&fs);
    let inventory = Inventory::new(fs.ag_count);
    let dups = DupExtents::new(fs.ag_count);
    let report = Reporter::new();

    let ag_counts = {
        let ctx = ScanContext::new(
            &fs,
            dev,
            &block_map,
            &inventory,
            &dups,
            &report,
            opts.no_modify,
        );
        scan_ags(&ctx, opts.threads)
    };

    // Tally up the counts and validate them against the superblock.
    let mut fdblocks = 0u64;
    let mut icount = 0u64;
    let mut ifree = 0u64;
    for agcnts in &ag_counts {
        fdblocks += agcnts.fdblocks;
        icount += agcnts.agi_count as u64;
        ifree += agcnts.ifreecount;
    }

    if fs.icount != icount {
        report.warn(format_args!("sb_icount {}, counted {icount}", fs.icount));
    }
    if fs.ifree != ifree {
        report.warn(format_args!("sb_ifree {}, counted {ifree}", fs.ifree));
    }
    if fs.fdblocks != fdblocks {
        report.warn(format_args!(
            "sb_fdblocks {}, counted {fdblocks}",
            fs.fdblocks
        ));
    }

    Ok(ScanReport {
        fs,
        ag_counts,
        fdblocks,
        icount,
        ifree,
        warnings: report.warnings(),
        block_map,
        inventory,
    })
}
