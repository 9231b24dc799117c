//! Work-queue driver: one task per AG, fanned across a fixed worker pool.
//!
//! Each AG is scanned start-to-finish by exactly one worker; cross-AG
//! ordering is unspecified. The accumulator travels with the task, so no
//! synchronization is needed on the tallies themselves.

use crate::scan::ag::scan_ag;
use crate::scan::{AgCounts, ScanContext};

/// Default worker pool size.
pub const SCAN_THREADS: usize = 32;

/// Scan every AG and return the per-AG tallies, in AG order. Worker
/// failures abandon their AG but never the pool.
pub fn scan_ags(ctx: &ScanContext<'_>, threads: usize) -> Vec<AgCounts> {
    let ag_count = ctx.fs.ag_count;
    let nthreads = threads.max(1).min(ag_count as usize);

    let (task_tx, task_rx) = crossbeam_channel::unbounded::<AgCounts>();
    for agno in 0..ag_count {
        task_tx
            .send(AgCounts::new(agno))
            .expect("task queue closed before fill");
    }
    drop(task_tx);

    let (done_tx, done_rx) = crossbeam_channel::unbounded::<AgCounts>();

    std::thread::scope(|scope| {
        for _ in 0..nthreads {
            let task_rx = task_rx.clone();
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                while let Ok(mut agcnts) = task_rx.recv() {
                    let agno = agcnts.agno;
                    if let Err(err) = scan_ag(ctx, agno, &mut agcnts) {
                        ctx.report
                            .error(format_args!("ag {agno} scan abandoned: {err}"));
                    }
                    if done_tx.send(agcnts).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(done_tx);

    let mut counts: Vec<AgCounts> = done_rx.iter().collect();
    counts.sort_by_key(|c| c.agno);
    counts
}
