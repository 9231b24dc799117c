//! Direct tests of the block-state map, inode inventory, and duplicate
//! index.

mod common;

use common::*;
use fxfsck::blockmap::{BlockMap, BlockState};
use fxfsck::bmap::DupExtents;
use fxfsck::incore::{InoChunkRec, Inventory};
use fxfsck::xfs::superblock::FsContext;

fn fs() -> FsContext {
    let img = build_image(&ImageSpec::new(vec![AgSpec::default()]));
    FsContext::from_superblock(&img[..SECT_SIZE]).unwrap()
}

// ---------------------------------------------------------------------------
// Block map
// ---------------------------------------------------------------------------

#[test]
fn new_map_reserves_header_blocks() {
    let map = BlockMap::new(&fs());
    let ag = map.lock_ag(0);
    assert_eq!(ag.len(), AG_BLOCKS as usize);
    assert_eq!(ag.get(0), BlockState::InUseFs, "header sectors");
    assert_eq!(ag.get(1), BlockState::Unknown);
}

#[test]
fn set_and_get_extent_coalesce_runs() {
    let map = BlockMap::new(&fs());
    let mut ag = map.lock_ag(0);

    ag.set_extent(10, 5, BlockState::Free1);
    let (state, len) = ag.get_extent(10, 64);
    assert_eq!(state, BlockState::Free1);
    assert_eq!(len, 5, "run stops where the state changes");

    let (state, len) = ag.get_extent(15, 64);
    assert_eq!(state, BlockState::Unknown);
    assert!(len >= 1);

    // get_extent never runs past the caller's bound.
    let (_, len) = ag.get_extent(10, 13);
    assert_eq!(len, 3);
}

#[test]
fn out_of_range_blocks_read_as_bad() {
    let map = BlockMap::new(&fs());
    let ag = map.lock_ag(0);
    assert_eq!(ag.get(AG_BLOCKS), BlockState::Bad);
}

#[test]
fn count_tallies_states() {
    let map = BlockMap::new(&fs());
    let mut ag = map.lock_ag(0);
    ag.set_extent(20, 4, BlockState::Free);
    ag.set(30, BlockState::Free);
    assert_eq!(ag.count(BlockState::Free), 5);
    assert_eq!(ag.count(BlockState::InUseFs), 1);
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[test]
fn chunk_record_flags_round_trip() {
    let mut rec = InoChunkRec::new(64);
    rec.set_free(0);
    rec.set_free(63);
    rec.set_sparse(63);
    rec.set_used(0);

    assert!(!rec.is_free(0));
    assert!(rec.is_free(63));
    assert!(rec.is_sparse(63));
    assert_eq!(rec.free_count(), 0, "sparse slots don't count as free");
}

#[test]
fn find_chunk_range_sees_partial_overlap() {
    let inv = Inventory::new(1);
    inv.insert_chunk(0, InoChunkRec::new(64));

    // A chunk starting at 64 covers inodes 64..128.
    assert_eq!(inv.find_chunk_range(0, 96, 160), Some((64, 64)));
    assert_eq!(inv.find_chunk_range(0, 128, 192), None);
    assert_eq!(inv.find_chunk_range(0, 0, 65), Some((64, 64)));
    assert_eq!(inv.find_chunk_range(0, 0, 64), None, "range end is exclusive");
}

#[test]
fn find_chunk_range_returns_first_and_last() {
    let inv = Inventory::new(1);
    inv.insert_chunk(0, InoChunkRec::new(64));
    inv.insert_chunk(0, InoChunkRec::new(128));
    inv.insert_chunk(0, InoChunkRec::new(256));

    assert_eq!(inv.find_chunk_range(0, 0, 512), Some((64, 256)));
    assert_eq!(inv.find_chunk_range(0, 100, 200), Some((64, 128)));
}

#[test]
fn uncertain_entries_are_tracked_separately() {
    let inv = Inventory::new(1);
    inv.add_uncertain(0, 64, true);
    inv.add_uncertain(0, 65, false);
    inv.add_uncertain(0, 64, true);

    assert_eq!(inv.uncertain_count(0), 2, "re-adding the same inode is idempotent");
    assert_eq!(inv.chunk_count(0), 0);
}

// ---------------------------------------------------------------------------
// Duplicate index
// ---------------------------------------------------------------------------

#[test]
fn dup_extent_search_is_by_overlap() {
    let dups = DupExtents::new(2);
    dups.add_dup_extent(0, 100, 110);

    assert!(dups.search_dup_extent(0, 105, 106));
    assert!(dups.search_dup_extent(0, 90, 101));
    assert!(dups.search_dup_extent(0, 109, 200));
    assert!(!dups.search_dup_extent(0, 110, 120), "end is exclusive");
    assert!(!dups.search_dup_extent(0, 90, 100));
    assert!(!dups.search_dup_extent(1, 105, 106), "other AG is clean");
}

#[test]
fn rt_dup_extent_search_is_by_block() {
    let dups = DupExtents::new(1);
    dups.add_rt_dup_extent(1000, 1010);

    assert!(dups.search_rt_dup_extent(1000));
    assert!(dups.search_rt_dup_extent(1009));
    assert!(!dups.search_rt_dup_extent(1010));
    assert!(!dups.search_rt_dup_extent(999));
}
