//! End-to-end image tests: create, populate, corrupt, audit, repair.

use appfs_engine::Fs;
use appfs_error::AppFsError;
use appfs_inode::INode;
use appfs_types::{BSIZE, BlockKind, BlockPos, DATA_CAPACITY, FILE_TABLE_SLOTS, InodeId};
use std::collections::BTreeSet;
use std::os::unix::fs::FileExt;
use tempfile::tempdir;

fn new_image(dir: &tempfile::TempDir, name: &str) -> (std::path::PathBuf, Fs) {
    let path = dir.path().join(name);
    let fs = Fs::create_image(&path, "Test", "1.0.0", "desc", "me").unwrap();
    (path, fs)
}

/// All freelist entries, walked across the whole bucket chain.
fn freelist_entries(fs: &mut Fs) -> BTreeSet<BlockPos> {
    let mut entries = BTreeSet::new();
    let mut next = Some(fs.fsinfo().pos_freelist);
    while let Some(pos) = next {
        let INode::Freelist(bucket) = fs.get_inode_by_position(pos).unwrap() else {
            panic!("freelist chain entry at {pos} is not a bucket");
        };
        entries.extend(bucket.entries.iter().copied());
        next = bucket.next;
    }
    entries
}

/// All FREEBLOCK-tagged positions found by a linear scan.
fn free_tagged(fs: &mut Fs) -> BTreeSet<BlockPos> {
    let blocks = fs.image_size() / BSIZE as u64;
    let mut free = BTreeSet::new();
    for index in 1..blocks {
        let pos = BlockPos::from_index(u32::try_from(index).unwrap()).unwrap();
        if fs.is_block_free(pos).unwrap() {
            free.insert(pos);
        }
    }
    free
}

#[test]
fn create_empty_image_layout() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "empty.img");

    assert_eq!(fs.image_size(), 3 * BSIZE as u64);
    assert_eq!(fs.fsinfo().pos_root, BlockPos(BSIZE as u32));
    assert_eq!(fs.fsinfo().pos_freelist, BlockPos(2 * BSIZE as u32));
    assert_eq!(fs.fsinfo().app_name, "Test");
    assert_eq!(fs.fsinfo().app_author, "me");

    // A fresh image reaches exactly the root directory and nothing else.
    let reach = fs.reachability().unwrap();
    assert_eq!(
        reach.headers,
        BTreeSet::from([BlockPos(BSIZE as u32)])
    );
    assert!(reach.data.is_empty());
    assert_eq!(reach.malformed_blocks, 0);
}

#[test]
fn entry_point_round_trip() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "entry.img");

    let entry = fs.create_file(InodeId::ROOT, "EntryPoint").unwrap();
    fs.write_file_data(entry, 0, b"#!/bin/sh\n").unwrap();

    assert_eq!(fs.read_file_data(entry, 0, 10).unwrap(), b"#!/bin/sh\n");
    let INode::FileInfo(file) = fs.get_inode_by_id(entry).unwrap() else {
        panic!("entry point is not a file");
    };
    assert_eq!(file.length, 10);
    assert_eq!(file.parent, InodeId::ROOT);

    let node = fs.resolve_path("/EntryPoint").unwrap();
    assert_eq!(node.inode_id(), Some(entry));
}

#[test]
fn declared_payload_lengths_sum_to_file_length() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "sum.img");

    let id = fs.create_file(InodeId::ROOT, "blob").unwrap();
    let payload: Vec<u8> = (0..2 * DATA_CAPACITY + 123).map(|i| (i % 251) as u8).collect();
    fs.write_file_data(id, 0, &payload).unwrap();

    let INode::FileInfo(file) = fs.get_inode_by_id(id).unwrap() else {
        panic!("not a file");
    };
    let declared: usize = file
        .blocks
        .iter()
        .map(|&pos| {
            let INode::Data(data) = fs.get_inode_by_position(pos).unwrap() else {
                panic!("table entry at {pos} is not a data block");
            };
            data.payload.len()
        })
        .sum();
    assert_eq!(declared, file.length as usize);
    assert_eq!(fs.read_file_data(id, 0, payload.len()).unwrap(), payload);
}

#[test]
fn delete_and_reclaim() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "delete.img");

    let entry = fs.create_file(InodeId::ROOT, "EntryPoint").unwrap();
    fs.write_file_data(entry, 0, b"#!/bin/sh\n").unwrap();

    let file_pos = fs.get_inode_position_by_id(entry).unwrap();
    let INode::FileInfo(file) = fs.get_inode_by_id(entry).unwrap() else {
        panic!("not a file");
    };
    let data_pos = file.blocks[0];

    fs.unlink_child(InodeId::ROOT, entry).unwrap();
    fs.reset_block(file_pos).unwrap();
    fs.reset_block(data_pos).unwrap();

    let reach = fs.reachability().unwrap();
    assert_eq!(reach.headers, BTreeSet::from([fs.fsinfo().pos_root]));
    assert!(reach.data.is_empty());

    let entries = freelist_entries(&mut fs);
    assert!(entries.contains(&file_pos));
    assert!(entries.contains(&data_pos));
}

#[test]
fn clean_reclaims_unlinked_file_and_reports_orphan_data() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "repair.img");

    let entry = fs.create_file(InodeId::ROOT, "EntryPoint").unwrap();
    fs.write_file_data(entry, 0, b"#!/bin/sh\n").unwrap();
    let file_pos = fs.get_inode_position_by_id(entry).unwrap();

    // Unlink without freeing: the file info block is now garbage.
    fs.unlink_child(InodeId::ROOT, entry).unwrap();

    let report = fs.clean().unwrap();
    assert_eq!(report.cleaned_files, 1);
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.failed, 0);
    // Its data block is an orphan: reported, never auto-reclaimed.
    assert_eq!(report.orphan_data, 1);

    assert!(fs.is_block_free(file_pos).unwrap());
    let reach = fs.reachability().unwrap();
    assert_eq!(reach.headers, BTreeSet::from([fs.fsinfo().pos_root]));
    assert!(reach.data.is_empty());
}

#[test]
fn clean_reclaims_temporary_and_invalid_blocks() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "tmp.img");

    let tmp = fs.allocate_block(BlockKind::Temporary).unwrap();
    let bad = fs.allocate_block(BlockKind::Temporary).unwrap();
    fs.mark_block_invalid(bad).unwrap();

    let report = fs.clean().unwrap();
    assert_eq!(report.cleaned_temporary, 1);
    assert_eq!(report.cleaned_invalid, 1);
    assert_eq!(report.cleaned, 2);
    assert!(fs.is_block_free(tmp).unwrap());
    assert!(fs.is_block_free(bad).unwrap());
}

#[test]
fn segment_map_classification() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "map.img");

    let entry = fs.create_file(InodeId::ROOT, "EntryPoint").unwrap();
    fs.write_file_data(entry, 0, b"#!/bin/sh\n").unwrap();

    let reach = fs.reachability().unwrap();
    let map = fs.segment_map(&reach).unwrap();
    let glyphs: String = map.iter().map(|g| g.glyph).collect();
    assert_eq!(glyphs, "ID%F#");
    assert!(map.iter().all(|g| !g.unreachable));

    // Unlink the file: its info block is still typed F but now flagged
    // unreachable, while the data block degrades with it.
    fs.unlink_child(InodeId::ROOT, entry).unwrap();
    let reach = fs.reachability().unwrap();
    let map = fs.segment_map(&reach).unwrap();
    assert_eq!(map[3].glyph, 'F');
    assert!(map[3].unreachable);
    assert_eq!(map[4].glyph, '#');
}

#[test]
fn malformed_tag_is_reported_and_skipped() {
    let dir = tempdir().unwrap();
    let (path, mut fs) = new_image(&dir, "bad.img");

    let entry = fs.create_file(InodeId::ROOT, "EntryPoint").unwrap();
    let file_pos = fs.get_inode_position_by_id(entry).unwrap();

    // Stamp an out-of-set tag over the file info block.
    let raw = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap();
    raw.write_all_at(&[0xAB, 0xCD], file_pos.byte_offset()).unwrap();

    assert!(matches!(
        fs.get_inode_by_position(file_pos),
        Err(AppFsError::Malformed { .. })
    ));

    // The walk counts the bad child and keeps going.
    let reach = fs.reachability().unwrap();
    assert_eq!(reach.malformed_blocks, 1);
    assert_eq!(reach.headers, BTreeSet::from([fs.fsinfo().pos_root]));

    // The linear passes classify the unknown tag as invalid.
    let map = fs.segment_map(&reach).unwrap();
    assert_eq!(map[file_pos.index() as usize].glyph, '?');
}

#[test]
fn freelist_bucket_overflow_and_collapse() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "buckets.img");
    let slots = appfs_types::FREELIST_SLOTS;

    let mut allocated = Vec::new();
    for _ in 0..=slots {
        allocated.push(fs.allocate_block(BlockKind::Temporary).unwrap());
    }
    let head_before = fs.fsinfo().pos_freelist;
    for &pos in &allocated {
        fs.reset_block(pos).unwrap();
    }

    // The final push no longer fit in the head bucket: a second bucket
    // was opened at the end of the image and prepended.
    let head_after = fs.fsinfo().pos_freelist;
    assert_ne!(head_after, head_before);
    let INode::Freelist(head) = fs.get_inode_by_position(head_after).unwrap() else {
        panic!("head is not a freelist bucket");
    };
    assert_eq!(head.entries.len(), 1);
    assert_eq!(head.next, Some(head_before));

    // Draining pops every freed position plus the emptied spare bucket.
    let mut popped = BTreeSet::new();
    for _ in 0..=slots + 1 {
        popped.insert(fs.allocate_block(BlockKind::Temporary).unwrap());
    }
    let mut expected: BTreeSet<BlockPos> = allocated.into_iter().collect();
    expected.insert(head_after);
    assert_eq!(popped, expected);
    assert_eq!(fs.fsinfo().pos_freelist, head_before);

    // Empty again: the next allocation extends the image instead.
    let grown = fs.allocate_block(BlockKind::Temporary).unwrap();
    assert_eq!(grown.byte_offset(), fs.image_size() - BSIZE as u64);
}

#[test]
fn freelist_agrees_with_free_tags() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "agree.img");

    let blocks: Vec<BlockPos> = (0..10)
        .map(|_| fs.allocate_block(BlockKind::Temporary).unwrap())
        .collect();
    for &pos in blocks.iter().step_by(2) {
        fs.reset_block(pos).unwrap();
    }

    assert_eq!(freelist_entries(&mut fs), free_tagged(&mut fs));
}

#[test]
fn file_table_overflow_allocates_one_continuation() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "bigfile.img");

    let id = fs.create_file(InodeId::ROOT, "payload").unwrap();
    let inline_capacity = FILE_TABLE_SLOTS * DATA_CAPACITY;
    fs.write_file_data(id, 0, &vec![7_u8; inline_capacity]).unwrap();

    let INode::FileInfo(file) = fs.get_inode_by_id(id).unwrap() else {
        panic!("not a file");
    };
    assert_eq!(file.blocks.len(), FILE_TABLE_SLOTS);
    assert!(file.next.is_none());

    let size_before = fs.image_size();
    fs.write_file_data(id, u32::try_from(inline_capacity).unwrap(), &[42])
        .unwrap();
    // Exactly one continuation and one more data block.
    assert_eq!(fs.image_size(), size_before + 2 * BSIZE as u64);

    let INode::FileInfo(file) = fs.get_inode_by_id(id).unwrap() else {
        panic!("not a file");
    };
    let seg_pos = file.next.expect("table continuation expected");
    let INode::SegInfo(seg) = fs.get_inode_by_position(seg_pos).unwrap() else {
        panic!("continuation is not segment info");
    };
    assert_eq!(seg.owner, id);
    assert_eq!(seg.seq, 1);
    assert_eq!(seg.block_entries().unwrap().len(), 1);

    assert_eq!(
        fs.read_file_data(id, u32::try_from(inline_capacity).unwrap(), 8).unwrap(),
        [42]
    );

    // The whole chain is live.
    let reach = fs.reachability().unwrap();
    assert!(reach.headers.contains(&seg_pos));
    assert_eq!(reach.data.len(), FILE_TABLE_SLOTS + 1);
}

#[test]
fn directory_table_overflow_keeps_children_resolvable() {
    let dir = tempdir().unwrap();
    let (_, mut fs) = new_image(&dir, "bigdir.img");
    let slots = appfs_types::DIR_TABLE_SLOTS;

    let mut last = None;
    for n in 0..=slots {
        let pos = fs.allocate_block(BlockKind::FileInfo).unwrap();
        let id = fs.get_inode_by_position(pos).unwrap().inode_id().unwrap();
        fs.set_inode_name(id, &format!("f{n}")).unwrap();
        fs.link_child(InodeId::ROOT, id).unwrap();
        last = Some(id);
    }

    let INode::Directory(root) = fs.get_inode_by_id(InodeId::ROOT).unwrap() else {
        panic!("root is not a directory");
    };
    assert_eq!(root.children.len(), slots);
    let seg_pos = root.next.expect("child table continuation expected");

    let children = fs.get_children_of_directory(InodeId::ROOT).unwrap();
    assert_eq!(children.len(), slots + 1);

    let node = fs.resolve_path(&format!("/f{slots}")).unwrap();
    assert_eq!(node.inode_id(), last);

    let reach = fs.reachability().unwrap();
    assert!(reach.headers.contains(&seg_pos));

    // Unlinking everything collapses the continuation back into the
    // freelist.
    for child in children {
        fs.unlink_child(InodeId::ROOT, child.inode_id().unwrap()).unwrap();
    }
    let INode::Directory(root) = fs.get_inode_by_id(InodeId::ROOT).unwrap() else {
        panic!("root is not a directory");
    };
    assert!(root.children.is_empty());
    assert!(root.next.is_none());
    assert!(fs.is_block_free(seg_pos).unwrap());
}

#[test]
fn reopen_preserves_everything() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.img");
    let entry = {
        let mut fs = Fs::create_image(&path, "Test", "1.0.0", "desc", "me").unwrap();
        let entry = fs.create_file(InodeId::ROOT, "EntryPoint").unwrap();
        fs.write_file_data(entry, 0, b"#!/bin/sh\n").unwrap();
        entry
    };

    let mut fs = Fs::open(&path).unwrap();
    assert_eq!(fs.fsinfo().app_name, "Test");
    assert_eq!(fs.read_file_data(entry, 0, 64).unwrap(), b"#!/bin/sh\n");
    let reach = fs.reachability().unwrap();
    assert_eq!(reach.headers.len(), 2);
    assert_eq!(reach.data.len(), 1);
}
