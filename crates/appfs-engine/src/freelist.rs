//! Freelist protocol.
//!
//! Free positions live in a singly linked chain of FREELIST buckets; the
//! FSINFO header points at the head. Push appends to the head bucket,
//! opening a new bucket at the end of the image when it is full. Pop
//! takes the last entry of the head bucket, and when the head is empty
//! with a non-null `next`, hands the emptied bucket itself out as the
//! allocation so bucket chains never grow without bound.
//!
//! The FSINFO head pointer is rewritten only after the bucket it will
//! point at is fully on disk.

use crate::Fs;
use appfs_error::{AppFsError, Result};
use appfs_inode::{FreelistNode, INode};
use appfs_types::BlockPos;
use tracing::{debug, trace};

fn load_bucket(fs: &mut Fs, pos: BlockPos) -> Result<FreelistNode> {
    let node = fs.read_node(pos)?;
    let INode::Freelist(bucket) = node else {
        return Err(AppFsError::Malformed {
            pos,
            detail: format!("expected freelist bucket, found {}", node.kind()),
        });
    };
    Ok(bucket)
}

fn store_bucket(fs: &mut Fs, pos: BlockPos, bucket: &FreelistNode) -> Result<()> {
    let buf = bucket.encode().map_err(|e| AppFsError::malformed(pos, e))?;
    fs.stream.write_block(pos, &buf)
}

/// Record `pos` as free.
pub(crate) fn push(fs: &mut Fs, pos: BlockPos) -> Result<()> {
    let head_pos = fs.fsinfo.pos_freelist;
    let mut head = load_bucket(fs, head_pos)?;

    if !head.is_full() {
        head.entries.push(pos);
        store_bucket(fs, head_pos, &head)?;
        trace!(target: "appfs::engine", event = "freelist_push", pos = %pos, bucket = %head_pos);
        return Ok(());
    }

    // Head bucket is full: open a new one by extending the image (never
    // by popping the freelist for its own bookkeeping) and prepend it.
    let new_head = fs.grow()?;
    let bucket = FreelistNode {
        next: Some(head_pos),
        entries: vec![pos],
    };
    store_bucket(fs, new_head, &bucket)?;
    fs.fsinfo.pos_freelist = new_head;
    fs.write_fsinfo()?;
    debug!(
        target: "appfs::engine",
        event = "freelist_grow",
        new_head = %new_head,
        chained_to = %head_pos
    );
    Ok(())
}

/// Take a free position, or `None` when the freelist is empty.
pub(crate) fn pop(fs: &mut Fs) -> Result<Option<BlockPos>> {
    let head_pos = fs.fsinfo.pos_freelist;
    let mut head = load_bucket(fs, head_pos)?;

    if let Some(pos) = head.entries.pop() {
        store_bucket(fs, head_pos, &head)?;
        trace!(target: "appfs::engine", event = "freelist_pop", pos = %pos, bucket = %head_pos);
        return Ok(Some(pos));
    }

    match head.next {
        None => Ok(None),
        Some(next) => {
            // Collapse: the emptied head bucket itself becomes the
            // allocation once the chain points past it.
            fs.fsinfo.pos_freelist = next;
            fs.write_fsinfo()?;
            debug!(
                target: "appfs::engine",
                event = "freelist_collapse",
                reclaimed = %head_pos,
                new_head = %next
            );
            Ok(Some(head_pos))
        }
    }
}
