#![forbid(unsafe_code)]
//! The AppFS filesystem engine.
//!
//! Interprets the image as typed blocks on top of the block stream:
//! maintains the inode-id to position map, implements directory and file
//! operations over the SEGINFO chain scheme, drives the freelist
//! protocol, and provides the reachability walk and clean pass that
//! decide which blocks are live and which are garbage.
//!
//! The engine is single-threaded and assumes exclusive access to the
//! stream; callers that share an engine across tasks wrap it in
//! [`SharedFs`], which serializes every operation under one lock.

mod audit;
mod freelist;
mod path;
mod shared;

pub use audit::{CleanReport, Reachability, SegmentGlyph};
pub use shared::SharedFs;

use appfs_block::BlockStream;
use appfs_error::{AppFsError, Result};
use appfs_inode::{
    DIR_NAME_LEN, DeviceNode, DirectoryNode, FILE_NAME_LEN, FileInfoNode, FreelistNode, FsInfoNode,
    INode, SYMLINK_TARGET_LEN, SegInfoNode, SymlinkNode,
};
use appfs_types::{
    BSIZE, BlockKind, BlockPos, DATA_CAPACITY, DIR_TABLE_SLOTS, FILE_TABLE_SLOTS, HSIZE_FILE,
    InodeId, OFFSET_FSINFO, write_le_u16,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

/// On-disk filesystem name stored in the FSINFO header.
pub const FS_NAME: &str = "AppFS";

/// Engine format version written into new images.
pub const FS_VERSION: (u16, u16, u16) = (0, 1, 0);

/// The filesystem engine. Owns the block stream exclusively.
#[derive(Debug)]
pub struct Fs {
    stream: BlockStream,
    fsinfo: FsInfoNode,
    id_map: HashMap<InodeId, BlockPos>,
    next_id: u16,
}

impl Fs {
    // ── Image lifecycle ─────────────────────────────────────────────────

    /// Create a new image: FSINFO at position 0, an empty root directory
    /// at `BSIZE`, and an empty freelist bucket at `2 * BSIZE`.
    ///
    /// The FSINFO block is written last, so a truncated creation leaves a
    /// file no open will accept rather than a half-described image.
    pub fn create_image(
        path: impl AsRef<Path>,
        app_name: &str,
        app_version: &str,
        app_description: &str,
        app_author: &str,
    ) -> Result<Self> {
        for (value, max) in [
            (app_name, 256),
            (app_version, 32),
            (app_description, 1024),
            (app_author, 256),
        ] {
            if value.len() > max {
                return Err(AppFsError::NameTooLong(value.to_owned()));
            }
        }

        let mut stream = BlockStream::create(path)?;
        let pos_root = BlockPos(BSIZE as u32);
        let pos_freelist = BlockPos(2 * BSIZE as u32);

        let root = DirectoryNode {
            id: InodeId::ROOT,
            parent: InodeId::ROOT,
            next: None,
            name: "/".to_owned(),
            children: Vec::new(),
        };
        stream.write_block(
            pos_root,
            &root.encode().map_err(|e| AppFsError::malformed(pos_root, e))?,
        )?;

        let bucket = FreelistNode {
            next: None,
            entries: Vec::new(),
        };
        stream.write_block(
            pos_freelist,
            &bucket
                .encode()
                .map_err(|e| AppFsError::malformed(pos_freelist, e))?,
        )?;

        let fsinfo = FsInfoNode {
            fs_name: FS_NAME.to_owned(),
            ver_major: FS_VERSION.0,
            ver_minor: FS_VERSION.1,
            ver_revision: FS_VERSION.2,
            app_name: app_name.to_owned(),
            app_version: app_version.to_owned(),
            app_description: app_description.to_owned(),
            app_author: app_author.to_owned(),
            pos_root,
            pos_freelist,
        };
        stream.write_block(
            OFFSET_FSINFO,
            &fsinfo
                .encode()
                .map_err(|e| AppFsError::malformed(OFFSET_FSINFO, e))?,
        )?;

        info!(
            target: "appfs::engine",
            event = "create_image",
            app_name = app_name,
            app_version = app_version
        );

        Ok(Self {
            stream,
            fsinfo,
            id_map: HashMap::from([(InodeId::ROOT, pos_root)]),
            next_id: 1,
        })
    }

    /// Open an existing image and rebuild the id-to-position map from a
    /// linear scan.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut stream = BlockStream::open(path)?;
        let buf = stream.read_block(OFFSET_FSINFO)?;
        let node =
            INode::decode(&buf).map_err(|e| AppFsError::malformed(OFFSET_FSINFO, e))?;
        let INode::FsInfo(fsinfo) = node else {
            return Err(AppFsError::Malformed {
                pos: OFFSET_FSINFO,
                detail: format!("expected filesystem info, found {}", node.kind()),
            });
        };

        let mut fs = Self {
            stream,
            fsinfo,
            id_map: HashMap::new(),
            next_id: 1,
        };
        fs.rebuild_id_map()?;
        Ok(fs)
    }

    fn rebuild_id_map(&mut self) -> Result<()> {
        self.id_map.clear();
        let mut max_id = 0_u16;
        let mut pos = BlockPos(BSIZE as u32);
        loop {
            let buf = match self.stream.read_block(pos) {
                Ok(buf) => buf,
                Err(AppFsError::Eof) => {
                    self.stream.clear();
                    break;
                }
                Err(err) => return Err(err),
            };
            match INode::decode(&buf) {
                Ok(node) => {
                    if let Some(id) = node.inode_id() {
                        max_id = max_id.max(id.0);
                        if self.id_map.contains_key(&id) {
                            warn!(
                                target: "appfs::engine",
                                id = id.0,
                                pos = %pos,
                                "duplicate inode id during scan; keeping the first occurrence"
                            );
                        } else {
                            self.id_map.insert(id, pos);
                        }
                    }
                }
                Err(err) => {
                    warn!(target: "appfs::engine", pos = %pos, error = %err, "skipping undecodable block during scan");
                }
            }
            pos = pos.next().ok_or(AppFsError::OutOfSpace)?;
        }
        // The FSINFO root pointer is authoritative for id 0.
        self.id_map.insert(InodeId::ROOT, self.fsinfo.pos_root);
        self.next_id = max_id.checked_add(1).unwrap_or(1).max(1);
        debug!(
            target: "appfs::engine",
            event = "rebuild_id_map",
            live_inodes = self.id_map.len(),
            next_id = self.next_id
        );
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// The cached FSINFO header.
    #[must_use]
    pub fn fsinfo(&self) -> &FsInfoNode {
        &self.fsinfo
    }

    /// Current image length in bytes.
    #[must_use]
    pub fn image_size(&self) -> u64 {
        self.stream.size()
    }

    pub fn get_inode_position_by_id(&self, id: InodeId) -> Result<BlockPos> {
        self.id_map
            .get(&id)
            .copied()
            .ok_or_else(|| AppFsError::NotFound(format!("inode {id}")))
    }

    pub fn get_inode_by_id(&mut self, id: InodeId) -> Result<INode> {
        let pos = self.get_inode_position_by_id(id)?;
        let node = self.read_node(pos)?;
        if node.inode_id() != Some(id) {
            return Err(AppFsError::Malformed {
                pos,
                detail: format!("block does not carry inode id {id}"),
            });
        }
        Ok(node)
    }

    /// Decode the block at `pos`. Fails `Malformed` on unknown tags.
    pub fn get_inode_by_position(&mut self, pos: BlockPos) -> Result<INode> {
        self.read_node(pos)
    }

    /// True iff the block at `pos` carries the free tag.
    pub fn is_block_free(&mut self, pos: BlockPos) -> Result<bool> {
        Ok(self.block_kind(pos)? == BlockKind::Free)
    }

    /// Resolve a directory's child-id table into inode records.
    ///
    /// Child ids that no longer resolve are skipped and logged; they mark
    /// a repairable inconsistency, not a fatal one.
    pub fn get_children_of_directory(&mut self, id: InodeId) -> Result<Vec<INode>> {
        let (dpos, dir) = self.load_dir(id)?;
        let (_, child_ids) = self.dir_chain(dpos, &dir)?;
        let mut children = Vec::with_capacity(child_ids.len());
        for child_id in child_ids {
            match self.get_inode_by_id(child_id) {
                Ok(node) => children.push(node),
                Err(AppFsError::NotFound(_)) => {
                    warn!(
                        target: "appfs::engine",
                        directory = id.0,
                        child = child_id.0,
                        "directory references a missing child inode"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(children)
    }

    /// Raw bytes of one block, for inspection tooling.
    pub fn read_raw_block(&mut self, pos: BlockPos) -> Result<Vec<u8>> {
        self.stream.read_block(pos)
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocate a block of the given type: pop the freelist, or extend
    /// the image when it is empty. Id-bearing types get a freshly minted
    /// inode id.
    pub fn allocate_block(&mut self, kind: BlockKind) -> Result<BlockPos> {
        Ok(self.allocate_block_inner(kind)?.0)
    }

    fn allocate_block_inner(&mut self, kind: BlockKind) -> Result<(BlockPos, InodeId)> {
        match kind {
            BlockKind::FsInfo => {
                return Err(AppFsError::Exists(
                    "the filesystem info block is a singleton".to_owned(),
                ));
            }
            BlockKind::Free | BlockKind::Unset | BlockKind::Invalid => {
                return Err(AppFsError::Busy(format!(
                    "{kind} is not an allocatable block type"
                )));
            }
            _ => {}
        }

        let pos = match freelist::pop(self)? {
            Some(pos) => pos,
            None => self.grow()?,
        };
        let id = if kind.has_inode_id() {
            self.mint_inode_id()?
        } else {
            InodeId(0)
        };

        // A popped block may hold a stale table from its previous life;
        // write the whole block, not just the header.
        let mut buf = vec![0_u8; BSIZE];
        write_le_u16(&mut buf, 0, kind.tag()).expect("header fits");
        write_le_u16(&mut buf, 2, id.0).expect("header fits");
        self.stream.write_block(pos, &buf)?;

        if kind.has_inode_id() {
            self.id_map.insert(id, pos);
        }
        debug!(
            target: "appfs::engine",
            event = "allocate_block",
            pos = %pos,
            kind = %kind,
            id = id.0
        );
        Ok((pos, id))
    }

    /// Position of the next block past the end of the image.
    pub(crate) fn grow(&mut self) -> Result<BlockPos> {
        u32::try_from(self.stream.size())
            .map(BlockPos)
            .map_err(|_| AppFsError::OutOfSpace)
    }

    fn mint_inode_id(&mut self) -> Result<InodeId> {
        let mut candidate = self.next_id.max(1);
        for _ in 0..u16::MAX {
            let id = InodeId(candidate);
            let following = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if !self.id_map.contains_key(&id) {
                self.next_id = following;
                return Ok(id);
            }
            candidate = following;
        }
        Err(AppFsError::OutOfSpace)
    }

    /// Free a block: zero its header, re-tag it FREEBLOCK, and push it
    /// onto the freelist. Valid for any non-FSINFO block that is not part
    /// of the freelist itself.
    pub fn reset_block(&mut self, pos: BlockPos) -> Result<()> {
        if !pos.is_aligned() {
            return Err(AppFsError::Malformed {
                pos,
                detail: "position is not block-aligned".to_owned(),
            });
        }
        if pos == OFFSET_FSINFO {
            return Err(AppFsError::Busy(
                "the filesystem info block is never freed".to_owned(),
            ));
        }
        if pos == self.fsinfo.pos_root {
            return Err(AppFsError::Busy("the root directory".to_owned()));
        }

        let kind = self.block_kind(pos)?;
        match kind {
            BlockKind::Free => {
                warn!(target: "appfs::engine", pos = %pos, "reset of an already-free block");
                return Ok(());
            }
            BlockKind::Freelist => {
                return Err(AppFsError::Busy(
                    "freelist buckets are managed by the freelist protocol".to_owned(),
                ));
            }
            BlockKind::FsInfo => {
                return Err(AppFsError::Busy(
                    "the filesystem info block is never freed".to_owned(),
                ));
            }
            _ => {}
        }

        self.forget_id_at(pos, kind)?;

        let mut header = vec![0_u8; HSIZE_FILE];
        write_le_u16(&mut header, 0, BlockKind::Free.tag()).expect("header fits");
        self.stream.write(pos.byte_offset(), &header)?;
        freelist::push(self, pos)?;
        debug!(target: "appfs::engine", event = "reset_block", pos = %pos, was = %kind);
        Ok(())
    }

    /// Explicitly tag a block INVALID so the clean pass reclaims it.
    pub fn mark_block_invalid(&mut self, pos: BlockPos) -> Result<()> {
        if pos == OFFSET_FSINFO || pos == self.fsinfo.pos_root {
            return Err(AppFsError::Busy(
                "cannot invalidate the filesystem info block or root directory".to_owned(),
            ));
        }
        let kind = self.block_kind(pos)?;
        if matches!(kind, BlockKind::Free | BlockKind::Freelist) {
            return Err(AppFsError::Busy(format!(
                "{kind} blocks belong to the freelist"
            )));
        }
        self.forget_id_at(pos, kind)?;
        let mut tag = [0_u8; 2];
        write_le_u16(&mut tag, 0, BlockKind::Invalid.tag()).expect("header fits");
        self.stream.write(pos.byte_offset(), &tag)?;
        debug!(target: "appfs::engine", event = "mark_invalid", pos = %pos, was = %kind);
        Ok(())
    }

    /// Drop the id-map entry for the inode stored at `pos`, if any.
    fn forget_id_at(&mut self, pos: BlockPos, kind: BlockKind) -> Result<()> {
        if !kind.has_inode_id() {
            return Ok(());
        }
        let mut header = [0_u8; 4];
        self.stream.read(pos.byte_offset(), &mut header)?;
        let id = InodeId(u16::from_le_bytes([header[2], header[3]]));
        if self.id_map.get(&id) == Some(&pos) {
            self.id_map.remove(&id);
        }
        Ok(())
    }

    // ── Directory operations ────────────────────────────────────────────

    /// Publish `child` in the directory's child table. The child's parent
    /// field is written before the table references it.
    pub fn link_child(&mut self, parent: InodeId, child: InodeId) -> Result<()> {
        let (dpos, mut dir) = self.load_dir(parent)?;
        if parent == child {
            return Err(AppFsError::Busy(
                "a directory cannot contain itself".to_owned(),
            ));
        }
        let cpos = self.get_inode_position_by_id(child)?;
        let (old_segs, mut children) = self.dir_chain(dpos, &dir)?;
        if children.contains(&child) {
            return Err(AppFsError::Exists(format!(
                "inode {child} is already a child of {parent}"
            )));
        }

        let mut node = self.read_node(cpos)?;
        match &mut node {
            INode::Directory(d) => d.parent = parent,
            INode::FileInfo(f) => f.parent = parent,
            INode::Symlink(s) => s.parent = parent,
            INode::Device(d) => d.parent = parent,
            other => {
                return Err(AppFsError::Malformed {
                    pos: cpos,
                    detail: format!("{} blocks cannot be linked into a directory", other.kind()),
                });
            }
        }
        self.write_object(cpos, &node)?;

        children.push(child);
        self.write_dir_table(dpos, &mut dir, &children, &old_segs)?;
        debug!(target: "appfs::engine", event = "link_child", parent = parent.0, child = child.0);
        Ok(())
    }

    /// Remove `child` from the directory's child table, compacting it.
    /// The child inode itself is untouched; freeing it is the caller's
    /// separate step.
    pub fn unlink_child(&mut self, parent: InodeId, child: InodeId) -> Result<()> {
        let (dpos, mut dir) = self.load_dir(parent)?;
        let (old_segs, mut children) = self.dir_chain(dpos, &dir)?;
        let index = children
            .iter()
            .position(|c| *c == child)
            .ok_or_else(|| {
                AppFsError::NotFound(format!("inode {child} is not a child of {parent}"))
            })?;
        children.remove(index);
        self.write_dir_table(dpos, &mut dir, &children, &old_segs)?;
        debug!(target: "appfs::engine", event = "unlink_child", parent = parent.0, child = child.0);
        Ok(())
    }

    /// Rename an inode in place.
    pub fn set_inode_name(&mut self, id: InodeId, name: &str) -> Result<()> {
        let pos = self.get_inode_position_by_id(id)?;
        let mut node = self.read_node(pos)?;
        let limit = match &node {
            INode::FileInfo(_) => FILE_NAME_LEN,
            INode::Directory(_) | INode::Symlink(_) | INode::Device(_) => DIR_NAME_LEN,
            other => {
                return Err(AppFsError::Malformed {
                    pos,
                    detail: format!("{} blocks carry no name", other.kind()),
                });
            }
        };
        if name.len() > limit {
            return Err(AppFsError::NameTooLong(name.to_owned()));
        }
        match &mut node {
            INode::Directory(d) => d.name = name.to_owned(),
            INode::FileInfo(f) => f.name = name.to_owned(),
            INode::Symlink(s) => s.name = name.to_owned(),
            INode::Device(d) => d.name = name.to_owned(),
            _ => unreachable!("limit match rejected other kinds"),
        }
        self.write_object(pos, &node)
    }

    // ── Create conveniences ─────────────────────────────────────────────

    /// Allocate, name, and link an empty regular file. Returns its id.
    pub fn create_file(&mut self, parent: InodeId, name: &str) -> Result<InodeId> {
        self.ensure_new_child(parent, name, FILE_NAME_LEN)?;
        let (pos, id) = self.allocate_block_inner(BlockKind::FileInfo)?;
        let file = FileInfoNode {
            id,
            parent,
            next: None,
            length: 0,
            name: name.to_owned(),
            blocks: Vec::new(),
        };
        self.stream
            .write_block(pos, &file.encode().map_err(|e| AppFsError::malformed(pos, e))?)?;
        self.link_child(parent, id)?;
        Ok(id)
    }

    /// Allocate, name, and link an empty directory. Returns its id.
    pub fn create_directory(&mut self, parent: InodeId, name: &str) -> Result<InodeId> {
        self.ensure_new_child(parent, name, DIR_NAME_LEN)?;
        let (pos, id) = self.allocate_block_inner(BlockKind::Directory)?;
        let dir = DirectoryNode {
            id,
            parent,
            next: None,
            name: name.to_owned(),
            children: Vec::new(),
        };
        self.stream
            .write_block(pos, &dir.encode().map_err(|e| AppFsError::malformed(pos, e))?)?;
        self.link_child(parent, id)?;
        Ok(id)
    }

    /// Allocate, name, and link a symbolic link. Returns its id.
    pub fn create_symlink(
        &mut self,
        parent: InodeId,
        name: &str,
        target: &str,
    ) -> Result<InodeId> {
        self.ensure_new_child(parent, name, DIR_NAME_LEN)?;
        if target.len() > SYMLINK_TARGET_LEN {
            return Err(AppFsError::NameTooLong(target.to_owned()));
        }
        let (pos, id) = self.allocate_block_inner(BlockKind::Symlink)?;
        let link = SymlinkNode {
            id,
            parent,
            name: name.to_owned(),
            target: target.to_owned(),
        };
        self.stream
            .write_block(pos, &link.encode().map_err(|e| AppFsError::malformed(pos, e))?)?;
        self.link_child(parent, id)?;
        Ok(id)
    }

    /// Allocate, name, and link a device node. Returns its id.
    pub fn create_device(
        &mut self,
        parent: InodeId,
        name: &str,
        dev_major: u32,
        dev_minor: u32,
    ) -> Result<InodeId> {
        self.ensure_new_child(parent, name, DIR_NAME_LEN)?;
        let (pos, id) = self.allocate_block_inner(BlockKind::Device)?;
        let device = DeviceNode {
            id,
            parent,
            name: name.to_owned(),
            dev_major,
            dev_minor,
        };
        self.stream
            .write_block(pos, &device.encode().map_err(|e| AppFsError::malformed(pos, e))?)?;
        self.link_child(parent, id)?;
        Ok(id)
    }

    fn ensure_new_child(&mut self, parent: InodeId, name: &str, limit: usize) -> Result<()> {
        if name.len() > limit {
            return Err(AppFsError::NameTooLong(name.to_owned()));
        }
        let existing = self.get_children_of_directory(parent)?;
        if existing.iter().any(|c| c.name() == Some(name)) {
            return Err(AppFsError::Exists(name.to_owned()));
        }
        Ok(())
    }

    // ── File data ───────────────────────────────────────────────────────

    /// Read up to `len` bytes of a file starting at `offset`.
    ///
    /// Reading at `offset == file_length` yields zero bytes; reading past
    /// it fails `Eof`. A length overrunning the file is clamped.
    pub fn read_file_data(&mut self, id: InodeId, offset: u32, len: usize) -> Result<Vec<u8>> {
        let (fpos, file) = self.load_file(id)?;
        if offset > file.length {
            return Err(AppFsError::Eof);
        }
        let n = len.min((file.length - offset) as usize);
        if n == 0 {
            return Ok(Vec::new());
        }

        let (_, data_blocks) = self.file_chain(fpos, &file)?;
        let mut out = Vec::with_capacity(n);
        let mut cursor = offset as usize;
        let end = offset as usize + n;
        while cursor < end {
            let index = cursor / DATA_CAPACITY;
            let in_block = cursor % DATA_CAPACITY;
            let take = (end - cursor).min(DATA_CAPACITY - in_block);
            let dpos = *data_blocks.get(index).ok_or_else(|| AppFsError::Malformed {
                pos: fpos,
                detail: format!("file length {} exceeds its mapped blocks", file.length),
            })?;
            let node = self.read_node(dpos)?;
            let INode::Data(data) = node else {
                return Err(AppFsError::Malformed {
                    pos: dpos,
                    detail: format!("expected data, found {}", node.kind()),
                });
            };
            if data.payload.len() < in_block + take {
                return Err(AppFsError::Malformed {
                    pos: dpos,
                    detail: "declared payload shorter than the file length implies".to_owned(),
                });
            }
            out.extend_from_slice(&data.payload[in_block..in_block + take]);
            cursor += take;
        }
        Ok(out)
    }

    /// Write `data` into a file at `offset`, extending the SEGINFO chain
    /// and allocating DATA blocks as needed. Every new block is fully
    /// written before the table that references it; the FILEINFO block
    /// (table head and file length) goes last.
    pub fn write_file_data(&mut self, id: InodeId, offset: u32, data: &[u8]) -> Result<()> {
        let (fpos, mut file) = self.load_file(id)?;
        if data.is_empty() {
            return Ok(());
        }
        let end = u64::from(offset) + data.len() as u64;
        let end = u32::try_from(end).map_err(|_| AppFsError::OutOfSpace)?;
        let new_len = file.length.max(end);

        let (old_segs, mut blocks) = self.file_chain(fpos, &file)?;
        let old_count = blocks.len();
        let total = (new_len as usize).div_ceil(DATA_CAPACITY);
        while blocks.len() < total {
            blocks.push(self.allocate_block(BlockKind::Data)?);
        }

        let write_start = offset as usize;
        let write_end = end as usize;
        for index in 0..total {
            let block_start = index * DATA_CAPACITY;
            let block_len = DATA_CAPACITY.min(new_len as usize - block_start);
            let old_len_in_block = if index < old_count {
                DATA_CAPACITY.min((file.length as usize).saturating_sub(block_start))
            } else {
                0
            };
            let overlaps = write_start < block_start + block_len && write_end > block_start;
            if !overlaps && old_len_in_block == block_len {
                continue;
            }

            let mut payload = vec![0_u8; block_len];
            if old_len_in_block > 0 {
                let node = self.read_node(blocks[index])?;
                let INode::Data(existing) = node else {
                    return Err(AppFsError::Malformed {
                        pos: blocks[index],
                        detail: format!("expected data, found {}", node.kind()),
                    });
                };
                let keep = existing.payload.len().min(block_len);
                payload[..keep].copy_from_slice(&existing.payload[..keep]);
            }
            if overlaps {
                let from = write_start.max(block_start);
                let to = write_end.min(block_start + block_len);
                payload[from - block_start..to - block_start]
                    .copy_from_slice(&data[from - write_start..to - write_start]);
            }

            let node = appfs_inode::DataNode { payload };
            self.stream.write_block(
                blocks[index],
                &node
                    .encode()
                    .map_err(|e| AppFsError::malformed(blocks[index], e))?,
            )?;
        }

        file.length = new_len;
        self.write_file_table(fpos, &mut file, &blocks, &old_segs)?;
        debug!(
            target: "appfs::engine",
            event = "write_file_data",
            id = id.0,
            offset = offset,
            len = data.len(),
            file_length = new_len
        );
        Ok(())
    }

    // ── Internal plumbing ───────────────────────────────────────────────

    pub(crate) fn read_node(&mut self, pos: BlockPos) -> Result<INode> {
        let buf = self.stream.read_block(pos)?;
        INode::decode(&buf).map_err(|e| AppFsError::malformed(pos, e))
    }

    /// Cheap tag-only classification. Unknown tags classify as INVALID.
    pub(crate) fn block_kind(&mut self, pos: BlockPos) -> Result<BlockKind> {
        let mut tag = [0_u8; 2];
        self.stream.read(pos.byte_offset(), &mut tag)?;
        Ok(BlockKind::from_tag(u16::from_le_bytes(tag)).unwrap_or(BlockKind::Invalid))
    }

    /// Rewrite the FSINFO block from the cached copy. Callers mutate the
    /// cache first and publish through here, as the last step of any
    /// operation that changes `pos_root` or `pos_freelist`.
    pub(crate) fn write_fsinfo(&mut self) -> Result<()> {
        let buf = self
            .fsinfo
            .encode()
            .map_err(|e| AppFsError::malformed(OFFSET_FSINFO, e))?;
        self.stream.write_block(OFFSET_FSINFO, &buf)
    }

    fn write_object(&mut self, pos: BlockPos, node: &INode) -> Result<()> {
        let buf = match node {
            INode::Directory(d) => d.encode(),
            INode::FileInfo(f) => f.encode(),
            INode::Symlink(s) => s.encode(),
            INode::Device(d) => d.encode(),
            other => {
                return Err(AppFsError::Malformed {
                    pos,
                    detail: format!("{} blocks are not object inodes", other.kind()),
                });
            }
        }
        .map_err(|e| AppFsError::malformed(pos, e))?;
        self.stream.write_block(pos, &buf)
    }

    fn load_dir(&mut self, id: InodeId) -> Result<(BlockPos, DirectoryNode)> {
        let pos = self.get_inode_position_by_id(id)?;
        match self.read_node(pos)? {
            INode::Directory(dir) => Ok((pos, dir)),
            other => Err(AppFsError::NotADirectory(format!(
                "inode {id} is a {}",
                other.kind()
            ))),
        }
    }

    fn load_file(&mut self, id: InodeId) -> Result<(BlockPos, FileInfoNode)> {
        let pos = self.get_inode_position_by_id(id)?;
        match self.read_node(pos)? {
            INode::FileInfo(file) => Ok((pos, file)),
            other => Err(AppFsError::Malformed {
                pos,
                detail: format!("expected file info, found {}", other.kind()),
            }),
        }
    }

    /// Collect a directory's SEGINFO chain: continuation positions and
    /// the full child-id table.
    pub(crate) fn dir_chain(
        &mut self,
        dpos: BlockPos,
        dir: &DirectoryNode,
    ) -> Result<(Vec<BlockPos>, Vec<InodeId>)> {
        let mut segs = Vec::new();
        let mut children = dir.children.clone();
        let mut visited = HashSet::from([dpos]);
        let mut next = dir.next;
        while let Some(pos) = next {
            if !visited.insert(pos) {
                return Err(AppFsError::Malformed {
                    pos,
                    detail: "segment chain loops".to_owned(),
                });
            }
            let seg = self.load_seg(pos, dir.id)?;
            children.extend(seg.child_entries().map_err(|e| AppFsError::malformed(pos, e))?);
            segs.push(pos);
            next = seg.next;
        }
        Ok((segs, children))
    }

    /// Collect a file's SEGINFO chain: continuation positions and the
    /// full DATA-position table.
    pub(crate) fn file_chain(
        &mut self,
        fpos: BlockPos,
        file: &FileInfoNode,
    ) -> Result<(Vec<BlockPos>, Vec<BlockPos>)> {
        let mut segs = Vec::new();
        let mut blocks = file.blocks.clone();
        let mut visited = HashSet::from([fpos]);
        let mut next = file.next;
        while let Some(pos) = next {
            if !visited.insert(pos) {
                return Err(AppFsError::Malformed {
                    pos,
                    detail: "segment chain loops".to_owned(),
                });
            }
            let seg = self.load_seg(pos, file.id)?;
            blocks.extend(seg.block_entries().map_err(|e| AppFsError::malformed(pos, e))?);
            segs.push(pos);
            next = seg.next;
        }
        Ok((segs, blocks))
    }

    fn load_seg(&mut self, pos: BlockPos, owner: InodeId) -> Result<SegInfoNode> {
        let node = self.read_node(pos)?;
        let INode::SegInfo(seg) = node else {
            return Err(AppFsError::Malformed {
                pos,
                detail: format!("expected segment info, found {}", node.kind()),
            });
        };
        if seg.owner != owner {
            return Err(AppFsError::Malformed {
                pos,
                detail: format!("segment owner is {}, expected {owner}", seg.owner),
            });
        }
        Ok(seg)
    }

    /// Rewrite a directory's child table across its SEGINFO chain,
    /// allocating or freeing continuations so the table stays packed.
    /// Continuations are written before the directory block that
    /// references them.
    fn write_dir_table(
        &mut self,
        dpos: BlockPos,
        dir: &mut DirectoryNode,
        children: &[InodeId],
        old_segs: &[BlockPos],
    ) -> Result<()> {
        let split = children.len().min(DIR_TABLE_SLOTS);
        let (inline, rest) = children.split_at(split);
        let chunks: Vec<&[InodeId]> = rest.chunks(DIR_TABLE_SLOTS).collect();

        let mut segs = old_segs.to_vec();
        while segs.len() < chunks.len() {
            segs.push(self.allocate_block(BlockKind::SegInfo)?);
        }

        for (i, chunk) in chunks.iter().enumerate().rev() {
            let next = segs.get(i + 1).filter(|_| i + 1 < chunks.len()).copied();
            #[expect(clippy::cast_possible_truncation)] // chain length is bounded by u16 ids
            let seg = SegInfoNode::new_children(dir.id, (i + 1) as u16, next, chunk)
                .map_err(|e| AppFsError::malformed(segs[i], e))?;
            self.stream
                .write_block(segs[i], &seg.encode().map_err(|e| AppFsError::malformed(segs[i], e))?)?;
        }

        dir.children = inline.to_vec();
        dir.next = if chunks.is_empty() { None } else { Some(segs[0]) };
        self.stream
            .write_block(dpos, &dir.encode().map_err(|e| AppFsError::malformed(dpos, e))?)?;

        for &leftover in old_segs.iter().skip(chunks.len()) {
            self.reset_block(leftover)?;
        }
        Ok(())
    }

    /// Rewrite a file's DATA-position table across its SEGINFO chain.
    /// Same publication order as the directory variant: continuations
    /// first, the FILEINFO block (which also carries the length) last.
    fn write_file_table(
        &mut self,
        fpos: BlockPos,
        file: &mut FileInfoNode,
        blocks: &[BlockPos],
        old_segs: &[BlockPos],
    ) -> Result<()> {
        let split = blocks.len().min(FILE_TABLE_SLOTS);
        let (inline, rest) = blocks.split_at(split);
        let chunks: Vec<&[BlockPos]> = rest.chunks(FILE_TABLE_SLOTS).collect();

        let mut segs = old_segs.to_vec();
        while segs.len() < chunks.len() {
            segs.push(self.allocate_block(BlockKind::SegInfo)?);
        }

        for (i, chunk) in chunks.iter().enumerate().rev() {
            let next = segs.get(i + 1).filter(|_| i + 1 < chunks.len()).copied();
            #[expect(clippy::cast_possible_truncation)] // chain length is bounded by table slots
            let seg = SegInfoNode::new_blocks(file.id, (i + 1) as u16, next, chunk)
                .map_err(|e| AppFsError::malformed(segs[i], e))?;
            self.stream
                .write_block(segs[i], &seg.encode().map_err(|e| AppFsError::malformed(segs[i], e))?)?;
        }

        file.blocks = inline.to_vec();
        file.next = if chunks.is_empty() { None } else { Some(segs[0]) };
        self.stream
            .write_block(fpos, &file.encode().map_err(|e| AppFsError::malformed(fpos, e))?)?;

        for &leftover in old_segs.iter().skip(chunks.len()) {
            self.reset_block(leftover)?;
        }
        Ok(())
    }
}
