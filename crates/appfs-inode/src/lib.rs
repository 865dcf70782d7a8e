#![forbid(unsafe_code)]
//! Typed block records.
//!
//! Every block in an AppFS image decodes into one of the [`INode`]
//! variants here, and every mutation goes back to disk through the
//! corresponding `encode`. The byte layouts are fixed: a common header
//! (tag u16 at offset 0, inode id u16 at offset 2), type-specific fields,
//! and a packed zero-terminated table or payload starting at
//! `HSIZE_FILE`. All multibyte fields are little-endian.

use appfs_types::{
    BSIZE, BlockKind, BlockPos, DATA_CAPACITY, DIR_TABLE_SLOTS, FILE_TABLE_SLOTS, FREELIST_SLOTS,
    HSIZE_FILE, InodeId, ParseError, read_fixed_str, read_le_u16, read_le_u32, write_fixed_str,
    write_le_u16, write_le_u32,
};
use serde::Serialize;

// ── Field offsets ───────────────────────────────────────────────────────────

const OFF_TAG: usize = 0;
const OFF_INODE_ID: usize = 2;
const OFF_PARENT: usize = 4;
const OFF_NEXT: usize = 6;

const DIR_OFF_NAME: usize = 10;
/// Widest name a directory, symlink, or device inode can carry.
pub const DIR_NAME_LEN: usize = HSIZE_FILE - DIR_OFF_NAME;

const FILE_OFF_LENGTH: usize = 10;
const FILE_OFF_NAME: usize = 14;
/// Widest name a file inode can carry.
pub const FILE_NAME_LEN: usize = HSIZE_FILE - FILE_OFF_NAME;

const SEG_OFF_SEQ: usize = 4;

const SYM_OFF_TARGET: usize = HSIZE_FILE;
/// Widest target path a symbolic link can carry.
pub const SYMLINK_TARGET_LEN: usize = 1024;

const DEV_OFF_MAJOR: usize = HSIZE_FILE;
const DEV_OFF_MINOR: usize = HSIZE_FILE + 4;

const DATA_OFF_LEN: usize = 4;

// FSINFO field table.
const FSI_OFF_NAME: usize = 4;
const FSI_NAME_LEN: usize = 10;
const FSI_OFF_VER_MAJOR: usize = 14;
const FSI_OFF_VER_MINOR: usize = 16;
const FSI_OFF_VER_REVISION: usize = 18;
const FSI_OFF_APP_NAME: usize = 20;
const FSI_APP_NAME_LEN: usize = 256;
const FSI_OFF_APP_VERSION: usize = 276;
const FSI_APP_VERSION_LEN: usize = 32;
const FSI_OFF_APP_DESC: usize = 308;
const FSI_APP_DESC_LEN: usize = 1024;
const FSI_OFF_APP_AUTHOR: usize = 1332;
const FSI_APP_AUTHOR_LEN: usize = 256;
const FSI_OFF_POS_ROOT: usize = 1588;
const FSI_OFF_POS_FREELIST: usize = 1592;

fn fresh_block(kind: BlockKind, id: InodeId) -> Vec<u8> {
    let mut buf = vec![0_u8; BSIZE];
    // A zeroed buffer cannot fail these writes.
    write_le_u16(&mut buf, OFF_TAG, kind.tag()).expect("header fits");
    write_le_u16(&mut buf, OFF_INODE_ID, id.0).expect("header fits");
    buf
}

fn decode_nonzero_pos(raw: u32, field: &'static str) -> Result<BlockPos, ParseError> {
    let pos = BlockPos(raw);
    if !pos.is_aligned() {
        return Err(ParseError::InvalidField {
            field,
            reason: "position is not block-aligned",
        });
    }
    Ok(pos)
}

fn decode_pos(raw: u32, field: &'static str) -> Result<Option<BlockPos>, ParseError> {
    if raw == 0 {
        return Ok(None);
    }
    decode_nonzero_pos(raw, field).map(Some)
}

// ── Filesystem info ─────────────────────────────────────────────────────────

/// The singleton header inode at position 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsInfoNode {
    pub fs_name: String,
    pub ver_major: u16,
    pub ver_minor: u16,
    pub ver_revision: u16,
    pub app_name: String,
    pub app_version: String,
    pub app_description: String,
    pub app_author: String,
    pub pos_root: BlockPos,
    pub pos_freelist: BlockPos,
}

impl FsInfoNode {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            fs_name: read_fixed_str(buf, FSI_OFF_NAME, FSI_NAME_LEN)?,
            ver_major: read_le_u16(buf, FSI_OFF_VER_MAJOR)?,
            ver_minor: read_le_u16(buf, FSI_OFF_VER_MINOR)?,
            ver_revision: read_le_u16(buf, FSI_OFF_VER_REVISION)?,
            app_name: read_fixed_str(buf, FSI_OFF_APP_NAME, FSI_APP_NAME_LEN)?,
            app_version: read_fixed_str(buf, FSI_OFF_APP_VERSION, FSI_APP_VERSION_LEN)?,
            app_description: read_fixed_str(buf, FSI_OFF_APP_DESC, FSI_APP_DESC_LEN)?,
            app_author: read_fixed_str(buf, FSI_OFF_APP_AUTHOR, FSI_APP_AUTHOR_LEN)?,
            pos_root: BlockPos(read_le_u32(buf, FSI_OFF_POS_ROOT)?),
            pos_freelist: BlockPos(read_le_u32(buf, FSI_OFF_POS_FREELIST)?),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut buf = fresh_block(BlockKind::FsInfo, InodeId(0));
        write_fixed_str(&mut buf, FSI_OFF_NAME, FSI_NAME_LEN, &self.fs_name)?;
        write_le_u16(&mut buf, FSI_OFF_VER_MAJOR, self.ver_major)?;
        write_le_u16(&mut buf, FSI_OFF_VER_MINOR, self.ver_minor)?;
        write_le_u16(&mut buf, FSI_OFF_VER_REVISION, self.ver_revision)?;
        write_fixed_str(&mut buf, FSI_OFF_APP_NAME, FSI_APP_NAME_LEN, &self.app_name)?;
        write_fixed_str(
            &mut buf,
            FSI_OFF_APP_VERSION,
            FSI_APP_VERSION_LEN,
            &self.app_version,
        )?;
        write_fixed_str(
            &mut buf,
            FSI_OFF_APP_DESC,
            FSI_APP_DESC_LEN,
            &self.app_description,
        )?;
        write_fixed_str(
            &mut buf,
            FSI_OFF_APP_AUTHOR,
            FSI_APP_AUTHOR_LEN,
            &self.app_author,
        )?;
        write_le_u32(&mut buf, FSI_OFF_POS_ROOT, self.pos_root.0)?;
        write_le_u32(&mut buf, FSI_OFF_POS_FREELIST, self.pos_freelist.0)?;
        Ok(buf)
    }
}

// ── Directory ───────────────────────────────────────────────────────────────

/// Directory inode: header plus a packed table of child inode ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    pub id: InodeId,
    pub parent: InodeId,
    /// First SEGINFO continuation of the child table, if any.
    pub next: Option<BlockPos>,
    pub name: String,
    pub children: Vec<InodeId>,
}

impl DirectoryNode {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let mut children = Vec::new();
        for slot in 0..DIR_TABLE_SLOTS {
            let raw = read_le_u16(buf, HSIZE_FILE + slot * 2)?;
            if raw == 0 {
                break;
            }
            children.push(InodeId(raw));
        }
        Ok(Self {
            id: InodeId(read_le_u16(buf, OFF_INODE_ID)?),
            parent: InodeId(read_le_u16(buf, OFF_PARENT)?),
            next: decode_pos(read_le_u32(buf, OFF_NEXT)?, "pos_next")?,
            name: read_fixed_str(buf, DIR_OFF_NAME, DIR_NAME_LEN)?,
            children,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        if self.children.len() > DIR_TABLE_SLOTS {
            return Err(ParseError::InvalidField {
                field: "children",
                reason: "more entries than the table holds",
            });
        }
        let mut buf = fresh_block(BlockKind::Directory, self.id);
        write_le_u16(&mut buf, OFF_PARENT, self.parent.0)?;
        write_le_u32(&mut buf, OFF_NEXT, self.next.map_or(0, |p| p.0))?;
        write_fixed_str(&mut buf, DIR_OFF_NAME, DIR_NAME_LEN, &self.name)?;
        for (slot, child) in self.children.iter().enumerate() {
            if child.0 == 0 {
                return Err(ParseError::InvalidField {
                    field: "children",
                    reason: "zero child id inside the table",
                });
            }
            write_le_u16(&mut buf, HSIZE_FILE + slot * 2, child.0)?;
        }
        Ok(buf)
    }
}

// ── File info ───────────────────────────────────────────────────────────────

/// Regular-file inode: header plus a packed table of DATA-block positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfoNode {
    pub id: InodeId,
    pub parent: InodeId,
    /// First SEGINFO continuation of the block table, if any.
    pub next: Option<BlockPos>,
    pub length: u32,
    pub name: String,
    pub blocks: Vec<BlockPos>,
}

impl FileInfoNode {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let mut blocks = Vec::new();
        for slot in 0..FILE_TABLE_SLOTS {
            let raw = read_le_u32(buf, HSIZE_FILE + slot * 4)?;
            if raw == 0 {
                break;
            }
            blocks.push(decode_nonzero_pos(raw, "data position")?);
        }
        Ok(Self {
            id: InodeId(read_le_u16(buf, OFF_INODE_ID)?),
            parent: InodeId(read_le_u16(buf, OFF_PARENT)?),
            next: decode_pos(read_le_u32(buf, OFF_NEXT)?, "pos_next")?,
            length: read_le_u32(buf, FILE_OFF_LENGTH)?,
            name: read_fixed_str(buf, FILE_OFF_NAME, FILE_NAME_LEN)?,
            blocks,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        if self.blocks.len() > FILE_TABLE_SLOTS {
            return Err(ParseError::InvalidField {
                field: "blocks",
                reason: "more entries than the table holds",
            });
        }
        let mut buf = fresh_block(BlockKind::FileInfo, self.id);
        write_le_u16(&mut buf, OFF_PARENT, self.parent.0)?;
        write_le_u32(&mut buf, OFF_NEXT, self.next.map_or(0, |p| p.0))?;
        write_le_u32(&mut buf, FILE_OFF_LENGTH, self.length)?;
        write_fixed_str(&mut buf, FILE_OFF_NAME, FILE_NAME_LEN, &self.name)?;
        for (slot, pos) in self.blocks.iter().enumerate() {
            if pos.0 == 0 {
                return Err(ParseError::InvalidField {
                    field: "blocks",
                    reason: "zero position inside the table",
                });
            }
            write_le_u32(&mut buf, HSIZE_FILE + slot * 4, pos.0)?;
        }
        Ok(buf)
    }
}

// ── Segment info ────────────────────────────────────────────────────────────

/// Continuation of an owner inode's packed table.
///
/// The table region is kept raw because its entry width depends on the
/// owner: uint32 DATA positions for a FILEINFO chain, uint16 child ids for
/// a DIRECTORY chain. The engine knows the owner's kind and picks the
/// matching accessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegInfoNode {
    /// Inode id of the FILEINFO or DIRECTORY this block continues.
    pub owner: InodeId,
    /// 1-based position of this block in the owner's chain.
    pub seq: u16,
    pub next: Option<BlockPos>,
    table: Vec<u8>,
}

impl SegInfoNode {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let table = appfs_types::ensure_slice(buf, HSIZE_FILE, BSIZE - HSIZE_FILE)?.to_vec();
        Ok(Self {
            owner: InodeId(read_le_u16(buf, OFF_INODE_ID)?),
            seq: read_le_u16(buf, SEG_OFF_SEQ)?,
            next: decode_pos(read_le_u32(buf, OFF_NEXT)?, "pos_next")?,
            table,
        })
    }

    /// Build a continuation of a FILEINFO block table.
    pub fn new_blocks(
        owner: InodeId,
        seq: u16,
        next: Option<BlockPos>,
        blocks: &[BlockPos],
    ) -> Result<Self, ParseError> {
        if blocks.len() > FILE_TABLE_SLOTS {
            return Err(ParseError::InvalidField {
                field: "blocks",
                reason: "more entries than the table holds",
            });
        }
        let mut table = vec![0_u8; BSIZE - HSIZE_FILE];
        for (slot, pos) in blocks.iter().enumerate() {
            if pos.0 == 0 {
                return Err(ParseError::InvalidField {
                    field: "blocks",
                    reason: "zero position inside the table",
                });
            }
            write_le_u32(&mut table, slot * 4, pos.0)?;
        }
        Ok(Self {
            owner,
            seq,
            next,
            table,
        })
    }

    /// Build a continuation of a DIRECTORY child table.
    pub fn new_children(
        owner: InodeId,
        seq: u16,
        next: Option<BlockPos>,
        children: &[InodeId],
    ) -> Result<Self, ParseError> {
        if children.len() > DIR_TABLE_SLOTS {
            return Err(ParseError::InvalidField {
                field: "children",
                reason: "more entries than the table holds",
            });
        }
        let mut table = vec![0_u8; BSIZE - HSIZE_FILE];
        for (slot, child) in children.iter().enumerate() {
            if child.0 == 0 {
                return Err(ParseError::InvalidField {
                    field: "children",
                    reason: "zero child id inside the table",
                });
            }
            write_le_u16(&mut table, slot * 2, child.0)?;
        }
        Ok(Self {
            owner,
            seq,
            next,
            table,
        })
    }

    /// Table entries read as uint32 DATA positions (FILEINFO chains).
    pub fn block_entries(&self) -> Result<Vec<BlockPos>, ParseError> {
        let mut blocks = Vec::new();
        for slot in 0..FILE_TABLE_SLOTS {
            let raw = read_le_u32(&self.table, slot * 4)?;
            if raw == 0 {
                break;
            }
            blocks.push(decode_nonzero_pos(raw, "data position")?);
        }
        Ok(blocks)
    }

    /// Table entries read as uint16 child ids (DIRECTORY chains).
    pub fn child_entries(&self) -> Result<Vec<InodeId>, ParseError> {
        let mut children = Vec::new();
        for slot in 0..DIR_TABLE_SLOTS {
            let raw = read_le_u16(&self.table, slot * 2)?;
            if raw == 0 {
                break;
            }
            children.push(InodeId(raw));
        }
        Ok(children)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut buf = fresh_block(BlockKind::SegInfo, self.owner);
        write_le_u16(&mut buf, SEG_OFF_SEQ, self.seq)?;
        write_le_u32(&mut buf, OFF_NEXT, self.next.map_or(0, |p| p.0))?;
        buf[HSIZE_FILE..].copy_from_slice(&self.table);
        Ok(buf)
    }
}

// ── Symbolic link ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkNode {
    pub id: InodeId,
    pub parent: InodeId,
    pub name: String,
    pub target: String,
}

impl SymlinkNode {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            id: InodeId(read_le_u16(buf, OFF_INODE_ID)?),
            parent: InodeId(read_le_u16(buf, OFF_PARENT)?),
            name: read_fixed_str(buf, DIR_OFF_NAME, DIR_NAME_LEN)?,
            target: read_fixed_str(buf, SYM_OFF_TARGET, SYMLINK_TARGET_LEN)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut buf = fresh_block(BlockKind::Symlink, self.id);
        write_le_u16(&mut buf, OFF_PARENT, self.parent.0)?;
        write_fixed_str(&mut buf, DIR_OFF_NAME, DIR_NAME_LEN, &self.name)?;
        write_fixed_str(&mut buf, SYM_OFF_TARGET, SYMLINK_TARGET_LEN, &self.target)?;
        Ok(buf)
    }
}

// ── Device ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    pub id: InodeId,
    pub parent: InodeId,
    pub name: String,
    pub dev_major: u32,
    pub dev_minor: u32,
}

impl DeviceNode {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            id: InodeId(read_le_u16(buf, OFF_INODE_ID)?),
            parent: InodeId(read_le_u16(buf, OFF_PARENT)?),
            name: read_fixed_str(buf, DIR_OFF_NAME, DIR_NAME_LEN)?,
            dev_major: read_le_u32(buf, DEV_OFF_MAJOR)?,
            dev_minor: read_le_u32(buf, DEV_OFF_MINOR)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut buf = fresh_block(BlockKind::Device, self.id);
        write_le_u16(&mut buf, OFF_PARENT, self.parent.0)?;
        write_fixed_str(&mut buf, DIR_OFF_NAME, DIR_NAME_LEN, &self.name)?;
        write_le_u32(&mut buf, DEV_OFF_MAJOR, self.dev_major)?;
        write_le_u32(&mut buf, DEV_OFF_MINOR, self.dev_minor)?;
        Ok(buf)
    }
}

// ── Data ────────────────────────────────────────────────────────────────────

/// Raw file payload. The declared payload length lives in the header so a
/// file's length is recomputable from its chain alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNode {
    pub payload: Vec<u8>,
}

impl DataNode {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let len = usize::from(read_le_u16(buf, DATA_OFF_LEN)?);
        if len > DATA_CAPACITY {
            return Err(ParseError::InvalidField {
                field: "payload_len",
                reason: "exceeds block payload capacity",
            });
        }
        let payload = appfs_types::ensure_slice(buf, HSIZE_FILE, len)?.to_vec();
        Ok(Self { payload })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        if self.payload.len() > DATA_CAPACITY {
            return Err(ParseError::InvalidField {
                field: "payload",
                reason: "exceeds block payload capacity",
            });
        }
        let mut buf = fresh_block(BlockKind::Data, InodeId(0));
        #[expect(clippy::cast_possible_truncation)] // capacity fits in u16
        write_le_u16(&mut buf, DATA_OFF_LEN, self.payload.len() as u16)?;
        buf[HSIZE_FILE..HSIZE_FILE + self.payload.len()].copy_from_slice(&self.payload);
        Ok(buf)
    }
}

// ── Freelist ────────────────────────────────────────────────────────────────

/// One bucket of the freelist chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreelistNode {
    pub next: Option<BlockPos>,
    pub entries: Vec<BlockPos>,
}

impl FreelistNode {
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let mut entries = Vec::new();
        for slot in 0..FREELIST_SLOTS {
            let raw = read_le_u32(buf, HSIZE_FILE + slot * 4)?;
            if raw == 0 {
                break;
            }
            entries.push(decode_nonzero_pos(raw, "freelist entry")?);
        }
        Ok(Self {
            next: decode_pos(read_le_u32(buf, OFF_NEXT)?, "pos_next")?,
            entries,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        if self.entries.len() > FREELIST_SLOTS {
            return Err(ParseError::InvalidField {
                field: "entries",
                reason: "more entries than the bucket holds",
            });
        }
        let mut buf = fresh_block(BlockKind::Freelist, InodeId(0));
        write_le_u32(&mut buf, OFF_NEXT, self.next.map_or(0, |p| p.0))?;
        for (slot, pos) in self.entries.iter().enumerate() {
            if pos.0 == 0 {
                return Err(ParseError::InvalidField {
                    field: "entries",
                    reason: "zero position inside the bucket",
                });
            }
            write_le_u32(&mut buf, HSIZE_FILE + slot * 4, pos.0)?;
        }
        Ok(buf)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= FREELIST_SLOTS
    }
}

// ── The sum type ────────────────────────────────────────────────────────────

/// A decoded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum INode {
    FsInfo(FsInfoNode),
    Directory(DirectoryNode),
    FileInfo(FileInfoNode),
    SegInfo(SegInfoNode),
    Symlink(SymlinkNode),
    Device(DeviceNode),
    Data(DataNode),
    Freelist(FreelistNode),
    Temporary,
    Free,
    Unset,
    Invalid,
}

impl INode {
    /// Decode a whole block. Fails on tags outside the closed set and on
    /// self-inconsistent fields.
    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < BSIZE {
            return Err(ParseError::InsufficientData {
                needed: BSIZE,
                offset: 0,
                actual: buf.len(),
            });
        }
        let tag = read_le_u16(buf, OFF_TAG)?;
        let kind = BlockKind::from_tag(tag).ok_or(ParseError::UnknownTag { tag })?;
        Ok(match kind {
            BlockKind::FsInfo => Self::FsInfo(FsInfoNode::decode(buf)?),
            BlockKind::Directory => Self::Directory(DirectoryNode::decode(buf)?),
            BlockKind::FileInfo => Self::FileInfo(FileInfoNode::decode(buf)?),
            BlockKind::SegInfo => Self::SegInfo(SegInfoNode::decode(buf)?),
            BlockKind::Symlink => Self::Symlink(SymlinkNode::decode(buf)?),
            BlockKind::Device => Self::Device(DeviceNode::decode(buf)?),
            BlockKind::Data => Self::Data(DataNode::decode(buf)?),
            BlockKind::Freelist => Self::Freelist(FreelistNode::decode(buf)?),
            BlockKind::Temporary => Self::Temporary,
            BlockKind::Free => Self::Free,
            BlockKind::Unset => Self::Unset,
            BlockKind::Invalid => Self::Invalid,
        })
    }

    #[must_use]
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::FsInfo(_) => BlockKind::FsInfo,
            Self::Directory(_) => BlockKind::Directory,
            Self::FileInfo(_) => BlockKind::FileInfo,
            Self::SegInfo(_) => BlockKind::SegInfo,
            Self::Symlink(_) => BlockKind::Symlink,
            Self::Device(_) => BlockKind::Device,
            Self::Data(_) => BlockKind::Data,
            Self::Freelist(_) => BlockKind::Freelist,
            Self::Temporary => BlockKind::Temporary,
            Self::Free => BlockKind::Free,
            Self::Unset => BlockKind::Unset,
            Self::Invalid => BlockKind::Invalid,
        }
    }

    /// The inode's own id, for the block types that carry one.
    #[must_use]
    pub fn inode_id(&self) -> Option<InodeId> {
        match self {
            Self::Directory(d) => Some(d.id),
            Self::FileInfo(f) => Some(f.id),
            Self::Symlink(s) => Some(s.id),
            Self::Device(d) => Some(d.id),
            _ => None,
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<InodeId> {
        match self {
            Self::Directory(d) => Some(d.parent),
            Self::FileInfo(f) => Some(f.parent),
            Self::Symlink(s) => Some(s.parent),
            Self::Device(d) => Some(d.parent),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Directory(d) => Some(&d.name),
            Self::FileInfo(f) => Some(&f.name),
            Self::Symlink(s) => Some(&s.name),
            Self::Device(d) => Some(&d.name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_round_trip() {
        let dir = DirectoryNode {
            id: InodeId(7),
            parent: InodeId(0),
            next: None,
            name: "bin".to_owned(),
            children: vec![InodeId(8), InodeId(9), InodeId(300)],
        };
        let buf = dir.encode().unwrap();
        assert_eq!(buf.len(), BSIZE);
        match INode::decode(&buf).unwrap() {
            INode::Directory(back) => assert_eq!(back, dir),
            other => panic!("decoded {:?}", other.kind()),
        }
    }

    #[test]
    fn fileinfo_round_trip() {
        let file = FileInfoNode {
            id: InodeId(3),
            parent: InodeId(0),
            next: Some(BlockPos(5 * BSIZE as u32)),
            length: 10,
            name: "EntryPoint".to_owned(),
            blocks: vec![BlockPos(4 * BSIZE as u32)],
        };
        let buf = file.encode().unwrap();
        match INode::decode(&buf).unwrap() {
            INode::FileInfo(back) => assert_eq!(back, file),
            other => panic!("decoded {:?}", other.kind()),
        }
    }

    #[test]
    fn seginfo_round_trips_both_widths() {
        let blocks: Vec<BlockPos> = (1..=5).map(|i| BlockPos(i * BSIZE as u32)).collect();
        let seg = SegInfoNode::new_blocks(InodeId(3), 1, None, &blocks).unwrap();
        let buf = seg.encode().unwrap();
        match INode::decode(&buf).unwrap() {
            INode::SegInfo(back) => {
                assert_eq!(back.owner, InodeId(3));
                assert_eq!(back.seq, 1);
                assert_eq!(back.block_entries().unwrap(), blocks);
            }
            other => panic!("decoded {:?}", other.kind()),
        }

        let children: Vec<InodeId> = (10..20).map(InodeId).collect();
        let seg = SegInfoNode::new_children(InodeId(2), 2, Some(BlockPos(8192)), &children)
            .unwrap();
        let back = SegInfoNode::decode(&seg.encode().unwrap()).unwrap();
        assert_eq!(back.child_entries().unwrap(), children);
        assert_eq!(back.next, Some(BlockPos(8192)));
    }

    #[test]
    fn symlink_and_device_round_trip() {
        let link = SymlinkNode {
            id: InodeId(11),
            parent: InodeId(7),
            name: "current".to_owned(),
            target: "/versions/1.0.0".to_owned(),
        };
        let back = SymlinkNode::decode(&link.encode().unwrap()).unwrap();
        assert_eq!(back, link);

        let dev = DeviceNode {
            id: InodeId(12),
            parent: InodeId(7),
            name: "null".to_owned(),
            dev_major: 1,
            dev_minor: 3,
        };
        let back = DeviceNode::decode(&dev.encode().unwrap()).unwrap();
        assert_eq!(back, dev);
    }

    #[test]
    fn data_payload_length_is_declared() {
        let data = DataNode {
            payload: b"#!/bin/sh\n".to_vec(),
        };
        let buf = data.encode().unwrap();
        assert_eq!(read_le_u16(&buf, DATA_OFF_LEN).unwrap(), 10);
        let back = DataNode::decode(&buf).unwrap();
        assert_eq!(back.payload, b"#!/bin/sh\n");

        let full = DataNode {
            payload: vec![0xAA; DATA_CAPACITY],
        };
        let back = DataNode::decode(&full.encode().unwrap()).unwrap();
        assert_eq!(back.payload.len(), DATA_CAPACITY);

        let over = DataNode {
            payload: vec![0; DATA_CAPACITY + 1],
        };
        assert!(over.encode().is_err());
    }

    #[test]
    fn freelist_round_trip() {
        let bucket = FreelistNode {
            next: None,
            entries: vec![BlockPos(3 * BSIZE as u32), BlockPos(9 * BSIZE as u32)],
        };
        let back = FreelistNode::decode(&bucket.encode().unwrap()).unwrap();
        assert_eq!(back, bucket);
        assert!(!back.is_full());
    }

    #[test]
    fn fsinfo_round_trip() {
        let info = FsInfoNode {
            fs_name: "AppFS".to_owned(),
            ver_major: 0,
            ver_minor: 1,
            ver_revision: 0,
            app_name: "Test Application".to_owned(),
            app_version: "1.0.0".to_owned(),
            app_description: "A test package.".to_owned(),
            app_author: "AppTools".to_owned(),
            pos_root: BlockPos(BSIZE as u32),
            pos_freelist: BlockPos(2 * BSIZE as u32),
        };
        let buf = info.encode().unwrap();
        // Spot-check the fixed field table from the format definition.
        assert_eq!(read_le_u16(&buf, 14).unwrap(), 0);
        assert_eq!(read_le_u16(&buf, 16).unwrap(), 1);
        assert_eq!(read_le_u32(&buf, 1588).unwrap(), BSIZE as u32);
        assert_eq!(read_le_u32(&buf, 1592).unwrap(), 2 * BSIZE as u32);
        match INode::decode(&buf).unwrap() {
            INode::FsInfo(back) => assert_eq!(back, info),
            other => panic!("decoded {:?}", other.kind()),
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut buf = vec![0_u8; BSIZE];
        buf[0] = 0xAB;
        buf[1] = 0xCD;
        assert!(matches!(
            INode::decode(&buf),
            Err(ParseError::UnknownTag { tag: 0xCDAB })
        ));
    }

    #[test]
    fn zeroed_block_is_unset() {
        let buf = vec![0_u8; BSIZE];
        assert_eq!(INode::decode(&buf).unwrap(), INode::Unset);
    }

    #[test]
    fn name_too_long_rejected_at_encode() {
        let dir = DirectoryNode {
            id: InodeId(1),
            parent: InodeId(0),
            next: None,
            name: "x".repeat(DIR_NAME_LEN + 1),
            children: Vec::new(),
        };
        assert!(dir.encode().is_err());
    }
}
