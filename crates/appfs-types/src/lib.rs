#![forbid(unsafe_code)]
//! Shared on-disk types for AppFS.
//!
//! Defines the image geometry constants, the block-type taxonomy, the
//! `BlockPos`/`InodeId` newtypes, and the little-endian field codec every
//! other crate uses to touch the image. No crate reads a multibyte field
//! from disk except through the helpers here.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of every block in the image, in bytes.
pub const BSIZE: usize = 4096;

/// Reserved header region at the start of every non-FSINFO typed block.
/// Table and payload regions begin at this offset.
pub const HSIZE_FILE: usize = 256;

/// Payload capacity of a single DATA block.
pub const DATA_CAPACITY: usize = BSIZE - HSIZE_FILE;

/// Entries per FREELIST bucket (uint32 positions).
pub const FREELIST_SLOTS: usize = (BSIZE - HSIZE_FILE) / 4;

/// DATA-position entries per FILEINFO or SEGINFO index table (uint32 each).
pub const FILE_TABLE_SLOTS: usize = (BSIZE - HSIZE_FILE) / 4;

/// Child-id entries per DIRECTORY block or directory SEGINFO (uint16 each).
pub const DIR_TABLE_SLOTS: usize = (BSIZE - HSIZE_FILE) / 2;

/// Position of the singleton filesystem-info block.
pub const OFFSET_FSINFO: BlockPos = BlockPos(0);

// ── Block-type taxonomy ─────────────────────────────────────────────────────

/// Every block carries one of these tags at offset 0 (uint16, little-endian).
///
/// Tag values are chosen so a zero-filled (never-written) block decodes as
/// `Unset`, and freeing a block is an explicit re-tag to `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Unset,
    FsInfo,
    Directory,
    FileInfo,
    SegInfo,
    Data,
    Symlink,
    Device,
    Temporary,
    Freelist,
    Free,
    Invalid,
}

impl BlockKind {
    /// Decode a raw tag. Returns `None` for tags outside the closed set.
    #[must_use]
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(Self::Unset),
            1 => Some(Self::FsInfo),
            2 => Some(Self::Directory),
            3 => Some(Self::FileInfo),
            4 => Some(Self::SegInfo),
            5 => Some(Self::Data),
            6 => Some(Self::Symlink),
            7 => Some(Self::Device),
            8 => Some(Self::Temporary),
            9 => Some(Self::Freelist),
            10 => Some(Self::Free),
            11 => Some(Self::Invalid),
            _ => None,
        }
    }

    #[must_use]
    pub fn tag(self) -> u16 {
        match self {
            Self::Unset => 0,
            Self::FsInfo => 1,
            Self::Directory => 2,
            Self::FileInfo => 3,
            Self::SegInfo => 4,
            Self::Data => 5,
            Self::Symlink => 6,
            Self::Device => 7,
            Self::Temporary => 8,
            Self::Freelist => 9,
            Self::Free => 10,
            Self::Invalid => 11,
        }
    }

    /// Single-character glyph used by the inspector's segment map.
    #[must_use]
    pub fn glyph(self) -> char {
        match self {
            Self::Unset => ' ',
            Self::FsInfo => 'I',
            Self::Directory | Self::Device => 'D',
            Self::FileInfo => 'F',
            Self::SegInfo => 'S',
            Self::Data => '#',
            Self::Symlink => 'L',
            Self::Temporary => 'T',
            Self::Freelist => '%',
            Self::Free => '_',
            Self::Invalid => '?',
        }
    }

    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::FsInfo => "filesystem info",
            Self::Directory => "directory",
            Self::FileInfo => "file info",
            Self::SegInfo => "segment info",
            Self::Data => "data",
            Self::Symlink => "symbolic link",
            Self::Device => "device",
            Self::Temporary => "temporary data",
            Self::Freelist => "freelist block",
            Self::Free => "free",
            Self::Invalid => "invalid",
        }
    }

    /// True for the block types that carry their own live inode id and
    /// therefore participate in the id-to-position map.
    #[must_use]
    pub fn has_inode_id(self) -> bool {
        matches!(
            self,
            Self::Directory | Self::FileInfo | Self::Symlink | Self::Device
        )
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

// ── Position and id newtypes ────────────────────────────────────────────────

/// Absolute byte offset of a block within the image. Always block-aligned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BlockPos(pub u32);

impl BlockPos {
    /// Position of the block `index` blocks into the image.
    #[must_use]
    pub fn from_index(index: u32) -> Option<Self> {
        index.checked_mul(BSIZE as u32).map(Self)
    }

    /// Zero-based block index of this position.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0 / BSIZE as u32
    }

    /// Position of the following block.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(BSIZE as u32).map(Self)
    }

    #[must_use]
    pub fn is_aligned(self) -> bool {
        self.0 % BSIZE as u32 == 0
    }

    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a live inode. Id 0 is reserved for the root directory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct InodeId(pub u16);

impl InodeId {
    pub const ROOT: Self = Self(0);
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Field codec ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("unknown block tag {tag:#06x}")]
    UnknownTag { tag: u16 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Read a fixed-width NUL-padded string field. Stops at the first NUL.
pub fn read_fixed_str(data: &[u8], offset: usize, len: usize) -> Result<String, ParseError> {
    let bytes = ensure_slice(data, offset, len)?;
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Write a string into a fixed-width NUL-padded field.
///
/// Fails if `value` does not fit; the field is zeroed before writing so a
/// shorter value never leaves stale tail bytes behind.
pub fn write_fixed_str(
    data: &mut [u8],
    offset: usize,
    len: usize,
    value: &str,
) -> Result<(), ParseError> {
    let field = ensure_slice_mut(data, offset, len)?;
    let bytes = value.as_bytes();
    if bytes.len() > len {
        return Err(ParseError::InvalidField {
            field: "string",
            reason: "value longer than field",
        });
    }
    field.fill(0);
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip_closed_set() {
        for tag in 0..=11 {
            let kind = BlockKind::from_tag(tag).expect("known tag");
            assert_eq!(kind.tag(), tag);
        }
        assert_eq!(BlockKind::from_tag(12), None);
        assert_eq!(BlockKind::from_tag(0xABCD), None);
    }

    #[test]
    fn zeroed_block_reads_unset() {
        let block = [0_u8; BSIZE];
        let tag = read_le_u16(&block, 0).unwrap();
        assert_eq!(BlockKind::from_tag(tag), Some(BlockKind::Unset));
    }

    #[test]
    fn id_bearing_kinds() {
        assert!(BlockKind::Directory.has_inode_id());
        assert!(BlockKind::FileInfo.has_inode_id());
        assert!(BlockKind::Symlink.has_inode_id());
        assert!(BlockKind::Device.has_inode_id());
        assert!(!BlockKind::SegInfo.has_inode_id());
        assert!(!BlockKind::Data.has_inode_id());
        assert!(!BlockKind::Freelist.has_inode_id());
        assert!(!BlockKind::FsInfo.has_inode_id());
    }

    #[test]
    fn block_pos_math() {
        assert_eq!(BlockPos::from_index(0), Some(BlockPos(0)));
        assert_eq!(BlockPos::from_index(2), Some(BlockPos(8192)));
        assert_eq!(BlockPos(8192).index(), 2);
        assert_eq!(BlockPos(0).next(), Some(BlockPos(4096)));
        assert!(BlockPos(4096).is_aligned());
        assert!(!BlockPos(4097).is_aligned());
        assert_eq!(BlockPos(u32::MAX - 100).next(), None);
    }

    #[test]
    fn le_round_trips() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 1, 0x1234).unwrap();
        write_le_u32(&mut buf, 4, 0xDEAD_BEEF).unwrap();
        write_le_u64(&mut buf, 8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(read_le_u16(&buf, 1).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&buf, 4).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 8).unwrap(), 0x0102_0304_0506_0708);

        assert!(matches!(
            read_le_u32(&buf, 14),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn fixed_str_round_trip() {
        let mut buf = [0xFF_u8; 16];
        write_fixed_str(&mut buf, 2, 10, "EntryPoint").unwrap();
        assert_eq!(read_fixed_str(&buf, 2, 10).unwrap(), "EntryPoint");

        write_fixed_str(&mut buf, 2, 10, "sh").unwrap();
        assert_eq!(read_fixed_str(&buf, 2, 10).unwrap(), "sh");
        // Field is re-zeroed, not merely overwritten.
        assert_eq!(buf[5], 0);

        assert!(write_fixed_str(&mut buf, 2, 4, "too long").is_err());
    }

    #[test]
    fn geometry_constants() {
        assert_eq!(DATA_CAPACITY, 3840);
        assert_eq!(FREELIST_SLOTS, 960);
        assert_eq!(FILE_TABLE_SLOTS, 960);
        assert_eq!(DIR_TABLE_SLOTS, 1920);
    }
}
