#![forbid(unsafe_code)]
//! Block stream layer.
//!
//! `BlockStream` gives the engine positioned byte access to the image file
//! with a fixed block size: reads are exact-length, writes extend the file
//! to the next block boundary with zero fill so no write ever leaves a
//! partial block, and reading past the end latches an end-of-stream state
//! that stays set until [`BlockStream::clear`] is called.

use appfs_error::{AppFsError, Result};
use appfs_types::{BSIZE, BlockPos};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::trace;

/// Positioned I/O over the image file. Single-owner: only the engine holds
/// one, and all positions are absolute byte offsets.
#[derive(Debug)]
pub struct BlockStream {
    file: File,
    len: u64,
    eof: bool,
    writable: bool,
}

impl BlockStream {
    /// Open an existing image for read/write, falling back to read-only.
    ///
    /// Fails if the file cannot be opened or is shorter than one block.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        if len < BSIZE as u64 {
            return Err(AppFsError::Malformed {
                pos: BlockPos(0),
                detail: format!("image is {len} bytes, shorter than one block"),
            });
        }
        Ok(Self {
            file,
            len,
            eof: false,
            writable,
        })
    }

    /// Create a new, empty image file (truncating any existing one).
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self {
            file,
            len: 0,
            eof: false,
            writable: true,
        })
    }

    /// Current file length in bytes. Always a multiple of the block size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Number of whole blocks in the image.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.len / BSIZE as u64
    }

    /// Reset the latched end-of-stream state so reads may re-attempt.
    pub fn clear(&mut self) {
        self.eof = false;
    }

    /// Read exactly `buf.len()` bytes starting at `pos`.
    ///
    /// A read that would cross the end of the file fails with `Eof` and
    /// latches the end-of-stream state; further reads keep failing until
    /// [`Self::clear`] is called.
    pub fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        if self.eof {
            return Err(AppFsError::Eof);
        }
        let end = pos
            .checked_add(buf.len() as u64)
            .ok_or(AppFsError::Eof)?;
        if end > self.len {
            self.eof = true;
            return Err(AppFsError::Eof);
        }
        self.file.read_exact_at(buf, pos)?;
        Ok(())
    }

    /// Read one whole block at `pos`.
    pub fn read_block(&mut self, pos: BlockPos) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; BSIZE];
        self.read(pos.byte_offset(), &mut buf)?;
        Ok(buf)
    }

    /// Write `buf` at `pos`, extending the file if needed.
    ///
    /// A write that would cross the end of the file first extends the file
    /// to the next block boundary past the write, zero-filling the
    /// remainder, so the image never contains a partial block.
    pub fn write(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(AppFsError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        let end = pos
            .checked_add(buf.len() as u64)
            .ok_or(AppFsError::OutOfSpace)?;
        if end > self.len {
            let new_len = end.div_ceil(BSIZE as u64) * BSIZE as u64;
            trace!(
                target: "appfs::block",
                event = "extend",
                from = self.len,
                to = new_len
            );
            self.file
                .set_len(new_len)
                .map_err(|_| AppFsError::OutOfSpace)?;
            self.len = new_len;
        }
        self.file.write_all_at(buf, pos)?;
        Ok(())
    }

    /// Write one whole block at `pos`. `buf.len()` must equal the block size.
    pub fn write_block(&mut self, pos: BlockPos, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), BSIZE);
        debug_assert!(pos.is_aligned());
        self.write(pos.byte_offset(), buf)
    }

    /// Flush pending writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(BlockStream::open(dir.path().join("nope.img")).is_err());
    }

    #[test]
    fn open_short_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.img");
        std::fs::write(&path, b"tiny").unwrap();
        let err = BlockStream::open(&path).unwrap_err();
        assert!(matches!(err, AppFsError::Malformed { .. }));
    }

    #[test]
    fn write_extends_to_block_boundary() {
        let dir = tempdir().unwrap();
        let mut stream = BlockStream::create(dir.path().join("img")).unwrap();
        assert_eq!(stream.size(), 0);

        // A 10-byte write in the middle of block 2 pulls the file out to
        // the end of that block, zero-filled.
        stream.write(2 * BSIZE as u64 + 100, b"0123456789").unwrap();
        assert_eq!(stream.size(), 3 * BSIZE as u64);
        assert_eq!(stream.block_count(), 3);

        let block = stream.read_block(BlockPos(0)).unwrap();
        assert!(block.iter().all(|b| *b == 0));
        let block = stream.read_block(BlockPos(2 * BSIZE as u32)).unwrap();
        assert_eq!(&block[100..110], b"0123456789");
        assert!(block[110..].iter().all(|b| *b == 0));
    }

    #[test]
    fn eof_latches_until_cleared() {
        let dir = tempdir().unwrap();
        let mut stream = BlockStream::create(dir.path().join("img")).unwrap();
        stream.write(0, &[1_u8; BSIZE]).unwrap();

        let mut buf = [0_u8; 16];
        assert!(matches!(
            stream.read(BSIZE as u64, &mut buf),
            Err(AppFsError::Eof)
        ));
        // Latched: even an in-bounds read fails now.
        assert!(matches!(stream.read(0, &mut buf), Err(AppFsError::Eof)));

        stream.clear();
        stream.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1_u8; 16]);
    }

    #[test]
    fn reopen_sees_written_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img");
        {
            let mut stream = BlockStream::create(&path).unwrap();
            stream.write(0, &[7_u8; BSIZE]).unwrap();
            stream.sync().unwrap();
        }
        let mut stream = BlockStream::open(&path).unwrap();
        assert_eq!(stream.size(), BSIZE as u64);
        let block = stream.read_block(BlockPos(0)).unwrap();
        assert_eq!(block, vec![7_u8; BSIZE]);
    }
}
