//! Reachability and repair.
//!
//! The walk starts at the root directory and computes two sets: header
//! blocks (directories, file infos, their segment chains, symlinks,
//! devices) and data blocks (everything a reached index table lists).
//! The clean pass then scans the image linearly and reclaims the
//! unreachable block types that are safe to reclaim; orphan SEGINFO and
//! DATA blocks are counted but left in place, since they point at
//! structural corruption rather than ordinary garbage.

use crate::Fs;
use appfs_error::{AppFsError, Result};
use appfs_inode::INode;
use appfs_types::{BSIZE, BlockKind, BlockPos};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::{info, warn};

/// Result of the reachability walk.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Reachability {
    /// Reached DIRECTORY, FILEINFO, SEGINFO, SYMLINK, and DEVICE blocks.
    pub headers: BTreeSet<BlockPos>,
    /// DATA blocks listed by reached index tables.
    pub data: BTreeSet<BlockPos>,
    /// Blocks that failed to decode during the walk; counted, skipped.
    pub malformed_blocks: u64,
    /// Child ids in reached directories that resolve to nothing.
    pub missing_children: u64,
}

impl Reachability {
    /// True iff `pos` is in the live set.
    #[must_use]
    pub fn is_live(&self, pos: BlockPos) -> bool {
        self.headers.contains(&pos) || self.data.contains(&pos)
    }
}

/// Per-class counters from the clean pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanReport {
    pub cleaned: u64,
    pub cleaned_temporary: u64,
    pub cleaned_invalid: u64,
    pub cleaned_files: u64,
    pub cleaned_directories: u64,
    /// Reclaim attempts that failed; the blocks stay as they were.
    pub failed: u64,
    /// Unreachable SEGINFO blocks, reported but not reclaimed.
    pub orphan_segments: u64,
    /// Unreachable DATA blocks, reported but not reclaimed.
    pub orphan_data: u64,
    /// Unreachable blocks of types the clean pass never touches.
    pub skipped_other: u64,
}

impl fmt::Display for CleanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleaned {} blocks ({} temporary, {} invalid, {} files, {} directories)",
            self.cleaned,
            self.cleaned_temporary,
            self.cleaned_invalid,
            self.cleaned_files,
            self.cleaned_directories
        )?;
        if self.failed > 0 {
            write!(f, "; {} blocks could not be freed", self.failed)?;
        }
        if self.orphan_segments > 0 || self.orphan_data > 0 {
            write!(
                f,
                "; {} orphan segment and {} orphan data blocks left in place",
                self.orphan_segments, self.orphan_data
            )?;
        }
        Ok(())
    }
}

/// One block's classification in the inspector's segment map.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SegmentGlyph {
    pub pos: BlockPos,
    pub glyph: char,
    /// Set on FILEINFO/DIRECTORY blocks outside the live set, which the
    /// clean pass would reclaim.
    pub unreachable: bool,
}

impl Fs {
    /// Walk the tree from the root directory and compute the live set.
    ///
    /// Malformed blocks are counted and skipped; end-of-file during the
    /// walk clears the stream and is likewise nonfatal.
    pub fn reachability(&mut self) -> Result<Reachability> {
        let mut report = Reachability::default();
        let mut stack = vec![self.fsinfo.pos_root];
        let mut visited: HashSet<BlockPos> = HashSet::new();

        while let Some(dpos) = stack.pop() {
            if !visited.insert(dpos) {
                continue;
            }
            let Some(node) = self.read_for_walk(dpos, &mut report)? else {
                continue;
            };
            let INode::Directory(dir) = node else {
                report.malformed_blocks += 1;
                continue;
            };

            report.headers.insert(dpos);
            let (segs, child_ids) = match self.dir_chain(dpos, &dir) {
                Ok(chain) => chain,
                Err(err) => {
                    self.note_walk_error(dpos, err, &mut report)?;
                    continue;
                }
            };
            report.headers.extend(segs);

            for child_id in child_ids {
                let Ok(cpos) = self.get_inode_position_by_id(child_id) else {
                    warn!(
                        target: "appfs::audit",
                        directory = dir.id.0,
                        child = child_id.0,
                        "reached directory references a missing child"
                    );
                    report.missing_children += 1;
                    continue;
                };
                let Some(child) = self.read_for_walk(cpos, &mut report)? else {
                    continue;
                };
                match child {
                    INode::Directory(_) => stack.push(cpos),
                    INode::FileInfo(file) => {
                        report.headers.insert(cpos);
                        match self.file_chain(cpos, &file) {
                            Ok((segs, blocks)) => {
                                report.headers.extend(segs);
                                report.data.extend(blocks);
                            }
                            Err(err) => self.note_walk_error(cpos, err, &mut report)?,
                        }
                    }
                    INode::Symlink(_) | INode::Device(_) => {
                        report.headers.insert(cpos);
                    }
                    other => {
                        warn!(
                            target: "appfs::audit",
                            pos = %cpos,
                            kind = %other.kind(),
                            "directory child resolves to a non-object block"
                        );
                        report.malformed_blocks += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    fn read_for_walk(
        &mut self,
        pos: BlockPos,
        report: &mut Reachability,
    ) -> Result<Option<INode>> {
        match self.read_node(pos) {
            Ok(node) => Ok(Some(node)),
            Err(err) => {
                self.note_walk_error(pos, err, report)?;
                Ok(None)
            }
        }
    }

    /// Swallow the walk-tolerable failures, propagate the rest.
    fn note_walk_error(
        &mut self,
        pos: BlockPos,
        err: AppFsError,
        report: &mut Reachability,
    ) -> Result<()> {
        match err {
            AppFsError::Eof => {
                self.stream.clear();
                report.malformed_blocks += 1;
                Ok(())
            }
            AppFsError::Malformed { .. } => {
                warn!(target: "appfs::audit", pos = %pos, error = %err, "malformed block during walk");
                report.malformed_blocks += 1;
                Ok(())
            }
            err @ AppFsError::Io(_) => Err(err),
            other => {
                warn!(target: "appfs::audit", pos = %pos, error = %other, "unexpected walk failure");
                report.malformed_blocks += 1;
                Ok(())
            }
        }
    }

    /// Scan every block from `BSIZE` to end-of-file and reclaim the
    /// unreachable TEMPORARY, INVALID, FILEINFO, and DIRECTORY blocks.
    pub fn clean(&mut self) -> Result<CleanReport> {
        let reach = self.reachability()?;
        let mut report = CleanReport::default();
        let mut pos = BlockPos(BSIZE as u32);
        loop {
            let kind = match self.block_kind(pos) {
                Ok(kind) => kind,
                Err(AppFsError::Eof) => {
                    self.stream.clear();
                    break;
                }
                Err(err) => return Err(err),
            };

            if !reach.is_live(pos) {
                match kind {
                    BlockKind::Free | BlockKind::Unset | BlockKind::Freelist => {}
                    BlockKind::Temporary => match self.reset_block(pos) {
                        Ok(()) => {
                            report.cleaned += 1;
                            report.cleaned_temporary += 1;
                        }
                        Err(err) => {
                            warn!(target: "appfs::audit", pos = %pos, error = %err, "failed to reclaim block");
                            report.failed += 1;
                        }
                    },
                    BlockKind::Invalid => match self.reset_block(pos) {
                        Ok(()) => {
                            report.cleaned += 1;
                            report.cleaned_invalid += 1;
                        }
                        Err(err) => {
                            warn!(target: "appfs::audit", pos = %pos, error = %err, "failed to reclaim block");
                            report.failed += 1;
                        }
                    },
                    BlockKind::FileInfo => match self.reset_block(pos) {
                        Ok(()) => {
                            report.cleaned += 1;
                            report.cleaned_files += 1;
                        }
                        Err(err) => {
                            warn!(target: "appfs::audit", pos = %pos, error = %err, "failed to reclaim block");
                            report.failed += 1;
                        }
                    },
                    BlockKind::Directory => match self.reset_block(pos) {
                        Ok(()) => {
                            report.cleaned += 1;
                            report.cleaned_directories += 1;
                        }
                        Err(err) => {
                            warn!(target: "appfs::audit", pos = %pos, error = %err, "failed to reclaim block");
                            report.failed += 1;
                        }
                    },
                    BlockKind::SegInfo => report.orphan_segments += 1,
                    BlockKind::Data => report.orphan_data += 1,
                    BlockKind::FsInfo | BlockKind::Symlink | BlockKind::Device => {
                        report.skipped_other += 1;
                    }
                }
            }

            pos = pos.next().ok_or(AppFsError::OutOfSpace)?;
        }

        info!(target: "appfs::audit", event = "clean", %report);
        Ok(report)
    }

    /// Classify every block from offset 0 to end-of-file for the
    /// inspector's segment map. Priority: free, then data, then header
    /// or tag; unreachable FILEINFO/DIRECTORY blocks are flagged.
    pub fn segment_map(&mut self, reach: &Reachability) -> Result<Vec<SegmentGlyph>> {
        let mut map = Vec::new();
        let mut pos = BlockPos(0);
        loop {
            let kind = match self.block_kind(pos) {
                Ok(kind) => kind,
                Err(AppFsError::Eof) => {
                    self.stream.clear();
                    break;
                }
                Err(err) => return Err(err),
            };

            let (glyph, unreachable) = if kind == BlockKind::Free {
                ('_', false)
            } else if reach.data.contains(&pos) {
                ('#', false)
            } else if kind == BlockKind::Invalid {
                ('?', false)
            } else if reach.headers.contains(&pos)
                || !matches!(kind, BlockKind::FileInfo | BlockKind::Directory)
            {
                (kind.glyph(), false)
            } else {
                (kind.glyph(), true)
            };
            map.push(SegmentGlyph {
                pos,
                glyph,
                unreachable,
            });

            pos = pos.next().ok_or(AppFsError::OutOfSpace)?;
        }
        Ok(map)
    }
}
