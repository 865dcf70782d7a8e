//! Path resolution.
//!
//! Paths resolve one component at a time from the root directory,
//! matching children by name. Intermediate symbolic links are expanded
//! in place; a per-resolution set of visited link positions bounds the
//! search so target cycles fail with `Loop` instead of spinning.

use crate::Fs;
use appfs_error::{AppFsError, Result};
use appfs_inode::INode;
use appfs_types::{BlockPos, InodeId};
use std::collections::{HashSet, VecDeque};

impl Fs {
    /// Resolve `path` to its final inode.
    ///
    /// The final component is returned as-is (a trailing symlink is not
    /// followed); intermediate components must be directories or links
    /// that eventually reach one.
    pub fn resolve_path(&mut self, path: &str) -> Result<INode> {
        let mut pending: VecDeque<String> = path
            .split('/')
            .filter(|part| !part.is_empty())
            .map(str::to_owned)
            .collect();
        let mut current = InodeId::ROOT;
        let mut visited_links: HashSet<BlockPos> = HashSet::new();

        while let Some(component) = pending.pop_front() {
            if component == "." {
                if pending.is_empty() {
                    break;
                }
                continue;
            }
            if component == ".." {
                let (_, dir) = self.load_dir(current)?;
                current = dir.parent;
                if pending.is_empty() {
                    break;
                }
                continue;
            }

            let children = self.get_children_of_directory(current)?;
            let child = children
                .into_iter()
                .find(|c| c.name() == Some(component.as_str()))
                .ok_or_else(|| AppFsError::NotFound(component.clone()))?;

            if pending.is_empty() {
                return Ok(child);
            }
            match child {
                INode::Directory(dir) => current = dir.id,
                INode::Symlink(link) => {
                    let lpos = self.get_inode_position_by_id(link.id)?;
                    if !visited_links.insert(lpos) {
                        return Err(AppFsError::Loop);
                    }
                    if link.target.starts_with('/') {
                        current = InodeId::ROOT;
                    }
                    for part in link
                        .target
                        .split('/')
                        .rev()
                        .filter(|part| !part.is_empty())
                    {
                        pending.push_front(part.to_owned());
                    }
                }
                _ => return Err(AppFsError::NotADirectory(component)),
            }
        }

        self.get_inode_by_id(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fs_with_tree(dir: &tempfile::TempDir) -> Fs {
        let mut fs = Fs::create_image(dir.path().join("t.img"), "App", "1.0.0", "", "").unwrap();
        let bin = fs.create_directory(InodeId::ROOT, "bin").unwrap();
        let sh = fs.create_file(bin, "sh").unwrap();
        fs.write_file_data(sh, 0, b"#!/bin/sh\n").unwrap();
        fs.create_symlink(InodeId::ROOT, "tools", "/bin").unwrap();
        fs
    }

    #[test]
    fn resolves_nested_components() {
        let dir = tempdir().unwrap();
        let mut fs = fs_with_tree(&dir);

        let node = fs.resolve_path("/bin/sh").unwrap();
        assert_eq!(node.name(), Some("sh"));

        let node = fs.resolve_path("/").unwrap();
        assert_eq!(node.inode_id(), Some(InodeId::ROOT));

        let node = fs.resolve_path("/bin/./sh").unwrap();
        assert_eq!(node.name(), Some("sh"));

        let node = fs.resolve_path("/bin/../bin/sh").unwrap();
        assert_eq!(node.name(), Some("sh"));
    }

    #[test]
    fn missing_and_non_directory_components() {
        let dir = tempdir().unwrap();
        let mut fs = fs_with_tree(&dir);

        assert!(matches!(
            fs.resolve_path("/bin/absent"),
            Err(AppFsError::NotFound(_))
        ));
        assert!(matches!(
            fs.resolve_path("/bin/sh/deeper"),
            Err(AppFsError::NotADirectory(_))
        ));
    }

    #[test]
    fn intermediate_symlinks_are_followed() {
        let dir = tempdir().unwrap();
        let mut fs = fs_with_tree(&dir);

        let node = fs.resolve_path("/tools/sh").unwrap();
        assert_eq!(node.name(), Some("sh"));

        // The final component keeps its link identity.
        let node = fs.resolve_path("/tools").unwrap();
        assert!(matches!(node, INode::Symlink(_)));
    }

    #[test]
    fn symlink_cycles_fail_with_loop() {
        let dir = tempdir().unwrap();
        let mut fs = fs_with_tree(&dir);
        fs.create_symlink(InodeId::ROOT, "a", "/b").unwrap();
        fs.create_symlink(InodeId::ROOT, "b", "/a").unwrap();

        assert!(matches!(
            fs.resolve_path("/a/anything"),
            Err(AppFsError::Loop)
        ));
    }

    #[test]
    fn relative_symlink_targets_resolve_from_their_directory() {
        let dir = tempdir().unwrap();
        let mut fs = fs_with_tree(&dir);
        fs.create_symlink(InodeId::ROOT, "b", "bin").unwrap();

        let node = fs.resolve_path("/b/sh").unwrap();
        assert_eq!(node.name(), Some("sh"));
        assert!(matches!(node, INode::FileInfo(_)));
    }
}
