//! The single mutual-exclusion region above the engine.
//!
//! The engine itself is not synchronized; collaborators that dispatch
//! from more than one task (the mount daemon on one side, a launched
//! application's plumbing on the other) share it through [`SharedFs`],
//! which serializes every operation end-to-end under one lock. One
//! region for the whole engine is deliberate: contention is acceptable
//! for single-user workloads and the reasoning stays simple.

use crate::Fs;
use parking_lot::Mutex;
use std::sync::Arc;

/// Cloneable handle to a mutex-wrapped engine.
#[derive(Debug, Clone)]
pub struct SharedFs {
    inner: Arc<Mutex<Fs>>,
}

impl SharedFs {
    #[must_use]
    pub fn new(fs: Fs) -> Self {
        Self {
            inner: Arc::new(Mutex::new(fs)),
        }
    }

    /// Run one engine operation under the region.
    ///
    /// The lock is held for the whole closure and released on every exit
    /// path. Do not nest `with` calls; the region is not reentrant.
    pub fn with<R>(&self, op: impl FnOnce(&mut Fs) -> R) -> R {
        let mut guard = self.inner.lock();
        op(&mut guard)
    }

    /// Recover the engine when this is the last handle.
    pub fn try_into_inner(self) -> Result<Fs, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appfs_types::InodeId;
    use tempfile::tempdir;

    #[test]
    fn operations_serialize_across_threads() {
        let dir = tempdir().unwrap();
        let fs = Fs::create_image(dir.path().join("s.img"), "App", "1.0.0", "", "").unwrap();
        let shared = SharedFs::new(fs);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let shared = shared.clone();
                std::thread::spawn(move || {
                    for n in 0..8 {
                        let name = format!("file-{worker}-{n}");
                        shared
                            .with(|fs| fs.create_file(InodeId::ROOT, &name))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let count = shared
            .with(|fs| fs.get_children_of_directory(InodeId::ROOT))
            .unwrap()
            .len();
        assert_eq!(count, 32);
    }
}
