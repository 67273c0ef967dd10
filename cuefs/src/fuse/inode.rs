//! Inode allocation for virtual paths.
//!
//! The kernel speaks inodes, the view speaks root-relative paths; this
//! table maps between them. Inodes are allocated on first sight and live
//! for the mount's lifetime - the table only ever grows, which keeps
//! lookups race-free without generation counters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Inode of the source root.
pub const ROOT_INODE: u64 = 1;

#[derive(Default)]
struct Tables {
    paths: HashMap<u64, PathBuf>,
    inodes: HashMap<PathBuf, u64>,
}

/// Bidirectional inode <-> virtual path table.
pub struct InodeManager {
    tables: RwLock<Tables>,
    next: AtomicU64,
}

impl InodeManager {
    pub fn new() -> Self {
        let mut tables = Tables::default();
        tables.paths.insert(ROOT_INODE, PathBuf::new());
        tables.inodes.insert(PathBuf::new(), ROOT_INODE);
        Self {
            tables: RwLock::new(tables),
            next: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    /// Inode of a virtual path, allocating one on first sight.
    pub fn assign(&self, rel: &Path) -> u64 {
        if let Some(&ino) = self.tables.read().inodes.get(rel) {
            return ino;
        }
        let mut tables = self.tables.write();
        if let Some(&ino) = tables.inodes.get(rel) {
            return ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        tables.paths.insert(ino, rel.to_path_buf());
        tables.inodes.insert(rel.to_path_buf(), ino);
        ino
    }

    /// Virtual path of a known inode.
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.tables.read().paths.get(&ino).cloned()
    }

    /// Number of known inodes, including the root.
    pub fn len(&self) -> usize {
        self.tables.read().paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().paths.is_empty()
    }
}

impl Default for InodeManager {
    fn default() -> Self {
        Self::new()
    }
}
