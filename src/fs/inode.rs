//! Virtual nodes and path resolution against the backing root.

use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};

/// Kernel inode number of the mount root.
pub const ROOT_INO: u64 = 1;

// Guards the ancestor walk against a corrupted parent chain.
const MAX_DEPTH: usize = 4096;

/// One kernel inode. Holds its name relative to the parent; the absolute
/// real path is computed on first use.
#[derive(Debug)]
pub struct VirtualNode {
    parent: u64,
    name: OsString,
    lookups: AtomicU64,
    real_path: OnceLock<PathBuf>,
}

impl VirtualNode {
    fn new(parent: u64, name: OsString, lookups: u64) -> Self {
        Self {
            parent,
            name,
            lookups: AtomicU64::new(lookups),
            real_path: OnceLock::new(),
        }
    }

    pub fn parent(&self) -> u64 {
        self.parent
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

/// Inode table plus the path resolver over it. Every node borrows the same
/// backing root.
#[derive(Debug)]
pub struct NodeTable {
    root: Arc<PathBuf>,
    nodes: DashMap<u64, Arc<VirtualNode>>,
}

impl NodeTable {
    pub fn new(backing_root: impl Into<PathBuf>) -> Self {
        let nodes = DashMap::new();
        nodes.insert(
            ROOT_INO,
            Arc::new(VirtualNode::new(ROOT_INO, OsString::new(), 1)),
        );
        Self {
            root: Arc::new(backing_root.into()),
            nodes,
        }
    }

    pub fn backing_root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, ino: u64) -> Option<Arc<VirtualNode>> {
        self.nodes.get(&ino).map(|n| n.clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Path of `ino` relative to the mount root; empty for the root itself.
    pub fn relative_path(&self, ino: u64) -> Option<PathBuf> {
        let mut names = Vec::new();
        let mut current = ino;
        for _ in 0..MAX_DEPTH {
            if current == ROOT_INO {
                return Some(names.iter().rev().collect());
            }
            let node = self.get(current)?;
            names.push(node.name.clone());
            current = node.parent;
        }
        None
    }

    /// Absolute path of `ino` under the backing root.
    pub fn resolve(&self, ino: u64) -> Option<PathBuf> {
        let node = self.get(ino)?;
        if let Some(path) = node.real_path.get() {
            return Some(path.clone());
        }
        let path = join_under(&self.root, &self.relative_path(ino)?);
        Some(node.real_path.get_or_init(|| path).clone())
    }

    /// Counterpart of `ino` under another root, e.g. the cache root.
    pub fn resolve_under(&self, ino: u64, base: &Path) -> Option<PathBuf> {
        Some(join_under(base, &self.relative_path(ino)?))
    }

    /// Absolute backing path of `name` inside directory `parent`.
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        Some(self.resolve(parent)?.join(name))
    }

    /// Record a successful lookup of `name` in `parent` answered with `ino`.
    ///
    /// An inode already known under a different name (hard link, outside
    /// rename) is re-pointed at the latest name while keeping its count.
    pub fn remember(&self, parent: u64, name: &OsStr, ino: u64) {
        if ino == ROOT_INO {
            return;
        }
        match self.nodes.entry(ino) {
            Entry::Occupied(mut entry) => {
                let node = entry.get();
                if node.parent == parent && node.name.as_os_str() == name {
                    node.lookups.fetch_add(1, Ordering::SeqCst);
                } else {
                    let lookups = node.lookups() + 1;
                    entry.insert(Arc::new(VirtualNode::new(
                        parent,
                        name.to_os_string(),
                        lookups,
                    )));
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(VirtualNode::new(
                    parent,
                    name.to_os_string(),
                    1,
                )));
            }
        }
    }

    /// Node currently named `name` inside `parent`.
    pub fn find_child(&self, parent: u64, name: &OsStr) -> Option<u64> {
        self.nodes
            .iter()
            .find(|n| n.parent == parent && n.name.as_os_str() == name)
            .map(|n| *n.key())
    }

    /// Follow a rename of `name` in `parent` to `new_name` in `new_parent`.
    /// With `exchange` the node at the destination moves the other way.
    pub fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        exchange: bool,
    ) {
        let bases: Vec<PathBuf> = [
            self.child_path(parent, name),
            self.child_path(new_parent, new_name),
        ]
        .into_iter()
        .flatten()
        .collect();
        let moved = self.find_child(parent, name);
        let swapped = exchange
            .then(|| self.find_child(new_parent, new_name))
            .flatten();

        if let Some(ino) = moved {
            self.relocate(ino, new_parent, new_name);
        }
        if let Some(ino) = swapped {
            self.relocate(ino, parent, name);
        }

        // Cached real paths at or below either location are stale now.
        let stale: Vec<u64> = self
            .nodes
            .iter()
            .filter(|n| {
                n.real_path
                    .get()
                    .is_some_and(|p| bases.iter().any(|base| p.starts_with(base)))
            })
            .map(|n| *n.key())
            .collect();
        for ino in stale {
            if let Some(node) = self.get(ino) {
                self.relocate(ino, node.parent, &node.name);
            }
        }
    }

    /// Replace the node for `ino` with one at a new location, keeping its
    /// lookup count and dropping its cached path.
    fn relocate(&self, ino: u64, parent: u64, name: &OsStr) {
        if let Some(mut node) = self.nodes.get_mut(&ino) {
            let lookups = node.lookups();
            *node = Arc::new(VirtualNode::new(parent, name.to_os_string(), lookups));
        }
    }

    /// Drop `nlookup` kernel references; the node goes away at zero.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(node) = self.get(ino) else {
            return;
        };
        let previous = node
            .lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(nlookup))
            })
            .unwrap_or_else(|v| v);
        if previous <= nlookup {
            self.nodes
                .remove_if(&ino, |_, n| n.lookups.load(Ordering::SeqCst) == 0);
        }
    }
}

/// Join without leaving a trailing separator for the empty (root) suffix.
pub fn join_under(base: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(relative)
    }
}
