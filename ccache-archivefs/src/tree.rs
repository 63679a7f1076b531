//! Inode tree for the mounted archive(s). `parent`/`contents`/`names` are
//! index structures over the sole owning map (`inode -> item`, held
//! elsewhere by `ItemCache` for leaves); none of them own data, so no
//! reference cycle survives a mount teardown (§9).

use std::collections::BTreeMap;

pub const ROOT_INODE: u64 = 1;

#[derive(Clone)]
pub enum NodeKind {
    /// The mount root when mounting a whole repository: one child per
    /// archive name, each an `ArchivePlaceholder` until first traversed.
    Root,
    /// An archive's root directory, not yet resolved (§4.8 "Inode
    /// allocation"). Resolves to a `Directory` on first `lookup`/`opendir`.
    ArchivePlaceholder { archive: String },
    /// A loaded (or partially loaded) directory. `windows_loaded` memoizes
    /// which metadata-index windows have already been merged in, keyed by
    /// the window's `chunk_index` (§4.8 "Already-loaded windows are
    /// memoized per archive by `index`" — here scoped per directory since
    /// each directory inode belongs to exactly one archive).
    Directory { windows_loaded: std::collections::HashSet<u32> },
    /// A leaf (regular file, symlink, device). The inode equals the
    /// item cache handle; no separate storage here.
    Leaf { nlink: u32 },
}

struct Node {
    parent: u64,
    name: String,
    kind: NodeKind,
}

pub struct Tree {
    nodes: BTreeMap<u64, Node>,
    contents: BTreeMap<u64, BTreeMap<String, u64>>,
    /// Archive name by archive-root inode. Kept separate from `NodeKind`
    /// because the root's kind moves from `ArchivePlaceholder` to
    /// `Directory` on first traversal, but callers still need to recover
    /// which archive an inode belongs to after that point.
    archive_roots: BTreeMap<u64, String>,
    next_inode: u64,
}

impl Tree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_INODE,
            Node {
                parent: ROOT_INODE,
                name: String::new(),
                kind: NodeKind::Root,
            },
        );
        let mut contents = BTreeMap::new();
        contents.insert(ROOT_INODE, BTreeMap::new());
        Tree {
            nodes,
            contents,
            archive_roots: BTreeMap::new(),
            // Directory inodes are allocated monotonically above the
            // root; leaf inodes come from the item cache's own handle
            // space and never pass through `alloc`.
            next_inode: ROOT_INODE + 1,
        }
    }

    fn alloc(&mut self) -> u64 {
        let inode = self.next_inode;
        self.next_inode += 1;
        inode
    }

    pub fn add_archive_placeholder(&mut self, archive: &str) -> u64 {
        if let Some(existing) = self.contents[&ROOT_INODE].get(archive) {
            return *existing;
        }
        let inode = self.alloc();
        self.nodes.insert(
            inode,
            Node {
                parent: ROOT_INODE,
                name: archive.to_string(),
                kind: NodeKind::ArchivePlaceholder {
                    archive: archive.to_string(),
                },
            },
        );
        self.contents
            .get_mut(&ROOT_INODE)
            .unwrap()
            .insert(archive.to_string(), inode);
        self.archive_roots.insert(inode, archive.to_string());
        inode
    }

    /// The archive name owning `inode`, if `inode` is (or ever was) an
    /// archive root — true regardless of whether it has since resolved
    /// from `ArchivePlaceholder` to `Directory`.
    pub fn archive_name(&self, inode: u64) -> Option<&str> {
        self.archive_roots.get(&inode).map(String::as_str)
    }

    pub fn is_archive_root(&self, inode: u64) -> bool {
        self.archive_roots.contains_key(&inode)
    }

    /// Turns an `ArchivePlaceholder` or a fresh directory slot into a
    /// loaded `Directory`, allocating contents storage. A no-op if the
    /// inode is already a `Directory`.
    pub fn resolve_directory(&mut self, inode: u64) {
        if let Some(node) = self.nodes.get_mut(&inode) {
            if matches!(node.kind, NodeKind::Directory { .. }) {
                return;
            }
            node.kind = NodeKind::Directory {
                windows_loaded: std::collections::HashSet::new(),
            };
        }
        self.contents.entry(inode).or_default();
    }

    /// Finds (or creates) the child directory `name` under `parent`,
    /// resolving it to a `Directory` node.
    pub fn mkdir(&mut self, parent: u64, name: &str) -> u64 {
        if let Some(existing) = self.contents.get(&parent).and_then(|c| c.get(name)) {
            self.resolve_directory(*existing);
            return *existing;
        }
        let inode = self.alloc();
        self.nodes.insert(
            inode,
            Node {
                parent,
                name: name.to_string(),
                kind: NodeKind::Directory {
                    windows_loaded: std::collections::HashSet::new(),
                },
            },
        );
        self.contents.entry(inode).or_default();
        self.contents
            .get_mut(&parent)
            .unwrap()
            .insert(name.to_string(), inode);
        inode
    }

    /// Attaches a leaf (or an additional hard-link name) under `parent`.
    /// `handle` is the item cache handle, doubling as the leaf's inode. If
    /// this inode already exists as a leaf (a hard link target), its
    /// `nlink` is bumped instead of creating a new node.
    pub fn attach_leaf(&mut self, parent: u64, name: &str, handle: u64) {
        match self.nodes.get_mut(&handle) {
            Some(Node {
                kind: NodeKind::Leaf { nlink },
                ..
            }) => {
                *nlink += 1;
            }
            _ => {
                self.nodes.insert(
                    handle,
                    Node {
                        parent,
                        name: name.to_string(),
                        kind: NodeKind::Leaf { nlink: 1 },
                    },
                );
            }
        }
        self.contents
            .entry(parent)
            .or_default()
            .insert(name.to_string(), handle);
    }

    pub fn lookup_child(&self, parent: u64, name: &str) -> Option<u64> {
        self.contents.get(&parent)?.get(name).copied()
    }

    pub fn children(&self, inode: u64) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.contents
            .get(&inode)
            .into_iter()
            .flat_map(|c| c.iter().map(|(name, inode)| (name.as_str(), *inode)))
    }

    pub fn parent(&self, inode: u64) -> Option<u64> {
        self.nodes.get(&inode).map(|n| n.parent)
    }

    pub fn name(&self, inode: u64) -> Option<&str> {
        self.nodes.get(&inode).map(|n| n.name.as_str())
    }

    pub fn is_archive_placeholder(&self, inode: u64) -> Option<&str> {
        match self.nodes.get(&inode).map(|n| &n.kind) {
            Some(NodeKind::ArchivePlaceholder { archive }) => Some(archive.as_str()),
            _ => None,
        }
    }

    /// True for any inode that behaves as a directory to a caller: a
    /// loaded `Directory`, the mount `Root`, or an `ArchivePlaceholder`
    /// that has not yet been traversed (§4.8 "a directory placeholder
    /// stores only `default_dir` attributes until its contents are
    /// materialized").
    pub fn is_directory(&self, inode: u64) -> bool {
        matches!(
            self.nodes.get(&inode).map(|n| &n.kind),
            Some(NodeKind::Directory { .. })
                | Some(NodeKind::Root)
                | Some(NodeKind::ArchivePlaceholder { .. })
        )
    }

    pub fn nlink(&self, inode: u64) -> u32 {
        match self.nodes.get(&inode).map(|n| &n.kind) {
            Some(NodeKind::Leaf { nlink }) => *nlink,
            Some(NodeKind::Directory { .. })
            | Some(NodeKind::Root)
            | Some(NodeKind::ArchivePlaceholder { .. }) => 2,
            _ => 1,
        }
    }

    pub fn window_already_loaded(&self, dir_inode: u64, chunk_index: u32) -> bool {
        match self.nodes.get(&dir_inode).map(|n| &n.kind) {
            Some(NodeKind::Directory { windows_loaded }) => windows_loaded.contains(&chunk_index),
            _ => false,
        }
    }

    pub fn mark_window_loaded(&mut self, dir_inode: u64, chunk_index: u32) {
        if let Some(Node {
            kind: NodeKind::Directory { windows_loaded },
            ..
        }) = self.nodes.get_mut(&dir_inode)
        {
            windows_loaded.insert(chunk_index);
        }
    }

    /// Walks `inode` up to its archive-root ancestor, collecting path
    /// segments in root-to-leaf order, plus the inode of that archive
    /// root (§4.8 "Lazy resolution" step 1).
    pub fn full_segments(&self, inode: u64) -> (Vec<String>, u64) {
        let mut segments = Vec::new();
        let mut current = inode;
        loop {
            let node = match self.nodes.get(&current) {
                Some(n) => n,
                None => break,
            };
            if current == ROOT_INODE || self.archive_roots.contains_key(&current) {
                break;
            }
            segments.push(node.name.clone());
            current = node.parent;
        }
        segments.reverse();
        (segments, current)
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_placeholder_then_resolve() {
        let mut tree = Tree::new();
        let archive_inode = tree.add_archive_placeholder("home");
        assert_eq!(tree.is_archive_placeholder(archive_inode), Some("home"));
        tree.resolve_directory(archive_inode);
        assert!(tree.is_directory(archive_inode));
    }

    #[test]
    fn test_mkdir_nested_and_full_segments() {
        let mut tree = Tree::new();
        let archive_inode = tree.add_archive_placeholder("home");
        tree.resolve_directory(archive_inode);
        let a = tree.mkdir(archive_inode, "a");
        let b = tree.mkdir(a, "b");

        let (segments, root) = tree.full_segments(b);
        assert_eq!(segments, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(root, archive_inode);
    }

    #[test]
    fn test_hardlink_bumps_nlink_without_new_inode() {
        let mut tree = Tree::new();
        let archive_inode = tree.add_archive_placeholder("home");
        tree.resolve_directory(archive_inode);

        let handle = 1u64 << 40;
        tree.attach_leaf(archive_inode, "first", handle);
        assert_eq!(tree.nlink(handle), 1);
        tree.attach_leaf(archive_inode, "second", handle);
        assert_eq!(tree.nlink(handle), 2);

        assert_eq!(tree.lookup_child(archive_inode, "first"), Some(handle));
        assert_eq!(tree.lookup_child(archive_inode, "second"), Some(handle));
    }
}
