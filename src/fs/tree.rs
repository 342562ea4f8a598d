//! In-memory directory tree, rebuilt from the image at open.

use std::collections::HashSet;
use std::io::{Read, Seek, Write};

use log::{debug, info, warn};

use super::context::{RecordBytes, VolumeContext};
use super::dirent::{
    lfn_checksum, FatTimestamp, LongNameBuffer, RawRecord, ShortRecord, MAX_ORDER,
};
use super::geometry::DIR_ENTRY_SIZE;
use crate::error::VolumeError;

/// Index of a node in a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
    /// `.` or `..` inside a directory, pointing at the directory it names.
    DotAlias { target: NodeId },
}

#[derive(Debug, Clone)]
pub struct Node {
    /// Display name (long name, or the 8.3 form when there is none).
    pub name: String,
    pub kind: NodeKind,
    pub first_cluster: u32,
    pub chain: Vec<u32>,
    pub size: u32,
    pub created: FatTimestamp,
    pub modified: FatTimestamp,
    /// Numeric `~N` suffix of the short name.
    pub order: u32,
    pub short_name: [u8; 11],
    pub checksum: u8,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl Node {
    /// A node for a decoded short record.
    pub fn from_record(name: String, short: &ShortRecord, chain: Vec<u32>) -> Self {
        let kind = if short.is_directory() {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        Self {
            name,
            kind,
            first_cluster: short.first_cluster,
            chain,
            size: short.size,
            created: short.created,
            modified: short.modified,
            order: short.order(),
            short_name: short.name,
            checksum: lfn_checksum(&short.name),
            children: Vec::new(),
            parent: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.kind, NodeKind::DotAlias { .. })
    }
}

/// Arena of nodes. Nodes are never removed; a move only re-links them.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Tree {
    /// A tree holding only the root directory.
    pub fn new(root_cluster: u32, root_chain: Vec<u32>) -> Self {
        let root = Node {
            name: "/".into(),
            kind: NodeKind::Directory,
            first_cluster: root_cluster,
            chain: root_chain,
            size: 0,
            created: FatTimestamp::default(),
            modified: FatTimestamp::default(),
            order: 0,
            short_name: [b' '; 11],
            checksum: 0,
            children: Vec::new(),
            parent: None,
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// Add a detached node to the arena.
    pub fn add(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Append `child` to `parent`'s children and retarget its `..` alias.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent.0].children.push(child);
        self.nodes[child.0].parent = Some(parent);

        if let Some(dotdot) = self.find_alias(child, "..") {
            let parent_cluster = self.nodes[parent.0].first_cluster;
            let alias = &mut self.nodes[dotdot.0];
            alias.kind = NodeKind::DotAlias { target: parent };
            alias.first_cluster = parent_cluster;
        }
    }

    /// Remove `child` from its parent's children.
    pub fn detach(&mut self, child: NodeId) {
        if let Some(parent) = self.nodes[child.0].parent.take() {
            self.nodes[parent.0].children.retain(|&c| c != child);
        }
    }

    /// Add `.` and `..` alias children to a directory.
    pub fn add_dot_aliases(&mut self, dir: NodeId) {
        self.add_alias(dir, ".", dir);
        if let Some(parent) = self.nodes[dir.0].parent {
            self.add_alias(dir, "..", parent);
        }
    }

    fn add_alias(&mut self, dir: NodeId, name: &str, target: NodeId) -> NodeId {
        let t = &self.nodes[target.0];
        let alias = Node {
            name: name.into(),
            kind: NodeKind::DotAlias { target },
            first_cluster: t.first_cluster,
            chain: Vec::new(),
            size: 0,
            created: t.created,
            modified: t.modified,
            order: 0,
            short_name: [b' '; 11],
            checksum: 0,
            children: Vec::new(),
            parent: Some(dir),
        };
        let id = self.add(alias);
        self.nodes[dir.0].children.push(id);
        id
    }

    fn find_alias(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[dir.0]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c.0].is_alias() && self.nodes[c.0].name == name)
    }

    /// Children of `dir` that are real entries (no `.`/`..`).
    pub fn live_children(&self, dir: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[dir.0]
            .children
            .iter()
            .copied()
            .filter(|&c| !self.nodes[c.0].is_alias())
    }

    /// Any child of `dir` (aliases included) with the given display name.
    pub fn find_child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[dir.0]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c.0].name == name)
    }

    /// A real child of `dir` with the given display name.
    pub fn find_live_child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        self.live_children(dir).find(|&c| self.nodes[c.0].name == name)
    }

    /// Order for a new entry in `dir`: one past the highest live order.
    ///
    /// Once that no longer fits in a short name, the lowest unused order is
    /// taken instead.
    pub fn next_order(&self, dir: NodeId) -> Result<u32, VolumeError> {
        let used: HashSet<u32> = self
            .live_children(dir)
            .map(|c| self.nodes[c.0].order)
            .collect();
        let next = used.iter().max().map_or(1, |max| max.saturating_add(1));
        if next <= MAX_ORDER {
            return Ok(next);
        }
        (1..=MAX_ORDER)
            .find(|order| !used.contains(order))
            .ok_or_else(|| {
                VolumeError::InvalidOperation(format!(
                    "no short name left in {}",
                    self.absolute_path(dir)
                ))
            })
    }

    /// Whether `ancestor` is `node` or lies on its parent chain.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.nodes[id.0].parent;
        }
        false
    }

    /// Follow an alias to the directory it names.
    pub fn target_of(&self, id: NodeId) -> NodeId {
        match self.nodes[id.0].kind {
            NodeKind::DotAlias { target } => target,
            _ => id,
        }
    }
}

/// Rebuild the tree by walking every directory from the root cluster.
///
/// Deleted (0xE5) records found on the way are zeroed in place.
pub fn build_tree<D: Read + Write + Seek>(
    ctx: &mut VolumeContext<D>,
) -> Result<Tree, VolumeError> {
    let root_cluster = ctx.geometry().root_cluster;
    let root_chain = ctx.chain_of(root_cluster)?;
    let mut tree = Tree::new(root_cluster, root_chain);

    let mut visited = HashSet::new();
    visited.insert(root_cluster);
    let mut pending = vec![tree.root()];
    while let Some(dir) = pending.pop() {
        let subdirs = scan_directory(ctx, &mut tree, dir)?;
        // reversed so the first subdirectory is scanned next
        for sub in subdirs.into_iter().rev() {
            let cluster = tree.get(sub).first_cluster;
            if cluster == 0 {
                warn!("directory {:?} has no cluster", tree.get(sub).name);
                continue;
            }
            if !visited.insert(cluster) {
                warn!(
                    "directory {:?} reuses cluster {cluster}, not descending",
                    tree.get(sub).name
                );
                continue;
            }
            pending.push(sub);
        }
    }

    info!("loaded directory tree: {} node(s)", tree.len());
    Ok(tree)
}

/// Decode one directory's records into child nodes. Returns the new
/// subdirectories.
fn scan_directory<D: Read + Write + Seek>(
    ctx: &mut VolumeContext<D>,
    tree: &mut Tree,
    dir: NodeId,
) -> Result<Vec<NodeId>, VolumeError> {
    let chain = tree.get(dir).chain.clone();
    let mut pending_name = LongNameBuffer::default();
    let mut subdirs = Vec::new();

    for cluster in chain {
        let data = ctx.read_cluster(cluster)?;
        let base = ctx.geometry().cluster_offset(cluster);
        for (i, slot) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let mut rec: RecordBytes = [0u8; DIR_ENTRY_SIZE];
            rec.copy_from_slice(slot);
            let offset = base + (i * DIR_ENTRY_SIZE) as u64;

            match RawRecord::decode(&rec) {
                RawRecord::Free => pending_name.clear(),
                RawRecord::Deleted => {
                    ctx.zero_record(offset)?;
                    debug!("cleared deleted record at 0x{offset:X}");
                    pending_name.clear();
                }
                RawRecord::VolumeLabel => pending_name.clear(),
                RawRecord::LongName(fragment) => {
                    if fragment.is_last {
                        pending_name.clear();
                    }
                    pending_name.push(&fragment);
                }
                RawRecord::Short(short) => {
                    if short.is_dot() || short.is_dotdot() {
                        pending_name.clear();
                        add_record_alias(tree, dir, &short);
                        continue;
                    }
                    let name = match pending_name.take() {
                        Some((long, sum)) if sum == lfn_checksum(&short.name) => long,
                        Some((long, _)) => {
                            warn!(
                                "orphaned long name {long:?} before {:?}, using short name",
                                short.display_name()
                            );
                            short.display_name()
                        }
                        None => short.display_name(),
                    };
                    if tree.find_live_child(dir, &name).is_some() {
                        warn!("duplicate entry {name:?} in directory {:?}", tree.get(dir).name);
                    }

                    if short.is_directory() && short.first_cluster == 0 {
                        warn!("directory {name:?} has no cluster; it is read-only");
                    }
                    let chain = ctx.chain_of(short.first_cluster)?;
                    let child = tree.add(Node::from_record(name, &short, chain));
                    tree.attach(dir, child);
                    if short.is_directory() {
                        subdirs.push(child);
                    }
                }
            }
        }
    }
    Ok(subdirs)
}

fn add_record_alias(tree: &mut Tree, dir: NodeId, short: &ShortRecord) {
    if short.is_dot() {
        tree.add_alias(dir, ".", dir);
    } else if let Some(parent) = tree.get(dir).parent {
        if tree.find_alias(dir, "..").is_none() {
            tree.add_alias(dir, "..", parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::dirent::{alias_short_name, encode_long_name, ATTR_ARCHIVE, ATTR_DIRECTORY};
    use crate::fs::format::{format_volume, FormatOptions};
    use std::io::Cursor;

    fn make_ctx() -> VolumeContext<Cursor<Vec<u8>>> {
        let mut cursor = Cursor::new(Vec::new());
        let opts = FormatOptions {
            total_bytes: 1024 * 1024,
            sectors_per_cluster: 1,
            ..FormatOptions::default()
        };
        format_volume(&mut cursor, 0, &opts).unwrap();
        VolumeContext::open(cursor, 0).unwrap()
    }

    /// Write `name` as fragments plus a short record starting at `offset`;
    /// returns the offset after the last record.
    fn put_entry(
        ctx: &mut VolumeContext<Cursor<Vec<u8>>>,
        mut offset: u64,
        name: &str,
        short: &ShortRecord,
    ) -> u64 {
        for rec in encode_long_name(name, lfn_checksum(&short.name)) {
            ctx.write_record(offset, &rec).unwrap();
            offset += 32;
        }
        ctx.write_record(offset, &short.encode()).unwrap();
        offset + 32
    }

    #[test]
    fn test_empty_volume_has_only_root() {
        let mut ctx = make_ctx();
        let tree = build_tree(&mut ctx).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(tree.root()).name, "/");
        assert!(tree.get(tree.root()).parent.is_none());
    }

    #[test]
    fn test_builds_nested_entries() {
        let mut ctx = make_ctx();
        let now = FatTimestamp::now();
        let root_base = ctx.geometry().cluster_offset(2);
        let sub_base = ctx.geometry().cluster_offset(3);
        let eoc = ctx.geometry().eoc_sentinel;
        ctx.set_fat_entry(3, eoc).unwrap();

        let dir = ShortRecord::new(alias_short_name(1), ATTR_DIRECTORY, 3, now);
        put_entry(&mut ctx, root_base, "Documents", &dir);

        let dot = ShortRecord::new(crate::fs::dirent::DOT_NAME, ATTR_DIRECTORY, 3, now);
        let dotdot = ShortRecord::new(crate::fs::dirent::DOTDOT_NAME, ATTR_DIRECTORY, 0, now);
        ctx.write_record(sub_base, &dot.encode()).unwrap();
        ctx.write_record(sub_base + 32, &dotdot.encode()).unwrap();
        let file = ShortRecord::new(alias_short_name(1), ATTR_ARCHIVE, 0, now);
        put_entry(&mut ctx, sub_base + 64, "a file with a long name.txt", &file);

        let tree = build_tree(&mut ctx).unwrap();
        let docs = tree.find_child(tree.root(), "Documents").unwrap();
        assert!(tree.get(docs).is_directory());
        assert_eq!(tree.get(docs).chain, vec![3]);
        assert_eq!(tree.get(docs).order, 1);

        let f = tree.find_child(docs, "a file with a long name.txt").unwrap();
        assert!(tree.get(f).is_file());
        assert_eq!(tree.get(f).parent, Some(docs));

        let up = tree.find_child(docs, "..").unwrap();
        assert_eq!(tree.target_of(up), tree.root());
        let here = tree.find_child(docs, ".").unwrap();
        assert_eq!(tree.target_of(here), docs);
        assert_eq!(tree.live_children(docs).count(), 1);
    }

    #[test]
    fn test_deleted_records_are_zeroed() {
        let mut ctx = make_ctx();
        let base = ctx.geometry().cluster_offset(2);
        let mut rec = [b'X'; DIR_ENTRY_SIZE];
        rec[0] = 0xE5;
        rec[11] = ATTR_ARCHIVE;
        ctx.write_record(base + 32, &rec).unwrap();

        let tree = build_tree(&mut ctx).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(ctx.read_record(base + 32).unwrap(), [0u8; DIR_ENTRY_SIZE]);
    }

    #[test]
    fn test_checksum_mismatch_falls_back_to_short_name() {
        let mut ctx = make_ctx();
        let base = ctx.geometry().cluster_offset(2);
        let short = ShortRecord::new(alias_short_name(4), ATTR_ARCHIVE, 0, FatTimestamp::now());
        let frags = encode_long_name("mismatch", lfn_checksum(&short.name).wrapping_add(1));
        ctx.write_record(base, &frags[0]).unwrap();
        ctx.write_record(base + 32, &short.encode()).unwrap();

        let tree = build_tree(&mut ctx).unwrap();
        assert!(tree.find_child(tree.root(), "~4").is_some());
        assert!(tree.find_child(tree.root(), "mismatch").is_none());
    }

    #[test]
    fn test_short_only_entry_uses_8_3_name() {
        let mut ctx = make_ctx();
        let base = ctx.geometry().cluster_offset(2);
        let short = ShortRecord::new(*b"README  TXT", ATTR_ARCHIVE, 0, FatTimestamp::now());
        ctx.write_record(base, &short.encode()).unwrap();

        let tree = build_tree(&mut ctx).unwrap();
        assert!(tree.find_child(tree.root(), "README.TXT").is_some());
    }

    #[test]
    fn test_free_slot_breaks_pending_name() {
        let mut ctx = make_ctx();
        let base = ctx.geometry().cluster_offset(2);
        let short = ShortRecord::new(alias_short_name(1), ATTR_ARCHIVE, 0, FatTimestamp::now());
        let frags = encode_long_name("split", lfn_checksum(&short.name));
        ctx.write_record(base, &frags[0]).unwrap();
        // slot base + 32 left free
        ctx.write_record(base + 64, &short.encode()).unwrap();

        let tree = build_tree(&mut ctx).unwrap();
        assert!(tree.find_child(tree.root(), "~1").is_some());
    }

    #[test]
    fn test_next_order_and_ancestry() {
        let mut tree = Tree::new(2, vec![2]);
        let root = tree.root();
        let short = ShortRecord::new(alias_short_name(5), ATTR_DIRECTORY, 3, FatTimestamp::now());
        let a = tree.add(Node::from_record("a".into(), &short, vec![3]));
        tree.attach(root, a);
        tree.add_dot_aliases(a);
        assert_eq!(tree.next_order(root).unwrap(), 6);
        assert_eq!(tree.next_order(a).unwrap(), 1);
        assert!(tree.is_ancestor(root, a));
        assert!(!tree.is_ancestor(a, root));

        let now = FatTimestamp::now();
        let short = ShortRecord::new(alias_short_name(MAX_ORDER), ATTR_ARCHIVE, 0, now);
        let top = tree.add(Node::from_record("top".into(), &short, Vec::new()));
        tree.attach(a, top);
        assert_eq!(tree.next_order(a).unwrap(), 1);
        let short = ShortRecord::new(alias_short_name(1), ATTR_ARCHIVE, 0, now);
        let first = tree.add(Node::from_record("first".into(), &short, Vec::new()));
        tree.attach(a, first);
        assert_eq!(tree.next_order(a).unwrap(), 2);

        tree.detach(a);
        assert_eq!(tree.live_children(root).count(), 0);
        assert!(tree.get(a).parent.is_none());
    }
}
