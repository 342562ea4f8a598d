use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::Path;

use log::info;

use super::context::VolumeContext;
use super::entry::{EntryType, FileEntry};
use super::geometry::Geometry;
use super::mutate;
use super::path::{split_parent, split_path};
use super::tree::{build_tree, Node, NodeId, NodeKind, Tree};
use crate::error::VolumeError;

/// An open FAT32 volume: the image plus its in-memory directory tree.
pub struct Volume<D> {
    ctx: VolumeContext<D>,
    tree: Tree,
}

impl Volume<File> {
    /// Open an image file read-write at `partition_offset`.
    pub fn open_path(path: impl AsRef<Path>, partition_offset: u64) -> Result<Self, VolumeError> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        info!("opening {}", path.as_ref().display());
        Self::open_at(file, partition_offset)
    }
}

impl<D: Read + Write + Seek> Volume<D> {
    /// Open a volume that starts at byte 0 of `device`.
    pub fn open(device: D) -> Result<Self, VolumeError> {
        Self::open_at(device, 0)
    }

    pub fn open_at(device: D, partition_offset: u64) -> Result<Self, VolumeError> {
        let mut ctx = VolumeContext::open(device, partition_offset)?;
        let tree = build_tree(&mut ctx)?;
        ctx.flush()?;
        Ok(Self { ctx, tree })
    }

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.tree.get(id)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn geometry(&self) -> &Geometry {
        self.ctx.geometry()
    }

    /// Advisory free-cluster count from FSInfo (`0xFFFFFFFF` when unknown).
    pub fn free_clusters(&self) -> u32 {
        self.ctx.free_clusters()
    }

    pub fn into_inner(self) -> D {
        self.ctx.into_inner()
    }

    /// Resolve `path` relative to the directory `cwd`.
    pub fn resolve(&self, cwd: NodeId, path: &str) -> Result<NodeId, VolumeError> {
        self.tree.resolve(cwd, &split_path(path))
    }

    pub fn absolute_path(&self, id: NodeId) -> String {
        self.tree.absolute_path(id)
    }

    /// Entries of a directory in on-disk order, without `.` and `..`.
    pub fn list_children(&self, dir: NodeId) -> Result<Vec<FileEntry>, VolumeError> {
        let dir = self.tree.target_of(dir);
        if !self.tree.get(dir).is_directory() {
            return Err(VolumeError::InvalidOperation(format!(
                "{} is not a directory",
                self.tree.absolute_path(dir)
            )));
        }
        Ok(self
            .tree
            .live_children(dir)
            .map(|id| self.entry(id))
            .collect())
    }

    /// Listing record for a single node.
    pub fn entry(&self, id: NodeId) -> FileEntry {
        let node = self.tree.get(id);
        let entry_type = if node.kind == NodeKind::Directory {
            EntryType::Directory
        } else {
            EntryType::File
        };
        FileEntry {
            id,
            name: node.name.clone(),
            path: self.tree.absolute_path(id),
            entry_type,
            size: node.size as u64,
            location: node.first_cluster as u64,
            created: node.created,
            modified: node.modified,
        }
    }

    pub fn create_directory(&mut self, cwd: NodeId, path: &str) -> Result<NodeId, VolumeError> {
        self.create_at(cwd, path, EntryType::Directory)
    }

    pub fn create_file(&mut self, cwd: NodeId, path: &str) -> Result<NodeId, VolumeError> {
        self.create_at(cwd, path, EntryType::File)
    }

    fn create_at(
        &mut self,
        cwd: NodeId,
        path: &str,
        kind: EntryType,
    ) -> Result<NodeId, VolumeError> {
        let (parent_components, name) =
            split_parent(path).ok_or_else(|| VolumeError::InvalidName(path.to_string()))?;
        let parent = if parent_components.is_empty() {
            cwd
        } else {
            self.tree.resolve(cwd, &parent_components)?
        };
        self.create_child(parent, &name, kind)
    }

    /// Create `name` directly inside `parent`.
    pub fn create_child(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: EntryType,
    ) -> Result<NodeId, VolumeError> {
        mutate::create_child(&mut self.ctx, &mut self.tree, parent, name, kind)
    }

    /// Contents of the file at `path`, truncated to its recorded size.
    pub fn read_file(&mut self, cwd: NodeId, path: &str) -> Result<Vec<u8>, VolumeError> {
        let id = self.resolve(cwd, path)?;
        let node = self.tree.get(id);
        if !node.is_file() {
            return Err(VolumeError::InvalidOperation(format!(
                "{} is not a file",
                self.tree.absolute_path(id)
            )));
        }
        let size = node.size as usize;
        let chain = node.chain.clone();
        let mut data = self.ctx.read_chain_data(&chain)?;
        data.truncate(size);
        Ok(data)
    }

    /// Move the entry at `source` into the directory at `destination`.
    pub fn move_entry(
        &mut self,
        cwd: NodeId,
        source: &str,
        destination: &str,
    ) -> Result<(), VolumeError> {
        let source = self.resolve(cwd, source)?;
        let destination = self.resolve(cwd, destination)?;
        self.move_node(source, destination)
    }

    pub fn move_node(&mut self, source: NodeId, destination: NodeId) -> Result<(), VolumeError> {
        mutate::move_node(&mut self.ctx, &mut self.tree, source, destination)
    }
}
