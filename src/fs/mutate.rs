//! Creating and moving entries.
//!
//! Every operation checks its preconditions and secures the space it needs
//! before the first destructive write. Failures after that point come back as
//! [`VolumeError::PartialFailure`].

use std::io::{Read, Seek, Write};

use log::debug;

use super::context::{RecordBytes, VolumeContext};
use super::dirent::{
    alias_short_name, encode_long_name, fragment_count, lfn_checksum, set_fragment_checksum,
    utf16_len, FatTimestamp, RawRecord, ShortRecord, ATTR_ARCHIVE, ATTR_DIRECTORY, DOTDOT_NAME,
    DOT_NAME, MAX_NAME_UNITS,
};
use super::entry::EntryType;
use super::geometry::DIR_ENTRY_SIZE;
use super::tree::{Node, NodeId, Tree};
use crate::error::VolumeError;

/// Directory records of one entry, as found in its parent.
#[derive(Debug, Clone)]
pub struct LocatedRecords {
    /// Absolute offsets, fragments first and the short record last.
    pub offsets: Vec<u64>,
    pub records: Vec<RecordBytes>,
}

impl LocatedRecords {
    fn short_offset(&self) -> u64 {
        self.offsets[self.offsets.len() - 1]
    }

    fn fragment_count(&self) -> usize {
        self.records.len() - 1
    }
}

/// Check that `name` can be stored as a long name.
pub fn validate_name(name: &str) -> Result<(), VolumeError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
        || utf16_len(name) > MAX_NAME_UNITS
    {
        return Err(VolumeError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Map an error from the commit phase of `operation`.
fn committed<T>(operation: &'static str, result: Result<T, VolumeError>) -> Result<T, VolumeError> {
    result.map_err(|source| VolumeError::PartialFailure {
        operation,
        source: Box::new(source),
    })
}

/// Create a file or directory called `name` inside `parent`.
pub fn create_child<D: Read + Write + Seek>(
    ctx: &mut VolumeContext<D>,
    tree: &mut Tree,
    parent: NodeId,
    name: &str,
    kind: EntryType,
) -> Result<NodeId, VolumeError> {
    let parent = tree.target_of(parent);
    if !tree.get(parent).is_directory() {
        return Err(VolumeError::InvalidOperation(format!(
            "{} is not a directory",
            tree.absolute_path(parent)
        )));
    }
    writable_directory(tree, parent)?;
    validate_name(name)?;
    if tree.find_live_child(parent, name).is_some() {
        return Err(VolumeError::AlreadyExists(name.to_string()));
    }
    let order = tree.next_order(parent)?;

    let record_count = fragment_count(name) + 1;
    let mut parent_chain = tree.get(parent).chain.clone();
    let (slots, growth) = ctx.slots_for(&mut parent_chain, record_count)?;
    tree.get_mut(parent).chain = parent_chain.clone();

    // A directory needs its own cluster before any record is written.
    let mut own_chain = Vec::new();
    if kind == EntryType::Directory {
        if let Err(e) = ctx.reserve_clusters(&mut own_chain, 2) {
            committed("create", ctx.release_growth(&mut parent_chain, growth))?;
            tree.get_mut(parent).chain = parent_chain;
            committed("create", ctx.flush())?;
            return Err(e);
        }
    }

    let short_name = alias_short_name(order);
    let checksum = lfn_checksum(&short_name);
    let now = FatTimestamp::now();
    let attr = match kind {
        EntryType::Directory => ATTR_DIRECTORY,
        EntryType::File => ATTR_ARCHIVE,
    };
    let first_cluster = own_chain.first().copied().unwrap_or(0);
    let short = ShortRecord::new(short_name, attr, first_cluster, now);

    let mut records = encode_long_name(name, checksum);
    records.push(short.encode());

    committed("create", (|| -> Result<NodeId, VolumeError> {
        for (&offset, rec) in slots.iter().zip(records.iter()) {
            ctx.write_record(offset, rec)?;
        }
        touch_directory(ctx, tree, parent, now)?;

        let child = tree.add(Node::from_record(name.to_string(), &short, own_chain));
        tree.attach(parent, child);
        if kind == EntryType::Directory {
            let parent_cluster = cluster_ref(tree, parent);
            let base = ctx.geometry().cluster_offset(first_cluster);
            let dot = ShortRecord::new(DOT_NAME, ATTR_DIRECTORY, first_cluster, now);
            let dotdot = ShortRecord::new(DOTDOT_NAME, ATTR_DIRECTORY, parent_cluster, now);
            ctx.write_record(base, &dot.encode())?;
            ctx.write_record(base + DIR_ENTRY_SIZE as u64, &dotdot.encode())?;
            tree.add_dot_aliases(child);
        }
        ctx.flush()?;

        debug!(
            "created {} {} ({} record(s), order {order})",
            if kind == EntryType::Directory { "directory" } else { "file" },
            tree.absolute_path(child),
            records.len()
        );
        Ok(child)
    })())
}

/// Move `source` into the directory `destination`, keeping its name.
pub fn move_node<D: Read + Write + Seek>(
    ctx: &mut VolumeContext<D>,
    tree: &mut Tree,
    source: NodeId,
    destination: NodeId,
) -> Result<(), VolumeError> {
    if source == tree.root() {
        return Err(VolumeError::InvalidOperation("cannot move the root directory".into()));
    }
    if tree.get(source).is_alias() {
        return Err(VolumeError::InvalidOperation(format!(
            "cannot move {:?}",
            tree.get(source).name
        )));
    }
    let destination = tree.target_of(destination);
    if !tree.get(destination).is_directory() {
        return Err(VolumeError::InvalidOperation(format!(
            "{} is not a directory",
            tree.absolute_path(destination)
        )));
    }
    let old_parent = tree
        .get(source)
        .parent
        .ok_or_else(|| VolumeError::InvalidOperation("entry is not attached".into()))?;
    if old_parent == destination {
        return Err(VolumeError::InvalidOperation(format!(
            "{} is already in {}",
            tree.get(source).name,
            tree.absolute_path(destination)
        )));
    }
    if tree.is_ancestor(source, destination) {
        return Err(VolumeError::InvalidOperation(format!(
            "cannot move {} into itself",
            tree.absolute_path(source)
        )));
    }
    writable_directory(tree, destination)?;
    let name = tree.get(source).name.clone();
    if tree.find_live_child(destination, &name).is_some() {
        return Err(VolumeError::AlreadyExists(name));
    }

    // Decide: capture the records and secure the destination slots.
    let located = locate_records(ctx, tree, old_parent, source)?;
    let order = tree.next_order(destination)?;
    let mut dest_chain = tree.get(destination).chain.clone();
    let (slots, _growth) = ctx.slots_for(&mut dest_chain, located.records.len())?;
    tree.get_mut(destination).chain = dest_chain;

    let from = tree.absolute_path(source);
    committed("move", (|| -> Result<(), VolumeError> {
        let now = FatTimestamp::now();
        for &offset in &located.offsets {
            ctx.zero_record(offset)?;
        }
        touch_directory(ctx, tree, old_parent, now)?;
        tree.detach(source);

        if tree.get(source).is_directory() {
            let dest_cluster = cluster_ref(tree, destination);
            rewrite_dotdot(ctx, tree.get(source).first_cluster, dest_cluster)?;
        }

        let mut records = located.records.clone();
        let last = records.len() - 1;
        let mut short = ShortRecord::decode(&records[last]);
        // Entries without a long name are displayed by their short name,
        // which therefore has to survive the move.
        if located.fragment_count() > 0 {
            short.name = alias_short_name(order);
            let checksum = lfn_checksum(&short.name);
            for rec in &mut records[..last] {
                set_fragment_checksum(rec, checksum);
            }
            records[last] = short.encode();

            let node = tree.get_mut(source);
            node.order = order;
            node.short_name = short.name;
            node.checksum = checksum;
        }

        for (&offset, rec) in slots.iter().zip(records.iter()) {
            ctx.write_record(offset, rec)?;
        }
        touch_directory(ctx, tree, destination, now)?;
        tree.attach(destination, source);
        ctx.flush()?;

        debug!("moved {from} -> {}", tree.absolute_path(source));
        Ok(())
    })())
}

/// Subdirectories without a cluster cannot take new entries.
fn writable_directory(tree: &Tree, dir: NodeId) -> Result<(), VolumeError> {
    if dir != tree.root() && tree.get(dir).first_cluster == 0 {
        return Err(VolumeError::Corruption(format!(
            "directory {} has no cluster",
            tree.absolute_path(dir)
        )));
    }
    Ok(())
}

/// Cluster number a `..` record uses to refer to `dir` (0 for the root).
fn cluster_ref(tree: &Tree, dir: NodeId) -> u32 {
    if dir == tree.root() {
        0
    } else {
        tree.get(dir).first_cluster
    }
}

/// Point the `..` record in a directory's first cluster at `parent_cluster`.
fn rewrite_dotdot<D: Read + Write + Seek>(
    ctx: &mut VolumeContext<D>,
    first_cluster: u32,
    parent_cluster: u32,
) -> Result<(), VolumeError> {
    if first_cluster == 0 {
        return Ok(());
    }
    let data = ctx.read_cluster(first_cluster)?;
    let base = ctx.geometry().cluster_offset(first_cluster);
    for (i, slot) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
        let mut rec: RecordBytes = [0u8; DIR_ENTRY_SIZE];
        rec.copy_from_slice(slot);
        if let RawRecord::Short(mut short) = RawRecord::decode(&rec) {
            if short.is_dotdot() {
                short.first_cluster = parent_cluster;
                return ctx.write_record(base + (i * DIR_ENTRY_SIZE) as u64, &short.encode());
            }
        }
    }
    Err(VolumeError::Corruption(format!(
        "directory at cluster {first_cluster} has no '..' record"
    )))
}

/// Set the modified time of `dir`'s own record in its parent.
///
/// The root directory has no record and is left alone.
pub fn touch_directory<D: Read + Write + Seek>(
    ctx: &mut VolumeContext<D>,
    tree: &mut Tree,
    dir: NodeId,
    now: FatTimestamp,
) -> Result<(), VolumeError> {
    let Some(parent) = tree.get(dir).parent else {
        return Ok(());
    };
    let located = locate_records(ctx, tree, parent, dir)?;
    let offset = located.short_offset();
    let mut short = ShortRecord::decode(&located.records[located.records.len() - 1]);
    short.touch(now);
    ctx.write_record(offset, &short.encode())?;
    tree.get_mut(dir).modified = short.modified;
    Ok(())
}

/// Find the records belonging to `node` in the directory `parent`.
///
/// That is the short record carrying the node's short name, plus the
/// contiguous fragments right before it that carry the node's checksum.
pub fn locate_records<D: Read + Write + Seek>(
    ctx: &mut VolumeContext<D>,
    tree: &Tree,
    parent: NodeId,
    node: NodeId,
) -> Result<LocatedRecords, VolumeError> {
    let target = tree.get(node);
    let mut run = LocatedRecords {
        offsets: Vec::new(),
        records: Vec::new(),
    };

    for &cluster in &tree.get(parent).chain {
        let data = ctx.read_cluster(cluster)?;
        let base = ctx.geometry().cluster_offset(cluster);
        for (i, slot) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let mut rec: RecordBytes = [0u8; DIR_ENTRY_SIZE];
            rec.copy_from_slice(slot);
            let offset = base + (i * DIR_ENTRY_SIZE) as u64;

            match RawRecord::decode(&rec) {
                RawRecord::LongName(fragment) if fragment.checksum == target.checksum => {
                    if fragment.is_last {
                        run.offsets.clear();
                        run.records.clear();
                    }
                    run.offsets.push(offset);
                    run.records.push(rec);
                }
                RawRecord::Short(short) if short.name == target.short_name => {
                    run.offsets.push(offset);
                    run.records.push(rec);
                    return Ok(run);
                }
                _ => {
                    run.offsets.clear();
                    run.records.clear();
                }
            }
        }
    }

    Err(VolumeError::Corruption(format!(
        "no directory record for {}",
        tree.absolute_path(node)
    )))
}
