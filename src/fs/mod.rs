//! FAT32 volume engine.
//!
//! [`Volume`] is the entry point: it parses the boot sector, rebuilds the
//! directory tree from the image and applies mutations straight back to it.

pub mod alloc;
pub mod context;
pub mod dirent;
pub mod entry;
pub mod fat;
pub mod format;
pub mod geometry;
pub mod mutate;
pub mod path;
pub mod tree;
pub mod volume;

pub use entry::{EntryType, FileEntry};
pub use format::{format_volume, FormatOptions, FormatSummary};
pub use geometry::Geometry;
pub use tree::{Node, NodeId, NodeKind, Tree};
pub use volume::Volume;
