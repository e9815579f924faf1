//! Overlay filesystem module for layerfs
//!
//! Provides a union view where:
//! - Primary root: consulted first for every lookup
//! - Fallback root: consulted when the primary lacks an entry
//! - In-memory layer: files and directories created through the mount,
//!   discarded at unmount

mod dispatcher;
mod filesystem;
mod handle;
mod inode;
mod locator;
mod memory;
mod merger;
mod passthrough;
mod resolver;

pub use dispatcher::Dispatcher;
pub use filesystem::OverlayFs;
pub use handle::HandleCounter;
pub use inode::{InodeTable, NodeAttributes, NodeKind, ROOT_INO};
pub use locator::{BackingLocator, Layer};
pub use memory::MemoryTable;
pub use merger::{DirectoryMerger, EntrySource, MergedEntry};
pub use passthrough::{LocalPassthrough, Passthrough, StatFs};
pub use resolver::{Resolution, Resolver};
