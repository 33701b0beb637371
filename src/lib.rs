mod engine;
mod error;
mod key;
mod node;
mod node_manager;
mod node_map;
mod options;
mod page_store;
mod tree;
mod varint;
mod wal;
mod write_batch;

pub use crate::engine::Engine;
pub use crate::error::{Error, Result, StorageError};
pub use crate::key::{bytes_from, ByteComparator, Bytes, Comparator};
pub use crate::options::{Options, ReadOptions, WriteOptions};
pub use crate::page_store::{FilePageStore, PageStore};
pub use crate::write_batch::WriteBatch;
