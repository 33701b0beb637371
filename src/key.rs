//! Key comparator (C1) and the shared byte-string representation used for
//! both keys and values throughout the tree.

use std::cmp::Ordering;
use std::sync::Arc;

/// Immutable byte string with shared-ownership semantics: cheap to clone,
/// backing buffer shared via refcounting. An empty `Bytes` marks "absent"
/// in lookup results.
pub type Bytes = Arc<[u8]>;

pub fn bytes_from(data: impl Into<Vec<u8>>) -> Bytes {
    Arc::from(data.into().into_boxed_slice())
}

/// Total order over byte-string keys, injected into the tree. The default
/// is plain lexicographic order over the raw bytes.
pub trait Comparator: Send + Sync + 'static {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ByteComparator;

impl Comparator for ByteComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}
