//! Engine configuration (ambient stack): open options plus the small
//! per-call option structs the public API takes, in the style of
//! `storage/btree/page_cache.rs`'s `PageCacheConfig`.

/// Options governing `Engine::open`.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the database directory and page store if they don't exist.
    pub create_if_missing: bool,
    /// Branching parameter B for the tree (every non-root node holds
    /// between B and 2B+1 entries).
    pub branching_factor: usize,
    /// Checkpoint automatically after this many applied write-batch ops,
    /// 0 disables automatic checkpointing.
    pub checkpoint_after_updates: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            branching_factor: 32,
            checkpoint_after_updates: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub sync: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {}
