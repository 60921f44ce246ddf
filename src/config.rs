use std::time::Duration;

use crate::storage::page::DEFAULT_PAGE_SIZE;

/// Engine tuning knobs. The defaults match what the storage layer was
/// designed around; `page_size` only matters on `create`, afterwards the
/// value persisted in the file header wins.
#[derive(Clone, Debug)]
pub struct DomConfig {
    /// Size of a disk page in bytes.
    pub page_size: u32,

    /// Capacity of the B+-tree node cache.
    pub btree_buffers: usize,

    /// Capacity of the data-page cache.
    pub data_buffers: usize,

    /// Fixed key length hint, recorded in the file header.
    pub key_len: Option<u16>,

    /// Budget for a single lock acquisition.
    pub lock_timeout: Duration,

    /// Reject every mutating operation with `ReadOnly`.
    pub read_only: bool,
}

impl Default for DomConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            btree_buffers: 256,
            data_buffers: 256,
            key_len: None,
            lock_timeout: Duration::from_millis(60_000),
            read_only: false,
        }
    }
}
