pub mod clock_cache;
pub mod ref_cache;

use crate::{storage::paged_file::PagedFile, types::DomResult};

/// What a cache needs from its elements: identity, dirtiness, whether the
/// element may be dropped, and how to write it back. The file is passed
/// into the write path instead of being stored on the element, so pages
/// and caches never hold references to each other.
pub trait Cacheable {
    /// The page number the element came from.
    fn cache_key(&self) -> u32;

    fn is_dirty(&self) -> bool;

    /// Whether the element may leave the cache right now.
    fn allow_unload(&self) -> bool;

    /// Write the element back to disk and mark it clean.
    fn sync(&mut self, file: &PagedFile) -> DomResult<()>;

    fn ref_count(&self) -> u32;
    fn increment_ref(&mut self);
    fn decrement_ref(&mut self);
    fn set_ref_count(&mut self, count: u32);
}
