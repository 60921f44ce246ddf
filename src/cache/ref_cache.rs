use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use log::{debug, warn};

use crate::{
    cache::Cacheable,
    storage::paged_file::PagedFile,
    types::{DomResult, Pod},
    utils::HandyRwLock,
};

// restarts of the eviction scan before giving up
const MAX_RESTARTS: usize = 4;

/// Reference-counted bounded cache used for B+-tree nodes. Elements are
/// pinned by incrementing their reference count and released by the tree
/// when it is done with them; eviction scans in insertion order for the
/// oldest element that `allow_unload()`s, syncing it first when dirty.
pub struct RefCountCache<T: Cacheable> {
    capacity: usize,
    map: HashMap<u32, Pod<T>>,
    order: VecDeque<u32>,
    hits: u64,
    misses: u64,
}

impl<T: Cacheable> RefCountCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn get(&mut self, key: u32) -> Option<Pod<T>> {
        match self.map.get(&key) {
            Some(entry) => {
                self.hits += 1;
                Some(Arc::clone(entry))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn add(&mut self, file: &PagedFile, item: Pod<T>, initial_ref: u32) -> DomResult<()> {
        let key = item.rl().cache_key();

        if let Some(existing) = self.map.get(&key) {
            existing.wl().increment_ref();
            return Ok(());
        }

        item.wl().set_ref_count(initial_ref);
        self.map.insert(key, item);
        self.order.push_back(key);

        while self.map.len() > self.capacity {
            if !self.evict_one(file, key)? {
                warn!(
                    "no unloadable node, cache temporarily holds {} of {}",
                    self.map.len(),
                    self.capacity
                );
                break;
            }
        }
        Ok(())
    }

    fn evict_one(&mut self, file: &PagedFile, protect: u32) -> DomResult<bool> {
        for _ in 0..MAX_RESTARTS {
            let snapshot: Vec<u32> = self.order.iter().copied().collect();
            for key in snapshot {
                if key == protect {
                    continue;
                }
                let entry = match self.map.get(&key) {
                    Some(e) => Arc::clone(e),
                    None => continue,
                };

                // a node whose lock is taken is mid-operation, skip it
                let mut item = match entry.try_write() {
                    Ok(guard) => guard,
                    Err(_) => continue,
                };
                if item.allow_unload() && Arc::strong_count(&entry) <= 2 {
                    if item.is_dirty() {
                        item.sync(file)?;
                    }
                    drop(item);
                    self.map.remove(&key);
                    self.order.retain(|k| *k != key);
                    debug!("unloaded node {}", key);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn remove(&mut self, key: u32) -> Option<Pod<T>> {
        self.order.retain(|k| *k != key);
        self.map.remove(&key)
    }

    pub fn flush(&self, file: &PagedFile) -> DomResult<()> {
        for entry in self.map.values() {
            let mut item = entry.wl();
            if item.is_dirty() {
                item.sync(file)?;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}
