use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
};

use log::{debug, error, warn};

use crate::{
    btree::{query::IndexQuery, tree::BTree},
    cache::clock_cache::ClockCache,
    config::DomConfig,
    dom::{
        iterator::RecordIterator,
        node::{DocumentShape, NodeKey, NodeProxy},
    },
    error::{DomError, ErrorKind},
    lock::{LockMode, TimeoutLock},
    session::Session,
    storage::{
        page::{DataPage, RECORD_OVERHEAD},
        paged_file::PagedFile,
        pointer::{create_pointer, page_from_pointer, tid_from_pointer},
    },
    types::{DomResult, Pod, ResultPod},
    utils::HandyRwLock,
};

/// Cache traffic and record totals, for monitoring hooks.
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub data_hits: u64,
    pub data_misses: u64,
    pub node_hits: u64,
    pub node_misses: u64,
    pub total_records: i64,
}

// what `remove_record` tells the iterator about the aftermath
pub(crate) struct RemovedRecord {
    pub len: usize,
    pub page_drained: bool,
    pub next_page: i64,
}

/// The DOM storage engine: serialized node values in document order on a
/// chain of data pages, indexed by the B+-tree from node keys to virtual
/// addresses, everything behind one owner-aware lock.
///
/// Mutating operations run under an exclusive acquisition, reads under a
/// shared one. A value's address stays valid across page splits; it is
/// resolved by scanning the chain from the address' origin page.
pub struct DomFile {
    file: PagedFile,
    pages: Pod<ClockCache<DataPage>>,
    btree: BTree,
    lock: TimeoutLock,

    // owner handle -> current append tail
    tails: Pod<HashMap<u64, u32>>,
}

impl DomFile {
    /// Create a fresh store, truncating anything at `path`.
    pub fn create<P: AsRef<Path>>(path: P, config: &DomConfig) -> DomResult<Self> {
        let file = PagedFile::create(path, config)?;
        Ok(Self::assemble(file, config))
    }

    /// Open an existing store; a missing file is created empty.
    pub fn open<P: AsRef<Path>>(path: P, config: &DomConfig) -> DomResult<Self> {
        let file = PagedFile::open(path, config)?;
        Ok(Self::assemble(file, config))
    }

    fn assemble(file: PagedFile, config: &DomConfig) -> Self {
        Self {
            file,
            pages: Arc::new(RwLock::new(ClockCache::new(config.data_buffers))),
            btree: BTree::new(config.btree_buffers),
            lock: TimeoutLock::new(config.lock_timeout),
            tails: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Flush everything and drop the handle.
    pub fn close(self) -> DomResult<()> {
        self.sync()
    }

    pub(crate) fn engine_lock(&self) -> &TimeoutLock {
        &self.lock
    }

    pub(crate) fn check_writable(&self) -> DomResult<()> {
        if self.file.is_read_only() {
            return Err(DomError::new(
                ErrorKind::ReadOnly,
                &format!("{:?} was opened read-only", self.file.path()),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // page plumbing
    // ------------------------------------------------------------------

    /// Fetch a data page through the clock cache. Every touch counts as an
    /// `add`: a resident page gets its reference count bumped, a missing one
    /// is read off the disk and inserted.
    pub(crate) fn data_page(&self, page_no: u32) -> ResultPod<DataPage> {
        let cached = self.pages.wl().get(page_no);
        let pod = match cached {
            Some(pod) => pod,
            None => {
                let bytes = self.file.read_page(page_no)?;
                let page = DataPage::parse(page_no, &bytes, self.file.work_size())?;
                Arc::new(RwLock::new(page))
            }
        };
        self.pages.wl().add(&self.file, Arc::clone(&pod), 1)?;
        Ok(pod)
    }

    fn new_data_page(&self) -> ResultPod<DataPage> {
        let page_no = self.file.get_free_page()?;
        let pod = Arc::new(RwLock::new(DataPage::new(page_no, self.file.work_size())));
        self.pages.wl().add(&self.file, Arc::clone(&pod), 1)?;
        debug!("new data page {}", page_no);
        Ok(pod)
    }

    /// The owner's current append tail, created on first use.
    fn tail_page(&self, owner: u64) -> ResultPod<DataPage> {
        let existing = self.tails.rl().get(&owner).copied();
        match existing {
            Some(page_no) => self.data_page(page_no),
            None => {
                let pod = self.new_data_page()?;
                let page_no = pod.rl().page_no();
                self.tails.wl().insert(owner, page_no);
                Ok(pod)
            }
        }
    }

    /// Point the owner's append tail somewhere else, e.g. after a bulk load
    /// repositioned the chain.
    pub fn set_current_page(&self, session: &Session, page_no: u32) {
        self.tails.wl().insert(session.id(), page_no);
    }

    /// Forget the owner's append state.
    pub fn close_document(&self, session: &Session) {
        self.tails.wl().remove(&session.id());
    }

    /// Splice `fresh` into the chain directly behind `left`.
    fn splice_after(&self, left: &Pod<DataPage>, fresh: &Pod<DataPage>) -> DomResult<()> {
        let following = left.rl().next_page();
        let follow_pod = if following >= 0 {
            Some(self.data_page(following as u32)?)
        } else {
            None
        };

        // borrow of left/fresh start here
        {
            let mut old = left.wl();
            let mut new = fresh.wl();
            new.set_next_page(old.next_page());
            new.set_prev_page(old.page_no() as i64);
            old.set_next_page(new.page_no() as i64);
        }
        // borrow of left/fresh end here

        if let Some(follow) = follow_pod {
            follow.wl().set_prev_page(fresh.rl().page_no() as i64);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // record primitives (callers hold the engine lock)
    // ------------------------------------------------------------------

    /// Resolve a virtual address to `(page, position)` where `position` is
    /// the offset of the record's length field. Walks `next_data_page` when
    /// the tid migrated to a later page in a split.
    pub(crate) fn find_record(&self, pointer: u64) -> DomResult<Option<(Pod<DataPage>, usize)>> {
        let tid = tid_from_pointer(pointer);
        let mut page_no = page_from_pointer(pointer) as i64;

        while page_no >= 0 {
            let pod = self.data_page(page_no as u32)?;
            let outcome = {
                let page = pod.rl();
                match page.find_tid(tid) {
                    Some(position) => Ok(position),
                    None => Err(page.next_page()),
                }
            };
            match outcome {
                Ok(position) => return Ok(Some((pod, position))),
                Err(next) => page_no = next,
            }
        }
        Ok(None)
    }

    pub(crate) fn read_record(&self, pointer: u64) -> DomResult<Option<Vec<u8>>> {
        match self.find_record(pointer)? {
            Some((pod, position)) => {
                let page = pod.rl();
                Ok(Some(page.record_value_at(position).to_vec()))
            }
            None => Ok(None),
        }
    }

    fn check_record_size(&self, value: &[u8]) -> DomResult<()> {
        if value.len() + RECORD_OVERHEAD > self.file.work_size() {
            return Err(DomError::invalid_argument(&format!(
                "value of {} bytes exceeds the {}-byte work area",
                value.len(),
                self.file.work_size()
            )));
        }
        Ok(())
    }

    /// Append a record to the owner's tail page, growing the chain when the
    /// tail is full. Returns the record's virtual address.
    pub(crate) fn add_record(&self, owner: u64, value: &[u8]) -> DomResult<u64> {
        self.check_record_size(value)?;

        let mut pod = self.tail_page(owner)?;
        let fits = pod.rl().can_host(value.len());
        if !fits {
            let fresh = self.new_data_page()?;
            self.splice_after(&pod, &fresh)?;
            let fresh_no = fresh.rl().page_no();
            self.tails.wl().insert(owner, fresh_no);
            debug!(
                "chain grows: {} -> {}",
                pod.rl().page_no(),
                fresh_no
            );
            pod = fresh;
        }

        let (page_no, tid) = {
            let mut page = pod.wl();
            let tid = page.append(value);
            (page.page_no(), tid)
        };
        self.file.increment_total();
        Ok(create_pointer(page_no, tid))
    }

    /// Insert a record in document order directly behind an existing one.
    ///
    /// Three shapes: the value still fits on the page (shift the tail and
    /// drop it in); the existing record is the page's last (hang a fresh
    /// page behind); or the page must split mid-chain, the tail records
    /// moving to a page that inherits the tid allocator.
    pub(crate) fn insert_after_record(&self, pointer: u64, value: &[u8]) -> DomResult<u64> {
        self.check_record_size(value)?;

        let (pod, position) = self.find_record(pointer)?.ok_or_else(|| {
            DomError::invalid_argument(&format!("no record at address {:#x}", pointer))
        })?;

        let (end_of_existing, data_length, fits) = {
            let page = pod.rl();
            let end = position + 2 + page.record_len_at(position);
            let fits = page.data_length() + value.len() + RECORD_OVERHEAD <= page.work_size()
                && page.next_tid() < u16::MAX;
            (end, page.data_length(), fits)
        };

        if fits {
            let (page_no, tid) = {
                let mut page = pod.wl();
                let tid = page.insert_at(end_of_existing, value);
                (page.page_no(), tid)
            };
            self.file.increment_total();
            return Ok(create_pointer(page_no, tid));
        }

        if end_of_existing == data_length {
            // last record of a full page: no tail to move, append a page
            let fresh = self.new_data_page()?;
            self.splice_after(&pod, &fresh)?;
            let (page_no, tid) = {
                let mut page = fresh.wl();
                let tid = page.append(value);
                (page.page_no(), tid)
            };
            self.file.increment_total();
            return Ok(create_pointer(page_no, tid));
        }

        // mid-chain split
        let split_pod = self.new_data_page()?;
        {
            let mut page = pod.wl();
            let mut split = split_pod.wl();
            let tail = page.split_off(end_of_existing);
            split.adopt_tail(&tail);
            // migrated tids keep their values, so the allocator carries over
            split.set_next_tid(page.next_tid());
            page.recount();
            split.recount();
            debug!(
                "page {} splits at {}, {} records move to {}",
                page.page_no(),
                end_of_existing,
                split.record_count(),
                split.page_no()
            );
        }
        self.splice_after(&pod, &split_pod)?;

        let target = if pod.rl().can_host(value.len()) {
            Arc::clone(&pod)
        } else {
            // the freed tail is still too small: the record gets a page of
            // its own between the two halves
            let fresh = self.new_data_page()?;
            self.splice_after(&pod, &fresh)?;
            fresh
        };

        let (page_no, tid) = {
            let mut page = target.wl();
            let tid = page.append(value);
            (page.page_no(), tid)
        };
        self.file.increment_total();
        Ok(create_pointer(page_no, tid))
    }

    /// Overwrite a record in place. Only an equal-length value is accepted:
    /// growing cannot fit and shrinking would orphan tail bytes, both are
    /// rejected rather than papered over.
    pub(crate) fn update_record(&self, pointer: u64, value: &[u8]) -> DomResult<()> {
        let (pod, position) = self.find_record(pointer)?.ok_or_else(|| {
            DomError::invalid_argument(&format!("no record at address {:#x}", pointer))
        })?;

        let mut page = pod.wl();
        let old_len = page.record_len_at(position);
        if value.len() > old_len {
            return Err(DomError::invalid_argument("value too long"));
        }
        if value.len() < old_len {
            return Err(DomError::invalid_argument(
                "shrinking a record is not supported",
            ));
        }
        page.overwrite_at(position, value);
        Ok(())
    }

    /// Remove a record; a page drained to zero records is unlinked from its
    /// chain and recycled in the same operation.
    pub(crate) fn remove_record(&self, pointer: u64) -> DomResult<RemovedRecord> {
        let (pod, position) = self.find_record(pointer)?.ok_or_else(|| {
            DomError::invalid_argument(&format!("no record at address {:#x}", pointer))
        })?;

        let (page_no, len, drained, prev, next) = {
            let mut page = pod.wl();
            let len = page.remove_at(position);
            (
                page.page_no(),
                len,
                page.record_count() == 0,
                page.prev_page(),
                page.next_page(),
            )
        };
        self.file.decrement_total();

        if !drained {
            return Ok(RemovedRecord {
                len,
                page_drained: false,
                next_page: next,
            });
        }

        // unlink from the chain, recycle the page, drop the buffer
        if prev >= 0 {
            self.data_page(prev as u32)?.wl().set_next_page(next);
        }
        if next >= 0 {
            self.data_page(next as u32)?.wl().set_prev_page(prev);
        }
        self.pages.wl().remove(page_no);
        self.file.unlink_page(page_no)?;
        debug!("data page {} drained and freed", page_no);

        // a tail pointing at the dead page retreats to its predecessor
        let mut tails = self.tails.wl();
        let stale: Vec<u64> = tails
            .iter()
            .filter(|(_, p)| **p == page_no)
            .map(|(owner, _)| *owner)
            .collect();
        for owner in stale {
            if prev >= 0 {
                tails.insert(owner, prev as u32);
            } else {
                tails.remove(&owner);
            }
        }

        Ok(RemovedRecord {
            len,
            page_drained: true,
            next_page: next,
        })
    }

    // ------------------------------------------------------------------
    // public facade
    // ------------------------------------------------------------------

    /// Append a record without indexing it; such records are reachable
    /// through iterators and the fallback traversal only. Returns the
    /// record's virtual address.
    pub fn add(&self, session: &Session, value: &[u8]) -> DomResult<u64> {
        self.check_writable()?;
        let _guard = self.lock.acquire(session.id(), LockMode::Exclusive)?;
        self.add_record(session.id(), value)
    }

    /// Store `value` under `key`, returning its virtual address. A key that
    /// was already bound keeps the binding but the old record is released.
    pub fn put(&self, session: &Session, key: &[u8], value: &[u8]) -> DomResult<u64> {
        self.check_writable()?;
        let _guard = self.lock.acquire(session.id(), LockMode::Exclusive)?;

        let pointer = self.add_record(session.id(), value)?;
        if let Some(old) = self.btree.add_value(&self.file, key, pointer)? {
            self.remove_record(old)?;
        }
        Ok(pointer)
    }

    /// Look up by key. Read-path failures degrade to `None` with a log
    /// entry.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let session = Session::new();
        let _guard = match self.lock.acquire(session.id(), LockMode::Shared) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("get({}): {}", hex::encode(key), e);
                return None;
            }
        };

        match self
            .btree
            .find_value(&self.file, key)
            .and_then(|found| match found {
                Some(pointer) => self.read_record(pointer),
                None => Ok(None),
            }) {
            Ok(value) => value,
            Err(e) => {
                error!("get({}): {}", hex::encode(key), e);
                None
            }
        }
    }

    /// Read the record at a virtual address.
    pub fn get_at(&self, pointer: u64) -> Option<Vec<u8>> {
        let session = Session::new();
        let _guard = match self.lock.acquire(session.id(), LockMode::Shared) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("get_at({:#x}): {}", pointer, e);
                return None;
            }
        };

        match self.read_record(pointer) {
            Ok(value) => value,
            Err(e) => {
                error!("get_at({:#x}): {}", pointer, e);
                None
            }
        }
    }

    /// Address currently bound to `key`, if any.
    pub fn address_of(&self, key: &[u8]) -> DomResult<Option<u64>> {
        let session = Session::new();
        let _guard = self.lock.acquire(session.id(), LockMode::Shared)?;
        self.btree.find_value(&self.file, key)
    }

    /// In-place update of the record bound to `key`; the value must keep
    /// its length.
    pub fn update(&self, session: &Session, key: &[u8], value: &[u8]) -> DomResult<()> {
        self.check_writable()?;
        let _guard = self.lock.acquire(session.id(), LockMode::Exclusive)?;

        let pointer = self
            .btree
            .find_value(&self.file, key)?
            .ok_or_else(|| DomError::btree(&format!("key {} not found", hex::encode(key))))?;
        self.update_record(pointer, value)
    }

    /// In-place update at a known address.
    pub fn update_at(&self, session: &Session, pointer: u64, value: &[u8]) -> DomResult<()> {
        self.check_writable()?;
        let _guard = self.lock.acquire(session.id(), LockMode::Exclusive)?;
        self.update_record(pointer, value)
    }

    /// Drop the key and its record. Removing an unbound key is a no-op.
    pub fn remove(&self, session: &Session, key: &[u8]) -> DomResult<()> {
        self.check_writable()?;
        let _guard = self.lock.acquire(session.id(), LockMode::Exclusive)?;

        match self.btree.remove_value(&self.file, key)? {
            Some(pointer) => {
                self.remove_record(pointer)?;
                Ok(())
            }
            None => {
                debug!("remove of unbound key {}", hex::encode(key));
                Ok(())
            }
        }
    }

    /// Remove the record at an address, leaving the index alone. For
    /// records never indexed, or already unbound.
    pub fn remove_at(&self, session: &Session, pointer: u64) -> DomResult<()> {
        self.check_writable()?;
        let _guard = self.lock.acquire(session.id(), LockMode::Exclusive)?;
        self.remove_record(pointer)?;
        Ok(())
    }

    /// Insert a record in document order behind the record at `pointer`;
    /// returns the new record's address.
    pub fn insert_after(&self, session: &Session, pointer: u64, value: &[u8]) -> DomResult<u64> {
        self.check_writable()?;
        let _guard = self.lock.acquire(session.id(), LockMode::Exclusive)?;
        self.insert_after_record(pointer, value)
    }

    /// `insert_after` addressed by key instead of address.
    pub fn insert_after_key(
        &self,
        session: &Session,
        key: &[u8],
        value: &[u8],
    ) -> DomResult<u64> {
        self.check_writable()?;
        let _guard = self.lock.acquire(session.id(), LockMode::Exclusive)?;

        let pointer = self
            .btree
            .find_value(&self.file, key)?
            .ok_or_else(|| DomError::btree(&format!("key {} not found", hex::encode(key))))?;
        self.insert_after_record(pointer, value)
    }

    /// Keys matching the query, in order.
    pub fn find_keys(&self, query: &IndexQuery) -> DomResult<Vec<Vec<u8>>> {
        let session = Session::new();
        let _guard = self.lock.acquire(session.id(), LockMode::Shared)?;

        let mut keys = Vec::new();
        self.btree.query(&self.file, query, &mut |key, _| {
            keys.push(key.to_vec());
            true
        })?;
        Ok(keys)
    }

    /// Record values for every key matching the query, in key order. A
    /// dangling address is logged and skipped, per the read-path policy.
    pub fn find_values(&self, query: &IndexQuery) -> DomResult<Vec<Vec<u8>>> {
        let session = Session::new();
        let _guard = self.lock.acquire(session.id(), LockMode::Shared)?;

        let mut pointers = Vec::new();
        self.btree.query(&self.file, query, &mut |_, pointer| {
            pointers.push(pointer);
            true
        })?;

        let mut values = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            match self.read_record(pointer)? {
                Some(value) => values.push(value),
                None => warn!("index points at vanished record {:#x}", pointer),
            }
        }
        Ok(values)
    }

    /// Values for every key in `[low, high]`, bounds inclusive.
    pub fn find_range(&self, low: &[u8], high: &[u8]) -> DomResult<Vec<Vec<u8>>> {
        self.find_values(&IndexQuery::Bw(low.to_vec(), high.to_vec()))
    }

    /// Resolve a node to its address, falling back to traversal when the
    /// index misses: walk ancestors upward until one is indexed, then scan
    /// its subtree in document order matching gids.
    pub fn find_value(
        &self,
        session: &Session,
        proxy: &NodeProxy,
        shape: &dyn DocumentShape,
    ) -> DomResult<u64> {
        let _guard = self.lock.acquire(session.id(), LockMode::Shared)?;

        if let Some(pointer) = self.btree.find_value(&self.file, &proxy.key().encode())? {
            return Ok(pointer);
        }

        let mut gid = proxy.gid;
        let (ancestor_gid, ancestor) = loop {
            gid = shape.parent_gid(gid);
            if gid < 1 {
                return Err(DomError::btree(&format!(
                    "node {}:{} not found",
                    proxy.doc_id, proxy.gid
                )));
            }
            let key = NodeKey::new(proxy.doc_id, gid).encode();
            if let Some(pointer) = self.btree.find_value(&self.file, &key)? {
                break (gid, pointer);
            }
        };
        debug!(
            "fallback for {}:{} starts at ancestor gid {}",
            proxy.doc_id, proxy.gid, ancestor_gid
        );

        let mut iter = self.iterator_at(session, ancestor)?;
        Self::scan_for_gid(&mut iter, shape, ancestor_gid, proxy.gid).ok_or_else(|| {
            DomError::btree(&format!(
                "node {}:{} not reachable from ancestor {}",
                proxy.doc_id, proxy.gid, ancestor_gid
            ))
        })
    }

    // preorder walk: the iterator yields records in document order while
    // the shape arithmetic names the gid each record belongs to
    fn scan_for_gid(
        iter: &mut RecordIterator<'_>,
        shape: &dyn DocumentShape,
        gid: i64,
        target: i64,
    ) -> Option<u64> {
        let value = iter.next()?;
        if gid == target {
            return Some(value.address);
        }
        let first = shape.first_child_gid(gid);
        for i in 0..shape.child_count(gid) {
            if let Some(found) = Self::scan_for_gid(iter, shape, first + i, target) {
                return Some(found);
            }
        }
        None
    }

    /// Forward iterator starting at the record `pointer` names.
    pub fn iterator(&self, session: &Session, pointer: u64) -> DomResult<RecordIterator<'_>> {
        let _guard = self.lock.acquire(session.id(), LockMode::Shared)?;
        self.iterator_at(session, pointer)
    }

    /// Forward iterator starting at a node, resolving through the fallback
    /// when the index misses it.
    pub fn iterator_from(
        &self,
        session: &Session,
        proxy: &NodeProxy,
        shape: &dyn DocumentShape,
    ) -> DomResult<RecordIterator<'_>> {
        let pointer = self.find_value(session, proxy, shape)?;
        let _guard = self.lock.acquire(session.id(), LockMode::Shared)?;
        self.iterator_at(session, pointer)
    }

    // resolve the starting position once; the caller holds the lock
    fn iterator_at(&self, session: &Session, pointer: u64) -> DomResult<RecordIterator<'_>> {
        let (pod, position) = self.find_record(pointer)?.ok_or_else(|| {
            DomError::invalid_argument(&format!("no record at address {:#x}", pointer))
        })?;
        let page_no = pod.rl().page_no();
        Ok(RecordIterator::new(
            self,
            session.id(),
            page_no as i64,
            position - 2,
        ))
    }

    /// Write back every dirty page and the header. Nothing is evicted.
    pub fn flush(&self) -> DomResult<()> {
        let session = Session::new();
        let _guard = self.lock.acquire(session.id(), LockMode::Exclusive)?;

        self.pages.rl().flush(&self.file)?;
        self.btree.flush(&self.file)?;
        self.file.write_header()
    }

    /// `flush` plus an fsync of the underlying file.
    pub fn sync(&self) -> DomResult<()> {
        self.flush()?;
        self.file.sync_all()
    }

    pub fn total_records(&self) -> i64 {
        self.file.total_count()
    }

    pub fn statistics(&self) -> EngineStats {
        let pages = self.pages.rl();
        EngineStats {
            data_hits: pages.hits(),
            data_misses: pages.misses(),
            node_hits: self.btree.cache_hits(),
            node_misses: self.btree.cache_misses(),
            total_records: self.file.total_count(),
        }
    }

    /// Debug dump of the index tree.
    pub fn draw_index(&self) -> DomResult<String> {
        self.btree.draw(&self.file)
    }
}
