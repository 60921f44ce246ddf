use std::sync::{Arc, RwLock};

use itertools::Itertools;
use log::debug;

use crate::{
    btree::{
        node::{BTreeNode, NodeKind},
        query::IndexQuery,
    },
    cache::{ref_cache::RefCountCache, Cacheable},
    error::DomError,
    storage::{page::COMMON_HEADER_SIZE, paged_file::PagedFile},
    types::{DomResult, Pod},
    utils::HandyRwLock,
};

/// Ordered map from opaque keys to 64-bit record addresses. Node pages live
/// behind the reference-counted cache; the root page number is persisted in
/// the file header. A missing key is a normal `None`, never an error.
pub struct BTree {
    cache: Pod<RefCountCache<BTreeNode>>,
}

/// A node held by an operation. Dropping the pin releases the reference
/// count taken at fetch time, so error paths cannot leak pins.
struct PinnedNode {
    pod: Pod<BTreeNode>,
}

impl PinnedNode {
    fn pod(&self) -> &Pod<BTreeNode> {
        &self.pod
    }
}

impl Drop for PinnedNode {
    fn drop(&mut self) {
        self.pod.wl().decrement_ref();
    }
}

impl BTree {
    pub fn new(buffers: usize) -> Self {
        Self {
            cache: Arc::new(RwLock::new(RefCountCache::new(buffers))),
        }
    }

    fn node_capacity(file: &PagedFile) -> usize {
        file.page_size() as usize - COMMON_HEADER_SIZE - 2
    }

    fn root(&self, file: &PagedFile) -> Option<u32> {
        let root = file.btree_root();
        if root < 0 {
            None
        } else {
            Some(root as u32)
        }
    }

    fn ensure_root(&self, file: &PagedFile) -> DomResult<u32> {
        if let Some(root) = self.root(file) {
            return Ok(root);
        }
        let page_no = file.get_free_page()?;
        let node = BTreeNode::new_leaf(page_no, Self::node_capacity(file));
        let _pin = self.install(file, node)?;
        file.set_btree_root(page_no as i64);
        debug!("btree root created at page {}", page_no);
        Ok(page_no)
    }

    fn fetch(&self, file: &PagedFile, page_no: u32) -> DomResult<PinnedNode> {
        let mut cache = self.cache.wl();
        if let Some(pod) = cache.get(page_no) {
            pod.wl().increment_ref();
            return Ok(PinnedNode { pod });
        }

        let bytes = file.read_page(page_no)?;
        let node = BTreeNode::parse(page_no, &bytes, Self::node_capacity(file))?;
        let pod = Arc::new(RwLock::new(node));
        cache.add(file, Arc::clone(&pod), 1)?;
        Ok(PinnedNode { pod })
    }

    fn install(&self, file: &PagedFile, node: BTreeNode) -> DomResult<PinnedNode> {
        let pod = Arc::new(RwLock::new(node));
        self.cache.wl().add(file, Arc::clone(&pod), 1)?;
        Ok(PinnedNode { pod })
    }

    pub fn find_value(&self, file: &PagedFile, key: &[u8]) -> DomResult<Option<u64>> {
        let mut page_no = match self.root(file) {
            Some(root) => root,
            None => return Ok(None),
        };

        loop {
            let pin = self.fetch(file, page_no)?;
            let node = pin.pod().rl();
            match node.kind() {
                NodeKind::Inner => {
                    let next = node.child_at(node.child_index(key));
                    drop(node);
                    page_no = next;
                }
                NodeKind::Leaf => {
                    return Ok(node.find_key(key).map(|i| node.value_at(i)));
                }
            }
        }
    }

    /// Insert `key -> addr`, replacing an existing mapping. Returns the
    /// previous address when there was one.
    pub fn add_value(&self, file: &PagedFile, key: &[u8], addr: u64) -> DomResult<Option<u64>> {
        let capacity = Self::node_capacity(file);
        if key.len() + 10 > capacity / 3 {
            return Err(DomError::invalid_argument(&format!(
                "key of {} bytes is too long for {}-byte pages",
                key.len(),
                file.page_size()
            )));
        }

        let root_no = self.ensure_root(file)?;

        // descend, remembering which child we took at every inner node
        let mut path: Vec<(PinnedNode, usize)> = Vec::new();
        let mut current = self.fetch(file, root_no)?;
        loop {
            let step = {
                let node = current.pod().rl();
                match node.kind() {
                    NodeKind::Leaf => None,
                    NodeKind::Inner => {
                        let index = node.child_index(key);
                        Some((index, node.child_at(index)))
                    }
                }
            };
            match step {
                None => break,
                Some((index, child)) => {
                    let next = self.fetch(file, child)?;
                    path.push((current, index));
                    current = next;
                }
            }
        }

        let old = current.pod().wl().leaf_insert(key, addr);

        // split upward while nodes overflow
        loop {
            let overflowed = current.pod().rl().is_overflowed();
            if !overflowed {
                break;
            }

            let new_page_no = file.get_free_page()?;
            let (separator, sibling) = current.pod().wl().split(new_page_no);
            let current_no = current.pod().rl().page_no();
            debug!(
                "btree split: page {} spawns sibling {}",
                current_no, new_page_no
            );
            let _sibling_pin = self.install(file, sibling)?;

            match path.pop() {
                Some((parent, index)) => {
                    parent.pod().wl().insert_child(index, separator, new_page_no);
                    current = parent;
                }
                None => {
                    // the root split: grow the tree by one level
                    let root_page = file.get_free_page()?;
                    let root =
                        BTreeNode::new_root(root_page, capacity, separator, current_no, new_page_no);
                    let _root_pin = self.install(file, root)?;
                    file.set_btree_root(root_page as i64);
                    debug!("btree root grew to page {}", root_page);
                    break;
                }
            }
        }

        Ok(old)
    }

    /// Remove the mapping. Underfull leaves are left alone; reclamation is a
    /// compaction concern, not a delete-path one.
    pub fn remove_value(&self, file: &PagedFile, key: &[u8]) -> DomResult<Option<u64>> {
        let mut page_no = match self.root(file) {
            Some(root) => root,
            None => return Ok(None),
        };

        loop {
            let pin = self.fetch(file, page_no)?;
            let kind = pin.pod().rl().kind();
            match kind {
                NodeKind::Inner => {
                    let node = pin.pod().rl();
                    let next = node.child_at(node.child_index(key));
                    drop(node);
                    page_no = next;
                }
                NodeKind::Leaf => {
                    return Ok(pin.pod().wl().leaf_remove(key));
                }
            }
        }
    }

    /// Walk the matching keys in order, feeding `(key, addr)` to the
    /// callback until it returns `false` or the keys run out.
    pub fn query(
        &self,
        file: &PagedFile,
        query: &IndexQuery,
        callback: &mut dyn FnMut(&[u8], u64) -> bool,
    ) -> DomResult<()> {
        let root = match self.root(file) {
            Some(root) => root,
            None => return Ok(()),
        };
        let low = query.low_bound();
        let high = query.high_bound();
        self.scan(file, root, query, low.as_deref(), high.as_deref(), callback)?;
        Ok(())
    }

    // in-order traversal with subtree pruning; returns false once the scan
    // should stop
    fn scan(
        &self,
        file: &PagedFile,
        page_no: u32,
        query: &IndexQuery,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        callback: &mut dyn FnMut(&[u8], u64) -> bool,
    ) -> DomResult<bool> {
        let pin = self.fetch(file, page_no)?;
        let node = pin.pod().rl();

        match node.kind() {
            NodeKind::Leaf => {
                for i in 0..node.key_count() {
                    let key = node.key_at(i);
                    if let Some(low) = low {
                        if key < low {
                            continue;
                        }
                    }
                    if let Some(high) = high {
                        if key > high {
                            return Ok(false);
                        }
                    }
                    if query.matches(key) && !callback(key, node.value_at(i)) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            NodeKind::Inner => {
                for i in 0..=node.key_count() {
                    // child i covers [keys[i-1], keys[i])
                    if let (Some(high), true) = (high, i > 0) {
                        if node.key_at(i - 1) > high {
                            return Ok(true);
                        }
                    }
                    if let (Some(low), true) = (low, i < node.key_count()) {
                        if node.key_at(i) <= low {
                            continue;
                        }
                    }
                    if !self.scan(file, node.child_at(i), query, low, high, callback)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    pub fn flush(&self, file: &PagedFile) -> DomResult<()> {
        self.cache.rl().flush(file)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache.rl().hits()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache.rl().misses()
    }

    /// Render the tree for debugging, one node per line.
    pub fn draw(&self, file: &PagedFile) -> DomResult<String> {
        let mut out = String::new();
        if let Some(root) = self.root(file) {
            self.draw_node(file, root, 0, &mut out)?;
        } else {
            out.push_str("(empty)\n");
        }
        Ok(out)
    }

    fn draw_node(
        &self,
        file: &PagedFile,
        page_no: u32,
        depth: usize,
        out: &mut String,
    ) -> DomResult<()> {
        let pin = self.fetch(file, page_no)?;
        let node = pin.pod().rl();
        let keys = node.keys().iter().map(|k| hex::encode(k)).join(", ");
        out.push_str(&format!(
            "{}{:?} page {}: [{}]\n",
            "  ".repeat(depth),
            node.kind(),
            page_no,
            keys
        ));
        if node.kind() == NodeKind::Inner {
            for i in 0..=node.key_count() {
                self.draw_node(file, node.child_at(i), depth + 1, out)?;
            }
        }
        Ok(())
    }
}
