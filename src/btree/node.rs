use crate::{
    cache::Cacheable,
    error::DomError,
    io::{SmallReader, SmallWriter},
    storage::{
        page::{PageStatus, COMMON_HEADER_SIZE},
        paged_file::PagedFile,
    },
    types::DomResult,
};

// klen (u16) + value/child (8 bytes) around every key
const ENTRY_OVERHEAD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Inner,
    Leaf,
}

/// One B+-tree page. Inner nodes route by separator keys and hold
/// `keys.len() + 1` children; leaves pair each key with a record address.
///
/// The vectors mirror the on-disk entries; a node is "overflowed" when its
/// serialized form no longer fits the page and must be split.
pub struct BTreeNode {
    page_no: u32,
    kind: NodeKind,

    keys: Vec<Vec<u8>>,

    // leaf payload, one per key
    values: Vec<u64>,

    // inner fan-out, keys.len() + 1 entries
    children: Vec<u32>,

    capacity: usize,
    dirty: bool,
    ref_count: u32,
}

impl BTreeNode {
    pub fn new_leaf(page_no: u32, capacity: usize) -> Self {
        Self {
            page_no,
            kind: NodeKind::Leaf,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            capacity,
            dirty: true,
            ref_count: 0,
        }
    }

    /// Fresh root above a split: one separator, two children.
    pub fn new_root(page_no: u32, capacity: usize, separator: Vec<u8>, left: u32, right: u32) -> Self {
        Self {
            page_no,
            kind: NodeKind::Inner,
            keys: vec![separator],
            values: Vec::new(),
            children: vec![left, right],
            capacity,
            dirty: true,
            ref_count: 0,
        }
    }

    pub fn parse(page_no: u32, bytes: &[u8], capacity: usize) -> DomResult<Self> {
        let mut reader = SmallReader::new(bytes);

        let status = PageStatus::from_u8(reader.read::<u8>()?)?;
        let kind = match status {
            PageStatus::BTreeInner => NodeKind::Inner,
            PageStatus::BTreeLeaf => NodeKind::Leaf,
            other => {
                return Err(DomError::corruption(&format!(
                    "page {} is not a btree page, status: {:?}",
                    page_no, other
                )))
            }
        };
        let _dirty = reader.read::<u8>()?;
        let _record_len = reader.read::<i32>()?;
        let key_count = reader.read::<u16>()? as usize;

        let mut keys = Vec::with_capacity(key_count);
        let mut values = Vec::new();
        let mut children = Vec::new();

        match kind {
            NodeKind::Leaf => {
                for _ in 0..key_count {
                    let klen = reader.read::<u16>()? as usize;
                    keys.push(reader.read_bytes(klen)?.to_vec());
                    values.push(reader.read::<u64>()?);
                }
            }
            NodeKind::Inner => {
                children.push(reader.read::<i64>()? as u32);
                for _ in 0..key_count {
                    let klen = reader.read::<u16>()? as usize;
                    keys.push(reader.read_bytes(klen)?.to_vec());
                    children.push(reader.read::<i64>()? as u32);
                }
            }
        }

        Ok(Self {
            page_no,
            kind,
            keys,
            values,
            children,
            capacity,
            dirty: false,
            ref_count: 0,
        })
    }

    pub fn serialize(&self) -> DomResult<Vec<u8>> {
        let page_size = self.capacity + COMMON_HEADER_SIZE + 2;
        let mut writer = SmallWriter::with_capacity(page_size);

        let status = match self.kind {
            NodeKind::Inner => PageStatus::BTreeInner,
            NodeKind::Leaf => PageStatus::BTreeLeaf,
        };
        writer.write(&status.to_u8());
        writer.write(&0u8);
        writer.write(&(self.byte_size() as i32));
        writer.write(&(self.keys.len() as u16));

        match self.kind {
            NodeKind::Leaf => {
                for (key, value) in self.keys.iter().zip(self.values.iter()) {
                    writer.write(&(key.len() as u16));
                    writer.write_bytes(key);
                    writer.write(value);
                }
            }
            NodeKind::Inner => {
                writer.write(&(self.children[0] as i64));
                for (key, child) in self.keys.iter().zip(self.children.iter().skip(1)) {
                    writer.write(&(key.len() as u16));
                    writer.write_bytes(key);
                    writer.write(&(*child as i64));
                }
            }
        }

        writer.into_padded_bytes(page_size)
    }

    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        &self.keys[index]
    }

    pub fn keys(&self) -> &[Vec<u8>] {
        &self.keys
    }

    pub fn value_at(&self, index: usize) -> u64 {
        self.values[index]
    }

    pub fn child_at(&self, index: usize) -> u32 {
        self.children[index]
    }

    /// Serialized payload size, used for the overflow check.
    pub fn byte_size(&self) -> usize {
        let entries: usize = self.keys.iter().map(|k| ENTRY_OVERHEAD + k.len()).sum();
        match self.kind {
            NodeKind::Leaf => entries,
            NodeKind::Inner => 8 + entries,
        }
    }

    pub fn is_overflowed(&self) -> bool {
        self.byte_size() > self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index of the child that covers `key`: the routing convention is that
    /// a key equal to a separator belongs to the right-hand subtree.
    pub fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|k| k.as_slice() <= key)
    }

    pub fn find_key(&self, key: &[u8]) -> Option<usize> {
        self.keys.binary_search_by(|k| k.as_slice().cmp(key)).ok()
    }

    /// Insert or replace in a leaf; returns the previous address on
    /// replacement.
    pub fn leaf_insert(&mut self, key: &[u8], addr: u64) -> Option<u64> {
        debug_assert_eq!(self.kind, NodeKind::Leaf);
        self.dirty = true;
        match self.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(index) => {
                let old = self.values[index];
                self.values[index] = addr;
                Some(old)
            }
            Err(index) => {
                self.keys.insert(index, key.to_vec());
                self.values.insert(index, addr);
                None
            }
        }
    }

    pub fn leaf_remove(&mut self, key: &[u8]) -> Option<u64> {
        debug_assert_eq!(self.kind, NodeKind::Leaf);
        match self.keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(index) => {
                self.keys.remove(index);
                self.dirty = true;
                Some(self.values.remove(index))
            }
            Err(_) => None,
        }
    }

    /// Splice a freshly split-off sibling into an inner node: the separator
    /// lands at `index`, the sibling to its right.
    pub fn insert_child(&mut self, index: usize, separator: Vec<u8>, child: u32) {
        debug_assert_eq!(self.kind, NodeKind::Inner);
        self.keys.insert(index, separator);
        self.children.insert(index + 1, child);
        self.dirty = true;
    }

    /// Move the upper half into a fresh sibling. Returns the separator to
    /// push into the parent and the sibling node.
    ///
    /// For a leaf the separator is a copy of the sibling's first key; for an
    /// inner node the median key moves up and out.
    pub fn split(&mut self, new_page_no: u32) -> (Vec<u8>, BTreeNode) {
        let mid = self.keys.len() / 2;
        self.dirty = true;

        match self.kind {
            NodeKind::Leaf => {
                let upper_keys = self.keys.split_off(mid);
                let upper_values = self.values.split_off(mid);
                let separator = upper_keys[0].clone();
                let sibling = BTreeNode {
                    page_no: new_page_no,
                    kind: NodeKind::Leaf,
                    keys: upper_keys,
                    values: upper_values,
                    children: Vec::new(),
                    capacity: self.capacity,
                    dirty: true,
                    ref_count: 0,
                };
                (separator, sibling)
            }
            NodeKind::Inner => {
                let mut upper_keys = self.keys.split_off(mid);
                let separator = upper_keys.remove(0);
                let upper_children = self.children.split_off(mid + 1);
                let sibling = BTreeNode {
                    page_no: new_page_no,
                    kind: NodeKind::Inner,
                    keys: upper_keys,
                    values: Vec::new(),
                    children: upper_children,
                    capacity: self.capacity,
                    dirty: true,
                    ref_count: 0,
                };
                (separator, sibling)
            }
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Cacheable for BTreeNode {
    fn cache_key(&self) -> u32 {
        self.page_no
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn allow_unload(&self) -> bool {
        self.ref_count < 1
    }

    fn sync(&mut self, file: &PagedFile) -> DomResult<()> {
        let bytes = self.serialize()?;
        file.write_page(self.page_no, &bytes)?;
        self.dirty = false;
        Ok(())
    }

    fn ref_count(&self) -> u32 {
        self.ref_count
    }

    fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    fn decrement_ref(&mut self) {
        if self.ref_count > 0 {
            self.ref_count -= 1;
        }
    }

    fn set_ref_count(&mut self, count: u32) {
        self.ref_count = count;
    }
}
