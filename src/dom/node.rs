use crate::io::{SmallReader, SmallWriter};
use crate::types::DomResult;

/// Logical node identifier: a document id paired with the node's gid, the
/// position assigned by the XML layer. Encoded big-endian so the byte form
/// sorts by `(doc_id, gid)` lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeKey {
    pub doc_id: u32,
    pub gid: i64,
}

impl NodeKey {
    pub fn new(doc_id: u32, gid: i64) -> Self {
        Self { doc_id, gid }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = SmallWriter::with_capacity(12);
        writer.write(&self.doc_id);
        writer.write(&self.gid);
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> DomResult<Self> {
        let mut reader = SmallReader::new(bytes);
        let doc_id = reader.read::<u32>()?;
        let gid = reader.read::<i64>()?;
        Ok(Self { doc_id, gid })
    }
}

/// A node reference presented by a caller: possibly not in the index, in
/// which case the engine falls back to traversal from the nearest indexed
/// ancestor.
#[derive(Debug, Clone, Copy)]
pub struct NodeProxy {
    pub doc_id: u32,
    pub gid: i64,
}

impl NodeProxy {
    pub fn new(doc_id: u32, gid: i64) -> Self {
        Self { doc_id, gid }
    }

    pub fn key(&self) -> NodeKey {
        NodeKey::new(self.doc_id, self.gid)
    }
}

/// Structural arithmetic over a document's gid space, supplied by the XML
/// layer. The engine only ever walks upward (`parent_gid`) and downward in
/// document order (`first_child_gid` + `child_count`); it never interprets
/// gids itself.
pub trait DocumentShape {
    /// Gid of the parent; anything below 1 means "above the root".
    fn parent_gid(&self, gid: i64) -> i64;

    fn first_child_gid(&self, gid: i64) -> i64;

    fn child_count(&self, gid: i64) -> i64;
}

/// Complete k-ary numbering: node `g` has children
/// `(g-1)*k + 2 ..= (g-1)*k + k + 1`. The classic fixed-arity gid scheme,
/// also convenient for tests.
#[derive(Debug, Clone, Copy)]
pub struct KAryShape {
    order: i64,
    max_gid: i64,
}

impl KAryShape {
    pub fn new(order: i64, max_gid: i64) -> Self {
        Self { order, max_gid }
    }
}

impl DocumentShape for KAryShape {
    fn parent_gid(&self, gid: i64) -> i64 {
        if gid <= 1 {
            return 0;
        }
        (gid - 2) / self.order + 1
    }

    fn first_child_gid(&self, gid: i64) -> i64 {
        (gid - 1) * self.order + 2
    }

    fn child_count(&self, gid: i64) -> i64 {
        let first = self.first_child_gid(gid);
        if first > self.max_gid {
            return 0;
        }
        self.order.min(self.max_gid - first + 1)
    }
}
