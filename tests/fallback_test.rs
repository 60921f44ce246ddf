use std::collections::HashMap;

use dom_db::{DomConfig, DomFile, ErrorKind, KAryShape, NodeKey, NodeProxy, Session};

mod test_utils;
use test_utils::{db_path, payload, setup};

// document order (preorder) over the complete binary tree with gids 1..=15
const PREORDER: [i64; 15] = [1, 2, 4, 8, 9, 5, 10, 11, 3, 6, 12, 13, 7, 14, 15];

/// Store the document with only gids 1, 2 and 3 indexed; everything else is
/// reachable through traversal alone. Large payloads push the chain across
/// several pages.
fn build_document(dom: &DomFile, session: &Session, value_len: usize) -> HashMap<i64, u64> {
    let mut addresses = HashMap::new();
    for gid in PREORDER.iter() {
        let value = payload(*gid, value_len);
        let addr = if *gid <= 3 {
            dom.put(session, &NodeKey::new(1, *gid).encode(), &value)
                .unwrap()
        } else {
            dom.add(session, &value).unwrap()
        };
        addresses.insert(*gid, addr);
    }
    addresses
}

#[test]
fn test_fallback_resolves_deep_descendant() {
    setup();
    let path = db_path("fallback_deep");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    // 400-byte values: the fifteen records span multiple pages
    let addresses = build_document(&dom, &session, 400);
    let shape = KAryShape::new(2, 15);

    // gid 13 is unindexed; its nearest indexed ancestor is gid 3, whose
    // subtree crosses the page boundary
    let found = dom
        .find_value(&session, &NodeProxy::new(1, 13), &shape)
        .unwrap();
    assert_eq!(found, addresses[&13]);
    assert_eq!(dom.get_at(found).unwrap(), payload(13, 400));

    // the deepest, last node in document order
    let found = dom
        .find_value(&session, &NodeProxy::new(1, 15), &shape)
        .unwrap();
    assert_eq!(found, addresses[&15]);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_indexed_node_short_circuits() {
    setup();
    let path = db_path("fallback_hit");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    let addresses = build_document(&dom, &session, 64);
    let shape = KAryShape::new(2, 15);

    // an indexed gid resolves straight from the tree, no traversal
    let found = dom
        .find_value(&session, &NodeProxy::new(1, 2), &shape)
        .unwrap();
    assert_eq!(found, addresses[&2]);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_fallback_miss_is_btree_error() {
    setup();
    let path = db_path("fallback_miss");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    build_document(&dom, &session, 64);
    let shape = KAryShape::new(2, 15);

    // a document that was never stored: the ancestor walk runs off the root
    let err = dom
        .find_value(&session, &NodeProxy::new(5, 9), &shape)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BTree);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_iterator_from_unindexed_node() {
    setup();
    let path = db_path("fallback_iter");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    build_document(&dom, &session, 64);
    let shape = KAryShape::new(2, 15);

    // start at unindexed gid 6 and read to the end of the document
    let values: Vec<Vec<u8>> = dom
        .iterator_from(&session, &NodeProxy::new(1, 6), &shape)
        .unwrap()
        .map(|value| value.data)
        .collect();
    let expected: Vec<Vec<u8>> = [6i64, 12, 13, 7, 14, 15]
        .iter()
        .map(|gid| payload(*gid, 64))
        .collect();
    assert_eq!(values, expected);

    std::fs::remove_file(&path).unwrap();
}
