use dom_db::{
    page_from_pointer, tid_from_pointer, storage::page::DataPage,
    storage::paged_file::PagedFile, DomConfig, DomFile, ErrorKind, NodeKey, Session,
};

mod test_utils;
use test_utils::{db_path, payload, random_bytes, setup};

fn key(gid: i64) -> Vec<u8> {
    NodeKey::new(1, gid).encode()
}

#[test]
fn test_three_appends_land_on_one_page() {
    setup();
    let path = db_path("three_appends");
    let config = DomConfig::default();
    let dom = DomFile::create(&path, &config).unwrap();
    let session = Session::new();

    let v1 = random_bytes(100);
    let v2 = random_bytes(200);
    let v3 = random_bytes(300);
    let a1 = dom.put(&session, &key(1), &v1).unwrap();
    let a2 = dom.put(&session, &key(2), &v2).unwrap();
    let a3 = dom.put(&session, &key(3), &v3).unwrap();

    // all three on the first allocated data page, tids counting from 1
    let data_page = page_from_pointer(a1);
    assert_eq!(page_from_pointer(a2), data_page);
    assert_eq!(page_from_pointer(a3), data_page);
    assert_eq!(tid_from_pointer(a1), 1);
    assert_eq!(tid_from_pointer(a2), 2);
    assert_eq!(tid_from_pointer(a3), 3);

    assert_eq!(dom.get(&key(1)).unwrap(), v1);
    assert_eq!(dom.get_at(a2).unwrap(), v2);
    assert_eq!(dom.get(&key(3)).unwrap(), v3);
    assert_eq!(dom.total_records(), 3);

    dom.close().unwrap();

    // the on-disk page agrees byte for byte
    let file = PagedFile::open(&path, &config).unwrap();
    let bytes = file.read_page(data_page).unwrap();
    let page = DataPage::parse(data_page, &bytes, file.work_size()).unwrap();
    assert_eq!(page.record_count(), 3);
    assert_eq!(page.data_length(), 100 + 200 + 300 + 12);
    assert_eq!(page.next_page(), -1);
    assert_eq!(page.prev_page(), -1);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_full_page_grows_the_chain() {
    setup();
    let path = db_path("chain_growth");
    let config = DomConfig::default();
    let dom = DomFile::create(&path, &config).unwrap();
    let session = Session::new();

    // 500-byte records: eight fit into a 4096-byte page's work area, the
    // ninth must open a new page
    let mut addresses = Vec::new();
    for i in 0..9i64 {
        addresses.push(dom.put(&session, &key(i), &payload(i, 500)).unwrap());
    }

    let first_page = page_from_pointer(addresses[0]);
    for a in &addresses[..8] {
        assert_eq!(page_from_pointer(*a), first_page);
    }
    let second_page = page_from_pointer(addresses[8]);
    assert_ne!(second_page, first_page);
    assert_eq!(tid_from_pointer(addresses[8]), 1);

    dom.close().unwrap();

    let file = PagedFile::open(&path, &config).unwrap();
    let old = DataPage::parse(
        first_page,
        &file.read_page(first_page).unwrap(),
        file.work_size(),
    )
    .unwrap();
    let new = DataPage::parse(
        second_page,
        &file.read_page(second_page).unwrap(),
        file.work_size(),
    )
    .unwrap();
    assert_eq!(old.next_page(), second_page as i64);
    assert_eq!(new.prev_page(), first_page as i64);
    assert_eq!(old.record_count(), 8);
    assert_eq!(new.record_count(), 1);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_insert_after_in_page() {
    setup();
    let path = db_path("insert_in_page");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    let r1 = payload(1, 40);
    let r2 = payload(2, 40);
    let r3 = payload(3, 40);
    let a1 = dom.put(&session, &key(1), &r1).unwrap();
    let a2 = dom.put(&session, &key(2), &r2).unwrap();
    let a3 = dom.put(&session, &key(3), &r3).unwrap();

    let inserted = payload(9, 32);
    let a_new = dom.insert_after(&session, a2, &inserted).unwrap();
    assert_eq!(page_from_pointer(a_new), page_from_pointer(a2));
    assert_eq!(tid_from_pointer(a_new), 4);

    // the shifted record still resolves through its old address
    assert_eq!(dom.get_at(a3).unwrap(), r3);

    // document order: r1, r2, inserted, r3
    let order: Vec<Vec<u8>> = dom
        .iterator(&session, a1)
        .unwrap()
        .map(|value| value.data)
        .collect();
    assert_eq!(order, vec![r1, r2, inserted, r3]);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_insert_after_splits_page() {
    setup();
    let path = db_path("insert_split");
    let config = DomConfig::default();
    let dom = DomFile::create(&path, &config).unwrap();
    let session = Session::new();

    // fill one page exactly: eight 500-byte records
    let mut addresses = Vec::new();
    for i in 0..8i64 {
        addresses.push(dom.put(&session, &key(i), &payload(i, 500)).unwrap());
    }
    let full_page = page_from_pointer(addresses[0]);

    // inserting behind the first record cannot fit: the tail records
    // migrate to a split page
    let inserted = payload(42, 400);
    let a_new = dom.insert_after(&session, addresses[0], &inserted).unwrap();
    assert_eq!(page_from_pointer(a_new), full_page);

    // every old address still resolves, including the migrated ones
    for (i, a) in addresses.iter().enumerate() {
        assert_eq!(dom.get_at(*a).unwrap(), payload(i as i64, 500));
    }

    // iterator sees insertion order with the new record in place
    let order: Vec<Vec<u8>> = dom
        .iterator(&session, addresses[0])
        .unwrap()
        .map(|value| value.data)
        .collect();
    let mut expected = vec![payload(0, 500), inserted.clone()];
    for i in 1..8i64 {
        expected.push(payload(i, 500));
    }
    assert_eq!(order, expected);

    dom.close().unwrap();

    // stored record counts match a raw scan of both pages
    let file = PagedFile::open(&path, &config).unwrap();
    let old = DataPage::parse(
        full_page,
        &file.read_page(full_page).unwrap(),
        file.work_size(),
    )
    .unwrap();
    assert!(old.next_page() >= 0);
    let split_no = old.next_page() as u32;
    let split = DataPage::parse(
        split_no,
        &file.read_page(split_no).unwrap(),
        file.work_size(),
    )
    .unwrap();
    assert_eq!(split.prev_page(), full_page as i64);
    assert_eq!(old.record_count() + split.record_count(), 9);
    // the split page inherited the allocator as it stood at split time:
    // eight records had been handed tids 1..=8
    assert_eq!(split.next_tid(), 9);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_update_contract() {
    setup();
    let path = db_path("update");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    let addr = dom.put(&session, b"k", b"abc").unwrap();
    dom.update(&session, b"k", b"xyz").unwrap();
    assert_eq!(dom.get(b"k").unwrap(), b"xyz");
    // the address did not move
    assert_eq!(dom.address_of(b"k").unwrap(), Some(addr));

    let err = dom.update(&session, b"k", b"longer").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // shrinking is rejected just as loudly
    let err = dom.update(&session, b"k", b"ab").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(dom.get(b"k").unwrap(), b"xyz");

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_remove_and_lookup_miss() {
    setup();
    let path = db_path("remove");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    dom.put(&session, b"gone", b"payload").unwrap();
    assert!(dom.get(b"gone").is_some());
    dom.remove(&session, b"gone").unwrap();
    assert_eq!(dom.get(b"gone"), None);
    assert_eq!(dom.total_records(), 0);

    // removing again is a no-op
    dom.remove(&session, b"gone").unwrap();

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_drained_page_is_recycled() {
    setup();
    let path = db_path("recycle");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    // three pages worth of big records
    let a1 = dom.put(&session, &key(1), &payload(1, 3000)).unwrap();
    let a2 = dom.put(&session, &key(2), &payload(2, 3000)).unwrap();
    let a3 = dom.put(&session, &key(3), &payload(3, 3000)).unwrap();
    let middle_page = page_from_pointer(a2);

    // draining the middle page unlinks it from the chain
    dom.remove(&session, &key(2)).unwrap();
    let order: Vec<u64> = dom
        .iterator(&session, a1)
        .unwrap()
        .map(|value| value.address)
        .collect();
    assert_eq!(order, vec![a1, a3]);

    // the freed page is the next one handed out
    let a4 = dom.put(&session, &key(4), &payload(4, 3000)).unwrap();
    assert_eq!(page_from_pointer(a4), middle_page);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_exact_fill_boundary() {
    setup();
    let path = db_path("exact_fill");
    let config = DomConfig::default();
    let dom = DomFile::create(&path, &config).unwrap();
    let session = Session::new();

    // a value that fills the work area to the byte
    let work = config.page_size as usize - dom_db::storage::page::DATA_HEADER_SIZE;
    let exact = random_bytes(work - 4);
    let a1 = dom.put(&session, b"exact", &exact).unwrap();
    assert_eq!(dom.get_at(a1).unwrap(), exact);

    // the page is full now, the next record opens a new one
    let a2 = dom.put(&session, b"next", b"x").unwrap();
    assert_ne!(page_from_pointer(a2), page_from_pointer(a1));
    assert_eq!(tid_from_pointer(a2), 1);

    // anything bigger than the work area is refused outright
    let err = dom.put(&session, b"huge", &random_bytes(work)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_insert_after_last_record_of_full_page() {
    setup();
    let path = db_path("append_new_page");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    let mut addresses = Vec::new();
    for i in 0..8i64 {
        addresses.push(dom.put(&session, &key(i), &payload(i, 500)).unwrap());
    }
    let last = *addresses.last().unwrap();

    // behind the page's last record, with no room left: a fresh page is
    // spliced in right behind the current one
    let a_new = dom.insert_after(&session, last, &payload(77, 500)).unwrap();
    assert_ne!(page_from_pointer(a_new), page_from_pointer(last));
    assert_eq!(tid_from_pointer(a_new), 1);

    let order: Vec<u64> = dom
        .iterator(&session, addresses[0])
        .unwrap()
        .map(|value| value.address)
        .collect();
    let mut expected = addresses.clone();
    expected.push(a_new);
    assert_eq!(order, expected);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_iterator_remove() {
    setup();
    let path = db_path("iter_remove");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    let a1 = dom.put(&session, &key(1), b"alpha").unwrap();
    dom.put(&session, &key(2), b"beta").unwrap();
    dom.put(&session, &key(3), b"gamma").unwrap();

    let mut iter = dom.iterator(&session, a1).unwrap();
    assert_eq!(iter.next().unwrap().data, b"alpha");
    assert_eq!(iter.next().unwrap().data, b"beta");
    // drop "beta" mid-iteration; the walk continues at "gamma"
    iter.remove().unwrap();
    assert_eq!(iter.next().unwrap().data, b"gamma");
    assert!(iter.next().is_none());

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_read_only_rejects_writes() {
    setup();
    let path = db_path("read_only");
    {
        let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
        let session = Session::new();
        dom.put(&session, b"k", b"v").unwrap();
        dom.close().unwrap();
    }

    let mut config = DomConfig::default();
    config.read_only = true;
    let dom = DomFile::open(&path, &config).unwrap();
    let session = Session::new();

    assert_eq!(dom.get(b"k").unwrap(), b"v");
    let err = dom.put(&session, b"x", b"y").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnly);
    let err = dom.remove(&session, b"k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnly);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_put_get_remove_round_trip_many() {
    setup();
    let path = db_path("round_trip");
    let dom = DomFile::create(&path, &DomConfig::default()).unwrap();
    let session = Session::new();

    let mut expected = Vec::new();
    for i in 0..200i64 {
        let value = random_bytes(20 + (i as usize % 60));
        dom.put(&session, &key(i), &value).unwrap();
        expected.push(value);
    }
    for i in 0..200i64 {
        assert_eq!(dom.get(&key(i)).unwrap(), expected[i as usize]);
    }

    for i in (0..200i64).step_by(2) {
        dom.remove(&session, &key(i)).unwrap();
    }
    for i in 0..200i64 {
        if i % 2 == 0 {
            assert_eq!(dom.get(&key(i)), None);
        } else {
            assert_eq!(dom.get(&key(i)).unwrap(), expected[i as usize]);
        }
    }

    std::fs::remove_file(&path).unwrap();
}
