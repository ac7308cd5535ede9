//! Create/insert/sequence round trips, duplicate rejection, deletion, and
//! the coalescing behavior visible through the statistics.

use prodq::{
    ClassFilter, Disposition, OpenFlags, PqError, ProductInfo, ProductQueue, Relation, Signature,
    Timestamp,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sig(tag: u8) -> Signature {
    Signature([tag; 16])
}

fn info(tag: u8, payload: &[u8]) -> ProductInfo {
    ProductInfo {
        create_time: Timestamp {
            sec: 1_700_000_000 + i64::from(tag),
            usec: 0,
        },
        signature: sig(tag),
        origin: "host".into(),
        feed_type: 1,
        seq_no: u32::from(tag),
        ident: format!("p{}", tag % 10),
        size: payload.len() as u32,
    }
}

fn new_queue(dir: &tempfile::TempDir, data_bytes: u64, nprods: u64) -> ProductQueue {
    ProductQueue::create(
        dir.path().join("test.pq"),
        0o600,
        OpenFlags::empty(),
        0,
        data_bytes,
        nprods,
    )
    .unwrap()
}

#[test]
fn test_create_insert_sequence() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, 1 << 20, 4);

    let one = info(1, b"A");
    let when = pq.insert(&one, b"A").unwrap();

    let mut seen = Vec::new();
    pq.sequence(Relation::Greater, &ClassFilter::All, |i, data| {
        seen.push((i.clone(), data.to_vec()));
        Disposition::Consumed
    })
    .unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, one);
    assert_eq!(seen[0].1, b"A");

    assert_eq!(pq.most_recent().unwrap(), Some(when));
    let stats = pq.stats().unwrap();
    assert_eq!(stats.product_count, 1);
    assert_eq!(stats.capacity, 4);
    assert!(!stats.is_full);
    assert!(stats.age_oldest.is_some());

    assert!(matches!(
        pq.sequence(Relation::Greater, &ClassFilter::All, |_, _| {
            Disposition::Consumed
        }),
        Err(PqError::QueueEnd)
    ));
}

#[test]
fn test_duplicate_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, 1 << 20, 4);

    pq.insert(&info(1, b"A"), b"A").unwrap();
    let stats_before = pq.stats().unwrap();

    // Same signature, different bytes.
    let err = pq.insert(&info(1, b"B"), b"B").unwrap_err();
    assert!(matches!(err, PqError::Duplicate));

    let stats_after = pq.stats().unwrap();
    assert_eq!(stats_before.product_count, stats_after.product_count);
    assert_eq!(stats_before.bytes_used, stats_after.bytes_used);

    let mut got = Vec::new();
    pq.process_product(&sig(1), |_, data| got = data.to_vec())
        .unwrap();
    assert_eq!(got, b"A");
}

#[test]
fn test_round_trip_law() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, 1 << 20, 4);

    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let p = info(7, &payload);
    pq.insert(&p, &payload).unwrap();

    let mut called = false;
    pq.process_product(&sig(7), |i, data| {
        called = true;
        assert_eq!(*i, p);
        assert_eq!(data, payload.as_slice());
    })
    .unwrap();
    assert!(called);

    assert!(matches!(
        pq.process_product(&sig(99), |_, _| {}),
        Err(PqError::NotFound)
    ));
}

#[test]
fn test_boundary_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, 4096, 4);

    // Zero-byte products are rejected.
    assert!(matches!(
        pq.insert(&info(1, b""), b""),
        Err(PqError::Invalid(_))
    ));

    // Larger than the data segment.
    let big = vec![0u8; 8192];
    assert!(matches!(
        pq.insert(&info(2, &big), &big),
        Err(PqError::TooBig { .. })
    ));
}

#[test]
fn test_delete_restores_space() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, 1 << 20, 8);

    let payload = vec![0x55u8; 4096];
    let before = pq.stats().unwrap();
    pq.insert(&info(3, &payload), &payload).unwrap();
    pq.delete_by_signature(&sig(3)).unwrap();

    let after = pq.stats().unwrap();
    assert_eq!(after.product_count, before.product_count);
    assert_eq!(after.bytes_used, before.bytes_used);
    assert!(after.max_free_extent >= 4096);
    assert!(matches!(
        pq.process_product(&sig(3), |_, _| {}),
        Err(PqError::NotFound)
    ));
    // Deleting again reports the absence.
    assert!(matches!(
        pq.delete_by_signature(&sig(3)),
        Err(PqError::NotFound)
    ));
}

#[test]
fn test_delete_middle_coalesces() {
    let dir = tempfile::tempdir().unwrap();
    // 8-byte payloads with 4-character origins and 2-character idents give
    // 80-byte regions; a 400-byte segment holds three with splits.
    let mut pq = new_queue(&dir, 400, 8);
    for tag in 1..=3u8 {
        pq.insert(&info(tag, b"12345678"), b"12345678").unwrap();
    }
    // Layout now: [1][2][3][trailing free].
    let s0 = pq.stats().unwrap();
    assert_eq!(s0.product_count, 3);
    assert_eq!(s0.free_count, 1);

    // Deleting the middle product leaves an isolated hole.
    pq.delete_by_signature(&sig(2)).unwrap();
    let s1 = pq.stats().unwrap();
    assert_eq!(s1.free_count, 2);

    // Deleting the first product merges with that hole instead of adding
    // a third free region.
    pq.delete_by_signature(&sig(1)).unwrap();
    let s2 = pq.stats().unwrap();
    assert_eq!(s2.free_count, 2);
    assert!(s2.max_free_extent >= 160);

    // Deleting the last in-use product merges everything back into one
    // maximum-extent region.
    pq.delete_by_signature(&sig(3)).unwrap();
    let s3 = pq.stats().unwrap();
    assert_eq!(s3.free_count, 1);
    assert_eq!(s3.max_free_extent, 400);
}

#[test]
fn test_last_by_filter() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, 1 << 20, 8);

    let mut a = info(1, b"aaaa");
    a.feed_type = 0x1;
    let mut b = info(2, b"bbbb");
    b.feed_type = 0x2;
    let mut c = info(3, b"cccc");
    c.feed_type = 0x1;
    pq.insert(&a, b"aaaa").unwrap();
    pq.insert(&b, b"bbbb").unwrap();
    pq.insert(&c, b"cccc").unwrap();

    assert_eq!(pq.last(&ClassFilter::All).unwrap(), c.create_time);
    assert_eq!(pq.last(&ClassFilter::Feed(0x2)).unwrap(), b.create_time);
    assert!(matches!(
        pq.last(&ClassFilter::Feed(0x8)),
        Err(PqError::NotFound)
    ));
}

#[test]
fn test_class_filter_skips_but_advances() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, 1 << 20, 8);

    let mut a = info(1, b"aaaa");
    a.feed_type = 0x1;
    let mut b = info(2, b"bbbb");
    b.feed_type = 0x2;
    pq.insert(&a, b"aaaa").unwrap();
    pq.insert(&b, b"bbbb").unwrap();

    let mut seen = Vec::new();
    loop {
        match pq.sequence(Relation::Greater, &ClassFilter::Feed(0x2), |i, _| {
            seen.push(i.signature);
            Disposition::Consumed
        }) {
            Ok(()) => {}
            Err(PqError::QueueEnd) => break,
            Err(e) => panic!("{e}"),
        }
    }
    // Only the matching product reached the callback, but the cursor
    // walked the whole queue.
    assert_eq!(seen, vec![sig(2)]);
}

#[test]
fn test_deferred_callback_rewinds() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, 1 << 20, 4);
    pq.insert(&info(1, b"AAAA"), b"AAAA").unwrap();

    let mut visits = 0;
    pq.sequence(Relation::Greater, &ClassFilter::All, |_, _| {
        visits += 1;
        Disposition::Deferred
    })
    .unwrap();
    // The rewind makes the same product visible again.
    pq.sequence(Relation::Greater, &ClassFilter::All, |_, _| {
        visits += 1;
        Disposition::Consumed
    })
    .unwrap();
    assert_eq!(visits, 2);
    assert!(matches!(
        pq.sequence(Relation::Greater, &ClassFilter::All, |_, _| {
            Disposition::Consumed
        }),
        Err(PqError::QueueEnd)
    ));
}

#[test]
fn test_reopen_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.pq");
    let payload = b"persistent payload".to_vec();
    {
        let mut pq = ProductQueue::create(&path, 0o600, OpenFlags::empty(), 0, 1 << 20, 4)
            .unwrap();
        pq.insert(&info(9, &payload), &payload).unwrap();
        pq.close().unwrap();
    }
    let mut pq = ProductQueue::open(&path, OpenFlags::empty()).unwrap();
    let mut got = Vec::new();
    pq.process_product(&sig(9), |_, data| got = data.to_vec())
        .unwrap();
    assert_eq!(got, payload);
    assert_eq!(pq.stats().unwrap().product_count, 1);
}

#[test]
fn test_noclobber() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.pq");
    ProductQueue::create(&path, 0o600, OpenFlags::empty(), 0, 4096, 2).unwrap();
    assert!(
        ProductQueue::create(&path, 0o600, OpenFlags::NOCLOBBER, 0, 4096, 2).is_err()
    );
}

#[test]
fn test_readonly_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.pq");
    {
        let mut pq = ProductQueue::create(&path, 0o600, OpenFlags::empty(), 0, 1 << 20, 4)
            .unwrap();
        pq.insert(&info(5, b"data"), b"data").unwrap();
        pq.close().unwrap();
    }
    let mut pq = ProductQueue::open(&path, OpenFlags::READONLY).unwrap();
    assert!(matches!(
        pq.insert(&info(6, b"more"), b"more"),
        Err(PqError::Invalid(_))
    ));
    let mut got = Vec::new();
    pq.process_product(&sig(5), |_, data| got = data.to_vec())
        .unwrap();
    assert_eq!(got, b"data");
    // Read-only opens do not count as writers.
    assert_eq!(ProductQueue::write_count(&path).unwrap(), 0);
}
