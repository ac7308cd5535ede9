//! Reservation lifecycle, locked sequencing, writer counting, and the
//! alternate mapping strategies.

use prodq::{
    ClassFilter, Disposition, OpenFlags, PqError, ProductInfo, ProductQueue, Relation, Signature,
    Timestamp,
};

fn sig(tag: u8) -> Signature {
    Signature([tag; 16])
}

fn info(tag: u8, size: u32) -> ProductInfo {
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
        size,
    }
}

fn new_queue(dir: &tempfile::TempDir, flags: OpenFlags) -> ProductQueue {
    ProductQueue::create(dir.path().join("test.pq"), 0o600, flags, 0, 1 << 20, 8).unwrap()
}

#[test]
fn test_reserve_fill_commit() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, OpenFlags::empty());

    let p = info(1, 16);
    let when = {
        let mut resv = pq.reserve(&p).unwrap();
        assert_eq!(resv.len(), 16);
        resv.copy_from_slice(b"filled in place!");
        resv.commit().unwrap()
    };
    assert_eq!(pq.most_recent().unwrap(), Some(when));

    let mut got = Vec::new();
    pq.process_product(&sig(1), |i, data| {
        assert_eq!(*i, p);
        got = data.to_vec();
    })
    .unwrap();
    assert_eq!(got, b"filled in place!");
}

#[test]
fn test_reserve_discard() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, OpenFlags::empty());

    let before = pq.stats().unwrap();
    {
        let mut resv = pq.reserve(&info(2, 8)).unwrap();
        resv.fill(0xEE);
        resv.discard().unwrap();
    }
    let after = pq.stats().unwrap();
    assert_eq!(after.product_count, before.product_count);
    assert_eq!(after.bytes_used, before.bytes_used);
    assert!(matches!(
        pq.process_product(&sig(2), |_, _| {}),
        Err(PqError::NotFound)
    ));
    // The signature slot is free again.
    pq.insert(&info(2, 4), b"abcd").unwrap();
}

#[test]
fn test_dropped_reservation_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, OpenFlags::empty());
    {
        let _resv = pq.reserve(&info(3, 8)).unwrap();
        // Dropped without a terminal call.
    }
    assert_eq!(pq.stats().unwrap().product_count, 0);
    pq.insert(&info(3, 4), b"wxyz").unwrap();
}

#[test]
fn test_commit_with_signature() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, OpenFlags::empty());

    // Reserve under a provisional signature, commit under the real one.
    let provisional = sig(0xAA);
    let real = sig(0xBB);
    let mut resv = pq.reserve(&info(0xAA, 8)).unwrap();
    resv.copy_from_slice(b"reSigned");
    resv.commit_with_signature(real).unwrap();

    assert!(matches!(
        pq.process_product(&provisional, |_, _| {}),
        Err(PqError::NotFound)
    ));
    let mut got = Vec::new();
    pq.process_product(&real, |i, data| {
        assert_eq!(i.signature, real);
        got = data.to_vec();
    })
    .unwrap();
    assert_eq!(got, b"reSigned");
}

#[test]
fn test_commit_with_existing_signature_is_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, OpenFlags::empty());

    pq.insert(&info(5, 4), b"orig").unwrap();

    let mut resv = pq.reserve(&info(0xCC, 4)).unwrap();
    resv.copy_from_slice(b"dupe");
    assert!(matches!(
        resv.commit_with_signature(sig(5)),
        Err(PqError::Duplicate)
    ));
    // The original survived, the reservation is gone.
    let mut got = Vec::new();
    pq.process_product(&sig(5), |_, d| got = d.to_vec()).unwrap();
    assert_eq!(got, b"orig");
    assert_eq!(pq.stats().unwrap().product_count, 1);
}

#[test]
fn test_sequence_locked_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, OpenFlags::empty());
    pq.insert(&info(1, 4), b"abcd").unwrap();

    let offset = pq
        .sequence_locked(Relation::Greater, &ClassFilter::All, |_, data| {
            assert_eq!(data, b"abcd");
            Disposition::Consumed
        })
        .unwrap();

    // While this process holds the region, deletion refuses.
    assert!(matches!(
        pq.delete_by_signature(&sig(1)),
        Err(PqError::Locked)
    ));

    pq.release(offset).unwrap();
    pq.delete_by_signature(&sig(1)).unwrap();

    // A second release of the same offset is an error.
    assert!(matches!(pq.release(offset), Err(PqError::NotFound)));
}

#[test]
fn test_writer_count_conservation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.pq");

    let pq1 = ProductQueue::create(&path, 0o600, OpenFlags::empty(), 0, 4096, 2).unwrap();
    assert_eq!(ProductQueue::write_count(&path).unwrap(), 1);

    let pq2 = ProductQueue::open(&path, OpenFlags::empty()).unwrap();
    assert_eq!(ProductQueue::write_count(&path).unwrap(), 2);

    pq2.close().unwrap();
    assert_eq!(ProductQueue::write_count(&path).unwrap(), 1);
    pq1.close().unwrap();
    assert_eq!(ProductQueue::write_count(&path).unwrap(), 0);
}

#[test]
fn test_clear_write_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.pq");

    // Simulate a crashed writer: create, then forget to close by leaking
    // the handle.
    let pq = ProductQueue::create(&path, 0o600, OpenFlags::empty(), 0, 4096, 2).unwrap();
    std::mem::forget(pq);
    assert_eq!(ProductQueue::write_count(&path).unwrap(), 1);

    assert_eq!(ProductQueue::clear_write_count(&path).unwrap(), 1);
    assert_eq!(ProductQueue::write_count(&path).unwrap(), 0);
}

#[test]
fn test_nomap_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.pq");
    {
        let mut pq =
            ProductQueue::create(&path, 0o600, OpenFlags::NOMAP, 0, 1 << 20, 8).unwrap();
        pq.insert(&info(1, 4), b"nmap").unwrap();
        pq.close().unwrap();
    }
    // A mapped reader sees what the unmapped writer wrote.
    let mut pq = ProductQueue::open(&path, OpenFlags::empty()).unwrap();
    let mut got = Vec::new();
    pq.process_product(&sig(1), |_, d| got = d.to_vec()).unwrap();
    assert_eq!(got, b"nmap");

    // And an unmapped reader works against its own writes.
    let mut pq = ProductQueue::open(&path, OpenFlags::NOMAP).unwrap();
    pq.insert(&info(2, 4), b"more").unwrap();
    let mut seqs = Vec::new();
    loop {
        match pq.sequence(Relation::Greater, &ClassFilter::All, |i, _| {
            seqs.push(i.seq_no);
            Disposition::Consumed
        }) {
            Ok(()) => {}
            Err(PqError::QueueEnd) => break,
            Err(e) => panic!("{e}"),
        }
    }
    assert_eq!(seqs, vec![1, 2]);
}

#[test]
fn test_maprgns_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.pq");
    {
        let mut pq =
            ProductQueue::create(&path, 0o600, OpenFlags::MAPRGNS, 0, 1 << 20, 8).unwrap();
        pq.insert(&info(1, 6), b"rgnmap").unwrap();
        pq.close().unwrap();
    }
    let mut pq = ProductQueue::open(&path, OpenFlags::MAPRGNS).unwrap();
    let mut got = Vec::new();
    pq.process_product(&sig(1), |_, d| got = d.to_vec()).unwrap();
    assert_eq!(got, b"rgnmap");
    pq.insert(&info(2, 4), b"two!").unwrap();
    assert_eq!(pq.stats().unwrap().product_count, 2);
}

#[test]
fn test_reserve_direct() {
    let dir = tempfile::tempdir().unwrap();
    let mut pq = new_queue(&dir, OpenFlags::empty());

    // Pre-encode a product the way the queue lays regions out, then copy
    // it in through a direct reservation.
    let p = info(4, 5);
    let mut staged = vec![0u8; 256];
    let data_start = prodq::encode_product(&mut staged, &p).unwrap();
    staged[data_start..data_start + 5].copy_from_slice(b"DIREC");
    let total = (data_start + 5) as u64;

    let mut resv = pq.reserve_direct(total, &p.signature).unwrap();
    resv[..total as usize].copy_from_slice(&staged[..total as usize]);
    resv.commit().unwrap();

    let mut got = Vec::new();
    pq.process_product(&sig(4), |i, d| {
        assert_eq!(i.ident, p.ident);
        got = d.to_vec();
    })
    .unwrap();
    assert_eq!(got, b"DIREC");
}
