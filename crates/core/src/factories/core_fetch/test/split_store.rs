use super::utils::*;
use crate::factories::core_fetch::config::CodeFetchConfig;
use crate::factories::FnTableRelocator;
use codefetch_api::*;
use codefetch_test_utils::seeded_bytes;

const KEY: ContentKey = ContentKey(30);
const KEY_2: ContentKey = ContentKey(31);

#[test]
fn split_write_parks_the_fragment() {
    let mut t = setup_split_test(CodeFetchConfig::default());
    let data = seeded_bytes(20, 300);
    let handle = t.add_slot(KEY, 300, ContentKind::Raw, CodeAddr(0));
    t.fetcher.request(REQ_A, KEY, 300, PEER).unwrap();
    t.fetcher.on_timer(TimerId::Request);
    t.fetcher.on_timer(TimerId::Request);

    t.recv_fragment(KEY, 0, &data);
    assert!(t.fetcher.is_store_busy());
    assert!(t.fetcher.active_job().unwrap().bitmap().is_set(0));

    // dropped while the store is busy, but still proof of life
    t.fetcher.on_timer(TimerId::Request);
    assert_eq!(1, t.fetcher.active_job().unwrap().retry_count());
    t.recv_fragment(KEY, 1, &data);
    assert_eq!(0, t.fetcher.active_job().unwrap().retry_count());

    assert_eq!(1, t.pump_store());
    assert!(!t.fetcher.is_store_busy());
    let job = t.fetcher.active_job().unwrap();
    assert!(!job.bitmap().is_set(0));
    assert!(job.bitmap().is_set(1));

    for index in 1..5 {
        t.recv_fragment(KEY, index, &data);
        t.pump_store();
    }
    assert_eq!(FetchOutcome::Complete, t.done()[0].outcome);
    assert_eq!(Some(data), t.store.contents(handle));
}

#[test]
fn split_write_failure_fails_the_job() {
    let mut t = setup_split_test(CodeFetchConfig::default());
    t.add_slot(KEY, 100, ContentKind::Raw, CodeAddr(0));
    t.fetcher.request(REQ_A, KEY, 100, PEER).unwrap();

    t.store.set_failing(true);
    t.recv_fragment(KEY, 0, &[1; 100]);
    assert!(t.done().is_empty());

    t.pump_store();
    assert_eq!(FetchOutcome::StoreFailure, t.done()[0].outcome);
    assert!(!t.fetcher.is_store_busy());
}

#[test]
fn cancel_drops_a_parked_write() {
    let mut t = setup_split_test(CodeFetchConfig::default());
    t.add_slot(KEY, 100, ContentKind::Raw, CodeAddr(0));
    t.add_slot(KEY_2, 100, ContentKind::Raw, CodeAddr(0));
    t.fetcher.request(REQ_A, KEY, 100, PEER).unwrap();
    t.fetcher.request(REQ_A, KEY_2, 100, PEER).unwrap();

    t.recv_fragment(KEY, 0, &[1; 100]);
    assert!(t.fetcher.is_store_busy());
    t.fetcher.cancel(REQ_A, KEY).unwrap();
    assert!(!t.fetcher.is_store_busy());

    // the late completion belongs to nobody
    t.pump_store();
    let job = t.fetcher.active_job().unwrap();
    assert_eq!(KEY_2, job.key());
    assert_eq!(2, job.bitmap().count_set());
}

#[test]
fn split_read_parks_the_transmission() {
    let mut t = setup_split_test(CodeFetchConfig::default());
    let data = seeded_bytes(21, 200);
    t.add_content(KEY, data.clone(), ContentKind::Raw, CodeAddr(0));
    t.recv_request(PEER, LOCAL, wire_bitmap(KEY, 1, &[0, 1]));

    t.fetcher.on_timer(TimerId::Transmit);
    assert!(t.fetcher.is_store_busy());
    assert!(t.fragments_sent().is_empty());

    // skipped while busy
    t.fetcher.on_timer(TimerId::Transmit);
    assert_eq!(1, t.fetcher.send_job().unwrap().wanted().count_set());

    t.pump_store();
    assert_eq!(1, t.fragments_sent().len());
    assert!(t.fetcher.send_job().is_some());

    t.fetcher.on_timer(TimerId::Transmit);
    t.pump_store();
    let sent = t.fragments_sent();
    assert_eq!(2, sent.len());
    assert_eq!(&data[64..128], &sent[1].1.payload[..]);
    assert!(t.fetcher.send_job().is_none());
    assert!(t.timers.armed(TimerId::Transmit).is_none());
}

#[test]
fn split_read_failure_stops_serving() {
    let mut t = setup_split_test(CodeFetchConfig::default());
    t.add_content(KEY, seeded_bytes(22, 200), ContentKind::Raw, CodeAddr(0));
    t.recv_request(PEER, LOCAL, wire_bitmap(KEY, 1, &[0, 1]));

    t.store.set_failing(true);
    t.fetcher.on_timer(TimerId::Transmit);
    t.pump_store();

    assert!(t.fetcher.send_job().is_none());
    assert!(!t.fetcher.is_store_busy());
    assert!(t.fragments_sent().is_empty());
}

#[test]
fn relocatable_header_is_read_before_the_first_fragment() {
    let mut t = setup_split_test(CodeFetchConfig::default());
    let image = FnTableRelocator::build_image(1, 0x10, &[0x20, 0x30], &[7; 8]);
    let base = CodeAddr(0x100);
    let mut resident = image.clone();
    FnTableRelocator::create().patch_in(base, 2, &mut resident, 0);
    t.add_content(KEY, resident, ContentKind::RelocatableCode, base);

    t.recv_request(PEER, LOCAL, wire_bitmap(KEY, 1, &[0]));
    assert!(t.fetcher.send_job().is_some());

    t.fetcher.on_timer(TimerId::Transmit);
    assert!(t.fetcher.is_store_busy());
    assert_eq!(1, t.pump_store());
    assert!(!t.fetcher.is_store_busy());
    assert!(t.fragments_sent().is_empty());

    t.fetcher.on_timer(TimerId::Transmit);
    t.pump_store();
    let sent = t.fragments_sent();
    assert_eq!(1, sent.len());
    assert_eq!(&image[..], &sent[0].1.payload[..image.len()]);
    assert!(t.fetcher.send_job().is_none());
}

#[test]
fn unreadable_header_stops_serving() {
    let mut t = setup_split_test(CodeFetchConfig::default());
    let image = FnTableRelocator::build_image(0, 0x10, &[0x20], &[0; 8]);
    t.add_content(KEY, image, ContentKind::RelocatableCode, CodeAddr(0x100));
    t.recv_request(PEER, LOCAL, wire_bitmap(KEY, 1, &[0]));

    t.store.set_failing(true);
    t.fetcher.on_timer(TimerId::Transmit);
    t.pump_store();

    assert!(t.fetcher.send_job().is_none());
    assert!(!t.fetcher.is_store_busy());
    assert!(t.fragments_sent().is_empty());
}
