use codefetch_api::{config::Config, *};
use codefetch_core::{
    factories::{
        core_fetch::{
            config::{CodeFetchConfig, CodeFetchModConfig},
            MOD_NAME,
        },
        FnTableRelocator, MemCodeStore, MemRadio, MemRegistry,
    },
    node::{FetchNode, NodeResources},
};
use codefetch_test_utils::{enable_tracing, iter_check, seeded_bytes};
use rand::{Rng, SeedableRng};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;

const KEY: ContentKey = ContentKey(0x42);
const KEY_2: ContentKey = ContentKey(0x43);
const REQUESTER: RequesterId = RequesterId(1);

/// Long enough for any fetch in these tests, protocol time is free with a
/// paused clock.
const DONE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

struct Peer {
    node: FetchNode,
    done: mpsc::Receiver<FetchDone>,
    registry: Arc<MemRegistry>,
    store: Arc<MemCodeStore>,
}

impl Peer {
    fn hold(
        &self,
        key: ContentKey,
        data: Vec<u8>,
        kind: ContentKind,
        base: CodeAddr,
    ) {
        let handle = self.store.insert(data, base);
        self.registry.insert(
            key,
            RegistryEntry {
                handle,
                status: FetchStatus::Done,
                kind,
            },
        );
    }

    fn slot(
        &self,
        key: ContentKey,
        size: u32,
        kind: ContentKind,
        base: CodeAddr,
    ) -> StoreHandle {
        let handle = self.store.alloc(size, base);
        self.registry.insert(
            key,
            RegistryEntry {
                handle,
                status: FetchStatus::Queued,
                kind,
            },
        );
        handle
    }

    async fn next_done(&mut self) -> FetchDone {
        tokio::time::timeout(DONE_TIMEOUT, self.done.recv())
            .await
            .unwrap()
            .unwrap()
    }
}

fn make_peer(
    radio: &Arc<MemRadio>,
    addr: u16,
    fetch_config: Option<CodeFetchModConfig>,
    split_store: bool,
    done_capacity: usize,
) -> Peer {
    let mut config = Config::default();
    config
        .add_default_module_config::<CodeFetchModConfig>(MOD_NAME.into())
        .unwrap();
    if let Some(fetch_config) = fetch_config {
        config
            .set_module_config(MOD_NAME.into(), &fetch_config)
            .unwrap();
    }
    let fetch_config = config
        .get_module_config::<CodeFetchModConfig>(MOD_NAME)
        .unwrap()
        .code_fetch;

    let registry = MemRegistry::create();
    let (store, store_events) = if split_store {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemCodeStore::create_split(tx), Some(rx))
    } else {
        (MemCodeStore::create(), None)
    };
    let (transport, frames) = radio.attach(NodeAddr(addr));
    let (node, done) = FetchNode::spawn(
        fetch_config,
        NodeResources {
            registry: registry.clone(),
            store: store.clone(),
            relocator: FnTableRelocator::create(),
            transport,
            frames,
            store_events,
        },
        done_capacity,
    );

    Peer {
        node,
        done,
        registry,
        store,
    }
}

fn patient() -> CodeFetchModConfig {
    CodeFetchModConfig {
        code_fetch: CodeFetchConfig {
            max_retries: 20,
            ..Default::default()
        },
    }
}

#[tokio::test(start_paused = true)]
async fn two_node_raw_fetch() {
    enable_tracing();
    let radio = MemRadio::create();
    let alice = make_peer(&radio, 1, None, false, 4);
    let mut bob = make_peer(&radio, 2, None, false, 4);

    let data = seeded_bytes(1, 1000);
    alice.hold(KEY, data.clone(), ContentKind::Raw, CodeAddr(0));
    let handle = bob.slot(KEY, 1000, ContentKind::Raw, CodeAddr(0));

    bob.node
        .request(REQUESTER, KEY, 1000, alice.node.addr())
        .await
        .unwrap();

    let done = bob.next_done().await;
    assert_eq!(FetchOutcome::Complete, done.outcome);
    assert_eq!(REQUESTER, done.job.requester());
    assert_eq!(Some(data), bob.store.contents(handle));
    assert!(bob.store.is_flushed(handle));
    assert_eq!(Some(FetchStatus::Done), bob.registry.status(KEY));

    // alice is done serving
    iter_check!(5000, 100, {
        if alice.node.snapshot().await.unwrap().sending.is_none() {
            break;
        }
    });
}

#[tokio::test(start_paused = true)]
async fn module_is_relocated_between_bases() {
    enable_tracing();
    let radio = MemRadio::create();
    let alice = make_peer(&radio, 1, None, false, 4);
    let mut bob = make_peer(&radio, 2, None, false, 4);

    let funcs: Vec<u32> = (0..12).map(|n| 0x100 + n * 0x20).collect();
    let image =
        FnTableRelocator::build_image(4, 0x80, &funcs, &seeded_bytes(2, 400));
    let relocator = FnTableRelocator::create();
    let mut at_alice = image.clone();
    relocator.patch_in(CodeAddr(0x4000), 12, &mut at_alice, 0);
    let mut at_bob = image.clone();
    relocator.patch_in(CodeAddr(0x8000), 12, &mut at_bob, 0);

    alice.hold(
        KEY,
        at_alice,
        ContentKind::RelocatableCode,
        CodeAddr(0x4000),
    );
    let size = image.len() as u32;
    let handle =
        bob.slot(KEY, size, ContentKind::RelocatableCode, CodeAddr(0x8000));

    bob.node
        .request(REQUESTER, KEY, size, alice.node.addr())
        .await
        .unwrap();

    let done = bob.next_done().await;
    assert_eq!(FetchOutcome::Complete, done.outcome);
    assert_eq!(Some(12), done.job.num_funcs());
    assert_eq!(Some(at_bob), bob.store.contents(handle));
}

#[tokio::test(start_paused = true)]
async fn neighbours_share_one_sender() {
    enable_tracing();
    let radio = MemRadio::create();
    let alice = make_peer(&radio, 1, None, false, 4);
    let data = seeded_bytes(3, 1024);
    alice.hold(KEY, data.clone(), ContentKind::Raw, CodeAddr(0));
    let fragments = num_fragments_for(1024);

    let mut peers = Vec::new();
    for addr in 2..5 {
        let peer = make_peer(&radio, addr, None, false, 4);
        let handle = peer.slot(KEY, 1024, ContentKind::Raw, CodeAddr(0));
        peer.node
            .request(REQUESTER, KEY, 1024, alice.node.addr())
            .await
            .unwrap();
        peers.push((peer, handle));
    }

    for (peer, handle) in peers.iter_mut() {
        assert_eq!(FetchOutcome::Complete, peer.next_done().await.outcome);
        assert_eq!(Some(data.clone()), peer.store.contents(*handle));
    }

    // overhearing keeps alice from sending the image once per neighbour
    assert!(radio.frames_sent_by(alice.node.addr()) < 3 * fragments);
}

#[tokio::test(start_paused = true)]
async fn silent_source_fails_the_fetch() {
    enable_tracing();
    let radio = MemRadio::create();
    let mut bob = make_peer(
        &radio,
        2,
        Some(CodeFetchModConfig {
            code_fetch: CodeFetchConfig {
                max_retries: 2,
                ..Default::default()
            },
        }),
        false,
        4,
    );
    bob.slot(KEY, 200, ContentKind::Raw, CodeAddr(0));

    bob.node
        .request(REQUESTER, KEY, 200, NodeAddr(99))
        .await
        .unwrap();

    let done = bob.next_done().await;
    assert_eq!(FetchOutcome::RetryBoundExceeded, done.outcome);
    assert_eq!(Some(FetchStatus::Failed), bob.registry.status(KEY));
    assert_eq!(2, radio.frames_sent_by(bob.node.addr()));
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_restarts_from_another_source() {
    enable_tracing();
    let radio = MemRadio::create();
    let alice = make_peer(&radio, 1, None, false, 4);
    let mut bob = make_peer(
        &radio,
        2,
        Some(CodeFetchModConfig {
            code_fetch: CodeFetchConfig {
                max_retries: 1,
                ..Default::default()
            },
        }),
        false,
        4,
    );
    let data = seeded_bytes(4, 500);
    alice.hold(KEY, data.clone(), ContentKind::Raw, CodeAddr(0));
    let handle = bob.slot(KEY, 500, ContentKind::Raw, CodeAddr(0));

    bob.node
        .request(REQUESTER, KEY, 500, NodeAddr(99))
        .await
        .unwrap();
    let done = bob.next_done().await;
    assert_eq!(FetchOutcome::RetryBoundExceeded, done.outcome);

    bob.node.restart(done.job, alice.node.addr()).await.unwrap();
    let done = bob.next_done().await;
    assert_eq!(FetchOutcome::Complete, done.outcome);
    assert_eq!(Some(data), bob.store.contents(handle));
}

#[tokio::test(start_paused = true)]
async fn source_comes_online_after_being_unresponsive() {
    enable_tracing();
    let radio = MemRadio::create();
    let mut bob = make_peer(&radio, 2, Some(patient()), false, 4);
    let handle = bob.slot(KEY, 300, ContentKind::Raw, CodeAddr(0));

    bob.node
        .request(REQUESTER, KEY, 300, NodeAddr(1))
        .await
        .unwrap();

    // let bob ask into the void for a while
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(bob.store.contents(handle).unwrap().iter().all(|b| *b == 0));
    assert!(bob.done.try_recv().is_err());

    let data = seeded_bytes(5, 300);
    let alice = make_peer(&radio, 1, None, false, 4);
    alice.hold(KEY, data.clone(), ContentKind::Raw, CodeAddr(0));

    let done = bob.next_done().await;
    assert_eq!(FetchOutcome::Complete, done.outcome);
    assert_eq!(Some(data), bob.store.contents(handle));
}

#[tokio::test(start_paused = true)]
async fn split_stores_on_both_ends() {
    enable_tracing();
    let radio = MemRadio::create();
    let alice = make_peer(&radio, 1, None, true, 4);
    let mut bob = make_peer(&radio, 2, None, true, 4);

    let data = seeded_bytes(6, 700);
    alice.hold(KEY, data.clone(), ContentKind::Raw, CodeAddr(0));
    let handle = bob.slot(KEY, 700, ContentKind::Raw, CodeAddr(0));

    bob.node
        .request(REQUESTER, KEY, 700, alice.node.addr())
        .await
        .unwrap();

    assert_eq!(FetchOutcome::Complete, bob.next_done().await.outcome);
    assert_eq!(Some(data), bob.store.contents(handle));
}

#[tokio::test(start_paused = true)]
async fn split_store_serves_a_module() {
    enable_tracing();
    let radio = MemRadio::create();
    let alice = make_peer(&radio, 1, None, true, 4);
    let mut bob = make_peer(&radio, 2, None, true, 4);

    let funcs: Vec<u32> = (0..5).map(|n| 0x40 + n * 0x10).collect();
    let image =
        FnTableRelocator::build_image(2, 0x30, &funcs, &seeded_bytes(8, 300));
    let relocator = FnTableRelocator::create();
    let mut at_alice = image.clone();
    relocator.patch_in(CodeAddr(0x1000), 5, &mut at_alice, 0);
    let mut at_bob = image.clone();
    relocator.patch_in(CodeAddr(0x3000), 5, &mut at_bob, 0);

    alice.hold(
        KEY,
        at_alice,
        ContentKind::RelocatableCode,
        CodeAddr(0x1000),
    );
    let size = image.len() as u32;
    let handle =
        bob.slot(KEY, size, ContentKind::RelocatableCode, CodeAddr(0x3000));

    bob.node
        .request(REQUESTER, KEY, size, alice.node.addr())
        .await
        .unwrap();

    assert_eq!(FetchOutcome::Complete, bob.next_done().await.outcome);
    assert_eq!(Some(at_bob), bob.store.contents(handle));
}

#[tokio::test(start_paused = true)]
async fn lossy_link_still_completes() {
    enable_tracing();
    let radio = MemRadio::create();
    let rng = Mutex::new(rand::rngs::StdRng::seed_from_u64(7));
    radio.set_drop_fn(move |_, _| rng.lock().unwrap().gen_bool(0.25));

    let alice = make_peer(&radio, 1, None, false, 4);
    let mut bob = make_peer(&radio, 2, Some(patient()), false, 4);
    let mut carol = make_peer(&radio, 3, Some(patient()), false, 4);

    let data = seeded_bytes(7, 2000);
    alice.hold(KEY, data.clone(), ContentKind::Raw, CodeAddr(0));
    let bob_handle = bob.slot(KEY, 2000, ContentKind::Raw, CodeAddr(0));
    let carol_handle = carol.slot(KEY, 2000, ContentKind::Raw, CodeAddr(0));

    bob.node
        .request(REQUESTER, KEY, 2000, alice.node.addr())
        .await
        .unwrap();
    carol
        .node
        .request(REQUESTER, KEY, 2000, alice.node.addr())
        .await
        .unwrap();

    assert_eq!(FetchOutcome::Complete, bob.next_done().await.outcome);
    assert_eq!(FetchOutcome::Complete, carol.next_done().await.outcome);
    assert_eq!(Some(data.clone()), bob.store.contents(bob_handle));
    assert_eq!(Some(data), carol.store.contents(carol_handle));
}

#[tokio::test(start_paused = true)]
async fn queued_fetches_run_in_order_and_wait_for_a_reader() {
    enable_tracing();
    let radio = MemRadio::create();
    let alice = make_peer(&radio, 1, None, false, 4);
    // room for a single unread notification
    let mut bob = make_peer(&radio, 2, None, false, 1);

    alice.hold(KEY, seeded_bytes(8, 100), ContentKind::Raw, CodeAddr(0));
    alice.hold(KEY_2, seeded_bytes(9, 100), ContentKind::Raw, CodeAddr(0));
    bob.slot(KEY, 100, ContentKind::Raw, CodeAddr(0));
    bob.slot(KEY_2, 100, ContentKind::Raw, CodeAddr(0));

    bob.node
        .request(REQUESTER, KEY, 100, alice.node.addr())
        .await
        .unwrap();
    bob.node
        .request(REQUESTER, KEY_2, 100, alice.node.addr())
        .await
        .unwrap();
    assert_eq!(vec![KEY_2], bob.node.snapshot().await.unwrap().queued);

    // both fetches finish while nobody reads notifications
    iter_check!(600_000, 1000, {
        if bob.registry.status(KEY_2) == Some(FetchStatus::Done) {
            break;
        }
    });

    let first = bob.next_done().await;
    assert_eq!(KEY, first.job.key());
    let second = bob.next_done().await;
    assert_eq!(KEY_2, second.job.key());
    assert_eq!(FetchOutcome::Complete, second.outcome);
}

#[tokio::test(start_paused = true)]
async fn cancel_through_the_node() {
    enable_tracing();
    let radio = MemRadio::create();
    let bob = make_peer(&radio, 2, Some(patient()), false, 4);
    bob.slot(KEY, 100, ContentKind::Raw, CodeAddr(0));
    bob.slot(KEY_2, 100, ContentKind::Raw, CodeAddr(0));

    bob.node
        .request(REQUESTER, KEY, 100, NodeAddr(1))
        .await
        .unwrap();
    bob.node
        .request(REQUESTER, KEY_2, 100, NodeAddr(1))
        .await
        .unwrap();

    bob.node.cancel(REQUESTER, KEY).await.unwrap();
    let snapshot = bob.node.snapshot().await.unwrap();
    assert_eq!(KEY_2, snapshot.active.unwrap().key());
    assert!(snapshot.queued.is_empty());

    assert!(matches!(
        bob.node.cancel(REQUESTER, KEY).await,
        Err(FetchError::NotFound(KEY)),
    ));
    assert!(matches!(
        bob.node.request(REQUESTER, ContentKey(9), 100, NodeAddr(1)).await,
        Err(FetchError::UnknownKey(_)),
    ));
}
