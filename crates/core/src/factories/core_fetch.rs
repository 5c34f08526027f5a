//! Fetch is the module that disseminates code images between neighbouring
//! nodes over a single-hop, lossy, broadcast radio link.
//!
//! A [CodeFetcher] plays two roles at once. It receives content it was
//! asked to fetch, and it serves content it already holds to neighbours
//! that ask for it.
//!
//! ### Receive path
//!
//! - [CodeFetcher::request] admits a [FetchJob] for a content key, its size
//!   and the node to fetch it from. Jobs form a FIFO queue, only the head
//!   is active.
//! - The active job arms the request timer with a randomized backoff. When
//!   it fires, a REQUEST carrying the job's bitmap of missing fragments is
//!   sent to the source and the timer is re-armed as a longer watchdog.
//! - Every FRAGMENT for the active key is applied: relocated if the content
//!   is a module, written to the code store, and its bit cleared. Any such
//!   fragment also resets the watchdog and the retry count.
//! - Once the bitmap is empty the job is committed, the registry entry is
//!   marked done, the requester is notified, and the next job starts. After
//!   too many silent timeouts the job fails instead.
//!
//! ### Send path
//!
//! - A REQUEST addressed to this node for content it holds creates the
//!   single [SendJob], whose wanted bitmap is the request minus anything
//!   this node is itself still missing. Requests for the same key merge
//!   into it, requests for other keys are ignored while it exists.
//! - A periodic timer sends the lowest wanted fragment per tick, clearing
//!   its bit before the send. Module fragments are patched out with the
//!   function count from the module header, read on the first tick unless
//!   a local fetch of the same key already knows it. There is no
//!   acknowledgement, receivers re-request what they miss.
//! - Every overheard FRAGMENT for the same key clears the matching wanted
//!   bit, so nodes serving the same content do not repeat each other.
//!
//! ### Split store operations
//!
//! The code store may report a read or write as
//! [StoreOutcome::Pending]. The fragment is then parked until the store
//! reports completion through [CodeFetcher::on_write_done] or
//! [CodeFetcher::on_read_done]. While anything is parked, incoming
//! fragments for the active job are dropped and send ticks are skipped.

use bytes::Bytes;
use codefetch_api::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::Duration;

mod fetch_queue;
mod sender;

pub use sender::SendJob;

/// Name under which the fetcher's configuration is stored.
pub const MOD_NAME: &str = "CodeFetch";

/// CodeFetcher configuration types.
pub mod config {
    use std::time::Duration;

    /// Configuration parameters for [CodeFetcher](super::CodeFetcher).
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct CodeFetchConfig {
        /// Length of one request backoff slot. Default: 256 ms.
        pub request_backoff_slot_ms: u32,
        /// Backoff is a uniformly chosen number of slots, from 1 up to
        /// this many. Default: 8.
        pub request_max_slot: u32,
        /// Watchdog window layered over the backoff once requests are
        /// going out. Default: 5120 ms.
        pub request_watchdog_ms: u32,
        /// Number of requests sent before a silent source makes the job
        /// fail. Default: 3.
        pub max_retries: u8,
        /// Interval between two fragment transmissions. Default: 512 ms.
        pub send_interval_ms: u32,
        /// Delay before retrying an undelivered completion notification.
        /// Default: 1024 ms.
        pub notify_retry_ms: u32,
        /// Maximum number of jobs, active and queued. Default: 8.
        pub max_jobs: usize,
    }

    impl Default for CodeFetchConfig {
        fn default() -> Self {
            Self {
                request_backoff_slot_ms: 256,
                request_max_slot: 8,
                request_watchdog_ms: 5 * 1024,
                max_retries: 3,
                send_interval_ms: 512,
                notify_retry_ms: 1024,
                max_jobs: 8,
            }
        }
    }

    impl CodeFetchConfig {
        pub(crate) fn watchdog(&self) -> Duration {
            Duration::from_millis(self.request_watchdog_ms as u64)
        }

        pub(crate) fn send_interval(&self) -> Duration {
            Duration::from_millis(self.send_interval_ms as u64)
        }

        pub(crate) fn notify_retry(&self) -> Duration {
            Duration::from_millis(self.notify_retry_ms as u64)
        }
    }

    /// Module-level configuration for CodeFetcher.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CodeFetchModConfig {
        /// CodeFetcher configuration.
        pub code_fetch: CodeFetchConfig,
    }

    impl codefetch_api::config::ModConfig for CodeFetchModConfig {}
}

use config::*;

/// The collaborators a [CodeFetcher] drives.
#[derive(Debug, Clone)]
pub struct FetcherDeps {
    /// Content key resolution and fetch status.
    pub registry: DynRegistry,
    /// Content bytes.
    pub store: DynCodeStore,
    /// Module image relocation.
    pub relocator: DynRelocator,
    /// The radio link.
    pub transport: DynTransport,
    /// Request and transmit timers.
    pub timers: DynTimers,
    /// Completion notifications to requesters.
    pub done_handler: DynFetchDoneHandler,
}

/// A store completion, as reported by a store that answered
/// [StoreOutcome::Pending].
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// The pending write finished.
    WriteDone(FetchResult<()>),
    /// The pending read finished with the bytes read.
    ReadDone(FetchResult<Bytes>),
}

/// A fragment read that has not been transmitted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OutgoingFragment {
    key: ContentKey,
    index: u16,
    dest: NodeAddr,
    handle: StoreHandle,
    kind: ContentKind,
    num_funcs: u16,
}

/// The store operation the fetcher is waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
enum InProgress {
    None,
    AwaitingWrite { key: ContentKey, index: u16 },
    AwaitingRead(OutgoingFragment),
    /// Module header read for the send job of this key.
    AwaitingHeader(ContentKey),
}

/// The code fetcher protocol state of one node.
///
/// All state is owned here and every event handler takes `&mut self`, the
/// fetcher is driven by a single event loop.
#[derive(Debug)]
pub struct CodeFetcher {
    config: CodeFetchConfig,
    deps: FetcherDeps,
    /// Fetch jobs, the front one is active.
    queue: VecDeque<FetchJob>,
    /// Set while the active job is finished but its notification could
    /// not be delivered yet.
    undelivered: Option<FetchOutcome>,
    sender: Option<SendJob>,
    in_progress: InProgress,
    rng: StdRng,
}

impl CodeFetcher {
    /// Construct a new fetcher with no jobs.
    pub fn new(config: CodeFetchConfig, deps: FetcherDeps) -> Self {
        Self {
            config,
            deps,
            queue: VecDeque::new(),
            undelivered: None,
            sender: None,
            in_progress: InProgress::None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a fixed seed for backoff jitter, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// The configuration in use.
    pub fn config(&self) -> &CodeFetchConfig {
        &self.config
    }

    /// The address of this node.
    pub fn local_addr(&self) -> NodeAddr {
        self.deps.transport.local_addr()
    }

    /// The active fetch job, if any.
    pub fn active_job(&self) -> Option<&FetchJob> {
        self.queue.front()
    }

    /// Keys of the jobs waiting behind the active one, in order.
    pub fn queued_keys(&self) -> Vec<ContentKey> {
        self.queue.iter().skip(1).map(|j| j.key()).collect()
    }

    /// The active send job, if any.
    pub fn send_job(&self) -> Option<&SendJob> {
        self.sender.as_ref()
    }

    /// True while a split store operation is outstanding.
    pub fn is_store_busy(&self) -> bool {
        self.in_progress != InProgress::None
    }

    /// Handle a frame heard on the radio, whoever it was addressed to.
    ///
    /// Traffic that cannot be decoded, or that refers to content or jobs
    /// this node does not know about, is dropped silently: on a shared
    /// medium most frames are meant for someone else.
    pub fn recv_message(&mut self, src: NodeAddr, dest: NodeAddr, data: &[u8]) {
        let msg = match FetchMessage::decode(data) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::trace!(%src, ?err, "dropping undecodable message");
                return;
            }
        };
        match msg {
            FetchMessage::Request(req) => {
                if dest == self.local_addr() || dest.is_broadcast() {
                    self.handle_request(src, req);
                } else {
                    self.handle_overheard_request(src, dest, &req);
                }
            }
            FetchMessage::Fragment(frag) => {
                self.suppress_overheard(&frag);
                self.handle_fragment(src, frag);
            }
        }
    }

    /// Handle expiry of one of the fetcher's timers.
    pub fn on_timer(&mut self, id: TimerId) {
        match id {
            TimerId::Request => self.on_request_timer(),
            TimerId::Transmit => self.on_transmit_timer(),
        }
    }

    /// Handle a completion reported by the code store.
    pub fn on_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::WriteDone(r) => self.on_write_done(r),
            StoreEvent::ReadDone(r) => self.on_read_done(r),
        }
    }

    fn backoff(&mut self) -> Duration {
        let slots = self.rng.gen_range(1..=self.config.request_max_slot.max(1));
        Duration::from_millis(
            self.config.request_backoff_slot_ms as u64 * slots as u64,
        )
    }

    fn arm_request_backoff(&mut self) {
        let after = self.backoff();
        if let Err(err) =
            self.deps
                .timers
                .start(TimerId::Request, after, TimerMode::OneShot)
        {
            tracing::warn!(?err, "could not start request timer");
        }
    }

    fn restart_watchdog(&mut self) {
        let after = self.config.watchdog() + self.backoff();
        if let Err(err) = self.deps.timers.restart(TimerId::Request, after) {
            tracing::warn!(?err, "could not restart request watchdog");
        }
    }
}
