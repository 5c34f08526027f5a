//! A tokio driver hosting one [CodeFetcher].
//!
//! The fetcher itself is a synchronous state machine. [FetchNode] owns it
//! inside a spawned task that multiplexes local commands, frames heard on
//! the radio, code store completions and timer expiry into it, one event
//! at a time.

use crate::factories::core_fetch::{config::CodeFetchConfig, *};
use crate::factories::RadioFrame;
use codefetch_api::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Shortest period a repeating timer is allowed to have.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct Armed {
    deadline: Instant,
    period: Option<Duration>,
}

/// [Timers] backed by the tokio clock.
///
/// This only keeps deadlines, the node task sleeps until the earliest one
/// and fires it. Pausing the tokio clock in tests makes protocol time
/// free.
#[derive(Debug, Default)]
pub struct TokioTimers {
    armed: Mutex<HashMap<TimerId, Armed>>,
}

impl TokioTimers {
    /// The earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed
            .lock()
            .unwrap()
            .values()
            .map(|a| a.deadline)
            .min()
    }

    /// Take the earliest timer expired at `now`. A repeating timer is
    /// re-armed for its next period, a one-shot timer is disarmed.
    pub fn pop_expired(&self, now: Instant) -> Option<TimerId> {
        let mut lock = self.armed.lock().unwrap();
        let (id, armed) = lock
            .iter()
            .filter(|(_, a)| a.deadline <= now)
            .min_by_key(|(_, a)| a.deadline)
            .map(|(id, a)| (*id, *a))?;
        match armed.period {
            Some(period) => {
                if let Some(a) = lock.get_mut(&id) {
                    a.deadline = now + period;
                }
            }
            None => {
                lock.remove(&id);
            }
        }
        Some(id)
    }
}

impl Timers for TokioTimers {
    fn start(
        &self,
        id: TimerId,
        after: Duration,
        mode: TimerMode,
    ) -> FetchResult<()> {
        let period = match mode {
            TimerMode::OneShot => None,
            TimerMode::Repeat => Some(after.max(MIN_PERIOD)),
        };
        self.armed.lock().unwrap().insert(
            id,
            Armed {
                deadline: Instant::now() + after,
                period,
            },
        );
        Ok(())
    }

    fn restart(&self, id: TimerId, after: Duration) -> FetchResult<()> {
        let mut lock = self.armed.lock().unwrap();
        let period = lock
            .get(&id)
            .and_then(|a| a.period)
            .map(|_| after.max(MIN_PERIOD));
        lock.insert(
            id,
            Armed {
                deadline: Instant::now() + after,
                period,
            },
        );
        Ok(())
    }

    fn stop(&self, id: TimerId) {
        self.armed.lock().unwrap().remove(&id);
    }
}

/// Delivers completion notifications into a bounded channel. A full
/// channel makes the notification undelivered, the fetcher retries it.
#[derive(Debug)]
pub struct ChannelDoneHandler {
    send: mpsc::Sender<FetchDone>,
}

impl ChannelDoneHandler {
    /// Construct a handler and the receiving end for up to `capacity`
    /// unread notifications.
    pub fn create(capacity: usize) -> (Arc<Self>, mpsc::Receiver<FetchDone>) {
        let (send, recv) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { send }), recv)
    }
}

impl FetchDoneHandler for ChannelDoneHandler {
    fn recv_fetch_done(&self, done: FetchDone) -> Result<(), Undelivered> {
        use mpsc::error::TrySendError;
        self.send.try_send(done).map_err(|err| match err {
            TrySendError::Full(done) | TrySendError::Closed(done) => {
                Undelivered(done)
            }
        })
    }
}

/// What a [FetchNode] runs on.
#[derive(Debug)]
pub struct NodeResources {
    /// Content registry.
    pub registry: DynRegistry,
    /// Code store.
    pub store: DynCodeStore,
    /// Relocator for module images.
    pub relocator: DynRelocator,
    /// Radio link, as returned by `MemRadio::attach`.
    pub transport: DynTransport,
    /// Frames heard on the radio.
    pub frames: mpsc::UnboundedReceiver<RadioFrame>,
    /// Completions of a split code store, if the store is one.
    pub store_events: Option<mpsc::UnboundedReceiver<StoreEvent>>,
}

/// The state of a node's fetcher at one point in time.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// The active fetch job.
    pub active: Option<FetchJob>,
    /// Keys queued behind it.
    pub queued: Vec<ContentKey>,
    /// The active send job.
    pub sending: Option<SendJob>,
    /// Whether a split store operation is outstanding.
    pub store_busy: bool,
}

enum Cmd {
    Request {
        requester: RequesterId,
        key: ContentKey,
        size: u32,
        source: NodeAddr,
        reply: oneshot::Sender<FetchResult<()>>,
    },
    Cancel {
        requester: RequesterId,
        key: ContentKey,
        reply: oneshot::Sender<FetchResult<()>>,
    },
    Restart {
        job: FetchJob,
        source: NodeAddr,
        reply: oneshot::Sender<FetchResult<()>>,
    },
    Commit {
        job: FetchJob,
        success: bool,
        reply: oneshot::Sender<FetchResult<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<NodeSnapshot>,
    },
}

/// A running code fetcher.
///
/// Dropping the node stops its task.
#[derive(Debug)]
pub struct FetchNode {
    addr: NodeAddr,
    cmd_send: mpsc::UnboundedSender<Cmd>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for FetchNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FetchNode {
    /// Spawn a node. Completion notifications for local requesters arrive
    /// on the returned receiver, at most `done_capacity` of them are
    /// buffered.
    pub fn spawn(
        config: CodeFetchConfig,
        res: NodeResources,
        done_capacity: usize,
    ) -> (Self, mpsc::Receiver<FetchDone>) {
        let addr = res.transport.local_addr();
        let timers = Arc::new(TokioTimers::default());
        let (done_handler, done_recv) =
            ChannelDoneHandler::create(done_capacity);
        let fetcher = CodeFetcher::new(
            config,
            FetcherDeps {
                registry: res.registry,
                store: res.store,
                relocator: res.relocator,
                transport: res.transport,
                timers: timers.clone(),
                done_handler,
            },
        )
        .with_seed(*addr as u64);

        let (cmd_send, cmd_recv) = mpsc::unbounded_channel();
        let task = tokio::task::spawn(node_task(
            fetcher,
            timers,
            cmd_recv,
            res.frames,
            res.store_events,
        ));

        tracing::debug!(%addr, "fetch node started");
        (
            Self {
                addr,
                cmd_send,
                task,
            },
            done_recv,
        )
    }

    /// The node's radio address.
    pub fn addr(&self) -> NodeAddr {
        self.addr
    }

    /// See [CodeFetcher::request].
    pub async fn request(
        &self,
        requester: RequesterId,
        key: ContentKey,
        size: u32,
        source: NodeAddr,
    ) -> FetchResult<()> {
        let (reply, r) = oneshot::channel();
        self.send(Cmd::Request {
            requester,
            key,
            size,
            source,
            reply,
        })?;
        r.await.map_err(stopped)?
    }

    /// See [CodeFetcher::cancel].
    pub async fn cancel(
        &self,
        requester: RequesterId,
        key: ContentKey,
    ) -> FetchResult<()> {
        let (reply, r) = oneshot::channel();
        self.send(Cmd::Cancel {
            requester,
            key,
            reply,
        })?;
        r.await.map_err(stopped)?
    }

    /// See [CodeFetcher::restart].
    pub async fn restart(
        &self,
        job: FetchJob,
        source: NodeAddr,
    ) -> FetchResult<()> {
        let (reply, r) = oneshot::channel();
        self.send(Cmd::Restart { job, source, reply })?;
        r.await.map_err(stopped)?
    }

    /// See [CodeFetcher::commit].
    pub async fn commit(&self, job: FetchJob, success: bool) -> FetchResult<()> {
        let (reply, r) = oneshot::channel();
        self.send(Cmd::Commit {
            job,
            success,
            reply,
        })?;
        r.await.map_err(stopped)?
    }

    /// Current fetcher state.
    pub async fn snapshot(&self) -> FetchResult<NodeSnapshot> {
        let (reply, r) = oneshot::channel();
        self.send(Cmd::Snapshot { reply })?;
        r.await.map_err(stopped)
    }

    fn send(&self, cmd: Cmd) -> FetchResult<()> {
        self.cmd_send.send(cmd).map_err(stopped)
    }
}

fn stopped<E>(_: E) -> FetchError {
    FetchError::other("fetch node stopped")
}

async fn next_store_event(
    events: &mut Option<mpsc::UnboundedReceiver<StoreEvent>>,
) -> StoreEvent {
    if let Some(rx) = events.as_mut() {
        if let Some(event) = rx.recv().await {
            return event;
        }
        *events = None;
    }
    std::future::pending().await
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn node_task(
    mut fetcher: CodeFetcher,
    timers: Arc<TokioTimers>,
    mut cmd_recv: mpsc::UnboundedReceiver<Cmd>,
    mut frames: mpsc::UnboundedReceiver<RadioFrame>,
    mut store_events: Option<mpsc::UnboundedReceiver<StoreEvent>>,
) {
    loop {
        tokio::select! {
            cmd = cmd_recv.recv() => match cmd {
                Some(cmd) => handle_cmd(&mut fetcher, cmd),
                None => break,
            },
            frame = frames.recv() => match frame {
                Some(f) => fetcher.recv_message(f.src, f.dest, &f.data),
                None => break,
            },
            event = next_store_event(&mut store_events) => {
                fetcher.on_store_event(event);
            }
            _ = sleep_until(timers.next_deadline()) => {
                let now = Instant::now();
                while let Some(id) = timers.pop_expired(now) {
                    fetcher.on_timer(id);
                }
            }
        }
    }
    tracing::debug!(addr = %fetcher.local_addr(), "fetch node stopped");
}

fn handle_cmd(fetcher: &mut CodeFetcher, cmd: Cmd) {
    // a requester that stopped waiting for the reply is not an error
    match cmd {
        Cmd::Request {
            requester,
            key,
            size,
            source,
            reply,
        } => {
            let _ = reply.send(fetcher.request(requester, key, size, source));
        }
        Cmd::Cancel {
            requester,
            key,
            reply,
        } => {
            let _ = reply.send(fetcher.cancel(requester, key));
        }
        Cmd::Restart { job, source, reply } => {
            fetcher.restart(job, source);
            let _ = reply.send(Ok(()));
        }
        Cmd::Commit {
            job,
            success,
            reply,
        } => {
            let _ = reply.send(fetcher.commit(&job, success));
        }
        Cmd::Snapshot { reply } => {
            let _ = reply.send(NodeSnapshot {
                active: fetcher.active_job().cloned(),
                queued: fetcher.queued_keys(),
                sending: fetcher.send_job().cloned(),
                store_busy: fetcher.is_store_busy(),
            });
        }
    }
}
