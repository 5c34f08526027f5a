//! Fetch job types and the completion notification handed to requesters.

use crate::*;
use std::sync::Arc;

/// Where an active fetch job stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Waiting out the randomized backoff before the first request.
    Requesting,
    /// At least one request went out, the watchdog is armed.
    Receiving,
}

/// A request to fetch one content object from one source node.
///
/// The job is owned by the fetcher while queued or active, and handed to
/// the requester inside [FetchDone] when it finishes. The requester may
/// give it back through `CodeFetcher::restart` to resume from the
/// accumulated bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchJob {
    requester: RequesterId,
    source: NodeAddr,
    size: u32,
    bitmap: Bitmap,
    retry_count: u8,
    num_funcs: Option<u16>,
    phase: JobPhase,
}

impl FetchJob {
    /// Construct a job with every fragment outstanding.
    pub fn new(
        requester: RequesterId,
        key: ContentKey,
        size: u32,
        source: NodeAddr,
    ) -> FetchResult<Self> {
        Ok(Self {
            requester,
            source,
            size,
            bitmap: Bitmap::new(key, size)?,
            retry_count: 0,
            num_funcs: None,
            phase: JobPhase::Requesting,
        })
    }

    /// The content key.
    pub fn key(&self) -> ContentKey {
        self.bitmap.key()
    }

    /// Who asked for this fetch.
    pub fn requester(&self) -> RequesterId {
        self.requester
    }

    /// The node requests are addressed to.
    pub fn source(&self) -> NodeAddr {
        self.source
    }

    /// Total content size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Outstanding fragments.
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Request timeouts since the last sign of progress.
    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Function count of a relocatable module, known once fragment 0
    /// has been applied.
    pub fn num_funcs(&self) -> Option<u16> {
        self.num_funcs
    }

    /// Current phase.
    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// True when every fragment has been received.
    pub fn is_success(&self) -> bool {
        self.bitmap.is_complete()
    }

    /// Number of content bytes carried by fragment `index`. The final
    /// fragment may be short.
    pub fn fragment_len(&self, index: u16) -> usize {
        let offset = index as usize * FRAGMENT_SIZE;
        (self.size as usize).saturating_sub(offset).min(FRAGMENT_SIZE)
    }

    /// Mark fragment `index` as received. Returns whether it was
    /// outstanding.
    pub fn clear_fragment(&mut self, index: u16) -> bool {
        self.bitmap.clear(index)
    }

    /// Count one more request timeout, returning the new count.
    pub fn bump_retry(&mut self) -> u8 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// Forget past timeouts, traffic for this job was seen.
    pub fn reset_retry(&mut self) {
        self.retry_count = 0;
    }

    /// Record the function count read from fragment 0.
    pub fn set_num_funcs(&mut self, num_funcs: u16) {
        self.num_funcs = Some(num_funcs);
    }

    /// Re-target the job at a new source for re-admission.
    pub fn reset_for_restart(&mut self, source: NodeAddr) {
        self.source = source;
        self.retry_count = 0;
        self.phase = JobPhase::Requesting;
    }

    /// Move to the given phase.
    pub fn set_phase(&mut self, phase: JobPhase) {
        self.phase = phase;
    }
}

/// How a fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Every fragment was received and the content committed.
    Complete,
    /// The source stayed silent through every retry.
    RetryBoundExceeded,
    /// The registry or code store failed while applying a fragment.
    StoreFailure,
}

/// Notification delivered to the requester when a job leaves the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchDone {
    /// The finished job, ownership passes to the requester.
    pub job: FetchJob,
    /// How it ended.
    pub outcome: FetchOutcome,
}

/// A [FetchDone] that could not be delivered and is handed back.
#[derive(Debug, thiserror::Error)]
#[error("could not deliver fetch done for key {}", .0.job.key())]
pub struct Undelivered(pub FetchDone);

/// Receives completion notifications on behalf of local requesters.
#[cfg_attr(any(test, feature = "mockall"), mockall::automock)]
pub trait FetchDoneHandler: 'static + Send + Sync + std::fmt::Debug {
    /// Deliver `done` to its requester.
    ///
    /// When the requester cannot take it right now (e.g. no buffer for the
    /// notification) the notification is returned and the fetcher retries
    /// a little later.
    fn recv_fetch_done(&self, done: FetchDone) -> Result<(), Undelivered>;
}

/// Trait-object [FetchDoneHandler].
pub type DynFetchDoneHandler = Arc<dyn FetchDoneHandler>;
