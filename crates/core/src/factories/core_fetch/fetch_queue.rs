//! Receive path: the fetch job queue, request timer and fragment
//! application.

use super::*;

impl CodeFetcher {
    /// Ask for `size` bytes of content `key` to be fetched from `source`.
    ///
    /// The job starts right away if no other job is active, otherwise it
    /// queues behind the others. `requester` is notified through the
    /// [FetchDoneHandler] when the job finishes either way.
    pub fn request(
        &mut self,
        requester: RequesterId,
        key: ContentKey,
        size: u32,
        source: NodeAddr,
    ) -> FetchResult<()> {
        if self.deps.registry.lookup(key).is_none() {
            return Err(FetchError::UnknownKey(key));
        }
        if self.queue.len() >= self.config.max_jobs {
            return Err(FetchError::OutOfMemory);
        }
        let job = FetchJob::new(requester, key, size, source)?;
        tracing::debug!(%key, %requester, size, %source, "fetch requested");
        self.admit(job);
        Ok(())
    }

    /// Cancel the job for `key` requested by `requester`.
    ///
    /// Canceling the active job discards what was stored so far, starts
    /// the next queued job, and stops serving `key` to others. A job that
    /// already finished but whose notification is still pending is only
    /// dropped: its content and registry status are left as they are.
    pub fn cancel(
        &mut self,
        requester: RequesterId,
        key: ContentKey,
    ) -> FetchResult<()> {
        let pos = self
            .queue
            .iter()
            .position(|j| j.key() == key && j.requester() == requester)
            .ok_or(FetchError::NotFound(key))?;

        if pos > 0 {
            self.queue.remove(pos);
            tracing::debug!(%key, %requester, "queued fetch canceled");
            return Ok(());
        }

        self.queue.pop_front();
        self.deps.timers.stop(TimerId::Request);
        if let Some(outcome) = self.undelivered.take() {
            tracing::debug!(%key, %requester, ?outcome, "finished fetch canceled, notification dropped");
            self.start_next();
            return Ok(());
        }
        tracing::debug!(%key, %requester, "active fetch canceled");
        if matches!(self.in_progress, InProgress::AwaitingWrite { .. }) {
            self.in_progress = InProgress::None;
        }
        if let Some(entry) = self.deps.registry.lookup(key) {
            if let Err(err) = self.deps.store.discard(entry.handle) {
                tracing::warn!(%key, ?err, "could not discard canceled fetch");
            }
        }
        if self.sender.as_ref().is_some_and(|s| s.key() == key) {
            self.teardown_sender();
        }
        self.start_next();
        Ok(())
    }

    /// Re-admit a finished job, typically after a failure, fetching what
    /// is still missing from `source`. A job with nothing missing
    /// completes as soon as it becomes active.
    pub fn restart(&mut self, mut job: FetchJob, source: NodeAddr) {
        tracing::debug!(key = %job.key(), %source, missing = job.bitmap().count_set(), "fetch restarted");
        job.reset_for_restart(source);
        self.admit(job);
    }

    /// Make a job's content durable, or throw it away.
    pub fn commit(&self, job: &FetchJob, success: bool) -> FetchResult<()> {
        let Some(entry) = self.deps.registry.lookup(job.key()) else {
            return Ok(());
        };
        if success {
            self.deps.store.flush(entry.handle)
        } else {
            self.deps.store.discard(entry.handle)
        }
    }

    fn admit(&mut self, job: FetchJob) {
        let key = job.key();
        self.queue.push_back(job);
        if self.queue.len() == 1 {
            self.activate_head();
        } else {
            self.deps.registry.set_status(key, FetchStatus::Queued);
        }
    }

    fn start_next(&mut self) {
        if let Some(job) = self.queue.front() {
            tracing::debug!(key = %job.key(), "starting next queued fetch");
        }
        self.activate_head();
    }

    fn activate_head(&mut self) {
        let Some((key, complete)) =
            self.queue.front().map(|j| (j.key(), j.is_success()))
        else {
            return;
        };
        if complete {
            tracing::debug!(%key, "nothing left to fetch");
            self.finish(FetchOutcome::Complete);
            return;
        }
        self.deps.registry.set_status(key, FetchStatus::Fetching);
        self.arm_request_backoff();
    }

    pub(super) fn on_request_timer(&mut self) {
        if let Some(outcome) = self.undelivered {
            self.finish(outcome);
            return;
        }
        let max_retries = self.config.max_retries;
        let Some(job) = self.queue.front_mut() else {
            return;
        };

        let retries = job.bump_retry();
        if retries > max_retries {
            tracing::debug!(key = %job.key(), source = %job.source(), "request failed, source silent");
            self.finish(FetchOutcome::RetryBoundExceeded);
            return;
        }

        job.set_phase(JobPhase::Receiving);
        let source = job.source();
        tracing::debug!(%source, retries, bitmap = %job.bitmap(), "sending request");
        let data = FetchMessage::from(RequestMsg {
            bitmap: job.bitmap().clone(),
        })
        .encode();
        if let Err(err) = self.deps.transport.send(source, data) {
            // The watchdog is re-armed below, the next timeout retries.
            tracing::warn!(%source, ?err, "could not send request");
        }
        self.restart_watchdog();
    }

    pub(super) fn handle_overheard_request(
        &mut self,
        src: NodeAddr,
        dest: NodeAddr,
        req: &RequestMsg,
    ) {
        if self.undelivered.is_some() {
            return;
        }
        let Some(job) = self.queue.front() else {
            return;
        };
        if job.key() != req.bitmap.key() || job.source() != dest {
            return;
        }
        // Someone else is asking our source for the same content, its
        // fragments will reach us too. Hold back our own request. The retry
        // count is kept, a dead source still fails the job once the others
        // stop asking.
        tracing::trace!(%src, %dest, key = %job.key(), "overheard request for active fetch");
        self.restart_watchdog();
    }

    pub(super) fn handle_fragment(&mut self, src: NodeAddr, frag: FragmentMsg) {
        if self.undelivered.is_some() {
            return;
        }
        let Some(job) = self.queue.front_mut() else {
            tracing::trace!(%src, key = %frag.key, "no active fetch, ignoring fragment");
            return;
        };
        if job.key() != frag.key {
            tracing::trace!(%src, key = %frag.key, "fragment for another key");
            return;
        }

        job.reset_retry();
        job.set_phase(JobPhase::Receiving);
        self.restart_watchdog();

        if self.in_progress != InProgress::None {
            tracing::trace!(index = frag.index, "store busy, dropping fragment");
            return;
        }

        let Some(entry) = self.deps.registry.lookup(frag.key) else {
            tracing::warn!(key = %frag.key, "registry entry gone during fetch");
            self.finish(FetchOutcome::StoreFailure);
            return;
        };

        let Some(job) = self.queue.front_mut() else {
            return;
        };
        if !job.bitmap().is_set(frag.index) {
            tracing::trace!(index = frag.index, "already have fragment");
            return;
        }

        let relocatable = entry.kind == ContentKind::RelocatableCode;
        if relocatable {
            if frag.index == 0 {
                match self.deps.relocator.function_count(&frag.payload) {
                    Some(n) => job.set_num_funcs(n),
                    None => {
                        tracing::warn!(key = %frag.key, "malformed module header");
                        return;
                    }
                }
            } else if job.bitmap().is_set(0) {
                // the function count comes with fragment 0
                tracing::trace!(index = frag.index, "waiting for fragment 0");
                return;
            }
        }

        let len = job.fragment_len(frag.index);
        let offset = frag.offset();
        let mut payload = frag.payload;
        if relocatable {
            let base = self.deps.store.header_base_address(entry.handle);
            self.deps.relocator.patch_in(
                base,
                job.num_funcs().unwrap_or(0),
                &mut payload[..len],
                offset,
            );
        }

        match self.deps.store.write(entry.handle, offset, &payload[..len]) {
            Ok(StoreOutcome::Ready(())) => {
                self.fragment_stored(frag.key, frag.index)
            }
            Ok(StoreOutcome::Pending) => {
                tracing::trace!(index = frag.index, "write split, parking fragment");
                self.in_progress = InProgress::AwaitingWrite {
                    key: frag.key,
                    index: frag.index,
                };
            }
            Err(err) => {
                tracing::warn!(key = %frag.key, index = frag.index, ?err, "could not store fragment");
                self.finish(FetchOutcome::StoreFailure);
            }
        }
    }

    /// Complete a split write.
    pub fn on_write_done(&mut self, result: FetchResult<()>) {
        let (key, index) = match self.in_progress {
            InProgress::AwaitingWrite { key, index } => (key, index),
            _ => {
                tracing::trace!("ignoring write completion, no write pending");
                return;
            }
        };
        self.in_progress = InProgress::None;
        match result {
            Ok(()) => self.fragment_stored(key, index),
            Err(err) => {
                if self.queue.front().is_some_and(|j| j.key() == key) {
                    tracing::warn!(%key, index, ?err, "split write failed");
                    self.finish(FetchOutcome::StoreFailure);
                }
            }
        }
    }

    fn fragment_stored(&mut self, key: ContentKey, index: u16) {
        let Some(job) = self.queue.front_mut() else {
            return;
        };
        if job.key() != key {
            return;
        }
        job.clear_fragment(index);
        tracing::trace!(%key, index, remaining = job.bitmap().count_set(), "fragment stored");
        if job.is_success() {
            tracing::debug!(%key, "all fragments received");
            self.finish(FetchOutcome::Complete);
        }
    }

    /// Finish the active job with `outcome`, notify its requester and
    /// start the next job. If the notification cannot be delivered, the
    /// job stays at the head of the queue and delivery is retried on the
    /// request timer.
    fn finish(&mut self, mut outcome: FetchOutcome) {
        let Some(job) = self.queue.pop_front() else {
            self.undelivered = None;
            return;
        };
        let key = job.key();

        if self.undelivered.is_none() {
            self.deps.timers.stop(TimerId::Request);
            if outcome == FetchOutcome::Complete {
                if let Err(err) = self.commit(&job, true) {
                    tracing::warn!(%key, ?err, "could not commit fetched content");
                    outcome = FetchOutcome::StoreFailure;
                }
            }
            let status = match outcome {
                FetchOutcome::Complete => FetchStatus::Done,
                _ => FetchStatus::Failed,
            };
            self.deps.registry.set_status(key, status);
        }

        match self.deps.done_handler.recv_fetch_done(FetchDone { job, outcome })
        {
            Ok(()) => {
                tracing::debug!(%key, ?outcome, "fetch done");
                self.undelivered = None;
                self.start_next();
            }
            Err(Undelivered(done)) => {
                tracing::warn!(%key, "could not deliver fetch done, will retry");
                self.queue.push_front(done.job);
                self.undelivered = Some(outcome);
                if let Err(err) = self.deps.timers.start(
                    TimerId::Request,
                    self.config.notify_retry(),
                    TimerMode::OneShot,
                ) {
                    tracing::warn!(?err, "could not start notification retry timer");
                }
            }
        }
    }
}
