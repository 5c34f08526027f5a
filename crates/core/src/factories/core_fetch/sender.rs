//! Send path: serving requested fragments and overhearing suppression.

use super::*;

/// The fragments this node is serving for one content key.
///
/// A node serves at most one key at a time. Requests for other keys are
/// ignored until the send job drains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendJob {
    key: ContentKey,
    dest: NodeAddr,
    wanted: Bitmap,
    /// Needed to patch out module fragments. Zero for raw content, `None`
    /// until the module header has been read.
    num_funcs: Option<u16>,
}

impl SendJob {
    /// The content key being served.
    pub fn key(&self) -> ContentKey {
        self.key
    }

    /// The node that first asked. Fragments are addressed to it, every
    /// other node in range overhears them.
    pub fn dest(&self) -> NodeAddr {
        self.dest
    }

    /// Fragments still to be sent.
    pub fn wanted(&self) -> &Bitmap {
        &self.wanted
    }
}

impl CodeFetcher {
    pub(super) fn handle_request(&mut self, src: NodeAddr, req: RequestMsg) {
        let key = req.bitmap.key();
        let Some(entry) = self.deps.registry.lookup(key) else {
            tracing::trace!(%src, %key, "request for unknown content");
            return;
        };

        // Never promise fragments we are still fetching ourselves. Content
        // that is neither done nor being fetched here, such as a failed or
        // canceled fetch, holds nothing we can vouch for.
        let own_job = self.queue.iter().find(|j| j.key() == key);
        let mut offered = req.bitmap;
        match (entry.status, own_job) {
            (_, Some(job)) => offered.subtract(job.bitmap()),
            (FetchStatus::Done, None) => (),
            (status, None) => {
                tracing::trace!(%src, %key, ?status, "content not held, ignoring request");
                return;
            }
        }

        if let Some(sender) = self.sender.as_mut() {
            if sender.key == key {
                sender.wanted.merge(&offered);
                tracing::debug!(%src, %key, wanted = %sender.wanted, "merged request");
            } else {
                tracing::trace!(%src, %key, serving = %sender.key, "sender busy, ignoring request");
            }
            return;
        }

        if offered.is_complete() {
            tracing::trace!(%src, %key, "nothing to offer");
            return;
        }

        let num_funcs = match (entry.kind, own_job) {
            (ContentKind::Raw, _) => Some(0),
            (ContentKind::RelocatableCode, None) => None,
            (ContentKind::RelocatableCode, Some(job)) => match job.num_funcs() {
                Some(n) => Some(n),
                None => {
                    // our copy has no header yet
                    tracing::trace!(%src, %key, "function count unknown, cannot serve");
                    return;
                }
            },
        };

        if let Err(err) = self.deps.timers.start(
            TimerId::Transmit,
            self.config.send_interval(),
            TimerMode::Repeat,
        ) {
            tracing::warn!(%key, ?err, "could not start transmit timer");
            return;
        }

        tracing::debug!(%src, %key, wanted = %offered, "serving request");
        self.sender = Some(SendJob {
            key,
            dest: src,
            wanted: offered,
            num_funcs,
        });
    }

    pub(super) fn suppress_overheard(&mut self, frag: &FragmentMsg) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        if sender.key == frag.key && sender.wanted.clear(frag.index) {
            tracing::trace!(key = %frag.key, index = frag.index, "suppressed");
        }
    }

    pub(super) fn on_transmit_timer(&mut self) {
        let Some(sender) = self.sender.as_ref() else {
            self.deps.timers.stop(TimerId::Transmit);
            return;
        };
        let key = sender.key;
        let needs_header = sender.num_funcs.is_none();
        let Some(entry) = self.deps.registry.lookup(key) else {
            tracing::debug!(%key, "content gone, stop serving");
            self.teardown_sender();
            return;
        };
        if self.in_progress != InProgress::None {
            return;
        }

        if needs_header {
            let len = self.deps.relocator.header_len();
            match self.deps.store.read(entry.handle, 0, len) {
                Ok(StoreOutcome::Ready(header)) => {
                    if !self.header_read(key, &header) {
                        return;
                    }
                }
                Ok(StoreOutcome::Pending) => {
                    tracing::trace!(%key, "header read split, parking");
                    self.in_progress = InProgress::AwaitingHeader(key);
                    return;
                }
                Err(err) => {
                    tracing::debug!(%key, ?err, "could not read module header, stop serving");
                    self.teardown_sender();
                    return;
                }
            }
        }

        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        let Some(index) = sender.wanted.first_set() else {
            self.teardown_sender();
            return;
        };
        sender.wanted.clear(index);

        let out = OutgoingFragment {
            key,
            index,
            dest: sender.dest,
            handle: entry.handle,
            kind: entry.kind,
            num_funcs: sender.num_funcs.unwrap_or(0),
        };
        let offset = index as u32 * FRAGMENT_SIZE as u32;
        match self.deps.store.read(out.handle, offset, FRAGMENT_SIZE) {
            Ok(StoreOutcome::Ready(data)) => self.transmit(out, &data),
            Ok(StoreOutcome::Pending) => {
                tracing::trace!(index, "read split, parking fragment");
                self.in_progress = InProgress::AwaitingRead(out);
                return;
            }
            Err(err) => {
                tracing::debug!(%key, index, ?err, "could not read fragment, stop serving");
                self.teardown_sender();
                return;
            }
        }
        self.teardown_if_drained();
    }

    /// Record the function count from a module header read for the send
    /// job of `key`. Returns whether serving can go on.
    fn header_read(&mut self, key: ContentKey, header: &[u8]) -> bool {
        let count = self.deps.relocator.function_count(header);
        let Some(sender) = self.sender.as_mut().filter(|s| s.key == key) else {
            return false;
        };
        match count {
            Some(n) => {
                sender.num_funcs = Some(n);
                true
            }
            None => {
                tracing::warn!(%key, "malformed module header, stop serving");
                self.teardown_sender();
                false
            }
        }
    }

    /// Complete a split read.
    pub fn on_read_done(&mut self, result: FetchResult<Bytes>) {
        let key = match self.in_progress {
            InProgress::AwaitingRead(out) => out.key,
            InProgress::AwaitingHeader(key) => key,
            _ => {
                tracing::trace!("ignoring read completion, no read pending");
                return;
            }
        };
        let waiting =
            std::mem::replace(&mut self.in_progress, InProgress::None);
        let data = match result {
            Ok(data) => data,
            Err(err) => {
                tracing::debug!(%key, ?err, "split read failed, stop serving");
                if self.sender.as_ref().is_some_and(|s| s.key == key) {
                    self.teardown_sender();
                }
                return;
            }
        };
        match waiting {
            InProgress::AwaitingRead(out) => {
                self.transmit(out, &data);
                self.teardown_if_drained();
            }
            InProgress::AwaitingHeader(key) => {
                // the first fragment goes out on the next tick
                self.header_read(key, &data);
            }
            InProgress::None | InProgress::AwaitingWrite { .. } => (),
        }
    }

    fn transmit(&self, out: OutgoingFragment, data: &[u8]) {
        let mut payload = [0; FRAGMENT_SIZE];
        let n = data.len().min(FRAGMENT_SIZE);
        payload[..n].copy_from_slice(&data[..n]);

        let mut frag = FragmentMsg {
            key: out.key,
            index: out.index,
            payload,
        };
        if out.kind == ContentKind::RelocatableCode {
            let base = self.deps.store.header_base_address(out.handle);
            let offset = frag.offset();
            self.deps.relocator.patch_out(
                base,
                out.num_funcs,
                &mut frag.payload,
                offset,
            );
        }

        tracing::trace!(key = %out.key, index = out.index, dest = %out.dest, "sending fragment");
        if let Err(err) = self
            .deps
            .transport
            .send(out.dest, FetchMessage::from(frag).encode())
        {
            tracing::warn!(key = %out.key, index = out.index, ?err, "could not send fragment");
        }
    }

    fn teardown_if_drained(&mut self) {
        if self.sender.as_ref().is_some_and(|s| s.wanted.is_complete()) {
            self.teardown_sender();
        }
    }

    pub(super) fn teardown_sender(&mut self) {
        if let Some(sender) = self.sender.take() {
            tracing::debug!(key = %sender.key, "send job torn down");
        }
        self.deps.timers.stop(TimerId::Transmit);
        if matches!(
            self.in_progress,
            InProgress::AwaitingRead(_) | InProgress::AwaitingHeader(_)
        ) {
            self.in_progress = InProgress::None;
        }
    }
}
