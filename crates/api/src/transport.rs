//! The messaging and timer substrate the fetcher runs on.

use crate::*;
use std::sync::Arc;
use std::time::Duration;

/// Single-hop radio link.
///
/// Sending is fire-and-forget. An `Ok(())` only means the frame was
/// handed to the link layer, the medium is lossy and there are no
/// acknowledgements. Every node in range hears every frame, whatever its
/// destination; receivers are handed frames through
/// `CodeFetcher::recv_message` together with the source and destination
/// addresses.
#[cfg_attr(any(test, feature = "mockall"), mockall::automock)]
pub trait Transport: 'static + Send + Sync + std::fmt::Debug {
    /// The address of this node.
    fn local_addr(&self) -> NodeAddr;

    /// Transmit an encoded message to `dest`.
    ///
    /// Fails if the link layer has no buffer for the frame.
    fn send(&self, dest: NodeAddr, data: bytes::Bytes) -> FetchResult<()>;
}

/// Trait-object [Transport].
pub type DynTransport = Arc<dyn Transport>;

/// The timers a code fetcher owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// One-shot timer for request backoff, the receive watchdog and the
    /// completion notification retry.
    Request,
    /// Periodic timer pacing fragment transmission.
    Transmit,
}

/// Whether a timer fires once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerMode {
    /// Fire once, then stop.
    OneShot,
    /// Fire every period until stopped.
    Repeat,
}

/// Timer service. Expiry is delivered through `CodeFetcher::on_timer`.
#[cfg_attr(any(test, feature = "mockall"), mockall::automock)]
pub trait Timers: 'static + Send + Sync + std::fmt::Debug {
    /// Start (or re-start) timer `id`, firing after `after`.
    fn start(
        &self,
        id: TimerId,
        after: Duration,
        mode: TimerMode,
    ) -> FetchResult<()>;

    /// Re-arm a running timer with a new delay, keeping its mode.
    /// A timer that is not running is started as one-shot.
    fn restart(&self, id: TimerId, after: Duration) -> FetchResult<()>;

    /// Stop timer `id`. Stopping a stopped timer is a no-op.
    fn stop(&self, id: TimerId);
}

/// Trait-object [Timers].
pub type DynTimers = Arc<dyn Timers>;
