//! The in-process broadcast radio provided by codefetch.
//!
//! This is NOT a production module. It is for testing and simulation only.
//! Every frame sent by an attached node is heard by every other attached
//! node, whoever it is addressed to, like a single-hop radio cell.

use bytes::Bytes;
use codefetch_api::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// A frame as heard on the medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioFrame {
    /// Sender address.
    pub src: NodeAddr,
    /// Addressee, possibly [NodeAddr::BROADCAST].
    pub dest: NodeAddr,
    /// Frame payload.
    pub data: Bytes,
}

/// Decides whether a frame is lost on its way to the given listener.
/// Returns true to drop it.
pub type DropFn = Arc<dyn Fn(&RadioFrame, NodeAddr) -> bool + Send + Sync>;

#[derive(Default)]
struct RadioInner {
    listeners: HashMap<NodeAddr, UnboundedSender<RadioFrame>>,
    drop_fn: Option<DropFn>,
    sent: HashMap<NodeAddr, usize>,
}

impl std::fmt::Debug for RadioInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioInner")
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .field("lossy", &self.drop_fn.is_some())
            .field("sent", &self.sent)
            .finish()
    }
}

/// A shared broadcast medium.
#[derive(Debug, Default)]
pub struct MemRadio {
    inner: Mutex<RadioInner>,
}

impl MemRadio {
    /// Construct a new, empty, lossless medium.
    pub fn create() -> Arc<MemRadio> {
        Arc::new(MemRadio::default())
    }

    /// Attach a node at `addr`. Returns its transport and the stream of
    /// frames it hears. Attaching an address twice replaces the earlier
    /// listener.
    pub fn attach(
        self: &Arc<Self>,
        addr: NodeAddr,
    ) -> (DynTransport, UnboundedReceiver<RadioFrame>) {
        let (tx, rx) = unbounded_channel();
        self.inner.lock().unwrap().listeners.insert(addr, tx);
        let port: DynTransport = Arc::new(RadioPort {
            addr,
            radio: self.clone(),
        });
        (port, rx)
    }

    /// Take a node off the medium. It neither hears nor is heard anymore.
    pub fn detach(&self, addr: NodeAddr) {
        self.inner.lock().unwrap().listeners.remove(&addr);
    }

    /// Install a loss model.
    pub fn set_drop_fn(
        &self,
        f: impl Fn(&RadioFrame, NodeAddr) -> bool + Send + Sync + 'static,
    ) {
        self.inner.lock().unwrap().drop_fn = Some(Arc::new(f));
    }

    /// Total number of frames put on the medium.
    pub fn frames_sent(&self) -> usize {
        self.inner.lock().unwrap().sent.values().sum()
    }

    /// Number of frames put on the medium by `addr`.
    pub fn frames_sent_by(&self, addr: NodeAddr) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sent
            .get(&addr)
            .copied()
            .unwrap_or(0)
    }

    fn transmit(&self, frame: RadioFrame) -> FetchResult<()> {
        let mut lock = self.inner.lock().unwrap();
        if !lock.listeners.contains_key(&frame.src) {
            return Err(FetchError::other(format!(
                "node {} is not on the medium",
                frame.src
            )));
        }
        *lock.sent.entry(frame.src).or_default() += 1;
        let drop_fn = lock.drop_fn.clone();
        lock.listeners.retain(|addr, tx| {
            if *addr == frame.src {
                return true;
            }
            if drop_fn.as_ref().is_some_and(|f| f(&frame, *addr)) {
                tracing::trace!(src = %frame.src, to = %addr, "frame lost");
                return true;
            }
            // a closed receiver means the node is gone
            tx.send(frame.clone()).is_ok()
        });
        Ok(())
    }
}

#[derive(Debug)]
struct RadioPort {
    addr: NodeAddr,
    radio: Arc<MemRadio>,
}

impl Transport for RadioPort {
    fn local_addr(&self) -> NodeAddr {
        self.addr
    }

    fn send(&self, dest: NodeAddr, data: Bytes) -> FetchResult<()> {
        self.radio.transmit(RadioFrame {
            src: self.addr,
            dest,
            data,
        })
    }
}
