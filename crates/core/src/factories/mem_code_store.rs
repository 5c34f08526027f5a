//! The in-memory code store provided by codefetch.

use crate::factories::core_fetch::StoreEvent;
use bytes::Bytes;
use codefetch_api::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug)]
struct StoredObject {
    data: Vec<u8>,
    base: CodeAddr,
    flushed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<StoreHandle, StoredObject>,
    next_handle: u16,
    failing: bool,
}

/// An in-memory [CodeStore].
///
/// Created with [MemCodeStore::create_split], every read and write
/// answers [StoreOutcome::Pending] and reports its completion as a
/// [StoreEvent] on the given channel, the way a store on external flash
/// would.
///
/// This is NOT a production module. It backs the node driver and tests.
#[derive(Debug)]
pub struct MemCodeStore {
    inner: Mutex<Inner>,
    split: Option<UnboundedSender<StoreEvent>>,
}

impl MemCodeStore {
    /// Construct a store that completes every operation immediately.
    pub fn create() -> Arc<MemCodeStore> {
        Arc::new(MemCodeStore {
            inner: Mutex::new(Inner::default()),
            split: None,
        })
    }

    /// Construct a store that completes every read and write through
    /// `events`.
    pub fn create_split(
        events: UnboundedSender<StoreEvent>,
    ) -> Arc<MemCodeStore> {
        Arc::new(MemCodeStore {
            inner: Mutex::new(Inner::default()),
            split: Some(events),
        })
    }

    /// Allocate a zeroed object of `size` bytes, resident at `base`.
    pub fn alloc(&self, size: u32, base: CodeAddr) -> StoreHandle {
        self.add(vec![0; size as usize], base, false)
    }

    /// Add an object holding `data`, resident at `base`.
    pub fn insert(&self, data: Vec<u8>, base: CodeAddr) -> StoreHandle {
        self.add(data, base, true)
    }

    fn add(&self, data: Vec<u8>, base: CodeAddr, flushed: bool) -> StoreHandle {
        let mut lock = self.inner.lock().unwrap();
        let handle = StoreHandle(lock.next_handle);
        lock.next_handle = lock.next_handle.wrapping_add(1);
        lock.objects.insert(
            handle,
            StoredObject {
                data,
                base,
                flushed,
            },
        );
        handle
    }

    /// A copy of the bytes of an object.
    pub fn contents(&self, handle: StoreHandle) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&handle)
            .map(|o| o.data.clone())
    }

    /// Whether an object was flushed since it was last written.
    pub fn is_flushed(&self, handle: StoreHandle) -> bool {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&handle)
            .is_some_and(|o| o.flushed)
    }

    /// Make every subsequent operation fail, or stop doing so.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap().failing = failing;
    }

    fn do_read(
        &self,
        handle: StoreHandle,
        offset: u32,
        len: usize,
    ) -> FetchResult<Bytes> {
        let lock = self.inner.lock().unwrap();
        if lock.failing {
            return Err(FetchError::store("read failed"));
        }
        let obj = lock
            .objects
            .get(&handle)
            .ok_or_else(|| FetchError::store(format!("no object {handle}")))?;
        let mut out = vec![0; len];
        let start = (offset as usize).min(obj.data.len());
        let end = (offset as usize + len).min(obj.data.len());
        out[..end - start].copy_from_slice(&obj.data[start..end]);
        Ok(out.into())
    }

    fn do_write(
        &self,
        handle: StoreHandle,
        offset: u32,
        data: &[u8],
    ) -> FetchResult<()> {
        let mut lock = self.inner.lock().unwrap();
        if lock.failing {
            return Err(FetchError::store("write failed"));
        }
        let obj = lock
            .objects
            .get_mut(&handle)
            .ok_or_else(|| FetchError::store(format!("no object {handle}")))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > obj.data.len() {
            return Err(FetchError::store(format!(
                "write of {} bytes at {offset} past end of object {handle}",
                data.len(),
            )));
        }
        obj.data[start..end].copy_from_slice(data);
        obj.flushed = false;
        Ok(())
    }

    fn complete(&self, event: StoreEvent) -> FetchResult<()> {
        match &self.split {
            Some(events) => events
                .send(event)
                .map_err(|_| FetchError::store("store event channel closed")),
            None => Ok(()),
        }
    }
}

impl CodeStore for MemCodeStore {
    fn read(
        &self,
        handle: StoreHandle,
        offset: u32,
        len: usize,
    ) -> FetchResult<StoreOutcome<Bytes>> {
        let res = self.do_read(handle, offset, len);
        if self.split.is_none() {
            return res.map(StoreOutcome::Ready);
        }
        self.complete(StoreEvent::ReadDone(res))?;
        Ok(StoreOutcome::Pending)
    }

    fn write(
        &self,
        handle: StoreHandle,
        offset: u32,
        data: &[u8],
    ) -> FetchResult<StoreOutcome<()>> {
        let res = self.do_write(handle, offset, data);
        if self.split.is_none() {
            return res.map(StoreOutcome::Ready);
        }
        self.complete(StoreEvent::WriteDone(res))?;
        Ok(StoreOutcome::Pending)
    }

    fn flush(&self, handle: StoreHandle) -> FetchResult<()> {
        let mut lock = self.inner.lock().unwrap();
        if lock.failing {
            return Err(FetchError::store("flush failed"));
        }
        let obj = lock
            .objects
            .get_mut(&handle)
            .ok_or_else(|| FetchError::store(format!("no object {handle}")))?;
        obj.flushed = true;
        Ok(())
    }

    fn discard(&self, handle: StoreHandle) -> FetchResult<()> {
        let mut lock = self.inner.lock().unwrap();
        let obj = lock
            .objects
            .get_mut(&handle)
            .ok_or_else(|| FetchError::store(format!("no object {handle}")))?;
        obj.data.fill(0);
        obj.flushed = false;
        Ok(())
    }

    fn header_base_address(&self, handle: StoreHandle) -> CodeAddr {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&handle)
            .map(|o| o.base)
            .unwrap_or(CodeAddr(0))
    }
}
