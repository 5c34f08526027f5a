//! The code store, owner of the bytes of every content object.
//!
//! Stores backed by slow media (external flash) may not complete an
//! operation in the call that starts it. They return
//! [StoreOutcome::Pending] and later report completion to the fetcher
//! through `CodeFetcher::on_write_done` / `CodeFetcher::on_read_done`.

use crate::*;
use std::sync::Arc;

/// Result of starting a store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome<T> {
    /// The operation finished.
    Ready(T),
    /// The operation continues in the background, completion is signalled
    /// separately. Only one operation may be pending at a time.
    Pending,
}

/// Storage of content objects.
#[cfg_attr(any(test, feature = "mockall"), mockall::automock)]
pub trait CodeStore: 'static + Send + Sync + std::fmt::Debug {
    /// Read `len` bytes at `offset`. Bytes past the end of the object
    /// read as zero.
    fn read(
        &self,
        handle: StoreHandle,
        offset: u32,
        len: usize,
    ) -> FetchResult<StoreOutcome<bytes::Bytes>>;

    /// Write `data` at `offset`.
    fn write(
        &self,
        handle: StoreHandle,
        offset: u32,
        data: &[u8],
    ) -> FetchResult<StoreOutcome<()>>;

    /// Make the written contents durable.
    fn flush(&self, handle: StoreHandle) -> FetchResult<()>;

    /// Throw away the contents of the object.
    fn discard(&self, handle: StoreHandle) -> FetchResult<()>;

    /// Address at which the object's header resides in program memory.
    /// This is the base the relocator patches addresses against.
    fn header_base_address(&self, handle: StoreHandle) -> CodeAddr;
}

/// Trait-object [CodeStore].
pub type DynCodeStore = Arc<dyn CodeStore>;
