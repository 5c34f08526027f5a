//! The content registry, mapping a content key to its store handle and
//! dissemination status.

use crate::*;
use std::sync::Arc;

/// Where a fetch of a content object stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStatus {
    /// Waiting behind another fetch.
    Queued,
    /// The active fetch.
    Fetching,
    /// All fragments were received and committed.
    Done,
    /// The fetch gave up, see [crate::fetch::FetchOutcome].
    Failed,
}

/// What kind of bytes a content object holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// A loadable module whose function table must be relocated when it
    /// is written into, or read out of, program memory.
    RelocatableCode,
    /// Opaque data, copied as is.
    Raw,
}

/// A registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    /// The code store object holding the content.
    pub handle: StoreHandle,
    /// Dissemination status.
    pub status: FetchStatus,
    /// Kind of content.
    pub kind: ContentKind,
}

/// Resolves content keys. Entries are created and removed by whoever owns
/// the content (e.g. the module loader), the fetcher only reads them and
/// updates their status.
#[cfg_attr(any(test, feature = "mockall"), mockall::automock)]
pub trait Registry: 'static + Send + Sync + std::fmt::Debug {
    /// Look up the entry for `key`.
    fn lookup(&self, key: ContentKey) -> Option<RegistryEntry>;

    /// Update the fetch status of `key`. Unknown keys are ignored.
    fn set_status(&self, key: ContentKey, status: FetchStatus);
}

/// Trait-object [Registry].
pub type DynRegistry = Arc<dyn Registry>;
