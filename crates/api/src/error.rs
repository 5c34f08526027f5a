//! Code fetcher error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The code fetcher error type.
///
/// Protocol-level results of a fetch (completed, gave up, store broke)
/// are not errors, see [crate::fetch::FetchOutcome]. This type covers
/// operations that are rejected synchronously and failures reported by
/// collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// The job pool (or another bounded buffer) is exhausted.
    #[error("out of memory")]
    OutOfMemory,

    /// No job matched the given requester and key.
    #[error("no fetch job for key {0}")]
    NotFound(crate::ContentKey),

    /// The registry has no entry for the given key.
    #[error("unknown content key {0}")]
    UnknownKey(crate::ContentKey),

    /// The content size yields no fragments, or more than fit a bitmap.
    #[error("invalid content size {0}")]
    InvalidSize(u32),

    /// A code store or relocation operation failed.
    #[error("store failure: {ctx} (src: {src})")]
    Store {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },

    /// Generic internal error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },
}

impl FetchError {
    /// Construct a "store" error.
    pub fn store<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Store {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }

    /// Construct a "store" error with an inner source error.
    pub fn store_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Store {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }
}

/// The code fetcher result type.
pub type FetchResult<T> = Result<T, FetchError>;

#[cfg(test)]
mod test {
    use super::*;
    use crate::ContentKey;

    #[test]
    fn error_display() {
        assert_eq!(
            "bla (src: None)",
            FetchError::other("bla").to_string().as_str(),
        );
        assert_eq!(
            "foo (src: bar)",
            FetchError::other_src("foo", std::io::Error::other("bar"))
                .to_string()
                .as_str(),
        );
        assert_eq!(
            "store failure: flash busy (src: None)",
            FetchError::store("flash busy").to_string().as_str(),
        );
        assert_eq!(
            "no fetch job for key 7",
            FetchError::NotFound(ContentKey(7)).to_string().as_str(),
        );
        assert_eq!(
            "invalid content size 0",
            FetchError::InvalidSize(0).to_string().as_str(),
        );
    }

    #[test]
    fn error_debug() {
        assert_eq!(
            "Other { ctx: \"bla\", src: None }",
            format!("{:?}", FetchError::other("bla")).as_str(),
        );
        assert_eq!("OutOfMemory", format!("{:?}", FetchError::OutOfMemory));
    }

    #[test]
    fn ensure_fetch_error_type_is_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(FetchError::other("bla"));
    }
}
