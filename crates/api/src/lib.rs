#![deny(missing_docs)]
//! Codefetch API contains the types shared by code fetcher implementations
//! and the traits of the collaborators a fetcher is built on: the content
//! registry, the code store, the relocator, the radio link, timers, and
//! the requester notification path.
//!
//! If you want the fetcher itself, please see the codefetch_core crate.

pub mod config;

mod error;
pub use error::*;

pub mod id;
pub use id::{CodeAddr, ContentKey, NodeAddr, RequesterId, StoreHandle};

mod bitmap;
pub use bitmap::*;

pub mod protocol;
pub use protocol::*;

pub mod registry;
pub use registry::*;

pub mod code_store;
pub use code_store::*;

pub mod relocate;
pub use relocate::*;

pub mod transport;
pub use transport::*;

pub mod fetch;
pub use fetch::*;
