#![deny(missing_docs)]
//! Single-hop code image dissemination for sensor nodes.
//!
//! [factories::CodeFetcher] is the protocol state machine. The other
//! factories are in-memory collaborators for tests and simulation, and
//! [node::FetchNode] runs a fetcher on the tokio clock.

pub mod factories;
pub mod node;
