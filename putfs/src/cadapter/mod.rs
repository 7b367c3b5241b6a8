//! Remote storage adapter (cAdapter)
//!
//! Submodules:
//! - `client`: the `RemoteClient` contract consumed by the cache and the
//!   write buffers, plus the raw wire record and error type
//! - `putio`: put.io API v2 implementation over `reqwest`
//! - `memory`: in-process remote used by tests and local experiments
//!
//! Every call here is a fallible remote round trip with unbounded latency.
//! Nothing in this module caches; caching lives in `meta::cache`.
pub mod client;
pub mod memory;
pub mod putio;

pub use client::{
    AccountUsage, NodeId, ROOT_ID, RemoteClient, RemoteEntry, RemoteError, UploadBody, UploadStream,
};
