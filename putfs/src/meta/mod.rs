//! Remote metadata, shaped into a path namespace
//!
//! Responsibilities:
//! - Model remote objects as immutable nodes with derived attributes.
//! - Map normalized paths to nodes, fetching directory listings lazily and
//!   at most once per directory per process.
//!
//! Submodules:
//! - `node`: remote node model and attribute projection
//! - `path`: path normalization helpers
//! - `cache`: the lazily populated path cache
pub mod cache;
pub mod node;
pub mod path;

pub use cache::{ChildrenState, PathCache};
pub use node::{FileAttributes, NodeKind, ROOT_ID, RemoteNode};
