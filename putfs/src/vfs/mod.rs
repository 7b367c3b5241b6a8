//! VFS layer (virtual filesystem)
//!
//! Responsibilities:
//! - Implement the path-based operation set served to the kernel: attributes,
//!   listing, access checks, open/read, create/write/release.
//! - Stage newly created files locally and upload them whole on release.
//! - Reject every structural mutation the remote cannot express as read-only.
//!
//! Submodules:
//! - `buffer`: per-path write staging and upload commit
//! - `fs`: the operation translator (`PutFs`)
pub mod buffer;
pub mod fs;

pub use buffer::{Handle, WriteBuffers};
pub use fs::{AccessMask, DirEntry, FsStats, Mutation, PutFs};
