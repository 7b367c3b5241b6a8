pub mod cadapter;
pub mod config;
pub mod error;
pub mod fuse;
pub mod meta;
pub mod vfs;
