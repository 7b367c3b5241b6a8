//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we default to an
//!   unprivileged mount via fusermount3; a privileged mount is opt-in.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};
use tracing::info;

use crate::cadapter::client::RemoteClient;
use crate::fuse::PutFuse;

/// Knobs that end up in the kernel mount options.
#[derive(Clone, Debug)]
pub struct MountConfig {
    pub fs_name: String,
    pub allow_other: bool,
    pub privileged: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            fs_name: "putfs".to_string(),
            allow_other: false,
            privileged: false,
        }
    }
}

pub fn mount_options(config: &MountConfig) -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut mo = MountOptions::default();
    mo.fs_name(config.fs_name.as_str())
        .force_readdir_plus(true)
        .uid(uid)
        .gid(gid);
    if config.allow_other {
        mo.allow_other(true);
    }
    mo
}

/// Mount `fs` on an empty directory and return the running session handle.
#[cfg(target_os = "linux")]
pub async fn mount_putfs<C>(
    fs: PutFuse<C>,
    mount_point: impl AsRef<Path>,
    config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    C: RemoteClient + 'static,
{
    let mount_point = mount_point.as_ref();
    let session = Session::new(mount_options(config));
    info!(
        mount_point = %mount_point.display(),
        privileged = config.privileged,
        "mounting putfs"
    );
    if config.privileged {
        session.mount(fs, mount_point).await
    } else {
        session.mount_with_unprivileged(fs, mount_point).await
    }
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_putfs<C>(
    _fs: PutFuse<C>,
    _mount_point: impl AsRef<Path>,
    _config: &MountConfig,
) -> std::io::Result<MountHandle>
where
    C: RemoteClient + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
