//! Command line and environment configuration for the `putfs` binary.

use crate::cadapter::putio::{DEFAULT_API_URL, DEFAULT_PAGE_SIZE, DEFAULT_UPLOAD_URL, PutioOptions};
use crate::fuse::mount::MountConfig;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "putfs")]
#[command(about = "Mount a put.io account as a FUSE filesystem", long_about = None)]
pub struct Config {
    /// Empty directory to mount on
    #[arg(value_name = "MOUNTPOINT", env = "PUTFS_MOUNTPOINT")]
    pub mountpoint: PathBuf,

    /// put.io OAuth token
    #[arg(value_name = "TOKEN", env = "PUTIO_TOKEN", hide_env_values = true)]
    pub token: String,

    #[arg(long, env = "PUTIO_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    #[arg(long, env = "PUTIO_UPLOAD_URL", default_value = DEFAULT_UPLOAD_URL)]
    pub upload_url: String,

    /// Where files being written are staged before upload
    #[arg(long, value_name = "DIR", env = "PUTFS_SPOOL_DIR")]
    pub spool_dir: Option<PathBuf>,

    /// Kernel attribute/entry cache lifetime
    #[arg(long, default_value_t = 1)]
    pub attr_ttl_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Entries requested per listing page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: u32,

    /// Let other users access the mount (needs user_allow_other in fuse.conf)
    #[arg(long)]
    pub allow_other: bool,

    /// Mount through /dev/fuse directly instead of fusermount3
    #[arg(long)]
    pub privileged: bool,
}

impl Config {
    /// Resolve and create the spool directory. Defaults to `<cache_dir>/putfs/spool`.
    pub fn spool_dir(&self) -> anyhow::Result<PathBuf> {
        let dir = match &self.spool_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("putfs")
                .join("spool"),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create spool dir {}", dir.display()))?;
        Ok(dir)
    }

    pub fn putio_options(&self) -> PutioOptions {
        PutioOptions {
            api_url: self.api_url.clone(),
            upload_url: self.upload_url.clone(),
            page_size: self.page_size,
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn mount_config(&self) -> MountConfig {
        MountConfig {
            allow_other: self.allow_other,
            privileged: self.privileged,
            ..Default::default()
        }
    }

    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.attr_ttl_secs)
    }
}
