use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use putfs::cadapter::putio::PutioClient;
use putfs::config::Config;
use putfs::fuse::PutFuse;
use putfs::fuse::mount::mount_putfs;
use putfs::vfs::PutFs;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("putfs=info")),
        )
        .init();
    let config = Config::parse();

    let spool_dir = config.spool_dir()?;
    let client = PutioClient::new(&config.token, config.putio_options())
        .context("failed to build put.io client")?;
    let fs = Arc::new(PutFs::new(Arc::new(client), Some(spool_dir.clone())));
    fs.fetch_root()
        .await
        .context("cannot reach put.io with the given token")?;

    let fuse = PutFuse::new(fs).with_attr_ttl(config.attr_ttl());
    let mut mount_handle = mount_putfs(fuse, &config.mountpoint, &config.mount_config())
        .await
        .with_context(|| format!("failed to mount on {}", config.mountpoint.display()))?;
    info!(
        mount_point = %config.mountpoint.display(),
        spool = %spool_dir.display(),
        "putfs mounted"
    );

    let mut sigterm = unix_signal(SignalKind::terminate()).context("failed to watch SIGTERM")?;
    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => {
            if let Err(e) = &res {
                error!(error = %e, "fuse session ended with error");
            }
            res.context("fuse session failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("interrupted, unmounting");
            mount_handle.unmount().await.context("unmount failed")?;
        }
        _ = sigterm.recv() => {
            info!("terminated, unmounting");
            mount_handle.unmount().await.context("unmount failed")?;
        }
    }
    Ok(())
}
