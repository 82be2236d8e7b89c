// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broker process entry point.
//!
//! Usage: `slmf-daemon <master-secret-file> [store-path]`
//!
//! The master secret file is produced by the external key manager; it is
//! read once and never written back. Without it the process exits
//! non-zero before binding any socket.

use anyhow::{bail, Context, Result};
use slmf_daemon::{Daemon, DaemonConfig};
use slmf_keyvault::MasterSecret;
use slmf_store::StoreConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(secret_path) = args.next() else {
        bail!("usage: slmf-daemon <master-secret-file> [store-path]");
    };
    let store_path = args.next();

    let secret_bytes = std::fs::read(&secret_path)
        .with_context(|| format!("master secret unavailable at {secret_path}"))?;
    let master = MasterSecret::new(secret_bytes).context("master secret rejected")?;

    let mut config = DaemonConfig::default();
    if let Some(path) = store_path {
        config.store = StoreConfig::at_path(std::path::Path::new(&path));
    }

    let daemon = Daemon::start(config, Some(master))
        .await
        .context("fabric daemon failed to start")?;
    info!(
        frontend = %daemon.frontend_addr(),
        backend = %daemon.backend_addr(),
        "fabric daemon running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("signal handler failed")?;
    daemon.shutdown().await;
    Ok(())
}
