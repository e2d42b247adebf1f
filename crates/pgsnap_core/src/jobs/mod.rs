//! Backup and restore pipelines.
//!
//! A pipeline loads its configuration, then drives the services in order
//! while recording every acquired resource on a
//! [`ResourceStack`](crate::services::ResourceStack). The work is raced
//! against a shutdown future (Ctrl-C in the binary); whichever way the run
//! ends, the stack is released.

pub mod backup;
pub mod restore;

use async_trait::async_trait;

use crate::error::SnapResult;
use crate::models::{ConnectionConfig, SshBastion};
use crate::services::{Database, SshTunnelService, TunnelSession};

pub use backup::{backup_file_name, run_backup, BackupJob, BackupOptions, BackupStage};
pub use restore::{run_restore, RestoreJob, RestoreOptions, RestoreStage};

/// Network entry points used by the pipelines.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a tunnel through `bastion` to `remote_host:remote_port`.
    async fn open_tunnel(
        &self,
        bastion: &SshBastion,
        remote_host: &str,
        remote_port: u16,
    ) -> SnapResult<TunnelSession>;

    /// Open a database session.
    async fn connect(&self, config: &ConnectionConfig) -> SnapResult<Database>;
}

/// Connector backed by real SSH and PostgreSQL connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveConnector;

#[async_trait]
impl Connector for LiveConnector {
    async fn open_tunnel(
        &self,
        bastion: &SshBastion,
        remote_host: &str,
        remote_port: u16,
    ) -> SnapResult<TunnelSession> {
        SshTunnelService::open(bastion, remote_host, remote_port).await
    }

    async fn connect(&self, config: &ConnectionConfig) -> SnapResult<Database> {
        Database::connect(config).await
    }
}

/// Resolves when the operator interrupts the process.
pub async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::warn!("Interrupt received; stopping"),
        Err(e) => {
            // Without a signal handler the run can only end on its own.
            tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await
        }
    }
}
