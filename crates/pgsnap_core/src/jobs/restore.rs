//! Restore pipeline: pick the dump, prepare the target, run the script.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use crate::error::{SnapError, SnapResult};
use crate::jobs::Connector;
use crate::models::{
    CleanupMode, DumpSource, EnvSource, ExecutorKind, RestoreConfig, RestoreReport, TunnelPolicy,
};
use crate::services::{
    DriverExecutor, PsqlExecutor, ResourceStack, RestoreService, ScriptExecutor,
};

/// Restore progress, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Init,
    TunnelUp,
    Cleaned,
    Restored,
    Complete,
    Failed,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::TunnelUp => "tunnel-up",
            Self::Cleaned => "cleaned",
            Self::Restored => "restored",
            Self::Complete => "complete",
            Self::Failed => "failed",
        })
    }
}

/// Command-line options for a restore run.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Explicit dump file; the latest in the backups directory otherwise.
    pub dump: Option<PathBuf>,
    pub cleanup: CleanupMode,
    pub tunnel: TunnelPolicy,
    pub backups_dir: Option<PathBuf>,
    pub executor: ExecutorKind,
    pub psql_path: Option<PathBuf>,
}

impl RestoreOptions {
    pub fn new(cleanup: CleanupMode) -> Self {
        Self {
            dump: None,
            cleanup,
            tunnel: TunnelPolicy::Auto,
            backups_dir: None,
            executor: ExecutorKind::default(),
            psql_path: None,
        }
    }
}

/// Load configuration, choose and verify the dump, then restore it.
///
/// Configuration and dump-file problems are reported before `connector` is
/// touched.
pub async fn run_restore<S>(
    env: &dyn EnvSource,
    options: RestoreOptions,
    connector: &dyn Connector,
    shutdown: S,
) -> SnapResult<RestoreReport>
where
    S: Future<Output = ()>,
{
    let config = RestoreConfig::load(env, options.tunnel)?;

    let source = match options.dump {
        Some(path) => DumpSource::Path(path),
        None => DumpSource::LatestIn(options.backups_dir.unwrap_or_else(|| config.backups_dir.clone())),
    };
    let dump = RestoreService::resolve(&source).await?;

    let executor: Box<dyn ScriptExecutor> = match options.executor {
        ExecutorKind::Psql => Box::new(PsqlExecutor::new(
            options.psql_path.unwrap_or_else(|| config.psql_path.clone()),
        )),
        ExecutorKind::Driver => Box::new(DriverExecutor),
    };

    RestoreJob::new(config, dump, options.cleanup, executor).run(connector, shutdown).await
}

/// A configured restore run.
pub struct RestoreJob {
    config: RestoreConfig,
    dump: PathBuf,
    cleanup: CleanupMode,
    executor: Box<dyn ScriptExecutor>,
}

impl RestoreJob {
    pub fn new(
        config: RestoreConfig,
        dump: PathBuf,
        cleanup: CleanupMode,
        executor: Box<dyn ScriptExecutor>,
    ) -> Self {
        Self { config, dump, cleanup, executor }
    }

    /// Run to completion or until `shutdown` resolves. Resources are always
    /// released before returning.
    pub async fn run<S>(&self, connector: &dyn Connector, shutdown: S) -> SnapResult<RestoreReport>
    where
        S: Future<Output = ()>,
    {
        let mut stack = ResourceStack::new();
        let mut stage = RestoreStage::Init;
        tracing::info!(
            stage = %stage,
            dump = %self.dump.display(),
            cleanup = self.cleanup.as_str(),
            executor = self.executor.name(),
            "Restore stage"
        );

        let result = tokio::select! {
            result = self.execute(connector, &mut stack, &mut stage) => result,
            _ = shutdown => Err(SnapError::Cancelled),
        };

        for (resource, e) in stack.release_all().await {
            tracing::warn!(resource = %resource, error = %e, "Teardown step failed");
        }

        match &result {
            Ok(_) => tracing::info!(dump = %self.dump.display(), "Restore complete"),
            Err(e) => {
                tracing::error!(stage = %stage, error = %e, "Restore failed");
                tracing::info!(stage = %RestoreStage::Failed, "Restore stage");
            }
        }
        result
    }

    async fn execute(
        &self,
        connector: &dyn Connector,
        stack: &mut ResourceStack,
        stage: &mut RestoreStage,
    ) -> SnapResult<RestoreReport> {
        let target = &self.config.target;

        let endpoint = match &target.ssh {
            Some(bastion) => {
                let tunnel = connector.open_tunnel(bastion, &target.host, target.port).await?;
                let local_port = tunnel.local_port();
                stack.push(tunnel);
                advance(stage, RestoreStage::TunnelUp);
                target.through("127.0.0.1", local_port)
            }
            None => target.clone(),
        };

        // Cleanup runs on its own session, closed before the script starts.
        let mut db = connector.connect(&endpoint).await?;
        stack.push(db.closer());
        RestoreService::cleanup(&db, self.cleanup, &target.username).await?;
        drop(db);
        advance(stage, RestoreStage::Cleaned);

        let result = self.executor.run(&self.dump, &endpoint).await?;
        if !result.success() {
            return Err(SnapError::restore_execution(
                format!("{} exited with status {}", self.executor.name(), result.status),
                Some(result.status),
                result.stdout,
                result.stderr,
            ));
        }
        advance(stage, RestoreStage::Restored);
        advance(stage, RestoreStage::Complete);

        Ok(RestoreReport { path: self.dump.clone(), cleanup: self.cleanup, result })
    }
}

fn advance(stage: &mut RestoreStage, next: RestoreStage) {
    tracing::info!(stage = %next, "Restore stage");
    *stage = next;
}
