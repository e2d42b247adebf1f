//! Backup pipeline: tunnel, connect, introspect, serialize.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{SnapError, SnapResult};
use crate::jobs::Connector;
use crate::models::{BackupConfig, BackupReport, EnvSource, TunnelPolicy};
use crate::services::{stream_rows, DumpHeader, DumpWriter, ResourceStack, SchemaService};

/// Backup progress, logged at each transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupStage {
    Init,
    TunnelUp { local_port: u16 },
    Connected,
    Introspected { table: String },
    Serialized { table: String, rows: u64 },
    Complete,
    Failed,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::TunnelUp { local_port } => write!(f, "tunnel-up (127.0.0.1:{local_port})"),
            Self::Connected => write!(f, "connected"),
            Self::Introspected { table } => write!(f, "introspected {table}"),
            Self::Serialized { table, rows } => write!(f, "serialized {table} ({rows} rows)"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Command-line overrides for a backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub tunnel: TunnelPolicy,
    pub output_dir: Option<PathBuf>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self { tunnel: TunnelPolicy::Required, output_dir: None }
    }
}

/// File name for a dump taken at `at`: `backup-<db>-<timestamp>.sql`, with
/// `:` and `.` in the ISO-8601 timestamp replaced by `-`.
pub fn backup_file_name(database: &str, at: DateTime<Utc>) -> String {
    let stamp = at.to_rfc3339_opts(SecondsFormat::Millis, true).replace([':', '.'], "-");
    let database = database.replace(['/', '\\'], "_");
    format!("backup-{database}-{stamp}.sql")
}

/// Load configuration from `env`, then run a backup.
///
/// Configuration problems are reported before `connector` is touched.
pub async fn run_backup<S>(
    env: &dyn EnvSource,
    options: BackupOptions,
    connector: &dyn Connector,
    shutdown: S,
) -> SnapResult<BackupReport>
where
    S: Future<Output = ()>,
{
    let mut config = BackupConfig::load(env, options.tunnel)?;
    if let Some(dir) = options.output_dir {
        config = config.with_output_dir(dir);
    }
    BackupJob::new(config).run(connector, shutdown).await
}

/// A configured backup run.
pub struct BackupJob {
    config: BackupConfig,
}

struct Progress {
    stage: BackupStage,
    dump_path: Option<PathBuf>,
}

impl Progress {
    fn advance(&mut self, stage: BackupStage) {
        tracing::info!(stage = %stage, "Backup stage");
        self.stage = stage;
    }
}

impl BackupJob {
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    /// Run to completion or until `shutdown` resolves. Resources are always
    /// released before returning.
    pub async fn run<S>(&self, connector: &dyn Connector, shutdown: S) -> SnapResult<BackupReport>
    where
        S: Future<Output = ()>,
    {
        let mut stack = ResourceStack::new();
        let mut progress = Progress { stage: BackupStage::Init, dump_path: None };
        progress.advance(BackupStage::Init);

        let result = tokio::select! {
            result = self.execute(connector, &mut stack, &mut progress) => result,
            _ = shutdown => Err(SnapError::Cancelled),
        };

        for (resource, e) in stack.release_all().await {
            tracing::warn!(resource = %resource, error = %e, "Teardown step failed");
        }

        match &result {
            Ok(report) => {
                tracing::info!(
                    path = %report.path.display(),
                    tables = report.tables,
                    rows = report.rows,
                    "Backup complete"
                );
            }
            Err(e) => {
                tracing::error!(stage = %progress.stage, error = %e, "Backup failed");
                if let Some(path) = &progress.dump_path {
                    tracing::warn!(path = %path.display(), "Partial dump left without completion marker");
                }
                progress.advance(BackupStage::Failed);
            }
        }
        result
    }

    async fn execute(
        &self,
        connector: &dyn Connector,
        stack: &mut ResourceStack,
        progress: &mut Progress,
    ) -> SnapResult<BackupReport> {
        let source = &self.config.source;
        let schema = self.config.schema.as_str();

        let endpoint = match &source.ssh {
            Some(bastion) => {
                let tunnel = connector.open_tunnel(bastion, &source.host, source.port).await?;
                let local_port = tunnel.local_port();
                stack.push(tunnel);
                progress.advance(BackupStage::TunnelUp { local_port });
                source.through("127.0.0.1", local_port)
            }
            None => source.clone(),
        };

        let mut db = connector.connect(&endpoint).await?;
        stack.push(db.closer());
        progress.advance(BackupStage::Connected);

        SchemaService::pin_search_path(&db, schema).await?;
        let tables = SchemaService::list_tables(&db, schema).await?;
        tracing::info!(schema, tables = tables.len(), "Tables to dump");

        // The dump file exists only once the database is reachable.
        tokio::fs::create_dir_all(&self.config.output_dir).await.map_err(|e| {
            SnapError::storage_with_source(
                format!("Failed to create backup directory {}", self.config.output_dir.display()),
                e,
            )
        })?;
        let path = self.config.output_dir.join(backup_file_name(&source.database, Utc::now()));
        let file = tokio::fs::File::create(&path).await.map_err(|e| {
            SnapError::storage_with_source(format!("Failed to create dump file {}", path.display()), e)
        })?;
        progress.dump_path = Some(path.clone());
        tracing::info!(path = %path.display(), "Writing dump");

        let mut writer = DumpWriter::new(file, DumpHeader::new(source.database.as_str(), schema));
        writer.write_header().await?;

        for table in &tables {
            let description = SchemaService::describe(&db, schema, table).await?;
            progress.advance(BackupStage::Introspected { table: table.clone() });

            let rows = stream_rows(&db, schema, &description).await?;
            let count = writer.write_table(&description, rows).await?;
            progress.advance(BackupStage::Serialized { table: table.clone(), rows: count });
        }

        let summary = writer.finish().await?;
        drop(db);
        progress.advance(BackupStage::Complete);

        Ok(BackupReport { path, tables: summary.tables, rows: summary.rows })
    }
}
