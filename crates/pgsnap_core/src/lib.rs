//! Core engine for pgsnap.
//!
//! This crate snapshots a PostgreSQL database reachable only through an SSH
//! bastion and restores such snapshots into another instance:
//!
//! - **error**: Error handling with PostgreSQL-specific details
//! - **models**: Configuration, table descriptions, cell values, run reports
//! - **services**: SSH tunnel, database session, introspection, dump writer,
//!   restore executors, resource release
//! - **jobs**: Backup and restore pipelines
//! - **logging**: Structured logging setup

pub mod error;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod services;


pub use error::{SnapError, SnapResult};
pub use jobs::{
    run_backup, run_restore, BackupJob, BackupOptions, Connector, LiveConnector, RestoreJob,
    RestoreOptions,
};
pub use models::{
    BackupConfig, BackupReport, Cell, CleanupMode, ConnectionConfig, DumpSource, EnvSource,
    ExecutionResult, ExecutorKind, ProcessEnv, RestoreConfig, RestoreReport, SshBastion, SslMode,
    TableSchema, TunnelPolicy,
};
pub use services::{
    Database, DriverExecutor, DumpWriter, PsqlExecutor, ResourceStack, RestoreService,
    SchemaService, ScriptExecutor, SshTunnelService, TunnelSession,
};
