//! Data models for pgsnap.
//!
//! - `connection` - ConnectionConfig, SslMode, SshBastion
//! - `config` - Environment loading for backup and restore runs
//! - `schema` - Table descriptions from catalog introspection
//! - `value` - Cell values and SQL literal rendering
//! - `execution` - Restore execution results and run reports

pub mod config;
pub mod connection;
pub mod execution;
pub mod schema;
pub mod value;

pub use config::{BackupConfig, EnvSource, ProcessEnv, RestoreConfig, TunnelPolicy};
pub use connection::{ConnectionConfig, SshBastion, SslMode};
pub use execution::{
    BackupReport, CleanupMode, DumpSource, ExecutionResult, ExecutorKind, RestoreReport,
};
pub use schema::{ColumnDef, ForeignKey, ForeignKeyEdge, IndexDef, ReferentialAction, TableSchema};
pub use value::{quote_ident, quote_literal, Cell};
