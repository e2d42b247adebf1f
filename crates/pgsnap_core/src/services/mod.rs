//! Engine services for pgsnap.
//!
//! - `scope` - Ordered release of run resources
//! - `ssh_tunnel` - Local listener forwarding through an SSH bastion
//! - `connection` - Single PostgreSQL session
//! - `schema` - Catalog introspection
//! - `rows` - Streaming row reads decoded into cells
//! - `dump` - SQL dump writer
//! - `executor` - Restore script executors (psql, driver)
//! - `restore` - Dump selection and pre-restore cleanup

pub mod connection;
pub mod dump;
pub mod executor;
pub mod restore;
pub mod rows;
pub mod schema;
pub mod scope;
pub mod ssh_tunnel;

pub use connection::{ConnectionCloser, Database};
pub use dump::{write_dump, DumpHeader, DumpSummary, DumpWriter, DUMP_COMPLETE_MARKER};
pub use executor::{DriverExecutor, PsqlExecutor, ScriptExecutor};
pub use restore::RestoreService;
pub use rows::{stream_rows, CellStream, RowPlan};
pub use schema::SchemaService;
pub use scope::{Release, ResourceStack};
pub use ssh_tunnel::{ChannelOpener, SshTunnelService, TunnelSession, TunnelStream};
