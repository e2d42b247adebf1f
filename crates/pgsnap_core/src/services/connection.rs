//! Single PostgreSQL session used by a backup or restore run.
//!
//! A run never needs more than one session at a time, so this wraps a plain
//! `tokio_postgres::Client` with its connection task instead of a pool.

use std::time::Duration;

use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row, RowStream};

use crate::error::{SnapError, SnapResult};
use crate::models::{ConnectionConfig, SslMode};
use crate::services::scope::Release;

/// An open database session.
pub struct Database {
    client: Client,
    connection_task: Option<JoinHandle<()>>,
    target: String,
}

impl Database {
    /// Connect using the given configuration.
    ///
    /// The configuration must already point at a reachable endpoint; for
    /// tunneled runs that is the tunnel's local side.
    pub async fn connect(config: &ConnectionConfig) -> SnapResult<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.username);
        pg_config.password(&config.password);
        pg_config.application_name(&config.application_name);
        pg_config.connect_timeout(config.connect_timeout);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(60));

        let target = config.display_url();

        let (client, connection_task) = match config.ssl_mode {
            SslMode::Disable => {
                pg_config.ssl_mode(tokio_postgres::config::SslMode::Disable);
                let (client, connection) = pg_config.connect(NoTls).await?;
                (client, spawn_connection(connection, target.clone()))
            }
            SslMode::Prefer | SslMode::Require => {
                // Both modes encrypt without certificate verification.
                let pg_mode = if config.ssl_mode == SslMode::Require {
                    tokio_postgres::config::SslMode::Require
                } else {
                    tokio_postgres::config::SslMode::Prefer
                };
                pg_config.ssl_mode(pg_mode);

                let connector = TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .build()
                    .map_err(|e| {
                        SnapError::connection_with_source("Failed to create TLS connector", e)
                    })?;
                let tls = MakeTlsConnector::new(connector);
                let (client, connection) = pg_config.connect(tls).await?;
                (client, spawn_connection(connection, target.clone()))
            }
        };

        tracing::info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            ssl_mode = config.ssl_mode.as_str(),
            "Database connection established"
        );

        Ok(Self { client, connection_task: Some(connection_task), target })
    }

    /// Execute a query that returns rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> SnapResult<Vec<Row>> {
        self.client.query(sql, params).await.map_err(SnapError::from)
    }

    /// Start a streaming query without parameters.
    pub async fn query_stream(&self, sql: &str) -> SnapResult<RowStream> {
        self.client
            .query_raw(sql, std::iter::empty::<&(dyn ToSql + Sync)>())
            .await
            .map_err(SnapError::from)
    }

    /// Execute one or more statements separated by semicolons.
    pub async fn batch_execute(&self, sql: &str) -> SnapResult<()> {
        self.client.batch_execute(sql).await.map_err(SnapError::from)
    }

    /// Handle that stops the connection task; pushed onto the run's
    /// resource stack.
    pub fn closer(&mut self) -> ConnectionCloser {
        ConnectionCloser { task: self.connection_task.take(), target: self.target.clone() }
    }

    /// Close the session and wait for the connection task to finish.
    pub async fn close(mut self) -> SnapResult<()> {
        let mut closer = self.closer();
        drop(self);
        closer.release().await
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
    }
}

fn spawn_connection<F>(connection: F, target: String) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(db = %target, error = %e, "Database connection ended with error");
        }
    })
}

/// Stops a session's connection task.
pub struct ConnectionCloser {
    task: Option<JoinHandle<()>>,
    target: String,
}

#[async_trait]
impl Release for ConnectionCloser {
    fn label(&self) -> &str {
        "database connection"
    }

    async fn release(&mut self) -> SnapResult<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        // The task ends on its own once the client is gone; abort covers the
        // case where the client is still alive.
        task.abort();
        match task.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                return Err(SnapError::internal(format!("Connection task failed: {e}")));
            }
        }
        tracing::debug!(db = %self.target, "Database connection closed");
        Ok(())
    }

    fn release_now(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
