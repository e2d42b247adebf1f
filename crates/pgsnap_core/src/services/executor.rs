//! Restore script execution.
//!
//! [`ScriptExecutor`] runs a dump file against a target database and reports
//! an [`ExecutionResult`]. A non-zero status is not an error at this level;
//! the restore pipeline decides what to do with it.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{SnapError, SnapResult};
use crate::models::{ConnectionConfig, ExecutionResult};
use crate::services::connection::Database;

/// Exit status reported for a script stopped by a statement error.
pub const SCRIPT_ERROR_STATUS: i32 = 3;

/// Runs a SQL script against a database.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run `script` against `target`. `target` already points at the
    /// reachable endpoint (the tunnel's local side when tunneling).
    async fn run(&self, script: &Path, target: &ConnectionConfig) -> SnapResult<ExecutionResult>;
}

/// Runs scripts with the external `psql` client.
#[derive(Debug, Clone)]
pub struct PsqlExecutor {
    psql_path: PathBuf,
}

impl PsqlExecutor {
    pub fn new(psql_path: impl Into<PathBuf>) -> Self {
        Self { psql_path: psql_path.into() }
    }

    /// Command that runs `script` against `target`.
    pub fn command(&self, script: &Path, target: &ConnectionConfig) -> Command {
        let mut cmd = Command::new(&self.psql_path);
        cmd.arg("--no-psqlrc")
            .arg("-v")
            .arg("ON_ERROR_STOP=1")
            .arg("-h")
            .arg(&target.host)
            .arg("-p")
            .arg(target.port.to_string())
            .arg("-U")
            .arg(&target.username)
            .arg("-d")
            .arg(&target.database)
            .arg("-f")
            .arg(script)
            .env("PGPASSWORD", &target.password)
            .env("PGSSLMODE", target.ssl_mode.as_str())
            .env("PGAPPNAME", &target.application_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for PsqlExecutor {
    fn default() -> Self {
        Self::new("psql")
    }
}

#[async_trait]
impl ScriptExecutor for PsqlExecutor {
    fn name(&self) -> &'static str {
        "psql"
    }

    async fn run(&self, script: &Path, target: &ConnectionConfig) -> SnapResult<ExecutionResult> {
        tracing::debug!(
            psql = %self.psql_path.display(),
            script = %script.display(),
            host = %target.host,
            port = target.port,
            "Spawning psql"
        );

        let output = self.command(script, target).output().await.map_err(|e| {
            SnapError::restore_execution(
                format!(
                    "Failed to start {} (install the PostgreSQL client or set PSQL_PATH)",
                    self.psql_path.display()
                ),
                None,
                "",
                e.to_string(),
            )
        })?;

        Ok(ExecutionResult {
            // Killed by a signal: no code.
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs scripts over the driver as one multi-statement batch.
///
/// The server executes a multi-statement batch as a single implicit
/// transaction, so a failing statement leaves no partial restore behind.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverExecutor;

#[async_trait]
impl ScriptExecutor for DriverExecutor {
    fn name(&self) -> &'static str {
        "driver"
    }

    async fn run(&self, script: &Path, target: &ConnectionConfig) -> SnapResult<ExecutionResult> {
        let sql = tokio::fs::read_to_string(script).await?;
        let db = Database::connect(target).await?;

        let result = match db.batch_execute(&sql).await {
            Ok(()) => ExecutionResult { status: 0, stdout: String::new(), stderr: String::new() },
            Err(SnapError::Database { message, detail, hint, code }) => {
                let mut stderr = format!("ERROR:  {message}");
                if let Some(code) = code {
                    stderr.push_str(&format!(" ({code})"));
                }
                if let Some(detail) = detail {
                    stderr.push_str(&format!("\nDETAIL:  {detail}"));
                }
                if let Some(hint) = hint {
                    stderr.push_str(&format!("\nHINT:  {hint}"));
                }
                stderr.push('\n');
                ExecutionResult { status: SCRIPT_ERROR_STATUS, stdout: String::new(), stderr }
            }
            Err(other) => {
                let _ = db.close().await;
                return Err(other);
            }
        };

        db.close().await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SslMode;

    #[test]
    fn test_psql_command_line() {
        let target = ConnectionConfig::new("127.0.0.1", 41234, "app", "admin", "pw")
            .with_ssl_mode(SslMode::Require);
        let cmd = PsqlExecutor::new("/opt/pg/bin/psql").command(Path::new("dump.sql"), &target);
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "/opt/pg/bin/psql");
        let args: Vec<String> =
            std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "--no-psqlrc", "-v", "ON_ERROR_STOP=1", "-h", "127.0.0.1", "-p", "41234", "-U",
                "admin", "-d", "app", "-f", "dump.sql",
            ]
        );

        let envs: Vec<(String, String)> = std_cmd
            .get_envs()
            .filter_map(|(k, v)| {
                Some((k.to_string_lossy().into_owned(), v?.to_string_lossy().into_owned()))
            })
            .collect();
        assert!(envs.contains(&("PGPASSWORD".to_string(), "pw".to_string())));
        assert!(envs.contains(&("PGSSLMODE".to_string(), "require".to_string())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_psql_nonzero_exit_is_captured() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("psql");
        std::fs::write(&fake, "#!/bin/sh\necho 'SET'\necho 'ERROR:  boom' >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let target = ConnectionConfig::new("127.0.0.1", 5432, "app", "admin", "pw");
        let result = PsqlExecutor::new(&fake).run(Path::new("dump.sql"), &target).await.unwrap();

        assert_eq!(result.status, 3);
        assert!(!result.success());
        assert_eq!(result.stdout.trim(), "SET");
        assert!(result.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn test_missing_psql_binary() {
        let target = ConnectionConfig::new("127.0.0.1", 5432, "app", "admin", "pw");
        let err = PsqlExecutor::new("/nonexistent/bin/psql")
            .run(Path::new("dump.sql"), &target)
            .await
            .unwrap_err();
        assert_eq!(err.category(), "Restore");
    }
}
