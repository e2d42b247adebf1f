//! Restore execution models.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use crate::error::SnapResult;

/// Outcome of running a restore script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Exit status; 0 on success.
    pub status: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Which dump file to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpSource {
    /// An explicit file.
    Path(PathBuf),
    /// The most recently modified `.sql` file in a directory.
    LatestIn(PathBuf),
}

/// Preparation applied to the target before the script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupMode {
    /// Grant schema privileges to the restore user and PUBLIC.
    Grants,
    /// Drop and recreate the `public` schema, then grant.
    ResetSchema,
}

impl CleanupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grants => "grants",
            Self::ResetSchema => "reset-schema",
        }
    }

    /// Whether this mode destroys existing objects.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::ResetSchema)
    }
}

impl FromStr for CleanupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "grants" => Ok(Self::Grants),
            "reset-schema" | "reset_schema" => Ok(Self::ResetSchema),
            other => Err(format!("unknown cleanup mode '{other}' (expected grants or reset-schema)")),
        }
    }
}

impl fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Script executor selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// External `psql` process.
    #[default]
    Psql,
    /// Multi-statement execution over the driver.
    Driver,
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "psql" => Ok(Self::Psql),
            "driver" => Ok(Self::Driver),
            other => Err(format!("unknown executor '{other}' (expected psql or driver)")),
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Psql => "psql",
            Self::Driver => "driver",
        })
    }
}

/// Summary of a finished backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub path: PathBuf,
    pub tables: usize,
    pub rows: u64,
}

/// Summary of a finished restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub path: PathBuf,
    pub cleanup: CleanupMode,
    pub result: ExecutionResult,
}

impl BackupReport {
    /// Pretty JSON for machine consumers.
    pub fn to_json(&self) -> SnapResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl RestoreReport {
    pub fn to_json(&self) -> SnapResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_mode_parse() {
        assert_eq!("grants".parse::<CleanupMode>(), Ok(CleanupMode::Grants));
        assert_eq!("Reset-Schema".parse::<CleanupMode>(), Ok(CleanupMode::ResetSchema));
        assert!("everything".parse::<CleanupMode>().is_err());
        assert!(CleanupMode::ResetSchema.is_destructive());
    }

    #[test]
    fn test_reports_serialize_to_json() {
        let backup = BackupReport { path: PathBuf::from("/tmp/app.sql"), tables: 3, rows: 42 };
        let value: serde_json::Value = serde_json::from_str(&backup.to_json().unwrap()).unwrap();
        assert_eq!(value["path"], "/tmp/app.sql");
        assert_eq!(value["tables"], 3);
        assert_eq!(value["rows"], 42);

        let restore = RestoreReport {
            path: PathBuf::from("/tmp/app.sql"),
            cleanup: CleanupMode::Grants,
            result: ExecutionResult { status: 0, stdout: "SET\n".to_string(), stderr: String::new() },
        };
        let value: serde_json::Value = serde_json::from_str(&restore.to_json().unwrap()).unwrap();
        assert_eq!(value["result"]["status"], 0);
        assert_eq!(value["result"]["stdout"], "SET\n");
        assert_eq!(value["cleanup"], "grants");
    }

    #[test]
    fn test_executor_kind_parse() {
        assert_eq!("driver".parse::<ExecutorKind>(), Ok(ExecutorKind::Driver));
        assert_eq!(ExecutorKind::default(), ExecutorKind::Psql);
    }
}
