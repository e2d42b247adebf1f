//! Error types for pgsnap.
//!
//! Every failure in a backup or restore run is fatal and surfaces as one of
//! these variants. None of them are retried; the operator re-runs the tool.

use thiserror::Error;

/// Main error type for pgsnap.
#[derive(Debug, Error)]
pub enum SnapError {
    /// Missing or invalid configuration, detected before any network I/O.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
        /// Every offending environment variable name.
        variables: Vec<String>,
    },

    /// Database connection or authentication failed.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// SSH bastion connection, authentication, or channel error.
    #[error("SSH error: {message}")]
    Ssh {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement error reported by PostgreSQL.
    #[error("{message}")]
    Database {
        /// PostgreSQL error message.
        message: String,
        /// Additional detail from PostgreSQL.
        detail: Option<String>,
        /// PostgreSQL hint.
        hint: Option<String>,
        /// PostgreSQL error code (e.g., "42P01").
        code: Option<String>,
    },

    /// Catalog or row query failed while reading a table.
    #[error("Introspection error on table \"{table}\": {message}")]
    Introspection {
        /// Table being read when the failure occurred.
        table: String,
        /// Human-readable error message.
        message: String,
        /// PostgreSQL error code, when the server reported one.
        code: Option<String>,
    },

    /// A value could not be represented in the dump.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Human-readable error message.
        message: String,
    },

    /// Local file I/O error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The restore script did not run to completion.
    #[error("Restore failed: {message}")]
    RestoreExecution {
        /// Human-readable error message.
        message: String,
        /// Exit status of the execution step, if it produced one.
        status: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The run was interrupted by the operator.
    #[error("Interrupted")]
    Cancelled,

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl SnapError {
    // ========== Constructors ==========

    /// Create a config error naming the offending variables.
    pub fn config(message: impl Into<String>, variables: Vec<String>) -> Self {
        Self::Config { message: message.into(), variables }
    }

    /// Create a config error that is not tied to a variable.
    pub fn config_message(message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), variables: Vec::new() }
    }

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new SSH error with a hint.
    pub fn ssh_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Ssh { message: message.into(), hint: Some(hint.into()), source: None }
    }

    /// Create a new SSH error with source and hint.
    pub fn ssh_with_source(
        message: impl Into<String>,
        hint: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Ssh { message: message.into(), hint: Some(hint.into()), source: Some(Box::new(source)) }
    }

    /// Wrap an error raised while reading `table`.
    pub fn introspection(table: impl Into<String>, err: SnapError) -> Self {
        let code = err.pg_code().map(String::from);
        let message = match err {
            Self::Database { message, .. } => message,
            other => other.to_string(),
        };
        Self::Introspection { table: table.into(), message, code }
    }

    /// Create a new serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Create a new storage error with source.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage { message: message.into(), hint: None, source: Some(Box::new(source)) }
    }

    /// Create a restore execution error from captured output.
    pub fn restore_execution(
        message: impl Into<String>,
        status: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::RestoreExecution {
            message: message.into(),
            status,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Check if this error is a pre-flight configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Check if the run was interrupted.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "Config",
            Self::Connection { .. } => "Connection",
            Self::Ssh { .. } => "SSH",
            Self::Database { .. } => "Database",
            Self::Introspection { .. } => "Introspection",
            Self::Serialization { .. } => "Serialization",
            Self::Storage { .. } => "Storage",
            Self::RestoreExecution { .. } => "Restore",
            Self::Cancelled => "Cancelled",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the operator.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Config { .. } => Some("Set the listed variables in the environment or a .env file"),
            Self::Connection { .. } => Some("Check that the database server is running and reachable"),
            Self::Ssh { hint, .. } => hint.as_deref(),
            Self::Database { hint, .. } => hint.as_deref(),
            Self::Introspection { code, .. } => match code.as_deref() {
                Some("42501") => Some("The database user lacks read access to this table"),
                _ => None,
            },
            Self::Serialization { .. } => None,
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::RestoreExecution { .. } => {
                Some("The target may be partially restored; restore into a fresh instance")
            }
            Self::Cancelled => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get PostgreSQL error code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } | Self::Introspection { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Render the full operator-facing report for standard error.
    pub fn report(&self) -> String {
        let mut out = match self {
            Self::Database { .. } => format!("Database error: {self}"),
            _ => self.to_string(),
        };

        match self {
            Self::Config { variables, .. } if !variables.is_empty() => {
                for name in variables {
                    out.push_str(&format!("\n  - {name}"));
                }
            }
            Self::Database { detail: Some(detail), code, .. } => {
                out.push_str(&format!("\nDetail: {detail}"));
                if let Some(code) = code {
                    out.push_str(&format!("\nCode: {code}"));
                }
            }
            Self::RestoreExecution { status, stdout, stderr, .. } => {
                if let Some(status) = status {
                    out.push_str(&format!("\nExit status: {status}"));
                }
                if !stdout.trim().is_empty() {
                    out.push_str(&format!("\n--- stdout ---\n{}", stdout.trim_end()));
                }
                if !stderr.trim().is_empty() {
                    out.push_str(&format!("\n--- stderr ---\n{}", stderr.trim_end()));
                }
            }
            _ => {}
        }

        if let Some(hint) = self.hint() {
            out.push_str(&format!("\nHint: {hint}"));
        }
        out
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to SnapError.
impl From<tokio_postgres::Error> for SnapError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();

            match code_str {
                "28P01" | "28000" => {
                    return SnapError::Connection { message, source: Some(Box::new(err)) }
                }
                _ if code_str.starts_with("08") => {
                    return SnapError::Connection { message, source: Some(Box::new(err)) }
                }
                _ => {
                    return SnapError::Database {
                        message,
                        detail: db_err.detail().map(String::from),
                        hint: db_err.hint().map(String::from),
                        code: Some(code_str.to_string()),
                    }
                }
            }
        }

        if err.is_closed() {
            return SnapError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        SnapError::Connection { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from std::io::Error to SnapError.
impl From<std::io::Error> for SnapError {
    fn from(err: std::io::Error) -> Self {
        let hint = match err.kind() {
            std::io::ErrorKind::NotFound => "The file or directory was not found",
            std::io::ErrorKind::PermissionDenied => "Check file permissions",
            _ => "Check file permissions and disk space",
        };
        SnapError::Storage {
            message: err.to_string(),
            hint: Some(hint.to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to SnapError.
impl From<serde_json::Error> for SnapError {
    fn from(err: serde_json::Error) -> Self {
        SnapError::Serialization { message: format!("JSON error: {err}") }
    }
}

/// Convert from russh::Error to SnapError.
impl From<russh::Error> for SnapError {
    fn from(err: russh::Error) -> Self {
        SnapError::Ssh {
            message: err.to_string(),
            hint: Some("Verify the bastion host is reachable and allows TCP forwarding".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Result alias used across pgsnap.
pub type SnapResult<T> = Result<T, SnapError>;
