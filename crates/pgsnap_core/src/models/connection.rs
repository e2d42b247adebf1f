//! Connection configuration models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// SSL mode for database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// No SSL (default; tunneled traffic is already encrypted)
    #[default]
    Disable,
    /// Use SSL if available
    Prefer,
    /// Require SSL, accept any certificate
    Require,
}

impl SslMode {
    /// Convert to the libpq spelling (also used for `PGSSLMODE`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "disable" => Some(Self::Disable),
            "prefer" => Some(Self::Prefer),
            "require" => Some(Self::Require),
            _ => None,
        }
    }
}

/// SSH bastion through which the database is reached.
#[derive(Clone, Serialize, Deserialize)]
pub struct SshBastion {
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Path to the private key used for authentication
    pub key_path: PathBuf,
    /// Passphrase for an encrypted private key
    #[serde(skip_serializing)]
    pub key_passphrase: Option<String>,
    /// known_hosts file to verify the server key against
    pub known_hosts_path: Option<PathBuf>,
    /// Upper bound on establishing the SSH session
    pub connect_timeout: Duration,
}

impl SshBastion {
    /// Default SSH port.
    pub const DEFAULT_PORT: u16 = 22;

    /// Default bound on SSH session establishment.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a bastion descriptor with default port and timeout.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            username: username.into(),
            key_path: key_path.into(),
            key_passphrase: None,
            known_hosts_path: None,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Display form `user@host:port`.
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

impl fmt::Debug for SshBastion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshBastion")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_path", &self.key_path)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("known_hosts_path", &self.known_hosts_path)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Configuration for a database connection.
///
/// Built once from validated environment input and never mutated. Tunneled
/// runs derive a copy with [`ConnectionConfig::through`].
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server hostname or IP
    pub host: String,
    /// Server port (default 5432)
    pub port: u16,
    /// Database name
    pub database: String,
    /// Login username
    pub username: String,
    /// Login password
    #[serde(skip_serializing)]
    pub password: String,
    /// SSL configuration
    pub ssl_mode: SslMode,
    /// Optional SSH bastion
    pub ssh: Option<SshBastion>,
    /// Application name sent to PostgreSQL
    pub application_name: String,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Create a new connection configuration with required fields.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            username: username.into(),
            password: password.into(),
            ssl_mode: SslMode::default(),
            ssh: None,
            application_name: "pgsnap".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Attach an SSH bastion.
    pub fn with_ssh(mut self, bastion: SshBastion) -> Self {
        self.ssh = Some(bastion);
        self
    }

    /// Set the SSL mode.
    pub fn with_ssl_mode(mut self, ssl_mode: SslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    /// Whether the database is reached through a bastion.
    pub fn uses_tunnel(&self) -> bool {
        self.ssh.is_some()
    }

    /// Copy of this configuration pointed at another endpoint (the local side
    /// of a tunnel). The bastion is dropped from the copy.
    pub fn through(&self, host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, ssh: None, ..self.clone() }
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        format!("postgresql://{}@{}:{}/{}", self.username, self.host, self.port, self.database)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .field("ssh", &self.ssh)
            .finish()
    }
}
