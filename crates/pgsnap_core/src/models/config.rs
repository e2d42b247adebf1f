//! Run configuration built once from the environment.
//!
//! All variables are read and validated up front. Every missing or invalid
//! name is collected so the operator sees the whole list in one run, and no
//! component is constructed until the configuration is complete.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{SnapError, SnapResult};
use crate::models::connection::{ConnectionConfig, SshBastion, SslMode};

/// Source of configuration variables.
pub trait EnvSource {
    /// Look up a variable. Empty values are treated as unset by the reader.
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Whether a run goes through an SSH bastion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPolicy {
    /// Always tunnel; the SSH variables are required.
    Required,
    /// Tunnel only if any of the SSH host/user/key variables is set.
    Auto,
    /// Connect directly; SSH variables are ignored.
    Disabled,
}

/// Reads variables under a prefix and accumulates problems.
struct EnvReader<'a> {
    env: &'a dyn EnvSource,
    prefix: &'static str,
    missing: Vec<String>,
    invalid: Vec<String>,
}

impl<'a> EnvReader<'a> {
    fn new(env: &'a dyn EnvSource, prefix: &'static str) -> Self {
        Self { env, prefix, missing: Vec::new(), invalid: Vec::new() }
    }

    fn name(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    fn optional(&self, suffix: &str) -> Option<String> {
        self.env
            .var(&self.name(suffix))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn is_set(&self, suffix: &str) -> bool {
        self.optional(suffix).is_some()
    }

    fn required(&mut self, suffix: &str) -> String {
        match self.optional(suffix) {
            Some(value) => value,
            None => {
                self.missing.push(self.name(suffix));
                String::new()
            }
        }
    }

    /// Passwords keep surrounding whitespace.
    fn required_secret(&mut self, suffix: &str) -> String {
        let name = self.name(suffix);
        match self.env.var(&name).filter(|v| !v.is_empty()) {
            Some(value) => value,
            None => {
                self.missing.push(name);
                String::new()
            }
        }
    }

    fn port(&mut self, suffix: &str, default: Option<u16>) -> u16 {
        let raw = match default {
            Some(default) => match self.optional(suffix) {
                Some(raw) => raw,
                None => return default,
            },
            None => {
                let raw = self.required(suffix);
                if raw.is_empty() {
                    return 0;
                }
                raw
            }
        };

        match raw.parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                self.invalid.push(format!("{} (not a valid port: {raw})", self.name(suffix)));
                0
            }
        }
    }

    fn seconds(&mut self, suffix: &str, default: Duration) -> Duration {
        match self.optional(suffix) {
            None => default,
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    self.invalid.push(format!("{} (not a positive number of seconds: {raw})", self.name(suffix)));
                    default
                }
            },
        }
    }

    fn ssl_mode(&mut self, suffix: &str) -> SslMode {
        match self.optional(suffix) {
            None => SslMode::default(),
            Some(raw) => SslMode::parse(&raw).unwrap_or_else(|| {
                self.invalid
                    .push(format!("{} (expected disable, prefer or require: {raw})", self.name(suffix)));
                SslMode::default()
            }),
        }
    }

    fn existing_file(&mut self, suffix: &str) -> PathBuf {
        let raw = self.required(suffix);
        let path = PathBuf::from(&raw);
        if !raw.is_empty() && !path.is_file() {
            self.invalid.push(format!("{} (file not found: {raw})", self.name(suffix)));
        }
        path
    }

    /// Read the database block: `{prefix}DB_*`.
    fn database(&mut self) -> ConnectionConfig {
        let host = self.required("DB_HOST");
        let port = self.port("DB_PORT", None);
        let database = self.required("DB_NAME");
        let username = self.required("DB_USER");
        let password = self.required_secret("DB_PASSWORD");
        let ssl_mode = self.ssl_mode("DB_SSL_MODE");

        ConnectionConfig::new(host, port, database, username, password).with_ssl_mode(ssl_mode)
    }

    /// Read the bastion block: `{prefix}SSH_*`.
    fn bastion(&mut self, policy: TunnelPolicy) -> Option<SshBastion> {
        let wanted = match policy {
            TunnelPolicy::Required => true,
            TunnelPolicy::Disabled => false,
            TunnelPolicy::Auto => {
                self.is_set("SSH_HOST") || self.is_set("SSH_USER") || self.is_set("SSH_PRIVATE_KEY_PATH")
            }
        };
        if !wanted {
            return None;
        }

        let host = self.required("SSH_HOST");
        let username = self.required("SSH_USER");
        let key_path = self.existing_file("SSH_PRIVATE_KEY_PATH");
        let port = self.port("SSH_PORT", Some(SshBastion::DEFAULT_PORT));
        let connect_timeout =
            self.seconds("SSH_CONNECT_TIMEOUT_SECS", SshBastion::DEFAULT_CONNECT_TIMEOUT);

        let mut bastion = SshBastion::new(host, username, key_path).with_port(port);
        bastion.key_passphrase = self.env.var(&self.name("SSH_KEY_PASSPHRASE")).filter(|v| !v.is_empty());
        bastion.known_hosts_path = self.optional("SSH_KNOWN_HOSTS_PATH").map(PathBuf::from);
        bastion.connect_timeout = connect_timeout;
        Some(bastion)
    }

    fn finish(self) -> SnapResult<()> {
        if self.missing.is_empty() && self.invalid.is_empty() {
            return Ok(());
        }

        let message = match (self.missing.is_empty(), self.invalid.is_empty()) {
            (false, true) => "Missing required environment variables",
            (true, false) => "Invalid environment variables",
            _ => "Missing or invalid environment variables",
        };
        let mut variables = self.missing;
        variables.extend(self.invalid);
        Err(SnapError::config(message, variables))
    }
}

/// Configuration for a backup run.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Source database, with its bastion when tunneling
    pub source: ConnectionConfig,
    /// Schema whose tables are dumped
    pub schema: String,
    /// Directory receiving dump files
    pub output_dir: PathBuf,
}

impl BackupConfig {
    /// Default schema.
    pub const DEFAULT_SCHEMA: &'static str = "public";

    /// Default backups directory.
    pub const DEFAULT_DIR: &'static str = "backups";

    /// Load from `DB_*` / `SSH_*` variables.
    pub fn load(env: &dyn EnvSource, policy: TunnelPolicy) -> SnapResult<Self> {
        let mut reader = EnvReader::new(env, "");
        let source = reader.database();
        let bastion = reader.bastion(policy);
        let schema = reader.optional("DB_SCHEMA").unwrap_or_else(|| Self::DEFAULT_SCHEMA.to_string());
        let output_dir =
            PathBuf::from(reader.optional("BACKUP_DIR").unwrap_or_else(|| Self::DEFAULT_DIR.to_string()));
        reader.finish()?;

        let source = match bastion {
            Some(bastion) => source.with_ssh(bastion),
            None => source,
        };
        Ok(Self { source, schema, output_dir })
    }

    /// Override the output directory (command-line flag).
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }
}

/// Configuration for a restore run.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Target database, with its bastion when tunneling
    pub target: ConnectionConfig,
    /// Directory searched when no dump path is given
    pub backups_dir: PathBuf,
    /// psql binary used by the default executor
    pub psql_path: PathBuf,
}

impl RestoreConfig {
    /// Load from `RESTORE_DB_*` / `RESTORE_SSH_*` variables.
    pub fn load(env: &dyn EnvSource, policy: TunnelPolicy) -> SnapResult<Self> {
        let mut reader = EnvReader::new(env, "RESTORE_");
        let target = reader.database();
        let bastion = reader.bastion(policy);
        reader.finish()?;

        let backups_dir = PathBuf::from(
            env.var("BACKUP_DIR")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| BackupConfig::DEFAULT_DIR.to_string()),
        );
        let psql_path = PathBuf::from(
            env.var("PSQL_PATH").filter(|v| !v.trim().is_empty()).unwrap_or_else(|| "psql".to_string()),
        );

        let target = match bastion {
            Some(bastion) => target.with_ssh(bastion),
            None => target,
        };
        Ok(Self { target, backups_dir, psql_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn backup_env(key: &NamedTempFile) -> HashMap<String, String> {
        let key_path = key.path().to_string_lossy().to_string();
        let mut vars = env(&[
            ("DB_HOST", "10.0.0.5"),
            ("DB_PORT", "5432"),
            ("DB_NAME", "app"),
            ("DB_USER", "reader"),
            ("DB_PASSWORD", "pw"),
            ("SSH_HOST", "bastion.example.com"),
            ("SSH_USER", "ops"),
        ]);
        vars.insert("SSH_PRIVATE_KEY_PATH".to_string(), key_path);
        vars
    }

    fn config_variables(err: SnapError) -> Vec<String> {
        match err {
            SnapError::Config { variables, .. } => variables,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_backup_loads_with_defaults() {
        let key = NamedTempFile::new().unwrap();
        let config = BackupConfig::load(&backup_env(&key), TunnelPolicy::Required).unwrap();

        assert_eq!(config.source.host, "10.0.0.5");
        assert_eq!(config.schema, "public");
        assert_eq!(config.output_dir, PathBuf::from("backups"));
        let bastion = config.source.ssh.expect("bastion");
        assert_eq!(bastion.port, 22);
        assert_eq!(bastion.username, "ops");
    }

    #[test]
    fn test_backup_reports_every_missing_variable() {
        let vars = env(&[("DB_HOST", "h"), ("DB_PORT", "5432")]);
        let err = BackupConfig::load(&vars, TunnelPolicy::Required).unwrap_err();
        let names = config_variables(err);

        for expected in
            ["DB_NAME", "DB_USER", "DB_PASSWORD", "SSH_HOST", "SSH_USER", "SSH_PRIVATE_KEY_PATH"]
        {
            assert!(names.iter().any(|n| n == expected), "{expected} not reported in {names:?}");
        }
        assert!(!names.iter().any(|n| n == "SSH_PORT"));
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let key = NamedTempFile::new().unwrap();
        let mut vars = backup_env(&key);
        vars.insert("DB_USER".to_string(), "   ".to_string());
        let names = config_variables(BackupConfig::load(&vars, TunnelPolicy::Required).unwrap_err());
        assert_eq!(names, vec!["DB_USER".to_string()]);
    }

    #[test]
    fn test_invalid_port_and_missing_key_file() {
        let key = NamedTempFile::new().unwrap();
        let mut vars = backup_env(&key);
        vars.insert("DB_PORT".to_string(), "fivefour".to_string());
        vars.insert("SSH_PRIVATE_KEY_PATH".to_string(), "/nonexistent/id_rsa".to_string());

        let names = config_variables(BackupConfig::load(&vars, TunnelPolicy::Required).unwrap_err());
        assert!(names.iter().any(|n| n.starts_with("DB_PORT")));
        assert!(names.iter().any(|n| n.starts_with("SSH_PRIVATE_KEY_PATH")));
    }

    #[test]
    fn test_direct_backup_ignores_ssh() {
        let vars = env(&[
            ("DB_HOST", "h"),
            ("DB_PORT", "5432"),
            ("DB_NAME", "d"),
            ("DB_USER", "u"),
            ("DB_PASSWORD", "p"),
        ]);
        let config = BackupConfig::load(&vars, TunnelPolicy::Disabled).unwrap();
        assert!(!config.source.uses_tunnel());
    }

    #[test]
    fn test_restore_tunnels_only_when_ssh_vars_present() {
        let base = [
            ("RESTORE_DB_HOST", "staging"),
            ("RESTORE_DB_PORT", "5433"),
            ("RESTORE_DB_NAME", "app"),
            ("RESTORE_DB_USER", "admin"),
            ("RESTORE_DB_PASSWORD", "pw"),
        ];
        let direct = RestoreConfig::load(&env(&base), TunnelPolicy::Auto).unwrap();
        assert!(!direct.target.uses_tunnel());
        assert_eq!(direct.target.port, 5433);
        assert_eq!(direct.psql_path, PathBuf::from("psql"));

        let mut partial = env(&base);
        partial.insert("RESTORE_SSH_HOST".to_string(), "bastion".to_string());
        let names = config_variables(RestoreConfig::load(&partial, TunnelPolicy::Auto).unwrap_err());
        assert!(names.contains(&"RESTORE_SSH_USER".to_string()));
        assert!(names.contains(&"RESTORE_SSH_PRIVATE_KEY_PATH".to_string()));
    }

    #[test]
    fn test_invalid_ssl_mode_reported() {
        let vars = env(&[
            ("DB_HOST", "h"),
            ("DB_PORT", "5432"),
            ("DB_NAME", "d"),
            ("DB_USER", "u"),
            ("DB_PASSWORD", "p"),
            ("DB_SSL_MODE", "sometimes"),
        ]);
        let names = config_variables(BackupConfig::load(&vars, TunnelPolicy::Disabled).unwrap_err());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("DB_SSL_MODE"));
    }
}
