//! pgsnap - snapshot a bastion-guarded PostgreSQL database and restore it elsewhere.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use pgsnap_core::jobs::{ctrl_c, run_backup, run_restore, BackupOptions, RestoreOptions};
use pgsnap_core::logging::{init_logging, log_dir, verbose_log_filter, LogConfig};
use pgsnap_core::models::{CleanupMode, ExecutorKind, ProcessEnv, TunnelPolicy};
use pgsnap_core::{LiveConnector, SnapError};

#[derive(Debug, Parser)]
#[command(name = "pgsnap", version, about)]
struct Cli {
    /// Directory for rotating log files
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Log to stderr only
    #[arg(long, global = true)]
    no_log_file: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dump the source database to a SQL file
    Backup {
        /// Connect to the source without the SSH bastion
        #[arg(long)]
        direct: bool,

        /// Directory for the dump file (overrides BACKUP_DIR)
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },

    /// Apply a dump file to the restore target
    Restore {
        /// Dump file to restore; defaults to the latest in the backups directory
        path: Option<PathBuf>,

        /// Pre-restore cleanup: `grants` or `reset-schema` (drops all objects)
        #[arg(long, env = "RESTORE_CLEANUP", value_name = "MODE")]
        cleanup: CleanupMode,

        /// Require the SSH bastion even if no RESTORE_SSH_* variable is set
        #[arg(long)]
        tunnel: bool,

        /// Directory searched for the latest dump (overrides BACKUP_DIR)
        #[arg(long, value_name = "DIR")]
        backups_dir: Option<PathBuf>,

        /// How the script is applied: `psql` or `driver`
        #[arg(long, default_value_t = ExecutorKind::Psql, value_name = "KIND")]
        executor: ExecutorKind,

        /// psql binary (overrides PSQL_PATH)
        #[arg(long, value_name = "PATH")]
        psql: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Variables from .env must be visible before configuration is read.
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(usage_exit_code(&e));
        }
    };

    let log_dir = if cli.no_log_file { None } else { Some(cli.log_dir.clone().unwrap_or_else(log_dir)) };
    let mut log_config = LogConfig::new(log_dir);
    if cli.verbose {
        log_config = log_config.with_filter(verbose_log_filter());
    }
    let _logging_guard = init_logging(log_config);

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "Starting pgsnap");

    match run(cli.command, cli.json).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<SnapError>() {
                Some(snap) => eprintln!("{}", snap.report()),
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

/// Help and version requests succeed; every other usage error is a failed run.
fn usage_exit_code(err: &clap::Error) -> u8 {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

async fn run(command: Command, json: bool) -> anyhow::Result<()> {
    let connector = LiveConnector;

    match command {
        Command::Backup { direct, output_dir } => {
            let options = BackupOptions {
                tunnel: if direct { TunnelPolicy::Disabled } else { TunnelPolicy::Required },
                output_dir,
            };
            let report = run_backup(&ProcessEnv, options, &connector, ctrl_c()).await?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!(
                    "Backup written to {} ({} tables, {} rows)",
                    report.path.display(),
                    report.tables,
                    report.rows
                );
            }
        }
        Command::Restore { path, cleanup, tunnel, backups_dir, executor, psql } => {
            let options = RestoreOptions {
                dump: path,
                cleanup,
                tunnel: if tunnel { TunnelPolicy::Required } else { TunnelPolicy::Auto },
                backups_dir,
                executor,
                psql_path: psql,
            };
            let report = run_restore(&ProcessEnv, options, &connector, ctrl_c()).await?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                println!("Restored {} (cleanup: {})", report.path.display(), report.cleanup);
            }
            if !report.result.stdout.trim().is_empty() {
                tracing::debug!(stdout = %report.result.stdout.trim_end(), "Restore output");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_restore_requires_cleanup() {
        std::env::remove_var("RESTORE_CLEANUP");
        let parsed = Cli::try_parse_from(["pgsnap", "restore", "dump.sql"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_usage_errors_exit_with_one() {
        std::env::remove_var("RESTORE_CLEANUP");
        let err = Cli::try_parse_from(["pgsnap", "restore"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);

        let err = Cli::try_parse_from(["pgsnap", "backup", "--no-such-flag"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);
    }

    #[test]
    fn test_help_and_version_exit_with_zero() {
        let err = Cli::try_parse_from(["pgsnap", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert_eq!(usage_exit_code(&err), 0);

        let err = Cli::try_parse_from(["pgsnap", "--version"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
    }

    #[test]
    fn test_restore_arguments() {
        let cli = Cli::try_parse_from([
            "pgsnap",
            "-v",
            "restore",
            "--cleanup",
            "reset-schema",
            "--executor",
            "driver",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Restore { path, cleanup, executor, tunnel, .. } => {
                assert!(path.is_none());
                assert_eq!(cleanup, CleanupMode::ResetSchema);
                assert_eq!(executor, ExecutorKind::Driver);
                assert!(!tunnel);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_backup_arguments() {
        let cli = Cli::try_parse_from(["pgsnap", "backup", "--direct", "--output-dir", "out", "--json"])
            .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Backup { direct, output_dir } => {
                assert!(direct);
                assert_eq!(output_dir, Some(PathBuf::from("out")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
