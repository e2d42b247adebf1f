//! Dump selection, completeness checks, and pre-restore cleanup.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{SnapError, SnapResult};
use crate::models::value::quote_ident;
use crate::models::{CleanupMode, DumpSource};
use crate::services::connection::Database;
use crate::services::dump::DUMP_COMPLETE_MARKER;

/// Bytes read from the end of a dump when looking for the marker.
const TAIL_BYTES: u64 = 4096;

/// Restore preparation helpers.
pub struct RestoreService;

impl RestoreService {
    /// Resolve a dump source to a file and check that it is complete.
    pub async fn resolve(source: &DumpSource) -> SnapResult<PathBuf> {
        let path = match source {
            DumpSource::Path(path) => {
                let is_file = tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false);
                if !is_file {
                    return Err(SnapError::config_message(format!(
                        "Dump file not found: {}",
                        path.display()
                    )));
                }
                path.clone()
            }
            DumpSource::LatestIn(dir) => Self::select_latest_dump(dir).await?,
        };

        Self::verify_complete(&path).await?;
        Ok(path)
    }

    /// Most recently modified `.sql` file directly inside `dir`.
    pub async fn select_latest_dump(dir: &Path) -> SnapResult<PathBuf> {
        let not_found = || {
            SnapError::config_message(format!("No .sql dump found in {}", dir.display()))
        };

        let mut entries = tokio::fs::read_dir(dir).await.map_err(|_| not_found())?;
        let mut latest: Option<(SystemTime, PathBuf)> = None;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_sql = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
            if !is_sql {
                continue;
            }

            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified()?;

            // Ties break on file name so the choice is stable.
            let newer = match &latest {
                None => true,
                Some((best, best_path)) => {
                    modified > *best || (modified == *best && path > *best_path)
                }
            };
            if newer {
                latest = Some((modified, path));
            }
        }

        let (_, path) = latest.ok_or_else(not_found)?;
        tracing::info!(path = %path.display(), "Selected latest dump");
        Ok(path)
    }

    /// Reject files whose last line is not the completion marker.
    pub async fn verify_complete(path: &Path) -> SnapResult<()> {
        let mut file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(TAIL_BYTES))).await?;

        let mut tail = Vec::new();
        file.read_to_end(&mut tail).await?;
        let tail = String::from_utf8_lossy(&tail);

        let last_line = tail.trim_end().lines().last().map(str::trim_end);
        if last_line != Some(DUMP_COMPLETE_MARKER) {
            return Err(SnapError::config_message(format!(
                "Dump {} is incomplete (missing \"{DUMP_COMPLETE_MARKER}\"); refusing to restore",
                path.display()
            )));
        }
        Ok(())
    }

    /// Statements run before the script for `mode`.
    pub fn cleanup_sql(mode: CleanupMode, username: &str) -> String {
        let grants = format!(
            "GRANT ALL ON SCHEMA public TO {};\nGRANT ALL ON SCHEMA public TO public;\n",
            quote_ident(username)
        );
        match mode {
            CleanupMode::Grants => grants,
            CleanupMode::ResetSchema => {
                format!("DROP SCHEMA IF EXISTS public CASCADE;\nCREATE SCHEMA public;\n{grants}")
            }
        }
    }

    /// Run the cleanup statements for `mode` on `db`.
    pub async fn cleanup(db: &Database, mode: CleanupMode, username: &str) -> SnapResult<()> {
        if mode.is_destructive() {
            tracing::warn!(mode = mode.as_str(), "Dropping and recreating schema public");
        }
        db.batch_execute(&Self::cleanup_sql(mode, username)).await?;
        tracing::info!(mode = mode.as_str(), "Cleanup complete");
        Ok(())
    }
}
