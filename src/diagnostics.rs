//! Diagnostics for The Small POS outbox.
//!
//! - **About info**: version, git SHA, platform
//! - **Outbox health**: queue depth, retries, dead letters, last flush
//! - **Log rotation helpers**: used by `lib.rs` when configuring the
//!   rolling log files.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db::DbState;
use crate::error::Result;
use crate::outbox::{self, SyncStatus};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "outbox";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Outbox health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxHealth {
    #[serde(flatten)]
    pub queue: SyncStatus,
    pub schema_version: i64,
    pub last_flush_at: Option<DateTime<Utc>>,
    /// Most recent failures of still-pending entries, newest first.
    pub recent_errors: Vec<Value>,
}

pub fn get_outbox_health(db: &DbState, last_flush_at: Option<DateTime<Utc>>) -> Result<OutboxHealth> {
    let conn = db.lock()?;
    let queue = outbox::sync_status(&conn)?;
    let schema_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT id, kind, local_ticket_id, try_count, last_error, status
         FROM outbox
         WHERE last_error IS NOT NULL
         ORDER BY seq DESC
         LIMIT 20",
    )?;
    let recent_errors = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "kind": row.get::<_, String>(1)?,
                "localTicketId": row.get::<_, String>(2)?,
                "tryCount": row.get::<_, i64>(3)?,
                "lastError": row.get::<_, Option<String>>(4)?,
                "status": row.get::<_, String>(5)?,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(OutboxHealth {
        queue,
        schema_version,
        last_flush_at,
        recent_errors,
    })
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Prune old log files in `log_dir`, keeping the most recent `keep`.
/// Returns how many files were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first; name breaks ties since daily files sort by date.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;
    use crate::device::DeviceContext;
    use crate::outbox::{Command, NewCommand};
    use chrono::NaiveDate;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pos-outbox-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
    }

    #[test]
    fn test_outbox_health_reports_failures() {
        let db = test_state();
        let ctx = DeviceContext::new("till-1", NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()).unwrap();
        {
            let conn = db.lock().unwrap();
            let entry = outbox::enqueue(&conn, &ctx, NewCommand::new("T1", Command::CreateTicket)).unwrap();
            outbox::record_failure(&conn, &entry.id, "503 unavailable").unwrap();
            outbox::enqueue(&conn, &ctx, NewCommand::new("T2", Command::CreateTicket)).unwrap();
        }

        let health = get_outbox_health(&db, None).unwrap();
        assert_eq!(health.queue.pending, 2);
        assert_eq!(health.queue.retrying, 1);
        assert!(health.schema_version >= 2);
        assert_eq!(health.recent_errors.len(), 1);
        assert_eq!(health.recent_errors[0]["lastError"], "503 unavailable");

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["pending"], 2);
    }

    #[test]
    fn test_prune_keeps_newest_logs_only() {
        let dir = scratch_dir();
        for day in 1..=5 {
            fs::write(dir.join(format!("{LOG_FILE_PREFIX}.2026-10-0{day}")), "x").unwrap();
        }
        fs::write(dir.join("notes.txt"), "keep me").unwrap();

        assert_eq!(prune_old_logs(&dir, 3), 2);

        let mut left: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), 4);
        assert!(left.contains(&"notes.txt".to_string()));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = std::env::temp_dir().join("pos-outbox-logs-missing-dir");
        assert_eq!(prune_old_logs(&dir, 1), 0);
    }
}
