//! Local SQLite database layer for the outbox.
//!
//! Uses rusqlite with WAL mode. Holds the four durable tables the outbox
//! needs (tickets, lines, outbox entries, mapping) plus the settings table
//! the device context is read from, and applies versioned migrations.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{OutboxError, Result};

/// Shared database handle. Every store operation locks the connection for
/// the duration of one statement or transaction, never across an `.await`.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, mapping a poisoned mutex to an error.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| OutboxError::LockPoisoned)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "outbox.db";

/// Initialize the database at `{data_dir}/outbox.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. A failed open is reported and the file
/// is left in place.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path).map_err(|e| {
        error!(path = %db_path.display(), error = %e, "Database open failed");
        e
    })?;

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: tickets, lines, outbox, mapping, settings.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS local_tickets (
            local_id TEXT PRIMARY KEY,
            server_id TEXT,
            status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'paid')),
            total_amount INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            business_date TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_local_tickets_business_date
            ON local_tickets(business_date);
        CREATE INDEX IF NOT EXISTS idx_local_tickets_status
            ON local_tickets(status);

        CREATE TABLE IF NOT EXISTS local_lines (
            id TEXT PRIMARY KEY,
            local_ticket_id TEXT NOT NULL
                REFERENCES local_tickets(local_id) ON DELETE CASCADE,
            menu_item_id TEXT NOT NULL,
            qty INTEGER NOT NULL CHECK (qty > 0)
        );
        CREATE INDEX IF NOT EXISTS idx_local_lines_ticket
            ON local_lines(local_ticket_id);

        -- seq gives a total FIFO order when two entries share a timestamp
        CREATE TABLE IF NOT EXISTS outbox (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL
                CHECK (kind IN ('CreateTicket', 'AddLine', 'PayCash', 'PayMock')),
            idempotency_key TEXT NOT NULL UNIQUE,
            payload TEXT NOT NULL DEFAULT '{}',
            local_ticket_id TEXT NOT NULL,
            part_id TEXT,
            enqueued_at TEXT NOT NULL,
            try_count INTEGER NOT NULL DEFAULT 0 CHECK (try_count >= 0),
            last_error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_enqueued
            ON outbox(enqueued_at, seq);
        CREATE INDEX IF NOT EXISTS idx_outbox_ticket
            ON outbox(local_ticket_id);

        CREATE TABLE IF NOT EXISTS mapping (
            local_ticket_id TEXT PRIMARY KEY,
            server_ticket_id TEXT,
            mapped_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        let _ = conn.execute_batch("ROLLBACK;");
        e
    })?;

    info!("Applied migration v1 (tickets, lines, outbox, mapping)");
    Ok(())
}

/// Migration v2: dead-letter state on outbox entries.
fn migrate_v2(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "outbox", "status")? {
        conn.execute_batch(
            "ALTER TABLE outbox ADD COLUMN status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'dead_letter'));",
        )?;
    }
    if !column_exists(conn, "outbox", "dead_lettered_at")? {
        conn.execute_batch("ALTER TABLE outbox ADD COLUMN dead_lettered_at TEXT;")?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_outbox_status_order
            ON outbox(status, enqueued_at, seq);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        e
    })?;

    info!("Applied migration v2 (outbox dead-letter state)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Delete a single setting. Missing keys are not an error.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )?;
    Ok(())
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<()> {
    let removed = conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )?;
    if removed == 0 {
        warn!(category, "delete_all_settings: category was already empty");
    }
    Ok(())
}

/// In-memory database with pragmas and migrations applied (test helper).
#[cfg(test)]
pub(crate) fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations(&conn).expect("run_migrations should succeed in test");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
