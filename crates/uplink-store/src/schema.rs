//! Database schema and migrations.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the database schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        // Fresh database
        create_schema_v1(conn)?;
        migrate(conn, 1)?;
    } else if version < SCHEMA_VERSION {
        migrate(conn, version)?;
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Create the queue tables (version 1).
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sensor_readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            sensor_kind TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            payload TEXT NOT NULL,
            metadata TEXT,
            upload_status INTEGER NOT NULL DEFAULT 0 CHECK (upload_status BETWEEN 0 AND 3),
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            error_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_owner_time
            ON sensor_readings(owner_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_owner_kind_time
            ON sensor_readings(owner_id, sensor_kind, timestamp);
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_status_time
            ON sensor_readings(upload_status, timestamp);

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            event_kind TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            properties TEXT,
            upload_status INTEGER NOT NULL DEFAULT 0 CHECK (upload_status BETWEEN 0 AND 3),
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            error_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_events_owner_time
            ON events(owner_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_owner_kind_time
            ON events(owner_id, event_kind, timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_status_time
            ON events(upload_status, timestamp);

        CREATE TABLE IF NOT EXISTS device_states (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            battery_level INTEGER NOT NULL CHECK (battery_level BETWEEN 0 AND 100),
            is_charging INTEGER NOT NULL,
            network_kind TEXT NOT NULL,
            available_storage INTEGER NOT NULL,
            is_screen_on INTEGER NOT NULL,
            orientation TEXT,
            extra_info TEXT,
            upload_status INTEGER NOT NULL DEFAULT 0 CHECK (upload_status BETWEEN 0 AND 3),
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            error_message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_device_states_owner_time
            ON device_states(owner_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_device_states_status_time
            ON device_states(upload_status, timestamp);

        CREATE TABLE IF NOT EXISTS upload_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            data_kind TEXT NOT NULL,
            batch_id TEXT NOT NULL UNIQUE,
            item_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            scheduled_at INTEGER NOT NULL,
            upload_status INTEGER NOT NULL DEFAULT 0 CHECK (upload_status BETWEEN 0 AND 3),
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            error_message TEXT,
            priority INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_upload_queue_drain
            ON upload_queue(upload_status, priority DESC, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_upload_queue_created
            ON upload_queue(upload_status, created_at);
        "#,
    )?;

    set_schema_version(conn, 1)?;
    Ok(())
}

/// Add the preference block (version 2).
fn migrate_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS preferences (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

/// Link item rows to the upload-queue batch they were last sent under
/// (version 3).
///
/// Rows that failed before the link existed have no batch to retry under
/// and go back to pending.
fn migrate_to_v3(conn: &Connection) -> Result<()> {
    for table in ["sensor_readings", "events", "device_states"] {
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN batch_id TEXT;
             CREATE INDEX IF NOT EXISTS idx_{table}_batch ON {table}(batch_id, upload_status);
             UPDATE {table} SET upload_status = 0 WHERE upload_status = 3;"
        ))?;
    }
    Ok(())
}

/// Run migrations from old_version to current.
fn migrate(conn: &Connection, old_version: i32) -> Result<()> {
    if old_version < 2 {
        migrate_to_v2(conn)?;
    }
    if old_version < 3 {
        migrate_to_v3(conn)?;
    }

    if old_version > 0 && old_version < SCHEMA_VERSION {
        info!("Migrated schema from v{} to v{}", old_version, SCHEMA_VERSION);
    }
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}
