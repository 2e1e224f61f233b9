//! Main store implementation.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use uplink_types::{EpochMillis, UploadStatus, ValueMap};

use crate::error::{Error, Result};
use crate::models::{DeviceState, Event, PendingCounts, PurgeCounts, SensorReading, UploadBatch};
use crate::queries::RecordQuery;
use crate::schema;
use crate::status::StatusTable;

/// SQLite-backed queue of telemetry awaiting upload.
///
/// The store exclusively owns every queued row. Components receive the
/// handle explicitly (see `uplink_core::SharedStore`); there is no global
/// instance.
pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Close the database, flushing outstanding writes.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::Database(e))
    }
}

fn encode_map(map: &ValueMap) -> Result<String> {
    Ok(serde_json::to_string(map)?)
}

fn encode_optional_map(map: Option<&ValueMap>) -> Result<Option<String>> {
    map.map(encode_map).transpose()
}

fn storage_to_sql(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn run_query<T: StatusTable>(store: &Store, query: RecordQuery) -> Result<Vec<T>> {
    store.query::<T>(&query)
}

// Sensor reading operations
impl Store {
    fn insert_reading_tx(tx: &Transaction<'_>, reading: &SensorReading) -> Result<i64> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO sensor_readings (owner_id, sensor_kind, timestamp, payload, metadata,
             upload_status, retry_count, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.execute(rusqlite::params![
            reading.owner_id,
            reading.sensor_kind,
            reading.timestamp,
            encode_map(&reading.payload)?,
            encode_optional_map(reading.metadata.as_ref())?,
            reading.upload_status.code(),
            reading.retry_count,
            reading.error_message,
        ])?;
        Ok(tx.last_insert_rowid())
    }

    /// Insert a sensor reading. Returns the assigned row ID.
    pub fn insert_sensor_reading(&self, reading: &SensorReading) -> Result<i64> {
        let mut ids = self.insert_sensor_readings(std::slice::from_ref(reading))?;
        ids.pop().ok_or(Error::Database(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Insert sensor readings in one transaction.
    ///
    /// Returns the assigned row IDs in input order.
    pub fn insert_sensor_readings(&self, readings: &[SensorReading]) -> Result<Vec<i64>> {
        let tx = self.conn.unchecked_transaction()?;
        let ids = readings
            .iter()
            .map(|r| Self::insert_reading_tx(&tx, r))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;

        debug!("Inserted {} sensor readings", ids.len());
        Ok(ids)
    }

    /// Replace a sensor reading row. Uploaded rows are never modified.
    ///
    /// Returns whether a row was updated.
    pub fn update_sensor_reading(&self, reading: &SensorReading) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE sensor_readings SET owner_id = ?2, sensor_kind = ?3, timestamp = ?4,
             payload = ?5, metadata = ?6, upload_status = ?7, retry_count = ?8,
             error_message = ?9
             WHERE id = ?1 AND upload_status != ?10",
            rusqlite::params![
                reading.id,
                reading.owner_id,
                reading.sensor_kind,
                reading.timestamp,
                encode_map(&reading.payload)?,
                encode_optional_map(reading.metadata.as_ref())?,
                reading.upload_status.code(),
                reading.retry_count,
                reading.error_message,
                UploadStatus::Uploaded.code(),
            ],
        )?;
        Ok(updated > 0)
    }

    /// All readings of an owner, newest first.
    pub fn sensor_readings_for_owner(&self, owner_id: &str) -> Result<Vec<SensorReading>> {
        run_query(self, RecordQuery::new().owner(owner_id))
    }

    /// Readings of an owner for one sensor kind, newest first.
    pub fn sensor_readings_by_kind(
        &self,
        owner_id: &str,
        sensor_kind: &str,
    ) -> Result<Vec<SensorReading>> {
        run_query(self, RecordQuery::new().owner(owner_id).kind(sensor_kind))
    }

    /// Readings of an owner with `start <= timestamp <= end`, oldest first.
    pub fn sensor_readings_in_range(
        &self,
        owner_id: &str,
        start: EpochMillis,
        end: EpochMillis,
    ) -> Result<Vec<SensorReading>> {
        run_query(
            self,
            RecordQuery::new()
                .owner(owner_id)
                .since(start)
                .until(end)
                .oldest_first(),
        )
    }
}

// Event operations
impl Store {
    fn insert_event_tx(tx: &Transaction<'_>, event: &Event) -> Result<i64> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO events (owner_id, event_kind, timestamp, properties,
             upload_status, retry_count, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.execute(rusqlite::params![
            event.owner_id,
            event.event_kind,
            event.timestamp,
            encode_optional_map(event.properties.as_ref())?,
            event.upload_status.code(),
            event.retry_count,
            event.error_message,
        ])?;
        Ok(tx.last_insert_rowid())
    }

    /// Record an event. Returns the assigned row ID.
    pub fn insert_event(&self, event: &Event) -> Result<i64> {
        let mut ids = self.insert_events(std::slice::from_ref(event))?;
        ids.pop().ok_or(Error::Database(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Record events in one transaction, returning IDs in input order.
    pub fn insert_events(&self, events: &[Event]) -> Result<Vec<i64>> {
        let tx = self.conn.unchecked_transaction()?;
        let ids = events
            .iter()
            .map(|e| Self::insert_event_tx(&tx, e))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;

        debug!("Inserted {} events", ids.len());
        Ok(ids)
    }

    /// Replace an event row. Uploaded rows are never modified.
    pub fn update_event(&self, event: &Event) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE events SET owner_id = ?2, event_kind = ?3, timestamp = ?4,
             properties = ?5, upload_status = ?6, retry_count = ?7, error_message = ?8
             WHERE id = ?1 AND upload_status != ?9",
            rusqlite::params![
                event.id,
                event.owner_id,
                event.event_kind,
                event.timestamp,
                encode_optional_map(event.properties.as_ref())?,
                event.upload_status.code(),
                event.retry_count,
                event.error_message,
                UploadStatus::Uploaded.code(),
            ],
        )?;
        Ok(updated > 0)
    }

    /// All events of an owner, newest first.
    pub fn events_for_owner(&self, owner_id: &str) -> Result<Vec<Event>> {
        run_query(self, RecordQuery::new().owner(owner_id))
    }

    /// Events of an owner for one event kind, newest first.
    pub fn events_by_kind(&self, owner_id: &str, event_kind: &str) -> Result<Vec<Event>> {
        run_query(self, RecordQuery::new().owner(owner_id).kind(event_kind))
    }

    /// Events of an owner with `start <= timestamp <= end`, oldest first.
    pub fn events_in_range(
        &self,
        owner_id: &str,
        start: EpochMillis,
        end: EpochMillis,
    ) -> Result<Vec<Event>> {
        run_query(
            self,
            RecordQuery::new()
                .owner(owner_id)
                .since(start)
                .until(end)
                .oldest_first(),
        )
    }
}

// Device state operations
impl Store {
    fn insert_device_state_tx(tx: &Transaction<'_>, state: &DeviceState) -> Result<i64> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO device_states (owner_id, timestamp, battery_level, is_charging,
             network_kind, available_storage, is_screen_on, orientation, extra_info,
             upload_status, retry_count, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        stmt.execute(rusqlite::params![
            state.owner_id,
            state.timestamp,
            state.battery_level.min(100),
            state.is_charging,
            state.network_kind.as_str(),
            storage_to_sql(state.available_storage),
            state.is_screen_on,
            state.orientation,
            encode_optional_map(state.extra_info.as_ref())?,
            state.upload_status.code(),
            state.retry_count,
            state.error_message,
        ])?;
        Ok(tx.last_insert_rowid())
    }

    /// Record a device-state snapshot. Returns the assigned row ID.
    pub fn insert_device_state(&self, state: &DeviceState) -> Result<i64> {
        let mut ids = self.insert_device_states(std::slice::from_ref(state))?;
        ids.pop().ok_or(Error::Database(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Record snapshots in one transaction, returning IDs in input order.
    pub fn insert_device_states(&self, states: &[DeviceState]) -> Result<Vec<i64>> {
        let tx = self.conn.unchecked_transaction()?;
        let ids = states
            .iter()
            .map(|s| Self::insert_device_state_tx(&tx, s))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;

        debug!("Inserted {} device states", ids.len());
        Ok(ids)
    }

    /// Replace a device-state row. Uploaded rows are never modified.
    pub fn update_device_state(&self, state: &DeviceState) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE device_states SET owner_id = ?2, timestamp = ?3, battery_level = ?4,
             is_charging = ?5, network_kind = ?6, available_storage = ?7, is_screen_on = ?8,
             orientation = ?9, extra_info = ?10, upload_status = ?11, retry_count = ?12,
             error_message = ?13
             WHERE id = ?1 AND upload_status != ?14",
            rusqlite::params![
                state.id,
                state.owner_id,
                state.timestamp,
                state.battery_level.min(100),
                state.is_charging,
                state.network_kind.as_str(),
                storage_to_sql(state.available_storage),
                state.is_screen_on,
                state.orientation,
                encode_optional_map(state.extra_info.as_ref())?,
                state.upload_status.code(),
                state.retry_count,
                state.error_message,
                UploadStatus::Uploaded.code(),
            ],
        )?;
        Ok(updated > 0)
    }

    /// All snapshots of an owner, newest first.
    pub fn device_states_for_owner(&self, owner_id: &str) -> Result<Vec<DeviceState>> {
        run_query(self, RecordQuery::new().owner(owner_id))
    }

    /// Snapshots of an owner with `start <= timestamp <= end`, oldest first.
    pub fn device_states_in_range(
        &self,
        owner_id: &str,
        start: EpochMillis,
        end: EpochMillis,
    ) -> Result<Vec<DeviceState>> {
        run_query(
            self,
            RecordQuery::new()
                .owner(owner_id)
                .since(start)
                .until(end)
                .oldest_first(),
        )
    }

    /// The most recent snapshot of an owner.
    pub fn latest_device_state(&self, owner_id: &str) -> Result<Option<DeviceState>> {
        let mut states: Vec<DeviceState> =
            run_query(self, RecordQuery::new().owner(owner_id).limit(1))?;
        Ok(states.pop())
    }
}

// Upload queue operations
impl Store {
    /// Insert an upload batch row. Returns the assigned row ID.
    ///
    /// Fails if the batch ID is already present.
    pub fn insert_batch(&self, batch: &UploadBatch) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO upload_queue (owner_id, data_kind, batch_id, item_count, created_at,
             scheduled_at, upload_status, retry_count, error_message, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                batch.owner_id,
                batch.data_kind.as_str(),
                batch.batch_id,
                batch.item_count,
                batch.created_at,
                batch.scheduled_at,
                batch.upload_status.code(),
                batch.retry_count,
                batch.error_message,
                batch.priority,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Replace a batch row. Uploaded rows are never modified.
    pub fn update_batch(&self, batch: &UploadBatch) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE upload_queue SET owner_id = ?2, data_kind = ?3, batch_id = ?4,
             item_count = ?5, created_at = ?6, scheduled_at = ?7, upload_status = ?8,
             retry_count = ?9, error_message = ?10, priority = ?11
             WHERE id = ?1 AND upload_status != ?12",
            rusqlite::params![
                batch.id,
                batch.owner_id,
                batch.data_kind.as_str(),
                batch.batch_id,
                batch.item_count,
                batch.created_at,
                batch.scheduled_at,
                batch.upload_status.code(),
                batch.retry_count,
                batch.error_message,
                batch.priority,
                UploadStatus::Uploaded.code(),
            ],
        )?;
        Ok(updated > 0)
    }

    /// All batches in drain order (priority descending, then scheduled time).
    pub fn all_batches(&self) -> Result<Vec<UploadBatch>> {
        let sql = format!(
            "SELECT {} FROM upload_queue ORDER BY {}",
            UploadBatch::COLUMNS,
            UploadBatch::DRAIN_ORDER
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let batches = stmt
            .query_map([], UploadBatch::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    /// Pending batches whose scheduled time has arrived, in drain order.
    pub fn pending_batches(&self, now: EpochMillis, limit: u32) -> Result<Vec<UploadBatch>> {
        let sql = format!(
            "SELECT {} FROM upload_queue
             WHERE upload_status = ?1 AND scheduled_at <= ?2
             ORDER BY {} LIMIT ?3",
            UploadBatch::COLUMNS,
            UploadBatch::DRAIN_ORDER
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let batches = stmt
            .query_map(
                rusqlite::params![UploadStatus::Pending.code(), now, limit],
                UploadBatch::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    /// Failed batches below the retry ceiling whose scheduled time has
    /// arrived, in drain order.
    pub fn failed_batches(
        &self,
        now: EpochMillis,
        max_retries: u32,
        limit: u32,
    ) -> Result<Vec<UploadBatch>> {
        let sql = format!(
            "SELECT {} FROM upload_queue
             WHERE upload_status = ?1 AND retry_count < ?2 AND scheduled_at <= ?3
             ORDER BY {} LIMIT ?4",
            UploadBatch::COLUMNS,
            UploadBatch::DRAIN_ORDER
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let batches = stmt
            .query_map(
                rusqlite::params![UploadStatus::Failed.code(), max_retries, now, limit],
                UploadBatch::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    /// Fetch a batch by its batch ID.
    pub fn batch_by_id(&self, batch_id: &str) -> Result<Option<UploadBatch>> {
        let sql = format!(
            "SELECT {} FROM upload_queue WHERE batch_id = ?",
            UploadBatch::COLUMNS
        );
        let batch = self
            .conn
            .query_row(&sql, [batch_id], UploadBatch::from_row)
            .optional()?;
        Ok(batch)
    }

    /// Delete a batch by its batch ID. Returns whether a row was removed.
    pub fn delete_batch(&self, batch_id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM upload_queue WHERE batch_id = ?", [batch_id])?;
        Ok(deleted > 0)
    }

    /// Mark an in-flight batch failed, recording `error`, incrementing its
    /// retry count and moving its scheduled time to `next_scheduled_at`.
    ///
    /// Returns whether the batch changed; a batch that is not `Uploading` is
    /// left alone. Fails with [`Error::BatchNotFound`] for an unknown ID.
    pub fn fail_batch(
        &self,
        batch_id: &str,
        error: &str,
        next_scheduled_at: EpochMillis,
    ) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE upload_queue SET upload_status = ?1, error_message = ?2,
             retry_count = retry_count + 1, scheduled_at = ?3
             WHERE batch_id = ?4 AND upload_status = ?5",
            rusqlite::params![
                UploadStatus::Failed.code(),
                error,
                next_scheduled_at,
                batch_id,
                UploadStatus::Uploading.code(),
            ],
        )?;

        if updated == 0 && self.batch_by_id(batch_id)?.is_none() {
            return Err(Error::BatchNotFound(batch_id.to_string()));
        }

        debug!(batch_id, next_scheduled_at, "Batch failed");
        Ok(updated > 0)
    }
}

// Maintenance
impl Store {
    /// Delete `Uploaded` rows older than `cutoff` from every table.
    pub fn purge_uploaded_before(&self, cutoff: EpochMillis) -> Result<PurgeCounts> {
        let counts = PurgeCounts {
            sensor_readings: self.delete_uploaded_before::<SensorReading>(cutoff)?,
            events: self.delete_uploaded_before::<Event>(cutoff)?,
            device_states: self.delete_uploaded_before::<DeviceState>(cutoff)?,
            upload_batches: self.delete_uploaded_before::<UploadBatch>(cutoff)?,
        };

        info!(
            sensor_readings = counts.sensor_readings,
            events = counts.events,
            device_states = counts.device_states,
            upload_batches = counts.upload_batches,
            "Purged uploaded rows older than {}",
            cutoff
        );
        Ok(counts)
    }

    /// Pending row counts for every table.
    pub fn pending_counts(&self) -> Result<PendingCounts> {
        Ok(PendingCounts {
            sensor_readings: self.pending_count::<SensorReading>()?,
            events: self.pending_count::<Event>()?,
            device_states: self.pending_count::<DeviceState>()?,
            upload_batches: self.pending_count::<UploadBatch>()?,
        })
    }

    /// Release claims left behind by a process that stopped mid-run.
    ///
    /// An `Uploading` batch becomes `Failed` without a retry increment, and
    /// its rows follow it, so the next attempt reuses the same batch ID. Rows
    /// claimed under no known batch go back to `Pending`.
    ///
    /// Only call this while no other process is uploading from the same
    /// database.
    pub fn reset_all_uploading(&self) -> Result<usize> {
        let batches = self.conn.execute(
            "UPDATE upload_queue SET upload_status = ?1 WHERE upload_status = ?2",
            [UploadStatus::Failed.code(), UploadStatus::Uploading.code()],
        )?;
        let resumed = self.fail_abandoned::<SensorReading>()?
            + self.fail_abandoned::<Event>()?
            + self.fail_abandoned::<DeviceState>()?;
        let released = self.reset_uploading::<SensorReading>()?
            + self.reset_uploading::<Event>()?
            + self.reset_uploading::<DeviceState>()?;

        let reset = batches + resumed + released;
        if reset > 0 {
            info!(batches, resumed, released, "Released rows left uploading");
        }
        Ok(reset)
    }
}
