//! Upload status operations shared by every queued table.
//!
//! Sensor readings, events, device states and upload batches all carry the
//! same `upload_status`/`retry_count`/`error_message` columns and move through
//! the same state machine ([`UploadStatus`]). [`StatusTable`] describes one
//! such table; the generic methods on [`Store`] below implement the state
//! machine once for all of them.
//!
//! Bulk updates are guarded in SQL: a row only changes when its current
//! status may legally move to the target (see
//! [`UploadStatus::can_transition_to`]). In particular nothing ever leaves
//! `Uploaded`.

use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params_from_iter};
use tracing::debug;

use uplink_types::{EpochMillis, UploadStatus, ValueMap};

use crate::error::Result;
use crate::models::{DeviceState, Event, SensorReading, UploadBatch};
use crate::queries::RecordQuery;
use crate::store::Store;

/// Maximum number of bound ids per statement.
const ID_CHUNK: usize = 500;

/// A table whose rows move through the upload state machine.
pub trait StatusTable: Sized {
    /// Table name.
    const TABLE: &'static str;
    /// Column list in the order [`StatusTable::from_row`] reads it.
    const COLUMNS: &'static str;
    /// Column compared against the retention cutoff and time filters.
    const TIME_COLUMN: &'static str;
    /// Kind tag column, if the table has one.
    const KIND_COLUMN: Option<&'static str>;
    /// ORDER BY clause used when draining the table.
    const DRAIN_ORDER: &'static str;

    /// Decode one row selected with [`StatusTable::COLUMNS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Row ID.
    fn id(&self) -> i64;

    /// Current upload status.
    fn status(&self) -> UploadStatus;
}

/// An item table whose rows are sent under an upload-queue batch.
///
/// Each row records the `batch_id` it was last claimed under, so a failed
/// batch can be retried with exactly the rows (and the idempotency key) of
/// its first attempt.
pub trait BatchMember: StatusTable {}

impl BatchMember for SensorReading {}
impl BatchMember for Event {}
impl BatchMember for DeviceState {}

impl StatusTable for SensorReading {
    const TABLE: &'static str = "sensor_readings";
    const COLUMNS: &'static str = "id, owner_id, sensor_kind, timestamp, payload, metadata, \
         upload_status, retry_count, error_message";
    const TIME_COLUMN: &'static str = "timestamp";
    const KIND_COLUMN: Option<&'static str> = Some("sensor_kind");
    const DRAIN_ORDER: &'static str = "timestamp ASC, id ASC";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(SensorReading {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            sensor_kind: row.get(2)?,
            timestamp: row.get(3)?,
            payload: decode_map(4, &row.get::<_, String>(4)?)?,
            metadata: decode_optional_map(5, row.get(5)?)?,
            upload_status: decode_status(6, row.get(6)?)?,
            retry_count: row.get(7)?,
            error_message: row.get(8)?,
        })
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn status(&self) -> UploadStatus {
        self.upload_status
    }
}

impl StatusTable for Event {
    const TABLE: &'static str = "events";
    const COLUMNS: &'static str = "id, owner_id, event_kind, timestamp, properties, \
         upload_status, retry_count, error_message";
    const TIME_COLUMN: &'static str = "timestamp";
    const KIND_COLUMN: Option<&'static str> = Some("event_kind");
    const DRAIN_ORDER: &'static str = "timestamp ASC, id ASC";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Event {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            event_kind: row.get(2)?,
            timestamp: row.get(3)?,
            properties: decode_optional_map(4, row.get(4)?)?,
            upload_status: decode_status(5, row.get(5)?)?,
            retry_count: row.get(6)?,
            error_message: row.get(7)?,
        })
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn status(&self) -> UploadStatus {
        self.upload_status
    }
}

impl StatusTable for DeviceState {
    const TABLE: &'static str = "device_states";
    const COLUMNS: &'static str = "id, owner_id, timestamp, battery_level, is_charging, \
         network_kind, available_storage, is_screen_on, orientation, extra_info, \
         upload_status, retry_count, error_message";
    const TIME_COLUMN: &'static str = "timestamp";
    const KIND_COLUMN: Option<&'static str> = None;
    const DRAIN_ORDER: &'static str = "timestamp ASC, id ASC";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let network: String = row.get(5)?;
        Ok(DeviceState {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            timestamp: row.get(2)?,
            battery_level: row.get::<_, i64>(3)?.clamp(0, 100) as u8,
            is_charging: row.get(4)?,
            network_kind: network
                .parse()
                .map_err(|e| conversion_error(5, Type::Text, e))?,
            available_storage: row.get::<_, i64>(6)?.max(0) as u64,
            is_screen_on: row.get(7)?,
            orientation: row.get(8)?,
            extra_info: decode_optional_map(9, row.get(9)?)?,
            upload_status: decode_status(10, row.get(10)?)?,
            retry_count: row.get(11)?,
            error_message: row.get(12)?,
        })
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn status(&self) -> UploadStatus {
        self.upload_status
    }
}

impl StatusTable for UploadBatch {
    const TABLE: &'static str = "upload_queue";
    const COLUMNS: &'static str = "id, owner_id, data_kind, batch_id, item_count, created_at, \
         scheduled_at, upload_status, retry_count, error_message, priority";
    const TIME_COLUMN: &'static str = "created_at";
    const KIND_COLUMN: Option<&'static str> = Some("data_kind");
    const DRAIN_ORDER: &'static str = "priority DESC, scheduled_at ASC, id ASC";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get(2)?;
        Ok(UploadBatch {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            data_kind: kind.parse().map_err(|e| conversion_error(2, Type::Text, e))?,
            batch_id: row.get(3)?,
            item_count: row.get(4)?,
            created_at: row.get(5)?,
            scheduled_at: row.get(6)?,
            upload_status: decode_status(7, row.get(7)?)?,
            retry_count: row.get(8)?,
            error_message: row.get(9)?,
            priority: row.get(10)?,
        })
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn status(&self) -> UploadStatus {
        self.upload_status
    }
}

fn conversion_error<E>(idx: usize, ty: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn decode_status(idx: usize, code: i64) -> rusqlite::Result<UploadStatus> {
    UploadStatus::try_from(code).map_err(|e| conversion_error(idx, Type::Integer, e))
}

pub(crate) fn decode_map(idx: usize, text: &str) -> rusqlite::Result<ValueMap> {
    serde_json::from_str(text).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn decode_optional_map(idx: usize, text: Option<String>) -> rusqlite::Result<Option<ValueMap>> {
    text.map(|t| decode_map(idx, &t)).transpose()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// `IN (...)` list of the statuses a row may leave to reach `target`.
fn source_codes(target: UploadStatus) -> String {
    UploadStatus::sources_of(target)
        .iter()
        .map(|s| s.code().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// Generic status operations
impl Store {
    /// Fetch up to `limit` pending rows in drain order.
    pub fn pending<T: StatusTable>(&self, limit: u32) -> Result<Vec<T>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE upload_status = ?1 ORDER BY {} LIMIT ?2",
            T::COLUMNS,
            T::TABLE,
            T::DRAIN_ORDER
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![UploadStatus::Pending.code(), limit],
                T::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fetch up to `limit` failed rows still below the retry ceiling.
    pub fn failed<T: StatusTable>(&self, max_retries: u32, limit: u32) -> Result<Vec<T>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE upload_status = ?1 AND retry_count < ?2 \
             ORDER BY {} LIMIT ?3",
            T::COLUMNS,
            T::TABLE,
            T::DRAIN_ORDER
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![UploadStatus::Failed.code(), max_retries, limit],
                T::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fetch a row by ID.
    pub fn get<T: StatusTable>(&self, id: i64) -> Result<Option<T>> {
        let sql = format!("SELECT {} FROM {} WHERE id = ?", T::COLUMNS, T::TABLE);
        let row = self
            .conn
            .query_row(&sql, [id], T::from_row)
            .optional()?;
        Ok(row)
    }

    /// Run a filtered query against a table.
    pub fn query<T: StatusTable>(&self, query: &RecordQuery) -> Result<Vec<T>> {
        let sql = query.build_sql(T::TABLE, T::COLUMNS, T::TIME_COLUMN, T::KIND_COLUMN);
        let (_, params) = query.build_where(T::TIME_COLUMN, T::KIND_COLUMN);

        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), T::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Move rows to `status`.
    ///
    /// Only rows whose current status may transition to `status` change;
    /// the rest are left alone. Returns the number of rows updated.
    /// Re-marking `Uploaded` rows `Uploaded` is accepted and changes nothing.
    pub fn set_status<T: StatusTable>(&self, ids: &[i64], status: UploadStatus) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let mut updated = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "UPDATE {} SET upload_status = {} WHERE id IN ({}) AND upload_status IN ({})",
                T::TABLE,
                status.code(),
                placeholders(chunk.len()),
                source_codes(status)
            );
            updated += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;

        debug!(table = T::TABLE, %status, updated, "Status update");
        Ok(updated)
    }

    /// Move rows to `status`, record `error` and increment their retry count.
    pub fn set_status_with_error<T: StatusTable>(
        &self,
        ids: &[i64],
        status: UploadStatus,
        error: &str,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let mut updated = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "UPDATE {} SET upload_status = {}, error_message = ?, retry_count = retry_count + 1 \
                 WHERE id IN ({}) AND upload_status IN ({})",
                T::TABLE,
                status.code(),
                placeholders(chunk.len()),
                source_codes(status)
            );
            let params = std::iter::once(&error as &dyn rusqlite::ToSql)
                .chain(chunk.iter().map(|id| id as &dyn rusqlite::ToSql));
            updated += tx.execute(&sql, params_from_iter(params))?;
        }
        tx.commit()?;

        debug!(table = T::TABLE, %status, updated, error, "Status update with error");
        Ok(updated)
    }

    /// Release every `Uploading` row back to `Pending`.
    ///
    /// Rows are only left `Uploading` when a run died mid-flight.
    pub fn reset_uploading<T: StatusTable>(&self) -> Result<usize> {
        let reset = self.conn.execute(
            &format!(
                "UPDATE {} SET upload_status = ?1 WHERE upload_status = ?2",
                T::TABLE
            ),
            [UploadStatus::Pending.code(), UploadStatus::Uploading.code()],
        )?;
        Ok(reset)
    }

    /// Delete `Uploaded` rows older than `cutoff`. Returns the number deleted.
    pub fn delete_uploaded_before<T: StatusTable>(&self, cutoff: EpochMillis) -> Result<usize> {
        let deleted = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE upload_status = ?1 AND {} < ?2",
                T::TABLE,
                T::TIME_COLUMN
            ),
            rusqlite::params![UploadStatus::Uploaded.code(), cutoff],
        )?;
        Ok(deleted)
    }

    /// Count rows in a given status.
    pub fn count_with_status<T: StatusTable>(&self, status: UploadStatus) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE upload_status = ?", T::TABLE),
            [status.code()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Count pending rows.
    pub fn pending_count<T: StatusTable>(&self) -> Result<u64> {
        self.count_with_status::<T>(UploadStatus::Pending)
    }

    /// Delete a row by ID. Returns whether a row was removed.
    pub fn delete<T: StatusTable>(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute(&format!("DELETE FROM {} WHERE id = ?", T::TABLE), [id])?;
        Ok(deleted > 0)
    }

    /// Claim rows for an in-flight attempt of `batch_id`.
    ///
    /// Moves the rows to `Uploading` and links them to the batch. Rows that
    /// may not move to `Uploading` are left alone. Returns the number claimed.
    pub fn claim_for_batch<T: BatchMember>(&self, ids: &[i64], batch_id: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let mut claimed = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "UPDATE {} SET upload_status = {}, batch_id = ? \
                 WHERE id IN ({}) AND upload_status IN ({})",
                T::TABLE,
                UploadStatus::Uploading.code(),
                placeholders(chunk.len()),
                source_codes(UploadStatus::Uploading)
            );
            let params = std::iter::once(&batch_id as &dyn rusqlite::ToSql)
                .chain(chunk.iter().map(|id| id as &dyn rusqlite::ToSql));
            claimed += tx.execute(&sql, params_from_iter(params))?;
        }
        tx.commit()?;

        debug!(table = T::TABLE, batch_id, claimed, "Claimed rows for batch");
        Ok(claimed)
    }

    /// Failed rows of `batch_id` still below the retry ceiling, in drain order.
    pub fn batch_items<T: BatchMember>(&self, batch_id: &str, max_retries: u32) -> Result<Vec<T>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE batch_id = ?1 AND upload_status = ?2 AND retry_count < ?3 \
             ORDER BY {}",
            T::COLUMNS,
            T::TABLE,
            T::DRAIN_ORDER
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params![batch_id, UploadStatus::Failed.code(), max_retries],
                T::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Move `Uploading` rows whose batch is still queued to `Failed`, leaving
    /// their retry count unchanged. Returns the number moved.
    pub(crate) fn fail_abandoned<T: BatchMember>(&self) -> Result<usize> {
        let moved = self.conn.execute(
            &format!(
                "UPDATE {} SET upload_status = ?1 \
                 WHERE upload_status = ?2 AND batch_id IN (SELECT batch_id FROM upload_queue WHERE upload_status = ?1)",
                T::TABLE
            ),
            [UploadStatus::Failed.code(), UploadStatus::Uploading.code()],
        )?;
        Ok(moved)
    }

    /// Delete rows by ID. Returns the number removed.
    pub fn delete_ids<T: StatusTable>(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let mut deleted = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "DELETE FROM {} WHERE id IN ({})",
                T::TABLE,
                placeholders(chunk.len())
            );
            deleted += tx.execute(&sql, params_from_iter(chunk.iter()))?;
        }
        tx.commit()?;
        Ok(deleted)
    }
}
