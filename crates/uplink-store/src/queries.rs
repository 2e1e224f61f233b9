//! Query builder for queued records.
//!
//! [`RecordQuery`] filters any of the item tables by owner, kind tag, time
//! range and status. It is consumed by [`Store::query`](crate::Store::query),
//! which is generic over the record type.
//!
//! # Example
//!
//! ```
//! use uplink_store::{RecordQuery, SensorReading, Store};
//!
//! let store = Store::open_in_memory()?;
//!
//! // Accelerometer readings of one participant, newest first.
//! let query = RecordQuery::new()
//!     .owner("participant-1")
//!     .kind("accelerometer")
//!     .limit(50);
//! let readings = store.query::<SensorReading>(&query)?;
//!
//! // A closed time window in chronological order.
//! let window = RecordQuery::new()
//!     .owner("participant-1")
//!     .since(1_000)
//!     .until(2_000)
//!     .oldest_first();
//! let in_window = store.query::<SensorReading>(&window)?;
//! # assert!(readings.is_empty() && in_window.is_empty());
//! # Ok::<(), uplink_store::Error>(())
//! ```

use uplink_types::{EpochMillis, UploadStatus};

/// Fluent query builder for item rows.
///
/// By default results are ordered by timestamp descending (newest first).
#[derive(Debug, Default, Clone)]
pub struct RecordQuery {
    /// Filter by owner ID.
    pub owner_id: Option<String>,
    /// Filter by kind tag (sensor kind or event kind).
    pub kind: Option<String>,
    /// Filter rows at or after this time.
    pub since: Option<EpochMillis>,
    /// Filter rows at or before this time.
    pub until: Option<EpochMillis>,
    /// Filter by upload status.
    pub status: Option<UploadStatus>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
    /// Order by timestamp descending (newest first).
    pub newest_first: bool,
}

impl RecordQuery {
    /// Create a new query: no filters, no limit, newest first.
    pub fn new() -> Self {
        Self {
            newest_first: true,
            ..Default::default()
        }
    }

    /// Filter by owner ID.
    pub fn owner(mut self, owner_id: &str) -> Self {
        self.owner_id = Some(owner_id.to_string());
        self
    }

    /// Filter by kind tag.
    ///
    /// Ignored for record types without a kind column (device states).
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    /// Filter to rows with timestamp at or after this time.
    pub fn since(mut self, time: EpochMillis) -> Self {
        self.since = Some(time);
        self
    }

    /// Filter to rows with timestamp at or before this time.
    pub fn until(mut self, time: EpochMillis) -> Self {
        self.until = Some(time);
        self
    }

    /// Filter by upload status.
    pub fn status(mut self, status: UploadStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Limit the maximum number of results returned.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first N results.
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Order results oldest first (ascending timestamp).
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// Build the SQL WHERE clause and parameters.
    pub(crate) fn build_where(
        &self,
        time_column: &str,
        kind_column: Option<&str>,
    ) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref owner_id) = self.owner_id {
            conditions.push("owner_id = ?".to_string());
            params.push(Box::new(owner_id.clone()));
        }

        if let (Some(kind), Some(column)) = (&self.kind, kind_column) {
            conditions.push(format!("{column} = ?"));
            params.push(Box::new(kind.clone()));
        }

        if let Some(since) = self.since {
            conditions.push(format!("{time_column} >= ?"));
            params.push(Box::new(since));
        }

        if let Some(until) = self.until {
            conditions.push(format!("{time_column} <= ?"));
            params.push(Box::new(until));
        }

        if let Some(status) = self.status {
            conditions.push("upload_status = ?".to_string());
            params.push(Box::new(status.code()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    /// Build the full SQL query for a table.
    pub(crate) fn build_sql(
        &self,
        table: &str,
        select_columns: &str,
        time_column: &str,
        kind_column: Option<&str>,
    ) -> String {
        let (where_clause, _) = self.build_where(time_column, kind_column);
        let order = if self.newest_first { "DESC" } else { "ASC" };

        // id breaks timestamp ties so equal-time rows keep insertion order
        let mut sql = format!(
            "SELECT {select_columns} FROM {table} {where_clause} \
             ORDER BY {time_column} {order}, id {order}"
        );

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        } else if self.offset.is_some() {
            sql.push_str(" LIMIT -1");
        }

        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        sql
    }
}
