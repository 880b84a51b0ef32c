//! Diesel-based raw intake repository for SQLite.
//!
//! Raw records are append-only: every non-304 fetch inserts a new version for
//! its `(entity_type, external_id)` key. Only `is_processed` is ever updated.

use chrono::Utc;
use diesel::prelude::*;
use diesel::SqliteConnection;

use super::diesel_models::{NewRawRecord, RawRecordRow};
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::parse_datetime;
use crate::models::{RawEntityKind, RawRecord};
use crate::schema::raw_records;

/// Convert a database record to a domain model.
impl TryFrom<RawRecordRow> for RawRecord {
    type Error = DieselError;

    fn try_from(row: RawRecordRow) -> Result<Self, Self::Error> {
        let kind = RawEntityKind::from_str(&row.entity_type).ok_or_else(|| {
            DieselError::DeserializationError(
                format!("unknown raw entity type '{}'", row.entity_type).into(),
            )
        })?;
        Ok(RawRecord {
            id: row.id,
            kind,
            external_id: row.external_id,
            payload: row.payload,
            fetched_at: parse_datetime(&row.fetched_at),
            api_endpoint: row.api_endpoint,
            etag: row.etag,
            is_processed: row.is_processed,
        })
    }
}

fn into_records(rows: Vec<RawRecordRow>) -> Result<Vec<RawRecord>, DieselError> {
    rows.into_iter().map(RawRecord::try_from).collect()
}

/// A fetched payload about to be stored.
#[derive(Debug, Clone)]
pub struct NewIntake {
    pub kind: RawEntityKind,
    pub external_id: String,
    pub payload: String,
    pub api_endpoint: String,
    pub etag: Option<String>,
    /// Store already processed, for payloads consumed directly by the caller.
    pub processed: bool,
}

/// Diesel-based raw record repository.
#[derive(Clone)]
pub struct DieselRawRecordRepository {
    pool: SqlitePool,
}

impl DieselRawRecordRepository {
    /// Create a new Diesel raw record repository with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a new version and return it.
    pub async fn insert(&self, intake: NewIntake) -> Result<RawRecord, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let fetched_at = Utc::now().to_rfc3339();
            let new_record = NewRawRecord {
                entity_type: intake.kind.as_str(),
                external_id: &intake.external_id,
                payload: &intake.payload,
                fetched_at: &fetched_at,
                api_endpoint: &intake.api_endpoint,
                etag: intake.etag.as_deref(),
                is_processed: intake.processed,
            };

            conn.transaction::<_, DieselError, _>(|conn| {
                diesel::insert_into(raw_records::table)
                    .values(&new_record)
                    .execute(conn)?;
                raw_records::table
                    .order(raw_records::id.desc())
                    .first::<RawRecordRow>(conn)
            })
        })
        .await
        .and_then(RawRecord::try_from)
    }

    /// Most recent version of a key, processed or not.
    pub async fn latest_for_key(
        &self,
        kind: RawEntityKind,
        external_id: &str,
    ) -> Result<Option<RawRecord>, DieselError> {
        let external_id = external_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            raw_records::table
                .filter(raw_records::entity_type.eq(kind.as_str()))
                .filter(raw_records::external_id.eq(&external_id))
                .order(raw_records::id.desc())
                .first::<RawRecordRow>(conn)
                .optional()
        })
        .await?
        .map(RawRecord::try_from)
        .transpose()
    }

    /// Unprocessed records of one kind with an id above `after_id`, oldest first.
    pub async fn pending(
        &self,
        kind: RawEntityKind,
        after_id: i32,
        limit: i64,
    ) -> Result<Vec<RawRecord>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            raw_records::table
                .filter(raw_records::entity_type.eq(kind.as_str()))
                .filter(raw_records::is_processed.eq(false))
                .filter(raw_records::id.gt(after_id))
                .order(raw_records::id.asc())
                .limit(limit)
                .load::<RawRecordRow>(conn)
        })
        .await
        .and_then(into_records)
    }

    /// Number of unprocessed records across all kinds.
    pub async fn count_pending(&self) -> Result<i64, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            raw_records::table
                .filter(raw_records::is_processed.eq(false))
                .count()
                .get_result::<i64>(conn)
        })
        .await
    }

    /// Number of stored versions for a key.
    pub async fn count_versions(
        &self,
        kind: RawEntityKind,
        external_id: &str,
    ) -> Result<i64, DieselError> {
        let external_id = external_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            raw_records::table
                .filter(raw_records::entity_type.eq(kind.as_str()))
                .filter(raw_records::external_id.eq(&external_id))
                .count()
                .get_result::<i64>(conn)
        })
        .await
    }

    /// Put a record back in the extraction queue for a replay.
    pub async fn requeue(&self, id: i32) -> Result<bool, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let rows = diesel::update(raw_records::table.find(id))
                .set(raw_records::is_processed.eq(false))
                .execute(conn)?;
            Ok(rows > 0)
        })
        .await
    }
}

/// Mark records processed. Runs on the caller's connection so it joins the
/// caller's transaction.
pub(crate) fn mark_processed_in(
    conn: &mut SqliteConnection,
    ids: &[i32],
) -> Result<usize, DieselError> {
    if ids.is_empty() {
        return Ok(0);
    }
    diesel::update(raw_records::table.filter(raw_records::id.eq_any(ids)))
        .set(raw_records::is_processed.eq(true))
        .execute(conn)
}

/// Mark older unprocessed versions of a key as processed (superseded).
pub(crate) fn supersede_older_in(
    conn: &mut SqliteConnection,
    kind: RawEntityKind,
    external_id: &str,
    newest_id: i32,
) -> Result<usize, DieselError> {
    diesel::update(
        raw_records::table
            .filter(raw_records::entity_type.eq(kind.as_str()))
            .filter(raw_records::external_id.eq(external_id))
            .filter(raw_records::is_processed.eq(false))
            .filter(raw_records::id.lt(newest_id)),
    )
    .set(raw_records::is_processed.eq(true))
    .execute(conn)
}
