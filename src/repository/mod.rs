//! Persistence layer: Diesel repositories over SQLite.
//!
//! Every entity write is an upsert on the table's natural unique key, so a
//! restarted run re-processing the same input converges to the same rows.

pub mod diesel_commit;
pub mod diesel_contributor;
pub mod diesel_link;
pub mod diesel_merge_request;
pub mod diesel_models;
pub mod diesel_pipeline;
pub mod diesel_pool;
pub mod diesel_ranking;
pub mod diesel_raw_record;
pub mod diesel_repo;
pub mod diesel_stats;
pub mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use diesel::sql_types::Integer;
use diesel::QueryableByName;

pub use diesel_commit::DieselCommitRepository;
pub use diesel_contributor::DieselContributorRepository;
pub use diesel_link::DieselLinkRepository;
pub use diesel_merge_request::DieselMergeRequestRepository;
pub use diesel_pipeline::{DieselPipelineRepository, PipelineTracker};
pub use diesel_pool::{run_blocking, DieselError, SqlitePool};
pub use diesel_ranking::DieselRankingRepository;
pub use diesel_raw_record::DieselRawRecordRepository;
pub use diesel_repo::DieselRepoRepository;
pub use diesel_stats::DieselStatsRepository;

/// Errors raised while opening the database.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel_pool::R2D2Error),
    #[error("database error: {0}")]
    Database(#[from] DieselError),
}

/// Open (creating if needed) the SQLite database and apply the schema.
pub async fn open_database(path: &Path) -> Result<SqlitePool, StoreError> {
    let pool = diesel_pool::create_diesel_pool(path)?;
    migrations::run_migrations(&pool).await?;
    Ok(pool)
}

/// Parse an RFC 3339 timestamp, falling back to now for corrupt values.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// JSON array column to a string list; malformed text reads as empty.
pub(crate) fn parse_string_list(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

pub(crate) fn string_list_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Row of `SELECT last_insert_rowid()`.
#[derive(QueryableByName)]
pub(crate) struct LastInsertRowId {
    #[diesel(sql_type = Integer)]
    pub id: i32,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;
    use diesel_repo::RepositoryUpsert;
    use tempfile::TempDir;

    /// Fresh migrated database in a temporary directory.
    pub async fn setup_test_db() -> (SqlitePool, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_url = dir.path().join("test.db").display().to_string();
        let pool = diesel_pool::create_diesel_pool_from_url(&db_url).unwrap();
        migrations::run_migrations(&pool).await.unwrap();
        (pool, dir)
    }

    /// Repository upsert with plausible defaults.
    pub fn sample_repository(external_id: &str, full_name: &str, stars: i32) -> RepositoryUpsert {
        let now = Utc::now();
        RepositoryUpsert {
            external_id: external_id.to_string(),
            name: full_name.rsplit('/').next().unwrap_or(full_name).to_string(),
            full_name: full_name.to_string(),
            description: Some("test repository".to_string()),
            url: format!("https://github.com/{}", full_name),
            stars,
            forks: 3,
            size_kb: 120,
            watchers: stars,
            primary_language: Some("Rust".to_string()),
            license: None,
            is_fork: false,
            is_archived: false,
            owner_id: None,
            created_at: now,
            updated_at: now,
            observed_at: now,
        }
    }
}
