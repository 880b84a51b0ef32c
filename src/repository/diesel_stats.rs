//! Diesel-based repository statistics storage for SQLite.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;

use super::diesel_models::RepositoryStatsRecord;
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::parse_datetime;
use crate::schema::{repositories, repository_stats};

/// Latest stored processor output of a repository.
#[derive(Debug, Clone)]
pub struct StoredStats {
    pub repository_id: String,
    pub stats: serde_json::Value,
    pub health_score: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

impl From<RepositoryStatsRecord> for StoredStats {
    fn from(record: RepositoryStatsRecord) -> Self {
        StoredStats {
            repository_id: record.repository_id,
            stats: serde_json::from_str(&record.stats).unwrap_or(serde_json::Value::Null),
            health_score: record.health_score,
            computed_at: parse_datetime(&record.computed_at),
        }
    }
}

/// Diesel-based statistics repository.
#[derive(Clone)]
pub struct DieselStatsRepository {
    pool: SqlitePool,
}

impl DieselStatsRepository {
    /// Create a new Diesel statistics repository with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store the latest stats of a repository and mirror the health score
    /// onto the repository row.
    pub async fn save(
        &self,
        repository_id: &str,
        stats: serde_json::Value,
        health_score: Option<f64>,
    ) -> Result<(), DieselError> {
        let record = RepositoryStatsRecord {
            repository_id: repository_id.to_string(),
            stats: stats.to_string(),
            health_score,
            computed_at: Utc::now().to_rfc3339(),
        };
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                diesel::insert_into(repository_stats::table)
                    .values(&record)
                    .on_conflict(repository_stats::repository_id)
                    .do_update()
                    .set((
                        repository_stats::stats.eq(excluded(repository_stats::stats)),
                        repository_stats::health_score.eq(excluded(repository_stats::health_score)),
                        repository_stats::computed_at.eq(excluded(repository_stats::computed_at)),
                    ))
                    .execute(conn)?;
                diesel::update(repositories::table.find(&record.repository_id))
                    .set(repositories::health_percentage.eq(record.health_score))
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    /// Latest stats of a repository.
    pub async fn get(&self, repository_id: &str) -> Result<Option<StoredStats>, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            repository_stats::table
                .find(&repository_id)
                .first::<RepositoryStatsRecord>(conn)
                .optional()
        })
        .await
        .map(|opt| opt.map(StoredStats::from))
    }
}
