//! Diesel-based repository (GitHub repository) storage for SQLite.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::SqliteConnection;

use super::diesel_models::{NewRepositorySnapshot, RepositoryRecord, RepositorySnapshotRecord};
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::parse_datetime;
use crate::models::{Repository, RepositorySnapshot};
use crate::schema::{repositories, repository_snapshots};

/// Convert a database record to a domain model.
impl From<RepositoryRecord> for Repository {
    fn from(record: RepositoryRecord) -> Self {
        Repository {
            id: record.id,
            external_id: record.external_id,
            name: record.name,
            full_name: record.full_name,
            description: record.description,
            url: record.url,
            stars: record.stars,
            forks: record.forks,
            size_kb: record.size_kb,
            watchers: record.watchers,
            primary_language: record.primary_language,
            license: record.license,
            is_fork: record.is_fork,
            is_archived: record.is_archived,
            owner_id: record.owner_id,
            is_enriched: record.is_enriched,
            enrichment_attempts: record.enrichment_attempts,
            enrichment_error: record.enrichment_error,
            health_percentage: record.health_percentage,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
        }
    }
}

impl From<RepositorySnapshotRecord> for RepositorySnapshot {
    fn from(record: RepositorySnapshotRecord) -> Self {
        RepositorySnapshot {
            repository_id: record.repository_id,
            stars: record.stars,
            forks: record.forks,
            watchers: record.watchers,
            recorded_at: parse_datetime(&record.recorded_at),
        }
    }
}

/// Payload fields of a repository, from either a list or a detail payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryUpsert {
    pub external_id: String,
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub url: String,
    pub stars: i32,
    pub forks: i32,
    pub size_kb: i32,
    pub watchers: i32,
    pub primary_language: Option<String>,
    pub license: Option<String>,
    pub is_fork: bool,
    pub is_archived: bool,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fetch time of the payload; keys the popularity snapshot.
    pub observed_at: DateTime<Utc>,
}

/// Insert or refresh a repository from its payload and record a popularity
/// snapshot. Enrichment state and health are left alone.
pub(crate) fn upsert_in(
    conn: &mut SqliteConnection,
    repo: &RepositoryUpsert,
) -> Result<String, DieselError> {
    let record = RepositoryRecord {
        id: uuid::Uuid::new_v4().to_string(),
        external_id: repo.external_id.clone(),
        name: repo.name.clone(),
        full_name: repo.full_name.clone(),
        description: repo.description.clone(),
        url: repo.url.clone(),
        stars: repo.stars,
        forks: repo.forks,
        size_kb: repo.size_kb,
        watchers: repo.watchers,
        primary_language: repo.primary_language.clone(),
        license: repo.license.clone(),
        is_fork: repo.is_fork,
        is_archived: repo.is_archived,
        owner_id: repo.owner_id.clone(),
        is_enriched: false,
        enrichment_attempts: 0,
        enrichment_error: None,
        health_percentage: None,
        created_at: repo.created_at.to_rfc3339(),
        updated_at: repo.updated_at.to_rfc3339(),
    };

    diesel::insert_into(repositories::table)
        .values(&record)
        .on_conflict(repositories::external_id)
        .do_update()
        .set((
            repositories::name.eq(excluded(repositories::name)),
            repositories::full_name.eq(excluded(repositories::full_name)),
            repositories::description.eq(excluded(repositories::description)),
            repositories::url.eq(excluded(repositories::url)),
            repositories::stars.eq(excluded(repositories::stars)),
            repositories::forks.eq(excluded(repositories::forks)),
            repositories::size_kb.eq(excluded(repositories::size_kb)),
            repositories::primary_language.eq(excluded(repositories::primary_language)),
            repositories::is_fork.eq(excluded(repositories::is_fork)),
            repositories::is_archived.eq(excluded(repositories::is_archived)),
            repositories::owner_id.eq(excluded(repositories::owner_id)),
            repositories::updated_at.eq(excluded(repositories::updated_at)),
        ))
        .execute(conn)?;

    let id: String = repositories::table
        .filter(repositories::external_id.eq(&repo.external_id))
        .select(repositories::id)
        .first(conn)?;
    record_snapshot_in(conn, &id, repo)?;
    Ok(id)
}

/// One snapshot per repository and observation time; replaying the same
/// payload is a no-op.
pub(crate) fn record_snapshot_in(
    conn: &mut SqliteConnection,
    repository_id: &str,
    repo: &RepositoryUpsert,
) -> Result<(), DieselError> {
    let recorded_at = repo.observed_at.to_rfc3339();
    diesel::insert_into(repository_snapshots::table)
        .values(&NewRepositorySnapshot {
            repository_id,
            stars: repo.stars,
            forks: repo.forks,
            watchers: repo.watchers,
            recorded_at: &recorded_at,
        })
        .on_conflict((
            repository_snapshots::repository_id,
            repository_snapshots::recorded_at,
        ))
        .do_nothing()
        .execute(conn)?;
    Ok(())
}

/// Id of a repository by `owner/name`, on the caller's connection.
pub(crate) fn id_by_full_name_in(
    conn: &mut SqliteConnection,
    full_name: &str,
) -> Result<Option<String>, DieselError> {
    repositories::table
        .filter(repositories::full_name.eq(full_name))
        .select(repositories::id)
        .first::<String>(conn)
        .optional()
}

/// Diesel-based repository storage.
#[derive(Clone)]
pub struct DieselRepoRepository {
    pool: SqlitePool,
}

impl DieselRepoRepository {
    /// Create a new Diesel repository store with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a repository from its payload.
    pub async fn upsert(&self, repo: RepositoryUpsert) -> Result<String, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| upsert_in(conn, &repo))
        })
        .await
    }

    /// Get a repository by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Repository>, DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            repositories::table
                .find(&id)
                .first::<RepositoryRecord>(conn)
                .optional()
        })
        .await
        .map(|opt| opt.map(Repository::from))
    }

    /// Get a repository by `owner/name`.
    pub async fn find_by_full_name(&self, full_name: &str) -> Result<Option<Repository>, DieselError> {
        let full_name = full_name.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            repositories::table
                .filter(repositories::full_name.eq(&full_name))
                .first::<RepositoryRecord>(conn)
                .optional()
        })
        .await
        .map(|opt| opt.map(Repository::from))
    }

    /// Get all repositories.
    pub async fn get_all(&self) -> Result<Vec<Repository>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            repositories::table
                .order(repositories::full_name.asc())
                .load::<RepositoryRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(Repository::from).collect())
    }

    /// Full names of every stored repository.
    pub async fn full_names(&self) -> Result<Vec<String>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            repositories::table
                .order(repositories::full_name.asc())
                .select(repositories::full_name)
                .load::<String>(conn)
        })
        .await
    }

    /// Count stored repositories.
    pub async fn count(&self) -> Result<i64, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            repositories::table.count().get_result::<i64>(conn)
        })
        .await
    }

    /// Repositories still eligible for enrichment, as `(id, full_name)` pairs.
    pub async fn enrichment_candidates(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<(String, String)>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            repositories::table
                .filter(repositories::is_enriched.eq(false))
                .filter(repositories::enrichment_attempts.lt(max_attempts))
                .order((repositories::enrichment_attempts.asc(), repositories::full_name.asc()))
                .select((repositories::id, repositories::full_name))
                .limit(limit)
                .load::<(String, String)>(conn)
        })
        .await
    }

    pub async fn count_enrichment_candidates(&self, max_attempts: i32) -> Result<i64, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            repositories::table
                .filter(repositories::is_enriched.eq(false))
                .filter(repositories::enrichment_attempts.lt(max_attempts))
                .count()
                .get_result::<i64>(conn)
        })
        .await
    }

    /// Store detail-payload fields, mark enriched and record a snapshot.
    pub async fn apply_enrichment(
        &self,
        id: &str,
        detail: RepositoryUpsert,
    ) -> Result<(), DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                diesel::update(repositories::table.find(&id))
                    .set((
                        repositories::description.eq(&detail.description),
                        repositories::stars.eq(detail.stars),
                        repositories::forks.eq(detail.forks),
                        repositories::size_kb.eq(detail.size_kb),
                        repositories::watchers.eq(detail.watchers),
                        repositories::primary_language.eq(&detail.primary_language),
                        repositories::license.eq(&detail.license),
                        repositories::is_fork.eq(detail.is_fork),
                        repositories::is_archived.eq(detail.is_archived),
                        repositories::is_enriched.eq(true),
                        repositories::enrichment_attempts.eq(repositories::enrichment_attempts + 1),
                        repositories::enrichment_error.eq(None::<String>),
                        repositories::updated_at.eq(detail.updated_at.to_rfc3339()),
                    ))
                    .execute(conn)?;
                if detail.owner_id.is_some() {
                    diesel::update(repositories::table.find(&id))
                        .set(repositories::owner_id.eq(&detail.owner_id))
                        .execute(conn)?;
                }
                record_snapshot_in(conn, &id, &detail)
            })
        })
        .await
    }

    /// Count a failed enrichment attempt.
    pub async fn record_enrichment_failure(&self, id: &str, error: &str) -> Result<(), DieselError> {
        let id = id.to_string();
        let error = error.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(repositories::table.find(&id))
                .set((
                    repositories::enrichment_attempts.eq(repositories::enrichment_attempts + 1),
                    repositories::enrichment_error.eq(&error),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Popularity history of a repository, oldest first.
    pub async fn snapshots(&self, repository_id: &str) -> Result<Vec<RepositorySnapshot>, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            repository_snapshots::table
                .filter(repository_snapshots::repository_id.eq(&repository_id))
                .order((repository_snapshots::recorded_at.asc(), repository_snapshots::id.asc()))
                .load::<RepositorySnapshotRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(RepositorySnapshot::from).collect())
    }
}
