//! Diesel-based commit repository for SQLite.
//!
//! A commit is stored as one row per changed file, keyed by
//! `(sha, repository_id, filename)`. Until enrichment fetches the file list
//! a commit is a single summary row with an empty filename.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::SqliteConnection;

use super::diesel_models::CommitRecord;
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::parse_datetime;
use crate::models::{Commit, FileStatus};
use crate::schema::{commits, repositories};

/// Convert a database record to a domain model.
impl From<CommitRecord> for Commit {
    fn from(record: CommitRecord) -> Self {
        Commit {
            id: record.id,
            sha: record.sha,
            repository_id: record.repository_id,
            contributor_id: record.contributor_id,
            pull_request_id: record.pull_request_id,
            message: record.message,
            committed_at: parse_datetime(&record.committed_at),
            filename: record.filename,
            status: FileStatus::from_str(&record.status).unwrap_or(FileStatus::Modified),
            additions: record.additions,
            deletions: record.deletions,
            patch: record.patch,
            is_merge_commit: record.is_merge_commit,
            is_enriched: record.is_enriched,
            enrichment_attempts: record.enrichment_attempts,
            enrichment_error: record.enrichment_error,
        }
    }
}

/// Commit fields from a list payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitUpsert {
    pub repository_id: String,
    pub sha: String,
    pub contributor_id: Option<String>,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub is_merge_commit: bool,
}

/// One changed file from a commit detail payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitFileRow {
    pub filename: String,
    pub status: FileStatus,
    pub additions: i32,
    pub deletions: i32,
    pub patch: Option<String>,
}

/// Summary-row candidate for enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitCandidate {
    pub id: String,
    pub repository_id: String,
    pub repository_full_name: String,
    pub sha: String,
}

/// Insert the summary row of a commit, or refresh attribution and message on
/// every existing row of it.
pub(crate) fn upsert_summary_in(
    conn: &mut SqliteConnection,
    commit: &CommitUpsert,
) -> Result<usize, DieselError> {
    let existing: i64 = commits::table
        .filter(commits::sha.eq(&commit.sha))
        .filter(commits::repository_id.eq(&commit.repository_id))
        .count()
        .get_result(conn)?;

    if existing > 0 {
        let updated = diesel::update(
            commits::table
                .filter(commits::sha.eq(&commit.sha))
                .filter(commits::repository_id.eq(&commit.repository_id)),
        )
        .set(commits::message.eq(&commit.message))
        .execute(conn)?;
        if commit.contributor_id.is_some() {
            diesel::update(
                commits::table
                    .filter(commits::sha.eq(&commit.sha))
                    .filter(commits::repository_id.eq(&commit.repository_id)),
            )
            .set(commits::contributor_id.eq(&commit.contributor_id))
            .execute(conn)?;
        }
        return Ok(updated);
    }

    let record = CommitRecord {
        id: uuid::Uuid::new_v4().to_string(),
        sha: commit.sha.clone(),
        repository_id: commit.repository_id.clone(),
        contributor_id: commit.contributor_id.clone(),
        pull_request_id: None,
        message: commit.message.clone(),
        committed_at: commit.committed_at.to_rfc3339(),
        filename: String::new(),
        status: FileStatus::Modified.as_str().to_string(),
        additions: 0,
        deletions: 0,
        patch: None,
        is_merge_commit: commit.is_merge_commit,
        is_enriched: false,
        enrichment_attempts: 0,
        enrichment_error: None,
    };
    diesel::insert_into(commits::table)
        .values(&record)
        .on_conflict((commits::sha, commits::repository_id, commits::filename))
        .do_nothing()
        .execute(conn)
}

/// Diesel-based commit repository.
#[derive(Clone)]
pub struct DieselCommitRepository {
    pool: SqlitePool,
}

impl DieselCommitRepository {
    /// Create a new Diesel commit repository with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a listed commit.
    pub async fn upsert_summary(&self, commit: CommitUpsert) -> Result<usize, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| upsert_summary_in(conn, &commit))
        })
        .await
    }

    /// All rows of a commit.
    pub async fn rows_for_sha(
        &self,
        repository_id: &str,
        sha: &str,
    ) -> Result<Vec<Commit>, DieselError> {
        let repository_id = repository_id.to_string();
        let sha = sha.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            commits::table
                .filter(commits::repository_id.eq(&repository_id))
                .filter(commits::sha.eq(&sha))
                .order(commits::filename.asc())
                .load::<CommitRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(Commit::from).collect())
    }

    /// Every row of every commit of a repository.
    pub async fn list_for_repository(&self, repository_id: &str) -> Result<Vec<Commit>, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            commits::table
                .filter(commits::repository_id.eq(&repository_id))
                .order((commits::committed_at.asc(), commits::sha.asc()))
                .load::<CommitRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(Commit::from).collect())
    }

    /// Number of distinct commits in a repository.
    pub async fn count_distinct(&self, repository_id: &str) -> Result<i64, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            use diesel::dsl::count_distinct;
            commits::table
                .filter(commits::repository_id.eq(&repository_id))
                .select(count_distinct(commits::sha))
                .first::<i64>(conn)
        })
        .await
    }

    /// Summary rows still eligible for enrichment.
    pub async fn enrichment_candidates(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<CommitCandidate>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let rows: Vec<(String, String, String, String)> = commits::table
                .inner_join(repositories::table)
                .filter(commits::filename.eq(""))
                .filter(commits::is_enriched.eq(false))
                .filter(commits::enrichment_attempts.lt(max_attempts))
                .order((commits::enrichment_attempts.asc(), commits::committed_at.desc()))
                .select((
                    commits::id,
                    commits::repository_id,
                    repositories::full_name,
                    commits::sha,
                ))
                .limit(limit)
                .load(conn)?;
            Ok(rows
                .into_iter()
                .map(|(id, repository_id, repository_full_name, sha)| CommitCandidate {
                    id,
                    repository_id,
                    repository_full_name,
                    sha,
                })
                .collect())
        })
        .await
    }

    pub async fn count_enrichment_candidates(&self, max_attempts: i32) -> Result<i64, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            commits::table
                .filter(commits::filename.eq(""))
                .filter(commits::is_enriched.eq(false))
                .filter(commits::enrichment_attempts.lt(max_attempts))
                .count()
                .get_result::<i64>(conn)
        })
        .await
    }

    /// Replace the summary row of a commit with one enriched row per changed
    /// file. A commit without files keeps its summary row, marked enriched.
    pub async fn apply_enrichment(
        &self,
        summary_id: &str,
        files: Vec<CommitFileRow>,
        is_merge_commit: bool,
    ) -> Result<usize, DieselError> {
        let summary_id = summary_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let summary = commits::table
                    .find(&summary_id)
                    .first::<CommitRecord>(conn)?;
                let attempts = summary.enrichment_attempts + 1;

                if files.is_empty() {
                    diesel::update(commits::table.find(&summary_id))
                        .set((
                            commits::is_merge_commit.eq(is_merge_commit),
                            commits::is_enriched.eq(true),
                            commits::enrichment_attempts.eq(attempts),
                            commits::enrichment_error.eq(None::<String>),
                        ))
                        .execute(conn)?;
                    return Ok(1);
                }

                diesel::delete(
                    commits::table
                        .filter(commits::sha.eq(&summary.sha))
                        .filter(commits::repository_id.eq(&summary.repository_id)),
                )
                .execute(conn)?;

                let mut written = 0;
                for file in &files {
                    let row = CommitRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        filename: file.filename.clone(),
                        status: file.status.as_str().to_string(),
                        additions: file.additions,
                        deletions: file.deletions,
                        patch: file.patch.clone(),
                        is_merge_commit,
                        is_enriched: true,
                        enrichment_attempts: attempts,
                        enrichment_error: None,
                        ..summary.clone()
                    };
                    written += diesel::insert_into(commits::table)
                        .values(&row)
                        .on_conflict((commits::sha, commits::repository_id, commits::filename))
                        .do_nothing()
                        .execute(conn)?;
                }
                Ok(written)
            })
        })
        .await
    }

    /// Count a failed enrichment attempt on a summary row.
    pub async fn record_enrichment_failure(&self, id: &str, error: &str) -> Result<(), DieselError> {
        let id = id.to_string();
        let error = error.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(commits::table.find(&id))
                .set((
                    commits::enrichment_attempts.eq(commits::enrichment_attempts + 1),
                    commits::enrichment_error.eq(&error),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
