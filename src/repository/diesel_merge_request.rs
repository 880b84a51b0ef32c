//! Diesel-based merge request repository for SQLite.
//!
//! Merge requests are keyed by `(repository_id, external_id)`. Upserts never
//! move a row backwards: a payload older than the stored `updated_at` is
//! ignored, so replays and out-of-order pages converge on the newest state.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel::SqliteConnection;

use super::diesel_models::{
    MergeRequestPayloadChanges, MergeRequestRecord, MergeRequestReviewRecord,
};
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::{parse_datetime, parse_datetime_opt, parse_string_list, string_list_json};
use crate::models::{MergeRequest, MergeRequestReview, MergeRequestState};
use crate::schema::{commits, merge_request_reviews, merge_requests, repositories};

/// Convert a database record to a domain model.
impl From<MergeRequestRecord> for MergeRequest {
    fn from(record: MergeRequestRecord) -> Self {
        MergeRequest {
            id: record.id,
            external_id: record.external_id,
            repository_id: record.repository_id,
            author_id: record.author_id,
            title: record.title,
            description: record.description,
            state: MergeRequestState::from_str(&record.state).unwrap_or(MergeRequestState::Open),
            is_draft: record.is_draft,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
            closed_at: parse_datetime_opt(record.closed_at),
            merged_at: parse_datetime_opt(record.merged_at),
            merged_by_id: record.merged_by_id,
            commits_count: record.commits_count,
            additions: record.additions,
            deletions: record.deletions,
            changed_files: record.changed_files,
            comments: record.comments,
            review_comments: record.review_comments,
            labels: parse_string_list(&record.labels),
            source_branch: record.source_branch,
            target_branch: record.target_branch,
            is_enriched: record.is_enriched,
            enrichment_attempts: record.enrichment_attempts,
            enrichment_error: record.enrichment_error,
        }
    }
}

impl From<MergeRequestReviewRecord> for MergeRequestReview {
    fn from(record: MergeRequestReviewRecord) -> Self {
        MergeRequestReview {
            external_id: record.external_id,
            merge_request_id: record.merge_request_id,
            reviewer_id: record.reviewer_id,
            state: record.state,
            submitted_at: parse_datetime_opt(record.submitted_at),
        }
    }
}

/// Payload fields of a pull request as listed by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequestUpsert {
    pub repository_id: String,
    pub number: i32,
    pub author_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub state: MergeRequestState,
    pub is_draft: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub merged_by_id: Option<String>,
    pub labels: Vec<String>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
}

/// Counters only present on the single pull request payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeRequestDetail {
    pub commits_count: i32,
    pub additions: i32,
    pub deletions: i32,
    pub changed_files: i32,
    pub comments: i32,
    pub review_comments: i32,
    pub merged_by_id: Option<String>,
    /// Commit created by merging, attributed back to the merge request.
    pub merge_commit_sha: Option<String>,
}

/// A review as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewUpsert {
    pub external_id: String,
    pub reviewer_id: Option<String>,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Result of a guarded upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeRequestWrite {
    Inserted(String),
    Updated(String),
    /// The stored row is newer than the payload.
    Stale(String),
}

impl MergeRequestWrite {
    pub fn id(&self) -> &str {
        match self {
            MergeRequestWrite::Inserted(id)
            | MergeRequestWrite::Updated(id)
            | MergeRequestWrite::Stale(id) => id,
        }
    }
}

fn fmt_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(|d| d.to_rfc3339())
}

/// Insert or update a merge request unless the stored row is newer. A newer
/// payload resets enrichment so the counters get refreshed.
pub(crate) fn upsert_in(
    conn: &mut SqliteConnection,
    mr: &MergeRequestUpsert,
) -> Result<MergeRequestWrite, DieselError> {
    let existing: Option<(String, String)> = merge_requests::table
        .filter(merge_requests::repository_id.eq(&mr.repository_id))
        .filter(merge_requests::external_id.eq(mr.number))
        .select((merge_requests::id, merge_requests::updated_at))
        .first(conn)
        .optional()?;

    let Some((id, stored_updated_at)) = existing else {
        let id = uuid::Uuid::new_v4().to_string();
        let record = MergeRequestRecord {
            id: id.clone(),
            external_id: mr.number,
            repository_id: mr.repository_id.clone(),
            author_id: mr.author_id.clone(),
            title: mr.title.clone(),
            description: mr.description.clone(),
            state: mr.state.as_str().to_string(),
            is_draft: mr.is_draft,
            created_at: mr.created_at.to_rfc3339(),
            updated_at: mr.updated_at.to_rfc3339(),
            closed_at: fmt_opt(mr.closed_at),
            merged_at: fmt_opt(mr.merged_at),
            merged_by_id: mr.merged_by_id.clone(),
            commits_count: 0,
            additions: 0,
            deletions: 0,
            changed_files: 0,
            comments: 0,
            review_comments: 0,
            labels: string_list_json(&mr.labels),
            source_branch: mr.source_branch.clone(),
            target_branch: mr.target_branch.clone(),
            is_enriched: false,
            enrichment_attempts: 0,
            enrichment_error: None,
        };
        diesel::insert_into(merge_requests::table)
            .values(&record)
            .execute(conn)?;
        return Ok(MergeRequestWrite::Inserted(id));
    };

    let stored_updated_at = parse_datetime(&stored_updated_at);
    if stored_updated_at > mr.updated_at {
        return Ok(MergeRequestWrite::Stale(id));
    }

    let changes = MergeRequestPayloadChanges {
        author_id: mr.author_id.clone(),
        title: mr.title.clone(),
        description: mr.description.clone(),
        state: mr.state.as_str().to_string(),
        is_draft: mr.is_draft,
        updated_at: mr.updated_at.to_rfc3339(),
        closed_at: fmt_opt(mr.closed_at),
        merged_at: fmt_opt(mr.merged_at),
        labels: string_list_json(&mr.labels),
        source_branch: mr.source_branch.clone(),
        target_branch: mr.target_branch.clone(),
    };
    diesel::update(merge_requests::table.find(&id))
        .set(&changes)
        .execute(conn)?;
    // List payloads omit merged_by; keep what enrichment found.
    if mr.merged_by_id.is_some() {
        diesel::update(merge_requests::table.find(&id))
            .set(merge_requests::merged_by_id.eq(&mr.merged_by_id))
            .execute(conn)?;
    }

    if stored_updated_at < mr.updated_at {
        diesel::update(merge_requests::table.find(&id))
            .set((
                merge_requests::is_enriched.eq(false),
                merge_requests::enrichment_attempts.eq(0),
                merge_requests::enrichment_error.eq(None::<String>),
            ))
            .execute(conn)?;
    }
    Ok(MergeRequestWrite::Updated(id))
}

/// Upsert reviews of a merge request by their GitHub id.
pub(crate) fn upsert_reviews_in(
    conn: &mut SqliteConnection,
    merge_request_id: &str,
    reviews: &[ReviewUpsert],
) -> Result<usize, DieselError> {
    let mut written = 0;
    for review in reviews {
        let record = MergeRequestReviewRecord {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: review.external_id.clone(),
            merge_request_id: merge_request_id.to_string(),
            reviewer_id: review.reviewer_id.clone(),
            state: review.state.clone(),
            submitted_at: fmt_opt(review.submitted_at),
        };
        written += diesel::insert_into(merge_request_reviews::table)
            .values(&record)
            .on_conflict(merge_request_reviews::external_id)
            .do_update()
            .set((
                merge_request_reviews::reviewer_id.eq(excluded(merge_request_reviews::reviewer_id)),
                merge_request_reviews::state.eq(excluded(merge_request_reviews::state)),
                merge_request_reviews::submitted_at.eq(excluded(merge_request_reviews::submitted_at)),
            ))
            .execute(conn)?;
    }
    Ok(written)
}

/// Diesel-based merge request repository.
#[derive(Clone)]
pub struct DieselMergeRequestRepository {
    pool: SqlitePool,
}

impl DieselMergeRequestRepository {
    /// Create a new Diesel merge request repository with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Guarded upsert of a listed pull request.
    pub async fn upsert(&self, mr: MergeRequestUpsert) -> Result<MergeRequestWrite, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| upsert_in(conn, &mr))
        })
        .await
    }

    /// Get a merge request by repository and number.
    pub async fn get(
        &self,
        repository_id: &str,
        number: i32,
    ) -> Result<Option<MergeRequest>, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            merge_requests::table
                .filter(merge_requests::repository_id.eq(&repository_id))
                .filter(merge_requests::external_id.eq(number))
                .first::<MergeRequestRecord>(conn)
                .optional()
        })
        .await
        .map(|opt| opt.map(MergeRequest::from))
    }

    /// All merge requests of a repository.
    pub async fn list_for_repository(
        &self,
        repository_id: &str,
    ) -> Result<Vec<MergeRequest>, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            merge_requests::table
                .filter(merge_requests::repository_id.eq(&repository_id))
                .order(merge_requests::external_id.asc())
                .load::<MergeRequestRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(MergeRequest::from).collect())
    }

    /// Count merge requests of a repository.
    pub async fn count_for_repository(&self, repository_id: &str) -> Result<i64, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            merge_requests::table
                .filter(merge_requests::repository_id.eq(&repository_id))
                .count()
                .get_result::<i64>(conn)
        })
        .await
    }

    /// Reviews on every merge request of a repository.
    pub async fn reviews_for_repository(
        &self,
        repository_id: &str,
    ) -> Result<Vec<MergeRequestReview>, DieselError> {
        let repository_id = repository_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            merge_request_reviews::table
                .inner_join(merge_requests::table)
                .filter(merge_requests::repository_id.eq(&repository_id))
                .select(MergeRequestReviewRecord::as_select())
                .load::<MergeRequestReviewRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(MergeRequestReview::from).collect())
    }

    /// Merge requests still eligible for enrichment, as
    /// `(id, repository full name, number)`.
    pub async fn enrichment_candidates(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<(String, String, i32)>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            merge_requests::table
                .inner_join(repositories::table)
                .filter(merge_requests::is_enriched.eq(false))
                .filter(merge_requests::enrichment_attempts.lt(max_attempts))
                .order((
                    merge_requests::enrichment_attempts.asc(),
                    merge_requests::updated_at.desc(),
                ))
                .select((
                    merge_requests::id,
                    repositories::full_name,
                    merge_requests::external_id,
                ))
                .limit(limit)
                .load::<(String, String, i32)>(conn)
        })
        .await
    }

    pub async fn count_enrichment_candidates(&self, max_attempts: i32) -> Result<i64, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            merge_requests::table
                .filter(merge_requests::is_enriched.eq(false))
                .filter(merge_requests::enrichment_attempts.lt(max_attempts))
                .count()
                .get_result::<i64>(conn)
        })
        .await
    }

    /// Store detail counters and reviews, and mark enriched.
    pub async fn apply_enrichment(
        &self,
        id: &str,
        detail: MergeRequestDetail,
        reviews: Vec<ReviewUpsert>,
    ) -> Result<(), DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                diesel::update(merge_requests::table.find(&id))
                    .set((
                        merge_requests::commits_count.eq(detail.commits_count),
                        merge_requests::additions.eq(detail.additions),
                        merge_requests::deletions.eq(detail.deletions),
                        merge_requests::changed_files.eq(detail.changed_files),
                        merge_requests::comments.eq(detail.comments),
                        merge_requests::review_comments.eq(detail.review_comments),
                        merge_requests::is_enriched.eq(true),
                        merge_requests::enrichment_attempts
                            .eq(merge_requests::enrichment_attempts + 1),
                        merge_requests::enrichment_error.eq(None::<String>),
                    ))
                    .execute(conn)?;
                if detail.merged_by_id.is_some() {
                    diesel::update(merge_requests::table.find(&id))
                        .set(merge_requests::merged_by_id.eq(&detail.merged_by_id))
                        .execute(conn)?;
                }
                if let Some(ref sha) = detail.merge_commit_sha {
                    let repository_id: String = merge_requests::table
                        .find(&id)
                        .select(merge_requests::repository_id)
                        .first(conn)?;
                    diesel::update(
                        commits::table
                            .filter(commits::repository_id.eq(&repository_id))
                            .filter(commits::sha.eq(sha)),
                    )
                    .set(commits::pull_request_id.eq(&id))
                    .execute(conn)?;
                }
                upsert_reviews_in(conn, &id, &reviews)?;
                Ok(())
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
            diesel::update(merge_requests::table.find(&id))
                .set((
                    merge_requests::enrichment_attempts.eq(merge_requests::enrichment_attempts + 1),
                    merge_requests::enrichment_error.eq(&error),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}
