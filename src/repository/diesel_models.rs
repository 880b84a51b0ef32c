//! Diesel ORM models for database tables.
//!
//! These models provide compile-time type checking for database operations.
//! Timestamps are RFC 3339 text and list/object columns are JSON text; the
//! conversions to domain models live next to each repository.

use diesel::prelude::*;

use crate::schema;

/// Raw intake record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::raw_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawRecordRow {
    pub id: i32,
    pub entity_type: String,
    pub external_id: String,
    pub payload: String,
    pub fetched_at: String,
    pub api_endpoint: String,
    pub etag: Option<String>,
    pub is_processed: bool,
}

/// New raw record for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::raw_records)]
pub struct NewRawRecord<'a> {
    pub entity_type: &'a str,
    pub external_id: &'a str,
    pub payload: &'a str,
    pub fetched_at: &'a str,
    pub api_endpoint: &'a str,
    pub etag: Option<&'a str>,
    pub is_processed: bool,
}

/// Repository record from the database.
#[derive(Queryable, Selectable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::repositories)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RepositoryRecord {
    pub id: String,
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
    pub is_enriched: bool,
    pub enrichment_attempts: i32,
    pub enrichment_error: Option<String>,
    pub health_percentage: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Repository snapshot record from the database.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::repository_snapshots)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RepositorySnapshotRecord {
    pub id: i32,
    pub repository_id: String,
    pub stars: i32,
    pub forks: i32,
    pub watchers: i32,
    pub recorded_at: String,
}

/// New repository snapshot for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::repository_snapshots)]
pub struct NewRepositorySnapshot<'a> {
    pub repository_id: &'a str,
    pub stars: i32,
    pub forks: i32,
    pub watchers: i32,
    pub recorded_at: &'a str,
}

/// Latest processor output for a repository.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::repository_stats)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RepositoryStatsRecord {
    pub repository_id: String,
    pub stats: String,
    pub health_score: Option<f64>,
    pub computed_at: String,
}

/// Contributor record from the database.
#[derive(Queryable, Selectable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::contributors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ContributorRecord {
    pub id: String,
    pub external_id: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub followers: i32,
    pub repositories: i32,
    pub impact_score: f64,
    pub role_classification: Option<String>,
    pub top_languages: String,
    pub organizations: String,
    pub first_contribution: Option<String>,
    pub last_contribution: Option<String>,
    pub direct_commits: i32,
    pub pull_requests_merged: i32,
    pub pull_requests_rejected: i32,
    pub code_reviews: i32,
    pub is_placeholder: bool,
    pub is_bot: bool,
    pub is_enriched: bool,
    pub enrichment_attempts: i32,
    pub enrichment_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Merge request record from the database.
#[derive(Queryable, Selectable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::merge_requests)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MergeRequestRecord {
    pub id: String,
    pub external_id: i32,
    pub repository_id: String,
    pub author_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub state: String,
    pub is_draft: bool,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
    pub merged_at: Option<String>,
    pub merged_by_id: Option<String>,
    pub commits_count: i32,
    pub additions: i32,
    pub deletions: i32,
    pub changed_files: i32,
    pub comments: i32,
    pub review_comments: i32,
    pub labels: String,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
    pub is_enriched: bool,
    pub enrichment_attempts: i32,
    pub enrichment_error: Option<String>,
}

/// Payload-derived columns of a merge request, applied on re-extraction.
#[derive(AsChangeset, Debug)]
#[diesel(table_name = schema::merge_requests)]
#[diesel(treat_none_as_null = true)]
pub struct MergeRequestPayloadChanges {
    pub author_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub state: String,
    pub is_draft: bool,
    pub updated_at: String,
    pub closed_at: Option<String>,
    pub merged_at: Option<String>,
    pub labels: String,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
}

/// Merge request review record.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::merge_request_reviews)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct MergeRequestReviewRecord {
    pub id: String,
    pub external_id: String,
    pub merge_request_id: String,
    pub reviewer_id: Option<String>,
    pub state: String,
    pub submitted_at: Option<String>,
}

/// Commit file-row record from the database.
#[derive(Queryable, Selectable, Insertable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::commits)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CommitRecord {
    pub id: String,
    pub sha: String,
    pub repository_id: String,
    pub contributor_id: Option<String>,
    pub pull_request_id: Option<String>,
    pub message: String,
    pub committed_at: String,
    pub filename: String,
    pub status: String,
    pub additions: i32,
    pub deletions: i32,
    pub patch: Option<String>,
    pub is_merge_commit: bool,
    pub is_enriched: bool,
    pub enrichment_attempts: i32,
    pub enrichment_error: Option<String>,
}

/// Contributor/repository junction record.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::contributor_repositories)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ContributorRepositoryRecord {
    pub contributor_id: String,
    pub repository_id: String,
    pub commit_count: i32,
    pub pull_requests: i32,
    pub reviews: i32,
    pub issues_opened: i32,
    pub lines_added: i32,
    pub lines_removed: i32,
    pub first_contribution_date: Option<String>,
    pub last_contribution_date: Option<String>,
}

/// Ranking snapshot row.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::contributor_rankings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ContributorRankingRecord {
    pub id: String,
    pub contributor_id: String,
    pub rank_position: i32,
    pub total_score: f64,
    pub component_scores: String,
    pub raw_metrics: String,
    pub calculation_timestamp: String,
}

/// Pipeline schedule record.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::pipeline_schedules)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PipelineScheduleRecord {
    pub id: String,
    pub pipeline_type: String,
    pub cron_expression: String,
    pub is_active: bool,
    pub parameters: String,
}

/// Pipeline run (history) record.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::pipeline_runs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PipelineRunRecord {
    pub id: String,
    pub pipeline_type: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub items_processed: i32,
    pub error_message: Option<String>,
}

/// Current pipeline state record.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::pipeline_state)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PipelineStateRecord {
    pub pipeline_type: String,
    pub status: String,
    pub is_running: bool,
    pub last_run: Option<String>,
    pub updated_at: String,
}
