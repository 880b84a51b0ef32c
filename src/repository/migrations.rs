//! Schema creation for the SQLite database.
//!
//! Statements are idempotent (`IF NOT EXISTS`) so they can run on every
//! startup. The unique indexes are the conflict targets of the upserts in the
//! entity repositories and must stay in sync with them.

use diesel::prelude::*;
use tracing::debug;

use super::diesel_pool::{run_blocking, DieselError, SqlitePool};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS raw_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_type TEXT NOT NULL,
        external_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        fetched_at TEXT NOT NULL,
        api_endpoint TEXT NOT NULL,
        etag TEXT,
        is_processed BOOLEAN NOT NULL DEFAULT 0
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_raw_records_key ON raw_records(entity_type, external_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_raw_records_pending ON raw_records(is_processed, id)",
    r#"CREATE TABLE IF NOT EXISTS repositories (
        id TEXT PRIMARY KEY,
        external_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        full_name TEXT NOT NULL UNIQUE,
        description TEXT,
        url TEXT NOT NULL,
        stars INTEGER NOT NULL DEFAULT 0,
        forks INTEGER NOT NULL DEFAULT 0,
        size_kb INTEGER NOT NULL DEFAULT 0,
        watchers INTEGER NOT NULL DEFAULT 0,
        primary_language TEXT,
        license TEXT,
        is_fork BOOLEAN NOT NULL DEFAULT 0,
        is_archived BOOLEAN NOT NULL DEFAULT 0,
        owner_id TEXT,
        is_enriched BOOLEAN NOT NULL DEFAULT 0,
        enrichment_attempts INTEGER NOT NULL DEFAULT 0,
        enrichment_error TEXT,
        health_percentage DOUBLE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS repository_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        stars INTEGER NOT NULL,
        forks INTEGER NOT NULL,
        watchers INTEGER NOT NULL,
        recorded_at TEXT NOT NULL
    )"#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_repo_recorded ON repository_snapshots(repository_id, recorded_at)",
    r#"CREATE TABLE IF NOT EXISTS repository_stats (
        repository_id TEXT PRIMARY KEY REFERENCES repositories(id) ON DELETE CASCADE,
        stats TEXT NOT NULL,
        health_score DOUBLE,
        computed_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS contributors (
        id TEXT PRIMARY KEY,
        external_id TEXT NOT NULL UNIQUE,
        username TEXT,
        name TEXT,
        avatar TEXT,
        bio TEXT,
        company TEXT,
        location TEXT,
        followers INTEGER NOT NULL DEFAULT 0,
        repositories INTEGER NOT NULL DEFAULT 0,
        impact_score DOUBLE NOT NULL DEFAULT 0,
        role_classification TEXT,
        top_languages TEXT NOT NULL DEFAULT '[]',
        organizations TEXT NOT NULL DEFAULT '[]',
        first_contribution TEXT,
        last_contribution TEXT,
        direct_commits INTEGER NOT NULL DEFAULT 0,
        pull_requests_merged INTEGER NOT NULL DEFAULT 0,
        pull_requests_rejected INTEGER NOT NULL DEFAULT 0,
        code_reviews INTEGER NOT NULL DEFAULT 0,
        is_placeholder BOOLEAN NOT NULL DEFAULT 0,
        is_bot BOOLEAN NOT NULL DEFAULT 0,
        is_enriched BOOLEAN NOT NULL DEFAULT 0,
        enrichment_attempts INTEGER NOT NULL DEFAULT 0,
        enrichment_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_contributors_username ON contributors(username)",
    r#"CREATE TABLE IF NOT EXISTS merge_requests (
        id TEXT PRIMARY KEY,
        external_id INTEGER NOT NULL,
        repository_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        author_id TEXT,
        title TEXT NOT NULL,
        description TEXT,
        state TEXT NOT NULL,
        is_draft BOOLEAN NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        closed_at TEXT,
        merged_at TEXT,
        merged_by_id TEXT,
        commits_count INTEGER NOT NULL DEFAULT 0,
        additions INTEGER NOT NULL DEFAULT 0,
        deletions INTEGER NOT NULL DEFAULT 0,
        changed_files INTEGER NOT NULL DEFAULT 0,
        comments INTEGER NOT NULL DEFAULT 0,
        review_comments INTEGER NOT NULL DEFAULT 0,
        labels TEXT NOT NULL DEFAULT '[]',
        source_branch TEXT,
        target_branch TEXT,
        is_enriched BOOLEAN NOT NULL DEFAULT 0,
        enrichment_attempts INTEGER NOT NULL DEFAULT 0,
        enrichment_error TEXT,
        UNIQUE (repository_id, external_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS merge_request_reviews (
        id TEXT PRIMARY KEY,
        external_id TEXT NOT NULL UNIQUE,
        merge_request_id TEXT NOT NULL REFERENCES merge_requests(id) ON DELETE CASCADE,
        reviewer_id TEXT,
        state TEXT NOT NULL,
        submitted_at TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS commits (
        id TEXT PRIMARY KEY,
        sha TEXT NOT NULL,
        repository_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        contributor_id TEXT,
        pull_request_id TEXT,
        message TEXT NOT NULL,
        committed_at TEXT NOT NULL,
        filename TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        additions INTEGER NOT NULL DEFAULT 0,
        deletions INTEGER NOT NULL DEFAULT 0,
        patch TEXT,
        is_merge_commit BOOLEAN NOT NULL DEFAULT 0,
        is_enriched BOOLEAN NOT NULL DEFAULT 0,
        enrichment_attempts INTEGER NOT NULL DEFAULT 0,
        enrichment_error TEXT,
        UNIQUE (sha, repository_id, filename)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_commits_contributor ON commits(contributor_id)",
    r#"CREATE TABLE IF NOT EXISTS contributor_repositories (
        contributor_id TEXT NOT NULL,
        repository_id TEXT NOT NULL,
        commit_count INTEGER NOT NULL DEFAULT 0,
        pull_requests INTEGER NOT NULL DEFAULT 0,
        reviews INTEGER NOT NULL DEFAULT 0,
        issues_opened INTEGER NOT NULL DEFAULT 0,
        lines_added INTEGER NOT NULL DEFAULT 0,
        lines_removed INTEGER NOT NULL DEFAULT 0,
        first_contribution_date TEXT,
        last_contribution_date TEXT,
        PRIMARY KEY (contributor_id, repository_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS contributor_rankings (
        id TEXT PRIMARY KEY,
        contributor_id TEXT NOT NULL,
        rank_position INTEGER NOT NULL,
        total_score DOUBLE NOT NULL,
        component_scores TEXT NOT NULL,
        raw_metrics TEXT NOT NULL,
        calculation_timestamp TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_rankings_contributor ON contributor_rankings(contributor_id, calculation_timestamp)",
    r#"CREATE TABLE IF NOT EXISTS pipeline_schedules (
        id TEXT PRIMARY KEY,
        pipeline_type TEXT NOT NULL UNIQUE,
        cron_expression TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        parameters TEXT NOT NULL DEFAULT '{}'
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pipeline_runs (
        id TEXT PRIMARY KEY,
        pipeline_type TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        items_processed INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_pipeline_runs_type ON pipeline_runs(pipeline_type, started_at)",
    r#"CREATE TABLE IF NOT EXISTS pipeline_state (
        pipeline_type TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        is_running BOOLEAN NOT NULL DEFAULT 0,
        last_run TEXT,
        updated_at TEXT NOT NULL
    )"#,
];

/// Create all tables and indexes if they do not exist yet.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DieselError> {
    run_blocking(pool.clone(), |conn| {
        conn.transaction::<_, DieselError, _>(|conn| {
            for statement in SCHEMA {
                diesel::sql_query(*statement).execute(conn)?;
            }
            Ok(())
        })
    })
    .await?;
    debug!("Applied {} schema statements", SCHEMA.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::diesel_pool::create_diesel_pool_from_url;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let db_url = dir.path().join("test.db").display().to_string();
        let pool = create_diesel_pool_from_url(&db_url).unwrap();

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
