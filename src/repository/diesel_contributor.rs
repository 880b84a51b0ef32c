//! Diesel-based contributor repository for SQLite.
//!
//! Contributors are keyed by GitHub account id. Commit authors without an
//! account are stored as placeholders keyed by a hash of their name, and are
//! folded into the real account once one with a matching login or display
//! name is seen.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel::upsert::excluded;
use diesel::SqliteConnection;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::diesel_models::ContributorRecord;
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::{parse_datetime_opt, parse_string_list, string_list_json};
use crate::models::{
    file_extension, language_for_extension, Contributor, ContributorRole, MergeRequestState,
};
use crate::schema::{
    commits, contributor_repositories, contributors, merge_request_reviews, merge_requests,
};

/// Prefix of placeholder external ids.
pub const PLACEHOLDER_PREFIX: &str = "placeholder:";

/// Number of languages kept in `top_languages`.
const TOP_LANGUAGES: usize = 5;

/// Convert a database record to a domain model.
impl From<ContributorRecord> for Contributor {
    fn from(record: ContributorRecord) -> Self {
        Contributor {
            id: record.id,
            external_id: record.external_id,
            username: record.username,
            name: record.name,
            avatar: record.avatar,
            bio: record.bio,
            company: record.company,
            location: record.location,
            followers: record.followers,
            repositories: record.repositories,
            impact_score: record.impact_score,
            role_classification: record
                .role_classification
                .as_deref()
                .and_then(ContributorRole::from_str),
            top_languages: parse_string_list(&record.top_languages),
            organizations: parse_string_list(&record.organizations),
            first_contribution: parse_datetime_opt(record.first_contribution),
            last_contribution: parse_datetime_opt(record.last_contribution),
            direct_commits: record.direct_commits,
            pull_requests_merged: record.pull_requests_merged,
            pull_requests_rejected: record.pull_requests_rejected,
            code_reviews: record.code_reviews,
            is_placeholder: record.is_placeholder,
            is_bot: record.is_bot,
            is_enriched: record.is_enriched,
            enrichment_attempts: record.enrichment_attempts,
            enrichment_error: record.enrichment_error,
        }
    }
}

/// Account identity as it appears in list payloads (author, reviewer, owner).
#[derive(Debug, Clone, PartialEq)]
pub struct ContributorUpsert {
    pub external_id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub is_bot: bool,
}

/// Profile fields filled in by enrichment.
#[derive(Debug, Clone, Default)]
pub struct ContributorProfile {
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub followers: i32,
    pub public_repos: i32,
    pub is_bot: bool,
    pub organizations: Vec<String>,
}

#[derive(QueryableByName)]
struct ContributorId {
    #[diesel(sql_type = Text)]
    id: String,
}

/// External id of the placeholder for a commit author name.
pub fn placeholder_key(name: &str) -> String {
    let digest = Sha256::digest(name.trim().to_lowercase().as_bytes());
    format!("{}{}", PLACEHOLDER_PREFIX, &hex::encode(digest)[..16])
}

fn blank_record(id: String, external_id: String, now: &str) -> ContributorRecord {
    ContributorRecord {
        id,
        external_id,
        username: None,
        name: None,
        avatar: None,
        bio: None,
        company: None,
        location: None,
        followers: 0,
        repositories: 0,
        impact_score: 0.0,
        role_classification: None,
        top_languages: "[]".to_string(),
        organizations: "[]".to_string(),
        first_contribution: None,
        last_contribution: None,
        direct_commits: 0,
        pull_requests_merged: 0,
        pull_requests_rejected: 0,
        code_reviews: 0,
        is_placeholder: false,
        is_bot: false,
        is_enriched: false,
        enrichment_attempts: 0,
        enrichment_error: None,
        created_at: now.to_string(),
        updated_at: now.to_string(),
    }
}

fn id_for_external(conn: &mut SqliteConnection, external_id: &str) -> Result<String, DieselError> {
    contributors::table
        .filter(contributors::external_id.eq(external_id))
        .select(contributors::id)
        .first::<String>(conn)
}

/// Id of a contributor by external id, on the caller's connection.
pub(crate) fn id_by_external_in(
    conn: &mut SqliteConnection,
    external_id: &str,
) -> Result<Option<String>, DieselError> {
    contributors::table
        .filter(contributors::external_id.eq(external_id))
        .select(contributors::id)
        .first::<String>(conn)
        .optional()
}

/// Insert or refresh an account and return its id. Enriched profile fields
/// are left alone.
pub(crate) fn upsert_account_in(
    conn: &mut SqliteConnection,
    account: &ContributorUpsert,
) -> Result<String, DieselError> {
    let now = Utc::now().to_rfc3339();
    let mut record = blank_record(
        uuid::Uuid::new_v4().to_string(),
        account.external_id.clone(),
        &now,
    );
    record.username = Some(account.username.clone());
    record.avatar = account.avatar.clone();
    record.is_bot = account.is_bot;

    diesel::insert_into(contributors::table)
        .values(&record)
        .on_conflict(contributors::external_id)
        .do_update()
        .set((
            contributors::username.eq(excluded(contributors::username)),
            contributors::avatar.eq(excluded(contributors::avatar)),
            contributors::is_bot.eq(excluded(contributors::is_bot)),
            contributors::updated_at.eq(excluded(contributors::updated_at)),
        ))
        .execute(conn)?;

    let id = id_for_external(conn, &account.external_id)?;
    reconcile_placeholders_in(conn, &id, &[account.username.as_str()])?;
    Ok(id)
}

/// Resolve a commit author known only by name. Reuses a real account whose
/// login or display name matches, otherwise creates the placeholder.
pub(crate) fn upsert_placeholder_in(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<String, DieselError> {
    let name = name.trim();
    let existing = diesel::sql_query(
        "SELECT id FROM contributors WHERE is_placeholder = 0 \
         AND (lower(username) = lower(?) OR lower(name) = lower(?)) \
         ORDER BY created_at LIMIT 1",
    )
    .bind::<Text, _>(name)
    .bind::<Text, _>(name)
    .get_result::<ContributorId>(conn)
    .optional()?;
    if let Some(row) = existing {
        return Ok(row.id);
    }

    let key = placeholder_key(name);
    let now = Utc::now().to_rfc3339();
    let mut record = blank_record(uuid::Uuid::new_v4().to_string(), key.clone(), &now);
    record.name = Some(name.to_string());
    record.is_placeholder = true;

    diesel::insert_into(contributors::table)
        .values(&record)
        .on_conflict(contributors::external_id)
        .do_nothing()
        .execute(conn)?;
    id_for_external(conn, &key)
}

/// Fold placeholders whose name matches one of `names` into `real_id`.
pub(crate) fn reconcile_placeholders_in(
    conn: &mut SqliteConnection,
    real_id: &str,
    names: &[&str],
) -> Result<usize, DieselError> {
    let keys: Vec<String> = names
        .iter()
        .filter(|n| !n.trim().is_empty())
        .map(|n| placeholder_key(n))
        .collect();
    if keys.is_empty() {
        return Ok(0);
    }

    let placeholder_ids: Vec<String> = contributors::table
        .filter(contributors::is_placeholder.eq(true))
        .filter(contributors::external_id.eq_any(&keys))
        .select(contributors::id)
        .load(conn)?;

    for placeholder_id in &placeholder_ids {
        diesel::update(commits::table.filter(commits::contributor_id.eq(placeholder_id)))
            .set(commits::contributor_id.eq(real_id))
            .execute(conn)?;
        diesel::delete(
            contributor_repositories::table
                .filter(contributor_repositories::contributor_id.eq(placeholder_id)),
        )
        .execute(conn)?;
        diesel::delete(contributors::table.find(placeholder_id)).execute(conn)?;
        debug!("Reconciled placeholder {} into {}", placeholder_id, real_id);
    }
    Ok(placeholder_ids.len())
}

/// Diesel-based contributor repository.
#[derive(Clone)]
pub struct DieselContributorRepository {
    pool: SqlitePool,
}

impl DieselContributorRepository {
    /// Create a new Diesel contributor repository with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh an account.
    pub async fn upsert_account(&self, account: ContributorUpsert) -> Result<String, DieselError> {
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| upsert_account_in(conn, &account))
        })
        .await
    }

    /// Resolve a name-only commit author.
    pub async fn upsert_placeholder(&self, name: &str) -> Result<String, DieselError> {
        let name = name.to_string();
        let pool = self.pool.clone();
        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| upsert_placeholder_in(conn, &name))
        })
        .await
    }

    /// Get a contributor by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Contributor>, DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            contributors::table
                .find(&id)
                .first::<ContributorRecord>(conn)
                .optional()
        })
        .await
        .map(|opt| opt.map(Contributor::from))
    }

    /// Get a contributor by login.
    pub async fn find_by_username(&self, username: &str) -> Result<Option<Contributor>, DieselError> {
        let username = username.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            contributors::table
                .filter(contributors::username.eq(&username))
                .first::<ContributorRecord>(conn)
                .optional()
        })
        .await
        .map(|opt| opt.map(Contributor::from))
    }

    /// Get all contributors.
    pub async fn get_all(&self) -> Result<Vec<Contributor>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            contributors::table
                .order(contributors::created_at.asc())
                .load::<ContributorRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(Contributor::from).collect())
    }

    /// Accounts still eligible for enrichment, as `(id, login)` pairs.
    pub async fn enrichment_candidates(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<(String, String)>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let rows: Vec<(String, Option<String>)> = contributors::table
                .filter(contributors::is_enriched.eq(false))
                .filter(contributors::is_placeholder.eq(false))
                .filter(contributors::enrichment_attempts.lt(max_attempts))
                .filter(contributors::username.is_not_null())
                .order((contributors::enrichment_attempts.asc(), contributors::created_at.asc()))
                .select((contributors::id, contributors::username))
                .limit(limit)
                .load(conn)?;
            Ok(rows
                .into_iter()
                .filter_map(|(id, login)| login.map(|login| (id, login)))
                .collect())
        })
        .await
    }

    /// Count of accounts still eligible for enrichment.
    pub async fn count_enrichment_candidates(&self, max_attempts: i32) -> Result<i64, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            contributors::table
                .filter(contributors::is_enriched.eq(false))
                .filter(contributors::is_placeholder.eq(false))
                .filter(contributors::enrichment_attempts.lt(max_attempts))
                .filter(contributors::username.is_not_null())
                .count()
                .get_result::<i64>(conn)
        })
        .await
    }

    /// Count of rankable contributors (real, non-bot accounts).
    pub async fn count_rankable(&self) -> Result<i64, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            contributors::table
                .filter(contributors::is_bot.eq(false))
                .filter(contributors::is_placeholder.eq(false))
                .count()
                .get_result::<i64>(conn)
        })
        .await
    }

    /// Store an enriched profile and fold matching placeholders into it.
    pub async fn apply_profile(
        &self,
        id: &str,
        profile: ContributorProfile,
    ) -> Result<(), DieselError> {
        let id = id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let now = Utc::now().to_rfc3339();
                diesel::update(contributors::table.find(&id))
                    .set((
                        contributors::name.eq(&profile.name),
                        contributors::avatar.eq(&profile.avatar),
                        contributors::bio.eq(&profile.bio),
                        contributors::company.eq(&profile.company),
                        contributors::location.eq(&profile.location),
                        contributors::followers.eq(profile.followers),
                        contributors::repositories.eq(profile.public_repos),
                        contributors::is_bot.eq(profile.is_bot),
                        contributors::organizations.eq(string_list_json(&profile.organizations)),
                        contributors::is_enriched.eq(true),
                        contributors::enrichment_attempts.eq(contributors::enrichment_attempts + 1),
                        contributors::enrichment_error.eq(None::<String>),
                        contributors::updated_at.eq(&now),
                    ))
                    .execute(conn)?;

                let username: Option<String> = contributors::table
                    .find(&id)
                    .select(contributors::username)
                    .first(conn)?;
                let mut names: Vec<&str> = Vec::new();
                if let Some(ref login) = username {
                    names.push(login);
                }
                if let Some(ref name) = profile.name {
                    names.push(name);
                }
                reconcile_placeholders_in(conn, &id, &names)?;
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
            diesel::update(contributors::table.find(&id))
                .set((
                    contributors::enrichment_attempts.eq(contributors::enrichment_attempts + 1),
                    contributors::enrichment_error.eq(&error),
                    contributors::updated_at.eq(Utc::now().to_rfc3339()),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    /// Recompute activity totals and top languages from the link table,
    /// merge requests, reviews and enriched commit rows.
    pub async fn refresh_aggregates(&self) -> Result<usize, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let links: Vec<(String, i32, Option<String>, Option<String>)> =
                    contributor_repositories::table
                        .select((
                            contributor_repositories::contributor_id,
                            contributor_repositories::commit_count,
                            contributor_repositories::first_contribution_date,
                            contributor_repositories::last_contribution_date,
                        ))
                        .load(conn)?;
                let authored: Vec<(Option<String>, String)> = merge_requests::table
                    .select((merge_requests::author_id, merge_requests::state))
                    .load(conn)?;
                let reviewers: Vec<Option<String>> = merge_request_reviews::table
                    .select(merge_request_reviews::reviewer_id)
                    .load(conn)?;
                let files: Vec<(Option<String>, String)> = commits::table
                    .filter(commits::filename.ne(""))
                    .select((commits::contributor_id, commits::filename))
                    .load(conn)?;

                let mut totals: HashMap<String, Aggregates> = HashMap::new();
                for (contributor_id, commit_count, first, last) in links {
                    let agg = totals.entry(contributor_id).or_default();
                    agg.commits += commit_count;
                    agg.observe(parse_datetime_opt(first), parse_datetime_opt(last));
                }
                for (author_id, state) in authored {
                    let Some(author_id) = author_id else { continue };
                    let agg = totals.entry(author_id).or_default();
                    match MergeRequestState::from_str(&state) {
                        Some(MergeRequestState::Merged) => agg.merged += 1,
                        Some(MergeRequestState::Closed) => agg.rejected += 1,
                        _ => {}
                    }
                }
                for reviewer_id in reviewers.into_iter().flatten() {
                    totals.entry(reviewer_id).or_default().reviews += 1;
                }
                for (contributor_id, filename) in files {
                    let Some(contributor_id) = contributor_id else { continue };
                    if let Some(ext) = file_extension(&filename) {
                        *totals
                            .entry(contributor_id)
                            .or_default()
                            .languages
                            .entry(language_for_extension(&ext))
                            .or_insert(0) += 1;
                    }
                }

                let ids: Vec<String> = contributors::table.select(contributors::id).load(conn)?;
                let now = Utc::now().to_rfc3339();
                for id in &ids {
                    let agg = totals.remove(id).unwrap_or_default();
                    diesel::update(contributors::table.find(id))
                        .set((
                            contributors::direct_commits.eq(agg.commits),
                            contributors::pull_requests_merged.eq(agg.merged),
                            contributors::pull_requests_rejected.eq(agg.rejected),
                            contributors::code_reviews.eq(agg.reviews),
                            contributors::first_contribution.eq(agg.first.map(|d| d.to_rfc3339())),
                            contributors::last_contribution.eq(agg.last.map(|d| d.to_rfc3339())),
                            contributors::top_languages.eq(string_list_json(&agg.top_languages())),
                            contributors::updated_at.eq(&now),
                        ))
                        .execute(conn)?;
                }
                Ok(ids.len())
            })
        })
        .await
    }
}

#[derive(Default)]
struct Aggregates {
    commits: i32,
    merged: i32,
    rejected: i32,
    reviews: i32,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
    languages: BTreeMap<String, u32>,
}

impl Aggregates {
    fn observe(&mut self, first: Option<DateTime<Utc>>, last: Option<DateTime<Utc>>) {
        if let Some(first) = first {
            self.first = Some(self.first.map_or(first, |cur| cur.min(first)));
        }
        if let Some(last) = last {
            self.last = Some(self.last.map_or(last, |cur| cur.max(last)));
        }
    }

    /// Most-touched languages first, ties alphabetical.
    fn top_languages(&self) -> Vec<String> {
        let mut langs: Vec<(&String, &u32)> = self.languages.iter().collect();
        langs.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        langs
            .into_iter()
            .take(TOP_LANGUAGES)
            .map(|(lang, _)| lang.clone())
            .collect()
    }
}
