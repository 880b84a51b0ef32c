//! Diesel-based ranking snapshot storage for SQLite.
//!
//! Snapshots are immutable. A ranking run writes a whole population in one
//! transaction, all rows sharing one `calculation_timestamp`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use super::diesel_models::{
    ContributorRankingRecord, ContributorRecord, ContributorRepositoryRecord,
};
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::parse_datetime;
use crate::models::{
    Contributor, ContributorRanking, ContributorRepositoryLink, ContributorRole,
    MergeRequestState, RankingTrend,
};
use crate::schema::{
    contributor_rankings, contributor_repositories, contributors, merge_requests, repositories,
};

impl From<ContributorRankingRecord> for ContributorRanking {
    fn from(record: ContributorRankingRecord) -> Self {
        ContributorRanking {
            id: record.id,
            contributor_id: record.contributor_id,
            rank_position: record.rank_position,
            total_score: record.total_score,
            component_scores: serde_json::from_str(&record.component_scores).unwrap_or_default(),
            raw_metrics: serde_json::from_str(&record.raw_metrics).unwrap_or_default(),
            calculation_timestamp: parse_datetime(&record.calculation_timestamp),
        }
    }
}

/// Everything the ranking engine needs about the population, read in one
/// consistent pass.
#[derive(Debug, Clone, Default)]
pub struct RankingInputs {
    /// Rankable contributors: real accounts that are not bots.
    pub contributors: Vec<Contributor>,
    pub links: Vec<ContributorRepositoryLink>,
    /// Stars per repository id.
    pub repository_stars: HashMap<String, i32>,
    /// Pull requests opened per author id.
    pub authored: HashMap<String, i64>,
    /// Other people's pull requests merged, per merger id.
    pub merges_for_others: HashMap<String, i64>,
}

/// Role and score written back onto a contributor with a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ContributorVerdict {
    pub contributor_id: String,
    pub impact_score: f64,
    pub role: ContributorRole,
}

/// Diesel-based ranking repository.
#[derive(Clone)]
pub struct DieselRankingRepository {
    pool: SqlitePool,
}

impl DieselRankingRepository {
    /// Create a new Diesel ranking repository with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Read the population and its activity.
    pub async fn load_inputs(&self) -> Result<RankingInputs, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let contributors: Vec<Contributor> = contributors::table
                    .filter(contributors::is_bot.eq(false))
                    .filter(contributors::is_placeholder.eq(false))
                    .order(contributors::id.asc())
                    .load::<ContributorRecord>(conn)?
                    .into_iter()
                    .map(Contributor::from)
                    .collect();
                let links = contributor_repositories::table
                    .load::<ContributorRepositoryRecord>(conn)?
                    .into_iter()
                    .map(ContributorRepositoryLink::from)
                    .collect();
                let repository_stars = repositories::table
                    .select((repositories::id, repositories::stars))
                    .load::<(String, i32)>(conn)?
                    .into_iter()
                    .collect();

                let pulls: Vec<(Option<String>, Option<String>, String)> = merge_requests::table
                    .select((
                        merge_requests::author_id,
                        merge_requests::merged_by_id,
                        merge_requests::state,
                    ))
                    .load(conn)?;
                let mut authored: HashMap<String, i64> = HashMap::new();
                let mut merges_for_others: HashMap<String, i64> = HashMap::new();
                for (author_id, merged_by_id, state) in pulls {
                    if let Some(ref author) = author_id {
                        *authored.entry(author.clone()).or_insert(0) += 1;
                    }
                    let merged = MergeRequestState::from_str(&state) == Some(MergeRequestState::Merged);
                    if let (true, Some(merger)) = (merged, merged_by_id) {
                        if author_id.as_deref() != Some(merger.as_str()) {
                            *merges_for_others.entry(merger).or_insert(0) += 1;
                        }
                    }
                }

                Ok(RankingInputs {
                    contributors,
                    links,
                    repository_stars,
                    authored,
                    merges_for_others,
                })
            })
        })
        .await
    }

    /// Write a full snapshot plus per-contributor verdicts atomically. Bots
    /// are stamped with the bot role in the same transaction.
    pub async fn save_snapshot(
        &self,
        rankings: Vec<ContributorRanking>,
        verdicts: Vec<ContributorVerdict>,
    ) -> Result<usize, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let records: Vec<ContributorRankingRecord> = rankings
                    .iter()
                    .map(|r| ContributorRankingRecord {
                        id: r.id.clone(),
                        contributor_id: r.contributor_id.clone(),
                        rank_position: r.rank_position,
                        total_score: r.total_score,
                        component_scores: serde_json::to_string(&r.component_scores)
                            .unwrap_or_else(|_| "{}".to_string()),
                        raw_metrics: serde_json::to_string(&r.raw_metrics)
                            .unwrap_or_else(|_| "{}".to_string()),
                        calculation_timestamp: r.calculation_timestamp.to_rfc3339(),
                    })
                    .collect();
                for chunk in records.chunks(500) {
                    diesel::insert_into(contributor_rankings::table)
                        .values(chunk)
                        .execute(conn)?;
                }

                let now = Utc::now().to_rfc3339();
                for verdict in &verdicts {
                    diesel::update(contributors::table.find(&verdict.contributor_id))
                        .set((
                            contributors::impact_score.eq(verdict.impact_score),
                            contributors::role_classification.eq(verdict.role.as_str()),
                            contributors::updated_at.eq(&now),
                        ))
                        .execute(conn)?;
                }
                diesel::update(contributors::table.filter(contributors::is_bot.eq(true)))
                    .set(contributors::role_classification.eq(ContributorRole::Bot.as_str()))
                    .execute(conn)?;
                Ok(records.len())
            })
        })
        .await
    }

    /// Most recent snapshot, best rank first.
    pub async fn latest_snapshot(&self) -> Result<Vec<ContributorRanking>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let latest: Option<String> = contributor_rankings::table
                .select(diesel::dsl::max(contributor_rankings::calculation_timestamp))
                .first(conn)?;
            let Some(latest) = latest else {
                return Ok(Vec::new());
            };
            contributor_rankings::table
                .filter(contributor_rankings::calculation_timestamp.eq(&latest))
                .order((
                    contributor_rankings::rank_position.asc(),
                    contributor_rankings::contributor_id.asc(),
                ))
                .load::<ContributorRankingRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(ContributorRanking::from).collect())
    }

    /// Number of distinct snapshots taken.
    pub async fn snapshot_count(&self) -> Result<i64, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            use diesel::dsl::count_distinct;
            contributor_rankings::table
                .select(count_distinct(contributor_rankings::calculation_timestamp))
                .first::<i64>(conn)
        })
        .await
    }

    /// Rank history of one contributor, newest first.
    pub async fn history(
        &self,
        contributor_id: &str,
        limit: i64,
    ) -> Result<Vec<ContributorRanking>, DieselError> {
        let contributor_id = contributor_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            contributor_rankings::table
                .filter(contributor_rankings::contributor_id.eq(&contributor_id))
                .order(contributor_rankings::calculation_timestamp.desc())
                .limit(limit)
                .load::<ContributorRankingRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().map(ContributorRanking::from).collect())
    }

    /// Movement of every contributor in the latest snapshot against their
    /// previous snapshot.
    pub async fn trends(&self) -> Result<Vec<RankingTrend>, DieselError> {
        let latest = self.latest_snapshot().await?;
        let Some(latest_at) = latest.first().map(|r| r.calculation_timestamp) else {
            return Ok(Vec::new());
        };
        let previous = self.previous_rows(latest_at).await?;

        Ok(latest
            .iter()
            .map(|current| RankingTrend::between(current, previous.get(&current.contributor_id)))
            .collect())
    }

    /// Newest row per contributor strictly older than `before`.
    async fn previous_rows(
        &self,
        before: DateTime<Utc>,
    ) -> Result<HashMap<String, ContributorRanking>, DieselError> {
        let before = before.to_rfc3339();
        let pool = self.pool.clone();

        let rows = run_blocking(pool, move |conn| {
            contributor_rankings::table
                .filter(contributor_rankings::calculation_timestamp.lt(&before))
                .order(contributor_rankings::calculation_timestamp.desc())
                .load::<ContributorRankingRecord>(conn)
        })
        .await?;

        let mut previous = HashMap::new();
        for row in rows.into_iter().map(ContributorRanking::from) {
            previous.entry(row.contributor_id.clone()).or_insert(row);
        }
        Ok(previous)
    }
}
