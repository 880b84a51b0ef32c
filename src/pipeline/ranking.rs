//! contributor_ranking: population-wide, percentile-normalized ranking.
//!
//! Every dimension is scored by percentile rank within the population, so a
//! contributor's score only means something relative to the others. Ranks use
//! competition ranking: equal totals share a rank and the next rank skips.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::context::{AppContext, CancelFlag, JobReport, PipelineError};
use crate::models::{
    ComponentScores, ContributorRanking, ContributorRole, RankingTrend, RawMetrics,
};
use crate::repository::diesel_ranking::{ContributorVerdict, RankingInputs};
use crate::repository::{DieselContributorRepository, DieselRankingRepository};

/// Weight of each ranking dimension. Totals are divided by the weight sum, so
/// the table does not need to add up to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, prefer::FromValue)]
#[serde(default)]
pub struct RankingWeights {
    pub code_volume: f64,
    pub efficiency: f64,
    pub commit_impact: f64,
    pub repo_influence: f64,
    pub followers: f64,
    pub profile_completeness: f64,
    pub collaboration: f64,
    pub repo_popularity: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            code_volume: 0.2,
            efficiency: 0.1,
            commit_impact: 0.2,
            repo_influence: 0.1,
            followers: 0.1,
            profile_completeness: 0.05,
            collaboration: 0.15,
            repo_popularity: 0.1,
        }
    }
}

/// One contributor's place in a computed ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedContributor {
    pub contributor_id: String,
    pub rank: i32,
    pub total_score: f64,
    pub components: ComponentScores,
    pub raw: RawMetrics,
    pub role: ContributorRole,
    merges_for_others: i64,
}

/// Percentile rank of every value: `(count strictly lower + 1) / n * 100`.
/// Ties share the lower percentile; a population of one scores 100.
pub fn percentiles(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    values
        .iter()
        .map(|v| {
            let lower = sorted.partition_point(|x| x < v);
            round2((lower as f64 + 1.0) / n * 100.0)
        })
        .collect()
}

/// Competition ranks of totals sorted best first: `[90, 90, 70, 70, 50]`
/// ranks `[1, 1, 3, 3, 5]`.
pub fn competition_ranks(sorted_totals: &[f64]) -> Vec<i32> {
    let mut ranks = Vec::with_capacity(sorted_totals.len());
    for (i, total) in sorted_totals.iter().enumerate() {
        let rank = match (i, ranks.last()) {
            (0, _) | (_, None) => 1,
            (_, Some(&previous)) if sorted_totals[i - 1] == *total => previous,
            _ => i as i32 + 1,
        };
        ranks.push(rank);
    }
    ranks
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Pure ranking over loaded inputs.
#[derive(Debug, Clone, Default)]
pub struct RankingEngine {
    weights: RankingWeights,
}

impl RankingEngine {
    pub fn new(weights: RankingWeights) -> Self {
        Self { weights }
    }

    /// Raw metrics of every rankable contributor, in input order.
    pub fn raw_metrics(inputs: &RankingInputs) -> Vec<(String, RawMetrics)> {
        let mut per_contributor: HashMap<&str, RawMetrics> = HashMap::new();
        for link in &inputs.links {
            let raw = per_contributor.entry(link.contributor_id.as_str()).or_default();
            raw.lines_added += i64::from(link.lines_added);
            raw.lines_removed += i64::from(link.lines_removed);
            raw.commit_count += i64::from(link.commit_count);
            raw.code_reviews += i64::from(link.reviews);
            raw.repositories_contributed += 1;
            raw.repository_stars += i64::from(
                inputs
                    .repository_stars
                    .get(&link.repository_id)
                    .copied()
                    .unwrap_or(0),
            );
        }

        inputs
            .contributors
            .iter()
            .map(|contributor| {
                let mut raw = per_contributor
                    .remove(contributor.id.as_str())
                    .unwrap_or_default();
                raw.followers = i64::from(contributor.followers);
                raw.profile_completeness = i64::from(contributor.profile_completeness());
                raw.pull_requests_merged = i64::from(contributor.pull_requests_merged);
                raw.pull_requests_opened =
                    inputs.authored.get(&contributor.id).copied().unwrap_or(0);
                (contributor.id.clone(), raw)
            })
            .collect()
    }

    /// Rank the population. Output is best first, ties ordered by id.
    pub fn compute(&self, inputs: &RankingInputs) -> Vec<RankedContributor> {
        let metrics = Self::raw_metrics(inputs);
        if metrics.is_empty() {
            return Vec::new();
        }

        let dimension = |f: fn(&RawMetrics) -> f64| -> Vec<f64> {
            percentiles(&metrics.iter().map(|(_, raw)| f(raw)).collect::<Vec<_>>())
        };
        let code_volume = dimension(|r| (r.lines_added + r.lines_removed) as f64);
        let efficiency = dimension(|r| {
            let lines = (r.lines_added + r.lines_removed).max(1) as f64;
            r.commit_count as f64 / lines
        });
        let commit_impact = dimension(|r| (r.commit_count + r.pull_requests_merged) as f64);
        let repo_influence = dimension(|r| r.repositories_contributed as f64);
        let followers = dimension(|r| r.followers as f64);
        let profile = dimension(|r| r.profile_completeness as f64);
        let collaboration = dimension(|r| (r.code_reviews + r.pull_requests_opened) as f64);
        let popularity = dimension(|r| r.repository_stars as f64);

        let w = &self.weights;
        let weight_sum = w.code_volume
            + w.efficiency
            + w.commit_impact
            + w.repo_influence
            + w.followers
            + w.profile_completeness
            + w.collaboration
            + w.repo_popularity;

        let mut ranked: Vec<RankedContributor> = metrics
            .into_iter()
            .enumerate()
            .map(|(i, (contributor_id, raw))| {
                let components = ComponentScores {
                    code_volume: code_volume[i],
                    efficiency: efficiency[i],
                    commit_impact: commit_impact[i],
                    repo_influence: repo_influence[i],
                    followers: followers[i],
                    profile_completeness: profile[i],
                    collaboration: collaboration[i],
                    repo_popularity: popularity[i],
                };
                let weighted = components.code_volume * w.code_volume
                    + components.efficiency * w.efficiency
                    + components.commit_impact * w.commit_impact
                    + components.repo_influence * w.repo_influence
                    + components.followers * w.followers
                    + components.profile_completeness * w.profile_completeness
                    + components.collaboration * w.collaboration
                    + components.repo_popularity * w.repo_popularity;
                let total_score = if weight_sum > 0.0 {
                    round4(weighted / weight_sum)
                } else {
                    0.0
                };
                let merges_for_others = inputs
                    .merges_for_others
                    .get(&contributor_id)
                    .copied()
                    .unwrap_or(0);
                RankedContributor {
                    contributor_id,
                    rank: 0,
                    total_score,
                    components,
                    raw,
                    role: ContributorRole::Contributor,
                    merges_for_others,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.total_score
                .total_cmp(&a.total_score)
                .then_with(|| a.contributor_id.cmp(&b.contributor_id))
        });
        let totals: Vec<f64> = ranked.iter().map(|r| r.total_score).collect();
        let core_cutoff = ranked.len().div_ceil(10) as i32;
        for (entry, rank) in ranked.iter_mut().zip(competition_ranks(&totals)) {
            entry.rank = rank;
            entry.role = classify(entry, core_cutoff);
        }
        ranked
    }
}

/// Role from activity. Bots never reach here; they are stamped separately.
fn classify(entry: &RankedContributor, core_cutoff: i32) -> ContributorRole {
    let raw = &entry.raw;
    if entry.merges_for_others > 0 {
        ContributorRole::Maintainer
    } else if raw.code_reviews > raw.commit_count {
        ContributorRole::Reviewer
    } else if entry.rank <= core_cutoff {
        ContributorRole::Core
    } else if raw.commit_count <= 2 && raw.pull_requests_merged == 0 {
        ContributorRole::Occasional
    } else {
        ContributorRole::Contributor
    }
}

/// Runs the contributor_ranking pipeline.
pub struct RankingService {
    engine: RankingEngine,
    contributors: DieselContributorRepository,
    rankings: DieselRankingRepository,
}

impl RankingService {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            engine: RankingEngine::new(ctx.settings.ranking_weights.clone()),
            contributors: DieselContributorRepository::new(ctx.pool.clone()),
            rankings: DieselRankingRepository::new(ctx.pool.clone()),
        }
    }

    /// Refresh aggregates, rank, and write the snapshot in one transaction.
    pub async fn run(&self, cancel: &CancelFlag) -> Result<JobReport, PipelineError> {
        self.contributors.refresh_aggregates().await?;
        let inputs = self.rankings.load_inputs().await?;
        let ranked = self.engine.compute(&inputs);

        if cancel.is_cancelled() {
            return Ok(JobReport {
                cancelled: true,
                ..Default::default()
            });
        }

        let calculation_timestamp = Utc::now();
        let mut rankings = Vec::with_capacity(ranked.len());
        let mut verdicts = Vec::with_capacity(ranked.len());
        for entry in ranked {
            verdicts.push(ContributorVerdict {
                contributor_id: entry.contributor_id.clone(),
                impact_score: entry.total_score,
                role: entry.role,
            });
            rankings.push(ContributorRanking {
                id: uuid::Uuid::new_v4().to_string(),
                contributor_id: entry.contributor_id,
                rank_position: entry.rank,
                total_score: entry.total_score,
                component_scores: entry.components,
                raw_metrics: entry.raw,
                calculation_timestamp,
            });
        }

        let written = self.rankings.save_snapshot(rankings, verdicts).await?;
        info!("Ranked {} contributors", written);
        Ok(JobReport {
            items_processed: written,
            ..Default::default()
        })
    }

    /// Movement between the two latest snapshots.
    pub async fn trends(&self) -> Result<Vec<RankingTrend>, PipelineError> {
        Ok(self.rankings.trends().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::{Contributor, ContributorRepositoryLink};
    use crate::repository::diesel_contributor::ContributorUpsert;
    use crate::repository::test_support::{sample_repository, setup_test_db};
    use crate::repository::{DieselLinkRepository, DieselRepoRepository};

    fn contributor(id: &str) -> Contributor {
        Contributor {
            id: id.to_string(),
            external_id: id.to_string(),
            username: Some(id.to_string()),
            name: None,
            avatar: None,
            bio: None,
            company: None,
            location: None,
            followers: 0,
            repositories: 0,
            impact_score: 0.0,
            role_classification: None,
            top_languages: Vec::new(),
            organizations: Vec::new(),
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
        }
    }

    fn link(contributor_id: &str, commits: i32, lines: i32, reviews: i32) -> ContributorRepositoryLink {
        ContributorRepositoryLink {
            contributor_id: contributor_id.to_string(),
            repository_id: "repo".to_string(),
            commit_count: commits,
            reviews,
            lines_added: lines,
            ..Default::default()
        }
    }

    #[test]
    fn test_competition_ranks() {
        assert_eq!(
            competition_ranks(&[90.0, 90.0, 70.0, 70.0, 50.0]),
            vec![1, 1, 3, 3, 5]
        );
        assert_eq!(competition_ranks(&[10.0]), vec![1]);
        assert!(competition_ranks(&[]).is_empty());
    }

    #[test]
    fn test_percentiles_share_lower_rank() {
        assert_eq!(percentiles(&[7.0]), vec![100.0]);
        assert_eq!(percentiles(&[5.0, 5.0, 1.0]), vec![66.67, 66.67, 33.33]);
        assert_eq!(percentiles(&[0.0, 0.0]), vec![50.0, 50.0]);
    }

    #[test]
    fn test_single_contributor_scores_full_marks() {
        let inputs = RankingInputs {
            contributors: vec![contributor("a")],
            links: vec![link("a", 3, 100, 0)],
            ..Default::default()
        };
        let ranked = RankingEngine::default().compute(&inputs);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].total_score, 100.0);
        assert_eq!(ranked[0].role, ContributorRole::Core);
    }

    #[test]
    fn test_ranking_orders_and_classifies() {
        let mut ids: Vec<String> = (0..12).map(|i| format!("c{:02}", i)).collect();
        ids.sort();
        let contributors: Vec<Contributor> = ids.iter().map(|id| contributor(id)).collect();
        let mut links: Vec<ContributorRepositoryLink> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| link(id, 1 + i as i32, 10 * (1 + i as i32), 0))
            .collect();
        // c00 reviews far more than it commits.
        links[0].reviews = 20;
        let inputs = RankingInputs {
            contributors,
            links,
            merges_for_others: HashMap::from([("c05".to_string(), 2)]),
            ..Default::default()
        };

        let ranked = RankingEngine::default().compute(&inputs);
        assert_eq!(ranked.len(), 12);
        assert!(ranked.windows(2).all(|w| w[0].total_score >= w[1].total_score));
        assert_eq!(ranked[0].contributor_id, "c11");
        assert_eq!(ranked[0].rank, 1);

        let role = |id: &str| ranked.iter().find(|r| r.contributor_id == id).map(|r| r.role);
        assert_eq!(role("c11"), Some(ContributorRole::Core));
        assert_eq!(role("c05"), Some(ContributorRole::Maintainer));
        assert_eq!(role("c00"), Some(ContributorRole::Reviewer));
        assert_eq!(role("c01"), Some(ContributorRole::Occasional));
        assert_eq!(role("c04"), Some(ContributorRole::Contributor));
    }

    #[tokio::test]
    async fn test_service_writes_snapshot() {
        let (pool, _dir) = setup_test_db().await;
        let repo_id = DieselRepoRepository::new(pool.clone())
            .upsert(sample_repository("1", "octo/hello", 50))
            .await
            .unwrap();
        let people = DieselContributorRepository::new(pool.clone());
        let mut ids = Vec::new();
        for (n, login) in ["alice", "bob", "carol"].iter().enumerate() {
            ids.push(
                people
                    .upsert_account(ContributorUpsert {
                        external_id: n.to_string(),
                        username: login.to_string(),
                        avatar: None,
                        is_bot: false,
                    })
                    .await
                    .unwrap(),
            );
        }
        people
            .upsert_account(ContributorUpsert {
                external_id: "99".to_string(),
                username: "dependabot[bot]".to_string(),
                avatar: None,
                is_bot: true,
            })
            .await
            .unwrap();

        let links = ids
            .iter()
            .enumerate()
            .map(|(i, id)| ContributorRepositoryLink {
                contributor_id: id.clone(),
                repository_id: repo_id.clone(),
                commit_count: 5 * (i as i32 + 1),
                lines_added: 100 * (i as i32 + 1),
                ..Default::default()
            })
            .collect();
        DieselLinkRepository::new(pool.clone())
            .replace_for_repository(&repo_id, links)
            .await
            .unwrap();

        let ctx = AppContext::new(Settings::default(), pool.clone(), None);
        let service = RankingService::new(&ctx);
        let report = service.run(&CancelFlag::new()).await.unwrap();
        assert_eq!(report.items_processed, 3);

        let snapshot = DieselRankingRepository::new(pool.clone())
            .latest_snapshot()
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].contributor_id, ids[2]);
        assert_eq!(snapshot[0].rank_position, 1);
        assert_eq!(snapshot[0].raw_metrics.commit_count, 15);

        let carol = people.get(&ids[2]).await.unwrap().unwrap();
        assert_eq!(carol.impact_score, snapshot[0].total_score);
        assert_eq!(carol.direct_commits, 15);
        let bot = people.find_by_username("dependabot[bot]").await.unwrap().unwrap();
        assert_eq!(bot.role_classification, Some(ContributorRole::Bot));

        assert!(service.trends().await.unwrap().iter().all(|t| t.previous_rank.is_none()));
        service.run(&CancelFlag::new()).await.unwrap();
        let trends = service.trends().await.unwrap();
        assert_eq!(trends.len(), 3);
        assert!(trends.iter().all(|t| t.rank_delta == Some(0)));
    }

    /// Pairs of identical contributors plus one trailing contributor.
    fn tied_links() -> Vec<(&'static str, i32, i32)> {
        vec![("a", 10, 100), ("b", 10, 100), ("c", 5, 50), ("d", 5, 50), ("e", 1, 10)]
    }

    #[test]
    fn test_engine_shares_rank_on_equal_totals() {
        let inputs = RankingInputs {
            contributors: tied_links().iter().map(|(id, _, _)| contributor(id)).collect(),
            links: tied_links()
                .iter()
                .map(|(id, commits, lines)| link(id, *commits, *lines, 0))
                .collect(),
            ..Default::default()
        };

        let ranked = RankingEngine::default().compute(&inputs);
        let ids: Vec<&str> = ranked.iter().map(|r| r.contributor_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
        let ranks: Vec<i32> = ranked.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 1, 3, 3, 5]);
        assert_eq!(ranked[0].total_score, ranked[1].total_score);
        assert!(ranked[1].total_score > ranked[2].total_score);
    }

    #[tokio::test]
    async fn test_snapshot_persists_shared_ranks() {
        let (pool, _dir) = setup_test_db().await;
        let repo_id = DieselRepoRepository::new(pool.clone())
            .upsert(sample_repository("1", "octo/ties", 10))
            .await
            .unwrap();
        let people = DieselContributorRepository::new(pool.clone());

        let mut links = Vec::new();
        let mut ids = HashMap::new();
        for (n, (login, commits, lines)) in tied_links().into_iter().enumerate() {
            let id = people
                .upsert_account(ContributorUpsert {
                    external_id: (100 + n).to_string(),
                    username: login.to_string(),
                    avatar: None,
                    is_bot: false,
                })
                .await
                .unwrap();
            links.push(ContributorRepositoryLink {
                contributor_id: id.clone(),
                repository_id: repo_id.clone(),
                commit_count: commits,
                lines_added: lines,
                ..Default::default()
            });
            ids.insert(id, login);
        }
        DieselLinkRepository::new(pool.clone())
            .replace_for_repository(&repo_id, links)
            .await
            .unwrap();

        let ctx = AppContext::new(Settings::default(), pool.clone(), None);
        RankingService::new(&ctx).run(&CancelFlag::new()).await.unwrap();

        let snapshot = DieselRankingRepository::new(pool)
            .latest_snapshot()
            .await
            .unwrap();
        let mut ranks: Vec<(&str, i32)> = snapshot
            .iter()
            .map(|r| (ids[&r.contributor_id], r.rank_position))
            .collect();
        ranks.sort();
        assert_eq!(
            ranks,
            vec![("a", 1), ("b", 1), ("c", 3), ("d", 3), ("e", 5)]
        );
        let shared: Vec<f64> = snapshot
            .iter()
            .filter(|r| r.rank_position == 1)
            .map(|r| r.total_score)
            .collect();
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0], shared[1]);
    }
}
