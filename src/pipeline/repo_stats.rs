//! repository_processing: per-repository statistics, health score and the
//! contributor ↔ repository activity links.
//!
//! [`RepositoryProcessor`] is pure; [`RepositoryProcessingService`] loads the
//! inputs and stores the results. Missing inputs make a metric `None`.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::context::{AppContext, CancelFlag, JobReport, PipelineError};
use crate::models::{
    Commit, ContributorRepositoryLink, MergeRequest, MergeRequestReview, Repository,
    RepositorySnapshot,
};
use crate::repository::{
    DieselCommitRepository, DieselLinkRepository, DieselMergeRequestRepository,
    DieselRepoRepository, DieselStatsRepository,
};

/// Days without a commit after which activity recency scores zero.
const RECENCY_HORIZON_DAYS: f64 = 180.0;
/// Median close time at which responsiveness scores zero.
const RESPONSIVENESS_HORIZON_HOURS: f64 = 30.0 * 24.0;
/// Trailing weeks inspected for commit cadence.
const CADENCE_WEEKS: i64 = 12;

/// Weights of the health score components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, prefer::FromValue)]
#[serde(default)]
pub struct HealthWeights {
    pub recency: f64,
    pub diversity: f64,
    pub responsiveness: f64,
    pub cadence: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            diversity: 0.25,
            responsiveness: 0.2,
            cadence: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitFrequency {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
    /// Commits per weekday, Monday first.
    pub by_weekday: [u32; 7],
}

/// Per-day change over trailing windows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrowthRates {
    pub last_7_days: Option<f64>,
    pub last_30_days: Option<f64>,
    pub last_90_days: Option<f64>,
}

/// Health components on a 0-100 scale and their weighted mean.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthBreakdown {
    pub recency: Option<f64>,
    pub diversity: Option<f64>,
    pub responsiveness: Option<f64>,
    pub cadence: Option<f64>,
    pub score: Option<f64>,
}

/// Output of [`RepositoryProcessor::process`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub repository_id: String,
    pub total_commits: usize,
    pub commit_frequency: Option<CommitFrequency>,
    pub star_growth: GrowthRates,
    pub fork_growth: GrowthRates,
    pub fork_to_star_ratio: f64,
    pub contributor_count: usize,
    pub core_contributors: Vec<String>,
    /// Integer percentages summing to 100; empty without enriched commits.
    pub language_breakdown: BTreeMap<String, u32>,
    pub health: HealthBreakdown,
}

/// One commit, collapsed from its file rows.
struct CommitSummary<'a> {
    contributor_id: Option<&'a str>,
    committed_at: DateTime<Utc>,
}

fn distinct_commits(commits: &[Commit]) -> Vec<CommitSummary<'_>> {
    let mut seen = HashSet::new();
    commits
        .iter()
        .filter(|c| seen.insert(c.sha.as_str()))
        .map(|c| CommitSummary {
            contributor_id: c.contributor_id.as_deref(),
            committed_at: c.committed_at,
        })
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Pure statistics over one repository's stored data.
#[derive(Debug, Clone)]
pub struct RepositoryProcessor {
    weights: HealthWeights,
    core_threshold: f64,
}

impl Default for RepositoryProcessor {
    fn default() -> Self {
        Self::new(HealthWeights::default(), 0.5)
    }
}

impl RepositoryProcessor {
    pub fn new(weights: HealthWeights, core_threshold: f64) -> Self {
        Self {
            weights,
            core_threshold: core_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn process(
        &self,
        repository: &Repository,
        commits: &[Commit],
        snapshots: &[RepositorySnapshot],
        merge_requests: &[MergeRequest],
    ) -> RepositoryStats {
        self.process_at(repository, commits, snapshots, merge_requests, Utc::now())
    }

    /// [`process`](Self::process) with an explicit clock.
    pub fn process_at(
        &self,
        repository: &Repository,
        commits: &[Commit],
        snapshots: &[RepositorySnapshot],
        merge_requests: &[MergeRequest],
        now: DateTime<Utc>,
    ) -> RepositoryStats {
        let summaries = distinct_commits(commits);
        let counts = commits_per_contributor(&summaries);

        let recency = summaries
            .iter()
            .map(|c| c.committed_at)
            .max()
            .map(|last| activity_recency(last, now));
        let diversity = contributor_diversity(&counts);
        let responsiveness = merge_responsiveness(merge_requests);
        let cadence = (!summaries.is_empty()).then(|| commit_cadence(&summaries, now));

        let mut health = HealthBreakdown {
            recency,
            diversity,
            responsiveness,
            cadence,
            score: None,
        };
        health.score = self.health_score(&health);

        RepositoryStats {
            repository_id: repository.id.clone(),
            total_commits: summaries.len(),
            commit_frequency: commit_frequency(&summaries),
            star_growth: growth(snapshots, |s| s.stars),
            fork_growth: growth(snapshots, |s| s.forks),
            fork_to_star_ratio: round2(repository.forks as f64 / repository.stars.max(1) as f64),
            contributor_count: counts.len(),
            core_contributors: self.core_contributors(&summaries, &counts),
            language_breakdown: language_breakdown(commits),
            health,
        }
    }

    /// Smallest set of top committers covering the threshold share of
    /// attributed commits. Ties: earliest first commit, then id.
    fn core_contributors(
        &self,
        summaries: &[CommitSummary<'_>],
        counts: &HashMap<&str, usize>,
    ) -> Vec<String> {
        let total: usize = counts.values().sum();
        if total == 0 {
            return Vec::new();
        }

        let mut first_commit: HashMap<&str, DateTime<Utc>> = HashMap::new();
        for commit in summaries {
            if let Some(id) = commit.contributor_id {
                let entry = first_commit.entry(id).or_insert(commit.committed_at);
                if commit.committed_at < *entry {
                    *entry = commit.committed_at;
                }
            }
        }

        let mut ranked: Vec<(&str, usize)> = counts.iter().map(|(id, n)| (*id, *n)).collect();
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| first_commit.get(a.0).cmp(&first_commit.get(b.0)))
                .then_with(|| a.0.cmp(b.0))
        });

        let needed = self.core_threshold * total as f64;
        let mut covered = 0;
        let mut core = Vec::new();
        for (id, count) in ranked {
            if !core.is_empty() && covered as f64 >= needed {
                break;
            }
            covered += count;
            core.push(id.to_string());
        }
        core
    }

    /// Weighted mean of the present components, clamped to 0-100.
    fn health_score(&self, health: &HealthBreakdown) -> Option<f64> {
        let parts = [
            (health.recency, self.weights.recency),
            (health.diversity, self.weights.diversity),
            (health.responsiveness, self.weights.responsiveness),
            (health.cadence, self.weights.cadence),
        ];
        let (sum, weight) = parts
            .iter()
            .filter_map(|(value, weight)| value.map(|v| (v * weight, *weight)))
            .fold((0.0, 0.0), |(s, w), (v, wt)| (s + v, w + wt));
        if weight <= 0.0 {
            return None;
        }
        Some(round2((sum / weight).clamp(0.0, 100.0)))
    }
}

fn commits_per_contributor<'a>(summaries: &[CommitSummary<'a>]) -> HashMap<&'a str, usize> {
    let mut counts = HashMap::new();
    for commit in summaries {
        if let Some(id) = commit.contributor_id {
            *counts.entry(id).or_insert(0) += 1;
        }
    }
    counts
}

fn commit_frequency(summaries: &[CommitSummary<'_>]) -> Option<CommitFrequency> {
    let first = summaries.iter().map(|c| c.committed_at).min()?;
    let last = summaries.iter().map(|c| c.committed_at).max()?;
    let span_days = ((last.date_naive() - first.date_naive()).num_days() + 1) as f64;
    let n = summaries.len() as f64;

    let mut by_weekday = [0u32; 7];
    for commit in summaries {
        by_weekday[commit.committed_at.weekday().num_days_from_monday() as usize] += 1;
    }

    Some(CommitFrequency {
        daily: round2(n / span_days),
        weekly: round2(n / (span_days / 7.0).max(1.0)),
        monthly: round2(n / (span_days / 30.0).max(1.0)),
        by_weekday,
    })
}

/// Per-day change of one counter over the trailing windows ending at the
/// latest snapshot, against the earliest observation inside each window.
fn growth(snapshots: &[RepositorySnapshot], value: impl Fn(&RepositorySnapshot) -> i32) -> GrowthRates {
    let Some(latest) = snapshots.iter().max_by_key(|s| s.recorded_at) else {
        return GrowthRates::default();
    };

    let rate = |days: i64| -> Option<f64> {
        let cutoff = latest.recorded_at - Duration::days(days);
        let baseline = snapshots
            .iter()
            .filter(|s| s.recorded_at >= cutoff && s.recorded_at < latest.recorded_at)
            .min_by_key(|s| s.recorded_at)?;
        let elapsed = (latest.recorded_at - baseline.recorded_at).num_seconds() as f64 / 86_400.0;
        let delta = (value(latest) - value(baseline)) as f64;
        Some(round2(delta / elapsed.max(1.0)))
    };

    GrowthRates {
        last_7_days: rate(7),
        last_30_days: rate(30),
        last_90_days: rate(90),
    }
}

/// Share of changed files per language over enriched commit rows.
fn language_breakdown(commits: &[Commit]) -> BTreeMap<String, u32> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for commit in commits.iter().filter(|c| c.is_enriched && !c.is_summary_row()) {
        if let Some(language) = commit.language() {
            *counts.entry(language).or_insert(0) += 1;
        }
    }
    let total: u64 = counts.values().sum();
    if total == 0 {
        return BTreeMap::new();
    }

    let mut shares: BTreeMap<String, u32> = counts
        .iter()
        .map(|(lang, n)| (lang.clone(), (n * 100 / total) as u32))
        .collect();
    let remainder = 100 - shares.values().sum::<u32>();
    let largest = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(lang, _)| lang.clone());
    if let Some(share) = largest.and_then(|lang| shares.get_mut(&lang)) {
        *share += remainder;
    }
    shares
}

fn activity_recency(last_commit: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let days = (now - last_commit).num_seconds().max(0) as f64 / 86_400.0;
    round2((100.0 * (1.0 - days / RECENCY_HORIZON_DAYS)).clamp(0.0, 100.0))
}

/// 100 × (1 − Herfindahl index of commit shares).
fn contributor_diversity(counts: &HashMap<&str, usize>) -> Option<f64> {
    let total: usize = counts.values().sum();
    if total == 0 {
        return None;
    }
    let hhi: f64 = counts
        .values()
        .map(|n| {
            let share = *n as f64 / total as f64;
            share * share
        })
        .sum();
    Some(round2(100.0 * (1.0 - hhi)))
}

/// Median hours from open to close/merge of closed pull requests.
fn merge_responsiveness(merge_requests: &[MergeRequest]) -> Option<f64> {
    let mut hours: Vec<f64> = merge_requests
        .iter()
        .filter_map(|mr| {
            let closed = mr.merged_at.or(mr.closed_at)?;
            Some((closed - mr.created_at).num_seconds().max(0) as f64 / 3600.0)
        })
        .collect();
    if hours.is_empty() {
        return None;
    }
    hours.sort_by(|a, b| a.total_cmp(b));
    let mid = hours.len() / 2;
    let median = if hours.len() % 2 == 0 {
        (hours[mid - 1] + hours[mid]) / 2.0
    } else {
        hours[mid]
    };
    Some(round2(
        (100.0 * (1.0 - median / RESPONSIVENESS_HORIZON_HOURS)).clamp(0.0, 100.0),
    ))
}

/// Percentage of the trailing weeks with at least one commit.
fn commit_cadence(summaries: &[CommitSummary<'_>], now: DateTime<Utc>) -> f64 {
    let active: HashSet<i64> = summaries
        .iter()
        .filter(|c| c.committed_at <= now)
        .map(|c| (now - c.committed_at).num_days() / 7)
        .filter(|week| *week < CADENCE_WEEKS)
        .collect();
    round2(active.len() as f64 * 100.0 / CADENCE_WEEKS as f64)
}

/// Activity of every contributor of one repository.
pub fn compute_links(
    repository_id: &str,
    commits: &[Commit],
    merge_requests: &[MergeRequest],
    reviews: &[MergeRequestReview],
) -> Vec<ContributorRepositoryLink> {
    let mut links: BTreeMap<String, ContributorRepositoryLink> = BTreeMap::new();
    let mut counted_shas: HashSet<(&str, &str)> = HashSet::new();

    fn touch<'m>(
        links: &'m mut BTreeMap<String, ContributorRepositoryLink>,
        repository_id: &str,
        contributor_id: &str,
        at: Option<DateTime<Utc>>,
    ) -> &'m mut ContributorRepositoryLink {
        let link = links
            .entry(contributor_id.to_string())
            .or_insert_with(|| ContributorRepositoryLink {
                contributor_id: contributor_id.to_string(),
                repository_id: repository_id.to_string(),
                ..Default::default()
            });
        if let Some(at) = at {
            link.first_contribution_date = Some(link.first_contribution_date.map_or(at, |d| d.min(at)));
            link.last_contribution_date = Some(link.last_contribution_date.map_or(at, |d| d.max(at)));
        }
        link
    }

    for commit in commits {
        let Some(contributor_id) = commit.contributor_id.as_deref() else {
            continue;
        };
        let link = touch(&mut links, repository_id, contributor_id, Some(commit.committed_at));
        if counted_shas.insert((contributor_id, commit.sha.as_str())) {
            link.commit_count += 1;
        }
        link.lines_added += commit.additions;
        link.lines_removed += commit.deletions;
    }

    for mr in merge_requests {
        if let Some(author_id) = mr.author_id.as_deref() {
            touch(&mut links, repository_id, author_id, Some(mr.created_at)).pull_requests += 1;
        }
    }

    for review in reviews {
        if let Some(reviewer_id) = review.reviewer_id.as_deref() {
            touch(&mut links, repository_id, reviewer_id, review.submitted_at).reviews += 1;
        }
    }

    links.into_values().collect()
}

/// Runs the repository_processing pipeline over every stored repository.
pub struct RepositoryProcessingService {
    processor: RepositoryProcessor,
    repos: DieselRepoRepository,
    commits: DieselCommitRepository,
    merge_requests: DieselMergeRequestRepository,
    links: DieselLinkRepository,
    stats: DieselStatsRepository,
}

impl RepositoryProcessingService {
    pub fn new(ctx: &AppContext) -> Self {
        let pool = ctx.pool.clone();
        Self {
            processor: RepositoryProcessor::new(
                ctx.settings.health_weights.clone(),
                ctx.settings.core_contributor_threshold,
            ),
            repos: DieselRepoRepository::new(pool.clone()),
            commits: DieselCommitRepository::new(pool.clone()),
            merge_requests: DieselMergeRequestRepository::new(pool.clone()),
            links: DieselLinkRepository::new(pool.clone()),
            stats: DieselStatsRepository::new(pool),
        }
    }

    pub async fn run(&self, cancel: &CancelFlag) -> Result<JobReport, PipelineError> {
        let repositories = self.repos.get_all().await?;
        info!("Processing {} repositories", repositories.len());

        let mut report = JobReport::default();
        for repository in &repositories {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let commits = self.commits.list_for_repository(&repository.id).await?;
            let snapshots = self.repos.snapshots(&repository.id).await?;
            let merge_requests = self.merge_requests.list_for_repository(&repository.id).await?;
            let reviews = self
                .merge_requests
                .reviews_for_repository(&repository.id)
                .await?;

            let stats = self
                .processor
                .process(repository, &commits, &snapshots, &merge_requests);
            let links = compute_links(&repository.id, &commits, &merge_requests, &reviews);
            self.links
                .replace_for_repository(&repository.id, links)
                .await?;

            match serde_json::to_value(&stats) {
                Ok(value) => {
                    self.stats
                        .save(&repository.id, value, stats.health.score)
                        .await?;
                    debug!(
                        "{}: {} commits, health {:?}",
                        repository.full_name, stats.total_commits, stats.health.score
                    );
                    report.items_processed += 1;
                }
                Err(e) => {
                    warn!("Could not serialize stats of {}: {}", repository.full_name, e);
                    report
                        .errors
                        .push(format!("{}: {}", repository.full_name, e));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileStatus, MergeRequestState};
    use crate::repository::diesel_commit::{CommitFileRow, CommitUpsert};
    use crate::repository::test_support::{sample_repository, setup_test_db};
    use crate::repository::{DieselContributorRepository, DieselError};
    use chrono::TimeZone;

    fn repository(stars: i32, forks: i32) -> Repository {
        let now = Utc::now();
        Repository {
            id: "repo".to_string(),
            external_id: "1".to_string(),
            name: "hello".to_string(),
            full_name: "octo/hello".to_string(),
            description: None,
            url: "https://github.com/octo/hello".to_string(),
            stars,
            forks,
            size_kb: 0,
            watchers: 0,
            primary_language: None,
            license: None,
            is_fork: false,
            is_archived: false,
            owner_id: None,
            is_enriched: true,
            enrichment_attempts: 1,
            enrichment_error: None,
            health_percentage: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn commit(sha: &str, author: Option<&str>, at: DateTime<Utc>, filename: &str) -> Commit {
        Commit {
            id: format!("{}-{}", sha, filename),
            sha: sha.to_string(),
            repository_id: "repo".to_string(),
            contributor_id: author.map(str::to_string),
            pull_request_id: None,
            message: String::new(),
            committed_at: at,
            filename: filename.to_string(),
            status: FileStatus::Modified,
            additions: 10,
            deletions: 2,
            patch: None,
            is_merge_commit: false,
            is_enriched: !filename.is_empty(),
            enrichment_attempts: 0,
            enrichment_error: None,
        }
    }

    fn snapshot(stars: i32, forks: i32, at: DateTime<Utc>) -> RepositorySnapshot {
        RepositorySnapshot {
            repository_id: "repo".to_string(),
            stars,
            forks,
            watchers: 0,
            recorded_at: at,
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_core_contributors_cover_threshold() {
        let mut commits: Vec<Commit> = (0..10)
            .map(|i| commit(&format!("a{}", i), Some("alice"), day(1 + i), ""))
            .collect();
        commits.push(commit("b0", Some("bob"), day(2), ""));

        let stats = RepositoryProcessor::default().process_at(
            &repository(10, 1),
            &commits,
            &[],
            &[],
            day(20),
        );
        assert_eq!(stats.core_contributors, vec!["alice".to_string()]);
        assert_eq!(stats.contributor_count, 2);
        assert_eq!(stats.total_commits, 11);
    }

    #[test]
    fn test_core_contributor_ties_prefer_earliest() {
        let commits = vec![
            commit("a", Some("zed"), day(1), ""),
            commit("b", Some("amy"), day(3), ""),
        ];
        let stats = RepositoryProcessor::default().process_at(
            &repository(1, 0),
            &commits,
            &[],
            &[],
            day(5),
        );
        assert_eq!(stats.core_contributors, vec!["zed".to_string()]);
    }

    #[test]
    fn test_language_breakdown_sums_to_100() {
        let commits = vec![
            commit("a", Some("alice"), day(1), "src/main.rs"),
            commit("a", Some("alice"), day(1), "app.py"),
            commit("b", Some("alice"), day(2), "web/index.ts"),
            commit("c", Some("alice"), day(3), "README"),
        ];
        let breakdown = language_breakdown(&commits);
        assert_eq!(breakdown.len(), 3);
        assert_eq!(breakdown.values().sum::<u32>(), 100);
        assert_eq!(breakdown.values().filter(|v| **v == 33).count(), 2);
        assert!(language_breakdown(&[]).is_empty());
    }

    #[test]
    fn test_commit_frequency_and_weekdays() {
        // 2024-01-01 was a Monday.
        let commits = vec![
            commit("a", None, day(1), ""),
            commit("a", None, day(1), "dup.rs"),
            commit("b", None, day(1), ""),
            commit("c", None, day(7), ""),
        ];
        let freq = commit_frequency(&distinct_commits(&commits)).unwrap();
        assert_eq!(freq.by_weekday, [2, 0, 0, 0, 0, 0, 1]);
        assert_eq!(freq.daily, round2(3.0 / 7.0));
        assert_eq!(freq.weekly, 3.0);
        assert!(commit_frequency(&[]).is_none());
    }

    #[test]
    fn test_growth_needs_an_earlier_observation() {
        let only = vec![snapshot(10, 1, day(10))];
        assert_eq!(growth(&only, |s| s.stars), GrowthRates::default());

        let series = vec![
            snapshot(10, 1, day(1)),
            snapshot(20, 2, day(6)),
            snapshot(30, 2, day(11)),
        ];
        let stars = growth(&series, |s| s.stars);
        assert_eq!(stars.last_7_days, Some(2.0));
        assert_eq!(stars.last_30_days, Some(2.0));
    }

    #[test]
    fn test_health_renormalizes_over_present_components() {
        let processor = RepositoryProcessor::default();
        let health = HealthBreakdown {
            recency: Some(80.0),
            diversity: None,
            responsiveness: None,
            cadence: Some(40.0),
            score: None,
        };
        // (0.3 * 80 + 0.25 * 40) / 0.55
        assert_eq!(processor.health_score(&health), Some(61.82));
        assert_eq!(processor.health_score(&HealthBreakdown::default()), None);
    }

    #[test]
    fn test_empty_repository_has_no_metrics() {
        let stats = RepositoryProcessor::default().process(&repository(0, 0), &[], &[], &[]);
        assert!(stats.commit_frequency.is_none());
        assert!(stats.core_contributors.is_empty());
        assert_eq!(stats.health.score, None);
        assert_eq!(stats.fork_to_star_ratio, 0.0);
    }

    #[test]
    fn test_responsiveness_uses_median() {
        let mr = |hours: i64| MergeRequest {
            id: format!("mr{}", hours),
            external_id: 1,
            repository_id: "repo".to_string(),
            author_id: None,
            title: String::new(),
            description: None,
            state: MergeRequestState::Merged,
            is_draft: false,
            created_at: day(1),
            updated_at: day(1),
            closed_at: Some(day(1) + Duration::hours(hours)),
            merged_at: Some(day(1) + Duration::hours(hours)),
            merged_by_id: None,
            commits_count: 0,
            additions: 0,
            deletions: 0,
            changed_files: 0,
            comments: 0,
            review_comments: 0,
            labels: Vec::new(),
            source_branch: None,
            target_branch: None,
            is_enriched: false,
            enrichment_attempts: 0,
            enrichment_error: None,
        };
        let score = merge_responsiveness(&[mr(1), mr(72), mr(10_000)]).unwrap();
        assert_eq!(score, 90.0);
        assert_eq!(merge_responsiveness(&[]), None);
    }

    #[test]
    fn test_links_count_distinct_commits() {
        let commits = vec![
            commit("a", Some("alice"), day(1), "a.rs"),
            commit("a", Some("alice"), day(1), "b.rs"),
            commit("b", Some("alice"), day(3), ""),
        ];
        let links = compute_links("repo", &commits, &[], &[]);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].commit_count, 2);
        assert_eq!(links[0].lines_added, 30);
        assert_eq!(links[0].first_contribution_date, Some(day(1)));
        assert_eq!(links[0].last_contribution_date, Some(day(3)));
    }

    #[tokio::test]
    async fn test_service_persists_stats_and_links() -> Result<(), DieselError> {
        let (pool, _dir) = setup_test_db().await;
        let repos = DieselRepoRepository::new(pool.clone());
        let repo_id = repos.upsert(sample_repository("1", "octo/hello", 10)).await?;
        let alice = DieselContributorRepository::new(pool.clone())
            .upsert_placeholder("Alice")
            .await?;

        let commits = DieselCommitRepository::new(pool.clone());
        commits
            .upsert_summary(CommitUpsert {
                repository_id: repo_id.clone(),
                sha: "abc".to_string(),
                contributor_id: Some(alice.clone()),
                message: "init".to_string(),
                committed_at: Utc::now(),
                is_merge_commit: false,
            })
            .await?;
        let summary = commits.rows_for_sha(&repo_id, "abc").await?;
        commits
            .apply_enrichment(
                &summary[0].id,
                vec![CommitFileRow {
                    filename: "src/lib.rs".to_string(),
                    status: FileStatus::Added,
                    additions: 5,
                    deletions: 0,
                    patch: None,
                }],
                false,
            )
            .await?;

        let ctx = AppContext::new(crate::config::Settings::default(), pool.clone(), None);
        let report = RepositoryProcessingService::new(&ctx)
            .run(&CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.items_processed, 1);

        let stored = DieselStatsRepository::new(pool.clone())
            .get(&repo_id)
            .await?
            .unwrap();
        assert_eq!(stored.stats["language_breakdown"]["Rust"], 100);
        assert!(stored.health_score.is_some());
        assert_eq!(
            repos.get(&repo_id).await?.unwrap().health_percentage,
            stored.health_score
        );

        let links = DieselLinkRepository::new(pool).for_repository(&repo_id).await?;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].contributor_id, alice);
        assert_eq!(links[0].lines_added, 5);
        Ok(())
    }
}
