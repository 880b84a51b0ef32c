//! data_enrichment: follow-up API calls that fill in entity details.
//!
//! Every fetch goes through the raw intake, so detail payloads are versioned
//! and conditional like listing payloads. Each outcome other than a rate-limit
//! deferral counts as an enrichment attempt; entities that used up their
//! attempts are no longer candidates.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::context::{AppContext, CancelFlag, JobReport, PipelineError};
use super::intake::RawIntake;
use crate::github::payloads::{GhCommit, GhOrganization, GhPullRequest, GhRepository, GhReview, GhUser};
use crate::github::{FetchError, GitHubApi};
use crate::models::{FileStatus, RawEntityKind};
use crate::repository::diesel_commit::{CommitCandidate, CommitFileRow};
use crate::repository::diesel_contributor::{ContributorProfile, ContributorUpsert};
use crate::repository::diesel_merge_request::{MergeRequestDetail, ReviewUpsert};
use crate::repository::diesel_repo::RepositoryUpsert;
use crate::repository::{
    DieselCommitRepository, DieselContributorRepository, DieselMergeRequestRepository,
    DieselRepoRepository, SqlitePool,
};

/// An entity waiting for enrichment.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentTarget {
    Contributor { id: String, login: String },
    Repository { id: String, full_name: String },
    MergeRequest { id: String, repository_full_name: String, number: i32 },
    Commit(CommitCandidate),
}

impl EnrichmentTarget {
    pub fn id(&self) -> &str {
        match self {
            EnrichmentTarget::Contributor { id, .. }
            | EnrichmentTarget::Repository { id, .. }
            | EnrichmentTarget::MergeRequest { id, .. } => id,
            EnrichmentTarget::Commit(candidate) => &candidate.id,
        }
    }

    /// Human-readable name for logs and error summaries.
    pub fn label(&self) -> String {
        match self {
            EnrichmentTarget::Contributor { login, .. } => format!("user {}", login),
            EnrichmentTarget::Repository { full_name, .. } => format!("repository {}", full_name),
            EnrichmentTarget::MergeRequest {
                repository_full_name,
                number,
                ..
            } => format!("pull request {}#{}", repository_full_name, number),
            EnrichmentTarget::Commit(c) => {
                format!("commit {}@{}", c.repository_full_name, c.sha)
            }
        }
    }
}

/// Result of one enrichment attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentOutcome {
    Enriched,
    /// Rate limit exhausted; retried on a later run without using an attempt.
    Deferred,
    Failed(String),
}

fn decode<T: DeserializeOwned>(payload: &str) -> Result<T, PipelineError> {
    serde_json::from_str(payload).map_err(|e| PipelineError::Fetch(FetchError::Decode(e)))
}

/// Enriches single entities.
#[derive(Clone)]
pub struct Enricher {
    intake: RawIntake,
    contributors: DieselContributorRepository,
    repos: DieselRepoRepository,
    merge_requests: DieselMergeRequestRepository,
    commits: DieselCommitRepository,
}

impl Enricher {
    pub fn new(api: Arc<dyn GitHubApi>, pool: SqlitePool) -> Self {
        Self {
            intake: RawIntake::new(api, pool.clone()),
            contributors: DieselContributorRepository::new(pool.clone()),
            repos: DieselRepoRepository::new(pool.clone()),
            merge_requests: DieselMergeRequestRepository::new(pool.clone()),
            commits: DieselCommitRepository::new(pool),
        }
    }

    /// Enrich one entity and record the attempt.
    ///
    /// Only database failures are returned as errors; everything else is an
    /// outcome.
    pub async fn enrich(&self, target: &EnrichmentTarget) -> Result<EnrichmentOutcome, PipelineError> {
        match self.fetch_and_apply(target).await {
            Ok(()) => {
                debug!("Enriched {}", target.label());
                Ok(EnrichmentOutcome::Enriched)
            }
            Err(PipelineError::Fetch(e)) if e.is_rate_limit() => {
                warn!("Deferring {}: {}", target.label(), e);
                Ok(EnrichmentOutcome::Deferred)
            }
            Err(PipelineError::Database(e)) => Err(PipelineError::Database(e)),
            Err(e) => {
                let reason = e.to_string();
                warn!("Enrichment of {} failed: {}", target.label(), reason);
                self.record_failure(target, &reason).await?;
                Ok(EnrichmentOutcome::Failed(reason))
            }
        }
    }

    async fn record_failure(&self, target: &EnrichmentTarget, reason: &str) -> Result<(), PipelineError> {
        match target {
            EnrichmentTarget::Contributor { id, .. } => {
                self.contributors.record_enrichment_failure(id, reason).await?
            }
            EnrichmentTarget::Repository { id, .. } => {
                self.repos.record_enrichment_failure(id, reason).await?
            }
            EnrichmentTarget::MergeRequest { id, .. } => {
                self.merge_requests.record_enrichment_failure(id, reason).await?
            }
            EnrichmentTarget::Commit(candidate) => {
                self.commits
                    .record_enrichment_failure(&candidate.id, reason)
                    .await?
            }
        }
        Ok(())
    }

    async fn fetch_and_apply(&self, target: &EnrichmentTarget) -> Result<(), PipelineError> {
        match target {
            EnrichmentTarget::Contributor { id, login } => self.enrich_contributor(id, login).await,
            EnrichmentTarget::Repository { id, full_name } => {
                self.enrich_repository(id, full_name).await
            }
            EnrichmentTarget::MergeRequest {
                id,
                repository_full_name,
                number,
            } => {
                self.enrich_merge_request(id, repository_full_name, *number)
                    .await
            }
            EnrichmentTarget::Commit(candidate) => self.enrich_commit(candidate).await,
        }
    }

    /// Account id of a user, created on first sight. Organizations have none.
    async fn account_id(&self, user: Option<&GhUser>) -> Result<Option<String>, PipelineError> {
        let Some(user) = user.filter(|u| !u.is_organization()) else {
            return Ok(None);
        };
        let id = self
            .contributors
            .upsert_account(ContributorUpsert {
                external_id: user.id.to_string(),
                username: user.login.clone(),
                avatar: user.avatar_url.clone(),
                is_bot: user.is_bot(),
            })
            .await?;
        Ok(Some(id))
    }

    async fn enrich_contributor(&self, id: &str, login: &str) -> Result<(), PipelineError> {
        let user = self
            .intake
            .fetch(
                RawEntityKind::Contributor,
                login,
                &format!("/users/{}", login),
                true,
            )
            .await?;
        let user: GhUser = decode(&user.record.payload)?;

        let orgs = self
            .intake
            .fetch(
                RawEntityKind::Organizations,
                login,
                &format!("/users/{}/orgs", login),
                true,
            )
            .await?;
        let orgs: Vec<GhOrganization> = decode(&orgs.record.payload)?;

        let is_bot = user.is_bot();
        let profile = ContributorProfile {
            name: user.name,
            avatar: user.avatar_url,
            bio: user.bio,
            company: user.company,
            location: user.location,
            followers: user.followers.unwrap_or(0),
            public_repos: user.public_repos.unwrap_or(0),
            is_bot,
            organizations: orgs.into_iter().map(|o| o.login).collect(),
        };
        self.contributors.apply_profile(id, profile).await?;
        Ok(())
    }

    async fn enrich_repository(&self, id: &str, full_name: &str) -> Result<(), PipelineError> {
        let fetched = self
            .intake
            .fetch(
                RawEntityKind::Repository,
                full_name,
                &format!("/repos/{}", full_name),
                true,
            )
            .await?;
        let repo: GhRepository = decode(&fetched.record.payload)?;
        let owner_id = self.account_id(Some(&repo.owner)).await?;

        let detail = RepositoryUpsert {
            external_id: repo.id.to_string(),
            name: repo.name,
            full_name: repo.full_name,
            description: repo.description,
            url: repo.html_url,
            stars: repo.stargazers_count,
            forks: repo.forks_count,
            size_kb: repo.size,
            watchers: repo.subscribers_count.unwrap_or(0),
            primary_language: repo.language,
            license: repo.license.and_then(|l| l.label()),
            is_fork: repo.fork,
            is_archived: repo.archived,
            owner_id,
            created_at: repo.created_at,
            updated_at: repo.updated_at,
            observed_at: fetched.record.fetched_at,
        };
        self.repos.apply_enrichment(id, detail).await?;
        Ok(())
    }

    async fn enrich_merge_request(
        &self,
        id: &str,
        full_name: &str,
        number: i32,
    ) -> Result<(), PipelineError> {
        let key = format!("{}#{}", full_name, number);
        let fetched = self
            .intake
            .fetch(
                RawEntityKind::MergeRequest,
                &key,
                &format!("/repos/{}/pulls/{}", full_name, number),
                true,
            )
            .await?;
        let pr: GhPullRequest = decode(&fetched.record.payload)?;

        let fetched = self
            .intake
            .fetch(
                RawEntityKind::MergeRequestReviews,
                &key,
                &format!("/repos/{}/pulls/{}/reviews?per_page=100", full_name, number),
                true,
            )
            .await?;
        let reviews: Vec<GhReview> = decode(&fetched.record.payload)?;

        let mut rows = Vec::with_capacity(reviews.len());
        for review in reviews {
            rows.push(ReviewUpsert {
                external_id: review.id.to_string(),
                reviewer_id: self.account_id(review.user.as_ref()).await?,
                state: review.state,
                submitted_at: review.submitted_at,
            });
        }

        let detail = MergeRequestDetail {
            commits_count: pr.commits.unwrap_or(0),
            additions: pr.additions.unwrap_or(0),
            deletions: pr.deletions.unwrap_or(0),
            changed_files: pr.changed_files.unwrap_or(0),
            comments: pr.comments.unwrap_or(0),
            review_comments: pr.review_comments.unwrap_or(0),
            merged_by_id: self.account_id(pr.merged_by.as_ref()).await?,
            merge_commit_sha: pr.merge_commit_sha.filter(|_| pr.merged_at.is_some()),
        };
        self.merge_requests.apply_enrichment(id, detail, rows).await?;
        Ok(())
    }

    async fn enrich_commit(&self, candidate: &CommitCandidate) -> Result<(), PipelineError> {
        let fetched = self
            .intake
            .fetch(
                RawEntityKind::Commit,
                &format!("{}@{}", candidate.repository_full_name, candidate.sha),
                &format!(
                    "/repos/{}/commits/{}",
                    candidate.repository_full_name, candidate.sha
                ),
                true,
            )
            .await?;
        let commit: GhCommit = decode(&fetched.record.payload)?;
        let is_merge = commit.is_merge();

        let files = commit
            .files
            .unwrap_or_default()
            .into_iter()
            .map(|f| CommitFileRow {
                status: FileStatus::from_str(&f.status).unwrap_or(FileStatus::Modified),
                filename: f.filename,
                additions: f.additions,
                deletions: f.deletions,
                patch: f.patch,
            })
            .collect();
        self.commits
            .apply_enrichment(&candidate.id, files, is_merge)
            .await?;
        Ok(())
    }
}

/// Entities still eligible for enrichment: not enriched and below the
/// attempt ceiling.
#[derive(Clone)]
pub struct CandidateSource {
    contributors: DieselContributorRepository,
    repos: DieselRepoRepository,
    merge_requests: DieselMergeRequestRepository,
    commits: DieselCommitRepository,
    max_attempts: i32,
}

impl CandidateSource {
    pub fn new(pool: SqlitePool, max_attempts: u32) -> Self {
        Self {
            contributors: DieselContributorRepository::new(pool.clone()),
            repos: DieselRepoRepository::new(pool.clone()),
            merge_requests: DieselMergeRequestRepository::new(pool.clone()),
            commits: DieselCommitRepository::new(pool),
            max_attempts: i32::try_from(max_attempts).unwrap_or(i32::MAX),
        }
    }

    /// Up to `limit` candidates of each kind, repositories first so owners
    /// and contributors discovered there are picked up in the same run.
    pub async fn candidates(&self, limit: i64) -> Result<Vec<EnrichmentTarget>, PipelineError> {
        let mut targets = Vec::new();

        for (id, full_name) in self.repos.enrichment_candidates(self.max_attempts, limit).await? {
            targets.push(EnrichmentTarget::Repository { id, full_name });
        }
        for (id, login) in self
            .contributors
            .enrichment_candidates(self.max_attempts, limit)
            .await?
        {
            targets.push(EnrichmentTarget::Contributor { id, login });
        }
        for (id, repository_full_name, number) in self
            .merge_requests
            .enrichment_candidates(self.max_attempts, limit)
            .await?
        {
            targets.push(EnrichmentTarget::MergeRequest {
                id,
                repository_full_name,
                number,
            });
        }
        for candidate in self.commits.enrichment_candidates(self.max_attempts, limit).await? {
            targets.push(EnrichmentTarget::Commit(candidate));
        }
        Ok(targets)
    }

    /// Number of entities still eligible for enrichment.
    pub async fn count(&self) -> Result<i64, PipelineError> {
        Ok(self.repos.count_enrichment_candidates(self.max_attempts).await?
            + self.contributors.count_enrichment_candidates(self.max_attempts).await?
            + self.merge_requests.count_enrichment_candidates(self.max_attempts).await?
            + self.commits.count_enrichment_candidates(self.max_attempts).await?)
    }
}

/// Runs the data_enrichment pipeline over all candidates.
pub struct EnrichmentService {
    enricher: Enricher,
    source: CandidateSource,
    concurrency: usize,
    batch_size: i64,
}

impl EnrichmentService {
    pub fn new(ctx: &AppContext) -> Result<Self, PipelineError> {
        Ok(Self {
            enricher: Enricher::new(ctx.api()?, ctx.pool.clone()),
            source: CandidateSource::new(ctx.pool.clone(), ctx.settings.max_enrichment_attempts),
            concurrency: ctx.settings.request_concurrency.max(1),
            batch_size: ctx.settings.extraction_batch_size.max(1) as i64,
        })
    }

    pub async fn count_candidates(&self) -> Result<i64, PipelineError> {
        self.source.count().await
    }

    /// Enrich in rounds until no candidate is left. Each entity gets at most
    /// one attempt per run. A round that hits the rate limit ends the run;
    /// deferred entities wait for the next one.
    pub async fn run(&self, cancel: &CancelFlag) -> Result<JobReport, PipelineError> {
        let mut report = JobReport::default();
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            let limit = self.batch_size + attempted.len() as i64;
            let targets: Vec<EnrichmentTarget> = self
                .source
                .candidates(limit)
                .await?
                .into_iter()
                .filter(|target| !attempted.contains(target.id()))
                .collect();
            if targets.is_empty() {
                break;
            }
            debug!("Enrichment round with {} candidates", targets.len());
            attempted.extend(targets.iter().map(|target| target.id().to_string()));

            let mut deferred = 0;
            let mut outcomes = stream::iter(targets)
                .map(|target| async move {
                    if cancel.is_cancelled() {
                        return (target, None);
                    }
                    let outcome = self.enricher.enrich(&target).await;
                    (target, Some(outcome))
                })
                .buffer_unordered(self.concurrency);

            while let Some((target, outcome)) = outcomes.next().await {
                match outcome {
                    None => report.cancelled = true,
                    Some(Ok(EnrichmentOutcome::Enriched)) => report.items_processed += 1,
                    Some(Ok(EnrichmentOutcome::Deferred)) => deferred += 1,
                    Some(Ok(EnrichmentOutcome::Failed(reason))) => {
                        report.errors.push(format!("{}: {}", target.label(), reason));
                    }
                    Some(Err(e)) => return Err(e),
                }
            }
            drop(outcomes);

            if report.cancelled {
                return Ok(report);
            }
            if deferred > 0 {
                warn!("Rate limit reached, {} entities deferred to the next run", deferred);
                report
                    .errors
                    .push(format!("rate limit exceeded, {} entities deferred", deferred));
                break;
            }
        }

        info!(
            "Enriched {} entities ({} errors)",
            report.items_processed,
            report.errors.total()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::github::{FetchOutcome, FetchedPayload};
    use crate::repository::test_support::{sample_repository as sample, setup_test_db};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers from a fixed table; unknown endpoints are rate limited.
    struct TableApi {
        responses: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GitHubApi for TableApi {
        async fn fetch(&self, endpoint: &str, _etag: Option<&str>) -> Result<FetchOutcome, FetchError> {
            self.calls.lock().unwrap().push(endpoint.to_string());
            match self.responses.get(endpoint) {
                Some(body) => Ok(FetchOutcome::Fetched(FetchedPayload {
                    payload: body.clone(),
                    etag: None,
                    rate_limit_remaining: None,
                    has_next_page: false,
                })),
                None => Err(FetchError::RateLimitExceeded {
                    endpoint: endpoint.to_string(),
                }),
            }
        }
    }

    fn context(pool: SqlitePool, responses: HashMap<String, String>) -> (AppContext, Arc<TableApi>) {
        let api = Arc::new(TableApi {
            responses,
            calls: Mutex::new(Vec::new()),
        });
        let ctx = AppContext::new(Settings::default(), pool, Some(api.clone()));
        (ctx, api)
    }

    #[tokio::test]
    async fn test_repository_enrichment() {
        let (pool, _dir) = setup_test_db().await;
        let repos = DieselRepoRepository::new(pool.clone());
        let id = repos.upsert(sample("10", "octo/hello", 5)).await.unwrap();

        let payload = serde_json::json!({
            "id": 10,
            "name": "hello",
            "full_name": "octo/hello",
            "html_url": "https://github.com/octo/hello",
            "stargazers_count": 8,
            "forks_count": 2,
            "size": 300,
            "subscribers_count": 4,
            "license": {"spdx_id": "MIT", "name": "MIT License"},
            "owner": {"id": 1, "login": "octo", "type": "User"},
            "created_at": "2023-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        });
        let (ctx, _api) = context(
            pool.clone(),
            HashMap::from([("/repos/octo/hello".to_string(), payload.to_string())]),
        );

        let service = EnrichmentService::new(&ctx).unwrap();
        let report = service.run(&CancelFlag::new()).await.unwrap();
        // The owner's profile fetch is not scripted and gets deferred.
        assert_eq!(report.items_processed, 1);

        let repo = repos.get(&id).await.unwrap().unwrap();
        assert!(repo.is_enriched);
        assert_eq!(repo.watchers, 4);
        assert_eq!(repo.license.as_deref(), Some("MIT"));
        assert!(repo.owner_id.is_some());
        assert_eq!(repos.snapshots(&id).await.unwrap().last().unwrap().stars, 8);
    }

    #[tokio::test]
    async fn test_rate_limit_defers_without_attempt() {
        let (pool, _dir) = setup_test_db().await;
        let repos = DieselRepoRepository::new(pool.clone());
        let id = repos.upsert(sample("10", "octo/hello", 5)).await.unwrap();
        let (ctx, api) = context(pool.clone(), HashMap::new());

        let service = EnrichmentService::new(&ctx).unwrap();
        let report = service.run(&CancelFlag::new()).await.unwrap();
        assert_eq!(report.items_processed, 0);
        assert_eq!(report.errors.total(), 1);
        assert_eq!(api.calls.lock().unwrap().len(), 1);

        let repo = repos.get(&id).await.unwrap().unwrap();
        assert!(!repo.is_enriched);
        assert_eq!(repo.enrichment_attempts, 0);
        assert_eq!(service.count_candidates().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_detail_counts_attempt() {
        let (pool, _dir) = setup_test_db().await;
        let repos = DieselRepoRepository::new(pool.clone());
        let id = repos.upsert(sample("10", "octo/hello", 5)).await.unwrap();
        let (ctx, _api) = context(
            pool.clone(),
            HashMap::from([("/repos/octo/hello".to_string(), "{".to_string())]),
        );

        let enricher = Enricher::new(ctx.api().unwrap(), pool.clone());
        let target = EnrichmentTarget::Repository {
            id: id.clone(),
            full_name: "octo/hello".to_string(),
        };
        let outcome = enricher.enrich(&target).await.unwrap();
        assert!(matches!(outcome, EnrichmentOutcome::Failed(_)));

        let repo = repos.get(&id).await.unwrap().unwrap();
        assert_eq!(repo.enrichment_attempts, 1);
        assert!(repo.enrichment_error.is_some());
    }

    #[tokio::test]
    async fn test_failing_entity_gets_one_attempt_per_run() {
        let (pool, _dir) = setup_test_db().await;
        let repos = DieselRepoRepository::new(pool.clone());
        let id = repos.upsert(sample("10", "octo/hello", 5)).await.unwrap();
        let (ctx, api) = context(
            pool.clone(),
            HashMap::from([("/repos/octo/hello".to_string(), "{".to_string())]),
        );
        let service = EnrichmentService::new(&ctx).unwrap();

        for run in 1..=3 {
            let report = service.run(&CancelFlag::new()).await.unwrap();
            assert_eq!(report.errors.total(), 1);
            assert_eq!(api.calls.lock().unwrap().len(), run);
            let repo = repos.get(&id).await.unwrap().unwrap();
            assert_eq!(repo.enrichment_attempts, run as i32);
        }
        assert_eq!(service.count_candidates().await.unwrap(), 0);

        let report = service.run(&CancelFlag::new()).await.unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(api.calls.lock().unwrap().len(), 3);
    }
}
