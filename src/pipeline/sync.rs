//! github_sync: fetch tracked repositories and their listings into the raw
//! intake, then extract everything pending.

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::context::{AppContext, CancelFlag, JobReport, PipelineError};
use super::extractor::ExtractionService;
use super::intake::{RawIntake, PAGE_SIZE};
use crate::models::{RawEntityKind, Repository};
use crate::repository::DieselRepoRepository;

/// Listing endpoints walked page by page for every repository.
const LISTINGS: [(RawEntityKind, &str, &str); 3] = [
    (RawEntityKind::MergeRequestPage, "pulls", "pulls?state=all&sort=updated&direction=desc"),
    (RawEntityKind::CommitPage, "commits", "commits?"),
    (RawEntityKind::ContributorPage, "contributors", "contributors?"),
];

/// Intake key of one listing page, e.g. `octo/hello:pulls:2`.
pub fn page_key(full_name: &str, listing: &str, page: u32) -> String {
    format!("{}:{}:{}", full_name, listing, page)
}

fn page_endpoint(full_name: &str, path: &str, page: u32) -> String {
    let separator = if path.ends_with('?') { "" } else { "&" };
    format!(
        "/repos/{}/{}{}per_page={}&page={}",
        full_name, path, separator, PAGE_SIZE, page
    )
}

/// `owner/name` with both parts non-empty.
pub fn is_valid_full_name(full_name: &str) -> bool {
    match full_name.split_once('/') {
        Some((owner, name)) => !owner.is_empty() && !name.is_empty() && !name.contains('/'),
        None => false,
    }
}

/// Configured repositories plus every repository already stored, deduplicated
/// without regard to case.
pub async fn sync_targets(
    tracked: &[String],
    repos: &DieselRepoRepository,
) -> Result<Vec<String>, PipelineError> {
    let mut targets: Vec<String> = tracked
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    targets.extend(repos.full_names().await?);
    targets.sort_by_key(|name| name.to_lowercase());
    targets.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
    Ok(targets)
}

/// Runs the github_sync pipeline.
pub struct GithubSync {
    intake: RawIntake,
    repos: DieselRepoRepository,
    extraction: ExtractionService,
    tracked: Vec<String>,
    max_pages: u32,
    concurrency: usize,
}

impl GithubSync {
    pub fn new(ctx: &AppContext) -> Result<Self, PipelineError> {
        Ok(Self {
            intake: RawIntake::new(ctx.api()?, ctx.pool.clone()),
            repos: DieselRepoRepository::new(ctx.pool.clone()),
            extraction: ExtractionService::new(ctx.pool.clone(), ctx.settings.extraction_batch_size),
            tracked: ctx.settings.tracked_repositories.clone(),
            max_pages: ctx.settings.max_pages.max(1),
            concurrency: ctx.settings.request_concurrency.max(1),
        })
    }

    pub async fn targets(&self) -> Result<Vec<String>, PipelineError> {
        sync_targets(&self.tracked, &self.repos).await
    }

    /// Fetch one repository and extract it right away, so later syncs pick
    /// it up from the database.
    pub async fn track(&self, full_name: &str) -> Result<Option<Repository>, PipelineError> {
        if !is_valid_full_name(full_name) {
            return Err(PipelineError::InvalidRepository(full_name.to_string()));
        }
        self.intake
            .fetch(
                RawEntityKind::Repository,
                full_name,
                &format!("/repos/{}", full_name),
                false,
            )
            .await?;
        self.extraction.run_pending(&CancelFlag::new()).await?;
        Ok(self.repos.find_by_full_name(full_name).await?)
    }

    pub async fn run(&self, cancel: &CancelFlag) -> Result<JobReport, PipelineError> {
        let targets = self.targets().await?;
        info!("Syncing {} repositories", targets.len());

        let mut report = JobReport::default();
        let mut results = stream::iter(targets)
            .map(|full_name| async move {
                if cancel.is_cancelled() {
                    return (full_name, None);
                }
                let result = self.sync_repository(&full_name).await;
                (full_name, Some(result))
            })
            .buffer_unordered(self.concurrency);

        while let Some((full_name, result)) = results.next().await {
            match result {
                None => report.cancelled = true,
                Some(Ok(fresh)) => {
                    debug!("{}: {} new payloads", full_name, fresh);
                    report.items_processed += 1;
                }
                Some(Err(PipelineError::Database(e))) => return Err(PipelineError::Database(e)),
                Some(Err(e)) => {
                    warn!("Failed to sync {}: {}", full_name, e);
                    report.errors.push(format!("{}: {}", full_name, e));
                }
            }
        }
        drop(results);

        if report.cancelled {
            return Ok(report);
        }

        let extracted = self.extraction.run_pending(cancel).await?;
        info!(
            "Synced {} repositories, extracted {} entities",
            report.items_processed, extracted.items_processed
        );
        report.errors.extend(extracted.errors);
        report.cancelled |= extracted.cancelled;
        Ok(report)
    }

    /// Fetch the repository and its listing pages. Returns the number of
    /// new payload versions stored.
    async fn sync_repository(&self, full_name: &str) -> Result<usize, PipelineError> {
        if !is_valid_full_name(full_name) {
            return Err(PipelineError::InvalidRepository(full_name.to_string()));
        }

        let mut fresh = 0;
        let repo = self
            .intake
            .fetch(
                RawEntityKind::Repository,
                full_name,
                &format!("/repos/{}", full_name),
                false,
            )
            .await?;
        fresh += usize::from(repo.fresh);

        for (kind, listing, path) in LISTINGS {
            for page in 1..=self.max_pages {
                let fetched = self
                    .intake
                    .fetch(
                        kind,
                        &page_key(full_name, listing, page),
                        &page_endpoint(full_name, path, page),
                        false,
                    )
                    .await?;
                fresh += usize::from(fetched.fresh);
                if !fetched.has_next_page {
                    break;
                }
            }
        }

        Ok(fresh)
    }
}
