//! Pipeline control: start, stop, status and history per pipeline type.
//!
//! The run gate lives in the database ([`PipelineTracker`]); the controller
//! only keeps the cancel flags of runs started from this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::context::{AppContext, CancelFlag, JobReport, PipelineError};
use super::enricher::{CandidateSource, EnrichmentService};
use super::ranking::RankingService;
use super::repo_stats::RepositoryProcessingService;
use super::sync::{sync_targets, GithubSync};
use crate::models::{PipelineRun, PipelineState, PipelineType, RunStatus};
use crate::repository::{DieselContributorRepository, DieselRepoRepository, PipelineTracker};

/// Error message of runs stopped through [`PipelineController::stop`].
pub const CANCELLED_MESSAGE: &str = "cancelled";

#[derive(Clone)]
pub struct PipelineController {
    ctx: AppContext,
    tracker: PipelineTracker,
    cancels: Arc<Mutex<HashMap<PipelineType, CancelFlag>>>,
}

impl PipelineController {
    pub fn new(ctx: AppContext) -> Self {
        let tracker = PipelineTracker::new(ctx.pool.clone());
        Self {
            ctx,
            tracker,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    fn cancels(&self) -> MutexGuard<'_, HashMap<PipelineType, CancelFlag>> {
        self.cancels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the run gate and run the job in the background. Returns the id
    /// of the new run.
    pub async fn start(&self, pipeline_type: PipelineType) -> Result<String, PipelineError> {
        let (run, cancel) = self.claim(pipeline_type).await?;
        let run_id = run.id.clone();

        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.execute(pipeline_type, &run.id, cancel).await {
                error!("Failed to record end of {} run {}: {}", pipeline_type, run.id, e);
            }
        });

        Ok(run_id)
    }

    /// Like [`start`](Self::start) but waits for the run and returns its
    /// final record.
    pub async fn run(&self, pipeline_type: PipelineType) -> Result<PipelineRun, PipelineError> {
        let (run, cancel) = self.claim(pipeline_type).await?;
        self.execute(pipeline_type, &run.id, cancel).await?;
        Ok(self.tracker.get_run(&run.id).await?.unwrap_or(run))
    }

    /// Request cooperative cancellation. Returns false when no run of this
    /// type was started by this process.
    pub fn stop(&self, pipeline_type: PipelineType) -> bool {
        match self.cancels().get(&pipeline_type) {
            Some(flag) => {
                info!("Stopping {}", pipeline_type);
                flag.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn status(&self, pipeline_type: PipelineType) -> Result<PipelineState, PipelineError> {
        Ok(self.tracker.state(pipeline_type).await?)
    }

    pub async fn statuses(&self) -> Result<Vec<PipelineState>, PipelineError> {
        Ok(self.tracker.states().await?)
    }

    pub async fn history(
        &self,
        pipeline_type: Option<PipelineType>,
        limit: i64,
    ) -> Result<Vec<PipelineRun>, PipelineError> {
        Ok(self.tracker.history(pipeline_type, limit).await?)
    }

    pub async fn clear_history(
        &self,
        pipeline_type: Option<PipelineType>,
    ) -> Result<usize, PipelineError> {
        Ok(self.tracker.clear_history(pipeline_type).await?)
    }

    /// Size of the work a run of this type would pick up.
    pub async fn item_count(&self, pipeline_type: PipelineType) -> Result<u64, PipelineError> {
        let pool = self.ctx.pool.clone();
        let count = match pipeline_type {
            PipelineType::GithubSync => {
                let repos = DieselRepoRepository::new(pool);
                sync_targets(&self.ctx.settings.tracked_repositories, &repos)
                    .await?
                    .len() as i64
            }
            PipelineType::DataEnrichment => {
                CandidateSource::new(pool, self.ctx.settings.max_enrichment_attempts)
                    .count()
                    .await?
            }
            PipelineType::RepositoryProcessing => DieselRepoRepository::new(pool).count().await?,
            PipelineType::ContributorRanking => {
                DieselContributorRepository::new(pool).count_rankable().await?
            }
        };
        Ok(count.max(0) as u64)
    }

    /// Fail runs whose owning process stopped sending heartbeats, in this
    /// process or any other sharing the database.
    pub async fn recover(&self) -> Result<usize, PipelineError> {
        let stale_before = Utc::now() - self.ctx.settings.stale_run_after();
        let recovered = self.tracker.recover_interrupted(stale_before).await?;
        if recovered > 0 {
            warn!("Marked {} interrupted pipeline run(s) as failed", recovered);
        }
        Ok(recovered)
    }

    async fn claim(
        &self,
        pipeline_type: PipelineType,
    ) -> Result<(PipelineRun, CancelFlag), PipelineError> {
        let Some(run) = self.tracker.try_start(pipeline_type).await? else {
            return Err(PipelineError::AlreadyRunning(pipeline_type));
        };

        let cancel = CancelFlag::new();
        self.cancels().insert(pipeline_type, cancel.clone());
        info!("Started {} run {}", pipeline_type, run.id);
        Ok((run, cancel))
    }

    async fn execute(
        &self,
        pipeline_type: PipelineType,
        run_id: &str,
        cancel: CancelFlag,
    ) -> Result<(), PipelineError> {
        let heartbeat = self.spawn_heartbeat(pipeline_type);
        let result = self.dispatch(pipeline_type, &cancel).await;
        heartbeat.abort();

        let (status, items, message) = match result {
            Ok(report) if report.cancelled || cancel.is_cancelled() => (
                RunStatus::Failed,
                report.items_processed,
                Some(CANCELLED_MESSAGE.to_string()),
            ),
            Ok(report) => {
                if !report.errors.is_empty() {
                    warn!(
                        "{} run {} finished with {} error(s)",
                        pipeline_type,
                        run_id,
                        report.errors.total()
                    );
                }
                (RunStatus::Completed, report.items_processed, report.errors.summary())
            }
            Err(PipelineError::Cancelled) => {
                (RunStatus::Failed, 0, Some(CANCELLED_MESSAGE.to_string()))
            }
            Err(e) => {
                error!("{} run {} failed: {}", pipeline_type, run_id, e);
                (RunStatus::Failed, 0, Some(e.to_string()))
            }
        };

        self.cancels().remove(&pipeline_type);
        let items = i32::try_from(items).unwrap_or(i32::MAX);
        self.tracker
            .finish(run_id, pipeline_type, status, items, message)
            .await?;
        info!(
            "{} run {} ended as {} ({} items)",
            pipeline_type,
            run_id,
            status.as_str(),
            items
        );
        Ok(())
    }

    /// Keep the gate's heartbeat fresh until the returned task is aborted.
    fn spawn_heartbeat(&self, pipeline_type: PipelineType) -> JoinHandle<()> {
        let tracker = self.tracker.clone();
        let every = self.ctx.settings.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = tracker.heartbeat(pipeline_type).await {
                    warn!("Heartbeat of {} failed: {}", pipeline_type, e);
                }
            }
        })
    }

    async fn dispatch(
        &self,
        pipeline_type: PipelineType,
        cancel: &CancelFlag,
    ) -> Result<JobReport, PipelineError> {
        match pipeline_type {
            PipelineType::GithubSync => GithubSync::new(&self.ctx)?.run(cancel).await,
            PipelineType::DataEnrichment => EnrichmentService::new(&self.ctx)?.run(cancel).await,
            PipelineType::RepositoryProcessing => {
                RepositoryProcessingService::new(&self.ctx).run(cancel).await
            }
            PipelineType::ContributorRanking => RankingService::new(&self.ctx).run(cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::repository::test_support::setup_test_db;

    fn controller(pool: crate::repository::SqlitePool) -> PipelineController {
        let settings = Settings::with_data_dir(std::env::temp_dir());
        PipelineController::new(AppContext::new(settings, pool, None))
    }

    #[tokio::test]
    async fn test_run_without_token_is_recorded_as_failed() {
        let (pool, _dir) = setup_test_db().await;
        let controller = controller(pool);

        let run = controller.run(PipelineType::GithubSync).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.items_processed, 0);
        assert_eq!(
            run.error_message.as_deref(),
            Some("missing configuration: GITHUB_TOKEN is not set")
        );

        let state = controller.status(PipelineType::GithubSync).await.unwrap();
        assert!(!state.is_running);
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(controller.history(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runs_can_be_spawned_onto_the_runtime() {
        let (pool, _dir) = setup_test_db().await;
        let controller = controller(pool);

        for pipeline_type in PipelineType::ALL {
            let controller = controller.clone();
            let run = tokio::spawn(async move { controller.run(pipeline_type).await })
                .await
                .unwrap()
                .unwrap();
            assert_eq!(run.pipeline_type, pipeline_type);
            assert_ne!(run.status, RunStatus::Running);
        }
    }

    #[tokio::test]
    async fn test_offline_pipeline_runs_to_completion() {
        let (pool, _dir) = setup_test_db().await;
        let controller = controller(pool);

        let run = controller.run(PipelineType::ContributorRanking).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.items_processed, 0);
        assert!(run.completed_at.is_some());

        let state = controller.status(PipelineType::ContributorRanking).await.unwrap();
        assert!(!state.is_running);
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.last_run.is_some());
    }

    #[tokio::test]
    async fn test_second_start_is_already_running() {
        let (pool, _dir) = setup_test_db().await;
        let controller = controller(pool.clone());

        let held = PipelineTracker::new(pool)
            .try_start(PipelineType::RepositoryProcessing)
            .await
            .unwrap();
        assert!(held.is_some());

        let err = controller.start(PipelineType::RepositoryProcessing).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::AlreadyRunning(PipelineType::RepositoryProcessing)
        ));
        assert_eq!(
            controller
                .history(Some(PipelineType::RepositoryProcessing), 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_without_run() {
        let (pool, _dir) = setup_test_db().await;
        assert!(!controller(pool).stop(PipelineType::DataEnrichment));
    }

    #[tokio::test]
    async fn test_item_counts_on_empty_database() {
        let (pool, _dir) = setup_test_db().await;
        let controller = controller(pool);
        for pipeline_type in PipelineType::ALL {
            assert_eq!(controller.item_count(pipeline_type).await.unwrap(), 0);
        }
    }
}
