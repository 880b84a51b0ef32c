//! Cron-driven pipeline starts.
//!
//! Schedules are seeded from settings into `pipeline_schedules`, then every
//! active row becomes a `tokio-cron-scheduler` job that calls
//! [`PipelineController::start`].

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use super::context::PipelineError;
use super::controller::PipelineController;
use crate::models::PipelineType;
use crate::repository::DieselPipelineRepository;

/// Cron expression with a leading seconds field. Classic 5-field
/// expressions fire at second 0.
pub fn normalize_cron(expression: &str) -> String {
    let expression = expression.split_whitespace().collect::<Vec<_>>().join(" ");
    if expression.split(' ').count() == 5 {
        format!("0 {}", expression)
    } else {
        expression
    }
}

/// Start one scheduled run. Returns the run id, or `None` when the run was
/// skipped.
pub async fn trigger(controller: &PipelineController, pipeline_type: PipelineType) -> Option<String> {
    match controller.start(pipeline_type).await {
        Ok(run_id) => {
            info!("Scheduled {} run {} started", pipeline_type, run_id);
            Some(run_id)
        }
        Err(PipelineError::AlreadyRunning(_)) => {
            info!("Skipping scheduled {}: previous run still active", pipeline_type);
            None
        }
        Err(e) => {
            warn!("Scheduled {} could not start: {}", pipeline_type, e);
            None
        }
    }
}

pub struct Scheduler {
    controller: PipelineController,
    schedules: DieselPipelineRepository,
}

impl Scheduler {
    pub fn new(controller: PipelineController) -> Self {
        let schedules = DieselPipelineRepository::new(controller.context().pool.clone());
        Self {
            controller,
            schedules,
        }
    }

    /// Write the configured cron expressions. Rows keep their `is_active`
    /// flag.
    pub async fn seed(&self) -> Result<usize, PipelineError> {
        let mut configured: Vec<_> = self.controller.context().settings.schedules.iter().collect();
        configured.sort();

        for (pipeline_type, cron) in &configured {
            let cron = normalize_cron(cron);
            debug!("Schedule {} at '{}'", pipeline_type, cron);
            self.schedules
                .upsert_schedule(**pipeline_type, &cron, serde_json::json!({}))
                .await?;
        }
        Ok(configured.len())
    }

    /// Register a job per active schedule and start ticking. The returned
    /// scheduler must be kept alive (and shut down) by the caller.
    pub async fn start(&self) -> Result<JobScheduler, PipelineError> {
        let sched = JobScheduler::new()
            .await
            .map_err(|e| PipelineError::Scheduler(e.to_string()))?;

        let mut registered = 0;
        for schedule in self.schedules.active_schedules().await? {
            let pipeline_type = schedule.pipeline_type;
            let cron = normalize_cron(&schedule.cron_expression);
            let controller = self.controller.clone();

            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let controller = controller.clone();
                Box::pin(async move {
                    trigger(&controller, pipeline_type).await;
                })
            });
            let job = match job {
                Ok(job) => job,
                Err(e) => {
                    warn!("Invalid cron '{}' for {}: {}", cron, pipeline_type, e);
                    continue;
                }
            };
            sched
                .add(job)
                .await
                .map_err(|e| PipelineError::Scheduler(e.to_string()))?;
            info!("Registered {} at '{}'", pipeline_type, cron);
            registered += 1;
        }

        if registered == 0 {
            warn!("No active pipeline schedules");
        }

        sched
            .start()
            .await
            .map_err(|e| PipelineError::Scheduler(e.to_string()))?;
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::pipeline::context::AppContext;
    use crate::repository::test_support::setup_test_db;
    use crate::models::RunStatus;
    use crate::repository::PipelineTracker;

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("  0 30   * * * * "), "0 30 * * * *");
        assert_eq!(normalize_cron("0 0 3 * * *"), "0 0 3 * * *");
    }

    #[tokio::test]
    async fn test_seed_keeps_active_flag() {
        let (pool, _dir) = setup_test_db().await;
        let mut settings = Settings::with_data_dir(std::env::temp_dir());
        settings
            .schedules
            .insert(PipelineType::ContributorRanking, "15 4 * * *".to_string());
        let controller = PipelineController::new(AppContext::new(settings, pool.clone(), None));
        let scheduler = Scheduler::new(controller);

        assert_eq!(scheduler.seed().await.unwrap(), 4);
        let repo = DieselPipelineRepository::new(pool);
        assert!(repo
            .set_schedule_active(PipelineType::GithubSync, false)
            .await
            .unwrap());
        scheduler.seed().await.unwrap();

        let schedules = repo.schedules().await.unwrap();
        assert_eq!(schedules.len(), 4);
        let ranking = schedules
            .iter()
            .find(|s| s.pipeline_type == PipelineType::ContributorRanking)
            .unwrap();
        assert_eq!(ranking.cron_expression, "0 15 4 * * *");
        assert_eq!(repo.active_schedules().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_trigger_skips_running_pipeline() {
        let (pool, _dir) = setup_test_db().await;
        let settings = Settings::with_data_dir(std::env::temp_dir());
        let controller = PipelineController::new(AppContext::new(settings, pool.clone(), None));

        PipelineTracker::new(pool)
            .try_start(PipelineType::RepositoryProcessing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trigger(&controller, PipelineType::RepositoryProcessing).await, None);
    }

    #[tokio::test]
    async fn test_trigger_without_token_lands_in_history() {
        let (pool, _dir) = setup_test_db().await;
        let settings = Settings::with_data_dir(std::env::temp_dir());
        let controller = PipelineController::new(AppContext::new(settings, pool, None));

        let run_id = trigger(&controller, PipelineType::GithubSync).await.unwrap();
        for _ in 0..200 {
            if !controller.status(PipelineType::GithubSync).await.unwrap().is_running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let history = controller.history(Some(PipelineType::GithubSync), 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, run_id);
        assert_eq!(history[0].status, RunStatus::Failed);
        assert!(history[0].error_message.as_deref().unwrap().contains("GITHUB_TOKEN"));
    }
}
