//! Pipeline stages and their orchestration.
//!
//! Each stage is a service with a `run(&CancelFlag) -> JobReport` body;
//! [`PipelineController`] gates, runs and records them, and [`Scheduler`]
//! starts them on cron schedules.

pub mod context;
pub mod controller;
pub mod enricher;
pub mod extractor;
pub mod intake;
pub mod ranking;
pub mod repo_stats;
pub mod scheduler;
pub mod sync;

pub use context::{AppContext, CancelFlag, ErrorAggregate, JobReport, PipelineError};
pub use controller::PipelineController;
pub use enricher::{EnrichmentOutcome, EnrichmentService, EnrichmentTarget, Enricher};
pub use extractor::{extract, EntityDraft, ExtractionService};
pub use intake::RawIntake;
pub use ranking::{RankingEngine, RankingService, RankingWeights};
pub use repo_stats::{HealthWeights, RepositoryProcessingService, RepositoryProcessor};
pub use scheduler::Scheduler;
pub use sync::GithubSync;
