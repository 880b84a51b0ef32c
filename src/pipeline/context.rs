//! Shared dependencies and bookkeeping types of pipeline jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Settings;
use crate::github::{FetchError, GitHubApi};
use crate::models::PipelineType;
use crate::repository::{DieselError, SqlitePool};

/// Messages kept verbatim in a run's error summary.
const MAX_KEPT_ERRORS: usize = 20;

/// Errors that stop a pipeline run (or keep it from starting).
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0} is already running")]
    AlreadyRunning(PipelineType),
    #[error("missing configuration: {0}")]
    MissingConfig(String),
    #[error("invalid repository name '{0}', expected owner/name")]
    InvalidRepository(String),
    #[error("database error: {0}")]
    Database(#[from] DieselError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("run was cancelled")]
    Cancelled,
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// Everything a job needs, built once at startup and passed down.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub pool: SqlitePool,
    api: Option<Arc<dyn GitHubApi>>,
}

impl AppContext {
    pub fn new(settings: Settings, pool: SqlitePool, api: Option<Arc<dyn GitHubApi>>) -> Self {
        Self {
            settings,
            pool,
            api,
        }
    }

    /// The API client, or `MissingConfig` when no token was configured.
    pub fn api(&self) -> Result<Arc<dyn GitHubApi>, PipelineError> {
        self.api.clone().ok_or_else(|| {
            PipelineError::MissingConfig("GITHUB_TOKEN is not set".to_string())
        })
    }
}

/// Cooperative cancellation flag, checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-entity errors collected during a run. Keeps the first few messages
/// and counts the rest.
#[derive(Debug, Clone, Default)]
pub struct ErrorAggregate {
    messages: Vec<String>,
    total: usize,
}

impl ErrorAggregate {
    pub fn push(&mut self, message: impl Into<String>) {
        self.total += 1;
        if self.messages.len() < MAX_KEPT_ERRORS {
            self.messages.push(message.into());
        }
    }

    pub fn extend(&mut self, other: ErrorAggregate) {
        let dropped = other.total - other.messages.len();
        for message in other.messages {
            self.push(message);
        }
        self.total += dropped;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Text stored in `PipelineRun.error_message`; `None` when clean.
    pub fn summary(&self) -> Option<String> {
        if self.total == 0 {
            return None;
        }
        let mut text = format!("{} error(s): {}", self.total, self.messages.join("; "));
        if self.total > self.messages.len() {
            text.push_str(&format!(" (+{} more)", self.total - self.messages.len()));
        }
        Some(text)
    }
}

/// Outcome of a job body that ran to the end (or was cancelled cleanly).
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub items_processed: usize,
    pub errors: ErrorAggregate,
    pub cancelled: bool,
}

impl JobReport {
    pub fn merge(&mut self, other: JobReport) {
        self.items_processed += other.items_processed;
        self.errors.extend(other.errors);
        self.cancelled |= other.cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_aggregate_keeps_first_messages() {
        let mut errors = ErrorAggregate::default();
        assert_eq!(errors.summary(), None);

        for i in 0..25 {
            errors.push(format!("e{}", i));
        }
        assert_eq!(errors.total(), 25);
        let summary = errors.summary().unwrap();
        assert!(summary.starts_with("25 error(s): e0; e1;"));
        assert!(summary.contains("e19"));
        assert!(!summary.contains("e20"));
        assert!(summary.ends_with("(+5 more)"));
    }

    #[test]
    fn test_error_aggregate_extend_counts_dropped() {
        let mut a = ErrorAggregate::default();
        a.push("a");
        let mut b = ErrorAggregate::default();
        for i in 0..30 {
            b.push(format!("b{}", i));
        }
        a.extend(b);
        assert_eq!(a.total(), 31);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
