use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named category of background job with its own schedule and run gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    /// Fetch tracked repositories into the raw intake and extract entities.
    GithubSync,
    /// Fill in entity fields with additional API calls.
    DataEnrichment,
    /// Compute per-repository statistics and health.
    RepositoryProcessing,
    /// Rank the whole contributor population.
    ContributorRanking,
}

impl PipelineType {
    pub const ALL: [PipelineType; 4] = [
        PipelineType::GithubSync,
        PipelineType::DataEnrichment,
        PipelineType::RepositoryProcessing,
        PipelineType::ContributorRanking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::GithubSync => "github_sync",
            PipelineType::DataEnrichment => "data_enrichment",
            PipelineType::RepositoryProcessing => "repository_processing",
            PipelineType::ContributorRanking => "contributor_ranking",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for PipelineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a run, and of a pipeline type's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(RunStatus::Idle),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// History row for one execution of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_type: PipelineType,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items_processed: i32,
    pub error_message: Option<String>,
}

/// Current state of a pipeline type. `is_running` is the run gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_type: PipelineType,
    pub status: RunStatus,
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// State reported for a type that has never run.
    pub fn idle(pipeline_type: PipelineType) -> Self {
        Self {
            pipeline_type,
            status: RunStatus::Idle,
            is_running: false,
            last_run: None,
            updated_at: Utc::now(),
        }
    }
}

/// Cron schedule for a pipeline type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSchedule {
    pub id: String,
    pub pipeline_type: PipelineType,
    pub cron_expression: String,
    pub is_active: bool,
    pub parameters: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_type_names() {
        for t in PipelineType::ALL {
            assert_eq!(PipelineType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(PipelineType::from_str("ai_summary"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Idle.is_terminal());
    }
}
