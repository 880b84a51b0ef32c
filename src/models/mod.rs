//! Domain models for the analytics pipeline.

mod commit;
mod contributor;
mod merge_request;
mod pipeline;
mod ranking;
mod raw_record;
mod repo;

pub use commit::{file_extension, language_for_extension, Commit, FileStatus};
pub use contributor::{Contributor, ContributorRepositoryLink, ContributorRole};
pub use merge_request::{MergeRequest, MergeRequestReview, MergeRequestState};
pub use pipeline::{PipelineRun, PipelineSchedule, PipelineState, PipelineType, RunStatus};
pub use ranking::{ComponentScores, ContributorRanking, RankingTrend, RawMetrics};
pub use raw_record::{RawEntityKind, RawRecord};
pub use repo::{Repository, RepositorySnapshot};
