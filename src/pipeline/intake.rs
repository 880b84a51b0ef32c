//! Conditional fetch into the raw intake table.
//!
//! Every fetch sends the ETag of the latest stored version of its key. A 304
//! stores nothing and hands back that previous version.

use std::sync::Arc;

use tracing::debug;

use super::context::PipelineError;
use crate::github::{FetchError, FetchOutcome, GitHubApi};
use crate::models::{RawEntityKind, RawRecord};
use crate::repository::diesel_raw_record::NewIntake;
use crate::repository::{DieselRawRecordRepository, SqlitePool};

/// Page size requested from list endpoints.
pub const PAGE_SIZE: usize = 100;

/// A stored payload returned by [`RawIntake::fetch`].
#[derive(Debug, Clone)]
pub struct IntakeRecord {
    pub record: RawRecord,
    /// A new version was stored (false on 304).
    pub fresh: bool,
    /// List endpoints: another page follows.
    pub has_next_page: bool,
}

/// Fetches API resources and appends them to the raw intake.
#[derive(Clone)]
pub struct RawIntake {
    api: Arc<dyn GitHubApi>,
    raw: DieselRawRecordRepository,
}

impl RawIntake {
    pub fn new(api: Arc<dyn GitHubApi>, pool: SqlitePool) -> Self {
        Self {
            api,
            raw: DieselRawRecordRepository::new(pool),
        }
    }

    /// Fetch `endpoint` for intake key `(kind, external_id)`.
    ///
    /// `processed` stores the new version as already consumed, for payloads
    /// the caller applies itself (enrichment) rather than leaving them to the
    /// extractor.
    pub async fn fetch(
        &self,
        kind: RawEntityKind,
        external_id: &str,
        endpoint: &str,
        processed: bool,
    ) -> Result<IntakeRecord, PipelineError> {
        let previous = self.raw.latest_for_key(kind, external_id).await?;
        let etag = previous.as_ref().and_then(|r| r.etag.clone());

        match self.api.fetch(endpoint, etag.as_deref()).await? {
            FetchOutcome::Fetched(fetched) => {
                let record = self
                    .raw
                    .insert(NewIntake {
                        kind,
                        external_id: external_id.to_string(),
                        payload: fetched.payload,
                        api_endpoint: endpoint.to_string(),
                        etag: fetched.etag,
                        processed,
                    })
                    .await?;
                debug!("Stored {} {} as raw record {}", kind.as_str(), external_id, record.id);
                Ok(IntakeRecord {
                    record,
                    fresh: true,
                    has_next_page: fetched.has_next_page,
                })
            }
            FetchOutcome::NotModified => {
                let record = previous.ok_or_else(|| FetchError::FetchFailed {
                    status: 304,
                    body: format!("not modified without a stored version of {}", external_id),
                })?;
                debug!("{} {} not modified", kind.as_str(), external_id);
                let has_next_page = is_full_page(&record.payload);
                Ok(IntakeRecord {
                    record,
                    fresh: false,
                    has_next_page,
                })
            }
        }
    }
}

/// A stored list page that was full probably has a successor. Used when a 304
/// means the `Link` header of the original reply is not available.
fn is_full_page(payload: &str) -> bool {
    serde_json::from_str::<Vec<serde_json::Value>>(payload)
        .map(|items| items.len() >= PAGE_SIZE)
        .unwrap_or(false)
}
