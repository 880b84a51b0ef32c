//! Raw payload → normalized entity extraction.
//!
//! [`extract`] is a pure function from one raw record to entity drafts.
//! Drafts refer to each other by GitHub identity (account id, repository
//! full name) and are resolved to row ids when [`ExtractionService`] persists
//! a batch. A batch is written in one transaction together with marking its
//! raw records processed, so a crash never leaves a record half-applied.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::{Connection, SqliteConnection};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::context::{CancelFlag, JobReport, PipelineError};
use crate::github::payloads::{GhCommit, GhPullRequest, GhRepository, GhUser};
use crate::models::{MergeRequestState, RawEntityKind, RawRecord};
use crate::repository::diesel_commit::{upsert_summary_in, CommitUpsert};
use crate::repository::diesel_contributor::{
    id_by_external_in, upsert_account_in, upsert_placeholder_in, ContributorUpsert,
};
use crate::repository::diesel_merge_request::{self, MergeRequestUpsert};
use crate::repository::diesel_raw_record::{mark_processed_in, supersede_older_in};
use crate::repository::diesel_repo::{self, id_by_full_name_in, RepositoryUpsert};
use crate::repository::{run_blocking, DieselError, DieselRawRecordRepository, SqlitePool};

/// Kinds fed through extraction, in dependency order: repositories before
/// the pull requests and commits that reference them.
pub const EXTRACTION_ORDER: [RawEntityKind; 7] = [
    RawEntityKind::Repository,
    RawEntityKind::ContributorPage,
    RawEntityKind::Contributor,
    RawEntityKind::MergeRequestPage,
    RawEntityKind::MergeRequest,
    RawEntityKind::CommitPage,
    RawEntityKind::Commit,
];

/// Why a raw record produced no entities.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("intake key '{0}' does not name a repository")]
    MissingRepository(String),
    #[error("missing {0}")]
    MissingField(&'static str),
}

/// Pull request fields with identities still unresolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequestDraft {
    pub repository_full_name: String,
    pub number: i32,
    pub author_external_id: Option<String>,
    pub merged_by_external_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub state: MergeRequestState,
    pub is_draft: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub source_branch: Option<String>,
    pub target_branch: Option<String>,
}

/// Who wrote a commit, as far as the payload says.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitAuthor {
    /// Linked GitHub account id.
    Account(String),
    /// Git author name without a linked account.
    Named(String),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitDraft {
    pub repository_full_name: String,
    pub sha: String,
    pub author: CommitAuthor,
    pub message: String,
    pub committed_at: DateTime<Utc>,
    pub is_merge_commit: bool,
}

/// One normalized entity extracted from a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityDraft {
    /// `owner_id` of the upsert is unset; the owner is resolved by account id.
    Repository {
        upsert: RepositoryUpsert,
        owner_external_id: Option<String>,
    },
    Contributor(ContributorUpsert),
    Placeholder { name: String },
    MergeRequest(MergeRequestDraft),
    Commit(CommitDraft),
}

impl EntityDraft {
    /// Identity used for deduplication within a batch.
    pub fn key(&self) -> String {
        match self {
            EntityDraft::Repository { upsert, .. } => format!("repository:{}", upsert.external_id),
            EntityDraft::Contributor(account) => format!("contributor:{}", account.external_id),
            EntityDraft::Placeholder { name } => format!("placeholder:{}", name.to_lowercase()),
            EntityDraft::MergeRequest(mr) => {
                format!("merge_request:{}#{}", mr.repository_full_name, mr.number)
            }
            EntityDraft::Commit(commit) => {
                format!("commit:{}@{}", commit.repository_full_name, commit.sha)
            }
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            EntityDraft::Repository { upsert, .. } => Some(upsert.updated_at),
            EntityDraft::MergeRequest(mr) => Some(mr.updated_at),
            EntityDraft::Commit(commit) => Some(commit.committed_at),
            EntityDraft::Contributor(_) | EntityDraft::Placeholder { .. } => None,
        }
    }

    /// Persist order: identities first, then what references them.
    fn persist_rank(&self) -> u8 {
        match self {
            EntityDraft::Contributor(_) => 0,
            EntityDraft::Placeholder { .. } => 1,
            EntityDraft::Repository { .. } => 2,
            EntityDraft::MergeRequest(_) => 3,
            EntityDraft::Commit(_) => 4,
        }
    }
}

/// Keeps one draft per entity key: the newest by `updated_at`, the later
/// one on ties or when the kind carries no timestamp.
#[derive(Debug, Default)]
pub struct BatchDeduper {
    drafts: HashMap<String, (usize, EntityDraft)>,
    next_seq: usize,
}

impl BatchDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, draft: EntityDraft) {
        let key = draft.key();
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some((_, existing)) = self.drafts.get(&key) {
            if let (Some(kept), Some(incoming)) = (existing.updated_at(), draft.updated_at()) {
                if kept > incoming {
                    return;
                }
            }
        }
        self.drafts.insert(key, (seq, draft));
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    /// Drafts in persist order, arrival order within a kind.
    pub fn into_drafts(self) -> Vec<EntityDraft> {
        let mut drafts: Vec<(usize, EntityDraft)> = self.drafts.into_values().collect();
        drafts.sort_by_key(|(seq, draft)| (draft.persist_rank(), *seq));
        drafts.into_iter().map(|(_, draft)| draft).collect()
    }
}

fn parse<T: DeserializeOwned>(payload: &str) -> Result<T, ExtractError> {
    Ok(serde_json::from_str(payload)?)
}

fn account(user: &GhUser) -> ContributorUpsert {
    ContributorUpsert {
        external_id: user.id.to_string(),
        username: user.login.clone(),
        avatar: user.avatar_url.clone(),
        is_bot: user.is_bot(),
    }
}

/// Contributor draft for a person or bot; organizations are not contributors.
fn push_account(drafts: &mut Vec<EntityDraft>, user: Option<&GhUser>) -> Option<String> {
    let user = user?;
    if user.is_organization() {
        return None;
    }
    drafts.push(EntityDraft::Contributor(account(user)));
    Some(user.id.to_string())
}

fn repository_drafts(
    repo: GhRepository,
    observed_at: DateTime<Utc>,
    drafts: &mut Vec<EntityDraft>,
) {
    let owner_external_id = push_account(drafts, Some(&repo.owner));
    drafts.push(EntityDraft::Repository {
        upsert: RepositoryUpsert {
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
            owner_id: None,
            created_at: repo.created_at,
            updated_at: repo.updated_at,
            observed_at,
        },
        owner_external_id,
    });
}

fn merge_request_drafts(full_name: &str, pr: GhPullRequest, drafts: &mut Vec<EntityDraft>) {
    let author_external_id = push_account(drafts, pr.user.as_ref());
    let merged_by_external_id = push_account(drafts, pr.merged_by.as_ref());
    drafts.push(EntityDraft::MergeRequest(MergeRequestDraft {
        repository_full_name: full_name.to_string(),
        number: pr.number,
        author_external_id,
        merged_by_external_id,
        state: MergeRequestState::from_api(&pr.state, pr.merged_at.as_ref()),
        title: pr.title,
        description: pr.body,
        is_draft: pr.draft,
        created_at: pr.created_at,
        updated_at: pr.updated_at,
        closed_at: pr.closed_at,
        merged_at: pr.merged_at,
        labels: pr.labels.into_iter().map(|l| l.name).collect(),
        source_branch: pr.head.map(|h| h.name),
        target_branch: pr.base.map(|b| b.name),
    }));
}

fn commit_drafts(
    full_name: &str,
    commit: GhCommit,
    drafts: &mut Vec<EntityDraft>,
) -> Result<(), ExtractError> {
    let committed_at = commit
        .committed_at()
        .ok_or(ExtractError::MissingField("commit date"))?;

    let author = match push_account(drafts, commit.author.as_ref()) {
        Some(external_id) => CommitAuthor::Account(external_id),
        None => match commit.author_name() {
            Some(name) => {
                drafts.push(EntityDraft::Placeholder {
                    name: name.to_string(),
                });
                CommitAuthor::Named(name.to_string())
            }
            None => CommitAuthor::Unknown,
        },
    };

    drafts.push(EntityDraft::Commit(CommitDraft {
        repository_full_name: full_name.to_string(),
        is_merge_commit: commit.is_merge(),
        sha: commit.sha,
        author,
        message: commit.commit.message,
        committed_at,
    }));
    Ok(())
}

fn full_name_of(record: &RawRecord) -> Result<&str, ExtractError> {
    record
        .repository_full_name()
        .ok_or_else(|| ExtractError::MissingRepository(record.external_id.clone()))
}

/// Turn one raw record into entity drafts.
///
/// Kinds only consumed by enrichment (reviews, organizations) yield nothing.
pub fn extract(record: &RawRecord) -> Result<Vec<EntityDraft>, ExtractError> {
    let mut drafts = Vec::new();

    match record.kind {
        RawEntityKind::Repository => {
            repository_drafts(parse(&record.payload)?, record.fetched_at, &mut drafts);
        }
        RawEntityKind::Contributor => {
            let user: GhUser = parse(&record.payload)?;
            push_account(&mut drafts, Some(&user));
        }
        RawEntityKind::ContributorPage => {
            let users: Vec<GhUser> = parse(&record.payload)?;
            for user in &users {
                push_account(&mut drafts, Some(user));
            }
        }
        RawEntityKind::MergeRequest => {
            let full_name = full_name_of(record)?;
            merge_request_drafts(full_name, parse(&record.payload)?, &mut drafts);
        }
        RawEntityKind::MergeRequestPage => {
            let full_name = full_name_of(record)?;
            let pulls: Vec<GhPullRequest> = parse(&record.payload)?;
            for pr in pulls {
                merge_request_drafts(full_name, pr, &mut drafts);
            }
        }
        RawEntityKind::Commit => {
            let full_name = full_name_of(record)?;
            commit_drafts(full_name, parse(&record.payload)?, &mut drafts)?;
        }
        RawEntityKind::CommitPage => {
            let full_name = full_name_of(record)?;
            let commits: Vec<GhCommit> = parse(&record.payload)?;
            for commit in commits {
                commit_drafts(full_name, commit, &mut drafts)?;
            }
        }
        RawEntityKind::MergeRequestReviews | RawEntityKind::Organizations => {}
    }

    Ok(drafts)
}

fn resolve_account(
    conn: &mut SqliteConnection,
    accounts: &HashMap<String, String>,
    external_id: Option<&str>,
) -> Result<Option<String>, DieselError> {
    let Some(external_id) = external_id else {
        return Ok(None);
    };
    if let Some(id) = accounts.get(external_id) {
        return Ok(Some(id.clone()));
    }
    id_by_external_in(conn, external_id)
}

/// Write drafts on the caller's connection. Returns entities written and
/// per-entity errors (references to repositories that are not stored).
fn persist_drafts(
    conn: &mut SqliteConnection,
    drafts: &[EntityDraft],
) -> Result<(usize, Vec<String>), DieselError> {
    let mut accounts: HashMap<String, String> = HashMap::new();
    let mut repositories: HashMap<String, Option<String>> = HashMap::new();
    let mut errors = Vec::new();
    let mut written = 0;

    for draft in drafts {
        match draft {
            EntityDraft::Contributor(account) => {
                let id = upsert_account_in(conn, account)?;
                accounts.insert(account.external_id.clone(), id);
            }
            EntityDraft::Placeholder { name } => {
                upsert_placeholder_in(conn, name)?;
            }
            EntityDraft::Repository {
                upsert,
                owner_external_id,
            } => {
                let mut upsert = upsert.clone();
                upsert.owner_id = resolve_account(conn, &accounts, owner_external_id.as_deref())?;
                diesel_repo::upsert_in(conn, &upsert)?;
            }
            EntityDraft::MergeRequest(mr) => {
                let repository_id = match repositories.get(&mr.repository_full_name) {
                    Some(id) => id.clone(),
                    None => {
                        let id = id_by_full_name_in(conn, &mr.repository_full_name)?;
                        repositories.insert(mr.repository_full_name.clone(), id.clone());
                        id
                    }
                };
                let Some(repository_id) = repository_id else {
                    errors.push(format!(
                        "pull request {}#{}: repository not synced",
                        mr.repository_full_name, mr.number
                    ));
                    continue;
                };
                let upsert = MergeRequestUpsert {
                    repository_id,
                    number: mr.number,
                    author_id: resolve_account(conn, &accounts, mr.author_external_id.as_deref())?,
                    title: mr.title.clone(),
                    description: mr.description.clone(),
                    state: mr.state,
                    is_draft: mr.is_draft,
                    created_at: mr.created_at,
                    updated_at: mr.updated_at,
                    closed_at: mr.closed_at,
                    merged_at: mr.merged_at,
                    merged_by_id: resolve_account(
                        conn,
                        &accounts,
                        mr.merged_by_external_id.as_deref(),
                    )?,
                    labels: mr.labels.clone(),
                    source_branch: mr.source_branch.clone(),
                    target_branch: mr.target_branch.clone(),
                };
                diesel_merge_request::upsert_in(conn, &upsert)?;
            }
            EntityDraft::Commit(commit) => {
                let repository_id = match repositories.get(&commit.repository_full_name) {
                    Some(id) => id.clone(),
                    None => {
                        let id = id_by_full_name_in(conn, &commit.repository_full_name)?;
                        repositories.insert(commit.repository_full_name.clone(), id.clone());
                        id
                    }
                };
                let Some(repository_id) = repository_id else {
                    errors.push(format!(
                        "commit {}@{}: repository not synced",
                        commit.repository_full_name, commit.sha
                    ));
                    continue;
                };
                let contributor_id = match &commit.author {
                    CommitAuthor::Account(external_id) => {
                        resolve_account(conn, &accounts, Some(external_id))?
                    }
                    CommitAuthor::Named(name) => Some(upsert_placeholder_in(conn, name)?),
                    CommitAuthor::Unknown => None,
                };
                upsert_summary_in(
                    conn,
                    &CommitUpsert {
                        repository_id,
                        sha: commit.sha.clone(),
                        contributor_id,
                        message: commit.message.clone(),
                        committed_at: commit.committed_at,
                        is_merge_commit: commit.is_merge_commit,
                    },
                )?;
            }
        }
        written += 1;
    }

    Ok((written, errors))
}

/// Drains the raw intake into entity tables.
#[derive(Clone)]
pub struct ExtractionService {
    pool: SqlitePool,
    raw: DieselRawRecordRepository,
    batch_size: usize,
}

impl ExtractionService {
    pub fn new(pool: SqlitePool, batch_size: usize) -> Self {
        Self {
            raw: DieselRawRecordRepository::new(pool.clone()),
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Extract every unprocessed record, kind by kind in dependency order.
    pub async fn run_pending(&self, cancel: &CancelFlag) -> Result<JobReport, PipelineError> {
        let mut report = JobReport::default();

        for kind in EXTRACTION_ORDER {
            let mut cursor = 0;
            loop {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    return Ok(report);
                }
                let records = self.raw.pending(kind, cursor, self.batch_size as i64).await?;
                let Some(last) = records.last() else {
                    break;
                };
                cursor = last.id;
                report.merge(self.run_batch(records).await?);
            }
        }

        if report.items_processed > 0 || !report.errors.is_empty() {
            info!(
                "Extracted {} entities ({} errors)",
                report.items_processed,
                report.errors.total()
            );
        }
        Ok(report)
    }

    /// Extract and persist one batch of raw records atomically.
    ///
    /// Only the newest record per intake key is applied; older ones in the
    /// batch or in the table are marked processed as superseded. Records that
    /// fail to parse are marked processed and reported.
    pub async fn run_batch(&self, records: Vec<RawRecord>) -> Result<JobReport, PipelineError> {
        let mut report = JobReport::default();
        let mut newest: HashMap<(RawEntityKind, String), i32> = HashMap::new();
        for record in &records {
            let entry = newest
                .entry((record.kind, record.external_id.clone()))
                .or_insert(record.id);
            *entry = (*entry).max(record.id);
        }

        let mut deduper = BatchDeduper::new();
        for record in &records {
            if newest.get(&(record.kind, record.external_id.clone())) != Some(&record.id) {
                debug!("Raw record {} superseded within batch", record.id);
                continue;
            }
            match extract(record) {
                Ok(drafts) => drafts.into_iter().for_each(|d| deduper.add(d)),
                Err(err) => {
                    warn!(
                        "Skipping raw record {} ({} {}): {}",
                        record.id,
                        record.kind.as_str(),
                        record.external_id,
                        err
                    );
                    report.errors.push(format!(
                        "{} {}: {}",
                        record.kind.as_str(),
                        record.external_id,
                        err
                    ));
                }
            }
        }

        let drafts = deduper.into_drafts();
        let ids: Vec<i32> = records.iter().map(|r| r.id).collect();
        let newest: Vec<((RawEntityKind, String), i32)> = newest.into_iter().collect();
        let pool = self.pool.clone();

        let (written, errors) = run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                for ((kind, external_id), id) in &newest {
                    supersede_older_in(conn, *kind, external_id, *id)?;
                }
                let result = persist_drafts(conn, &drafts)?;
                mark_processed_in(conn, &ids)?;
                Ok(result)
            })
        })
        .await?;

        report.items_processed += written;
        for error in errors {
            report.errors.push(error);
        }
        Ok(report)
    }
}
