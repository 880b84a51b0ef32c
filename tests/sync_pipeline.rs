//! End-to-end github_sync runs against a scripted GitHub API: intake,
//! conditional re-fetch and extraction into entity tables.

mod common;

use serde_json::json;

use common::*;
use gitpulse::models::{MergeRequestState, PipelineType, RawEntityKind, RunStatus};
use gitpulse::pipeline::{CancelFlag, ExtractionService, PipelineController};
use gitpulse::repository::{
    DieselCommitRepository, DieselContributorRepository, DieselMergeRequestRepository,
    DieselRawRecordRepository, DieselRepoRepository, SqlitePool,
};

async fn entity_counts(pool: &SqlitePool) -> (usize, usize, usize) {
    let repo = DieselRepoRepository::new(pool.clone())
        .find_by_full_name(REPO)
        .await
        .unwrap()
        .expect("repository extracted");
    let mrs = DieselMergeRequestRepository::new(pool.clone())
        .list_for_repository(&repo.id)
        .await
        .unwrap();
    let commits = DieselCommitRepository::new(pool.clone())
        .list_for_repository(&repo.id)
        .await
        .unwrap();
    let contributors = DieselContributorRepository::new(pool.clone())
        .get_all()
        .await
        .unwrap();
    (mrs.len(), commits.len(), contributors.len())
}

async fn snapshot_count(pool: &SqlitePool) -> usize {
    let repos = DieselRepoRepository::new(pool.clone());
    let repo = repos.find_by_full_name(REPO).await.unwrap().unwrap();
    repos.snapshots(&repo.id).await.unwrap().len()
}

// ============================================================================
// Extraction
// ============================================================================

#[tokio::test]
async fn sync_extracts_repository_and_listings() {
    let (dir, pool) = setup().await;
    let api = ScriptedApi::new();
    script_repository(&api);
    let controller = PipelineController::new(context(&dir, pool.clone(), api.clone()));

    let run = controller.run(PipelineType::GithubSync).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_processed, 1);
    assert_eq!(run.error_message, None);

    let repo = DieselRepoRepository::new(pool.clone())
        .find_by_full_name(REPO)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repo.stars, 42);
    assert!(repo.owner_id.is_some());

    // octo, alice, bob and a placeholder for "Jane Doe".
    assert_eq!(entity_counts(&pool).await, (2, 3, 4));

    let contributors = DieselContributorRepository::new(pool.clone());
    let alice = contributors.find_by_username("alice").await.unwrap().unwrap();
    let merged = DieselMergeRequestRepository::new(pool.clone())
        .get(&repo.id, 2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.state, MergeRequestState::Merged);
    assert_eq!(merged.merged_by_id.as_deref(), Some(alice.id.as_str()));

    let placeholders: Vec<_> = contributors
        .get_all()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.is_placeholder)
        .collect();
    assert_eq!(placeholders.len(), 1);
    assert_eq!(placeholders[0].username, None);
}

#[tokio::test]
async fn re_extraction_yields_no_duplicates() {
    let (dir, pool) = setup().await;
    let api = ScriptedApi::new();
    script_repository(&api);
    let controller = PipelineController::new(context(&dir, pool.clone(), api));
    controller.run(PipelineType::GithubSync).await.unwrap();
    let before = entity_counts(&pool).await;
    let snapshots_before = snapshot_count(&pool).await;
    assert_eq!(snapshots_before, 1);

    let raw = DieselRawRecordRepository::new(pool.clone());
    for (kind, key) in [
        (RawEntityKind::Repository, REPO.to_string()),
        (RawEntityKind::MergeRequestPage, format!("{}:pulls:1", REPO)),
        (RawEntityKind::CommitPage, format!("{}:commits:1", REPO)),
        (RawEntityKind::ContributorPage, format!("{}:contributors:1", REPO)),
    ] {
        let record = raw.latest_for_key(kind, &key).await.unwrap().unwrap();
        assert!(raw.requeue(record.id).await.unwrap());
    }
    assert_eq!(raw.count_pending().await.unwrap(), 4);

    let report = ExtractionService::new(pool.clone(), 50)
        .run_pending(&CancelFlag::new())
        .await
        .unwrap();
    assert!(report.errors.is_empty());
    assert_eq!(raw.count_pending().await.unwrap(), 0);
    assert_eq!(entity_counts(&pool).await, before);

    // Replaying the repository payload again still keeps one snapshot.
    let repo_record = raw
        .latest_for_key(RawEntityKind::Repository, REPO)
        .await
        .unwrap()
        .unwrap();
    assert!(raw.requeue(repo_record.id).await.unwrap());
    ExtractionService::new(pool.clone(), 50)
        .run_pending(&CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(snapshot_count(&pool).await, snapshots_before);
}

#[tokio::test]
async fn latest_merge_request_payload_wins() {
    let (dir, pool) = setup().await;
    let api = ScriptedApi::new();
    script_repository(&api);
    let controller = PipelineController::new(context(&dir, pool.clone(), api.clone()));

    let versions = [
        ("First draft", "2024-04-03T00:00:00Z"),
        ("Second draft", "2024-04-04T00:00:00Z"),
        ("Final title", "2024-04-06T00:00:00Z"),
    ];
    for (i, (title, updated_at)) in versions.iter().enumerate() {
        api.respond(
            PULLS_ENDPOINT,
            json!([pull(1, title, user(101, "alice"), updated_at)]),
            Some(&format!("\"pulls-{}\"", i)),
        );
        let run = controller.run(PipelineType::GithubSync).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    let raw = DieselRawRecordRepository::new(pool.clone());
    assert_eq!(
        raw.count_versions(RawEntityKind::MergeRequestPage, &format!("{}:pulls:1", REPO))
            .await
            .unwrap(),
        3
    );

    let repo = DieselRepoRepository::new(pool.clone())
        .find_by_full_name(REPO)
        .await
        .unwrap()
        .unwrap();
    let mrs = DieselMergeRequestRepository::new(pool.clone())
        .list_for_repository(&repo.id)
        .await
        .unwrap();
    assert_eq!(mrs.len(), 1);
    assert_eq!(mrs[0].title, "Final title");
    assert_eq!(mrs[0].updated_at.to_rfc3339(), "2024-04-06T00:00:00+00:00");
}

// ============================================================================
// Conditional requests
// ============================================================================

#[tokio::test]
async fn not_modified_keeps_versions_and_enrichment() {
    let (dir, pool) = setup().await;
    let api = ScriptedApi::new();
    script_repository(&api);
    let controller = PipelineController::new(context(&dir, pool.clone(), api.clone()));
    controller.run(PipelineType::GithubSync).await.unwrap();

    // Only the repository detail is answered; everything else 404s.
    let run = controller.run(PipelineType::DataEnrichment).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    let repos = DieselRepoRepository::new(pool.clone());
    assert!(repos.find_by_full_name(REPO).await.unwrap().unwrap().is_enriched);

    let calls_before = api.calls_to(REPO_ENDPOINT);
    let run = controller.run(PipelineType::GithubSync).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(api.calls_to(REPO_ENDPOINT), calls_before + 1);

    let raw = DieselRawRecordRepository::new(pool.clone());
    assert_eq!(raw.count_versions(RawEntityKind::Repository, REPO).await.unwrap(), 1);
    assert_eq!(
        raw.count_versions(RawEntityKind::CommitPage, &format!("{}:commits:1", REPO))
            .await
            .unwrap(),
        1
    );
    assert_eq!(raw.count_pending().await.unwrap(), 0);

    let repo = repos.find_by_full_name(REPO).await.unwrap().unwrap();
    assert!(repo.is_enriched);
    assert_eq!(repo.stars, 42);
}

#[tokio::test]
async fn invalid_tracked_name_is_reported_not_fatal() {
    let (dir, pool) = setup().await;
    let api = ScriptedApi::new();
    script_repository(&api);
    let mut ctx = context(&dir, pool.clone(), api);
    ctx.settings.tracked_repositories.push("not-a-repo".to_string());
    let controller = PipelineController::new(ctx);

    let run = controller.run(PipelineType::GithubSync).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_processed, 1);
    assert!(run.error_message.unwrap().contains("not-a-repo"));
}
