//! data_enrichment runs: profile enrichment, the attempt ceiling and rate
//! limit deferral.

mod common;

use serde_json::json;

use common::*;
use gitpulse::models::{PipelineType, RunStatus};
use gitpulse::pipeline::PipelineController;
use gitpulse::repository::diesel_contributor::ContributorUpsert;
use gitpulse::repository::{DieselContributorRepository, SqlitePool};

async fn add_account(pool: &SqlitePool, external_id: &str, login: &str) -> String {
    DieselContributorRepository::new(pool.clone())
        .upsert_account(ContributorUpsert {
            external_id: external_id.to_string(),
            username: login.to_string(),
            avatar: None,
            is_bot: false,
        })
        .await
        .unwrap()
}

// ============================================================================
// Profiles
// ============================================================================

#[tokio::test]
async fn contributor_profile_is_enriched() {
    let (dir, pool) = setup().await;
    let id = add_account(&pool, "101", "alice").await;

    let api = ScriptedApi::new();
    api.respond(
        "/users/alice",
        json!({
            "id": 101,
            "login": "alice",
            "type": "User",
            "name": "Alice Liddell",
            "bio": "Compilers",
            "company": "Wonderland",
            "location": "Oxford",
            "followers": 12,
            "public_repos": 7
        }),
        Some("\"alice-v1\""),
    );
    api.respond("/users/alice/orgs", json!([{"login": "rust-lang"}]), None);
    let controller = PipelineController::new(context(&dir, pool.clone(), api));

    let run = controller.run(PipelineType::DataEnrichment).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_processed, 1);
    assert_eq!(run.error_message, None);

    let alice = DieselContributorRepository::new(pool)
        .get(&id)
        .await
        .unwrap()
        .unwrap();
    assert!(alice.is_enriched);
    assert_eq!(alice.name.as_deref(), Some("Alice Liddell"));
    assert_eq!(alice.bio.as_deref(), Some("Compilers"));
    assert_eq!(alice.followers, 12);
    assert_eq!(alice.organizations, vec!["rust-lang".to_string()]);
    assert_eq!(controller.item_count(PipelineType::DataEnrichment).await.unwrap(), 0);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn failing_entity_stops_after_three_runs() {
    let (dir, pool) = setup().await;
    let id = add_account(&pool, "404", "ghost").await;
    let api = ScriptedApi::new();
    let controller = PipelineController::new(context(&dir, pool.clone(), api.clone()));
    let contributors = DieselContributorRepository::new(pool.clone());

    // One attempt per run, so a single bad run does not use up the budget.
    for attempt in 1..=3 {
        assert_eq!(controller.item_count(PipelineType::DataEnrichment).await.unwrap(), 1);
        let run = controller.run(PipelineType::DataEnrichment).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.items_processed, 0);
        assert!(run.error_message.unwrap().contains("user ghost"));
        assert_eq!(api.calls_to("/users/ghost"), attempt);

        let ghost = contributors.get(&id).await.unwrap().unwrap();
        assert_eq!(ghost.enrichment_attempts, attempt as i32);
    }

    let ghost = contributors.get(&id).await.unwrap().unwrap();
    assert!(!ghost.is_enriched);
    assert!(ghost.enrichment_error.is_some());
    assert_eq!(controller.item_count(PipelineType::DataEnrichment).await.unwrap(), 0);

    let run = controller.run(PipelineType::DataEnrichment).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_processed, 0);
    assert_eq!(api.calls_to("/users/ghost"), 3);
}

#[tokio::test]
async fn rate_limit_defers_to_next_run() {
    let (dir, pool) = setup().await;
    let id = add_account(&pool, "101", "alice").await;
    let api = ScriptedApi::new();
    api.rate_limit("/users/alice");
    let controller = PipelineController::new(context(&dir, pool.clone(), api.clone()));

    let run = controller.run(PipelineType::DataEnrichment).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run
        .error_message
        .unwrap()
        .contains("rate limit exceeded, 1 entities deferred"));
    assert_eq!(api.calls_to("/users/alice"), 1);

    let contributors = DieselContributorRepository::new(pool.clone());
    let alice = contributors.get(&id).await.unwrap().unwrap();
    assert_eq!(alice.enrichment_attempts, 0);

    api.respond("/users/alice", json!({"id": 101, "login": "alice"}), None);
    api.respond("/users/alice/orgs", json!([]), None);
    let run = controller.run(PipelineType::DataEnrichment).await.unwrap();
    assert_eq!(run.items_processed, 1);
    assert!(contributors.get(&id).await.unwrap().unwrap().is_enriched);
}

#[tokio::test]
async fn enrichment_without_token_is_a_failed_run() {
    let (dir, pool) = setup().await;
    let settings = gitpulse::Settings::with_data_dir(dir.path().to_path_buf());
    let controller =
        PipelineController::new(gitpulse::pipeline::AppContext::new(settings, pool, None));

    let run = controller.run(PipelineType::DataEnrichment).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("GITHUB_TOKEN"));

    let history = controller.history(None, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Failed);
    assert!(!controller
        .status(PipelineType::DataEnrichment)
        .await
        .unwrap()
        .is_running);
}
