//! Shared fixtures for the integration tests: a scripted GitHub API and
//! payload builders for one small repository.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use gitpulse::config::Settings;
use gitpulse::github::{FetchError, FetchOutcome, FetchedPayload, GitHubApi};
use gitpulse::pipeline::AppContext;
use gitpulse::repository::{open_database, SqlitePool};

pub const REPO: &str = "octo/hello";
pub const REPO_ENDPOINT: &str = "/repos/octo/hello";
pub const PULLS_ENDPOINT: &str =
    "/repos/octo/hello/pulls?state=all&sort=updated&direction=desc&per_page=100&page=1";
pub const COMMITS_ENDPOINT: &str = "/repos/octo/hello/commits?per_page=100&page=1";
pub const CONTRIBUTORS_ENDPOINT: &str = "/repos/octo/hello/contributors?per_page=100&page=1";

enum Scripted {
    Body { body: String, etag: Option<String> },
    RateLimited,
}

/// Answers from a script. Unscripted endpoints are 404s; a matching ETag is
/// a 304. A paused API holds every request until [`ScriptedApi::resume`].
pub struct ScriptedApi {
    responses: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<String>>,
    gate: Semaphore,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
        })
    }

    pub fn paused() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        })
    }

    pub fn resume(&self) {
        self.gate.add_permits(1_000_000);
    }

    pub fn respond(&self, endpoint: &str, body: Value, etag: Option<&str>) {
        self.responses.lock().unwrap().insert(
            endpoint.to_string(),
            Scripted::Body {
                body: body.to_string(),
                etag: etag.map(str::to_string),
            },
        );
    }

    pub fn rate_limit(&self, endpoint: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), Scripted::RateLimited);
    }

    pub fn calls_to(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == endpoint)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl GitHubApi for ScriptedApi {
    async fn fetch(&self, endpoint: &str, etag: Option<&str>) -> Result<FetchOutcome, FetchError> {
        let _permit = self.gate.acquire().await.unwrap();
        self.calls.lock().unwrap().push(endpoint.to_string());

        let responses = self.responses.lock().unwrap();
        match responses.get(endpoint) {
            Some(Scripted::Body { body, etag: current }) => {
                if etag.is_some() && etag == current.as_deref() {
                    return Ok(FetchOutcome::NotModified);
                }
                Ok(FetchOutcome::Fetched(FetchedPayload {
                    payload: body.clone(),
                    etag: current.clone(),
                    rate_limit_remaining: Some(4000),
                    has_next_page: false,
                }))
            }
            Some(Scripted::RateLimited) => Err(FetchError::RateLimitExceeded {
                endpoint: endpoint.to_string(),
            }),
            None => Err(FetchError::FetchFailed {
                status: 404,
                body: "{\"message\": \"Not Found\"}".to_string(),
            }),
        }
    }
}

/// Fresh database in a temporary directory.
pub async fn setup() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_database(&dir.path().join("gitpulse.db")).await.unwrap();
    (dir, pool)
}

/// Context tracking [`REPO`] with the given API.
pub fn context(dir: &TempDir, pool: SqlitePool, api: Arc<ScriptedApi>) -> AppContext {
    let mut settings = Settings::with_data_dir(dir.path().to_path_buf());
    settings.tracked_repositories = vec![REPO.to_string()];
    settings.request_concurrency = 2;
    AppContext::new(settings, pool, Some(api))
}

pub fn user(id: i64, login: &str) -> Value {
    json!({"id": id, "login": login, "type": "User", "avatar_url": format!("https://avatars.example/{}", login)})
}

pub fn repository(stars: i32) -> Value {
    json!({
        "id": 500,
        "name": "hello",
        "full_name": REPO,
        "description": "Hello world",
        "html_url": "https://github.com/octo/hello",
        "stargazers_count": stars,
        "forks_count": 3,
        "size": 210,
        "subscribers_count": 5,
        "language": "Rust",
        "license": {"spdx_id": "MIT", "name": "MIT License"},
        "owner": user(1, "octo"),
        "created_at": "2022-05-01T00:00:00Z",
        "updated_at": "2024-05-01T00:00:00Z"
    })
}

pub fn pull(number: i32, title: &str, author: Value, updated_at: &str) -> Value {
    json!({
        "number": number,
        "title": title,
        "body": null,
        "state": "open",
        "draft": false,
        "user": author,
        "created_at": "2024-04-01T00:00:00Z",
        "updated_at": updated_at,
        "labels": [{"name": "enhancement"}],
        "head": {"ref": "feature"},
        "base": {"ref": "main"}
    })
}

pub fn merged_pull(number: i32, title: &str, author: Value, merged_by: Value) -> Value {
    json!({
        "number": number,
        "title": title,
        "state": "closed",
        "user": author,
        "created_at": "2024-04-02T00:00:00Z",
        "updated_at": "2024-04-05T00:00:00Z",
        "closed_at": "2024-04-05T00:00:00Z",
        "merged_at": "2024-04-05T00:00:00Z",
        "merged_by": merged_by,
        "merge_commit_sha": "c3"
    })
}

pub fn commit(sha: &str, author: Option<Value>, author_name: &str, date: &str) -> Value {
    json!({
        "sha": sha,
        "commit": {
            "message": format!("Commit {}", sha),
            "author": {"name": author_name, "email": "dev@example.com", "date": date}
        },
        "author": author,
        "parents": [{"sha": "parent"}]
    })
}

/// Script [`REPO`] with two pull requests, three commits (one by an author
/// without an account) and two listed contributors.
pub fn script_repository(api: &ScriptedApi) {
    api.respond(REPO_ENDPOINT, repository(42), Some("\"repo-v1\""));
    api.respond(
        PULLS_ENDPOINT,
        json!([
            pull(1, "Add greeting", user(101, "alice"), "2024-04-03T00:00:00Z"),
            merged_pull(2, "Fix typo", user(102, "bob"), user(101, "alice")),
        ]),
        Some("\"pulls-v1\""),
    );
    api.respond(
        COMMITS_ENDPOINT,
        json!([
            commit("c1", Some(user(101, "alice")), "Alice", "2024-04-01T10:00:00Z"),
            commit("c2", Some(user(101, "alice")), "Alice", "2024-04-02T10:00:00Z"),
            commit("c3", None, "Jane Doe", "2024-04-05T10:00:00Z"),
        ]),
        Some("\"commits-v1\""),
    );
    api.respond(
        CONTRIBUTORS_ENDPOINT,
        json!([user(101, "alice"), user(102, "bob")]),
        Some("\"contributors-v1\""),
    );
}
