//! HTTP surface: authentication, triggers, agent RPC and admin routes.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use cinder_auth::{TokenKind, sign_token};
use cinder_core::build::{JobState, Status};
use cinder_core::ports::{JobStore, Stores};
use cinder_core::repo::RepoPolicy;
use cinder_tests::context::{ADMIN_SECRET, AGENT_SECRET};
use cinder_tests::*;
use pretty_assertions::assert_eq;
use cinder_store::MemoryStore;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn request(method: Method, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn hook_body(repo: &str, message: &str) -> Value {
    let mut hook = push_hook(repo, "main");
    hook.commit.message = message.to_string();
    serde_json::to_value(hook).unwrap()
}

#[tokio::test]
async fn test_health() {
    let ctx = TestContext::new();
    let response = ctx
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_hook_requires_valid_token() {
    let ctx = TestContext::new();
    ctx.register_repo("octocat/hello-world", SIMPLE).await;
    let other = ctx.register_repo("octocat/other", SIMPLE).await;
    let foreign = sign_token(&other, TokenKind::Hook).unwrap();

    for token in [None, Some("garbage"), Some(foreign.as_str())] {
        let response = ctx
            .router()
            .oneshot(request(
                Method::POST,
                "/hook",
                token,
                hook_body("octocat/hello-world", "update"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn test_hook_creates_build() {
    let ctx = TestContext::new();
    let repo = ctx.register_repo("octocat/hello-world", MATRIX).await;
    let token = sign_token(&repo, TokenKind::Hook).unwrap();

    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            "/hook",
            Some(&token),
            hook_body("octocat/hello-world", "update"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["status"], "created");
    assert_eq!(body["jobs"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_hook_skip_marker() {
    let ctx = TestContext::new();
    let repo = ctx.register_repo("octocat/hello-world", SIMPLE).await;
    let token = sign_token(&repo, TokenKind::Hook).unwrap();

    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            "/hook",
            Some(&token),
            hook_body("octocat/hello-world", "docs only [ci skip]"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "skipped");
    assert!(ctx.queue.info().pending.is_empty());
}

#[tokio::test]
async fn test_hook_with_invalid_pipeline_is_bad_request() {
    let ctx = TestContext::new();
    let repo = ctx.register_repo("octocat/hello-world", "steps: [").await;
    let token = sign_token(&repo, TokenKind::Hook).unwrap();

    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            "/hook",
            Some(&token),
            hook_body("octocat/hello-world", "update"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn test_rpc_requires_agent_secret() {
    let ctx = TestContext::new();
    for token in [None, Some(ADMIN_SECRET)] {
        let response = ctx
            .router()
            .oneshot(request(Method::POST, "/rpc/next", token, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}

#[tokio::test]
async fn test_next_times_out_with_no_content() {
    let ctx = TestContext::new();
    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            "/rpc/next",
            Some(AGENT_SECRET),
            json!({"labels": {"platform": "linux/amd64"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_agent_round_trip() {
    let ctx = TestContext::new();
    let repo = ctx.register_repo("octocat/hello-world", SIMPLE).await;
    let build = ctx
        .triggers
        .trigger(&repo, push_hook("octocat/hello-world", "main"))
        .await
        .unwrap()
        .build()
        .cloned()
        .unwrap();

    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            "/rpc/next",
            Some(AGENT_SECRET),
            json!({"labels": {"platform": "linux/amd64"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let pipeline = body_json(response).await;
    let id = pipeline["id"].as_str().unwrap().to_string();
    assert_eq!(pipeline["timeout"], 60);

    let init = ctx
        .router()
        .oneshot(request(
            Method::POST,
            &format!("/rpc/jobs/{}/init", id),
            Some(AGENT_SECRET),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(init.status(), StatusCode::NO_CONTENT);

    let log = ctx
        .router()
        .oneshot(request(
            Method::POST,
            &format!("/rpc/jobs/{}/log", id),
            Some(AGENT_SECRET),
            json!({"proc": "build", "pos": 0, "time": 0, "out": "ok"}),
        ))
        .await
        .unwrap();
    assert_eq!(log.status(), StatusCode::NO_CONTENT);

    let done = ctx
        .router()
        .oneshot(request(
            Method::POST,
            &format!("/rpc/jobs/{}/done", id),
            Some(AGENT_SECRET),
            json!({"exited": true, "exit_code": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(done.status(), StatusCode::NO_CONTENT);

    let response = ctx
        .router()
        .oneshot(
            Request::get(format!("/api/repos/octocat/hello-world/builds/{}", build.number))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = body_json(response).await;
    assert_eq!(detail["status"], Status::Success.as_str());
    assert_eq!(detail["jobs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_extend_unknown_job_is_not_found() {
    let ctx = TestContext::new();
    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            &format!("/rpc/jobs/{}/extend", uuid::Uuid::new_v4()),
            Some(AGENT_SECRET),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            "/rpc/jobs/not-a-job/extend",
            Some(AGENT_SECRET),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_registers_repo() {
    let ctx = TestContext::new();
    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            "/api/repos",
            None,
            json!({"owner": "octocat", "name": "spoon-knife"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            "/api/repos",
            Some(ADMIN_SECRET),
            json!({"owner": "octocat", "name": "spoon-knife", "private": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["repo"]["full_name"], "octocat/spoon-knife");
    let hook_token = body["hook_token"].as_str().unwrap().to_string();
    assert!(body["pull_token"].is_string());

    // The issued hook token triggers builds.
    ctx.remote.set_config("octocat/spoon-knife", SIMPLE, None);
    let response = ctx
        .router()
        .oneshot(request(
            Method::POST,
            "/hook",
            Some(&hook_token),
            hook_body("octocat/spoon-knife", "first"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Private builds need a token to read.
    let response = ctx
        .router()
        .oneshot(
            Request::get("/api/repos/octocat/spoon-knife/builds")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_repo_looks_like_private_repo() {
    let ctx = TestContext::new();
    ctx.register_repo_with("octocat/secret", SIMPLE, true, RepoPolicy::default())
        .await;
    let other = ctx.register_repo("octocat/public", SIMPLE).await;
    let foreign = sign_token(&other, TokenKind::Pull).unwrap();

    for token in [None, Some(foreign.as_str())] {
        for uri in [
            "/api/repos/octocat/secret/builds",
            "/api/repos/octocat/nope/builds",
            "/api/repos/octocat/nope/builds/1",
        ] {
            let response = ctx
                .router()
                .oneshot(request(Method::GET, uri, token, json!({})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    let response = ctx
        .router()
        .oneshot(request(
            Method::DELETE,
            "/api/repos/octocat/nope/builds/1",
            None,
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Admins still learn that it does not exist.
    let response = ctx
        .router()
        .oneshot(request(
            Method::GET,
            "/api/repos/octocat/nope/builds",
            Some(ADMIN_SECRET),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_build_detail_shows_unwritten_job_state() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyJobStore::new(memory.clone(), 0));
    let stores = Stores {
        jobs: flaky.clone(),
        ..Stores::from_shared(memory.clone())
    };
    let ctx = TestContext::with_stores(memory, stores);
    let repo = ctx.register_repo("octocat/hello-world", SIMPLE).await;
    ctx.triggers
        .trigger(&repo, push_hook("octocat/hello-world", "main"))
        .await
        .unwrap();
    let pipeline = lease(&ctx.gateway, &linux()).await;
    ctx.gateway.init(pipeline.id, JobState::default(), None).await.unwrap();

    flaky.fail_next(1);
    ctx.gateway.done(pipeline.id, exited(0)).await.unwrap();
    let stored = JobStore::get(&*ctx.memory, pipeline.id).await.unwrap().unwrap();
    assert_eq!(stored.status, Status::Running);

    let response = ctx
        .router()
        .oneshot(
            Request::get("/api/repos/octocat/hello-world/builds/1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let detail = body_json(response).await;
    assert_eq!(detail["status"], Status::Success.as_str());
    assert_eq!(detail["jobs"][0]["status"], Status::Success.as_str());
}

#[tokio::test]
async fn test_cancel_over_http() {
    let ctx = TestContext::new();
    let repo = ctx.register_repo("octocat/hello-world", MATRIX).await;
    let token = sign_token(&repo, TokenKind::Hook).unwrap();
    ctx.triggers
        .trigger(&repo, push_hook("octocat/hello-world", "main"))
        .await
        .unwrap();

    let response = ctx
        .router()
        .oneshot(request(
            Method::DELETE,
            "/api/repos/octocat/hello-world/builds/1",
            Some(&token),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["cancelled"], true);
    assert_eq!(body["status"], "killed");

    let response = ctx
        .router()
        .oneshot(request(
            Method::DELETE,
            "/api/repos/octocat/hello-world/builds/9",
            Some(&token),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_info_is_admin_only() {
    let ctx = TestContext::new();
    let response = ctx
        .router()
        .oneshot(
            Request::get("/api/info/queue")
                .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_SECRET))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["pending"].as_array().unwrap().is_empty());
}
