//! HTTP routes over the simulated engine.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use llm_session::config::Config;
use llm_session::engine::simulated::SimulatedEngine;
use llm_session::server::{build_router, AppState};
use llm_session::session::SessionManager;

struct TestServer {
    app: Router,
    model: tempfile::NamedTempFile,
}

fn test_server() -> TestServer {
    let config = Arc::new(Config::default());
    let session = SessionManager::new(SimulatedEngine::new(), config.session.clone()).unwrap();
    let state = Arc::new(AppState::new(session, config).unwrap());
    TestServer {
        app: build_router(state),
        model: tempfile::Builder::new().suffix(".gguf").tempfile().unwrap(),
    }
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, req).await;
    (status, serde_json::from_str(&body).unwrap_or(Value::Null))
}

async fn load(server: &TestServer) {
    let (status, body) = send_json(
        &server.app,
        json_request("POST", "/v1/models/load", json!({ "path": server.model.path() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

// -- Health --

#[tokio::test]
async fn test_health_reports_loaded_model() {
    let server = test_server();
    let (status, body) = send_json(&server.app, empty_request("GET", "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["model"].is_null());

    load(&server).await;
    let (_, body) = send_json(&server.app, empty_request("GET", "/health")).await;
    assert_eq!(body["model"], server.model.path().display().to_string());
}

// -- Models --

#[tokio::test]
async fn test_load_missing_model_is_unprocessable() {
    let server = test_server();
    let (status, body) = send_json(
        &server.app,
        json_request("POST", "/v1/models/load", json!({ "path": "/nonexistent/model.gguf" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["type"], "model_load_error");
}

#[tokio::test]
async fn test_list_models_follows_load_and_unload() {
    let server = test_server();
    let (_, body) = send_json(&server.app, empty_request("GET", "/v1/models")).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 0);

    load(&server).await;
    let (_, body) = send_json(&server.app, empty_request("GET", "/v1/models")).await;
    assert_eq!(body["data"][0]["id"], server.model.path().display().to_string());

    let (status, _) = send(&server.app, empty_request("POST", "/v1/models/unload")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = send_json(&server.app, empty_request("GET", "/v1/models")).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 0);
}

// -- Completions --

#[tokio::test]
async fn test_completion_echoes_prompt() {
    let server = test_server();
    load(&server).await;

    let (status, body) = send_json(
        &server.app,
        json_request("POST", "/v1/completions", json!({ "prompt": "the quick brown fox" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["choices"][0]["text"], "the quick brown fox");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 4);
    assert_eq!(body["usage"]["completion_tokens"], 4);
}

#[tokio::test]
async fn test_completion_cut_by_max_tokens_reports_length() {
    let server = test_server();
    load(&server).await;

    let (status, body) = send_json(
        &server.app,
        json_request(
            "POST",
            "/v1/completions",
            json!({ "prompt": "one two three", "max_tokens": 4 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["choices"][0]["text"], "one");
    assert_eq!(body["choices"][0]["finish_reason"], "length");
    assert_eq!(body["usage"]["completion_tokens"], 1);

    let (_, body) = send_json(&server.app, empty_request("GET", "/v1/transcript")).await;
    assert_eq!(
        body["exchanges"][1]["reply"],
        "one[Max Tokens Limit Reached]"
    );
}

#[tokio::test]
async fn test_completion_without_model_is_empty() {
    let server = test_server();
    let (status, body) = send_json(
        &server.app,
        json_request("POST", "/v1/completions", json!({ "prompt": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["text"], "");
    assert_eq!(body["choices"][0]["finish_reason"], "not_loaded");
}

#[tokio::test]
async fn test_completion_rejects_empty_prompt() {
    let server = test_server();
    let (status, body) = send_json(
        &server.app,
        json_request("POST", "/v1/completions", json!({ "prompt": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_completion_prompt_longer_than_limit_is_bad_request() {
    let server = test_server();
    load(&server).await;

    let (status, body) = send_json(
        &server.app,
        json_request(
            "POST",
            "/v1/completions",
            json!({ "prompt": "one two three four five", "max_tokens": 2 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "prompt_encode_error");
}

#[tokio::test]
async fn test_streaming_completion_sends_chunks_then_done() {
    let server = test_server();
    load(&server).await;

    let (status, body) = send(
        &server.app,
        json_request(
            "POST",
            "/v1/completions",
            json!({ "prompt": "hello streaming world", "stream": true }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let data: Vec<&str> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .collect();
    assert_eq!(data.last(), Some(&"[DONE]"));

    let chunks: Vec<Value> = data[..data.len() - 1]
        .iter()
        .map(|d| serde_json::from_str(d).unwrap())
        .collect();
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["text"].as_str())
        .collect();
    assert_eq!(text, "hello streaming world");

    let last = chunks.last().unwrap();
    assert_eq!(last["choices"][0]["finish_reason"], "stop");
    assert_eq!(last["usage"]["completion_tokens"], 3);
}

#[tokio::test]
async fn test_cancel_without_active_generation() {
    let server = test_server();
    let (status, body) = send_json(&server.app, empty_request("POST", "/v1/completions/cancel")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], false);
}

// -- Benchmark --

#[tokio::test]
async fn test_bench_requires_model() {
    let server = test_server();
    let (status, body) = send_json(&server.app, json_request("POST", "/v1/bench", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "no_model_loaded");
}

#[tokio::test]
async fn test_bench_returns_report() {
    let server = test_server();
    load(&server).await;

    let (status, body) = send_json(
        &server.app,
        json_request("POST", "/v1/bench", json!({ "prompt_len": 32, "gen_len": 8, "repetitions": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["params"]["prompt_len"], 32);
    let report = body["report"].as_str().unwrap();
    assert!(report.contains("pp 32"));
    assert!(report.contains("tg 8"));
}

// -- Transcript --

#[tokio::test]
async fn test_transcript_records_exchanges() {
    let server = test_server();
    load(&server).await;
    send(
        &server.app,
        json_request("POST", "/v1/completions", json!({ "prompt": "hi there" })),
    )
    .await;

    let (_, body) = send_json(&server.app, empty_request("GET", "/v1/transcript")).await;
    let exchanges = body["exchanges"].as_array().unwrap();
    assert_eq!(exchanges.len(), 2);
    assert_eq!(exchanges[0]["user"], "[System]");
    assert!(exchanges[0]["reply"].as_str().unwrap().starts_with("Loaded "));
    assert_eq!(exchanges[1]["user"], "hi there");
    assert_eq!(exchanges[1]["reply"], "hi there[Output Completed]");
    assert!(body["text"]
        .as_str()
        .unwrap()
        .ends_with("User: hi there\nLLM: hi there[Output Completed]"));

    let (status, _) = send(&server.app, empty_request("DELETE", "/v1/transcript")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = send_json(&server.app, empty_request("GET", "/v1/transcript")).await;
    assert_eq!(body["exchanges"].as_array().unwrap().len(), 0);
}

// -- Metrics --

#[tokio::test]
async fn test_metrics_count_loads_and_generations() {
    let server = test_server();
    load(&server).await;
    send(
        &server.app,
        json_request("POST", "/v1/completions", json!({ "prompt": "a b" })),
    )
    .await;

    let (status, body) = send(&server.app, empty_request("GET", "/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains(r#"llm_session_model_loads_total{outcome="ok"} 1"#), "{body}");
    assert!(body.contains(r#"llm_session_generations_total{finish_reason="stop"} 1"#));
    assert!(body.contains("llm_session_tokens_generated_total 2"));
}
