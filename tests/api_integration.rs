// REST and SSE integration tests: a real axum server on an ephemeral port,
// exercised with reqwest.

mod common;

use common::{control_plane, spawn_api, tick};
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

async fn setup() -> (common::ControlPlane, String, tokio::task::JoinHandle<()>) {
    let plane = control_plane().await;
    let (base, handle) = spawn_api(&plane).await;
    (plane, base, handle)
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn health_and_metrics() {
    let (_plane, base, _handle) = setup().await;
    let client = client();

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let metrics = client.get(format!("{base}/metrics")).send().await.unwrap();
    assert_eq!(metrics.status(), 200);
}

#[tokio::test]
async fn resource_type_crud() {
    let (_plane, base, _handle) = setup().await;
    let client = client();

    let created = client
        .post(format!("{base}/api/v1/resource-types"))
        .json(&json!({
            "name": "database",
            "version": "v1",
            "schema": {"type": "object", "properties": {"size": {"type": "string"}}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: Value = created.json().await.unwrap();
    let id = created["id"].as_i64().unwrap();

    let by_id = client
        .get(format!("{base}/api/v1/resource-types/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(by_id.status(), 200);

    let by_key: Value = client
        .get(format!("{base}/api/v1/resource-types/database/v1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(by_key["name"], "database");
    assert_eq!(by_key["status"], "active");

    let listed: Vec<Value> = client
        .get(format!("{base}/api/v1/resource-types?name=database"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let deleted = client
        .delete(format!("{base}/api/v1/resource-types/database/v1"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    let missing = client
        .get(format!("{base}/api/v1/resource-types/database/v1"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn resource_lifecycle_over_http() {
    let (plane, base, _handle) = setup().await;
    let client = client();

    // CREATE
    let created = client
        .post(format!("{base}/api/v1/resources"))
        .json(&json!({
            "name": "api-1",
            "resource_type_name": "web-service",
            "resource_type_version": "v1",
            "spec": {"a": 1}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: Value = created.json().await.unwrap();
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["status"], "pending");
    assert_eq!(created["generation"], 1);

    // Duplicate name conflicts
    let duplicate = client
        .post(format!("{base}/api/v1/resources"))
        .json(&json!({
            "name": "api-1",
            "resource_type_name": "web-service",
            "resource_type_version": "v1",
            "spec": {"a": 1}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    // Invalid spec rejected with details
    let invalid = client
        .post(format!("{base}/api/v1/resources"))
        .json(&json!({
            "name": "api-2",
            "resource_type_name": "web-service",
            "resource_type_version": "v1",
            "spec": {"a": "one"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);
    let invalid: Value = invalid.json().await.unwrap();
    assert!(invalid["detail"].as_str().unwrap().contains("/a"));

    // GET by id and by key
    let fetched: Value = client
        .get(format!("{base}/api/v1/resources/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["name"], "api-1");
    let by_name = client
        .get(format!("{base}/api/v1/resources/by-name/web-service/v1/api-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(by_name.status(), 200);

    // Reconcile through the scheduler, then read outputs and history
    tick(&plane).await;
    let outputs: Value = client
        .get(format!("{base}/api/v1/resources/{id}/outputs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outputs["endpoint"], "10.0.0.1:80");

    let history: Vec<Value> = client
        .get(format!("{base}/api/v1/resources/{id}/history"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["success"], true);

    // PUT replaces the spec and bumps the generation
    let updated: Value = client
        .put(format!("{base}/api/v1/resources/{id}"))
        .json(&json!({"spec": {"a": 2}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["generation"], 2);
    assert_eq!(updated["status"], "pending");

    // Manual trigger is accepted
    let triggered = client
        .post(format!("{base}/api/v1/resources/{id}/reconcile"))
        .send()
        .await
        .unwrap();
    assert_eq!(triggered.status(), 200);

    // Finalizer patch
    let patched: Value = client
        .put(format!("{base}/api/v1/resources/{id}/finalizers"))
        .json(&json!({"add": ["ext"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(patched["finalizers"], json!(["web", "ext"]));

    // DELETE is soft
    let deleted: Value = client
        .delete(format!("{base}/api/v1/resources/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["status"], "deleting");

    // Live GET now 404s, though the row still exists on the deletion path
    let gone = client
        .get(format!("{base}/api/v1/resources/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn unknown_resource_is_404() {
    let (_plane, base, _handle) = setup().await;
    let response = client()
        .get(format!("{base}/api/v1/resources/9999"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("9999"));
}

#[tokio::test]
async fn webhook_crud_over_http() {
    let (_plane, base, _handle) = setup().await;
    let client = client();

    let created = client
        .post(format!("{base}/api/v1/admission-webhooks"))
        .json(&json!({
            "name": "defaults",
            "webhook_url": "http://localhost:9000/admit",
            "webhook_type": "mutating",
            "operations": ["CREATE", "UPDATE"],
            "ordering": 10
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let created: Value = created.json().await.unwrap();
    let id = created["id"].as_i64().unwrap();
    // Defaults fill in
    assert_eq!(created["timeout_seconds"], 10);
    assert_eq!(created["failure_policy"], "Fail");

    let listed: Vec<Value> = client
        .get(format!("{base}/api/v1/admission-webhooks"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let updated = client
        .put(format!("{base}/api/v1/admission-webhooks/{id}"))
        .json(&json!({
            "name": "defaults",
            "webhook_url": "http://localhost:9000/admit",
            "webhook_type": "mutating",
            "operations": ["CREATE"],
            "ordering": 5,
            "failure_policy": "Ignore"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(updated.status(), 200);
    let updated: Value = updated.json().await.unwrap();
    assert_eq!(updated["ordering"], 5);
    assert_eq!(updated["failure_policy"], "Ignore");

    let deleted = client
        .delete(format!("{base}/api/v1/admission-webhooks/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
}

#[tokio::test]
async fn sse_stream_delivers_created_event() {
    let (plane, base, _handle) = setup().await;
    let client = client();

    let response = client
        .get(format!("{base}/api/v1/events"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let mut body = response.bytes_stream();

    // Give the subscription a beat to attach, then write
    tokio::time::sleep(Duration::from_millis(50)).await;
    plane
        .gateway
        .create_resource(converge::gateway::CreateResourceRequest {
            name: "sse-1".to_string(),
            resource_type_name: "web-service".to_string(),
            resource_type_version: "v1".to_string(),
            spec: json!({"a": 1}),
        })
        .await
        .unwrap();

    let mut collected = String::new();
    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = body.next().await {
            collected.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if collected.contains("\n\n") {
                break;
            }
        }
        collected.clone()
    })
    .await
    .unwrap();

    assert!(frame.contains("event: CREATED"), "frame was: {frame}");
    assert!(frame.contains("\"resource_name\":\"sse-1\""), "frame was: {frame}");
}

#[tokio::test]
async fn sse_resource_stream_is_filtered() {
    let (plane, base, _handle) = setup().await;
    let client = client();

    let first = plane
        .gateway
        .create_resource(converge::gateway::CreateResourceRequest {
            name: "filter-1".to_string(),
            resource_type_name: "web-service".to_string(),
            resource_type_version: "v1".to_string(),
            spec: json!({"a": 1}),
        })
        .await
        .unwrap();

    let response = client
        .get(format!("{base}/api/v1/resources/{}/events", first.id))
        .send()
        .await
        .unwrap();
    let mut body = response.bytes_stream();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // An unrelated resource must not appear on this stream
    plane
        .gateway
        .create_resource(converge::gateway::CreateResourceRequest {
            name: "filter-2".to_string(),
            resource_type_name: "web-service".to_string(),
            resource_type_version: "v1".to_string(),
            spec: json!({"a": 1}),
        })
        .await
        .unwrap();
    plane
        .gateway
        .replace_spec(first.id, json!({"a": 2}))
        .await
        .unwrap();

    let mut collected = String::new();
    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(chunk) = body.next().await {
            collected.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if collected.contains("\n\n") {
                break;
            }
        }
        collected.clone()
    })
    .await
    .unwrap();

    assert!(frame.contains("event: MODIFIED"), "frame was: {frame}");
    assert!(frame.contains("\"resource_name\":\"filter-1\""), "frame was: {frame}");
}
