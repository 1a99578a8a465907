// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! REST handlers over the write gateway and the store.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::errors::Error;
use crate::gateway::{CreateResourceRequest, FinalizerPatch};
use crate::model::{NewAdmissionWebhook, NewResourceType};

type ApiResult<T> = Result<T, ApiError>;

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// `GET /metrics`
pub async fn metrics_text() -> ApiResult<String> {
    crate::metrics::gather_metrics().map_err(|e| ApiError(Error::store(e)))
}

/// `POST /api/v1/resource-types`
pub async fn create_resource_type(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewResourceType>,
) -> ApiResult<impl IntoResponse> {
    let created = state.store.upsert_resource_type(body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Deserialize)]
pub struct ListTypesQuery {
    pub name: Option<String>,
}

/// `GET /api/v1/resource-types[?name=…]`
pub async fn list_resource_types(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTypesQuery>,
) -> ApiResult<impl IntoResponse> {
    let types = state.store.list_resource_types(query.name.as_deref()).await?;
    Ok(Json(types))
}

/// `GET /api/v1/resource-types/{id}`
pub async fn get_resource_type_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let resource_type = state
        .store
        .get_resource_type_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("resource type {id}")))?;
    Ok(Json(resource_type))
}

/// `GET /api/v1/resource-types/{name}/{version}`
pub async fn get_resource_type(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let resource_type = state
        .store
        .get_resource_type(&name, &version)
        .await?
        .ok_or_else(|| Error::NotFound(format!("resource type {name}/{version}")))?;
    Ok(Json(resource_type))
}

/// `DELETE /api/v1/resource-types/{name}/{version}`
pub async fn delete_resource_type(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.store.delete_resource_type(&name, &version).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /api/v1/resources`
pub async fn create_resource(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateResourceRequest>,
) -> ApiResult<impl IntoResponse> {
    let created = state.gateway.create_resource(body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Deserialize)]
pub struct ListResourcesQuery {
    pub resource_type: Option<String>,
    pub resource_type_version: Option<String>,
}

/// `GET /api/v1/resources[?resource_type=…]`
pub async fn list_resources(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListResourcesQuery>,
) -> ApiResult<impl IntoResponse> {
    let resources = state
        .store
        .list_resources(
            query.resource_type.as_deref(),
            query.resource_type_version.as_deref(),
        )
        .await?;
    Ok(Json(resources))
}

/// `GET /api/v1/resources/{id}`
pub async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let resource = state
        .store
        .get_resource(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
    Ok(Json(resource))
}

/// `GET /api/v1/resources/by-name/{type}/{version}/{name}`
pub async fn get_resource_by_name(
    State(state): State<Arc<AppState>>,
    Path((type_name, type_version, name)): Path<(String, String, String)>,
) -> ApiResult<impl IntoResponse> {
    let resource = state
        .store
        .get_resource_by_name(&type_name, &type_version, &name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("resource {type_name}/{type_version}/{name}")))?;
    Ok(Json(resource))
}

#[derive(Deserialize)]
pub struct ReplaceSpecBody {
    pub spec: Value,
}

/// `PUT /api/v1/resources/{id}` with body `{"spec": {...}}`
pub async fn replace_resource_spec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<ReplaceSpecBody>,
) -> ApiResult<impl IntoResponse> {
    let updated = state.gateway.replace_spec(id, body.spec).await?;
    Ok(Json(updated))
}

/// `DELETE /api/v1/resources/{id}` - soft delete only.
pub async fn delete_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state.gateway.delete_resource(id).await?;
    Ok(Json(deleted))
}

/// `POST /api/v1/resources/{id}/reconcile`
pub async fn trigger_reconcile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let resource = state.gateway.trigger_reconcile(id).await?;
    Ok(Json(resource))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_history_limit() -> i64 {
    50
}

/// `GET /api/v1/resources/{id}/history` - newest first.
pub async fn list_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    state
        .store
        .get_resource_any(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
    let history = state.store.list_history(id, query.limit, query.offset).await?;
    Ok(Json(history))
}

/// `GET /api/v1/resources/{id}/outputs`
pub async fn get_outputs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let resource = state
        .store
        .get_resource(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
    Ok(Json(resource.outputs.unwrap_or(Value::Null)))
}

/// `PUT /api/v1/resources/{id}/finalizers` with body `{add?, remove?}`.
pub async fn patch_finalizers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<FinalizerPatch>,
) -> ApiResult<impl IntoResponse> {
    let updated = state.gateway.patch_finalizers(id, body).await?;
    Ok(Json(updated))
}

/// `POST /api/v1/admission-webhooks`
pub async fn create_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewAdmissionWebhook>,
) -> ApiResult<impl IntoResponse> {
    let created = state.store.create_webhook(body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /api/v1/admission-webhooks`
pub async fn list_webhooks(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let webhooks = state.store.list_webhooks().await?;
    Ok(Json(webhooks))
}

/// `GET /api/v1/admission-webhooks/{id}`
pub async fn get_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let webhook = state
        .store
        .get_webhook(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("webhook {id}")))?;
    Ok(Json(webhook))
}

/// `PUT /api/v1/admission-webhooks/{id}`
pub async fn update_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<NewAdmissionWebhook>,
) -> ApiResult<impl IntoResponse> {
    let updated = state.store.update_webhook(id, body).await?;
    Ok(Json(updated))
}

/// `DELETE /api/v1/admission-webhooks/{id}`
pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.store.delete_webhook(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
