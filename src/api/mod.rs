// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! HTTP REST API and SSE streams.
//!
//! The API is a thin translation layer: handlers parse the request, call
//! the write gateway or the store, and map the core error taxonomy onto
//! status codes. No business logic lives here.
//!
//! # Status codes
//!
//! | Error | Code |
//! |---|---|
//! | `SchemaValidation`, `NoReconcilerForType` | 400 |
//! | `AdmissionDenied` | 403 |
//! | `NotFound` | 404 |
//! | `Conflict`, `FinalizersPresent` | 409 |
//! | everything else | 500 |

pub mod handlers;
pub mod sse;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;

use crate::errors::Error;
use crate::events::EventBus;
use crate::gateway::WriteGateway;
use crate::registry::ReconcilerRegistry;
use crate::store::Store;

/// Shared state behind every handler.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<WriteGateway>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<ReconcilerRegistry>,
}

/// Error wrapper translating [`Error`] into an HTTP response.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::SchemaValidation(_) | Error::NoReconcilerForType(_) => StatusCode::BAD_REQUEST,
            Error::AdmissionDenied(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::FinalizersPresent(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self.0 {
            Error::SchemaValidation(errors) => json!({
                "detail": self.0.to_string(),
                "errors": errors,
            }),
            other => json!({"detail": other.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the full router over the shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_text))
        .route(
            "/api/v1/resource-types",
            post(handlers::create_resource_type).get(handlers::list_resource_types),
        )
        .route(
            "/api/v1/resource-types/{id}",
            get(handlers::get_resource_type_by_id),
        )
        .route(
            "/api/v1/resource-types/{name}/{version}",
            get(handlers::get_resource_type).delete(handlers::delete_resource_type),
        )
        .route(
            "/api/v1/resources",
            post(handlers::create_resource).get(handlers::list_resources),
        )
        .route(
            "/api/v1/resources/{id}",
            get(handlers::get_resource)
                .put(handlers::replace_resource_spec)
                .delete(handlers::delete_resource),
        )
        .route(
            "/api/v1/resources/by-name/{type}/{version}/{name}",
            get(handlers::get_resource_by_name),
        )
        .route(
            "/api/v1/resources/{id}/reconcile",
            post(handlers::trigger_reconcile),
        )
        .route("/api/v1/resources/{id}/history", get(handlers::list_history))
        .route("/api/v1/resources/{id}/outputs", get(handlers::get_outputs))
        .route(
            "/api/v1/resources/{id}/finalizers",
            put(handlers::patch_finalizers),
        )
        .route("/api/v1/resources/{id}/events", get(sse::resource_events))
        .route(
            "/api/v1/admission-webhooks",
            post(handlers::create_webhook).get(handlers::list_webhooks),
        )
        .route(
            "/api/v1/admission-webhooks/{id}",
            get(handlers::get_webhook)
                .put(handlers::update_webhook)
                .delete(handlers::delete_webhook),
        )
        .route("/api/v1/events", get(sse::all_events))
        .with_state(state)
}

/// Serve the API on the given port until the server future is dropped.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = format!("{}:{port}", crate::constants::API_BIND_ADDRESS);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("API server listening on http://{bind_addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
