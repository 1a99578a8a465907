// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Admission chain: ordered external HTTP callbacks on every write.
//!
//! Each write runs the matching webhooks in two tiers: mutating first, then
//! validating, each tier ordered by `ordering ASC, id ASC` and executed
//! strictly serially. A webhook gets exactly one attempt per request - the
//! chain never retries a webhook call.
//!
//! # Failure policy
//!
//! - `allowed = false` from any webhook aborts the write immediately.
//! - A transport failure (timeout, connection error, non-2xx) aborts with an
//!   admission denial iff the webhook's `failure_policy` is `Fail`;
//!   with `Ignore` the failure is logged and the chain continues.
//!
//! Mutating webhooks may return JSON Patch operations that are applied to
//! the working resource's spec before the next webhook runs; see
//! [`patch`] for the path convention. Patches from validating webhooks are
//! ignored.

pub mod patch;

pub use patch::apply_patches;

use std::sync::Arc;
use std::time::Duration;

use json_patch::PatchOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::metrics;
use crate::model::{AdmissionWebhook, FailurePolicy, Operation, WebhookType};
use crate::store::Store;

/// Wire request POSTed to each webhook.
#[derive(Debug, Serialize)]
pub struct AdmissionRequest<'a> {
    pub operation: Operation,
    pub resource: &'a Value,
    pub old_resource: Option<&'a Value>,
}

/// Wire response expected from each webhook.
#[derive(Debug, Deserialize)]
pub struct AdmissionResponse {
    pub allowed: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub patches: Vec<PatchOperation>,
}

/// Executes the admission chain against the registered webhooks.
pub struct AdmissionChain {
    store: Arc<dyn Store>,
    http: reqwest::Client,
}

impl AdmissionChain {
    /// Build a chain over the given store.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the HTTP client cannot be constructed.
    pub fn new(store: Arc<dyn Store>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(Error::store)?;
        Ok(Self { store, http })
    }

    /// Run the chain for one write.
    ///
    /// `resource` is the working resource document (it must carry a `spec`
    /// member); the possibly-mutated document is returned on success.
    ///
    /// # Errors
    ///
    /// `AdmissionDenied` per the failure-policy semantics above.
    pub async fn run(
        &self,
        operation: Operation,
        type_name: &str,
        type_version: &str,
        mut resource: Value,
        old_resource: Option<&Value>,
    ) -> Result<Value> {
        let mutating = self
            .store
            .list_webhooks_for(type_name, type_version, operation, WebhookType::Mutating)
            .await?;
        let validating = self
            .store
            .list_webhooks_for(type_name, type_version, operation, WebhookType::Validating)
            .await?;

        for webhook in &mutating {
            if let Some(response) = self.call(webhook, operation, &resource, old_resource).await? {
                if !response.allowed {
                    return Err(deny(webhook, response.message));
                }
                if !response.patches.is_empty() {
                    let spec = resource
                        .get_mut("spec")
                        .ok_or_else(|| Error::AdmissionDenied("invalid patch: resource has no spec".to_string()))?;
                    apply_patches(&webhook.name, spec, response.patches)?;
                    debug!(webhook = %webhook.name, "Applied mutating webhook patches");
                }
            }
        }

        for webhook in &validating {
            if let Some(response) = self.call(webhook, operation, &resource, old_resource).await? {
                if !response.allowed {
                    return Err(deny(webhook, response.message));
                }
                // Patches from validating webhooks are ignored
            }
        }

        Ok(resource)
    }

    /// Call one webhook; one attempt, per-webhook timeout.
    ///
    /// Returns `Ok(None)` when a transport failure was ignored by policy.
    async fn call(
        &self,
        webhook: &AdmissionWebhook,
        operation: Operation,
        resource: &Value,
        old_resource: Option<&Value>,
    ) -> Result<Option<AdmissionResponse>> {
        let request = AdmissionRequest {
            operation,
            resource,
            old_resource,
        };
        let timeout = Duration::from_secs(webhook.timeout_seconds.max(1) as u64);

        let outcome = self
            .http
            .post(&webhook.webhook_url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await;

        let cause = match outcome {
            Ok(response) if response.status().is_success() => {
                let parsed = response
                    .json::<AdmissionResponse>()
                    .await
                    .map_err(|e| format!("invalid response body: {e}"));
                match parsed {
                    Ok(body) => return Ok(Some(body)),
                    Err(cause) => cause,
                }
            }
            Ok(response) => format!("HTTP {}", response.status()),
            Err(e) => e.to_string(),
        };

        metrics::record_webhook_failure(&webhook.name, webhook.failure_policy.as_str());
        match webhook.failure_policy {
            FailurePolicy::Ignore => {
                warn!(
                    webhook = %webhook.name,
                    cause = %cause,
                    "Webhook call failed; failure_policy=Ignore, continuing"
                );
                Ok(None)
            }
            FailurePolicy::Fail => Err(Error::AdmissionDenied(format!(
                "webhook {} failed: {cause}",
                webhook.name
            ))),
        }
    }
}

fn deny(webhook: &AdmissionWebhook, message: Option<String>) -> Error {
    metrics::record_admission_denied(&webhook.name);
    Error::AdmissionDenied(
        message.unwrap_or_else(|| format!("denied by webhook {}", webhook.name)),
    )
}
