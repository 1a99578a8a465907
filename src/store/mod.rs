// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Durable store contract for resources, history, finalizers, and webhooks.
//!
//! The [`Store`] trait is the only persistence surface the control plane
//! touches. Two implementations exist:
//!
//! - [`memory::MemStore`] - in-process, used by tests and the `memory`
//!   backend; a single `RwLock` gives every mutation the same atomicity a
//!   database transaction gives.
//! - [`postgres::PgStore`] - production backend on a pooled PostgreSQL
//!   connection set; multi-invariant mutations run inside a single
//!   transaction and batch claiming uses `FOR UPDATE SKIP LOCKED`.
//!
//! # Contract notes
//!
//! - Every query filters out soft-deleted rows except the explicit
//!   deletion-path operations (`get_resource_any`, `claim_reconcile_batch`,
//!   finalizer edits, `hard_delete_resource`).
//! - `hard_delete_resource` succeeds iff the resource is soft-deleted and
//!   its finalizer set is empty, enforced atomically.
//! - Finalizer edits have set semantics and are no-ops when redundant, so
//!   they are always safe to retry.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::errors::Result;
use crate::model::{
    AdmissionWebhook, Condition, HistoryEntry, NewAdmissionWebhook, NewHistoryEntry, NewResource,
    NewResourceType, Operation, Phase, Resource, ResourceType, WebhookType,
};

/// Durable CRUD and queries for the control plane state.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Resource types
    // ------------------------------------------------------------------

    /// Insert or update a resource type keyed by `(name, version)`.
    async fn upsert_resource_type(&self, rt: NewResourceType) -> Result<ResourceType>;

    /// Look up a resource type by its `(name, version)` key.
    async fn get_resource_type(&self, name: &str, version: &str) -> Result<Option<ResourceType>>;

    /// Look up a resource type by surrogate id.
    async fn get_resource_type_by_id(&self, id: i64) -> Result<Option<ResourceType>>;

    /// List resource types, optionally filtered by name.
    async fn list_resource_types(&self, name: Option<&str>) -> Result<Vec<ResourceType>>;

    /// Delete a resource type.
    ///
    /// # Errors
    ///
    /// `Conflict` while any live resource still references the type;
    /// `NotFound` when the key does not exist.
    async fn delete_resource_type(&self, name: &str, version: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Create a resource in `pending` with `generation = 1`.
    ///
    /// # Errors
    ///
    /// `Conflict` on a duplicate resource name.
    async fn create_resource(&self, new: NewResource) -> Result<Resource>;

    /// Get a live resource by id.
    async fn get_resource(&self, id: i64) -> Result<Option<Resource>>;

    /// Get a resource by id including soft-deleted ones (deletion path).
    async fn get_resource_any(&self, id: i64) -> Result<Option<Resource>>;

    /// Get a live resource by its `(type, version, name)` key.
    async fn get_resource_by_name(
        &self,
        type_name: &str,
        type_version: &str,
        name: &str,
    ) -> Result<Option<Resource>>;

    /// List live resources, optionally filtered by type and version.
    async fn list_resources(
        &self,
        type_name: Option<&str>,
        type_version: Option<&str>,
    ) -> Result<Vec<Resource>>;

    /// Replace a resource's spec.
    ///
    /// Recomputes `spec_hash`; when the hash changes the generation is
    /// incremented, the phase resets to `pending`, and `next_reconcile_time`
    /// clears. An identical spec leaves the generation untouched.
    async fn update_resource_spec(&self, id: i64, new_spec: Value) -> Result<Resource>;

    /// Soft-delete: set `deleted_at`, flip the phase to `deleting`.
    /// Idempotent.
    async fn soft_delete_resource(&self, id: i64) -> Result<Resource>;

    /// Remove the row for good.
    ///
    /// # Errors
    ///
    /// `FinalizersPresent` unless the resource is soft-deleted with an empty
    /// finalizer set; the check and the delete are one atomic operation.
    async fn hard_delete_resource(&self, id: i64) -> Result<()>;

    /// Add a finalizer (set semantics; no-op when present).
    async fn add_finalizer(&self, id: i64, name: &str) -> Result<Vec<String>>;

    /// Remove a finalizer (set semantics; no-op when absent).
    async fn remove_finalizer(&self, id: i64, name: &str) -> Result<Vec<String>>;

    /// Current finalizer set, including for soft-deleted resources.
    async fn get_finalizers(&self, id: i64) -> Result<Vec<String>>;

    /// Write the phase, optional message, and optional observed generation.
    async fn update_status(
        &self,
        id: i64,
        phase: Phase,
        message: Option<String>,
        observed_generation: Option<i64>,
    ) -> Result<()>;

    /// Merge one condition into the resource's sequence, keyed by type,
    /// preserving `last_transition_time` when the status value is unchanged.
    async fn set_condition(&self, id: i64, condition: Condition) -> Result<()>;

    /// Replace the reconciler-owned outputs document.
    async fn set_outputs(&self, id: i64, outputs: Value) -> Result<()>;

    /// Set or clear the next scheduled reconcile time.
    async fn set_next_reconcile(&self, id: i64, at: Option<DateTime<Utc>>) -> Result<()>;

    /// Per-attempt bookkeeping: stamp `last_reconcile_time` and clear the
    /// retry counter on success or increment it on failure. Returns the new
    /// retry count.
    async fn record_attempt(&self, id: i64, success: bool, now: DateTime<Utc>) -> Result<i32>;

    /// Atomically claim up to `limit` resources needing work.
    ///
    /// Live candidates transition `-> reconciling` inside the claim so two
    /// scheduler ticks never observe the same resource; soft-deleted
    /// candidates stay in `deleting` and are guarded by the scheduler's
    /// in-memory active set.
    async fn claim_reconcile_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        drift_interval: Duration,
    ) -> Result<Vec<i64>>;

    /// Non-claiming selection query for reconciler context use: snapshots of
    /// resources of the given types that currently need work.
    async fn resources_needing_reconciliation(
        &self,
        types: &[String],
        limit: usize,
        now: DateTime<Utc>,
        drift_interval: Duration,
    ) -> Result<Vec<Resource>>;

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Append an audit record for one reconciliation attempt.
    async fn append_history(&self, entry: NewHistoryEntry) -> Result<HistoryEntry>;

    /// List history for a resource, newest first.
    async fn list_history(
        &self,
        resource_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryEntry>>;

    // ------------------------------------------------------------------
    // Admission webhooks
    // ------------------------------------------------------------------

    /// Register a webhook.
    ///
    /// # Errors
    ///
    /// `Conflict` on a duplicate webhook name.
    async fn create_webhook(&self, new: NewAdmissionWebhook) -> Result<AdmissionWebhook>;

    /// Get a webhook by id.
    async fn get_webhook(&self, id: i64) -> Result<Option<AdmissionWebhook>>;

    /// List all webhooks ordered by `ordering ASC, id ASC`.
    async fn list_webhooks(&self) -> Result<Vec<AdmissionWebhook>>;

    /// Replace a webhook's definition, keeping its id.
    async fn update_webhook(&self, id: i64, new: NewAdmissionWebhook) -> Result<AdmissionWebhook>;

    /// Delete a webhook by id.
    async fn delete_webhook(&self, id: i64) -> Result<()>;

    /// Webhooks applicable to a `(type, version, operation, tier)`, ordered
    /// by `ordering ASC, id ASC`.
    async fn list_webhooks_for(
        &self,
        type_name: &str,
        type_version: &str,
        operation: Operation,
        webhook_type: WebhookType,
    ) -> Result<Vec<AdmissionWebhook>>;
}
