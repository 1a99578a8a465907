// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Core data model for the Converge control plane.
//!
//! The central entity is [`Resource`]: a named instance of a registered
//! [`ResourceType`] carrying a free-form desired-state `spec`. Reconcilers
//! drive each resource toward its spec and report back through the status
//! fields (`status`, `conditions`, `observed_generation`, `outputs`).
//!
//! # Generation semantics
//!
//! - `generation` is bumped iff the canonical hash of the spec changes on
//!   UPDATE; it starts at 1 on creation.
//! - `observed_generation` is set by the reconciler after a successful
//!   attempt and never exceeds `generation`.
//! - `generation > observed_generation` means there is unobserved desired
//!   state and the resource is eligible for reconciliation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse lifecycle phase of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Awaiting its first (or next) reconciliation
    Pending,
    /// A reconciliation attempt is in flight
    Reconciling,
    /// Observed state matches desired state
    Ready,
    /// The last attempt failed; retried with backoff
    Failed,
    /// Soft-deleted; the destroy path is in progress
    Deleting,
}

impl Phase {
    /// Stable lowercase name, matching the persisted representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Reconciling => "reconciling",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
            Phase::Deleting => "deleting",
        }
    }

    /// Parse the persisted lowercase form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Phase> {
        match s {
            "pending" => Some(Phase::Pending),
            "reconciling" => Some(Phase::Reconciling),
            "ready" => Some(Phase::Ready),
            "failed" => Some(Phase::Failed),
            "deleting" => Some(Phase::Deleting),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status value of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A named boolean state with a transition timestamp, following the
/// Kubernetes condition conventions.
///
/// `last_transition_time` advances only when `status` changes value;
/// `observed_generation` always reflects the generation current at write
/// time. Condition `type` is unique within a resource's condition sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// The aspect being reported (e.g. "Ready", "Degraded")
    pub r#type: String,
    /// True, False, or Unknown
    pub status: ConditionStatus,
    /// Programmatic CamelCase identifier (e.g. "ReconcileSuccess")
    pub reason: String,
    /// Human-readable explanation
    #[serde(default)]
    pub message: String,
    /// When `status` last changed value
    pub last_transition_time: DateTime<Utc>,
    /// Resource generation current when this condition was written
    pub observed_generation: i64,
}

/// Lifecycle status of a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTypeStatus {
    Active,
    Deprecated,
}

/// A registered schema definition, identified by `(name, version)`.
///
/// Resource types are created through the API, never mutated by the core,
/// and deleted only when no live resources reference them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceType {
    pub id: i64,
    pub name: String,
    pub version: String,
    /// OpenAPI v3 schema document the specs of this type must conform to
    pub schema: Value,
    #[serde(default)]
    pub description: Option<String>,
    pub status: ResourceTypeStatus,
    /// Free-form metadata document
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a resource type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResourceType {
    pub name: String,
    pub version: String,
    pub schema: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_type_status")]
    pub status: ResourceTypeStatus,
    #[serde(default)]
    pub metadata: Value,
}

fn default_type_status() -> ResourceTypeStatus {
    ResourceTypeStatus::Active
}

/// The central entity: an instance of a resource type with a user-declared
/// desired state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    /// Application key; globally unique across all types
    pub name: String,
    pub resource_type_name: String,
    pub resource_type_version: String,
    /// Desired state, conforming to the type's schema
    pub spec: Value,
    /// Opaque document written by the reconciler; read-only to clients
    #[serde(default)]
    pub outputs: Option<Value>,
    /// Named tokens blocking hard deletion; set semantics, stable order
    #[serde(default)]
    pub finalizers: Vec<String>,
    pub status: Phase,
    #[serde(default)]
    pub status_message: Option<String>,
    /// Monotonic counter of observed spec changes; >= 1 after creation
    pub generation: i64,
    /// Generation last reconciled successfully; <= generation
    pub observed_generation: i64,
    /// SHA-256 hex over the canonicalized spec
    pub spec_hash: String,
    /// Consecutive failed attempts since the last success
    pub retry_count: i32,
    #[serde(default)]
    pub last_reconcile_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_reconcile_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Non-null once soft-deleted; implies `status = deleting`
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    /// True once the resource has been soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The reconciliation selection predicate.
    ///
    /// A resource is eligible for work when it is live and pending, failed
    /// with an elapsed backoff, ready with an elapsed drift window, or
    /// carrying an unobserved generation; or when it is soft-deleted and
    /// awaiting the destroy path. A resource already `reconciling` is never
    /// eligible.
    #[must_use]
    pub fn needs_reconcile(&self, now: DateTime<Utc>, drift_interval: Duration) -> bool {
        if self.deleted_at.is_some() {
            return self.status == Phase::Deleting;
        }
        match self.status {
            Phase::Pending => true,
            Phase::Reconciling => false,
            // A spec change on a failed resource resets it to pending, so
            // the failure backoff alone governs here
            Phase::Failed => self.next_reconcile_time.is_some_and(|t| t <= now),
            Phase::Ready => {
                self.generation > self.observed_generation
                    || self
                        .last_reconcile_time
                        .is_some_and(|t| t + drift_interval <= now)
            }
            Phase::Deleting => false,
        }
    }

    /// True when the pending work is a drift re-check rather than a spec
    /// change, failure retry, or deletion.
    #[must_use]
    pub fn is_drift_candidate(&self, now: DateTime<Utc>, drift_interval: Duration) -> bool {
        self.deleted_at.is_none()
            && self.status == Phase::Ready
            && self.generation == self.observed_generation
            && self
                .last_reconcile_time
                .is_some_and(|t| t + drift_interval <= now)
    }
}

/// Input for creating a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewResource {
    pub name: String,
    pub resource_type_name: String,
    pub resource_type_version: String,
    pub spec: Value,
    /// Finalizers pre-inserted at creation (the claiming reconciler's name)
    #[serde(default)]
    pub finalizers: Vec<String>,
}

/// Why a reconciliation attempt ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    SpecChange,
    Drift,
    Manual,
    Retry,
    Delete,
}

impl TriggerReason {
    /// Stable snake_case name, matching the persisted representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerReason::SpecChange => "spec_change",
            TriggerReason::Drift => "drift",
            TriggerReason::Manual => "manual",
            TriggerReason::Retry => "retry",
            TriggerReason::Delete => "delete",
        }
    }

    /// Parse the persisted snake_case form.
    #[must_use]
    pub fn parse(s: &str) -> Option<TriggerReason> {
        match s {
            "spec_change" => Some(TriggerReason::SpecChange),
            "drift" => Some(TriggerReason::Drift),
            "manual" => Some(TriggerReason::Manual),
            "retry" => Some(TriggerReason::Retry),
            "delete" => Some(TriggerReason::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only audit record of one reconciliation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub resource_id: i64,
    /// Generation at the start of the attempt
    pub generation: i64,
    pub success: bool,
    /// Final phase of the attempt
    pub phase: Phase,
    #[serde(default)]
    pub plan_output: Option<String>,
    #[serde(default)]
    pub apply_output: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub resources_created: i32,
    pub resources_updated: i32,
    pub resources_deleted: i32,
    pub duration_seconds: f64,
    pub trigger_reason: TriggerReason,
    pub drift_detected: bool,
    pub reconcile_time: DateTime<Utc>,
}

/// Input for appending a history entry.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub resource_id: i64,
    pub generation: i64,
    pub success: bool,
    pub phase: Phase,
    pub plan_output: Option<String>,
    pub apply_output: Option<String>,
    pub error_message: Option<String>,
    pub resources_created: i32,
    pub resources_updated: i32,
    pub resources_deleted: i32,
    pub duration_seconds: f64,
    pub trigger_reason: TriggerReason,
    pub drift_detected: bool,
}

/// Write operation classes admission webhooks can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Stable uppercase name, matching the persisted representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a webhook mutates or only validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookType {
    Mutating,
    Validating,
}

impl WebhookType {
    /// Stable lowercase name, matching the persisted representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookType::Mutating => "mutating",
            WebhookType::Validating => "validating",
        }
    }

    /// Parse the persisted lowercase form.
    #[must_use]
    pub fn parse(s: &str) -> Option<WebhookType> {
        match s {
            "mutating" => Some(WebhookType::Mutating),
            "validating" => Some(WebhookType::Validating),
            _ => None,
        }
    }
}

/// What happens when a webhook cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Transport failure aborts the write with an admission denial
    Fail,
    /// Transport failure is logged and the chain continues
    Ignore,
}

impl FailurePolicy {
    /// Stable name, matching the persisted representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::Fail => "Fail",
            FailurePolicy::Ignore => "Ignore",
        }
    }

    /// Parse the persisted form.
    #[must_use]
    pub fn parse(s: &str) -> Option<FailurePolicy> {
        match s {
            "Fail" => Some(FailurePolicy::Fail),
            "Ignore" => Some(FailurePolicy::Ignore),
            _ => None,
        }
    }
}

/// A registered admission webhook.
///
/// Webhooks with a `(resource_type_name, resource_type_version)` filter only
/// run for matching resources; webhooks without a filter run for every
/// resource. Execution order within a tier is `ordering ASC, id ASC`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionWebhook {
    pub id: i64,
    /// Unique webhook name
    pub name: String,
    #[serde(default)]
    pub resource_type_name: Option<String>,
    #[serde(default)]
    pub resource_type_version: Option<String>,
    pub webhook_url: String,
    pub webhook_type: WebhookType,
    /// Operations this webhook subscribes to
    pub operations: Vec<Operation>,
    pub timeout_seconds: i32,
    pub failure_policy: FailurePolicy,
    /// Signed ordering key; lower runs first
    pub ordering: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdmissionWebhook {
    /// True when this webhook applies to the given type, operation, and tier.
    #[must_use]
    pub fn matches(
        &self,
        type_name: &str,
        type_version: &str,
        operation: Operation,
        kind: WebhookType,
    ) -> bool {
        if self.webhook_type != kind || !self.operations.contains(&operation) {
            return false;
        }
        if let Some(filter_name) = &self.resource_type_name {
            if filter_name != type_name {
                return false;
            }
            if let Some(filter_version) = &self.resource_type_version {
                if filter_version != type_version {
                    return false;
                }
            }
        }
        true
    }
}

/// Input for registering an admission webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAdmissionWebhook {
    pub name: String,
    #[serde(default)]
    pub resource_type_name: Option<String>,
    #[serde(default)]
    pub resource_type_version: Option<String>,
    pub webhook_url: String,
    pub webhook_type: WebhookType,
    pub operations: Vec<Operation>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_seconds: i32,
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub ordering: i32,
}

fn default_webhook_timeout() -> i32 {
    crate::constants::DEFAULT_WEBHOOK_TIMEOUT_SECS
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Fail
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod model_tests;
