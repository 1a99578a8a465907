// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Error types for the Converge control plane.
//!
//! This module defines the crate-wide error taxonomy used by the store, the
//! admission chain, the write gateway, and the scheduler. Each variant maps
//! to a well-defined propagation behavior:
//!
//! - Write-path rejections (`SchemaValidation`, `AdmissionDenied`,
//!   `NoReconcilerForType`) surface to the HTTP layer and are never retried.
//! - `Conflict` and `FinalizersPresent` signal state guards (duplicate names,
//!   hard delete blocked by finalizers).
//! - `Store` wraps transient database failures; mutations are transactional
//!   so resource state never corrupts.
//! - `ReconcilerFailed` is captured as a failed attempt and retried with
//!   exponential backoff; it never crashes the scheduler.
//! - `Canceled` is silent: in-flight work observes shutdown and exits.

use thiserror::Error;

/// A single schema validation failure.
///
/// Carries the JSON-pointer-style path of the offending value and a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationError {
    /// Path to the failing value, e.g. `/replicas` or `/config/ttl`
    pub path: String,
    /// Human-readable explanation of the failure
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Errors produced by the control plane core.
#[derive(Error, Debug)]
pub enum Error {
    /// A spec document failed validation against its resource type schema.
    ///
    /// Rejected at the write path with HTTP 400; never retried.
    #[error("schema validation failed: {}", format_validation_errors(.0))]
    SchemaValidation(Vec<ValidationError>),

    /// An admission webhook denied the write, or a webhook with
    /// `failure_policy = Fail` could not be reached.
    ///
    /// Rejected at the write path with HTTP 403; never retried.
    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    /// The requested resource, resource type, or webhook does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A uniqueness or state guard was violated (duplicate resource name,
    /// resource type still referenced).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Hard delete attempted while finalizers remain on the resource.
    ///
    /// The resource stays in `deleting` until the finalizer set empties.
    #[error("finalizers present: {}", .0.join(", "))]
    FinalizersPresent(Vec<String>),

    /// No reconciler claims the resource type.
    ///
    /// Rejected with HTTP 400 on CREATE; at dispatch time the resource is
    /// marked `failed` with reason `NoReconciler` instead.
    #[error("no reconciler registered for resource type '{0}'")]
    NoReconcilerForType(String),

    /// A reconciliation attempt failed.
    ///
    /// Recorded as the attempt outcome and retried with exponential backoff.
    #[error("reconciler failed: {0}")]
    ReconcilerFailed(String),

    /// An admission webhook could not be reached or returned a non-2xx.
    ///
    /// Converted to [`Error::AdmissionDenied`] iff the webhook's failure
    /// policy is `Fail`; otherwise logged and skipped.
    #[error("webhook '{name}' failed: {cause}")]
    WebhookTransport {
        /// Name of the failing webhook
        name: String,
        /// Transport-level cause (timeout, connection refused, HTTP status)
        cause: String,
    },

    /// A transient store failure.
    ///
    /// Surfaced to the scheduler as a retryable attempt failure and to the
    /// write path as HTTP 500.
    #[error("store error: {0}")]
    Store(String),

    /// Two reconcilers claim the same resource type. Startup-fatal.
    #[error("resource type '{resource_type}' claimed by both '{existing}' and '{duplicate}'")]
    ResourceTypeConflict {
        /// The contested resource type name
        resource_type: String,
        /// Reconciler already holding the claim
        existing: String,
        /// Reconciler attempting the duplicate claim
        duplicate: String,
    },

    /// Shutdown was requested while work was in flight. Silent.
    #[error("canceled")]
    Canceled,
}

impl Error {
    /// Build a [`Error::Store`] from anything displayable.
    pub fn store(err: impl std::fmt::Display) -> Self {
        Error::Store(err.to_string())
    }

    /// True when the error represents a transient condition the scheduler
    /// should retry, as opposed to a terminal write-path rejection.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_) | Error::ReconcilerFailed(_))
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Error::Store(err.to_string())
    }
}

/// Shared result alias for core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod errors_tests;
