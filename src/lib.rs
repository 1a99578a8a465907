// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! # Converge - Declarative Control Plane for External Infrastructure
//!
//! Converge is a Kubernetes-style controller for managing infrastructure
//! that lives outside any cluster. Users register **resource types** (schema
//! definitions), then submit **resources** (instances with a desired-state
//! spec); pluggable **reconcilers** drive each resource toward its declared
//! state, record audit history, and expose real-time change streams.
//!
//! ## Overview
//!
//! The control plane sits between the public API and the reconciler workers:
//!
//! - [`scheduler`] - selection, per-resource mutual exclusion, failure
//!   backoff, drift re-checks, and the soft-delete / finalizer / hard-delete
//!   protocol
//! - [`admission`] - ordered mutating and validating HTTP callbacks on every
//!   write, with strict failure-policy semantics
//! - [`status`] - coarse phase plus named conditions with transition
//!   timestamps, kept consistent with the spec generation
//! - [`events`] - in-memory pub/sub with non-blocking, lossy-on-overflow
//!   fan-out to long-lived streaming subscribers
//! - [`store`] - the durable store contract for resources, history,
//!   finalizers, and webhooks, with PostgreSQL and in-memory backends
//!
//! ## Example
//!
//! ```rust,no_run
//! use converge::gateway::CreateResourceRequest;
//! use serde_json::json;
//!
//! let request = CreateResourceRequest {
//!     name: "web-1".to_string(),
//!     resource_type_name: "web-service".to_string(),
//!     resource_type_version: "v1".to_string(),
//!     spec: json!({"image": "nginx:1.25", "replicas": 3}),
//! };
//! ```
//!
//! ## Features
//!
//! - **Declarative** - resources converge on their spec, not on imperative
//!   calls
//! - **Finalizer-guarded deletion** - external state is destroyed before a
//!   row disappears
//! - **Audit history** - every attempt is recorded with its trigger and
//!   outcome
//! - **Live streams** - SSE change feeds that never block the write path

pub mod admission;
pub mod api;
pub mod canonical;
pub mod config;
pub mod constants;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod validator;
