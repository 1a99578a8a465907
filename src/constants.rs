// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Global constants for the Converge control plane.
//!
//! This module contains all numeric and string constants used throughout the
//! codebase. Constants are organized by category for easy maintenance.
//! Runtime-tunable values have matching environment variables in
//! [`crate::config`]; the constants here are their defaults.

// ============================================================================
// Scheduler Constants
// ============================================================================

/// How often the scheduler tick claims a new reconciliation batch (seconds)
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Maximum concurrent reconciliation attempts
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 5;

/// How long a ready resource may sit before a drift re-check (seconds)
pub const DEFAULT_DRIFT_INTERVAL_SECS: u64 = 300;

/// Base delay of the failure backoff schedule (seconds)
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 60;

/// Ceiling of the failure backoff schedule (seconds, 1024 minutes)
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 61_440;

/// Grace period for in-flight attempts on shutdown (seconds)
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Randomization factor applied to the tick interval (±10%)
pub const TICK_JITTER_FACTOR: f64 = 0.1;

// ============================================================================
// Admission Constants
// ============================================================================

/// Per-webhook call timeout when the webhook does not specify one (seconds)
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: i32 = 10;

// ============================================================================
// Event Bus Constants
// ============================================================================

/// Bounded per-subscriber queue depth; events beyond this are dropped
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// SSE heartbeat comment interval (seconds)
pub const SSE_KEEPALIVE_SECS: u64 = 15;

// ============================================================================
// HTTP API Constants
// ============================================================================

/// Default bind port for the REST API and SSE streams
pub const DEFAULT_API_PORT: u16 = 8080;

/// Default bind address for the REST API
pub const API_BIND_ADDRESS: &str = "0.0.0.0";

// ============================================================================
// Database Constants
// ============================================================================

/// Default PostgreSQL host
pub const DEFAULT_DB_HOST: &str = "localhost";

/// Default PostgreSQL port
pub const DEFAULT_DB_PORT: u16 = 5432;

/// Default database name
pub const DEFAULT_DB_NAME: &str = "converge";

/// Default database user
pub const DEFAULT_DB_USER: &str = "converge";

// ============================================================================
// Runtime Constants
// ============================================================================

/// Number of worker threads for the Tokio runtime
pub const TOKIO_WORKER_THREADS: usize = 4;
