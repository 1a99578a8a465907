// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Runtime configuration for the Converge control plane.
//!
//! Every tunable is environment-addressable with the `CONVERGE_` prefix and
//! falls back to the defaults in [`crate::constants`]. The CLI flags defined
//! in `main.rs` override the environment.

use std::time::Duration;

use crate::constants::{
    DEFAULT_API_PORT, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_CAP_SECS, DEFAULT_DB_HOST,
    DEFAULT_DB_NAME, DEFAULT_DB_PORT, DEFAULT_DB_USER, DEFAULT_DRIFT_INTERVAL_SECS,
    DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_MAX_CONCURRENT_RECONCILES,
    DEFAULT_RECONCILE_INTERVAL_SECS, DEFAULT_SHUTDOWN_GRACE_SECS,
};

/// Which store implementation backs the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreBackend {
    /// PostgreSQL via a pooled connection set (production)
    Postgres,
    /// In-process store (development and tests)
    Memory,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub store_backend: StoreBackend,
    pub api_port: u16,
    pub reconcile_interval: Duration,
    pub max_concurrent_reconciles: usize,
    pub drift_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub shutdown_grace: Duration,
    pub event_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_host: DEFAULT_DB_HOST.to_string(),
            db_port: DEFAULT_DB_PORT,
            db_name: DEFAULT_DB_NAME.to_string(),
            db_user: DEFAULT_DB_USER.to_string(),
            db_password: String::new(),
            store_backend: StoreBackend::Postgres,
            api_port: DEFAULT_API_PORT,
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            drift_interval: Duration::from_secs(DEFAULT_DRIFT_INTERVAL_SECS),
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            backoff_cap: Duration::from_secs(DEFAULT_BACKOFF_CAP_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    /// Load configuration from `CONVERGE_*` environment variables.
    ///
    /// Unset or unparseable variables fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Self {
            db_host: env_string("CONVERGE_DB_HOST", defaults.db_host),
            db_port: env_parse("CONVERGE_DB_PORT", defaults.db_port),
            db_name: env_string("CONVERGE_DB_NAME", defaults.db_name),
            db_user: env_string("CONVERGE_DB_USER", defaults.db_user),
            db_password: env_string("CONVERGE_DB_PASSWORD", defaults.db_password),
            store_backend: match std::env::var("CONVERGE_STORE_BACKEND").as_deref() {
                Ok("memory") => StoreBackend::Memory,
                _ => StoreBackend::Postgres,
            },
            api_port: env_parse("CONVERGE_API_PORT", defaults.api_port),
            reconcile_interval: Duration::from_secs(env_parse(
                "CONVERGE_RECONCILE_INTERVAL_SEC",
                DEFAULT_RECONCILE_INTERVAL_SECS,
            )),
            max_concurrent_reconciles: env_parse(
                "CONVERGE_MAX_CONCURRENT_RECONCILES",
                defaults.max_concurrent_reconciles,
            ),
            drift_interval: Duration::from_secs(env_parse(
                "CONVERGE_DRIFT_INTERVAL_SEC",
                DEFAULT_DRIFT_INTERVAL_SECS,
            )),
            backoff_base: Duration::from_secs(env_parse(
                "CONVERGE_BACKOFF_BASE_SEC",
                DEFAULT_BACKOFF_BASE_SECS,
            )),
            backoff_cap: Duration::from_secs(env_parse(
                "CONVERGE_BACKOFF_CAP_SEC",
                DEFAULT_BACKOFF_CAP_SECS,
            )),
            shutdown_grace: Duration::from_secs(env_parse(
                "CONVERGE_SHUTDOWN_GRACE_SEC",
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )),
            event_queue_capacity: env_parse(
                "CONVERGE_EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            ),
        }
    }

    /// Drift interval as a chrono duration, for timestamp arithmetic.
    #[must_use]
    pub fn drift_interval_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.drift_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_DRIFT_INTERVAL_SECS as i64))
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
