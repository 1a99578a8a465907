// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciler registry, action plugins, and the reconciler context façade.
//!
//! Reconcilers are capability objects registered at startup. Each claims one
//! or more resource type names; a duplicate claim is startup-fatal
//! ([`crate::errors::Error::ResourceTypeConflict`]). The scheduler looks up
//! the reconciler for a claimed type and drives it through the
//! [`Reconciler`] trait.
//!
//! Third-party reconciler code touches the control plane only through
//! [`ReconcilerContext`]: store pass-throughs with the finalizer-guard
//! invariants, status writes through the status engine, history appends,
//! action-plugin lookup, and the shutdown signal. Publishing events is the
//! scheduler's responsibility, never the context's.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::{Error, Result};
use crate::model::{
    Condition, HistoryEntry, NewHistoryEntry, Phase, Resource, TriggerReason,
};
use crate::status::{transition_conditions, Transition};
use crate::store::Store;

/// What a successful reconciliation attempt reports back.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Re-check sooner than the drift interval
    pub requeue_after: Option<Duration>,
    /// Human-readable status message
    pub message: Option<String>,
    /// Replacement for the resource's outputs document
    pub outputs: Option<Value>,
    /// The external world had diverged from the desired state
    pub drift_detected: bool,
    pub plan_output: Option<String>,
    pub apply_output: Option<String>,
    pub resources_created: i32,
    pub resources_updated: i32,
    pub resources_deleted: i32,
}

/// A pluggable worker that drives resources of its claimed types toward
/// their declared state.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Unique reconciler name; also used as its finalizer token.
    fn name(&self) -> &str;

    /// Resource type names this reconciler claims.
    fn resource_types(&self) -> Vec<String>;

    /// Optional long-running loop, launched by [`ReconcilerRegistry::start_all`].
    ///
    /// The default implementation returns immediately; reconcilers that need
    /// their own background work observe `ctx.shutdown_event()` and exit
    /// when it fires.
    async fn start(&self, ctx: Arc<ReconcilerContext>) -> anyhow::Result<()> {
        let _ = ctx;
        Ok(())
    }

    /// Drive one resource toward its spec.
    async fn reconcile(
        &self,
        resource: &Resource,
        ctx: Arc<ReconcilerContext>,
    ) -> anyhow::Result<ReconcileOutcome>;

    /// Destroy the external state behind a soft-deleted resource.
    ///
    /// Implementations must remove their own finalizer
    /// (`ctx.remove_finalizer(resource.id, self.name())`) only after the
    /// destroy succeeded; on error the resource stays in `deleting` and the
    /// destroy is retried. The default implementation has no external state
    /// and releases its finalizer immediately.
    async fn cleanup(&self, resource: &Resource, ctx: Arc<ReconcilerContext>) -> anyhow::Result<()> {
        ctx.remove_finalizer(resource.id, self.name()).await?;
        Ok(())
    }

    /// Shutdown hook, called by [`ReconcilerRegistry::stop_all`].
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An opaque executor registered by name; reconcilers look these up through
/// the context. The core never calls into them.
pub trait ActionPlugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &str;
}

/// Static mapping of resource types to reconcilers, populated at startup.
#[derive(Default)]
pub struct ReconcilerRegistry {
    by_type: HashMap<String, Arc<dyn Reconciler>>,
    actions: HashMap<String, Arc<dyn ActionPlugin>>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl ReconcilerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reconciler for every type it claims.
    ///
    /// # Errors
    ///
    /// `ResourceTypeConflict` when any claimed type already has a
    /// reconciler; startup must fail in that case.
    pub fn register(&mut self, reconciler: Arc<dyn Reconciler>) -> Result<()> {
        for resource_type in reconciler.resource_types() {
            if let Some(existing) = self.by_type.get(&resource_type) {
                return Err(Error::ResourceTypeConflict {
                    resource_type,
                    existing: existing.name().to_string(),
                    duplicate: reconciler.name().to_string(),
                });
            }
            info!(
                reconciler = reconciler.name(),
                resource_type = %resource_type,
                "Registered reconciler"
            );
            self.by_type.insert(resource_type, Arc::clone(&reconciler));
        }
        Ok(())
    }

    /// Register an action plugin by name. Later registrations win.
    pub fn register_action(&mut self, plugin: Arc<dyn ActionPlugin>) {
        self.actions.insert(plugin.name().to_string(), plugin);
    }

    /// The reconciler claiming a resource type, if any.
    #[must_use]
    pub fn reconciler_for(&self, resource_type: &str) -> Option<Arc<dyn Reconciler>> {
        self.by_type.get(resource_type).cloned()
    }

    /// True when a reconciler claims the resource type.
    #[must_use]
    pub fn has_reconciler_for(&self, resource_type: &str) -> bool {
        self.by_type.contains_key(resource_type)
    }

    /// True when no reconcilers are registered at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Action plugin lookup for the context façade.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<Arc<dyn ActionPlugin>> {
        self.actions.get(name).cloned()
    }

    /// Snapshot of the registered action plugins.
    #[must_use]
    pub fn actions(&self) -> HashMap<String, Arc<dyn ActionPlugin>> {
        self.actions.clone()
    }

    /// Launch every reconciler's own loop in its own task.
    pub async fn start_all(&self, ctx: Arc<ReconcilerContext>) {
        let mut tasks = self.tasks.lock().await;
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        for reconciler in self.by_type.values() {
            // A reconciler claiming several types still gets one loop
            let name = reconciler.name().to_string();
            if !seen.insert(name.clone()) {
                continue;
            }
            let reconciler = Arc::clone(reconciler);
            let ctx = Arc::clone(&ctx);
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = reconciler.start(ctx).await {
                    warn!(reconciler = %task_name, error = %e, "Reconciler loop exited with error");
                }
            });
            tasks.push((name, handle));
        }
    }

    /// Stop every reconciler and await their loops within `grace`.
    ///
    /// The shutdown signal itself is flipped by the caller before this runs;
    /// loops observing `ctx.shutdown_event()` are already draining.
    pub async fn stop_all(&self, grace: Duration) {
        let mut stopped: std::collections::HashSet<String> = std::collections::HashSet::new();
        for reconciler in self.by_type.values() {
            if !stopped.insert(reconciler.name().to_string()) {
                continue;
            }
            if let Err(e) = reconciler.stop().await {
                warn!(reconciler = reconciler.name(), error = %e, "Reconciler stop hook failed");
            }
        }

        let mut tasks = self.tasks.lock().await;
        for (name, handle) in tasks.drain(..) {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(reconciler = %name, error = %e, "Reconciler task panicked"),
                Err(_) => warn!(reconciler = %name, "Reconciler task did not stop within grace period"),
            }
        }
    }
}

/// The façade exposed to third-party reconciler code.
pub struct ReconcilerContext {
    store: Arc<dyn Store>,
    actions: HashMap<String, Arc<dyn ActionPlugin>>,
    shutdown: watch::Receiver<bool>,
    drift_interval: chrono::Duration,
}

impl ReconcilerContext {
    /// Build the context over the store and the registered action plugins.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        actions: HashMap<String, Arc<dyn ActionPlugin>>,
        shutdown: watch::Receiver<bool>,
        drift_interval: chrono::Duration,
    ) -> Self {
        Self {
            store,
            actions,
            shutdown,
            drift_interval,
        }
    }

    /// Snapshots of resources of the given types that currently need work,
    /// without claiming them.
    pub async fn get_resources_needing_reconciliation(
        &self,
        types: &[String],
        limit: usize,
    ) -> Result<Vec<Resource>> {
        self.store
            .resources_needing_reconciliation(types, limit, Utc::now(), self.drift_interval)
            .await
    }

    /// Write phase, message, and observed generation, and merge the matching
    /// standard conditions. Does not publish; publishing is the scheduler's
    /// responsibility.
    pub async fn update_status(
        &self,
        id: i64,
        phase: Phase,
        message: Option<String>,
        observed_generation: Option<i64>,
    ) -> Result<()> {
        self.store
            .update_status(id, phase, message.clone(), observed_generation)
            .await?;

        let transition = match phase {
            Phase::Reconciling => Some(Transition::ReconcileStarted),
            Phase::Ready => Some(Transition::ReconcileSucceeded),
            Phase::Failed => Some(Transition::ReconcileFailed {
                reason: "ReconcileError".to_string(),
                message: message.unwrap_or_default(),
            }),
            Phase::Deleting => Some(Transition::DeletionStarted),
            Phase::Pending => None,
        };
        if let Some(transition) = transition {
            let generation = self
                .store
                .get_resource_any(id)
                .await?
                .map_or(0, |r| r.generation);
            for condition in transition_conditions(&transition, generation) {
                self.store.set_condition(id, condition).await?;
            }
        }
        Ok(())
    }

    /// Merge one domain condition, keyed by type, under the
    /// transition-time rule.
    pub async fn set_condition(&self, id: i64, condition: Condition) -> Result<()> {
        self.store.set_condition(id, condition).await
    }

    /// Append a history entry for an attempt driven by the reconciler's own
    /// loop.
    pub async fn record_reconciliation(
        &self,
        resource: &Resource,
        result: std::result::Result<&ReconcileOutcome, &str>,
        trigger_reason: TriggerReason,
        duration: Duration,
    ) -> Result<HistoryEntry> {
        let entry = match result {
            Ok(outcome) => NewHistoryEntry {
                resource_id: resource.id,
                generation: resource.generation,
                success: true,
                phase: Phase::Ready,
                plan_output: outcome.plan_output.clone(),
                apply_output: outcome.apply_output.clone(),
                error_message: None,
                resources_created: outcome.resources_created,
                resources_updated: outcome.resources_updated,
                resources_deleted: outcome.resources_deleted,
                duration_seconds: duration.as_secs_f64(),
                trigger_reason,
                drift_detected: outcome.drift_detected,
            },
            Err(message) => NewHistoryEntry {
                resource_id: resource.id,
                generation: resource.generation,
                success: false,
                phase: Phase::Failed,
                plan_output: None,
                apply_output: None,
                error_message: Some(message.to_string()),
                resources_created: 0,
                resources_updated: 0,
                resources_deleted: 0,
                duration_seconds: duration.as_secs_f64(),
                trigger_reason,
                drift_detected: false,
            },
        };
        self.store.append_history(entry).await
    }

    /// Current finalizer set.
    pub async fn get_finalizers(&self, id: i64) -> Result<Vec<String>> {
        self.store.get_finalizers(id).await
    }

    /// Remove a finalizer (set semantics; no-op when absent).
    pub async fn remove_finalizer(&self, id: i64, name: &str) -> Result<Vec<String>> {
        self.store.remove_finalizer(id, name).await
    }

    /// Hard delete; fails with `FinalizersPresent` while finalizers remain.
    pub async fn hard_delete_resource(&self, id: i64) -> Result<()> {
        self.store.hard_delete_resource(id).await
    }

    /// Opaque action plugin lookup by name.
    #[must_use]
    pub fn get_action_plugin(&self, name: &str) -> Option<Arc<dyn ActionPlugin>> {
        self.actions.get(name).cloned()
    }

    /// The shutdown signal every reconciler loop must observe.
    #[must_use]
    pub fn shutdown_event(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// True once shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod registry_tests;
