// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Reconciliation scheduler and lifecycle state machine.
//!
//! One tick loop wakes every `reconcile_interval` (with ±10% jitter so
//! co-located control planes do not thunder together), atomically claims a
//! batch of eligible resources through the store, and spawns one attempt
//! task per claim. Concurrency is bounded two ways:
//!
//! - a semaphore of `max_concurrent_reconciles` permits;
//! - an in-memory active-id set that fails a claim fast if the same resource
//!   already has an attempt in flight in this process (the destroy path
//!   keeps its `deleting` phase in the store, so only the active set guards
//!   its re-entry).
//!
//! # Per-attempt protocol
//!
//! 1. Merge the `ReconcileStarted` conditions (the claim already flipped the
//!    phase).
//! 2. Call the reconciler with the resource snapshot, racing the shutdown
//!    signal; a canceled attempt exits silently without a history entry.
//! 3. On success: `observed_generation = generation`, phase `ready`, retry
//!    counter cleared, success conditions, next drift check scheduled.
//! 4. On failure: retry counter bumped, phase `failed`, failure conditions,
//!    exponential backoff `min(base * 2^(n-1), cap)`.
//! 5. Append the history entry.
//! 6. Publish `RECONCILED` - after the store reflects the outcome, never
//!    before.
//!
//! The destroy path runs the reconciler's `cleanup` instead and then tries
//! the finalizer-guarded hard delete; `FinalizersPresent` leaves the
//! resource in `deleting` for a later tick.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::events::{Event, EventBus, EventType};
use crate::metrics;
use crate::model::{NewHistoryEntry, Phase, Resource, TriggerReason};
use crate::registry::{ReconcileOutcome, ReconcilerContext, ReconcilerRegistry};
use crate::status::{transition_conditions, Transition};
use crate::store::Store;

/// Failure backoff: `min(base * 2^(retry_count - 1), cap)`.
///
/// `retry_count` is the post-increment counter, so the first failure waits
/// one base interval.
#[must_use]
pub fn backoff_delay(retry_count: i32, base: Duration, cap: Duration) -> Duration {
    let exponent = retry_count.saturating_sub(1).clamp(0, 62) as u32;
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let secs = base.as_secs().saturating_mul(factor);
    Duration::from_secs(secs).min(cap)
}

/// Apply ±`TICK_JITTER_FACTOR` jitter to the tick interval.
fn jittered(interval: Duration) -> Duration {
    let secs = interval.as_secs_f64();
    let delta = secs * crate::constants::TICK_JITTER_FACTOR;
    if delta <= 0.0 {
        return interval;
    }
    let mut rng = rand::thread_rng();
    Duration::from_secs_f64(rng.gen_range((secs - delta).max(0.0)..=secs + delta))
}

struct SchedulerInner {
    store: Arc<dyn Store>,
    registry: Arc<ReconcilerRegistry>,
    bus: Arc<EventBus>,
    ctx: Arc<ReconcilerContext>,
    cfg: Config,
    semaphore: Arc<Semaphore>,
    active: Mutex<HashSet<i64>>,
    shutdown: watch::Receiver<bool>,
}

/// The reconciliation scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build the scheduler.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ReconcilerRegistry>,
        bus: Arc<EventBus>,
        ctx: Arc<ReconcilerContext>,
        cfg: Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_reconciles));
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                registry,
                bus,
                ctx,
                cfg,
                semaphore,
                active: Mutex::new(HashSet::new()),
                shutdown,
            }),
        }
    }

    /// Run the tick loop until shutdown, then drain in-flight attempts
    /// within the configured grace period.
    pub async fn run(self) {
        info!(
            interval_secs = self.inner.cfg.reconcile_interval.as_secs(),
            max_concurrent = self.inner.cfg.max_concurrent_reconciles,
            drift_secs = self.inner.cfg.drift_interval.as_secs(),
            "Scheduler started"
        );

        let mut shutdown = self.inner.shutdown.clone();
        let mut attempts: Vec<JoinHandle<()>> = Vec::new();

        loop {
            match self.tick().await {
                Ok(mut spawned) => attempts.append(&mut spawned),
                Err(e) => warn!(error = %e, "Scheduler tick failed; will retry next interval"),
            }
            attempts.retain(|handle| !handle.is_finished());

            tokio::select! {
                _ = tokio::time::sleep(jittered(self.inner.cfg.reconcile_interval)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            in_flight = attempts.len(),
            grace_secs = self.inner.cfg.shutdown_grace.as_secs(),
            "Scheduler shutting down, draining in-flight attempts"
        );
        let drain = async {
            for handle in attempts.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.inner.cfg.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("Shutdown grace period elapsed with attempts still in flight");
        }
        info!("Scheduler stopped");
    }

    /// Claim one batch and spawn an attempt task per claim.
    ///
    /// Returns the spawned task handles; the caller decides whether to await
    /// them (tests) or track them for shutdown draining (the run loop).
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        let inner = &self.inner;
        let available = inner.semaphore.available_permits();
        if available == 0 {
            debug!("All reconcile permits in use; skipping tick");
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let drift = chrono::Duration::from_std(inner.cfg.drift_interval)
            .map_err(Error::store)?;
        let claimed = inner
            .store
            .claim_reconcile_batch(available, now, drift)
            .await?;
        if claimed.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = claimed.len(), "Claimed reconciliation batch");

        let mut handles = Vec::new();
        for id in claimed {
            // Fail fast when this id already has an attempt in flight here
            {
                let mut active = inner.active.lock().expect("active set lock poisoned");
                if !active.insert(id) {
                    debug!(resource_id = id, "Attempt already active; skipping claim");
                    continue;
                }
            }
            let permit = match Arc::clone(&inner.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // Batch was sized to the free permits; losing the race
                    // means another tick is running, let it win
                    inner.active.lock().expect("active set lock poisoned").remove(&id);
                    break;
                }
            };

            let task_inner = Arc::clone(inner);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                metrics::RECONCILIATIONS_IN_FLIGHT.inc();
                run_attempt(&task_inner, id).await;
                metrics::RECONCILIATIONS_IN_FLIGHT.dec();
                task_inner
                    .active
                    .lock()
                    .expect("active set lock poisoned")
                    .remove(&id);
            }));
        }
        Ok(handles)
    }
}

/// Classify why this attempt is running, from the claimed snapshot.
fn classify_trigger(
    resource: &Resource,
    now: chrono::DateTime<Utc>,
    drift_interval: chrono::Duration,
) -> TriggerReason {
    if resource.deleted_at.is_some() {
        TriggerReason::Delete
    } else if resource.retry_count > 0 {
        TriggerReason::Retry
    } else if resource.generation > resource.observed_generation {
        TriggerReason::SpecChange
    } else if resource
        .last_reconcile_time
        .is_some_and(|t| t + drift_interval <= now)
    {
        TriggerReason::Drift
    } else {
        // Generation already observed and the drift window has not elapsed:
        // someone requeued this resource by hand
        TriggerReason::Manual
    }
}

async fn run_attempt(inner: &SchedulerInner, id: i64) {
    let resource = match inner.store.get_resource_any(id).await {
        Ok(Some(resource)) => resource,
        Ok(None) => {
            debug!(resource_id = id, "Claimed resource vanished before dispatch");
            return;
        }
        Err(e) => {
            warn!(resource_id = id, error = %e, "Failed to load claimed resource");
            return;
        }
    };

    if resource.deleted_at.is_some() {
        run_destroy_attempt(inner, resource).await;
    } else {
        run_reconcile_attempt(inner, resource).await;
    }
}

async fn run_reconcile_attempt(inner: &SchedulerInner, resource: Resource) {
    let drift = chrono::Duration::from_std(inner.cfg.drift_interval)
        .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let trigger = classify_trigger(&resource, Utc::now(), drift);
    let Some(reconciler) = inner.registry.reconciler_for(&resource.resource_type_name) else {
        // Write-time checks make this unreachable in practice; degrade the
        // resource rather than crash the scheduler
        error!(
            resource = %resource.name,
            resource_type = %resource.resource_type_name,
            "No reconciler registered at dispatch time"
        );
        mark_failed(inner, &resource, "NoReconciler", "no reconciler registered for type").await;
        return;
    };

    debug!(
        resource = %resource.name,
        reconciler = reconciler.name(),
        trigger = %trigger,
        "Starting reconciliation attempt"
    );
    for condition in transition_conditions(&Transition::ReconcileStarted, resource.generation) {
        if let Err(e) = inner.store.set_condition(resource.id, condition).await {
            warn!(resource = %resource.name, error = %e, "Failed to set start condition");
        }
    }

    let started = Instant::now();
    let mut shutdown = inner.shutdown.clone();
    let outcome = tokio::select! {
        outcome = reconciler.reconcile(&resource, Arc::clone(&inner.ctx)) => outcome,
        _ = shutdown.changed() => {
            // Canceled: exit without recording the attempt
            debug!(resource = %resource.name, "Attempt canceled by shutdown");
            return;
        }
    };
    let duration = started.elapsed();

    match outcome {
        Ok(outcome) => finish_success(inner, &resource, &outcome, trigger, duration).await,
        Err(e) => finish_failure(inner, &resource, &e.to_string(), trigger, duration).await,
    }

    publish_reconciled(inner, resource.id).await;
}

async fn finish_success(
    inner: &SchedulerInner,
    resource: &Resource,
    outcome: &ReconcileOutcome,
    trigger: TriggerReason,
    duration: Duration,
) {
    let now = Utc::now();
    let result: Result<()> = async {
        if let Some(outputs) = &outcome.outputs {
            inner.store.set_outputs(resource.id, outputs.clone()).await?;
        }
        inner.store.record_attempt(resource.id, true, now).await?;
        inner
            .store
            .update_status(
                resource.id,
                Phase::Ready,
                outcome.message.clone(),
                Some(resource.generation),
            )
            .await?;
        for condition in transition_conditions(&Transition::ReconcileSucceeded, resource.generation)
        {
            inner.store.set_condition(resource.id, condition).await?;
        }
        let requeue = outcome
            .requeue_after
            .unwrap_or(inner.cfg.drift_interval);
        let next = now
            + chrono::Duration::from_std(requeue)
                .unwrap_or_else(|_| chrono::Duration::seconds(requeue.as_secs() as i64));
        inner.store.set_next_reconcile(resource.id, Some(next)).await?;

        inner
            .store
            .append_history(NewHistoryEntry {
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
                trigger_reason: trigger,
                drift_detected: outcome.drift_detected,
            })
            .await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(
                resource = %resource.name,
                generation = resource.generation,
                trigger = %trigger,
                "Reconciliation succeeded"
            );
            metrics::record_reconciliation_success(&resource.resource_type_name, duration);
        }
        Err(e) => warn!(resource = %resource.name, error = %e, "Failed to record successful attempt"),
    }
}

async fn finish_failure(
    inner: &SchedulerInner,
    resource: &Resource,
    message: &str,
    trigger: TriggerReason,
    duration: Duration,
) {
    let now = Utc::now();
    let result: Result<()> = async {
        let retry_count = inner.store.record_attempt(resource.id, false, now).await?;
        inner
            .store
            .update_status(resource.id, Phase::Failed, Some(message.to_string()), None)
            .await?;
        for condition in transition_conditions(
            &Transition::ReconcileFailed {
                reason: "ReconcileError".to_string(),
                message: message.to_string(),
            },
            resource.generation,
        ) {
            inner.store.set_condition(resource.id, condition).await?;
        }

        let delay = backoff_delay(retry_count, inner.cfg.backoff_base, inner.cfg.backoff_cap);
        let next = now
            + chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(delay.as_secs() as i64));
        inner.store.set_next_reconcile(resource.id, Some(next)).await?;

        inner
            .store
            .append_history(NewHistoryEntry {
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
                trigger_reason: trigger,
                drift_detected: false,
            })
            .await?;

        warn!(
            resource = %resource.name,
            retry_count,
            next_attempt = %next,
            error = message,
            "Reconciliation failed; backing off"
        );
        Ok(())
    }
    .await;

    if let Err(e) = result {
        warn!(resource = %resource.name, error = %e, "Failed to record failed attempt");
    }
    metrics::record_reconciliation_error(&resource.resource_type_name, duration);
}

/// Degrade a resource the scheduler cannot dispatch.
async fn mark_failed(inner: &SchedulerInner, resource: &Resource, reason: &str, message: &str) {
    let now = Utc::now();
    let result: Result<()> = async {
        let retry_count = inner.store.record_attempt(resource.id, false, now).await?;
        inner
            .store
            .update_status(resource.id, Phase::Failed, Some(message.to_string()), None)
            .await?;
        for condition in transition_conditions(
            &Transition::ReconcileFailed {
                reason: reason.to_string(),
                message: message.to_string(),
            },
            resource.generation,
        ) {
            inner.store.set_condition(resource.id, condition).await?;
        }
        let delay = backoff_delay(retry_count, inner.cfg.backoff_base, inner.cfg.backoff_cap);
        let next = now
            + chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(delay.as_secs() as i64));
        inner.store.set_next_reconcile(resource.id, Some(next)).await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        warn!(resource = %resource.name, error = %e, "Failed to degrade undispatchable resource");
    }
}

async fn run_destroy_attempt(inner: &SchedulerInner, resource: Resource) {
    let Some(reconciler) = inner.registry.reconciler_for(&resource.resource_type_name) else {
        // Nothing can destroy the external state; surface the cause and
        // leave the resource in deleting
        warn!(
            resource = %resource.name,
            resource_type = %resource.resource_type_name,
            "No reconciler registered for destroy path"
        );
        let _ = inner
            .store
            .update_status(
                resource.id,
                Phase::Deleting,
                Some("no reconciler registered for type".to_string()),
                None,
            )
            .await;
        return;
    };

    debug!(resource = %resource.name, "Starting destroy attempt");
    let started = Instant::now();
    let mut shutdown = inner.shutdown.clone();
    let outcome = tokio::select! {
        outcome = reconciler.cleanup(&resource, Arc::clone(&inner.ctx)) => outcome,
        _ = shutdown.changed() => {
            debug!(resource = %resource.name, "Destroy attempt canceled by shutdown");
            return;
        }
    };
    let duration = started.elapsed();

    let (success, error_message) = match outcome {
        Ok(()) => {
            // A successful destroy has removed the reconciler's own
            // finalizer; hard delete still fails while external finalizers
            // remain and the resource simply stays in deleting
            match inner.store.hard_delete_resource(resource.id).await {
                Ok(()) => {
                    info!(resource = %resource.name, "Resource destroyed and hard-deleted");
                    metrics::record_resource_deleted(&resource.resource_type_name);
                    let event = Event::for_resource(EventType::Reconciled, &resource);
                    inner.bus.publish(&event);
                    return;
                }
                Err(Error::FinalizersPresent(finalizers)) => {
                    debug!(
                        resource = %resource.name,
                        finalizers = ?finalizers,
                        "Hard delete blocked by remaining finalizers"
                    );
                    (true, None)
                }
                Err(e) => {
                    warn!(resource = %resource.name, error = %e, "Hard delete failed");
                    (false, Some(e.to_string()))
                }
            }
        }
        Err(e) => {
            // The destroy failed: the finalizer stays, the resource stays in
            // deleting, and the message explains why
            let message = e.to_string();
            let _ = inner
                .store
                .update_status(
                    resource.id,
                    Phase::Deleting,
                    Some(format!("destroy failed: {message}")),
                    None,
                )
                .await;
            (false, Some(message))
        }
    };

    let history = inner
        .store
        .append_history(NewHistoryEntry {
            resource_id: resource.id,
            generation: resource.generation,
            success,
            phase: Phase::Deleting,
            plan_output: None,
            apply_output: None,
            error_message,
            resources_created: 0,
            resources_updated: 0,
            resources_deleted: 0,
            duration_seconds: duration.as_secs_f64(),
            trigger_reason: TriggerReason::Delete,
            drift_detected: false,
        })
        .await;
    if let Err(e) = history {
        warn!(resource = %resource.name, error = %e, "Failed to record destroy attempt");
    }

    publish_reconciled(inner, resource.id).await;
}

/// Publish RECONCILED with the post-attempt resource document.
async fn publish_reconciled(inner: &SchedulerInner, id: i64) {
    match inner.store.get_resource_any(id).await {
        Ok(Some(resource)) => {
            let event = Event::for_resource(EventType::Reconciled, &resource);
            inner.bus.publish(&event);
        }
        Ok(None) => {}
        Err(e) => warn!(resource_id = id, error = %e, "Failed to load resource for RECONCILED event"),
    }
}
