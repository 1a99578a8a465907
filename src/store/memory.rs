// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! In-process store implementation.
//!
//! Backs the `memory` store backend and the test suite. A single
//! `tokio::sync::RwLock` guards all state, so every mutation observes and
//! publishes a consistent snapshot, matching the transactional guarantees of
//! the PostgreSQL backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::canonical::spec_hash;
use crate::errors::{Error, Result};
use crate::model::{
    AdmissionWebhook, Condition, HistoryEntry, NewAdmissionWebhook, NewHistoryEntry, NewResource,
    NewResourceType, Operation, Phase, Resource, ResourceType, WebhookType,
};
use crate::status::merge_condition;
use crate::store::Store;

#[derive(Default)]
struct MemInner {
    next_type_id: i64,
    next_resource_id: i64,
    next_history_id: i64,
    next_webhook_id: i64,
    types: HashMap<(String, String), ResourceType>,
    resources: HashMap<i64, Resource>,
    history: Vec<HistoryEntry>,
    webhooks: HashMap<i64, AdmissionWebhook>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<MemInner>,
}

impl MemStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn live<'a>(resources: &'a HashMap<i64, Resource>) -> impl Iterator<Item = &'a Resource> {
    resources.values().filter(|r| r.deleted_at.is_none())
}

fn webhook_from_new(id: i64, new: NewAdmissionWebhook, created_at: DateTime<Utc>) -> AdmissionWebhook {
    AdmissionWebhook {
        id,
        name: new.name,
        resource_type_name: new.resource_type_name,
        resource_type_version: new.resource_type_version,
        webhook_url: new.webhook_url,
        webhook_type: new.webhook_type,
        operations: new.operations,
        timeout_seconds: new.timeout_seconds,
        failure_policy: new.failure_policy,
        ordering: new.ordering,
        created_at,
        updated_at: Utc::now(),
    }
}

#[async_trait]
impl Store for MemStore {
    async fn upsert_resource_type(&self, rt: NewResourceType) -> Result<ResourceType> {
        let mut inner = self.inner.write().await;
        let key = (rt.name.clone(), rt.version.clone());
        let now = Utc::now();

        if let Some(existing) = inner.types.get_mut(&key) {
            existing.schema = rt.schema;
            existing.description = rt.description;
            existing.status = rt.status;
            existing.metadata = rt.metadata;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        inner.next_type_id += 1;
        let stored = ResourceType {
            id: inner.next_type_id,
            name: rt.name,
            version: rt.version,
            schema: rt.schema,
            description: rt.description,
            status: rt.status,
            metadata: rt.metadata,
            created_at: now,
            updated_at: now,
        };
        inner.types.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_resource_type(&self, name: &str, version: &str) -> Result<Option<ResourceType>> {
        let inner = self.inner.read().await;
        Ok(inner
            .types
            .get(&(name.to_string(), version.to_string()))
            .cloned())
    }

    async fn get_resource_type_by_id(&self, id: i64) -> Result<Option<ResourceType>> {
        let inner = self.inner.read().await;
        Ok(inner.types.values().find(|rt| rt.id == id).cloned())
    }

    async fn list_resource_types(&self, name: Option<&str>) -> Result<Vec<ResourceType>> {
        let inner = self.inner.read().await;
        let mut types: Vec<ResourceType> = inner
            .types
            .values()
            .filter(|rt| name.is_none_or(|n| rt.name == n))
            .cloned()
            .collect();
        types.sort_by_key(|rt| rt.id);
        Ok(types)
    }

    async fn delete_resource_type(&self, name: &str, version: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (name.to_string(), version.to_string());
        if !inner.types.contains_key(&key) {
            return Err(Error::NotFound(format!("resource type {name}/{version}")));
        }

        let referenced = live(&inner.resources)
            .any(|r| r.resource_type_name == name && r.resource_type_version == version);
        if referenced {
            return Err(Error::Conflict(format!(
                "resource type {name}/{version} is still referenced by resources"
            )));
        }

        inner.types.remove(&key);
        Ok(())
    }

    async fn create_resource(&self, new: NewResource) -> Result<Resource> {
        let mut inner = self.inner.write().await;

        if live(&inner.resources).any(|r| r.name == new.name) {
            return Err(Error::Conflict(format!(
                "resource name '{}' already exists",
                new.name
            )));
        }

        inner.next_resource_id += 1;
        let now = Utc::now();
        let resource = Resource {
            id: inner.next_resource_id,
            name: new.name,
            resource_type_name: new.resource_type_name,
            resource_type_version: new.resource_type_version,
            spec_hash: spec_hash(&new.spec),
            spec: new.spec,
            outputs: None,
            finalizers: new.finalizers,
            status: Phase::Pending,
            status_message: None,
            generation: 1,
            observed_generation: 0,
            retry_count: 0,
            last_reconcile_time: None,
            next_reconcile_time: None,
            conditions: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.resources.insert(resource.id, resource.clone());
        Ok(resource)
    }

    async fn get_resource(&self, id: i64) -> Result<Option<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner
            .resources
            .get(&id)
            .filter(|r| r.deleted_at.is_none())
            .cloned())
    }

    async fn get_resource_any(&self, id: i64) -> Result<Option<Resource>> {
        let inner = self.inner.read().await;
        Ok(inner.resources.get(&id).cloned())
    }

    async fn get_resource_by_name(
        &self,
        type_name: &str,
        type_version: &str,
        name: &str,
    ) -> Result<Option<Resource>> {
        let inner = self.inner.read().await;
        let result = live(&inner.resources)
            .find(|r| {
                r.resource_type_name == type_name
                    && r.resource_type_version == type_version
                    && r.name == name
            })
            .cloned();
        Ok(result)
    }

    async fn list_resources(
        &self,
        type_name: Option<&str>,
        type_version: Option<&str>,
    ) -> Result<Vec<Resource>> {
        let inner = self.inner.read().await;
        let mut resources: Vec<Resource> = live(&inner.resources)
            .filter(|r| type_name.is_none_or(|n| r.resource_type_name == n))
            .filter(|r| type_version.is_none_or(|v| r.resource_type_version == v))
            .cloned()
            .collect();
        resources.sort_by_key(|r| r.id);
        Ok(resources)
    }

    async fn update_resource_spec(&self, id: i64, new_spec: Value) -> Result<Resource> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get_mut(&id)
            .filter(|r| r.deleted_at.is_none())
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        let new_hash = spec_hash(&new_spec);
        resource.spec = new_spec;
        resource.updated_at = Utc::now();
        if new_hash != resource.spec_hash {
            resource.spec_hash = new_hash;
            resource.generation += 1;
            resource.status = Phase::Pending;
            resource.next_reconcile_time = None;
        }
        Ok(resource.clone())
    }

    async fn soft_delete_resource(&self, id: i64) -> Result<Resource> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        if resource.deleted_at.is_none() {
            resource.deleted_at = Some(Utc::now());
            resource.status = Phase::Deleting;
            resource.updated_at = Utc::now();
        }
        Ok(resource.clone())
    }

    async fn hard_delete_resource(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        if resource.deleted_at.is_none() {
            return Err(Error::Conflict(format!("resource {id} is not soft-deleted")));
        }
        if !resource.finalizers.is_empty() {
            return Err(Error::FinalizersPresent(resource.finalizers.clone()));
        }

        inner.resources.remove(&id);
        inner.history.retain(|h| h.resource_id != id);
        Ok(())
    }

    async fn add_finalizer(&self, id: i64, name: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        if !resource.finalizers.iter().any(|f| f == name) {
            resource.finalizers.push(name.to_string());
            resource.updated_at = Utc::now();
        }
        Ok(resource.finalizers.clone())
    }

    async fn remove_finalizer(&self, id: i64, name: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        let before = resource.finalizers.len();
        resource.finalizers.retain(|f| f != name);
        if resource.finalizers.len() != before {
            resource.updated_at = Utc::now();
        }
        Ok(resource.finalizers.clone())
    }

    async fn get_finalizers(&self, id: i64) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        inner
            .resources
            .get(&id)
            .map(|r| r.finalizers.clone())
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))
    }

    async fn update_status(
        &self,
        id: i64,
        phase: Phase,
        message: Option<String>,
        observed_generation: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        resource.status = phase;
        resource.status_message = message;
        if let Some(observed) = observed_generation {
            resource.observed_generation = observed;
        }
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn set_condition(&self, id: i64, condition: Condition) -> Result<()> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        merge_condition(&mut resource.conditions, condition);
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn set_outputs(&self, id: i64, outputs: Value) -> Result<()> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        resource.outputs = Some(outputs);
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn set_next_reconcile(&self, id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        resource.next_reconcile_time = at;
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn record_attempt(&self, id: i64, success: bool, now: DateTime<Utc>) -> Result<i32> {
        let mut inner = self.inner.write().await;
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        resource.last_reconcile_time = Some(now);
        resource.retry_count = if success { 0 } else { resource.retry_count + 1 };
        resource.updated_at = now;
        Ok(resource.retry_count)
    }

    async fn claim_reconcile_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        drift_interval: Duration,
    ) -> Result<Vec<i64>> {
        let mut inner = self.inner.write().await;
        let mut eligible: Vec<i64> = inner
            .resources
            .values()
            .filter(|r| r.needs_reconcile(now, drift_interval))
            .map(|r| r.id)
            .collect();
        eligible.sort_unstable();
        eligible.truncate(limit);

        for id in &eligible {
            if let Some(resource) = inner.resources.get_mut(id) {
                // The destroy path keeps its phase; live claims flip to
                // reconciling so a second tick cannot observe them
                if resource.deleted_at.is_none() {
                    resource.status = Phase::Reconciling;
                    resource.updated_at = now;
                }
            }
        }
        Ok(eligible)
    }

    async fn resources_needing_reconciliation(
        &self,
        types: &[String],
        limit: usize,
        now: DateTime<Utc>,
        drift_interval: Duration,
    ) -> Result<Vec<Resource>> {
        let inner = self.inner.read().await;
        let mut matches: Vec<Resource> = inner
            .resources
            .values()
            .filter(|r| types.is_empty() || types.contains(&r.resource_type_name))
            .filter(|r| r.needs_reconcile(now, drift_interval))
            .cloned()
            .collect();
        matches.sort_by_key(|r| r.id);
        matches.truncate(limit);
        Ok(matches)
    }

    async fn append_history(&self, entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let mut inner = self.inner.write().await;
        if !inner.resources.contains_key(&entry.resource_id) {
            return Err(Error::NotFound(format!("resource {}", entry.resource_id)));
        }

        inner.next_history_id += 1;
        let stored = HistoryEntry {
            id: inner.next_history_id,
            resource_id: entry.resource_id,
            generation: entry.generation,
            success: entry.success,
            phase: entry.phase,
            plan_output: entry.plan_output,
            apply_output: entry.apply_output,
            error_message: entry.error_message,
            resources_created: entry.resources_created,
            resources_updated: entry.resources_updated,
            resources_deleted: entry.resources_deleted,
            duration_seconds: entry.duration_seconds,
            trigger_reason: entry.trigger_reason,
            drift_detected: entry.drift_detected,
            reconcile_time: Utc::now(),
        };
        inner.history.push(stored.clone());
        Ok(stored)
    }

    async fn list_history(
        &self,
        resource_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryEntry>> {
        let inner = self.inner.read().await;
        let mut entries: Vec<HistoryEntry> = inner
            .history
            .iter()
            .filter(|h| h.resource_id == resource_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.reconcile_time.cmp(&a.reconcile_time).then(b.id.cmp(&a.id)));
        Ok(entries
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn create_webhook(&self, new: NewAdmissionWebhook) -> Result<AdmissionWebhook> {
        let mut inner = self.inner.write().await;
        if inner.webhooks.values().any(|w| w.name == new.name) {
            return Err(Error::Conflict(format!(
                "webhook name '{}' already exists",
                new.name
            )));
        }

        inner.next_webhook_id += 1;
        let stored = webhook_from_new(inner.next_webhook_id, new, Utc::now());
        inner.webhooks.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<AdmissionWebhook>> {
        let inner = self.inner.read().await;
        Ok(inner.webhooks.get(&id).cloned())
    }

    async fn list_webhooks(&self) -> Result<Vec<AdmissionWebhook>> {
        let inner = self.inner.read().await;
        let mut webhooks: Vec<AdmissionWebhook> = inner.webhooks.values().cloned().collect();
        webhooks.sort_by_key(|w| (w.ordering, w.id));
        Ok(webhooks)
    }

    async fn update_webhook(&self, id: i64, new: NewAdmissionWebhook) -> Result<AdmissionWebhook> {
        let mut inner = self.inner.write().await;
        if inner
            .webhooks
            .values()
            .any(|w| w.id != id && w.name == new.name)
        {
            return Err(Error::Conflict(format!(
                "webhook name '{}' already exists",
                new.name
            )));
        }
        let existing = inner
            .webhooks
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("webhook {id}")))?;

        let stored = webhook_from_new(id, new, existing.created_at);
        inner.webhooks.insert(id, stored.clone());
        Ok(stored)
    }

    async fn delete_webhook(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .webhooks
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("webhook {id}")))
    }

    async fn list_webhooks_for(
        &self,
        type_name: &str,
        type_version: &str,
        operation: Operation,
        webhook_type: WebhookType,
    ) -> Result<Vec<AdmissionWebhook>> {
        let inner = self.inner.read().await;
        let mut webhooks: Vec<AdmissionWebhook> = inner
            .webhooks
            .values()
            .filter(|w| w.matches(type_name, type_version, operation, webhook_type))
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| (w.ordering, w.id));
        Ok(webhooks)
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod memory_tests;
