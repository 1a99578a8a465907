// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Write gateway: the operation glue for every mutating API call.
//!
//! Each write runs the same pipeline: resolve the resource type, validate
//! the spec against its schema, assert a reconciler claims the type (CREATE
//! only), run the admission chain, perform the store mutation, and publish
//! the change event. CREATE additionally pre-inserts the claiming
//! reconciler's finalizer so deletion is always destroy-guarded.
//!
//! DELETE is soft-delete only; the scheduler drives the destroy path and the
//! eventual hard delete.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::admission::AdmissionChain;
use crate::errors::{Error, Result};
use crate::events::{Event, EventBus, EventType};
use crate::metrics;
use crate::model::{NewResource, Operation, Phase, Resource};
use crate::registry::ReconcilerRegistry;
use crate::status::{transition_conditions, Transition};
use crate::store::Store;
use crate::validator;

/// Client request to create a resource.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateResourceRequest {
    pub name: String,
    pub resource_type_name: String,
    pub resource_type_version: String,
    pub spec: Value,
}

/// Body of `PUT /resources/{id}/finalizers`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FinalizerPatch {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// The write-side façade over validator, admission chain, store, and bus.
pub struct WriteGateway {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    admission: AdmissionChain,
    registry: Arc<ReconcilerRegistry>,
}

impl WriteGateway {
    /// Build the gateway.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the admission HTTP client cannot be built.
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        registry: Arc<ReconcilerRegistry>,
    ) -> Result<Self> {
        let admission = AdmissionChain::new(Arc::clone(&store))?;
        Ok(Self {
            store,
            bus,
            admission,
            registry,
        })
    }

    /// CREATE: validate, admit, persist in `pending`, publish `CREATED`.
    pub async fn create_resource(&self, request: CreateResourceRequest) -> Result<Resource> {
        let resource_type = self
            .store
            .get_resource_type(&request.resource_type_name, &request.resource_type_version)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "resource type {}/{}",
                    request.resource_type_name, request.resource_type_version
                ))
            })?;

        let spec = validator::validate(&resource_type.schema, &request.spec)
            .map_err(Error::SchemaValidation)?;

        let reconciler = self
            .registry
            .reconciler_for(&request.resource_type_name)
            .ok_or_else(|| Error::NoReconcilerForType(request.resource_type_name.clone()))?;

        let admitted = self
            .admission
            .run(
                Operation::Create,
                &request.resource_type_name,
                &request.resource_type_version,
                json!({
                    "name": request.name,
                    "resource_type_name": request.resource_type_name,
                    "resource_type_version": request.resource_type_version,
                    "spec": spec,
                }),
                None,
            )
            .await?;
        let spec = admitted.get("spec").cloned().unwrap_or(Value::Null);

        let resource = self
            .store
            .create_resource(NewResource {
                name: request.name,
                resource_type_name: request.resource_type_name,
                resource_type_version: request.resource_type_version,
                spec,
                finalizers: vec![reconciler.name().to_string()],
            })
            .await?;

        info!(
            resource = %resource.name,
            resource_type = %resource.resource_type_name,
            id = resource.id,
            "Resource created"
        );
        metrics::record_resource_created(&resource.resource_type_name);
        self.bus
            .publish(&Event::for_resource(EventType::Created, &resource));
        Ok(resource)
    }

    /// UPDATE: validate, admit, replace the spec (generation bumps iff the
    /// canonical hash changed), publish `MODIFIED`.
    pub async fn replace_spec(&self, id: i64, spec: Value) -> Result<Resource> {
        let existing = self
            .store
            .get_resource(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        let resource_type = self
            .store
            .get_resource_type(
                &existing.resource_type_name,
                &existing.resource_type_version,
            )
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "resource type {}/{}",
                    existing.resource_type_name, existing.resource_type_version
                ))
            })?;

        let spec = validator::validate(&resource_type.schema, &spec)
            .map_err(Error::SchemaValidation)?;

        let old_doc = serde_json::to_value(&existing).map_err(Error::store)?;
        let mut new_doc = old_doc.clone();
        new_doc["spec"] = spec;

        let admitted = self
            .admission
            .run(
                Operation::Update,
                &existing.resource_type_name,
                &existing.resource_type_version,
                new_doc,
                Some(&old_doc),
            )
            .await?;
        let spec = admitted.get("spec").cloned().unwrap_or(Value::Null);

        let updated = self.store.update_resource_spec(id, spec).await?;
        debug!(
            resource = %updated.name,
            generation = updated.generation,
            "Resource spec replaced"
        );
        self.bus
            .publish(&Event::for_resource(EventType::Modified, &updated));
        Ok(updated)
    }

    /// DELETE: admit, soft-delete, start the deletion conditions, publish
    /// `DELETED`. The destroy path is the scheduler's job.
    pub async fn delete_resource(&self, id: i64) -> Result<Resource> {
        let existing = self
            .store
            .get_resource(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        let doc = serde_json::to_value(&existing).map_err(Error::store)?;
        self.admission
            .run(
                Operation::Delete,
                &existing.resource_type_name,
                &existing.resource_type_version,
                doc.clone(),
                Some(&doc),
            )
            .await?;

        let deleted = self.store.soft_delete_resource(id).await?;
        for condition in transition_conditions(&Transition::DeletionStarted, deleted.generation) {
            self.store.set_condition(id, condition).await?;
        }

        info!(resource = %deleted.name, id = deleted.id, "Resource soft-deleted");
        self.bus
            .publish(&Event::for_resource(EventType::Deleted, &deleted));
        Ok(deleted)
    }

    /// Finalizer PATCH: apply adds then removes, publish `MODIFIED`.
    ///
    /// Does not trigger reconciliation directly; a `deleting` resource that
    /// reaches an empty finalizer set is hard-deleted on the next tick.
    pub async fn patch_finalizers(&self, id: i64, patch: FinalizerPatch) -> Result<Resource> {
        // Visible on the deletion path too: finalizer edits are how external
        // controllers release a deleting resource
        self.store
            .get_resource_any(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        for name in &patch.add {
            self.store.add_finalizer(id, name).await?;
        }
        for name in &patch.remove {
            self.store.remove_finalizer(id, name).await?;
        }

        let updated = self
            .store
            .get_resource_any(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        debug!(
            resource = %updated.name,
            finalizers = ?updated.finalizers,
            "Finalizers patched"
        );
        self.bus
            .publish(&Event::for_resource(EventType::Modified, &updated));
        Ok(updated)
    }

    /// Manual trigger: requeue now unless an attempt is already in flight.
    pub async fn trigger_reconcile(&self, id: i64) -> Result<Resource> {
        let resource = self
            .store
            .get_resource(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;

        if resource.status == Phase::Reconciling {
            debug!(resource = %resource.name, "Manual trigger ignored; attempt in flight");
            return Ok(resource);
        }

        self.store.set_next_reconcile(id, Some(Utc::now())).await?;
        self.store
            .update_status(id, Phase::Pending, resource.status_message.clone(), None)
            .await?;
        let updated = self
            .store
            .get_resource(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        info!(resource = %updated.name, "Manual reconciliation triggered");
        Ok(updated)
    }
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod gateway_tests;
