// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! PostgreSQL store implementation.
//!
//! Production backend on a deadpool connection pool. Every mutation that
//! touches multiple invariants (finalizer edits, hard delete, spec update,
//! batch claiming) runs inside a single transaction, and batch claiming uses
//! `FOR UPDATE SKIP LOCKED` so two ticks never observe the same candidate.
//!
//! The schema is embedded as [`SCHEMA`] and applied by [`PgStore::migrate`].
//! The `locks` table is scaffolding for a future multi-node mode; nothing in
//! the single-node core reads or writes it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use tracing::info;

use crate::canonical::spec_hash;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::model::{
    AdmissionWebhook, Condition, FailurePolicy, HistoryEntry, NewAdmissionWebhook,
    NewHistoryEntry, NewResource, NewResourceType, Operation, Phase, Resource, ResourceType,
    ResourceTypeStatus, TriggerReason, WebhookType,
};
use crate::status::merge_condition;
use crate::store::Store;

/// Embedded schema, applied idempotently at startup.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS resource_types (
    id          BIGSERIAL PRIMARY KEY,
    name        TEXT NOT NULL,
    version     TEXT NOT NULL,
    schema      JSONB NOT NULL,
    description TEXT,
    status      TEXT NOT NULL DEFAULT 'active',
    metadata    JSONB NOT NULL DEFAULT '{}',
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS resources (
    id                    BIGSERIAL PRIMARY KEY,
    name                  TEXT NOT NULL UNIQUE,
    resource_type_name    TEXT NOT NULL,
    resource_type_version TEXT NOT NULL,
    spec                  JSONB NOT NULL,
    outputs               JSONB,
    finalizers            JSONB NOT NULL DEFAULT '[]',
    status                TEXT NOT NULL DEFAULT 'pending',
    status_message        TEXT,
    generation            BIGINT NOT NULL DEFAULT 1,
    observed_generation   BIGINT NOT NULL DEFAULT 0,
    spec_hash             TEXT NOT NULL,
    retry_count           INTEGER NOT NULL DEFAULT 0,
    last_reconcile_time   TIMESTAMPTZ,
    next_reconcile_time   TIMESTAMPTZ,
    conditions            JSONB NOT NULL DEFAULT '[]',
    created_at            TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT now(),
    deleted_at            TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_resources_status
    ON resources (status) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_resources_next_reconcile
    ON resources (next_reconcile_time) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_resources_type
    ON resources (resource_type_name, resource_type_version) WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS reconciliation_history (
    id                BIGSERIAL PRIMARY KEY,
    resource_id       BIGINT NOT NULL REFERENCES resources (id) ON DELETE CASCADE,
    generation        BIGINT NOT NULL,
    success           BOOLEAN NOT NULL,
    phase             TEXT NOT NULL,
    plan_output       TEXT,
    apply_output      TEXT,
    error_message     TEXT,
    resources_created INTEGER NOT NULL DEFAULT 0,
    resources_updated INTEGER NOT NULL DEFAULT 0,
    resources_deleted INTEGER NOT NULL DEFAULT 0,
    duration_seconds  DOUBLE PRECISION NOT NULL DEFAULT 0,
    trigger_reason    TEXT NOT NULL,
    drift_detected    BOOLEAN NOT NULL DEFAULT FALSE,
    reconcile_time    TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_history_resource
    ON reconciliation_history (resource_id, reconcile_time DESC);

CREATE TABLE IF NOT EXISTS admission_webhooks (
    id                    BIGSERIAL PRIMARY KEY,
    name                  TEXT NOT NULL UNIQUE,
    resource_type_name    TEXT,
    resource_type_version TEXT,
    webhook_url           TEXT NOT NULL,
    webhook_type          TEXT NOT NULL,
    operations            JSONB NOT NULL DEFAULT '[]',
    timeout_seconds       INTEGER NOT NULL DEFAULT 10,
    failure_policy        TEXT NOT NULL DEFAULT 'Fail',
    ordering              INTEGER NOT NULL DEFAULT 0,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- Reserved for a future multi-node mode; unused by the single-node core
CREATE TABLE IF NOT EXISTS locks (
    resource_key           TEXT PRIMARY KEY,
    holder_id              TEXT NOT NULL,
    acquired_at            TIMESTAMPTZ NOT NULL DEFAULT now(),
    lease_duration_seconds INTEGER NOT NULL DEFAULT 30
);
";

const RESOURCE_COLUMNS: &str = "id, name, resource_type_name, resource_type_version, spec, \
     outputs, finalizers, status, status_message, generation, observed_generation, spec_hash, \
     retry_count, last_reconcile_time, next_reconcile_time, conditions, created_at, updated_at, \
     deleted_at";

const WEBHOOK_COLUMNS: &str = "id, name, resource_type_name, resource_type_version, webhook_url, \
     webhook_type, operations, timeout_seconds, failure_policy, ordering, created_at, updated_at";

const HISTORY_COLUMNS: &str = "id, resource_id, generation, success, phase, plan_output, \
     apply_output, error_message, resources_created, resources_updated, resources_deleted, \
     duration_seconds, trigger_reason, drift_detected, reconcile_time";

/// PostgreSQL-backed [`Store`].
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Build a pooled store from the runtime configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` when the pool cannot be constructed.
    pub fn connect(cfg: &Config) -> Result<Self> {
        let mut pool_cfg = PoolConfig::new();
        pool_cfg.host = Some(cfg.db_host.clone());
        pool_cfg.port = Some(cfg.db_port);
        pool_cfg.dbname = Some(cfg.db_name.clone());
        pool_cfg.user = Some(cfg.db_user.clone());
        pool_cfg.password = Some(cfg.db_password.clone());
        pool_cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = pool_cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(Error::store)?;
        Ok(Self { pool })
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        info!("Database schema applied");
        Ok(())
    }
}

fn resource_from_row(row: &Row) -> Result<Resource> {
    let status: String = row.get("status");
    let finalizers: Value = row.get("finalizers");
    let conditions: Value = row.get("conditions");

    Ok(Resource {
        id: row.get("id"),
        name: row.get("name"),
        resource_type_name: row.get("resource_type_name"),
        resource_type_version: row.get("resource_type_version"),
        spec: row.get("spec"),
        outputs: row.get("outputs"),
        finalizers: serde_json::from_value(finalizers).map_err(Error::store)?,
        status: Phase::parse(&status).ok_or_else(|| Error::Store(format!("bad phase {status}")))?,
        status_message: row.get("status_message"),
        generation: row.get("generation"),
        observed_generation: row.get("observed_generation"),
        spec_hash: row.get("spec_hash"),
        retry_count: row.get("retry_count"),
        last_reconcile_time: row.get("last_reconcile_time"),
        next_reconcile_time: row.get("next_reconcile_time"),
        conditions: serde_json::from_value(conditions).map_err(Error::store)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

fn resource_type_from_row(row: &Row) -> Result<ResourceType> {
    let status: String = row.get("status");
    let status = match status.as_str() {
        "active" => ResourceTypeStatus::Active,
        "deprecated" => ResourceTypeStatus::Deprecated,
        other => return Err(Error::Store(format!("bad resource type status {other}"))),
    };

    Ok(ResourceType {
        id: row.get("id"),
        name: row.get("name"),
        version: row.get("version"),
        schema: row.get("schema"),
        description: row.get("description"),
        status,
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn webhook_from_row(row: &Row) -> Result<AdmissionWebhook> {
    let webhook_type: String = row.get("webhook_type");
    let failure_policy: String = row.get("failure_policy");
    let operations: Value = row.get("operations");

    Ok(AdmissionWebhook {
        id: row.get("id"),
        name: row.get("name"),
        resource_type_name: row.get("resource_type_name"),
        resource_type_version: row.get("resource_type_version"),
        webhook_url: row.get("webhook_url"),
        webhook_type: WebhookType::parse(&webhook_type)
            .ok_or_else(|| Error::Store(format!("bad webhook type {webhook_type}")))?,
        operations: serde_json::from_value(operations).map_err(Error::store)?,
        timeout_seconds: row.get("timeout_seconds"),
        failure_policy: FailurePolicy::parse(&failure_policy)
            .ok_or_else(|| Error::Store(format!("bad failure policy {failure_policy}")))?,
        ordering: row.get("ordering"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn history_from_row(row: &Row) -> Result<HistoryEntry> {
    let phase: String = row.get("phase");
    let trigger: String = row.get("trigger_reason");

    Ok(HistoryEntry {
        id: row.get("id"),
        resource_id: row.get("resource_id"),
        generation: row.get("generation"),
        success: row.get("success"),
        phase: Phase::parse(&phase).ok_or_else(|| Error::Store(format!("bad phase {phase}")))?,
        plan_output: row.get("plan_output"),
        apply_output: row.get("apply_output"),
        error_message: row.get("error_message"),
        resources_created: row.get("resources_created"),
        resources_updated: row.get("resources_updated"),
        resources_deleted: row.get("resources_deleted"),
        duration_seconds: row.get("duration_seconds"),
        trigger_reason: TriggerReason::parse(&trigger)
            .ok_or_else(|| Error::Store(format!("bad trigger reason {trigger}")))?,
        drift_detected: row.get("drift_detected"),
        reconcile_time: row.get("reconcile_time"),
    })
}

fn operations_json(operations: &[Operation]) -> Value {
    serde_json::to_value(operations).unwrap_or_else(|_| Value::Array(Vec::new()))
}

fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_resource_type(&self, rt: NewResourceType) -> Result<ResourceType> {
        let client = self.pool.get().await?;
        let status = match rt.status {
            ResourceTypeStatus::Active => "active",
            ResourceTypeStatus::Deprecated => "deprecated",
        };
        let row = client
            .query_one(
                "INSERT INTO resource_types (name, version, schema, description, status, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (name, version) DO UPDATE
                 SET schema = EXCLUDED.schema, description = EXCLUDED.description,
                     status = EXCLUDED.status, metadata = EXCLUDED.metadata, updated_at = now()
                 RETURNING id, name, version, schema, description, status, metadata,
                           created_at, updated_at",
                &[
                    &rt.name,
                    &rt.version,
                    &rt.schema,
                    &rt.description,
                    &status,
                    &rt.metadata,
                ],
            )
            .await?;
        resource_type_from_row(&row)
    }

    async fn get_resource_type(&self, name: &str, version: &str) -> Result<Option<ResourceType>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, name, version, schema, description, status, metadata,
                        created_at, updated_at
                 FROM resource_types WHERE name = $1 AND version = $2",
                &[&name, &version],
            )
            .await?;
        row.as_ref().map(resource_type_from_row).transpose()
    }

    async fn get_resource_type_by_id(&self, id: i64) -> Result<Option<ResourceType>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, name, version, schema, description, status, metadata,
                        created_at, updated_at
                 FROM resource_types WHERE id = $1",
                &[&id],
            )
            .await?;
        row.as_ref().map(resource_type_from_row).transpose()
    }

    async fn list_resource_types(&self, name: Option<&str>) -> Result<Vec<ResourceType>> {
        let client = self.pool.get().await?;
        let rows = match name {
            Some(name) => {
                client
                    .query(
                        "SELECT id, name, version, schema, description, status, metadata,
                                created_at, updated_at
                         FROM resource_types WHERE name = $1 ORDER BY id",
                        &[&name],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        "SELECT id, name, version, schema, description, status, metadata,
                                created_at, updated_at
                         FROM resource_types ORDER BY id",
                        &[],
                    )
                    .await?
            }
        };
        rows.iter().map(resource_type_from_row).collect()
    }

    async fn delete_resource_type(&self, name: &str, version: &str) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let referenced: i64 = tx
            .query_one(
                "SELECT count(*) FROM resources
                 WHERE resource_type_name = $1 AND resource_type_version = $2
                   AND deleted_at IS NULL",
                &[&name, &version],
            )
            .await?
            .get(0);
        if referenced > 0 {
            return Err(Error::Conflict(format!(
                "resource type {name}/{version} is still referenced by resources"
            )));
        }

        let deleted = tx
            .execute(
                "DELETE FROM resource_types WHERE name = $1 AND version = $2",
                &[&name, &version],
            )
            .await?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("resource type {name}/{version}")));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn create_resource(&self, new: NewResource) -> Result<Resource> {
        let client = self.pool.get().await?;
        let hash = spec_hash(&new.spec);
        let finalizers =
            serde_json::to_value(&new.finalizers).unwrap_or_else(|_| Value::Array(Vec::new()));

        let row = client
            .query_one(
                format!(
                    "INSERT INTO resources
                         (name, resource_type_name, resource_type_version, spec, spec_hash,
                          finalizers, status)
                     VALUES ($1, $2, $3, $4, $5, $6, 'pending')
                     RETURNING {RESOURCE_COLUMNS}"
                ).as_str(),
                &[
                    &new.name,
                    &new.resource_type_name,
                    &new.resource_type_version,
                    &new.spec,
                    &hash,
                    &finalizers,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("resource name '{}' already exists", new.name))
                } else {
                    Error::from(e)
                }
            })?;
        resource_from_row(&row)
    }

    async fn get_resource(&self, id: i64) -> Result<Option<Resource>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = $1 AND deleted_at IS NULL").as_str(),
                &[&id],
            )
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn get_resource_any(&self, id: i64) -> Result<Option<Resource>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = $1").as_str(),
                &[&id],
            )
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn get_resource_by_name(
        &self,
        type_name: &str,
        type_version: &str,
        name: &str,
    ) -> Result<Option<Resource>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources
                     WHERE resource_type_name = $1 AND resource_type_version = $2
                       AND name = $3 AND deleted_at IS NULL"
                ).as_str(),
                &[&type_name, &type_version, &name],
            )
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn list_resources(
        &self,
        type_name: Option<&str>,
        type_version: Option<&str>,
    ) -> Result<Vec<Resource>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources
                     WHERE deleted_at IS NULL
                       AND ($1::text IS NULL OR resource_type_name = $1)
                       AND ($2::text IS NULL OR resource_type_version = $2)
                     ORDER BY id"
                ).as_str(),
                &[&type_name, &type_version],
            )
            .await?;
        rows.iter().map(resource_from_row).collect()
    }

    async fn update_resource_spec(&self, id: i64, new_spec: Value) -> Result<Resource> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT spec_hash FROM resources
                 WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        let old_hash: String = row.get("spec_hash");
        let new_hash = spec_hash(&new_spec);

        let row = if new_hash == old_hash {
            tx.query_one(
                format!(
                    "UPDATE resources SET spec = $2, updated_at = now()
                     WHERE id = $1 RETURNING {RESOURCE_COLUMNS}"
                ).as_str(),
                &[&id, &new_spec],
            )
            .await?
        } else {
            tx.query_one(
                format!(
                    "UPDATE resources
                     SET spec = $2, spec_hash = $3, generation = generation + 1,
                         status = 'pending', next_reconcile_time = NULL, updated_at = now()
                     WHERE id = $1 RETURNING {RESOURCE_COLUMNS}"
                ).as_str(),
                &[&id, &new_spec, &new_hash],
            )
            .await?
        };
        let resource = resource_from_row(&row)?;
        tx.commit().await?;
        Ok(resource)
    }

    async fn soft_delete_resource(&self, id: i64) -> Result<Resource> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!(
                    "UPDATE resources
                     SET deleted_at = COALESCE(deleted_at, now()), status = 'deleting',
                         updated_at = now()
                     WHERE id = $1 RETURNING {RESOURCE_COLUMNS}"
                ).as_str(),
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        resource_from_row(&row)
    }

    async fn hard_delete_resource(&self, id: i64) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT deleted_at, finalizers FROM resources WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        let deleted_at: Option<DateTime<Utc>> = row.get("deleted_at");
        let finalizers: Vec<String> =
            serde_json::from_value(row.get::<_, Value>("finalizers")).map_err(Error::store)?;

        if deleted_at.is_none() {
            return Err(Error::Conflict(format!("resource {id} is not soft-deleted")));
        }
        if !finalizers.is_empty() {
            return Err(Error::FinalizersPresent(finalizers));
        }

        tx.execute("DELETE FROM resources WHERE id = $1", &[&id]).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_finalizer(&self, id: i64, name: &str) -> Result<Vec<String>> {
        self.edit_finalizers(id, |finalizers| {
            if !finalizers.iter().any(|f| f == name) {
                finalizers.push(name.to_string());
            }
        })
        .await
    }

    async fn remove_finalizer(&self, id: i64, name: &str) -> Result<Vec<String>> {
        self.edit_finalizers(id, |finalizers| finalizers.retain(|f| f != name))
            .await
    }

    async fn get_finalizers(&self, id: i64) -> Result<Vec<String>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT finalizers FROM resources WHERE id = $1", &[&id])
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        serde_json::from_value(row.get::<_, Value>("finalizers")).map_err(Error::store)
    }

    async fn update_status(
        &self,
        id: i64,
        phase: Phase,
        message: Option<String>,
        observed_generation: Option<i64>,
    ) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE resources
                 SET status = $2, status_message = $3,
                     observed_generation = COALESCE($4, observed_generation),
                     updated_at = now()
                 WHERE id = $1",
                &[&id, &phase.as_str(), &message, &observed_generation],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("resource {id}")));
        }
        Ok(())
    }

    async fn set_condition(&self, id: i64, condition: Condition) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT conditions FROM resources WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        let mut conditions: Vec<Condition> =
            serde_json::from_value(row.get::<_, Value>("conditions")).map_err(Error::store)?;

        merge_condition(&mut conditions, condition);
        let conditions = serde_json::to_value(&conditions).map_err(Error::store)?;

        tx.execute(
            "UPDATE resources SET conditions = $2, updated_at = now() WHERE id = $1",
            &[&id, &conditions],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_outputs(&self, id: i64, outputs: Value) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE resources SET outputs = $2, updated_at = now() WHERE id = $1",
                &[&id, &outputs],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("resource {id}")));
        }
        Ok(())
    }

    async fn set_next_reconcile(&self, id: i64, at: Option<DateTime<Utc>>) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE resources SET next_reconcile_time = $2, updated_at = now() WHERE id = $1",
                &[&id, &at],
            )
            .await?;
        if updated == 0 {
            return Err(Error::NotFound(format!("resource {id}")));
        }
        Ok(())
    }

    async fn record_attempt(&self, id: i64, success: bool, now: DateTime<Utc>) -> Result<i32> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE resources
                 SET last_reconcile_time = $2,
                     retry_count = CASE WHEN $3 THEN 0 ELSE retry_count + 1 END,
                     updated_at = $2
                 WHERE id = $1 RETURNING retry_count",
                &[&id, &now, &success],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        Ok(row.get("retry_count"))
    }

    async fn claim_reconcile_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        drift_interval: Duration,
    ) -> Result<Vec<i64>> {
        let client = self.pool.get().await?;
        let drift_cutoff = now - drift_interval;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = client
            .query(
                "WITH eligible AS (
                     SELECT id FROM resources
                     WHERE (deleted_at IS NULL AND (
                               status = 'pending'
                            OR (status = 'failed' AND next_reconcile_time <= $1)
                            OR (status = 'ready'
                                AND (generation > observed_generation
                                     OR last_reconcile_time <= $2))))
                        OR (deleted_at IS NOT NULL AND status = 'deleting')
                     ORDER BY id
                     LIMIT $3
                     FOR UPDATE SKIP LOCKED
                 )
                 UPDATE resources r
                 SET status = CASE WHEN r.deleted_at IS NULL THEN 'reconciling' ELSE r.status END,
                     updated_at = $1
                 FROM eligible e
                 WHERE r.id = e.id
                 RETURNING r.id",
                &[&now, &drift_cutoff, &limit],
            )
            .await?;
        let mut ids: Vec<i64> = rows.iter().map(|row| row.get(0)).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn resources_needing_reconciliation(
        &self,
        types: &[String],
        limit: usize,
        now: DateTime<Utc>,
        drift_interval: Duration,
    ) -> Result<Vec<Resource>> {
        let client = self.pool.get().await?;
        let drift_cutoff = now - drift_interval;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let types: Vec<&str> = types.iter().map(String::as_str).collect();

        let rows = client
            .query(
                format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources
                     WHERE (cardinality($4::text[]) = 0 OR resource_type_name = ANY($4))
                       AND ((deleted_at IS NULL AND (
                                 status = 'pending'
                              OR (status = 'failed' AND next_reconcile_time <= $1)
                              OR (status = 'ready'
                                  AND (generation > observed_generation
                                       OR last_reconcile_time <= $2))))
                          OR (deleted_at IS NOT NULL AND status = 'deleting'))
                     ORDER BY id
                     LIMIT $3"
                ).as_str(),
                &[&now, &drift_cutoff, &limit, &types],
            )
            .await?;
        rows.iter().map(resource_from_row).collect()
    }

    async fn append_history(&self, entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                format!(
                    "INSERT INTO reconciliation_history
                         (resource_id, generation, success, phase, plan_output, apply_output,
                          error_message, resources_created, resources_updated, resources_deleted,
                          duration_seconds, trigger_reason, drift_detected)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                     RETURNING {HISTORY_COLUMNS}"
                ).as_str(),
                &[
                    &entry.resource_id,
                    &entry.generation,
                    &entry.success,
                    &entry.phase.as_str(),
                    &entry.plan_output,
                    &entry.apply_output,
                    &entry.error_message,
                    &entry.resources_created,
                    &entry.resources_updated,
                    &entry.resources_deleted,
                    &entry.duration_seconds,
                    &entry.trigger_reason.as_str(),
                    &entry.drift_detected,
                ],
            )
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
                    Error::NotFound(format!("resource {}", entry.resource_id))
                } else {
                    Error::from(e)
                }
            })?;
        history_from_row(&row)
    }

    async fn list_history(
        &self,
        resource_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryEntry>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {HISTORY_COLUMNS} FROM reconciliation_history
                     WHERE resource_id = $1
                     ORDER BY reconcile_time DESC, id DESC
                     LIMIT $2 OFFSET $3"
                ).as_str(),
                &[&resource_id, &limit, &offset],
            )
            .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn create_webhook(&self, new: NewAdmissionWebhook) -> Result<AdmissionWebhook> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                format!(
                    "INSERT INTO admission_webhooks
                         (name, resource_type_name, resource_type_version, webhook_url,
                          webhook_type, operations, timeout_seconds, failure_policy, ordering)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     RETURNING {WEBHOOK_COLUMNS}"
                ).as_str(),
                &[
                    &new.name,
                    &new.resource_type_name,
                    &new.resource_type_version,
                    &new.webhook_url,
                    &new.webhook_type.as_str(),
                    &operations_json(&new.operations),
                    &new.timeout_seconds,
                    &new.failure_policy.as_str(),
                    &new.ordering,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("webhook name '{}' already exists", new.name))
                } else {
                    Error::from(e)
                }
            })?;
        webhook_from_row(&row)
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<AdmissionWebhook>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {WEBHOOK_COLUMNS} FROM admission_webhooks WHERE id = $1").as_str(),
                &[&id],
            )
            .await?;
        row.as_ref().map(webhook_from_row).transpose()
    }

    async fn list_webhooks(&self) -> Result<Vec<AdmissionWebhook>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {WEBHOOK_COLUMNS} FROM admission_webhooks ORDER BY ordering, id"
                ).as_str(),
                &[],
            )
            .await?;
        rows.iter().map(webhook_from_row).collect()
    }

    async fn update_webhook(&self, id: i64, new: NewAdmissionWebhook) -> Result<AdmissionWebhook> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!(
                    "UPDATE admission_webhooks
                     SET name = $2, resource_type_name = $3, resource_type_version = $4,
                         webhook_url = $5, webhook_type = $6, operations = $7,
                         timeout_seconds = $8, failure_policy = $9, ordering = $10,
                         updated_at = now()
                     WHERE id = $1 RETURNING {WEBHOOK_COLUMNS}"
                ).as_str(),
                &[
                    &id,
                    &new.name,
                    &new.resource_type_name,
                    &new.resource_type_version,
                    &new.webhook_url,
                    &new.webhook_type.as_str(),
                    &operations_json(&new.operations),
                    &new.timeout_seconds,
                    &new.failure_policy.as_str(),
                    &new.ordering,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("webhook name '{}' already exists", new.name))
                } else {
                    Error::from(e)
                }
            })?
            .ok_or_else(|| Error::NotFound(format!("webhook {id}")))?;
        webhook_from_row(&row)
    }

    async fn delete_webhook(&self, id: i64) -> Result<()> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM admission_webhooks WHERE id = $1", &[&id])
            .await?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("webhook {id}")));
        }
        Ok(())
    }

    async fn list_webhooks_for(
        &self,
        type_name: &str,
        type_version: &str,
        operation: Operation,
        webhook_type: WebhookType,
    ) -> Result<Vec<AdmissionWebhook>> {
        let client = self.pool.get().await?;
        let operation = serde_json::json!([operation.as_str()]);
        let rows = client
            .query(
                format!(
                    "SELECT {WEBHOOK_COLUMNS} FROM admission_webhooks
                     WHERE webhook_type = $1
                       AND operations @> $2
                       AND (resource_type_name IS NULL
                            OR (resource_type_name = $3
                                AND (resource_type_version IS NULL
                                     OR resource_type_version = $4)))
                     ORDER BY ordering, id"
                ).as_str(),
                &[&webhook_type.as_str(), &operation, &type_name, &type_version],
            )
            .await?;
        rows.iter().map(webhook_from_row).collect()
    }
}

impl PgStore {
    /// Read-modify-write a finalizer set inside one transaction.
    async fn edit_finalizers<F>(&self, id: i64, edit: F) -> Result<Vec<String>>
    where
        F: FnOnce(&mut Vec<String>) + Send,
    {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT finalizers FROM resources WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("resource {id}")))?;
        let mut finalizers: Vec<String> =
            serde_json::from_value(row.get::<_, Value>("finalizers")).map_err(Error::store)?;

        edit(&mut finalizers);
        let encoded = serde_json::to_value(&finalizers).map_err(Error::store)?;

        tx.execute(
            "UPDATE resources SET finalizers = $2, updated_at = now() WHERE id = $1",
            &[&id, &encoded],
        )
        .await?;
        tx.commit().await?;
        Ok(finalizers)
    }
}
