// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for `registry.rs`

#[cfg(test)]
mod tests {
    use super::super::{
        ActionPlugin, ReconcileOutcome, Reconciler, ReconcilerContext, ReconcilerRegistry,
    };
    use crate::errors::Error;
    use crate::model::{NewResource, Phase, Resource, TriggerReason};
    use crate::status::{find_condition, CONDITION_READY};
    use crate::store::memory::MemStore;
    use crate::store::Store;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    struct NoopReconciler {
        name: String,
        types: Vec<String>,
        started: AtomicUsize,
    }

    impl NoopReconciler {
        fn new(name: &str, types: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                types: types.iter().map(ToString::to_string).collect(),
                started: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Reconciler for NoopReconciler {
        fn name(&self) -> &str {
            &self.name
        }

        fn resource_types(&self) -> Vec<String> {
            self.types.clone()
        }

        async fn start(&self, ctx: Arc<ReconcilerContext>) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let mut shutdown = ctx.shutdown_event();
            let _ = shutdown.changed().await;
            Ok(())
        }

        async fn reconcile(
            &self,
            _resource: &Resource,
            _ctx: Arc<ReconcilerContext>,
        ) -> anyhow::Result<ReconcileOutcome> {
            Ok(ReconcileOutcome::default())
        }
    }

    struct ProbePlugin;

    impl ActionPlugin for ProbePlugin {
        fn name(&self) -> &str {
            "http-probe"
        }
    }

    fn context(store: Arc<MemStore>) -> (Arc<ReconcilerContext>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let mut actions: HashMap<String, Arc<dyn ActionPlugin>> = HashMap::new();
        actions.insert("http-probe".to_string(), Arc::new(ProbePlugin));
        let ctx = Arc::new(ReconcilerContext::new(
            store,
            actions,
            rx,
            chrono::Duration::seconds(300),
        ));
        (ctx, tx)
    }

    async fn seeded_resource(store: &MemStore) -> Resource {
        store
            .create_resource(NewResource {
                name: "web-1".to_string(),
                resource_type_name: "web-service".to_string(),
                resource_type_version: "v1".to_string(),
                spec: json!({"replicas": 1}),
                finalizers: vec!["web".to_string()],
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_duplicate_type_claim_is_fatal() {
        let mut registry = ReconcilerRegistry::new();
        registry
            .register(NoopReconciler::new("web", &["web-service"]))
            .unwrap();

        let err = registry
            .register(NoopReconciler::new("web-v2", &["web-service"]))
            .unwrap_err();

        match err {
            Error::ResourceTypeConflict {
                resource_type,
                existing,
                duplicate,
            } => {
                assert_eq!(resource_type, "web-service");
                assert_eq!(existing, "web");
                assert_eq!(duplicate, "web-v2");
            }
            other => panic!("expected ResourceTypeConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_one_reconciler_may_claim_several_types() {
        let mut registry = ReconcilerRegistry::new();
        registry
            .register(NoopReconciler::new("multi", &["web-service", "database"]))
            .unwrap();

        assert!(registry.has_reconciler_for("web-service"));
        assert!(registry.has_reconciler_for("database"));
        assert!(!registry.has_reconciler_for("queue"));
        assert_eq!(
            registry.reconciler_for("database").unwrap().name(),
            "multi"
        );
    }

    #[tokio::test]
    async fn test_default_cleanup_releases_own_finalizer() {
        let store = Arc::new(MemStore::new());
        let resource = seeded_resource(&store).await;
        let (ctx, _tx) = context(Arc::clone(&store));

        let reconciler = NoopReconciler::new("web", &["web-service"]);
        reconciler.cleanup(&resource, ctx).await.unwrap();

        assert!(store.get_finalizers(resource.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_context_update_status_writes_conditions() {
        let store = Arc::new(MemStore::new());
        let resource = seeded_resource(&store).await;
        let (ctx, _tx) = context(Arc::clone(&store));

        ctx.update_status(resource.id, Phase::Ready, Some("all good".to_string()), Some(1))
            .await
            .unwrap();

        let updated = store.get_resource(resource.id).await.unwrap().unwrap();
        assert_eq!(updated.status, Phase::Ready);
        assert_eq!(updated.observed_generation, 1);
        let ready = find_condition(&updated.conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.reason, "ReconcileSuccess");
    }

    #[tokio::test]
    async fn test_context_records_history_both_ways() {
        let store = Arc::new(MemStore::new());
        let resource = seeded_resource(&store).await;
        let (ctx, _tx) = context(Arc::clone(&store));

        let outcome = ReconcileOutcome {
            drift_detected: true,
            ..ReconcileOutcome::default()
        };
        ctx.record_reconciliation(
            &resource,
            Ok(&outcome),
            TriggerReason::Drift,
            Duration::from_millis(250),
        )
        .await
        .unwrap();
        ctx.record_reconciliation(
            &resource,
            Err("boom"),
            TriggerReason::Retry,
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        let history = store.list_history(resource.id, 10, 0).await.unwrap();
        assert_eq!(history.len(), 2);
        // Newest first
        assert!(!history[0].success);
        assert_eq!(history[0].error_message.as_deref(), Some("boom"));
        assert_eq!(history[0].trigger_reason, TriggerReason::Retry);
        assert!(history[1].success);
        assert!(history[1].drift_detected);
    }

    #[tokio::test]
    async fn test_context_action_plugin_lookup() {
        let store = Arc::new(MemStore::new());
        let (ctx, _tx) = context(store);

        assert_eq!(
            ctx.get_action_plugin("http-probe").unwrap().name(),
            "http-probe"
        );
        assert!(ctx.get_action_plugin("missing").is_none());
    }

    #[tokio::test]
    async fn test_start_all_and_stop_all_round_trip() {
        let store = Arc::new(MemStore::new());
        let (ctx, tx) = context(store);

        let reconciler = NoopReconciler::new("web", &["web-service", "database"]);
        let mut registry = ReconcilerRegistry::new();
        registry.register(Arc::clone(&reconciler) as Arc<dyn Reconciler>).unwrap();

        registry.start_all(Arc::clone(&ctx)).await;
        // One loop even though the reconciler claims two types
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.started.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        registry.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_event_visibility() {
        let store = Arc::new(MemStore::new());
        let (ctx, tx) = context(store);

        assert!(!ctx.is_shutting_down());
        tx.send(true).unwrap();
        assert!(ctx.is_shutting_down());
    }
}
