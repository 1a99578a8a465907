// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Unit tests for the write gateway pipeline.

#[cfg(test)]
mod tests {
    use super::super::{CreateResourceRequest, FinalizerPatch, WriteGateway};
    use crate::errors::Error;
    use crate::events::{EventBus, EventFilter, EventType};
    use crate::model::{
        FailurePolicy, NewAdmissionWebhook, NewResourceType, Operation, Phase,
        ResourceTypeStatus, WebhookType,
    };
    use crate::registry::{ReconcileOutcome, Reconciler, ReconcilerContext, ReconcilerRegistry};
    use crate::status::{find_condition, CONDITION_READY};
    use crate::store::memory::MemStore;
    use crate::store::Store;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct WebReconciler;

    #[async_trait]
    impl Reconciler for WebReconciler {
        fn name(&self) -> &str {
            "web"
        }

        fn resource_types(&self) -> Vec<String> {
            vec!["web-service".to_string()]
        }

        async fn reconcile(
            &self,
            _resource: &crate::model::Resource,
            _ctx: Arc<ReconcilerContext>,
        ) -> anyhow::Result<ReconcileOutcome> {
            Ok(ReconcileOutcome::default())
        }
    }

    struct Fixture {
        gateway: WriteGateway,
        store: Arc<MemStore>,
        bus: Arc<EventBus>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let bus = Arc::new(EventBus::new(64));
        let mut registry = ReconcilerRegistry::new();
        registry.register(Arc::new(WebReconciler)).unwrap();

        store
            .upsert_resource_type(NewResourceType {
                name: "web-service".to_string(),
                version: "v1".to_string(),
                schema: json!({
                    "type": "object",
                    "required": ["replicas"],
                    "properties": {
                        "replicas": {"type": "integer", "minimum": 1},
                        "environment": {"type": "string", "default": "dev"}
                    }
                }),
                description: None,
                status: ResourceTypeStatus::Active,
                metadata: json!({}),
            })
            .await
            .unwrap();

        let gateway = WriteGateway::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&bus),
            Arc::new(registry),
        )
        .unwrap();
        Fixture {
            gateway,
            store,
            bus,
        }
    }

    fn create_request(name: &str) -> CreateResourceRequest {
        CreateResourceRequest {
            name: name.to_string(),
            resource_type_name: "web-service".to_string(),
            resource_type_version: "v1".to_string(),
            spec: json!({"replicas": 2}),
        }
    }

    #[tokio::test]
    async fn test_create_happy_path() {
        let fixture = fixture().await;
        let mut events = fixture.bus.subscribe(EventFilter::all());

        let resource = fixture.gateway.create_resource(create_request("web-1")).await.unwrap();

        assert_eq!(resource.status, Phase::Pending);
        assert_eq!(resource.generation, 1);
        // Claiming reconciler's finalizer pre-inserted
        assert_eq!(resource.finalizers, vec!["web".to_string()]);
        // Schema default applied before persistence
        assert_eq!(resource.spec["environment"], "dev");

        let event = events.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Created);
        assert_eq!(event.resource_name, "web-1");
    }

    #[tokio::test]
    async fn test_create_unknown_type_404() {
        let fixture = fixture().await;
        let mut request = create_request("web-1");
        request.resource_type_version = "v9".to_string();

        let err = fixture.gateway.create_resource(request).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_invalid_spec_rejected() {
        let fixture = fixture().await;
        let mut request = create_request("web-1");
        request.spec = json!({"replicas": "two"});

        let err = fixture.gateway.create_resource(request).await.unwrap_err();
        match err {
            Error::SchemaValidation(errors) => {
                assert!(errors.iter().any(|e| e.path == "/replicas"));
            }
            other => panic!("expected SchemaValidation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_without_reconciler_rejected() {
        let fixture = fixture().await;
        fixture
            .store
            .upsert_resource_type(NewResourceType {
                name: "queue".to_string(),
                version: "v1".to_string(),
                schema: json!({"type": "object"}),
                description: None,
                status: ResourceTypeStatus::Active,
                metadata: json!({}),
            })
            .await
            .unwrap();

        let mut request = create_request("orphan-1");
        request.resource_type_name = "queue".to_string();
        request.spec = json!({});

        let err = fixture.gateway.create_resource(request).await.unwrap_err();
        assert!(matches!(err, Error::NoReconcilerForType(_)));
    }

    #[tokio::test]
    async fn test_replace_spec_identical_keeps_generation() {
        let fixture = fixture().await;
        let created = fixture.gateway.create_resource(create_request("web-1")).await.unwrap();

        // Same content after defaulting, different key order
        let updated = fixture
            .gateway
            .replace_spec(created.id, json!({"environment": "dev", "replicas": 2}))
            .await
            .unwrap();

        assert_eq!(updated.generation, 1);
    }

    #[tokio::test]
    async fn test_replace_spec_changed_bumps_generation() {
        let fixture = fixture().await;
        let created = fixture.gateway.create_resource(create_request("web-1")).await.unwrap();
        let mut events = fixture.bus.subscribe(EventFilter::all());

        let updated = fixture
            .gateway
            .replace_spec(created.id, json!({"replicas": 5}))
            .await
            .unwrap();

        assert_eq!(updated.generation, 2);
        assert_eq!(updated.status, Phase::Pending);
        assert!(updated.next_reconcile_time.is_none());

        let event = events.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Modified);
    }

    #[tokio::test]
    async fn test_delete_is_soft_and_publishes() {
        let fixture = fixture().await;
        let created = fixture.gateway.create_resource(create_request("web-1")).await.unwrap();
        let mut events = fixture.bus.subscribe(EventFilter::all());

        let deleted = fixture.gateway.delete_resource(created.id).await.unwrap();

        assert_eq!(deleted.status, Phase::Deleting);
        assert!(deleted.deleted_at.is_some());
        // Resource still present on the deletion path
        assert!(fixture.store.get_resource_any(created.id).await.unwrap().is_some());

        let ready = find_condition(&deleted.conditions, CONDITION_READY);
        // Conditions were merged after the returned snapshot; check the store
        let stored = fixture.store.get_resource_any(created.id).await.unwrap().unwrap();
        assert!(ready.is_none());
        assert_eq!(
            find_condition(&stored.conditions, CONDITION_READY).unwrap().reason,
            "Deleting"
        );

        let event = events.receiver.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Deleted);
    }

    #[tokio::test]
    async fn test_finalizer_patch_round_trip() {
        let fixture = fixture().await;
        let created = fixture.gateway.create_resource(create_request("web-1")).await.unwrap();

        let patched = fixture
            .gateway
            .patch_finalizers(
                created.id,
                FinalizerPatch {
                    add: vec!["ext".to_string()],
                    remove: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.finalizers, vec!["web".to_string(), "ext".to_string()]);

        let restored = fixture
            .gateway
            .patch_finalizers(
                created.id,
                FinalizerPatch {
                    add: vec![],
                    remove: vec!["ext".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(restored.finalizers, created.finalizers);
    }

    #[tokio::test]
    async fn test_finalizer_patch_works_on_deleting_resource() {
        let fixture = fixture().await;
        let created = fixture.gateway.create_resource(create_request("web-1")).await.unwrap();
        fixture.gateway.delete_resource(created.id).await.unwrap();

        let patched = fixture
            .gateway
            .patch_finalizers(
                created.id,
                FinalizerPatch {
                    add: vec![],
                    remove: vec!["web".to_string()],
                },
            )
            .await
            .unwrap();
        assert!(patched.finalizers.is_empty());
    }

    #[tokio::test]
    async fn test_manual_trigger_requeues_now() {
        let fixture = fixture().await;
        let created = fixture.gateway.create_resource(create_request("web-1")).await.unwrap();
        fixture
            .store
            .update_status(created.id, Phase::Ready, None, Some(1))
            .await
            .unwrap();

        let triggered = fixture.gateway.trigger_reconcile(created.id).await.unwrap();

        assert_eq!(triggered.status, Phase::Pending);
        assert!(triggered.next_reconcile_time.unwrap() <= chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_manual_trigger_noop_while_reconciling() {
        let fixture = fixture().await;
        let created = fixture.gateway.create_resource(create_request("web-1")).await.unwrap();
        fixture
            .store
            .update_status(created.id, Phase::Reconciling, None, None)
            .await
            .unwrap();

        let result = fixture.gateway.trigger_reconcile(created.id).await.unwrap();
        assert_eq!(result.status, Phase::Reconciling);
    }

    #[tokio::test]
    async fn test_create_runs_admission_mutation() {
        let fixture = fixture().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allowed": true,
                "patches": [{"op": "add", "path": "/spec/injected", "value": true}]
            })))
            .mount(&server)
            .await;
        fixture
            .store
            .create_webhook(NewAdmissionWebhook {
                name: "injector".to_string(),
                resource_type_name: Some("web-service".to_string()),
                resource_type_version: Some("v1".to_string()),
                webhook_url: server.uri(),
                webhook_type: WebhookType::Mutating,
                operations: vec![Operation::Create],
                timeout_seconds: 2,
                failure_policy: FailurePolicy::Fail,
                ordering: 0,
            })
            .await
            .unwrap();

        let resource = fixture.gateway.create_resource(create_request("web-1")).await.unwrap();

        assert_eq!(resource.spec["injected"], true);
        // Mutated spec is what got hashed and persisted
        let stored = fixture.store.get_resource(resource.id).await.unwrap().unwrap();
        assert_eq!(stored.spec["injected"], true);
    }

    #[tokio::test]
    async fn test_create_denied_by_admission() {
        let fixture = fixture().await;
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allowed": false,
                "message": "replicas too low"
            })))
            .mount(&server)
            .await;
        fixture
            .store
            .create_webhook(NewAdmissionWebhook {
                name: "strict".to_string(),
                resource_type_name: None,
                resource_type_version: None,
                webhook_url: server.uri(),
                webhook_type: WebhookType::Validating,
                operations: vec![Operation::Create],
                timeout_seconds: 2,
                failure_policy: FailurePolicy::Fail,
                ordering: 0,
            })
            .await
            .unwrap();

        let err = fixture.gateway.create_resource(create_request("web-1")).await.unwrap_err();
        match err {
            Error::AdmissionDenied(msg) => assert_eq!(msg, "replicas too low"),
            other => panic!("expected AdmissionDenied, got {other:?}"),
        }
        // Nothing persisted on denial
        assert!(fixture.store.list_resources(None, None).await.unwrap().is_empty());
    }
}
