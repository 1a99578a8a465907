// Common test utilities for integration tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use converge::api::{self, AppState};
use converge::config::{Config, StoreBackend};
use converge::events::EventBus;
use converge::gateway::WriteGateway;
use converge::model::{NewResourceType, Resource, ResourceTypeStatus};
use converge::registry::{ReconcileOutcome, Reconciler, ReconcilerContext, ReconcilerRegistry};
use converge::scheduler::Scheduler;
use converge::store::memory::MemStore;
use converge::store::Store;
use serde_json::json;
use tokio::sync::watch;

/// Scriptable reconciler for the `web-service` type.
///
/// Flip `fail` to make attempts error; flip `drift` to report detected
/// drift; counters record invocations.
pub struct TestReconciler {
    pub fail: AtomicBool,
    pub drift: AtomicBool,
    pub reconciles: AtomicUsize,
    pub cleanups: AtomicUsize,
}

impl TestReconciler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            drift: AtomicBool::new(false),
            reconciles: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Reconciler for TestReconciler {
    fn name(&self) -> &str {
        "web"
    }

    fn resource_types(&self) -> Vec<String> {
        vec!["web-service".to_string()]
    }

    async fn reconcile(
        &self,
        _resource: &Resource,
        _ctx: Arc<ReconcilerContext>,
    ) -> anyhow::Result<ReconcileOutcome> {
        self.reconciles.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("boom");
        }
        Ok(ReconcileOutcome {
            outputs: Some(json!({"endpoint": "10.0.0.1:80"})),
            drift_detected: self.drift.load(Ordering::SeqCst),
            ..ReconcileOutcome::default()
        })
    }

    async fn cleanup(
        &self,
        resource: &Resource,
        ctx: Arc<ReconcilerContext>,
    ) -> anyhow::Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("destroy failed downstream");
        }
        ctx.remove_finalizer(resource.id, self.name()).await?;
        Ok(())
    }
}

/// A fully wired single-process control plane over the in-memory store.
pub struct ControlPlane {
    pub store: Arc<MemStore>,
    pub bus: Arc<EventBus>,
    pub gateway: Arc<WriteGateway>,
    pub scheduler: Scheduler,
    pub registry: Arc<ReconcilerRegistry>,
    pub reconciler: Arc<TestReconciler>,
    pub shutdown_tx: watch::Sender<bool>,
}

pub async fn control_plane() -> ControlPlane {
    control_plane_with(Config {
        store_backend: StoreBackend::Memory,
        ..Config::default()
    })
    .await
}

pub async fn control_plane_with(cfg: Config) -> ControlPlane {
    let store = Arc::new(MemStore::new());
    let bus = Arc::new(EventBus::new(cfg.event_queue_capacity));

    let reconciler = TestReconciler::new();
    let mut registry = ReconcilerRegistry::new();
    registry
        .register(Arc::clone(&reconciler) as Arc<dyn Reconciler>)
        .unwrap();
    let registry = Arc::new(registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(ReconcilerContext::new(
        Arc::clone(&store) as Arc<dyn Store>,
        registry.actions(),
        shutdown_rx.clone(),
        cfg.drift_interval_chrono(),
    ));

    let gateway = Arc::new(
        WriteGateway::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&bus),
            Arc::clone(&registry),
        )
        .unwrap(),
    );

    let scheduler = Scheduler::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&registry),
        Arc::clone(&bus),
        ctx,
        cfg,
        shutdown_rx,
    );

    // Every test talks to the web-service/v1 type
    store
        .upsert_resource_type(NewResourceType {
            name: "web-service".to_string(),
            version: "v1".to_string(),
            schema: json!({
                "type": "object",
                "required": ["a"],
                "properties": {
                    "a": {"type": "integer"},
                    "b": {"type": "integer"}
                }
            }),
            description: Some("test type".to_string()),
            status: ResourceTypeStatus::Active,
            metadata: json!({}),
        })
        .await
        .unwrap();

    ControlPlane {
        store,
        bus,
        gateway,
        scheduler,
        registry,
        reconciler,
        shutdown_tx,
    }
}

/// Run one scheduler tick and wait for every spawned attempt to finish.
pub async fn tick(plane: &ControlPlane) {
    for handle in plane.scheduler.tick().await.unwrap() {
        handle.await.unwrap();
    }
}

/// Serve the REST API on an ephemeral local port.
pub async fn spawn_api(plane: &ControlPlane) -> (String, tokio::task::JoinHandle<()>) {
    let state = Arc::new(AppState {
        store: Arc::clone(&plane.store) as Arc<dyn Store>,
        gateway: Arc::clone(&plane.gateway),
        bus: Arc::clone(&plane.bus),
        registry: Arc::clone(&plane.registry),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = api::router(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), handle)
}
