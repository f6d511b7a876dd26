//! Controller wiring: builds the stores, registers every reconciler with
//! its work queue and event relations, and runs the worker pools until
//! shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use flotilla_agent::{ClusterImportReconciler, DownstreamConnector, KubeConfig};
use flotilla_core::config::{
    self, CLUSTER_IMPORT_WORKERS, ConfigCell, DEFAULT_BUNDLE_DEPLOYMENT_WORKERS,
    DEFAULT_DRIFT_WORKERS,
};
use flotilla_core::controller::{WorkQueue, run_controller, spawn_event_mapper};
use flotilla_core::crd::{Bundle, BundleDeployment, Cluster, ClusterGroup, FleetResource as _};
use flotilla_core::store::{MemoryStore, ObjectKey, ObjectStore, ObjectStoreExt as _};
use flotilla_deployer::{
    BundleDeploymentReconciler, Deployer, DriftIndex, MemoryReleaseStore, spawn_drift_watcher,
};
use flotilla_matcher::BundleReconciler;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Connector for the single-process arrangement: every cluster resolves to
/// one local in-memory downstream. Production deployments substitute a
/// connector that dials the cluster's API server.
pub struct LocalConnector {
    pub downstream: Arc<MemoryStore>,
}

#[async_trait]
impl DownstreamConnector for LocalConnector {
    async fn connect(
        &self,
        _kube_config: &KubeConfig,
    ) -> Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Arc::clone(&self.downstream) as Arc<dyn ObjectStore>)
    }

    async fn probe_insecure(&self, _api_server_url: &str) -> bool {
        true
    }
}

/// Cluster and group changes re-target every bundle in their namespace;
/// this relation needs a LIST, so it cannot run in the synchronous event
/// mapper.
fn spawn_bundle_relation(
    manager: Arc<MemoryStore>,
    bundle_queue: Arc<WorkQueue<ObjectKey>>,
    shutdown: CancellationToken,
) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            };
            if event.dynamic
                || (event.kind != Cluster::KIND && event.kind != ClusterGroup::KIND)
            {
                continue;
            }
            let Some(namespace) = event.key.namespace.clone() else {
                continue;
            };
            let Ok(bundles) = manager.list::<Bundle>(Some(&namespace), None).await else {
                continue;
            };
            for bundle in bundles {
                bundle_queue.add(bundle.key());
            }
        }
    });
}

/// Global config replacement re-gates every cluster.
fn spawn_config_relation(
    manager: Arc<MemoryStore>,
    config: &ConfigCell,
    cluster_queue: Arc<WorkQueue<ObjectKey>>,
    shutdown: CancellationToken,
) {
    let mut changes = config.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Ok(clusters) = manager.list::<Cluster>(None, None).await {
                        for cluster in clusters {
                            cluster_queue.add(cluster.key());
                        }
                    }
                }
            }
        }
    });
}

/// Runs the full manager-side controller set against in-memory stores until
/// the token fires.
pub async fn run_controllers(config: Arc<ConfigCell>, shutdown: CancellationToken) {
    let manager = Arc::new(MemoryStore::new());
    let downstream = Arc::new(MemoryStore::new());
    let releases = Arc::new(MemoryReleaseStore::new());

    let agent_namespace =
        config::agent_namespace_from_env().unwrap_or_else(|| config.get().agent_namespace.clone());
    let deployer = Arc::new(Deployer::new(
        Arc::clone(&downstream) as Arc<dyn ObjectStore>,
        Arc::clone(&releases) as Arc<dyn flotilla_deployer::ReleaseStore>,
        "default",
        agent_namespace,
    ));
    let drift_index = Arc::new(DriftIndex::new());

    // Bundle fan-out.
    let bundle_queue = Arc::new(WorkQueue::<ObjectKey>::new());
    spawn_event_mapper(
        manager.subscribe(),
        Arc::clone(&bundle_queue),
        shutdown.clone(),
        |event| {
            if !event.dynamic && event.kind == Bundle::KIND {
                vec![(event.key.clone(), None)]
            } else {
                Vec::new()
            }
        },
    );
    spawn_bundle_relation(
        Arc::clone(&manager),
        Arc::clone(&bundle_queue),
        shutdown.clone(),
    );
    tokio::spawn(run_controller(
        Arc::new(BundleReconciler {
            manager: Arc::clone(&manager) as Arc<dyn ObjectStore>,
        }),
        Arc::clone(&bundle_queue),
        DEFAULT_BUNDLE_DEPLOYMENT_WORKERS,
        shutdown.clone(),
    ));

    // Cluster import, serialized on one worker.
    let cluster_queue = Arc::new(WorkQueue::<ObjectKey>::new());
    spawn_event_mapper(
        manager.subscribe(),
        Arc::clone(&cluster_queue),
        shutdown.clone(),
        |event| {
            if !event.dynamic && event.kind == Cluster::KIND {
                vec![(event.key.clone(), None)]
            } else {
                Vec::new()
            }
        },
    );
    spawn_config_relation(
        Arc::clone(&manager),
        &config,
        Arc::clone(&cluster_queue),
        shutdown.clone(),
    );
    tokio::spawn(run_controller(
        Arc::new(ClusterImportReconciler {
            manager: Arc::clone(&manager) as Arc<dyn ObjectStore>,
            connector: Arc::new(LocalConnector {
                downstream: Arc::clone(&downstream),
            }),
            config: Arc::clone(&config),
        }),
        Arc::clone(&cluster_queue),
        CLUSTER_IMPORT_WORKERS,
        shutdown.clone(),
    ));

    // Downstream deployment plus drift correction.
    let bd_queue = Arc::new(WorkQueue::<ObjectKey>::new());
    spawn_event_mapper(
        manager.subscribe(),
        Arc::clone(&bd_queue),
        shutdown.clone(),
        |event| {
            if !event.dynamic && event.kind == BundleDeployment::KIND {
                vec![(event.key.clone(), None)]
            } else {
                Vec::new()
            }
        },
    );
    spawn_drift_watcher(
        downstream.as_ref(),
        Arc::clone(&drift_index),
        Arc::clone(&bd_queue),
        shutdown.clone(),
    );
    // Drift requests share the deployment queue, so the pool is sized to
    // whichever knob asks for more.
    let bd_workers = config::worker_count_from_env(
        config::ENV_BUNDLE_DEPLOYMENT_WORKERS,
        DEFAULT_BUNDLE_DEPLOYMENT_WORKERS,
    )
    .max(config::worker_count_from_env(
        config::ENV_DRIFT_WORKERS,
        DEFAULT_DRIFT_WORKERS,
    ));
    tokio::spawn(run_controller(
        Arc::new(BundleDeploymentReconciler {
            manager: Arc::clone(&manager) as Arc<dyn ObjectStore>,
            deployer: Arc::clone(&deployer),
            drift_index: Arc::clone(&drift_index),
        }),
        Arc::clone(&bd_queue),
        bd_workers,
        shutdown.clone(),
    ));

    info!("controllers running");
    shutdown.cancelled().await;
    info!("controllers stopped");
}
