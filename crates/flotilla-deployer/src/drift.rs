//! Drift detection: downstream store events for objects owned by a set id
//! are funneled into the BundleDeployment queue with an aggregation delay,
//! so bursts of edits collapse into one reconcile.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use flotilla_core::config::DRIFT_AGGREGATION_WINDOW;
use flotilla_core::controller::{WorkQueue, spawn_event_mapper};
use flotilla_core::labels::SET_ID_LABEL;
use flotilla_core::store::{ObjectKey, ObjectStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Maps set ids to the BundleDeployment that owns them. Maintained by the
/// deployment reconciler, read by the drift watcher.
#[derive(Default)]
pub struct DriftIndex {
    entries: RwLock<HashMap<String, ObjectKey>>,
}

impl DriftIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, set_id: String, key: ObjectKey) {
        self.write().insert(set_id, key);
    }

    pub fn unregister(&self, key: &ObjectKey) {
        self.write().retain(|_, owner| owner != key);
    }

    pub fn resolve(&self, set_id: &str) -> Option<ObjectKey> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(set_id)
            .cloned()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ObjectKey>> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Watches the downstream store and enqueues the owning BundleDeployment
/// for every observed change to a managed object, delayed by the
/// aggregation window.
pub fn spawn_drift_watcher(
    store: &dyn ObjectStore,
    index: Arc<DriftIndex>,
    queue: Arc<WorkQueue<ObjectKey>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_event_mapper(store.subscribe(), queue, shutdown, move |event| {
        if !event.dynamic {
            return Vec::new();
        }
        let Some(set_id) = event.labels.get(SET_ID_LABEL) else {
            return Vec::new();
        };
        match index.resolve(set_id) {
            Some(key) => vec![(key, Some(DRIFT_AGGREGATION_WINDOW))],
            None => Vec::new(),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flotilla_core::kube::core::{DynamicObject, TypeMeta};
    use flotilla_core::store::MemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn managed_object_changes_enqueue_the_owner() {
        let store = MemoryStore::new();
        let index = Arc::new(DriftIndex::new());
        index.register(
            "set-a".to_string(),
            ObjectKey::namespaced("cluster-ns", "bundle"),
        );
        let queue = Arc::new(WorkQueue::new());
        let shutdown = CancellationToken::new();
        let _watcher = spawn_drift_watcher(&store, index, Arc::clone(&queue), shutdown.clone());

        store
            .apply_dynamic(DynamicObject {
                types: Some(TypeMeta {
                    api_version: "v1".into(),
                    kind: "ConfigMap".into(),
                }),
                metadata: ObjectMeta {
                    namespace: Some("ns".into()),
                    name: Some("cm".into()),
                    labels: Some(
                        [(SET_ID_LABEL.to_string(), "set-a".to_string())].into(),
                    ),
                    ..Default::default()
                },
                data: serde_json::json!({"data": {}}),
            })
            .await
            .unwrap();

        // Give the watcher task a chance to drain the event, then pass the
        // aggregation window.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(DRIFT_AGGREGATION_WINDOW).await;

        let key = queue.next().await;
        assert_eq!(key, Some(ObjectKey::namespaced("cluster-ns", "bundle")));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unmanaged_objects_are_ignored() {
        let store = MemoryStore::new();
        let index = Arc::new(DriftIndex::new());
        let queue = Arc::new(WorkQueue::<ObjectKey>::new());
        let shutdown = CancellationToken::new();
        let _watcher =
            spawn_drift_watcher(&store, Arc::clone(&index), Arc::clone(&queue), shutdown.clone());

        store
            .apply_dynamic(DynamicObject {
                types: Some(TypeMeta {
                    api_version: "v1".into(),
                    kind: "ConfigMap".into(),
                }),
                metadata: ObjectMeta {
                    namespace: Some("ns".into()),
                    name: Some("plain".into()),
                    ..Default::default()
                },
                data: serde_json::json!({}),
            })
            .await
            .unwrap();

        tokio::task::yield_now().await;
        tokio::select! {
            key = queue.next() => panic!("unexpected enqueue: {key:?}"),
            () = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        shutdown.cancel();
    }
}
