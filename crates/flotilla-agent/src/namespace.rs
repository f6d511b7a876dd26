//! Derived cluster namespaces on the manager: one per cluster, holding its
//! BundleDeployments, labeled as managed and annotated with backreferences.

use std::collections::BTreeMap;

use flotilla_core::crd::{Cluster, FleetResource as _};
use flotilla_core::kube::core::{DynamicObject, TypeMeta};
use flotilla_core::labels::{
    CLUSTER_NAME_ANNOTATION, CLUSTER_NAMESPACE_ANNOTATION, MANAGED_LABEL,
};
use flotilla_core::names::cluster_namespace;
use flotilla_core::store::{ObjectStore, StoreError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Creates (or refreshes) the cluster's derived namespace and returns its
/// name.
pub async fn ensure_cluster_namespace(
    store: &dyn ObjectStore,
    cluster: &Cluster,
) -> Result<String, StoreError> {
    let cluster_ns = cluster.namespace().unwrap_or_default();
    let name = cluster_namespace(cluster_ns, cluster.name());

    let namespace = DynamicObject {
        types: Some(TypeMeta {
            api_version: "v1".to_string(),
            kind: "Namespace".to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            annotations: Some(BTreeMap::from([
                (
                    CLUSTER_NAMESPACE_ANNOTATION.to_string(),
                    cluster_ns.to_string(),
                ),
                (
                    CLUSTER_NAME_ANNOTATION.to_string(),
                    cluster.name().to_string(),
                ),
            ])),
            ..Default::default()
        },
        data: serde_json::json!({}),
    };
    store.apply_dynamic(namespace).await?;
    Ok(name)
}
