//! Object scope resolution without a live discovery client.
//!
//! The store is generic, so scope is decided from a table of well-known
//! cluster-scoped kinds plus the `Cluster*` naming convention custom
//! resources follow.

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CertificateSigningRequest",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
    "VolumeSnapshotClass",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind) || kind.starts_with("Cluster")
}

pub fn is_namespaced(kind: &str) -> bool {
    !is_cluster_scoped(kind)
}
