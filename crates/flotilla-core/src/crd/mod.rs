//! The closed set of entities the control plane reconciles.
//!
//! Entities are plain serde structs around a k8s-style `ObjectMeta`; the
//! object store owns `generation` and `resourceVersion` maintenance, the
//! structs here only describe shape.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Serialize, de::DeserializeOwned};

use crate::store::ObjectKey;

mod bundle;
mod bundle_deployment;
mod cluster;
mod cluster_group;
mod content;
mod options;
mod summary;
mod token;

pub use bundle::{Bundle, BundleDisplay, BundleSpec, BundleStatus, BundleTarget, TargetRestriction};
pub use bundle_deployment::{
    BundleDeployment, BundleDeploymentSpec, BundleDeploymentStatus, DeployedResource,
    ModifiedStatus, NonReadyStatus, ObjectSummary,
};
pub use cluster::{
    AgentSchedulingCustomization, AgentTlsMode, Cluster, ClusterDisplay,
    ClusterSpec, ClusterStatus, PodDisruptionBudgetSpec, PriorityClassSpec,
};
pub use cluster_group::{ClusterGroup, ClusterGroupSpec, ClusterGroupStatus};
pub use content::Content;
pub use options::{
    BundleDeploymentOptions, ComparePatch, DiffOperation, DiffOptions, DriftCorrection,
    HelmOptions, IgnoreOptions, KustomizeOptions, Partition, RolloutOptions, ValuesFrom,
    ValuesKeyRef, deployment_id,
};
pub use summary::{
    AggregatedResource, BundleState, BundleSummary, NonReadyResource, PerClusterState,
};
pub use token::{
    ClusterRegistrationToken, ClusterRegistrationTokenSpec, ClusterRegistrationTokenStatus,
};

/// Implemented by every entity kind the store understands.
pub trait FleetResource:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.metadata().namespace.clone(),
            name: self.name().to_string(),
        }
    }

    fn generation(&self) -> i64 {
        self.metadata().generation.unwrap_or_default()
    }

    fn labels(&self) -> BTreeMap<String, String> {
        self.metadata().labels.clone().unwrap_or_default()
    }

    fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata().annotations.clone().unwrap_or_default()
    }
}

macro_rules! impl_fleet_resource {
    ($type:ty, $kind:literal) => {
        impl crate::crd::FleetResource for $type {
            const KIND: &'static str = $kind;

            fn metadata(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(
                &mut self,
            ) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}
pub(crate) use impl_fleet_resource;
