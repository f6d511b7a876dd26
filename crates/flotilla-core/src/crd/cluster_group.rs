//! A named label selector over clusters.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};

use super::summary::BundleSummary;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroup {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ClusterGroupSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterGroupStatus>,
}

super::impl_fleet_resource!(ClusterGroup, "ClusterGroup");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupSpec {
    /// Clusters in the group's namespace whose labels match. `None` selects
    /// nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterGroupStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub cluster_count: i32,

    #[serde(default)]
    pub non_ready_cluster_count: i32,

    #[serde(default)]
    pub summary: BundleSummary,
}
