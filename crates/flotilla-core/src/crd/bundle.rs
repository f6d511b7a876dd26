//! A declarative package of resources plus the targeting rules that decide
//! which clusters receive it.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::options::BundleDeploymentOptions;
use super::summary::{AggregatedResource, BundleSummary};
use crate::manifest::BundleResource;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: BundleSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BundleStatus>,
}

super::impl_fleet_resource!(Bundle, "Bundle");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<BundleResource>,

    /// Per-cluster customizations; the first matching entry wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<BundleTarget>,

    /// Whitelist: when non-empty, only clusters matching at least one entry
    /// are eligible at all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_restrictions: Vec<TargetRestriction>,

    /// Default deployment options, before target customization.
    #[serde(default)]
    pub options: BundleDeploymentOptions,

    /// Values offered to `${ }` templating alongside the cluster's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_values: Option<Map<String, Value>>,

    /// Commit the bundle contents were sourced from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// Selects clusters and overrides options for them. Selection criteria are
/// ANDed; absent criteria match everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group_selector: Option<LabelSelector>,

    /// Excludes matched clusters instead of deploying to them.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub do_not_deploy: bool,

    #[serde(flatten)]
    pub options: BundleDeploymentOptions,
}

/// Same selection vocabulary as [`BundleTarget`], without overrides.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRestriction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group_selector: Option<LabelSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub summary: BundleSummary,

    #[serde(default)]
    pub display: BundleDisplay,

    /// Clusters allowed to be unavailable during rollout, resolved from the
    /// rollout options.
    #[serde(default)]
    pub max_unavailable: i32,

    /// Hard cap on BundleDeployments created in one reconcile.
    #[serde(default)]
    pub max_new: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<AggregatedResource>,

    #[serde(default)]
    pub observed_generation: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDisplay {
    /// `<ready>/<desired>`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ready_clusters: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
}
