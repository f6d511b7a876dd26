//! A downstream managed cluster and the scheduling knobs for its agent.

use k8s_openapi::api::core::v1::{Affinity, EnvVar, ResourceRequirements, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use super::summary::BundleSummary;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ClusterSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterStatus>,
}

super::impl_fleet_resource!(Cluster, "Cluster");

impl Cluster {
    /// The namespace the agent runs in downstream, explicit or defaulted.
    pub fn agent_namespace(&self, default: &str) -> String {
        self.spec
            .agent_namespace
            .clone()
            .unwrap_or_else(|| default.to_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,

    /// Unique token identifying the agent; assigned by the controller when
    /// left empty on a manager-initiated registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Secret holding a kubeconfig for manager-initiated registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config_secret_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_env_vars: Vec<EnvVar>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_scheduling_customization: Option<AgentSchedulingCustomization>,

    /// Values offered to bundle templating under `.ClusterValues`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_values: Option<Map<String, Value>>,

    /// Bumped by operators to force an agent redeploy.
    #[serde(default)]
    pub redeploy_agent_generation: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSchedulingCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<PriorityClassSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PodDisruptionBudgetSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityClassSpec {
    #[serde(default)]
    pub value: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preemption_policy: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}

/// How the agent verifies the manager's API server certificate.
#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum AgentTlsMode {
    #[default]
    #[serde(rename = "systemStore")]
    #[strum(serialize = "systemStore")]
    SystemStore,

    #[serde(rename = "strict")]
    #[strum(serialize = "strict")]
    Strict,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// The derived namespace on the manager holding this cluster's
    /// BundleDeployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Generation of the agent deployment that is live downstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_deployed_generation: Option<i64>,

    #[serde(default)]
    pub agent_migrated: bool,

    #[serde(default)]
    pub cattle_namespace_migrated: bool,

    #[serde(default)]
    pub agent_namespace_migrated: bool,

    /// Set when manager-side agent configuration changed; cleared by the
    /// next successful import.
    #[serde(default)]
    pub agent_config_changed: bool,

    /// Namespace the agent was observed in downstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_ca_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_tls_mode: Option<AgentTlsMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection_interval: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_env_vars_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_tolerations_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_affinity_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_resources_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_host_network: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_replicas: Option<i32>,

    #[serde(default)]
    pub summary: BundleSummary,

    #[serde(default)]
    pub display: ClusterDisplay,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDisplay {
    /// `<ready>/<desired>` bundles on this cluster.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ready_bundles: String,
}
