//! A bundle's instance for exactly one downstream cluster. Lives in the
//! cluster's derived namespace on the manager; the downstream deployer turns
//! it into a release.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, Time};
use serde::{Deserialize, Serialize};

use super::options::{BundleDeploymentOptions, DriftCorrection};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeployment {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: BundleDeploymentSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BundleDeploymentStatus>,
}

super::impl_fleet_resource!(BundleDeployment, "BundleDeployment");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentSpec {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,

    /// `<manifestID>:<optionsHash>`; identifies exactly what should be live.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_id: String,

    #[serde(default)]
    pub options: BundleDeploymentOptions,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_drift: Option<DriftCorrection>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Deployment id of the release currently live downstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_deployment_id: Option<String>,

    /// `<namespace>/<releaseName>:<revision>` of the live release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,

    #[serde(default)]
    pub ready: bool,

    /// True when the live state matches the release with no external edits.
    #[serde(default)]
    pub non_modified: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_status: Vec<NonReadyStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_status: Vec<ModifiedStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<DeployedResource>,
}

/// An object from the release that is not (yet) ready.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonReadyStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    pub name: String,

    #[serde(default)]
    pub summary: ObjectSummary,
}

/// Condensed readiness of a single object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transitioning: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<String>,
}

/// An object whose live state deviates from the release: missing, extraneous
/// or patched out-of-band.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    pub name: String,

    /// The object should exist but does not.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub create: bool,

    /// The object exists but is not part of the release.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,

    /// JSON merge patch from live to desired, for out-of-band edits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

impl ModifiedStatus {
    /// Sort key: `apiVersion/kind/namespace/name`.
    pub fn sort_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

/// Compact identity of an object belonging to the release.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Time>,
}
