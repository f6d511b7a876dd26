//! One-shot registration credential for a cluster. Owned by the cluster and
//! garbage-collected through the owner reference once expired.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationToken {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ClusterRegistrationTokenSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterRegistrationTokenStatus>,
}

super::impl_fleet_resource!(ClusterRegistrationToken, "ClusterRegistrationToken");

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenSpec {
    /// Seconds until the token expires; `None` means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenStatus {
    /// The credential itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<Time>,
}

impl ClusterRegistrationToken {
    /// Whether the token has expired at `now`.
    pub fn expired(&self, now: &Time) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.expires.as_ref())
            .is_some_and(|expires| expires.0 <= now.0)
    }
}
