//! Registration token provisioning. Tokens are owned by their cluster so
//! deleting the cluster garbage-collects them; expiry re-issues.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use k8s_openapi::chrono::{Duration as ChronoDuration, Utc};
use rand::Rng as _;
use rand::distr::Alphanumeric;

use flotilla_core::crd::{
    Cluster, ClusterRegistrationToken, ClusterRegistrationTokenSpec,
    ClusterRegistrationTokenStatus, FleetResource as _,
};
use flotilla_core::names::safe_concat_name;
use flotilla_core::store::{ObjectKey, ObjectStore, ObjectStoreExt as _, StoreError};

const TOKEN_LENGTH: usize = 54;

pub fn token_name(cluster_name: &str) -> String {
    safe_concat_name(["import-token", cluster_name])
}

pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Ensures a live registration token for the cluster, replacing expired
/// ones. Returns the token value.
pub async fn ensure_registration_token(
    store: &dyn ObjectStore,
    cluster: &Cluster,
    ttl: std::time::Duration,
) -> Result<String, StoreError> {
    let namespace = cluster.namespace().unwrap_or_default().to_string();
    let name = token_name(cluster.name());
    let key = ObjectKey::namespaced(&namespace, &name);
    let now = Time(Utc::now());

    if let Some(existing) = store.get::<ClusterRegistrationToken>(&key).await? {
        if !existing.expired(&now) {
            if let Some(token) = existing.status.as_ref().and_then(|s| s.token.clone()) {
                return Ok(token);
            }
        }
        store.delete::<ClusterRegistrationToken>(&key).await?;
    }

    let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let token_value = generate_token();
    let token = ClusterRegistrationToken {
        metadata: ObjectMeta {
            namespace: Some(namespace),
            name: Some(name),
            owner_references: cluster.metadata.uid.clone().map(|uid| {
                vec![OwnerReference {
                    api_version: "fleet.flotilla.dev/v1alpha1".to_string(),
                    kind: Cluster::KIND.to_string(),
                    name: cluster.name().to_string(),
                    uid,
                    ..Default::default()
                }]
            }),
            ..Default::default()
        },
        spec: ClusterRegistrationTokenSpec {
            ttl_seconds: Some(ttl_seconds),
        },
        status: Some(ClusterRegistrationTokenStatus {
            token: Some(token_value.clone()),
            expires: Some(Time(now.0 + ChronoDuration::seconds(ttl_seconds))),
        }),
    };
    store.create(&token).await?;
    Ok(token_value)
}
