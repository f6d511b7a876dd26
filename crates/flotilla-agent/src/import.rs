//! Manager-side cluster import: provisions credentials, applies the agent
//! manifest downstream and tracks agent configuration drift.
//!
//! The whole path is gated on [`agent_deployed`]; once every gate holds the
//! reconcile is a no-op until a gate flips (config drift, a bumped redeploy
//! generation, or a namespace move).

use std::sync::Arc;

use async_trait::async_trait;
use flotilla_core::config::{
    ConfigCell, ControllerConfig, LEGACY_AGENT_NAMESPACE, TOKEN_CLUSTER_ENQUEUE_DELAY,
    agent_replicas_from_env, agent_scope_from_env, checkin_interval_from_env,
};
use flotilla_core::controller::{Outcome, Reconciler};
use flotilla_core::crd::{AgentTlsMode, Cluster, ClusterStatus, FleetResource as _};
use flotilla_core::error::{ReconcileError, Reason, Retry, set_ready_condition};
use flotilla_core::kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use flotilla_core::labels::{AGENT_BOOTSTRAP_SET_ID, AGENT_BUNDLE_PREFIX, SET_ID_LABEL};
use flotilla_core::names::safe_concat_name;
use flotilla_core::store::{
    ObjectKey, ObjectStore, ObjectStoreExt as _, retry_on_conflict,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::Serialize;
use sha2::Digest as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::connector::{DownstreamConnector, KubeConfig, smoke_test};
use crate::manifest::{AgentManifestOptions, agent_manifest};
use crate::namespace::ensure_cluster_namespace;
use crate::token::ensure_registration_token;
use crate::{image, token::generate_token};

/// Kinds cleaned out of an abandoned agent namespace.
const OLD_NAMESPACE_KINDS: &[(&str, &str)] = &[
    ("v1", "Secret"),
    ("apps/v1", "Deployment"),
    ("apps/v1", "StatefulSet"),
];

pub struct ClusterImportReconciler {
    pub manager: Arc<dyn ObjectStore>,
    pub connector: Arc<dyn DownstreamConnector>,
    pub config: Arc<ConfigCell>,
}

/// The namespace the agent is supposed to run in.
pub fn requested_agent_namespace(cluster: &Cluster, config: &ControllerConfig) -> String {
    cluster.agent_namespace(&config.agent_namespace)
}

/// Invariant gate: true only when every migration finished, no config drift
/// is pending, the deployed generation matches the requested one exactly,
/// and the agent runs in the requested namespace.
pub fn agent_deployed(cluster: &Cluster, requested_namespace: &str) -> bool {
    let Some(status) = &cluster.status else {
        return false;
    };
    status.agent_migrated
        && status.cattle_namespace_migrated
        && status.agent_namespace_migrated
        && !status.agent_config_changed
        && status.agent_deployed_generation == Some(cluster.spec.redeploy_agent_generation)
        && status.agent_namespace.as_deref() == Some(requested_namespace)
}

fn hash_of<T: Serialize>(value: &T) -> String {
    let serialized = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(sha2::Sha256::digest(&serialized))
}

fn gc_interval_string(config: &ControllerConfig) -> String {
    humantime::format_duration(config.garbage_collection_interval).to_string()
}

/// Whether the manager-side agent configuration diverged from what the
/// cluster last deployed. URL/CA comparisons are skipped when the cluster's
/// kubeconfig secret overrides them.
fn agent_config_changed(
    status: &ClusterStatus,
    config: &ControllerConfig,
    url_from_secret: bool,
    ca_from_secret: bool,
) -> bool {
    let api_server_changed = (!url_from_secret
        && status.api_server_url.as_deref() != Some(config.api_server_url.as_str()))
        || (!ca_from_secret
            && status.api_server_ca_hash
                != config.api_server_ca.as_ref().map(hash_of))
        || status.agent_tls_mode != Some(config.agent_tls_mode);
    let gc_interval_changed =
        status.garbage_collection_interval.as_deref() != Some(&gc_interval_string(config));
    api_server_changed || gc_interval_changed
}

/// Whether any scheduling knob diverged from the recorded hashes.
fn scheduling_changed(cluster: &Cluster) -> bool {
    let Some(status) = &cluster.status else {
        return false;
    };
    status.agent_tolerations_hash.as_deref() != Some(&hash_of(&cluster.spec.agent_tolerations))
        || status.agent_affinity_hash.as_deref() != Some(&hash_of(&cluster.spec.agent_affinity))
        || status.agent_resources_hash.as_deref() != Some(&hash_of(&cluster.spec.agent_resources))
        || status.agent_env_vars_hash.as_deref() != Some(&hash_of(&cluster.spec.agent_env_vars))
        || status.agent_host_network != cluster.spec.host_network
        || status.agent_replicas != cluster.spec.agent_replicas
}

impl ClusterImportReconciler {
    async fn write_status(&self, cluster: &Cluster) -> Result<(), ReconcileError> {
        let key = cluster.key();
        let status = cluster.status.clone();
        retry_on_conflict(|| {
            let key = key.clone();
            let status = status.clone();
            async move {
                let Some(mut fresh) = self.manager.get::<Cluster>(&key).await? else {
                    return Ok(());
                };
                fresh.status = status;
                self.manager.update_status(&fresh).await.map(|_| ())
            }
        })
        .await
        .map_err(|err| ReconcileError::new(Reason::Conflict, err.to_string()))
    }

    async fn surface_error(&self, cluster: &mut Cluster, err: &ReconcileError) {
        let generation = cluster.generation();
        let status = cluster.status.get_or_insert_with(Default::default);
        set_ready_condition(&mut status.conditions, Some(err), generation);
        let _ = self.write_status(cluster).await;
    }

    /// Removes agent workloads left behind in a namespace the agent no
    /// longer lives in, and the manager-side agent bundle pointing there.
    async fn cleanup_old_namespace(
        &self,
        downstream: &dyn ObjectStore,
        cluster: &Cluster,
        old_namespace: &str,
    ) -> Result<(), ReconcileError> {
        info!(namespace = old_namespace, "removing agent from previous namespace");

        let selector = LabelSelector {
            match_labels: Some(
                [(SET_ID_LABEL.to_string(), AGENT_BOOTSTRAP_SET_ID.to_string())].into(),
            ),
            ..Default::default()
        };
        for (api_version, kind) in OLD_NAMESPACE_KINDS {
            let gvk = match api_version.rsplit_once('/') {
                Some((group, version)) => GroupVersionKind {
                    group: group.to_string(),
                    version: version.to_string(),
                    kind: (*kind).to_string(),
                },
                None => GroupVersionKind {
                    group: String::new(),
                    version: (*api_version).to_string(),
                    kind: (*kind).to_string(),
                },
            };
            let objects = downstream
                .list_dynamic(Some(&gvk), Some(old_namespace), Some(&selector))
                .await
                .map_err(|err| ReconcileError::new(Reason::ApplyError, err.to_string()))?;
            for object in objects {
                let key = ObjectKey {
                    namespace: object.metadata.namespace.clone(),
                    name: object.metadata.name.clone().unwrap_or_default(),
                };
                downstream
                    .delete_dynamic(&gvk, &key)
                    .await
                    .map_err(|err| ReconcileError::new(Reason::ApplyError, err.to_string()))?;
            }
        }

        // The manager-side agent bundle for the old namespace.
        let bundle_key = ObjectKey::namespaced(
            cluster.namespace().unwrap_or_default(),
            safe_concat_name([AGENT_BUNDLE_PREFIX, cluster.name()]),
        );
        self.manager
            .delete_raw("Bundle", &bundle_key)
            .await
            .map_err(|err| ReconcileError::new(Reason::Internal, err.to_string()))?;
        Ok(())
    }

    async fn apply_agent_manifest(
        &self,
        downstream: &dyn ObjectStore,
        namespace: &str,
        objects: Vec<DynamicObject>,
    ) -> Result<(), ReconcileError> {
        let agent_namespace = DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".to_string(),
                kind: "Namespace".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            data: serde_json::json!({}),
        };
        downstream
            .apply_dynamic(agent_namespace)
            .await
            .map_err(|err| ReconcileError::new(Reason::ApplyError, err.to_string()))?;

        for object in objects {
            downstream
                .apply_dynamic(object)
                .await
                .map_err(|err| ReconcileError::new(Reason::ApplyError, err.to_string()))?;
        }
        Ok(())
    }

    async fn import(
        &self,
        cluster: &mut Cluster,
        config: &ControllerConfig,
        kube_config: &KubeConfig,
    ) -> Result<(), ReconcileError> {
        if config.agent_tls_mode == AgentTlsMode::Strict
            && config.api_server_ca.is_none()
            && kube_config.api_server_ca.is_none()
        {
            return Err(ReconcileError::new(
                Reason::ValidationError,
                "strict TLS mode requires an API server CA",
            ));
        }

        let downstream = self.connector.connect(kube_config).await.map_err(|err| {
            ReconcileError::new(Reason::SmokeTestFailed, err.to_string())
                .with_retry(Retry::After(TOKEN_CLUSTER_ENQUEUE_DELAY))
        })?;

        if !smoke_test(downstream.as_ref()).await {
            return Err(ReconcileError::new(
                Reason::SmokeTestFailed,
                "downstream cluster did not answer the pre-import check",
            )
            .with_retry(Retry::After(TOKEN_CLUSTER_ENQUEUE_DELAY)));
        }

        // Pick the endpoint the agent phones home to, preferring per-cluster
        // overrides from the kubeconfig secret.
        let api_server_url = kube_config
            .api_server_url
            .clone()
            .unwrap_or_else(|| config.api_server_url.clone());
        let mut api_server_ca = kube_config
            .api_server_ca
            .clone()
            .or_else(|| config.api_server_ca.clone());
        if config.agent_tls_mode == AgentTlsMode::SystemStore
            && self.connector.probe_insecure(&api_server_url).await
        {
            // Reachable through the system trust store; the bundled CA
            // would only get in the way of rotation.
            api_server_ca = None;
        }

        let registration_token = ensure_registration_token(
            self.manager.as_ref(),
            cluster,
            config.cluster_import_token_ttl,
        )
        .await
        .map_err(|err| {
            ReconcileError::new(Reason::TokenCreation, err.to_string())
                .with_retry(Retry::After(TOKEN_CLUSTER_ENQUEUE_DELAY))
        })?;

        let requested_namespace = requested_agent_namespace(cluster, config);
        let observed_namespace = cluster
            .status
            .as_ref()
            .and_then(|status| status.agent_namespace.clone());

        // Legacy default: clusters still sitting in the deprecated
        // namespace migrate unless the operator opted into it explicitly.
        let legacy_migration = observed_namespace.as_deref() == Some(LEGACY_AGENT_NAMESPACE)
            && !config.agent_namespace_explicit;
        if let Some(old_namespace) = &observed_namespace {
            if old_namespace != &requested_namespace || legacy_migration {
                self.cleanup_old_namespace(downstream.as_ref(), cluster, old_namespace)
                    .await?;
            }
        }

        let opts = AgentManifestOptions {
            agent_namespace: requested_namespace.clone(),
            agent_scope: agent_scope_from_env(),
            image: image::resolve(
                config.global_registry.as_deref(),
                config.image_repo_prefix.as_deref(),
                &config.agent_image,
            ),
            api_server_url: api_server_url.clone(),
            api_server_ca: api_server_ca.clone(),
            client_id: cluster.spec.client_id.clone().unwrap_or_default(),
            registration_token: Some(registration_token),
            check_in_interval: checkin_interval_from_env()
                .unwrap_or(config.agent_check_in_interval),
            garbage_collection_interval: config.garbage_collection_interval,
            tolerations: cluster.spec.agent_tolerations.clone(),
            affinity: cluster.spec.agent_affinity.clone(),
            resources: cluster.spec.agent_resources.clone(),
            env_vars: cluster.spec.agent_env_vars.clone(),
            host_network: cluster.spec.host_network,
            replicas: cluster
                .spec
                .agent_replicas
                .or_else(agent_replicas_from_env)
                .unwrap_or(1),
            scheduling: cluster.spec.agent_scheduling_customization.clone(),
        };
        let objects = agent_manifest(&opts)
            .map_err(|err| ReconcileError::new(Reason::Internal, err.to_string()))?;
        self.apply_agent_manifest(downstream.as_ref(), &requested_namespace, objects)
            .await?;

        let spec = cluster.spec.clone();
        let generation = cluster.generation();
        let status = cluster.status.get_or_insert_with(Default::default);
        status.agent_deployed_generation = Some(spec.redeploy_agent_generation);
        status.agent_migrated = true;
        status.cattle_namespace_migrated = true;
        status.agent_namespace_migrated = true;
        status.agent_config_changed = false;
        status.agent_namespace = Some(requested_namespace);
        status.api_server_url = Some(api_server_url);
        status.api_server_ca_hash = config.api_server_ca.as_ref().map(hash_of);
        status.agent_tls_mode = Some(config.agent_tls_mode);
        status.garbage_collection_interval = Some(gc_interval_string(config));
        status.agent_tolerations_hash = Some(hash_of(&spec.agent_tolerations));
        status.agent_affinity_hash = Some(hash_of(&spec.agent_affinity));
        status.agent_resources_hash = Some(hash_of(&spec.agent_resources));
        status.agent_env_vars_hash = Some(hash_of(&spec.agent_env_vars));
        status.agent_host_network = spec.host_network;
        status.agent_replicas = spec.agent_replicas;
        set_ready_condition(&mut status.conditions, None, generation);

        self.write_status(cluster).await?;
        info!(cluster = %cluster.key(), "agent deployed");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ClusterImportReconciler {
    type Key = ObjectKey;

    fn name(&self) -> &'static str {
        "cluster-import"
    }

    #[instrument(skip(self, _cancel), fields(cluster = %key))]
    async fn reconcile(
        &self,
        key: &ObjectKey,
        _cancel: &CancellationToken,
    ) -> Result<Outcome, ReconcileError> {
        let Some(mut cluster) = self
            .manager
            .get::<Cluster>(key)
            .await
            .map_err(|err| ReconcileError::new(Reason::Internal, err.to_string()))?
        else {
            return Ok(Outcome::Done);
        };

        if cluster.spec.paused {
            return Ok(Outcome::Done);
        }

        let config = self.config.get();

        // The derived namespace exists before anything else; the matcher
        // fans BundleDeployments into it.
        let derived_namespace =
            ensure_cluster_namespace(self.manager.as_ref(), &cluster)
                .await
                .map_err(|err| ReconcileError::new(Reason::Internal, err.to_string()))?;
        let namespace_missing = cluster
            .status
            .as_ref()
            .and_then(|status| status.namespace.as_deref())
            != Some(derived_namespace.as_str());
        if namespace_missing {
            cluster
                .status
                .get_or_insert_with(Default::default)
                .namespace = Some(derived_namespace);
            self.write_status(&cluster).await?;
            // Pick up the fresh resourceVersion before any spec write.
            if let Some(fresh) = self
                .manager
                .get::<Cluster>(key)
                .await
                .map_err(|err| ReconcileError::new(Reason::Internal, err.to_string()))?
            {
                cluster = fresh;
            }
        }

        let requested_namespace = requested_agent_namespace(&cluster, &config);

        // Client-id assignment stays separate from the heavier import path:
        // assign and let the follow-up reconcile drive the import.
        if cluster.spec.kube_config_secret.is_some()
            && !agent_deployed(&cluster, &requested_namespace)
            && cluster.spec.client_id.as_deref().unwrap_or_default().is_empty()
        {
            cluster.spec.client_id = Some(generate_token());
            self.manager
                .update(&cluster)
                .await
                .map_err(|err| ReconcileError::new(Reason::Conflict, err.to_string()))?;
            debug!(cluster = %cluster.key(), "assigned client id");
            return Ok(Outcome::Done);
        }

        let Some(secret_name) = cluster.spec.kube_config_secret.clone() else {
            // Downstream-initiated registration; nothing to import from
            // this side.
            return Ok(Outcome::Done);
        };

        let secret_namespace = cluster
            .spec
            .kube_config_secret_namespace
            .clone()
            .unwrap_or_else(|| cluster.namespace().unwrap_or_default().to_string());
        let secret = self
            .manager
            .get_dynamic(
                &GroupVersionKind {
                    group: String::new(),
                    version: "v1".to_string(),
                    kind: "Secret".to_string(),
                },
                &ObjectKey::namespaced(&secret_namespace, &secret_name),
            )
            .await
            .map_err(|err| ReconcileError::new(Reason::Internal, err.to_string()))?;
        let Some(secret) = secret else {
            let err = ReconcileError::new(
                Reason::KubeConfigMissing,
                format!("kubeconfig secret {secret_namespace}/{secret_name} not found"),
            )
            .with_retry(Retry::After(TOKEN_CLUSTER_ENQUEUE_DELAY));
            self.surface_error(&mut cluster, &err).await;
            return Err(err);
        };
        let kube_config = match KubeConfig::from_secret(&secret) {
            Ok(kube_config) => kube_config,
            Err(err) => {
                let err = ReconcileError::new(Reason::KubeConfigMissing, err.to_string())
                    .with_retry(Retry::After(TOKEN_CLUSTER_ENQUEUE_DELAY));
                self.surface_error(&mut cluster, &err).await;
                return Err(err);
            }
        };

        // Detect manager-side config drift; flipping the flag is the single
        // trigger that un-gates re-import.
        if agent_deployed(&cluster, &requested_namespace) {
            let drifted = cluster.status.as_ref().is_some_and(|status| {
                agent_config_changed(
                    status,
                    &config,
                    kube_config.api_server_url.is_some(),
                    kube_config.api_server_ca.is_some(),
                )
            }) || scheduling_changed(&cluster);
            if !drifted {
                return Ok(Outcome::Done);
            }
            cluster
                .status
                .get_or_insert_with(Default::default)
                .agent_config_changed = true;
            self.write_status(&cluster).await?;
        }

        if let Err(err) = self.import(&mut cluster, &config, &kube_config).await {
            self.surface_error(&mut cluster, &err).await;
            return Err(err);
        }
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_status(redeploy_generation: i64, status: ClusterStatus) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                namespace: Some("fleet-default".into()),
                name: Some("c1".into()),
                ..Default::default()
            },
            spec: flotilla_core::crd::ClusterSpec {
                redeploy_agent_generation: redeploy_generation,
                ..Default::default()
            },
            status: Some(status),
        }
    }

    fn deployed_status(config: &ControllerConfig) -> ClusterStatus {
        let spec = flotilla_core::crd::ClusterSpec::default();
        ClusterStatus {
            agent_migrated: true,
            cattle_namespace_migrated: true,
            agent_namespace_migrated: true,
            agent_config_changed: false,
            agent_deployed_generation: Some(0),
            agent_namespace: Some(config.agent_namespace.clone()),
            api_server_url: Some(config.api_server_url.clone()),
            api_server_ca_hash: config.api_server_ca.as_ref().map(hash_of),
            agent_tls_mode: Some(config.agent_tls_mode),
            garbage_collection_interval: Some(gc_interval_string(config)),
            agent_tolerations_hash: Some(hash_of(&spec.agent_tolerations)),
            agent_affinity_hash: Some(hash_of(&spec.agent_affinity)),
            agent_resources_hash: Some(hash_of(&spec.agent_resources)),
            agent_env_vars_hash: Some(hash_of(&spec.agent_env_vars)),
            ..Default::default()
        }
    }

    #[test]
    fn agent_deployed_requires_every_gate() {
        let config = ControllerConfig::default();
        let requested = config.agent_namespace.clone();

        let cluster = cluster_with_status(0, deployed_status(&config));
        assert!(agent_deployed(&cluster, &requested));

        let mut config_changed = cluster.clone();
        config_changed.status.as_mut().unwrap().agent_config_changed = true;
        assert!(!agent_deployed(&config_changed, &requested));

        let mut generation_bumped = cluster.clone();
        generation_bumped.spec.redeploy_agent_generation = 1;
        assert!(!agent_deployed(&generation_bumped, &requested));

        let mut moved = cluster.clone();
        moved.status.as_mut().unwrap().agent_namespace = Some("elsewhere".into());
        assert!(!agent_deployed(&moved, &requested));

        let mut never_deployed = cluster;
        never_deployed.status.as_mut().unwrap().agent_deployed_generation = None;
        assert!(!agent_deployed(&never_deployed, &requested));
    }

    #[test]
    fn config_drift_detection() {
        let mut config = ControllerConfig::default();
        config.api_server_url = "https://old.example".into();
        let status = deployed_status(&config);

        assert!(!agent_config_changed(&status, &config, false, false));

        let mut new_url = config.clone();
        new_url.api_server_url = "https://new.example".into();
        assert!(agent_config_changed(&status, &new_url, false, false));
        // Sourced from the kubeconfig secret: the manager value is ignored.
        assert!(!agent_config_changed(&status, &new_url, true, false));

        let mut new_interval = config.clone();
        new_interval.garbage_collection_interval = std::time::Duration::from_secs(60);
        assert!(agent_config_changed(&status, &new_interval, false, false));

        let mut new_tls = config;
        new_tls.agent_tls_mode = AgentTlsMode::Strict;
        assert!(agent_config_changed(&status, &new_tls, false, false));
    }

    #[test]
    fn scheduling_drift_detection() {
        let config = ControllerConfig::default();
        let cluster = cluster_with_status(0, deployed_status(&config));
        assert!(!scheduling_changed(&cluster));

        let mut scaled = cluster;
        scaled.spec.agent_replicas = Some(3);
        assert!(scheduling_changed(&scaled));
    }
}
