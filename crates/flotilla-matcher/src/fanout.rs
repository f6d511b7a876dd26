//! Bundle fan-out: computes the BundleDeployment set for a bundle and
//! converges the store towards it, within the rollout limits.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flotilla_core::controller::{Outcome, Reconciler};
use flotilla_core::crd::{
    Bundle, BundleDeployment, BundleDeploymentOptions, BundleDeploymentSpec, BundleState,
    Cluster, ClusterGroup, Content, FleetResource as _, deployment_id,
};
use flotilla_core::error::{ReconcileError, Reason, set_ready_condition};
use flotilla_core::labels::{
    BUNDLE_NAME_LABEL, BUNDLE_NAMESPACE_LABEL, CLUSTER_LABEL, CLUSTER_NAMESPACE_LABEL,
};
use flotilla_core::manifest::Manifest;
use flotilla_core::store::{
    ObjectKey, ObjectStore, ObjectStoreExt as _, StoreError, retry_on_conflict,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::rollout::{MAX_NEW, max_unavailable};
use crate::summary::aggregate_bundle_status;
use crate::target::{eligible, select_target};
use crate::template;

/// Requeue delay when fan-out was throttled by rollout limits or waiting on
/// cluster namespaces.
const THROTTLED_REQUEUE: Duration = Duration::from_secs(15);

pub struct BundleReconciler {
    pub manager: Arc<dyn ObjectStore>,
}

fn internal(err: impl std::fmt::Display) -> ReconcileError {
    ReconcileError::new(Reason::Internal, err.to_string())
}

impl BundleReconciler {
    fn bundle_selector(namespace: &str, name: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some(BTreeMap::from([
                (BUNDLE_NAME_LABEL.to_string(), name.to_string()),
                (BUNDLE_NAMESPACE_LABEL.to_string(), namespace.to_string()),
            ])),
            ..Default::default()
        }
    }

    async fn existing_deployments(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<BundleDeployment>, StoreError> {
        self.manager
            .list(None, Some(&Self::bundle_selector(namespace, name)))
            .await
    }

    /// Removes every BundleDeployment of a deleted bundle and sweeps
    /// content blobs nothing references anymore.
    async fn cleanup_deleted(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let namespace = key.namespace.clone().unwrap_or_default();
        for bd in self
            .existing_deployments(&namespace, &key.name)
            .await
            .map_err(internal)?
        {
            self.manager
                .delete::<BundleDeployment>(&bd.key())
                .await
                .map_err(internal)?;
        }
        self.garbage_collect_content().await.map_err(internal)?;
        Ok(())
    }

    async fn garbage_collect_content(&self) -> Result<(), StoreError> {
        let deployments: Vec<BundleDeployment> = self.manager.list(None, None).await?;
        let referenced: BTreeSet<String> = deployments
            .iter()
            .filter_map(|bd| bd.spec.deployment_id.split(':').next())
            .map(String::from)
            .collect();
        for content in self.manager.list::<Content>(None, None).await? {
            if !referenced.contains(content.name()) {
                self.manager.delete::<Content>(&content.key()).await?;
            }
        }
        Ok(())
    }

    /// Computes the effective options for one cluster: template values
    /// folded before the merge, the override merged over the base, then
    /// remaining value leaves rendered.
    fn effective_options(
        bundle: &Bundle,
        cluster: &Cluster,
        overrides: &BundleDeploymentOptions,
    ) -> Result<BundleDeploymentOptions, ReconcileError> {
        let context = template::template_context(cluster, bundle);
        let labels = cluster.labels();

        let mut base = bundle.spec.options.clone();
        let mut overrides = overrides.clone();
        for options in [&mut base, &mut overrides] {
            let Some(helm) = options.helm.as_mut() else {
                continue;
            };
            if helm.disable_preprocess {
                continue;
            }
            if let Some(template_values) = helm.template_values.take() {
                let values = helm.values.get_or_insert_with(Default::default);
                template::fold_template_values(values, &template_values, &context).map_err(
                    |err| ReconcileError::new(Reason::ValidationError, err.to_string()),
                )?;
            }
        }

        let mut effective = base
            .merged_with(&overrides)
            .map_err(|err| ReconcileError::new(Reason::Internal, err.to_string()))?;

        if let Some(helm) = effective.helm.as_mut() {
            if let Some(values) = helm.values.as_mut() {
                let mut tree = Value::Object(std::mem::take(values));
                template::interpolate_labels(&mut tree, &labels);
                if !helm.disable_preprocess {
                    template::render_value_leaves(&mut tree, &context).map_err(|err| {
                        ReconcileError::new(Reason::ValidationError, err.to_string())
                    })?;
                }
                if let Value::Object(map) = tree {
                    *values = map;
                }
            }
        }
        Ok(effective)
    }

    async fn write_status(&self, bundle: &Bundle) -> Result<(), ReconcileError> {
        let key = bundle.key();
        let status = bundle.status.clone();
        retry_on_conflict(|| {
            let key = key.clone();
            let status = status.clone();
            async move {
                let Some(mut fresh) = self.manager.get::<Bundle>(&key).await? else {
                    return Ok(());
                };
                fresh.status = status;
                self.manager.update_status(&fresh).await.map(|_| ())
            }
        })
        .await
        .map_err(|err| ReconcileError::new(Reason::Conflict, err.to_string()))
    }

    async fn surface_error(&self, bundle: &mut Bundle, err: &ReconcileError) {
        let generation = bundle.generation();
        let status = bundle.status.get_or_insert_with(Default::default);
        set_ready_condition(&mut status.conditions, Some(err), generation);
        let _ = self.write_status(bundle).await;
    }
}

#[async_trait]
impl Reconciler for BundleReconciler {
    type Key = ObjectKey;

    fn name(&self) -> &'static str {
        "bundle"
    }

    #[instrument(skip(self, _cancel), fields(bundle = %key))]
    async fn reconcile(
        &self,
        key: &ObjectKey,
        _cancel: &CancellationToken,
    ) -> Result<Outcome, ReconcileError> {
        let Some(mut bundle) = self.manager.get::<Bundle>(key).await.map_err(internal)? else {
            self.cleanup_deleted(key).await?;
            return Ok(Outcome::Done);
        };

        let namespace = bundle.namespace().unwrap_or_default().to_string();
        let clusters: Vec<Cluster> = self
            .manager
            .list(Some(&namespace), None)
            .await
            .map_err(internal)?;
        let groups: Vec<ClusterGroup> = self
            .manager
            .list(Some(&namespace), None)
            .await
            .map_err(internal)?;

        // Content first; a broken manifest is terminal until the spec
        // changes, and must never touch downstream state.
        let manifest = Manifest::new(bundle.spec.resources.clone());
        let (manifest_id, processed) = match manifest.process().and_then(|processed| {
            processed.id().map(|id| (id, processed))
        }) {
            Ok((id, processed)) => (id, processed),
            Err(err) => {
                let reason = match &err {
                    flotilla_core::manifest::Error::BadEncoding { .. } => Reason::BadEncoding,
                    flotilla_core::manifest::Error::PatchTargetMissing { .. } => {
                        Reason::PatchTargetMissing
                    }
                    flotilla_core::manifest::Error::PatchApply { .. }
                    | flotilla_core::manifest::Error::PatchOperations { .. } => {
                        Reason::PatchApply
                    }
                    _ => Reason::BadManifest,
                };
                let err = ReconcileError::new(reason, err.to_string());
                self.surface_error(&mut bundle, &err).await;
                return Err(err);
            }
        };

        match Content::from_manifest(&processed) {
            Ok(content) => match self.manager.create(&content).await {
                Ok(_) | Err(StoreError::AlreadyExists { .. }) => {}
                Err(err) => return Err(internal(err)),
            },
            Err(err) => return Err(internal(err)),
        }

        // Who gets the bundle, and with which options.
        let mut desired: BTreeMap<ObjectKey, (BundleDeployment, String)> = BTreeMap::new();
        let mut waiting_for_namespace = false;
        for cluster in &clusters {
            if !eligible(&bundle, cluster, &groups)
                .map_err(|err| ReconcileError::new(Reason::ValidationError, err.to_string()))?
            {
                continue;
            }
            let Some(target) = select_target(&bundle, cluster, &groups)
                .map_err(|err| ReconcileError::new(Reason::ValidationError, err.to_string()))?
            else {
                continue;
            };
            if target.do_not_deploy {
                continue;
            }

            let Some(cluster_namespace) = cluster
                .status
                .as_ref()
                .and_then(|status| status.namespace.clone())
            else {
                // The cluster has not been given its namespace yet; try
                // again shortly.
                waiting_for_namespace = true;
                continue;
            };

            let options = match Self::effective_options(&bundle, cluster, &target.options) {
                Ok(options) => options,
                Err(err) => {
                    self.surface_error(&mut bundle, &err).await;
                    return Err(err);
                }
            };
            let id = deployment_id(&manifest_id, &options).map_err(internal)?;

            let bd = BundleDeployment {
                metadata: ObjectMeta {
                    namespace: Some(cluster_namespace.clone()),
                    name: Some(bundle.name().to_string()),
                    labels: Some(BTreeMap::from([
                        (BUNDLE_NAME_LABEL.to_string(), bundle.name().to_string()),
                        (BUNDLE_NAMESPACE_LABEL.to_string(), namespace.clone()),
                        (CLUSTER_LABEL.to_string(), cluster.name().to_string()),
                        (CLUSTER_NAMESPACE_LABEL.to_string(), namespace.clone()),
                    ])),
                    ..Default::default()
                },
                spec: BundleDeploymentSpec {
                    paused: bundle.spec.paused,
                    deployment_id: id.clone(),
                    correct_drift: options.correct_drift.clone(),
                    options,
                },
                status: None,
            };
            desired.insert(ObjectKey::namespaced(&cluster_namespace, bundle.name()), (bd, id));
        }

        let existing = self
            .existing_deployments(&namespace, bundle.name())
            .await
            .map_err(internal)?;
        let existing_by_key: BTreeMap<ObjectKey, BundleDeployment> = existing
            .into_iter()
            .map(|bd| (bd.key(), bd))
            .collect();

        // Rollout limits: creations are capped hard, disruptive updates by
        // the unavailability budget.
        let total = i32::try_from(desired.len()).unwrap_or(i32::MAX);
        let unavailable_budget = max_unavailable(bundle.spec.options.rollout.as_ref(), total);
        let mut unavailable = existing_by_key
            .values()
            .filter(|bd| !BundleState::of(bd).is_ready())
            .count() as i32;
        let mut created = 0;
        let mut throttled = false;

        for (bd_key, (mut bd, id)) in desired.clone() {
            match existing_by_key.get(&bd_key) {
                None => {
                    if created >= MAX_NEW {
                        throttled = true;
                        continue;
                    }
                    self.manager.create(&bd).await.map_err(internal)?;
                    created += 1;
                    debug!(deployment = %bd_key, "created");
                }
                Some(existing) if existing.spec.deployment_id != id => {
                    let disruptive = BundleState::of(existing).is_ready();
                    if disruptive && unavailable >= unavailable_budget {
                        throttled = true;
                        continue;
                    }
                    if disruptive {
                        unavailable += 1;
                    }
                    let mut updated = existing.clone();
                    updated.spec = bd.spec.clone();
                    updated.metadata.labels = bd.metadata.labels.take();
                    self.manager.update(&updated).await.map_err(internal)?;
                    debug!(deployment = %bd_key, "updated");
                }
                Some(_) => {}
            }
        }

        // Deployments whose cluster fell out of the target set.
        for (bd_key, _) in existing_by_key {
            if !desired.contains_key(&bd_key) {
                info!(deployment = %bd_key, "removing deployment for unmatched cluster");
                self.manager
                    .delete::<BundleDeployment>(&bd_key)
                    .await
                    .map_err(internal)?;
            }
        }
        self.garbage_collect_content().await.map_err(internal)?;

        // Roll the result up into the bundle status.
        let matched = self
            .existing_deployments(&namespace, bundle.name())
            .await
            .map_err(internal)?;
        let mut status = aggregate_bundle_status(&bundle, &matched);
        status.max_unavailable = unavailable_budget;
        status.max_new = MAX_NEW;
        let generation = bundle.generation();
        set_ready_condition(&mut status.conditions, None, generation);
        bundle.status = Some(status);
        self.write_status(&bundle).await?;

        if throttled || waiting_for_namespace {
            return Ok(Outcome::RequeueAfter(THROTTLED_REQUEUE));
        }
        Ok(Outcome::Done)
    }
}
