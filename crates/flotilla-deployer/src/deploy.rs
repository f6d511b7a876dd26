//! Install/upgrade/rollback against the downstream store and the release
//! history. The deployer is the only writer for its releases; per-release
//! write ordering comes from the release store's own locking.

use std::time::Duration;

use flotilla_core::crd::BundleDeploymentOptions;
use flotilla_core::kube::core::{DynamicObject, TypeMeta};
use flotilla_core::labels;
use flotilla_core::manifest::Manifest;
use flotilla_core::store::gvk_of;
use flotilla_render::RenderRequest;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use snafu::ResultExt as _;
use tracing::{debug, info, warn};

use crate::plan::ObjectRef;
use crate::release::{MAX_HELM_HISTORY, Release, ReleaseState};
use crate::{
    ApplySnafu, Deployer, Error, ManifestSnafu, ObjectCodecSnafu, ReleasesSnafu, RenderSnafu,
};

/// Execution context for one apply, bound to the deployer's agent identity.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub namespace: String,
    /// Service account impersonated for the apply, when the options name
    /// one.
    pub service_account: Option<String>,
    pub max_history: usize,
    pub timeout: Option<Duration>,
    pub force: bool,
    pub adopt: bool,
}

pub(crate) fn get_cfg(namespace: &str, options: &BundleDeploymentOptions) -> ExecutionContext {
    let helm = options.helm.as_ref();
    ExecutionContext {
        namespace: namespace.to_string(),
        service_account: options.service_account.clone(),
        max_history: helm
            .and_then(|helm| helm.max_history)
            .filter(|&max| max > 0)
            .unwrap_or(MAX_HELM_HISTORY)
            .min(MAX_HELM_HISTORY),
        timeout: helm
            .and_then(|helm| helm.timeout_seconds)
            .filter(|&seconds| seconds > 0)
            .map(Duration::from_secs),
        force: helm.is_some_and(|helm| helm.force),
        adopt: helm.is_some_and(|helm| helm.take_ownership),
    }
}

impl Deployer {
    /// Renders and applies one deployment, driving the release history
    /// through install, upgrade, or the pending-operation recovery path.
    /// Dry runs stop after rendering and never mutate.
    pub async fn deploy(
        &self,
        bundle_id: &str,
        manifest: &Manifest,
        options: &BundleDeploymentOptions,
        commit: Option<&str>,
        dry_run: bool,
    ) -> Result<Release, Error> {
        let rendered = self
            .renderer
            .render(RenderRequest {
                bundle_id,
                manifest,
                options,
                default_namespace: &self.default_namespace,
                label_prefix: &self.label_prefix,
                label_suffix: &self.label_suffix,
                agent_namespace: &self.agent_namespace,
                commit,
            })
            .await
            .context(RenderSnafu)?;

        let ctx = get_cfg(&rendered.namespace, options);
        let namespace = rendered.namespace.clone();
        let name = rendered.release_name.clone();

        let processed = manifest.process().context(ManifestSnafu)?;
        let deployment_id = flotilla_core::crd::deployment_id(
            &processed.id().context(ManifestSnafu)?,
            options,
        )
        .context(ObjectCodecSnafu { name: bundle_id })?;

        let mut last = self
            .releases
            .last(&namespace, &name)
            .await
            .context(ReleasesSnafu)?;

        // A crashed uninstall left the release half-gone; finish the job
        // before touching anything else.
        if let Some(release) = &last {
            if release.state == ReleaseState::Uninstalling && !dry_run {
                self.uninstall(release, options.keep_resources).await?;
                last = None;
            }
        }

        let deployed = self
            .releases
            .deployed(&namespace, &name)
            .await
            .context(ReleasesSnafu)?;

        let revision = last.as_ref().map_or(1, |release| release.revision + 1);
        let mut release = Release {
            namespace: namespace.clone(),
            name: name.clone(),
            revision,
            state: ReleaseState::PendingInstall,
            chart: rendered.chart.clone(),
            values: rendered.values.clone(),
            objects: rendered.objects.clone(),
            deployment_id,
        };

        if dry_run {
            release.state = ReleaseState::Deployed;
            return Ok(release);
        }

        match deployed {
            None => {
                debug!(release = release.key(), "installing");
                self.install(&mut release, &ctx).await?;
            }
            Some(mut deployed) => {
                // Another operation (install/upgrade/rollback) in progress:
                // roll back to the last known-good revision and retry the
                // upgrade exactly once.
                if last.as_ref().is_some_and(|last| last.state.is_pending()) {
                    warn!(
                        release = release.key(),
                        "pending operation found, rolling back before upgrade"
                    );
                    let recovered = self.rollback(&namespace, &name, &ctx).await?;
                    let last = self
                        .releases
                        .last(&namespace, &name)
                        .await
                        .context(ReleasesSnafu)?;
                    if last.as_ref().is_some_and(|last| last.state.is_pending()) {
                        return Err(Error::ReleasePending {
                            key: recovered.key(),
                        });
                    }
                    release.revision = last.as_ref().map_or(1, |last| last.revision + 1);
                    deployed = recovered;
                }

                debug!(release = release.key(), "upgrading");
                release.state = ReleaseState::PendingUpgrade;
                self.upgrade(&mut release, &deployed, options.keep_resources, &ctx)
                    .await?;
            }
        }

        info!(release = release.key(), "deployed");
        Ok(release)
    }

    async fn install(&self, release: &mut Release, ctx: &ExecutionContext) -> Result<(), Error> {
        self.ensure_namespace(&release.namespace).await?;
        self.releases
            .create(release.clone(), ctx.max_history)
            .await
            .context(ReleasesSnafu)?;

        if let Err(err) = self.apply_objects(&release.objects, ctx).await {
            release.state = ReleaseState::Failed;
            self.releases
                .update(release.clone())
                .await
                .context(ReleasesSnafu)?;
            return Err(err);
        }

        release.state = ReleaseState::Deployed;
        self.releases
            .update(release.clone())
            .await
            .context(ReleasesSnafu)?;
        Ok(())
    }

    async fn upgrade(
        &self,
        release: &mut Release,
        previous: &Release,
        keep_resources: bool,
        ctx: &ExecutionContext,
    ) -> Result<(), Error> {
        self.releases
            .create(release.clone(), ctx.max_history)
            .await
            .context(ReleasesSnafu)?;

        if let Err(err) = self.apply_objects(&release.objects, ctx).await {
            release.state = ReleaseState::Failed;
            self.releases
                .update(release.clone())
                .await
                .context(ReleasesSnafu)?;
            return Err(err);
        }

        self.delete_removed(&previous.objects, &release.objects, keep_resources)
            .await?;

        release.state = ReleaseState::Deployed;
        self.releases
            .update(release.clone())
            .await
            .context(ReleasesSnafu)?;
        self.supersede(previous).await?;
        Ok(())
    }

    /// Creates a new revision from the latest deployed content and applies
    /// it. Used both for pending-operation recovery and drift correction.
    pub(crate) async fn rollback(
        &self,
        namespace: &str,
        name: &str,
        ctx: &ExecutionContext,
    ) -> Result<Release, Error> {
        let deployed = self
            .releases
            .deployed(namespace, name)
            .await
            .context(ReleasesSnafu)?
            .ok_or_else(|| Error::ReleasePending {
                key: format!("{namespace}/{name}"),
            })?;

        // Drop the pending revision the crashed writer left behind.
        let last = self
            .releases
            .last(namespace, name)
            .await
            .context(ReleasesSnafu)?;
        if let Some(last) = last {
            if last.state.is_pending() {
                self.releases
                    .delete(namespace, name, last.revision)
                    .await
                    .context(ReleasesSnafu)?;
            }
        }

        let mut rollback = deployed.clone();
        rollback.revision = self
            .releases
            .last(namespace, name)
            .await
            .context(ReleasesSnafu)?
            .map_or(1, |last| last.revision + 1);
        rollback.state = ReleaseState::PendingRollback;
        self.releases
            .create(rollback.clone(), ctx.max_history)
            .await
            .context(ReleasesSnafu)?;

        if let Err(err) = self.apply_objects(&rollback.objects, ctx).await {
            rollback.state = ReleaseState::Failed;
            self.releases
                .update(rollback.clone())
                .await
                .context(ReleasesSnafu)?;
            return Err(err);
        }

        rollback.state = ReleaseState::Deployed;
        self.releases
            .update(rollback.clone())
            .await
            .context(ReleasesSnafu)?;
        self.supersede(&deployed).await?;
        Ok(rollback)
    }

    /// Removes every object of a release (honoring retention annotations)
    /// and drops its history.
    pub(crate) async fn uninstall(
        &self,
        release: &Release,
        keep_resources: bool,
    ) -> Result<(), Error> {
        let mut marker = release.clone();
        marker.state = ReleaseState::Uninstalling;
        self.releases
            .update(marker)
            .await
            .context(ReleasesSnafu)?;

        let keep_all = keep_resources
            || release
                .annotation(labels::KEEP_RESOURCES_ANNOTATION)
                .is_some_and(|keep| keep == "true");
        if !keep_all {
            for object in &release.objects {
                if object_kept(object) {
                    continue;
                }
                let Ok(gvk) = gvk_of(object) else { continue };
                let key = object_store_key(object);
                self.downstream
                    .delete_dynamic(&gvk, &key)
                    .await
                    .context(ApplySnafu)?;
            }
        }

        self.releases
            .delete_history(&release.namespace, &release.name)
            .await
            .context(ReleasesSnafu)?;
        info!(release = release.key(), "uninstalled");
        Ok(())
    }

    async fn supersede(&self, release: &Release) -> Result<(), Error> {
        let mut superseded = release.clone();
        superseded.state = ReleaseState::Superseded;
        match self.releases.update(superseded).await {
            Ok(()) => Ok(()),
            // Already pruned from history.
            Err(crate::release::StoreError::ReleaseNotFound { .. }) => Ok(()),
        }
    }

    async fn apply_objects(
        &self,
        objects: &[DynamicObject],
        ctx: &ExecutionContext,
    ) -> Result<(), Error> {
        let apply_all = async {
            for object in objects {
                self.downstream
                    .apply_dynamic(object.clone())
                    .await
                    .context(ApplySnafu)?;
            }
            Ok(())
        };

        match ctx.timeout {
            Some(timeout) => tokio::time::timeout(timeout, apply_all)
                .await
                .map_err(|_| Error::Timeout {
                    seconds: timeout.as_secs(),
                })?,
            None => apply_all.await,
        }
    }

    /// Deletes objects from the previous revision that the new content no
    /// longer declares.
    async fn delete_removed(
        &self,
        previous: &[DynamicObject],
        current: &[DynamicObject],
        keep_resources: bool,
    ) -> Result<(), Error> {
        if keep_resources {
            return Ok(());
        }
        let current_refs: std::collections::BTreeSet<ObjectRef> =
            current.iter().map(ObjectRef::of).collect();
        for object in previous {
            if current_refs.contains(&ObjectRef::of(object)) || object_kept(object) {
                continue;
            }
            let Ok(gvk) = gvk_of(object) else { continue };
            self.downstream
                .delete_dynamic(&gvk, &object_store_key(object))
                .await
                .context(ApplySnafu)?;
        }
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), Error> {
        let ns = DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".into(),
                kind: "Namespace".into(),
            }),
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            data: serde_json::json!({}),
        };
        self.downstream
            .apply_dynamic(ns)
            .await
            .context(ApplySnafu)?;
        Ok(())
    }
}

fn object_kept(object: &DynamicObject) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| {
            annotations
                .get(labels::HELM_RESOURCE_POLICY_ANNOTATION)
                .map(String::as_str)
                == Some(labels::HELM_RESOURCE_POLICY_KEEP)
                || annotations
                    .get(labels::KEEP_RESOURCES_ANNOTATION)
                    .map(String::as_str)
                    == Some("true")
        })
}

fn object_store_key(object: &DynamicObject) -> flotilla_core::store::ObjectKey {
    flotilla_core::store::ObjectKey {
        namespace: object.metadata.namespace.clone(),
        name: object.metadata.name.clone().unwrap_or_default(),
    }
}
