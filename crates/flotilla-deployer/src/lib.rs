//! The downstream side of the fleet manager: turns BundleDeployments into
//! live releases, keeps bounded release history, computes ready/modified
//! status by diffing desired against live state, and optionally rolls back
//! out-of-band edits.

use std::sync::Arc;

use async_trait::async_trait;
use flotilla_core::controller::{Outcome, Reconciler};
use flotilla_core::crd::{BundleDeployment, Content, FleetResource as _};
use flotilla_core::error::{ReconcileError, Reason, set_ready_condition};
use flotilla_core::labels;
use flotilla_core::store::{ObjectKey, ObjectStore, ObjectStoreExt as _, retry_on_conflict};
use flotilla_render::{Renderer, StoreValuesReader};
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

mod cleanup;
mod deploy;
mod drift;
mod plan;
pub mod release;
mod status;

pub use cleanup::CleanupSummary;
pub use deploy::ExecutionContext;
pub use drift::{DriftIndex, spawn_drift_watcher};
pub use plan::{Normalizer, ObjectRef, Plan, plan};
pub use release::{MAX_HELM_HISTORY, MemoryReleaseStore, Release, ReleaseState, ReleaseStore};
pub use status::summarize;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to render release content"))]
    Render { source: flotilla_render::Error },

    #[snafu(display("failed to process manifest"))]
    Manifest {
        source: flotilla_core::manifest::Error,
    },

    #[snafu(display("store request failed"))]
    Store {
        source: flotilla_core::store::StoreError,
    },

    #[snafu(display("downstream apply failed"))]
    Apply {
        source: flotilla_core::store::StoreError,
    },

    #[snafu(display("release store request failed"))]
    Releases { source: release::StoreError },

    #[snafu(display("failed to convert object {name:?}"))]
    ObjectCodec {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("release {key} has another operation in progress"))]
    ReleasePending { key: String },

    #[snafu(display("apply did not finish within {seconds}s"))]
    Timeout { seconds: u64 },

    #[snafu(display("content {id:?} not found"))]
    ContentMissing { id: String },
}

impl Error {
    pub fn reason(&self) -> Reason {
        match self {
            Self::Render { source } => source.reason(),
            Self::Manifest { source } => match source {
                flotilla_core::manifest::Error::BadEncoding { .. } => Reason::BadEncoding,
                flotilla_core::manifest::Error::PatchTargetMissing { .. } => {
                    Reason::PatchTargetMissing
                }
                flotilla_core::manifest::Error::PatchApply { .. }
                | flotilla_core::manifest::Error::PatchOperations { .. } => Reason::PatchApply,
                _ => Reason::BadManifest,
            },
            Self::Store { source } => match source {
                flotilla_core::store::StoreError::NotFound { .. } => Reason::NotFound,
                flotilla_core::store::StoreError::Conflict { .. } => Reason::Conflict,
                _ => Reason::Internal,
            },
            Self::Apply { .. } => Reason::ApplyError,
            Self::ReleasePending { .. } => Reason::ReleasePending,
            Self::Timeout { .. } => Reason::NetworkTimeout,
            Self::ContentMissing { .. } => Reason::BadManifest,
            Self::Releases { .. } | Self::ObjectCodec { .. } => Reason::Internal,
        }
    }
}

impl From<Error> for ReconcileError {
    fn from(err: Error) -> Self {
        Self::new(err.reason(), err.to_string())
    }
}

/// Owns the downstream release history and the apply/plan/drift loop.
pub struct Deployer {
    pub(crate) downstream: Arc<dyn ObjectStore>,
    pub(crate) releases: Arc<dyn ReleaseStore>,
    pub(crate) renderer: Renderer,
    pub(crate) default_namespace: String,
    pub(crate) agent_namespace: String,
    pub(crate) label_prefix: String,
    pub(crate) label_suffix: String,
}

impl Deployer {
    pub fn new(
        downstream: Arc<dyn ObjectStore>,
        releases: Arc<dyn ReleaseStore>,
        default_namespace: impl Into<String>,
        agent_namespace: impl Into<String>,
    ) -> Self {
        let renderer = Renderer::new()
            .with_values_reader(Arc::new(StoreValuesReader::new(Arc::clone(&downstream))));
        Self {
            downstream,
            releases,
            renderer,
            default_namespace: default_namespace.into(),
            agent_namespace: agent_namespace.into(),
            label_prefix: String::new(),
            label_suffix: String::new(),
        }
    }

    /// Scope labels for running several agents against one cluster.
    pub fn with_label_scope(
        mut self,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        self.label_prefix = prefix.into();
        self.label_suffix = suffix.into();
        self
    }

    pub fn with_chart_fetcher(
        mut self,
        fetcher: Arc<dyn flotilla_render::ChartFetcher>,
    ) -> Self {
        self.renderer = Renderer::new()
            .with_values_reader(Arc::new(StoreValuesReader::new(Arc::clone(
                &self.downstream,
            ))))
            .with_fetcher(fetcher);
        self
    }
}

/// Reconciles BundleDeployments read from the manager store into releases
/// on the downstream store.
pub struct BundleDeploymentReconciler {
    pub manager: Arc<dyn ObjectStore>,
    pub deployer: Arc<Deployer>,
    pub drift_index: Arc<DriftIndex>,
}

impl BundleDeploymentReconciler {
    async fn write_status(&self, bd: &BundleDeployment) -> Result<(), ReconcileError> {
        let key = bd.key();
        let status = bd.status.clone();
        retry_on_conflict(|| {
            let key = key.clone();
            let status = status.clone();
            async move {
                let Some(mut fresh) = self.manager.get::<BundleDeployment>(&key).await? else {
                    return Ok(());
                };
                fresh.status = status;
                self.manager.update_status(&fresh).await.map(|_| ())
            }
        })
        .await
        .map_err(|err| ReconcileError::new(Reason::Conflict, err.to_string()))
    }

    async fn surface_error(&self, bd: &mut BundleDeployment, err: &ReconcileError) {
        let generation = bd.generation();
        let status = bd.status.get_or_insert_with(Default::default);
        set_ready_condition(&mut status.conditions, Some(err), generation);
        let _ = self.write_status(bd).await;
    }
}

#[async_trait]
impl Reconciler for BundleDeploymentReconciler {
    type Key = ObjectKey;

    fn name(&self) -> &'static str {
        "bundle-deployment"
    }

    #[instrument(skip(self, _cancel), fields(deployment = %key))]
    async fn reconcile(
        &self,
        key: &ObjectKey,
        _cancel: &CancellationToken,
    ) -> Result<Outcome, ReconcileError> {
        let Some(mut bd) = self
            .manager
            .get::<BundleDeployment>(key)
            .await
            .map_err(|err| ReconcileError::new(Reason::Internal, err.to_string()))?
        else {
            // Deleted: clear it from the drift index and move on.
            self.drift_index.unregister(key);
            return Ok(Outcome::Done);
        };

        if bd.spec.paused {
            return Ok(Outcome::Done);
        }

        let set_id = labels::set_id(
            bd.name(),
            &self.deployer.label_prefix,
            &self.deployer.label_suffix,
        );
        self.drift_index.register(set_id, key.clone());

        let needs_deploy = bd
            .status
            .as_ref()
            .and_then(|status| status.applied_deployment_id.as_deref())
            != Some(bd.spec.deployment_id.as_str());

        if needs_deploy {
            let manifest_id = bd
                .spec
                .deployment_id
                .split(':')
                .next()
                .unwrap_or_default()
                .to_string();
            let content = self
                .manager
                .get::<Content>(&ObjectKey::cluster_scoped(&manifest_id))
                .await
                .map_err(|err| ReconcileError::new(Reason::Internal, err.to_string()))?;
            let Some(content) = content else {
                let err = ReconcileError::new(
                    Reason::BadManifest,
                    format!("content {manifest_id:?} not found"),
                );
                self.surface_error(&mut bd, &err).await;
                return Err(err);
            };

            let deploy_result = self
                .deployer
                .deploy(
                    bd.name(),
                    &content.manifest(),
                    &bd.spec.options,
                    None,
                    false,
                )
                .await;

            match deploy_result {
                Ok(release) => {
                    let status = bd.status.get_or_insert_with(Default::default);
                    status.applied_deployment_id = Some(bd.spec.deployment_id.clone());
                    status.release = Some(release.key());
                }
                Err(err) => {
                    let err = ReconcileError::from(err);
                    self.surface_error(&mut bd, &err).await;
                    return Err(err);
                }
            }
        }

        if let Err(err) = self
            .deployer
            .update_bundle_deployment_status(&mut bd)
            .await
        {
            let err = ReconcileError::from(err);
            self.surface_error(&mut bd, &err).await;
            return Err(err);
        }

        self.write_status(&bd).await?;
        Ok(Outcome::Done)
    }
}
