//! Orphaned-release cleanup: uninstalls releases whose BundleDeployment is
//! gone or whose release address no longer matches the options.

use flotilla_core::crd::{BundleDeployment, FleetResource as _};
use flotilla_core::labels;
use snafu::ResultExt as _;
use tracing::info;

use crate::{Deployer, Error, ReleasesSnafu};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub uninstalled: Vec<String>,
    pub history_dropped: Vec<String>,
}

impl Deployer {
    /// Compares every stored release against the given BundleDeployments
    /// and removes what nothing references anymore. Agent releases are
    /// never uninstalled; only their history entries are dropped.
    pub async fn cleanup(
        &self,
        bundle_deployments: &[BundleDeployment],
    ) -> Result<CleanupSummary, Error> {
        let mut summary = CleanupSummary::default();

        for release in self.releases.list().await.context(ReleasesSnafu)? {
            let Some(bundle_id) = release.annotation(labels::BUNDLE_ID_ANNOTATION) else {
                // Not one of ours.
                continue;
            };
            let bundle_id = bundle_id.to_string();

            if bundle_id.starts_with(labels::AGENT_BUNDLE_PREFIX) {
                if !bundle_deployments.iter().any(|bd| bd.name() == bundle_id) {
                    self.releases
                        .delete_history(&release.namespace, &release.name)
                        .await
                        .context(ReleasesSnafu)?;
                    summary.history_dropped.push(release.history_key());
                }
                continue;
            }

            let Some(bd) = bundle_deployments.iter().find(|bd| bd.name() == bundle_id) else {
                info!(release = release.key(), %bundle_id, "uninstalling orphaned release");
                self.uninstall(&release, false).await?;
                summary.uninstalled.push(release.history_key());
                continue;
            };

            // The deployment moved to a different namespace or release
            // name; the old release is stale.
            let (namespace, name) = self.release_address_from_options(bd);
            let expected = format!("{namespace}/{name}");
            let stored = release
                .annotation(labels::RELEASE_NAME_ANNOTATION)
                .unwrap_or_default()
                .to_string();
            if !stored.is_empty() && stored != expected {
                info!(
                    release = release.key(),
                    %stored,
                    %expected,
                    "uninstalling relocated release"
                );
                self.uninstall(&release, bd.spec.options.keep_resources).await?;
                summary.uninstalled.push(release.history_key());
            }
        }

        Ok(summary)
    }
}
