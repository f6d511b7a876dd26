//! The `deploy` and `cleanup` CLI surface: reads a serialized
//! BundleDeployment plus its content and runs the downstream deployer
//! against the default in-memory store.

use std::path::Path;
use std::sync::Arc;

use flotilla_core::config::DEFAULT_AGENT_NAMESPACE;
use flotilla_core::crd::BundleDeployment;
use flotilla_core::manifest::{BundleResource, Manifest};
use flotilla_core::store::{MemoryStore, ObjectStore};
use flotilla_deployer::{Deployer, MemoryReleaseStore, Release, ReleaseStore};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read input file {path:?}"))]
    ReadInput {
        source: std::io::Error,
        path: String,
    },

    #[snafu(display("failed to parse input file {path:?}"))]
    ParseInput {
        source: serde_yaml::Error,
        path: String,
    },

    #[snafu(display("deploy failed"))]
    Deploy { source: flotilla_deployer::Error },
}

impl Error {
    /// Process exit code; the taxonomy reasons map onto distinct codes so
    /// harnesses can tell apart bad input from apply failures.
    pub fn exit_code(&self) -> u8 {
        use flotilla_core::error::Reason;
        match self {
            Self::ReadInput { .. } | Self::ParseInput { .. } => 2,
            Self::Deploy { source } => match source.reason() {
                Reason::BadManifest
                | Reason::BadEncoding
                | Reason::PatchApply
                | Reason::PatchTargetMissing => 3,
                Reason::ReleasePending => 4,
                _ => 5,
            },
        }
    }
}

/// Serialized input for one deploy: the deployment spec and its content.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployInput {
    pub bundle_deployment: BundleDeployment,

    #[serde(default)]
    pub resources: Vec<BundleResource>,
}

impl DeployInput {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).context(ReadInputSnafu {
            path: path.display().to_string(),
        })?;
        serde_yaml::from_str(&raw).context(ParseInputSnafu {
            path: path.display().to_string(),
        })
    }
}

fn default_deployer() -> (Arc<MemoryStore>, Arc<MemoryReleaseStore>, Deployer) {
    let downstream = Arc::new(MemoryStore::new());
    let releases = Arc::new(MemoryReleaseStore::new());
    let deployer = Deployer::new(
        Arc::clone(&downstream) as Arc<dyn ObjectStore>,
        Arc::clone(&releases) as Arc<dyn ReleaseStore>,
        "default",
        DEFAULT_AGENT_NAMESPACE,
    );
    (downstream, releases, deployer)
}

/// Executes one deploy from an input file. `dry_run` renders and plans but
/// never writes.
pub async fn run_deploy(path: &Path, dry_run: bool) -> Result<Release, Error> {
    let input = DeployInput::from_file(path)?;
    let (_downstream, _releases, deployer) = default_deployer();

    let name = input
        .bundle_deployment
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| "deployment".to_string());
    let manifest = Manifest::new(input.resources);
    deployer
        .deploy(
            &name,
            &manifest,
            &input.bundle_deployment.spec.options,
            None,
            dry_run,
        )
        .await
        .context(DeploySnafu)
}

/// Runs release cleanup against the default store.
pub async fn run_cleanup() -> Result<flotilla_deployer::CleanupSummary, Error> {
    let (_downstream, _releases, deployer) = default_deployer();
    deployer.cleanup(&[]).await.context(DeploySnafu)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use indoc::indoc;

    use super::*;

    fn write_input(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    const INPUT: &str = indoc! {"
        bundleDeployment:
          metadata:
            name: my-app
          spec:
            deploymentId: abc:def
            options:
              defaultNamespace: apps
        resources:
          - name: cm.yaml
            content: |
              apiVersion: v1
              kind: ConfigMap
              metadata:
                name: settings
    "};

    #[tokio::test]
    async fn deploy_from_file() {
        let file = write_input(INPUT);
        let release = run_deploy(file.path(), false).await.unwrap();
        assert_eq!(release.key(), "apps/my-app:1");
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let file = write_input(INPUT);
        let release = run_deploy(file.path(), true).await.unwrap();
        assert_eq!(release.revision, 1);
    }

    #[tokio::test]
    async fn unparsable_input_is_exit_code_two() {
        let file = write_input("not yaml: [");
        let err = run_deploy(file.path(), false).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn bad_manifest_is_exit_code_three() {
        let file = write_input(indoc! {"
            bundleDeployment:
              metadata:
                name: my-app
            resources:
              - name: lonely_patch.yaml
                content: 'a: 1'
        "});
        let err = run_deploy(file.path(), false).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn cleanup_on_empty_store_is_a_noop() {
        let summary = run_cleanup().await.unwrap();
        assert!(summary.uninstalled.is_empty());
        assert!(summary.history_dropped.is_empty());
    }
}
