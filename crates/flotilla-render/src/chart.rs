//! Chart assembly: either a chart synthesized from the bundle's own
//! resources, or an archive fetched from a remote repository through the
//! external helm client.

use std::collections::BTreeMap;

use flotilla_core::manifest::Manifest;
use flotilla_core::names;
use serde::{Deserialize, Serialize};

use crate::{Error, FetchSnafu};

/// Synthesized chart version; bundles carry no version of their own.
const SYNTHESIZED_CHART_VERSION: &str = "0.1.0";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,

    /// Provenance annotations; the durable source for cleanup decisions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartFile {
    pub name: String,
    pub content: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub files: Vec<ChartFile>,
}

impl Chart {
    /// Builds a chart whose files are the (processed) manifest's resources.
    pub fn synthesize(bundle_id: &str, manifest: &Manifest) -> Self {
        let metadata = ChartMetadata {
            name: names::helm_release_name(bundle_id),
            version: SYNTHESIZED_CHART_VERSION.to_string(),
            annotations: BTreeMap::new(),
        };
        let files = manifest
            .resources
            .iter()
            .map(|resource| ChartFile {
                name: resource.name.clone(),
                content: resource.content.clone(),
            })
            .collect();
        Self { metadata, files }
    }

    pub fn file(&self, name: &str) -> Option<&ChartFile> {
        self.files.iter().find(|file| file.name == name)
    }
}

/// Remote chart reference, resolved by the external helm client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChartRef {
    pub chart: String,
    pub repo: String,
    pub version: Option<String>,
}

/// External collaborator: fetches a chart archive from an OCI or HTTP
/// repository. Authentication is the fetcher's concern.
#[async_trait::async_trait]
pub trait ChartFetcher: Send + Sync {
    async fn fetch(
        &self,
        chart: &ChartRef,
    ) -> Result<Chart, Box<dyn std::error::Error + Send + Sync>>;
}

/// Whether the chart options point at a remote repository rather than files
/// inside the bundle.
pub fn remote_chart_ref(
    options: &flotilla_core::crd::HelmOptions,
) -> Option<ChartRef> {
    let chart = options.chart.as_deref()?;
    let repo = options.repo.as_deref().unwrap_or_default();
    let is_remote = !repo.is_empty()
        || chart.starts_with("oci://")
        || chart.starts_with("http://")
        || chart.starts_with("https://");
    is_remote.then(|| ChartRef {
        chart: chart.to_string(),
        repo: repo.to_string(),
        version: options.version.clone(),
    })
}

pub(crate) async fn fetch_remote(
    fetcher: Option<&dyn ChartFetcher>,
    chart_ref: &ChartRef,
) -> Result<Chart, Error> {
    let Some(fetcher) = fetcher else {
        return FetchSnafu {
            chart: chart_ref.chart.clone(),
            message: "no chart fetcher configured".to_string(),
        }
        .fail();
    };
    fetcher.fetch(chart_ref).await.map_err(|source| Error::Fetch {
        chart: chart_ref.chart.clone(),
        message: source.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use flotilla_core::crd::HelmOptions;
    use flotilla_core::manifest::BundleResource;

    use super::*;

    #[test]
    fn synthesized_chart_carries_manifest_files() {
        let manifest = Manifest::new(vec![
            BundleResource::plain("cm.yaml", "kind: ConfigMap\n"),
            BundleResource::plain("deploy.yaml", "kind: Deployment\n"),
        ]);
        let chart = Chart::synthesize("ns-bundle", &manifest);
        assert_eq!(chart.metadata.name, "ns-bundle");
        assert_eq!(chart.metadata.version, "0.1.0");
        assert_eq!(chart.files.len(), 2);
        assert!(chart.file("cm.yaml").is_some());
    }

    #[test]
    fn chart_name_is_sanitized() {
        let chart = Chart::synthesize("My_Bundle", &Manifest::default());
        assert!(chart.metadata.name.starts_with("my-bundle-"));
    }

    #[test]
    fn remote_refs_need_repo_or_url() {
        let mut options = HelmOptions {
            chart: Some("./local".into()),
            ..Default::default()
        };
        assert!(remote_chart_ref(&options).is_none());

        options.repo = Some("https://charts.example".into());
        let chart_ref = remote_chart_ref(&options).unwrap();
        assert_eq!(chart_ref.repo, "https://charts.example");

        let oci = HelmOptions {
            chart: Some("oci://registry.example/app".into()),
            ..Default::default()
        };
        assert!(remote_chart_ref(&oci).is_some());
    }
}
