//! Turns `(bundle id, manifest, options)` into the object set a release
//! applies: chart assembly, values resolution, kustomize post-processing and
//! deterministic ownership stamping.
//!
//! Two deployments with equal deployment ids render byte-equal manifests;
//! everything here is a pure function of its inputs plus the two external
//! collaborators ([`ChartFetcher`] for remote charts, [`ValuesReader`] for
//! `valuesFrom`).

use std::collections::BTreeMap;
use std::sync::Arc;

use flotilla_core::crd::BundleDeploymentOptions;
use flotilla_core::kube::core::DynamicObject;
use flotilla_core::manifest::Manifest;
use flotilla_core::{labels, names};
use serde_json::{Map, Value};
use snafu::{ResultExt as _, Snafu};

mod chart;
mod kustomize;
mod postrender;
pub mod scope;
mod values;

pub use chart::{Chart, ChartFetcher, ChartFile, ChartMetadata, ChartRef, remote_chart_ref};
pub use values::{DEFAULT_VALUES_KEY, StoreValuesReader, ValuesReader};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to process bundle manifest"))]
    Manifest {
        source: flotilla_core::manifest::Error,
    },

    #[snafu(display("failed to parse rendered object in {file:?}"))]
    ParseObject {
        source: serde_yaml::Error,
        file: String,
    },

    #[snafu(display("failed to convert object {name:?}"))]
    ObjectCodec {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("object in {file:?} has no apiVersion/kind"))]
    MissingTypes { file: String },

    #[snafu(display(
        "cluster-scoped {kind} {name:?} cannot be deployed under a target namespace"
    ))]
    ClusterScopedUnderNamespace { kind: String, name: String },

    #[snafu(display("failed to fetch chart {chart:?}: {message}"))]
    Fetch { chart: String, message: String },

    #[snafu(display("failed to parse kustomization {path:?}"))]
    Kustomize {
        source: serde_yaml::Error,
        path: String,
    },

    #[snafu(display("kustomization references missing file {path:?}"))]
    KustomizeResourceMissing { path: String },

    #[snafu(display("failed to apply kustomize patch to {name:?}"))]
    KustomizePatch {
        source: json_patch::PatchError,
        name: String,
    },

    #[snafu(display("failed to resolve values from {name:?}: {message}"))]
    ValuesFrom { name: String, message: String },
}

impl Error {
    /// Classification for status conditions.
    pub fn reason(&self) -> flotilla_core::error::Reason {
        use flotilla_core::error::Reason;
        match self {
            Self::Manifest { source } => match source {
                flotilla_core::manifest::Error::BadEncoding { .. } => Reason::BadEncoding,
                flotilla_core::manifest::Error::PatchTargetMissing { .. } => {
                    Reason::PatchTargetMissing
                }
                flotilla_core::manifest::Error::PatchApply { .. }
                | flotilla_core::manifest::Error::PatchOperations { .. } => Reason::PatchApply,
                _ => Reason::BadManifest,
            },
            Self::ClusterScopedUnderNamespace { .. } => Reason::ClusterScopedUnderNamespace,
            Self::Fetch { .. } | Self::ValuesFrom { .. } => Reason::ApplyError,
            _ => Reason::BadManifest,
        }
    }
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything the pipeline needs to know about one deployment.
pub struct RenderRequest<'a> {
    pub bundle_id: &'a str,
    pub manifest: &'a Manifest,
    pub options: &'a BundleDeploymentOptions,

    /// Fallback namespace when the options pick none.
    pub default_namespace: &'a str,

    /// Set-id derivation inputs; empty strings are fine.
    pub label_prefix: &'a str,
    pub label_suffix: &'a str,

    /// Provenance for the chart annotations.
    pub agent_namespace: &'a str,
    pub commit: Option<&'a str>,
}

/// The rendered release content.
#[derive(Clone, Debug, Default)]
pub struct Rendered {
    pub release_name: String,
    pub namespace: String,
    pub set_id: String,
    pub chart: ChartMetadata,
    pub values: Map<String, Value>,
    pub objects: Vec<DynamicObject>,
}

#[derive(Default)]
pub struct Renderer {
    fetcher: Option<Arc<dyn ChartFetcher>>,
    values_reader: Option<Arc<dyn ValuesReader>>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ChartFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_values_reader(mut self, reader: Arc<dyn ValuesReader>) -> Self {
        self.values_reader = Some(reader);
        self
    }

    pub async fn render(&self, request: RenderRequest<'_>) -> Result<Rendered> {
        let manifest = request.manifest.process().context(ManifestSnafu)?;
        let helm = request.options.helm.as_ref();

        let namespace = request
            .options
            .target_namespace
            .clone()
            .or_else(|| request.options.default_namespace.clone())
            .unwrap_or_else(|| request.default_namespace.to_string());

        let release_name = helm
            .and_then(|helm| helm.release_name.clone())
            .unwrap_or_else(|| names::helm_release_name(request.bundle_id));

        let values = values::resolve_values(
            helm,
            &namespace,
            self.values_reader.as_deref(),
        )
        .await?;

        let kustomize_dir = request
            .options
            .kustomize
            .as_ref()
            .and_then(|kustomize| kustomize.dir.as_deref());

        let remote = helm.and_then(chart::remote_chart_ref);
        let (mut chart, mut objects) = match remote {
            Some(chart_ref) => {
                let chart = chart::fetch_remote(self.fetcher.as_deref(), &chart_ref).await?;
                let mut objects = template_objects(&chart)?;
                // Raw resources declared outside the chart are applied
                // alongside it.
                let excluded = kustomize::referenced_files(&manifest, kustomize_dir);
                objects.extend(manifest_objects(&manifest, &excluded)?);
                (chart, objects)
            }
            None => {
                let chart = Chart::synthesize(request.bundle_id, &manifest);
                let excluded = kustomize::referenced_files(&manifest, kustomize_dir);
                let objects = manifest_objects(&manifest, &excluded)?;
                (chart, objects)
            }
        };

        if kustomize::wants_kustomize(&manifest, kustomize_dir) {
            objects = kustomize::apply(objects, &manifest, kustomize_dir)?;
        }

        postrender::finalize_namespaces(
            &mut objects,
            request.options.target_namespace.as_deref(),
            &namespace,
        )?;

        let set_id = labels::set_id(request.bundle_id, request.label_prefix, request.label_suffix);
        let keep_crds = !request.options.delete_crd_resources;
        postrender::stamp_objects(&mut objects, &set_id, keep_crds);

        chart.metadata.annotations = chart_annotations(&request, &release_name, &namespace);

        Ok(Rendered {
            release_name,
            namespace,
            set_id,
            chart: chart.metadata,
            values,
            objects,
        })
    }
}

/// Template enumeration for fetched charts: everything under `templates/`.
fn template_objects(chart: &Chart) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for file in &chart.files {
        if file.name.starts_with("templates/") && is_yaml_like(&file.name) {
            objects.extend(postrender::parse_documents(&file.name, &file.content)?);
        }
    }
    Ok(objects)
}

/// Object enumeration for synthesized charts: every YAML/JSON resource not
/// claimed by a kustomization.
fn manifest_objects(
    manifest: &Manifest,
    excluded: &std::collections::BTreeSet<String>,
) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for resource in &manifest.resources {
        if excluded.contains(&resource.name) || !is_yaml_like(&resource.name) {
            continue;
        }
        objects.extend(postrender::parse_documents(&resource.name, &resource.content)?);
    }
    Ok(objects)
}

fn is_yaml_like(name: &str) -> bool {
    name.ends_with(".yaml") || name.ends_with(".yml") || name.ends_with(".json")
}

fn chart_annotations(
    request: &RenderRequest<'_>,
    release_name: &str,
    namespace: &str,
) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        labels::BUNDLE_ID_ANNOTATION.to_string(),
        request.bundle_id.to_string(),
    );
    annotations.insert(
        labels::AGENT_NAMESPACE_ANNOTATION.to_string(),
        request.agent_namespace.to_string(),
    );
    annotations.insert(
        labels::RELEASE_NAME_ANNOTATION.to_string(),
        format!("{namespace}/{release_name}"),
    );
    if let Some(commit) = request.commit {
        annotations.insert(labels::COMMIT_ANNOTATION.to_string(), commit.to_string());
    }
    if let Some(service_account) = &request.options.service_account {
        annotations.insert(
            labels::SERVICE_ACCOUNT_ANNOTATION.to_string(),
            service_account.clone(),
        );
    }
    if request.options.keep_resources {
        annotations.insert(labels::KEEP_RESOURCES_ANNOTATION.to_string(), "true".to_string());
    }
    annotations
}
