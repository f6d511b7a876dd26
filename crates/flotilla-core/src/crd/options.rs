//! Deployment options carried by bundles and handed down to every
//! BundleDeployment. The YAML surface is a closed set; anything unknown is a
//! deserialization error.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn is_false(b: &bool) -> bool {
    !*b
}

// No deny_unknown_fields here: bundle targets flatten this struct into their
// own fields, which serde cannot combine with unknown-field rejection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleDeploymentOptions {
    /// Namespace used when neither the object nor `targetNamespace` names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,

    /// Forces every namespaced object into this namespace. Cluster-scoped
    /// objects are rejected while this is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Service account the deployer impersonates for the apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Leave applied objects behind when the bundle goes away.
    #[serde(default, skip_serializing_if = "is_false")]
    pub keep_resources: bool,

    /// When false, CRDs are annotated so uninstalls leave them in place.
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete_crd_resources: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize: Option<KustomizeOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_options: Option<IgnoreOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_drift: Option<DriftCorrection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<RolloutOptions>,
}

impl BundleDeploymentOptions {
    /// Merges a per-target override onto these options: scalars from the
    /// override win, maps merge recursively, arrays are replaced wholesale.
    /// Fields the override leaves at their zero value keep the base value.
    pub fn merged_with(&self, overrides: &Self) -> Result<Self, serde_json::Error> {
        let mut base = serde_json::to_value(self)?;
        let overlay = serde_json::to_value(overrides)?;
        crate::patch::deep_merge(&mut base, &overlay);
        serde_json::from_value(base)
    }

    /// Hex SHA-256 over the canonical serialization. Equal options hash
    /// equal; zero-value fields are skipped during serialization so they
    /// cannot perturb the digest.
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        use sha2::Digest as _;
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(sha2::Sha256::digest(&canonical)))
    }
}

/// `<manifestID>:<optionsHash>`: identifies the rendered content and the
/// applied options together, driving idempotent (re)deploys.
pub fn deployment_id(
    manifest_id: &str,
    options: &BundleDeploymentOptions,
) -> Result<String, serde_json::Error> {
    Ok(format!("{manifest_id}:{}", options.content_hash()?))
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HelmOptions {
    /// Chart name, path inside the bundle, or remote chart reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,

    /// Chart repository URL; set when `chart` is remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Overrides the release name derived from the bundle id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Map<String, Value>>,

    /// Values evaluated against the target cluster before merging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_values: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_from: Vec<ValuesFrom>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history: Option<usize>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub atomic: bool,

    /// Adopt resources that already exist instead of failing the install.
    #[serde(default, skip_serializing_if = "is_false")]
    pub take_ownership: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub wait_for_jobs: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_dns: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_schema_validation: bool,

    /// Turns off `${ }` template evaluation of value leaves.
    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_preprocess: bool,
}

/// A reference into a ConfigMap or Secret providing extra helm values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValuesFrom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<ValuesKeyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<ValuesKeyRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValuesKeyRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KustomizeOptions {
    /// Directory within the bundle resources holding `kustomization.yaml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiffOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compare_patches: Vec<ComparePatch>,
}

/// Masks fields before the desired/live comparison, scoped to one object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ComparePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<DiffOperation>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_pointers: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiffOperation {
    pub op: String,
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IgnoreOptions {
    /// A condition is ignored when every key/value of a rule matches the
    /// object's condition entry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<std::collections::BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DriftCorrection {
    #[serde(default, skip_serializing_if = "is_false")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub force: bool,

    /// Keep the history entry of a failed corrective rollback.
    #[serde(default, skip_serializing_if = "is_false")]
    pub keep_fail_history: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RolloutOptions {
    /// Integer or percentage of clusters that may be unavailable during a
    /// rollout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_partition_size: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<Partition>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Partition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_group_selector: Option<LabelSelector>,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;

    #[test]
    fn full_options_yaml_parses() {
        let yaml = indoc! {"
            defaultNamespace: apps
            serviceAccount: deployer
            keepResources: true
            helm:
              chart: ./chart
              releaseName: my-release
              values:
                replicas: '2'
              valuesFrom:
                - configMapKeyRef:
                    name: overrides
                    key: values.yaml
              timeoutSeconds: 300
              atomic: true
            kustomize:
              dir: overlays/prod
            diff:
              comparePatches:
                - kind: Deployment
                  apiVersion: apps/v1
                  jsonPointers:
                    - /spec/replicas
            correctDrift:
              enabled: true
            rollout:
              maxUnavailable: 25%
        "};
        let options: BundleDeploymentOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.default_namespace.as_deref(), Some("apps"));
        assert!(options.keep_resources);
        let helm = options.helm.unwrap();
        assert_eq!(helm.release_name.as_deref(), Some("my-release"));
        assert_eq!(helm.values_from.len(), 1);
        assert_eq!(
            options.rollout.unwrap().max_unavailable,
            Some(IntOrString::String("25%".into()))
        );
    }

    #[test]
    fn unknown_helm_fields_are_rejected() {
        let err = serde_yaml::from_str::<HelmOptions>("bogusKnob: true").unwrap_err();
        assert!(err.to_string().contains("bogusKnob"), "{err}");
    }

    #[test]
    fn merge_prefers_override_scalars_and_merges_maps() {
        let base: BundleDeploymentOptions = serde_yaml::from_str(indoc! {"
            defaultNamespace: base
            helm:
              values:
                replicas: '4'
                shared: kept
        "})
        .unwrap();
        let overrides: BundleDeploymentOptions = serde_yaml::from_str(indoc! {"
            helm:
              values:
                replicas: '1'
        "})
        .unwrap();

        let merged = base.merged_with(&overrides).unwrap();
        assert_eq!(merged.default_namespace.as_deref(), Some("base"));
        let values = merged.helm.unwrap().values.unwrap();
        assert_eq!(values["replicas"], json!("1"));
        assert_eq!(values["shared"], json!("kept"));
    }

    #[test]
    fn merge_replaces_arrays() {
        let base: BundleDeploymentOptions = serde_yaml::from_str(indoc! {"
            diff:
              comparePatches:
                - kind: Deployment
                - kind: Service
        "})
        .unwrap();
        let overrides: BundleDeploymentOptions = serde_yaml::from_str(indoc! {"
            diff:
              comparePatches:
                - kind: ConfigMap
        "})
        .unwrap();

        let merged = base.merged_with(&overrides).unwrap();
        let patches = merged.diff.unwrap().compare_patches;
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].kind.as_deref(), Some("ConfigMap"));
    }
}
