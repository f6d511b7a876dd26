//! Label and annotation keys shared across components. These are part of the
//! persisted state surface and must never change.

/// Chart annotation: identifier of the bundle a release came from.
pub const BUNDLE_ID_ANNOTATION: &str = "bundle-id";

/// Chart annotation: commit hash the bundle contents were sourced from.
pub const COMMIT_ANNOTATION: &str = "commit";

/// Chart annotation: namespace the deploying agent operates in.
pub const AGENT_NAMESPACE_ANNOTATION: &str = "agent-namespace";

/// Chart annotation: service account impersonated for the apply.
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "service-account";

/// Chart annotation: objects survive bundle removal.
pub const KEEP_RESOURCES_ANNOTATION: &str = "keep-resources";

/// Chart annotation: `<namespace>/<releaseName>` the release was stored
/// under, compared during cleanup.
pub const RELEASE_NAME_ANNOTATION: &str = "release-name";

/// Labels on every BundleDeployment, so the matcher can find and clean up
/// its fan-out.
pub const BUNDLE_NAME_LABEL: &str = "bundle-name";
pub const BUNDLE_NAMESPACE_LABEL: &str = "bundle-namespace";
pub const CLUSTER_LABEL: &str = "cluster";
pub const CLUSTER_NAMESPACE_LABEL: &str = "cluster-namespace";

/// Backreference annotations on a cluster's derived namespace.
pub const CLUSTER_NAME_ANNOTATION: &str = "cluster-name";
pub const CLUSTER_NAMESPACE_ANNOTATION: &str = "cluster-namespace";

/// Marks namespaces created and owned by the controller.
pub const MANAGED_LABEL: &str = "managed";

/// Ownership label stamped on every applied object; partitions the live
/// object graph by origin.
pub const SET_ID_LABEL: &str = "set-id";

/// Helm's resource retention annotation, honored on uninstall.
pub const HELM_RESOURCE_POLICY_ANNOTATION: &str = "helm.sh/resource-policy";
pub const HELM_RESOURCE_POLICY_KEEP: &str = "keep";

/// Bundle ids with this prefix deploy the agent itself and get special
/// treatment in set-id derivation and cleanup.
pub const AGENT_BUNDLE_PREFIX: &str = "fleet-agent";

/// Canonical set id for the agent bootstrap object set.
pub const AGENT_BOOTSTRAP_SET_ID: &str = "agent-bootstrap";

/// Derives the ownership set id stamped on every object applied for a
/// bundle. Agent bundles always map onto the bootstrap set id so the agent
/// never garbage-collects itself, regardless of prefix or suffix.
pub fn set_id(bundle_id: &str, label_prefix: &str, label_suffix: &str) -> String {
    if bundle_id.starts_with(AGENT_BUNDLE_PREFIX) {
        return AGENT_BOOTSTRAP_SET_ID.to_string();
    }
    crate::names::safe_concat_name([label_prefix, bundle_id, label_suffix])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_id_concatenates_non_empty_parts() {
        assert_eq!(set_id("my-bundle", "", ""), "my-bundle");
        assert_eq!(set_id("my-bundle", "pfx", "sfx"), "pfx-my-bundle-sfx");
        assert_eq!(set_id("my-bundle", "", "sfx"), "my-bundle-sfx");
    }

    #[test]
    fn agent_bundles_use_the_bootstrap_set_id() {
        assert_eq!(set_id("fleet-agent", "", ""), AGENT_BOOTSTRAP_SET_ID);
        assert_eq!(set_id("fleet-agent-local", "pfx", "sfx"), AGENT_BOOTSTRAP_SET_ID);
    }

    #[test]
    fn long_set_ids_stay_bounded() {
        let id = set_id(&"b".repeat(80), "prefix", "suffix");
        assert!(id.len() <= 63);
    }
}
