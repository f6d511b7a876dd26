//! Status aggregation: folding BundleDeployment statuses into bundle,
//! cluster and cluster-group summaries. Aggregation is pure; running it
//! twice over the same input yields the same status.

use std::collections::BTreeMap;

use flotilla_core::crd::{
    AggregatedResource, Bundle, BundleDeployment, BundleState, BundleStatus, BundleSummary,
    Cluster, ClusterGroup, ClusterGroupStatus, ClusterStatus, FleetResource as _, NonReadyResource,
    PerClusterState,
};
use flotilla_core::labels::{CLUSTER_LABEL, CLUSTER_NAMESPACE_LABEL};
use serde::{Deserialize, Serialize};

/// Cap on per-cluster states recorded per aggregated resource.
const MAX_PER_CLUSTER_STATES: usize = 10;

/// Cap on non-ready deployments detailed in a summary.
const MAX_NON_READY: usize = 10;

/// Folds the deployments' states into the summary counters.
pub fn summarize_deployments(bds: &[BundleDeployment]) -> BundleSummary {
    let mut summary = BundleSummary::default();
    for bd in bds {
        let state = BundleState::of(bd);
        summary.count(state);
        if !state.is_ready() && summary.non_ready_resources.len() < MAX_NON_READY {
            let status = bd.status.clone().unwrap_or_default();
            summary.non_ready_resources.push(NonReadyResource {
                name: cluster_id_of(bd),
                state,
                message: status
                    .conditions
                    .iter()
                    .find(|c| !c.message.is_empty())
                    .map(|c| c.message.clone())
                    .unwrap_or_default(),
                modified_status: status.modified_status,
                non_ready_status: status.non_ready_status,
            });
        }
    }
    summary
}

/// `<cluster-namespace>/<cluster>` from the fan-out labels.
fn cluster_id_of(bd: &BundleDeployment) -> String {
    let labels = bd.labels();
    format!(
        "{}/{}",
        labels.get(CLUSTER_NAMESPACE_LABEL).map_or("", String::as_str),
        labels.get(CLUSTER_LABEL).map_or("", String::as_str),
    )
}

/// Rebuilds a bundle's status summary, display and resource list from its
/// deployments.
pub fn aggregate_bundle_status(bundle: &Bundle, bds: &[BundleDeployment]) -> BundleStatus {
    let mut status = bundle.status.clone().unwrap_or_default();
    status.summary = summarize_deployments(bds);
    status.display.ready_clusters = format!(
        "{}/{}",
        status.summary.ready, status.summary.desired_ready
    );
    status.display.state = status.summary.state().to_string();
    status.resources = aggregate_resources(bds);
    status.observed_generation = bundle.generation();
    status
}

/// The union of every deployment's resources, with per-cluster states
/// attached and truncated.
pub fn aggregate_resources(bds: &[BundleDeployment]) -> Vec<AggregatedResource> {
    let mut aggregated: BTreeMap<(String, String, String, String), AggregatedResource> =
        BTreeMap::new();

    for bd in bds {
        let Some(status) = &bd.status else { continue };
        let cluster_id = cluster_id_of(bd);

        for resource in &status.resources {
            let key = (
                resource.api_version.clone(),
                resource.kind.clone(),
                resource.namespace.clone(),
                resource.name.clone(),
            );
            let entry = aggregated.entry(key).or_insert_with(|| AggregatedResource {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
                namespace: resource.namespace.clone(),
                name: resource.name.clone(),
                state: "Ready".to_string(),
                ..Default::default()
            });

            // This cluster's view of the resource.
            let non_ready = status.non_ready_status.iter().find(|candidate| {
                candidate.api_version == resource.api_version
                    && candidate.kind == resource.kind
                    && candidate.namespace == resource.namespace
                    && candidate.name == resource.name
            });
            let modified = status.modified_status.iter().any(|candidate| {
                candidate.api_version == resource.api_version
                    && candidate.kind == resource.kind
                    && candidate.namespace == resource.namespace
                    && candidate.name == resource.name
            });

            let state = if let Some(non_ready) = non_ready {
                entry.error |= non_ready.summary.error;
                entry.transitioning |= non_ready.summary.transitioning;
                if entry.message.is_empty() {
                    entry.message = non_ready.summary.message.join("; ");
                }
                if non_ready.summary.state.is_empty() {
                    "NotReady".to_string()
                } else {
                    non_ready.summary.state.clone()
                }
            } else if modified {
                "Modified".to_string()
            } else {
                "Ready".to_string()
            };

            if state != "Ready" && entry.state == "Ready" {
                entry.state = state.clone();
            }
            if entry.per_cluster_state.len() < MAX_PER_CLUSTER_STATES {
                entry.per_cluster_state.push(PerClusterState {
                    state,
                    cluster_id: cluster_id.clone(),
                });
            } else {
                entry.incomplete_state = true;
            }
        }
    }

    aggregated.into_values().collect()
}

/// Per-state counts over aggregated resources, rolled up for a git-repo
/// style parent across several bundles.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCounts {
    pub ready: i32,
    pub desired_ready: i32,
    pub wait_applied: i32,
    pub modified: i32,
    pub orphaned: i32,
    pub missing: i32,
    pub unknown: i32,
    pub not_ready: i32,
}

pub fn resource_counts(bundles: &[Bundle]) -> ResourceCounts {
    let mut counts = ResourceCounts::default();
    for bundle in bundles {
        let Some(status) = &bundle.status else { continue };
        for resource in &status.resources {
            counts.desired_ready += 1;
            match resource.state.as_str() {
                "Ready" => counts.ready += 1,
                "Modified" => counts.modified += 1,
                "WaitApplied" => counts.wait_applied += 1,
                "Orphaned" => counts.orphaned += 1,
                "Missing" => counts.missing += 1,
                "NotReady" | "in-progress" => counts.not_ready += 1,
                _ => counts.unknown += 1,
            }
        }
    }
    counts
}

/// Rebuilds a cluster's bundle summary from the deployments in its derived
/// namespace.
pub fn aggregate_cluster_status(cluster: &Cluster, bds: &[BundleDeployment]) -> ClusterStatus {
    let mut status = cluster.status.clone().unwrap_or_default();
    status.summary = summarize_deployments(bds);
    status.display.ready_bundles = format!(
        "{}/{}",
        status.summary.ready, status.summary.desired_ready
    );
    status
}

/// Rebuilds a group's status from its member clusters.
pub fn aggregate_cluster_group_status(
    group: &ClusterGroup,
    members: &[Cluster],
) -> ClusterGroupStatus {
    let mut status = group.status.clone().unwrap_or_default();
    status.cluster_count = i32::try_from(members.len()).unwrap_or(i32::MAX);
    status.non_ready_cluster_count = i32::try_from(
        members
            .iter()
            .filter(|cluster| {
                cluster
                    .status
                    .as_ref()
                    .is_some_and(|status| !status.summary.is_ready())
            })
            .count(),
    )
    .unwrap_or(i32::MAX);
    status.summary = BundleSummary::default();
    for member in members {
        if let Some(member_status) = &member.status {
            status.summary.fold(&member_status.summary);
        }
    }
    status
}
