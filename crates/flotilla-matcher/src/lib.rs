//! Target matching and bundle fan-out: decides which downstream clusters
//! receive a bundle, with which per-cluster overrides, and rolls the
//! resulting deployment states back up into bundle, cluster and group
//! statuses.

pub mod fanout;
pub mod rollout;
pub mod summary;
pub mod target;
pub mod template;

pub use fanout::BundleReconciler;
pub use rollout::{MAX_NEW, max_unavailable, resolve_int_or_percent};
pub use summary::{
    ResourceCounts, aggregate_bundle_status, aggregate_cluster_group_status,
    aggregate_cluster_status, aggregate_resources, resource_counts, summarize_deployments,
};
pub use target::{Criteria, eligible, select_target};
pub use template::template_context;
