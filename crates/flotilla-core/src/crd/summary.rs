//! Rolled-up deployment state shared by Bundle, Cluster and ClusterGroup
//! statuses.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::bundle_deployment::{BundleDeployment, ModifiedStatus, NonReadyStatus};

/// The state of one BundleDeployment, in display precedence order: the
/// derived `Ord` puts the most urgent state first.
#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, PartialOrd, Ord, Hash,
    Serialize, Deserialize,
)]
pub enum BundleState {
    #[strum(serialize = "ErrApplied")]
    ErrApplied,
    #[strum(serialize = "WaitApplied")]
    WaitApplied,
    #[strum(serialize = "Modified")]
    Modified,
    #[strum(serialize = "Unknown")]
    Unknown,
    #[strum(serialize = "NotReady")]
    NotReady,
    #[default]
    #[strum(serialize = "Ready")]
    Ready,
}

impl BundleState {
    /// Classifies a BundleDeployment by its spec/status.
    pub fn of(bd: &BundleDeployment) -> Self {
        let Some(status) = &bd.status else {
            return Self::WaitApplied;
        };
        if status
            .conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "False" && !c.reason.is_empty())
            && status.applied_deployment_id.is_none()
        {
            return Self::ErrApplied;
        }
        if status.applied_deployment_id.as_deref() != Some(bd.spec.deployment_id.as_str()) {
            return Self::WaitApplied;
        }
        if !status.non_modified {
            return Self::Modified;
        }
        if !status.ready {
            return Self::NotReady;
        }
        Self::Ready
    }

    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

/// Counts of BundleDeployments per state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSummary {
    #[serde(default)]
    pub ready: i32,

    #[serde(default)]
    pub desired_ready: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub wait_applied: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub err_applied: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub modified: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub orphaned: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub missing: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub unknown: i32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub not_ready: i32,

    /// Details for the first few non-ready deployments, for display.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_resources: Vec<NonReadyResource>,
}

fn is_zero(count: &i32) -> bool {
    *count == 0
}

impl BundleSummary {
    pub fn count(&mut self, state: BundleState) {
        self.desired_ready += 1;
        match state {
            BundleState::Ready => self.ready += 1,
            BundleState::NotReady => self.not_ready += 1,
            BundleState::WaitApplied => self.wait_applied += 1,
            BundleState::ErrApplied => self.err_applied += 1,
            BundleState::Modified => self.modified += 1,
            BundleState::Unknown => self.unknown += 1,
        }
    }

    /// Adds another summary into this one.
    pub fn fold(&mut self, other: &Self) {
        self.ready += other.ready;
        self.desired_ready += other.desired_ready;
        self.wait_applied += other.wait_applied;
        self.err_applied += other.err_applied;
        self.modified += other.modified;
        self.orphaned += other.orphaned;
        self.missing += other.missing;
        self.unknown += other.unknown;
        self.not_ready += other.not_ready;
        self.non_ready_resources
            .extend(other.non_ready_resources.iter().cloned());
    }

    /// The most urgent state represented in the summary, `Ready` when all
    /// deployments are ready.
    pub fn state(&self) -> BundleState {
        if self.err_applied > 0 {
            BundleState::ErrApplied
        } else if self.wait_applied > 0 {
            BundleState::WaitApplied
        } else if self.modified > 0 {
            BundleState::Modified
        } else if self.unknown > 0 {
            BundleState::Unknown
        } else if self.not_ready > 0 {
            BundleState::NotReady
        } else {
            BundleState::Ready
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready == self.desired_ready
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonReadyResource {
    pub name: String,

    #[serde(default)]
    pub state: BundleState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_status: Vec<ModifiedStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_ready_status: Vec<NonReadyStatus>,
}

/// One deployed resource as seen across every matched cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,

    #[serde(default, skip_serializing_if = "is_false")]
    pub transitioning: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_cluster_state: Vec<PerClusterState>,

    /// Set when the per-cluster list was truncated.
    #[serde(default, skip_serializing_if = "is_false")]
    pub incomplete_state: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerClusterState {
    pub state: String,
    pub cluster_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_precedence() {
        let mut summary = BundleSummary::default();
        summary.count(BundleState::Ready);
        assert_eq!(summary.state(), BundleState::Ready);

        summary.count(BundleState::NotReady);
        assert_eq!(summary.state(), BundleState::NotReady);

        summary.count(BundleState::Modified);
        assert_eq!(summary.state(), BundleState::Modified);

        summary.count(BundleState::WaitApplied);
        assert_eq!(summary.state(), BundleState::WaitApplied);

        summary.count(BundleState::ErrApplied);
        assert_eq!(summary.state(), BundleState::ErrApplied);
    }

    #[test]
    fn fold_accumulates_counts() {
        let mut a = BundleSummary::default();
        a.count(BundleState::Ready);
        let mut b = BundleSummary::default();
        b.count(BundleState::Ready);
        b.count(BundleState::Modified);

        a.fold(&b);
        assert_eq!(a.ready, 2);
        assert_eq!(a.modified, 1);
        assert_eq!(a.desired_ready, 3);
        assert!(!a.is_ready());
    }

    #[test]
    fn ord_matches_precedence() {
        assert!(BundleState::ErrApplied < BundleState::WaitApplied);
        assert!(BundleState::WaitApplied < BundleState::Modified);
        assert!(BundleState::NotReady < BundleState::Ready);
    }
}
