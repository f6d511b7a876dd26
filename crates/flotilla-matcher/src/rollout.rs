//! Rollout gating: how many BundleDeployments may be created or disrupted
//! in one reconcile pass.

use flotilla_core::crd::RolloutOptions;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Hard cap on BundleDeployments created in a single reconcile, regardless
/// of rollout options. Deferring creation is always safe; creating past the
/// cap is not.
pub const MAX_NEW: i32 = 50;

/// Resolves an int-or-percent against a total. Percentages round down, the
/// way disruption budgets do.
pub fn resolve_int_or_percent(value: &IntOrString, total: i32) -> Option<i32> {
    match value {
        IntOrString::Int(count) => Some((*count).max(0)),
        IntOrString::String(percent) => {
            let percent: i32 = percent.strip_suffix('%')?.trim().parse().ok()?;
            Some((total * percent.clamp(0, 100)) / 100)
        }
    }
}

/// Clusters allowed to be unavailable during a rollout. Unset means no
/// limit (everything may roll at once).
pub fn max_unavailable(rollout: Option<&RolloutOptions>, total: i32) -> i32 {
    rollout
        .and_then(|rollout| rollout.max_unavailable.as_ref())
        .and_then(|value| resolve_int_or_percent(value, total))
        .unwrap_or(total)
}
