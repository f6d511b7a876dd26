//! The stable error taxonomy surfaced on status conditions, plus helpers to
//! write those conditions.
//!
//! Individual modules keep their own snafu error enums; whatever bubbles up
//! to a reconciler is folded into a [`Reason`] so operators see a bounded,
//! greppable vocabulary.

use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::chrono::Utc;
use strum::{Display, EnumString};

/// Stable failure classification. Used verbatim as the `reason` of status
/// conditions.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash)]
pub enum Reason {
    NotFound,
    Conflict,
    BadManifest,
    PatchTargetMissing,
    PatchApply,
    BadEncoding,
    Unauthorized,
    NetworkTimeout,
    ReleasePending,
    ApplyError,
    ClusterScopedUnderNamespace,
    KubeConfigMissing,
    TokenCreation,
    SmokeTestFailed,
    ValidationError,
    Internal,
}

impl Reason {
    /// Whether an error of this kind can resolve without a spec change.
    pub fn is_transient(self) -> bool {
        !matches!(
            self,
            Self::BadManifest
                | Self::PatchApply
                | Self::PatchTargetMissing
                | Self::BadEncoding
                | Self::ClusterScopedUnderNamespace
                | Self::ValidationError
        )
    }
}

/// How a failed reconcile should be rescheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retry {
    /// Exponential backoff managed by the work queue.
    Backoff,
    /// Fixed delay, e.g. waiting for an external credential.
    After(Duration),
    /// Terminal until the spec changes; the error only lives on status.
    Never,
}

/// Error type every reconciler returns to the work queue runtime.
#[derive(Clone, Debug)]
pub struct ReconcileError {
    pub reason: Reason,
    pub message: String,
    pub retry: Retry,
}

impl ReconcileError {
    pub fn new(reason: Reason, message: impl Into<String>) -> Self {
        let retry = if reason.is_transient() {
            Retry::Backoff
        } else {
            Retry::Never
        };
        Self {
            reason,
            message: message.into(),
            retry,
        }
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Wraps any error source under the given reason.
    pub fn from_source(reason: Reason, source: &dyn std::error::Error) -> Self {
        Self::new(reason, source.to_string())
    }
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

impl std::error::Error for ReconcileError {}

/// The condition type all controllers report their overall health on.
pub const CONDITION_READY: &str = "Ready";
/// Condition tracking whether the release matching the deployment id is live.
pub const CONDITION_DEPLOYED: &str = "Deployed";
/// Condition tracking whether drift monitoring succeeded.
pub const CONDITION_MONITORED: &str = "Monitored";

/// Upserts a condition, keeping `lastTransitionTime` stable while the status
/// value is unchanged.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    observed_generation: i64,
) {
    let status = if status { "True" } else { "False" };
    let next = Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: Some(observed_generation),
        last_transition_time: Time(Utc::now()),
    };

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status == next.status {
                existing.reason = next.reason;
                existing.message = next.message;
                existing.observed_generation = next.observed_generation;
            } else {
                *existing = next;
            }
        }
        None => conditions.push(next),
    }
}

/// Writes `Ready` from a reconcile result.
pub fn set_ready_condition(
    conditions: &mut Vec<Condition>,
    error: Option<&ReconcileError>,
    observed_generation: i64,
) {
    match error {
        None => set_condition(
            conditions,
            CONDITION_READY,
            true,
            "",
            "",
            observed_generation,
        ),
        Some(err) => set_condition(
            conditions,
            CONDITION_READY,
            false,
            &err.reason.to_string(),
            &err.message,
            observed_generation,
        ),
    }
}

/// Reads a condition's boolean status; absent conditions read as `false`.
pub fn condition_is_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.type_ == type_)
        .is_some_and(|c| c.status == "True")
}
