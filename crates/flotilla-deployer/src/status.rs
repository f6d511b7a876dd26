//! BundleDeployment status synthesis: readiness roll-up, modified-state
//! reporting and optional drift correction.

use std::collections::BTreeMap;

use flotilla_core::crd::{
    BundleDeployment, BundleDeploymentStatus, DeployedResource, FleetResource as _,
    ModifiedStatus, NonReadyStatus, ObjectSummary,
};
use flotilla_core::error::{self, ReconcileError, Reason};
use flotilla_core::kube::core::DynamicObject;
use flotilla_core::labels;
use serde_json::Value;
use snafu::ResultExt as _;
use tracing::{info, warn};

use crate::deploy::get_cfg;
use crate::plan::{Normalizer, ObjectRef, Plan, plan};
use crate::release::ReleaseState;
use crate::{Deployer, Error, ReleasesSnafu};

/// Cap on reported entries per list; keeps status objects bounded.
const MAX_REPORTED: usize = 10;

impl Deployer {
    /// Recomputes a BundleDeployment's status from the live downstream
    /// state and, when enabled, rolls back out-of-band edits. Returns the
    /// error to surface on the `Ready` condition, if any.
    pub async fn update_bundle_deployment_status(
        &self,
        bd: &mut BundleDeployment,
    ) -> Result<(), Error> {
        let (namespace, name) = self.release_address(bd);

        let Some(current) = self
            .releases
            .deployed(&namespace, &name)
            .await
            .context(ReleasesSnafu)?
        else {
            // Nothing live yet; leave status to the deploy path.
            return Ok(());
        };

        let previous_objects: Vec<DynamicObject> = self
            .releases
            .history(&namespace, &name)
            .await
            .context(ReleasesSnafu)?
            .into_iter()
            .filter(|release| {
                release.revision < current.revision
                    && release.state == ReleaseState::Superseded
            })
            .next_back()
            .map(|release| release.objects)
            .unwrap_or_default();

        let normalizer = Normalizer::new(
            bd.spec
                .options
                .diff
                .as_ref()
                .map(|diff| diff.compare_patches.clone())
                .unwrap_or_default(),
        );
        let set_id = labels::set_id(bd.name(), &self.label_prefix, &self.label_suffix);
        let result = plan(
            self.downstream.as_ref(),
            &set_id,
            &current.objects,
            &normalizer,
            &namespace,
        )
        .await?;

        let ignore_rules = bd
            .spec
            .options
            .ignore_options
            .as_ref()
            .map(|ignore| ignore.conditions.clone())
            .unwrap_or_default();

        let status = bd.status.get_or_insert_with(BundleDeploymentStatus::default);
        status.non_ready_status = non_ready_status(&result, &ignore_rules);
        status.modified_status = modified_status(&result, &previous_objects);
        status.ready = status.non_ready_status.is_empty();
        status.non_modified = status.modified_status.is_empty();
        status.release = Some(current.key());
        status.resources = deployed_resources(&result, &namespace);

        let non_modified = status.non_modified;
        let modified_count = status.modified_status.len();

        let drift_enabled = bd
            .spec
            .correct_drift
            .as_ref()
            .is_some_and(|drift| drift.enabled);
        let mut drift_error = None;
        if !non_modified && drift_enabled {
            info!(
                deployment = %bd.key(),
                modified = modified_count,
                "correcting drift"
            );
            if let Err(err) = self.remove_external_changes(bd, &namespace, &name).await {
                warn!(deployment = %bd.key(), %err, "drift correction failed");
                drift_error = Some(ReconcileError::new(Reason::ApplyError, err.to_string()));
            }
        }

        let generation = bd.generation();
        let status = bd.status.get_or_insert_with(BundleDeploymentStatus::default);
        error::set_ready_condition(&mut status.conditions, drift_error.as_ref(), generation);
        Ok(())
    }

    /// Rolls the release back to its current deployed content, discarding
    /// out-of-band edits. A failed corrective rollback leaves no history
    /// entry unless `keepFailHistory` asks for one.
    pub async fn remove_external_changes(
        &self,
        bd: &BundleDeployment,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let keep_fail_history = bd
            .spec
            .correct_drift
            .as_ref()
            .is_some_and(|drift| drift.keep_fail_history);
        let ctx = get_cfg(namespace, &bd.spec.options);

        match self.rollback(namespace, name, &ctx).await {
            Ok(_) => Ok(()),
            Err(err) => {
                if !keep_fail_history {
                    if let Ok(Some(last)) = self.releases.last(namespace, name).await {
                        if last.state == ReleaseState::Failed {
                            self.releases
                                .delete(namespace, name, last.revision)
                                .await
                                .context(ReleasesSnafu)?;
                            // Put the current release back in place as the
                            // head of history.
                            if let Ok(Some(mut deployed)) =
                                self.releases.deployed(namespace, name).await
                            {
                                deployed.state = ReleaseState::Deployed;
                                let _ = self.releases.update(deployed).await;
                            }
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// The `(namespace, releaseName)` this deployment stores its release
    /// under, preferring the recorded release key.
    pub fn release_address(&self, bd: &BundleDeployment) -> (String, String) {
        if let Some(release) = bd.status.as_ref().and_then(|status| status.release.as_ref()) {
            if let Some((namespace, name, _)) = crate::release::parse_release_key(release) {
                return (namespace, name);
            }
        }
        self.release_address_from_options(bd)
    }

    /// The release address the current options ask for, ignoring any
    /// recorded release key.
    pub fn release_address_from_options(&self, bd: &BundleDeployment) -> (String, String) {
        let options = &bd.spec.options;
        let namespace = options
            .target_namespace
            .clone()
            .or_else(|| options.default_namespace.clone())
            .unwrap_or_else(|| self.default_namespace.clone());
        let name = options
            .helm
            .as_ref()
            .and_then(|helm| helm.release_name.clone())
            .unwrap_or_else(|| flotilla_core::names::helm_release_name(bd.name()));
        (namespace, name)
    }
}

fn non_ready_status(
    result: &Plan,
    ignore_rules: &[BTreeMap<String, String>],
) -> Vec<NonReadyStatus> {
    let mut non_ready: Vec<NonReadyStatus> = result
        .objects
        .iter()
        .filter_map(|object| {
            let summary = summarize(object, ignore_rules);
            if summary.error || summary.transitioning {
                let reference = ObjectRef::of(object);
                Some(NonReadyStatus {
                    uid: object.metadata.uid.clone().unwrap_or_default(),
                    api_version: reference.api_version,
                    kind: reference.kind,
                    namespace: reference.namespace.unwrap_or_default(),
                    name: reference.name,
                    summary,
                })
            } else {
                None
            }
        })
        .collect();
    non_ready.sort_by(|a, b| a.uid.cmp(&b.uid));
    non_ready.truncate(MAX_REPORTED);
    non_ready
}

fn modified_status(result: &Plan, previous_objects: &[DynamicObject]) -> Vec<ModifiedStatus> {
    let previous_refs: std::collections::BTreeSet<ObjectRef> =
        previous_objects.iter().map(ObjectRef::of).collect();

    let mut modified = Vec::new();
    for reference in &result.to_create {
        modified.push(ModifiedStatus {
            api_version: reference.api_version.clone(),
            kind: reference.kind.clone(),
            namespace: reference.namespace.clone().unwrap_or_default(),
            name: reference.name.clone(),
            create: true,
            ..Default::default()
        });
    }
    // Strays are only reported when the previous release deployed them;
    // anything else is an operator fanning out children under our label.
    for reference in &result.to_delete {
        if !previous_refs.contains(reference) {
            continue;
        }
        modified.push(ModifiedStatus {
            api_version: reference.api_version.clone(),
            kind: reference.kind.clone(),
            namespace: reference.namespace.clone().unwrap_or_default(),
            name: reference.name.clone(),
            delete: true,
            ..Default::default()
        });
    }
    for (reference, patch) in &result.to_update {
        modified.push(ModifiedStatus {
            api_version: reference.api_version.clone(),
            kind: reference.kind.clone(),
            namespace: reference.namespace.clone().unwrap_or_default(),
            name: reference.name.clone(),
            patch: Some(patch.clone()),
            ..Default::default()
        });
    }

    modified.sort_by_key(ModifiedStatus::sort_key);
    modified.truncate(MAX_REPORTED);
    modified
}

fn deployed_resources(result: &Plan, release_namespace: &str) -> Vec<DeployedResource> {
    result
        .objects
        .iter()
        .map(|object| {
            let reference = ObjectRef::of(object);
            let namespace = match reference.namespace {
                Some(namespace) => namespace,
                None if flotilla_render::scope::is_namespaced(&reference.kind) => {
                    release_namespace.to_string()
                }
                None => String::new(),
            };
            DeployedResource {
                api_version: reference.api_version,
                kind: reference.kind,
                namespace,
                name: reference.name,
                created_at: object.metadata.creation_timestamp.clone(),
            }
        })
        .collect()
}

/// Condensed readiness of one live object, with ignored conditions removed
/// first.
pub fn summarize(
    object: &DynamicObject,
    ignore_rules: &[BTreeMap<String, String>],
) -> ObjectSummary {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or_default();
    let data = &object.data;

    let mut summary = match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            replica_summary(data, "/status/readyReplicas")
        }
        "DaemonSet" => daemon_set_summary(data),
        "Job" => job_summary(data),
        "Pod" => pod_summary(data),
        _ => ObjectSummary::default(),
    };

    if !summary.error && !summary.transitioning {
        condition_summary(data, ignore_rules, &mut summary);
    }

    summary.state = if summary.error {
        "error".to_string()
    } else if summary.transitioning {
        "in-progress".to_string()
    } else {
        "ready".to_string()
    };
    summary
}

fn int_at(data: &Value, pointer: &str) -> i64 {
    data.pointer(pointer).and_then(Value::as_i64).unwrap_or(0)
}

fn replica_summary(data: &Value, ready_pointer: &str) -> ObjectSummary {
    let desired = data
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready = int_at(data, ready_pointer);
    if ready < desired {
        ObjectSummary {
            transitioning: true,
            message: vec![format!("{ready}/{desired} replicas ready")],
            ..Default::default()
        }
    } else {
        ObjectSummary::default()
    }
}

fn daemon_set_summary(data: &Value) -> ObjectSummary {
    let desired = int_at(data, "/status/desiredNumberScheduled");
    let ready = int_at(data, "/status/numberReady");
    if ready < desired {
        ObjectSummary {
            transitioning: true,
            message: vec![format!("{ready}/{desired} pods ready")],
            ..Default::default()
        }
    } else {
        ObjectSummary::default()
    }
}

fn job_summary(data: &Value) -> ObjectSummary {
    if condition_true(data, "Failed") {
        return ObjectSummary {
            error: true,
            message: vec!["job failed".to_string()],
            ..Default::default()
        };
    }
    if condition_true(data, "Complete") || int_at(data, "/status/succeeded") > 0 {
        return ObjectSummary::default();
    }
    ObjectSummary {
        transitioning: true,
        message: vec!["job has not completed".to_string()],
        ..Default::default()
    }
}

fn pod_summary(data: &Value) -> ObjectSummary {
    match data.pointer("/status/phase").and_then(Value::as_str) {
        Some("Succeeded") => ObjectSummary::default(),
        Some("Failed") => ObjectSummary {
            error: true,
            message: vec!["pod failed".to_string()],
            ..Default::default()
        },
        Some("Running") if condition_true(data, "Ready") => ObjectSummary::default(),
        None => ObjectSummary::default(),
        Some(phase) => ObjectSummary {
            transitioning: true,
            message: vec![format!("pod is {phase}")],
            ..Default::default()
        },
    }
}

fn condition_true(data: &Value, type_: &str) -> bool {
    conditions_of(data).iter().any(|condition| {
        condition.get("type").and_then(Value::as_str) == Some(type_)
            && condition.get("status").and_then(Value::as_str) == Some("True")
    })
}

fn conditions_of(data: &Value) -> Vec<Value> {
    data.pointer("/status/conditions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Generic readiness from `status.conditions`: `Ready`/`Available` reporting
/// `False` means transitioning, a `Failed`/`Stalled` condition reporting
/// `True` means error. A rule from `ignoreOptions` suppresses a condition
/// when every key/value of the rule matches the condition entry.
fn condition_summary(
    data: &Value,
    ignore_rules: &[BTreeMap<String, String>],
    summary: &mut ObjectSummary,
) {
    for condition in conditions_of(data) {
        if ignore_rules.iter().any(|rule| rule_matches(rule, &condition)) {
            continue;
        }
        let type_ = condition.get("type").and_then(Value::as_str).unwrap_or("");
        let status = condition.get("status").and_then(Value::as_str).unwrap_or("");
        let message = condition
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        match (type_, status) {
            ("Failed" | "Stalled", "True") => {
                summary.error = true;
                if !message.is_empty() {
                    summary.message.push(message);
                }
            }
            ("Ready" | "Available", "False") => {
                summary.transitioning = true;
                if !message.is_empty() {
                    summary.message.push(message);
                }
            }
            _ => {}
        }
    }
}

fn rule_matches(rule: &BTreeMap<String, String>, condition: &Value) -> bool {
    !rule.is_empty()
        && rule.iter().all(|(key, expected)| {
            condition
                .get(key)
                .map(|actual| match actual {
                    Value::String(actual) => actual == expected,
                    other => &other.to_string() == expected,
                })
                .unwrap_or(false)
        })
}
