//! Dry-run diff between a release's desired object set and the live state
//! downstream, scoped by the ownership set id. Nothing in here writes.

use std::collections::BTreeMap;

use flotilla_core::crd::ComparePatch;
use flotilla_core::kube::core::DynamicObject;
use flotilla_core::labels::SET_ID_LABEL;
use flotilla_core::patch::{apply_merge_patch, create_merge_patch};
use flotilla_core::store::ObjectStore;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde_json::Value;
use snafu::ResultExt as _;

use crate::{Error, ObjectCodecSnafu, StoreSnafu};

/// Identity of one object in the diff.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn of(object: &DynamicObject) -> Self {
        let (api_version, kind) = object
            .types
            .as_ref()
            .map(|t| (t.api_version.clone(), t.kind.clone()))
            .unwrap_or_default();
        Self {
            api_version,
            kind,
            namespace: object.metadata.namespace.clone(),
            name: object.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// `apiVersion/kind/namespace/name`, the order status lists use.
    pub fn sort_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.api_version,
            self.kind,
            self.namespace.as_deref().unwrap_or_default(),
            self.name
        )
    }
}

/// Result of the dry-run diff.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    /// Desired but missing downstream.
    pub to_create: Vec<ObjectRef>,

    /// Live under this set id but no longer desired.
    pub to_delete: Vec<ObjectRef>,

    /// Live but diverging; carries the JSON merge patch from normalized live
    /// to normalized predicted state.
    pub to_update: Vec<(ObjectRef, String)>,

    /// The predicted object set: live objects with desired changes merged,
    /// plus desired objects that do not exist yet.
    pub objects: Vec<DynamicObject>,
}

impl Plan {
    pub fn is_clean(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty() && self.to_update.is_empty()
    }
}

/// Masks fields that must not participate in the comparison.
#[derive(Clone, Debug, Default)]
pub struct Normalizer {
    rules: Vec<ComparePatch>,
}

impl Normalizer {
    pub fn new(rules: Vec<ComparePatch>) -> Self {
        Self { rules }
    }

    pub fn normalize(&self, reference: &ObjectRef, value: &mut Value) {
        // Server-owned fields never count as drift.
        for pointer in [
            "/metadata/resourceVersion",
            "/metadata/uid",
            "/metadata/generation",
            "/metadata/creationTimestamp",
            "/metadata/managedFields",
            "/status",
        ] {
            remove_pointer(value, pointer);
        }

        // Aggregated ClusterRoles get their rules filled in by the
        // controller-manager.
        if reference.kind == "ClusterRole"
            && value.get("aggregationRule").is_some_and(|rule| !rule.is_null())
        {
            if let Some(map) = value.as_object_mut() {
                map.remove("rules");
            }
        }

        for rule in &self.rules {
            if !rule_applies(rule, reference) {
                continue;
            }
            for operation in &rule.operations {
                // Best effort: a path that is already absent is not drift.
                let patch = serde_json::json!([{
                    "op": operation.op,
                    "path": operation.path,
                    "value": operation.value,
                }]);
                if let Ok(operations) = serde_json::from_value::<json_patch::Patch>(patch) {
                    let _ = json_patch::patch(value, &operations);
                }
            }
            for pointer in &rule.json_pointers {
                remove_pointer(value, pointer);
            }
        }
    }
}

fn rule_applies(rule: &ComparePatch, reference: &ObjectRef) -> bool {
    if let Some(api_version) = &rule.api_version {
        if api_version != &reference.api_version {
            return false;
        }
    }
    if let Some(kind) = &rule.kind {
        if kind != &reference.kind {
            return false;
        }
    }
    if let Some(name) = &rule.name {
        if name != &reference.name {
            return false;
        }
    }
    if let Some(namespace) = &rule.namespace {
        if Some(namespace.as_str()) != reference.namespace.as_deref() {
            return false;
        }
    }
    true
}

/// Removes the value a JSON pointer addresses, if present.
fn remove_pointer(value: &mut Value, pointer: &str) {
    let Some((parent, token)) = pointer.rsplit_once('/') else {
        return;
    };
    let token = token.replace("~1", "/").replace("~0", "~");
    let parent = if parent.is_empty() {
        Some(value)
    } else {
        value.pointer_mut(parent)
    };
    match parent {
        Some(Value::Object(map)) => {
            map.remove(&token);
        }
        Some(Value::Array(items)) => {
            if let Ok(index) = token.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
}

type LiveKey = (String, String, Option<String>, String);

fn live_key(reference: &ObjectRef) -> LiveKey {
    (
        reference.api_version.clone(),
        reference.kind.clone(),
        reference.namespace.clone(),
        reference.name.clone(),
    )
}

/// Looks up a desired object in the live index, retrying with the swapped
/// namespace presence when the assumed scope was wrong on a previous run.
fn lookup<'a>(
    index: &'a BTreeMap<LiveKey, DynamicObject>,
    reference: &ObjectRef,
    default_namespace: &str,
) -> Option<(LiveKey, &'a DynamicObject)> {
    let exact = live_key(reference);
    if let Some(object) = index.get(&exact) {
        return Some((exact, object));
    }

    let swapped = match &reference.namespace {
        Some(_) => (
            reference.api_version.clone(),
            reference.kind.clone(),
            None,
            reference.name.clone(),
        ),
        None => (
            reference.api_version.clone(),
            reference.kind.clone(),
            Some(default_namespace.to_string()),
            reference.name.clone(),
        ),
    };
    index.get(&swapped).map(|object| (swapped, object))
}

/// Computes the set difference between desired and live state for one set
/// id. See [`Plan`].
pub async fn plan(
    store: &dyn ObjectStore,
    set_id: &str,
    desired: &[DynamicObject],
    normalizer: &Normalizer,
    default_namespace: &str,
) -> Result<Plan, Error> {
    let selector = LabelSelector {
        match_labels: Some(BTreeMap::from([(
            SET_ID_LABEL.to_string(),
            set_id.to_string(),
        )])),
        ..Default::default()
    };
    let live = store
        .list_dynamic(None, None, Some(&selector))
        .await
        .context(StoreSnafu)?;

    let mut live_index: BTreeMap<LiveKey, DynamicObject> = live
        .into_iter()
        .map(|object| (live_key(&ObjectRef::of(&object)), object))
        .collect();

    let mut result = Plan::default();

    for desired_object in desired {
        let reference = ObjectRef::of(desired_object);
        match lookup(&live_index, &reference, default_namespace) {
            None => {
                result.to_create.push(reference);
                result.objects.push(desired_object.clone());
            }
            Some((matched_key, live_object)) => {
                let live_value = to_value(live_object)?;
                let desired_value = to_value(desired_object)?;

                let mut predicted_value = live_value.clone();
                apply_merge_patch(&mut predicted_value, &desired_value);

                let mut normalized_live = live_value;
                let mut normalized_predicted = predicted_value.clone();
                normalizer.normalize(&reference, &mut normalized_live);
                normalizer.normalize(&reference, &mut normalized_predicted);

                if normalized_live != normalized_predicted {
                    let patch = create_merge_patch(&normalized_live, &normalized_predicted);
                    let patch = serde_json::to_string(&patch).context(ObjectCodecSnafu {
                        name: reference.name.clone(),
                    })?;
                    result.to_update.push((reference, patch));
                }

                result.objects.push(
                    serde_json::from_value(predicted_value).context(ObjectCodecSnafu {
                        name: desired_object.metadata.name.clone().unwrap_or_default(),
                    })?,
                );
                live_index.remove(&matched_key);
            }
        }
    }

    for leftover in live_index.into_values() {
        result.to_delete.push(ObjectRef::of(&leftover));
    }

    result.to_create.sort();
    result.to_delete.sort();
    result.to_update.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(result)
}

fn to_value(object: &DynamicObject) -> Result<Value, Error> {
    serde_json::to_value(object).context(ObjectCodecSnafu {
        name: object.metadata.name.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use flotilla_core::crd::DiffOperation;
    use flotilla_core::store::MemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::TypeMeta;
    use serde_json::json;

    use super::*;

    fn object(kind: &str, namespace: Option<&str>, name: &str, data: Value) -> DynamicObject {
        let api_version = if kind == "ClusterRole" {
            "rbac.authorization.k8s.io/v1"
        } else {
            "v1"
        };
        DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.into(),
                kind: kind.into(),
            }),
            metadata: ObjectMeta {
                namespace: namespace.map(String::from),
                name: Some(name.into()),
                labels: Some(BTreeMap::from([(
                    SET_ID_LABEL.to_string(),
                    "set-a".to_string(),
                )])),
                ..Default::default()
            },
            data,
        }
    }

    async fn seeded_store(objects: Vec<DynamicObject>) -> MemoryStore {
        let store = MemoryStore::new();
        for object in objects {
            store.apply_dynamic(object).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn identical_state_yields_clean_plan() {
        let cm = object("ConfigMap", Some("ns"), "cm", json!({"data": {"k": "v"}}));
        let store = seeded_store(vec![cm.clone()]).await;

        let result = plan(&store, "set-a", &[cm], &Normalizer::default(), "ns")
            .await
            .unwrap();
        assert!(result.is_clean(), "{result:?}");
        assert_eq!(result.objects.len(), 1);
    }

    #[tokio::test]
    async fn missing_objects_are_created_and_strays_deleted() {
        let live = object("ConfigMap", Some("ns"), "stray", json!({}));
        let store = seeded_store(vec![live]).await;

        let desired = object("ConfigMap", Some("ns"), "wanted", json!({}));
        let result = plan(&store, "set-a", &[desired], &Normalizer::default(), "ns")
            .await
            .unwrap();

        assert_eq!(result.to_create.len(), 1);
        assert_eq!(result.to_create[0].name, "wanted");
        assert_eq!(result.to_delete.len(), 1);
        assert_eq!(result.to_delete[0].name, "stray");
    }

    #[tokio::test]
    async fn out_of_band_edits_produce_merge_patches() {
        let live = object("ConfigMap", Some("ns"), "cm", json!({"data": {"k": "v2"}}));
        let store = seeded_store(vec![live]).await;

        let desired = object("ConfigMap", Some("ns"), "cm", json!({"data": {"k": "v1"}}));
        let result = plan(&store, "set-a", &[desired], &Normalizer::default(), "ns")
            .await
            .unwrap();

        assert_eq!(result.to_update.len(), 1);
        let (reference, patch) = &result.to_update[0];
        assert_eq!(reference.name, "cm");
        let patch: Value = serde_json::from_str(patch).unwrap();
        assert_eq!(patch, json!({"data": {"k": "v1"}}));
    }

    #[tokio::test]
    async fn server_added_fields_are_not_drift() {
        // Live object has extra fields the release never set.
        let live = object(
            "ConfigMap",
            Some("ns"),
            "cm",
            json!({"data": {"k": "v"}, "status": {"observed": true}}),
        );
        let store = seeded_store(vec![live]).await;

        let desired = object("ConfigMap", Some("ns"), "cm", json!({"data": {"k": "v"}}));
        let result = plan(&store, "set-a", &[desired], &Normalizer::default(), "ns")
            .await
            .unwrap();
        assert!(result.is_clean(), "{result:?}");
    }

    #[tokio::test]
    async fn swapped_namespace_lookup_recovers_scope_mistakes() {
        // Stored without a namespace on an earlier run.
        let live = object("ConfigMap", None, "cm", json!({"data": {"k": "v"}}));
        let store = seeded_store(vec![live]).await;

        let desired = object("ConfigMap", Some("ns"), "cm", json!({"data": {"k": "v"}}));
        let result = plan(&store, "set-a", &[desired], &Normalizer::default(), "ns")
            .await
            .unwrap();
        assert!(result.to_create.is_empty(), "{result:?}");
        assert!(result.to_delete.is_empty(), "{result:?}");
    }

    #[tokio::test]
    async fn compare_patches_mask_fields() {
        let live = object("ConfigMap", Some("ns"), "cm", json!({"data": {"k": "edited"}}));
        let store = seeded_store(vec![live]).await;

        let desired = object("ConfigMap", Some("ns"), "cm", json!({"data": {"k": "v"}}));
        let normalizer = Normalizer::new(vec![ComparePatch {
            kind: Some("ConfigMap".into()),
            json_pointers: vec!["/data/k".into()],
            ..Default::default()
        }]);
        let result = plan(&store, "set-a", &[desired], &normalizer, "ns")
            .await
            .unwrap();
        assert!(result.is_clean(), "{result:?}");
    }

    #[tokio::test]
    async fn remove_operations_apply_to_both_sides() {
        let live = object(
            "ConfigMap",
            Some("ns"),
            "cm",
            json!({"data": {"volatile": "x", "stable": "a"}}),
        );
        let store = seeded_store(vec![live]).await;

        let desired = object(
            "ConfigMap",
            Some("ns"),
            "cm",
            json!({"data": {"volatile": "y", "stable": "a"}}),
        );
        let normalizer = Normalizer::new(vec![ComparePatch {
            kind: Some("ConfigMap".into()),
            operations: vec![DiffOperation {
                op: "remove".into(),
                path: "/data/volatile".into(),
                value: None,
            }],
            ..Default::default()
        }]);
        let result = plan(&store, "set-a", &[desired], &normalizer, "ns")
            .await
            .unwrap();
        assert!(result.is_clean(), "{result:?}");
    }

    #[test]
    fn aggregated_cluster_roles_ignore_rules() {
        let normalizer = Normalizer::default();
        let reference = ObjectRef {
            api_version: "rbac.authorization.k8s.io/v1".into(),
            kind: "ClusterRole".into(),
            namespace: None,
            name: "agg".into(),
        };
        let mut value = json!({
            "aggregationRule": {"clusterRoleSelectors": []},
            "rules": [{"apiGroups": ["*"]}],
        });
        normalizer.normalize(&reference, &mut value);
        assert!(value.get("rules").is_none());
    }
}
