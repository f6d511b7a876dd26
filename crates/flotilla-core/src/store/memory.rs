//! In-memory [`ObjectStore`]: the default store for the test harness and the
//! CLI. Implements the same concurrency rules a real API server would, so
//! reconcilers exercised against it see conflicts, cascading deletes and
//! generation bumps.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use k8s_openapi::chrono::Utc;
use kube::core::{DynamicObject, GroupVersionKind};
use rand::Rng as _;
use serde_json::{Value, json};
use snafu::ResultExt as _;
use tokio::sync::{RwLock, broadcast};

use super::{
    EventOp, ObjectKey, ObjectStore, StoreError, StoreEvent, StoreResult, gvk_of,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DynamicKey {
    api_version: String,
    kind: String,
    namespace: Option<String>,
    name: String,
}

#[derive(Default)]
struct Inner {
    typed: BTreeMap<String, BTreeMap<ObjectKey, Value>>,
    dynamic: BTreeMap<DynamicKey, DynamicObject>,
    revision: u64,
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: StoreEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

fn fresh_uid() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

fn object_key(kind: &str, object: &Value) -> StoreResult<ObjectKey> {
    let name = object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::MissingName {
            kind: kind.to_string(),
        })?;
    let namespace = object
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(String::from);
    Ok(ObjectKey {
        namespace,
        name: name.to_string(),
    })
}

fn labels_of(object: &Value) -> BTreeMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn meta_str(object: &Value, field: &str) -> Option<String> {
    object
        .pointer(&format!("/metadata/{field}"))
        .and_then(Value::as_str)
        .map(String::from)
}

fn set_meta(object: &mut Value, field: &str, value: Value) {
    if object.get("metadata").is_none_or(Value::is_null) {
        object["metadata"] = json!({});
    }
    object["metadata"][field] = value;
}

fn owner_uids(object: &Value) -> Vec<String> {
    object
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r.get("uid").and_then(Value::as_str).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Spec comparison deciding whether `generation` moves. Objects without a
/// `spec` field (content blobs) compare everything except metadata/status.
fn spec_changed(stored: &Value, incoming: &Value) -> bool {
    match (stored.get("spec"), incoming.get("spec")) {
        (None, None) => {
            let strip = |value: &Value| {
                let mut value = value.clone();
                if let Some(map) = value.as_object_mut() {
                    map.remove("metadata");
                    map.remove("status");
                }
                value
            };
            strip(stored) != strip(incoming)
        }
        (stored_spec, incoming_spec) => stored_spec != incoming_spec,
    }
}

fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> StoreResult<bool> {
    match selector {
        None => Ok(true),
        Some(selector) => {
            crate::selector::matches(selector, labels).context(super::SelectorSnafu)
        }
    }
}

fn dynamic_key(object: &DynamicObject) -> StoreResult<DynamicKey> {
    let types = object.types.as_ref().ok_or(StoreError::MissingTypes)?;
    let name = object
        .metadata
        .name
        .clone()
        .ok_or_else(|| StoreError::MissingName {
            kind: types.kind.clone(),
        })?;
    Ok(DynamicKey {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        namespace: object.metadata.namespace.clone(),
        name,
    })
}

fn dynamic_key_for(gvk: &GroupVersionKind, key: &ObjectKey) -> DynamicKey {
    let api_version = if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    };
    DynamicKey {
        api_version,
        kind: gvk.kind.clone(),
        namespace: key.namespace.clone(),
        name: key.name.clone(),
    }
}

impl Inner {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_raw(&self, kind: &str, key: &ObjectKey) -> StoreResult<Option<Value>> {
        let inner = self.inner.read().await;
        Ok(inner
            .typed
            .get(kind)
            .and_then(|objects| objects.get(key))
            .cloned())
    }

    async fn list_raw(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> StoreResult<Vec<Value>> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for (key, object) in inner.typed.get(kind).into_iter().flatten() {
            if let Some(namespace) = namespace {
                if key.namespace.as_deref() != Some(namespace) {
                    continue;
                }
            }
            if selector_matches(selector, &labels_of(object))? {
                out.push(object.clone());
            }
        }
        Ok(out)
    }

    async fn create_raw(&self, kind: &str, mut object: Value) -> StoreResult<Value> {
        let key = object_key(kind, &object)?;
        let mut inner = self.inner.write().await;
        let objects = inner.typed.entry(kind.to_string()).or_default();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: kind.to_string(),
                key,
            });
        }

        set_meta(&mut object, "uid", json!(fresh_uid()));
        set_meta(&mut object, "generation", json!(1));
        set_meta(
            &mut object,
            "creationTimestamp",
            serde_json::to_value(Time(Utc::now())).context(super::CodecSnafu { kind })?,
        );
        let labels = labels_of(&object);
        let revision = inner.next_revision();
        let objects = inner.typed.entry(kind.to_string()).or_default();
        set_meta(&mut object, "resourceVersion", json!(revision));
        objects.insert(key.clone(), object.clone());
        drop(inner);

        self.emit(StoreEvent {
            kind: kind.to_string(),
            dynamic: false,
            op: EventOp::Created,
            key,
            labels,
        });
        Ok(object)
    }

    async fn update_raw(&self, kind: &str, mut object: Value) -> StoreResult<Value> {
        let key = object_key(kind, &object)?;
        let mut inner = self.inner.write().await;
        let stored = inner
            .typed
            .get(kind)
            .and_then(|objects| objects.get(&key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            })?;

        if let Some(incoming_revision) = meta_str(&object, "resourceVersion") {
            if meta_str(&stored, "resourceVersion") != Some(incoming_revision) {
                return Err(StoreError::Conflict {
                    kind: kind.to_string(),
                    key,
                });
            }
        }

        // Identity fields are owned by the store.
        if let Some(uid) = meta_str(&stored, "uid") {
            set_meta(&mut object, "uid", json!(uid));
        }
        if let Some(created) = stored.pointer("/metadata/creationTimestamp") {
            set_meta(&mut object, "creationTimestamp", created.clone());
        }

        let generation = stored
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if spec_changed(&stored, &object) {
            generation + 1
        } else {
            generation
        };
        set_meta(&mut object, "generation", json!(generation));

        let revision = inner.next_revision();
        set_meta(&mut object, "resourceVersion", json!(revision));
        let labels = labels_of(&object);
        inner
            .typed
            .entry(kind.to_string())
            .or_default()
            .insert(key.clone(), object.clone());
        drop(inner);

        self.emit(StoreEvent {
            kind: kind.to_string(),
            dynamic: false,
            op: EventOp::Updated,
            key,
            labels,
        });
        Ok(object)
    }

    async fn update_status_raw(&self, kind: &str, object: Value) -> StoreResult<Value> {
        let key = object_key(kind, &object)?;
        let mut inner = self.inner.write().await;
        let mut stored = inner
            .typed
            .get(kind)
            .and_then(|objects| objects.get(&key))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: key.clone(),
            })?;

        if let Some(incoming_revision) = meta_str(&object, "resourceVersion") {
            if meta_str(&stored, "resourceVersion") != Some(incoming_revision) {
                return Err(StoreError::Conflict {
                    kind: kind.to_string(),
                    key,
                });
            }
        }

        match object.get("status") {
            Some(status) => stored["status"] = status.clone(),
            None => {
                if let Some(map) = stored.as_object_mut() {
                    map.remove("status");
                }
            }
        }

        let revision = inner.next_revision();
        set_meta(&mut stored, "resourceVersion", json!(revision));
        let labels = labels_of(&stored);
        inner
            .typed
            .entry(kind.to_string())
            .or_default()
            .insert(key.clone(), stored.clone());
        drop(inner);

        self.emit(StoreEvent {
            kind: kind.to_string(),
            dynamic: false,
            op: EventOp::Updated,
            key,
            labels,
        });
        Ok(stored)
    }

    async fn delete_raw(&self, kind: &str, key: &ObjectKey) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let Some(removed) = inner
            .typed
            .get_mut(kind)
            .and_then(|objects| objects.remove(key))
        else {
            return Ok(());
        };

        let mut events = vec![StoreEvent {
            kind: kind.to_string(),
            dynamic: false,
            op: EventOp::Deleted,
            key: key.clone(),
            labels: labels_of(&removed),
        }];

        // Cascade through owner references, breadth-first.
        let mut orphaned_uids: Vec<String> = meta_str(&removed, "uid").into_iter().collect();
        while let Some(owner_uid) = orphaned_uids.pop() {
            let mut doomed_typed: Vec<(String, ObjectKey)> = Vec::new();
            for (kind, objects) in &inner.typed {
                for (key, object) in objects {
                    if owner_uids(object).contains(&owner_uid) {
                        doomed_typed.push((kind.clone(), key.clone()));
                    }
                }
            }
            for (kind, key) in doomed_typed {
                if let Some(object) = inner
                    .typed
                    .get_mut(&kind)
                    .and_then(|objects| objects.remove(&key))
                {
                    orphaned_uids.extend(meta_str(&object, "uid"));
                    events.push(StoreEvent {
                        kind,
                        dynamic: false,
                        op: EventOp::Deleted,
                        key,
                        labels: labels_of(&object),
                    });
                }
            }

            let doomed_dynamic: Vec<DynamicKey> = inner
                .dynamic
                .iter()
                .filter(|(_, object)| {
                    object
                        .metadata
                        .owner_references
                        .as_deref()
                        .unwrap_or_default()
                        .iter()
                        .any(|r| r.uid == owner_uid)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for dkey in doomed_dynamic {
                if let Some(object) = inner.dynamic.remove(&dkey) {
                    orphaned_uids.extend(object.metadata.uid.clone());
                    events.push(StoreEvent {
                        kind: dkey.kind.clone(),
                        dynamic: true,
                        op: EventOp::Deleted,
                        key: ObjectKey {
                            namespace: dkey.namespace.clone(),
                            name: dkey.name.clone(),
                        },
                        labels: object.metadata.labels.clone().unwrap_or_default(),
                    });
                }
            }
        }
        drop(inner);

        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn apply_dynamic(&self, mut object: DynamicObject) -> StoreResult<DynamicObject> {
        let key = dynamic_key(&object)?;
        let mut inner = self.inner.write().await;

        let op = match inner.dynamic.get(&key) {
            Some(existing) => {
                object.metadata.uid = existing.metadata.uid.clone();
                object.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
                EventOp::Updated
            }
            None => {
                object.metadata.uid = Some(fresh_uid());
                object.metadata.creation_timestamp = Some(Time(Utc::now()));
                EventOp::Created
            }
        };
        object.metadata.resource_version = Some(inner.next_revision());
        inner.dynamic.insert(key.clone(), object.clone());
        drop(inner);

        self.emit(StoreEvent {
            kind: key.kind.clone(),
            dynamic: true,
            op,
            key: ObjectKey {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
            },
            labels: object.metadata.labels.clone().unwrap_or_default(),
        });
        Ok(object)
    }

    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> StoreResult<Option<DynamicObject>> {
        let inner = self.inner.read().await;
        Ok(inner.dynamic.get(&dynamic_key_for(gvk, key)).cloned())
    }

    async fn list_dynamic(
        &self,
        gvk: Option<&GroupVersionKind>,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> StoreResult<Vec<DynamicObject>> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for object in inner.dynamic.values() {
            if let Some(gvk) = gvk {
                let object_gvk = gvk_of(object)?;
                if object_gvk.group != gvk.group
                    || object_gvk.version != gvk.version
                    || object_gvk.kind != gvk.kind
                {
                    continue;
                }
            }
            if let Some(namespace) = namespace {
                if object.metadata.namespace.as_deref() != Some(namespace) {
                    continue;
                }
            }
            let labels = object.metadata.labels.clone().unwrap_or_default();
            if selector_matches(selector, &labels)? {
                out.push(object.clone());
            }
        }
        Ok(out)
    }

    async fn delete_dynamic(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let Some(object) = inner.dynamic.remove(&dynamic_key_for(gvk, key)) else {
            return Ok(());
        };
        drop(inner);

        self.emit(StoreEvent {
            kind: gvk.kind.clone(),
            dynamic: true,
            op: EventOp::Deleted,
            key: key.clone(),
            labels: object.metadata.labels.clone().unwrap_or_default(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
