//! The declarative object store every component communicates through.
//!
//! The trait works on raw JSON values so it stays object-safe; the typed
//! convenience layer lives in [`ObjectStoreExt`] and (de)serializes through
//! serde. The dynamic pathway carries arbitrary user resources as
//! [`DynamicObject`]s with lazy decoding.
//!
//! Semantics follow the Kubernetes API server where it matters: optimistic
//! concurrency through `resourceVersion`, a `generation` that only moves on
//! spec changes, status as a separate subresource write, and cascading
//! deletes driven by owner references.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use serde_json::Value;
use snafu::{ResultExt as _, Snafu};
use tokio::sync::broadcast;

use crate::crd::FleetResource;

mod memory;

pub use memory::MemoryStore;

/// Default number of attempts for [`retry_on_conflict`].
pub const CONFLICT_RETRY_BUDGET: u32 = 5;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("{kind} {key} not found"))]
    NotFound { kind: String, key: ObjectKey },

    #[snafu(display("{kind} {key} already exists"))]
    AlreadyExists { kind: String, key: ObjectKey },

    #[snafu(display("{kind} {key} was modified concurrently"))]
    Conflict { kind: String, key: ObjectKey },

    #[snafu(display("{kind} object has no name"))]
    MissingName { kind: String },

    #[snafu(display("dynamic object has no apiVersion/kind"))]
    MissingTypes,

    #[snafu(display("failed to (de)serialize {kind} object"))]
    Codec {
        source: serde_json::Error,
        kind: String,
    },

    #[snafu(display("invalid label selector"))]
    Selector { source: crate::selector::Error },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// `(namespace, name)` address of an object. Cluster-scoped objects carry no
/// namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOp {
    Created,
    Updated,
    Deleted,
}

/// Broadcast on every mutation. Carries the label snapshot so watchers can
/// filter without a read back.
#[derive(Clone, Debug)]
pub struct StoreEvent {
    pub kind: String,
    /// Set for objects on the dynamic pathway.
    pub dynamic: bool,
    pub op: EventOp,
    pub key: ObjectKey,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_raw(&self, kind: &str, key: &ObjectKey) -> StoreResult<Option<Value>>;

    async fn list_raw(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> StoreResult<Vec<Value>>;

    async fn create_raw(&self, kind: &str, object: Value) -> StoreResult<Value>;

    /// Replaces the object. Fails with [`StoreError::Conflict`] when the
    /// incoming `resourceVersion` does not match the stored one.
    async fn update_raw(&self, kind: &str, object: Value) -> StoreResult<Value>;

    /// Replaces only the `status` subresource.
    async fn update_status_raw(&self, kind: &str, object: Value) -> StoreResult<Value>;

    /// Deletes the object and everything owner-referencing it. Deleting a
    /// missing object is a no-op.
    async fn delete_raw(&self, kind: &str, key: &ObjectKey) -> StoreResult<()>;

    /// Creates or replaces a dynamic object, preserving identity metadata.
    async fn apply_dynamic(&self, object: DynamicObject) -> StoreResult<DynamicObject>;

    async fn get_dynamic(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> StoreResult<Option<DynamicObject>>;

    /// Lists dynamic objects, optionally restricted to one `gvk` and/or
    /// namespace.
    async fn list_dynamic(
        &self,
        gvk: Option<&GroupVersionKind>,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> StoreResult<Vec<DynamicObject>>;

    async fn delete_dynamic(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> StoreResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Typed access on top of [`ObjectStore`].
#[async_trait]
pub trait ObjectStoreExt: ObjectStore {
    async fn get<T: FleetResource>(&self, key: &ObjectKey) -> StoreResult<Option<T>> {
        match self.get_raw(T::KIND, key).await? {
            Some(value) => Ok(Some(decode::<T>(value)?)),
            None => Ok(None),
        }
    }

    async fn get_required<T: FleetResource>(&self, key: &ObjectKey) -> StoreResult<T> {
        self.get::<T>(key).await?.ok_or_else(|| StoreError::NotFound {
            kind: T::KIND.to_string(),
            key: key.clone(),
        })
    }

    async fn list<T: FleetResource>(
        &self,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> StoreResult<Vec<T>> {
        self.list_raw(T::KIND, namespace, selector)
            .await?
            .into_iter()
            .map(decode::<T>)
            .collect()
    }

    async fn create<T: FleetResource>(&self, object: &T) -> StoreResult<T> {
        decode(self.create_raw(T::KIND, encode(object)?).await?)
    }

    async fn update<T: FleetResource>(&self, object: &T) -> StoreResult<T> {
        decode(self.update_raw(T::KIND, encode(object)?).await?)
    }

    async fn update_status<T: FleetResource>(&self, object: &T) -> StoreResult<T> {
        decode(self.update_status_raw(T::KIND, encode(object)?).await?)
    }

    async fn delete<T: FleetResource>(&self, key: &ObjectKey) -> StoreResult<()> {
        self.delete_raw(T::KIND, key).await
    }
}

impl<S: ObjectStore + ?Sized> ObjectStoreExt for S {}

fn encode<T: FleetResource>(object: &T) -> StoreResult<Value> {
    serde_json::to_value(object).context(CodecSnafu { kind: T::KIND })
}

fn decode<T: FleetResource>(value: Value) -> StoreResult<T> {
    serde_json::from_value(value).context(CodecSnafu { kind: T::KIND })
}

/// Group/version/kind of a dynamic object, parsed from its type meta.
pub fn gvk_of(object: &DynamicObject) -> StoreResult<GroupVersionKind> {
    let types = object.types.as_ref().ok_or(StoreError::MissingTypes)?;
    Ok(gvk_from_type_meta(types))
}

/// Splits an `apiVersion` like `apps/v1` (or core `v1`) into a GVK.
pub fn gvk_from_type_meta(types: &TypeMeta) -> GroupVersionKind {
    let (group, version) = match types.api_version.rsplit_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    GroupVersionKind {
        group,
        version,
        kind: types.kind.clone(),
    }
}

/// Runs `operation` until it stops failing with [`StoreError::Conflict`], up
/// to the store's default retry budget, backing off between attempts.
pub async fn retry_on_conflict<T, F, Fut>(mut operation: F) -> StoreResult<T>
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = StoreResult<T>> + Send,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(StoreError::Conflict { .. }) if attempt + 1 < CONFLICT_RETRY_BUDGET => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_display() {
        assert_eq!(ObjectKey::namespaced("ns", "n").to_string(), "ns/n");
        assert_eq!(ObjectKey::cluster_scoped("n").to_string(), "n");
    }

    #[test]
    fn gvk_parsing_handles_core_group() {
        let tm = TypeMeta {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
        };
        let gvk = gvk_from_type_meta(&tm);
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "ConfigMap");

        let tm = TypeMeta {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
        };
        let gvk = gvk_from_type_meta(&tm);
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
    }
}
