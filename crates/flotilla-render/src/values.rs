//! Helm values resolution: inline values merged with ConfigMap/Secret
//! references from the downstream cluster.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use flotilla_core::crd::{HelmOptions, ValuesKeyRef};
use flotilla_core::kube::core::GroupVersionKind;
use flotilla_core::patch::deep_merge;
use flotilla_core::store::{ObjectKey, ObjectStore};
use serde_json::{Map, Value};

use crate::{Error, ValuesFromSnafu};

/// Key looked up in a ConfigMap/Secret when the reference names none.
pub const DEFAULT_VALUES_KEY: &str = "values.yaml";

/// Reads helm values referenced by `valuesFrom` out of the downstream
/// cluster.
#[async_trait]
pub trait ValuesReader: Send + Sync {
    async fn read(
        &self,
        secret: bool,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>>;
}

/// [`ValuesReader`] over the dynamic pathway of an [`ObjectStore`].
pub struct StoreValuesReader {
    store: Arc<dyn ObjectStore>,
}

impl StoreValuesReader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ValuesReader for StoreValuesReader {
    async fn read(
        &self,
        secret: bool,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        let kind = if secret { "Secret" } else { "ConfigMap" };
        let gvk = GroupVersionKind {
            group: String::new(),
            version: "v1".to_string(),
            kind: kind.to_string(),
        };
        let object = self
            .store
            .get_dynamic(&gvk, &ObjectKey::namespaced(namespace, name))
            .await?;
        let Some(object) = object else {
            return Ok(None);
        };

        let Some(raw) = object.data.pointer(&format!("/data/{key}")).and_then(Value::as_str)
        else {
            return Ok(None);
        };

        if secret {
            let decoded = BASE64.decode(raw.as_bytes())?;
            Ok(Some(String::from_utf8(decoded)?))
        } else {
            Ok(Some(raw.to_string()))
        }
    }
}

/// Resolves the effective values for a release: inline `helm.values` first,
/// then `valuesFrom` references in insertion order with last-one-wins,
/// except that Secret-sourced values always merge last.
pub async fn resolve_values(
    helm: Option<&HelmOptions>,
    default_namespace: &str,
    reader: Option<&dyn ValuesReader>,
) -> Result<Map<String, Value>, Error> {
    let Some(helm) = helm else {
        return Ok(Map::new());
    };

    let mut values = Value::Object(helm.values.clone().unwrap_or_default());

    let mut secret_refs: Vec<&ValuesKeyRef> = Vec::new();
    for source in &helm.values_from {
        if let Some(config_map) = &source.config_map_key_ref {
            let overlay = read_ref(reader, false, config_map, default_namespace).await?;
            deep_merge(&mut values, &Value::Object(overlay));
        }
        if let Some(secret) = &source.secret_key_ref {
            secret_refs.push(secret);
        }
    }
    for secret in secret_refs {
        let overlay = read_ref(reader, true, secret, default_namespace).await?;
        deep_merge(&mut values, &Value::Object(overlay));
    }

    match values {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

async fn read_ref(
    reader: Option<&dyn ValuesReader>,
    secret: bool,
    key_ref: &ValuesKeyRef,
    default_namespace: &str,
) -> Result<Map<String, Value>, Error> {
    let Some(reader) = reader else {
        return ValuesFromSnafu {
            name: key_ref.name.clone(),
            message: "no values reader configured".to_string(),
        }
        .fail();
    };

    let namespace = key_ref.namespace.as_deref().unwrap_or(default_namespace);
    let key = key_ref.key.as_deref().unwrap_or(DEFAULT_VALUES_KEY);

    let content = reader
        .read(secret, namespace, &key_ref.name, key)
        .await
        .map_err(|source| Error::ValuesFrom {
            name: key_ref.name.clone(),
            message: source.to_string(),
        })?;

    // A missing reference contributes nothing; the release can still render.
    let Some(content) = content else {
        return Ok(Map::new());
    };

    let parsed: Value =
        serde_yaml::from_str(&content).map_err(|source| Error::ValuesFrom {
            name: key_ref.name.clone(),
            message: source.to_string(),
        })?;
    match parsed {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(Error::ValuesFrom {
            name: key_ref.name.clone(),
            message: "values content is not a map".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use flotilla_core::crd::ValuesFrom;
    use flotilla_core::kube::core::{DynamicObject, TypeMeta};
    use flotilla_core::store::MemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    use super::*;

    fn dynamic(kind: &str, namespace: &str, name: &str, data: Value) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".into(),
                kind: kind.into(),
            }),
            metadata: ObjectMeta {
                namespace: Some(namespace.into()),
                name: Some(name.into()),
                ..Default::default()
            },
            data,
        }
    }

    fn helm_with(values: Value, values_from: Vec<ValuesFrom>) -> HelmOptions {
        HelmOptions {
            values: match values {
                Value::Object(map) => Some(map),
                _ => None,
            },
            values_from,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn inline_values_pass_through() {
        let helm = helm_with(json!({"a": 1}), vec![]);
        let values = resolve_values(Some(&helm), "default", None).await.unwrap();
        assert_eq!(Value::Object(values), json!({"a": 1}));
    }

    #[tokio::test]
    async fn config_map_overrides_inline_and_secret_wins_last() {
        let store = Arc::new(MemoryStore::new());
        store
            .apply_dynamic(dynamic(
                "ConfigMap",
                "default",
                "cm",
                json!({"data": {"values.yaml": "a: from-cm\nb: from-cm"}}),
            ))
            .await
            .unwrap();
        let secret_yaml = BASE64.encode("b: from-secret");
        store
            .apply_dynamic(dynamic(
                "Secret",
                "default",
                "sec",
                json!({"data": {"values.yaml": secret_yaml}}),
            ))
            .await
            .unwrap();

        let helm = helm_with(
            json!({"a": "inline", "c": "inline"}),
            vec![
                ValuesFrom {
                    secret_key_ref: Some(ValuesKeyRef {
                        name: "sec".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ValuesFrom {
                    config_map_key_ref: Some(ValuesKeyRef {
                        name: "cm".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
        );

        let reader = StoreValuesReader::new(store);
        let values = resolve_values(Some(&helm), "default", Some(&reader))
            .await
            .unwrap();
        // Secret merged last even though it appears first.
        assert_eq!(
            Value::Object(values),
            json!({"a": "from-cm", "b": "from-secret", "c": "inline"})
        );
    }

    #[tokio::test]
    async fn missing_reference_contributes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let reader = StoreValuesReader::new(store);
        let helm = helm_with(
            json!({"a": 1}),
            vec![ValuesFrom {
                config_map_key_ref: Some(ValuesKeyRef {
                    name: "gone".into(),
                    ..Default::default()
                }),
                ..Default::default()
            }],
        );
        let values = resolve_values(Some(&helm), "default", Some(&reader))
            .await
            .unwrap();
        assert_eq!(Value::Object(values), json!({"a": 1}));
    }
}
