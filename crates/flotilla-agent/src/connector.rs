//! Downstream cluster access for manager-initiated registration: kubeconfig
//! resolution, connection building and the pre-import smoke test.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use flotilla_core::kube::core::{DynamicObject, GroupVersionKind};
use flotilla_core::store::ObjectStore;
use serde_json::Value;
use snafu::Snafu;

/// Deadline for the registration smoke test.
pub const SMOKE_TEST_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("kubeconfig secret carries no downstream address"))]
    MissingAddress,

    #[snafu(display("kubeconfig secret field {field:?} is not valid base64/UTF-8"))]
    BadSecretField { field: String },
}

/// The connection parameters registration needs, read from a cluster's
/// kubeconfig secret. `address`/`token` point at the downstream cluster;
/// the optional `apiServerURL`/`apiServerCA` fields override the manager
/// endpoint handed to the agent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KubeConfig {
    pub address: String,
    pub token: Option<String>,
    pub api_server_url: Option<String>,
    pub api_server_ca: Option<String>,
}

impl KubeConfig {
    /// Reads the secret's (base64) data fields.
    pub fn from_secret(secret: &DynamicObject) -> Result<Self, Error> {
        let field = |name: &str| -> Result<Option<String>, Error> {
            let Some(raw) = secret
                .data
                .pointer(&format!("/data/{name}"))
                .and_then(Value::as_str)
            else {
                return Ok(None);
            };
            let decoded = BASE64
                .decode(raw.as_bytes())
                .map_err(|_| Error::BadSecretField { field: name.into() })?;
            String::from_utf8(decoded)
                .map(Some)
                .map_err(|_| Error::BadSecretField { field: name.into() })
        };

        let address = field("address")?.ok_or(Error::MissingAddress)?;
        Ok(Self {
            address,
            token: field("token")?,
            api_server_url: field("apiServerURL")?,
            api_server_ca: field("apiServerCA")?,
        })
    }
}

/// Builds store handles for downstream clusters. The production
/// implementation dials the cluster's API server; tests hand out in-memory
/// stores keyed by URL.
#[async_trait]
pub trait DownstreamConnector: Send + Sync {
    async fn connect(
        &self,
        kube_config: &KubeConfig,
    ) -> Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error + Send + Sync>>;

    /// Unverified reachability probe of the API server URL, used to decide
    /// whether the system trust store suffices.
    async fn probe_insecure(&self, api_server_url: &str) -> bool;
}

/// Pre-import smoke test: list services in `kube-system` within the
/// deadline.
pub async fn smoke_test(store: &dyn ObjectStore) -> bool {
    let gvk = GroupVersionKind {
        group: String::new(),
        version: "v1".to_string(),
        kind: "Service".to_string(),
    };
    matches!(
        tokio::time::timeout(
            SMOKE_TEST_DEADLINE,
            store.list_dynamic(Some(&gvk), Some("kube-system"), None),
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use flotilla_core::kube::core::TypeMeta;
    use flotilla_core::store::MemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    use super::*;

    fn secret(data: Value) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".into(),
                kind: "Secret".into(),
            }),
            metadata: ObjectMeta {
                namespace: Some("fleet-default".into()),
                name: Some("kc".into()),
                ..Default::default()
            },
            data,
        }
    }

    #[test]
    fn kubeconfig_from_secret() {
        let address = BASE64.encode("https://downstream.example:6443");
        let url = BASE64.encode("https://manager.example:6443");
        let parsed = KubeConfig::from_secret(&secret(json!({
            "data": {"address": address, "apiServerURL": url}
        })))
        .unwrap();

        assert_eq!(parsed.address, "https://downstream.example:6443");
        assert_eq!(
            parsed.api_server_url.as_deref(),
            Some("https://manager.example:6443")
        );
        assert!(parsed.token.is_none());
        assert!(parsed.api_server_ca.is_none());
    }

    #[test]
    fn missing_address_is_an_error() {
        let err = KubeConfig::from_secret(&secret(json!({"data": {}}))).unwrap_err();
        assert!(matches!(err, Error::MissingAddress));
    }

    #[test]
    fn garbage_base64_is_an_error() {
        let err = KubeConfig::from_secret(&secret(json!({
            "data": {"address": "not-base64!!!"}
        })))
        .unwrap_err();
        assert!(matches!(err, Error::BadSecretField { .. }));
    }

    #[tokio::test]
    async fn smoke_test_passes_against_a_store() {
        let store = MemoryStore::new();
        assert!(smoke_test(&store).await);
    }
}
