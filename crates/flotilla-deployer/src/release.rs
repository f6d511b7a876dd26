//! Release storage: versioned records of successful applies, addressed by
//! `<namespace>/<releaseName>:<revision>`.
//!
//! The store is a bounded trait so the deployer can be exercised against an
//! in-memory implementation; a real agent would back it with cluster
//! secrets the way helm does.

use std::collections::BTreeMap;

use async_trait::async_trait;
use flotilla_core::kube::core::DynamicObject;
use flotilla_render::ChartMetadata;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::Snafu;
use strum::{Display, EnumString};
use tokio::sync::RwLock;

/// Upper bound on retained revisions per release.
pub const MAX_HELM_HISTORY: usize = 2;

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("release {key} not found"))]
    ReleaseNotFound { key: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ReleaseState {
    #[default]
    Deployed,
    Superseded,
    Failed,
    Uninstalling,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseState {
    /// Whether another operation holds the release.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback
        )
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub namespace: String,
    pub name: String,
    pub revision: i32,
    pub state: ReleaseState,
    pub chart: ChartMetadata,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub values: Map<String, Value>,

    /// The rendered object set this release applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<DynamicObject>,

    /// Deployment id the release was rendered from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployment_id: String,
}

impl Release {
    /// `<namespace>/<releaseName>:<revision>`.
    pub fn key(&self) -> String {
        format!("{}/{}:{}", self.namespace, self.name, self.revision)
    }

    /// `<namespace>/<releaseName>`, the history address.
    pub fn history_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.chart.annotations.get(key).map(String::as_str)
    }
}

/// Parses `<namespace>/<releaseName>:<revision>`.
pub fn parse_release_key(key: &str) -> Option<(String, String, i32)> {
    let (address, revision) = key.rsplit_once(':')?;
    let (namespace, name) = address.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace.to_string(), name.to_string(), revision.parse().ok()?))
}

#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// All revisions of one release, ascending.
    async fn history(&self, namespace: &str, name: &str) -> StoreResult<Vec<Release>>;

    /// Latest revision regardless of state.
    async fn last(&self, namespace: &str, name: &str) -> StoreResult<Option<Release>> {
        Ok(self.history(namespace, name).await?.into_iter().next_back())
    }

    /// Latest revision in `deployed` state.
    async fn deployed(&self, namespace: &str, name: &str) -> StoreResult<Option<Release>> {
        Ok(self
            .history(namespace, name)
            .await?
            .into_iter()
            .rev()
            .find(|release| release.state == ReleaseState::Deployed))
    }

    /// Appends a revision and prunes history beyond `max_history`.
    async fn create(&self, release: Release, max_history: usize) -> StoreResult<()>;

    /// Replaces an existing revision in place.
    async fn update(&self, release: Release) -> StoreResult<()>;

    /// Drops a single revision.
    async fn delete(&self, namespace: &str, name: &str, revision: i32) -> StoreResult<()>;

    /// Drops every revision of a release.
    async fn delete_history(&self, namespace: &str, name: &str) -> StoreResult<()>;

    /// Latest revision of every known release.
    async fn list(&self) -> StoreResult<Vec<Release>>;
}

/// In-memory release store. Writes for one `(namespace, name)` serialize on
/// the inner lock; the deployer never holds it across RPCs.
#[derive(Default)]
pub struct MemoryReleaseStore {
    releases: RwLock<BTreeMap<(String, String), Vec<Release>>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn history(&self, namespace: &str, name: &str) -> StoreResult<Vec<Release>> {
        let releases = self.releases.read().await;
        Ok(releases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn create(&self, release: Release, max_history: usize) -> StoreResult<()> {
        let mut releases = self.releases.write().await;
        let history = releases
            .entry((release.namespace.clone(), release.name.clone()))
            .or_default();
        history.push(release);
        history.sort_by_key(|release| release.revision);
        let max_history = max_history.max(1);
        while history.len() > max_history {
            history.remove(0);
        }
        Ok(())
    }

    async fn update(&self, release: Release) -> StoreResult<()> {
        let mut releases = self.releases.write().await;
        let history = releases
            .get_mut(&(release.namespace.clone(), release.name.clone()))
            .ok_or_else(|| StoreError::ReleaseNotFound {
                key: release.history_key(),
            })?;
        let slot = history
            .iter_mut()
            .find(|existing| existing.revision == release.revision)
            .ok_or_else(|| StoreError::ReleaseNotFound { key: release.key() })?;
        *slot = release;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, revision: i32) -> StoreResult<()> {
        let mut releases = self.releases.write().await;
        if let Some(history) =
            releases.get_mut(&(namespace.to_string(), name.to_string()))
        {
            history.retain(|release| release.revision != revision);
            if history.is_empty() {
                releases.remove(&(namespace.to_string(), name.to_string()));
            }
        }
        Ok(())
    }

    async fn delete_history(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut releases = self.releases.write().await;
        releases.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<Release>> {
        let releases = self.releases.read().await;
        Ok(releases
            .values()
            .filter_map(|history| history.last().cloned())
            .collect())
    }
}
