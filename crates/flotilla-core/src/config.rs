//! Process-wide controller configuration.
//!
//! The config is an immutable value swapped atomically on change; interested
//! reconcilers subscribe to a change broadcast and re-read at most once per
//! invocation.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::crd::AgentTlsMode;

/// Namespace the agent operates in when a cluster does not pick one.
pub const DEFAULT_AGENT_NAMESPACE: &str = "fleet-agent-system";

/// The deprecated default namespace older agents were deployed into;
/// clusters observed there are migrated unless the operator opted into it
/// explicitly.
pub const LEGACY_AGENT_NAMESPACE: &str = "fleet-system";

pub const ENV_NAMESPACE: &str = "NAMESPACE";
pub const ENV_BUNDLE_DEPLOYMENT_WORKERS: &str = "BUNDLEDEPLOYMENT_RECONCILER_WORKERS";
pub const ENV_DRIFT_WORKERS: &str = "DRIFT_RECONCILER_WORKERS";
pub const ENV_CHECKIN_INTERVAL: &str = "CHECKIN_INTERVAL";
pub const ENV_AGENT_SCOPE: &str = "AGENT_SCOPE";
pub const ENV_AGENT_REPLICA_COUNT: &str = "FLEET_AGENT_REPLICA_COUNT";

pub const DEFAULT_BUNDLE_DEPLOYMENT_WORKERS: usize = 5;
pub const DEFAULT_DRIFT_WORKERS: usize = 5;
/// Cluster import is serialized: one worker.
pub const CLUSTER_IMPORT_WORKERS: usize = 1;

/// Re-enqueue delay while waiting on cluster credentials.
pub const TOKEN_CLUSTER_ENQUEUE_DELAY: Duration = Duration::from_secs(2);

/// Window in which drift events for one deployment collapse into a single
/// reconcile.
pub const DRIFT_AGGREGATION_WINDOW: Duration = Duration::from_secs(5);

/// Deadline for ordinary store and downstream RPCs.
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for downstream applies, which fan out to many objects.
pub const DEFAULT_APPLY_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// URL downstream agents use to reach the manager's API server.
    pub api_server_url: String,

    /// PEM CA bundle for that URL; `None` trusts the system pool.
    pub api_server_ca: Option<String>,

    pub agent_tls_mode: AgentTlsMode,

    /// How often agents garbage-collect orphaned releases.
    #[serde(with = "humantime_serde")]
    pub garbage_collection_interval: Duration,

    /// Agent image reference before registry rewriting.
    pub agent_image: String,

    /// Registry prefix images are known under globally, stripped before
    /// applying `image_repo_prefix`.
    pub global_registry: Option<String>,

    /// Private registry prefix to pull agent images through.
    pub image_repo_prefix: Option<String>,

    /// How often agents report cluster status upstream.
    #[serde(with = "humantime_serde")]
    pub agent_check_in_interval: Duration,

    /// Lifetime of cluster registration tokens.
    #[serde(with = "humantime_serde")]
    pub cluster_import_token_ttl: Duration,

    /// Default agent namespace for clusters that do not set one.
    pub agent_namespace: String,

    /// True when the operator explicitly chose the (possibly legacy) agent
    /// namespace, which opts out of namespace migration.
    pub agent_namespace_explicit: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            api_server_url: String::new(),
            api_server_ca: None,
            agent_tls_mode: AgentTlsMode::SystemStore,
            garbage_collection_interval: Duration::from_secs(15 * 60),
            agent_image: "ghcr.io/flotilla-dev/flotilla-agent:latest".to_string(),
            global_registry: None,
            image_repo_prefix: None,
            agent_check_in_interval: Duration::from_secs(15 * 60),
            cluster_import_token_ttl: Duration::from_secs(60 * 60),
            agent_namespace: DEFAULT_AGENT_NAMESPACE.to_string(),
            agent_namespace_explicit: false,
        }
    }
}

// Serde adapter for humantime strings like "15m".
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Shared cell holding the current config. Readers get a cheap snapshot;
/// replacing the value bumps a watch channel so subscribers can react.
pub struct ConfigCell {
    current: ArcSwap<ControllerConfig>,
    changed: watch::Sender<u64>,
}

impl ConfigCell {
    pub fn new(config: ControllerConfig) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(config),
            changed,
        }
    }

    pub fn get(&self) -> Arc<ControllerConfig> {
        self.current.load_full()
    }

    pub fn replace(&self, config: ControllerConfig) {
        self.current.store(Arc::new(config));
        self.changed.send_modify(|revision| *revision += 1);
    }

    /// Receiver that changes value whenever the config is replaced.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }
}

impl Default for ConfigCell {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Worker count from an environment variable, falling back on unset or
/// unparsable values.
pub fn worker_count_from_env(name: &str, default: usize) -> usize {
    env_var(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// The agent's operating namespace on the downstream cluster.
pub fn agent_namespace_from_env() -> Option<String> {
    env_var(ENV_NAMESPACE)
}

/// Check-in interval override, e.g. `CHECKIN_INTERVAL=5m`.
pub fn checkin_interval_from_env() -> Option<Duration> {
    env_var(ENV_CHECKIN_INTERVAL).and_then(|value| humantime::parse_duration(&value).ok())
}

/// Scope label for running several agents in one namespace.
pub fn agent_scope_from_env() -> Option<String> {
    env_var(ENV_AGENT_SCOPE)
}

pub fn agent_replicas_from_env() -> Option<i32> {
    env_var(ENV_AGENT_REPLICA_COUNT).and_then(|value| value.parse().ok())
}
