//! Cluster registration and agent lifecycle: derived namespaces, per-cluster
//! credentials, agent manifest synthesis and the import reconciler that
//! keeps downstream agents converged with manager-side configuration.

pub mod connector;
pub mod image;
pub mod import;
pub mod manifest;
pub mod namespace;
pub mod token;

pub use connector::{DownstreamConnector, KubeConfig, smoke_test};
pub use import::{ClusterImportReconciler, agent_deployed, requested_agent_namespace};
pub use manifest::{AGENT_NAME, AgentManifestOptions, agent_manifest};
pub use namespace::ensure_cluster_namespace;
pub use token::{ensure_registration_token, generate_token, token_name};
