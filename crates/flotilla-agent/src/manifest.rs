//! Synthesis of the agent object set applied onto a downstream cluster:
//! service account, admin RBAC, the agent deployment (register init
//! container, agent and cluster-status containers), a permissive network
//! policy and optional scheduling objects.

use std::collections::BTreeMap;
use std::time::Duration;

use flotilla_core::crd::AgentSchedulingCustomization;
use flotilla_core::kube::core::{DynamicObject, TypeMeta};
use flotilla_core::labels::{AGENT_BOOTSTRAP_SET_ID, SET_ID_LABEL};
use flotilla_core::names::safe_concat_name;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements, ServiceAccount,
    Toleration,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicySpec,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::Serialize;
use snafu::{ResultExt as _, Snafu};

/// Name shared by the agent's workload objects.
pub const AGENT_NAME: &str = "fleet-agent";

const AGENT_APP_LABEL: &str = "app";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to encode agent object {kind}"))]
    Encode {
        source: serde_json::Error,
        kind: String,
    },
}

/// Inputs for one agent manifest. Everything is resolved by the caller; the
/// synthesis itself is pure.
#[derive(Clone, Debug, Default)]
pub struct AgentManifestOptions {
    pub agent_namespace: String,
    pub agent_scope: Option<String>,
    pub image: String,
    pub api_server_url: String,
    pub api_server_ca: Option<String>,
    pub client_id: String,
    pub registration_token: Option<String>,
    pub check_in_interval: Duration,
    pub garbage_collection_interval: Duration,
    pub tolerations: Vec<Toleration>,
    pub affinity: Option<Affinity>,
    pub resources: Option<ResourceRequirements>,
    pub env_vars: Vec<EnvVar>,
    pub host_network: Option<bool>,
    pub replicas: i32,
    pub scheduling: Option<AgentSchedulingCustomization>,
}

/// Produces the full agent object set, stamped with the bootstrap set id so
/// the agent never garbage-collects itself.
pub fn agent_manifest(opts: &AgentManifestOptions) -> Result<Vec<DynamicObject>, Error> {
    let labels = agent_labels(opts);
    let metadata = |name: String| ObjectMeta {
        name: Some(name),
        namespace: Some(opts.agent_namespace.clone()),
        labels: Some(labels.clone()),
        ..Default::default()
    };

    let service_account = ServiceAccount {
        metadata: metadata(AGENT_NAME.to_string()),
        ..Default::default()
    };

    let role_name = safe_concat_name([AGENT_NAME, opts.agent_namespace.as_str(), "admin"]);
    let cluster_role = ClusterRole {
        metadata: ObjectMeta {
            name: Some(role_name.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["*".to_string()]),
            resources: Some(vec!["*".to_string()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        }]),
        ..Default::default()
    };
    let cluster_role_binding = ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(role_name.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role_name,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: AGENT_NAME.to_string(),
            namespace: Some(opts.agent_namespace.clone()),
            ..Default::default()
        }]),
    };

    let deployment = agent_deployment(opts, &labels);

    let network_policy = NetworkPolicy {
        metadata: metadata("default-allow-all".to_string()),
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector::default(),
            ingress: Some(vec![NetworkPolicyIngressRule::default()]),
            egress: Some(vec![NetworkPolicyEgressRule::default()]),
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
        }),
    };

    let mut objects = vec![
        to_dynamic(&service_account, "v1", "ServiceAccount")?,
        to_dynamic(&cluster_role, "rbac.authorization.k8s.io/v1", "ClusterRole")?,
        to_dynamic(
            &cluster_role_binding,
            "rbac.authorization.k8s.io/v1",
            "ClusterRoleBinding",
        )?,
        to_dynamic(&deployment, "apps/v1", "Deployment")?,
        to_dynamic(&network_policy, "networking.k8s.io/v1", "NetworkPolicy")?,
    ];

    if let Some(scheduling) = &opts.scheduling {
        if let Some(priority) = &scheduling.priority_class {
            let priority_class = PriorityClass {
                metadata: ObjectMeta {
                    name: Some(priority_class_name()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                value: priority.value,
                preemption_policy: priority.preemption_policy.clone(),
                ..Default::default()
            };
            objects.push(to_dynamic(
                &priority_class,
                "scheduling.k8s.io/v1",
                "PriorityClass",
            )?);
        }
        if let Some(pdb) = &scheduling.pod_disruption_budget {
            let budget = PodDisruptionBudget {
                metadata: metadata(AGENT_NAME.to_string()),
                spec: Some(PodDisruptionBudgetSpec {
                    min_available: pdb.min_available.clone(),
                    max_unavailable: pdb.max_unavailable.clone(),
                    selector: Some(selector(&labels)),
                    ..Default::default()
                }),
                ..Default::default()
            };
            objects.push(to_dynamic(&budget, "policy/v1", "PodDisruptionBudget")?);
        }
    }

    Ok(objects)
}

pub fn priority_class_name() -> String {
    safe_concat_name([AGENT_NAME, "priority-class"])
}

fn agent_labels(opts: &AgentManifestOptions) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (AGENT_APP_LABEL.to_string(), AGENT_NAME.to_string()),
        (SET_ID_LABEL.to_string(), AGENT_BOOTSTRAP_SET_ID.to_string()),
    ]);
    if let Some(scope) = &opts.agent_scope {
        labels.insert("scope".to_string(), scope.clone());
    }
    labels
}

fn selector(labels: &BTreeMap<String, String>) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(
            AGENT_APP_LABEL.to_string(),
            labels[AGENT_APP_LABEL].clone(),
        )])),
        ..Default::default()
    }
}

fn agent_deployment(
    opts: &AgentManifestOptions,
    labels: &BTreeMap<String, String>,
) -> Deployment {
    let mut env = vec![
        env_var("NAMESPACE", &opts.agent_namespace),
        env_var("API_SERVER_URL", &opts.api_server_url),
        env_var("CLIENT_ID", &opts.client_id),
        env_var(
            "CHECKIN_INTERVAL",
            &humantime::format_duration(opts.check_in_interval).to_string(),
        ),
        env_var(
            "GARBAGE_COLLECTION_INTERVAL",
            &humantime::format_duration(opts.garbage_collection_interval).to_string(),
        ),
    ];
    if let Some(ca) = &opts.api_server_ca {
        env.push(env_var("API_SERVER_CA", ca));
    }
    if let Some(scope) = &opts.agent_scope {
        env.push(env_var("AGENT_SCOPE", scope));
    }
    env.extend(opts.env_vars.iter().cloned());

    let mut register_env = env.clone();
    if let Some(token) = &opts.registration_token {
        register_env.push(env_var("REGISTRATION_TOKEN", token));
    }

    let container = |name: &str, args: &[&str], env: Vec<EnvVar>| Container {
        name: name.to_string(),
        image: Some(opts.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(args.iter().map(ToString::to_string).collect()),
        env: Some(env),
        resources: opts.resources.clone(),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(AGENT_NAME.to_string()),
            namespace: Some(opts.agent_namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(opts.replicas.max(1)),
            selector: selector(labels),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(AGENT_NAME.to_string()),
                    init_containers: Some(vec![container(
                        "register",
                        &["register"],
                        register_env,
                    )]),
                    containers: vec![
                        container("agent", &["agent"], env.clone()),
                        container("cluster-status", &["cluster-status"], env),
                    ],
                    tolerations: if opts.tolerations.is_empty() {
                        None
                    } else {
                        Some(opts.tolerations.clone())
                    },
                    affinity: opts.affinity.clone(),
                    host_network: opts.host_network,
                    priority_class_name: opts
                        .scheduling
                        .as_ref()
                        .and_then(|scheduling| scheduling.priority_class.as_ref())
                        .map(|_| priority_class_name()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn to_dynamic<T: Serialize>(
    object: &T,
    api_version: &str,
    kind: &str,
) -> Result<DynamicObject, Error> {
    let mut value = serde_json::to_value(object).context(EncodeSnafu { kind })?;
    let metadata = value
        .as_object_mut()
        .and_then(|map| map.remove("metadata"))
        .unwrap_or_else(|| serde_json::json!({}));
    let metadata: ObjectMeta =
        serde_json::from_value(metadata).context(EncodeSnafu { kind })?;
    Ok(DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata,
        data: value,
    })
}

#[cfg(test)]
mod tests {
    use flotilla_core::crd::{PodDisruptionBudgetSpec as PdbSpec, PriorityClassSpec};

    use super::*;

    fn options() -> AgentManifestOptions {
        AgentManifestOptions {
            agent_namespace: "fleet-agent-system".into(),
            image: "mirror.example/flotilla-agent:v1".into(),
            api_server_url: "https://manager.example:6443".into(),
            client_id: "cluster-token".into(),
            registration_token: Some("register-me".into()),
            check_in_interval: Duration::from_secs(900),
            garbage_collection_interval: Duration::from_secs(900),
            replicas: 1,
            ..Default::default()
        }
    }

    fn kinds(objects: &[DynamicObject]) -> Vec<String> {
        objects
            .iter()
            .filter_map(|object| object.types.as_ref().map(|t| t.kind.clone()))
            .collect()
    }

    #[test]
    fn baseline_object_set() {
        let objects = agent_manifest(&options()).unwrap();
        assert_eq!(
            kinds(&objects),
            [
                "ServiceAccount",
                "ClusterRole",
                "ClusterRoleBinding",
                "Deployment",
                "NetworkPolicy"
            ]
        );

        for object in &objects {
            assert_eq!(
                object.metadata.labels.as_ref().unwrap()[SET_ID_LABEL],
                AGENT_BOOTSTRAP_SET_ID
            );
        }
    }

    #[test]
    fn deployment_wires_register_and_status_containers() {
        let objects = agent_manifest(&options()).unwrap();
        let deployment = objects
            .iter()
            .find(|object| object.types.as_ref().is_some_and(|t| t.kind == "Deployment"))
            .unwrap();

        let init = deployment
            .data
            .pointer("/spec/template/spec/initContainers")
            .unwrap();
        assert_eq!(init[0]["name"], "register");
        let register_env = init[0]["env"].as_array().unwrap();
        assert!(
            register_env
                .iter()
                .any(|var| var["name"] == "REGISTRATION_TOKEN")
        );

        let containers = deployment
            .data
            .pointer("/spec/template/spec/containers")
            .unwrap()
            .as_array()
            .unwrap();
        let names: Vec<&str> = containers
            .iter()
            .filter_map(|c| c["name"].as_str())
            .collect();
        assert_eq!(names, ["agent", "cluster-status"]);
    }

    #[test]
    fn scheduling_customization_adds_objects() {
        let mut opts = options();
        opts.scheduling = Some(AgentSchedulingCustomization {
            priority_class: Some(PriorityClassSpec {
                value: 1000,
                preemption_policy: None,
            }),
            pod_disruption_budget: Some(PdbSpec {
                min_available: Some(
                    k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(1),
                ),
                max_unavailable: None,
            }),
        });

        let objects = agent_manifest(&opts).unwrap();
        let kinds = kinds(&objects);
        assert!(kinds.contains(&"PriorityClass".to_string()));
        assert!(kinds.contains(&"PodDisruptionBudget".to_string()));

        let deployment = objects
            .iter()
            .find(|object| object.types.as_ref().is_some_and(|t| t.kind == "Deployment"))
            .unwrap();
        assert_eq!(
            deployment
                .data
                .pointer("/spec/template/spec/priorityClassName")
                .and_then(serde_json::Value::as_str),
            Some(priority_class_name().as_str())
        );
    }

    #[test]
    fn replicas_never_drop_below_one() {
        let mut opts = options();
        opts.replicas = 0;
        let objects = agent_manifest(&opts).unwrap();
        let deployment = objects
            .iter()
            .find(|object| object.types.as_ref().is_some_and(|t| t.kind == "Deployment"))
            .unwrap();
        assert_eq!(
            deployment.data.pointer("/spec/replicas").unwrap(),
            &serde_json::json!(1)
        );
    }
}
