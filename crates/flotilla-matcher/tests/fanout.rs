//! Matcher fan-out scenarios against the in-memory store.

use std::sync::Arc;

use flotilla_core::controller::{Outcome, Reconciler as _};
use flotilla_core::crd::{
    Bundle, BundleDeployment, Cluster, ClusterGroup, ClusterStatus, Content, FleetResource as _,
    deployment_id,
};
use flotilla_core::manifest::Manifest;
use flotilla_core::names::cluster_namespace;
use flotilla_core::store::{MemoryStore, ObjectKey, ObjectStoreExt as _};
use flotilla_matcher::BundleReconciler;
use indoc::indoc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;

struct Harness {
    manager: Arc<MemoryStore>,
    reconciler: BundleReconciler,
}

fn harness() -> Harness {
    let manager = Arc::new(MemoryStore::new());
    let reconciler = BundleReconciler {
        manager: Arc::clone(&manager) as Arc<dyn flotilla_core::store::ObjectStore>,
    };
    Harness {
        manager,
        reconciler,
    }
}

async fn seed_cluster(harness: &Harness, name: &str, labels: &[(&str, &str)]) -> Cluster {
    let namespace = cluster_namespace("n1", name);
    let cluster = Cluster {
        metadata: ObjectMeta {
            namespace: Some("n1".into()),
            name: Some(name.into()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        status: Some(ClusterStatus {
            namespace: Some(namespace),
            ..Default::default()
        }),
        ..Default::default()
    };
    harness.manager.create(&cluster).await.unwrap()
}

async fn seed_group(harness: &Harness, name: &str, match_labels: &[(&str, &str)]) {
    let group: ClusterGroup = serde_yaml::from_str(&format!(
        indoc! {"
            metadata:
              namespace: n1
              name: {}
            spec:
              selector:
                matchLabels:
                  {}: {}
        "},
        name, match_labels[0].0, match_labels[0].1
    ))
    .unwrap();
    harness.manager.create(&group).await.unwrap();
}

async fn seed_bundle(harness: &Harness, yaml: &str) -> Bundle {
    let bundle: Bundle = serde_yaml::from_str(yaml).unwrap();
    harness.manager.create(&bundle).await.unwrap()
}

async fn reconcile(harness: &Harness, bundle: &Bundle) -> Outcome {
    harness
        .reconciler
        .reconcile(&bundle.key(), &CancellationToken::new())
        .await
        .unwrap()
}

async fn deployments(harness: &Harness) -> Vec<BundleDeployment> {
    harness.manager.list(None, None).await.unwrap()
}

const SIMPLE_BUNDLE: &str = indoc! {"
    metadata:
      namespace: n1
      name: b
    spec:
      resources:
        - name: cm.yaml
          content: |
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: settings
      targets:
        - clusterGroup: all
      targetRestrictions:
        - clusterGroup: all
"};

#[tokio::test]
async fn single_cluster_fanout_without_customization() {
    let harness = harness();
    seed_cluster(&harness, "c1", &[("env", "prod")]).await;
    seed_group(&harness, "all", &[("env", "prod")]).await;
    let bundle = seed_bundle(&harness, SIMPLE_BUNDLE).await;

    reconcile(&harness, &bundle).await;

    let bds = deployments(&harness).await;
    assert_eq!(bds.len(), 1);
    let bd = &bds[0];
    assert_eq!(bd.name(), "b");
    assert_eq!(
        bd.namespace().unwrap(),
        cluster_namespace("n1", "c1")
    );
    assert_eq!(bd.spec.options, bundle.spec.options);

    let manifest_id = Manifest::new(bundle.spec.resources.clone())
        .process()
        .unwrap()
        .id()
        .unwrap();
    assert_eq!(
        bd.spec.deployment_id,
        deployment_id(&manifest_id, &bd.spec.options).unwrap()
    );

    // The content blob exists under the manifest id.
    let content: Content = harness
        .manager
        .get(&ObjectKey::cluster_scoped(&manifest_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content.sha256_sum, manifest_id);

    let bundle: Bundle = harness.manager.get(&bundle.key()).await.unwrap().unwrap();
    let status = bundle.status.unwrap();
    assert_eq!(status.summary.desired_ready, 1);
    assert_eq!(status.display.ready_clusters, "0/1");
}

#[tokio::test]
async fn fanout_is_deterministic() {
    let harness = harness();
    seed_cluster(&harness, "c1", &[("env", "prod")]).await;
    seed_group(&harness, "all", &[("env", "prod")]).await;
    let bundle = seed_bundle(&harness, SIMPLE_BUNDLE).await;

    reconcile(&harness, &bundle).await;
    let first = deployments(&harness).await;
    reconcile(&harness, &bundle).await;
    let second = deployments(&harness).await;

    assert_eq!(first.len(), second.len());
    assert_eq!(first[0].spec.deployment_id, second[0].spec.deployment_id);
    // No spurious rewrite happened.
    assert_eq!(
        first[0].metadata.resource_version,
        second[0].metadata.resource_version
    );
}

const CUSTOMIZED_BUNDLE: &str = indoc! {"
    metadata:
      namespace: n1
      name: b
    spec:
      resources:
        - name: cm.yaml
          content: |
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: settings
      options:
        helm:
          values:
            replicas: '9'
      targets:
        - clusterGroup: one
          helm:
            values:
              replicas: '1'
        - clusterGroup: all
          helm:
            values:
              replicas: '4'
"};

#[tokio::test]
async fn first_matching_customization_wins() {
    let harness = harness();
    seed_cluster(&harness, "c1", &[("tier", "one"), ("fleet", "yes")]).await;
    seed_cluster(&harness, "c2", &[("fleet", "yes")]).await;
    seed_cluster(&harness, "c3", &[("fleet", "yes")]).await;
    seed_group(&harness, "one", &[("tier", "one")]).await;
    seed_group(&harness, "all", &[("fleet", "yes")]).await;
    let bundle = seed_bundle(&harness, CUSTOMIZED_BUNDLE).await;

    reconcile(&harness, &bundle).await;

    let bds = deployments(&harness).await;
    assert_eq!(bds.len(), 3);

    let replicas_of = |cluster: &str| {
        let namespace = cluster_namespace("n1", cluster);
        let bd = bds
            .iter()
            .find(|bd| bd.namespace() == Some(namespace.as_str()))
            .unwrap();
        bd.spec.options.helm.as_ref().unwrap().values.as_ref().unwrap()["replicas"].clone()
    };
    assert_eq!(replicas_of("c1"), serde_json::json!("1"));
    assert_eq!(replicas_of("c2"), serde_json::json!("4"));
    assert_eq!(replicas_of("c3"), serde_json::json!("4"));

    // Distinct options hash into distinct deployment ids.
    let unique: std::collections::BTreeSet<&str> = bds
        .iter()
        .map(|bd| bd.spec.deployment_id.as_str())
        .collect();
    assert_eq!(unique.len(), 2);
}

#[tokio::test]
async fn do_not_deploy_excludes_and_deletes() {
    let harness = harness();
    seed_cluster(&harness, "c1", &[("fleet", "yes")]).await;
    seed_group(&harness, "all", &[("fleet", "yes")]).await;
    let bundle = seed_bundle(&harness, SIMPLE_BUNDLE).await;

    reconcile(&harness, &bundle).await;
    assert_eq!(deployments(&harness).await.len(), 1);

    // The matched customization flips to doNotDeploy.
    let mut bundle: Bundle = harness.manager.get(&bundle.key()).await.unwrap().unwrap();
    bundle.spec.targets[0].do_not_deploy = true;
    let bundle = harness.manager.update(&bundle).await.unwrap();

    reconcile(&harness, &bundle).await;
    assert!(deployments(&harness).await.is_empty());

    let bundle: Bundle = harness.manager.get(&bundle.key()).await.unwrap().unwrap();
    let status = bundle.status.unwrap();
    assert_eq!(status.summary.desired_ready, 0);
    assert!(
        status
            .conditions
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True")
    );
}

#[tokio::test]
async fn bundle_deletion_cascades_to_deployments() {
    let harness = harness();
    seed_cluster(&harness, "c1", &[("env", "prod")]).await;
    seed_group(&harness, "all", &[("env", "prod")]).await;
    let bundle = seed_bundle(&harness, SIMPLE_BUNDLE).await;

    reconcile(&harness, &bundle).await;
    assert_eq!(deployments(&harness).await.len(), 1);

    harness
        .manager
        .delete::<Bundle>(&bundle.key())
        .await
        .unwrap();
    // The reconciler observes the deletion.
    harness
        .reconciler
        .reconcile(&bundle.key(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(deployments(&harness).await.is_empty());
    let contents: Vec<Content> = harness.manager.list(None, None).await.unwrap();
    assert!(contents.is_empty());
}

#[tokio::test]
async fn restrictions_gate_eligibility() {
    let harness = harness();
    seed_cluster(&harness, "c1", &[("env", "prod")]).await;
    seed_cluster(&harness, "c2", &[("env", "dev")]).await;
    seed_group(&harness, "all", &[("env", "prod")]).await;
    let bundle = seed_bundle(&harness, SIMPLE_BUNDLE).await;

    reconcile(&harness, &bundle).await;

    let bds = deployments(&harness).await;
    assert_eq!(bds.len(), 1);
    assert_eq!(
        bds[0].namespace().unwrap(),
        cluster_namespace("n1", "c1")
    );
}

#[tokio::test]
async fn cluster_leaving_the_target_set_loses_its_deployment() {
    let harness = harness();
    let cluster = seed_cluster(&harness, "c1", &[("env", "prod")]).await;
    seed_group(&harness, "all", &[("env", "prod")]).await;
    let bundle = seed_bundle(&harness, SIMPLE_BUNDLE).await;

    reconcile(&harness, &bundle).await;
    assert_eq!(deployments(&harness).await.len(), 1);

    // The label that made the cluster match goes away.
    let mut cluster: Cluster = harness.manager.get(&cluster.key()).await.unwrap().unwrap();
    cluster.metadata.labels = Some(
        [("env".to_string(), "dev".to_string())].into(),
    );
    harness.manager.update(&cluster).await.unwrap();

    reconcile(&harness, &bundle).await;
    assert!(deployments(&harness).await.is_empty());
}

const TEMPLATED_BUNDLE: &str = indoc! {"
    metadata:
      namespace: n1
      name: b
    spec:
      resources:
        - name: cm.yaml
          content: |
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: settings
      options:
        helm:
          values:
            clusterName: '${ .ClusterName }'
            region: global.fleet.clusterLabels.region
      targets:
        - clusterGroup: all
"};

#[tokio::test]
async fn helm_values_are_templated_per_cluster() {
    let harness = harness();
    seed_cluster(&harness, "c1", &[("env", "prod"), ("region", "eu")]).await;
    seed_group(&harness, "all", &[("env", "prod")]).await;
    let bundle = seed_bundle(&harness, TEMPLATED_BUNDLE).await;

    reconcile(&harness, &bundle).await;

    let bds = deployments(&harness).await;
    let values = bds[0].spec.options.helm.as_ref().unwrap().values.as_ref().unwrap();
    assert_eq!(values["clusterName"], serde_json::json!("c1"));
    assert_eq!(values["region"], serde_json::json!("eu"));
}

#[tokio::test]
async fn clusters_without_namespaces_defer_creation() {
    let harness = harness();
    // Cluster exists but has no derived namespace yet.
    let cluster = Cluster {
        metadata: ObjectMeta {
            namespace: Some("n1".into()),
            name: Some("c1".into()),
            labels: Some([("env".to_string(), "prod".to_string())].into()),
            ..Default::default()
        },
        ..Default::default()
    };
    harness.manager.create(&cluster).await.unwrap();
    seed_group(&harness, "all", &[("env", "prod")]).await;
    let bundle = seed_bundle(&harness, SIMPLE_BUNDLE).await;

    let outcome = reconcile(&harness, &bundle).await;
    assert!(matches!(outcome, Outcome::RequeueAfter(_)), "{outcome:?}");
    assert!(deployments(&harness).await.is_empty());
}
