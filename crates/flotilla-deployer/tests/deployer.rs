//! End-to-end deployer flows against in-memory stores.

use std::sync::Arc;

use flotilla_core::crd::{
    BundleDeployment, BundleDeploymentOptions, DriftCorrection, FleetResource as _, HelmOptions,
    deployment_id,
};
use flotilla_core::kube::core::GroupVersionKind;
use flotilla_core::manifest::{BundleResource, Manifest};
use flotilla_core::store::{MemoryStore, ObjectKey, ObjectStore};
use flotilla_deployer::release::{MAX_HELM_HISTORY, MemoryReleaseStore, ReleaseState, ReleaseStore};
use flotilla_deployer::{Deployer, Release};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

fn manifest(level: &str) -> Manifest {
    Manifest::new(vec![BundleResource::plain(
        "cm.yaml",
        format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  level: {level}\n"
        ),
    )])
}

fn harness() -> (Arc<MemoryStore>, Arc<MemoryReleaseStore>, Deployer) {
    let downstream = Arc::new(MemoryStore::new());
    let releases = Arc::new(MemoryReleaseStore::new());
    let deployer = Deployer::new(
        Arc::clone(&downstream) as Arc<dyn ObjectStore>,
        Arc::clone(&releases) as Arc<dyn flotilla_deployer::ReleaseStore>,
        "default",
        "fleet-agent-system",
    );
    (downstream, releases, deployer)
}

fn config_map_gvk() -> GroupVersionKind {
    GroupVersionKind {
        group: String::new(),
        version: "v1".into(),
        kind: "ConfigMap".into(),
    }
}

#[tokio::test]
async fn install_creates_a_deployed_release_and_objects() {
    let (downstream, _releases, deployer) = harness();

    let release = deployer
        .deploy("app", &manifest("info"), &BundleDeploymentOptions::default(), None, false)
        .await
        .unwrap();

    assert_eq!(release.revision, 1);
    assert_eq!(release.state, ReleaseState::Deployed);
    assert_eq!(release.key(), "default/app:1");

    let live = downstream
        .get_dynamic(&config_map_gvk(), &ObjectKey::namespaced("default", "settings"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(live.data["data"]["level"], "info");
}

#[tokio::test]
async fn history_stays_bounded_over_many_deploys() {
    let (_downstream, releases, deployer) = harness();

    for round in 0..5 {
        deployer
            .deploy(
                "app",
                &manifest(&format!("level-{round}")),
                &BundleDeploymentOptions::default(),
                None,
                false,
            )
            .await
            .unwrap();
    }

    let history = releases.history("default", "app").await.unwrap();
    assert!(history.len() <= MAX_HELM_HISTORY, "history: {}", history.len());
    let last = history.last().unwrap();
    assert_eq!(last.revision, 5);
    assert_eq!(last.state, ReleaseState::Deployed);
}

#[tokio::test]
async fn dry_run_never_mutates() {
    let (downstream, releases, deployer) = harness();

    let release = deployer
        .deploy("app", &manifest("info"), &BundleDeploymentOptions::default(), None, true)
        .await
        .unwrap();
    assert_eq!(release.revision, 1);

    assert!(releases.list().await.unwrap().is_empty());
    let live = downstream
        .get_dynamic(&config_map_gvk(), &ObjectKey::namespaced("default", "settings"))
        .await
        .unwrap();
    assert!(live.is_none());
}

#[tokio::test]
async fn pending_upgrade_is_rolled_back_and_retried() {
    let (_downstream, releases, deployer) = harness();

    deployer
        .deploy("app", &manifest("v1"), &BundleDeploymentOptions::default(), None, false)
        .await
        .unwrap();
    deployer
        .deploy("app", &manifest("v2"), &BundleDeploymentOptions::default(), None, false)
        .await
        .unwrap();

    // A crashed concurrent writer left a pending-install revision behind.
    let deployed = releases.deployed("default", "app").await.unwrap().unwrap();
    let mut stuck = deployed.clone();
    stuck.revision = deployed.revision + 1;
    stuck.state = ReleaseState::PendingInstall;
    releases.create(stuck, MAX_HELM_HISTORY).await.unwrap();

    let release = deployer
        .deploy("app", &manifest("v3"), &BundleDeploymentOptions::default(), None, false)
        .await
        .unwrap();

    assert_eq!(release.state, ReleaseState::Deployed);
    let history = releases.history("default", "app").await.unwrap();
    assert!(history.iter().all(|r| !r.state.is_pending()), "{history:?}");
    assert_eq!(history.last().unwrap().revision, release.revision);
}

#[tokio::test]
async fn release_name_override_controls_the_release_key() {
    let (_downstream, releases, deployer) = harness();

    let options = BundleDeploymentOptions {
        target_namespace: Some("apps".into()),
        helm: Some(HelmOptions {
            release_name: Some("custom".into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let release = deployer
        .deploy("app", &manifest("info"), &options, None, false)
        .await
        .unwrap();
    assert_eq!(release.key(), "apps/custom:1");
    assert_eq!(releases.history("apps", "custom").await.unwrap().len(), 1);
}

fn bundle_deployment(name: &str, options: BundleDeploymentOptions, drift: bool) -> BundleDeployment {
    let id = deployment_id("manifest", &options).unwrap();
    BundleDeployment {
        metadata: ObjectMeta {
            namespace: Some("cluster-ns".into()),
            name: Some(name.into()),
            ..Default::default()
        },
        spec: flotilla_core::crd::BundleDeploymentSpec {
            deployment_id: id,
            options,
            correct_drift: drift.then(|| DriftCorrection {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn drift_is_reported_but_not_corrected_when_disabled() {
    let (downstream, _releases, deployer) = harness();

    deployer
        .deploy("app", &manifest("v1"), &BundleDeploymentOptions::default(), None, false)
        .await
        .unwrap();

    // Out-of-band edit.
    let key = ObjectKey::namespaced("default", "settings");
    let mut live = downstream
        .get_dynamic(&config_map_gvk(), &key)
        .await
        .unwrap()
        .unwrap();
    live.data["data"]["level"] = json!("edited");
    downstream.apply_dynamic(live).await.unwrap();

    let mut bd = bundle_deployment("app", BundleDeploymentOptions::default(), false);
    deployer.update_bundle_deployment_status(&mut bd).await.unwrap();

    let status = bd.status.unwrap();
    assert!(!status.non_modified);
    assert_eq!(status.modified_status.len(), 1);
    assert!(status.modified_status[0].patch.is_some());

    // No downstream write happened.
    let still = downstream
        .get_dynamic(&config_map_gvk(), &key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still.data["data"]["level"], "edited");
}

#[tokio::test]
async fn drift_correction_rolls_back_external_edits() {
    let (downstream, releases, deployer) = harness();

    deployer
        .deploy("app", &manifest("v1"), &BundleDeploymentOptions::default(), None, false)
        .await
        .unwrap();

    let key = ObjectKey::namespaced("default", "settings");
    let mut live = downstream
        .get_dynamic(&config_map_gvk(), &key)
        .await
        .unwrap()
        .unwrap();
    live.data["data"]["level"] = json!("edited");
    downstream.apply_dynamic(live).await.unwrap();

    let mut bd = bundle_deployment("app", BundleDeploymentOptions::default(), true);
    deployer.update_bundle_deployment_status(&mut bd).await.unwrap();

    // The rollback re-applied the release content.
    let corrected = downstream
        .get_dynamic(&config_map_gvk(), &key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(corrected.data["data"]["level"], "v1");

    let deployed = releases.deployed("default", "app").await.unwrap().unwrap();
    assert!(deployed.revision > 1);

    // The next status pass sees no modifications.
    let mut bd = bundle_deployment("app", BundleDeploymentOptions::default(), true);
    deployer.update_bundle_deployment_status(&mut bd).await.unwrap();
    assert!(bd.status.unwrap().non_modified);
}

#[tokio::test]
async fn cleanup_uninstalls_orphaned_releases_but_keeps_agent_objects() {
    let (downstream, releases, deployer) = harness();

    deployer
        .deploy("app", &manifest("v1"), &BundleDeploymentOptions::default(), None, false)
        .await
        .unwrap();
    deployer
        .deploy(
            "fleet-agent-c1",
            &Manifest::new(vec![BundleResource::plain(
                "agent.yaml",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: agent-config\n",
            )]),
            &BundleDeploymentOptions::default(),
            None,
            false,
        )
        .await
        .unwrap();

    // No BundleDeployment exists for either release.
    let summary = deployer.cleanup(&[]).await.unwrap();
    assert_eq!(summary.uninstalled, vec!["default/app".to_string()]);

    // The app's objects are gone, the agent's survive with only the
    // history dropped.
    let app_object = downstream
        .get_dynamic(&config_map_gvk(), &ObjectKey::namespaced("default", "settings"))
        .await
        .unwrap();
    assert!(app_object.is_none());
    let agent_object = downstream
        .get_dynamic(
            &config_map_gvk(),
            &ObjectKey::namespaced("default", "agent-config"),
        )
        .await
        .unwrap();
    assert!(agent_object.is_some());
    assert!(releases.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn cleanup_leaves_live_deployments_alone() {
    let (_downstream, releases, deployer) = harness();

    deployer
        .deploy("app", &manifest("v1"), &BundleDeploymentOptions::default(), None, false)
        .await
        .unwrap();

    let bd = bundle_deployment("app", BundleDeploymentOptions::default(), false);
    let summary = deployer.cleanup(std::slice::from_ref(&bd)).await.unwrap();
    assert!(summary.uninstalled.is_empty());
    assert_eq!(releases.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn uninstall_respects_keep_annotations() {
    let (downstream, releases, deployer) = harness();

    let kept = Manifest::new(vec![BundleResource::plain(
        "crd.yaml",
        "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n",
    )]);
    deployer
        .deploy("app", &kept, &BundleDeploymentOptions::default(), None, false)
        .await
        .unwrap();

    let release: Release = releases.last("default", "app").await.unwrap().unwrap();
    deployer_uninstall(&deployer, &release).await;

    let crd_gvk = GroupVersionKind {
        group: "apiextensions.k8s.io".into(),
        version: "v1".into(),
        kind: "CustomResourceDefinition".into(),
    };
    let live = downstream
        .get_dynamic(&crd_gvk, &ObjectKey::cluster_scoped("widgets.example.com"))
        .await
        .unwrap();
    // deleteCRDResources defaults to false, so the CRD carries the keep
    // annotation and survives the uninstall.
    assert!(live.is_some());
}

async fn deployer_uninstall(deployer: &Deployer, release: &Release) {
    // Cleanup with no deployments uninstalls everything eligible.
    let summary = deployer.cleanup(&[]).await.unwrap();
    assert!(summary.uninstalled.contains(&release.history_key()));
}
