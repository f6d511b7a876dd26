//! Post-render kustomization: the subset of `kustomization.yaml` bundles
//! actually use. Resources are resolved against the bundle's own files;
//! patches target rendered objects by group/version/kind and name.

use std::collections::BTreeMap;

use flotilla_core::kube::core::DynamicObject;
use flotilla_core::manifest::Manifest;
use flotilla_core::patch::apply_merge_patch;
use serde::Deserialize;
use serde_json::Value;
use snafu::ResultExt as _;

use crate::{
    Error, KustomizePatchSnafu, KustomizeResourceMissingSnafu, KustomizeSnafu,
    postrender::parse_documents,
};

pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Kustomization {
    #[serde(default)]
    resources: Vec<String>,

    #[serde(default)]
    patches: Vec<KustomizePatch>,

    #[serde(default)]
    namespace: Option<String>,

    #[serde(default)]
    common_labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KustomizePatch {
    /// Path of a patch file within the bundle.
    #[serde(default)]
    path: Option<String>,

    /// Inline patch payload.
    #[serde(default)]
    patch: Option<String>,

    #[serde(default)]
    target: Option<PatchTarget>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchTarget {
    #[serde(default)]
    kind: Option<String>,

    #[serde(default)]
    name: Option<String>,

    #[serde(default)]
    namespace: Option<String>,
}

/// Whether the manifest opts into kustomization at all.
pub fn wants_kustomize(manifest: &Manifest, dir: Option<&str>) -> bool {
    manifest
        .resources
        .iter()
        .any(|resource| resource.name == kustomization_path(dir))
}

fn kustomization_path(dir: Option<&str>) -> String {
    match dir {
        Some(dir) if !dir.is_empty() => format!("{}/{KUSTOMIZATION_FILE}", dir.trim_end_matches('/')),
        _ => KUSTOMIZATION_FILE.to_string(),
    }
}

fn resolve_path(dir: Option<&str>, path: &str) -> String {
    match dir {
        Some(dir) if !dir.is_empty() => format!("{}/{path}", dir.trim_end_matches('/')),
        _ => path.to_string(),
    }
}

/// Files the kustomization claims for itself: the kustomization file, its
/// resources and its patch files. These are excluded from plain template
/// enumeration so objects are not rendered twice.
pub fn referenced_files(
    manifest: &Manifest,
    dir: Option<&str>,
) -> std::collections::BTreeSet<String> {
    let mut referenced = std::collections::BTreeSet::new();
    let path = kustomization_path(dir);
    let Some(file) = manifest.resources.iter().find(|r| r.name == path) else {
        return referenced;
    };
    referenced.insert(path);

    let Ok(kustomization) = serde_yaml::from_str::<Kustomization>(&file.content) else {
        return referenced;
    };
    for resource in &kustomization.resources {
        referenced.insert(resolve_path(dir, resource));
    }
    for patch in &kustomization.patches {
        if let Some(path) = &patch.path {
            referenced.insert(resolve_path(dir, path));
        }
    }
    referenced
}

/// Applies the kustomization found in `manifest` to the rendered objects.
pub fn apply(
    objects: Vec<DynamicObject>,
    manifest: &Manifest,
    dir: Option<&str>,
) -> Result<Vec<DynamicObject>, Error> {
    let path = kustomization_path(dir);
    let Some(file) = manifest.resources.iter().find(|r| r.name == path) else {
        return Ok(objects);
    };

    let kustomization: Kustomization =
        serde_yaml::from_str(&file.content).context(KustomizeSnafu { path: path.clone() })?;

    let mut objects = objects;

    // Additional resources pulled in by the kustomization, relative to its
    // directory.
    for resource in &kustomization.resources {
        let resolved = resolve_path(dir, resource);
        let file = manifest
            .resources
            .iter()
            .find(|r| r.name == resolved)
            .ok_or_else(|| {
                KustomizeResourceMissingSnafu {
                    path: resolved.clone(),
                }
                .build()
            })?;
        let mut parsed = parse_documents(&file.name, &file.content)?;
        objects.append(&mut parsed);
    }

    for patch in &kustomization.patches {
        let payload = match (&patch.patch, &patch.path) {
            (Some(inline), _) => inline.clone(),
            (None, Some(path)) => {
                let resolved = resolve_path(dir, path);
                manifest
                    .resources
                    .iter()
                    .find(|r| r.name == resolved)
                    .ok_or_else(|| {
                        KustomizeResourceMissingSnafu {
                            path: resolved.clone(),
                        }
                        .build()
                    })?
                    .content
                    .clone()
            }
            (None, None) => continue,
        };
        apply_patch(&mut objects, patch.target.as_ref(), &payload)?;
    }

    if let Some(namespace) = &kustomization.namespace {
        for object in &mut objects {
            if object
                .types
                .as_ref()
                .is_none_or(|t| crate::scope::is_namespaced(&t.kind))
            {
                object.metadata.namespace = Some(namespace.clone());
            }
        }
    }

    if !kustomization.common_labels.is_empty() {
        for object in &mut objects {
            let labels = object.metadata.labels.get_or_insert_with(BTreeMap::new);
            for (key, value) in &kustomization.common_labels {
                labels.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(objects)
}

fn apply_patch(
    objects: &mut [DynamicObject],
    target: Option<&PatchTarget>,
    payload: &str,
) -> Result<(), Error> {
    let is_operations = payload.trim_start().starts_with('[')
        || payload.trim_start().starts_with("- op:");

    for object in objects.iter_mut() {
        if !target_matches(target, object) {
            continue;
        }

        let mut doc = serde_json::to_value(&*object).map_err(|source| Error::ObjectCodec {
            source,
            name: object.metadata.name.clone().unwrap_or_default(),
        })?;

        if is_operations {
            let operations: json_patch::Patch = serde_yaml::from_str(payload)
                .context(KustomizeSnafu {
                    path: "patch".to_string(),
                })?;
            json_patch::patch(&mut doc, &operations).context(KustomizePatchSnafu {
                name: object.metadata.name.clone().unwrap_or_default(),
            })?;
        } else {
            let overlay: Value = serde_yaml::from_str(payload).context(KustomizeSnafu {
                path: "patch".to_string(),
            })?;
            apply_merge_patch(&mut doc, &overlay);
        }

        *object = serde_json::from_value(doc).map_err(|source| Error::ObjectCodec {
            source,
            name: object.metadata.name.clone().unwrap_or_default(),
        })?;
    }
    Ok(())
}

fn target_matches(target: Option<&PatchTarget>, object: &DynamicObject) -> bool {
    let Some(target) = target else {
        return true;
    };
    if let Some(kind) = &target.kind {
        if object.types.as_ref().map(|t| t.kind.as_str()) != Some(kind.as_str()) {
            return false;
        }
    }
    if let Some(name) = &target.name {
        if object.metadata.name.as_deref() != Some(name.as_str()) {
            return false;
        }
    }
    if let Some(namespace) = &target.namespace {
        if object.metadata.namespace.as_deref() != Some(namespace.as_str()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use flotilla_core::manifest::BundleResource;
    use indoc::indoc;

    use super::*;

    fn objects_from(content: &str) -> Vec<DynamicObject> {
        parse_documents("test.yaml", content).unwrap()
    }

    #[test]
    fn no_kustomization_is_a_passthrough() {
        let manifest = Manifest::new(vec![BundleResource::plain("a.yaml", "kind: A")]);
        let objects = objects_from("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm");
        let out = apply(objects.clone(), &manifest, None).unwrap();
        assert_eq!(out.len(), objects.len());
    }

    #[test]
    fn namespace_and_labels_are_stamped() {
        let manifest = Manifest::new(vec![BundleResource::plain(
            "kustomization.yaml",
            indoc! {"
                namespace: prod
                commonLabels:
                  team: platform
            "},
        )]);
        let objects = objects_from(indoc! {"
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: cm
            ---
            apiVersion: rbac.authorization.k8s.io/v1
            kind: ClusterRole
            metadata:
              name: role
        "});

        let out = apply(objects, &manifest, None).unwrap();
        assert_eq!(out[0].metadata.namespace.as_deref(), Some("prod"));
        // Cluster-scoped objects keep no namespace.
        assert_eq!(out[1].metadata.namespace, None);
        assert_eq!(
            out[0].metadata.labels.as_ref().unwrap().get("team"),
            Some(&"platform".to_string())
        );
    }

    #[test]
    fn merge_patch_hits_only_the_target() {
        let manifest = Manifest::new(vec![BundleResource::plain(
            "overlays/kustomization.yaml",
            indoc! {r#"
                patches:
                  - target:
                      kind: ConfigMap
                      name: cm
                    patch: |
                      data:
                        level: debug
            "#},
        )]);
        let objects = objects_from(indoc! {"
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: cm
            data:
              level: info
            ---
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: other
            data:
              level: info
        "});

        let out = apply(objects, &manifest, Some("overlays")).unwrap();
        assert_eq!(out[0].data["data"]["level"], "debug");
        assert_eq!(out[1].data["data"]["level"], "info");
    }

    #[test]
    fn kustomize_resources_are_appended() {
        let manifest = Manifest::new(vec![
            BundleResource::plain(
                "kustomization.yaml",
                "resources:\n  - extra.yaml\n",
            ),
            BundleResource::plain(
                "extra.yaml",
                "apiVersion: v1\nkind: Service\nmetadata:\n  name: svc\n",
            ),
        ]);
        let out = apply(Vec::new(), &manifest, None).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].types.as_ref().unwrap().kind, "Service");
    }

    #[test]
    fn missing_resource_fails() {
        let manifest = Manifest::new(vec![BundleResource::plain(
            "kustomization.yaml",
            "resources:\n  - gone.yaml\n",
        )]);
        let err = apply(Vec::new(), &manifest, None).unwrap_err();
        assert!(matches!(err, Error::KustomizeResourceMissing { .. }), "{err}");
    }

    #[test]
    fn detection_respects_the_chosen_dir() {
        let manifest = Manifest::new(vec![BundleResource::plain(
            "overlays/prod/kustomization.yaml",
            "{}",
        )]);
        assert!(wants_kustomize(&manifest, Some("overlays/prod")));
        assert!(!wants_kustomize(&manifest, None));
    }
}
