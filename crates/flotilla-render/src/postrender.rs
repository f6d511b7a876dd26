//! Post-rendering: object enumeration, namespace resolution and ownership
//! stamping. Everything applied downstream goes through here so labels and
//! annotations are deterministic for a given deployment id.

use std::collections::BTreeMap;

use flotilla_core::kube::core::DynamicObject;
use flotilla_core::labels;
use serde_json::Value;
use snafu::ResultExt as _;

use crate::{ClusterScopedUnderNamespaceSnafu, Error, MissingTypesSnafu, ParseObjectSnafu};

/// Parses a (possibly multi-document) YAML file into dynamic objects. Empty
/// documents and comment-only documents are skipped.
pub(crate) fn parse_documents(file: &str, content: &str) -> Result<Vec<DynamicObject>, Error> {
    let mut objects = Vec::new();
    for document in content.split("\n---") {
        let document = document.trim_start_matches("---").trim();
        if document.is_empty()
            || document
                .lines()
                .all(|line| line.trim().is_empty() || line.trim_start().starts_with('#'))
        {
            continue;
        }

        let value: Value =
            serde_yaml::from_str(document).context(ParseObjectSnafu { file })?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject =
            serde_json::from_value(value).map_err(|source| Error::ObjectCodec {
                source,
                name: file.to_string(),
            })?;
        objects.push(object);
    }
    Ok(objects)
}

/// Resolves every object's namespace and rejects cluster-scoped objects when
/// a target namespace forces everything into one place.
pub(crate) fn finalize_namespaces(
    objects: &mut [DynamicObject],
    target_namespace: Option<&str>,
    release_namespace: &str,
) -> Result<(), Error> {
    for object in objects.iter_mut() {
        let kind = object
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .ok_or_else(|| {
                MissingTypesSnafu {
                    file: object.metadata.name.clone().unwrap_or_default(),
                }
                .build()
            })?;

        if crate::scope::is_cluster_scoped(&kind) {
            if target_namespace.is_some() {
                return ClusterScopedUnderNamespaceSnafu {
                    kind,
                    name: object.metadata.name.clone().unwrap_or_default(),
                }
                .fail();
            }
            object.metadata.namespace = None;
        } else if let Some(target) = target_namespace {
            object.metadata.namespace = Some(target.to_string());
        } else if object.metadata.namespace.is_none() {
            object.metadata.namespace = Some(release_namespace.to_string());
        }
    }
    Ok(())
}

/// Stamps the ownership label and retention annotations.
pub(crate) fn stamp_objects(objects: &mut [DynamicObject], set_id: &str, keep_crds: bool) {
    for object in objects.iter_mut() {
        object
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(labels::SET_ID_LABEL.to_string(), set_id.to_string());

        let is_crd = object
            .types
            .as_ref()
            .is_some_and(|t| t.kind == "CustomResourceDefinition");
        if keep_crds && is_crd {
            let annotations = object.metadata.annotations.get_or_insert_with(BTreeMap::new);
            annotations.insert(
                labels::HELM_RESOURCE_POLICY_ANNOTATION.to_string(),
                labels::HELM_RESOURCE_POLICY_KEEP.to_string(),
            );
            annotations.insert(
                labels::KEEP_RESOURCES_ANNOTATION.to_string(),
                "true".to_string(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn multi_document_parsing_skips_empty_docs() {
        let objects = parse_documents(
            "f.yaml",
            indoc! {"
                # leading comment only
                ---
                apiVersion: v1
                kind: ConfigMap
                metadata:
                  name: a
                ---
                ---
                apiVersion: v1
                kind: Service
                metadata:
                  name: b
            "},
        )
        .unwrap();
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn namespaces_default_to_the_release_namespace() {
        let mut objects = parse_documents(
            "f.yaml",
            indoc! {"
                apiVersion: v1
                kind: ConfigMap
                metadata:
                  name: a
                ---
                apiVersion: v1
                kind: ConfigMap
                metadata:
                  name: b
                  namespace: keep-me
            "},
        )
        .unwrap();
        finalize_namespaces(&mut objects, None, "fallback").unwrap();
        assert_eq!(objects[0].metadata.namespace.as_deref(), Some("fallback"));
        assert_eq!(objects[1].metadata.namespace.as_deref(), Some("keep-me"));
    }

    #[test]
    fn target_namespace_overrides_everything() {
        let mut objects = parse_documents(
            "f.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: original\n",
        )
        .unwrap();
        finalize_namespaces(&mut objects, Some("forced"), "fallback").unwrap();
        assert_eq!(objects[0].metadata.namespace.as_deref(), Some("forced"));
    }

    #[test]
    fn cluster_scoped_under_target_namespace_fails() {
        let mut objects = parse_documents(
            "f.yaml",
            "apiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: r\n",
        )
        .unwrap();
        let err = finalize_namespaces(&mut objects, Some("forced"), "fallback").unwrap_err();
        assert!(
            matches!(err, Error::ClusterScopedUnderNamespace { .. }),
            "{err}"
        );
    }

    #[test]
    fn stamping_adds_set_id_and_crd_retention() {
        let mut objects = parse_documents(
            "f.yaml",
            indoc! {"
                apiVersion: apiextensions.k8s.io/v1
                kind: CustomResourceDefinition
                metadata:
                  name: widgets.example.com
                ---
                apiVersion: v1
                kind: ConfigMap
                metadata:
                  name: cm
            "},
        )
        .unwrap();
        stamp_objects(&mut objects, "set-a", true);

        let crd = &objects[0];
        assert_eq!(
            crd.metadata.labels.as_ref().unwrap()[flotilla_core::labels::SET_ID_LABEL],
            "set-a"
        );
        let annotations = crd.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["helm.sh/resource-policy"], "keep");
        assert_eq!(annotations["keep-resources"], "true");

        assert!(objects[1].metadata.annotations.is_none());
    }
}
