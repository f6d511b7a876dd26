//! Cluster eligibility and target selection for a bundle.
//!
//! A selection criteria block names clusters by exact name, by label
//! selector, by cluster group, or by a selector over group labels. Criteria
//! within one block are ANDed; absent criteria match everything.

use flotilla_core::crd::{
    Bundle, BundleTarget, Cluster, ClusterGroup, FleetResource as _, TargetRestriction,
};
use flotilla_core::selector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use snafu::{ResultExt as _, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid selector in target {target:?}"))]
    BadSelector {
        source: selector::Error,
        target: String,
    },
}

/// One target's selection criteria, shared between customization targets
/// and target restrictions.
#[derive(Clone, Debug, Default)]
pub struct Criteria<'a> {
    pub name: Option<&'a str>,
    pub cluster_name: Option<&'a str>,
    pub cluster_selector: Option<&'a LabelSelector>,
    pub cluster_group: Option<&'a str>,
    pub cluster_group_selector: Option<&'a LabelSelector>,
}

impl<'a> From<&'a BundleTarget> for Criteria<'a> {
    fn from(target: &'a BundleTarget) -> Self {
        Self {
            name: target.name.as_deref(),
            cluster_name: target.cluster_name.as_deref(),
            cluster_selector: target.cluster_selector.as_ref(),
            cluster_group: target.cluster_group.as_deref(),
            cluster_group_selector: target.cluster_group_selector.as_ref(),
        }
    }
}

impl<'a> From<&'a TargetRestriction> for Criteria<'a> {
    fn from(restriction: &'a TargetRestriction) -> Self {
        Self {
            name: restriction.name.as_deref(),
            cluster_name: restriction.cluster_name.as_deref(),
            cluster_selector: restriction.cluster_selector.as_ref(),
            cluster_group: restriction.cluster_group.as_deref(),
            cluster_group_selector: restriction.cluster_group_selector.as_ref(),
        }
    }
}

impl Criteria<'_> {
    fn label(&self) -> String {
        self.name
            .or(self.cluster_name)
            .or(self.cluster_group)
            .unwrap_or("<selector>")
            .to_string()
    }

    /// Whether this criteria block matches the cluster. All present
    /// criteria must hold.
    pub fn matches(
        &self,
        cluster: &Cluster,
        groups: &[ClusterGroup],
    ) -> Result<bool, Error> {
        if let Some(name) = self.cluster_name {
            if cluster.name() != name {
                return Ok(false);
            }
        }

        if let Some(cluster_selector) = self.cluster_selector {
            let matched = selector::matches(cluster_selector, &cluster.labels())
                .context(BadSelectorSnafu {
                    target: self.label(),
                })?;
            if !matched {
                return Ok(false);
            }
        }

        if let Some(group_name) = self.cluster_group {
            let in_group = groups
                .iter()
                .filter(|group| group.name() == group_name)
                .map(|group| group_contains(group, cluster))
                .next()
                .transpose()
                .context(BadSelectorSnafu {
                    target: self.label(),
                })?
                .unwrap_or(false);
            if !in_group {
                return Ok(false);
            }
        }

        if let Some(group_selector) = self.cluster_group_selector {
            let mut in_any = false;
            for group in groups {
                let group_matches = selector::matches(group_selector, &group.labels())
                    .context(BadSelectorSnafu {
                        target: self.label(),
                    })?;
                if group_matches
                    && group_contains(group, cluster).context(BadSelectorSnafu {
                        target: self.label(),
                    })?
                {
                    in_any = true;
                    break;
                }
            }
            if !in_any {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn group_contains(group: &ClusterGroup, cluster: &Cluster) -> Result<bool, selector::Error> {
    match &group.spec.selector {
        Some(group_selector) => selector::matches(group_selector, &cluster.labels()),
        None => Ok(false),
    }
}

/// Whether the cluster may receive this bundle at all. An empty restriction
/// list leaves every cluster in the bundle's namespace eligible.
pub fn eligible(
    bundle: &Bundle,
    cluster: &Cluster,
    groups: &[ClusterGroup],
) -> Result<bool, Error> {
    if bundle.spec.target_restrictions.is_empty() {
        return Ok(true);
    }
    for restriction in &bundle.spec.target_restrictions {
        if Criteria::from(restriction).matches(cluster, groups)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The first target whose criteria match the cluster; source order is
/// priority.
pub fn select_target<'a>(
    bundle: &'a Bundle,
    cluster: &Cluster,
    groups: &[ClusterGroup],
) -> Result<Option<&'a BundleTarget>, Error> {
    for target in &bundle.spec.targets {
        if Criteria::from(target).matches(cluster, groups)? {
            return Ok(Some(target));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn cluster(name: &str, labels: &[(&str, &str)]) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                namespace: Some("fleet-default".into()),
                name: Some(name.into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn group(name: &str, match_labels: &[(&str, &str)]) -> ClusterGroup {
        ClusterGroup {
            metadata: ObjectMeta {
                namespace: Some("fleet-default".into()),
                name: Some(name.into()),
                ..Default::default()
            },
            spec: flotilla_core::crd::ClusterGroupSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(
                        match_labels
                            .iter()
                            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                            .collect::<BTreeMap<_, _>>(),
                    ),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    fn target_yaml(yaml: &str) -> BundleTarget {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn cluster_name_requires_exact_match() {
        let target = target_yaml("clusterName: c1");
        let criteria = Criteria::from(&target);
        assert!(criteria.matches(&cluster("c1", &[]), &[]).unwrap());
        assert!(!criteria.matches(&cluster("c2", &[]), &[]).unwrap());
    }

    #[test]
    fn cluster_selector_matches_labels() {
        let target = target_yaml("clusterSelector:\n  matchLabels:\n    env: prod");
        let criteria = Criteria::from(&target);
        assert!(
            criteria
                .matches(&cluster("c1", &[("env", "prod")]), &[])
                .unwrap()
        );
        assert!(
            !criteria
                .matches(&cluster("c1", &[("env", "dev")]), &[])
                .unwrap()
        );
    }

    #[test]
    fn cluster_group_membership() {
        let groups = vec![group("prod", &[("env", "prod")])];
        let target = target_yaml("clusterGroup: prod");
        let criteria = Criteria::from(&target);
        assert!(
            criteria
                .matches(&cluster("c1", &[("env", "prod")]), &groups)
                .unwrap()
        );
        assert!(
            !criteria
                .matches(&cluster("c1", &[("env", "dev")]), &groups)
                .unwrap()
        );
        // Unknown group matches nothing.
        let missing = target_yaml("clusterGroup: staging");
        assert!(
            !Criteria::from(&missing)
                .matches(&cluster("c1", &[("env", "prod")]), &groups)
                .unwrap()
        );
    }

    #[test]
    fn group_selector_unions_matching_groups() {
        let mut labeled = group("prod-eu", &[("region", "eu")]);
        labeled.metadata.labels = Some([("tier".to_string(), "prod".to_string())].into());
        let groups = vec![labeled, group("other", &[("region", "us")])];

        let target = target_yaml("clusterGroupSelector:\n  matchLabels:\n    tier: prod");
        let criteria = Criteria::from(&target);
        assert!(
            criteria
                .matches(&cluster("c1", &[("region", "eu")]), &groups)
                .unwrap()
        );
        assert!(
            !criteria
                .matches(&cluster("c2", &[("region", "us")]), &groups)
                .unwrap()
        );
    }

    #[test]
    fn criteria_are_anded() {
        let groups = vec![group("prod", &[("env", "prod")])];
        let target = target_yaml(indoc::indoc! {"
            clusterGroup: prod
            clusterSelector:
              matchLabels:
                region: eu
        "});
        let criteria = Criteria::from(&target);
        assert!(
            criteria
                .matches(&cluster("c1", &[("env", "prod"), ("region", "eu")]), &groups)
                .unwrap()
        );
        assert!(
            !criteria
                .matches(&cluster("c2", &[("env", "prod")]), &groups)
                .unwrap()
        );
    }

    #[test]
    fn empty_criteria_match_everything() {
        let target = target_yaml("{}");
        assert!(
            Criteria::from(&target)
                .matches(&cluster("anything", &[]), &[])
                .unwrap()
        );
    }

    #[test]
    fn empty_restrictions_leave_everyone_eligible() {
        let bundle = Bundle::default();
        assert!(eligible(&bundle, &cluster("c1", &[]), &[]).unwrap());
    }

    #[test]
    fn restrictions_whitelist() {
        let bundle: Bundle = serde_yaml::from_str(indoc::indoc! {"
            spec:
              targetRestrictions:
                - clusterName: c1
        "})
        .unwrap();
        assert!(eligible(&bundle, &cluster("c1", &[]), &[]).unwrap());
        assert!(!eligible(&bundle, &cluster("c2", &[]), &[]).unwrap());
    }

    #[test]
    fn first_matching_target_wins() {
        let bundle: Bundle = serde_yaml::from_str(indoc::indoc! {"
            spec:
              targets:
                - name: narrow
                  clusterName: c1
                - name: wide
        "})
        .unwrap();
        let selected = select_target(&bundle, &cluster("c1", &[]), &[])
            .unwrap()
            .unwrap();
        assert_eq!(selected.name.as_deref(), Some("narrow"));

        let selected = select_target(&bundle, &cluster("c2", &[]), &[])
            .unwrap()
            .unwrap();
        assert_eq!(selected.name.as_deref(), Some("wide"));
    }
}
