//! In-process evaluation of Kubernetes label selectors.
//!
//! The store is local, so instead of rendering selectors to API query
//! strings we evaluate them directly against an object's labels. The
//! operator vocabulary and validity rules match the API server's:
//! `In`/`NotIn` need values, `Exists`/`DoesNotExist` must not have any.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use snafu::Snafu;

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("label selector has no or empty values for [{operator}] operator"))]
    MissingValues { operator: String },

    #[snafu(display("label selector has [{operator}] operator with values, this is not legal"))]
    UnexpectedValues { operator: String },

    #[snafu(display("label selector has illegal/unknown operator [{operator}]"))]
    UnknownOperator { operator: String },
}

/// Evaluates `selector` against `labels`. An empty selector matches
/// everything.
pub fn matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    if let Some(requirements) = &selector.match_expressions {
        for requirement in requirements {
            let values = requirement.values.as_deref().unwrap_or_default();
            let actual = labels.get(&requirement.key);

            let matched = match requirement.operator.as_str() {
                operator @ ("In" | "NotIn") => {
                    if values.is_empty() {
                        return MissingValuesSnafu { operator }.fail();
                    }
                    let contained =
                        actual.is_some_and(|actual| values.iter().any(|v| v == actual));
                    if requirement.operator == "In" {
                        contained
                    } else {
                        !contained
                    }
                }
                operator @ ("Exists" | "DoesNotExist") => {
                    if !values.is_empty() {
                        return UnexpectedValuesSnafu { operator }.fail();
                    }
                    if requirement.operator == "Exists" {
                        actual.is_some()
                    } else {
                        actual.is_none()
                    }
                }
                operator => {
                    return UnknownOperatorSnafu { operator }.fail();
                }
            };

            if !matched {
                return Ok(false);
            }
        }
    }

    Ok(true)
}
