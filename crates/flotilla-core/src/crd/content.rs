//! Content-addressed manifest blob. Immutable and cluster-scoped; the name
//! is the manifest id, so BundleDeployments can reference it through the
//! first half of their deployment id.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::manifest::{BundleResource, Manifest};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<BundleResource>,

    /// Integrity digest over the stored resources.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256_sum: String,
}

super::impl_fleet_resource!(Content, "Content");

impl Content {
    /// Wraps a processed manifest under its content id.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self, crate::manifest::Error> {
        let id = manifest.id()?;
        Ok(Self {
            metadata: ObjectMeta {
                name: Some(id.clone()),
                ..Default::default()
            },
            resources: manifest.resources.clone(),
            sha256_sum: id,
        })
    }

    pub fn manifest(&self) -> Manifest {
        Manifest::new(self.resources.clone())
    }
}
