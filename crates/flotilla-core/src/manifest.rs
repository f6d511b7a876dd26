//! Bundle resource blobs: decoding, patch overlays and content addressing.
//!
//! A manifest is the ordered list of `{name, content, encoding}` resources a
//! bundle carries. Before anything downstream sees it the manifest is
//! *processed*: every resource is decoded, `*_patch.*` overlays are folded
//! into their base resource, and the result is sorted by name. Processing is
//! idempotent, so the content id of a processed manifest is stable.

use std::io::Read;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use snafu::{OptionExt as _, ResultExt as _, Snafu};

/// Resource content encoding: no transformation applied.
pub const ENCODING_PLAIN: &str = "";
/// Resource content encoding: gzip compressed, then base64.
pub const ENCODING_BASE64_GZIP: &str = "base64+gzip";
/// Resource content encoding: base64 only.
pub const ENCODING_BASE64: &str = "base64";

const PATCH_MARKER: &str = "_patch";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("resource {name:?} has unsupported encoding {encoding:?}"))]
    BadEncoding { name: String, encoding: String },

    #[snafu(display("failed to base64-decode resource {name:?}"))]
    DecodeBase64 {
        source: base64::DecodeError,
        name: String,
    },

    #[snafu(display("failed to gunzip resource {name:?}"))]
    DecodeGzip {
        source: std::io::Error,
        name: String,
    },

    #[snafu(display("resource {name:?} is not valid UTF-8"))]
    DecodeUtf8 {
        source: std::string::FromUtf8Error,
        name: String,
    },

    #[snafu(display("patch {patch:?} has no base resource {base:?}"))]
    PatchTargetMissing { patch: String, base: String },

    #[snafu(display("failed to parse {name:?} for patching"))]
    PatchParse {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("patch {name:?} is not a valid RFC 6902 operation list"))]
    PatchOperations {
        source: serde_json::Error,
        name: String,
    },

    #[snafu(display("failed to apply patch {name:?}"))]
    PatchApply {
        source: json_patch::PatchError,
        name: String,
    },

    #[snafu(display("failed to serialize patched resource {name:?}"))]
    PatchSerialize {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("failed to serialize manifest content"))]
    Serialize { source: serde_json::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A single named blob inside a bundle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleResource {
    pub name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encoding: String,
}

impl BundleResource {
    pub fn plain(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            encoding: String::new(),
        }
    }

    /// Decodes the content according to the declared encoding.
    pub fn decode(&self) -> Result<Vec<u8>> {
        match self.encoding.as_str() {
            ENCODING_PLAIN | "plain" => Ok(self.content.clone().into_bytes()),
            ENCODING_BASE64 => BASE64
                .decode(self.content.as_bytes())
                .context(DecodeBase64Snafu { name: &self.name }),
            ENCODING_BASE64_GZIP => {
                let compressed = BASE64
                    .decode(self.content.as_bytes())
                    .context(DecodeBase64Snafu { name: &self.name })?;
                let mut decoder = GzDecoder::new(compressed.as_slice());
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .context(DecodeGzipSnafu { name: &self.name })?;
                Ok(out)
            }
            other => BadEncodingSnafu {
                name: &self.name,
                encoding: other,
            }
            .fail(),
        }
    }

    fn decode_utf8(&self) -> Result<String> {
        String::from_utf8(self.decode()?).context(DecodeUtf8Snafu { name: &self.name })
    }
}

/// The ordered resource list of a bundle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub resources: Vec<BundleResource>,
}

impl Manifest {
    pub fn new(resources: Vec<BundleResource>) -> Self {
        Self { resources }
    }

    /// Decodes every resource, folds `*_patch.*` overlays into their base
    /// resources, drops the patch entries and sorts by name.
    pub fn process(&self) -> Result<Self> {
        let mut bases: Vec<BundleResource> = Vec::new();
        let mut patches: Vec<(String, String, String)> = Vec::new();

        for resource in &self.resources {
            let content = resource.decode_utf8()?;
            match patch_base_name(&resource.name) {
                Some(base) => patches.push((resource.name.clone(), base, content)),
                None => bases.push(BundleResource::plain(&resource.name, content)),
            }
        }

        for (patch_name, base_name, patch_content) in patches {
            let base = bases
                .iter_mut()
                .find(|r| r.name == base_name)
                .context(PatchTargetMissingSnafu {
                    patch: &patch_name,
                    base: &base_name,
                })?;
            base.content = apply_overlay(base, &patch_name, &patch_content)?;
        }

        bases.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { resources: bases })
    }

    /// Content id of the manifest: hex SHA-256 over the serialized resource
    /// list. Stable for a processed manifest.
    pub fn id(&self) -> Result<String> {
        let serialized = serde_json::to_vec(&self.resources).context(SerializeSnafu)?;
        Ok(hex::encode(Sha256::digest(&serialized)))
    }
}

/// For `foo_patch.yaml` returns `foo.yaml`; `None` when the name is not a
/// patch.
fn patch_base_name(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    let base_stem = stem.strip_suffix(PATCH_MARKER)?;
    Some(format!("{base_stem}.{ext}"))
}

fn is_yaml(name: &str) -> bool {
    name.ends_with(".yaml") || name.ends_with(".yml")
}

/// Applies one overlay to a base resource and returns the new content.
///
/// YAML bases take an RFC 7386 merge patch. Other bases are JSON: a payload
/// starting with `[` is an RFC 6902 operation list, anything else a merge
/// patch.
fn apply_overlay(base: &BundleResource, patch_name: &str, patch_content: &str) -> Result<String> {
    let mut doc: serde_json::Value =
        serde_yaml::from_str(&base.content).context(PatchParseSnafu { name: &base.name })?;

    if is_yaml(&base.name) {
        let patch: serde_json::Value =
            serde_yaml::from_str(patch_content).context(PatchParseSnafu { name: patch_name })?;
        crate::patch::apply_merge_patch(&mut doc, &patch);
        serde_yaml::to_string(&doc).context(PatchSerializeSnafu { name: &base.name })
    } else if patch_content.trim_start().starts_with('[') {
        let operations: json_patch::Patch =
            serde_json::from_str(patch_content).context(PatchOperationsSnafu { name: patch_name })?;
        json_patch::patch(&mut doc, &operations).context(PatchApplySnafu { name: patch_name })?;
        serde_json::to_string(&doc).context(SerializeSnafu)
    } else {
        let patch: serde_json::Value =
            serde_yaml::from_str(patch_content).context(PatchParseSnafu { name: patch_name })?;
        crate::patch::apply_merge_patch(&mut doc, &patch);
        serde_json::to_string(&doc).context(SerializeSnafu)
    }
}

/// Compresses and base64-encodes content the way bundle packagers do.
pub fn encode_base64_gzip(content: &[u8]) -> Result<String, std::io::Error> {
    use std::io::Write as _;

    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(content)?;
    Ok(BASE64.encode(encoder.finish()?))
}
