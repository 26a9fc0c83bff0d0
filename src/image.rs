use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::tarball::TarballImage;

/// An image enumerated from a registry or local tarball, or alternatively an
/// error that occurred while enumerating it. Errors travel in-band so the
/// enumeration stream itself never fails.
#[derive(Debug, Clone, Serialize)]
pub struct ImageMeta {
    pub reference: String,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    /// Canonical manifest JSON, re-serialized from the parsed form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Set for images backed by an already-extracted local tarball, so layer
    /// processing can read blobs without going back to the network.
    #[serde(skip)]
    pub layer_handle: Option<Arc<TarballImage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageMeta {
    pub fn new(registry: &str, repository: &str, tag: &str) -> Self {
        Self {
            reference: format!("{registry}/{repository}:{tag}"),
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
            manifest: None,
            config: None,
            layer_handle: None,
            error: None,
        }
    }

    pub fn from_error(error: anyhow::Error) -> Self {
        let mut meta = Self::new("", "", "");
        meta.reference = String::new();
        meta.error = Some(format!("{error:#}"));
        meta
    }
}

/// The subset of an OCI/Docker v2 manifest the pipeline cares about. Layer
/// order is merge order and must be preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
}

impl Manifest {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("parsing image manifest")
    }

    /// Deterministic serialization of the parsed manifest. Fingerprints are
    /// taken over this form so they are stable under key reordering in the
    /// registry's response.
    pub fn canonical_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing image manifest")
    }
}

/// Fingerprint used by the dedup index: hex SHA-256 of the canonical manifest.
/// Images without a manifest (error records) are never fingerprinted.
pub fn image_hash(image: &ImageMeta) -> Option<String> {
    image
        .manifest
        .as_ref()
        .map(|manifest| format!("{:x}", Sha256::digest(manifest.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_is_stable_under_key_reordering() {
        let a = r#"{
            "schemaVersion": 2,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:cfg", "size": 7},
            "layers": [{"digest": "sha256:abc", "size": 123, "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip"}]
        }"#;
        let b = r#"{
            "layers": [{"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:abc", "size": 123}],
            "config": {"size": 7, "digest": "sha256:cfg", "mediaType": "application/vnd.oci.image.config.v1+json"},
            "schemaVersion": 2
        }"#;

        let canonical_a = Manifest::parse(a).unwrap().canonical_json().unwrap();
        let canonical_b = Manifest::parse(b).unwrap().canonical_json().unwrap();
        assert_eq!(canonical_a, canonical_b);
    }

    #[test]
    fn test_image_hash_requires_manifest() {
        let mut image = ImageMeta::new("registry.example.com", "team/app", "v1");
        assert_eq!(image_hash(&image), None);

        image.manifest = Some(r#"{"layers": []}"#.to_string());
        let hash = image_hash(&image).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        // Same manifest, same fingerprint
        let mut other = ImageMeta::new("other.example.com", "team/app", "v2");
        other.manifest = image.manifest.clone();
        assert_eq!(image_hash(&other).unwrap(), hash);
    }

    #[test]
    fn test_layer_order_preserved() {
        let raw = r#"{"layers": [
            {"digest": "sha256:first", "size": 1, "mediaType": "t"},
            {"digest": "sha256:second", "size": 2, "mediaType": "t"},
            {"digest": "sha256:third", "size": 3, "mediaType": "t"}
        ]}"#;
        let manifest = Manifest::parse(raw).unwrap();
        let digests: Vec<&str> = manifest.layers.iter().map(|l| l.digest.as_str()).collect();
        assert_eq!(digests, vec!["sha256:first", "sha256:second", "sha256:third"]);
    }
}
