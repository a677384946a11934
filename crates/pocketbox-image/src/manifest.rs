//! OCI and Docker v2 manifest types.

use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::records::ImageConfig;
use serde::{Deserialize, Serialize};

/// Docker single-platform manifest.
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker multi-platform manifest list.
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI single-platform manifest.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Accept header sent on every manifest request.
pub const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json"
);

/// Returns `true` if the media type denotes a manifest list or image index.
#[must_use]
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type.contains("manifest.list") || media_type.contains("image.index")
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (should be 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: String,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, bottom to top.
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Sum of the compressed layer sizes.
    #[must_use]
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Multi-architecture manifest list or OCI index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    /// Schema version (should be 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: String,
    /// Platform-specific manifests.
    pub manifests: Vec<PlatformManifest>,
}

/// Platform-specific manifest entry in a manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformManifest {
    /// Media type of the referenced manifest.
    #[serde(default)]
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size.
    #[serde(default)]
    pub size: u64,
    /// Platform specification; attestation entries may omit it.
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// Platform specification for multi-arch images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Architecture variant (`v7`, `v8`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type.
    #[serde(default)]
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size.
    pub size: u64,
}

/// Image configuration blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfigBlob {
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// OS.
    #[serde(default)]
    pub os: String,
    /// Runtime defaults.
    #[serde(default)]
    pub config: Option<ContainerConfigSpec>,
}

impl ImageConfigBlob {
    /// Converts the runtime defaults into the persisted form.
    #[must_use]
    pub fn to_image_config(&self) -> ImageConfig {
        self.config
            .as_ref()
            .map(|c| ImageConfig {
                cmd: c.cmd.clone(),
                entrypoint: c.entrypoint.clone(),
                env: c.env.clone(),
                working_dir: c.working_dir.clone(),
                user: c.user.clone(),
            })
            .unwrap_or_default()
    }
}

/// Container configuration from image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfigSpec {
    /// User to run as.
    pub user: Option<String>,
    /// Environment variables.
    pub env: Option<Vec<String>>,
    /// Entrypoint.
    pub entrypoint: Option<Vec<String>>,
    /// Command.
    pub cmd: Option<Vec<String>>,
    /// Working directory.
    pub working_dir: Option<String>,
}

/// Picks the manifest for the target platform from a manifest list.
///
/// Selection order: exact architecture and OS match, then the first entry
/// with a matching OS, then the first entry.
///
/// # Errors
///
/// Returns [`PocketboxError::Integrity`] if the list is empty.
pub fn select_platform_manifest<'a>(
    list: &'a ManifestList,
    architecture: &str,
    os: &str,
) -> Result<&'a PlatformManifest> {
    let os_matches = |m: &&PlatformManifest| m.platform.as_ref().is_some_and(|p| p.os == os);
    list.manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == architecture)
        })
        .or_else(|| list.manifests.iter().find(os_matches))
        .or_else(|| list.manifests.first())
        .ok_or_else(|| PocketboxError::Integrity {
            message: "manifest list contains no manifests".into(),
        })
}
