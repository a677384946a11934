//! Persisted records for containers, images, layers, mirrors, and tokens.
//!
//! These are the rows stored behind [`crate::store::MetadataStore`]. They are
//! plain data: behaviour lives in the image and runtime crates.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::types::{ContainerId, ImageId};

/// A host directory exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    /// Path on the host.
    pub host_path: PathBuf,
    /// Mount point inside the container.
    pub container_path: String,
    /// Whether the bind is read-only.
    #[serde(default)]
    pub read_only: bool,
}

impl Bind {
    /// Renders the bind as a sandbox argument (`host:container[:ro]`).
    #[must_use]
    pub fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Runtime configuration of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Command arguments appended after the entrypoint.
    pub cmd: Vec<String>,
    /// Entrypoint; empty means "run `cmd` directly".
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Environment variables exported into the sandbox.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory inside the rootfs.
    pub working_dir: String,
    /// Hostname reported to processes.
    pub hostname: String,
    /// User name reported to processes.
    pub user: String,
    /// Host directories exposed inside the container.
    #[serde(default)]
    pub binds: Vec<Bind>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            cmd: vec![constants::DEFAULT_SHELL.to_string()],
            entrypoint: Vec::new(),
            env: BTreeMap::new(),
            working_dir: "/".to_string(),
            hostname: "localhost".to_string(),
            user: "root".to_string(),
            binds: Vec::new(),
        }
    }
}

/// Caller choices for a new container.
///
/// `None` means "not chosen": the image value fills it in, then the engine
/// default. A value equal to the default is still an explicit choice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOverrides {
    /// Command replacing the image `cmd`.
    pub cmd: Option<Vec<String>>,
    /// Entrypoint replacing the image entrypoint. Also drops the image `cmd`.
    pub entrypoint: Option<Vec<String>>,
    /// Variables layered over the image environment.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Hostname.
    pub hostname: Option<String>,
    /// User name.
    pub user: Option<String>,
    /// Host directories exposed inside the container.
    pub binds: Vec<Bind>,
}

impl ContainerOverrides {
    /// Resolves the overrides against an image config.
    ///
    /// Chosen values always win. Image environment entries form the base
    /// and caller entries override them key by key.
    #[must_use]
    pub fn resolve(self, image: &ImageConfig) -> ContainerConfig {
        let defaults = ContainerConfig::default();

        let cmd = match (self.cmd, &self.entrypoint) {
            (Some(cmd), _) => cmd,
            (None, Some(_)) => Vec::new(),
            (None, None) => image.cmd.clone().unwrap_or_default(),
        };
        let entrypoint = self
            .entrypoint
            .or_else(|| image.entrypoint.clone())
            .unwrap_or_default();

        let mut env: BTreeMap<String, String> = image
            .env
            .iter()
            .flatten()
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut caller_env = self.env;
        env.append(&mut caller_env);

        ContainerConfig {
            cmd,
            entrypoint,
            env,
            working_dir: self
                .working_dir
                .or_else(|| non_empty(image.working_dir.as_ref()))
                .unwrap_or(defaults.working_dir),
            hostname: self.hostname.unwrap_or(defaults.hostname),
            user: self
                .user
                .or_else(|| non_empty(image.user.as_ref()))
                .unwrap_or(defaults.user),
            binds: self.binds,
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

impl ContainerConfig {
    /// Returns the full command line: entrypoint followed by cmd, or the shell.
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        let command: Vec<String> = self
            .entrypoint
            .iter()
            .chain(self.cmd.iter())
            .cloned()
            .collect();
        if command.is_empty() {
            vec![constants::DEFAULT_SHELL.to_string()]
        } else {
            command
        }
    }
}

/// A persisted container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Unique identifier (UUID).
    pub id: ContainerId,
    /// Unique human-readable name.
    pub name: String,
    /// Image the container was created from.
    pub image_id: ImageId,
    /// Display name of the image (`repo:tag`).
    pub image_name: String,
    /// Runtime configuration.
    pub config: ContainerConfig,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time the container entered the running state.
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Runtime defaults carried by an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Default command.
    pub cmd: Option<Vec<String>>,
    /// Default entrypoint.
    pub entrypoint: Option<Vec<String>>,
    /// Default environment as `KEY=VALUE` entries.
    pub env: Option<Vec<String>>,
    /// Default working directory.
    pub working_dir: Option<String>,
    /// Default user.
    pub user: Option<String>,
}

/// A locally available image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Hex part of the config digest.
    pub id: ImageId,
    /// Registry host the image was pulled from.
    pub registry: String,
    /// Repository path.
    pub repository: String,
    /// Tag.
    pub tag: String,
    /// CPU architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Sum of compressed layer sizes in bytes.
    pub size: u64,
    /// Layer digests, bottom to top.
    pub layer_digests: Vec<String>,
    /// Pull completion timestamp.
    pub created_at: DateTime<Utc>,
    /// Runtime defaults.
    pub config: ImageConfig,
}

impl ImageRecord {
    /// Display name of the image (`repo:tag`, without `library/`).
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.registry == constants::DOCKER_HUB_REGISTRY {
            let repository = self
                .repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository);
            format!("{repository}:{}", self.tag)
        } else {
            format!("{}/{}:{}", self.registry, self.repository, self.tag)
        }
    }
}

/// A content-addressed layer archive shared across images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Digest (`sha256:<hex>`).
    pub digest: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// Media type from the manifest.
    pub media_type: String,
    /// Whether the archive has been fully downloaded and verified.
    pub downloaded: bool,
}

/// A candidate registry endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryMirror {
    /// Unique name.
    pub name: String,
    /// Base URL, without trailing slash.
    pub url: String,
    /// Preconfigured bearer token, used instead of the challenge flow.
    pub bearer_token: Option<String>,
    /// Tie-break priority; higher wins.
    pub priority: i32,
    /// Whether the mirror ships with the engine.
    pub is_built_in: bool,
    /// Result of the last health check.
    #[serde(skip)]
    pub is_healthy: bool,
    /// Latency of the last healthy check in milliseconds.
    #[serde(skip)]
    pub latency_ms: Option<u64>,
}

impl RegistryMirror {
    /// Creates a mirror with unknown health.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            url: url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            priority,
            is_built_in: false,
            is_healthy: false,
            latency_ms: None,
        }
    }
}

/// A cached registry bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Exact token URL the token was issued for.
    pub auth_url: String,
    /// Bearer token.
    pub token: String,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    /// Returns `true` if the token is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_config() -> ImageConfig {
        ImageConfig {
            cmd: Some(vec!["nginx".into(), "-g".into(), "daemon off;".into()]),
            entrypoint: Some(vec!["/docker-entrypoint.sh".into()]),
            env: Some(vec!["PATH=/usr/bin".into(), "NGINX_VERSION=1.25".into()]),
            working_dir: Some("/srv".into()),
            user: Some("nginx".into()),
        }
    }

    #[test]
    fn resolve_fills_unset_fields_from_image() {
        let config = ContainerOverrides::default().resolve(&image_config());
        assert_eq!(config.cmd, vec!["nginx", "-g", "daemon off;"]);
        assert_eq!(config.entrypoint, vec!["/docker-entrypoint.sh"]);
        assert_eq!(config.working_dir, "/srv");
        assert_eq!(config.user, "nginx");
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.env.get("NGINX_VERSION").map(String::as_str), Some("1.25"));
    }

    #[test]
    fn resolve_keeps_caller_values() {
        let mut overrides = ContainerOverrides {
            cmd: Some(vec!["echo".into(), "hi".into()]),
            working_dir: Some("/tmp".into()),
            user: Some("alice".into()),
            ..ContainerOverrides::default()
        };
        let _ = overrides.env.insert("PATH".into(), "/custom".into());

        let config = overrides.resolve(&image_config());
        assert_eq!(config.cmd, vec!["echo", "hi"]);
        assert_eq!(config.working_dir, "/tmp");
        assert_eq!(config.user, "alice");
        assert_eq!(config.env.get("PATH").map(String::as_str), Some("/custom"));
        assert_eq!(config.env.len(), 2);
    }

    #[test]
    fn resolve_keeps_caller_values_equal_to_defaults() {
        let overrides = ContainerOverrides {
            cmd: Some(vec!["/bin/sh".into()]),
            working_dir: Some("/".into()),
            user: Some("root".into()),
            ..ContainerOverrides::default()
        };
        let config = overrides.resolve(&image_config());
        assert_eq!(config.cmd, vec!["/bin/sh"]);
        assert_eq!(config.working_dir, "/");
        assert_eq!(config.user, "root");
    }

    #[test]
    fn resolve_with_entrypoint_override_drops_image_cmd() {
        let overrides = ContainerOverrides {
            entrypoint: Some(vec!["/bin/date".into()]),
            ..ContainerOverrides::default()
        };
        let config = overrides.resolve(&image_config());
        assert_eq!(config.command_line(), vec!["/bin/date"]);
    }

    #[test]
    fn resolve_with_entrypoint_only_image() {
        let image = ImageConfig {
            entrypoint: Some(vec!["/app".into()]),
            ..ImageConfig::default()
        };
        let config = ContainerOverrides::default().resolve(&image);
        assert_eq!(config.command_line(), vec!["/app"]);
    }

    #[test]
    fn resolve_without_image_defaults_runs_the_shell() {
        let config = ContainerOverrides::default().resolve(&ImageConfig::default());
        assert_eq!(config.command_line(), vec!["/bin/sh"]);
        assert_eq!(config.working_dir, "/");
        assert_eq!(config.user, "root");
    }

    #[test]
    fn command_line_falls_back_to_shell() {
        let config = ContainerConfig {
            cmd: Vec::new(),
            ..ContainerConfig::default()
        };
        assert_eq!(config.command_line(), vec!["/bin/sh"]);
    }

    #[test]
    fn bind_arg_marks_read_only() {
        let bind = Bind {
            host_path: PathBuf::from("/data"),
            container_path: "/mnt".into(),
            read_only: true,
        };
        assert_eq!(bind.to_arg(), "/data:/mnt:ro");
    }

    #[test]
    fn display_name_hides_default_registry() {
        let record = ImageRecord {
            id: ImageId::new("abc"),
            registry: "docker.io".into(),
            repository: "library/alpine".into(),
            tag: "3.19".into(),
            architecture: "arm64".into(),
            os: "linux".into(),
            size: 0,
            layer_digests: Vec::new(),
            created_at: Utc::now(),
            config: ImageConfig::default(),
        };
        assert_eq!(record.display_name(), "alpine:3.19");
    }

    #[test]
    fn mirror_url_trailing_slash_is_trimmed() {
        let mirror = RegistryMirror::new("corp", "https://mirror.example.com/", 50);
        assert_eq!(mirror.url, "https://mirror.example.com");
    }
}
