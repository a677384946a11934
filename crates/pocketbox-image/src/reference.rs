//! Image reference parsing (`registry/repository:tag`).

use std::fmt;
use std::str::FromStr;

use pocketbox_common::constants::{DEFAULT_REGISTRY_URL, DEFAULT_TAG, DOCKER_HUB_REGISTRY};
use pocketbox_common::error::{PocketboxError, Result};
use serde::{Deserialize, Serialize};

/// A parsed image reference such as `docker.io/library/nginx:1.25`.
///
/// The canonical display form omits the Docker Hub registry and its
/// `library/` prefix but always includes the tag, so `alpine` displays as
/// `alpine:latest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    /// Registry host (e.g. `docker.io`, `ghcr.io`, `localhost:5000`).
    pub registry: String,
    /// Repository path (e.g. `library/nginx`).
    pub repository: String,
    /// Tag, or a `sha256:` digest when the reference was pinned with `@`.
    pub tag: String,
}

impl ImageReference {
    /// Parses an image reference string.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Config`] if the reference is empty or has an
    /// empty repository or tag.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |why: &str| PocketboxError::Config {
            message: format!("invalid image reference '{s}': {why}"),
        };
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty"));
        }

        let (registry, rest) = match s.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first, rest)
            }
            _ => (DOCKER_HUB_REGISTRY, s),
        };

        let (repository, tag) = if let Some((repo, digest)) = rest.split_once('@') {
            (repo, digest)
        } else {
            let last_slash = rest.rfind('/').map_or(0, |i| i + 1);
            match rest[last_slash..].rfind(':') {
                Some(i) => (&rest[..last_slash + i], &rest[last_slash + i + 1..]),
                None => (rest, DEFAULT_TAG),
            }
        };
        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }
        if tag.is_empty() {
            return Err(invalid("missing tag"));
        }

        let repository = if is_docker_hub(registry) && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_string()
        };

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag: tag.to_string(),
        })
    }

    /// Returns `true` if the image lives on Docker Hub.
    #[must_use]
    pub fn is_docker_hub(&self) -> bool {
        is_docker_hub(&self.registry)
    }

    /// Returns `true` if the reference pins a digest instead of a tag.
    #[must_use]
    pub fn is_digest(&self) -> bool {
        self.tag.starts_with("sha256:")
    }

    /// Base URL of the registry API for this reference.
    #[must_use]
    pub fn registry_url(&self) -> String {
        if self.is_docker_hub() {
            DEFAULT_REGISTRY_URL.to_string()
        } else if self.registry.starts_with("http://") || self.registry.starts_with("https://") {
            self.registry.clone()
        } else if is_loopback(&self.registry) {
            format!("http://{}", self.registry)
        } else {
            format!("https://{}", self.registry)
        }
    }

    /// Returns the same repository pointed at another tag or digest.
    #[must_use]
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..self.clone()
        }
    }

    /// Returns the full name including registry and `library/` prefix.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}{}{}", self.registry, self.repository, self.separator(), self.tag)
    }

    fn separator(&self) -> char {
        if self.is_digest() { '@' } else { ':' }
    }
}

/// Loopback registries are spoken to over plain HTTP, like Docker does.
fn is_loopback(registry: &str) -> bool {
    let host = registry.rsplit_once(':').map_or(registry, |(host, _)| host);
    matches!(host, "localhost" | "127.0.0.1" | "[::1]")
}

fn is_docker_hub(registry: &str) -> bool {
    registry == DOCKER_HUB_REGISTRY || registry.ends_with(".docker.io")
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.registry == DOCKER_HUB_REGISTRY {
            let repository = self
                .repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository);
            write!(f, "{repository}{}{}", self.separator(), self.tag)
        } else {
            write!(
                f,
                "{}/{}{}{}",
                self.registry,
                self.repository,
                self.separator(),
                self.tag
            )
        }
    }
}

impl FromStr for ImageReference {
    type Err = PocketboxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
