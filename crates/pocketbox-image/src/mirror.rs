//! Registry mirror selection and health checking.
//!
//! The candidate set is the built-in mirrors plus user-added ones persisted
//! in the metadata store. Health is kept in memory only and re-derived by
//! probing `GET {url}/v2/`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pocketbox_common::constants::{
    BUILT_IN_MIRROR_PRIORITY, CUSTOM_MIRROR_PRIORITY, DEFAULT_REGISTRY_URL, USER_AGENT,
};
use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::records::RegistryMirror;
use pocketbox_common::store::MetadataStore;
use reqwest::Client;
use tokio::task::JoinHandle;

use crate::client::Endpoint;
use crate::reference::ImageReference;

/// Outcome of one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorHealth {
    /// Whether the mirror answered with an acceptable status.
    pub healthy: bool,
    /// Round-trip latency, recorded for healthy results only.
    pub latency_ms: Option<u64>,
    /// When the probe finished.
    pub checked_at: DateTime<Utc>,
}

/// Returns `true` for statuses that prove a registry is reachable.
///
/// `401` and `403` count as healthy: the registry is up and merely wants a
/// token.
#[must_use]
pub const fn classify_status(status: u16) -> bool {
    matches!(status, 200 | 401 | 403)
}

/// The mirrors shipped with the engine.
#[must_use]
pub fn built_in_mirrors() -> Vec<RegistryMirror> {
    [
        ("Docker Hub", DEFAULT_REGISTRY_URL),
        ("DaoCloud", "https://docker.m.daocloud.io"),
    ]
    .into_iter()
    .map(|(name, url)| RegistryMirror {
        is_built_in: true,
        ..RegistryMirror::new(name, url, BUILT_IN_MIRROR_PRIORITY)
    })
    .collect()
}

/// Maintains candidate registry endpoints and picks the best one.
pub struct MirrorManager {
    store: Arc<dyn MetadataStore>,
    built_ins: Vec<RegistryMirror>,
    health: Mutex<HashMap<String, MirrorHealth>>,
    http: Client,
    timeout: Duration,
}

impl std::fmt::Debug for MirrorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorManager")
            .field("built_ins", &self.built_ins.len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl MirrorManager {
    /// Creates a manager with the default built-in mirrors.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Network`] if the HTTP client cannot be built.
    pub fn new(store: Arc<dyn MetadataStore>, timeout: Duration) -> Result<Self> {
        Self::with_built_ins(store, built_in_mirrors(), timeout)
    }

    /// Creates a manager with an explicit set of built-in mirrors.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Network`] if the HTTP client cannot be built.
    pub fn with_built_ins(
        store: Arc<dyn MetadataStore>,
        built_ins: Vec<RegistryMirror>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| PocketboxError::Network {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        let built_ins = built_ins
            .into_iter()
            .map(|m| RegistryMirror {
                is_built_in: true,
                ..m
            })
            .collect();
        Ok(Self {
            store,
            built_ins,
            health: Mutex::new(HashMap::new()),
            http,
            timeout,
        })
    }

    fn health(&self) -> MutexGuard<'_, HashMap<String, MirrorHealth>> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lists built-in and custom mirrors with their last known health,
    /// highest priority first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn list(&self) -> Result<Vec<RegistryMirror>> {
        let mut mirrors = self.built_ins.clone();
        mirrors.extend(self.store.list_mirrors()?.into_iter().map(|m| RegistryMirror {
            is_built_in: false,
            ..m
        }));

        let health = self.health();
        for mirror in &mut mirrors {
            let known = health.get(&mirror.name);
            mirror.is_healthy = known.is_some_and(|h| h.healthy);
            mirror.latency_ms = known.and_then(|h| h.latency_ms);
        }
        drop(health);

        mirrors.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(mirrors)
    }

    /// Adds a custom mirror. Priority defaults to 50.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Config`] for a non-HTTP URL and
    /// [`PocketboxError::AlreadyExists`] if the name is taken.
    pub fn add_custom(
        &self,
        name: &str,
        url: &str,
        bearer_token: Option<String>,
        priority: Option<i32>,
    ) -> Result<RegistryMirror> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PocketboxError::Config {
                message: "mirror name must not be empty".into(),
            });
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(PocketboxError::Config {
                message: format!("mirror URL must start with http:// or https://: {url}"),
            });
        }
        if self.list()?.iter().any(|m| m.name == name) {
            return Err(PocketboxError::AlreadyExists {
                kind: "mirror",
                id: name.to_string(),
            });
        }

        let mirror = RegistryMirror {
            bearer_token: bearer_token.filter(|t| !t.is_empty()),
            ..RegistryMirror::new(name, url, priority.unwrap_or(CUSTOM_MIRROR_PRIORITY))
        };
        self.store.put_mirror(&mirror)?;
        tracing::info!(name = %mirror.name, url = %mirror.url, "custom mirror added");
        Ok(mirror)
    }

    /// Removes a custom mirror.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Config`] for built-in mirrors and
    /// [`PocketboxError::NotFound`] for unknown names.
    pub fn remove(&self, name: &str) -> Result<()> {
        if self.built_ins.iter().any(|m| m.name == name) {
            return Err(PocketboxError::Config {
                message: format!("built-in mirror '{name}' cannot be removed"),
            });
        }
        if !self.store.delete_mirror(name)? {
            return Err(PocketboxError::NotFound {
                kind: "mirror",
                id: name.to_string(),
            });
        }
        let _ = self.health().remove(name);
        tracing::info!(name, "custom mirror removed");
        Ok(())
    }

    /// Probes one mirror and records the result.
    ///
    /// Never fails: DNS errors, refused connections, and timeouts all yield
    /// an unhealthy result within the configured timeout.
    pub async fn check(&self, mirror: &RegistryMirror) -> MirrorHealth {
        let url = format!("{}/v2/", mirror.url);
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.http.get(&url).send()).await;

        let health = match outcome {
            Ok(Ok(response)) if classify_status(response.status().as_u16()) => MirrorHealth {
                healthy: true,
                latency_ms: Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)),
                checked_at: Utc::now(),
            },
            Ok(Ok(response)) => {
                tracing::debug!(
                    mirror = %mirror.name,
                    status = %response.status(),
                    "mirror unhealthy"
                );
                unhealthy()
            }
            Ok(Err(e)) => {
                tracing::debug!(mirror = %mirror.name, error = %e, "mirror unreachable");
                unhealthy()
            }
            Err(_) => {
                tracing::debug!(mirror = %mirror.name, "mirror health check timed out");
                unhealthy()
            }
        };

        let _ = self.health().insert(mirror.name.clone(), health);
        health
    }

    /// Probes every mirror concurrently and returns the refreshed list.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn check_all(&self) -> Result<Vec<RegistryMirror>> {
        let mirrors = self.list()?;
        let _ = futures::future::join_all(mirrors.iter().map(|m| self.check(m))).await;
        let mirrors = self.list()?;
        let healthy = mirrors.iter().filter(|m| m.is_healthy).count();
        tracing::info!(total = mirrors.len(), healthy, "mirror health check finished");
        Ok(mirrors)
    }

    /// Returns the lowest-latency healthy mirror, ties broken by priority.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::NoMirrorAvailable`] if no mirror is healthy.
    pub fn best(&self) -> Result<RegistryMirror> {
        self.list()?
            .into_iter()
            .filter(|m| m.is_healthy)
            .min_by(|a, b| {
                a.latency_ms
                    .unwrap_or(u64::MAX)
                    .cmp(&b.latency_ms.unwrap_or(u64::MAX))
                    .then_with(|| b.priority.cmp(&a.priority))
            })
            .ok_or(PocketboxError::NoMirrorAvailable)
    }

    /// Picks the endpoint to pull `reference` from.
    ///
    /// Docker Hub images go through the best mirror (running a health check
    /// first if none has ever been run); other registries are contacted
    /// directly.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::NoMirrorAvailable`] if no mirror is healthy.
    pub async fn resolve(&self, reference: &ImageReference) -> Result<Endpoint> {
        if !reference.is_docker_hub() {
            return Ok(Endpoint::new(reference.registry_url()));
        }
        if self.health().is_empty() {
            let _ = self.check_all().await?;
        }
        let mirror = self.best()?;
        tracing::debug!(mirror = %mirror.name, url = %mirror.url, "selected mirror");
        Ok(Endpoint {
            url: mirror.url,
            bearer_token: mirror.bearer_token,
        })
    }

    /// Spawns a task re-checking every mirror at `interval`. The first check
    /// runs one interval from now; until then [`Self::resolve`] checks on
    /// demand.
    pub fn spawn_periodic_checks(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let _ = ticker.tick().await;
                if let Err(e) = self.check_all().await {
                    tracing::warn!(error = %e, "periodic mirror check failed");
                }
            }
        })
    }
}

fn unhealthy() -> MirrorHealth {
    MirrorHealth {
        healthy: false,
        latency_ms: None,
        checked_at: Utc::now(),
    }
}
