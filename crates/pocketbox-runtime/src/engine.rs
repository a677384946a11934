//! Runtime engine that ties images, containers and processes together.
//!
//! The engine owns the metadata store, the layer store, the mirror manager
//! and the in-memory indexes. Containers are returned as [`Container`]
//! handles whose operations are serialized by their actor.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use pocketbox_common::config::EngineConfig;
use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::records::{ContainerOverrides, ContainerRecord, ImageRecord};
use pocketbox_common::store::{JsonStore, MetadataStore};
use pocketbox_common::types::{ContainerId, ContainerState, ImageId};
use pocketbox_image::client::ClientTimeouts;
use pocketbox_image::layer;
use pocketbox_image::{ImagePuller, ImageReference, LayerStore, MirrorManager, PullHandle};
use tokio::task::JoinHandle;

use crate::container::Container;
use crate::index::Index;
use crate::logs::{self, ContainerLogs};
use crate::names;
use crate::process::ProcessEntry;
use crate::sandbox::Sandbox;

/// State shared between the engine and every container actor.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) sandbox: Sandbox,
    pub(crate) containers: Index<ContainerId, Container>,
    pub(crate) processes: Index<u32, ProcessEntry>,
}

/// The runtime engine that coordinates all container and image operations.
pub struct Engine {
    shared: Arc<Shared>,
    layers: LayerStore,
    mirrors: Arc<MirrorManager>,
    puller: Arc<ImagePuller>,
    health_checks: JoinHandle<()>,
    create_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.shared.config.data_dir)
            .field("containers", &self.shared.containers.len())
            .field("processes", &self.shared.processes.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Opens the engine rooted at `config.data_dir`.
    ///
    /// Creates the directory layout, opens the JSON store, re-registers
    /// persisted containers and starts periodic mirror health checks.
    /// Containers that ran before come back as `Exited`, the others as
    /// `Created`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the data
    /// directory or store cannot be opened.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        for dir in [config.containers_dir(), config.logs_dir(), config.tmp_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| PocketboxError::io(&dir, e))?;
        }
        let store: Arc<dyn MetadataStore> = Arc::new(JsonStore::open(&config.db_dir())?);
        Self::with_store(config, store)
    }

    /// Opens the engine over an existing metadata store.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer store or HTTP clients cannot be set up.
    pub fn with_store(config: EngineConfig, store: Arc<dyn MetadataStore>) -> Result<Self> {
        let layers = LayerStore::open(config.layers_dir())?;
        let mirrors = Arc::new(MirrorManager::new(
            Arc::clone(&store),
            config.health_check_timeout(),
        )?);
        let puller = Arc::new(ImagePuller::new(
            Arc::clone(&store),
            layers.clone(),
            Arc::clone(&mirrors),
            ClientTimeouts {
                request: config.network_timeout(),
                download: config.download_timeout(),
            },
            config.architecture.clone(),
            config.os.clone(),
        ));
        let health_checks =
            Arc::clone(&mirrors).spawn_periodic_checks(config.mirror_check_interval());

        let shared = Arc::new(Shared {
            sandbox: Sandbox::discover(&config),
            config,
            store,
            containers: Index::new(),
            processes: Index::new(),
        });

        let records = shared.store.list_containers()?;
        let count = records.len();
        for record in records {
            let state = if record.last_run_at.is_some() {
                ContainerState::Exited { exit_code: None }
            } else {
                ContainerState::Created
            };
            let id = record.id.clone();
            let container = Container::spawn(record, state, Arc::clone(&shared));
            let _ = shared.containers.insert(id, container);
        }
        tracing::info!(
            data_dir = %shared.config.data_dir.display(),
            containers = count,
            "engine opened"
        );

        Ok(Self {
            shared,
            layers,
            mirrors,
            puller,
            health_checks,
            create_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Starts pulling `reference` in the background.
    pub fn pull_image(&self, reference: ImageReference) -> PullHandle {
        self.puller.pull(reference)
    }

    /// Creates a container from a local image.
    ///
    /// `overrides` are resolved against the image defaults, the image layers are
    /// unpacked into the container's private rootfs, and the record is
    /// persisted. Without an explicit `name` a unique one is generated.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::NotFound`] for an unknown image,
    /// [`PocketboxError::AlreadyExists`] for a taken name, and any error
    /// from rootfs assembly or the store.
    pub async fn create_container(
        &self,
        image_id: &ImageId,
        name: Option<&str>,
        overrides: ContainerOverrides,
    ) -> Result<Container> {
        let image = self
            .shared
            .store
            .get_image(image_id)?
            .ok_or_else(|| PocketboxError::NotFound {
                kind: "image",
                id: image_id.to_string(),
            })?;

        // Held until the record is indexed so two creates cannot pick the same name.
        let _guard = self.create_lock.lock().await;
        let name = match name {
            Some(name) if self.name_taken(name)? => {
                return Err(PocketboxError::AlreadyExists {
                    kind: "container",
                    id: name.to_string(),
                });
            }
            Some(name) => name.to_string(),
            None => loop {
                let candidate = names::generate_name();
                if !self.name_taken(&candidate)? {
                    break candidate;
                }
            },
        };

        let id = ContainerId::generate();
        let rootfs = self.shared.config.rootfs_dir(&id);
        let layers = self.layers.clone();
        let digests = image.layer_digests.clone();
        tokio::task::spawn_blocking(move || layer::assemble_rootfs(&layers, &digests, &rootfs))
            .await
            .map_err(|e| PocketboxError::Cancelled {
                operation: format!("rootfs assembly: {e}"),
            })??;

        let record = ContainerRecord {
            id: id.clone(),
            name,
            image_id: image.id.clone(),
            image_name: image.display_name(),
            config: overrides.resolve(&image.config),
            created_at: Utc::now(),
            last_run_at: None,
        };
        if let Err(e) = self.shared.store.put_container(&record) {
            let _ = std::fs::remove_dir_all(self.shared.config.container_dir(&id));
            return Err(e);
        }
        tracing::info!(
            id = %id,
            name = %record.name,
            image = %record.image_name,
            "container created"
        );

        let container =
            Container::spawn(record, ContainerState::Created, Arc::clone(&self.shared));
        let _ = self.shared.containers.insert(id, container.clone());
        Ok(container)
    }

    fn name_taken(&self, name: &str) -> Result<bool> {
        if self.shared.containers.find(|c| c.name() == name).is_some() {
            return Ok(true);
        }
        Ok(self.shared.store.find_container_by_name(name)?.is_some())
    }

    /// Looks a container up by id or name.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::NotFound`] if no container matches.
    pub fn container(&self, id_or_name: &str) -> Result<Container> {
        self.shared
            .containers
            .get(&ContainerId::new(id_or_name))
            .or_else(|| self.shared.containers.find(|c| c.name() == id_or_name))
            .ok_or_else(|| PocketboxError::NotFound {
                kind: "container",
                id: id_or_name.to_string(),
            })
    }

    /// All containers, oldest first.
    #[must_use]
    pub fn list_containers(&self) -> Vec<Container> {
        let mut containers = self.shared.containers.snapshot();
        containers.sort_by_key(|c| c.record().created_at);
        containers
    }

    /// All local images.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn list_images(&self) -> Result<Vec<ImageRecord>> {
        self.shared.store.list_images()
    }

    /// Deletes an image and every layer no other image references.
    ///
    /// Existing containers keep working: each owns a private rootfs copy.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::NotFound`] if the image does not exist.
    pub fn delete_image(&self, id: &ImageId) -> Result<()> {
        let image = self
            .shared
            .store
            .get_image(id)?
            .ok_or_else(|| PocketboxError::NotFound {
                kind: "image",
                id: id.to_string(),
            })?;
        let _ = self.shared.store.delete_image(id)?;

        let referenced: HashSet<String> = self
            .shared
            .store
            .list_images()?
            .into_iter()
            .flat_map(|i| i.layer_digests)
            .collect();
        let mut removed = 0_usize;
        for digest in image.layer_digests.iter().filter(|d| !referenced.contains(*d)) {
            self.layers.remove_layer(digest)?;
            let _ = self.shared.store.delete_layer(digest)?;
            removed += 1;
        }
        tracing::info!(id = %id, layers_removed = removed, "image deleted");
        Ok(())
    }

    /// The registry mirror manager.
    #[must_use]
    pub fn mirrors(&self) -> &MirrorManager {
        &self.mirrors
    }

    /// Captured output of a container's main process.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::NotFound`] for an unknown container.
    pub fn logs(&self, id_or_name: &str) -> Result<ContainerLogs> {
        let container = self.container(id_or_name)?;
        logs::read_logs(&self.shared.config.logs_dir(), container.id())
    }

    /// Snapshot of every live process across containers.
    #[must_use]
    pub fn processes(&self) -> Vec<ProcessEntry> {
        self.shared.processes.snapshot()
    }

    /// Version of the sandbox binary.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Spawn`] if proot is unavailable.
    pub async fn sandbox_version(&self) -> Result<String> {
        self.shared.sandbox.probe_version().await
    }

    /// Stops background health checks and every running container.
    pub async fn shutdown(&self) {
        self.health_checks.abort();
        let running = self
            .shared
            .containers
            .snapshot()
            .into_iter()
            .filter(|c| c.state() == ContainerState::Running);
        let results = futures::future::join_all(running.map(|c| async move {
            let id = c.id().clone();
            (id, c.stop().await)
        }))
        .await;
        for (id, result) in results {
            if let Err(e) = result {
                tracing::warn!(id = %id, error = %e, "failed to stop container on shutdown");
            }
        }
        tracing::info!("engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.health_checks.abort();
        // Actors hold the shared state, so the index must let go of their
        // handles for idle actors to finish.
        drop(self.shared.containers.drain());
    }
}
