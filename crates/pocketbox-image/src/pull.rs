//! Image pulling from container registries.
//!
//! Implements the complete pull workflow on a background task:
//! 1. Resolve the endpoint (mirror or registry) and the platform manifest
//! 2. Fetch the config blob
//! 3. Download each layer in manifest order, skipping cached ones
//! 4. Persist layer records, then the image record
//!
//! Progress is reported as a stream of [`PullProgress`] events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use pocketbox_common::error::{PocketboxError, Result};
use pocketbox_common::records::{ImageRecord, LayerRecord};
use pocketbox_common::store::MetadataStore;
use pocketbox_common::types::{ImageId, Sha256Hash};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::TokenCache;
use crate::client::{ClientTimeouts, RegistryClient};
use crate::hash;
use crate::manifest::Descriptor;
use crate::mirror::MirrorManager;
use crate::reference::ImageReference;
use crate::storage::LayerStore;

/// Unit id of the manifest step.
pub const UNIT_MANIFEST: &str = "manifest";
/// Unit id of the config step.
pub const UNIT_CONFIG: &str = "config";
/// Unit id of the final image step.
pub const UNIT_IMAGE: &str = "image";

/// Status of one progress unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PullStatus {
    /// Queued behind earlier layers.
    Waiting,
    /// Bytes are being received.
    Downloading,
    /// Finished (downloaded or found in cache).
    Done,
    /// The pull failed.
    Error,
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullProgress {
    /// `manifest`, `config`, a layer digest, or `image`.
    pub unit_id: String,
    /// Bytes received so far.
    pub downloaded: u64,
    /// Expected bytes.
    pub total: u64,
    /// Current status.
    pub status: PullStatus,
    /// Cause of the failure for [`PullStatus::Error`].
    pub error: Option<String>,
}

impl PullProgress {
    fn new(unit_id: impl Into<String>, status: PullStatus, downloaded: u64, total: u64) -> Self {
        Self {
            unit_id: unit_id.into(),
            downloaded,
            total,
            status,
            error: None,
        }
    }
}

/// A running pull: a progress stream plus the task producing it.
#[derive(Debug)]
pub struct PullHandle {
    events: mpsc::UnboundedReceiver<PullProgress>,
    task: JoinHandle<Result<ImageRecord>>,
}

impl PullHandle {
    /// Receives the next progress event, or `None` once the pull ended.
    pub async fn next(&mut self) -> Option<PullProgress> {
        self.events.recv().await
    }

    /// Aborts the pull. Layers already persisted are kept.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Waits for the pull to end and returns the image record.
    ///
    /// # Errors
    ///
    /// Returns the pull's error, or [`PocketboxError::Cancelled`] if the pull
    /// was cancelled.
    pub async fn finish(self) -> Result<ImageRecord> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(PocketboxError::Cancelled {
                operation: "image pull".into(),
            }),
            Err(e) => Err(PocketboxError::Cancelled {
                operation: format!("image pull aborted: {e}"),
            }),
        }
    }
}

type Progress = mpsc::UnboundedSender<PullProgress>;

/// Image puller with progress reporting.
pub struct ImagePuller {
    store: Arc<dyn MetadataStore>,
    layers: LayerStore,
    mirrors: Arc<MirrorManager>,
    tokens: TokenCache,
    timeouts: ClientTimeouts,
    architecture: String,
    os: String,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for ImagePuller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePuller")
            .field("layers", &self.layers)
            .field("architecture", &self.architecture)
            .field("os", &self.os)
            .finish_non_exhaustive()
    }
}

impl ImagePuller {
    /// Creates a puller targeting `architecture`/`os`.
    #[must_use]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        layers: LayerStore,
        mirrors: Arc<MirrorManager>,
        timeouts: ClientTimeouts,
        architecture: impl Into<String>,
        os: impl Into<String>,
    ) -> Self {
        Self {
            tokens: TokenCache::new(Arc::clone(&store)),
            store,
            layers,
            mirrors,
            timeouts,
            architecture: architecture.into(),
            os: os.into(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Starts pulling `reference` on a background task.
    ///
    /// Any failure ends the stream with a single [`PullStatus::Error`] event
    /// for the `image` unit and triggers a background mirror re-check.
    pub fn pull(self: &Arc<Self>, reference: ImageReference) -> PullHandle {
        let (tx, events) = mpsc::unbounded_channel();
        let puller = Arc::clone(self);
        let task = tokio::spawn(async move {
            tracing::info!(reference = %reference, "pulling image");
            let result = puller.run(&reference, &tx).await;
            match &result {
                Ok(image) => {
                    tracing::info!(reference = %reference, id = %image.id, "image pulled");
                }
                Err(e) => {
                    tracing::warn!(reference = %reference, error = %e, "image pull failed");
                    let _ = tx.send(PullProgress {
                        error: Some(e.to_string()),
                        ..PullProgress::new(UNIT_IMAGE, PullStatus::Error, 0, 0)
                    });
                    let mirrors = Arc::clone(&puller.mirrors);
                    drop(tokio::spawn(async move {
                        if let Err(e) = mirrors.check_all().await {
                            tracing::warn!(error = %e, "mirror re-check failed");
                        }
                    }));
                }
            }
            result
        });
        PullHandle { events, task }
    }

    async fn run(&self, reference: &ImageReference, tx: &Progress) -> Result<ImageRecord> {
        let endpoint = self.mirrors.resolve(reference).await?;
        tracing::debug!(endpoint = %endpoint.url, "pulling from endpoint");
        let client = RegistryClient::new(
            endpoint,
            self.tokens.clone(),
            self.timeouts,
            self.architecture.clone(),
            self.os.clone(),
        )?;

        let manifest = client.get_manifest(reference).await?;
        let _ = tx.send(PullProgress::new(UNIT_MANIFEST, PullStatus::Done, 0, 0));

        let id = ImageId::from_digest(&manifest.config.digest);
        if let Some(existing) = self.store.get_image(&id)? {
            tracing::info!(id = %id, "image already exists locally");
            let _ = tx.send(PullProgress::new(
                UNIT_IMAGE,
                PullStatus::Done,
                existing.size,
                existing.size,
            ));
            return Ok(existing);
        }

        let config = client
            .get_image_config(reference, &manifest.config.digest)
            .await?;
        let _ = tx.send(PullProgress::new(
            UNIT_CONFIG,
            PullStatus::Done,
            manifest.config.size,
            manifest.config.size,
        ));

        for layer in &manifest.layers {
            let _ = tx.send(PullProgress::new(
                layer.digest.clone(),
                PullStatus::Waiting,
                0,
                layer.size,
            ));
        }
        for layer in &manifest.layers {
            self.fetch_layer(&client, reference, layer, tx).await?;
        }

        let size = manifest.total_layer_size();
        let record = ImageRecord {
            id,
            registry: reference.registry.clone(),
            repository: reference.repository.clone(),
            tag: reference.tag.clone(),
            architecture: non_empty_or(&config.architecture, &self.architecture),
            os: non_empty_or(&config.os, &self.os),
            size,
            layer_digests: manifest.layers.iter().map(|l| l.digest.clone()).collect(),
            created_at: Utc::now(),
            config: config.to_image_config(),
        };
        self.store.put_image(&record)?;
        let _ = tx.send(PullProgress::new(UNIT_IMAGE, PullStatus::Done, size, size));
        Ok(record)
    }

    async fn fetch_layer(
        &self,
        client: &RegistryClient,
        reference: &ImageReference,
        layer: &Descriptor,
        tx: &Progress,
    ) -> Result<()> {
        let _lease = self.lock_digest(&layer.digest).await;

        let cached = self
            .store
            .get_layer(&layer.digest)?
            .is_some_and(|r| r.downloaded);
        if cached && self.layers.has_layer(&layer.digest) {
            tracing::debug!(digest = %layer.digest, "layer already cached");
            let _ = tx.send(PullProgress::new(
                layer.digest.clone(),
                PullStatus::Done,
                layer.size,
                layer.size,
            ));
            return Ok(());
        }

        let expected = Sha256Hash::from_digest(&layer.digest)?;
        let partial = self.layers.partial_path(&layer.digest)?;
        let dest = self.layers.layer_path(&layer.digest)?;

        let digest = layer.digest.clone();
        let downloaded = client
            .download_layer(reference, layer, &partial, |downloaded, total| {
                let _ = tx.send(PullProgress::new(
                    digest.clone(),
                    PullStatus::Downloading,
                    downloaded,
                    total,
                ));
            })
            .await?;

        let check_path = partial.clone();
        tokio::task::spawn_blocking(move || hash::validate_hash(&check_path, &expected))
            .await
            .map_err(|e| PocketboxError::Cancelled {
                operation: format!("layer verification: {e}"),
            })?
            .inspect_err(|_| {
                let _ = std::fs::remove_file(&partial);
            })?;
        tokio::fs::rename(&partial, &dest)
            .await
            .map_err(|e| PocketboxError::io(&dest, e))?;

        self.store.put_layer(&LayerRecord {
            digest: layer.digest.clone(),
            size: layer.size,
            media_type: layer.media_type.clone(),
            downloaded: true,
        })?;
        let _ = tx.send(PullProgress::new(
            layer.digest.clone(),
            PullStatus::Done,
            downloaded,
            downloaded.max(layer.size),
        ));
        Ok(())
    }

    /// Serializes work on one digest across concurrent pulls.
    async fn lock_digest(&self, digest: &str) -> DigestLease<'_> {
        let lock = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(in_flight.entry(digest.to_string()).or_default())
        };
        DigestLease {
            guard: Some(lock.lock_owned().await),
            digest: digest.to_string(),
            in_flight: &self.in_flight,
        }
    }
}

/// Exclusive hold on one layer digest. The map entry goes away with the
/// last holder or waiter.
struct DigestLease<'a> {
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    digest: String,
    in_flight: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Drop for DigestLease<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // Waiters clone the entry under the map lock, so a count of one
        // means nobody else can reach it.
        if in_flight.get(&self.digest).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            let _ = in_flight.remove(&self.digest);
        }
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() { fallback } else { value }.to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pocketbox_common::store::JsonStore;

    use super::*;

    fn puller(dir: &std::path::Path) -> ImagePuller {
        let store: Arc<dyn MetadataStore> = Arc::new(JsonStore::in_memory());
        let mirrors =
            MirrorManager::new(Arc::clone(&store), Duration::from_secs(1)).expect("mirrors");
        ImagePuller::new(
            store,
            LayerStore::open(dir.join("layers")).expect("layers"),
            Arc::new(mirrors),
            ClientTimeouts {
                request: Duration::from_secs(1),
                download: Duration::from_secs(1),
            },
            "amd64",
            "linux",
        )
    }

    fn tracked(puller: &ImagePuller) -> usize {
        puller.in_flight.lock().unwrap().len()
    }

    #[tokio::test]
    async fn digest_lock_is_exclusive_and_forgotten_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let puller = puller(dir.path());

        let first = puller.lock_digest("sha256:aa").await;
        let mut waiter = std::pin::pin!(puller.lock_digest("sha256:aa"));
        assert!(
            tokio::time::timeout(Duration::from_millis(10), waiter.as_mut())
                .await
                .is_err()
        );

        drop(first);
        assert_eq!(tracked(&puller), 1, "the waiter still needs the entry");
        let second = waiter.await;
        drop(second);
        assert_eq!(tracked(&puller), 0);
    }

    #[tokio::test]
    async fn distinct_digests_do_not_block_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let puller = puller(dir.path());

        let a = puller.lock_digest("sha256:aa").await;
        let b = tokio::time::timeout(Duration::from_secs(1), puller.lock_digest("sha256:bb"))
            .await
            .expect("independent digest");
        assert_eq!(tracked(&puller), 2);
        drop((a, b));
        assert_eq!(tracked(&puller), 0);
    }
}
