//! Metadata persistence.
//!
//! The engine only needs keyed CRUD over five tables, captured by
//! [`MetadataStore`]. [`JsonStore`] is the bundled implementation: every
//! table lives in memory and is rewritten as a pretty-printed JSON file under
//! `db/` after each mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{PocketboxError, Result};
use crate::records::{AuthToken, ContainerRecord, ImageRecord, LayerRecord, RegistryMirror};
use crate::types::{ContainerId, ImageId};

/// Keyed storage for every persisted record kind.
pub trait MetadataStore: Send + Sync {
    /// Lists all containers ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn list_containers(&self) -> Result<Vec<ContainerRecord>>;

    /// Fetches one container.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn get_container(&self, id: &ContainerId) -> Result<Option<ContainerRecord>>;

    /// Fetches one container by its unique name.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn find_container_by_name(&self, name: &str) -> Result<Option<ContainerRecord>>;

    /// Inserts or replaces a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn put_container(&self, record: &ContainerRecord) -> Result<()>;

    /// Deletes a container, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn delete_container(&self, id: &ContainerId) -> Result<bool>;

    /// Lists all images.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn list_images(&self) -> Result<Vec<ImageRecord>>;

    /// Fetches one image.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn get_image(&self, id: &ImageId) -> Result<Option<ImageRecord>>;

    /// Inserts or replaces an image.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn put_image(&self, record: &ImageRecord) -> Result<()>;

    /// Deletes an image, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn delete_image(&self, id: &ImageId) -> Result<bool>;

    /// Fetches one layer by digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn get_layer(&self, digest: &str) -> Result<Option<LayerRecord>>;

    /// Inserts or replaces a layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn put_layer(&self, record: &LayerRecord) -> Result<()>;

    /// Deletes a layer, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn delete_layer(&self, digest: &str) -> Result<bool>;

    /// Lists custom mirrors.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn list_mirrors(&self) -> Result<Vec<RegistryMirror>>;

    /// Inserts or replaces a mirror, keyed by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn put_mirror(&self, mirror: &RegistryMirror) -> Result<()>;

    /// Deletes a mirror by name, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn delete_mirror(&self, name: &str) -> Result<bool>;

    /// Fetches a cached token by its exact auth URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn get_token(&self, auth_url: &str) -> Result<Option<AuthToken>>;

    /// Inserts or replaces a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn put_token(&self, token: &AuthToken) -> Result<()>;

    /// Deletes every token expired at `now`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage fails.
    fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Default)]
struct Tables {
    containers: BTreeMap<String, ContainerRecord>,
    images: BTreeMap<String, ImageRecord>,
    layers: BTreeMap<String, LayerRecord>,
    mirrors: BTreeMap<String, RegistryMirror>,
    tokens: BTreeMap<String, AuthToken>,
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Containers,
    Images,
    Layers,
    Mirrors,
    Tokens,
}

impl Table {
    const fn file_name(self) -> &'static str {
        match self {
            Self::Containers => "containers.json",
            Self::Images => "images.json",
            Self::Layers => "layers.json",
            Self::Mirrors => "mirrors.json",
            Self::Tokens => "tokens.json",
        }
    }
}

/// Metadata store backed by one JSON file per table.
#[derive(Debug)]
pub struct JsonStore {
    db_dir: Option<PathBuf>,
    tables: Mutex<Tables>,
}

impl JsonStore {
    /// Opens or creates a store under `db_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or an existing
    /// table cannot be parsed.
    pub fn open(db_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(db_dir).map_err(|e| PocketboxError::io(db_dir, e))?;

        let tables = Tables {
            containers: load_table(db_dir, Table::Containers, |r: &ContainerRecord| {
                r.id.to_string()
            })?,
            images: load_table(db_dir, Table::Images, |r: &ImageRecord| r.id.to_string())?,
            layers: load_table(db_dir, Table::Layers, |r: &LayerRecord| r.digest.clone())?,
            mirrors: load_table(db_dir, Table::Mirrors, |r: &RegistryMirror| r.name.clone())?,
            tokens: load_table(db_dir, Table::Tokens, |r: &AuthToken| r.auth_url.clone())?,
        };
        tracing::debug!(
            db = %db_dir.display(),
            containers = tables.containers.len(),
            images = tables.images.len(),
            "metadata store opened"
        );

        Ok(Self {
            db_dir: Some(db_dir.to_path_buf()),
            tables: Mutex::new(tables),
        })
    }

    /// Creates a store that never touches the filesystem.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            db_dir: None,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush<T: Serialize>(&self, table: Table, rows: &BTreeMap<String, T>) -> Result<()> {
        let Some(db_dir) = &self.db_dir else {
            return Ok(());
        };
        let path = db_dir.join(table.file_name());
        let tmp = path.with_extension("json.tmp");
        let rows: Vec<&T> = rows.values().collect();
        let json = serde_json::to_string_pretty(&rows)?;
        std::fs::write(&tmp, json).map_err(|e| PocketboxError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| PocketboxError::io(&path, e))
    }
}

fn load_table<T, K>(db_dir: &Path, table: Table, key: K) -> Result<BTreeMap<String, T>>
where
    T: DeserializeOwned,
    K: Fn(&T) -> String,
{
    let path = db_dir.join(table.file_name());
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = std::fs::read_to_string(&path).map_err(|e| PocketboxError::io(&path, e))?;
    let rows: Vec<T> = serde_json::from_str(&content)?;
    Ok(rows.into_iter().map(|row| (key(&row), row)).collect())
}

impl MetadataStore for JsonStore {
    fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        let mut rows: Vec<_> = self.lock().containers.values().cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    fn get_container(&self, id: &ContainerId) -> Result<Option<ContainerRecord>> {
        Ok(self.lock().containers.get(id.as_str()).cloned())
    }

    fn find_container_by_name(&self, name: &str) -> Result<Option<ContainerRecord>> {
        Ok(self
            .lock()
            .containers
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    fn put_container(&self, record: &ContainerRecord) -> Result<()> {
        let mut tables = self.lock();
        let _ = tables
            .containers
            .insert(record.id.to_string(), record.clone());
        self.flush(Table::Containers, &tables.containers)
    }

    fn delete_container(&self, id: &ContainerId) -> Result<bool> {
        let mut tables = self.lock();
        let existed = tables.containers.remove(id.as_str()).is_some();
        if existed {
            self.flush(Table::Containers, &tables.containers)?;
        }
        Ok(existed)
    }

    fn list_images(&self) -> Result<Vec<ImageRecord>> {
        let mut rows: Vec<_> = self.lock().images.values().cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    fn get_image(&self, id: &ImageId) -> Result<Option<ImageRecord>> {
        Ok(self.lock().images.get(id.as_str()).cloned())
    }

    fn put_image(&self, record: &ImageRecord) -> Result<()> {
        let mut tables = self.lock();
        let _ = tables.images.insert(record.id.to_string(), record.clone());
        self.flush(Table::Images, &tables.images)
    }

    fn delete_image(&self, id: &ImageId) -> Result<bool> {
        let mut tables = self.lock();
        let existed = tables.images.remove(id.as_str()).is_some();
        if existed {
            self.flush(Table::Images, &tables.images)?;
        }
        Ok(existed)
    }

    fn get_layer(&self, digest: &str) -> Result<Option<LayerRecord>> {
        Ok(self.lock().layers.get(digest).cloned())
    }

    fn put_layer(&self, record: &LayerRecord) -> Result<()> {
        let mut tables = self.lock();
        let _ = tables.layers.insert(record.digest.clone(), record.clone());
        self.flush(Table::Layers, &tables.layers)
    }

    fn delete_layer(&self, digest: &str) -> Result<bool> {
        let mut tables = self.lock();
        let existed = tables.layers.remove(digest).is_some();
        if existed {
            self.flush(Table::Layers, &tables.layers)?;
        }
        Ok(existed)
    }

    fn list_mirrors(&self) -> Result<Vec<RegistryMirror>> {
        Ok(self.lock().mirrors.values().cloned().collect())
    }

    fn put_mirror(&self, mirror: &RegistryMirror) -> Result<()> {
        let mut tables = self.lock();
        let _ = tables.mirrors.insert(mirror.name.clone(), mirror.clone());
        self.flush(Table::Mirrors, &tables.mirrors)
    }

    fn delete_mirror(&self, name: &str) -> Result<bool> {
        let mut tables = self.lock();
        let existed = tables.mirrors.remove(name).is_some();
        if existed {
            self.flush(Table::Mirrors, &tables.mirrors)?;
        }
        Ok(existed)
    }

    fn get_token(&self, auth_url: &str) -> Result<Option<AuthToken>> {
        Ok(self.lock().tokens.get(auth_url).cloned())
    }

    fn put_token(&self, token: &AuthToken) -> Result<()> {
        let mut tables = self.lock();
        let _ = tables.tokens.insert(token.auth_url.clone(), token.clone());
        self.flush(Table::Tokens, &tables.tokens)
    }

    fn purge_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.lock();
        let before = tables.tokens.len();
        tables.tokens.retain(|_, t| !t.is_expired(now));
        let purged = before - tables.tokens.len();
        if purged > 0 {
            self.flush(Table::Tokens, &tables.tokens)?;
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::records::{ContainerConfig, ImageConfig};

    fn make_container(id: &str, name: &str) -> ContainerRecord {
        ContainerRecord {
            id: ContainerId::new(id),
            name: name.into(),
            image_id: ImageId::new("img"),
            image_name: "alpine:latest".into(),
            config: ContainerConfig::default(),
            created_at: Utc::now(),
            last_run_at: None,
        }
    }

    fn make_image(id: &str) -> ImageRecord {
        ImageRecord {
            id: ImageId::new(id),
            registry: "docker.io".into(),
            repository: "library/alpine".into(),
            tag: "latest".into(),
            architecture: "amd64".into(),
            os: "linux".into(),
            size: 1024,
            layer_digests: vec!["sha256:aaa".into()],
            created_at: Utc::now(),
            config: ImageConfig::default(),
        }
    }

    #[test]
    fn store_empty_on_first_open() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let store = JsonStore::open(dir.path()).expect("open failed");
        assert!(store.list_containers().expect("list failed").is_empty());
        assert!(store.list_images().expect("list failed").is_empty());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        {
            let store = JsonStore::open(dir.path()).expect("open failed");
            store
                .put_container(&make_container("c1", "brave_fox_1001"))
                .expect("put failed");
            store.put_image(&make_image("img-1")).expect("put failed");
        }

        let store = JsonStore::open(dir.path()).expect("reopen failed");
        let found = store
            .find_container_by_name("brave_fox_1001")
            .expect("find failed")
            .expect("container missing");
        assert_eq!(found.id.as_str(), "c1");
        assert!(store.get_image(&ImageId::new("img-1")).expect("get failed").is_some());
    }

    #[test]
    fn delete_reports_whether_row_existed() {
        let store = JsonStore::in_memory();
        store
            .put_container(&make_container("c1", "a"))
            .expect("put failed");
        assert!(store.delete_container(&ContainerId::new("c1")).expect("delete"));
        assert!(!store.delete_container(&ContainerId::new("c1")).expect("delete"));
    }

    #[test]
    fn put_replaces_existing_row() {
        let store = JsonStore::in_memory();
        let mut record = make_container("c1", "a");
        store.put_container(&record).expect("put failed");
        record.last_run_at = Some(Utc::now());
        store.put_container(&record).expect("put failed");

        let rows = store.list_containers().expect("list failed");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].last_run_at.is_some());
    }

    #[test]
    fn purge_removes_only_expired_tokens() {
        let store = JsonStore::in_memory();
        let now = Utc::now();
        store
            .put_token(&AuthToken {
                auth_url: "old".into(),
                token: "t1".into(),
                expires_at: now - Duration::seconds(1),
            })
            .expect("put failed");
        store
            .put_token(&AuthToken {
                auth_url: "fresh".into(),
                token: "t2".into(),
                expires_at: now + Duration::seconds(60),
            })
            .expect("put failed");

        assert_eq!(store.purge_expired_tokens(now).expect("purge"), 1);
        assert!(store.get_token("old").expect("get").is_none());
        assert!(store.get_token("fresh").expect("get").is_some());
    }

    #[test]
    fn mirror_health_is_not_persisted() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        {
            let store = JsonStore::open(dir.path()).expect("open failed");
            let mut mirror = RegistryMirror::new("corp", "https://mirror.example.com", 50);
            mirror.is_healthy = true;
            mirror.latency_ms = Some(12);
            store.put_mirror(&mirror).expect("put failed");
        }
        let store = JsonStore::open(dir.path()).expect("reopen failed");
        let mirrors = store.list_mirrors().expect("list failed");
        assert_eq!(mirrors.len(), 1);
        assert!(!mirrors[0].is_healthy);
        assert_eq!(mirrors[0].latency_ms, None);
    }
}
