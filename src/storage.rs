use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use futures::future::{self, BoxFuture};
use parking_lot::Mutex;

use crate::error::StorageError;

pub enum Write {
    Put(String, String),
    Remove(String),
}

/// Durable key → string map. A `commit` applies every write of the batch or
/// none of them.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StorageError>>;

    fn commit(&self, batch: Vec<Write>) -> BoxFuture<'_, Result<(), StorageError>>;
}

fn apply(map: &mut BTreeMap<String, String>, batch: Vec<Write>) {
    for write in batch {
        match write {
            Write::Put(key, value) => {
                map.insert(key, value);
            }
            Write::Remove(key) => {
                map.remove(&key);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.lock().clone()
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StorageError>> {
        let value = self.entries.lock().get(key).cloned();
        Box::pin(future::ready(Ok(value)))
    }

    fn commit(&self, batch: Vec<Write>) -> BoxFuture<'_, Result<(), StorageError>> {
        apply(&mut self.entries.lock(), batch);
        Box::pin(future::ready(Ok(())))
    }
}

/// Key → string map kept in a single TOML table on disk. Every commit rewrites
/// the file through a temporary sibling and a rename.
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vless-client")
            .join("store.toml")
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(entries) => {
                    log::info!("[storage] loaded from {}", path.display());
                    entries
                }
                Err(error) => {
                    log::warn!("[storage] failed to parse {}: {error}", path.display());
                    BTreeMap::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                log::info!("[storage] no store at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(error) => {
                return Err(StorageError::Read {
                    path: path.display().to_string(),
                    message: error.to_string(),
                });
            }
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let write_error = |message: String| StorageError::Write {
            path: self.path.display().to_string(),
            message,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| write_error(error.to_string()))?;
        }
        let content =
            toml::to_string_pretty(entries).map_err(|error| StorageError::Encode(error.to_string()))?;
        let temporary = self.path.with_extension("toml.tmp");
        std::fs::write(&temporary, content).map_err(|error| write_error(error.to_string()))?;
        std::fs::rename(&temporary, &self.path).map_err(|error| write_error(error.to_string()))
    }
}

impl KeyValueStore for FileStorage {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StorageError>> {
        let value = self.entries.lock().get(key).cloned();
        Box::pin(future::ready(Ok(value)))
    }

    fn commit(&self, batch: Vec<Write>) -> BoxFuture<'_, Result<(), StorageError>> {
        let mut entries = self.entries.lock();
        let mut updated = entries.clone();
        apply(&mut updated, batch);
        let result = self.persist(&updated).map(|()| {
            *entries = updated;
            log::debug!(
                "[storage] committed {} keys to {}",
                entries.len(),
                self.path.display()
            );
        });
        Box::pin(future::ready(result))
    }
}
