use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    error::{StorageError, StoreError},
    server::ServerConfig,
    storage::{KeyValueStore, Write},
    uri,
};

pub const SERVERS_KEY: &str = "servers";
pub const ACTIVE_SERVER_KEY: &str = "active_server";

#[derive(Clone, Default)]
struct Snapshot {
    servers: Arc<Vec<ServerConfig>>,
    active_id: Option<String>,
}

/// Ordered list of servers plus the active selection.
///
/// Writers are serialized and persist the list and the active id in a single
/// commit; the in-memory snapshot is replaced only after that commit succeeded,
/// so readers never observe half of an operation.
pub struct ServerStore {
    storage: Arc<dyn KeyValueStore>,
    writer: futures::lock::Mutex<()>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ServerStore {
    pub async fn open(storage: Arc<dyn KeyValueStore>) -> Result<Self, StoreError> {
        let servers: Vec<ServerConfig> = match storage.get(SERVERS_KEY).await? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(servers) => servers,
                Err(error) => {
                    log::warn!("[store] failed to parse stored servers, starting empty: {error}");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let mut active_id = storage.get(ACTIVE_SERVER_KEY).await?;
        let dangling = active_id
            .as_deref()
            .is_some_and(|id| !servers.iter().any(|server| server.id == id));
        if dangling {
            let repaired = servers.first().map(|server| server.id.clone());
            log::warn!(
                "[store] active server {:?} is not stored, falling back to {repaired:?}",
                active_id
            );
            let repair = match &repaired {
                Some(id) => Write::Put(ACTIVE_SERVER_KEY.into(), id.clone()),
                None => Write::Remove(ACTIVE_SERVER_KEY.into()),
            };
            storage.commit(vec![repair]).await?;
            active_id = repaired;
        }

        log::info!(
            "[store] loaded {} servers (active={:?})",
            servers.len(),
            active_id
        );

        Ok(Self {
            storage,
            writer: futures::lock::Mutex::new(()),
            snapshot: RwLock::new(Arc::new(Snapshot {
                servers: Arc::new(servers),
                active_id,
            })),
        })
    }

    pub fn list(&self) -> Arc<Vec<ServerConfig>> {
        self.snapshot.read().servers.clone()
    }

    pub fn active_id(&self) -> Option<String> {
        self.snapshot.read().active_id.clone()
    }

    pub fn active(&self) -> Option<ServerConfig> {
        let snapshot = self.snapshot.read().clone();
        let id = snapshot.active_id.as_deref()?;
        snapshot.servers.iter().find(|server| server.id == id).cloned()
    }

    pub fn get(&self, id: &str) -> Option<ServerConfig> {
        self.snapshot
            .read()
            .servers
            .iter()
            .find(|server| server.id == id)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().servers.is_empty()
    }

    pub async fn add(&self, raw: &str) -> Result<ServerConfig, StoreError> {
        let server = uri::parse(raw)?;

        let _writer = self.writer.lock().await;
        let current = self.current();

        let mut servers = current.servers.as_ref().clone();
        let first = servers.is_empty();
        servers.push(server.clone());
        let active_id = if first {
            Some(server.id.clone())
        } else {
            current.active_id.clone()
        };

        self.commit(Snapshot {
            servers: Arc::new(servers),
            active_id,
        })
        .await?;

        log::info!(
            "[store] added {} ({}){}",
            server.name,
            server.id,
            if first { ", now active" } else { "" }
        );
        Ok(server)
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        let current = self.current();

        let Some(position) = current.servers.iter().position(|server| server.id == id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };

        let mut servers = current.servers.as_ref().clone();
        let removed = servers.remove(position);
        let active_id = if current.active_id.as_deref() == Some(id) {
            servers.first().map(|server| server.id.clone())
        } else {
            current.active_id.clone()
        };

        self.commit(Snapshot {
            servers: Arc::new(servers),
            active_id: active_id.clone(),
        })
        .await?;

        log::info!(
            "[store] deleted {} ({}), active={:?}",
            removed.name,
            removed.id,
            active_id
        );
        Ok(())
    }

    pub async fn set_active(&self, id: &str) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;
        let current = self.current();

        if !current.servers.iter().any(|server| server.id == id) {
            return Err(StoreError::NotFound(id.to_string()));
        }

        self.commit(Snapshot {
            servers: current.servers.clone(),
            active_id: Some(id.to_string()),
        })
        .await?;

        log::info!("[store] active server set to {id}");
        Ok(())
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    async fn commit(&self, next: Snapshot) -> Result<(), StoreError> {
        let servers = serde_json::to_string(next.servers.as_ref())
            .map_err(|error| StorageError::Encode(error.to_string()))?;
        let active = match &next.active_id {
            Some(id) => Write::Put(ACTIVE_SERVER_KEY.into(), id.clone()),
            None => Write::Remove(ACTIVE_SERVER_KEY.into()),
        };

        self.storage
            .commit(vec![Write::Put(SERVERS_KEY.into(), servers), active])
            .await?;

        *self.snapshot.write() = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::task::Poll;

    use futures::{
        executor::block_on,
        future::{self, BoxFuture, join_all},
    };

    use super::*;
    use crate::{error::ParseError, storage::MemoryStorage};

    fn open(storage: &Arc<MemoryStorage>) -> ServerStore {
        block_on(ServerStore::open(storage.clone())).unwrap()
    }

    fn assert_active_is_consistent(store: &ServerStore) {
        if let Some(id) = store.active_id() {
            assert!(store.list().iter().any(|server| server.id == id));
        }
    }

    #[test]
    fn first_server_becomes_active_and_deleting_it_clears_selection() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(&storage);

        let server = block_on(store.add("vless://u@a.example:443")).unwrap();
        assert_eq!(store.active_id(), Some(server.id.clone()));
        assert_eq!(store.active(), Some(server.clone()));

        block_on(store.delete(&server.id)).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.active_id(), None);
        assert_eq!(storage.snapshot().get(ACTIVE_SERVER_KEY), None);
        assert_eq!(
            storage.snapshot().get(SERVERS_KEY).map(String::as_str),
            Some("[]")
        );
    }

    #[test]
    fn later_additions_keep_the_current_selection() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(&storage);

        let first = block_on(store.add("vless://u@a:1")).unwrap();
        block_on(store.add("vless://u@b:2")).unwrap();
        assert_eq!(store.active_id(), Some(first.id));
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn deleting_active_promotes_first_remaining() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(&storage);

        let a = block_on(store.add("vless://u@a:1")).unwrap();
        let b = block_on(store.add("vless://u@b:2")).unwrap();
        let c = block_on(store.add("vless://u@c:3")).unwrap();
        block_on(store.set_active(&c.id)).unwrap();

        block_on(store.delete(&c.id)).unwrap();
        assert_eq!(store.active_id(), Some(a.id.clone()));
        let ids: Vec<_> = store.list().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn deleting_inactive_server_keeps_selection() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(&storage);

        let a = block_on(store.add("vless://u@a:1")).unwrap();
        let b = block_on(store.add("vless://u@b:2")).unwrap();
        block_on(store.delete(&b.id)).unwrap();
        assert_eq!(store.active_id(), Some(a.id));
    }

    #[test]
    fn unknown_ids_report_not_found_without_changes() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(&storage);
        let a = block_on(store.add("vless://u@a:1")).unwrap();
        let before = storage.snapshot();

        assert_eq!(
            block_on(store.delete("missing")),
            Err(StoreError::NotFound("missing".into()))
        );
        assert_eq!(
            block_on(store.set_active("missing")),
            Err(StoreError::NotFound("missing".into()))
        );
        assert_eq!(store.active_id(), Some(a.id));
        assert_eq!(storage.snapshot(), before);
    }

    #[test]
    fn malformed_input_leaves_store_untouched() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(&storage);

        assert_eq!(
            block_on(store.add("not a link")),
            Err(StoreError::Parse(ParseError::MalformedUri))
        );
        assert!(store.is_empty());
        assert!(storage.snapshot().is_empty());
    }

    #[test]
    fn set_active_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(&storage);
        block_on(store.add("vless://u@a:1")).unwrap();
        let b = block_on(store.add("vless://u@b:2")).unwrap();

        block_on(store.set_active(&b.id)).unwrap();
        let once = (store.active_id(), store.list(), storage.snapshot());
        block_on(store.set_active(&b.id)).unwrap();
        assert_eq!(once.0, store.active_id());
        assert_eq!(*once.1, *store.list());
        assert_eq!(once.2, storage.snapshot());
    }

    #[test]
    fn reopening_restores_every_field() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(&storage);
        block_on(store.add(
            "vless://u@a:443?security=reality&pbk=K&sid=S&sni=x.com&flow=xtls-rprx-vision#A",
        ))
        .unwrap();
        let b = block_on(store.add("vless://u@b:80?type=ws&path=%2Fws#B")).unwrap();
        block_on(store.set_active(&b.id)).unwrap();

        let reopened = open(&storage);
        assert_eq!(*reopened.list(), *store.list());
        assert_eq!(reopened.active_id(), Some(b.id));
    }

    #[test]
    fn dangling_active_id_is_repaired_on_open() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let store = open(&storage);
            block_on(store.add("vless://u@a:1")).unwrap();
        }
        block_on(storage.commit(vec![Write::Put(
            ACTIVE_SERVER_KEY.into(),
            "gone".into(),
        )]))
        .unwrap();

        let store = open(&storage);
        let first = store.list()[0].id.clone();
        assert_eq!(store.active_id(), Some(first.clone()));
        assert_eq!(storage.snapshot().get(ACTIVE_SERVER_KEY), Some(&first));
    }

    #[test]
    fn dangling_active_id_without_servers_is_removed_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        block_on(storage.commit(vec![
            Write::Put(SERVERS_KEY.into(), "{broken".into()),
            Write::Put(ACTIVE_SERVER_KEY.into(), "gone".into()),
        ]))
        .unwrap();

        let store = open(&storage);
        assert_eq!(store.active_id(), None);
        assert_eq!(storage.snapshot().get(ACTIVE_SERVER_KEY), None);
        // the unreadable list is left for the next write to replace
        assert_eq!(
            storage.snapshot().get(SERVERS_KEY).map(String::as_str),
            Some("{broken")
        );
    }

    #[test]
    fn unparseable_server_list_is_treated_as_empty() {
        let storage = Arc::new(MemoryStorage::new());
        block_on(storage.commit(vec![Write::Put(SERVERS_KEY.into(), "{broken".into())]))
            .unwrap();
        let store = open(&storage);
        assert!(store.is_empty());
        assert_eq!(store.active_id(), None);
    }

    /// Suspends every commit once before applying it, so concurrent writers
    /// interleave at the await point.
    struct YieldingStorage(Arc<MemoryStorage>);

    impl KeyValueStore for YieldingStorage {
        fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StorageError>> {
            self.0.get(key)
        }

        fn commit(&self, batch: Vec<Write>) -> BoxFuture<'_, Result<(), StorageError>> {
            Box::pin(async move {
                yield_once().await;
                self.0.commit(batch).await
            })
        }
    }

    async fn yield_once() {
        let mut yielded = false;
        future::poll_fn(|context| {
            if yielded {
                Poll::Ready(())
            } else {
                yielded = true;
                context.waker().wake_by_ref();
                Poll::Pending
            }
        })
        .await
    }

    #[test]
    fn concurrent_adds_lose_no_updates() {
        let memory = Arc::new(MemoryStorage::new());
        let store =
            block_on(ServerStore::open(Arc::new(YieldingStorage(memory.clone())))).unwrap();

        let links: Vec<String> = (0..16).map(|i| format!("vless://u@h{i}:443")).collect();
        let results = block_on(join_all(links.iter().map(|link| store.add(link))));
        assert!(results.iter().all(Result::is_ok));

        assert_eq!(store.list().len(), 16);
        let reopened = open(&memory);
        assert_eq!(reopened.list().len(), 16);
        assert_active_is_consistent(&reopened);
    }

    #[test]
    fn concurrent_mixed_writers_keep_active_id_consistent() {
        let memory = Arc::new(MemoryStorage::new());
        let store =
            block_on(ServerStore::open(Arc::new(YieldingStorage(memory.clone())))).unwrap();
        let a = block_on(store.add("vless://u@a:1")).unwrap();
        let b = block_on(store.add("vless://u@b:2")).unwrap();

        let (deleted, selected, added) = block_on(future::join3(
            store.delete(&a.id),
            store.set_active(&b.id),
            store.add("vless://u@c:3"),
        ));
        deleted.unwrap();
        selected.unwrap();
        added.unwrap();

        assert_eq!(store.list().len(), 2);
        assert_eq!(store.active_id(), Some(b.id));
        let reopened = open(&memory);
        assert_eq!(reopened.list().len(), 2);
        assert_eq!(reopened.active_id(), store.active_id());
    }

    #[test]
    fn mixed_operations_keep_active_id_consistent() {
        let storage = Arc::new(MemoryStorage::new());
        let store = open(&storage);

        let mut ids = Vec::new();
        for step in 0..24 {
            match step % 4 {
                0 | 1 => {
                    let server = block_on(store.add(&format!("vless://u@h{step}:443"))).unwrap();
                    ids.push(server.id);
                }
                2 => {
                    if let Some(id) = ids.get(step % ids.len().max(1)) {
                        let _ = block_on(store.set_active(id));
                    }
                }
                _ => {
                    if let Some(id) = store.active_id() {
                        block_on(store.delete(&id)).unwrap();
                        ids.retain(|known| *known != id);
                    }
                }
            }
            assert_active_is_consistent(&store);
        }
    }

    struct FailingStorage;

    impl KeyValueStore for FailingStorage {
        fn get(&self, _key: &str) -> BoxFuture<'_, Result<Option<String>, StorageError>> {
            Box::pin(future::ready(Ok(None)))
        }

        fn commit(&self, _batch: Vec<Write>) -> BoxFuture<'_, Result<(), StorageError>> {
            Box::pin(future::ready(Err(StorageError::Write {
                path: "memory".into(),
                message: "disk full".into(),
            })))
        }
    }

    #[test]
    fn failed_commit_keeps_previous_snapshot() {
        let store = block_on(ServerStore::open(Arc::new(FailingStorage))).unwrap();
        let result = block_on(store.add("vless://u@a:1"));
        assert!(matches!(result, Err(StoreError::Storage(_))));
        assert!(store.is_empty());
        assert_eq!(store.active_id(), None);
    }
}
