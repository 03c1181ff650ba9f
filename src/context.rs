use std::{path::PathBuf, sync::Arc};

use crate::{
    engine::{ProcessEngine, ProcessEngineOptions, TunnelEngine},
    error::{LinkError, StoreError},
    orchestrator::ConnectionOrchestrator,
    server::ServerConfig,
    settings::Settings,
    storage::{FileStorage, KeyValueStore},
    store::ServerStore,
    system, uri,
};

pub const SAMPLE_LINK: &str = include_str!("../assets/sample_vless_url.txt");

/// Everything the front end needs, built once at startup and passed around.
pub struct AppContext {
    pub settings: Settings,
    pub store: Arc<ServerStore>,
    pub orchestrator: Arc<ConnectionOrchestrator>,
}

impl AppContext {
    pub fn new(settings: Settings, store: Arc<ServerStore>, engine: Arc<dyn TunnelEngine>) -> Self {
        let orchestrator = Arc::new(ConnectionOrchestrator::new(
            store.clone(),
            engine,
            settings.smart_connect,
        ));
        Self {
            settings,
            store,
            orchestrator,
        }
    }

    /// Opens the on-disk store, seeds it on first run and wires the process
    /// engine using the saved settings.
    pub async fn bootstrap(settings: Settings) -> Result<Self, StoreError> {
        let storage = FileStorage::open(FileStorage::default_path())?;
        log::info!("[startup] server store: {}", storage.path().display());
        let storage: Arc<dyn KeyValueStore> = Arc::new(storage);
        let store = Arc::new(ServerStore::open(storage).await?);
        import_sample_if_empty(&store).await?;

        let (binary, found) = system::find_engine_binary(settings.engine_binary.as_deref());
        log::info!("[startup] engine binary: {binary} (found={found})");
        if found && let Some(error) = system::check_binary_works(&binary) {
            log::warn!("[startup] binary check issue: {error}");
        }

        let engine = Arc::new(ProcessEngine::new(ProcessEngineOptions {
            binary: PathBuf::from(binary),
            working_directory: Settings::configuration_directory(),
            render: settings.render_options(),
            connect_timeout: settings.connect_timeout(),
        }));
        Ok(Self::new(settings, store, engine))
    }

    pub async fn handle_link(&self, raw: &str) -> Result<ServerConfig, LinkError> {
        route_link(raw, &self.store).await
    }

    pub fn set_smart_connect(&mut self, enabled: bool) {
        self.settings.smart_connect = enabled;
        self.orchestrator.set_auto_failover(enabled);
    }
}

/// Seeds an empty store with the packaged sample descriptor.
pub async fn import_sample_if_empty(
    store: &ServerStore,
) -> Result<Option<ServerConfig>, StoreError> {
    if !store.is_empty() {
        return Ok(None);
    }
    let server = store.add(SAMPLE_LINK).await?;
    log::info!("[startup] imported sample server {}", server.name);
    Ok(Some(server))
}

pub async fn route_link(raw: &str, store: &ServerStore) -> Result<ServerConfig, LinkError> {
    let trimmed = raw.trim();
    if !trimmed.starts_with(uri::SCHEME) {
        log::warn!("[uri] ignoring unsupported link");
        return Err(LinkError::UnsupportedLink(trimmed.to_string()));
    }
    let server = store.add(trimmed).await?;
    log::info!("[uri] imported {} from deep link", server.name);
    Ok(server)
}
