pub mod connection_state;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod failover;
pub mod orchestrator;
pub mod process_log;
pub mod server;
pub mod settings;
pub mod storage;
pub mod store;
pub mod system;
pub mod uri;

pub use connection_state::{ConnectionEvent, ConnectionSession, ConnectionState};
pub use context::AppContext;
pub use engine::{EngineConfig, EngineStarted, EngineState, EngineStatus, TunnelEngine};
pub use error::{ConnectError, EngineError, LinkError, ParseError, StorageError, StoreError};
pub use events::{Broadcaster, Subscription};
pub use failover::{FailoverPolicy, StoreOrder};
pub use orchestrator::ConnectionOrchestrator;
pub use server::{Security, SecurityParams, ServerConfig};
pub use settings::Settings;
pub use storage::{FileStorage, KeyValueStore, MemoryStorage};
pub use store::ServerStore;
