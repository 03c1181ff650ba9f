use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed VLESS URI: expected vless://user@host:port")]
    MalformedUri,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("failed to write {path}: {message}")]
    Write { path: String, message: String },
    #[error("failed to encode stored value: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("server {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine failed to start: {0}")]
    Start(String),
    #[error("engine did not report a connection within {0} seconds")]
    Timeout(u64),
    #[error("engine exited: {0}")]
    Exited(String),
    #[error("engine teardown failed: {0}")]
    Teardown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("no active server selected")]
    NoActiveServer,
    #[error("all connection attempts failed: {0}")]
    EngineFailure(#[source] EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("unsupported link: {0}")]
    UnsupportedLink(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
