pub mod config;
pub mod process;

use futures::future::BoxFuture;

pub use config::{EngineConfig, RenderOptions, XrayConfiguration};
pub use process::{ProcessEngine, ProcessEngineOptions};

use crate::{error::EngineError, events::Subscription};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Running,
    Stopped,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub external_ip: Option<String>,
    pub detail: Option<String>,
}

impl EngineStatus {
    pub fn new(state: EngineState) -> Self {
        Self {
            state,
            external_ip: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_external_ip(mut self, external_ip: impl Into<String>) -> Self {
        self.external_ip = Some(external_ip.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStarted {
    pub external_ip: Option<String>,
}

/// The component that actually carries traffic. One engine holds at most one
/// live tunnel; `start` must leave nothing running when it fails, and
/// dropping the `start` future abandons the attempt.
pub trait TunnelEngine: Send + Sync {
    fn start(&self, config: EngineConfig) -> BoxFuture<'_, Result<EngineStarted, EngineError>>;

    fn stop(&self) -> BoxFuture<'_, Result<(), EngineError>>;

    fn status(&self) -> Subscription<EngineStatus>;
}
