#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};

use futures::{
    FutureExt, StreamExt,
    executor::block_on,
    future::{self, BoxFuture},
};
use parking_lot::Mutex;
use vless_client::{
    Broadcaster, ConnectionEvent, EngineConfig, EngineError, EngineStarted, EngineStatus,
    MemoryStorage, ServerStore, Subscription, TunnelEngine,
};

pub enum Step {
    Succeed(Option<&'static str>),
    Fail(&'static str),
    Hang,
}

/// In-memory engine whose `start` result is scripted per server address.
pub struct ScriptedEngine {
    steps: Mutex<HashMap<String, Step>>,
    attempts: Mutex<Vec<String>>,
    stops: Mutex<usize>,
    status: Mutex<Option<Broadcaster<EngineStatus>>>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self {
            steps: Mutex::default(),
            attempts: Mutex::default(),
            stops: Mutex::default(),
            status: Mutex::new(Some(Broadcaster::new())),
        }
    }
}

impl ScriptedEngine {
    pub fn with(self, address: &str, step: Step) -> Self {
        self.steps.lock().insert(address.to_string(), step);
        self
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    pub fn stops(&self) -> usize {
        *self.stops.lock()
    }

    pub fn emit(&self, status: EngineStatus) {
        if let Some(broadcaster) = self.status.lock().as_ref() {
            broadcaster.publish(status);
        }
    }

    /// Ends every status subscription once queued events are drained.
    pub fn close_status(&self) {
        self.status.lock().take();
    }
}

impl TunnelEngine for ScriptedEngine {
    fn start(&self, config: EngineConfig) -> BoxFuture<'_, Result<EngineStarted, EngineError>> {
        self.attempts.lock().push(config.address.clone());
        match self.steps.lock().get(&config.address) {
            Some(Step::Succeed(ip)) => future::ready(Ok(EngineStarted {
                external_ip: ip.map(str::to_string),
            }))
            .boxed(),
            Some(Step::Fail(reason)) => {
                future::ready(Err(EngineError::Start(reason.to_string()))).boxed()
            }
            Some(Step::Hang) | None => future::pending().boxed(),
        }
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), EngineError>> {
        *self.stops.lock() += 1;
        future::ready(Ok(())).boxed()
    }

    fn status(&self) -> Subscription<EngineStatus> {
        self.status
            .lock()
            .get_or_insert_with(Broadcaster::new)
            .subscribe()
    }
}

pub fn store_with(links: &[&str]) -> Arc<ServerStore> {
    block_on(async {
        let store = ServerStore::open(Arc::new(MemoryStorage::new()))
            .await
            .unwrap();
        for link in links {
            store.add(link).await.unwrap();
        }
        Arc::new(store)
    })
}

pub fn drain(events: &mut Subscription<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut drained = Vec::new();
    while let Some(Some(event)) = events.next().now_or_never() {
        drained.push(event);
    }
    drained
}
