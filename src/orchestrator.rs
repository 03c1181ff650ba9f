use std::{collections::HashSet, sync::Arc};

use futures::{
    StreamExt,
    future::{AbortHandle, Abortable, Aborted},
};
use parking_lot::Mutex;

use crate::{
    connection_state::{ConnectionEvent, ConnectionSession, ConnectionState},
    engine::{EngineConfig, EngineStarted, EngineState, EngineStatus, TunnelEngine},
    error::{ConnectError, EngineError},
    events::{Broadcaster, Subscription},
    failover::{FailoverPolicy, StoreOrder},
    server::ServerConfig,
    store::ServerStore,
};

struct Inner {
    session: ConnectionSession,
    cycle: u64,
    abort: Option<AbortHandle>,
}

/// Owns the connection session and the engine's single live tunnel.
///
/// Session state is only touched inside short critical sections that never
/// span an await, and every transition is published while the lock is held,
/// so subscribers see transitions in the order they happened. Each connect
/// cycle gets a number; results from an older cycle are discarded.
pub struct ConnectionOrchestrator {
    store: Arc<ServerStore>,
    engine: Arc<dyn TunnelEngine>,
    policy: Box<dyn FailoverPolicy>,
    inner: Mutex<Inner>,
    events: Broadcaster<ConnectionEvent>,
}

enum AttemptOutcome {
    Finished(Result<ConnectionState, ConnectError>),
    Retry(ServerConfig),
}

impl ConnectionOrchestrator {
    pub fn new(
        store: Arc<ServerStore>,
        engine: Arc<dyn TunnelEngine>,
        smart_connect_enabled: bool,
    ) -> Self {
        Self::with_policy(store, engine, smart_connect_enabled, Box::new(StoreOrder))
    }

    pub fn with_policy(
        store: Arc<ServerStore>,
        engine: Arc<dyn TunnelEngine>,
        smart_connect_enabled: bool,
        policy: Box<dyn FailoverPolicy>,
    ) -> Self {
        Self {
            store,
            engine,
            policy,
            inner: Mutex::new(Inner {
                session: ConnectionSession::new(smart_connect_enabled),
                cycle: 0,
                abort: None,
            }),
            events: Broadcaster::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().session.state
    }

    pub fn snapshot(&self) -> ConnectionSession {
        self.inner.lock().session.clone()
    }

    pub fn set_auto_failover(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        inner.session.smart_connect_enabled = enabled;
        log::info!("[orchestrator] smart connect {}", if enabled { "on" } else { "off" });
    }

    pub async fn connect(&self) -> Result<ConnectionState, ConnectError> {
        let (registration, first, cycle, smart_connect) = {
            let mut inner = self.inner.lock();
            let current = inner.session.state;
            if current.is_active() {
                log::info!("[orchestrator] connect ignored while {current:?}");
                return Ok(current);
            }

            let Some(server) = self.store.active() else {
                log::warn!("[orchestrator] connect requested without an active server");
                inner.session.last_error = Some(ConnectError::NoActiveServer.to_string());
                return Err(ConnectError::NoActiveServer);
            };

            let (handle, registration) = AbortHandle::new_pair();
            inner.cycle += 1;
            inner.abort = Some(handle);
            inner.session.last_error = None;
            inner.session.last_observed_ip = None;
            self.enter(&mut inner, ConnectionState::Connecting, Some(server.id.clone()));
            (
                registration,
                server,
                inner.cycle,
                inner.session.smart_connect_enabled,
            )
        };

        log::info!(
            "━━━ CONNECT ({}, smart_connect={smart_connect}) ━━━",
            first.name
        );
        match Abortable::new(self.run_cycle(first, cycle, smart_connect), registration).await {
            Ok(result) => result,
            Err(Aborted) => {
                log::info!("[orchestrator] connect cycle {cycle} cancelled");
                Ok(self.state())
            }
        }
    }

    async fn run_cycle(
        &self,
        first: ServerConfig,
        cycle: u64,
        smart_connect: bool,
    ) -> Result<ConnectionState, ConnectError> {
        let mut tried = HashSet::new();
        let mut server = first;
        loop {
            tried.insert(server.id.clone());
            log::info!(
                "[orchestrator] attempt {} against {} ({})",
                tried.len(),
                server.name,
                server.endpoint()
            );
            let result = self.engine.start(EngineConfig::from(&server)).await;

            match self.settle_attempt(&server, result, cycle, smart_connect, &tried) {
                AttemptOutcome::Finished(result) => return result,
                AttemptOutcome::Retry(next) => server = next,
            }
        }
    }

    fn settle_attempt(
        &self,
        server: &ServerConfig,
        result: Result<EngineStarted, EngineError>,
        cycle: u64,
        smart_connect: bool,
        tried: &HashSet<String>,
    ) -> AttemptOutcome {
        let mut inner = self.inner.lock();
        if inner.cycle != cycle || inner.session.state != ConnectionState::Connecting {
            log::info!(
                "[orchestrator] discarding result for {} from superseded cycle {cycle}",
                server.name
            );
            return AttemptOutcome::Finished(Ok(inner.session.state));
        }

        let error = match result {
            Ok(started) => {
                inner.abort = None;
                inner.session.last_observed_ip = started.external_ip.clone();
                self.enter(&mut inner, ConnectionState::Connected, Some(server.id.clone()));
                if started.external_ip.is_some() {
                    self.events
                        .publish(ConnectionEvent::IpChanged(started.external_ip));
                }
                log::info!("[orchestrator] connected via {}", server.name);
                return AttemptOutcome::Finished(Ok(ConnectionState::Connected));
            }
            Err(error) => error,
        };

        log::warn!("[orchestrator] attempt against {} failed: {error}", server.name);
        self.events.publish(ConnectionEvent::AttemptFailed {
            server_id: server.id.clone(),
            reason: error.to_string(),
        });

        let next = if smart_connect {
            let candidates = self.store.list();
            self.policy.next(&candidates, tried).cloned()
        } else {
            None
        };

        match next {
            Some(next) => {
                log::info!("[orchestrator] failing over to {}", next.name);
                self.enter(&mut inner, ConnectionState::Connecting, Some(next.id.clone()));
                AttemptOutcome::Retry(next)
            }
            None => {
                inner.abort = None;
                inner.session.last_error = Some(error.to_string());
                self.enter(&mut inner, ConnectionState::Disconnected, None);
                AttemptOutcome::Finished(Err(ConnectError::EngineFailure(error)))
            }
        }
    }

    pub async fn disconnect(&self) -> ConnectionState {
        {
            let mut inner = self.inner.lock();
            match inner.session.state {
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                    log::info!(
                        "[orchestrator] disconnect ignored while {:?}",
                        inner.session.state
                    );
                    return inner.session.state;
                }
                ConnectionState::Connecting => {
                    if let Some(handle) = inner.abort.take() {
                        log::info!("[orchestrator] cancelling in-flight attempt");
                        handle.abort();
                    }
                }
                ConnectionState::Connected => {}
            }
            inner.cycle += 1;
            let target = inner.session.target_server_id.clone();
            self.enter(&mut inner, ConnectionState::Disconnecting, target);
        }

        log::info!("━━━ DISCONNECT ━━━");
        if let Err(error) = self.engine.stop().await {
            log::warn!("[orchestrator] teardown failure ignored: {error}");
        }

        let mut inner = self.inner.lock();
        inner.session.last_observed_ip = None;
        self.enter(&mut inner, ConnectionState::Disconnected, None);
        ConnectionState::Disconnected
    }

    /// Applies one event from the engine's status feed.
    pub fn observe(&self, status: EngineStatus) {
        let mut inner = self.inner.lock();
        if !inner.session.state.is_connected() {
            log::trace!(
                "[orchestrator] engine status {:?} ignored while {:?}",
                status.state,
                inner.session.state
            );
            return;
        }

        match status.state {
            EngineState::Running => {
                if status.external_ip.is_some()
                    && status.external_ip != inner.session.last_observed_ip
                {
                    log::info!("[orchestrator] external address {:?}", status.external_ip);
                    inner.session.last_observed_ip = status.external_ip.clone();
                    self.events
                        .publish(ConnectionEvent::IpChanged(status.external_ip));
                }
            }
            EngineState::Stopped => {
                let reason = status
                    .detail
                    .unwrap_or_else(|| "engine stopped unexpectedly".into());
                log::warn!("[orchestrator] tunnel dropped: {reason}");
                inner.cycle += 1;
                inner.session.last_error = Some(reason);
                inner.session.last_observed_ip = None;
                self.enter(&mut inner, ConnectionState::Disconnected, None);
            }
            EngineState::Failed => {
                log::warn!(
                    "[orchestrator] engine reported failure while connected: {}",
                    status.detail.as_deref().unwrap_or("no detail")
                );
            }
            EngineState::Starting => {}
        }
    }

    /// Drains the engine's status feed until the engine goes away.
    pub async fn watch_engine(&self) {
        let mut feed = self.engine.status();
        while let Some(status) = feed.next().await {
            self.observe(status);
        }
        log::debug!("[orchestrator] engine status feed closed");
    }

    fn enter(&self, inner: &mut Inner, state: ConnectionState, server_id: Option<String>) {
        log::info!(
            "[orchestrator] {:?} -> {:?} (server={:?})",
            inner.session.state,
            state,
            server_id
        );
        inner.session.state = state;
        inner.session.target_server_id = server_id.clone();
        self.events
            .publish(ConnectionEvent::StateChanged { state, server_id });
    }
}
