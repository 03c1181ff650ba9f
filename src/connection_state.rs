use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting…",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting…",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Disconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        state: ConnectionState,
        server_id: Option<String>,
    },
    AttemptFailed {
        server_id: String,
        reason: String,
    },
    IpChanged(Option<String>),
}

/// Orchestrator-owned view of the current session. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSession {
    pub state: ConnectionState,
    pub target_server_id: Option<String>,
    pub smart_connect_enabled: bool,
    pub last_observed_ip: Option<String>,
    pub last_error: Option<String>,
}

impl ConnectionSession {
    pub fn new(smart_connect_enabled: bool) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            target_server_id: None,
            smart_connect_enabled,
            last_observed_ip: None,
            last_error: None,
        }
    }
}
