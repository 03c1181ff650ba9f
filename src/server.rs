use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VLESS: &str = "vless";
pub const DEFAULT_TRANSPORT: &str = "tcp";
pub const DEFAULT_FLAG: &str = "🌐";

/// Security layer requested by a descriptor. Values other than the three known
/// modes are carried through verbatim for the engine to interpret.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
    Other(String),
}

impl Security {
    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Tls => "tls",
            Self::Reality => "reality",
            Self::Other(value) => value,
        }
    }

    pub fn is_reality(&self) -> bool {
        matches!(self, Self::Reality)
    }
}

impl From<String> for Security {
    fn from(value: String) -> Self {
        match value.as_str() {
            "none" => Self::None,
            "tls" => Self::Tls,
            "reality" => Self::Reality,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Security {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Security> for String {
    fn from(security: Security) -> Self {
        security.as_str().to_string()
    }
}

impl fmt::Display for Security {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SecurityParams {
    #[serde(default)]
    pub sni: String,
    #[serde(default = "default_fingerprint")]
    pub fingerprint: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub peer: String,
    #[serde(default)]
    pub flow: String,
    #[serde(default = "default_encryption")]
    pub encryption: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(default = "default_path")]
    pub spider_x: String,
}

pub(crate) fn default_fingerprint() -> String {
    "chrome".into()
}

pub(crate) fn default_path() -> String {
    "/".into()
}

pub(crate) fn default_encryption() -> String {
    "none".into()
}

impl Default for SecurityParams {
    fn default() -> Self {
        Self {
            sni: String::new(),
            fingerprint: default_fingerprint(),
            path: default_path(),
            peer: String::new(),
            flow: String::new(),
            encryption: default_encryption(),
            public_key: String::new(),
            short_id: String::new(),
            spider_x: default_path(),
        }
    }
}

/// A stored server descriptor. Never mutated after creation; edits happen by
/// replacing the whole entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user_id: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub security_params: SecurityParams,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub country_name: String,
    #[serde(default = "default_flag")]
    pub flag: String,
    pub added_at: DateTime<Utc>,
}

fn default_protocol() -> String {
    PROTOCOL_VLESS.into()
}

fn default_transport() -> String {
    DEFAULT_TRANSPORT.into()
}

fn default_flag() -> String {
    DEFAULT_FLAG.into()
}

impl ServerConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn label(&self) -> String {
        if self.country_name.is_empty() {
            format!("{} {}", self.flag, self.name)
        } else {
            format!("{} {} ({})", self.flag, self.name, self.country_name)
        }
    }
}
