use serde::Serialize;

use crate::server::{Security, SecurityParams, ServerConfig};

pub const SOCKS_LISTEN_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_SOCKS_PORT: u16 = 10808;

/// What the engine receives for one attempt. Field names mirror
/// [`ServerConfig`] one to one.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user_id: String,
    pub transport: String,
    pub security: Security,
    pub security_params: SecurityParams,
}

impl From<&ServerConfig> for EngineConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            name: server.name.clone(),
            address: server.address.clone(),
            port: server.port,
            user_id: server.user_id.clone(),
            transport: server.transport.clone(),
            security: server.security.clone(),
            security_params: server.security_params.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RenderOptions {
    pub log_level: String,
    pub socks_port: u16,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            log_level: "warning".into(),
            socks_port: DEFAULT_SOCKS_PORT,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct XrayConfiguration {
    pub log: LogConfiguration,
    pub inbounds: Vec<InboundConfiguration>,
    pub outbounds: Vec<OutboundConfiguration>,
}

#[derive(Serialize, Debug)]
pub struct LogConfiguration {
    pub loglevel: String,
}

#[derive(Serialize, Debug)]
pub struct InboundConfiguration {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: SocksSettings,
    pub sniffing: SniffingConfiguration,
}

#[derive(Serialize, Debug)]
pub struct SocksSettings {
    pub auth: String,
    pub udp: bool,
}

#[derive(Serialize, Debug)]
pub struct SniffingConfiguration {
    pub enabled: bool,
    #[serde(rename = "destOverride")]
    pub destination_override: Vec<String>,
}

#[derive(Serialize, Debug)]
pub struct OutboundConfiguration {
    pub tag: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<VlessSettings>,
    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

#[derive(Serialize, Debug)]
pub struct VlessSettings {
    pub vnext: Vec<VnextServer>,
}

#[derive(Serialize, Debug)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VlessUser>,
}

#[derive(Serialize, Debug)]
pub struct VlessUser {
    pub id: String,
    pub encryption: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub flow: String,
}

#[derive(Serialize, Debug)]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(rename = "tlsSettings", skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSettings>,
    #[serde(rename = "realitySettings", skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealitySettings>,
    #[serde(rename = "wsSettings", skip_serializing_if = "Option::is_none")]
    pub websocket: Option<WebSocketSettings>,
    #[serde(rename = "grpcSettings", skip_serializing_if = "Option::is_none")]
    pub grpc: Option<GrpcSettings>,
}

#[derive(Serialize, Debug)]
pub struct TlsSettings {
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub fingerprint: String,
}

#[derive(Serialize, Debug)]
pub struct RealitySettings {
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub fingerprint: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "shortId")]
    pub short_id: String,
    #[serde(rename = "spiderX")]
    pub spider_x: String,
}

#[derive(Serialize, Debug)]
pub struct WebSocketSettings {
    pub path: String,
    pub headers: WebSocketHeaders,
}

#[derive(Serialize, Debug)]
pub struct WebSocketHeaders {
    #[serde(rename = "Host", skip_serializing_if = "String::is_empty")]
    pub host: String,
}

#[derive(Serialize, Debug)]
pub struct GrpcSettings {
    #[serde(rename = "serviceName")]
    pub service_name: String,
}

impl EngineConfig {
    /// SNI, then the legacy `peer` name, then the endpoint address.
    pub fn server_name(&self) -> &str {
        let params = &self.security_params;
        if !params.sni.is_empty() {
            &params.sni
        } else if !params.peer.is_empty() {
            &params.peer
        } else {
            &self.address
        }
    }

    pub fn render(&self, options: &RenderOptions) -> XrayConfiguration {
        let params = &self.security_params;
        log::debug!(
            "[configuration] address={}:{}, transport={}, security={}, sni={}, flow={}",
            self.address,
            self.port,
            self.transport,
            self.security,
            params.sni,
            params.flow,
        );

        let tls = matches!(self.security, Security::Tls).then(|| TlsSettings {
            server_name: self.server_name().to_string(),
            fingerprint: params.fingerprint.clone(),
        });
        let reality = self.security.is_reality().then(|| RealitySettings {
            server_name: self.server_name().to_string(),
            fingerprint: params.fingerprint.clone(),
            public_key: params.public_key.clone(),
            short_id: params.short_id.clone(),
            spider_x: params.spider_x.clone(),
        });
        let websocket = (self.transport == "ws").then(|| WebSocketSettings {
            path: params.path.clone(),
            headers: WebSocketHeaders {
                host: params.sni.clone(),
            },
        });
        let grpc = (self.transport == "grpc").then(|| GrpcSettings {
            service_name: params.path.trim_start_matches('/').to_string(),
        });

        XrayConfiguration {
            log: LogConfiguration {
                loglevel: options.log_level.clone(),
            },
            inbounds: vec![InboundConfiguration {
                tag: "socks-in".into(),
                listen: SOCKS_LISTEN_ADDRESS.into(),
                port: options.socks_port,
                protocol: "socks".into(),
                settings: SocksSettings {
                    auth: "noauth".into(),
                    udp: true,
                },
                sniffing: SniffingConfiguration {
                    enabled: true,
                    destination_override: vec!["http".into(), "tls".into()],
                },
            }],
            outbounds: vec![
                OutboundConfiguration {
                    tag: "proxy".into(),
                    protocol: "vless".into(),
                    settings: Some(VlessSettings {
                        vnext: vec![VnextServer {
                            address: self.address.clone(),
                            port: self.port,
                            users: vec![VlessUser {
                                id: self.user_id.clone(),
                                encryption: params.encryption.clone(),
                                flow: params.flow.clone(),
                            }],
                        }],
                    }),
                    stream_settings: Some(StreamSettings {
                        network: self.transport.clone(),
                        security: self.security.to_string(),
                        tls,
                        reality,
                        websocket,
                        grpc,
                    }),
                },
                OutboundConfiguration {
                    tag: "direct".into(),
                    protocol: "freedom".into(),
                    settings: None,
                    stream_settings: None,
                },
            ],
        }
    }

    pub fn to_xray_json(&self, options: &RenderOptions) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.render(options))
    }
}

pub fn redact_user_id(rendered: &str, user_id: &str) -> String {
    if user_id.is_empty() {
        return rendered.to_string();
    }
    rendered.replace(user_id, &"*".repeat(user_id.chars().count()))
}
