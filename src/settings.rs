use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    engine::{RenderOptions, config::DEFAULT_SOCKS_PORT},
    error::StorageError,
};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_smart_connect")]
    pub smart_connect: bool,
    #[serde(default)]
    pub engine_binary: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_smart_connect() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_log_level() -> String {
    "warning".into()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            smart_connect: true,
            engine_binary: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            socks_port: DEFAULT_SOCKS_PORT,
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    pub fn configuration_directory() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vless-client")
    }

    pub fn settings_file_path() -> PathBuf {
        Self::configuration_directory().join("settings.toml")
    }

    pub fn load() -> Self {
        Self::load_from(&Self::settings_file_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    log::info!("[settings] loaded from {}", path.display());
                    settings
                }
                Err(error) => {
                    log::warn!("[settings] failed to parse {}: {error}", path.display());
                    Self::default()
                }
            },
            Err(_) => {
                log::info!(
                    "[settings] no settings file at {}, using defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), StorageError> {
        self.save_to(&Self::settings_file_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent()
            && let Err(error) = std::fs::create_dir_all(parent)
        {
            log::warn!(
                "[settings] failed to create settings directory {}: {error}",
                parent.display()
            );
        }
        let content = toml::to_string_pretty(self)
            .map_err(|error| StorageError::Encode(error.to_string()))?;
        std::fs::write(path, content).map_err(|error| StorageError::Write {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
        log::info!("[settings] saved to {}", path.display());
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            log_level: self.log_level.clone(),
            socks_port: self.socks_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("vless-client-settings-{}-{name}", std::process::id()))
            .join("settings.toml")
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings: Settings = toml::from_str("socks_port = 1080").unwrap();
        assert_eq!(settings.socks_port, 1080);
        assert!(settings.smart_connect);
        assert_eq!(settings.connect_timeout_secs, 15);
        assert_eq!(settings.log_level, "warning");
        assert_eq!(settings.engine_binary, None);
    }

    #[test]
    fn missing_or_broken_file_falls_back_to_defaults() {
        let path = scratch_path("missing");
        assert_eq!(Settings::load_from(&path), Settings::default());

        let path = scratch_path("broken");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "smart_connect = [").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn save_then_load_keeps_values() {
        let path = scratch_path("saved");
        let settings = Settings {
            smart_connect: false,
            engine_binary: Some("/opt/xray/xray".into()),
            connect_timeout_secs: 30,
            ..Settings::default()
        };
        settings.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path), settings);
        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let settings = Settings {
            connect_timeout_secs: 0,
            ..Settings::default()
        };
        assert_eq!(settings.connect_timeout(), Duration::from_secs(1));
    }
}
