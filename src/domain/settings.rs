use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "smartwatch_sync".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Peripheral profile and session tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub command_char_uuid: String,
    #[serde(default = "default_notification_uuid")]
    pub notification_char_uuid: String,
    #[serde(default = "default_requested_mtu")]
    pub requested_mtu: u16,
    #[serde(default = "default_origin")]
    pub origin: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Bound for the notification channel; `None` keeps it unbounded.
    #[serde(default)]
    pub notification_capacity: Option<usize>,
}

impl BleSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            command_char_uuid: default_command_uuid(),
            notification_char_uuid: default_notification_uuid(),
            requested_mtu: default_requested_mtu(),
            origin: default_origin(),
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            notification_capacity: None,
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_command_uuid() -> String {
    protocol::MESSAGE_WRITE_UUID.to_string()
}
fn default_notification_uuid() -> String {
    protocol::NOTIFICATION_UUID.to_string()
}
fn default_requested_mtu() -> u16 {
    protocol::REQUESTED_MTU
}
fn default_origin() -> u32 {
    protocol::HOST_ORIGIN
}
fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_discovery_timeout_ms() -> u64 {
    10_000
}
fn default_init_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Peripheral Settings
    #[serde(default)]
    pub ble: BleSettings,

    // Data plane
    #[serde(default = "default_data_plane_name")]
    pub data_plane_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble: BleSettings::default(),
            data_plane_name: default_data_plane_name(),
        }
    }
}

fn default_data_plane_name() -> String {
    "smartwatch-sync.data-plane".to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit path, falling back to defaults if it is missing or invalid.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("SmartwatchSync");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "ble": { "requested_mtu": 247 } }"#).unwrap();
        assert_eq!(settings.ble.requested_mtu, 247);
        assert_eq!(settings.ble.origin, 3_387_062);
        assert_eq!(settings.ble.notification_capacity, None);
        assert_eq!(settings.log_settings.level, "info");
        assert_eq!(settings.data_plane_name, "smartwatch-sync.data-plane");
    }

    #[test]
    fn test_ble_defaults_match_profile() {
        let ble = BleSettings::default();
        assert_eq!(ble.service_uuid, "98200001-2160-4474-82b4-1a25cef92156");
        assert_eq!(ble.command_char_uuid, protocol::MESSAGE_WRITE_UUID);
        assert_eq!(ble.notification_char_uuid, protocol::NOTIFICATION_UUID);
        assert_eq!(ble.requested_mtu, 517);
        assert_eq!(ble.origin, protocol::HOST_ORIGIN);
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!(
            "smartwatch_sync_settings_{}.json",
            std::process::id()
        ));
        let mut service = SettingsService::from_path(path.clone());
        service.get_mut().ble.notification_capacity = Some(64);
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().ble.notification_capacity, Some(64));
        let _ = fs::remove_file(path);
    }
}
