use crate::domain::identifier::{CharacteristicId, ServiceId};
use crate::error::GattError;
use crate::infrastructure::bluetooth::protocol::{
    DEFAULT_CHARACTERISTIC_UUID, DEFAULT_OPERATION_TIMEOUT, DEFAULT_READ_TEXT,
    DEFAULT_SCAN_TIMEOUT, DEFAULT_SERVICE_UUID,
};
use crate::infrastructure::radio::AdvertiseMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
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
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
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
    "ble_gatt_sample".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // GATT table shared by both roles
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: String,

    // Peripheral role
    #[serde(default = "default_read_text")]
    pub read_text: String,
    #[serde(default)]
    pub advertise_mode: AdvertiseMode,

    // Central role
    #[serde(default = "default_write_text")]
    pub write_text: String,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub dedupe_scan_results: bool,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            read_text: default_read_text(),
            advertise_mode: AdvertiseMode::default(),
            write_text: default_write_text(),
            scan_timeout_ms: default_scan_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            dedupe_scan_results: true,
            log_settings: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Parse the configured identifiers; fails before any radio work
    pub fn identifiers(&self) -> Result<(ServiceId, CharacteristicId), GattError> {
        let service = ServiceId::parse(&self.service_uuid)?;
        let characteristic = CharacteristicId::parse(&self.characteristic_uuid)?;
        Ok((service, characteristic))
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_service_uuid() -> String {
    DEFAULT_SERVICE_UUID.to_string()
}
fn default_characteristic_uuid() -> String {
    DEFAULT_CHARACTERISTIC_UUID.to_string()
}
fn default_read_text() -> String {
    DEFAULT_READ_TEXT.to_string()
}
fn default_write_text() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}
fn default_scan_timeout_ms() -> u64 {
    DEFAULT_SCAN_TIMEOUT.as_millis() as u64
}
fn default_operation_timeout_ms() -> u64 {
    DEFAULT_OPERATION_TIMEOUT.as_millis() as u64
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file; missing or malformed files yield defaults
    pub fn with_path(settings_path: impl Into<PathBuf>) -> Self {
        let settings_path = settings_path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleGattSample");
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
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
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

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn update_read_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.settings.read_text = text.to_string();
        self.save()
    }
}
