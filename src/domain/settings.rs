use crate::domain::models::DeviceHandle;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
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
            console_logging_enabled: default_true(),
            file_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
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
    "servo_mask_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// A previously authorized peripheral, remembered across runs so a
/// reconnect watcher can be armed for it on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownDevice {
    pub address: u64,
    pub name: String,
}

impl From<&DeviceHandle> for KnownDevice {
    fn from(handle: &DeviceHandle) -> Self {
        Self {
            address: handle.address,
            name: handle.name.clone(),
        }
    }
}

impl KnownDevice {
    pub fn to_handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.address, self.name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default)]
    pub known_devices: Vec<KnownDevice>,
    #[serde(default)]
    pub last_connected_address: Option<u64>,

    // Advanced BLE settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_characteristic_uuid")]
    pub ble_characteristic_uuid: String,

    /// Ask the rig for its pose table as part of connecting.
    #[serde(default = "default_true")]
    pub request_config_on_connect: bool,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            known_devices: Vec::new(),
            last_connected_address: None,
            ble_service_uuid: default_service_uuid(),
            ble_characteristic_uuid: default_characteristic_uuid(),
            request_config_on_connect: default_true(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_service_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::SERVICE_UUID.to_string()
}
fn default_characteristic_uuid() -> String {
    crate::infrastructure::bluetooth::protocol::CHARACTERISTIC_UUID.to_string()
}

pub struct SettingsService {
    settings: LinkSettings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::with_path(Self::default_settings_path()?))
    }

    /// Use an explicit settings file instead of the platform config dir.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn default_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ServoMaskLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<LinkSettings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut LinkSettings {
        &mut self.settings
    }

    /// Record a device as authorized and mark it most recently used.
    pub fn remember_device(&mut self, handle: &DeviceHandle) -> anyhow::Result<()> {
        if !self
            .settings
            .known_devices
            .iter()
            .any(|d| d.address == handle.address)
        {
            self.settings.known_devices.push(KnownDevice::from(handle));
        }
        self.settings.last_connected_address = Some(handle.address);
        self.save()
    }

    pub fn known_handles(&self) -> Vec<DeviceHandle> {
        self.settings
            .known_devices
            .iter()
            .map(KnownDevice::to_handle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_device_is_idempotent() {
        let dir = std::env::temp_dir().join("servo_mask_link_settings_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        let _ = fs::remove_file(&path);

        let mut service = SettingsService::with_path(path.clone());
        let handle = DeviceHandle::new(0xAA_BB_CC_DD_EE_FF, "Servo Mask");
        service.remember_device(&handle).unwrap();
        service.remember_device(&handle).unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().known_devices.len(), 1);
        assert_eq!(
            reloaded.get().last_connected_address,
            Some(0xAA_BB_CC_DD_EE_FF)
        );
    }

    #[test]
    fn missing_file_yields_defaults() {
        let service =
            SettingsService::with_path(PathBuf::from("/nonexistent/servo_mask/settings.json"));
        assert!(service.get().known_devices.is_empty());
        assert!(service.get().request_config_on_connect);
    }
}
