use crate::domain::errors::PositionError;
use crate::domain::models::DeviceId;
use crate::domain::positioning::{AnchorPoint, AnchorTable};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

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
    "uwb_accessory_ranging".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Fixed position of one anchor accessory, in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorSetting {
    pub id: DeviceId,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Discovery & Connection
    #[serde(default = "default_eviction_timeout_ms")]
    pub eviction_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Connect automatically once this many devices are known. `None` disables.
    #[serde(default = "default_auto_connect_min_devices")]
    pub auto_connect_min_devices: Option<usize>,

    // Ranging
    #[serde(default = "default_location_stale_after_ms")]
    pub location_stale_after_ms: u64,
    /// Whether the host reports full direction vectors
    #[serde(default = "default_true")]
    pub direction_enabled: bool,
    /// Cap on session retries. `None` retries while the device stays known.
    #[serde(default)]
    pub retry_max_attempts: Option<u32>,

    // Positioning
    #[serde(default = "default_anchors")]
    pub anchors: Vec<AnchorSetting>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            eviction_timeout_ms: default_eviction_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            auto_connect_min_devices: default_auto_connect_min_devices(),
            location_stale_after_ms: default_location_stale_after_ms(),
            direction_enabled: default_true(),
            retry_max_attempts: None,
            anchors: default_anchors(),
        }
    }
}

impl Settings {
    /// Validated anchor map for the position engine.
    pub fn anchor_table(&self) -> Result<AnchorTable, PositionError> {
        AnchorTable::new(
            self.anchors
                .iter()
                .map(|anchor| (anchor.id, AnchorPoint { x: anchor.x, y: anchor.y })),
        )
    }
}

fn default_eviction_timeout_ms() -> u64 {
    5000
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_tick_interval_ms() -> u64 {
    200
}
fn default_auto_connect_min_devices() -> Option<usize> {
    Some(2)
}
fn default_location_stale_after_ms() -> u64 {
    3000
}
fn default_anchors() -> Vec<AnchorSetting> {
    vec![
        AnchorSetting {
            id: DeviceId(112_456_485),
            x: 0.0,
            y: 0.0,
        },
        AnchorSetting {
            id: DeviceId(143_285_168),
            x: 2.5,
            y: 0.0,
        },
    ]
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("UwbAccessoryRanging");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
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

}
