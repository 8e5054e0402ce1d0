use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "toolBLEx";
const SETTINGS_FILE: &str = "settings.json";
const DATABASE_FILE: &str = "devices.jsonl";

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
    "toolblex".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Passive sniffing hardware (Ubertooth One).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnifferSettings {
    #[serde(default = "default_false")]
    pub enabled: bool,
    #[serde(default = "default_sniffer_command")]
    pub command: String,
    #[serde(default = "default_sniffer_args")]
    pub args: Vec<String>,
}

impl Default for SnifferSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_sniffer_command(),
            args: default_sniffer_args(),
        }
    }
}

fn default_sniffer_command() -> String {
    "ubertooth-btle".to_string()
}
fn default_sniffer_args() -> Vec<String> {
    vec!["-n".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Preferred adapter id; the first listed adapter is used otherwise.
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default = "default_false")]
    pub scan_auto: bool,
    /// `None` scans until stopped.
    #[serde(default)]
    pub scan_duration_secs: Option<u64>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_service_discovery_timeout_ms")]
    pub service_discovery_timeout_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_persistence_debounce_ms")]
    pub persistence_debounce_ms: u64,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub vendor_table_path: Option<String>,
    #[serde(default)]
    pub sniffer: SnifferSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            adapter: None,
            scan_auto: false,
            scan_duration_secs: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            service_discovery_timeout_ms: default_service_discovery_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            persistence_debounce_ms: default_persistence_debounce_ms(),
            database_path: None,
            vendor_table_path: None,
            sniffer: SnifferSettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn scan_duration(&self) -> Option<Duration> {
        self.scan_duration_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn service_discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.service_discovery_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn persistence_debounce(&self) -> Duration {
        Duration::from_millis(self.persistence_debounce_ms)
    }

    /// Device history file; defaults to the user data directory.
    pub fn database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => PathBuf::from(path),
            None => dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(APP_DIR)
                .join(DATABASE_FILE),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_disconnect_timeout_ms() -> u64 {
    3_000
}
fn default_service_discovery_timeout_ms() -> u64 {
    15_000
}
fn default_stop_timeout_ms() -> u64 {
    2_000
}
fn default_persistence_debounce_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::at(settings_path))
    }

    /// Settings stored at an explicit path. Missing or invalid files yield defaults.
    pub fn at(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push(APP_DIR);
        fs::create_dir_all(&path)?;
        path.push(SETTINGS_FILE);
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
}
