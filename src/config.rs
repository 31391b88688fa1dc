//! Per-device configuration and on-disk layout.
//!
//! `config.json` lives next to the database in the data directory and holds
//! the settings that belong to this machine rather than to the shared
//! business data: device identity, printer, paper width, UI sizing and the
//! cloud endpoint. Secrets go to the OS keyring (see [`crate::storage`]).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{PosError, PosResult};

/// Env var overriding the data directory.
pub const DATA_DIR_ENV: &str = "BUFFET_POS_DATA_DIR";

const APP_DIR_NAME: &str = "BuffetApp";
const CONFIG_FILE_NAME: &str = "config.json";

// ---------------------------------------------------------------------------
// Directory layout
// ---------------------------------------------------------------------------

/// Resolve the per-user data directory.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

pub fn backup_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("backup")
}

/// Where tickets and reports are saved when no printer is reachable.
pub fn tickets_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("tickets")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

// ---------------------------------------------------------------------------
// Device config
// ---------------------------------------------------------------------------

fn default_paper_width() -> u16 {
    80
}
fn default_button_width() -> u32 {
    20
}
fn default_button_height() -> u32 {
    2
}
fn default_button_color() -> String {
    "#f0f0f0".into()
}
fn default_button_font() -> String {
    "Arial".into()
}
fn default_language() -> String {
    "es".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    /// Receipt printer as `host:port`. `None` saves tickets to files.
    #[serde(default)]
    pub printer: Option<String>,
    #[serde(default = "default_paper_width")]
    pub paper_width_mm: u16,
    #[serde(default = "default_button_width")]
    pub ancho_boton: u32,
    #[serde(default = "default_button_height")]
    pub alto_boton: u32,
    #[serde(default = "default_button_color")]
    pub color_boton: String,
    #[serde(default = "default_button_font")]
    pub fuente_boton: String,
    #[serde(default = "default_language")]
    pub lenguaje: String,
    #[serde(default)]
    pub supabase_url: Option<String>,
    /// Keys written by other tools are kept on save.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            device_name: String::new(),
            printer: None,
            paper_width_mm: default_paper_width(),
            ancho_boton: default_button_width(),
            alto_boton: default_button_height(),
            color_boton: default_button_color(),
            fuente_boton: default_button_font(),
            lenguaje: default_language(),
            supabase_url: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl DeviceConfig {
    /// Load from `path`. A missing file yields defaults; a corrupt one is
    /// logged and replaced by defaults.
    pub fn load(path: &Path) -> PosResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(cfg) => Ok(cfg),
            Err(e) => {
                warn!(path = %path.display(), "config.json unreadable, using defaults: {e}");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> PosResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load the config for `data_dir`, filling in and persisting the device
    /// identity when it is missing.
    pub fn load_or_init(data_dir: &Path) -> PosResult<Self> {
        let path = config_path(data_dir);
        let mut cfg = Self::load(&path)?;
        let mut changed = false;

        if cfg.device_id.trim().is_empty() {
            cfg.device_id = Uuid::new_v4().to_string();
            changed = true;
        }
        if cfg.device_name.trim().is_empty() {
            cfg.device_name = local_hostname();
            changed = true;
        }
        if changed {
            cfg.save(&path)?;
            info!(device_id = %cfg.device_id, "Device identity initialized");
        }
        Ok(cfg)
    }

    /// Update a single setting by its JSON key.
    pub fn set(&mut self, key: &str, value: &str) -> PosResult<()> {
        let value = value.trim();
        let optional = |v: &str| (!v.is_empty()).then(|| v.to_string());
        match key {
            "device_name" => {
                if value.is_empty() {
                    return Err(PosError::validation("device_name cannot be empty"));
                }
                self.device_name = value.to_string();
            }
            "device_id" => {
                Uuid::parse_str(value)
                    .map_err(|e| PosError::validation(format!("device_id: {e}")))?;
                self.device_id = value.to_string();
            }
            "printer" => self.printer = optional(value),
            "paper_width_mm" => {
                let mm: u16 = value
                    .parse()
                    .map_err(|_| PosError::validation("paper_width_mm must be 58 or 80"))?;
                if mm != 58 && mm != 80 {
                    return Err(PosError::validation("paper_width_mm must be 58 or 80"));
                }
                self.paper_width_mm = mm;
            }
            "ancho_boton" => self.ancho_boton = parse_positive(key, value)?,
            "alto_boton" => self.alto_boton = parse_positive(key, value)?,
            "color_boton" => self.color_boton = value.to_string(),
            "fuente_boton" => self.fuente_boton = value.to_string(),
            "lenguaje" => self.lenguaje = value.to_string(),
            "supabase_url" => self.supabase_url = optional(value),
            other => return Err(PosError::Config(format!("unknown setting '{other}'"))),
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> PosResult<u32> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(PosError::validation(format!("{key} must be a positive integer"))),
    }
}

/// Best-effort host name of this machine.
pub fn local_hostname() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "pos".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DeviceConfig::load(&config_path(dir.path())).unwrap();
        assert_eq!(cfg.ancho_boton, 20);
        assert_eq!(cfg.alto_boton, 2);
        assert_eq!(cfg.lenguaje, "es");
        assert_eq!(cfg.paper_width_mm, 80);
        assert!(cfg.printer.is_none());
    }

    #[test]
    fn test_load_or_init_persists_identity() {
        let dir = tempfile::tempdir().unwrap();
        let first = DeviceConfig::load_or_init(dir.path()).unwrap();
        assert!(Uuid::parse_str(&first.device_id).is_ok());
        assert!(!first.device_name.is_empty());

        let second = DeviceConfig::load_or_init(dir.path()).unwrap();
        assert_eq!(first.device_id, second.device_id);
    }

    #[test]
    fn test_unknown_keys_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(dir.path());
        std::fs::write(&path, r#"{"device_id":"x","tema":"oscuro","ancho_boton":30}"#).unwrap();

        let mut cfg = DeviceConfig::load(&path).unwrap();
        assert_eq!(cfg.ancho_boton, 30);
        cfg.set("printer", "192.168.0.50:9100").unwrap();
        cfg.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["tema"], "oscuro");
        assert_eq!(raw["printer"], "192.168.0.50:9100");
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(dir.path());
        std::fs::write(&path, "{ not json").unwrap();
        let cfg = DeviceConfig::load(&path).unwrap();
        assert_eq!(cfg, DeviceConfig::default());
    }

    #[test]
    fn test_set_validates_values() {
        let mut cfg = DeviceConfig::default();
        assert!(cfg.set("paper_width_mm", "72").is_err());
        assert!(cfg.set("ancho_boton", "0").is_err());
        assert!(cfg.set("device_name", "  ").is_err());
        assert!(cfg.set("no_such_key", "1").is_err());
        cfg.set("paper_width_mm", "58").unwrap();
        cfg.set("printer", "").unwrap();
        assert_eq!(cfg.paper_width_mm, 58);
        assert!(cfg.printer.is_none());
    }

    #[test]
    #[serial]
    fn test_data_dir_env_override() {
        std::env::set_var(DATA_DIR_ENV, "/tmp/buffet-test-data");
        assert_eq!(data_dir(), PathBuf::from("/tmp/buffet-test-data"));
        std::env::remove_var(DATA_DIR_ENV);
        assert!(data_dir().ends_with(APP_DIR_NAME));
    }
}
