//! Global configuration store (C2): a single JSON document in the user's
//! application-data directory. Absence of `encrypted_master_key` is the
//! "first-run" state. Writes are whole-file rewrites via write-to-temp then
//! rename, the same discipline the teacher's `container::save_metadata`
//! uses for the vault file.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub encrypted_master_key: Option<String>,
    pub master_key_salt: Option<String>,
    pub master_key_nonce: Option<String>,
    pub master_key_hash: Option<String>,
    pub active_repository_id: Option<u64>,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

impl GlobalConfig {
    pub fn is_first_run(&self) -> bool {
        self.encrypted_master_key.is_none()
    }
}

/// `%APPDATA%/SecureVault` on Windows, `~/.securevault` elsewhere.
pub fn app_data_dir() -> Result<PathBuf> {
    let dir = if cfg!(target_os = "windows") {
        dirs::config_dir().map(|p| p.join("SecureVault"))
    } else {
        dirs::home_dir().map(|p| p.join(".securevault"))
    };
    dir.ok_or_else(|| crate::error::VaultError::IoFailure {
        reason: "could not determine application data directory".into(),
    })
}

pub fn config_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join("config.json"))
}

pub fn registry_db_path() -> Result<PathBuf> {
    Ok(app_data_dir()?.join("registry.db"))
}

pub fn load() -> Result<GlobalConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(GlobalConfig::default());
    }
    let text = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&text)?)
}

pub fn save(config: &GlobalConfig) -> Result<()> {
    let dir = app_data_dir()?;
    fs::create_dir_all(&dir)?;
    let path = dir.join("config.json");
    write_atomic(&path, serde_json::to_string_pretty(config)?.as_bytes())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_first_run() {
        assert!(GlobalConfig::default().is_first_run());
    }

    #[test]
    fn round_trips_through_json() {
        let mut cfg = GlobalConfig::default();
        cfg.encrypted_master_key = Some("ab".into());
        cfg.active_repository_id = Some(7);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: GlobalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.active_repository_id, Some(7));
        assert!(!back.is_first_run());
    }
}
