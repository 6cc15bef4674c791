pub mod config_cmd;
pub mod context;
pub mod exec;
pub mod tools;

use helloagents_config::{AppConfig, ConfigError};
use std::path::{Path, PathBuf};

/// Load `path` (or the default location) and apply `HELLOAGENTS_*` overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => AppConfig::load(),
    }
}

pub fn config_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}
