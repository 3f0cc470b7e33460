use super::{ConfigError, Settings};
use std::path::Path;

pub const SETTINGS_PATH_ENV: &str = "AGENTFLOW_CONFIG";
pub const DEFAULT_SETTINGS_FILE_NAME: &str = "agentflow.yaml";

/// Read and validate settings; an invalid file is fatal at startup.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let settings = Settings::from_path(path)?;
    settings.validate()?;
    Ok(settings)
}

/// Settings path from `AGENTFLOW_CONFIG`, else `agentflow.yaml` in the working directory.
pub fn default_settings_path() -> std::path::PathBuf {
    std::env::var(SETTINGS_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from(DEFAULT_SETTINGS_FILE_NAME))
}
