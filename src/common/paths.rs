//! Platform directories for configuration and the asset cache

use std::io;
use std::path::PathBuf;

/// Name used for per-user directories
const APP_NAME: &str = "functest";

/// Get the configuration directory path
///
/// Uses the directories crate for platform-appropriate locations:
/// - Linux: `~/.config/functest/`
/// - macOS: `~/Library/Application Support/functest/`
/// - Windows: `%APPDATA%\functest\`
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the default asset cache root
///
/// - Linux: `~/.cache/functest/`
/// - macOS: `~/Library/Caches/functest/`
pub fn cache_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.cache_dir().to_path_buf())
}

/// Ensure a directory exists, creating parents as needed
pub fn ensure_dir(dir: &std::path::Path) -> io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}
