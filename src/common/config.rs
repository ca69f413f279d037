//! Configuration file handling

use serde::Deserialize;
use std::path::PathBuf;

use super::paths::{self, config_path};
use super::Result;

/// Environment variable that overrides the cache root
pub const CACHE_DIR_ENV: &str = "FUNCTEST_CACHE_DIR";

/// Environment variable that forbids network downloads when set
pub const NO_DOWNLOAD_ENV: &str = "FUNCTEST_NO_DOWNLOAD";

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Asset cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Console settings
    #[serde(default)]
    pub console: ConsoleConfig,

    /// Emulator settings
    #[serde(default)]
    pub vm: VmConfig,

    /// Guest kernel defaults
    #[serde(default)]
    pub kernel: KernelConfig,
}

/// Asset cache settings
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Cache root; defaults to the platform cache directory
    pub dir: Option<PathBuf>,

    /// Extra download attempts after a transient failure
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Initial retry backoff, doubled after each attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Whether cache misses may go to the network
    #[serde(default = "default_true")]
    pub allow_download: bool,

    /// Re-hash files found on disk before trusting them
    #[serde(default = "default_true")]
    pub verify_cached: bool,

    /// Show a progress bar while downloading
    #[serde(default = "default_true")]
    pub progress: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            allow_download: true,
            verify_cached: true,
            progress: true,
        }
    }
}

fn default_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

/// Timeout settings in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Default deadline for a console pattern wait
    #[serde(default = "default_console_wait")]
    pub console_wait_secs: u64,

    /// Default deadline for the VM to exit after a shutdown command
    #[serde(default = "default_shutdown")]
    pub shutdown_secs: u64,

    /// Overall deadline for a single download attempt
    #[serde(default = "default_download")]
    pub download_secs: u64,

    /// TCP connect timeout for downloads
    #[serde(default = "default_connect")]
    pub connect_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            console_wait_secs: default_console_wait(),
            shutdown_secs: default_shutdown(),
            download_secs: default_download(),
            connect_secs: default_connect(),
        }
    }
}

fn default_console_wait() -> u64 {
    900
}
fn default_shutdown() -> u64 {
    120
}
fn default_download() -> u64 {
    1800
}
fn default_connect() -> u64 {
    30
}

/// Console buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConsoleConfig {
    /// Ceiling for buffered console output, oldest bytes are dropped first
    #[serde(default = "default_max_buffer_kb")]
    pub max_buffer_kb: usize,

    /// Bytes of console output attached to failures
    #[serde(default = "default_tail_bytes")]
    pub tail_bytes: usize,

    /// Terminator appended to every command line
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,

    /// Directory receiving raw console logs, one file per scenario
    pub log_dir: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            max_buffer_kb: default_max_buffer_kb(),
            tail_bytes: default_tail_bytes(),
            line_terminator: default_line_terminator(),
            log_dir: None,
        }
    }
}

fn default_max_buffer_kb() -> usize {
    1024
}
fn default_tail_bytes() -> usize {
    2048
}
fn default_line_terminator() -> String {
    "\r".to_string()
}

/// Emulator binary configuration
#[derive(Debug, Deserialize, Clone)]
pub struct VmConfig {
    /// Emulator executable, absolute or looked up on PATH
    #[serde(default = "default_vm_binary")]
    pub binary: String,

    /// Arguments passed before the per-scenario ones
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            binary: default_vm_binary(),
            args: Vec::new(),
        }
    }
}

fn default_vm_binary() -> String {
    "qemu-system-mips".to_string()
}

/// Guest kernel defaults
#[derive(Debug, Deserialize, Clone)]
pub struct KernelConfig {
    /// Prefix for every kernel command line
    #[serde(default = "default_common_command_line")]
    pub common_command_line: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            common_command_line: default_common_command_line(),
        }
    }
}

fn default_common_command_line() -> String {
    "printk.time=0 ".to_string()
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Apply environment overrides on top of file settings
    pub fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if std::env::var_os(NO_DOWNLOAD_ENV).is_some() {
            self.cache.allow_download = false;
        }
    }

    /// Resolved cache root
    pub fn cache_dir(&self) -> Result<PathBuf> {
        self.cache
            .dir
            .clone()
            .or_else(paths::cache_dir)
            .ok_or_else(|| super::Error::Config("Cannot determine a cache directory".to_string()))
    }

    /// Resolve the emulator binary, searching PATH for bare names
    pub fn vm_binary(&self) -> Result<PathBuf> {
        let binary = PathBuf::from(&self.vm.binary);
        if binary.components().count() > 1 {
            return Ok(binary);
        }
        which::which(&self.vm.binary).map_err(|_| {
            super::Error::Config(format!("Emulator '{}' not found on PATH", self.vm.binary))
        })
    }
}
