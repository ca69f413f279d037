//! Error types for the functional-test harness
//!
//! Error messages are meant to let a reader tell a hung boot from a
//! wrong-output boot from an infrastructure failure at a glance, so
//! console-related variants carry the tail of the console buffer.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Asset Errors ===
    #[error("Network error fetching {url} after {attempts} attempt(s): {message}")]
    Network {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("Checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Asset {checksum} is not cached and downloads are disabled (source: {url})")]
    DownloadDisabled { url: String, checksum: String },

    #[error("Invalid checksum '{0}': expected 64 (SHA-256) or 128 (SHA-512) hex characters")]
    InvalidChecksum(String),

    #[error("Asset cache error: {0}")]
    Cache(String),

    // === Archive Errors ===
    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Member '{member}' not found in {archive}")]
    MemberNotFound { archive: String, member: String },

    // === Console Errors ===
    #[error("Timed out after {timeout:?} waiting for console pattern '{pattern}'\n--- console tail ---\n{tail}")]
    ConsoleTimeout {
        pattern: String,
        timeout: std::time::Duration,
        tail: String,
    },

    #[error("Failure pattern '{pattern}' observed on console\n--- console tail ---\n{tail}")]
    ConsoleFailurePattern { pattern: String, tail: String },

    #[error("Console closed while waiting for '{pattern}'\n--- console tail ---\n{tail}")]
    ConsoleClosed { pattern: String, tail: String },

    // === Process Errors ===
    #[error("Failed to launch VM: {0}")]
    ProcessLaunch(String),

    #[error("VM process exited unexpectedly ({})\n--- console tail ---\n{tail}", describe_exit(.code))]
    UnexpectedProcessExit { code: Option<i32>, tail: String },

    #[error("VM process did not exit within {0:?} after shutdown")]
    ShutdownTimeout(std::time::Duration),

    // === Scenario Errors ===
    #[error("Cannot {action} while {state}")]
    InvalidState { action: String, state: String },

    #[error("Unknown binding '{0}': no earlier step produced it")]
    UnknownBinding(String),

    #[error("{failed} of {total} scenario(s) failed")]
    ScenariosFailed { failed: usize, total: usize },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "killed by signal or status unavailable".to_string(),
    }
}

impl Error {
    /// Create an invalid state error
    pub fn invalid_state(action: &str, state: &str) -> Self {
        Self::InvalidState {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Create a member not found error
    pub fn member_not_found(archive: &std::path::Path, member: &str) -> Self {
        Self::MemberNotFound {
            archive: archive.display().to_string(),
            member: member.to_string(),
        }
    }

    /// Console output captured with the error, if any
    pub fn console_tail(&self) -> Option<&str> {
        match self {
            Self::ConsoleTimeout { tail, .. }
            | Self::ConsoleFailurePattern { tail, .. }
            | Self::ConsoleClosed { tail, .. }
            | Self::UnexpectedProcessExit { tail, .. } => Some(tail),
            _ => None,
        }
    }

    /// Coarse failure category, used by reports to separate infrastructure
    /// problems from guest misbehavior
    pub fn category(&self) -> &'static str {
        match self {
            Self::Network { .. } | Self::DownloadDisabled { .. } => "network",
            Self::ChecksumMismatch { .. } | Self::InvalidChecksum(_) | Self::Cache(_) => {
                "integrity"
            }
            Self::UnsupportedFormat(_) | Self::MemberNotFound { .. } => "archive",
            Self::ConsoleTimeout { .. }
            | Self::ConsoleFailurePattern { .. }
            | Self::ConsoleClosed { .. } => "console",
            Self::ProcessLaunch(_)
            | Self::UnexpectedProcessExit { .. }
            | Self::ShutdownTimeout(_) => "process",
            Self::ScenariosFailed { .. } => "scenario",
            Self::InvalidState { .. }
            | Self::UnknownBinding(_)
            | Self::Config(_)
            | Self::ConfigParse(_)
            | Self::FileRead { .. } => "config",
            Self::Io(_) | Self::Internal(_) => "internal",
        }
    }
}
