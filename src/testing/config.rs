//! Test scenario configuration types
//!
//! Defines the data structures for deserializing YAML test scenarios and
//! turning them into runnable [`Scenario`]s.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::assets::AssetRegistry;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::console::Pattern;
use crate::scenario::{Scenario, ScenarioStep};

/// A complete test scenario loaded from a YAML file
#[derive(Deserialize, Debug)]
pub struct ScenarioFile {
    /// Name of the test scenario
    pub name: String,
    /// Optional description of what the test verifies
    pub description: Option<String>,
    /// Assets declared by this file; they shadow the shared registry
    #[serde(default)]
    pub assets: AssetRegistry,
    /// The sequence of test steps to execute
    pub steps: Vec<StepConfig>,
}

/// A single test step in the execution flow
#[derive(Deserialize, Debug)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepConfig {
    /// Download and verify an asset
    FetchAsset {
        /// Registry name of the asset
        asset: String,
        /// Binding name; defaults to the asset name
        bind: Option<String>,
        /// Decompress a gzip/xz asset
        #[serde(default)]
        uncompress: bool,
    },
    /// Pull one file out of an archive asset
    ExtractMember {
        asset: String,
        /// Path inside the archive (e.g. "boot/vmlinux-4.5.0-2-4kc-malta")
        member: String,
        bind: String,
    },
    /// Boot the guest
    LaunchVm {
        /// Binding holding the kernel image
        kernel: Option<String>,
        /// Binding holding the initrd
        initrd: Option<String>,
        command_line: Option<String>,
        /// Do not prepend the common kernel command line
        #[serde(default)]
        raw_command_line: bool,
        /// Extra emulator arguments; `{binding}` and `{scratch}` expand
        #[serde(default)]
        args: Vec<String>,
    },
    /// Wait for console output
    WaitForPattern {
        pattern: String,
        /// Fail immediately if this appears first
        failure: Option<String>,
        /// Timeout in seconds (default: timeouts.console_wait_secs)
        timeout: Option<u64>,
    },
    /// Run a shell command on the console and wait for its output
    ExecAndWait {
        command: String,
        pattern: String,
        failure: Option<String>,
        timeout: Option<u64>,
    },
    /// Issue a shutdown command and wait for the emulator to exit
    ShutdownAndWait {
        command: String,
        /// Console line to see before waiting for the exit
        pattern: Option<String>,
        /// Timeout in seconds (default: timeouts.shutdown_secs)
        timeout: Option<u64>,
    },
}

impl ScenarioFile {
    /// Load a scenario file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read test scenario '{}': {}",
                path.display(),
                e
            ))
        })?;
        serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse test scenario: {}", e)))
    }

    /// Resolve asset names and default timeouts into a runnable scenario
    pub fn into_scenario(self, shared: &AssetRegistry, config: &Config) -> Result<Scenario> {
        let mut registry = shared.clone();
        registry.extend(&self.assets);

        let console_wait = Duration::from_secs(config.timeouts.console_wait_secs);
        let pattern = |text: String, failure: Option<String>, timeout: Option<u64>| {
            let mut p = Pattern::new(
                text,
                timeout.map(Duration::from_secs).unwrap_or(console_wait),
            );
            p.failure = failure;
            p
        };

        let mut scenario = Scenario::new(self.name);
        for step in self.steps {
            let step = match step {
                StepConfig::FetchAsset {
                    asset,
                    bind,
                    uncompress,
                } => ScenarioStep::FetchAsset {
                    asset: registry.get(&asset)?.clone(),
                    bind: bind.unwrap_or(asset),
                    uncompress,
                },
                StepConfig::ExtractMember {
                    asset,
                    member,
                    bind,
                } => ScenarioStep::ExtractMember {
                    asset: registry.get(&asset)?.clone(),
                    member,
                    bind,
                },
                StepConfig::LaunchVm {
                    kernel,
                    initrd,
                    command_line,
                    raw_command_line,
                    args,
                } => ScenarioStep::LaunchVm {
                    kernel,
                    initrd,
                    command_line,
                    raw_command_line,
                    args,
                },
                StepConfig::WaitForPattern {
                    pattern: text,
                    failure,
                    timeout,
                } => ScenarioStep::WaitForPattern {
                    pattern: pattern(text, failure, timeout),
                },
                StepConfig::ExecAndWait {
                    command,
                    pattern: text,
                    failure,
                    timeout,
                } => ScenarioStep::ExecAndWait {
                    command,
                    pattern: pattern(text, failure, timeout),
                },
                StepConfig::ShutdownAndWait {
                    command,
                    pattern: text,
                    timeout,
                } => {
                    let timeout = Duration::from_secs(timeout.unwrap_or(config.timeouts.shutdown_secs));
                    ScenarioStep::ShutdownAndWait {
                        command,
                        pattern: text.map(|t| Pattern::new(t, timeout)),
                        timeout,
                    }
                }
            };
            scenario.steps.push(step);
        }
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
name: malta cpio
assets:
  initrd:
    url: https://example.com/rootfs.cpio.gz
    sha256: dcfe3a7fe3200da3a00d176b95caaa086495eb158f2bff64afc67d7e1eb2cddc
steps:
  - action: fetch_asset
    asset: initrd
    uncompress: true
  - action: launch_vm
    initrd: initrd
    command_line: console=ttyS0
  - action: wait_for_pattern
    pattern: Boot successful.
    failure: Kernel panic - not syncing
  - action: exec_and_wait
    command: uname -a
    pattern: Debian
    timeout: 30
  - action: shutdown_and_wait
    command: reboot
    pattern: "reboot: Restarting system"
"#;

    #[test]
    fn test_parse_and_resolve() {
        let file: ScenarioFile = serde_yaml::from_str(SCENARIO).unwrap();
        assert_eq!(file.steps.len(), 5);

        let scenario = file
            .into_scenario(&AssetRegistry::new(), &Config::default())
            .unwrap();
        assert_eq!(scenario.name, "malta cpio");

        match &scenario.steps[0] {
            ScenarioStep::FetchAsset {
                bind, uncompress, ..
            } => {
                assert_eq!(bind, "initrd");
                assert!(uncompress);
            }
            other => panic!("unexpected step {other:?}"),
        }
        match &scenario.steps[2] {
            ScenarioStep::WaitForPattern { pattern } => {
                assert_eq!(pattern.failure.as_deref(), Some("Kernel panic - not syncing"));
                assert_eq!(pattern.timeout, Duration::from_secs(900));
            }
            other => panic!("unexpected step {other:?}"),
        }
        match &scenario.steps[3] {
            ScenarioStep::ExecAndWait { pattern, .. } => {
                assert_eq!(pattern.timeout, Duration::from_secs(30));
            }
            other => panic!("unexpected step {other:?}"),
        }
        match &scenario.steps[4] {
            ScenarioStep::ShutdownAndWait { timeout, pattern, .. } => {
                assert_eq!(*timeout, Duration::from_secs(120));
                assert!(pattern.is_some());
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_unknown_asset_is_config_error() {
        let file: ScenarioFile = serde_yaml::from_str(
            "name: x\nsteps:\n  - action: fetch_asset\n    asset: kernel\n",
        )
        .unwrap();
        assert!(matches!(
            file.into_scenario(&AssetRegistry::new(), &Config::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let parsed: std::result::Result<ScenarioFile, _> =
            serde_yaml::from_str("name: x\nsteps:\n  - action: evaluate\n");
        assert!(parsed.is_err());
    }
}
